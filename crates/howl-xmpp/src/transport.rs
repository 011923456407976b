//! Byte transport under an XMPP session.
//!
//! Wraps a plain socket that can be upgraded in place to TLS (as server or
//! client), optionally switched to zlib compression, and read through a
//! token-bucket rate limiter.

use std::time::Duration;

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::ProtocolVersion;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, instrument};

use crate::XmppError;

/// Anything the transport can run over: TCP sockets, TLS streams, or
/// in-memory duplex pipes in tests.
pub trait Socket: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static> Socket for T {}

type BoxSocket = Box<dyn Socket>;

const READ_CHUNK: usize = 4096;

/// Channel-binding material for SCRAM `-PLUS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelBinding {
    /// RFC 5056 channel-binding type name.
    pub mechanism: &'static str,
    pub data: Vec<u8>,
}

/// Token bucket limiting read throughput in bytes per second.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last: Instant,
}

impl RateLimiter {
    /// `rate` tokens refill per second; the bucket holds one second of
    /// tokens plus `burst`.
    pub fn new(rate: u32, burst: u32) -> Self {
        let capacity = f64::from(rate) + f64::from(burst);
        Self {
            rate: f64::from(rate),
            capacity,
            tokens: capacity,
            last: Instant::now(),
        }
    }

    /// Take `n` tokens if available.
    pub fn allow(&mut self, n: usize) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);

        let n = n as f64;
        if n > self.tokens {
            return false;
        }
        self.tokens -= n;
        true
    }
}

struct Compressor {
    deflate: Compress,
    inflate: Decompress,
}

impl Compressor {
    fn new() -> Self {
        Self {
            deflate: Compress::new(Compression::default(), true),
            inflate: Decompress::new(true),
        }
    }

    fn compress(&mut self, input: &[u8]) -> Result<Vec<u8>, XmppError> {
        let mut out = Vec::with_capacity(input.len() / 2 + 64);
        let mut offset = 0;
        loop {
            if out.capacity() - out.len() < 64 {
                out.reserve(input.len() + 64);
            }
            let (in_before, out_before) = (self.deflate.total_in(), self.deflate.total_out());
            self.deflate
                .compress_vec(&input[offset..], &mut out, FlushCompress::Sync)
                .map_err(|e| XmppError::internal(format!("deflate failed: {e}")))?;
            let consumed = (self.deflate.total_in() - in_before) as usize;
            let produced = (self.deflate.total_out() - out_before) as usize;
            offset += consumed;

            // A sync flush is complete once output stops filling the buffer.
            if offset >= input.len() && out.len() < out.capacity() {
                break;
            }
            if consumed == 0 && produced == 0 {
                break;
            }
        }
        Ok(out)
    }

    fn decompress(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<(), XmppError> {
        let mut offset = 0;
        loop {
            if out.capacity() - out.len() < READ_CHUNK {
                out.reserve(READ_CHUNK * 2);
            }
            let (in_before, out_before) = (self.inflate.total_in(), self.inflate.total_out());
            self.inflate
                .decompress_vec(&input[offset..], out, FlushDecompress::Sync)
                .map_err(|e| XmppError::xml_parse(format!("inflate failed: {e}")))?;
            let consumed = (self.inflate.total_in() - in_before) as usize;
            let produced = (self.inflate.total_out() - out_before) as usize;
            offset += consumed;
            if consumed == 0 && produced == 0 {
                break;
            }
        }
        Ok(())
    }
}

#[derive(Default)]
enum TransportInner {
    #[default]
    None,
    Plain(BoxSocket),
    ServerTls(Box<tokio_rustls::server::TlsStream<BoxSocket>>),
    ClientTls(Box<tokio_rustls::client::TlsStream<BoxSocket>>),
}

/// Duplex byte stream with TLS upgrade, compression and read limiting.
pub struct Transport {
    inner: TransportInner,
    rate_limiter: Option<RateLimiter>,
    compressor: Option<Compressor>,
    write_timeout: Option<Duration>,
    write_buf: Vec<u8>,
    read_buf: Box<[u8]>,
}

impl Transport {
    /// Wrap a plain socket.
    pub fn new(socket: impl Socket) -> Self {
        Self::with_inner(TransportInner::Plain(Box::new(socket)))
    }

    fn with_inner(inner: TransportInner) -> Self {
        Self {
            inner,
            rate_limiter: None,
            compressor: None,
            write_timeout: None,
            write_buf: Vec::with_capacity(1024),
            read_buf: vec![0u8; READ_CHUNK].into_boxed_slice(),
        }
    }

    /// Limit reads to `rate` bytes per second. Zero disables limiting.
    pub fn with_rate_limit(mut self, rate: u32, burst: u32) -> Self {
        self.rate_limiter = (rate > 0).then(|| RateLimiter::new(rate, burst));
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// Accept a direct TLS connection (XEP-0368) on a fresh socket.
    pub async fn accept_tls(socket: impl Socket, acceptor: &TlsAcceptor) -> Result<Self, XmppError> {
        let mut transport = Self::new(socket);
        transport.start_tls_server(acceptor).await?;
        Ok(transport)
    }

    /// Open a direct TLS connection (XEP-0368) on a fresh socket.
    pub async fn connect_tls(
        socket: impl Socket,
        connector: &TlsConnector,
        domain: &str,
    ) -> Result<Self, XmppError> {
        let mut transport = Self::new(socket);
        transport.start_tls_client(connector, domain).await?;
        Ok(transport)
    }

    pub fn is_secured(&self) -> bool {
        matches!(
            self.inner,
            TransportInner::ServerTls(_) | TransportInner::ClientTls(_)
        )
    }

    pub fn is_compressed(&self) -> bool {
        self.compressor.is_some()
    }

    /// Read the next chunk, appending decoded bytes to `out`.
    ///
    /// Returns the number of raw bytes read; zero means end of stream.
    pub async fn read(&mut self, out: &mut Vec<u8>) -> Result<usize, XmppError> {
        let n = match &mut self.inner {
            TransportInner::None => return Err(XmppError::internal("Transport not initialized")),
            TransportInner::Plain(s) => s.read(&mut self.read_buf).await?,
            TransportInner::ServerTls(s) => s.read(&mut self.read_buf).await?,
            TransportInner::ClientTls(s) => s.read(&mut self.read_buf).await?,
        };
        if n == 0 {
            return Ok(0);
        }
        if let Some(limiter) = &mut self.rate_limiter {
            if !limiter.allow(n) {
                return Err(XmppError::ReadLimitExceeded);
            }
        }
        match &mut self.compressor {
            Some(compressor) => compressor.decompress(&self.read_buf[..n], out)?,
            None => out.extend_from_slice(&self.read_buf[..n]),
        }
        Ok(n)
    }

    /// Buffer bytes for the next flush.
    pub fn write(&mut self, data: &[u8]) {
        self.write_buf.extend_from_slice(data);
    }

    /// Write all buffered bytes to the socket.
    pub async fn flush(&mut self) -> Result<(), XmppError> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.write_buf);
        let data = match &mut self.compressor {
            Some(compressor) => compressor.compress(&pending)?,
            None => pending,
        };
        match self.write_timeout {
            Some(limit) => tokio::time::timeout(limit, self.write_raw(&data))
                .await
                .map_err(|_| XmppError::Timeout)?,
            None => self.write_raw(&data).await,
        }
    }

    async fn write_raw(&mut self, data: &[u8]) -> Result<(), XmppError> {
        match &mut self.inner {
            TransportInner::None => return Err(XmppError::internal("Transport not initialized")),
            TransportInner::Plain(s) => {
                s.write_all(data).await?;
                s.flush().await?;
            }
            TransportInner::ServerTls(s) => {
                s.write_all(data).await?;
                s.flush().await?;
            }
            TransportInner::ClientTls(s) => {
                s.write_all(data).await?;
                s.flush().await?;
            }
        }
        Ok(())
    }

    /// Upgrade the plain socket to TLS in place, acting as server.
    #[instrument(skip(self, acceptor), name = "xmpp.transport.start_tls_server")]
    pub async fn start_tls_server(&mut self, acceptor: &TlsAcceptor) -> Result<(), XmppError> {
        let socket = self.take_plain()?;
        let tls = acceptor.accept(socket).await?;
        self.inner = TransportInner::ServerTls(Box::new(tls));
        debug!("TLS established (server)");
        Ok(())
    }

    /// Upgrade the plain socket to TLS in place, acting as client.
    #[instrument(skip(self, connector), name = "xmpp.transport.start_tls_client")]
    pub async fn start_tls_client(
        &mut self,
        connector: &TlsConnector,
        domain: &str,
    ) -> Result<(), XmppError> {
        let server_name = ServerName::try_from(domain.to_string())
            .map_err(|e| XmppError::config(format!("Invalid server name '{domain}': {e}")))?;
        let socket = self.take_plain()?;
        let tls = connector.connect(server_name, socket).await?;
        self.inner = TransportInner::ClientTls(Box::new(tls));
        debug!("TLS established (client)");
        Ok(())
    }

    fn take_plain(&mut self) -> Result<BoxSocket, XmppError> {
        match std::mem::take(&mut self.inner) {
            TransportInner::Plain(socket) => Ok(socket),
            other => {
                self.inner = other;
                Err(XmppError::internal("Transport already secured"))
            }
        }
    }

    /// Switch to zlib compression. Not reversible.
    pub fn enable_compression(&mut self) {
        if self.compressor.is_none() {
            self.compressor = Some(Compressor::new());
        }
    }

    /// Channel-binding data, available only on TLS 1.2 connections.
    ///
    /// rustls does not expose the Finished message needed for `tls-unique`,
    /// so the RFC 5705 exporter is used under the `tls-exporter` name.
    pub fn channel_binding(&self) -> Option<ChannelBinding> {
        const LABEL: &[u8] = b"EXPORTER-Channel-Binding";
        let (version, exported) = match &self.inner {
            TransportInner::ServerTls(s) => {
                let conn = s.get_ref().1;
                (
                    conn.protocol_version(),
                    conn.export_keying_material([0u8; 32], LABEL, None),
                )
            }
            TransportInner::ClientTls(s) => {
                let conn = s.get_ref().1;
                (
                    conn.protocol_version(),
                    conn.export_keying_material([0u8; 32], LABEL, None),
                )
            }
            _ => return None,
        };
        if version != Some(ProtocolVersion::TLSv1_2) {
            return None;
        }
        Some(ChannelBinding {
            mechanism: "tls-exporter",
            data: exported.ok()?.to_vec(),
        })
    }

    /// Certificates presented by the peer during the TLS handshake.
    pub fn peer_certificates(&self) -> Option<Vec<CertificateDer<'static>>> {
        let certs = match &self.inner {
            TransportInner::ServerTls(s) => s.get_ref().1.peer_certificates(),
            TransportInner::ClientTls(s) => s.get_ref().1.peer_certificates(),
            _ => None,
        }?;
        Some(certs.to_vec())
    }

    /// Shut down the write side.
    pub async fn shutdown(&mut self) -> Result<(), XmppError> {
        match &mut self.inner {
            TransportInner::None => {}
            TransportInner::Plain(s) => s.shutdown().await?,
            TransportInner::ServerTls(s) => s.shutdown().await?,
            TransportInner::ClientTls(s) => s.shutdown().await?,
        }
        Ok(())
    }
}
