//! Outgoing S2S connections.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use rustls::RootCertStore;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::{debug, info_span, instrument, Instrument};

use super::dialback::DialbackVerifier;
use super::dns::{ResolvedTarget, SrvResolver};
use super::out_stream::{verify_dialback_key, OutStream, OutStreamFactory, S2sOutStream};
use super::{S2sConfig, S2sError};
use crate::cluster::Kv;
use crate::hook::Hooks;
use crate::hosts::Hosts;
use crate::metrics;
use crate::session::{Session, SessionConfig, SessionKind};
use crate::tls;
use crate::transport::Transport;
use crate::XmppError;

/// Everything an out-stream task needs after it was dialed.
pub(crate) struct DialContext {
    pub(crate) config: S2sConfig,
    pub(crate) hosts: Arc<Hosts>,
    pub(crate) kv: Option<Arc<dyn Kv>>,
    pub(crate) hooks: Arc<Hooks>,
    roots: Arc<RootCertStore>,
}

impl DialContext {
    pub(crate) fn new(
        config: S2sConfig,
        hosts: Arc<Hosts>,
        roots: RootCertStore,
        kv: Option<Arc<dyn Kv>>,
        hooks: Arc<Hooks>,
    ) -> Self {
        Self {
            config,
            hosts,
            kv,
            hooks,
            roots: Arc::new(roots),
        }
    }

    /// TLS connector presenting `sender`'s certificate, if we have one.
    pub(crate) fn connector(&self, sender: &str) -> Result<TlsConnector, XmppError> {
        let config = tls::client_config((*self.roots).clone(), self.hosts.certificate(sender))?;
        Ok(TlsConnector::from(Arc::new(config)))
    }
}

/// Dials remote servers: SRV discovery, TCP connect, optional direct TLS.
#[derive(Clone)]
pub struct S2sDialer {
    ctx: Arc<DialContext>,
    resolver: SrvResolver,
    static_routes: Arc<HashMap<String, SocketAddr>>,
}

impl S2sDialer {
    pub fn new(
        config: S2sConfig,
        hosts: Arc<Hosts>,
        roots: RootCertStore,
        kv: Option<Arc<dyn Kv>>,
        hooks: Arc<Hooks>,
    ) -> Self {
        Self {
            ctx: Arc::new(DialContext::new(config, hosts, roots, kv, hooks)),
            resolver: SrvResolver::new(),
            static_routes: Arc::new(HashMap::new()),
        }
    }

    /// Reach `domain` at a fixed address instead of resolving it.
    pub fn with_static_routes(mut self, routes: HashMap<String, SocketAddr>) -> Self {
        self.static_routes = Arc::new(routes);
        self
    }

    async fn targets(&self, target: &str) -> Result<Vec<ResolvedTarget>, S2sError> {
        if let Some(addr) = self.static_routes.get(target) {
            return Ok(vec![ResolvedTarget::new(
                addr.ip().to_string(),
                addr.port(),
                0,
                0,
                false,
            )]);
        }
        Ok(self.resolver.resolve_xmpp_server(target).await?)
    }

    /// Connect to the first reachable server of `target`.
    #[instrument(skip(self), name = "xmpp.s2s.connect")]
    async fn connect(&self, sender: &str, target: &str) -> Result<Transport, S2sError> {
        let mut last_error = S2sError::Unreachable(target.to_string());
        for resolved in self.targets(target).await? {
            let addrs = match self
                .resolver
                .resolve_host_to_addrs(&resolved.host, resolved.port)
                .await
            {
                Ok(addrs) => addrs,
                Err(err) => {
                    debug!(host = %resolved.host, error = %err, "Skipping target");
                    last_error = err.into();
                    continue;
                }
            };
            for addr in addrs {
                metrics::record_s2s_connection_attempt(resolved.direct_tls);
                let socket = match tokio::time::timeout(
                    self.ctx.config.dial_timeout,
                    TcpStream::connect(addr),
                )
                .await
                {
                    Ok(Ok(socket)) => socket,
                    Ok(Err(err)) => {
                        debug!(%addr, error = %err, "Connect failed");
                        last_error = S2sError::Unreachable(target.to_string());
                        continue;
                    }
                    Err(_) => {
                        debug!(%addr, "Connect timed out");
                        last_error = S2sError::Timeout(target.to_string());
                        continue;
                    }
                };
                if !resolved.direct_tls {
                    debug!(%addr, "Connected");
                    return Ok(Transport::new(socket));
                }
                let connector = self.ctx.connector(sender)?;
                match Transport::connect_tls(socket, &connector, target).await {
                    Ok(transport) => {
                        debug!(%addr, "Connected with direct TLS");
                        return Ok(transport);
                    }
                    Err(err) => {
                        debug!(%addr, error = %err, "Direct TLS handshake failed");
                        last_error = err.into();
                    }
                }
            }
        }
        Err(last_error)
    }

    fn session(&self, transport: Transport) -> Session {
        Session::new(
            transport,
            self.ctx.hosts.clone(),
            SessionConfig {
                kind: SessionKind::S2s,
                incoming: false,
                max_stanza_size: self.ctx.config.max_stanza_size,
                log_stanzas: self.ctx.config.log_stanzas,
            },
        )
    }
}

#[async_trait]
impl OutStreamFactory for S2sDialer {
    async fn dial(&self, sender: &str, target: &str) -> Result<Arc<dyn OutStream>, S2sError> {
        let transport = self.connect(sender, target).await?;
        let session = self.session(transport);
        Ok(Arc::new(S2sOutStream::new(
            sender,
            target,
            session,
            self.ctx.clone(),
        )))
    }
}

#[async_trait]
impl DialbackVerifier for S2sDialer {
    async fn verify(
        &self,
        local: &str,
        remote: &str,
        stream_id: &str,
        key: &str,
    ) -> Result<bool, S2sError> {
        let dialer = self.clone();
        let (local, remote) = (local.to_string(), remote.to_string());
        let (stream_id, key) = (stream_id.to_string(), key.to_string());

        let span = info_span!("xmpp.s2s.dialback", local = %local, remote = %remote);
        let task = AbortOnDrop(tokio::spawn(
            async move {
                let transport = dialer.connect(&local, &remote).await?;
                let session = dialer.session(transport);
                verify_dialback_key(session, dialer.ctx, local, remote, stream_id, key).await
            }
            .instrument(span),
        ));
        task.join().await
    }
}

/// Aborts the task when the awaiting caller goes away.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> AbortOnDrop<Result<T, S2sError>> {
    async fn join(mut self) -> Result<T, S2sError> {
        match (&mut self.0).await {
            Ok(result) => result,
            Err(err) => Err(XmppError::internal(format!("dialback verification aborted: {err}")).into()),
        }
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use super::*;

    /// A dialer whose only route leads to a listener that never answers.
    async fn silent_peer(request_timeout: Duration) -> (S2sDialer, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = S2sConfig {
            dialback_secret: "s3cr3t".to_string(),
            request_timeout,
            ..Default::default()
        };
        let dialer = S2sDialer::new(
            config,
            Arc::new(Hosts::new("jackal.im")),
            RootCertStore::empty(),
            None,
            Arc::new(Hooks::new()),
        )
        .with_static_routes(HashMap::from([(
            "jabber.org".to_string(),
            listener.local_addr().unwrap(),
        )]));
        (dialer, listener)
    }

    /// Everything written on the accepted connection until it is closed.
    async fn read_until_closed(listener: TcpListener) -> String {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut out = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), socket.read_to_end(&mut out))
            .await
            .expect("verify connection was left open")
            .unwrap();
        String::from_utf8_lossy(&out).to_string()
    }

    #[tokio::test]
    async fn test_verify_deadline_closes_stream() {
        let (dialer, listener) = silent_peer(Duration::from_millis(100)).await;
        let peer = tokio::spawn(read_until_closed(listener));

        let result = dialer.verify("jackal.im", "jabber.org", "abc", "key").await;
        assert!(matches!(result, Err(S2sError::Timeout(_))), "{result:?}");

        let written = peer.await.unwrap();
        assert!(written.contains("<stream:stream"));
        assert!(written.ends_with("</stream:stream>"));
    }

    #[tokio::test]
    async fn test_abandoned_verify_drops_connection() {
        let (dialer, listener) = silent_peer(Duration::from_secs(60)).await;
        let peer = tokio::spawn(read_until_closed(listener));

        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            dialer.verify("jackal.im", "jabber.org", "abc", "key"),
        )
        .await;
        assert!(abandoned.is_err());

        let written = peer.await.unwrap();
        assert!(written.contains("<stream:stream"));
        assert!(!written.contains("</stream:stream>"));
    }
}
