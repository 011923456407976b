//! Test utilities for end-to-end server tests.
//!
//! Provides helpers for starting a server node on ephemeral ports,
//! generating TLS certificates and driving raw XMPP client connections.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::prelude::*;
use howl_xmpp::cluster::{Kv, MemoryKv};
use howl_xmpp::hook::Hooks;
use howl_xmpp::module::Modules;
use howl_xmpp::repository::{MemoryUserRepository, User, UserRepository};
use howl_xmpp::server::{ClusterConfig, HostConfig};
use howl_xmpp::{ServerDeps, XmppServer, XmppServerConfig};
use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub const TEST_DOMAIN: &str = "localhost";

/// Install the ring crypto provider for rustls.
/// Must be called once before any TLS operations.
pub fn install_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Route server logs to the test output.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "howl_xmpp=debug".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Self-signed certificate written to a temporary directory.
pub struct TestTlsCredentials {
    pub dir: TempDir,
    pub cert_der: CertificateDer<'static>,
}

impl TestTlsCredentials {
    pub fn generate(domain: &str) -> Self {
        let CertifiedKey { cert, key_pair } =
            generate_simple_self_signed(vec![domain.to_string()]).expect("Failed to generate test certificate");
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        std::fs::write(dir.path().join("cert.pem"), cert.pem()).unwrap();
        std::fs::write(dir.path().join("key.pem"), key_pair.serialize_pem()).unwrap();
        Self {
            dir,
            cert_der: CertificateDer::from(cert.der().to_vec()),
        }
    }

    pub fn host_config(&self, domain: &str) -> HostConfig {
        HostConfig {
            domain: domain.to_string(),
            cert_path: Some(self.dir.path().join("cert.pem")),
            key_path: Some(self.dir.path().join("key.pem")),
        }
    }

    /// A TLS connector that trusts this certificate.
    pub fn tls_connector(&self) -> TlsConnector {
        let mut roots = RootCertStore::empty();
        roots.add(self.cert_der.clone()).expect("Failed to add cert");
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }
}

/// A server node listening on ephemeral ports.
pub struct TestServer {
    pub c2s_addr: SocketAddr,
    pub component_addr: Option<SocketAddr>,
    pub tls: TestTlsCredentials,
    pub users: Arc<MemoryUserRepository>,
    pub kv: Arc<MemoryKv>,
    pub shutdown: CancellationToken,
    pub task: JoinHandle<Result<(), howl_xmpp::XmppError>>,
    pub router: Arc<howl_xmpp::router::Router>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    /// Start a server, letting the caller adjust the configuration.
    pub async fn start_with(configure: impl FnOnce(&mut XmppServerConfig)) -> Self {
        install_crypto_provider();
        init_tracing();

        let tls = TestTlsCredentials::generate(TEST_DOMAIN);
        let mut config = XmppServerConfig {
            hosts: vec![tls.host_config(TEST_DOMAIN)],
            c2s_addr: "127.0.0.1:0".parse().unwrap(),
            cluster: ClusterConfig {
                instance_id: "test-node".to_string(),
                ..ClusterConfig::default()
            },
            ..XmppServerConfig::default()
        };
        configure(&mut config);

        let users = Arc::new(MemoryUserRepository::new());
        users
            .upsert_user(&User::with_password("ortuman", "1234", 4096))
            .await
            .unwrap();
        users
            .upsert_user(&User::with_password("noelia", "5678", 4096))
            .await
            .unwrap();

        let kv = Arc::new(MemoryKv::new());
        let shutdown = CancellationToken::new();
        let server = XmppServer::start(
            config,
            ServerDeps {
                users: users.clone(),
                kv: kv.clone() as Arc<dyn Kv>,
                roots: RootCertStore::empty(),
                modules: Modules::with_defaults("howl", "0.1.0"),
                hooks: Arc::new(Hooks::new()),
                queue_transfer: None,
            },
            shutdown.clone(),
        )
        .await
        .expect("Failed to start test server");

        let c2s_addr = server.c2s_addr();
        let component_addr = server.component_addr();
        let router = server.router().clone();
        let task = tokio::spawn(server.run());
        Self {
            c2s_addr,
            component_addr,
            tls,
            users,
            kv,
            shutdown,
            task,
            router,
        }
    }

    /// Cancel the node and wait for its graceful stop.
    pub async fn stop(self) {
        self.shutdown.cancel();
        timeout(Duration::from_secs(10), self.task)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// Raw XMPP client.
pub struct TestClient {
    stream: Box<dyn Io>,
    buffer: Vec<u8>,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr)
            .await
            .expect("Failed to connect to test server");
        Self {
            stream: Box::new(stream),
            buffer: Vec::new(),
        }
    }

    pub async fn send(&mut self, data: &str) {
        self.stream.write_all(data.as_bytes()).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    /// Read until `pattern` shows up; the buffer is consumed up to the end
    /// of the match and the consumed text is returned.
    ///
    /// Attribute quotes are normalized to `'` before matching.
    pub async fn read_until(&mut self, pattern: &str) -> String {
        let deadline = tokio::time::Instant::now() + DEFAULT_TIMEOUT;
        loop {
            let data = String::from_utf8_lossy(&self.buffer).replace('"', "'");
            if let Some(pos) = data.find(pattern) {
                let end = pos + pattern.len();
                self.buffer.drain(..end);
                return data[..end].to_string();
            }
            let mut buf = [0u8; 4096];
            let n = tokio::time::timeout_at(deadline, self.stream.read(&mut buf))
                .await
                .unwrap_or_else(|_| panic!("timeout waiting for {pattern}, got: {data}"))
                .unwrap();
            assert!(n > 0, "connection closed waiting for {pattern}, got: {data}");
            self.buffer.extend_from_slice(&buf[..n]);
        }
    }

    /// Wait for the server to close the connection.
    pub async fn expect_closed(&mut self) -> String {
        let mut rest = String::from_utf8_lossy(&self.buffer).replace('"', "'");
        self.buffer.clear();
        let mut buf = [0u8; 4096];
        loop {
            let n = timeout(DEFAULT_TIMEOUT, self.stream.read(&mut buf))
                .await
                .expect("connection was not closed")
                .unwrap_or(0);
            if n == 0 {
                return rest;
            }
            rest.push_str(&String::from_utf8_lossy(&buf[..n]).replace('"', "'"));
        }
    }

    pub async fn open_stream(&mut self) -> String {
        self.send(&format!(
            "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams' to='{TEST_DOMAIN}' version='1.0'>"
        ))
        .await;
        self.read_until("</features>").await
    }

    /// STARTTLS and reopen the stream.
    pub async fn starttls(mut self, connector: &TlsConnector) -> (Self, String) {
        self.send("<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>").await;
        self.read_until("<proceed").await;
        self.read_until("/>").await;
        let domain = ServerName::try_from(TEST_DOMAIN.to_string()).unwrap();
        let tls = connector.connect(domain, self.stream).await.expect("TLS handshake failed");
        let mut client = Self {
            stream: Box::new(tls),
            buffer: Vec::new(),
        };
        let features = client.open_stream().await;
        (client, features)
    }

    pub async fn auth_plain(&mut self, username: &str, password: &str) -> String {
        let payload = BASE64_STANDARD.encode(format!("\0{username}\0{password}"));
        self.send(&format!(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{payload}</auth>"
        ))
        .await;
        self.read_until("/>").await
    }

    pub async fn bind(&mut self, resource: &str) -> String {
        self.send(&format!(
            "<iq type='set' id='bind_1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
             <resource>{resource}</resource></bind></iq>"
        ))
        .await;
        self.read_until("</iq>").await
    }

    /// Connect, secure, authenticate and bind.
    pub async fn login(server: &TestServer, username: &str, password: &str, resource: &str) -> Self {
        let mut client = Self::connect(server.c2s_addr).await;
        client.open_stream().await;
        let (mut client, _) = client.starttls(&server.tls.tls_connector()).await;
        let success = client.auth_plain(username, password).await;
        assert!(success.contains("<success"), "auth failed: {success}");
        client.open_stream().await;
        let bound = client.bind(resource).await;
        assert!(bound.contains("type='result'"), "bind failed: {bound}");
        client
    }
}
