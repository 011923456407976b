//! Outgoing S2S streams.
//!
//! An out-stream carries stanzas from one local domain (`sender`) to one
//! remote domain (`target`). Negotiation runs inside the stream task:
//!
//! ```text
//! Connecting -> Connected -> Securing -> Connecting -> Connected
//!     -> Authenticating (SASL EXTERNAL) | VerifyingDialback -> Authenticated
//! ```
//!
//! Elements submitted before the stream is authenticated are held in a
//! FIFO and written, in submission order, once it is.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use minidom::Element;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, info_span, instrument, warn, Instrument};

use super::dialback::{self, DialbackResult};
use super::dialer::DialContext;
use super::{dialback_req_key, S2sError};
use crate::error::{StreamError, StreamErrorCondition};
use crate::hook::{self, HookInfo};
use crate::mailbox::{Mailbox, StreamCommand, StreamHandle, MAILBOX_CAPACITY};
use crate::parser::ns;
use crate::session::{Received, Session};
use crate::XmppError;

/// A stream towards a remote domain.
#[async_trait]
pub trait OutStream: Send + Sync {
    fn sender(&self) -> &str;

    fn target(&self) -> &str;

    /// Submission side of the stream.
    fn handle(&self) -> &StreamHandle;

    /// Spawn the negotiation and I/O task. Called at most once.
    async fn start(&self) -> Result<(), S2sError>;
}

/// Opens out-streams.
#[async_trait]
pub trait OutStreamFactory: Send + Sync {
    /// Connect to `target` on behalf of `sender`. The stream is returned
    /// unstarted.
    async fn dial(&self, sender: &str, target: &str) -> Result<Arc<dyn OutStream>, S2sError>;
}

/// Negotiation state of an out-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutState {
    /// Waiting for the peer's header.
    Connecting,
    /// Waiting for the peer's features.
    Connected,
    /// STARTTLS requested.
    Securing,
    /// SASL EXTERNAL requested.
    Authenticating,
    /// `<db:result>` sent.
    VerifyingDialback,
    Authenticated,
}

type Flushed = Option<oneshot::Sender<Result<(), XmppError>>>;

/// TCP out-stream established by [`S2sDialer`](super::S2sDialer).
pub struct S2sOutStream {
    sender: String,
    target: String,
    handle: StreamHandle,
    pending_start: Mutex<Option<(Session, Mailbox)>>,
    ctx: Arc<DialContext>,
}

impl S2sOutStream {
    pub(crate) fn new(
        sender: &str,
        target: &str,
        session: Session,
        ctx: Arc<DialContext>,
    ) -> Self {
        let (handle, mailbox) = StreamHandle::channel(MAILBOX_CAPACITY);
        Self {
            sender: sender.to_string(),
            target: target.to_string(),
            handle,
            pending_start: Mutex::new(Some((session, mailbox))),
            ctx,
        }
    }
}

#[async_trait]
impl OutStream for S2sOutStream {
    fn sender(&self) -> &str {
        &self.sender
    }

    fn target(&self) -> &str {
        &self.target
    }

    fn handle(&self) -> &StreamHandle {
        &self.handle
    }

    async fn start(&self) -> Result<(), S2sError> {
        let Some((session, mailbox)) = self.pending_start.lock().await.take() else {
            return Err(XmppError::internal("out-stream already started").into());
        };
        let task = OutStreamTask {
            session,
            mailbox,
            sender: self.sender.clone(),
            target: self.target.clone(),
            ctx: self.ctx.clone(),
            state: OutState::Connecting,
            sasl_done: false,
            pending: VecDeque::new(),
            dialback_record: None,
        };
        let span = info_span!(
            "xmpp.s2s.out",
            stream = %self.handle.id(),
            sender = %self.sender,
            target = %self.target,
        );
        tokio::spawn(task.run().instrument(span));
        Ok(())
    }
}

/// Why the serve loop ended.
enum Exit {
    /// Close with `</stream:stream>`.
    Close,
    /// Close with a stream error.
    Error(StreamError),
    /// The peer is gone; nothing to write.
    Gone,
}

struct OutStreamTask {
    session: Session,
    mailbox: Mailbox,
    sender: String,
    target: String,
    ctx: Arc<DialContext>,
    state: OutState,
    sasl_done: bool,
    pending: VecDeque<(Element, Flushed)>,
    /// KV key of our pending dialback request.
    dialback_record: Option<String>,
}

impl OutStreamTask {
    async fn run(mut self) {
        let exit = match self.serve().await {
            Ok(exit) => exit,
            Err(XmppError::StreamClosed) => Exit::Gone,
            Err(err) => {
                warn!(error = %err, state = ?self.state, "Out-stream failed");
                match err.to_stream_error() {
                    Some(error) => Exit::Error(error),
                    None => Exit::Gone,
                }
            }
        };
        self.terminate(exit).await;
    }

    async fn serve(&mut self) -> Result<Exit, XmppError> {
        self.session
            .open_stream(Some(&self.sender), Some(&self.target))
            .await?;
        loop {
            let idle = if self.state == OutState::Authenticated {
                self.ctx.config.keep_alive_timeout
            } else {
                self.ctx.config.request_timeout
            };
            tokio::select! {
                received = self.session.receive() => {
                    if let Some(exit) = self.on_received(received?).await? {
                        return Ok(exit);
                    }
                }
                command = self.mailbox.recv() => match command {
                    Some(StreamCommand::Send { element, flushed }) => {
                        if self.state == OutState::Authenticated {
                            self.write(element, flushed).await?;
                        } else {
                            self.pending.push_back((element, flushed));
                        }
                    }
                    Some(StreamCommand::Disconnect { error: Some(error) }) => {
                        return Ok(Exit::Error(error));
                    }
                    Some(StreamCommand::Disconnect { error: None }) | None => {
                        return Ok(Exit::Close);
                    }
                },
                _ = tokio::time::sleep(idle) => {
                    if self.state == OutState::Authenticated {
                        debug!("Out-stream idle, closing");
                        return Ok(Exit::Close);
                    }
                    return Err(XmppError::Timeout);
                }
            }
        }
    }

    async fn on_received(&mut self, received: Received) -> Result<Option<Exit>, XmppError> {
        let element = match received {
            Received::StreamHeader(_) => {
                self.state = OutState::Connected;
                return Ok(None);
            }
            Received::Element(element) => element,
            Received::Stanza(stanza) => stanza.into_element(),
            Received::BadStanza { element, .. } => element,
        };

        if element.is("error", ns::STREAM) {
            warn!(error = %String::from(&element), "Peer closed out-stream with an error");
            return Ok(Some(Exit::Gone));
        }

        match self.state {
            OutState::Connected if element.is("features", ns::STREAM) => {
                self.on_features(&element).await?;
            }
            OutState::Securing if element.is("proceed", ns::TLS) => {
                let connector = self.ctx.connector(&self.sender)?;
                self.session
                    .transport_mut()
                    .start_tls_client(&connector, &self.target)
                    .await?;
                self.restart().await?;
            }
            OutState::Securing if element.is("failure", ns::TLS) => {
                return Err(remote_connection_failed("STARTTLS refused"));
            }
            OutState::Authenticating if element.is("success", ns::SASL) => {
                self.sasl_done = true;
                self.restart().await?;
            }
            OutState::Authenticating if element.is("failure", ns::SASL) => {
                debug!("SASL EXTERNAL refused, falling back to dialback");
                self.start_dialback().await?;
            }
            OutState::VerifyingDialback if dialback::is_result(&element) => {
                match element.attr("type").and_then(DialbackResult::parse) {
                    Some(DialbackResult::Valid) => self.authenticated().await?,
                    _ => return Err(remote_connection_failed("dialback key rejected")),
                }
            }
            _ => debug!(element = element.name(), state = ?self.state, "Ignoring element"),
        }
        Ok(None)
    }

    async fn on_features(&mut self, features: &Element) -> Result<(), XmppError> {
        if self.sasl_done {
            return self.authenticated().await;
        }
        if !self.session.is_secured() {
            if !features.has_child("starttls", ns::TLS) {
                return Err(remote_connection_failed("peer does not offer STARTTLS"));
            }
            self.session
                .send(&Element::builder("starttls", ns::TLS).build())
                .await?;
            self.state = OutState::Securing;
            return Ok(());
        }

        let offers_external = features
            .get_child("mechanisms", ns::SASL)
            .map(|mechanisms| {
                mechanisms
                    .children()
                    .any(|m| m.is("mechanism", ns::SASL) && m.text() == "EXTERNAL")
            })
            .unwrap_or(false);
        if offers_external && self.ctx.hosts.certificate(&self.sender).is_some() {
            let auth = Element::builder("auth", ns::SASL)
                .attr("mechanism", "EXTERNAL")
                .append(BASE64.encode(self.sender.as_bytes()))
                .build();
            self.session.send(&auth).await?;
            self.state = OutState::Authenticating;
            return Ok(());
        }
        self.start_dialback().await
    }

    async fn start_dialback(&mut self) -> Result<(), XmppError> {
        let stream_id = self.session.stream_id().to_string();
        if stream_id.is_empty() {
            return Err(remote_connection_failed("peer sent no stream id"));
        }
        let key = dialback::dialback_key(
            &self.ctx.config.dialback_secret,
            &self.sender,
            &self.target,
            &stream_id,
        );
        if let Some(kv) = &self.ctx.kv {
            let record = dialback_req_key(&stream_id);
            let value = format!("{} {}", self.sender, self.target);
            kv.put(&record, value.as_bytes())
                .await
                .map_err(|e| XmppError::internal(e.to_string()))?;
            self.dialback_record = Some(record);
        }
        self.session
            .send(&dialback::result_request(&self.sender, &self.target, &key))
            .await?;
        self.state = OutState::VerifyingDialback;
        Ok(())
    }

    async fn restart(&mut self) -> Result<(), XmppError> {
        self.session.reset();
        self.session
            .open_stream(Some(&self.sender), Some(&self.target))
            .await?;
        self.state = OutState::Connecting;
        Ok(())
    }

    async fn authenticated(&mut self) -> Result<(), XmppError> {
        self.state = OutState::Authenticated;
        // The verifying side removes the record once it answered.
        self.dialback_record = None;
        info!(pending = self.pending.len(), "Out-stream authenticated");

        let info = HookInfo::S2sStream {
            id: self.mailbox.id(),
            sender: self.sender.clone(),
            target: self.target.clone(),
            element: None,
        };
        if let Err(err) = self.ctx.hooks.run(hook::S2S_OUT_STREAM_CONNECTED, info).await {
            warn!(error = %err, "Out-stream connected hook failed");
        }

        while let Some((element, flushed)) = self.pending.pop_front() {
            self.write(element, flushed).await?;
        }
        Ok(())
    }

    async fn write(&mut self, element: Element, flushed: Flushed) -> Result<(), XmppError> {
        match self.session.send(&element).await {
            Ok(()) => {
                if let Some(flushed) = flushed {
                    let _ = flushed.send(Ok(()));
                }
                Ok(())
            }
            Err(err) => {
                if let Some(flushed) = flushed {
                    let _ = flushed.send(Err(XmppError::StreamClosed));
                }
                Err(err)
            }
        }
    }

    async fn terminate(mut self, exit: Exit) {
        match exit {
            Exit::Close => {
                let _ = self.session.close().await;
            }
            Exit::Error(error) => {
                let _ = self.session.send_stream_error(&error).await;
            }
            Exit::Gone => {}
        }
        let _ = self.session.transport_mut().shutdown().await;

        if let (Some(record), Some(kv)) = (self.dialback_record.take(), &self.ctx.kv) {
            if let Err(err) = kv.del(&record).await {
                debug!(error = %err, "Failed to remove dialback request");
            }
        }
        if !self.pending.is_empty() {
            warn!(count = self.pending.len(), "Dropping stanzas of failed out-stream");
        }
        for (_, flushed) in self.pending.drain(..) {
            if let Some(flushed) = flushed {
                let _ = flushed.send(Err(XmppError::StreamClosed));
            }
        }
        self.mailbox.finish();

        let info = HookInfo::S2sStream {
            id: self.mailbox.id(),
            sender: self.sender.clone(),
            target: self.target.clone(),
            element: None,
        };
        if let Err(err) = self.ctx.hooks.run(hook::S2S_OUT_STREAM_TERMINATED, info).await {
            warn!(error = %err, "Out-stream terminated hook failed");
        }
        info!("Out-stream terminated");
    }
}

fn remote_connection_failed(text: &str) -> XmppError {
    XmppError::Stream(
        StreamError::new(StreamErrorCondition::RemoteConnectionFailed).with_text(text),
    )
}

/// Ask `remote`'s authoritative server whether `key` is valid, over a
/// short-lived stream of its own.
///
/// The exchange is bounded by the configured request timeout; the stream
/// is closed either way.
#[instrument(skip(session, ctx, key), name = "xmpp.s2s.dialback_verify")]
pub(crate) async fn verify_dialback_key(
    mut session: Session,
    ctx: Arc<DialContext>,
    local: String,
    remote: String,
    stream_id: String,
    key: String,
) -> Result<bool, S2sError> {
    let exchange = exchange_verify(&mut session, &ctx, &local, &remote, &stream_id, &key);
    let result = match tokio::time::timeout(ctx.config.request_timeout, exchange).await {
        Ok(result) => result,
        Err(_) => {
            debug!("Dialback verify stream timed out");
            Err(S2sError::Timeout(remote.clone()))
        }
    };
    let _ = session.close().await;
    let _ = session.transport_mut().shutdown().await;
    result
}

async fn exchange_verify(
    session: &mut Session,
    ctx: &DialContext,
    local: &str,
    remote: &str,
    stream_id: &str,
    key: &str,
) -> Result<bool, S2sError> {
    session.open_stream(Some(local), Some(remote)).await?;
    loop {
        let element = match session.receive().await? {
            Received::StreamHeader(_) => continue,
            Received::Element(element) => element,
            Received::Stanza(stanza) => stanza.into_element(),
            Received::BadStanza { element, .. } => element,
        };
        if element.is("features", ns::STREAM) {
            if !session.is_secured() && element.has_child("starttls", ns::TLS) {
                session
                    .send(&Element::builder("starttls", ns::TLS).build())
                    .await?;
            } else {
                session
                    .send(&dialback::verify_request(local, remote, stream_id, key))
                    .await?;
            }
        } else if element.is("proceed", ns::TLS) {
            let connector = ctx.connector(local)?;
            session
                .transport_mut()
                .start_tls_client(&connector, remote)
                .await?;
            session.reset();
            session.open_stream(Some(local), Some(remote)).await?;
        } else if dialback::is_verify(&element) && element.attr("id") == Some(stream_id) {
            return Ok(element.attr("type").and_then(DialbackResult::parse)
                == Some(DialbackResult::Valid));
        } else if element.is("error", ns::STREAM) || element.is("failure", ns::TLS) {
            return Err(S2sError::NotAuthorized);
        } else {
            debug!(element = element.name(), "Ignoring element on verify stream");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
    use rustls::{RootCertStore, ServerConfig};
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
    use tokio_rustls::TlsAcceptor;

    use super::*;
    use crate::hook::Hooks;
    use crate::hosts::Hosts;
    use crate::s2s::S2sConfig;
    use crate::session::{SessionConfig, SessionKind};
    use crate::transport::Transport;

    const SECRET: &str = "s3cr3t";

    /// The remote domain's certificate, trusted by our side.
    fn remote_tls() -> (RootCertStore, TlsAcceptor) {
        let generated = rcgen::generate_simple_self_signed(vec!["jabber.org".to_string()]).unwrap();
        let cert = CertificateDer::from(generated.cert.der().to_vec());
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(generated.key_pair.serialize_der()));

        let mut roots = RootCertStore::empty();
        roots.add(cert.clone()).unwrap();
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)
            .unwrap();
        (roots, TlsAcceptor::from(Arc::new(config)))
    }

    fn dial_context(roots: RootCertStore) -> Arc<DialContext> {
        let config = S2sConfig {
            dialback_secret: SECRET.to_string(),
            request_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        Arc::new(DialContext::new(
            config,
            Arc::new(Hosts::new("jackal.im")),
            roots,
            None,
            Arc::new(Hooks::new()),
        ))
    }

    fn outgoing_session(socket: DuplexStream) -> Session {
        Session::new(
            Transport::new(socket),
            Arc::new(Hosts::new("jackal.im")),
            SessionConfig {
                kind: SessionKind::S2s,
                incoming: false,
                max_stanza_size: 65_536,
                log_stanzas: false,
            },
        )
    }

    async fn read_until<S: AsyncRead + Unpin>(peer: &mut S, needle: &str) -> String {
        let mut out = String::new();
        let mut buf = [0u8; 4096];
        while !out.contains(needle) {
            let n = peer.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed, got: {out}");
            out.push_str(&std::str::from_utf8(&buf[..n]).unwrap().replace('"', "'"));
        }
        out
    }

    async fn answer_header<S: AsyncRead + AsyncWrite + Unpin>(peer: &mut S, id: &str, features: &str) {
        let header = read_until(peer, "version='1.0'>").await;
        assert!(header.contains("from='jackal.im'"), "{header}");
        assert!(header.contains("to='jabber.org'"), "{header}");
        let reply = format!(
            "<stream:stream xmlns='jabber:server' xmlns:stream='http://etherx.jabber.org/streams' \
             xmlns:db='jabber:server:dialback' id='{id}' from='jabber.org' version='1.0'>\
             <stream:features>{features}</stream:features>"
        );
        peer.write_all(reply.as_bytes()).await.unwrap();
    }

    /// Plays jabber.org: STARTTLS, then accepts our dialback key. Returns
    /// the secured stream for the test to keep reading from.
    async fn remote_server(
        mut socket: DuplexStream,
        acceptor: TlsAcceptor,
    ) -> tokio_rustls::server::TlsStream<DuplexStream> {
        answer_header(
            &mut socket,
            "s1",
            "<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls>",
        )
        .await;
        read_until(&mut socket, "starttls").await;
        socket
            .write_all(b"<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>")
            .await
            .unwrap();

        let mut tls = acceptor.accept(socket).await.unwrap();
        answer_header(
            &mut tls,
            "s2",
            "<dialback xmlns='urn:xmpp:features:dialback'><errors/></dialback>",
        )
        .await;
        let result = read_until(&mut tls, "</result>").await;
        let key = dialback::dialback_key(SECRET, "jackal.im", "jabber.org", "s2");
        assert!(result.contains(&format!(">{key}</result>")), "{result}");
        tls.write_all(b"<db:result from='jabber.org' to='jackal.im' type='valid'/>")
            .await
            .unwrap();
        tls
    }

    /// Feed the next received element to the task; its state afterwards.
    async fn step(task: &mut OutStreamTask) -> OutState {
        let received = task.session.receive().await.unwrap();
        assert!(task.on_received(received).await.unwrap().is_none());
        task.state
    }

    fn message(id: &str) -> Element {
        Element::builder("message", ns::CLIENT)
            .attr("id", id)
            .attr("from", "ortuman@jackal.im/yard")
            .attr("to", "romeo@jabber.org")
            .build()
    }

    #[test]
    fn test_remote_connection_failed() {
        let err = remote_connection_failed("nope");
        let stream_error = err.to_stream_error().unwrap();
        assert_eq!(
            stream_error.condition,
            StreamErrorCondition::RemoteConnectionFailed
        );
        assert_eq!(stream_error.text.as_deref(), Some("nope"));
    }

    #[tokio::test]
    async fn test_starttls_then_dialback_negotiation() {
        let (roots, acceptor) = remote_tls();
        let (ours, theirs) = tokio::io::duplex(65_536);
        let remote = tokio::spawn(remote_server(theirs, acceptor));

        let (_handle, mailbox) = StreamHandle::channel(8);
        let mut task = OutStreamTask {
            session: outgoing_session(ours),
            mailbox,
            sender: "jackal.im".to_string(),
            target: "jabber.org".to_string(),
            ctx: dial_context(roots),
            state: OutState::Connecting,
            sasl_done: false,
            pending: VecDeque::from([(message("early"), None)]),
            dialback_record: None,
        };
        task.session
            .open_stream(Some("jackal.im"), Some("jabber.org"))
            .await
            .unwrap();

        assert_eq!(step(&mut task).await, OutState::Connected);
        assert_eq!(step(&mut task).await, OutState::Securing);
        // <proceed/> upgrades the transport and restarts the stream.
        assert_eq!(step(&mut task).await, OutState::Connecting);
        assert!(task.session.is_secured());
        assert_eq!(step(&mut task).await, OutState::Connected);
        assert_eq!(task.session.stream_id(), "s2");
        assert_eq!(step(&mut task).await, OutState::VerifyingDialback);
        assert_eq!(step(&mut task).await, OutState::Authenticated);
        assert!(task.pending.is_empty());

        let mut tls = remote.await.unwrap();
        let delivered = read_until(&mut tls, "</message>").await;
        assert!(delivered.contains("id='early'"), "{delivered}");
        assert!(delivered.contains("xmlns='jabber:server'"), "{delivered}");
    }

    #[tokio::test]
    async fn test_queued_stanzas_drain_in_order_after_authentication() {
        let (roots, acceptor) = remote_tls();
        let (ours, theirs) = tokio::io::duplex(65_536);
        let remote = tokio::spawn(remote_server(theirs, acceptor));

        let stream = S2sOutStream::new("jackal.im", "jabber.org", outgoing_session(ours), dial_context(roots));
        for id in ["m1", "m2", "m3"] {
            stream.handle().deliver(message(id)).unwrap();
        }
        stream.start().await.unwrap();
        assert!(stream.start().await.is_err());

        let mut tls = remote.await.unwrap();
        let delivered = read_until(&mut tls, "id='m3'").await;
        let positions: Vec<usize> = ["m1", "m2", "m3"]
            .iter()
            .map(|id| delivered.find(&format!("id='{id}'")).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{delivered}");

        // Authenticated streams write straight through.
        stream.handle().send_element(message("m4")).await.unwrap();
        read_until(&mut tls, "id='m4'").await;

        stream.handle().disconnect(None).await;
        stream.handle().done().await;
    }

    #[tokio::test]
    async fn test_rejected_dialback_fails_queued_sends() {
        let (roots, acceptor) = remote_tls();
        let (ours, mut theirs) = tokio::io::duplex(65_536);
        let stream = S2sOutStream::new("jackal.im", "jabber.org", outgoing_session(ours), dial_context(roots));
        stream.start().await.unwrap();

        let waiting = tokio::spawn({
            let handle = stream.handle().clone();
            async move { handle.send_element(message("m1")).await }
        });

        answer_header(
            &mut theirs,
            "s1",
            "<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls>",
        )
        .await;
        read_until(&mut theirs, "starttls").await;
        theirs
            .write_all(b"<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>")
            .await
            .unwrap();
        let mut tls = acceptor.accept(theirs).await.unwrap();
        answer_header(&mut tls, "s2", "<dialback xmlns='urn:xmpp:features:dialback'/>").await;
        read_until(&mut tls, "</result>").await;
        tls.write_all(b"<db:result from='jabber.org' to='jackal.im' type='invalid'/>")
            .await
            .unwrap();

        let closing = read_until(&mut tls, "remote-connection-failed").await;
        assert!(!closing.contains("id='m1'"));
        assert!(matches!(waiting.await.unwrap(), Err(XmppError::StreamClosed)));
        stream.handle().done().await;
    }
}
