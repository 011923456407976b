//! External components (XEP-0114).
//!
//! A component connects with a `jabber:component:accept` stream whose `to`
//! names the domain it wants to serve, proves knowledge of the shared secret
//! with `<handshake>HEX(SHA1(stream_id || secret))</handshake>`, and is then
//! attached to the router for that domain until it disconnects.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use jid::Jid;
use minidom::Element;
use sha1::{Digest, Sha1};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, instrument, warn, Instrument};

use crate::error::{stanza_error_element, StreamError, StreamErrorCondition};
use crate::hosts::Hosts;
use crate::hub::StreamHub;
use crate::mailbox::{Mailbox, StreamCommand, StreamHandle, MAILBOX_CAPACITY};
use crate::metrics;
use crate::parser::{ns, ParseError};
use crate::router::Router;
use crate::session::{Received, Session, SessionConfig, SessionKind};
use crate::stanza::without_attrs;
use crate::transport::Transport;
use crate::XmppError;

/// Component listener settings.
#[derive(Debug, Clone)]
pub struct ComponentConfig {
    /// Time allowed for the header and the handshake.
    pub connect_timeout: Duration,
    pub keep_alive_timeout: Duration,
    pub request_timeout: Duration,
    pub max_stanza_size: usize,
    /// Shared secret per component domain.
    pub secrets: HashMap<String, String>,
    pub log_stanzas: bool,
}

impl Default for ComponentConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            keep_alive_timeout: Duration::from_secs(600),
            request_timeout: Duration::from_secs(15),
            max_stanza_size: 32 * 1024,
            secrets: HashMap::new(),
            log_stanzas: false,
        }
    }
}

/// Expected handshake value for a stream.
pub fn handshake_digest(stream_id: &str, secret: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(stream_id.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Shared dependencies of every component stream.
pub struct ComponentContext {
    pub config: ComponentConfig,
    pub hosts: Arc<Hosts>,
    pub router: Arc<Router>,
    pub hub: Arc<StreamHub>,
}

impl ComponentContext {
    /// Run an accepted connection to completion.
    #[instrument(skip_all, name = "xmpp.component.stream")]
    pub async fn serve(self: Arc<Self>, transport: Transport) {
        let transport = transport.with_write_timeout(self.config.request_timeout);
        let session = Session::new(
            transport,
            self.hosts.clone(),
            SessionConfig {
                kind: SessionKind::Component,
                incoming: true,
                max_stanza_size: self.config.max_stanza_size,
                log_stanzas: self.config.log_stanzas,
            },
        );
        let (handle, mailbox) = StreamHandle::channel(MAILBOX_CAPACITY);
        let mut stream = ComponentStream {
            ctx: self,
            session,
            mailbox,
            handle,
            domain: None,
        };

        let result = match tokio::time::timeout(stream.ctx.config.connect_timeout, stream.handshake()).await
        {
            Ok(Ok(())) => stream.serve().await,
            Ok(Err(err)) => Err(err),
            Err(_) => Err(XmppError::Timeout),
        };
        stream.terminate(result).await;
    }
}

struct ComponentStream {
    ctx: Arc<ComponentContext>,
    session: Session,
    mailbox: Mailbox,
    handle: StreamHandle,
    /// Set once the handshake succeeded and the domain is attached.
    domain: Option<String>,
}

impl ComponentStream {
    async fn handshake(&mut self) -> Result<(), XmppError> {
        let header = match self.session.receive().await? {
            Received::StreamHeader(header) => header,
            _ => return Err(XmppError::stream(StreamErrorCondition::BadFormat)),
        };
        let domain = header
            .attr("to")
            .map(str::to_string)
            .ok_or_else(|| XmppError::stream(StreamErrorCondition::ImproperAddressing))?;
        let secret = self
            .ctx
            .config
            .secrets
            .get(&domain)
            .cloned()
            .ok_or_else(|| XmppError::stream(StreamErrorCondition::HostUnknown))?;
        let jid = Jid::new(&domain).map_err(|_| XmppError::stream(StreamErrorCondition::HostUnknown))?;
        self.session.open_stream(Some(&domain), None).await?;

        let handshake = match self.session.receive().await? {
            Received::Element(element) if element.is("handshake", ns::COMPONENT) => element,
            _ => return Err(XmppError::stream(StreamErrorCondition::NotAuthorized)),
        };
        let expected = handshake_digest(self.session.stream_id(), &secret);
        if !handshake.text().trim().eq_ignore_ascii_case(&expected) {
            debug!(domain = %domain, "Component handshake mismatch");
            return Err(XmppError::stream(StreamErrorCondition::NotAuthorized));
        }

        if !self.ctx.router.register_component(&domain, self.handle.clone()) {
            return Err(XmppError::stream(StreamErrorCondition::Conflict));
        }
        self.domain = Some(domain.clone());
        self.ctx.hub.register(self.handle.clone());
        metrics::record_connection_count(self.ctx.hub.len() as i64, "component");
        self.session.set_jid(jid);
        self.session
            .send(&Element::builder("handshake", ns::COMPONENT).build())
            .await?;
        info!(domain = %domain, "Component connected");
        Ok(())
    }

    async fn serve(&mut self) -> Result<(), XmppError> {
        loop {
            tokio::select! {
                received = self.session.receive() => match received? {
                    Received::Stanza(stanza) => {
                        metrics::record_stanza(stanza.kind().as_str(), "inbound");
                        self.ctx.router.route_or_bounce(stanza).await;
                    }
                    Received::BadStanza { element, condition } => {
                        if element.attr("type") != Some("error") {
                            let from = element.attr("from").map(str::to_string);
                            let to = element.attr("to").map(str::to_string);
                            let mut element = without_attrs(&element, &["from", "to"]);
                            if let Some(to) = to {
                                element.set_attr("from", to);
                            }
                            if let Some(from) = from {
                                element.set_attr("to", from);
                            }
                            element.set_attr("type", "error");
                            element.append_child(stanza_error_element(condition, condition.default_type(), None));
                            self.session.send(&element).await?;
                        }
                    }
                    Received::StreamHeader(_) | Received::Element(_) => {
                        return Err(XmppError::stream(StreamErrorCondition::UnsupportedStanzaType));
                    }
                },
                command = self.mailbox.recv() => match command {
                    Some(StreamCommand::Send { element, flushed }) => {
                        let result = self.session.send(&element).await;
                        if let Some(flushed) = flushed {
                            let _ = flushed.send(result.as_ref().map(|_| ()).map_err(|_| XmppError::StreamClosed));
                        }
                        result?;
                    }
                    Some(StreamCommand::Disconnect { error: Some(error) }) => {
                        return Err(XmppError::Stream(error));
                    }
                    Some(StreamCommand::Disconnect { error: None }) | None => return Ok(()),
                },
                _ = tokio::time::sleep(self.ctx.config.keep_alive_timeout) => {
                    return Err(XmppError::Timeout);
                }
            }
        }
    }

    async fn terminate(mut self, result: Result<(), XmppError>) {
        match result {
            Ok(()) | Err(XmppError::XmlParse(ParseError::StreamClosedByPeer)) => {
                let _ = self.session.close().await;
            }
            Err(XmppError::StreamClosed) | Err(XmppError::Io(_)) => {}
            Err(err) => {
                debug!(error = %err, "Component stream failed");
                let error = err
                    .to_stream_error()
                    .unwrap_or_else(|| StreamError::new(StreamErrorCondition::InternalServerError));
                let _ = self.session.send_stream_error(&error).await;
            }
        }
        let _ = self.session.transport_mut().shutdown().await;

        if let Some(domain) = &self.domain {
            self.ctx.router.unregister_component(domain, self.handle.id());
            self.ctx.hub.unregister(self.handle.id());
            metrics::record_connection_count(self.ctx.hub.len() as i64, "component");
            info!(domain = %domain, "Component disconnected");
        }
        self.mailbox.finish();
    }
}

/// Accepts external component connections.
pub struct ComponentListener {
    listener: TcpListener,
    ctx: Arc<ComponentContext>,
}

impl ComponentListener {
    pub async fn bind(addr: SocketAddr, ctx: Arc<ComponentContext>) -> Result<Self, XmppError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, ctx })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, XmppError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), XmppError> {
        info!(addr = %self.local_addr()?, "XMPP component listener started");
        loop {
            let (socket, peer_addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept component connection");
                        continue;
                    }
                },
            };
            let ctx = self.ctx.clone();
            tokio::spawn(
                async move { ctx.serve(Transport::new(socket)).await }
                    .instrument(info_span!("xmpp.component.connection.lifecycle", peer_ip = %peer_addr)),
            );
        }
        info!("XMPP component listener stopped");
        Ok(())
    }
}
