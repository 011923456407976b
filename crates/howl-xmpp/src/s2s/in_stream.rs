//! Incoming S2S streams.
//!
//! A remote server opens the stream, secures it with STARTTLS and then
//! authorizes its domain through SASL EXTERNAL (certificate) or dialback.
//! Only then are its stanzas handed to the router.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use jid::Jid;
use minidom::Element;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, instrument, warn};

use super::dialback::{self, DialbackResult, DialbackVerifier};
use super::{dialback_req_key, S2sConfig};
use crate::auth::SaslError;
use crate::cluster::Kv;
use crate::error::{StreamError, StreamErrorCondition};
use crate::hook::{self, HookInfo, Hooks};
use crate::hosts::Hosts;
use crate::hub::StreamHub;
use crate::mailbox::{Mailbox, StreamCommand, StreamHandle, MAILBOX_CAPACITY};
use crate::metrics;
use crate::parser::ns;
use crate::router::Router;
use crate::session::{Received, Session, SessionConfig, SessionKind};
use crate::stanza::Stanza;
use crate::tls::certificate_matches_domain;
use crate::transport::Transport;
use crate::XmppError;

/// Shared dependencies of every incoming S2S stream.
pub struct InStreamContext {
    pub config: S2sConfig,
    pub hosts: Arc<Hosts>,
    pub router: Arc<Router>,
    pub hooks: Arc<Hooks>,
    pub hub: Arc<StreamHub>,
    /// STARTTLS is offered (and required) when set.
    pub tls: Option<TlsAcceptor>,
    /// Cluster store holding pending dialback requests.
    pub kv: Option<Arc<dyn Kv>>,
    pub verifier: Arc<dyn DialbackVerifier>,
}

impl InStreamContext {
    /// Run an accepted connection to completion.
    pub async fn serve(self: Arc<Self>, transport: Transport) {
        let session = Session::new(
            transport,
            self.hosts.clone(),
            SessionConfig {
                kind: SessionKind::S2s,
                incoming: true,
                max_stanza_size: self.config.max_stanza_size,
                log_stanzas: self.config.log_stanzas,
            },
        );
        let (handle, mailbox) = StreamHandle::channel(MAILBOX_CAPACITY);
        self.hub.register(handle);
        metrics::record_connection_count(self.hub.len() as i64, "s2s");

        let stream = InStream {
            ctx: self.clone(),
            session,
            mailbox,
            state: InState::Connecting,
            local: None,
            remote: None,
        };
        stream.run().await;
        metrics::record_connection_count(self.hub.len() as i64, "s2s");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InState {
    /// Waiting for the peer's header.
    Connecting,
    /// Header answered, negotiating.
    Connected,
    /// A `<db:result>` is being verified.
    AuthorizingDialbackKey,
    Authorized,
}

struct InStream {
    ctx: Arc<InStreamContext>,
    session: Session,
    mailbox: Mailbox,
    state: InState,
    /// Local domain the peer addressed.
    local: Option<String>,
    /// Peer domain, once announced.
    remote: Option<String>,
}

impl InStream {
    #[instrument(skip(self), fields(stream = %self.mailbox.id()), name = "xmpp.s2s.in")]
    async fn run(mut self) {
        let error = match self.serve().await {
            Ok(error) => error,
            Err(XmppError::StreamClosed) => None,
            Err(err) => {
                debug!(error = %err, state = ?self.state, "In-stream failed");
                err.to_stream_error()
            }
        };
        self.terminate(error).await;
    }

    async fn serve(&mut self) -> Result<Option<StreamError>, XmppError> {
        loop {
            let idle = match self.state {
                InState::Connecting => self.ctx.config.connect_timeout,
                _ => self.ctx.config.keep_alive_timeout,
            };
            tokio::select! {
                received = self.session.receive() => {
                    self.on_received(received?).await?;
                }
                command = self.mailbox.recv() => match command {
                    Some(StreamCommand::Send { element, flushed }) => {
                        let result = self.session.send(&element).await;
                        let failed = result.is_err();
                        if let Some(flushed) = flushed {
                            let _ = flushed.send(result);
                        }
                        if failed {
                            return Err(XmppError::StreamClosed);
                        }
                    }
                    Some(StreamCommand::Disconnect { error }) => return Ok(error),
                    None => return Ok(None),
                },
                _ = tokio::time::sleep(idle) => return Err(XmppError::Timeout),
            }
        }
    }

    async fn on_received(&mut self, received: Received) -> Result<(), XmppError> {
        match received {
            Received::StreamHeader(header) => self.on_header(&header).await,
            Received::Stanza(stanza) => self.on_stanza(stanza).await,
            Received::BadStanza { element, condition } => {
                // In-streams are one-way; nothing can be written back.
                debug!(element = element.name(), condition = condition.as_str(), "Dropping stanza");
                Ok(())
            }
            Received::Element(element) => self.on_element(element).await,
        }
    }

    async fn on_header(&mut self, header: &Element) -> Result<(), XmppError> {
        let local = header
            .attr("to")
            .unwrap_or(self.ctx.hosts.default_host())
            .to_string();
        if self.remote.is_none() {
            self.remote = header.attr("from").map(str::to_string);
        }
        self.session
            .open_stream(Some(&local), self.remote.as_deref())
            .await?;
        self.local = Some(local);

        let mut features = Element::builder("features", ns::STREAM);
        if !self.session.is_secured() && self.ctx.tls.is_some() {
            features = features.append(
                Element::builder("starttls", ns::TLS).append(Element::builder("required", ns::TLS)),
            );
        } else if self.state != InState::Authorized {
            if self.offers_external() {
                features = features.append(
                    Element::builder("mechanisms", ns::SASL)
                        .append(Element::builder("mechanism", ns::SASL).append("EXTERNAL")),
                );
            }
            features = features.append(dialback::feature());
        }
        self.session.send(&features.build()).await?;
        if self.state == InState::Connecting {
            self.state = InState::Connected;
        }
        Ok(())
    }

    fn offers_external(&self) -> bool {
        self.session.is_secured()
            && self
                .session
                .transport()
                .peer_certificates()
                .is_some_and(|certs| !certs.is_empty())
    }

    async fn on_element(&mut self, element: Element) -> Result<(), XmppError> {
        if element.is("starttls", ns::TLS) {
            return self.on_starttls().await;
        }
        if element.is("auth", ns::SASL) {
            return self.on_sasl_external(&element).await;
        }
        if dialback::is_result(&element) {
            return self.on_dialback_result(&element).await;
        }
        if dialback::is_verify(&element) {
            return self.on_dialback_verify(&element).await;
        }
        if element.ns() == ns::CLIENT {
            return Err(XmppError::stream(StreamErrorCondition::NotAuthorized));
        }
        Err(XmppError::stream(StreamErrorCondition::UnsupportedStanzaType))
    }

    async fn on_starttls(&mut self) -> Result<(), XmppError> {
        let Some(acceptor) = self.ctx.tls.clone().filter(|_| !self.session.is_secured()) else {
            self.session
                .send(&Element::builder("failure", ns::TLS).build())
                .await?;
            return Err(XmppError::StreamClosed);
        };
        self.session
            .send(&Element::builder("proceed", ns::TLS).build())
            .await?;
        self.session.transport_mut().start_tls_server(&acceptor).await?;
        self.session.reset();
        Ok(())
    }

    async fn on_sasl_external(&mut self, auth: &Element) -> Result<(), XmppError> {
        if auth.attr("mechanism") != Some("EXTERNAL") || !self.offers_external() {
            self.session
                .send(&SaslError::InvalidMechanism.to_element())
                .await?;
            return Ok(());
        }
        let authzid = match auth.text().trim() {
            "" | "=" => self.remote.clone(),
            text => BASE64
                .decode(text)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok()),
        };
        let certificate_ok = match (&authzid, self.session.transport().peer_certificates()) {
            (Some(domain), Some(certs)) => certs
                .first()
                .is_some_and(|leaf| certificate_matches_domain(leaf, domain)),
            _ => false,
        };
        let announced_ok = match (&self.remote, &authzid) {
            (Some(remote), Some(authzid)) => remote == authzid,
            _ => authzid.is_some(),
        };
        metrics::record_auth_attempt("EXTERNAL", certificate_ok && announced_ok);

        let Some(domain) = authzid.filter(|_| certificate_ok && announced_ok) else {
            self.session.send(&SaslError::NotAuthorized.to_element()).await?;
            return Err(XmppError::stream(StreamErrorCondition::NotAuthorized));
        };
        self.session
            .send(&Element::builder("success", ns::SASL).build())
            .await?;
        self.authorize(domain).await?;
        self.session.reset();
        Ok(())
    }

    async fn on_dialback_result(&mut self, request: &Element) -> Result<(), XmppError> {
        let (Some(sender), Some(target)) = (request.attr("from"), request.attr("to")) else {
            return Err(XmppError::stream(StreamErrorCondition::BadFormat));
        };
        let (sender, target) = (sender.to_string(), target.to_string());
        if !self.ctx.hosts.is_local_host(&target) {
            return Err(XmppError::stream(StreamErrorCondition::HostUnknown));
        }
        if self.remote.as_deref().is_some_and(|remote| remote != sender) {
            return Err(XmppError::stream(StreamErrorCondition::InvalidFrom));
        }

        self.state = InState::AuthorizingDialbackKey;
        let stream_id = self.session.stream_id().to_string();
        let key = request.text();
        let valid = match tokio::time::timeout(
            self.ctx.config.request_timeout,
            self.ctx.verifier.verify(&target, &sender, &stream_id, key.trim()),
        )
        .await
        {
            Ok(Ok(valid)) => valid,
            Ok(Err(err)) => {
                warn!(remote = %sender, error = %err, "Dialback verification failed");
                false
            }
            Err(_) => {
                warn!(remote = %sender, "Dialback verification timed out");
                false
            }
        };
        metrics::record_auth_attempt("dialback", valid);

        self.session
            .send(&dialback::result_answer(
                &target,
                &sender,
                DialbackResult::from_bool(valid),
            ))
            .await?;
        if !valid {
            return Err(XmppError::stream(StreamErrorCondition::NotAuthorized));
        }
        self.authorize(sender).await
    }

    /// Answer a verify request for a key one of our out-streams issued.
    async fn on_dialback_verify(&mut self, request: &Element) -> Result<(), XmppError> {
        let (Some(from), Some(to), Some(id)) =
            (request.attr("from"), request.attr("to"), request.attr("id"))
        else {
            return Err(XmppError::stream(StreamErrorCondition::BadFormat));
        };
        // `to` is our domain (the originating sender), `from` the verifier.
        let valid = self.ctx.hosts.is_local_host(to)
            && dialback::verify_key(
                &self.ctx.config.dialback_secret,
                to,
                from,
                id,
                &request.text(),
            )
            && self.pending_request_matches(id, to, from).await;

        self.session
            .send(&dialback::verify_answer(
                to,
                from,
                id,
                DialbackResult::from_bool(valid),
            ))
            .await?;

        if let Some(kv) = &self.ctx.kv {
            if let Err(err) = kv.del(&dialback_req_key(id)).await {
                debug!(error = %err, "Failed to remove dialback request");
            }
        }
        Ok(())
    }

    /// With a cluster store, a key is only valid while the out-stream
    /// that issued it waits for the answer.
    async fn pending_request_matches(&self, stream_id: &str, sender: &str, target: &str) -> bool {
        let Some(kv) = &self.ctx.kv else {
            return true;
        };
        match kv.get(&dialback_req_key(stream_id)).await {
            Ok(Some(value)) => value == format!("{sender} {target}").as_bytes(),
            Ok(None) => false,
            Err(err) => {
                warn!(error = %err, "Failed to read dialback request");
                false
            }
        }
    }

    async fn authorize(&mut self, remote: String) -> Result<(), XmppError> {
        let jid = Jid::new(&remote).map_err(|_| XmppError::stream(StreamErrorCondition::InvalidFrom))?;
        self.session.set_jid(jid);
        self.state = InState::Authorized;
        info!(remote = %remote, "Remote server authorized");
        self.remote = Some(remote);

        let info = self.hook_info(None);
        if let Err(err) = self.ctx.hooks.run(hook::S2S_IN_STREAM_REGISTERED, info).await {
            warn!(error = %err, "In-stream registered hook failed");
        }
        Ok(())
    }

    async fn on_stanza(&mut self, stanza: Stanza) -> Result<(), XmppError> {
        if self.state != InState::Authorized {
            return Err(XmppError::stream(StreamErrorCondition::NotAuthorized));
        }
        metrics::record_stanza(stanza.kind().as_str(), "inbound");

        let info = self.hook_info(Some(stanza.element().clone()));
        match self.ctx.hooks.run(hook::S2S_IN_STREAM_ELEMENT_RECEIVED, info).await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(err) => warn!(error = %err, "In-stream element hook failed"),
        }

        let to = stanza.to().domain().as_str();
        if !self.ctx.hosts.is_local_host(to) && !self.ctx.router.is_component_domain(to) {
            debug!(to = %to, "Dropping stanza not addressed to us");
            return Ok(());
        }
        self.ctx.router.route_or_bounce(stanza).await;
        Ok(())
    }

    fn hook_info(&self, element: Option<Element>) -> HookInfo {
        HookInfo::S2sStream {
            id: self.mailbox.id(),
            sender: self.remote.clone().unwrap_or_default(),
            target: self.local.clone().unwrap_or_default(),
            element,
        }
    }

    async fn terminate(mut self, error: Option<StreamError>) {
        let _ = match &error {
            Some(error) => self.session.send_stream_error(error).await,
            None => self.session.close().await,
        };
        let _ = self.session.transport_mut().shutdown().await;
        self.mailbox.finish();
        self.ctx.hub.unregister(self.mailbox.id());

        let info = self.hook_info(None);
        if let Err(err) = self.ctx.hooks.run(hook::S2S_IN_STREAM_TERMINATED, info).await {
            warn!(error = %err, "In-stream terminated hook failed");
        }
        debug!(remote = ?self.remote, "In-stream terminated");
    }
}
