//! C2S stream state machine.

use std::future::pending;
use std::sync::Arc;

use jid::{BareJid, Jid};
use minidom::Element;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::{C2sContext, ResourceConflict};
use crate::auth::{AuthContext, Authenticator, SaslError};
use crate::error::{
    stanza_error_element, StanzaErrorCondition, StreamError, StreamErrorCondition,
};
use crate::hook::{self, HookInfo};
use crate::mailbox::{Mailbox, StreamCommand, StreamHandle, StreamId, MAILBOX_CAPACITY};
use crate::metrics;
use crate::parser::{ns, ParseError};
use crate::session::{Received, Session};
use crate::stanza::{without_attrs, Stanza, StanzaKind};
use crate::stream_management::{self as sm, SharedQueue, SmQueue, SmTimer};
use crate::XmppError;

/// Negotiation state of a C2S stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum C2sState {
    /// Waiting for the client's header.
    Connecting,
    /// Header answered; TLS and SASL negotiation.
    Connected,
    /// SASL succeeded; waiting for bind or resume.
    Authenticated,
    /// A resource is bound.
    SessionStarted,
}

type Flushed = Option<oneshot::Sender<Result<(), XmppError>>>;

/// How the stream ends.
enum Exit {
    /// Server-side close without an error.
    Close,
    /// Close with a stream error.
    Error(StreamError),
    /// The client sent `</stream:stream>`.
    PeerClosed,
    /// The connection broke.
    Dropped,
}

pub(super) struct C2sStream {
    ctx: Arc<C2sContext>,
    session: Session,
    mailbox: Mailbox,
    handle: StreamHandle,
    state: C2sState,
    authenticated: bool,
    /// Local domain the client addressed.
    domain: String,
    username: Option<String>,
    authenticator: Option<Authenticator>,
    /// Full JID once bound.
    jid: Option<Jid>,
    sm: Option<SharedQueue>,
}

impl C2sStream {
    pub(super) fn new(ctx: Arc<C2sContext>, session: Session) -> Self {
        let (handle, mailbox) = StreamHandle::channel(MAILBOX_CAPACITY);
        let domain = ctx.hosts.default_host().to_string();
        Self {
            ctx,
            session,
            mailbox,
            handle,
            state: C2sState::Connecting,
            authenticated: false,
            domain,
            username: None,
            authenticator: None,
            jid: None,
            sm: None,
        }
    }

    fn id(&self) -> StreamId {
        self.handle.id()
    }

    #[instrument(skip(self), fields(stream = %self.handle.id()), name = "xmpp.c2s.stream")]
    pub(super) async fn run(mut self) {
        self.ctx.hub.register(self.handle.clone());
        metrics::record_connection_count(self.ctx.hub.len() as i64, "c2s");
        self.run_hook(hook::C2S_STREAM_CONNECTED, None).await;

        let exit = match self.serve().await {
            Ok(exit) => exit,
            Err(XmppError::XmlParse(ParseError::StreamClosedByPeer)) => Exit::PeerClosed,
            Err(XmppError::StreamClosed) | Err(XmppError::Io(_)) => Exit::Dropped,
            Err(err) => {
                debug!(error = %err, state = ?self.state, "C2S stream failed");
                match err.to_stream_error() {
                    Some(error) => Exit::Error(error),
                    None => Exit::Dropped,
                }
            }
        };
        self.terminate(exit).await;
    }

    async fn serve(&mut self) -> Result<Exit, XmppError> {
        loop {
            let idle = match self.state {
                C2sState::Connecting => self.ctx.config.connect_timeout,
                _ => self.ctx.config.keep_alive_timeout,
            };
            let sm_timer = self.sm_timer().await;
            let sm_sleep = async {
                match sm_timer {
                    Some((at, timer)) => {
                        tokio::time::sleep_until(at).await;
                        timer
                    }
                    None => pending().await,
                }
            };

            tokio::select! {
                received = self.session.receive() => {
                    if let Some(exit) = self.on_received(received?).await? {
                        return Ok(exit);
                    }
                }
                command = self.mailbox.recv() => match command {
                    Some(StreamCommand::Send { element, flushed }) => {
                        self.write_out(element, flushed).await?;
                    }
                    Some(StreamCommand::Disconnect { error: Some(error) }) => {
                        return Ok(Exit::Error(error));
                    }
                    Some(StreamCommand::Disconnect { error: None }) | None => return Ok(Exit::Close),
                },
                timer = sm_sleep => self.on_sm_timer(timer).await?,
                _ = tokio::time::sleep(idle) => return Err(XmppError::Timeout),
            }
        }
    }

    async fn on_received(&mut self, received: Received) -> Result<Option<Exit>, XmppError> {
        match received {
            Received::StreamHeader(header) => {
                self.on_header(&header).await?;
                Ok(None)
            }
            Received::Stanza(stanza) => {
                self.on_stanza(stanza).await?;
                Ok(None)
            }
            Received::BadStanza { element, condition } => {
                self.reply_bad_stanza(element, condition).await?;
                Ok(None)
            }
            Received::Element(element) => self.on_element(element).await,
        }
    }

    async fn on_header(&mut self, header: &Element) -> Result<(), XmppError> {
        if let Some(to) = header.attr("to") {
            self.domain = to.to_string();
        }
        self.session.open_stream(Some(&self.domain), None).await?;
        let features = self.features();
        self.session.send(&features).await?;
        self.state = if self.authenticated {
            C2sState::Authenticated
        } else {
            C2sState::Connected
        };
        Ok(())
    }

    fn tls_required(&self) -> bool {
        self.ctx.tls.is_some() && !self.session.is_secured()
    }

    fn features(&self) -> Element {
        let mut features = Element::builder("features", ns::STREAM);
        if self.tls_required() {
            return features
                .append(
                    Element::builder("starttls", ns::TLS)
                        .append(Element::builder("required", ns::TLS)),
                )
                .build();
        }

        if self.ctx.config.compression && !self.session.transport().is_compressed() {
            features = features.append(
                Element::builder("compression", ns::COMPRESS_FEATURE)
                    .append(Element::builder("method", ns::COMPRESS_FEATURE).append("zlib")),
            );
        }

        if !self.authenticated {
            let channel_binding = self.session.transport().channel_binding().is_some();
            let mechanisms = self
                .ctx
                .config
                .sasl
                .offered(channel_binding)
                .into_iter()
                .map(|m| Element::builder("mechanism", ns::SASL).append(m).build());
            return features
                .append(Element::builder("mechanisms", ns::SASL).append_all(mechanisms))
                .build();
        }

        features = features
            .append(Element::builder("bind", ns::BIND))
            .append(
                Element::builder("session", ns::SESSION)
                    .append(Element::builder("optional", ns::SESSION)),
            );
        if self.ctx.sm.is_some() {
            features = features.append(sm::feature());
        }
        features
            .append_all(self.ctx.router.modules().stream_features())
            .build()
    }

    async fn on_element(&mut self, element: Element) -> Result<Option<Exit>, XmppError> {
        if element.is("starttls", ns::TLS) {
            return self.on_starttls().await;
        }
        if self.tls_required() {
            return Err(XmppError::stream(StreamErrorCondition::NotAuthorized));
        }
        if element.is("compress", ns::COMPRESS) {
            self.on_compress(&element).await?;
            return Ok(None);
        }

        match self.state {
            C2sState::Connected if element.ns() == ns::SASL => {
                self.on_sasl(&element).await?;
            }
            C2sState::Authenticated if is_bind_request(&element) => {
                self.on_bind(&element).await?;
            }
            C2sState::Authenticated | C2sState::SessionStarted if sm::is_sm_element(&element) => {
                self.on_sm(&element).await?;
            }
            C2sState::SessionStarted => {
                return Err(XmppError::stream(StreamErrorCondition::UnsupportedStanzaType));
            }
            _ => return Err(XmppError::stream(StreamErrorCondition::NotAuthorized)),
        }
        Ok(None)
    }

    async fn on_starttls(&mut self) -> Result<Option<Exit>, XmppError> {
        let Some(acceptor) = self.ctx.tls.clone().filter(|_| !self.session.is_secured()) else {
            self.session
                .send(&Element::builder("failure", ns::TLS).build())
                .await?;
            return Ok(Some(Exit::Close));
        };
        self.session
            .send(&Element::builder("proceed", ns::TLS).build())
            .await?;
        self.session.transport_mut().start_tls_server(&acceptor).await?;
        self.session.reset();
        self.state = C2sState::Connecting;
        Ok(None)
    }

    async fn on_compress(&mut self, request: &Element) -> Result<(), XmppError> {
        let failure = |condition: &str| {
            Element::builder("failure", ns::COMPRESS)
                .append(Element::builder(condition, ns::COMPRESS))
                .build()
        };
        if !self.ctx.config.compression || self.session.transport().is_compressed() {
            return self.session.send(&failure("setup-failed")).await;
        }
        let method = request.get_child("method", ns::COMPRESS).map(|m| m.text());
        if method.as_deref() != Some("zlib") {
            return self.session.send(&failure("unsupported-method")).await;
        }
        self.session
            .send(&Element::builder("compressed", ns::COMPRESS).build())
            .await?;
        self.session.transport_mut().enable_compression();
        self.session.reset();
        self.state = C2sState::Connecting;
        debug!("Stream compression enabled");
        Ok(())
    }

    async fn on_sasl(&mut self, element: &Element) -> Result<(), XmppError> {
        match element.name() {
            "auth" => {
                let mechanism = element.attr("mechanism").unwrap_or_default();
                let ctx = AuthContext {
                    users: self.ctx.users.clone(),
                    domain: self.domain.clone(),
                    channel_binding: self.session.transport().channel_binding(),
                };
                self.authenticator =
                    Authenticator::for_mechanism(mechanism, &self.ctx.config.sasl, ctx);
                if self.authenticator.is_none() {
                    debug!(mechanism, "Unsupported SASL mechanism");
                    return self
                        .session
                        .send(&SaslError::InvalidMechanism.to_element())
                        .await;
                }
            }
            "response" if self.authenticator.is_some() => {}
            "abort" => {
                self.authenticator = None;
                return self.session.send(&SaslError::Aborted.to_element()).await;
            }
            _ => {
                return self
                    .session
                    .send(&SaslError::MalformedRequest.to_element())
                    .await;
            }
        }

        let Some(authenticator) = self.authenticator.as_mut() else {
            return Ok(());
        };
        let mechanism = authenticator.mechanism();
        match authenticator.process(element).await {
            Ok(reply) => {
                let username = authenticator
                    .authenticated()
                    .then(|| authenticator.username().to_string());
                self.session.send(&reply).await?;
                if let Some(username) = username {
                    metrics::record_auth_attempt(mechanism, true);
                    self.on_authenticated(username).await;
                }
            }
            Err(err) => {
                metrics::record_auth_attempt(mechanism, false);
                debug!(mechanism, error = %err, "SASL authentication failed");
                self.authenticator = None;
                self.session.send(&err.to_element()).await?;
            }
        }
        Ok(())
    }

    async fn on_authenticated(&mut self, username: String) {
        info!(username = %username, domain = %self.domain, "Client authenticated");
        self.authenticator = None;
        self.authenticated = true;
        self.username = Some(username);
        self.session.reset();
        self.state = C2sState::Connecting;
        let bare = self.bare_jid().map(Jid::from);
        self.run_hook_with(hook::C2S_STREAM_AUTHENTICATED, bare, None)
            .await;
    }

    fn bare_jid(&self) -> Option<BareJid> {
        let username = self.username.as_deref()?;
        BareJid::new(&format!("{username}@{}", self.domain)).ok()
    }

    async fn on_bind(&mut self, iq: &Element) -> Result<(), XmppError> {
        let id = iq.attr("id").unwrap_or_default().to_string();
        let requested = iq
            .get_child("bind", ns::BIND)
            .and_then(|bind| bind.get_child("resource", ns::BIND))
            .map(|r| r.text().trim().to_string())
            .filter(|r| !r.is_empty());
        let resource = requested.unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

        let jid = match self
            .bare_jid()
            .and_then(|bare| Jid::new(&format!("{bare}/{resource}")).ok())
        {
            Some(jid) => jid,
            None => {
                let error = iq_error(&id, StanzaErrorCondition::BadRequest);
                return self.session.send(&error).await;
            }
        };

        if self.ctx.config.resource_conflict == ResourceConflict::Reject
            && self.ctx.router.resources().get(&jid).is_some()
        {
            debug!(jid = %jid, "Rejecting bind of a resource already in use");
            let error = iq_error(&id, StanzaErrorCondition::Conflict);
            return self.session.send(&error).await;
        }

        self.bind(jid.clone()).await;
        let reply = Element::builder("iq", ns::CLIENT)
            .attr("type", "result")
            .attr("id", id)
            .append(
                Element::builder("bind", ns::BIND)
                    .append(Element::builder("jid", ns::BIND).append(jid.to_string())),
            )
            .build();
        self.session.send(&reply).await?;
        info!(jid = %jid, "Resource bound");
        Ok(())
    }

    /// Make `jid` this stream's address, routable and locatable.
    async fn bind(&mut self, jid: Jid) {
        if let Some(previous) = self.ctx.router.bind(jid.clone(), self.handle.clone()) {
            if previous.id() != self.id() {
                debug!(jid = %jid, stream = %previous.id(), "Disconnecting replaced resource");
                previous
                    .disconnect(Some(StreamError::new(StreamErrorCondition::Conflict)))
                    .await;
            }
        }
        if let Some(locator) = &self.ctx.locator {
            if let Err(err) = locator.register(&jid).await {
                warn!(jid = %jid, error = %err, "Failed to publish resource");
            }
        }
        self.session.set_jid(jid.clone());
        self.jid = Some(jid.clone());
        self.state = C2sState::SessionStarted;
        self.run_hook_with(hook::C2S_STREAM_BINDED, Some(jid), None).await;
    }

    async fn on_stanza(&mut self, stanza: Stanza) -> Result<(), XmppError> {
        metrics::record_stanza(stanza.kind().as_str(), "inbound");
        if let Some(queue) = &self.sm {
            queue.lock().await.inc_in();
        }
        if self
            .run_hook(hook::C2S_STREAM_ELEMENT_RECEIVED, Some(stanza.element().clone()))
            .await
        {
            return Ok(());
        }

        if is_session_request(&stanza) {
            let reply = stanza.result_reply(None);
            return self.write_out(reply.into_element(), None).await;
        }
        if stanza.is_presence() && stanza.to().resource().is_none() {
            self.track_presence(&stanza);
        }

        if self
            .run_hook(hook::C2S_STREAM_WILL_ROUTE_ELEMENT, Some(stanza.element().clone()))
            .await
        {
            return Ok(());
        }
        self.ctx.router.route_or_bounce(stanza).await;
        Ok(())
    }

    /// Presence to the account itself updates the resource's priority.
    fn track_presence(&self, presence: &Stanza) {
        let Some(jid) = &self.jid else {
            return;
        };
        let to_self = presence.to().node().map(|n| n.as_str()) == jid.node().map(|n| n.as_str())
            && presence.to().domain().as_str() == jid.domain().as_str();
        if !to_self {
            return;
        }
        if presence.is_available_presence() {
            self.ctx
                .router
                .update_presence(jid, presence.presence_priority(), true);
        } else if presence.is_unavailable_presence() {
            self.ctx.router.update_presence(jid, 0, false);
        }
    }

    async fn reply_bad_stanza(
        &mut self,
        element: Element,
        condition: StanzaErrorCondition,
    ) -> Result<(), XmppError> {
        if element.attr("type") == Some("error") {
            return Ok(());
        }
        let mut element = without_attrs(&element, &["from"]);
        if let Some(jid) = &self.jid {
            element.set_attr("to", jid.to_string());
        }
        element.set_attr("type", "error");
        element.append_child(stanza_error_element(condition, condition.default_type(), None));
        self.write_out(element, None).await
    }

    async fn on_sm(&mut self, element: &Element) -> Result<(), XmppError> {
        let Some(manager) = self.ctx.sm.clone() else {
            let failed = sm::failed(StanzaErrorCondition::ServiceUnavailable.as_str(), None);
            return self.session.send(&failed).await;
        };
        match element.name() {
            "enable" => {
                let jid = match (&self.jid, &self.sm) {
                    (Some(jid), None) => jid.clone(),
                    _ => {
                        let failed = sm::failed("unexpected-request", None);
                        return self.session.send(&failed).await;
                    }
                };
                let queue = SmQueue::new(jid.clone(), manager.config().clone());
                let smid = sm::wants_resume(element).then(|| queue.smid());
                let queue = Arc::new(Mutex::new(queue));
                manager.register(queue.clone(), &jid, self.handle.clone());
                self.sm = Some(queue);
                let enabled = sm::enabled(smid.as_deref(), manager.config().hibernate_time);
                self.session.send(&enabled).await?;
                debug!(jid = %jid, resumable = smid.is_some(), "Stream management enabled");
            }
            "resume" => self.on_resume(element).await?,
            "r" => {
                if let Some(queue) = &self.sm {
                    let h = queue.lock().await.in_h();
                    self.session.send(&sm::ack(h)).await?;
                }
            }
            "a" => self.on_ack(element).await?,
            other => debug!(element = other, "Ignoring stream management element"),
        }
        Ok(())
    }

    async fn on_ack(&mut self, element: &Element) -> Result<(), XmppError> {
        let (Some(queue), Some(h)) = (self.sm.clone(), sm::parse_h(element)) else {
            return Ok(());
        };
        let resend = {
            let mut queue = queue.lock().await;
            if !sm::sequence_lte(h, queue.out_h()) {
                return Err(XmppError::Stream(
                    StreamError::new(StreamErrorCondition::UndefinedCondition)
                        .with_text("handled-count-too-high"),
                ));
            }
            queue.ack(h, Instant::now())
        };
        for element in resend {
            self.session.send(&element).await?;
        }
        Ok(())
    }

    async fn on_resume(&mut self, element: &Element) -> Result<(), XmppError> {
        let Some(manager) = self.ctx.sm.clone() else {
            return Ok(());
        };
        let (Some(previd), Some(h)) = (element.attr("previd"), sm::parse_h(element)) else {
            let failed = sm::failed(StanzaErrorCondition::BadRequest.as_str(), None);
            return self.session.send(&failed).await;
        };
        let owner = match (self.state, self.bare_jid()) {
            (C2sState::Authenticated, Some(owner)) => owner,
            _ => {
                let failed = sm::failed("unexpected-request", None);
                return self.session.send(&failed).await;
            }
        };

        let queue = match manager.resume(previd, &owner).await {
            Ok(queue) => queue,
            Err(err) => {
                debug!(error = %err, "Stream resumption failed");
                let failed = sm::failed(StanzaErrorCondition::ItemNotFound.as_str(), None);
                return self.session.send(&failed).await;
            }
        };
        let (jid, in_h, resend) = {
            let mut queue = queue.lock().await;
            let resend = queue.ack(h, Instant::now());
            (queue.jid().clone(), queue.in_h(), resend)
        };

        self.bind(jid.clone()).await;
        manager.register(queue.clone(), &jid, self.handle.clone());
        self.sm = Some(queue);
        self.session.send(&sm::resumed(previd, in_h)).await?;
        for element in resend {
            self.session.send(&element).await?;
        }
        info!(jid = %jid, "Stream resumed");
        Ok(())
    }

    async fn sm_timer(&self) -> Option<(Instant, SmTimer)> {
        let queue = self.sm.as_ref()?;
        let timer = queue.lock().await.next_timer();
        timer
    }

    async fn on_sm_timer(&mut self, timer: SmTimer) -> Result<(), XmppError> {
        match timer {
            SmTimer::RequestAck => self.request_ack().await,
            SmTimer::AckTimeout => {
                debug!("Acknowledgement timed out");
                Err(XmppError::Timeout)
            }
        }
    }

    async fn request_ack(&mut self) -> Result<(), XmppError> {
        if let Some(queue) = &self.sm {
            queue.lock().await.request_sent(Instant::now());
        }
        self.session.send(&sm::request()).await
    }

    /// Write an element bound for the client, tracking stanzas for
    /// acknowledgement when stream management is enabled.
    async fn write_out(&mut self, element: Element, flushed: Flushed) -> Result<(), XmppError> {
        let kind = StanzaKind::from_name(element.name());
        let mut request_due = false;
        if let (Some(queue), Some(_)) = (&self.sm, kind) {
            match queue.lock().await.push(element.clone(), Instant::now()) {
                Ok(due) => request_due = due,
                Err(full) => {
                    warn!(error = %full, "Stream management queue overflow");
                    if let Some(flushed) = flushed {
                        let _ = flushed.send(Err(XmppError::StreamClosed));
                    }
                    return Err(XmppError::stream(StreamErrorCondition::PolicyViolation));
                }
            }
        }

        let result = self.session.send(&element).await;
        if let Some(flushed) = flushed {
            let _ = flushed.send(match &result {
                Ok(()) => Ok(()),
                Err(_) => Err(XmppError::StreamClosed),
            });
        }
        result?;

        if let Some(kind) = kind {
            metrics::record_stanza(kind.as_str(), "outbound");
            self.run_hook(hook::C2S_STREAM_ELEMENT_SENT, Some(element)).await;
        }
        if request_due {
            self.request_ack().await?;
        }
        Ok(())
    }

    async fn run_hook(&self, name: &str, element: Option<Element>) -> bool {
        self.run_hook_with(name, self.jid.clone(), element).await
    }

    /// Run a hook; `true` when a handler halted the chain.
    async fn run_hook_with(&self, name: &str, jid: Option<Jid>, element: Option<Element>) -> bool {
        let info = HookInfo::C2sStream {
            id: self.id(),
            jid,
            element,
        };
        match self.ctx.hooks.run(name, info).await {
            Ok(halted) => halted,
            Err(err) => {
                warn!(hook = name, error = %err, "Hook failed");
                false
            }
        }
    }

    async fn terminate(mut self, exit: Exit) {
        let hibernate = matches!(exit, Exit::Close | Exit::Dropped);
        match &exit {
            Exit::Close | Exit::PeerClosed => {
                let _ = self.session.close().await;
            }
            Exit::Error(error) => {
                info!(condition = error.condition.as_str(), "Closing C2S stream with error");
                let _ = self.session.send_stream_error(error).await;
                if !self.ctx.config.disconnect_timeout.is_zero() {
                    tokio::time::sleep(self.ctx.config.disconnect_timeout).await;
                }
            }
            Exit::Dropped => {}
        }
        let _ = self.session.transport_mut().shutdown().await;

        if let Some(jid) = self.jid.clone() {
            // A stream replaced by a newer bind leaves the location record alone.
            let still_bound = self.ctx.router.unbind(&jid, self.id());
            let hibernated = hibernate && self.hibernate(&jid).await;
            if !hibernated {
                if let Some(manager) = &self.ctx.sm {
                    manager.unregister(&jid, self.id());
                }
                if let (true, Some(locator)) = (still_bound, &self.ctx.locator) {
                    if let Err(err) = locator.unregister(&jid).await {
                        warn!(jid = %jid, error = %err, "Failed to withdraw resource");
                    }
                }
            }
        }

        self.mailbox.finish();
        self.ctx.hub.unregister(self.id());
        metrics::record_connection_count(self.ctx.hub.len() as i64, "c2s");
        self.run_hook(hook::C2S_STREAM_TERMINATED, None).await;
        debug!(jid = ?self.jid, "C2S stream terminated");
    }

    /// Keep the queue for a later `<resume/>`.
    async fn hibernate(&self, jid: &Jid) -> bool {
        let (Some(manager), Some(queue)) = (&self.ctx.sm, &self.sm) else {
            return false;
        };
        queue.lock().await.hibernate();
        manager.hibernate(jid, self.id())
    }
}

fn is_bind_request(element: &Element) -> bool {
    element.is("iq", ns::CLIENT)
        && element.attr("type") == Some("set")
        && element.has_child("bind", ns::BIND)
}

fn is_session_request(stanza: &Stanza) -> bool {
    stanza.is_iq()
        && stanza.stanza_type() == Some("set")
        && stanza.to().resource().is_none()
        && stanza.element().has_child("session", ns::SESSION)
}

fn iq_error(id: &str, condition: StanzaErrorCondition) -> Element {
    Element::builder("iq", ns::CLIENT)
        .attr("type", "error")
        .attr("id", id)
        .append(stanza_error_element(condition, condition.default_type(), None))
        .build()
}
