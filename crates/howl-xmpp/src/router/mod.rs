//! Stanza routing.
//!
//! The router delivers a validated stanza to one of:
//!
//! 1. a connected external component serving the target domain,
//! 2. the local modules, for requests addressed to the server or to an
//!    account on behalf of its owner,
//! 3. the streams bound to a local account,
//! 4. the S2S out-provider for any other domain.

mod resources;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use jid::Jid;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::error::StanzaErrorCondition;
use crate::hosts::Hosts;
use crate::mailbox::{StreamHandle, StreamId};
use crate::metrics;
use crate::module::Modules;
use crate::repository::UserRepository;
use crate::stanza::{Stanza, StanzaKind};
use crate::XmppError;

pub use resources::{BoundResource, ResourceTable};

/// Why a stanza could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    /// The account exists but the addressed resource is not bound here.
    #[error("resource not found")]
    ResourceNotFound,

    #[error("account does not exist")]
    NotExistingAccount,

    #[error("remote server not found")]
    RemoteServerNotFound,

    #[error("remote server timeout")]
    RemoteServerTimeout,

    /// Every target stream had a full mailbox.
    #[error("recipient mailbox full")]
    ResourceConstraint,

    /// Nobody can handle the stanza (e.g. S2S disabled).
    #[error("service unavailable")]
    ServiceUnavailable,

    #[error("routing failed: {0}")]
    Internal(String),
}

impl RouteError {
    /// Stanza error condition reported back to the sender.
    pub fn condition(&self) -> StanzaErrorCondition {
        match self {
            Self::ResourceNotFound | Self::NotExistingAccount | Self::ServiceUnavailable => {
                StanzaErrorCondition::ServiceUnavailable
            }
            Self::RemoteServerNotFound => StanzaErrorCondition::RemoteServerNotFound,
            Self::RemoteServerTimeout => StanzaErrorCondition::RemoteServerTimeout,
            Self::ResourceConstraint => StanzaErrorCondition::ResourceConstraint,
            Self::Internal(_) => StanzaErrorCondition::InternalServerError,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::ResourceNotFound => "resource_not_found",
            Self::NotExistingAccount => "not_existing_account",
            Self::RemoteServerNotFound => "remote_server_not_found",
            Self::RemoteServerTimeout => "remote_server_timeout",
            Self::ResourceConstraint => "resource_constraint",
            Self::ServiceUnavailable => "service_unavailable",
            Self::Internal(_) => "internal",
        }
    }
}

/// Delivery to other domains.
#[async_trait]
pub trait RemoteRouter: Send + Sync {
    /// Deliver `stanza` from local domain `sender` to remote domain `target`.
    async fn route(&self, stanza: Stanza, sender: &str, target: &str) -> Result<(), RouteError>;
}

/// Node-wide stanza router.
pub struct Router {
    hosts: Arc<Hosts>,
    users: Arc<dyn UserRepository>,
    modules: Modules,
    resources: ResourceTable,
    components: DashMap<String, StreamHandle>,
    remote: Option<Arc<dyn RemoteRouter>>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("default_host", &self.hosts.default_host())
            .field("resources", &self.resources.len())
            .field("components", &self.components.len())
            .field("remote", &self.remote.is_some())
            .finish()
    }
}

impl Router {
    pub fn new(
        hosts: Arc<Hosts>,
        users: Arc<dyn UserRepository>,
        modules: Modules,
        remote: Option<Arc<dyn RemoteRouter>>,
    ) -> Self {
        Self {
            hosts,
            users,
            modules,
            resources: ResourceTable::new(),
            components: DashMap::new(),
            remote,
        }
    }

    pub fn hosts(&self) -> &Arc<Hosts> {
        &self.hosts
    }

    pub fn modules(&self) -> &Modules {
        &self.modules
    }

    pub fn resources(&self) -> &ResourceTable {
        &self.resources
    }

    /// Bind a full JID; returns the stream previously bound to it.
    pub fn bind(&self, jid: Jid, handle: StreamHandle) -> Option<StreamHandle> {
        self.resources.bind(jid, handle)
    }

    pub fn unbind(&self, jid: &Jid, stream: StreamId) -> bool {
        self.resources.unbind(jid, stream)
    }

    pub fn update_presence(&self, jid: &Jid, priority: i8, available: bool) {
        self.resources.update_presence(jid, priority, available);
    }

    /// Attach an external component to `domain`.
    pub fn register_component(&self, domain: &str, handle: StreamHandle) -> bool {
        match self.components.entry(domain.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(handle);
                true
            }
        }
    }

    pub fn unregister_component(&self, domain: &str, stream: StreamId) {
        self.components.remove_if(domain, |_, handle| handle.id() == stream);
    }

    pub fn is_component_domain(&self, domain: &str) -> bool {
        self.components.contains_key(domain)
    }

    /// Route a stanza, handling requests addressed to the server itself.
    #[instrument(
        skip(self, stanza),
        fields(kind = stanza.kind().as_str(), to = %stanza.to()),
        name = "xmpp.router.route"
    )]
    pub async fn route(&self, stanza: Stanza) -> Result<(), RouteError> {
        let result = self.dispatch(stanza).await;
        match &result {
            Ok(()) => metrics::record_route("delivered"),
            Err(err) => metrics::record_route(err.label()),
        }
        result
    }

    /// Route a stanza; an undeliverable message or iq request is answered
    /// with an error on behalf of its recipient.
    pub async fn route_or_bounce(&self, stanza: Stanza) {
        let bounce = should_bounce(&stanza).then(|| stanza.clone());
        let Err(err) = self.route(stanza).await else {
            return;
        };
        debug!(error = %err, "Stanza not delivered");
        if let Some(original) = bounce {
            let reply = original.error_reply(err.condition());
            if let Err(err) = self.route(reply).await {
                debug!(error = %err, "Failed to deliver bounce");
            }
        }
    }

    async fn dispatch(&self, stanza: Stanza) -> Result<(), RouteError> {
        let domain = stanza.to().domain().as_str().to_string();

        if let Some(component) = self.components.get(&domain).map(|c| c.clone()) {
            return component
                .deliver(stanza.into_element())
                .map_err(|err| undelivered(err, RouteError::ServiceUnavailable));
        }

        if !self.hosts.is_local_host(&domain) {
            return self.route_remote(stanza, &domain).await;
        }

        if stanza.to().resource().is_none() && stanza.is_iq_request() {
            return self.process_server_iq(&stanza).await;
        }
        if stanza.to().node().is_none() {
            // Other stanzas addressed to the server are consumed by it.
            debug!("Dropping stanza addressed to the server");
            return Ok(());
        }
        self.route_local(stanza).await
    }

    /// Answer an iq addressed to the server or to a bare account JID.
    async fn process_server_iq(&self, iq: &Stanza) -> Result<(), RouteError> {
        if let Some(node) = iq.to().node() {
            if !self.account_exists(node.as_str()).await? {
                return Err(RouteError::NotExistingAccount);
            }
        }
        for reply in self.modules.process_iq(iq).await {
            if let Err(err) = self.deliver_reply(reply).await {
                debug!(error = %err, "Failed to deliver module reply");
            }
        }
        Ok(())
    }

    /// Replies are results or errors, which never reach the modules again.
    async fn deliver_reply(&self, reply: Stanza) -> Result<(), RouteError> {
        let domain = reply.to().domain().as_str().to_string();
        if let Some(component) = self.components.get(&domain).map(|c| c.clone()) {
            return component
                .deliver(reply.into_element())
                .map_err(|err| undelivered(err, RouteError::ServiceUnavailable));
        }
        if !self.hosts.is_local_host(&domain) {
            return self.route_remote(reply, &domain).await;
        }
        if reply.to().node().is_none() {
            return Ok(());
        }
        self.route_local(reply).await
    }

    /// Deliver to the streams bound to a local account.
    pub async fn route_local(&self, stanza: Stanza) -> Result<(), RouteError> {
        let node = stanza
            .to()
            .node()
            .map(|n| n.as_str().to_string())
            .ok_or(RouteError::ServiceUnavailable)?;
        let resources = self.resources.resources(&node);
        if resources.is_empty() {
            return Err(if self.account_exists(&node).await? {
                RouteError::ResourceNotFound
            } else {
                RouteError::NotExistingAccount
            });
        }

        let targets: Vec<BoundResource> = match stanza.to().resource() {
            Some(resource) => {
                let target = resources
                    .into_iter()
                    .find(|r| r.resource() == resource.as_str())
                    .ok_or(RouteError::ResourceNotFound)?;
                vec![target]
            }
            None if stanza.is_message() => self
                .resources
                .highest_priority(&node)
                .into_iter()
                .collect(),
            None => resources,
        };

        let mut delivered = 0;
        let mut full = false;
        let element = stanza.into_element();
        for target in targets {
            match target.handle.deliver(element.clone()) {
                Ok(()) => delivered += 1,
                Err(XmppError::MailboxFull) => {
                    warn!(jid = %target.jid, "Dropping stanza for a stream with a full mailbox");
                    full = true;
                }
                Err(_) => debug!(jid = %target.jid, "Resource went away during delivery"),
            }
        }
        match (delivered, full) {
            (0, true) => Err(RouteError::ResourceConstraint),
            (0, false) => Err(RouteError::ResourceNotFound),
            _ => Ok(()),
        }
    }

    async fn route_remote(&self, stanza: Stanza, target: &str) -> Result<(), RouteError> {
        let Some(remote) = &self.remote else {
            debug!(domain = target, "S2S disabled, cannot route to remote domain");
            return Err(RouteError::RemoteServerNotFound);
        };
        let from_domain = stanza.from().domain().as_str();
        let sender = if self.hosts.is_local_host(from_domain) {
            from_domain.to_string()
        } else {
            self.hosts.default_host().to_string()
        };
        remote.route(stanza, &sender, target).await
    }

    async fn account_exists(&self, node: &str) -> Result<bool, RouteError> {
        self.users.user_exists(node).await.map_err(|err| {
            warn!(error = %err, "User lookup failed while routing");
            RouteError::Internal(err.to_string())
        })
    }
}

fn undelivered(err: XmppError, gone: RouteError) -> RouteError {
    match err {
        XmppError::MailboxFull => RouteError::ResourceConstraint,
        _ => gone,
    }
}

fn should_bounce(stanza: &Stanza) -> bool {
    match stanza.kind() {
        StanzaKind::Message => stanza.stanza_type() != Some("error"),
        StanzaKind::Iq => stanza.is_iq_request(),
        StanzaKind::Presence => false,
    }
}
