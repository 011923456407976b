//! IQ module registry.
//!
//! Modules claim IQ payload namespaces and answer the requests addressed to
//! the server or to an account on behalf of its owner. The registry matches
//! the first namespaced child of every request against each module.

mod disco;
mod external;
mod ping;
mod version;

use std::sync::Arc;

use async_trait::async_trait;
use minidom::Element;
use tracing::{debug, instrument, warn};

use crate::error::{StanzaErrorCondition, StanzaErrorType};
use crate::stanza::Stanza;
use crate::XmppError;

pub use disco::{DiscoInfo, Identity};
pub use external::{ExternalModule, ExternalRequest, DEFAULT_EXTERNAL_TIMEOUT};
pub use ping::Ping;
pub use version::Version;

/// A pluggable IQ handler.
#[async_trait]
pub trait Module: Send + Sync {
    fn name(&self) -> &str;

    /// Whether requests with a payload in `namespace` belong to this module.
    fn matches_namespace(&self, namespace: &str) -> bool;

    /// Features advertised for the server entity.
    fn server_features(&self) -> Vec<String> {
        Vec::new()
    }

    /// Features advertised for account entities.
    fn account_features(&self) -> Vec<String> {
        Vec::new()
    }

    /// Element added to the post-bind stream features.
    fn stream_feature(&self) -> Option<Element> {
        None
    }

    /// Handle a request. Returned stanzas are routed by the caller.
    async fn process_iq(&self, iq: &Stanza) -> Result<Vec<Stanza>, XmppError>;
}

/// The set of modules loaded on a node.
#[derive(Clone, Default)]
pub struct Modules {
    modules: Vec<Arc<dyn Module>>,
}

impl std::fmt::Debug for Modules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.modules.iter().map(|m| m.name().to_string()))
            .finish()
    }
}

impl Modules {
    pub fn builder() -> ModulesBuilder {
        ModulesBuilder::default()
    }

    /// The built-in modules: ping, software version and service discovery.
    pub fn with_defaults(server_name: &str, version: &str) -> Self {
        Self::builder()
            .module(Arc::new(Ping))
            .module(Arc::new(Version::new(server_name, version)))
            .build(Identity::server(server_name))
    }

    pub fn names(&self) -> Vec<&str> {
        self.modules.iter().map(|m| m.name()).collect()
    }

    /// Whether some module handles this iq request.
    pub fn is_module_iq(&self, iq: &Stanza) -> bool {
        self.find(iq).is_some()
    }

    pub fn server_features(&self) -> Vec<String> {
        self.modules.iter().flat_map(|m| m.server_features()).collect()
    }

    pub fn account_features(&self) -> Vec<String> {
        self.modules.iter().flat_map(|m| m.account_features()).collect()
    }

    pub fn stream_features(&self) -> Vec<Element> {
        self.modules.iter().filter_map(|m| m.stream_feature()).collect()
    }

    /// Dispatch an iq to its module.
    ///
    /// Module failures become an error reply to the sender; an iq nobody
    /// claims is answered with `service-unavailable`.
    #[instrument(skip(self, iq), fields(id = ?iq.id()), name = "xmpp.modules.process_iq")]
    pub async fn process_iq(&self, iq: &Stanza) -> Vec<Stanza> {
        let Some(module) = self.find(iq) else {
            return vec![iq.error_reply(StanzaErrorCondition::ServiceUnavailable)];
        };
        debug!(module = module.name(), "Dispatching iq");
        match module.process_iq(iq).await {
            Ok(replies) => replies,
            Err(XmppError::Stanza {
                condition,
                error_type,
                text,
            }) => vec![iq.error_reply_with(condition, error_type, text.as_deref())],
            Err(XmppError::Timeout) => vec![iq.error_reply_with(
                StanzaErrorCondition::RemoteServerTimeout,
                StanzaErrorType::Wait,
                None,
            )],
            Err(err) => {
                warn!(module = module.name(), error = %err, "Module failed to process iq");
                vec![iq.error_reply(StanzaErrorCondition::InternalServerError)]
            }
        }
    }

    fn find(&self, iq: &Stanza) -> Option<&Arc<dyn Module>> {
        if !iq.is_iq_request() {
            return None;
        }
        let namespace = iq.iq_payload()?.ns();
        self.modules.iter().find(|m| m.matches_namespace(&namespace))
    }
}

/// Collects modules; [`ModulesBuilder::build`] adds service discovery over
/// everything collected.
#[derive(Default)]
pub struct ModulesBuilder {
    modules: Vec<Arc<dyn Module>>,
}

impl ModulesBuilder {
    pub fn module(mut self, module: Arc<dyn Module>) -> Self {
        self.modules.push(module);
        self
    }

    pub fn build(mut self, identity: Identity) -> Modules {
        let mut server_features: Vec<String> =
            self.modules.iter().flat_map(|m| m.server_features()).collect();
        let mut account_features: Vec<String> =
            self.modules.iter().flat_map(|m| m.account_features()).collect();
        server_features.sort();
        server_features.dedup();
        account_features.sort();
        account_features.dedup();

        self.modules.push(Arc::new(DiscoInfo::new(
            identity,
            server_features,
            account_features,
        )));
        Modules {
            modules: self.modules,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ns;

    fn iq(xml: &str) -> Stanza {
        Stanza::from_element(xml.parse().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_by_namespace() {
        let modules = Modules::with_defaults("howl", "0.1.0");
        assert_eq!(modules.names(), vec!["ping", "version", "disco_info"]);

        let ping = iq("<iq xmlns='jabber:client' type='get' id='p1' from='ortuman@jackal.im/yard' to='jackal.im'>\
                       <ping xmlns='urn:xmpp:ping'/></iq>");
        assert!(modules.is_module_iq(&ping));
        let replies = modules.process_iq(&ping).await;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].stanza_type(), Some("result"));
        assert_eq!(replies[0].id(), Some("p1"));
        assert_eq!(replies[0].to().to_string(), "ortuman@jackal.im/yard");
    }

    #[tokio::test]
    async fn test_unclaimed_iq() {
        let modules = Modules::with_defaults("howl", "0.1.0");
        let roster = iq("<iq xmlns='jabber:client' type='get' id='r1' from='ortuman@jackal.im/yard' to='jackal.im'>\
                         <query xmlns='jabber:iq:roster'/></iq>");
        assert!(!modules.is_module_iq(&roster));

        let replies = modules.process_iq(&roster).await;
        let error = replies[0].element().get_child("error", ns::CLIENT).unwrap();
        assert!(error.has_child("service-unavailable", ns::STANZAS));

        // Results are never dispatched
        let result = iq("<iq xmlns='jabber:client' type='result' id='p1' from='ortuman@jackal.im/yard' to='jackal.im'>\
                         <ping xmlns='urn:xmpp:ping'/></iq>");
        assert!(!modules.is_module_iq(&result));
    }

    #[test]
    fn test_features_aggregate() {
        let modules = Modules::with_defaults("howl", "0.1.0");
        let features = modules.server_features();
        assert!(features.contains(&ns::PING.to_string()));
        assert!(features.contains(&ns::VERSION.to_string()));
        assert!(features.contains(&ns::DISCO_INFO.to_string()));
    }
}
