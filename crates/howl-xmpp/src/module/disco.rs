//! Service Discovery: disco#info (XEP-0030).
//!
//! Answers for the server entity with its identity and the features of
//! every loaded module, and for account entities with the account features.

use async_trait::async_trait;
use minidom::Element;
use tracing::debug;

use super::Module;
use crate::parser::ns;
use crate::stanza::Stanza;
use crate::XmppError;

/// Identity element of a disco#info response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub category: String,
    pub kind: String,
    pub name: Option<String>,
}

impl Identity {
    pub fn new(category: &str, kind: &str, name: Option<&str>) -> Self {
        Self {
            category: category.to_string(),
            kind: kind.to_string(),
            name: name.map(str::to_string),
        }
    }

    /// Server identity (category="server", type="im").
    pub fn server(name: &str) -> Self {
        Self::new("server", "im", Some(name))
    }

    /// Registered account identity (category="account", type="registered").
    pub fn account() -> Self {
        Self::new("account", "registered", None)
    }

    fn to_element(&self) -> Element {
        Element::builder("identity", ns::DISCO_INFO)
            .attr("category", self.category.clone())
            .attr("type", self.kind.clone())
            .attr("name", self.name.clone())
            .build()
    }
}

/// disco#info responder.
#[derive(Debug, Clone)]
pub struct DiscoInfo {
    identity: Identity,
    server_features: Vec<String>,
    account_features: Vec<String>,
}

impl DiscoInfo {
    pub fn new(identity: Identity, server_features: Vec<String>, account_features: Vec<String>) -> Self {
        Self {
            identity,
            server_features,
            account_features,
        }
    }
}

#[async_trait]
impl Module for DiscoInfo {
    fn name(&self) -> &str {
        "disco_info"
    }

    fn matches_namespace(&self, namespace: &str) -> bool {
        namespace == ns::DISCO_INFO
    }

    fn server_features(&self) -> Vec<String> {
        vec![ns::DISCO_INFO.to_string()]
    }

    fn account_features(&self) -> Vec<String> {
        vec![ns::DISCO_INFO.to_string()]
    }

    async fn process_iq(&self, iq: &Stanza) -> Result<Vec<Stanza>, XmppError> {
        if iq.stanza_type() != Some("get") {
            return Err(XmppError::bad_request(Some("disco#info must be IQ get".to_string())));
        }
        let node = iq
            .iq_payload()
            .and_then(|q| q.attr("node"))
            .map(str::to_string);
        if node.is_some() {
            return Err(XmppError::item_not_found(None));
        }

        let (identity, features) = if iq.to().node().is_some() {
            (Identity::account(), &self.account_features)
        } else {
            (self.identity.clone(), &self.server_features)
        };
        debug!(target = %iq.to(), "Answering disco#info");

        let mut vars: Vec<&str> = features.iter().map(String::as_str).collect();
        vars.push(ns::DISCO_INFO);
        vars.sort_unstable();
        vars.dedup();

        let query = Element::builder("query", ns::DISCO_INFO)
            .append(identity.to_element())
            .append_all(
                vars.into_iter()
                    .map(|var| Element::builder("feature", ns::DISCO_INFO).attr("var", var).build()),
            )
            .build();
        Ok(vec![iq.result_reply(Some(query))])
    }
}
