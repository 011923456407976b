//! Software Version (XEP-0092).

use async_trait::async_trait;
use minidom::Element;
use xmpp_parsers::version::VersionResult;

use super::Module;
use crate::parser::ns;
use crate::stanza::Stanza;
use crate::XmppError;

/// Reports the server name, version and operating system.
#[derive(Debug, Clone)]
pub struct Version {
    name: String,
    version: String,
    os: String,
}

impl Version {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            os: std::env::consts::OS.to_string(),
        }
    }
}

#[async_trait]
impl Module for Version {
    fn name(&self) -> &str {
        "version"
    }

    fn matches_namespace(&self, namespace: &str) -> bool {
        namespace == ns::VERSION
    }

    fn server_features(&self) -> Vec<String> {
        vec![ns::VERSION.to_string()]
    }

    async fn process_iq(&self, iq: &Stanza) -> Result<Vec<Stanza>, XmppError> {
        if iq.stanza_type() != Some("get") {
            return Err(XmppError::bad_request(None));
        }
        // Only the server entity has a version; accounts are answered by their clients.
        if iq.to().node().is_some() {
            return Err(XmppError::service_unavailable(None));
        }
        let query = VersionResult {
            name: self.name.clone(),
            version: self.version.clone(),
            os: Some(self.os.clone()),
        };
        Ok(vec![iq.result_reply(Some(Element::from(query)))])
    }
}
