//! XMPP Ping (XEP-0199).

use async_trait::async_trait;

use super::Module;
use crate::parser::ns;
use crate::stanza::Stanza;
use crate::XmppError;

/// Answers `<ping/>` requests with an empty result.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ping;

#[async_trait]
impl Module for Ping {
    fn name(&self) -> &str {
        "ping"
    }

    fn matches_namespace(&self, namespace: &str) -> bool {
        namespace == ns::PING
    }

    fn server_features(&self) -> Vec<String> {
        vec![ns::PING.to_string()]
    }

    fn account_features(&self) -> Vec<String> {
        vec![ns::PING.to_string()]
    }

    async fn process_iq(&self, iq: &Stanza) -> Result<Vec<Stanza>, XmppError> {
        if iq.stanza_type() != Some("get") {
            return Err(XmppError::bad_request(Some("ping must be an iq get".to_string())));
        }
        Ok(vec![iq.result_reply(None)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ping_set_is_rejected() {
        let iq = Stanza::from_element(
            "<iq xmlns='jabber:client' type='set' id='p2' from='ortuman@jackal.im/yard' to='jackal.im'><ping xmlns='urn:xmpp:ping'/></iq>"
                .parse()
                .unwrap(),
        )
        .unwrap();
        assert!(matches!(
            Ping.process_iq(&iq).await,
            Err(XmppError::Stanza { .. })
        ));
    }
}
