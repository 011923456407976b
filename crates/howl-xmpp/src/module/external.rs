//! Out-of-process modules.
//!
//! An [`ExternalModule`] forwards every claimed iq over a channel to a
//! handler living elsewhere (another task, or an RPC bridge) and waits a
//! bounded time for the stanzas it wants routed in response.

use std::time::Duration;

use async_trait::async_trait;
use minidom::Element;
use tokio::sync::{mpsc, oneshot};
use tracing::{instrument, warn};

use super::Module;
use crate::stanza::Stanza;
use crate::XmppError;

/// Default time an external handler has to answer.
pub const DEFAULT_EXTERNAL_TIMEOUT: Duration = Duration::from_secs(5);

/// One forwarded request.
#[derive(Debug)]
pub struct ExternalRequest {
    pub iq: Stanza,
    /// Stanzas to route back; dropping it without answering fails the iq.
    pub reply: oneshot::Sender<Vec<Stanza>>,
}

/// Module whose logic runs outside this process.
pub struct ExternalModule {
    name: String,
    namespaces: Vec<String>,
    server_features: Vec<String>,
    account_features: Vec<String>,
    stream_feature: Option<Element>,
    timeout: Duration,
    tx: mpsc::Sender<ExternalRequest>,
}

impl ExternalModule {
    /// Create the module and the receiver its handler consumes.
    pub fn new(
        name: impl Into<String>,
        namespaces: Vec<String>,
        timeout: Duration,
    ) -> (Self, mpsc::Receiver<ExternalRequest>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Self {
                name: name.into(),
                namespaces,
                server_features: Vec::new(),
                account_features: Vec::new(),
                stream_feature: None,
                timeout,
                tx,
            },
            rx,
        )
    }

    pub fn with_server_features(mut self, features: Vec<String>) -> Self {
        self.server_features = features;
        self
    }

    pub fn with_account_features(mut self, features: Vec<String>) -> Self {
        self.account_features = features;
        self
    }

    pub fn with_stream_feature(mut self, feature: Element) -> Self {
        self.stream_feature = Some(feature);
        self
    }
}

#[async_trait]
impl Module for ExternalModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn matches_namespace(&self, namespace: &str) -> bool {
        self.namespaces.iter().any(|n| n == namespace)
    }

    fn server_features(&self) -> Vec<String> {
        self.server_features.clone()
    }

    fn account_features(&self) -> Vec<String> {
        self.account_features.clone()
    }

    fn stream_feature(&self) -> Option<Element> {
        self.stream_feature.clone()
    }

    #[instrument(skip(self, iq), fields(module = %self.name), name = "xmpp.modules.external")]
    async fn process_iq(&self, iq: &Stanza) -> Result<Vec<Stanza>, XmppError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = ExternalRequest {
            iq: iq.clone(),
            reply: reply_tx,
        };
        self.tx
            .send(request)
            .await
            .map_err(|_| XmppError::service_unavailable(Some("module unavailable".to_string())))?;

        match tokio::time::timeout(self.timeout, reply_rx).await {
            Ok(Ok(stanzas)) => Ok(stanzas),
            Ok(Err(_)) => Err(XmppError::internal("external module dropped the request")),
            Err(_) => {
                warn!(timeout = ?self.timeout, "External module timed out");
                Err(XmppError::Timeout)
            }
        }
    }
}
