//! Client-to-Server (C2S) streams.
//!
//! Each accepted connection runs as one task owning its [`Session`] and
//! [`Mailbox`](crate::mailbox::Mailbox). The task negotiates TLS, SASL,
//! compression and resource binding, then routes the client's stanzas and
//! writes whatever the router delivers to its mailbox.

mod listener;
mod stream;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio_rustls::TlsAcceptor;

use crate::auth::SaslConfig;
use crate::cluster::ResourceLocator;
use crate::hook::Hooks;
use crate::hosts::Hosts;
use crate::hub::StreamHub;
use crate::repository::UserRepository;
use crate::router::Router;
use crate::session::{Session, SessionConfig, SessionKind};
use crate::stream_management::SmManager;
use crate::transport::Transport;
use crate::XmppError;

pub use listener::C2sListener;
pub use stream::C2sState;

/// What happens when a client binds a resource that is already bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResourceConflict {
    /// Answer the bind request with `conflict`.
    Reject,
    /// Disconnect the existing stream with `conflict` and bind the new one.
    #[default]
    Override,
}

impl FromStr for ResourceConflict {
    type Err = XmppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reject" => Ok(Self::Reject),
            "override" => Ok(Self::Override),
            other => Err(XmppError::config(format!(
                "unknown resource conflict policy '{other}'"
            ))),
        }
    }
}

/// C2S listener settings.
#[derive(Debug, Clone)]
pub struct C2sConfig {
    /// Time allowed for the client's first stream header.
    pub connect_timeout: Duration,
    /// Idle time after which the stream is closed with `connection-timeout`.
    pub keep_alive_timeout: Duration,
    /// Bound on a single transport write.
    pub request_timeout: Duration,
    pub max_stanza_size: usize,
    /// Negotiate TLS before the stream header (XEP-0368).
    pub direct_tls: bool,
    /// Read rate in bytes per second; zero disables limiting.
    pub rate_limit: u32,
    /// Extra bytes a reader may consume in a burst.
    pub rate_limit_burst: u32,
    /// Offer XEP-0138 zlib compression.
    pub compression: bool,
    pub resource_conflict: ResourceConflict,
    pub sasl: SaslConfig,
    /// Delay between a stream error and closing the socket.
    pub disconnect_timeout: Duration,
    pub log_stanzas: bool,
}

impl Default for C2sConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            keep_alive_timeout: Duration::from_secs(600),
            request_timeout: Duration::from_secs(15),
            max_stanza_size: 32 * 1024,
            direct_tls: false,
            rate_limit: 0,
            rate_limit_burst: 0,
            compression: false,
            resource_conflict: ResourceConflict::default(),
            sasl: SaslConfig::default(),
            disconnect_timeout: Duration::ZERO,
            log_stanzas: false,
        }
    }
}

/// Shared dependencies of every C2S stream.
pub struct C2sContext {
    pub config: C2sConfig,
    pub hosts: Arc<Hosts>,
    pub router: Arc<Router>,
    pub users: Arc<dyn UserRepository>,
    pub hooks: Arc<Hooks>,
    pub hub: Arc<StreamHub>,
    /// STARTTLS is offered and required when set.
    pub tls: Option<TlsAcceptor>,
    /// Enables XEP-0198 when set.
    pub sm: Option<Arc<SmManager>>,
    /// Publishes bound resources to the cluster when set.
    pub locator: Option<ResourceLocator>,
}

impl C2sContext {
    /// Run an accepted connection to completion.
    pub async fn serve(self: Arc<Self>, transport: Transport) {
        let mut transport = transport.with_write_timeout(self.config.request_timeout);
        if self.config.rate_limit > 0 {
            transport = transport.with_rate_limit(self.config.rate_limit, self.config.rate_limit_burst);
        }
        let session = Session::new(
            transport,
            self.hosts.clone(),
            SessionConfig {
                kind: SessionKind::C2s,
                incoming: true,
                max_stanza_size: self.config.max_stanza_size,
                log_stanzas: self.config.log_stanzas,
            },
        );
        stream::C2sStream::new(self, session).run().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_conflict_parse() {
        assert_eq!("reject".parse::<ResourceConflict>().unwrap(), ResourceConflict::Reject);
        assert_eq!("override".parse::<ResourceConflict>().unwrap(), ResourceConflict::Override);
        assert!("replace".parse::<ResourceConflict>().is_err());
    }

    #[test]
    fn test_default_config() {
        let config = C2sConfig::default();
        assert_eq!(config.max_stanza_size, 32768);
        assert_eq!(config.resource_conflict, ResourceConflict::Override);
        assert!(!config.sasl.digest_md5_enabled);
    }
}
