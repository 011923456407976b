//! Server-to-Server (S2S) federation.
//!
//! - [`in_stream`]: streams opened by remote servers, authorized through
//!   SASL EXTERNAL or dialback, tracked by a [`StreamHub`](crate::hub::StreamHub)
//! - [`out_stream`]: streams we open, one per `(sender, target)` pair
//! - [`OutProvider`]: coalesces demand for out-streams and routes stanzas
//!   to remote domains
//! - [`dialback`]: key derivation and `jabber:server:dialback` elements
//! - [`dns`]: SRV discovery (`_xmpps-server._tcp`, then `_xmpp-server._tcp`)

pub mod dialback;
mod dialer;
pub mod dns;
pub mod in_stream;
mod listener;
pub mod out_provider;
pub mod out_stream;

use std::time::Duration;

use thiserror::Error;

use crate::router::RouteError;
use crate::XmppError;

pub use dialback::{dialback_key, DialbackResult, DialbackVerifier};
pub use dialer::S2sDialer;
pub use dns::{DnsError, ResolvedTarget, SrvResolver, DEFAULT_S2S_PORT};
pub use in_stream::InStreamContext;
pub use listener::S2sListener;
pub use out_provider::OutProvider;
pub use out_stream::{OutStream, OutStreamFactory};

/// KV namespace of pending dialback requests: `dialback-req://<stream-id>`
/// → `<sender> <target>`.
pub const DIALBACK_REQ_KEY_PREFIX: &str = "dialback-req://";

/// Settings shared by incoming and outgoing S2S streams.
#[derive(Debug, Clone)]
pub struct S2sConfig {
    /// Shared by every node of the cluster.
    pub dialback_secret: String,
    pub dial_timeout: Duration,
    /// Time allowed for the peer's stream header.
    pub connect_timeout: Duration,
    /// Idle time after which a stream is closed.
    pub keep_alive_timeout: Duration,
    /// Bound on a dialback verification round trip.
    pub request_timeout: Duration,
    pub max_stanza_size: usize,
    pub log_stanzas: bool,
}

impl Default for S2sConfig {
    fn default() -> Self {
        Self {
            dialback_secret: String::new(),
            dial_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(5),
            keep_alive_timeout: Duration::from_secs(600),
            request_timeout: Duration::from_secs(15),
            max_stanza_size: 131_072,
            log_stanzas: false,
        }
    }
}

pub(crate) fn dialback_req_key(stream_id: &str) -> String {
    format!("{DIALBACK_REQ_KEY_PREFIX}{stream_id}")
}

/// Failures establishing or using an S2S stream.
#[derive(Debug, Error)]
pub enum S2sError {
    #[error(transparent)]
    Dns(#[from] DnsError),

    #[error("could not connect to {0}")]
    Unreachable(String),

    #[error("timed out connecting to {0}")]
    Timeout(String),

    #[error("peer rejected authentication")]
    NotAuthorized,

    #[error(transparent)]
    Xmpp(#[from] XmppError),
}

impl S2sError {
    /// Stanza-level outcome reported to the router.
    pub fn to_route_error(&self) -> RouteError {
        match self {
            Self::Timeout(_) | Self::Xmpp(XmppError::Timeout) => RouteError::RemoteServerTimeout,
            _ => RouteError::RemoteServerNotFound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_error_mapping() {
        assert_eq!(
            S2sError::Timeout("jabber.org".into()).to_route_error(),
            RouteError::RemoteServerTimeout
        );
        assert_eq!(
            S2sError::Unreachable("jabber.org".into()).to_route_error(),
            RouteError::RemoteServerNotFound
        );
        assert_eq!(
            S2sError::Dns(DnsError::NoRecords("jabber.org".into())).to_route_error(),
            RouteError::RemoteServerNotFound
        );
    }

    #[test]
    fn test_dialback_req_key() {
        assert_eq!(dialback_req_key("abc"), "dialback-req://abc");
    }
}
