//! # howl-xmpp
//!
//! XMPP server node library: client and server streams, routing, stream
//! management and cluster membership.
//!
//! ## Architecture
//!
//! - **Parser / Session / Transport**: incremental XML parsing over TCP or
//!   TLS, stream headers, stanza address validation, rate limiting and zlib
//!   compression
//! - **Stream tasks**: every C2S, S2S and component connection runs as one
//!   task owning its session, addressed through a [`mailbox::StreamHandle`]
//! - **Router**: delivers stanzas to bound resources, components, local
//!   modules or the S2S out-provider
//! - **Cluster**: KV store with leases, memberlist and a resource locator
//!   used for stream resumption across nodes
//!
//! ## XEP Support
//!
//! - RFC 6120/6121 (XMPP Core/IM)
//! - XEP-0030 (Service Discovery, `disco#info`)
//! - XEP-0092 (Software Version)
//! - XEP-0114 (Component Protocol)
//! - XEP-0138 (Stream Compression)
//! - XEP-0198 (Stream Management)
//! - XEP-0199 (XMPP Ping)
//! - XEP-0220 (Server Dialback)
//! - XEP-0368 (Direct TLS)

pub mod auth;
pub mod c2s;
pub mod cluster;
pub mod component;
pub mod hook;
pub mod hosts;
pub mod hub;
pub mod mailbox;
pub mod metrics;
pub mod module;
pub mod parser;
pub mod repository;
pub mod router;
pub mod s2s;
pub mod server;
pub mod session;
pub mod stanza;
pub mod stream_management;
pub mod tls;
pub mod transport;

mod error;

pub use minidom::Element;
pub use error::{
    stanza_error_element, StanzaErrorCondition, StanzaErrorType, StreamError, StreamErrorCondition,
    XmppError,
};
pub use parser::ns;
pub use server::{ServerDeps, XmppServer, XmppServerConfig};
pub use stanza::Stanza;
