//! XEP-0198: Stream Management.
//!
//! Stream management lets a client detect lost stanzas and resume a broken
//! stream without losing the stanzas that were in flight:
//!
//! - `<enable/>` / `<enabled/>` turn it on and hand out a resumption id
//! - `<r/>` asks the peer for its count of handled stanzas
//! - `<a h='N'/>` acknowledges everything up to `N`
//! - `<resume/>` / `<resumed/>` reattach a new connection to a hibernated
//!   queue, possibly owned by another cluster node
//!
//! The per-stream state lives in [`SmQueue`]; hibernated and active queues
//! are indexed by full JID in the [`SmManager`].

mod manager;
mod queue;

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use jid::Jid;
use minidom::Element;

use crate::parser::ns;

pub use manager::{
    LocalQueueTransfer, QueueTransfer, ResumeError, SharedQueue, SmManager, DEFAULT_RESUME_TAKEOVER_TIMEOUT,
};
pub use queue::{inc_h, sequence_lte, SmQueue, SmQueueFull, SmSnapshot, SmTimer, NONCE_LENGTH, REQUEST_ACK_EVERY};

/// Stream management timings and limits.
#[derive(Debug, Clone)]
pub struct SmConfig {
    /// How long a detached queue waits for a `<resume/>`.
    pub hibernate_time: Duration,
    /// Idle time after which the server asks for an acknowledgement.
    pub request_ack_interval: Duration,
    /// How long an `<r/>` may stay unanswered.
    pub wait_for_ack_timeout: Duration,
    /// Unacknowledged stanzas tolerated before the stream is closed.
    pub max_queue_size: usize,
}

impl Default for SmConfig {
    fn default() -> Self {
        Self {
            hibernate_time: Duration::from_secs(180),
            request_ack_interval: Duration::from_secs(60),
            wait_for_ack_timeout: Duration::from_secs(30),
            max_queue_size: 250,
        }
    }
}

/// Encode a resumption id: base64 of `<full-jid>\0<nonce>`.
pub fn encode_smid(jid: &Jid, nonce: &[u8]) -> String {
    let jid = jid.to_string();
    let mut raw = Vec::with_capacity(jid.len() + 1 + nonce.len());
    raw.extend_from_slice(jid.as_bytes());
    raw.push(0);
    raw.extend_from_slice(nonce);
    BASE64.encode(raw)
}

/// Decode a resumption id into its full JID and nonce.
pub fn decode_smid(smid: &str) -> Option<(Jid, Vec<u8>)> {
    let raw = BASE64.decode(smid).ok()?;
    let sep = raw.iter().position(|b| *b == 0)?;
    let jid = std::str::from_utf8(&raw[..sep]).ok()?;
    let jid = Jid::new(jid).ok()?;
    jid.resource()?;
    Some((jid, raw[sep + 1..].to_vec()))
}

/// Whether `element` belongs to the stream management namespace.
pub fn is_sm_element(element: &Element) -> bool {
    element.ns() == ns::SM
}

/// `<sm xmlns='urn:xmpp:sm:3'/>` stream feature.
pub fn feature() -> Element {
    Element::builder("sm", ns::SM).build()
}

/// `<enabled/>`; `id` and `max` are set when resumption was granted.
pub fn enabled(smid: Option<&str>, max: Duration) -> Element {
    let builder = Element::builder("enabled", ns::SM);
    match smid {
        Some(id) => builder
            .attr("id", id)
            .attr("resume", "true")
            .attr("max", max.as_secs().to_string())
            .build(),
        None => builder.build(),
    }
}

pub fn resumed(previd: &str, h: u32) -> Element {
    Element::builder("resumed", ns::SM)
        .attr("previd", previd)
        .attr("h", h.to_string())
        .build()
}

/// `<failed/>` carrying a stanza error condition.
pub fn failed(condition: &str, h: Option<u32>) -> Element {
    Element::builder("failed", ns::SM)
        .attr("h", h.map(|h| h.to_string()))
        .append(Element::builder(condition, ns::STANZAS))
        .build()
}

pub fn request() -> Element {
    Element::builder("r", ns::SM).build()
}

pub fn ack(h: u32) -> Element {
    Element::builder("a", ns::SM).attr("h", h.to_string()).build()
}

/// The `h` attribute of an `<a/>` or `<resume/>`.
pub fn parse_h(element: &Element) -> Option<u32> {
    element.attr("h")?.parse().ok()
}

/// Whether an `<enable/>` asks for resumption.
pub fn wants_resume(element: &Element) -> bool {
    matches!(element.attr("resume"), Some("true") | Some("1"))
}
