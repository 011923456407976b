//! Server Dialback (XEP-0220).
//!
//! 1. The originating server sends `<db:result>` carrying a key
//! 2. The receiving server connects back to the originating domain's
//!    authoritative server and sends `<db:verify>` with the same key
//! 3. The authoritative server answers the verify `valid` or `invalid`
//! 4. The receiving server answers the original `<db:result>`
//!
//! Keys are derived from a secret every node of the cluster shares, so any
//! node can answer a verify for a key another node issued:
//!
//! ```text
//! key = HEX(HMAC-SHA256(HMAC-SHA256(secret, target), sender || " " || stream_id))
//! ```

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use minidom::Element;
use sha2::Sha256;

use crate::parser::ns;
use crate::repository::constant_time_eq;

use super::S2sError;

type HmacSha256 = Hmac<Sha256>;

/// Outcome carried by the `type` attribute of a dialback answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialbackResult {
    Valid,
    Invalid,
}

impl DialbackResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Invalid => "invalid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "valid" => Some(Self::Valid),
            "invalid" => Some(Self::Invalid),
            _ => None,
        }
    }

    pub fn from_bool(valid: bool) -> Self {
        if valid {
            Self::Valid
        } else {
            Self::Invalid
        }
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length.
    <HmacSha256 as Mac>::new_from_slice(key)
        .map(|mut mac| {
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        })
        .unwrap_or_default()
}

/// Dialback key for a stream from `sender` to `target` with id `stream_id`.
pub fn dialback_key(secret: &str, sender: &str, target: &str, stream_id: &str) -> String {
    let inner = hmac_sha256(secret.as_bytes(), target.as_bytes());
    let outer = hmac_sha256(&inner, format!("{sender} {stream_id}").as_bytes());
    hex::encode(outer)
}

/// Check a received key in constant time.
pub fn verify_key(secret: &str, sender: &str, target: &str, stream_id: &str, key: &str) -> bool {
    let expected = dialback_key(secret, sender, target, stream_id);
    constant_time_eq(expected.as_bytes(), key.trim().as_bytes())
}

/// `<db:result from to>key</db:result>`
pub fn result_request(sender: &str, target: &str, key: &str) -> Element {
    Element::builder("result", ns::DIALBACK)
        .attr("from", sender)
        .attr("to", target)
        .append(key)
        .build()
}

/// `<db:result from to type/>`
pub fn result_answer(from: &str, to: &str, result: DialbackResult) -> Element {
    Element::builder("result", ns::DIALBACK)
        .attr("from", from)
        .attr("to", to)
        .attr("type", result.as_str())
        .build()
}

/// `<db:verify from to id>key</db:verify>`
pub fn verify_request(from: &str, to: &str, stream_id: &str, key: &str) -> Element {
    Element::builder("verify", ns::DIALBACK)
        .attr("from", from)
        .attr("to", to)
        .attr("id", stream_id)
        .append(key)
        .build()
}

/// `<db:verify from to id type/>`
pub fn verify_answer(from: &str, to: &str, stream_id: &str, result: DialbackResult) -> Element {
    Element::builder("verify", ns::DIALBACK)
        .attr("from", from)
        .attr("to", to)
        .attr("id", stream_id)
        .attr("type", result.as_str())
        .build()
}

/// `<dialback xmlns='urn:xmpp:features:dialback'><errors/></dialback>`
pub fn feature() -> Element {
    Element::builder("dialback", ns::DIALBACK_FEATURE)
        .append(Element::builder("errors", ns::DIALBACK_FEATURE))
        .build()
}

pub fn is_result(element: &Element) -> bool {
    element.is("result", ns::DIALBACK)
}

pub fn is_verify(element: &Element) -> bool {
    element.is("verify", ns::DIALBACK)
}

/// Asks the authoritative server of a domain whether a key is valid.
#[async_trait]
pub trait DialbackVerifier: Send + Sync {
    /// Verify `key`, received from `remote` on stream `stream_id` of ours,
    /// by asking `remote`'s authoritative server on behalf of `local`.
    async fn verify(
        &self,
        local: &str,
        remote: &str,
        stream_id: &str,
        key: &str,
    ) -> Result<bool, S2sError>;
}
