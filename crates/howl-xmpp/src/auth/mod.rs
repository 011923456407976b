//! SASL authentication mechanisms.
//!
//! Implements the server side of:
//! - SASL PLAIN (RFC 4616)
//! - SASL DIGEST-MD5 (RFC 2831), only when explicitly enabled
//! - SASL SCRAM-SHA-1 / SCRAM-SHA-256 and their `-PLUS` variants (RFC 5802, RFC 7677)
//!
//! An [`Authenticator`] is driven serially by its owning stream: every
//! `<auth/>` or `<response/>` element goes through [`Authenticator::process`],
//! which answers with the `<challenge/>` or `<success/>` to send back.

pub mod digest_md5;
pub mod plain;
pub mod scram;

use std::sync::Arc;

use base64::prelude::*;
use minidom::Element;
use thiserror::Error;

pub use digest_md5::DigestMd5Authenticator;
pub use plain::PlainAuthenticator;
pub use scram::{ScramAuthenticator, ScramHash};

use crate::parser::ns;
use crate::repository::UserRepository;
use crate::transport::ChannelBinding;

/// SASL failure conditions (RFC 6120 §6.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SaslError {
    #[error("incorrect-encoding")]
    IncorrectEncoding,
    #[error("malformed-request")]
    MalformedRequest,
    #[error("not-authorized")]
    NotAuthorized,
    #[error("temporary-auth-failure")]
    TemporaryAuthFailure,
    #[error("invalid-mechanism")]
    InvalidMechanism,
    #[error("aborted")]
    Aborted,
}

impl SaslError {
    pub fn condition(&self) -> &'static str {
        match self {
            Self::IncorrectEncoding => "incorrect-encoding",
            Self::MalformedRequest => "malformed-request",
            Self::NotAuthorized => "not-authorized",
            Self::TemporaryAuthFailure => "temporary-auth-failure",
            Self::InvalidMechanism => "invalid-mechanism",
            Self::Aborted => "aborted",
        }
    }

    /// `<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><condition/></failure>`
    pub fn to_element(&self) -> Element {
        Element::builder("failure", ns::SASL)
            .append(Element::builder(self.condition(), ns::SASL))
            .build()
    }
}

/// SASL mechanism names.
pub mod mechanism {
    pub const PLAIN: &str = "PLAIN";
    pub const DIGEST_MD5: &str = "DIGEST-MD5";
    pub const SCRAM_SHA_1: &str = "SCRAM-SHA-1";
    pub const SCRAM_SHA_1_PLUS: &str = "SCRAM-SHA-1-PLUS";
    pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";
    pub const SCRAM_SHA_256_PLUS: &str = "SCRAM-SHA-256-PLUS";
    pub const EXTERNAL: &str = "EXTERNAL";
}

/// Which mechanisms a C2S listener offers.
#[derive(Debug, Clone)]
pub struct SaslConfig {
    /// Allowed mechanism names; empty means every supported one.
    pub mechanisms: Vec<String>,
    /// DIGEST-MD5 needs cleartext passwords and is off unless enabled here.
    pub digest_md5_enabled: bool,
}

impl Default for SaslConfig {
    fn default() -> Self {
        Self {
            mechanisms: Vec::new(),
            digest_md5_enabled: false,
        }
    }
}

impl SaslConfig {
    /// Mechanisms to advertise, strongest first.
    pub fn offered(&self, channel_binding: bool) -> Vec<&'static str> {
        let mut offered = Vec::new();
        if channel_binding {
            offered.push(mechanism::SCRAM_SHA_256_PLUS);
            offered.push(mechanism::SCRAM_SHA_1_PLUS);
        }
        offered.extend([mechanism::SCRAM_SHA_256, mechanism::SCRAM_SHA_1]);
        if self.digest_md5_enabled {
            offered.push(mechanism::DIGEST_MD5);
        }
        offered.push(mechanism::PLAIN);
        offered.retain(|m| {
            self.mechanisms.is_empty() || self.mechanisms.iter().any(|allowed| allowed == m)
        });
        offered
    }
}

/// Inputs shared by every authenticator of one stream.
#[derive(Clone)]
pub struct AuthContext {
    pub users: Arc<dyn UserRepository>,
    /// Domain the client opened the stream to.
    pub domain: String,
    /// Channel-binding data of the underlying TLS connection.
    pub channel_binding: Option<ChannelBinding>,
}

/// A SASL mechanism state machine.
pub enum Authenticator {
    Plain(PlainAuthenticator),
    DigestMd5(DigestMd5Authenticator),
    Scram(ScramAuthenticator),
}

impl Authenticator {
    /// Build the authenticator for a mechanism offered under `config`.
    pub fn for_mechanism(name: &str, config: &SaslConfig, ctx: AuthContext) -> Option<Self> {
        let plus_offered = ctx.channel_binding.is_some();
        if !config.offered(plus_offered).contains(&name) {
            return None;
        }
        let authenticator = match name {
            mechanism::PLAIN => Self::Plain(PlainAuthenticator::new(ctx)),
            mechanism::DIGEST_MD5 => Self::DigestMd5(DigestMd5Authenticator::new(ctx)),
            mechanism::SCRAM_SHA_1 => Self::Scram(ScramAuthenticator::new(ScramHash::Sha1, false, ctx)),
            mechanism::SCRAM_SHA_1_PLUS => {
                Self::Scram(ScramAuthenticator::new(ScramHash::Sha1, true, ctx))
            }
            mechanism::SCRAM_SHA_256 => {
                Self::Scram(ScramAuthenticator::new(ScramHash::Sha256, false, ctx))
            }
            mechanism::SCRAM_SHA_256_PLUS => {
                Self::Scram(ScramAuthenticator::new(ScramHash::Sha256, true, ctx))
            }
            _ => return None,
        };
        Some(authenticator)
    }

    pub fn mechanism(&self) -> &'static str {
        match self {
            Self::Plain(_) => mechanism::PLAIN,
            Self::DigestMd5(_) => mechanism::DIGEST_MD5,
            Self::Scram(a) => a.mechanism(),
        }
    }

    pub fn uses_channel_binding(&self) -> bool {
        match self {
            Self::Scram(a) => a.uses_channel_binding(),
            _ => false,
        }
    }

    /// Feed an `<auth/>` or `<response/>` element, returning the reply.
    pub async fn process(&mut self, element: &Element) -> Result<Element, SaslError> {
        match self {
            Self::Plain(a) => a.process(element).await,
            Self::DigestMd5(a) => a.process(element).await,
            Self::Scram(a) => a.process(element).await,
        }
    }

    /// Authenticated user name, once known.
    pub fn username(&self) -> &str {
        match self {
            Self::Plain(a) => a.username(),
            Self::DigestMd5(a) => a.username(),
            Self::Scram(a) => a.username(),
        }
    }

    pub fn authenticated(&self) -> bool {
        match self {
            Self::Plain(a) => a.authenticated(),
            Self::DigestMd5(a) => a.authenticated(),
            Self::Scram(a) => a.authenticated(),
        }
    }

    pub fn reset(&mut self) {
        match self {
            Self::Plain(a) => a.reset(),
            Self::DigestMd5(a) => a.reset(),
            Self::Scram(a) => a.reset(),
        }
    }
}

/// Decode the base64 text of an `<auth/>` or `<response/>` element.
///
/// `=` stands for an explicitly empty payload.
pub(crate) fn decode_payload(element: &Element) -> Result<Vec<u8>, SaslError> {
    let text = element.text();
    let text = text.trim();
    if text.is_empty() || text == "=" {
        return Ok(Vec::new());
    }
    BASE64_STANDARD
        .decode(text)
        .map_err(|_| SaslError::IncorrectEncoding)
}

pub(crate) fn challenge(payload: &[u8]) -> Element {
    Element::builder("challenge", ns::SASL)
        .append(BASE64_STANDARD.encode(payload))
        .build()
}

pub(crate) fn success(payload: Option<&[u8]>) -> Element {
    let builder = Element::builder("success", ns::SASL);
    match payload {
        Some(payload) => builder.append(BASE64_STANDARD.encode(payload)).build(),
        None => builder.build(),
    }
}

/// Whether the element is a SASL element with the given name.
pub(crate) fn is_sasl(element: &Element, name: &str) -> bool {
    element.is(name, ns::SASL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryUserRepository;

    fn ctx(channel_binding: bool) -> AuthContext {
        AuthContext {
            users: Arc::new(MemoryUserRepository::new()),
            domain: "jackal.im".to_string(),
            channel_binding: channel_binding.then(|| ChannelBinding {
                mechanism: "tls-exporter",
                data: vec![7; 32],
            }),
        }
    }

    #[test]
    fn test_offered_mechanisms() {
        let config = SaslConfig::default();
        assert_eq!(
            config.offered(false),
            vec!["SCRAM-SHA-256", "SCRAM-SHA-1", "PLAIN"]
        );
        assert_eq!(config.offered(true)[0], "SCRAM-SHA-256-PLUS");

        let config = SaslConfig {
            mechanisms: vec!["PLAIN".to_string(), "DIGEST-MD5".to_string()],
            digest_md5_enabled: true,
        };
        assert_eq!(config.offered(true), vec!["DIGEST-MD5", "PLAIN"]);
    }

    #[test]
    fn test_digest_md5_disabled_by_default() {
        let config = SaslConfig::default();
        assert!(Authenticator::for_mechanism("DIGEST-MD5", &config, ctx(false)).is_none());
        assert!(Authenticator::for_mechanism("SCRAM-SHA-1-PLUS", &config, ctx(false)).is_none());

        let auth = Authenticator::for_mechanism("SCRAM-SHA-1-PLUS", &config, ctx(true)).unwrap();
        assert_eq!(auth.mechanism(), "SCRAM-SHA-1-PLUS");
        assert!(auth.uses_channel_binding());
    }

    #[test]
    fn test_failure_element() {
        let failure = SaslError::NotAuthorized.to_element();
        assert!(failure.is("failure", ns::SASL));
        assert!(failure.has_child("not-authorized", ns::SASL));
        assert_eq!(failure.children().count(), 1);
    }
}
