//! Error types for the XMPP server.

use minidom::Element;
use thiserror::Error;

use crate::parser::{ns, ParseError};

/// XMPP server errors.
#[derive(Debug, Error)]
pub enum XmppError {
    /// IO error (network, file)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// XML parsing error
    #[error("XML parse error: {0}")]
    XmlParse(#[from] ParseError),

    /// Read token bucket exhausted
    #[error("read rate limit exceeded")]
    ReadLimitExceeded,

    /// Operation did not complete in time
    #[error("operation timed out")]
    Timeout,

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Fatal stream error; the stream must be closed after sending it.
    #[error("Stream error: {0}")]
    Stream(StreamError),

    /// Stream is gone (peer closed or task exited)
    #[error("Stream closed")]
    StreamClosed,

    /// The target stream's mailbox has no room left
    #[error("Stream mailbox full")]
    MailboxFull,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Stanza error (for error replies)
    #[error("Stanza error: {condition}")]
    Stanza {
        /// Error condition
        condition: StanzaErrorCondition,
        /// Error type
        error_type: StanzaErrorType,
        /// Optional text description
        text: Option<String>,
    },
}

impl XmppError {
    /// Create a new XML parse error.
    pub fn xml_parse(msg: impl Into<String>) -> Self {
        Self::XmlParse(ParseError::Syntax(msg.into()))
    }

    /// Create a new authentication error.
    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthFailed(msg.into())
    }

    /// Create a new stream error.
    pub fn stream(condition: StreamErrorCondition) -> Self {
        Self::Stream(StreamError::new(condition))
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a stanza error for 'bad-request'.
    pub fn bad_request(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::BadRequest,
            error_type: StanzaErrorType::Modify,
            text,
        }
    }

    /// Create a stanza error for 'item-not-found'.
    pub fn item_not_found(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::ItemNotFound,
            error_type: StanzaErrorType::Cancel,
            text,
        }
    }

    /// Create a stanza error for 'feature-not-implemented'.
    pub fn feature_not_implemented(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::FeatureNotImplemented,
            error_type: StanzaErrorType::Cancel,
            text,
        }
    }

    /// Create a stanza error for 'forbidden'.
    pub fn forbidden(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::Forbidden,
            error_type: StanzaErrorType::Auth,
            text,
        }
    }

    /// Create a stanza error for 'internal-server-error'.
    pub fn internal_server_error(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::InternalServerError,
            error_type: StanzaErrorType::Wait,
            text,
        }
    }

    /// Create a stanza error for 'service-unavailable'.
    pub fn service_unavailable(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::ServiceUnavailable,
            error_type: StanzaErrorType::Cancel,
            text,
        }
    }

    /// Map transport and parser failures onto the stream error a peer
    /// should observe, if any.
    pub fn to_stream_error(&self) -> Option<StreamError> {
        match self {
            Self::Stream(err) => Some(err.clone()),
            Self::ReadLimitExceeded => Some(
                StreamError::new(StreamErrorCondition::PolicyViolation)
                    .with_app_condition("rate-limit-exceeded"),
            ),
            Self::XmlParse(ParseError::TooLargeStanza) => Some(
                StreamError::new(StreamErrorCondition::PolicyViolation)
                    .with_app_condition("stanza-too-big"),
            ),
            Self::XmlParse(ParseError::StreamClosedByPeer) => None,
            Self::XmlParse(_) => Some(StreamError::new(StreamErrorCondition::InvalidXml)),
            Self::Timeout => Some(StreamError::new(StreamErrorCondition::ConnectionTimeout)),
            Self::Internal(_) => Some(StreamError::new(StreamErrorCondition::InternalServerError)),
            _ => None,
        }
    }
}

/// XMPP stream error conditions (RFC 6120 Section 4.9.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorCondition {
    BadFormat,
    Conflict,
    ConnectionTimeout,
    HostUnknown,
    ImproperAddressing,
    InternalServerError,
    InvalidFrom,
    InvalidNamespace,
    InvalidXml,
    NotAuthorized,
    PolicyViolation,
    RemoteConnectionFailed,
    SystemShutdown,
    UndefinedCondition,
    UnsupportedStanzaType,
    UnsupportedVersion,
}

impl StreamErrorCondition {
    /// Get the element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadFormat => "bad-format",
            Self::Conflict => "conflict",
            Self::ConnectionTimeout => "connection-timeout",
            Self::HostUnknown => "host-unknown",
            Self::ImproperAddressing => "improper-addressing",
            Self::InternalServerError => "internal-server-error",
            Self::InvalidFrom => "invalid-from",
            Self::InvalidNamespace => "invalid-namespace",
            Self::InvalidXml => "invalid-xml",
            Self::NotAuthorized => "not-authorized",
            Self::PolicyViolation => "policy-violation",
            Self::RemoteConnectionFailed => "remote-connection-failed",
            Self::SystemShutdown => "system-shutdown",
            Self::UndefinedCondition => "undefined-condition",
            Self::UnsupportedStanzaType => "unsupported-stanza-type",
            Self::UnsupportedVersion => "unsupported-version",
        }
    }
}

impl std::fmt::Display for StreamErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A fatal stream error with optional application-specific condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamError {
    pub condition: StreamErrorCondition,
    pub app_condition: Option<&'static str>,
    pub text: Option<String>,
}

impl StreamError {
    pub fn new(condition: StreamErrorCondition) -> Self {
        Self {
            condition,
            app_condition: None,
            text: None,
        }
    }

    pub fn with_app_condition(mut self, name: &'static str) -> Self {
        self.app_condition = Some(name);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Build the `<stream:error>` element.
    pub fn to_element(&self) -> Element {
        let mut error = Element::builder("error", ns::STREAM)
            .append(Element::builder(self.condition.as_str(), ns::STREAMS).build());
        if let Some(text) = &self.text {
            error = error.append(
                Element::builder("text", ns::STREAMS)
                    .append(text.as_str())
                    .build(),
            );
        }
        if let Some(app) = self.app_condition {
            error = error.append(Element::builder(app, ns::APP_ERRORS).build());
        }
        error.build()
    }
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.app_condition {
            Some(app) => write!(f, "{} ({})", self.condition, app),
            None => write!(f, "{}", self.condition),
        }
    }
}

/// XMPP stanza error conditions (RFC 6120 Section 8.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorCondition {
    /// Bad request (malformed XML, etc.)
    BadRequest,
    /// Conflict (e.g., resource already bound)
    Conflict,
    /// Feature not implemented
    FeatureNotImplemented,
    /// Forbidden (permission denied)
    Forbidden,
    /// Internal server error
    InternalServerError,
    /// Item not found
    ItemNotFound,
    /// JID malformed
    JidMalformed,
    /// Not acceptable
    NotAcceptable,
    /// Not allowed
    NotAllowed,
    /// Not authorized
    NotAuthorized,
    /// Policy violation
    PolicyViolation,
    /// Remote server not found
    RemoteServerNotFound,
    /// Remote server timeout
    RemoteServerTimeout,
    /// Resource constraint
    ResourceConstraint,
    /// Service unavailable
    ServiceUnavailable,
    /// Undefined condition
    UndefinedCondition,
    /// Unexpected request
    UnexpectedRequest,
}

impl StanzaErrorCondition {
    /// Get the element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Conflict => "conflict",
            Self::FeatureNotImplemented => "feature-not-implemented",
            Self::Forbidden => "forbidden",
            Self::InternalServerError => "internal-server-error",
            Self::ItemNotFound => "item-not-found",
            Self::JidMalformed => "jid-malformed",
            Self::NotAcceptable => "not-acceptable",
            Self::NotAllowed => "not-allowed",
            Self::NotAuthorized => "not-authorized",
            Self::PolicyViolation => "policy-violation",
            Self::RemoteServerNotFound => "remote-server-not-found",
            Self::RemoteServerTimeout => "remote-server-timeout",
            Self::ResourceConstraint => "resource-constraint",
            Self::ServiceUnavailable => "service-unavailable",
            Self::UndefinedCondition => "undefined-condition",
            Self::UnexpectedRequest => "unexpected-request",
        }
    }

    /// The error type RFC 6120 associates with this condition.
    pub fn default_type(&self) -> StanzaErrorType {
        match self {
            Self::BadRequest | Self::JidMalformed | Self::NotAcceptable | Self::PolicyViolation => {
                StanzaErrorType::Modify
            }
            Self::Forbidden | Self::NotAuthorized => StanzaErrorType::Auth,
            Self::InternalServerError
            | Self::RemoteServerTimeout
            | Self::ResourceConstraint
            | Self::UnexpectedRequest => StanzaErrorType::Wait,
            _ => StanzaErrorType::Cancel,
        }
    }
}

impl std::fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// XMPP stanza error types (RFC 6120 Section 8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorType {
    /// Retry after providing credentials
    Auth,
    /// Do not retry (unrecoverable error)
    Cancel,
    /// Retry after changing the data sent
    Modify,
    /// Retry after waiting (temporary error)
    Wait,
}

impl StanzaErrorType {
    /// Get the type attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }
}

impl std::fmt::Display for StanzaErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Build the `<error/>` child carried by a stanza of type `error`.
pub fn stanza_error_element(
    condition: StanzaErrorCondition,
    error_type: StanzaErrorType,
    text: Option<&str>,
) -> Element {
    let mut error = Element::builder("error", ns::CLIENT)
        .attr("type", error_type.as_str())
        .append(Element::builder(condition.as_str(), ns::STANZAS).build());
    if let Some(text) = text {
        error = error.append(Element::builder("text", ns::STANZAS).append(text).build());
    }
    error.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_error_element() {
        let error = StreamError::new(StreamErrorCondition::PolicyViolation)
            .with_app_condition("stanza-too-big")
            .to_element();

        assert!(error.is("error", ns::STREAM));
        assert!(error.has_child("policy-violation", ns::STREAMS));
        assert!(error.has_child("stanza-too-big", ns::APP_ERRORS));

        let xml = String::from(&error);
        assert!(xml.contains("policy-violation"));
    }

    #[test]
    fn test_transport_error_mapping() {
        let rate = XmppError::ReadLimitExceeded.to_stream_error().unwrap();
        assert_eq!(rate.condition, StreamErrorCondition::PolicyViolation);
        assert_eq!(rate.app_condition, Some("rate-limit-exceeded"));

        let size = XmppError::from(ParseError::TooLargeStanza)
            .to_stream_error()
            .unwrap();
        assert_eq!(size.app_condition, Some("stanza-too-big"));

        let xml = XmppError::xml_parse("bad").to_stream_error().unwrap();
        assert_eq!(xml.condition, StreamErrorCondition::InvalidXml);

        let timeout = XmppError::Timeout.to_stream_error().unwrap();
        assert_eq!(timeout.condition, StreamErrorCondition::ConnectionTimeout);

        assert!(XmppError::from(ParseError::StreamClosedByPeer)
            .to_stream_error()
            .is_none());
    }

    #[test]
    fn test_stanza_error_element() {
        let error = stanza_error_element(
            StanzaErrorCondition::ServiceUnavailable,
            StanzaErrorType::Cancel,
            Some("no such resource"),
        );
        assert_eq!(error.attr("type"), Some("cancel"));
        assert!(error.has_child("service-unavailable", ns::STANZAS));
        assert_eq!(
            error.get_child("text", ns::STANZAS).map(|t| t.text()),
            Some("no such resource".to_string())
        );
    }

    #[test]
    fn test_stanza_error_conditions() {
        assert_eq!(StanzaErrorCondition::BadRequest.as_str(), "bad-request");
        assert_eq!(StanzaErrorCondition::NotAuthorized.as_str(), "not-authorized");
        assert_eq!(
            StanzaErrorCondition::RemoteServerTimeout.default_type(),
            StanzaErrorType::Wait
        );
    }
}
