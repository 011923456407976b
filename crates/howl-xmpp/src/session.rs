//! XML stream session.
//!
//! A [`Session`] owns the transport and the incremental parser of one
//! connection. It writes stream headers and elements, and turns incoming
//! elements into validated [`Stanza`]s according to the stream's state.

use std::sync::Arc;

use jid::Jid;
use minidom::Element;
use tracing::{debug, instrument};

use crate::error::{StanzaErrorCondition, StreamError, StreamErrorCondition};
use crate::hosts::Hosts;
use crate::parser::{ns, Parser, ParsingMode, STREAM_NAME};
use crate::stanza::{rebind_namespace, Stanza, StanzaKind};
use crate::transport::Transport;
use crate::XmppError;

/// Kind of stream carried by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    C2s,
    S2s,
    Component,
}

impl SessionKind {
    /// Default namespace of the stream.
    pub fn namespace(&self) -> &'static str {
        match self {
            Self::C2s => ns::CLIENT,
            Self::S2s => ns::SERVER,
            Self::Component => ns::COMPONENT,
        }
    }
}

/// Session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub kind: SessionKind,
    /// We accepted the connection (as opposed to dialing it).
    pub incoming: bool,
    /// Zero disables the limit.
    pub max_stanza_size: usize,
    /// Log every element crossing the session at debug level.
    pub log_stanzas: bool,
}

/// What [`Session::receive`] produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    /// The peer's (validated) `<stream:stream>` header.
    StreamHeader(Element),
    /// A stanza with validated addresses.
    Stanza(Stanza),
    /// A stanza whose addressing could not be accepted; reply with the
    /// given condition and keep the stream open.
    BadStanza {
        element: Element,
        condition: StanzaErrorCondition,
    },
    /// Any other top-level element (negotiation, SM, dialback...).
    Element(Element),
}

/// XMPP stream session over a [`Transport`].
pub struct Session {
    transport: Transport,
    parser: Parser,
    hosts: Arc<Hosts>,
    config: SessionConfig,
    stream_id: String,
    /// Address bound to the stream: user JID (C2S) or peer domain (S2S, component).
    jid: Option<Jid>,
    header_received: bool,
    read_buf: Vec<u8>,
}

impl Session {
    pub fn new(transport: Transport, hosts: Arc<Hosts>, config: SessionConfig) -> Self {
        Self {
            transport,
            parser: Parser::new(ParsingMode::SocketStream, config.max_stanza_size),
            hosts,
            stream_id: if config.incoming {
                uuid::Uuid::new_v4().to_string()
            } else {
                String::new()
            },
            config,
            jid: None,
            header_received: false,
            read_buf: Vec::with_capacity(4096),
        }
    }

    pub fn kind(&self) -> SessionKind {
        self.config.kind
    }

    /// Current stream id (ours if incoming, the peer's once known if outgoing).
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn jid(&self) -> Option<&Jid> {
        self.jid.as_ref()
    }

    /// Bind the stream address used to validate and default stanza addressing.
    pub fn set_jid(&mut self, jid: Jid) {
        self.jid = Some(jid);
    }

    pub fn is_secured(&self) -> bool {
        self.transport.is_secured()
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut Transport {
        &mut self.transport
    }

    /// Write the XML prolog and our `<stream:stream>` header.
    #[instrument(skip(self), name = "xmpp.session.open_stream")]
    pub async fn open_stream(&mut self, from: Option<&str>, to: Option<&str>) -> Result<(), XmppError> {
        let mut xml = format!(
            "<?xml version='1.0'?><stream:stream xmlns='{}' xmlns:stream='{}'",
            self.config.kind.namespace(),
            ns::STREAM
        );
        if self.config.kind == SessionKind::S2s {
            xml.push_str(&format!(" xmlns:db='{}'", ns::DIALBACK));
        }
        let id = self.config.incoming.then_some(self.stream_id.as_str());
        for (name, value) in [("id", id), ("from", from), ("to", to), ("version", Some("1.0"))] {
            if let Some(value) = value {
                xml.push_str(&format!(" {name}='{}'", escape_attr(value)));
            }
        }
        xml.push('>');

        self.log_out(&xml);
        self.transport.write(xml.as_bytes());
        self.transport.flush().await?;

        debug!(stream_id = %self.stream_id, "Opened stream");
        Ok(())
    }

    /// Write `</stream:stream>`.
    pub async fn close(&mut self) -> Result<(), XmppError> {
        self.log_out("</stream:stream>");
        self.transport.write(b"</stream:stream>");
        self.transport.flush().await
    }

    /// Serialize and flush an element.
    ///
    /// Stanzas are moved from `jabber:client` into the stream's namespace.
    pub async fn send(&mut self, element: &Element) -> Result<(), XmppError> {
        let namespace = self.config.kind.namespace();
        let xml = if namespace != ns::CLIENT && is_stanza(element, ns::CLIENT) {
            String::from(&rebind_namespace(element, ns::CLIENT, namespace))
        } else {
            String::from(element)
        };
        self.log_out(&xml);
        self.transport.write(xml.as_bytes());
        self.transport.flush().await
    }

    /// Send a stream error followed by the closing tag.
    pub async fn send_stream_error(&mut self, error: &StreamError) -> Result<(), XmppError> {
        let mut xml = String::from(&error.to_element());
        xml.push_str("</stream:stream>");
        self.log_out(&xml);
        self.transport.write(xml.as_bytes());
        self.transport.flush().await
    }

    /// Read the next element.
    ///
    /// Cancel-safe: bytes already read stay buffered in the parser.
    pub async fn receive(&mut self) -> Result<Received, XmppError> {
        loop {
            if let Some(element) = self.parser.parse()? {
                if self.config.log_stanzas {
                    debug!(stream_id = %self.stream_id, xml = %String::from(&element), "RECV");
                }
                return self.process(element);
            }
            self.read_buf.clear();
            let n = self.transport.read(&mut self.read_buf).await?;
            if n == 0 {
                return Err(XmppError::StreamClosed);
            }
            self.parser.feed(&self.read_buf);
        }
    }

    /// Restart the stream after TLS, SASL or compression negotiation.
    pub fn reset(&mut self) {
        self.parser.reset();
        self.header_received = false;
        if self.config.incoming {
            self.stream_id = uuid::Uuid::new_v4().to_string();
        }
    }

    fn process(&mut self, element: Element) -> Result<Received, XmppError> {
        if element.is(STREAM_NAME, ns::STREAM) {
            self.validate_header(&element)?;
            self.header_received = true;
            if !self.config.incoming {
                if let Some(id) = element.attr("id") {
                    self.stream_id = id.to_string();
                }
            }
            return Ok(Received::StreamHeader(element));
        }
        if !self.header_received {
            return Err(XmppError::stream(StreamErrorCondition::BadFormat));
        }
        let namespace = self.config.kind.namespace();
        if !is_stanza(&element, namespace) {
            return Ok(Received::Element(element));
        }
        let element = if namespace == ns::CLIENT {
            element
        } else {
            rebind_namespace(&element, namespace, ns::CLIENT)
        };
        // Unauthenticated streams get the raw element; the state machine decides.
        let Some(jid) = self.jid.clone() else {
            return Ok(Received::Element(element));
        };
        self.build_stanza(element, &jid)
    }

    fn validate_header(&self, header: &Element) -> Result<(), XmppError> {
        if self.parser.stream_namespace() != Some(self.config.kind.namespace()) {
            return Err(XmppError::stream(StreamErrorCondition::InvalidNamespace));
        }
        if self.config.kind != SessionKind::Component && header.attr("version") != Some("1.0") {
            return Err(XmppError::stream(StreamErrorCondition::UnsupportedVersion));
        }
        if self.config.incoming && self.config.kind != SessionKind::Component {
            if let Some(to) = header.attr("to") {
                if !self.hosts.is_local_host(to) {
                    return Err(XmppError::stream(StreamErrorCondition::HostUnknown));
                }
            }
        }
        Ok(())
    }

    fn build_stanza(&self, mut element: Element, jid: &Jid) -> Result<Received, XmppError> {
        let from = match self.config.kind {
            SessionKind::C2s => validate_client_from(element.attr("from"), jid)?,
            SessionKind::S2s | SessionKind::Component => {
                let from = element
                    .attr("from")
                    .and_then(|f| Jid::new(f).ok())
                    .ok_or_else(|| XmppError::stream(StreamErrorCondition::InvalidFrom))?;
                if from.domain().as_str() != jid.domain().as_str() {
                    return Err(XmppError::stream(StreamErrorCondition::InvalidFrom));
                }
                from
            }
        };

        let to = match element.attr("to") {
            Some(to) => match Jid::new(to) {
                Ok(to) => to,
                Err(_) => {
                    element.set_attr("from", from.to_string());
                    return Ok(Received::BadStanza {
                        element,
                        condition: StanzaErrorCondition::JidMalformed,
                    });
                }
            },
            None => match self.config.kind {
                SessionKind::C2s => Jid::from(jid.to_bare()),
                _ => Jid::new(self.hosts.default_host())
                    .map_err(|e| XmppError::config(format!("invalid default host: {e}")))?,
            },
        };

        Ok(Received::Stanza(Stanza::new(element, from, to)?))
    }

    fn log_out(&self, xml: &str) {
        if self.config.log_stanzas {
            debug!(stream_id = %self.stream_id, xml = %xml, "SEND");
        }
    }
}

fn is_stanza(element: &Element, namespace: &str) -> bool {
    StanzaKind::from_name(element.name()).is_some() && element.ns() == namespace
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('\'', "&apos;")
}

/// Client `from` handling: before a full bind the stream address is
/// authoritative; afterwards a supplied `from` must match it.
fn validate_client_from(from: Option<&str>, jid: &Jid) -> Result<Jid, XmppError> {
    let Some(bound_resource) = jid.resource() else {
        return Ok(jid.clone());
    };
    let Some(from) = from else {
        return Ok(jid.clone());
    };
    let invalid = || XmppError::stream(StreamErrorCondition::InvalidFrom);
    let from = Jid::new(from).map_err(|_| invalid())?;

    let same_node = from.node().map(|n| n.as_str()) == jid.node().map(|n| n.as_str());
    if !same_node || from.domain().as_str() != jid.domain().as_str() {
        return Err(invalid());
    }
    match from.resource() {
        Some(resource) if resource.as_str() != bound_resource.as_str() => Err(invalid()),
        Some(_) => Ok(from),
        None => Ok(jid.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn new_session(kind: SessionKind) -> (Session, DuplexStream) {
        let (a, b) = tokio::io::duplex(8192);
        let hosts = Arc::new(Hosts::new("jackal.im"));
        let session = Session::new(
            Transport::new(a),
            hosts,
            SessionConfig {
                kind,
                incoming: true,
                max_stanza_size: 4096,
                log_stanzas: false,
            },
        );
        (session, b)
    }

    const CLIENT_HEADER: &str = "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
        xmlns:stream='http://etherx.jabber.org/streams' to='jackal.im' version='1.0'>";

    async fn read_string(peer: &mut DuplexStream) -> String {
        let mut buf = vec![0u8; 4096];
        let n = peer.read(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf[..n]).to_string()
    }

    #[tokio::test]
    async fn test_open_stream_header() {
        let (mut session, mut peer) = new_session(SessionKind::S2s);
        session.open_stream(Some("jackal.im"), Some("jabber.org")).await.unwrap();

        let header = read_string(&mut peer).await;
        assert!(header.starts_with("<?xml version='1.0'?><stream:stream xmlns='jabber:server'"));
        assert!(header.contains("xmlns:db='jabber:server:dialback'"));
        assert!(header.contains(&format!("id='{}'", session.stream_id())));
        assert!(header.contains("version='1.0'"));
        assert!(header.ends_with('>') && !header.ends_with("/>"));
    }

    #[tokio::test]
    async fn test_header_validation() {
        let (mut session, mut peer) = new_session(SessionKind::C2s);
        peer.write_all(CLIENT_HEADER.as_bytes()).await.unwrap();
        assert!(matches!(
            session.receive().await.unwrap(),
            Received::StreamHeader(_)
        ));

        let (mut session, mut peer) = new_session(SessionKind::C2s);
        peer.write_all(
            b"<stream:stream xmlns='jabber:server' xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>",
        )
        .await
        .unwrap();
        let err = session.receive().await.unwrap_err();
        assert_eq!(
            err.to_stream_error().map(|e| e.condition),
            Some(StreamErrorCondition::InvalidNamespace)
        );

        let (mut session, mut peer) = new_session(SessionKind::C2s);
        peer.write_all(
            b"<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' to='jabber.org' version='1.0'>",
        )
        .await
        .unwrap();
        let err = session.receive().await.unwrap_err();
        assert_eq!(
            err.to_stream_error().map(|e| e.condition),
            Some(StreamErrorCondition::HostUnknown)
        );
    }

    #[tokio::test]
    async fn test_unsupported_version() {
        let (mut session, mut peer) = new_session(SessionKind::C2s);
        peer.write_all(
            b"<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' version='0.9'>",
        )
        .await
        .unwrap();
        let err = session.receive().await.unwrap_err();
        assert_eq!(
            err.to_stream_error().map(|e| e.condition),
            Some(StreamErrorCondition::UnsupportedVersion)
        );
    }

    #[tokio::test]
    async fn test_c2s_from_defaults_and_validation() {
        let (mut session, mut peer) = new_session(SessionKind::C2s);
        session.set_jid(Jid::new("ortuman@jackal.im/yard").unwrap());
        peer.write_all(CLIENT_HEADER.as_bytes()).await.unwrap();
        session.receive().await.unwrap();

        // Missing from/to are filled in
        peer.write_all(b"<message id='1'><body>hi</body></message>").await.unwrap();
        let Received::Stanza(stanza) = session.receive().await.unwrap() else {
            panic!("expected stanza");
        };
        assert_eq!(stanza.from().to_string(), "ortuman@jackal.im/yard");
        assert_eq!(stanza.to().to_string(), "ortuman@jackal.im");

        // Spoofed from is a stream error
        peer.write_all(b"<message from='noelia@jackal.im/yard' to='a@b'/>").await.unwrap();
        let err = session.receive().await.unwrap_err();
        assert_eq!(
            err.to_stream_error().map(|e| e.condition),
            Some(StreamErrorCondition::InvalidFrom)
        );
    }

    #[tokio::test]
    async fn test_c2s_malformed_to() {
        let (mut session, mut peer) = new_session(SessionKind::C2s);
        session.set_jid(Jid::new("ortuman@jackal.im/yard").unwrap());
        peer.write_all(CLIENT_HEADER.as_bytes()).await.unwrap();
        session.receive().await.unwrap();

        peer.write_all(b"<message to='@bad'/>").await.unwrap();
        assert!(matches!(
            session.receive().await.unwrap(),
            Received::BadStanza {
                condition: StanzaErrorCondition::JidMalformed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_s2s_from_domain_must_match() {
        let (mut session, mut peer) = new_session(SessionKind::S2s);
        session.set_jid(Jid::new("jabber.org").unwrap());
        peer.write_all(
            b"<stream:stream xmlns='jabber:server' xmlns:stream='http://etherx.jabber.org/streams' \
              xmlns:db='jabber:server:dialback' version='1.0'>",
        )
        .await
        .unwrap();
        session.receive().await.unwrap();

        peer.write_all(b"<presence from='romeo@jabber.org/a'/>").await.unwrap();
        let Received::Stanza(stanza) = session.receive().await.unwrap() else {
            panic!("expected stanza");
        };
        assert_eq!(stanza.to().to_string(), "jackal.im");

        peer.write_all(b"<presence from='romeo@evil.org/a' to='jackal.im'/>").await.unwrap();
        assert!(session.receive().await.is_err());
    }

    #[tokio::test]
    async fn test_s2s_stanzas_rebound_to_client_namespace() {
        let (mut session, mut peer) = new_session(SessionKind::S2s);
        session.set_jid(Jid::new("jabber.org").unwrap());
        peer.write_all(
            b"<stream:stream xmlns='jabber:server' xmlns:stream='http://etherx.jabber.org/streams' \
              xmlns:db='jabber:server:dialback' version='1.0'>",
        )
        .await
        .unwrap();
        session.receive().await.unwrap();

        peer.write_all(b"<message from='romeo@jabber.org/a' to='juliet@jackal.im'><body>hi</body></message>")
            .await
            .unwrap();
        let Received::Stanza(stanza) = session.receive().await.unwrap() else {
            panic!("expected stanza");
        };
        assert_eq!(stanza.element().ns(), ns::CLIENT);
        assert!(stanza.element().get_child("body", ns::CLIENT).is_some());

        peer.write_all(b"<db:result from='jabber.org' to='jackal.im'>key</db:result>")
            .await
            .unwrap();
        let Received::Element(result) = session.receive().await.unwrap() else {
            panic!("expected dialback element");
        };
        assert!(result.is("result", ns::DIALBACK));

        let reply: Element = "<message xmlns='jabber:client' from='juliet@jackal.im' to='romeo@jabber.org'><body>yo</body></message>"
            .parse()
            .unwrap();
        session.send(&reply).await.unwrap();
        let out = read_string(&mut peer).await.replace('"', "'");
        assert!(out.contains("xmlns='jabber:server'"), "{out}");
        assert!(!out.contains("jabber:client"), "{out}");
    }

    #[tokio::test]
    async fn test_peer_close_and_reset() {
        let (mut session, mut peer) = new_session(SessionKind::C2s);
        let first_id = session.stream_id().to_string();
        peer.write_all(CLIENT_HEADER.as_bytes()).await.unwrap();
        session.receive().await.unwrap();

        session.reset();
        assert_ne!(session.stream_id(), first_id);

        peer.write_all(CLIENT_HEADER.as_bytes()).await.unwrap();
        session.receive().await.unwrap();
        peer.write_all(b"</stream:stream>").await.unwrap();
        assert!(matches!(
            session.receive().await,
            Err(XmppError::XmlParse(crate::parser::ParseError::StreamClosedByPeer))
        ));
    }
}
