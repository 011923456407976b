//! Stanza wrappers over [`Element`].
//!
//! A [`Stanza`] is an `iq`, `message` or `presence` element whose `from` and
//! `to` addresses have already been validated and parsed. Inside the server
//! every stanza lives in the `jabber:client` namespace; sessions rebind it to
//! `jabber:server` or `jabber:component:accept` on the wire.

use jid::Jid;
use minidom::Element;
use xmpp_parsers::iq::{Iq, IqType};

use crate::error::{stanza_error_element, StanzaErrorCondition, StanzaErrorType, XmppError};
use crate::parser::ns;

/// Top-level stanza kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaKind {
    Iq,
    Message,
    Presence,
}

impl StanzaKind {
    /// Classify an element name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "iq" => Some(Self::Iq),
            "message" => Some(Self::Message),
            "presence" => Some(Self::Presence),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Iq => "iq",
            Self::Message => "message",
            Self::Presence => "presence",
        }
    }
}

/// A routable stanza with parsed addresses.
#[derive(Debug, Clone, PartialEq)]
pub struct Stanza {
    element: Element,
    kind: StanzaKind,
    from: Jid,
    to: Jid,
}

impl Stanza {
    /// Wrap an element, stamping the given addresses on it.
    pub fn new(mut element: Element, from: Jid, to: Jid) -> Result<Self, XmppError> {
        let kind = StanzaKind::from_name(element.name())
            .ok_or_else(|| XmppError::bad_request(Some(format!("<{}/> is not a stanza", element.name()))))?;
        element.set_attr("from", from.to_string());
        element.set_attr("to", to.to_string());
        Ok(Self {
            element,
            kind,
            from,
            to,
        })
    }

    /// Parse an element that already carries both `from` and `to`.
    pub fn from_element(element: Element) -> Result<Self, XmppError> {
        let from = parse_jid_attr(&element, "from")?;
        let to = parse_jid_attr(&element, "to")?;
        Self::new(element, from, to)
    }

    pub fn kind(&self) -> StanzaKind {
        self.kind
    }

    pub fn from(&self) -> &Jid {
        &self.from
    }

    pub fn to(&self) -> &Jid {
        &self.to
    }

    pub fn id(&self) -> Option<&str> {
        self.element.attr("id")
    }

    /// The `type` attribute.
    pub fn stanza_type(&self) -> Option<&str> {
        self.element.attr("type")
    }

    pub fn element(&self) -> &Element {
        &self.element
    }

    pub fn into_element(self) -> Element {
        self.element
    }

    pub fn is_iq(&self) -> bool {
        self.kind == StanzaKind::Iq
    }

    pub fn is_message(&self) -> bool {
        self.kind == StanzaKind::Message
    }

    pub fn is_presence(&self) -> bool {
        self.kind == StanzaKind::Presence
    }

    /// `get` or `set` iq.
    pub fn is_iq_request(&self) -> bool {
        self.is_iq() && matches!(self.stanza_type(), Some("get") | Some("set"))
    }

    /// First child of an iq.
    pub fn iq_payload(&self) -> Option<&Element> {
        self.element.children().next()
    }

    /// Available presence carries no `type`.
    pub fn is_available_presence(&self) -> bool {
        self.is_presence() && self.stanza_type().is_none()
    }

    pub fn is_unavailable_presence(&self) -> bool {
        self.is_presence() && self.stanza_type() == Some("unavailable")
    }

    /// Presence priority, clamped to `i8`; absent or invalid means 0.
    pub fn presence_priority(&self) -> i8 {
        self.element
            .get_child("priority", ns::CLIENT)
            .and_then(|p| p.text().trim().parse::<i64>().ok())
            .map(|p| p.clamp(i8::MIN as i64, i8::MAX as i64) as i8)
            .unwrap_or(0)
    }

    /// Build a `type='error'` reply, swapping addresses and keeping the id.
    pub fn error_reply(&self, condition: StanzaErrorCondition) -> Stanza {
        self.error_reply_with(condition, condition.default_type(), None)
    }

    pub fn error_reply_with(
        &self,
        condition: StanzaErrorCondition,
        error_type: StanzaErrorType,
        text: Option<&str>,
    ) -> Stanza {
        let mut element = self.element.clone();
        while element.remove_child("error", ns::CLIENT).is_some() {}
        element.set_attr("type", "error");
        element.append_child(stanza_error_element(condition, error_type, text));
        Stanza::swapped(element, self)
    }

    /// Build an iq `result` reply with an optional payload.
    pub fn result_reply(&self, payload: Option<Element>) -> Stanza {
        let iq = Iq {
            from: Some(self.to.clone()),
            to: Some(self.from.clone()),
            id: self.id().unwrap_or_default().to_string(),
            payload: IqType::Result(payload),
        };
        Stanza::swapped(Element::from(iq), self)
    }

    fn swapped(mut element: Element, original: &Stanza) -> Stanza {
        element.set_attr("from", original.to.to_string());
        element.set_attr("to", original.from.to_string());
        Stanza {
            element,
            kind: original.kind,
            from: original.to.clone(),
            to: original.from.clone(),
        }
    }
}

/// Copy of `element` with every node in namespace `from` moved to `to`.
pub fn rebind_namespace(element: &Element, from: &str, to: &str) -> Element {
    let namespace = element.ns();
    let namespace = if namespace == from { to.to_string() } else { namespace };
    let mut builder = Element::builder(element.name(), namespace);
    for (name, value) in element.attrs() {
        builder = builder.attr(name, value);
    }
    for node in element.nodes() {
        if let Some(child) = node.as_element() {
            builder = builder.append(rebind_namespace(child, from, to));
        } else if let Some(text) = node.as_text() {
            builder = builder.append(text);
        }
    }
    builder.build()
}

/// Copy of `element` without the named attributes.
pub fn without_attrs(element: &Element, names: &[&str]) -> Element {
    let mut builder = Element::builder(element.name(), element.ns());
    for (name, value) in element.attrs().filter(|(name, _)| !names.contains(name)) {
        builder = builder.attr(name, value);
    }
    builder.append_all(element.nodes().cloned()).build()
}

fn parse_jid_attr(element: &Element, name: &str) -> Result<Jid, XmppError> {
    let value = element
        .attr(name)
        .ok_or_else(|| XmppError::bad_request(Some(format!("missing '{name}' attribute"))))?;
    Jid::new(value).map_err(|e| XmppError::Stanza {
        condition: StanzaErrorCondition::JidMalformed,
        error_type: StanzaErrorType::Modify,
        text: Some(e.to_string()),
    })
}
