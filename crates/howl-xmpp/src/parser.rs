//! Incremental XML parsing for XMPP streams using minidom.
//!
//! Bytes are fed as they arrive from the socket. The parser frames complete
//! top-level elements and hands each one to minidom together with the
//! namespace declarations of the enclosing stream header, so prefixes bound
//! on any ancestor resolve. In [`ParsingMode::SocketStream`] the
//! `<stream:stream>` wrapper never becomes a parent element: its opening tag
//! is emitted on its own and its closing tag surfaces as
//! [`ParseError::StreamClosedByPeer`].

use minidom::Element;
use thiserror::Error;

/// XML namespaces used throughout the server.
pub mod ns {
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    pub const CLIENT: &str = "jabber:client";
    pub const SERVER: &str = "jabber:server";
    pub const COMPONENT: &str = "jabber:component:accept";
    pub const DIALBACK: &str = "jabber:server:dialback";
    pub const DIALBACK_FEATURE: &str = "urn:xmpp:features:dialback";
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    pub const STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    pub const SM: &str = "urn:xmpp:sm:3";
    pub const COMPRESS_FEATURE: &str = "http://jabber.org/features/compress";
    pub const COMPRESS: &str = "http://jabber.org/protocol/compress";
    pub const PING: &str = "urn:xmpp:ping";
    pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
    pub const VERSION: &str = "jabber:iq:version";
    pub const APP_ERRORS: &str = "urn:xmpp:errors";
}

/// Local name of the stream wrapper element.
pub const STREAM_NAME: &str = "stream";

/// Parser behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsingMode {
    /// Generic documents; unqualified names fall into `jabber:client`.
    Default,
    /// XMPP socket streams.
    SocketStream,
}

/// XML parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("XML syntax error: {0}")]
    Syntax(String),

    #[error("stanza exceeds maximum allowed size")]
    TooLargeStanza,

    #[error("stream closed by peer")]
    StreamClosedByPeer,

    #[error("unexpected end tag </{found}>, expected </{expected}>")]
    UnexpectedEndTag { expected: String, found: String },
}

impl ParseError {
    fn syntax(msg: impl Into<String>) -> Self {
        Self::Syntax(msg.into())
    }
}

const COMPACT_THRESHOLD: usize = 4096;

/// The open `<stream:stream>` every stanza is parsed within.
#[derive(Debug, Clone)]
struct StreamScope {
    /// Qualified name as written by the peer.
    name: String,
    /// `xmlns` and `xmlns:*` attributes of the header, verbatim.
    declarations: String,
    default_ns: Option<String>,
}

/// Incremental XML parser.
pub struct Parser {
    mode: ParsingMode,
    /// Zero disables the limit.
    max_stanza_size: usize,
    buf: Vec<u8>,
    pos: usize,
    /// Bytes consumed since the previous completed element.
    consumed: usize,
    /// Qualified names of the open elements of the stanza being framed.
    open: Vec<String>,
    /// Buffer offset where the stanza being framed starts.
    start: usize,
    stream: Option<StreamScope>,
}

enum Token {
    Skip,
    Start { raw: String, empty: bool },
    End(String),
    Text { blank: bool },
}

impl Parser {
    pub fn new(mode: ParsingMode, max_stanza_size: usize) -> Self {
        Self {
            mode,
            max_stanza_size,
            buf: Vec::with_capacity(1024),
            pos: 0,
            consumed: 0,
            open: Vec::new(),
            start: 0,
            stream: None,
        }
    }

    pub fn mode(&self) -> ParsingMode {
        self.mode
    }

    /// Default namespace declared on the peer's stream header.
    pub fn stream_namespace(&self) -> Option<&str> {
        self.stream.as_ref().and_then(|s| s.default_ns.as_deref())
    }

    /// Discard all buffered data and state.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.pos = 0;
        self.consumed = 0;
        self.open.clear();
        self.start = 0;
        self.stream = None;
    }

    /// Append raw bytes.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet consumed.
    pub fn pending(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Pull the next complete top-level element.
    ///
    /// Returns `Ok(None)` when more input is required.
    pub fn parse(&mut self) -> Result<Option<Element>, ParseError> {
        loop {
            let Some((token, len)) = self.next_token()? else {
                self.check_size(self.consumed + self.pending())?;
                if self.open.is_empty() {
                    self.compact();
                }
                return Ok(None);
            };

            match token {
                Token::Skip => {}
                Token::Text { blank } => {
                    if self.open.is_empty() && !blank {
                        return Err(ParseError::syntax("character data outside of root element"));
                    }
                }
                Token::Start { raw, empty } => {
                    let name = tag_name(&raw).to_string();
                    if self.open.is_empty()
                        && self.mode == ParsingMode::SocketStream
                        && local_name(&name) == STREAM_NAME
                    {
                        let header = self.open_stream(&raw, name)?;
                        self.pos += len;
                        self.consumed = 0;
                        self.compact();
                        return Ok(Some(header));
                    }
                    if self.open.is_empty() {
                        self.start = self.pos;
                    }
                    if !empty {
                        self.pos += len;
                        self.consumed += len;
                        self.open.push(name);
                        continue;
                    }
                    if self.open.is_empty() {
                        self.pos += len;
                        self.consumed += len;
                        return self.complete().map(Some);
                    }
                }
                Token::End(name) => {
                    let Some(expected) = self.open.pop() else {
                        let closes_stream = self.mode == ParsingMode::SocketStream
                            && self
                                .stream
                                .as_ref()
                                .map_or(local_name(&name) == STREAM_NAME, |s| s.name == name);
                        if closes_stream {
                            return Err(ParseError::StreamClosedByPeer);
                        }
                        return Err(ParseError::UnexpectedEndTag {
                            expected: String::new(),
                            found: name,
                        });
                    };
                    if expected != name {
                        return Err(ParseError::UnexpectedEndTag {
                            expected,
                            found: name,
                        });
                    }
                    if self.open.is_empty() {
                        self.pos += len;
                        self.consumed += len;
                        return self.complete().map(Some);
                    }
                }
            }
            self.pos += len;
            self.consumed += len;
        }
    }

    /// Record the stream scope and build the header element.
    fn open_stream(&mut self, raw: &str, name: String) -> Result<Element, ParseError> {
        let mut declarations = String::new();
        let mut default_ns = None;
        for (key, value, quote) in raw_attributes(raw)? {
            if key == "xmlns" {
                default_ns = Some(value.to_string());
            }
            if key == "xmlns" || key.starts_with("xmlns:") {
                declarations.push_str(&format!(" {key}={quote}{value}{quote}"));
            }
        }
        let body = raw.strip_suffix('/').unwrap_or(raw);
        let header = format!("<{body}/>")
            .parse::<Element>()
            .map_err(|e| ParseError::Syntax(format!("invalid stream header: {e}")))?;
        self.stream = Some(StreamScope {
            name,
            declarations,
            default_ns,
        });
        Ok(header)
    }

    /// Parse the framed stanza within its stream scope.
    fn complete(&mut self) -> Result<Element, ParseError> {
        self.check_size(self.consumed)?;
        self.consumed = 0;

        let raw = std::str::from_utf8(&self.buf[self.start..self.pos])
            .map_err(|_| ParseError::syntax("invalid UTF-8"))?;
        let document = match &self.stream {
            Some(scope) => format!("<{0}{1}>{raw}</{0}>", scope.name, scope.declarations),
            None => format!("<doc xmlns='jabber:client'>{raw}</doc>"),
        };
        self.compact();

        let wrapper = document
            .parse::<Element>()
            .map_err(|e| ParseError::Syntax(e.to_string()))?;
        wrapper
            .children()
            .next()
            .cloned()
            .ok_or_else(|| ParseError::syntax("empty element"))
    }

    fn check_size(&self, size: usize) -> Result<(), ParseError> {
        if self.max_stanza_size > 0 && size > self.max_stanza_size {
            return Err(ParseError::TooLargeStanza);
        }
        Ok(())
    }

    fn compact(&mut self) {
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        } else if self.pos > COMPACT_THRESHOLD {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        self.start = self.pos;
    }

    /// Scan one token at the current position. `None` means more input is needed.
    fn next_token(&self) -> Result<Option<(Token, usize)>, ParseError> {
        let data = &self.buf[self.pos..];
        if data.is_empty() {
            return Ok(None);
        }

        if data[0] != b'<' {
            let end = match data.iter().position(|&b| b == b'<') {
                Some(end) => end,
                // Inter-stanza whitespace can be dropped without waiting.
                None if self.open.is_empty() && data.iter().all(u8::is_ascii_whitespace) => data.len(),
                None => return Ok(None),
            };
            let blank = data[..end].iter().all(u8::is_ascii_whitespace);
            return Ok(Some((Token::Text { blank }, end)));
        }

        if data.len() < 2 {
            return Ok(None);
        }

        match data[1] {
            b'?' => {
                if !self.open.is_empty() {
                    return Err(ParseError::syntax("processing instructions are not allowed"));
                }
                Ok(find(data, b"?>").map(|end| (Token::Skip, end + 2)))
            }
            b'!' => self.markup_declaration(data),
            b'/' => {
                let Some(end) = find(data, b">") else {
                    return Ok(None);
                };
                let name = std::str::from_utf8(&data[2..end])
                    .map_err(|_| ParseError::syntax("invalid UTF-8 in end tag"))?
                    .trim();
                Ok(Some((Token::End(name.to_string()), end + 1)))
            }
            _ => {
                let Some(end) = find_tag_end(data) else {
                    return Ok(None);
                };
                let raw = std::str::from_utf8(&data[1..end])
                    .map_err(|_| ParseError::syntax("invalid UTF-8 in start tag"))?;
                let empty = raw.ends_with('/');
                if tag_name(raw).is_empty() {
                    return Err(ParseError::syntax("missing element name"));
                }
                Ok(Some((
                    Token::Start {
                        raw: raw.to_string(),
                        empty,
                    },
                    end + 1,
                )))
            }
        }
    }

    fn markup_declaration(&self, data: &[u8]) -> Result<Option<(Token, usize)>, ParseError> {
        const COMMENT: &[u8] = b"<!--";
        const CDATA: &[u8] = b"<![CDATA[";

        if data.len() < CDATA.len() && (CDATA.starts_with(data) || COMMENT.starts_with(data)) {
            return Ok(None);
        }
        if data.starts_with(COMMENT) {
            if !self.open.is_empty() {
                return Err(ParseError::syntax("comments are not allowed in stanzas"));
            }
            return Ok(find(&data[COMMENT.len()..], b"-->")
                .map(|end| (Token::Skip, COMMENT.len() + end + 3)));
        }
        if data.starts_with(CDATA) {
            if self.open.is_empty() {
                return Err(ParseError::syntax("CDATA section outside of root element"));
            }
            return Ok(find(&data[CDATA.len()..], b"]]>")
                .map(|end| (Token::Text { blank: false }, CDATA.len() + end + 3)));
        }
        Err(ParseError::syntax("document type declarations are not allowed"))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Position of the closing `>` of a start tag, skipping quoted values.
fn find_tag_end(data: &[u8]) -> Option<usize> {
    let mut quote: Option<u8> = None;
    for (i, &b) in data.iter().enumerate().skip(1) {
        match (quote, b) {
            (Some(q), _) if b == q => quote = None,
            (Some(_), _) => {}
            (None, b'\'' | b'"') => quote = Some(b),
            (None, b'>') => return Some(i),
            _ => {}
        }
    }
    None
}

fn tag_name(raw: &str) -> &str {
    let raw = raw.strip_suffix('/').unwrap_or(raw);
    let end = raw
        .find(|c: char| c.is_ascii_whitespace())
        .unwrap_or(raw.len());
    &raw[..end]
}

fn local_name(qualified: &str) -> &str {
    qualified
        .split_once(':')
        .map_or(qualified, |(_, local)| local)
}

/// Split the attributes of a start tag into `(name, raw value, quote)`.
fn raw_attributes(raw: &str) -> Result<Vec<(&str, &str, char)>, ParseError> {
    let raw = raw.strip_suffix('/').unwrap_or(raw);
    let name = tag_name(raw);
    let mut rest = raw[name.len()..].trim_start();
    let mut attrs = Vec::new();

    while !rest.is_empty() {
        let eq = rest
            .find('=')
            .ok_or_else(|| ParseError::Syntax(format!("attribute without value in <{name}>")))?;
        let key = rest[..eq].trim_end();
        let after = rest[eq + 1..].trim_start();
        let quote = after
            .chars()
            .next()
            .filter(|c| *c == '\'' || *c == '"')
            .ok_or_else(|| ParseError::Syntax(format!("unquoted attribute value in <{name}>")))?;
        let body = &after[1..];
        let close = body
            .find(quote)
            .ok_or_else(|| ParseError::Syntax(format!("unterminated attribute value in <{name}>")))?;
        attrs.push((key, &body[..close], quote));
        rest = body[close + 1..].trim_start();
    }
    Ok(attrs)
}
