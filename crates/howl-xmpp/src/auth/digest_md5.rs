//! SASL DIGEST-MD5 (RFC 2831).
//!
//! Needs the cleartext password of the account, so it is only offered
//! when explicitly enabled.

use std::collections::HashMap;

use base64::prelude::*;
use md5::{Digest, Md5};
use minidom::Element;
use rand::Rng;

use super::{challenge, decode_payload, is_sasl, success, AuthContext, SaslError};
use crate::repository::constant_time_eq;

const NONCE_LENGTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DigestState {
    Started,
    WaitingResponse,
    WaitingFinalResponse,
    Complete,
}

/// Three-step DIGEST-MD5 authenticator.
pub struct DigestMd5Authenticator {
    ctx: AuthContext,
    state: DigestState,
    nonce: String,
    username: String,
    authenticated: bool,
}

impl DigestMd5Authenticator {
    pub fn new(ctx: AuthContext) -> Self {
        Self {
            ctx,
            state: DigestState::Started,
            nonce: String::new(),
            username: String::new(),
            authenticated: false,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn reset(&mut self) {
        self.state = DigestState::Started;
        self.nonce.clear();
        self.username.clear();
        self.authenticated = false;
    }

    pub async fn process(&mut self, element: &Element) -> Result<Element, SaslError> {
        match self.state {
            DigestState::Started if is_sasl(element, "auth") => {
                let mut nonce = [0u8; NONCE_LENGTH];
                rand::rng().fill(&mut nonce[..]);
                self.nonce = BASE64_STANDARD.encode(nonce);
                let payload = format!(
                    "realm=\"{}\",nonce=\"{}\",qop=\"auth\",charset=utf-8,algorithm=md5-sess",
                    self.ctx.domain, self.nonce
                );
                self.state = DigestState::WaitingResponse;
                Ok(challenge(payload.as_bytes()))
            }
            DigestState::WaitingResponse if is_sasl(element, "response") => {
                let result = self.verify_response(element).await;
                match result {
                    Ok(rspauth) => {
                        self.state = DigestState::WaitingFinalResponse;
                        Ok(challenge(format!("rspauth={rspauth}").as_bytes()))
                    }
                    Err(err) => {
                        self.state = DigestState::Complete;
                        Err(err)
                    }
                }
            }
            DigestState::WaitingFinalResponse if is_sasl(element, "response") => {
                self.state = DigestState::Complete;
                self.authenticated = true;
                Ok(success(None))
            }
            _ => Err(SaslError::MalformedRequest),
        }
    }

    /// Check the client response, returning the `rspauth` value.
    async fn verify_response(&mut self, element: &Element) -> Result<String, SaslError> {
        let payload = decode_payload(element)?;
        if payload.is_empty() {
            return Err(SaslError::MalformedRequest);
        }
        let payload = String::from_utf8(payload).map_err(|_| SaslError::IncorrectEncoding)?;
        let params = DigestParams::parse(&payload)?;

        let domain = self.ctx.domain.as_str();
        if params.realm != domain
            || params.nonce != self.nonce
            || params.nc != "00000001"
            || params.qop != "auth"
        {
            return Err(SaslError::NotAuthorized);
        }
        if params.serv_type.as_deref().is_some_and(|s| s != "xmpp") {
            return Err(SaslError::NotAuthorized);
        }
        if params.digest_uri != format!("xmpp/{domain}") {
            return Err(SaslError::NotAuthorized);
        }

        let user = self
            .ctx
            .users
            .fetch_user(&params.username)
            .await
            .map_err(|_| SaslError::TemporaryAuthFailure)?
            .ok_or(SaslError::NotAuthorized)?;
        let password = user.password.as_deref().ok_or(SaslError::NotAuthorized)?;

        let expected = compute_response(&params, password, "AUTHENTICATE");
        if !constant_time_eq(expected.as_bytes(), params.response.as_bytes()) {
            return Err(SaslError::NotAuthorized);
        }

        self.username = params.username.clone();
        Ok(compute_response(&params, password, ""))
    }
}

/// Fields of a DIGEST-MD5 `digest-response`.
#[derive(Debug, Clone, Default)]
struct DigestParams {
    username: String,
    realm: String,
    nonce: String,
    cnonce: String,
    nc: String,
    qop: String,
    serv_type: Option<String>,
    digest_uri: String,
    response: String,
    authzid: Option<String>,
}

impl DigestParams {
    fn parse(payload: &str) -> Result<Self, SaslError> {
        let mut fields = parse_directives(payload)?;
        let mut take = |key: &str| fields.remove(key);

        let username = take("username").ok_or(SaslError::MalformedRequest)?;
        let response = take("response").ok_or(SaslError::MalformedRequest)?;
        let params = Self {
            username,
            response,
            realm: take("realm").unwrap_or_default(),
            nonce: take("nonce").unwrap_or_default(),
            cnonce: take("cnonce").unwrap_or_default(),
            nc: take("nc").unwrap_or_default(),
            qop: take("qop").unwrap_or_default(),
            serv_type: take("serv-type"),
            digest_uri: take("digest-uri").unwrap_or_default(),
            authzid: take("authzid").filter(|a| !a.is_empty()),
        };
        Ok(params)
    }
}

/// Split `key=value,key="quoted, value"` directives.
fn parse_directives(payload: &str) -> Result<HashMap<String, String>, SaslError> {
    let mut fields = HashMap::new();
    let mut chars = payload.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if key.is_empty() {
            break;
        }
        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => {
                        closed = true;
                        break;
                    }
                    c => value.push(c),
                }
            }
            if !closed {
                return Err(SaslError::MalformedRequest);
            }
        } else {
            while let Some(c) = chars.peek() {
                if *c == ',' {
                    break;
                }
                value.push(*c);
                chars.next();
            }
        }
        fields.insert(key.trim().to_string(), value);
    }
    Ok(fields)
}

/// `HEX(MD5(HEX(MD5(A1)) ":" nonce ":" nc ":" cnonce ":" qop ":" HEX(MD5(A2))))`
///
/// With A1 = `MD5(user:realm:password) ":" nonce ":" cnonce [":" authzid]`
/// and A2 = `<method> ":" digest-uri`.
fn compute_response(params: &DigestParams, password: &str, method: &str) -> String {
    let credentials = Md5::digest(
        format!("{}:{}:{}", params.username, params.realm, password).as_bytes(),
    );

    let mut a1 = credentials.to_vec();
    a1.extend_from_slice(format!(":{}:{}", params.nonce, params.cnonce).as_bytes());
    if let Some(authzid) = &params.authzid {
        a1.extend_from_slice(format!(":{authzid}").as_bytes());
    }
    let a2 = format!("{method}:{}", params.digest_uri);

    let ha1 = hex::encode(Md5::digest(&a1));
    let ha2 = hex::encode(Md5::digest(a2.as_bytes()));
    let kd = format!(
        "{ha1}:{}:{}:{}:{}:{ha2}",
        params.nonce, params.nc, params.cnonce, params.qop
    );
    hex::encode(Md5::digest(kd.as_bytes()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::parser::ns;
    use crate::repository::{MemoryUserRepository, User, UserRepository};

    fn sasl(name: &str, payload: &str) -> Element {
        let builder = Element::builder(name, ns::SASL);
        if payload.is_empty() {
            return builder.build();
        }
        builder.append(BASE64_STANDARD.encode(payload)).build()
    }

    async fn authenticator() -> DigestMd5Authenticator {
        let users = Arc::new(MemoryUserRepository::new());
        users
            .upsert_user(&User::with_password("mariana", "1234", 1024).with_cleartext("1234"))
            .await
            .unwrap();
        DigestMd5Authenticator::new(AuthContext {
            users,
            domain: "jackal.im".to_string(),
            channel_binding: None,
        })
    }

    fn client_response(nonce: &str, password: &str, digest_uri: &str) -> (String, String) {
        let mut params = DigestParams {
            username: "mariana".to_string(),
            realm: "jackal.im".to_string(),
            nonce: nonce.to_string(),
            cnonce: "OA6MHXh6VqTrRk".to_string(),
            nc: "00000001".to_string(),
            qop: "auth".to_string(),
            digest_uri: digest_uri.to_string(),
            ..Default::default()
        };
        params.response = compute_response(&params, password, "AUTHENTICATE");
        let payload = format!(
            "username=\"{}\",realm=\"{}\",nonce=\"{}\",cnonce=\"{}\",nc={},qop={},\
             digest-uri=\"{}\",response={},charset=utf-8",
            params.username,
            params.realm,
            params.nonce,
            params.cnonce,
            params.nc,
            params.qop,
            params.digest_uri,
            params.response
        );
        (payload, compute_response(&params, password, ""))
    }

    fn challenge_nonce(challenge: &Element) -> String {
        let decoded = String::from_utf8(BASE64_STANDARD.decode(challenge.text()).unwrap()).unwrap();
        parse_directives(&decoded).unwrap()["nonce"].clone()
    }

    #[tokio::test]
    async fn test_digest_md5_exchange() {
        let mut authr = authenticator().await;

        let first = authr.process(&sasl("auth", "")).await.unwrap();
        assert_eq!(first.name(), "challenge");
        let nonce = challenge_nonce(&first);
        assert_eq!(BASE64_STANDARD.decode(&nonce).unwrap().len(), 32);

        let (response, rspauth) = client_response(&nonce, "1234", "xmpp/jackal.im");
        let second = authr.process(&sasl("response", &response)).await.unwrap();
        let decoded = String::from_utf8(BASE64_STANDARD.decode(second.text()).unwrap()).unwrap();
        assert_eq!(decoded, format!("rspauth={rspauth}"));
        assert!(!authr.authenticated());

        let third = authr.process(&sasl("response", "")).await.unwrap();
        assert_eq!(third.name(), "success");
        assert!(authr.authenticated());
        assert_eq!(authr.username(), "mariana");
    }

    #[tokio::test]
    async fn test_digest_md5_rejects_bad_input() {
        let mut authr = authenticator().await;
        let nonce = challenge_nonce(&authr.process(&sasl("auth", "")).await.unwrap());
        let (response, _) = client_response(&nonce, "wrong", "xmpp/jackal.im");
        assert_eq!(
            authr.process(&sasl("response", &response)).await.unwrap_err(),
            SaslError::NotAuthorized
        );

        authr.reset();
        let nonce = challenge_nonce(&authr.process(&sasl("auth", "")).await.unwrap());
        let (response, _) = client_response(&nonce, "1234", "xmpp/jabber.org");
        assert_eq!(
            authr.process(&sasl("response", &response)).await.unwrap_err(),
            SaslError::NotAuthorized
        );
    }

    #[test]
    fn test_parse_directives() {
        let fields =
            parse_directives("realm=\"jackal.im\",nonce=\"a,b\\\"c\",qop=auth, nc=00000001").unwrap();
        assert_eq!(fields["realm"], "jackal.im");
        assert_eq!(fields["nonce"], "a,b\"c");
        assert_eq!(fields["qop"], "auth");
        assert_eq!(fields["nc"], "00000001");

        assert!(parse_directives("realm=\"open").is_err());
    }
}
