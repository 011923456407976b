//! SASL PLAIN (RFC 4616).

use minidom::Element;
use tracing::debug;

use super::{decode_payload, is_sasl, success, AuthContext, SaslError};

/// Single-step PLAIN authenticator.
pub struct PlainAuthenticator {
    ctx: AuthContext,
    username: String,
    authenticated: bool,
}

impl PlainAuthenticator {
    pub fn new(ctx: AuthContext) -> Self {
        Self {
            ctx,
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
        self.username.clear();
        self.authenticated = false;
    }

    pub async fn process(&mut self, element: &Element) -> Result<Element, SaslError> {
        if !is_sasl(element, "auth") || self.authenticated {
            return Err(SaslError::MalformedRequest);
        }
        let payload = decode_payload(element)?;
        if payload.is_empty() {
            return Err(SaslError::MalformedRequest);
        }
        let (authzid, username, password) = parse_plain(&payload)?;

        if !authzid.is_empty()
            && authzid != username
            && authzid != format!("{username}@{}", self.ctx.domain)
        {
            return Err(SaslError::NotAuthorized);
        }

        let user = self
            .ctx
            .users
            .fetch_user(&username)
            .await
            .map_err(|_| SaslError::TemporaryAuthFailure)?
            .ok_or(SaslError::NotAuthorized)?;
        if !user.verify_password(&password) {
            debug!(username = %username, "PLAIN password mismatch");
            return Err(SaslError::NotAuthorized);
        }

        self.username = username;
        self.authenticated = true;
        Ok(success(None))
    }
}

/// Split `authzid \0 authcid \0 password`.
fn parse_plain(payload: &[u8]) -> Result<(String, String, String), SaslError> {
    let parts: Vec<&[u8]> = payload.split(|&b| b == 0).collect();
    let [authzid, username, password] = parts[..] else {
        return Err(SaslError::IncorrectEncoding);
    };
    let decode = |bytes: &[u8]| {
        String::from_utf8(bytes.to_vec()).map_err(|_| SaslError::IncorrectEncoding)
    };
    let username = decode(username)?;
    if username.is_empty() {
        return Err(SaslError::NotAuthorized);
    }
    Ok((decode(authzid)?, username, decode(password)?))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use base64::prelude::*;

    use super::*;
    use crate::parser::ns;
    use crate::repository::{MemoryUserRepository, User, UserRepository};

    async fn authenticator() -> PlainAuthenticator {
        let users = Arc::new(MemoryUserRepository::new());
        users
            .upsert_user(&User::with_password("mariana", "1234", 1024))
            .await
            .unwrap();
        PlainAuthenticator::new(AuthContext {
            users,
            domain: "jackal.im".to_string(),
            channel_binding: None,
        })
    }

    fn auth(payload: &str) -> Element {
        Element::builder("auth", ns::SASL)
            .attr("mechanism", "PLAIN")
            .append(payload)
            .build()
    }

    #[tokio::test]
    async fn test_plain_success() {
        let mut authr = authenticator().await;
        let reply = authr.process(&auth("AG1hcmlhbmEAMTIzNA==")).await.unwrap();

        assert!(reply.is("success", ns::SASL));
        assert!(reply.text().is_empty());
        assert!(authr.authenticated());
        assert_eq!(authr.username(), "mariana");
    }

    #[tokio::test]
    async fn test_plain_failures() {
        let mut authr = authenticator().await;

        assert_eq!(
            authr.process(&auth("")).await.unwrap_err(),
            SaslError::MalformedRequest
        );
        assert_eq!(
            authr.process(&auth("not base64!")).await.unwrap_err(),
            SaslError::IncorrectEncoding
        );
        // "mariana\01234": only two fields
        assert_eq!(
            authr.process(&auth("bWFyaWFuYQAxMjM0")).await.unwrap_err(),
            SaslError::IncorrectEncoding
        );
        // "\0mariana\0bad"
        assert_eq!(
            authr.process(&auth("AG1hcmlhbmEAYmFk")).await.unwrap_err(),
            SaslError::NotAuthorized
        );
        // "\0ortuman\01234"
        assert_eq!(
            authr.process(&auth("AG9ydHVtYW4AMTIzNA==")).await.unwrap_err(),
            SaslError::NotAuthorized
        );
        assert!(!authr.authenticated());
    }

    #[tokio::test]
    async fn test_plain_authzid() {
        let mut authr = authenticator().await;
        let payload = BASE64_STANDARD.encode("mariana@jackal.im\0mariana\x001234");
        authr.process(&auth(&payload)).await.unwrap();
        assert!(authr.authenticated());

        let mut authr = authenticator().await;
        let payload = BASE64_STANDARD.encode("ortuman\0mariana\x001234");
        assert_eq!(
            authr.process(&auth(&payload)).await.unwrap_err(),
            SaslError::NotAuthorized
        );
    }
}
