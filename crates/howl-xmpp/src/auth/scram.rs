//! SCRAM SASL mechanisms.
//!
//! Implements the server side of SCRAM authentication per:
//! - RFC 5802: Salted Challenge Response Authentication Mechanism (SCRAM)
//! - RFC 7677: SCRAM-SHA-256 and SCRAM-SHA-256-PLUS
//!
//! ## Protocol Flow
//!
//! 1. Client sends client-first-message: `n,,n=user,r=clientnonce`
//! 2. Server sends server-first-message: `r=clientnonce+servernonce,s=salt,i=iterations`
//! 3. Client sends client-final-message: `c=channel,r=nonce,p=clientproof`
//! 4. Server verifies and sends server-final-message: `v=serversignature`
//!
//! The salted password is never computed at authentication time: it is
//! read from the stored [`User`](crate::repository::User) for the selected hash.

use base64::prelude::*;
use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use minidom::Element;
use pbkdf2::pbkdf2_hmac;
use rand::Rng;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{challenge, decode_payload, is_sasl, mechanism, success, AuthContext, SaslError};
use crate::repository::constant_time_eq;

/// Default number of PBKDF2 iterations.
/// RFC 7677 recommends at least 4096.
pub const DEFAULT_ITERATIONS: u32 = 4096;

/// Length of generated nonce in bytes (will be base64 encoded).
const NONCE_LENGTH: usize = 24;

const SALT_LENGTH: usize = 16;

/// Hash function of a SCRAM family member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScramHash {
    Sha1,
    Sha256,
}

impl ScramHash {
    /// Mechanism name, with or without channel binding.
    pub fn mechanism(&self, plus: bool) -> &'static str {
        match (self, plus) {
            (Self::Sha1, false) => mechanism::SCRAM_SHA_1,
            (Self::Sha1, true) => mechanism::SCRAM_SHA_1_PLUS,
            (Self::Sha256, false) => mechanism::SCRAM_SHA_256,
            (Self::Sha256, true) => mechanism::SCRAM_SHA_256_PLUS,
        }
    }

    fn output_len(&self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
        }
    }

    fn hmac(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>, InvalidLength> {
        Ok(match self {
            Self::Sha1 => {
                let mut mac = Hmac::<Sha1>::new_from_slice(key)?;
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            Self::Sha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(key)?;
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        })
    }

    fn hash(&self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha1 => Sha1::digest(data).to_vec(),
            Self::Sha256 => Sha256::digest(data).to_vec(),
        }
    }
}

/// Hi() function from RFC 5802: PBKDF2 with the selected HMAC.
pub fn salted_password(hash: ScramHash, password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut output = vec![0u8; hash.output_len()];
    match hash {
        ScramHash::Sha1 => pbkdf2_hmac::<Sha1>(password, salt, iterations, &mut output),
        ScramHash::Sha256 => pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut output),
    }
    output
}

/// Derive `(StoredKey, ServerKey)` from a salted password.
pub fn generate_scram_keys(
    hash: ScramHash,
    salted_password: &[u8],
) -> Result<(Vec<u8>, Vec<u8>), InvalidLength> {
    // ClientKey = HMAC(SaltedPassword, "Client Key")
    let client_key = hash.hmac(salted_password, b"Client Key")?;
    // StoredKey = H(ClientKey)
    let stored_key = hash.hash(&client_key);
    // ServerKey = HMAC(SaltedPassword, "Server Key")
    let server_key = hash.hmac(salted_password, b"Server Key")?;
    Ok((stored_key, server_key))
}

/// Generate a random salt for SCRAM.
pub fn generate_salt() -> Vec<u8> {
    let mut salt = vec![0u8; SALT_LENGTH];
    rand::rng().fill(&mut salt[..]);
    salt
}

/// Generate a random nonce string.
fn generate_nonce() -> String {
    let mut nonce_bytes = vec![0u8; NONCE_LENGTH];
    rand::rng().fill(&mut nonce_bytes[..]);
    BASE64_STANDARD.encode(&nonce_bytes)
}

/// SCRAM authentication state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScramState {
    /// Waiting for client-first-message
    Initial,
    /// Received client-first, waiting for client-final
    WaitingForClientFinal,
    /// Authentication complete (success or failure)
    Complete,
}

/// GS2 channel-binding flag of the client-first-message.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Gs2CbindFlag {
    /// `n`: client does not support channel binding.
    NotSupported,
    /// `y`: client supports it but thinks the server does not.
    NotUsed,
    /// `p=<type>`: client requires channel binding of the given type.
    Required(String),
}

/// Parsed client-first-message components.
#[derive(Debug, Clone)]
struct ClientFirstMessage {
    cbind_flag: Gs2CbindFlag,
    authzid: Option<String>,
    username: String,
    client_nonce: String,
    /// `gs2-cbind-flag "," [authzid] ","`, echoed back in `c=`
    gs2_header: String,
    /// The bare message (without GS2 header) for auth message computation
    bare: String,
}

/// Parsed client-final-message components.
#[derive(Debug, Clone)]
struct ClientFinalMessage {
    /// Channel binding data (base64)
    channel_binding: String,
    /// Combined nonce
    nonce: String,
    /// Client proof (base64)
    proof: String,
    /// Message without proof for auth message computation
    without_proof: String,
}

/// Server side of one SCRAM exchange.
pub struct ScramAuthenticator {
    hash: ScramHash,
    plus: bool,
    ctx: AuthContext,
    state: ScramState,
    gs2_header: String,
    client_first_message_bare: String,
    server_first_message: String,
    combined_nonce: String,
    username: String,
    stored_key: Vec<u8>,
    server_key: Vec<u8>,
    authenticated: bool,
    fixed_server_nonce: Option<String>,
}

impl ScramAuthenticator {
    pub fn new(hash: ScramHash, plus: bool, ctx: AuthContext) -> Self {
        Self {
            hash,
            plus,
            ctx,
            state: ScramState::Initial,
            gs2_header: String::new(),
            client_first_message_bare: String::new(),
            server_first_message: String::new(),
            combined_nonce: String::new(),
            username: String::new(),
            stored_key: Vec::new(),
            server_key: Vec::new(),
            authenticated: false,
            fixed_server_nonce: None,
        }
    }

    pub fn mechanism(&self) -> &'static str {
        self.hash.mechanism(self.plus)
    }

    pub fn uses_channel_binding(&self) -> bool {
        self.plus
    }

    pub fn state(&self) -> ScramState {
        self.state
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn reset(&mut self) {
        self.state = ScramState::Initial;
        self.gs2_header.clear();
        self.client_first_message_bare.clear();
        self.server_first_message.clear();
        self.combined_nonce.clear();
        self.username.clear();
        self.stored_key.clear();
        self.server_key.clear();
        self.authenticated = false;
    }

    pub async fn process(&mut self, element: &Element) -> Result<Element, SaslError> {
        match self.state {
            ScramState::Initial if is_sasl(element, "auth") => {
                let payload = decode_payload(element)?;
                if payload.is_empty() {
                    return Err(SaslError::MalformedRequest);
                }
                let client_first =
                    String::from_utf8(payload).map_err(|_| SaslError::IncorrectEncoding)?;
                let server_first = self.process_client_first(&client_first).await?;
                Ok(challenge(server_first.as_bytes()))
            }
            ScramState::WaitingForClientFinal if is_sasl(element, "response") => {
                let payload = decode_payload(element)?;
                let client_final =
                    String::from_utf8(payload).map_err(|_| SaslError::IncorrectEncoding)?;
                let result = self.process_client_final(&client_final);
                self.state = ScramState::Complete;
                let server_final = result?;
                self.authenticated = true;
                Ok(success(Some(server_final.as_bytes())))
            }
            _ => Err(SaslError::MalformedRequest),
        }
    }

    /// Process the client-first-message and generate server-first-message.
    async fn process_client_first(&mut self, client_first: &str) -> Result<String, SaslError> {
        let parsed = parse_client_first(client_first)?;
        self.check_channel_binding_flag(&parsed.cbind_flag)?;

        if let Some(authzid) = &parsed.authzid {
            let bare = format!("{}@{}", parsed.username, self.ctx.domain);
            if *authzid != parsed.username && *authzid != bare {
                return Err(SaslError::NotAuthorized);
            }
        }

        let user = self
            .ctx
            .users
            .fetch_user(&parsed.username)
            .await
            .map_err(|_| SaslError::TemporaryAuthFailure)?
            .ok_or(SaslError::NotAuthorized)?;
        let salted = user.salted_password(self.hash);
        if salted.is_empty() {
            debug!(username = %parsed.username, mechanism = self.mechanism(), "No salted password stored");
            return Err(SaslError::NotAuthorized);
        }
        let (stored_key, server_key) =
            generate_scram_keys(self.hash, salted).map_err(|_| SaslError::TemporaryAuthFailure)?;

        let server_nonce = self
            .fixed_server_nonce
            .clone()
            .unwrap_or_else(generate_nonce);
        self.combined_nonce = format!("{}{}", parsed.client_nonce, server_nonce);

        // Build server-first-message: r=nonce,s=salt,i=iterations
        self.server_first_message = format!(
            "r={},s={},i={}",
            self.combined_nonce,
            BASE64_STANDARD.encode(&user.salt),
            user.iteration_count
        );
        self.username = parsed.username;
        self.gs2_header = parsed.gs2_header;
        self.client_first_message_bare = parsed.bare;
        self.stored_key = stored_key;
        self.server_key = server_key;
        self.state = ScramState::WaitingForClientFinal;

        Ok(self.server_first_message.clone())
    }

    /// Process the client-final-message, returning server-final-message.
    fn process_client_final(&self, client_final: &str) -> Result<String, SaslError> {
        let parsed = parse_client_final(client_final)?;

        let mut cbind_input = self.gs2_header.as_bytes().to_vec();
        if self.plus {
            let binding = self
                .ctx
                .channel_binding
                .as_ref()
                .ok_or(SaslError::NotAuthorized)?;
            cbind_input.extend_from_slice(&binding.data);
        }
        if parsed.channel_binding != BASE64_STANDARD.encode(&cbind_input) {
            return Err(SaslError::NotAuthorized);
        }
        if parsed.nonce != self.combined_nonce {
            return Err(SaslError::NotAuthorized);
        }

        // AuthMessage = client-first-message-bare + "," + server-first-message + "," + client-final-message-without-proof
        let auth_message = format!(
            "{},{},{}",
            self.client_first_message_bare, self.server_first_message, parsed.without_proof
        );

        // ClientSignature = HMAC(StoredKey, AuthMessage)
        let client_signature = self
            .hash
            .hmac(&self.stored_key, auth_message.as_bytes())
            .map_err(|_| SaslError::TemporaryAuthFailure)?;

        let client_proof = BASE64_STANDARD
            .decode(&parsed.proof)
            .map_err(|_| SaslError::IncorrectEncoding)?;
        if client_proof.len() != client_signature.len() {
            return Err(SaslError::NotAuthorized);
        }

        // ClientKey = ClientProof XOR ClientSignature
        let client_key: Vec<u8> = client_proof
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();

        // Verify: H(ClientKey) == StoredKey
        if !constant_time_eq(&self.hash.hash(&client_key), &self.stored_key) {
            debug!(username = %self.username, mechanism = self.mechanism(), "Client proof mismatch");
            return Err(SaslError::NotAuthorized);
        }

        // ServerSignature = HMAC(ServerKey, AuthMessage)
        let server_signature = self
            .hash
            .hmac(&self.server_key, auth_message.as_bytes())
            .map_err(|_| SaslError::TemporaryAuthFailure)?;
        Ok(format!("v={}", BASE64_STANDARD.encode(&server_signature)))
    }

    fn check_channel_binding_flag(&self, flag: &Gs2CbindFlag) -> Result<(), SaslError> {
        let binding = self.ctx.channel_binding.as_ref();
        match (flag, self.plus) {
            (Gs2CbindFlag::Required(cb_type), true) => match binding {
                Some(binding) if binding.mechanism == cb_type => Ok(()),
                _ => Err(SaslError::NotAuthorized),
            },
            (_, true) => Err(SaslError::NotAuthorized),
            (Gs2CbindFlag::Required(_), false) => Err(SaslError::NotAuthorized),
            // The client believes we lack channel binding while we offer it: downgrade.
            (Gs2CbindFlag::NotUsed, false) if binding.is_some() => Err(SaslError::NotAuthorized),
            _ => Ok(()),
        }
    }

    #[cfg(test)]
    fn with_server_nonce(mut self, nonce: &str) -> Self {
        self.fixed_server_nonce = Some(nonce.to_string());
        self
    }
}

/// Parse client-first-message.
///
/// Format: `gs2-header client-first-message-bare`
/// gs2-header: `[flag],authzid,`
/// client-first-message-bare: `n=username,r=nonce[,extensions]`
fn parse_client_first(message: &str) -> Result<ClientFirstMessage, SaslError> {
    let parts: Vec<&str> = message.splitn(3, ',').collect();
    if parts.len() < 3 {
        return Err(SaslError::MalformedRequest);
    }

    let cbind_flag = match parts[0] {
        "n" => Gs2CbindFlag::NotSupported,
        "y" => Gs2CbindFlag::NotUsed,
        flag => match flag.strip_prefix("p=") {
            Some(cb_type) if !cb_type.is_empty() => Gs2CbindFlag::Required(cb_type.to_string()),
            _ => return Err(SaslError::MalformedRequest),
        },
    };

    let authzid = if let Some(name) = parts[1].strip_prefix("a=") {
        Some(decode_sasl_name(name)?)
    } else if parts[1].is_empty() {
        None
    } else {
        return Err(SaslError::MalformedRequest);
    };

    let bare = parts[2].to_string();
    let mut username = None;
    let mut client_nonce = None;

    for attr in bare.split(',') {
        if let Some(val) = attr.strip_prefix("n=") {
            username = Some(decode_sasl_name(val)?);
        } else if let Some(val) = attr.strip_prefix("r=") {
            client_nonce = Some(val.to_string());
        } else if attr.starts_with("m=") {
            // Mandatory extensions are not supported.
            return Err(SaslError::MalformedRequest);
        }
    }

    let username = username
        .filter(|u| !u.is_empty())
        .ok_or(SaslError::MalformedRequest)?;
    let client_nonce = client_nonce
        .filter(|n| !n.is_empty())
        .ok_or(SaslError::MalformedRequest)?;

    Ok(ClientFirstMessage {
        cbind_flag,
        authzid,
        username,
        client_nonce,
        gs2_header: format!("{},{},", parts[0], parts[1]),
        bare,
    })
}

/// Parse client-final-message.
///
/// Format: `c=channel-binding,r=nonce,p=proof`
fn parse_client_final(message: &str) -> Result<ClientFinalMessage, SaslError> {
    let mut channel_binding = None;
    let mut nonce = None;
    let mut proof = None;

    let proof_idx = message.rfind(",p=").ok_or(SaslError::MalformedRequest)?;
    let without_proof = &message[..proof_idx];

    for attr in message.split(',') {
        if let Some(val) = attr.strip_prefix("c=") {
            channel_binding = Some(val.to_string());
        } else if let Some(val) = attr.strip_prefix("r=") {
            nonce = Some(val.to_string());
        } else if let Some(val) = attr.strip_prefix("p=") {
            proof = Some(val.to_string());
        }
    }

    Ok(ClientFinalMessage {
        channel_binding: channel_binding.ok_or(SaslError::MalformedRequest)?,
        nonce: nonce.ok_or(SaslError::MalformedRequest)?,
        proof: proof.ok_or(SaslError::MalformedRequest)?,
        without_proof: without_proof.to_string(),
    })
}

/// Decode a SASL name (RFC 5802 escaping).
/// - `=2C` -> `,`
/// - `=3D` -> `=`
fn decode_sasl_name(name: &str) -> Result<String, SaslError> {
    let mut result = String::new();
    let mut chars = name.chars();

    while let Some(c) = chars.next() {
        if c == '=' {
            let escape: String = chars.by_ref().take(2).collect();
            match escape.as_str() {
                "2C" => result.push(','),
                "3D" => result.push('='),
                _ => return Err(SaslError::MalformedRequest),
            }
        } else {
            result.push(c);
        }
    }

    Ok(result)
}

/// Encode a SASL name (RFC 5802 escaping).
pub fn encode_sasl_name(name: &str) -> String {
    let mut result = String::new();
    for c in name.chars() {
        match c {
            ',' => result.push_str("=2C"),
            '=' => result.push_str("=3D"),
            _ => result.push(c),
        }
    }
    result
}
