//! TLS material loading and rustls configuration.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::ResolvesClientCert;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, RootCertStore, ServerConfig, SignatureScheme};
use tracing::info;

use crate::XmppError;

/// Load a PEM certificate chain and private key into a [`CertifiedKey`].
pub fn load_certified_key(cert_path: &Path, key_path: &Path) -> Result<CertifiedKey, XmppError> {
    let cert_file = File::open(cert_path).map_err(|e| {
        XmppError::config(format!("Failed to open cert file {}: {e}", cert_path.display()))
    })?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<_, _>>()
        .map_err(|e| XmppError::config(format!("Failed to parse certificates: {e}")))?;
    if certs.is_empty() {
        return Err(XmppError::config(format!(
            "No certificates found in {}",
            cert_path.display()
        )));
    }

    let key_file = File::open(key_path).map_err(|e| {
        XmppError::config(format!("Failed to open key file {}: {e}", key_path.display()))
    })?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| XmppError::config(format!("Failed to parse private key: {e}")))?
        .ok_or_else(|| XmppError::config(format!("No private key found in {}", key_path.display())))?;

    certified_key_from_der(certs, key)
}

/// Build a [`CertifiedKey`] from DER material.
pub fn certified_key_from_der(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<CertifiedKey, XmppError> {
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)?;
    info!(certs = certs.len(), "Loaded TLS certificate");
    Ok(CertifiedKey::new(certs, signing_key))
}

/// Picks the certificate matching SNI, falling back to the default host.
#[derive(Debug)]
pub(crate) struct HostCertResolver {
    pub(crate) default: Option<Arc<CertifiedKey>>,
    pub(crate) by_name: HashMap<String, Arc<CertifiedKey>>,
}

impl ResolvesServerCert for HostCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        client_hello
            .server_name()
            .and_then(|name| self.by_name.get(name).cloned())
            .or_else(|| self.default.clone())
    }
}

/// Presents a fixed certificate for client authentication (S2S EXTERNAL).
#[derive(Debug)]
struct StaticClientCert(Arc<CertifiedKey>);

impl ResolvesClientCert for StaticClientCert {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }

    fn has_certs(&self) -> bool {
        true
    }
}

/// Server configuration; when `client_roots` is given, peers may present a
/// certificate (needed to accept SASL EXTERNAL on S2S).
pub(crate) fn server_config(
    resolver: HostCertResolver,
    client_roots: Option<Arc<RootCertStore>>,
) -> Result<ServerConfig, XmppError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;
    let config = match client_roots {
        Some(roots) => {
            let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider)
                .allow_unauthenticated()
                .build()
                .map_err(|e| XmppError::config(format!("Invalid client verifier: {e}")))?;
            builder
                .with_client_cert_verifier(verifier)
                .with_cert_resolver(Arc::new(resolver))
        }
        None => builder
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(resolver)),
    };
    Ok(config)
}

/// Client configuration for outgoing S2S connections.
pub fn client_config(
    roots: RootCertStore,
    identity: Option<Arc<CertifiedKey>>,
) -> Result<ClientConfig, XmppError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots);
    let mut config = match identity {
        Some(cert) => builder.with_client_cert_resolver(Arc::new(StaticClientCert(cert))),
        None => builder.with_no_client_auth(),
    };
    config.alpn_protocols = vec![b"xmpp-server".to_vec()];
    Ok(config)
}

/// Whether the leaf certificate is valid for `domain` (SAN DNS names).
pub fn certificate_matches_domain(cert: &CertificateDer<'_>, domain: &str) -> bool {
    let Ok(server_name) = rustls::pki_types::ServerName::try_from(domain) else {
        return false;
    };
    match webpki::EndEntityCert::try_from(cert) {
        Ok(end_entity) => end_entity.verify_is_valid_for_subject_name(&server_name).is_ok(),
        Err(_) => false,
    }
}
