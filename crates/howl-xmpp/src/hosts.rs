//! Local host registry.
//!
//! Maps every domain served by this node to its certificate and marks one
//! of them as the default. Built once at start-up and shared read-only.

use std::collections::HashMap;
use std::sync::Arc;

use rustls::sign::CertifiedKey;
use rustls::{RootCertStore, ServerConfig};

use crate::tls::{self, HostCertResolver};
use crate::XmppError;

/// Registry of the domains this node serves.
#[derive(Debug, Clone)]
pub struct Hosts {
    default_host: String,
    hosts: HashMap<String, Option<Arc<CertifiedKey>>>,
    /// Registration order, default host first.
    order: Vec<String>,
}

impl Hosts {
    /// Create a registry whose default host has no certificate yet.
    pub fn new(default_host: impl Into<String>) -> Self {
        let default_host = default_host.into();
        let mut hosts = HashMap::new();
        hosts.insert(default_host.clone(), None);
        Self {
            order: vec![default_host.clone()],
            default_host,
            hosts,
        }
    }

    /// Register a host, replacing any previous certificate.
    pub fn register(&mut self, name: impl Into<String>, certificate: Option<Arc<CertifiedKey>>) {
        let name = name.into();
        if !self.hosts.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.hosts.insert(name, certificate);
    }

    pub fn default_host(&self) -> &str {
        &self.default_host
    }

    pub fn is_local_host(&self, name: &str) -> bool {
        self.hosts.contains_key(name)
    }

    /// Certificate for a host, if one was registered.
    pub fn certificate(&self, name: &str) -> Option<Arc<CertifiedKey>> {
        self.hosts.get(name).cloned().flatten()
    }

    /// All registered certificates.
    pub fn certificates(&self) -> Vec<Arc<CertifiedKey>> {
        self.order
            .iter()
            .filter_map(|name| self.certificate(name))
            .collect()
    }

    /// Host names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// TLS acceptor configuration selecting certificates by SNI.
    pub fn server_tls_config(
        &self,
        client_roots: Option<Arc<RootCertStore>>,
    ) -> Result<Arc<ServerConfig>, XmppError> {
        let by_name: HashMap<String, Arc<CertifiedKey>> = self
            .hosts
            .iter()
            .filter_map(|(name, cert)| cert.clone().map(|c| (name.clone(), c)))
            .collect();
        if by_name.is_empty() {
            return Err(XmppError::config("no host has a TLS certificate"));
        }
        let resolver = HostCertResolver {
            default: self.certificate(&self.default_host),
            by_name,
        };
        Ok(Arc::new(tls::server_config(resolver, client_roots)?))
    }
}
