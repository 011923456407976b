//! DNS SRV record resolution for S2S federation discovery.
//!
//! Resolution order (RFC 6120 Section 3.2, XEP-0368):
//! 1. `_xmpps-server._tcp.{domain}`: direct TLS targets
//! 2. `_xmpp-server._tcp.{domain}`: STARTTLS targets
//! 3. A/AAAA of the domain itself on port 5269
//!
//! Within each SRV set, targets are sorted by priority (ascending) and
//! weight (descending). A target of `.` means the service is unavailable
//! at that domain and is skipped.

use std::net::SocketAddr;
use std::sync::Arc;

use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::rr::rdata::SRV;
use hickory_resolver::proto::ProtoErrorKind;
use hickory_resolver::{ResolveError, ResolveErrorKind, Resolver};
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Default XMPP S2S port as per RFC 6120.
pub const DEFAULT_S2S_PORT: u16 = 5269;

/// DNS resolution errors.
#[derive(Debug, Error)]
pub enum DnsError {
    /// No records found for the domain.
    #[error("no DNS records found for domain: {0}")]
    NoRecords(String),

    /// Domain resolution failed.
    #[error("DNS resolution failed for {domain}: {message}")]
    ResolutionFailed { domain: String, message: String },
}

/// A resolved XMPP server target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub host: String,
    pub port: u16,
    /// Lower is preferred.
    pub priority: u16,
    /// Higher is preferred within the same priority.
    pub weight: u16,
    /// Negotiate TLS right after connecting (`_xmpps-server`).
    pub direct_tls: bool,
}

impl ResolvedTarget {
    pub fn new(host: String, port: u16, priority: u16, weight: u16, direct_tls: bool) -> Self {
        Self {
            host,
            port,
            priority,
            weight,
            direct_tls,
        }
    }

    /// Fallback target (A/AAAA records) on the default port.
    pub fn fallback(host: String) -> Self {
        Self::new(host, DEFAULT_S2S_PORT, 0, 0, false)
    }
}

/// SRV owner name for a domain.
pub fn srv_name(domain: &str, direct_tls: bool) -> String {
    if direct_tls {
        format!("_xmpps-server._tcp.{domain}")
    } else {
        format!("_xmpp-server._tcp.{domain}")
    }
}

/// Sort by priority (ascending), then by weight (descending).
pub fn sort_targets(targets: &mut [ResolvedTarget]) {
    targets.sort_by(|a, b| match a.priority.cmp(&b.priority) {
        std::cmp::Ordering::Equal => b.weight.cmp(&a.weight),
        other => other,
    });
}

/// Drop the null target and the trailing dot of every other one.
fn srv_target(target: &str) -> Option<&str> {
    if target == "." || target.is_empty() {
        return None;
    }
    Some(target.trim_end_matches('.'))
}

/// Type alias for the Tokio-based resolver.
pub type TokioResolver = Resolver<TokioConnectionProvider>;

/// DNS resolver for XMPP S2S federation.
#[derive(Clone)]
pub struct SrvResolver {
    resolver: Arc<TokioResolver>,
}

impl SrvResolver {
    /// Resolver using the default upstream configuration.
    pub fn new() -> Self {
        let resolver = Resolver::builder_with_config(
            ResolverConfig::default(),
            TokioConnectionProvider::default(),
        )
        .build();
        Self {
            resolver: Arc::new(resolver),
        }
    }

    /// Every target worth trying for `domain`, in connection order.
    #[instrument(skip(self), name = "dns.resolve_xmpp_server")]
    pub async fn resolve_xmpp_server(&self, domain: &str) -> Result<Vec<ResolvedTarget>, DnsError> {
        let mut targets = self.srv_targets(domain, true).await;
        targets.extend(self.srv_targets(domain, false).await);
        if !targets.is_empty() {
            debug!(count = targets.len(), "Resolved XMPP S2S targets via SRV");
            return Ok(targets);
        }
        debug!("No SRV targets, falling back to A/AAAA");
        self.resolve_fallback(domain).await
    }

    async fn srv_targets(&self, domain: &str, direct_tls: bool) -> Vec<ResolvedTarget> {
        let name = srv_name(domain, direct_tls);
        match self.resolver.srv_lookup(name.as_str()).await {
            Ok(response) => {
                let records: Vec<&SRV> = response.iter().collect();
                let mut targets = process_srv_records(&records, direct_tls);
                sort_targets(&mut targets);
                targets
            }
            Err(e) if is_no_records_error(&e) => {
                debug!(srv_name = %name, "No SRV records");
                Vec::new()
            }
            Err(e) => {
                warn!(srv_name = %name, error = %e, "SRV lookup failed");
                Vec::new()
            }
        }
    }

    #[instrument(skip(self), name = "dns.resolve_fallback")]
    async fn resolve_fallback(&self, domain: &str) -> Result<Vec<ResolvedTarget>, DnsError> {
        match self.resolver.lookup_ip(domain).await {
            Ok(response) => {
                if response.iter().next().is_none() {
                    return Err(DnsError::NoRecords(domain.to_string()));
                }
                Ok(vec![ResolvedTarget::fallback(domain.to_string())])
            }
            Err(e) => {
                warn!(error = %e, domain = %domain, "Fallback A/AAAA lookup failed");
                Err(DnsError::ResolutionFailed {
                    domain: domain.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// Resolve a target host to socket addresses.
    #[instrument(skip(self), name = "dns.resolve_host")]
    pub async fn resolve_host_to_addrs(
        &self,
        host: &str,
        port: u16,
    ) -> Result<Vec<SocketAddr>, DnsError> {
        if let Ok(ip) = host.parse() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }
        match self.resolver.lookup_ip(host).await {
            Ok(response) => {
                let addrs: Vec<SocketAddr> = response
                    .iter()
                    .map(|ip| SocketAddr::new(ip, port))
                    .collect();
                if addrs.is_empty() {
                    return Err(DnsError::NoRecords(host.to_string()));
                }
                Ok(addrs)
            }
            Err(e) => Err(DnsError::ResolutionFailed {
                domain: host.to_string(),
                message: e.to_string(),
            }),
        }
    }
}

impl Default for SrvResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn process_srv_records(records: &[&SRV], direct_tls: bool) -> Vec<ResolvedTarget> {
    records
        .iter()
        .filter_map(|srv| {
            let target = srv.target().to_utf8();
            let host = srv_target(&target)?;
            Some(ResolvedTarget::new(
                host.to_string(),
                srv.port(),
                srv.priority(),
                srv.weight(),
                direct_tls,
            ))
        })
        .collect()
}

/// In hickory-resolver 0.25, NoRecordsFound lives in ProtoErrorKind.
fn is_no_records_error(error: &ResolveError) -> bool {
    if let ResolveErrorKind::Proto(proto_error) = error.kind() {
        matches!(proto_error.kind(), ProtoErrorKind::NoRecordsFound { .. })
    } else {
        false
    }
}
