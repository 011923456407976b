//! Server configuration.
//!
//! Loaded from an optional TOML file overridden by `HOWL__`-prefixed
//! environment variables, e.g. `HOWL__C2S__PORT=5223` or
//! `HOWL__S2S__DIALBACK_SECRET=...`. Durations are given in seconds.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Environment, File, FileFormat};
use howl_xmpp::auth::SaslConfig;
use howl_xmpp::c2s::{C2sConfig, ResourceConflict};
use howl_xmpp::cluster::LeaseConfig;
use howl_xmpp::component::ComponentConfig;
use howl_xmpp::s2s::S2sConfig;
use howl_xmpp::server::{ClusterConfig, HostConfig};
use howl_xmpp::stream_management::SmConfig;
use howl_xmpp::XmppServerConfig;
use serde::{Deserialize, Serialize};

/// Default cost of SCRAM salted passwords.
pub const DEFAULT_SCRAM_ITERATIONS: u32 = 4096;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// The first entry is the default host.
    pub hosts: Vec<HostSection>,
    pub c2s: C2sSection,
    pub s2s: S2sSection,
    pub component: ComponentSection,
    pub stream_management: SmSection,
    pub cluster: ClusterSection,
    /// Accounts provisioned into the in-memory user repository at startup.
    pub users: Vec<UserSection>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostSection {
    pub domain: String,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct C2sSection {
    pub bind_addr: IpAddr,
    pub port: u16,
    pub connect_timeout: u64,
    pub keep_alive_timeout: u64,
    pub request_timeout: u64,
    pub max_stanza_size: usize,
    pub direct_tls: bool,
    /// Bytes per second; 0 is unlimited.
    pub rate_limit: u32,
    pub rate_limit_burst: u32,
    pub compression: bool,
    /// `reject` or `override`.
    pub resource_conflict: String,
    pub sasl: SaslSection,
}

impl Default for C2sSection {
    fn default() -> Self {
        let defaults = C2sConfig::default();
        Self {
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            port: 5222,
            connect_timeout: defaults.connect_timeout.as_secs(),
            keep_alive_timeout: defaults.keep_alive_timeout.as_secs(),
            request_timeout: defaults.request_timeout.as_secs(),
            max_stanza_size: defaults.max_stanza_size,
            direct_tls: defaults.direct_tls,
            rate_limit: defaults.rate_limit,
            rate_limit_burst: defaults.rate_limit_burst,
            compression: defaults.compression,
            resource_conflict: "override".to_string(),
            sasl: SaslSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SaslSection {
    /// Allowed mechanisms; empty offers every supported one.
    pub mechanisms: Vec<String>,
    pub digest_md5_enabled: bool,
    pub scram_iterations: u32,
}

impl Default for SaslSection {
    fn default() -> Self {
        Self {
            mechanisms: Vec::new(),
            digest_md5_enabled: false,
            scram_iterations: DEFAULT_SCRAM_ITERATIONS,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct S2sSection {
    pub enabled: bool,
    pub bind_addr: IpAddr,
    pub port: u16,
    /// Direct TLS listener port (XEP-0368); unset disables it.
    pub direct_tls_port: Option<u16>,
    pub dialback_secret: String,
    pub dial_timeout: u64,
    pub keep_alive_timeout: u64,
    pub request_timeout: u64,
    pub max_stanza_size: usize,
}

impl Default for S2sSection {
    fn default() -> Self {
        let defaults = S2sConfig::default();
        Self {
            enabled: false,
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            port: 5269,
            direct_tls_port: None,
            dialback_secret: String::new(),
            dial_timeout: defaults.dial_timeout.as_secs(),
            keep_alive_timeout: defaults.keep_alive_timeout.as_secs(),
            request_timeout: defaults.request_timeout.as_secs(),
            max_stanza_size: defaults.max_stanza_size,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ComponentSection {
    pub enabled: bool,
    pub bind_addr: IpAddr,
    pub port: u16,
    /// Shared secret per component domain.
    pub secrets: HashMap<String, String>,
}

impl Default for ComponentSection {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            port: 5275,
            secrets: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SmSection {
    pub enabled: bool,
    pub hibernate_time: u64,
    pub request_ack_interval: u64,
    pub wait_for_ack_timeout: u64,
    pub max_queue_size: usize,
}

impl Default for SmSection {
    fn default() -> Self {
        let defaults = SmConfig::default();
        Self {
            enabled: true,
            hibernate_time: defaults.hibernate_time.as_secs(),
            request_ack_interval: defaults.request_ack_interval.as_secs(),
            wait_for_ack_timeout: defaults.wait_for_ack_timeout.as_secs(),
            max_queue_size: defaults.max_queue_size,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClusterSection {
    /// Port other members reach this node at.
    pub port: u16,
    pub lease_ttl: u64,
    pub max_keep_alive_retries: u32,
}

impl Default for ClusterSection {
    fn default() -> Self {
        let defaults = LeaseConfig::default();
        Self {
            port: ClusterConfig::default().port,
            lease_ttl: defaults.ttl.as_secs(),
            max_keep_alive_retries: defaults.max_keep_alive_retries,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserSection {
    pub username: String,
    pub password: String,
}

/// Values read from fixed environment variables.
#[derive(Debug, Clone, Default)]
pub struct Environ {
    pub instance_id: Option<String>,
    pub hostname: Option<String>,
    pub log_stanzas: bool,
}

impl Environ {
    /// Read `INSTANCE_ID`, `HOSTNAME` and `LOG_STANZAS`.
    pub fn from_env() -> Self {
        Self {
            instance_id: non_empty(std::env::var("INSTANCE_ID").ok()),
            hostname: non_empty(std::env::var("HOSTNAME").ok()),
            log_stanzas: std::env::var("LOG_STANZAS").is_ok_and(|v| v == "on"),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl ServerConfig {
    /// Load `path` (if it exists) and apply `HOWL__*` overrides.
    pub fn load(path: &Path) -> Result<Self, config::ConfigError> {
        Self::load_with(path, Environment::with_prefix("HOWL"))
    }

    fn load_with(path: &Path, env: Environment) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(File::from(path).format(FileFormat::Toml).required(false))
            .add_source(
                env.prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("c2s.sasl.mechanisms"),
            )
            .build()?
            .try_deserialize()
    }

    /// Resolve into the library configuration.
    pub fn into_server_config(self, environ: &Environ) -> anyhow::Result<XmppServerConfig> {
        let hosts = if self.hosts.is_empty() {
            vec![HostConfig {
                domain: "localhost".to_string(),
                cert_path: None,
                key_path: None,
            }]
        } else {
            self.hosts
                .into_iter()
                .map(|h| HostConfig {
                    domain: h.domain,
                    cert_path: h.cert_path,
                    key_path: h.key_path,
                })
                .collect()
        };

        let resource_conflict: ResourceConflict = self.c2s.resource_conflict.parse()?;
        let c2s = C2sConfig {
            connect_timeout: secs(self.c2s.connect_timeout),
            keep_alive_timeout: secs(self.c2s.keep_alive_timeout),
            request_timeout: secs(self.c2s.request_timeout),
            max_stanza_size: self.c2s.max_stanza_size,
            direct_tls: self.c2s.direct_tls,
            rate_limit: self.c2s.rate_limit,
            rate_limit_burst: self.c2s.rate_limit_burst,
            compression: self.c2s.compression,
            resource_conflict,
            sasl: SaslConfig {
                mechanisms: self.c2s.sasl.mechanisms,
                digest_md5_enabled: self.c2s.sasl.digest_md5_enabled,
            },
            log_stanzas: environ.log_stanzas,
            ..C2sConfig::default()
        };

        if self.s2s.enabled && self.s2s.dialback_secret.is_empty() {
            anyhow::bail!("s2s.dialback_secret must be set when federation is enabled");
        }
        let s2s = S2sConfig {
            dialback_secret: self.s2s.dialback_secret,
            dial_timeout: secs(self.s2s.dial_timeout),
            keep_alive_timeout: secs(self.s2s.keep_alive_timeout),
            request_timeout: secs(self.s2s.request_timeout),
            max_stanza_size: self.s2s.max_stanza_size,
            log_stanzas: environ.log_stanzas,
            ..S2sConfig::default()
        };
        let (s2s_addr, s2s_direct_tls_addr) = if self.s2s.enabled {
            (
                Some(SocketAddr::new(self.s2s.bind_addr, self.s2s.port)),
                self.s2s
                    .direct_tls_port
                    .map(|port| SocketAddr::new(self.s2s.bind_addr, port)),
            )
        } else {
            (None, None)
        };

        let component = ComponentConfig {
            secrets: self.component.secrets,
            log_stanzas: environ.log_stanzas,
            ..ComponentConfig::default()
        };
        let component_addr = self
            .component
            .enabled
            .then(|| SocketAddr::new(self.component.bind_addr, self.component.port));

        let stream_management = self.stream_management.enabled.then(|| SmConfig {
            hibernate_time: secs(self.stream_management.hibernate_time),
            request_ack_interval: secs(self.stream_management.request_ack_interval),
            wait_for_ack_timeout: secs(self.stream_management.wait_for_ack_timeout),
            max_queue_size: self.stream_management.max_queue_size,
        });

        let cluster = ClusterConfig {
            instance_id: environ
                .instance_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            hostname: environ.hostname.clone().unwrap_or_else(local_hostname),
            port: self.cluster.port,
            lease: LeaseConfig {
                ttl: secs(self.cluster.lease_ttl),
                max_keep_alive_retries: self.cluster.max_keep_alive_retries,
                ..LeaseConfig::default()
            },
        };

        Ok(XmppServerConfig {
            hosts,
            c2s_addr: SocketAddr::new(self.c2s.bind_addr, self.c2s.port),
            c2s,
            s2s_addr,
            s2s_direct_tls_addr,
            s2s,
            component_addr,
            component,
            stream_management,
            cluster,
        })
    }
}

fn secs(value: u64) -> Duration {
    Duration::from_secs(value)
}

/// First non-loopback IPv4 address of this host, else `localhost`.
///
/// Connecting a UDP socket only selects the outgoing interface; nothing is
/// sent.
fn local_hostname() -> String {
    let local_ip = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("192.0.2.1:9")?;
        Ok(socket.local_addr()?.ip())
    };
    match local_ip() {
        Ok(ip @ IpAddr::V4(v4)) if !v4.is_loopback() && !v4.is_unspecified() => ip.to_string(),
        _ => "localhost".to_string(),
    }
}
