//! XMPP server node.
//!
//! Wires hosts, router, listeners and cluster membership together. The node
//! listens on port 5222 for clients, optionally on 5269 (and a direct TLS
//! port) for federation and on 5275 for external components. Everything
//! runs until the shutdown token is cancelled, after which streams are
//! closed with `system-shutdown`, the node leaves the cluster and its lease
//! is revoked.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use rustls::RootCertStore;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::c2s::{C2sConfig, C2sContext, C2sListener};
use crate::cluster::{Kv, Lease, LeaseConfig, Member, MemberList, ResourceLocator, CLUSTER_API_VERSION};
use crate::component::{ComponentConfig, ComponentContext, ComponentListener};
use crate::hook::Hooks;
use crate::hosts::Hosts;
use crate::hub::{StreamHub, SHUTDOWN_TIMEOUT};
use crate::module::Modules;
use crate::repository::UserRepository;
use crate::router::{RemoteRouter, Router};
use crate::s2s::{InStreamContext, OutProvider, S2sConfig, S2sDialer, S2sListener};
use crate::stream_management::{LocalQueueTransfer, QueueTransfer, SmConfig, SmManager};
use crate::tls;
use crate::XmppError;

/// A served domain and its certificate.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub domain: String,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
}

/// Cluster membership of this node.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub instance_id: String,
    /// Address other members reach this node at.
    pub hostname: String,
    pub port: u16,
    pub lease: LeaseConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            hostname: "localhost".to_string(),
            port: 14369,
            lease: LeaseConfig::default(),
        }
    }
}

/// Server node configuration.
#[derive(Debug, Clone)]
pub struct XmppServerConfig {
    /// The first entry is the default host.
    pub hosts: Vec<HostConfig>,
    pub c2s_addr: SocketAddr,
    pub c2s: C2sConfig,
    /// S2S listener; federation is disabled when unset.
    pub s2s_addr: Option<SocketAddr>,
    /// Direct TLS S2S listener (XEP-0368).
    pub s2s_direct_tls_addr: Option<SocketAddr>,
    pub s2s: S2sConfig,
    /// Component listener; disabled when unset.
    pub component_addr: Option<SocketAddr>,
    pub component: ComponentConfig,
    /// XEP-0198; disabled when unset.
    pub stream_management: Option<SmConfig>,
    pub cluster: ClusterConfig,
}

impl Default for XmppServerConfig {
    fn default() -> Self {
        Self {
            hosts: vec![HostConfig {
                domain: "localhost".to_string(),
                cert_path: None,
                key_path: None,
            }],
            c2s_addr: SocketAddr::from(([0, 0, 0, 0], 5222)),
            c2s: C2sConfig::default(),
            s2s_addr: None,
            s2s_direct_tls_addr: None,
            s2s: S2sConfig::default(),
            component_addr: None,
            component: ComponentConfig::default(),
            stream_management: Some(SmConfig::default()),
            cluster: ClusterConfig::default(),
        }
    }
}

/// Collaborators supplied by the embedding binary.
pub struct ServerDeps {
    pub users: Arc<dyn UserRepository>,
    pub kv: Arc<dyn Kv>,
    /// Trust anchors for S2S peers.
    pub roots: RootCertStore,
    pub modules: Modules,
    pub hooks: Arc<Hooks>,
    /// Queue hand-over between nodes sharing this process.
    pub queue_transfer: Option<Arc<LocalQueueTransfer>>,
}

/// A running server node.
pub struct XmppServer {
    hosts: Arc<Hosts>,
    router: Arc<Router>,
    hooks: Arc<Hooks>,
    sm: Option<Arc<SmManager>>,
    c2s_hub: Arc<StreamHub>,
    s2s_hub: Arc<StreamHub>,
    component_hub: Arc<StreamHub>,
    out_provider: Option<Arc<OutProvider>>,
    memberlist: Arc<MemberList>,
    lease: Lease,
    shutdown: CancellationToken,
    tasks: JoinSet<Result<(), XmppError>>,
    c2s_addr: SocketAddr,
    s2s_addr: Option<SocketAddr>,
    component_addr: Option<SocketAddr>,
}

impl XmppServer {
    /// Join the cluster, bind every configured listener and start serving.
    ///
    /// `shutdown` stops the node; it is also cancelled when the cluster
    /// lease cannot be kept alive.
    pub async fn start(
        config: XmppServerConfig,
        deps: ServerDeps,
        shutdown: CancellationToken,
    ) -> Result<Self, XmppError> {
        let hosts = Arc::new(load_hosts(&config.hosts)?);
        let roots = Arc::new(deps.roots);
        let (c2s_tls, s2s_tls) = if hosts.certificates().is_empty() {
            warn!("No host certificate configured; TLS is disabled");
            (None, None)
        } else {
            (
                Some(TlsAcceptor::from(hosts.server_tls_config(None)?)),
                Some(TlsAcceptor::from(hosts.server_tls_config(Some(roots.clone()))?)),
            )
        };

        let lease = Lease::start(deps.kv.clone(), config.cluster.lease.clone(), shutdown.clone())
            .await
            .map_err(|e| XmppError::internal(format!("cluster lease: {e}")))?;
        let locator = ResourceLocator::new(deps.kv.clone(), config.cluster.instance_id.clone(), lease.subscribe());
        let memberlist = MemberList::new(
            deps.kv.clone(),
            Member {
                instance_id: config.cluster.instance_id.clone(),
                host: config.cluster.hostname.clone(),
                port: config.cluster.port,
                api_version: CLUSTER_API_VERSION.to_string(),
            },
            deps.hooks.clone(),
        );
        memberlist
            .join(lease.id())
            .await
            .map_err(|e| XmppError::internal(format!("cluster join: {e}")))?;

        let sm = config.stream_management.clone().map(|sm_config| {
            let transfer = deps.queue_transfer.clone();
            let manager = SmManager::new(
                sm_config,
                Some(locator.clone()),
                transfer.clone().map(|t| t as Arc<dyn QueueTransfer>),
            );
            if let Some(transfer) = transfer {
                transfer.register(config.cluster.instance_id.clone(), manager.clone());
            }
            manager
        });

        let s2s_enabled = config.s2s_addr.is_some() || config.s2s_direct_tls_addr.is_some();
        let dialer = S2sDialer::new(
            config.s2s.clone(),
            hosts.clone(),
            (*roots).clone(),
            Some(deps.kv.clone()),
            deps.hooks.clone(),
        );
        let out_provider = s2s_enabled.then(|| Arc::new(OutProvider::new(Arc::new(dialer.clone()))));
        let router = Arc::new(Router::new(
            hosts.clone(),
            deps.users.clone(),
            deps.modules,
            out_provider.clone().map(|p| p as Arc<dyn RemoteRouter>),
        ));

        let c2s_hub = Arc::new(StreamHub::new("c2s"));
        let s2s_hub = Arc::new(StreamHub::new("s2s"));
        let component_hub = Arc::new(StreamHub::new("component"));
        let mut tasks = JoinSet::new();

        let c2s_ctx = Arc::new(C2sContext {
            config: config.c2s.clone(),
            hosts: hosts.clone(),
            router: router.clone(),
            users: deps.users.clone(),
            hooks: deps.hooks.clone(),
            hub: c2s_hub.clone(),
            tls: c2s_tls,
            sm: sm.clone(),
            locator: Some(locator.clone()),
        });
        let c2s = C2sListener::bind(config.c2s_addr, c2s_ctx).await?;
        let c2s_addr = c2s.local_addr()?;
        tasks.spawn(c2s.run(shutdown.clone()));

        let mut s2s_addr = None;
        if s2s_enabled {
            let in_ctx = Arc::new(InStreamContext {
                config: config.s2s.clone(),
                hosts: hosts.clone(),
                router: router.clone(),
                hooks: deps.hooks.clone(),
                hub: s2s_hub.clone(),
                tls: s2s_tls,
                kv: Some(deps.kv.clone()),
                verifier: Arc::new(dialer),
            });
            if let Some(addr) = config.s2s_addr {
                let listener = S2sListener::bind(addr, in_ctx.clone(), false).await?;
                s2s_addr = Some(listener.local_addr()?);
                tasks.spawn(listener.run(shutdown.clone()));
            }
            if let Some(addr) = config.s2s_direct_tls_addr {
                let listener = S2sListener::bind(addr, in_ctx, true).await?;
                tasks.spawn(listener.run(shutdown.clone()));
            }
        } else {
            info!("S2S federation disabled");
        }

        let mut component_addr = None;
        if let Some(addr) = config.component_addr {
            let ctx = Arc::new(ComponentContext {
                config: config.component.clone(),
                hosts: hosts.clone(),
                router: router.clone(),
                hub: component_hub.clone(),
            });
            let listener = ComponentListener::bind(addr, ctx).await?;
            component_addr = Some(listener.local_addr()?);
            tasks.spawn(listener.run(shutdown.clone()));
        }

        spawn_lease_refresh(&mut tasks, memberlist.clone(), locator.clone(), &lease, shutdown.clone());

        info!(
            instance = %config.cluster.instance_id,
            domain = %hosts.default_host(),
            "XMPP server started"
        );
        Ok(Self {
            hosts,
            router,
            hooks: deps.hooks,
            sm,
            c2s_hub,
            s2s_hub,
            component_hub,
            out_provider,
            memberlist,
            lease,
            shutdown,
            tasks,
            c2s_addr,
            s2s_addr,
            component_addr,
        })
    }

    pub fn hosts(&self) -> &Arc<Hosts> {
        &self.hosts
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn hooks(&self) -> &Arc<Hooks> {
        &self.hooks
    }

    pub fn stream_management(&self) -> Option<&Arc<SmManager>> {
        self.sm.as_ref()
    }

    pub fn memberlist(&self) -> &Arc<MemberList> {
        &self.memberlist
    }

    pub fn c2s_addr(&self) -> SocketAddr {
        self.c2s_addr
    }

    pub fn s2s_addr(&self) -> Option<SocketAddr> {
        self.s2s_addr
    }

    pub fn component_addr(&self) -> Option<SocketAddr> {
        self.component_addr
    }

    pub fn c2s_connections(&self) -> usize {
        self.c2s_hub.len()
    }

    /// Serve until the shutdown token fires or a listener fails, then stop
    /// gracefully.
    pub async fn run(mut self) -> Result<(), XmppError> {
        let mut result = Ok(());
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            Some(joined) = self.tasks.join_next() => {
                result = flatten(joined);
                if let Err(err) = &result {
                    warn!(error = %err, "Server task failed; shutting down");
                }
                self.shutdown.cancel();
            }
        }
        self.stop().await;
        result
    }

    async fn stop(mut self) {
        info!("Shutting down XMPP server");
        self.shutdown.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(err) = flatten(joined) {
                warn!(error = %err, "Server task failed during shutdown");
            }
        }

        tokio::join!(
            self.c2s_hub.shutdown(SHUTDOWN_TIMEOUT),
            self.s2s_hub.shutdown(SHUTDOWN_TIMEOUT),
            self.component_hub.shutdown(SHUTDOWN_TIMEOUT),
        );
        if let Some(provider) = &self.out_provider {
            provider.shutdown(SHUTDOWN_TIMEOUT).await;
        }

        if let Err(err) = self.memberlist.leave().await {
            warn!(error = %err, "Failed to leave cluster");
        }
        if let Err(err) = self.lease.revoke().await {
            warn!(error = %err, "Failed to revoke cluster lease");
        }
        info!("XMPP server stopped");
    }
}

fn flatten(joined: Result<Result<(), XmppError>, tokio::task::JoinError>) -> Result<(), XmppError> {
    joined.map_err(|e| XmppError::internal(format!("server task panicked: {e}")))?
}

/// Re-advertise this node and its resources whenever the lease is re-granted.
fn spawn_lease_refresh(
    tasks: &mut JoinSet<Result<(), XmppError>>,
    memberlist: Arc<MemberList>,
    locator: ResourceLocator,
    lease: &Lease,
    shutdown: CancellationToken,
) {
    let mut lease_id = lease.subscribe();
    tasks.spawn(
        async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    changed = lease_id.changed() => {
                        if changed.is_err() {
                            return Ok(());
                        }
                        let id = *lease_id.borrow_and_update();
                        if let Err(err) = memberlist.refresh(id).await {
                            warn!(lease = id, error = %err, "Failed to re-advertise member");
                        }
                        if let Err(err) = locator.refresh(id).await {
                            warn!(lease = id, error = %err, "Failed to re-register resources");
                        }
                    }
                }
            }
        }
        .instrument(info_span!("cluster.lease.refresh")),
    );
}

fn load_hosts(configs: &[HostConfig]) -> Result<Hosts, XmppError> {
    let (first, _) = configs
        .split_first()
        .ok_or_else(|| XmppError::config("at least one host must be configured"))?;
    let mut hosts = Hosts::new(first.domain.clone());
    for host in configs {
        let certificate = match (&host.cert_path, &host.key_path) {
            (Some(cert), Some(key)) => Some(Arc::new(tls::load_certified_key(cert, key)?)),
            (None, None) => None,
            _ => {
                return Err(XmppError::config(format!(
                    "host {} needs both cert_path and key_path",
                    host.domain
                )))
            }
        };
        hosts.register(host.domain.clone(), certificate);
    }
    Ok(hosts)
}
