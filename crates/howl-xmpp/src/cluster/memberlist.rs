//! Cluster membership.
//!
//! Each node advertises itself under `i://<instance-id>` with value
//! `a=<host>:<port> cv=v<api-version>`, attached to the shared lease, and
//! watches the `i://` namespace to track every other node.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn, Instrument};

use super::kv::{Kv, KvError, KvEventKind, LeaseId};
use crate::hook::{HookInfo, Hooks, MEMBER_LIST_UPDATED};

/// Key namespace of cluster members.
pub const MEMBER_KEY_PREFIX: &str = "i://";

/// Cluster API version advertised by this node.
pub const CLUSTER_API_VERSION: &str = "1.0.0";

/// A cluster node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    pub api_version: String,
}

impl Member {
    pub fn key(&self) -> String {
        format!("{MEMBER_KEY_PREFIX}{}", self.instance_id)
    }

    /// `a=<host>:<port> cv=v<version>`
    pub fn encode_value(&self) -> String {
        format!("a={}:{} cv=v{}", self.host, self.port, self.api_version)
    }

    pub fn decode(instance_id: &str, value: &[u8]) -> Result<Self, KvError> {
        let invalid = || KvError::Backend(format!("invalid member value for {instance_id}"));
        let value = std::str::from_utf8(value).map_err(|_| invalid())?;

        let mut address = None;
        let mut api_version = None;
        for field in value.split_whitespace() {
            if let Some(addr) = field.strip_prefix("a=") {
                address = Some(addr);
            } else if let Some(version) = field.strip_prefix("cv=") {
                api_version = Some(version.strip_prefix('v').unwrap_or(version));
            }
        }
        let (host, port) = address.and_then(|a| a.rsplit_once(':')).ok_or_else(invalid)?;
        Ok(Self {
            instance_id: instance_id.to_string(),
            host: host.to_string(),
            port: port.parse().map_err(|_| invalid())?,
            api_version: api_version.ok_or_else(invalid)?.to_string(),
        })
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.instance_id, self.host, self.port)
    }
}

/// Tracks the other members of the cluster.
pub struct MemberList {
    kv: Arc<dyn Kv>,
    local: Member,
    hooks: Arc<Hooks>,
    members: RwLock<HashMap<String, Member>>,
    stop: CancellationToken,
    watcher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MemberList {
    pub fn new(kv: Arc<dyn Kv>, local: Member, hooks: Arc<Hooks>) -> Arc<Self> {
        Arc::new(Self {
            kv,
            local,
            hooks,
            members: RwLock::new(HashMap::new()),
            stop: CancellationToken::new(),
            watcher: std::sync::Mutex::new(None),
        })
    }

    pub fn local_member(&self) -> &Member {
        &self.local
    }

    /// Advertise this node and start tracking the others.
    #[instrument(skip(self), fields(instance = %self.local.instance_id), name = "cluster.memberlist.join")]
    pub async fn join(self: &Arc<Self>, lease: LeaseId) -> Result<(), KvError> {
        self.kv
            .put_with_lease(&self.local.key(), self.local.encode_value().as_bytes(), lease)
            .await?;

        // Subscribe before the initial fetch so nothing slips in between.
        let mut watch = self.kv.watch(MEMBER_KEY_PREFIX, false);
        let existing = self.kv.get_prefix(MEMBER_KEY_PREFIX).await?;
        let mut registered = Vec::new();
        {
            let mut members = self.write_members();
            for (key, value) in existing {
                if key == self.local.key() {
                    continue;
                }
                match Member::decode(instance_id_of(&key), &value) {
                    Ok(member) => {
                        members.insert(member.instance_id.clone(), member.clone());
                        registered.push(member);
                    }
                    Err(err) => warn!(key = %key, error = %err, "Skipping malformed member"),
                }
            }
        }
        info!(members = registered.len(), "Joined cluster");
        if !registered.is_empty() {
            self.notify(registered, Vec::new()).await;
        }

        let this = Arc::clone(self);
        let task = tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        _ = this.stop.cancelled() => return,
                        response = watch.next() => match response {
                            Some(response) => this.apply(response.events).await,
                            None => {
                                warn!("Member watch closed");
                                return;
                            }
                        },
                    }
                }
            }
            .instrument(tracing::info_span!("cluster.memberlist.watch")),
        );
        if let Ok(mut watcher) = self.watcher.lock() {
            *watcher = Some(task);
        }
        Ok(())
    }

    /// Re-advertise under a new lease.
    pub async fn refresh(&self, lease: LeaseId) -> Result<(), KvError> {
        self.kv
            .put_with_lease(&self.local.key(), self.local.encode_value().as_bytes(), lease)
            .await
    }

    /// Stop watching and withdraw this node.
    #[instrument(skip(self), fields(instance = %self.local.instance_id), name = "cluster.memberlist.leave")]
    pub async fn leave(&self) -> Result<(), KvError> {
        self.stop.cancel();
        let task = self.watcher.lock().ok().and_then(|mut w| w.take());
        if let Some(task) = task {
            let _ = task.await;
        }
        self.kv.del(&self.local.key()).await?;
        info!("Left cluster");
        Ok(())
    }

    /// Every known member except this node.
    pub fn get_members(&self) -> HashMap<String, Member> {
        self.members.read().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn get_member(&self, instance_id: &str) -> Option<Member> {
        self.members
            .read()
            .ok()
            .and_then(|m| m.get(instance_id).cloned())
    }

    async fn apply(&self, events: Vec<super::kv::KvEvent>) {
        let mut registered = Vec::new();
        let mut unregistered = Vec::new();
        {
            let mut members = self.write_members();
            for event in events {
                if event.key == self.local.key() {
                    continue;
                }
                let instance_id = instance_id_of(&event.key);
                match event.kind {
                    KvEventKind::Put => match Member::decode(instance_id, &event.value) {
                        Ok(member) => {
                            debug!(member = %member, "Member registered");
                            members.insert(instance_id.to_string(), member.clone());
                            registered.push(member);
                        }
                        Err(err) => warn!(key = %event.key, error = %err, "Skipping malformed member"),
                    },
                    KvEventKind::Del => {
                        if members.remove(instance_id).is_some() {
                            debug!(instance = instance_id, "Member unregistered");
                        }
                        unregistered.push(instance_id.to_string());
                    }
                }
            }
        }
        if !registered.is_empty() || !unregistered.is_empty() {
            self.notify(registered, unregistered).await;
        }
    }

    async fn notify(&self, registered: Vec<Member>, unregistered: Vec<String>) {
        let info = HookInfo::MemberList {
            registered,
            unregistered,
        };
        if let Err(err) = self.hooks.run(MEMBER_LIST_UPDATED, info).await {
            warn!(error = %err, "Member list hook failed");
        }
    }

    fn write_members(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Member>> {
        self.members
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn instance_id_of(key: &str) -> &str {
    key.strip_prefix(MEMBER_KEY_PREFIX).unwrap_or(key)
}
