//! Cluster key-value store abstraction.
//!
//! The shared store (etcd-like) is the only state visible across nodes.
//! [`MemoryKv`] implements the same semantics in process: revisions,
//! TTL leases whose expiry deletes attached keys, and prefix watches.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::debug;

/// Lease identifier.
pub type LeaseId = i64;

/// KV failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KvError {
    #[error("lease {0} not found")]
    LeaseNotFound(LeaseId),

    #[error("kv backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvEventKind {
    Put,
    Del,
}

/// One change observed by a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEvent {
    pub kind: KvEventKind,
    pub key: String,
    /// New value (empty for deletions).
    pub value: Vec<u8>,
    /// Previous value, when requested and one existed.
    pub prev_value: Option<Vec<u8>>,
}

/// A batch of events from one store revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchResponse {
    pub events: Vec<KvEvent>,
}

/// Operations the core needs from the cluster store.
#[async_trait]
pub trait Kv: Send + Sync {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), KvError>;

    /// Put a key that disappears when `lease` expires or is revoked.
    async fn put_with_lease(&self, key: &str, value: &[u8], lease: LeaseId) -> Result<(), KvError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    async fn get_prefix(&self, prefix: &str) -> Result<BTreeMap<String, Vec<u8>>, KvError>;

    async fn del(&self, key: &str) -> Result<(), KvError>;

    /// Stream of changes under `prefix`, starting now.
    fn watch(&self, prefix: &str, with_prev_value: bool) -> BoxStream<'static, WatchResponse>;

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, KvError>;

    async fn keep_alive_once(&self, lease: LeaseId) -> Result<(), KvError>;

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), KvError>;
}

#[derive(Debug)]
struct StoredValue {
    value: Vec<u8>,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct LeaseState {
    ttl: Duration,
    deadline: Instant,
    keys: HashSet<String>,
}

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<String, StoredValue>,
    leases: HashMap<LeaseId, LeaseState>,
    next_lease: LeaseId,
    revision: u64,
}

/// In-process [`Kv`].
///
/// Lease expiry is evaluated lazily on every operation (and by
/// [`MemoryKv::expire_leases`]).
#[derive(Debug)]
pub struct MemoryKv {
    state: Mutex<State>,
    events: broadcast::Sender<Vec<KvEvent>>,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            state: Mutex::new(State {
                next_lease: 1,
                ..State::default()
            }),
            events,
        }
    }

    /// Current store revision.
    pub fn revision(&self) -> u64 {
        self.lock().map(|s| s.revision).unwrap_or_default()
    }

    /// Delete keys attached to leases past their deadline.
    pub fn expire_leases(&self) {
        if let Ok(mut state) = self.lock() {
            let events = Self::expire(&mut state);
            self.publish(events);
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, KvError> {
        self.state
            .lock()
            .map_err(|_| KvError::Backend("state lock poisoned".to_string()))
    }

    fn expire(state: &mut State) -> Vec<KvEvent> {
        let now = Instant::now();
        let expired: Vec<LeaseId> = state
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        let mut events = Vec::new();
        for id in expired {
            debug!(lease = id, "Lease expired");
            events.extend(Self::drop_lease(state, id));
        }
        events
    }

    fn drop_lease(state: &mut State, id: LeaseId) -> Vec<KvEvent> {
        let Some(lease) = state.leases.remove(&id) else {
            return Vec::new();
        };
        let mut events = Vec::new();
        for key in lease.keys {
            if let Some(prev) = state.entries.remove(&key) {
                state.revision += 1;
                events.push(KvEvent {
                    kind: KvEventKind::Del,
                    key,
                    value: Vec::new(),
                    prev_value: Some(prev.value),
                });
            }
        }
        events
    }

    fn publish(&self, events: Vec<KvEvent>) {
        if !events.is_empty() {
            // No subscribers is fine.
            let _ = self.events.send(events);
        }
    }

    fn put_inner(&self, key: &str, value: &[u8], lease: Option<LeaseId>) -> Result<(), KvError> {
        let events = {
            let mut state = self.lock()?;
            let mut events = Self::expire(&mut state);
            if let Some(id) = lease {
                match state.leases.get_mut(&id) {
                    Some(l) => {
                        l.keys.insert(key.to_string());
                    }
                    None => {
                        drop(state);
                        self.publish(events);
                        return Err(KvError::LeaseNotFound(id));
                    }
                }
            }
            let prev = state.entries.insert(
                key.to_string(),
                StoredValue {
                    value: value.to_vec(),
                    lease,
                },
            );
            if let Some(old_lease) = prev.as_ref().and_then(|p| p.lease) {
                if Some(old_lease) != lease {
                    if let Some(l) = state.leases.get_mut(&old_lease) {
                        l.keys.remove(key);
                    }
                }
            }
            state.revision += 1;
            events.push(KvEvent {
                kind: KvEventKind::Put,
                key: key.to_string(),
                value: value.to_vec(),
                prev_value: prev.map(|p| p.value),
            });
            events
        };
        self.publish(events);
        Ok(())
    }
}

#[async_trait]
impl Kv for MemoryKv {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        self.put_inner(key, value, None)
    }

    async fn put_with_lease(&self, key: &str, value: &[u8], lease: LeaseId) -> Result<(), KvError> {
        self.put_inner(key, value, Some(lease))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let (value, events) = {
            let mut state = self.lock()?;
            let events = Self::expire(&mut state);
            (state.entries.get(key).map(|v| v.value.clone()), events)
        };
        self.publish(events);
        Ok(value)
    }

    async fn get_prefix(&self, prefix: &str) -> Result<BTreeMap<String, Vec<u8>>, KvError> {
        let (values, events) = {
            let mut state = self.lock()?;
            let events = Self::expire(&mut state);
            let values = state
                .entries
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.value.clone()))
                .collect();
            (values, events)
        };
        self.publish(events);
        Ok(values)
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        let events = {
            let mut state = self.lock()?;
            let mut events = Self::expire(&mut state);
            if let Some(prev) = state.entries.remove(key) {
                if let Some(l) = prev.lease.and_then(|id| state.leases.get_mut(&id)) {
                    l.keys.remove(key);
                }
                state.revision += 1;
                events.push(KvEvent {
                    kind: KvEventKind::Del,
                    key: key.to_string(),
                    value: Vec::new(),
                    prev_value: Some(prev.value),
                });
            }
            events
        };
        self.publish(events);
        Ok(())
    }

    fn watch(&self, prefix: &str, with_prev_value: bool) -> BoxStream<'static, WatchResponse> {
        let rx = self.events.subscribe();
        let prefix = prefix.to_string();
        Box::pin(stream::unfold(rx, move |mut rx| {
            let prefix = prefix.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(batch) => {
                            let events: Vec<KvEvent> = batch
                                .into_iter()
                                .filter(|e| e.key.starts_with(&prefix))
                                .map(|mut e| {
                                    if !with_prev_value {
                                        e.prev_value = None;
                                    }
                                    e
                                })
                                .collect();
                            if !events.is_empty() {
                                return Some((WatchResponse { events }, rx));
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(skipped, "Watch lagged behind");
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        }))
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, KvError> {
        let mut state = self.lock()?;
        let id = state.next_lease;
        state.next_lease += 1;
        state.leases.insert(
            id,
            LeaseState {
                ttl,
                deadline: Instant::now() + ttl,
                keys: HashSet::new(),
            },
        );
        Ok(id)
    }

    async fn keep_alive_once(&self, lease: LeaseId) -> Result<(), KvError> {
        let events = {
            let mut state = self.lock()?;
            let events = Self::expire(&mut state);
            match state.leases.get_mut(&lease) {
                Some(l) => {
                    l.deadline = Instant::now() + l.ttl;
                    Ok(events)
                }
                None => Err((KvError::LeaseNotFound(lease), events)),
            }
        };
        match events {
            Ok(events) => {
                self.publish(events);
                Ok(())
            }
            Err((err, events)) => {
                self.publish(events);
                Err(err)
            }
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), KvError> {
        let events = {
            let mut state = self.lock()?;
            if !state.leases.contains_key(&lease) {
                return Err(KvError::LeaseNotFound(lease));
            }
            Self::drop_lease(&mut state, lease)
        };
        self.publish(events);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn test_put_get_del() {
        let kv = MemoryKv::new();
        kv.put("i://a", b"1").await.unwrap();
        kv.put("i://b", b"2").await.unwrap();
        kv.put("r://x", b"3").await.unwrap();

        assert_eq!(kv.get("i://a").await.unwrap(), Some(b"1".to_vec()));
        let members = kv.get_prefix("i://").await.unwrap();
        assert_eq!(members.keys().collect::<Vec<_>>(), vec!["i://a", "i://b"]);

        kv.del("i://a").await.unwrap();
        assert_eq!(kv.get("i://a").await.unwrap(), None);
        assert_eq!(kv.revision(), 4);
    }

    #[tokio::test]
    async fn test_watch_prefix() {
        let kv = MemoryKv::new();
        let mut watch = kv.watch("i://", true);

        kv.put("r://ignored", b"x").await.unwrap();
        kv.put("i://a", b"1").await.unwrap();
        kv.put("i://a", b"2").await.unwrap();
        kv.del("i://a").await.unwrap();

        let first = watch.next().await.unwrap();
        assert_eq!(first.events[0].kind, KvEventKind::Put);
        assert_eq!(first.events[0].prev_value, None);

        let second = watch.next().await.unwrap();
        assert_eq!(second.events[0].value, b"2".to_vec());
        assert_eq!(second.events[0].prev_value, Some(b"1".to_vec()));

        let third = watch.next().await.unwrap();
        assert_eq!(third.events[0].kind, KvEventKind::Del);
        assert_eq!(third.events[0].key, "i://a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_deletes_keys() {
        let kv = MemoryKv::new();
        let lease = kv.grant_lease(Duration::from_secs(10)).await.unwrap();
        kv.put_with_lease("i://self", b"a", lease).await.unwrap();
        let mut watch = kv.watch("i://", false);

        tokio::time::advance(Duration::from_secs(6)).await;
        kv.keep_alive_once(lease).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(kv.get("i://self").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(5)).await;
        kv.expire_leases();
        assert!(kv.get("i://self").await.unwrap().is_none());
        assert_eq!(
            kv.keep_alive_once(lease).await,
            Err(KvError::LeaseNotFound(lease))
        );

        let event = watch.next().await.unwrap();
        assert_eq!(event.events[0].kind, KvEventKind::Del);
        assert_eq!(event.events[0].prev_value, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_on_expired_lease_still_publishes_expiry() {
        let kv = MemoryKv::new();
        let lease = kv.grant_lease(Duration::from_secs(10)).await.unwrap();
        kv.put_with_lease("r://ortuman@jackal.im/yard", b"node-a", lease)
            .await
            .unwrap();
        let mut watch = kv.watch("r://", true);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(
            kv.put_with_lease("r://noelia@jackal.im/balcony", b"node-a", lease)
                .await,
            Err(KvError::LeaseNotFound(lease))
        );

        let event = watch.next().await.unwrap();
        assert_eq!(event.events.len(), 1);
        assert_eq!(event.events[0].kind, KvEventKind::Del);
        assert_eq!(event.events[0].key, "r://ortuman@jackal.im/yard");
        assert_eq!(event.events[0].prev_value, Some(b"node-a".to_vec()));
        assert!(kv.get("r://noelia@jackal.im/balcony").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_revoke_lease() {
        let kv = MemoryKv::new();
        let lease = kv.grant_lease(Duration::from_secs(10)).await.unwrap();
        kv.put_with_lease("r://a@b/c", b"node", lease).await.unwrap();
        kv.revoke_lease(lease).await.unwrap();
        assert!(kv.get("r://a@b/c").await.unwrap().is_none());
        assert!(kv.put_with_lease("r://a@b/c", b"node", lease).await.is_err());
    }
}
