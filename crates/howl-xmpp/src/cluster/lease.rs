//! Shared cluster lease with a keep-alive task.
//!
//! Keys that must vanish when this node dies (membership, resource
//! locations) are attached to one lease. If the lease cannot be refreshed
//! `max_keep_alive_retries` times in a row the node signals its own
//! shutdown, since other nodes may already consider it gone.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn, Instrument};

use super::kv::{Kv, KvError, LeaseId};

/// Lease settings.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub ttl: Duration,
    pub max_keep_alive_retries: u32,
    /// First retry delay; doubles on each consecutive failure.
    pub initial_backoff: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            max_keep_alive_retries: 10,
            initial_backoff: Duration::from_millis(250),
        }
    }
}

/// A granted lease kept alive in the background.
pub struct Lease {
    kv: Arc<dyn Kv>,
    id: watch::Receiver<LeaseId>,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl Lease {
    /// Grant a lease and start refreshing it.
    ///
    /// `shutdown` is cancelled if keep-alive is lost for good.
    #[instrument(skip_all, name = "cluster.lease.start")]
    pub async fn start(
        kv: Arc<dyn Kv>,
        config: LeaseConfig,
        shutdown: CancellationToken,
    ) -> Result<Self, KvError> {
        let id = kv.grant_lease(config.ttl).await?;
        info!(lease = id, ttl = ?config.ttl, "Granted cluster lease");

        let (id_tx, id_rx) = watch::channel(id);
        let stop = CancellationToken::new();
        let task = tokio::spawn(
            keep_alive(kv.clone(), config, id_tx, stop.clone(), shutdown)
                .instrument(tracing::info_span!("cluster.lease.keep_alive")),
        );
        Ok(Self {
            kv,
            id: id_rx,
            stop,
            task,
        })
    }

    /// Current lease id. Changes if the lease had to be re-granted.
    pub fn id(&self) -> LeaseId {
        *self.id.borrow()
    }

    /// Observe lease re-grants.
    pub fn subscribe(&self) -> watch::Receiver<LeaseId> {
        self.id.clone()
    }

    /// Stop refreshing and revoke the lease.
    pub async fn revoke(self) -> Result<(), KvError> {
        self.stop.cancel();
        let _ = self.task.await;
        let id = *self.id.borrow();
        self.kv.revoke_lease(id).await
    }
}

async fn keep_alive(
    kv: Arc<dyn Kv>,
    config: LeaseConfig,
    id_tx: watch::Sender<LeaseId>,
    stop: CancellationToken,
    shutdown: CancellationToken,
) {
    let interval = config.ttl / 3;
    let mut failures: u32 = 0;
    let mut delay = interval;

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let id = *id_tx.borrow();
        let result = match kv.keep_alive_once(id).await {
            Err(KvError::LeaseNotFound(_)) => match kv.grant_lease(config.ttl).await {
                Ok(new_id) => {
                    warn!(old = id, new = new_id, "Cluster lease lost, re-granted");
                    id_tx.send_replace(new_id);
                    Ok(())
                }
                Err(err) => Err(err),
            },
            other => other,
        };

        match result {
            Ok(()) => {
                failures = 0;
                delay = interval;
            }
            Err(err) => {
                failures += 1;
                if failures > config.max_keep_alive_retries {
                    error!(
                        error = %err,
                        retries = config.max_keep_alive_retries,
                        "Cluster lease keep-alive exhausted, shutting down"
                    );
                    shutdown.cancel();
                    return;
                }
                let backoff = config.initial_backoff * 2u32.saturating_pow(failures - 1);
                delay = backoff.min(config.ttl);
                warn!(error = %err, attempt = failures, ?delay, "Cluster lease keep-alive failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use futures::stream::BoxStream;

    use super::*;
    use crate::cluster::kv::{MemoryKv, WatchResponse};

    /// Delegates to [`MemoryKv`] but can fail every keep-alive.
    struct FlakyKv {
        inner: MemoryKv,
        failing: AtomicBool,
    }

    #[async_trait]
    impl Kv for FlakyKv {
        async fn put(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
            self.inner.put(key, value).await
        }
        async fn put_with_lease(&self, key: &str, value: &[u8], lease: LeaseId) -> Result<(), KvError> {
            self.inner.put_with_lease(key, value, lease).await
        }
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
            self.inner.get(key).await
        }
        async fn get_prefix(&self, prefix: &str) -> Result<BTreeMap<String, Vec<u8>>, KvError> {
            self.inner.get_prefix(prefix).await
        }
        async fn del(&self, key: &str) -> Result<(), KvError> {
            self.inner.del(key).await
        }
        fn watch(&self, prefix: &str, with_prev_value: bool) -> BoxStream<'static, WatchResponse> {
            self.inner.watch(prefix, with_prev_value)
        }
        async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, KvError> {
            self.inner.grant_lease(ttl).await
        }
        async fn keep_alive_once(&self, lease: LeaseId) -> Result<(), KvError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(KvError::Backend("unreachable".to_string()));
            }
            self.inner.keep_alive_once(lease).await
        }
        async fn revoke_lease(&self, lease: LeaseId) -> Result<(), KvError> {
            self.inner.revoke_lease(lease).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_holds_keys() {
        let kv = Arc::new(MemoryKv::new());
        let lease = Lease::start(kv.clone(), LeaseConfig::default(), CancellationToken::new())
            .await
            .unwrap();
        kv.put_with_lease("i://self", b"a=127.0.0.1:5222 cv=v1.0.0", lease.id())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(kv.get("i://self").await.unwrap().is_some());

        lease.revoke().await.unwrap();
        assert!(kv.get("i://self").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_keep_alive_triggers_shutdown() {
        let kv = Arc::new(FlakyKv {
            inner: MemoryKv::new(),
            failing: AtomicBool::new(true),
        });
        let shutdown = CancellationToken::new();
        let config = LeaseConfig {
            max_keep_alive_retries: 3,
            ..LeaseConfig::default()
        };
        let _lease = Lease::start(kv, config, shutdown.clone()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(60), shutdown.cancelled())
            .await
            .expect("shutdown was not signalled");
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_lease_is_regranted() {
        let kv = Arc::new(MemoryKv::new());
        let lease = Lease::start(kv.clone(), LeaseConfig::default(), CancellationToken::new())
            .await
            .unwrap();
        let mut ids = lease.subscribe();
        let first = lease.id();

        kv.revoke_lease(first).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), ids.changed())
            .await
            .unwrap()
            .unwrap();
        assert_ne!(lease.id(), first);
    }
}
