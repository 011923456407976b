//! Cluster-wide resource locations.
//!
//! Every bound resource is published as `r://<full-jid>` → `<instance-id>`
//! under the node's lease, so any node can find where a session lives.
//! Keys die with the lease; [`ResourceLocator::refresh`] puts the live ones
//! back once a new lease has been granted.

use std::sync::Arc;

use dashmap::DashSet;
use jid::Jid;
use tokio::sync::watch;
use tracing::{debug, info};

use super::kv::{Kv, KvError, LeaseId};

/// Key namespace of resource locations.
pub const RESOURCE_KEY_PREFIX: &str = "r://";

/// Publishes and looks up resource locations.
#[derive(Clone)]
pub struct ResourceLocator {
    kv: Arc<dyn Kv>,
    instance_id: String,
    lease: watch::Receiver<LeaseId>,
    registered: Arc<DashSet<String>>,
}

impl ResourceLocator {
    pub fn new(
        kv: Arc<dyn Kv>,
        instance_id: impl Into<String>,
        lease: watch::Receiver<LeaseId>,
    ) -> Self {
        Self {
            kv,
            instance_id: instance_id.into(),
            lease,
            registered: Arc::new(DashSet::new()),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub async fn register(&self, jid: &Jid) -> Result<(), KvError> {
        let key = key(jid);
        let lease = *self.lease.borrow();
        self.kv
            .put_with_lease(&key, self.instance_id.as_bytes(), lease)
            .await?;
        self.registered.insert(key);
        debug!(jid = %jid, "Registered resource location");
        Ok(())
    }

    pub async fn unregister(&self, jid: &Jid) -> Result<(), KvError> {
        let key = key(jid);
        self.registered.remove(&key);
        self.kv.del(&key).await
    }

    /// Re-publish every resource registered here under `lease`.
    ///
    /// Returns how many locations were written.
    pub async fn refresh(&self, lease: LeaseId) -> Result<usize, KvError> {
        let keys: Vec<String> = self.registered.iter().map(|k| k.key().clone()).collect();
        for key in &keys {
            self.kv
                .put_with_lease(key, self.instance_id.as_bytes(), lease)
                .await?;
        }
        info!(lease, count = keys.len(), "Re-registered resource locations");
        Ok(keys.len())
    }

    /// Instance owning `jid`, if any node registered it.
    pub async fn locate(&self, jid: &Jid) -> Result<Option<String>, KvError> {
        Ok(self
            .kv
            .get(&key(jid))
            .await?
            .map(|value| String::from_utf8_lossy(&value).into_owned()))
    }

    /// Whether `jid` lives on this node.
    pub async fn is_local(&self, jid: &Jid) -> Result<bool, KvError> {
        Ok(self.locate(jid).await?.as_deref() == Some(self.instance_id.as_str()))
    }
}

fn key(jid: &Jid) -> String {
    format!("{RESOURCE_KEY_PREFIX}{jid}")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cluster::kv::MemoryKv;

    #[tokio::test]
    async fn test_register_locate() {
        let kv = Arc::new(MemoryKv::new());
        let lease = kv.grant_lease(Duration::from_secs(10)).await.unwrap();
        let (_tx, rx) = watch::channel(lease);
        let locator = ResourceLocator::new(kv.clone(), "node-a", rx);
        let jid = Jid::new("ortuman@jackal.im/yard").unwrap();

        assert_eq!(locator.locate(&jid).await.unwrap(), None);
        locator.register(&jid).await.unwrap();
        assert_eq!(
            kv.get("r://ortuman@jackal.im/yard").await.unwrap(),
            Some(b"node-a".to_vec())
        );
        assert!(locator.is_local(&jid).await.unwrap());

        kv.put("r://noelia@jackal.im/balcony", b"node-b").await.unwrap();
        let remote = Jid::new("noelia@jackal.im/balcony").unwrap();
        assert_eq!(locator.locate(&remote).await.unwrap().as_deref(), Some("node-b"));
        assert!(!locator.is_local(&remote).await.unwrap());

        locator.unregister(&jid).await.unwrap();
        assert_eq!(locator.locate(&jid).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_refresh_republishes_under_new_lease() {
        let kv = Arc::new(MemoryKv::new());
        let first = kv.grant_lease(Duration::from_secs(10)).await.unwrap();
        let (tx, rx) = watch::channel(first);
        let locator = ResourceLocator::new(kv.clone(), "node-a", rx);
        let yard = Jid::new("ortuman@jackal.im/yard").unwrap();
        let balcony = Jid::new("noelia@jackal.im/balcony").unwrap();
        let gone = Jid::new("noelia@jackal.im/garden").unwrap();
        locator.register(&yard).await.unwrap();
        locator.register(&balcony).await.unwrap();
        locator.register(&gone).await.unwrap();
        locator.unregister(&gone).await.unwrap();

        kv.revoke_lease(first).await.unwrap();
        assert_eq!(locator.locate(&yard).await.unwrap(), None);

        let second = kv.grant_lease(Duration::from_secs(10)).await.unwrap();
        tx.send_replace(second);
        assert_eq!(locator.refresh(second).await.unwrap(), 2);
        assert!(locator.is_local(&yard).await.unwrap());
        assert!(locator.is_local(&balcony).await.unwrap());
        assert_eq!(locator.locate(&gone).await.unwrap(), None);

        // Attached to the new lease, not left unleased.
        kv.revoke_lease(second).await.unwrap();
        assert_eq!(locator.locate(&balcony).await.unwrap(), None);
    }
}
