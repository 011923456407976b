//! Registry of stream management queues.
//!
//! Active queues are registered under the full JID of their stream. When a
//! stream drops without a protocol error its queue hibernates here until a
//! `<resume/>` claims it or the hibernation timer expires.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use jid::{BareJid, Jid};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{decode_smid, SmConfig, SmQueue, SmSnapshot};
use crate::cluster::ResourceLocator;
use crate::error::{StreamError, StreamErrorCondition};
use crate::mailbox::{StreamHandle, StreamId};
use crate::metrics;
use crate::XmppError;

/// How long a resume waits for the previous connection to let go.
pub const DEFAULT_RESUME_TAKEOVER_TIMEOUT: Duration = Duration::from_secs(5);

/// A queue shared by its stream task and the registry.
pub type SharedQueue = Arc<Mutex<SmQueue>>;

/// Why a `<resume/>` was refused. Every variant is reported to the client
/// as `item-not-found`.
#[derive(Debug, Error)]
pub enum ResumeError {
    #[error("malformed resumption id")]
    MalformedId,

    #[error("no session to resume")]
    NotFound,

    #[error("resumption id does not belong to this account")]
    Mismatch,

    #[error("queue transfer failed: {0}")]
    Transfer(#[from] XmppError),
}

/// Fetches a queue hibernated on another cluster node.
#[async_trait]
pub trait QueueTransfer: Send + Sync {
    /// Ask node `instance_id` to hand over the queue of `jid`.
    ///
    /// The owning node checks `owner` and `nonce` before it detaches the
    /// queue, so a rejected claim leaves the queue where it was.
    async fn transfer_queue(
        &self,
        instance_id: &str,
        jid: &Jid,
        owner: &BareJid,
        nonce: &[u8],
    ) -> Result<SmSnapshot, ResumeError>;
}

struct Registration {
    owner: StreamId,
    handle: Option<StreamHandle>,
    queue: SharedQueue,
    expiry: Option<CancellationToken>,
}

/// Node-wide queue registry.
pub struct SmManager {
    config: SmConfig,
    queues: DashMap<String, Registration>,
    locator: Option<ResourceLocator>,
    transfer: Option<Arc<dyn QueueTransfer>>,
}

impl fmt::Debug for SmManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmManager")
            .field("queues", &self.queues.len())
            .field("clustered", &self.locator.is_some())
            .finish()
    }
}

impl SmManager {
    pub fn new(
        config: SmConfig,
        locator: Option<ResourceLocator>,
        transfer: Option<Arc<dyn QueueTransfer>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            queues: DashMap::new(),
            locator,
            transfer,
        })
    }

    pub fn config(&self) -> &SmConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Register the queue of a live stream under its full JID.
    pub fn register(&self, queue: SharedQueue, jid: &Jid, handle: StreamHandle) {
        let previous = self.queues.insert(
            jid.to_string(),
            Registration {
                owner: handle.id(),
                handle: Some(handle),
                queue,
                expiry: None,
            },
        );
        if let Some(expiry) = previous.and_then(|p| p.expiry) {
            expiry.cancel();
        }
    }

    /// Drop the registration of `jid` if `stream` still owns it.
    pub fn unregister(&self, jid: &Jid, stream: StreamId) -> bool {
        self.queues
            .remove_if(&jid.to_string(), |_, r| r.owner == stream)
            .is_some()
    }

    /// Detach the queue of `stream` from its connection and keep it for
    /// `hibernate_time`. Returns false if the stream no longer owns it.
    pub fn hibernate(self: &Arc<Self>, jid: &Jid, stream: StreamId) -> bool {
        let key = jid.to_string();
        let Some(mut registration) = self.queues.get_mut(&key) else {
            return false;
        };
        if registration.owner != stream {
            return false;
        }
        let expiry = CancellationToken::new();
        registration.handle = None;
        registration.expiry = Some(expiry.clone());
        drop(registration);

        debug!(jid = %jid, hibernate_time = ?self.config.hibernate_time, "Hibernating queue");
        let manager = Arc::clone(self);
        let jid = jid.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = expiry.cancelled() => {}
                _ = tokio::time::sleep(manager.config.hibernate_time) => {
                    manager.expire(&jid, stream).await;
                }
            }
        });
        true
    }

    async fn expire(&self, jid: &Jid, stream: StreamId) {
        let removed = self
            .queues
            .remove_if(&jid.to_string(), |_, r| r.owner == stream && r.handle.is_none())
            .is_some();
        if !removed {
            return;
        }
        info!(jid = %jid, "Hibernated queue expired");
        if let Some(locator) = &self.locator {
            if let Err(err) = locator.unregister(jid).await {
                warn!(jid = %jid, error = %err, "Failed to unregister expired resource");
            }
        }
    }

    /// Remove the queue of `jid`, disconnecting the stream still holding it.
    #[instrument(skip(self), fields(jid = %jid), name = "xmpp.sm.take")]
    pub async fn take(&self, jid: &Jid) -> Option<SharedQueue> {
        let (_, registration) = self.queues.remove(&jid.to_string())?;
        Some(self.release(registration).await)
    }

    async fn release(&self, registration: Registration) -> SharedQueue {
        if let Some(expiry) = registration.expiry {
            expiry.cancel();
        }
        if let Some(handle) = registration.handle {
            debug!(stream = %handle.id(), "Disconnecting stream superseded by resumption");
            handle
                .disconnect(Some(StreamError::new(StreamErrorCondition::Conflict)))
                .await;
            if tokio::time::timeout(DEFAULT_RESUME_TAKEOVER_TIMEOUT, handle.done())
                .await
                .is_err()
            {
                warn!(stream = %handle.id(), "Superseded stream did not terminate in time");
            }
        }
        registration.queue
    }

    /// Hand a local queue over to another node, once `owner` and `nonce`
    /// match it.
    #[instrument(skip(self, nonce), fields(jid = %jid), name = "xmpp.sm.transfer_out")]
    pub async fn transfer_out(
        &self,
        jid: &Jid,
        owner: &BareJid,
        nonce: &[u8],
    ) -> Result<SmSnapshot, ResumeError> {
        if jid.to_bare() != *owner {
            return Err(ResumeError::Mismatch);
        }
        let queue = self.claim_local(jid, nonce).await?;
        let snapshot = queue.lock().await.snapshot();
        Ok(snapshot)
    }

    /// Find, validate and claim the queue a `<resume previd=.../>` refers to.
    ///
    /// `owner` is the account the resuming stream authenticated as.
    #[instrument(skip(self, smid), fields(owner = %owner), name = "xmpp.sm.resume")]
    pub async fn resume(&self, smid: &str, owner: &BareJid) -> Result<SharedQueue, ResumeError> {
        let result = self.claim(smid, owner).await;
        metrics::record_sm_resumption(result.is_ok());
        result
    }

    async fn claim(&self, smid: &str, owner: &BareJid) -> Result<SharedQueue, ResumeError> {
        let (jid, nonce) = decode_smid(smid).ok_or(ResumeError::MalformedId)?;
        if jid.to_bare() != *owner {
            return Err(ResumeError::Mismatch);
        }

        if let Some(instance) = self.remote_owner(&jid).await {
            let transfer = self.transfer.as_ref().ok_or(ResumeError::NotFound)?;
            debug!(instance = %instance, "Fetching queue from cluster member");
            let snapshot = transfer
                .transfer_queue(&instance, &jid, owner, &nonce)
                .await?;
            let queue = SmQueue::from_snapshot(snapshot, self.config.clone());
            return Ok(Arc::new(Mutex::new(queue)));
        }
        self.claim_local(&jid, &nonce).await
    }

    /// Take the local queue of `jid` if its nonce matches.
    async fn claim_local(&self, jid: &Jid, nonce: &[u8]) -> Result<SharedQueue, ResumeError> {
        let key = jid.to_string();
        let candidate = self
            .queues
            .get(&key)
            .map(|r| Arc::clone(&r.queue))
            .ok_or(ResumeError::NotFound)?;
        if candidate.lock().await.nonce() != nonce {
            return Err(ResumeError::Mismatch);
        }
        // The registration may have been replaced while the lock was awaited.
        let (_, registration) = self
            .queues
            .remove_if(&key, |_, r| Arc::ptr_eq(&r.queue, &candidate))
            .ok_or(ResumeError::NotFound)?;
        Ok(self.release(registration).await)
    }

    /// Instance id of the cluster member owning `jid`, when not this node.
    async fn remote_owner(&self, jid: &Jid) -> Option<String> {
        let locator = self.locator.as_ref()?;
        match locator.locate(jid).await {
            Ok(Some(instance)) if instance != locator.instance_id() => Some(instance),
            Ok(_) => None,
            Err(err) => {
                warn!(jid = %jid, error = %err, "Resource lookup failed");
                None
            }
        }
    }
}

/// [`QueueTransfer`] between managers living in the same process.
#[derive(Default)]
pub struct LocalQueueTransfer {
    nodes: DashMap<String, Arc<SmManager>>,
}

impl LocalQueueTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, instance_id: impl Into<String>, manager: Arc<SmManager>) {
        self.nodes.insert(instance_id.into(), manager);
    }
}

#[async_trait]
impl QueueTransfer for LocalQueueTransfer {
    async fn transfer_queue(
        &self,
        instance_id: &str,
        jid: &Jid,
        owner: &BareJid,
        nonce: &[u8],
    ) -> Result<SmSnapshot, ResumeError> {
        let manager = self
            .nodes
            .get(instance_id)
            .map(|m| Arc::clone(m.value()))
            .ok_or_else(|| XmppError::internal(format!("unknown cluster member {instance_id}")))?;
        manager.transfer_out(jid, owner, nonce).await
    }
}
