//! Registry of live inbound streams.
//!
//! Tracks running stream tasks by their process-unique id so that they can
//! be enumerated and shut down together.

use std::fmt;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use tracing::{debug, info, instrument, warn};

use crate::error::{StreamError, StreamErrorCondition};
use crate::mailbox::{StreamHandle, StreamId};

/// How long [`StreamHub::shutdown`] waits for streams to finish.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Concurrent set of live streams keyed by [`StreamId`].
pub struct StreamHub {
    name: &'static str,
    streams: DashMap<StreamId, StreamHandle>,
}

impl StreamHub {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            streams: DashMap::new(),
        }
    }

    pub fn register(&self, handle: StreamHandle) {
        debug!(hub = self.name, stream = %handle.id(), "Registered stream");
        self.streams.insert(handle.id(), handle);
    }

    pub fn unregister(&self, id: StreamId) -> Option<StreamHandle> {
        let removed = self.streams.remove(&id).map(|(_, handle)| handle);
        if removed.is_some() {
            debug!(hub = self.name, stream = %id, "Unregistered stream");
        }
        removed
    }

    pub fn get(&self, id: StreamId) -> Option<StreamHandle> {
        self.streams.get(&id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Disconnect every stream with `system-shutdown` and wait (bounded)
    /// until they are done.
    #[instrument(skip(self), fields(hub = self.name), name = "xmpp.hub.shutdown")]
    pub async fn shutdown(&self, timeout: Duration) {
        let handles: Vec<StreamHandle> = self
            .streams
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        if handles.is_empty() {
            return;
        }
        info!(count = handles.len(), "Shutting down streams");

        let error = StreamError::new(StreamErrorCondition::SystemShutdown);
        join_all(handles.iter().map(|h| h.disconnect(Some(error.clone())))).await;

        let all_done = join_all(handles.iter().map(|h| h.done()));
        if tokio::time::timeout(timeout, all_done).await.is_err() {
            warn!(
                remaining = handles.iter().filter(|h| !h.is_done()).count(),
                "Streams did not finish before shutdown timeout"
            );
        }
        self.streams.clear();
    }
}

impl fmt::Debug for StreamHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHub")
            .field("name", &self.name)
            .field("stream_count", &self.streams.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::StreamCommand;

    #[test]
    fn test_register_unregister() {
        let hub = StreamHub::new("c2s");
        let (handle, _mailbox) = StreamHandle::channel(4);
        let id = handle.id();

        hub.register(handle);
        assert_eq!(hub.len(), 1);
        assert!(hub.get(id).is_some());

        assert!(hub.unregister(id).is_some());
        assert!(hub.unregister(id).is_none());
        assert!(hub.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_with_system_shutdown() {
        let hub = StreamHub::new("s2s-in");
        let (handle, mut mailbox) = StreamHandle::channel(4);
        hub.register(handle);

        let task = tokio::spawn(async move {
            let command = mailbox.recv().await;
            mailbox.finish();
            command
        });

        hub.shutdown(Duration::from_secs(1)).await;
        match task.await.unwrap() {
            Some(StreamCommand::Disconnect { error: Some(error) }) => {
                assert_eq!(error.condition, StreamErrorCondition::SystemShutdown);
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(hub.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_bounded() {
        let hub = StreamHub::new("c2s");
        let (handle, _mailbox) = StreamHandle::channel(4);
        hub.register(handle);

        // The mailbox is never consumed: shutdown must still return.
        hub.shutdown(Duration::from_secs(5)).await;
        assert!(hub.is_empty());
    }
}
