//! Out-stream provider.
//!
//! Keeps at most one out-stream per `(sender, target)` pair. Concurrent
//! callers asking for a missing pair share one dial: a placeholder cell
//! is inserted under the write lock and initialized outside of it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, instrument, warn};

use super::out_stream::{OutStream, OutStreamFactory};
use super::S2sError;
use crate::router::{RemoteRouter, RouteError};
use crate::stanza::Stanza;
use crate::XmppError;

type StreamKey = (String, String);
type StreamCell = Arc<OnceCell<Arc<dyn OutStream>>>;
type StreamMap = Arc<RwLock<HashMap<StreamKey, StreamCell>>>;

/// Registry of out-streams, and the router's path to remote domains.
pub struct OutProvider {
    factory: Arc<dyn OutStreamFactory>,
    streams: StreamMap,
}

impl OutProvider {
    pub fn new(factory: Arc<dyn OutStreamFactory>) -> Self {
        Self {
            factory,
            streams: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Number of tracked pairs, including dials in progress.
    pub async fn len(&self) -> usize {
        self.streams.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.streams.read().await.is_empty()
    }

    /// The out-stream from `sender` to `target`, dialed and started on
    /// first use.
    #[instrument(skip(self), name = "xmpp.s2s.get_out")]
    pub async fn get_out(&self, sender: &str, target: &str) -> Result<Arc<dyn OutStream>, S2sError> {
        let key = (sender.to_string(), target.to_string());
        loop {
            let existing = self.streams.read().await.get(&key).cloned();
            let cell = match existing {
                Some(cell) => cell,
                None => self
                    .streams
                    .write()
                    .await
                    .entry(key.clone())
                    .or_default()
                    .clone(),
            };

            if cell.get().is_some_and(|s| s.handle().is_done()) {
                // Terminated, and its watcher did not catch up yet.
                remove_if_same(&self.streams, &key, &cell).await;
                continue;
            }

            let result = cell
                .get_or_try_init(|| async {
                    let stream = self.factory.dial(sender, target).await?;
                    stream.start().await?;
                    self.watch(key.clone(), cell.clone(), stream.clone());
                    info!("Out-stream started");
                    Ok::<_, S2sError>(stream)
                })
                .await;
            return match result {
                Ok(stream) => Ok(stream.clone()),
                Err(err) => {
                    warn!(error = %err, "Failed to open out-stream");
                    remove_if_same(&self.streams, &key, &cell).await;
                    Err(err)
                }
            };
        }
    }

    /// Forget the pair once its stream terminates.
    fn watch(&self, key: StreamKey, cell: StreamCell, stream: Arc<dyn OutStream>) {
        let streams = self.streams.clone();
        tokio::spawn(async move {
            stream.handle().done().await;
            debug!(sender = %key.0, target = %key.1, "Out-stream done");
            remove_if_same(&streams, &key, &cell).await;
        });
    }

    /// Close every out-stream and wait (bounded) for them to finish.
    #[instrument(skip(self), name = "xmpp.s2s.out_provider.shutdown")]
    pub async fn shutdown(&self, timeout: Duration) {
        let streams: Vec<Arc<dyn OutStream>> = self
            .streams
            .write()
            .await
            .drain()
            .filter_map(|(_, cell)| cell.get().cloned())
            .collect();
        if streams.is_empty() {
            return;
        }
        info!(count = streams.len(), "Closing out-streams");
        join_all(streams.iter().map(|s| s.handle().disconnect(None))).await;
        let all_done = join_all(streams.iter().map(|s| s.handle().done()));
        if tokio::time::timeout(timeout, all_done).await.is_err() {
            warn!("Out-streams did not finish before shutdown timeout");
        }
    }
}

async fn remove_if_same(streams: &StreamMap, key: &StreamKey, cell: &StreamCell) {
    let mut streams = streams.write().await;
    if streams.get(key).is_some_and(|current| Arc::ptr_eq(current, cell)) {
        streams.remove(key);
    }
}

#[async_trait]
impl RemoteRouter for OutProvider {
    async fn route(&self, stanza: Stanza, sender: &str, target: &str) -> Result<(), RouteError> {
        let stream = self
            .get_out(sender, target)
            .await
            .map_err(|err| err.to_route_error())?;
        stream
            .handle()
            .deliver(stanza.into_element())
            .map_err(|err| match err {
                XmppError::MailboxFull => RouteError::ResourceConstraint,
                _ => RouteError::RemoteServerNotFound,
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::mailbox::{Mailbox, StreamCommand, StreamHandle};

    struct FakeStream {
        sender: String,
        target: String,
        handle: StreamHandle,
        starts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl OutStream for FakeStream {
        fn sender(&self) -> &str {
            &self.sender
        }

        fn target(&self) -> &str {
            &self.target
        }

        fn handle(&self) -> &StreamHandle {
            &self.handle
        }

        async fn start(&self) -> Result<(), S2sError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        dials: AtomicUsize,
        starts: Arc<AtomicUsize>,
        failures_left: AtomicUsize,
        mailboxes: Mutex<Vec<Mailbox>>,
    }

    #[async_trait]
    impl OutStreamFactory for FakeFactory {
        async fn dial(&self, sender: &str, target: &str) -> Result<Arc<dyn OutStream>, S2sError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(S2sError::Unreachable(target.to_string()));
            }
            let (handle, mailbox) = StreamHandle::channel(8);
            self.mailboxes.lock().unwrap().push(mailbox);
            Ok(Arc::new(FakeStream {
                sender: sender.to_string(),
                target: target.to_string(),
                handle,
                starts: self.starts.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_dial() {
        let factory = Arc::new(FakeFactory::default());
        let provider = OutProvider::new(factory.clone());

        let (a, b) = tokio::join!(
            provider.get_out("jackal.im", "jabber.org"),
            provider.get_out("jackal.im", "jabber.org"),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.handle().id(), b.handle().id());
        assert_eq!(factory.dials.load(Ordering::SeqCst), 1);
        assert_eq!(factory.starts.load(Ordering::SeqCst), 1);
        assert_eq!(provider.len().await, 1);

        // A different sender gets its own stream.
        let c = provider.get_out("example.org", "jabber.org").await.unwrap();
        assert_ne!(c.handle().id(), a.handle().id());
        assert_eq!(factory.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_dial_is_not_cached() {
        let factory = Arc::new(FakeFactory::default());
        factory.failures_left.store(1, Ordering::SeqCst);
        let provider = OutProvider::new(factory.clone());

        assert!(provider.get_out("jackal.im", "jabber.org").await.is_err());
        assert!(provider.is_empty().await);

        provider.get_out("jackal.im", "jabber.org").await.unwrap();
        assert_eq!(factory.dials.load(Ordering::SeqCst), 2);
        assert_eq!(factory.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_terminated_stream_is_replaced() {
        let factory = Arc::new(FakeFactory::default());
        let provider = OutProvider::new(factory.clone());

        let first = provider.get_out("jackal.im", "jabber.org").await.unwrap();
        factory.mailboxes.lock().unwrap()[0].finish();
        assert!(first.handle().is_done());

        let second = provider.get_out("jackal.im", "jabber.org").await.unwrap();
        assert_ne!(first.handle().id(), second.handle().id());
        assert_eq!(factory.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_route_queues_on_out_stream() {
        let factory = Arc::new(FakeFactory::default());
        let provider = OutProvider::new(factory.clone());

        let stanza = Stanza::from_element(
            "<message xmlns='jabber:client' from='ortuman@jackal.im/yard' to='romeo@jabber.org'><body>hi</body></message>"
                .parse()
                .unwrap(),
        )
        .unwrap();
        RemoteRouter::route(&provider, stanza, "jackal.im", "jabber.org")
            .await
            .unwrap();

        let mut mailbox = factory.mailboxes.lock().unwrap().remove(0);
        match mailbox.recv().await {
            Some(StreamCommand::Send { element, .. }) => {
                assert!(element.is("message", crate::parser::ns::CLIENT));
                assert_eq!(element.attr("to"), Some("romeo@jabber.org"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_domain_maps_to_route_error() {
        let factory = Arc::new(FakeFactory::default());
        factory.failures_left.store(1, Ordering::SeqCst);
        let provider = OutProvider::new(factory);

        let stanza = Stanza::from_element(
            "<message xmlns='jabber:client' from='ortuman@jackal.im/yard' to='romeo@jabber.org'/>"
                .parse()
                .unwrap(),
        )
        .unwrap();
        let err = RemoteRouter::route(&provider, stanza, "jackal.im", "jabber.org")
            .await
            .unwrap_err();
        assert_eq!(err, RouteError::RemoteServerNotFound);
    }
}
