//! Per-stream run-queue.
//!
//! Every stream task owns a [`Mailbox`]; everything else talks to it through
//! a cloneable [`StreamHandle`]. All writes to a stream go through its
//! mailbox, so the wire order of one stream is its submission order.
//!
//! Routing never waits on a mailbox: a stream whose mailbox is full loses
//! the element and is disconnected with `policy-violation`.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use minidom::Element;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{StreamError, StreamErrorCondition};
use crate::XmppError;

/// Default mailbox depth.
pub const MAILBOX_CAPACITY: usize = 256;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique stream identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

impl StreamId {
    pub fn next() -> Self {
        Self(NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request delivered to a stream task.
#[derive(Debug)]
pub enum StreamCommand {
    /// Write an element; `flushed` resolves once it hit the transport.
    Send {
        element: Element,
        flushed: Option<oneshot::Sender<Result<(), XmppError>>>,
    },
    /// Close the stream, optionally with a stream error.
    Disconnect { error: Option<StreamError> },
}

/// Cloneable address of a running stream.
#[derive(Clone)]
pub struct StreamHandle {
    id: StreamId,
    tx: mpsc::Sender<StreamCommand>,
    done: CancellationToken,
    overflowed: Arc<AtomicBool>,
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.id)
            .field("done", &self.done.is_cancelled())
            .finish()
    }
}

impl StreamHandle {
    /// Create a handle and the mailbox its stream task consumes.
    pub fn channel(capacity: usize) -> (Self, Mailbox) {
        let (tx, rx) = mpsc::channel(capacity);
        let done = CancellationToken::new();
        let id = StreamId::next();
        (
            Self {
                id,
                tx,
                done: done.clone(),
                overflowed: Arc::new(AtomicBool::new(false)),
            },
            Mailbox { id, rx, done },
        )
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Queue an element without waiting for room or for it to be written.
    ///
    /// A full mailbox drops the element and schedules a `policy-violation`
    /// disconnect of the stream.
    pub fn deliver(&self, element: Element) -> Result<(), XmppError> {
        let command = StreamCommand::Send {
            element,
            flushed: None,
        };
        match self.tx.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(XmppError::StreamClosed),
            Err(TrySendError::Full(_)) => {
                if !self.overflowed.swap(true, Ordering::AcqRel) {
                    warn!(stream = %self.id, "Mailbox full, disconnecting stream");
                    let handle = self.clone();
                    tokio::spawn(async move {
                        handle
                            .disconnect(Some(StreamError::new(StreamErrorCondition::PolicyViolation)))
                            .await;
                    });
                }
                Err(XmppError::MailboxFull)
            }
        }
    }

    /// Queue an element and wait until the transport flushed it.
    pub async fn send_element(&self, element: Element) -> Result<(), XmppError> {
        let (flushed_tx, flushed_rx) = oneshot::channel();
        self.tx
            .send(StreamCommand::Send {
                element,
                flushed: Some(flushed_tx),
            })
            .await
            .map_err(|_| XmppError::StreamClosed)?;
        flushed_rx.await.map_err(|_| XmppError::StreamClosed)?
    }

    /// Ask the stream to close. No-op if it is already gone.
    pub async fn disconnect(&self, error: Option<StreamError>) {
        let _ = self.tx.send(StreamCommand::Disconnect { error }).await;
    }

    /// Resolves once the stream task has terminated.
    pub async fn done(&self) {
        self.done.cancelled().await
    }

    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }
}

/// Consumer side of a stream's run-queue.
pub struct Mailbox {
    id: StreamId,
    rx: mpsc::Receiver<StreamCommand>,
    done: CancellationToken,
}

impl Mailbox {
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Next command; `None` once every handle is dropped.
    pub async fn recv(&mut self) -> Option<StreamCommand> {
        self.rx.recv().await
    }

    /// Mark the stream terminated and reject queued sends.
    pub fn finish(&mut self) {
        self.rx.close();
        while let Ok(command) = self.rx.try_recv() {
            if let StreamCommand::Send {
                flushed: Some(flushed),
                ..
            } = command
            {
                let _ = flushed.send(Err(XmppError::StreamClosed));
            }
        }
        self.done.cancel();
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        self.done.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ns;

    #[test]
    fn test_stream_ids_are_unique() {
        let a = StreamId::next();
        let b = StreamId::next();
        assert!(b.get() > a.get());
    }

    #[tokio::test]
    async fn test_send_element_waits_for_flush() {
        let (handle, mut mailbox) = StreamHandle::channel(4);

        let sender = tokio::spawn({
            let handle = handle.clone();
            async move { handle.send_element(Element::builder("message", ns::CLIENT).build()).await }
        });

        match mailbox.recv().await {
            Some(StreamCommand::Send {
                element,
                flushed: Some(flushed),
            }) => {
                assert_eq!(element.name(), "message");
                flushed.send(Ok(())).unwrap();
            }
            other => panic!("unexpected command: {other:?}"),
        }
        sender.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_finish_rejects_pending_sends() {
        let (handle, mut mailbox) = StreamHandle::channel(4);
        let sender = tokio::spawn({
            let handle = handle.clone();
            async move { handle.send_element(Element::builder("presence", ns::CLIENT).build()).await }
        });
        tokio::task::yield_now().await;
        while handle.tx.capacity() == 4 {
            tokio::task::yield_now().await;
        }

        mailbox.finish();
        assert!(matches!(sender.await.unwrap(), Err(XmppError::StreamClosed)));
        assert!(handle.is_done());
        handle.done().await;
        assert!(handle.deliver(Element::builder("iq", ns::CLIENT).build()).is_err());
    }

    #[tokio::test]
    async fn test_full_mailbox_drops_and_disconnects() {
        let (handle, mut mailbox) = StreamHandle::channel(2);
        let message = || Element::builder("message", ns::CLIENT).build();
        handle.deliver(message()).unwrap();
        handle.deliver(message()).unwrap();

        assert!(matches!(handle.deliver(message()), Err(XmppError::MailboxFull)));
        assert!(matches!(handle.deliver(message()), Err(XmppError::MailboxFull)));

        for _ in 0..2 {
            assert!(matches!(
                mailbox.recv().await,
                Some(StreamCommand::Send { .. })
            ));
        }
        match mailbox.recv().await {
            Some(StreamCommand::Disconnect { error: Some(error) }) => {
                assert_eq!(error.condition, StreamErrorCondition::PolicyViolation);
            }
            other => panic!("unexpected command: {other:?}"),
        }
        tokio::task::yield_now().await;
        assert!(mailbox.rx.try_recv().is_err());
    }
}
