//! In-process hook bus.
//!
//! Named hooks carry a [`HookContext`] through every registered handler in
//! descending priority order. A handler returning [`HookError::Stopped`]
//! halts the chain without failing the caller; any other error aborts the
//! operation that ran the hook.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use jid::Jid;
use minidom::Element;
use thiserror::Error;
use tracing::trace;

use crate::cluster::Member;
use crate::mailbox::StreamId;

/// A C2S stream finished connecting (header exchanged).
pub const C2S_STREAM_CONNECTED: &str = "c2s.stream.connected";
/// A C2S stream authenticated.
pub const C2S_STREAM_AUTHENTICATED: &str = "c2s.stream.authenticated";
/// A C2S stream bound a resource.
pub const C2S_STREAM_BINDED: &str = "c2s.stream.binded";
/// A C2S stream received a top-level element.
pub const C2S_STREAM_ELEMENT_RECEIVED: &str = "c2s.stream.element_received";
/// A stanza is about to be routed; halting drops it.
pub const C2S_STREAM_WILL_ROUTE_ELEMENT: &str = "c2s.stream.will_route_element";
/// A C2S stream wrote an element.
pub const C2S_STREAM_ELEMENT_SENT: &str = "c2s.stream.element_sent";
/// A C2S stream terminated. Runs exactly once per stream.
pub const C2S_STREAM_TERMINATED: &str = "c2s.stream.terminated";
/// An incoming S2S stream was authorized.
pub const S2S_IN_STREAM_REGISTERED: &str = "s2s.in.stream.registered";
/// An incoming S2S stream received an element.
pub const S2S_IN_STREAM_ELEMENT_RECEIVED: &str = "s2s.in.stream.element_received";
/// An incoming S2S stream terminated.
pub const S2S_IN_STREAM_TERMINATED: &str = "s2s.in.stream.terminated";
/// An outgoing S2S stream authenticated.
pub const S2S_OUT_STREAM_CONNECTED: &str = "s2s.out.stream.connected";
/// An outgoing S2S stream terminated.
pub const S2S_OUT_STREAM_TERMINATED: &str = "s2s.out.stream.terminated";
/// Cluster members joined or left.
pub const MEMBER_LIST_UPDATED: &str = "memberlist.updated";

/// Payload of a hook invocation.
#[derive(Debug, Clone)]
pub enum HookInfo {
    C2sStream {
        id: StreamId,
        jid: Option<Jid>,
        element: Option<Element>,
    },
    S2sStream {
        id: StreamId,
        sender: String,
        target: String,
        element: Option<Element>,
    },
    MemberList {
        registered: Vec<Member>,
        unregistered: Vec<String>,
    },
}

/// Execution context threaded through the handlers of one run.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub info: HookInfo,
    /// Value accumulated by [`Hooks::run_fold`].
    pub output: Option<Element>,
}

impl HookContext {
    pub fn new(info: HookInfo) -> Self {
        Self { info, output: None }
    }

    /// Element carried by a stream hook, if any.
    pub fn element(&self) -> Option<&Element> {
        match &self.info {
            HookInfo::C2sStream { element, .. } | HookInfo::S2sStream { element, .. } => {
                element.as_ref()
            }
            HookInfo::MemberList { .. } => None,
        }
    }
}

/// Hook handler failures.
#[derive(Debug, Error)]
pub enum HookError {
    /// Stop running further handlers; not an error for the caller.
    #[error("hook execution stopped")]
    Stopped,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A hook subscriber.
#[async_trait]
pub trait HookHandler: Send + Sync {
    async fn handle(&self, ctx: &mut HookContext) -> Result<(), HookError>;
}

/// Adapts a synchronous closure into a [`HookHandler`].
pub struct FnHandler<F>(F);

/// Wrap a closure as a shareable handler.
pub fn hook_fn<F>(f: F) -> Arc<dyn HookHandler>
where
    F: Fn(&mut HookContext) -> Result<(), HookError> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

#[async_trait]
impl<F> HookHandler for FnHandler<F>
where
    F: Fn(&mut HookContext) -> Result<(), HookError> + Send + Sync,
{
    async fn handle(&self, ctx: &mut HookContext) -> Result<(), HookError> {
        (self.0)(ctx)
    }
}

/// Identifies a registration for [`Hooks::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookId(u64);

#[derive(Clone)]
struct Registration {
    id: HookId,
    priority: i32,
    handler: Arc<dyn HookHandler>,
}

/// The hook bus.
#[derive(Default)]
pub struct Hooks {
    handlers: DashMap<String, Vec<Registration>>,
    next_id: AtomicU64,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("hooks", &self.handlers.len())
            .finish()
    }
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`. Higher priorities run first; equal
    /// priorities keep registration order.
    pub fn add(&self, name: &str, handler: Arc<dyn HookHandler>, priority: i32) -> HookId {
        let id = HookId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut entry = self.handlers.entry(name.to_string()).or_default();
        entry.push(Registration {
            id,
            priority,
            handler,
        });
        entry.sort_by(|a, b| b.priority.cmp(&a.priority));
        id
    }

    /// Unregister a handler. Returns whether it was registered.
    pub fn remove(&self, name: &str, id: HookId) -> bool {
        let Some(mut entry) = self.handlers.get_mut(name) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|r| r.id != id);
        before != entry.len()
    }

    pub fn has_handlers(&self, name: &str) -> bool {
        self.handlers.get(name).is_some_and(|h| !h.is_empty())
    }

    /// Run every handler of `name`. Returns `Ok(true)` when a handler halted
    /// the chain.
    pub async fn run(&self, name: &str, info: HookInfo) -> Result<bool, HookError> {
        let mut ctx = HookContext::new(info);
        self.run_with(name, &mut ctx).await
    }

    /// Run every handler of `name`, threading `output` through them.
    /// Returns the final output and whether the chain was halted.
    pub async fn run_fold(
        &self,
        name: &str,
        info: HookInfo,
        output: Option<Element>,
    ) -> Result<(Option<Element>, bool), HookError> {
        let mut ctx = HookContext { info, output };
        let halted = self.run_with(name, &mut ctx).await?;
        Ok((ctx.output, halted))
    }

    async fn run_with(&self, name: &str, ctx: &mut HookContext) -> Result<bool, HookError> {
        // Snapshot so no map lock is held across handler awaits.
        let registrations = match self.handlers.get(name) {
            Some(entry) => entry.clone(),
            None => return Ok(false),
        };
        for registration in registrations {
            match registration.handler.handle(ctx).await {
                Ok(()) => {}
                Err(HookError::Stopped) => {
                    trace!(hook = name, "Hook stopped");
                    return Ok(true);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::parser::ns;

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> Arc<dyn HookHandler> {
        let log = log.clone();
        hook_fn(move |_| {
            log.lock().unwrap().push(tag);
            Ok(())
        })
    }

    fn info() -> HookInfo {
        HookInfo::C2sStream {
            id: StreamId::next(),
            jid: None,
            element: None,
        }
    }

    #[tokio::test]
    async fn test_priority_order() {
        let hooks = Hooks::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        hooks.add("h", recorder(&log, "low"), 1);
        hooks.add("h", recorder(&log, "high"), 10);
        hooks.add("h", recorder(&log, "mid-a"), 5);
        hooks.add("h", recorder(&log, "mid-b"), 5);

        assert!(!hooks.run("h", info()).await.unwrap());
        assert_eq!(*log.lock().unwrap(), vec!["high", "mid-a", "mid-b", "low"]);
    }

    #[tokio::test]
    async fn test_stopped_halts_without_error() {
        let hooks = Hooks::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        hooks.add("h", hook_fn(|_| Err(HookError::Stopped)), 10);
        hooks.add("h", recorder(&log, "never"), 1);

        assert!(hooks.run("h", info()).await.unwrap());
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_error_propagates() {
        let hooks = Hooks::new();
        hooks.add(
            "h",
            hook_fn(|_| Err(HookError::Other(anyhow::anyhow!("boom")))),
            0,
        );
        assert!(matches!(
            hooks.run("h", info()).await,
            Err(HookError::Other(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_and_fold() {
        let hooks = Hooks::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = hooks.add("h", recorder(&log, "removed"), 0);
        hooks.add(
            "h",
            hook_fn(|ctx| {
                let count = ctx.output.as_ref().map_or(0, |e| e.children().count());
                let mut out = ctx
                    .output
                    .take()
                    .unwrap_or_else(|| Element::builder("features", ns::STREAM).build());
                out.append_child(Element::builder(format!("f{count}"), "urn:test").build());
                ctx.output = Some(out);
                Ok(())
            }),
            0,
        );
        assert!(hooks.remove("h", id));
        assert!(!hooks.remove("h", id));

        let (output, halted) = hooks
            .run_fold("h", info(), Some(Element::builder("features", ns::STREAM).build()))
            .await
            .unwrap();
        assert!(!halted);
        let output = output.unwrap();
        assert_eq!(output.children().count(), 1);
        assert!(output.has_child("f0", "urn:test"));
        assert!(log.lock().unwrap().is_empty());
        assert!(!hooks.run("unknown", info()).await.unwrap());
    }
}
