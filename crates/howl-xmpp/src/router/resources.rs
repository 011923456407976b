//! Bound local resources.
//!
//! Maps an account node to the streams bound to it, in binding order, with
//! the last presence priority each resource advertised.

use dashmap::DashMap;
use jid::Jid;

use crate::mailbox::{StreamHandle, StreamId};

/// A stream bound to a full JID.
#[derive(Debug, Clone)]
pub struct BoundResource {
    pub jid: Jid,
    pub handle: StreamHandle,
    pub priority: i8,
    pub available: bool,
}

impl BoundResource {
    pub fn resource(&self) -> &str {
        self.jid.resource().map(|r| r.as_str()).unwrap_or_default()
    }
}

/// Concurrent table of bound resources keyed by account node.
#[derive(Debug, Default)]
pub struct ResourceTable {
    by_node: DashMap<String, Vec<BoundResource>>,
}

impl ResourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `jid` to `handle`, replacing any stream bound to the same
    /// resource. Returns the replaced stream.
    pub fn bind(&self, jid: Jid, handle: StreamHandle) -> Option<StreamHandle> {
        let node = node_of(&jid);
        let mut entries = self.by_node.entry(node).or_default();
        let replaced = entries
            .iter()
            .position(|e| same_resource(&e.jid, &jid))
            .map(|pos| entries.remove(pos).handle);
        entries.push(BoundResource {
            jid,
            handle,
            priority: 0,
            available: false,
        });
        replaced
    }

    /// Remove the binding of `jid` if it still belongs to `stream`.
    pub fn unbind(&self, jid: &Jid, stream: StreamId) -> bool {
        let node = node_of(jid);
        let Some(mut entries) = self.by_node.get_mut(&node) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| !(same_resource(&e.jid, jid) && e.handle.id() == stream));
        let removed = before != entries.len();
        let empty = entries.is_empty();
        drop(entries);
        if empty {
            self.by_node.remove_if(&node, |_, entries| entries.is_empty());
        }
        removed
    }

    pub fn get(&self, jid: &Jid) -> Option<BoundResource> {
        self.by_node
            .get(&node_of(jid))?
            .iter()
            .find(|e| same_resource(&e.jid, jid))
            .cloned()
    }

    /// Every resource bound to the account, in binding order.
    pub fn resources(&self, node: &str) -> Vec<BoundResource> {
        self.by_node
            .get(node)
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    /// Record the presence a resource broadcast.
    pub fn update_presence(&self, jid: &Jid, priority: i8, available: bool) -> bool {
        let Some(mut entries) = self.by_node.get_mut(&node_of(jid)) else {
            return false;
        };
        match entries.iter_mut().find(|e| same_resource(&e.jid, jid)) {
            Some(entry) => {
                entry.priority = priority;
                entry.available = available;
                true
            }
            None => false,
        }
    }

    /// Target of a message sent to the bare JID: highest priority first,
    /// earliest bound on ties.
    pub fn highest_priority(&self, node: &str) -> Option<BoundResource> {
        let entries = self.by_node.get(node)?;
        let mut best: Option<&BoundResource> = None;
        for entry in entries.iter() {
            if best.map_or(true, |b| entry.priority > b.priority) {
                best = Some(entry);
            }
        }
        best.cloned()
    }

    pub fn len(&self) -> usize {
        self.by_node.iter().map(|e| e.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn node_of(jid: &Jid) -> String {
    jid.node().map(|n| n.as_str().to_string()).unwrap_or_default()
}

fn same_resource(a: &Jid, b: &Jid) -> bool {
    a.resource().map(|r| r.as_str()) == b.resource().map(|r| r.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jid(s: &str) -> Jid {
        Jid::new(s).unwrap()
    }

    #[test]
    fn test_bind_replaces_same_resource() {
        let table = ResourceTable::new();
        let (first, _m1) = StreamHandle::channel(4);
        let (second, _m2) = StreamHandle::channel(4);

        assert!(table.bind(jid("ortuman@jackal.im/yard"), first.clone()).is_none());
        let replaced = table.bind(jid("ortuman@jackal.im/yard"), second.clone()).unwrap();
        assert_eq!(replaced.id(), first.id());
        assert_eq!(table.len(), 1);

        // The replaced stream must not remove the new binding.
        assert!(!table.unbind(&jid("ortuman@jackal.im/yard"), first.id()));
        assert!(table.unbind(&jid("ortuman@jackal.im/yard"), second.id()));
        assert!(table.is_empty());
    }

    #[test]
    fn test_highest_priority_tiebreak() {
        let table = ResourceTable::new();
        let (a, _ma) = StreamHandle::channel(4);
        let (b, _mb) = StreamHandle::channel(4);
        let (c, _mc) = StreamHandle::channel(4);
        table.bind(jid("noelia@jackal.im/a"), a.clone());
        table.bind(jid("noelia@jackal.im/b"), b.clone());
        table.bind(jid("noelia@jackal.im/c"), c.clone());

        table.update_presence(&jid("noelia@jackal.im/b"), 5, true);
        table.update_presence(&jid("noelia@jackal.im/c"), 5, true);
        assert_eq!(table.highest_priority("noelia").unwrap().handle.id(), b.id());

        table.update_presence(&jid("noelia@jackal.im/c"), 10, true);
        assert_eq!(table.highest_priority("noelia").unwrap().resource(), "c");
        assert!(table.highest_priority("nobody").is_none());
    }
}
