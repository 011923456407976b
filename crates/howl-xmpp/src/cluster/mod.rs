//! Cluster coordination over a shared key-value store.

pub mod kv;
pub mod lease;
pub mod locator;
pub mod memberlist;

pub use kv::{Kv, KvError, KvEvent, KvEventKind, LeaseId, MemoryKv, WatchResponse};
pub use lease::{Lease, LeaseConfig};
pub use locator::ResourceLocator;
pub use memberlist::{Member, MemberList, CLUSTER_API_VERSION};
