//! ivcache core
//!
//! A per-container metadata cache replicated over a propagation tree of
//! storage nodes. The root node is authoritative; every other node caches
//! what it has fetched, forwards what it cannot apply locally, and receives
//! root-applied values by push.
//!
//! Five classes ride on the same plumbing: handle capabilities, container
//! properties, snapshot lists, EC aggregation epochs and object id ranges.

pub mod authority;
pub mod classes;
pub mod cluster;
pub mod context;
pub mod host;
pub mod iv;
pub mod prop;
pub mod record;

pub use authority::{Authority, HandleRecord, MemoryAuthority};
pub use cluster::{ClusterBuilder, LocalCluster};
pub use context::{NodeContext, SnapshotFetch};
pub use host::{ContainerHost, LocalHost};
pub use record::{AggEpoch, Capability, IvValue, OidRange, SnapshotList};
