//! Core type definitions for ivcache
//!
//! Identifiers for containers, container handles and server ranks, plus the
//! fixed set of metadata classes the cache serves.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Logical timestamp ordering container versions and snapshots
pub type Epoch = u64;

/// Unique identifier for a container
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into,
)]
pub struct ContainerId(Uuid);

impl ContainerId {
    /// Generate a new random container ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ContainerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContainerId({})", self.0)
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for an open container handle
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into,
)]
pub struct HandleId(Uuid);

impl HandleId {
    /// Generate a new random handle ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for HandleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandleId({})", self.0)
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Rank of a storage server within the propagation tree
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
)]
#[display("rank {_0}")]
pub struct Rank(pub u32);

/// The metadata classes served by the cache
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ClassId {
    /// Container handle capabilities (keyed by handle id)
    Capability,
    /// Container properties
    Property,
    /// Container snapshot epochs
    Snapshots,
    /// EC aggregation reports and boundaries
    AggEpoch,
    /// Object identifier ranges
    OidRange,
}

impl ClassId {
    /// Every class, in registration order
    pub const ALL: [Self; 5] = [
        Self::Capability,
        Self::Property,
        Self::Snapshots,
        Self::AggEpoch,
        Self::OidRange,
    ];

    /// Short name used in logs
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Capability => "capability",
            Self::Property => "property",
            Self::Snapshots => "snapshots",
            Self::AggEpoch => "agg_epoch",
            Self::OidRange => "oid_range",
        }
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a value applied at the root reaches the rest of the tree
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SyncMode {
    /// Not propagated
    #[default]
    None,
    /// Propagated in the background; the update returns immediately
    Lazy,
    /// The update returns once every node has applied the value
    Eager,
}
