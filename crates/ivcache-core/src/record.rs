//! Cached record types
//!
//! [`IvValue`] is both the record held in a node's entry store and the value
//! exchanged between nodes. Each variant belongs to exactly one [`ClassId`].

use crate::prop::PropertyRecord;
use ivcache_common::{ClassId, ContainerId, Epoch, Error, Rank, Result};
use serde::{Deserialize, Serialize};

/// Capability of an open container handle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    /// Container the handle was opened on
    pub container: ContainerId,
    /// Open flags
    pub flags: u64,
    /// Security capability bits granted at open
    pub sec_capas: u64,
    /// Pool map version in effect at the container's last status change
    pub status_pm_ver: u32,
}

/// Snapshot epochs of a container, ascending and unique
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotList {
    epochs: Vec<Epoch>,
}

impl SnapshotList {
    /// Build from epochs in any order; duplicates collapse
    #[must_use]
    pub fn new(mut epochs: Vec<Epoch>) -> Self {
        epochs.sort_unstable();
        epochs.dedup();
        Self { epochs }
    }

    #[must_use]
    pub fn epochs(&self) -> &[Epoch] {
        &self.epochs
    }

    #[must_use]
    pub fn into_epochs(self) -> Vec<Epoch> {
        self.epochs
    }

    /// Number of snapshots
    pub fn count(&self) -> Result<u32> {
        u32::try_from(self.epochs.len()).map_err(|_| Error::invalid("snapshot count overflow"))
    }
}

/// EC aggregation epoch traffic
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggEpoch {
    /// A node's local aggregation watermark, travelling to the root
    Report { rank: Rank, epoch: Epoch },
    /// Aggregation boundary computed by the root, travelling to every node
    Boundary { epoch: Epoch },
}

/// Half-open range of object identifiers `[base, base + count)`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OidRange {
    pub base: u64,
    pub count: u64,
}

impl OidRange {
    #[must_use]
    pub const fn new(base: u64, count: u64) -> Self {
        Self { base, count }
    }

    /// A reservation request for `count` ids
    #[must_use]
    pub const fn request(count: u64) -> Self {
        Self { base: 0, count }
    }

    /// One past the last id
    pub fn end(&self) -> Result<u64> {
        self.base
            .checked_add(self.count)
            .ok_or_else(|| Error::invalid("object id range overflows"))
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Take `count` ids off the front, if there are enough
    pub fn carve(&mut self, count: u64) -> Option<Self> {
        if count > self.count {
            return None;
        }
        let carved = Self::new(self.base, count);
        self.base += count;
        self.count -= count;
        Some(carved)
    }

    /// Fold a freshly granted range into this one
    ///
    /// A grant that starts right where this range ends extends it; any other
    /// grant replaces it and the leftover ids are never issued.
    pub fn absorb(&mut self, granted: Self) -> Result<()> {
        granted.end()?;
        if !self.is_empty() && self.end()? == granted.base {
            self.count += granted.count;
        } else {
            *self = granted;
        }
        Ok(())
    }

    /// Check whether two ranges share any id
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.base < other.base.saturating_add(other.count)
            && other.base < self.base.saturating_add(self.count)
    }
}

/// A cached record / propagated value
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IvValue {
    Capability(Capability),
    Property(Box<PropertyRecord>),
    Snapshots(SnapshotList),
    AggEpoch(AggEpoch),
    OidRange(OidRange),
}

impl IvValue {
    /// Class this value belongs to
    #[must_use]
    pub const fn class(&self) -> ClassId {
        match self {
            Self::Capability(_) => ClassId::Capability,
            Self::Property(_) => ClassId::Property,
            Self::Snapshots(_) => ClassId::Snapshots,
            Self::AggEpoch(_) => ClassId::AggEpoch,
            Self::OidRange(_) => ClassId::OidRange,
        }
    }

    pub fn into_capability(self) -> Result<Capability> {
        match self {
            Self::Capability(cap) => Ok(cap),
            other => Err(mismatch(ClassId::Capability, &other)),
        }
    }

    pub fn into_property(self) -> Result<PropertyRecord> {
        match self {
            Self::Property(record) => Ok(*record),
            other => Err(mismatch(ClassId::Property, &other)),
        }
    }

    pub fn into_snapshots(self) -> Result<SnapshotList> {
        match self {
            Self::Snapshots(list) => Ok(list),
            other => Err(mismatch(ClassId::Snapshots, &other)),
        }
    }

    pub fn into_agg_epoch(self) -> Result<AggEpoch> {
        match self {
            Self::AggEpoch(agg) => Ok(agg),
            other => Err(mismatch(ClassId::AggEpoch, &other)),
        }
    }

    pub fn into_oid_range(self) -> Result<OidRange> {
        match self {
            Self::OidRange(range) => Ok(range),
            other => Err(mismatch(ClassId::OidRange, &other)),
        }
    }
}

impl From<PropertyRecord> for IvValue {
    fn from(record: PropertyRecord) -> Self {
        Self::Property(Box::new(record))
    }
}

fn mismatch(expected: ClassId, got: &IvValue) -> Error {
    Error::invalid(format!(
        "expected {expected} record, got {}",
        got.class()
    ))
}
