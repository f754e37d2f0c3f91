//! Container property types
//!
//! Two representations exist. [`PropertySet`] is the sparse form held by the
//! authority: only explicitly set properties, each tagged by type.
//! [`PropertyRecord`] is the flat form cached on every node and carried
//! between nodes: one field per type plus a mask of the valid ones.

use super::acl::{Acl, AclSlot};
use serde::{Deserialize, Serialize};

/// Longest container label, in bytes
pub const LABEL_MAX_LEN: usize = 127;

/// Longest owner, owner-group or ACE principal, in bytes
pub const PRINCIPAL_MAX_LEN: usize = 255;

/// Property type tags
///
/// The discriminant is the bit position in [`PropertyRecord::valid`], and
/// [`PropType::ALL`] is the canonical order both marshaling directions walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropType {
    Label = 0,
    LayoutType = 1,
    LayoutVer = 2,
    Csum = 3,
    CsumChunkSize = 4,
    CsumServerVerify = 5,
    Dedup = 6,
    DedupThreshold = 7,
    RedunFac = 8,
    RedunLvl = 9,
    SnapshotMax = 10,
    Compress = 11,
    Encrypt = 12,
    Acl = 13,
    Owner = 14,
    OwnerGroup = 15,
    RootOids = 16,
    Status = 17,
    GlobalVersion = 18,
    ObjVersion = 19,
}

impl PropType {
    /// Canonical marshaling order
    pub const ALL: [Self; 20] = [
        Self::Label,
        Self::LayoutType,
        Self::LayoutVer,
        Self::Csum,
        Self::CsumChunkSize,
        Self::CsumServerVerify,
        Self::Dedup,
        Self::DedupThreshold,
        Self::RedunFac,
        Self::RedunLvl,
        Self::SnapshotMax,
        Self::Compress,
        Self::Encrypt,
        Self::Acl,
        Self::Owner,
        Self::OwnerGroup,
        Self::RootOids,
        Self::Status,
        Self::GlobalVersion,
        Self::ObjVersion,
    ];

    /// Every bit a valid mask may carry
    pub const KNOWN_MASK: u32 = (1 << Self::ALL.len()) - 1;

    /// Bit of this type in a valid mask
    #[must_use]
    pub const fn bit(self) -> u32 {
        1 << self as u32
    }
}

/// Object identifier as stored in the root-object property
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Oid {
    pub hi: u64,
    pub lo: u64,
}

/// Container health
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContHealth {
    #[default]
    Healthy,
    Unclean,
}

/// Container status property
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContStatus {
    pub health: ContHealth,
    /// Bumped on every health transition
    pub generation: u32,
}

/// One explicitly set property
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Prop {
    Label(String),
    LayoutType(u16),
    LayoutVer(u16),
    Csum(u32),
    CsumChunkSize(u32),
    CsumServerVerify(bool),
    Dedup(u32),
    DedupThreshold(u64),
    RedunFac(u32),
    RedunLvl(u32),
    SnapshotMax(u64),
    Compress(u32),
    Encrypt(u32),
    Acl(Acl),
    Owner(String),
    OwnerGroup(String),
    RootOids([Oid; 4]),
    Status(ContStatus),
    GlobalVersion(u32),
    ObjVersion(u32),
}

impl Prop {
    /// Type tag of this entry
    #[must_use]
    pub const fn prop_type(&self) -> PropType {
        match self {
            Self::Label(_) => PropType::Label,
            Self::LayoutType(_) => PropType::LayoutType,
            Self::LayoutVer(_) => PropType::LayoutVer,
            Self::Csum(_) => PropType::Csum,
            Self::CsumChunkSize(_) => PropType::CsumChunkSize,
            Self::CsumServerVerify(_) => PropType::CsumServerVerify,
            Self::Dedup(_) => PropType::Dedup,
            Self::DedupThreshold(_) => PropType::DedupThreshold,
            Self::RedunFac(_) => PropType::RedunFac,
            Self::RedunLvl(_) => PropType::RedunLvl,
            Self::SnapshotMax(_) => PropType::SnapshotMax,
            Self::Compress(_) => PropType::Compress,
            Self::Encrypt(_) => PropType::Encrypt,
            Self::Acl(_) => PropType::Acl,
            Self::Owner(_) => PropType::Owner,
            Self::OwnerGroup(_) => PropType::OwnerGroup,
            Self::RootOids(_) => PropType::RootOids,
            Self::Status(_) => PropType::Status,
            Self::GlobalVersion(_) => PropType::GlobalVersion,
            Self::ObjVersion(_) => PropType::ObjVersion,
        }
    }
}

/// Sparse property set
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertySet {
    entries: Vec<Prop>,
}

impl PropertySet {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Append an entry
    pub fn push(&mut self, prop: Prop) {
        self.entries.push(prop);
    }

    /// Look up an entry by type
    #[must_use]
    pub fn get(&self, ty: PropType) -> Option<&Prop> {
        self.entries.iter().find(|p| p.prop_type() == ty)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Prop> {
        self.entries.iter()
    }

    /// Bits of every type present
    #[must_use]
    pub fn mask(&self) -> u32 {
        self.entries.iter().fold(0, |m, p| m | p.prop_type().bit())
    }

    /// Set or replace each entry of `other`, keeping canonical order
    pub fn merge(&mut self, other: Self) {
        for prop in other.entries {
            let ty = prop.prop_type();
            match self.entries.iter_mut().find(|p| p.prop_type() == ty) {
                Some(existing) => *existing = prop,
                None => self.entries.push(prop),
            }
        }
        self.entries.sort_by_key(|p| p.prop_type() as u32);
    }

    /// Keep only the entries whose type bit is in `bits`
    #[must_use]
    pub fn filter(&self, bits: u32) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|p| bits & p.prop_type().bit() != 0)
                .cloned()
                .collect(),
        }
    }
}

impl From<Vec<Prop>> for PropertySet {
    fn from(entries: Vec<Prop>) -> Self {
        Self { entries }
    }
}

impl<'a> IntoIterator for &'a PropertySet {
    type Item = &'a Prop;
    type IntoIter = std::slice::Iter<'a, Prop>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Flat property record
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyRecord {
    /// One [`PropType::bit`] per field that is logically present
    pub valid: u32,
    pub label: String,
    pub layout_type: u16,
    pub layout_ver: u16,
    pub csum: u32,
    pub csum_chunk_size: u32,
    pub csum_server_verify: bool,
    pub dedup: u32,
    pub dedup_threshold: u64,
    pub redun_fac: u32,
    pub redun_lvl: u32,
    pub snapshot_max: u64,
    pub compress: u32,
    pub encrypt: u32,
    pub acl: AclSlot,
    pub owner: String,
    pub owner_group: String,
    pub root_oids: [Oid; 4],
    pub status: ContStatus,
    pub global_version: u32,
    pub obj_version: u32,
}

impl PropertyRecord {
    /// Check whether a type is present
    #[must_use]
    pub const fn has(&self, ty: PropType) -> bool {
        self.valid & ty.bit() != 0
    }
}
