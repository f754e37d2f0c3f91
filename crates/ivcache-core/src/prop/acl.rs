//! Flat access-control lists
//!
//! Only the flat marshaling of an ACL is handled here: a fixed header
//! followed by variable-length entries, all little-endian.
//!
//! ```text
//! header: version u16 | reserved u16 | ace_bytes u32
//! ace:    principal_type u8 | access_types u8 | flags u16
//!         | principal_len u32 | allow_perms u64 | principal bytes
//! ```

use super::types::PRINCIPAL_MAX_LEN;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use ivcache_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Current ACL format version
pub const ACL_VERSION: u16 = 1;

/// Largest encoded ACL, header included
pub const ACL_MAX_SIZE: usize = 64 * 1024;

const ACL_HEADER_LEN: usize = 8;
const ACE_HEADER_LEN: usize = 16;

pub const ACCESS_ALLOW: u8 = 1 << 0;
pub const ACCESS_AUDIT: u8 = 1 << 1;
pub const ACCESS_ALARM: u8 = 1 << 2;
const ACCESS_MASK: u8 = ACCESS_ALLOW | ACCESS_AUDIT | ACCESS_ALARM;

pub const PERM_READ: u64 = 1 << 0;
pub const PERM_WRITE: u64 = 1 << 1;
pub const PERM_DEL_CONT: u64 = 1 << 2;
pub const PERM_GET_PROP: u64 = 1 << 3;
pub const PERM_SET_PROP: u64 = 1 << 4;
pub const PERM_GET_ACL: u64 = 1 << 5;
pub const PERM_SET_ACL: u64 = 1 << 6;
pub const PERM_SET_OWNER: u64 = 1 << 7;
const PERMS_MASK: u64 = (1 << 8) - 1;

/// Kind of principal an entry applies to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrincipalType {
    Owner,
    User,
    OwnerGroup,
    Group,
    Everyone,
}

impl PrincipalType {
    const fn to_u8(self) -> u8 {
        match self {
            Self::Owner => 0,
            Self::User => 1,
            Self::OwnerGroup => 2,
            Self::Group => 3,
            Self::Everyone => 4,
        }
    }

    fn from_u8(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(Self::Owner),
            1 => Ok(Self::User),
            2 => Ok(Self::OwnerGroup),
            3 => Ok(Self::Group),
            4 => Ok(Self::Everyone),
            other => Err(Error::invalid(format!("unknown ACL principal type {other}"))),
        }
    }

    /// User and group entries carry a `name@domain` principal
    const fn is_named(self) -> bool {
        matches!(self, Self::User | Self::Group)
    }
}

/// One access-control entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ace {
    pub principal_type: PrincipalType,
    pub principal: String,
    pub access_types: u8,
    pub flags: u16,
    pub allow_perms: u64,
}

impl Ace {
    /// Allow entry for a named user
    pub fn user(name: impl Into<String>, allow_perms: u64) -> Self {
        Self::allow(PrincipalType::User, name.into(), allow_perms)
    }

    /// Allow entry for a named group
    pub fn group(name: impl Into<String>, allow_perms: u64) -> Self {
        Self::allow(PrincipalType::Group, name.into(), allow_perms)
    }

    /// Allow entry for the container owner
    #[must_use]
    pub const fn owner(allow_perms: u64) -> Self {
        Self::allow(PrincipalType::Owner, String::new(), allow_perms)
    }

    /// Allow entry for everyone
    #[must_use]
    pub const fn everyone(allow_perms: u64) -> Self {
        Self::allow(PrincipalType::Everyone, String::new(), allow_perms)
    }

    const fn allow(principal_type: PrincipalType, principal: String, allow_perms: u64) -> Self {
        Self {
            principal_type,
            principal,
            access_types: ACCESS_ALLOW,
            flags: 0,
            allow_perms,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.access_types == 0 || self.access_types & !ACCESS_MASK != 0 {
            return Err(Error::invalid(format!(
                "bad ACE access types {:#x}",
                self.access_types
            )));
        }
        if self.allow_perms & !PERMS_MASK != 0 {
            return Err(Error::invalid(format!(
                "bad ACE permissions {:#x}",
                self.allow_perms
            )));
        }
        if self.principal_type.is_named() {
            if self.principal.len() > PRINCIPAL_MAX_LEN {
                return Err(Error::invalid("ACE principal too long"));
            }
            match self.principal.find('@') {
                Some(at) if at > 0 => {}
                _ => {
                    return Err(Error::invalid(format!(
                        "ACE principal '{}' is not name@domain",
                        self.principal
                    )));
                }
            }
        } else if !self.principal.is_empty() {
            return Err(Error::invalid(format!(
                "{:?} ACE must not name a principal",
                self.principal_type
            )));
        }
        Ok(())
    }
}

/// Access-control list
///
/// `version == 0` means "no ACL set".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    pub version: u16,
    pub aces: Vec<Ace>,
}

impl Acl {
    /// Create a current-version ACL
    #[must_use]
    pub const fn new(aces: Vec<Ace>) -> Self {
        Self {
            version: ACL_VERSION,
            aces,
        }
    }

    /// Size of the flat encoding
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        ACL_HEADER_LEN
            + self
                .aces
                .iter()
                .map(|ace| ACE_HEADER_LEN + ace.principal.len())
                .sum::<usize>()
    }

    /// Check the structure: version, entry fields and unique principals
    pub fn validate(&self) -> Result<()> {
        if self.version != ACL_VERSION {
            return Err(Error::invalid(format!(
                "unsupported ACL version {}",
                self.version
            )));
        }
        if self.encoded_len() > ACL_MAX_SIZE {
            return Err(Error::invalid("ACL exceeds maximum size"));
        }
        let mut seen = HashSet::with_capacity(self.aces.len());
        for ace in &self.aces {
            ace.validate()?;
            if !seen.insert((ace.principal_type, ace.principal.as_str())) {
                return Err(Error::invalid(format!(
                    "duplicate ACE for {:?} '{}'",
                    ace.principal_type, ace.principal
                )));
            }
        }
        Ok(())
    }

    /// Encode into the flat form
    pub fn to_bytes(&self) -> Result<Bytes> {
        let len = self.encoded_len();
        if len > ACL_MAX_SIZE {
            return Err(Error::invalid("ACL exceeds maximum size"));
        }
        let ace_bytes = u32::try_from(len - ACL_HEADER_LEN)
            .map_err(|_| Error::invalid("ACL exceeds maximum size"))?;

        let mut buf = BytesMut::with_capacity(len);
        buf.put_u16_le(self.version);
        buf.put_u16_le(0);
        buf.put_u32_le(ace_bytes);
        for ace in &self.aces {
            let principal_len = u32::try_from(ace.principal.len())
                .map_err(|_| Error::invalid("ACE principal too long"))?;
            buf.put_u8(ace.principal_type.to_u8());
            buf.put_u8(ace.access_types);
            buf.put_u16_le(ace.flags);
            buf.put_u32_le(principal_len);
            buf.put_u64_le(ace.allow_perms);
            buf.put_slice(ace.principal.as_bytes());
        }
        Ok(buf.freeze())
    }

    /// Decode the flat form without validating entry contents
    pub fn from_bytes(mut buf: &[u8]) -> Result<Self> {
        if buf.len() > ACL_MAX_SIZE {
            return Err(Error::invalid("ACL exceeds maximum size"));
        }
        if buf.remaining() < ACL_HEADER_LEN {
            return Err(Error::invalid("truncated ACL header"));
        }
        let version = buf.get_u16_le();
        let _reserved = buf.get_u16_le();
        let ace_bytes = buf.get_u32_le() as usize;
        if buf.remaining() != ace_bytes {
            return Err(Error::invalid(format!(
                "ACL length mismatch: header says {ace_bytes}, have {}",
                buf.remaining()
            )));
        }

        let mut aces = Vec::new();
        while buf.has_remaining() {
            if buf.remaining() < ACE_HEADER_LEN {
                return Err(Error::invalid("truncated ACE header"));
            }
            let principal_type = PrincipalType::from_u8(buf.get_u8())?;
            let access_types = buf.get_u8();
            let flags = buf.get_u16_le();
            let principal_len = buf.get_u32_le() as usize;
            let allow_perms = buf.get_u64_le();
            if buf.remaining() < principal_len {
                return Err(Error::invalid("truncated ACE principal"));
            }
            let principal = String::from_utf8(buf[..principal_len].to_vec())
                .map_err(|_| Error::invalid("ACE principal is not UTF-8"))?;
            buf.advance(principal_len);
            aces.push(Ace {
                principal_type,
                principal,
                access_types,
                flags,
                allow_perms,
            });
        }
        Ok(Self { version, aces })
    }
}

/// Fixed-capacity ACL storage embedded in a flat property record
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclSlot(Vec<u8>);

impl AclSlot {
    /// Replace the slot contents with an encoded ACL
    pub fn store(&mut self, encoded: &[u8]) -> Result<()> {
        if encoded.len() > ACL_MAX_SIZE {
            return Err(Error::invalid("ACL exceeds slot capacity"));
        }
        self.0.clear();
        self.0.extend_from_slice(encoded);
        Ok(())
    }

    /// Encoded ACL bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Version field of the stored ACL (0 when empty)
    #[must_use]
    pub fn version(&self) -> u16 {
        match self.0.as_slice() {
            [lo, hi, ..] => u16::from_le_bytes([*lo, *hi]),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_acl() -> Acl {
        Acl::new(vec![
            Ace::owner(PERMS_MASK),
            Ace::user("alice@lab", PERM_READ | PERM_WRITE),
            Ace::group("ops@lab", PERM_READ | PERM_GET_PROP),
            Ace::everyone(PERM_READ),
        ])
    }

    #[test]
    fn test_acl_encode_decode() {
        let acl = sample_acl();
        let bytes = acl.to_bytes().unwrap();
        assert_eq!(bytes.len(), acl.encoded_len());
        let decoded = Acl::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, acl);
        decoded.validate().unwrap();
    }

    #[test]
    fn test_acl_truncated() {
        let bytes = sample_acl().to_bytes().unwrap();
        assert!(matches!(
            Acl::from_bytes(&bytes[..bytes.len() - 1]),
            Err(Error::Invalid(_))
        ));
        assert!(matches!(Acl::from_bytes(&bytes[..4]), Err(Error::Invalid(_))));
    }

    #[test]
    fn test_acl_validate_rejects_bad_entries() {
        let unnamed = Acl::new(vec![Ace::user("alice", PERM_READ)]);
        assert!(unnamed.validate().is_err());

        let dup = Acl::new(vec![Ace::everyone(PERM_READ), Ace::everyone(PERM_WRITE)]);
        assert!(dup.validate().is_err());

        let mut bad_perms = Ace::everyone(PERM_READ);
        bad_perms.allow_perms = 1 << 40;
        assert!(Acl::new(vec![bad_perms]).validate().is_err());

        let mut no_access = Ace::owner(PERM_READ);
        no_access.access_types = 0;
        assert!(Acl::new(vec![no_access]).validate().is_err());

        let old = Acl {
            version: 7,
            aces: Vec::new(),
        };
        assert!(old.validate().is_err());
    }

    #[test]
    fn test_slot_version() {
        let mut slot = AclSlot::default();
        assert_eq!(slot.version(), 0);
        slot.store(&sample_acl().to_bytes().unwrap()).unwrap();
        assert_eq!(slot.version(), ACL_VERSION);
        assert!(slot.store(&vec![0u8; ACL_MAX_SIZE + 1]).is_err());
    }
}
