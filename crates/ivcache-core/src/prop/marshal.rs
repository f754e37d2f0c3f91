//! Sparse ⇄ flat property conversion
//!
//! `l2g` flattens an authority-side [`PropertySet`] into the cached
//! [`PropertyRecord`]; `g2l` expands a record back, emitting entries in
//! [`PropType::ALL`] order. A field must be read back from the same bit it
//! was stored under.

use super::acl::Acl;
use super::types::{
    LABEL_MAX_LEN, PRINCIPAL_MAX_LEN, Prop, PropType, PropertyRecord, PropertySet,
};
use ivcache_common::{Error, Result};

/// Flatten a sparse property set
pub fn l2g(set: &PropertySet) -> Result<PropertyRecord> {
    let mut record = PropertyRecord::default();

    for prop in set {
        let ty = prop.prop_type();
        if record.has(ty) {
            return Err(Error::invalid(format!("duplicate property {ty:?}")));
        }
        match prop {
            Prop::Label(v) => record.label = bounded(v, LABEL_MAX_LEN, ty)?,
            Prop::LayoutType(v) => record.layout_type = *v,
            Prop::LayoutVer(v) => record.layout_ver = *v,
            Prop::Csum(v) => record.csum = *v,
            Prop::CsumChunkSize(v) => record.csum_chunk_size = *v,
            Prop::CsumServerVerify(v) => record.csum_server_verify = *v,
            Prop::Dedup(v) => record.dedup = *v,
            Prop::DedupThreshold(v) => record.dedup_threshold = *v,
            Prop::RedunFac(v) => record.redun_fac = *v,
            Prop::RedunLvl(v) => record.redun_lvl = *v,
            Prop::SnapshotMax(v) => record.snapshot_max = *v,
            Prop::Compress(v) => record.compress = *v,
            Prop::Encrypt(v) => record.encrypt = *v,
            Prop::Acl(acl) => record.acl.store(&acl.to_bytes()?)?,
            Prop::Owner(v) => record.owner = bounded(v, PRINCIPAL_MAX_LEN, ty)?,
            Prop::OwnerGroup(v) => record.owner_group = bounded(v, PRINCIPAL_MAX_LEN, ty)?,
            Prop::RootOids(v) => record.root_oids = *v,
            Prop::Status(v) => record.status = *v,
            Prop::GlobalVersion(v) => record.global_version = *v,
            Prop::ObjVersion(v) => record.obj_version = *v,
        }
        record.valid |= ty.bit();
    }

    Ok(record)
}

/// Expand a flat record into a sparse set in canonical order
pub fn g2l(record: &PropertyRecord) -> Result<PropertySet> {
    let unknown = record.valid & !PropType::KNOWN_MASK;
    if unknown != 0 {
        return Err(Error::invalid(format!("unknown property bits {unknown:#x}")));
    }

    let mut set = PropertySet::with_capacity(record.valid.count_ones() as usize);
    for ty in PropType::ALL {
        if !record.has(ty) {
            continue;
        }
        let prop = match ty {
            PropType::Label => Prop::Label(bounded(&record.label, LABEL_MAX_LEN, ty)?),
            PropType::LayoutType => Prop::LayoutType(record.layout_type),
            PropType::LayoutVer => Prop::LayoutVer(record.layout_ver),
            PropType::Csum => Prop::Csum(record.csum),
            PropType::CsumChunkSize => Prop::CsumChunkSize(record.csum_chunk_size),
            PropType::CsumServerVerify => Prop::CsumServerVerify(record.csum_server_verify),
            PropType::Dedup => Prop::Dedup(record.dedup),
            PropType::DedupThreshold => Prop::DedupThreshold(record.dedup_threshold),
            PropType::RedunFac => Prop::RedunFac(record.redun_fac),
            PropType::RedunLvl => Prop::RedunLvl(record.redun_lvl),
            PropType::SnapshotMax => Prop::SnapshotMax(record.snapshot_max),
            PropType::Compress => Prop::Compress(record.compress),
            PropType::Encrypt => Prop::Encrypt(record.encrypt),
            PropType::Acl => Prop::Acl(decode_acl(record)?),
            PropType::Owner => Prop::Owner(bounded(&record.owner, PRINCIPAL_MAX_LEN, ty)?),
            PropType::OwnerGroup => {
                Prop::OwnerGroup(bounded(&record.owner_group, PRINCIPAL_MAX_LEN, ty)?)
            }
            PropType::RootOids => Prop::RootOids(record.root_oids),
            PropType::Status => Prop::Status(record.status),
            PropType::GlobalVersion => Prop::GlobalVersion(record.global_version),
            PropType::ObjVersion => Prop::ObjVersion(record.obj_version),
        };
        set.push(prop);
    }

    Ok(set)
}

fn bounded(value: &str, max: usize, ty: PropType) -> Result<String> {
    if value.len() > max {
        return Err(Error::invalid(format!(
            "{ty:?} is {} bytes, limit is {max}",
            value.len()
        )));
    }
    Ok(value.to_owned())
}

fn decode_acl(record: &PropertyRecord) -> Result<Acl> {
    if record.acl.version() == 0 {
        return Ok(Acl::default());
    }
    let acl = Acl::from_bytes(record.acl.as_bytes())?;
    acl.validate()?;
    Ok(acl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prop::acl::{Ace, PERM_GET_PROP, PERM_READ, PERM_WRITE};
    use crate::prop::types::{ContHealth, ContStatus, Oid};

    fn full_set() -> PropertySet {
        PropertySet::from(vec![
            Prop::Label("scratch".into()),
            Prop::LayoutType(2),
            Prop::LayoutVer(1),
            Prop::Csum(3),
            Prop::CsumChunkSize(32 * 1024),
            Prop::CsumServerVerify(true),
            Prop::Dedup(1),
            Prop::DedupThreshold(4096),
            Prop::RedunFac(2),
            Prop::RedunLvl(1),
            Prop::SnapshotMax(16),
            Prop::Compress(1),
            Prop::Encrypt(0),
            Prop::Acl(Acl::new(vec![
                Ace::owner(PERM_READ | PERM_WRITE),
                Ace::user("bob@lab", PERM_READ | PERM_GET_PROP),
            ])),
            Prop::Owner("bob@lab".into()),
            Prop::OwnerGroup("staff@lab".into()),
            Prop::RootOids([
                Oid { hi: 1, lo: 2 },
                Oid { hi: 3, lo: 4 },
                Oid::default(),
                Oid { hi: u64::MAX, lo: 0 },
            ]),
            Prop::Status(ContStatus {
                health: ContHealth::Unclean,
                generation: 9,
            }),
            Prop::GlobalVersion(2),
            Prop::ObjVersion(1),
        ])
    }

    #[test]
    fn test_roundtrip_full() {
        let set = full_set();
        let record = l2g(&set).unwrap();
        assert_eq!(record.valid, PropType::KNOWN_MASK);
        assert_eq!(g2l(&record).unwrap(), set);
    }

    #[test]
    fn test_roundtrip_sparse() {
        let set = PropertySet::from(vec![
            Prop::Label("l".into()),
            Prop::RedunLvl(2),
            Prop::Acl(Acl::new(vec![Ace::everyone(PERM_READ)])),
            Prop::ObjVersion(3),
        ]);
        let record = l2g(&set).unwrap();
        assert_eq!(record.valid.count_ones(), 4);
        assert!(!record.has(PropType::Owner));
        assert_eq!(g2l(&record).unwrap(), set);
    }

    #[test]
    fn test_l2g_rejects_long_label() {
        let set = PropertySet::from(vec![Prop::Label("x".repeat(LABEL_MAX_LEN + 1))]);
        assert!(matches!(l2g(&set), Err(Error::Invalid(_))));

        let ok = PropertySet::from(vec![Prop::Label("x".repeat(LABEL_MAX_LEN))]);
        assert!(l2g(&ok).is_ok());
    }

    #[test]
    fn test_l2g_rejects_duplicates() {
        let set = PropertySet::from(vec![Prop::Csum(1), Prop::Csum(2)]);
        assert!(matches!(l2g(&set), Err(Error::Invalid(_))));
    }

    #[test]
    fn test_g2l_rejects_unknown_bit() {
        let record = PropertyRecord {
            valid: 1 << 25,
            ..PropertyRecord::default()
        };
        assert!(matches!(g2l(&record), Err(Error::Invalid(_))));
    }

    #[test]
    fn test_g2l_rejects_invalid_acl() {
        let bad = Acl::new(vec![Ace::user("no-domain", PERM_READ)]);
        let mut record = PropertyRecord::default();
        record.acl.store(&bad.to_bytes().unwrap()).unwrap();
        record.valid = PropType::Acl.bit() | PropType::Label.bit();
        assert!(matches!(g2l(&record), Err(Error::Invalid(_))));
    }

    #[test]
    fn test_g2l_zero_version_acl_is_empty() {
        let record = PropertyRecord {
            valid: PropType::Acl.bit(),
            ..PropertyRecord::default()
        };
        let set = g2l(&record).unwrap();
        assert_eq!(set.get(PropType::Acl), Some(&Prop::Acl(Acl::default())));
    }
}
