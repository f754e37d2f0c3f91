//! Container properties
//!
//! Sparse and flat property representations, flat ACL encoding, and the
//! conversions between them.

mod acl;
mod marshal;
mod types;

pub use acl::{
    ACCESS_ALARM, ACCESS_ALLOW, ACCESS_AUDIT, ACL_MAX_SIZE, ACL_VERSION, Ace, Acl, AclSlot,
    PERM_DEL_CONT, PERM_GET_ACL, PERM_GET_PROP, PERM_READ, PERM_SET_ACL, PERM_SET_OWNER,
    PERM_SET_PROP, PERM_WRITE, PrincipalType,
};
pub use marshal::{g2l, l2g};
pub use types::{
    ContHealth, ContStatus, LABEL_MAX_LEN, Oid, PRINCIPAL_MAX_LEN, Prop, PropType, PropertyRecord,
    PropertySet,
};
