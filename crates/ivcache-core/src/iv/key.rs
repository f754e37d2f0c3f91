//! Entry keys and invalidation filters

use ivcache_common::{ClassId, ContainerId, HandleId};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Key of a cached record
///
/// Capability records are keyed by handle id; every other class by
/// container id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IvKey {
    pub id: Uuid,
    pub class: ClassId,
}

impl IvKey {
    /// Key of a container-scoped record
    #[must_use]
    pub const fn container(container: ContainerId, class: ClassId) -> Self {
        Self {
            id: container.as_uuid(),
            class,
        }
    }

    /// Key of a handle capability
    #[must_use]
    pub const fn handle(handle: HandleId) -> Self {
        Self {
            id: handle.as_uuid(),
            class: ClassId::Capability,
        }
    }

    #[must_use]
    pub const fn container_id(&self) -> ContainerId {
        ContainerId::from_uuid(self.id)
    }

    #[must_use]
    pub const fn handle_id(&self) -> HandleId {
        HandleId::from_uuid(self.id)
    }
}

impl fmt::Debug for IvKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IvKey({}/{})", self.id, self.class)
    }
}

impl fmt::Display for IvKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.id, self.class)
    }
}

/// Selects records for invalidation; `None` fields match anything
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyFilter {
    pub id: Option<Uuid>,
    pub class: Option<ClassId>,
}

impl KeyFilter {
    /// Exactly one key
    #[must_use]
    pub const fn key(key: IvKey) -> Self {
        Self {
            id: Some(key.id),
            class: Some(key.class),
        }
    }

    /// Every record of `class`
    #[must_use]
    pub const fn class(class: ClassId) -> Self {
        Self {
            id: None,
            class: Some(class),
        }
    }

    #[must_use]
    pub fn matches(&self, key: &IvKey) -> bool {
        self.id.is_none_or(|id| id == key.id) && self.class.is_none_or(|class| class == key.class)
    }
}
