//! Class plugins
//!
//! One [`IvClass`](crate::iv::IvClass) per metadata class. Each plugin owns
//! the authority and host handles its hooks need.

mod agg_epoch;
mod capability;
mod oid;
mod property;
mod snapshot;

pub use agg_epoch::{AggEpochClass, EpochTracker};
pub use capability::CapabilityClass;
pub use oid::{OidRangeClass, ReserveLocks, ask_for};
pub use property::PropertyClass;
pub use snapshot::SnapshotClass;

use crate::authority::Authority;
use crate::host::ContainerHost;
use crate::iv::ClassRegistry;
use crate::record::IvValue;
use ivcache_common::config::CacheConfig;
use ivcache_common::{ClassId, Error, Result};
use std::sync::Arc;

/// Registry with every class a node serves
pub fn registry(
    authority: &Arc<dyn Authority>,
    host: &Arc<dyn ContainerHost>,
    tracker: Arc<EpochTracker>,
    config: &CacheConfig,
) -> ClassRegistry {
    let mut classes = ClassRegistry::new();
    classes.register(Arc::new(CapabilityClass::new(
        Arc::clone(authority),
        Arc::clone(host),
    )));
    classes.register(Arc::new(PropertyClass::new(Arc::clone(authority))));
    classes.register(Arc::new(SnapshotClass::new(Arc::clone(authority))));
    classes.register(Arc::new(AggEpochClass::new(tracker, Arc::clone(host))));
    classes.register(Arc::new(OidRangeClass::new(
        Arc::clone(authority),
        config.oid_block_unit,
    )));
    classes
}

fn expect_class(value: &IvValue, class: ClassId) -> Result<()> {
    if value.class() == class {
        Ok(())
    } else {
        Err(Error::invalid(format!(
            "expected {class} record, got {}",
            value.class()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::MemoryAuthority;
    use crate::host::LocalHost;
    use ivcache_common::Rank;

    #[test]
    fn test_registry_covers_every_class() {
        let authority: Arc<dyn Authority> = Arc::new(MemoryAuthority::new());
        let host: Arc<dyn ContainerHost> = Arc::new(LocalHost::new(Rank(0)));
        let classes = registry(
            &authority,
            &host,
            Arc::new(EpochTracker::default()),
            &CacheConfig::default(),
        );
        assert_eq!(classes.len(), ClassId::ALL.len());
        for id in ClassId::ALL {
            assert_eq!(classes.get(id).unwrap().class_id(), id);
        }
    }
}
