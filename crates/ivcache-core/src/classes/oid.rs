//! Object id ranges
//!
//! Every non-root node holds a range of ids it can hand out without asking
//! anyone. When the held range is too small the node asks the root for a
//! batch sized by [`ask_for`], absorbs the grant and carves the request off
//! its front. The root itself serves each request straight from the
//! authority's counter.
//!
//! Reservations for one container on one node are serialized by
//! [`ReserveLocks`] for the whole round trip, so only one forward per
//! container is ever in flight from a node.

use super::expect_class;
use crate::authority::Authority;
use crate::iv::{ClassCtx, IvClass, IvKey, UpdateOutcome};
use crate::record::{IvValue, OidRange};
use async_trait::async_trait;
use ivcache_common::{ClassId, ContainerId, Error, Result, SyncMode};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

/// Batch size a node asks the root for when `count` ids are short
///
/// Small requests get one block unit; larger ones get twice the request
/// rounded up to the unit.
pub fn ask_for(count: u64, unit: u64) -> Result<u64> {
    if unit == 0 {
        return Err(Error::invalid("object id block unit must be non-zero"));
    }
    if count < unit {
        return Ok(unit);
    }
    count
        .div_ceil(unit)
        .checked_mul(unit)
        .and_then(|rounded| rounded.checked_mul(2))
        .ok_or_else(|| Error::invalid(format!("cannot ask for a batch covering {count} ids")))
}

/// Per-container reservation locks
///
/// An entry lives only while some caller holds or waits on it.
#[derive(Debug, Default)]
pub struct ReserveLocks {
    locks: Mutex<HashMap<ContainerId, Arc<AsyncMutex<()>>>>,
}

impl ReserveLocks {
    pub async fn lock(&self, container: ContainerId) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.locks.lock().entry(container).or_default());
        lock.lock_owned().await
    }

    /// Forget the container's lock if nobody else references it; call after
    /// dropping the guard
    pub fn release(&self, container: ContainerId) {
        let mut locks = self.locks.lock();
        if locks
            .get(&container)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&container);
        }
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct OidRangeClass {
    authority: Arc<dyn Authority>,
    block_unit: u64,
}

impl OidRangeClass {
    pub fn new(authority: Arc<dyn Authority>, block_unit: u64) -> Self {
        Self {
            authority,
            block_unit,
        }
    }
}

fn held(slot: &Option<IvValue>) -> Result<OidRange> {
    match slot {
        Some(value) => value.clone().into_oid_range(),
        None => Ok(OidRange::default()),
    }
}

#[async_trait]
impl IvClass for OidRangeClass {
    fn class_id(&self) -> ClassId {
        ClassId::OidRange
    }

    fn sync_mode(&self, _value: &IvValue) -> SyncMode {
        SyncMode::None
    }

    fn init(&self, _key: &IvKey) -> Option<IvValue> {
        Some(IvValue::OidRange(OidRange::default()))
    }

    async fn fetch_root(&self, key: &IvKey) -> Result<IvValue> {
        Err(Error::invalid(format!(
            "object id ranges of {} are reserved, not fetched",
            key.container_id()
        )))
    }

    async fn update_root(&self, key: &IvKey, value: IvValue) -> Result<IvValue> {
        let request = value.into_oid_range()?;
        let base = self
            .authority
            .fetch_add_oid(key.container_id(), request.count)
            .await?;
        Ok(IvValue::OidRange(OidRange::new(base, request.count)))
    }

    fn update(
        &self,
        ctx: &ClassCtx,
        key: &IvKey,
        slot: &mut Option<IvValue>,
        value: IvValue,
    ) -> Result<UpdateOutcome> {
        expect_class(&value, ClassId::OidRange)?;
        let request = value.into_oid_range()?;
        if request.is_empty() {
            return Err(Error::invalid("cannot reserve zero object ids"));
        }
        if ctx.is_root {
            return Ok(UpdateOutcome::Forward(IvValue::OidRange(request)));
        }

        let mut range = held(slot)?;
        if let Some(carved) = range.carve(request.count) {
            *slot = Some(IvValue::OidRange(range));
            return Ok(UpdateOutcome::Applied(IvValue::OidRange(carved)));
        }

        let ask = ask_for(request.count, self.block_unit)?;
        debug!(
            "{}: {} ids left for {}, asking root for {}",
            ctx.rank,
            range.count,
            key.container_id(),
            ask
        );
        Ok(UpdateOutcome::Forward(IvValue::OidRange(OidRange::request(
            ask,
        ))))
    }

    fn refresh(
        &self,
        ctx: &ClassCtx,
        _key: &IvKey,
        slot: &mut Option<IvValue>,
        answer: IvValue,
        pending: Option<&IvValue>,
    ) -> Result<IvValue> {
        let granted = answer.into_oid_range()?;
        let Some(pending) = pending else {
            return Err(Error::invalid("object id range arrived without a request"));
        };
        if ctx.is_root {
            return Ok(IvValue::OidRange(granted));
        }

        let wanted = pending.clone().into_oid_range()?.count;
        let mut range = held(slot)?;
        range.absorb(granted)?;
        let carved = range.carve(wanted).ok_or_else(|| {
            Error::internal(format!(
                "grant of {} ids cannot cover a request for {wanted}",
                granted.count
            ))
        })?;
        *slot = Some(IvValue::OidRange(range));
        Ok(IvValue::OidRange(carved))
    }
}
