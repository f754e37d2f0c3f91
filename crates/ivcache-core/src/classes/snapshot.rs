//! Snapshot lists
//!
//! The cache always holds the complete list. A caller's capacity only matters
//! when the reply is shaped: a list longer than the capacity is refused with
//! the count it needs, never truncated.

use super::expect_class;
use crate::authority::Authority;
use crate::iv::{ClassCtx, FetchRequest, IvClass, IvKey, UpdateOutcome};
use crate::record::{IvValue, SnapshotList};
use async_trait::async_trait;
use ivcache_common::{ClassId, Error, Result, SyncMode};
use std::sync::Arc;

pub struct SnapshotClass {
    authority: Arc<dyn Authority>,
}

impl SnapshotClass {
    pub fn new(authority: Arc<dyn Authority>) -> Self {
        Self { authority }
    }

    fn store(slot: &mut Option<IvValue>, value: IvValue) -> Result<IvValue> {
        let list = SnapshotList::new(value.into_snapshots()?.into_epochs());
        let value = IvValue::Snapshots(list);
        *slot = Some(value.clone());
        Ok(value)
    }
}

#[async_trait]
impl IvClass for SnapshotClass {
    fn class_id(&self) -> ClassId {
        ClassId::Snapshots
    }

    fn sync_mode(&self, _value: &IvValue) -> SyncMode {
        SyncMode::Eager
    }

    async fn fetch_root(&self, key: &IvKey) -> Result<IvValue> {
        let epochs = self.authority.snapshots(key.container_id()).await?;
        Ok(IvValue::Snapshots(SnapshotList::new(epochs)))
    }

    fn merge(&self, value: &IvValue, request: &FetchRequest) -> Result<IvValue> {
        let IvValue::Snapshots(list) = value else {
            return Err(Error::invalid(format!(
                "expected snapshots record, got {}",
                value.class()
            )));
        };
        if let Some(capacity) = request.capacity {
            let required = list.count()?;
            if required > capacity {
                return Err(Error::Oversized { required });
            }
        }
        Ok(value.clone())
    }

    fn update(
        &self,
        ctx: &ClassCtx,
        _key: &IvKey,
        slot: &mut Option<IvValue>,
        value: IvValue,
    ) -> Result<UpdateOutcome> {
        expect_class(&value, ClassId::Snapshots)?;
        if !ctx.is_root {
            return Ok(UpdateOutcome::Forward(value));
        }
        Self::store(slot, value).map(UpdateOutcome::Applied)
    }

    fn refresh(
        &self,
        _ctx: &ClassCtx,
        _key: &IvKey,
        slot: &mut Option<IvValue>,
        answer: IvValue,
        _pending: Option<&IvValue>,
    ) -> Result<IvValue> {
        Self::store(slot, answer)
    }
}
