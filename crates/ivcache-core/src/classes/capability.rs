//! Handle capabilities
//!
//! Applying a capability opens the container incarnation on the node;
//! dropping it closes the incarnation. The host call runs before the record
//! commits, so a conflicting open leaves the cache untouched.

use super::expect_class;
use crate::authority::Authority;
use crate::host::ContainerHost;
use crate::iv::{ClassCtx, IvClass, IvKey, UpdateOutcome};
use crate::record::{Capability, IvValue};
use async_trait::async_trait;
use ivcache_common::{ClassId, Error, Result, SyncMode};
use std::sync::Arc;

pub struct CapabilityClass {
    authority: Arc<dyn Authority>,
    host: Arc<dyn ContainerHost>,
}

impl CapabilityClass {
    pub fn new(authority: Arc<dyn Authority>, host: Arc<dyn ContainerHost>) -> Self {
        Self { authority, host }
    }

    fn apply(&self, key: &IvKey, slot: &mut Option<IvValue>, value: IvValue) -> Result<IvValue> {
        let capability = value.into_capability()?;
        self.host.open(key.handle_id(), &capability)?;
        *slot = Some(IvValue::Capability(capability));
        Ok(IvValue::Capability(capability))
    }
}

#[async_trait]
impl IvClass for CapabilityClass {
    fn class_id(&self) -> ClassId {
        ClassId::Capability
    }

    fn sync_mode(&self, _value: &IvValue) -> SyncMode {
        SyncMode::Eager
    }

    async fn fetch_root(&self, key: &IvKey) -> Result<IvValue> {
        let handle = key.handle_id();
        let record = self
            .authority
            .handle(handle)
            .await?
            .ok_or_else(|| Error::not_found(format!("handle {handle}")))?;
        let status_pm_ver = self.authority.status_pm_ver(record.container).await?;

        Ok(IvValue::Capability(Capability {
            container: record.container,
            flags: record.flags,
            sec_capas: record.sec_capas,
            status_pm_ver,
        }))
    }

    fn update(
        &self,
        ctx: &ClassCtx,
        key: &IvKey,
        slot: &mut Option<IvValue>,
        value: IvValue,
    ) -> Result<UpdateOutcome> {
        expect_class(&value, ClassId::Capability)?;
        if !ctx.is_root {
            return Ok(UpdateOutcome::Forward(value));
        }
        self.apply(key, slot, value).map(UpdateOutcome::Applied)
    }

    fn refresh(
        &self,
        _ctx: &ClassCtx,
        key: &IvKey,
        slot: &mut Option<IvValue>,
        answer: IvValue,
        _pending: Option<&IvValue>,
    ) -> Result<IvValue> {
        self.apply(key, slot, answer)
    }

    fn invalidate(&self, key: &IvKey, _value: IvValue) -> Result<()> {
        self.host.close(key.handle_id())
    }
}
