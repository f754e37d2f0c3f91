//! Container properties
//!
//! Cached in flat form. Updates are write-through: every node forwards to the
//! root, which merges the entries into the authority and answers with the
//! full merged record.

use super::expect_class;
use crate::authority::Authority;
use crate::iv::{ClassCtx, IvClass, IvKey, UpdateOutcome};
use crate::prop::{g2l, l2g};
use crate::record::IvValue;
use async_trait::async_trait;
use ivcache_common::{ClassId, Result, SyncMode};
use std::sync::Arc;
use tracing::debug;

pub struct PropertyClass {
    authority: Arc<dyn Authority>,
}

impl PropertyClass {
    pub fn new(authority: Arc<dyn Authority>) -> Self {
        Self { authority }
    }
}

#[async_trait]
impl IvClass for PropertyClass {
    fn class_id(&self) -> ClassId {
        ClassId::Property
    }

    fn sync_mode(&self, _value: &IvValue) -> SyncMode {
        SyncMode::Eager
    }

    async fn fetch_root(&self, key: &IvKey) -> Result<IvValue> {
        let set = self.authority.properties(key.container_id()).await?;
        Ok(l2g(&set)?.into())
    }

    async fn update_root(&self, key: &IvKey, value: IvValue) -> Result<IvValue> {
        let changes = g2l(&value.into_property()?)?;
        debug!(
            "merging {} properties into {}",
            changes.len(),
            key.container_id()
        );
        let merged = self
            .authority
            .merge_properties(key.container_id(), changes)
            .await?;
        Ok(l2g(&merged)?.into())
    }

    fn update(
        &self,
        _ctx: &ClassCtx,
        _key: &IvKey,
        _slot: &mut Option<IvValue>,
        value: IvValue,
    ) -> Result<UpdateOutcome> {
        expect_class(&value, ClassId::Property)?;
        Ok(UpdateOutcome::Forward(value))
    }

    fn refresh(
        &self,
        _ctx: &ClassCtx,
        _key: &IvKey,
        slot: &mut Option<IvValue>,
        answer: IvValue,
        _pending: Option<&IvValue>,
    ) -> Result<IvValue> {
        expect_class(&answer, ClassId::Property)?;
        *slot = Some(answer.clone());
        Ok(answer)
    }
}
