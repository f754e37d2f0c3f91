//! Class plugin interface
//!
//! Every metadata class plugs its hooks into the node actor through
//! [`IvClass`]. Synchronous hooks run inside the actor and receive the
//! entry slot by `&mut`; the actor commits the slot back to the store only
//! when the hook returns `Ok`, so a failed side effect leaves the record as
//! it was. Asynchronous hooks run on the root, in spawned tasks, against the
//! authority.

use super::key::IvKey;
use crate::record::IvValue;
use async_trait::async_trait;
use ivcache_common::{ClassId, Error, Rank, Result, SyncMode};
use std::collections::HashMap;
use std::sync::Arc;

/// Where a hook is running
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClassCtx {
    pub rank: Rank,
    pub is_root: bool,
}

/// Caller-side shape of a fetch
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FetchRequest {
    /// Maximum number of list entries the caller can take
    pub capacity: Option<u32>,
}

impl FetchRequest {
    #[must_use]
    pub const fn with_capacity(capacity: u32) -> Self {
        Self {
            capacity: Some(capacity),
        }
    }
}

/// Result of applying an update locally
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Applied here; the value is the answer to the caller
    Applied(IvValue),
    /// Cannot be satisfied here; send this value to the root
    Forward(IvValue),
}

#[async_trait]
pub trait IvClass: Send + Sync + 'static {
    fn class_id(&self) -> ClassId;

    /// How a value applied at the root propagates
    fn sync_mode(&self, value: &IvValue) -> SyncMode;

    /// Value for a fresh record that updates may start from
    fn init(&self, _key: &IvKey) -> Option<IvValue> {
        None
    }

    /// Resolve a miss at the root
    async fn fetch_root(&self, key: &IvKey) -> Result<IvValue>;

    /// Authority side of a forwarded update
    async fn update_root(&self, _key: &IvKey, value: IvValue) -> Result<IvValue> {
        Ok(value)
    }

    /// Shape a cached value for one caller
    fn merge(&self, value: &IvValue, _request: &FetchRequest) -> Result<IvValue> {
        Ok(value.clone())
    }

    /// Apply a caller's update
    fn update(
        &self,
        ctx: &ClassCtx,
        key: &IvKey,
        slot: &mut Option<IvValue>,
        value: IvValue,
    ) -> Result<UpdateOutcome>;

    /// Apply a fetched, forwarded or pushed answer
    ///
    /// `pending` carries the caller's original update when the answer
    /// completes a forward.
    fn refresh(
        &self,
        ctx: &ClassCtx,
        key: &IvKey,
        slot: &mut Option<IvValue>,
        answer: IvValue,
        pending: Option<&IvValue>,
    ) -> Result<IvValue>;

    /// Teardown for a removed record
    fn invalidate(&self, _key: &IvKey, _value: IvValue) -> Result<()> {
        Ok(())
    }
}

/// The classes a node serves
#[derive(Clone, Default)]
pub struct ClassRegistry {
    classes: HashMap<ClassId, Arc<dyn IvClass>>,
}

impl ClassRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a class, replacing any earlier plugin for the same id
    pub fn register(&mut self, class: Arc<dyn IvClass>) {
        self.classes.insert(class.class_id(), class);
    }

    pub fn get(&self, id: ClassId) -> Result<&Arc<dyn IvClass>> {
        self.classes
            .get(&id)
            .ok_or_else(|| Error::internal(format!("class {id} is not registered")))
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}
