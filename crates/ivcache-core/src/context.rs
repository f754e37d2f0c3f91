//! Node context
//!
//! The API a storage node uses: one node actor with every class registered,
//! the per-container reservation locks and the aggregation tracker the root
//! computes boundaries from.

use crate::authority::Authority;
use crate::classes::{self, EpochTracker, ReserveLocks};
use crate::host::ContainerHost;
use crate::iv::{Fabric, FetchRequest, IvKey, KeyFilter, NodeHandle, StatsSnapshot};
use crate::prop::{PropertySet, g2l, l2g};
use crate::record::{AggEpoch, Capability, IvValue, OidRange, SnapshotList};
use ivcache_common::config::CacheConfig;
use ivcache_common::{ClassId, ContainerId, Epoch, Error, HandleId, Rank, Result, SyncMode};
use std::sync::Arc;
use tracing::debug;

/// Outcome of a capacity-bounded snapshot fetch
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SnapshotFetch {
    /// Complete list, ascending
    Epochs(Vec<Epoch>),
    /// The list holds this many epochs; retry with at least this capacity
    NeedsCapacity(u32),
}

pub struct NodeContext {
    node: NodeHandle,
    tracker: Arc<EpochTracker>,
    reserve_locks: ReserveLocks,
    config: CacheConfig,
}

impl NodeContext {
    /// Start the node actor for `rank`
    pub fn start(
        rank: Rank,
        config: &CacheConfig,
        authority: &Arc<dyn Authority>,
        host: &Arc<dyn ContainerHost>,
        fabric: Arc<dyn Fabric>,
    ) -> Self {
        let tracker = Arc::new(EpochTracker::default());
        let registry = classes::registry(authority, host, Arc::clone(&tracker), config);
        let node = NodeHandle::spawn(rank, registry, fabric, config.mailbox_depth);
        Self {
            node,
            tracker,
            reserve_locks: ReserveLocks::default(),
            config: config.clone(),
        }
    }

    #[must_use]
    pub const fn node(&self) -> &NodeHandle {
        &self.node
    }

    #[must_use]
    pub const fn rank(&self) -> Rank {
        self.node.rank()
    }

    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.node.is_root()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.node.stats()
    }

    /// Reserve `count` object ids in `container`
    pub async fn reserve(&self, container: ContainerId, count: u64) -> Result<OidRange> {
        if count == 0 {
            return Err(Error::invalid("cannot reserve zero object ids"));
        }
        let guard = self.reserve_locks.lock(container).await;
        let key = IvKey::container(container, ClassId::OidRange);
        let reserved = self
            .node
            .update(key, IvValue::OidRange(OidRange::request(count)))
            .await;
        drop(guard);
        self.reserve_locks.release(container);

        let range = reserved?.into_oid_range()?;
        debug!(
            "{}: reserved [{}, +{}) in {}",
            self.rank(),
            range.base,
            range.count,
            container
        );
        Ok(range)
    }

    /// Snapshot list if it fits in `capacity`
    pub async fn fetch_snapshots(
        &self,
        container: ContainerId,
        capacity: u32,
    ) -> Result<SnapshotFetch> {
        let key = IvKey::container(container, ClassId::Snapshots);
        match self
            .node
            .fetch(key, FetchRequest::with_capacity(capacity))
            .await
        {
            Ok(value) => Ok(SnapshotFetch::Epochs(value.into_snapshots()?.into_epochs())),
            Err(Error::Oversized { required }) => Ok(SnapshotFetch::NeedsCapacity(required)),
            Err(e) => Err(e),
        }
    }

    /// Complete snapshot list, growing the capacity as the list requires
    pub async fn snapshots(&self, container: ContainerId) -> Result<Vec<Epoch>> {
        let rounds = self.config.snapshot_fetch_rounds.max(1);
        let mut capacity = self.config.snapshot_initial_capacity;
        for round in 1..=rounds {
            match self.fetch_snapshots(container, capacity).await? {
                SnapshotFetch::Epochs(epochs) => return Ok(epochs),
                SnapshotFetch::NeedsCapacity(required) => {
                    debug!(
                        round,
                        "snapshot list of {} needs {} entries, had room for {}",
                        container,
                        required,
                        capacity
                    );
                    capacity = required;
                }
            }
        }
        Err(Error::unavailable(format!(
            "snapshot list of {container} still growing after {rounds} rounds"
        )))
    }

    /// Replace the snapshot list on every node
    pub async fn update_snapshots(&self, container: ContainerId, epochs: Vec<Epoch>) -> Result<()> {
        let key = IvKey::container(container, ClassId::Snapshots);
        self.node
            .update(key, IvValue::Snapshots(SnapshotList::new(epochs)))
            .await?;
        Ok(())
    }

    /// Drop the cached list and read it again from upstream
    ///
    /// On the root the list re-read from the authority is pushed to every
    /// node before returning.
    pub async fn refresh_snapshots(&self, container: ContainerId) -> Result<Vec<Epoch>> {
        let key = IvKey::container(container, ClassId::Snapshots);
        self.node.invalidate(KeyFilter::key(key), SyncMode::None).await?;
        let value = self.node.fetch(key, FetchRequest::default()).await?;
        let value = if self.is_root() {
            self.node.update(key, value).await?
        } else {
            value
        };
        Ok(value.into_snapshots()?.into_epochs())
    }

    /// Properties of `container` whose type bit is set in `types`
    pub async fn fetch_property(&self, container: ContainerId, types: u32) -> Result<PropertySet> {
        let key = IvKey::container(container, ClassId::Property);
        let record = self
            .node
            .fetch(key, FetchRequest::default())
            .await?
            .into_property()?;
        Ok(g2l(&record)?.filter(types))
    }

    /// Set properties through the root, returning the full merged set
    pub async fn update_property(
        &self,
        container: ContainerId,
        props: PropertySet,
    ) -> Result<PropertySet> {
        let key = IvKey::container(container, ClassId::Property);
        let merged = self
            .node
            .update(key, l2g(&props)?.into())
            .await?
            .into_property()?;
        g2l(&merged)
    }

    /// Capability of an open handle; resolving it opens the container here
    pub async fn fetch_capability(&self, handle: HandleId) -> Result<Capability> {
        self.node
            .fetch(IvKey::handle(handle), FetchRequest::default())
            .await?
            .into_capability()
    }

    /// Publish a freshly opened handle to every node
    pub async fn update_capability(
        &self,
        handle: HandleId,
        capability: Capability,
    ) -> Result<Capability> {
        self.node
            .update(IvKey::handle(handle), IvValue::Capability(capability))
            .await?
            .into_capability()
    }

    /// Close a handle everywhere
    pub async fn invalidate_capability(&self, handle: HandleId) -> Result<()> {
        self.node
            .invalidate(KeyFilter::key(IvKey::handle(handle)), SyncMode::Eager)
            .await?;
        Ok(())
    }

    /// Drop records of `class`, for one container or for all of them
    pub async fn invalidate(
        &self,
        container: Option<ContainerId>,
        class: ClassId,
        sync: SyncMode,
    ) -> Result<usize> {
        let filter = KeyFilter {
            id: container.map(|c| c.as_uuid()),
            class: Some(class),
        };
        self.node.invalidate(filter, sync).await
    }

    /// Report this node's aggregation watermark to the root
    pub async fn report_agg_epoch(&self, container: ContainerId, epoch: Epoch) -> Result<()> {
        let report = AggEpoch::Report {
            rank: self.rank(),
            epoch,
        };
        self.node
            .update(
                IvKey::container(container, ClassId::AggEpoch),
                IvValue::AggEpoch(report),
            )
            .await?;
        Ok(())
    }

    /// Current aggregation boundary
    ///
    /// The root recomputes it from the reports and pushes it down; any other
    /// node answers with the highest boundary it has applied, 0 if none has
    /// arrived. The answer never decreases, even across invalidation.
    pub async fn refresh_agg_boundary(&self, container: ContainerId) -> Result<Epoch> {
        let key = IvKey::container(container, ClassId::AggEpoch);
        let Some(minimum) = self.is_root().then(|| self.tracker.boundary(container)).flatten()
        else {
            return self.cached_boundary(container, key).await;
        };

        match self
            .node
            .update(key, IvValue::AggEpoch(AggEpoch::Boundary { epoch: minimum }))
            .await?
            .into_agg_epoch()?
        {
            AggEpoch::Boundary { epoch } => Ok(epoch),
            AggEpoch::Report { .. } => Err(Error::internal("boundary update answered with a report")),
        }
    }

    async fn cached_boundary(&self, container: ContainerId, key: IvKey) -> Result<Epoch> {
        let cached = match self.node.lookup(key).await? {
            Some(IvValue::AggEpoch(AggEpoch::Boundary { epoch })) => epoch,
            _ => 0,
        };
        Ok(cached.max(self.tracker.published(container)))
    }
}
