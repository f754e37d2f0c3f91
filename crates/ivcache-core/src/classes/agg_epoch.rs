//! EC aggregation epochs
//!
//! Nodes report their local aggregation watermark to the root. The root
//! keeps the highest report per rank, and the minimum over all reporting
//! ranks becomes the boundary it pushes back down. A node never lowers the
//! boundary it holds.

use super::expect_class;
use crate::host::ContainerHost;
use crate::iv::{ClassCtx, IvClass, IvKey, UpdateOutcome};
use crate::record::{AggEpoch, IvValue};
use async_trait::async_trait;
use ivcache_common::{ClassId, ContainerId, Epoch, Error, Rank, Result, SyncMode};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default)]
struct Watermarks {
    ranks: BTreeMap<Rank, Epoch>,
    /// Highest boundary applied on this node; survives cache eviction
    published: Epoch,
}

/// Per-container, per-rank aggregation watermarks
#[derive(Debug, Default)]
pub struct EpochTracker {
    containers: Mutex<HashMap<ContainerId, Watermarks>>,
}

impl EpochTracker {
    /// Record a report, returning the watermark now held for `rank`
    pub fn record(&self, container: ContainerId, rank: Rank, epoch: Epoch) -> Epoch {
        let mut containers = self.containers.lock();
        let held = containers
            .entry(container)
            .or_default()
            .ranks
            .entry(rank)
            .or_insert(epoch);
        *held = (*held).max(epoch);
        *held
    }

    /// Lowest watermark over every reporting rank, never below a boundary
    /// already published
    pub fn boundary(&self, container: ContainerId) -> Option<Epoch> {
        self.containers.lock().get(&container).and_then(|marks| {
            marks
                .ranks
                .values()
                .min()
                .map(|min| (*min).max(marks.published))
        })
    }

    pub fn published(&self, container: ContainerId) -> Epoch {
        self.containers
            .lock()
            .get(&container)
            .map_or(0, |marks| marks.published)
    }

    /// Raise the published boundary, returning the one now held
    pub fn publish(&self, container: ContainerId, epoch: Epoch) -> Epoch {
        let mut containers = self.containers.lock();
        let marks = containers.entry(container).or_default();
        marks.published = marks.published.max(epoch);
        marks.published
    }

    pub fn reporters(&self, container: ContainerId) -> usize {
        self.containers
            .lock()
            .get(&container)
            .map_or(0, |marks| marks.ranks.len())
    }
}

pub struct AggEpochClass {
    tracker: Arc<EpochTracker>,
    host: Arc<dyn ContainerHost>,
}

impl AggEpochClass {
    pub fn new(tracker: Arc<EpochTracker>, host: Arc<dyn ContainerHost>) -> Self {
        Self { tracker, host }
    }

    fn apply_boundary(
        &self,
        key: &IvKey,
        slot: &mut Option<IvValue>,
        epoch: Epoch,
    ) -> Result<IvValue> {
        let held = match slot {
            Some(IvValue::AggEpoch(AggEpoch::Boundary { epoch })) => *epoch,
            _ => 0,
        };
        let container = key.container_id();
        let epoch = held.max(self.tracker.published(container)).max(epoch);
        self.host.refresh_agg_boundary(container, epoch)?;
        self.tracker.publish(container, epoch);

        let value = IvValue::AggEpoch(AggEpoch::Boundary { epoch });
        *slot = Some(value.clone());
        Ok(value)
    }
}

#[async_trait]
impl IvClass for AggEpochClass {
    fn class_id(&self) -> ClassId {
        ClassId::AggEpoch
    }

    fn sync_mode(&self, value: &IvValue) -> SyncMode {
        match value {
            IvValue::AggEpoch(AggEpoch::Boundary { .. }) => SyncMode::Lazy,
            _ => SyncMode::None,
        }
    }

    async fn fetch_root(&self, key: &IvKey) -> Result<IvValue> {
        Err(Error::not_found(format!(
            "no aggregation boundary for {}",
            key.container_id()
        )))
    }

    fn update(
        &self,
        ctx: &ClassCtx,
        key: &IvKey,
        slot: &mut Option<IvValue>,
        value: IvValue,
    ) -> Result<UpdateOutcome> {
        expect_class(&value, ClassId::AggEpoch)?;
        match value.into_agg_epoch()? {
            report @ AggEpoch::Report { rank, epoch } => {
                if !ctx.is_root {
                    return Ok(UpdateOutcome::Forward(IvValue::AggEpoch(report)));
                }
                let container = key.container_id();
                self.host.record_agg_epoch(container, rank, epoch)?;
                let held = self.tracker.record(container, rank, epoch);
                debug!("{} reports aggregation epoch {} for {}", rank, held, container);
                Ok(UpdateOutcome::Applied(IvValue::AggEpoch(report)))
            }
            AggEpoch::Boundary { epoch } => {
                if !ctx.is_root {
                    return Err(Error::invalid(
                        "aggregation boundaries are set by the root",
                    ));
                }
                self.apply_boundary(key, slot, epoch)
                    .map(UpdateOutcome::Applied)
            }
        }
    }

    fn refresh(
        &self,
        _ctx: &ClassCtx,
        key: &IvKey,
        slot: &mut Option<IvValue>,
        answer: IvValue,
        _pending: Option<&IvValue>,
    ) -> Result<IvValue> {
        match answer.into_agg_epoch()? {
            AggEpoch::Boundary { epoch } => self.apply_boundary(key, slot, epoch),
            report @ AggEpoch::Report { .. } => Ok(IvValue::AggEpoch(report)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::LocalHost;

    #[test]
    fn test_tracker_keeps_max_per_rank() {
        let tracker = EpochTracker::default();
        let cont = ContainerId::new();

        assert_eq!(tracker.boundary(cont), None);
        tracker.record(cont, Rank(1), 50);
        tracker.record(cont, Rank(2), 30);
        assert_eq!(tracker.record(cont, Rank(1), 40), 50);
        assert_eq!(tracker.boundary(cont), Some(30));

        tracker.record(cont, Rank(2), 70);
        assert_eq!(tracker.boundary(cont), Some(50));
        assert_eq!(tracker.reporters(cont), 2);
    }

    #[test]
    fn test_published_boundary_floors_the_minimum() {
        let tracker = EpochTracker::default();
        let cont = ContainerId::new();

        assert_eq!(tracker.published(cont), 0);
        tracker.record(cont, Rank(1), 40);
        tracker.record(cont, Rank(2), 30);
        assert_eq!(tracker.publish(cont, 30), 30);
        assert_eq!(tracker.publish(cont, 10), 30);

        tracker.record(cont, Rank(0), 5);
        assert_eq!(tracker.boundary(cont), Some(30));
        assert_eq!(tracker.reporters(cont), 3);
    }

    #[test]
    fn test_boundary_survives_evicted_slot() {
        let host = Arc::new(LocalHost::new(Rank(0)));
        let class = AggEpochClass::new(Arc::new(EpochTracker::default()), host.clone());
        let ctx = ClassCtx {
            rank: Rank(0),
            is_root: true,
        };
        let cont = ContainerId::new();
        let key = IvKey::container(cont, ClassId::AggEpoch);

        let boundary = |epoch| IvValue::AggEpoch(AggEpoch::Boundary { epoch });
        class.update(&ctx, &key, &mut None, boundary(30)).unwrap();

        // a fresh slot stands for a record dropped by invalidation
        let mut slot = None;
        let applied = class
            .refresh(&ctx, &key, &mut slot, boundary(5), None)
            .unwrap();
        assert_eq!(applied, boundary(30));
        assert_eq!(slot, Some(boundary(30)));
        assert_eq!(host.boundary(cont), Some(30));
    }

    #[test]
    fn test_boundary_never_decreases() {
        let host = Arc::new(LocalHost::new(Rank(0)));
        let class = AggEpochClass::new(Arc::new(EpochTracker::default()), host.clone());
        let ctx = ClassCtx {
            rank: Rank(0),
            is_root: true,
        };
        let cont = ContainerId::new();
        let key = IvKey::container(cont, ClassId::AggEpoch);
        let mut slot = None;

        for (offered, expected) in [(10, 10), (25, 25), (20, 25), (25, 25), (40, 40)] {
            let outcome = class
                .update(
                    &ctx,
                    &key,
                    &mut slot,
                    IvValue::AggEpoch(AggEpoch::Boundary { epoch: offered }),
                )
                .unwrap();
            assert_eq!(
                outcome,
                UpdateOutcome::Applied(IvValue::AggEpoch(AggEpoch::Boundary { epoch: expected }))
            );
            assert_eq!(host.boundary(cont), Some(expected));
        }
    }

    #[test]
    fn test_boundary_update_off_root() {
        let class = AggEpochClass::new(
            Arc::new(EpochTracker::default()),
            Arc::new(LocalHost::new(Rank(1))),
        );
        let ctx = ClassCtx {
            rank: Rank(1),
            is_root: false,
        };
        let key = IvKey::container(ContainerId::new(), ClassId::AggEpoch);
        let boundary = IvValue::AggEpoch(AggEpoch::Boundary { epoch: 1 });
        assert!(matches!(
            class.update(&ctx, &key, &mut None, boundary),
            Err(Error::Invalid(_))
        ));

        let report = IvValue::AggEpoch(AggEpoch::Report {
            rank: Rank(1),
            epoch: 9,
        });
        assert_eq!(
            class.update(&ctx, &key, &mut None, report.clone()).unwrap(),
            UpdateOutcome::Forward(report)
        );
    }
}
