//! Local side effects of cached values
//!
//! Delivering a capability opens a container incarnation on the node and
//! removing it closes that incarnation; aggregation epochs feed the local
//! compaction scheduler. [`ContainerHost`] is that seam, and [`LocalHost`] is
//! the in-memory implementation used by the local cluster.

use crate::record::Capability;
use ivcache_common::{ContainerId, Epoch, Error, HandleId, Rank, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Node-local container lifecycle and aggregation callbacks
pub trait ContainerHost: Send + Sync + 'static {
    /// Open (or confirm) the container incarnation behind `handle`
    fn open(&self, handle: HandleId, capability: &Capability) -> Result<()>;

    /// Close the incarnation behind `handle`
    fn close(&self, handle: HandleId) -> Result<()>;

    /// Root only: a rank reported its aggregation watermark
    fn record_agg_epoch(&self, container: ContainerId, rank: Rank, epoch: Epoch) -> Result<()>;

    /// A new aggregation boundary reached this node
    fn refresh_agg_boundary(&self, container: ContainerId, epoch: Epoch) -> Result<()>;
}

/// An open container incarnation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Incarnation {
    pub container: ContainerId,
    pub flags: u64,
    pub sec_capas: u64,
}

/// In-memory container host
pub struct LocalHost {
    rank: Rank,
    open: Mutex<HashMap<HandleId, Incarnation>>,
    reports: Mutex<HashMap<ContainerId, BTreeMap<Rank, Epoch>>>,
    boundaries: Mutex<HashMap<ContainerId, Epoch>>,
    opens: AtomicU64,
    closes: AtomicU64,
}

impl LocalHost {
    #[must_use]
    pub fn new(rank: Rank) -> Self {
        Self {
            rank,
            open: Mutex::new(HashMap::new()),
            reports: Mutex::new(HashMap::new()),
            boundaries: Mutex::new(HashMap::new()),
            opens: AtomicU64::new(0),
            closes: AtomicU64::new(0),
        }
    }

    /// Incarnation currently open for `handle`
    pub fn incarnation(&self, handle: HandleId) -> Option<Incarnation> {
        self.open.lock().get(&handle).copied()
    }

    /// Number of incarnations actually created
    pub fn open_count(&self) -> u64 {
        self.opens.load(Ordering::Relaxed)
    }

    /// Number of incarnations actually torn down
    pub fn close_count(&self) -> u64 {
        self.closes.load(Ordering::Relaxed)
    }

    /// Last boundary delivered for `container`
    pub fn boundary(&self, container: ContainerId) -> Option<Epoch> {
        self.boundaries.lock().get(&container).copied()
    }

    /// Last report recorded for `rank` on `container`
    pub fn reported(&self, container: ContainerId, rank: Rank) -> Option<Epoch> {
        self.reports
            .lock()
            .get(&container)
            .and_then(|ranks| ranks.get(&rank).copied())
    }
}

impl ContainerHost for LocalHost {
    fn open(&self, handle: HandleId, capability: &Capability) -> Result<()> {
        let mut open = self.open.lock();
        if let Some(existing) = open.get(&handle) {
            if existing.flags != capability.flags || existing.sec_capas != capability.sec_capas {
                return Err(Error::conflict(format!(
                    "handle {handle} already open with flags {:#x} capas {:#x}",
                    existing.flags, existing.sec_capas
                )));
            }
            debug!("{}: found compatible handle {}", self.rank, handle);
            return Ok(());
        }

        open.insert(
            handle,
            Incarnation {
                container: capability.container,
                flags: capability.flags,
                sec_capas: capability.sec_capas,
            },
        );
        self.opens.fetch_add(1, Ordering::Relaxed);
        info!(
            "{}: opened container {} via handle {}",
            self.rank, capability.container, handle
        );
        Ok(())
    }

    fn close(&self, handle: HandleId) -> Result<()> {
        match self.open.lock().remove(&handle) {
            Some(inc) => {
                self.closes.fetch_add(1, Ordering::Relaxed);
                info!(
                    "{}: closed container {} via handle {}",
                    self.rank, inc.container, handle
                );
            }
            None => debug!("{}: handle {} already closed", self.rank, handle),
        }
        Ok(())
    }

    fn record_agg_epoch(&self, container: ContainerId, rank: Rank, epoch: Epoch) -> Result<()> {
        self.reports
            .lock()
            .entry(container)
            .or_default()
            .insert(rank, epoch);
        Ok(())
    }

    fn refresh_agg_boundary(&self, container: ContainerId, epoch: Epoch) -> Result<()> {
        self.boundaries.lock().insert(container, epoch);
        debug!(
            "{}: aggregation boundary of {} is now {}",
            self.rank, container, epoch
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cap(container: ContainerId, flags: u64) -> Capability {
        Capability {
            container,
            flags,
            sec_capas: 0x3,
            status_pm_ver: 1,
        }
    }

    #[test]
    fn test_open_is_idempotent() {
        let host = LocalHost::new(Rank(1));
        let handle = HandleId::new();
        let cont = ContainerId::new();

        host.open(handle, &cap(cont, 2)).unwrap();
        host.open(handle, &cap(cont, 2)).unwrap();
        assert_eq!(host.open_count(), 1);
        assert_eq!(host.incarnation(handle).unwrap().container, cont);
    }

    #[test]
    fn test_open_conflict() {
        let host = LocalHost::new(Rank(1));
        let handle = HandleId::new();
        let cont = ContainerId::new();

        host.open(handle, &cap(cont, 2)).unwrap();
        let err = host.open(handle, &cap(cont, 4)).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(host.incarnation(handle).unwrap().flags, 2);
    }

    #[test]
    fn test_close_twice() {
        let host = LocalHost::new(Rank(0));
        let handle = HandleId::new();
        host.open(handle, &cap(ContainerId::new(), 1)).unwrap();
        host.close(handle).unwrap();
        host.close(handle).unwrap();
        assert_eq!(host.close_count(), 1);
        assert!(host.incarnation(handle).is_none());
    }
}
