//! Root authority seam
//!
//! The root node consults the [`Authority`] whenever a class resolves a miss
//! or a forwarded update there. The replicated store behind it lives outside
//! this crate; [`MemoryAuthority`] is an in-memory stand-in used by the local
//! cluster, the simulator and tests.

use crate::prop::PropertySet;
use async_trait::async_trait;
use ivcache_common::{ContainerId, Epoch, Error, HandleId, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Handle record written by the open path
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandleRecord {
    pub container: ContainerId,
    pub flags: u64,
    pub sec_capas: u64,
}

/// Access to the authoritative container metadata
#[async_trait]
pub trait Authority: Send + Sync + 'static {
    /// Look up an open handle
    async fn handle(&self, handle: HandleId) -> Result<Option<HandleRecord>>;

    /// Pool map version at the container's last status change
    async fn status_pm_ver(&self, container: ContainerId) -> Result<u32>;

    /// Every explicitly set property of a container
    async fn properties(&self, container: ContainerId) -> Result<PropertySet>;

    /// Set the given properties and return the resulting full set
    async fn merge_properties(
        &self,
        container: ContainerId,
        props: PropertySet,
    ) -> Result<PropertySet>;

    /// Snapshot epochs of a container
    async fn snapshots(&self, container: ContainerId) -> Result<Vec<Epoch>>;

    /// Advance the container's object id counter by `count`, returning the
    /// value before the addition
    async fn fetch_add_oid(&self, container: ContainerId, count: u64) -> Result<u64>;
}

#[derive(Default)]
struct ContainerState {
    props: PropertySet,
    snapshots: Vec<Epoch>,
    status_pm_ver: u32,
    next_oid: u64,
}

#[derive(Default)]
struct AuthorityState {
    containers: HashMap<ContainerId, ContainerState>,
    handles: HashMap<HandleId, HandleRecord>,
}

/// In-memory authority
pub struct MemoryAuthority {
    state: RwLock<AuthorityState>,
    available: AtomicBool,
    reads: AtomicU64,
    read_delay: Mutex<Duration>,
}

impl MemoryAuthority {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(AuthorityState::default()),
            available: AtomicBool::new(true),
            reads: AtomicU64::new(0),
            read_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Create a container with its initial properties
    pub fn create_container(&self, container: ContainerId, props: PropertySet) {
        let mut state = self.state.write();
        state.containers.insert(
            container,
            ContainerState {
                props,
                ..ContainerState::default()
            },
        );
    }

    /// Record a snapshot
    pub fn add_snapshot(&self, container: ContainerId, epoch: Epoch) -> Result<()> {
        let mut state = self.state.write();
        let cont = container_mut(&mut state, container)?;
        if let Err(pos) = cont.snapshots.binary_search(&epoch) {
            cont.snapshots.insert(pos, epoch);
        }
        Ok(())
    }

    /// Record a container status change
    pub fn set_status_pm_ver(&self, container: ContainerId, pm_ver: u32) -> Result<()> {
        let mut state = self.state.write();
        container_mut(&mut state, container)?.status_pm_ver = pm_ver;
        Ok(())
    }

    /// Persist an open handle
    pub fn put_handle(&self, handle: HandleId, record: HandleRecord) {
        self.state.write().handles.insert(handle, record);
    }

    /// Forget a closed handle
    pub fn remove_handle(&self, handle: HandleId) {
        self.state.write().handles.remove(&handle);
    }

    /// Simulate losing or regaining leadership
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Hold every read answer back by `delay` after the state was read
    pub fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock() = delay;
    }

    /// Number of read operations served
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::unavailable("authority is not leader"))
        }
    }

    fn read(&self) -> Result<()> {
        self.check_available()?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn answer<T>(&self, value: T) -> T {
        let delay = *self.read_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        value
    }
}

impl Default for MemoryAuthority {
    fn default() -> Self {
        Self::new()
    }
}

fn container_mut(state: &mut AuthorityState, container: ContainerId) -> Result<&mut ContainerState> {
    state
        .containers
        .get_mut(&container)
        .ok_or_else(|| Error::not_found(format!("container {container}")))
}

fn container_ref(state: &AuthorityState, container: ContainerId) -> Result<&ContainerState> {
    state
        .containers
        .get(&container)
        .ok_or_else(|| Error::not_found(format!("container {container}")))
}

#[async_trait]
impl Authority for MemoryAuthority {
    async fn handle(&self, handle: HandleId) -> Result<Option<HandleRecord>> {
        self.read()?;
        let record = self.state.read().handles.get(&handle).copied();
        Ok(self.answer(record).await)
    }

    async fn status_pm_ver(&self, container: ContainerId) -> Result<u32> {
        self.read()?;
        let pm_ver = container_ref(&self.state.read(), container)?.status_pm_ver;
        Ok(self.answer(pm_ver).await)
    }

    async fn properties(&self, container: ContainerId) -> Result<PropertySet> {
        self.read()?;
        let props = container_ref(&self.state.read(), container)?.props.clone();
        Ok(self.answer(props).await)
    }

    async fn merge_properties(
        &self,
        container: ContainerId,
        props: PropertySet,
    ) -> Result<PropertySet> {
        self.check_available()?;
        let mut state = self.state.write();
        let cont = container_mut(&mut state, container)?;
        cont.props.merge(props);
        Ok(cont.props.clone())
    }

    async fn snapshots(&self, container: ContainerId) -> Result<Vec<Epoch>> {
        self.read()?;
        let epochs = container_ref(&self.state.read(), container)?.snapshots.clone();
        Ok(self.answer(epochs).await)
    }

    async fn fetch_add_oid(&self, container: ContainerId, count: u64) -> Result<u64> {
        self.check_available()?;
        let mut state = self.state.write();
        let cont = container_mut(&mut state, container)?;
        let base = cont.next_oid;
        cont.next_oid = base
            .checked_add(count)
            .ok_or_else(|| Error::invalid(format!("object id space of {container} exhausted")))?;
        Ok(base)
    }
}
