//! Node actor
//!
//! Each node runs one actor task that owns its [`EntryStore`] and the tables
//! of in-flight upstream work. Callers talk to it through a [`NodeHandle`]:
//! commands go over a bounded mailbox and answers come back on a oneshot.
//!
//! The actor never waits on another node or on the authority. A miss or a
//! forward is handed to a spawned task, which posts a [`Resolution`] back on
//! a separate channel; the actor then applies the answer and completes
//! every caller parked on it.
//!
//! Propagation of root-applied values (eager or lazy push, tree-wide
//! invalidation) is driven from the handle, on the caller's task.

use super::class::{ClassCtx, ClassRegistry, FetchRequest, IvClass, UpdateOutcome};
use super::fabric::{Fabric, Push};
use super::key::{IvKey, KeyFilter};
use super::stats::{IvStats, StatsSnapshot};
use super::store::EntryStore;
use crate::record::IvValue;
use ivcache_common::{Error, Rank, Result, SyncMode};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    Fetch {
        key: IvKey,
        request: FetchRequest,
        reply: Reply<IvValue>,
    },
    Update {
        key: IvKey,
        value: IvValue,
        reply: Reply<(IvValue, SyncMode)>,
    },
    Refresh {
        key: IvKey,
        value: IvValue,
        reply: Reply<IvValue>,
    },
    Invalidate {
        filter: KeyFilter,
        reply: oneshot::Sender<usize>,
    },
    Lookup {
        key: IvKey,
        reply: oneshot::Sender<Option<IvValue>>,
    },
}

enum Resolution {
    Fetched {
        key: IvKey,
        result: Result<IvValue>,
    },
    Forwarded {
        ticket: u64,
        result: Result<IvValue>,
    },
}

/// Caller parked on an upstream fetch
struct Waiter {
    request: FetchRequest,
    reply: Reply<IvValue>,
}

/// Upstream fetch and the callers parked on it
#[derive(Default)]
struct InFlight {
    waiters: Vec<Waiter>,
    /// An invalidation matched the key after the fetch went out; its answer
    /// is handed to the waiters but never cached
    invalidated: bool,
}

/// Update waiting for the root's answer
struct PendingForward {
    key: IvKey,
    original: IvValue,
    reply: Reply<(IvValue, SyncMode)>,
}

struct NodeActor {
    ctx: ClassCtx,
    classes: ClassRegistry,
    fabric: Arc<dyn Fabric>,
    store: EntryStore,
    stats: Arc<IvStats>,
    inbox: mpsc::Receiver<Command>,
    resolutions: mpsc::UnboundedReceiver<Resolution>,
    resolver: mpsc::UnboundedSender<Resolution>,
    fetches: HashMap<IvKey, InFlight>,
    forwards: HashMap<u64, PendingForward>,
    next_ticket: u64,
}

impl NodeActor {
    async fn run(mut self) {
        info!("{}: cache node started (root: {})", self.ctx.rank, self.ctx.is_root);
        loop {
            tokio::select! {
                biased;
                Some(resolution) = self.resolutions.recv() => self.resolve(resolution),
                command = self.inbox.recv() => match command {
                    Some(command) => self.dispatch(command),
                    None => break,
                },
            }
        }
        info!(
            entries = self.store.len(),
            pending_fetches = self.fetches.len(),
            pending_forwards = self.forwards.len(),
            "{}: cache node stopped",
            self.ctx.rank
        );
    }

    fn dispatch(&mut self, command: Command) {
        match command {
            Command::Fetch {
                key,
                request,
                reply,
            } => self.fetch(key, request, reply),
            Command::Update { key, value, reply } => self.update(key, value, reply),
            Command::Refresh { key, value, reply } => {
                let _ = reply.send(self.refresh_entry(key, value, None));
            }
            Command::Invalidate { filter, reply } => {
                let _ = reply.send(self.invalidate(&filter));
            }
            Command::Lookup { key, reply } => {
                let _ = reply.send(self.store.get(&key).cloned());
            }
        }
    }

    fn resolve(&mut self, resolution: Resolution) {
        match resolution {
            Resolution::Fetched { key, result } => self.complete_fetch(key, result),
            Resolution::Forwarded { ticket, result } => self.complete_forward(ticket, result),
        }
    }

    fn class(&self, key: &IvKey) -> Result<Arc<dyn IvClass>> {
        self.classes.get(key.class).map(Arc::clone)
    }

    fn spawn_upstream<F>(&self, work: F)
    where
        F: Future<Output = Resolution> + Send + 'static,
    {
        let resolver = self.resolver.clone();
        tokio::spawn(async move {
            let _ = resolver.send(work.await);
        });
    }

    fn fetch(&mut self, key: IvKey, request: FetchRequest, reply: Reply<IvValue>) {
        let class = match self.class(&key) {
            Ok(class) => class,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        if let Some(value) = self.store.get(&key) {
            IvStats::bump(&self.stats.fetch_hits);
            debug!("{}: cache hit for {}", self.ctx.rank, key);
            let _ = reply.send(class.merge(value, &request));
            return;
        }

        IvStats::bump(&self.stats.fetch_misses);
        let waiters = &mut self.fetches.entry(key).or_default().waiters;
        waiters.push(Waiter { request, reply });
        if waiters.len() > 1 {
            debug!(
                "{}: miss for {} joins an in-flight fetch ({} waiting)",
                self.ctx.rank,
                key,
                waiters.len()
            );
            return;
        }

        if self.ctx.is_root {
            debug!("{}: resolving {} from the authority", self.ctx.rank, key);
            self.spawn_upstream(async move {
                let result = class.fetch_root(&key).await;
                Resolution::Fetched { key, result }
            });
        } else {
            debug!("{}: fetching {} from parent", self.ctx.rank, key);
            let fabric = Arc::clone(&self.fabric);
            let rank = self.ctx.rank;
            self.spawn_upstream(async move {
                let result = fabric.fetch_from_parent(rank, key).await;
                Resolution::Fetched { key, result }
            });
        }
    }

    fn complete_fetch(&mut self, key: IvKey, result: Result<IvValue>) {
        let InFlight {
            waiters,
            invalidated,
        } = self.fetches.remove(&key).unwrap_or_default();
        let applied = result.and_then(|answer| {
            if invalidated {
                debug!(
                    "{}: {} was invalidated during its fetch, answer not cached",
                    self.ctx.rank, key
                );
                return Ok((self.class(&key)?, answer));
            }
            let value = self.refresh_entry(key, answer, None)?;
            Ok((self.class(&key)?, value))
        });

        match applied {
            Ok((class, value)) => {
                for waiter in waiters {
                    let _ = waiter.reply.send(class.merge(&value, &waiter.request));
                }
            }
            Err(e) => {
                if e.is_not_found() {
                    debug!("{}: {} does not exist", self.ctx.rank, key);
                } else {
                    error!("{}: fetch of {} failed: {}", self.ctx.rank, key, e);
                }
                for waiter in waiters {
                    let _ = waiter.reply.send(Err(e.clone()));
                }
            }
        }
    }

    fn update(&mut self, key: IvKey, value: IvValue, reply: Reply<(IvValue, SyncMode)>) {
        let class = match self.class(&key) {
            Ok(class) => class,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        let mut slot = self.store.get(&key).cloned().or_else(|| class.init(&key));
        let original = value.clone();
        match class.update(&self.ctx, &key, &mut slot, value) {
            Ok(UpdateOutcome::Applied(answer)) => {
                self.store.put(key, slot);
                let sync = self.sync_mode(class.as_ref(), &answer);
                let _ = reply.send(Ok((answer, sync)));
            }
            Ok(UpdateOutcome::Forward(forwarded)) => {
                if !self.ctx.is_root {
                    IvStats::bump(&self.stats.forwards);
                }
                let ticket = self.next_ticket;
                self.next_ticket += 1;
                self.forwards.insert(
                    ticket,
                    PendingForward {
                        key,
                        original,
                        reply,
                    },
                );

                if self.ctx.is_root {
                    self.spawn_upstream(async move {
                        let result = class.update_root(&key, forwarded).await;
                        Resolution::Forwarded { ticket, result }
                    });
                } else {
                    debug!("{}: forwarding {} to the root", self.ctx.rank, key);
                    let fabric = Arc::clone(&self.fabric);
                    let rank = self.ctx.rank;
                    self.spawn_upstream(async move {
                        let result = fabric.forward_to_root(rank, key, forwarded).await;
                        Resolution::Forwarded { ticket, result }
                    });
                }
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    fn complete_forward(&mut self, ticket: u64, result: Result<IvValue>) {
        let Some(pending) = self.forwards.remove(&ticket) else {
            warn!("{}: answer for unknown forward {}", self.ctx.rank, ticket);
            return;
        };

        let key = pending.key;
        let applied = result.and_then(|answer| {
            let value = self.refresh_entry(key, answer, Some(&pending.original))?;
            let sync = self.sync_mode(self.class(&key)?.as_ref(), &value);
            Ok((value, sync))
        });
        if let Err(e) = &applied {
            debug!("{}: forwarded update of {} failed: {}", self.ctx.rank, key, e);
        }
        let _ = pending.reply.send(applied);
    }

    /// Apply an answer to the entry; the slot is committed only on success
    fn refresh_entry(
        &mut self,
        key: IvKey,
        answer: IvValue,
        pending: Option<&IvValue>,
    ) -> Result<IvValue> {
        let class = self.class(&key)?;
        let mut slot = self.store.get(&key).cloned().or_else(|| class.init(&key));
        let value = class.refresh(&self.ctx, &key, &mut slot, answer, pending)?;
        self.store.put(key, slot);
        IvStats::bump(&self.stats.refreshes);
        Ok(value)
    }

    fn invalidate(&mut self, filter: &KeyFilter) -> usize {
        let removed = self.store.remove_matching(filter);
        let count = removed.len();
        for (key, value) in removed {
            IvStats::bump(&self.stats.invalidations);
            let teardown = self
                .class(&key)
                .and_then(|class| class.invalidate(&key, value));
            if let Err(e) = teardown {
                warn!("{}: teardown of {} failed: {}", self.ctx.rank, key, e);
            }
        }
        for (key, inflight) in &mut self.fetches {
            if filter.matches(key) {
                inflight.invalidated = true;
            }
        }
        if count > 0 {
            debug!("{}: invalidated {} entries", self.ctx.rank, count);
        }
        count
    }

    /// Only the root propagates; elsewhere the root already did
    fn sync_mode(&self, class: &dyn IvClass, value: &IvValue) -> SyncMode {
        if self.ctx.is_root {
            class.sync_mode(value)
        } else {
            SyncMode::None
        }
    }
}

/// Client side of a node actor
#[derive(Clone)]
pub struct NodeHandle {
    rank: Rank,
    is_root: bool,
    tx: mpsc::Sender<Command>,
    fabric: Arc<dyn Fabric>,
    stats: Arc<IvStats>,
}

impl NodeHandle {
    /// Start the actor for `rank`
    ///
    /// The actor stops once every handle is dropped, including the ones the
    /// fabric holds.
    pub fn spawn(
        rank: Rank,
        classes: ClassRegistry,
        fabric: Arc<dyn Fabric>,
        mailbox_depth: usize,
    ) -> Self {
        let (tx, inbox) = mpsc::channel(mailbox_depth.max(1));
        let (resolver, resolutions) = mpsc::unbounded_channel();
        let stats = Arc::new(IvStats::default());
        let is_root = fabric.root() == rank;

        let actor = NodeActor {
            ctx: ClassCtx { rank, is_root },
            classes,
            fabric: Arc::clone(&fabric),
            store: EntryStore::new(),
            stats: Arc::clone(&stats),
            inbox,
            resolutions,
            resolver,
            fetches: HashMap::new(),
            forwards: HashMap::new(),
            next_ticket: 0,
        };
        tokio::spawn(actor.run());

        Self {
            rank,
            is_root,
            tx,
            fabric,
            stats,
        }
    }

    #[must_use]
    pub const fn rank(&self) -> Rank {
        self.rank
    }

    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| self.stopped())?;
        rx.await.map_err(|_| self.stopped())
    }

    fn stopped(&self) -> Error {
        Error::unavailable(format!("{} is stopped", self.rank))
    }

    /// Read a record, resolving a miss upstream
    pub async fn fetch(&self, key: IvKey, request: FetchRequest) -> Result<IvValue> {
        self.call(|reply| Command::Fetch {
            key,
            request,
            reply,
        })
        .await?
    }

    /// Apply an update here or through the root, then propagate per the
    /// class's sync mode
    pub async fn update(&self, key: IvKey, value: IvValue) -> Result<IvValue> {
        let (value, sync) = self
            .call(|reply| Command::Update { key, value, reply })
            .await??;
        self.propagate(sync, Push::Refresh(key, value.clone()))
            .await?;
        Ok(value)
    }

    /// Drop matching records
    ///
    /// With `SyncMode::None` only this node is affected; otherwise the
    /// invalidation reaches every node through the root.
    pub async fn invalidate(&self, filter: KeyFilter, sync: SyncMode) -> Result<usize> {
        let removed = self
            .call(|reply| Command::Invalidate { filter, reply })
            .await?;
        if self.is_root {
            self.propagate(sync, Push::Invalidate(filter)).await?;
        } else if sync != SyncMode::None {
            self.fabric.invalidate_at_root(self.rank, filter, sync).await?;
        }
        Ok(removed)
    }

    /// Cached record, without going upstream
    pub async fn lookup(&self, key: IvKey) -> Result<Option<IvValue>> {
        self.call(|reply| Command::Lookup { key, reply }).await
    }

    /// Apply a push from the parent, then hand it to this node's children
    pub async fn apply_push(&self, push: Push) -> Result<()> {
        match &push {
            Push::Refresh(key, value) => {
                let (key, value) = (*key, value.clone());
                self.call(|reply| Command::Refresh { key, value, reply })
                    .await??;
            }
            Push::Invalidate(filter) => {
                let filter = *filter;
                self.call(|reply| Command::Invalidate { filter, reply })
                    .await?;
            }
        }
        self.fabric.push_to_children(self.rank, push).await
    }

    async fn propagate(&self, sync: SyncMode, push: Push) -> Result<()> {
        match sync {
            SyncMode::None => Ok(()),
            SyncMode::Eager => self.fabric.push_to_children(self.rank, push).await,
            SyncMode::Lazy => {
                let fabric = Arc::clone(&self.fabric);
                let rank = self.rank;
                tokio::spawn(async move {
                    if let Err(e) = fabric.push_to_children(rank, push).await {
                        warn!("{}: lazy push failed: {}", rank, e);
                    }
                });
                Ok(())
            }
        }
    }
}
