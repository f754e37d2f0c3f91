//! Inter-node transport
//!
//! [`Fabric`] is everything a node needs from the tree: a parent to fetch
//! from, a root to forward to and children to push to. [`LocalFabric`] wires
//! in-process node actors into a k-ary tree and copies every value across a
//! hop through its bincode encoding.

use super::class::FetchRequest;
use super::key::{IvKey, KeyFilter};
use super::node::NodeHandle;
use crate::record::IvValue;
use async_trait::async_trait;
use futures::future::join_all;
use ivcache_common::{Error, Rank, Result, SyncMode};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Downward propagation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Push {
    Refresh(IvKey, IvValue),
    Invalidate(KeyFilter),
}

#[async_trait]
pub trait Fabric: Send + Sync + 'static {
    /// Rank of the root authority
    fn root(&self) -> Rank;

    /// Full record from `from`'s parent
    async fn fetch_from_parent(&self, from: Rank, key: IvKey) -> Result<IvValue>;

    /// Run an update on the root, bypassing intermediate nodes
    async fn forward_to_root(&self, from: Rank, key: IvKey, value: IvValue) -> Result<IvValue>;

    /// Apply `push` to every child of `from` and their subtrees
    async fn push_to_children(&self, from: Rank, push: Push) -> Result<()>;

    /// Invalidate on the root, which spreads it to the whole tree
    async fn invalidate_at_root(
        &self,
        from: Rank,
        filter: KeyFilter,
        sync: SyncMode,
    ) -> Result<usize>;
}

/// Tree order of the registered ranks: the root first, then ascending
pub fn tree_order(root: Rank, ranks: impl IntoIterator<Item = Rank>) -> Vec<Rank> {
    let mut others: Vec<Rank> = ranks.into_iter().filter(|rank| *rank != root).collect();
    others.sort_unstable();
    others.dedup();
    let mut order = Vec::with_capacity(others.len() + 1);
    order.push(root);
    order.extend(others);
    order
}

fn position(order: &[Rank], rank: Rank) -> Option<usize> {
    order.iter().position(|r| *r == rank)
}

/// Parent of `rank` in a k-ary tree laid over `order`
pub fn parent_of(order: &[Rank], fanout: usize, rank: Rank) -> Option<Rank> {
    let idx = position(order, rank)?;
    if idx == 0 {
        return None;
    }
    order.get((idx - 1) / fanout.max(1)).copied()
}

/// Children of `rank` in a k-ary tree laid over `order`
pub fn children_of(order: &[Rank], fanout: usize, rank: Rank) -> Vec<Rank> {
    let fanout = fanout.max(1);
    position(order, rank).map_or_else(Vec::new, |idx| {
        order
            .iter()
            .skip(idx * fanout + 1)
            .take(fanout)
            .copied()
            .collect()
    })
}

/// Copy a value the way a wire hop would
fn transfer<T: Serialize + DeserializeOwned>(value: &T) -> Result<T> {
    let bytes =
        bincode::serialize(value).map_err(|e| Error::internal(format!("encode failed: {e}")))?;
    bincode::deserialize(&bytes).map_err(|e| Error::invalid(format!("decode failed: {e}")))
}

/// In-process fabric
pub struct LocalFabric {
    root: Rank,
    fanout: usize,
    nodes: RwLock<BTreeMap<Rank, NodeHandle>>,
}

impl LocalFabric {
    #[must_use]
    pub fn new(root: Rank, fanout: usize) -> Self {
        Self {
            root,
            fanout: fanout.max(1),
            nodes: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn register(&self, node: NodeHandle) {
        self.nodes.write().insert(node.rank(), node);
    }

    /// Drop every node handle so the actors can stop
    pub fn shutdown(&self) {
        self.nodes.write().clear();
    }

    /// Registered ranks in tree order
    pub fn ranks(&self) -> Vec<Rank> {
        tree_order(self.root, self.nodes.read().keys().copied())
    }

    pub fn parent(&self, rank: Rank) -> Option<Rank> {
        parent_of(&self.ranks(), self.fanout, rank)
    }

    pub fn children(&self, rank: Rank) -> Vec<Rank> {
        children_of(&self.ranks(), self.fanout, rank)
    }

    fn node(&self, rank: Rank) -> Result<NodeHandle> {
        self.nodes
            .read()
            .get(&rank)
            .cloned()
            .ok_or_else(|| Error::unavailable(format!("{rank} is not reachable")))
    }
}

#[async_trait]
impl Fabric for LocalFabric {
    fn root(&self) -> Rank {
        self.root
    }

    async fn fetch_from_parent(&self, from: Rank, key: IvKey) -> Result<IvValue> {
        let parent = self
            .parent(from)
            .ok_or_else(|| Error::unavailable(format!("{from} has no reachable parent")))?;
        let node = self.node(parent)?;
        let value = node.fetch(transfer(&key)?, FetchRequest::default()).await?;
        transfer(&value)
    }

    async fn forward_to_root(&self, from: Rank, key: IvKey, value: IvValue) -> Result<IvValue> {
        let root = self.node(self.root)?;
        debug!("{}: {} forwarded to {}", from, key, self.root);
        let answer = root.update(transfer(&key)?, transfer(&value)?).await?;
        transfer(&answer)
    }

    async fn push_to_children(&self, from: Rank, push: Push) -> Result<()> {
        let children = self
            .children(from)
            .into_iter()
            .map(|rank| self.node(rank))
            .collect::<Result<Vec<_>>>()?;
        if children.is_empty() {
            return Ok(());
        }

        let push = &push;
        let results = join_all(children.iter().map(|child| async move {
            let push = transfer(push)?;
            child.apply_push(push).await
        }))
        .await;
        results.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(())
    }

    async fn invalidate_at_root(
        &self,
        from: Rank,
        filter: KeyFilter,
        sync: SyncMode,
    ) -> Result<usize> {
        let root = self.node(self.root)?;
        debug!("{}: invalidation forwarded to {}", from, self.root);
        root.invalidate(transfer(&filter)?, sync).await
    }
}
