//! In-process cluster
//!
//! Boots one [`NodeContext`] per rank over a shared [`LocalFabric`], a single
//! [`MemoryAuthority`] for the root and a [`LocalHost`] per node. Used by the
//! simulator and by the tree-level tests.

use crate::authority::{Authority, MemoryAuthority};
use crate::context::NodeContext;
use crate::host::{ContainerHost, LocalHost};
use crate::iv::{Fabric, LocalFabric};
use ivcache_common::config::CacheConfig;
use ivcache_common::{Config, Error, Rank, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

pub struct ClusterBuilder {
    nodes: u32,
    root: Rank,
    fanout: usize,
    cache: CacheConfig,
    authority: Option<Arc<MemoryAuthority>>,
}

impl ClusterBuilder {
    #[must_use]
    pub fn new(nodes: u32) -> Self {
        Self {
            nodes,
            root: Rank(0),
            fanout: 4,
            cache: CacheConfig::default(),
            authority: None,
        }
    }

    /// Tree shape and cache tuning from a loaded configuration
    #[must_use]
    pub fn from_config(config: &Config, nodes: u32) -> Self {
        Self::new(nodes)
            .root(Rank(config.tree.root_rank))
            .fanout(config.tree.fanout)
            .cache(config.cache.clone())
    }

    #[must_use]
    pub const fn root(mut self, root: Rank) -> Self {
        self.root = root;
        self
    }

    #[must_use]
    pub const fn fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout;
        self
    }

    #[must_use]
    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    #[must_use]
    pub fn authority(mut self, authority: Arc<MemoryAuthority>) -> Self {
        self.authority = Some(authority);
        self
    }

    /// Start every node; must run inside a tokio runtime
    pub fn build(self) -> Result<LocalCluster> {
        if self.nodes == 0 {
            return Err(Error::invalid("a cluster needs at least one node"));
        }
        if self.root.0 >= self.nodes {
            return Err(Error::invalid(format!(
                "root {} is outside ranks 0..{}",
                self.root, self.nodes
            )));
        }

        let fabric = Arc::new(LocalFabric::new(self.root, self.fanout));
        let authority = self
            .authority
            .unwrap_or_else(|| Arc::new(MemoryAuthority::new()));
        let shared: Arc<dyn Authority> = authority.clone();

        let mut nodes = BTreeMap::new();
        let mut hosts = BTreeMap::new();
        for rank in (0..self.nodes).map(Rank) {
            let host = Arc::new(LocalHost::new(rank));
            let host_dyn: Arc<dyn ContainerHost> = host.clone();
            let fabric_dyn: Arc<dyn Fabric> = fabric.clone();
            let ctx = NodeContext::start(rank, &self.cache, &shared, &host_dyn, fabric_dyn);
            fabric.register(ctx.node().clone());
            nodes.insert(rank, ctx);
            hosts.insert(rank, host);
        }

        info!(
            "local cluster of {} nodes up (root {}, fanout {})",
            self.nodes, self.root, self.fanout
        );
        Ok(LocalCluster {
            root: self.root,
            fabric,
            authority,
            nodes,
            hosts,
        })
    }
}

pub struct LocalCluster {
    root: Rank,
    fabric: Arc<LocalFabric>,
    authority: Arc<MemoryAuthority>,
    nodes: BTreeMap<Rank, NodeContext>,
    hosts: BTreeMap<Rank, Arc<LocalHost>>,
}

impl LocalCluster {
    pub fn node(&self, rank: Rank) -> Result<&NodeContext> {
        self.nodes
            .get(&rank)
            .ok_or_else(|| Error::not_found(format!("{rank}")))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeContext> {
        self.nodes.values()
    }

    pub fn ranks(&self) -> Vec<Rank> {
        self.nodes.keys().copied().collect()
    }

    #[must_use]
    pub const fn root_rank(&self) -> Rank {
        self.root
    }

    /// Deepest rank in tree order
    pub fn leaf_rank(&self) -> Rank {
        self.fabric.ranks().last().copied().unwrap_or(self.root)
    }

    pub const fn authority(&self) -> &Arc<MemoryAuthority> {
        &self.authority
    }

    pub fn host(&self, rank: Rank) -> Option<&Arc<LocalHost>> {
        self.hosts.get(&rank)
    }

    pub const fn fabric(&self) -> &Arc<LocalFabric> {
        &self.fabric
    }

    /// Stop every node actor
    pub fn shutdown(&self) {
        self.fabric.shutdown();
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::HandleRecord;
    use crate::context::SnapshotFetch;
    use crate::prop::{Prop, PropType, PropertySet};
    use crate::record::{Capability, IvValue, OidRange};
    use crate::iv::IvKey;
    use ivcache_common::{ClassId, ContainerId, HandleId, SyncMode};
    use rand::Rng;
    use std::time::Duration;

    fn cluster(nodes: u32, fanout: usize) -> LocalCluster {
        ClusterBuilder::new(nodes).fanout(fanout).build().unwrap()
    }

    fn container(cluster: &LocalCluster, props: Vec<Prop>) -> ContainerId {
        let cont = ContainerId::new();
        cluster
            .authority()
            .create_container(cont, PropertySet::from(props));
        cont
    }

    fn assert_disjoint(ranges: &[OidRange]) {
        for (i, a) in ranges.iter().enumerate() {
            for b in &ranges[i + 1..] {
                assert!(!a.overlaps(b), "{a:?} overlaps {b:?}");
            }
        }
    }

    #[test]
    fn test_builder_rejects_bad_shape() {
        assert!(ClusterBuilder::new(0).build().is_err());
        assert!(ClusterBuilder::new(3).root(Rank(3)).build().is_err());
    }

    #[tokio::test]
    async fn test_reserve_ranges_disjoint_across_nodes() {
        let cluster = cluster(7, 2);
        let cont = container(&cluster, vec![]);

        let per_node = futures::future::join_all(cluster.nodes().map(|node| async move {
            let mut ranges = Vec::new();
            for _ in 0..20 {
                let count = rand::thread_rng().gen_range(1..=80);
                let range = node.reserve(cont, count).await.unwrap();
                assert_eq!(range.count, count);
                ranges.push(range);
            }
            ranges
        }))
        .await;

        for ranges in &per_node {
            assert!(ranges.windows(2).all(|w| w[0].base < w[1].base));
        }
        let all: Vec<OidRange> = per_node.into_iter().flatten().collect();
        assert_eq!(all.len(), 7 * 20);
        assert_disjoint(&all);
    }

    #[tokio::test]
    async fn test_concurrent_reserves_on_one_node() {
        let cluster = cluster(3, 2);
        let cont = container(&cluster, vec![]);
        let leaf = cluster.node(cluster.leaf_rank()).unwrap();

        let ranges: Vec<OidRange> =
            futures::future::join_all((1..=30).map(|n| leaf.reserve(cont, n)))
                .await
                .into_iter()
                .collect::<Result<_>>()
                .unwrap();
        assert_disjoint(&ranges);
    }

    #[tokio::test]
    async fn test_leaf_reserves_in_batches() {
        let cluster = cluster(3, 2);
        let cont = container(&cluster, vec![]);
        let leaf = cluster.node(cluster.leaf_rank()).unwrap();
        let root = cluster.node(cluster.root_rank()).unwrap();

        assert_eq!(leaf.reserve(cont, 1).await.unwrap(), OidRange::new(0, 1));
        assert_eq!(leaf.reserve(cont, 1).await.unwrap(), OidRange::new(1, 1));
        // The leaf's first ask took a whole block from the counter.
        assert_eq!(root.reserve(cont, 1).await.unwrap(), OidRange::new(32, 1));
        // 30 left on the leaf; 50 more needs an ask of 128 past the root's id.
        assert_eq!(leaf.reserve(cont, 50).await.unwrap(), OidRange::new(33, 50));
        assert_eq!(root.reserve(cont, 1).await.unwrap(), OidRange::new(161, 1));
    }

    #[tokio::test]
    async fn test_reserve_zero_is_invalid() {
        let cluster = cluster(2, 2);
        let cont = container(&cluster, vec![]);
        for node in cluster.nodes() {
            assert!(matches!(node.reserve(cont, 0).await, Err(Error::Invalid(_))));
        }
    }

    #[tokio::test]
    async fn test_reserve_failure_leaves_range_untouched() {
        let cluster = cluster(2, 2);
        let cont = container(&cluster, vec![]);
        let leaf = cluster.node(Rank(1)).unwrap();

        assert_eq!(leaf.reserve(cont, 30).await.unwrap(), OidRange::new(0, 30));
        cluster.authority().set_available(false);
        // 2 ids are held locally; 5 is more than that.
        assert!(leaf.reserve(cont, 5).await.unwrap_err().is_retryable());
        assert_eq!(leaf.reserve(cont, 2).await.unwrap(), OidRange::new(30, 2));

        cluster.authority().set_available(true);
        assert_eq!(leaf.reserve(cont, 5).await.unwrap(), OidRange::new(32, 5));
    }

    #[tokio::test]
    async fn test_snapshot_capacity_negotiation() {
        let cluster = cluster(5, 2);
        let cont = container(&cluster, vec![]);
        for epoch in (1..=20).rev() {
            cluster.authority().add_snapshot(cont, epoch * 10).unwrap();
        }
        let leaf = cluster.node(cluster.leaf_rank()).unwrap();

        assert_eq!(
            leaf.fetch_snapshots(cont, 5).await.unwrap(),
            SnapshotFetch::NeedsCapacity(20)
        );
        let expected: Vec<u64> = (1..=20).map(|e| e * 10).collect();
        assert_eq!(
            leaf.fetch_snapshots(cont, 20).await.unwrap(),
            SnapshotFetch::Epochs(expected.clone())
        );
        assert_eq!(leaf.snapshots(cont).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_snapshot_update_reaches_every_node() {
        let cluster = cluster(6, 2);
        let cont = container(&cluster, vec![]);
        let leaf = cluster.node(cluster.leaf_rank()).unwrap();

        leaf.update_snapshots(cont, vec![30, 10, 20]).await.unwrap();
        let key = IvKey::container(cont, ClassId::Snapshots);
        for node in cluster.nodes() {
            assert_eq!(
                node.node().lookup(key).await.unwrap(),
                Some(IvValue::Snapshots(crate::record::SnapshotList::new(vec![
                    10, 20, 30
                ])))
            );
        }
    }

    #[tokio::test]
    async fn test_refresh_snapshots_rereads_authority() {
        let cluster = cluster(4, 2);
        let cont = container(&cluster, vec![]);
        cluster.authority().add_snapshot(cont, 5).unwrap();
        let root = cluster.node(cluster.root_rank()).unwrap();
        let leaf = cluster.node(cluster.leaf_rank()).unwrap();

        assert_eq!(leaf.snapshots(cont).await.unwrap(), vec![5]);
        cluster.authority().add_snapshot(cont, 9).unwrap();
        assert_eq!(leaf.snapshots(cont).await.unwrap(), vec![5]);

        assert_eq!(root.refresh_snapshots(cont).await.unwrap(), vec![5, 9]);
        assert_eq!(leaf.snapshots(cont).await.unwrap(), vec![5, 9]);
    }

    #[tokio::test]
    async fn test_wildcard_invalidate_drops_all_snapshot_lists() {
        let cluster = cluster(3, 2);
        let leaf = cluster.node(cluster.leaf_rank()).unwrap();
        let conts: Vec<ContainerId> = (0..3).map(|_| container(&cluster, vec![])).collect();
        for cont in &conts {
            leaf.snapshots(*cont).await.unwrap();
            leaf.reserve(*cont, 1).await.unwrap();
        }

        let removed = leaf
            .invalidate(None, ClassId::Snapshots, SyncMode::None)
            .await
            .unwrap();
        assert_eq!(removed, 3);
        for cont in &conts {
            let snaps = IvKey::container(*cont, ClassId::Snapshots);
            let oids = IvKey::container(*cont, ClassId::OidRange);
            assert!(leaf.node().lookup(snaps).await.unwrap().is_none());
            assert!(leaf.node().lookup(oids).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_property_fetch_and_filter() {
        let cluster = cluster(5, 2);
        let props = vec![
            Prop::Label("scratch".into()),
            Prop::RedunFac(2),
            Prop::Owner("alice@lab".into()),
        ];
        let cont = container(&cluster, props.clone());
        let leaf = cluster.node(cluster.leaf_rank()).unwrap();

        let all = leaf.fetch_property(cont, PropType::KNOWN_MASK).await.unwrap();
        assert_eq!(all, PropertySet::from(props));

        let reads = cluster.authority().reads();
        let label = leaf
            .fetch_property(cont, PropType::Label.bit())
            .await
            .unwrap();
        assert_eq!(label, PropertySet::from(vec![Prop::Label("scratch".into())]));
        assert_eq!(cluster.authority().reads(), reads);
    }

    #[tokio::test]
    async fn test_property_update_writes_through() {
        let cluster = cluster(5, 2);
        let cont = container(&cluster, vec![Prop::Label("old".into()), Prop::Csum(1)]);
        let leaf = cluster.node(cluster.leaf_rank()).unwrap();
        let other = cluster.node(Rank(1)).unwrap();
        other.fetch_property(cont, PropType::KNOWN_MASK).await.unwrap();

        let merged = leaf
            .update_property(
                cont,
                PropertySet::from(vec![Prop::Label("new".into()), Prop::SnapshotMax(8)]),
            )
            .await
            .unwrap();
        let expected = PropertySet::from(vec![
            Prop::Label("new".into()),
            Prop::Csum(1),
            Prop::SnapshotMax(8),
        ]);
        assert_eq!(merged, expected);

        let reads = cluster.authority().reads();
        assert_eq!(
            other.fetch_property(cont, PropType::KNOWN_MASK).await.unwrap(),
            expected
        );
        assert_eq!(cluster.authority().reads(), reads);
    }

    #[tokio::test]
    async fn test_property_update_rejects_long_label() {
        let cluster = cluster(2, 2);
        let cont = container(&cluster, vec![]);
        let err = cluster
            .node(Rank(1))
            .unwrap()
            .update_property(cont, PropertySet::from(vec![Prop::Label("x".repeat(200))]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[tokio::test]
    async fn test_capability_fetch_opens_once() {
        let cluster = cluster(3, 2);
        let cont = container(&cluster, vec![]);
        cluster.authority().set_status_pm_ver(cont, 7).unwrap();
        let handle = HandleId::new();
        cluster.authority().put_handle(
            handle,
            HandleRecord {
                container: cont,
                flags: 0x2,
                sec_capas: 0xf,
            },
        );
        let leaf_rank = cluster.leaf_rank();
        let leaf = cluster.node(leaf_rank).unwrap();

        let cap = leaf.fetch_capability(handle).await.unwrap();
        assert_eq!(
            cap,
            Capability {
                container: cont,
                flags: 0x2,
                sec_capas: 0xf,
                status_pm_ver: 7,
            }
        );
        leaf.fetch_capability(handle).await.unwrap();
        assert_eq!(cluster.host(leaf_rank).unwrap().open_count(), 1);
        assert!(cluster.host(leaf_rank).unwrap().incarnation(handle).is_some());

        let err = leaf.fetch_capability(HandleId::new()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_capability_conflict_keeps_record() {
        let cluster = cluster(3, 2);
        let cont = container(&cluster, vec![]);
        let handle = HandleId::new();
        let root = cluster.node(cluster.root_rank()).unwrap();
        let cap = Capability {
            container: cont,
            flags: 0x2,
            sec_capas: 0x1,
            status_pm_ver: 1,
        };

        root.update_capability(handle, cap).await.unwrap();
        let err = root
            .update_capability(handle, Capability { flags: 0x4, ..cap })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(
            root.node().lookup(IvKey::handle(handle)).await.unwrap(),
            Some(IvValue::Capability(cap))
        );
    }

    #[tokio::test]
    async fn test_capability_publish_and_close_everywhere() {
        let cluster = cluster(6, 2);
        let cont = container(&cluster, vec![]);
        let handle = HandleId::new();
        let cap = Capability {
            container: cont,
            flags: 0x1,
            sec_capas: 0x3,
            status_pm_ver: 2,
        };

        cluster
            .node(cluster.leaf_rank())
            .unwrap()
            .update_capability(handle, cap)
            .await
            .unwrap();
        for rank in cluster.ranks() {
            let host = cluster.host(rank).unwrap();
            assert_eq!(host.open_count(), 1, "{rank}");
        }

        cluster
            .node(Rank(2))
            .unwrap()
            .invalidate_capability(handle)
            .await
            .unwrap();
        for rank in cluster.ranks() {
            let host = cluster.host(rank).unwrap();
            assert_eq!(host.close_count(), 1, "{rank}");
            assert!(host.incarnation(handle).is_none());
        }
    }

    #[tokio::test]
    async fn test_close_during_fetch_leaves_nothing_open() {
        let cluster = cluster(3, 2);
        let cont = container(&cluster, vec![]);
        let handle = HandleId::new();
        cluster.authority().put_handle(
            handle,
            HandleRecord {
                container: cont,
                flags: 0x2,
                sec_capas: 0x1,
            },
        );
        cluster.authority().set_read_delay(Duration::from_millis(50));
        let leaf_rank = cluster.leaf_rank();
        let leaf = cluster.node(leaf_rank).unwrap();
        let root = cluster.node(cluster.root_rank()).unwrap();

        let (fetched, closed) = tokio::join!(leaf.fetch_capability(handle), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cluster.authority().remove_handle(handle);
            root.invalidate_capability(handle).await
        });
        assert!(fetched.is_ok());
        closed.unwrap();

        for rank in cluster.ranks() {
            let host = cluster.host(rank).unwrap();
            assert!(host.incarnation(handle).is_none(), "{rank}");
            assert_eq!(host.open_count(), 0, "{rank}");
        }
        cluster.authority().set_read_delay(Duration::ZERO);
        assert!(leaf.fetch_capability(handle).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_forwards_counted_off_root_only() {
        let cluster = cluster(3, 2);
        let cont = container(&cluster, vec![]);
        let root = cluster.node(cluster.root_rank()).unwrap();
        let leaf = cluster.node(cluster.leaf_rank()).unwrap();

        root.reserve(cont, 4).await.unwrap();
        root.update_property(cont, PropertySet::from(vec![Prop::Label("r".into())]))
            .await
            .unwrap();
        assert_eq!(root.stats().forwards, 0);

        leaf.reserve(cont, 4).await.unwrap();
        leaf.reserve(cont, 4).await.unwrap();
        assert_eq!(leaf.stats().forwards, 1);
        assert_eq!(root.stats().forwards, 0);
    }

    #[tokio::test]
    async fn test_agg_boundary_is_minimum_and_monotonic() {
        let cluster = cluster(4, 2);
        let cont = container(&cluster, vec![]);
        let root = cluster.node(cluster.root_rank()).unwrap();
        let leaf_rank = cluster.leaf_rank();
        let leaf = cluster.node(leaf_rank).unwrap();

        assert_eq!(leaf.refresh_agg_boundary(cont).await.unwrap(), 0);
        for (rank, epoch) in [(1, 40), (2, 25), (3, 60)] {
            cluster
                .node(Rank(rank))
                .unwrap()
                .report_agg_epoch(cont, epoch)
                .await
                .unwrap();
        }
        assert_eq!(
            cluster
                .host(cluster.root_rank())
                .unwrap()
                .reported(cont, Rank(2)),
            Some(25)
        );
        assert_eq!(root.refresh_agg_boundary(cont).await.unwrap(), 25);

        tokio::time::timeout(Duration::from_secs(5), async {
            while leaf.refresh_agg_boundary(cont).await.unwrap() != 25 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(cluster.host(leaf_rank).unwrap().boundary(cont), Some(25));

        // A lower report cannot pull the boundary back.
        cluster
            .node(Rank(2))
            .unwrap()
            .report_agg_epoch(cont, 10)
            .await
            .unwrap();
        assert_eq!(root.refresh_agg_boundary(cont).await.unwrap(), 25);
    }

    #[tokio::test]
    async fn test_agg_boundary_holds_across_invalidate() {
        let cluster = cluster(3, 2);
        let cont = container(&cluster, vec![]);
        let root = cluster.node(cluster.root_rank()).unwrap();
        let leaf = cluster.node(cluster.leaf_rank()).unwrap();

        for (rank, epoch) in [(1, 40), (2, 30)] {
            cluster
                .node(Rank(rank))
                .unwrap()
                .report_agg_epoch(cont, epoch)
                .await
                .unwrap();
        }
        assert_eq!(root.refresh_agg_boundary(cont).await.unwrap(), 30);
        tokio::time::timeout(Duration::from_secs(5), async {
            while leaf.refresh_agg_boundary(cont).await.unwrap() != 30 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        root.report_agg_epoch(cont, 5).await.unwrap();
        assert_eq!(root.refresh_agg_boundary(cont).await.unwrap(), 30);

        for node in [root, leaf] {
            node.invalidate(Some(cont), ClassId::AggEpoch, SyncMode::None)
                .await
                .unwrap();
            assert_eq!(node.refresh_agg_boundary(cont).await.unwrap(), 30);
        }
    }

    #[tokio::test]
    async fn test_authority_failure_reaches_caller() {
        let cluster = cluster(3, 2);
        let cont = container(&cluster, vec![Prop::Label("x".into())]);
        let leaf = cluster.node(cluster.leaf_rank()).unwrap();

        cluster.authority().set_available(false);
        let err = leaf
            .fetch_property(cont, PropType::KNOWN_MASK)
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        cluster.authority().set_available(true);
        leaf.fetch_property(cont, PropType::KNOWN_MASK).await.unwrap();
        cluster.authority().set_available(false);
        assert!(leaf.fetch_property(cont, PropType::KNOWN_MASK).await.is_ok());
        assert_eq!(leaf.stats().fetch_hits, 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_nodes() {
        let cluster = cluster(2, 2);
        let cont = container(&cluster, vec![]);
        cluster.shutdown();
        // The leaf can no longer reach its parent.
        let err = cluster
            .node(Rank(1))
            .unwrap()
            .snapshots(cont)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
