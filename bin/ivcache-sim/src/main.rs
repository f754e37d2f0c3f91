//! ivcache simulator
//!
//! Boots an in-process propagation tree and drives every cache class
//! through it: concurrent object id reservations, snapshot list capacity
//! negotiation, property write-through, capability open/close and
//! aggregation boundaries. Exits non-zero if an invariant breaks.

use anyhow::{Context, Result, bail, ensure};
use clap::Parser;
use futures::future::join_all;
use ivcache_common::{Config, ContainerId, HandleId, Rank};
use ivcache_core::iv::StatsSnapshot;
use ivcache_core::prop::{Prop, PropType, PropertySet};
use ivcache_core::{ClusterBuilder, HandleRecord, LocalCluster, OidRange};
use rand::Rng;
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "ivcache-sim")]
#[command(about = "Drive the ivcache metadata cache over an in-process cluster")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "ivcache.toml")]
    config: PathBuf,

    /// Number of nodes in the tree
    #[arg(short, long, default_value = "8")]
    nodes: u32,

    /// Children per interior node (overrides tree.fanout)
    #[arg(long)]
    fanout: Option<usize>,

    /// Root rank (overrides tree.root_rank)
    #[arg(long)]
    root: Option<u32>,

    /// Containers to create
    #[arg(long, default_value = "4")]
    containers: usize,

    /// Reservations per node per container
    #[arg(long, default_value = "64")]
    reserves: usize,

    /// Log level
    #[arg(long, env = "IVCACHE_LOG", default_value = "info")]
    log_level: String,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct NodeReport {
    rank: u32,
    opens: u64,
    closes: u64,
    stats: StatsSnapshot,
}

#[derive(Debug, Default, Serialize)]
struct Report {
    nodes: u32,
    containers: usize,
    reservations: usize,
    ids_reserved: u64,
    snapshot_lists: usize,
    snapshot_epochs: usize,
    property_updates: usize,
    handles: usize,
    boundaries: Vec<u64>,
    authority_reads: u64,
    per_node: Vec<NodeReport>,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config: Config = if args.config.exists() {
        let text = std::fs::read_to_string(&args.config)
            .with_context(|| format!("reading {}", args.config.display()))?;
        toml::from_str(&text).unwrap_or_else(|e| {
            eprintln!("Warning: Failed to parse config file: {e}");
            Config::default()
        })
    } else {
        Config::default()
    };

    // CLI takes precedence
    if let Some(fanout) = args.fanout {
        config.tree.fanout = fanout;
    }
    if let Some(root) = args.root {
        config.tree.root_rank = root;
    }
    if args.log_level != "info" {
        config.logging.level.clone_from(&args.log_level);
    }
    Ok(config)
}

fn create_containers(cluster: &LocalCluster, count: usize) -> Result<Vec<ContainerId>> {
    let mut rng = rand::thread_rng();
    let mut containers = Vec::with_capacity(count);
    for i in 0..count {
        let cont = ContainerId::new();
        cluster.authority().create_container(
            cont,
            PropertySet::from(vec![
                Prop::Label(format!("sim-{i}")),
                Prop::RedunFac(rng.gen_range(1..=3)),
                Prop::SnapshotMax(64),
                Prop::Owner("sim@ivcache".into()),
            ]),
        );
        for _ in 0..rng.gen_range(0..48) {
            cluster
                .authority()
                .add_snapshot(cont, rng.gen_range(1..10_000))?;
        }
        containers.push(cont);
    }
    Ok(containers)
}

/// Every node reserves concurrently; all ranges of a container must be disjoint
async fn run_reservations(
    cluster: &LocalCluster,
    containers: &[ContainerId],
    per_node: usize,
    report: &mut Report,
) -> Result<()> {
    for cont in containers {
        let batches = join_all(cluster.nodes().map(|node| async move {
            let mut ranges = Vec::with_capacity(per_node);
            for _ in 0..per_node {
                let count = rand::thread_rng().gen_range(1..=100);
                ranges.push(node.reserve(*cont, count).await?);
            }
            Ok::<_, ivcache_common::Error>(ranges)
        }))
        .await;

        let mut ranges: Vec<OidRange> = Vec::new();
        for batch in batches {
            ranges.extend(batch?);
        }
        ranges.sort_by_key(|r| r.base);
        for pair in ranges.windows(2) {
            if pair[0].overlaps(&pair[1]) {
                bail!("{cont}: {:?} overlaps {:?}", pair[0], pair[1]);
            }
        }
        report.reservations += ranges.len();
        report.ids_reserved += ranges.iter().map(|r| r.count).sum::<u64>();
    }
    info!(
        "{} reservations, {} ids, all disjoint",
        report.reservations, report.ids_reserved
    );
    Ok(())
}

/// Each node reads every snapshot list, starting from a deliberately small capacity
async fn run_snapshots(
    cluster: &LocalCluster,
    containers: &[ContainerId],
    report: &mut Report,
) -> Result<()> {
    for node in cluster.nodes() {
        for cont in containers {
            let epochs = node.snapshots(*cont).await?;
            ensure!(
                epochs.windows(2).all(|w| w[0] < w[1]),
                "{cont}: snapshot list from {} is not ascending",
                node.rank()
            );
            report.snapshot_lists += 1;
            report.snapshot_epochs += epochs.len();
        }
    }
    Ok(())
}

/// Relabel each container from a leaf and check every node sees the result
async fn run_properties(
    cluster: &LocalCluster,
    containers: &[ContainerId],
    report: &mut Report,
) -> Result<()> {
    let leaf = cluster.node(cluster.leaf_rank())?;
    for (i, cont) in containers.iter().enumerate() {
        let label = Prop::Label(format!("sim-{i}-relabeled"));
        leaf.update_property(*cont, PropertySet::from(vec![label.clone()]))
            .await?;
        report.property_updates += 1;

        for node in cluster.nodes() {
            let props = node.fetch_property(*cont, PropType::Label.bit()).await?;
            ensure!(
                props.get(PropType::Label) == Some(&label),
                "{cont}: {} still sees {:?}",
                node.rank(),
                props.get(PropType::Label)
            );
        }
    }
    Ok(())
}

/// Open one handle per container everywhere, then close it from the root
async fn run_capabilities(
    cluster: &LocalCluster,
    containers: &[ContainerId],
    report: &mut Report,
) -> Result<()> {
    let root = cluster.node(cluster.root_rank())?;
    for cont in containers {
        let handle = HandleId::new();
        cluster.authority().put_handle(
            handle,
            HandleRecord {
                container: *cont,
                flags: 0x2,
                sec_capas: 0xff,
            },
        );
        for node in cluster.nodes() {
            let cap = node.fetch_capability(handle).await?;
            ensure!(cap.container == *cont, "handle {handle} resolved to the wrong container");
        }
        root.invalidate_capability(handle).await?;
        cluster.authority().remove_handle(handle);
        report.handles += 1;
    }
    Ok(())
}

async fn run_aggregation(
    cluster: &LocalCluster,
    containers: &[ContainerId],
    report: &mut Report,
) -> Result<()> {
    let root = cluster.node(cluster.root_rank())?;
    for cont in containers {
        for node in cluster.nodes().filter(|n| !n.is_root()) {
            let epoch = rand::thread_rng().gen_range(100..1_000);
            node.report_agg_epoch(*cont, epoch).await?;
        }
        let boundary = root.refresh_agg_boundary(*cont).await?;
        if boundary == 0 && cluster.ranks().len() > 1 {
            warn!("{cont}: no aggregation boundary after reports");
        }
        report.boundaries.push(boundary);
    }
    Ok(())
}

fn print_report(report: &Report, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("nodes:            {}", report.nodes);
    println!("containers:       {}", report.containers);
    println!(
        "reservations:     {} ({} ids)",
        report.reservations, report.ids_reserved
    );
    println!(
        "snapshot reads:   {} ({} epochs)",
        report.snapshot_lists, report.snapshot_epochs
    );
    println!("property updates: {}", report.property_updates);
    println!("handles:          {}", report.handles);
    println!("boundaries:       {:?}", report.boundaries);
    println!("authority reads:  {}", report.authority_reads);
    for node in &report.per_node {
        println!(
            "  rank {:>3}: hits {:>5} misses {:>5} forwards {:>5} opens {} closes {} (hit ratio {:.2})",
            node.rank,
            node.stats.fetch_hits,
            node.stats.fetch_misses,
            node.stats.forwards,
            node.opens,
            node.closes,
            node.stats.hit_ratio
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting ivcache simulator");
    info!(
        "Tree: {} nodes, root {}, fanout {}",
        args.nodes,
        Rank(config.tree.root_rank),
        config.tree.fanout
    );

    let cluster = ClusterBuilder::from_config(&config, args.nodes).build()?;
    let containers = create_containers(&cluster, args.containers)?;
    let mut report = Report {
        nodes: args.nodes,
        containers: containers.len(),
        ..Report::default()
    };

    run_reservations(&cluster, &containers, args.reserves, &mut report).await?;
    run_snapshots(&cluster, &containers, &mut report).await?;
    run_properties(&cluster, &containers, &mut report).await?;
    run_capabilities(&cluster, &containers, &mut report).await?;
    run_aggregation(&cluster, &containers, &mut report).await?;

    report.authority_reads = cluster.authority().reads();
    for node in cluster.nodes() {
        let host = cluster
            .host(node.rank())
            .context("node without a host")?;
        report.per_node.push(NodeReport {
            rank: node.rank().0,
            opens: host.open_count(),
            closes: host.close_count(),
            stats: node.stats(),
        });
    }

    cluster.shutdown();
    print_report(&report, args.json)?;
    info!("Simulation complete");
    Ok(())
}
