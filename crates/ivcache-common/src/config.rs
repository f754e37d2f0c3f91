//! Configuration types for ivcache
//!
//! Every section has defaults so a partial TOML file is enough.

use serde::{Deserialize, Serialize};

/// Root configuration for an ivcache node
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node identity
    pub node: NodeConfig,
    /// Propagation tree shape
    pub tree: TreeConfig,
    /// Cache and allocator tuning
    pub cache: CacheConfig,
    /// Logging
    pub logging: LoggingConfig,
}

/// Node identity configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Rank of this node in the propagation tree
    pub rank: u32,
}

/// Propagation tree configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeConfig {
    /// Rank holding root authority
    pub root_rank: u32,
    /// Children per interior node
    pub fanout: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            root_rank: 0,
            fanout: 4,
        }
    }
}

/// Cache and allocator configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Granularity of object id batches requested from the root
    pub oid_block_unit: u64,
    /// First capacity tried when fetching a full snapshot list
    pub snapshot_initial_capacity: u32,
    /// Maximum fetch rounds while a snapshot list keeps outgrowing the capacity
    pub snapshot_fetch_rounds: u32,
    /// Depth of each node's command mailbox
    pub mailbox_depth: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            oid_block_unit: 32,
            snapshot_initial_capacity: 16,
            snapshot_fetch_rounds: 8,
            mailbox_depth: 1024,
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.node.rank, 0);
        assert_eq!(config.tree.fanout, 4);
        assert_eq!(config.cache.oid_block_unit, 32);
        assert_eq!(config.cache.snapshot_fetch_rounds, 8);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [tree]
            fanout = 2

            [cache]
            oid_block_unit = 64
            "#,
        )
        .unwrap();
        assert_eq!(config.tree.fanout, 2);
        assert_eq!(config.tree.root_rank, 0);
        assert_eq!(config.cache.oid_block_unit, 64);
        assert_eq!(config.cache.mailbox_depth, 1024);
    }
}
