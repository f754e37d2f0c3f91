//! Incast variable plumbing
//!
//! A tree of node actors caching keyed records. Misses resolve through the
//! parent up to the root, updates that cannot be applied locally are
//! forwarded straight to the root, and the root pushes applied values back
//! down according to each class's sync mode.

mod class;
mod fabric;
mod key;
mod node;
mod stats;
mod store;

pub use class::{ClassCtx, ClassRegistry, FetchRequest, IvClass, UpdateOutcome};
pub use fabric::{Fabric, LocalFabric, Push, children_of, parent_of, tree_order};
pub use key::{IvKey, KeyFilter};
pub use node::NodeHandle;
pub use stats::{IvStats, StatsSnapshot};
pub use store::EntryStore;
