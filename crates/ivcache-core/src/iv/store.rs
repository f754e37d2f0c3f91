//! Per-node entry store
//!
//! Owned by the node actor; never shared, so it needs no locking.

use super::key::{IvKey, KeyFilter};
use crate::record::IvValue;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct EntryStore {
    entries: BTreeMap<IvKey, IvValue>,
}

impl EntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &IvKey) -> Option<&IvValue> {
        self.entries.get(key)
    }

    /// Commit a hook's slot: `Some` stores the value, `None` drops the entry
    pub fn put(&mut self, key: IvKey, slot: Option<IvValue>) {
        match slot {
            Some(value) => {
                self.entries.insert(key, value);
            }
            None => {
                self.entries.remove(&key);
            }
        }
    }

    /// Remove and return every entry the filter selects
    pub fn remove_matching(&mut self, filter: &KeyFilter) -> Vec<(IvKey, IvValue)> {
        let keys: Vec<IvKey> = self
            .entries
            .keys()
            .filter(|key| filter.matches(key))
            .copied()
            .collect();
        keys.into_iter()
            .filter_map(|key| self.entries.remove(&key).map(|value| (key, value)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
