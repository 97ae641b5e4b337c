use std::fmt::Debug;
use std::hash::Hash;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use thiserror::Error;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum RegistryError {
    #[error("registry is closed")]
    Closed,
    #[error("duplicate key {0}")]
    Duplicate(String),
}

/// A concurrent map of live handles by ID. Lookups happen on the dispatch path while callers
///  insert and remove concurrently.
///
/// Once closed, the registry is empty and stays empty.
pub struct Registry<K, V> {
    state: RwLock<RegistryState<K, V>>,
}

struct RegistryState<K, V> {
    closed: bool,
    entries: FxHashMap<K, V>,
}

impl<K: Hash + Eq + Copy + Debug, V: Clone> Registry<K, V> {
    pub fn new() -> Registry<K, V> {
        Registry {
            state: RwLock::new(RegistryState {
                closed: false,
                entries: Default::default(),
            }),
        }
    }

    pub fn insert(&self, key: K, value: V) -> Result<(), RegistryError> {
        let mut state = self.state.write();
        if state.closed {
            return Err(RegistryError::Closed);
        }
        if state.entries.contains_key(&key) {
            return Err(RegistryError::Duplicate(format!("{:?}", key)));
        }
        state.entries.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: K) -> Option<V> {
        self.state.read().entries.get(&key).cloned()
    }

    pub fn remove(&self, key: K) -> Option<V> {
        self.state.write().entries.remove(&key)
    }

    /// Returns the entries that were registered
    pub fn close(&self) -> Vec<V> {
        let mut state = self.state.write();
        state.closed = true;
        state.entries.drain().map(|(_, v)| v).collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
