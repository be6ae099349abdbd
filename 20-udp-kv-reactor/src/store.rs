//! Byte-budgeted in-memory key-value storage.
//!
//! [`BoundedStore`] is the state that requests mutate. It never evicts: a
//! `put` that does not fit under the budget is rejected and the store is
//! left untouched.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;

/// Default byte budget for keys plus values (80 MiB).
pub const DEFAULT_STORE_MAX_BYTES: usize = 80 * 1024 * 1024;

/// A value together with the client-supplied version it was written with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub value: Vec<u8>,
    pub version: i32,
}

/// Thread-safe key-value store with a hard ceiling on `len(key) + len(value)`
/// summed over all live entries.
///
/// Mutations (`put`, `remove`, `wipe`) serialize on a single mutation lock
/// that also guards the byte count. Entries live in a sharded concurrent map,
/// so `get` never takes the mutation lock and sees each key either before or
/// after a concurrent write to it.
pub struct BoundedStore {
    entries: DashMap<Vec<u8>, Arc<StoredEntry>>,
    used_bytes: Mutex<usize>,
    max_bytes: usize,
}

impl BoundedStore {
    /// Creates an empty store that holds at most `max_bytes` of keys plus values.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            entries: DashMap::new(),
            used_bytes: Mutex::new(0),
            max_bytes,
        }
    }

    /// Inserts or replaces the entry for `key`.
    ///
    /// Returns `false` without mutating anything when the write would push
    /// the used bytes over the budget. The size of an existing entry for the
    /// same key is credited back before the check.
    pub fn put(&self, key: &[u8], value: Vec<u8>, version: i32) -> bool {
        let mut used = self.lock_mutations();
        let existing = self
            .entries
            .get(key)
            .map(|entry| key.len() + entry.value.len())
            .unwrap_or(0);
        let projected = *used - existing + key.len() + value.len();
        if projected > self.max_bytes {
            return false;
        }

        self.entries
            .insert(key.to_vec(), Arc::new(StoredEntry { value, version }));
        *used = projected;
        true
    }

    /// Current entry for `key`, if any. Does not wait for in-progress
    /// mutations of other keys.
    pub fn get(&self, key: &[u8]) -> Option<Arc<StoredEntry>> {
        self.entries.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Deletes `key`. Returns `false` if it was not present.
    pub fn remove(&self, key: &[u8]) -> bool {
        let mut used = self.lock_mutations();
        match self.entries.remove(key) {
            Some((_, entry)) => {
                *used -= key.len() + entry.value.len();
                true
            }
            None => false,
        }
    }

    /// Drops every entry and resets the byte count.
    pub fn wipe(&self) {
        let mut used = self.lock_mutations();
        self.entries.clear();
        *used = 0;
    }

    pub fn used_bytes(&self) -> usize {
        *self.lock_mutations()
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn lock_mutations(&self) -> MutexGuard<'_, usize> {
        self.used_bytes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for BoundedStore {
    fn default() -> Self {
        Self::new(DEFAULT_STORE_MAX_BYTES)
    }
}
