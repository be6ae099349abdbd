//! Response memoization keyed by message identity.
//!
//! [`DedupCache`] maps a request's message id to the encoded response that was
//! sent for it, so a retransmitted request is answered with identical bytes
//! instead of being applied again. Eviction is FIFO by insertion order once the
//! byte budget is exceeded; lookups do not refresh an entry.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Default byte budget for message ids plus response bytes (8 MiB).
pub const DEFAULT_CACHE_MAX_BYTES: usize = 8 * 1024 * 1024;

pub struct DedupCache {
    inner: RwLock<CacheInner>,
    max_bytes: usize,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<Vec<u8>, Arc<[u8]>>,
    order: VecDeque<Vec<u8>>,
    used_bytes: usize,
}

impl DedupCache {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: RwLock::new(CacheInner::default()),
            max_bytes,
        }
    }

    /// Records `response` for `message_id`, then evicts the oldest insertions
    /// until the cache is back under budget.
    ///
    /// Re-inserting a present id replaces its bytes and moves it to the back of
    /// the eviction order, as if it had never been inserted before.
    pub fn put(&self, message_id: &[u8], response: &[u8]) {
        let mut inner = self.write();

        if let Some(previous) = inner.entries.remove(message_id) {
            inner.used_bytes -= message_id.len() + previous.len();
            if let Some(pos) = inner.order.iter().position(|id| id == message_id) {
                inner.order.remove(pos);
            }
        }

        inner
            .entries
            .insert(message_id.to_vec(), Arc::from(response));
        inner.order.push_back(message_id.to_vec());
        inner.used_bytes += message_id.len() + response.len();

        while inner.used_bytes > self.max_bytes {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            if let Some(evicted) = inner.entries.remove(&oldest) {
                inner.used_bytes -= oldest.len() + evicted.len();
            }
        }
    }

    pub fn contains_key(&self, message_id: &[u8]) -> bool {
        self.read().entries.contains_key(message_id)
    }

    pub fn get(&self, message_id: &[u8]) -> Option<Arc<[u8]>> {
        self.read().entries.get(message_id).cloned()
    }

    pub fn used_bytes(&self) -> usize {
        self.read().used_bytes
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_MAX_BYTES)
    }
}
