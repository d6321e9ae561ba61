//! The least-loaded key pool.
//!
//! A binary min-heap ordered by load, paired with a key → heap-slot map:
//! `least_loaded` peeks the root in O(1), `increment`/`decrement` locate
//! the key's slot in O(1) and resift it in O(log N). Every swap during a
//! sift updates the moved entries' slots, or the O(1) lookup breaks.
//!
//! All operations on one pool serialize on a single `std::sync::Mutex`;
//! none of them suspend. Two pools never contend.

use reagent_core::error::PoolError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// One heap entry: a credential and its in-flight call count.
#[derive(Debug, Clone)]
struct LoadEntry {
    load: i64,
    key: String,
}

#[derive(Debug)]
struct PoolInner {
    heap: Vec<LoadEntry>,
    /// key → current heap slot. Invariant: `slots[heap[i].key] == i`.
    slots: HashMap<String, usize>,
}

/// A per-credential-group load tracker handing out the least-loaded key.
///
/// The key set is fixed at construction; loads start at 0 and are mutated
/// only by [`increment`](KeyPool::increment) / [`decrement`](KeyPool::decrement).
#[derive(Debug)]
pub struct KeyPool {
    group_id: String,
    inner: Mutex<PoolInner>,
}

impl KeyPool {
    /// Build a pool for `group_id` with every key's load seeded at 0.
    ///
    /// Duplicate keys are collapsed. Fails with [`PoolError::EmptyKeySet`]
    /// if no keys remain.
    pub fn new(
        group_id: impl Into<String>,
        keys: impl IntoIterator<Item = String>,
    ) -> Result<Self, PoolError> {
        let group_id = group_id.into();

        let mut heap = Vec::new();
        let mut slots = HashMap::new();
        for key in keys {
            if slots.contains_key(&key) {
                continue;
            }
            slots.insert(key.clone(), heap.len());
            heap.push(LoadEntry { load: 0, key });
        }

        if heap.is_empty() {
            return Err(PoolError::EmptyKeySet { pool: group_id });
        }

        // All loads equal zero, so the insertion order is already a valid
        // min-heap and ties resolve to the first-configured key.
        Ok(Self {
            group_id,
            inner: Mutex::new(PoolInner { heap, slots }),
        })
    }

    /// The provider group this pool serves.
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Number of keys in the pool.
    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A key with the current minimum load.
    ///
    /// Read-only: the caller must [`increment`](KeyPool::increment) to
    /// reserve the key before use.
    pub fn least_loaded(&self) -> Result<String, PoolError> {
        let inner = self.lock();
        inner
            .heap
            .first()
            .map(|entry| entry.key.clone())
            .ok_or_else(|| PoolError::Exhausted {
                pool: self.group_id.clone(),
            })
    }

    /// The current load of `key`.
    pub fn load_of(&self, key: &str) -> Result<i64, PoolError> {
        let inner = self.lock();
        let slot = *inner
            .slots
            .get(key)
            .ok_or_else(|| self.unknown(key))?;
        Ok(inner.heap[slot].load)
    }

    /// Attribute one more in-flight call to `key`.
    pub fn increment(&self, key: &str) -> Result<(), PoolError> {
        self.adjust(key, 1)
    }

    /// Release one in-flight call from `key`.
    ///
    /// A decrement on a key already at 0 drives the load negative rather
    /// than clamping: clamping would silently break load conservation and
    /// mask the double release. The anomaly is logged instead.
    pub fn decrement(&self, key: &str) -> Result<(), PoolError> {
        self.adjust(key, -1)
    }

    fn adjust(&self, key: &str, delta: i64) -> Result<(), PoolError> {
        let mut inner = self.lock();
        let slot = *inner
            .slots
            .get(key)
            .ok_or_else(|| self.unknown(key))?;

        let new_load = inner.heap[slot].load + delta;
        inner.heap[slot].load = new_load;

        if new_load < 0 {
            warn!(
                pool = %self.group_id,
                key_suffix = %suffix(key),
                load = new_load,
                "key load went negative; decrement without matching increment"
            );
        }

        if delta < 0 {
            inner.sift_toward_root(slot);
        } else {
            inner.sift_toward_leaves(slot);
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        // A poisoned mutex means a panic mid-sift on another thread; the
        // heap data itself is still structurally usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn unknown(&self, key: &str) -> PoolError {
        PoolError::UnknownKey {
            pool: self.group_id.clone(),
            key: key.to_string(),
        }
    }
}

impl PoolInner {
    /// Move the entry at `pos` toward the root while it is lighter than its
    /// parent, keeping the slot map in step with every swap.
    fn sift_toward_root(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.heap[pos].load >= self.heap[parent].load {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
    }

    /// Move the entry at `pos` toward the leaves while it is heavier than
    /// its lightest child.
    fn sift_toward_leaves(&mut self, mut pos: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * pos + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let lightest = if right < len && self.heap[right].load < self.heap[left].load {
                right
            } else {
                left
            };
            if self.heap[pos].load <= self.heap[lightest].load {
                break;
            }
            self.swap(pos, lightest);
            pos = lightest;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        let key_a = self.heap[a].key.clone();
        let key_b = self.heap[b].key.clone();
        self.slots.insert(key_a, a);
        self.slots.insert(key_b, b);
    }
}

/// Last few characters of a key, safe for logs.
fn suffix(key: &str) -> &str {
    key.get(key.len().saturating_sub(4)..).unwrap_or("")
}

/// An RAII reservation of the least-loaded key in a pool.
///
/// `acquire` selects and increments in one call; dropping the lease
/// decrements unconditionally, which keeps the pairing intact on error and
/// cancellation paths.
#[derive(Debug)]
pub struct KeyLease {
    pool: Arc<KeyPool>,
    key: String,
}

impl KeyLease {
    /// Reserve the currently least-loaded key of `pool`.
    pub fn acquire(pool: Arc<KeyPool>) -> Result<Self, PoolError> {
        let key = pool.least_loaded()?;
        pool.increment(&key)?;
        Ok(Self { pool, key })
    }

    /// The reserved credential.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyLease {
    fn drop(&mut self) {
        if let Err(e) = self.pool.decrement(&self.key) {
            warn!(pool = %self.pool.group_id(), error = %e, "failed to release key lease");
        }
    }
}
