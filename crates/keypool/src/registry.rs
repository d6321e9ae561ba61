//! Registry of key pools, one per provider group.
//!
//! The registry is an owned value the host application constructs and hands
//! to the agent engine — lookup-or-create semantics without hidden global
//! state, so tests stay hermetic. Within one registry there is exactly one
//! pool per group id for the registry's lifetime.

use crate::pool::KeyPool;
use reagent_core::error::PoolError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Owns every [`KeyPool`] in use by one host application.
#[derive(Debug, Default)]
pub struct KeyPoolRegistry {
    pools: Mutex<HashMap<String, Arc<KeyPool>>>,
}

impl KeyPoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The pool for `group_id`, creating it from `keys` on first request.
    ///
    /// An existing pool is returned as-is; its key set is never mutated by
    /// later `acquire` calls, even with a different `keys` argument.
    pub fn acquire(
        &self,
        group_id: &str,
        keys: &[String],
    ) -> Result<Arc<KeyPool>, PoolError> {
        let mut pools = self
            .pools
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        if let Some(pool) = pools.get(group_id) {
            return Ok(pool.clone());
        }

        let pool = Arc::new(KeyPool::new(group_id, keys.iter().cloned())?);
        debug!(group = group_id, keys = keys.len(), "key pool created");
        pools.insert(group_id.to_string(), pool.clone());
        Ok(pool)
    }

    /// The pool for `group_id`, if one has been created.
    pub fn get(&self, group_id: &str) -> Option<Arc<KeyPool>> {
        self.pools
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(group_id)
            .cloned()
    }

    /// Group ids with live pools.
    pub fn groups(&self) -> Vec<String> {
        self.pools
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}
