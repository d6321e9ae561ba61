//! # Reagent Key Pool
//!
//! Spreads concurrent model calls across a pool of credentials so no single
//! credential is overloaded. Each pool tracks the in-flight load of every
//! key and hands out the least-loaded one on demand.
//!
//! Selection and reservation are separate steps: [`KeyPool::least_loaded`]
//! is a pure read, and the subsequent [`KeyPool::increment`] is the true
//! reservation point. [`KeyLease`] bundles the two and releases on drop, so
//! the increment/decrement pairing holds on every exit path.
//!
//! Pools are owned by a [`KeyPoolRegistry`] the host application constructs
//! and passes to the engine — there is no process-wide singleton.

pub mod pool;
pub mod registry;

pub use pool::{KeyLease, KeyPool};
pub use registry::KeyPoolRegistry;
