//! # Asset caching infrastructure
//!
//! This module contains the core of the service: a reference-counted,
//! single-flight asset cache with dependency tracking. It deals with the
//! central [`CacheError`] type, the [`CacheKey`] derivation, and the record
//! table that keeps everything consistent under concurrency.
//!
//! ## Single-flight loading
//!
//! Every `(location, type)` pair maps to one [`CacheKey`] and at most one
//! record. The first caller to request a key creates its record and spawns
//! the one load task for it; every caller (including ones arriving while the
//! load is already running) awaits a clone of the record's shared future and
//! observes the same success or failure exactly once. Cancelling one caller's
//! wait neither cancels the underlying load nor disturbs delivery to the
//! remaining waiters.
//!
//! ## Dependencies
//!
//! Before an asset loads, its prerequisite locations (supplied by the
//! [`DependencyProvider`](crate::strategy::DependencyProvider)) are resolved
//! as untyped records. The owning record acquires each distinct dependency
//! key exactly once, and does so *before* waiting on it, so a concurrent
//! release elsewhere can never collect a dependency that is still needed.
//! Each dependency wait races against the configured timeout; the timeout
//! aborts only the waiting owner, not the dependency's own load.
//!
//! ## Reference counting and release
//!
//! A record's refcount counts live caller handles plus owning records. All
//! refcount mutations, table membership changes and acquired-dependency lists
//! are protected by one table-wide mutex that is never held across an await
//! point; assets and shared futures are immutable after publish and read
//! without it. When a release drops a count to zero the record is removed,
//! the strategy's `unload` runs, and the record's dependencies are pushed
//! onto an explicit worklist that is processed iteratively, so arbitrarily
//! deep chains cannot overflow the stack and diamond graphs release cleanly.
//!
//! ## Failure and rollback
//!
//! Any failure while resolving dependencies or running the strategy purges
//! the owning record and releases everything it had acquired *before* the
//! error reaches any waiter. A failed load is final for that attempt; the
//! next request for the key starts over with a fresh record. Every acquired
//! reference is pinned to the record generation it was taken on, so a
//! reference that outlives its record (a waiter dropped after a rollback, a
//! handle surviving disposal) releases as a no-op instead of touching a
//! successor record for the same key. Refcount underflow on a live record,
//! or a completed record without an asset, are logic errors and panic rather
//! than being papered over.

mod cache;
mod cache_error;
mod cache_key;
mod handle;
mod progress;

pub use cache::AssetCache;
pub use cache_error::{CacheEntry, CacheError};
pub use cache_key::{CacheKey, UntypedAsset};
pub use handle::Handle;
