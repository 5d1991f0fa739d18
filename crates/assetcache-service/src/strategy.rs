//! Contracts for the external collaborators of the asset cache.
//!
//! The cache itself never performs I/O or deserialization. All of that is
//! delegated to a [`LoadingStrategy`], while prerequisite lookup goes through
//! a [`DependencyProvider`]. Both are injected at construction time, so the
//! cache carries no global state.

use std::any::Any;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::caching::CacheEntry;

/// A type-erased, shareable asset payload.
///
/// The cache stores assets in erased form; typed access happens via downcast
/// at the public surface, where the [`CacheKey`](crate::caching::CacheKey)
/// guarantees the stored type matches the requested one.
pub type ErasedAsset = Arc<dyn Any + Send + Sync>;

/// Sink for progress reports emitted by a [`LoadingStrategy`] while an asset
/// loads. Values are fractions in `0.0..=1.0`.
pub type ProgressSink = Arc<dyn Fn(f32) + Send + Sync>;

/// Performs the physical load and unload of assets for the cache.
///
/// [`load`](Self::load) is called exactly once per cache key, no matter how
/// many concurrent callers requested it. [`unload`](Self::unload) is called
/// exactly once when the last reference to a loaded asset is released.
pub trait LoadingStrategy: Send + Sync + 'static {
    /// Loads the asset at `location`.
    ///
    /// `kind` is the type name the asset was requested as. Progress should be
    /// reported through `progress`; `token` fires when the cache is disposed,
    /// not when an individual caller gives up.
    fn load<'a>(
        &'a self,
        location: &'a str,
        kind: &'static str,
        progress: ProgressSink,
        token: CancellationToken,
    ) -> BoxFuture<'a, CacheEntry<ErasedAsset>>;

    /// Disposes a previously loaded asset.
    fn unload(&self, location: &str, asset: ErasedAsset);

    /// One-time initialization of the backend.
    fn initialize(&self) -> BoxFuture<'_, CacheEntry> {
        Box::pin(async { Ok(()) })
    }

    /// Asks the backend to free resources that are not referenced anymore.
    fn unload_unused<'a>(&'a self, _token: CancellationToken) -> BoxFuture<'a, CacheEntry> {
        Box::pin(async { Ok(()) })
    }
}

/// Supplies the prerequisite locations for a given asset location.
///
/// Dependencies are resolved before the asset itself loads, and are tracked
/// as untyped records keyed by [`CacheKey::untyped`](crate::caching::CacheKey::untyped).
pub trait DependencyProvider: Send + Sync + 'static {
    /// Returns the ordered list of locations that must finish loading before
    /// `location` can load. May be empty.
    fn dependencies_of(&self, location: &str) -> Vec<String>;
}

/// A [`DependencyProvider`] for backends whose assets have no prerequisites.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDependencies;

impl DependencyProvider for NoDependencies {
    fn dependencies_of(&self, _location: &str) -> Vec<String> {
        Vec::new()
    }
}

/// Lifecycle notifications broadcast by the cache.
#[derive(Debug, Clone)]
pub enum ResourceEvent {
    /// An asset finished loading and was published to its waiters.
    Loaded { location: Arc<str>, kind: &'static str },
    /// A load failed; the record and its acquired dependencies were rolled back.
    LoadFailed {
        location: Arc<str>,
        kind: &'static str,
        error: crate::caching::CacheError,
    },
    /// The last reference to an asset was released and it was unloaded.
    Unloaded { location: Arc<str>, kind: &'static str },
}

/// Receives [`ResourceEvent`]s, typically to forward them onto an event bus.
pub trait EventSink: Send + Sync + 'static {
    fn publish(&self, event: ResourceEvent);
}
