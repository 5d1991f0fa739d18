use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use super::cache::{AssetCache, RecordRef};

/// A caller-owned token for a loaded asset.
///
/// A handle provides shared access to the asset and holds exactly one
/// reference on its cache key. Dropping the handle releases that reference;
/// cloning acquires another one. When the last reference to a key is gone,
/// the asset is unloaded and its dependencies are released.
pub struct Handle<T: Any + Send + Sync> {
    cache: AssetCache,
    record_ref: RecordRef,
    // `None` only after `detach` took the asset out, in which case `Drop`
    // must not release.
    asset: Option<Arc<T>>,
}

impl<T: Any + Send + Sync> Handle<T> {
    pub(crate) fn new(cache: AssetCache, record_ref: RecordRef, asset: Arc<T>) -> Self {
        Handle {
            cache,
            record_ref,
            asset: Some(asset),
        }
    }

    /// The location this asset was loaded from.
    pub fn location(&self) -> &str {
        self.record_ref.key().location()
    }

    /// Takes the asset out of the handle, transferring the release obligation
    /// to the caller.
    ///
    /// The reference held by this handle stays acquired; the caller must pair
    /// it with exactly one [`AssetCache::release`] for the same location and
    /// type.
    pub fn detach(mut self) -> Arc<T> {
        self.asset.take().expect("asset present until detach")
    }
}

impl<T: Any + Send + Sync> Deref for Handle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.asset.as_ref().expect("asset present until detach")
    }
}

impl<T: Any + Send + Sync> Clone for Handle<T> {
    fn clone(&self) -> Self {
        self.cache.retain_ref(&self.record_ref);
        Handle {
            cache: self.cache.clone(),
            record_ref: self.record_ref.clone(),
            asset: self.asset.clone(),
        }
    }
}

impl<T: Any + Send + Sync> Drop for Handle<T> {
    fn drop(&mut self) {
        if self.asset.is_some() {
            self.cache.release_ref(&self.record_ref);
        }
    }
}

impl<T: Any + Send + Sync + fmt::Debug> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("key", &self.record_ref.key().to_string())
            .field("asset", &self.asset)
            .finish()
    }
}
