use std::time::Duration;

use thiserror::Error;

/// An error that happens while loading an asset or waiting for one of its
/// dependencies.
///
/// A failed load is final for that attempt: the failing record is rolled back
/// before the error is delivered, and a subsequent request starts from
/// scratch with a fresh record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The strategy found no asset at the requested location.
    #[error("not found")]
    NotFound,
    /// The loaded asset is not of the type it was requested as.
    ///
    /// The key derivation makes it impossible for two types to share a
    /// record, so hitting this means the strategy returned a payload of the
    /// wrong type.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    /// A dependency did not finish loading within the configured deadline.
    ///
    /// This aborts only the waiting owner's attempt; the dependency's own
    /// load keeps running for any other consumer.
    #[error("dependency wait timed out after {0:?}")]
    Timeout(Duration),
    /// The caller's cancellation token fired while waiting.
    #[error("cancelled")]
    Cancelled,
    /// The strategy failed to load the asset.
    ///
    /// The attached string carries the strategy's own description.
    #[error("load failed: {0}")]
    LoadFailed(String),
    /// An unexpected error in the cache itself.
    #[error("internal error")]
    InternalError,
}

impl CacheError {
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }
}

/// The result of a cache operation, containing either `Ok(T)` or the reason
/// why the asset could not be provided.
pub type CacheEntry<T = ()> = Result<T, CacheError>;
