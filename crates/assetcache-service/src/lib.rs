pub mod caching;
pub mod config;
pub mod logging;
pub mod strategy;
pub mod utils;

pub use caching::{AssetCache, CacheEntry, CacheError, CacheKey, Handle};
pub use config::Config;
pub use strategy::{
    DependencyProvider, ErasedAsset, EventSink, LoadingStrategy, NoDependencies, ProgressSink,
    ResourceEvent,
};
