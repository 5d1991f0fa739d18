use std::any::Any;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::strategy::{
    DependencyProvider, ErasedAsset, EventSink, LoadingStrategy, ProgressSink, ResourceEvent,
};
use crate::utils::defer::defer;

use super::cache_key::CacheKey;
use super::handle::Handle;
use super::progress::{BatchProgress, ProgressBroadcast, ProgressCallback};
use super::{CacheEntry, CacheError};

/// The load result as observed by every waiter of a key.
///
/// This resolves exactly once, from the key's single load task. Waiters poll
/// a clone of it; dropping a waiter never disturbs the load itself.
type SharedEntry = Shared<BoxFuture<'static, CacheEntry<ErasedAsset>>>;

/// The sending half paired with a record's [`SharedEntry`]. Whoever holds it
/// is obligated to run the load task for the record.
type LoadSlot = oneshot::Sender<CacheEntry<ErasedAsset>>;

/// One acquired reference: a key pinned to the record generation it was
/// acquired on. Releasing through it cannot touch a successor record that was
/// created for the same key after the original was purged.
#[derive(Clone)]
pub(crate) struct RecordRef {
    key: CacheKey,
    epoch: u64,
}

impl RecordRef {
    pub(crate) fn key(&self) -> &CacheKey {
        &self.key
    }
}

/// Per-key bookkeeping for one cached resource.
struct Record {
    /// Distinguishes this record from earlier and later records for the same
    /// key. Releases carry the epoch they were acquired under.
    epoch: u64,
    /// Outstanding references: one per live caller, plus one per owner record
    /// that acquired this key as a dependency.
    refcount: isize,
    /// Dependency references acquired by this record, one per distinct key.
    deps: Vec<RecordRef>,
    /// Set until the load task has published its result.
    loading: bool,
    /// The resolved asset. `Some` once the load succeeded; a failed load
    /// never leaves its record in the table.
    asset: Option<ErasedAsset>,
    /// The shared load result.
    shared: SharedEntry,
    /// Multicast sink for progress reports from the load task.
    progress: Arc<ProgressBroadcast>,
}

/// A freshly created record, to be driven by exactly one load task.
struct NewLoad {
    slot: LoadSlot,
    progress: Arc<ProgressBroadcast>,
}

struct CacheInner {
    config: Config,
    strategy: Arc<dyn LoadingStrategy>,
    dependencies: Arc<dyn DependencyProvider>,
    events: Option<Arc<dyn EventSink>>,
    runtime: tokio::runtime::Handle,
    /// Fires when the cache is disposed; in-flight strategy loads observe it
    /// through their token.
    shutdown: CancellationToken,
    /// Source of record epochs.
    epochs: AtomicU64,
    /// The record table. The lock protects table membership, refcounts and
    /// acquired-dependency lists, and is never held across an `.await`.
    records: Mutex<FxHashMap<CacheKey, Record>>,
}

/// Asynchronous, reference-counted asset cache.
///
/// Loads every `(location, type)` pair exactly once no matter how many
/// callers request it concurrently, resolves declared dependencies before the
/// asset itself, and unloads assets (cascading through their dependencies)
/// once the last reference is released.
///
/// Cloning is cheap and shares the underlying state.
#[derive(Clone)]
pub struct AssetCache {
    inner: Arc<CacheInner>,
}

impl std::fmt::Debug for AssetCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let records = self
            .inner
            .records
            .try_lock()
            .map(|r| r.len())
            .unwrap_or_default();
        f.debug_struct("AssetCache")
            .field("config", &self.inner.config)
            .field("records", &records)
            .finish()
    }
}

impl AssetCache {
    /// Creates a cache over the given collaborators.
    ///
    /// Load tasks are spawned on `runtime`, detached from the callers that
    /// trigger them.
    pub fn new(
        config: Config,
        strategy: Arc<dyn LoadingStrategy>,
        dependencies: Arc<dyn DependencyProvider>,
        events: Option<Arc<dyn EventSink>>,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        AssetCache {
            inner: Arc::new(CacheInner {
                config,
                strategy,
                dependencies,
                events,
                runtime,
                shutdown: CancellationToken::new(),
                epochs: AtomicU64::new(0),
                records: Mutex::new(FxHashMap::default()),
            }),
        }
    }

    /// Loads the asset at `location` as type `T`.
    ///
    /// Concurrent calls for the same key share one physical load. The
    /// returned [`Handle`] releases its reference when dropped. Cancelling
    /// `token` abandons only this caller's wait; the shared load keeps
    /// running for everyone else.
    pub async fn load<T: Any + Send + Sync>(
        &self,
        location: &str,
        token: CancellationToken,
    ) -> CacheEntry<Handle<T>> {
        self.load_impl(location, None, token).await
    }

    /// Like [`load`](Self::load), but also subscribes `progress` to the load
    /// task's progress reports (fractions in `0.0..=1.0`).
    pub async fn load_with_progress<T: Any + Send + Sync>(
        &self,
        location: &str,
        progress: impl Fn(f32) + Send + Sync + 'static,
        token: CancellationToken,
    ) -> CacheEntry<Handle<T>> {
        self.load_impl(location, Some(Box::new(progress)), token)
            .await
    }

    /// Loads several locations as one logical operation.
    ///
    /// All items run to completion even if one fails, so that no item leaks
    /// the reference it acquired; the first failure is then surfaced and the
    /// successfully loaded handles are dropped (and thereby released).
    pub async fn load_batch<T: Any + Send + Sync>(
        &self,
        locations: &[impl AsRef<str>],
        token: CancellationToken,
    ) -> CacheEntry<Vec<Handle<T>>> {
        self.load_batch_impl(locations, None, token).await
    }

    /// Like [`load_batch`](Self::load_batch), reporting the arithmetic mean
    /// of the items' most recent progress values to `progress`.
    pub async fn load_batch_with_progress<T: Any + Send + Sync>(
        &self,
        locations: &[impl AsRef<str>],
        progress: impl Fn(f32) + Send + Sync + 'static,
        token: CancellationToken,
    ) -> CacheEntry<Vec<Handle<T>>> {
        self.load_batch_impl(locations, Some(Box::new(progress)), token)
            .await
    }

    /// Releases one reference on `(location, T)`.
    ///
    /// Counterpart to [`Handle::detach`]; handles that are simply dropped
    /// release themselves.
    pub fn release<T: Any + Send + Sync>(&self, location: &str) {
        self.release_key(&CacheKey::for_asset::<T>(location));
    }

    /// Releases one reference on each of the given locations.
    pub fn release_batch<T: Any + Send + Sync>(
        &self,
        locations: impl IntoIterator<Item = impl AsRef<str>>,
    ) {
        for location in locations {
            self.release_key(&CacheKey::for_asset::<T>(location.as_ref()));
        }
    }

    /// Asks the strategy to free backend resources that are no longer used.
    pub async fn unload_unused(&self, token: CancellationToken) -> CacheEntry {
        self.inner.strategy.unload_unused(token).await
    }

    /// Kicks off strategy initialization without waiting for it.
    ///
    /// Failures are logged; use [`init_async`](Self::init_async) to observe
    /// them.
    pub fn init(&self) {
        let cache = self.clone();
        self.inner.runtime.spawn(async move {
            if let Err(error) = cache.inner.strategy.initialize().await {
                tracing::error!(%error, "strategy initialization failed");
            }
        });
    }

    /// Initializes the strategy and waits for it to finish.
    pub async fn init_async(&self) -> CacheEntry {
        self.inner.strategy.initialize().await
    }

    /// Tears the cache down: cancels in-flight strategy work, drains the
    /// record table and unloads every resolved asset.
    ///
    /// Handles outliving the cache release into the drained table, which is
    /// a no-op.
    pub fn dispose(&self) {
        self.inner.shutdown.cancel();
        let records = std::mem::take(&mut *self.inner.records.lock().unwrap());
        for (key, record) in records {
            if let Some(asset) = record.asset {
                self.inner.strategy.unload(key.location(), asset);
                self.publish(ResourceEvent::Unloaded {
                    location: key.location_arc(),
                    kind: key.type_name(),
                });
            }
        }
    }

    async fn load_impl<T: Any + Send + Sync>(
        &self,
        location: &str,
        progress: Option<ProgressCallback>,
        token: CancellationToken,
    ) -> CacheEntry<Handle<T>> {
        let key = CacheKey::for_asset::<T>(location);
        let (shared, broadcast, epoch, new_load) = self.acquire(&key);
        if let Some(callback) = progress {
            broadcast.subscribe(callback);
        }
        if let Some(new_load) = new_load {
            self.spawn_load(key.clone(), new_load);
        }

        let record_ref = RecordRef {
            key: key.clone(),
            epoch,
        };

        // The reference acquired above must be balanced on every exit path,
        // including this future being dropped mid-wait.
        let release_guard = defer({
            let cache = self.clone();
            let record_ref = record_ref.clone();
            move || cache.release_ref(&record_ref)
        });

        let entry = tokio::select! {
            _ = token.cancelled() => return Err(CacheError::Cancelled),
            entry = shared => entry,
        };

        match entry {
            Ok(asset) => match asset.downcast::<T>() {
                Ok(asset) => {
                    // The handle takes over the acquired reference.
                    release_guard.disarm();
                    Ok(Handle::new(self.clone(), record_ref, asset))
                }
                Err(_) => Err(CacheError::TypeMismatch(format!(
                    "asset at {location} is not a {}",
                    key.type_name()
                ))),
            },
            Err(error) => {
                // Rollback already purged the record together with every
                // outstanding reference, ours included.
                release_guard.disarm();
                Err(error)
            }
        }
    }

    async fn load_batch_impl<T: Any + Send + Sync>(
        &self,
        locations: &[impl AsRef<str>],
        progress: Option<ProgressCallback>,
        token: CancellationToken,
    ) -> CacheEntry<Vec<Handle<T>>> {
        let batch = progress.map(|callback| BatchProgress::new(locations.len(), callback));

        let items = locations.iter().enumerate().map(|(index, location)| {
            let item_progress = batch.as_ref().map(|batch| batch.subscriber(index));
            self.load_impl::<T>(location.as_ref(), item_progress, token.clone())
        });
        let results = futures::future::join_all(items).await;

        let mut handles = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(handle) => handles.push(handle),
                Err(error) => {
                    first_error.get_or_insert(error);
                }
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(handles),
        }
    }

    /// Looks a record up or creates it, acquiring one reference either way.
    ///
    /// If a record was created, the returned [`NewLoad`] obligates the caller
    /// to spawn exactly one load task for it.
    fn acquire(
        &self,
        key: &CacheKey,
    ) -> (SharedEntry, Arc<ProgressBroadcast>, u64, Option<NewLoad>) {
        let mut records = self.inner.records.lock().unwrap();
        match records.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                record.refcount += 1;
                (
                    record.shared.clone(),
                    record.progress.clone(),
                    record.epoch,
                    None,
                )
            }
            Entry::Vacant(entry) => {
                tracing::trace!(key = %key, "creating record");
                let epoch = self.inner.epochs.fetch_add(1, Ordering::Relaxed);
                let (slot, shared) = make_shared_entry();
                let progress = Arc::new(ProgressBroadcast::default());
                entry.insert(Record {
                    epoch,
                    refcount: 1,
                    deps: Vec::new(),
                    loading: true,
                    asset: None,
                    shared: shared.clone(),
                    progress: progress.clone(),
                });
                (
                    shared,
                    progress.clone(),
                    epoch,
                    Some(NewLoad { slot, progress }),
                )
            }
        }
    }

    /// Acquires `dep` on behalf of `owner`, before the owner starts waiting
    /// on it, so that a concurrent release elsewhere cannot collect it.
    ///
    /// Counts each distinct dependency key once per owner, no matter how many
    /// edges reference it.
    fn acquire_dependency(&self, owner: &CacheKey, dep: &CacheKey) -> DependencyAcquire {
        let mut records = self.inner.records.lock().unwrap();
        match records.get(owner) {
            Some(record) if record.deps.iter().any(|dep_ref| dep_ref.key == *dep) => {
                return DependencyAcquire::Duplicate;
            }
            Some(_) => {}
            // The owner was purged while its load task was still running
            // (cache disposal); there is nothing left to acquire for.
            None => return DependencyAcquire::OwnerGone,
        }

        let (shared, epoch, new_load) = match records.entry(dep.clone()) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                record.refcount += 1;
                (record.shared.clone(), record.epoch, None)
            }
            Entry::Vacant(entry) => {
                tracing::trace!(key = %dep, "creating dependency record");
                let epoch = self.inner.epochs.fetch_add(1, Ordering::Relaxed);
                let (slot, shared) = make_shared_entry();
                let progress = Arc::new(ProgressBroadcast::default());
                entry.insert(Record {
                    epoch,
                    refcount: 1,
                    deps: Vec::new(),
                    loading: true,
                    asset: None,
                    shared: shared.clone(),
                    progress: progress.clone(),
                });
                (shared, epoch, Some(NewLoad { slot, progress }))
            }
        };

        let owner_record = records.get_mut(owner).expect("owner checked above");
        owner_record.deps.push(RecordRef {
            key: dep.clone(),
            epoch,
        });

        DependencyAcquire::Acquired { shared, new_load }
    }

    fn spawn_load(&self, key: CacheKey, new_load: NewLoad) {
        let cache = self.clone();
        self.inner.runtime.spawn(async move {
            let result = cache.run_load(&key, new_load.progress).await;
            // Fix the table up before publishing, so that no waiter can
            // observe a failed record or a stale dependency reference.
            cache.finish_load(&key, &result);
            let _ = new_load.slot.send(result);
        });
    }

    /// The single load task for one record: resolves dependencies, then
    /// invokes the strategy.
    async fn run_load(
        &self,
        key: &CacheKey,
        progress: Arc<ProgressBroadcast>,
    ) -> CacheEntry<ErasedAsset> {
        let location = key.location();
        let timeout = self.inner.config.dependency_timeout;

        for dep_location in self.inner.dependencies.dependencies_of(location) {
            let dep_key = CacheKey::untyped(&dep_location);
            let (shared, new_load) = match self.acquire_dependency(key, &dep_key) {
                DependencyAcquire::Acquired { shared, new_load } => (shared, new_load),
                DependencyAcquire::Duplicate => continue,
                DependencyAcquire::OwnerGone => return Err(CacheError::Cancelled),
            };
            if let Some(new_load) = new_load {
                self.spawn_load(dep_key.clone(), new_load);
            }

            match tokio::time::timeout(timeout, shared).await {
                Ok(Ok(_)) => {}
                Ok(Err(error)) => {
                    tracing::debug!(key = %key, dep = %dep_key, %error, "dependency failed");
                    return Err(error);
                }
                Err(_) => {
                    tracing::debug!(key = %key, dep = %dep_key, "dependency wait timed out");
                    return Err(CacheError::Timeout(timeout));
                }
            }
        }

        let sink: ProgressSink = Arc::new(move |value| progress.report(value));
        let token = self.inner.shutdown.child_token();
        self.inner
            .strategy
            .load(location, key.type_name(), sink, token)
            .await
    }

    /// Brings the table in line with a finished load, before the result is
    /// published to the waiters.
    fn finish_load(&self, key: &CacheKey, result: &CacheEntry<ErasedAsset>) {
        match result {
            Ok(asset) => {
                let mut records = self.inner.records.lock().unwrap();
                let Some(record) = records.get_mut(key) else {
                    // The cache was disposed while this load was in flight;
                    // nobody will ever see the asset.
                    drop(records);
                    self.inner.strategy.unload(key.location(), asset.clone());
                    return;
                };
                record.loading = false;
                record.asset = Some(asset.clone());
                if record.refcount == 0 {
                    // Every caller cancelled while we were loading.
                    let record = records.remove(key).expect("record present");
                    drop(records);
                    tracing::trace!(key = %key, "all callers gone, unloading fresh asset");
                    self.unload_record(key, &record);
                    self.release_cascade(record.deps);
                    return;
                }
                drop(records);
                self.publish(ResourceEvent::Loaded {
                    location: key.location_arc(),
                    kind: key.type_name(),
                });
            }
            Err(error) => {
                // Rollback: purge the record with every reference it carries
                // and release the dependencies it acquired. Waiters observe
                // the error as final; a retry starts from a fresh record.
                let record = self.inner.records.lock().unwrap().remove(key);
                let Some(record) = record else {
                    return;
                };
                tracing::trace!(key = %key, %error, "load failed, rolling back");
                self.release_cascade(record.deps);
                self.publish(ResourceEvent::LoadFailed {
                    location: key.location_arc(),
                    kind: key.type_name(),
                    error: error.clone(),
                });
            }
        }
    }

    /// Acquires one additional reference for a cloned handle.
    ///
    /// Tolerates a missing or superseded record: a handle that outlived
    /// `dispose` still shares its asset, it just no longer counts toward a
    /// record.
    pub(crate) fn retain_ref(&self, record_ref: &RecordRef) {
        let mut records = self.inner.records.lock().unwrap();
        match records.get_mut(&record_ref.key) {
            Some(record) if record.epoch == record_ref.epoch => record.refcount += 1,
            _ => tracing::debug!(key = %record_ref.key, "retain for a key with no record"),
        }
    }

    /// Releases the reference held by `record_ref`, cascading through
    /// dependencies.
    pub(crate) fn release_ref(&self, record_ref: &RecordRef) {
        self.release_cascade(std::iter::once(record_ref.clone()));
    }

    /// Releases one reference on whatever record is current for `key`.
    ///
    /// Backs the explicit epoch-less `release` APIs, which pair with a
    /// preceding [`Handle::detach`].
    pub(crate) fn release_key(&self, key: &CacheKey) {
        if let Some(removed) = self.release_one(key, None) {
            self.unload_record(key, &removed);
            self.release_cascade(removed.deps);
        }
    }

    /// Decrements each reference on the worklist once, removing and unloading
    /// records that reach zero and pushing their dependencies back onto the
    /// worklist.
    ///
    /// Iterative on purpose: arbitrarily deep dependency chains must not
    /// recurse, and diamond shapes are naturally handled because each owner
    /// acquired every distinct dependency exactly once.
    fn release_cascade(&self, refs: impl IntoIterator<Item = RecordRef>) {
        let mut worklist: Vec<RecordRef> = refs.into_iter().collect();
        while let Some(record_ref) = worklist.pop() {
            if let Some(removed) = self.release_one(&record_ref.key, Some(record_ref.epoch)) {
                self.unload_record(&record_ref.key, &removed);
                worklist.extend(removed.deps);
            }
        }
    }

    /// Decrements one reference on `key`, returning the record if it reached
    /// zero and was removed. The caller must unload the returned record and
    /// cascade its dependencies; this runs outside the table lock.
    ///
    /// `epoch` pins the release to the record generation the reference was
    /// acquired on: a reference that survived its record (a waiter dropped
    /// after a failure rollback purged the record, or a handle outliving
    /// `dispose`) must never decrement a successor record for the same key.
    /// `None` releases the current record, for the epoch-less `release` APIs.
    fn release_one(&self, key: &CacheKey, epoch: Option<u64>) -> Option<Record> {
        let mut records = self.inner.records.lock().unwrap();
        let Entry::Occupied(mut entry) = records.entry(key.clone()) else {
            // Legitimate after a failure rollback purged the record while a
            // caller was cancelling.
            tracing::debug!(key = %key, "release for a key with no record");
            return None;
        };
        let record = entry.get_mut();
        if epoch.is_some_and(|epoch| epoch != record.epoch) {
            tracing::debug!(key = %key, "release for a superseded record");
            return None;
        }
        record.refcount -= 1;
        assert!(record.refcount >= 0, "refcount underflow for {key}");
        // Zero-check and removal happen under the same lock as the
        // decrement: a racing acquire either lands before us and keeps the
        // count positive, or finds no record and starts a fresh load.
        if record.refcount > 0 || record.loading {
            return None;
        }
        tracing::trace!(key = %key, "removing record");
        Some(entry.remove())
    }

    /// Hands a removed record's asset back to the strategy.
    ///
    /// Must be called outside the table lock.
    fn unload_record(&self, key: &CacheKey, record: &Record) {
        let Some(asset) = &record.asset else {
            panic!("record for {key} completed without an asset");
        };
        self.inner.strategy.unload(key.location(), asset.clone());
        self.publish(ResourceEvent::Unloaded {
            location: key.location_arc(),
            kind: key.type_name(),
        });
    }

    fn publish(&self, event: ResourceEvent) {
        if let Some(events) = &self.inner.events {
            events.publish(event);
        }
    }

    #[cfg(test)]
    pub(crate) fn record_count(&self) -> usize {
        self.inner.records.lock().unwrap().len()
    }

    #[cfg(test)]
    pub(crate) fn refcount_of(&self, key: &CacheKey) -> Option<isize> {
        self.inner
            .records
            .lock()
            .unwrap()
            .get(key)
            .map(|record| record.refcount)
    }
}

/// The outcome of acquiring a dependency on behalf of an owner record.
enum DependencyAcquire {
    Acquired {
        shared: SharedEntry,
        new_load: Option<NewLoad>,
    },
    Duplicate,
    OwnerGone,
}

/// Creates the publish/subscribe pair for a record's load result.
///
/// The shared side resolves to `InternalError` if the load task is dropped
/// without publishing (e.g. the runtime shut down underneath it).
fn make_shared_entry() -> (LoadSlot, SharedEntry) {
    let (slot, rx) = oneshot::channel();
    let shared = rx
        .map(|result| result.unwrap_or(Err(CacheError::InternalError)))
        .boxed()
        .shared();
    (slot, shared)
}
