//! Deduplicating query registry.
//!
//! The registry owns every in-flight fetch. A key has at most one: callers
//! arriving while a fetch is pending attach to the same shared future and
//! receive the same `Arc`. Each fetch is tagged with the key's generation;
//! [`QueryRegistry::cancel`] bumps the generation so a late result is
//! discarded on arrival instead of overwriting newer state.
//!
//! Fetches run on spawned tasks and write their outcome into the
//! [`EntityStore`] whether or not anyone awaits them. Nothing a fetch
//! returns reaches the store before that ownership check passes, including
//! the entity records a normalizing query derives from its result (see
//! [`QueryRegistry::query_normalized`]).

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use ripple_core::{
    AnyValue, CacheKey, EntityRecord, QueryConfig, QueryError, RecordState, RemoteResult,
    RetryConfig, StoreError, SyncError,
};
use tracing::{debug, trace, warn};

use super::infinite::{InfiniteOptions, InfiniteQuery};
use super::retry::with_retry;
use super::store::{EntityStore, Notifications, RecordImage, SetOptions, WriteBatch};
use super::traits::{Fetcher, PageFetcher};

/// Per-query options: freshness and retention windows, retry policy, and
/// whether the query may fetch at all.
pub type QueryOptions = QueryConfig;

type SharedFetch = Shared<BoxFuture<'static, Result<AnyValue, SyncError>>>;

struct InFlight {
    generation: u64,
    future: SharedFetch,
    prior: Option<RecordImage>,
}

struct PageFlight {
    generation: u64,
    prior: Option<RecordImage>,
}

#[derive(Default)]
struct RegistryState {
    inflight: HashMap<CacheKey, InFlight>,
    pages: HashMap<CacheKey, PageFlight>,
    generations: HashMap<CacheKey, u64>,
}

impl RegistryState {
    fn generation(&self, key: &CacheKey) -> u64 {
        self.generations.get(key).copied().unwrap_or(0)
    }

    fn bump_generation(&mut self, key: &CacheKey) -> u64 {
        let generation = self.generations.entry(key.clone()).or_insert(0);
        *generation += 1;
        *generation
    }
}

struct RegistryInner {
    store: EntityStore,
    state: Mutex<RegistryState>,
    fetches_started: AtomicU64,
}

impl RegistryInner {
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a finished fetch if it still owns its key. `normalize` runs
    /// only for an owning success, in the same batch as the query's own write.
    fn complete<V, N>(
        &self,
        key: &CacheKey,
        generation: u64,
        result: RemoteResult<V>,
        normalize: N,
    ) -> Result<AnyValue, SyncError>
    where
        N: FnOnce(&mut WriteBatch<'_>, V) -> AnyValue,
    {
        let mut state = self.lock();
        let owns = state
            .inflight
            .get(key)
            .is_some_and(|flight| flight.generation == generation);
        if !owns {
            let current = state.generation(key);
            let superseded = state.inflight.contains_key(key);
            drop(state);
            debug!(key = %key, generation, current, "Discarded result of cancelled fetch");
            return Err(if superseded {
                QueryError::Superseded {
                    key: key.clone(),
                    generation: current,
                }
            } else {
                QueryError::Cancelled { key: key.clone() }
            }
            .into());
        }

        state.inflight.remove(key);
        let (outcome, notifications) = match result {
            Ok(raw) => {
                debug!(key = %key, generation, "Fetch resolved");
                let (value, notifications) = self.store.batch_quiet(|batch| {
                    let value = normalize(batch, raw);
                    batch.set_arc(key.clone(), Arc::clone(&value), SetOptions::fresh());
                    value
                });
                (Ok(value), notifications)
            }
            Err(err) => {
                warn!(key = %key, generation, error = %err, "Fetch failed");
                let notifications = self.store.fail(key, err.clone().into());
                (Err(SyncError::from(err)), notifications)
            }
        };
        drop(state);
        notifications.deliver();
        outcome
    }
}

/// Entry point for reads.
///
/// Cloning is cheap; clones share in-flight state and the underlying store.
#[derive(Clone)]
pub struct QueryRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for QueryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryRegistry")
            .field("in_flight", &self.in_flight())
            .field("fetches_started", &self.fetches_started())
            .finish()
    }
}

impl QueryRegistry {
    pub fn new(store: EntityStore) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                store,
                state: Mutex::new(RegistryState::default()),
                fetches_started: AtomicU64::new(0),
            }),
        }
    }

    pub fn store(&self) -> &EntityStore {
        &self.inner.store
    }

    /// Number of fetches currently owning a key.
    pub fn in_flight(&self) -> usize {
        let state = self.inner.lock();
        state.inflight.len() + state.pages.len()
    }

    pub fn is_fetching(&self, key: &CacheKey) -> bool {
        let state = self.inner.lock();
        state.inflight.contains_key(key) || state.pages.contains_key(key)
    }

    /// Total remote fetches started by this registry.
    pub fn fetches_started(&self) -> u64 {
        self.inner.fetches_started.load(Ordering::Relaxed)
    }

    /// Read `key`, fetching it in the background if the query is enabled and
    /// the record is missing, idle, stale or errored.
    ///
    /// Returns immediately with the current record. Await
    /// [`Query::settled`] for the fetched value. Must be called from within
    /// a tokio runtime.
    pub fn query<T, F>(&self, key: CacheKey, fetcher: F, options: QueryOptions) -> Query<T>
    where
        T: Any + Send + Sync,
        F: Fetcher<T>,
    {
        self.query_normalized(key, fetcher, options, |_, value: T| value)
    }

    /// [`query`](Self::query) for a fetcher whose raw result `V` is turned
    /// into the cached `T` by `normalize`, which may also write the entity
    /// records the result references (and [`link`](WriteBatch::link) them).
    ///
    /// `normalize` runs once, under the store lock, and only if the fetch
    /// still owns `key` when it lands. A cancelled or superseded fetch
    /// writes nothing.
    pub fn query_normalized<V, T, F, N>(
        &self,
        key: CacheKey,
        fetcher: F,
        options: QueryOptions,
        normalize: N,
    ) -> Query<T>
    where
        V: Send + 'static,
        T: Any + Send + Sync,
        F: Fetcher<V>,
        N: FnOnce(&mut WriteBatch<'_>, V) -> T + Send + 'static,
    {
        let store = &self.inner.store;
        if store.is_disposed() {
            return Query::resolved(key, None, Some(StoreError::Disposed.into()));
        }

        let mut state = self.inner.lock();
        if let Some(flight) = state.inflight.get(&key) {
            let pending = flight.future.clone();
            debug!(key = %key, generation = flight.generation, "Attached to in-flight fetch");
            drop(state);
            let record = store.get(&key);
            return Query::new(key, record, Some(pending), options.enabled);
        }

        let current = store.get(&key);
        let needs_fetch =
            options.enabled && current.as_ref().map_or(true, |r| r.state.needs_refresh());
        if !needs_fetch {
            drop(state);
            trace!(key = %key, enabled = options.enabled, "Served from cache");
            return Query::new(key, current, None, options.enabled);
        }

        let generation = state.bump_generation(&key);
        let (prior, notifications) = store.begin_fetch(&key, &options);
        let future = self.spawn_fetch(key.clone(), generation, fetcher, options.retry, normalize);
        state.inflight.insert(
            key.clone(),
            InFlight {
                generation,
                future: future.clone(),
                prior,
            },
        );
        drop(state);
        notifications.deliver();

        debug!(key = %key, generation, "Started fetch");
        let record = store.get(&key);
        Query::new(key, record, Some(future), true)
    }

    /// `query(..).settled().await`.
    pub async fn fetch<T, F>(&self, key: CacheKey, fetcher: F, options: QueryOptions) -> Result<Arc<T>, SyncError>
    where
        T: Any + Send + Sync,
        F: Fetcher<T>,
    {
        self.query(key, fetcher, options).settled().await
    }

    fn spawn_fetch<V, T, F, N>(
        &self,
        key: CacheKey,
        generation: u64,
        fetcher: F,
        retry: RetryConfig,
        normalize: N,
    ) -> SharedFetch
    where
        V: Send + 'static,
        T: Any + Send + Sync,
        F: Fetcher<V>,
        N: FnOnce(&mut WriteBatch<'_>, V) -> T + Send + 'static,
    {
        self.inner.fetches_started.fetch_add(1, Ordering::Relaxed);
        let registry = Arc::downgrade(&self.inner);
        let task_key = key.clone();

        let handle = tokio::spawn(async move {
            let operation = task_key.to_string();
            let result = with_retry(&operation, &retry, || fetcher.fetch()).await;
            match registry.upgrade() {
                Some(inner) => inner.complete(&task_key, generation, result, move |batch, raw| {
                    Arc::new(normalize(batch, raw)) as AnyValue
                }),
                None => Err(QueryError::Aborted { key: task_key }.into()),
            }
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(_) => Err(QueryError::Aborted { key }.into()),
            }
        }
        .boxed()
        .shared()
    }

    /// Detach the in-flight fetch for `key`, plain or page, and put the
    /// record back the way it was before the fetch began. The remote call
    /// is not interrupted; its result is discarded when it arrives.
    ///
    /// Returns false if nothing was in flight.
    pub fn cancel(&self, key: &CacheKey) -> bool {
        let mut state = self.inner.lock();
        let (cancelled, prior) = if let Some(flight) = state.inflight.remove(key) {
            (flight.generation, flight.prior)
        } else if let Some(flight) = state.pages.remove(key) {
            (flight.generation, flight.prior)
        } else {
            return false;
        };
        let generation = state.bump_generation(key);
        let notifications = self.inner.store.restore_image(key, prior);
        drop(state);
        notifications.deliver();
        debug!(key = %key, cancelled, generation, "Cancelled fetch");
        true
    }

    /// Cancel every in-flight fetch under `prefix`. Returns the count.
    pub fn cancel_prefix(&self, prefix: &CacheKey) -> usize {
        let keys: Vec<CacheKey> = {
            let state = self.inner.lock();
            state
                .inflight
                .keys()
                .chain(state.pages.keys())
                .filter(|key| key.starts_with(prefix))
                .cloned()
                .collect()
        };
        keys.iter().filter(|key| self.cancel(key)).count()
    }

    /// Mark everything under `prefix` stale. Data stays visible; the next
    /// read refetches.
    pub fn invalidate(&self, prefix: &CacheKey) -> usize {
        self.inner.store.invalidate(prefix)
    }

    /// Drop everything under `prefix` back to idle, discarding in-flight
    /// results. Paginated queries restart from their first page.
    pub fn reset(&self, prefix: &CacheKey) -> usize {
        self.cancel_prefix(prefix);

        let state = self.inner.lock();
        let (count, notifications) = self.inner.store.reset_quiet(prefix);
        drop(state);
        notifications.deliver();
        count
    }

    /// Drop all in-flight state and dispose the store.
    pub fn dispose(&self) {
        {
            let mut state = self.inner.lock();
            let keys: Vec<CacheKey> = state
                .inflight
                .keys()
                .chain(state.pages.keys())
                .cloned()
                .collect();
            for key in &keys {
                state.bump_generation(key);
            }
            state.inflight.clear();
            state.pages.clear();
        }
        self.inner.store.dispose();
    }

    // ========================================================================
    // PAGINATED QUERIES
    // ========================================================================

    /// Mount a paginated query on `key`. No page is fetched until
    /// [`InfiniteQuery::fetch_next_page`] is called.
    pub fn infinite_query<T, C, F>(
        &self,
        key: CacheKey,
        fetcher: F,
        options: InfiniteOptions<T, C>,
    ) -> InfiniteQuery<T, C>
    where
        T: Any + Send + Sync,
        C: Clone + Send + Sync + 'static,
        F: PageFetcher<T, C>,
    {
        InfiniteQuery::mount(self.clone(), key, Arc::new(fetcher), options)
    }

    /// Claim `key` for a page fetch. Returns the generation tag, or `None`
    /// if another page fetch already owns the key.
    pub(crate) fn begin_page(&self, key: &CacheKey, config: &QueryConfig) -> Option<u64> {
        let mut state = self.inner.lock();
        if state.pages.contains_key(key) || state.inflight.contains_key(key) {
            return None;
        }
        let generation = state.generation(key);
        let (prior, notifications) = self.inner.store.begin_fetch(key, config);
        state.pages.insert(key.clone(), PageFlight { generation, prior });
        drop(state);
        self.inner.fetches_started.fetch_add(1, Ordering::Relaxed);
        notifications.deliver();
        Some(generation)
    }

    /// Release `key` and run `apply` against the store, if the page fetch
    /// tagged `generation` still owns it. `None` means the fetch was
    /// superseded and its result must be dropped.
    /// `apply` also receives the image from before the claim.
    pub(crate) fn finish_page<R, F>(&self, key: &CacheKey, generation: u64, apply: F) -> Option<R>
    where
        F: FnOnce(&EntityStore, Option<RecordImage>) -> (R, Notifications),
    {
        let mut state = self.inner.lock();
        let owns = state
            .pages
            .get(key)
            .is_some_and(|flight| flight.generation == generation)
            && state.generation(key) == generation;
        if !owns {
            return None;
        }
        let prior = state.pages.remove(key).and_then(|flight| flight.prior);
        let (result, notifications) = apply(&self.inner.store, prior);
        drop(state);
        notifications.deliver();
        Some(result)
    }

    /// Release a page fetch that ended without a result.
    pub(crate) fn abandon_page(&self, key: &CacheKey, generation: u64) {
        let mut state = self.inner.lock();
        let owns = state
            .pages
            .get(key)
            .is_some_and(|flight| flight.generation == generation);
        if !owns {
            return;
        }
        let notifications = match state.pages.remove(key) {
            Some(flight) => self.inner.store.restore_image(key, flight.prior),
            None => Notifications::default(),
        };
        drop(state);
        notifications.deliver();
    }

    /// Supersede any page fetch on `key` and clear its pages.
    pub(crate) fn remount(&self, key: &CacheKey) {
        let mut state = self.inner.lock();
        state.pages.remove(key);
        let generation = state.bump_generation(key);
        let (_, notifications) = self.inner.store.reset_quiet(key);
        drop(state);
        notifications.deliver();
        debug!(key = %key, generation, "Remounted paginated query");
    }
}

/// The result of [`QueryRegistry::query`]: the record as it was when the
/// query was issued, plus the fetch it started or joined.
pub struct Query<T> {
    key: CacheKey,
    record: Option<EntityRecord<T>>,
    pending: Option<SharedFetch>,
    /// Error to settle with when there is neither a value nor a fetch.
    fallback: Option<SyncError>,
    _value: PhantomData<fn() -> T>,
}

impl<T: Any + Send + Sync> Query<T> {
    fn new(key: CacheKey, record: Option<EntityRecord>, pending: Option<SharedFetch>, enabled: bool) -> Self {
        let (record, fallback) = match record.map(|r| r.downcast::<T>()) {
            None => (None, None),
            Some(Some(typed)) => (Some(typed), None),
            Some(None) => (
                None,
                Some(
                    QueryError::TypeMismatch {
                        key: key.clone(),
                        expected: type_name::<T>(),
                    }
                    .into(),
                ),
            ),
        };
        let fallback = fallback.or_else(|| {
            (!enabled).then(|| QueryError::Disabled { key: key.clone() }.into())
        });
        Self {
            key,
            record,
            pending,
            fallback,
            _value: PhantomData,
        }
    }

    fn resolved(key: CacheKey, record: Option<EntityRecord<T>>, fallback: Option<SyncError>) -> Self {
        Self {
            key,
            record,
            pending: None,
            fallback,
            _value: PhantomData,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn record(&self) -> Option<&EntityRecord<T>> {
        self.record.as_ref()
    }

    /// The value visible when the query was issued (possibly stale).
    pub fn value(&self) -> Option<Arc<T>> {
        self.record.as_ref().and_then(|r| r.value.clone())
    }

    pub fn state(&self) -> Option<RecordState> {
        self.record.as_ref().map(|r| r.state)
    }

    /// True if this query started or joined a fetch.
    pub fn is_fetching(&self) -> bool {
        self.pending.is_some()
    }

    /// Wait for the fetch this query started or joined, or return the cached
    /// value if none was needed.
    pub async fn settled(self) -> Result<Arc<T>, SyncError> {
        if let Some(pending) = self.pending {
            let value = pending.await?;
            return value.downcast::<T>().map_err(|_| {
                QueryError::TypeMismatch {
                    key: self.key.clone(),
                    expected: type_name::<T>(),
                }
                .into()
            });
        }

        if let Some(value) = self.record.as_ref().and_then(|r| r.value.clone()) {
            return Ok(value);
        }
        if let Some(err) = self.record.and_then(|r| r.error) {
            return Err(err);
        }
        if let Some(err) = self.fallback {
            return Err(err);
        }
        Err(QueryError::Aborted { key: self.key }.into())
    }
}

impl<T> std::fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("key", &self.key)
            .field("record", &self.record)
            .field("fetching", &self.pending.is_some())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================
