//! Normalized entity store.
//!
//! The store maps [`CacheKey`]s to records and is the single source of truth
//! every query and mutation reads from. All operations are synchronous: the
//! state sits behind a `std::sync::Mutex` that is never held across an
//! `.await`, and listeners run after the lock is released, so a listener may
//! call back into the store.
//!
//! # Garbage collection
//!
//! A record with no subscribers is evicted `gc_after` after its last write
//! or its last unsubscribe, whichever is later. Each record owns at most
//! one timer: subscribing or writing aborts it and bumps the record's GC
//! generation, so a timer that already fired finds nothing to collect.
//! Records referenced by a
//! linked query (see [`EntityStore::link`]) are retained while that query's
//! record exists.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use ripple_core::{
    now_utc, AnyValue, CacheKey, EntityRecord, Instant, QueryConfig, RecordState, StoreError,
    SyncError, Timestamp,
};
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use super::subscription::Subscription;
use super::traits::StoreStats;

/// Callback invoked with the updated record after every write to a key.
pub type Listener = Arc<dyn Fn(&EntityRecord) + Send + Sync>;

/// Options for [`EntityStore::set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetOptions {
    /// Store as `Fresh` (confirmed by the remote) or `Stale`.
    pub fresh: bool,
    /// Override the record's freshness window.
    pub stale_after: Option<Duration>,
    /// Override the record's retention window.
    pub gc_after: Option<Duration>,
}

impl Default for SetOptions {
    fn default() -> Self {
        Self::fresh()
    }
}

impl SetOptions {
    pub fn fresh() -> Self {
        Self {
            fresh: true,
            stale_after: None,
            gc_after: None,
        }
    }

    pub fn stale() -> Self {
        Self {
            fresh: false,
            ..Self::fresh()
        }
    }

    /// Fresh, with the windows of a query configuration.
    pub fn from_config(config: &QueryConfig) -> Self {
        Self {
            fresh: true,
            stale_after: Some(config.stale_after),
            gc_after: Some(config.gc_after),
        }
    }

    pub fn with_stale_after(mut self, duration: Duration) -> Self {
        self.stale_after = Some(duration);
        self
    }

    pub fn with_gc_after(mut self, duration: Duration) -> Self {
        self.gc_after = Some(duration);
        self
    }
}

/// Prior image of one record, without its listeners.
#[derive(Clone)]
pub struct RecordImage {
    pub value: Option<AnyValue>,
    pub fetched_at: Option<Instant>,
    pub updated_at: Option<Timestamp>,
    pub state: RecordState,
    pub error: Option<SyncError>,
    pub stale_after: Duration,
    pub gc_after: Duration,
    pub version: u64,
}

impl RecordImage {
    fn idle(stale_after: Duration, gc_after: Duration) -> Self {
        Self {
            value: None,
            fetched_at: None,
            updated_at: None,
            state: RecordState::Idle,
            error: None,
            stale_after,
            gc_after,
            version: 0,
        }
    }

    /// Drop data back to `Idle`, keeping the windows.
    fn clear(&mut self) {
        self.value = None;
        self.fetched_at = None;
        self.updated_at = None;
        self.state = RecordState::Idle;
        self.error = None;
    }
}

impl std::fmt::Debug for RecordImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordImage")
            .field("has_value", &self.value.is_some())
            .field("state", &self.state)
            .field("version", &self.version)
            .finish()
    }
}

/// Prior images of a set of records, replayable with [`EntityStore::restore`].
///
/// A key that did not exist when captured is recorded as `None`; restoring
/// it removes whatever was written there since.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    images: Vec<(CacheKey, Option<RecordImage>)>,
}

impl StoreSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.images.iter().any(|(k, _)| k == key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
        self.images.iter().map(|(k, _)| k)
    }

    /// The captured image for `key`. `Some(None)` means the key was absent.
    pub fn image(&self, key: &CacheKey) -> Option<Option<&RecordImage>> {
        self.images
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, image)| image.as_ref())
    }
}

struct Slot {
    image: RecordImage,
    gc_generation: u64,
    gc_timer: Option<AbortHandle>,
    listeners: Vec<(u64, Listener)>,
}

impl Slot {
    fn new(defaults: &QueryConfig) -> Self {
        Self {
            image: RecordImage::idle(defaults.stale_after, defaults.gc_after),
            gc_generation: 0,
            gc_timer: None,
            listeners: Vec::new(),
        }
    }

    /// Abort the pending GC timer, if any.
    fn cancel_gc(&mut self) {
        self.gc_generation += 1;
        if let Some(timer) = self.gc_timer.take() {
            timer.abort();
        }
    }

    fn record(&self, key: &CacheKey, now: Instant) -> EntityRecord {
        let image = &self.image;
        let state = if image.state == RecordState::Fresh
            && image.fetched_at.is_some_and(|at| now.saturating_duration_since(at) >= image.stale_after)
        {
            RecordState::Stale
        } else {
            image.state
        };

        EntityRecord {
            key: key.clone(),
            value: image.value.clone(),
            fetched_at: image.fetched_at,
            updated_at: image.updated_at,
            state,
            error: image.error.clone(),
            stale_after: image.stale_after,
            gc_after: image.gc_after,
            subscriber_count: self.listeners.len(),
            version: image.version,
        }
    }
}

#[derive(Default)]
struct StoreState {
    slots: HashMap<CacheKey, Slot>,
    /// query key -> entity keys its result references
    links: HashMap<CacheKey, HashSet<CacheKey>>,
    /// entity key -> query keys referencing it
    backlinks: HashMap<CacheKey, HashSet<CacheKey>>,
    next_listener_id: u64,
    disposed: bool,
    evictions: u64,
}

impl StoreState {
    fn is_retained_by_link(&self, key: &CacheKey) -> bool {
        self.backlinks
            .get(key)
            .is_some_and(|queries| queries.iter().any(|q| self.slots.contains_key(q)))
    }

    /// Remove the links of `query`. Returns the entity keys no longer
    /// referenced by any query.
    fn unlink_query(&mut self, query: &CacheKey) -> Vec<CacheKey> {
        let mut orphans = Vec::new();
        if let Some(entities) = self.links.remove(query) {
            for entity in entities {
                if let Some(queries) = self.backlinks.get_mut(&entity) {
                    queries.remove(query);
                    if queries.is_empty() {
                        self.backlinks.remove(&entity);
                        orphans.push(entity);
                    }
                }
            }
        }
        orphans
    }

    fn unlink_entity(&mut self, entity: &CacheKey) {
        if let Some(queries) = self.backlinks.remove(entity) {
            for query in queries {
                if let Some(entities) = self.links.get_mut(&query) {
                    entities.remove(entity);
                }
            }
        }
    }

    /// Listener calls owed for a write to `key`: its own listeners plus the
    /// listeners of every query linked to it.
    fn notifications_for(&self, key: &CacheKey, now: Instant, out: &mut Notifications) {
        if let Some(slot) = self.slots.get(key) {
            if !slot.listeners.is_empty() {
                let record = slot.record(key, now);
                for (_, listener) in &slot.listeners {
                    out.0.push((Arc::clone(listener), record.clone()));
                }
            }
        }

        if let Some(queries) = self.backlinks.get(key) {
            for query in queries {
                if let Some(slot) = self.slots.get(query) {
                    if slot.listeners.is_empty() {
                        continue;
                    }
                    let record = slot.record(query, now);
                    for (_, listener) in &slot.listeners {
                        out.0.push((Arc::clone(listener), record.clone()));
                    }
                }
            }
        }
    }
}

/// Listener calls collected under the lock and delivered after it is released.
#[must_use = "notifications must be delivered"]
#[derive(Default)]
pub(crate) struct Notifications(Vec<(Listener, EntityRecord)>);

impl Notifications {
    pub(crate) fn deliver(self) {
        for (listener, record) in self.0 {
            listener(&record);
        }
    }

    pub(crate) fn extend(&mut self, other: Notifications) {
        self.0.extend(other.0);
    }
}

pub(crate) struct StoreInner {
    state: Mutex<StoreState>,
    defaults: QueryConfig,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Normalized, subscribable entity cache.
///
/// Cloning is cheap; clones share the same records.
#[derive(Clone)]
pub struct EntityStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityStore")
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new(QueryConfig::default())
    }
}

impl EntityStore {
    /// Create a store. `defaults` supplies the windows of records created
    /// without explicit options.
    pub fn new(defaults: QueryConfig) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(StoreState::default()),
                defaults,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<StoreInner>) -> Self {
        Self { inner }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn defaults(&self) -> &QueryConfig {
        &self.inner.defaults
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Look up a record. A `Fresh` record past its freshness window is
    /// reported as `Stale`; nothing is written.
    pub fn get(&self, key: &CacheKey) -> Option<EntityRecord> {
        let record = self
            .lock()
            .slots
            .get(key)
            .map(|slot| slot.record(key, Instant::now()));
        let counter = if record.as_ref().is_some_and(|r| r.has_value()) {
            &self.inner.hits
        } else {
            &self.inner.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        record
    }

    /// Look up a record with a concrete value type.
    ///
    /// Returns `None` if the key is absent or holds a value of another type.
    pub fn get_as<T: Any + Send + Sync>(&self, key: &CacheKey) -> Option<EntityRecord<T>> {
        self.get(key).and_then(|record| record.downcast::<T>())
    }

    /// The current value under `key`, if present and a `T`.
    pub fn value<T: Any + Send + Sync>(&self, key: &CacheKey) -> Option<Arc<T>> {
        self.get(key).and_then(|record| record.value_as::<T>())
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().slots.contains_key(key)
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self.lock().slots.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_disposed(&self) -> bool {
        self.lock().disposed
    }

    pub fn stats(&self) -> StoreStats {
        let state = self.lock();
        StoreStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            entry_count: state.slots.len() as u64,
            subscriber_count: state.slots.values().map(|s| s.listeners.len() as u64).sum(),
            evictions: state.evictions,
        }
    }

    /// Entity keys linked to `query`, sorted.
    pub fn linked(&self, query: &CacheKey) -> Vec<CacheKey> {
        let state = self.lock();
        let mut keys: Vec<CacheKey> = state
            .links
            .get(query)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Store `value` under `key` and return the stored reference.
    pub fn set<T: Any + Send + Sync>(&self, key: CacheKey, value: T, options: SetOptions) -> Arc<T> {
        let value = Arc::new(value);
        self.set_arc(key, Arc::clone(&value) as AnyValue, options);
        value
    }

    /// Store an already shared value. The reference is kept as given.
    pub fn set_arc(&self, key: CacheKey, value: AnyValue, options: SetOptions) {
        self.set_quiet(key, value, options).deliver();
    }

    pub(crate) fn set_quiet(&self, key: CacheKey, value: AnyValue, options: SetOptions) -> Notifications {
        self.write(&key, |image| {
            image.value = Some(value);
            image.fetched_at = Some(Instant::now());
            image.updated_at = Some(now_utc());
            image.state = if options.fresh {
                RecordState::Fresh
            } else {
                RecordState::Stale
            };
            image.error = None;
            if let Some(stale_after) = options.stale_after {
                image.stale_after = stale_after;
            }
            if let Some(gc_after) = options.gc_after {
                image.gc_after = gc_after;
            }
        })
    }

    /// Replace the value under `key` with `f(current)`.
    ///
    /// Returns the new value, or `None` (and writes nothing) if there is no
    /// current value of type `T`. The record keeps its freshness state.
    pub fn update<T, F>(&self, key: &CacheKey, f: F) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce(&T) -> T,
    {
        let mut state = self.lock();
        let mut notifications = Notifications::default();
        let next = self.update_in(&mut state, key, f, &mut notifications);
        drop(state);
        notifications.deliver();
        next
    }

    fn update_in<T, F>(
        &self,
        state: &mut StoreState,
        key: &CacheKey,
        f: F,
        notifications: &mut Notifications,
    ) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce(&T) -> T,
    {
        if state.disposed {
            return None;
        }
        let slot = state.slots.get_mut(key)?;
        let current = slot
            .image
            .value
            .as_ref()
            .and_then(|value| Arc::clone(value).downcast::<T>().ok())?;
        let next = Arc::new(f(current.as_ref()));

        slot.image.value = Some(Arc::clone(&next) as AnyValue);
        slot.image.updated_at = Some(now_utc());
        slot.image.version += 1;
        if slot.image.state == RecordState::Idle {
            slot.image.state = RecordState::Stale;
        }
        self.after_write(state, key);
        state.notifications_for(key, Instant::now(), notifications);
        Some(next)
    }

    /// Record a failed fetch: state `Error`, previous value retained.
    pub(crate) fn fail(&self, key: &CacheKey, error: SyncError) -> Notifications {
        self.write(key, |image| {
            image.state = RecordState::Error;
            image.error = Some(error);
        })
    }

    /// Mark `key` as owned by a fetch and apply the query's windows.
    /// Returns the image to restore if the fetch is cancelled.
    pub(crate) fn begin_fetch(&self, key: &CacheKey, config: &QueryConfig) -> (Option<RecordImage>, Notifications) {
        let prior = self.lock().slots.get(key).map(|slot| slot.image.clone());
        let notifications = self.write(key, |image| {
            image.state = RecordState::Pending;
            image.stale_after = config.stale_after;
            image.gc_after = config.gc_after;
        });
        (prior, notifications)
    }

    /// Put back a pre-fetch image. The version still advances.
    pub(crate) fn restore_image(&self, key: &CacheKey, prior: Option<RecordImage>) -> Notifications {
        match prior {
            Some(prior) => self.write(key, |image| {
                let version = image.version;
                *image = prior;
                image.version = version;
            }),
            None => self.write(key, RecordImage::clear),
        }
    }

    /// Apply `f` to the image under `key` (creating an idle slot if needed),
    /// bump its version, and collect the listener calls owed.
    fn write<F>(&self, key: &CacheKey, f: F) -> Notifications
    where
        F: FnOnce(&mut RecordImage),
    {
        let mut state = self.lock();
        let mut notifications = Notifications::default();
        self.write_in(&mut state, key, f, &mut notifications);
        notifications
    }

    fn write_in<F>(&self, state: &mut StoreState, key: &CacheKey, f: F, notifications: &mut Notifications)
    where
        F: FnOnce(&mut RecordImage),
    {
        if state.disposed {
            warn!(key = %key, "Write ignored: entity store has been disposed");
            return;
        }

        let slot = state
            .slots
            .entry(key.clone())
            .or_insert_with(|| Slot::new(&self.inner.defaults));
        f(&mut slot.image);
        slot.image.version += 1;
        trace!(key = %key, state = %slot.image.state, version = slot.image.version, "Record written");
        self.after_write(state, key);
        state.notifications_for(key, Instant::now(), notifications);
    }

    /// Run several writes under one lock acquisition. Readers observe either
    /// none or all of them; listeners run once the batch is closed.
    pub fn batch<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut WriteBatch<'_>) -> R,
    {
        let (result, notifications) = self.batch_quiet(f);
        notifications.deliver();
        result
    }

    /// [`EntityStore::batch`], handing the listener calls back to the caller.
    pub(crate) fn batch_quiet<R, F>(&self, f: F) -> (R, Notifications)
    where
        F: FnOnce(&mut WriteBatch<'_>) -> R,
    {
        let mut batch = WriteBatch {
            store: self,
            state: self.lock(),
            notifications: Notifications::default(),
        };
        let result = f(&mut batch);
        let WriteBatch { notifications, .. } = batch;
        (result, notifications)
    }

    /// Restart the GC timer of an unobserved record.
    fn after_write(&self, state: &mut StoreState, key: &CacheKey) {
        let unobserved = state
            .slots
            .get(key)
            .is_some_and(|slot| slot.listeners.is_empty());
        if unobserved {
            self.schedule_gc(state, key);
        }
    }

    /// Mark every record under `prefix` that holds confirmed data as `Stale`.
    /// Data is retained. Returns the number of records marked.
    pub fn invalidate(&self, prefix: &CacheKey) -> usize {
        let mut state = self.lock();
        if state.disposed {
            return 0;
        }

        let keys: Vec<CacheKey> = state
            .slots
            .iter()
            .filter(|(key, slot)| {
                key.starts_with(prefix)
                    && matches!(slot.image.state, RecordState::Fresh | RecordState::Stale)
            })
            .map(|(key, _)| key.clone())
            .collect();

        let now = Instant::now();
        let mut notifications = Notifications::default();
        for key in &keys {
            if let Some(slot) = state.slots.get_mut(key) {
                slot.image.state = RecordState::Stale;
                slot.image.version += 1;
            }
            state.notifications_for(key, now, &mut notifications);
        }
        drop(state);

        debug!(prefix = %prefix, count = keys.len(), "Invalidated records");
        notifications.deliver();
        keys.len()
    }

    /// Drop the data of every record under `prefix` back to `Idle`, and
    /// forget the links of any query among them. Returns the number reset.
    pub fn reset(&self, prefix: &CacheKey) -> usize {
        let (count, notifications) = self.reset_quiet(prefix);
        notifications.deliver();
        count
    }

    pub(crate) fn reset_quiet(&self, prefix: &CacheKey) -> (usize, Notifications) {
        let mut state = self.lock();
        if state.disposed {
            return (0, Notifications::default());
        }

        let keys: Vec<CacheKey> = state
            .slots
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();

        let now = Instant::now();
        let mut notifications = Notifications::default();
        for key in &keys {
            if let Some(slot) = state.slots.get_mut(key) {
                slot.image.clear();
                slot.image.version += 1;
            }
            for orphan in state.unlink_query(key) {
                self.after_write(&mut state, &orphan);
            }
            self.after_write(&mut state, key);
            state.notifications_for(key, now, &mut notifications);
        }
        drop(state);

        debug!(prefix = %prefix, count = keys.len(), "Reset records");
        (keys.len(), notifications)
    }

    /// Remove a record. Refused while it has subscribers.
    pub fn evict(&self, key: &CacheKey) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.disposed {
            return Err(StoreError::Disposed);
        }
        let count = match state.slots.get(key) {
            None => return Ok(()),
            Some(slot) => slot.listeners.len(),
        };
        if count > 0 {
            return Err(StoreError::HasSubscribers {
                key: key.clone(),
                count,
            });
        }
        self.remove_slot(&mut state, key);
        debug!(key = %key, "Evicted record");
        Ok(())
    }

    fn remove_slot(&self, state: &mut StoreState, key: &CacheKey) {
        if let Some(mut slot) = state.slots.remove(key) {
            slot.cancel_gc();
        }
        state.evictions += 1;
        state.unlink_entity(key);
        for orphan in state.unlink_query(key) {
            self.after_write(state, &orphan);
        }
    }

    /// Record that the result of `query` references `entities`, replacing
    /// any previous links. A write to one of them notifies the query's
    /// listeners as well.
    pub fn link(&self, query: &CacheKey, entities: impl IntoIterator<Item = CacheKey>) {
        let mut state = self.lock();
        self.link_in(&mut state, query, entities);
    }

    fn link_in(&self, state: &mut StoreState, query: &CacheKey, entities: impl IntoIterator<Item = CacheKey>) {
        if state.disposed {
            return;
        }
        let entities: HashSet<CacheKey> = entities.into_iter().collect();
        let orphans = state.unlink_query(query);
        for entity in &entities {
            state
                .backlinks
                .entry(entity.clone())
                .or_default()
                .insert(query.clone());
        }
        state.links.insert(query.clone(), entities);
        for orphan in orphans {
            if !state.backlinks.contains_key(&orphan) {
                self.after_write(state, &orphan);
            }
        }
    }

    // ========================================================================
    // SUBSCRIPTIONS
    // ========================================================================

    /// Observe `key`. The listener runs after every write to the key, and
    /// after writes to entities linked to it.
    ///
    /// Creates an idle record if the key is unknown and cancels a pending
    /// eviction. The returned guard unsubscribes on drop.
    pub fn subscribe<F>(&self, key: CacheKey, listener: F) -> Subscription
    where
        F: Fn(&EntityRecord) + Send + Sync + 'static,
    {
        let mut state = self.lock();
        if state.disposed {
            return Subscription::detached(key);
        }
        state.next_listener_id += 1;
        let id = state.next_listener_id;
        let slot = state
            .slots
            .entry(key.clone())
            .or_insert_with(|| Slot::new(&self.inner.defaults));
        slot.listeners.push((id, Arc::new(listener)));
        slot.cancel_gc();
        trace!(key = %key, subscribers = slot.listeners.len(), "Subscribed");
        Subscription::new(Arc::downgrade(&self.inner), key, id)
    }

    /// Keep `key` alive without observing it.
    pub fn retain(&self, key: CacheKey) -> Subscription {
        self.subscribe(key, |_| {})
    }

    pub(crate) fn remove_listener(&self, key: &CacheKey, id: u64) {
        let mut state = self.lock();
        let remaining = match state.slots.get_mut(key) {
            Some(slot) => {
                slot.listeners.retain(|(listener_id, _)| *listener_id != id);
                slot.listeners.len()
            }
            None => return,
        };
        trace!(key = %key, subscribers = remaining, "Unsubscribed");
        if remaining == 0 {
            self.schedule_gc(&mut state, key);
        }
    }

    // ========================================================================
    // GARBAGE COLLECTION
    // ========================================================================

    /// Replace the record's GC timer with one firing `gc_after` from now.
    fn schedule_gc(&self, state: &mut StoreState, key: &CacheKey) {
        let Some(slot) = state.slots.get_mut(key) else {
            return;
        };
        slot.cancel_gc();
        let generation = slot.gc_generation;
        let delay = slot.image.gc_after;

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            trace!(key = %key, "No runtime; GC timer not started");
            return;
        };
        let inner: Weak<StoreInner> = Arc::downgrade(&self.inner);
        let timer_key = key.clone();
        let task = handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = inner.upgrade() {
                EntityStore::from_inner(inner).collect(&timer_key, generation);
            }
        });
        slot.gc_timer = Some(task.abort_handle());
    }

    /// Evict `key` if nothing touched it since the timer for `generation`
    /// was started.
    fn collect(&self, key: &CacheKey, generation: u64) {
        let mut state = self.lock();
        if state.disposed {
            return;
        }
        let eligible = match state.slots.get(key) {
            Some(slot) => {
                slot.gc_generation == generation
                    && slot.listeners.is_empty()
                    && slot.image.state != RecordState::Pending
            }
            None => false,
        };
        if !eligible || state.is_retained_by_link(key) {
            return;
        }
        self.remove_slot(&mut state, key);
        debug!(key = %key, "Garbage collected record");
    }

    // ========================================================================
    // SNAPSHOTS
    // ========================================================================

    /// Capture the current images of `keys`.
    pub fn snapshot<'a>(&self, keys: impl IntoIterator<Item = &'a CacheKey>) -> StoreSnapshot {
        let mut snapshot = StoreSnapshot::new();
        for key in keys {
            self.extend_snapshot(&mut snapshot, key);
        }
        snapshot
    }

    /// Add `key` to `snapshot` unless it is already captured.
    /// Returns true if an image was added.
    pub fn extend_snapshot(&self, snapshot: &mut StoreSnapshot, key: &CacheKey) -> bool {
        if snapshot.contains(key) {
            return false;
        }
        let image = self.lock().slots.get(key).map(|slot| slot.image.clone());
        snapshot.images.push((key.clone(), image));
        true
    }

    /// Replay a snapshot. Each record gets back its captured value, state
    /// and timestamps (same `Arc`); versions keep advancing. Returns the
    /// number of records restored.
    pub fn restore(&self, snapshot: StoreSnapshot) -> usize {
        let mut notifications = Notifications::default();
        let mut restored = 0;

        for (key, image) in snapshot.images {
            match image {
                Some(image) => {
                    notifications.extend(self.restore_image(&key, Some(image)));
                }
                None => {
                    let mut state = self.lock();
                    if state.disposed {
                        continue;
                    }
                    let removable = state
                        .slots
                        .get(&key)
                        .is_some_and(|slot| slot.listeners.is_empty());
                    if removable {
                        self.remove_slot(&mut state, &key);
                        drop(state);
                    } else if state.slots.contains_key(&key) {
                        drop(state);
                        notifications.extend(self.write(&key, RecordImage::clear));
                    }
                }
            }
            restored += 1;
        }

        notifications.deliver();
        restored
    }

    /// Drop every record, link and listener and abort their GC timers.
    /// Later writes are ignored.
    pub fn dispose(&self) {
        let (mut slots, links) = {
            let mut state = self.lock();
            state.disposed = true;
            state.backlinks.clear();
            (
                std::mem::take(&mut state.slots),
                std::mem::take(&mut state.links),
            )
        };
        for slot in slots.values_mut() {
            slot.cancel_gc();
        }
        debug!(records = slots.len(), queries = links.len(), "Entity store disposed");
    }
}

/// Writes applied while holding the store lock. See [`EntityStore::batch`].
pub struct WriteBatch<'a> {
    store: &'a EntityStore,
    state: MutexGuard<'a, StoreState>,
    notifications: Notifications,
}

impl WriteBatch<'_> {
    pub fn set<T: Any + Send + Sync>(&mut self, key: CacheKey, value: T, options: SetOptions) -> Arc<T> {
        let value = Arc::new(value);
        self.set_arc(key, Arc::clone(&value) as AnyValue, options);
        value
    }

    pub fn set_arc(&mut self, key: CacheKey, value: AnyValue, options: SetOptions) {
        let store = self.store;
        store.write_in(
            &mut self.state,
            &key,
            |image| {
                image.value = Some(value);
                image.fetched_at = Some(Instant::now());
                image.updated_at = Some(now_utc());
                image.state = if options.fresh {
                    RecordState::Fresh
                } else {
                    RecordState::Stale
                };
                image.error = None;
                if let Some(stale_after) = options.stale_after {
                    image.stale_after = stale_after;
                }
                if let Some(gc_after) = options.gc_after {
                    image.gc_after = gc_after;
                }
            },
            &mut self.notifications,
        );
    }

    /// Same contract as [`EntityStore::link`].
    pub fn link(&mut self, query: &CacheKey, entities: impl IntoIterator<Item = CacheKey>) {
        let store = self.store;
        store.link_in(&mut self.state, query, entities);
    }

    /// Same contract as [`EntityStore::update`].
    pub fn update<T, F>(&mut self, key: &CacheKey, f: F) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce(&T) -> T,
    {
        let store = self.store;
        store.update_in(&mut self.state, key, f, &mut self.notifications)
    }

    /// The value under `key` as seen inside the batch.
    pub fn value<T: Any + Send + Sync>(&self, key: &CacheKey) -> Option<Arc<T>> {
        self.state
            .slots
            .get(key)
            .and_then(|slot| slot.image.value.clone())
            .and_then(|value| value.downcast::<T>().ok())
    }

    /// Add `key` to `snapshot` unless already captured.
    pub fn capture(&self, snapshot: &mut StoreSnapshot, key: &CacheKey) -> bool {
        if snapshot.contains(key) {
            return false;
        }
        let image = self.state.slots.get(key).map(|slot| slot.image.clone());
        snapshot.images.push((key.clone(), image));
        true
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_core::{cache_key, RemoteError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn store() -> EntityStore {
        EntityStore::new(
            QueryConfig::default()
                .with_stale_after(Duration::from_secs(60))
                .with_gc_after(Duration::from_secs(60)),
        )
    }

    #[test]
    fn test_set_and_get_keep_reference() {
        let store = store();
        let key = cache_key!["todos", "detail", "7"];
        let stored = store.set(key.clone(), "buy milk".to_string(), SetOptions::fresh());

        let record = store.get_as::<String>(&key).unwrap();
        assert!(Arc::ptr_eq(record.value.as_ref().unwrap(), &stored));
        assert_eq!(record.version, 1);
        assert!(record.updated_at.is_some());
    }

    #[test]
    fn test_get_as_wrong_type() {
        let store = store();
        let key = cache_key!["n"];
        store.set(key.clone(), 5u32, SetOptions::fresh());
        assert!(store.get_as::<String>(&key).is_none());
        assert_eq!(store.value::<u32>(&key).as_deref(), Some(&5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_record_reported_stale_after_window() {
        let store = store();
        let key = cache_key!["posts", "byId", 1];
        store.set(
            key.clone(),
            1u8,
            SetOptions::fresh().with_stale_after(Duration::from_secs(5)),
        );
        assert_eq!(store.get(&key).unwrap().state, RecordState::Fresh);

        tokio::time::advance(Duration::from_secs(5)).await;
        let record = store.get(&key).unwrap();
        assert_eq!(record.state, RecordState::Stale);
        assert_eq!(record.version, 1);
    }

    #[test]
    fn test_invalidate_prefix_marks_stale_and_keeps_data() {
        let store = store();
        store.set(cache_key!["posts", "byId", 1], 1u8, SetOptions::fresh());
        store.set(cache_key!["posts", "byId", 2], 2u8, SetOptions::fresh());
        store.set(cache_key!["todos", "list"], 3u8, SetOptions::fresh());

        assert_eq!(store.invalidate(&cache_key!["posts"]), 2);
        let record = store.get(&cache_key!["posts", "byId", 1]).unwrap();
        assert_eq!(record.state, RecordState::Stale);
        assert!(record.has_value());
        assert_eq!(
            store.get(&cache_key!["todos", "list"]).unwrap().state,
            RecordState::Fresh
        );
    }

    #[test]
    fn test_reset_drops_data() {
        let store = store();
        store.set(cache_key!["posts", "list"], vec![1u8], SetOptions::fresh());
        assert_eq!(store.reset(&cache_key!["posts"]), 1);
        let record = store.get(&cache_key!["posts", "list"]).unwrap();
        assert_eq!(record.state, RecordState::Idle);
        assert!(!record.has_value());
    }

    #[test]
    fn test_subscriber_sees_writes() {
        let store = store();
        let key = cache_key!["todos", "detail", "7"];
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = store.subscribe(key.clone(), move |record| {
            sink.lock().unwrap().push(record.state);
        });

        store.set(key.clone(), 1u8, SetOptions::stale());
        store.invalidate(&key);
        store.set(key.clone(), 2u8, SetOptions::fresh());

        assert_eq!(
            *seen.lock().unwrap(),
            vec![RecordState::Stale, RecordState::Stale, RecordState::Fresh]
        );
    }

    #[test]
    fn test_listener_may_reenter_store() {
        let store = store();
        let key = cache_key!["a"];
        let mirror = store.clone();
        let _sub = store.subscribe(key.clone(), move |record| {
            let value = record.value_as::<u8>().map(|v| *v).unwrap_or_default();
            mirror.set(cache_key!["b"], value, SetOptions::fresh());
        });
        store.set(key, 9u8, SetOptions::fresh());
        assert_eq!(store.value::<u8>(&cache_key!["b"]).as_deref(), Some(&9));
    }

    #[test]
    fn test_linked_query_notified_by_entity_write() {
        let store = store();
        let list = cache_key!["posts", "list"];
        let item = cache_key!["posts", "byId", 42];
        store.set(list.clone(), vec![item.clone()], SetOptions::fresh());
        store.link(&list, [item.clone()]);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let _sub = store.subscribe(list.clone(), move |record| {
            assert_eq!(record.key, cache_key!["posts", "list"]);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        store.set(item, "edited".to_string(), SetOptions::fresh());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.linked(&list).len(), 1);
    }

    #[test]
    fn test_evict_refused_with_subscribers() {
        let store = store();
        let key = cache_key!["todos", "list"];
        let sub = store.subscribe(key.clone(), |_| {});

        let err = store.evict(&key).unwrap_err();
        assert_eq!(err, StoreError::HasSubscribers { key: key.clone(), count: 1 });

        sub.unsubscribe();
        assert!(store.evict(&key).is_ok());
        assert!(!store.contains(&key));
        assert_eq!(store.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc_evicts_unobserved_record() {
        let store = store();
        let key = cache_key!["todos", "detail", "1"];
        store.set(key.clone(), 1u8, SetOptions::fresh());

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(store.contains(&key));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!store.contains(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_cancels_eviction() {
        let store = store();
        let key = cache_key!["todos", "detail", "1"];
        store.set(key.clone(), 1u8, SetOptions::fresh());

        tokio::time::sleep(Duration::from_secs(30)).await;
        let sub = store.subscribe(key.clone(), |_| {});
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(store.contains(&key));

        // Timer restarts from the unsubscribe.
        drop(sub);
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(store.contains(&key));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!store.contains(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rewrite_restarts_eviction_window() {
        let store = store();
        let key = cache_key!["todos", "detail", "1"];
        store.set(key.clone(), 1u8, SetOptions::fresh());

        tokio::time::sleep(Duration::from_secs(40)).await;
        store.set(key.clone(), 2u8, SetOptions::fresh());
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(store.contains(&key));
        tokio::time::sleep(Duration::from_secs(21)).await;
        assert!(!store.contains(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rewrites_keep_one_gc_timer() {
        let store = store();
        let metrics = tokio::runtime::Handle::current().metrics();
        let baseline = metrics.num_alive_tasks();

        let key = cache_key!["todos", "detail", "1"];
        for i in 0..20u8 {
            store.set(key.clone(), i, SetOptions::fresh());
        }
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        assert_eq!(metrics.num_alive_tasks(), baseline + 1);

        let _sub = store.subscribe(key.clone(), |_| {});
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        assert_eq!(metrics.num_alive_tasks(), baseline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_linked_entities_outlive_their_own_timer() {
        let store = store();
        let list = cache_key!["posts", "list"];
        let item = cache_key!["posts", "byId", 1];
        let _mounted = store.retain(list.clone());
        store.set(item.clone(), 1u8, SetOptions::fresh());
        store.link(&list, [item.clone()]);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(store.contains(&item));

        store.reset(&list);
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(!store.contains(&item));
    }

    #[test]
    fn test_snapshot_restore_is_verbatim() {
        let store = store();
        let key = cache_key!["todos", "detail", "7"];
        let original = store.set(key.clone(), false, SetOptions::fresh());
        let absent = cache_key!["todos", "detail", "8"];

        let snapshot = store.snapshot([&key, &absent]);
        store.set(key.clone(), true, SetOptions::stale());
        store.set(absent.clone(), true, SetOptions::fresh());

        assert_eq!(store.restore(snapshot), 2);
        let record = store.get_as::<bool>(&key).unwrap();
        assert!(Arc::ptr_eq(record.value.as_ref().unwrap(), &original));
        assert_eq!(record.state, RecordState::Fresh);
        assert_eq!(record.version, 3);
        assert!(!store.contains(&absent));
    }

    #[test]
    fn test_update_is_copy_on_write() {
        let store = store();
        let key = cache_key!["todos", "list"];
        let before = store.set(key.clone(), vec![1u8, 2], SetOptions::fresh());
        let after = store
            .update::<Vec<u8>, _>(&key, |items| {
                let mut items = items.clone();
                items.push(3);
                items
            })
            .unwrap();

        assert_eq!(*before, vec![1, 2]);
        assert_eq!(*after, vec![1, 2, 3]);
        assert!(store.update::<String, _>(&key, |s| s.clone()).is_none());
    }

    #[test]
    fn test_fail_retains_value() {
        let store = store();
        let key = cache_key!["profile", "byId", "u1"];
        store.set(key.clone(), 1u8, SetOptions::fresh());
        store
            .fail(&key, RemoteError::transient("fetch_profile", "503").into())
            .deliver();

        let record = store.get(&key).unwrap();
        assert_eq!(record.state, RecordState::Error);
        assert!(record.has_value());
        assert!(record.error.is_some());
    }

    #[test]
    fn test_dispose_clears_and_ignores_writes() {
        let store = store();
        store.set(cache_key!["a"], 1u8, SetOptions::fresh());
        store.dispose();

        assert!(store.is_empty());
        store.set(cache_key!["b"], 2u8, SetOptions::fresh());
        assert!(store.is_empty());
        assert_eq!(store.evict(&cache_key!["a"]), Err(StoreError::Disposed));
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(100))]

        /// Whatever is written after a snapshot, restoring it brings back
        /// exactly the captured references and presence.
        #[test]
        fn prop_restore_undoes_any_writes(
            initial in proptest::collection::vec(proptest::option::of(0u8..100), 1..6),
            writes in proptest::collection::vec((0usize..6, 0u8..100), 0..20),
        ) {
            let store = store();
            let keys: Vec<CacheKey> = (0..initial.len()).map(|i| cache_key!["k", i]).collect();
            let mut originals = Vec::new();
            for (key, value) in keys.iter().zip(&initial) {
                originals.push(value.map(|v| store.set(key.clone(), v, SetOptions::fresh())));
            }

            let snapshot = store.snapshot(&keys);
            for (index, value) in writes {
                if let Some(key) = keys.get(index) {
                    store.set(key.clone(), value, SetOptions::stale());
                }
            }
            proptest::prop_assert_eq!(store.restore(snapshot), keys.len());

            for (key, original) in keys.iter().zip(&originals) {
                let current = store.value::<u8>(key);
                match original {
                    Some(original) => {
                        let current = current.unwrap();
                        proptest::prop_assert!(Arc::ptr_eq(&current, original));
                    }
                    None => proptest::prop_assert!(current.is_none()),
                }
            }
        }

        /// Invalidating a prefix touches exactly the records under it.
        #[test]
        fn prop_invalidate_counts_records_under_prefix(
            left in 0usize..5,
            right in 0usize..5,
        ) {
            let store = store();
            for i in 0..left {
                store.set(cache_key!["left", i], i as u8, SetOptions::fresh());
            }
            for i in 0..right {
                store.set(cache_key!["right", i], i as u8, SetOptions::fresh());
            }
            proptest::prop_assert_eq!(store.invalidate(&cache_key!["left"]), left);
            proptest::prop_assert_eq!(store.invalidate(&CacheKey::root()), left + right);
        }
    }

    #[test]
    fn test_batch_delivers_after_all_writes() {
        let store = store();
        let detail = cache_key!["todos", "detail", "7"];
        let list = cache_key!["todos", "list"];
        store.set(detail.clone(), false, SetOptions::fresh());
        store.set(list.clone(), vec![false], SetOptions::fresh());

        let observer = store.clone();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let list_key = list.clone();
        let _sub = store.subscribe(detail.clone(), move |_| {
            let list = observer.value::<Vec<bool>>(&list_key).unwrap();
            sink.lock().unwrap().push(list[0]);
        });

        let mut snapshot = StoreSnapshot::new();
        let written = store.batch(|batch| {
            batch.capture(&mut snapshot, &detail);
            batch.capture(&mut snapshot, &list);
            batch.set(detail.clone(), true, SetOptions::fresh());
            batch.update::<Vec<bool>, _>(&list, |_| vec![true]);
            batch.value::<bool>(&detail)
        });

        assert_eq!(written.as_deref(), Some(&true));
        assert_eq!(*seen.lock().unwrap(), vec![true]);
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn test_stats_count_hits_and_misses() {
        let store = store();
        store.set(cache_key!["a"], 1u8, SetOptions::fresh());
        store.get(&cache_key!["a"]);
        store.get(&cache_key!["missing"]);
        let stats = store.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entry_count, 1);
    }

    #[test]
    fn test_reads_leave_records_untouched() {
        let store = store();
        let key = cache_key!["a"];
        store.set(key.clone(), 1u8, SetOptions::fresh());
        let before = store.get(&key).unwrap();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                let key = key.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        store.get(&key);
                    }
                })
            })
            .collect();
        for reader in readers {
            reader.join().unwrap();
        }

        let after = store.get(&key).unwrap();
        assert_eq!(after.version, before.version);
        assert_eq!(after.updated_at, before.updated_at);
        assert_eq!(store.stats().hits, 202);
    }
}
