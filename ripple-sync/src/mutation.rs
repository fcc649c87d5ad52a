//! Mutation pipeline.
//!
//! A mutation is a remote write plus its effect on the cache. The pipeline
//! runs it in a fixed order:
//!
//! 1. take the queue lock of every touched key (sorted, so overlapping
//!    mutations serialize without deadlock);
//! 2. cancel in-flight queries on those keys;
//! 3. snapshot the touched records and apply the optimistic update in one
//!    store batch;
//! 4. run the remote action, retrying transient failures;
//! 5. on success reconcile with the server value and invalidate/reset the
//!    declared prefixes, on failure restore the snapshot;
//! 6. release the locks.
//!
//! A second mutation on the same key therefore snapshots the state the
//! first one left behind.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ripple_core::{
    CacheKey, MutationConfig, MutationError, RemoteResult, SyncError,
};
use ripple_storage::{with_retry, EntityStore, QueryRegistry, SetOptions, StoreSnapshot, WriteBatch};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, info_span, warn, Instrument};

type OptimisticFn = Box<dyn FnOnce(&mut OptimisticWriter<'_, '_>) + Send>;
type ReconcileFn<R> = Box<dyn FnOnce(&EntityStore, &R) + Send>;

/// Declares the cache effects of one remote write.
pub struct Mutation<R> {
    name: String,
    keys: Vec<CacheKey>,
    optimistic: Option<OptimisticFn>,
    reconcile: Option<ReconcileFn<R>>,
    invalidate: Vec<CacheKey>,
    reset: Vec<CacheKey>,
    config: Option<MutationConfig>,
}

impl<R> Mutation<R> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keys: Vec::new(),
            optimistic: None,
            reconcile: None,
            invalidate: Vec::new(),
            reset: Vec::new(),
            config: None,
        }
    }

    /// Declare a key this mutation writes. Touched keys are queued,
    /// cancelled and snapshotted before anything else happens.
    pub fn touches(mut self, key: CacheKey) -> Self {
        self.keys.push(key);
        self
    }

    /// Cache writes to apply before the remote call. They are rolled back
    /// if the call fails.
    pub fn optimistic<F>(mut self, apply: F) -> Self
    where
        F: FnOnce(&mut OptimisticWriter<'_, '_>) + Send + 'static,
    {
        self.optimistic = Some(Box::new(apply));
        self
    }

    /// Cache writes to apply with the server's answer. The server value wins
    /// over anything the optimistic update wrote.
    pub fn reconcile<F>(mut self, apply: F) -> Self
    where
        F: FnOnce(&EntityStore, &R) + Send + 'static,
    {
        self.reconcile = Some(Box::new(apply));
        self
    }

    /// Mark `prefix` stale on success.
    pub fn invalidates(mut self, prefix: CacheKey) -> Self {
        self.invalidate.push(prefix);
        self
    }

    /// Drop the data under `prefix` on success.
    pub fn resets(mut self, prefix: CacheKey) -> Self {
        self.reset.push(prefix);
        self
    }

    pub fn with_config(mut self, config: MutationConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_optimistic(&self) -> bool {
        self.optimistic.is_some()
    }
}

impl<R> std::fmt::Debug for Mutation<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutation")
            .field("name", &self.name)
            .field("keys", &self.keys)
            .field("optimistic", &self.optimistic.is_some())
            .field("invalidate", &self.invalidate)
            .field("reset", &self.reset)
            .finish()
    }
}

/// Store access for an optimistic update.
///
/// Every key written through the writer is added to the mutation's
/// snapshot on first write, so undeclared keys roll back too. All writes
/// become visible together when the update returns.
pub struct OptimisticWriter<'b, 's> {
    batch: &'b mut WriteBatch<'s>,
    snapshot: &'b mut StoreSnapshot,
    writes: usize,
}

impl OptimisticWriter<'_, '_> {
    pub fn set<T: Any + Send + Sync>(&mut self, key: CacheKey, value: T) -> Arc<T> {
        self.batch.capture(self.snapshot, &key);
        self.writes += 1;
        self.batch.set(key, value, SetOptions::fresh())
    }

    /// Replace the value under `key` with `f(current)`. Nothing is written
    /// if the key holds no `T`.
    pub fn update<T, F>(&mut self, key: &CacheKey, f: F) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce(&T) -> T,
    {
        self.batch.capture(self.snapshot, key);
        let next = self.batch.update(key, f);
        if next.is_some() {
            self.writes += 1;
        }
        next
    }

    pub fn value<T: Any + Send + Sync>(&self, key: &CacheKey) -> Option<Arc<T>> {
        self.batch.value(key)
    }
}

/// Result of a committed mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationOutcome<R> {
    /// The server's answer.
    pub value: R,
    /// Optimistic writes that were kept.
    pub optimistic_writes: usize,
    /// Records marked stale or reset by the declared prefixes.
    pub invalidated: usize,
}

/// Runs mutations against a registry.
///
/// Cloning is cheap; clones share the per-key queues.
#[derive(Clone)]
pub struct MutationPipeline {
    registry: QueryRegistry,
    queues: Arc<Mutex<HashMap<CacheKey, Arc<AsyncMutex<()>>>>>,
    config: MutationConfig,
}

impl std::fmt::Debug for MutationPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationPipeline")
            .field("queued_keys", &self.lock_queues().len())
            .field("config", &self.config)
            .finish()
    }
}

impl MutationPipeline {
    pub fn new(registry: QueryRegistry, config: MutationConfig) -> Self {
        Self {
            registry,
            queues: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    pub fn config(&self) -> &MutationConfig {
        &self.config
    }

    fn lock_queues(&self) -> MutexGuard<'_, HashMap<CacheKey, Arc<AsyncMutex<()>>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queue(&self, key: &CacheKey) -> Arc<AsyncMutex<()>> {
        Arc::clone(self.lock_queues().entry(key.clone()).or_default())
    }

    /// Keys whose queue is currently held or awaited.
    pub fn busy_keys(&self) -> usize {
        self.lock_queues()
            .values()
            .filter(|queue| queue.try_lock().is_err())
            .count()
    }

    /// Run `mutation` with `action` as its remote call.
    ///
    /// `action` is called once per attempt. On failure the cache is
    /// returned to its pre-mutation images (same `Arc`s) and the remote
    /// error comes back as [`MutationError::RolledBack`].
    pub async fn mutate<R, A, Fut>(&self, mutation: Mutation<R>, action: A) -> Result<MutationOutcome<R>, SyncError>
    where
        A: FnMut() -> Fut,
        Fut: Future<Output = RemoteResult<R>>,
    {
        let span = info_span!("mutation", name = %mutation.name, keys = mutation.keys.len());
        self.run(mutation, action).instrument(span).await
    }

    async fn run<R, A, Fut>(&self, mutation: Mutation<R>, action: A) -> Result<MutationOutcome<R>, SyncError>
    where
        A: FnMut() -> Fut,
        Fut: Future<Output = RemoteResult<R>>,
    {
        let Mutation {
            name,
            mut keys,
            optimistic,
            reconcile,
            invalidate,
            reset,
            config,
        } = mutation;
        keys.sort();
        keys.dedup();

        let mut guards: Vec<OwnedMutexGuard<()>> = Vec::with_capacity(keys.len());
        for key in &keys {
            guards.push(self.queue(key).lock_owned().await);
        }

        for key in &keys {
            if self.registry.cancel(key) {
                debug!(key = %key, "Cancelled in-flight query for mutation");
            }
        }

        let store = self.registry.store();
        let optimistic_applied = optimistic.is_some();
        let mut snapshot = StoreSnapshot::new();
        let writes = store.batch(|batch| {
            for key in &keys {
                batch.capture(&mut snapshot, key);
            }
            match optimistic {
                Some(apply) => {
                    let mut writer = OptimisticWriter {
                        batch,
                        snapshot: &mut snapshot,
                        writes: 0,
                    };
                    apply(&mut writer);
                    writer.writes
                }
                None => 0,
            }
        });

        let retry = config.unwrap_or(self.config).retry;
        let result = with_retry(&name, &retry, action).await;

        let outcome = match result {
            Ok(value) => {
                drop(snapshot);
                if let Some(reconcile) = reconcile {
                    reconcile(store, &value);
                }
                let mut invalidated = 0;
                for prefix in &invalidate {
                    invalidated += self.registry.invalidate(prefix);
                }
                for prefix in &reset {
                    invalidated += self.registry.reset(prefix);
                }
                info!(
                    optimistic_writes = writes,
                    invalidated, "Mutation committed"
                );
                Ok(MutationOutcome {
                    value,
                    optimistic_writes: writes,
                    invalidated,
                })
            }
            Err(source) => {
                let restored = if optimistic_applied {
                    store.restore(snapshot)
                } else {
                    0
                };
                warn!(error = %source, restored, "Mutation failed; cache rolled back");
                Err(MutationError::RolledBack { source, restored }.into())
            }
        };

        drop(guards);
        self.prune_queues(&keys);
        outcome
    }

    /// Forget queues nobody holds or waits on.
    fn prune_queues(&self, keys: &[CacheKey]) {
        let mut queues = self.lock_queues();
        for key in keys {
            let idle = queues
                .get(key)
                .is_some_and(|queue| Arc::strong_count(queue) == 1);
            if idle {
                queues.remove(key);
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
