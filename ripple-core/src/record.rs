//! Entity records: a cached value plus its freshness and lifecycle metadata.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::{CacheKey, Instant, SyncError, Timestamp};

/// Type-erased stored value. Typed access goes through [`EntityRecord::downcast`].
pub type AnyValue = Arc<dyn Any + Send + Sync>;

/// Lifecycle state of a cached record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordState {
    /// Known key, no data and nothing in flight.
    Idle,
    /// Exactly one fetch owns this key.
    Pending,
    /// Confirmed by the remote service within the freshness window.
    Fresh,
    /// Data retained but the next read must refetch.
    Stale,
    /// The last fetch failed; any previous value is retained.
    Error,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Pending => "pending",
            Self::Fresh => "fresh",
            Self::Stale => "stale",
            Self::Error => "error",
        }
    }

    /// States in which a read should schedule a refresh.
    pub fn needs_refresh(&self) -> bool {
        matches!(self, Self::Idle | Self::Stale | Self::Error)
    }
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one cache entry as seen by readers and listeners.
///
/// Records are values: the store hands out copies and never lets callers
/// mutate stored state through them. `value` is shared by reference, so
/// `Arc::ptr_eq` on two reads tells whether the value was replaced.
pub struct EntityRecord<T: ?Sized = dyn Any + Send + Sync> {
    pub key: CacheKey,
    pub value: Option<Arc<T>>,
    /// Monotonic time of the last write that carried a value.
    pub fetched_at: Option<Instant>,
    /// Wall-clock time of the last write that carried a value.
    pub updated_at: Option<Timestamp>,
    pub state: RecordState,
    pub error: Option<SyncError>,
    pub stale_after: Duration,
    pub gc_after: Duration,
    pub subscriber_count: usize,
    /// Incremented on every write to this key.
    pub version: u64,
}

impl<T: ?Sized> EntityRecord<T> {
    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    pub fn is_pending(&self) -> bool {
        self.state == RecordState::Pending
    }

    pub fn is_fresh(&self) -> bool {
        self.state == RecordState::Fresh
    }

    pub fn is_error(&self) -> bool {
        self.state == RecordState::Error
    }

    /// True if a fresh record has outlived its `stale_after` window at `now`.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        match self.fetched_at {
            Some(fetched_at) => now.saturating_duration_since(fetched_at) >= self.stale_after,
            None => true,
        }
    }

    fn with_value<U: ?Sized>(&self, value: Option<Arc<U>>) -> EntityRecord<U> {
        EntityRecord {
            key: self.key.clone(),
            value,
            fetched_at: self.fetched_at,
            updated_at: self.updated_at,
            state: self.state,
            error: self.error.clone(),
            stale_after: self.stale_after,
            gc_after: self.gc_after,
            subscriber_count: self.subscriber_count,
            version: self.version,
        }
    }
}

impl EntityRecord {
    /// View this record with a concrete value type.
    ///
    /// Returns `None` if a value is present but is not a `T`. A record
    /// without a value downcasts to any type.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<EntityRecord<T>> {
        match &self.value {
            None => Some(self.with_value(None)),
            Some(value) => {
                let typed = Arc::clone(value).downcast::<T>().ok()?;
                Some(self.with_value(Some(typed)))
            }
        }
    }

    /// The stored value as a `T`, if present and of that type.
    pub fn value_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.value
            .as_ref()
            .and_then(|value| Arc::clone(value).downcast::<T>().ok())
    }
}

impl<T: ?Sized> Clone for EntityRecord<T> {
    fn clone(&self) -> Self {
        self.with_value(self.value.clone())
    }
}

impl<T: ?Sized> fmt::Debug for EntityRecord<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityRecord")
            .field("key", &self.key)
            .field("has_value", &self.value.is_some())
            .field("state", &self.state)
            .field("error", &self.error)
            .field("stale_after", &self.stale_after)
            .field("gc_after", &self.gc_after)
            .field("subscriber_count", &self.subscriber_count)
            .field("version", &self.version)
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================
