//! RIPPLE Core - Synchronization Types
//!
//! Pure data structures shared by every other crate in the workspace:
//! cache keys, entity records, the error taxonomy, configuration and the
//! domain entities mirrored from the remote service. No I/O lives here.

use chrono::{DateTime, Utc};

pub mod config;
pub mod entities;
pub mod error;
pub mod key;
pub mod keys;
pub mod record;

pub use config::{Backoff, MutationConfig, QueryConfig, RetryConfig, SagaConfig, SyncConfig};
pub use entities::{
    Asset, Post, PostDraft, PostId, PostPatch, Profile, Todo, TodoDraft, TodoPatch, UploadedAsset,
};
pub use error::{
    CompensationFailure, ConfigError, MutationError, QueryError, RemoteError, RemoteResult,
    SagaFailure, StoreError, SyncError, SyncResult,
};
pub use key::{CacheKey, KeyToken};
pub use record::{AnyValue, EntityRecord, RecordState};

// ============================================================================
// SHARED ALIASES
// ============================================================================

/// Wall-clock timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Monotonic instant used for staleness and GC arithmetic.
///
/// This is tokio's instant so paused-time tests drive freshness windows.
pub type Instant = tokio::time::Instant;

/// Current wall-clock time.
pub fn now_utc() -> Timestamp {
    Utc::now()
}
