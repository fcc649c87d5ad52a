//! RIPPLE Test Utilities
//!
//! Shared test infrastructure for the Ripple workspace:
//! - Proptest generators for keys, entities and configuration
//! - Fixtures for contexts, seeded backends and entities
//! - Assertions for reference identity and error variants

// Re-export the in-memory backend from its source crate
pub use ripple_sync::{ops, InMemoryRemote, SyncContext};

// Re-export core types for convenience
pub use ripple_core::{
    cache_key, Asset, Backoff, CacheKey, KeyToken, MutationConfig, MutationError, Post, PostDraft,
    PostId, Profile, QueryConfig, QueryError, RecordState, RemoteError, RetryConfig, SagaConfig,
    SyncConfig, SyncError, SyncResult, Timestamp, Todo,
};
pub use ripple_storage::{EntityStore, QueryRegistry, SetOptions};

use std::time::Duration;

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Ripple types.

    use super::*;
    use chrono::{DateTime, Utc};
    use proptest::prelude::*;

    /// A key token: a short word or a small id.
    pub fn arb_token() -> impl Strategy<Value = KeyToken> {
        prop_oneof![
            "[a-z]{1,8}".prop_map(KeyToken::from),
            (0i64..1000).prop_map(KeyToken::from),
        ]
    }

    /// A key of one to four tokens.
    pub fn arb_cache_key() -> impl Strategy<Value = CacheKey> {
        prop::collection::vec(arb_token(), 1..5).prop_map(CacheKey::from_tokens)
    }

    /// Generate a Timestamp between 2020 and 2030.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1577836800i64..1893456000i64)
            .prop_map(|secs| DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now))
    }

    pub fn arb_todo() -> impl Strategy<Value = Todo> {
        (1u32..10_000, "[a-z ]{1,24}", any::<bool>()).prop_map(|(id, content, completed)| Todo {
            id: id.to_string(),
            content,
            completed,
        })
    }

    pub fn arb_post() -> impl Strategy<Value = Post> {
        (
            1i64..100_000,
            "[a-z ]{1,64}",
            prop::collection::vec("[a-z]{4,8}\\.png", 0..4),
            "[a-z0-9]{8}",
            arb_timestamp(),
        )
            .prop_map(|(id, content, files, author_id, created_at)| Post {
                id,
                content,
                image_urls: files
                    .into_iter()
                    .map(|file| format!("https://storage.local/uploads/{author_id}/{id}/{file}"))
                    .collect(),
                author_id,
                created_at,
            })
    }

    pub fn arb_backoff() -> impl Strategy<Value = Backoff> {
        prop_oneof![
            Just(Backoff::None),
            (1u64..5_000).prop_map(|ms| Backoff::fixed(Duration::from_millis(ms))),
            (1u64..5_000, 0u64..60_000).prop_map(|(base, extra)| Backoff::exponential(
                Duration::from_millis(base),
                Duration::from_millis(base + extra),
            )),
        ]
    }

    /// A retry configuration that passes validation.
    pub fn arb_retry_config() -> impl Strategy<Value = RetryConfig> {
        (0u32..=10, arb_backoff()).prop_map(|(retries, backoff)| RetryConfig { retries, backoff })
    }

    /// A full configuration that passes validation.
    pub fn arb_valid_config() -> impl Strategy<Value = SyncConfig> {
        (
            0u64..600_000,
            0u64..3_600_000,
            arb_retry_config(),
            arb_retry_config(),
            any::<bool>(),
        )
            .prop_map(|(stale_ms, gc_ms, query_retry, mutation_retry, cleanup)| SyncConfig {
                query: QueryConfig::default()
                    .with_stale_after(Duration::from_millis(stale_ms))
                    .with_gc_after(Duration::from_millis(gc_ms))
                    .with_retry(query_retry),
                mutation: MutationConfig::default().with_retry(mutation_retry),
                saga: SagaConfig {
                    cleanup_orphaned_assets: cleanup,
                },
            })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common scenarios.

    use std::sync::Arc;

    use super::*;

    /// Configuration for deterministic tests: records stay fresh for a
    /// minute and nothing is retried.
    pub fn test_config() -> SyncConfig {
        let mut config = SyncConfig::default();
        config.query = config
            .query
            .with_stale_after(Duration::from_secs(60))
            .with_retry(RetryConfig::none());
        config.mutation.retry = RetryConfig::none();
        config
    }

    pub fn context() -> SyncContext {
        context_with(test_config())
    }

    pub fn context_with(config: SyncConfig) -> SyncContext {
        match SyncContext::init(config) {
            Ok(ctx) => ctx,
            Err(e) => panic!("test configuration rejected: {e}"),
        }
    }

    pub fn todo(id: &str, content: &str) -> Todo {
        Todo {
            id: id.to_string(),
            content: content.to_string(),
            completed: false,
        }
    }

    pub fn draft(author_id: &str, content: &str) -> PostDraft {
        PostDraft {
            author_id: author_id.to_string(),
            content: content.to_string(),
        }
    }

    /// `count` PNG images named `img{n}.png`.
    pub fn png_assets(count: usize) -> Vec<Asset> {
        (0..count)
            .map(|n| Asset::new(format!("img{n}.png"), "image/png", vec![n as u8; 16]))
            .collect()
    }

    /// A backend holding todos `1..=count` with content `todo #n`.
    pub fn todo_backend(count: usize) -> Arc<InMemoryRemote> {
        let remote = InMemoryRemote::new();
        for n in 1..=count {
            remote.insert_todo(todo(&n.to_string(), &format!("todo #{n}")));
        }
        Arc::new(remote)
    }

    /// A backend holding `count` text posts by `author_id`.
    pub fn post_backend(count: usize, author_id: &str) -> Arc<InMemoryRemote> {
        let remote = InMemoryRemote::new();
        remote.seed_posts(count, author_id);
        Arc::new(remote)
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for Ripple-specific checks.

    use std::sync::Arc;

    use super::*;

    /// Assert two handles point at the same allocation.
    #[track_caller]
    pub fn assert_same_arc<T: ?Sized>(left: &Arc<T>, right: &Arc<T>) {
        assert!(Arc::ptr_eq(left, right), "expected the same Arc, got two allocations");
    }

    #[track_caller]
    pub fn assert_rolled_back<T: std::fmt::Debug>(result: &SyncResult<T>) {
        match result {
            Err(SyncError::Mutation(MutationError::RolledBack { .. })) => {}
            other => panic!("Expected rolled-back mutation, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &SyncResult<T>) {
        match result {
            Err(e) if e.remote().is_some_and(RemoteError::is_not_found) => {}
            other => panic!("Expected NotFound, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_config_error<T: std::fmt::Debug>(result: &SyncResult<T>) {
        match result {
            Err(SyncError::Config(_)) => {}
            other => panic!("Expected Config error, got: {:?}", other),
        }
    }
}
