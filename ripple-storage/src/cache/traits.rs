//! Fetcher traits and store statistics.
//!
//! A fetcher is the only place a query suspends. Closures returning a
//! future implement both traits, so most call sites pass an `async move`
//! block directly.

use std::future::Future;

use async_trait::async_trait;
use ripple_core::RemoteResult;

/// Loads the value for a single query key from the remote service.
///
/// Implementations must be repeatable: the registry calls `fetch` again for
/// every retry attempt.
#[async_trait]
pub trait Fetcher<T>: Send + Sync + 'static {
    async fn fetch(&self) -> RemoteResult<T>;
}

#[async_trait]
impl<T, F, Fut> Fetcher<T> for F
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RemoteResult<T>> + Send,
{
    async fn fetch(&self) -> RemoteResult<T> {
        (self)().await
    }
}

/// Loads one page of a paginated query.
#[async_trait]
pub trait PageFetcher<T, C>: Send + Sync + 'static {
    async fn fetch_page(&self, cursor: C) -> RemoteResult<Vec<T>>;
}

#[async_trait]
impl<T, C, F, Fut> PageFetcher<T, C> for F
where
    T: Send + 'static,
    C: Send + 'static,
    F: Fn(C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RemoteResult<Vec<T>>> + Send,
{
    async fn fetch_page(&self, cursor: C) -> RemoteResult<Vec<T>> {
        (self)(cursor).await
    }
}

/// Statistics about store usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Reads that found a value.
    pub hits: u64,
    /// Reads that found no record or a record without a value.
    pub misses: u64,
    /// Records currently held.
    pub entry_count: u64,
    /// Live listeners across all records.
    pub subscriber_count: u64,
    /// Records removed by GC or explicit eviction.
    pub evictions: u64,
}

impl StoreStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_core::RemoteError;

    #[tokio::test]
    async fn test_closure_is_a_fetcher() {
        let fetcher = || async { Ok::<_, RemoteError>(7u32) };
        assert_eq!(Fetcher::fetch(&fetcher).await, Ok(7));
    }

    #[tokio::test]
    async fn test_closure_is_a_page_fetcher() {
        let fetcher = |cursor: usize| async move { Ok::<_, RemoteError>(vec![cursor; 2]) };
        assert_eq!(fetcher.fetch_page(3).await, Ok(vec![3, 3]));
    }

    #[test]
    fn test_hit_rate() {
        let stats = StoreStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert_eq!(StoreStats::default().hit_rate(), 0.0);
    }
}
