//! Paginated queries.
//!
//! A paginated result is stored under its list key as a [`PagedResult`]
//! holding only item keys. Each item is normalized into its own record, and
//! the list key is linked to every item key, so writing a single item
//! notifies list subscribers and [`InfiniteQuery::items`] always reflects
//! the latest item records.
//!
//! Page fetches go through the registry: at most one per list key, tagged
//! with the key's generation. [`InfiniteQuery::remount`],
//! [`QueryRegistry::reset`] and [`QueryRegistry::cancel`] bump the
//! generation, so a page arriving after any of them is dropped instead of
//! being appended to a page sequence it no longer belongs to.

use std::any::Any;
use std::sync::Arc;

use ripple_core::{AnyValue, CacheKey, EntityRecord, QueryConfig, RecordState, SyncError};
use tracing::{debug, trace};

use super::registry::QueryRegistry;
use super::retry::with_retry;
use super::store::{Notifications, SetOptions};
use super::subscription::Subscription;
use super::traits::PageFetcher;

/// One fetched page: the cursor it was fetched with and its item keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<C> {
    pub cursor: C,
    pub ids: Vec<CacheKey>,
}

/// All pages fetched so far, in cursor order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagedResult<C> {
    pub pages: Vec<Page<C>>,
    /// Cursor of the next page, or `None` once the last page was short.
    pub next_cursor: Option<C>,
}

impl<C> PagedResult<C> {
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn has_next_page(&self) -> bool {
        self.next_cursor.is_some()
    }

    /// Item keys of every page, in order.
    pub fn ids(&self) -> impl Iterator<Item = &CacheKey> {
        self.pages.iter().flat_map(|page| page.ids.iter())
    }
}

/// Computes the next cursor from the newest page's items and all pages
/// (the newest included). `None` ends pagination.
pub type NextCursorFn<T, C> = dyn Fn(&[Arc<T>], &[Page<C>]) -> Option<C> + Send + Sync;

/// Maps an item to the key of its normalized record.
pub type EntityKeyFn<T> = dyn Fn(&T) -> CacheKey + Send + Sync;

/// Options for [`QueryRegistry::infinite_query`].
pub struct InfiniteOptions<T, C> {
    pub initial_cursor: C,
    pub get_next_cursor: Arc<NextCursorFn<T, C>>,
    pub entity_key: Arc<EntityKeyFn<T>>,
    /// Windows and retry policy for the list and its items.
    pub config: QueryConfig,
}

impl<T, C> InfiniteOptions<T, C> {
    pub fn new<N, K>(initial_cursor: C, get_next_cursor: N, entity_key: K) -> Self
    where
        N: Fn(&[Arc<T>], &[Page<C>]) -> Option<C> + Send + Sync + 'static,
        K: Fn(&T) -> CacheKey + Send + Sync + 'static,
    {
        Self {
            initial_cursor,
            get_next_cursor: Arc::new(get_next_cursor),
            entity_key: Arc::new(entity_key),
            config: QueryConfig::default(),
        }
    }

    pub fn with_config(mut self, config: QueryConfig) -> Self {
        self.config = config;
        self
    }
}

impl<T, C: Clone> Clone for InfiniteOptions<T, C> {
    fn clone(&self) -> Self {
        Self {
            initial_cursor: self.initial_cursor.clone(),
            get_next_cursor: Arc::clone(&self.get_next_cursor),
            entity_key: Arc::clone(&self.entity_key),
            config: self.config,
        }
    }
}

/// Outcome of a page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFetch {
    Fetched {
        page_index: usize,
        item_count: usize,
        has_next_page: bool,
    },
    /// Nothing to do: a page fetch already owns the key, there is no next
    /// page, or the requested page does not exist.
    Skipped,
    /// The list was remounted or reset while the page was in flight; the
    /// result was dropped.
    Superseded,
}

#[derive(Debug, Clone, Copy)]
enum Target {
    Next,
    Page(usize),
}

/// Releases the page claim if a fetch future is dropped before finishing.
struct PageClaim<'a> {
    registry: &'a QueryRegistry,
    key: &'a CacheKey,
    generation: u64,
    armed: bool,
}

impl Drop for PageClaim<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.registry.abandon_page(self.key, self.generation);
        }
    }
}

/// A mounted paginated query.
///
/// Holding the handle keeps the list record alive; dropping it releases the
/// record to garbage collection.
pub struct InfiniteQuery<T, C> {
    key: CacheKey,
    registry: QueryRegistry,
    fetcher: Arc<dyn PageFetcher<T, C>>,
    options: InfiniteOptions<T, C>,
    _retention: Subscription,
}

impl<T, C> InfiniteQuery<T, C>
where
    T: Any + Send + Sync,
    C: Clone + Send + Sync + 'static,
{
    pub(crate) fn mount(
        registry: QueryRegistry,
        key: CacheKey,
        fetcher: Arc<dyn PageFetcher<T, C>>,
        options: InfiniteOptions<T, C>,
    ) -> Self {
        let retention = registry.store().retain(key.clone());
        trace!(key = %key, "Mounted paginated query");
        Self {
            key,
            registry,
            fetcher,
            options,
            _retention: retention,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// The list record.
    pub fn record(&self) -> Option<EntityRecord<PagedResult<C>>> {
        self.registry.store().get_as::<PagedResult<C>>(&self.key)
    }

    pub fn pages(&self) -> Option<Arc<PagedResult<C>>> {
        self.registry.store().value::<PagedResult<C>>(&self.key)
    }

    /// True until a short page ends pagination.
    pub fn has_next_page(&self) -> bool {
        self.pages().map_or(true, |paged| paged.has_next_page())
    }

    pub fn is_fetching(&self) -> bool {
        self.registry.is_fetching(&self.key)
    }

    /// Items of every page in order, resolved through their normalized
    /// records. Items whose record is gone are skipped.
    pub fn items(&self) -> Vec<Arc<T>> {
        let Some(paged) = self.pages() else {
            return Vec::new();
        };
        let store = self.registry.store();
        paged.ids().filter_map(|id| store.value::<T>(id)).collect()
    }

    /// Observe the list. Writes to any linked item also notify.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&EntityRecord) + Send + Sync + 'static,
    {
        self.registry.store().subscribe(self.key.clone(), listener)
    }

    /// Fetch and append the next page.
    pub async fn fetch_next_page(&self) -> Result<PageFetch, SyncError> {
        self.run(Target::Next).await
    }

    /// Re-fetch page `index` in place. Later pages are kept.
    pub async fn refetch_page(&self, index: usize) -> Result<PageFetch, SyncError> {
        self.run(Target::Page(index)).await
    }

    /// Start over: supersede any in-flight page and clear all pages.
    pub fn remount(&self) {
        self.registry.remount(&self.key);
    }

    async fn run(&self, target: Target) -> Result<PageFetch, SyncError> {
        // A request with nothing to fetch must not touch the list record.
        let current = self.pages();
        let (index, cursor) = match (target, current.as_deref()) {
            (Target::Next, None) => (0, self.options.initial_cursor.clone()),
            (Target::Next, Some(paged)) => match &paged.next_cursor {
                Some(cursor) => (paged.len(), cursor.clone()),
                None => return Ok(PageFetch::Skipped),
            },
            (Target::Page(index), Some(paged)) if index < paged.len() => {
                (index, paged.pages[index].cursor.clone())
            }
            (Target::Page(_), _) => return Ok(PageFetch::Skipped),
        };

        let Some(generation) = self.registry.begin_page(&self.key, &self.options.config) else {
            trace!(key = %self.key, "Page fetch already in flight");
            return Ok(PageFetch::Skipped);
        };
        let mut claim = PageClaim {
            registry: &self.registry,
            key: &self.key,
            generation,
            armed: true,
        };

        let operation = self.key.to_string();
        let fetched = with_retry(&operation, &self.options.config.retry, || {
            self.fetcher.fetch_page(cursor.clone())
        })
        .await;
        claim.armed = false;

        let applied = self.registry.finish_page(&self.key, generation, |store, prior| {
            let items = match fetched {
                Ok(items) => items,
                Err(err) => {
                    let notifications = store.fail(&self.key, err.clone().into());
                    return (Err(SyncError::from(err)), notifications);
                }
            };

            let base = store.value::<PagedResult<C>>(&self.key);
            let mut pages = base.as_ref().map(|p| p.pages.clone()).unwrap_or_default();
            let mut next_cursor = base.as_ref().and_then(|p| p.next_cursor.clone());
            let fits = match target {
                Target::Next => pages.len() == index,
                Target::Page(_) => index < pages.len(),
            };
            if !fits {
                // The list changed between reading the cursor and claiming the key.
                return (Ok(PageFetch::Superseded), store.restore_image(&self.key, prior));
            }

            let mut notifications = Notifications::default();
            let item_options = SetOptions::from_config(&self.options.config);
            let items: Vec<Arc<T>> = items.into_iter().map(Arc::new).collect();
            let ids: Vec<CacheKey> = items
                .iter()
                .map(|item| (self.options.entity_key)(item.as_ref()))
                .collect();
            for (id, item) in ids.iter().zip(&items) {
                notifications.extend(store.set_quiet(
                    id.clone(),
                    Arc::clone(item) as AnyValue,
                    item_options,
                ));
            }

            let page = Page { cursor, ids };
            match target {
                Target::Next => {
                    pages.push(page);
                    next_cursor = (self.options.get_next_cursor)(items.as_slice(), pages.as_slice());
                }
                Target::Page(_) => {
                    pages[index] = page;
                    if index + 1 == pages.len() {
                        next_cursor = (self.options.get_next_cursor)(items.as_slice(), pages.as_slice());
                    }
                }
            }

            let has_next_page = next_cursor.is_some();
            let all_ids: Vec<CacheKey> = pages.iter().flat_map(|p| p.ids.iter().cloned()).collect();
            store.link(&self.key, all_ids);
            notifications.extend(store.set_quiet(
                self.key.clone(),
                Arc::new(PagedResult { pages, next_cursor }) as AnyValue,
                item_options,
            ));

            let outcome = PageFetch::Fetched {
                page_index: index,
                item_count: items.len(),
                has_next_page,
            };
            (Ok(outcome), notifications)
        });

        match applied {
            Some(outcome) => {
                if let Ok(PageFetch::Fetched { page_index, item_count, has_next_page }) = &outcome {
                    debug!(
                        key = %self.key,
                        page_index,
                        item_count,
                        has_next_page,
                        "Page fetched"
                    );
                }
                outcome
            }
            None => {
                debug!(key = %self.key, generation, "Dropped superseded page");
                Ok(PageFetch::Superseded)
            }
        }
    }

    /// State of the list record, if any.
    pub fn state(&self) -> Option<RecordState> {
        self.registry.store().get(&self.key).map(|record| record.state)
    }
}

impl<T, C> std::fmt::Debug for InfiniteQuery<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfiniteQuery").field("key", &self.key).finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::EntityStore;
    use futures_util::future::{BoxFuture, FutureExt};
    use ripple_core::{cache_key, RemoteError, RemoteResult, RetryConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const PAGE_SIZE: usize = 5;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: i64,
        title: String,
    }

    fn item_key(item: &Item) -> CacheKey {
        cache_key!["items", "byId", item.id]
    }

    fn options() -> InfiniteOptions<Item, usize> {
        InfiniteOptions::new(
            0usize,
            |last: &[Arc<Item>], pages: &[Page<usize>]| {
                (last.len() == PAGE_SIZE).then_some(pages.len())
            },
            item_key,
        )
        .with_config(QueryConfig::default().with_retry(RetryConfig::none()))
    }

    /// Serves `total` items, `PAGE_SIZE` per page, after `delay`.
    fn feed(
        total: usize,
        delay: Duration,
        calls: Arc<AtomicUsize>,
    ) -> impl Fn(usize) -> BoxFuture<'static, RemoteResult<Vec<Item>>> + Send + Sync + 'static {
        move |cursor| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                let from = cursor * PAGE_SIZE;
                let to = (from + PAGE_SIZE).min(total);
                Ok((from..to)
                    .map(|i| Item {
                        id: i as i64,
                        title: format!("item {}", i),
                    })
                    .collect())
            }
            .boxed()
        }
    }

    fn registry() -> QueryRegistry {
        QueryRegistry::new(EntityStore::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_pages_append_in_cursor_order_until_short_page() {
        let registry = registry();
        let calls = Arc::new(AtomicUsize::new(0));
        let feed = registry.infinite_query(
            cache_key!["items", "list"],
            feed(12, Duration::ZERO, Arc::clone(&calls)),
            options(),
        );

        for expected in 0..3 {
            let outcome = feed.fetch_next_page().await.unwrap();
            assert!(matches!(outcome, PageFetch::Fetched { page_index, .. } if page_index == expected));
        }
        assert!(!feed.has_next_page());
        assert_eq!(feed.fetch_next_page().await.unwrap(), PageFetch::Skipped);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let ids: Vec<i64> = feed.items().iter().map(|item| item.id).collect();
        assert_eq!(ids, (0..12).collect::<Vec<_>>());
        let paged = feed.pages().unwrap();
        assert_eq!(
            paged.pages.iter().map(|p| p.cursor).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_request_while_pending_is_skipped() {
        let registry = registry();
        let calls = Arc::new(AtomicUsize::new(0));
        let feed = registry.infinite_query(
            cache_key!["items", "list"],
            feed(20, Duration::from_millis(100), Arc::clone(&calls)),
            options(),
        );

        let (first, second) = tokio::join!(feed.fetch_next_page(), feed.fetch_next_page());
        assert!(matches!(first.unwrap(), PageFetch::Fetched { page_index: 0, .. }));
        assert_eq!(second.unwrap(), PageFetch::Skipped);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_item_update_visible_through_list() {
        let registry = registry();
        let feed = registry.infinite_query(
            cache_key!["items", "list"],
            feed(3, Duration::ZERO, Arc::new(AtomicUsize::new(0))),
            options(),
        );
        feed.fetch_next_page().await.unwrap();

        let notified = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notified);
        let _sub = feed.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        registry.store().set(
            cache_key!["items", "byId", 1],
            Item {
                id: 1,
                title: "edited".to_string(),
            },
            SetOptions::fresh(),
        );

        assert_eq!(feed.items()[1].title, "edited");
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refetch_first_page_keeps_later_pages() {
        let registry = registry();
        let feed = registry.infinite_query(
            cache_key!["items", "list"],
            feed(12, Duration::ZERO, Arc::new(AtomicUsize::new(0))),
            options(),
        );
        feed.fetch_next_page().await.unwrap();
        feed.fetch_next_page().await.unwrap();

        let outcome = feed.refetch_page(0).await.unwrap();
        assert!(matches!(outcome, PageFetch::Fetched { page_index: 0, .. }));
        let paged = feed.pages().unwrap();
        assert_eq!(paged.len(), 2);
        assert!(paged.has_next_page());
        assert_eq!(feed.refetch_page(7).await.unwrap(), PageFetch::Skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remount_drops_in_flight_page() {
        let registry = registry();
        let feed = Arc::new(registry.infinite_query(
            cache_key!["items", "list"],
            feed(20, Duration::from_millis(100), Arc::new(AtomicUsize::new(0))),
            options(),
        ));

        let background = {
            let feed = Arc::clone(&feed);
            tokio::spawn(async move { feed.fetch_next_page().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        feed.remount();

        assert_eq!(background.await.unwrap().unwrap(), PageFetch::Superseded);
        assert!(feed.pages().is_none());
        assert!(feed.items().is_empty());

        let outcome = feed.fetch_next_page().await.unwrap();
        assert!(matches!(outcome, PageFetch::Fetched { page_index: 0, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_request_leaves_list_untouched() {
        let registry = registry();
        let calls = Arc::new(AtomicUsize::new(0));
        let feed = registry.infinite_query(
            cache_key!["items", "list"],
            feed(3, Duration::ZERO, Arc::clone(&calls)),
            options(),
        );
        feed.fetch_next_page().await.unwrap();
        assert!(!feed.has_next_page());
        let version = feed.record().unwrap().version;

        let notified = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notified);
        let _sub = feed.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(feed.fetch_next_page().await.unwrap(), PageFetch::Skipped);
        assert_eq!(feed.refetch_page(4).await.unwrap(), PageFetch::Skipped);
        assert_eq!(notified.load(Ordering::SeqCst), 0);
        assert_eq!(feed.record().unwrap().version, version);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_in_flight_page_and_restores_list() {
        let registry = registry();
        let key = cache_key!["items", "list"];
        let feed = Arc::new(registry.infinite_query(
            key.clone(),
            feed(20, Duration::from_millis(100), Arc::new(AtomicUsize::new(0))),
            options(),
        ));
        feed.fetch_next_page().await.unwrap();
        let before = feed.pages().unwrap();

        let background = {
            let feed = Arc::clone(&feed);
            tokio::spawn(async move { feed.fetch_next_page().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(feed.state(), Some(RecordState::Pending));

        assert!(registry.cancel(&key));
        assert!(!feed.is_fetching());
        assert_ne!(feed.state(), Some(RecordState::Pending));
        assert!(Arc::ptr_eq(&feed.pages().unwrap(), &before));

        assert_eq!(background.await.unwrap().unwrap(), PageFetch::Superseded);
        assert_eq!(feed.pages().unwrap().len(), 1);
        assert_ne!(feed.state(), Some(RecordState::Pending));

        let outcome = feed.fetch_next_page().await.unwrap();
        assert!(matches!(outcome, PageFetch::Fetched { page_index: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prefix_includes_page_fetches() {
        let registry = registry();
        let feed = Arc::new(registry.infinite_query(
            cache_key!["items", "list"],
            feed(20, Duration::from_millis(100), Arc::new(AtomicUsize::new(0))),
            options(),
        ));

        let background = {
            let feed = Arc::clone(&feed);
            tokio::spawn(async move { feed.fetch_next_page().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(registry.cancel_prefix(&cache_key!["items"]), 1);
        assert_eq!(background.await.unwrap().unwrap(), PageFetch::Superseded);
        assert!(feed.pages().is_none());
        assert_eq!(registry.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_restarts_from_first_page() {
        let registry = registry();
        let key = cache_key!["items", "list"];
        let feed = registry.infinite_query(
            key.clone(),
            feed(12, Duration::ZERO, Arc::new(AtomicUsize::new(0))),
            options(),
        );
        feed.fetch_next_page().await.unwrap();
        feed.fetch_next_page().await.unwrap();

        registry.reset(&key);
        assert!(feed.pages().is_none());
        let outcome = feed.fetch_next_page().await.unwrap();
        assert!(matches!(outcome, PageFetch::Fetched { page_index: 0, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_page_marks_list_error() {
        let registry = registry();
        let feed = registry.infinite_query(
            cache_key!["items", "list"],
            |_cursor: usize| async { Err::<Vec<Item>, _>(RemoteError::transient("fetch_items", "down")) },
            options(),
        );

        assert!(feed.fetch_next_page().await.is_err());
        assert_eq!(feed.state(), Some(RecordState::Error));
        assert!(!feed.is_fetching());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_releases_list() {
        let store = EntityStore::new(QueryConfig::default().with_gc_after(Duration::from_secs(5)));
        let registry = QueryRegistry::new(store);
        let key = cache_key!["items", "list"];
        let feed = registry.infinite_query(
            key.clone(),
            feed(3, Duration::ZERO, Arc::new(AtomicUsize::new(0))),
            options().with_config(
                QueryConfig::default()
                    .with_gc_after(Duration::from_secs(5))
                    .with_retry(RetryConfig::none()),
            ),
        );
        feed.fetch_next_page().await.unwrap();
        assert!(registry.store().contains(&key));

        drop(feed);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!registry.store().contains(&key));
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!registry.store().contains(&cache_key!["items", "byId", 0]));
    }
}
