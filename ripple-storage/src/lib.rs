//! RIPPLE Storage - Entity Store and Query Registry
//!
//! In-process, session-scoped cache between one client and one remote
//! service. See [`cache`] for the store, the query registry and paginated
//! queries.

pub mod cache;

pub use cache::{
    with_retry, EntityStore, Fetcher, InfiniteOptions, InfiniteQuery, Listener, Page, PageFetch,
    PageFetcher, PagedResult, Query, QueryOptions, QueryRegistry, RecordImage, SetOptions,
    StoreSnapshot, StoreStats, Subscription, WriteBatch,
};
