//! Client-side cache: a normalized entity store and the query registry that
//! fills it.
//!
//! # Design Philosophy
//!
//! Reads never block on the network. [`QueryRegistry::query`] answers from
//! the [`EntityStore`] immediately and, when the record is missing or no
//! longer fresh, starts (or joins) the single fetch allowed per key. The
//! caller decides whether to wait for it via [`Query::settled`].
//!
//! Staleness is explicit: every record carries its [`RecordState`] and the
//! windows it was fetched with, and a fresh record past its window reads
//! back as `Stale` without any timer firing.
//!
//! # Example
//!
//! ```ignore
//! let registry = QueryRegistry::new(EntityStore::default());
//! let todo = registry
//!     .fetch(keys::todos::detail("7"), move || remote.fetch_todo("7"), QueryOptions::default())
//!     .await?;
//! ```
//!
//! [`RecordState`]: ripple_core::RecordState

pub mod infinite;
pub mod registry;
pub mod retry;
pub mod store;
pub mod subscription;
pub mod traits;

pub use infinite::{InfiniteOptions, InfiniteQuery, Page, PageFetch, PagedResult};
pub use registry::{Query, QueryOptions, QueryRegistry};
pub use retry::with_retry;
pub use store::{EntityStore, Listener, RecordImage, SetOptions, StoreSnapshot, WriteBatch};
pub use subscription::Subscription;
pub use traits::{Fetcher, PageFetcher, StoreStats};
