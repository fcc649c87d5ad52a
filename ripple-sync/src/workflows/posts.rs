//! Post feed, detail and pessimistic post writes.

use std::sync::Arc;

use ripple_core::{keys, Post, PostId, PostPatch, SyncResult};
use ripple_storage::{InfiniteOptions, InfiniteQuery, Page, Query, SetOptions};
use tracing::{info, warn};

use crate::context::SyncContext;
use crate::mutation::Mutation;
use crate::remote::{AssetRemote, PostRemote};

/// Posts per feed page.
pub const PAGE_SIZE: usize = 5;

/// Where a post is rendered. Only the detail view fetches by id; feed
/// items are served from the records the feed normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostView {
    Feed,
    Detail,
}

/// Mount the post feed. The cursor is the page index; page `n` covers rows
/// `n * PAGE_SIZE .. (n + 1) * PAGE_SIZE`, and a short page ends the feed.
pub fn post_feed<R: PostRemote>(ctx: &SyncContext, remote: &Arc<R>) -> InfiniteQuery<Post, usize> {
    let remote = Arc::clone(remote);
    let options = InfiniteOptions::new(
        0usize,
        |last: &[Arc<Post>], pages: &[Page<usize>]| (last.len() >= PAGE_SIZE).then_some(pages.len()),
        |post: &Post| keys::posts::by_id(post.id),
    )
    .with_config(ctx.config().query);

    ctx.queries().infinite_query(
        keys::posts::list(),
        move |cursor: usize| {
            let remote = Arc::clone(&remote);
            async move {
                let from = cursor * PAGE_SIZE;
                remote.fetch_posts(from, from + PAGE_SIZE).await
            }
        },
        options,
    )
}

/// Read one post.
pub fn post_by_id<R: PostRemote>(ctx: &SyncContext, remote: &Arc<R>, id: PostId, view: PostView) -> Query<Post> {
    let remote = Arc::clone(remote);
    ctx.queries().query(
        keys::posts::by_id(id),
        move || {
            let remote = Arc::clone(&remote);
            async move { remote.fetch_post(id).await }
        },
        ctx.config().query.enabled(view == PostView::Detail),
    )
}

/// Edit a post. The server's row replaces the cached one and the feed is
/// marked stale.
pub async fn update_post<R: PostRemote>(
    ctx: &SyncContext,
    remote: &Arc<R>,
    id: PostId,
    patch: PostPatch,
) -> SyncResult<Post> {
    let key = keys::posts::by_id(id);
    let options = SetOptions::from_config(&ctx.config().query);
    let target = key.clone();

    let outcome = ctx
        .mutations()
        .mutate(
            Mutation::new("update_post")
                .touches(key)
                .reconcile(move |store, post: &Post| {
                    store.set(target, post.clone(), options);
                })
                .invalidates(keys::posts::list()),
            move || remote.update_post(id, patch.clone()),
        )
        .await?;
    Ok(outcome.value)
}

/// Delete a post, then its stored images, then restart the feed.
///
/// Failing to delete the images does not fail the call: the post is
/// already gone, so the leftover folder is only logged.
pub async fn delete_post<R>(ctx: &SyncContext, remote: &Arc<R>, id: PostId) -> SyncResult<Post>
where
    R: PostRemote + AssetRemote,
{
    let key = keys::posts::by_id(id);
    let target = key.clone();

    let outcome = ctx
        .mutations()
        .mutate(
            Mutation::new("delete_post")
                .touches(key)
                .reconcile(move |store, _: &Post| {
                    store.reset(&target);
                }),
            move || remote.delete_post(id),
        )
        .await?;
    let deleted = outcome.value;

    if deleted.has_images() {
        let folder = deleted.asset_folder();
        match remote.delete_folder(&folder).await {
            Ok(removed) => info!(post_id = id, folder = %folder, removed, "Deleted post assets"),
            Err(error) => warn!(post_id = id, folder = %folder, error = %error, "Post assets left behind"),
        }
    }

    ctx.queries().reset(&keys::posts::list());
    Ok(deleted)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{ops, InMemoryRemote};
    use ripple_core::{QueryError, RecordState, RemoteError, SyncConfig, SyncError};
    use ripple_storage::PageFetch;

    fn setup() -> (SyncContext, Arc<InMemoryRemote>) {
        let mut config = SyncConfig::default();
        config.query = config
            .query
            .with_stale_after(std::time::Duration::from_secs(60))
            .with_retry(ripple_core::RetryConfig::none());
        config.mutation.retry = ripple_core::RetryConfig::none();
        (SyncContext::init(config).unwrap(), Arc::new(InMemoryRemote::new()))
    }

    #[tokio::test]
    async fn test_feed_pages_through_posts() {
        let (ctx, remote) = setup();
        remote.seed_posts(12, "author");
        let feed = post_feed(&ctx, &remote);

        for _ in 0..3 {
            assert!(matches!(feed.fetch_next_page().await.unwrap(), PageFetch::Fetched { .. }));
        }
        assert_eq!(feed.items().len(), 12);
        assert!(!feed.has_next_page());
        assert_eq!(feed.fetch_next_page().await.unwrap(), PageFetch::Skipped);
        assert_eq!(remote.calls(ops::FETCH_POSTS), 3);
    }

    #[tokio::test]
    async fn test_feed_view_does_not_fetch_by_id() {
        let (ctx, remote) = setup();
        let ids = remote.seed_posts(1, "author");

        let err = post_by_id(&ctx, &remote, ids[0], PostView::Feed).settled().await.unwrap_err();
        assert!(matches!(err, SyncError::Query(QueryError::Disabled { .. })));
        assert_eq!(remote.calls(ops::FETCH_POST), 0);

        let post = post_by_id(&ctx, &remote, ids[0], PostView::Detail).settled().await.unwrap();
        assert_eq!(post.id, ids[0]);
    }

    #[tokio::test]
    async fn test_feed_item_served_to_detail_view() {
        let (ctx, remote) = setup();
        let ids = remote.seed_posts(3, "author");
        let feed = post_feed(&ctx, &remote);
        feed.fetch_next_page().await.unwrap();

        let query = post_by_id(&ctx, &remote, ids[1], PostView::Detail);
        assert_eq!(query.state(), Some(RecordState::Fresh));
        assert_eq!(query.settled().await.unwrap().id, ids[1]);
        assert_eq!(remote.calls(ops::FETCH_POST), 0);
    }

    #[tokio::test]
    async fn test_update_post_shows_in_feed() {
        let (ctx, remote) = setup();
        let ids = remote.seed_posts(2, "author");
        let feed = post_feed(&ctx, &remote);
        feed.fetch_next_page().await.unwrap();

        let updated = update_post(&ctx, &remote, ids[0], PostPatch::content("edited"))
            .await
            .unwrap();
        assert_eq!(updated.content, "edited");
        assert!(feed.items().iter().any(|post| post.content == "edited"));
        assert_eq!(feed.state(), Some(RecordState::Stale));
    }

    #[tokio::test]
    async fn test_failed_update_keeps_cached_post() {
        let (ctx, remote) = setup();
        let ids = remote.seed_posts(1, "author");
        let before = post_by_id(&ctx, &remote, ids[0], PostView::Detail).settled().await.unwrap();
        remote.fail_next(ops::UPDATE_POST, RemoteError::validation(ops::UPDATE_POST, "too long"));

        assert!(update_post(&ctx, &remote, ids[0], PostPatch::content("x")).await.is_err());
        let after = ctx.store().value::<Post>(&keys::posts::by_id(ids[0])).unwrap();
        assert!(Arc::ptr_eq(&before, &after));
    }
}
