//! Creating a post with images, as a three-step saga:
//!
//! 1. create the post row (compensated by deleting it);
//! 2. upload every image in parallel under `{author_id}/{post_id}/`;
//! 3. patch the post with the uploaded URLs.
//!
//! With `SagaConfig::cleanup_orphaned_assets` set, a failed upload step
//! deletes the uploads that did succeed, and a failure in step 3 deletes
//! them all. With it unset, uploaded objects are left in storage.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use ripple_core::{
    keys, Asset, Post, PostDraft, PostPatch, RemoteError, RetryConfig, SyncResult, UploadedAsset,
};
use ripple_storage::{with_retry, SetOptions};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::SyncContext;
use crate::remote::{AssetRemote, PostRemote};
use crate::saga::{Saga, SagaStep};

pub const SAGA_NAME: &str = "create_post_with_media";

/// State threaded through the saga.
#[derive(Debug, Clone)]
pub struct MediaPostState {
    pub draft: PostDraft,
    pub assets: Vec<Asset>,
    /// Set by the create step, replaced by the patched row.
    pub post: Option<Post>,
    pub uploaded: Vec<UploadedAsset>,
}

impl MediaPostState {
    pub fn new(draft: PostDraft, assets: Vec<Asset>) -> Self {
        Self {
            draft,
            assets,
            post: None,
            uploaded: Vec::new(),
        }
    }

    fn post(&self, step: &str) -> SyncResult<&Post> {
        self.post
            .as_ref()
            .ok_or_else(|| RemoteError::validation(step.to_string(), "post has not been created").into())
    }
}

/// Object name for an upload: a time-ordered id plus the original extension.
fn object_name(asset: &Asset) -> String {
    let id = Uuid::now_v7();
    match asset.extension() {
        Some(ext) => format!("{id}.{ext}"),
        None => id.to_string(),
    }
}

struct CreatePost<R> {
    remote: Arc<R>,
    retry: RetryConfig,
}

#[async_trait]
impl<R: PostRemote> SagaStep<MediaPostState> for CreatePost<R> {
    fn name(&self) -> &str {
        "create_post"
    }

    async fn action(&self, state: &mut MediaPostState) -> SyncResult<()> {
        let draft = &state.draft;
        let post = with_retry("create_post", &self.retry, || self.remote.create_post(draft.clone())).await?;
        debug!(post_id = post.id, "Post row created");
        state.post = Some(post);
        Ok(())
    }

    async fn compensate(&self, state: &mut MediaPostState) -> SyncResult<()> {
        if let Some(post) = state.post.take() {
            with_retry("delete_post", &self.retry, || self.remote.delete_post(post.id)).await?;
            debug!(post_id = post.id, "Post row deleted");
        }
        Ok(())
    }
}

struct UploadAssets<R> {
    remote: Arc<R>,
    retry: RetryConfig,
    cleanup: bool,
}

impl<R: AssetRemote> UploadAssets<R> {
    async fn delete_uploads(&self, uploaded: &[UploadedAsset]) -> SyncResult<()> {
        if uploaded.is_empty() {
            return Ok(());
        }
        let paths: Vec<String> = uploaded.iter().map(|asset| asset.path.clone()).collect();
        with_retry("delete_assets", &self.retry, || self.remote.delete(paths.clone())).await?;
        debug!(count = paths.len(), "Uploaded assets deleted");
        Ok(())
    }
}

#[async_trait]
impl<R: AssetRemote> SagaStep<MediaPostState> for UploadAssets<R> {
    fn name(&self) -> &str {
        "upload_assets"
    }

    async fn action(&self, state: &mut MediaPostState) -> SyncResult<()> {
        let folder = state.post(self.name())?.asset_folder();
        let uploads = state.assets.iter().map(|asset| {
            let path = format!("{folder}/{}", object_name(asset));
            with_retry("upload", &self.retry, move || {
                self.remote.upload(path.clone(), asset.clone())
            })
        });
        let results = join_all(uploads).await;

        let mut uploaded = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(asset) => uploaded.push(asset),
                Err(error) => {
                    first_error.get_or_insert(error);
                }
            }
        }

        let Some(error) = first_error else {
            state.uploaded = uploaded;
            return Ok(());
        };

        if self.cleanup {
            if let Err(cleanup) = self.delete_uploads(&uploaded).await {
                warn!(error = %cleanup, "Partial uploads left behind");
            }
        } else if !uploaded.is_empty() {
            warn!(count = uploaded.len(), "Leaving partial uploads in storage");
        }
        Err(error.into())
    }

    async fn compensate(&self, state: &mut MediaPostState) -> SyncResult<()> {
        if !self.cleanup {
            warn!(count = state.uploaded.len(), "Leaving uploaded assets in storage");
            return Ok(());
        }
        let uploaded = std::mem::take(&mut state.uploaded);
        self.delete_uploads(&uploaded).await
    }
}

struct AttachUrls<R> {
    remote: Arc<R>,
    retry: RetryConfig,
}

#[async_trait]
impl<R: PostRemote> SagaStep<MediaPostState> for AttachUrls<R> {
    fn name(&self) -> &str {
        "attach_image_urls"
    }

    async fn action(&self, state: &mut MediaPostState) -> SyncResult<()> {
        if state.uploaded.is_empty() {
            return Ok(());
        }
        let id = state.post(self.name())?.id;
        let urls: Vec<String> = state.uploaded.iter().map(|asset| asset.public_url.clone()).collect();
        let post = with_retry("update_post", &self.retry, || {
            self.remote.update_post(id, PostPatch::image_urls(urls.clone()))
        })
        .await?;
        state.post = Some(post);
        Ok(())
    }
}

/// Build the saga for `remote` under the context's configuration.
pub fn media_post_saga<R>(ctx: &SyncContext, remote: &Arc<R>) -> Saga<MediaPostState>
where
    R: PostRemote + AssetRemote,
{
    let retry = ctx.config().mutation.retry;
    Saga::new(SAGA_NAME)
        .step(CreatePost {
            remote: Arc::clone(remote),
            retry,
        })
        .step(UploadAssets {
            remote: Arc::clone(remote),
            retry,
            cleanup: ctx.config().saga.cleanup_orphaned_assets,
        })
        .step(AttachUrls {
            remote: Arc::clone(remote),
            retry,
        })
}

/// Create a post with images. On success the post is cached fresh and the
/// feed is marked stale; on failure every completed step is undone before
/// this returns.
pub async fn create_post_with_media<R>(
    ctx: &SyncContext,
    remote: &Arc<R>,
    draft: PostDraft,
    assets: Vec<Asset>,
) -> SyncResult<Post>
where
    R: PostRemote + AssetRemote,
{
    let state = media_post_saga(ctx, remote)
        .run(MediaPostState::new(draft, assets))
        .await?;
    let post = state.post(SAGA_NAME)?.clone();

    ctx.store().set(
        keys::posts::by_id(post.id),
        post.clone(),
        SetOptions::from_config(&ctx.config().query),
    );
    ctx.queries().invalidate(&keys::posts::list());
    info!(post_id = post.id, images = post.image_urls.len(), "Post created");
    Ok(post)
}

// =============================================================================
// TESTS
// =============================================================================
