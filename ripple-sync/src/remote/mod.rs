//! Remote-service boundary.
//!
//! Each trait covers one resource of the backend. Workflows take the
//! narrowest trait they need; [`Remote`] bundles all of them for callers
//! that hold a single client.

use async_trait::async_trait;
use ripple_core::{
    Asset, Post, PostDraft, PostId, PostPatch, Profile, RemoteResult, Todo, TodoDraft, TodoPatch,
    UploadedAsset,
};

mod memory;

pub use memory::{ops, InMemoryRemote};

/// Post rows.
#[async_trait]
pub trait PostRemote: Send + Sync + 'static {
    /// Posts newest first, rows `from..to`.
    async fn fetch_posts(&self, from: usize, to: usize) -> RemoteResult<Vec<Post>>;

    async fn fetch_post(&self, id: PostId) -> RemoteResult<Post>;

    async fn create_post(&self, draft: PostDraft) -> RemoteResult<Post>;

    async fn update_post(&self, id: PostId, patch: PostPatch) -> RemoteResult<Post>;

    /// Delete a post and return the deleted row.
    async fn delete_post(&self, id: PostId) -> RemoteResult<Post>;
}

/// Object storage for post images.
#[async_trait]
pub trait AssetRemote: Send + Sync + 'static {
    async fn upload(&self, path: String, asset: Asset) -> RemoteResult<UploadedAsset>;

    async fn delete(&self, paths: Vec<String>) -> RemoteResult<()>;

    /// Delete every object under `folder`. Returns how many were removed.
    async fn delete_folder(&self, folder: &str) -> RemoteResult<usize>;
}

#[async_trait]
pub trait TodoRemote: Send + Sync + 'static {
    async fn fetch_todos(&self) -> RemoteResult<Vec<Todo>>;

    async fn fetch_todo(&self, id: &str) -> RemoteResult<Todo>;

    async fn create_todo(&self, draft: TodoDraft) -> RemoteResult<Todo>;

    async fn update_todo(&self, id: &str, patch: TodoPatch) -> RemoteResult<Todo>;
}

#[async_trait]
pub trait ProfileRemote: Send + Sync + 'static {
    async fn fetch_profile(&self, user_id: &str) -> RemoteResult<Profile>;

    async fn create_profile(&self, user_id: &str, nickname: String) -> RemoteResult<Profile>;
}

/// A client for every resource.
pub trait Remote: PostRemote + AssetRemote + TodoRemote + ProfileRemote {}

impl<T> Remote for T where T: PostRemote + AssetRemote + TodoRemote + ProfileRemote {}
