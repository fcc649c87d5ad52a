//! In-memory backend with failure injection.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use ripple_core::{
    now_utc, Asset, Post, PostDraft, PostId, PostPatch, Profile, RemoteError, RemoteResult, Todo,
    TodoDraft, TodoPatch, UploadedAsset,
};
use tracing::trace;

use super::{AssetRemote, PostRemote, ProfileRemote, TodoRemote};

/// Operation names used for call counting and failure injection.
pub mod ops {
    pub const FETCH_POSTS: &str = "fetch_posts";
    pub const FETCH_POST: &str = "fetch_post";
    pub const CREATE_POST: &str = "create_post";
    pub const UPDATE_POST: &str = "update_post";
    pub const DELETE_POST: &str = "delete_post";
    pub const UPLOAD: &str = "upload";
    pub const DELETE_ASSETS: &str = "delete_assets";
    pub const DELETE_FOLDER: &str = "delete_folder";
    pub const FETCH_TODOS: &str = "fetch_todos";
    pub const FETCH_TODO: &str = "fetch_todo";
    pub const CREATE_TODO: &str = "create_todo";
    pub const UPDATE_TODO: &str = "update_todo";
    pub const FETCH_PROFILE: &str = "fetch_profile";
    pub const CREATE_PROFILE: &str = "create_profile";
}

const PUBLIC_URL_BASE: &str = "https://storage.local/uploads";

#[derive(Debug, Default)]
struct MemoryState {
    posts: BTreeMap<PostId, Post>,
    next_post_id: PostId,
    todos: BTreeMap<String, Todo>,
    next_todo_id: u64,
    profiles: HashMap<String, Profile>,
    /// object path -> size in bytes
    assets: BTreeMap<String, usize>,
    failures: HashMap<&'static str, VecDeque<RemoteError>>,
    calls: HashMap<&'static str, usize>,
    history: Vec<&'static str>,
}

/// A backend held entirely in memory.
///
/// Every call is counted and appended to a history. Failures queued with
/// [`fail_next`](Self::fail_next) are returned, one per call, before the
/// operation touches any data.
#[derive(Debug, Default)]
pub struct InMemoryRemote {
    state: Mutex<MemoryState>,
    latency: Duration,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency` before it resolves.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // SEEDING
    // ========================================================================

    pub fn insert_post(&self, post: Post) {
        let mut state = self.lock();
        state.next_post_id = state.next_post_id.max(post.id);
        state.posts.insert(post.id, post);
    }

    /// Insert `count` text posts by `author_id`. Returns their ids, oldest first.
    pub fn seed_posts(&self, count: usize, author_id: &str) -> Vec<PostId> {
        let mut state = self.lock();
        (0..count)
            .map(|n| {
                state.next_post_id += 1;
                let id = state.next_post_id;
                state.posts.insert(
                    id,
                    Post {
                        id,
                        content: format!("post #{}", n + 1),
                        image_urls: Vec::new(),
                        author_id: author_id.to_string(),
                        created_at: now_utc(),
                    },
                );
                id
            })
            .collect()
    }

    pub fn insert_todo(&self, todo: Todo) {
        self.lock().todos.insert(todo.id.clone(), todo);
    }

    pub fn insert_profile(&self, profile: Profile) {
        self.lock().profiles.insert(profile.id.clone(), profile);
    }

    pub fn insert_asset(&self, path: impl Into<String>, size: usize) {
        self.lock().assets.insert(path.into(), size);
    }

    // ========================================================================
    // FAILURE INJECTION AND INSPECTION
    // ========================================================================

    /// Make the next call of `operation` fail with `error`. Queued failures
    /// are consumed in order.
    pub fn fail_next(&self, operation: &'static str, error: RemoteError) {
        self.fail_times(operation, 1, error);
    }

    pub fn fail_times(&self, operation: &'static str, times: usize, error: RemoteError) {
        let mut state = self.lock();
        let queue = state.failures.entry(operation).or_default();
        queue.extend(std::iter::repeat(error).take(times));
    }

    /// Drop every queued failure.
    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.lock().calls.get(operation).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.lock().calls.values().sum()
    }

    /// Every call so far, in the order it was received.
    pub fn history(&self) -> Vec<&'static str> {
        self.lock().history.clone()
    }

    pub fn post(&self, id: PostId) -> Option<Post> {
        self.lock().posts.get(&id).cloned()
    }

    pub fn post_count(&self) -> usize {
        self.lock().posts.len()
    }

    pub fn todo(&self, id: &str) -> Option<Todo> {
        self.lock().todos.get(id).cloned()
    }

    pub fn profile(&self, user_id: &str) -> Option<Profile> {
        self.lock().profiles.get(user_id).cloned()
    }

    /// Stored object paths, sorted.
    pub fn asset_paths(&self) -> Vec<String> {
        self.lock().assets.keys().cloned().collect()
    }

    /// Count the call, wait out the latency, then surface a queued failure.
    async fn enter(&self, operation: &'static str) -> RemoteResult<()> {
        {
            let mut state = self.lock();
            *state.calls.entry(operation).or_insert(0) += 1;
            state.history.push(operation);
        }
        trace!(operation, "Remote call");

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let failure = self
            .lock()
            .failures
            .get_mut(operation)
            .and_then(VecDeque::pop_front);
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PostRemote for InMemoryRemote {
    async fn fetch_posts(&self, from: usize, to: usize) -> RemoteResult<Vec<Post>> {
        self.enter(ops::FETCH_POSTS).await?;
        let state = self.lock();
        Ok(state
            .posts
            .values()
            .rev()
            .skip(from)
            .take(to.saturating_sub(from))
            .cloned()
            .collect())
    }

    async fn fetch_post(&self, id: PostId) -> RemoteResult<Post> {
        self.enter(ops::FETCH_POST).await?;
        self.lock()
            .posts
            .get(&id)
            .cloned()
            .ok_or_else(|| RemoteError::not_found(format!("post {id}")))
    }

    async fn create_post(&self, draft: PostDraft) -> RemoteResult<Post> {
        self.enter(ops::CREATE_POST).await?;
        if draft.content.trim().is_empty() {
            return Err(RemoteError::validation(ops::CREATE_POST, "content is empty")
                .with_code("validation_failed"));
        }
        let mut state = self.lock();
        state.next_post_id += 1;
        let post = Post {
            id: state.next_post_id,
            content: draft.content,
            image_urls: Vec::new(),
            author_id: draft.author_id,
            created_at: now_utc(),
        };
        state.posts.insert(post.id, post.clone());
        Ok(post)
    }

    async fn update_post(&self, id: PostId, patch: PostPatch) -> RemoteResult<Post> {
        self.enter(ops::UPDATE_POST).await?;
        let mut state = self.lock();
        let post = state
            .posts
            .get_mut(&id)
            .ok_or_else(|| RemoteError::not_found(format!("post {id}")))?;
        *post = patch.apply(post);
        Ok(post.clone())
    }

    async fn delete_post(&self, id: PostId) -> RemoteResult<Post> {
        self.enter(ops::DELETE_POST).await?;
        self.lock()
            .posts
            .remove(&id)
            .ok_or_else(|| RemoteError::not_found(format!("post {id}")))
    }
}

#[async_trait]
impl AssetRemote for InMemoryRemote {
    async fn upload(&self, path: String, asset: Asset) -> RemoteResult<UploadedAsset> {
        self.enter(ops::UPLOAD).await?;
        let mut state = self.lock();
        if state.assets.contains_key(&path) {
            return Err(RemoteError::conflict(ops::UPLOAD, format!("{path} already exists"))
                .with_code("conflict"));
        }
        state.assets.insert(path.clone(), asset.bytes.len());
        Ok(UploadedAsset {
            public_url: format!("{PUBLIC_URL_BASE}/{path}"),
            path,
        })
    }

    async fn delete(&self, paths: Vec<String>) -> RemoteResult<()> {
        self.enter(ops::DELETE_ASSETS).await?;
        let mut state = self.lock();
        for path in &paths {
            state.assets.remove(path);
        }
        Ok(())
    }

    async fn delete_folder(&self, folder: &str) -> RemoteResult<usize> {
        self.enter(ops::DELETE_FOLDER).await?;
        let prefix = format!("{}/", folder.trim_end_matches('/'));
        let mut state = self.lock();
        let before = state.assets.len();
        state.assets.retain(|path, _| !path.starts_with(&prefix));
        Ok(before - state.assets.len())
    }
}

#[async_trait]
impl TodoRemote for InMemoryRemote {
    async fn fetch_todos(&self) -> RemoteResult<Vec<Todo>> {
        self.enter(ops::FETCH_TODOS).await?;
        Ok(self.lock().todos.values().cloned().collect())
    }

    async fn fetch_todo(&self, id: &str) -> RemoteResult<Todo> {
        self.enter(ops::FETCH_TODO).await?;
        self.lock()
            .todos
            .get(id)
            .cloned()
            .ok_or_else(|| RemoteError::not_found(format!("todo {id}")))
    }

    async fn create_todo(&self, draft: TodoDraft) -> RemoteResult<Todo> {
        self.enter(ops::CREATE_TODO).await?;
        let mut state = self.lock();
        let mut id = state.next_todo_id;
        loop {
            id += 1;
            if !state.todos.contains_key(&id.to_string()) {
                break;
            }
        }
        state.next_todo_id = id;
        let todo = Todo {
            id: id.to_string(),
            content: draft.content,
            completed: false,
        };
        state.todos.insert(todo.id.clone(), todo.clone());
        Ok(todo)
    }

    async fn update_todo(&self, id: &str, patch: TodoPatch) -> RemoteResult<Todo> {
        self.enter(ops::UPDATE_TODO).await?;
        let mut state = self.lock();
        let todo = state
            .todos
            .get_mut(id)
            .ok_or_else(|| RemoteError::not_found(format!("todo {id}")))?;
        *todo = patch.apply(todo);
        Ok(todo.clone())
    }
}

#[async_trait]
impl ProfileRemote for InMemoryRemote {
    async fn fetch_profile(&self, user_id: &str) -> RemoteResult<Profile> {
        self.enter(ops::FETCH_PROFILE).await?;
        self.lock()
            .profiles
            .get(user_id)
            .cloned()
            .ok_or_else(|| RemoteError::not_found(format!("profile {user_id}")).with_code("PGRST116"))
    }

    async fn create_profile(&self, user_id: &str, nickname: String) -> RemoteResult<Profile> {
        self.enter(ops::CREATE_PROFILE).await?;
        let mut state = self.lock();
        if state.profiles.contains_key(user_id) {
            return Err(RemoteError::conflict(
                ops::CREATE_PROFILE,
                format!("profile {user_id} already exists"),
            ));
        }
        let profile = Profile::new(user_id, nickname);
        state.profiles.insert(profile.id.clone(), profile.clone());
        Ok(profile)
    }
}

// =============================================================================
// TESTS
// =============================================================================
