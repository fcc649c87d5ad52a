//! RIPPLE Demo Entry Point
//!
//! Loads configuration, installs tracing, and drives one scripted session
//! through every workflow against the in-memory backend.

mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ripple_core::{keys, Asset, PostDraft, RemoteError, SyncConfig, SyncError, Todo};
use ripple_storage::PageFetch;
use ripple_sync::workflows::{
    create_post_with_media, create_todo, delete_post, post_feed, profile_by_id, todo_items,
    todo_list, toggle_todo,
};
use ripple_sync::{ops, InMemoryRemote, SyncContext};
use tracing::{info, warn};

use crate::telemetry::{init_tracing, TelemetryConfig};

#[derive(Debug, thiserror::Error)]
pub enum DemoError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Telemetry error: {0}")]
    Telemetry(String),
}

/// Demo settings from environment variables.
#[derive(Debug, Clone)]
struct DemoConfig {
    /// TOML file with a `SyncConfig`; `RIPPLE_*` variables are used when unset.
    config_path: Option<PathBuf>,
    latency: Duration,
    seed_posts: usize,
    user_id: String,
}

impl DemoConfig {
    fn from_env() -> Self {
        Self {
            config_path: std::env::var("RIPPLE_CONFIG").ok().map(PathBuf::from),
            latency: Duration::from_millis(
                std::env::var("RIPPLE_DEMO_LATENCY_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(50),
            ),
            seed_posts: std::env::var("RIPPLE_DEMO_POSTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(12),
            user_id: std::env::var("RIPPLE_DEMO_USER").unwrap_or_else(|_| "demo-user".to_string()),
        }
    }

    fn sync_config(&self) -> Result<SyncConfig, DemoError> {
        match &self.config_path {
            Some(path) => {
                let source = std::fs::read_to_string(path).map_err(|source| DemoError::Io {
                    path: path.clone(),
                    source,
                })?;
                Ok(SyncConfig::from_toml_str(&source)?)
            }
            None => Ok(SyncConfig::from_env()?),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), DemoError> {
    init_tracing(&TelemetryConfig::default())?;

    let demo = DemoConfig::from_env();
    let ctx = SyncContext::init(demo.sync_config()?)?;
    let remote = Arc::new(InMemoryRemote::new().with_latency(demo.latency));
    seed(&remote, &demo);

    run_todos(&ctx, &remote).await?;
    run_posts(&ctx, &remote, &demo).await?;
    run_profile(&ctx, &remote, &demo).await?;

    let stats = ctx.store().stats();
    info!(
        records = ctx.store().len(),
        remote_calls = remote.total_calls(),
        hit_rate = stats.hit_rate(),
        "Session finished"
    );
    ctx.dispose();
    Ok(())
}

fn seed(remote: &InMemoryRemote, demo: &DemoConfig) {
    for (id, content) in [("1", "buy milk"), ("2", "water plants"), ("3", "file taxes")] {
        remote.insert_todo(Todo {
            id: id.to_string(),
            content: content.to_string(),
            completed: false,
        });
    }
    remote.seed_posts(demo.seed_posts, "someone-else");
}

async fn run_todos(ctx: &SyncContext, remote: &Arc<InMemoryRemote>) -> Result<(), DemoError> {
    // Two readers of the same list share one remote call.
    let first = todo_list(ctx, remote);
    let second = todo_list(ctx, remote);
    let ids = first.settled().await?;
    second.settled().await?;
    info!(todos = ids.len(), fetches = remote.calls(ops::FETCH_TODOS), "Todo list loaded");

    let toggled = toggle_todo(ctx, remote, "1", true).await?;
    info!(id = %toggled.id, completed = toggled.completed, "Toggled todo");

    remote.fail_next(
        ops::UPDATE_TODO,
        RemoteError::conflict(ops::UPDATE_TODO, "row changed on the server"),
    );
    match toggle_todo(ctx, remote, "2", true).await {
        Ok(todo) => info!(id = %todo.id, "Toggle unexpectedly succeeded"),
        Err(e) => {
            let visible = ctx.store().value::<Todo>(&keys::todos::detail("2"));
            warn!(
                error = %e,
                completed = visible.map(|t| t.completed),
                "Toggle rolled back"
            );
        }
    }

    let created = create_todo(ctx, remote, "call the bank").await?;
    info!(
        id = %created.id,
        cached = todo_items(ctx.store()).len(),
        "Created todo"
    );
    Ok(())
}

async fn run_posts(
    ctx: &SyncContext,
    remote: &Arc<InMemoryRemote>,
    demo: &DemoConfig,
) -> Result<(), DemoError> {
    let feed = post_feed(ctx, remote);
    loop {
        match feed.fetch_next_page().await? {
            PageFetch::Fetched {
                page_index,
                item_count,
                has_next_page,
            } => {
                info!(page_index, item_count, has_next_page, "Feed page");
                if !has_next_page {
                    break;
                }
            }
            PageFetch::Skipped | PageFetch::Superseded => break,
        }
    }
    info!(posts = feed.items().len(), "Feed exhausted");

    let draft = PostDraft {
        author_id: demo.user_id.clone(),
        content: "weekend photos".to_string(),
    };
    let assets = vec![
        Asset::new("beach.png", "image/png", vec![0x89, 0x50, 0x4e, 0x47]),
        Asset::new("sunset.jpg", "image/jpeg", vec![0xff, 0xd8, 0xff]),
    ];
    let post = create_post_with_media(ctx, remote, draft, assets).await?;
    info!(id = post.id, images = post.image_urls.len(), "Published post");

    // A failing final step unwinds the earlier ones.
    remote.fail_next(
        ops::UPDATE_POST,
        RemoteError::validation(ops::UPDATE_POST, "image url rejected"),
    );
    let draft = PostDraft {
        author_id: demo.user_id.clone(),
        content: "this one fails".to_string(),
    };
    let assets = vec![Asset::new("blurry.png", "image/png", vec![0x89])];
    if let Err(SyncError::Saga(failure)) = create_post_with_media(ctx, remote, draft, assets).await {
        warn!(
            failed_step = %failure.failed_step,
            partially_compensated = failure.is_partially_compensated(),
            orphaned_assets = remote.asset_paths().len(),
            "Publishing rolled back"
        );
    }

    let deleted = delete_post(ctx, remote, post.id).await?;
    info!(id = deleted.id, feed_state = ?feed.state(), "Deleted post");
    Ok(())
}

async fn run_profile(
    ctx: &SyncContext,
    remote: &Arc<InMemoryRemote>,
    demo: &DemoConfig,
) -> Result<(), DemoError> {
    let profile = profile_by_id(ctx, remote, &demo.user_id, Some(&demo.user_id))
        .settled()
        .await?;
    info!(user_id = %profile.id, nickname = %profile.nickname, "Profile ready");

    match profile_by_id(ctx, remote, "nobody", Some(&demo.user_id)).settled().await {
        Ok(profile) => info!(user_id = %profile.id, "Found profile"),
        Err(e) => {
            let hint = e.remote().map(RemoteError::user_message).unwrap_or("");
            warn!(error = %e, hint, "Profile lookup failed");
        }
    }
    Ok(())
}
