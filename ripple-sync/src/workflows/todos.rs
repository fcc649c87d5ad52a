//! Normalized todo list and optimistic todo edits.
//!
//! The list record holds only ids. A list fetch that still owns the list
//! key when it lands writes every todo into its own detail record and links
//! the list to them, so an edit to one detail reaches list observers
//! without touching the list value. A cancelled list fetch writes nothing.

use std::sync::Arc;
use std::time::Duration;

use ripple_core::{keys, CacheKey, QueryConfig, SyncResult, Todo, TodoDraft, TodoPatch};
use ripple_storage::{EntityStore, Query, SetOptions};

use crate::context::SyncContext;
use crate::mutation::Mutation;
use crate::remote::TodoRemote;

/// Detail records are fresh for 5 s and kept 10 s once unobserved.
pub fn detail_config(base: QueryConfig) -> QueryConfig {
    base.with_stale_after(Duration::from_secs(5))
        .with_gc_after(Duration::from_secs(10))
}

fn detail_keys(ids: &[String]) -> Vec<CacheKey> {
    ids.iter().map(|id| keys::todos::detail(id)).collect()
}

/// Read the todo list as ids, normalizing each todo into its detail record.
pub fn todo_list<R: TodoRemote>(ctx: &SyncContext, remote: &Arc<R>) -> Query<Vec<String>> {
    let remote = Arc::clone(remote);
    let options = SetOptions::from_config(&detail_config(ctx.config().query));

    ctx.queries().query_normalized(
        keys::todos::list(),
        move || {
            let remote = Arc::clone(&remote);
            async move { remote.fetch_todos().await }
        },
        ctx.config().query,
        move |batch, todos: Vec<Todo>| {
            let ids: Vec<String> = todos.iter().map(|todo| todo.id.clone()).collect();
            for todo in todos {
                batch.set(keys::todos::detail(&todo.id), todo, options);
            }
            batch.link(&keys::todos::list(), detail_keys(&ids));
            ids
        },
    )
}

/// Resolve the cached list through the detail records. Ids whose record
/// is gone are skipped.
pub fn todo_items(store: &EntityStore) -> Vec<Arc<Todo>> {
    let Some(ids) = store.value::<Vec<String>>(&keys::todos::list()) else {
        return Vec::new();
    };
    ids.iter()
        .filter_map(|id| store.value::<Todo>(&keys::todos::detail(id)))
        .collect()
}

pub fn todo_detail<R: TodoRemote>(ctx: &SyncContext, remote: &Arc<R>, id: &str) -> Query<Todo> {
    let remote = Arc::clone(remote);
    let owned = id.to_string();
    ctx.queries().query(
        keys::todos::detail(id),
        move || {
            let remote = Arc::clone(&remote);
            let id = owned.clone();
            async move { remote.fetch_todo(&id).await }
        },
        detail_config(ctx.config().query),
    )
}

/// Apply `patch` to a todo optimistically.
///
/// The detail record and the list record are snapshotted together, so a
/// failure restores both and list observers see the rollback.
pub async fn update_todo<R: TodoRemote>(
    ctx: &SyncContext,
    remote: &Arc<R>,
    id: &str,
    patch: TodoPatch,
) -> SyncResult<Todo> {
    let detail = keys::todos::detail(id);
    let options = SetOptions::from_config(&detail_config(ctx.config().query));

    let optimistic_key = detail.clone();
    let optimistic_patch = patch.clone();
    let reconciled = detail.clone();

    let outcome = ctx
        .mutations()
        .mutate(
            Mutation::new("update_todo")
                .touches(detail)
                .touches(keys::todos::list())
                .optimistic(move |writer| {
                    writer.update::<Todo, _>(&optimistic_key, |todo| optimistic_patch.apply(todo));
                })
                .reconcile(move |store, todo: &Todo| {
                    store.set(reconciled, todo.clone(), options);
                }),
            move || remote.update_todo(id, patch.clone()),
        )
        .await?;
    Ok(outcome.value)
}

pub async fn toggle_todo<R: TodoRemote>(
    ctx: &SyncContext,
    remote: &Arc<R>,
    id: &str,
    completed: bool,
) -> SyncResult<Todo> {
    update_todo(ctx, remote, id, TodoPatch::completed(completed)).await
}

/// Create a todo and append it to the cached list.
pub async fn create_todo<R: TodoRemote>(
    ctx: &SyncContext,
    remote: &Arc<R>,
    content: impl Into<String>,
) -> SyncResult<Todo> {
    let draft = TodoDraft {
        content: content.into(),
    };
    let options = SetOptions::from_config(&detail_config(ctx.config().query));

    let outcome = ctx
        .mutations()
        .mutate(
            Mutation::new("create_todo")
                .touches(keys::todos::list())
                .reconcile(move |store, todo: &Todo| append_to_list(store, todo, options)),
            move || remote.create_todo(draft.clone()),
        )
        .await?;
    Ok(outcome.value)
}

fn append_to_list(store: &EntityStore, todo: &Todo, options: SetOptions) {
    let list = keys::todos::list();
    store.set(keys::todos::detail(&todo.id), todo.clone(), options);
    let ids = store.update::<Vec<String>, _>(&list, |ids| {
        let mut ids = ids.clone();
        ids.push(todo.id.clone());
        ids
    });
    if let Some(ids) = ids {
        store.link(&list, detail_keys(&ids));
    }
}

// =============================================================================
// TESTS
// =============================================================================
