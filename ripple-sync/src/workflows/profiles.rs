//! Profile lookup with fetch-or-create for the signed-in user.

use std::sync::Arc;

use ripple_core::{keys, Profile};
use ripple_storage::Query;
use tracing::info;
use uuid::Uuid;

use crate::context::SyncContext;
use crate::remote::ProfileRemote;

const NICKNAME_PREFIX: &str = "user_nickname_";

/// A default nickname: the prefix plus six characters of a fresh id.
pub fn random_nickname() -> String {
    let id = Uuid::now_v7().simple().to_string();
    format!("{NICKNAME_PREFIX}{}", &id[id.len() - 6..])
}

/// Read the profile of `user_id`.
///
/// When `user_id` is the signed-in user (`session_user_id`) and the remote
/// has no row yet, a profile with a random nickname is created and
/// returned instead of the not-found error. The query is disabled for an
/// empty id.
pub fn profile_by_id<R: ProfileRemote>(
    ctx: &SyncContext,
    remote: &Arc<R>,
    user_id: &str,
    session_user_id: Option<&str>,
) -> Query<Profile> {
    let remote = Arc::clone(remote);
    let owned = user_id.to_string();
    let is_mine = session_user_id == Some(user_id);

    ctx.queries().query(
        keys::profiles::by_id(user_id),
        move || {
            let remote = Arc::clone(&remote);
            let user_id = owned.clone();
            async move {
                match remote.fetch_profile(&user_id).await {
                    Err(error) if is_mine && error.is_not_found() => remote
                        .create_profile(&user_id, random_nickname())
                        .await
                        .map(|profile| {
                            info!(user_id = %user_id, nickname = %profile.nickname, "Created default profile");
                            profile
                        }),
                    other => other,
                }
            }
        },
        ctx.config().query.enabled(!user_id.is_empty()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{ops, InMemoryRemote};
    use ripple_core::{QueryError, SyncConfig, SyncError};

    fn setup() -> (SyncContext, Arc<InMemoryRemote>) {
        (
            SyncContext::init(SyncConfig::default()).unwrap(),
            Arc::new(InMemoryRemote::new()),
        )
    }

    #[test]
    fn test_random_nickname_shape() {
        let nickname = random_nickname();
        assert!(nickname.starts_with("user_nickname_"));
        assert_eq!(nickname.len(), "user_nickname_".len() + 6);
    }

    #[tokio::test]
    async fn test_own_missing_profile_is_created() {
        let (ctx, remote) = setup();
        let profile = profile_by_id(&ctx, &remote, "me", Some("me")).settled().await.unwrap();

        assert!(profile.nickname.starts_with("user_nickname_"));
        assert_eq!(remote.profile("me").as_ref(), Some(profile.as_ref()));
        assert_eq!(remote.calls(ops::CREATE_PROFILE), 1);
    }

    #[tokio::test]
    async fn test_other_missing_profile_is_an_error() {
        let (ctx, remote) = setup();
        let err = profile_by_id(&ctx, &remote, "someone", Some("me"))
            .settled()
            .await
            .unwrap_err();

        assert!(err.remote().is_some_and(|e| e.is_not_found()));
        assert_eq!(remote.calls(ops::CREATE_PROFILE), 0);
    }

    #[tokio::test]
    async fn test_existing_profile_is_returned() {
        let (ctx, remote) = setup();
        remote.insert_profile(Profile::new("me", "ripple"));
        let profile = profile_by_id(&ctx, &remote, "me", Some("me")).settled().await.unwrap();
        assert_eq!(profile.nickname, "ripple");
        assert_eq!(remote.calls(ops::CREATE_PROFILE), 0);
    }

    #[tokio::test]
    async fn test_empty_id_is_disabled() {
        let (ctx, remote) = setup();
        let err = profile_by_id(&ctx, &remote, "", None).settled().await.unwrap_err();
        assert!(matches!(err, SyncError::Query(QueryError::Disabled { .. })));
        assert_eq!(remote.total_calls(), 0);
    }
}
