// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end session behavior against the in-process mock auth API.


use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde_json::{json, Map, Value};

use authsession::api::{PasswordChange, Registration};
use authsession::store::{ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};
use authsession::token;
use authsession::{AuthSession, FileStorage, MemoryStorage, Phase, SessionError, SessionTimings, Storage};
use auth_support::{MockAuth, INVALID_CREDENTIALS};

const ADA: &str = "ada@example.com";
const ADA_PW: &str = "correct horse";
const RESOURCE: &str = "/api/resource";

fn timings() -> SessionTimings {
    SessionTimings {
        request_timeout: Duration::from_secs(5),
        refresh_timeout: Duration::from_secs(5),
        expiry_leeway_secs: 0,
    }
}

fn session(mock: &MockAuth, storage: Arc<dyn Storage>) -> anyhow::Result<AuthSession> {
    Ok(AuthSession::new(&mock.url(), storage, timings())?)
}

/// A mock with one account and an initialized, signed-in session.
async fn signed_in() -> anyhow::Result<(MockAuth, AuthSession, Arc<MemoryStorage>)> {
    let mock = MockAuth::start().await?;
    mock.add_user(ADA, ADA_PW);
    let storage = Arc::new(MemoryStorage::new());
    let s = session(&mock, storage.clone())?;
    s.init().await;
    s.login(ADA, ADA_PW).await?;
    Ok((mock, s, storage))
}

fn seed(storage: &dyn Storage, access: &str, refresh: &str) -> anyhow::Result<()> {
    storage.set(&[(ACCESS_TOKEN_KEY, access), (REFRESH_TOKEN_KEY, refresh)])
}

// -- Login / logout ----------------------------------------------------------

#[tokio::test]
async fn login_stores_pair_and_user() -> anyhow::Result<()> {
    let (mock, s, storage) = signed_in().await?;

    let snap = s.snapshot();
    assert_eq!(snap.phase, Phase::Authenticated);
    assert_eq!(snap.current_user.and_then(|u| u.email).as_deref(), Some(ADA));
    assert!(!snap.is_loading);
    assert!(snap.error.is_none());

    let access = storage.get(ACCESS_TOKEN_KEY)?.unwrap_or_default();
    assert!(mock.access_is_live(&access));
    assert!(storage.get(REFRESH_TOKEN_KEY)?.is_some());
    assert_eq!(mock.logins(), 1);
    Ok(())
}

#[tokio::test]
async fn failed_login_while_signed_in_only_sets_error() -> anyhow::Result<()> {
    let (mock, s, _storage) = signed_in().await?;
    mock.add_user("bob@example.com", "hunter2");
    let before = s.tokens();

    let err = s.login("bob@example.com", "wrong").await;
    assert!(matches!(err, Err(SessionError::Unauthorized(_))), "got {err:?}");

    let snap = s.snapshot();
    assert_eq!(snap.phase, Phase::Authenticated);
    assert_eq!(snap.current_user.and_then(|u| u.email).as_deref(), Some(ADA));
    assert_eq!(snap.error.as_deref(), Some(INVALID_CREDENTIALS));
    assert_eq!(s.tokens(), before);
    Ok(())
}

#[tokio::test]
async fn failed_login_from_signed_out_stays_signed_out() -> anyhow::Result<()> {
    let mock = MockAuth::start().await?;
    let s = session(&mock, Arc::new(MemoryStorage::new()))?;
    s.init().await;

    assert!(s.login(ADA, "nope").await.is_err());
    let snap = s.snapshot();
    assert_eq!(snap.phase, Phase::Unauthenticated);
    assert_eq!(snap.error.as_deref(), Some(INVALID_CREDENTIALS));
    assert!(s.tokens().is_none());
    Ok(())
}

#[tokio::test]
async fn logout_removes_both_keys() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("tokens.json");
    let mock = MockAuth::start().await?;
    mock.add_user(ADA, ADA_PW);

    let s = session(&mock, Arc::new(FileStorage::new(&path)))?;
    s.init().await;
    s.login(ADA, ADA_PW).await?;
    s.logout();

    let snap = s.snapshot();
    assert_eq!(snap.phase, Phase::Unauthenticated);
    assert!(snap.current_user.is_none());
    assert!(snap.error.is_none());

    let on_disk = FileStorage::new(&path);
    assert_eq!(on_disk.get(ACCESS_TOKEN_KEY)?, None);
    assert_eq!(on_disk.get(REFRESH_TOKEN_KEY)?, None);
    Ok(())
}

#[tokio::test]
async fn subscribers_observe_login() -> anyhow::Result<()> {
    let mock = MockAuth::start().await?;
    mock.add_user(ADA, ADA_PW);
    let s = session(&mock, Arc::new(MemoryStorage::new()))?;
    s.init().await;

    let mut rx = s.subscribe();
    rx.borrow_and_update();
    let watcher = tokio::spawn(async move {
        rx.wait_for(|snap| snap.phase == Phase::Authenticated).await.map(|snap| snap.clone())
    });

    s.login(ADA, ADA_PW).await?;
    let seen = tokio::time::timeout(Duration::from_secs(5), watcher).await???;
    assert_eq!(seen.current_user.and_then(|u| u.email).as_deref(), Some(ADA));
    Ok(())
}

// -- Startup -----------------------------------------------------------------

#[tokio::test]
async fn startup_restores_a_stored_session() -> anyhow::Result<()> {
    let mock = MockAuth::start().await?;
    mock.add_user(ADA, ADA_PW);
    let pair = mock.issue(ADA, 300);
    let storage = Arc::new(MemoryStorage::new());
    seed(&*storage, &pair.access_token, &pair.refresh_token)?;

    let s = session(&mock, storage)?;
    assert!(s.is_loading());
    s.init().await;

    assert_eq!(s.snapshot().phase, Phase::Authenticated);
    assert!(!s.is_loading());
    assert_eq!(mock.profile_fetches(), 1);
    assert_eq!(mock.refreshes(), 0);
    assert_eq!(mock.logins(), 0);
    Ok(())
}

#[tokio::test]
async fn startup_with_expired_access_refreshes_and_persists() -> anyhow::Result<()> {
    let mock = MockAuth::start().await?;
    mock.add_user(ADA, ADA_PW);
    let pair = mock.issue(ADA, -60);
    let storage = Arc::new(MemoryStorage::new());
    seed(&*storage, &pair.access_token, &pair.refresh_token)?;

    let s = session(&mock, storage.clone())?;
    s.init().await;

    assert_eq!(s.snapshot().phase, Phase::Authenticated);
    assert_eq!(mock.refreshes(), 1);

    let stored = storage.get(ACCESS_TOKEN_KEY)?.unwrap_or_default();
    assert_ne!(stored, pair.access_token);
    assert!(!token::is_expired(&stored, token::epoch_secs()));
    assert_eq!(storage.get(REFRESH_TOKEN_KEY)?.as_deref(), Some(pair.refresh_token.as_str()));
    Ok(())
}

#[tokio::test]
async fn startup_with_invalid_refresh_signs_out() -> anyhow::Result<()> {
    let mock = MockAuth::start().await?;
    mock.add_user(ADA, ADA_PW);
    let pair = mock.issue(ADA, -60);
    mock.revoke_refresh(&pair.refresh_token);
    let storage = Arc::new(MemoryStorage::new());
    seed(&*storage, &pair.access_token, &pair.refresh_token)?;

    let s = session(&mock, storage.clone())?;
    s.init().await;

    let snap = s.snapshot();
    assert_eq!(snap.phase, Phase::Unauthenticated);
    assert!(!snap.is_loading);
    assert!(snap.current_user.is_none());
    assert_eq!(storage.get(ACCESS_TOKEN_KEY)?, None);
    assert_eq!(storage.get(REFRESH_TOKEN_KEY)?, None);
    Ok(())
}

#[tokio::test]
async fn startup_with_revoked_access_signs_out() -> anyhow::Result<()> {
    let mock = MockAuth::start().await?;
    mock.add_user(ADA, ADA_PW);
    let pair = mock.issue(ADA, 300);
    mock.revoke_access(&pair.access_token);
    let storage = Arc::new(MemoryStorage::new());
    seed(&*storage, &pair.access_token, &pair.refresh_token)?;

    let s = session(&mock, storage.clone())?;
    s.init().await;

    let snap = s.snapshot();
    assert_eq!(snap.phase, Phase::Unauthenticated);
    assert!(!snap.is_loading);
    assert!(snap.current_user.is_none());
    assert_eq!(mock.refreshes(), 0);
    assert_eq!(mock.profile_fetches(), 1);
    assert_eq!(storage.get(ACCESS_TOKEN_KEY)?, None);
    assert_eq!(storage.get(REFRESH_TOKEN_KEY)?, None);
    Ok(())
}

#[tokio::test]
async fn concurrent_init_runs_once() -> anyhow::Result<()> {
    let mock = MockAuth::start().await?;
    mock.add_user(ADA, ADA_PW);
    let pair = mock.issue(ADA, 300);
    let storage = Arc::new(MemoryStorage::new());
    seed(&*storage, &pair.access_token, &pair.refresh_token)?;

    let s = session(&mock, storage)?;
    let other = s.clone();
    tokio::join!(s.init(), other.init());
    s.init().await;

    assert_eq!(s.snapshot().phase, Phase::Authenticated);
    assert_eq!(mock.profile_fetches(), 1);
    Ok(())
}

#[tokio::test]
async fn session_survives_restart_with_file_storage() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("state/tokens.json");
    let mock = MockAuth::start().await?;
    mock.add_user(ADA, ADA_PW);

    let first = session(&mock, Arc::new(FileStorage::new(&path)))?;
    first.init().await;
    first.login(ADA, ADA_PW).await?;
    first.close();
    drop(first);

    let second = session(&mock, Arc::new(FileStorage::new(&path)))?;
    second.init().await;
    assert_eq!(second.snapshot().phase, Phase::Authenticated);
    assert_eq!(mock.logins(), 1);
    Ok(())
}

// -- Refresh and retry -------------------------------------------------------

#[tokio::test]
async fn expired_token_is_refreshed_once_for_concurrent_requests() -> anyhow::Result<()> {
    let mock = MockAuth::start().await?;
    mock.add_user(ADA, ADA_PW);
    let s = session(&mock, Arc::new(MemoryStorage::new()))?;
    s.init().await;

    // Sign in with an access token that is already past its exp.
    mock.state.access_ttl_secs.store(-5, Ordering::Relaxed);
    s.login(ADA, ADA_PW).await?;
    mock.state.access_ttl_secs.store(300, Ordering::Relaxed);
    mock.state.refresh_delay_ms.store(150, Ordering::Relaxed);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let s = s.clone();
        handles.push(tokio::spawn(async move { s.request(Method::GET, RESOURCE, None).await }));
    }
    let mut tokens = Vec::new();
    for h in handles {
        let body = h.await??;
        tokens.push(body["token"].as_str().unwrap_or_default().to_owned());
    }

    assert_eq!(mock.refreshes(), 1);
    assert_eq!(mock.resource_calls(), 8);
    assert!(tokens.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(s.tokens().map(|p| p.access_token), Some(tokens[0].clone()));
    assert_eq!(s.snapshot().phase, Phase::Authenticated);
    Ok(())
}

#[tokio::test]
async fn simultaneous_401s_share_one_refresh() -> anyhow::Result<()> {
    let (mock, s, _storage) = signed_in().await?;
    let old = s.tokens().map(|p| p.access_token).unwrap_or_default();
    mock.revoke_access(&old);
    mock.state.refresh_delay_ms.store(150, Ordering::Relaxed);

    let results =
        futures_util::future::join_all((0..5).map(|_| s.request(Method::GET, RESOURCE, None))).await;

    assert!(results.iter().all(Result::is_ok), "results: {results:?}");
    assert_eq!(mock.refreshes(), 1);
    assert_eq!(mock.resource_calls(), 10);
    assert_eq!(s.snapshot().phase, Phase::Authenticated);
    Ok(())
}

#[tokio::test]
async fn second_401_is_not_retried_again() -> anyhow::Result<()> {
    let (mock, s, storage) = signed_in().await?;
    mock.state.resource_always_401.store(true, Ordering::Relaxed);

    let err = s.request(Method::GET, RESOURCE, None).await;
    assert!(matches!(err, Err(SessionError::Unauthorized(_))), "got {err:?}");
    assert_eq!(mock.resource_calls(), 2);
    assert_eq!(mock.refreshes(), 1);

    // A 401 by itself never signs the session out.
    assert_eq!(s.snapshot().phase, Phase::Authenticated);
    assert!(storage.get(ACCESS_TOKEN_KEY)?.is_some());
    Ok(())
}

#[tokio::test]
async fn forbidden_does_not_refresh() -> anyhow::Result<()> {
    let (mock, s, _storage) = signed_in().await?;
    let before = s.tokens();
    mock.state.resource_forbidden.store(true, Ordering::Relaxed);

    let err = s.request(Method::GET, RESOURCE, None).await;
    assert!(matches!(err, Err(SessionError::Forbidden(_))), "got {err:?}");
    assert_eq!(mock.resource_calls(), 1);
    assert_eq!(mock.refreshes(), 0);
    assert_eq!(s.tokens(), before);
    assert_eq!(s.snapshot().phase, Phase::Authenticated);
    Ok(())
}

#[tokio::test]
async fn rejected_refresh_during_request_signs_out() -> anyhow::Result<()> {
    let (mock, s, storage) = signed_in().await?;
    let pair = s.tokens().ok_or_else(|| anyhow::anyhow!("no tokens after login"))?;
    mock.revoke_access(&pair.access_token);
    mock.revoke_refresh(&pair.refresh_token);

    let err = s.request(Method::GET, RESOURCE, None).await;
    assert!(matches!(err, Err(SessionError::Unauthorized(_))), "original 401 expected, got {err:?}");

    let snap = s.snapshot();
    assert_eq!(snap.phase, Phase::Unauthenticated);
    assert!(snap.current_user.is_none());
    assert!(snap.error.is_some());
    assert_eq!(storage.get(ACCESS_TOKEN_KEY)?, None);
    assert_eq!(storage.get(REFRESH_TOKEN_KEY)?, None);
    Ok(())
}

#[tokio::test]
async fn rotated_refresh_token_is_persisted() -> anyhow::Result<()> {
    let (mock, s, storage) = signed_in().await?;
    mock.state.rotate_refresh.store(true, Ordering::Relaxed);
    let pair = s.tokens().ok_or_else(|| anyhow::anyhow!("no tokens after login"))?;
    mock.revoke_access(&pair.access_token);

    s.request(Method::GET, RESOURCE, None).await?;

    let refresh = storage.get(REFRESH_TOKEN_KEY)?.unwrap_or_default();
    assert_ne!(refresh, pair.refresh_token);
    assert!(refresh.starts_with("refresh-"));
    Ok(())
}

#[tokio::test]
async fn logout_during_refresh_discards_the_result() -> anyhow::Result<()> {
    let (mock, s, storage) = signed_in().await?;
    let pair = s.tokens().ok_or_else(|| anyhow::anyhow!("no tokens after login"))?;
    mock.revoke_access(&pair.access_token);
    mock.state.refresh_delay_ms.store(200, Ordering::Relaxed);

    let pending = {
        let s = s.clone();
        tokio::spawn(async move { s.request(Method::GET, RESOURCE, None).await })
    };
    tokio::time::sleep(Duration::from_millis(80)).await;
    s.logout();

    assert!(pending.await?.is_err());
    assert_eq!(storage.get(ACCESS_TOKEN_KEY)?, None);
    assert_eq!(s.snapshot().phase, Phase::Unauthenticated);
    Ok(())
}

#[tokio::test]
async fn late_refresh_rejection_keeps_a_new_login() -> anyhow::Result<()> {
    let (mock, s, storage) = signed_in().await?;
    let old = s.tokens().ok_or_else(|| anyhow::anyhow!("no tokens after login"))?;
    mock.revoke_access(&old.access_token);
    mock.revoke_refresh(&old.refresh_token);
    mock.state.refresh_delay_ms.store(300, Ordering::Relaxed);

    let pending = {
        let s = s.clone();
        tokio::spawn(async move { s.request(Method::GET, RESOURCE, None).await })
    };
    tokio::time::sleep(Duration::from_millis(80)).await;
    s.logout();
    s.login(ADA, ADA_PW).await?;
    let fresh = s.tokens().ok_or_else(|| anyhow::anyhow!("no tokens after second login"))?;

    assert!(pending.await?.is_err());

    let snap = s.snapshot();
    assert_eq!(snap.phase, Phase::Authenticated);
    assert_eq!(snap.current_user.and_then(|u| u.email).as_deref(), Some(ADA));
    assert!(snap.error.is_none());
    assert_eq!(s.tokens(), Some(fresh.clone()));
    assert_eq!(storage.get(ACCESS_TOKEN_KEY)?.as_deref(), Some(fresh.access_token.as_str()));
    assert_eq!(storage.get(REFRESH_TOKEN_KEY)?.as_deref(), Some(fresh.refresh_token.as_str()));
    Ok(())
}

#[tokio::test]
async fn new_login_does_not_join_a_stale_refresh() -> anyhow::Result<()> {
    let (mock, s, _storage) = signed_in().await?;
    let old = s.tokens().ok_or_else(|| anyhow::anyhow!("no tokens after login"))?;
    mock.revoke_access(&old.access_token);
    mock.revoke_refresh(&old.refresh_token);
    mock.state.refresh_delay_ms.store(300, Ordering::Relaxed);

    let stale = {
        let s = s.clone();
        tokio::spawn(async move { s.request(Method::GET, RESOURCE, None).await })
    };
    tokio::time::sleep(Duration::from_millis(80)).await;
    s.logout();
    s.login(ADA, ADA_PW).await?;

    // The new access token is revoked while the old refresh is still running;
    // recovery must use the new refresh token.
    let fresh = s.tokens().ok_or_else(|| anyhow::anyhow!("no tokens after second login"))?;
    mock.revoke_access(&fresh.access_token);
    let body = s.request(Method::GET, RESOURCE, None).await?;
    assert_eq!(body["owner"], ADA);

    assert!(stale.await?.is_err());
    assert_eq!(mock.refreshes(), 2);
    assert_eq!(s.snapshot().phase, Phase::Authenticated);
    assert_eq!(s.tokens().map(|p| p.refresh_token), Some(fresh.refresh_token));
    Ok(())
}

// -- Profile and account operations ------------------------------------------

#[tokio::test]
async fn update_profile_replaces_current_user() -> anyhow::Result<()> {
    let (_mock, s, _storage) = signed_in().await?;

    let user = s.update_profile(&json!({ "first_name": "Ada", "last_name": "Lovelace" })).await?;
    assert_eq!(user.first_name.as_deref(), Some("Ada"));
    let current = s.current_user().ok_or_else(|| anyhow::anyhow!("no current user"))?;
    assert_eq!(current.last_name.as_deref(), Some("Lovelace"));
    assert_eq!(current.email.as_deref(), Some(ADA));
    Ok(())
}

#[tokio::test]
async fn update_profile_validation_error_is_surfaced() -> anyhow::Result<()> {
    let (_mock, s, _storage) = signed_in().await?;
    let before = s.tokens();

    let err = s.update_profile(&json!({ "email": "" })).await;
    match err {
        Err(SessionError::Validation { status, body, .. }) => {
            assert_eq!(status, 400);
            assert_eq!(body, Some(json!({ "email": ["This field may not be blank."] })));
        }
        other => anyhow::bail!("expected validation error, got {other:?}"),
    }
    assert_eq!(s.error().as_deref(), Some("email: This field may not be blank."));
    assert_eq!(s.tokens(), before);
    assert_eq!(s.current_user().and_then(|u| u.email).as_deref(), Some(ADA));
    Ok(())
}

#[tokio::test]
async fn change_password_round_trip() -> anyhow::Result<()> {
    let (mock, s, _storage) = signed_in().await?;

    let wrong = PasswordChange { current_password: "nope".to_owned(), new_password: "n3w".to_owned() };
    assert!(matches!(s.change_password(&wrong).await, Err(SessionError::Validation { .. })));
    assert_eq!(s.error().as_deref(), Some("current_password: Wrong password."));
    assert_eq!(s.snapshot().phase, Phase::Authenticated);

    let right = PasswordChange { current_password: ADA_PW.to_owned(), new_password: "n3w".to_owned() };
    s.change_password(&right).await?;
    assert!(s.error().is_none());

    s.logout();
    s.login(ADA, "n3w").await?;
    assert_eq!(mock.logins(), 2);
    Ok(())
}

#[tokio::test]
async fn register_does_not_sign_in() -> anyhow::Result<()> {
    let mock = MockAuth::start().await?;
    let s = session(&mock, Arc::new(MemoryStorage::new()))?;
    s.init().await;

    let mut extra = Map::new();
    extra.insert("first_name".to_owned(), Value::from("Grace"));
    let registration = Registration { email: "grace@example.com".to_owned(), password: "pw".to_owned(), extra };
    let user = s.register(&registration).await?;
    assert_eq!(user.first_name.as_deref(), Some("Grace"));
    assert_eq!(s.snapshot().phase, Phase::Unauthenticated);
    assert!(s.tokens().is_none());

    let err = s.register(&registration).await;
    assert!(matches!(err, Err(SessionError::Validation { status: 400, .. })), "got {err:?}");
    assert_eq!(s.error().as_deref(), Some("email: user with this email already exists."));
    Ok(())
}

#[tokio::test]
async fn requests_without_a_session_fail_locally() -> anyhow::Result<()> {
    let mock = MockAuth::start().await?;
    let s = session(&mock, Arc::new(MemoryStorage::new()))?;
    s.init().await;

    assert_eq!(s.request(Method::GET, RESOURCE, None).await, Err(SessionError::NotAuthenticated));
    assert_eq!(mock.resource_calls(), 0);
    assert_eq!(mock.refreshes(), 0);
    Ok(())
}
