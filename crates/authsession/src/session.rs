// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The application-facing session handle.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde_json::Value;
use tokio::sync::{watch, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, PasswordChange, Registration};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::refresh::RefreshCoordinator;
use crate::retry::RetryInterceptor;
use crate::state::{SessionSnapshot, SessionState, UserRecord};
use crate::store::{Storage, TokenPair, TokenStore};
use crate::token;

/// Timing knobs for a session.
#[derive(Debug, Clone, Copy)]
pub struct SessionTimings {
    pub request_timeout: Duration,
    pub refresh_timeout: Duration,
    pub expiry_leeway_secs: u64,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            refresh_timeout: Duration::from_secs(10),
            expiry_leeway_secs: 0,
        }
    }
}

/// Authentication session for one running client.
///
/// Construct once at the application boundary and hand out clones; all clones
/// share the same state.
#[derive(Clone)]
pub struct AuthSession {
    inner: Arc<Inner>,
}

struct Inner {
    api: ApiClient,
    store: TokenStore,
    state: Arc<SessionState>,
    refresher: RefreshCoordinator,
    interceptor: RetryInterceptor,
    leeway_secs: u64,
    init: OnceCell<()>,
    shutdown: CancellationToken,
}

impl AuthSession {
    /// Build a session from configuration and a storage backend.
    pub fn from_config(config: &SessionConfig, storage: Arc<dyn Storage>) -> Result<Self, SessionError> {
        Self::new(&config.api_url, storage, config.timings())
    }

    pub fn new(api_url: &str, storage: Arc<dyn Storage>, timings: SessionTimings) -> Result<Self, SessionError> {
        let api = ApiClient::new(api_url, timings.request_timeout)?;
        let store = TokenStore::new(storage);
        let state = Arc::new(SessionState::new());
        let shutdown = CancellationToken::new();
        let refresher = RefreshCoordinator::new(
            api.clone(),
            store.clone(),
            Arc::clone(&state),
            timings.refresh_timeout,
            shutdown.clone(),
        );
        let interceptor = RetryInterceptor::new(store.clone(), refresher.clone(), timings.expiry_leeway_secs);
        Ok(Self {
            inner: Arc::new(Inner {
                api,
                store,
                state,
                refresher,
                interceptor,
                leeway_secs: timings.expiry_leeway_secs,
                init: OnceCell::new(),
                shutdown,
            }),
        })
    }

    // -- Reactive surface ----------------------------------------------------

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.state.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.state.snapshot()
    }

    pub fn current_user(&self) -> Option<UserRecord> {
        self.inner.state.snapshot().current_user
    }

    pub fn is_loading(&self) -> bool {
        self.inner.state.snapshot().is_loading
    }

    pub fn error(&self) -> Option<String> {
        self.inner.state.snapshot().error
    }

    pub fn clear_error(&self) {
        self.inner.state.clear_error();
    }

    /// The stored token pair, if any.
    pub fn tokens(&self) -> Option<TokenPair> {
        self.inner.store.load()
    }

    /// The refresh coordinator shared by every request of this session.
    pub fn refresher(&self) -> &RefreshCoordinator {
        &self.inner.refresher
    }

    // -- Lifecycle -----------------------------------------------------------

    /// Run the startup check. Runs once; concurrent and later calls wait for
    /// (or return) the first run.
    pub async fn init(&self) {
        self.inner.init.get_or_init(|| self.run_init()).await;
    }

    async fn run_init(&self) {
        let state = &self.inner.state;
        state.begin_init();

        let Some(pair) = self.inner.store.load() else {
            debug!("no stored tokens");
            state.finish_init_unauthenticated();
            return;
        };

        let result = if token::is_expired(&pair.access_token, token::epoch_secs() + self.inner.leeway_secs) {
            debug!("stored access token expired, refreshing");
            match self.inner.refresher.refresh_from(&pair.access_token).await {
                Ok(access) => self.inner.api.fetch_profile(&access).await,
                Err(e) => Err(e),
            }
        } else {
            // A 401 here means the token was revoked; no refresh is attempted.
            self.inner.api.fetch_profile(&pair.access_token).await
        };

        match result {
            Ok(user) if self.inner.store.load().is_some() => {
                info!(user = user.email.as_deref().unwrap_or(""), "session restored");
                state.authenticated(user);
            }
            Ok(_) => {
                debug!("tokens cleared while restoring session");
                state.finish_init_unauthenticated();
            }
            Err(e) => {
                warn!(err = %e, "stored session is not usable, signing out");
                self.inner.store.clear();
                state.finish_init_unauthenticated();
            }
        }
    }

    /// Tear the session down: cancel any running refresh and reject further
    /// operations. Persisted tokens are kept for the next start.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }

    // -- Operations ----------------------------------------------------------

    /// Sign in with credentials.
    ///
    /// On failure only `error` changes; an existing session stays signed in.
    pub async fn login(&self, identifier: &str, secret: &str) -> Result<UserRecord, SessionError> {
        self.ensure_open()?;
        let state = &self.inner.state;
        let prev = state.begin_login();

        let result = async {
            let tokens = self.inner.api.obtain_tokens(identifier, secret).await?;
            let user = self.inner.api.fetch_profile(&tokens.access_token).await?;
            Ok::<_, SessionError>((tokens, user))
        }
        .await;

        match result {
            Ok((tokens, user)) => {
                self.inner.store.save(TokenPair {
                    access_token: tokens.access_token,
                    refresh_token: tokens.refresh_token,
                });
                self.inner.refresher.reset();
                info!(user = user.email.as_deref().unwrap_or(identifier), "logged in");
                state.authenticated(user.clone());
                Ok(user)
            }
            Err(e) => {
                warn!(err = %e, "login failed");
                state.fail_login(prev, login_message(&e));
                Err(e)
            }
        }
    }

    /// Create an account. Does not sign in.
    pub async fn register(&self, registration: &Registration) -> Result<UserRecord, SessionError> {
        self.ensure_open()?;
        match self.inner.api.register(registration).await {
            Ok(user) => {
                info!(email = %registration.email, "account registered");
                self.inner.state.clear_error();
                Ok(user)
            }
            Err(e) => {
                debug!(err = %e, "registration failed");
                self.inner.state.set_error(e.user_message());
                Err(e)
            }
        }
    }

    /// Sign out. Always succeeds from the caller's point of view.
    pub fn logout(&self) {
        self.inner.store.clear();
        self.inner.refresher.reset();
        self.inner.state.sign_out();
        info!("logged out");
    }

    /// Update the signed-in user's profile and replace `current_user`.
    pub async fn update_profile(&self, patch: &Value) -> Result<UserRecord, SessionError> {
        self.ensure_open()?;
        let api = self.inner.api.clone();
        let result = self
            .inner
            .interceptor
            .call(|access| {
                let api = api.clone();
                async move { api.update_profile(&access, patch).await }
            })
            .await;
        match result {
            Ok(user) => {
                self.inner.state.replace_user(user.clone());
                Ok(user)
            }
            Err(e) => Err(self.record_error(e)),
        }
    }

    /// Change the signed-in user's password.
    pub async fn change_password(&self, change: &PasswordChange) -> Result<(), SessionError> {
        self.ensure_open()?;
        let api = self.inner.api.clone();
        let result = self
            .inner
            .interceptor
            .call(|access| {
                let api = api.clone();
                async move { api.change_password(&access, change).await }
            })
            .await;
        match result {
            Ok(()) => {
                self.inner.state.clear_error();
                Ok(())
            }
            Err(e) => Err(self.record_error(e)),
        }
    }

    /// Authenticated JSON request to any API path, with 401 recovery.
    ///
    /// Errors are returned to the caller only; the session `error` field is
    /// reserved for the session's own operations.
    pub async fn request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value, SessionError> {
        self.ensure_open()?;
        let api = self.inner.api.clone();
        self.inner
            .interceptor
            .call(|access| {
                let api = api.clone();
                let method = method.clone();
                async move { api.send(method, path, body, &access).await }
            })
            .await
    }

    fn record_error(&self, e: SessionError) -> SessionError {
        // A rejected refresh has already signed out and set its own message.
        if !matches!(e, SessionError::RefreshRejected(_)) {
            self.inner.state.set_error(e.user_message());
        }
        e
    }
}

/// Message recorded when a login attempt fails.
fn login_message(e: &SessionError) -> String {
    match e {
        SessionError::Unauthorized(msg) | SessionError::Validation { message: msg, .. } if !msg.is_empty() => {
            msg.clone()
        }
        SessionError::Transport(_) => e.user_message(),
        _ => "Login failed. Please try again.".to_owned(),
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
