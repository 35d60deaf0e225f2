// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Single-flight access token refresh.
//!
//! At most one refresh call is outstanding. Callers arriving while it runs
//! join the same shared outcome; callers holding a token that was already
//! replaced get the current token without another network call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, RefreshOutcome};
use crate::error::SessionError;
use crate::state::SessionState;
use crate::store::TokenStore;

type RefreshResult = Result<String, SessionError>;

/// The in-flight marker: one shared outcome, tagged so only its own task clears it.
struct InFlight {
    id: u64,
    outcome: Shared<BoxFuture<'static, RefreshResult>>,
}

/// Coalesces concurrent refresh requests into one call to the refresh endpoint.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    api: ApiClient,
    store: TokenStore,
    state: Arc<SessionState>,
    timeout: Duration,
    shutdown: CancellationToken,
    in_flight: Mutex<Option<InFlight>>,
    next_id: AtomicU64,
    calls: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(
        api: ApiClient,
        store: TokenStore,
        state: Arc<SessionState>,
        timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                store,
                state,
                timeout,
                shutdown,
                in_flight: Mutex::new(None),
                next_id: AtomicU64::new(0),
                calls: AtomicU64::new(0),
            }),
        }
    }

    /// Obtain an access token newer than `stale`.
    ///
    /// Joins a running refresh if there is one. If the store already holds a
    /// different access token, returns it without calling the server.
    pub async fn refresh_from(&self, stale: &str) -> RefreshResult {
        let outcome = {
            let mut slot = self.inner.in_flight.lock();
            match slot.as_ref() {
                Some(running) => running.outcome.clone(),
                None => {
                    match self.inner.store.access_token() {
                        Some(current) if current != stale => return Ok(current),
                        _ => {}
                    }
                    let running = self.start();
                    let outcome = running.outcome.clone();
                    *slot = Some(running);
                    outcome
                }
            }
        };
        outcome.await
    }

    /// Force a refresh of whatever token is currently held.
    pub async fn refresh(&self) -> RefreshResult {
        let current = self.inner.store.access_token().unwrap_or_default();
        self.refresh_from(&current).await
    }

    /// Forget the running refresh, if any, so later callers start a new one.
    ///
    /// The detached task still finishes, but its result only touches the
    /// store while the pair it started from is current.
    pub fn reset(&self) {
        if self.inner.in_flight.lock().take().is_some() {
            debug!("detached in-flight refresh");
        }
    }

    /// Whether a refresh is currently running.
    pub fn in_flight(&self) -> bool {
        self.inner.in_flight.lock().is_some()
    }

    /// Number of refresh calls issued to the server so far.
    pub fn calls(&self) -> u64 {
        self.inner.calls.load(Ordering::Relaxed)
    }

    /// Spawn the refresh task. Must be called with the in-flight slot locked.
    fn start(&self) -> InFlight {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let _clear = ClearOnDrop { inner: Arc::clone(&inner), id };
            inner.state.begin_refresh();
            let result = tokio::select! {
                r = tokio::time::timeout(inner.timeout, inner.run()) => r.unwrap_or_else(|_| {
                    warn!(timeout_ms = inner.timeout.as_millis() as u64, "token refresh timed out");
                    Err(SessionError::Transport("token refresh timed out".to_owned()))
                }),
                _ = inner.shutdown.cancelled() => Err(SessionError::Closed),
            };
            inner.state.end_refresh();
            result
        });
        let outcome = task
            .map(|joined| {
                joined.unwrap_or_else(|e| Err(SessionError::Internal(format!("refresh task failed: {e}"))))
            })
            .boxed()
            .shared();
        InFlight { id, outcome }
    }
}

impl Inner {
    async fn run(&self) -> RefreshResult {
        let Some(refresh_token) = self.store.refresh_token() else {
            let err = SessionError::RefreshRejected("no refresh token available".to_owned());
            // A user without a pair cannot stay signed in.
            if self.state.snapshot().is_authenticated() {
                warn!("signed in without a refresh token, signing out");
                self.state.expire(Some(err.user_message()));
            }
            return Err(err);
        };

        self.calls.fetch_add(1, Ordering::Relaxed);
        debug!("refreshing access token");
        match self.api.refresh(&refresh_token).await? {
            RefreshOutcome::Refreshed(tokens) => {
                let rotated = tokens.refresh_token.is_some();
                if !self.store.replace_access_token(&refresh_token, tokens.access_token.clone(), tokens.refresh_token)
                {
                    debug!("token pair changed during refresh, discarding result");
                    return self.store.access_token().ok_or(SessionError::NotAuthenticated);
                }
                info!(rotated, "access token refreshed");
                Ok(tokens.access_token)
            }
            RefreshOutcome::Rejected(msg) => Err(self.reject(&refresh_token, msg)),
        }
    }

    /// Unrecoverable: drop the pair that carried `used_refresh` and sign the
    /// session out. A pair installed since then is left alone.
    fn reject(&self, used_refresh: &str, msg: String) -> SessionError {
        let err = SessionError::RefreshRejected(msg);
        if self.store.clear_if(used_refresh) {
            warn!(error = %err, "refresh token rejected, signing out");
            self.state.expire(Some(err.user_message()));
        } else {
            debug!(error = %err, "stale refresh token rejected, keeping the current pair");
        }
        err
    }
}

/// Clears the in-flight marker when the refresh task ends, even on panic.
struct ClearOnDrop {
    inner: Arc<Inner>,
    id: u64,
}

impl Drop for ClearOnDrop {
    fn drop(&mut self) {
        let mut slot = self.inner.in_flight.lock();
        if slot.as_ref().is_some_and(|running| running.id == self.id) {
            *slot = None;
        }
    }
}

#[cfg(test)]
#[path = "refresh_tests.rs"]
mod tests;
