// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Refresh-and-retry wrapper for authenticated requests.

use std::future::Future;

use tracing::debug;

use crate::error::SessionError;
use crate::refresh::RefreshCoordinator;
use crate::store::TokenStore;
use crate::token;

/// Wraps request-issuing closures with the 401 recovery protocol.
///
/// The closure receives the bearer token to send. A 401 triggers one refresh
/// and one replay with the new token; a second 401 is returned as-is.
#[derive(Clone)]
pub struct RetryInterceptor {
    store: TokenStore,
    refresher: RefreshCoordinator,
    leeway_secs: u64,
}

impl RetryInterceptor {
    pub fn new(store: TokenStore, refresher: RefreshCoordinator, leeway_secs: u64) -> Self {
        Self { store, refresher, leeway_secs }
    }

    /// Issue `send` with the current access token, recovering once from a 401.
    pub async fn call<T, F, Fut>(&self, mut send: F) -> Result<T, SessionError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, SessionError>>,
    {
        let mut token = self.store.access_token().ok_or(SessionError::NotAuthenticated)?;
        if token::is_expired(&token, token::epoch_secs() + self.leeway_secs) {
            debug!("access token expired locally, refreshing before send");
            token = self.refresher.refresh_from(&token).await?;
        }

        let err = match send(token.clone()).await {
            Err(err) if err.is_unauthorized() => err,
            other => return other,
        };

        debug!("request unauthorized, refreshing and retrying once");
        match self.refresher.refresh_from(&token).await {
            Ok(fresh) => send(fresh).await,
            Err(refresh_err) => {
                debug!(err = %refresh_err, "refresh failed, returning original error");
                Err(err)
            }
        }
    }
}
