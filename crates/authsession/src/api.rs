// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP client for the auth server's REST endpoints.

use std::time::Duration;

use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SessionError;
use crate::state::UserRecord;

pub const TOKEN_PATH: &str = "/auth/token";
pub const REFRESH_PATH: &str = "/auth/token/refresh";
pub const PROFILE_PATH: &str = "/auth/users/me";
pub const CHANGE_PASSWORD_PATH: &str = "/auth/users/change_password";
pub const REGISTER_PATH: &str = "/auth/register";

/// Token endpoint response. Accepts both `access`/`refresh` and camelCase keys.
#[derive(Debug, Clone, Deserialize)]
pub struct IssuedTokens {
    #[serde(alias = "access", alias = "accessToken")]
    pub access_token: String,
    #[serde(alias = "refresh", alias = "refreshToken")]
    pub refresh_token: String,
}

/// Refresh endpoint response. A refresh token is present only when the server rotates it.
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshedTokens {
    #[serde(alias = "access", alias = "accessToken")]
    pub access_token: String,
    #[serde(default, alias = "refresh", alias = "refreshToken")]
    pub refresh_token: Option<String>,
}

/// Payload for `POST /auth/register`.
#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub email: String,
    pub password: String,
    /// Any additional fields the server expects (names, invite codes, ...).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Payload for `POST /auth/users/change_password`.
#[derive(Debug, Clone, Serialize)]
pub struct PasswordChange {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Serialize)]
struct LoginBody<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct RefreshBody<'a> {
    refresh: &'a str,
}

/// Outcome of a refresh call.
#[derive(Debug)]
pub enum RefreshOutcome {
    Refreshed(RefreshedTokens),
    /// The server refused the refresh token (4xx).
    Rejected(String),
}

/// Thin wrapper over [`reqwest::Client`] bound to one auth server.
#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: String,
    client: Client,
}

impl ApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SessionError> {
        crate::ensure_crypto_provider();
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SessionError::Internal(format!("build http client: {e}")))?;
        Ok(Self { base_url: base_url.trim_end_matches('/').to_owned(), client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// `POST /auth/token`: exchange credentials for a token pair.
    pub async fn obtain_tokens(&self, identifier: &str, secret: &str) -> Result<IssuedTokens, SessionError> {
        let req = self.client.post(self.url(TOKEN_PATH)).json(&LoginBody { email: identifier, password: secret });
        decode(req.send().await?, "Login failed. Please check your credentials.").await
    }

    /// `POST /auth/token/refresh`.
    ///
    /// Any 4xx means the refresh token is no longer usable; 5xx and transport
    /// errors are returned as `Err` and leave the token pair alone.
    pub async fn refresh(&self, refresh_token: &str) -> Result<RefreshOutcome, SessionError> {
        let req = self.client.post(self.url(REFRESH_PATH)).json(&RefreshBody { refresh: refresh_token });
        match decode::<RefreshedTokens>(req.send().await?, "Refresh token rejected.").await {
            Ok(tokens) => Ok(RefreshOutcome::Refreshed(tokens)),
            Err(
                SessionError::Unauthorized(msg)
                | SessionError::Forbidden(msg)
                | SessionError::Validation { message: msg, .. },
            ) => Ok(RefreshOutcome::Rejected(msg)),
            Err(e) => Err(e),
        }
    }

    /// `GET /auth/users/me`.
    pub async fn fetch_profile(&self, access_token: &str) -> Result<UserRecord, SessionError> {
        let req = self.client.get(self.url(PROFILE_PATH)).bearer_auth(access_token);
        decode(req.send().await?, "Could not load your profile.").await
    }

    /// `PATCH /auth/users/me`.
    pub async fn update_profile(&self, access_token: &str, patch: &Value) -> Result<UserRecord, SessionError> {
        let req = self.client.patch(self.url(PROFILE_PATH)).bearer_auth(access_token).json(patch);
        decode(req.send().await?, "Could not update your profile.").await
    }

    /// `POST /auth/users/change_password`.
    pub async fn change_password(&self, access_token: &str, change: &PasswordChange) -> Result<(), SessionError> {
        let req = self.client.post(self.url(CHANGE_PASSWORD_PATH)).bearer_auth(access_token).json(change);
        decode::<Value>(req.send().await?, "Could not change your password.").await.map(|_| ())
    }

    /// `POST /auth/register`, unauthenticated.
    pub async fn register(&self, registration: &Registration) -> Result<UserRecord, SessionError> {
        let req = self.client.post(self.url(REGISTER_PATH)).json(registration);
        decode(req.send().await?, "Registration failed.").await
    }

    /// Send an arbitrary authenticated JSON request. Empty bodies decode to `Null`.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        access_token: &str,
    ) -> Result<Value, SessionError> {
        let mut req = self.client.request(method, self.url(path)).bearer_auth(access_token);
        if let Some(body) = body {
            req = req.json(body);
        }
        decode(req.send().await?, "Request failed.").await
    }
}

/// Map a response to `T` or a classified [`SessionError`].
async fn decode<T: DeserializeOwned>(resp: reqwest::Response, fallback: &str) -> Result<T, SessionError> {
    let status = resp.status();
    let bytes = resp.bytes().await?;

    if !status.is_success() {
        let body = serde_json::from_slice::<Value>(&bytes).ok().or_else(|| {
            let text = String::from_utf8_lossy(&bytes).trim().to_owned();
            (!text.is_empty() && text.len() <= 200).then_some(Value::String(text))
        });
        return Err(SessionError::from_status(status.as_u16(), body, fallback));
    }

    let slice: &[u8] = if bytes.is_empty() { b"null" } else { &bytes };
    serde_json::from_slice(slice).map_err(|e| SessionError::Decode(e.to_string()))
}
