// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde_json::Value;

/// Generic message shown when the server gave no usable detail.
pub const GENERIC_FAILURE: &str = "Something went wrong. Please try again.";

/// Errors surfaced by the session manager.
///
/// `Clone` because a single refresh outcome is fanned out to every caller
/// waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Network or transport failure (connect, timeout, truncated body).
    #[error("transport error: {0}")]
    Transport(String),
    /// The server rejected the bearer token (HTTP 401).
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// The server refused access to the resource (HTTP 403).
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// The refresh token was rejected; the session has been signed out.
    #[error("refresh rejected: {0}")]
    RefreshRejected(String),
    /// 4xx with a structured error body.
    #[error("validation failed ({status}): {message}")]
    Validation { status: u16, message: String, body: Option<Value> },
    /// 5xx from the server.
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },
    /// A success response whose body could not be decoded.
    #[error("invalid response: {0}")]
    Decode(String),
    /// No token pair is available for an authenticated call.
    #[error("not authenticated")]
    NotAuthenticated,
    /// The session was closed.
    #[error("session closed")]
    Closed,
    #[error("internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transport(_) => "TRANSPORT",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::RefreshRejected(_) => "REFRESH_REJECTED",
            Self::Validation { .. } => "VALIDATION",
            Self::Server { .. } => "SERVER",
            Self::Decode(_) => "DECODE",
            Self::NotAuthenticated => "NOT_AUTHENTICATED",
            Self::Closed => "CLOSED",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Whether this error should trigger the refresh-and-retry protocol.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }

    /// Whether the error is local to the call and safe to retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Server { .. })
    }

    /// Human-readable message suitable for the session's `error` field.
    pub fn user_message(&self) -> String {
        match self {
            Self::Transport(_) => "Unable to reach the server. Please try again.".to_owned(),
            Self::Unauthorized(msg) | Self::Forbidden(msg) if !msg.is_empty() => msg.clone(),
            Self::Unauthorized(_) => "You are not signed in.".to_owned(),
            Self::Forbidden(_) => "You do not have permission to do that.".to_owned(),
            Self::RefreshRejected(_) => "Your session has expired. Please sign in again.".to_owned(),
            Self::Validation { message, .. } if !message.is_empty() => message.clone(),
            Self::Server { .. } | Self::Decode(_) | Self::Internal(_) | Self::Validation { .. } => {
                GENERIC_FAILURE.to_owned()
            }
            Self::NotAuthenticated => "You are not signed in.".to_owned(),
            Self::Closed => "The session has been closed.".to_owned(),
        }
    }

    /// Build an error from an HTTP status and optional JSON error body.
    ///
    /// `fallback` is used when the body carries no usable message.
    pub fn from_status(status: u16, body: Option<Value>, fallback: &str) -> Self {
        let message = body.as_ref().and_then(describe_error_body).unwrap_or_else(|| fallback.to_owned());
        match status {
            401 => Self::Unauthorized(message),
            403 => Self::Forbidden(message),
            400..=499 => Self::Validation { status, message, body },
            _ => Self::Server { status, message },
        }
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// Extract a human-readable message from a server error payload.
///
/// Understands `{"detail": ...}`, `{"message": ...}`, `{"error_description": ...}`,
/// `{"error": ...}` and field maps such as `{"email": ["already taken"]}`.
pub fn describe_error_body(body: &Value) -> Option<String> {
    let obj = match body {
        Value::String(s) if !s.trim().is_empty() => return Some(s.trim().to_owned()),
        Value::Object(obj) => obj,
        _ => return None,
    };

    for key in ["detail", "message", "error_description", "error"] {
        if let Some(msg) = obj.get(key).and_then(flatten_messages) {
            return Some(msg);
        }
    }

    let fields: Vec<String> = obj
        .iter()
        .filter(|(k, _)| k.as_str() != "code")
        .filter_map(|(k, v)| {
            let msg = flatten_messages(v)?;
            if k == "non_field_errors" {
                Some(msg)
            } else {
                Some(format!("{k}: {msg}"))
            }
        })
        .collect();
    if fields.is_empty() {
        None
    } else {
        Some(fields.join("; "))
    }
}

fn flatten_messages(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_owned()),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(flatten_messages).collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join(" "))
            }
        }
        _ => None,
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
