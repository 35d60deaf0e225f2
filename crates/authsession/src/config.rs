// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::session::SessionTimings;
use crate::store::{FileStorage, MemoryStorage, Storage};

/// File name of the persisted token pair inside the state directory.
pub const TOKENS_FILE: &str = "tokens.json";

/// Configuration for an auth session.
#[derive(Debug, Clone, clap::Args)]
pub struct SessionConfig {
    /// Base URL of the auth API.
    #[arg(long, default_value = "http://127.0.0.1:8000", env = "AUTHSESSION_API_URL")]
    pub api_url: String,

    /// Directory holding the persisted token pair.
    #[arg(long, env = "AUTHSESSION_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Keep tokens in memory only; nothing survives the process.
    #[arg(long, env = "AUTHSESSION_MEMORY_ONLY")]
    pub memory_only: bool,

    /// Per-request timeout in milliseconds.
    #[arg(long, default_value_t = 10000, env = "AUTHSESSION_REQUEST_TIMEOUT_MS")]
    pub request_timeout_ms: u64,

    /// Upper bound on a token refresh in milliseconds.
    #[arg(long, default_value_t = 10000, env = "AUTHSESSION_REFRESH_TIMEOUT_MS")]
    pub refresh_timeout_ms: u64,

    /// Treat access tokens as expired this many seconds early.
    #[arg(long, default_value_t = 0, env = "AUTHSESSION_EXPIRY_LEEWAY_SECS")]
    pub expiry_leeway_secs: u64,

    /// Log format (json or text).
    #[arg(long, default_value = "text", env = "AUTHSESSION_LOG_FORMAT")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "AUTHSESSION_LOG_LEVEL")]
    pub log_level: String,
}

impl SessionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.api_url.starts_with("http://") || self.api_url.starts_with("https://")) {
            anyhow::bail!("--api-url must be an http(s) URL: {}", self.api_url);
        }
        if self.request_timeout_ms == 0 {
            anyhow::bail!("--request-timeout-ms must be greater than zero");
        }
        if self.refresh_timeout_ms == 0 {
            anyhow::bail!("--refresh-timeout-ms must be greater than zero");
        }
        match self.log_format.as_str() {
            "json" | "text" => Ok(()),
            other => anyhow::bail!("invalid log format: {other} (expected json or text)"),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms)
    }

    pub fn timings(&self) -> SessionTimings {
        SessionTimings {
            request_timeout: self.request_timeout(),
            refresh_timeout: self.refresh_timeout(),
            expiry_leeway_secs: self.expiry_leeway_secs,
        }
    }

    /// The configured state directory, or the platform default.
    pub fn resolved_state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(default_state_dir)
    }

    /// Storage backend selected by this configuration.
    pub fn storage(&self) -> Arc<dyn Storage> {
        if self.memory_only {
            Arc::new(MemoryStorage::new())
        } else {
            Arc::new(FileStorage::new(self.resolved_state_dir().join(TOKENS_FILE)))
        }
    }
}

/// Default directory for persisted session state.
///
/// `$XDG_STATE_HOME/authsession`, then `$HOME/.local/state/authsession`,
/// then `.authsession` in the working directory.
pub fn default_state_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
        return PathBuf::from(xdg).join("authsession");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local/state/authsession");
    }
    PathBuf::from(".authsession")
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
