// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session state machine and its reactive snapshot.
//!
//! ```text
//! Unauthenticated ──► Authenticating ──► Authenticated ◄──► Refreshing
//!        ▲                  │                  │                 │
//!        └──────────────────┴──────────────────┴─────────────────┘
//!                      logout / unrecoverable error
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::debug;

/// Authentication phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Refreshing,
}

impl Phase {
    /// Transient phases always resolve to `Authenticated` or `Unauthenticated`.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Authenticating | Self::Refreshing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Authenticating => "authenticating",
            Self::Authenticated => "authenticated",
            Self::Refreshing => "refreshing",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The user record returned by the profile endpoint.
///
/// Unknown fields are kept so profile updates round-trip them.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UserRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// What every consumer of the session observes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub phase: Phase,
    pub current_user: Option<UserRecord>,
    /// True until the startup check has settled.
    pub is_loading: bool,
    pub error: Option<String>,
}

impl SessionSnapshot {
    /// Snapshot of a freshly constructed session, before startup has run.
    pub fn initial() -> Self {
        Self { phase: Phase::Unauthenticated, current_user: None, is_loading: true, error: None }
    }

    fn signed_out() -> Self {
        Self { phase: Phase::Unauthenticated, current_user: None, is_loading: false, error: None }
    }

    pub fn is_authenticated(&self) -> bool {
        self.current_user.is_some()
    }
}

/// Owns the authoritative snapshot and publishes every transition.
pub struct SessionState {
    tx: watch::Sender<SessionSnapshot>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SessionSnapshot::initial());
        Self { tx }
    }

    /// Subscribe to snapshot changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.tx.subscribe()
    }

    /// A copy of the current snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.tx.borrow().clone()
    }

    pub fn phase(&self) -> Phase {
        self.tx.borrow().phase
    }

    /// Startup check begins.
    pub fn begin_init(&self) {
        self.transition(|s| {
            s.phase = Phase::Authenticating;
            s.is_loading = true;
        });
    }

    /// Startup check found no usable session.
    pub fn finish_init_unauthenticated(&self) {
        self.transition(|s| *s = SessionSnapshot::signed_out());
    }

    /// A login attempt begins. Returns the phase to restore if it fails.
    ///
    /// An already-authenticated session keeps its phase so a failed attempt
    /// leaves it untouched.
    pub fn begin_login(&self) -> Phase {
        let prev = self.phase();
        if prev == Phase::Unauthenticated {
            self.transition(|s| s.phase = Phase::Authenticating);
        }
        prev
    }

    /// A login attempt failed: restore `prev` and record `message`.
    pub fn fail_login(&self, prev: Phase, message: String) {
        self.transition(|s| {
            if s.phase == Phase::Authenticating && !s.is_loading {
                s.phase = prev;
            }
            s.error = Some(message);
        });
    }

    /// The session is authenticated as `user`, clearing any previous error.
    pub fn authenticated(&self, user: UserRecord) {
        self.transition(|s| {
            s.phase = Phase::Authenticated;
            s.current_user = Some(user);
            s.is_loading = false;
            s.error = None;
        });
    }

    /// A refresh begins. Only an authenticated session shows `Refreshing`.
    pub fn begin_refresh(&self) {
        self.transition(|s| {
            if s.phase == Phase::Authenticated {
                s.phase = Phase::Refreshing;
            }
        });
    }

    /// A refresh finished without signing the session out.
    pub fn end_refresh(&self) {
        self.transition(|s| {
            if s.phase == Phase::Refreshing {
                s.phase = Phase::Authenticated;
            }
        });
    }

    /// The refresh token was rejected. Signs out, keeping `message` visible
    /// unless the startup check is still running.
    pub fn expire(&self, message: Option<String>) {
        self.transition(|s| {
            let during_init = s.is_loading;
            *s = SessionSnapshot::signed_out();
            s.is_loading = during_init;
            if !during_init {
                s.error = message;
            }
        });
    }

    /// Explicit logout.
    pub fn sign_out(&self) {
        self.transition(|s| *s = SessionSnapshot::signed_out());
    }

    /// Replace the current user after a profile update.
    pub fn replace_user(&self, user: UserRecord) {
        self.transition(|s| {
            if s.current_user.is_some() {
                s.current_user = Some(user);
            }
            s.error = None;
        });
    }

    pub fn set_error(&self, message: String) {
        self.transition(|s| s.error = Some(message));
    }

    pub fn clear_error(&self) {
        self.tx.send_if_modified(|s| s.error.take().is_some());
    }

    fn transition(&self, f: impl FnOnce(&mut SessionSnapshot)) {
        self.tx.send_if_modified(|s| {
            let before = s.clone();
            f(s);
            if *s == before {
                return false;
            }
            if s.phase != before.phase {
                debug!(from = %before.phase, to = %s.phase, "session transition");
            }
            true
        });
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
