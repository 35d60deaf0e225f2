// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Authsession: client-side session manager for a token-based auth API.
//!
//! Holds an access/refresh token pair, keeps a reactive view of the signed-in
//! user, and recovers from expired access tokens with a single shared refresh.

pub mod api;
pub mod command;
pub mod config;
pub mod error;
pub mod refresh;
pub mod retry;
pub mod session;
pub mod state;
pub mod store;
pub mod token;

use std::sync::Once;

use tracing::debug;

pub use crate::error::SessionError;
pub use crate::session::{AuthSession, SessionTimings};
pub use crate::state::{Phase, SessionSnapshot, UserRecord};
pub use crate::store::{FileStorage, MemoryStorage, Storage, TokenPair};

use crate::command::Cli;

static CRYPTO_PROVIDER: Once = Once::new();

/// Install the ring crypto provider for rustls. Safe to call repeatedly.
pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Run one CLI invocation: restore the session, execute the command, print its
/// JSON result.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.config;
    config.validate()?;

    let session = AuthSession::from_config(&config, config.storage())?;
    session.init().await;
    debug!(phase = %session.snapshot().phase, "session ready");

    let result = command::execute(&session, cli.command).await;
    session.close();

    let out = result?;
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
