// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `authsession` subcommands.

use clap::{Parser, Subcommand};
use reqwest::Method;
use serde_json::{json, Map, Value};

use crate::api::{PasswordChange, Registration};
use crate::config::SessionConfig;
use crate::session::AuthSession;

#[derive(Debug, Parser)]
#[command(name = "authsession", version, about = "Client-side session for a token-based auth API")]
pub struct Cli {
    #[command(flatten)]
    pub config: SessionConfig,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Sign in and persist the token pair
    Login {
        #[arg(long, env = "AUTHSESSION_EMAIL")]
        email: String,
        #[arg(long, env = "AUTHSESSION_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Forget the stored token pair
    Logout,
    /// Show the current session snapshot
    Whoami,
    /// Create an account (does not sign in)
    Register {
        #[arg(long)]
        email: String,
        #[arg(long, env = "AUTHSESSION_PASSWORD", hide_env_values = true)]
        password: String,
        /// Extra registration fields as key=value (repeatable)
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, Value)>,
    },
    /// Update profile fields
    UpdateProfile {
        /// Field to set as key=value (repeatable)
        #[arg(long = "set", value_parser = parse_key_value, required = true)]
        set: Vec<(String, Value)>,
    },
    /// Change the account password
    ChangePassword {
        #[arg(long, env = "AUTHSESSION_CURRENT_PASSWORD", hide_env_values = true)]
        current_password: String,
        #[arg(long, env = "AUTHSESSION_NEW_PASSWORD", hide_env_values = true)]
        new_password: String,
    },
    /// Authenticated GET against any API path
    Get { path: String },
}

/// Parse `key=value`. Values that parse as JSON are kept typed, anything else
/// is a string.
pub fn parse_key_value(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw.split_once('=').ok_or_else(|| format!("expected key=value, got {raw:?}"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in {raw:?}"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_owned()));
    Ok((key.to_owned(), value))
}

fn into_map(pairs: Vec<(String, Value)>) -> Map<String, Value> {
    pairs.into_iter().collect()
}

/// Run one subcommand against an initialized session and return its JSON output.
pub async fn execute(session: &AuthSession, command: Command) -> anyhow::Result<Value> {
    let out = match command {
        Command::Login { email, password } => {
            let user = session.login(&email, &password).await?;
            serde_json::to_value(user)?
        }
        Command::Logout => {
            session.logout();
            json!({ "status": "logged_out" })
        }
        Command::Whoami => serde_json::to_value(session.snapshot())?,
        Command::Register { email, password, fields } => {
            let registration = Registration { email, password, extra: into_map(fields) };
            let user = session.register(&registration).await?;
            serde_json::to_value(user)?
        }
        Command::UpdateProfile { set } => {
            let user = session.update_profile(&Value::Object(into_map(set))).await?;
            serde_json::to_value(user)?
        }
        Command::ChangePassword { current_password, new_password } => {
            session.change_password(&PasswordChange { current_password, new_password }).await?;
            json!({ "status": "password_changed" })
        }
        Command::Get { path } => session.request(Method::GET, &path, None).await?,
    };
    Ok(out)
}

#[cfg(test)]
#[path = "command_tests.rs"]
mod tests;
