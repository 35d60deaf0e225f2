// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bearer token inspection.
//!
//! Reads the `exp` claim from a JWT payload without verifying the signature.
//! Anything that does not yield a numeric `exp` is treated as expired.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::Value;

/// Return the `exp` claim of a JWT, in seconds since the Unix epoch.
pub fn expires_at(token: &str) -> Option<u64> {
    let mut parts = token.split('.');
    let (_header, payload) = (parts.next()?, parts.next()?);
    // A JWS compact token has exactly three segments.
    parts.next()?;
    if parts.next().is_some() {
        return None;
    }

    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.get("exp")?;
    match exp {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite() && *f >= 0.0).map(|f| f as u64)),
        _ => None,
    }
}

/// Whether `token` is expired at `now` (epoch seconds). Fails closed.
pub fn is_expired(token: &str, now: u64) -> bool {
    match expires_at(token) {
        Some(exp) => now >= exp,
        None => true,
    }
}

/// Seconds until `token` expires, or `None` if it is already expired or unreadable.
pub fn remaining_secs(token: &str, now: u64) -> Option<u64> {
    expires_at(token).and_then(|exp| exp.checked_sub(now)).filter(|s| *s > 0)
}

/// Current time in seconds since the Unix epoch.
pub fn epoch_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(test)]
#[path = "token_tests.rs"]
mod tests;
