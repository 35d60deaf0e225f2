// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Token persistence.
//!
//! [`TokenStore`] keeps the token pair in memory and mirrors it to a
//! [`Storage`] backend on a best-effort basis. A storage failure never reaches
//! the caller; the in-memory copy stays authoritative until the process exits.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Storage key for the access token.
pub const ACCESS_TOKEN_KEY: &str = "access_token";
/// Storage key for the refresh token.
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";

/// A bearer credential pair issued by the auth server.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl std::fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// Minimal key-value contract for persisted session data.
///
/// `set` and `remove` take a batch so a token pair is written or removed as
/// a unit.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    fn set(&self, entries: &[(&str, &str)]) -> anyhow::Result<()>;
    fn remove(&self, keys: &[&str]) -> anyhow::Result<()>;
}

/// Process-local storage. Contents are lost on exit.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, entries: &[(&str, &str)]) -> anyhow::Result<()> {
        let mut map = self.entries.lock();
        for (k, v) in entries {
            map.insert((*k).to_owned(), (*v).to_owned());
        }
        Ok(())
    }

    fn remove(&self, keys: &[&str]) -> anyhow::Result<()> {
        let mut map = self.entries.lock();
        for k in keys {
            map.remove(*k);
        }
        Ok(())
    }
}

/// JSON-file storage with atomic writes (write tmp + rename).
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), lock: Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> anyhow::Result<BTreeMap<String, String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_map(&self, map: &BTreeMap<String, String>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(map)?;
        let tmp = self.path.with_extension(format!("{}.tmp", std::process::id()));
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), entries = map.len(), "storage written");
        Ok(())
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let _guard = self.lock.lock();
        Ok(self.read_map()?.remove(key))
    }

    fn set(&self, entries: &[(&str, &str)]) -> anyhow::Result<()> {
        let _guard = self.lock.lock();
        let mut map = self.read_map()?;
        for (k, v) in entries {
            map.insert((*k).to_owned(), (*v).to_owned());
        }
        self.write_map(&map)
    }

    fn remove(&self, keys: &[&str]) -> anyhow::Result<()> {
        let _guard = self.lock.lock();
        let mut map = self.read_map()?;
        let before = map.len();
        for k in keys {
            map.remove(*k);
        }
        if map.len() == before {
            return Ok(());
        }
        self.write_map(&map)
    }
}

/// Holds the current token pair and mirrors it to storage.
#[derive(Clone)]
pub struct TokenStore {
    inner: Arc<TokenStoreInner>,
}

struct TokenStoreInner {
    storage: Arc<dyn Storage>,
    current: Mutex<Option<TokenPair>>,
}

impl TokenStore {
    /// Create a store over `storage`, loading any persisted pair.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        let current = read_pair(storage.as_ref());
        Self { inner: Arc::new(TokenStoreInner { storage, current: Mutex::new(current) }) }
    }

    /// The current pair, if any.
    pub fn load(&self) -> Option<TokenPair> {
        self.inner.current.lock().clone()
    }

    /// The current access token, if any.
    pub fn access_token(&self) -> Option<String> {
        self.inner.current.lock().as_ref().map(|p| p.access_token.clone())
    }

    /// The current refresh token, if any.
    pub fn refresh_token(&self) -> Option<String> {
        self.inner.current.lock().as_ref().map(|p| p.refresh_token.clone())
    }

    /// Replace the stored pair.
    pub fn save(&self, pair: TokenPair) {
        let mut current = self.inner.current.lock();
        let entries =
            [(ACCESS_TOKEN_KEY, pair.access_token.as_str()), (REFRESH_TOKEN_KEY, pair.refresh_token.as_str())];
        if let Err(e) = self.inner.storage.set(&entries) {
            warn!(err = %e, "failed to persist tokens, keeping them in memory only");
        }
        *current = Some(pair);
    }

    /// Install a refreshed access token (and a rotated refresh token, if the
    /// server issued one).
    ///
    /// Only applies while the held pair still carries `used_refresh`, so a
    /// refresh that lands after a logout or a new login is discarded.
    pub fn replace_access_token(
        &self,
        used_refresh: &str,
        access_token: String,
        rotated_refresh: Option<String>,
    ) -> bool {
        let mut current = self.inner.current.lock();
        let Some(pair) = current.as_mut().filter(|p| p.refresh_token == used_refresh) else {
            return false;
        };
        pair.access_token = access_token;
        if let Some(refresh_token) = rotated_refresh {
            pair.refresh_token = refresh_token;
        }
        let entries =
            [(ACCESS_TOKEN_KEY, pair.access_token.as_str()), (REFRESH_TOKEN_KEY, pair.refresh_token.as_str())];
        if let Err(e) = self.inner.storage.set(&entries) {
            warn!(err = %e, "failed to persist refreshed tokens");
        }
        true
    }

    /// Clear the pair only while it still carries `used_refresh`.
    ///
    /// Returns whether anything was cleared. A rejection that lands after a
    /// logout or a new login leaves the current pair alone.
    pub fn clear_if(&self, used_refresh: &str) -> bool {
        let mut current = self.inner.current.lock();
        if !current.as_ref().is_some_and(|p| p.refresh_token == used_refresh) {
            return false;
        }
        *current = None;
        if let Err(e) = self.inner.storage.remove(&[ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY]) {
            warn!(err = %e, "failed to clear persisted tokens");
        }
        true
    }

    /// Remove both tokens from memory and storage.
    pub fn clear(&self) {
        let mut current = self.inner.current.lock();
        *current = None;
        if let Err(e) = self.inner.storage.remove(&[ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY]) {
            warn!(err = %e, "failed to clear persisted tokens");
        }
    }
}

/// Read a pair from storage. A half-present pair is cleared and treated as absent.
fn read_pair(storage: &dyn Storage) -> Option<TokenPair> {
    let read = |key: &str| match storage.get(key) {
        Ok(v) => v.filter(|s| !s.is_empty()),
        Err(e) => {
            warn!(key, err = %e, "failed to read persisted token");
            None
        }
    };
    match (read(ACCESS_TOKEN_KEY), read(REFRESH_TOKEN_KEY)) {
        (Some(access_token), Some(refresh_token)) => Some(TokenPair { access_token, refresh_token }),
        (None, None) => None,
        _ => {
            warn!("found a partial token pair in storage, discarding it");
            if let Err(e) = storage.remove(&[ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY]) {
                warn!(err = %e, "failed to clear partial token pair");
            }
            None
        }
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
