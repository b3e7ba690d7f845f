//! Durable cross-session state.
//!
//! The host supplies a string key-value store. The engine serializes and
//! parses its own values; a missing or unparsable value falls back to the
//! initial state for that field and never fails the caller.

use crate::config::PersistenceConfig;
use crate::error::StoreError;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

/// Host key-value storage.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Apply several writes; `None` removes the key. Stores that can commit
    /// atomically should override this.
    fn set_batch(&self, entries: &[(String, Option<String>)]) -> Result<(), StoreError> {
        for (key, value) in entries {
            match value {
                Some(v) => self.set(key, v)?,
                None => self.remove(key)?,
            }
        }
        Ok(())
    }
}

/// Volatile in-process store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|v| v.value().clone())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Store backed by a single JSON object file.
///
/// Every write replaces the file through a temporary sibling and a rename,
/// so a crash leaves either the old or the new contents on disk.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Open the store. A missing file starts empty; a corrupt file is
    /// logged and replaced on the next write.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match Self::read(&path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Discarding unreadable state file");
                BTreeMap::new()
            }
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    fn read(path: &Path) -> Result<BTreeMap<String, String>, StoreError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn commit(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("tmp");
        let content = serde_json::to_vec_pretty(entries)?;
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.set_batch(&[(key.to_string(), Some(value.to_string()))])
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.set_batch(&[(key.to_string(), None)])
    }

    fn set_batch(&self, batch: &[(String, Option<String>)]) -> Result<(), StoreError> {
        let mut entries = self.entries();
        let mut next = entries.clone();
        for (key, value) in batch {
            match value {
                Some(v) => next.insert(key.clone(), v.clone()),
                None => next.remove(key),
            };
        }
        self.commit(&next)?;
        *entries = next;
        Ok(())
    }
}

/// Durable fields of the session state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableState {
    pub verified: bool,
    pub last_score: u8,
    pub block_count: u32,
    /// Epoch milliseconds
    pub blocked_until: Option<u64>,
}

impl DurableState {
    fn canonical(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.verified,
            self.last_score,
            self.block_count,
            self.blocked_until.map(|t| t.to_string()).unwrap_or_default()
        )
    }
}

/// Maps [`DurableState`] onto a [`KeyValueStore`].
pub struct SessionStore {
    store: Arc<dyn KeyValueStore>,
    prefix: String,
    seal_key: Option<Vec<u8>>,
}

impl SessionStore {
    pub fn new(store: Arc<dyn KeyValueStore>, config: &PersistenceConfig) -> Self {
        Self {
            store,
            prefix: config.key_prefix.clone(),
            seal_key: config.seal_secret.as_ref().map(|s| s.as_bytes().to_vec()),
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}.{}", self.prefix, name)
    }

    /// Load durable state. Never fails: missing or corrupt fields take
    /// their initial value, and a broken seal resets everything.
    pub fn load(&self) -> DurableState {
        let mut any_present = false;

        let mut field = |name: &str| {
            let value = self.store.get(&self.key(name));
            any_present |= value.is_some();
            value
        };
        let verified_raw = field("verified");
        let score_raw = field("last_score");
        let count_raw = field("block_count");
        let until_raw = field("blocked_until");

        let state = DurableState {
            verified: parse_field("verified", verified_raw, |v| v.parse::<bool>().ok()),
            last_score: parse_field("last_score", score_raw, |v| {
                v.parse::<u8>().ok().filter(|s| *s <= 100)
            }),
            block_count: parse_field("block_count", count_raw, |v| v.parse::<u32>().ok()),
            blocked_until: parse_field("blocked_until", until_raw, |v| {
                v.parse::<u64>().ok().map(Some)
            }),
        };

        if any_present && !self.seal_matches(&state) {
            warn!("Durable state seal mismatch, resetting to initial state");
            return DurableState::default();
        }

        debug!(
            verified = state.verified,
            last_score = state.last_score,
            block_count = state.block_count,
            blocked_until = ?state.blocked_until,
            "Durable state loaded"
        );
        state
    }

    /// Write every durable field in one batch. Failures are logged.
    pub fn save(&self, state: &DurableState) {
        let mut batch = vec![
            (self.key("verified"), Some(state.verified.to_string())),
            (self.key("last_score"), Some(state.last_score.to_string())),
            (self.key("block_count"), Some(state.block_count.to_string())),
            (
                self.key("blocked_until"),
                state.blocked_until.map(|t| t.to_string()),
            ),
        ];
        if let Some(seal) = self.seal(state) {
            batch.push((self.key("seal"), Some(seal)));
        }

        if let Err(e) = self.store.set_batch(&batch) {
            warn!(error = %e, "Failed to persist durable state");
        }
    }

    fn seal(&self, state: &DurableState) -> Option<String> {
        let key = self.seal_key.as_ref()?;
        let mut mac = HmacSha256::new_from_slice(key).ok()?;
        mac.update(state.canonical().as_bytes());
        Some(hex::encode(mac.finalize().into_bytes()))
    }

    fn seal_matches(&self, state: &DurableState) -> bool {
        let Some(key) = self.seal_key.as_ref() else {
            return true;
        };
        let Some(stored) = self.store.get(&self.key("seal")) else {
            return false;
        };
        let Ok(tag) = hex::decode(stored.trim()) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
            return false;
        };
        mac.update(state.canonical().as_bytes());
        mac.verify_slice(&tag).is_ok()
    }
}

fn parse_field<T: Default>(
    name: &str,
    raw: Option<String>,
    parse: impl FnOnce(&str) -> Option<T>,
) -> T {
    let Some(raw) = raw else {
        return T::default();
    };
    match parse(raw.trim()) {
        Some(value) => value,
        None => {
            warn!(field = name, value = %raw, "Corrupt durable value, using default");
            T::default()
        }
    }
}
