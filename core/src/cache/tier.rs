//! Backing stores for the cache layer.
//!
//! A tier is a dumb key/value map of `StoredEntry`; validity is decided by
//! `CacheLayer`, never by the tier.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::StoreError;

/// One cached value with the metadata needed to judge its validity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEntry {
    pub data: Value,
    pub written_at: DateTime<Utc>,
    pub ttl_ms: u64,
}

impl StoredEntry {
    /// An entry is valid iff `now - written_at < ttl`.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        is_valid(now, self.written_at, self.ttl_ms)
    }
}

pub fn is_valid(now: DateTime<Utc>, written_at: DateTime<Utc>, ttl_ms: u64) -> bool {
    let age_ms = (now - written_at).num_milliseconds();
    age_ms < ttl_ms.min(i64::MAX as u64) as i64
}

pub trait CacheTier: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<StoredEntry>, StoreError>;
    fn put(&self, key: &str, entry: StoredEntry) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
    fn clear(&self) -> Result<(), StoreError>;
}

/// Process-lifetime tier.
#[derive(Debug, Default)]
pub struct VolatileTier {
    entries: Mutex<HashMap<String, StoredEntry>>,
}

impl VolatileTier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheTier for VolatileTier {
    fn get(&self, key: &str) -> Result<Option<StoredEntry>, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, entry: StoredEntry) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), entry);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clear();
        Ok(())
    }
}

/// Tier that survives restarts: one JSON file per key, named by the SHA-256
/// of the key. Writes land in a temp file and are renamed into place, so a
/// reader never observes a half-written entry.
#[derive(Debug)]
pub struct DurableTier {
    dir: PathBuf,
}

impl DurableTier {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.dir.join(format!("{}.json", hex::encode(digest)))
    }
}

impl CacheTier for DurableTier {
    fn get(&self, key: &str) -> Result<Option<StoredEntry>, StoreError> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == IoErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn put(&self, key: &str, entry: StoredEntry) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(&entry)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(key)) {
            Err(err) if err.kind() != IoErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }

    fn clear(&self) -> Result<(), StoreError> {
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(data: Value) -> StoredEntry {
        StoredEntry {
            data,
            written_at: Utc::now(),
            ttl_ms: 1_000,
        }
    }

    #[test]
    fn validity_boundary_is_exclusive() {
        let written = Utc::now();
        let ttl = 5_000;
        assert!(is_valid(written + chrono::Duration::milliseconds(4_999), written, ttl));
        assert!(!is_valid(written + chrono::Duration::milliseconds(5_000), written, ttl));
    }

    #[test]
    fn volatile_put_replaces() {
        let tier = VolatileTier::new();
        tier.put("k", entry(json!({"a": 1}))).unwrap();
        tier.put("k", entry(json!({"b": 2}))).unwrap();
        assert_eq!(tier.get("k").unwrap().unwrap().data, json!({"b": 2}));
        assert_eq!(tier.len(), 1);
    }

    #[test]
    fn durable_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let tier = DurableTier::open(dir.path()).unwrap();
            tier.put("GET /list", entry(json!([1, 2, 3]))).unwrap();
        }
        let reopened = DurableTier::open(dir.path()).unwrap();
        assert_eq!(reopened.get("GET /list").unwrap().unwrap().data, json!([1, 2, 3]));
    }

    #[test]
    fn durable_remove_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let tier = DurableTier::open(dir.path()).unwrap();
        tier.put("a", entry(json!(1))).unwrap();
        tier.put("b", entry(json!(2))).unwrap();

        tier.remove("a").unwrap();
        tier.remove("a").unwrap();
        assert!(tier.get("a").unwrap().is_none());

        tier.clear().unwrap();
        assert!(tier.get("b").unwrap().is_none());
    }

    #[test]
    fn durable_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let tier = DurableTier::open(dir.path()).unwrap();
        fs::write(tier.path_for("k"), b"{not json").unwrap();
        assert!(matches!(tier.get("k"), Err(StoreError::Serde(_))));
    }
}
