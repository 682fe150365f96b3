//! Response cache with per-entry TTL over two tiers.
//!
//! # Design
//! - Validity is a pure function of `(now, written_at, ttl)`; see `tier::is_valid`.
//! - Expired entries are deleted lazily on the read that finds them. Nothing
//!   sweeps proactively except an explicit `clear`.
//! - `set` replaces the whole entry in a single assignment; entries never merge.
//! - `VolatileFirst` reads volatile, falls back to durable, and back-fills
//!   volatile on a durable hit with the original `written_at`, so the copy
//!   expires when the durable entry would.
//! - Durable-tier I/O failures are logged and read as misses. A cache problem
//!   never fails a call.

pub mod tier;

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::clock::Clock;
use crate::error::StoreError;

pub use tier::{CacheTier, DurableTier, StoredEntry, VolatileTier};

/// Which tier(s) an operation addresses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TierSelection {
    Volatile,
    Durable,
    /// Read volatile then durable; write and remove on both.
    #[default]
    VolatileFirst,
}

/// A valid entry returned by `CacheLayer::get_entry`.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    pub data: Value,
    pub age: Duration,
    pub ttl: Duration,
}

pub struct CacheLayer {
    volatile: VolatileTier,
    durable: Option<Arc<dyn CacheTier>>,
    clock: Arc<dyn Clock>,
    refresh_ratio: f64,
}

impl std::fmt::Debug for CacheLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLayer")
            .field("volatile_entries", &self.volatile.len())
            .field("durable", &self.durable.is_some())
            .field("refresh_ratio", &self.refresh_ratio)
            .finish()
    }
}

impl CacheLayer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            volatile: VolatileTier::new(),
            durable: None,
            clock,
            refresh_ratio: 0.8,
        }
    }

    pub fn with_durable(mut self, durable: Arc<dyn CacheTier>) -> Self {
        self.durable = Some(durable);
        self
    }

    pub fn with_refresh_ratio(mut self, ratio: f64) -> Self {
        self.refresh_ratio = ratio;
        self
    }

    pub fn set_value(&self, key: &str, data: Value, ttl: Duration, tier: TierSelection) {
        let entry = StoredEntry {
            data,
            written_at: self.clock.now(),
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
        };
        match tier {
            TierSelection::Volatile => self.put_volatile(key, entry),
            TierSelection::Durable => self.put_durable(key, entry),
            TierSelection::VolatileFirst => {
                self.put_durable(key, entry.clone());
                self.put_volatile(key, entry);
            }
        }
    }

    pub fn set<T: Serialize>(
        &self,
        key: &str,
        data: &T,
        ttl: Duration,
        tier: TierSelection,
    ) -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(data)?;
        self.set_value(key, value, ttl, tier);
        Ok(())
    }

    /// Valid entry for `key` with its age, or `None`.
    pub fn get_entry(&self, key: &str, tier: TierSelection) -> Option<CacheHit> {
        let entry = match tier {
            TierSelection::Volatile => self.read_volatile(key),
            TierSelection::Durable => self.read_durable(key),
            TierSelection::VolatileFirst => self.read_volatile(key).or_else(|| {
                let entry = self.read_durable(key)?;
                self.put_volatile(key, entry.clone());
                Some(entry)
            }),
        }?;

        let age = (self.clock.now() - entry.written_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        Some(CacheHit {
            data: entry.data,
            age,
            ttl: Duration::from_millis(entry.ttl_ms),
        })
    }

    pub fn get_value(&self, key: &str, tier: TierSelection) -> Option<Value> {
        self.get_entry(key, tier).map(|hit| hit.data)
    }

    /// Typed read. A value that no longer deserializes is treated as a miss.
    pub fn get<T: DeserializeOwned>(&self, key: &str, tier: TierSelection) -> Option<T> {
        let value = self.get_value(key, tier)?;
        serde_json::from_value(value).ok()
    }

    pub fn remove(&self, key: &str, tier: TierSelection) {
        if matches!(tier, TierSelection::Volatile | TierSelection::VolatileFirst) {
            log_store_error("remove", key, self.volatile.remove(key));
        }
        if matches!(tier, TierSelection::Durable | TierSelection::VolatileFirst) {
            if let Some(durable) = &self.durable {
                log_store_error("remove", key, durable.remove(key));
            }
        }
    }

    pub fn clear(&self, tier: TierSelection) {
        if matches!(tier, TierSelection::Volatile | TierSelection::VolatileFirst) {
            log_store_error("clear", "*", self.volatile.clear());
        }
        if matches!(tier, TierSelection::Durable | TierSelection::VolatileFirst) {
            if let Some(durable) = &self.durable {
                log_store_error("clear", "*", durable.clear());
            }
        }
    }

    /// True once a hit is older than `refresh_ratio` of its TTL.
    pub fn needs_refresh(&self, hit: &CacheHit) -> bool {
        hit.age.as_secs_f64() > hit.ttl.as_secs_f64() * self.refresh_ratio
    }

    pub fn volatile_len(&self) -> usize {
        self.volatile.len()
    }

    fn read_volatile(&self, key: &str) -> Option<StoredEntry> {
        let entry = self.volatile.get(key).ok().flatten()?;
        if entry.is_valid(self.clock.now()) {
            Some(entry)
        } else {
            log_store_error("evict", key, self.volatile.remove(key));
            None
        }
    }

    fn read_durable(&self, key: &str) -> Option<StoredEntry> {
        let durable = self.durable.as_ref()?;
        let entry = match durable.get(key) {
            Ok(entry) => entry?,
            Err(err) => {
                warn!(key, error = %err, "durable cache read failed");
                return None;
            }
        };
        if entry.is_valid(self.clock.now()) {
            Some(entry)
        } else {
            log_store_error("evict", key, durable.remove(key));
            None
        }
    }

    fn put_volatile(&self, key: &str, entry: StoredEntry) {
        log_store_error("write", key, self.volatile.put(key, entry));
    }

    fn put_durable(&self, key: &str, entry: StoredEntry) {
        if let Some(durable) = &self.durable {
            log_store_error("write", key, durable.put(key, entry));
        }
    }
}

fn log_store_error(op: &str, key: &str, result: Result<(), StoreError>) {
    if let Err(err) = result {
        warn!(op, key, error = %err, "cache tier operation failed");
    }
}
