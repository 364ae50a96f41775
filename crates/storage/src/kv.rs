//! Key-value store contract.
//!
//! Every mutation the system relies on for correctness is expressed as an
//! atomic trait method (`incr`, `set_nx`, `compare_and_delete`) so a
//! scripted Redis backend can implement the same semantics. Keys carry
//! TTLs; an expired key behaves exactly like a missing key.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use ed_domain::error::Result;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a value, optionally with a TTL. `None` = no expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Returns true when the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Atomically increment an integer key (creating it at 1), applying
    /// the TTL on creation. Returns the post-increment value.
    async fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<i64>;

    /// Atomically decrement an integer key, deleting it when it reaches
    /// zero or below. Returns the post-decrement value (floored at 0).
    async fn decr(&self, key: &str) -> Result<i64>;

    /// Set only if the key is absent. The lock-acquire primitive.
    /// Returns true when this caller now owns the key.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Delete only if the current value equals `expected`. The
    /// holder-checked lock-release primitive. Returns true on deletion.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;

    /// Refresh the TTL of an existing key. Returns false if absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-memory backend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Process-local `KvStore` with lazy TTL expiry.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a live entry, reaping it if expired. Callers hold the lock.
    fn live<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
        let now = Instant::now();
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }
}

#[async_trait::async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock();
        Ok(Self::live(&mut entries, key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.insert(
            key.to_owned(),
            Entry {
                value: value.to_owned(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        let existed = Self::live(&mut entries, key).is_some();
        entries.remove(key);
        Ok(existed)
    }

    async fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<i64> {
        let mut entries = self.entries.lock();
        match Self::live(&mut entries, key) {
            Some(entry) => {
                let n = entry.value.parse::<i64>().unwrap_or(0) + 1;
                entry.value = n.to_string();
                Ok(n)
            }
            None => {
                entries.insert(
                    key.to_owned(),
                    Entry {
                        value: "1".into(),
                        expires_at: ttl.map(|t| Instant::now() + t),
                    },
                );
                Ok(1)
            }
        }
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        let mut entries = self.entries.lock();
        match Self::live(&mut entries, key) {
            Some(entry) => {
                let n = entry.value.parse::<i64>().unwrap_or(0) - 1;
                if n <= 0 {
                    entries.remove(key);
                    Ok(0)
                } else {
                    entry.value = n.to_string();
                    Ok(n)
                }
            }
            None => Ok(0),
        }
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock();
        if Self::live(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_owned(),
            Entry {
                value: value.to_owned(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        let held = Self::live(&mut entries, key).is_some_and(|e| e.value == expected);
        if held {
            entries.remove(key);
        }
        Ok(held)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock();
        match Self::live(&mut entries, key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
