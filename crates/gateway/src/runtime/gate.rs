//! Per-user concurrency gate.
//!
//! An atomic counter in the key-value store bounds concurrent runs per
//! user. The counter carries a TTL so crashed callers cannot hold slots
//! forever, and an over-limit INCR is rolled back in the same call. Any
//! store failure denies the slot (the gate fails closed).

use std::sync::Arc;
use std::time::Duration;

use ed_domain::error::Result;
use ed_storage::KvStore;

fn counter_key(user_id: &str) -> String {
    format!("user:concurrency:{user_id}")
}

pub struct ConcurrencyGate {
    kv: Arc<dyn KvStore>,
    max_concurrent: u32,
    ttl: Duration,
}

impl ConcurrencyGate {
    pub fn new(kv: Arc<dyn KvStore>, max_concurrent: u32, ttl: Duration) -> Self {
        Self {
            kv,
            max_concurrent,
            ttl,
        }
    }

    /// Try to take a slot. `false` means the user is at the limit.
    ///
    /// Store errors deny the slot rather than letting an unbounded number
    /// of runs through.
    pub async fn acquire(&self, user_id: &str) -> bool {
        let key = counter_key(user_id);
        match self.kv.incr(&key, Some(self.ttl)).await {
            Ok(n) if n <= self.max_concurrent as i64 => true,
            Ok(_) => {
                // Overshot: roll the increment back.
                if let Err(e) = self.kv.decr(&key).await {
                    tracing::warn!(error = %e, user_id, "gate rollback failed, TTL will correct it");
                }
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, user_id, "gate store unavailable, failing closed");
                false
            }
        }
    }

    /// Release a slot. The key is deleted when the count reaches zero.
    pub async fn release(&self, user_id: &str) {
        if let Err(e) = self.kv.decr(&counter_key(user_id)).await {
            tracing::warn!(error = %e, user_id, "gate release failed, TTL will correct it");
        }
    }

    /// Current slot count (diagnostics).
    pub async fn in_use(&self, user_id: &str) -> Result<i64> {
        Ok(self
            .kv
            .get(&counter_key(user_id))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }
}
