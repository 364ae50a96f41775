//! Distributed locks over the key-value store.
//!
//! `lock:<key>` holds the holder id with a TTL; release is a
//! holder-checked compare-and-delete so a crashed holder's lock simply
//! expires instead of being stolen back.

use std::sync::Arc;
use std::time::Duration;

use ed_domain::error::Result;
use ed_storage::KvStore;

pub struct LockGuard {
    kv: Arc<dyn KvStore>,
    key: String,
    holder: String,
}

impl LockGuard {
    /// Try to take the lock. `None` means another holder owns it.
    pub async fn acquire(
        kv: Arc<dyn KvStore>,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<LockGuard>> {
        let key = format!("lock:{name}");
        if kv.set_nx(&key, holder, ttl).await? {
            return Ok(Some(LockGuard {
                kv,
                key,
                holder: holder.to_string(),
            }));
        }
        Ok(None)
    }

    /// Release the lock if we still hold it.
    pub async fn release(self) {
        match self.kv.compare_and_delete(&self.key, &self.holder).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(key = %self.key, "lock expired before release");
            }
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "lock release failed, TTL will reap it");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed_storage::MemoryKv;

    #[tokio::test]
    async fn exclusive_until_released() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let guard = LockGuard::acquire(kv.clone(), "build:s1", "h1", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        assert!(
            LockGuard::acquire(kv.clone(), "build:s1", "h2", Duration::from_secs(30))
                .await
                .unwrap()
                .is_none()
        );

        guard.release().await;
        assert!(
            LockGuard::acquire(kv.clone(), "build:s1", "h2", Duration::from_secs(30))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn ttl_reaps_abandoned_locks() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let _abandoned =
            LockGuard::acquire(kv.clone(), "resolve:w1", "h1", Duration::from_millis(10))
                .await
                .unwrap()
                .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(
            LockGuard::acquire(kv.clone(), "resolve:w1", "h2", Duration::from_secs(30))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn release_is_holder_checked() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let guard = LockGuard::acquire(kv.clone(), "w:1", "h1", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        // Someone else re-acquired after expiry; our release must not
        // delete their lock.
        let theirs = LockGuard::acquire(kv.clone(), "w:1", "h2", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        guard.release().await;
        assert_eq!(kv.get("lock:w:1").await.unwrap().as_deref(), Some("h2"));
        theirs.release().await;
    }
}
