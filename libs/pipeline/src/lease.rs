use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use tickstore_api::{LeaseError, LeaseStore, now_ms};

/// Право быть единственным активным drainer'ом.
///
/// Lease с TTL в общем `LeaseStore`: держатель продлевает его каждый
/// цикл, истёкший lease может забрать другой процесс. При drop lease
/// отпускается в фоне.
pub struct LeaderLease {
    store: Arc<dyn LeaseStore>,
    holder: String,
    ttl: Duration,
    /// Локальная оценка срока: до этого момента lease точно наш.
    held_until: AtomicI64,
}

impl LeaderLease {
    pub fn new(store: Arc<dyn LeaseStore>, holder: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            holder: holder.into(),
            ttl,
            held_until: AtomicI64::new(0),
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Взять или продлить lease. `false` — его держит кто-то другой.
    pub async fn acquire(&self) -> Result<bool, LeaseError> {
        let started = now_ms();
        let won = self.store.try_acquire(&self.holder, self.ttl).await?;
        let until = if won { started + self.ttl.as_millis() as i64 } else { 0 };
        self.held_until.store(until, Ordering::Release);
        Ok(won)
    }

    pub async fn renew(&self) -> Result<bool, LeaseError> {
        self.acquire().await
    }

    pub fn is_held(&self) -> bool {
        now_ms() < self.held_until.load(Ordering::Acquire)
    }

    pub async fn release(&self) -> Result<(), LeaseError> {
        self.held_until.store(0, Ordering::Release);
        self.store.release(&self.holder).await
    }
}

impl Drop for LeaderLease {
    fn drop(&mut self) {
        if self.held_until.load(Ordering::Acquire) == 0 {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = self.store.clone();
        let holder = std::mem::take(&mut self.holder);
        runtime.spawn(async move {
            if let Err(e) = store.release(&holder).await {
                tracing::warn!(%holder, error = %e, "lease release on drop failed");
            }
        });
    }
}
