use async_trait::async_trait;
use deadpool_redis::{Connection, Pool};
use rand::Rng;
use redis::Script;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::keys::LockKey;
use crate::models::LockTiming;
use crate::SlotQueueError;

/// Hash-per-lock with holder -> hold count. Nil on success, remaining
/// lease in ms otherwise.
const ACQUIRE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  redis.call('HINCRBY', KEYS[1], ARGV[2], 1)
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  return nil
end
if redis.call('HEXISTS', KEYS[1], ARGV[2]) == 1 then
  redis.call('HINCRBY', KEYS[1], ARGV[2], 1)
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  return nil
end
return redis.call('PTTL', KEYS[1])
"#;

/// 0 absent, 1 released, 2 still held by the same holder, 3 forced.
const RELEASE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 0 then
  redis.call('DEL', KEYS[1])
  return 3
end
local count = redis.call('HINCRBY', KEYS[1], ARGV[1], -1)
if count > 0 then
  return 2
end
redis.call('DEL', KEYS[1])
return 1
"#;

const MIN_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Nothing was held under the key.
    Absent,
    Released,
    /// Reentrant hold count is still above zero.
    StillHeld,
    /// Held by someone else and removed anyway.
    Forced,
}

/// Leased, reentrant mutual exclusion keyed by name.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Waits up to `wait` for the lock. Never errors: backend failures are
    /// logged and reported as `false`.
    async fn try_acquire(&self, key: &str, holder: &str, wait: Duration, lease: Duration) -> bool;

    async fn release(&self, key: &str, holder: &str) -> Result<ReleaseOutcome, SlotQueueError>;
}

/// Sleep before the next attempt, bounded by the remaining lease of the
/// current holder and by the caller's deadline.
pub(crate) fn next_backoff(attempt: u32, pttl: Option<i64>, deadline: Instant) -> Duration {
    let exp = MIN_BACKOFF.saturating_mul(1u32 << attempt.min(5));
    let jitter = rand::thread_rng().gen_range(0..=MIN_BACKOFF.as_millis() as u64);
    let mut sleep = exp.min(MAX_BACKOFF) + Duration::from_millis(jitter);
    if let Some(ms) = pttl.filter(|ms| *ms > 0) {
        sleep = sleep.min(Duration::from_millis(ms as u64));
    }
    sleep.min(deadline.saturating_duration_since(Instant::now()))
}

pub struct RedisLockManager {
    pool: Pool,
    acquire: Script,
    release: Script,
}

impl RedisLockManager {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            acquire: Script::new(ACQUIRE_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
        }
    }

    async fn get_connection(&self) -> Result<Connection, SlotQueueError> {
        self.pool.get().await.map_err(|e| {
            SlotQueueError::Cache(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "Failed to get Redis connection",
                format!("Pool error: {}", e),
            )))
        })
    }

    async fn attempt(&self, key: &str, holder: &str, lease: Duration) -> Result<Option<i64>, SlotQueueError> {
        let mut conn = self.get_connection().await?;
        let pttl: Option<i64> = self
            .acquire
            .key(key)
            .arg(lease.as_millis() as u64)
            .arg(holder)
            .invoke_async(&mut conn)
            .await?;
        Ok(pttl)
    }
}

#[async_trait]
impl LockManager for RedisLockManager {
    async fn try_acquire(&self, key: &str, holder: &str, wait: Duration, lease: Duration) -> bool {
        let deadline = Instant::now() + wait;
        let mut attempt = 0;

        loop {
            match self.attempt(key, holder, lease).await {
                Ok(None) => {
                    debug!("Lock {} acquired by {}", key, holder);
                    return true;
                }
                Ok(Some(pttl)) => {
                    if Instant::now() >= deadline {
                        debug!("Lock {} still held after {:?}", key, wait);
                        return false;
                    }
                    tokio::time::sleep(next_backoff(attempt, Some(pttl), deadline)).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!("Failed to acquire lock {}: {}", key, e);
                    return false;
                }
            }
        }
    }

    async fn release(&self, key: &str, holder: &str) -> Result<ReleaseOutcome, SlotQueueError> {
        let mut conn = self.get_connection().await?;
        let code: i64 = self.release.key(key).arg(holder).invoke_async(&mut conn).await?;
        let outcome = match code {
            0 => ReleaseOutcome::Absent,
            1 => ReleaseOutcome::Released,
            2 => ReleaseOutcome::StillHeld,
            _ => ReleaseOutcome::Forced,
        };
        if outcome == ReleaseOutcome::Forced {
            warn!("Lock {} was not held by {}, force released", key, holder);
        }
        Ok(outcome)
    }
}

/// Typed front for a [`LockManager`] handing out guards.
#[derive(Clone)]
pub struct DistributedLocks {
    manager: Arc<dyn LockManager>,
}

impl DistributedLocks {
    pub fn new(manager: Arc<dyn LockManager>) -> Self {
        Self { manager }
    }

    /// Fails with `SystemBusy` when the lock is not obtained in time.
    pub async fn acquire(
        &self,
        key: LockKey,
        holder: &str,
        timing: LockTiming,
    ) -> Result<LockGuard, SlotQueueError> {
        let name = key.to_string();
        let started = Instant::now();
        if !self.manager.try_acquire(&name, holder, timing.wait, timing.lease).await {
            warn!("Lock {} not acquired within {:?}", name, timing.wait);
            return Err(SlotQueueError::busy(name));
        }
        Ok(LockGuard {
            key: name,
            holder: holder.to_string(),
            lease_deadline: started + timing.lease,
            manager: self.manager.clone(),
            released: false,
        })
    }

    /// Takes `keys` in the given order. On failure releases what it got.
    pub async fn acquire_all(
        &self,
        keys: &[LockKey],
        holder: &str,
        timing: LockTiming,
    ) -> Result<LockSet, SlotQueueError> {
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            match self.acquire(*key, holder, timing).await {
                Ok(guard) => guards.push(guard),
                Err(e) => {
                    LockSet(guards).release().await;
                    return Err(e);
                }
            }
        }
        Ok(LockSet(guards))
    }
}

/// A held lock. Call [`release`](Self::release); dropping it schedules a
/// release in the background.
pub struct LockGuard {
    key: String,
    holder: String,
    lease_deadline: Instant,
    manager: Arc<dyn LockManager>,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("holder", &self.holder)
            .field("lease_deadline", &self.lease_deadline)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.lease_deadline
    }

    pub async fn release(mut self) {
        self.released = true;
        // Past the lease the key may already belong to someone else.
        if self.is_expired() {
            warn!("Lease on {} expired before release, skipping", self.key);
            return;
        }
        match self.manager.release(&self.key, &self.holder).await {
            Ok(outcome) => debug!("Lock {} released: {:?}", self.key, outcome),
            Err(e) => warn!("Failed to release lock {}: {}", self.key, e),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released || self.is_expired() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let manager = self.manager.clone();
        let key = std::mem::take(&mut self.key);
        let holder = std::mem::take(&mut self.holder);
        handle.spawn(async move {
            if let Err(e) = manager.release(&key, &holder).await {
                warn!("Failed to release dropped lock {}: {}", key, e);
            }
        });
    }
}

/// Several guards released in reverse acquisition order.
#[derive(Debug)]
pub struct LockSet(Vec<LockGuard>);

impl LockSet {
    pub async fn release(self) {
        for guard in self.0.into_iter().rev() {
            guard.release().await;
        }
    }
}
