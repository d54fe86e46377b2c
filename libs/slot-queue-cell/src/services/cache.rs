use async_trait::async_trait;
use deadpool_redis::{Config, Connection, Pool, Runtime};
use redis::{AsyncCommands, Script};
use std::time::Duration;
use tracing::{debug, info};

use crate::SlotQueueError;
use shared_config::AppConfig;

/// Replaces a list in one step. ARGV[1] is the TTL in ms, ARGV[2] the length
/// of the expected list or -1 for an unconditional write, followed by the
/// expected items and then the new items.
const LIST_SWAP_SCRIPT: &str = r#"
local key = KEYS[1]
local ttl = tonumber(ARGV[1])
local expected = tonumber(ARGV[2])
local first = 3
if expected >= 0 then
  local current = redis.call('LRANGE', key, 0, -1)
  if #current ~= expected then
    return 0
  end
  for i = 1, expected do
    if current[i] ~= ARGV[first + i - 1] then
      return 0
    end
  end
  first = first + expected
end
redis.call('DEL', key)
if #ARGV >= first then
  for i = first, #ARGV do
    redis.call('RPUSH', key, ARGV[i])
  end
  if ttl > 0 then
    redis.call('PEXPIRE', key, ttl)
  end
end
return 1
"#;

/// Returns nil when the key is absent, otherwise {value, applied}.
const DECR_FLOOR_SCRIPT: &str = r#"
local value = redis.call('GET', KEYS[1])
if not value then
  return nil
end
if tonumber(value) <= 0 then
  return {0, 0}
end
return {redis.call('DECR', KEYS[1]), 1}
"#;

/// Sets KEYS[1] to ARGV[1] unless it already holds a larger number; refreshes
/// the TTL (ARGV[2], ms) either way and returns the resulting value.
const SET_MAX_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '')
local target = tonumber(ARGV[1])
if current == nil or current < target then
  redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
  return target
end
redis.call('PEXPIRE', KEYS[1], ARGV[2])
return current
"#;

/// Key/value and list primitives the core needs from its cache.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, SlotQueueError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), SlotQueueError>;

    /// Writes only when the key is absent. Returns whether it wrote.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, SlotQueueError>;

    /// Raises a counter to `value`, never lowering it. Returns the value the
    /// key holds afterwards.
    async fn set_max(&self, key: &str, value: i64, ttl: Duration) -> Result<i64, SlotQueueError>;

    async fn delete(&self, keys: &[String]) -> Result<(), SlotQueueError>;

    /// Atomic add; an absent key counts as zero.
    async fn incr(&self, key: &str, delta: i64) -> Result<i64, SlotQueueError>;

    /// Atomic decrement that never goes below zero. `None` when the key is
    /// absent, otherwise the resulting value and whether it changed.
    async fn decr_floor_zero(&self, key: &str) -> Result<Option<(i64, bool)>, SlotQueueError>;

    /// Whole list, `None` when the key does not exist.
    async fn list_range(&self, key: &str) -> Result<Option<Vec<String>>, SlotQueueError>;

    /// Replaces the list with `items` if its current content equals
    /// `expected`; `None` replaces unconditionally. An empty `items`
    /// removes the key.
    async fn list_swap(
        &self,
        key: &str,
        expected: Option<&[String]>,
        items: &[String],
        ttl: Duration,
    ) -> Result<bool, SlotQueueError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, SlotQueueError>;
}

pub struct RedisCache {
    pool: Pool,
    list_swap: Script,
    decr_floor: Script,
    set_max: Script,
}

impl RedisCache {
    pub async fn new(config: &AppConfig) -> Result<Self, SlotQueueError> {
        let cfg = Config::from_url(config.redis_url_or_default());
        let pool = cfg.create_pool(Some(Runtime::Tokio1)).map_err(|e| {
            SlotQueueError::Cache(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "Failed to create Redis pool",
                format!("Pool creation error: {}", e),
            )))
        })?;

        let cache = Self::from_pool(pool);

        // Test connection
        let mut conn = cache.get_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!("Redis cache initialized successfully");

        Ok(cache)
    }

    pub fn from_pool(pool: Pool) -> Self {
        Self {
            pool,
            list_swap: Script::new(LIST_SWAP_SCRIPT),
            decr_floor: Script::new(DECR_FLOOR_SCRIPT),
            set_max: Script::new(SET_MAX_SCRIPT),
        }
    }

    pub fn pool(&self) -> Pool {
        self.pool.clone()
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
}

fn ttl_millis(ttl: Duration) -> u64 {
    ttl.as_millis().max(1) as u64
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, SlotQueueError> {
        let mut conn = self.get_connection().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), SlotQueueError> {
        let mut conn = self.get_connection().await?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, SlotQueueError> {
        let mut conn = self.get_connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn set_max(&self, key: &str, value: i64, ttl: Duration) -> Result<i64, SlotQueueError> {
        let mut conn = self.get_connection().await?;
        let current: i64 = self
            .set_max
            .key(key)
            .arg(value)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(current)
    }

    async fn delete(&self, keys: &[String]) -> Result<(), SlotQueueError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.get_connection().await?;
        let _: () = conn.del(keys).await?;
        Ok(())
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64, SlotQueueError> {
        let mut conn = self.get_connection().await?;
        let value: i64 = conn.incr(key, delta).await?;
        Ok(value)
    }

    async fn decr_floor_zero(&self, key: &str) -> Result<Option<(i64, bool)>, SlotQueueError> {
        let mut conn = self.get_connection().await?;
        let reply: Option<(i64, i64)> = self.decr_floor.key(key).invoke_async(&mut conn).await?;
        Ok(reply.map(|(value, applied)| (value, applied == 1)))
    }

    async fn list_range(&self, key: &str) -> Result<Option<Vec<String>>, SlotQueueError> {
        let mut conn = self.get_connection().await?;
        let (exists, items): (i64, Vec<String>) = redis::pipe()
            .atomic()
            .cmd("EXISTS")
            .arg(key)
            .cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        Ok((exists > 0).then_some(items))
    }

    async fn list_swap(
        &self,
        key: &str,
        expected: Option<&[String]>,
        items: &[String],
        ttl: Duration,
    ) -> Result<bool, SlotQueueError> {
        let mut conn = self.get_connection().await?;

        let mut invocation = self.list_swap.prepare_invoke();
        invocation.key(key).arg(ttl_millis(ttl));
        match expected {
            Some(current) => {
                invocation.arg(current.len() as i64);
                for item in current {
                    invocation.arg(item.as_str());
                }
            }
            None => {
                invocation.arg(-1i64);
            }
        }
        for item in items {
            invocation.arg(item.as_str());
        }

        let swapped: i64 = invocation.invoke_async(&mut conn).await?;
        if swapped == 0 {
            debug!("List {} changed concurrently, swap rejected", key);
        }
        Ok(swapped == 1)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, SlotQueueError> {
        let mut conn = self.get_connection().await?;
        let updated: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }
}
