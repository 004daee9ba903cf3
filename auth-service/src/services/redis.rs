//! Redis-backed short-lived state: opaque tokens with a TTL and the atomic
//! failure counters behind lockout and rate limiting.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::{aio::ConnectionManager, Client, Script};

use super::clock::Clock;
use super::error::{StoreError, StoreResult};

/// Key/value entries that disappear after their TTL.
#[async_trait]
pub trait EphemeralStore: Send + Sync {
    /// Insert or overwrite.
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Insert only if the key is absent. Returns whether the value was stored.
    async fn put_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// `None` for both missing and expired keys.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Atomically read and delete.
    async fn take(&self, key: &str) -> StoreResult<Option<String>>;

    /// Idempotent.
    async fn delete(&self, key: &str) -> StoreResult<()>;
}

/// Counter state for one lockout key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockoutState {
    pub failed_count: u32,
    pub locked_until: Option<DateTime<Utc>>,
}

impl LockoutState {
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.map(|until| until > now).unwrap_or(false)
    }

    /// Whole seconds until the lock clears, rounded up.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Option<u64> {
        self.locked_until
            .filter(|until| *until > now)
            .map(|until| {
                let ms = (until - now).num_milliseconds().max(0) as u64;
                ms.div_ceil(1000)
            })
    }
}

/// How long a counter that has not reached its threshold is kept.
pub const COUNTER_IDLE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Extra lifetime kept after a lock so a stale lock still clears itself.
pub const LOCK_GRACE_TTL: Duration = Duration::from_secs(30 * 60);

#[async_trait]
pub trait AttemptCounter: Send + Sync {
    /// Atomically increment the counter and lock it once `threshold` is reached.
    async fn increment(
        &self,
        key: &str,
        threshold: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<LockoutState>;

    async fn get(&self, key: &str) -> StoreResult<LockoutState>;

    async fn clear(&self, key: &str) -> StoreResult<()>;
}

const INCREMENT_SCRIPT: &str = r"
local n = redis.call('HINCRBY', KEYS[1], 'failed_count', 1)
if n >= tonumber(ARGV[1]) then
  redis.call('HSET', KEYS[1], 'locked_until', ARGV[2])
  redis.call('EXPIRE', KEYS[1], ARGV[3])
else
  redis.call('EXPIRE', KEYS[1], ARGV[4])
end
local locked = redis.call('HGET', KEYS[1], 'locked_until')
if not locked then
  locked = ''
end
return {n, locked}
";

#[derive(Clone)]
pub struct RedisService {
    manager: ConnectionManager,
    prefix: String,
    increment_script: Script,
}

impl RedisService {
    pub async fn new(url: &str, prefix: &str) -> Result<Self, anyhow::Error> {
        tracing::info!("Connecting to Redis");
        let client = Client::open(url)?;

        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to get Redis connection manager");
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self::from_manager(manager, prefix))
    }

    pub fn from_manager(manager: ConnectionManager, prefix: &str) -> Self {
        Self {
            manager,
            prefix: prefix.to_string(),
            increment_script: Script::new(INCREMENT_SCRIPT),
        }
    }

    /// Connection handle for collaborators that issue their own commands.
    pub fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub async fn health_check(&self) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| anyhow::anyhow!("Redis health check failed: {}", e))
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl EphemeralStore for RedisService {
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        let stored: Option<String> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(stored.is_some())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn take(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = redis::cmd("GETDEL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(self.key(key))
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AttemptCounter for RedisService {
    async fn increment(
        &self,
        key: &str,
        threshold: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<LockoutState> {
        let mut conn = self.manager.clone();
        let locked_until = now + chrono::Duration::from_std(window).map_err(|e| {
            StoreError::Backend(anyhow::anyhow!("lockout window out of range: {}", e))
        })?;

        let (count, locked): (i64, String) = self
            .increment_script
            .key(self.key(key))
            .arg(threshold.max(1))
            .arg(locked_until.timestamp())
            .arg((window + LOCK_GRACE_TTL).as_secs())
            .arg(COUNTER_IDLE_TTL.as_secs())
            .invoke_async(&mut conn)
            .await?;

        Ok(LockoutState {
            failed_count: u32::try_from(count).unwrap_or(u32::MAX),
            locked_until: parse_unix(&locked),
        })
    }

    async fn get(&self, key: &str) -> StoreResult<LockoutState> {
        let mut conn = self.manager.clone();
        let (count, locked): (Option<i64>, Option<String>) = redis::cmd("HMGET")
            .arg(self.key(key))
            .arg("failed_count")
            .arg("locked_until")
            .query_async(&mut conn)
            .await?;

        Ok(LockoutState {
            failed_count: count.and_then(|c| u32::try_from(c).ok()).unwrap_or(0),
            locked_until: locked.as_deref().and_then(parse_unix),
        })
    }

    async fn clear(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(self.key(key))
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }
}

fn parse_unix(value: &str) -> Option<DateTime<Utc>> {
    value
        .parse::<i64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

/// In-process ephemeral store. Expiry is checked against the injected clock.
pub struct MemoryEphemeralStore {
    entries: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
    clock: Clock,
}

impl MemoryEphemeralStore {
    pub fn new(clock: Clock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn deadline(&self, ttl: Duration) -> DateTime<Utc> {
        (self.clock)() + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500))
    }

    fn lock(
        &self,
    ) -> StoreResult<std::sync::MutexGuard<'_, HashMap<String, (String, DateTime<Utc>)>>> {
        self.entries
            .lock()
            .map_err(|e| StoreError::Backend(anyhow::anyhow!("Ephemeral store mutex poisoned: {}", e)))
    }

    /// Drop the entry if it has expired, returning the live value otherwise.
    fn live(
        entries: &mut HashMap<String, (String, DateTime<Utc>)>,
        key: &str,
        now: DateTime<Utc>,
    ) -> Option<String> {
        match entries.get(key) {
            Some((_, expires_at)) if *expires_at <= now => {
                entries.remove(key);
                None
            }
            Some((value, _)) => Some(value.clone()),
            None => None,
        }
    }
}

#[async_trait]
impl EphemeralStore for MemoryEphemeralStore {
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let deadline = self.deadline(ttl);
        self.lock()?
            .insert(key.to_string(), (value.to_string(), deadline));
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let now = (self.clock)();
        let deadline = self.deadline(ttl);
        let mut entries = self.lock()?;
        if Self::live(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(key.to_string(), (value.to_string(), deadline));
        Ok(true)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = (self.clock)();
        let mut entries = self.lock()?;
        Ok(Self::live(&mut entries, key, now))
    }

    async fn take(&self, key: &str) -> StoreResult<Option<String>> {
        let now = (self.clock)();
        let mut entries = self.lock()?;
        let value = Self::live(&mut entries, key, now);
        entries.remove(key);
        Ok(value)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.lock()?.remove(key);
        Ok(())
    }
}

/// In-process attempt counter mirroring the Lua script.
pub struct MemoryAttemptCounter {
    entries: Mutex<HashMap<String, (LockoutState, DateTime<Utc>)>>,
    clock: Clock,
}

impl MemoryAttemptCounter {
    pub fn new(clock: Clock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn lock(
        &self,
    ) -> StoreResult<std::sync::MutexGuard<'_, HashMap<String, (LockoutState, DateTime<Utc>)>>>
    {
        self.entries
            .lock()
            .map_err(|e| StoreError::Backend(anyhow::anyhow!("Attempt counter mutex poisoned: {}", e)))
    }
}

#[async_trait]
impl AttemptCounter for MemoryAttemptCounter {
    async fn increment(
        &self,
        key: &str,
        threshold: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<LockoutState> {
        let clock_now = (self.clock)();
        let window = chrono::Duration::from_std(window)
            .map_err(|e| StoreError::Backend(anyhow::anyhow!("lockout window out of range: {}", e)))?;
        let grace = chrono::Duration::from_std(LOCK_GRACE_TTL).unwrap_or(chrono::Duration::zero());
        let idle = chrono::Duration::from_std(COUNTER_IDLE_TTL).unwrap_or(chrono::Duration::zero());

        let mut entries = self.lock()?;
        let mut state = match entries.get(key) {
            Some((state, expires_at)) if *expires_at > clock_now => *state,
            _ => LockoutState::default(),
        };

        state.failed_count = state.failed_count.saturating_add(1);
        let expires_at = if state.failed_count >= threshold.max(1) {
            state.locked_until = Some(now + window);
            clock_now + window + grace
        } else {
            clock_now + idle
        };

        entries.insert(key.to_string(), (state, expires_at));
        Ok(state)
    }

    async fn get(&self, key: &str) -> StoreResult<LockoutState> {
        let now = (self.clock)();
        let entries = self.lock()?;
        Ok(match entries.get(key) {
            Some((state, expires_at)) if *expires_at > now => *state,
            _ => LockoutState::default(),
        })
    }

    async fn clear(&self, key: &str) -> StoreResult<()> {
        self.lock()?.remove(key);
        Ok(())
    }
}
