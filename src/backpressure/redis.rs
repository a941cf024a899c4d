use super::{inbox_key, pending_key, BackpressureQueue, FanoutReport, QueueLimits, QueueOutcome};
use anyhow::{Context, Result};
use async_trait::async_trait;
use deadpool_redis::redis::{AsyncCommands, Script};
use deadpool_redis::{Config, Pool, Runtime};
use serde::Deserialize;
use tracing::{debug, info};

// KEYS[1] = inbox list, KEYS[2] = credit counter
// ARGV[1] = payload, ARGV[2] = max pending, ARGV[3] = max queue length
// Returns 1 published, 2 buffered, 0 dropped.
const QUEUE_SCRIPT: &str = r#"
local pending = tonumber(redis.call('GET', KEYS[2]) or '0')
if pending < tonumber(ARGV[2]) then
    redis.call('PUBLISH', KEYS[1], ARGV[1])
    redis.call('INCR', KEYS[2])
    return 1
end
if redis.call('LLEN', KEYS[1]) < tonumber(ARGV[3]) then
    redis.call('LPUSH', KEYS[1], ARGV[1])
    return 2
end
return 0
"#;

// KEYS[1] = subscriber set
// ARGV as in QUEUE_SCRIPT. Returns {published, buffered, dropped}.
const QUEUE_ALL_SCRIPT: &str = r#"
local counts = {0, 0, 0}
local members = redis.call('SMEMBERS', KEYS[1])
for _, inbox in ipairs(members) do
    local key = 'inbox.' .. inbox
    local pendingKey = key .. '.pending'
    local pending = tonumber(redis.call('GET', pendingKey) or '0')
    if pending < tonumber(ARGV[2]) then
        redis.call('PUBLISH', key, ARGV[1])
        redis.call('INCR', pendingKey)
        counts[1] = counts[1] + 1
    elseif redis.call('LLEN', key) < tonumber(ARGV[3]) then
        redis.call('LPUSH', key, ARGV[1])
        counts[2] = counts[2] + 1
    else
        counts[3] = counts[3] + 1
    end
end
return counts
"#;

// KEYS[1] = inbox list, KEYS[2] = credit counter
// Returns 1 when a buffered payload was released, 0 otherwise.
const ACK_SCRIPT: &str = r#"
local pending = tonumber(redis.call('GET', KEYS[2]) or '0')
if pending > 0 then
    redis.call('DECR', KEYS[2])
end
local oldest = redis.call('RPOP', KEYS[1])
if oldest then
    redis.call('PUBLISH', KEYS[1], oldest)
    redis.call('INCR', KEYS[2])
    return 1
end
return 0
"#;

/// Redis configuration
#[derive(Clone, Debug, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
        }
    }
}

/// Backpressure queue executed by Redis Lua scripts.
///
/// Payloads are delivered with `PUBLISH <inbox key>`; subscribers listen on
/// their inbox channel and acknowledge through [`BackpressureQueue::ack`].
pub struct RedisQueue {
    pool: Pool,
    limits: QueueLimits,
    queue_script: Script,
    queue_all_script: Script,
    ack_script: Script,
}

impl RedisQueue {
    pub fn new(config: &RedisConfig, limits: QueueLimits) -> Result<Self> {
        let pool = Config::from_url(&config.url)
            .create_pool(Some(Runtime::Tokio1))
            .context("Failed to create Redis pool")?;

        info!(
            url = %config.url,
            max_pending = limits.max_pending,
            max_queue_len = limits.max_queue_len,
            "Redis backpressure queue ready"
        );

        Ok(Self {
            pool,
            limits,
            queue_script: Script::new(QUEUE_SCRIPT),
            queue_all_script: Script::new(QUEUE_ALL_SCRIPT),
            ack_script: Script::new(ACK_SCRIPT),
        })
    }

    /// Adds an inbox to a stream's subscriber set.
    pub async fn add_subscriber(&self, subscribers_key: &str, inbox_id: &str) -> Result<()> {
        let mut conn = self.pool.get().await.context("Failed to get Redis connection")?;
        conn.sadd::<_, _, ()>(subscribers_key, inbox_id)
            .await
            .context("Failed to add subscriber")?;
        Ok(())
    }

    pub async fn remove_subscriber(&self, subscribers_key: &str, inbox_id: &str) -> Result<()> {
        let mut conn = self.pool.get().await.context("Failed to get Redis connection")?;
        conn.srem::<_, _, ()>(subscribers_key, inbox_id)
            .await
            .context("Failed to remove subscriber")?;
        Ok(())
    }
}

#[async_trait]
impl BackpressureQueue for RedisQueue {
    async fn queue(&self, key: &str, payload: &str) -> Result<QueueOutcome> {
        let mut conn = self.pool.get().await.context("Failed to get Redis connection")?;
        let code: i64 = self
            .queue_script
            .key(key)
            .key(pending_key(key))
            .arg(payload)
            .arg(self.limits.max_pending)
            .arg(self.limits.max_queue_len)
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("Queue script failed for '{}'", key))?;
        Ok(QueueOutcome::from_code(code))
    }

    async fn queue_all(&self, subscribers_key: &str, payload: &str) -> Result<FanoutReport> {
        let mut conn = self.pool.get().await.context("Failed to get Redis connection")?;
        let counts: Vec<u64> = self
            .queue_all_script
            .key(subscribers_key)
            .arg(payload)
            .arg(self.limits.max_pending)
            .arg(self.limits.max_queue_len)
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("Fan-out script failed for '{}'", subscribers_key))?;

        let report = FanoutReport {
            published: counts.first().copied().unwrap_or(0),
            buffered: counts.get(1).copied().unwrap_or(0),
            dropped: counts.get(2).copied().unwrap_or(0),
        };
        debug!(
            subscribers_key = %subscribers_key,
            published = report.published,
            buffered = report.buffered,
            dropped = report.dropped,
            "Fan-out complete"
        );
        Ok(report)
    }

    async fn ack(&self, key: &str) -> Result<bool> {
        let mut conn = self.pool.get().await.context("Failed to get Redis connection")?;
        let released: i64 = self
            .ack_script
            .key(key)
            .key(pending_key(key))
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("Ack script failed for '{}'", key))?;
        Ok(released == 1)
    }
}
