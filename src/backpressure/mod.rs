//! Credit-based fan-out with bounded overflow buffering.
//!
//! Every inbox key has a credit counter (`<key>.pending`) and an overflow
//! list (`<key>`). Delivering a payload is a single atomic step:
//!
//! ```text
//! pending < max_pending      → publish(key, payload); pending += 1
//! llen(key) < max_queue_len  → lpush(key, payload)
//! otherwise                  → drop
//! ```
//!
//! Credit is only given back by [`BackpressureQueue::ack`], which also
//! releases the oldest buffered payload when there is one.
//!
//! The check and the action must never be split across round trips;
//! [`RedisQueue`] runs them as Lua scripts and [`LocalQueue`] under one lock.

mod local;
mod redis;


pub use self::redis::{RedisConfig, RedisQueue};
pub use local::{Delivery, LocalQueue};

use crate::config::FanoutConfig;
use anyhow::Result;
use async_trait::async_trait;

/// What happened to a single payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
    Published,
    Buffered,
    Dropped,
}

impl QueueOutcome {
    pub(crate) fn from_code(code: i64) -> Self {
        match code {
            1 => QueueOutcome::Published,
            2 => QueueOutcome::Buffered,
            _ => QueueOutcome::Dropped,
        }
    }
}

/// Per-outcome counts of a `queue_all` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub published: u64,
    pub buffered: u64,
    pub dropped: u64,
}

impl FanoutReport {
    pub fn record(&mut self, outcome: QueueOutcome) {
        match outcome {
            QueueOutcome::Published => self.published += 1,
            QueueOutcome::Buffered => self.buffered += 1,
            QueueOutcome::Dropped => self.dropped += 1,
        }
    }

    pub fn subscribers(&self) -> u64 {
        self.published + self.buffered + self.dropped
    }
}

/// Limits enforced by the queue scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    pub max_pending: u64,
    pub max_queue_len: u64,
}

impl Default for QueueLimits {
    fn default() -> Self {
        FanoutConfig::default().into()
    }
}

impl From<FanoutConfig> for QueueLimits {
    fn from(config: FanoutConfig) -> Self {
        Self {
            max_pending: config.max_pending,
            max_queue_len: config.max_queue_len,
        }
    }
}

#[async_trait]
pub trait BackpressureQueue: Send + Sync {
    /// Deliver `payload` to a single inbox key.
    async fn queue(&self, key: &str, payload: &str) -> Result<QueueOutcome>;

    /// Deliver `payload` to every inbox in the set at `subscribers_key`.
    async fn queue_all(&self, subscribers_key: &str, payload: &str) -> Result<FanoutReport>;

    /// Acknowledge one delivery on `key`. Returns true when a buffered payload
    /// was released in its place.
    async fn ack(&self, key: &str) -> Result<bool>;
}

/// Inbox key for a subscriber id.
pub fn inbox_key(inbox_id: &str) -> String {
    format!("inbox.{}", inbox_id)
}

/// Credit counter key for an inbox key.
pub fn pending_key(key: &str) -> String {
    format!("{}.pending", key)
}

/// Subscriber set key for a stream within a scope.
pub fn subscribers_key(stream_id: &str, scope_id: &str) -> String {
    format!("subscribers.{}.{}", scope_id, stream_id)
}
