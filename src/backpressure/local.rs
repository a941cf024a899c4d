use super::{inbox_key, BackpressureQueue, FanoutReport, QueueLimits, QueueOutcome};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::broadcast;

const DELIVERY_CHANNEL_CAPACITY: usize = 1024;

/// A payload published to an inbox.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub key: String,
    pub payload: String,
}

#[derive(Default)]
struct LocalState {
    pending: HashMap<String, u64>,
    /// Front is the most recent push (`LPUSH` order).
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, BTreeSet<String>>,
}

impl LocalState {
    fn deliver(
        &mut self,
        limits: QueueLimits,
        key: &str,
        payload: &str,
        deliveries: &broadcast::Sender<Delivery>,
    ) -> QueueOutcome {
        let pending = self.pending.entry(key.to_string()).or_insert(0);
        if *pending < limits.max_pending {
            // No receivers is fine: nobody is listening on that inbox yet
            let _ = deliveries.send(Delivery {
                key: key.to_string(),
                payload: payload.to_string(),
            });
            *pending += 1;
            return QueueOutcome::Published;
        }

        let list = self.lists.entry(key.to_string()).or_default();
        if (list.len() as u64) < limits.max_queue_len {
            list.push_front(payload.to_string());
            QueueOutcome::Buffered
        } else {
            QueueOutcome::Dropped
        }
    }
}

/// In-process backpressure queue.
///
/// Same semantics as [`RedisQueue`](super::RedisQueue); every operation runs
/// entirely under one mutex, so the check and the action are never split.
/// Published payloads are broadcast to [`LocalQueue::deliveries`] receivers.
pub struct LocalQueue {
    limits: QueueLimits,
    state: Mutex<LocalState>,
    deliveries: broadcast::Sender<Delivery>,
}

impl LocalQueue {
    pub fn new(limits: QueueLimits) -> Self {
        let (deliveries, _) = broadcast::channel(DELIVERY_CHANNEL_CAPACITY);
        Self {
            limits,
            state: Mutex::new(LocalState::default()),
            deliveries,
        }
    }

    /// Subscribe to published payloads for every inbox.
    pub fn deliveries(&self) -> broadcast::Receiver<Delivery> {
        self.deliveries.subscribe()
    }

    pub fn add_subscriber(&self, subscribers_key: &str, inbox_id: &str) {
        self.state
            .lock()
            .unwrap()
            .sets
            .entry(subscribers_key.to_string())
            .or_default()
            .insert(inbox_id.to_string());
    }

    pub fn remove_subscriber(&self, subscribers_key: &str, inbox_id: &str) {
        if let Some(set) = self.state.lock().unwrap().sets.get_mut(subscribers_key) {
            set.remove(inbox_id);
        }
    }

    /// Current credit in use on `key`.
    pub fn pending(&self, key: &str) -> u64 {
        self.state.lock().unwrap().pending.get(key).copied().unwrap_or(0)
    }

    /// Overflow list for `key`, most recent first (`LRANGE 0 -1`).
    pub fn buffered(&self, key: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for LocalQueue {
    fn default() -> Self {
        Self::new(QueueLimits::default())
    }
}

#[async_trait]
impl BackpressureQueue for LocalQueue {
    async fn queue(&self, key: &str, payload: &str) -> Result<QueueOutcome> {
        let mut state = self.state.lock().unwrap();
        Ok(state.deliver(self.limits, key, payload, &self.deliveries))
    }

    async fn queue_all(&self, subscribers_key: &str, payload: &str) -> Result<FanoutReport> {
        let mut state = self.state.lock().unwrap();
        let members: Vec<String> = state
            .sets
            .get(subscribers_key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        let mut report = FanoutReport::default();
        for inbox in members {
            let outcome = state.deliver(self.limits, &inbox_key(&inbox), payload, &self.deliveries);
            report.record(outcome);
        }
        Ok(report)
    }

    async fn ack(&self, key: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let pending = state.pending.entry(key.to_string()).or_insert(0);
        *pending = pending.saturating_sub(1);

        let oldest = state.lists.get_mut(key).and_then(VecDeque::pop_back);
        match oldest {
            Some(payload) => {
                let _ = self.deliveries.send(Delivery {
                    key: key.to_string(),
                    payload,
                });
                *state.pending.entry(key.to_string()).or_insert(0) += 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
