//! In-process exchange cache.
//!
//! Mirrors the broker-backed cache's observable behavior closely enough to
//! run a whole exchange in one process: FIFO queues with head-push and
//! tail-pop, a payload store with TTL purging on read, and bounded blocking
//! receives.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::cache::ExchangeCache;
use crate::error::{ExchangeError, ExchangeResult};

struct StoredPayload {
    raw: String,
    expires_at: Instant,
}

/// Exchange cache kept entirely in process memory.
pub struct MemoryExchangeCache {
    store: Mutex<HashMap<String, StoredPayload>>,
    queues: Mutex<HashMap<String, VecDeque<String>>>,
    arrivals: Notify,
    store_prefix: String,
    payload_ttl: Duration,
    receive_wait: Duration,
}

impl MemoryExchangeCache {
    /// Create a cache with the given payload store prefix and TTL.
    pub fn new(store_prefix: impl Into<String>, payload_ttl: Duration) -> Self {
        Self {
            store: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            arrivals: Notify::new(),
            store_prefix: store_prefix.into(),
            payload_ttl,
            receive_wait: Duration::from_millis(500),
        }
    }

    /// Override the blocking receive slice. Tests shorten it.
    pub fn with_receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = wait;
        self
    }

    /// Number of messages currently queued under a name.
    pub fn queue_len(&self, queue_name: &str) -> usize {
        self.queues
            .lock()
            .get(queue_name)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Whether a payload store entry exists and has not expired.
    pub fn store_contains(&self, store_key: &str) -> bool {
        let mut store = self.store.lock();
        match store.get(store_key) {
            Some(entry) if entry.expires_at > Instant::now() => true,
            Some(_) => {
                store.remove(store_key);
                false
            }
            None => false,
        }
    }

    /// Replace the raw envelope at the queue's tail, simulating in-transit
    /// corruption.
    pub fn corrupt_tail(&self, queue_name: &str, mutate: impl FnOnce(&mut String)) -> bool {
        let mut queues = self.queues.lock();
        match queues.get_mut(queue_name).and_then(VecDeque::back_mut) {
            Some(raw) => {
                mutate(raw);
                true
            }
            None => false,
        }
    }

    fn try_pop(&self, queue_name: &str) -> Option<String> {
        self.queues.lock().get_mut(queue_name)?.pop_back()
    }
}

#[async_trait]
impl ExchangeCache for MemoryExchangeCache {
    async fn store_message_payload(&self, payload: &Value) -> ExchangeResult<String> {
        let store_key = format!("{}{}", self.store_prefix, Uuid::new_v4());
        let raw = serde_json::to_string(payload)?;
        self.store.lock().insert(
            store_key.clone(),
            StoredPayload {
                raw,
                expires_at: Instant::now() + self.payload_ttl,
            },
        );
        Ok(store_key)
    }

    async fn retrieve_message_payload(&self, store_key: &str) -> ExchangeResult<Value> {
        let entry = self.store.lock().remove(store_key).ok_or_else(|| {
            ExchangeError::general(format!("payload store entry {} is gone", store_key))
        })?;
        if entry.expires_at <= Instant::now() {
            return Err(ExchangeError::general(format!(
                "payload store entry {} expired",
                store_key
            )));
        }
        Ok(serde_json::from_str(&entry.raw)?)
    }

    async fn send_message(&self, envelope: &Value, queue_name: &str) -> ExchangeResult<()> {
        let raw = serde_json::to_string(envelope)?;
        self.queues
            .lock()
            .entry(queue_name.to_string())
            .or_default()
            .push_front(raw);
        self.arrivals.notify_waiters();
        Ok(())
    }

    async fn receive_message(&self, queue_name: &str) -> ExchangeResult<Option<String>> {
        let deadline = Instant::now() + self.receive_wait;
        loop {
            let armed = self.arrivals.notified();
            tokio::pin!(armed);

            if let Some(raw) = self.try_pop(queue_name) {
                return Ok(Some(raw));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::select! {
                _ = &mut armed => {}
                _ = tokio::time::sleep(remaining) => return Ok(None),
            }
        }
    }
}
