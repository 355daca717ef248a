//! Cache facades over the broker client
//!
//! The messaging pipeline talks to the substrate through the
//! [`ExchangeCache`] capability: a payload store plus lightweight-envelope
//! queues. [`MessageCache`] is the broker-backed implementation;
//! [`MemoryExchangeCache`] keeps everything in process for tests and local
//! development. [`SystemCache`] is the broader key/value/set/hash/JSON
//! facade whose operations fail fast while its connection is down.

mod memory;
mod message;
mod system;

pub use memory::MemoryExchangeCache;
pub use message::MessageCache;
pub use system::SystemCache;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ExchangeResult;

/// Transport capability consumed by message senders and receivers.
#[async_trait]
pub trait ExchangeCache: Send + Sync {
    /// Store a payload under a generated key with the configured TTL and
    /// return the key.
    async fn store_message_payload(&self, payload: &Value) -> ExchangeResult<String>;

    /// Load a stored payload and delete its entry.
    async fn retrieve_message_payload(&self, store_key: &str) -> ExchangeResult<Value>;

    /// Push a lightweight envelope onto the head of the named queue.
    async fn send_message(&self, envelope: &Value, queue_name: &str) -> ExchangeResult<()>;

    /// Blocking pop from the tail of the named queue.
    ///
    /// Returns `None` when the wait slice elapses without a message, so
    /// callers can observe shutdown between slices.
    async fn receive_message(&self, queue_name: &str) -> ExchangeResult<Option<String>>;
}
