//! Broker-backed exchange cache.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::broker::BrokerClient;
use crate::cache::ExchangeCache;
use crate::config::ExchangeSettings;
use crate::error::{ExchangeError, ExchangeResult};

/// Payload store and queue transport on the shared broker.
pub struct MessageCache {
    broker: Arc<BrokerClient>,
    store_prefix: String,
    payload_ttl: Duration,
    receive_wait: Duration,
}

impl MessageCache {
    /// Slice of time one blocking pop occupies the connection before the
    /// loop re-checks for shutdown.
    pub const RECEIVE_WAIT: Duration = Duration::from_secs(2);

    /// Create the cache over an owned broker client.
    pub fn new(broker: Arc<BrokerClient>, settings: &ExchangeSettings) -> Self {
        Self {
            broker,
            store_prefix: settings.message_store.clone(),
            payload_ttl: settings.payload_ttl(),
            receive_wait: Self::RECEIVE_WAIT,
        }
    }

    /// The broker client this cache proxies.
    pub fn broker(&self) -> &Arc<BrokerClient> {
        &self.broker
    }

    /// Open the underlying broker connection.
    pub async fn initialize(&self) -> ExchangeResult<()> {
        self.broker.initialize().await
    }

    /// Tear down the underlying broker connection.
    pub async fn shut_down(&self, timeout: Duration) {
        self.broker.shut_down(timeout).await;
    }
}

#[async_trait]
impl ExchangeCache for MessageCache {
    async fn store_message_payload(&self, payload: &Value) -> ExchangeResult<String> {
        let store_key = format!("{}{}", self.store_prefix, Uuid::new_v4());
        let raw = serde_json::to_string(payload)?;
        self.broker
            .set_value(&store_key, &raw, Some(self.payload_ttl))
            .await?;
        Ok(store_key)
    }

    async fn retrieve_message_payload(&self, store_key: &str) -> ExchangeResult<Value> {
        let raw = self
            .broker
            .get_and_delete(store_key)
            .await?
            .ok_or_else(|| {
                ExchangeError::general(format!("payload store entry {} is gone", store_key))
            })?;
        Ok(serde_json::from_str(&raw)?)
    }

    async fn send_message(&self, envelope: &Value, queue_name: &str) -> ExchangeResult<()> {
        let raw = serde_json::to_string(envelope)?;
        self.broker.push_to_list(queue_name, &raw).await?;
        Ok(())
    }

    async fn receive_message(&self, queue_name: &str) -> ExchangeResult<Option<String>> {
        let reply = self
            .broker
            .blocking_command(
                "BRPOP",
                &[
                    queue_name.to_string(),
                    self.receive_wait.as_secs().max(1).to_string(),
                ],
            )
            .await?;
        let popped: Option<(String, String)> = redis::from_redis_value(&reply)
            .map_err(|e| ExchangeError::general("unexpected BRPOP reply").with_source(e))?;
        Ok(popped.map(|(_, raw)| raw))
    }
}
