//! Outbound queue writer.

use std::sync::Arc;

use tracing::debug;

use crate::broker::ConnectionObserver;
use crate::cache::ExchangeCache;
use crate::error::{ErrorCode, ExchangeError, ExchangeResult};
use crate::exchange::handler::{HandlerState, HashSettings};
use crate::message::ServiceCall;

/// Writes envelopes to destination queues.
///
/// The transport step: store the payload, clone the envelope with the store
/// key in its place, attach the keyed hash when enabled, and push the result
/// to `<queue_prefix><route>`.
pub struct MessageSender {
    state: HandlerState,
    cache: Arc<dyn ExchangeCache>,
    queue_prefix: String,
}

impl MessageSender {
    /// Create a sender over the given transport cache.
    pub fn new(
        cache: Arc<dyn ExchangeCache>,
        connection_identifier: impl Into<String>,
        queue_prefix: impl Into<String>,
        hash: HashSettings,
        initially_available: bool,
    ) -> Self {
        Self {
            state: HandlerState::new(connection_identifier, hash, initially_available),
            cache,
            queue_prefix: queue_prefix.into(),
        }
    }

    /// Shared handler state.
    pub fn state(&self) -> &HandlerState {
        &self.state
    }

    /// Whether the sender can currently write.
    pub fn is_available(&self) -> bool {
        self.state.is_available()
    }

    /// Transport an envelope to the queue named by `route`.
    pub async fn send(&self, call: &ServiceCall, route: &str) -> ExchangeResult<()> {
        if !self.state.is_available() {
            return Err(ExchangeError::new(
                ErrorCode::MessageSenderUnavailable,
                "message sender has no usable connection",
            ));
        }

        let store_key = self
            .cache
            .store_message_payload(&call.message.payload)
            .await?;
        let mut light = call.lightweight(store_key);
        if self.state.hash_enabled() {
            light.message.hash = Some(self.state.create_message_hash(&light)?);
        }

        let wire = light.to_wire()?;
        let queue_name = format!("{}{}", self.queue_prefix, route);
        self.cache.send_message(&wire, &queue_name).await?;
        debug!(
            message_id = %call.message_id(),
            queue = %queue_name,
            "message enqueued"
        );
        Ok(())
    }
}

impl ConnectionObserver for MessageSender {
    fn on_connection_recovered(&self, identifier: &str) {
        self.state.on_connection_event(identifier, true);
    }

    fn on_connection_disrupted(&self, identifier: &str) {
        self.state.on_connection_event(identifier, false);
    }

    fn on_connection_lost(&self, identifier: &str) {
        self.state.on_connection_event(identifier, false);
    }
}
