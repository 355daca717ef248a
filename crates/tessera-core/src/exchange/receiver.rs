//! Inbound queue reader.
//!
//! The receive loop is bounded: each iteration runs one blocking pop slice,
//! yields to the scheduler, and re-checks the shutdown signal, so teardown
//! never waits on a stuck dequeue. Individual failures are logged and the
//! loop continues; a tampered envelope is dropped before any observer sees
//! it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::ConnectionObserver;
use crate::cache::ExchangeCache;
use crate::error::{ErrorCode, ExchangeError, ExchangeResult};
use crate::exchange::handler::{HandlerState, HashSettings};
use crate::message::ServiceCall;

/// Wait between iterations after a failed receive, so a dead connection
/// does not spin the loop.
const FAILURE_BACKOFF: Duration = Duration::from_millis(250);

/// Reads envelopes from one queue and fans them out to observers.
pub struct MessageReceiver {
    state: HandlerState,
    cache: Arc<dyn ExchangeCache>,
    receive_queue: String,
    receiving: AtomicBool,
    shutdown: CancellationToken,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl MessageReceiver {
    /// Create a receiver bound to a fully-qualified queue name.
    pub fn new(
        cache: Arc<dyn ExchangeCache>,
        connection_identifier: impl Into<String>,
        receive_queue: impl Into<String>,
        hash: HashSettings,
        initially_available: bool,
    ) -> Self {
        Self {
            state: HandlerState::new(connection_identifier, hash, initially_available),
            cache,
            receive_queue: receive_queue.into(),
            receiving: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            task: parking_lot::Mutex::new(None),
        }
    }

    /// Shared handler state.
    pub fn state(&self) -> &HandlerState {
        &self.state
    }

    /// The queue this receiver drains.
    pub fn receive_queue(&self) -> &str {
        &self.receive_queue
    }

    /// Whether the receive loop is running.
    pub fn is_receiving(&self) -> bool {
        self.receiving.load(Ordering::Acquire)
    }

    /// Start the receive loop. Enabling twice is a no-op.
    pub fn enable(self: &Arc<Self>) {
        if self.receiving.swap(true, Ordering::AcqRel) {
            return;
        }
        let receiver = Arc::clone(self);
        let handle = tokio::spawn(async move { receiver.run().await });
        *self.task.lock() = Some(handle);
        info!(queue = %self.receive_queue, "message receiver enabled");
    }

    /// Stop the receive loop and wait for it to wind down. Disabling is
    /// terminal for this receiver; the exchange builds fresh handlers on the
    /// next enable.
    pub async fn disable(&self) {
        self.receiving.store(false, Ordering::Release);
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!(queue = %self.receive_queue, "message receiver disabled");
    }

    async fn run(&self) {
        while self.is_receiving() && !self.shutdown.is_cancelled() {
            let received = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = self.receive_once() => received,
            };
            match received {
                Ok(Some(call)) => self.state.notify_observers(&call).await,
                Ok(None) => {}
                Err(e) if e.code() == ErrorCode::MessageTamperingDetected => {
                    error!(queue = %self.receive_queue, error = %e, "tampered message dropped");
                }
                Err(e) => {
                    warn!(queue = %self.receive_queue, error = %e, "receive failed");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(FAILURE_BACKOFF) => {}
                    }
                }
            }
        }
    }

    /// One receive iteration: blocking pop, payload rehydration, then hash
    /// verification against the retained wire form.
    async fn receive_once(&self) -> ExchangeResult<Option<ServiceCall>> {
        if !self.state.is_available() {
            return Err(ExchangeError::new(
                ErrorCode::MessageReceiverUnavailable,
                "message receiver has no usable connection",
            ));
        }

        let Some(raw) = self.cache.receive_message(&self.receive_queue).await? else {
            return Ok(None);
        };

        let wire: Value = serde_json::from_str(&raw).map_err(|e| {
            ExchangeError::new(
                ErrorCode::MessageTamperingDetected,
                "received envelope is not valid JSON",
            )
            .with_source(e)
        })?;
        let mut call = ServiceCall::from_wire(wire.clone()).map_err(|e| {
            ExchangeError::new(
                ErrorCode::MessageTamperingDetected,
                "received envelope does not parse as a service call",
            )
            .with_source(e)
        })?;

        let store_key = call
            .message
            .payload
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                ExchangeError::general("lightweight envelope carries no payload store key")
            })?;
        call.message.payload = self.cache.retrieve_message_payload(&store_key).await?;
        call.message.hash = None;

        self.post_receive(&wire)?;
        debug!(
            message_id = %call.message_id(),
            queue = %self.receive_queue,
            "message received"
        );
        Ok(Some(call))
    }

    /// Verify the envelope's keyed hash when hashing is enabled.
    fn post_receive(&self, wire: &Value) -> ExchangeResult<()> {
        if self.state.hash_enabled() {
            self.state.verify_wire_hash(wire)?;
        }
        Ok(())
    }
}

impl ConnectionObserver for MessageReceiver {
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
