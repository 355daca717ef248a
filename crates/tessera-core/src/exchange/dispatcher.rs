//! Message dispatcher.
//!
//! The single outbound front door of an instance. Every send runs inside a
//! three-attempt retry, and each state transition of a message is recorded
//! as a structured trace event: `SENT` when dispatch starts, then exactly
//! one of `DELIVERED` or `FAILED`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{ErrorCode, ExchangeError, ExchangeResult};
use crate::exchange::MessageExchange;
use crate::message::ServiceCall;
use crate::retry::RetryPolicy;

/// Delivery state of a dispatched message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    /// Dispatch has started.
    Sent,
    /// The broker accepted the envelope.
    Delivered,
    /// Every delivery attempt failed.
    Failed,
}

impl MessageState {
    /// Trace event representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageState::Sent => "SENT",
            MessageState::Delivered => "DELIVERED",
            MessageState::Failed => "FAILED",
        }
    }
}

/// Which pipeline a message travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// A request on its way to a pending queue.
    Pending,
    /// A response on its way to a processed queue.
    Processed,
}

impl MessageKind {
    /// Trace event representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Pending => "PENDING",
            MessageKind::Processed => "PROCESSED",
        }
    }
}

/// Number of delivery attempts per send.
const SEND_ATTEMPTS: u32 = 3;

/// Retry-wrapped front for both outbound pipelines.
///
/// One dispatcher exists per process; its exchange reference is set once at
/// [`initialize`](Self::initialize) and cleared at
/// [`shut_down`](Self::shut_down).
pub struct MessageDispatcher {
    exchange: parking_lot::RwLock<Option<Arc<MessageExchange>>>,
    send_backoff: Duration,
}

impl MessageDispatcher {
    /// Create an uninitialized dispatcher.
    pub fn new() -> Self {
        Self {
            exchange: parking_lot::RwLock::new(None),
            send_backoff: Duration::from_millis(50),
        }
    }

    /// Attach the exchange this dispatcher fronts.
    pub fn initialize(&self, exchange: Arc<MessageExchange>) {
        *self.exchange.write() = Some(exchange);
    }

    /// Detach the exchange; subsequent sends fail.
    pub fn shut_down(&self) {
        *self.exchange.write() = None;
    }

    /// Whether an exchange is attached.
    pub fn is_initialized(&self) -> bool {
        self.exchange.read().is_some()
    }

    /// Dispatch a request and return its message id.
    pub async fn send_request(&self, call: &ServiceCall) -> ExchangeResult<String> {
        let exchange = self.attached_exchange()?;
        self.trace(call, MessageKind::Pending, MessageState::Sent);

        let outcome = self
            .send_policy(call)
            .execute(|| exchange.send_message_request(call))
            .await;
        match outcome {
            Ok(()) => {
                self.trace(call, MessageKind::Pending, MessageState::Delivered);
                Ok(call.message_id().to_string())
            }
            Err(e) => {
                self.trace(call, MessageKind::Pending, MessageState::Failed);
                Err(ExchangeError::new(
                    ErrorCode::MessageExchangeBroken,
                    "request delivery failed after final attempt",
                )
                .with_source(e))
            }
        }
    }

    /// Dispatch a response back to the instance that issued the request.
    pub async fn send_response(&self, call: &ServiceCall) -> ExchangeResult<()> {
        let exchange = self.attached_exchange()?;
        self.trace(call, MessageKind::Processed, MessageState::Sent);

        let outcome = self
            .send_policy(call)
            .execute(|| exchange.send_message_response(call))
            .await;
        match outcome {
            Ok(()) => {
                self.trace(call, MessageKind::Processed, MessageState::Delivered);
                Ok(())
            }
            Err(e) => {
                self.trace(call, MessageKind::Processed, MessageState::Failed);
                Err(ExchangeError::new(
                    ErrorCode::MessageExchangeBroken,
                    "response delivery failed after final attempt",
                )
                .with_source(e))
            }
        }
    }

    /// Observe inbound requests through the attached exchange.
    pub fn add_request_observer(
        &self,
        observer: Arc<dyn crate::exchange::MessageObserver>,
    ) -> ExchangeResult<()> {
        self.attached_exchange()?.add_request_observer(observer);
        Ok(())
    }

    /// Observe inbound responses through the attached exchange.
    pub fn add_response_observer(
        &self,
        observer: Arc<dyn crate::exchange::MessageObserver>,
    ) -> ExchangeResult<()> {
        self.attached_exchange()?.add_response_observer(observer);
        Ok(())
    }

    fn attached_exchange(&self) -> ExchangeResult<Arc<MessageExchange>> {
        self.exchange.read().clone().ok_or_else(|| {
            ExchangeError::new(
                ErrorCode::MessageExchangeBroken,
                "message dispatcher has no exchange attached",
            )
        })
    }

    fn send_policy(&self, call: &ServiceCall) -> RetryPolicy {
        let message_id = call.message_id().to_string();
        RetryPolicy::new(SEND_ATTEMPTS)
            .with_backoff(self.send_backoff, self.send_backoff * SEND_ATTEMPTS)
            .on_failed_attempt(move |e| {
                warn!(message_id = %message_id, error = %e, "message send attempt failed");
            })
    }

    fn trace(&self, call: &ServiceCall, kind: MessageKind, state: MessageState) {
        info!(
            message_id = %call.message_id(),
            chain_id = %call.message.chain_id,
            kind = kind.as_str(),
            state = state.as_str(),
            "message trace"
        );
    }
}

impl Default for MessageDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
