//! Shared message handler state.
//!
//! Senders and receivers compose a [`HandlerState`]: an availability flag
//! driven by connection lifecycle events, the keyed-hash settings, and a
//! fan-out list of [`MessageObserver`]s. Availability only reacts to events
//! carrying this handler's own connection identifier, so instances with
//! several broker connections do not cross-talk.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::broker::ObserverSet;
use crate::config::ExchangeSettings;
use crate::error::{ExchangeError, ExchangeResult};
use crate::message::{hash, ServiceCall};

/// Capability of consuming messages delivered by a handler.
#[async_trait]
pub trait MessageObserver: Send + Sync {
    /// Handle one delivered message.
    async fn on_message(&self, message: ServiceCall);
}

/// Keyed-hash configuration shared by both pipeline directions.
#[derive(Debug, Clone, Default)]
pub struct HashSettings {
    /// Whether envelopes carry a keyed hash.
    pub enabled: bool,
    /// The process-wide secret.
    pub key: Option<String>,
}

impl HashSettings {
    /// Extract the hash settings from the exchange configuration.
    pub fn from_settings(settings: &ExchangeSettings) -> Self {
        Self {
            enabled: settings.hash_enabled,
            key: settings.hash_key.clone(),
        }
    }

    fn key(&self) -> ExchangeResult<&str> {
        self.key
            .as_deref()
            .ok_or_else(|| ExchangeError::general("message hash key is not configured"))
    }
}

/// State shared by message senders and receivers.
pub struct HandlerState {
    connection_identifier: String,
    available: AtomicBool,
    observers: ObserverSet<dyn MessageObserver>,
    hash: HashSettings,
}

impl HandlerState {
    /// Create handler state bound to a connection identifier.
    pub fn new(
        connection_identifier: impl Into<String>,
        hash: HashSettings,
        initially_available: bool,
    ) -> Self {
        Self {
            connection_identifier: connection_identifier.into(),
            available: AtomicBool::new(initially_available),
            observers: ObserverSet::new(),
            hash,
        }
    }

    /// The identifier of the connection this handler rides on.
    pub fn connection_identifier(&self) -> &str {
        &self.connection_identifier
    }

    /// Whether the handler can currently move messages.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Force the availability flag.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// React to a connection lifecycle event, flipping availability only for
    /// this handler's own connection.
    pub fn on_connection_event(&self, identifier: &str, usable: bool) {
        if identifier == self.connection_identifier {
            self.set_available(usable);
        }
    }

    /// Whether envelopes are hashed.
    pub fn hash_enabled(&self) -> bool {
        self.hash.enabled
    }

    /// Compute the keyed hash of a lightweight envelope.
    pub fn create_message_hash(&self, light: &ServiceCall) -> ExchangeResult<String> {
        let wire = light.to_wire()?;
        hash::create_message_hash(&wire, self.hash.key()?)
    }

    /// Verify the hash carried by a wire envelope.
    pub fn verify_wire_hash(&self, wire: &Value) -> ExchangeResult<()> {
        hash::verify_message_hash(wire, self.hash.key()?)
    }

    /// Register a message observer.
    pub fn add_message_observer(&self, observer: Arc<dyn MessageObserver>) {
        self.observers.add(observer);
    }

    /// Number of registered message observers.
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Deliver a message to every registered observer.
    pub async fn notify_observers(&self, message: &ServiceCall) {
        for observer in self.observers.snapshot().iter() {
            observer.on_message(message.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::message::{MessageNode, ServiceAddress, ServiceExecContext};

    fn call() -> ServiceCall {
        ServiceCall::prepare(
            ServiceAddress::new("d-b", "echo"),
            json!({"x": 1}),
            MessageNode::instance("i-a", "d-a"),
            &ServiceExecContext::new(),
        )
    }

    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageObserver for Recorder {
        async fn on_message(&self, message: ServiceCall) {
            self.seen.lock().push(message.message_id().to_string());
        }
    }

    #[test]
    fn test_availability_filters_on_identifier() {
        let state = HandlerState::new("conn-a", HashSettings::default(), true);

        state.on_connection_event("conn-b", false);
        assert!(state.is_available());

        state.on_connection_event("conn-a", false);
        assert!(!state.is_available());

        state.on_connection_event("conn-a", true);
        assert!(state.is_available());
    }

    #[tokio::test]
    async fn test_observer_fan_out_delivers_once_each() {
        let state = HandlerState::new("conn-a", HashSettings::default(), true);
        let a = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let b = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        state.add_message_observer(a.clone());
        state.add_message_observer(b.clone());

        let message = call();
        state.notify_observers(&message).await;

        assert_eq!(a.seen.lock().as_slice(), &[message.message_id().to_string()]);
        assert_eq!(b.seen.lock().as_slice(), &[message.message_id().to_string()]);
    }

    #[test]
    fn test_hash_round_trip_through_state() {
        let state = HandlerState::new(
            "conn-a",
            HashSettings {
                enabled: true,
                key: Some("secret".to_string()),
            },
            true,
        );

        let mut light = call().lightweight("message-store:k");
        light.message.hash = Some(state.create_message_hash(&light).unwrap());
        let wire = light.to_wire().unwrap();
        assert!(state.verify_wire_hash(&wire).is_ok());
    }

    #[test]
    fn test_missing_hash_key_is_an_error() {
        let state = HandlerState::new(
            "conn-a",
            HashSettings {
                enabled: true,
                key: None,
            },
            true,
        );
        assert!(state.create_message_hash(&call()).is_err());
    }
}
