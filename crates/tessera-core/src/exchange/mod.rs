//! Message exchange
//!
//! The exchange composes two pipeline directions over one transport cache:
//!
//! - inbound: requests arriving on `pending:<own domain>` plus the sender
//!   that writes responses out,
//! - outbound: responses arriving on `processed:<own domain>:<own instance>`
//!   plus the sender that writes requests out.
//!
//! Each receiver fans its deliveries out through the exchange's observer
//! sets, so callers and executors attach once regardless of when the
//! pipelines are (re)built.

pub mod dispatcher;
pub mod handler;
pub mod sender;
pub mod receiver;

pub use dispatcher::{MessageDispatcher, MessageKind, MessageState};
pub use handler::{HandlerState, HashSettings, MessageObserver};
pub use receiver::MessageReceiver;
pub use sender::MessageSender;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::broker::{BrokerClient, ObserverSet};
use crate::cache::ExchangeCache;
use crate::config::{ExchangeSettings, InstanceSettings};
use crate::error::{ErrorCode, ExchangeError, ExchangeResult};
use crate::message::ServiceCall;

/// Queue naming for one instance's pipelines.
#[derive(Debug, Clone)]
pub struct ExchangeRouting {
    /// Prefix applied to every queue name.
    pub queue_prefix: String,
    /// Pending (requests) queue marker.
    pub pending_queue: String,
    /// Processed (responses) queue marker.
    pub processed_queue: String,
    /// This instance's service domain.
    pub own_domain: String,
    /// This instance's identifier.
    pub own_instance_id: String,
}

impl ExchangeRouting {
    /// Derive routing from configuration.
    pub fn new(settings: &ExchangeSettings, instance: &InstanceSettings) -> Self {
        Self {
            queue_prefix: settings.queue_prefix.clone(),
            pending_queue: settings.pending_queue.clone(),
            processed_queue: settings.processed_queue.clone(),
            own_domain: instance.service_domain_name.clone(),
            own_instance_id: instance.instance_id.clone(),
        }
    }

    /// Route of the queue this instance's requests arrive on.
    pub fn own_pending_route(&self) -> String {
        format!("{}{}", self.pending_queue, self.own_domain)
    }

    /// Route of the queue this instance's responses arrive on.
    pub fn own_processed_route(&self) -> String {
        format!(
            "{}{}:{}",
            self.processed_queue, self.own_domain, self.own_instance_id
        )
    }

    /// Route of the pending queue for a destination domain.
    pub fn request_route(&self, destination_domain: &str) -> String {
        format!("{}{}", self.pending_queue, destination_domain)
    }

    /// Route of the processed queue for a specific instance of a domain.
    pub fn response_route(&self, source_domain: &str, source_instance_id: &str) -> String {
        format!(
            "{}{}:{}",
            self.processed_queue, source_domain, source_instance_id
        )
    }

    /// Fully-qualified queue name for a route.
    pub fn queue_name(&self, route: &str) -> String {
        format!("{}{}", self.queue_prefix, route)
    }
}

/// One pipeline direction: a sender and a receiver over the same connection.
#[derive(Clone)]
struct Direction {
    sender: Arc<MessageSender>,
    receiver: Arc<MessageReceiver>,
}

/// Forwards a receiver's deliveries to an exchange-level observer set.
struct ObserverRelay {
    targets: Arc<ObserverSet<dyn MessageObserver>>,
}

#[async_trait]
impl MessageObserver for ObserverRelay {
    async fn on_message(&self, message: ServiceCall) {
        for observer in self.targets.snapshot().iter() {
            observer.on_message(message.clone()).await;
        }
    }
}

/// Owns the two pipeline directions of one instance.
pub struct MessageExchange {
    routing: ExchangeRouting,
    hash: HashSettings,
    cache: Arc<dyn ExchangeCache>,
    broker: Option<Arc<BrokerClient>>,
    inbound: parking_lot::RwLock<Option<Direction>>,
    outbound: parking_lot::RwLock<Option<Direction>>,
    request_observers: Arc<ObserverSet<dyn MessageObserver>>,
    response_observers: Arc<ObserverSet<dyn MessageObserver>>,
}

impl MessageExchange {
    /// Create an exchange over a transport cache. When a broker client is
    /// given, the handlers follow its connection lifecycle.
    pub fn new(
        cache: Arc<dyn ExchangeCache>,
        broker: Option<Arc<BrokerClient>>,
        routing: ExchangeRouting,
        hash: HashSettings,
    ) -> Self {
        Self {
            routing,
            hash,
            cache,
            broker,
            inbound: parking_lot::RwLock::new(None),
            outbound: parking_lot::RwLock::new(None),
            request_observers: Arc::new(ObserverSet::new()),
            response_observers: Arc::new(ObserverSet::new()),
        }
    }

    /// The routing table of this exchange.
    pub fn routing(&self) -> &ExchangeRouting {
        &self.routing
    }

    /// Observe inbound requests (the provider side).
    pub fn add_request_observer(&self, observer: Arc<dyn MessageObserver>) {
        self.request_observers.add(observer);
    }

    /// Observe inbound responses (the consumer side).
    pub fn add_response_observer(&self, observer: Arc<dyn MessageObserver>) {
        self.response_observers.add(observer);
    }

    /// Build and start the requested pipeline directions.
    pub async fn enable_messaging(
        &self,
        configure_inbound: bool,
        configure_outbound: bool,
    ) -> ExchangeResult<()> {
        let identifier = self
            .broker
            .as_ref()
            .map(|b| b.identifier().to_string())
            .unwrap_or_else(|| "in-process".to_string());
        let available = self.broker.as_ref().map(|b| b.is_ready()).unwrap_or(true);

        if configure_inbound {
            let direction = self.build_direction(
                &identifier,
                available,
                self.routing.own_pending_route(),
                Arc::clone(&self.request_observers),
            );
            *self.inbound.write() = Some(direction);
        }
        if configure_outbound {
            let direction = self.build_direction(
                &identifier,
                available,
                self.routing.own_processed_route(),
                Arc::clone(&self.response_observers),
            );
            *self.outbound.write() = Some(direction);
        }

        let (inbound, outbound) = (self.inbound.read().clone(), self.outbound.read().clone());
        if let Some(direction) = &inbound {
            direction.receiver.enable();
        }
        if let Some(direction) = &outbound {
            direction.receiver.enable();
        }
        info!(
            inbound = configure_inbound,
            outbound = configure_outbound,
            domain = %self.routing.own_domain,
            "messaging enabled"
        );
        Ok(())
    }

    /// Stop both pipeline directions.
    pub async fn disable_messaging(&self) {
        let inbound = self.inbound.write().take();
        let outbound = self.outbound.write().take();

        match (inbound, outbound) {
            (Some(a), Some(b)) => {
                tokio::join!(a.receiver.disable(), b.receiver.disable());
                a.sender.state().set_available(false);
                b.sender.state().set_available(false);
            }
            (Some(a), None) => {
                a.receiver.disable().await;
                a.sender.state().set_available(false);
            }
            (None, Some(b)) => {
                b.receiver.disable().await;
                b.sender.state().set_available(false);
            }
            (None, None) => {}
        }
        info!(domain = %self.routing.own_domain, "messaging disabled");
    }

    /// Route a request envelope to its destination domain's pending queue.
    pub async fn send_message_request(&self, call: &ServiceCall) -> ExchangeResult<()> {
        let direction = self.outbound.read().clone().ok_or_else(|| {
            ExchangeError::new(
                ErrorCode::MessageExchangeBroken,
                "outbound pipeline is not enabled",
            )
        })?;
        let route = self.routing.request_route(&call.message.destination.route);
        direction.sender.send(call, &route).await
    }

    /// Route a response envelope back to the instance that issued the
    /// request.
    pub async fn send_message_response(&self, call: &ServiceCall) -> ExchangeResult<()> {
        let direction = self.inbound.read().clone().ok_or_else(|| {
            ExchangeError::new(
                ErrorCode::MessageExchangeBroken,
                "inbound pipeline is not enabled",
            )
        })?;
        let instance_id = call
            .message
            .source
            .instance_id
            .as_deref()
            .ok_or_else(|| ExchangeError::general("response envelope has no source instance"))?;
        let route = self
            .routing
            .response_route(&call.message.source.route, instance_id);
        direction.sender.send(call, &route).await
    }

    fn build_direction(
        &self,
        identifier: &str,
        available: bool,
        receive_route: String,
        targets: Arc<ObserverSet<dyn MessageObserver>>,
    ) -> Direction {
        let sender = Arc::new(MessageSender::new(
            Arc::clone(&self.cache),
            identifier,
            self.routing.queue_prefix.clone(),
            self.hash.clone(),
            available,
        ));
        let receiver = Arc::new(MessageReceiver::new(
            Arc::clone(&self.cache),
            identifier,
            self.routing.queue_name(&receive_route),
            self.hash.clone(),
            available,
        ));
        receiver
            .state()
            .add_message_observer(Arc::new(ObserverRelay { targets }));

        if let Some(broker) = &self.broker {
            broker.add_connection_observer(sender.clone());
            broker.add_connection_observer(receiver.clone());
        }
        Direction { sender, receiver }
    }
}
