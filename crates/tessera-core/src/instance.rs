//! Service instance composition.
//!
//! A [`ServiceInstance`] assembles the broker client, caches, exchange,
//! dispatcher, caller, executor and registry into one process-level unit.
//! Its role decides which pipeline directions exist: consumers own the
//! outbound direction (requests out, responses in), providers own the
//! inbound direction (requests in, responses out).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::info;

use crate::broker::BrokerClient;
use crate::cache::{ExchangeCache, MessageCache, SystemCache};
use crate::config::Config;
use crate::error::{ExchangeError, ExchangeResult, ServiceCallResult};
use crate::exchange::{ExchangeRouting, HashSettings, MessageDispatcher, MessageExchange};
use crate::message::{MessageNode, ServiceAddress, ServiceDefinition, ServiceExecContext};
use crate::service::{ServiceCaller, ServiceExecutor, ServiceHandler, ServiceRegistry};

/// Which sides of the exchange an instance participates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceRole {
    /// Issues calls only.
    Consumer,
    /// Serves calls only.
    Provider,
    /// Issues and serves calls.
    Full,
}

impl InstanceRole {
    /// Whether this role issues calls.
    pub fn is_consumer(&self) -> bool {
        matches!(self, InstanceRole::Consumer | InstanceRole::Full)
    }

    /// Whether this role serves calls.
    pub fn is_provider(&self) -> bool {
        matches!(self, InstanceRole::Provider | InstanceRole::Full)
    }
}

impl std::fmt::Display for InstanceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceRole::Consumer => write!(f, "consumer"),
            InstanceRole::Provider => write!(f, "provider"),
            InstanceRole::Full => write!(f, "consumer+provider"),
        }
    }
}

/// One process participating in the exchange.
pub struct ServiceInstance {
    config: Config,
    role: InstanceRole,
    broker: Arc<BrokerClient>,
    system_cache: Arc<SystemCache>,
    exchange: Arc<MessageExchange>,
    dispatcher: Arc<MessageDispatcher>,
    registry: Arc<ServiceRegistry>,
    caller: Arc<ServiceCaller>,
    executor: Arc<ServiceExecutor>,
    started: AtomicBool,
}

impl ServiceInstance {
    /// Assemble an instance from configuration. Nothing connects until
    /// [`start`](Self::start).
    pub fn new(config: Config, role: InstanceRole) -> Arc<Self> {
        let broker = BrokerClient::new(config.broker.clone());

        let message_cache: Arc<dyn ExchangeCache> =
            Arc::new(MessageCache::new(Arc::clone(&broker), &config.exchange));
        let system_cache = Arc::new(SystemCache::new(Arc::clone(&broker)));

        let exchange = Arc::new(MessageExchange::new(
            message_cache,
            Some(Arc::clone(&broker)),
            ExchangeRouting::new(&config.exchange, &config.instance),
            HashSettings::from_settings(&config.exchange),
        ));
        let dispatcher = Arc::new(MessageDispatcher::new());
        let registry = Arc::new(ServiceRegistry::new(
            Arc::clone(&system_cache),
            config.exchange.service_registry_address.clone(),
        ));

        let identity = MessageNode::instance(
            config.instance.instance_id.clone(),
            config.instance.service_domain_name.clone(),
        );
        let caller = Arc::new(ServiceCaller::new(
            dispatcher.clone(),
            registry.clone(),
            identity,
            config.exchange.service_execution_timeout(),
        ));
        let executor = Arc::new(ServiceExecutor::new(
            dispatcher.clone(),
            config.exchange.service_execution_timeout(),
        ));
        executor.set_nested_caller(Arc::clone(&caller));

        let instance = Arc::new(Self {
            config,
            role,
            broker,
            system_cache,
            exchange,
            dispatcher,
            registry,
            caller,
            executor,
            started: AtomicBool::new(false),
        });

        // the system cache follows the broker connection lifecycle
        instance
            .broker
            .add_connection_observer(instance.system_cache.clone());
        instance
    }

    /// The instance's configured role.
    pub fn role(&self) -> InstanceRole {
        self.role
    }

    /// The assembled configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The broker client owned by this instance.
    pub fn broker(&self) -> &Arc<BrokerClient> {
        &self.broker
    }

    /// The gated system cache.
    pub fn system_cache(&self) -> &Arc<SystemCache> {
        &self.system_cache
    }

    /// The service registry.
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// The provider-side executor.
    pub fn executor(&self) -> &Arc<ServiceExecutor> {
        &self.executor
    }

    /// The consumer-side caller.
    pub fn caller(&self) -> &Arc<ServiceCaller> {
        &self.caller
    }

    /// Register a service handler. Handlers registered before
    /// [`start`](Self::start) are published to the registry during startup.
    pub fn register_service(&self, definition: ServiceDefinition, handler: ServiceHandler) {
        self.executor.add_service_handler(definition, handler);
    }

    /// Connect to the broker, enable the role's pipeline directions, and
    /// publish registered services.
    pub async fn start(&self) -> ExchangeResult<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ExchangeError::general("service instance already started"));
        }

        self.broker.initialize().await?;
        self.dispatcher.initialize(Arc::clone(&self.exchange));

        if self.role.is_provider() {
            self.exchange.add_request_observer(self.executor.clone());
        }
        if self.role.is_consumer() {
            self.exchange.add_response_observer(self.caller.clone());
        }
        self.exchange
            .enable_messaging(self.role.is_provider(), self.role.is_consumer())
            .await?;

        if self.role.is_provider() {
            let definitions = self.executor.registered_definitions();
            self.registry
                .register_services(&self.config.instance.service_domain_name, &definitions)
                .await;
        }

        info!(
            instance_id = %self.config.instance.instance_id,
            domain = %self.config.instance.service_domain_name,
            role = %self.role,
            "service instance started"
        );
        Ok(())
    }

    /// Issue a service call through the consumer pipeline.
    pub async fn execute_service_call(
        &self,
        address: ServiceAddress,
        params: Value,
        context: ServiceExecContext,
    ) -> ServiceCallResult {
        if !self.role.is_consumer() {
            return ServiceCallResult::failure(&ExchangeError::general(
                "this instance does not issue service calls",
            ));
        }
        self.caller
            .execute_service_call(address, params, context)
            .await
    }

    /// Disable messaging and tear the broker connection down.
    pub async fn stop(&self, timeout: Duration) {
        self.exchange.disable_messaging().await;
        self.dispatcher.shut_down();
        self.broker.shut_down(timeout).await;
        self.started.store(false, Ordering::Release);
        info!(
            instance_id = %self.config.instance.instance_id,
            "service instance stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_capabilities() {
        assert!(InstanceRole::Consumer.is_consumer());
        assert!(!InstanceRole::Consumer.is_provider());
        assert!(InstanceRole::Provider.is_provider());
        assert!(!InstanceRole::Provider.is_consumer());
        assert!(InstanceRole::Full.is_consumer());
        assert!(InstanceRole::Full.is_provider());
    }

    #[test]
    fn test_assembles_without_connecting() {
        let instance = ServiceInstance::new(Config::default(), InstanceRole::Full);
        assert!(!instance.broker().is_ready());
        assert!(!instance.system_cache().is_operational());
        assert_eq!(instance.executor().service_count(), 0);
    }

    #[tokio::test]
    async fn test_non_consumer_refuses_calls() {
        let instance = ServiceInstance::new(Config::default(), InstanceRole::Provider);
        let result = instance
            .execute_service_call(
                ServiceAddress::new("d-b", "echo"),
                Value::Null,
                ServiceExecContext::new(),
            )
            .await;
        assert!(!result.is_successful);
    }

    #[test]
    fn test_register_service_lands_in_executor() {
        let instance = ServiceInstance::new(Config::default(), InstanceRole::Provider);
        instance.register_service(
            ServiceDefinition::new("echo"),
            Arc::new(|_d, params, _c| Box::pin(async move { Ok(params) })),
        );
        assert!(instance.executor().has_service("echo"));
    }
}
