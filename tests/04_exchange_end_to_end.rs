//! End-to-end exchange tests over the in-process cache
//!
//! Each test assembles full consumer/provider stacks (exchange, dispatcher,
//! caller, executor) sharing one in-memory substrate, so the complete
//! request/response path runs without an external broker.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tessera::cache::MemoryExchangeCache;
use tessera::config::{ExchangeSettings, InstanceSettings};
use tessera::error::{ErrorCode, ExchangeResult};
use tessera::exchange::{ExchangeRouting, HashSettings, MessageDispatcher, MessageExchange};
use tessera::message::{
    MessageNode, ServiceAddress, ServiceDefinition, ServiceExecContext,
};
use tessera::service::{RegistryGate, ServiceCaller, ServiceExecutor, ServiceHandler};

const HASH_KEY: &str = "e2e-test-key";

/// Registry fake answering from a fixed allow list.
struct StaticGate {
    allowed: HashSet<(String, String)>,
}

impl StaticGate {
    fn allowing(entries: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            allowed: entries
                .iter()
                .map(|(d, a)| (d.to_string(), a.to_string()))
                .collect(),
        })
    }
}

#[async_trait]
impl RegistryGate for StaticGate {
    async fn is_registered(&self, domain: &str, alias: &str) -> ExchangeResult<bool> {
        Ok(self
            .allowed
            .contains(&(domain.to_string(), alias.to_string())))
    }
}

/// One fully-wired participant over the shared in-memory substrate.
struct Participant {
    exchange: Arc<MessageExchange>,
    caller: Arc<ServiceCaller>,
    executor: Arc<ServiceExecutor>,
}

impl Participant {
    fn build(
        cache: Arc<MemoryExchangeCache>,
        domain: &str,
        instance_id: &str,
        gate: Arc<dyn RegistryGate>,
        timeout: Duration,
    ) -> Self {
        let mut instance = InstanceSettings::default();
        instance.service_domain_name = domain.to_string();
        instance.instance_id = instance_id.to_string();

        let exchange = Arc::new(MessageExchange::new(
            cache,
            None,
            ExchangeRouting::new(&ExchangeSettings::default(), &instance),
            HashSettings {
                enabled: true,
                key: Some(HASH_KEY.to_string()),
            },
        ));
        let dispatcher = Arc::new(MessageDispatcher::new());
        dispatcher.initialize(Arc::clone(&exchange));

        let caller = Arc::new(ServiceCaller::new(
            dispatcher.clone(),
            gate,
            MessageNode::instance(instance_id, domain),
            timeout,
        ));
        let executor = Arc::new(ServiceExecutor::new(dispatcher.clone(), timeout));
        executor.set_nested_caller(Arc::clone(&caller));

        exchange.add_request_observer(executor.clone());
        exchange.add_response_observer(caller.clone());

        Self {
            exchange,
            caller,
            executor,
        }
    }

    async fn start(&self) {
        self.exchange.enable_messaging(true, true).await.unwrap();
    }

    async fn stop(&self) {
        self.exchange.disable_messaging().await;
    }

    fn serve(&self, definition: ServiceDefinition, handler: ServiceHandler) {
        self.executor.add_service_handler(definition, handler);
    }
}

fn shared_cache() -> Arc<MemoryExchangeCache> {
    Arc::new(
        MemoryExchangeCache::new("message-store:", Duration::from_secs(30))
            .with_receive_wait(Duration::from_millis(20)),
    )
}

#[tokio::test]
async fn test_happy_path_round_trip() {
    let cache = shared_cache();
    let gate = StaticGate::allowing(&[("d-b", "echo")]);
    let consumer = Participant::build(
        cache.clone(),
        "d-a",
        "i-a",
        gate.clone(),
        Duration::from_secs(5),
    );
    let provider = Participant::build(cache.clone(), "d-b", "i-b", gate, Duration::from_secs(5));
    provider.serve(
        ServiceDefinition::new("echo"),
        Arc::new(|_definition, params, _context| {
            Box::pin(async move {
                assert_eq!(params, json!({"x": 1}));
                Ok(json!({"y": 2}))
            })
        }),
    );

    consumer.start().await;
    provider.start().await;

    let result = consumer
        .caller
        .execute_service_call(
            ServiceAddress::new("d-b", "echo"),
            json!({"x": 1}),
            ServiceExecContext::new(),
        )
        .await;

    assert!(result.is_successful, "unexpected failure: {:?}", result.exception);
    assert_eq!(result.payload, Some(json!({"y": 2})));
    assert_eq!(consumer.caller.pending_count(), 0);

    consumer.stop().await;
    provider.stop().await;
}

#[tokio::test]
async fn test_unknown_service_fails_before_any_queue_write() {
    let cache = shared_cache();
    let gate = StaticGate::allowing(&[]);
    let consumer = Participant::build(
        cache.clone(),
        "d-a",
        "i-a",
        gate,
        Duration::from_secs(5),
    );
    consumer.start().await;

    let result = consumer
        .caller
        .execute_service_call(
            ServiceAddress::new("d-b", "nope"),
            json!({}),
            ServiceExecContext::new(),
        )
        .await;

    assert!(!result.is_successful);
    assert_eq!(
        result.exception_code(),
        Some(ErrorCode::ServiceNotRegistered)
    );
    assert_eq!(cache.queue_len("pending:d-b"), 0);

    consumer.stop().await;
}

#[tokio::test]
async fn test_silent_provider_times_the_call_out() {
    let cache = shared_cache();
    let gate = StaticGate::allowing(&[("d-b", "slow")]);
    // no provider is started at all: the request sits on pending:d-b
    let consumer = Participant::build(
        cache.clone(),
        "d-a",
        "i-a",
        gate,
        Duration::from_millis(500),
    );
    consumer.start().await;

    let begun = Instant::now();
    let result = consumer
        .caller
        .execute_service_call(
            ServiceAddress::new("d-b", "slow"),
            json!({}),
            ServiceExecContext::new(),
        )
        .await;
    let elapsed = begun.elapsed();

    assert!(!result.is_successful);
    assert_eq!(result.exception_code(), Some(ErrorCode::ServiceExecTimeout));
    assert!(result.payload.is_none());
    assert!(
        elapsed >= Duration::from_millis(450) && elapsed < Duration::from_secs(3),
        "timeout fired at {:?}",
        elapsed
    );
    assert_eq!(consumer.caller.pending_count(), 0);

    consumer.stop().await;
}

#[tokio::test]
async fn test_tampered_request_is_dropped_and_call_times_out() {
    let cache = shared_cache();
    let gate = StaticGate::allowing(&[("d-b", "echo")]);
    let consumer = Participant::build(
        cache.clone(),
        "d-a",
        "i-a",
        gate.clone(),
        Duration::from_millis(600),
    );
    let provider = Participant::build(cache.clone(), "d-b", "i-b", gate, Duration::from_secs(5));
    provider.serve(
        ServiceDefinition::new("echo"),
        Arc::new(|_d, params, _c| Box::pin(async move { Ok(params) })),
    );

    consumer.start().await;

    let call_task = {
        let caller = consumer.caller.clone();
        tokio::spawn(async move {
            caller
                .execute_service_call(
                    ServiceAddress::new("d-b", "echo"),
                    json!({"x": 9}),
                    ServiceExecContext::new(),
                )
                .await
        })
    };

    // corrupt the enqueued request before the provider comes online
    while cache.queue_len("pending:d-b") == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(cache.corrupt_tail("pending:d-b", |raw| {
        *raw = raw.replacen("\"chainLevel\":0", "\"chainLevel\":5", 1);
    }));
    provider.start().await;

    let result = call_task.await.unwrap();
    assert!(!result.is_successful);
    assert_eq!(result.exception_code(), Some(ErrorCode::ServiceExecTimeout));

    consumer.stop().await;
    provider.stop().await;
}

#[tokio::test]
async fn test_nested_call_extends_the_chain() {
    let cache = shared_cache();
    let gate = StaticGate::allowing(&[("d-b", "relay"), ("d-c", "report")]);
    let consumer = Participant::build(
        cache.clone(),
        "d-a",
        "i-a",
        gate.clone(),
        Duration::from_secs(5),
    );
    let middle = Participant::build(
        cache.clone(),
        "d-b",
        "i-b",
        gate.clone(),
        Duration::from_secs(5),
    );
    let leaf = Participant::build(cache.clone(), "d-c", "i-c", gate, Duration::from_secs(5));

    // d-c reports the chain coordinates of the call it receives
    leaf.serve(
        ServiceDefinition::new("report"),
        Arc::new(|_d, _p, context| {
            let incoming = context.incoming().clone();
            Box::pin(async move {
                Ok(json!({
                    "chainId": incoming.message.chain_id,
                    "chainLevel": incoming.message.chain_level,
                    "predecessor": incoming.message.predecessor,
                }))
            })
        }),
    );
    // d-b relays through a nested call carrying its own incoming as context
    middle.serve(
        ServiceDefinition::new("relay"),
        Arc::new(|_d, _p, context| {
            Box::pin(async move {
                let own = context.incoming().clone();
                let nested = context
                    .call_service(ServiceAddress::new("d-c", "report"), json!({}))
                    .await;
                assert!(nested.is_successful, "nested call failed: {:?}", nested.exception);
                Ok(json!({
                    "own": {
                        "chainId": own.message.chain_id,
                        "messageId": own.message_id(),
                    },
                    "nested": nested.payload,
                }))
            })
        }),
    );

    consumer.start().await;
    middle.start().await;
    leaf.start().await;

    let result = consumer
        .caller
        .execute_service_call(
            ServiceAddress::new("d-b", "relay"),
            json!({}),
            ServiceExecContext::new(),
        )
        .await;

    assert!(result.is_successful, "call failed: {:?}", result.exception);
    let payload = result.payload.unwrap();
    let own = &payload["own"];
    let nested = &payload["nested"];
    assert_eq!(nested["chainId"], own["chainId"]);
    assert_eq!(nested["chainLevel"], json!(1));
    assert_eq!(nested["predecessor"], own["messageId"]);

    consumer.stop().await;
    middle.stop().await;
    leaf.stop().await;
}

#[tokio::test]
async fn test_handler_failure_travels_back_as_exception() {
    let cache = shared_cache();
    let gate = StaticGate::allowing(&[("d-b", "broken")]);
    let consumer = Participant::build(
        cache.clone(),
        "d-a",
        "i-a",
        gate.clone(),
        Duration::from_secs(5),
    );
    let provider = Participant::build(cache.clone(), "d-b", "i-b", gate, Duration::from_secs(5));
    provider.serve(
        ServiceDefinition::new("broken"),
        Arc::new(|_d, _p, _c| {
            Box::pin(async {
                Err::<Value, _>(tessera::error::ExchangeError::general("kaboom"))
            })
        }),
    );

    consumer.start().await;
    provider.start().await;

    let result = consumer
        .caller
        .execute_service_call(
            ServiceAddress::new("d-b", "broken"),
            json!({}),
            ServiceExecContext::new(),
        )
        .await;

    assert!(!result.is_successful);
    let exception = result.exception.unwrap();
    assert_eq!(exception.code, ErrorCode::GeneralError);
    assert!(exception.message.contains("kaboom"));

    consumer.stop().await;
    provider.stop().await;
}
