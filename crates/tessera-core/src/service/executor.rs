//! Inbound request dispatch.
//!
//! The executor owns the service interface: a map from alias to versioned
//! handlers with the latest registered version as the default. Inbound
//! calls pass the access verifier, resolve to a handler, run under the
//! execution deadline, and leave with their result fields populated.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, warn};

use crate::error::{ErrorCode, ExchangeError, ExchangeResult, ServiceCallResult};
use crate::exchange::MessageObserver;
use crate::message::{ServiceAddress, ServiceCall, ServiceDefinition, ServiceExecContext};
use crate::service::{caller::ServiceCaller, MessageRouting};

/// Version recorded for definitions that do not pin one.
const DEFAULT_VERSION: &str = "1.0.0";

/// Future returned by a service handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = ExchangeResult<Value>> + Send>>;

/// A registered service handler.
///
/// Receives its own definition, the call's named parameters, and a context
/// for issuing nested calls that extend the chain.
pub type ServiceHandler =
    Arc<dyn Fn(Arc<ServiceDefinition>, Value, HandlerContext) -> HandlerFuture + Send + Sync>;

/// Capability of vetting inbound calls before execution.
#[async_trait]
pub trait AccessVerifier: Send + Sync {
    /// Approve or reject a call to `address` carrying `auth_token`.
    async fn verify_access(
        &self,
        auth_token: Option<&Value>,
        address: &ServiceAddress,
    ) -> ExchangeResult<()>;
}

/// The default verifier: every call is allowed.
pub struct AllowAllVerifier;

#[async_trait]
impl AccessVerifier for AllowAllVerifier {
    async fn verify_access(
        &self,
        _auth_token: Option<&Value>,
        _address: &ServiceAddress,
    ) -> ExchangeResult<()> {
        Ok(())
    }
}

/// Execution context handed to a running handler.
///
/// Nested calls issued through it inherit the incoming call's chain and are
/// recorded as successors on the response envelope.
#[derive(Clone)]
pub struct HandlerContext {
    caller: Option<Arc<ServiceCaller>>,
    incoming: ServiceCall,
    successors: Arc<parking_lot::Mutex<Vec<String>>>,
}

impl HandlerContext {
    fn new(caller: Option<Arc<ServiceCaller>>, incoming: ServiceCall) -> Self {
        Self {
            caller,
            incoming,
            successors: Arc::new(parking_lot::Mutex::new(Vec::new())),
        }
    }

    /// The call currently being served.
    pub fn incoming(&self) -> &ServiceCall {
        &self.incoming
    }

    /// Issue a nested service call that extends the incoming call's chain.
    pub async fn call_service(&self, address: ServiceAddress, params: Value) -> ServiceCallResult {
        let Some(caller) = &self.caller else {
            return ServiceCallResult::failure(&ExchangeError::general(
                "no service caller is wired for nested calls",
            ));
        };
        let context = ServiceExecContext::from_previous(self.incoming.clone());
        let call = caller.prepare_call(address, params, &context);
        self.successors.lock().push(call.message_id().to_string());
        caller.execute_prepared(call).await
    }

    fn take_successors(&self) -> Vec<String> {
        std::mem::take(&mut *self.successors.lock())
    }
}

struct RegisteredHandler {
    definition: Arc<ServiceDefinition>,
    handler: ServiceHandler,
}

impl Clone for RegisteredHandler {
    fn clone(&self) -> Self {
        Self {
            definition: Arc::clone(&self.definition),
            handler: Arc::clone(&self.handler),
        }
    }
}

struct ServiceEntry {
    versions: HashMap<String, RegisteredHandler>,
    default_version: String,
}

/// Dispatches inbound requests to registered service handlers.
pub struct ServiceExecutor {
    interface: parking_lot::RwLock<HashMap<String, ServiceEntry>>,
    routing: Arc<dyn MessageRouting>,
    verifier: parking_lot::RwLock<Arc<dyn AccessVerifier>>,
    nested_caller: parking_lot::RwLock<Option<Arc<ServiceCaller>>>,
    execution_timeout: Duration,
}

impl ServiceExecutor {
    /// Create an executor that answers through `routing`.
    pub fn new(routing: Arc<dyn MessageRouting>, execution_timeout: Duration) -> Self {
        Self {
            interface: parking_lot::RwLock::new(HashMap::new()),
            routing,
            verifier: parking_lot::RwLock::new(Arc::new(AllowAllVerifier)),
            nested_caller: parking_lot::RwLock::new(None),
            execution_timeout,
        }
    }

    /// Replace the access verifier.
    pub fn set_access_verifier(&self, verifier: Arc<dyn AccessVerifier>) {
        *self.verifier.write() = verifier;
    }

    /// Wire the caller handed to handlers for nested calls.
    pub fn set_nested_caller(&self, caller: Arc<ServiceCaller>) {
        *self.nested_caller.write() = Some(caller);
    }

    /// Register a handler under its definition's alias and version. The
    /// most recently registered version becomes the alias default.
    pub fn add_service_handler(&self, definition: ServiceDefinition, handler: ServiceHandler) {
        let alias = definition.service_alias.clone();
        let version = definition
            .service_version
            .clone()
            .unwrap_or_else(|| DEFAULT_VERSION.to_string());

        let mut interface = self.interface.write();
        let entry = interface.entry(alias).or_insert_with(|| ServiceEntry {
            versions: HashMap::new(),
            default_version: version.clone(),
        });
        entry.versions.insert(
            version.clone(),
            RegisteredHandler {
                definition: Arc::new(definition),
                handler,
            },
        );
        entry.default_version = version;
    }

    /// Number of registered aliases.
    pub fn service_count(&self) -> usize {
        self.interface.read().len()
    }

    /// Whether an alias has at least one handler.
    pub fn has_service(&self, alias: &str) -> bool {
        self.interface.read().contains_key(alias)
    }

    /// Every registered definition, for registry publication.
    pub fn registered_definitions(&self) -> Vec<ServiceDefinition> {
        self.interface
            .read()
            .values()
            .flat_map(|entry| entry.versions.values())
            .map(|registered| (*registered.definition).clone())
            .collect()
    }

    /// Serve one inbound call, returning the envelope with its result
    /// fields populated.
    pub async fn process(&self, mut call: ServiceCall) -> ServiceCall {
        match self.run_call(&call).await {
            Ok((payload, successors)) => {
                call.message.payload = payload;
                call.is_successful = Some(true);
                call.exception = None;
                if !successors.is_empty() {
                    call.successors = Some(successors);
                }
            }
            Err(e) => {
                warn!(
                    message_id = %call.message_id(),
                    alias = %call.service_address.service_alias,
                    error = %e,
                    "service call failed"
                );
                call.message.payload = Value::Null;
                call.is_successful = Some(false);
                call.exception = Some(e.to_exception());
            }
        }
        call
    }

    async fn run_call(&self, call: &ServiceCall) -> ExchangeResult<(Value, Vec<String>)> {
        let verifier = self.verifier.read().clone();
        verifier
            .verify_access(call.auth_token.as_ref(), &call.service_address)
            .await
            .map_err(|e| {
                ExchangeError::new(
                    ErrorCode::UnauthorizedAccess,
                    format!(
                        "access to {} denied",
                        call.service_address.service_alias
                    ),
                )
                .with_source(e)
            })?;

        let registered = self.resolve_handler(&call.service_address)?;
        let context = HandlerContext::new(self.nested_caller.read().clone(), call.clone());
        let invocation = (registered.handler)(
            Arc::clone(&registered.definition),
            call.service_params.clone(),
            context.clone(),
        );

        let payload = tokio::time::timeout(self.execution_timeout, invocation)
            .await
            .map_err(|_| {
                ExchangeError::new(
                    ErrorCode::ServiceExecTimeout,
                    format!(
                        "handler for {} exceeded its execution deadline",
                        call.service_address.service_alias
                    ),
                )
            })??;

        Ok((payload, context.take_successors()))
    }

    fn resolve_handler(&self, address: &ServiceAddress) -> ExchangeResult<RegisteredHandler> {
        let interface = self.interface.read();
        let entry = interface.get(&address.service_alias).ok_or_else(|| {
            ExchangeError::new(
                ErrorCode::ServiceNotFound,
                format!("no service registered as {}", address.service_alias),
            )
        })?;
        let version = address
            .service_version
            .as_deref()
            .unwrap_or(&entry.default_version);
        entry.versions.get(version).cloned().ok_or_else(|| {
            ExchangeError::new(
                ErrorCode::ServiceHandlerNotFound,
                format!(
                    "service {} has no handler for version {}",
                    address.service_alias, version
                ),
            )
        })
    }
}

#[async_trait]
impl MessageObserver for ServiceExecutor {
    async fn on_message(&self, call: ServiceCall) {
        let response = self.process(call).await;
        if let Err(e) = self.routing.dispatch_response(&response).await {
            error!(
                message_id = %response.message_id(),
                error = %e,
                "response dispatch failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::message::MessageNode;

    struct FakeRouting {
        responses: Mutex<Vec<ServiceCall>>,
    }

    impl FakeRouting {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl MessageRouting for FakeRouting {
        async fn dispatch_request(&self, call: &ServiceCall) -> ExchangeResult<String> {
            Ok(call.message_id().to_string())
        }

        async fn dispatch_response(&self, call: &ServiceCall) -> ExchangeResult<()> {
            self.responses.lock().push(call.clone());
            Ok(())
        }
    }

    struct DenyAll;

    #[async_trait]
    impl AccessVerifier for DenyAll {
        async fn verify_access(
            &self,
            _auth_token: Option<&Value>,
            _address: &ServiceAddress,
        ) -> ExchangeResult<()> {
            Err(ExchangeError::general("nobody gets in"))
        }
    }

    fn echo_handler() -> ServiceHandler {
        Arc::new(|_definition, params, _context| {
            Box::pin(async move { Ok(json!({"echoed": params})) })
        })
    }

    fn inbound_call(alias: &str, version: Option<&str>, params: Value) -> ServiceCall {
        let mut address = ServiceAddress::new("d-b", alias);
        if let Some(version) = version {
            address = address.with_version(version);
        }
        ServiceCall::prepare(
            address,
            params,
            MessageNode::instance("i-a", "d-a"),
            &ServiceExecContext::new(),
        )
    }

    fn executor() -> ServiceExecutor {
        ServiceExecutor::new(FakeRouting::new(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_handler_result_becomes_payload() {
        let executor = executor();
        executor.add_service_handler(ServiceDefinition::new("echo"), echo_handler());

        let response = executor
            .process(inbound_call("echo", None, json!({"x": 1})))
            .await;

        assert_eq!(response.is_successful, Some(true));
        assert_eq!(response.message.payload, json!({"echoed": {"x": 1}}));
        assert!(response.exception.is_none());
    }

    #[tokio::test]
    async fn test_unknown_alias_reports_service_not_found() {
        let executor = executor();
        let response = executor
            .process(inbound_call("missing", None, json!({})))
            .await;

        assert_eq!(response.is_successful, Some(false));
        assert_eq!(
            response.exception.as_ref().map(|e| e.code),
            Some(ErrorCode::ServiceNotFound)
        );
    }

    #[tokio::test]
    async fn test_unknown_version_reports_handler_not_found() {
        let executor = executor();
        executor.add_service_handler(
            ServiceDefinition::new("echo").with_version("1.0.0"),
            echo_handler(),
        );

        let response = executor
            .process(inbound_call("echo", Some("9.9.9"), json!({})))
            .await;

        assert_eq!(
            response.exception.as_ref().map(|e| e.code),
            Some(ErrorCode::ServiceHandlerNotFound)
        );
    }

    #[tokio::test]
    async fn test_latest_registered_version_is_default() {
        let executor = executor();
        executor.add_service_handler(
            ServiceDefinition::new("svc").with_version("1.0.0"),
            Arc::new(|_d, _p, _c| Box::pin(async { Ok(json!("one")) })),
        );
        executor.add_service_handler(
            ServiceDefinition::new("svc").with_version("2.0.0"),
            Arc::new(|_d, _p, _c| Box::pin(async { Ok(json!("two")) })),
        );

        let response = executor.process(inbound_call("svc", None, json!({}))).await;
        assert_eq!(response.message.payload, json!("two"));

        let pinned = executor
            .process(inbound_call("svc", Some("1.0.0"), json!({})))
            .await;
        assert_eq!(pinned.message.payload, json!("one"));
    }

    #[tokio::test]
    async fn test_rejected_access_reports_unauthorized() {
        let executor = executor();
        executor.add_service_handler(ServiceDefinition::new("echo"), echo_handler());
        executor.set_access_verifier(Arc::new(DenyAll));

        let response = executor
            .process(inbound_call("echo", None, json!({})))
            .await;

        assert_eq!(response.is_successful, Some(false));
        assert_eq!(
            response.exception.as_ref().map(|e| e.code),
            Some(ErrorCode::UnauthorizedAccess)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_handler_times_out() {
        let executor = ServiceExecutor::new(FakeRouting::new(), Duration::from_millis(500));
        executor.add_service_handler(
            ServiceDefinition::new("stuck"),
            Arc::new(|_d, _p, _c| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Value::Null)
                })
            }),
        );

        let response = executor
            .process(inbound_call("stuck", None, json!({})))
            .await;

        assert_eq!(
            response.exception.as_ref().map(|e| e.code),
            Some(ErrorCode::ServiceExecTimeout)
        );
    }

    #[tokio::test]
    async fn test_handler_error_is_captured_in_exception() {
        let executor = executor();
        executor.add_service_handler(
            ServiceDefinition::new("broken"),
            Arc::new(|_d, _p, _c| {
                Box::pin(async { Err(ExchangeError::general("handler blew up")) })
            }),
        );

        let response = executor
            .process(inbound_call("broken", None, json!({})))
            .await;

        assert_eq!(response.is_successful, Some(false));
        let exception = response.exception.unwrap();
        assert_eq!(exception.code, ErrorCode::GeneralError);
        assert!(exception.message.contains("handler blew up"));
    }

    #[tokio::test]
    async fn test_on_message_dispatches_response() {
        let routing = FakeRouting::new();
        let executor = ServiceExecutor::new(routing.clone(), Duration::from_secs(5));
        executor.add_service_handler(ServiceDefinition::new("echo"), echo_handler());

        let call = inbound_call("echo", None, json!({"x": 2}));
        executor.on_message(call.clone()).await;

        let responses = routing.responses.lock();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].message_id(), call.message_id());
        assert_eq!(responses[0].is_successful, Some(true));
    }

    #[tokio::test]
    async fn test_registered_definitions_cover_all_versions() {
        let executor = executor();
        executor.add_service_handler(
            ServiceDefinition::new("a").with_version("1.0.0"),
            echo_handler(),
        );
        executor.add_service_handler(
            ServiceDefinition::new("a").with_version("2.0.0"),
            echo_handler(),
        );
        executor.add_service_handler(ServiceDefinition::new("b"), echo_handler());

        let definitions = executor.registered_definitions();
        assert_eq!(definitions.len(), 3);
        assert!(executor.has_service("a"));
        assert_eq!(executor.service_count(), 2);
    }
}
