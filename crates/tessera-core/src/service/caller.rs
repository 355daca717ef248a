//! Outbound call correlation.
//!
//! Each dispatched request parks a completion in the pending-call table
//! keyed by message id. The first of {matching response, per-call deadline}
//! claims the entry; the loser is a no-op. Claiming happens through the
//! table's atomic remove, which is what makes completion at-most-once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{ErrorCode, ExchangeError, ServiceCallResult};
use crate::exchange::MessageObserver;
use crate::message::{MessageNode, ServiceAddress, ServiceCall, ServiceExecContext};
use crate::service::{MessageRouting, RegistryGate};

struct PendingCall {
    completion: oneshot::Sender<ServiceCall>,
}

/// Issues service calls and resolves them exactly once.
pub struct ServiceCaller {
    routing: Arc<dyn MessageRouting>,
    registry: Arc<dyn RegistryGate>,
    pending: DashMap<String, PendingCall>,
    identity: MessageNode,
    execution_timeout: Duration,
}

impl ServiceCaller {
    /// Create a caller for the instance identified by `identity`.
    pub fn new(
        routing: Arc<dyn MessageRouting>,
        registry: Arc<dyn RegistryGate>,
        identity: MessageNode,
        execution_timeout: Duration,
    ) -> Self {
        Self {
            routing,
            registry,
            pending: DashMap::new(),
            identity,
            execution_timeout,
        }
    }

    /// Number of calls awaiting completion.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Build the envelope for a call issued by this instance.
    pub fn prepare_call(
        &self,
        address: ServiceAddress,
        params: Value,
        context: &ServiceExecContext,
    ) -> ServiceCall {
        ServiceCall::prepare(address, params, self.identity.clone(), context)
    }

    /// Issue a service call and wait for its completion.
    ///
    /// Always resolves; failures come back as a [`ServiceCallResult`] with
    /// `is_successful == false`.
    pub async fn execute_service_call(
        &self,
        address: ServiceAddress,
        params: Value,
        context: ServiceExecContext,
    ) -> ServiceCallResult {
        let call = self.prepare_call(address, params, &context);
        self.execute_prepared(call).await
    }

    /// Issue an already-prepared envelope and wait for its completion.
    pub async fn execute_prepared(&self, call: ServiceCall) -> ServiceCallResult {
        match self.try_execute(call).await {
            Ok(result) => result,
            Err(e) => ServiceCallResult::failure(&e),
        }
    }

    async fn try_execute(&self, call: ServiceCall) -> Result<ServiceCallResult, ExchangeError> {
        let address = &call.service_address;
        if !self
            .registry
            .is_registered(&address.service_domain_name, &address.service_alias)
            .await?
        {
            return Err(ExchangeError::new(
                ErrorCode::ServiceNotRegistered,
                format!(
                    "service {} is not registered in domain {}",
                    address.service_alias, address.service_domain_name
                ),
            ));
        }

        let message_id = call.message_id().to_string();
        let (completion, mut response) = oneshot::channel();
        self.pending
            .insert(message_id.clone(), PendingCall { completion });

        if let Err(e) = self.routing.dispatch_request(&call).await {
            self.pending.remove(&message_id);
            return Err(e);
        }

        let deadline = tokio::time::sleep(self.execution_timeout);
        tokio::pin!(deadline);

        let completed = tokio::select! {
            outcome = &mut response => outcome.ok(),
            _ = &mut deadline => {
                if self.pending.remove(&message_id).is_some() {
                    return Err(ExchangeError::new(
                        ErrorCode::ServiceExecTimeout,
                        format!("service call {} exceeded its execution deadline", message_id),
                    ));
                }
                // The response claimed the entry between the deadline firing
                // and this check; its completion is already on the channel.
                response.await.ok()
            }
        };

        match completed {
            Some(response) => Ok(Self::result_from(response)),
            None => Err(ExchangeError::general(
                "service call completion channel closed",
            )),
        }
    }

    fn result_from(response: ServiceCall) -> ServiceCallResult {
        let payload = match response.message.payload {
            Value::Null => None,
            payload => Some(payload),
        };
        ServiceCallResult {
            is_successful: response.is_successful.unwrap_or(true),
            exception: response.exception,
            payload,
        }
    }
}

#[async_trait]
impl MessageObserver for ServiceCaller {
    async fn on_message(&self, mut call: ServiceCall) {
        let Some((_, entry)) = self.pending.remove(call.message_id()) else {
            debug!(
                message_id = %call.message_id(),
                "no pending call for response, likely completed by timeout"
            );
            return;
        };
        call.is_completed = true;
        call.finish();
        if entry.completion.send(call).is_err() {
            debug!("pending call waiter went away before completion");
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::error::ExchangeResult;

    /// Routing fake that records requests and can auto-complete them.
    struct FakeRouting {
        sent: Mutex<Vec<ServiceCall>>,
        fail_sends: Mutex<u32>,
    }

    impl FakeRouting {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                fail_sends: Mutex::new(0),
            })
        }

        fn failing(times: u32) -> Arc<Self> {
            let routing = Self::new();
            *routing.fail_sends.lock() = times;
            routing
        }
    }

    #[async_trait]
    impl MessageRouting for FakeRouting {
        async fn dispatch_request(&self, call: &ServiceCall) -> ExchangeResult<String> {
            let mut failures = self.fail_sends.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(ExchangeError::new(
                    ErrorCode::MessageExchangeBroken,
                    "send failed",
                ));
            }
            self.sent.lock().push(call.clone());
            Ok(call.message_id().to_string())
        }

        async fn dispatch_response(&self, _call: &ServiceCall) -> ExchangeResult<()> {
            Ok(())
        }
    }

    struct OpenGate;

    #[async_trait]
    impl RegistryGate for OpenGate {
        async fn is_registered(&self, _domain: &str, _alias: &str) -> ExchangeResult<bool> {
            Ok(true)
        }
    }

    struct ClosedGate;

    #[async_trait]
    impl RegistryGate for ClosedGate {
        async fn is_registered(&self, _domain: &str, _alias: &str) -> ExchangeResult<bool> {
            Ok(false)
        }
    }

    fn caller_with(
        routing: Arc<dyn MessageRouting>,
        registry: Arc<dyn RegistryGate>,
        timeout: Duration,
    ) -> Arc<ServiceCaller> {
        Arc::new(ServiceCaller::new(
            routing,
            registry,
            MessageNode::instance("i-a", "d-a"),
            timeout,
        ))
    }

    fn respond(call: &ServiceCall, payload: Value) -> ServiceCall {
        let mut response = call.clone();
        response.is_successful = Some(true);
        response.message.payload = payload;
        response
    }

    #[tokio::test]
    async fn test_happy_path_resolves_with_payload() {
        let routing = FakeRouting::new();
        let caller = caller_with(
            routing.clone(),
            Arc::new(OpenGate),
            Duration::from_secs(5),
        );

        let pending = caller.clone();
        let observer_routing = routing.clone();
        let call_task = tokio::spawn({
            let caller = caller.clone();
            async move {
                caller
                    .execute_service_call(
                        ServiceAddress::new("d-b", "echo"),
                        json!({"x": 1}),
                        ServiceExecContext::new(),
                    )
                    .await
            }
        });

        // wait until the request is on the wire, then deliver the response
        while observer_routing.sent.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let sent = observer_routing.sent.lock()[0].clone();
        pending.on_message(respond(&sent, json!({"y": 2}))).await;

        let result = call_task.await.unwrap();
        assert!(result.is_successful);
        assert_eq!(result.payload, Some(json!({"y": 2})));
        assert_eq!(caller.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_resolves_with_exec_timeout() {
        let caller = caller_with(
            FakeRouting::new(),
            Arc::new(OpenGate),
            Duration::from_millis(500),
        );

        let result = caller
            .execute_service_call(
                ServiceAddress::new("d-b", "slow"),
                json!({}),
                ServiceExecContext::new(),
            )
            .await;

        assert!(!result.is_successful);
        assert_eq!(
            result.exception_code(),
            Some(ErrorCode::ServiceExecTimeout)
        );
        assert!(result.payload.is_none());
        assert_eq!(caller.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unregistered_service_fails_before_any_send() {
        let routing = FakeRouting::new();
        let caller = caller_with(
            routing.clone(),
            Arc::new(ClosedGate),
            Duration::from_secs(5),
        );

        let result = caller
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
        assert!(routing.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failed_dispatch_cleans_pending_entry() {
        let caller = caller_with(
            FakeRouting::failing(u32::MAX),
            Arc::new(OpenGate),
            Duration::from_secs(5),
        );

        let result = caller
            .execute_service_call(
                ServiceAddress::new("d-b", "echo"),
                json!({}),
                ServiceExecContext::new(),
            )
            .await;

        assert!(!result.is_successful);
        assert_eq!(
            result.exception_code(),
            Some(ErrorCode::MessageExchangeBroken)
        );
        assert_eq!(caller.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_late_response_after_timeout_is_dropped() {
        let routing = FakeRouting::new();
        let caller = caller_with(
            routing.clone(),
            Arc::new(OpenGate),
            Duration::from_millis(50),
        );

        let result = caller
            .execute_service_call(
                ServiceAddress::new("d-b", "slow"),
                json!({}),
                ServiceExecContext::new(),
            )
            .await;
        assert_eq!(
            result.exception_code(),
            Some(ErrorCode::ServiceExecTimeout)
        );

        // the response shows up late; nothing blows up, nothing completes
        let sent = routing.sent.lock()[0].clone();
        caller.on_message(respond(&sent, json!(1))).await;
        assert_eq!(caller.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_response_marks_completion_bookkeeping() {
        let routing = FakeRouting::new();
        let caller = caller_with(
            routing.clone(),
            Arc::new(OpenGate),
            Duration::from_secs(5),
        );

        let handle = tokio::spawn({
            let caller = caller.clone();
            async move {
                caller
                    .execute_service_call(
                        ServiceAddress::new("d-b", "echo"),
                        json!({}),
                        ServiceExecContext::new(),
                    )
                    .await
            }
        });
        while routing.sent.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let sent = routing.sent.lock()[0].clone();
        assert!(!sent.is_completed);
        caller.on_message(respond(&sent, Value::Null)).await;

        let result = handle.await.unwrap();
        assert!(result.is_successful);
        assert!(result.payload.is_none());
    }
}
