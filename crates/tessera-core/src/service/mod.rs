//! Service calling, execution and registration
//!
//! The consumer side ([`ServiceCaller`]) correlates outbound requests with
//! their responses through a pending-call table; the provider side
//! ([`ServiceExecutor`]) dispatches inbound requests to registered handlers.
//! Both reach the pipelines through the [`MessageRouting`] capability and
//! the registry through [`RegistryGate`], so either end can be exercised
//! against fakes.

pub mod caller;
pub mod executor;
pub mod registry;

pub use caller::ServiceCaller;
pub use executor::{
    AccessVerifier, AllowAllVerifier, HandlerContext, ServiceExecutor, ServiceHandler,
};
pub use registry::{RegistrationSummary, ServiceRegistry};

use async_trait::async_trait;

use crate::error::ExchangeResult;
use crate::exchange::MessageDispatcher;
use crate::message::ServiceCall;

/// Capability of moving envelopes into the outbound pipelines.
#[async_trait]
pub trait MessageRouting: Send + Sync {
    /// Dispatch a request; returns the message id on delivery.
    async fn dispatch_request(&self, call: &ServiceCall) -> ExchangeResult<String>;

    /// Dispatch a response back to the requesting instance.
    async fn dispatch_response(&self, call: &ServiceCall) -> ExchangeResult<()>;
}

#[async_trait]
impl MessageRouting for MessageDispatcher {
    async fn dispatch_request(&self, call: &ServiceCall) -> ExchangeResult<String> {
        self.send_request(call).await
    }

    async fn dispatch_response(&self, call: &ServiceCall) -> ExchangeResult<()> {
        self.send_response(call).await
    }
}

/// Capability of answering whether a service is registered in a domain.
#[async_trait]
pub trait RegistryGate: Send + Sync {
    /// Whether `alias` is a member of `domain`'s registry set.
    async fn is_registered(&self, domain: &str, alias: &str) -> ExchangeResult<bool>;
}
