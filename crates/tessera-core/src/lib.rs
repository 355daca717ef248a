//! # Tessera Core
//!
//! Asynchronous request/response messaging for cooperating service
//! instances over a shared queue substrate.
//!
//! Each instance participates as a consumer (issues calls), a provider
//! (serves calls), or both. Requests travel to a domain's pending queue;
//! responses return to the issuing instance's processed queue. Delivery is
//! at-least-once on the wire with at-most-once completion at the caller,
//! and envelope integrity is protected by a keyed hash.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tessera_core::config::Config;
//! use tessera_core::instance::{InstanceRole, ServiceInstance};
//! use tessera_core::message::ServiceDefinition;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let instance = ServiceInstance::new(Config::load()?, InstanceRole::Full);
//!     instance.register_service(
//!         ServiceDefinition::new("echo"),
//!         Arc::new(|_definition, params, _context| {
//!             Box::pin(async move { Ok(params) })
//!         }),
//!     );
//!     instance.start().await?;
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]

/// Console auditing sink
pub mod auditing;

/// Broker client and connection observation
pub mod broker;

/// Cache facades over the broker
pub mod cache;

/// Instance configuration
pub mod config;

/// Error taxonomy and call results
pub mod error;

/// Message exchange pipelines
pub mod exchange;

/// Service instance composition
pub mod instance;

/// Message envelopes and hashing
pub mod message;

/// Bounded retry policies
pub mod retry;

/// Service calling, execution and registration
pub mod service;

/// Graceful shutdown coordination
pub mod shutdown;

// ============================================================================
// Re-exported dependencies
// ============================================================================
// These re-exports allow consumers to use common dependencies without adding
// them explicitly to their Cargo.toml. This ensures version consistency and
// reduces boilerplate in downstream crates.

/// Re-export async_trait for implementing the observer and capability traits
pub use async_trait;
/// Re-export redis for direct broker access through the escape hatches
pub use redis;
/// Re-export serde_json for envelope payloads
pub use serde_json;

/// The commonly-used surface in one import.
pub mod prelude {
    pub use crate::broker::{BrokerClient, ConnectionObserver};
    pub use crate::cache::{ExchangeCache, MemoryExchangeCache, MessageCache, SystemCache};
    pub use crate::config::Config;
    pub use crate::error::{ErrorCode, ExchangeError, ExchangeResult, ServiceCallResult};
    pub use crate::exchange::{MessageDispatcher, MessageExchange, MessageObserver};
    pub use crate::instance::{InstanceRole, ServiceInstance};
    pub use crate::message::{
        Message, MessageNode, ServiceAddress, ServiceCall, ServiceDefinition, ServiceExecContext,
    };
    pub use crate::retry::RetryPolicy;
    pub use crate::service::{
        AccessVerifier, HandlerContext, ServiceCaller, ServiceExecutor, ServiceHandler,
        ServiceRegistry,
    };
    pub use crate::shutdown::{GracefulShutdown, ShutdownSignal};
}
