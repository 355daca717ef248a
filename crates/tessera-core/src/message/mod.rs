//! Message envelopes and the service call data model
//!
//! A [`Message`] is the transport envelope; a [`ServiceCall`] specializes it
//! with addressing, parameters and result fields. Envelopes are explicitly
//! acyclic: payloads are JSON values, and a payload travelling through the
//! broker is replaced by the string key of its payload-store entry (the
//! "lightweight" form).

pub mod hash;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ExceptionInfo;

/// One endpoint of a message: an instance (optional) within a routed domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageNode {
    /// Identifier of the concrete process, when one is pinned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// The service domain name used for routing.
    pub route: String,
}

impl MessageNode {
    /// A node pinned to a concrete instance.
    pub fn instance(instance_id: impl Into<String>, route: impl Into<String>) -> Self {
        Self {
            instance_id: Some(instance_id.into()),
            route: route.into(),
        }
    }

    /// A node addressing a whole domain.
    pub fn domain(route: impl Into<String>) -> Self {
        Self {
            instance_id: None,
            route: route.into(),
        }
    }
}

/// The transport envelope shared by every message on the substrate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique identity of this message for its lifetime.
    pub message_id: String,
    /// Identity of the call tree this message belongs to.
    pub chain_id: String,
    /// Depth in the call tree; the root is 0.
    pub chain_level: u32,
    /// `message_id` of the predecessor in the tree, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predecessor: Option<String>,
    /// The sending endpoint.
    pub source: MessageNode,
    /// The receiving endpoint.
    pub destination: MessageNode,
    /// Creation instant.
    pub created_on: DateTime<Utc>,
    /// Completion instant, set by whoever finishes the message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_on: Option<DateTime<Utc>>,
    /// Wall-clock execution time in milliseconds, set on completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<i64>,
    /// The message body. On the wire this is the payload-store key.
    pub payload: Value,
    /// Keyed hash over the canonicalized envelope, when hashing is enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// Address of a business service: domain, alias and optional version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAddress {
    /// Domain serving the alias.
    pub service_domain_name: String,
    /// Stable name of the service within the domain.
    pub service_alias: String,
    /// Requested version; the latest registered wins when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_version: Option<String>,
}

impl ServiceAddress {
    /// Address the latest version of an alias in a domain.
    pub fn new(domain: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            service_domain_name: domain.into(),
            service_alias: alias.into(),
            service_version: None,
        }
    }

    /// Pin the address to a specific version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = Some(version.into());
        self
    }
}

/// Registration record for one service handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDefinition {
    /// Stable name of the service within its domain.
    pub service_alias: String,
    /// Version this definition registers. Treated as the latest when the
    /// caller does not pin one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_version: Option<String>,
    /// Source file the handler was loaded from, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_file: Option<String>,
    /// Whether the access verifier must approve calls to this service.
    #[serde(default)]
    pub auth_required: bool,
    /// Provider-specific registration attributes.
    #[serde(flatten)]
    pub attributes: serde_json::Map<String, Value>,
}

impl ServiceDefinition {
    /// Define a service by alias with defaults for everything else.
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            service_alias: alias.into(),
            service_version: None,
            service_file: None,
            auth_required: false,
            attributes: serde_json::Map::new(),
        }
    }

    /// Set the version this definition registers.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = Some(version.into());
        self
    }

    /// Require access verification for this service.
    pub fn with_auth_required(mut self) -> Self {
        self.auth_required = true;
        self
    }
}

/// Context a caller supplies when issuing a service call.
///
/// Carrying the incoming call of the current handler here is what extends a
/// call chain instead of starting a new one.
#[derive(Debug, Clone, Default)]
pub struct ServiceExecContext {
    /// Opaque authentication token, propagated along the chain.
    pub auth_token: Option<Value>,
    /// The call being served when this one is issued from inside a handler.
    pub previous_service_call: Option<Box<ServiceCall>>,
}

impl ServiceExecContext {
    /// Context for a fresh root call.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an authentication token.
    pub fn with_auth_token(mut self, token: Value) -> Self {
        self.auth_token = Some(token);
        self
    }

    /// Derive the context from the call currently being served.
    pub fn from_previous(previous: ServiceCall) -> Self {
        Self {
            auth_token: previous.auth_token.clone(),
            previous_service_call: Some(Box::new(previous)),
        }
    }
}

/// A request/response envelope for one business service invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCall {
    /// The transport envelope.
    #[serde(flatten)]
    pub message: Message,
    /// Opaque authentication token, propagated along the chain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<Value>,
    /// The service being invoked.
    pub service_address: ServiceAddress,
    /// Named parameters handed to the handler.
    pub service_params: Value,
    /// Whether the caller has observed completion.
    pub is_completed: bool,
    /// Whether the provider reported success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_successful: Option<bool>,
    /// Failure description populated by the provider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<ExceptionInfo>,
    /// Message ids of nested calls issued while serving this one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub successors: Option<Vec<String>>,
}

impl ServiceCall {
    /// Build the envelope for a new outbound call.
    ///
    /// Chain fields derive from `context`: with a previous call present the
    /// new envelope inherits its `chain_id`, sits one level deeper and names
    /// it as predecessor; otherwise a fresh chain starts at level 0.
    pub fn prepare(
        address: ServiceAddress,
        params: Value,
        source: MessageNode,
        context: &ServiceExecContext,
    ) -> Self {
        let (chain_id, chain_level, predecessor) = match &context.previous_service_call {
            Some(previous) => (
                previous.message.chain_id.clone(),
                previous.message.chain_level + 1,
                Some(previous.message.message_id.clone()),
            ),
            None => (Uuid::new_v4().to_string(), 0, None),
        };

        let auth_token = context.auth_token.clone().or_else(|| {
            context
                .previous_service_call
                .as_ref()
                .and_then(|previous| previous.auth_token.clone())
        });

        Self {
            message: Message {
                message_id: Uuid::new_v4().to_string(),
                chain_id,
                chain_level,
                predecessor,
                source,
                destination: MessageNode::domain(address.service_domain_name.clone()),
                created_on: Utc::now(),
                finished_on: None,
                execution_time: None,
                payload: Value::Null,
                hash: None,
            },
            auth_token,
            service_address: address,
            service_params: params,
            is_completed: false,
            is_successful: None,
            exception: None,
            successors: None,
        }
    }

    /// The unique message identity.
    pub fn message_id(&self) -> &str {
        &self.message.message_id
    }

    /// A transport clone with the payload replaced by its store key and any
    /// stale hash dropped.
    pub fn lightweight(&self, store_key: impl Into<String>) -> Self {
        let mut light = self.clone();
        light.message.payload = Value::String(store_key.into());
        light.message.hash = None;
        light
    }

    /// Record a nested call issued while serving this one.
    pub fn record_successor(&mut self, message_id: impl Into<String>) {
        self.successors
            .get_or_insert_with(Vec::new)
            .push(message_id.into());
    }

    /// Stamp completion bookkeeping: `finished_on` now and the resulting
    /// execution time relative to `created_on`.
    pub fn finish(&mut self) {
        let now = Utc::now();
        self.message.execution_time =
            Some((now - self.message.created_on).num_milliseconds());
        self.message.finished_on = Some(now);
    }

    /// The wire form of this envelope.
    pub fn to_wire(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Parse an envelope from its wire form.
    pub fn from_wire(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}
