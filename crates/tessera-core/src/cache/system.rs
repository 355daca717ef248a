//! System cache
//!
//! A broader key/value, set, hash and JSON facade over the broker for
//! application state outside the messaging pipeline. Every operation is
//! gated by an `is_operational` flag driven by connection lifecycle events,
//! so callers fail fast instead of piling onto a dead connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::broker::{BrokerClient, ConnectionObserver};
use crate::error::{ErrorCode, ExchangeError, ExchangeResult};

/// Key/value, set, hash and JSON operations gated by connection health.
pub struct SystemCache {
    broker: Arc<BrokerClient>,
    operational: AtomicBool,
}

impl SystemCache {
    /// Create the facade over an owned broker client. The cache becomes
    /// operational when the connection reports ready.
    pub fn new(broker: Arc<BrokerClient>) -> Self {
        let operational = AtomicBool::new(broker.is_ready());
        Self {
            broker,
            operational,
        }
    }

    /// Whether operations are currently accepted.
    pub fn is_operational(&self) -> bool {
        self.operational.load(Ordering::Acquire)
    }

    fn ensure_operational(&self) -> ExchangeResult<()> {
        if self.is_operational() {
            Ok(())
        } else {
            Err(ExchangeError::new(
                ErrorCode::SystemCacheUnavailable,
                "system cache connection is not operational",
            ))
        }
    }

    /// Store a JSON value under a key with an optional TTL.
    pub async fn set_value(
        &self,
        key: &str,
        value: &Value,
        ttl: Option<Duration>,
    ) -> ExchangeResult<()> {
        self.ensure_operational()?;
        let raw = serde_json::to_string(value)?;
        self.broker.set_value(key, &raw, ttl).await
    }

    /// Load a JSON value by key.
    pub async fn get_value(&self, key: &str) -> ExchangeResult<Option<Value>> {
        self.ensure_operational()?;
        match self.broker.get_value(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Delete a key; true when it existed.
    pub async fn delete_value(&self, key: &str) -> ExchangeResult<bool> {
        self.ensure_operational()?;
        self.broker.delete_value(key).await
    }

    /// Apply a TTL to a key, or to a single hash field when `field` is
    /// given. Hash-field expiry requires server support and is gated by
    /// feature detection.
    pub async fn expire_value(
        &self,
        key: &str,
        ttl: Duration,
        field: Option<&str>,
    ) -> ExchangeResult<bool> {
        self.ensure_operational()?;
        match field {
            None => self.broker.expire_value(key, ttl).await,
            Some(field) => {
                if !self.broker.server_info().supports_hash_field_expiry() {
                    return Err(ExchangeError::general(
                        "broker server does not support hash field expiry",
                    ));
                }
                self.broker.expire_hash_field(key, field, ttl).await
            }
        }
    }

    /// Add members to a set; returns how many were new.
    pub async fn add_set_members(&self, key: &str, members: &[String]) -> ExchangeResult<u64> {
        self.ensure_operational()?;
        self.broker.add_set_members(key, members).await
    }

    /// Set membership test.
    pub async fn is_set_member(&self, key: &str, member: &str) -> ExchangeResult<bool> {
        self.ensure_operational()?;
        self.broker.is_set_member(key, member).await
    }

    /// All members of a set.
    pub async fn set_members(&self, key: &str) -> ExchangeResult<Vec<String>> {
        self.ensure_operational()?;
        self.broker.set_members(key).await
    }

    /// Union of several sets.
    pub async fn union_sets(&self, keys: &[String]) -> ExchangeResult<Vec<String>> {
        self.ensure_operational()?;
        self.broker.union_sets(keys).await
    }

    /// Store a JSON value in a hash field.
    pub async fn set_hash_field(
        &self,
        key: &str,
        field: &str,
        value: &Value,
    ) -> ExchangeResult<()> {
        self.ensure_operational()?;
        let raw = serde_json::to_string(value)?;
        self.broker.set_hash_field(key, field, &raw).await
    }

    /// Load a JSON value from a hash field.
    pub async fn get_hash_field(&self, key: &str, field: &str) -> ExchangeResult<Option<Value>> {
        self.ensure_operational()?;
        match self.broker.get_hash_field(key, field).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Delete a hash field; true when it existed.
    pub async fn delete_hash_field(&self, key: &str, field: &str) -> ExchangeResult<bool> {
        self.ensure_operational()?;
        self.broker.delete_hash_field(key, field).await
    }

    /// Store a JSON document server-side. Requires the server to advertise
    /// JSON document commands.
    pub async fn set_json_document(
        &self,
        key: &str,
        path: &str,
        document: &Value,
    ) -> ExchangeResult<()> {
        self.ensure_operational()?;
        if !self.broker.is_json_supported() {
            return Err(ExchangeError::general(
                "broker server does not support JSON documents",
            ));
        }
        let raw = serde_json::to_string(document)?;
        self.broker.set_json_document(key, path, &raw).await
    }

    /// Load a JSON document server-side.
    pub async fn get_json_document(
        &self,
        key: &str,
        path: &str,
    ) -> ExchangeResult<Option<Value>> {
        self.ensure_operational()?;
        if !self.broker.is_json_supported() {
            return Err(ExchangeError::general(
                "broker server does not support JSON documents",
            ));
        }
        match self.broker.get_json_document(key, path).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

impl ConnectionObserver for SystemCache {
    fn on_connection_recovered(&self, identifier: &str) {
        if identifier == self.broker.identifier() {
            self.operational.store(true, Ordering::Release);
        }
    }

    fn on_connection_disrupted(&self, identifier: &str) {
        if identifier == self.broker.identifier() {
            self.operational.store(false, Ordering::Release);
        }
    }

    fn on_connection_lost(&self, identifier: &str) {
        if identifier == self.broker.identifier() {
            self.operational.store(false, Ordering::Release);
        }
    }
}
