//! Service registry gate.
//!
//! Each domain advertises its callable services as members of a set at
//! `<registry address><domain>`. Callers check membership before any queue
//! write; providers publish their definitions at startup. Individual
//! registration failures are logged and skipped so one bad definition does
//! not keep the rest of the provider offline; only the summary surfaces.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::cache::SystemCache;
use crate::error::ExchangeResult;
use crate::message::ServiceDefinition;
use crate::service::RegistryGate;

/// Outcome of a bulk service registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationSummary {
    /// Definitions offered for registration.
    pub attempted: usize,
    /// Definitions actually registered.
    pub registered: usize,
}

impl RegistrationSummary {
    /// Whether every offered definition registered.
    pub fn is_complete(&self) -> bool {
        self.registered == self.attempted
    }
}

/// Publishes and verifies service registrations through the system cache.
pub struct ServiceRegistry {
    cache: Arc<SystemCache>,
    registry_address: String,
}

impl ServiceRegistry {
    /// Create a registry rooted at the configured address prefix.
    pub fn new(cache: Arc<SystemCache>, registry_address: impl Into<String>) -> Self {
        Self {
            cache,
            registry_address: registry_address.into(),
        }
    }

    fn registry_key(&self, domain: &str) -> String {
        format!("{}{}", self.registry_address, domain)
    }

    /// Publish a provider's definitions into its domain's registry set,
    /// continuing past individual failures.
    pub async fn register_services(
        &self,
        domain: &str,
        definitions: &[ServiceDefinition],
    ) -> RegistrationSummary {
        let key = self.registry_key(domain);
        let mut registered = 0usize;
        for definition in definitions {
            match self
                .cache
                .add_set_members(&key, &[definition.service_alias.clone()])
                .await
            {
                Ok(_) => registered += 1,
                Err(e) => {
                    warn!(
                        alias = %definition.service_alias,
                        domain,
                        error = %e,
                        "service registration failed, continuing"
                    );
                }
            }
        }
        let summary = RegistrationSummary {
            attempted: definitions.len(),
            registered,
        };
        info!(
            domain,
            registered = summary.registered,
            attempted = summary.attempted,
            "service registration finished"
        );
        summary
    }

    /// Every alias registered in a domain.
    pub async fn registered_aliases(&self, domain: &str) -> ExchangeResult<Vec<String>> {
        self.cache.set_members(&self.registry_key(domain)).await
    }

    /// Union of aliases registered across several domains.
    pub async fn registered_aliases_across(
        &self,
        domains: &[String],
    ) -> ExchangeResult<Vec<String>> {
        let keys: Vec<String> = domains.iter().map(|d| self.registry_key(d)).collect();
        self.cache.union_sets(&keys).await
    }
}

#[async_trait]
impl RegistryGate for ServiceRegistry {
    async fn is_registered(&self, domain: &str, alias: &str) -> ExchangeResult<bool> {
        self.cache
            .is_set_member(&self.registry_key(domain), alias)
            .await
    }
}
