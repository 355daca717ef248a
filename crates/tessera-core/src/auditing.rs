//! Console auditing sink.
//!
//! Structured logging for the whole instance: a fmt subscriber whose
//! minimum level comes from configuration (`AUDITING_LOG_MIN_LEVEL`), with
//! an optional line-delimited JSON mode for machine consumption.

use tracing_subscriber::EnvFilter;

use crate::config::AuditingSettings;

/// Install the global auditing subscriber.
///
/// Safe to call more than once; later calls leave the existing subscriber
/// in place (tests initialize eagerly and in any order).
pub fn initialize(settings: &AuditingSettings) {
    let filter = EnvFilter::try_new(&settings.min_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = if settings.json_output {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init()
    };

    if installed.is_ok() {
        tracing::debug!(
            min_level = %settings.min_level,
            json = settings.json_output,
            "auditing sink installed"
        );
    }
}
