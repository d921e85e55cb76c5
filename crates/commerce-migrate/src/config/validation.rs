//! Configuration validation.

use super::{Config, StagingBackendKind};
use crate::error::{MigrateError, Result};
use tracing::warn;

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Source validation
    if config.source.base_url.trim().is_empty() {
        return Err(MigrateError::Config("source.base_url is required".into()));
    }
    if config.source.page_base < 0 {
        return Err(MigrateError::Config(
            "source.page_base must not be negative".into(),
        ));
    }

    // Destination validation
    if config.destination.shop_domain.trim().is_empty() {
        return Err(MigrateError::Config(
            "destination.shop_domain is required".into(),
        ));
    }

    for (name, rps) in [
        ("source", config.source.requests_per_second),
        ("destination", config.destination.requests_per_second),
    ] {
        if !rps.is_finite() || rps < 0.0 {
            return Err(MigrateError::Config(format!(
                "{}.requests_per_second must be zero or positive",
                name
            )));
        }
    }

    // Staging validation
    match config.staging.backend {
        StagingBackendKind::Sqlite => {
            if config.staging.path.is_empty() {
                return Err(MigrateError::Config(
                    "staging.path is required for the sqlite backend".into(),
                ));
            }
        }
        StagingBackendKind::Postgres => {
            if config.staging.host.is_empty() {
                return Err(MigrateError::Config("staging.host is required".into()));
            }
            if config.staging.database.is_empty() {
                return Err(MigrateError::Config(
                    "staging.database is required".into(),
                ));
            }
            if config.staging.user.is_empty() {
                return Err(MigrateError::Config("staging.user is required".into()));
            }
        }
    }
    if config.staging.max_connections == 0 {
        return Err(MigrateError::Config(
            "staging.max_connections must be at least 1".into(),
        ));
    }

    // Batch sizes
    if config.collection.batch_size == 0 {
        return Err(MigrateError::Config(
            "collection.batch_size must be at least 1".into(),
        ));
    }
    if !(500..=1000).contains(&config.collection.batch_size) {
        warn!(
            "collection.batch_size={} is outside the recommended 500-1000 range",
            config.collection.batch_size
        );
    }
    if config.migration.batch_size == 0 {
        return Err(MigrateError::Config(
            "migration.batch_size must be at least 1".into(),
        ));
    }
    if !(25..=50).contains(&config.migration.batch_size) {
        warn!(
            "migration.batch_size={} is outside the recommended 25-50 range",
            config.migration.batch_size
        );
    }
    if config.migration.workers == 0 {
        return Err(MigrateError::Config(
            "migration.workers must be at least 1".into(),
        ));
    }

    let tag = config.migration.provenance_tag.trim();
    if tag.is_empty() || tag.contains(',') {
        return Err(MigrateError::Config(
            "migration.provenance_tag must be non-empty and contain no commas".into(),
        ));
    }
    if let Some(ratio) = config.migration.max_failure_ratio {
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(MigrateError::Config(
                "migration.max_failure_ratio must be in (0, 1]".into(),
            ));
        }
    }

    if config.retry.max_attempts == 0 {
        return Err(MigrateError::Config(
            "retry.max_attempts must be at least 1".into(),
        ));
    }
    if config.retry.request_timeout_secs == 0 {
        return Err(MigrateError::Config(
            "retry.request_timeout_secs must be at least 1".into(),
        ));
    }

    Ok(())
}
