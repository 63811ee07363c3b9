//! Configuration validation.

use crate::{Config, ConfigError};

/// Reject configurations that would misbehave at runtime.
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.server.worker_threads == 0 {
        return Err(ConfigError::Invalid("server.worker_threads must be at least 1".to_string()));
    }

    if config.datastore.backend != "memory" {
        return Err(ConfigError::Invalid(format!(
            "unknown datastore backend `{}`",
            config.datastore.backend
        )));
    }

    if config.datastore.gc_enabled {
        if config.datastore.gc_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "datastore.gc_interval_secs must be positive when GC is enabled".to_string(),
            ));
        }
        if config.datastore.gc_batch_delete_size == 0 {
            return Err(ConfigError::Invalid(
                "datastore.gc_batch_delete_size must be positive".to_string(),
            ));
        }
    }

    if config.dispatch.member_id.is_empty() {
        return Err(ConfigError::Invalid("dispatch.member_id must not be empty".to_string()));
    }
    if config.dispatch.replication_factor == 0 {
        return Err(ConfigError::Invalid(
            "dispatch.replication_factor must be at least 1".to_string(),
        ));
    }
    if config.dispatch.max_depth == 0 {
        return Err(ConfigError::Invalid("dispatch.max_depth must be at least 1".to_string()));
    }

    for peer in &config.dispatch.peers {
        if !peer.contains('=') {
            return Err(ConfigError::Invalid(format!(
                "dispatch.peers entries take the form `id=host:port`, got `{peer}`"
            )));
        }
    }

    match config.observability.log_format.as_str() {
        "pretty" | "compact" | "json" => {}
        other => {
            return Err(ConfigError::Invalid(format!("unknown log format `{other}`")));
        }
    }

    Ok(())
}
