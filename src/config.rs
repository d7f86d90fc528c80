use crate::error::{ConductorError, Result};
use serde::{Deserialize, Serialize};

/// Engine-wide configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConductorConfig {
    pub execution: ExecutionConfig,
    pub backoff: BackoffConfig,
    pub lease: LeaseConfig,
    pub events: EventConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Per-attempt timeout applied when a step declares none
    pub default_timeout_ms: u64,
    /// Result payloads beyond this size are replaced with a summary
    pub max_result_bytes: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            max_result_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Seed for jittered strategies; `None` seeds from entropy
    pub jitter_seed: Option<u64>,
    /// Multiplier for the exponential strategy
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            jitter_seed: None,
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Lease TTL; a worker holding a step longer must renew
    pub ttl_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self { ttl_ms: 30_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    pub channel_capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1000,
        }
    }
}

impl ConductorConfig {
    /// Build configuration from `CONDUCTOR_*` environment variables,
    /// falling back to defaults for anything unset
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(timeout) = std::env::var("CONDUCTOR_DEFAULT_TIMEOUT_MS") {
            config.execution.default_timeout_ms = timeout.parse().map_err(|e| {
                ConductorError::ConfigurationError(format!("Invalid default_timeout_ms: {e}"))
            })?;
        }
        if let Ok(max_bytes) = std::env::var("CONDUCTOR_MAX_RESULT_BYTES") {
            config.execution.max_result_bytes = max_bytes.parse().map_err(|e| {
                ConductorError::ConfigurationError(format!("Invalid max_result_bytes: {e}"))
            })?;
        }
        if let Ok(ttl) = std::env::var("CONDUCTOR_LEASE_TTL_MS") {
            config.lease.ttl_ms = ttl.parse().map_err(|e| {
                ConductorError::ConfigurationError(format!("Invalid lease ttl_ms: {e}"))
            })?;
        }
        if let Ok(seed) = std::env::var("CONDUCTOR_JITTER_SEED") {
            config.backoff.jitter_seed = Some(seed.parse().map_err(|e| {
                ConductorError::ConfigurationError(format!("Invalid jitter_seed: {e}"))
            })?);
        }
        if let Ok(capacity) = std::env::var("CONDUCTOR_EVENT_CAPACITY") {
            config.events.channel_capacity = capacity.parse().map_err(|e| {
                ConductorError::ConfigurationError(format!("Invalid event channel_capacity: {e}"))
            })?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConductorConfig::default();
        assert_eq!(config.execution.default_timeout_ms, 30_000);
        assert_eq!(config.lease.ttl_ms, 30_000);
        assert_eq!(config.events.channel_capacity, 1000);
        assert!(config.backoff.jitter_seed.is_none());
    }
}
