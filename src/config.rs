//! Configuration for the audit engine
//!
//! All knobs are plain integers with production defaults. Invalid values are
//! rejected at construction time; nothing is silently clamped.

use serde::{Deserialize, Serialize};

use crate::error::{AuditError, Result};

fn default_flush_interval_ms() -> u64 {
    5000
}

fn default_max_memory_entries() -> usize {
    1000
}

fn default_batch_size() -> usize {
    100
}

fn default_retention_days() -> u32 {
    365
}

fn default_cleanup_frequency() -> u64 {
    100
}

/// Tuning knobs for the audit engine
///
/// Deserializable so hosts can embed an `[audit]` table in their own
/// configuration file. Missing keys fall back to the defaults.
///
/// # Example
///
/// ```
/// use blackbox::EngineConfig;
///
/// let config = EngineConfig::from_toml_str(
///     r#"
///     flush_interval_ms = 2000
///     retention_days = 90
///     "#,
/// ).unwrap();
/// assert_eq!(config.flush_interval_ms, 2000);
/// assert_eq!(config.batch_size, 100);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Interval between background flush cycles, in milliseconds
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Hot cache capacity; the oldest entry is evicted beyond this
    #[serde(default = "default_max_memory_entries")]
    pub max_memory_entries: usize,

    /// Maximum entries written per flush transaction
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Days to retain durable entries (0 = retain forever)
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Background flush cycles between retention sweeps
    #[serde(default = "default_cleanup_frequency")]
    pub cleanup_frequency: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
            max_memory_entries: default_max_memory_entries(),
            batch_size: default_batch_size(),
            retention_days: default_retention_days(),
            cleanup_frequency: default_cleanup_frequency(),
        }
    }
}

impl EngineConfig {
    /// Validate the configuration, failing fast on unusable values
    ///
    /// `retention_days = 0` is legal (retain forever); every other knob must
    /// be positive.
    pub fn validate(&self) -> Result<()> {
        if self.flush_interval_ms == 0 {
            return Err(AuditError::Config(
                "flush_interval_ms must be positive".to_string(),
            ));
        }
        if self.max_memory_entries == 0 {
            return Err(AuditError::Config(
                "max_memory_entries must be positive".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(AuditError::Config("batch_size must be positive".to_string()));
        }
        if self.cleanup_frequency == 0 {
            return Err(AuditError::Config(
                "cleanup_frequency must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse a configuration from TOML and validate it in one step
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(raw)
            .map_err(|e| AuditError::Config(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.flush_interval_ms, 5000);
        assert_eq!(config.max_memory_entries, 1000);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.retention_days, 365);
        assert_eq!(config.cleanup_frequency, 100);
    }

    #[test]
    fn test_zero_values_rejected() {
        let mut config = EngineConfig::default();
        config.flush_interval_ms = 0;
        assert!(matches!(config.validate(), Err(AuditError::Config(_))));

        let mut config = EngineConfig::default();
        config.max_memory_entries = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.cleanup_frequency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retention_zero_means_forever() {
        let mut config = EngineConfig::default();
        config.retention_days = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_partial_uses_defaults() {
        let config = EngineConfig::from_toml_str("batch_size = 25").unwrap();
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.flush_interval_ms, 5000);
        assert_eq!(config.retention_days, 365);
    }

    #[test]
    fn test_from_toml_rejects_invalid() {
        assert!(EngineConfig::from_toml_str("batch_size = 0").is_err());
        assert!(EngineConfig::from_toml_str("batch_size = \"lots\"").is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = EngineConfig {
            flush_interval_ms: 250,
            max_memory_entries: 64,
            batch_size: 16,
            retention_days: 30,
            cleanup_frequency: 10,
        };
        let raw = toml::to_string(&config).unwrap();
        let parsed = EngineConfig::from_toml_str(&raw).unwrap();
        assert_eq!(parsed, config);
    }
}
