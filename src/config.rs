use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};

/// Environment variable holding a JSON-encoded [`EngineConfig`].
pub const CONFIG_ENV_VAR: &str = "TREX_SHARD_CONFIG";

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

/// Tunables for analysis, volume escalation, fan-out and consolidation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// SQL longer than this (in bytes) is rejected before analysis.
    pub max_sql_length: usize,
    /// Total row counts below this stay in memory.
    pub low_volume_threshold: u64,
    /// Total row counts at or above this force aggregation.
    pub high_volume_threshold: u64,
    /// Independent timeout applied to every per-shard call.
    pub shard_timeout_ms: u64,
    /// Size of the bounded per-shard worker pool.
    pub max_concurrent_shards: usize,
    pub numeric_sample_size: usize,
    pub numeric_min_samples: usize,
    pub numeric_ratio: f64,
    /// Fields whose values identify the origin shard and are normalised on merge.
    pub shard_identity_fields: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_sql_length: 100_000,
            low_volume_threshold: 10_000,
            high_volume_threshold: 100_000,
            shard_timeout_ms: 30_000,
            max_concurrent_shards: 8,
            numeric_sample_size: 50,
            numeric_min_samples: 3,
            numeric_ratio: 0.8,
            shard_identity_fields: vec!["provincia".to_string()],
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

impl EngineConfig {
    /// Read `TREX_SHARD_CONFIG` from the environment and parse it as JSON.
    /// Falls back to defaults when the variable is unset.
    pub fn from_env() -> EngineResult<Self> {
        match env::var(CONFIG_ENV_VAR) {
            Ok(raw) => Self::from_json(&raw),
            Err(_) => {
                log::debug!("{CONFIG_ENV_VAR} not set, using default engine configuration");
                Ok(Self::default())
            }
        }
    }

    pub fn from_json(json: &str) -> EngineResult<Self> {
        let config: EngineConfig = serde_json::from_str(json).map_err(|e| {
            EngineError::config(&format!("Failed to parse {CONFIG_ENV_VAR} JSON: {e}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> EngineResult<Self> {
        let config: EngineConfig = toml::from_str(raw)
            .map_err(|e| EngineError::config(&format!("Failed to parse TOML config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::config(&format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Validate the configuration, returning the first problem found.
    pub fn validate(&self) -> EngineResult<()> {
        if self.max_sql_length == 0 {
            return Err(EngineError::config("max_sql_length must be greater than zero"));
        }
        if self.low_volume_threshold >= self.high_volume_threshold {
            return Err(EngineError::config(&format!(
                "low_volume_threshold ({}) must be below high_volume_threshold ({})",
                self.low_volume_threshold, self.high_volume_threshold
            )));
        }
        if self.shard_timeout_ms == 0 {
            return Err(EngineError::config("shard_timeout_ms must be greater than zero"));
        }
        if self.max_concurrent_shards == 0 {
            return Err(EngineError::config(
                "max_concurrent_shards must be greater than zero",
            ));
        }
        if self.numeric_sample_size == 0 || self.numeric_min_samples == 0 {
            return Err(EngineError::config("numeric sampling sizes must be greater than zero"));
        }
        if !(self.numeric_ratio > 0.0 && self.numeric_ratio <= 1.0) {
            return Err(EngineError::config(&format!(
                "numeric_ratio {} is outside (0, 1]",
                self.numeric_ratio
            )));
        }
        Ok(())
    }

    pub fn shard_timeout(&self) -> Duration {
        Duration::from_millis(self.shard_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = EngineConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.low_volume_threshold, 10_000);
        assert_eq!(cfg.high_volume_threshold, 100_000);
        assert_eq!(cfg.numeric_sample_size, 50);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = EngineConfig::from_toml_str(
            r#"
            shard_timeout_ms = 1500
            max_concurrent_shards = 3
            shard_identity_fields = ["provincia", "jurisdiccion"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.shard_timeout(), Duration::from_millis(1500));
        assert_eq!(cfg.max_concurrent_shards, 3);
        assert_eq!(cfg.shard_identity_fields.len(), 2);
        assert_eq!(cfg.max_sql_length, 100_000);
    }

    #[test]
    fn json_config_parses() {
        let cfg = EngineConfig::from_json(r#"{ "low_volume_threshold": 500 }"#).unwrap();
        assert_eq!(cfg.low_volume_threshold, 500);
        assert_eq!(cfg.high_volume_threshold, 100_000);
    }

    #[test]
    fn inverted_thresholds_rejected() {
        let err = EngineConfig::from_json(
            r#"{ "low_volume_threshold": 200000, "high_volume_threshold": 100 }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("low_volume_threshold"), "error was: {err}");
    }

    #[test]
    fn ratio_out_of_range_rejected() {
        let err = EngineConfig::from_toml_str("numeric_ratio = 1.5").unwrap_err();
        assert!(err.to_string().contains("numeric_ratio"), "error was: {err}");
    }

    #[test]
    fn zero_timeout_rejected() {
        let err = EngineConfig::from_toml_str("shard_timeout_ms = 0").unwrap_err();
        assert!(matches!(err, EngineError::Config { .. }));
    }

    #[test]
    fn malformed_json_returns_err() {
        assert!(EngineConfig::from_json("{ not valid json }}}").is_err());
    }

    #[test]
    fn reads_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard.toml");
        std::fs::write(&path, "numeric_sample_size = 20\n").unwrap();
        let cfg = EngineConfig::from_file(&path).unwrap();
        assert_eq!(cfg.numeric_sample_size, 20);
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = EngineConfig::from_file("/nonexistent/trex-shard.toml").unwrap_err();
        assert!(matches!(err, EngineError::Config { .. }));
    }
}
