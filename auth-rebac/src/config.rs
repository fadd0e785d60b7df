use crate::error::{RebacError, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Depth budget applied when a check request carries none (default: 20)
    #[serde(default = "default_depth")]
    pub default_depth: u32,

    /// Wall-clock deadline for a whole check, in milliseconds
    #[serde(default)]
    pub check_timeout_ms: Option<u64>,

    /// Evaluate set-operation branches as concurrent tasks
    #[serde(default = "default_true")]
    pub parallel_branches: bool,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Request-spanning check cache
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,

    /// The cache is cleared once it grows past this many entries
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct StoreConfig {
    /// Number of most recent snapshots kept readable per tenant; unset keeps
    /// the full history
    #[serde(default)]
    pub retained_snapshots: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, overridden by `RUST_LOG` when set
    #[serde(default = "default_filter")]
    pub filter: String,

    /// Emit JSON lines instead of the human-readable format
    #[serde(default)]
    pub json: bool,
}

fn default_depth() -> u32 {
    20
}

fn default_true() -> bool {
    true
}

fn default_cache_entries() -> usize {
    10_000
}

fn default_filter() -> String {
    "auth_rebac=info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_depth: default_depth(),
            check_timeout_ms: None,
            parallel_branches: default_true(),
            cache: CacheConfig::default(),
            store: StoreConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_entries: default_cache_entries(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            json: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from an optional file (YAML, TOML or JSON, by
    /// extension) overlaid with `REBAC_`-prefixed environment variables.
    /// Nested keys use `__`, e.g. `REBAC_CACHE__ENABLED=true`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        let config: Self = builder
            .add_source(
                Environment::with_prefix("REBAC")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML document.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(File::from_str(contents, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_depth == 0 {
            return Err(RebacError::InvalidArgument(
                "default_depth must be at least 1".to_string(),
            ));
        }
        if self.cache.enabled && self.cache.max_entries == 0 {
            return Err(RebacError::InvalidArgument(
                "cache.max_entries must be positive when the cache is enabled".to_string(),
            ));
        }
        if self.store.retained_snapshots == Some(0) {
            return Err(RebacError::InvalidArgument(
                "store.retained_snapshots must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn check_timeout(&self) -> Option<Duration> {
        self.check_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.default_depth, 20);
        assert!(config.parallel_branches);
        assert!(!config.cache.enabled);
        assert_eq!(config.check_timeout(), None);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = EngineConfig::from_yaml(
            r#"
check_timeout_ms: 250
cache:
  enabled: true
logging:
  json: true
"#,
        )
        .unwrap();
        assert_eq!(config.default_depth, 20);
        assert_eq!(config.check_timeout(), Some(Duration::from_millis(250)));
        assert!(config.cache.enabled);
        assert_eq!(config.cache.max_entries, 10_000);
        assert!(config.logging.json);
        assert_eq!(config.logging.filter, "auth_rebac=info");
    }

    #[test]
    fn test_zero_depth_rejected() {
        let err = EngineConfig::from_yaml("default_depth: 0").unwrap_err();
        assert!(matches!(err, RebacError::InvalidArgument(_)));
    }

    #[test]
    fn test_environment_overrides() {
        std::env::set_var("REBAC_DEFAULT_DEPTH", "7");
        std::env::set_var("REBAC_STORE__RETAINED_SNAPSHOTS", "16");
        let config = EngineConfig::load(None);
        std::env::remove_var("REBAC_DEFAULT_DEPTH");
        std::env::remove_var("REBAC_STORE__RETAINED_SNAPSHOTS");

        let config = config.unwrap();
        assert_eq!(config.default_depth, 7);
        assert_eq!(config.store.retained_snapshots, Some(16));
    }
}
