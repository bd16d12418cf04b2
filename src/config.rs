//! Configuration management
//!
//! Layering: built-in defaults, then an optional TOML file named by
//! `SAFLA_CONFIG`, then individual environment overrides. Everything is
//! validated up front so a bad config fails at startup, never mid-loop.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

use crate::adapter::PerturbationConfig;
use crate::error::ConfigError;
use crate::evaluator::ObjectiveConfig;
use crate::feedback_loop::LoopConfig;

/// Persistence settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// SQLite database path; in-memory only when unset
    pub db_path: Option<PathBuf>,
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaflaConfig {
    #[serde(rename = "loop")]
    pub controller: LoopConfig,
    pub objective: ObjectiveConfig,
    pub adapter: PerturbationConfig,
    pub persistence: PersistenceConfig,
}

impl SaflaConfig {
    /// Load configuration from the environment
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("SAFLA_CONFIG") {
            Ok(path) => {
                let path = expand_path(&path);
                let content = std::fs::read_to_string(&path).map_err(|e| {
                    ConfigError::Parse(format!("failed to read {}: {}", path.display(), e))
                })?;
                debug!("Loading config from {}", path.display());
                Self::from_toml_str(&content)?
            }
            Err(_) => Self::default(),
        };

        if let Some(seed) = env_parse::<u64>("SAFLA_SEED")? {
            config.controller.seed = seed;
        }
        if let Some(max_cycles) = env_parse::<u64>("SAFLA_MAX_CYCLES")? {
            config.controller.max_cycles = max_cycles;
        }
        if let Some(epsilon) = env_parse::<f64>("SAFLA_EPSILON")? {
            config.objective.epsilon = epsilon;
        }
        if let Ok(db_path) = std::env::var("SAFLA_DB_PATH") {
            config.persistence.db_path = Some(expand_path(&db_path));
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.controller.validate()?;
        self.objective.validate()?;
        self.adapter.validate()?;
        Ok(())
    }
}

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Parse(format!("{} has invalid value '{}'", key, raw))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::Direction;

    #[test]
    fn test_defaults_are_valid() {
        assert!(SaflaConfig::default().validate().is_ok());
    }

    #[test]
    fn test_from_toml() {
        let config = SaflaConfig::from_toml_str(
            r#"
            [loop]
            max_cycles = 25
            divergence_threshold = 4
            seed = 7

            [objective]
            epsilon = 0.05

            [[objective.components]]
            metric = "reward"
            weight = 2.0

            [[objective.components]]
            metric = "latency_ms"
            weight = 0.01
            direction = "minimize"

            [adapter]
            base_step = 0.2

            [adapter.bounds.temperature]
            min = 0.0
            max = 2.0

            [persistence]
            db_path = "/tmp/safla.db"
            "#,
        )
        .unwrap();

        assert_eq!(config.controller.max_cycles, 25);
        assert_eq!(config.controller.divergence_threshold, 4);
        assert_eq!(config.controller.seed, 7);
        // Unspecified fields keep their defaults
        assert_eq!(config.controller.task_retry_budget, LoopConfig::default().task_retry_budget);
        assert_eq!(config.objective.components.len(), 2);
        assert_eq!(config.objective.components[1].direction, Direction::Minimize);
        assert_eq!(config.adapter.base_step, 0.2);
        assert_eq!(config.adapter.bounds["temperature"].max, 2.0);
        assert_eq!(config.persistence.db_path, Some(PathBuf::from("/tmp/safla.db")));
    }

    #[test]
    fn test_invalid_toml_fails_fast() {
        let err = SaflaConfig::from_toml_str("[loop]\nmax_cycles = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));

        let err = SaflaConfig::from_toml_str("[adapter]\nshrink_factor = 2.0").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAdapter(_)));

        let err = SaflaConfig::from_toml_str("[objective]\ncomponents = []").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidObjective(_)));
    }
}
