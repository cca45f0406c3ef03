//! Configuration for the bql binary
//!
//! Loads configuration from:
//! 1. config.yaml - server address, engine defaults, logging
//! 2. .env file - local overrides, loaded into the environment by `main`
//!
//! Environment variables always override config.yaml values.

use std::path::{Path, PathBuf};

use bql_engine::EngineConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid value for {var}: {value}")]
    InvalidEnvVar { var: String, value: String },
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Engine defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Directory holding one JSON file per btable
    pub data_dir: PathBuf,

    /// Fixed RNG seed; unset means a fresh seed per process
    pub seed: Option<u64>,

    /// ANALYZE iterations when no budget is given
    pub default_iterations: usize,

    /// INFER samples per cell when WITH n SAMPLES is absent
    pub default_samples: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let defaults = EngineConfig::default();
        Self {
            data_dir: PathBuf::from("./bql-data"),
            seed: None,
            default_iterations: defaults.default_iterations,
            default_samples: defaults.default_samples,
        }
    }
}

impl EngineSettings {
    pub fn engine_config(&self, base_dir: impl Into<PathBuf>) -> EngineConfig {
        EngineConfig {
            seed: self.seed,
            default_iterations: self.default_iterations,
            default_samples: self.default_samples,
            base_dir: base_dir.into(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or module-specific
    pub level: String,

    /// Output format: pretty, json, compact
    pub format: String,

    /// Output destination: stdout, file, both
    pub output: String,

    /// Directory for log files
    pub directory: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: "compact".to_string(),
            output: "stdout".to_string(),
            directory: "./logs".to_string(),
        }
    }
}

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub engine: EngineSettings,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a YAML file with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&contents)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            return Self::load(path);
        }
        let mut config = Config::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(host) = std::env::var("BQL_SERVER_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("BQL_SERVER_PORT") {
            self.server.port = port.parse().map_err(|_| ConfigError::InvalidEnvVar {
                var: "BQL_SERVER_PORT".to_string(),
                value: port,
            })?;
        }

        if let Ok(dir) = std::env::var("BQL_DATA_DIR") {
            self.engine.data_dir = PathBuf::from(dir);
        }
        if let Ok(seed) = std::env::var("BQL_SEED") {
            self.engine.seed = Some(seed.parse().map_err(|_| ConfigError::InvalidEnvVar {
                var: "BQL_SEED".to_string(),
                value: seed,
            })?);
        }

        if let Ok(level) = std::env::var("RUST_LOG") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Ok(output) = std::env::var("LOG_OUTPUT") {
            self.logging.output = output;
        }
        if let Ok(dir) = std::env::var("LOG_DIR") {
            self.logging.directory = dir;
        }
        Ok(())
    }

    /// Set logging environment variables for the logging module
    pub fn apply_logging_env(&self) {
        std::env::set_var("RUST_LOG", &self.logging.level);
        std::env::set_var("LOG_FORMAT", &self.logging.format);
        std::env::set_var("LOG_OUTPUT", &self.logging.output);
        std::env::set_var("LOG_DIR", &self.logging.directory);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.engine.default_iterations, 1000);
        assert_eq!(config.engine.default_samples, 50);
        assert_eq!(config.engine.seed, None);
        assert_eq!(config.logging.format, "compact");
        assert_eq!(config.logging.output, "stdout");
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "engine:\n  default_iterations: 40\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.engine.default_iterations, 40);
        assert_eq!(config.engine.default_samples, 50);
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn test_env_var_override() {
        std::env::set_var("BQL_SERVER_PORT", "9090");
        std::env::set_var("BQL_SEED", "17");

        let config_yaml = r#"
server:
  host: "127.0.0.1"
  port: 8080
engine:
  data_dir: "./data"
  default_iterations: 100
logging:
  level: "info"
  format: "pretty"
  output: "stdout"
  directory: "./logs"
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, config_yaml).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.port, 9090); // Overridden
        assert_eq!(config.engine.seed, Some(17)); // Overridden
        assert_eq!(config.engine.data_dir, PathBuf::from("./data"));

        std::env::remove_var("BQL_SERVER_PORT");
        std::env::remove_var("BQL_SEED");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.engine.default_samples, 50);
        assert!(Config::load(dir.path().join("absent.yaml")).is_err());
    }
}
