use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;
use upstream::config::{ApiConfig, FetchConfig, ValidationError};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Validation(#[from] ValidationError),
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    /// Endpoint of the external signing oracle.
    pub url: String,
}

impl Default for OracleConfig {
    fn default() -> Self {
        OracleConfig {
            url: "http://127.0.0.1:8923/sign".into(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listener: SocketAddr,
    pub oracle: OracleConfig,
    pub api: ApiConfig,
    pub fetch: FetchConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listener: "127.0.0.1:3000".parse().unwrap(),
            oracle: OracleConfig::default(),
            api: ApiConfig::default(),
            fetch: FetchConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&raw)?;
        config.api.validate()?;
        Ok(config)
    }
}
