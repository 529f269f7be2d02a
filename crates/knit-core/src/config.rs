//! Configuration parsing for the loop processes.
//!
//! key=value format, one setting per line, `#` comments.
//! Precedence: CLI flags > `--config` file > defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
}

/// Loop process configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    /// `SQLite` database shared by every loop replica.
    pub db_path: PathBuf,

    // Kubernetes
    pub namespace: String,
    pub kube_api_url: String,
    pub kube_token_path: PathBuf,
    pub kube_ca_path: PathBuf,
    /// Skip TLS verification against the API server. Development only.
    pub kube_insecure: bool,

    // Output volumes
    pub storage_class: Option<String>,
    /// Requested size of a new output volume, in Kubernetes quantity syntax.
    pub initial_capacity: String,

    // Timing
    /// Upper bound for one cycle of initialize and run management.
    pub cycle_timeout_sec: u32,
    pub debounce_sec: u32,
    pub webhook_timeout_sec: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("knit.db"),
            namespace: "knitfab".to_string(),
            kube_api_url: "https://kubernetes.default.svc".to_string(),
            kube_token_path: PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/token"),
            kube_ca_path: PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/ca.crt"),
            kube_insecure: false,
            storage_class: None,
            initial_capacity: "1Gi".to_string(),
            cycle_timeout_sec: 30,
            debounce_sec: 30,
            webhook_timeout_sec: 10,
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "db_path" => self.db_path = PathBuf::from(value),
            "namespace" => self.namespace = value.to_string(),
            "kube_api_url" => self.kube_api_url = value.trim_end_matches('/').to_string(),
            "kube_token_path" => self.kube_token_path = PathBuf::from(value),
            "kube_ca_path" => self.kube_ca_path = PathBuf::from(value),
            "kube_insecure" => self.kube_insecure = Self::parse_bool(key, value)?,
            "storage_class" => {
                self.storage_class = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "initial_capacity" => self.initial_capacity = value.to_string(),
            "cycle_timeout_sec" => self.cycle_timeout_sec = Self::parse_int(key, value)?,
            "debounce_sec" => self.debounce_sec = Self::parse_int(key, value)?,
            "webhook_timeout_sec" => self.webhook_timeout_sec = Self::parse_int(key, value)?,
            _ => {
                eprintln!("Warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    fn parse_int(key: &str, value: &str) -> Result<u32, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.cycle_timeout_sec))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_secs(u64::from(self.debounce_sec))
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.webhook_timeout_sec))
    }
}
