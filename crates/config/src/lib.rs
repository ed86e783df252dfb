#![forbid(unsafe_code)]

use decoy_core::{DetectorSettings, NotificationSettings, TLS_RANDOM_LEN};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_FILE_NAME: &str = "router.yaml";
pub const DEFAULT_MAX_MESSAGE_LEN: u64 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub root: PathBuf,
    pub router: PathBuf,
}

impl ConfigPaths {
    pub fn new(root: PathBuf) -> Self {
        ConfigPaths {
            router: root.join(CONFIG_FILE_NAME),
            root,
        }
    }

    /// Paths under `$DECOY_CONFIG_ROOT`, or `/etc/decoyd`.
    pub fn from_env() -> Self {
        ConfigPaths::new(utils::config_root())
    }

    /// Relative file names in the config are taken from the root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct EncoderSettings {
    /// Seconds between pings; 0 disables them.
    pub heartbeat_secs: u64,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        EncoderSettings { heartbeat_secs: 0 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DecoderSettings {
    pub filter_file: Option<PathBuf>,
    pub blacklist_file: Option<PathBuf>,
    pub max_message_len: u64,
}

impl Default for DecoderSettings {
    fn default() -> Self {
        DecoderSettings {
            filter_file: None,
            blacklist_file: None,
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RouterConfig {
    pub detectors: Vec<DetectorSettings>,
    pub notification: Option<NotificationSettings>,
    /// Absent means no redirect encoder is wired.
    pub encoder: Option<EncoderSettings>,
    pub decoder: DecoderSettings,
}

impl RouterConfig {
    pub fn from_yaml(body: &str, path: &Path) -> Result<Self, ConfigError> {
        if body.trim().is_empty() {
            return Ok(RouterConfig::default());
        }
        serde_yaml::from_str(body).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.detectors.is_empty() {
            return Err(ConfigError::Invalid("no detectors configured".into()));
        }
        let mut ports = HashSet::new();
        for detector in &self.detectors {
            let kind = detector.kind.as_str();
            let port = detector.port();
            if !ports.insert(port) {
                return Err(ConfigError::Invalid(format!(
                    "port {port} used by more than one detector"
                )));
            }
            if detector.sentinel_length == 0 || detector.sentinel_length > TLS_RANDOM_LEN {
                return Err(ConfigError::Invalid(format!(
                    "{kind} detector: sentinel-length must be between 1 and {TLS_RANDOM_LEN}"
                )));
            }
            if detector.sweep_interval_secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{kind} detector: sweep-interval-secs must be positive"
                )));
            }
            if let Some(literal) = &detector.sentinel
                && literal.len() > detector.candidate_len()
            {
                return Err(ConfigError::Invalid(format!(
                    "{kind} detector: sentinel is longer than the {} byte candidate",
                    detector.candidate_len()
                )));
            }
        }
        Ok(())
    }

    /// Resolve the decoder's file names against the config root.
    pub fn resolve_files(&mut self, paths: &ConfigPaths) {
        if let Some(file) = self.decoder.filter_file.take() {
            self.decoder.filter_file = Some(paths.resolve(&file));
        }
        if let Some(file) = self.decoder.blacklist_file.take() {
            self.decoder.blacklist_file = Some(paths.resolve(&file));
        }
    }
}

/// Read, parse and validate a router config file.
pub fn load_router_config(path: &Path, paths: &ConfigPaths) -> Result<RouterConfig, ConfigError> {
    let body = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut config = RouterConfig::from_yaml(&body, path)?;
    config.validate()?;
    config.resolve_files(paths);
    Ok(config)
}

/// `router.yaml` under the config root.
pub fn load_default(paths: &ConfigPaths) -> Result<RouterConfig, ConfigError> {
    load_router_config(&paths.router, paths)
}
