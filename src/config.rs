//! Layered configuration for fleetctl.
//!
//! Sources, lowest priority first:
//! 1. Built-in defaults
//! 2. TOML file (`fleetctl.toml`, or the path in `FLEETCTL_CONFIG`)
//! 3. `FLEETCTL_*` environment variables (`__` separates nested keys)
//! 4. Command-line overrides

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "fleetctl.toml";
const CONFIG_PATH_ENV: &str = "FLEETCTL_CONFIG";
const ENV_PREFIX: &str = "FLEETCTL_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the device-control API, e.g. `http://10.0.0.2:8080/api`
    pub base_url: String,
    /// Bearer token sent with every request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080/api".to_string(),
            token: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub api: ApiConfig,
    pub page_size: u32,
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            page_size: 20,
            simulation: false,
            verbose: false,
            json_logs: false,
        }
    }
}

impl AppConfig {
    /// Build the effective configuration from every source.
    ///
    /// `overrides` is usually the parsed CLI arguments; fields that serialize
    /// as absent leave the lower layers untouched.
    pub fn new<T: Serialize>(overrides: Option<&T>) -> Result<Self> {
        let path = config_path();
        let figment = Self::base(&path)
            .merge(Env::prefixed(ENV_PREFIX).split("__").ignore(&["config"]));

        let figment = match overrides {
            Some(args) => figment.merge(Serialized::globals(args)),
            None => figment,
        };

        figment
            .extract()
            .with_context(|| format!("Failed to load configuration ({})", path.display()))
    }

    /// Defaults, file and overrides only. Environment variables are skipped.
    pub fn load_from<T: Serialize>(path: &Path, overrides: Option<&T>) -> Result<Self> {
        let figment = Self::base(path);
        let figment = match overrides {
            Some(args) => figment.merge(Serialized::globals(args)),
            None => figment,
        };

        figment
            .extract()
            .with_context(|| format!("Failed to load configuration ({})", path.display()))
    }

    fn base(path: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Write this configuration as TOML, refusing to clobber an existing file.
    pub fn write_new(&self, path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("{} already exists", path.display());
        }
        std::fs::write(path, self.to_toml()?)
            .with_context(|| format!("Failed to write {}", path.display()))
    }
}

/// Path of the configuration file, honouring `FLEETCTL_CONFIG`.
pub fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}
