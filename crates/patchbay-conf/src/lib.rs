//! Minimal configuration loading for the patchbay media daemon.
//!
//! This crate provides configuration loading with minimal dependencies,
//! designed to be imported by every patchbay crate without causing
//! circular dependency issues.
//!
//! # Configuration Philosophy
//!
//! Configuration is split into two categories:
//!
//! - **Infrastructure** (`InfraConfig`): Things that physically cannot
//!   change at runtime - the socket path, log level, scheduler defaults.
//!
//! - **Bootstrap** (`BootstrapConfig`): Initial values that seed the
//!   object registry. After startup, the registry becomes the source of
//!   truth and these are no longer consulted.
//!
//! # Usage
//!
//! ```rust,no_run
//! use patchbay_conf::PatchbayConfig;
//!
//! let config = PatchbayConfig::load().expect("failed to load config");
//! println!("socket: {}", config.infra.paths.socket_path().display());
//! println!("quantum: {}", config.infra.scheduler.quantum);
//! ```
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/patchbay/config.toml` (system)
//! 2. `~/.config/patchbay/config.toml` (user)
//! 3. `./patchbay.toml` (local override)
//! 4. Environment variables (`XDG_RUNTIME_DIR`, `REMOTE`, `DEBUG`, `PATCHBAY_*`)
//!
//! # Example Config
//!
//! ```toml
//! [paths]
//! runtime_dir = "/run/user/1000"
//! socket_name = "patchbay-0"
//!
//! [telemetry]
//! log_level = "info"
//!
//! [scheduler]
//! sample_rate = 48000
//! quantum = 1024
//! min_margin_us = 100
//! ```

pub mod bootstrap;
pub mod infra;
pub mod loader;

pub use bootstrap::{BootstrapConfig, CoreDefaults, FactoriesConfig};
pub use infra::{InfraConfig, PathsConfig, SchedulerConfig, TelemetryConfig};
pub use loader::ConfigSources;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete patchbay daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PatchbayConfig {
    /// Infrastructure - cannot change at runtime.
    #[serde(flatten)]
    pub infra: InfraConfig,

    /// Bootstrap - seeds registry state.
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
}

impl PatchbayConfig {
    /// Load configuration from all sources.
    ///
    /// Load order (later wins):
    /// 1. Compiled defaults
    /// 2. `/etc/patchbay/config.toml`
    /// 3. `~/.config/patchbay/config.toml`
    /// 4. `./patchbay.toml`
    /// 5. Environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration from a specific file path, then apply env overrides.
    ///
    /// If `config_path` is provided, it takes precedence over the local
    /// `./patchbay.toml` override. System and user configs still load first.
    pub fn load_from(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and return information about sources.
    pub fn load_with_sources() -> Result<(Self, ConfigSources), ConfigError> {
        Self::load_with_sources_from(None)
    }

    /// Load configuration from an optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = PatchbayConfig::default();

        for path in loader::discover_config_files_with_override(config_path) {
            let file_config = loader::load_from_file(&path)?;
            config = loader::merge_configs(config, file_config);
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// Serialize config to a TOML string.
    pub fn to_toml(&self) -> String {
        let mut output = String::new();

        output.push_str("# patchbay daemon configuration\n\n");

        output.push_str("[paths]\n");
        output.push_str(&format!(
            "runtime_dir = \"{}\"\n",
            self.infra.paths.runtime_dir.display()
        ));
        output.push_str(&format!("socket_name = \"{}\"\n", self.infra.paths.socket_name));

        output.push_str("\n[telemetry]\n");
        output.push_str(&format!("log_level = \"{}\"\n", self.infra.telemetry.log_level));

        output.push_str("\n[scheduler]\n");
        output.push_str(&format!("sample_rate = {}\n", self.infra.scheduler.sample_rate));
        output.push_str(&format!("quantum = {}\n", self.infra.scheduler.quantum));
        output.push_str(&format!("min_margin_us = {}\n", self.infra.scheduler.min_margin_us));
        output.push_str(&format!(
            "xrun_suspend_threshold = {}\n",
            self.infra.scheduler.xrun_suspend_threshold
        ));

        output.push_str("\n[core]\n");
        output.push_str(&format!(
            "application_name = \"{}\"\n",
            self.bootstrap.core.application_name
        ));
        output.push_str(&format!(
            "max_objects_per_peer = {}\n",
            self.bootstrap.core.max_objects_per_peer
        ));

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PatchbayConfig::default();
        assert_eq!(config.infra.scheduler.sample_rate, 48_000);
        assert_eq!(config.infra.paths.socket_name, "patchbay-0");
    }

    #[test]
    fn test_to_toml() {
        let config = PatchbayConfig::default();
        let toml = config.to_toml();
        assert!(toml.contains("[paths]"));
        assert!(toml.contains("[scheduler]"));
        assert!(toml.contains("sample_rate"));
    }

    #[test]
    fn test_load_defaults() {
        let config = PatchbayConfig::load().unwrap();
        assert_eq!(config.infra.scheduler.sample_rate, 48_000);
    }
}
