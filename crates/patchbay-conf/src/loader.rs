//! Config file discovery, loading, and environment variable overlay.

use crate::{BootstrapConfig, ConfigError, InfraConfig, PatchbayConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order).
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values.
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local). Only returns files
/// that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
/// Returns paths in load order (system, user, local/cli).
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/patchbay/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("patchbay/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("patchbay.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load config from a TOML file.
pub fn load_from_file(path: &Path) -> Result<PatchbayConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_toml(&contents, path)
}

/// Parse config from a TOML string.
fn parse_toml(contents: &str, path: &Path) -> Result<PatchbayConfig, ConfigError> {
    let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let mut infra = InfraConfig::default();
    if let Some(paths) = table.get("paths").and_then(|v| v.as_table()) {
        if let Some(v) = paths.get("runtime_dir").and_then(|v| v.as_str()) {
            infra.paths.runtime_dir = expand_path(v);
        }
        if let Some(v) = paths.get("socket_name").and_then(|v| v.as_str()) {
            infra.paths.socket_name = v.to_string();
        }
    }
    if let Some(telemetry) = table.get("telemetry").and_then(|v| v.as_table()) {
        if let Some(v) = telemetry.get("log_level").and_then(|v| v.as_str()) {
            infra.telemetry.log_level = v.to_string();
        }
    }
    if let Some(sched) = table.get("scheduler").and_then(|v| v.as_table()) {
        if let Some(v) = sched.get("sample_rate").and_then(|v| v.as_integer()) {
            infra.scheduler.sample_rate = v as u32;
        }
        if let Some(v) = sched.get("quantum").and_then(|v| v.as_integer()) {
            infra.scheduler.quantum = v as u32;
        }
        if let Some(v) = sched.get("min_margin_us").and_then(|v| v.as_integer()) {
            infra.scheduler.min_margin_us = v as u64;
        }
        if let Some(v) = sched.get("xrun_suspend_threshold").and_then(|v| v.as_integer()) {
            infra.scheduler.xrun_suspend_threshold = v as u32;
        }
    }

    let mut bootstrap = BootstrapConfig::default();
    if let Some(core) = table.get("core").and_then(|v| v.as_table()) {
        if let Some(v) = core.get("application_name").and_then(|v| v.as_str()) {
            bootstrap.core.application_name = v.to_string();
        }
        if let Some(v) = core.get("max_objects_per_peer").and_then(|v| v.as_integer()) {
            bootstrap.core.max_objects_per_peer = v as u32;
        }
    }
    if let Some(factories) = table.get("factories").and_then(|v| v.as_table()) {
        for (name, props) in factories {
            if let Some(props_table) = props.as_table() {
                let mut map = std::collections::HashMap::new();
                for (k, v) in props_table {
                    if let Some(s) = v.as_str() {
                        map.insert(k.clone(), s.to_string());
                    }
                }
                bootstrap.factories.insert(name.clone(), map);
            }
        }
    }

    Ok(PatchbayConfig { infra, bootstrap })
}

/// Merge two configs, with `overlay` taking precedence field-by-field.
pub fn merge_configs(base: PatchbayConfig, overlay: PatchbayConfig) -> PatchbayConfig {
    let default_infra = InfraConfig::default();
    PatchbayConfig {
        infra: InfraConfig {
            paths: crate::infra::PathsConfig {
                runtime_dir: if overlay.infra.paths.runtime_dir != default_infra.paths.runtime_dir {
                    overlay.infra.paths.runtime_dir
                } else {
                    base.infra.paths.runtime_dir
                },
                socket_name: if overlay.infra.paths.socket_name != default_infra.paths.socket_name {
                    overlay.infra.paths.socket_name
                } else {
                    base.infra.paths.socket_name
                },
            },
            telemetry: crate::infra::TelemetryConfig {
                log_level: if overlay.infra.telemetry.log_level != default_infra.telemetry.log_level {
                    overlay.infra.telemetry.log_level
                } else {
                    base.infra.telemetry.log_level
                },
            },
            scheduler: crate::infra::SchedulerConfig {
                sample_rate: if overlay.infra.scheduler.sample_rate != default_infra.scheduler.sample_rate {
                    overlay.infra.scheduler.sample_rate
                } else {
                    base.infra.scheduler.sample_rate
                },
                quantum: if overlay.infra.scheduler.quantum != default_infra.scheduler.quantum {
                    overlay.infra.scheduler.quantum
                } else {
                    base.infra.scheduler.quantum
                },
                min_margin_us: if overlay.infra.scheduler.min_margin_us != default_infra.scheduler.min_margin_us {
                    overlay.infra.scheduler.min_margin_us
                } else {
                    base.infra.scheduler.min_margin_us
                },
                xrun_suspend_threshold: if overlay.infra.scheduler.xrun_suspend_threshold
                    != default_infra.scheduler.xrun_suspend_threshold
                {
                    overlay.infra.scheduler.xrun_suspend_threshold
                } else {
                    base.infra.scheduler.xrun_suspend_threshold
                },
            },
        },
        bootstrap: overlay.bootstrap,
    }
}

/// Apply environment variable overrides to config.
///
/// Mirrors the env vars PipeWire itself reads: `XDG_RUNTIME_DIR` supplies
/// the socket directory, `REMOTE` overrides the socket name, `DEBUG`
/// selects log verbosity (`0`-`9`, mapped onto `error`..`trace`). The
/// `PATCHBAY_`-prefixed names are this daemon's own overlay on top.
pub fn apply_env_overrides(config: &mut PatchbayConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("XDG_RUNTIME_DIR") {
        config.infra.paths.runtime_dir = expand_path(&v);
        sources.env_overrides.push("XDG_RUNTIME_DIR".to_string());
    }
    if let Ok(v) = env::var("REMOTE") {
        config.infra.paths.socket_name = v;
        sources.env_overrides.push("REMOTE".to_string());
    }
    if let Ok(v) = env::var("DEBUG") {
        if let Ok(level) = v.parse::<u8>() {
            config.infra.telemetry.log_level = debug_level_to_filter(level).to_string();
            sources.env_overrides.push("DEBUG".to_string());
        }
    }

    if let Ok(v) = env::var("PATCHBAY_LOG_LEVEL") {
        config.infra.telemetry.log_level = v;
        sources.env_overrides.push("PATCHBAY_LOG_LEVEL".to_string());
    }
    if let Ok(v) = env::var("RUST_LOG") {
        config.infra.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }
    if let Ok(v) = env::var("PATCHBAY_SAMPLE_RATE") {
        if let Ok(rate) = v.parse() {
            config.infra.scheduler.sample_rate = rate;
            sources.env_overrides.push("PATCHBAY_SAMPLE_RATE".to_string());
        }
    }
    if let Ok(v) = env::var("PATCHBAY_QUANTUM") {
        if let Ok(quantum) = v.parse() {
            config.infra.scheduler.quantum = quantum;
            sources.env_overrides.push("PATCHBAY_QUANTUM".to_string());
        }
    }
}

/// Map PipeWire-style `DEBUG=N` verbosity onto a `tracing` filter directive.
fn debug_level_to_filter(level: u8) -> &'static str {
    match level {
        0 => "off",
        1 => "error",
        2 => "warn",
        3 => "info",
        4 => "debug",
        _ => "trace",
    }
}

/// Expand `~` and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            return home.join(stripped);
        }
        return PathBuf::from(path);
    }
    if let Some(stripped) = path.strip_prefix('$') {
        if let Some(slash_pos) = stripped.find('/') {
            let var_name = &stripped[..slash_pos];
            if let Ok(var_value) = env::var(var_name) {
                return PathBuf::from(var_value).join(&stripped[slash_pos + 1..]);
            }
            return PathBuf::from(path);
        }
        return env::var(stripped).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(path));
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_path_tilde() {
        let expanded = expand_path("~/test/path");
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert!(expanded.to_string_lossy().contains("test/path"));
    }

    #[test]
    fn test_expand_path_absolute() {
        let expanded = expand_path("/absolute/path");
        assert_eq!(expanded, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_discover_config_files_does_not_panic() {
        let _files = discover_config_files();
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml = r#"
[paths]
runtime_dir = "/custom/run"
"#;
        let config = parse_toml(toml, Path::new("test.toml")).unwrap();
        assert_eq!(config.infra.paths.runtime_dir, PathBuf::from("/custom/run"));
        assert_eq!(config.infra.scheduler.sample_rate, 48_000);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
[paths]
runtime_dir = "/run/patchbay"
socket_name = "patchbay-1"

[telemetry]
log_level = "debug"

[scheduler]
sample_rate = 44100
quantum = 512
min_margin_us = 200

[core]
application_name = "test-daemon"
max_objects_per_peer = 64

[factories.dummy-sink]
channels = "2"
"#;
        let config = parse_toml(toml, Path::new("test.toml")).unwrap();
        assert_eq!(config.infra.paths.socket_name, "patchbay-1");
        assert_eq!(config.infra.scheduler.sample_rate, 44_100);
        assert_eq!(config.infra.scheduler.quantum, 512);
        assert_eq!(config.bootstrap.core.application_name, "test-daemon");
        assert_eq!(config.bootstrap.core.max_objects_per_peer, 64);
        assert!(config.bootstrap.factories.contains_key("dummy-sink"));
    }

    #[test]
    fn test_debug_level_mapping() {
        assert_eq!(debug_level_to_filter(0), "off");
        assert_eq!(debug_level_to_filter(2), "warn");
        assert_eq!(debug_level_to_filter(9), "trace");
    }
}
