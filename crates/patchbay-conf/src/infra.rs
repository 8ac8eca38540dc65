//! Infrastructure configuration - things that cannot change at runtime.
//!
//! These mirror the environment PipeWire itself reads at startup: the
//! runtime directory that holds the bootstrap socket, the socket name,
//! and how noisy the process should be on stderr.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Filesystem paths for daemon runtime state and sockets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory that holds the bootstrap listening socket and any
    /// memfd-backed regions that need a filesystem-visible staging path.
    /// Default: `$XDG_RUNTIME_DIR` or `/tmp`.
    #[serde(default = "PathsConfig::default_runtime_dir")]
    pub runtime_dir: PathBuf,

    /// Socket file name within `runtime_dir`.
    /// Default: `patchbay-0`.
    #[serde(default = "PathsConfig::default_socket_name")]
    pub socket_name: String,
}

impl PathsConfig {
    fn default_runtime_dir() -> PathBuf {
        std::env::var("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }

    fn default_socket_name() -> String {
        "patchbay-0".to_string()
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            runtime_dir: Self::default_runtime_dir(),
            socket_name: Self::default_socket_name(),
        }
    }
}

impl PathsConfig {
    /// Full path to the bootstrap socket (`runtime_dir/socket_name`).
    pub fn socket_path(&self) -> PathBuf {
        self.runtime_dir.join(&self.socket_name)
    }
}

/// Telemetry and logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log filter directive (same syntax as `RUST_LOG`/`tracing_subscriber::EnvFilter`).
    /// Default: `info`.
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

/// Realtime scheduling knobs that are fixed for the life of the driver thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Default sample rate in Hz used until a client negotiates otherwise.
    #[serde(default = "SchedulerConfig::default_sample_rate")]
    pub sample_rate: u32,

    /// Default quantum (frames per cycle).
    #[serde(default = "SchedulerConfig::default_quantum")]
    pub quantum: u32,

    /// Minimum scheduler safety margin, in microseconds. The driver adds
    /// this on top of 10% of the cycle duration (see `DESIGN.md`, Open
    /// Question c) and never goes below this floor even at tiny quanta.
    #[serde(default = "SchedulerConfig::default_min_margin_us")]
    pub min_margin_us: u64,

    /// Number of consecutive missed deadlines before a node is forcibly
    /// suspended from the graph.
    #[serde(default = "SchedulerConfig::default_xrun_suspend_threshold")]
    pub xrun_suspend_threshold: u32,
}

impl SchedulerConfig {
    fn default_sample_rate() -> u32 {
        48_000
    }

    fn default_quantum() -> u32 {
        1024
    }

    fn default_min_margin_us() -> u64 {
        100
    }

    fn default_xrun_suspend_threshold() -> u32 {
        16
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sample_rate: Self::default_sample_rate(),
            quantum: Self::default_quantum(),
            min_margin_us: Self::default_min_margin_us(),
            xrun_suspend_threshold: Self::default_xrun_suspend_threshold(),
        }
    }
}

/// Infrastructure configuration - cannot change at runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InfraConfig {
    /// Filesystem paths.
    #[serde(default)]
    pub paths: PathsConfig,

    /// Logging settings.
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Scheduler defaults.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_defaults() {
        let paths = PathsConfig::default();
        assert_eq!(paths.socket_name, "patchbay-0");
        assert!(paths.socket_path().ends_with("patchbay-0"));
    }

    #[test]
    fn test_telemetry_defaults() {
        let telemetry = TelemetryConfig::default();
        assert_eq!(telemetry.log_level, "info");
    }

    #[test]
    fn test_scheduler_defaults() {
        let sched = SchedulerConfig::default();
        assert_eq!(sched.sample_rate, 48_000);
        assert_eq!(sched.quantum, 1024);
        assert_eq!(sched.min_margin_us, 100);
    }
}
