//! Worker and registry configuration.
//!
//! # Environment Variables
//!
//! Read by [`RegistryConfig::with_env_overrides`]:
//!
//! - `ISOFORK_WORKER_PROGRAM` - Executable that hosts worker runtimes
//! - `ISOFORK_DEBUG` - Force debug mode on (`1`, `true`, `on`) or off (`0`, `false`, `off`)
//! - `ISOFORK_STARTUP_TIMEOUT_MS` - How long to wait for a bootstrap report

use crate::error::{ForkError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::ffi::OsString;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default per-request timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

/// Per-worker configuration supplied at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    /// Request timeout in milliseconds (must be > 0).
    #[serde(default = "default_timeout_ms", alias = "timeout")]
    pub timeout_ms: u64,
    /// Debug port handed to the worker process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_port: Option<u16>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            debug_port: None,
        }
    }
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    /// Set an explicit debug port.
    pub fn with_debug_port(mut self, port: u16) -> Self {
        self.debug_port = Some(port);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Check field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(ForkError::InvalidConfig(
                "timeoutMs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Build a config from an untyped value, which must be a JSON object.
    pub fn from_value(value: &Value) -> Result<Self> {
        if !value.is_object() {
            return Err(ForkError::ConfigNotAnObject {
                config: value.clone(),
            });
        }
        let config: Self = serde_json::from_value(value.clone())
            .map_err(|e| ForkError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

/// Whether workers get their own debug port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DebugMode {
    /// Follow the parent: on when a debugger is attached to this process.
    #[default]
    Auto,
    On,
    Off,
}

impl DebugMode {
    pub fn is_active(&self) -> bool {
        match self {
            Self::Auto => debugger_attached(),
            Self::On => true,
            Self::Off => false,
        }
    }
}

impl FromStr for DebugMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "1" | "true" | "on" | "yes" => Ok(Self::On),
            "0" | "false" | "off" | "no" => Ok(Self::Off),
            _ => Err(format!(
                "Unknown debug mode: '{}'. Valid options: auto, on, off",
                s
            )),
        }
    }
}

/// Extract the `TracerPid` field from the contents of `/proc/<pid>/status`.
fn tracer_pid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|pid| pid.trim().parse().ok())
}

/// Whether a debugger (ptrace tracer) is attached to this process.
pub fn debugger_attached() -> bool {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|status| tracer_pid(&status))
            .is_some_and(|pid| pid != 0)
    }

    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

/// Registry-wide configuration: how workers are launched and torn down.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Executable that runs the worker runtime (default: the current executable).
    pub worker_program: PathBuf,
    /// Arguments placed before `<NAME> <PATH>` (default: `worker`).
    pub worker_args: Vec<OsString>,
    /// Debug port allocation policy.
    pub debug_mode: DebugMode,
    /// Maximum wait for a worker's bootstrap report.
    pub startup_timeout: Duration,
    /// Time between SIGINT and SIGKILL when stopping a worker.
    pub shutdown_grace: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            worker_program: std::env::current_exe().unwrap_or_else(|_| PathBuf::from("isofork")),
            worker_args: vec![OsString::from("worker")],
            debug_mode: DebugMode::Auto,
            startup_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl RegistryConfig {
    /// Configuration launching `program` with the default `worker` argument.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            worker_program: program.into(),
            ..Self::default()
        }
    }

    /// Replace the arguments placed before `<NAME> <PATH>`.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.worker_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_debug_mode(mut self, mode: DebugMode) -> Self {
        self.debug_mode = mode;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Apply environment variable overrides.
    ///
    /// Unparseable values are ignored and the current setting is kept.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(program) = std::env::var("ISOFORK_WORKER_PROGRAM")
            && !program.is_empty()
        {
            self.worker_program = PathBuf::from(program);
        }

        if let Ok(mode) = std::env::var("ISOFORK_DEBUG")
            && let Ok(mode) = mode.parse()
        {
            self.debug_mode = mode;
        }

        if let Ok(ms) = std::env::var("ISOFORK_STARTUP_TIMEOUT_MS")
            && let Ok(ms) = ms.parse::<u64>()
        {
            self.startup_timeout = Duration::from_millis(ms);
        }

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.timeout_ms, 30_000);
        assert_eq!(config.debug_port, None);
        assert_eq!(config.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_worker_config_from_object() {
        let config = WorkerConfig::from_value(&json!({ "timeoutMs": 250, "debugPort": 9229 })).unwrap();
        assert_eq!(config.timeout_ms, 250);
        assert_eq!(config.debug_port, Some(9229));

        // Missing fields fall back to defaults; unknown keys are tolerated.
        let config = WorkerConfig::from_value(&json!({ "other": true })).unwrap();
        assert_eq!(config, WorkerConfig::default());

        // Legacy key name.
        let config = WorkerConfig::from_value(&json!({ "timeout": 10 })).unwrap();
        assert_eq!(config.timeout_ms, 10);
    }

    #[test]
    fn test_worker_config_rejects_non_objects() {
        for value in [json!("fast"), json!(5), json!([1]), json!(true)] {
            assert!(matches!(
                WorkerConfig::from_value(&value),
                Err(ForkError::ConfigNotAnObject { .. })
            ));
        }
    }

    #[test]
    fn test_worker_config_rejects_bad_fields() {
        assert!(matches!(
            WorkerConfig::from_value(&json!({ "timeoutMs": 0 })),
            Err(ForkError::InvalidConfig(_))
        ));
        assert!(matches!(
            WorkerConfig::from_value(&json!({ "timeoutMs": "soon" })),
            Err(ForkError::InvalidConfig(_))
        ));
        assert!(matches!(
            WorkerConfig::from_value(&json!({ "debugPort": 70000 })),
            Err(ForkError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_worker_config_builder() {
        let config = WorkerConfig::new()
            .with_timeout(Duration::from_millis(1500))
            .with_debug_port(9000);
        assert_eq!(config.timeout_ms, 1500);
        assert_eq!(config.debug_port, Some(9000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_debug_mode_from_str() {
        assert_eq!("on".parse::<DebugMode>().unwrap(), DebugMode::On);
        assert_eq!("1".parse::<DebugMode>().unwrap(), DebugMode::On);
        assert_eq!("OFF".parse::<DebugMode>().unwrap(), DebugMode::Off);
        assert_eq!("auto".parse::<DebugMode>().unwrap(), DebugMode::Auto);
        assert!("sometimes".parse::<DebugMode>().is_err());
        assert!(DebugMode::On.is_active());
        assert!(!DebugMode::Off.is_active());
    }

    #[test]
    fn test_tracer_pid() {
        let status = "Name:\tisofork\nState:\tS (sleeping)\nTracerPid:\t4242\nUid:\t0\n";
        assert_eq!(tracer_pid(status), Some(4242));
        assert_eq!(tracer_pid("TracerPid:\t0\n"), Some(0));
        assert_eq!(tracer_pid("Name:\tx\n"), None);
    }

    #[test]
    fn test_registry_config_builder() {
        let config = RegistryConfig::new("/usr/bin/worker")
            .with_args(["run", "--quiet"])
            .with_debug_mode(DebugMode::Off)
            .with_startup_timeout(Duration::from_secs(5))
            .with_shutdown_grace(Duration::from_millis(100));

        assert_eq!(config.worker_program, PathBuf::from("/usr/bin/worker"));
        assert_eq!(
            config.worker_args,
            vec![OsString::from("run"), OsString::from("--quiet")]
        );
        assert_eq!(config.debug_mode, DebugMode::Off);
        assert_eq!(config.startup_timeout, Duration::from_secs(5));
        assert_eq!(config.shutdown_grace, Duration::from_millis(100));
    }

    #[test]
    fn test_registry_config_default_args() {
        let config = RegistryConfig::default();
        assert_eq!(config.worker_args, vec![OsString::from("worker")]);
        assert_eq!(config.debug_mode, DebugMode::Auto);
    }
}
