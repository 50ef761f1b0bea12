//! Bridge configuration.
//!
//! # Environment Variables
//!
//! - `CLONIFIER_BACKEND` - Primary backend: process, thread
//! - `CLONIFIER_FALLBACK` - Fallback backend: process, thread, none
//! - `CLONIFIER_WORKER_EXE` - Executable the process backend launches
//! - `CLONIFIER_CALL_TIMEOUT_MS` - Per-call deadline in milliseconds
//! - `CLONIFIER_LOG_CAPACITY` - Worker log entries kept for display

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::filter::LevelFilter;

/// Default number of worker log entries kept in memory.
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// Where the worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// A child process speaking JSON lines on stdin/stdout.
    Process,
    /// A dedicated thread in this process.
    Thread,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Process => "process",
            Self::Thread => "thread",
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "process" | "subprocess" => Ok(Self::Process),
            "thread" => Ok(Self::Thread),
            _ => Err(format!(
                "Unknown backend: '{}'. Valid options: process, thread",
                s
            )),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for one [`Connection`](crate::bridge::Connection).
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    /// Backend tried first (default: Process)
    pub primary: BackendKind,
    /// Backend used when the primary fails before it is ready (default: Thread)
    pub fallback: Option<BackendKind>,
    /// Worker executable for the process backend (None = current executable)
    pub worker_exe: Option<PathBuf>,
    /// Deadline for every call (None = wait forever)
    pub call_timeout: Option<Duration>,
    /// Worker log entries kept in memory
    pub log_capacity: usize,
    /// Most verbose level the worker forwards
    pub worker_log_level: LevelFilter,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            primary: BackendKind::Process,
            fallback: Some(BackendKind::Thread),
            worker_exe: None,
            call_timeout: None,
            log_capacity: DEFAULT_LOG_CAPACITY,
            worker_log_level: LevelFilter::INFO,
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// In-process only: a thread worker and no fallback.
    pub fn in_process() -> Self {
        Self {
            primary: BackendKind::Thread,
            fallback: None,
            ..Self::default()
        }
    }

    pub fn with_primary(mut self, primary: BackendKind) -> Self {
        self.primary = primary;
        self
    }

    pub fn with_fallback(mut self, fallback: Option<BackendKind>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_worker_exe(mut self, exe: PathBuf) -> Self {
        self.worker_exe = Some(exe);
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity;
        self
    }

    pub fn with_worker_log_level(mut self, level: LevelFilter) -> Self {
        self.worker_log_level = level;
        self
    }

    /// Apply environment variable overrides.
    ///
    /// Invalid values are reported and ignored.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(value) = var("CLONIFIER_BACKEND") {
            match value.parse() {
                Ok(kind) => self.primary = kind,
                Err(e) => warn!("Ignoring CLONIFIER_BACKEND: {}", e),
            }
        }

        if let Some(value) = var("CLONIFIER_FALLBACK") {
            if value.eq_ignore_ascii_case("none") {
                self.fallback = None;
            } else {
                match value.parse() {
                    Ok(kind) => self.fallback = Some(kind),
                    Err(e) => warn!("Ignoring CLONIFIER_FALLBACK: {}", e),
                }
            }
        }

        if let Some(path) = var("CLONIFIER_WORKER_EXE") {
            self.worker_exe = Some(PathBuf::from(path));
        }

        if let Some(value) = var("CLONIFIER_CALL_TIMEOUT_MS") {
            match value.parse::<u64>() {
                Ok(0) => self.call_timeout = None,
                Ok(ms) => self.call_timeout = Some(Duration::from_millis(ms)),
                Err(e) => warn!("Ignoring CLONIFIER_CALL_TIMEOUT_MS: {}", e),
            }
        }

        if let Some(value) = var("CLONIFIER_LOG_CAPACITY")
            && let Ok(capacity) = value.parse()
        {
            self.log_capacity = capacity;
        }

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.primary, BackendKind::Process);
        assert_eq!(config.fallback, Some(BackendKind::Thread));
        assert!(config.call_timeout.is_none());
        assert_eq!(config.log_capacity, DEFAULT_LOG_CAPACITY);
    }

    #[test]
    fn test_backend_kind_from_str() {
        assert_eq!("process".parse::<BackendKind>().unwrap(), BackendKind::Process);
        assert_eq!("THREAD".parse::<BackendKind>().unwrap(), BackendKind::Thread);
        assert!("gpu".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let config = BridgeConfig::default().with_overrides_from(env(&[
            ("CLONIFIER_BACKEND", "thread"),
            ("CLONIFIER_FALLBACK", "none"),
            ("CLONIFIER_CALL_TIMEOUT_MS", "1500"),
            ("CLONIFIER_LOG_CAPACITY", "10"),
            ("CLONIFIER_WORKER_EXE", "/opt/clonifier"),
        ]));
        assert_eq!(config.primary, BackendKind::Thread);
        assert_eq!(config.fallback, None);
        assert_eq!(config.call_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.log_capacity, 10);
        assert_eq!(config.worker_exe, Some(PathBuf::from("/opt/clonifier")));
    }

    #[test]
    fn test_invalid_env_values_are_ignored() {
        let config = BridgeConfig::default().with_overrides_from(env(&[
            ("CLONIFIER_BACKEND", "gpu"),
            ("CLONIFIER_CALL_TIMEOUT_MS", "soon"),
        ]));
        assert_eq!(config, BridgeConfig::default());
    }

    #[test]
    fn test_zero_timeout_disables_deadline() {
        let config = BridgeConfig::default()
            .with_call_timeout(Duration::from_secs(1))
            .with_overrides_from(env(&[("CLONIFIER_CALL_TIMEOUT_MS", "0")]));
        assert!(config.call_timeout.is_none());
    }
}
