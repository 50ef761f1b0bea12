//! Logging setup for the CLI and embedders.
//!
//! # Environment Variables
//!
//! - `CLONIFIER_LOG` - Log filter (overrides RUST_LOG)
//! - `CLONIFIER_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `CLONIFIER_LOG_FORMAT` - Output format: pretty, compact, json
//! - `CLONIFIER_LOG_FILE` - Path to log file (in addition to stderr)
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! Worker processes do not use this module: their events are forwarded to
//! the UI side as `log` messages (see `worker::log_forward`).
//!
//! # Example
//!
//! ```no_run
//! use clonifier::logging::{LogConfig, init};
//!
//! init(LogConfig::for_cli(1, false).with_env_overrides());
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{Level, Subscriber};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, MakeWriter},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable multi-field format
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON lines
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Rotation of the log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    /// Single file
    Never,
}

impl FromStr for LogRotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "never" => Ok(Self::Never),
            _ => Err(format!(
                "Unknown log rotation: '{}'. Valid options: hourly, daily, never",
                s
            )),
        }
    }
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (default: WARN)
    pub level: Level,
    pub format: LogFormat,
    /// Also log to this file
    pub file_path: Option<PathBuf>,
    pub rotation: LogRotation,
    /// Filter directive; overrides `level` when set
    pub filter: Option<String>,
    pub show_target: bool,
    pub show_thread_ids: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::WARN,
            format: LogFormat::Compact,
            file_path: None,
            rotation: LogRotation::Daily,
            filter: None,
            show_target: true,
            show_thread_ids: false,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for the command line: `-v` info, `-vv` debug, `-vvv` trace,
    /// `-q` errors only.
    ///
    /// Explicit flags become a filter so they win over the environment.
    pub fn for_cli(verbose: u8, quiet: bool) -> Self {
        let config = Self::default();
        let level = match (quiet, verbose) {
            (true, _) => Level::ERROR,
            (false, 0) => return config,
            (false, 1) => Level::INFO,
            (false, 2) => Level::DEBUG,
            (false, _) => Level::TRACE,
        };
        config
            .with_level(level)
            .with_filter(level.as_str().to_lowercase())
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_rotation(mut self, rotation: LogRotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Apply `CLONIFIER_LOG*` / `RUST_LOG` overrides.
    ///
    /// A filter that is already set (from CLI flags) is kept.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if self.filter.is_none() {
            self.filter = var("CLONIFIER_LOG").or_else(|| var("RUST_LOG"));
        }

        if self.filter.is_none()
            && let Some(level) = var("CLONIFIER_LOG_LEVEL").and_then(|s| parse_level(&s))
        {
            self.level = level;
        }

        if let Some(format) = var("CLONIFIER_LOG_FORMAT").and_then(|s| s.parse().ok()) {
            self.format = format;
        }

        if let Some(path) = var("CLONIFIER_LOG_FILE") {
            self.file_path = Some(PathBuf::from(path));
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.level.as_str().to_lowercase());
        match &self.filter {
            Some(filter) => EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                fallback()
            }),
            None => fallback(),
        }
    }

    fn file_appender(&self) -> Option<RollingFileAppender> {
        let path = self.file_path.as_ref()?;
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("clonifier.log");
        Some(RollingFileAppender::new(
            self.rotation.into(),
            parent,
            file_name,
        ))
    }
}

/// Parse a log level string.
pub fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

fn fmt_layer<S, W>(config: &LogConfig, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_target(config.show_target)
        .with_thread_ids(config.show_thread_ids)
        .with_ansi(ansi)
        .with_writer(writer);
    match config.format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
        LogFormat::Pretty => layer.boxed(),
    }
}

/// Install the global subscriber: stderr, plus the log file if configured.
///
/// Later calls are ignored.
pub fn init(config: LogConfig) {
    let file = config
        .file_appender()
        .map(|appender| fmt_layer(&config, appender, false));

    let _ = tracing_subscriber::registry()
        .with(config.build_filter())
        .with(fmt_layer(&config, std::io::stderr, true))
        .with(file)
        .try_init();
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
    fn test_log_format_from_str() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("full".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("invalid".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_log_rotation_from_str() {
        assert_eq!("hourly".parse::<LogRotation>().unwrap(), LogRotation::Hourly);
        assert_eq!("never".parse::<LogRotation>().unwrap(), LogRotation::Never);
        assert!("weekly".parse::<LogRotation>().is_err());
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("warning"), Some(Level::WARN));
        assert_eq!(parse_level("INFO"), Some(Level::INFO));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_cli_verbosity() {
        assert_eq!(LogConfig::for_cli(0, false).level, Level::WARN);
        assert!(LogConfig::for_cli(0, false).filter.is_none());
        assert_eq!(LogConfig::for_cli(1, false).level, Level::INFO);
        assert_eq!(LogConfig::for_cli(2, false).filter.as_deref(), Some("debug"));
        assert_eq!(LogConfig::for_cli(5, false).level, Level::TRACE);
        assert_eq!(LogConfig::for_cli(3, true).level, Level::ERROR);
    }

    #[test]
    fn test_env_filter_precedence() {
        let config = LogConfig::new().with_overrides_from(env(&[
            ("RUST_LOG", "info"),
            ("CLONIFIER_LOG", "clonifier=debug"),
        ]));
        assert_eq!(config.filter.as_deref(), Some("clonifier=debug"));

        let config = LogConfig::for_cli(1, false)
            .with_overrides_from(env(&[("CLONIFIER_LOG", "trace")]));
        assert_eq!(config.filter.as_deref(), Some("info"));
    }

    #[test]
    fn test_env_level_format_and_file() {
        let config = LogConfig::new().with_overrides_from(env(&[
            ("CLONIFIER_LOG_LEVEL", "debug"),
            ("CLONIFIER_LOG_FORMAT", "json"),
            ("CLONIFIER_LOG_FILE", "/tmp/clonifier.log"),
        ]));
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.file_path, Some(PathBuf::from("/tmp/clonifier.log")));
    }

    #[test]
    fn test_bad_format_is_ignored() {
        let config =
            LogConfig::new().with_overrides_from(env(&[("CLONIFIER_LOG_FORMAT", "xml")]));
        assert_eq!(config.format, LogFormat::Compact);
    }
}
