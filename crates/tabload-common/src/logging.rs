//! Logging configuration and initialization
//!
//! Binaries call [`init_logging`] once at startup; library crates only emit
//! `tracing` events and never install a subscriber.
//!
//! Console output is written to **stderr**. Stdout is reserved for the load
//! report so that it can be piped or parsed.
//!
//! # Example
//!
//! ```no_run
//! use tabload_common::logging::{init_logging, LogConfig, LogOutput};
//! use tracing::info;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LogConfig::default()
//!         .with_output(LogOutput::Both)
//!         .with_env_overrides()?;
//!     let _guard = init_logging(&config)?;
//!     info!("tabload started");
//!     Ok(())
//! }
//! ```

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::{format::FmtSpan, MakeWriter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

const ENV_LEVEL: &str = "TABLOAD_LOG_LEVEL";
const ENV_OUTPUT: &str = "TABLOAD_LOG_OUTPUT";
const ENV_FORMAT: &str = "TABLOAD_LOG_FORMAT";
const ENV_DIR: &str = "TABLOAD_LOG_DIR";
const ENV_FILTER: &str = "TABLOAD_LOG_FILTER";

/// Driver chatter is noisy at info; per-chunk events come from tabload itself
const DEFAULT_DIRECTIVES: &str = "sqlx=warn";

/// Minimum severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        choose(
            "log level",
            s,
            &[
                ("trace", LogLevel::Trace),
                ("debug", LogLevel::Debug),
                ("info", LogLevel::Info),
                ("warn", LogLevel::Warn),
                ("warning", LogLevel::Warn),
                ("error", LogLevel::Error),
            ],
        )
    }
}

/// Where log lines go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    /// stderr only
    #[default]
    Console,
    /// Daily rolling file only
    File,
    Both,
}

impl LogOutput {
    fn to_console(self) -> bool {
        self != LogOutput::File
    }

    fn to_file(self) -> bool {
        self != LogOutput::Console
    }
}

impl std::str::FromStr for LogOutput {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        choose(
            "log output",
            s,
            &[
                ("console", LogOutput::Console),
                ("stderr", LogOutput::Console),
                ("file", LogOutput::File),
                ("both", LogOutput::Both),
            ],
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        choose("log format", s, &[("text", LogFormat::Text), ("json", LogFormat::Json)])
    }
}

fn choose<T: Copy>(what: &str, value: &str, choices: &[(&str, T)]) -> Result<T> {
    let wanted = value.trim();
    choices
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(wanted))
        .map(|&(_, choice)| choice)
        .ok_or_else(|| {
            let names: Vec<&str> = choices.iter().map(|(name, _)| *name).collect();
            anyhow!("invalid {} '{}' (expected one of: {})", what, wanted, names.join(", "))
        })
}

/// Subscriber settings for one process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: LogLevel,
    pub output: LogOutput,
    pub format: LogFormat,
    /// Used only when `output` includes the file
    pub log_dir: PathBuf,
    /// Rolling files are named `<prefix>.<YYYY-MM-DD>`
    pub log_file_prefix: String,
    /// Extra `target=level` directives, comma separated
    pub filter_directives: String,
    pub include_targets: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            output: LogOutput::default(),
            format: LogFormat::default(),
            log_dir: PathBuf::from("./logs"),
            log_file_prefix: "tabload".to_string(),
            filter_directives: DEFAULT_DIRECTIVES.to_string(),
            include_targets: false,
        }
    }
}

impl LogConfig {
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    pub fn with_log_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.log_file_prefix = prefix.into();
        self
    }

    /// Append directives after the defaults
    pub fn with_filter(mut self, directives: &str) -> Self {
        if !self.filter_directives.is_empty() {
            self.filter_directives.push(',');
        }
        self.filter_directives.push_str(directives);
        self
    }

    /// Overlay `TABLOAD_LOG_{LEVEL,OUTPUT,FORMAT,DIR,FILTER}`; blank values
    /// are ignored
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        if let Some(level) = var(ENV_LEVEL) {
            self.level = level
                .parse::<LogLevel>()
                .with_context(|| format!("{} is invalid", ENV_LEVEL))?;
        }
        if let Some(output) = var(ENV_OUTPUT) {
            self.output = output
                .parse::<LogOutput>()
                .with_context(|| format!("{} is invalid", ENV_OUTPUT))?;
        }
        if let Some(format) = var(ENV_FORMAT) {
            self.format = format
                .parse::<LogFormat>()
                .with_context(|| format!("{} is invalid", ENV_FORMAT))?;
        }
        if let Some(dir) = var(ENV_DIR) {
            self.log_dir = PathBuf::from(dir);
        }
        if let Some(filter) = var(ENV_FILTER) {
            self = self.with_filter(&filter);
        }
        Ok(self)
    }

    fn env_filter(&self) -> Result<EnvFilter> {
        let mut filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::from(self.level).into())
            .from_env_lossy();
        for directive in self.filter_directives.split(',').map(str::trim) {
            if directive.is_empty() {
                continue;
            }
            let directive = directive
                .parse::<Directive>()
                .with_context(|| format!("invalid filter directive '{}'", directive))?;
            filter = filter.add_directive(directive);
        }
        Ok(filter)
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn format_layer<W>(config: &LogConfig, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(config.include_targets)
        .with_span_events(FmtSpan::CLOSE);
    match config.format {
        LogFormat::Text => layer.boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}

/// Install the global tracing subscriber
///
/// Returns the file writer guard when file output is enabled; hold it until
/// exit or buffered lines are lost.
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let mut layers = Vec::new();
    let mut guard = None;

    if config.output.to_console() {
        layers.push(format_layer(config, std::io::stderr, true));
    }

    if config.output.to_file() {
        std::fs::create_dir_all(&config.log_dir).with_context(|| {
            format!("cannot create log directory {}", config.log_dir.display())
        })?;
        let appender = tracing_appender::rolling::daily(&config.log_dir, &config.log_file_prefix);
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        layers.push(format_layer(config, writer, false));
        guard = Some(file_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(config.env_filter()?)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    Ok(guard)
}
