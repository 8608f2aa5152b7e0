//! Tracing setup for fahmond and its test harnesses.
//!
//! Console output goes to stdout, or to stderr when stdout carries a report
//! or event stream. `FAHMON_LOG_FILE` adds a daily-rolling file with the same
//! events. Work done for one client runs inside its [`client_span`], so every
//! line it logs names the client.

use crate::types::ClientIdentifier;
use anyhow::{Context, Result};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::Span;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

const DEFAULT_FILE_NAME: &str = "fahmond.log";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    /// One JSON object per event, with the client span's fields.
    Json,
    Compact,
}

impl LogFormat {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "pretty" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            "compact" => Some(Self::Compact),
            _ => None,
        }
    }
}

/// Where console output goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogConsole {
    #[default]
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directives, e.g. `info` or `info,fahmond::client=debug`.
    pub directives: String,
    pub format: LogFormat,
    pub console: LogConsole,
    /// Daily-rolling log file, in addition to the console.
    pub file: Option<PathBuf>,
}

impl LogConfig {
    pub fn new(directives: impl Into<String>) -> Self {
        Self {
            directives: directives.into(),
            format: LogFormat::default(),
            console: LogConsole::default(),
            file: None,
        }
    }

    /// Start from `default_directives`, then apply `FAHMON_LOG_LEVEL`,
    /// `FAHMON_LOG_FORMAT` (pretty|json|compact) and `FAHMON_LOG_FILE`.
    pub fn from_env(default_directives: &str) -> Self {
        let mut config = Self::new(
            std::env::var("FAHMON_LOG_LEVEL").unwrap_or_else(|_| default_directives.to_string()),
        );
        if let Some(format) = std::env::var("FAHMON_LOG_FORMAT")
            .ok()
            .and_then(|f| LogFormat::parse(&f))
        {
            config.format = format;
        }
        config.file = std::env::var_os("FAHMON_LOG_FILE")
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);
        config
    }

    /// `-v` is debug, `-vv` and more is trace.
    pub fn with_verbosity(mut self, verbose: u8) -> Self {
        match verbose {
            0 => {}
            1 => self.directives = "debug".to_string(),
            _ => self.directives = "trace".to_string(),
        }
        self
    }

    pub fn with_stderr(mut self) -> Self {
        self.console = LogConsole::Stderr;
        self
    }

    /// `RUST_LOG` when set and valid, else the configured directives.
    pub fn env_filter(&self) -> EnvFilter {
        if std::env::var_os("RUST_LOG").is_some() {
            if let Ok(filter) = EnvFilter::try_from_default_env() {
                return filter;
            }
        }
        self.configured_filter()
    }

    /// Invalid directives fall back to `info`.
    fn configured_filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.directives).unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new("info")
    }
}

/// Keeps the file writer alive; dropping it flushes buffered lines.
pub struct LoggingGuards {
    _file_guard: Option<WorkerGuard>,
}

/// Install the global subscriber. Keep the returned guards until exit.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuards> {
    let console = match config.console {
        LogConsole::Stdout => BoxMakeWriter::new(std::io::stdout),
        LogConsole::Stderr => BoxMakeWriter::new(std::io::stderr),
    };
    let mut layers = vec![format_layer(config.format, console, true)];

    let file_guard = config.file.as_deref().map(|path| {
        let (writer, guard) = rolling_file(path);
        layers.push(format_layer(config.format, writer, false));
        guard
    });

    tracing_subscriber::registry()
        .with(layers)
        .with(config.env_filter())
        .try_init()
        .context("installing tracing subscriber")?;

    Ok(LoggingGuards {
        _file_guard: file_guard,
    })
}

fn format_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer().with_writer(writer).with_target(true);
    match format {
        LogFormat::Pretty => layer.pretty().with_ansi(ansi).boxed(),
        LogFormat::Json => layer
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .boxed(),
        LogFormat::Compact => layer.compact().with_ansi(ansi).boxed(),
    }
}

fn rolling_file(path: &Path) -> (tracing_appender::non_blocking::NonBlocking, WorkerGuard) {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .unwrap_or_else(|| OsStr::new(DEFAULT_FILE_NAME));
    tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, file_name))
}

/// Span carrying a client's name and address.
pub fn client_span(client: &ClientIdentifier) -> Span {
    tracing::info_span!("client", name = %client.name, address = %client.address())
}
