use crate::error::CdaResult;
use crate::types::LogLevel;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Logging configuration structure. The hosting runtime owns config-file
/// parsing; this is the already-typed result it hands to
/// [`initialize_logging`] once at process start.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    pub include_timestamps: bool,
    pub include_thread_ids: bool,
    pub include_file_locations: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Pretty,
            include_timestamps: true,
            include_thread_ids: false,
            include_file_locations: false,
        }
    }
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
    Compact,
}

/// Initialize the logging framework with the specified configuration.
///
/// Idempotent from the caller's perspective only in the sense that a
/// second call is a programmer error (the global subscriber can only be
/// installed once); the hosting runtime calls this exactly once at
/// startup.
pub fn initialize_logging(config: LoggingConfig) -> CdaResult<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level_str = match config.level {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };
        EnvFilter::new(level_str)
    });

    let fmt_layer = match config.format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_thread_ids(config.include_thread_ids)
            .with_file(config.include_file_locations)
            .with_line_number(config.include_file_locations)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_thread_ids(config.include_thread_ids)
            .with_file(config.include_file_locations)
            .with_line_number(config.include_file_locations)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_thread_ids(config.include_thread_ids)
            .with_file(config.include_file_locations)
            .with_line_number(config.include_file_locations)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    tracing::info!("logging initialized at level {}", config.level);
    Ok(())
}

/// Initialize logging with default configuration.
pub fn initialize_default_logging() -> CdaResult<()> {
    initialize_logging(LoggingConfig::default())
}
