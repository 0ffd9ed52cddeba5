//! Subscriber setup for binaries and tests embedding the generation core.
//!
//! The core only emits `tracing` events; nothing is printed unless the
//! embedding process installs a subscriber, typically through [`init`].
//!
//! Set `STAGEGEN_LOG_FORMAT=json` for JSON logs.
//! Set `RUST_LOG` to control log levels (default: info).

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter,
};

pub const LOG_FORMAT_ENV: &str = "STAGEGEN_LOG_FORMAT";

/// Log format mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Pretty-printed human-readable logs (default).
    Pretty,
    /// JSON-formatted logs for log aggregation.
    Json,
}

impl LogFormat {
    /// Detect log format from environment.
    pub fn from_env() -> Self {
        Self::parse(&std::env::var(LOG_FORMAT_ENV).unwrap_or_default())
    }

    fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Install a global subscriber using `RUST_LOG` and `STAGEGEN_LOG_FORMAT`.
///
/// Fails if a global subscriber is already installed, which tests may ignore.
pub fn init() -> Result<(), TryInitError> {
    init_with_level_and_format(None, LogFormat::from_env())
}

/// `level` is used when `RUST_LOG` is unset (e.g. `"debug"`, `"warn"`).
pub fn init_with_level(level: &str) -> Result<(), TryInitError> {
    init_with_level_and_format(Some(level), LogFormat::from_env())
}

pub fn init_with_level_and_format(
    level: Option<&str>,
    format: LogFormat,
) -> Result<(), TryInitError> {
    let fallback = level.unwrap_or("info");
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init(),
    }
}
