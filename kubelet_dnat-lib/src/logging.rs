use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use std::fmt::{self as std_fmt, Display};
use std::str::FromStr;

const DEFAULT_LOG_FILTER: &str = "info";
const DEBUG_LOG_FILTER: &str = "debug";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human readable lines with ANSI colors.
    #[default]
    Console,
    /// One JSON object per line, for log collectors.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "console" => Ok(LogFormat::Console),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format {other}, expected console or json")),
        }
    }
}

impl Display for LogFormat {
    fn fmt(&self, f: &mut std_fmt::Formatter<'_>) -> std_fmt::Result {
        match self {
            LogFormat::Console => write!(f, "console"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Filter from `RUST_LOG`, falling back to `info` or `debug`.
fn env_filter(debug: bool) -> EnvFilter {
    let fallback = if debug { DEBUG_LOG_FILTER } else { DEFAULT_LOG_FILTER };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Initializes the global `tracing` subscriber with stdout logging.
///
/// Sets up a [`tracing_subscriber::Registry`] with:
///
/// 1. A **formatting layer** writing to stdout, either as console lines or JSON.
/// 2. An **[`EnvFilter`]** read from the `RUST_LOG` environment variable; if
///    that is unset or invalid it defaults to `"info"`, or `"debug"` when
///    `debug` is set.
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn setup_stdout(format: LogFormat, debug: bool) {
    let filter = env_filter(debug);
    match format {
        LogFormat::Console => tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(true))
            .with(filter)
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json().with_current_span(false))
            .with(filter)
            .init(),
    }
    tracing::debug!(%format, "logging initialized with stdout output");
}
