//! Logging initialization using tracing.
//!
//! Log lines go to stderr so command output on stdout stays machine-readable.

use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use tracing_subscriber::{
    fmt::{self, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Directives appended to every filter to keep HTTP plumbing quiet.
const QUIET_DEPENDENCIES: &[&str] = &["hyper=warn", "hyper_util=warn", "reqwest=warn", "rustls=warn"];

/// Output format of log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, one event per line
    #[default]
    Pretty,
    /// One JSON object per line, for log aggregation
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(anyhow!("unknown log format '{}' (expected pretty or json)", other)),
        }
    }
}

/// Build the event filter. `RUST_LOG` wins over `level` when set.
pub fn build_filter(level: &str) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let mut directives = vec![level.to_string()];
    directives.extend(QUIET_DEPENDENCIES.iter().map(|d| d.to_string()));
    EnvFilter::try_new(directives.join(",")).with_context(|| format!("invalid log level '{}'", level))
}

/// Initialize the global tracing subscriber.
///
/// # Arguments
/// * `level` - Log level or filter directives (trace, debug, info, warn, error)
/// * `format` - Line format
pub fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    let filter = build_filter(level)?;
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_target(true),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_target(true)
                    .with_current_span(true),
            )
            .try_init(),
    }
    .context("failed to install the tracing subscriber")
}

/// Initialize logging with JSON output format.
pub fn init_logging_json(level: &str) -> Result<()> {
    init_logging(level, LogFormat::Json)
}
