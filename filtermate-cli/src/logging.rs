//! Logging initialization using `tracing` and `tracing-subscriber`,
//! mirroring the `LogFormat` this crate's sibling tile server exposes:
//! an [`EnvFilter`] controls level filtering, [`LogFormat`] controls
//! output shape, and `log` records get bridged into `tracing` once at
//! startup.

use std::str::FromStr;

use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

/// Log output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[value(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, single-line logs.
    Full,
    /// A shorter variant of `full`.
    Compact,
    /// No timestamps, spans, locations, or ANSI colors.
    Bare,
    /// Multi-line, excessively pretty logs for local debugging.
    Pretty,
    /// Newline-delimited JSON.
    Json,
}

impl LogFormat {
    /// Initializes the global `tracing` subscriber for this format, then
    /// bridges `log` records (emitted by dependencies still using the
    /// `log` facade) into it.
    pub fn init(self, env_filter: EnvFilter) {
        init_log_bridge(&env_filter);
        let dispatch = match self {
            LogFormat::Full => tracing_subscriber::fmt().with_span_events(FmtSpan::NONE).with_env_filter(env_filter).finish().into(),
            LogFormat::Compact => tracing_subscriber::fmt()
                .compact()
                .with_span_events(FmtSpan::NONE)
                .with_env_filter(env_filter)
                .finish()
                .into(),
            LogFormat::Pretty => tracing_subscriber::fmt().pretty().with_env_filter(env_filter).finish().into(),
            LogFormat::Bare => tracing_subscriber::fmt()
                .compact()
                .with_span_events(FmtSpan::NONE)
                .without_time()
                .with_target(false)
                .with_ansi(false)
                .with_env_filter(env_filter)
                .finish()
                .into(),
            LogFormat::Json => tracing_subscriber::fmt().json().with_span_events(FmtSpan::NONE).with_env_filter(env_filter).finish().into(),
        };
        tracing::dispatcher::set_global_default(dispatch).expect("failed to set global default subscriber");
    }
}

impl Default for LogFormat {
    fn default() -> Self {
        if cfg!(debug_assertions) { LogFormat::Pretty } else { LogFormat::Compact }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "compact" => Ok(Self::Compact),
            "pretty" | "verbose" => Ok(Self::Pretty),
            "bare" => Ok(Self::Bare),
            "json" | "jsonl" => Ok(Self::Json),
            _ => Err(format!("invalid log format '{s}'. Valid options: json, full, compact, bare or pretty")),
        }
    }
}

/// Bridges `log` records into `tracing`, matching whatever max level the
/// `tracing` env filter resolved to so a dependency still logging
/// through `log` doesn't flood output the `tracing` side would have
/// filtered out.
fn init_log_bridge(env_filter: &EnvFilter) {
    let mut log_builder = tracing_log::LogTracer::builder().with_interest_cache(tracing_log::InterestCacheConfig::default());
    if let Some(Some(max_level)) = env_filter.max_level_hint().map(LevelFilter::into_level) {
        let max_level = match max_level {
            Level::TRACE => log::LevelFilter::Trace,
            Level::DEBUG => log::LevelFilter::Debug,
            Level::INFO => log::LevelFilter::Info,
            Level::WARN => log::LevelFilter::Warn,
            Level::ERROR => log::LevelFilter::Error,
        };
        log_builder = log_builder.with_max_level(max_level);
    }
    log_builder.init().expect("failed to initialize log -> tracing bridge: LogTracer already set");
}

/// Builds the process-wide subscriber from a `RUST_LOG`-style filter
/// string and the resolved output format (spec SPEC_FULL.md §B.2).
pub fn init_tracing(filter: &str, format: LogFormat) {
    let env_filter = EnvFilter::from_str(filter).unwrap_or_else(|_| {
        eprintln!("warning: invalid filter string '{filter}', falling back to 'info'");
        EnvFilter::new("info")
    });
    format.init(env_filter);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_formats_case_insensitively() {
        assert_eq!("FULL".parse::<LogFormat>(), Ok(LogFormat::Full));
        assert_eq!("Bare".parse::<LogFormat>(), Ok(LogFormat::Bare));
        assert_eq!("verbose".parse::<LogFormat>(), Ok(LogFormat::Pretty));
        assert_eq!("jsonl".parse::<LogFormat>(), Ok(LogFormat::Json));
    }

    #[test]
    fn unknown_format_is_rejected() {
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn default_depends_on_build_profile() {
        let expected = if cfg!(debug_assertions) { LogFormat::Pretty } else { LogFormat::Compact };
        assert_eq!(LogFormat::default(), expected);
    }
}
