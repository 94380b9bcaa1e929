//! Command-line arguments, mirroring the `Args`/`MetaArgs` split this
//! crate's sibling tile server uses: flags with no config-file
//! equivalent live here, everything else is read from a scenario file
//! (spec SPEC_FULL.md §A.2).

use std::path::PathBuf;

use clap::Parser;
use clap::builder::Styles;
use clap::builder::styling::AnsiColor;

use crate::logging::LogFormat;

/// Defines the styles used for the CLI help output.
const HELP_STYLES: Styles = Styles::styled()
    .header(AnsiColor::Blue.on_default().bold())
    .usage(AnsiColor::Blue.on_default().bold())
    .literal(AnsiColor::White.on_default())
    .placeholder(AnsiColor::Green.on_default());

/// Command-line harness for the adaptive spatial filter engine: loads a
/// scenario file describing in-memory layers and a filter request, runs
/// it through the engine, and prints the resulting subset per layer.
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(
    about,
    version,
    after_help = "Use RUST_LOG to control log verbosity, e.g. RUST_LOG=debug or RUST_LOG=filtermate_core=debug.",
    styles = HELP_STYLES
)]
pub struct Args {
    /// Path to an engine config file (YAML). Unset sections fall back to
    /// the engine's built-in defaults.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Path to a scenario file describing layers, features, and the
    /// filter request to run.
    pub scenario: PathBuf,

    /// Output log format. Defaults to `pretty` in debug builds, `compact`
    /// in release builds.
    #[arg(long)]
    pub log_format: Option<LogFormat>,

    /// `RUST_LOG`-style filter string; overrides the `RUST_LOG`
    /// environment variable when set.
    #[arg(long, default_value = "info")]
    pub log_filter: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scenario_positional_and_flags() {
        let args = Args::parse_from(["filtermate", "--log-format", "json", "scenario.json"]);
        assert_eq!(args.scenario, PathBuf::from("scenario.json"));
        assert_eq!(args.log_format, Some(LogFormat::Json));
        assert_eq!(args.log_filter, "info");
    }

    #[test]
    fn config_flag_is_optional() {
        let args = Args::parse_from(["filtermate", "-c", "engine.yaml", "scenario.json"]);
        assert_eq!(args.config, Some(PathBuf::from("engine.yaml")));
    }
}
