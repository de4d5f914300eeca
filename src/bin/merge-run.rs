//! CLI tool to play a merge script without a presentation layer.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use textmerge_rs::{MergeConfig, PlayStatus, Severity, TracingSink, run_script_with_config};
use tracing_subscriber::EnvFilter;

/// Play a recorded merge script (.script) against its data sources.
///
/// Held commands stop an autoplay run; pass --no-autoplay to run them too.
#[derive(Parser)]
#[command(name = "merge-run", version)]
struct Cli {
    /// Script to play
    script: Option<PathBuf>,

    /// Print nothing but errors
    #[arg(short, long)]
    quiet: bool,

    /// Base directory for relative source, template and output paths
    #[arg(long, value_name = "DIR")]
    normalizer_path: Option<PathBuf>,

    /// Lowest severity that is logged: Minor, Normal, Medium or Major
    #[arg(long, value_name = "SEVERITY", default_value = "Normal")]
    log_threshold: Severity,

    /// Log every record as it is loaded
    #[arg(long)]
    log_all_data: bool,

    /// Run held commands instead of stopping before them
    #[arg(long)]
    no_autoplay: bool,
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.log_threshold == Severity::Minor {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let Some(script) = cli.script else {
        eprintln!("No script given. Run with --help for usage.");
        process::exit(2);
    };

    let threshold = if cli.quiet {
        cli.log_threshold.max(Severity::Medium)
    } else {
        cli.log_threshold
    };
    let log = Arc::new(TracingSink::new(threshold).with_all_data(cli.log_all_data));

    let mut config = MergeConfig::headless().with_autoplay(!cli.no_autoplay);
    if let Some(path) = cli.normalizer_path {
        config = config.with_normalizer_path(path);
    }

    match run_script_with_config(config, &script, log, None) {
        Ok(report) => {
            if !cli.quiet {
                eprintln!(
                    "Played {}: {} command(s), {} failure(s)",
                    script.display(),
                    report.executed,
                    report.failures.len()
                );
            }
            if let PlayStatus::Paused { next } = report.status {
                eprintln!("Stopped before held command {}", next + 1);
                process::exit(3);
            }
            if !report.failures.is_empty() {
                process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("Script error: {e}");
            process::exit(1);
        }
    }
}
