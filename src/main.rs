use std::process::ExitCode;

use anyhow::Result;
use camino::Utf8PathBuf;
use clap::Parser;
use tracing::*;
use tracing_subscriber::{filter::LevelFilter, fmt};

use duffel::{config, counters, errors, ui};

/// A deduplicating, content-addressed backup engine.
#[derive(Debug, Parser)]
#[command(name = "duffel", version, verbatim_doc_comment)]
struct Args {
    /// Verbosity (-v, -vv, -vvv, etc.)
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only print errors
    #[clap(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Repository location (default: $DUFFEL_DIR, the config file, or ~/.duffel)
    #[clap(long, global = true)]
    repo: Option<Utf8PathBuf>,

    #[clap(subcommand)]
    subcommand: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
enum Subcommand {
    /// Create an empty repository
    Init,
    /// Build or refresh the file index that save consumes
    Index(ui::index::Args),
    /// Archive the indexed sources as trees and a commit
    Save(ui::save::Args),
    /// List saved trees
    Ls(ui::ls::Args),
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logger(args.verbose, args.quiet);

    let result = run(args);
    counters::log_counts();

    match result {
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
        Ok(()) if errors::count() > 0 => {
            warn!("{} errors encountered while saving.", errors::count());
            ExitCode::FAILURE
        }
        Ok(()) => ExitCode::SUCCESS,
    }
}

fn run(args: Args) -> Result<()> {
    let config = config::load()?;
    let repo = config::repository(args.repo, &config)?;

    match args.subcommand {
        Subcommand::Init => ui::init::run(&repo),
        Subcommand::Index(i) => ui::index::run(&repo, i),
        Subcommand::Save(s) => ui::save::run(&config, &repo, args.verbose, s),
        Subcommand::Ls(l) => ui::ls::run(&config, &repo, l),
    }
}

/// Set up tracing to spit messages to stderr.
fn init_logger(verbosity: u8, quiet: bool) {
    let level = if quiet {
        LevelFilter::ERROR
    } else {
        match verbosity {
            0 => LevelFilter::WARN,
            1 => LevelFilter::INFO,
            2 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    };

    fmt()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}
