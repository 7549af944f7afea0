use anyhow::{Context, Result, ensure};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;

use crate::index;
use crate::paths;

/// Build or refresh the file index for the given paths.
#[derive(Debug, Parser)]
pub struct Args {
    /// The name of the index file (normally REPO/bupindex)
    #[clap(short = 'f', long)]
    indexfile: Option<Utf8PathBuf>,

    /// What to index
    #[clap(required = true)]
    paths: Vec<Utf8PathBuf>,
}

pub fn run(repo: &Utf8Path, args: Args) -> Result<()> {
    let indexfile = match args.indexfile {
        Some(f) => f,
        None => {
            ensure!(
                repo.is_dir(),
                "{repo} is not a repository; run `duffel init` first"
            );
            repo.join("bupindex")
        }
    };
    let sources = paths::normalize_sources(&args.paths)?;
    index::update(&indexfile, &sources).context("Indexing failed")?;
    Ok(())
}
