use anyhow::{Context, Result};
use camino::Utf8Path;
use clap::Parser;

use crate::config::Configuration;
use crate::hashing::ObjectId;
use crate::ls;
use crate::store::{ObjectStore, fs::FsStore};

/// List the contents of a saved tree.
#[derive(Debug, Parser)]
pub struct Args {
    /// Show hash for each file
    #[clap(short = 's', long = "hash")]
    hash: bool,

    /// Use a detailed, long listing format
    #[clap(short = 'l', long)]
    long: bool,

    /// Show hidden files
    #[clap(short = 'a', long)]
    all: bool,

    /// BRANCH[/path/in/archive], or a hex tree/commit oid
    #[clap(required = true)]
    paths: Vec<String>,
}

pub fn run(config: &Configuration, repo: &Utf8Path, args: Args) -> Result<()> {
    let store = FsStore::open(repo, config.compress.unwrap_or(1))?;

    for path in &args.paths {
        let (start, rest) = match path.split_once('/') {
            Some((s, r)) => (s, r),
            None => (path.as_str(), ""),
        };
        let oid = match store.read_ref(start)? {
            Some(oid) => oid,
            None => start
                .parse::<ObjectId>()
                .with_context(|| format!("{start} is neither a branch nor an oid"))?,
        };
        let root = ls::tree_of(&store, &oid)?;
        let item = ls::resolve(&store, &root, rest)?;

        if item.is_subdir() {
            for child in ls::contents(&store, &item.oid)? {
                if !args.all && child.name.starts_with('.') {
                    continue;
                }
                println!("{}", line(&child, args.long, args.hash));
            }
        } else {
            println!("{}", line(&item, args.long, args.hash));
        }
    }
    Ok(())
}

fn line(item: &ls::Item, long: bool, hash: bool) -> String {
    let mut out = String::new();
    if hash {
        out.push_str(&format!("{} ", item.oid));
    }

    if !long {
        out.push_str(&item.name);
        if item.is_subdir() {
            out.push('/');
        }
        return out;
    }

    let meta = item.meta.as_ref();
    let mode = meta.map(|m| m.mode).unwrap_or(0o040000);
    let size = meta.and_then(|m| m.size).unwrap_or(0);
    out.push_str(&format!(
        "{} {:>5} {:>5} {:>10} {} {}",
        ls::mode_string(mode),
        meta.map(|m| m.uid).unwrap_or(0),
        meta.map(|m| m.gid).unwrap_or(0),
        size,
        mtime_string(meta.map(|m| m.mtime).unwrap_or(0)),
        item.name,
    ));
    if let Some(target) = meta.and_then(|m| m.symlink_target.as_ref()) {
        out.push_str(&format!(" -> {target}"));
    } else if let Some(target) = meta.and_then(|m| m.hardlink_target.as_ref()) {
        out.push_str(&format!(" link to {target}"));
    }
    out
}

fn mtime_string(nanos: i64) -> String {
    match jiff::Timestamp::from_nanosecond(nanos as i128) {
        Ok(ts) => ts.strftime("%Y-%m-%d %H:%M").to_string(),
        Err(_) => "????-??-?? ??:??".to_owned(),
    }
}
