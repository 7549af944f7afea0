#![allow(dead_code)]

use std::path::{Path, PathBuf};

use anyhow::*;
use assert_cmd::Command;
use walkdir::WalkDir;

pub fn cli_run(repo: &Path) -> Result<Command> {
    let bin_name = env!("CARGO_PKG_NAME");
    let mut cmd = Command::cargo_bin(bin_name)?;
    cmd.arg("--repo").arg(repo);
    cmd.arg("-vv");
    Ok(cmd)
}

/// How many loose objects the repository holds.
pub fn count_objects(repo: &Path) -> usize {
    WalkDir::new(repo.join("objects"))
        .into_iter()
        .map(|e| e.expect("couldn't walk objects/"))
        .filter(|e| e.file_type().is_file())
        .count()
}

pub fn files_in(p: &Path) -> impl Iterator<Item = PathBuf> {
    WalkDir::new(p)
        .into_iter()
        .map(|e| e.expect("couldn't walk dir"))
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
}
