use anyhow::Result;
use camino::Utf8Path;

use crate::store::fs::FsStore;

pub fn run(repo: &Utf8Path) -> Result<()> {
    FsStore::init(repo)
}
