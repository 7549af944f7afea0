//! The hardlink database: which paths share a `(device, inode)` pair.
//!
//! Built during indexing, read-only during save. The first path recorded
//! for a node is the canonical one; every other path saved for that node
//! gets it as a `hardlink_target` in its metadata.

use std::fs::{self, File};
use std::io;
use std::io::prelude::*;

use anyhow::{Context, Result, ensure};
use camino::{Utf8Path, Utf8PathBuf};
use rustc_hash::FxHashMap;
use serde_derive::{Deserialize, Serialize};

const HLINK_MAGIC: &[u8; 8] = b"DUFHLNK1";

#[derive(Debug, Serialize, Deserialize)]
struct Node {
    dev: u64,
    ino: u64,
    paths: Vec<Utf8PathBuf>,
}

#[derive(Debug, Default)]
pub struct HLinkDb {
    nodes: FxHashMap<(u64, u64), Vec<Utf8PathBuf>>,
}

impl HLinkDb {
    /// Open a hardlink DB; a missing file just means no hardlinks.
    pub fn open(path: &Utf8Path) -> Result<Self> {
        let mut fh = match File::open(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            other => other.with_context(|| format!("Couldn't open {path}"))?,
        };
        let mut magic = [0u8; 8];
        fh.read_exact(&mut magic)?;
        ensure!(&magic == HLINK_MAGIC, "{path} is not a hardlink DB");

        let nodes: Vec<Node> = ciborium::de::from_reader(&mut fh)
            .with_context(|| format!("Couldn't decode {path}"))?;
        Ok(Self {
            nodes: nodes
                .into_iter()
                .map(|n| ((n.dev, n.ino), n.paths))
                .collect(),
        })
    }

    /// Every path recorded for this node, first-seen first.
    pub fn node_paths(&self, dev: u64, ino: u64) -> &[Utf8PathBuf] {
        self.nodes
            .get(&(dev, ino))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[derive(Debug, Default)]
pub struct HLinkWriter {
    nodes: Vec<Node>,
    by_id: FxHashMap<(u64, u64), usize>,
}

impl HLinkWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, dev: u64, ino: u64, path: &Utf8Path) {
        let at = *self.by_id.entry((dev, ino)).or_insert_with(|| {
            self.nodes.push(Node {
                dev,
                ino,
                paths: Vec::new(),
            });
            self.nodes.len() - 1
        });
        self.nodes[at].paths.push(path.to_owned());
    }

    pub fn write_to(self, path: &Utf8Path) -> Result<()> {
        let mut out = Vec::new();
        out.extend_from_slice(HLINK_MAGIC);
        ciborium::ser::into_writer(&self.nodes, &mut out)?;
        fs::write(path, out).with_context(|| format!("Couldn't write {path}"))?;
        Ok(())
    }
}
