//! Tree objects: entry modes, the collation they're stored in, and the
//! name mangling that keeps storage types recoverable.
//!
//! A tree is a sorted list of `(mode, name, oid)`. The mode here is the
//! *storage* mode: regular blob, symlink blob, or subtree. A large file that
//! was hashsplit into a subtree keeps its real type recoverable through its
//! mangled name.

use std::cmp::Ordering;

use anyhow::{Result, bail, ensure};

use crate::hashing::{ID_LEN, ObjectId};

pub const GIT_MODE_TREE: u32 = 0o40000;
pub const GIT_MODE_FILE: u32 = 0o100644;
pub const GIT_MODE_EXEC: u32 = 0o100755;
pub const GIT_MODE_SYMLINK: u32 = 0o120000;

/// Name of the per-directory metadata sidecar entry.
pub const SIDECAR_NAME: &str = ".bupm";

const S_IFMT: u32 = 0o170000;
const S_IFREG: u32 = 0o100000;

#[inline]
pub fn is_tree_mode(gitmode: u32) -> bool {
    gitmode & S_IFMT == GIT_MODE_TREE
}

/// The storage mode an index entry starts out with, from its stat mode.
pub fn gitmode_for(mode: u32) -> u32 {
    match mode & S_IFMT {
        0o040000 => GIT_MODE_TREE,
        0o120000 => GIT_MODE_SYMLINK,
        S_IFREG if mode & 0o111 != 0 => GIT_MODE_EXEC,
        _ => GIT_MODE_FILE,
    }
}

/// One child of a tree object.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Entry {
    pub gitmode: u32,
    pub name: String,
    pub oid: ObjectId,
}

impl Entry {
    pub fn new(gitmode: u32, name: impl Into<String>, oid: ObjectId) -> Self {
        Self {
            gitmode,
            name: name.into(),
            oid,
        }
    }
}

/// The collation key for tree children: directories compare as if their name
/// had a trailing slash.
///
/// The same key orders the records in the metadata sidecar, so readers can
/// zip the two back together. Always feed it the *stored* (mangled) name.
pub fn sort_key(gitmode: u32, name: &str) -> String {
    if is_tree_mode(gitmode) {
        let mut k = String::with_capacity(name.len() + 1);
        k.push_str(name);
        k.push('/');
        k
    } else {
        name.to_owned()
    }
}

pub fn compare_entries(a: &Entry, b: &Entry) -> Ordering {
    sort_key(a.gitmode, &a.name).cmp(&sort_key(b.gitmode, &b.name))
}

/// What a stored name tells us about the entry it names.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Demangle {
    /// Stored as-is; the storage mode is the real story.
    Normal,
    /// A regular file hashsplit into a subtree of blobs.
    Chunked,
    /// The directory's metadata sidecar.
    Sidecar,
}

/// Transform a file name for storage so the entry's real type survives.
///
/// A regular file that was hashsplit gets `.bup` appended; anything whose
/// name could be mistaken for a mangled one gets `.bupl` so the inverse
/// transform stays unambiguous. The suffixes are a wire-format constant.
pub fn mangle_name(name: &str, mode: u32, gitmode: u32) -> String {
    if mode & S_IFMT == S_IFREG && is_tree_mode(gitmode) {
        format!("{name}.bup")
    } else if name.ends_with(".bup") || looks_mangled(name) {
        format!("{name}.bupl")
    } else {
        name.to_owned()
    }
}

// ".bupl", ".bupm", or any other one-byte extension of ".bup".
fn looks_mangled(name: &str) -> bool {
    let b = name.as_bytes();
    b.len() >= 5 && b[..b.len() - 1].ends_with(b".bup")
}

/// Undo [`mangle_name`], classifying the entry on the way.
pub fn demangle_name(name: &str) -> (&str, Demangle) {
    if name == SIDECAR_NAME {
        (name, Demangle::Sidecar)
    } else if let Some(stripped) = name.strip_suffix(".bupl") {
        (stripped, Demangle::Normal)
    } else if let Some(stripped) = name.strip_suffix(".bup") {
        (stripped, Demangle::Chunked)
    } else {
        (name, Demangle::Normal)
    }
}

/// Serialize a tree: entries sorted by [`sort_key`], each encoded as
/// `<octal mode> <name>\0<20-byte oid>`.
pub fn encode(mut entries: Vec<Entry>) -> Vec<u8> {
    entries.sort_by(compare_entries);

    let mut out = Vec::new();
    for e in &entries {
        out.extend_from_slice(format!("{:o} {}", e.gitmode, e.name).as_bytes());
        out.push(0);
        out.extend_from_slice(e.oid.as_bytes());
    }
    out
}

/// Parse a serialized tree, preserving stored order.
pub fn decode(mut bytes: &[u8]) -> Result<Vec<Entry>> {
    let mut entries = Vec::new();
    while !bytes.is_empty() {
        let Some(space) = bytes.iter().position(|b| *b == b' ') else {
            bail!("Tree entry missing mode terminator");
        };
        let mode = parse_octal(&bytes[..space])?;
        bytes = &bytes[space + 1..];

        let Some(nul) = bytes.iter().position(|b| *b == 0) else {
            bail!("Tree entry missing name terminator");
        };
        let name = std::str::from_utf8(&bytes[..nul])?.to_owned();
        bytes = &bytes[nul + 1..];

        ensure!(bytes.len() >= ID_LEN, "Tree entry truncated before its oid");
        let oid = ObjectId::from_bytes(&bytes[..ID_LEN])?;
        bytes = &bytes[ID_LEN..];

        entries.push(Entry { gitmode: mode, name, oid });
    }
    Ok(entries)
}

fn parse_octal(s: &[u8]) -> Result<u32> {
    ensure!(!s.is_empty(), "Empty mode in tree entry");
    let mut val: u32 = 0;
    for b in s {
        ensure!((b'0'..=b'7').contains(b), "Bad octal digit in tree mode");
        val = val * 8 + u32::from(b - b'0');
    }
    Ok(val)
}
