//! Read archived trees back as a directory listing: demangle the stored
//! names and zip the `.bupm` sidecar records onto the entries they describe.

use std::collections::VecDeque;
use std::io::Cursor;

use anyhow::{Result, anyhow, ensure};

use crate::hashing::ObjectId;
use crate::metadata::Metadata;
use crate::split;
use crate::store::{Kind, ObjectStore};
use crate::tree::{self, Demangle, SIDECAR_NAME, is_tree_mode};

/// One directory entry as a reader sees it: real name, real metadata.
#[derive(Debug)]
pub struct Item {
    pub name: String,
    pub gitmode: u32,
    pub oid: ObjectId,
    /// A regular file stored as a split tree.
    pub chunked: bool,
    /// `None` for subdirectories; their metadata lives in their own sidecar.
    pub meta: Option<Metadata>,
}

impl Item {
    pub fn is_subdir(&self) -> bool {
        is_tree_mode(self.gitmode) && !self.chunked
    }
}

/// Follow a commit to its tree; a tree is already itself.
pub fn tree_of(store: &dyn ObjectStore, oid: &ObjectId) -> Result<ObjectId> {
    let (kind, payload) = store.read_object(oid)?;
    match kind {
        Kind::Tree => Ok(*oid),
        Kind::Commit => crate::commit::tree_of(&payload),
        Kind::Blob => Err(anyhow!("{oid} is a blob, not a tree or commit")),
    }
}

fn read_sidecar(store: &dyn ObjectStore, entries: &[tree::Entry]) -> Result<VecDeque<Metadata>> {
    let Some(sidecar) = entries.iter().find(|e| e.name == SIDECAR_NAME) else {
        return Ok(VecDeque::new());
    };
    let stream = split::join(store, sidecar.gitmode, &sidecar.oid)?;
    let mut cursor = Cursor::new(stream);
    let mut records = VecDeque::new();
    while let Some(m) = Metadata::read_from(&mut cursor)? {
        records.push_back(m);
    }
    Ok(records)
}

/// The directory's own metadata: record zero of its sidecar.
pub fn tree_meta(store: &dyn ObjectStore, tree_oid: &ObjectId) -> Result<Metadata> {
    let (kind, bytes) = store.read_object(tree_oid)?;
    ensure!(kind == Kind::Tree, "{tree_oid} is not a tree");
    let entries = tree::decode(&bytes)?;
    read_sidecar(store, &entries)?
        .pop_front()
        .ok_or_else(|| anyhow!("Tree {tree_oid} has no sidecar"))
}

/// List a tree the way it was saved.
///
/// The sidecar records sit in the same collation as the entries (keyed on
/// mangled name and storage mode), so after dropping the directory's own
/// record they pair up with the non-subdirectory entries in stored order.
pub fn contents(store: &dyn ObjectStore, tree_oid: &ObjectId) -> Result<Vec<Item>> {
    let (kind, bytes) = store.read_object(tree_oid)?;
    ensure!(kind == Kind::Tree, "{tree_oid} is not a tree");
    let entries = tree::decode(&bytes)?;

    let mut records = read_sidecar(store, &entries)?;
    records.pop_front(); // the directory itself

    let mut items = Vec::with_capacity(entries.len());
    for entry in entries {
        let (name, demangled) = tree::demangle_name(&entry.name);
        if demangled == Demangle::Sidecar {
            continue;
        }
        let chunked = demangled == Demangle::Chunked;
        let subdir = is_tree_mode(entry.gitmode) && !chunked;
        let meta = if subdir { None } else { records.pop_front() };
        items.push(Item {
            name: name.to_owned(),
            gitmode: entry.gitmode,
            oid: entry.oid,
            chunked,
            meta,
        });
    }
    Ok(items)
}

/// Walk `path` down from the root tree. An empty path is the root itself.
pub fn resolve(store: &dyn ObjectStore, root: &ObjectId, path: &str) -> Result<Item> {
    let mut here = Item {
        name: String::new(),
        gitmode: tree::GIT_MODE_TREE,
        oid: *root,
        chunked: false,
        meta: None,
    };
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        ensure!(here.is_subdir(), "{} is not a directory", here.name);
        here = contents(store, &here.oid)?
            .into_iter()
            .find(|i| i.name == segment)
            .ok_or_else(|| anyhow!("cannot access {segment} in {path}"))?;
    }
    Ok(here)
}

/// An `ls -l`-shaped mode column.
pub fn mode_string(mode: u32) -> String {
    let kind = match mode & crate::metadata::S_IFMT {
        0o040000 => 'd',
        0o120000 => 'l',
        0o010000 => 'p',
        0o140000 => 's',
        0o020000 => 'c',
        0o060000 => 'b',
        _ => '-',
    };
    let mut s = String::with_capacity(10);
    s.push(kind);
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        s.push(if bits & 4 != 0 { 'r' } else { '-' });
        s.push(if bits & 2 != 0 { 'w' } else { '-' });
        s.push(if bits & 1 != 0 { 'x' } else { '-' });
    }
    s
}
