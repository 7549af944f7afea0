//! The content-addressed object store: blobs, trees, and commits keyed by
//! the hash of their header + payload.

use anyhow::{Result, bail};

use crate::counters;
use crate::hashing::ObjectId;
use crate::tree;

pub mod fs;
pub mod memory;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Kind {
    Blob,
    Tree,
    Commit,
}

impl Kind {
    pub fn tag(&self) -> &'static str {
        match self {
            Kind::Blob => "blob",
            Kind::Tree => "tree",
            Kind::Commit => "commit",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self> {
        Ok(match tag {
            "blob" => Kind::Blob,
            "tree" => Kind::Tree,
            "commit" => Kind::Commit,
            other => bail!("Unknown object kind {other}"),
        })
    }
}

/// An object's ID: the hash of `<kind> <len>\0` followed by the payload,
/// so equal payloads of different kinds can't collide.
pub fn object_id(kind: Kind, payload: &[u8]) -> ObjectId {
    let header = format!("{} {}\0", kind.tag(), payload.len());
    ObjectId::hash_parts(&[header.as_bytes(), payload])
}

/// Where save sends everything it builds.
///
/// `write_object` must be idempotent: writing a payload that's already
/// stored is a no-op that returns the same ID. `exists` must see objects
/// written earlier in the same session - reuse decisions depend on it.
pub trait ObjectStore {
    fn exists(&self, id: &ObjectId) -> bool;
    fn write_object(&mut self, kind: Kind, payload: &[u8]) -> Result<ObjectId>;
    fn read_object(&self, id: &ObjectId) -> Result<(Kind, Vec<u8>)>;

    fn read_ref(&self, name: &str) -> Result<Option<ObjectId>>;

    /// Advance a ref, compare-and-swap style: fails if the ref no longer
    /// points at `expected_old`.
    fn update_ref(
        &mut self,
        name: &str,
        new: &ObjectId,
        expected_old: Option<&ObjectId>,
    ) -> Result<()>;

    fn new_blob(&mut self, bytes: &[u8]) -> Result<ObjectId> {
        counters::bump(counters::Op::BlobsWritten);
        self.write_object(Kind::Blob, bytes)
    }

    fn new_tree(&mut self, entries: Vec<tree::Entry>) -> Result<ObjectId> {
        counters::bump(counters::Op::TreesWritten);
        let encoded = tree::encode(entries);
        self.write_object(Kind::Tree, &encoded)
    }
}

/// Enforce a superset of git-check-ref-format(1) on branch names.
pub fn valid_ref_name(name: &str) -> bool {
    if name.is_empty()
        || name == "@"
        || name.starts_with('/')
        || name.ends_with('/')
        || name.ends_with(".lock")
        || name.starts_with('.')
        || name.contains("..")
        || name.contains("//")
    {
        return false;
    }
    name.chars().all(|c| {
        !c.is_ascii_control() && !matches!(c, ' ' | '~' | '^' | ':' | '?' | '*' | '[' | '\\')
    })
}
