//! An in-memory object store for tests: no disk, and it counts how often
//! each kind of object gets sent to it, which lets tests pin down reuse
//! behavior ("the second save wrote zero blobs").

use anyhow::{Result, anyhow, bail};
use rustc_hash::FxHashMap;

use super::{Kind, ObjectStore, object_id};
use crate::hashing::ObjectId;

#[derive(Default)]
pub struct MemoryStore {
    objects: FxHashMap<ObjectId, (Kind, Vec<u8>)>,
    refs: FxHashMap<String, ObjectId>,
    /// write_object calls per kind, dedup hits included.
    pub blob_writes: usize,
    pub tree_writes: usize,
    pub commit_writes: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn reset_write_counts(&mut self) {
        self.blob_writes = 0;
        self.tree_writes = 0;
        self.commit_writes = 0;
    }
}

impl ObjectStore for MemoryStore {
    fn exists(&self, id: &ObjectId) -> bool {
        self.objects.contains_key(id)
    }

    fn write_object(&mut self, kind: Kind, payload: &[u8]) -> Result<ObjectId> {
        match kind {
            Kind::Blob => self.blob_writes += 1,
            Kind::Tree => self.tree_writes += 1,
            Kind::Commit => self.commit_writes += 1,
        }
        let id = object_id(kind, payload);
        self.objects
            .entry(id)
            .or_insert_with(|| (kind, payload.to_vec()));
        Ok(id)
    }

    fn read_object(&self, id: &ObjectId) -> Result<(Kind, Vec<u8>)> {
        self.objects
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("No object {id}"))
    }

    fn read_ref(&self, name: &str) -> Result<Option<ObjectId>> {
        Ok(self.refs.get(name).copied())
    }

    fn update_ref(
        &mut self,
        name: &str,
        new: &ObjectId,
        expected_old: Option<&ObjectId>,
    ) -> Result<()> {
        if self.refs.get(name) != expected_old {
            bail!("Ref {name} moved underneath us");
        }
        self.refs.insert(name.to_owned(), *new);
        Ok(())
    }
}
