//! The stack of open archive directories a save builds as it walks.
//!
//! A frame opens when the walk descends into an archive directory and closes
//! when it ascends: closing emits the directory's tree object (children in
//! storage collation, names mangled, metadata gathered into the `.bupm`
//! sidecar) and hands the result up to the parent frame.

use anyhow::Result;
use rustc_hash::FxHashSet;

use crate::counters;
use crate::errors::add_error;
use crate::hashing::ObjectId;
use crate::metadata::Metadata;
use crate::split;
use crate::store::ObjectStore;
use crate::tree::{self, GIT_MODE_TREE, SIDECAR_NAME};

/// One child recorded in an open frame.
#[derive(Debug, Clone)]
pub struct Item {
    pub name: String,
    /// Filesystem-level mode bits (for subtrees added by a close, this is
    /// just the tree mode).
    pub mode: u32,
    /// Storage-level mode: tree, regular blob, or symlink blob.
    pub gitmode: u32,
    pub oid: ObjectId,
    /// `None` for subtrees - their metadata travels in their own sidecar.
    pub meta: Option<Metadata>,
}

#[derive(Debug)]
struct Frame {
    name: String,
    meta: Metadata,
    items: Vec<Item>,
}

/// Invariant: the frame names, concatenated, spell the archive directory
/// currently open. Frame 0 is the archive root and is named `""`.
#[derive(Debug, Default)]
pub struct DirStack {
    frames: Vec<Frame>,
}

impl DirStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// The archive names of the open frames, outermost first.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.frames.iter().map(|f| f.name.as_str())
    }

    fn path(&self) -> String {
        let mut p = String::new();
        for f in &self.frames {
            p.push_str(&f.name);
            p.push('/');
        }
        p
    }

    /// Enter a new archive directory, making it current.
    pub fn push(&mut self, name: impl Into<String>, meta: Metadata) {
        self.frames.push(Frame {
            name: name.into(),
            meta,
            items: Vec::new(),
        });
    }

    /// Record a child in the current directory. Duplicate names are dealt
    /// with at close time, not here.
    pub fn append_to_top(
        &mut self,
        name: impl Into<String>,
        mode: u32,
        gitmode: u32,
        oid: ObjectId,
        meta: Option<Metadata>,
    ) {
        let top = self.frames.last_mut().expect("append with no open frame");
        top.items.push(Item {
            name: name.into(),
            mode,
            gitmode,
            oid,
            meta,
        });
    }

    /// Close the current directory and add its tree to the parent frame.
    ///
    /// `force_tree` short-circuits the build for directories whose stored
    /// tree is known to still be good. `dir_meta_override` replaces the
    /// metadata pushed for this frame (used to blank out a collided root).
    pub fn pop(
        &mut self,
        store: &mut dyn ObjectStore,
        force_tree: Option<ObjectId>,
        dir_meta_override: Option<Metadata>,
    ) -> Result<ObjectId> {
        let parent_path = self.path();
        let frame = self.frames.pop().expect("pop on empty stack");

        let tree_oid = match force_tree {
            Some(t) => t,
            None => {
                // First occurrence of a name wins; later ones (from strip or
                // graft collisions) are dropped with a logged error.
                let mut names_seen = FxHashSet::default();
                let mut clean_list = Vec::with_capacity(frame.items.len());
                for item in frame.items {
                    if names_seen.insert(item.name.clone()) {
                        clean_list.push(item);
                    } else {
                        add_error(format!(
                            "error: ignoring duplicate path {} in {parent_path}",
                            item.name
                        ));
                    }
                }

                Self::emit_tree(store, &frame.name, frame.meta, dir_meta_override, clean_list)?
            }
        };

        if let Some(parent) = self.frames.last_mut() {
            parent.items.push(Item {
                name: frame.name,
                mode: GIT_MODE_TREE,
                gitmode: GIT_MODE_TREE,
                oid: tree_oid,
                meta: None,
            });
        }
        Ok(tree_oid)
    }

    fn emit_tree(
        store: &mut dyn ObjectStore,
        name: &str,
        frame_meta: Metadata,
        dir_meta_override: Option<Metadata>,
        clean_list: Vec<Item>,
    ) -> Result<ObjectId> {
        // The sidecar: the directory's own record first, then one record per
        // non-directory child, in the same collation the tree entries use
        // (computed over the mangled name and storage mode, so readers can
        // zip the records back to the entries).
        let dir_meta = dir_meta_override.unwrap_or(frame_meta);
        let mut metalist: Vec<(String, &Metadata)> = vec![(String::new(), &dir_meta)];
        for item in &clean_list {
            let Some(meta) = &item.meta else {
                continue;
            };
            let stored = tree::mangle_name(&item.name, item.mode, item.gitmode);
            metalist.push((tree::sort_key(item.gitmode, &stored), meta));
        }
        metalist.sort_by(|a, b| a.0.cmp(&b.0));

        let mut sidecar = Vec::new();
        for (_key, meta) in &metalist {
            meta.encode_into(&mut sidecar)?;
        }
        let (sidecar_mode, sidecar_oid) = split::split_to_blob_or_tree(store, &sidecar[..])?;
        counters::bump(counters::Op::SidecarsWritten);

        let mut entries = vec![tree::Entry::new(sidecar_mode, SIDECAR_NAME, sidecar_oid)];
        for item in &clean_list {
            entries.push(tree::Entry::new(
                item.gitmode,
                tree::mangle_name(&item.name, item.mode, item.gitmode),
                item.oid,
            ));
        }

        let oid = store.new_tree(entries)?;
        tracing::trace!("closed {name:?} as {oid}");
        Ok(oid)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::errors;
    use crate::store::memory::MemoryStore;
    use crate::tree::{Demangle, GIT_MODE_FILE, GIT_MODE_SYMLINK};

    fn meta(mode: u32) -> Metadata {
        Metadata {
            mode,
            uid: 1,
            gid: 1,
            mtime: 7,
            ..Metadata::default()
        }
    }

    fn sidecar_records(store: &MemoryStore, root: &ObjectId) -> Result<Vec<Metadata>> {
        let (_, bytes) = store.read_object(root)?;
        let entries = tree::decode(&bytes)?;
        let bupm = entries.iter().find(|e| e.name == SIDECAR_NAME).expect("no sidecar");
        let stream = split::join(store, bupm.gitmode, &bupm.oid)?;
        let mut cursor = std::io::Cursor::new(stream);
        let mut records = Vec::new();
        while let Some(m) = Metadata::read_from(&mut cursor)? {
            records.push(m);
        }
        Ok(records)
    }

    #[test]
    fn close_emits_sidecar_and_sorted_children() -> Result<()> {
        let mut store = MemoryStore::new();
        let mut stack = DirStack::new();
        stack.push("", meta(0o040755));

        stack.append_to_top("zeta", 0o100644, GIT_MODE_FILE, ObjectId::hash(b"z"), Some(meta(0o100644)));
        stack.append_to_top("alpha", 0o120777, GIT_MODE_SYMLINK, ObjectId::hash(b"a"), Some(meta(0o120777)));
        let root = stack.pop(&mut store, None, None)?;

        let (_, bytes) = store.read_object(&root)?;
        let entries = tree::decode(&bytes)?;
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, [SIDECAR_NAME, "alpha", "zeta"]);

        // Record 0 is the directory itself, then children in entry order.
        let records = sidecar_records(&store, &root)?;
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].mode, 0o040755);
        assert_eq!(records[1].mode, 0o120777);
        assert_eq!(records[2].mode, 0o100644);
        Ok(())
    }

    #[test]
    fn duplicate_names_drop_with_first_winning() -> Result<()> {
        let mut store = MemoryStore::new();
        let mut stack = DirStack::new();
        stack.push("", meta(0o040755));

        let first = ObjectId::hash(b"first");
        stack.append_to_top("f", 0o100644, GIT_MODE_FILE, first, Some(meta(0o100644)));
        let errors_before = errors::count();
        stack.append_to_top("f", 0o100644, GIT_MODE_FILE, ObjectId::hash(b"second"), Some(meta(0o100600)));
        let root = stack.pop(&mut store, None, None)?;
        assert!(errors::count() > errors_before);

        let (_, bytes) = store.read_object(&root)?;
        let entries = tree::decode(&bytes)?;
        assert_eq!(entries.len(), 2); // .bupm + one "f"
        assert_eq!(entries[1].oid, first);
        Ok(())
    }

    #[test]
    fn closing_a_subdir_feeds_the_parent() -> Result<()> {
        let mut store = MemoryStore::new();
        let mut stack = DirStack::new();
        stack.push("", meta(0o040755));
        stack.push("sub", meta(0o040700));
        stack.append_to_top("f", 0o100644, GIT_MODE_FILE, ObjectId::hash(b"f"), Some(meta(0o100644)));

        let sub = stack.pop(&mut store, None, None)?;
        assert_eq!(stack.depth(), 1);
        let root = stack.pop(&mut store, None, None)?;

        let (_, bytes) = store.read_object(&root)?;
        let entries = tree::decode(&bytes)?;
        let sub_entry = entries.iter().find(|e| e.name == "sub").expect("sub missing");
        assert_eq!(sub_entry.gitmode, GIT_MODE_TREE);
        assert_eq!(sub_entry.oid, sub);
        assert_eq!(tree::demangle_name("sub"), ("sub", Demangle::Normal));
        Ok(())
    }

    #[test]
    fn force_tree_skips_the_build() -> Result<()> {
        let mut store = MemoryStore::new();
        let mut stack = DirStack::new();
        stack.push("", meta(0o040755));
        stack.push("kept", meta(0o040755));

        let stored = ObjectId::hash(b"previously saved tree");
        let popped = stack.pop(&mut store, Some(stored), None)?;
        assert_eq!(popped, stored);
        assert_eq!(store.tree_writes, 0);
        assert_eq!(store.blob_writes, 0);
        Ok(())
    }

    #[test]
    fn metadata_override_replaces_the_dir_record() -> Result<()> {
        let mut store = MemoryStore::new();
        let mut stack = DirStack::new();
        stack.push("", meta(0o040755));
        let root = stack.pop(&mut store, None, Some(Metadata::default()))?;

        let records = sidecar_records(&store, &root)?;
        assert_eq!(records[0], Metadata::default());
        Ok(())
    }
}
