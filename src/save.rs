//! The save driver: walk the index, reuse what's still good, store the
//! rest, and leave behind the root tree of the new archive.
//!
//! The index stream arrives with every directory after its contents, so the
//! driver keeps a [`DirStack`] of open archive directories: entries append
//! to the top frame, directory entries close it. The [`Mapping`] decides
//! what the archive path for each real directory looks like, which is also
//! where stripped or grafted hierarchies can collide - duplicates drop at
//! frame close, and a collided root loses its filesystem metadata.

use anyhow::{Result, anyhow, ensure};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::*;

use crate::counters;
use crate::errors::add_error;
use crate::file_util;
use crate::hashing::ObjectId;
use crate::hlink::HLinkDb;
use crate::index::{Index, MetaStoreReader};
use crate::metadata::{Metadata, S_IFMT};
use crate::paths::{self, Component, Mapping};
use crate::split;
use crate::stack::DirStack;
use crate::store::ObjectStore;
use crate::tree::{GIT_MODE_FILE, GIT_MODE_SYMLINK, GIT_MODE_TREE};

#[derive(Debug, Default)]
pub struct SaveOptions {
    /// Skip files at least this big unless they're already saved. 0 = off.
    pub smaller: u64,
    pub mapping: Mapping,
    pub verbose: u8,
}

/// Save everything the index knows about under `sources`, returning the oid
/// of the archive's root tree.
pub fn save_tree(
    store: &mut dyn ObjectStore,
    index: &mut Index,
    metastore: &MetaStoreReader,
    hlinks: &HLinkDb,
    sources: &[Utf8PathBuf],
    opts: &SaveOptions,
) -> Result<ObjectId> {
    // Directories that are still good get their stored tree reused without
    // even iterating their contents.
    let selected = {
        let store: &dyn ObjectStore = &*store;
        index.select(sources, |e| already_saved(store, e).is_none() || e.sha_missing())
    };
    debug!("Save will visit {} of {} index entries", selected.len(), index.len());

    let mut saver = Saver {
        store,
        metastore,
        hlinks,
        opts,
        stack: DirStack::new(),
        first_root: None,
        root_collision: false,
        lastskip_name: None,
        fcount: 0,
    };

    for pos in selected {
        saver.handle_entry(index, pos)?;
    }

    // Close everything above the archive root, then the root itself. If
    // nothing at all was saved we still owe the caller an (empty) root.
    if saver.stack.depth() == 0 {
        saver.stack.push("", Metadata::default());
    }
    while saver.stack.depth() > 1 {
        saver.stack.pop(saver.store, None, None)?;
    }
    // A root merged from several real directories shouldn't wear any one of
    // their metadata.
    let root_meta = saver.root_collision.then(Metadata::default);
    let root = saver.stack.pop(saver.store, None, root_meta)?;
    debug!("Saved {} entries; root tree is {root}", saver.fcount);
    Ok(root)
}

/// The entry's stored oid, if it's still valid *and* the store has it.
fn already_saved(store: &dyn ObjectStore, e: &crate::index::Entry) -> Option<ObjectId> {
    (e.is_valid() && store.exists(&e.sha)).then_some(e.sha)
}

struct Saver<'a> {
    store: &'a mut dyn ObjectStore,
    metastore: &'a MetaStoreReader,
    hlinks: &'a HLinkDb,
    opts: &'a SaveOptions,
    stack: DirStack,
    first_root: Option<Component>,
    root_collision: bool,
    /// The most recent index path we skipped; ancestors of a skipped entry
    /// must not be validated, or the next save would never look again.
    lastskip_name: Option<String>,
    fcount: u64,
}

impl Saver<'_> {
    fn handle_entry(&mut self, index: &mut Index, pos: usize) -> Result<()> {
        let ent = index.entries[pos].clone();
        let path = ent.path.as_str();
        let (dir, file) = paths::split_dir_file(path);
        let exists = ent.exists();
        let hashvalid = already_saved(self.store, &ent);
        self.fcount += 1;

        if self.opts.verbose > 0 {
            let status = if !exists {
                'D'
            } else if hashvalid.is_none() {
                if ent.sha.is_empty() { 'A' } else { 'M' }
            } else {
                ' '
            };
            if self.opts.verbose >= 2 || file.is_empty() {
                info!("{status} {path}");
            }
        }

        if !exists {
            // A deletion: it simply won't appear in the new tree.
            return Ok(());
        }

        if self.opts.smaller > 0 && ent.size >= self.opts.smaller && hashvalid.is_none() {
            debug!("skipping large file {path}");
            self.lastskip_name = Some(path.to_owned());
            counters::bump(counters::Op::EntriesSkipped);
            return Ok(());
        }

        ensure!(dir.starts_with('/'), "index path {path} isn't absolute");
        let dirp = self.opts.mapping.components(Utf8Path::new(dir));

        // Strip and graft can map several real roots onto one archive root;
        // remember the first and flag any disagreement.
        match &self.first_root {
            None => self.first_root = Some(dirp[0].clone()),
            Some(first) if *first != dirp[0] => self.root_collision = true,
            Some(_) => (),
        }

        // Ascend until the open frames are a prefix of where this entry
        // lives, then descend the rest of the way.
        while !self.stack_is_prefix_of(&dirp) {
            self.stack.pop(self.store, None, None)?;
        }
        for component in &dirp[self.stack.depth()..] {
            // Not indexed, so grab the FS metadata or use empty metadata.
            let meta = match &component.fs_path {
                Some(fs_path) => match Metadata::from_path(fs_path) {
                    Ok(m) => m,
                    Err(e) => {
                        add_error(format!("{e:#}"));
                        self.lastskip_name = Some(component.name.clone());
                        Metadata::default()
                    }
                },
                None => Metadata::default(),
            };
            self.stack.push(component.name.clone(), meta);
        }

        if file.is_empty() {
            return self.close_directory(index, pos, &ent, hashvalid);
        }

        if let Some(oid) = hashvalid {
            let mut meta = self.metastore.metadata_at(ent.meta_ofs)?;
            meta.hardlink_target = self.find_hardlink_target(&ent);
            // Restore the times the metadata store zeroes.
            (meta.atime, meta.mtime, meta.ctime) = (ent.atime, ent.mtime, ent.ctime);
            self.stack
                .append_to_top(file, ent.mode, ent.gitmode, oid, Some(meta));
            counters::bump(counters::Op::EntriesReused);
            return Ok(());
        }

        self.stat_and_store(index, pos, &ent, file)
    }

    /// A directory entry closes the frame it names - except the archive
    /// root, which stays open until the very end of the stream.
    fn close_directory(
        &mut self,
        index: &mut Index,
        pos: usize,
        ent: &crate::index::Entry,
        existing: Option<ObjectId>,
    ) -> Result<()> {
        if self.stack.depth() == 1 {
            return Ok(());
        }
        let newtree = self.stack.pop(self.store, existing, None)?;
        if existing.is_none() {
            let skipped_inside = self
                .lastskip_name
                .as_deref()
                .is_some_and(|skip| skip.starts_with(ent.path.as_str()));
            let e = &mut index.entries[pos];
            if skipped_inside {
                // Something under here was left out; make the next save
                // come back and look.
                e.invalidate();
            } else {
                e.validate(GIT_MODE_TREE, newtree);
            }
            index.repack(pos)?;
        }
        Ok(())
    }

    fn stat_and_store(
        &mut self,
        index: &mut Index,
        pos: usize,
        ent: &crate::index::Entry,
        file: &str,
    ) -> Result<()> {
        let path = ent.path.clone();
        let hlink = self.find_hardlink_target(ent);
        let mut meta = match Metadata::from_path(&path) {
            Ok(m) => m,
            Err(e) => {
                add_error(format!("{e:#}"));
                self.lastskip_name = Some(path.into_string());
                return Ok(());
            }
        };
        meta.hardlink_target = hlink;

        if ent.mode & S_IFMT != meta.type_bits() {
            // Reading it now could misclassify it; recording it as indexed
            // would persist an inconsistency. Out it goes.
            add_error(format!("{path}: mode changed since indexing, skipping."));
            self.lastskip_name = Some(path.into_string());
            return Ok(());
        }

        let stored = if meta.is_regular() {
            self.store_regular(&path, &mut meta)
        } else if meta.is_symlink() {
            self.store_symlink(&meta)
        } else {
            // Devices, fifos, sockets: fully described by their metadata.
            // An empty blob keeps the tree and the sidecar lined up.
            self.store.new_blob(b"").map(|oid| (GIT_MODE_FILE, oid))
        };

        match stored {
            Ok((gitmode, oid)) => {
                let e = &mut index.entries[pos];
                e.validate(gitmode, oid);
                index.repack(pos)?;
                self.stack
                    .append_to_top(file, ent.mode, gitmode, oid, Some(meta));
                counters::bump(counters::Op::EntriesStored);
            }
            Err(e) => {
                add_error(format!("{path}: {e:#}"));
                self.lastskip_name = Some(path.into_string());
            }
        }
        Ok(())
    }

    fn store_regular(&mut self, path: &Utf8Path, meta: &mut Metadata) -> Result<(u32, ObjectId)> {
        let fh = file_util::open_noatime(path)?;
        counters::bump(counters::Op::FilesSplit);

        // If the file changes while we're reading it, the stat() size above
        // may not be what we actually stored. Record what we read.
        let mut sink = CountingSink {
            store: &mut *self.store,
            bytes: 0,
        };
        let (gitmode, oid) = split::split_to_blob_or_tree(&mut sink, fh)?;
        meta.size = Some(sink.bytes);
        Ok((gitmode, oid))
    }

    fn store_symlink(&mut self, meta: &Metadata) -> Result<(u32, ObjectId)> {
        let target = meta
            .symlink_target
            .as_ref()
            .ok_or_else(|| anyhow!("symlink with no target"))?;
        let oid = self.store.new_blob(target.as_str().as_bytes())?;
        Ok((GIT_MODE_SYMLINK, oid))
    }

    fn find_hardlink_target(&self, ent: &crate::index::Entry) -> Option<Utf8PathBuf> {
        if ent.is_dir() || ent.nlink <= 1 {
            return None;
        }
        let first = self.hlinks.node_paths(ent.dev, ent.ino).first()?;
        // The canonical (first-seen) path doesn't point at itself.
        (*first != ent.path).then(|| first.clone())
    }

    fn stack_is_prefix_of(&self, dirp: &[Component]) -> bool {
        let names: Vec<&str> = self.stack.names().collect();
        names.len() <= dirp.len()
            && names
                .iter()
                .zip(dirp)
                .all(|(open, target)| *open == target.name)
    }
}

/// Wraps the store's blob writer to count the bytes that actually went in.
struct CountingSink<'a> {
    store: &'a mut dyn ObjectStore,
    bytes: u64,
}

impl split::Sink for CountingSink<'_> {
    fn make_blob(&mut self, bytes: &[u8]) -> Result<ObjectId> {
        self.bytes += bytes.len() as u64;
        self.store.new_blob(bytes)
    }

    fn make_tree(&mut self, entries: Vec<crate::tree::Entry>) -> Result<ObjectId> {
        self.store.new_tree(entries)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::fs;

    use crate::errors;
    use crate::ls;
    use crate::store::memory::MemoryStore;
    use crate::tree;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: Utf8PathBuf,
        indexfile: Utf8PathBuf,
    }

    impl Fixture {
        fn new() -> Result<Self> {
            let dir = tempfile::tempdir()?;
            let root = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
            let indexfile = root.join("bupindex");
            Ok(Self {
                _dir: dir,
                root,
                indexfile,
            })
        }

        fn reindex(&self, sources: &[Utf8PathBuf]) -> Result<()> {
            crate::index::update(&self.indexfile, sources)?;
            Ok(())
        }

        fn save(
            &self,
            store: &mut MemoryStore,
            sources: &[Utf8PathBuf],
            opts: &SaveOptions,
        ) -> Result<ObjectId> {
            let mut index = Index::open(&self.indexfile)?;
            let metastore =
                MetaStoreReader::open(Utf8Path::new(&format!("{}.meta", self.indexfile)))?;
            let hlinks = HLinkDb::open(Utf8Path::new(&format!("{}.hlink", self.indexfile)))?;
            save_tree(store, &mut index, &metastore, &hlinks, sources, opts)
        }
    }

    fn entry_names(store: &MemoryStore, tree_oid: &ObjectId) -> Result<Vec<String>> {
        let (_, bytes) = store.read_object(tree_oid)?;
        Ok(tree::decode(&bytes)?
            .into_iter()
            .map(|e| e.name)
            .collect())
    }

    fn child(store: &MemoryStore, tree_oid: &ObjectId, name: &str) -> Result<tree::Entry> {
        let (_, bytes) = store.read_object(tree_oid)?;
        tree::decode(&bytes)?
            .into_iter()
            .find(|e| e.name == name)
            .ok_or_else(|| anyhow!("no entry {name}"))
    }

    fn strip_to(src: &Utf8PathBuf) -> SaveOptions {
        SaveOptions {
            mapping: Mapping::Strip(vec![src.clone()]),
            ..SaveOptions::default()
        }
    }

    #[test]
    fn second_save_reuses_everything() -> Result<()> {
        let fx = Fixture::new()?;
        let src = fx.root.join("data");
        fs::create_dir(&src)?;
        fs::write(src.join("f"), b"hello")?;
        fx.reindex(&[src.clone()])?;

        let mut store = MemoryStore::new();
        let opts = strip_to(&src);
        let first = fx.save(&mut store, &[src.clone()], &opts)?;
        let objects_after_first = store.len();
        assert!(store.blob_writes > 0);

        store.reset_write_counts();
        let second = fx.save(&mut store, &[src.clone()], &opts)?;

        // Same root, nothing new in the store, and no file content was
        // re-split: the only writes are the root frame's sidecar and tree,
        // both of which dedup to their existing objects.
        assert_eq!(first, second);
        assert_eq!(store.len(), objects_after_first);
        assert!(store.blob_writes <= 1);
        assert!(store.tree_writes <= 1);
        Ok(())
    }

    #[test]
    fn symlink_saves_its_target() -> Result<()> {
        let fx = Fixture::new()?;
        let src = fx.root.join("data");
        fs::create_dir(&src)?;
        std::os::unix::fs::symlink("target", src.join("ln"))?;
        fx.reindex(&[src.clone()])?;

        let mut store = MemoryStore::new();
        let root = fx.save(&mut store, &[src.clone()], &strip_to(&src))?;

        let ln = child(&store, &root, "ln")?;
        assert_eq!(ln.gitmode, GIT_MODE_SYMLINK);
        let (_, payload) = store.read_object(&ln.oid)?;
        assert_eq!(payload, b"target");

        // And the listing shows it with its target.
        let items = ls::contents(&store, &root)?;
        let item = items.iter().find(|i| i.name == "ln").unwrap();
        assert_eq!(
            item.meta.as_ref().unwrap().symlink_target.as_deref(),
            Some(Utf8Path::new("target"))
        );
        Ok(())
    }

    #[test]
    fn mode_drift_skips_and_invalidates_the_parent() -> Result<()> {
        let fx = Fixture::new()?;
        let src = fx.root.join("data");
        fs::create_dir_all(src.join("shifty"))?;
        fs::create_dir_all(src.join("steady"))?;
        fs::write(src.join("shifty/f"), b"soon a directory")?;
        fs::write(src.join("steady/g"), b"unchanged")?;
        fx.reindex(&[src.clone()])?;

        // Between index and save, f changes type.
        fs::remove_file(src.join("shifty/f"))?;
        fs::create_dir(src.join("shifty/f"))?;

        let mut store = MemoryStore::new();
        let errors_before = errors::count();
        let root = fx.save(&mut store, &[src.clone()], &strip_to(&src))?;
        assert!(errors::count() > errors_before);

        // No blob was recorded for f.
        let shifty = child(&store, &root, "shifty")?;
        assert_eq!(entry_names(&store, &shifty.oid)?, [tree::SIDECAR_NAME]);

        // The directory something was skipped under must get re-examined
        // next time; its untouched sibling is validated as usual.
        let index = Index::open(&fx.indexfile)?;
        let by_path = |suffix: &str| {
            index
                .entries
                .iter()
                .find(|e| e.path.as_str().ends_with(suffix))
                .unwrap()
        };
        assert!(!by_path("shifty/").is_valid());
        assert!(by_path("steady/").is_valid());
        Ok(())
    }

    #[test]
    fn smaller_skips_only_unsaved_files() -> Result<()> {
        let fx = Fixture::new()?;
        let src = fx.root.join("data");
        fs::create_dir(&src)?;
        fs::write(src.join("big"), vec![7u8; 2048])?;
        fx.reindex(&[src.clone()])?;

        let mut store = MemoryStore::new();
        let limited = SaveOptions {
            smaller: 1024,
            ..strip_to(&src)
        };

        // Not yet saved: the big file is left out.
        let root = fx.save(&mut store, &[src.clone()], &limited)?;
        assert_eq!(entry_names(&store, &root)?, [tree::SIDECAR_NAME]);

        // Save it for real, then run the limited save again: hashvalid now,
        // so it's re-emitted despite its size.
        fx.save(&mut store, &[src.clone()], &strip_to(&src))?;
        let root = fx.save(&mut store, &[src.clone()], &limited)?;
        assert!(entry_names(&store, &root)?.contains(&"big".to_owned()));
        Ok(())
    }

    #[test]
    fn hardlinks_point_at_the_first_seen_path() -> Result<()> {
        let fx = Fixture::new()?;
        let src = fx.root.join("data");
        fs::create_dir(&src)?;
        fs::write(src.join("first"), b"shared")?;
        fs::hard_link(src.join("first"), src.join("second"))?;
        fx.reindex(&[src.clone()])?;

        let mut store = MemoryStore::new();
        let root = fx.save(&mut store, &[src.clone()], &strip_to(&src))?;

        let items = ls::contents(&store, &root)?;
        let first = items.iter().find(|i| i.name == "first").unwrap();
        let second = items.iter().find(|i| i.name == "second").unwrap();
        assert_eq!(first.meta.as_ref().unwrap().hardlink_target, None);
        assert_eq!(
            second.meta.as_ref().unwrap().hardlink_target,
            Some(src.join("first"))
        );
        Ok(())
    }

    #[test]
    fn strip_collision_drops_duplicates_and_blanks_the_root() -> Result<()> {
        let fx = Fixture::new()?;
        let foo = fx.root.join("foo");
        let bar = fx.root.join("bar");
        fs::create_dir(&foo)?;
        fs::create_dir(&bar)?;
        fs::write(foo.join("same"), b"from foo")?;
        fs::write(bar.join("same"), b"from bar")?;
        let sources = vec![bar.clone(), foo.clone()];
        fx.reindex(&sources)?;

        let mut store = MemoryStore::new();
        let opts = SaveOptions {
            mapping: Mapping::Strip(sources.clone()),
            ..SaveOptions::default()
        };
        let errors_before = errors::count();
        let root = fx.save(&mut store, &sources, &opts)?;
        assert!(errors::count() > errors_before, "duplicate should be logged");

        // One "same" won; first in index order came from bar/.
        let names = entry_names(&store, &root)?;
        assert_eq!(names.iter().filter(|n| *n == "same").count(), 1);
        let winner = child(&store, &root, "same")?;
        let (_, payload) = store.read_object(&winner.oid)?;
        assert_eq!(payload, b"from bar");

        // Collided root: empty metadata.
        let dir_meta = ls::tree_meta(&store, &root)?;
        assert_eq!(dir_meta, Metadata::default());
        Ok(())
    }

    #[test]
    fn race_tolerant_size_comes_from_the_read() -> Result<()> {
        // The index recorded one size; by save time the file has grown. The
        // recorded metadata size must be what we actually read.
        let fx = Fixture::new()?;
        let src = fx.root.join("data");
        fs::create_dir(&src)?;
        fs::write(src.join("f"), b"short")?;
        fx.reindex(&[src.clone()])?;

        fs::write(src.join("f"), b"substantially longer contents")?;

        let mut store = MemoryStore::new();
        let root = fx.save(&mut store, &[src.clone()], &strip_to(&src))?;
        let items = ls::contents(&store, &root)?;
        let f = items.iter().find(|i| i.name == "f").unwrap();
        assert_eq!(
            f.meta.as_ref().unwrap().size,
            Some(b"substantially longer contents".len() as u64)
        );
        Ok(())
    }
}
