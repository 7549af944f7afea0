//! The file index that drives a save, plus the metadata store next to it.
//!
//! The index (`bupindex`) records one entry per filesystem node, ordered so
//! that every directory appears *after* its contents: plain byte-wise
//! comparison, except that a path sorts after anything it prefixes. Each
//! entry is a length-prefixed path followed by a fixed-size stat block that
//! [`Index::repack`] can rewrite in place when save revalidates or
//! invalidates an entry.
//!
//! The metadata store (`bupindex.meta`) holds one CBOR metadata record per
//! distinct encoding, addressed by byte offset; entry stat blocks point into
//! it. Times are zeroed there - the index keeps them, and save restores
//! them when it reuses an entry.

use std::cmp::Ordering;
use std::fs::{self, File, OpenOptions};
use std::io::prelude::*;
use std::io::BufWriter;
use std::os::unix::fs::FileExt;

use anyhow::{Context, Result, ensure};
use camino::{Utf8Path, Utf8PathBuf};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::*;

use crate::errors::add_error;
use crate::hashing::{EMPTY_ID, ID_LEN, ObjectId};
use crate::hlink;
use crate::metadata::Metadata;
use crate::tree;

const INDEX_MAGIC: &[u8; 8] = b"DUFIDX01";
const META_MAGIC: &[u8; 8] = b"DUFMETA1";

pub const IX_EXISTS: u32 = 0x8000;
pub const IX_HASHVALID: u32 = 0x4000;
pub const IX_SHAMISSING: u32 = 0x0800;

// flags, mode, gitmode + size, dev, ino, nlink + atime, mtime, ctime
// + sha + meta_ofs
const STAT_BLOCK_LEN: usize = 4 * 3 + 8 * 4 + 8 * 3 + ID_LEN + 8;

/// One indexed filesystem node. Directory paths end in `/`.
#[derive(Debug, Clone)]
pub struct Entry {
    pub path: Utf8PathBuf,
    pub flags: u32,
    /// stat() mode bits at index time.
    pub mode: u32,
    /// Storage mode; starts as a guess from `mode` and is overwritten by
    /// `validate` with what was actually stored.
    pub gitmode: u32,
    pub size: u64,
    pub dev: u64,
    pub ino: u64,
    pub nlink: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub sha: ObjectId,
    pub meta_ofs: u64,
    /// Where this entry's stat block lives in the index file.
    stat_ofs: u64,
}

impl Entry {
    pub fn exists(&self) -> bool {
        self.flags & IX_EXISTS != 0
    }

    /// The recorded oid still matches the last-seen file state.
    pub fn is_valid(&self) -> bool {
        self.flags & IX_HASHVALID != 0
    }

    pub fn sha_missing(&self) -> bool {
        self.flags & IX_SHAMISSING != 0 || !self.is_valid()
    }

    pub fn set_sha_missing(&mut self, missing: bool) {
        if missing {
            self.flags |= IX_SHAMISSING;
        } else {
            self.flags &= !IX_SHAMISSING;
        }
    }

    /// Record what was just stored for this entry.
    pub fn validate(&mut self, gitmode: u32, oid: ObjectId) {
        self.gitmode = gitmode;
        self.sha = oid;
        self.flags |= IX_HASHVALID | IX_EXISTS;
        self.set_sha_missing(false);
    }

    /// Force the next save to re-examine this entry.
    pub fn invalidate(&mut self) {
        self.flags &= !IX_HASHVALID;
    }

    pub fn is_dir(&self) -> bool {
        self.path.as_str().ends_with('/')
    }

    fn write_stat_block(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.mode.to_le_bytes());
        out.extend_from_slice(&self.gitmode.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.dev.to_le_bytes());
        out.extend_from_slice(&self.ino.to_le_bytes());
        out.extend_from_slice(&self.nlink.to_le_bytes());
        out.extend_from_slice(&self.atime.to_le_bytes());
        out.extend_from_slice(&self.mtime.to_le_bytes());
        out.extend_from_slice(&self.ctime.to_le_bytes());
        out.extend_from_slice(self.sha.as_bytes());
        out.extend_from_slice(&self.meta_ofs.to_le_bytes());
    }
}

/// The index ordering: byte-wise, except a strict prefix sorts *after* its
/// extensions. That's what puts `a/b`, then `a/`, then `ab` in a row.
pub fn index_cmp(a: &str, b: &str) -> Ordering {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    let n = a.len().min(b.len());
    match a[..n].cmp(&b[..n]) {
        Ordering::Equal => b.len().cmp(&a.len()),
        other => other,
    }
}

pub struct Index {
    file: File,
    pub entries: Vec<Entry>,
}

impl Index {
    /// Open an index read-write; save needs to repack entries in place.
    pub fn open(path: &Utf8Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Cannot access {path}; have you run `duffel index`?"))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        ensure!(
            bytes.len() >= INDEX_MAGIC.len() && &bytes[..INDEX_MAGIC.len()] == INDEX_MAGIC,
            "{path} is not an index file"
        );

        let mut entries = Vec::new();
        let mut at = INDEX_MAGIC.len();
        while at < bytes.len() {
            ensure!(at + 4 <= bytes.len(), "{path} is truncated");
            let path_len = u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap()) as usize;
            at += 4;
            ensure!(at + path_len + STAT_BLOCK_LEN <= bytes.len(), "{path} is truncated");
            let epath = std::str::from_utf8(&bytes[at..at + path_len])
                .context("Non-UTF-8 path in index")?
                .to_owned();
            at += path_len;
            let stat_ofs = at as u64;

            let mut fields = [0u64; 7];
            let mut f = at;
            let flags = u32::from_le_bytes(bytes[f..f + 4].try_into().unwrap());
            let mode = u32::from_le_bytes(bytes[f + 4..f + 8].try_into().unwrap());
            let gitmode = u32::from_le_bytes(bytes[f + 8..f + 12].try_into().unwrap());
            f += 12;
            for field in &mut fields {
                *field = u64::from_le_bytes(bytes[f..f + 8].try_into().unwrap());
                f += 8;
            }
            let sha = ObjectId::from_bytes(&bytes[f..f + ID_LEN])?;
            f += ID_LEN;
            let meta_ofs = u64::from_le_bytes(bytes[f..f + 8].try_into().unwrap());

            entries.push(Entry {
                path: epath.into(),
                flags,
                mode,
                gitmode,
                size: fields[0],
                dev: fields[1],
                ino: fields[2],
                nlink: fields[3],
                atime: fields[4] as i64,
                mtime: fields[5] as i64,
                ctime: fields[6] as i64,
                sha,
                meta_ofs,
                stat_ofs,
            });
            at += STAT_BLOCK_LEN;
        }

        debug!("Read {} index entries from {path}", entries.len());
        Ok(Self { file, entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Persist an entry's (possibly modified) stat block.
    /// Idempotent: rewriting an unchanged entry writes identical bytes.
    pub fn repack(&mut self, which: usize) -> Result<()> {
        let e = &self.entries[which];
        let mut block = Vec::with_capacity(STAT_BLOCK_LEN);
        e.write_stat_block(&mut block);
        self.file
            .write_all_at(&block, e.stat_ofs)
            .with_context(|| format!("Couldn't repack index entry {}", e.path))?;
        Ok(())
    }

    /// Positions of the entries save should visit: those at or under the
    /// given sources, minus the contents of any directory `wantrecurse`
    /// declines (the directory's own entry is still yielded, so save can
    /// reuse its stored tree wholesale).
    pub fn select(
        &self,
        sources: &[Utf8PathBuf],
        mut wantrecurse: impl FnMut(&Entry) -> bool,
    ) -> Vec<usize> {
        let mut keep = Vec::new();
        let mut skip_below: Option<String> = None;

        // Contents precede their directory, so walk backwards: by the time
        // we see a file, we know whether some enclosing dir was pruned.
        for i in (0..self.entries.len()).rev() {
            let e = &self.entries[i];
            if !under_any(&e.path, sources) {
                continue;
            }
            if let Some(prefix) = &skip_below {
                if e.path.as_str().starts_with(prefix.as_str()) {
                    continue;
                }
                skip_below = None;
            }
            if e.is_dir() && !wantrecurse(e) {
                skip_below = Some(e.path.as_str().to_owned());
            }
            keep.push(i);
        }
        keep.reverse();
        keep
    }
}

fn under_any(path: &Utf8Path, sources: &[Utf8PathBuf]) -> bool {
    if sources.is_empty() {
        return true;
    }
    sources.iter().any(|s| {
        let s = s.as_str();
        let p = path.as_str();
        p == s || p.strip_prefix(s).is_some_and(|rest| rest.starts_with('/')) || {
            // A directory source's own entry carries a trailing slash.
            p.strip_suffix('/').is_some_and(|trimmed| trimmed == s)
        }
    })
}

pub struct MetaStoreReader {
    data: Vec<u8>,
}

impl MetaStoreReader {
    pub fn open(path: &Utf8Path) -> Result<Self> {
        let data =
            fs::read(path).with_context(|| format!("Cannot access {path}; have you run `duffel index`?"))?;
        ensure!(
            data.len() >= META_MAGIC.len() && &data[..META_MAGIC.len()] == META_MAGIC,
            "{path} is not a metadata store"
        );
        Ok(Self { data })
    }

    pub fn metadata_at(&self, ofs: u64) -> Result<Metadata> {
        let ofs = ofs as usize;
        ensure!(
            ofs >= META_MAGIC.len() && ofs < self.data.len(),
            "Metadata offset {ofs} out of bounds"
        );
        let mut slice = &self.data[ofs..];
        Metadata::read_from(&mut slice)?
            .ok_or_else(|| anyhow::anyhow!("Metadata offset {ofs} points at end of store"))
    }
}

struct MetaStoreWriter {
    file: BufWriter<File>,
    ofs: u64,
    // Identical records share one offset.
    dedup: FxHashMap<Vec<u8>, u64>,
}

impl MetaStoreWriter {
    fn create(path: &Utf8Path) -> Result<Self> {
        let mut file = BufWriter::new(
            File::create(path).with_context(|| format!("Couldn't create {path}"))?,
        );
        file.write_all(META_MAGIC)?;
        Ok(Self {
            file,
            ofs: META_MAGIC.len() as u64,
            dedup: FxHashMap::default(),
        })
    }

    fn store(&mut self, meta: &Metadata) -> Result<u64> {
        let mut stripped = meta.clone();
        stripped.clear_times();
        let encoded = stripped.encode()?;
        if let Some(ofs) = self.dedup.get(&encoded) {
            return Ok(*ofs);
        }
        let ofs = self.ofs;
        self.file.write_all(&encoded)?;
        self.ofs += encoded.len() as u64;
        self.dedup.insert(encoded, ofs);
        Ok(ofs)
    }

    fn finish(mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}

/// Build (or refresh) the index for the given sources, along with its
/// metadata store and hardlink DB.
///
/// Merging against the previous index is what makes save incremental: an
/// entry whose identity and times are unchanged keeps its recorded oid and
/// stays hashvalid. Paths that vanished are carried forward with EXISTS
/// cleared so save knows they're deletions.
pub fn update(indexfile: &Utf8Path, sources: &[Utf8PathBuf]) -> Result<usize> {
    let old: FxHashMap<Utf8PathBuf, Entry> = match Index::open(indexfile) {
        Ok(index) => index.entries.into_iter().map(|e| (e.path.clone(), e)).collect(),
        Err(_) => FxHashMap::default(),
    };

    let meta_path = Utf8PathBuf::from(format!("{indexfile}.meta"));
    let hlink_path = Utf8PathBuf::from(format!("{indexfile}.hlink"));
    let mut msw = MetaStoreWriter::create(&meta_path)?;
    let mut hlinks = hlink::HLinkWriter::new();

    let mut entries: Vec<Entry> = Vec::new();
    for source in sources {
        walk(source, &old, &mut msw, &mut hlinks, &mut entries)?;
    }

    // Tombstones: previously indexed under these sources, now gone.
    let new_paths: FxHashSet<Utf8PathBuf> = entries.iter().map(|e| e.path.clone()).collect();
    for (path, old_entry) in &old {
        if under_any(path, sources) && !new_paths.contains(path) {
            let mut tomb = old_entry.clone();
            tomb.flags &= !IX_EXISTS;
            tomb.meta_ofs = 0;
            entries.push(tomb);
        }
    }

    entries.sort_by(|a, b| index_cmp(a.path.as_str(), b.path.as_str()));

    let mut out = Vec::with_capacity(entries.len() * 128);
    out.extend_from_slice(INDEX_MAGIC);
    for e in &entries {
        let path = e.path.as_str().as_bytes();
        out.extend_from_slice(&(path.len() as u32).to_le_bytes());
        out.extend_from_slice(path);
        e.write_stat_block(&mut out);
    }
    crate::file_util::write_atomic(indexfile, &out)?;
    msw.finish()?;
    hlinks.write_to(&hlink_path)?;

    info!("Indexed {} entries into {indexfile}", entries.len());
    Ok(entries.len())
}

fn walk(
    path: &Utf8Path,
    old: &FxHashMap<Utf8PathBuf, Entry>,
    msw: &mut MetaStoreWriter,
    hlinks: &mut hlink::HLinkWriter,
    entries: &mut Vec<Entry>,
) -> Result<()> {
    use std::os::unix::fs::MetadataExt;

    let stat = match fs::symlink_metadata(path) {
        Ok(s) => s,
        Err(e) => {
            add_error(format!("index: {path}: {e}"));
            return Ok(());
        }
    };

    let is_dir = stat.file_type().is_dir();
    if is_dir {
        let listing = match fs::read_dir(path) {
            Ok(l) => l,
            Err(e) => {
                add_error(format!("index: {path}: {e}"));
                return Ok(());
            }
        };
        // Sorted, so first-seen hardlink paths are deterministic.
        let mut children = Vec::new();
        for child in listing {
            match Utf8PathBuf::from_path_buf(child?.path()) {
                Ok(p) => children.push(p),
                Err(p) => add_error(format!("index: skipping non-UTF-8 path {p:?}")),
            }
        }
        children.sort();
        for child in &children {
            walk(child, old, msw, hlinks, entries)?;
        }
    }

    let meta = match Metadata::from_path(path) {
        Ok(m) => m,
        Err(e) => {
            add_error(format!("index: {e:#}"));
            return Ok(());
        }
    };
    let meta_ofs = msw.store(&meta)?;

    if !is_dir && stat.nlink() > 1 {
        hlinks.add(stat.dev(), stat.ino(), path);
    }

    let entry_path = if is_dir {
        Utf8PathBuf::from(format!("{path}/"))
    } else {
        path.to_owned()
    };

    let mut entry = Entry {
        path: entry_path,
        flags: IX_EXISTS,
        mode: stat.mode(),
        gitmode: tree::gitmode_for(stat.mode()),
        size: stat.len(),
        dev: stat.dev(),
        ino: stat.ino(),
        nlink: stat.nlink(),
        atime: meta.atime,
        mtime: meta.mtime,
        ctime: meta.ctime,
        sha: EMPTY_ID,
        meta_ofs,
        stat_ofs: 0,
    };

    // Unchanged since last time? Keep what we know about it.
    if let Some(prev) = old.get(&entry.path) {
        let unchanged = prev.dev == entry.dev
            && prev.ino == entry.ino
            && prev.size == entry.size
            && prev.mtime == entry.mtime
            && prev.ctime == entry.ctime;
        if unchanged && prev.is_valid() {
            entry.sha = prev.sha;
            entry.gitmode = prev.gitmode;
            entry.flags |= IX_HASHVALID;
        }
    }

    entries.push(entry);
    Ok(())
}
