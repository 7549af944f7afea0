//! Cut byte streams into content-defined blobs and fold them into trees.
//!
//! Cut points come from the [`rollsum`](crate::rollsum) oracle, so a local
//! edit to a big file only changes the handful of blobs around it. When a
//! stream produces more leaves than one tree should hold, leaves are grouped
//! into intermediate trees; each cut point's extra one-bits decide how far
//! up the stack it closes, so the tree's shape depends only on the content
//! and is re-derivable run after run.

use std::io::{BufRead, BufReader, Read};

use anyhow::{Result, ensure};

use crate::counters;
use crate::hashing::ObjectId;
use crate::rollsum::{BLOB_BITS, Rollsum};
use crate::store::{Kind, ObjectStore};
use crate::tree::{self, GIT_MODE_FILE, GIT_MODE_TREE};

/// Blobs are cut by the rollsum, but never grow past this.
pub const MAX_BLOB: usize = crate::rollsum::BLOB_SIZE * 4;

// 16-way fanout: every 4 extra bits at a cut point close one more tree level.
const FANOUT_BITS: u32 = 4;

// Hard cap on entries in one split tree, whatever the bit levels say.
const MAX_PER_TREE: usize = 256;

/// Where split output goes. Blanket-implemented for every object store;
/// wrappers (like save's byte-counting one) implement it by hand.
pub trait Sink {
    fn make_blob(&mut self, bytes: &[u8]) -> Result<ObjectId>;
    fn make_tree(&mut self, entries: Vec<tree::Entry>) -> Result<ObjectId>;
}

impl<S: ObjectStore + ?Sized> Sink for S {
    fn make_blob(&mut self, bytes: &[u8]) -> Result<ObjectId> {
        self.new_blob(bytes)
    }

    fn make_tree(&mut self, entries: Vec<tree::Entry>) -> Result<ObjectId> {
        self.new_tree(entries)
    }
}

#[derive(Debug, Clone)]
struct Leaf {
    gitmode: u32,
    oid: ObjectId,
    size: u64,
}

/// The partially-built right edge of the split tree, one list per level.
#[derive(Default)]
struct TreeStack {
    levels: Vec<Vec<Leaf>>,
}

impl TreeStack {
    fn push_leaf<S: Sink + ?Sized>(&mut self, sink: &mut S, leaf: Leaf, level: usize) -> Result<()> {
        if self.levels.is_empty() {
            self.levels.push(Vec::new());
        }
        self.levels[0].push(leaf);
        self.squish(sink, level)
    }

    /// Close every level below `n`, plus any level that hit the entry cap.
    fn squish<S: Sink + ?Sized>(&mut self, sink: &mut S, n: usize) -> Result<()> {
        let mut i = 0;
        while i < n || self.levels.get(i).is_some_and(|l| l.len() >= MAX_PER_TREE) {
            while self.levels.len() <= i + 1 {
                self.levels.push(Vec::new());
            }
            let closing = std::mem::take(&mut self.levels[i]);
            match closing.len() {
                0 => (),
                // A lone leaf bubbles up unchanged; no point wrapping it.
                1 => self.levels[i + 1].extend(closing),
                _ => {
                    let size = closing.iter().map(|l| l.size).sum();
                    let oid = sink.make_tree(shalist(&closing))?;
                    self.levels[i + 1].push(Leaf {
                        gitmode: GIT_MODE_TREE,
                        oid,
                        size,
                    });
                }
            }
            i += 1;
        }
        Ok(())
    }

    fn finish<S: Sink + ?Sized>(mut self, sink: &mut S) -> Result<Vec<Leaf>> {
        if self.levels.is_empty() {
            return Ok(Vec::new());
        }
        let top = self.levels.len() - 1;
        self.squish(sink, top)?;
        Ok(self.levels.pop().unwrap())
    }
}

/// Name split-tree children by their starting offset, in fixed-width hex so
/// the storage collation keeps them in stream order.
fn shalist(leaves: &[Leaf]) -> Vec<tree::Entry> {
    let total: u64 = leaves.iter().map(|l| l.size).sum();
    let width = format!("{total:x}").len();
    let mut ofs = 0u64;
    leaves
        .iter()
        .map(|l| {
            let e = tree::Entry::new(l.gitmode, format!("{ofs:0width$x}"), l.oid);
            ofs += l.size;
            e
        })
        .collect()
}

/// Split a stream into content-defined blobs, folding them into a balanced
/// tree when there's more than one.
///
/// Returns `(GIT_MODE_FILE, oid)` if everything fit in a single blob, or
/// `(GIT_MODE_TREE, oid)` of the root of the split tree otherwise. The roll
/// state spans the whole stream; read-buffer boundaries never affect cuts.
pub fn split_to_blob_or_tree<R: Read, S: Sink + ?Sized>(
    sink: &mut S,
    reader: R,
) -> Result<(u32, ObjectId)> {
    let mut reader = BufReader::with_capacity(1 << 16, reader);
    let mut stack = TreeStack::default();
    let mut chunk: Vec<u8> = Vec::with_capacity(MAX_BLOB);
    let mut roll = Rollsum::new();
    let mut total = 0u64;
    let mut leaves = 0usize;

    loop {
        let buf = reader.fill_buf()?;
        if buf.is_empty() {
            break;
        }

        let mut consumed = 0;
        let mut cut_level = None;
        for b in buf {
            roll.roll(*b);
            consumed += 1;
            if roll.at_split() {
                cut_level = Some(((roll.split_bits() - BLOB_BITS) / FANOUT_BITS) as usize);
                break;
            }
            if chunk.len() + consumed >= MAX_BLOB {
                cut_level = Some(0);
                break;
            }
        }
        chunk.extend_from_slice(&buf[..consumed]);
        reader.consume(consumed);

        if let Some(level) = cut_level {
            let oid = sink.make_blob(&chunk)?;
            stack.push_leaf(
                sink,
                Leaf {
                    gitmode: GIT_MODE_FILE,
                    oid,
                    size: chunk.len() as u64,
                },
                level,
            )?;
            total += chunk.len() as u64;
            leaves += 1;
            chunk.clear();
            roll = Rollsum::new();
        }
    }

    // The tail after the last cut - or the whole input, if it never cut.
    if !chunk.is_empty() || leaves == 0 {
        let oid = sink.make_blob(&chunk)?;
        stack.push_leaf(
            sink,
            Leaf {
                gitmode: GIT_MODE_FILE,
                oid,
                size: chunk.len() as u64,
            },
            0,
        )?;
        total += chunk.len() as u64;
    }

    counters::add(counters::Op::BytesSplit, total as usize);

    let top = stack.finish(sink)?;
    match top.len() {
        0 => Ok((GIT_MODE_FILE, sink.make_blob(b"")?)),
        1 => Ok((top[0].gitmode, top[0].oid)),
        _ => Ok((GIT_MODE_TREE, sink.make_tree(shalist(&top))?)),
    }
}

/// Reassemble the bytes behind a split result: a single blob, or an in-order
/// walk of the split tree's leaves.
pub fn join(store: &dyn ObjectStore, gitmode: u32, id: &ObjectId) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    join_into(store, gitmode, id, &mut out)?;
    Ok(out)
}

fn join_into(store: &dyn ObjectStore, gitmode: u32, id: &ObjectId, out: &mut Vec<u8>) -> Result<()> {
    let (kind, bytes) = store.read_object(id)?;
    if tree::is_tree_mode(gitmode) {
        ensure!(kind == Kind::Tree, "Expected {id} to be a tree");
        for entry in tree::decode(&bytes)? {
            join_into(store, entry.gitmode, &entry.oid, out)?;
        }
    } else {
        ensure!(kind == Kind::Blob, "Expected {id} to be a blob");
        out.extend_from_slice(&bytes);
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::store::memory::MemoryStore;

    fn splodge(n: usize) -> Vec<u8> {
        let mut state = 0x9e3779b9u64;
        (0..n)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (state >> 33) as u8
            })
            .collect()
    }

    #[test]
    fn small_input_is_one_blob() -> Result<()> {
        let mut store = MemoryStore::new();
        let (mode, id) = split_to_blob_or_tree(&mut store, &b"hello"[..])?;
        assert_eq!(mode, GIT_MODE_FILE);
        assert_eq!(join(&store, mode, &id)?, b"hello");
        Ok(())
    }

    #[test]
    fn empty_input_is_an_empty_blob() -> Result<()> {
        let mut store = MemoryStore::new();
        let (mode, id) = split_to_blob_or_tree(&mut store, &b""[..])?;
        assert_eq!(mode, GIT_MODE_FILE);
        assert_eq!(join(&store, mode, &id)?, b"");
        Ok(())
    }

    #[test]
    fn big_input_round_trips() -> Result<()> {
        let data = splodge(1024 * 1024);
        let mut store = MemoryStore::new();
        let (mode, id) = split_to_blob_or_tree(&mut store, &data[..])?;
        // A megabyte of noise is far more than one 32k blob.
        assert_eq!(mode, GIT_MODE_TREE);
        assert!(store.blob_writes > 1);
        assert_eq!(join(&store, mode, &id)?, data);
        Ok(())
    }

    /// The whole point: same content, same tree, every time.
    #[test]
    fn deterministic() -> Result<()> {
        let data = splodge(512 * 1024);
        let mut store = MemoryStore::new();
        let first = split_to_blob_or_tree(&mut store, &data[..])?;
        let second = split_to_blob_or_tree(&mut store, &data[..])?;
        assert_eq!(first, second);
        Ok(())
    }

    /// Cuts can't depend on how the reader happens to buffer.
    #[test]
    fn buffering_is_invisible() -> Result<()> {
        let data = splodge(256 * 1024);
        let mut store = MemoryStore::new();
        let whole = split_to_blob_or_tree(&mut store, &data[..])?;
        let dribble = split_to_blob_or_tree(
            &mut store,
            DribbleReader {
                data: &data,
                at: 0,
            },
        )?;
        assert_eq!(whole, dribble);
        Ok(())
    }

    struct DribbleReader<'a> {
        data: &'a [u8],
        at: usize,
    }

    impl Read for DribbleReader<'_> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            // 7 bytes at a time, to misalign with everything.
            let n = buf.len().min(7).min(self.data.len() - self.at);
            buf[..n].copy_from_slice(&self.data[self.at..self.at + n]);
            self.at += n;
            Ok(n)
        }
    }
}
