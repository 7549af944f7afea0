//! Performance counters: Count how many times we do various important operations.

use std::sync::LazyLock;
use std::sync::atomic::{AtomicUsize, Ordering, fence};

use enum_map::{Enum, EnumMap};
use tracing::debug;

#[derive(Debug, Copy, Clone, Enum)]
pub enum Op {
    BlobsWritten,
    TreesWritten,
    CommitsWritten,
    ObjectsAlreadyStored,
    EntriesReused,
    EntriesStored,
    EntriesSkipped,
    FilesSplit,
    BytesSplit,
    SidecarsWritten,
}

static COUNTER_MAP: LazyLock<EnumMap<Op, AtomicUsize>> = LazyLock::new(EnumMap::default);

#[inline]
pub fn bump(which: Op) {
    add(which, 1);
}

pub fn add(to: Op, amount: usize) {
    COUNTER_MAP[to].fetch_add(amount, Ordering::Relaxed);
}

pub fn log_counts() {
    // Probably not needed; but we're probably calling this once at program exit.
    fence(Ordering::SeqCst);

    let counts = COUNTER_MAP
        .iter()
        .map(|(k, v)| (k, v.load(Ordering::Relaxed)))
        .filter(|(_k, v)| *v > 0) // Ignore things we didn't do
        .collect::<Vec<_>>();

    if counts.is_empty() {
        return;
    }

    let opname = |op| match op {
        Op::BlobsWritten => "blobs written",
        Op::TreesWritten => "trees written",
        Op::CommitsWritten => "commits written",
        Op::ObjectsAlreadyStored => "objects already stored",
        Op::EntriesReused => "index entries reused",
        Op::EntriesStored => "index entries stored",
        Op::EntriesSkipped => "index entries skipped",
        Op::FilesSplit => "files split",
        Op::BytesSplit => "bytes split",
        Op::SidecarsWritten => "metadata sidecars written",
    };

    debug!("Counters:");
    for (op, count) in &counts {
        debug!("{:10} {}", count, opname(*op));
    }
}
