//! The process-wide tally of non-fatal errors.
//!
//! Per-entry failures during a save (a file we couldn't stat, a duplicate
//! name after grafting) shouldn't unwind past the entry loop, but they must
//! flip the final exit code to 1. Everything funnels through [`add_error`]
//! so the end of the run can ask how many there were.

use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::error;

static SAVED_ERRORS: AtomicUsize = AtomicUsize::new(0);

/// Log a non-fatal error and bump the tally.
pub fn add_error(msg: impl AsRef<str>) {
    error!("{}", msg.as_ref());
    SAVED_ERRORS.fetch_add(1, Ordering::Relaxed);
}

/// How many non-fatal errors have been recorded so far.
pub fn count() -> usize {
    SAVED_ERRORS.load(Ordering::Relaxed)
}
