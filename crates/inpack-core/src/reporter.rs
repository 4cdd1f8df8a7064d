//! Progress sink passed explicitly through the build and deploy call chains.
//!
//! Core logic reports progress through this trait without being coupled to
//! a terminal, GUI or log format. There is no process-wide listener
//! registry: whoever starts an operation hands it a sink.

use inpack_schema::FileEntry;

/// What happened to one file entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    /// Written into the archive at build time.
    Packed,
    /// Written to its target immediately.
    Written,
    /// Queued for the commit phase (elevation required or target locked).
    Deferred,
    /// Not written; the reason is attached.
    Skipped(String),
    /// Checksum confirmed without writing.
    Verified,
}

/// Receives progress notifications.
pub trait ProgressSink: Send + Sync {
    /// A new phase has started (e.g. "Resolving", "Unpacking", "Committing").
    fn section(&self, title: &str);

    /// Work on an entry has started; `index` is zero-based.
    fn entry_started(&self, entry: &FileEntry, index: usize, total: usize);

    /// An entry finished.
    fn entry_done(&self, entry: &FileEntry, outcome: &EntryOutcome);

    /// An entry failed.
    fn entry_failed(&self, entry: &FileEntry, reason: &str);

    /// Informational message.
    fn info(&self, msg: &str);

    /// Non-fatal problem the operator should see.
    fn warning(&self, msg: &str);

    /// Final summary of an operation.
    fn summary(&self, count: usize, action: &str, elapsed_secs: f64);
}

impl<T: ProgressSink + ?Sized> ProgressSink for std::sync::Arc<T> {
    fn section(&self, title: &str) {
        (**self).section(title);
    }
    fn entry_started(&self, entry: &FileEntry, index: usize, total: usize) {
        (**self).entry_started(entry, index, total);
    }
    fn entry_done(&self, entry: &FileEntry, outcome: &EntryOutcome) {
        (**self).entry_done(entry, outcome);
    }
    fn entry_failed(&self, entry: &FileEntry, reason: &str) {
        (**self).entry_failed(entry, reason);
    }
    fn info(&self, msg: &str) {
        (**self).info(msg);
    }
    fn warning(&self, msg: &str) {
        (**self).warning(msg);
    }
    fn summary(&self, count: usize, action: &str, elapsed_secs: f64) {
        (**self).summary(count, action, elapsed_secs);
    }
}

/// A no-op sink for silent operations (e.g., verification, testing).
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn section(&self, _: &str) {}
    fn entry_started(&self, _: &FileEntry, _: usize, _: usize) {}
    fn entry_done(&self, _: &FileEntry, _: &EntryOutcome) {}
    fn entry_failed(&self, _: &FileEntry, _: &str) {}
    fn info(&self, _: &str) {}
    fn warning(&self, _: &str) {}
    fn summary(&self, _: usize, _: &str, _: f64) {}
}
