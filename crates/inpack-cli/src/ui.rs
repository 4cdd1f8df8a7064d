//! Console progress output.

use inpack_core::{EntryOutcome, FileEntry, ProgressSink};

/// Prints progress to stdout and problems to stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleSink {
    quiet: bool,
}

impl ConsoleSink {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }

    /// Print a line unless quiet.
    pub fn line(&self, msg: impl std::fmt::Display) {
        if !self.quiet {
            println!("{msg}");
        }
    }
}

impl ProgressSink for ConsoleSink {
    fn section(&self, title: &str) {
        self.line(format_args!("==> {title}"));
    }

    fn entry_started(&self, entry: &FileEntry, index: usize, total: usize) {
        tracing::debug!(entry_id = entry.id, path = %entry.container_path, "{}/{total}", index + 1);
    }

    fn entry_done(&self, entry: &FileEntry, outcome: &EntryOutcome) {
        let verb = match outcome {
            EntryOutcome::Packed => "packed",
            EntryOutcome::Written => "wrote",
            EntryOutcome::Deferred => "deferred",
            EntryOutcome::Skipped(_) => "skipped",
            EntryOutcome::Verified => "ok",
        };
        match outcome {
            EntryOutcome::Skipped(reason) => {
                self.line(format_args!("  {verb:>8}  {} ({reason})", entry.container_path));
            }
            _ => self.line(format_args!("  {verb:>8}  {}", entry.container_path)),
        }
    }

    fn entry_failed(&self, entry: &FileEntry, reason: &str) {
        eprintln!("  {:>8}  {}: {reason}", "FAILED", entry.container_path);
    }

    fn info(&self, msg: &str) {
        self.line(msg);
    }

    fn warning(&self, msg: &str) {
        eprintln!("warning: {msg}");
    }

    fn summary(&self, count: usize, action: &str, elapsed_secs: f64) {
        self.line(format_args!(
            "{action} {count} file(s) in {elapsed_secs:.2}s"
        ));
    }
}
