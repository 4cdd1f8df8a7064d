//! Transactional writer.
//!
//! Every filesystem mutation of a deploy goes through one [`Transaction`].
//! Operations are either applied as soon as they are submitted or, when the
//! environment reports that the target needs elevation or is locked,
//! deferred to [`Transaction::commit`]. Each applied operation records how
//! to undo itself: the previous file is moved into the transaction's backup
//! area (never copied), or an absence marker is kept when the target did not
//! exist. Rollback undoes applied operations in strict reverse order.
//!
//! ```text
//! Idle --submit--> Recording --commit--> Committing --> Committed
//!                      |                     |
//!                      +----rollback----+    +--failure--> RolledBack
//!                                       |                  RollbackFailed
//!                                       +--> RolledBack
//! ```
//!
//! The workspace (staging and backup directories) lives under the target
//! root so every move is a same-filesystem rename.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::{TempDir, TempPath};
use thiserror::Error;

/// Hints attached to an operation by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpHints {
    /// The entry is flagged as needing elevated privileges.
    pub requires_elevation: bool,
}

/// Answers questions about the target system.
///
/// Privilege elevation itself is outside this crate; the environment only
/// says whether an operation has to wait for the commit phase.
pub trait TargetEnvironment: Send + Sync + fmt::Debug {
    /// Whether writing `target` needs elevated privileges.
    fn requires_elevation(&self, target: &Path, hints: OpHints) -> bool;

    /// Whether `target` is currently in use and cannot be replaced.
    fn is_locked(&self, target: &Path) -> bool;
}

/// Environment for the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalEnvironment {
    /// The process already runs with elevated privileges.
    pub elevated: bool,
}

impl TargetEnvironment for LocalEnvironment {
    fn requires_elevation(&self, _: &Path, hints: OpHints) -> bool {
        hints.requires_elevation && !self.elevated
    }

    fn is_locked(&self, _: &Path) -> bool {
        // No portable in-use check; a locked file shows up as a failed rename.
        false
    }
}

/// A filesystem mutation.
#[derive(Debug)]
pub enum Operation {
    /// Move a verified staged file to `target`, replacing what is there.
    Write {
        /// Final path.
        target: PathBuf,
        /// Staged content; must live on the same filesystem as `target`.
        staged: TempPath,
        /// Caller hints.
        hints: OpHints,
    },
    /// Remove `target` if it exists.
    Delete {
        /// Path to remove.
        target: PathBuf,
    },
}

impl Operation {
    /// Path this operation mutates.
    pub fn target(&self) -> &Path {
        match self {
            Self::Write { target, .. } | Self::Delete { target } => target,
        }
    }

    fn hints(&self) -> OpHints {
        match self {
            Self::Write { hints, .. } => *hints,
            Self::Delete { .. } => OpHints::default(),
        }
    }
}

/// What [`Transaction::submit`] did with an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Applied to the filesystem now.
    Applied,
    /// Queued for the commit phase.
    Deferred,
}

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Nothing submitted yet.
    Idle,
    /// Accepting operations.
    Recording,
    /// Applying deferred operations.
    Committing,
    /// Terminal success.
    Committed,
    /// Terminal failure; the filesystem was restored.
    RolledBack,
    /// Terminal failure; restoring the filesystem failed.
    RollbackFailed,
}

impl TransactionState {
    fn is_open(self) -> bool {
        matches!(self, Self::Idle | Self::Recording)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Recording => "recording",
            Self::Committing => "committing",
            Self::Committed => "committed",
            Self::RolledBack => "rolled back",
            Self::RollbackFailed => "rollback failed",
        };
        f.write_str(s)
    }
}

/// Transaction failures.
#[derive(Error, Debug)]
pub enum TransactionError {
    /// An operation failed; every applied operation was reversed.
    #[error("operation {index} on {target} failed: {source}; all changes were rolled back")]
    CommitFailed {
        /// Submission index of the failing operation.
        index: usize,
        /// Its target.
        target: PathBuf,
        /// Cause.
        #[source]
        source: io::Error,
    },

    /// Reversing applied operations failed. The filesystem is in an
    /// unknown intermediate state.
    #[error(
        "ROLLBACK FAILED at operation {index} on {target}: {source} \
         ({failures} undo step(s) failed; rollback was triggered by: {trigger}){}",
        preserved_note(.preserved.as_deref())
    )]
    RollbackFailed {
        /// Submission index of the first operation that could not be undone.
        index: usize,
        /// Its target.
        target: PathBuf,
        /// Cause.
        #[source]
        source: io::Error,
        /// Number of undo steps that failed.
        failures: usize,
        /// What triggered the rollback.
        trigger: String,
        /// Workspace kept on disk because it still holds backups.
        preserved: Option<PathBuf>,
    },

    /// The operation is not valid in the current state.
    #[error("cannot {action} a transaction that is {state}")]
    InvalidState {
        /// Attempted action.
        action: &'static str,
        /// Current state.
        state: TransactionState,
    },

    /// The transaction workspace could not be set up.
    #[error("cannot prepare transaction workspace in {path}: {source}")]
    Workspace {
        /// Directory involved.
        path: PathBuf,
        /// Cause.
        #[source]
        source: io::Error,
    },
}

fn preserved_note(preserved: Option<&Path>) -> String {
    preserved
        .map(|p| format!("; backups preserved in {}", p.display()))
        .unwrap_or_default()
}

impl TransactionError {
    /// Process exit code for this failure class.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::CommitFailed { .. } | Self::InvalidState { .. } => 40,
            Self::RollbackFailed { .. } => 41,
            Self::Workspace { .. } => 32,
        }
    }

    /// Returns `true` for the one failure that must never be reported as a
    /// clean failure.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RollbackFailed { .. })
    }
}

/// An operation the environment refused at submit time, handed back to the
/// caller so it can be deferred or abandoned.
#[derive(Debug)]
pub struct Pending {
    index: usize,
    operation: Operation,
}

impl Pending {
    /// Submission index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The operation.
    pub fn operation(&self) -> &Operation {
        &self.operation
    }
}

/// Submit failures.
#[derive(Error, Debug)]
pub enum SubmitError {
    /// Applying the operation failed. Anything it could not put back is
    /// recorded for rollback.
    #[error("target {} is unavailable: {source}", .pending.operation.target().display())]
    Unavailable {
        /// The refused operation.
        pending: Pending,
        /// Cause.
        #[source]
        source: io::Error,
    },

    /// The transaction no longer accepts operations.
    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

/// Counts reported by a successful commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    /// Operations applied at submit time.
    pub immediate: usize,
    /// Operations applied during commit.
    pub deferred: usize,
}

#[derive(Debug)]
enum Prior {
    Absent,
    Backup(PathBuf),
}

#[derive(Debug)]
struct AppliedOp {
    index: usize,
    target: PathBuf,
    wrote: bool,
    prior: Prior,
    created_dirs: Vec<PathBuf>,
}

/// Ordered, reversible batch of filesystem operations.
#[derive(Debug)]
pub struct Transaction {
    root: PathBuf,
    env: Arc<dyn TargetEnvironment>,
    state: TransactionState,
    workspace: Option<TempDir>,
    created_root: Vec<PathBuf>,
    applied: Vec<AppliedOp>,
    pending: Vec<Pending>,
    submitted: usize,
    immediate: usize,
    backups: usize,
    commit_timeout: Duration,
    poll_interval: Duration,
    #[cfg(test)]
    refuse_restore: bool,
}

const STAGING_DIR: &str = "staging";
const BACKUP_DIR: &str = "backup";

impl Transaction {
    /// Open a transaction rooted at `root`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::Workspace`] if the root or the workspace
    /// cannot be created.
    pub fn new(root: &Path, env: Arc<dyn TargetEnvironment>) -> Result<Self, TransactionError> {
        let workspace_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: io::Error| TransactionError::Workspace { path, source }
        };

        let created_root = create_dirs(root).map_err(workspace_err(root))?;
        let workspace = tempfile::Builder::new()
            .prefix(".inpack-txn-")
            .tempdir_in(root)
            .map_err(workspace_err(root))?;
        for sub in [STAGING_DIR, BACKUP_DIR] {
            let dir = workspace.path().join(sub);
            fs::create_dir(&dir).map_err(workspace_err(&dir))?;
        }

        tracing::debug!(root = %root.display(), workspace = %workspace.path().display(), "transaction opened");
        Ok(Self {
            root: root.to_path_buf(),
            env,
            state: TransactionState::Idle,
            workspace: Some(workspace),
            created_root,
            applied: Vec::new(),
            pending: Vec::new(),
            submitted: 0,
            immediate: 0,
            backups: 0,
            commit_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            #[cfg(test)]
            refuse_restore: false,
        })
    }

    /// Set how long commit waits for a locked target and how often it checks.
    pub fn with_timeouts(mut self, commit_timeout: Duration, poll_interval: Duration) -> Self {
        self.commit_timeout = commit_timeout;
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    /// Current state.
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Target root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for staged files; same filesystem as the targets.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::InvalidState`] once the transaction has
    /// finished.
    pub fn staging_dir(&self) -> Result<PathBuf, TransactionError> {
        match &self.workspace {
            Some(ws) if self.state.is_open() => Ok(ws.path().join(STAGING_DIR)),
            _ => Err(TransactionError::InvalidState {
                action: "stage into",
                state: self.state,
            }),
        }
    }

    /// Number of operations waiting for commit.
    pub fn deferred_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether an operation on `target` would be deferred.
    pub fn disposition_for(&self, target: &Path, hints: OpHints) -> Disposition {
        if self.env.requires_elevation(target, hints) || self.env.is_locked(target) {
            Disposition::Deferred
        } else {
            Disposition::Applied
        }
    }

    /// Submit an operation. It is applied now unless the environment says it
    /// must wait for the commit phase.
    ///
    /// # Errors
    ///
    /// Returns [`SubmitError::Unavailable`] with the operation if applying it
    /// failed, or
    /// [`SubmitError::Transaction`] if the transaction is closed.
    pub fn submit(&mut self, operation: Operation) -> Result<Disposition, SubmitError> {
        self.ensure_open("submit to")?;
        self.state = TransactionState::Recording;

        let index = self.submitted;
        self.submitted += 1;
        let pending = Pending { index, operation };

        if self.disposition_for(pending.operation.target(), pending.operation.hints())
            == Disposition::Deferred
        {
            return Ok(self.defer(pending));
        }

        match self.apply(pending) {
            Ok(applied) => {
                self.applied.push(applied);
                self.immediate += 1;
                Ok(Disposition::Applied)
            }
            Err((pending, source)) => Err(SubmitError::Unavailable { pending, source }),
        }
    }

    /// Queue an operation for the commit phase.
    pub fn defer(&mut self, pending: Pending) -> Disposition {
        tracing::debug!(
            index = pending.index,
            target = %pending.operation.target().display(),
            "operation deferred to commit"
        );
        self.pending.push(pending);
        Disposition::Deferred
    }

    /// Apply every deferred operation in submission order and finish.
    ///
    /// On failure everything applied so far, including operations applied at
    /// submit time, is reversed.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::CommitFailed`] after a successful
    /// rollback, [`TransactionError::RollbackFailed`] if the rollback itself
    /// failed, or [`TransactionError::InvalidState`].
    pub fn commit(&mut self) -> Result<CommitSummary, TransactionError> {
        self.ensure_open("commit")?;
        self.state = TransactionState::Committing;

        let mut pending = std::mem::take(&mut self.pending);
        pending.sort_by_key(|p| p.index);
        let deferred = pending.len();

        for op in pending {
            let index = op.index;
            let target = op.operation.target().to_path_buf();

            // A timed-out operation is dropped here, which removes its staged file.
            let outcome = match self.wait_unlocked(&target) {
                Ok(()) => self.apply(op).map_err(|(_, e)| e),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(applied) => self.applied.push(applied),
                Err(source) => {
                    tracing::warn!(index, target = %target.display(), error = %source, "commit failed, rolling back");
                    let trigger =
                        format!("operation {index} on {} failed: {source}", target.display());
                    self.undo_all(&trigger)?;
                    return Err(TransactionError::CommitFailed {
                        index,
                        target,
                        source,
                    });
                }
            }
        }

        self.state = TransactionState::Committed;
        self.applied.clear();
        self.workspace.take();
        tracing::info!(immediate = self.immediate, deferred, "transaction committed");
        Ok(CommitSummary {
            immediate: self.immediate,
            deferred,
        })
    }

    /// Abandon the transaction, reversing everything applied so far.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::RollbackFailed`] if an undo step fails,
    /// or [`TransactionError::InvalidState`] if already finished.
    pub fn rollback(&mut self, trigger: &str) -> Result<(), TransactionError> {
        self.ensure_open("roll back")?;
        self.undo_all(trigger)
    }

    fn ensure_open(&self, action: &'static str) -> Result<(), TransactionError> {
        if self.state.is_open() {
            Ok(())
        } else {
            Err(TransactionError::InvalidState {
                action,
                state: self.state,
            })
        }
    }

    fn wait_unlocked(&self, target: &Path) -> io::Result<()> {
        let started = Instant::now();
        while self.env.is_locked(target) {
            if started.elapsed() >= self.commit_timeout {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!(
                        "still locked after {:.1}s",
                        self.commit_timeout.as_secs_f64()
                    ),
                ));
            }
            std::thread::sleep(self.poll_interval);
        }
        Ok(())
    }

    /// Fresh backup slot. Slots are never reused, so a retried operation
    /// cannot overwrite a backup an earlier attempt left behind.
    fn backup_path(&mut self, index: usize) -> io::Result<PathBuf> {
        let slot = self.backups;
        self.backups += 1;
        self.workspace
            .as_ref()
            .map(|ws| ws.path().join(BACKUP_DIR).join(format!("{index}.{slot}")))
            .ok_or_else(|| io::Error::other("transaction workspace is gone"))
    }

    /// Move a backup back over `target` after a failed write.
    #[cfg_attr(not(test), allow(clippy::unused_self))]
    fn restore_backup(&self, backup: &Path, target: &Path) -> io::Result<()> {
        #[cfg(test)]
        if self.refuse_restore {
            return Err(io::Error::other("restore refused"));
        }
        fs::rename(backup, target)
    }

    /// Apply one operation. On failure the operation is handed back and the
    /// filesystem is left as it was. If the previous file cannot be put back
    /// after a failed write, its backup is recorded as applied so rollback
    /// retries the restore.
    fn apply(&mut self, pending: Pending) -> Result<AppliedOp, (Pending, io::Error)> {
        let index = pending.index;
        let target = pending.operation.target().to_path_buf();

        let backup = match self.backup_path(index) {
            Ok(b) => b,
            Err(e) => return Err((pending, e)),
        };
        let existing = match fs::symlink_metadata(&target) {
            Ok(meta) if meta.is_dir() => {
                let e = io::Error::other("target is a directory");
                return Err((pending, e));
            }
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err((pending, e)),
        };

        match pending.operation {
            Operation::Delete { .. } => {
                if !existing {
                    return Ok(AppliedOp {
                        index,
                        target,
                        wrote: false,
                        prior: Prior::Absent,
                        created_dirs: Vec::new(),
                    });
                }
                if let Err(e) = fs::rename(&target, &backup) {
                    return Err((pending, e));
                }
                tracing::debug!(index, target = %target.display(), "deleted (backed up)");
                Ok(AppliedOp {
                    index,
                    target,
                    wrote: false,
                    prior: Prior::Backup(backup),
                    created_dirs: Vec::new(),
                })
            }
            Operation::Write { staged, hints, .. } => {
                let restore = |staged: TempPath, e: io::Error| {
                    let operation = Operation::Write {
                        target: target.clone(),
                        staged,
                        hints,
                    };
                    Err((Pending { index, operation }, e))
                };

                let parent = target.parent().unwrap_or(&self.root);
                let created_dirs = match create_dirs(parent) {
                    Ok(dirs) => dirs,
                    Err(e) => return restore(staged, e),
                };

                let prior = if existing {
                    if let Err(e) = fs::rename(&target, &backup) {
                        remove_dirs(&created_dirs);
                        return restore(staged, e);
                    }
                    Prior::Backup(backup)
                } else {
                    Prior::Absent
                };

                if let Err(e) = staged.persist(&target) {
                    let restored = match &prior {
                        Prior::Backup(backup) => self.restore_backup(backup, &target),
                        Prior::Absent => Ok(()),
                    };
                    if let Err(restore_err) = restored {
                        tracing::error!(
                            index,
                            target = %target.display(),
                            error = %restore_err,
                            "cannot restore target after failed write, keeping backup for rollback"
                        );
                        self.applied.push(AppliedOp {
                            index,
                            target: target.clone(),
                            wrote: false,
                            prior,
                            created_dirs,
                        });
                        return restore(e.path, e.error);
                    }
                    remove_dirs(&created_dirs);
                    return restore(e.path, e.error);
                }

                tracing::debug!(index, target = %target.display(), replaced = existing, "written");
                Ok(AppliedOp {
                    index,
                    target,
                    wrote: true,
                    prior,
                    created_dirs,
                })
            }
        }
    }

    fn undo(op: &AppliedOp) -> io::Result<()> {
        if op.wrote {
            match fs::remove_file(&op.target) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        if let Prior::Backup(backup) = &op.prior {
            fs::rename(backup, &op.target)?;
        }
        for dir in op.created_dirs.iter().rev() {
            match fs::remove_dir(dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Undo every applied operation in reverse order and settle the final state.
    fn undo_all(&mut self, trigger: &str) -> Result<(), TransactionError> {
        // Dropping queued operations removes their staged files.
        self.pending.clear();

        let mut first_failure: Option<(usize, PathBuf, io::Error)> = None;
        let mut failures = 0;
        while let Some(op) = self.applied.pop() {
            match Self::undo(&op) {
                Ok(()) => {
                    tracing::debug!(index = op.index, target = %op.target.display(), "undone");
                }
                Err(e) => {
                    tracing::error!(index = op.index, target = %op.target.display(), error = %e, "undo failed");
                    failures += 1;
                    if first_failure.is_none() {
                        first_failure = Some((op.index, op.target, e));
                    }
                }
            }
        }

        match first_failure {
            None => {
                self.state = TransactionState::RolledBack;
                self.workspace.take();
                remove_dirs(&self.created_root);
                tracing::info!(trigger, "transaction rolled back");
                Ok(())
            }
            Some((index, target, source)) => {
                self.state = TransactionState::RollbackFailed;
                let preserved = self.workspace.take().map(TempDir::keep);
                Err(TransactionError::RollbackFailed {
                    index,
                    target,
                    source,
                    failures,
                    trigger: trigger.to_string(),
                    preserved,
                })
            }
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        let unfinished = self.state.is_open() || self.state == TransactionState::Committing;
        if unfinished && (!self.applied.is_empty() || !self.pending.is_empty()) {
            tracing::warn!(root = %self.root.display(), "unfinished transaction dropped, rolling back");
            if let Err(e) = self.undo_all("transaction dropped before it finished") {
                tracing::error!(error = %e, "rollback of dropped transaction failed");
            }
        }
    }
}

/// Create `dir` and any missing ancestors, returning the ones created,
/// outermost first.
fn create_dirs(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut missing = Vec::new();
    let mut cursor = Some(dir);
    while let Some(p) = cursor {
        if p.as_os_str().is_empty() || p.exists() {
            break;
        }
        missing.push(p.to_path_buf());
        cursor = p.parent();
    }
    missing.reverse();
    for p in &missing {
        match fs::create_dir(p) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                remove_dirs(&missing);
                return Err(e);
            }
        }
    }
    Ok(missing)
}

/// Best-effort removal of directories created by [`create_dirs`], innermost first.
fn remove_dirs(dirs: &[PathBuf]) {
    for dir in dirs.iter().rev() {
        let _ = fs::remove_dir(dir);
    }
}
