//! Deploy driver.
//!
//! Plans every entry (target template, codec) before touching the target,
//! stages entries through a bounded pool of blocking workers, and submits
//! the results to a single [`Transaction`] strictly in descriptor order.
//! Any failure, including cancellation, rolls the target back before the
//! error is returned.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, UNIX_EPOCH};

use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use inpack_schema::receipt::{InstallReceipt, RECEIPT_PATH, ReceiptFile};
use inpack_schema::{Blake3Hash, BuildId, ContainerPath, FileEntry};

use crate::archive::{ArchiveError, ArchiveReader};
use crate::codec::{CodecError, CodecRegistry};
use crate::config::DeployConfig;
use crate::reporter::{EntryOutcome, NullSink, ProgressSink};
use crate::template::{self, ResolvedTarget, TemplateError};
use crate::transaction::{
    Disposition, LocalEnvironment, OpHints, Operation, SubmitError, TargetEnvironment,
    Transaction, TransactionError,
};
use crate::unpack::{
    FixedPolicy, LooseSource, MissingSourcePrompt, Staged, StagedFile, UnpackError, Unpackers,
    Warning, verify_and_set_mode,
};

/// Deploy failures. Every variant is returned only after the target has
/// been rolled back (or the rollback failure is what is being reported).
#[derive(Error, Debug)]
pub enum DeployError {
    /// Archive or descriptor unreadable, or not a matched pair.
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// An entry's target template cannot be expanded.
    #[error("entry {entry_id}: {source}")]
    Template {
        /// Offending entry.
        entry_id: u32,
        /// Expansion failure.
        #[source]
        source: TemplateError,
    },

    /// Two entries resolve to the same target.
    #[error("entries {first} and {second} both target {target}")]
    TargetConflict {
        /// Shared target, relative to the root.
        target: String,
        /// Earlier entry.
        first: u32,
        /// Later entry.
        second: u32,
    },

    /// An entry names a codec this build does not know.
    #[error("entry {entry_id}: {source}")]
    Codec {
        /// Offending entry.
        entry_id: u32,
        /// Lookup failure.
        #[source]
        source: CodecError,
    },

    /// Unpacking or verifying an entry failed.
    #[error("{container_path}: {source}")]
    Unpack {
        /// Offending entry.
        entry_id: u32,
        /// Its container path.
        container_path: ContainerPath,
        /// Cause.
        #[source]
        source: UnpackError,
    },

    /// A target could not be changed and deferral is disabled.
    #[error("target {path} is unavailable: {source}")]
    TargetUnavailable {
        /// Target path.
        path: PathBuf,
        /// Cause.
        #[source]
        source: io::Error,
    },

    /// Commit or rollback failure.
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    /// The deploy was cancelled between entries.
    #[error("deploy cancelled")]
    Cancelled,

    /// A worker task panicked.
    #[error("worker task failed: {0}")]
    Worker(String),

    /// Filesystem failure outside any single entry.
    #[error("{context} {path}: {source}")]
    Io {
        /// What was being done.
        context: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Cause.
        #[source]
        source: io::Error,
    },

    /// The install receipt is unreadable.
    #[error("invalid install receipt {path}: {source}")]
    Receipt {
        /// Receipt path.
        path: PathBuf,
        /// Parse failure.
        #[source]
        source: serde_json::Error,
    },

    /// The target root has no install receipt.
    #[error("no inpack installation found in {0}")]
    NoReceipt(PathBuf),
}

impl DeployError {
    /// Process exit code for this failure class.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Archive(e) => e.exit_code(),
            Self::Template { .. }
            | Self::TargetConflict { .. }
            | Self::Receipt { .. }
            | Self::NoReceipt(_) => 60,
            Self::Codec { .. } => 30,
            Self::Unpack { source, .. } => source.exit_code(),
            Self::TargetUnavailable { .. } | Self::Io { .. } => 32,
            Self::Transaction(e) => e.exit_code(),
            Self::Cancelled => 50,
            Self::Worker(_) => 70,
        }
    }

    fn entry(entry: &FileEntry) -> impl FnOnce(UnpackError) -> Self + '_ {
        move |source| Self::Unpack {
            entry_id: entry.id,
            container_path: entry.container_path.clone(),
            source,
        }
    }
}

/// Inputs of one deploy.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    /// Archive file.
    pub archive: PathBuf,
    /// Matching pack descriptor.
    pub descriptor: PathBuf,
    /// Directory the package is installed into.
    pub target_root: PathBuf,
}

/// An entry that was not written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    /// Target relative to the root.
    pub path: String,
    /// Why it was skipped.
    pub reason: String,
}

/// What a committed deploy did. Paths are relative to the target root.
#[derive(Debug, Clone)]
pub struct DeployReport {
    /// Build that was deployed.
    pub build_id: BuildId,
    /// Written while unpacking.
    pub written: Vec<String>,
    /// Written during commit.
    pub deferred: Vec<String>,
    /// Left alone.
    pub skipped: Vec<SkippedEntry>,
    /// Files from the previous deploy that this build no longer ships.
    pub removed: Vec<String>,
    /// Non-fatal problems.
    pub warnings: Vec<Warning>,
}

impl DeployReport {
    fn new(build_id: BuildId) -> Self {
        Self {
            build_id,
            written: Vec::new(),
            deferred: Vec::new(),
            skipped: Vec::new(),
            removed: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Number of files now in place from this build.
    pub fn installed(&self) -> usize {
        self.written.len() + self.deferred.len()
    }
}

#[derive(Debug, Clone)]
struct PlannedEntry {
    entry: FileEntry,
    target: ResolvedTarget,
}

#[derive(Debug)]
enum Prepared {
    Staged(StagedFile),
    Skipped(Warning),
    /// The existing target is at least as new as the entry.
    KeptNewer(Blake3Hash),
}

/// Deploys matched archive/descriptor pairs.
pub struct Deployer {
    config: DeployConfig,
    registry: CodecRegistry,
    env: Arc<dyn TargetEnvironment>,
    prompt: Arc<dyn MissingSourcePrompt>,
    sink: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
}

impl fmt::Debug for Deployer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deployer")
            .field("config", &self.config)
            .field("env", &self.env)
            .field("prompt", &self.prompt)
            .finish_non_exhaustive()
    }
}

impl Deployer {
    /// Deployer for the local filesystem with a silent sink.
    pub fn new(config: DeployConfig) -> Self {
        let prompt = Arc::new(FixedPolicy(config.missing_loose_policy));
        Self {
            config,
            registry: CodecRegistry::builtin(),
            env: Arc::new(LocalEnvironment::default()),
            prompt,
            sink: Arc::new(NullSink),
            cancel: CancellationToken::new(),
        }
    }

    /// Use a different codec registry.
    pub fn with_registry(mut self, registry: CodecRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Use a different target environment.
    pub fn with_environment(mut self, env: Arc<dyn TargetEnvironment>) -> Self {
        self.env = env;
        self
    }

    /// Ask `prompt` about missing loose sources.
    pub fn with_prompt(mut self, prompt: Arc<dyn MissingSourcePrompt>) -> Self {
        self.prompt = prompt;
        self
    }

    /// Report progress to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Abort (and roll back) at the next entry boundary once `token` fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Deploy `request.archive` into `request.target_root`.
    ///
    /// # Errors
    ///
    /// Returns a [`DeployError`]. Planning errors are reported before the
    /// target is touched; everything later is reported after rollback.
    pub async fn deploy(&self, request: DeployRequest) -> Result<DeployReport, DeployError> {
        let started = Instant::now();
        let DeployRequest {
            archive,
            descriptor,
            target_root,
        } = request;

        let root = std::path::absolute(&target_root).map_err(|source| DeployError::Io {
            context: "cannot resolve target root",
            path: target_root.clone(),
            source,
        })?;
        let loose_root = self.config.loose_source.clone().unwrap_or_else(|| {
            archive
                .parent()
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
        });

        let (reader, descriptor) = tokio::task::spawn_blocking(move || {
            ArchiveReader::open_pair(&archive, &descriptor)
        })
        .await
        .map_err(|e| DeployError::Worker(e.to_string()))??;
        let reader = Arc::new(reader);

        let unpackers = Arc::new(Unpackers::new(
            self.registry.clone(),
            LooseSource::new(loose_root, Arc::clone(&self.prompt)),
        ));
        let plan = self.plan(&descriptor.entries, &root, &unpackers)?;
        let previous = self.previous_receipt(&root);

        tracing::info!(
            root = %root.display(),
            build_id = %descriptor.build_id,
            entries = plan.len(),
            workers = self.config.workers,
            "deploying"
        );

        let mut txn = Transaction::new(&root, Arc::clone(&self.env))?
            .with_timeouts(self.config.commit_timeout, self.config.lock_poll_interval);
        let mut report = DeployReport::new(descriptor.build_id.clone());

        let receipt = match self
            .apply_entries(&mut txn, &plan, &reader, &unpackers, &mut report)
            .await
        {
            Ok(files) => files,
            Err(e) => return Err(abort(&mut txn, e)),
        };
        if let Err(e) = self.finish_receipt(
            &mut txn,
            &root,
            &plan,
            previous.as_ref(),
            receipt,
            &mut report,
        ) {
            return Err(abort(&mut txn, e));
        }
        if self.cancel.is_cancelled() {
            return Err(abort(&mut txn, DeployError::Cancelled));
        }

        self.sink.section("Committing");
        // A panicking commit drops the transaction mid-commit, which
        // reverses whatever it had applied.
        let (_txn, committed) = tokio::task::spawn_blocking(move || {
            let result = txn.commit();
            (txn, result)
        })
        .await
        .map_err(|e| DeployError::Worker(format!("commit aborted: {e}")))?;
        let summary = committed?;

        for removed in &report.removed {
            if let Some(path) = receipt_target(&root, removed) {
                prune_empty_parents(&root, &path);
            }
        }

        tracing::info!(
            written = report.written.len(),
            deferred = report.deferred.len(),
            skipped = report.skipped.len(),
            removed = report.removed.len(),
            immediate_ops = summary.immediate,
            deferred_ops = summary.deferred,
            "deploy committed"
        );
        self.sink.summary(
            report.installed(),
            "deployed",
            started.elapsed().as_secs_f64(),
        );
        Ok(report)
    }

    /// Resolve every target and codec up front so a bad entry fails the
    /// deploy before anything is written.
    fn plan(
        &self,
        entries: &[FileEntry],
        root: &Path,
        unpackers: &Unpackers,
    ) -> Result<Vec<PlannedEntry>, DeployError> {
        let vars = &self.config.variables;
        let mut claimed: HashMap<String, u32> = HashMap::with_capacity(entries.len());
        let mut plan = Vec::with_capacity(entries.len());
        for entry in entries {
            let target = template::resolve_target(&entry.target, root, vars).map_err(
                |source| DeployError::Template {
                    entry_id: entry.id,
                    source,
                },
            )?;
            if let Some(&first) = claimed.get(&target.relative) {
                return Err(DeployError::TargetConflict {
                    target: target.relative,
                    first,
                    second: entry.id,
                });
            }
            match unpackers.for_entry(entry) {
                Ok(_) => {}
                Err(UnpackError::Codec(source)) => {
                    return Err(DeployError::Codec {
                        entry_id: entry.id,
                        source,
                    });
                }
                Err(e) => return Err(DeployError::entry(entry)(e)),
            }
            claimed.insert(target.relative.clone(), entry.id);
            plan.push(PlannedEntry {
                entry: entry.clone(),
                target,
            });
        }
        Ok(plan)
    }

    fn previous_receipt(&self, root: &Path) -> Option<InstallReceipt> {
        match read_receipt(root) {
            Ok(receipt) => receipt,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring unreadable install receipt");
                self.sink
                    .warning(&format!("{e}; stale files will not be removed"));
                None
            }
        }
    }

    /// Stage entries in parallel and submit them in descriptor order.
    /// Returns the receipt records of everything now in place.
    async fn apply_entries(
        &self,
        txn: &mut Transaction,
        plan: &[PlannedEntry],
        archive: &Arc<ArchiveReader>,
        unpackers: &Arc<Unpackers>,
        report: &mut DeployReport,
    ) -> Result<Vec<ReceiptFile>, DeployError> {
        let staging = Arc::new(txn.staging_dir()?);
        let stop = self.cancel.child_token();
        let total = plan.len();

        let results = stream::iter(plan.iter().cloned())
            .map(|planned| {
                let archive = Arc::clone(archive);
                let unpackers = Arc::clone(unpackers);
                let staging = Arc::clone(&staging);
                let stop = stop.clone();
                async move {
                    if stop.is_cancelled() {
                        return None;
                    }
                    Some(
                        tokio::task::spawn_blocking(move || {
                            prepare(&planned, &archive, &unpackers, &staging)
                        })
                        .await,
                    )
                }
            })
            .buffered(self.config.workers.max(1));
        let mut results = std::pin::pin!(results);

        self.sink.section("Unpacking");
        let mut files = Vec::with_capacity(total);
        let mut index = 0;
        let mut failure = None;
        while let Some(result) = results.next().await {
            let planned = &plan[index];
            index += 1;

            if self.cancel.is_cancelled() {
                failure = Some(DeployError::Cancelled);
                break;
            }
            let prepared = match result {
                None => {
                    failure = Some(DeployError::Cancelled);
                    break;
                }
                Some(Err(join)) => {
                    failure = Some(DeployError::Worker(join.to_string()));
                    break;
                }
                Some(Ok(prepared)) => prepared,
            };

            self.sink.entry_started(&planned.entry, index - 1, total);
            match self.submit_entry(txn, planned, prepared, report) {
                Ok(Some(file)) => files.push(file),
                Ok(None) => {}
                Err(e) => {
                    self.sink.entry_failed(&planned.entry, &e.to_string());
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(error) = failure {
            // Let in-flight workers finish so nothing writes into the
            // staging area while it is being removed.
            stop.cancel();
            while results.next().await.is_some() {}
            return Err(error);
        }
        Ok(files)
    }

    fn submit_entry(
        &self,
        txn: &mut Transaction,
        planned: &PlannedEntry,
        prepared: Result<Prepared, UnpackError>,
        report: &mut DeployReport,
    ) -> Result<Option<ReceiptFile>, DeployError> {
        let PlannedEntry { entry, target } = planned;
        let fail = DeployError::entry;

        let staged = match prepared.map_err(fail(entry))? {
            Prepared::Staged(staged) => staged,
            Prepared::Skipped(warning) => {
                self.sink
                    .entry_done(entry, &EntryOutcome::Skipped(warning.message.clone()));
                report.skipped.push(SkippedEntry {
                    path: target.relative.clone(),
                    reason: warning.message.clone(),
                });
                report.warnings.push(warning);
                return Ok(None);
            }
            Prepared::KeptNewer(checksum) => {
                let reason = "existing target is newer".to_string();
                tracing::debug!(target = %target.relative, "kept newer target");
                self.sink
                    .entry_done(entry, &EntryOutcome::Skipped(reason.clone()));
                report.skipped.push(SkippedEntry {
                    path: target.relative.clone(),
                    reason,
                });
                return Ok(Some(ReceiptFile {
                    path: target.relative.clone(),
                    checksum,
                }));
            }
        };

        let hints = OpHints {
            requires_elevation: entry.flags.requires_elevation,
        };
        // Deferred writes land during commit; check their bytes now while
        // the deploy can still fail cleanly.
        if txn.disposition_for(&target.path, hints) == Disposition::Deferred {
            verify_and_set_mode(&staged.path, entry).map_err(fail(entry))?;
        }

        let operation = Operation::Write {
            target: target.path.clone(),
            staged: staged.path,
            hints,
        };
        let disposition = self.submit(txn, operation, |op| match op {
            Operation::Write { staged, .. } => {
                verify_and_set_mode(staged, entry).map_err(fail(entry))
            }
            Operation::Delete { .. } => Ok(()),
        })?;

        match disposition {
            Disposition::Applied => {
                verify_and_set_mode(&target.path, entry).map_err(fail(entry))?;
                self.sink.entry_done(entry, &EntryOutcome::Written);
                report.written.push(target.relative.clone());
            }
            Disposition::Deferred => {
                self.sink.entry_done(entry, &EntryOutcome::Deferred);
                report.deferred.push(target.relative.clone());
            }
        }
        Ok(Some(ReceiptFile {
            path: target.relative.clone(),
            checksum: entry.checksum.clone(),
        }))
    }

    /// Submit `operation`, deferring it to commit when its target is
    /// unavailable and deferral is enabled. `before_defer` runs first.
    fn submit(
        &self,
        txn: &mut Transaction,
        operation: Operation,
        before_defer: impl FnOnce(&Operation) -> Result<(), DeployError>,
    ) -> Result<Disposition, DeployError> {
        match txn.submit(operation) {
            Ok(disposition) => Ok(disposition),
            Err(SubmitError::Transaction(e)) => Err(e.into()),
            Err(SubmitError::Unavailable { pending, source }) => {
                let path = pending.operation().target().to_path_buf();
                if !self.config.retry_unavailable {
                    return Err(DeployError::TargetUnavailable { path, source });
                }
                before_defer(pending.operation())?;
                tracing::warn!(target = %path.display(), error = %source, "target unavailable, retrying at commit");
                self.sink.warning(&format!(
                    "{} is unavailable ({source}); retrying at commit",
                    path.display()
                ));
                Ok(txn.defer(pending))
            }
        }
    }

    /// Remove files the previous deploy installed that this build does not
    /// ship, then record the new receipt. Both go through `txn`.
    fn finish_receipt(
        &self,
        txn: &mut Transaction,
        root: &Path,
        plan: &[PlannedEntry],
        previous: Option<&InstallReceipt>,
        mut files: Vec<ReceiptFile>,
        report: &mut DeployReport,
    ) -> Result<(), DeployError> {
        let shipped: BTreeSet<&str> = plan.iter().map(|p| p.target.relative.as_str()).collect();

        if let Some(previous) = previous {
            let mut carried: BTreeMap<&str, &ReceiptFile> = BTreeMap::new();
            for old in &previous.files {
                if shipped.contains(old.path.as_str()) {
                    carried.insert(old.path.as_str(), old);
                    continue;
                }
                let Some(path) = receipt_target(root, &old.path) else {
                    tracing::warn!(path = %old.path, "ignoring invalid receipt path");
                    continue;
                };
                self.submit(txn, Operation::Delete { target: path }, |_| Ok(()))?;
                tracing::debug!(path = %old.path, "removing stale file");
                report.removed.push(old.path.clone());
            }

            // Shipped but skipped (missing loose source): the old file stays,
            // so keep tracking it.
            let recorded: BTreeSet<String> = files.iter().map(|f| f.path.clone()).collect();
            files.extend(
                carried
                    .into_iter()
                    .filter(|(path, _)| !recorded.contains(*path))
                    .map(|(_, file)| file.clone()),
            );
        }

        let receipt = InstallReceipt {
            build_id: report.build_id.clone(),
            files,
        };
        let json = receipt.to_json().map_err(|source| DeployError::Receipt {
            path: root.join(RECEIPT_PATH),
            source,
        })?;
        let staging = txn.staging_dir()?;
        let io_err = |source| DeployError::Io {
            context: "cannot stage install receipt in",
            path: staging.clone(),
            source,
        };
        let mut tmp = tempfile::NamedTempFile::new_in(&staging).map_err(io_err)?;
        tmp.write_all(json.as_bytes()).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;

        self.submit(
            txn,
            Operation::Write {
                target: root.join(RECEIPT_PATH),
                staged: tmp.into_temp_path(),
                hints: OpHints::default(),
            },
            |_| Ok(()),
        )?;
        Ok(())
    }
}

/// Roll back after `error`. A failed rollback replaces the original error.
pub(crate) fn abort(txn: &mut Transaction, error: DeployError) -> DeployError {
    tracing::warn!(%error, "deploy failed, rolling back");
    match txn.rollback(&error.to_string()) {
        Ok(()) => error,
        Err(rollback) => {
            tracing::error!(error = %rollback, "rollback failed");
            DeployError::Transaction(rollback)
        }
    }
}

/// Worker body: produce a staged file for one entry.
fn prepare(
    planned: &PlannedEntry,
    archive: &ArchiveReader,
    unpackers: &Unpackers,
    staging: &Path,
) -> Result<Prepared, UnpackError> {
    let PlannedEntry { entry, target } = planned;
    if entry.flags.overwrite_if_newer && target_is_newer(&target.path, entry.mtime) {
        let (checksum, _) = Blake3Hash::compute_file(&target.path).map_err(|source| {
            UnpackError::TargetUnavailable {
                path: target.path.clone(),
                source,
            }
        })?;
        return Ok(Prepared::KeptNewer(checksum));
    }

    match unpackers.for_entry(entry)?.stage(entry, archive, staging)? {
        Staged::File(file) => Ok(Prepared::Staged(file)),
        Staged::Skipped(warning) => Ok(Prepared::Skipped(warning)),
    }
}

fn target_is_newer(target: &Path, entry_mtime: Option<u64>) -> bool {
    let Some(entry_mtime) = entry_mtime else {
        return false;
    };
    fs::symlink_metadata(target)
        .ok()
        .filter(fs::Metadata::is_file)
        .and_then(|meta| meta.modified().ok())
        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
        .is_some_and(|since| since.as_secs() >= entry_mtime)
}

/// Absolute path of a receipt entry, or `None` if it is not a plain
/// relative path under `root`.
pub(crate) fn receipt_target(root: &Path, relative: &str) -> Option<PathBuf> {
    let path = ContainerPath::parse(relative).ok()?;
    if path
        .segments()
        .next()
        .is_some_and(|first| first.starts_with(template::RESERVED_PREFIX))
    {
        return None;
    }
    Some(path.segments().fold(root.to_path_buf(), |p, seg| p.join(seg)))
}

/// Remove the directories above `path` that are now empty, stopping at
/// `root`.
pub(crate) fn prune_empty_parents(root: &Path, path: &Path) {
    let mut dir = path.parent();
    while let Some(d) = dir {
        if d == root || !d.starts_with(root) || fs::remove_dir(d).is_err() {
            break;
        }
        dir = d.parent();
    }
}

/// Read the install receipt under `root`, if there is one.
pub(crate) fn read_receipt(root: &Path) -> Result<Option<InstallReceipt>, DeployError> {
    let path = root.join(RECEIPT_PATH);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(DeployError::Io {
                context: "cannot read install receipt",
                path,
                source,
            });
        }
    };
    InstallReceipt::from_json(&text)
        .map(Some)
        .map_err(|source| DeployError::Receipt { path, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ArchiveBuilder;
    use crate::catalog::{Artifact, Catalog, Component};
    use crate::resolver::resolve;
    use inpack_schema::{CodecId, PackDescriptor};
    use std::sync::Mutex;
    use std::time::{Duration, SystemTime};
    use tempfile::tempdir;
    use walkdir::WalkDir;

    struct Pack {
        archive: PathBuf,
        descriptor: PathBuf,
    }

    fn path(s: &str) -> ContainerPath {
        ContainerPath::parse(s).unwrap()
    }

    fn pack(dir: &Path, name: &str, artifacts: Vec<Artifact>) -> Pack {
        let component = artifacts
            .into_iter()
            .fold(Component::new("app"), Component::artifact);
        let resolved = resolve(&Catalog::new(vec![component]), &["app".into()]).unwrap();
        let archive = dir.join(format!("{name}.inpk"));
        let descriptor = dir.join(format!("{name}.json"));
        ArchiveBuilder::new(CodecRegistry::builtin(), CodecId::default())
            .build(&resolved, &archive, &descriptor, &NullSink)
            .unwrap();
        Pack {
            archive,
            descriptor,
        }
    }

    fn three_files(dir: &Path) -> Pack {
        let mut gz = Artifact::bytes(path("b.txt"), b"bravo".repeat(50));
        gz.codec = Some(CodecId::new("gzip"));
        let mut raw = Artifact::bytes(path("sub/c.txt"), b"charlie".to_vec());
        raw.codec = Some(CodecId::raw());
        pack(
            dir,
            "three",
            vec![
                Artifact::bytes(path("a.txt"), b"alpha".repeat(50)),
                gz,
                raw,
            ],
        )
    }

    fn edit_descriptor(pack: &Pack, edit: impl FnOnce(&mut PackDescriptor)) {
        let mut descriptor = PackDescriptor::load(&pack.descriptor).unwrap();
        edit(&mut descriptor);
        fs::write(&pack.descriptor, descriptor.to_json().unwrap()).unwrap();
    }

    fn request(pack: &Pack, root: &Path) -> DeployRequest {
        DeployRequest {
            archive: pack.archive.clone(),
            descriptor: pack.descriptor.clone(),
            target_root: root.to_path_buf(),
        }
    }

    fn config() -> DeployConfig {
        DeployConfig {
            workers: 2,
            ..DeployConfig::default()
        }
    }

    fn snapshot(root: &Path) -> BTreeMap<PathBuf, Option<Vec<u8>>> {
        WalkDir::new(root)
            .min_depth(1)
            .into_iter()
            .map(|e| {
                let e = e.unwrap();
                let rel = e.path().strip_prefix(root).unwrap().to_path_buf();
                let content = e.file_type().is_file().then(|| fs::read(e.path()).unwrap());
                (rel, content)
            })
            .collect()
    }

    /// Records started entry ids; optionally cancels after the first entry.
    #[derive(Default)]
    struct Recorder {
        started: Mutex<Vec<u32>>,
        cancel_after_first: Option<CancellationToken>,
    }

    impl ProgressSink for Recorder {
        fn section(&self, _: &str) {}
        fn entry_started(&self, entry: &FileEntry, _: usize, _: usize) {
            self.started.lock().unwrap().push(entry.id);
        }
        fn entry_done(&self, _: &FileEntry, _: &EntryOutcome) {
            if let Some(token) = &self.cancel_after_first {
                token.cancel();
            }
        }
        fn entry_failed(&self, _: &FileEntry, _: &str) {}
        fn info(&self, _: &str) {}
        fn warning(&self, _: &str) {}
        fn summary(&self, _: usize, _: &str, _: f64) {}
    }

    #[tokio::test]
    async fn deploys_every_entry_and_writes_receipt() {
        let dir = tempdir().unwrap();
        let pack = three_files(dir.path());
        let root = dir.path().join("install");

        let report = Deployer::new(config())
            .deploy(request(&pack, &root))
            .await
            .unwrap();

        assert_eq!(report.written, ["a.txt", "b.txt", "sub/c.txt"]);
        assert!(report.deferred.is_empty());
        assert_eq!(fs::read(root.join("b.txt")).unwrap(), b"bravo".repeat(50));
        assert_eq!(fs::read(root.join("sub/c.txt")).unwrap(), b"charlie");

        let receipt = read_receipt(&root).unwrap().unwrap();
        assert_eq!(receipt.build_id, report.build_id);
        assert!(receipt.contains("sub/c.txt"));
        assert_eq!(receipt.files.len(), 3);

        let leftovers = fs::read_dir(&root)
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with(".inpack-txn-")
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn checksum_failure_after_write_restores_the_target() {
        let dir = tempdir().unwrap();
        let pack = three_files(dir.path());
        edit_descriptor(&pack, |d| {
            d.entries[1].checksum = Blake3Hash::compute(b"something else");
        });
        let root = dir.path().join("install");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("a.txt"), b"original").unwrap();
        let before = snapshot(&root);

        let recorder = Arc::new(Recorder::default());
        let err = Deployer::new(config())
            .with_sink(recorder.clone())
            .deploy(request(&pack, &root))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DeployError::Unpack {
                entry_id: 1,
                source: UnpackError::ChecksumMismatch { .. },
                ..
            }
        ));
        assert_eq!(err.exit_code(), 31);
        assert_eq!(snapshot(&root), before);
        assert_eq!(fs::read(root.join("a.txt")).unwrap(), b"original");
        assert_eq!(*recorder.started.lock().unwrap(), [0, 1]);
    }

    #[tokio::test]
    async fn cancellation_between_entries_rolls_back() {
        let dir = tempdir().unwrap();
        let pack = three_files(dir.path());
        let root = dir.path().join("install");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("a.txt"), b"original").unwrap();
        let before = snapshot(&root);

        let token = CancellationToken::new();
        let recorder = Arc::new(Recorder {
            cancel_after_first: Some(token.clone()),
            ..Recorder::default()
        });
        let err = Deployer::new(config())
            .with_sink(recorder.clone())
            .with_cancellation(token)
            .deploy(request(&pack, &root))
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::Cancelled));
        assert_eq!(err.exit_code(), 50);
        assert_eq!(snapshot(&root), before);
        assert_eq!(*recorder.started.lock().unwrap(), [0]);
    }

    #[tokio::test]
    async fn redeploy_removes_files_the_new_build_dropped() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("install");
        let first = pack(
            dir.path(),
            "v1",
            vec![
                Artifact::bytes(path("keep.txt"), b"v1".to_vec()),
                Artifact::bytes(path("old/deep/gone.txt"), b"bye".to_vec()),
                Artifact::bytes(path("shared/stays.txt"), b"v1".to_vec()),
                Artifact::bytes(path("shared/gone.txt"), b"bye".to_vec()),
            ],
        );
        let second = pack(
            dir.path(),
            "v2",
            vec![
                Artifact::bytes(path("keep.txt"), b"v2".to_vec()),
                Artifact::bytes(path("shared/stays.txt"), b"v2".to_vec()),
            ],
        );

        let deployer = Deployer::new(config());
        deployer.deploy(request(&first, &root)).await.unwrap();
        assert!(root.join("old/deep/gone.txt").exists());

        let report = deployer.deploy(request(&second, &root)).await.unwrap();
        assert_eq!(report.removed, ["old/deep/gone.txt", "shared/gone.txt"]);
        assert_eq!(fs::read(root.join("keep.txt")).unwrap(), b"v2");
        // Emptied directories go; ones still holding files stay.
        assert!(!root.join("old").exists());
        assert!(!root.join("shared/gone.txt").exists());
        assert_eq!(fs::read(root.join("shared/stays.txt")).unwrap(), b"v2");

        let receipt = read_receipt(&root).unwrap().unwrap();
        assert_eq!(receipt.files.len(), 2);
        assert_eq!(receipt.build_id, report.build_id);
    }

    #[tokio::test]
    async fn entries_needing_elevation_land_at_commit() {
        let dir = tempdir().unwrap();
        let mut driver = Artifact::bytes(path("drivers/x.sys"), b"driver".to_vec());
        driver.flags.requires_elevation = true;
        let pack = pack(
            dir.path(),
            "elevated",
            vec![Artifact::bytes(path("app.bin"), b"app".to_vec()), driver],
        );
        let root = dir.path().join("install");

        let report = Deployer::new(config())
            .deploy(request(&pack, &root))
            .await
            .unwrap();
        assert_eq!(report.written, ["app.bin"]);
        assert_eq!(report.deferred, ["drivers/x.sys"]);
        assert_eq!(fs::read(root.join("drivers/x.sys")).unwrap(), b"driver");
    }

    #[tokio::test]
    async fn newer_target_is_kept() {
        let dir = tempdir().unwrap();
        let pack = pack(
            dir.path(),
            "newer",
            vec![Artifact::bytes(path("settings.ini"), b"packaged".to_vec())],
        );
        edit_descriptor(&pack, |d| {
            d.entries[0].flags.overwrite_if_newer = true;
            d.entries[0].mtime = Some(1_000);
        });
        let root = dir.path().join("install");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("settings.ini"), b"edited by user").unwrap();

        let report = Deployer::new(config())
            .deploy(request(&pack, &root))
            .await
            .unwrap();
        assert!(report.written.is_empty());
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(
            fs::read(root.join("settings.ini")).unwrap(),
            b"edited by user"
        );
        assert!(read_receipt(&root).unwrap().unwrap().contains("settings.ini"));
    }

    #[tokio::test]
    async fn older_target_is_replaced() {
        let dir = tempdir().unwrap();
        let pack = pack(
            dir.path(),
            "older",
            vec![Artifact::bytes(path("settings.ini"), b"packaged".to_vec())],
        );
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        edit_descriptor(&pack, |d| {
            d.entries[0].flags.overwrite_if_newer = true;
            d.entries[0].mtime = Some(now);
        });
        let root = dir.path().join("install");
        fs::create_dir_all(&root).unwrap();
        let existing = root.join("settings.ini");
        fs::write(&existing, b"stale").unwrap();
        fs::File::options()
            .write(true)
            .open(&existing)
            .unwrap()
            .set_modified(UNIX_EPOCH + Duration::from_secs(1_000))
            .unwrap();

        let report = Deployer::new(config())
            .deploy(request(&pack, &root))
            .await
            .unwrap();
        assert_eq!(report.written, ["settings.ini"]);
        assert_eq!(fs::read(&existing).unwrap(), b"packaged");
    }

    #[tokio::test]
    async fn escaping_target_fails_before_touching_the_root() {
        let dir = tempdir().unwrap();
        let pack = three_files(dir.path());
        edit_descriptor(&pack, |d| d.entries[2].target = "../outside.txt".into());
        let root = dir.path().join("install");

        let err = Deployer::new(config())
            .deploy(request(&pack, &root))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DeployError::Template {
                entry_id: 2,
                source: TemplateError::Escape { .. }
            }
        ));
        assert_eq!(err.exit_code(), 60);
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn template_variables_place_entries() {
        let dir = tempdir().unwrap();
        let pack = three_files(dir.path());
        edit_descriptor(&pack, |d| d.entries[0].target = "${INSTALL_PATH}/$BIN/a.txt".into());
        let root = dir.path().join("install");

        let mut config = config();
        config.variables.insert("BIN".into(), "bin".into());
        let report = Deployer::new(config)
            .deploy(request(&pack, &root))
            .await
            .unwrap();
        assert_eq!(report.written[0], "bin/a.txt");
        assert!(root.join("bin/a.txt").is_file());
    }

    #[tokio::test]
    async fn skipped_loose_entry_is_reported() {
        let dir = tempdir().unwrap();
        let mut loose = Artifact::bytes(path("media/intro.mp4"), b"video".to_vec());
        loose.flags.loose = true;
        let pack = pack(
            dir.path(),
            "loose",
            vec![Artifact::bytes(path("app.bin"), b"app".to_vec()), loose],
        );
        let root = dir.path().join("install");

        let mut config = config();
        config.loose_source = Some(dir.path().join("no-such-tree"));
        config.missing_loose_policy = crate::unpack::MissingSourcePolicy::Skip;
        let report = Deployer::new(config)
            .deploy(request(&pack, &root))
            .await
            .unwrap();
        assert_eq!(report.written, ["app.bin"]);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.skipped[0].path, "media/intro.mp4");
        assert!(!root.join("media").exists());
    }

    #[tokio::test]
    async fn mismatched_descriptor_is_rejected() {
        let dir = tempdir().unwrap();
        let first = three_files(dir.path());
        let other = pack(
            dir.path(),
            "other",
            vec![Artifact::bytes(path("x"), b"x".to_vec())],
        );
        let root = dir.path().join("install");

        let err = Deployer::new(config())
            .deploy(DeployRequest {
                archive: first.archive,
                descriptor: other.descriptor,
                target_root: root.clone(),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DeployError::Archive(ArchiveError::BuildMismatch { .. })
        ));
        assert_eq!(err.exit_code(), 60);
        assert!(!root.exists());
    }
}
