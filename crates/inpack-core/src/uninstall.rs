//! Remove a deployed package using its install receipt.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use inpack_schema::BuildId;
use inpack_schema::receipt::RECEIPT_PATH;

use crate::deploy::{DeployError, abort, prune_empty_parents, read_receipt, receipt_target};
use crate::reporter::ProgressSink;
use crate::transaction::{Operation, SubmitError, TargetEnvironment, Transaction};

/// What [`uninstall`] removed.
#[derive(Debug, Clone)]
pub struct UninstallReport {
    /// Build that had been installed.
    pub build_id: BuildId,
    /// Files deleted, relative to the root.
    pub removed: Vec<String>,
    /// Receipt entries that were already gone.
    pub missing: Vec<String>,
}

/// Delete every file recorded in the receipt under `root`, and the receipt
/// itself, in one transaction. Directories left empty afterwards are pruned.
///
/// # Errors
///
/// Returns [`DeployError::NoReceipt`] if nothing was deployed to `root`,
/// or a transaction error after rolling back.
pub fn uninstall(
    root: &Path,
    env: Arc<dyn TargetEnvironment>,
    sink: &dyn ProgressSink,
) -> Result<UninstallReport, DeployError> {
    let started = Instant::now();
    let root = std::path::absolute(root).map_err(|source| DeployError::Io {
        context: "cannot resolve target root",
        path: root.to_path_buf(),
        source,
    })?;
    let receipt = read_receipt(&root)?.ok_or_else(|| DeployError::NoReceipt(root.clone()))?;

    sink.section("Uninstalling");
    let mut report = UninstallReport {
        build_id: receipt.build_id.clone(),
        removed: Vec::new(),
        missing: Vec::new(),
    };
    let mut txn = Transaction::new(&root, env)?;
    let mut targets: Vec<PathBuf> = Vec::with_capacity(receipt.files.len() + 1);

    for file in &receipt.files {
        let Some(target) = receipt_target(&root, &file.path) else {
            tracing::warn!(path = %file.path, "ignoring invalid receipt path");
            continue;
        };
        if fs::symlink_metadata(&target).is_err() {
            report.missing.push(file.path.clone());
            continue;
        }
        if let Err(e) = delete(&mut txn, target.clone()) {
            return Err(abort(&mut txn, e));
        }
        report.removed.push(file.path.clone());
        targets.push(target);
    }

    let receipt_path = root.join(RECEIPT_PATH);
    if let Err(e) = delete(&mut txn, receipt_path.clone()) {
        return Err(abort(&mut txn, e));
    }
    targets.push(receipt_path);
    txn.commit()?;

    for target in &targets {
        prune_empty_parents(&root, target);
    }
    if !report.missing.is_empty() {
        sink.warning(&format!(
            "{} recorded file(s) were already missing",
            report.missing.len()
        ));
    }
    tracing::info!(root = %root.display(), removed = report.removed.len(), "uninstalled");
    sink.summary(
        report.removed.len(),
        "removed",
        started.elapsed().as_secs_f64(),
    );
    Ok(report)
}

fn delete(txn: &mut Transaction, target: PathBuf) -> Result<(), DeployError> {
    match txn.submit(Operation::Delete { target }) {
        Ok(_) => Ok(()),
        Err(SubmitError::Transaction(e)) => Err(e.into()),
        Err(SubmitError::Unavailable { pending, source }) => Err(DeployError::TargetUnavailable {
            path: pending.operation().target().to_path_buf(),
            source,
        }),
    }
}
