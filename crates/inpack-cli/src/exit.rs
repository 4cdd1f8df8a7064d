//! Mapping from errors to process exit codes.
//!
//! | code | meaning |
//! |------|---------|
//! | 1    | anything outside the taxonomy |
//! | 2    | usage error (clap) |
//! | 10-12 | resolution: ambiguous, missing, cyclic |
//! | 20-21 | build: duplicate path, I/O or catalog |
//! | 30-33 | unpack: codec, checksum, target unavailable, loose source missing |
//! | 40-41 | transaction: commit failed, rollback failed |
//! | 50   | cancelled |
//! | 60   | archive/descriptor unreadable or mismatched |
//! | 70   | worker panic |

use thiserror::Error;

use inpack_core::{
    ArchiveError, BuildError, CatalogError, CodecError, DeployError, ResolutionError,
    TransactionError, UnpackError,
};

/// Generic failure.
pub const FAILURE: u8 = 1;

/// A failure that already has its exit code and message, such as a verify
/// run that found mismatches.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct Failure {
    pub code: u8,
    pub message: String,
}

/// Exit code for `err`: the first error in its chain that belongs to the
/// taxonomy decides.
pub fn code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<Failure>() {
            return e.code;
        }
        if let Some(e) = cause.downcast_ref::<DeployError>() {
            return e.exit_code();
        }
        if let Some(e) = cause.downcast_ref::<TransactionError>() {
            return e.exit_code();
        }
        if let Some(e) = cause.downcast_ref::<UnpackError>() {
            return e.exit_code();
        }
        if let Some(e) = cause.downcast_ref::<ArchiveError>() {
            return e.exit_code();
        }
        if let Some(e) = cause.downcast_ref::<ResolutionError>() {
            return e.exit_code();
        }
        if let Some(e) = cause.downcast_ref::<BuildError>() {
            return e.exit_code();
        }
        if cause.is::<CatalogError>() || cause.is::<CodecError>() {
            return 21;
        }
    }
    FAILURE
}

/// Whether `err` means the target was left in an unknown state.
pub fn is_fatal(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<TransactionError>()
            .is_some_and(TransactionError::is_fatal)
    })
}
