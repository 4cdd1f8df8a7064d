//! Verify command

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;

use inpack_core::unpack::{FixedPolicy, LooseSource, Unpackers};
use inpack_core::{
    ArchiveReader, BuildConfig, MissingSourcePolicy, ProgressSink, verify as verify_pack,
};

use crate::exit::Failure;
use crate::ui::ConsoleSink;

/// Decode every entry and compare checksums. Fails with the exit code of
/// the first mismatch after reporting all of them.
pub fn verify(
    archive: &Path,
    descriptor: &Path,
    loose_source: Option<PathBuf>,
    on_missing: MissingSourcePolicy,
    sink: &ConsoleSink,
) -> Result<()> {
    let (reader, descriptor) = ArchiveReader::open_pair(archive, descriptor)?;
    let loose_root = loose_source.unwrap_or_else(|| {
        archive
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
    });
    let unpackers = Unpackers::new(
        BuildConfig::from_env().registry(),
        LooseSource::new(loose_root, Arc::new(FixedPolicy(on_missing))),
    );

    let report = verify_pack(&reader, &descriptor, &unpackers, sink);
    for warning in &report.skipped {
        sink.warning(&warning.message);
    }
    if !report.is_ok() {
        for failure in &report.failures {
            eprintln!("{}: {}", failure.container_path, failure.error);
        }
        return Err(Failure {
            code: report.exit_code(),
            message: format!(
                "{} of {} entries failed verification",
                report.failures.len(),
                descriptor.entries.len()
            ),
        }
        .into());
    }

    sink.line(format_args!(
        "build {}: {} entries verified",
        report.build_id, report.checked
    ));
    Ok(())
}
