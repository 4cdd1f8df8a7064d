//! Checksum verification without writing anything.

use std::io;
use std::path::Path;
use std::time::Instant;

use inpack_schema::{BuildId, ContainerPath, PackDescriptor};

use crate::archive::ArchiveReader;
use crate::reporter::{EntryOutcome, ProgressSink};
use crate::unpack::{Extracted, UnpackError, Unpackers, Warning};

/// One entry that failed verification.
#[derive(Debug)]
pub struct VerifyFailure {
    /// Entry id.
    pub entry_id: u32,
    /// Entry path.
    pub container_path: ContainerPath,
    /// Cause.
    pub error: UnpackError,
}

/// Outcome of [`verify`].
#[derive(Debug)]
pub struct VerifyReport {
    /// Verified build.
    pub build_id: BuildId,
    /// Entries whose bytes matched.
    pub checked: usize,
    /// Loose entries skipped because their source is absent.
    pub skipped: Vec<Warning>,
    /// Every entry that did not verify, in descriptor order.
    pub failures: Vec<VerifyFailure>,
}

impl VerifyReport {
    /// Returns `true` when nothing failed.
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }

    /// Exit code of the first failure, or 0.
    pub fn exit_code(&self) -> u8 {
        self.failures.first().map_or(0, |f| f.error.exit_code())
    }
}

/// Decode every entry of a matched archive/descriptor pair and compare its
/// checksum, collecting all failures instead of stopping at the first.
pub fn verify(
    archive: &ArchiveReader,
    descriptor: &PackDescriptor,
    unpackers: &Unpackers,
    sink: &dyn ProgressSink,
) -> VerifyReport {
    let started = Instant::now();
    let total = descriptor.entries.len();
    let mut report = VerifyReport {
        build_id: descriptor.build_id.clone(),
        checked: 0,
        skipped: Vec::new(),
        failures: Vec::new(),
    };

    sink.section("Verifying");
    for (index, entry) in descriptor.entries.iter().enumerate() {
        sink.entry_started(entry, index, total);
        let label = Path::new(entry.container_path.as_str());

        let result = unpackers.for_entry(entry).and_then(|unpacker| {
            unpacker.extract(entry, archive, &mut io::sink(), label)
        });
        let result = result.and_then(|extracted| match extracted {
            Extracted::Complete { checksum, .. } if checksum != entry.checksum => {
                Err(UnpackError::ChecksumMismatch {
                    path: label.to_path_buf(),
                    expected: entry.checksum.clone(),
                    actual: checksum,
                })
            }
            other => Ok(other),
        });

        match result {
            Ok(Extracted::Complete { .. }) => {
                report.checked += 1;
                sink.entry_done(entry, &EntryOutcome::Verified);
            }
            Ok(Extracted::Skipped(warning)) => {
                sink.entry_done(entry, &EntryOutcome::Skipped(warning.message.clone()));
                report.skipped.push(warning);
            }
            Err(error) => {
                tracing::warn!(entry_id = entry.id, path = %entry.container_path, %error, "verification failed");
                sink.entry_failed(entry, &error.to_string());
                report.failures.push(VerifyFailure {
                    entry_id: entry.id,
                    container_path: entry.container_path.clone(),
                    error,
                });
            }
        }
    }

    sink.summary(report.checked, "verified", started.elapsed().as_secs_f64());
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ArchiveBuilder;
    use crate::catalog::{Artifact, Catalog, Component};
    use crate::codec::CodecRegistry;
    use crate::reporter::NullSink;
    use crate::resolver::resolve;
    use crate::unpack::{FixedPolicy, LooseSource, MissingSourcePolicy};
    use inpack_schema::CodecId;
    use std::fs;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn build(dir: &Path) -> (ArchiveReader, PackDescriptor) {
        let path = |s: &str| ContainerPath::parse(s).unwrap();
        let mut gz = Artifact::bytes(path("b.txt"), b"bravo".repeat(100));
        gz.codec = Some(CodecId::new("gzip"));
        let mut loose = Artifact::bytes(path("c.txt"), b"charlie".to_vec());
        loose.flags.loose = true;
        let catalog = Catalog::new(vec![
            Component::new("x")
                .artifact(Artifact::bytes(path("a.txt"), b"alpha".repeat(100)))
                .artifact(gz)
                .artifact(loose),
        ]);
        let resolved = resolve(&catalog, &["x".into()]).unwrap();
        let archive = dir.join("p.inpk");
        let descriptor = dir.join("p.json");
        ArchiveBuilder::new(CodecRegistry::builtin(), CodecId::default())
            .build(&resolved, &archive, &descriptor, &NullSink)
            .unwrap();
        ArchiveReader::open_pair(&archive, &descriptor).unwrap()
    }

    fn unpackers(root: &Path) -> Unpackers {
        Unpackers::new(
            CodecRegistry::builtin(),
            LooseSource::new(root, Arc::new(FixedPolicy(MissingSourcePolicy::Skip))),
        )
    }

    #[test]
    fn clean_archive_verifies() {
        let dir = tempdir().unwrap();
        let (archive, descriptor) = build(dir.path());
        fs::write(dir.path().join("c.txt"), b"charlie").unwrap();

        let report = verify(&archive, &descriptor, &unpackers(dir.path()), &NullSink);
        assert!(report.is_ok());
        assert_eq!(report.checked, 3);
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn missing_loose_source_is_skipped_not_failed() {
        let dir = tempdir().unwrap();
        let (archive, descriptor) = build(dir.path());

        let report = verify(&archive, &descriptor, &unpackers(dir.path()), &NullSink);
        assert!(report.is_ok());
        assert_eq!(report.checked, 2);
        assert_eq!(report.skipped.len(), 1);
    }

    #[test]
    fn reports_every_mismatch() {
        let dir = tempdir().unwrap();
        let (archive, mut descriptor) = build(dir.path());
        fs::write(dir.path().join("c.txt"), b"tampered").unwrap();
        descriptor.entries[0].checksum = inpack_schema::Blake3Hash::compute(b"wrong");

        let report = verify(&archive, &descriptor, &unpackers(dir.path()), &NullSink);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].entry_id, 0);
        assert_eq!(report.failures[1].container_path.as_str(), "c.txt");
        assert_eq!(report.exit_code(), 31);
        assert_eq!(report.checked, 1);
    }
}
