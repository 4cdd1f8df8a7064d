//! Unpacker variants.
//!
//! Every descriptor entry is materialized by exactly one variant, chosen
//! once from the entry's flags and codec:
//!
//! - [`Unpacker::Direct`]: raw payload copied out of the archive.
//! - [`Unpacker::CompressedBlock`]: payload streamed through its codec.
//! - [`Unpacker::Loose`]: bytes read from an external source tree keyed by
//!   the container path; the archive is not consulted.
//!
//! Output is always written to a temporary file first. A decode or write
//! failure drops that file, so truncated output never reaches a target.
//! Checksums are verified with [`verify_and_set_mode`] once the bytes are
//! on disk; the recorded mode is applied only after that check.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use tempfile::TempPath;
use thiserror::Error;

use inpack_schema::{Blake3Hash, CodecId, FileEntry};

use crate::archive::{ArchiveError, ArchiveReader};
use crate::codec::{Codec, CodecError, CodecRegistry};

/// Per-entry unpack failures.
#[derive(Error, Debug)]
pub enum UnpackError {
    /// The payload could not be decoded.
    #[error("entry {entry_id}: {codec} decode failed: {source}")]
    CodecFailure {
        /// Offending entry.
        entry_id: u32,
        /// Codec in use.
        codec: CodecId,
        /// Decoder error.
        #[source]
        source: io::Error,
    },

    /// Materialized bytes do not match the recorded checksum.
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// File that was checked.
        path: PathBuf,
        /// Checksum from the descriptor.
        expected: Blake3Hash,
        /// Checksum of the bytes on disk.
        actual: Blake3Hash,
    },

    /// The target (or its staging location) cannot be written or read back.
    #[error("target {path} is unavailable: {source}")]
    TargetUnavailable {
        /// Target or staging path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// A loose source file is missing and the prompt chose to abort.
    #[error("loose source {path} is missing")]
    SourceMissing {
        /// Expected source path.
        path: PathBuf,
        /// Underlying error, when the file exists but cannot be read.
        #[source]
        source: Option<io::Error>,
    },

    /// The archive does not contain the entry.
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// The entry names an unregistered codec.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl UnpackError {
    /// Process exit code for this failure class.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::CodecFailure { .. } | Self::Codec(_) => 30,
            Self::ChecksumMismatch { .. } => 31,
            Self::TargetUnavailable { .. } => 32,
            Self::SourceMissing { .. } => 33,
            Self::Archive(e) => e.exit_code(),
        }
    }

    fn target(path: &Path) -> impl Fn(io::Error) -> Self + '_ {
        move |source| Self::TargetUnavailable {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// What to do when a loose source file is absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MissingSourcePolicy {
    /// Skip the entry and carry on with a warning.
    Skip,
    /// Fail the entry (and with it the deploy).
    #[default]
    Abort,
}

impl std::str::FromStr for MissingSourcePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "skip" => Ok(Self::Skip),
            "abort" => Ok(Self::Abort),
            other => Err(format!("expected 'skip' or 'abort', got '{other}'")),
        }
    }
}

/// Non-fatal outcome the caller should surface to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    /// Human-readable description.
    pub message: String,
    /// Policy that was applied.
    pub default_policy: MissingSourcePolicy,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Decides what happens when a loose source is missing.
pub trait MissingSourcePrompt: Send + Sync + fmt::Debug {
    /// Called once per missing loose source.
    fn on_missing(&self, entry: &FileEntry, path: &Path) -> MissingSourcePolicy;
}

/// Prompt that always gives the same answer.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedPolicy(pub MissingSourcePolicy);

impl MissingSourcePrompt for FixedPolicy {
    fn on_missing(&self, _: &FileEntry, _: &Path) -> MissingSourcePolicy {
        self.0
    }
}

/// External source tree for loose entries.
#[derive(Debug, Clone)]
pub struct LooseSource {
    root: PathBuf,
    prompt: Arc<dyn MissingSourcePrompt>,
}

impl LooseSource {
    /// Source tree rooted at `root`.
    pub fn new(root: impl Into<PathBuf>, prompt: Arc<dyn MissingSourcePrompt>) -> Self {
        Self {
            root: root.into(),
            prompt,
        }
    }

    /// Source tree root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the loose source for `entry` is expected.
    pub fn path_for(&self, entry: &FileEntry) -> PathBuf {
        entry
            .container_path
            .segments()
            .fold(self.root.clone(), |p, seg| p.join(seg))
    }
}

/// Result of streaming one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extracted {
    /// All bytes were produced.
    Complete {
        /// BLAKE3 of the produced bytes.
        checksum: Blake3Hash,
        /// Byte count.
        bytes: u64,
    },
    /// The entry was skipped.
    Skipped(Warning),
}

/// A materialized file waiting in a staging directory.
#[derive(Debug)]
pub struct StagedFile {
    /// Entry it was produced from.
    pub entry_id: u32,
    /// Temporary path; removed on drop unless persisted.
    pub path: TempPath,
}

/// Result of staging one entry.
#[derive(Debug)]
pub enum Staged {
    /// Ready to be moved into place.
    File(StagedFile),
    /// Skipped with a warning.
    Skipped(Warning),
}

/// Strategy for one entry.
#[derive(Debug, Clone)]
pub enum Unpacker<'a> {
    /// Raw payload copy.
    Direct,
    /// Loose source tree lookup.
    Loose(&'a LooseSource),
    /// Decode through a codec.
    CompressedBlock(Arc<dyn Codec>),
}

/// Picks the unpacker for each entry.
#[derive(Debug, Clone)]
pub struct Unpackers {
    registry: CodecRegistry,
    loose: LooseSource,
}

impl Unpackers {
    /// Create a selector.
    pub fn new(registry: CodecRegistry, loose: LooseSource) -> Self {
        Self { registry, loose }
    }

    /// Select the variant for `entry`.
    ///
    /// # Errors
    ///
    /// Returns [`UnpackError::Codec`] if the entry names an unknown codec.
    pub fn for_entry(&self, entry: &FileEntry) -> Result<Unpacker<'_>, UnpackError> {
        if entry.flags.loose {
            return Ok(Unpacker::Loose(&self.loose));
        }
        if entry.codec.is_raw() {
            return Ok(Unpacker::Direct);
        }
        Ok(Unpacker::CompressedBlock(self.registry.get(&entry.codec)?))
    }
}

impl Unpacker<'_> {
    /// Stream the entry's original bytes into `out`.
    ///
    /// `label` names the destination in write errors. The returned checksum
    /// covers exactly what was written; comparing it with the entry is left
    /// to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`UnpackError::CodecFailure`] on a decode error,
    /// [`UnpackError::TargetUnavailable`] when `out` fails, and
    /// [`UnpackError::SourceMissing`] for an aborted loose lookup.
    pub fn extract(
        &self,
        entry: &FileEntry,
        archive: &ArchiveReader,
        out: &mut dyn Write,
        label: &Path,
    ) -> Result<Extracted, UnpackError> {
        let write_err = UnpackError::target(label);
        match self {
            Self::Direct => {
                let payload = archive.payload(entry.id)?;
                let read_err = |source| UnpackError::CodecFailure {
                    entry_id: entry.id,
                    codec: entry.codec.clone(),
                    source,
                };
                pump(&mut &payload[..], out, read_err, write_err)
            }
            Self::CompressedBlock(codec) => {
                let payload = archive.payload(entry.id)?;
                let read_err = |source| UnpackError::CodecFailure {
                    entry_id: entry.id,
                    codec: entry.codec.clone(),
                    source,
                };
                let mut decoder = codec.decoder(Box::new(payload)).map_err(read_err)?;
                pump(&mut decoder, out, read_err, write_err)
            }
            Self::Loose(source) => {
                let path = source.path_for(entry);
                let file = match File::open(&path) {
                    Ok(file) => file,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        return match source.prompt.on_missing(entry, &path) {
                            MissingSourcePolicy::Skip => {
                                tracing::warn!(path = %path.display(), "loose source missing, skipping");
                                Ok(Extracted::Skipped(Warning {
                                    message: format!(
                                        "loose source {} for {} is missing; skipped",
                                        path.display(),
                                        entry.container_path
                                    ),
                                    default_policy: MissingSourcePolicy::Skip,
                                }))
                            }
                            MissingSourcePolicy::Abort => {
                                Err(UnpackError::SourceMissing { path, source: None })
                            }
                        };
                    }
                    Err(e) => {
                        return Err(UnpackError::SourceMissing {
                            path,
                            source: Some(e),
                        });
                    }
                };
                let read_err = |e| UnpackError::SourceMissing {
                    path: path.clone(),
                    source: Some(e),
                };
                pump(&mut io::BufReader::new(file), out, read_err, write_err)
            }
        }
    }

    /// Materialize the entry as a temporary file in `staging_dir`.
    ///
    /// The staged file carries the entry's recorded mtime. Its checksum is
    /// not checked here and its mode is not set yet; callers finish it with
    /// [`verify_and_set_mode`] wherever the bytes finally land.
    ///
    /// # Errors
    ///
    /// Any [`UnpackError`]; the partial temporary file is removed.
    pub fn stage(
        &self,
        entry: &FileEntry,
        archive: &ArchiveReader,
        staging_dir: &Path,
    ) -> Result<Staged, UnpackError> {
        let tmp = tempfile::Builder::new()
            .prefix(".stage-")
            .tempfile_in(staging_dir)
            .map_err(UnpackError::target(staging_dir))?;
        let (file, path) = tmp.into_parts();

        let mut out = BufWriter::new(file);
        if let Extracted::Skipped(warning) = self.extract(entry, archive, &mut out, &path)? {
            return Ok(Staged::Skipped(warning));
        }
        let file = out
            .into_inner()
            .map_err(|e| UnpackError::target(&path)(e.into_error()))?;
        if let Some(mtime) = entry.mtime {
            file.set_modified(UNIX_EPOCH + Duration::from_secs(mtime))
                .map_err(UnpackError::target(&path))?;
        }
        file.sync_all().map_err(UnpackError::target(&path))?;
        drop(file);

        Ok(Staged::File(StagedFile {
            entry_id: entry.id,
            path,
        }))
    }

    /// Write the entry straight to `target`, creating parent directories.
    ///
    /// This bypasses any transaction; the file is staged beside the target
    /// and renamed over it only once verified.
    ///
    /// # Errors
    ///
    /// Any [`UnpackError`]; an existing target is left untouched on failure.
    pub fn unpack(
        &self,
        entry: &FileEntry,
        archive: &ArchiveReader,
        target: &Path,
    ) -> Result<Option<Warning>, UnpackError> {
        let parent = target.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(UnpackError::target(parent))?;
        match self.stage(entry, archive, parent)? {
            Staged::Skipped(warning) => Ok(Some(warning)),
            Staged::File(staged) => {
                verify_and_set_mode(&staged.path, entry)?;
                staged
                    .path
                    .persist(target)
                    .map_err(|e| UnpackError::target(target)(e.error))?;
                Ok(None)
            }
        }
    }
}

/// Re-read `path` and compare it against the entry's checksum.
///
/// # Errors
///
/// Returns [`UnpackError::ChecksumMismatch`] if the content differs and
/// [`UnpackError::TargetUnavailable`] if the file cannot be read.
pub fn verify_file(path: &Path, entry: &FileEntry) -> Result<(), UnpackError> {
    let (actual, _) = Blake3Hash::compute_file(path).map_err(UnpackError::target(path))?;
    if actual != entry.checksum {
        return Err(UnpackError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: entry.checksum.clone(),
            actual,
        });
    }
    Ok(())
}

/// Verify `path` with [`verify_file`], then give it the entry's recorded
/// mode. A mode without owner read access cannot fail the check this way.
///
/// # Errors
///
/// Anything [`verify_file`] returns, or [`UnpackError::TargetUnavailable`]
/// if the mode cannot be set.
pub fn verify_and_set_mode(path: &Path, entry: &FileEntry) -> Result<(), UnpackError> {
    verify_file(path, entry)?;
    if let Some(mode) = entry.mode {
        set_mode(path, mode).map_err(UnpackError::target(path))?;
    }
    Ok(())
}

fn pump(
    reader: &mut dyn Read,
    out: &mut dyn Write,
    read_err: impl Fn(io::Error) -> UnpackError,
    write_err: impl Fn(io::Error) -> UnpackError,
) -> Result<Extracted, UnpackError> {
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; 64 * 1024];
    let mut bytes = 0u64;

    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(read_err(e)),
        };
        hasher.update(&buffer[..n]);
        out.write_all(&buffer[..n]).map_err(&write_err)?;
        bytes += n as u64;
    }
    out.flush().map_err(&write_err)?;

    Ok(Extracted::Complete {
        checksum: Blake3Hash::from(hasher.finalize()),
        bytes,
    })
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_: &Path, _: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ArchiveBuilder;
    use crate::catalog::{Artifact, Catalog, Component};
    use crate::reporter::NullSink;
    use crate::resolver::resolve;
    use inpack_schema::{ContainerPath, PackDescriptor};
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        dir: TempDir,
        archive: ArchiveReader,
        descriptor: PackDescriptor,
    }

    fn fixture(codec: &str, loose: bool) -> Fixture {
        let dir = tempdir().unwrap();
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 97) as u8).collect();
        let mut artifact = Artifact::bytes(ContainerPath::parse("lib/data.bin").unwrap(), data);
        artifact.codec = Some(CodecId::new(codec));
        artifact.flags.loose = loose;

        let catalog = Catalog::new(vec![Component::new("c").artifact(artifact)]);
        let resolved = resolve(&catalog, &["c".into()]).unwrap();
        let archive = dir.path().join("p.inpk");
        let descriptor = dir.path().join("p.json");
        ArchiveBuilder::new(CodecRegistry::builtin(), CodecId::raw())
            .build(&resolved, &archive, &descriptor, &NullSink)
            .unwrap();
        let (archive, descriptor) = ArchiveReader::open_pair(&archive, &descriptor).unwrap();
        Fixture {
            dir,
            archive,
            descriptor,
        }
    }

    fn unpackers(root: &Path, policy: MissingSourcePolicy) -> Unpackers {
        Unpackers::new(
            CodecRegistry::builtin(),
            LooseSource::new(root, Arc::new(FixedPolicy(policy))),
        )
    }

    #[test]
    fn every_codec_round_trips_through_unpack() {
        for codec in ["raw", "zstd", "gzip"] {
            let fx = fixture(codec, false);
            let entry = &fx.descriptor.entries[0];
            let unpackers = unpackers(fx.dir.path(), MissingSourcePolicy::Abort);
            let unpacker = unpackers.for_entry(entry).unwrap();
            assert_eq!(
                matches!(unpacker, Unpacker::Direct),
                codec == "raw",
                "{codec}"
            );

            let target = fx.dir.path().join("out/lib/data.bin");
            assert_eq!(unpacker.unpack(entry, &fx.archive, &target).unwrap(), None);
            let (hash, len) = Blake3Hash::compute_file(&target).unwrap();
            assert_eq!(hash, entry.checksum, "{codec}");
            assert_eq!(len, entry.size);
        }
    }

    #[test]
    fn loose_entries_read_from_source_tree() {
        let fx = fixture("raw", true);
        let entry = &fx.descriptor.entries[0];
        let tree = fx.dir.path().join("tree");
        fs::create_dir_all(tree.join("lib")).unwrap();
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 97) as u8).collect();
        fs::write(tree.join("lib/data.bin"), &data).unwrap();

        let unpackers = unpackers(&tree, MissingSourcePolicy::Abort);
        let unpacker = unpackers.for_entry(entry).unwrap();
        assert!(matches!(unpacker, Unpacker::Loose(_)));

        let staging = fx.dir.path().join("staging");
        fs::create_dir_all(&staging).unwrap();
        let Staged::File(staged) = unpacker.stage(entry, &fx.archive, &staging).unwrap() else {
            panic!("expected a staged file");
        };
        assert_eq!(fs::read(&staged.path).unwrap(), data);
    }

    #[test]
    fn loose_source_with_wrong_content_is_a_mismatch() {
        let fx = fixture("raw", true);
        let entry = &fx.descriptor.entries[0];
        let tree = fx.dir.path().join("tree");
        fs::create_dir_all(tree.join("lib")).unwrap();
        fs::write(tree.join("lib/data.bin"), b"not the packed bytes").unwrap();

        let out = fx.dir.path().join("out");
        let unpackers = unpackers(&tree, MissingSourcePolicy::Abort);
        let err = unpackers
            .for_entry(entry)
            .unwrap()
            .unpack(entry, &fx.archive, &out.join("data.bin"))
            .unwrap_err();
        assert!(matches!(err, UnpackError::ChecksumMismatch { .. }));
        assert_eq!(err.exit_code(), 31);
        assert_eq!(fs::read_dir(&out).unwrap().count(), 0);
    }

    #[test]
    fn missing_loose_source_follows_policy() {
        let fx = fixture("raw", true);
        let entry = &fx.descriptor.entries[0];
        let target = fx.dir.path().join("out/data.bin");

        let skip = unpackers(&fx.dir.path().join("nowhere"), MissingSourcePolicy::Skip);
        let warning = skip
            .for_entry(entry)
            .unwrap()
            .unpack(entry, &fx.archive, &target)
            .unwrap()
            .unwrap();
        assert_eq!(warning.default_policy, MissingSourcePolicy::Skip);
        assert!(warning.message.contains("lib/data.bin"));
        assert!(!target.exists());

        let abort = unpackers(&fx.dir.path().join("nowhere"), MissingSourcePolicy::Abort);
        let err = abort
            .for_entry(entry)
            .unwrap()
            .unpack(entry, &fx.archive, &target)
            .unwrap_err();
        assert!(matches!(err, UnpackError::SourceMissing { source: None, .. }));
        assert_eq!(err.exit_code(), 33);
    }

    #[test]
    fn decode_failure_discards_partial_output() {
        let fx = fixture("zstd", false);
        let mut entry = fx.descriptor.entries[0].clone();
        // Decode a zstd payload as gzip.
        entry.codec = CodecId::new("gzip");

        let staging = fx.dir.path().join("staging");
        fs::create_dir_all(&staging).unwrap();
        let unpackers = unpackers(fx.dir.path(), MissingSourcePolicy::Abort);
        let err = unpackers
            .for_entry(&entry)
            .unwrap()
            .stage(&entry, &fx.archive, &staging)
            .unwrap_err();
        assert!(matches!(err, UnpackError::CodecFailure { .. }));
        assert_eq!(err.exit_code(), 30);
        assert_eq!(fs::read_dir(&staging).unwrap().count(), 0);
    }

    #[test]
    fn failed_unpack_keeps_existing_target() {
        let fx = fixture("zstd", false);
        let mut entry = fx.descriptor.entries[0].clone();
        entry.checksum = Blake3Hash::compute(b"something else");

        let target = fx.dir.path().join("existing.bin");
        fs::write(&target, b"original").unwrap();
        let unpackers = unpackers(fx.dir.path(), MissingSourcePolicy::Abort);
        let err = unpackers
            .for_entry(&entry)
            .unwrap()
            .unpack(&entry, &fx.archive, &target)
            .unwrap_err();
        assert!(matches!(err, UnpackError::ChecksumMismatch { .. }));
        assert_eq!(fs::read(&target).unwrap(), b"original");
    }

    #[cfg(unix)]
    #[test]
    fn staged_file_carries_mode_and_mtime() {
        use std::os::unix::fs::PermissionsExt;

        let fx = fixture("raw", false);
        let mut entry = fx.descriptor.entries[0].clone();
        entry.mode = Some(0o750);
        entry.mtime = Some(1_600_000_000);

        let target = fx.dir.path().join("bin/tool");
        unpackers(fx.dir.path(), MissingSourcePolicy::Abort)
            .for_entry(&entry)
            .unwrap()
            .unpack(&entry, &fx.archive, &target)
            .unwrap();

        let meta = fs::metadata(&target).unwrap();
        assert_eq!(meta.permissions().mode() & 0o7777, 0o750);
        assert_eq!(
            meta.modified().unwrap(),
            UNIX_EPOCH + Duration::from_secs(1_600_000_000)
        );
    }

    #[cfg(unix)]
    #[test]
    fn mode_without_read_access_is_applied_after_verification() {
        use std::os::unix::fs::PermissionsExt;

        let fx = fixture("zstd", false);
        let mut entry = fx.descriptor.entries[0].clone();
        entry.mode = Some(0o200);

        let target = fx.dir.path().join("spool/drop");
        unpackers(fx.dir.path(), MissingSourcePolicy::Abort)
            .for_entry(&entry)
            .unwrap()
            .unpack(&entry, &fx.archive, &target)
            .unwrap();

        let meta = fs::metadata(&target).unwrap();
        assert_eq!(meta.permissions().mode() & 0o7777, 0o200);
        assert_eq!(meta.len(), entry.size);
    }

    #[test]
    fn policy_parses_from_cli_words() {
        assert_eq!(
            "skip".parse::<MissingSourcePolicy>(),
            Ok(MissingSourcePolicy::Skip)
        );
        assert_eq!(
            "abort".parse::<MissingSourcePolicy>(),
            Ok(MissingSourcePolicy::Abort)
        );
        assert!("maybe".parse::<MissingSourcePolicy>().is_err());
    }
}
