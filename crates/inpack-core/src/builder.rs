//! Archive builder.
//!
//! Streams every resolved artifact through its codec into one archive and
//! records a [`FileEntry`] per artifact. Output is written to temporary
//! files beside the requested paths and only renamed into place after the
//! whole build has succeeded, so a failed build never leaves a partial
//! archive or descriptor where a consumer would find it.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, UNIX_EPOCH};

use tempfile::{NamedTempFile, TempPath};
use thiserror::Error;

use inpack_schema::archive::{HEADER_LEN, encode_footer, encode_header};
use inpack_schema::{
    ArchiveToc, BuildId, CodecId, ComponentId, ContainerPath, DescriptorError, FileEntry,
    FormatError, PackDescriptor, TocEntry,
};

use crate::catalog::{ArtifactSource, Artifact};
use crate::codec::{Codec, CodecError, CodecRegistry};
use crate::config::BuildConfig;
use crate::io::{CountingWriter, HashingReader};
use crate::reporter::{EntryOutcome, ProgressSink};
use crate::resolver::ResolvedSet;
use crate::template::default_template;

/// Build failures. Nothing is published when any of these is returned.
#[derive(Error, Debug)]
pub enum BuildError {
    /// Two artifacts reached the builder with the same container path.
    #[error("duplicate container path '{path}' claimed by '{first}' and '{second}'")]
    DuplicatePathConflict {
        /// Contested path.
        path: ContainerPath,
        /// Component of the first claim.
        first: ComponentId,
        /// Component of the second claim.
        second: ComponentId,
    },

    /// Reading a source or writing output failed.
    #[error("failed to {context} {path}: {source}")]
    Io {
        /// What was being done.
        context: &'static str,
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// An artifact (or the default) names an unregistered codec.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The table of contents could not be encoded.
    #[error("archive format: {0}")]
    Format(#[from] FormatError),

    /// The descriptor could not be serialized.
    #[error("descriptor: {0}")]
    Descriptor(#[from] DescriptorError),
}

impl BuildError {
    /// Process exit code for this failure class.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::DuplicatePathConflict { .. } => 20,
            _ => 21,
        }
    }

    fn io<'a>(context: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> Self + 'a {
        move |source| Self::Io {
            context,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// What a successful build produced.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    /// The descriptor as written.
    pub descriptor: PackDescriptor,
    /// Published archive path.
    pub archive_path: PathBuf,
    /// Published descriptor path.
    pub descriptor_path: PathBuf,
    /// Archive size in bytes.
    pub archive_len: u64,
}

/// Writes archives and descriptors from resolved artifact sets.
#[derive(Debug, Clone)]
pub struct ArchiveBuilder {
    registry: CodecRegistry,
    default_codec: CodecId,
}

struct Planned<'a> {
    component: &'a ComponentId,
    artifact: &'a Artifact,
    codec: Arc<dyn Codec>,
    codec_id: CodecId,
}

impl ArchiveBuilder {
    /// Create a builder.
    pub fn new(registry: CodecRegistry, default_codec: CodecId) -> Self {
        Self {
            registry,
            default_codec,
        }
    }

    /// Create a builder from configuration.
    pub fn from_config(config: &BuildConfig) -> Self {
        Self::new(config.registry(), config.default_codec.clone())
    }

    /// Write `resolved` to `archive_path` and its descriptor to `descriptor_path`.
    ///
    /// # Errors
    ///
    /// Returns a [`BuildError`] on a duplicate path, an unknown codec, or any
    /// IO failure. Previously published files at either path are left
    /// untouched in that case.
    pub fn build(
        &self,
        resolved: &ResolvedSet,
        archive_path: &Path,
        descriptor_path: &Path,
        sink: &dyn ProgressSink,
    ) -> Result<BuildOutput, BuildError> {
        let started = Instant::now();
        let plan = self.plan(resolved)?;

        sink.section("Packing");
        let archive_tmp = temp_beside(archive_path)?;
        let (file, archive_tmp_path) = archive_tmp.into_parts();
        let mut out = CountingWriter::new(BufWriter::new(file), 0);
        out.write_all(&encode_header())
            .map_err(BuildError::io("write", archive_path))?;
        debug_assert_eq!(out.position(), HEADER_LEN as u64);

        let mut toc_entries = Vec::with_capacity(plan.len());
        let mut file_entries = Vec::with_capacity(plan.len());
        let total = plan.len();

        for (index, planned) in plan.iter().enumerate() {
            let entry_id = u32::try_from(index).map_err(|_| BuildError::Io {
                context: "index",
                path: archive_path.to_path_buf(),
                source: io::Error::other("too many entries"),
            })?;
            let artifact = planned.artifact;
            let source_path = source_label(&artifact.source);

            let (reader, meta) = open_source(&artifact.source)
                .map_err(BuildError::io("read source", &source_path))?;
            let mut reader = HashingReader::new(reader);
            let payload_offset = out.position();

            if artifact.flags.loose {
                io::copy(&mut reader, &mut io::sink())
                    .map_err(BuildError::io("read source", &source_path))?;
            } else {
                planned
                    .codec
                    .encode(&mut reader, &mut out)
                    .map_err(BuildError::io("encode", &source_path))?;
            }

            let payload_length = out.position() - payload_offset;
            let (checksum, size) = reader.finish();

            let entry = FileEntry {
                id: entry_id,
                component: planned.component.clone(),
                container_path: artifact.container_path.clone(),
                target: artifact
                    .target
                    .clone()
                    .unwrap_or_else(|| default_template(&artifact.container_path)),
                size,
                stored_length: payload_length,
                checksum,
                codec: planned.codec_id.clone(),
                flags: artifact.flags,
                mode: meta.mode,
                mtime: meta.mtime,
            };
            sink.entry_started(&entry, index, total);
            tracing::debug!(
                entry_id,
                path = %entry.container_path,
                codec = %entry.codec,
                size,
                payload_length,
                "packed entry"
            );
            sink.entry_done(&entry, &EntryOutcome::Packed);

            toc_entries.push(TocEntry {
                entry_id,
                container_path: entry.container_path.clone(),
                payload_offset,
                payload_length,
                codec: entry.codec.clone(),
            });
            file_entries.push(entry);
        }

        let checksums: Vec<_> = file_entries.iter().map(|e| &e.checksum).collect();
        let build_id = BuildId::derive(&toc_entries, &checksums);
        let toc = ArchiveToc {
            build_id: build_id.clone(),
            entries: toc_entries,
        };
        let toc_bytes = toc.to_bytes()?;
        let toc_offset = out.position();
        out.write_all(&toc_bytes)
            .and_then(|()| out.write_all(&encode_footer(toc_offset, toc_bytes.len() as u64)))
            .map_err(BuildError::io("write", archive_path))?;
        let archive_len = out.position();

        let file = out
            .into_inner()
            .into_inner()
            .map_err(|e| BuildError::io("flush", archive_path)(e.into_error()))?;
        file.sync_all()
            .map_err(BuildError::io("sync", archive_path))?;
        drop(file);

        let descriptor = PackDescriptor::new(build_id, file_entries);
        let mut descriptor_tmp = temp_beside(descriptor_path)?;
        descriptor_tmp
            .write_all(descriptor.to_json()?.as_bytes())
            .and_then(|()| descriptor_tmp.as_file().sync_all())
            .map_err(BuildError::io("write", descriptor_path))?;

        // Both halves are complete; publish. The archive already at
        // `archive_path` stays set aside until the new descriptor is in
        // place, so a failed publish never leaves a mismatched pair.
        let previous = set_aside(archive_path)?;
        if let Err(e) = archive_tmp_path.persist(archive_path) {
            if previous.is_some() {
                restore_archive(archive_path, previous);
            }
            return Err(BuildError::io("publish", archive_path)(e.error));
        }
        if let Err(e) = descriptor_tmp.persist(descriptor_path) {
            restore_archive(archive_path, previous);
            return Err(BuildError::io("publish", descriptor_path)(e.error));
        }
        drop(previous);

        tracing::info!(
            build_id = %descriptor.build_id,
            entries = descriptor.entries.len(),
            archive_len,
            "archive published"
        );
        sink.summary(
            descriptor.entries.len(),
            "packed",
            started.elapsed().as_secs_f64(),
        );

        Ok(BuildOutput {
            descriptor,
            archive_path: archive_path.to_path_buf(),
            descriptor_path: descriptor_path.to_path_buf(),
            archive_len,
        })
    }

    /// Check every artifact before any output is opened.
    fn plan<'a>(&self, resolved: &'a ResolvedSet) -> Result<Vec<Planned<'a>>, BuildError> {
        let mut seen: HashMap<&ContainerPath, &ComponentId> = HashMap::new();
        let mut plan = Vec::with_capacity(resolved.artifacts.len());

        for resolved in &resolved.artifacts {
            let artifact = &resolved.artifact;
            if let Some(first) = seen.insert(&artifact.container_path, &resolved.component) {
                return Err(BuildError::DuplicatePathConflict {
                    path: artifact.container_path.clone(),
                    first: first.clone(),
                    second: resolved.component.clone(),
                });
            }

            // Loose payloads never enter the archive.
            let codec_id = if artifact.flags.loose {
                CodecId::raw()
            } else {
                artifact
                    .codec
                    .clone()
                    .unwrap_or_else(|| self.default_codec.clone())
            };
            let codec = self.registry.get(&codec_id)?;
            plan.push(Planned {
                component: &resolved.component,
                artifact,
                codec,
                codec_id,
            });
        }
        Ok(plan)
    }
}

#[derive(Debug, Default)]
struct SourceMeta {
    mode: Option<u32>,
    mtime: Option<u64>,
}

fn open_source(source: &ArtifactSource) -> io::Result<(Box<dyn Read + '_>, SourceMeta)> {
    match source {
        ArtifactSource::Bytes(data) => Ok((Box::new(&data[..]), SourceMeta::default())),
        ArtifactSource::File(path) => {
            let file = File::open(path)?;
            let metadata = file.metadata()?;
            let mtime = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs());
            Ok((
                Box::new(io::BufReader::new(file)),
                SourceMeta {
                    mode: file_mode(&metadata),
                    mtime,
                },
            ))
        }
    }
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(metadata.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn file_mode(_: &fs::Metadata) -> Option<u32> {
    None
}

fn source_label(source: &ArtifactSource) -> PathBuf {
    match source {
        ArtifactSource::File(path) => path.clone(),
        ArtifactSource::Bytes(_) => PathBuf::from("<inline>"),
    }
}

fn temp_beside(path: &Path) -> Result<NamedTempFile, BuildError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(BuildError::io("create", dir))?;
    tempfile::Builder::new()
        .prefix(".inpack-build-")
        .tempfile_in(dir)
        .map_err(BuildError::io("create temporary file in", dir))
}

/// Move the file at `path`, if any, to a temporary name beside it. The
/// returned path deletes it on drop.
fn set_aside(path: &Path) -> Result<Option<TempPath>, BuildError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_file() => {}
        Ok(_) => return Ok(None),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(BuildError::io("inspect", path)(e)),
    }
    let aside = temp_beside(path)?.into_temp_path();
    fs::rename(path, &aside).map_err(BuildError::io("set aside", path))?;
    Ok(Some(aside))
}

/// Undo a publish: put the set-aside archive back, or remove the new one
/// when there was none.
fn restore_archive(path: &Path, previous: Option<TempPath>) {
    let restored = match previous {
        Some(previous) => previous.persist(path).map_err(|e| e.error),
        None => match fs::remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        },
    };
    if let Err(e) = restored {
        tracing::error!(path = %path.display(), error = %e, "cannot restore previous archive");
    }
}
