//! Read side of the archive container.
//!
//! The archive is memory-mapped once and shared read-only by every unpack
//! worker; payloads are borrowed straight out of the mapping.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use thiserror::Error;

use inpack_schema::archive::{FOOTER_LEN, HEADER_LEN, decode_toc};
use inpack_schema::{
    ArchiveToc, BuildId, DescriptorError, FileEntry, FormatError, PackDescriptor, TocEntry,
};

/// Failures opening an archive or pairing it with a descriptor.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// The archive file could not be opened or mapped.
    #[error("cannot open archive {path}: {source}")]
    Io {
        /// Archive path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The archive framing is invalid.
    #[error("invalid archive {path}: {source}")]
    Format {
        /// Archive path.
        path: PathBuf,
        /// Framing failure.
        #[source]
        source: FormatError,
    },

    /// The descriptor could not be loaded.
    #[error("invalid descriptor {path}: {source}")]
    Descriptor {
        /// Descriptor path.
        path: PathBuf,
        /// Load failure.
        #[source]
        source: DescriptorError,
    },

    /// Archive and descriptor come from different builds.
    #[error("archive build {archive} does not match descriptor build {descriptor}")]
    BuildMismatch {
        /// Build id in the archive.
        archive: BuildId,
        /// Build id in the descriptor.
        descriptor: BuildId,
    },

    /// The descriptor references an entry the archive does not contain.
    #[error("descriptor entry {0} is missing from the archive")]
    MissingEntry(u32),

    /// Descriptor and archive disagree about an entry.
    #[error("descriptor entry {entry_id} disagrees with the archive: {reason}")]
    EntryMismatch {
        /// Offending entry.
        entry_id: u32,
        /// What differs.
        reason: String,
    },
}

impl ArchiveError {
    /// Process exit code for this failure class.
    pub fn exit_code(&self) -> u8 {
        60
    }
}

/// An opened, validated archive.
#[derive(Debug)]
pub struct ArchiveReader {
    path: PathBuf,
    map: Mmap,
    toc: ArchiveToc,
    index: HashMap<u32, usize>,
}

impl ArchiveReader {
    /// Map `path` and decode its table of contents.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Io`] if the file cannot be mapped and
    /// [`ArchiveError::Format`] if its framing is invalid.
    pub fn open(path: &Path) -> Result<Self, ArchiveError> {
        let io_err = |source| ArchiveError::Io {
            path: path.to_path_buf(),
            source,
        };
        let format_err = |source| ArchiveError::Format {
            path: path.to_path_buf(),
            source,
        };

        let file = File::open(path).map_err(io_err)?;
        let len = file.metadata().map_err(io_err)?.len();
        // Mapping an empty file fails on some platforms; report it as truncation.
        if len < (HEADER_LEN + FOOTER_LEN) as u64 {
            return Err(format_err(FormatError::Truncated(
                usize::try_from(len).unwrap_or(usize::MAX),
            )));
        }

        // SAFETY: the archive is opened read-only and treated as immutable;
        // every range is bounds-checked against the mapping before use.
        #[allow(unsafe_code)]
        let map = unsafe { Mmap::map(&file) }.map_err(io_err)?;
        let toc = decode_toc(&map).map_err(format_err)?;

        let mut index = HashMap::with_capacity(toc.entries.len());
        for (i, entry) in toc.entries.iter().enumerate() {
            if index.insert(entry.entry_id, i).is_some() {
                return Err(format_err(FormatError::PayloadOutOfBounds {
                    entry_id: entry.entry_id,
                }));
            }
        }

        tracing::debug!(
            path = %path.display(),
            entries = toc.entries.len(),
            build_id = %toc.build_id,
            "opened archive"
        );
        Ok(Self {
            path: path.to_path_buf(),
            map,
            toc,
            index,
        })
    }

    /// Open an archive and its descriptor and check that they are a matched pair.
    ///
    /// # Errors
    ///
    /// Returns an [`ArchiveError`] if either file is unreadable or they do
    /// not belong to the same build.
    pub fn open_pair(
        archive: &Path,
        descriptor: &Path,
    ) -> Result<(Self, PackDescriptor), ArchiveError> {
        let reader = Self::open(archive)?;
        let descriptor =
            PackDescriptor::load(descriptor).map_err(|source| ArchiveError::Descriptor {
                path: descriptor.to_path_buf(),
                source,
            })?;
        reader.check_descriptor(&descriptor)?;
        Ok((reader, descriptor))
    }

    /// Archive path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Build id recorded in the archive.
    pub fn build_id(&self) -> &BuildId {
        &self.toc.build_id
    }

    /// Table of contents entries in write order.
    pub fn entries(&self) -> &[TocEntry] {
        &self.toc.entries
    }

    /// Look up a table of contents entry.
    pub fn entry(&self, entry_id: u32) -> Option<&TocEntry> {
        self.index.get(&entry_id).map(|&i| &self.toc.entries[i])
    }

    /// Encoded payload bytes of an entry.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::MissingEntry`] for an unknown id.
    pub fn payload(&self, entry_id: u32) -> Result<&[u8], ArchiveError> {
        let entry = self
            .entry(entry_id)
            .ok_or(ArchiveError::MissingEntry(entry_id))?;
        // Ranges were validated against the mapping in `decode_toc`.
        let start = entry.payload_offset as usize;
        let end = start + entry.payload_length as usize;
        Ok(&self.map[start..end])
    }

    /// Check that `descriptor` was produced by the same build as this archive.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::BuildMismatch`] for a different build, or an
    /// entry-level error if any descriptor entry disagrees with the archive.
    pub fn check_descriptor(&self, descriptor: &PackDescriptor) -> Result<(), ArchiveError> {
        if descriptor.build_id != self.toc.build_id {
            return Err(ArchiveError::BuildMismatch {
                archive: self.toc.build_id.clone(),
                descriptor: descriptor.build_id.clone(),
            });
        }
        for entry in &descriptor.entries {
            self.check_entry(entry)?;
        }
        Ok(())
    }

    fn check_entry(&self, entry: &FileEntry) -> Result<(), ArchiveError> {
        let toc = self
            .entry(entry.id)
            .ok_or(ArchiveError::MissingEntry(entry.id))?;
        let mismatch = |reason: String| ArchiveError::EntryMismatch {
            entry_id: entry.id,
            reason,
        };

        if toc.container_path != entry.container_path {
            return Err(mismatch(format!(
                "container path {} vs {}",
                entry.container_path, toc.container_path
            )));
        }
        if toc.codec != entry.codec {
            return Err(mismatch(format!("codec {} vs {}", entry.codec, toc.codec)));
        }
        if toc.payload_length != entry.stored_length {
            return Err(mismatch(format!(
                "stored length {} vs {}",
                entry.stored_length, toc.payload_length
            )));
        }
        Ok(())
    }
}
