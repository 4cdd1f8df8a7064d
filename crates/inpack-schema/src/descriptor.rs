//! Pack descriptor: the persisted manifest of one build.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::DESCRIPTOR_FORMAT_VERSION;
use crate::archive::BuildId;
use crate::hash::Blake3Hash;
use crate::types::{CodecId, ComponentId, ContainerPath, EntryFlags};

/// Errors loading or validating a pack descriptor.
#[derive(Error, Debug)]
pub enum DescriptorError {
    /// The descriptor file could not be read or written.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The descriptor is not valid JSON for this schema.
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// The descriptor was written by an incompatible version.
    #[error("unsupported descriptor format version {found}")]
    UnsupportedVersion {
        /// Version found in the document.
        found: u32,
    },

    /// Two entries share an id or a container path.
    #[error("descriptor lists '{0}' more than once")]
    Duplicate(String),
}

/// One file record in a [`PackDescriptor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Id of the payload in the archive's table of contents.
    pub id: u32,
    /// Component that contributed this entry.
    pub component: ComponentId,
    /// Path of the entry inside the container.
    pub container_path: ContainerPath,
    /// Target path template, e.g. `${INSTALL_PATH}/bin/app`.
    pub target: String,
    /// Original (pre-encoding) byte length.
    pub size: u64,
    /// Encoded payload length as stored in the archive.
    pub stored_length: u64,
    /// BLAKE3 of the original bytes.
    pub checksum: Blake3Hash,
    /// Codec used for the stored payload.
    pub codec: CodecId,
    /// Deploy flags.
    #[serde(default)]
    pub flags: EntryFlags,
    /// Unix permission bits of the source file, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
    /// Source modification time in seconds since the epoch, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<u64>,
}

/// Manifest describing every entry of one archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackDescriptor {
    /// Descriptor format version.
    pub format_version: u32,
    /// Build this descriptor was produced with; must match the archive.
    pub build_id: BuildId,
    /// Entries in deploy order.
    pub entries: Vec<FileEntry>,
}

impl PackDescriptor {
    /// Create a descriptor for a build.
    pub fn new(build_id: BuildId, entries: Vec<FileEntry>) -> Self {
        Self {
            format_version: DESCRIPTOR_FORMAT_VERSION,
            build_id,
            entries,
        }
    }

    /// Load and validate a descriptor from disk.
    ///
    /// # Errors
    ///
    /// Returns a [`DescriptorError`] if the file cannot be read, parsed, or
    /// fails validation.
    pub fn load(path: &Path) -> Result<Self, DescriptorError> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse and validate a descriptor from JSON text.
    ///
    /// # Errors
    ///
    /// See [`PackDescriptor::load`].
    pub fn from_json(s: &str) -> Result<Self, DescriptorError> {
        let descriptor: Self = serde_json::from_str(s)?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Serialize to pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns [`DescriptorError::Parse`] if serialization fails.
    pub fn to_json(&self) -> Result<String, DescriptorError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check version and uniqueness invariants.
    ///
    /// # Errors
    ///
    /// Returns [`DescriptorError::UnsupportedVersion`] or
    /// [`DescriptorError::Duplicate`].
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.format_version != DESCRIPTOR_FORMAT_VERSION {
            return Err(DescriptorError::UnsupportedVersion {
                found: self.format_version,
            });
        }

        let mut ids = HashSet::new();
        let mut paths = HashSet::new();
        for entry in &self.entries {
            if !ids.insert(entry.id) {
                return Err(DescriptorError::Duplicate(format!("entry id {}", entry.id)));
            }
            if !paths.insert(entry.container_path.as_str()) {
                return Err(DescriptorError::Duplicate(entry.container_path.to_string()));
            }
        }
        Ok(())
    }

    /// Total original bytes across all entries.
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }
}
