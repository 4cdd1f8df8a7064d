//! Archive container layout.
//!
//! ```text
//! +-----------------------------+
//! | magic "INPK" | u16 version  |  header (8 bytes)
//! | u16 reserved                |
//! +-----------------------------+
//! | payload 0 | payload 1 | ... |  encoded entry payloads, back to back
//! +-----------------------------+
//! | table of contents (postcard)|
//! +-----------------------------+
//! | u64 toc_offset | u64 toc_len|  footer (20 bytes)
//! | magic "INPK"                |
//! +-----------------------------+
//! ```
//!
//! All integers are little endian. The table of contents is written last so
//! the builder can stream payloads without knowing their encoded sizes up
//! front.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hash::Blake3Hash;
use crate::types::{CodecId, ContainerPath};
use crate::{ARCHIVE_FORMAT_VERSION, ARCHIVE_MAGIC};

/// Size of the fixed archive header.
pub const HEADER_LEN: usize = 8;

/// Size of the fixed archive footer.
pub const FOOTER_LEN: usize = 20;

/// Errors decoding the container framing.
#[derive(Error, Debug)]
pub enum FormatError {
    /// The file is shorter than header + footer.
    #[error("archive truncated: {0} bytes")]
    Truncated(usize),

    /// Header or footer magic does not match.
    #[error("not an inpack archive (bad magic)")]
    BadMagic,

    /// The archive was written by an incompatible format version.
    #[error("unsupported archive format version {0}")]
    UnsupportedVersion(u16),

    /// The footer points outside the file.
    #[error("table of contents out of bounds (offset {offset}, length {len}, file {file_len})")]
    TocOutOfBounds {
        /// Offset recorded in the footer.
        offset: u64,
        /// Length recorded in the footer.
        len: u64,
        /// Actual file length.
        file_len: usize,
    },

    /// A payload range recorded in the table of contents points outside the payload area.
    #[error("payload of entry {entry_id} out of bounds")]
    PayloadOutOfBounds {
        /// Offending entry.
        entry_id: u32,
    },

    /// Postcard decoding or encoding failed.
    #[error("table of contents encoding: {0}")]
    Postcard(#[from] postcard::Error),
}

/// Identity of one build, shared by an archive and its descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildId(Blake3Hash);

impl BuildId {
    /// Derive the build id from the ordered entry table.
    ///
    /// Every field that affects deploy output participates, so two archives
    /// share an id only when they are interchangeable.
    pub fn derive(entries: &[TocEntry], checksums: &[&Blake3Hash]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&ARCHIVE_MAGIC);
        hasher.update(&ARCHIVE_FORMAT_VERSION.to_le_bytes());
        for (entry, checksum) in entries.iter().zip(checksums) {
            hasher.update(&entry.entry_id.to_le_bytes());
            hasher.update(entry.container_path.as_str().as_bytes());
            hasher.update(&[0]);
            hasher.update(entry.codec.as_str().as_bytes());
            hasher.update(&[0]);
            hasher.update(&entry.payload_offset.to_le_bytes());
            hasher.update(&entry.payload_length.to_le_bytes());
            hasher.update(checksum.as_str().as_bytes());
        }
        Self(Blake3Hash::from(hasher.finalize()))
    }

    /// Return the id as hex.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl std::fmt::Display for BuildId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One payload record in the archive's table of contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TocEntry {
    /// Unique within the archive; referenced by descriptor entries.
    pub entry_id: u32,
    /// Path of the entry inside the container.
    pub container_path: ContainerPath,
    /// Absolute file offset of the encoded payload.
    pub payload_offset: u64,
    /// Encoded payload length (post-codec).
    pub payload_length: u64,
    /// Codec the payload was encoded with.
    pub codec: CodecId,
}

/// Table of contents stored at the end of the archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveToc {
    /// Build this archive belongs to.
    pub build_id: BuildId,
    /// Entries in write order.
    pub entries: Vec<TocEntry>,
}

impl ArchiveToc {
    /// Serialize to postcard bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::Postcard`] if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, FormatError> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Find an entry by id.
    pub fn entry(&self, entry_id: u32) -> Option<&TocEntry> {
        self.entries.iter().find(|e| e.entry_id == entry_id)
    }
}

/// Encode the fixed header.
pub fn encode_header() -> [u8; HEADER_LEN] {
    let mut out = [0u8; HEADER_LEN];
    out[..4].copy_from_slice(&ARCHIVE_MAGIC);
    out[4..6].copy_from_slice(&ARCHIVE_FORMAT_VERSION.to_le_bytes());
    out
}

/// Encode the fixed footer.
pub fn encode_footer(toc_offset: u64, toc_len: u64) -> [u8; FOOTER_LEN] {
    let mut out = [0u8; FOOTER_LEN];
    out[..8].copy_from_slice(&toc_offset.to_le_bytes());
    out[8..16].copy_from_slice(&toc_len.to_le_bytes());
    out[16..].copy_from_slice(&ARCHIVE_MAGIC);
    out
}

/// Validate framing and decode the table of contents from a complete archive image.
///
/// # Errors
///
/// Returns a [`FormatError`] if the magic, version, footer or any payload
/// range is inconsistent with the image.
pub fn decode_toc(image: &[u8]) -> Result<ArchiveToc, FormatError> {
    if image.len() < HEADER_LEN + FOOTER_LEN {
        return Err(FormatError::Truncated(image.len()));
    }
    if image[..4] != ARCHIVE_MAGIC || image[image.len() - 4..] != ARCHIVE_MAGIC {
        return Err(FormatError::BadMagic);
    }
    let version = u16::from_le_bytes([image[4], image[5]]);
    if version != ARCHIVE_FORMAT_VERSION {
        return Err(FormatError::UnsupportedVersion(version));
    }

    let footer = &image[image.len() - FOOTER_LEN..];
    let toc_offset = u64::from_le_bytes(footer[..8].try_into().unwrap_or_default());
    let toc_len = u64::from_le_bytes(footer[8..16].try_into().unwrap_or_default());
    let toc_end = image.len() - FOOTER_LEN;

    let in_bounds = toc_offset >= HEADER_LEN as u64
        && toc_offset
            .checked_add(toc_len)
            .is_some_and(|end| end == toc_end as u64);
    if !in_bounds {
        return Err(FormatError::TocOutOfBounds {
            offset: toc_offset,
            len: toc_len,
            file_len: image.len(),
        });
    }

    let toc: ArchiveToc = postcard::from_bytes(&image[toc_offset as usize..toc_end])?;

    for entry in &toc.entries {
        let fits = entry.payload_offset >= HEADER_LEN as u64
            && entry
                .payload_offset
                .checked_add(entry.payload_length)
                .is_some_and(|end| end <= toc_offset);
        if !fits {
            return Err(FormatError::PayloadOutOfBounds {
                entry_id: entry.entry_id,
            });
        }
    }

    Ok(toc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_toc(offset: u64, len: u64) -> ArchiveToc {
        let entries = vec![TocEntry {
            entry_id: 0,
            container_path: ContainerPath::parse("bin/app").unwrap(),
            payload_offset: offset,
            payload_length: len,
            codec: CodecId::raw(),
        }];
        let checksum = Blake3Hash::compute(b"payload");
        let build_id = BuildId::derive(&entries, &[&checksum]);
        ArchiveToc { build_id, entries }
    }

    fn assemble(payload: &[u8], toc: &ArchiveToc) -> Vec<u8> {
        let mut image = encode_header().to_vec();
        image.extend_from_slice(payload);
        let toc_bytes = toc.to_bytes().unwrap();
        let toc_offset = image.len() as u64;
        image.extend_from_slice(&toc_bytes);
        image.extend_from_slice(&encode_footer(toc_offset, toc_bytes.len() as u64));
        image
    }

    #[test]
    fn decodes_well_formed_image() {
        let toc = sample_toc(HEADER_LEN as u64, 7);
        let image = assemble(b"payload", &toc);
        assert_eq!(decode_toc(&image).unwrap(), toc);
    }

    #[test]
    fn rejects_bad_magic_and_truncation() {
        assert!(matches!(decode_toc(b"short"), Err(FormatError::Truncated(5))));

        let toc = sample_toc(HEADER_LEN as u64, 7);
        let mut image = assemble(b"payload", &toc);
        image[0] = b'X';
        assert!(matches!(decode_toc(&image), Err(FormatError::BadMagic)));
    }

    #[test]
    fn rejects_payload_past_toc() {
        let toc = sample_toc(HEADER_LEN as u64, 4096);
        let image = assemble(b"payload", &toc);
        assert!(matches!(
            decode_toc(&image),
            Err(FormatError::PayloadOutOfBounds { entry_id: 0 })
        ));
    }

    #[test]
    fn build_id_tracks_content() {
        let a = sample_toc(HEADER_LEN as u64, 7);
        let b = sample_toc(HEADER_LEN as u64, 7);
        assert_eq!(a.build_id, b.build_id);

        let other = Blake3Hash::compute(b"other");
        let c = BuildId::derive(&a.entries, &[&other]);
        assert_ne!(a.build_id, c);
    }
}
