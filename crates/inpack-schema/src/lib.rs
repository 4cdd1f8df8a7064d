//! Shared types and wire format for inpack.
//!
//! Everything that is persisted by the build stage and read back by the
//! deploy stage lives here: the [`PackDescriptor`] manifest, the archive
//! container layout and the install receipt.

pub mod archive;
pub mod descriptor;
pub mod hash;
pub mod receipt;
pub mod types;

// Re-exports
pub use archive::{ArchiveToc, BuildId, FormatError, TocEntry};
pub use descriptor::{DescriptorError, FileEntry, PackDescriptor};
pub use hash::Blake3Hash;
pub use receipt::{InstallReceipt, ReceiptFile};
pub use types::*;

/// Magic bytes opening and closing every inpack archive.
pub const ARCHIVE_MAGIC: [u8; 4] = *b"INPK";

/// Version of the archive container layout.
pub const ARCHIVE_FORMAT_VERSION: u16 = 1;

/// Version of the pack descriptor JSON document.
pub const DESCRIPTOR_FORMAT_VERSION: u32 = 1;
