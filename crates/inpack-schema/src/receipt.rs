//! Install receipt written into the target root after a successful deploy.
//!
//! The receipt lists every file a deploy produced so a later deploy can
//! remove files the new build no longer ships, and `uninstall` can remove
//! everything.

use serde::{Deserialize, Serialize};

use crate::archive::BuildId;
use crate::hash::Blake3Hash;

/// Receipt location relative to the target root.
pub const RECEIPT_PATH: &str = ".inpack/receipt.json";

/// One installed file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptFile {
    /// Path relative to the target root, `/`-separated.
    pub path: String,
    /// Checksum of the installed bytes.
    pub checksum: Blake3Hash,
}

/// Record of one completed deploy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallReceipt {
    /// Build that was deployed.
    pub build_id: BuildId,
    /// Files written (or kept) by that deploy.
    pub files: Vec<ReceiptFile>,
}

impl InstallReceipt {
    /// Parse a receipt from JSON.
    ///
    /// # Errors
    ///
    /// Returns the JSON error if the document does not match the schema.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Serialize to pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns the JSON error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Returns `true` if the receipt lists `path`.
    pub fn contains(&self, path: &str) -> bool {
        self.files.iter().any(|f| f.path == path)
    }
}
