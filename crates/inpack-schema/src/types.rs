//! Identifier and path newtypes.

use serde::{Deserialize, Deserializer, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Identifier of a component within a catalog (e.g. `core`, `docs`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentId(String);

impl ComponentId {
    /// Wrap an identifier string.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Return the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ComponentId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ComponentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for ComponentId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<&str> for ComponentId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Errors raised when a container path fails validation.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    /// The path is empty.
    #[error("container path is empty")]
    Empty,

    /// The path is absolute (starts with `/` or a drive prefix).
    #[error("container path '{0}' must be relative")]
    Absolute(String),

    /// The path contains an empty, `.` or `..` segment.
    #[error("container path '{0}' contains an empty, '.' or '..' segment")]
    BadSegment(String),
}

/// Path of an entry inside the archive, always `/`-separated and relative.
///
/// This is the identity used for de-duplication: two artifacts claiming the
/// same `ContainerPath` are the same entry regardless of content.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ContainerPath(String);

impl ContainerPath {
    /// Validate and normalize a container path.
    ///
    /// Backslashes are converted to `/` so catalogs authored on Windows
    /// produce the same archive layout.
    ///
    /// # Errors
    ///
    /// Returns a [`PathError`] if the path is empty, absolute, or contains
    /// `.`/`..`/empty segments.
    pub fn parse(s: &str) -> Result<Self, PathError> {
        let normalized = s.replace('\\', "/");
        if normalized.is_empty() {
            return Err(PathError::Empty);
        }
        if normalized.starts_with('/') || normalized.contains(':') {
            return Err(PathError::Absolute(s.to_string()));
        }
        if normalized
            .split('/')
            .any(|seg| seg.is_empty() || seg == "." || seg == "..")
        {
            return Err(PathError::BadSegment(s.to_string()));
        }
        Ok(Self(normalized))
    }

    /// Join a relative child path onto this one.
    ///
    /// # Errors
    ///
    /// Returns a [`PathError`] if the combined path is invalid.
    pub fn join(&self, child: &str) -> Result<Self, PathError> {
        Self::parse(&format!("{}/{child}", self.0))
    }

    /// Return the path as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterate over the `/`-separated segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }
}

impl fmt::Display for ContainerPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ContainerPath {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for ContainerPath {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Identifier of a codec in the codec registry (`raw`, `zstd`, `gzip`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodecId(String);

impl CodecId {
    /// Stored verbatim.
    pub const RAW: &'static str = "raw";
    /// Zstandard block-compressed stream.
    pub const ZSTD: &'static str = "zstd";
    /// Gzip (deflate) stream.
    pub const GZIP: &'static str = "gzip";

    /// Wrap a codec identifier.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The identity codec.
    pub fn raw() -> Self {
        Self::new(Self::RAW)
    }

    /// Returns `true` if payloads with this codec are stored verbatim.
    pub fn is_raw(&self) -> bool {
        self.0 == Self::RAW
    }

    /// Return the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CodecId {
    fn default() -> Self {
        Self::new(Self::ZSTD)
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CodecId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl Borrow<str> for CodecId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Per-entry deploy flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryFlags {
    /// Only replace an existing target whose modification time is older than
    /// the entry's recorded mtime.
    #[serde(default)]
    pub overwrite_if_newer: bool,
    /// Payload is not in the archive; it is read from an external source tree.
    #[serde(default)]
    pub loose: bool,
    /// Target can only be written with elevated privileges, so the write is
    /// deferred to the commit phase.
    #[serde(default)]
    pub requires_elevation: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_path_normalizes_separators() {
        let p = ContainerPath::parse("bin\\tool.exe").unwrap();
        assert_eq!(p.as_str(), "bin/tool.exe");
        assert_eq!(p.segments().collect::<Vec<_>>(), vec!["bin", "tool.exe"]);
    }

    #[test]
    fn container_path_rejects_escapes() {
        assert_eq!(ContainerPath::parse(""), Err(PathError::Empty));
        assert!(matches!(
            ContainerPath::parse("/etc/passwd"),
            Err(PathError::Absolute(_))
        ));
        assert!(matches!(
            ContainerPath::parse("C:/x"),
            Err(PathError::Absolute(_))
        ));
        assert!(matches!(
            ContainerPath::parse("a/../../b"),
            Err(PathError::BadSegment(_))
        ));
        assert!(matches!(
            ContainerPath::parse("a//b"),
            Err(PathError::BadSegment(_))
        ));
    }

    #[test]
    fn container_path_join() {
        let base = ContainerPath::parse("share/doc").unwrap();
        assert_eq!(base.join("README").unwrap().as_str(), "share/doc/README");
        assert!(base.join("../x").is_err());
    }

    #[test]
    fn entry_flags_default_to_false_when_absent() {
        let flags: EntryFlags = serde_json::from_str("{\"loose\": true}").unwrap();
        assert!(flags.loose);
        assert!(!flags.overwrite_if_newer);
        assert!(!flags.requires_elevation);
    }
}
