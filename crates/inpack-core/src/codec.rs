//! Codec registry.
//!
//! Codecs are registered at compile time under a string id. The id is what
//! gets recorded in the archive and the descriptor, and deploy looks the
//! codec back up by that id before writing anything.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use thiserror::Error;

use inpack_schema::CodecId;

/// Codec lookup failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// No codec is registered under this id.
    #[error("unknown codec '{id}' (available: {available})")]
    Unknown {
        /// Requested id.
        id: CodecId,
        /// Comma-separated list of registered ids.
        available: String,
    },
}

/// Encode/decode strategy for entry payloads.
pub trait Codec: Send + Sync + fmt::Debug {
    /// Registry id recorded in archives.
    fn id(&self) -> &'static str;

    /// Encode everything from `input` into `output`.
    ///
    /// # Errors
    ///
    /// Returns any IO error from either side or from the encoder.
    fn encode(&self, input: &mut dyn Read, output: &mut dyn Write) -> io::Result<()>;

    /// Wrap an encoded stream in a reader yielding the original bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the decoder cannot be initialized.
    fn decoder<'a>(&self, input: Box<dyn Read + 'a>) -> io::Result<Box<dyn Read + 'a>>;
}

/// Identity codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    fn id(&self) -> &'static str {
        CodecId::RAW
    }

    fn encode(&self, input: &mut dyn Read, output: &mut dyn Write) -> io::Result<()> {
        io::copy(input, output)?;
        Ok(())
    }

    fn decoder<'a>(&self, input: Box<dyn Read + 'a>) -> io::Result<Box<dyn Read + 'a>> {
        Ok(input)
    }
}

/// Zstandard block-compressed stream.
#[derive(Debug, Clone, Copy)]
pub struct ZstdCodec {
    level: i32,
}

impl ZstdCodec {
    /// Default compression level, matching the zstd CLI.
    pub const DEFAULT_LEVEL: i32 = 3;

    /// Create a codec encoding at `level`.
    pub fn new(level: i32) -> Self {
        Self {
            level: level.clamp(1, 22),
        }
    }
}

impl Default for ZstdCodec {
    fn default() -> Self {
        Self::new(Self::DEFAULT_LEVEL)
    }
}

impl Codec for ZstdCodec {
    fn id(&self) -> &'static str {
        CodecId::ZSTD
    }

    fn encode(&self, input: &mut dyn Read, output: &mut dyn Write) -> io::Result<()> {
        zstd::stream::copy_encode(input, output, self.level)
    }

    fn decoder<'a>(&self, input: Box<dyn Read + 'a>) -> io::Result<Box<dyn Read + 'a>> {
        Ok(Box::new(zstd::stream::read::Decoder::new(input)?))
    }
}

/// Gzip (deflate) stream.
#[derive(Debug, Clone, Copy)]
pub struct GzipCodec {
    level: u32,
}

impl GzipCodec {
    /// Default compression level.
    pub const DEFAULT_LEVEL: u32 = 6;

    /// Create a codec encoding at `level` (0-9).
    pub fn new(level: u32) -> Self {
        Self {
            level: level.min(9),
        }
    }
}

impl Default for GzipCodec {
    fn default() -> Self {
        Self::new(Self::DEFAULT_LEVEL)
    }
}

impl Codec for GzipCodec {
    fn id(&self) -> &'static str {
        CodecId::GZIP
    }

    fn encode(&self, input: &mut dyn Read, output: &mut dyn Write) -> io::Result<()> {
        let mut encoder = GzEncoder::new(output, Compression::new(self.level));
        io::copy(input, &mut encoder)?;
        encoder.finish()?;
        Ok(())
    }

    fn decoder<'a>(&self, input: Box<dyn Read + 'a>) -> io::Result<Box<dyn Read + 'a>> {
        Ok(Box::new(GzDecoder::new(input)))
    }
}

/// Maps codec ids to implementations.
#[derive(Debug, Clone)]
pub struct CodecRegistry {
    codecs: BTreeMap<&'static str, Arc<dyn Codec>>,
}

impl CodecRegistry {
    /// Registry with every built-in codec at default levels.
    pub fn builtin() -> Self {
        Self::with_levels(ZstdCodec::DEFAULT_LEVEL, GzipCodec::DEFAULT_LEVEL)
    }

    /// Registry with every built-in codec at the given encoder levels.
    pub fn with_levels(zstd_level: i32, gzip_level: u32) -> Self {
        let mut registry = Self {
            codecs: BTreeMap::new(),
        };
        registry.register(Arc::new(RawCodec));
        registry.register(Arc::new(ZstdCodec::new(zstd_level)));
        registry.register(Arc::new(GzipCodec::new(gzip_level)));
        registry
    }

    /// Add or replace a codec under its own id.
    pub fn register(&mut self, codec: Arc<dyn Codec>) {
        self.codecs.insert(codec.id(), codec);
    }

    /// Look up a codec.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Unknown`] if no codec is registered under `id`.
    pub fn get(&self, id: &CodecId) -> Result<Arc<dyn Codec>, CodecError> {
        self.codecs
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| CodecError::Unknown {
                id: id.clone(),
                available: self.ids().join(", "),
            })
    }

    /// Registered ids in sorted order.
    pub fn ids(&self) -> Vec<&'static str> {
        self.codecs.keys().copied().collect()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(codec: &dyn Codec, data: &[u8]) -> Vec<u8> {
        let mut encoded = Vec::new();
        codec.encode(&mut &data[..], &mut encoded).unwrap();

        let mut decoded = Vec::new();
        codec
            .decoder(Box::new(&encoded[..]))
            .unwrap()
            .read_to_end(&mut decoded)
            .unwrap();
        decoded
    }

    #[test]
    fn every_builtin_codec_reproduces_input() {
        let registry = CodecRegistry::builtin();
        let data: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();

        for id in registry.ids() {
            let codec = registry.get(&CodecId::new(id)).unwrap();
            assert_eq!(codec.id(), id);
            assert_eq!(roundtrip(codec.as_ref(), &data), data, "codec {id}");
            assert_eq!(roundtrip(codec.as_ref(), b""), b"", "codec {id} empty");
        }
    }

    #[test]
    fn compressing_codecs_shrink_repetitive_input() {
        let data = vec![b'a'; 100_000];
        for codec in [&ZstdCodec::default() as &dyn Codec, &GzipCodec::default()] {
            let mut encoded = Vec::new();
            codec.encode(&mut &data[..], &mut encoded).unwrap();
            assert!(encoded.len() < data.len() / 10, "{}", codec.id());
        }
    }

    #[test]
    fn unknown_codec_fails_fast() {
        let registry = CodecRegistry::builtin();
        let err = registry.get(&CodecId::new("lzma")).unwrap_err();
        assert!(err.to_string().contains("gzip, raw, zstd"));
    }

    #[test]
    fn corrupt_zstd_stream_errors() {
        let codec = ZstdCodec::default();
        let mut out = Vec::new();
        let result = codec
            .decoder(Box::new(&b"definitely not zstd"[..]))
            .and_then(|mut r| r.read_to_end(&mut out));
        assert!(result.is_err());
    }
}
