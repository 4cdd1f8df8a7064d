//! Byte-stream adapters shared by the builder, unpackers and verifier.

use std::io::{self, Read, Write};

use inpack_schema::Blake3Hash;

/// Reader that hashes and counts everything read through it.
#[derive(Debug)]
pub struct HashingReader<R> {
    inner: R,
    hasher: blake3::Hasher,
    count: u64,
}

impl<R: Read> HashingReader<R> {
    /// Wrap a reader.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: blake3::Hasher::new(),
            count: 0,
        }
    }

    /// Finish, returning the digest and byte count of what was read.
    pub fn finish(self) -> (Blake3Hash, u64) {
        (Blake3Hash::from(self.hasher.finalize()), self.count)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }
}

/// Writer that hashes and counts everything written through it.
#[derive(Debug)]
pub struct HashingWriter<W> {
    inner: W,
    hasher: blake3::Hasher,
    count: u64,
}

impl<W: Write> HashingWriter<W> {
    /// Wrap a writer.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: blake3::Hasher::new(),
            count: 0,
        }
    }

    /// Finish, returning the digest, the byte count and the inner writer.
    pub fn finish(self) -> (Blake3Hash, u64, W) {
        (
            Blake3Hash::from(self.hasher.finalize()),
            self.count,
            self.inner,
        )
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Writer that tracks its absolute position; used to record payload offsets.
#[derive(Debug)]
pub struct CountingWriter<W> {
    inner: W,
    position: u64,
}

impl<W: Write> CountingWriter<W> {
    /// Wrap a writer that is currently at `position`.
    pub fn new(inner: W, position: u64) -> Self {
        Self { inner, position }
    }

    /// Bytes written so far, including the starting position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Unwrap the inner writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.position += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_adapters_agree() {
        let data = b"the same bytes either way";

        let mut reader = HashingReader::new(&data[..]);
        io::copy(&mut reader, &mut io::sink()).unwrap();
        let (read_hash, read_len) = reader.finish();

        let mut writer = HashingWriter::new(Vec::new());
        writer.write_all(data).unwrap();
        let (write_hash, write_len, out) = writer.finish();

        assert_eq!(read_hash, write_hash);
        assert_eq!(read_hash, Blake3Hash::compute(data));
        assert_eq!(read_len, write_len);
        assert_eq!(out, data);
    }

    #[test]
    fn counting_writer_tracks_offset() {
        let mut w = CountingWriter::new(Vec::new(), 8);
        w.write_all(b"abcd").unwrap();
        assert_eq!(w.position(), 12);
        assert_eq!(w.into_inner(), b"abcd");
    }
}
