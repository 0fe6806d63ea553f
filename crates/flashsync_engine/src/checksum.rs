//! Media checksums: lowercase hex SHA-1 of the file bytes.

use sha1::{Digest, Sha1};
use std::io::{self, Read};

/// Checksum of an in-memory buffer.
pub fn checksum(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

/// Checksum of everything `reader` yields.
pub fn checksum_reader(reader: &mut dyn Read) -> io::Result<String> {
    let mut hashing = HashingReader::new(reader);
    io::copy(&mut hashing, &mut io::sink())?;
    Ok(hashing.finish())
}

/// A reader that hashes the bytes passing through it.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha1,
}

impl<R: Read> HashingReader<R> {
    /// Wraps `inner`.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha1::new(),
        }
    }

    /// Returns the checksum of the bytes read so far.
    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}
