//! Content hashing for build-product change detection.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read};

/// Size of the buffer used when hashing streamed content.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// A 128-bit content hash computed using XXH3.
///
/// Two files with the same `ContentHash` are assumed to have identical content.
/// The cache records the hex form of this hash as a file digest so that
/// content changes are detected even when a tool preserves timestamps.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash([u8; 16]);

impl ContentHash {
    /// Computes a content hash from a byte slice using XXH3-128.
    pub fn from_bytes(data: &[u8]) -> Self {
        let hash = xxhash_rust::xxh3::xxh3_128(data);
        Self(hash.to_le_bytes())
    }

    /// Computes a content hash by streaming everything `reader` yields.
    ///
    /// Produces the same value as [`ContentHash::from_bytes`] over the
    /// concatenated input, without holding the whole input in memory.
    pub fn from_reader<R: Read>(mut reader: R) -> io::Result<Self> {
        let mut hasher = xxhash_rust::xxh3::Xxh3::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self(hasher.digest128().to_le_bytes()))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}
