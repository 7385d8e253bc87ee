//! Pluggable content digests for recorded build products.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use strata_common::ContentHash;

use crate::error::CacheError;

/// Computes a content digest for a file on disk.
///
/// A digest is recorded for files whose timestamps are not trusted to
/// reflect content changes. Implementations must be deterministic: the same
/// bytes always produce the same string.
pub trait ContentDigest: Send + Sync {
    /// Returns the digest of the file at `path`.
    fn digest_file(&self, path: &Path) -> Result<String, CacheError>;
}

/// Default digest: XXH3-128 over the file's bytes, as lowercase hex.
#[derive(Debug, Default, Clone, Copy)]
pub struct Xxh3Digest;

impl ContentDigest for Xxh3Digest {
    fn digest_file(&self, path: &Path) -> Result<String, CacheError> {
        let file = File::open(path).map_err(|e| CacheError::io(path, e))?;
        let hash = ContentHash::from_reader(BufReader::new(file))
            .map_err(|e| CacheError::io(path, e))?;
        Ok(hash.to_string())
    }
}
