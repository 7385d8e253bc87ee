//! On-disk layout of a storage tier.
//!
//! Both tiers share the same shape:
//!
//! ```text
//! <tier>/<node>/Complete
//! <tier>/<node>/Manifest.json            default output
//! <tier>/<node>/Manifest-<output>.json   named output
//! <tier>/<node>/Tag-<tag>.json           tag without its leading '#'
//! <tier>/<node>/<archive base>[-NN].zip
//! ```

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::CacheError;

/// File name of the completion marker.
const COMPLETE_MARKER: &str = "Complete";

/// Which tier a layout describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Per-agent storage.
    Local,
    /// Storage reachable by every agent.
    Shared,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Shared => f.write_str("shared"),
        }
    }
}

/// Path derivation and file access for one tier.
#[derive(Debug, Clone)]
pub struct TierLayout {
    root: PathBuf,
    tier: Tier,
}

impl TierLayout {
    /// Creates a layout rooted at `root`.
    pub fn new(root: impl Into<PathBuf>, tier: Tier) -> Self {
        Self {
            root: root.into(),
            tier,
        }
    }

    /// Which tier this is.
    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Directory holding everything stored for `node`.
    pub fn node_dir(&self, node: &str) -> PathBuf {
        self.root.join(node)
    }

    /// Path of the completion marker for `node`.
    pub fn complete_marker(&self, node: &str) -> PathBuf {
        self.node_dir(node).join(COMPLETE_MARKER)
    }

    /// Path of the manifest for `(node, output)`.
    pub fn manifest_path(&self, node: &str, output: &str) -> PathBuf {
        let name = if output.is_empty() {
            "Manifest.json".to_string()
        } else {
            format!("Manifest-{output}.json")
        };
        self.node_dir(node).join(name)
    }

    /// Path of the tag file list for `(node, tag)`.
    pub fn tag_path(&self, node: &str, tag: &str) -> PathBuf {
        self.node_dir(node)
            .join(format!("Tag-{}.json", tag.trim_start_matches('#')))
    }

    /// Reads a whole file, returning `None` if it does not exist.
    pub fn read(&self, path: &Path) -> Result<Option<Vec<u8>>, CacheError> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::io(path, e)),
        }
    }

    /// Creates `dir` and its parents.
    pub fn create_dir(&self, dir: &Path) -> Result<(), CacheError> {
        fs::create_dir_all(dir).map_err(|e| self.write_error(dir, e))
    }

    /// Writes `data` to `path` atomically, creating parent directories.
    ///
    /// Readers observe either the previous contents or the new contents,
    /// never a partial file.
    pub fn write(&self, path: &Path, data: &[u8]) -> Result<(), CacheError> {
        write_atomic(path, data).map_err(|e| self.write_error(path, e))
    }

    /// Maps a write failure to the tier's error kind: shared-tier failures
    /// are [`CacheError::StorageWrite`].
    pub fn write_error(&self, path: &Path, source: io::Error) -> CacheError {
        match self.tier {
            Tier::Local => CacheError::io(path, source),
            Tier::Shared => CacheError::StorageWrite {
                path: path.to_path_buf(),
                source,
            },
        }
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory")
    })?;
    fs::create_dir_all(parent)?;
    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(data)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Checks that `name` can be used as a single path segment.
///
/// `allow_empty` permits the empty default-output name.
pub fn validate_name(name: &str, allow_empty: bool) -> Result<(), CacheError> {
    let reason = if name.is_empty() {
        (!allow_empty).then_some("must not be empty")
    } else if name == "." || name == ".." {
        Some("must not be a relative component")
    } else if name.contains(['/', '\\']) {
        Some("must not contain path separators")
    } else if name.contains('\0') {
        Some("must not contain NUL")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(CacheError::InvalidName {
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}
