//! Configuration types deserialized from `strata.toml`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The top-level cache configuration parsed from `strata.toml`.
///
/// Names the build root products live under, the per-agent local tier, and
/// the optional shared tier every agent can reach.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Root directory that archived build products are relative to.
    pub build_root: PathBuf,
    /// Per-agent storage tier.
    pub local_tier: PathBuf,
    /// Storage tier shared by all agents, if any.
    #[serde(default)]
    pub shared_tier: Option<PathBuf>,
    /// Whether this agent publishes into the shared tier.
    #[serde(default)]
    pub write_to_shared: bool,
    /// Rules applied when comparing recorded files against disk.
    #[serde(default)]
    pub integrity: IntegrityConfig,
    /// Container compression tuning.
    #[serde(default)]
    pub archive: ArchiveConfig,
}

/// Integrity-check tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrityConfig {
    /// Allowed distance between recorded and on-disk write times.
    ///
    /// Two seconds covers filesystems with coarse timestamp resolution.
    pub timestamp_tolerance_secs: u64,
    /// Path fragments whose files always get a timestamp check, even when
    /// they match a duplicate-product pattern.
    pub always_check_timestamps: Vec<String>,
    /// File-name suffixes for which a content digest is recorded.
    pub digest_suffixes: Vec<String>,
    /// Products several nodes may legitimately overwrite.
    pub duplicate_products: Vec<ProductPattern>,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            timestamp_tolerance_secs: 2,
            always_check_timestamps: vec![
                "/Binaries/DotNET/IOS/".to_string(),
                "/Binaries/DotNET/HoloLens/".to_string(),
            ],
            digest_suffixes: vec![".version".to_string(), ".modules".to_string()],
            duplicate_products: default_duplicate_products(),
        }
    }
}

/// A file-name pattern identifying a duplicate build product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProductPattern {
    /// Matches one exact file name.
    Exact {
        /// The file name, without directories.
        name: String,
    },
    /// Matches a shared library under any platform's naming convention.
    SharedLibrary {
        /// Library name without prefix or extension (e.g. `tbb`).
        stem: String,
    },
}

impl ProductPattern {
    /// Shorthand for [`ProductPattern::Exact`].
    pub fn exact(name: impl Into<String>) -> Self {
        Self::Exact { name: name.into() }
    }

    /// Shorthand for [`ProductPattern::SharedLibrary`].
    pub fn shared_library(stem: impl Into<String>) -> Self {
        Self::SharedLibrary { stem: stem.into() }
    }

    /// The name or stem this pattern is built from.
    pub fn key(&self) -> &str {
        match self {
            Self::Exact { name } => name,
            Self::SharedLibrary { stem } => stem,
        }
    }
}

/// Products produced by several nodes with differing size or timestamp but
/// equivalent content.
fn default_duplicate_products() -> Vec<ProductPattern> {
    vec![
        ProductPattern::exact("AgentInterface.dll"),
        ProductPattern::exact("AgentInterface.pdb"),
        ProductPattern::exact("Ionic.Zip.Reduced.dll"),
        ProductPattern::shared_library("dxcompiler"),
        ProductPattern::shared_library("dxil"),
        ProductPattern::shared_library("fbxsdk"),
        ProductPattern::shared_library("ShaderConductor"),
        ProductPattern::shared_library("tbb"),
        ProductPattern::shared_library("tbbmalloc"),
    ]
}

/// Container compression tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Below this many total input bytes a single container is written.
    pub single_container_threshold_bytes: u64,
    /// Number of compression workers; defaults to available parallelism.
    pub workers: Option<usize>,
    /// Deflate level, 0 through 9.
    pub compression_level: u32,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            single_container_threshold_bytes: 32 * 1024 * 1024,
            workers: None,
            compression_level: 1,
        }
    }
}
