//! Two-tier build-artifact cache for multi-agent build pipelines.
//!
//! Nodes of a build graph archive their outputs into a per-agent local tier
//! and, optionally, a shared tier every agent can reach. Downstream agents
//! retrieve outputs from whichever tier holds them, and retried nodes check
//! whether their previous outputs are still intact before skipping work.

#![warn(missing_docs)]

pub mod cache;
pub mod codec;
pub mod digest;
pub mod duplicate;
pub mod error;
pub mod layout;
pub mod manifest;
pub mod policy;
pub mod record;

pub use cache::ArtifactCache;
pub use codec::ArchiveCodec;
pub use digest::{ContentDigest, Xxh3Digest};
pub use duplicate::DuplicateProductPolicy;
pub use error::{CacheError, ErrorKind};
pub use layout::{Tier, TierLayout};
pub use manifest::{ArchivedContainer, Document, OutputBlock, OutputManifest, TagFileList};
pub use policy::IntegrityPolicy;
pub use record::{Comparison, FileRecord};
