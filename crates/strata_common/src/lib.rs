//! Shared foundational types used across the Strata build-artifact cache.
//!
//! This crate provides content hashing, UTC tick timestamps as stored in
//! output manifests, and helpers for root-relative forward-slash paths.

#![warn(missing_docs)]

pub mod hash;
pub mod path;
pub mod ticks;

pub use hash::ContentHash;
pub use path::{is_normalized_relative, relative_path};
pub use ticks::UtcTicks;
