//! Rules for comparing recorded build products against disk.

use std::time::Duration;

use strata_config::IntegrityConfig;

use crate::duplicate::DuplicateProductPolicy;

/// Integrity rules shared by every [`FileRecord`](crate::FileRecord) comparison.
#[derive(Debug, Clone)]
pub struct IntegrityPolicy {
    timestamp_tolerance: Duration,
    always_check_timestamps: Vec<String>,
    digest_suffixes: Vec<String>,
    duplicates: DuplicateProductPolicy,
}

impl IntegrityPolicy {
    /// Builds a policy from its parts.
    pub fn new(
        timestamp_tolerance: Duration,
        always_check_timestamps: Vec<String>,
        digest_suffixes: Vec<String>,
        duplicates: DuplicateProductPolicy,
    ) -> Self {
        Self {
            timestamp_tolerance,
            always_check_timestamps,
            digest_suffixes,
            duplicates,
        }
    }

    /// Builds a policy from the `[integrity]` configuration section.
    pub fn from_config(config: &IntegrityConfig) -> Self {
        Self::new(
            Duration::from_secs(config.timestamp_tolerance_secs),
            config.always_check_timestamps.clone(),
            config.digest_suffixes.clone(),
            DuplicateProductPolicy::new(config.duplicate_products.clone()),
        )
    }

    /// Replaces the duplicate-product allow-list.
    pub fn with_duplicates(mut self, duplicates: DuplicateProductPolicy) -> Self {
        self.duplicates = duplicates;
        self
    }

    /// Maximum tolerated write-time drift.
    pub fn timestamp_tolerance(&self) -> Duration {
        self.timestamp_tolerance
    }

    /// Returns `true` if a content digest is recorded for `relative_path`.
    pub fn requires_digest(&self, relative_path: &str) -> bool {
        let name = file_name(relative_path).to_ascii_lowercase();
        self.digest_suffixes
            .iter()
            .any(|suffix| name.ends_with(&suffix.to_ascii_lowercase()))
    }

    /// Returns `true` if `relative_path` names a duplicate build product.
    pub fn is_duplicate_product(&self, relative_path: &str) -> bool {
        self.duplicates.is_duplicate(file_name(relative_path))
    }

    /// Returns `true` if `relative_path` lies under a fragment whose files
    /// are timestamp-checked even when they are duplicate products.
    pub fn always_checks_timestamp(&self, relative_path: &str) -> bool {
        let rooted = format!("/{}", relative_path.to_ascii_lowercase());
        self.always_check_timestamps
            .iter()
            .any(|fragment| rooted.contains(&fragment.to_ascii_lowercase()))
    }
}

impl Default for IntegrityPolicy {
    fn default() -> Self {
        Self::from_config(&IntegrityConfig::default())
    }
}

fn file_name(relative_path: &str) -> &str {
    relative_path.rsplit('/').next().unwrap_or(relative_path)
}
