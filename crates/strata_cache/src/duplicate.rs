//! Products that several nodes may legitimately overwrite.
//!
//! Some files (shared runtime libraries, agent interop assemblies) are
//! produced by more than one node. Each copy may differ in size or write
//! time while carrying equivalent content, so a mismatch on one of them is
//! reported as a warning instead of failing the integrity check.

use strata_config::ProductPattern;

/// An allow-list of duplicate build product file names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateProductPolicy {
    patterns: Vec<ProductPattern>,
}

impl DuplicateProductPolicy {
    /// Creates a policy from an explicit pattern list.
    pub fn new(patterns: Vec<ProductPattern>) -> Self {
        Self { patterns }
    }

    /// A policy that matches nothing.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Returns the policy extended with one more pattern.
    pub fn with_pattern(mut self, pattern: ProductPattern) -> Self {
        self.patterns.push(pattern);
        self
    }

    /// The configured patterns.
    pub fn patterns(&self) -> &[ProductPattern] {
        &self.patterns
    }

    /// Returns `true` if `file_name` (no directories) matches any pattern.
    pub fn is_duplicate(&self, file_name: &str) -> bool {
        self.patterns.iter().any(|p| matches_pattern(p, file_name))
    }
}

impl Default for DuplicateProductPolicy {
    fn default() -> Self {
        Self::new(strata_config::IntegrityConfig::default().duplicate_products)
    }
}

fn matches_pattern(pattern: &ProductPattern, file_name: &str) -> bool {
    match pattern {
        ProductPattern::Exact { name } => file_name.eq_ignore_ascii_case(name),
        ProductPattern::SharedLibrary { stem } => is_shared_library(stem, file_name),
    }
}

/// Matches `stem.dll`, `stem.dylib`, `libstem.dylib`, `libstem.so` and
/// versioned `libstem.so.N[.M...]`.
fn is_shared_library(stem: &str, file_name: &str) -> bool {
    if file_name.eq_ignore_ascii_case(&format!("{stem}.dll"))
        || file_name == format!("{stem}.dylib")
        || file_name == format!("lib{stem}.dylib")
    {
        return true;
    }
    let Some(rest) = file_name.strip_prefix(&format!("lib{stem}.so")) else {
        return false;
    };
    if rest.is_empty() {
        return true;
    }
    rest.strip_prefix('.').is_some_and(|version| {
        version
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
    })
}
