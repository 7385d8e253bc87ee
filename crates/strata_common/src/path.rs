//! Root-relative path handling.
//!
//! Manifests store paths relative to the build root with `/` separators
//! regardless of platform, so the same manifest resolves on every agent.

use std::path::{Component, Path};

/// Returns `path` relative to `root` using forward slashes, or `None` if
/// `path` does not lie under `root`.
///
/// Both paths are compared lexically; `.` components are ignored and any
/// `..` component in the remainder rejects the path.
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rest = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rest.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?.to_string()),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Returns `true` if `rel` is in the form [`relative_path`] produces: one or
/// more `/`-separated segments, none of them empty, `.` or `..`, and no
/// backslash or NUL anywhere.
///
/// Such a path always resolves to a location under whatever root it is
/// joined onto.
pub fn is_normalized_relative(rel: &str) -> bool {
    !rel.is_empty()
        && !rel.contains(['\\', '\0'])
        && rel.split('/').all(|segment| !matches!(segment, "" | "." | ".."))
}
