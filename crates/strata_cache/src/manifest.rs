//! Output manifests and tag file lists.
//!
//! Both are plain immutable values serialized as pretty-printed JSON. Two
//! documents are considered identical exactly when their serialized bytes
//! are, which is what the local/shared consistency check relies on.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use strata_common::{is_normalized_relative, relative_path};

use crate::error::CacheError;
use crate::layout::validate_name;
use crate::record::FileRecord;

/// Identity of one node's output: `(node name, output name)`.
///
/// The empty output name denotes the node's default output.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OutputBlock {
    node_name: String,
    output_name: String,
}

impl OutputBlock {
    /// Creates a block key.
    pub fn new(node_name: impl Into<String>, output_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            output_name: output_name.into(),
        }
    }

    /// The producing node.
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// The output name, empty for the default output.
    pub fn output_name(&self) -> &str {
        &self.output_name
    }
}

impl fmt::Display for OutputBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.output_name.is_empty() {
            write!(f, "{}", self.node_name)
        } else {
            write!(f, "{}/{}", self.node_name, self.output_name)
        }
    }
}

/// A compressed container holding part of an output block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ArchivedContainer {
    name: String,
    length: u64,
}

impl ArchivedContainer {
    /// Records a container's file name and size.
    pub fn new(name: impl Into<String>, length: u64) -> Self {
        Self {
            name: name.into(),
            length,
        }
    }

    /// File name within the node directory.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size in bytes.
    pub fn length(&self) -> u64 {
        self.length
    }
}

/// The files making up one output block, plus the containers they were
/// compressed into when the block was pushed to the shared tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OutputManifest {
    files: Vec<FileRecord>,
    #[serde(default)]
    zip_files: Vec<ArchivedContainer>,
}

impl OutputManifest {
    /// Creates a manifest; records are sorted and deduplicated by path.
    pub fn new(mut files: Vec<FileRecord>, containers: Vec<ArchivedContainer>) -> Self {
        files.sort_by(|a, b| a.relative_path().cmp(b.relative_path()));
        files.dedup_by(|a, b| a.relative_path() == b.relative_path());
        Self {
            files,
            zip_files: containers,
        }
    }

    /// The recorded files, ordered by relative path.
    pub fn files(&self) -> &[FileRecord] {
        &self.files
    }

    /// The containers holding the compressed files.
    pub fn containers(&self) -> &[ArchivedContainer] {
        &self.zip_files
    }

    /// Total recorded size of all files in bytes.
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(FileRecord::length).sum()
    }
}

/// Files a node declares under a tag, and the output blocks they live in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TagFileList {
    local_files: Vec<String>,
    external_files: Vec<String>,
    blocks: Vec<OutputBlock>,
}

impl TagFileList {
    /// Creates a list from already-split paths; every set is sorted and
    /// deduplicated.
    pub fn new(
        local_files: impl IntoIterator<Item = String>,
        external_files: impl IntoIterator<Item = String>,
        blocks: impl IntoIterator<Item = OutputBlock>,
    ) -> Self {
        Self {
            local_files: local_files.into_iter().collect::<BTreeSet<_>>().into_iter().collect(),
            external_files: external_files
                .into_iter()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
            blocks: blocks.into_iter().collect::<BTreeSet<_>>().into_iter().collect(),
        }
    }

    /// Splits `files` into those under `root` (stored root-relative) and
    /// external ones (stored as given).
    pub fn from_files(root: &Path, files: &[PathBuf], blocks: &[OutputBlock]) -> Self {
        let mut local = Vec::new();
        let mut external = Vec::new();
        for file in files {
            let absolute = if file.is_absolute() {
                file.clone()
            } else {
                root.join(file)
            };
            match relative_path(root, &absolute) {
                Some(rel) => local.push(rel),
                None => external.push(absolute.to_string_lossy().into_owned()),
            }
        }
        Self::new(local, external, blocks.iter().cloned())
    }

    /// Root-relative paths of files under the build root.
    pub fn local_files(&self) -> &[String] {
        &self.local_files
    }

    /// Paths of files outside the build root.
    pub fn external_files(&self) -> &[String] {
        &self.external_files
    }

    /// Output blocks holding the tagged files.
    pub fn blocks(&self) -> &[OutputBlock] {
        &self.blocks
    }

    /// Resolves every listed file to a path, local entries against `root`.
    pub fn to_file_set(&self, root: &Path) -> BTreeSet<PathBuf> {
        let local = self
            .local_files
            .iter()
            .map(|rel| rel.split('/').fold(root.to_path_buf(), |p, part| p.join(part)));
        let external = self.external_files.iter().map(PathBuf::from);
        local.chain(external).collect()
    }
}

/// A persisted document whose parsed contents must be checked before use.
///
/// Paths inside a document are joined onto the build root or a tier
/// directory, so a document read from storage is only trusted once every
/// path in it is known to stay beneath the directory it is joined onto.
pub trait Document: Serialize + DeserializeOwned {
    /// Describes the first structural problem, if any.
    fn validate(&self) -> Result<(), String>;
}

impl Document for OutputManifest {
    fn validate(&self) -> Result<(), String> {
        if let Some(record) = self
            .files
            .iter()
            .find(|record| !is_normalized_relative(record.relative_path()))
        {
            return Err(format!(
                "file path '{}' does not stay under the build root",
                record.relative_path()
            ));
        }
        for container in &self.zip_files {
            validate_name(container.name(), false).map_err(|e| format!("container {e}"))?;
        }
        Ok(())
    }
}

impl Document for TagFileList {
    fn validate(&self) -> Result<(), String> {
        if let Some(rel) = self.local_files.iter().find(|rel| !is_normalized_relative(rel)) {
            return Err(format!("local file '{rel}' does not stay under the build root"));
        }
        for block in &self.blocks {
            validate_name(block.node_name(), false)
                .and_then(|()| validate_name(block.output_name(), true))
                .map_err(|e| format!("block {e}"))?;
        }
        Ok(())
    }
}

/// Serializes a manifest or tag list to its on-disk bytes.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CacheError> {
    let mut bytes = serde_json::to_vec_pretty(value).map_err(|e| CacheError::Serialization {
        reason: e.to_string(),
    })?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Parses and validates on-disk bytes read from `path`; failures are
/// corruption.
pub fn decode<T: Document>(bytes: &[u8], path: &Path) -> Result<T, CacheError> {
    let value: T =
        serde_json::from_slice(bytes).map_err(|e| CacheError::corruption(path, e.to_string()))?;
    value
        .validate()
        .map_err(|reason| CacheError::corruption(path, reason))?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::UtcTicks;

    fn record(path: &str, len: u64) -> FileRecord {
        FileRecord::new(path, UtcTicks::new(100), len, None)
    }

    #[test]
    fn output_block_display() {
        assert_eq!(OutputBlock::new("Compile", "").to_string(), "Compile");
        assert_eq!(OutputBlock::new("Compile", "Bin").to_string(), "Compile/Bin");
    }

    #[test]
    fn manifest_sorts_and_dedups_files() {
        let manifest = OutputManifest::new(
            vec![record("b.bin", 1), record("a.bin", 2), record("b.bin", 1)],
            Vec::new(),
        );
        let paths: Vec<_> = manifest.files().iter().map(|f| f.relative_path()).collect();
        assert_eq!(paths, vec!["a.bin", "b.bin"]);
        assert_eq!(manifest.total_size(), 3);
    }

    #[test]
    fn manifest_schema_field_names() {
        let manifest = OutputManifest::new(
            vec![record("out/a.bin", 10)],
            vec![ArchivedContainer::new("Archive.zip", 7)],
        );
        let text = String::from_utf8(encode(&manifest).unwrap()).unwrap();
        assert!(text.contains("\"Files\""));
        assert!(text.contains("\"ZipFiles\""));
        assert!(text.contains("\"Name\": \"Archive.zip\""));
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn identical_manifests_encode_identically() {
        let a = OutputManifest::new(vec![record("x", 1), record("y", 2)], Vec::new());
        let b = OutputManifest::new(vec![record("y", 2), record("x", 1)], Vec::new());
        assert_eq!(encode(&a).unwrap(), encode(&b).unwrap());
    }

    #[test]
    fn decode_roundtrip() {
        let manifest = OutputManifest::new(
            vec![FileRecord::new("v/Build.version", UtcTicks::new(5), 9, Some("ff".into()))],
            vec![ArchivedContainer::new("Archive-00.zip", 100)],
        );
        let bytes = encode(&manifest).unwrap();
        let back: OutputManifest = decode(&bytes, Path::new("Manifest.json")).unwrap();
        assert_eq!(back, manifest);
    }

    #[test]
    fn decode_garbage_is_corruption() {
        let err = decode::<OutputManifest>(b"<xml/>", Path::new("Manifest.json")).unwrap_err();
        assert!(matches!(err, CacheError::Corruption { .. }));
    }

    #[test]
    fn manifest_without_containers_field_parses() {
        let text = r#"{"Files":[{"RelativePath":"a","LastWriteTimeUtcTicks":1,"Length":2}]}"#;
        let manifest: OutputManifest = decode(text.as_bytes(), Path::new("m")).unwrap();
        assert_eq!(manifest.files().len(), 1);
        assert!(manifest.containers().is_empty());
    }

    #[test]
    fn manifest_paths_escaping_the_root_are_corruption() {
        for rel in ["../outside.txt", "/etc/passwd", "out/../../x", "out\\..\\x", "out//a"] {
            let manifest = OutputManifest::new(vec![record(rel, 1)], Vec::new());
            let bytes = encode(&manifest).unwrap();
            let err = decode::<OutputManifest>(&bytes, Path::new("Manifest.json")).unwrap_err();
            assert!(matches!(err, CacheError::Corruption { .. }), "{rel}: {err}");
        }
    }

    #[test]
    fn container_names_must_be_plain_file_names() {
        let manifest = OutputManifest::new(
            vec![record("a.bin", 1)],
            vec![ArchivedContainer::new("../Other/Archive.zip", 10)],
        );
        let bytes = encode(&manifest).unwrap();
        let err = decode::<OutputManifest>(&bytes, Path::new("Manifest.json")).unwrap_err();
        assert!(err.to_string().contains("container"), "{err}");
    }

    #[test]
    fn tag_list_local_files_and_blocks_are_checked() {
        let escaping = TagFileList::new(vec!["../x".to_string()], Vec::new(), Vec::new());
        let bytes = encode(&escaping).unwrap();
        assert!(decode::<TagFileList>(&bytes, Path::new("Tag-A.json")).is_err());

        let bad_block = TagFileList::new(
            vec!["a".to_string()],
            vec!["/sdk/../tool".to_string()],
            vec![OutputBlock::new("..", "")],
        );
        let bytes = encode(&bad_block).unwrap();
        assert!(decode::<TagFileList>(&bytes, Path::new("Tag-A.json")).is_err());

        let external_only =
            TagFileList::new(Vec::new(), vec!["/sdk/../tool".to_string()], Vec::new());
        let bytes = encode(&external_only).unwrap();
        assert!(decode::<TagFileList>(&bytes, Path::new("Tag-A.json")).is_ok());
    }

    #[test]
    fn tag_list_splits_local_and_external() {
        let root = PathBuf::from("/build");
        let files = vec![
            root.join("out").join("b.bin"),
            PathBuf::from("out/a.bin"),
            PathBuf::from("/sdk/tool.exe"),
            root.join("out").join("b.bin"),
        ];
        let blocks = vec![OutputBlock::new("Compile", "Bin"), OutputBlock::new("Compile", "")];
        let list = TagFileList::from_files(&root, &files, &blocks);
        assert_eq!(list.local_files(), ["out/a.bin", "out/b.bin"]);
        assert_eq!(list.external_files(), ["/sdk/tool.exe"]);
        assert_eq!(list.blocks()[0], OutputBlock::new("Compile", ""));
        assert_eq!(list.blocks().len(), 2);
    }

    #[test]
    fn tag_list_file_set_resolves_local_entries() {
        let root = PathBuf::from("/build");
        let list = TagFileList::new(
            vec!["out/a.bin".to_string()],
            vec!["/sdk/tool.exe".to_string()],
            Vec::new(),
        );
        let set = list.to_file_set(&root);
        assert!(set.contains(&root.join("out").join("a.bin")));
        assert!(set.contains(&PathBuf::from("/sdk/tool.exe")));
    }

    #[test]
    fn tag_list_schema_field_names() {
        let list = TagFileList::new(
            vec!["a".to_string()],
            Vec::new(),
            vec![OutputBlock::new("Cook", "Win64")],
        );
        let text = String::from_utf8(encode(&list).unwrap()).unwrap();
        assert!(text.contains("\"LocalFiles\""));
        assert!(text.contains("\"ExternalFiles\""));
        assert!(text.contains("\"NodeName\": \"Cook\""));
        assert!(text.contains("\"OutputName\": \"Win64\""));
    }
}
