//! Two-tier build-artifact cache engine.
//!
//! The `ArtifactCache` type owns every file under the local and shared tier
//! roots. Nodes archive their outputs into it, downstream agents retrieve
//! them, and a retried node asks it whether its previous outputs are still
//! intact. Calls block until done; the only parallelism is inside
//! [`ArchiveCodec`], which joins all its workers before returning.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use strata_config::CacheConfig;
use tracing::{debug, info, warn};

use crate::codec::{ArchiveCodec, CONTAINER_EXTENSION};
use crate::digest::{ContentDigest, Xxh3Digest};
use crate::error::CacheError;
use crate::layout::{validate_name, Tier, TierLayout};
use crate::manifest::{
    decode, encode, ArchivedContainer, Document, OutputBlock, OutputManifest, TagFileList,
};
use crate::policy::IntegrityPolicy;
use crate::record::{Comparison, FileRecord};

/// Base name of containers for a node's default output.
const ARCHIVE_BASE_NAME: &str = "Archive";

/// Build-artifact cache spanning a local tier and an optional shared tier.
///
/// Entries are keyed by node and output (or tag) name. Manifests and tag
/// lists are written once; when both tiers hold a copy, the copies must be
/// byte-identical, and any difference marks the entry as unusable.
pub struct ArtifactCache {
    /// Directory build products live under.
    build_root: PathBuf,

    /// Per-agent tier.
    local: TierLayout,

    /// Tier shared by all agents.
    shared: Option<TierLayout>,

    /// Whether this agent publishes into the shared tier.
    write_to_shared: bool,

    policy: IntegrityPolicy,
    digest: Arc<dyn ContentDigest>,
    codec: ArchiveCodec,
}

impl ArtifactCache {
    /// Creates a cache with default integrity rules, digest, and codec.
    pub fn new(
        build_root: impl Into<PathBuf>,
        local_tier: impl Into<PathBuf>,
        shared_tier: Option<PathBuf>,
        write_to_shared: bool,
    ) -> Self {
        Self {
            build_root: build_root.into(),
            local: TierLayout::new(local_tier, Tier::Local),
            shared: shared_tier.map(|root| TierLayout::new(root, Tier::Shared)),
            write_to_shared,
            policy: IntegrityPolicy::default(),
            digest: Arc::new(Xxh3Digest),
            codec: ArchiveCodec::default(),
        }
    }

    /// Creates a cache from a loaded `strata.toml`.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(
            &config.build_root,
            &config.local_tier,
            config.shared_tier.clone(),
            config.write_to_shared,
        )
        .with_policy(IntegrityPolicy::from_config(&config.integrity))
        .with_codec(ArchiveCodec::from_config(&config.archive))
    }

    /// Replaces the integrity rules.
    pub fn with_policy(mut self, policy: IntegrityPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replaces the content digest.
    pub fn with_digest(mut self, digest: Arc<dyn ContentDigest>) -> Self {
        self.digest = digest;
        self
    }

    /// Replaces the archive codec.
    pub fn with_codec(mut self, codec: ArchiveCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Directory build products live under.
    pub fn build_root(&self) -> &Path {
        &self.build_root
    }

    /// The local tier.
    pub fn local_tier(&self) -> &TierLayout {
        &self.local
    }

    /// The shared tier, if configured.
    pub fn shared_tier(&self) -> Option<&TierLayout> {
        self.shared.as_ref()
    }

    /// The shared tier, if configured and this agent may write to it.
    fn writable_shared(&self) -> Option<&TierLayout> {
        if self.write_to_shared {
            self.shared.as_ref()
        } else {
            None
        }
    }

    /// Records that `node` finished, locally and in the writable shared tier.
    ///
    /// Calling this again for a completed node has no further effect.
    pub fn mark_as_complete(&self, node: &str) -> Result<(), CacheError> {
        validate_name(node, false)?;
        self.local.write(&self.local.complete_marker(node), &[])?;
        if let Some(shared) = self.writable_shared() {
            shared.write(&shared.complete_marker(node), &[])?;
        }
        debug!(node, "marked node complete");
        Ok(())
    }

    /// Returns `true` if either tier holds a completion marker for `node`.
    pub fn is_complete(&self, node: &str) -> bool {
        if validate_name(node, false).is_err() {
            return false;
        }
        self.local.complete_marker(node).is_file()
            || self
                .shared
                .as_ref()
                .is_some_and(|shared| shared.complete_marker(node).is_file())
    }

    /// Deletes everything the local tier holds for `node`.
    pub fn clean_local_node(&self, node: &str) -> Result<(), CacheError> {
        validate_name(node, false)?;
        let dir = self.local.node_dir(node);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                debug!(node, dir = %dir.display(), "cleaned local node");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::io(dir, e)),
        }
    }

    /// Decides whether `node`'s previous run can be reused as-is.
    ///
    /// Requires a local completion marker; for every tag a local tag list
    /// (byte-identical to the shared copy when a shared tier is configured);
    /// for every block those lists reference a local manifest under the
    /// same rule; and every recorded file comparing successfully. Any
    /// failure yields `false`, logged with its reason.
    pub fn check_local_integrity<S: AsRef<str>>(&self, node: &str, tags: &[S]) -> bool {
        if let Err(e) = validate_name(node, false) {
            info!(node, error = %e, "cannot reuse node");
            return false;
        }
        if !self.local.complete_marker(node).is_file() {
            info!(node, "no local completion marker");
            return false;
        }

        let mut blocks = BTreeSet::new();
        for tag in tags {
            let tag = tag.as_ref();
            let list: TagFileList = match validate_tag(tag)
                .map_err(|e| e.to_string())
                .and_then(|()| self.read_consistent(|tier| tier.tag_path(node, tag)))
            {
                Ok(list) => list,
                Err(reason) => {
                    info!(node, tag, %reason, "tag file list is not reusable");
                    return false;
                }
            };
            blocks.extend(list.blocks().iter().cloned());
        }

        for block in &blocks {
            let manifest: OutputManifest = match validate_block(block)
                .map_err(|e| e.to_string())
                .and_then(|()| {
                    self.read_consistent(|tier| {
                        tier.manifest_path(block.node_name(), block.output_name())
                    })
                }) {
                Ok(manifest) => manifest,
                Err(reason) => {
                    info!(node, block = %block, %reason, "output manifest is not reusable");
                    return false;
                }
            };
            for record in manifest.files() {
                match self.compare(record) {
                    Comparison::Match => {}
                    Comparison::Warning(message) => {
                        warn!(node, block = %block, "{message}");
                    }
                    Comparison::Mismatch(message) => {
                        info!(node, block = %block, "{message}");
                        return false;
                    }
                }
            }
        }

        debug!(node, blocks = blocks.len(), "local outputs are intact");
        true
    }

    /// Reads the tag file list for `(node, tag)`.
    ///
    /// Prefers the local copy. Otherwise loads the shared copy and writes it
    /// to the local tier before returning, so later reads need no shared tier.
    pub fn read_file_list(&self, node: &str, tag: &str) -> Result<TagFileList, CacheError> {
        validate_name(node, false)?;
        validate_tag(tag)?;

        let local_path = self.local.tag_path(node, tag);
        if let Some(bytes) = self.local.read(&local_path)? {
            return decode(&bytes, &local_path);
        }

        let missing = || CacheError::Missing {
            what: "tag file list",
            key: format!("{node}/{tag}"),
        };
        let shared = self.shared.as_ref().ok_or_else(missing)?;
        let shared_path = shared.tag_path(node, tag);
        let bytes = shared.read(&shared_path)?.ok_or_else(missing)?;
        let list: TagFileList = decode(&bytes, &shared_path)?;

        self.local.write(&local_path, &bytes)?;
        debug!(node, tag, "promoted shared tag file list");
        Ok(list)
    }

    /// Writes the tag file list for `(node, tag)` locally and, when this
    /// agent writes to the shared tier, there too.
    ///
    /// Files under the build root are stored root-relative; others are kept
    /// as external paths.
    pub fn write_file_list(
        &self,
        node: &str,
        tag: &str,
        files: &[PathBuf],
        blocks: &[OutputBlock],
    ) -> Result<TagFileList, CacheError> {
        validate_name(node, false)?;
        validate_tag(tag)?;
        for block in blocks {
            validate_block(block)?;
        }

        let list = TagFileList::from_files(&self.build_root, files, blocks);
        let bytes = encode(&list)?;

        self.local.write(&self.local.tag_path(node, tag), &bytes)?;
        if let Some(shared) = self.writable_shared() {
            shared.write(&shared.tag_path(node, tag), &bytes)?;
        }
        debug!(
            node,
            tag,
            local_files = list.local_files().len(),
            external_files = list.external_files().len(),
            blocks = list.blocks().len(),
            "wrote tag file list"
        );
        Ok(list)
    }

    /// Records `build_products` as the output `(node, output)`.
    ///
    /// When `push_to_shared` is set and this agent writes to the shared
    /// tier, the products are compressed into containers in the shared node
    /// directory and a shared manifest is written. The local manifest is
    /// always written and is byte-identical to the shared one; local
    /// products themselves stay uncompressed where they are.
    pub fn archive(
        &self,
        node: &str,
        output: &str,
        build_products: &[PathBuf],
        push_to_shared: bool,
    ) -> Result<OutputManifest, CacheError> {
        validate_name(node, false)?;
        validate_name(output, true)?;
        let block = OutputBlock::new(node, output);

        let records = build_products
            .iter()
            .map(|path| {
                FileRecord::capture(&self.build_root, path, &self.policy, self.digest.as_ref())
            })
            .collect::<Result<Vec<_>, CacheError>>()?;
        let records = OutputManifest::new(records, Vec::new()).files().to_vec();

        let target = if push_to_shared {
            let shared = self.writable_shared();
            if shared.is_none() {
                debug!(block = %block, "no writable shared tier; archiving locally only");
            }
            shared
        } else {
            None
        };

        let mut containers = Vec::new();
        if let Some(shared) = target {
            let node_dir = shared.node_dir(node);
            shared.create_dir(&node_dir)?;
            self.remove_previous_containers(shared, node, output)?;

            let inputs: Vec<PathBuf> = records
                .iter()
                .map(|record| record.local_path(&self.build_root))
                .collect();
            let base_name = container_base_name(output);
            for path in self
                .codec
                .compress_many(&inputs, &self.build_root, &node_dir, &base_name)?
            {
                let length = fs::metadata(&path)
                    .map_err(|e| CacheError::archive(&path, e))?
                    .len();
                let name = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .ok_or_else(|| CacheError::archive(&path, "container name is not UTF-8"))?;
                containers.push(ArchivedContainer::new(name, length));
            }
        }

        let manifest = OutputManifest::new(records, containers);
        let bytes = encode(&manifest)?;
        if let Some(shared) = target {
            shared.write(&shared.manifest_path(node, output), &bytes)?;
        }
        self.local.write(&self.local.manifest_path(node, output), &bytes)?;

        info!(
            block = %block,
            files = manifest.files().len(),
            bytes = manifest.total_size(),
            containers = manifest.containers().len(),
            "archived output"
        );
        Ok(manifest)
    }

    /// Makes the output `(node, output)` available under the build root.
    ///
    /// A local manifest is used as-is. Otherwise the shared manifest is
    /// loaded, its containers extracted into the build root, each restored
    /// file stamped with its recorded write time, and the manifest copied to
    /// the local tier. Either way every record must then compare
    /// successfully, or the call fails with [`CacheError::IntegrityMismatch`].
    pub fn retrieve(&self, node: &str, output: &str) -> Result<OutputManifest, CacheError> {
        validate_name(node, false)?;
        validate_name(output, true)?;
        let block = OutputBlock::new(node, output);

        let local_path = self.local.manifest_path(node, output);
        let manifest = match self.local.read(&local_path)? {
            Some(bytes) => {
                debug!(block = %block, "using local manifest");
                decode(&bytes, &local_path)?
            }
            None => self.restore_from_shared(&block, &local_path)?,
        };

        let mut failures = Vec::new();
        for record in manifest.files() {
            match self.compare(record) {
                Comparison::Match => {}
                Comparison::Warning(message) => warn!(block = %block, "{message}"),
                Comparison::Mismatch(message) => failures.push(message),
            }
        }
        if !failures.is_empty() {
            return Err(CacheError::IntegrityMismatch {
                block: block.to_string(),
                details: failures,
            });
        }

        info!(
            block = %block,
            files = manifest.files().len(),
            bytes = manifest.total_size(),
            "retrieved output"
        );
        Ok(manifest)
    }

    fn restore_from_shared(
        &self,
        block: &OutputBlock,
        local_path: &Path,
    ) -> Result<OutputManifest, CacheError> {
        let missing = || CacheError::Missing {
            what: "output manifest",
            key: block.to_string(),
        };
        let shared = self.shared.as_ref().ok_or_else(missing)?;
        let shared_path = shared.manifest_path(block.node_name(), block.output_name());
        let bytes = shared.read(&shared_path)?.ok_or_else(missing)?;
        let manifest: OutputManifest = decode(&bytes, &shared_path)?;

        let node_dir = shared.node_dir(block.node_name());
        let containers = manifest
            .containers()
            .iter()
            .map(|container| {
                let path = node_dir.join(container.name());
                let length = fs::metadata(&path)
                    .map_err(|e| {
                        CacheError::corruption(&path, format!("container unavailable: {e}"))
                    })?
                    .len();
                if length != container.length() {
                    let expected = container.length();
                    return Err(CacheError::corruption(
                        &path,
                        format!("container is {length} bytes, manifest says {expected}"),
                    ));
                }
                Ok(path)
            })
            .collect::<Result<Vec<_>, CacheError>>()?;

        self.codec.decompress_many(&containers, &self.build_root)?;
        for record in manifest.files() {
            if record.local_path(&self.build_root).is_file() {
                record.restamp(&self.build_root)?;
            }
        }

        self.local.write(local_path, &bytes)?;
        debug!(
            block = %block,
            containers = containers.len(),
            "restored output from shared tier"
        );
        Ok(manifest)
    }

    /// Retires the previously pushed version of `(node, output)`.
    ///
    /// The shared manifest goes first, so the shared tier never lists
    /// containers that are gone. Its containers are then deleted; when the
    /// old manifest cannot be parsed, every container named after the
    /// output's base name is deleted instead.
    fn remove_previous_containers(
        &self,
        shared: &TierLayout,
        node: &str,
        output: &str,
    ) -> Result<(), CacheError> {
        let manifest_path = shared.manifest_path(node, output);
        let Some(bytes) = shared.read(&manifest_path)? else {
            return Ok(());
        };
        remove_if_present(shared, &manifest_path)?;

        let node_dir = shared.node_dir(node);
        let stale: Vec<PathBuf> = match decode::<OutputManifest>(&bytes, &manifest_path) {
            Ok(previous) => previous
                .containers()
                .iter()
                .map(|container| node_dir.join(container.name()))
                .collect(),
            Err(e) => {
                warn!(
                    path = %manifest_path.display(),
                    error = %e,
                    "previous manifest is unreadable; removing containers by name"
                );
                let base_name = container_base_name(output);
                let entries = fs::read_dir(&node_dir).map_err(|e| CacheError::io(&node_dir, e))?;
                let mut stale = Vec::new();
                for entry in entries {
                    let entry = entry.map_err(|e| CacheError::io(&node_dir, e))?;
                    if entry
                        .file_name()
                        .to_str()
                        .is_some_and(|name| is_container_of(name, &base_name))
                    {
                        stale.push(entry.path());
                    }
                }
                stale
            }
        };
        for path in stale {
            remove_if_present(shared, &path)?;
            debug!(container = %path.display(), "removed previous container");
        }
        Ok(())
    }

    fn compare(&self, record: &FileRecord) -> Comparison {
        record.compare(&self.build_root, &self.policy, self.digest.as_ref())
    }

    /// Loads a document that must exist locally and, when a shared tier is
    /// configured, exist there with identical bytes.
    fn read_consistent<T: Document>(
        &self,
        path_of: impl Fn(&TierLayout) -> PathBuf,
    ) -> Result<T, String> {
        let local_path = path_of(&self.local);
        let local = match self.local.read(&local_path) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Err(missing_copy(&self.local, &local_path)),
            Err(e) => return Err(e.to_string()),
        };
        if let Some(shared) = &self.shared {
            let shared_path = path_of(shared);
            match shared.read(&shared_path) {
                Ok(Some(bytes)) if bytes == local => {}
                Ok(Some(_)) => {
                    return Err(format!(
                        "{} differs from {}",
                        local_path.display(),
                        shared_path.display()
                    ))
                }
                Ok(None) => return Err(missing_copy(shared, &shared_path)),
                Err(e) => return Err(e.to_string()),
            }
        }
        decode(&local, &local_path).map_err(|e| e.to_string())
    }
}

fn container_base_name(output: &str) -> String {
    if output.is_empty() {
        ARCHIVE_BASE_NAME.to_string()
    } else {
        format!("{ARCHIVE_BASE_NAME}-{output}")
    }
}

/// Returns `true` if `name` is a container written for `base_name`, either
/// `<base>.zip` or `<base>-NN.zip`.
fn is_container_of(name: &str, base_name: &str) -> bool {
    let Some(stem) = name
        .strip_suffix(CONTAINER_EXTENSION)
        .and_then(|stem| stem.strip_suffix('.'))
    else {
        return false;
    };
    match stem.strip_prefix(base_name) {
        Some("") => true,
        Some(rest) => rest
            .strip_prefix('-')
            .is_some_and(|index| index.len() >= 2 && index.bytes().all(|b| b.is_ascii_digit())),
        None => false,
    }
}

fn missing_copy(tier: &TierLayout, path: &Path) -> String {
    format!("{} copy {} is missing", tier.tier(), path.display())
}

fn remove_if_present(tier: &TierLayout, path: &Path) -> Result<(), CacheError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(tier.write_error(path, e)),
    }
}

fn validate_tag(tag: &str) -> Result<(), CacheError> {
    validate_name(tag.trim_start_matches('#'), false)
}

fn validate_block(block: &OutputBlock) -> Result<(), CacheError> {
    validate_name(block.node_name(), false)?;
    validate_name(block.output_name(), true)
}
