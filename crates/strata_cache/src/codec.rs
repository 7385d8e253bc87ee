//! Parallel compression of build products into zip containers.
//!
//! Small output sets go into a single container. Larger ones are sorted by
//! size, largest first, and fed through a shared queue drained by a fixed
//! pool of workers. Each worker writes its own container, so the bytes per
//! container even out despite large differences in file size. Containers
//! are independent and are extracted in parallel, one thread each.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::thread;

use crossbeam_channel::Receiver;
use strata_common::relative_path;
use strata_config::ArchiveConfig;
use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::CacheError;

/// File extension of containers.
pub const CONTAINER_EXTENSION: &str = "zip";

/// Files at or above this size need zip64 entries.
const ZIP64_THRESHOLD: u64 = u32::MAX as u64;

/// Permission and special bits of a Unix mode, without the file type.
#[cfg(unix)]
const PERMISSION_BITS: u32 = 0o7777;

/// Stateless compress/decompress utility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveCodec {
    single_container_threshold: u64,
    workers: usize,
    compression_level: u32,
}

impl ArchiveCodec {
    /// Creates a codec. `workers` is clamped to at least one.
    pub fn new(single_container_threshold: u64, workers: usize, compression_level: u32) -> Self {
        Self {
            single_container_threshold,
            workers: workers.max(1),
            compression_level,
        }
    }

    /// Builds a codec from the `[archive]` configuration section.
    pub fn from_config(config: &ArchiveConfig) -> Self {
        Self::new(
            config.single_container_threshold_bytes,
            config.workers.unwrap_or_else(available_workers),
            config.compression_level,
        )
    }

    /// Number of compression workers.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Compresses `files` (all under `root_dir`) into containers in
    /// `output_dir` named after `base_name`, returning the container paths
    /// in name order.
    ///
    /// Entries are stored under their root-relative forward-slash paths.
    /// A worker that receives no files creates no container.
    pub fn compress_many(
        &self,
        files: &[PathBuf],
        root_dir: &Path,
        output_dir: &Path,
        base_name: &str,
    ) -> Result<Vec<PathBuf>, CacheError> {
        let mut inputs = files
            .iter()
            .map(|path| {
                let name = relative_path(root_dir, path).ok_or_else(|| CacheError::OutsideRoot {
                    path: path.clone(),
                    root: root_dir.to_path_buf(),
                })?;
                let metadata = fs::metadata(path).map_err(|e| CacheError::io(path, e))?;
                Ok(ArchiveInput {
                    path: path.clone(),
                    name,
                    length: metadata.len(),
                    mode: unix_mode(&metadata),
                })
            })
            .collect::<Result<Vec<_>, CacheError>>()?;

        let total: u64 = inputs.iter().map(|input| input.length).sum();
        if total < self.single_container_threshold || self.workers == 1 {
            let container = output_dir.join(format!("{base_name}.{CONTAINER_EXTENSION}"));
            if let Err(e) = self.write_single(&container, &inputs) {
                discard_containers(std::slice::from_ref(&container));
                return Err(e);
            }
            debug!(
                container = %container.display(),
                files = inputs.len(),
                bytes = total,
                "wrote single container"
            );
            return Ok(vec![container]);
        }

        inputs.sort_by(|a, b| b.length.cmp(&a.length));
        let (sender, receiver) = crossbeam_channel::unbounded();
        for input in inputs {
            // The receiver is alive for the whole loop.
            let _ = sender.send(input);
        }
        drop(sender);

        let paths: Vec<PathBuf> = (0..self.workers)
            .map(|index| output_dir.join(format!("{base_name}-{index:02}.{CONTAINER_EXTENSION}")))
            .collect();
        let results: Vec<Result<Option<PathBuf>, CacheError>> = thread::scope(|scope| {
            let handles: Vec<_> = paths
                .iter()
                .map(|container| {
                    let receiver = receiver.clone();
                    scope.spawn(move || self.drain_queue(&receiver, container))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        Err(CacheError::archive(output_dir, "compression worker panicked"))
                    })
                })
                .collect()
        });

        let mut containers = Vec::new();
        let mut failure = None;
        for result in results {
            match result {
                Ok(Some(container)) => containers.push(container),
                Ok(None) => {}
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(e) = failure {
            discard_containers(&paths);
            return Err(e);
        }
        containers.sort();
        debug!(
            containers = containers.len(),
            bytes = total,
            workers = self.workers,
            "wrote parallel containers"
        );
        Ok(containers)
    }

    /// Extracts every container into `root_dir`, one thread per container,
    /// and returns the extracted file paths.
    ///
    /// A pre-existing destination file is deleted first, even when it is
    /// read-only, so extracted bytes always replace it.
    pub fn decompress_many(
        &self,
        containers: &[PathBuf],
        root_dir: &Path,
    ) -> Result<Vec<PathBuf>, CacheError> {
        let results: Vec<Result<Vec<PathBuf>, CacheError>> = thread::scope(|scope| {
            let handles: Vec<_> = containers
                .iter()
                .map(|container| scope.spawn(move || extract_container(container, root_dir)))
                .collect();
            handles
                .into_iter()
                .zip(containers)
                .map(|(handle, container)| {
                    handle.join().unwrap_or_else(|_| {
                        Err(CacheError::archive(container, "extraction worker panicked"))
                    })
                })
                .collect()
        });

        let mut extracted = Vec::new();
        for result in results {
            extracted.extend(result?);
        }
        Ok(extracted)
    }

    /// Pulls files off the queue until it is empty, lazily creating the
    /// container on the first file.
    fn drain_queue(
        &self,
        receiver: &Receiver<ArchiveInput>,
        container: &Path,
    ) -> Result<Option<PathBuf>, CacheError> {
        let mut writer = None;
        while let Ok(input) = receiver.try_recv() {
            if writer.is_none() {
                writer = Some(self.create_container(container)?);
            }
            if let Some(zip) = writer.as_mut() {
                self.append(zip, container, &input)?;
            }
        }
        match writer {
            Some(zip) => {
                finish_container(zip, container)?;
                Ok(Some(container.to_path_buf()))
            }
            None => Ok(None),
        }
    }

    fn write_single(&self, container: &Path, inputs: &[ArchiveInput]) -> Result<(), CacheError> {
        let mut writer = self.create_container(container)?;
        for input in inputs {
            self.append(&mut writer, container, input)?;
        }
        finish_container(writer, container)
    }

    fn create_container(&self, container: &Path) -> Result<ZipWriter<BufWriter<File>>, CacheError> {
        let file = File::create(container).map_err(|e| CacheError::archive(container, e))?;
        Ok(ZipWriter::new(BufWriter::new(file)))
    }

    fn append(
        &self,
        writer: &mut ZipWriter<BufWriter<File>>,
        container: &Path,
        input: &ArchiveInput,
    ) -> Result<(), CacheError> {
        let mut options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(i64::from(self.compression_level)))
            .large_file(input.length >= ZIP64_THRESHOLD);
        if let Some(mode) = input.mode {
            options = options.unix_permissions(mode);
        }
        writer
            .start_file(input.name.clone(), options)
            .map_err(|e| CacheError::archive(container, e))?;
        let mut source = File::open(&input.path).map_err(|e| CacheError::io(&input.path, e))?;
        io::copy(&mut source, writer).map_err(|e| {
            CacheError::archive(container, format!("adding {}: {e}", input.name))
        })?;
        Ok(())
    }
}

impl Default for ArchiveCodec {
    fn default() -> Self {
        Self::from_config(&ArchiveConfig::default())
    }
}

/// One file queued for compression.
#[derive(Debug)]
struct ArchiveInput {
    path: PathBuf,
    name: String,
    length: u64,
    mode: Option<u32>,
}

fn available_workers() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

/// Deletes containers written by a failed call so no partial set is left
/// behind. Containers that were never created are skipped.
fn discard_containers(containers: &[PathBuf]) {
    for container in containers {
        match fs::remove_file(container) {
            Ok(()) => debug!(container = %container.display(), "discarded container"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                container = %container.display(),
                error = %e,
                "failed to discard container"
            ),
        }
    }
}

fn finish_container(
    writer: ZipWriter<BufWriter<File>>,
    container: &Path,
) -> Result<(), CacheError> {
    let buffered = writer
        .finish()
        .map_err(|e| CacheError::archive(container, e))?;
    let file = buffered
        .into_inner()
        .map_err(|e| CacheError::archive(container, e.error()))?;
    file.sync_all().map_err(|e| CacheError::archive(container, e))
}

fn extract_container(container: &Path, root_dir: &Path) -> Result<Vec<PathBuf>, CacheError> {
    let file = File::open(container).map_err(|e| CacheError::archive(container, e))?;
    let mut archive =
        ZipArchive::new(BufReader::new(file)).map_err(|e| CacheError::archive(container, e))?;

    let mut extracted = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| CacheError::archive(container, e))?;
        let name = entry.enclosed_name().ok_or_else(|| {
            CacheError::archive(container, format!("unsafe entry name '{}'", entry.name()))
        })?;
        let destination = root_dir.join(name);
        if entry.is_dir() {
            fs::create_dir_all(&destination).map_err(|e| CacheError::io(&destination, e))?;
            continue;
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
        }
        remove_existing(&destination)?;
        let mut output = File::create(&destination).map_err(|e| CacheError::io(&destination, e))?;
        io::copy(&mut entry, &mut output).map_err(|e| {
            CacheError::archive(container, format!("extracting {}: {e}", destination.display()))
        })?;
        drop(output);
        if let Some(mode) = entry.unix_mode() {
            set_unix_mode(&destination, mode)?;
        }
        extracted.push(destination);
    }
    debug!(container = %container.display(), files = extracted.len(), "extracted container");
    Ok(extracted)
}

/// Permission bits of a source file, stored with its entry.
#[cfg(unix)]
fn unix_mode(metadata: &fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(metadata.permissions().mode() & PERMISSION_BITS)
}

#[cfg(not(unix))]
fn unix_mode(_metadata: &fs::Metadata) -> Option<u32> {
    None
}

#[cfg(unix)]
fn set_unix_mode(path: &Path, mode: u32) -> Result<(), CacheError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & PERMISSION_BITS))
        .map_err(|e| CacheError::io(path, e))
}

#[cfg(not(unix))]
fn set_unix_mode(_path: &Path, _mode: u32) -> Result<(), CacheError> {
    Ok(())
}

/// Deletes `path` if it exists, clearing a read-only flag first.
#[allow(clippy::permissions_set_readonly_false)]
fn remove_existing(path: &Path) -> Result<(), CacheError> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(CacheError::io(path, e)),
    };
    let mut permissions = metadata.permissions();
    if permissions.readonly() {
        permissions.set_readonly(false);
        fs::set_permissions(path, permissions).map_err(|e| CacheError::io(path, e))?;
    }
    fs::remove_file(path).map_err(|e| CacheError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, len: usize, seed: u8) -> PathBuf {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let data: Vec<u8> = (0..len)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect();
        fs::write(&path, data).unwrap();
        path
    }

    fn fixture(root: &Path) -> Vec<PathBuf> {
        vec![
            write(root, "out/big.bin", 300_000, 1),
            write(root, "out/medium.bin", 120_000, 2),
            write(root, "out/sub/small.bin", 4_000, 3),
            write(root, "out/sub/tiny.txt", 10, 4),
            write(root, "empty.dat", 0, 5),
        ]
    }

    fn assert_restored(files: &[PathBuf], source_root: &Path, dest_root: &Path) {
        for file in files {
            let rel = file.strip_prefix(source_root).unwrap();
            let restored = dest_root.join(rel);
            assert_eq!(fs::read(file).unwrap(), fs::read(&restored).unwrap(), "{rel:?}");
        }
    }

    #[test]
    fn small_input_writes_one_container() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let files = fixture(src.path());
        let codec = ArchiveCodec::new(u64::MAX, 4, 1);

        let containers = codec
            .compress_many(&files, src.path(), out.path(), "Archive")
            .unwrap();
        assert_eq!(containers, vec![out.path().join("Archive.zip")]);
    }

    #[cfg(unix)]
    fn mode(path: &Path) -> u32 {
        use std::os::unix::fs::PermissionsExt;
        fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[cfg(unix)]
    fn set_mode(path: &Path, mode: u32) {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
    }

    #[test]
    fn parallel_roundtrip_for_any_worker_count() {
        let src = tempfile::tempdir().unwrap();
        let files = fixture(src.path());
        #[cfg(unix)]
        {
            set_mode(&files[1], 0o755);
            set_mode(&files[3], 0o600);
        }

        for workers in [1, 2, 3, 8] {
            let out = tempfile::tempdir().unwrap();
            let dest = tempfile::tempdir().unwrap();
            let codec = ArchiveCodec::new(0, workers, 1);

            let containers = codec
                .compress_many(&files, src.path(), out.path(), "Archive")
                .unwrap();
            assert!(!containers.is_empty());
            assert!(containers.len() <= workers);

            let extracted = codec.decompress_many(&containers, dest.path()).unwrap();
            assert_eq!(extracted.len(), files.len());
            assert_restored(&files, src.path(), dest.path());
            #[cfg(unix)]
            for file in &files {
                let rel = file.strip_prefix(src.path()).unwrap();
                assert_eq!(mode(&dest.path().join(rel)), mode(file), "{rel:?}");
            }
        }
    }

    #[test]
    fn failed_worker_leaves_no_containers() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let mut files = fixture(src.path());
        // A directory passes the size scan but cannot be read as a file.
        let unreadable = src.path().join("out").join("sub");
        files.push(unreadable);

        for workers in [1, 3] {
            let err = ArchiveCodec::new(0, workers, 1)
                .compress_many(&files, src.path(), out.path(), "Archive")
                .unwrap_err();
            assert!(matches!(err, CacheError::Archive { .. }), "{err}");
            assert_eq!(fs::read_dir(out.path()).unwrap().count(), 0);
        }
    }

    #[test]
    fn idle_workers_create_no_container() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let files = vec![write(src.path(), "only.bin", 1000, 9)];
        let codec = ArchiveCodec::new(0, 6, 1);

        let containers = codec
            .compress_many(&files, src.path(), out.path(), "Archive-Bin")
            .unwrap();
        assert_eq!(containers.len(), 1);
        let name = containers[0].file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("Archive-Bin-"));
        assert!(name.ends_with(".zip"));
        assert_eq!(fs::read_dir(out.path()).unwrap().count(), 1);
    }

    #[test]
    fn extraction_replaces_read_only_file() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let files = vec![write(src.path(), "bin/tool", 64, 7)];
        let codec = ArchiveCodec::new(u64::MAX, 1, 1);
        let containers = codec
            .compress_many(&files, src.path(), out.path(), "Archive")
            .unwrap();

        let stale = write(dest.path(), "bin/tool", 3, 0);
        let mut permissions = fs::metadata(&stale).unwrap().permissions();
        permissions.set_readonly(true);
        fs::set_permissions(&stale, permissions).unwrap();

        codec.decompress_many(&containers, dest.path()).unwrap();
        assert_restored(&files, src.path(), dest.path());
    }

    #[test]
    fn file_outside_root_is_rejected() {
        let src = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let files = vec![write(other.path(), "x.bin", 10, 1)];
        let err = ArchiveCodec::new(0, 2, 1)
            .compress_many(&files, src.path(), out.path(), "Archive")
            .unwrap_err();
        assert!(matches!(err, CacheError::OutsideRoot { .. }));
    }

    #[test]
    fn unwritable_output_is_archive_failure() {
        let src = tempfile::tempdir().unwrap();
        let files = vec![write(src.path(), "a.bin", 10, 1)];
        let missing = src.path().join("no").join("such").join("dir");
        let err = ArchiveCodec::new(u64::MAX, 1, 1)
            .compress_many(&files, src.path(), &missing, "Archive")
            .unwrap_err();
        assert!(matches!(err, CacheError::Archive { .. }));
    }

    #[test]
    fn corrupt_container_is_archive_failure() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("Archive.zip");
        fs::write(&bogus, b"not a zip file").unwrap();
        let err = ArchiveCodec::default()
            .decompress_many(&[bogus], dir.path())
            .unwrap_err();
        assert!(matches!(err, CacheError::Archive { .. }));
    }

    #[test]
    fn from_config_uses_configured_workers() {
        let config = ArchiveConfig {
            workers: Some(3),
            ..ArchiveConfig::default()
        };
        assert_eq!(ArchiveCodec::from_config(&config).workers(), 3);
        assert!(ArchiveCodec::default().workers() >= 1);
    }
}
