//! Per-file metadata snapshots and their comparison against disk.

use std::fs;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use serde::{Deserialize, Serialize};
use strata_common::{relative_path, UtcTicks};

use crate::digest::ContentDigest;
use crate::error::CacheError;
use crate::policy::IntegrityPolicy;

/// Metadata captured for one build product when it was archived.
///
/// Records are immutable once captured. They are compared against the
/// files on disk when outputs are retrieved or reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileRecord {
    relative_path: String,
    last_write_time_utc_ticks: UtcTicks,
    length: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    digest: Option<String>,
}

/// Outcome of comparing a [`FileRecord`] against the file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Comparison {
    /// The file matches the record.
    Match,
    /// The file differs in a way the duplicate-product rules tolerate.
    Warning(String),
    /// The file is missing or differs from the record.
    Mismatch(String),
}

impl Comparison {
    /// Returns `true` unless the comparison is a hard mismatch.
    pub fn is_ok(&self) -> bool {
        !matches!(self, Self::Mismatch(_))
    }

    /// The warning or mismatch message, if any.
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Match => None,
            Self::Warning(msg) | Self::Mismatch(msg) => Some(msg),
        }
    }
}

impl FileRecord {
    /// Creates a record from already-known values.
    pub fn new(
        relative_path: impl Into<String>,
        last_write_time: UtcTicks,
        length: u64,
        digest: Option<String>,
    ) -> Self {
        Self {
            relative_path: relative_path.into(),
            last_write_time_utc_ticks: last_write_time,
            length,
            digest,
        }
    }

    /// Captures the current state of `path`, which must be a file under `root`.
    ///
    /// Relative paths are resolved against `root`. A digest is recorded only
    /// when the policy requires one for the file's name.
    pub fn capture(
        root: &Path,
        path: &Path,
        policy: &IntegrityPolicy,
        digest: &dyn ContentDigest,
    ) -> Result<Self, CacheError> {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            root.join(path)
        };
        let relative = relative_path(root, &absolute).ok_or_else(|| CacheError::OutsideRoot {
            path: absolute.clone(),
            root: root.to_path_buf(),
        })?;

        let metadata = fs::metadata(&absolute).map_err(|e| CacheError::io(&absolute, e))?;
        if !metadata.is_file() {
            return Err(CacheError::io(
                &absolute,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file"),
            ));
        }
        let modified = metadata
            .modified()
            .map_err(|e| CacheError::io(&absolute, e))?;

        let digest = if policy.requires_digest(&relative) {
            Some(digest.digest_file(&absolute)?)
        } else {
            None
        };

        Ok(Self {
            relative_path: relative,
            last_write_time_utc_ticks: UtcTicks::from_system_time(modified),
            length: metadata.len(),
            digest,
        })
    }

    /// Root-relative path with forward slashes.
    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    /// Recorded UTC write time.
    pub fn last_write_time(&self) -> UtcTicks {
        self.last_write_time_utc_ticks
    }

    /// Recorded length in bytes.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Recorded content digest, if one was required.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Resolves this record against `root`.
    pub fn local_path(&self, root: &Path) -> PathBuf {
        self.relative_path
            .split('/')
            .fold(root.to_path_buf(), |path, part| path.join(part))
    }

    /// Sets the file's modification time to the recorded write time.
    pub fn restamp(&self, root: &Path) -> Result<(), CacheError> {
        let path = self.local_path(root);
        let (secs, nanos) = self.last_write_time_utc_ticks.to_unix_parts();
        filetime::set_file_mtime(&path, FileTime::from_unix_time(secs, nanos))
            .map_err(|e| CacheError::io(&path, e))
    }

    /// Compares this record against the file under `root`.
    ///
    /// A missing file or a digest mismatch always fails. A size or write-time
    /// mismatch is downgraded to a warning for duplicate build products,
    /// except that write times under an always-checked path still fail.
    pub fn compare(
        &self,
        root: &Path,
        policy: &IntegrityPolicy,
        digest: &dyn ContentDigest,
    ) -> Comparison {
        let path = self.local_path(root);
        let metadata = match fs::metadata(&path) {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => {
                return Comparison::Mismatch(format!(
                    "Missing file from manifest - {}",
                    self.relative_path
                ))
            }
        };

        let duplicate = policy.is_duplicate_product(&self.relative_path);
        let mut warnings = Vec::new();

        if metadata.len() != self.length {
            let msg = format!(
                "File size differs from manifest - {} is {} bytes, expected {} bytes",
                self.relative_path,
                metadata.len(),
                self.length
            );
            if !duplicate {
                return Comparison::Mismatch(msg);
            }
            warnings.push(msg);
        }

        if let Some(expected) = &self.digest {
            match digest.digest_file(&path) {
                Ok(actual) if actual == *expected => {}
                Ok(actual) => {
                    return Comparison::Mismatch(format!(
                        "Digest mismatch for {} - was {actual}, expected {expected}",
                        self.relative_path
                    ))
                }
                Err(e) => {
                    return Comparison::Mismatch(format!(
                        "Unable to digest {} - {e}",
                        self.relative_path
                    ))
                }
            }
        } else {
            let actual = match metadata.modified() {
                Ok(modified) => UtcTicks::from_system_time(modified),
                Err(e) => {
                    return Comparison::Mismatch(format!(
                        "Unable to read write time of {} - {e}",
                        self.relative_path
                    ))
                }
            };
            let drift = actual.abs_diff(self.last_write_time_utc_ticks);
            if drift > policy.timestamp_tolerance() {
                let msg = format!(
                    "File date/time mismatch for {} - was {actual}, expected {}, difference {:.1}s",
                    self.relative_path,
                    self.last_write_time_utc_ticks,
                    drift.as_secs_f64()
                );
                if !duplicate || policy.always_checks_timestamp(&self.relative_path) {
                    return Comparison::Mismatch(msg);
                }
                warnings.push(msg);
            }
        }

        if warnings.is_empty() {
            Comparison::Match
        } else {
            Comparison::Warning(warnings.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Xxh3Digest;
    use crate::duplicate::DuplicateProductPolicy;
    use std::time::{Duration, SystemTime};
    use strata_config::ProductPattern;

    fn policy() -> IntegrityPolicy {
        IntegrityPolicy::new(
            Duration::from_secs(2),
            vec!["/Always/".to_string()],
            vec![".version".to_string()],
            DuplicateProductPolicy::new(vec![ProductPattern::shared_library("tbb")]),
        )
    }

    fn write(root: &Path, rel: &str, contents: &[u8]) -> PathBuf {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
        path
    }

    fn shift_mtime(path: &Path, secs: i64) {
        let modified = fs::metadata(path).unwrap().modified().unwrap();
        let shifted = if secs >= 0 {
            modified + Duration::from_secs(secs as u64)
        } else {
            modified - Duration::from_secs(secs.unsigned_abs())
        };
        filetime::set_file_mtime(path, FileTime::from_system_time(shifted)).unwrap();
    }

    fn capture(root: &Path, path: &Path) -> FileRecord {
        FileRecord::capture(root, path, &policy(), &Xxh3Digest).unwrap()
    }

    fn compare(record: &FileRecord, root: &Path) -> Comparison {
        record.compare(root, &policy(), &Xxh3Digest)
    }

    #[test]
    fn capture_records_relative_path_and_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "out/bin/a.bin", b"0123456789");
        let record = capture(dir.path(), &path);
        assert_eq!(record.relative_path(), "out/bin/a.bin");
        assert_eq!(record.length(), 10);
        assert!(record.digest().is_none());
        assert_eq!(record.local_path(dir.path()), path);
    }

    #[test]
    fn capture_accepts_root_relative_input() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "out/a.bin", b"abc");
        let record = capture(dir.path(), Path::new("out/a.bin"));
        assert_eq!(record.relative_path(), "out/a.bin");
    }

    #[test]
    fn capture_digest_only_for_allow_listed_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let version = write(dir.path(), "Build/Build.version", b"{}");
        let record = capture(dir.path(), &version);
        assert!(record.digest().is_some());
    }

    #[test]
    fn capture_outside_root_errors() {
        let root = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let path = write(other.path(), "a.bin", b"x");
        let err = FileRecord::capture(root.path(), &path, &policy(), &Xxh3Digest).unwrap_err();
        assert!(matches!(err, CacheError::OutsideRoot { .. }));
    }

    #[test]
    fn capture_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileRecord::capture(dir.path(), Path::new("nope.bin"), &policy(), &Xxh3Digest)
            .unwrap_err();
        assert!(matches!(err, CacheError::Io { .. }));
    }

    #[test]
    fn unchanged_file_matches() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "a.bin", b"data");
        let record = capture(dir.path(), &path);
        assert_eq!(compare(&record, dir.path()), Comparison::Match);
    }

    #[test]
    fn missing_file_is_hard_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "libtbb.so", b"data");
        let record = capture(dir.path(), &path);
        fs::remove_file(&path).unwrap();
        let result = compare(&record, dir.path());
        assert!(!result.is_ok());
        assert!(result.message().unwrap().contains("Missing file"));
    }

    #[test]
    fn size_change_fails_for_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "a.bin", b"data");
        let record = capture(dir.path(), &path);
        fs::write(&path, b"longer data").unwrap();
        assert!(matches!(compare(&record, dir.path()), Comparison::Mismatch(_)));
    }

    #[test]
    fn size_change_warns_for_duplicate_product() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "lib/libtbb.so.2", b"data");
        let record = capture(dir.path(), &path);
        fs::write(&path, b"longer data").unwrap();
        let result = compare(&record, dir.path());
        assert!(matches!(result, Comparison::Warning(_)), "{result:?}");
        assert!(result.is_ok());
    }

    #[test]
    fn timestamp_within_tolerance_matches() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "a.bin", b"data");
        let record = capture(dir.path(), &path);
        shift_mtime(&path, 1);
        assert_eq!(compare(&record, dir.path()), Comparison::Match);
        shift_mtime(&path, -2);
        assert_eq!(compare(&record, dir.path()), Comparison::Match);
    }

    #[test]
    fn timestamp_beyond_tolerance_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "a.bin", b"data");
        let record = capture(dir.path(), &path);
        shift_mtime(&path, 10);
        let result = compare(&record, dir.path());
        assert!(matches!(result, Comparison::Mismatch(ref m) if m.contains("date/time")));
    }

    #[test]
    fn timestamp_drift_warns_for_duplicate_product() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "bin/tbb.dll", b"data");
        let record = capture(dir.path(), &path);
        shift_mtime(&path, 10);
        assert!(matches!(compare(&record, dir.path()), Comparison::Warning(_)));
    }

    #[test]
    fn always_checked_path_fails_even_for_duplicate_product() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "Engine/Always/tbb.dll", b"data");
        let record = capture(dir.path(), &path);
        shift_mtime(&path, 10);
        assert!(matches!(compare(&record, dir.path()), Comparison::Mismatch(_)));
    }

    #[test]
    fn digest_mismatch_is_never_downgraded() {
        let dir = tempfile::tempdir().unwrap();
        let policy = IntegrityPolicy::new(
            Duration::from_secs(2),
            Vec::new(),
            vec![".dll".to_string()],
            DuplicateProductPolicy::new(vec![ProductPattern::shared_library("tbb")]),
        );
        let path = write(dir.path(), "tbb.dll", b"aaaa");
        let record = FileRecord::capture(dir.path(), &path, &policy, &Xxh3Digest).unwrap();
        assert!(record.digest().is_some());

        let before = fs::metadata(&path).unwrap().modified().unwrap();
        fs::write(&path, b"bbbb").unwrap();
        filetime::set_file_mtime(&path, FileTime::from_system_time(before)).unwrap();

        let result = record.compare(dir.path(), &policy, &Xxh3Digest);
        assert!(matches!(result, Comparison::Mismatch(ref m) if m.contains("Digest")));
    }

    #[test]
    fn digest_match_ignores_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "Build.version", b"{\"Major\": 5}");
        let record = capture(dir.path(), &path);
        shift_mtime(&path, 3600);
        assert_eq!(compare(&record, dir.path()), Comparison::Match);
    }

    #[test]
    fn restamp_applies_recorded_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "a.bin", b"data");
        let recorded =
            UtcTicks::from_system_time(SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000));
        let record = FileRecord::new("a.bin", recorded, 4, None);
        record.restamp(dir.path()).unwrap();
        let modified = fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(UtcTicks::from_system_time(modified), recorded);
        assert_eq!(compare(&record, dir.path()), Comparison::Match);
    }

    #[test]
    fn serializes_with_manifest_field_names() {
        let record = FileRecord::new("out/a.bin", UtcTicks::new(7), 3, None);
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(
            json,
            r#"{"RelativePath":"out/a.bin","LastWriteTimeUtcTicks":7,"Length":3}"#
        );
        let with_digest = FileRecord::new("b.version", UtcTicks::new(1), 2, Some("ab".into()));
        assert!(serde_json::to_string(&with_digest)
            .unwrap()
            .contains(r#""Digest":"ab""#));
    }
}
