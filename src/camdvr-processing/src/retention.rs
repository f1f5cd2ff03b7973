//! Retention sweep for the recording destination

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use crate::error::SweepError;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Result summary for one sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepSummary {
    pub deleted: usize,
    pub bytes_freed: u64,
    /// Entries kept because they are young, active, or not regular files
    pub kept: usize,
    pub errors: usize,
}

/// Delete files directly under `directory` whose age in whole days is at
/// least `max_age_days`.
pub fn sweep(directory: &Path, max_age_days: u32) -> Result<SweepSummary, SweepError> {
    sweep_excluding(directory, max_age_days, None)
}

/// Like [`sweep`], never touching `active` (the segment being written).
///
/// Per-file failures are logged and counted; only an unreadable directory
/// fails the whole sweep. A missing directory is an empty sweep.
pub fn sweep_excluding(
    directory: &Path,
    max_age_days: u32,
    active: Option<&Path>,
) -> Result<SweepSummary, SweepError> {
    let mut summary = SweepSummary::default();

    if !directory.exists() {
        debug!("retention: {:?} does not exist, nothing to sweep", directory);
        return Ok(summary);
    }

    let entries = fs::read_dir(directory).map_err(|source| SweepError::ReadDir {
        path: directory.to_path_buf(),
        source,
    })?;

    let now = SystemTime::now();

    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(source) => {
                summary.errors += 1;
                warn!(
                    "retention: {}",
                    SweepError::ReadDir { path: directory.to_path_buf(), source }
                );
                continue;
            }
        };

        let path = entry.path();
        if active.is_some_and(|a| a == path) {
            summary.kept += 1;
            continue;
        }

        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                summary.errors += 1;
                warn!("retention: cannot stat {:?}: {}", path, e);
                continue;
            }
        };

        if !meta.is_file() {
            summary.kept += 1;
            continue;
        }

        let age = meta
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or(Duration::ZERO);

        if age_in_days(age) < u64::from(max_age_days) {
            summary.kept += 1;
            continue;
        }

        match fs::remove_file(&path) {
            Ok(()) => {
                summary.deleted += 1;
                summary.bytes_freed += meta.len();
                info!("retention: deleted {:?} ({} days old)", path, age_in_days(age));
            }
            Err(source) => {
                summary.errors += 1;
                warn!("retention: {}", SweepError::Delete { path, source });
            }
        }
    }

    Ok(summary)
}

fn age_in_days(age: Duration) -> u64 {
    age.as_secs() / SECS_PER_DAY
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    fn file_aged(dir: &Path, name: &str, days: u64) -> std::path::PathBuf {
        let path = dir.join(name);
        let f = File::create(&path).unwrap();
        let mtime = SystemTime::now() - Duration::from_secs(days * SECS_PER_DAY);
        f.set_modified(mtime).unwrap();
        path
    }

    #[test]
    fn test_sweep_deletes_only_expired_files() {
        let tmp = tempfile::tempdir().unwrap();
        let old = file_aged(tmp.path(), "old.avi", 8);
        let young = file_aged(tmp.path(), "young.avi", 6);

        let summary = sweep(tmp.path(), 7).unwrap();

        assert_eq!(summary.deleted, 1);
        assert_eq!(summary.errors, 0);
        assert!(!old.exists());
        assert!(young.exists());
    }

    #[test]
    fn test_sweep_boundary_is_inclusive() {
        let tmp = tempfile::tempdir().unwrap();
        let exact = file_aged(tmp.path(), "exact.avi", 7);

        sweep(tmp.path(), 7).unwrap();
        assert!(!exact.exists());
    }

    #[test]
    fn test_sweep_skips_active_segment() {
        let tmp = tempfile::tempdir().unwrap();
        let active = file_aged(tmp.path(), "active.avi", 30);
        let other = file_aged(tmp.path(), "other.avi", 30);

        let summary = sweep_excluding(tmp.path(), 1, Some(&active)).unwrap();

        assert_eq!(summary.deleted, 1);
        assert!(active.exists());
        assert!(!other.exists());
    }

    #[test]
    fn test_sweep_is_not_recursive() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("nested");
        fs::create_dir(&nested).unwrap();
        let inner = file_aged(&nested, "inner.avi", 30);

        let summary = sweep(tmp.path(), 1).unwrap();

        assert_eq!(summary.deleted, 0);
        assert!(inner.exists());
    }

    #[test]
    fn test_missing_directory_is_empty_sweep() {
        let tmp = tempfile::tempdir().unwrap();
        let summary = sweep(&tmp.path().join("gone"), 7).unwrap();
        assert_eq!(summary, SweepSummary::default());
    }
}
