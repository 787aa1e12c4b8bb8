//! Cleanup of named objects left behind by a crashed agent instance
//!
//! Each agent instance owns a fixed set of well-known regions named
//! `<region>_<instance id>`. After a crash their lock, segment and size objects
//! stay behind and would be attached to, stale, by the next instance.

use super::platform::ShmNames;
use super::shm_region::ShmRegion;
use crate::config::{instance_region_name, PoolConfig};
use crate::error::{ShmError, ShmResult};
use std::io;
use std::path::Path;

/// Regions every agent instance creates
pub const WELL_KNOWN_REGIONS: [&str; 4] = ["audit", "cache", "config", "log"];

/// What happened to one named object during cleanup
#[derive(Debug)]
pub enum OrphanStatus {
    /// Nothing to remove
    Clean,
    Removed,
    /// Removal was attempted and failed
    Failed(io::Error),
}

impl OrphanStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, OrphanStatus::Failed(_))
    }
}

/// Remove one named object; a missing object counts as clean
pub fn remove_object(path: &Path) -> OrphanStatus {
    match ShmRegion::unlink(path) {
        Ok(true) => OrphanStatus::Removed,
        Ok(false) => OrphanStatus::Clean,
        Err(e) => OrphanStatus::Failed(e),
    }
}

/// Remove every object of the well-known regions of `instance_id`
///
/// `report` sees each object and its outcome, so the caller can log through
/// its own channel. Every object is attempted even after a failure; the
/// result is an error if any removal failed.
pub fn recover_orphans<F>(config: &PoolConfig, instance_id: u64, mut report: F) -> ShmResult<()>
where
    F: FnMut(&Path, &OrphanStatus),
{
    let dir = config.dir();
    let mut failed = Vec::new();

    for region in WELL_KNOWN_REGIONS {
        let names = ShmNames::new(&dir, &instance_region_name(region, instance_id));
        for path in names.objects() {
            let status = remove_object(path);
            match &status {
                OrphanStatus::Clean => {}
                OrphanStatus::Removed => {
                    log::warn!("Removed orphaned shared object {}", path.display());
                }
                OrphanStatus::Failed(e) => {
                    log::error!("Could not remove orphaned {}: {}", path.display(), e);
                    failed.push(path.display().to_string());
                }
            }
            report(path, &status);
        }
    }

    if failed.is_empty() {
        Ok(())
    } else {
        Err(ShmError::fault(
            "orphan cleanup",
            io::Error::other(format!("could not remove {}", failed.join(", "))),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_clean_directory_reports_every_object() {
        let dir = TempDir::new().unwrap();
        let mut seen = Vec::new();
        recover_orphans(&PoolConfig::in_dir(dir.path()), 3, |path, status| {
            assert!(matches!(status, OrphanStatus::Clean));
            seen.push(path.to_path_buf());
        })
        .unwrap();

        assert_eq!(seen.len(), WELL_KNOWN_REGIONS.len() * 3);
        assert!(seen.iter().any(|p| p.ends_with("audit_3_s")));
        assert!(seen.iter().any(|p| p.ends_with("log_3_l")));
    }

    #[test]
    fn test_only_the_given_instance_is_removed() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("cache_7_s"), b"stale").unwrap();
        fs::write(dir.path().join("cache_7_sz"), b"stale").unwrap();
        fs::write(dir.path().join("cache_8_s"), b"live").unwrap();

        let mut removed = 0;
        recover_orphans(&PoolConfig::in_dir(dir.path()), 7, |_, status| {
            if matches!(status, OrphanStatus::Removed) {
                removed += 1;
            }
        })
        .unwrap();

        assert_eq!(removed, 2);
        assert!(!dir.path().join("cache_7_s").exists());
        assert!(dir.path().join("cache_8_s").exists());
    }

    #[test]
    fn test_failed_removal_is_reported() {
        let dir = TempDir::new().unwrap();
        // A directory where a file is expected cannot be removed with remove_file
        fs::create_dir(dir.path().join("config_1_l")).unwrap();

        let mut failures = 0;
        let result = recover_orphans(&PoolConfig::in_dir(dir.path()), 1, |_, status| {
            if status.is_failure() {
                failures += 1;
            }
        });

        assert!(result.is_err());
        assert_eq!(failures, 1);
    }
}
