// Test loading the agent configuration and bringing up its regions
use agentshm_core::memory::WELL_KNOWN_REGIONS;
use agentshm_core::{recover_orphans, AgentShmConfig, OrphanStatus, SharedPool, ShmErrorKind};
use std::fs;
use tempfile::TempDir;

fn write_config(dir: &TempDir, file: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join(file);
    fs::write(&path, contents).unwrap();
    path
}

#[test]
fn test_from_file_detects_format() {
    let dir = TempDir::new().unwrap();
    let toml = write_config(
        &dir,
        "agent.toml",
        "instance_id = 4\n[regions.audit]\ninitial_size = 8192\n",
    );
    let yaml = write_config(
        &dir,
        "agent.yaml",
        "instance_id: 4\nregions:\n  audit:\n    initial_size: 8192\n",
    );

    let from_toml = AgentShmConfig::from_file(&toml).unwrap();
    let from_yaml = AgentShmConfig::from_file(&yaml).unwrap();
    assert_eq!(from_toml.instance_id, from_yaml.instance_id);
    assert_eq!(
        from_toml.regions["audit"].initial_size,
        from_yaml.regions["audit"].initial_size
    );
}

#[test]
fn test_missing_file_is_config_error() {
    let dir = TempDir::new().unwrap();
    let err = AgentShmConfig::from_file(dir.path().join("absent.toml")).unwrap_err();
    assert_eq!(err.kind(), ShmErrorKind::Config);
}

// Lock objects are files only on Unix
#[cfg(unix)]
#[test]
fn test_regions_come_up_and_crash_leftovers_are_recovered() {
    let dir = TempDir::new().unwrap();
    let shm_dir = dir.path().join("shm");
    let path = write_config(
        &dir,
        "agent.toml",
        &format!(
            "instance_id = 9\n\n[pool]\nshm_dir = {:?}\nmax_size = 1048576\n\n\
             [regions.audit]\ninitial_size = 16384\n\n\
             [regions.cache]\ninitial_size = 4096\n",
            shm_dir.display().to_string()
        ),
    );
    let config = AgentShmConfig::from_file(&path).unwrap();

    let pools: Vec<SharedPool> = config
        .regions
        .iter()
        .map(|(region, settings)| {
            SharedPool::create_with_config(
                &config.region_name(region),
                settings.initial_size,
                &config.pool,
            )
            .unwrap()
        })
        .collect();
    assert!(shm_dir.join("audit_9_s").exists());
    assert!(pools.iter().all(|pool| pool.is_creator()));

    // Simulate a crash: the handles go away without detaching
    for pool in pools {
        std::mem::forget(pool);
    }

    let mut removed = Vec::new();
    recover_orphans(&config.pool, config.instance_id, |path, status| {
        if matches!(status, OrphanStatus::Removed) {
            removed.push(path.file_name().unwrap().to_string_lossy().into_owned());
        }
    })
    .unwrap();

    removed.sort();
    assert_eq!(
        removed,
        vec!["audit_9_l", "audit_9_s", "audit_9_sz", "cache_9_l", "cache_9_s", "cache_9_sz"]
    );
    assert!(WELL_KNOWN_REGIONS.contains(&"audit"));

    // A fresh instance formats new segments instead of attaching to stale ones
    let fresh = SharedPool::create_with_config(&config.region_name("audit"), 16384, &config.pool)
        .unwrap();
    assert!(fresh.is_creator());
    assert_eq!(fresh.stats().unwrap().open, 1);
}
