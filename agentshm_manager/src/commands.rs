//! Subcommand implementations

use agentshm_core::memory::WELL_KNOWN_REGIONS;
use agentshm_core::{recover_orphans, OrphanStatus, PoolConfig, SharedPool, ShmErrorKind};
use anyhow::{bail, Context, Result};
use colored::*;
use serde_json::json;
use std::fs;

/// Logical names of every pool with a segment in the configured directory
pub fn list_pools(config: &PoolConfig) -> Result<Vec<String>> {
    let dir = config.dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut names: Vec<String> = fs::read_dir(&dir)
        .with_context(|| format!("Failed to read {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_suffix("_s"))
                .map(str::to_string)
        })
        .collect();
    names.sort();
    Ok(names)
}

pub fn execute_list(config: &PoolConfig) -> Result<()> {
    let names = list_pools(config)?;
    if names.is_empty() {
        println!("{} No pools in {}", "→".cyan(), config.dir().display());
        return Ok(());
    }
    println!("{}", format!("Pools in {}", config.dir().display()).bold());
    for name in names {
        println!("  {}", name);
    }
    Ok(())
}

/// Occupancy of an attached pool as JSON
pub fn pool_report(pool: &SharedPool, with_chunks: bool) -> Result<serde_json::Value> {
    let stats = pool.stats()?;
    let chunks = if with_chunks {
        Some(pool.chunks()?)
    } else {
        None
    };
    Ok(json!({
        "name": pool.name(),
        "segment": pool.segment_path(),
        "stats": stats,
        "chunks": chunks,
    }))
}

pub fn execute_info(config: &PoolConfig, name: &str, as_json: bool, with_chunks: bool) -> Result<()> {
    let pool = SharedPool::open_existing(name, config)?;

    if as_json {
        let report = pool_report(&pool, with_chunks)?;
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let stats = pool.stats()?;
        println!("{}", format!("Pool '{}'", pool.name()).bold());
        println!("  segment:      {}", pool.segment_path().display());
        println!("  size:         {} / {} bytes", stats.size, stats.max_size);
        println!("  attached:     {}", stats.open);
        println!(
            "  used:         {} chunk(s), {} bytes",
            stats.used_chunks, stats.used_bytes
        );
        println!(
            "  free:         {} chunk(s), {} bytes (largest {})",
            stats.free_chunks, stats.free_bytes, stats.largest_free
        );
        println!(
            "  free lists:   small {}  medium {}  large {}",
            stats.buckets[0], stats.buckets[1], stats.buckets[2]
        );

        if with_chunks {
            println!("{}", "  chunks:".bold());
            for chunk in pool.chunks()? {
                let state = if chunk.used {
                    "used".yellow()
                } else {
                    "free".green()
                };
                println!(
                    "    {:>10}  {:>10}  {:>10}  {}",
                    chunk.offset, chunk.size, chunk.usable, state
                );
            }
        }
    }

    pool.shutdown()?;
    Ok(())
}

pub fn execute_verify(config: &PoolConfig, name: &str) -> Result<()> {
    let pool = SharedPool::open_existing(name, config)?;
    if let Err(e) = pool.verify() {
        bail!("Pool '{}' failed verification: {}", name, e);
    }
    println!("{} Pool '{}' is consistent", "✓".green(), name);
    pool.shutdown()?;
    Ok(())
}

pub fn execute_recover(config: &PoolConfig, instance_id: u64) -> Result<()> {
    println!(
        "{} Removing leftovers of instance {} in {}",
        "→".cyan(),
        instance_id,
        config.dir().display()
    );

    let mut removed = 0usize;
    let result = recover_orphans(config, instance_id, |path, status| match status {
        OrphanStatus::Clean => tracing::debug!("{} not present", path.display()),
        OrphanStatus::Removed => {
            removed += 1;
            println!("  {} {}", "removed".yellow(), path.display());
        }
        OrphanStatus::Failed(e) => {
            println!("  {} {}: {}", "failed".red(), path.display(), e);
        }
    });
    result.context("Orphan cleanup incomplete")?;

    println!(
        "{} {} object(s) removed across {} regions",
        "✓".green(),
        removed,
        WELL_KNOWN_REGIONS.len()
    );
    Ok(())
}

pub fn execute_destroy(config: &PoolConfig, name: &str, force: bool) -> Result<()> {
    if force {
        SharedPool::unlink(name, config)?;
        println!("{} Unlinked pool '{}'", "✓".green(), name);
        return Ok(());
    }

    match SharedPool::open_existing(name, config) {
        Ok(pool) => {
            pool.destroy()?;
            println!("{} Destroyed pool '{}'", "✓".green(), name);
            Ok(())
        }
        Err(e) if e.kind() == ShmErrorKind::Corrupted => {
            bail!("{}; rerun with --force to unlink it anyway", e)
        }
        Err(e) => Err(e.into()),
    }
}
