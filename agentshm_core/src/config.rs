/// Configuration file support for AgentShm
///
/// The agent's bootstrap loader hands over a populated [`AgentShmConfig`] once at
/// start-up. It can be read from TOML or YAML; the pool ceiling may additionally
/// be lowered through the `AGENTSHM_MAX_SIZE` environment variable.
use crate::error::{ShmError, ShmResult};
use crate::memory::platform::{page_floor, shm_base_dir};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Environment variable that lowers the maximum pool size
pub const MAX_SIZE_ENV: &str = "AGENTSHM_MAX_SIZE";

/// Compiled ceiling for any pool (1 GiB)
pub const HARD_MAX_POOL_SIZE: usize = 0x4000_0000;

/// Per-pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Directory holding the named objects (defaults to the platform shm dir)
    #[serde(default)]
    pub shm_dir: Option<PathBuf>,

    /// Explicit size ceiling in bytes; cannot raise the environment ceiling
    #[serde(default)]
    pub max_size: Option<usize>,

    /// Allow the pool to grow when an allocation cannot be satisfied
    #[serde(default = "default_growable")]
    pub growable: bool,
}

fn default_growable() -> bool {
    true
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            shm_dir: None,
            max_size: None,
            growable: true,
        }
    }
}

impl PoolConfig {
    /// Config rooted at a specific directory
    pub fn in_dir<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            shm_dir: Some(dir.into()),
            ..Self::default()
        }
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }

    pub fn with_growable(mut self, growable: bool) -> Self {
        self.growable = growable;
        self
    }

    /// Directory where this pool's named objects live
    pub fn dir(&self) -> PathBuf {
        self.shm_dir.clone().unwrap_or_else(shm_base_dir)
    }

    /// Effective pool ceiling: the smaller of the explicit limit and the
    /// environment ceiling, rounded down to whole pages
    pub fn max_pool_size(&self) -> usize {
        let env_max = max_pool_size_from_env();
        let max = match self.max_size {
            Some(limit) if limit > 0 => limit.min(env_max),
            _ => env_max,
        };
        page_floor(max)
    }
}

/// Maximum pool size honoring `AGENTSHM_MAX_SIZE`
///
/// Values that are not a whole positive number strictly below
/// [`HARD_MAX_POOL_SIZE`] are ignored and the hard ceiling applies.
pub fn max_pool_size_from_env() -> usize {
    std::env::var(MAX_SIZE_ENV)
        .ok()
        .and_then(|v| parse_size_limit(&v))
        .unwrap_or(HARD_MAX_POOL_SIZE)
}

/// Parse a size limit in decimal, `0x` hexadecimal or leading-zero octal
pub fn parse_size_limit(value: &str) -> Option<usize> {
    let value = value.trim();
    let parsed = if let Some(hex) = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        usize::from_str_radix(hex, 16).ok()?
    } else if value.len() > 1 && value.starts_with('0') {
        usize::from_str_radix(&value[1..], 8).ok()?
    } else {
        value.parse::<usize>().ok()?
    };

    if parsed > 0 && parsed < HARD_MAX_POOL_SIZE {
        Some(parsed)
    } else {
        None
    }
}

/// One named region of the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionConfig {
    /// Initial usable size in bytes
    pub initial_size: usize,
}

/// Populated configuration record handed to start-up code
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentShmConfig {
    /// Agent instance identifier, used to derive region names
    #[serde(default)]
    pub instance_id: u64,

    /// Settings shared by every region
    #[serde(default)]
    pub pool: PoolConfig,

    /// Map of region name -> region config
    #[serde(default)]
    pub regions: BTreeMap<String, RegionConfig>,
}

impl AgentShmConfig {
    /// Load config from a file (auto-detect format)
    pub fn from_file<P: AsRef<Path>>(path: P) -> ShmResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ShmError::config(format!("Failed to read config file: {}", e)))?;

        // Auto-detect format based on extension
        let extension = path.extension().and_then(|s| s.to_str());
        match extension {
            Some("toml") => Self::from_toml(&contents),
            Some("yaml") | Some("yml") => Self::from_yaml(&contents),
            _ => Self::from_toml(&contents).or_else(|_| Self::from_yaml(&contents)),
        }
    }

    /// Parse config from TOML string
    pub fn from_toml(contents: &str) -> ShmResult<Self> {
        toml::from_str(contents)
            .map_err(|e| ShmError::config(format!("Failed to parse TOML: {}", e)))
    }

    /// Parse config from YAML string
    pub fn from_yaml(contents: &str) -> ShmResult<Self> {
        serde_yaml::from_str(contents)
            .map_err(|e| ShmError::config(format!("Failed to parse YAML: {}", e)))
    }

    /// Logical pool name of a region for this instance
    pub fn region_name(&self, region: &str) -> String {
        instance_region_name(region, self.instance_id)
    }
}

/// Logical pool name of `region` for agent instance `instance_id`
pub fn instance_region_name(region: &str, instance_id: u64) -> String {
    format!("{}_{}", region, instance_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_limit_accepts_bases() {
        assert_eq!(parse_size_limit("65536"), Some(65536));
        assert_eq!(parse_size_limit("0x10000"), Some(65536));
        assert_eq!(parse_size_limit("0200000"), Some(65536));
        assert_eq!(parse_size_limit(" 4096 "), Some(4096));
    }

    #[test]
    fn test_parse_size_limit_rejects_out_of_range() {
        assert_eq!(parse_size_limit("0"), None);
        assert_eq!(parse_size_limit("-1"), None);
        assert_eq!(parse_size_limit("12abc"), None);
        assert_eq!(parse_size_limit(""), None);
        assert_eq!(parse_size_limit("0x"), None);
        assert_eq!(parse_size_limit(&HARD_MAX_POOL_SIZE.to_string()), None);
        assert_eq!(
            parse_size_limit(&(HARD_MAX_POOL_SIZE - 1).to_string()),
            Some(HARD_MAX_POOL_SIZE - 1)
        );
    }

    #[test]
    fn test_explicit_max_is_page_rounded() {
        let page = crate::memory::platform::page_size();
        let config = PoolConfig::default().with_max_size(3 * page + 100);
        assert_eq!(config.max_pool_size(), 3 * page);

        let tiny = PoolConfig::default().with_max_size(1);
        assert_eq!(tiny.max_pool_size(), page);
    }

    #[test]
    fn test_from_toml() {
        let config = AgentShmConfig::from_toml(
            r#"
            instance_id = 7

            [pool]
            shm_dir = "/tmp/agentshm-test"
            max_size = 1048576
            growable = false

            [regions.cache]
            initial_size = 65536

            [regions.config]
            initial_size = 4096
            "#,
        )
        .unwrap();

        assert_eq!(config.instance_id, 7);
        assert_eq!(config.pool.max_size, Some(1048576));
        assert!(!config.pool.growable);
        assert_eq!(config.regions["cache"].initial_size, 65536);
        assert_eq!(config.region_name("cache"), "cache_7");
    }

    #[test]
    fn test_from_yaml_defaults() {
        let config = AgentShmConfig::from_yaml("instance_id: 3\n").unwrap();
        assert_eq!(config.instance_id, 3);
        assert!(config.pool.growable);
        assert!(config.pool.shm_dir.is_none());
        assert!(config.regions.is_empty());
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let err = AgentShmConfig::from_toml("instance_id = [").unwrap_err();
        assert_eq!(err.kind(), crate::error::ShmErrorKind::Config);
    }
}
