// Cross-platform shared memory naming
//
// Linux: /dev/shm/agentshm (tmpfs - RAM-backed, fastest)
// macOS: /tmp/agentshm (regular filesystem, but still fast for IPC)
// Windows: %TEMP%\agentshm (uses system temp directory)

use std::path::{Path, PathBuf};

/// Get the base directory for AgentShm named objects
///
/// This returns a platform-appropriate path for shared memory:
/// - Linux: `/dev/shm/agentshm` (tmpfs for maximum performance)
/// - macOS: `/tmp/agentshm` (no /dev/shm, but /tmp is still fast)
/// - Windows: `%TEMP%\agentshm` (system temp directory)
pub fn shm_base_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/dev/shm/agentshm")
    }

    #[cfg(target_os = "windows")]
    {
        std::env::temp_dir().join("agentshm")
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        PathBuf::from("/tmp/agentshm")
    }
}

/// System page size; segment sizes are always a multiple of it
pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            4096
        }
    }

    #[cfg(not(unix))]
    {
        4096
    }
}

/// Round `size` up to a whole number of pages
pub fn page_align(size: usize) -> usize {
    let page = page_size();
    size.div_ceil(page) * page
}

/// Round `size` down to a whole number of pages, never below one page
pub fn page_floor(size: usize) -> usize {
    let page = page_size();
    ((size / page) * page).max(page)
}

/// Get platform name for logging/diagnostics
pub fn platform_name() -> &'static str {
    #[cfg(target_os = "linux")]
    { "Linux" }

    #[cfg(target_os = "macos")]
    { "macOS" }

    #[cfg(target_os = "windows")]
    { "Windows" }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    { "Unix" }
}

/// Convert a logical name to a safe file name component
pub fn sanitize_name(name: &str) -> String {
    name.replace(['/', ':', '\\'], "_")
}

/// Named OS objects backing one logical pool
///
/// Every process that uses the same logical name and base directory resolves
/// the same three objects; distinct logical names never collide because each
/// object carries the full sanitized name plus a fixed suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmNames {
    /// Sanitized logical name
    pub name: String,
    /// Lock object (`<name>_l`)
    pub lock: PathBuf,
    /// Segment and its backing store (`<name>_s`)
    pub segment: PathBuf,
    /// Shared "true" size scalar (`<name>_sz`)
    pub size: PathBuf,
}

impl ShmNames {
    pub fn new(dir: &Path, name: &str) -> Self {
        let safe = sanitize_name(name);
        Self {
            lock: dir.join(format!("{}_l", safe)),
            segment: dir.join(format!("{}_s", safe)),
            size: dir.join(format!("{}_sz", safe)),
            name: safe,
        }
    }

    /// All object paths, in the order they are unlinked
    pub fn objects(&self) -> [&Path; 3] {
        [&self.segment, &self.size, &self.lock]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shm_base_dir_is_valid() {
        let base = shm_base_dir();
        assert!(!base.as_os_str().is_empty());
        assert!(base.ends_with("agentshm"));
    }

    #[test]
    fn test_page_rounding() {
        let page = page_size();
        assert!(page.is_power_of_two());
        assert_eq!(page_align(1), page);
        assert_eq!(page_align(page), page);
        assert_eq!(page_align(page + 1), 2 * page);
        assert_eq!(page_floor(1), page);
        assert_eq!(page_floor(2 * page + 7), 2 * page);
    }

    #[test]
    fn test_names_are_deterministic_and_distinct() {
        let dir = Path::new("/tmp/x");
        let a = ShmNames::new(dir, "cache/1");
        let b = ShmNames::new(dir, "cache/1");
        assert_eq!(a, b);
        assert_eq!(a.name, "cache_1");
        assert_eq!(a.segment, dir.join("cache_1_s"));
        assert_eq!(a.lock, dir.join("cache_1_l"));
        assert_eq!(a.size, dir.join("cache_1_sz"));

        let c = ShmNames::new(dir, "config_1");
        assert_ne!(a.segment, c.segment);
        assert_ne!(a.lock, c.lock);
    }
}
