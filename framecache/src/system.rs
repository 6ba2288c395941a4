//! System memory detection.
//!
//! The cache service sizes the node cache from total RAM and evicts cached
//! images when free RAM runs low. Both figures come from here.

/// Detect total system memory in bytes.
///
/// # Platform Support
///
/// - **Linux**: Parses `MemTotal` from `/proc/meminfo`
/// - **Other platforms**: Returns fallback of 8GB
#[cfg(target_os = "linux")]
pub fn detect_total_memory() -> u64 {
    read_meminfo("MemTotal:").unwrap_or_else(fallback_memory)
}

#[cfg(not(target_os = "linux"))]
pub fn detect_total_memory() -> u64 {
    fallback_memory()
}

/// Detect memory available to new allocations, in bytes.
///
/// `None` when the platform does not report it; callers should then skip
/// memory pressure checks rather than guess.
#[cfg(target_os = "linux")]
pub fn detect_available_memory() -> Option<u64> {
    read_meminfo("MemAvailable:")
}

#[cfg(not(target_os = "linux"))]
pub fn detect_available_memory() -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
fn read_meminfo(field: &str) -> Option<u64> {
    let content = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo(&content, field)
}

/// Find `field` in `/proc/meminfo` content and return its value in bytes.
///
/// Lines look like `MemTotal:       16384000 kB`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_meminfo(content: &str, field: &str) -> Option<u64> {
    let line = content.lines().find(|line| line.starts_with(field))?;
    let kb = line.split_whitespace().nth(1)?.parse::<u64>().ok()?;
    Some(kb * 1024)
}

/// Fallback memory value when detection fails.
const fn fallback_memory() -> u64 {
    8 * 1024 * 1024 * 1024 // 8GB
}

/// `percent` of `total`, rounded down.
pub fn percent_of(total: u64, percent: u8) -> u64 {
    (u128::from(total) * u128::from(percent.min(100)) / 100) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMINFO: &str = "MemTotal:       16384000 kB\n\
                           MemFree:         1024000 kB\n\
                           MemAvailable:    8192000 kB\n";

    #[test]
    fn test_detect_total_memory_returns_positive() {
        assert!(detect_total_memory() > 0, "Should detect some memory");
    }

    #[test]
    fn test_parse_meminfo() {
        assert_eq!(parse_meminfo(MEMINFO, "MemTotal:"), Some(16_384_000 * 1024));
        assert_eq!(parse_meminfo(MEMINFO, "MemAvailable:"), Some(8_192_000 * 1024));
        assert_eq!(parse_meminfo(MEMINFO, "SwapTotal:"), None);
        assert_eq!(parse_meminfo("MemTotal: lots kB\n", "MemTotal:"), None);
    }

    #[test]
    fn test_percent_of() {
        assert_eq!(percent_of(1000, 5), 50);
        assert_eq!(percent_of(1000, 0), 0);
        assert_eq!(percent_of(1000, 250), 1000);
        assert_eq!(percent_of(u64::MAX, 100), u64::MAX);
    }
}
