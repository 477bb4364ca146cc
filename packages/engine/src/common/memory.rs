//! Process memory inspection for the scheduler's resource guard.

/// Fraction of the configured cap at which the scheduler stops taking work.
pub const MEMORY_PRESSURE_RATIO: f64 = 0.8;

/// Resident set size of this process in megabytes.
///
/// Reads `/proc/self/statm` on Linux; returns `None` on platforms without
/// procfs, which disables the memory guard.
pub fn current_rss_mb() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        let page_size = 4096u64;
        Some(resident_pages * page_size / (1024 * 1024))
    }

    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

/// Whether the process has crossed the pressure threshold for the given cap.
pub fn over_memory_threshold(cap_mb: u64) -> bool {
    match current_rss_mb() {
        Some(rss) => (rss as f64) >= (cap_mb as f64) * MEMORY_PRESSURE_RATIO,
        None => false,
    }
}
