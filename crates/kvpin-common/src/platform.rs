/// Parse a visible-device list such as `"4,2,6"`.
///
/// Entries are trimmed; empty entries are skipped. Returns `None` if any entry
/// is not a non-negative integer.
pub fn parse_device_list(raw: &str) -> Option<Vec<u32>> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| item.parse::<u32>().ok())
        .collect()
}

/// Read the visible-device list from `var`, if the variable is set.
///
/// The outer `Option` is `None` when the variable is absent; the inner one is
/// `None` when it is present but malformed.
pub fn visible_devices(var: &str) -> Option<Option<Vec<u32>>> {
    std::env::var(var).ok().map(|raw| parse_device_list(&raw))
}

/// Returns the platform name string.
pub fn platform_name() -> &'static str {
    #[cfg(target_os = "linux")]
    { "linux" }
    #[cfg(target_os = "windows")]
    { "windows" }
    #[cfg(target_os = "macos")]
    { "macos" }
    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    { "unknown" }
}
