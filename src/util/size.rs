//! Size helper functions.

/// Convert kilobytes to bytes.
#[inline]
pub const fn kb(n: usize) -> usize {
    n * 1024
}

/// Convert megabytes to bytes.
#[inline]
pub const fn mb(n: usize) -> usize {
    n * 1024 * 1024
}

/// Format bytes as a human-readable string.
pub fn format_bytes(bytes: usize) -> String {
    let mut value = bytes as f64;
    let mut unit = None;
    for next in ["KB", "MB", "GB"] {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = Some(next);
    }
    match unit {
        Some(unit) => format!("{:.2} {}", value, unit),
        None => format!("{} B", bytes),
    }
}

/// Parse a byte count with an optional `k`/`m` suffix (`"64k"`, `"16m"`, `"4096"`).
pub fn parse_bytes(text: &str) -> Option<usize> {
    let text = text.trim();
    let lower = text.to_ascii_lowercase();
    let (digits, scale) = if let Some(d) = lower.strip_suffix('k') {
        (d, kb(1))
    } else if let Some(d) = lower.strip_suffix('m') {
        (d, mb(1))
    } else {
        (lower.as_str(), 1)
    };
    digits.parse::<usize>().ok()?.checked_mul(scale)
}
