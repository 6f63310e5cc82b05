//! Human-readable durations ("500ms", "5s", "2m") and byte sizes
//! ("512M", "1G").

use std::time::Duration;

/// Parse a duration string like "5s", "500ms", "1m".
///
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        let mins = mins.trim().parse::<u64>().ok()?;
        mins.checked_mul(60).map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        let hours = hours.trim().parse::<u64>().ok()?;
        hours.checked_mul(3600).map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

/// Error from [`parse_size`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SizeError {
    Malformed,
    Negative,
    Zero,
}

/// Parse a memory size like "1G", "512M", "2048k", or a plain byte count.
///
/// Units are binary (1K = 1024). An optional trailing `B`/`b` is accepted
/// ("1GB", "512mb").
pub fn parse_size(s: &str) -> Result<u64, SizeError> {
    let s = s.trim();
    if s.starts_with('-') {
        return Err(SizeError::Negative);
    }
    let s = s
        .strip_suffix(['B', 'b'])
        .filter(|rest| rest.ends_with(|c: char| c.is_ascii_alphabetic()))
        .unwrap_or(s);

    let (digits, multiplier) = match s.chars().last() {
        Some('k' | 'K') => (&s[..s.len() - 1], 1u64 << 10),
        Some('m' | 'M') => (&s[..s.len() - 1], 1u64 << 20),
        Some('g' | 'G') => (&s[..s.len() - 1], 1u64 << 30),
        Some('t' | 'T') => (&s[..s.len() - 1], 1u64 << 40),
        _ => (s, 1),
    };

    let value = digits.trim().parse::<u64>().map_err(|_| SizeError::Malformed)?;
    if value == 0 {
        return Err(SizeError::Zero);
    }
    value.checked_mul(multiplier).ok_or(SizeError::Malformed)
}

/// Render a byte count the way the compute image expects it ("1g", "512m").
pub fn format_size(bytes: u64) -> String {
    const UNITS: [(u64, &str); 4] = [(1 << 40, "t"), (1 << 30, "g"), (1 << 20, "m"), (1 << 10, "k")];
    for (scale, suffix) in UNITS {
        if bytes >= scale && bytes % scale == 0 {
            return format!("{}{suffix}", bytes / scale);
        }
    }
    bytes.to_string()
}
