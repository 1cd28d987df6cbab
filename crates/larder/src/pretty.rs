//! Human-readable rendering helpers for log output and item descriptions

use crate::key::ItemKey;
use std::time::Duration;

/// Length of the shortened key rendering used in descriptions
const SHORT_KEY_LEN: usize = 10;

/// Shortened hex rendering of an item key, for labels and logs
#[must_use]
pub fn short_key(key: &ItemKey) -> String {
    let hex = key.to_hex();
    hex[..SHORT_KEY_LEN].to_string()
}

/// Render a byte count with a binary unit suffix
#[must_use]
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Render a duration at a resolution fitting its magnitude
#[must_use]
pub fn human_duration(d: Duration) -> String {
    let secs = d.as_secs_f64();
    if secs < 1.0 {
        format!("{}ms", d.as_millis())
    } else if secs < 60.0 {
        format!("{secs:.1}s")
    } else if secs < 3600.0 {
        format!("{:.1}m", secs / 60.0)
    } else {
        format!("{:.1}h", secs / 3600.0)
    }
}
