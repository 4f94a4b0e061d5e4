//! Human-readable formatting of byte counts and durations for progress notes.
use std::time::Duration;

/// Formats a byte count with binary (1024-based) units, e.g. `1.5 GiB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    const SUFFIXES: [&str; 6] = ["KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

    if bytes < UNIT {
        return format!("{bytes} B");
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT && exp < SUFFIXES.len() - 1 {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    format!("{:.1} {}", bytes as f64 / div as f64, SUFFIXES[exp])
}

/// Formats a duration in whole seconds, e.g. `3 minutes 2 seconds`.
pub fn format_duration(d: Duration) -> String {
    let mut seconds = d.as_secs();
    if seconds < 60 {
        return format!("{seconds} seconds");
    }
    let mut minutes = seconds / 60;
    seconds %= 60;
    if minutes < 60 {
        return format!("{minutes} minutes {seconds} seconds");
    }
    let hours = minutes / 60;
    minutes %= 60;
    format!("{hours} hours {minutes} minutes {seconds} seconds")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_use_binary_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(1_610_612_736), "1.5 GiB");
    }

    #[test]
    fn durations_roll_over_into_larger_units() {
        assert_eq!(format_duration(Duration::from_secs(42)), "42 seconds");
        assert_eq!(format_duration(Duration::from_secs(182)), "3 minutes 2 seconds");
        assert_eq!(
            format_duration(Duration::from_secs(3 * 3600 + 61)),
            "3 hours 1 minutes 1 seconds"
        );
    }
}
