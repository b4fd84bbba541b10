//! Display helpers for durations and rates.

/// Format milliseconds as `hh:mm:ss`. Hours are not wrapped at 24.
pub fn format_time(ms: u64) -> String {
    let total_seconds = ms / 1000;
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

/// Tasks per hour, rounded. Zero when either input is zero.
pub fn rph(ms: u64, count: u64) -> u64 {
    if ms == 0 || count == 0 {
        return 0;
    }
    let hours = ms as f64 / 3_600_000.0;
    (count as f64 / hours).round() as u64
}

/// Average seconds per task, rounded. Zero when either input is zero.
pub fn average_seconds(ms: u64, count: u64) -> u64 {
    if ms == 0 || count == 0 {
        return 0;
    }
    (ms as f64 / 1000.0 / count as f64).round() as u64
}
