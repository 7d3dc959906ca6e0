//! Parsing of ffmpeg's `-progress pipe:1` key/value stream

/// Convert one progress line into a percentage of `duration_secs`.
///
/// ffmpeg emits `out_time_us=<micros>` and, for historical reasons, also
/// `out_time_ms=<micros>` (the value is microseconds despite the name).
/// Returns `None` for unrelated keys, `N/A` values, or a non-positive duration.
/// The result is clamped to `[0, 100]`.
pub fn parse_progress_line(line: &str, duration_secs: f64) -> Option<f64> {
    if !(duration_secs > 0.0) {
        return None;
    }

    let (key, value) = line.trim().split_once('=')?;
    let micros = match key {
        "out_time_us" | "out_time_ms" => value.trim().parse::<i64>().ok()?,
        "progress" if value.trim() == "end" => return Some(100.0),
        _ => return None,
    };

    let secs = micros.max(0) as f64 / 1_000_000.0;
    Some((secs / duration_secs * 100.0).clamp(0.0, 100.0))
}
