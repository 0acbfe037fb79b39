//! Timeframe literals and time-bucket math.
//!
//! Every component that touches a measurement or retention policy name goes
//! through the pure functions here, so naming cannot drift between the
//! writer, the resampler and the query resolver.

pub const DAY_MS: i64 = 1000 * 60 * 60 * 24;

const UNITS: [(i64, &str); 4] = [(DAY_MS, "d"), (3_600_000, "h"), (60_000, "m"), (1_000, "s")];

/// Compact human-readable form of a timeframe: `60000 → "1m"`,
/// `90000 → "1m30s"`, `86400000 → "1d"`, `500 → "500ms"`.
pub fn timeframe_literal(timeframe: i64) -> String {
    let mut out = String::new();
    let mut rest = timeframe;

    for (unit, label) in UNITS {
        if rest >= unit {
            out.push_str(&format!("{}{}", rest / unit, label));
            rest %= unit;
        }
    }

    if rest > 0 || out.is_empty() {
        out.push_str(&format!("{rest}ms"));
    }

    out
}

/// Measurement (table) name for a timeframe.
pub fn measurement_name(timeframe: i64) -> String {
    format!("trades_{}", timeframe_literal(timeframe))
}

/// Retention policy name for a timeframe.
pub fn retention_policy_name(prefix: &str, timeframe: i64) -> String {
    format!("{prefix}{}", timeframe_literal(timeframe))
}

/// A timeframe whose grid would drift against calendar days when anchored to
/// the epoch. Buckets for these restart at each day boundary.
pub fn is_odd_timeframe(timeframe: i64) -> bool {
    timeframe < DAY_MS && DAY_MS % timeframe != 0
}

/// Epoch-anchored bucket floor.
pub fn floor_time(timestamp: i64, timeframe: i64) -> i64 {
    timestamp / timeframe * timeframe
}

/// Day-anchored bucket floor, for timeframes that do not divide a day.
pub fn day_anchored_floor(timestamp: i64, timeframe: i64) -> i64 {
    let day_open = floor_time(timestamp, DAY_MS);
    day_open + (timestamp - day_open) / timeframe * timeframe
}

/// Bucket floor against a grid shifted by `phase` ms.
pub fn floor_with_phase(timestamp: i64, timeframe: i64, phase: i64) -> i64 {
    (timestamp - phase) / timeframe * timeframe + phase
}
