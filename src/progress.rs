//! Percent, transfer-rate and size formatting helpers used by the download
//! engine and the listings.

use std::num::NonZeroU64;

/// Rate reported when nothing meaningful can be computed.
pub const ZERO_RATE: &str = "0 bps";

/// Parses a transport-provided length header into a usable total.
///
/// Anything that is not a positive integer (absent, empty, `0`, negative,
/// garbage) yields `None`.
pub fn parse_total(raw: &str) -> Option<NonZeroU64> {
    raw.trim().parse::<u64>().ok().and_then(NonZeroU64::new)
}

/// Percent of `total` covered by `loaded`, clamped to `[0, 100]` and rounded
/// to one decimal place. Unknown totals report `0`.
pub fn percent(loaded: u64, total: Option<NonZeroU64>) -> f64 {
    let Some(total) = total else {
        return 0.0;
    };
    let raw = loaded as f64 / total.get() as f64 * 100.0;
    round_tenth(raw.clamp(0.0, 100.0))
}

/// Renders a percent the way update events carry it, e.g. `"33.3"`.
pub fn format_percent(value: f64) -> String {
    format!("{:.1}", value)
}

/// Human readable bit rate for `bytes` transferred over `elapsed_ms`.
///
/// Units scale by powers of 1000 and stop at megabits.
pub fn rate(bytes: u64, elapsed_ms: f64) -> String {
    if !elapsed_ms.is_finite() || elapsed_ms <= 0.0 {
        return ZERO_RATE.to_string();
    }

    let bps = (bytes as f64 * 8.0) / (elapsed_ms / 1000.0);
    if !bps.is_finite() || bps == 0.0 {
        return ZERO_RATE.to_string();
    }

    if bps < 1_000.0 {
        format!("{:.1} bps", bps)
    } else if bps < 1_000_000.0 {
        format!("{:.1} kbps", bps / 1_000.0)
    } else {
        format!("{:.1} mbps", bps / 1_000_000.0)
    }
}

/// Binary-prefixed file size, e.g. `"1.5 MB"`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    format!("{:.1} {}", value, UNITS[unit])
}

fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn total(n: u64) -> Option<NonZeroU64> {
        NonZeroU64::new(n)
    }

    #[test]
    fn test_percent_unknown_total_is_zero() {
        assert_eq!(percent(500, None), 0.0);
        assert_eq!(percent(500, total(0)), 0.0);
        assert_eq!(percent(0, parse_total("-12")), 0.0);
        assert_eq!(percent(10, parse_total("NaN")), 0.0);
    }

    #[test]
    fn test_percent_bounds_and_rounding() {
        assert_eq!(percent(1000, total(3000)), 33.3);
        assert_eq!(percent(2000, total(3000)), 66.7);
        assert_eq!(percent(3000, total(3000)), 100.0);
        assert_eq!(percent(0, total(3000)), 0.0);
        // More bytes than declared never escapes the range.
        assert_eq!(percent(4500, total(3000)), 100.0);

        for loaded in (0..=7).map(|n| n * 137) {
            let p = percent(loaded, total(959));
            assert!((0.0..=100.0).contains(&p));
            assert_eq!(p, (p * 10.0).round() / 10.0);
        }
    }

    #[test]
    fn test_format_percent() {
        assert_eq!(format_percent(percent(1000, total(3000))), "33.3");
        assert_eq!(format_percent(0.0), "0.0");
        assert_eq!(format_percent(100.0), "100.0");
    }

    #[test]
    fn test_parse_total() {
        assert_eq!(parse_total("3000"), total(3000));
        assert_eq!(parse_total(" 42 "), total(42));
        assert_eq!(parse_total("0"), None);
        assert_eq!(parse_total(""), None);
        assert_eq!(parse_total("-5"), None);
        assert_eq!(parse_total("12abc"), None);
    }

    #[test]
    fn test_rate_sentinel() {
        assert_eq!(rate(1000, 0.0), ZERO_RATE);
        assert_eq!(rate(1000, -250.0), ZERO_RATE);
        assert_eq!(rate(1000, f64::NAN), ZERO_RATE);
        assert_eq!(rate(0, 1000.0), ZERO_RATE);
    }

    #[test]
    fn test_rate_units() {
        assert_eq!(rate(125_000, 1000.0), "1.0 mbps");
        assert_eq!(rate(125, 1000.0), "1.0 kbps");
        assert_eq!(rate(12, 1000.0), "96.0 bps");
        assert_eq!(rate(250_000_000, 1000.0), "2000.0 mbps");
        assert_eq!(rate(500, 2000.0), "2.0 kbps");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512.0 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }
}
