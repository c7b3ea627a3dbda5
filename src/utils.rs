//! # Utility Functions
//!
//! Formatting and host helpers shared by the report, the logs and the
//! launcher.
//!
//! - **Report formatting**: [`format_g`] renders statistics the way C's `%g`
//!   does, so report lines stay compact and comparable with other tools
//! - **Log formatting**: human-readable durations and byte counts
//! - **Host information**: host name and unique run identifiers
//!
//! ```rust
//! use ring_latency::utils::*;
//! use std::time::Duration;
//!
//! assert_eq!(format_g(0.000012345678), "1.23457e-05");
//! assert_eq!(format_duration(Duration::from_micros(1500)), "1.50ms");
//! assert_eq!(format_bytes(65536), "64.00 KB");
//! ```

use std::time::Duration;
use uuid::Uuid;

/// Significant digits of [`format_g`]
const G_PRECISION: i32 = 6;

/// Format a float like C's `printf("%g", value)`
///
/// Six significant digits; scientific notation when the decimal exponent is
/// below -4 or at least 6; trailing zeros (and a dangling decimal point)
/// removed.
///
/// ```rust
/// # use ring_latency::utils::format_g;
/// assert_eq!(format_g(0.0), "0");
/// assert_eq!(format_g(3.0), "3");
/// assert_eq!(format_g(0.0001), "0.0001");
/// assert_eq!(format_g(1234567.0), "1.23457e+06");
/// ```
pub fn format_g(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if value == 0.0 {
        return if value.is_sign_negative() { "-0" } else { "0" }.to_string();
    }

    // Round to the target precision first; rounding can bump the exponent
    let scientific = format!("{:.*e}", (G_PRECISION - 1) as usize, value);
    let (mantissa, exponent) = match scientific.split_once('e') {
        Some(parts) => parts,
        None => return scientific,
    };
    let exponent: i32 = exponent.parse().unwrap_or(0);

    if exponent < -4 || exponent >= G_PRECISION {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!(
            "{}e{}{:02}",
            trim_fraction(mantissa),
            sign,
            exponent.abs()
        )
    } else {
        let decimals = (G_PRECISION - 1 - exponent).max(0) as usize;
        trim_fraction(&format!("{:.*}", decimals, value)).to_string()
    }
}

fn trim_fraction(number: &str) -> &str {
    if number.contains('.') {
        number.trim_end_matches('0').trim_end_matches('.')
    } else {
        number
    }
}

/// Generate a unique identifier for a run
///
/// Recorded in the JSON results so that files from repeated runs can be told
/// apart.
pub fn generate_run_id() -> String {
    Uuid::new_v4().to_string()
}

/// Name of the host this rank runs on
///
/// Falls back to `"unknown"` when the name cannot be read or is not UTF-8.
pub fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Phase duration for the log: the largest unit that keeps the value at or
/// above one, two decimals; minutes and seconds past a minute
pub fn format_duration(duration: Duration) -> String {
    const UNITS: [(&str, f64); 3] = [("s", 1.0), ("ms", 1e-3), ("μs", 1e-6)];

    let whole_secs = duration.as_secs();
    if whole_secs >= 60 {
        return format!("{}m {}s", whole_secs / 60, whole_secs % 60);
    }
    let secs = duration.as_secs_f64();
    match UNITS.iter().find(|(_, scale)| secs >= *scale) {
        Some((unit, scale)) => format!("{:.2}{}", secs / scale, unit),
        None => format!("{}ns", duration.as_nanos()),
    }
}

/// Format a byte count with binary units
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", size, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_g_fixed_range() {
        assert_eq!(format_g(1.0), "1");
        assert_eq!(format_g(16.0), "16");
        assert_eq!(format_g(0.5), "0.5");
        assert_eq!(format_g(123456.0), "123456");
        assert_eq!(format_g(0.000123456), "0.000123456");
        assert_eq!(format_g(2.5e-3), "0.0025");
        assert_eq!(format_g(-42.125), "-42.125");
    }

    #[test]
    fn test_format_g_scientific_range() {
        assert_eq!(format_g(1e-5), "1e-05");
        assert_eq!(format_g(3.14159265e-6), "3.14159e-06");
        assert_eq!(format_g(1e6), "1e+06");
        assert_eq!(format_g(9.876543e12), "9.87654e+12");
        assert_eq!(format_g(1.5e-100), "1.5e-100");
    }

    #[test]
    fn test_format_g_rounding_bumps_exponent() {
        assert_eq!(format_g(9999996.0), "1e+07");
        assert_eq!(format_g(0.00009999999), "0.0001");
    }

    #[test]
    fn test_format_g_special_values() {
        assert_eq!(format_g(0.0), "0");
        assert_eq!(format_g(f64::NAN), "nan");
        assert_eq!(format_g(f64::INFINITY), "inf");
        assert_eq!(format_g(f64::NEG_INFINITY), "-inf");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_nanos(500)), "500ns");
        assert_eq!(format_duration(Duration::from_nanos(1500)), "1.50μs");
        assert_eq!(format_duration(Duration::from_micros(1500)), "1.50ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "61m 1s");
        assert_eq!(format_duration(Duration::from_millis(1)), "1.00ms");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(64), "64 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(64 * 1024 * 1024), "64.00 MB");
    }

    #[test]
    fn test_run_ids_are_unique() {
        assert_ne!(generate_run_id(), generate_run_id());
        assert!(!hostname().is_empty());
    }
}
