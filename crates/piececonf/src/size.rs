//! Human readable byte sizes ("500MiB", "2g", "1.5 GB").
//!
//! Every unit is a binary multiple, so "1k", "1kb" and "1KiB" all mean 1024.

use crate::ConfigError;

const UNITS: &[(&str, u64)] = &[
    ("", 1),
    ("b", 1),
    ("k", 1 << 10),
    ("m", 1 << 20),
    ("g", 1 << 30),
    ("t", 1 << 40),
    ("p", 1 << 50),
];

/// Parse a size string into bytes.
pub fn parse_size(input: &str) -> Result<u64, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidSize {
        value: input.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, suffix) = trimmed.split_at(split);
    if number.is_empty() {
        return Err(invalid("missing number"));
    }

    let suffix = suffix.trim().to_ascii_lowercase();
    let unit = suffix
        .strip_suffix("ib")
        .or_else(|| suffix.strip_suffix('b').filter(|u| !u.is_empty()))
        .unwrap_or(suffix.as_str());
    let multiplier = UNITS
        .iter()
        .find(|(name, _)| *name == unit)
        .map(|(_, m)| *m)
        .ok_or_else(|| invalid("unknown unit"))?;

    let value: f64 = number.parse().map_err(|_| invalid("malformed number"))?;
    let bytes = value * multiplier as f64;
    if !bytes.is_finite() || bytes >= u64::MAX as f64 {
        return Err(invalid("out of range"));
    }
    Ok(bytes as u64)
}
