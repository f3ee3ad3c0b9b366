//! Human readable sizes ("150M", "2G") and their byte counts.

use std::sync::LazyLock;

use regex::Regex;

/// Partitions smaller than this are rejected.
pub const MINIMUM_PARTITION_SIZE: u64 = 1 << 20;

static SIZE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9]*\.?[0-9]*)([bkmgtp])?$").unwrap());

/// Errors parsing a size.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SizeError {
    /// The text is not a number with an optional unit suffix.
    #[error("Invalid size: {0:?}")]
    InvalidFormat(String),
}

/// A binary size unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeUnit {
    /// Bytes
    B,
    /// Kibibytes
    K,
    /// Mebibytes
    M,
    /// Gibibytes
    G,
    /// Tebibytes
    T,
    /// Pebibytes
    P,
}

impl SizeUnit {
    /// Largest first.
    const DESCENDING: [SizeUnit; 6] = [
        SizeUnit::P,
        SizeUnit::T,
        SizeUnit::G,
        SizeUnit::M,
        SizeUnit::K,
        SizeUnit::B,
    ];

    fn shift(self) -> u32 {
        match self {
            SizeUnit::B => 0,
            SizeUnit::K => 10,
            SizeUnit::M => 20,
            SizeUnit::G => 30,
            SizeUnit::T => 40,
            SizeUnit::P => 50,
        }
    }

    /// The number of bytes in one of this unit.
    pub fn bytes(self) -> u64 {
        1 << self.shift()
    }

    /// Decimal places shown when the caller does not ask for a precision.
    pub fn default_precision(self) -> usize {
        match self {
            SizeUnit::B => 0,
            SizeUnit::K => 1,
            SizeUnit::M => 2,
            SizeUnit::G => 3,
            SizeUnit::T => 4,
            SizeUnit::P => 5,
        }
    }

    /// The single-letter suffix.
    pub fn suffix(self) -> char {
        match self {
            SizeUnit::B => 'B',
            SizeUnit::K => 'K',
            SizeUnit::M => 'M',
            SizeUnit::G => 'G',
            SizeUnit::T => 'T',
            SizeUnit::P => 'P',
        }
    }

    /// Parse a single-letter suffix, case-insensitively.
    pub fn from_suffix(c: char) -> Option<Self> {
        Self::DESCENDING
            .into_iter()
            .find(|u| u.suffix().eq_ignore_ascii_case(&c))
    }
}

/// Whether `text` has the shape of a size: digits with an optional decimal
/// point and an optional unit letter.
pub fn is_size_syntax(text: &str) -> bool {
    SIZE_RE.is_match(&text.trim().to_ascii_lowercase())
}

/// Parse a size such as `150M`, `1.5g` or `4096` into bytes.
///
/// A missing unit means the number is already a byte count. Fractional
/// results are rounded to the nearest byte.
pub fn parse_size(text: &str) -> Result<u64, SizeError> {
    let invalid = || SizeError::InvalidFormat(text.to_owned());
    let lower = text.trim().to_ascii_lowercase();
    let Some(caps) = SIZE_RE.captures(&lower) else {
        return lower.parse::<u64>().map_err(|_| invalid());
    };
    let value: f64 = caps[1].parse().map_err(|_| invalid())?;
    let unit = caps
        .get(2)
        .and_then(|m| m.as_str().chars().next())
        .and_then(SizeUnit::from_suffix)
        .unwrap_or(SizeUnit::B);
    let bytes = (value * unit.bytes() as f64).round();
    // u64::MAX rounds up to 2^64 as a float
    if !bytes.is_finite() || bytes >= u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(bytes as u64)
}

/// Format `bytes` for humans.
///
/// Without a `unit` the largest unit giving a quotient of at least one is
/// used. Without a `precision` the unit's default is used. Trailing zeros
/// after the decimal point are dropped, and zero is always `"0"`.
pub fn format_size(bytes: u64, unit: Option<SizeUnit>, precision: Option<usize>) -> String {
    if bytes == 0 {
        return "0".to_owned();
    }
    let value = bytes as f64;
    let unit = unit.unwrap_or_else(|| {
        SizeUnit::DESCENDING
            .into_iter()
            .find(|u| value / u.bytes() as f64 >= 1.0)
            .unwrap_or(SizeUnit::B)
    });
    let precision = precision.unwrap_or_else(|| unit.default_precision());
    let mut r = format!("{:.*}", precision, value / unit.bytes() as f64);
    if r.contains('.') {
        r.truncate(r.trim_end_matches('0').trim_end_matches('.').len());
    }
    if unit != SizeUnit::B {
        r.push(unit.suffix());
    }
    r
}
