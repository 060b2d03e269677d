#![forbid(unsafe_code)]

//! HTTP byte-range grammar (RFC 7233 / RFC 9110) for range-fetching clients.
//!
//! This crate is the pure string layer beneath the remote blob reader: it
//! formats multi-range `Range` request headers, parses and validates
//! `Content-Range` response headers, and extracts the boundary parameter from
//! `multipart/byteranges` content types. It performs no I/O.
//!
//! The parsers are intentionally defensive:
//! - Headers over [`MAX_CONTENT_RANGE_LEN`] are rejected before scanning.
//! - Boundaries over [`MAX_BOUNDARY_LEN`] are rejected (RFC 2046 caps them at
//!   70 characters; the limit here is looser but still bounds allocations
//!   driven by untrusted servers).
//! - Integers are validated digit-by-digit with overflow checks rather than
//!   trusting `str::parse` (which accepts a leading `+`).

use std::fmt;

/// Maximum accepted `Content-Range` header length.
pub const MAX_CONTENT_RANGE_LEN: usize = 512;

/// Maximum accepted `multipart/byteranges` boundary length.
pub const MAX_BOUNDARY_LEN: usize = 256;

const MAX_DECIMAL_DIGITS: usize = 20; // u64::MAX is 20 digits.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentRangeError {
    /// Header exceeded [`MAX_CONTENT_RANGE_LEN`].
    HeaderTooLarge { len: usize, max: usize },
    /// Range unit was not `bytes`.
    UnsupportedUnit,
    /// General syntax error.
    InvalidSyntax,
    /// A number did not fit in `u64` or was otherwise invalid.
    InvalidNumber,
    /// `last-byte-pos` was smaller than `first-byte-pos`.
    EndBeforeStart { start: u64, end: u64 },
    /// The range lies outside the declared complete length.
    OutOfBounds { end: u64, total: u64 },
    /// The declared complete length differs from the expected one.
    TotalMismatch { expected: u64, actual: u64 },
}

impl fmt::Display for ContentRangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeaderTooLarge { len, max } => write!(
                f,
                "Content-Range header length {len} exceeds maximum accepted length {max}"
            ),
            Self::UnsupportedUnit => write!(f, "unsupported Content-Range unit (expected bytes)"),
            Self::InvalidSyntax => write!(f, "invalid Content-Range header syntax"),
            Self::InvalidNumber => write!(f, "invalid Content-Range number"),
            Self::EndBeforeStart { start, end } => {
                write!(f, "Content-Range end {end} precedes start {start}")
            }
            Self::OutOfBounds { end, total } => {
                write!(f, "Content-Range end {end} outside complete length {total}")
            }
            Self::TotalMismatch { expected, actual } => write!(
                f,
                "Content-Range complete length {actual} does not match expected {expected}"
            ),
        }
    }
}

impl std::error::Error for ContentRangeError {}

/// A parsed `Content-Range: bytes <start>-<end>/<total>` header.
///
/// `end` is inclusive, matching the wire form. `total` is `None` when the
/// server sent an unknown complete length (`*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: Option<u64>,
}

impl ContentRange {
    /// Number of bytes the range covers.
    pub fn len(&self) -> u64 {
        (self.end - self.start).saturating_add(1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Format a `Range` request header value for a set of inclusive byte ranges,
/// e.g. `bytes=0-2,6-8`.
///
/// Returns `None` for an empty set or any range with `start > end`; such a
/// header would be rejected by conforming servers.
pub fn format_range_header(ranges: &[(u64, u64)]) -> Option<String> {
    if ranges.is_empty() {
        return None;
    }
    let mut out = String::from("bytes=");
    for (i, &(start, end)) in ranges.iter().enumerate() {
        if start > end {
            return None;
        }
        if i > 0 {
            out.push(',');
        }
        out.push_str(&start.to_string());
        out.push('-');
        out.push_str(&end.to_string());
    }
    Some(out)
}

/// Parse a `Content-Range` header value.
///
/// Accepts `bytes <start>-<end>/<total>` and `bytes <start>-<end>/*`. The
/// unsatisfied-range form (`bytes */<total>`) is rejected: a client that
/// asked for a range it computed from the blob size never expects it.
///
/// When `expected_total` is given, a numeric complete length must match it;
/// `*` is accepted as-is.
pub fn parse_content_range(
    value: &str,
    expected_total: Option<u64>,
) -> Result<ContentRange, ContentRangeError> {
    if value.len() > MAX_CONTENT_RANGE_LEN {
        return Err(ContentRangeError::HeaderTooLarge {
            len: value.len(),
            max: MAX_CONTENT_RANGE_LEN,
        });
    }

    let trimmed = value.trim();
    let Some(rest) = strip_unit(trimmed) else {
        return Err(ContentRangeError::UnsupportedUnit);
    };
    let rest = rest.trim_start();

    let Some((range_part, total_part)) = rest.split_once('/') else {
        return Err(ContentRangeError::InvalidSyntax);
    };
    let (range_part, total_part) = (range_part.trim(), total_part.trim());

    let Some((start_str, end_str)) = range_part.split_once('-') else {
        return Err(ContentRangeError::InvalidSyntax);
    };
    let start = parse_u64_decimal(start_str.trim())?;
    let end = parse_u64_decimal(end_str.trim())?;
    if end < start {
        return Err(ContentRangeError::EndBeforeStart { start, end });
    }

    let total = if total_part == "*" {
        None
    } else {
        let total = parse_u64_decimal(total_part)?;
        if end >= total {
            return Err(ContentRangeError::OutOfBounds { end, total });
        }
        Some(total)
    };

    if let (Some(expected), Some(actual)) = (expected_total, total) {
        if actual != expected {
            return Err(ContentRangeError::TotalMismatch {
                expected,
                actual,
            });
        }
    }

    Ok(ContentRange { start, end, total })
}

/// Extract the boundary parameter from a `multipart/byteranges` content type.
///
/// Any `multipart/*` subtype is accepted: registries have been observed
/// labeling byte-range bodies `multipart/mixed` and similar. Returns `None`
/// when the media type is not multipart, the boundary parameter is missing or
/// empty, or the boundary exceeds [`MAX_BOUNDARY_LEN`].
pub fn multipart_boundary(content_type: &str) -> Option<String> {
    if content_type.len() > MAX_CONTENT_RANGE_LEN {
        return None;
    }

    let mut params = content_type.split(';');
    let media_type = params.next()?.trim();
    let prefix = media_type.get(.."multipart/".len())?;
    if !prefix.eq_ignore_ascii_case("multipart/") {
        return None;
    }

    for param in params {
        let Some((name, val)) = param.split_once('=') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case("boundary") {
            continue;
        }
        let val = val.trim();
        let val = val
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(val);
        if val.is_empty() || val.len() > MAX_BOUNDARY_LEN {
            return None;
        }
        return Some(val.to_string());
    }
    None
}

fn strip_unit(value: &str) -> Option<&str> {
    let unit = value.get(.."bytes".len())?;
    let rest = value.get("bytes".len()..)?;
    if unit.eq_ignore_ascii_case("bytes") && rest.starts_with(' ') {
        Some(rest)
    } else {
        None
    }
}

fn parse_u64_decimal(s: &str) -> Result<u64, ContentRangeError> {
    if s.is_empty() || s.len() > MAX_DECIMAL_DIGITS {
        return Err(ContentRangeError::InvalidNumber);
    }
    let mut value: u64 = 0;
    for b in s.bytes() {
        if !b.is_ascii_digit() {
            return Err(ContentRangeError::InvalidNumber);
        }
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as u64))
            .ok_or(ContentRangeError::InvalidNumber)?;
    }
    Ok(value)
}
