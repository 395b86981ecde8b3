// src/server/range.rs

//! HTTP Range header parsing. The grammar accepts multiple ranges; the
//! handler only ever serves the first one.

use crate::core::ProxyError;

/// Upper bound used to close open-ended ranges.
pub const LIMIT_RANGE: i64 = 1024 * 1024;

/// One parsed range. `length` carries the inclusive end position as sent by
/// the client; normalization against the body happens in `valid_range`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpRange {
    pub start: i64,
    pub length: i64,
}

/// Parses a `Range` header value such as:
///
///   "bytes=100-200"
///   "bytes=-50"
///   "bytes=150-"
///   "bytes=0-0,-1"
///
/// Returns `None` when the header is absent-equivalent (empty value or a
/// zero-length body).
pub fn parse_range(
    s: &str,
    defsize: i64,
    size: i64,
) -> Result<Option<Vec<HttpRange>>, ProxyError> {
    if s.is_empty() || size == 0 {
        return Ok(None);
    }

    let Some(rest) = s.strip_prefix("bytes=") else {
        return Err(ProxyError::InvalidRange);
    };

    let mut ranges = Vec::new();
    for ra in rest.split(',') {
        let ra = ra.trim();
        if ra.is_empty() {
            continue;
        }

        let mut start: i64 = 0;
        let mut length: i64 = size;
        for (i, pa) in ra.split('-').enumerate() {
            if pa.is_empty() {
                continue;
            }
            let v: i64 = pa.parse().map_err(|_| ProxyError::InvalidRange)?;
            if i == 0 {
                start = v;
            } else {
                length = v;
            }
        }

        if start >= 0 {
            if length == -1 {
                length = start + defsize;
            }
            ranges.push(HttpRange { start, length });
        }
    }

    if ranges.is_empty() {
        return Err(ProxyError::NoRange);
    }
    Ok(Some(ranges))
}
