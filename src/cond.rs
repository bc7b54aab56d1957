//! Conditional request evaluation and byte-range parsing.

use chrono::{DateTime, Utc};

use crate::request::Request;
use crate::util::{parse_ulong, split_elements};

/// Matches an ETag against a list of ETags from an If-Match/If-None-Match
/// header. A match is found if the ETag is present and either the list
/// contains "*" or one of its entries is identical to the ETag. Under
/// strong comparison, weak tags (prefixed "W/") never match.
pub fn match_etags(strong: bool, etags: &[String], etag: Option<&str>) -> bool {
    let etag = match etag {
        Some(e) => e,
        None => return false,
    };
    if strong && etag.starts_with("W/") {
        return false;
    }
    etags
        .iter()
        .any(|e| e == "*" || (e == etag && !(strong && e.starts_with("W/"))))
}

/// Calculates the appropriate response status for the given request and its
/// resource's last-modified time and ETag, based on the conditional headers
/// present in the request. Precedence follows RFC 7232: If-Match, then
/// If-Unmodified-Since, then If-None-Match, then If-Modified-Since.
pub fn conditional_status(req: &Request<'_>, last_modified: DateTime<Utc>, etag: &str) -> u16 {
    let headers = req.headers();
    // If-Match
    if let Some(header) = headers.get("If-Match") {
        if !match_etags(true, &split_elements(Some(header), false), Some(etag)) {
            return 412;
        }
    }
    // If-Unmodified-Since
    if let Some(date) = headers.get_date("If-Unmodified-Since") {
        if last_modified > date {
            return 412;
        }
    }
    // If-Modified-Since
    let mut status = 200;
    let mut force = false;
    if let Some(date) = headers.get_date("If-Modified-Since") {
        if date <= Utc::now() {
            if last_modified > date {
                force = true;
            } else {
                status = 304;
            }
        }
    }
    // If-None-Match (weak comparison per RFC 7232 section 3.2)
    if let Some(header) = headers.get("If-None-Match") {
        if match_etags(false, &split_elements(Some(header), false), Some(etag)) {
            status = if req.method() == "GET" || req.method() == "HEAD" {
                304
            } else {
                412
            };
        } else {
            force = true;
        }
    }
    if force {
        200
    } else {
        status
    }
}

/// Returns the absolute (zero-based, inclusive) content range covering all
/// the byte-range specs in the given Range header value (without its
/// "bytes=" prefix). An invalid range value yields None, so that the header
/// is ignored per RFC 2616 section 14.35.1. The returned start may be at or
/// beyond the resource length; the caller must answer 416 in that case.
pub fn parse_range(range: &str, length: u64) -> Option<(u64, u64)> {
    if length == 0 {
        return None;
    }
    let mut min = u64::MAX;
    let mut max: Option<u64> = None;
    for token in split_elements(Some(range), false) {
        let dash = token.find('-')?;
        let (start, end) = if dash == 0 {
            // suffix range: last N bytes
            let n = parse_ulong(&token[1..], 10).ok()?;
            (length.saturating_sub(n), length - 1)
        } else if dash == token.len() - 1 {
            // open range: from N to end
            (parse_ulong(&token[..dash], 10).ok()?, length - 1)
        } else {
            // explicit range
            (
                parse_ulong(&token[..dash], 10).ok()?,
                parse_ulong(&token[dash + 1..], 10).ok()?,
            )
        };
        if end < start {
            return None;
        }
        min = min.min(start);
        max = Some(max.map_or(end, |m| m.max(end)));
    }
    let mut max = max?;
    if max >= length && min < length {
        max = length - 1;
    }
    Some((min, max))
}
