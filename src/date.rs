//! HTTP date parsing and formatting.
//!
//! Date header values are accepted in any of the three formats required for
//! backwards compatibility (RFC 1123, RFC 850 and asctime), while all
//! generated dates use RFC 1123 in GMT.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

use crate::{Error, Result};

/// The accepted date formats. All are interpreted as GMT.
const DATE_FORMATS: [&str; 3] = [
    // RFC 822, updated by RFC 1123
    "%a, %d %b %Y %H:%M:%S GMT",
    // RFC 850, obsoleted by RFC 1036
    "%A, %d-%b-%y %H:%M:%S GMT",
    // ANSI C's asctime() format
    "%a %b %e %H:%M:%S %Y",
];

/// Parses a date string in one of the supported formats:
///
/// ```text
/// Sun, 06 Nov 1994 08:49:37 GMT  ; RFC 822, updated by RFC 1123
/// Sunday, 06-Nov-94 08:49:37 GMT ; RFC 850, obsoleted by RFC 1036
/// Sun Nov  6 08:49:37 1994       ; ANSI C's asctime() format
/// ```
pub fn parse_date(s: &str) -> Result<DateTime<Utc>> {
    let s = s.trim();
    for format in DATE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    Err(Error::Protocol(format!("invalid date format: {}", s)))
}

/// Formats the given time as an RFC 1123 date string in GMT.
/// Supported for years 0001 through 9999.
pub fn format_date(time: DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
