//! String and token utilities shared across the protocol code.

use crate::{Error, Result};

/// Splits a comma-separated header element list into its non-empty trimmed
/// elements. Empty elements are ignored.
pub fn split_elements(list: Option<&str>, lower: bool) -> Vec<String> {
    match list {
        None => Vec::new(),
        Some(l) => {
            if lower {
                split(&l.to_ascii_lowercase(), ",", None)
            } else {
                split(l, ",", None)
            }
        }
    }
}

/// Splits a string into its non-empty trimmed elements, delimited by any of
/// the given delimiter characters. If a limit is given, at most that many
/// elements are produced, with the remainder of the string in the last one.
pub fn split(s: &str, delimiters: &str, limit: Option<usize>) -> Vec<String> {
    let mut elements = Vec::new();
    let len = s.len();
    let mut start = 0;
    let mut remaining = limit;
    while start < len {
        let end = match remaining {
            Some(1) => len,
            _ => s[start..]
                .char_indices()
                .find(|(_, c)| delimiters.contains(*c))
                .map(|(i, _)| start + i)
                .unwrap_or(len),
        };
        if let Some(r) = remaining.as_mut() {
            *r = r.saturating_sub(1);
        }
        let element = s[start..end].trim();
        if !element.is_empty() {
            elements.push(element.to_string());
        }
        start = end + 1;
    }
    elements
}

/// Parses an unsigned integer in the given radix, rejecting a leading
/// ASCII minus or plus sign.
pub fn parse_ulong(s: &str, radix: u32) -> Result<u64> {
    if s.starts_with('+') || s.starts_with('-') {
        return Err(Error::Protocol(format!("invalid digit: {}", &s[..1])));
    }
    u64::from_str_radix(s, radix)
        .map_err(|_| Error::Protocol(format!("invalid number: \"{}\"", s)))
}

/// Replaces consecutive duplicate occurrences of the given character with a
/// single instance.
pub fn trim_duplicates(s: &str, c: char) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_was = false;
    for ch in s.chars() {
        if ch == c {
            if last_was {
                continue;
            }
            last_was = true;
        } else {
            last_was = false;
        }
        out.push(ch);
    }
    out
}

/// Returns the parent of the given path, excluding the trailing slash, or
/// None if the path is the root path.
pub fn parent_path(path: &str) -> Option<&str> {
    let path = path.trim_end_matches('/');
    path.rfind('/').map(|slash| &path[..slash])
}

/// Returns a human-friendly string approximating the given data size,
/// e.g. "316 ", "1.8K", "324M".
pub fn size_approx(size: u64) -> String {
    const UNITS: [char; 7] = [' ', 'K', 'M', 'G', 'T', 'P', 'E'];
    let mut u = 0;
    let mut s = size as f64;
    while s >= 1000.0 && u < UNITS.len() - 1 {
        u += 1;
        s /= 1024.0;
    }
    if s < 10.0 && u > 0 {
        format!("{:.1}{}", s, UNITS[u])
    } else {
        format!("{:.0}{}", s, UNITS[u])
    }
}

/// Returns an HTML-escaped version of the given string, safe for display
/// inside element content and attribute values.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 30);
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '>' => out.push_str("&gt;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Returns the local host's name, falling back to "localhost".
pub fn local_host_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}
