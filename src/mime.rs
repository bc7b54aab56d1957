//! Content-type registry.
//!
//! A process-wide mapping of path suffixes (file extensions) to MIME types.
//! The map is effectively append-only and may be extended concurrently, e.g.
//! from a standard mime.types file.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::sync::RwLock;

use lazy_static::lazy_static;

use crate::util::split;
use crate::Result;

lazy_static! {
    static ref CONTENT_TYPES: RwLock<HashMap<String, String>> =
        RwLock::new(default_content_types());
}

/// The MIME types that can be compressed (prefix/suffix wildcards allowed).
const COMPRESSIBLE_CONTENT_TYPES: [&str; 5] =
    ["text/*", "*/javascript", "*icon", "*+xml", "*/json"];

fn default_content_types() -> HashMap<String, String> {
    let mut map = HashMap::new();
    // common defaults; see https://www.iana.org/assignments/media-types/
    let defaults: [(&str, &[&str]); 24] = [
        ("application/font-woff", &["woff"]),
        ("application/font-woff2", &["woff2"]),
        ("application/java-archive", &["jar"]),
        ("application/javascript", &["js"]),
        ("application/json", &["json"]),
        ("application/octet-stream", &["exe"]),
        ("application/pdf", &["pdf"]),
        ("application/x-7z-compressed", &["7z"]),
        ("application/x-compressed", &["tgz"]),
        ("application/x-gzip", &["gz"]),
        ("application/x-tar", &["tar"]),
        ("application/xhtml+xml", &["xhtml"]),
        ("application/zip", &["zip"]),
        ("audio/mpeg", &["mp3"]),
        ("image/gif", &["gif"]),
        ("image/jpeg", &["jpg", "jpeg"]),
        ("image/png", &["png"]),
        ("image/svg+xml", &["svg"]),
        ("image/x-icon", &["ico"]),
        ("text/css", &["css"]),
        ("text/csv", &["csv"]),
        ("text/html; charset=utf-8", &["htm", "html"]),
        ("text/plain", &["txt", "text", "log"]),
        ("text/xml", &["xml"]),
    ];
    for (content_type, suffixes) in defaults {
        for suffix in suffixes {
            map.insert(suffix.to_string(), content_type.to_string());
        }
    }
    map
}

/// Adds a content-type mapping for the given path suffixes, replacing any
/// previous mapping. Suffixes are case-insensitive, and the content type is
/// stored lowercased.
pub fn add_content_type(content_type: &str, suffixes: &[&str]) {
    let mut map = CONTENT_TYPES.write().unwrap_or_else(|e| e.into_inner());
    for suffix in suffixes {
        map.insert(
            suffix.to_ascii_lowercase(),
            content_type.to_ascii_lowercase(),
        );
    }
}

/// Adds content-type mappings from a standard mime.types stream: lines of
/// `type ext1 ext2 ...`, with '#' starting a comment.
pub fn add_content_types<R: Read>(input: R) -> Result<()> {
    for line in BufReader::new(input).lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let tokens = split(line, " \t", None);
        if let Some((content_type, suffixes)) = tokens.split_first() {
            for suffix in suffixes {
                add_content_type(content_type, &[suffix.as_str()]);
            }
        }
    }
    Ok(())
}

/// Returns the content type for the given path according to its suffix, or
/// the given default if none is known.
pub fn content_type_for(path: &str, default: &str) -> String {
    let suffix = match path.rfind('.') {
        Some(dot) => &path[dot + 1..],
        None => return default.to_string(),
    };
    let map = CONTENT_TYPES.read().unwrap_or_else(|e| e.into_inner());
    map.get(&suffix.to_ascii_lowercase())
        .cloned()
        .unwrap_or_else(|| default.to_string())
}

/// Checks whether data of the given content type is worth compressing.
pub fn is_compressible(content_type: &str) -> bool {
    let ct = match content_type.find(';') {
        Some(pos) => content_type[..pos].trim(),
        None => content_type.trim(),
    };
    COMPRESSIBLE_CONTENT_TYPES.iter().any(|p| {
        *p == ct
            || (p.starts_with('*') && ct.ends_with(&p[1..]))
            || (p.ends_with('*') && ct.starts_with(&p[..p.len() - 1]))
    })
}
