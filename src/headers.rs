//! HTTP header collection.
//!
//! Header names are compared case-insensitively while retaining their
//! original case, and insertion order is maintained. Since messages rarely
//! carry more than a dozen headers, a plain vector with linear scans is both
//! simpler and faster than a map.

use std::io::{Read, Write};

use chrono::{DateTime, Utc};

use crate::date::parse_date;
use crate::io::read_line;
use crate::util::split;
use crate::{Error, Result, CRLF, MAX_HEADER_LINES};

/// A single HTTP header. The name is a non-empty trimmed token; the value is
/// trimmed but may be empty.
#[derive(Debug, Clone)]
pub struct Header {
    name: String,
    value: String,
}

impl Header {
    fn new(name: &str, value: &str) -> Option<Self> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        Some(Header {
            name: name.to_string(),
            value: value.trim().to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

/// An ordered collection of HTTP headers.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    headers: Vec<Header>,
}

impl Headers {
    pub fn new() -> Self {
        Headers {
            headers: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Returns the value of the first header with the given name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Returns the value of the first header with the given name, parsed as
    /// an HTTP date. An unparsable value yields None.
    pub fn get_date(&self, name: &str) -> Option<DateTime<Utc>> {
        self.get(name).and_then(|v| parse_date(v).ok())
    }

    /// Returns whether a header with the given name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Appends a header with the given name and value. Leading and trailing
    /// whitespace are trimmed; a header with an empty name is ignored.
    pub fn add(&mut self, name: &str, value: &str) {
        if let Some(header) = Header::new(name, value) {
            self.headers.push(header);
        }
    }

    /// Appends all the given headers in their original order.
    pub fn add_all(&mut self, other: &Headers) {
        for h in other.iter() {
            self.add(&h.name, &h.value);
        }
    }

    /// Adds a header with the given name and value, replacing the first
    /// existing header with the same name. Returns the replaced header, or
    /// None if the header was appended instead.
    pub fn replace(&mut self, name: &str, value: &str) -> Option<Header> {
        for h in self.headers.iter_mut() {
            if h.name.eq_ignore_ascii_case(name) {
                if let Some(header) = Header::new(name, value) {
                    return Some(std::mem::replace(h, header));
                }
                return None;
            }
        }
        self.add(name, value);
        None
    }

    /// Removes all headers with the given name.
    pub fn remove(&mut self, name: &str) {
        self.headers.retain(|h| !h.name.eq_ignore_ascii_case(name));
    }

    /// Iterates over the headers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.headers.iter()
    }

    /// Writes the headers to the given stream, including the CRLF that ends
    /// the header block.
    pub fn write_to(&self, out: &mut dyn Write) -> std::io::Result<()> {
        for h in &self.headers {
            out.write_all(h.name.as_bytes())?;
            out.write_all(b": ")?;
            out.write_all(h.value.as_bytes())?;
            out.write_all(CRLF)?;
        }
        out.write_all(CRLF)
    }

    /// Returns a header's parameters in order. The first key is the bare
    /// header value without its parameters (with an empty value), and
    /// quoted parameter values are stripped of their surrounding quotes.
    pub fn params(&self, name: &str) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if let Some(value) = self.get(name) {
            for param in split(value, ";", None) {
                let pair = split(&param, "=", Some(2));
                if pair.is_empty() {
                    continue;
                }
                let val = pair
                    .get(1)
                    .map(|v| v.trim_matches('"').to_string())
                    .unwrap_or_default();
                params.push((pair[0].clone(), val));
            }
        }
        params
    }

    /// Reads a header block from the given stream, up to and including the
    /// empty line that terminates it. Folded continuation lines are joined
    /// with a single space, and repeated headers are concatenated into a
    /// single element-list value.
    pub fn read_from(input: &mut dyn Read) -> Result<Headers> {
        let mut headers = Headers::new();
        let mut prev_line = String::new();
        let mut count = 0;
        loop {
            let mut line = read_line(input)?;
            if line.is_empty() {
                break;
            }
            let folded = line.starts_with(|c: char| c.is_whitespace());
            if folded {
                line = format!("{} {}", prev_line, line.trim_start());
            }
            let separator = line
                .find(':')
                .ok_or_else(|| Error::Protocol(format!("invalid header: \"{}\"", line)))?;
            let name = line[..separator].to_string();
            if name.trim().is_empty() {
                return Err(Error::Protocol(format!("invalid header: \"{}\"", line)));
            }
            let mut value = line[separator + 1..].trim().to_string();
            let replaced = headers.replace(&name, &value);
            // concatenate repeated headers (distinguishing repeated from folded)
            if let Some(prev) = replaced {
                if !folded {
                    value = format!("{}, {}", prev.value(), value);
                    line = format!("{}: {}", name, value);
                    headers.replace(&name, &value);
                }
            }
            prev_line = line;
            count += 1;
            if count > MAX_HEADER_LINES {
                return Err(Error::Protocol("too many header lines".to_string()));
            }
        }
        Ok(headers)
    }
}
