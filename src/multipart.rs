//! multipart/form-data parsing.
//!
//! A `MultipartIterator` walks the parts of a multipart/form-data request
//! body, exposing each part's headers and a bounded stream over its
//! content. Parts must be read in order; advancing to the next part skips
//! whatever remains of the current one.

use std::io::{self, Read};

use crate::headers::Headers;
use crate::io::read_token;
use crate::request::{Body, Request};
use crate::{Error, Result};

// The reader driving the iteration: presents the bytes of the current part
// and stops (returns 0) at each encounter of the boundary delimiter.
pub struct MultipartReader<R: Read> {
    inner: R,
    delimiter: Vec<u8>, // CRLF + "--" + boundary
    buf: Vec<u8>,
    pos: usize,
    eof: bool,
    state: State,
}

#[derive(PartialEq)]
enum State {
    InPart,
    AtBoundary,
    Done,
}

impl<R: Read> MultipartReader<R> {
    pub fn new(inner: R, boundary: &[u8]) -> Self {
        let mut delimiter = b"\r\n--".to_vec();
        delimiter.extend_from_slice(boundary);
        // a virtual CRLF before the stream lets the first delimiter match
        // without a preceding one
        MultipartReader {
            inner,
            delimiter,
            buf: b"\r\n".to_vec(),
            pos: 0,
            eof: false,
            state: State::InPart,
        }
    }

    fn fill(&mut self) -> io::Result<()> {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        let mut chunk = [0u8; 1024];
        let n = self.inner.read(&mut chunk)?;
        if n == 0 {
            self.eof = true;
        } else {
            self.buf.extend_from_slice(&chunk[..n]);
        }
        Ok(())
    }

    // Ensures at least n bytes are buffered past the read position.
    fn need(&mut self, n: usize) -> io::Result<()> {
        while self.buf.len() - self.pos < n {
            if self.eof {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated multipart body",
                ));
            }
            self.fill()?;
        }
        Ok(())
    }

    /// Skips the rest of the current part and positions the reader at the
    /// start of the next one. Returns false once the closing delimiter has
    /// been reached.
    pub fn next_part(&mut self) -> Result<bool> {
        loop {
            match self.state {
                State::Done => return Ok(false),
                State::AtBoundary => break,
                State::InPart => {
                    let mut sink = [0u8; 1024];
                    self.read(&mut sink)?;
                }
            }
        }
        // consume the delimiter and inspect what follows: "--" closes the
        // multipart, otherwise the line ends and a part begins
        self.need(self.delimiter.len() + 2)?;
        self.pos += self.delimiter.len();
        if &self.buf[self.pos..self.pos + 2] == b"--" {
            self.state = State::Done;
            return Ok(false);
        }
        loop {
            self.need(1)?;
            let byte = self.buf[self.pos];
            self.pos += 1;
            if byte == b'\n' {
                break;
            }
        }
        self.state = State::InPart;
        Ok(true)
    }
}

impl<R: Read> Read for MultipartReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.state != State::InPart || out.is_empty() {
            return Ok(0);
        }
        loop {
            let available = &self.buf[self.pos..];
            if let Some(at) = find(available, &self.delimiter) {
                if at == 0 {
                    self.state = State::AtBoundary;
                    return Ok(0);
                }
                let n = at.min(out.len());
                out[..n].copy_from_slice(&available[..n]);
                self.pos += n;
                return Ok(n);
            }
            // no delimiter in sight: everything but a potential partial
            // match at the buffer end is part content
            let safe = available.len().saturating_sub(self.delimiter.len() - 1);
            if safe > 0 {
                let n = safe.min(out.len());
                out[..n].copy_from_slice(&available[..n]);
                self.pos += n;
                return Ok(n);
            }
            if self.eof {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "multipart body ended before the closing delimiter",
                ));
            }
            self.fill()?;
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// One part of a multipart/form-data body.
pub struct Part<'p, R: Read> {
    pub name: Option<String>,
    pub filename: Option<String>,
    pub headers: Headers,
    pub body: &'p mut MultipartReader<R>,
}

impl<R: Read> Part<'_, R> {
    /// Reads the part's content as a UTF-8 string (up to 8192 bytes).
    pub fn text(&mut self) -> Result<String> {
        let bytes = read_token(&mut *self.body, None, 8192)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Iterates over the parts of a multipart/form-data request.
pub struct MultipartIterator<R: Read> {
    source: MultipartReader<R>,
}

impl<'r, 'a> MultipartIterator<Body<'r, 'a>> {
    /// Creates an iterator over the given request's body. Fails if the
    /// request is not multipart/form-data or the boundary is missing.
    pub fn from_request(req: &'r mut Request<'a>) -> Result<Self> {
        let params = req.headers().params("Content-Type");
        if !params.iter().any(|(k, _)| k == "multipart/form-data") {
            return Err(Error::Protocol(
                "Content-Type is not multipart/form-data".to_string(),
            ));
        }
        let boundary = params
            .iter()
            .find(|(k, _)| k == "boundary")
            .map(|(_, v)| v.clone())
            .ok_or_else(|| Error::Protocol("Content-Type is missing boundary".to_string()))?;
        Ok(MultipartIterator {
            source: MultipartReader::new(req.body_mut(), boundary.as_bytes()),
        })
    }
}

impl<R: Read> MultipartIterator<R> {
    /// Advances to the next part and returns it, or None after the last
    /// one. The previous part's unread content is skipped.
    pub fn next_part(&mut self) -> Result<Option<Part<'_, R>>> {
        if !self.source.next_part()? {
            return Ok(None);
        }
        let headers = Headers::read_from(&mut self.source)?;
        let disposition = headers.params("Content-Disposition");
        let name = disposition
            .iter()
            .find(|(k, _)| k == "name")
            .map(|(_, v)| v.clone());
        let filename = disposition
            .iter()
            .find(|(k, _)| k == "filename")
            .map(|(_, v)| v.clone());
        Ok(Some(Part {
            name,
            filename,
            headers,
            body: &mut self.source,
        }))
    }
}
