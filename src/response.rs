//! HTTP response writing.
//!
//! A `Response` buffers header choices until they are sent, then lazily
//! composes a chain of body encoders (chunked framing, gzip or deflate
//! compression) according to the headers that were actually written.
//! Closing the response finishes the encoder chain and flushes the
//! underlying sink, but never closes the connection stream itself.

use std::io::{self, Read, Write};
use std::mem;

use chrono::{DateTime, Utc};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use percent_encoding::{utf8_percent_encode, CONTROLS};

use crate::date::format_date;
use crate::headers::Headers;
use crate::io::{transfer, ChunkedWriter};
use crate::mime::is_compressible;
use crate::request::Request;
use crate::util::{escape_html, split_elements};
use crate::{Error, Result};

/// The Server header value identifying this implementation.
pub const SERVER_ID: &str = concat!("plume/", env!("CARGO_PKG_VERSION"));

/// Returns the reason phrase for the given status code.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        200 => "OK",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        412 => "Precondition Failed",
        413 => "Request Entity Too Large",
        414 => "Request-URI Too Large",
        416 => "Requested Range Not Satisfiable",
        417 => "Expectation Failed",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Time-out",
        _ => "Unknown Status",
    }
}

type Out<'a> = &'a mut (dyn Write + Send);

// The layer under a compression encoder: the raw sink, possibly wrapped in
// chunked framing.
enum Inner<'a> {
    Plain(Out<'a>),
    Chunked(ChunkedWriter<Out<'a>>),
}

impl<'a> Inner<'a> {
    fn finish(self) -> io::Result<Out<'a>> {
        match self {
            Inner::Plain(w) => Ok(w),
            Inner::Chunked(c) => c.finish(),
        }
    }
}

impl Write for Inner<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Inner::Plain(w) => w.write(buf),
            Inner::Chunked(c) => c.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Inner::Plain(w) => w.flush(),
            Inner::Chunked(c) => c.flush(),
        }
    }
}

// The composed body encoder chain. Finishing it writes any encoder
// trailers (gzip footer, chunked terminator) and hands back the sink,
// leaving the connection stream open.
enum BodyWriter<'a> {
    Identity(Out<'a>),
    Chunked(ChunkedWriter<Out<'a>>),
    Gzip(GzEncoder<Inner<'a>>),
    Deflate(ZlibEncoder<Inner<'a>>),
}

impl<'a> BodyWriter<'a> {
    fn finish(self) -> io::Result<Out<'a>> {
        match self {
            BodyWriter::Identity(w) => Ok(w),
            BodyWriter::Chunked(c) => c.finish(),
            BodyWriter::Gzip(g) => g.finish()?.finish(),
            BodyWriter::Deflate(d) => d.finish()?.finish(),
        }
    }
}

impl Write for BodyWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            BodyWriter::Identity(w) => w.write(buf),
            BodyWriter::Chunked(c) => c.write(buf),
            BodyWriter::Gzip(g) => g.write(buf),
            BodyWriter::Deflate(d) => d.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            BodyWriter::Identity(w) => w.flush(),
            BodyWriter::Chunked(c) => c.flush(),
            BodyWriter::Gzip(g) => g.flush(),
            BodyWriter::Deflate(d) => d.flush(),
        }
    }
}

enum Sink<'a> {
    Direct(Out<'a>),
    Body(BodyWriter<'a>),
    Closed,
}

// A snapshot of the client capabilities relevant to the response: taken
// from the request when the transaction is bound, so request and response
// can be borrowed independently.
#[derive(Default)]
struct ClientCaps {
    http11: bool,
    encodings: Vec<String>,
    wants_close: bool,
}

/// A single HTTP response, paired with a request before handler invocation.
pub struct Response<'a> {
    sink: Sink<'a>,
    headers: Headers,
    headers_sent: bool,
    discard_body: bool,
    client: ClientCaps,
}

impl<'a> Response<'a> {
    /// Creates a response writing to the given sink.
    pub fn new(out: Out<'a>) -> Response<'a> {
        Response {
            sink: Sink::Direct(out),
            headers: Headers::new(),
            headers_sent: false,
            discard_body: false,
            client: ClientCaps::default(),
        }
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The response headers; mutable only until they are sent.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Sets whether the response body is discarded instead of sent (HEAD).
    pub fn set_discard_body(&mut self, discard: bool) {
        self.discard_body = discard;
    }

    /// Whether the response headers were already sent.
    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    /// Captures the capabilities of the client that sent the given request
    /// (protocol version, accepted encodings, connection persistence wish).
    pub fn set_client(&mut self, req: &Request<'_>) {
        self.client = ClientCaps {
            http11: req.version().ends_with("1.1"),
            encodings: split_elements(req.headers().get("Accept-Encoding"), true),
            wants_close: req
                .headers()
                .get("Connection")
                .map_or(false, |v| v.eq_ignore_ascii_case("close")),
        };
    }

    // Discards all response state so an error response can be started over.
    // Only valid while nothing has been sent.
    pub(crate) fn reset(&mut self) {
        self.headers = Headers::new();
        self.discard_body = false;
        self.client = ClientCaps::default();
    }

    /// Writes an interim 100 Continue status line, flushing it immediately,
    /// without touching the state of the real response.
    pub fn send_continue(&mut self) -> Result<()> {
        let mut headers = Headers::new();
        headers.add("Date", &format_date(Utc::now()));
        headers.add("Server", SERVER_ID);
        let w = match &mut self.sink {
            Sink::Direct(w) => &mut **w,
            _ => return Err(Error::Protocol("response is closed".to_string())),
        };
        write!(w, "HTTP/1.1 100 {}\r\n", reason_phrase(100))?;
        headers.write_to(w)?;
        w.flush()?;
        Ok(())
    }

    /// Sends the response status line and all response headers, adding Date
    /// and Server headers if missing. If the response has a body, the
    /// Content-Length/Transfer-Encoding and Content-Type headers must be
    /// set before calling this. Sending is one-shot: a second call fails.
    pub fn send_headers(&mut self, status: u16) -> Result<()> {
        if self.headers_sent {
            return Err(Error::Protocol("headers were already sent".to_string()));
        }
        if !self.headers.contains("Date") {
            self.headers.add("Date", &format_date(Utc::now()));
        }
        self.headers.add("Server", SERVER_ID);
        let w = match &mut self.sink {
            Sink::Direct(w) => &mut **w,
            _ => return Err(Error::Protocol("response is closed".to_string())),
        };
        write!(w, "HTTP/1.1 {} {}\r\n", status, reason_phrase(status))?;
        self.headers.write_to(w)?;
        self.headers_sent = true;
        Ok(())
    }

    /// Sends the response headers, adding any of Content-Range,
    /// Content-Type, Transfer-Encoding, Content-Encoding, Content-Length,
    /// Vary, Last-Modified, ETag and Connection that are missing and
    /// applicable. An applied range rewrites a 200 status to 206.
    ///
    /// A None length means the body length is not yet known (framed with
    /// chunked transfer coding for HTTP/1.1 clients, or by connection close
    /// otherwise). A last-modified time in the future is clamped to now.
    pub fn send_headers_full(
        &mut self,
        status: u16,
        length: Option<u64>,
        last_modified: Option<DateTime<Utc>>,
        etag: Option<&str>,
        content_type: Option<&str>,
        range: Option<(u64, u64)>,
    ) -> Result<()> {
        let mut status = status;
        let mut length = length;
        if let Some((start, end)) = range {
            let total = length.map_or_else(|| "*".to_string(), |l| l.to_string());
            self.headers
                .add("Content-Range", &format!("bytes {}-{}/{}", start, end, total));
            length = Some(end - start + 1);
            if status == 200 {
                status = 206;
            }
        }
        let ct = match self.headers.get("Content-Type").map(|ct| ct.to_string()) {
            Some(ct) => ct,
            None => {
                let ct = content_type.unwrap_or("application/octet-stream").to_string();
                self.headers.add("Content-Type", &ct);
                ct
            }
        };
        // transfer encodings must not be sent to pre-1.1 clients
        if !self.headers.contains("Content-Length") && !self.headers.contains("Transfer-Encoding") {
            let modern = self.client.http11;
            let compression = if self.client.encodings.iter().any(|e| e == "gzip") {
                Some("gzip")
            } else if self.client.encodings.iter().any(|e| e == "deflate") {
                Some("deflate")
            } else {
                None
            };
            let sizable = match length {
                None => true,
                Some(l) => l > 300,
            };
            match compression {
                Some(compression) if sizable && is_compressible(&ct) && modern => {
                    // compressed data is always of unknown length
                    self.headers.add("Transfer-Encoding", "chunked");
                    self.headers.add("Content-Encoding", compression);
                }
                _ => {
                    if length.is_none() && modern {
                        self.headers.add("Transfer-Encoding", "chunked");
                    } else if let Some(len) = length {
                        self.headers.add("Content-Length", &len.to_string());
                    }
                }
            }
        }
        if !self.headers.contains("Vary") {
            self.headers.add("Vary", "Accept-Encoding");
        }
        if let Some(last_modified) = last_modified {
            if !self.headers.contains("Last-Modified") {
                self.headers
                    .add("Last-Modified", &format_date(last_modified.min(Utc::now())));
            }
        }
        if let Some(etag) = etag {
            if !self.headers.contains("ETag") {
                self.headers.add("ETag", etag);
            }
        }
        if self.client.wants_close && !self.headers.contains("Connection") {
            self.headers.add("Connection", "close");
        }
        self.send_headers(status)
    }

    /// Returns the stream into which the response body is written, or None
    /// if the body is discarded. The encoder chain is composed on the first
    /// call, according to the headers that were sent.
    pub fn body(&mut self) -> Result<Option<&mut dyn Write>> {
        if self.discard_body {
            return Ok(None);
        }
        if !matches!(self.sink, Sink::Body(_)) {
            if !self.headers_sent {
                return Err(Error::Protocol(
                    "headers must be sent before the body".to_string(),
                ));
            }
            let te = split_elements(self.headers.get("Transfer-Encoding"), true);
            let ce = split_elements(self.headers.get("Content-Encoding"), true);
            let chunked = te.iter().any(|e| e == "chunked");
            let gzip = ce.iter().any(|e| e == "gzip") || te.iter().any(|e| e == "gzip");
            let deflate = ce.iter().any(|e| e == "deflate") || te.iter().any(|e| e == "deflate");
            let out = match mem::replace(&mut self.sink, Sink::Closed) {
                Sink::Direct(w) => w,
                _ => return Err(Error::Protocol("response is closed".to_string())),
            };
            let inner = if chunked {
                Inner::Chunked(ChunkedWriter::new(out))
            } else {
                Inner::Plain(out)
            };
            let writer = if gzip {
                BodyWriter::Gzip(GzEncoder::new(inner, Compression::default()))
            } else if deflate {
                BodyWriter::Deflate(ZlibEncoder::new(inner, Compression::default()))
            } else {
                match inner {
                    Inner::Chunked(c) => BodyWriter::Chunked(c),
                    Inner::Plain(w) => BodyWriter::Identity(w),
                }
            };
            self.sink = Sink::Body(writer);
        }
        match &mut self.sink {
            Sink::Body(w) => Ok(Some(w as &mut dyn Write)),
            _ => Err(Error::Protocol("response is closed".to_string())),
        }
    }

    /// Closes this response: finishes the encoder chain and flushes all
    /// output. The underlying connection stream is left open.
    pub fn close(&mut self) -> Result<()> {
        match mem::replace(&mut self.sink, Sink::Closed) {
            Sink::Direct(w) => w.flush()?,
            Sink::Body(writer) => {
                let w = writer.finish()?;
                w.flush()?;
            }
            Sink::Closed => {}
        }
        Ok(())
    }

    /// Sends a full response with the given status and text body, encoded
    /// as UTF-8. Unless a Content-Type was set, the text is sent as HTML
    /// and must be properly escaped.
    pub fn send(&mut self, status: u16, text: &str) -> Result<()> {
        let etag = format!("W/\"{:x}\"", text_hash(text));
        self.send_headers_full(
            status,
            Some(text.len() as u64),
            None,
            Some(&etag),
            Some("text/html; charset=utf-8"),
            None,
        )?;
        if let Some(out) = self.body()? {
            out.write_all(text.as_bytes())?;
        }
        Ok(())
    }

    /// Sends an error response with the given status and a minimal HTML
    /// body containing the escaped message.
    pub fn send_error(&mut self, status: u16, text: &str) -> Result<()> {
        let reason = reason_phrase(status);
        self.send(
            status,
            &format!(
                "<!DOCTYPE html>\n<html>\n<head><title>{} {}</title></head>\n\
                 <body><h1>{} {}</h1>\n<p>{}</p>\n</body></html>",
                status,
                reason,
                status,
                reason,
                escape_html(text)
            ),
        )
    }

    /// Sends an error response with the given status and a default body.
    pub fn send_error_default(&mut self, status: u16) -> Result<()> {
        let text = if status < 400 {
            ":)"
        } else {
            "sorry it didn't work out :("
        };
        self.send_error(status, text)
    }

    /// Sends the response body from the given stream. The headers must
    /// have been sent first. If a range is given, the stream is skipped to
    /// its start and only the range is transferred; otherwise `length`
    /// bytes are sent (or the whole stream if the length is unknown).
    pub fn send_body(
        &mut self,
        body: &mut dyn Read,
        length: Option<u64>,
        range: Option<(u64, u64)>,
    ) -> Result<()> {
        if let Some(out) = self.body()? {
            match range {
                Some((start, end)) => {
                    transfer(body, None, Some(start))?;
                    transfer(body, Some(out), Some(end - start + 1))?;
                }
                None => transfer(body, Some(out), length)?,
            }
        }
        Ok(())
    }

    /// Sends a 301 or 302 response redirecting the client to the given URL,
    /// re-normalized to its ASCII form. A short body is included because
    /// some clients expect one.
    pub fn redirect(&mut self, url: &str, permanent: bool) -> Result<()> {
        let url = utf8_percent_encode(url, CONTROLS).to_string();
        self.headers.add("Location", &url);
        if permanent {
            self.send_error(301, &format!("Permanently moved to {}", url))
        } else {
            self.send_error(302, &format!("Temporarily moved to {}", url))
        }
    }
}

// The classic 31-multiplier string hash, kept stable across processes so
// the ETag of identical text never changes.
fn text_hash(s: &str) -> i32 {
    s.chars()
        .fold(0i32, |h, c| h.wrapping_mul(31).wrapping_add(c as i32))
}
