//! HTTP request reading and representation.

use std::io::Read;

use http::Uri;
use percent_encoding::percent_decode_str;

use crate::cond::parse_range;
use crate::headers::Headers;
use crate::host::{ContextInfo, VirtualHost};
use crate::io::{read_line, read_token, ChunkedReader, LimitedReader};
use crate::server::Server;
use crate::transport::ConnReader;
use crate::util::{local_host_name, parse_ulong, split, split_elements, trim_duplicates};
use crate::{Error, Result};

/// The request body stream, bounded by the framing the client declared:
/// a Content-Length prefix, chunked transfer coding, or (for legacy
/// non-chunked transfer codings) everything until the connection closes.
pub enum BodyReader<'a> {
    Limited(LimitedReader<&'a mut ConnReader>),
    Chunked(ChunkedReader<&'a mut ConnReader>),
    Raw(&'a mut ConnReader),
}

impl Read for BodyReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            BodyReader::Limited(r) => r.read(buf),
            BodyReader::Chunked(r) => r.read(buf),
            BodyReader::Raw(r) => r.read(buf),
        }
    }
}

/// A handle on the request body, tied to the request it belongs to. When a
/// chunked body reaches its end, the trailer headers are appended to the
/// request's headers, where they are visible through `Request::headers`.
pub struct Body<'r, 'a> {
    reader: &'r mut BodyReader<'a>,
    headers: &'r mut Headers,
}

impl Read for Body<'_, '_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.reader.read(buf)?;
        if n == 0 {
            if let BodyReader::Chunked(r) = &mut *self.reader {
                if r.is_done() {
                    self.headers.add_all(&r.take_trailers());
                }
            }
        }
        Ok(n)
    }
}

/// A single HTTP request, owned by the transaction engine for the duration
/// of one transaction.
pub struct Request<'a> {
    method: String,
    uri: Uri,
    path: String,
    version: String,
    headers: Headers,
    body: BodyReader<'a>,
    server: &'a Server,
    port: u16,
    secure: bool,
    // lazily computed fields
    base_url: Option<Option<String>>,
    params: Option<Vec<(String, String)>>,
    host: Option<&'a VirtualHost>,
    context: Option<&'a ContextInfo>,
}

impl<'a> Request<'a> {
    /// Reads a request (request line, headers, and body framing) from the
    /// given connection input.
    ///
    /// An end of stream or timeout before the request line yields
    /// `Error::MissingRequestLine`, which the engine treats as an idle
    /// connection close rather than a protocol error.
    pub fn read(
        input: &'a mut ConnReader,
        server: &'a Server,
        port: u16,
        secure: bool,
    ) -> Result<Request<'a>> {
        // empty lines before the request line are tolerated
        let line = loop {
            match read_line(&mut *input) {
                Ok(l) if l.is_empty() => continue,
                Ok(l) => break l,
                // EOF or timeout: the request never began
                Err(Error::Io(_)) => return Err(Error::MissingRequestLine),
                Err(e) => return Err(e),
            }
        };
        let tokens = split(&line, " ", None);
        if tokens.len() != 3 {
            return Err(Error::Protocol(format!(
                "invalid request line: \"{}\"",
                line
            )));
        }
        let method = tokens[0].clone();
        // collapse duplicate slashes, which a URI parser reads as authority
        let target = trim_duplicates(&tokens[1], '/');
        let uri: Uri = target
            .parse()
            .map_err(|e| Error::Protocol(format!("invalid URI: {}", e)))?;
        let version = tokens[2].clone();
        let path = percent_decode_str(uri.path()).decode_utf8_lossy().into_owned();

        let headers = Headers::read_from(&mut *input)?;

        // RFC 2616 section 4.4: a non-identity Transfer-Encoding either
        // includes "chunked" or the body lasts until the connection closes,
        // and Content-Length is ignored. Without one, Content-Length gives
        // the body length; without either, there is no body.
        let te = headers
            .get("Transfer-Encoding")
            .map(|v| v.to_ascii_lowercase());
        let body = match te {
            Some(ref t) if t != "identity" => {
                if split_elements(Some(t.as_str()), true).iter().any(|e| e == "chunked") {
                    BodyReader::Chunked(ChunkedReader::new(input))
                } else {
                    BodyReader::Raw(input)
                }
            }
            _ => {
                let len = match headers.get("Content-Length") {
                    Some(h) => parse_ulong(h, 10)?,
                    None => 0,
                };
                BodyReader::Limited(LimitedReader::new(input, len, true))
            }
        };

        Ok(Request {
            method,
            uri,
            path,
            version,
            headers,
            body,
            server,
            port,
            secure,
            base_url: None,
            params: None,
            host: None,
            context: None,
        })
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub(crate) fn set_method(&mut self, method: &str) {
        self.method = method.to_string();
    }

    /// The request-target as parsed from the request line.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// The version string as received, e.g. "HTTP/1.1".
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Whether the connection this request arrived on is encrypted.
    pub fn secure(&self) -> bool {
        self.secure
    }

    /// The decoded path component of the request-target.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Sets the path component, e.g. for URL rewriting. The cached context
    /// is recalculated on next access.
    pub fn set_path(&mut self, path: &str) {
        self.path = trim_duplicates(path, '/');
        self.context = None;
    }

    /// The request body stream. The body must be fully consumed (or
    /// discarded) before the next request can be read off the connection;
    /// the engine drains any leftover itself. Once a chunked body has been
    /// fully read, its trailer headers appear in [`Request::headers`].
    pub fn body_mut(&mut self) -> Body<'_, 'a> {
        Body {
            reader: &mut self.body,
            headers: &mut self.headers,
        }
    }

    /// The base URL (scheme, host and port) of the requested resource, with
    /// the host taken from the request URI, the Host header, or the local
    /// host name, in that order. None if the host is malformed.
    pub fn base_url(&mut self) -> Option<&str> {
        if self.base_url.is_none() {
            let scheme = if self.secure { "https" } else { "http" };
            let candidate = format!("{}://{}:{}", scheme, self.host_name(), self.port);
            let valid = candidate.parse::<Uri>().is_ok();
            self.base_url = Some(valid.then_some(candidate));
        }
        self.base_url.as_ref().and_then(|url| url.as_deref())
    }

    fn host_name(&self) -> String {
        if let Some(host) = self.uri.host() {
            return host.to_string();
        }
        match self.headers.get("Host") {
            Some(host) => match host.find(':') {
                Some(pos) => host[..pos].to_string(),
                None => host.to_string(),
            },
            None => local_host_name(), // missing in HTTP/1.0
        }
    }

    /// The virtual host serving this request, or the server's default host
    /// if no named host matches.
    pub fn virtual_host(&mut self) -> &'a VirtualHost {
        if let Some(host) = self.host {
            return host;
        }
        let name = self.host_name();
        let host = self
            .server
            .virtual_host(Some(&name))
            .unwrap_or_else(|| self.server.default_host());
        self.host = Some(host);
        host
    }

    /// The context handling this request, or the empty context if no
    /// registered path prefix matches.
    pub fn context(&mut self) -> &'a ContextInfo {
        if let Some(context) = self.context {
            return context;
        }
        let host = self.virtual_host();
        let context = host.context_for(&self.path);
        self.context = Some(context);
        context
    }

    /// The request parameters, from the query part of the request-target
    /// and, for an application/x-www-form-urlencoded request, from the body
    /// as well. Pair order is preserved.
    ///
    /// Note that the body is read (once, up to 2 MiB) the first time this
    /// is called; afterwards the body stream is at its end.
    pub fn params(&mut self) -> Result<&[(String, String)]> {
        if self.params.is_none() {
            let mut list = parse_params_list(self.uri.query().unwrap_or(""));
            let form_body = self
                .headers
                .get("Content-Type")
                .map(|ct| {
                    ct.to_ascii_lowercase()
                        .starts_with("application/x-www-form-urlencoded")
                })
                .unwrap_or(false);
            if form_body {
                let raw = read_token(&mut self.body_mut(), None, 2 * 1024 * 1024)?;
                list.extend(parse_params_list(&String::from_utf8_lossy(&raw)));
            }
            self.params = Some(list);
        }
        Ok(self.params.as_deref().unwrap_or(&[]))
    }

    /// The first value of the parameter with the given name, if any.
    pub fn param(&mut self, name: &str) -> Result<Option<String>> {
        Ok(self
            .params()?
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone()))
    }

    /// The absolute (zero-based) content range requested by the Range
    /// header, or None if the header is missing or invalid.
    pub fn range(&self, length: u64) -> Option<(u64, u64)> {
        match self.headers.get("Range") {
            Some(header) if header.starts_with("bytes=") => {
                parse_range(&header[6..], length)
            }
            _ => None,
        }
    }
}

/// Parses name-value pairs from an "application/x-www-form-urlencoded"
/// string, assuming UTF-8. Pair order is preserved, and pairs with empty
/// names are dropped.
pub fn parse_params_list(s: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    for pair in split(s, "&", None) {
        let (name, value) = match pair.find('=') {
            Some(pos) => (pair[..pos].to_string(), pair[pos + 1..].to_string()),
            None => (pair, String::new()),
        };
        let name = decode_form_component(name.trim());
        let value = decode_form_component(value.trim());
        if !name.is_empty() {
            params.push((name, value));
        }
    }
    params
}

fn decode_form_component(s: &str) -> String {
    let plussed = s.replace('+', " ");
    percent_decode_str(&plussed).decode_utf8_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cond::conditional_status;
    use crate::date::parse_date;
    use std::io::{BufReader, Cursor};

    fn reader(bytes: &[u8]) -> ConnReader {
        BufReader::new(Box::new(Cursor::new(bytes.to_vec())) as Box<dyn Read + Send>)
    }

    fn server() -> Server {
        Server::new(8080)
    }

    #[test]
    fn test_read_simple_request() {
        let srv = server();
        let mut input = reader(b"GET /hello?x=1 HTTP/1.1\r\nHost: example.com\r\n\r\n");
        let req = Request::read(&mut input, &srv, 8080, false).unwrap();
        assert_eq!(req.method(), "GET");
        assert_eq!(req.path(), "/hello");
        assert_eq!(req.version(), "HTTP/1.1");
        assert_eq!(req.headers().get("Host"), Some("example.com"));
    }

    #[test]
    fn test_leading_empty_lines_tolerated() {
        let srv = server();
        let mut input = reader(b"\r\n\r\nGET / HTTP/1.1\r\nHost: x\r\n\r\n");
        let req = Request::read(&mut input, &srv, 8080, false).unwrap();
        assert_eq!(req.method(), "GET");
    }

    #[test]
    fn test_missing_request_line() {
        let srv = server();
        let mut input = reader(b"");
        match Request::read(&mut input, &srv, 8080, false) {
            Err(Error::MissingRequestLine) => {}
            other => panic!("unexpected result: {:?}", other.err()),
        }
    }

    #[test]
    fn test_invalid_request_line() {
        let srv = server();
        let mut input = reader(b"GET /\r\n\r\n");
        assert!(matches!(
            Request::read(&mut input, &srv, 8080, false),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_duplicate_slashes_collapsed() {
        let srv = server();
        let mut input = reader(b"GET //a///b HTTP/1.1\r\nHost: x\r\n\r\n");
        let req = Request::read(&mut input, &srv, 8080, false).unwrap();
        assert_eq!(req.path(), "/a/b");
    }

    #[test]
    fn test_percent_decoded_path() {
        let srv = server();
        let mut input = reader(b"GET /a%20b HTTP/1.1\r\nHost: x\r\n\r\n");
        let req = Request::read(&mut input, &srv, 8080, false).unwrap();
        assert_eq!(req.path(), "/a b");
    }

    #[test]
    fn test_content_length_body() {
        let srv = server();
        let mut input =
            reader(b"POST /p HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhelloEXTRA");
        let mut req = Request::read(&mut input, &srv, 8080, false).unwrap();
        let mut body = Vec::new();
        req.body_mut().read_to_end(&mut body).unwrap();
        assert_eq!(body, b"hello");
    }

    #[test]
    fn test_chunked_body() {
        let srv = server();
        let mut input = reader(
            b"POST /p HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\nX-Sum: abc\r\n\r\n",
        );
        let mut req = Request::read(&mut input, &srv, 8080, false).unwrap();
        assert!(req.headers().get("X-Sum").is_none());
        let mut body = Vec::new();
        req.body_mut().read_to_end(&mut body).unwrap();
        assert_eq!(body, b"hello");
        // the trailer headers were appended to the request headers
        assert_eq!(req.headers().get("X-Sum"), Some("abc"));
    }

    #[test]
    fn test_no_body_without_length() {
        let srv = server();
        let mut input = reader(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        let mut req = Request::read(&mut input, &srv, 8080, false).unwrap();
        let mut body = Vec::new();
        req.body_mut().read_to_end(&mut body).unwrap();
        assert!(body.is_empty());
    }

    #[test]
    fn test_params_from_query_and_body() {
        let srv = server();
        let mut input = reader(
            b"POST /p?a=1&b=x+y HTTP/1.1\r\nHost: x\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 9\r\n\r\nc=3&a=dup",
        );
        let mut req = Request::read(&mut input, &srv, 8080, false).unwrap();
        let params = req.params().unwrap().to_vec();
        assert_eq!(params[0], ("a".to_string(), "1".to_string()));
        assert_eq!(params[1], ("b".to_string(), "x y".to_string()));
        assert_eq!(params[2], ("c".to_string(), "3".to_string()));
        assert_eq!(req.param("a").unwrap(), Some("1".to_string()));
    }

    #[test]
    fn test_base_url() {
        let srv = server();
        let mut input = reader(b"GET / HTTP/1.1\r\nHost: example.com:8080\r\n\r\n");
        let mut req = Request::read(&mut input, &srv, 8080, false).unwrap();
        assert_eq!(req.base_url(), Some("http://example.com:8080"));
    }

    #[test]
    fn test_range_header() {
        let srv = server();
        let mut input = reader(b"GET /f HTTP/1.1\r\nHost: x\r\nRange: bytes=5-9\r\n\r\n");
        let req = Request::read(&mut input, &srv, 8080, false).unwrap();
        assert_eq!(req.range(26), Some((5, 9)));
        // only the bytes unit is understood
        let mut input = reader(b"GET /f HTTP/1.1\r\nHost: x\r\nRange: lines=5-9\r\n\r\n");
        let req = Request::read(&mut input, &srv, 8080, false).unwrap();
        assert_eq!(req.range(26), None);
    }

    #[test]
    fn test_parse_params_list() {
        let params = parse_params_list("a=1&=skip&b&c=%2F");
        assert_eq!(params[0], ("a".to_string(), "1".to_string()));
        assert_eq!(params[1], ("b".to_string(), String::new()));
        assert_eq!(params[2], ("c".to_string(), "/".to_string()));
    }

    fn request_with_headers(lines: &str) -> (Server, Vec<u8>) {
        let srv = server();
        let wire = format!("GET /f HTTP/1.1\r\nHost: x\r\n{}\r\n", lines).into_bytes();
        (srv, wire)
    }

    #[test]
    fn test_conditional_precedence() {
        let modified = parse_date("Sun, 06 Nov 1994 08:49:37 GMT").unwrap();
        let etag = "W/\"784111777\"";

        // If-None-Match hit on GET yields 304
        let (srv, wire) = request_with_headers("If-None-Match: W/\"784111777\"\r\n");
        let mut input = reader(&wire);
        let req = Request::read(&mut input, &srv, 8080, false).unwrap();
        assert_eq!(conditional_status(&req, modified, etag), 304);

        // If-None-Match miss forces 200 even with a stale If-Modified-Since
        let (srv, wire) = request_with_headers(
            "If-None-Match: W/\"other\"\r\nIf-Modified-Since: Sun, 06 Nov 1994 08:49:37 GMT\r\n",
        );
        let mut input = reader(&wire);
        let req = Request::read(&mut input, &srv, 8080, false).unwrap();
        assert_eq!(conditional_status(&req, modified, etag), 200);

        // If-Match with a weak tag fails strong comparison
        let (srv, wire) = request_with_headers("If-Match: W/\"784111777\"\r\n");
        let mut input = reader(&wire);
        let req = Request::read(&mut input, &srv, 8080, false).unwrap();
        assert_eq!(conditional_status(&req, modified, etag), 412);

        // If-Unmodified-Since in the past yields 412
        let (srv, wire) =
            request_with_headers("If-Unmodified-Since: Sat, 05 Nov 1994 08:49:37 GMT\r\n");
        let mut input = reader(&wire);
        let req = Request::read(&mut input, &srv, 8080, false).unwrap();
        assert_eq!(conditional_status(&req, modified, etag), 412);

        // If-Modified-Since after the modification yields 304
        let (srv, wire) =
            request_with_headers("If-Modified-Since: Mon, 07 Nov 1994 08:49:37 GMT\r\n");
        let mut input = reader(&wire);
        let req = Request::read(&mut input, &srv, 8080, false).unwrap();
        assert_eq!(conditional_status(&req, modified, etag), 304);

        // idempotent
        assert_eq!(conditional_status(&req, modified, etag), 304);
    }
}
