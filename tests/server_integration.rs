//! End-to-end tests of the transaction engine over real sockets.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use plume::{FileContextHandler, Outcome, Request, Response, Server, ServerHandle};

/// A response as read off the wire.
struct RawResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl RawResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

fn read_line(stream: &mut TcpStream) -> String {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if stream.read(&mut byte).unwrap() == 0 {
            break;
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8_lossy(&line).into_owned()
}

fn read_response(stream: &mut TcpStream) -> RawResponse {
    let status_line = read_line(stream);
    let status: u16 = status_line
        .split(' ')
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| panic!("bad status line: {:?}", status_line));
    let mut headers = Vec::new();
    loop {
        let line = read_line(stream);
        if line.is_empty() {
            break;
        }
        if let Some(pos) = line.find(':') {
            headers.push((
                line[..pos].trim().to_string(),
                line[pos + 1..].trim().to_string(),
            ));
        }
    }
    let resp = RawResponse {
        status,
        headers,
        body: Vec::new(),
    };
    if status == 100 || status == 204 || status == 304 {
        return resp;
    }
    let body = if let Some(len) = resp.header("Content-Length") {
        let len: usize = len.parse().unwrap();
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).unwrap();
        body
    } else if resp
        .header("Transfer-Encoding")
        .map_or(false, |te| te.contains("chunked"))
    {
        read_chunked_body(stream)
    } else {
        let mut body = Vec::new();
        stream.read_to_end(&mut body).unwrap();
        body
    };
    RawResponse { body, ..resp }
}

fn read_chunked_body(stream: &mut TcpStream) -> Vec<u8> {
    let mut body = Vec::new();
    loop {
        let size_line = read_line(stream);
        let size = usize::from_str_radix(size_line.trim(), 16).unwrap();
        if size == 0 {
            // trailer section ends with an empty line
            while !read_line(stream).is_empty() {}
            break;
        }
        let mut chunk = vec![0u8; size];
        stream.read_exact(&mut chunk).unwrap();
        body.extend_from_slice(&chunk);
        assert!(read_line(stream).is_empty());
    }
    body
}

fn connect(handle: &ServerHandle) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", handle.port())).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

fn exchange(handle: &ServerHandle, request: &str) -> RawResponse {
    let mut stream = connect(handle);
    stream.write_all(request.as_bytes()).unwrap();
    read_response(&mut stream)
}

fn hello_handler(_req: &mut Request<'_>, resp: &mut Response<'_>) -> plume::Result<Outcome> {
    resp.headers_mut().add("Content-Type", "text/plain");
    resp.send(200, "Hello")?;
    Ok(Outcome::Handled)
}

fn echo_handler(req: &mut Request<'_>, resp: &mut Response<'_>) -> plume::Result<Outcome> {
    let mut body = Vec::new();
    req.body_mut().read_to_end(&mut body)?;
    let mut text = String::from_utf8_lossy(&body).into_owned();
    // chunked trailers have been merged into the request headers by now
    if let Some(trailer) = req.headers().get("X-Trailer") {
        text.push_str(&format!("+{}", trailer));
    }
    resp.headers_mut().add("Content-Type", "text/plain");
    resp.send(200, &text)?;
    Ok(Outcome::Handled)
}

fn teapot_handler(_req: &mut Request<'_>, _resp: &mut Response<'_>) -> plume::Result<Outcome> {
    Ok(Outcome::Status(404))
}

fn hello_server() -> ServerHandle {
    let mut server = Server::new(0);
    let host = server.virtual_host_mut(None).unwrap();
    host.add_context("/hello", Arc::new(hello_handler), &["GET"])
        .unwrap();
    host.add_context("/echo", Arc::new(echo_handler), &["POST"])
        .unwrap();
    host.add_context("/teapot", Arc::new(teapot_handler), &["PUT"])
        .unwrap();
    server.start().unwrap()
}

fn temp_tree(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("plume-itest-{}-{}", tag, std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn file_server(dir: &PathBuf, generated_index: bool) -> ServerHandle {
    let mut server = Server::new(0);
    let host = server.virtual_host_mut(None).unwrap();
    host.set_allow_generated_index(generated_index);
    host.add_context("/", Arc::new(FileContextHandler::new(dir).unwrap()), &[])
        .unwrap();
    server.start().unwrap()
}

#[test]
fn test_hello_get() {
    let mut handle = hello_server();
    let mut stream = connect(&handle);
    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let resp = read_response(&mut stream);
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("Content-Type"), Some("text/plain"));
    assert_eq!(resp.header("Content-Length"), Some("5"));
    assert!(resp.header("Date").is_some());
    assert!(resp.header("Server").is_some());
    assert_eq!(resp.body, b"Hello");

    // the connection persists: a second request succeeds on the same socket
    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let resp = read_response(&mut stream);
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, b"Hello");
    handle.stop();
}

#[test]
fn test_head_same_headers_no_body() {
    let mut handle = hello_server();
    let mut stream = connect(&handle);
    stream
        .write_all(b"HEAD /hello HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    // read headers manually: there must be no body despite Content-Length
    let status_line = read_line(&mut stream);
    assert!(status_line.starts_with("HTTP/1.1 200"));
    let mut saw_length = false;
    loop {
        let line = read_line(&mut stream);
        if line.is_empty() {
            break;
        }
        if line.to_ascii_lowercase().starts_with("content-length:") {
            assert!(line.ends_with("5"));
            saw_length = true;
        }
    }
    assert!(saw_length);

    // the next response arrives immediately, proving the HEAD body was empty
    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let resp = read_response(&mut stream);
    assert_eq!(resp.body, b"Hello");
    handle.stop();
}

#[test]
fn test_chunked_request_body_and_reuse() {
    let mut handle = hello_server();
    let mut stream = connect(&handle);
    stream
        .write_all(
            b"POST /echo HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n\
              5\r\nhello\r\n0\r\nX-Trailer: t1\r\n\r\n",
        )
        .unwrap();
    let resp = read_response(&mut stream);
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, b"hello+t1");

    // the engine drained the trailing bytes; the connection is aligned
    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let resp = read_response(&mut stream);
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, b"Hello");
    handle.stop();
}

#[test]
fn test_unconsumed_body_is_drained() {
    let mut handle = hello_server();
    let mut stream = connect(&handle);
    // the /hello handler never reads the body
    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\nContent-Length: 7\r\n\r\nunread!")
        .unwrap();
    let resp = read_response(&mut stream);
    assert_eq!(resp.status, 200);

    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let resp = read_response(&mut stream);
    assert_eq!(resp.status, 200);
    handle.stop();
}

#[test]
fn test_missing_host_yields_400_and_close() {
    let mut handle = hello_server();
    let mut stream = connect(&handle);
    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    let resp = read_response(&mut stream);
    assert_eq!(resp.status, 400);
    assert_eq!(resp.header("Connection"), Some("close"));

    // the server closes the connection afterwards
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
    handle.stop();
}

#[test]
fn test_unknown_version_rejected() {
    let mut handle = hello_server();
    let resp = exchange(&handle, "GET /hello HTTP/2.0\r\nHost: x\r\n\r\n");
    assert_eq!(resp.status, 400);
    assert_eq!(resp.header("Connection"), Some("close"));
    handle.stop();
}

#[test]
fn test_routing_miss_is_404_and_persists() {
    let mut handle = hello_server();
    let mut stream = connect(&handle);
    stream
        .write_all(b"GET /nothing-here HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let resp = read_response(&mut stream);
    assert_eq!(resp.status, 404);

    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let resp = read_response(&mut stream);
    assert_eq!(resp.status, 200);
    handle.stop();
}

#[test]
fn test_method_known_to_host_but_not_context() {
    let mut handle = hello_server();
    // PUT is registered under /teapot, so it is known to the host
    let resp = exchange(&handle, "PUT /hello HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    assert_eq!(resp.status, 405);
    let allow = resp.header("Allow").unwrap();
    assert!(allow.contains("GET"));
    assert!(allow.contains(", "));
    handle.stop();
}

#[test]
fn test_unknown_method_is_501() {
    let mut handle = hello_server();
    let resp = exchange(
        &handle,
        "BREW /hello HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(resp.status, 501);
    handle.stop();
}

#[test]
fn test_options_context_and_server_wide() {
    let mut handle = hello_server();
    let resp = exchange(&handle, "OPTIONS /echo HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("Content-Length"), Some("0"));
    let allow = resp.header("Allow").unwrap().to_string();
    for m in ["GET", "HEAD", "TRACE", "OPTIONS", "POST"] {
        assert!(allow.contains(m), "missing {} in {}", m, allow);
    }

    let resp = exchange(&handle, "OPTIONS * HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(resp.status, 200);
    let allow = resp.header("Allow").unwrap().to_string();
    for m in ["GET", "HEAD", "TRACE", "OPTIONS", "POST", "PUT"] {
        assert!(allow.contains(m), "missing {} in {}", m, allow);
    }
    handle.stop();
}

#[test]
fn test_trace_echoes_request() {
    let mut handle = hello_server();
    let resp = exchange(&handle, "TRACE /hello HTTP/1.1\r\nHost: x\r\nX-Mark: 1\r\n\r\n");
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("Content-Type"), Some("message/http"));
    let echoed = String::from_utf8_lossy(&resp.body).into_owned();
    assert!(echoed.starts_with("TRACE /hello HTTP/1.1\r\n"));
    assert!(echoed.contains("X-Mark: 1\r\n"));
    handle.stop();
}

#[test]
fn test_expect_continue() {
    let mut handle = hello_server();
    let mut stream = connect(&handle);
    stream
        .write_all(
            b"POST /echo HTTP/1.1\r\nHost: x\r\nExpect: 100-continue\r\nContent-Length: 2\r\n\r\n",
        )
        .unwrap();
    let interim = read_response(&mut stream);
    assert_eq!(interim.status, 100);
    stream.write_all(b"ok").unwrap();
    let resp = read_response(&mut stream);
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, b"ok");
    handle.stop();
}

#[test]
fn test_unknown_expectation_is_417() {
    let mut handle = hello_server();
    let resp = exchange(
        &handle,
        "POST /echo HTTP/1.1\r\nHost: x\r\nExpect: 200-maybe\r\n\r\n",
    );
    assert_eq!(resp.status, 417);
    handle.stop();
}

#[test]
fn test_connection_close_honored() {
    let mut handle = hello_server();
    let mut stream = connect(&handle);
    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();
    let resp = read_response(&mut stream);
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("Connection"), Some("close"));
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
    handle.stop();
}

fn boom_handler(_req: &mut Request<'_>, _resp: &mut Response<'_>) -> plume::Result<Outcome> {
    Err(plume::Error::Protocol("it broke".to_string()))
}

#[test]
fn test_handler_error_yields_500() {
    let mut server = Server::new(0);
    let host = server.virtual_host_mut(None).unwrap();
    host.add_context("/boom", Arc::new(boom_handler), &["GET"])
        .unwrap();
    let mut handle = server.start().unwrap();

    let resp = exchange(&handle, "GET /boom HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(resp.status, 500);
    assert_eq!(resp.header("Connection"), Some("close"));
    assert!(String::from_utf8_lossy(&resp.body).contains("it broke"));
    handle.stop();
}

#[test]
fn test_file_range_request() {
    let dir = temp_tree("range");
    let mut f = File::create(dir.join("f")).unwrap();
    f.write_all(b"abcdefghijklmnopqrstuvwxyz").unwrap();
    drop(f);
    let mut handle = file_server(&dir, false);

    let resp = exchange(&handle, "GET /f HTTP/1.1\r\nHost: x\r\nRange: bytes=5-9\r\n\r\n");
    assert_eq!(resp.status, 206);
    assert_eq!(resp.header("Content-Range"), Some("bytes 5-9/26"));
    assert_eq!(resp.header("Content-Length"), Some("5"));
    assert_eq!(resp.body, b"fghij");

    handle.stop();
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_file_range_unsatisfiable() {
    let dir = temp_tree("range416");
    File::create(dir.join("f"))
        .unwrap()
        .write_all(b"abcdefghijklmnopqrstuvwxyz")
        .unwrap();
    let mut handle = file_server(&dir, false);

    let resp = exchange(
        &handle,
        "GET /f HTTP/1.1\r\nHost: x\r\nRange: bytes=30-40\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(resp.status, 416);
    assert_eq!(resp.header("Content-Range"), Some("bytes */26"));

    handle.stop();
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_file_if_none_match_304() {
    let dir = temp_tree("inm");
    File::create(dir.join("f"))
        .unwrap()
        .write_all(b"contents")
        .unwrap();
    let mtime = fs::metadata(dir.join("f"))
        .unwrap()
        .modified()
        .unwrap()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs();
    let mut handle = file_server(&dir, false);

    let resp = exchange(
        &handle,
        &format!(
            "GET /f HTTP/1.1\r\nHost: x\r\nIf-None-Match: W/\"{}\"\r\nConnection: close\r\n\r\n",
            mtime
        ),
    );
    assert_eq!(resp.status, 304);
    assert_eq!(resp.header("ETag"), Some(format!("W/\"{}\"", mtime).as_str()));
    assert!(resp.header("Vary").is_some());
    assert!(resp.header("Last-Modified").is_some());
    assert!(resp.header("Content-Type").is_none());
    assert!(resp.body.is_empty());

    handle.stop();
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_file_not_found_and_traversal() {
    let dir = temp_tree("guard");
    File::create(dir.join("f")).unwrap().write_all(b"x").unwrap();
    let mut handle = file_server(&dir, false);

    let resp = exchange(&handle, "GET /missing HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(resp.status, 404);

    let resp = exchange(&handle, "GET /../../etc/passwd HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_ne!(resp.status, 200);

    handle.stop();
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_welcome_file_and_generated_index() {
    let dir = temp_tree("welcome");
    File::create(dir.join("index.html"))
        .unwrap()
        .write_all(b"<p>welcome</p>")
        .unwrap();
    let mut handle = file_server(&dir, false);
    let resp = exchange(&handle, "GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, b"<p>welcome</p>");
    handle.stop();

    // without a welcome file, a generated index page is served
    let dir2 = temp_tree("genindex");
    File::create(dir2.join("data.txt"))
        .unwrap()
        .write_all(b"d")
        .unwrap();
    let mut server = Server::new(0);
    let host = server.virtual_host_mut(None).unwrap();
    host.set_directory_index(None);
    host.set_allow_generated_index(true);
    host.add_context("/", Arc::new(FileContextHandler::new(&dir2).unwrap()), &[])
        .unwrap();
    let mut handle = server.start().unwrap();
    let resp = exchange(&handle, "GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(resp.status, 200);
    assert!(String::from_utf8_lossy(&resp.body).contains("data.txt"));
    handle.stop();

    fs::remove_dir_all(&dir).unwrap();
    fs::remove_dir_all(&dir2).unwrap();
}

#[test]
fn test_directory_redirect() {
    let dir = temp_tree("redir");
    fs::create_dir(dir.join("sub")).unwrap();
    File::create(dir.join("sub/index.html"))
        .unwrap()
        .write_all(b"inner")
        .unwrap();
    let mut handle = file_server(&dir, false);

    let resp = exchange(&handle, "GET /sub HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(resp.status, 301);
    assert!(resp.header("Location").unwrap().ends_with("/sub/"));

    handle.stop();
    fs::remove_dir_all(&dir).unwrap();
}

fn default_who(_req: &mut Request<'_>, resp: &mut Response<'_>) -> plume::Result<Outcome> {
    resp.headers_mut().add("Content-Type", "text/plain");
    resp.send(200, "default")?;
    Ok(Outcome::Handled)
}

fn api_who(_req: &mut Request<'_>, resp: &mut Response<'_>) -> plume::Result<Outcome> {
    resp.headers_mut().add("Content-Type", "text/plain");
    resp.send(200, "api")?;
    Ok(Outcome::Handled)
}

#[test]
fn test_virtual_host_dispatch() {
    let mut server = Server::new(0);
    server
        .virtual_host_mut(None)
        .unwrap()
        .add_context("/who", Arc::new(default_who), &["GET"])
        .unwrap();
    let mut named = plume::VirtualHost::new(Some("api.test"));
    named.add_alias("api-alias.test");
    named
        .add_context("/who", Arc::new(api_who), &["GET"])
        .unwrap();
    server.add_virtual_host(named);
    let mut handle = server.start().unwrap();

    let resp = exchange(&handle, "GET /who HTTP/1.1\r\nHost: api.test\r\n\r\n");
    assert_eq!(resp.body, b"api");
    let resp = exchange(&handle, "GET /who HTTP/1.1\r\nHost: api-alias.test\r\n\r\n");
    assert_eq!(resp.body, b"api");
    let resp = exchange(&handle, "GET /who HTTP/1.1\r\nHost: other.test\r\n\r\n");
    assert_eq!(resp.body, b"default");
    handle.stop();
}

fn upload_handler(req: &mut Request<'_>, resp: &mut Response<'_>) -> plume::Result<Outcome> {
    let mut summary = String::new();
    let mut parts = plume::multipart::MultipartIterator::from_request(req)?;
    while let Some(mut part) = parts.next_part()? {
        let name = part.name.clone().unwrap_or_default();
        let text = part.text()?;
        summary.push_str(&format!("{}={};", name, text));
    }
    resp.headers_mut().add("Content-Type", "text/plain");
    resp.send(200, &summary)?;
    Ok(Outcome::Handled)
}

#[test]
fn test_multipart_upload() {
    let mut server = Server::new(0);
    server
        .virtual_host_mut(None)
        .unwrap()
        .add_context("/upload", Arc::new(upload_handler), &["POST"])
        .unwrap();
    let mut handle = server.start().unwrap();

    let body = "--sep\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\n1\r\n\
                --sep\r\nContent-Disposition: form-data; name=\"b\"; filename=\"f.txt\"\r\n\r\ntwo\r\n\
                --sep--\r\n";
    let request = format!(
        "POST /upload HTTP/1.1\r\nHost: x\r\n\
         Content-Type: multipart/form-data; boundary=sep\r\n\
         Content-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    let resp = exchange(&handle, &request);
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, b"a=1;b=two;");
    handle.stop();
}

fn big_handler(_req: &mut Request<'_>, resp: &mut Response<'_>) -> plume::Result<Outcome> {
    resp.headers_mut().add("Content-Type", "text/plain");
    resp.send(200, &"z".repeat(2000))?;
    Ok(Outcome::Handled)
}

#[test]
fn test_gzip_end_to_end() {
    let mut server = Server::new(0);
    server
        .virtual_host_mut(None)
        .unwrap()
        .add_context("/big", Arc::new(big_handler), &["GET"])
        .unwrap();
    let mut handle = server.start().unwrap();

    let resp = exchange(
        &handle,
        "GET /big HTTP/1.1\r\nHost: x\r\nAccept-Encoding: gzip\r\n\r\n",
    );
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("Content-Encoding"), Some("gzip"));
    assert_eq!(resp.header("Transfer-Encoding"), Some("chunked"));
    let mut decoded = String::new();
    flate2::read::GzDecoder::new(&resp.body[..])
        .read_to_string(&mut decoded)
        .unwrap();
    assert_eq!(decoded, "z".repeat(2000));
    handle.stop();
}
