//! The server: configuration, socket accept loop, and the per-connection
//! transaction engine.
//!
//! Each accepted socket is handed to a worker (by default a dedicated
//! thread) that runs the transaction loop: read a request, dispatch it
//! through the virtual-host and context tree, write the response, drain any
//! unread body, and repeat while the connection persists. Configuration
//! (hosts, contexts, factory, executor) must be complete before `start()`;
//! the maps are immutable while serving.

use std::collections::HashMap;
use std::io::{BufReader, BufWriter, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};

use crate::headers::Headers;
use crate::host::{Outcome, VirtualHost};
use crate::io::transfer;
use crate::request::Request;
use crate::response::Response;
use crate::transport::{ConnReader, ConnWriter, PlainSocketFactory, SocketFactory};
use crate::{Error, Result, CRLF};

/// Schedules connection workers. The default executor spawns one thread
/// per connection, which consumes no resources while idle.
pub trait Executor: Send + Sync {
    fn execute(&self, task: Box<dyn FnOnce() + Send + 'static>);
}

struct ThreadPerConnection;

impl Executor for ThreadPerConnection {
    fn execute(&self, task: Box<dyn FnOnce() + Send + 'static>) {
        if let Err(e) = thread::Builder::new().name("plume-worker".to_string()).spawn(task) {
            warn!("failed to spawn connection worker: {}", e);
        }
    }
}

/// A lightweight HTTP server.
///
/// Configure the server and its virtual hosts, then call [`Server::start`]
/// to begin accepting connections. Configuration must not change once the
/// server is started.
pub struct Server {
    port: u16,
    socket_timeout: Duration,
    factory: Box<dyn SocketFactory>,
    executor: Box<dyn Executor>,
    hosts: HashMap<String, Arc<VirtualHost>>,
}

impl Server {
    /// Creates a server that will accept connections on the given port
    /// (port 0 picks an ephemeral port). A default virtual host is added.
    pub fn new(port: u16) -> Self {
        let mut hosts = HashMap::new();
        hosts.insert(String::new(), Arc::new(VirtualHost::new(None)));
        Server {
            port,
            socket_timeout: Duration::from_secs(10),
            factory: Box::new(PlainSocketFactory),
            executor: Box::new(ThreadPerConnection),
            hosts,
        }
    }

    /// Sets the read timeout for established connections.
    pub fn set_socket_timeout(&mut self, timeout: Duration) {
        self.socket_timeout = timeout;
    }

    /// Sets the factory used to wrap accepted sockets. Use a
    /// [`crate::TlsSocketFactory`] for HTTPS.
    pub fn set_socket_factory(&mut self, factory: Box<dyn SocketFactory>) {
        self.factory = factory;
    }

    /// Sets the executor servicing connections.
    pub fn set_executor(&mut self, executor: Box<dyn Executor>) {
        self.executor = executor;
    }

    /// Returns the virtual host with the given name, or the default host
    /// for None.
    pub fn virtual_host(&self, name: Option<&str>) -> Option<&VirtualHost> {
        self.hosts.get(name.unwrap_or("")).map(|h| h.as_ref())
    }

    /// The default virtual host, which serves requests whose host name
    /// matches no other host.
    pub fn default_host(&self) -> &VirtualHost {
        self.hosts
            .get("")
            .map(|h| h.as_ref())
            .expect("default host always exists")
    }

    /// Returns the virtual host with the given name for configuration.
    /// Only available before the server is started.
    pub fn virtual_host_mut(&mut self, name: Option<&str>) -> Option<&mut VirtualHost> {
        self.hosts.get_mut(name.unwrap_or("")).and_then(Arc::get_mut)
    }

    /// Adds a virtual host, replacing any host with the same name.
    pub fn add_virtual_host(&mut self, host: VirtualHost) {
        let key = host.name().unwrap_or("").to_string();
        self.hosts.insert(key, Arc::new(host));
    }

    /// Starts the server: binds the listening socket, registers host
    /// aliases, and spawns the accept thread. The returned handle stops
    /// the listener when asked; in-flight connections finish on their own.
    pub fn start(mut self) -> Result<ServerHandle> {
        // fold aliases into the host map so lookups are a single get
        let mut aliases = Vec::new();
        for host in self.hosts.values() {
            for alias in host.aliases() {
                aliases.push((alias.clone(), host.clone()));
            }
        }
        for (alias, host) in aliases {
            self.hosts.insert(alias, host);
        }

        let listener = TcpListener::bind(("0.0.0.0", self.port))?;
        self.port = listener.local_addr()?.port();
        let port = self.port;
        let server = Arc::new(self);
        let shutdown = Arc::new(AtomicBool::new(false));
        let accept_thread = {
            let server = server.clone();
            let listener = listener.try_clone()?;
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name(format!("plume-accept-{}", port))
                .spawn(move || accept_loop(server, listener, shutdown))?
        };
        info!("listening on port {}", port);
        Ok(ServerHandle {
            server,
            _listener: listener,
            shutdown,
            thread: Some(accept_thread),
        })
    }

    fn handle_socket(&self, sock: TcpStream) {
        let peer = sock.peer_addr().ok();
        if let Err(e) = self.serve_connection(sock) {
            match peer {
                Some(addr) => debug!("connection from {} failed: {}", addr, e),
                None => debug!("connection failed: {}", e),
            }
        }
    }

    fn serve_connection(&self, sock: TcpStream) -> Result<()> {
        sock.set_read_timeout(Some(self.socket_timeout))?;
        // we buffer anyway, so improve latency
        sock.set_nodelay(true)?;
        let conn = self.factory.open(sock)?;
        let secure = conn.secure();
        let (reader, writer, control) = conn.into_parts();
        let mut input = BufReader::with_capacity(4096, reader);
        let mut output = BufWriter::with_capacity(4096, writer);

        let result = self.handle_connection(&mut input, &mut output, secure);

        // RFC 7230 section 6.6: close the socket gracefully. An SSL socket
        // does not support half-closing, so it is closed directly.
        let _ = output.flush();
        if !secure {
            let _ = control.shutdown(Shutdown::Write);
            let _ = transfer(&mut input, None, None);
        }
        result
    }

    /// Handles all transactions on one connection, until the streams end,
    /// an error occurs, or a side requests the connection be closed.
    fn handle_connection(
        &self,
        input: &mut ConnReader,
        output: &mut ConnWriter,
        secure: bool,
    ) -> Result<()> {
        loop {
            let mut resp = Response::new(&mut *output);
            let mut req = match Request::read(&mut *input, self, self.port, secure) {
                Err(Error::MissingRequestLine) => {
                    // not in the middle of a transaction - just disconnect
                    return Ok(());
                }
                Err(e) => {
                    resp.headers_mut().add("Connection", "close");
                    if e.is_timeout() {
                        resp.send_error(408, "Timeout waiting for client request")?;
                    } else {
                        resp.send_error(400, &format!("Invalid request: {}", e))?;
                    }
                    resp.close()?;
                    return Ok(());
                }
                Ok(req) => req,
            };
            resp.set_client(&req);
            if let Err(e) = self.handle_transaction(&mut req, &mut resp) {
                if resp.headers_sent() {
                    // too late for an error response - abort the connection
                    let _ = resp.close();
                    return Err(e);
                }
                resp.reset();
                resp.headers_mut().add("Connection", "close");
                resp.send_error(500, &format!("Error processing request: {}", e))?;
                resp.close()?;
                return Ok(());
            }
            resp.close()?;

            // RFC 7230 section 6.6: persist unless a side closes explicitly
            // (or the client is a legacy one)
            let persist = req.version().ends_with("1.1")
                && !wants_close(req.headers())
                && !wants_close(resp.headers());
            // consume leftover body data so the next request starts aligned
            transfer(&mut req.body_mut(), None, None)?;
            if !persist {
                return Ok(());
            }
        }
    }

    fn handle_transaction(&self, req: &mut Request<'_>, resp: &mut Response<'_>) -> Result<()> {
        if self.preprocess_transaction(req, resp)? {
            self.handle_method(req, resp)?;
        }
        Ok(())
    }

    /// Validates the transaction and performs required special header
    /// handling. Returns whether processing should continue.
    fn preprocess_transaction(
        &self,
        req: &mut Request<'_>,
        resp: &mut Response<'_>,
    ) -> Result<bool> {
        let version = req.version().to_string();
        if version == "HTTP/1.1" {
            if !req.headers().contains("Host") {
                // RFC 2616 section 14.23: missing Host header gets 400
                resp.headers_mut().add("Connection", "close");
                resp.send_error(400, "Missing required Host header")?;
                return Ok(false);
            }
            // reply to an expectation before the client sends the body
            if let Some(expect) = req.headers().get("Expect").map(|e| e.to_string()) {
                if expect.eq_ignore_ascii_case("100-continue") {
                    resp.send_continue()?;
                } else {
                    // RFC 2616 section 14.20: unknown expectations get 417
                    resp.headers_mut().add("Connection", "close");
                    resp.send_error_default(417)?;
                    return Ok(false);
                }
            }
        } else if version == "HTTP/1.0" || version == "HTTP/0.9" {
            // RFC 2616 section 14.10: strip connection headers from older versions
            let tokens = crate::util::split_elements(req.headers().get("Connection"), false);
            for token in tokens {
                req.headers_mut().remove(&token);
            }
        } else {
            resp.headers_mut().add("Connection", "close");
            resp.send_error(400, &format!("Unknown version: {}", version))?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Dispatches the transaction according to the request method.
    fn handle_method(&self, req: &mut Request<'_>, resp: &mut Response<'_>) -> Result<()> {
        let method = req.method().to_string();
        // RFC 2616 section 5.1.1: GET and HEAD must be supported
        if method == "GET" || req.context().handlers().contains_key(&method) {
            self.serve_context(req, resp)
        } else if method == "HEAD" {
            // identical to GET, with the body discarded
            req.set_method("GET");
            resp.set_discard_body(true);
            self.serve_context(req, resp)
        } else if method == "TRACE" {
            self.handle_trace(req, resp)
        } else {
            let mut methods: Vec<String> = ["GET", "HEAD", "TRACE", "OPTIONS"]
                .iter()
                .map(|m| m.to_string())
                .collect();
            // "*" is a special server-wide (no-context) request for OPTIONS
            let server_options = req.path() == "*" && method == "OPTIONS";
            let mut extra: Vec<String> = if server_options {
                req.virtual_host().methods().iter().cloned().collect()
            } else {
                req.context().handlers().keys().cloned().collect()
            };
            extra.sort();
            for m in extra {
                if !methods.contains(&m) {
                    methods.push(m);
                }
            }
            resp.headers_mut().add("Allow", &methods.join(", "));
            if method == "OPTIONS" {
                // RFC 2616 section 9.2
                resp.headers_mut().add("Content-Length", "0");
                resp.send_headers(200)?;
            } else if req.virtual_host().methods().contains(&method) {
                // supported by the host, but not by this context
                resp.send_headers(405)?;
            } else {
                resp.send_error_default(501)?;
            }
            Ok(())
        }
    }

    /// Serves the request by invoking the handler registered for the
    /// matched context and method. A directory path is first retried with
    /// the host's welcome file appended.
    fn serve_context(&self, req: &mut Request<'_>, resp: &mut Response<'_>) -> Result<()> {
        let handler = match req.context().handler_for(req.method()) {
            Some(handler) => handler.clone(),
            None => {
                resp.send_error_default(404)?;
                return Ok(());
            }
        };
        let mut status: u16 = 404;
        let path = req.path().to_string();
        if path.ends_with('/') {
            if let Some(index) = req.virtual_host().directory_index().map(|i| i.to_string()) {
                req.set_path(&format!("{}{}", path, index));
                status = match handler.serve(req, resp)? {
                    Outcome::Handled => 0,
                    Outcome::Status(s) => s,
                };
                req.set_path(&path);
            }
        }
        if status == 404 {
            status = match handler.serve(req, resp)? {
                Outcome::Handled => 0,
                Outcome::Status(s) => s,
            };
        }
        if status > 0 {
            resp.send_error_default(status)?;
        }
        Ok(())
    }

    /// The default TRACE handler: echoes the request line, headers and body
    /// back to the client as message/http.
    fn handle_trace(&self, req: &mut Request<'_>, resp: &mut Response<'_>) -> Result<()> {
        resp.send_headers_full(200, None, None, None, Some("message/http"), None)?;
        let echo = format!("TRACE {} {}", req.uri(), req.version());
        let mut head = Vec::new();
        req.headers().write_to(&mut head)?;
        if let Some(out) = resp.body()? {
            out.write_all(echo.as_bytes())?;
            out.write_all(CRLF)?;
            out.write_all(&head)?;
            transfer(&mut req.body_mut(), Some(out), None)?;
        }
        Ok(())
    }
}

fn wants_close(headers: &Headers) -> bool {
    headers
        .get("Connection")
        .map_or(false, |v| v.eq_ignore_ascii_case("close"))
}

fn accept_loop(server: Arc<Server>, listener: TcpListener, shutdown: Arc<AtomicBool>) {
    loop {
        match listener.accept() {
            Ok((sock, _)) => {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let worker = server.clone();
                server
                    .executor
                    .execute(Box::new(move || worker.handle_socket(sock)));
            }
            Err(e) => {
                if !shutdown.load(Ordering::Relaxed) {
                    warn!("accept failed: {}", e);
                }
                break;
            }
        }
    }
    debug!("accept loop ended");
}

/// A handle on a started server. The listening port is available (useful
/// when binding port 0), and the listener can be stopped.
pub struct ServerHandle {
    server: Arc<Server>,
    _listener: TcpListener,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// The port the server is accepting connections on.
    pub fn port(&self) -> u16 {
        self.server.port
    }

    /// Stops accepting connections. Connections already being serviced are
    /// not interrupted.
    pub fn stop(&mut self) {
        if self.shutdown.swap(true, Ordering::Relaxed) {
            return;
        }
        // poke the listener so the blocking accept wakes up and exits
        let _ = TcpStream::connect(("127.0.0.1", self.port()));
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        info!("stopped listening on port {}", self.port());
    }
}
