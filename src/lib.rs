//! plume - a lightweight, embeddable HTTP/1.1 server
//!
//! This crate implements the request/response transaction engine of a small
//! blocking HTTP/1.1 server: connection handling, message parsing with all
//! three body framings (Content-Length, chunked, until-close), streaming
//! response encoders (identity/chunked/gzip/deflate), a virtual-host and
//! longest-prefix context dispatch tree, conditional and byte-range
//! semantics, and a file-serving handler. TLS is supported through a
//! pluggable socket factory.
//!
//! The server is designed to be embedded: handlers are registered
//! programmatically per path and method, and each connection is serviced by
//! one worker, sequentially, with no pipelining.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use plume::{Outcome, Request, Response, Server};
//!
//! fn hello(_req: &mut Request<'_>, resp: &mut Response<'_>) -> plume::Result<Outcome> {
//!     resp.headers_mut().add("Content-Type", "text/plain");
//!     resp.send(200, "Hello")?;
//!     Ok(Outcome::Handled)
//! }
//!
//! let mut server = Server::new(8080);
//! let host = server.virtual_host_mut(None).unwrap();
//! host.add_context("/hello", Arc::new(hello), &["GET"]).unwrap();
//! let handle = server.start().unwrap();
//! println!("listening on port {}", handle.port());
//! ```

pub mod cond;
pub mod date;
pub mod file;
pub mod headers;
pub mod host;
pub mod io;
pub mod mime;
pub mod multipart;
pub mod request;
pub mod response;
pub mod server;
pub mod transport;
pub mod util;

pub use file::FileContextHandler;
pub use headers::{Header, Headers};
pub use host::{ContextHandler, ContextInfo, Outcome, VirtualHost};
pub use request::{Body, Request};
pub use response::Response;
pub use server::{Executor, Server, ServerHandle};
pub use transport::{PlainSocketFactory, SocketFactory, TlsSocketFactory};

/// Result type for server operations
pub type Result<T> = std::result::Result<T, Error>;

/// Server operation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("missing request line")]
    MissingRequestLine,

    #[error("{0}")]
    Protocol(String),

    #[error("TLS error: {0}")]
    Tls(String),
}

impl Error {
    /// Whether this error was caused by the per-socket read timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Io(e) if matches!(
            e.kind(),
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
        ))
    }
}

/// CRLF line ending
pub const CRLF: &[u8] = b"\r\n";

/// Maximum length of a single request/header line in bytes
pub const MAX_LINE_LENGTH: usize = 8192;

/// Maximum number of header lines per message
pub const MAX_HEADER_LINES: usize = 100;
