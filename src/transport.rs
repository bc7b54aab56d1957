//! Socket transport abstraction.
//!
//! A `SocketFactory` turns accepted TCP sockets into `Connection`s, hiding
//! whether the byte stream is plain or TLS. All the protocol code above is
//! transparent to the underlying transport.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::{Arc, Mutex};

use openssl::error::ErrorStack;
use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod, SslStream};

use crate::{Error, Result};

/// The buffered reading half of a connection.
pub type ConnReader = io::BufReader<Box<dyn Read + Send>>;
/// The buffered writing half of a connection.
pub type ConnWriter = io::BufWriter<Box<dyn Write + Send>>;

/// An accepted connection, split into a reading half, a writing half, and a
/// control handle on the underlying socket (used for timeouts and for the
/// half-close on teardown).
pub struct Connection {
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    control: TcpStream,
    secure: bool,
}

impl Connection {
    pub fn new(
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        control: TcpStream,
        secure: bool,
    ) -> Self {
        Connection {
            reader,
            writer,
            control,
            secure,
        }
    }

    /// Whether the connection is encrypted.
    pub fn secure(&self) -> bool {
        self.secure
    }

    pub fn into_parts(self) -> (Box<dyn Read + Send>, Box<dyn Write + Send>, TcpStream) {
        (self.reader, self.writer, self.control)
    }
}

/// A factory wrapping accepted sockets into connections, plain or TLS.
pub trait SocketFactory: Send + Sync {
    /// Wraps an accepted socket, performing any handshake required.
    fn open(&self, stream: TcpStream) -> Result<Connection>;

    /// Whether connections from this factory are encrypted.
    fn secure(&self) -> bool {
        false
    }
}

/// The default factory: plain, unencrypted TCP.
pub struct PlainSocketFactory;

impl SocketFactory for PlainSocketFactory {
    fn open(&self, stream: TcpStream) -> Result<Connection> {
        let reader = stream.try_clone()?;
        let control = stream.try_clone()?;
        Ok(Connection::new(
            Box::new(reader),
            Box::new(stream),
            control,
            false,
        ))
    }
}

/// A TLS factory performing the server-side handshake on each accepted
/// socket with openssl.
pub struct TlsSocketFactory {
    acceptor: SslAcceptor,
}

impl TlsSocketFactory {
    /// Builds a factory from PEM certificate chain and private key files.
    pub fn from_pem_files(cert: &Path, key: &Path) -> Result<Self> {
        let mut builder =
            SslAcceptor::mozilla_intermediate(SslMethod::tls()).map_err(tls_error)?;
        builder
            .set_private_key_file(key, SslFiletype::PEM)
            .map_err(tls_error)?;
        builder
            .set_certificate_chain_file(cert)
            .map_err(tls_error)?;
        builder.check_private_key().map_err(tls_error)?;
        Ok(TlsSocketFactory {
            acceptor: builder.build(),
        })
    }

    /// Builds a factory from an already-configured acceptor.
    pub fn new(acceptor: SslAcceptor) -> Self {
        TlsSocketFactory { acceptor }
    }
}

impl SocketFactory for TlsSocketFactory {
    fn open(&self, stream: TcpStream) -> Result<Connection> {
        let control = stream.try_clone()?;
        let tls = self
            .acceptor
            .accept(stream)
            .map_err(|e| Error::Tls(e.to_string()))?;
        let shared = Arc::new(Mutex::new(tls));
        Ok(Connection::new(
            Box::new(TlsHalf(shared.clone())),
            Box::new(TlsHalf(shared)),
            control,
            true,
        ))
    }

    fn secure(&self) -> bool {
        true
    }
}

fn tls_error(e: ErrorStack) -> Error {
    Error::Tls(e.to_string())
}

// An SslStream cannot be cloned like a TcpStream, so the two halves share
// it behind a mutex. Within a connection all I/O is sequential, so the lock
// is never contended.
struct TlsHalf(Arc<Mutex<SslStream<TcpStream>>>);

impl TlsHalf {
    fn lock(&self) -> std::sync::MutexGuard<'_, SslStream<TcpStream>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Read for TlsHalf {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.lock().read(buf)
    }
}

impl Write for TlsHalf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock().flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_plain_factory_splits_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            let conn = PlainSocketFactory.open(sock).unwrap();
            assert!(!conn.secure());
            let (mut reader, mut writer, _control) = conn.into_parts();
            let mut buf = [0u8; 4];
            reader.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"ping");
            writer.write_all(b"pong").unwrap();
            writer.flush().unwrap();
        });

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");

        handle.join().unwrap();
    }
}
