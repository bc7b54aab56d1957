//! Byte-level I/O primitives: bounded token/line readers, bounded stream
//! transfer, and the body framing streams (length-limited and chunked
//! decoding, chunked encoding).

use std::io::{self, Read, Write};

use crate::headers::Headers;
use crate::util::parse_ulong;
use crate::{Error, Result, CRLF, MAX_LINE_LENGTH};

/// Reads the token starting at the current stream position and ending at the
/// first occurrence of the given delimiter byte, or at the end of the stream
/// if no delimiter is given. If LF is the delimiter, a trailing CR is
/// stripped. Fails if the maximum length is reached before the token ends,
/// or if the stream ends before a requested delimiter is found.
pub fn read_token(input: &mut dyn Read, delim: Option<u8>, max_length: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = match input.read(&mut byte) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            if delim.is_some() {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "unexpected end of stream",
                )));
            }
            break;
        }
        if Some(byte[0]) == delim {
            break;
        }
        if buf.len() == max_length {
            return Err(Error::Protocol(format!("token too large ({})", buf.len())));
        }
        buf.push(byte[0]);
    }
    if delim == Some(b'\n') && buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(buf)
}

/// Reads an ISO-8859-1 encoded line ending at the first LF character,
/// excluding the LF and an immediately preceding CR. Lines are capped at
/// 8192 bytes.
pub fn read_line(input: &mut dyn Read) -> Result<String> {
    let buf = read_token(input, Some(b'\n'), MAX_LINE_LENGTH)?;
    Ok(buf.iter().map(|&b| b as char).collect())
}

/// Transfers data from a source to a sink using a 4K buffer. A None sink
/// discards the data. If a length is given, exactly that many bytes are
/// transferred, and a premature end of the source is an error; otherwise the
/// source is transferred until it ends.
pub fn transfer(
    src: &mut dyn Read,
    mut dst: Option<&mut dyn Write>,
    len: Option<u64>,
) -> Result<()> {
    if len == Some(0) {
        return Ok(());
    }
    let mut remaining = len;
    let mut buf = [0u8; 4096];
    loop {
        let want = match remaining {
            Some(r) if r < buf.len() as u64 => r as usize,
            _ => buf.len(),
        };
        let n = match src.read(&mut buf[..want]) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            if remaining.is_some() {
                return Err(Error::Protocol("unexpected end of stream".to_string()));
            }
            return Ok(());
        }
        if let Some(out) = dst.as_deref_mut() {
            out.write_all(&buf[..n])?;
        }
        if let Some(r) = remaining.as_mut() {
            *r -= n as u64;
            if *r == 0 {
                return Ok(());
            }
        }
    }
}

/// A reader exposing at most a fixed number of further bytes from the
/// underlying stream, after which it behaves as if the end of the stream was
/// reached (the underlying stream remains open and may hold more data).
///
/// In strict mode, a premature end of the underlying stream is an error;
/// otherwise this stream simply ends as well.
pub struct LimitedReader<R: Read> {
    inner: R,
    remaining: u64,
    strict: bool,
}

impl<R: Read> LimitedReader<R> {
    pub fn new(inner: R, limit: u64, strict: bool) -> Self {
        LimitedReader {
            inner,
            remaining: limit,
            strict,
        }
    }

    /// The number of bytes still readable from this stream.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl<R: Read> Read for LimitedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            if self.strict {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "unexpected end of stream",
                ));
            }
            self.remaining = 0;
            return Ok(0);
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// A decoder for the "chunked" transfer encoding. Chunk extension
/// parameters are ignored. Trailer headers following the final chunk are
/// read as well; the caller appends them to its own header collection via
/// [`ChunkedReader::take_trailers`], or simply drops the reader to discard
/// them.
pub struct ChunkedReader<R: Read> {
    inner: R,
    remaining: u64,
    initialized: bool,
    done: bool,
    trailers: Headers,
}

impl<R: Read> ChunkedReader<R> {
    pub fn new(inner: R) -> Self {
        ChunkedReader {
            inner,
            remaining: 0,
            initialized: false,
            done: false,
            trailers: Headers::new(),
        }
    }

    /// Whether the final chunk (and its trailer section) has been read.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Removes and returns the trailer headers read after the final chunk,
    /// for appending to the caller's own headers. Empty until the stream
    /// has been fully consumed, and on every call after the first.
    pub fn take_trailers(&mut self) -> Headers {
        std::mem::take(&mut self.trailers)
    }

    /// Initializes the next chunk: verifies the CRLF terminating the
    /// previous chunk, then reads and parses the next chunk-size line.
    /// A zero-size chunk ends the stream and pulls in the trailers.
    fn init_chunk(&mut self) -> io::Result<()> {
        if self.initialized {
            let terminator = read_line(&mut self.inner).map_err(invalid_data)?;
            if !terminator.is_empty() {
                return Err(invalid_data(Error::Protocol(
                    "chunk data must end with CRLF".to_string(),
                )));
            }
        }
        self.initialized = true;
        let line = read_line(&mut self.inner).map_err(invalid_data)?;
        self.remaining = parse_chunk_size(&line).map_err(invalid_data)?;
        if self.remaining == 0 {
            self.done = true;
            self.trailers = Headers::read_from(&mut self.inner).map_err(invalid_data)?;
        }
        Ok(())
    }
}

impl<R: Read> Read for ChunkedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.done || buf.is_empty() {
            return Ok(0);
        }
        if self.remaining == 0 {
            self.init_chunk()?;
            if self.done {
                return Ok(0);
            }
        }
        let max = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "unexpected end of stream",
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

fn invalid_data(e: Error) -> io::Error {
    match e {
        Error::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
    }
}

/// Parses a chunk-size line, ignoring any extension parameters after ';'.
fn parse_chunk_size(line: &str) -> Result<u64> {
    let size = match line.find(';') {
        Some(pos) => &line[..pos],
        None => line,
    };
    parse_ulong(size.trim(), 16)
        .map_err(|_| Error::Protocol(format!("invalid chunk size line: \"{}\"", line)))
}

/// An encoder applying the "chunked" transfer encoding: each write becomes
/// one chunk. Finishing the stream writes the terminating zero-size chunk
/// and an empty trailer, without closing the underlying writer.
pub struct ChunkedWriter<W: Write> {
    inner: W,
    finished: bool,
}

impl<W: Write> ChunkedWriter<W> {
    pub fn new(inner: W) -> Self {
        ChunkedWriter {
            inner,
            finished: false,
        }
    }

    /// Writes the zero-size terminator chunk and empty trailer, and returns
    /// the underlying writer.
    pub fn finish(mut self) -> io::Result<W> {
        if !self.finished {
            self.inner.write_all(b"0\r\n\r\n")?;
            self.finished = true;
        }
        Ok(self.inner)
    }
}

impl<W: Write> Write for ChunkedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        write!(self.inner, "{:x}", buf.len())?;
        self.inner.write_all(CRLF)?;
        self.inner.write_all(buf)?;
        self.inner.write_all(CRLF)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_read_token() {
        let mut input = Cursor::new(b"hello world".to_vec());
        let token = read_token(&mut input, Some(b' '), 8192).unwrap();
        assert_eq!(token, b"hello");
        let rest = read_token(&mut input, None, 8192).unwrap();
        assert_eq!(rest, b"world");
    }

    #[test]
    fn test_read_token_eof_before_delimiter() {
        let mut input = Cursor::new(b"partial".to_vec());
        assert!(read_token(&mut input, Some(b'\n'), 8192).is_err());
    }

    #[test]
    fn test_read_token_too_large() {
        let mut input = Cursor::new(vec![b'x'; 64]);
        assert!(read_token(&mut input, Some(b'\n'), 16).is_err());
    }

    #[test]
    fn test_read_line_strips_cr() {
        let mut input = Cursor::new(b"one\r\ntwo\nthree\r\n".to_vec());
        assert_eq!(read_line(&mut input).unwrap(), "one");
        assert_eq!(read_line(&mut input).unwrap(), "two");
        assert_eq!(read_line(&mut input).unwrap(), "three");
    }

    #[test]
    fn test_transfer_bounded() {
        let mut src = Cursor::new(b"0123456789".to_vec());
        let mut dst = Vec::new();
        transfer(&mut src, Some(&mut dst), Some(4)).unwrap();
        assert_eq!(dst, b"0123");
    }

    #[test]
    fn test_transfer_discard_and_unbounded() {
        let mut src = Cursor::new(b"0123456789".to_vec());
        transfer(&mut src, None, Some(3)).unwrap();
        let mut dst = Vec::new();
        transfer(&mut src, Some(&mut dst), None).unwrap();
        assert_eq!(dst, b"3456789");
    }

    #[test]
    fn test_transfer_premature_end() {
        let mut src = Cursor::new(b"abc".to_vec());
        assert!(transfer(&mut src, None, Some(10)).is_err());
    }

    #[test]
    fn test_limited_reader() {
        let mut r = LimitedReader::new(Cursor::new(b"0123456789".to_vec()), 4, true);
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"0123");
        // at its end, even though the underlying stream has more
        let mut buf = [0u8; 4];
        assert_eq!(r.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_limited_reader_strict_premature_end() {
        let mut r = LimitedReader::new(Cursor::new(b"ab".to_vec()), 5, true);
        let mut out = Vec::new();
        assert!(r.read_to_end(&mut out).is_err());
    }

    #[test]
    fn test_limited_reader_lenient_premature_end() {
        let mut r = LimitedReader::new(Cursor::new(b"ab".to_vec()), 5, false);
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"ab");
    }

    #[test]
    fn test_chunked_reader() {
        let wire = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n".to_vec();
        let mut r = ChunkedReader::new(Cursor::new(wire));
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn test_chunked_reader_extension_and_trailers() {
        let wire = b"5;ext=1\r\nhello\r\n0\r\nX-Check: sum\r\n\r\n".to_vec();
        let mut r = ChunkedReader::new(Cursor::new(wire));
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello");
        assert!(r.is_done());
        let mut headers = Headers::new();
        headers.add_all(&r.take_trailers());
        assert_eq!(headers.get("X-Check"), Some("sum"));
        // a second take yields nothing
        assert!(r.take_trailers().is_empty());
    }

    #[test]
    fn test_chunked_reader_bad_size() {
        let wire = b"zz\r\nhello\r\n".to_vec();
        let mut r = ChunkedReader::new(Cursor::new(wire));
        let mut out = Vec::new();
        assert!(r.read_to_end(&mut out).is_err());
    }

    #[test]
    fn test_chunked_reader_missing_crlf() {
        let wire = b"5\r\nhelloXX3\r\nabc\r\n0\r\n\r\n".to_vec();
        let mut r = ChunkedReader::new(Cursor::new(wire));
        let mut out = Vec::new();
        assert!(r.read_to_end(&mut out).is_err());
    }

    #[test]
    fn test_chunked_writer() {
        let mut out = Vec::new();
        let mut w = ChunkedWriter::new(&mut out);
        w.write_all(b"hello").unwrap();
        w.write_all(b" world").unwrap();
        w.finish().unwrap();
        assert_eq!(out, b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n");
    }

    #[test]
    fn test_chunked_round_trip() {
        let payload = b"The quick brown fox jumps over the lazy dog".to_vec();
        let mut wire = Vec::new();
        {
            let mut w = ChunkedWriter::new(&mut wire);
            for chunk in payload.chunks(7) {
                w.write_all(chunk).unwrap();
            }
            w.finish().unwrap();
        }
        let mut r = ChunkedReader::new(Cursor::new(wire));
        let mut decoded = Vec::new();
        r.read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, payload);
    }
}
