//! HTTP/1.1 protocol adapter.
//!
//! Request heads are parsed with hard limits, bodies are framed by
//! `Content-Length` or chunked transfer-coding, and responses are framed by
//! known length or chunked writes. Keep-alive follows the version defaults:
//! HTTP/1.1 stays open unless `Connection: close`, HTTP/1.0 closes unless
//! `Connection: keep-alive`.

use std::io::{self, Read, Write};

use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};

use super::channel::{BodyFraming, HttpChannel, Protocol, RequestHead};
use super::conn::ByteStream;

const MAX_REQUEST_LINE: usize = 8 * 1024;
const MAX_HEADER_COUNT: usize = 100;
const MAX_HEADER_BLOCK: usize = 64 * 1024;

/// Leftover request body larger than this is not drained for reuse; the
/// connection is closed instead.
const MAX_DRAIN: u64 = 64 * 1024;

#[derive(Debug)]
pub enum H1Error {
    Io(io::Error),
    /// Malformed request; the connection gets a bare 400 and closes.
    BadRequest(&'static str),
    /// Clean EOF between requests.
    Eof,
}

impl From<io::Error> for H1Error {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            H1Error::Eof
        } else {
            H1Error::Io(e)
        }
    }
}

/// One HTTP/1 connection: the socket plus buffered unconsumed bytes.
pub struct H1Conn {
    stream: Box<dyn ByteStream>,
    buf: Vec<u8>,
}

impl H1Conn {
    pub fn new(stream: Box<dyn ByteStream>, leftover: Vec<u8>) -> Self {
        H1Conn {
            stream,
            buf: leftover,
        }
    }

    fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; 8 * 1024];
        let n = self.stream.read(&mut chunk)?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Read buffered bytes first, then the socket.
    fn read_some(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if !self.buf.is_empty() {
            let n = out.len().min(self.buf.len());
            out[..n].copy_from_slice(&self.buf[..n]);
            self.buf.drain(..n);
            return Ok(n);
        }
        self.stream.read(out)
    }

    fn read_exact_into(&mut self, out: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < out.len() {
            let n = self.read_some(&mut out[filled..])?;
            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            filled += n;
        }
        Ok(())
    }

    /// Consume one CRLF-terminated line (without the terminator).
    fn read_line(&mut self, limit: usize) -> Result<Vec<u8>, H1Error> {
        loop {
            if let Some(pos) = find_crlf(&self.buf) {
                let line: Vec<u8> = self.buf.drain(..pos).collect();
                self.buf.drain(..2);
                return Ok(line);
            }
            if self.buf.len() > limit {
                return Err(H1Error::BadRequest("line too long"));
            }
            if self.fill()? == 0 {
                return Err(H1Error::Eof);
            }
        }
    }

    /// Parse the next request head off the connection.
    pub fn read_head(&mut self) -> Result<(RequestHead, H1RequestBody, H1ConnMeta), H1Error> {
        let line = self.read_line(MAX_REQUEST_LINE)?;
        if line.is_empty() {
            return Err(H1Error::BadRequest("empty request line"));
        }
        let line = std::str::from_utf8(&line).map_err(|_| H1Error::BadRequest("request line"))?;
        let mut parts = line.split(' ');
        let method = parts
            .next()
            .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
            .ok_or(H1Error::BadRequest("method"))?;
        let target = parts.next().ok_or(H1Error::BadRequest("target"))?.to_string();
        let version = parts.next().ok_or(H1Error::BadRequest("version"))?;
        let http10 = match version {
            "HTTP/1.1" => false,
            "HTTP/1.0" => true,
            _ => return Err(H1Error::BadRequest("version")),
        };
        if parts.next().is_some() {
            return Err(H1Error::BadRequest("request line"));
        }

        let mut headers = HeaderMap::new();
        let mut block_size = 0usize;
        loop {
            let line = self.read_line(MAX_HEADER_BLOCK)?;
            if line.is_empty() {
                break;
            }
            block_size += line.len() + 2;
            if block_size > MAX_HEADER_BLOCK || headers.len() >= MAX_HEADER_COUNT {
                return Err(H1Error::BadRequest("headers too large"));
            }
            let sep = line
                .iter()
                .position(|&b| b == b':')
                .ok_or(H1Error::BadRequest("header"))?;
            let name = HeaderName::from_bytes(&line[..sep])
                .map_err(|_| H1Error::BadRequest("header name"))?;
            let raw_value = trim_ows(&line[sep + 1..]);
            let value = HeaderValue::from_bytes(raw_value)
                .map_err(|_| H1Error::BadRequest("header value"))?;
            headers.append(name, value);
        }

        let te_chunked = headers
            .get("transfer-encoding")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false);
        let content_length = headers
            .get("content-length")
            .map(|v| {
                v.to_str()
                    .ok()
                    .and_then(|s| s.trim().parse::<u64>().ok())
                    .ok_or(H1Error::BadRequest("content-length"))
            })
            .transpose()?;
        if te_chunked && content_length.is_some() {
            // ambiguous framing is a smuggling vector
            return Err(H1Error::BadRequest("ambiguous body length"));
        }

        let body = if te_chunked {
            H1RequestBody::Chunked(ChunkState::Size)
        } else {
            H1RequestBody::Length {
                remaining: content_length.unwrap_or(0),
            }
        };

        let keep_alive = {
            let conn_tokens = headers
                .get_all("connection")
                .iter()
                .filter_map(|v| v.to_str().ok())
                .flat_map(|v| v.split(','))
                .map(|t| t.trim().to_ascii_lowercase())
                .collect::<Vec<_>>();
            if conn_tokens.iter().any(|t| t == "close") {
                false
            } else if conn_tokens.iter().any(|t| t == "keep-alive") {
                true
            } else {
                !http10
            }
        };

        let head = RequestHead {
            method,
            target,
            headers,
            protocol: Protocol::Http1,
        };
        Ok((head, body, H1ConnMeta { keep_alive, http10 }))
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }

    /// Last-resort error response for requests that never got a head parsed.
    pub fn reject(&mut self, status: StatusCode) {
        let line = format!(
            "HTTP/1.1 {} {}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        );
        let _ = self.write_all(line.as_bytes());
        let _ = self.flush();
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn trim_ows(mut bytes: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = bytes {
        bytes = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = bytes {
        bytes = rest;
    }
    bytes
}

/// Connection facts the serve loop needs alongside the parsed head.
#[derive(Debug, Clone, Copy)]
pub struct H1ConnMeta {
    pub keep_alive: bool,
    pub http10: bool,
}

/// Request-body framing state.
#[derive(Debug)]
pub enum H1RequestBody {
    Length { remaining: u64 },
    Chunked(ChunkState),
    Done,
}

#[derive(Debug)]
pub enum ChunkState {
    Size,
    Data { remaining: u64 },
    Done,
}

/// The per-request channel over one H1 connection.
pub struct H1Channel {
    conn: Option<H1Conn>,
    body: H1RequestBody,
    keep_alive: bool,
    http10: bool,
    chunked_response: bool,
    finished: bool,
}

impl H1Channel {
    pub fn new(conn: H1Conn, body: H1RequestBody, keep_alive: bool, http10: bool) -> Self {
        H1Channel {
            conn: Some(conn),
            body,
            keep_alive,
            http10,
            chunked_response: false,
            finished: false,
        }
    }

    fn conn_mut(&mut self) -> io::Result<&mut H1Conn> {
        self.conn
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection destroyed"))
    }

    fn read_chunked(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        fn invalid(what: &'static str) -> io::Error {
            io::Error::new(io::ErrorKind::InvalidData, what)
        }
        loop {
            let data_remaining = match &self.body {
                H1RequestBody::Chunked(ChunkState::Size) => None,
                H1RequestBody::Chunked(ChunkState::Data { remaining }) => Some(*remaining),
                _ => return Ok(0),
            };
            match data_remaining {
                None => {
                    let conn = self.conn_mut()?;
                    let line = conn
                        .read_line(MAX_REQUEST_LINE)
                        .map_err(|_| invalid("chunk size"))?;
                    let size_str =
                        std::str::from_utf8(&line).map_err(|_| invalid("chunk size"))?;
                    let size_str = size_str.split(';').next().unwrap_or("").trim();
                    let size =
                        u64::from_str_radix(size_str, 16).map_err(|_| invalid("chunk size"))?;
                    if size == 0 {
                        // trailer section: consume lines until the blank one
                        loop {
                            let line = conn
                                .read_line(MAX_REQUEST_LINE)
                                .map_err(|_| invalid("chunk trailer"))?;
                            if line.is_empty() {
                                break;
                            }
                        }
                        self.body = H1RequestBody::Chunked(ChunkState::Done);
                        return Ok(0);
                    }
                    self.body = H1RequestBody::Chunked(ChunkState::Data { remaining: size });
                }
                Some(remaining) => {
                    let want = buf.len().min(remaining as usize);
                    let conn = self.conn_mut()?;
                    let n = conn.read_some(&mut buf[..want])?;
                    if n == 0 {
                        return Err(io::ErrorKind::UnexpectedEof.into());
                    }
                    let left = remaining - n as u64;
                    if left == 0 {
                        let mut crlf = [0u8; 2];
                        conn.read_exact_into(&mut crlf)?;
                        if &crlf != b"\r\n" {
                            return Err(invalid("chunk end"));
                        }
                        self.body = H1RequestBody::Chunked(ChunkState::Size);
                    } else {
                        self.body = H1RequestBody::Chunked(ChunkState::Data { remaining: left });
                    }
                    return Ok(n);
                }
            }
        }
    }

    /// Consume any unread request body so the connection can be reused.
    fn drain_request_body(&mut self) -> bool {
        let mut drained = 0u64;
        let mut scratch = [0u8; 8 * 1024];
        loop {
            match self.read_body(&mut scratch) {
                Ok(0) => return true,
                Ok(n) => {
                    drained += n as u64;
                    if drained > MAX_DRAIN {
                        return false;
                    }
                }
                Err(_) => return false,
            }
        }
    }
}

impl HttpChannel for H1Channel {
    fn protocol(&self) -> Protocol {
        Protocol::Http1
    }

    fn read_body(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let remaining = match &self.body {
            H1RequestBody::Length { remaining } => *remaining,
            H1RequestBody::Chunked(_) => return self.read_chunked(buf),
            H1RequestBody::Done => return Ok(0),
        };
        if remaining == 0 {
            return Ok(0);
        }
        let want = buf.len().min(remaining as usize);
        let conn = self.conn_mut()?;
        let n = conn.read_some(&mut buf[..want])?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        self.body = H1RequestBody::Length {
            remaining: remaining - n as u64,
        };
        Ok(n)
    }

    fn send_head(
        &mut self,
        status: StatusCode,
        headers: &HeaderMap,
        framing: BodyFraming,
    ) -> io::Result<()> {
        let mut head = format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
        .into_bytes();

        for (name, value) in headers {
            head.extend_from_slice(name.as_str().as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }

        let headless_status = status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED;
        match framing {
            BodyFraming::Known(len) => {
                if headers.get("content-length").is_none() {
                    head.extend_from_slice(format!("content-length: {len}\r\n").as_bytes());
                }
            }
            BodyFraming::Stream => {
                if self.http10 {
                    // HTTP/1.0 cannot chunk; delimit by close
                    self.keep_alive = false;
                } else {
                    head.extend_from_slice(b"transfer-encoding: chunked\r\n");
                    self.chunked_response = true;
                }
            }
            BodyFraming::Empty => {
                if !headless_status && headers.get("content-length").is_none() {
                    head.extend_from_slice(b"content-length: 0\r\n");
                }
            }
        }
        if !self.keep_alive && headers.get("connection").is_none() {
            head.extend_from_slice(b"connection: close\r\n");
        }
        head.extend_from_slice(b"\r\n");

        let conn = self.conn_mut()?;
        conn.write_all(&head)?;
        if matches!(framing, BodyFraming::Empty) {
            self.finished = true;
        }
        Ok(())
    }

    fn send_data(&mut self, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let chunked = self.chunked_response;
        let conn = self.conn_mut()?;
        if chunked {
            conn.write_all(format!("{:x}\r\n", data.len()).as_bytes())?;
            conn.write_all(data)?;
            conn.write_all(b"\r\n")?;
        } else {
            conn.write_all(data)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.conn_mut()?.flush()
    }

    fn finish(&mut self) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        if self.chunked_response {
            let conn = self.conn_mut()?;
            conn.write_all(b"0\r\n\r\n")?;
        }
        self.conn_mut()?.flush()?;
        self.finished = true;
        Ok(())
    }

    fn destroy(&mut self) {
        // dropping the stream closes the socket
        self.conn = None;
    }

    fn into_h1(mut self: Box<Self>) -> Option<H1Conn> {
        if !self.keep_alive || !self.finished || self.conn.is_none() {
            return None;
        }
        if !self.drain_request_body() {
            return None;
        }
        self.conn.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{Arc, Mutex};

    struct ScriptStream {
        input: io::Cursor<Vec<u8>>,
        output: Arc<Mutex<Vec<u8>>>,
    }

    impl ScriptStream {
        fn new(input: &[u8]) -> (Self, Arc<Mutex<Vec<u8>>>) {
            let output = Arc::new(Mutex::new(Vec::new()));
            let stream = ScriptStream {
                input: io::Cursor::new(input.to_vec()),
                output: Arc::clone(&output),
            };
            (stream, output)
        }
    }

    impl Read for ScriptStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for ScriptStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn conn_for(wire: &[u8]) -> H1Conn {
        let (stream, _) = ScriptStream::new(wire);
        H1Conn::new(Box::new(stream), Vec::new())
    }

    #[test]
    fn test_parse_simple_get() {
        let mut conn = conn_for(b"GET /a/b?x=1 HTTP/1.1\r\nHost: wiki.example\r\nX-One: 1\r\n\r\n");
        let (head, body, meta) = conn.read_head().unwrap();
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.target, "/a/b?x=1");
        assert_eq!(head.header_str("host"), Some("wiki.example"));
        assert_eq!(head.header_str("x-one"), Some("1"));
        assert!(meta.keep_alive);
        assert!(!meta.http10);
        assert!(matches!(body, H1RequestBody::Length { remaining: 0 }));
    }

    #[test]
    fn test_http10_defaults_to_close() {
        let mut conn = conn_for(b"GET / HTTP/1.0\r\n\r\n");
        let (_, _, meta) = conn.read_head().unwrap();
        assert!(!meta.keep_alive);
        assert!(meta.http10);

        let mut conn = conn_for(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n");
        let (_, _, meta) = conn.read_head().unwrap();
        assert!(meta.keep_alive);
    }

    #[test]
    fn test_ambiguous_framing_rejected() {
        let mut conn = conn_for(
            b"POST / HTTP/1.1\r\nContent-Length: 3\r\nTransfer-Encoding: chunked\r\n\r\nabc",
        );
        assert!(matches!(conn.read_head(), Err(H1Error::BadRequest(_))));
    }

    #[test]
    fn test_content_length_body_read() {
        let mut conn = conn_for(b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello");
        let (_, body, _) = conn.read_head().unwrap();
        let mut chan = H1Channel::new(conn, body, true, false);
        let mut buf = [0u8; 16];
        let n = chan.read_body(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(chan.read_body(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_chunked_body_read() {
        let wire = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let mut conn = conn_for(wire);
        let (_, body, _) = conn.read_head().unwrap();
        let mut chan = H1Channel::new(conn, body, true, false);
        let mut collected = Vec::new();
        let mut buf = [0u8; 4];
        loop {
            let n = chan.read_body(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
        }
        assert_eq!(collected, b"hello world");
    }

    #[test]
    fn test_response_known_length() {
        let (stream, out) = ScriptStream::new(b"");
        let conn = H1Conn::new(Box::new(stream), Vec::new());
        let mut chan = H1Channel::new(conn, H1RequestBody::Length { remaining: 0 }, true, false);
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        chan.send_head(StatusCode::OK, &headers, BodyFraming::Known(2))
            .unwrap();
        chan.send_data(b"ok").unwrap();
        chan.finish().unwrap();

        let text = String::from_utf8(out.lock().unwrap().clone()).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-length: 2\r\n"));
        assert!(text.ends_with("\r\n\r\nok"));
    }

    #[test]
    fn test_chunked_response_framing() {
        let (stream, out) = ScriptStream::new(b"");
        let conn = H1Conn::new(Box::new(stream), Vec::new());
        let mut chan = H1Channel::new(conn, H1RequestBody::Length { remaining: 0 }, true, false);
        chan.send_head(StatusCode::OK, &HeaderMap::new(), BodyFraming::Stream)
            .unwrap();
        chan.send_data(b"hello").unwrap();
        chan.finish().unwrap();

        let text = String::from_utf8(out.lock().unwrap().clone()).unwrap();
        assert!(text.contains("transfer-encoding: chunked\r\n"));
        assert!(text.ends_with("5\r\nhello\r\n0\r\n\r\n"));
    }
}
