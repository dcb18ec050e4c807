//! HTTP/2 protocol adapter.
//!
//! Frames, SETTINGS, flow control, and HPACK are handled here; streams are
//! serviced one at a time per connection (the engine runs one task per
//! request, so cross-stream concurrency comes from separate connections).
//! Pseudo-headers are translated before the router sees the request:
//! `:authority` becomes `host`, `:method`/`:path` populate the typed head.

use std::io;

use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};

use super::channel::{BodyFraming, HttpChannel, Protocol, RequestHead};
use super::conn::{ByteStream, H2_PREFACE};
use super::hpack::{encode_field, FieldDecoder};

pub const FRAME_DATA: u8 = 0x0;
pub const FRAME_HEADERS: u8 = 0x1;
pub const FRAME_PRIORITY: u8 = 0x2;
pub const FRAME_RST_STREAM: u8 = 0x3;
pub const FRAME_SETTINGS: u8 = 0x4;
pub const FRAME_PUSH_PROMISE: u8 = 0x5;
pub const FRAME_PING: u8 = 0x6;
pub const FRAME_GOAWAY: u8 = 0x7;
pub const FRAME_WINDOW_UPDATE: u8 = 0x8;
pub const FRAME_CONTINUATION: u8 = 0x9;

pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_ACK: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;
pub const FLAG_PADDED: u8 = 0x8;
pub const FLAG_PRIORITY: u8 = 0x20;

const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x1;
const SETTINGS_MAX_CONCURRENT_STREAMS: u16 = 0x3;
const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;
const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;

const DEFAULT_WINDOW: i64 = 65_535;
const DEFAULT_MAX_FRAME: usize = 16_384;

// our receive-side ceiling; frames beyond this are a protocol error
const MAX_ACCEPTED_FRAME: u32 = 1 << 20;

#[derive(Debug, Clone, Copy)]
pub struct FrameHead {
    pub len: u32,
    pub kind: u8,
    pub flags: u8,
    pub stream: u32,
}

fn proto_err(what: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, what)
}

/// One HTTP/2 connection: socket, read buffer, HPACK state, flow windows.
pub struct H2Conn {
    stream: Box<dyn ByteStream>,
    rx: Vec<u8>,
    decoder: FieldDecoder,
    /// Connection-level send window.
    send_window: i64,
    /// Initial window for newly opened streams (peer SETTINGS).
    peer_initial_window: i64,
    peer_max_frame: usize,
}

impl H2Conn {
    pub fn new(stream: Box<dyn ByteStream>, leftover: Vec<u8>) -> Self {
        H2Conn {
            stream,
            rx: leftover,
            decoder: FieldDecoder::new(),
            send_window: DEFAULT_WINDOW,
            peer_initial_window: DEFAULT_WINDOW,
            peer_max_frame: DEFAULT_MAX_FRAME,
        }
    }

    fn read_exact(&mut self, n: usize) -> io::Result<Vec<u8>> {
        while self.rx.len() < n {
            let mut chunk = [0u8; 8 * 1024];
            let read = self.stream.read(&mut chunk)?;
            if read == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            self.rx.extend_from_slice(&chunk[..read]);
        }
        Ok(self.rx.drain(..n).collect())
    }

    fn read_frame(&mut self) -> io::Result<(FrameHead, Vec<u8>)> {
        let head = self.read_exact(9)?;
        let len = (u32::from(head[0]) << 16) | (u32::from(head[1]) << 8) | u32::from(head[2]);
        if len > MAX_ACCEPTED_FRAME {
            return Err(proto_err("frame too large"));
        }
        let frame = FrameHead {
            len,
            kind: head[3],
            flags: head[4],
            stream: u32::from_be_bytes([head[5], head[6], head[7], head[8]]) & 0x7fff_ffff,
        };
        let payload = self.read_exact(len as usize)?;
        Ok((frame, payload))
    }

    fn write_frame(&mut self, kind: u8, flags: u8, stream: u32, payload: &[u8]) -> io::Result<()> {
        let len = payload.len();
        if len > 0x00ff_ffff {
            return Err(proto_err("frame payload too large"));
        }
        let mut out = Vec::with_capacity(9 + len);
        out.push((len >> 16) as u8);
        out.push((len >> 8) as u8);
        out.push(len as u8);
        out.push(kind);
        out.push(flags);
        out.extend_from_slice(&(stream & 0x7fff_ffff).to_be_bytes());
        out.extend_from_slice(payload);
        self.stream.write_all(&out)?;
        self.stream.flush()
    }

    /// Consume the client preface and announce our settings.
    pub fn handshake(&mut self) -> io::Result<()> {
        let preface = self.read_exact(H2_PREFACE.len())?;
        if preface != H2_PREFACE {
            return Err(proto_err("bad connection preface"));
        }
        // one stream at a time, announced honestly
        let mut settings = Vec::new();
        settings.extend_from_slice(&SETTINGS_MAX_CONCURRENT_STREAMS.to_be_bytes());
        settings.extend_from_slice(&1u32.to_be_bytes());
        self.write_frame(FRAME_SETTINGS, 0, 0, &settings)
    }

    fn apply_settings(&mut self, payload: &[u8]) -> io::Result<()> {
        if payload.len() % 6 != 0 {
            return Err(proto_err("settings length"));
        }
        for entry in payload.chunks_exact(6) {
            let id = u16::from_be_bytes([entry[0], entry[1]]);
            let value = u32::from_be_bytes([entry[2], entry[3], entry[4], entry[5]]);
            match id {
                SETTINGS_INITIAL_WINDOW_SIZE => {
                    if value > 0x7fff_ffff {
                        return Err(proto_err("initial window"));
                    }
                    self.peer_initial_window = i64::from(value);
                }
                SETTINGS_MAX_FRAME_SIZE => {
                    if (16_384..=16_777_215).contains(&value) {
                        self.peer_max_frame = value as usize;
                    }
                }
                SETTINGS_HEADER_TABLE_SIZE => {
                    self.decoder.set_dynamic_limit(value as usize);
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Handle a connection-maintenance frame. Returns `false` on GOAWAY.
    fn service_frame(&mut self, frame: FrameHead, payload: &[u8]) -> io::Result<bool> {
        match frame.kind {
            FRAME_SETTINGS => {
                if frame.flags & FLAG_ACK == 0 {
                    self.apply_settings(payload)?;
                    self.write_frame(FRAME_SETTINGS, FLAG_ACK, 0, &[])?;
                }
            }
            FRAME_PING => {
                if frame.flags & FLAG_ACK == 0 {
                    if payload.len() != 8 {
                        return Err(proto_err("ping length"));
                    }
                    self.write_frame(FRAME_PING, FLAG_ACK, 0, payload)?;
                }
            }
            FRAME_WINDOW_UPDATE if frame.stream == 0 => {
                if payload.len() != 4 {
                    return Err(proto_err("window update length"));
                }
                let add = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
                    & 0x7fff_ffff;
                self.send_window += i64::from(add);
            }
            FRAME_GOAWAY => return Ok(false),
            FRAME_PRIORITY => {}
            FRAME_PUSH_PROMISE => return Err(proto_err("push from client")),
            _ => {}
        }
        Ok(true)
    }

    /// Wait for the next request head. `Ok(None)` is a clean GOAWAY/EOF.
    pub fn next_request(&mut self) -> io::Result<Option<(RequestHead, u32, bool)>> {
        loop {
            let (frame, payload) = match self.read_frame() {
                Ok(x) => x,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e),
            };
            match frame.kind {
                FRAME_HEADERS => {
                    let stream_id = frame.stream;
                    if stream_id == 0 || stream_id % 2 == 0 {
                        return Err(proto_err("bad stream id"));
                    }
                    let end_stream = frame.flags & FLAG_END_STREAM != 0;
                    let mut block = strip_headers_padding(&frame, &payload)?;
                    let mut end_headers = frame.flags & FLAG_END_HEADERS != 0;
                    while !end_headers {
                        let (cont, cont_payload) = self.read_frame()?;
                        if cont.kind != FRAME_CONTINUATION || cont.stream != stream_id {
                            return Err(proto_err("expected continuation"));
                        }
                        block.extend_from_slice(&cont_payload);
                        end_headers = cont.flags & FLAG_END_HEADERS != 0;
                    }
                    let fields = self
                        .decoder
                        .decode(&block)
                        .map_err(|_| proto_err("hpack"))?;
                    let head = self.head_from_fields(fields)?;
                    return Ok(Some((head, stream_id, end_stream)));
                }
                FRAME_DATA => return Err(proto_err("data before headers")),
                _ => {
                    if !self.service_frame(frame, &payload)? {
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn head_from_fields(
        &self,
        fields: Vec<(Vec<u8>, Vec<u8>)>,
    ) -> io::Result<RequestHead> {
        let mut method = None;
        let mut path = None;
        let mut authority = None;
        let mut headers = HeaderMap::new();
        let mut saw_regular = false;

        for (name, value) in fields {
            if name.first() == Some(&b':') {
                if saw_regular {
                    return Err(proto_err("pseudo-header after regular"));
                }
                match name.as_slice() {
                    b":method" => method = Some(value),
                    b":path" => path = Some(value),
                    b":authority" => authority = Some(value),
                    b":scheme" => {}
                    _ => return Err(proto_err("unknown pseudo-header")),
                }
            } else {
                saw_regular = true;
                // connection-specific headers have no meaning on h2
                if matches!(
                    name.as_slice(),
                    b"connection" | b"keep-alive" | b"transfer-encoding" | b"upgrade"
                ) {
                    continue;
                }
                let name =
                    HeaderName::from_bytes(&name).map_err(|_| proto_err("header name"))?;
                let value =
                    HeaderValue::from_bytes(&value).map_err(|_| proto_err("header value"))?;
                headers.append(name, value);
            }
        }

        let method = Method::from_bytes(&method.ok_or_else(|| proto_err("missing :method"))?)
            .map_err(|_| proto_err(":method"))?;
        let target = String::from_utf8(path.ok_or_else(|| proto_err("missing :path"))?)
            .map_err(|_| proto_err(":path"))?;
        // :authority becomes host so everything above sees HTTP/1 shapes
        if let Some(authority) = authority {
            if headers.get("host").is_none() {
                headers.insert(
                    "host",
                    HeaderValue::from_bytes(&authority).map_err(|_| proto_err(":authority"))?,
                );
            }
        }

        Ok(RequestHead {
            method,
            target,
            headers,
            protocol: Protocol::Http2,
        })
    }

    pub fn initial_stream_window(&self) -> i64 {
        self.peer_initial_window
    }
}

fn strip_headers_padding(frame: &FrameHead, payload: &[u8]) -> io::Result<Vec<u8>> {
    let mut start = 0usize;
    let mut end = payload.len();
    if frame.flags & FLAG_PADDED != 0 {
        let pad = *payload.first().ok_or_else(|| proto_err("padding"))? as usize;
        start += 1;
        end = end.checked_sub(pad).ok_or_else(|| proto_err("padding"))?;
    }
    if frame.flags & FLAG_PRIORITY != 0 {
        start += 5;
    }
    payload
        .get(start..end)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| proto_err("headers frame"))
}

fn strip_data_padding(frame: &FrameHead, payload: &[u8]) -> io::Result<Vec<u8>> {
    if frame.flags & FLAG_PADDED == 0 {
        return Ok(payload.to_vec());
    }
    let pad = *payload.first().ok_or_else(|| proto_err("padding"))? as usize;
    let end = payload
        .len()
        .checked_sub(pad)
        .filter(|end| *end >= 1)
        .ok_or_else(|| proto_err("padding"))?;
    Ok(payload[1..end].to_vec())
}

/// The per-stream channel over one HTTP/2 connection.
pub struct H2Channel {
    conn: Option<H2Conn>,
    stream_id: u32,
    body_done: bool,
    body_buf: Vec<u8>,
    stream_window: i64,
    head_sent: bool,
    ended: bool,
}

impl H2Channel {
    pub fn new(conn: H2Conn, stream_id: u32, body_done: bool) -> Self {
        let stream_window = conn.initial_stream_window();
        H2Channel {
            conn: Some(conn),
            stream_id,
            body_done,
            body_buf: Vec::new(),
            stream_window,
            head_sent: false,
            ended: false,
        }
    }

    fn conn_mut(&mut self) -> io::Result<&mut H2Conn> {
        self.conn
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection destroyed"))
    }

    /// Pump one frame while a stream operation is waiting on the peer.
    fn pump(&mut self) -> io::Result<()> {
        let stream_id = self.stream_id;
        let conn = self.conn_mut()?;
        let (frame, payload) = conn.read_frame()?;
        match frame.kind {
            FRAME_DATA if frame.stream == stream_id => {
                if self.body_done {
                    return Err(proto_err("data after end of stream"));
                }
                let data = strip_data_padding(&frame, &payload)?;
                if frame.flags & FLAG_END_STREAM != 0 {
                    self.body_done = true;
                }
                // replenish both windows for what we are about to consume
                if !payload.is_empty() {
                    let add = (payload.len() as u32).to_be_bytes();
                    let conn = self.conn_mut()?;
                    conn.write_frame(FRAME_WINDOW_UPDATE, 0, 0, &add)?;
                    if !self.body_done {
                        self.conn_mut()?
                            .write_frame(FRAME_WINDOW_UPDATE, 0, stream_id, &add)?;
                    }
                }
                self.body_buf.extend_from_slice(&data);
            }
            FRAME_WINDOW_UPDATE if frame.stream == stream_id => {
                if payload.len() != 4 {
                    return Err(proto_err("window update length"));
                }
                let add = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
                    & 0x7fff_ffff;
                self.stream_window += i64::from(add);
            }
            FRAME_RST_STREAM if frame.stream == stream_id => {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "stream reset by peer",
                ));
            }
            _ => {
                if !self.conn_mut()?.service_frame(frame, &payload)? {
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "goaway from peer",
                    ));
                }
            }
        }
        Ok(())
    }

    fn header_block(status: StatusCode, headers: &HeaderMap) -> Vec<u8> {
        let mut block = Vec::new();
        encode_field(&mut block, b":status", status.as_str().as_bytes());
        for (name, value) in headers {
            // connection-specific headers must not appear on h2
            if matches!(
                name.as_str(),
                "connection" | "keep-alive" | "transfer-encoding" | "upgrade"
            ) {
                continue;
            }
            encode_field(&mut block, name.as_str().as_bytes(), value.as_bytes());
        }
        block
    }

    fn write_header_block(&mut self, block: &[u8], end_stream: bool) -> io::Result<()> {
        let stream_id = self.stream_id;
        let max_frame = self.conn_mut()?.peer_max_frame;
        let mut chunks = block.chunks(max_frame).peekable();
        let mut first = true;
        // an empty block still needs one HEADERS frame
        if block.is_empty() {
            let flags = FLAG_END_HEADERS | if end_stream { FLAG_END_STREAM } else { 0 };
            return self.conn_mut()?.write_frame(FRAME_HEADERS, flags, stream_id, &[]);
        }
        while let Some(chunk) = chunks.next() {
            let last = chunks.peek().is_none();
            let kind = if first { FRAME_HEADERS } else { FRAME_CONTINUATION };
            let mut flags = 0u8;
            if last {
                flags |= FLAG_END_HEADERS;
            }
            if first && end_stream {
                flags |= FLAG_END_STREAM;
            }
            self.conn_mut()?.write_frame(kind, flags, stream_id, chunk)?;
            first = false;
        }
        Ok(())
    }
}

impl HttpChannel for H2Channel {
    fn protocol(&self) -> Protocol {
        Protocol::Http2
    }

    fn read_body(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if !self.body_buf.is_empty() {
                let n = buf.len().min(self.body_buf.len());
                buf[..n].copy_from_slice(&self.body_buf[..n]);
                self.body_buf.drain(..n);
                return Ok(n);
            }
            if self.body_done {
                return Ok(0);
            }
            self.pump()?;
        }
    }

    fn send_head(
        &mut self,
        status: StatusCode,
        headers: &HeaderMap,
        framing: BodyFraming,
    ) -> io::Result<()> {
        let block = Self::header_block(status, headers);
        let end_stream = matches!(framing, BodyFraming::Empty);
        self.write_header_block(&block, end_stream)?;
        self.head_sent = true;
        if end_stream {
            self.ended = true;
        }
        Ok(())
    }

    fn send_data(&mut self, data: &[u8]) -> io::Result<()> {
        let stream_id = self.stream_id;
        let mut rest = data;
        while !rest.is_empty() {
            // block until the peer opens both windows
            while self.stream_window <= 0 || self.conn_mut()?.send_window <= 0 {
                self.pump()?;
            }
            let stream_window = self.stream_window.max(0) as usize;
            let budget = {
                let conn = self.conn_mut()?;
                conn.peer_max_frame
                    .min(conn.send_window as usize)
                    .min(stream_window)
            };
            let n = rest.len().min(budget);
            let (chunk, tail) = rest.split_at(n);
            self.conn_mut()?.write_frame(FRAME_DATA, 0, stream_id, chunk)?;
            self.conn_mut()?.send_window -= n as i64;
            self.stream_window -= n as i64;
            rest = tail;
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.conn_mut()?.stream.flush()
    }

    fn finish(&mut self) -> io::Result<()> {
        if self.ended {
            return Ok(());
        }
        let stream_id = self.stream_id;
        self.conn_mut()?
            .write_frame(FRAME_DATA, FLAG_END_STREAM, stream_id, &[])?;
        self.ended = true;
        Ok(())
    }

    fn send_early_hints(&mut self, headers: &HeaderMap) -> io::Result<()> {
        if self.head_sent {
            return Ok(());
        }
        let block = Self::header_block(StatusCode::EARLY_HINTS, headers);
        self.write_header_block(&block, false)
    }

    fn destroy(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            let _ = conn.write_frame(FRAME_RST_STREAM, 0, self.stream_id, &2u32.to_be_bytes());
        }
    }

    fn into_h2(mut self: Box<Self>) -> Option<H2Conn> {
        if !self.ended || self.conn.is_none() {
            return None;
        }
        // drain the rest of the request body so the connection state is clean
        let mut guard = 0;
        while !self.body_done {
            if self.pump().is_err() {
                return None;
            }
            self.body_buf.clear();
            guard += 1;
            if guard > 4096 {
                return None;
            }
        }
        self.conn.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::sync::{Arc, Mutex};

    struct ScriptStream {
        input: io::Cursor<Vec<u8>>,
        output: Arc<Mutex<Vec<u8>>>,
    }

    impl ScriptStream {
        fn new(input: Vec<u8>) -> (Self, Arc<Mutex<Vec<u8>>>) {
            let output = Arc::new(Mutex::new(Vec::new()));
            (
                ScriptStream {
                    input: io::Cursor::new(input),
                    output: Arc::clone(&output),
                },
                output,
            )
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

    fn frame(kind: u8, flags: u8, stream: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(9 + payload.len());
        let len = payload.len() as u32;
        out.push((len >> 16) as u8);
        out.push((len >> 8) as u8);
        out.push(len as u8);
        out.push(kind);
        out.push(flags);
        out.extend_from_slice(&stream.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn get_request_block() -> Vec<u8> {
        let mut block = Vec::new();
        encode_field(&mut block, b":method", b"GET");
        encode_field(&mut block, b":path", b"/wiki/home?rev=2");
        encode_field(&mut block, b":scheme", b"http");
        encode_field(&mut block, b":authority", b"wiki.example");
        encode_field(&mut block, b"x-requested-with", b"TiddlyWiki");
        block
    }

    #[test]
    fn test_handshake_and_request_head() {
        let mut wire = H2_PREFACE.to_vec();
        wire.extend(frame(FRAME_SETTINGS, 0, 0, &[]));
        wire.extend(frame(
            FRAME_HEADERS,
            FLAG_END_HEADERS | FLAG_END_STREAM,
            1,
            &get_request_block(),
        ));
        let (stream, out) = ScriptStream::new(wire);
        let mut conn = H2Conn::new(Box::new(stream), Vec::new());
        conn.handshake().unwrap();

        let (head, stream_id, end_stream) = conn.next_request().unwrap().unwrap();
        assert_eq!(stream_id, 1);
        assert!(end_stream);
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.target, "/wiki/home?rev=2");
        assert_eq!(head.protocol, Protocol::Http2);
        // :authority was translated to host
        assert_eq!(head.header_str("host"), Some("wiki.example"));
        assert_eq!(head.header_str("x-requested-with"), Some("TiddlyWiki"));

        // our SETTINGS went out first, then the ack for theirs
        let written = out.lock().unwrap().clone();
        assert_eq!(written[3], FRAME_SETTINGS);
    }

    #[test]
    fn test_request_body_data_frames() {
        let mut wire = H2_PREFACE.to_vec();
        let mut block = Vec::new();
        encode_field(&mut block, b":method", b"POST");
        encode_field(&mut block, b":path", b"/");
        encode_field(&mut block, b":authority", b"a");
        wire.extend(frame(FRAME_HEADERS, FLAG_END_HEADERS, 1, &block));
        wire.extend(frame(FRAME_DATA, 0, 1, b"hello "));
        wire.extend(frame(FRAME_DATA, FLAG_END_STREAM, 1, b"h2"));

        let (stream, _) = ScriptStream::new(wire);
        let mut conn = H2Conn::new(Box::new(stream), Vec::new());
        conn.handshake().unwrap();
        let (_, stream_id, end_stream) = conn.next_request().unwrap().unwrap();
        assert!(!end_stream);

        let mut chan = H2Channel::new(conn, stream_id, end_stream);
        let mut collected = Vec::new();
        let mut buf = [0u8; 3];
        loop {
            let n = chan.read_body(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
        }
        assert_eq!(collected, b"hello h2");
    }

    #[test]
    fn test_response_frames_decode() {
        let mut wire = H2_PREFACE.to_vec();
        wire.extend(frame(
            FRAME_HEADERS,
            FLAG_END_HEADERS | FLAG_END_STREAM,
            1,
            &get_request_block(),
        ));
        let (stream, out) = ScriptStream::new(wire);
        let mut conn = H2Conn::new(Box::new(stream), Vec::new());
        conn.handshake().unwrap();
        let (_, stream_id, end_stream) = conn.next_request().unwrap().unwrap();

        let mut chan = H2Channel::new(conn, stream_id, end_stream);
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        chan.send_head(StatusCode::OK, &headers, BodyFraming::Known(2))
            .unwrap();
        chan.send_data(b"ok").unwrap();
        chan.finish().unwrap();

        // walk the written frames: SETTINGS, HEADERS, DATA, DATA(END_STREAM)
        let written = out.lock().unwrap().clone();
        let mut at = 0usize;
        let mut kinds = Vec::new();
        let mut header_block = Vec::new();
        let mut data = Vec::new();
        while at + 9 <= written.len() {
            let len = ((written[at] as usize) << 16)
                | ((written[at + 1] as usize) << 8)
                | written[at + 2] as usize;
            let kind = written[at + 3];
            kinds.push(kind);
            let payload = &written[at + 9..at + 9 + len];
            if kind == FRAME_HEADERS {
                header_block.extend_from_slice(payload);
            }
            if kind == FRAME_DATA {
                data.extend_from_slice(payload);
            }
            at += 9 + len;
        }
        assert!(kinds.contains(&FRAME_HEADERS));
        assert_eq!(data, b"ok");

        let mut dec = FieldDecoder::new();
        let fields = dec.decode(&header_block).unwrap();
        assert!(fields.contains(&(b":status".to_vec(), b"200".to_vec())));
        assert!(fields.contains(&(b"content-type".to_vec(), b"text/plain".to_vec())));
    }
}
