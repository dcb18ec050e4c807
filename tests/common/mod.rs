#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use wikiserve::server::ListenerHandle;
use wikiserve::{ListenerConfig, Router};

/// Start a listener for `router` on an OS-chosen loopback port.
pub fn start(router: Router) -> ListenerHandle {
    start_with(router, |cfg| cfg)
}

pub fn start_with(
    router: Router,
    configure: impl FnOnce(ListenerConfig) -> ListenerConfig,
) -> ListenerHandle {
    let cfg = configure(ListenerConfig {
        port: Some("0".to_string()),
        host: Some("127.0.0.1".to_string()),
        ..Default::default()
    });
    let handle =
        wikiserve::server::start_listener(&cfg, Arc::new(router)).expect("listener must start");
    handle.wait_ready().expect("listener must become ready");
    handle
}

/// Send raw bytes, read until the server closes the connection.
pub fn raw_request(handle: &ListenerHandle, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(handle.local_addr()).expect("connect");
    stream.write_all(request).expect("write request");
    let mut response = Vec::new();
    stream.read_to_end(&mut response).expect("read response");
    response
}

pub fn get(handle: &ListenerHandle, path: &str) -> Response {
    let request = format!("GET {path} HTTP/1.1\r\nhost: t.local\r\nconnection: close\r\n\r\n");
    parse_response(&raw_request(handle, request.as_bytes()))
}

pub fn request_with(
    handle: &ListenerHandle,
    method: &str,
    path: &str,
    extra_headers: &[(&str, &str)],
    body: &[u8],
) -> Response {
    let mut request = format!("{method} {path} HTTP/1.1\r\nhost: t.local\r\nconnection: close\r\n");
    for (name, value) in extra_headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str(&format!("content-length: {}\r\n\r\n", body.len()));
    let mut wire = request.into_bytes();
    wire.extend_from_slice(body);
    parse_response(&raw_request(handle, &wire))
}

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Parse an HTTP/1.1 response, decoding chunked bodies.
pub fn parse_response(raw: &[u8]) -> Response {
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response must contain a header terminator");
    let head = std::str::from_utf8(&raw[..split]).expect("response head must be UTF-8");
    let mut lines = head.split("\r\n");
    let status_line = lines.next().expect("status line");
    let status: u16 = status_line
        .split(' ')
        .nth(1)
        .and_then(|code| code.parse().ok())
        .expect("status code");
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_lowercase(), value.trim().to_string()))
        })
        .collect();

    let mut body = raw[split + 4..].to_vec();
    let chunked = headers
        .iter()
        .any(|(n, v)| n == "transfer-encoding" && v.contains("chunked"));
    if chunked {
        body = decode_chunked(&body);
    }
    Response {
        status,
        headers,
        body,
    }
}

fn decode_chunked(mut raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let Some(line_end) = raw.windows(2).position(|w| w == b"\r\n") else {
            break;
        };
        let size_str = std::str::from_utf8(&raw[..line_end]).unwrap_or("0");
        let size = usize::from_str_radix(size_str.split(';').next().unwrap_or("0").trim(), 16)
            .unwrap_or(0);
        if size == 0 {
            break;
        }
        let start = line_end + 2;
        out.extend_from_slice(&raw[start..start + size]);
        raw = &raw[start + size + 2..];
    }
    out
}
