//! Protocol-neutral request/response capability set.
//!
//! HTTP/1.1 and HTTP/2 each adapt their wire format to this pair: a parsed
//! [`RequestHead`] plus an [`HttpChannel`] the request state reads its body
//! from and writes its response through. Everything above this trait is
//! protocol-agnostic.

use std::io;

use http::{HeaderMap, Method, StatusCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http1,
    Http2,
}

/// How the response body will be framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// Exact byte count known up front.
    Known(u64),
    /// Length unknown; chunked on H1, DATA frames on H2.
    Stream,
    /// No body follows the head.
    Empty,
}

/// The normalised request head handed to the router.
///
/// HTTP/2 pseudo-headers are already translated by the time this exists:
/// `:authority` became `host`, `:method`/`:path` populate the typed fields.
#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    /// Raw request target, e.g. `/wiki/page?rev=3`.
    pub target: String,
    /// Lowercased, multi-value header map.
    pub headers: HeaderMap,
    pub protocol: Protocol,
}

impl RequestHead {
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// `host` is always populated (the H2 adapter writes it from
    /// `:authority`; H1 requests without one get the listener's name).
    pub fn host(&self) -> Option<&str> {
        self.header_str("host")
    }
}

/// Capability set shared by both protocol adapters.
///
/// One response per channel: `send_head` exactly once, `send_data` zero or
/// more times, then `finish`. `destroy` tears the underlying stream down
/// without completing the response (client gone, fatal error).
pub trait HttpChannel: Send {
    fn protocol(&self) -> Protocol;

    /// Pull the next request-body bytes. `Ok(0)` is end-of-body.
    fn read_body(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn send_head(
        &mut self,
        status: StatusCode,
        headers: &HeaderMap,
        framing: BodyFraming,
    ) -> io::Result<()>;

    fn send_data(&mut self, data: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;

    /// Complete the response framing (terminal chunk / END_STREAM).
    fn finish(&mut self) -> io::Result<()>;

    /// 103 Early Hints; only HTTP/2 can express these, H1 ignores them.
    fn send_early_hints(&mut self, _headers: &HeaderMap) -> io::Result<()> {
        Ok(())
    }

    fn destroy(&mut self);

    /// Hand the underlying HTTP/1 connection back for keep-alive reuse.
    /// Protocols without reusable request slots return `None`.
    fn into_h1(self: Box<Self>) -> Option<super::h1::H1Conn> {
        None
    }

    /// Hand the HTTP/2 connection back so the next stream can be serviced.
    fn into_h2(self: Box<Self>) -> Option<super::h2::H2Conn> {
        None
    }
}
