//! Per-request state: the façade handlers see.
//!
//! Built by the router after parse + match, it combines the normalised inputs
//! (method, URL, headers, cookies, params, body) with the response writers.
//! Every sender returns the [`StreamEnded`] proof; headers go on the wire at
//! most once per response, and the second attempt is logged with the call
//! site that won.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::io::Read;
use std::panic::Location;

use http::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION, SET_COOKIE};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use serde::Serialize;
use serde_json::Value;
use url::Url;

use crate::encoding::{negotiate, BodyEncoder, ContentEncoding};
use crate::error::{ErrorReason, SendError, StreamEnded};
use crate::multipart::{self, PartVisitor};
use crate::server::channel::{BodyFraming, HttpChannel, Protocol};

/// The shape in which a route wants the request body prepared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFormat {
    Ignore,
    Stream,
    Buffer,
    String,
    Json,
    FormUrlEncoded,
    FormUrlEncodedMulti,
    Multipart,
}

impl BodyFormat {
    pub fn tag(self) -> &'static str {
        match self {
            BodyFormat::Ignore => "ignore",
            BodyFormat::Stream => "stream",
            BodyFormat::Buffer => "buffer",
            BodyFormat::String => "string",
            BodyFormat::Json => "json",
            BodyFormat::FormUrlEncoded => "www-form-urlencoded",
            BodyFormat::FormUrlEncodedMulti => "www-form-urlencoded-urlsearchparams",
            BodyFormat::Multipart => "multipart",
        }
    }
}

/// Cookie attributes for [`RequestState::set_cookie`].
#[derive(Debug, Default, Clone)]
pub struct SetCookieOptions {
    pub domain: Option<String>,
    pub path: Option<String>,
    /// Preformatted HTTP date.
    pub expires: Option<String>,
    pub max_age: Option<i64>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<String>,
}

/// Typed any-map so collaborators (session/auth) can attach per-request
/// state — the authenticated user handle lives here.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) {
        self.map.insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref())
    }

    pub fn remove<T: Any + Send + Sync>(&mut self) -> Option<T> {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|v| v.downcast().ok())
            .map(|v| *v)
    }
}

/// Parse all `cookie` headers into a multi-map.
pub fn parse_cookies(headers: &HeaderMap) -> HashMap<String, Vec<String>> {
    let mut cookies: HashMap<String, Vec<String>> = HashMap::new();
    for value in headers.get_all("cookie") {
        let Ok(value) = value.to_str() else { continue };
        for pair in value.split(';') {
            let mut parts = pair.trim().splitn(2, '=');
            let Some(name) = parts.next().filter(|n| !n.is_empty()) else {
                continue;
            };
            let value = parts.next().unwrap_or("");
            cookies
                .entry(name.trim().to_string())
                .or_default()
                .push(value.trim().to_string());
        }
    }
    cookies
}

/// Parse a query string into a name → values multi-map.
pub fn parse_query_params(url: &Url) -> HashMap<String, Vec<String>> {
    let mut params: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in url.query_pairs() {
        params
            .entry(name.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    params
}

/// `decodeURIComponent` equivalent: one pass of percent-decoding, UTF-8.
pub fn percent_decode(raw: &str) -> Option<String> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes.get(i + 1..i + 3)?;
                let hi = (hex[0] as char).to_digit(16)?;
                let lo = (hex[1] as char).to_digit(16)?;
                out.push((hi * 16 + lo) as u8);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).ok()
}

/// `encodeURIComponent` equivalent for cookie values.
fn percent_encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for &b in raw.as_bytes() {
        match b {
            b'A'..=b'Z'
            | b'a'..=b'z'
            | b'0'..=b'9'
            | b'-'
            | b'_'
            | b'.'
            | b'!'
            | b'~'
            | b'*'
            | b'\''
            | b'('
            | b')' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Everything the router hands over when constructing a state.
pub struct StateSeed {
    pub channel: Box<dyn HttpChannel>,
    pub method: Method,
    pub host: String,
    pub url_info: Url,
    /// Prefix-stripped request target (path plus query).
    pub url: String,
    pub path_prefix: String,
    pub headers: HeaderMap,
    pub body_format: BodyFormat,
    pub expect_secure: bool,
    pub max_body_bytes: usize,
}

pub struct RequestState {
    pub method: Method,
    pub host: String,
    pub url_info: Url,
    /// Prefix-stripped target, always beginning with `/`.
    pub url: String,
    pub path_prefix: String,
    pub headers: HeaderMap,
    pub cookies: HashMap<String, Vec<String>>,
    pub path_params: HashMap<String, String>,
    pub query_params: HashMap<String, Vec<String>>,
    pub body_format: BodyFormat,
    pub data_buffer: Option<Vec<u8>>,
    pub data: Option<Value>,
    pub expect_secure: bool,
    /// Matched route chain, for diagnostics.
    pub route_path: String,
    pub max_body_bytes: usize,
    pub extensions: Extensions,
    headers_sent: Option<&'static Location<'static>>,
    pending_cookies: Vec<String>,
    channel: Option<Box<dyn HttpChannel>>,
    encoder: Option<BodyEncoder>,
    body_read: bool,
}

impl RequestState {
    pub fn new(seed: StateSeed) -> Self {
        let cookies = parse_cookies(&seed.headers);
        let query_params = parse_query_params(&seed.url_info);
        RequestState {
            method: seed.method,
            host: seed.host,
            url_info: seed.url_info,
            url: seed.url,
            path_prefix: seed.path_prefix,
            headers: seed.headers,
            cookies,
            path_params: HashMap::new(),
            query_params,
            body_format: seed.body_format,
            data_buffer: None,
            data: None,
            expect_secure: seed.expect_secure,
            route_path: String::new(),
            max_body_bytes: seed.max_body_bytes,
            extensions: Extensions::default(),
            headers_sent: None,
            pending_cookies: Vec::new(),
            channel: Some(seed.channel),
            encoder: None,
            body_read: false,
        }
    }

    pub fn headers_sent(&self) -> bool {
        self.headers_sent.is_some()
    }

    pub fn protocol(&self) -> Protocol {
        self.channel
            .as_ref()
            .map(|c| c.protocol())
            .unwrap_or(Protocol::Http1)
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    fn channel_err() -> SendError {
        SendError::new(ErrorReason::StreamClosed, None)
    }

    // ---- body reading -----------------------------------------------------

    /// Read the whole request body, subject to the listener's size ceiling.
    pub fn read_buffer(&mut self) -> Result<Vec<u8>, SendError> {
        if let Some(buffered) = &self.data_buffer {
            return Ok(buffered.clone());
        }
        if self.body_read {
            return Ok(Vec::new());
        }
        self.body_read = true;
        let limit = self.max_body_bytes;
        let channel = self.channel.as_mut().ok_or_else(Self::channel_err)?;
        let mut body = Vec::new();
        let mut chunk = [0u8; 16 * 1024];
        loop {
            let n = channel.read_body(&mut chunk)?;
            if n == 0 {
                break;
            }
            if body.len() + n > limit {
                return Err(SendError::new(
                    ErrorReason::PayloadTooLarge,
                    Some(serde_json::json!({ "limit": limit })),
                ));
            }
            body.extend_from_slice(&chunk[..n]);
        }
        self.data_buffer = Some(body.clone());
        Ok(body)
    }

    /// Stream multipart parts to the visitor in wire order, with
    /// backpressure: the next chunk is not read until the callback returns.
    pub fn read_multipart_data(&mut self, visitor: &mut dyn PartVisitor) -> Result<(), SendError> {
        let boundary = multipart::parse_boundary(self.header_str("content-type"))?;
        self.body_read = true;
        let channel = self.channel.as_mut().ok_or_else(Self::channel_err)?;
        multipart::read_parts(|buf| channel.read_body(buf), &boundary, visitor)
    }

    // ---- compression ------------------------------------------------------

    /// Negotiate against the client's `Accept-Encoding` with a per-call
    /// whitelist; does not change response state.
    pub fn accepts_encoding(&self, allow: &[ContentEncoding]) -> ContentEncoding {
        negotiate(self.header_str("accept-encoding"), allow)
    }

    /// Negotiate and wire the chosen coder into the response stream.
    pub fn enable_compression(&mut self, allow: &[ContentEncoding]) -> ContentEncoding {
        if self.headers_sent() {
            tracing::warn!("enable_compression after headers were sent; ignored");
            return ContentEncoding::Identity;
        }
        let chosen = self.accepts_encoding(allow);
        self.encoder = Some(BodyEncoder::new(chosen));
        chosen
    }

    /// Finalise the current encoded member and open a new one, flushing the
    /// boundary to the client. Chunked export endpoints use this to emit
    /// independently decodable segments.
    pub fn split_compression_stream(&mut self) -> Result<(), SendError> {
        let tail = match &mut self.encoder {
            Some(encoder) => encoder.split()?,
            None => return Ok(()),
        };
        let channel = self.channel.as_mut().ok_or_else(Self::channel_err)?;
        if !tail.is_empty() {
            channel.send_data(&tail)?;
        }
        channel.flush()?;
        Ok(())
    }

    // ---- header discipline ------------------------------------------------

    /// Record the head write exactly once. The losing call site is logged
    /// together with the one that got there first, and ignored.
    fn begin_response(&mut self, caller: &'static Location<'static>) -> bool {
        if let Some(first) = self.headers_sent {
            tracing::warn!(
                first = %first,
                ignored = %caller,
                "response headers were already sent; duplicate send ignored"
            );
            return false;
        }
        self.headers_sent = Some(caller);
        true
    }

    fn apply_cookies(&mut self, headers: &mut HeaderMap) {
        for cookie in self.pending_cookies.drain(..) {
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                headers.append(SET_COOKIE, value);
            }
        }
    }

    // ---- single-shot senders ----------------------------------------------

    #[track_caller]
    pub fn send_empty(
        &mut self,
        status: StatusCode,
        headers: Option<HeaderMap>,
    ) -> Result<StreamEnded, SendError> {
        let caller = Location::caller();
        if !self.begin_response(caller) {
            return Ok(StreamEnded::new());
        }
        let mut headers = headers.unwrap_or_default();
        self.apply_cookies(&mut headers);
        let channel = self.channel.as_mut().ok_or_else(Self::channel_err)?;
        channel.send_head(status, &headers, BodyFraming::Empty)?;
        channel.finish()?;
        Ok(StreamEnded::new())
    }

    /// UTF-8 string body with `Content-Length`; `HEAD` gets headers only.
    #[track_caller]
    pub fn send_string(
        &mut self,
        status: StatusCode,
        headers: HeaderMap,
        data: &str,
    ) -> Result<StreamEnded, SendError> {
        let caller = Location::caller();
        self.send_payload(caller, status, headers, data.as_bytes())
    }

    #[track_caller]
    pub fn send_buffer(
        &mut self,
        status: StatusCode,
        headers: HeaderMap,
        buf: &[u8],
    ) -> Result<StreamEnded, SendError> {
        let caller = Location::caller();
        self.send_payload(caller, status, headers, buf)
    }

    #[track_caller]
    pub fn send_simple(&mut self, status: StatusCode, text: &str) -> Result<StreamEnded, SendError> {
        let caller = Location::caller();
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        self.send_payload(caller, status, headers, text.as_bytes())
    }

    #[track_caller]
    pub fn send_json<T: Serialize>(
        &mut self,
        status: StatusCode,
        value: &T,
    ) -> Result<StreamEnded, SendError> {
        let caller = Location::caller();
        let body = serde_json::to_vec(value)
            .map_err(|e| SendError::internal(anyhow::anyhow!("serialising response: {e}")))?;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.send_payload(caller, status, headers, &body)
    }

    /// 302 with the path prefix prepended to `Location`.
    #[track_caller]
    pub fn redirect(&mut self, location: &str) -> Result<StreamEnded, SendError> {
        let caller = Location::caller();
        if !self.begin_response(caller) {
            return Ok(StreamEnded::new());
        }
        let target = if location.starts_with('/') {
            format!("{}{}", self.path_prefix, location)
        } else {
            location.to_string()
        };
        let mut headers = HeaderMap::new();
        headers.insert(
            LOCATION,
            HeaderValue::from_str(&target)
                .map_err(|_| SendError::internal(anyhow::anyhow!("invalid redirect target")))?,
        );
        self.apply_cookies(&mut headers);
        let channel = self.channel.as_mut().ok_or_else(Self::channel_err)?;
        channel.send_head(StatusCode::FOUND, &headers, BodyFraming::Empty)?;
        channel.finish()?;
        Ok(StreamEnded::new())
    }

    /// Pipe a reader to the client. Length is unknown, so the body streams
    /// (chunked on H1). On `HEAD` the source is dropped unread.
    #[track_caller]
    pub fn send_stream(
        &mut self,
        status: StatusCode,
        headers: HeaderMap,
        reader: &mut dyn Read,
    ) -> Result<StreamEnded, SendError> {
        let caller = Location::caller();
        if !self.begin_response(caller) {
            return Ok(StreamEnded::new());
        }
        let mut headers = headers;
        self.apply_cookies(&mut headers);
        let is_head = self.method == Method::HEAD;

        if is_head {
            // no body follows, so no transfer-coding either
            let channel = self.channel.as_mut().ok_or_else(Self::channel_err)?;
            channel.send_head(status, &headers, BodyFraming::Empty)?;
            channel.finish()?;
            return Ok(StreamEnded::new());
        }
        if let Some(encoder) = &self.encoder {
            encoder.before_write_head(&mut headers);
        }
        let channel = self.channel.as_mut().ok_or_else(Self::channel_err)?;
        channel.send_head(status, &headers, BodyFraming::Stream)?;

        let mut chunk = [0u8; 16 * 1024];
        loop {
            let n = reader
                .read(&mut chunk)
                .map_err(|e| SendError::internal(e.into()))?;
            if n == 0 {
                break;
            }
            self.write_body(&chunk[..n])?;
        }
        self.finish_body()?;
        Ok(StreamEnded::new())
    }

    /// Finish the response. With headers already out this just completes the
    /// framing; otherwise it sends an empty 200.
    #[track_caller]
    pub fn end(&mut self) -> Result<StreamEnded, SendError> {
        if self.headers_sent() {
            self.finish_body()?;
            return Ok(StreamEnded::new());
        }
        self.send_empty(StatusCode::OK, None)
    }

    /// Tear the stream down without completing the response.
    pub fn destroy(&mut self) {
        if let Some(channel) = &mut self.channel {
            channel.destroy();
        }
    }

    #[track_caller]
    fn send_payload(
        &mut self,
        caller: &'static Location<'static>,
        status: StatusCode,
        mut headers: HeaderMap,
        body: &[u8],
    ) -> Result<StreamEnded, SendError> {
        if !self.begin_response(caller) {
            return Ok(StreamEnded::new());
        }
        self.apply_cookies(&mut headers);
        let is_head = self.method == Method::HEAD;

        // buffered payloads compress in one shot so Content-Length stays exact
        let encoded;
        let wire: &[u8] = match self.encoder.take() {
            Some(mut encoder) if !encoder.is_identity() => {
                encoder.before_write_head(&mut headers);
                let mut out = encoder.write(body)?;
                out.extend(encoder.finish()?);
                encoded = out;
                &encoded
            }
            _ => body,
        };

        headers.remove(CONTENT_LENGTH);
        let channel = self.channel.as_mut().ok_or_else(Self::channel_err)?;
        channel.send_head(status, &headers, BodyFraming::Known(wire.len() as u64))?;
        if !is_head {
            channel.send_data(wire)?;
        }
        channel.finish()?;
        Ok(StreamEnded::new())
    }

    // ---- streaming internals (used by the file sender and SSE) ------------

    pub(crate) fn write_head_raw(
        &mut self,
        caller: &'static Location<'static>,
        status: StatusCode,
        mut headers: HeaderMap,
        framing: BodyFraming,
    ) -> Result<bool, SendError> {
        if !self.begin_response(caller) {
            return Ok(false);
        }
        self.apply_cookies(&mut headers);
        if let Some(encoder) = &self.encoder {
            encoder.before_write_head(&mut headers);
        }
        let channel = self.channel.as_mut().ok_or_else(Self::channel_err)?;
        channel.send_head(status, &headers, framing)?;
        Ok(true)
    }

    pub(crate) fn write_body(&mut self, data: &[u8]) -> Result<(), SendError> {
        let channel = self.channel.as_mut().ok_or_else(Self::channel_err)?;
        match &mut self.encoder {
            Some(encoder) => {
                let out = encoder.write(data)?;
                if !out.is_empty() {
                    channel.send_data(&out)?;
                }
            }
            None => channel.send_data(data)?,
        }
        Ok(())
    }

    pub(crate) fn finish_body(&mut self) -> Result<(), SendError> {
        let channel = self.channel.as_mut().ok_or_else(Self::channel_err)?;
        if let Some(encoder) = self.encoder.take() {
            let tail = encoder.finish()?;
            if !tail.is_empty() {
                channel.send_data(&tail)?;
            }
        }
        channel.finish()?;
        Ok(())
    }

    pub(crate) fn flush_channel(&mut self) -> Result<(), SendError> {
        let channel = self.channel.as_mut().ok_or_else(Self::channel_err)?;
        channel.flush()?;
        Ok(())
    }

    /// Move the channel out (SSE hands it to a long-lived stream).
    pub(crate) fn take_channel(&mut self) -> Option<Box<dyn HttpChannel>> {
        self.channel.take()
    }

    /// Drop any negotiated coder; the response goes out as identity.
    pub(crate) fn clear_encoder(&mut self) {
        self.encoder = None;
    }

    pub(crate) fn encoder_active(&self) -> bool {
        self.encoder
            .as_ref()
            .is_some_and(|encoder| !encoder.is_identity())
    }

    /// Reclaim the channel for connection reuse after the response finished.
    pub fn into_channel(mut self) -> Option<Box<dyn HttpChannel>> {
        self.channel.take()
    }

    // ---- cookies + early hints --------------------------------------------

    /// Queue a `Set-Cookie` header; the value is URL-encoded.
    pub fn set_cookie(&mut self, name: &str, value: &str, opts: &SetCookieOptions) {
        let mut cookie = format!("{}={}", name, percent_encode(value));
        if let Some(domain) = &opts.domain {
            cookie.push_str("; Domain=");
            cookie.push_str(domain);
        }
        if let Some(path) = &opts.path {
            cookie.push_str("; Path=");
            cookie.push_str(path);
        }
        if let Some(expires) = &opts.expires {
            cookie.push_str("; Expires=");
            cookie.push_str(expires);
        }
        if let Some(max_age) = opts.max_age {
            cookie.push_str(&format!("; Max-Age={max_age}"));
        }
        if opts.secure {
            cookie.push_str("; Secure");
        }
        if opts.http_only {
            cookie.push_str("; HttpOnly");
        }
        if let Some(same_site) = &opts.same_site {
            cookie.push_str("; SameSite=");
            cookie.push_str(same_site);
        }
        self.pending_cookies.push(cookie);
    }

    /// 103 Early Hints; expressed on HTTP/2 only, a no-op elsewhere.
    pub fn write_early_hints(&mut self, hints: &HeaderMap) -> Result<(), SendError> {
        if self.headers_sent() {
            return Ok(());
        }
        let channel = self.channel.as_mut().ok_or_else(Self::channel_err)?;
        channel.send_early_hints(hints)?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    /// Records everything the state writes through the channel.
    #[derive(Default)]
    pub(crate) struct Recorded {
        pub head: Option<(StatusCode, HeaderMap, BodyFraming)>,
        pub early_hints: Vec<HeaderMap>,
        pub body: Vec<u8>,
        pub finished: bool,
        pub destroyed: bool,
    }

    pub(crate) struct MockChannel {
        pub recorded: Arc<Mutex<Recorded>>,
        pub request_body: io::Cursor<Vec<u8>>,
        pub protocol: Protocol,
    }

    impl MockChannel {
        pub fn new(request_body: &[u8]) -> (Self, Arc<Mutex<Recorded>>) {
            let recorded = Arc::new(Mutex::new(Recorded::default()));
            (
                MockChannel {
                    recorded: Arc::clone(&recorded),
                    request_body: io::Cursor::new(request_body.to_vec()),
                    protocol: Protocol::Http1,
                },
                recorded,
            )
        }
    }

    impl HttpChannel for MockChannel {
        fn protocol(&self) -> Protocol {
            self.protocol
        }

        fn read_body(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.request_body.read(buf)
        }

        fn send_head(
            &mut self,
            status: StatusCode,
            headers: &HeaderMap,
            framing: BodyFraming,
        ) -> io::Result<()> {
            self.recorded.lock().unwrap().head = Some((status, headers.clone(), framing));
            Ok(())
        }

        fn send_data(&mut self, data: &[u8]) -> io::Result<()> {
            self.recorded.lock().unwrap().body.extend_from_slice(data);
            Ok(())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn finish(&mut self) -> io::Result<()> {
            self.recorded.lock().unwrap().finished = true;
            Ok(())
        }

        fn send_early_hints(&mut self, headers: &HeaderMap) -> io::Result<()> {
            self.recorded.lock().unwrap().early_hints.push(headers.clone());
            Ok(())
        }

        fn destroy(&mut self) {
            self.recorded.lock().unwrap().destroyed = true;
        }
    }

    pub(crate) fn state_for(
        method: Method,
        target: &str,
        body: &[u8],
    ) -> (RequestState, Arc<Mutex<Recorded>>) {
        let (channel, recorded) = MockChannel::new(body);
        let url_info = Url::parse(&format!("http://wiki.example{target}")).unwrap();
        let seed = StateSeed {
            channel: Box::new(channel),
            method,
            host: "wiki.example".to_string(),
            url: target.to_string(),
            url_info,
            path_prefix: String::new(),
            headers: HeaderMap::new(),
            body_format: BodyFormat::Ignore,
            expect_secure: false,
            max_body_bytes: crate::config::DEFAULT_MAX_BODY_BYTES,
        };
        (RequestState::new(seed), recorded)
    }

    #[test]
    fn test_send_string_sets_content_length() {
        let (mut state, recorded) = state_for(Method::GET, "/x", b"");
        state
            .send_string(StatusCode::OK, HeaderMap::new(), "hello")
            .unwrap();
        let rec = recorded.lock().unwrap();
        let (status, _, framing) = rec.head.as_ref().unwrap();
        assert_eq!(*status, StatusCode::OK);
        assert!(matches!(framing, BodyFraming::Known(5)));
        assert_eq!(rec.body, b"hello");
        assert!(rec.finished);
    }

    #[test]
    fn test_head_suppresses_body_but_keeps_length() {
        let (mut state, recorded) = state_for(Method::HEAD, "/x", b"");
        state
            .send_string(StatusCode::OK, HeaderMap::new(), "hello")
            .unwrap();
        let rec = recorded.lock().unwrap();
        assert!(matches!(
            rec.head.as_ref().unwrap().2,
            BodyFraming::Known(5)
        ));
        assert!(rec.body.is_empty());
        assert!(rec.finished);
    }

    #[test]
    fn test_second_send_is_ignored() {
        let (mut state, recorded) = state_for(Method::GET, "/x", b"");
        state.send_simple(StatusCode::OK, "one").unwrap();
        // second send: logged, ignored, still returns the sentinel
        state.send_simple(StatusCode::IM_A_TEAPOT, "two").unwrap();
        let rec = recorded.lock().unwrap();
        assert_eq!(rec.head.as_ref().unwrap().0, StatusCode::OK);
        assert_eq!(rec.body, b"one");
    }

    #[test]
    fn test_redirect_prepends_prefix() {
        let (mut state, recorded) = state_for(Method::GET, "/x", b"");
        state.path_prefix = "/wiki".to_string();
        state.redirect("/login").unwrap();
        let rec = recorded.lock().unwrap();
        let (status, headers, _) = rec.head.as_ref().unwrap();
        assert_eq!(*status, StatusCode::FOUND);
        assert_eq!(headers.get(LOCATION).unwrap(), "/wiki/login");
    }

    #[test]
    fn test_send_json_content_type() {
        let (mut state, recorded) = state_for(Method::GET, "/x", b"");
        state
            .send_json(StatusCode::OK, &serde_json::json!({"ok": true}))
            .unwrap();
        let rec = recorded.lock().unwrap();
        let (_, headers, _) = rec.head.as_ref().unwrap();
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(rec.body, br#"{"ok":true}"#);
    }

    #[test]
    fn test_set_cookie_encodes_value() {
        let (mut state, recorded) = state_for(Method::GET, "/x", b"");
        state.set_cookie(
            "session",
            "a value/with=chars",
            &SetCookieOptions {
                path: Some("/".to_string()),
                http_only: true,
                ..Default::default()
            },
        );
        state.send_empty(StatusCode::NO_CONTENT, None).unwrap();
        let rec = recorded.lock().unwrap();
        let (_, headers, _) = rec.head.as_ref().unwrap();
        let cookie = headers.get(SET_COOKIE).unwrap().to_str().unwrap();
        assert_eq!(cookie, "session=a%20value%2Fwith%3Dchars; Path=/; HttpOnly");
    }

    #[test]
    fn test_read_buffer_enforces_ceiling() {
        let (mut state, _) = state_for(Method::POST, "/x", &[0u8; 128]);
        state.max_body_bytes = 64;
        let err = state.read_buffer().unwrap_err();
        assert_eq!(err.reason, ErrorReason::PayloadTooLarge);
    }

    #[test]
    fn test_read_buffer_caches() {
        let (mut state, _) = state_for(Method::POST, "/x", b"abc");
        assert_eq!(state.read_buffer().unwrap(), b"abc");
        assert_eq!(state.read_buffer().unwrap(), b"abc");
        assert_eq!(state.data_buffer.as_deref(), Some(&b"abc"[..]));
    }

    #[test]
    fn test_compressed_payload_rewrites_headers() {
        use flate2::read::GzDecoder;

        let (mut state, recorded) = state_for(Method::GET, "/x", b"");
        state.headers.insert(
            "accept-encoding",
            HeaderValue::from_static("gzip"),
        );
        let chosen = state.enable_compression(&crate::encoding::PREFERRED_ORDER);
        assert_eq!(chosen, ContentEncoding::Gzip);
        state
            .send_string(StatusCode::OK, HeaderMap::new(), "squeeze me please")
            .unwrap();

        let rec = recorded.lock().unwrap();
        let (_, headers, framing) = rec.head.as_ref().unwrap();
        assert_eq!(headers.get("content-encoding").unwrap(), "gzip");
        match framing {
            BodyFraming::Known(n) => assert_eq!(*n, rec.body.len() as u64),
            other => panic!("expected known framing, got {other:?}"),
        }
        let mut out = String::new();
        GzDecoder::new(&rec.body[..]).read_to_string(&mut out).unwrap();
        assert_eq!(out, "squeeze me please");
    }

    #[test]
    fn test_early_hints_before_headers_only() {
        let (mut state, recorded) = state_for(Method::GET, "/x", b"");
        let mut hints = HeaderMap::new();
        hints.insert("link", HeaderValue::from_static("</style.css>; rel=preload"));
        state.write_early_hints(&hints).unwrap();
        state.send_simple(StatusCode::OK, "done").unwrap();
        // after the real head went out, further hints are dropped
        state.write_early_hints(&hints).unwrap();
        let rec = recorded.lock().unwrap();
        assert_eq!(rec.early_hints.len(), 1);
    }

    #[test]
    fn test_end_without_headers_sends_empty_200() {
        let (mut state, recorded) = state_for(Method::GET, "/x", b"");
        state.end().unwrap();
        let rec = recorded.lock().unwrap();
        let (status, _, framing) = rec.head.as_ref().unwrap();
        assert_eq!(*status, StatusCode::OK);
        assert!(matches!(framing, BodyFraming::Empty));
        assert!(rec.finished);
    }

    #[test]
    fn test_percent_decode_once() {
        assert_eq!(percent_decode("a%2Fb.txt").unwrap(), "a/b.txt");
        // decoded exactly once: %252F yields the literal %2F
        assert_eq!(percent_decode("a%252Fb").unwrap(), "a%2Fb");
        assert!(percent_decode("bad%zz").is_none());
    }

    #[test]
    fn test_cookie_multimap() {
        let mut headers = HeaderMap::new();
        headers.append("cookie", HeaderValue::from_static("a=1; b=2"));
        headers.append("cookie", HeaderValue::from_static("a=3"));
        let cookies = parse_cookies(&headers);
        assert_eq!(cookies["a"], vec!["1", "3"]);
        assert_eq!(cookies["b"], vec!["2"]);
    }
}
