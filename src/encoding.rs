//! Content-encoding negotiation and the outgoing compression wrap.
//!
//! The engine negotiates between the client's `Accept-Encoding` and a
//! per-response whitelist, then wraps the response byte stream in the chosen
//! coder. `split` finalises the current encoded member and opens a fresh one
//! mid-stream, which chunked log/export endpoints use to emit independently
//! decodable segments.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH};
use http::HeaderMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Identity,
    Gzip,
    Deflate,
    Brotli,
}

impl ContentEncoding {
    pub fn token(self) -> &'static str {
        match self {
            ContentEncoding::Identity => "identity",
            ContentEncoding::Gzip => "gzip",
            ContentEncoding::Deflate => "deflate",
            ContentEncoding::Brotli => "br",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "identity" => Some(ContentEncoding::Identity),
            "gzip" | "x-gzip" => Some(ContentEncoding::Gzip),
            "deflate" => Some(ContentEncoding::Deflate),
            "br" => Some(ContentEncoding::Brotli),
            _ => None,
        }
    }
}

/// Server preference, most preferred first.
pub const PREFERRED_ORDER: [ContentEncoding; 4] = [
    ContentEncoding::Brotli,
    ContentEncoding::Gzip,
    ContentEncoding::Deflate,
    ContentEncoding::Identity,
];

/// Parse an `Accept-Encoding` header value into `(token, q)` pairs.
/// Malformed q-values count as 1.0, matching what the parser is lenient about.
pub fn parse_accept_encoding(header: &str) -> Vec<(String, f32)> {
    header
        .split(',')
        .filter_map(|entry| {
            let mut parts = entry.trim().split(';');
            let token = parts.next()?.trim().to_ascii_lowercase();
            if token.is_empty() {
                return None;
            }
            let mut q = 1.0f32;
            for param in parts {
                let param = param.trim();
                if let Some(val) = param.strip_prefix("q=") {
                    q = val.trim().parse().unwrap_or(1.0);
                }
            }
            Some((token, q))
        })
        .collect()
}

/// Negotiate the response encoding.
///
/// Zero-q entries are dropped, the remainder is intersected with the
/// whitelist, and the first server-preferred survivor wins. `identity` is the
/// fallback whenever nothing else is acceptable, even when the client marked
/// it `q=0` (there is no legal way to send nothing at all).
pub fn negotiate(header: Option<&str>, allow: &[ContentEncoding]) -> ContentEncoding {
    let header = match header {
        Some(h) => h,
        None => return ContentEncoding::Identity,
    };
    let entries = parse_accept_encoding(header);
    let mut wildcard_q: Option<f32> = None;
    let mut named: Vec<(ContentEncoding, f32)> = Vec::new();
    for (token, q) in &entries {
        if token == "*" {
            wildcard_q = Some(*q);
        } else if let Some(enc) = ContentEncoding::from_token(token) {
            named.push((enc, *q));
        }
    }

    let acceptable = |enc: ContentEncoding| -> bool {
        if let Some((_, q)) = named.iter().find(|(e, _)| *e == enc) {
            return *q > 0.0;
        }
        match wildcard_q {
            Some(q) => q > 0.0,
            // unnamed, no wildcard: only identity is implicitly acceptable
            None => enc == ContentEncoding::Identity,
        }
    };

    for enc in PREFERRED_ORDER {
        if enc == ContentEncoding::Identity {
            continue;
        }
        if allow.contains(&enc) && acceptable(enc) {
            return enc;
        }
    }
    ContentEncoding::Identity
}

/// Shared byte sink for coders that only finalise on drop.
#[derive(Clone, Default)]
struct SharedSink(Arc<Mutex<Vec<u8>>>);

impl SharedSink {
    fn drain(&self) -> Vec<u8> {
        std::mem::take(&mut self.0.lock().unwrap())
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum Coder {
    Identity,
    Gzip(GzEncoder<Vec<u8>>),
    Deflate(ZlibEncoder<Vec<u8>>),
    Brotli {
        writer: Box<brotli::CompressorWriter<SharedSink>>,
        sink: SharedSink,
    },
}

impl Coder {
    fn new(encoding: ContentEncoding) -> Self {
        match encoding {
            ContentEncoding::Identity => Coder::Identity,
            ContentEncoding::Gzip => Coder::Gzip(GzEncoder::new(Vec::new(), Compression::default())),
            ContentEncoding::Deflate => {
                Coder::Deflate(ZlibEncoder::new(Vec::new(), Compression::default()))
            }
            ContentEncoding::Brotli => {
                let sink = SharedSink::default();
                let writer = Box::new(brotli::CompressorWriter::new(sink.clone(), 4096, 5, 22));
                Coder::Brotli { writer, sink }
            }
        }
    }
}

/// Incremental encoder for one response stream.
///
/// `write`/`flush` hand back whatever encoded bytes are ready; `finish`
/// consumes the encoder and returns the terminal bytes of the stream.
pub struct BodyEncoder {
    encoding: ContentEncoding,
    coder: Coder,
}

impl BodyEncoder {
    pub fn new(encoding: ContentEncoding) -> Self {
        BodyEncoder {
            encoding,
            coder: Coder::new(encoding),
        }
    }

    pub fn encoding(&self) -> ContentEncoding {
        self.encoding
    }

    pub fn is_identity(&self) -> bool {
        self.encoding == ContentEncoding::Identity
    }

    /// Header fixups applied before the head goes on the wire: declare the
    /// negotiated coding and drop any `Content-Length` that described the
    /// uncompressed body.
    pub fn before_write_head(&self, headers: &mut HeaderMap) {
        if self.is_identity() {
            return;
        }
        headers.insert(
            CONTENT_ENCODING,
            http::HeaderValue::from_static(self.encoding.token()),
        );
        headers.remove(CONTENT_LENGTH);
    }

    pub fn write(&mut self, data: &[u8]) -> io::Result<Vec<u8>> {
        match &mut self.coder {
            Coder::Identity => Ok(data.to_vec()),
            Coder::Gzip(enc) => {
                enc.write_all(data)?;
                Ok(std::mem::take(enc.get_mut()))
            }
            Coder::Deflate(enc) => {
                enc.write_all(data)?;
                Ok(std::mem::take(enc.get_mut()))
            }
            Coder::Brotli { writer, sink } => {
                writer.write_all(data)?;
                Ok(sink.drain())
            }
        }
    }

    /// Force out a decodable boundary for whatever has been written so far.
    pub fn flush(&mut self) -> io::Result<Vec<u8>> {
        match &mut self.coder {
            Coder::Identity => Ok(Vec::new()),
            Coder::Gzip(enc) => {
                enc.flush()?;
                Ok(std::mem::take(enc.get_mut()))
            }
            Coder::Deflate(enc) => {
                enc.flush()?;
                Ok(std::mem::take(enc.get_mut()))
            }
            Coder::Brotli { writer, sink } => {
                writer.flush()?;
                Ok(sink.drain())
            }
        }
    }

    /// Finalise the stream, returning its terminal bytes.
    pub fn finish(self) -> io::Result<Vec<u8>> {
        Self::finish_coder(self.coder)
    }

    /// Finalise the current encoded member and open a new one of the same
    /// coding. Returns the tail bytes of the finished member; subsequent
    /// writes start an independently decodable stream.
    pub fn split(&mut self) -> io::Result<Vec<u8>> {
        let old = std::mem::replace(&mut self.coder, Coder::new(self.encoding));
        Self::finish_coder(old)
    }

    fn finish_coder(coder: Coder) -> io::Result<Vec<u8>> {
        match coder {
            Coder::Identity => Ok(Vec::new()),
            Coder::Gzip(enc) => enc.finish(),
            Coder::Deflate(enc) => enc.finish(),
            Coder::Brotli { writer, sink } => {
                // the brotli writer emits its terminal block on drop
                drop(writer);
                Ok(sink.drain())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_negotiate_prefers_gzip_when_identity_refused() {
        let enc = negotiate(Some("identity;q=0, gzip"), &PREFERRED_ORDER);
        assert_eq!(enc, ContentEncoding::Gzip);
    }

    #[test]
    fn test_negotiate_respects_whitelist() {
        let enc = negotiate(
            Some("gzip, br"),
            &[ContentEncoding::Identity, ContentEncoding::Deflate],
        );
        assert_eq!(enc, ContentEncoding::Identity);
    }

    #[test]
    fn test_negotiate_drops_zero_q() {
        let enc = negotiate(Some("gzip;q=0, deflate"), &PREFERRED_ORDER);
        assert_eq!(enc, ContentEncoding::Deflate);
    }

    #[test]
    fn test_negotiate_server_order_wins() {
        // client lists gzip first but the server prefers brotli
        let enc = negotiate(Some("gzip, br"), &PREFERRED_ORDER);
        assert_eq!(enc, ContentEncoding::Brotli);
    }

    #[test]
    fn test_negotiate_no_header_is_identity() {
        assert_eq!(negotiate(None, &PREFERRED_ORDER), ContentEncoding::Identity);
    }

    #[test]
    fn test_gzip_roundtrip() {
        let mut enc = BodyEncoder::new(ContentEncoding::Gzip);
        let mut wire = enc.write(b"hello ").unwrap();
        wire.extend(enc.write(b"world").unwrap());
        wire.extend(enc.finish().unwrap());

        let mut out = String::new();
        flate2::read::GzDecoder::new(&wire[..])
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn test_split_yields_two_gzip_members() {
        let mut enc = BodyEncoder::new(ContentEncoding::Gzip);
        let mut wire = enc.write(b"first").unwrap();
        wire.extend(enc.split().unwrap());
        wire.extend(enc.write(b"second").unwrap());
        wire.extend(enc.finish().unwrap());

        // MultiGzDecoder concatenates the members back together
        let mut out = String::new();
        flate2::read::MultiGzDecoder::new(&wire[..])
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "firstsecond");
    }

    #[test]
    fn test_brotli_roundtrip() {
        let mut enc = BodyEncoder::new(ContentEncoding::Brotli);
        let mut wire = enc.write(b"compress me").unwrap();
        wire.extend(enc.finish().unwrap());

        let mut out = Vec::new();
        brotli::Decompressor::new(&wire[..], 4096)
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, b"compress me");
    }

    #[test]
    fn test_before_write_head_fixups() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, http::HeaderValue::from_static("42"));
        let enc = BodyEncoder::new(ContentEncoding::Gzip);
        enc.before_write_head(&mut headers);
        assert_eq!(headers.get(CONTENT_ENCODING).unwrap(), "gzip");
        assert!(headers.get(CONTENT_LENGTH).is_none());

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, http::HeaderValue::from_static("42"));
        let enc = BodyEncoder::new(ContentEncoding::Identity);
        enc.before_write_head(&mut headers);
        assert!(headers.get(CONTENT_ENCODING).is_none());
        assert_eq!(headers.get(CONTENT_LENGTH).unwrap(), "42");
    }
}
