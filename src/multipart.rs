//! Streaming multipart/form-data ingestion.
//!
//! Parts are surfaced in stream order through three callbacks; the next chunk
//! is not pulled off the socket until the previous callback has returned, so
//! slow consumers apply backpressure all the way down to the connection.

use http::{HeaderMap, HeaderName, HeaderValue};
use serde_json::json;

use crate::error::{ErrorReason, SendError};

/// Headers of one part, with the common `Content-Disposition` fields broken out.
#[derive(Debug, Default)]
pub struct PartHeaders {
    pub headers: HeaderMap,
    pub name: Option<String>,
    pub filename: Option<String>,
}

pub trait PartVisitor {
    fn on_part_start(&mut self, part: &PartHeaders) -> Result<(), SendError>;
    fn on_part_chunk(&mut self, chunk: &[u8]) -> Result<(), SendError>;
    fn on_part_end(&mut self) -> Result<(), SendError>;
}

/// Extract the boundary from a `Content-Type` header.
///
/// The content type must be `multipart/*` and carry a non-empty `boundary`
/// parameter; the two failure modes map to the 400 reasons the router
/// serialises for clients.
pub fn parse_boundary(content_type: Option<&str>) -> Result<String, SendError> {
    let content_type = content_type.unwrap_or("");
    let mut parts = content_type.split(';');
    let media_type = parts.next().unwrap_or("").trim().to_ascii_lowercase();
    if !media_type.starts_with("multipart/") {
        return Err(SendError::new(
            ErrorReason::MultipartInvalidContentType,
            Some(json!({ "contentType": content_type })),
        ));
    }
    for param in parts {
        let param = param.trim();
        if let Some(value) = param.strip_prefix("boundary=") {
            let value = value.trim_matches('"');
            if !value.is_empty() {
                return Ok(value.to_string());
            }
        }
    }
    Err(SendError::new(
        ErrorReason::MultipartMissingBoundary,
        Some(json!({ "contentType": content_type })),
    ))
}

fn bad_body(what: &str) -> SendError {
    SendError::bad_request(json!({ "multipart": what }))
}

enum Phase {
    Preamble,
    PartHeaders,
    PartData,
    Done,
}

/// Incremental parser over a pull-based byte source.
///
/// `read` follows the `io::Read` contract (`Ok(0)` is end of body).
pub fn read_parts<R, V>(mut read: R, boundary: &str, visitor: &mut V) -> Result<(), SendError>
where
    R: FnMut(&mut [u8]) -> std::io::Result<usize>,
    V: PartVisitor + ?Sized,
{
    let open_marker: Vec<u8> = format!("--{boundary}").into_bytes();
    let delimiter: Vec<u8> = format!("\r\n--{boundary}").into_bytes();

    let mut buf: Vec<u8> = Vec::with_capacity(16 * 1024);
    let mut eof = false;
    let mut phase = Phase::Preamble;

    let mut fill = |buf: &mut Vec<u8>, eof: &mut bool| -> Result<(), SendError> {
        let mut chunk = [0u8; 8 * 1024];
        let n = read(&mut chunk).map_err(|e| SendError::internal(e.into()))?;
        if n == 0 {
            *eof = true;
        } else {
            buf.extend_from_slice(&chunk[..n]);
        }
        Ok(())
    };

    loop {
        match phase {
            Phase::Preamble => {
                // the opening delimiter has no leading CRLF on the first line
                if let Some(at) = find(&buf, &open_marker) {
                    let after = at + open_marker.len();
                    match boundary_kind(&buf, after) {
                        BoundaryKind::NeedMore => {
                            if eof {
                                return Err(bad_body("truncated opening boundary"));
                            }
                            fill(&mut buf, &mut eof)?;
                        }
                        BoundaryKind::NotBoundary => {
                            buf.drain(..at + 1);
                        }
                        BoundaryKind::Open(skip) => {
                            buf.drain(..after + skip);
                            phase = Phase::PartHeaders;
                        }
                        BoundaryKind::Close(skip) => {
                            buf.drain(..after + skip);
                            phase = Phase::Done;
                        }
                    }
                } else if eof {
                    return Err(bad_body("missing opening boundary"));
                } else {
                    fill(&mut buf, &mut eof)?;
                }
            }
            Phase::PartHeaders => {
                if let Some(end) = find(&buf, b"\r\n\r\n") {
                    let header_bytes: Vec<u8> = buf.drain(..end + 4).collect();
                    let part = parse_part_headers(&header_bytes[..end])?;
                    visitor.on_part_start(&part)?;
                    phase = Phase::PartData;
                } else if buf.len() > 64 * 1024 {
                    return Err(bad_body("part headers too large"));
                } else if eof {
                    return Err(bad_body("truncated part headers"));
                } else {
                    fill(&mut buf, &mut eof)?;
                }
            }
            Phase::PartData => {
                if let Some(at) = find(&buf, &delimiter) {
                    let after = at + delimiter.len();
                    match boundary_kind(&buf, after) {
                        BoundaryKind::NeedMore => {
                            if eof {
                                return Err(bad_body("truncated boundary"));
                            }
                            fill(&mut buf, &mut eof)?;
                        }
                        BoundaryKind::NotBoundary => {
                            // boundary-shaped bytes inside the part body
                            visitor.on_part_chunk(&buf[..at + 1])?;
                            buf.drain(..at + 1);
                        }
                        BoundaryKind::Open(skip) => {
                            if at > 0 {
                                visitor.on_part_chunk(&buf[..at])?;
                            }
                            visitor.on_part_end()?;
                            buf.drain(..after + skip);
                            phase = Phase::PartHeaders;
                        }
                        BoundaryKind::Close(skip) => {
                            if at > 0 {
                                visitor.on_part_chunk(&buf[..at])?;
                            }
                            visitor.on_part_end()?;
                            buf.drain(..after + skip);
                            phase = Phase::Done;
                        }
                    }
                } else {
                    // hold back a potential partial delimiter at the tail
                    let hold = delimiter.len() + 3;
                    if buf.len() > hold {
                        let emit = buf.len() - hold;
                        visitor.on_part_chunk(&buf[..emit])?;
                        buf.drain(..emit);
                    }
                    if eof {
                        return Err(bad_body("truncated part data"));
                    }
                    fill(&mut buf, &mut eof)?;
                }
            }
            Phase::Done => return Ok(()),
        }
    }
}

enum BoundaryKind {
    /// `--boundary\r\n` — another part follows. Skip count covers the CRLF.
    Open(usize),
    /// `--boundary--` — final delimiter.
    Close(usize),
    NeedMore,
    /// Boundary-shaped bytes that turn out to be part data.
    NotBoundary,
}

fn boundary_kind(buf: &[u8], after: usize) -> BoundaryKind {
    let tail = &buf[after.min(buf.len())..];
    if tail.starts_with(b"--") {
        return BoundaryKind::Close(2);
    }
    if tail.starts_with(b"\r\n") {
        return BoundaryKind::Open(2);
    }
    // tolerate transport padding (spaces) before the CRLF
    let trimmed = tail.iter().take_while(|&&b| b == b' ' || b == b'\t').count();
    if tail[trimmed..].starts_with(b"\r\n") {
        return BoundaryKind::Open(trimmed + 2);
    }
    if tail.len() < trimmed + 2 {
        return BoundaryKind::NeedMore;
    }
    BoundaryKind::NotBoundary
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_part_headers(raw: &[u8]) -> Result<PartHeaders, SendError> {
    let mut part = PartHeaders::default();
    for line in raw.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        let sep = line
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| bad_body("malformed part header"))?;
        let name = HeaderName::from_bytes(&line[..sep])
            .map_err(|_| bad_body("malformed part header name"))?;
        let value_bytes = trim_spaces(&line[sep + 1..]);
        let value = HeaderValue::from_bytes(value_bytes)
            .map_err(|_| bad_body("malformed part header value"))?;
        part.headers.append(name, value);
    }
    if let Some(disposition) = part
        .headers
        .get("content-disposition")
        .and_then(|v| v.to_str().ok())
    {
        for param in disposition.split(';').skip(1) {
            let param = param.trim();
            if let Some(value) = param.strip_prefix("name=") {
                part.name = Some(value.trim_matches('"').to_string());
            } else if let Some(value) = param.strip_prefix("filename=") {
                part.filename = Some(value.trim_matches('"').to_string());
            }
        }
    }
    Ok(part)
}

fn trim_spaces(mut bytes: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = bytes {
        bytes = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = bytes {
        bytes = rest;
    }
    bytes
}
