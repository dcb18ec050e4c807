//! Static file responses: `RequestState::send_file`.
//!
//! Paths resolve strictly inside the configured root (component walk, no
//! traversal, no dotfiles). Responses honour `Range` and conditional-GET
//! headers, and the cache knobs map straight onto response headers. Missing
//! files and directories are delegated to the caller's callbacks when given.

use std::fs::{File, Metadata};
use std::io::{Read, Seek, SeekFrom};
use std::panic::Location;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use http::header::{
    ACCEPT_RANGES, CACHE_CONTROL, CONTENT_RANGE, CONTENT_TYPE, ETAG, LAST_MODIFIED,
};
use http::{HeaderMap, HeaderValue, Method, StatusCode};

use crate::error::{SendError, StreamEnded};
use crate::server::channel::BodyFraming;
use crate::state::RequestState;

pub type FileCallback =
    Box<dyn FnOnce(&mut RequestState) -> Result<StreamEnded, SendError> + Send>;

/// Options for one `send_file` call; `root` is the only required field.
pub struct SendFileOptions {
    pub root: PathBuf,
    /// Byte window into the file, before any `Range` handling.
    pub offset: u64,
    pub length: Option<u64>,
    pub accept_ranges: bool,
    /// Overrides the generated `Cache-Control` when set.
    pub cache_control: Option<String>,
    pub immutable: bool,
    pub max_age: u64,
    pub etag: bool,
    pub last_modified: bool,
    /// Extensions to try appending when the path itself is absent.
    pub extensions: Vec<String>,
    /// Index file name served for directories, only when explicitly set.
    pub index: Option<String>,
    pub on_not_found: Option<FileCallback>,
    pub on_dir: Option<FileCallback>,
}

impl SendFileOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        SendFileOptions {
            root: root.into(),
            offset: 0,
            length: None,
            accept_ranges: true,
            cache_control: None,
            immutable: false,
            max_age: 0,
            etag: true,
            last_modified: true,
            extensions: Vec::new(),
            index: None,
            on_not_found: None,
            on_dir: None,
        }
    }
}

/// Resolve a request-relative path inside `root`, or refuse it.
///
/// Rejected outright: parent components, absolute/prefixed components, and
/// dotfiles anywhere in the path.
pub fn resolve_path(root: &Path, req_path: &str) -> Option<PathBuf> {
    let clean = req_path.trim_start_matches('/');
    let mut resolved = root.to_path_buf();
    for component in Path::new(clean).components() {
        match component {
            Component::Normal(part) => {
                if part.to_str().is_some_and(|p| p.starts_with('.')) {
                    return None;
                }
                resolved.push(part);
            }
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(resolved)
}

fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
        .as_str()
    {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "application/javascript",
        "json" => "application/json",
        "txt" | "tid" => "text/plain; charset=utf-8",
        "md" => "text/markdown; charset=utf-8",
        "xml" => "application/xml",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "pdf" => "application/pdf",
        "wasm" => "application/wasm",
        "map" => "application/json",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        _ => "application/octet-stream",
    }
}

fn file_etag(meta: &Metadata) -> String {
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("\"{:x}-{:x}\"", meta.len(), mtime)
}

/// A parsed single-range `Range` header, resolved against `len`.
enum RangeOutcome {
    None,
    Satisfiable { start: u64, end: u64 },
    Unsatisfiable,
}

fn parse_range(header: Option<&str>, len: u64) -> RangeOutcome {
    let Some(header) = header else {
        return RangeOutcome::None;
    };
    let Some(spec) = header.trim().strip_prefix("bytes=") else {
        return RangeOutcome::None;
    };
    // multiple ranges are not served; fall back to the whole file
    if spec.contains(',') {
        return RangeOutcome::None;
    }
    let mut parts = spec.splitn(2, '-');
    let start_raw = parts.next().unwrap_or("").trim();
    let end_raw = parts.next().unwrap_or("").trim();

    if start_raw.is_empty() {
        // suffix form: last N bytes
        let Ok(suffix) = end_raw.parse::<u64>() else {
            return RangeOutcome::Unsatisfiable;
        };
        if suffix == 0 || len == 0 {
            return RangeOutcome::Unsatisfiable;
        }
        let start = len.saturating_sub(suffix);
        return RangeOutcome::Satisfiable {
            start,
            end: len - 1,
        };
    }

    let Ok(start) = start_raw.parse::<u64>() else {
        return RangeOutcome::Unsatisfiable;
    };
    if start >= len {
        return RangeOutcome::Unsatisfiable;
    }
    let end = if end_raw.is_empty() {
        len - 1
    } else {
        match end_raw.parse::<u64>() {
            Ok(end) => end.min(len - 1),
            Err(_) => return RangeOutcome::Unsatisfiable,
        }
    };
    if end < start {
        return RangeOutcome::Unsatisfiable;
    }
    RangeOutcome::Satisfiable { start, end }
}

impl RequestState {
    /// Serve a file from `opts.root` at `req_path`.
    ///
    /// Resolution failures go to `on_not_found` (or a plain 404); directories
    /// go to `on_dir` (or a 404 carrying `x-reason`). Successful responses
    /// honour conditional-GET and single-range requests, stream through the
    /// compression layer when one is enabled, and send headers only for HEAD.
    #[track_caller]
    pub fn send_file(
        &mut self,
        req_path: &str,
        opts: SendFileOptions,
    ) -> Result<StreamEnded, SendError> {
        let caller = Location::caller();
        let mut opts = opts;

        let Some(mut path) = resolve_path(&opts.root, req_path) else {
            return self.file_not_found(caller, opts.on_not_found.take());
        };

        let mut meta = match std::fs::metadata(&path) {
            Ok(meta) => Some(meta),
            Err(_) => {
                let mut found = None;
                for ext in &opts.extensions {
                    let candidate = PathBuf::from(format!("{}.{}", path.display(), ext));
                    if let Ok(meta) = std::fs::metadata(&candidate) {
                        found = Some((candidate, meta));
                        break;
                    }
                }
                match found {
                    Some((candidate, meta)) => {
                        path = candidate;
                        Some(meta)
                    }
                    None => None,
                }
            }
        };

        let is_dir = meta.as_ref().is_some_and(|m| m.is_dir());
        if is_dir {
            match &opts.index {
                Some(index) => {
                    path = path.join(index);
                    meta = std::fs::metadata(&path).ok();
                }
                None => {
                    if let Some(on_dir) = opts.on_dir.take() {
                        return on_dir(self);
                    }
                    let mut headers = HeaderMap::new();
                    headers.insert(
                        "x-reason",
                        HeaderValue::from_static("Directory listing not allowed"),
                    );
                    return self.send_empty(StatusCode::NOT_FOUND, Some(headers));
                }
            }
        }

        let Some(meta) = meta.filter(|m| m.is_file()) else {
            return self.file_not_found(caller, opts.on_not_found.take());
        };

        // byte window requested by the caller, before Range handling
        let window_start = opts.offset.min(meta.len());
        let window_len = opts
            .length
            .unwrap_or(meta.len() - window_start)
            .min(meta.len() - window_start);

        let etag = file_etag(&meta);
        let modified = meta.modified().ok();

        let mut cache_headers = HeaderMap::new();
        cache_headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static(content_type_for(&path)),
        );
        if opts.accept_ranges {
            cache_headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        }
        if opts.etag {
            if let Ok(value) = HeaderValue::from_str(&etag) {
                cache_headers.insert(ETAG, value);
            }
        }
        if opts.last_modified {
            if let Some(modified) = modified {
                if let Ok(value) = HeaderValue::from_str(&imf_fixdate(modified)) {
                    cache_headers.insert(LAST_MODIFIED, value);
                }
            }
        }
        let cache_control = opts.cache_control.clone().or_else(|| {
            if opts.max_age > 0 || opts.immutable {
                let mut value = format!("public, max-age={}", opts.max_age);
                if opts.immutable {
                    value.push_str(", immutable");
                }
                Some(value)
            } else {
                None
            }
        });
        if let Some(cache_control) = cache_control {
            if let Ok(value) = HeaderValue::from_str(&cache_control) {
                cache_headers.insert(CACHE_CONTROL, value);
            }
        }

        if self.is_conditional_hit(&etag, modified, &opts) {
            return self.send_empty(StatusCode::NOT_MODIFIED, Some(cache_headers));
        }

        let range = if opts.accept_ranges {
            parse_range(self.header_str("range"), window_len)
        } else {
            RangeOutcome::None
        };

        let (status, start, len) = match range {
            RangeOutcome::None => (StatusCode::OK, window_start, window_len),
            RangeOutcome::Satisfiable { start, end } => {
                let value = format!("bytes {}-{}/{}", start, end, window_len);
                if let Ok(value) = HeaderValue::from_str(&value) {
                    cache_headers.insert(CONTENT_RANGE, value);
                }
                (
                    StatusCode::PARTIAL_CONTENT,
                    window_start + start,
                    end - start + 1,
                )
            }
            RangeOutcome::Unsatisfiable => {
                let mut headers = HeaderMap::new();
                let value = format!("bytes */{window_len}");
                if let Ok(value) = HeaderValue::from_str(&value) {
                    headers.insert(CONTENT_RANGE, value);
                }
                return self.send_empty(StatusCode::RANGE_NOT_SATISFIABLE, Some(headers));
            }
        };

        // ranges and recompression do not mix; the client asked for bytes
        if matches!(status, StatusCode::PARTIAL_CONTENT) {
            self.clear_encoder();
        }

        let is_head = self.method == Method::HEAD;
        if is_head {
            // HEAD reports the identity length; recompression would hide it
            self.clear_encoder();
        }
        let framing = if self.has_encoder() {
            BodyFraming::Stream
        } else {
            BodyFraming::Known(len)
        };
        if !self.write_head_raw(caller, status, cache_headers, framing)? {
            return Ok(StreamEnded::new());
        }
        if is_head {
            self.finish_body()?;
            return Ok(StreamEnded::new());
        }

        let mut file = File::open(&path).map_err(|e| SendError::internal(e.into()))?;
        file.seek(SeekFrom::Start(start))
            .map_err(|e| SendError::internal(e.into()))?;
        let mut remaining = len;
        let mut chunk = [0u8; 64 * 1024];
        while remaining > 0 {
            let want = chunk.len().min(remaining as usize);
            let n = file
                .read(&mut chunk[..want])
                .map_err(|e| SendError::internal(e.into()))?;
            if n == 0 {
                break;
            }
            self.write_body(&chunk[..n])?;
            remaining -= n as u64;
        }
        self.finish_body()?;
        Ok(StreamEnded::new())
    }

    fn file_not_found(
        &mut self,
        _caller: &'static Location<'static>,
        on_not_found: Option<FileCallback>,
    ) -> Result<StreamEnded, SendError> {
        match on_not_found {
            Some(callback) => callback(self),
            None => self.send_empty(StatusCode::NOT_FOUND, None),
        }
    }

    fn is_conditional_hit(
        &self,
        etag: &str,
        modified: Option<SystemTime>,
        opts: &SendFileOptions,
    ) -> bool {
        if opts.etag {
            if let Some(if_none_match) = self.header_str("if-none-match") {
                return if_none_match
                    .split(',')
                    .map(str::trim)
                    .any(|candidate| candidate == etag || candidate == "*");
            }
        }
        if opts.last_modified {
            if let (Some(since), Some(modified)) = (
                self.header_str("if-modified-since").and_then(parse_http_date),
                modified,
            ) {
                // compare at whole-second resolution, as the header carries
                let modified_secs = modified
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                let since_secs = since
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                return modified_secs <= since_secs;
            }
        }
        false
    }

    fn has_encoder(&self) -> bool {
        self.encoder_active()
    }
}

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
const MONTH_NAMES: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Format a time as an IMF-fixdate (`Sun, 06 Nov 1994 08:49:37 GMT`).
pub fn imf_fixdate(time: SystemTime) -> String {
    let secs = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let days = secs.div_euclid(86_400);
    let day_secs = secs.rem_euclid(86_400);
    let (year, month, day) = civil_from_days(days);
    let weekday = (days + 4).rem_euclid(7) as usize; // 1970-01-01 was Thursday
    format!(
        "{}, {:02} {} {} {:02}:{:02}:{:02} GMT",
        DAY_NAMES[weekday],
        day,
        MONTH_NAMES[month as usize - 1],
        year,
        day_secs / 3600,
        (day_secs / 60) % 60,
        day_secs % 60,
    )
}

/// Parse an IMF-fixdate back to a time. Obsolete date forms are not accepted.
pub fn parse_http_date(raw: &str) -> Option<SystemTime> {
    // "Sun, 06 Nov 1994 08:49:37 GMT"
    let rest = raw.trim().get(5..)?;
    let mut parts = rest.split(' ');
    let day: i64 = parts.next()?.parse().ok()?;
    let month_name = parts.next()?;
    let month = MONTH_NAMES.iter().position(|m| *m == month_name)? as i64 + 1;
    let year: i64 = parts.next()?.parse().ok()?;
    let mut clock = parts.next()?.split(':');
    let hour: i64 = clock.next()?.parse().ok()?;
    let minute: i64 = clock.next()?.parse().ok()?;
    let second: i64 = clock.next()?.parse().ok()?;
    if parts.next()? != "GMT" {
        return None;
    }
    let days = days_from_civil(year, month, day);
    let secs = days * 86_400 + hour * 3600 + minute * 60 + second;
    if secs < 0 {
        return None;
    }
    Some(UNIX_EPOCH + Duration::from_secs(secs as u64))
}

// civil calendar conversion, days relative to 1970-01-01
fn civil_from_days(days: i64) -> (i64, i64, i64) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let year = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = if month <= 2 { year + 1 } else { year };
    (year, month, day)
}

fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
    let year = if month <= 2 { year - 1 } else { year };
    let era = year.div_euclid(400);
    let yoe = year - era * 400;
    let mp = if month > 2 { month - 3 } else { month + 9 };
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}
