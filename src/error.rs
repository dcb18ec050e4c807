use http::StatusCode;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use serde_json::Value;

/// Proof that a response stream has been finalised.
///
/// Only the sender methods on `RequestState` (and the SSE/file paths built on
/// them) construct this value. A handler completes a request by returning
/// `HandlerOutcome::Done(StreamEnded)`; the router treats anything else as
/// "keep going".
#[derive(Debug)]
pub struct StreamEnded {
    _priv: (),
}

impl StreamEnded {
    pub(crate) fn new() -> Self {
        StreamEnded { _priv: () }
    }
}

/// What a route handler did with the request.
#[derive(Debug)]
pub enum HandlerOutcome {
    /// Pass control to the next handler on the matched path.
    Next,
    /// The response stream is finished; stop traversal.
    Done(StreamEnded),
}

impl From<StreamEnded> for HandlerOutcome {
    fn from(ended: StreamEnded) -> Self {
        HandlerOutcome::Done(ended)
    }
}

pub type HandlerResult = Result<HandlerOutcome, SendError>;

/// Reason codes surfaced to clients in the serialised error body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorReason {
    BadRequest,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    PayloadTooLarge,
    RangeNotSatisfiable,
    MultipartInvalidContentType,
    MultipartMissingBoundary,
    RecipeNotFound,
    BagNotFound,
    StreamClosed,
    RequestDropped,
    InternalServerError,
}

impl ErrorReason {
    pub fn default_status(self) -> StatusCode {
        match self {
            ErrorReason::BadRequest => StatusCode::BAD_REQUEST,
            ErrorReason::Forbidden => StatusCode::FORBIDDEN,
            ErrorReason::NotFound => StatusCode::NOT_FOUND,
            ErrorReason::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ErrorReason::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorReason::RangeNotSatisfiable => StatusCode::RANGE_NOT_SATISFIABLE,
            ErrorReason::MultipartInvalidContentType => StatusCode::BAD_REQUEST,
            ErrorReason::MultipartMissingBoundary => StatusCode::BAD_REQUEST,
            ErrorReason::RecipeNotFound => StatusCode::NOT_FOUND,
            ErrorReason::BagNotFound => StatusCode::NOT_FOUND,
            ErrorReason::StreamClosed => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorReason::RequestDropped => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorReason::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Structured, client-facing error: `{reason, status, details}`.
///
/// Handlers return this to surface client errors; any other failure is wrapped
/// as `INTERNAL_SERVER_ERROR` at the router boundary. The router renders the
/// serialised form unless headers are already on the wire, in which case the
/// error is only logged.
#[derive(Debug)]
pub struct SendError {
    pub reason: ErrorReason,
    pub status: StatusCode,
    pub details: Option<Value>,
    source: Option<anyhow::Error>,
}

impl SendError {
    pub fn new(reason: ErrorReason, details: Option<Value>) -> Self {
        SendError {
            reason,
            status: reason.default_status(),
            details,
            source: None,
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn bad_request(details: Value) -> Self {
        SendError::new(ErrorReason::BadRequest, Some(details))
    }

    pub fn not_found() -> Self {
        SendError::new(ErrorReason::NotFound, None)
    }

    pub fn internal(err: anyhow::Error) -> Self {
        SendError {
            reason: ErrorReason::InternalServerError,
            status: StatusCode::INTERNAL_SERVER_ERROR,
            details: None,
            source: Some(err),
        }
    }

    /// The wrapped internal error chain, when this is a 500 produced from one.
    pub fn source_chain(&self) -> Option<&anyhow::Error> {
        self.source.as_ref()
    }

    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "reason": self.reason,
            "status": self.status.as_u16(),
            "details": self.details,
        })
    }
}

impl Serialize for SendError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("SendError", 3)?;
        s.serialize_field("reason", &self.reason)?;
        s.serialize_field("status", &self.status.as_u16())?;
        s.serialize_field("details", &self.details)?;
        s.end()
    }
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({})", self.reason, self.status.as_u16())?;
        if let Some(details) = &self.details {
            write!(f, ": {details}")?;
        }
        Ok(())
    }
}

impl std::error::Error for SendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_deref().map(|e| e as _)
    }
}

impl From<anyhow::Error> for SendError {
    fn from(err: anyhow::Error) -> Self {
        SendError::internal(err)
    }
}

impl From<std::io::Error> for SendError {
    fn from(err: std::io::Error) -> Self {
        SendError::internal(err.into())
    }
}
