//! Server-Sent Events.
//!
//! `send_sse` writes the event-stream head and hands back a shareable handle;
//! the request itself is finished as far as the router is concerned, while
//! the handle keeps the connection open for as long as events flow. Handles
//! subscribe to the `exit` event and close during graceful shutdown.

use std::panic::Location;
use std::sync::{Arc, Mutex, Weak};

use http::header::{CACHE_CONTROL, CONNECTION, CONTENT_ENCODING, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, StatusCode};
use serde_json::Value;

use crate::error::{ErrorReason, SendError, StreamEnded};
use crate::events::{bus, EventName, Flow, HookId};
use crate::server::channel::{BodyFraming, HttpChannel};
use crate::state::RequestState;

struct SseInner {
    channel: Option<Box<dyn HttpChannel>>,
    retry: Option<u64>,
    closed: bool,
    on_close: Vec<Box<dyn FnOnce() + Send>>,
}

/// Producer handle for one open event stream. Clone freely; all clones write
/// to the same connection in emission order.
#[derive(Clone)]
pub struct SseHandle {
    inner: Arc<Mutex<SseInner>>,
    exit_hook: Arc<Mutex<Option<HookId>>>,
}

fn closed_err() -> SendError {
    SendError::new(ErrorReason::StreamClosed, None)
}

fn field_err(field: &str) -> SendError {
    SendError::internal(anyhow::anyhow!("SSE {field} must not contain line breaks"))
}

impl SseHandle {
    /// One event frame; `data` is JSON-stringified. Returns an error once the
    /// stream is closed or the client is gone.
    pub fn emit_event(&self, name: &str, data: &Value, id: Option<&str>) -> Result<(), SendError> {
        if name.contains('\n') || name.contains('\r') {
            return Err(field_err("event name"));
        }
        if id.is_some_and(|id| id.contains('\n') || id.contains('\r')) {
            return Err(field_err("event id"));
        }
        let mut frame = String::new();
        if !name.is_empty() {
            frame.push_str("event: ");
            frame.push_str(name);
            frame.push('\n');
        }
        frame.push_str("data: ");
        frame.push_str(&data.to_string());
        frame.push('\n');
        if let Some(id) = id {
            frame.push_str("id: ");
            frame.push_str(id);
            frame.push('\n');
        }
        let retry = self.inner.lock().unwrap().retry;
        if let Some(retry) = retry {
            frame.push_str(&format!("retry: {retry}\n"));
        }
        frame.push('\n');
        self.write(frame.as_bytes())
    }

    pub fn emit_comment(&self, text: &str) -> Result<(), SendError> {
        if text.contains('\n') || text.contains('\r') {
            return Err(field_err("comment"));
        }
        self.write(format!(": {text}\n\n").as_bytes())
    }

    fn write(&self, frame: &[u8]) -> Result<(), SendError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(closed_err());
        }
        let channel = inner.channel.as_mut().ok_or_else(closed_err)?;
        let wrote = channel.send_data(frame).and_then(|()| channel.flush());
        drop(inner);
        if let Err(err) = wrote {
            tracing::debug!(error = %err, "SSE client went away");
            self.close();
            return Err(closed_err());
        }
        Ok(())
    }

    /// Register a callback for when the stream closes (client disconnect,
    /// explicit close, or shutdown).
    pub fn on_close(&self, callback: impl FnOnce() + Send + 'static) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            drop(inner);
            callback();
            return;
        }
        inner.on_close.push(Box::new(callback));
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Finish the stream: complete the response framing and run the close
    /// callbacks. Idempotent.
    pub fn close(&self) {
        let callbacks = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return;
            }
            inner.closed = true;
            if let Some(mut channel) = inner.channel.take() {
                let _ = channel.finish();
            }
            std::mem::take(&mut inner.on_close)
        };
        if let Some(hook) = self.exit_hook.lock().unwrap().take() {
            bus().off(&EventName::Exit, hook);
        }
        for callback in callbacks {
            callback();
        }
    }
}

impl RequestState {
    /// Open a Server-Sent Events stream.
    ///
    /// Writes the event-stream header set and preamble comment, then returns
    /// the handle together with the stream-ended proof — the router is done
    /// with this request while the handle lives on. `retry`, when set, is a
    /// reconnect delay in milliseconds appended to every event.
    #[track_caller]
    pub fn send_sse(&mut self, retry: Option<u64>) -> Result<(SseHandle, StreamEnded), SendError> {
        let caller = Location::caller();

        // SSE frames must reach the client as written
        self.clear_encoder();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        headers.insert(
            CACHE_CONTROL,
            HeaderValue::from_static("no-cache, max-age=0"),
        );
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("identity"));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert("x-accel-buffering", HeaderValue::from_static("no"));

        if !self.write_head_raw(caller, StatusCode::OK, headers, BodyFraming::Stream)? {
            return Err(SendError::internal(anyhow::anyhow!(
                "send_sse after headers were already sent"
            )));
        }
        self.write_body(b": stream open\n\n")?;
        self.flush_channel()?;

        let channel = self.take_channel().ok_or_else(closed_err)?;
        let inner = Arc::new(Mutex::new(SseInner {
            channel: Some(channel),
            retry,
            closed: false,
            on_close: Vec::new(),
        }));
        let handle = SseHandle {
            inner: Arc::clone(&inner),
            exit_hook: Arc::new(Mutex::new(None)),
        };

        // close on graceful shutdown; the weak ref lets dead streams drop
        let weak: Weak<Mutex<SseInner>> = Arc::downgrade(&inner);
        let exit_handle = handle.clone();
        let hook = bus().on(EventName::Exit, move |_: &mut crate::events::EventPayload<'_>| {
            if weak.upgrade().is_some() {
                exit_handle.close();
            }
            Ok(Flow::Continue)
        });
        *handle.exit_hook.lock().unwrap() = Some(hook);

        Ok((handle, StreamEnded::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::state_for;
    use http::Method;
    use serde_json::json;

    #[test]
    fn test_sse_headers_and_preamble() {
        let (mut state, recorded) = state_for(Method::GET, "/events", b"");
        let (handle, _ended) = state.send_sse(None).unwrap();

        {
            let rec = recorded.lock().unwrap();
            let (status, headers, framing) = rec.head.as_ref().unwrap();
            assert_eq!(*status, StatusCode::OK);
            assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "text/event-stream");
            assert_eq!(headers.get(CACHE_CONTROL).unwrap(), "no-cache, max-age=0");
            assert_eq!(headers.get(CONTENT_ENCODING).unwrap(), "identity");
            assert_eq!(headers.get("x-accel-buffering").unwrap(), "no");
            assert!(matches!(framing, BodyFraming::Stream));
            assert_eq!(rec.body, b": stream open\n\n");
        }
        handle.close();
    }

    #[test]
    fn test_three_events_in_order_then_fin() {
        let (mut state, recorded) = state_for(Method::GET, "/events", b"");
        let (handle, _ended) = state.send_sse(None).unwrap();
        for i in 1..=3 {
            handle
                .emit_event("change", &json!({ "seq": i }), Some(&i.to_string()))
                .unwrap();
        }
        handle.close();

        let rec = recorded.lock().unwrap();
        let text = String::from_utf8(rec.body.clone()).unwrap();
        let frames: Vec<&str> = text.split("\n\n").filter(|f| !f.is_empty()).collect();
        // preamble + three events
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[1], "event: change\ndata: {\"seq\":1}\nid: 1");
        assert_eq!(frames[3], "event: change\ndata: {\"seq\":3}\nid: 3");
        assert!(rec.finished, "close must complete the response framing");
    }

    #[test]
    fn test_retry_appended_to_every_event() {
        let (mut state, recorded) = state_for(Method::GET, "/events", b"");
        let (handle, _ended) = state.send_sse(Some(1500)).unwrap();
        handle.emit_event("a", &json!(1), None).unwrap();
        handle.emit_event("b", &json!(2), None).unwrap();
        handle.close();

        let rec = recorded.lock().unwrap();
        let text = String::from_utf8(rec.body.clone()).unwrap();
        assert_eq!(text.matches("retry: 1500\n").count(), 2);
    }

    #[test]
    fn test_write_after_close_fails() {
        let (mut state, _) = state_for(Method::GET, "/events", b"");
        let (handle, _ended) = state.send_sse(None).unwrap();
        handle.close();
        let err = handle.emit_event("x", &json!(null), None).unwrap_err();
        assert_eq!(err.reason, ErrorReason::StreamClosed);
    }

    #[test]
    fn test_field_validation() {
        let (mut state, _) = state_for(Method::GET, "/events", b"");
        let (handle, _ended) = state.send_sse(None).unwrap();
        assert!(handle.emit_event("bad\nname", &json!(1), None).is_err());
        assert!(handle.emit_event("ok", &json!(1), Some("bad\nid")).is_err());
        assert!(handle.emit_comment("bad\ncomment").is_err());
        handle.close();
    }

    #[test]
    fn test_on_close_runs_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let calls = Arc::new(AtomicUsize::new(0));

        let (mut state, _) = state_for(Method::GET, "/events", b"");
        let (handle, _ended) = state.send_sse(None).unwrap();
        let calls2 = Arc::clone(&calls);
        handle.on_close(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
        });
        handle.close();
        handle.close();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // registering on an already-closed stream fires immediately
        let calls3 = Arc::clone(&calls);
        handle.on_close(move || {
            calls3.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
