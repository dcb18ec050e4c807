//! Process-wide event bus.
//!
//! Startup, shutdown, and the router's request hooks all flow through one
//! named-event registry. Lifecycle events (`exit`, `listen.router.init`) carry
//! no payload or a JSON value; the `request.*` family carries the mutable
//! request state so subscribers (security headers, instrumentation) can
//! inspect it or answer the request outright.
//!
//! `emit` is fire-and-forget: handler errors are logged and dropped.
//! `emit_async` runs every handler serially and aggregates their errors into a
//! single composite that is logged once; a handler that reports
//! `Flow::Done` short-circuits the remaining handlers, which is how a
//! middleware subscriber takes over a request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use serde_json::Value;

use crate::error::StreamEnded;
use crate::state::RequestState;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventName {
    Exit,
    ListenRouterInit,
    RequestMiddleware,
    RequestStreamer,
    RequestState,
    RequestHandle,
    RequestFallback,
    /// User-extendable `mws.*` family.
    Custom(String),
}

impl EventName {
    pub fn custom(name: impl Into<String>) -> Self {
        EventName::Custom(name.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventName::Exit => "exit",
            EventName::ListenRouterInit => "listen.router.init",
            EventName::RequestMiddleware => "request.middleware",
            EventName::RequestStreamer => "request.streamer",
            EventName::RequestState => "request.state",
            EventName::RequestHandle => "request.handle",
            EventName::RequestFallback => "request.fallback",
            EventName::Custom(name) => name,
        }
    }
}

/// Payload union; each event name contributes its shape at the call site.
pub enum EventPayload<'a> {
    None,
    Value(&'a Value),
    Request(&'a mut RequestState),
}

/// What a handler did with the event.
pub enum Flow {
    Continue,
    /// The handler finalised the response; stop invoking further handlers.
    Done(StreamEnded),
}

pub type EventHandler =
    Arc<dyn for<'a> Fn(&mut EventPayload<'a>) -> anyhow::Result<Flow> + Send + Sync>;

/// Subscription token returned by [`EventBus::on`]; pass to [`EventBus::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookId(u64);

pub struct EmitOutcome {
    pub done: Option<StreamEnded>,
    pub errors: Vec<anyhow::Error>,
}

#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<EventName, Vec<(HookId, EventHandler)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus::default()
    }

    pub fn on<F>(&self, name: EventName, handler: F) -> HookId
    where
        F: for<'a> Fn(&mut EventPayload<'a>) -> anyhow::Result<Flow> + Send + Sync + 'static,
    {
        let id = HookId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut map = self.handlers.write().unwrap();
        map.entry(name).or_default().push((id, Arc::new(handler)));
        id
    }

    pub fn off(&self, name: &EventName, id: HookId) -> bool {
        let mut map = self.handlers.write().unwrap();
        if let Some(list) = map.get_mut(name) {
            let before = list.len();
            list.retain(|(hid, _)| *hid != id);
            return list.len() != before;
        }
        false
    }

    fn snapshot(&self, name: &EventName) -> Vec<EventHandler> {
        let map = self.handlers.read().unwrap();
        map.get(name)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    /// Fire-and-forget emission. Handler errors are logged and discarded;
    /// `Flow::Done` is ignored because nobody is waiting on the outcome.
    pub fn emit(&self, name: &EventName, payload: &mut EventPayload<'_>) {
        for handler in self.snapshot(name) {
            if let Err(err) = handler(payload) {
                tracing::error!(event = name.as_str(), error = %err, "event handler failed");
            }
        }
    }

    /// Serial emission. Every handler runs (unless one takes over the
    /// response); errors are collected into one composite log line and
    /// returned so callers that care can rethrow.
    pub fn emit_async(&self, name: &EventName, payload: &mut EventPayload<'_>) -> EmitOutcome {
        let mut outcome = EmitOutcome {
            done: None,
            errors: Vec::new(),
        };
        for handler in self.snapshot(name) {
            match handler(payload) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Done(ended)) => {
                    outcome.done = Some(ended);
                    break;
                }
                Err(err) => outcome.errors.push(err),
            }
        }
        if !outcome.errors.is_empty() {
            let rendered: Vec<String> = outcome.errors.iter().map(|e| format!("{e:#}")).collect();
            tracing::error!(
                event = name.as_str(),
                count = outcome.errors.len(),
                errors = ?rendered,
                "event handlers failed"
            );
        }
        outcome
    }
}

static BUS: Lazy<EventBus> = Lazy::new(EventBus::new);

/// The process-scoped bus. Torn down implicitly at process exit; the `exit`
/// event is the explicit teardown signal for subscribers holding resources.
pub fn bus() -> &'static EventBus {
    &BUS
}
