//! Route tree and request dispatch.
//!
//! A single root node owns the tree. Matching is a depth-first walk over the
//! raw (still percent-encoded) path: literals bind tighter than regexes with
//! captures, which bind tighter than open regexes; siblings in the same class
//! keep registration order. Captures merge innermost-wins and are decoded
//! exactly once. Dispatch then runs the phases in order: parse, middleware
//! hook, match, body preparation, security checks, handlers, recovery,
//! fallback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use http::{HeaderMap, HeaderValue, Method, StatusCode};
use regex::Regex;
use serde_json::{json, Value};
use url::Url;

use crate::error::{ErrorReason, HandlerOutcome, HandlerResult, SendError, StreamEnded};
use crate::events::{bus, EventName, EventPayload};
use crate::server::channel::{BodyFraming, HttpChannel, RequestHead};
use crate::state::{percent_decode, BodyFormat, RequestState, StateSeed};

/// In-flight request count, read by graceful shutdown.
pub static ACTIVE_REQUESTS: AtomicUsize = AtomicUsize::new(0);

struct RequestGuard;

impl RequestGuard {
    fn new() -> Self {
        ACTIVE_REQUESTS.fetch_add(1, Ordering::SeqCst);
        RequestGuard
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        ACTIVE_REQUESTS.fetch_sub(1, Ordering::SeqCst);
    }
}

/// How a node consumes the remaining path.
pub enum PathMatcher {
    /// Matches everything, consumes nothing. Only the engine's root uses it.
    Root,
    /// Exact segment prefix; terminates only when fully consumed.
    Literal(String),
    /// Anchored regex; terminates only when it consumes the whole remainder.
    Regex(Regex),
    /// Anchored regex that may terminate with a remainder (mount points).
    Prefix(Regex),
}

impl PathMatcher {
    /// literal < regex-with-captures < open regex, for sibling ordering
    fn specificity(&self) -> u8 {
        match self {
            PathMatcher::Literal(_) => 0,
            PathMatcher::Regex(re) | PathMatcher::Prefix(re) => {
                if re.capture_names().flatten().next().is_some() {
                    1
                } else {
                    2
                }
            }
            PathMatcher::Root => 3,
        }
    }

    fn describe(&self) -> String {
        match self {
            PathMatcher::Root => String::new(),
            PathMatcher::Literal(lit) => lit.clone(),
            PathMatcher::Regex(re) | PathMatcher::Prefix(re) => re.as_str().to_string(),
        }
    }
}

/// Declarative per-route security checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityCheck {
    /// `X-Requested-With` must equal one of the registered tokens (CSRF).
    RequestedWithHeader,
}

pub type RouteHandler = Arc<dyn Fn(&mut RequestState) -> HandlerResult + Send + Sync>;
pub type RecoveryHandler =
    Arc<dyn Fn(&mut RequestState, &SendError) -> Result<StreamEnded, SendError> + Send + Sync>;

pub struct RouteNode {
    matcher: PathMatcher,
    methods: Option<Vec<Method>>,
    body_formats: Option<Vec<BodyFormat>>,
    deny_final: bool,
    security: Vec<SecurityCheck>,
    handlers: Vec<RouteHandler>,
    recovery: Option<RecoveryHandler>,
    children: Vec<RouteNode>,
}

impl RouteNode {
    fn with_matcher(matcher: PathMatcher) -> Self {
        RouteNode {
            matcher,
            methods: None,
            body_formats: None,
            deny_final: false,
            security: Vec::new(),
            handlers: Vec::new(),
            recovery: None,
            children: Vec::new(),
        }
    }

    pub(crate) fn root() -> Self {
        RouteNode::with_matcher(PathMatcher::Root)
    }

    pub fn literal(path: impl Into<String>) -> Self {
        RouteNode::with_matcher(PathMatcher::Literal(path.into()))
    }

    /// Anchored regex matcher; a leading `^` is added when missing.
    pub fn regex(pattern: &str) -> anyhow::Result<Self> {
        Ok(RouteNode::with_matcher(PathMatcher::Regex(anchored(
            pattern,
        )?)))
    }

    /// Regex matcher that may leave a remainder for its children/handlers.
    pub fn prefix_regex(pattern: &str) -> anyhow::Result<Self> {
        Ok(RouteNode::with_matcher(PathMatcher::Prefix(anchored(
            pattern,
        )?)))
    }

    pub fn methods(mut self, methods: &[Method]) -> Self {
        self.methods = Some(methods.to_vec());
        self
    }

    pub fn body_format(self, format: BodyFormat) -> Self {
        self.body_formats_allowed(&[format])
    }

    pub fn body_formats_allowed(mut self, formats: &[BodyFormat]) -> Self {
        self.body_formats = Some(formats.to_vec());
        self
    }

    /// The node may contribute captures but never terminate a match.
    pub fn deny_final(mut self) -> Self {
        self.deny_final = true;
        self
    }

    pub fn security(mut self, check: SecurityCheck) -> Self {
        self.security.push(check);
        self
    }

    pub fn handler(
        mut self,
        handler: impl Fn(&mut RequestState) -> HandlerResult + Send + Sync + 'static,
    ) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn recovery(
        mut self,
        recovery: impl Fn(&mut RequestState, &SendError) -> Result<StreamEnded, SendError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.recovery = Some(Arc::new(recovery));
        self
    }

    pub fn child(mut self, node: RouteNode) -> Self {
        self.children.push(node);
        self
    }

    /// Attach a child after construction; returns it for further nesting.
    pub fn mount(&mut self, node: RouteNode) -> &mut RouteNode {
        self.children.push(node);
        self.children.last_mut().expect("just pushed")
    }

    /// (consumed bytes, ok) against the remaining path.
    fn match_path<'p>(&self, remaining: &'p str) -> Option<(usize, Vec<(String, String)>)> {
        match &self.matcher {
            PathMatcher::Root => Some((0, Vec::new())),
            PathMatcher::Literal(lit) => {
                if !remaining.starts_with(lit.as_str()) {
                    return None;
                }
                let rest = &remaining[lit.len()..];
                if rest.is_empty() || rest.starts_with('/') {
                    Some((lit.len(), Vec::new()))
                } else {
                    None
                }
            }
            PathMatcher::Regex(re) | PathMatcher::Prefix(re) => {
                let caps = re.captures(remaining)?;
                let whole = caps.get(0)?;
                if whole.start() != 0 {
                    return None;
                }
                let mut captured = Vec::new();
                for name in re.capture_names().flatten() {
                    if let Some(value) = caps.name(name) {
                        captured.push((name.to_string(), value.as_str().to_string()));
                    }
                }
                Some((whole.end(), captured))
            }
        }
    }

    fn can_terminate(&self, remainder: &str) -> bool {
        if self.deny_final || self.handlers.is_empty() {
            return false;
        }
        match &self.matcher {
            PathMatcher::Prefix(_) | PathMatcher::Root => true,
            _ => remainder.is_empty(),
        }
    }

    fn method_allowed(&self, method: &Method) -> bool {
        match &self.methods {
            Some(methods) => methods.contains(method),
            None => true,
        }
    }

    /// Child visit order: specificity class, then registration order.
    fn ordered_children(&self) -> Vec<&RouteNode> {
        let mut ordered: Vec<&RouteNode> = Vec::with_capacity(self.children.len());
        for class in 0u8..=3 {
            ordered.extend(
                self.children
                    .iter()
                    .filter(|c| c.matcher.specificity() == class),
            );
        }
        ordered
    }
}

fn anchored(pattern: &str) -> anyhow::Result<Regex> {
    let pattern = if pattern.starts_with('^') {
        pattern.to_string()
    } else {
        format!("^{pattern}")
    };
    Ok(Regex::new(&pattern)?)
}

/// One step of a successful match: the node and the captures it contributed.
struct RouteStep<'t> {
    node: &'t RouteNode,
    captures: Vec<(String, String)>,
}

enum TreeMatch<'t> {
    Found(Vec<RouteStep<'t>>),
    MethodMismatch,
    NotFound,
}

/// Public view of a match, used by introspection and tests.
#[derive(Debug)]
pub struct MatchedRoute {
    pub route_path: String,
    pub path_params: HashMap<String, String>,
    pub body_format: BodyFormat,
}

/// Listener-scoped dispatch options.
#[derive(Debug, Clone, Default)]
pub struct ListenerContext {
    pub prefix: String,
    pub secure: bool,
    pub max_body_bytes: usize,
    pub redirect: Option<u16>,
}

pub struct Router {
    root: RouteNode,
    requested_with_tokens: Vec<String>,
}

impl Default for Router {
    fn default() -> Self {
        Router::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Router {
            root: RouteNode::root(),
            requested_with_tokens: Vec::new(),
        }
    }

    pub fn root_mut(&mut self) -> &mut RouteNode {
        &mut self.root
    }

    /// Register a token accepted by the `requestedWithHeader` security check.
    pub fn register_requested_with(&mut self, token: impl Into<String>) {
        self.requested_with_tokens.push(token.into());
    }

    fn match_tree<'t>(&'t self, method: &Method, path: &str, check_methods: bool) -> Option<Vec<RouteStep<'t>>> {
        fn descend<'t>(
            node: &'t RouteNode,
            method: &Method,
            remaining: &str,
            check_methods: bool,
            chain: &mut Vec<RouteStep<'t>>,
        ) -> bool {
            let Some((consumed, captures)) = node.match_path(remaining) else {
                return false;
            };
            if check_methods && !node.method_allowed(method) {
                return false;
            }
            let remainder = &remaining[consumed..];
            chain.push(RouteStep { node, captures });
            for child in node.ordered_children() {
                if descend(child, method, remainder, check_methods, chain) {
                    return true;
                }
            }
            if node.can_terminate(remainder) && body_formats_compatible(chain) {
                return true;
            }
            chain.pop();
            false
        }

        let mut chain = Vec::new();
        if descend(&self.root, method, path, check_methods, &mut chain) {
            Some(chain)
        } else {
            None
        }
    }

    fn find<'t>(&'t self, method: &Method, path: &str) -> TreeMatch<'t> {
        if let Some(chain) = self.match_tree(method, path, true) {
            return TreeMatch::Found(chain);
        }
        // distinguish 404 from 405: would the path match with any method?
        if self.match_tree(method, path, false).is_some() {
            return TreeMatch::MethodMismatch;
        }
        TreeMatch::NotFound
    }

    /// Match without dispatching. `path` is the prefix-stripped, still
    /// percent-encoded request path.
    pub fn match_route(&self, method: &Method, path: &str) -> Option<MatchedRoute> {
        let chain = self.match_tree(method, path, true)?;
        let path_params = decode_captures(&chain).ok()?;
        Some(MatchedRoute {
            route_path: describe_chain(&chain),
            path_params,
            body_format: effective_body_format(&chain),
        })
    }

    /// Serve one request to completion. Returns the channel for connection
    /// reuse, or `None` when the response stream was handed off or destroyed.
    pub fn handle(
        &self,
        head: RequestHead,
        mut channel: Box<dyn HttpChannel>,
        ctx: &ListenerContext,
    ) -> Option<Box<dyn HttpChannel>> {
        let _guard = RequestGuard::new();
        let host = head
            .host()
            .map(str::to_string)
            .unwrap_or_else(|| "localhost".to_string());

        // redirect listeners bounce everything to the TLS port
        if let Some(port) = ctx.redirect {
            let location = format!("https://{}:{}{}", host_only(&host), port, head.target);
            respond_redirect(&mut channel, &location);
            return Some(channel);
        }

        // phase 1: parse + prefix discipline
        let stripped = match strip_prefix(&head.target, &ctx.prefix) {
            PrefixOutcome::Ok(stripped) => stripped,
            PrefixOutcome::ExactPrefix => {
                respond_redirect(&mut channel, &format!("{}/", ctx.prefix));
                return Some(channel);
            }
            PrefixOutcome::Outside => {
                let message = format!(
                    "The server is setup with a path prefix {}, but this request is outside of that prefix.",
                    ctx.prefix
                );
                respond_text(&mut channel, StatusCode::INTERNAL_SERVER_ERROR, &message);
                return Some(channel);
            }
        };
        let scheme = if ctx.secure { "https" } else { "http" };
        let url_info = match Url::parse(&format!("{scheme}://{host}{}", head.target)) {
            Ok(url) => url,
            Err(_) => {
                respond_text(&mut channel, StatusCode::BAD_REQUEST, "Invalid request URL");
                return Some(channel);
            }
        };

        let mut state = RequestState::new(StateSeed {
            channel,
            method: head.method.clone(),
            host,
            url_info,
            url: stripped.clone(),
            path_prefix: ctx.prefix.clone(),
            headers: head.headers,
            body_format: BodyFormat::Ignore,
            expect_secure: ctx.secure,
            max_body_bytes: ctx.max_body_bytes,
        });

        bus().emit(
            &EventName::RequestStreamer,
            &mut EventPayload::Request(&mut state),
        );
        bus().emit(
            &EventName::RequestState,
            &mut EventPayload::Request(&mut state),
        );

        // phase 2: middleware hook (security headers etc.) may take over
        let outcome = bus().emit_async(
            &EventName::RequestMiddleware,
            &mut EventPayload::Request(&mut state),
        );
        if outcome.done.is_some() {
            return state.into_channel();
        }

        let result = self.dispatch(&mut state, &stripped);
        if let Err(err) = result {
            self.render_error(&mut state, err);
        }
        state.into_channel()
    }

    /// Phases 3–8 against an existing state.
    fn dispatch(&self, state: &mut RequestState, stripped: &str) -> Result<(), SendError> {
        let match_path = stripped.split('?').next().unwrap_or("/").to_string();

        // phase 3: match
        let chain = match self.find(&state.method.clone(), &match_path) {
            TreeMatch::Found(chain) => chain,
            TreeMatch::MethodMismatch => {
                return Err(SendError::new(
                    ErrorReason::MethodNotAllowed,
                    Some(json!({ "method": state.method.as_str(), "path": match_path })),
                ));
            }
            TreeMatch::NotFound => {
                let outcome = bus().emit_async(
                    &EventName::RequestFallback,
                    &mut EventPayload::Request(&mut *state),
                );
                if outcome.done.is_some() {
                    return Ok(());
                }
                return Err(SendError::new(
                    ErrorReason::NotFound,
                    Some(json!({ "path": match_path })),
                ));
            }
        };

        state.path_params = decode_captures(&chain)?;
        state.route_path = describe_chain(&chain);
        state.body_format = effective_body_format(&chain);

        // phase 4: body preparation
        self.prepare_body(state)?;

        // phase 5: security checks
        for step in &chain {
            for check in &step.node.security {
                self.run_security_check(state, *check)?;
            }
        }

        // phase 6: handlers, in path order
        bus().emit_async(
            &EventName::RequestHandle,
            &mut EventPayload::Request(&mut *state),
        );

        let handlers: Vec<RouteHandler> = chain
            .iter()
            .flat_map(|step| step.node.handlers.iter().cloned())
            .collect();
        let recovery = chain
            .iter()
            .rev()
            .find_map(|step| step.node.recovery.clone());

        for handler in handlers {
            let invoked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                handler(state)
            }));
            let outcome = match invoked {
                Ok(result) => result,
                Err(panic) => {
                    tracing::error!(
                        route = %state.route_path,
                        panic = ?panic_message(&panic),
                        "handler panicked"
                    );
                    Err(SendError::internal(anyhow::anyhow!("handler panicked")))
                }
            };
            match outcome {
                Ok(HandlerOutcome::Done(_)) => return Ok(()),
                Ok(HandlerOutcome::Next) => continue,
                Err(err) => {
                    // phase 7: recovery
                    return self.recover(state, recovery, err);
                }
            }
        }

        // a matched request that nobody answered is a programming error
        tracing::error!(
            route = %state.route_path,
            method = %state.method,
            url = %state.url,
            "no handler completed the response"
        );
        Err(SendError::new(
            ErrorReason::RequestDropped,
            Some(json!({ "route": state.route_path })),
        ))
    }

    fn prepare_body(&self, state: &mut RequestState) -> Result<(), SendError> {
        match state.body_format {
            BodyFormat::Ignore | BodyFormat::Stream | BodyFormat::Multipart => Ok(()),
            BodyFormat::Buffer => {
                state.read_buffer()?;
                Ok(())
            }
            BodyFormat::String => {
                let body = state.read_buffer()?;
                let text = String::from_utf8(body).map_err(|_| {
                    SendError::bad_request(json!({ "body": "invalid UTF-8" }))
                })?;
                state.data = Some(Value::String(text));
                Ok(())
            }
            BodyFormat::Json => {
                let body = state.read_buffer()?;
                let value: Value = serde_json::from_slice(&body).map_err(|e| {
                    SendError::bad_request(json!({ "body": format!("invalid JSON: {e}") }))
                })?;
                state.data = Some(value);
                Ok(())
            }
            BodyFormat::FormUrlEncoded => {
                let body = state.read_buffer()?;
                let mut object = serde_json::Map::new();
                for (name, value) in url::form_urlencoded::parse(&body) {
                    object.insert(name.into_owned(), Value::String(value.into_owned()));
                }
                state.data = Some(Value::Object(object));
                Ok(())
            }
            BodyFormat::FormUrlEncodedMulti => {
                let body = state.read_buffer()?;
                let pairs: Vec<Value> = url::form_urlencoded::parse(&body)
                    .map(|(name, value)| {
                        Value::Array(vec![
                            Value::String(name.into_owned()),
                            Value::String(value.into_owned()),
                        ])
                    })
                    .collect();
                state.data = Some(Value::Array(pairs));
                Ok(())
            }
        }
    }

    fn run_security_check(
        &self,
        state: &RequestState,
        check: SecurityCheck,
    ) -> Result<(), SendError> {
        match check {
            SecurityCheck::RequestedWithHeader => {
                let supplied = state.header_str("x-requested-with").unwrap_or("");
                if self
                    .requested_with_tokens
                    .iter()
                    .any(|token| token == supplied)
                {
                    Ok(())
                } else {
                    Err(SendError::new(
                        ErrorReason::Forbidden,
                        Some(json!({ "check": "requestedWithHeader" })),
                    ))
                }
            }
        }
    }

    fn recover(
        &self,
        state: &mut RequestState,
        recovery: Option<RecoveryHandler>,
        err: SendError,
    ) -> Result<(), SendError> {
        if state.headers_sent() {
            // nothing clean can go on the wire any more
            tracing::error!(error = %err, route = %state.route_path, "error after headers were sent");
            return Ok(());
        }
        if let Some(recovery) = recovery {
            match recovery(state, &err) {
                Ok(_) => return Ok(()),
                Err(recovery_err) => {
                    tracing::error!(error = %recovery_err, "recovery handler failed");
                    return Err(recovery_err);
                }
            }
        }
        Err(err)
    }

    /// Final rendering for errors nobody recovered from.
    fn render_error(&self, state: &mut RequestState, err: SendError) {
        if let Some(source) = err.source_chain() {
            tracing::error!(error = %err, source = ?source, url = %state.url, "request failed");
        } else if err.status.is_server_error() {
            tracing::error!(error = %err, url = %state.url, "request failed");
        } else {
            tracing::debug!(error = %err, url = %state.url, "client error");
        }
        if state.headers_sent() {
            return;
        }
        if let Err(render_err) = state.send_json(err.status, &err) {
            tracing::error!(error = %render_err, "failed to render error response");
            state.destroy();
        }
    }
}

fn body_formats_compatible(chain: &[RouteStep<'_>]) -> bool {
    let effective = effective_body_format(chain);
    chain.iter().all(|step| {
        step.node
            .body_formats
            .as_ref()
            .map(|formats| formats.contains(&effective))
            .unwrap_or(true)
    })
}

fn effective_body_format(chain: &[RouteStep<'_>]) -> BodyFormat {
    chain
        .iter()
        .rev()
        .find_map(|step| {
            step.node
                .body_formats
                .as_ref()
                .and_then(|formats| formats.first().copied())
        })
        .unwrap_or(BodyFormat::Ignore)
}

fn decode_captures(chain: &[RouteStep<'_>]) -> Result<HashMap<String, String>, SendError> {
    let mut params = HashMap::new();
    for step in chain {
        for (name, raw) in &step.captures {
            let decoded = percent_decode(raw).ok_or_else(|| {
                SendError::bad_request(json!({ "param": name, "value": raw }))
            })?;
            // innermost value wins
            params.insert(name.clone(), decoded);
        }
    }
    Ok(params)
}

fn describe_chain(chain: &[RouteStep<'_>]) -> String {
    chain
        .iter()
        .map(|step| step.node.matcher.describe())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn host_only(host: &str) -> &str {
    host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host)
}

enum PrefixOutcome {
    Ok(String),
    ExactPrefix,
    Outside,
}

fn strip_prefix(target: &str, prefix: &str) -> PrefixOutcome {
    if prefix.is_empty() {
        return PrefixOutcome::Ok(target.to_string());
    }
    match target.strip_prefix(prefix) {
        Some("") => PrefixOutcome::ExactPrefix,
        Some(rest) if rest.starts_with('/') => PrefixOutcome::Ok(rest.to_string()),
        // the stripped URL must still begin with a slash
        Some(rest) if rest.starts_with('?') => PrefixOutcome::Ok(format!("/{rest}")),
        _ => PrefixOutcome::Outside,
    }
}

fn respond_text(channel: &mut Box<dyn HttpChannel>, status: StatusCode, text: &str) {
    let mut headers = HeaderMap::new();
    headers.insert(
        "content-type",
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    let _ = channel.send_head(status, &headers, BodyFraming::Known(text.len() as u64));
    let _ = channel.send_data(text.as_bytes());
    let _ = channel.finish();
}

fn respond_redirect(channel: &mut Box<dyn HttpChannel>, location: &str) {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(location) {
        headers.insert("location", value);
    }
    let _ = channel.send_head(StatusCode::FOUND, &headers, BodyFraming::Empty);
    let _ = channel.finish();
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_handler(state: &mut RequestState) -> HandlerResult {
        let ended = state.send_simple(StatusCode::OK, "ok")?;
        Ok(ended.into())
    }

    fn router_with(routes: RouteNode) -> Router {
        let mut router = Router::new();
        router.root_mut().mount(routes);
        router
    }

    #[test]
    fn test_literal_match_boundaries() {
        let router = router_with(
            RouteNode::literal("/admin").methods(&[Method::GET]).handler(ok_handler),
        );
        assert!(router.match_route(&Method::GET, "/admin").is_some());
        assert!(router.match_route(&Method::GET, "/administrator").is_none());
        assert!(router.match_route(&Method::GET, "/admin/x").is_none());
    }

    #[test]
    fn test_regex_captures_decode_once() {
        let router = router_with(
            RouteNode::regex(r"/files/(?P<name>.+)")
                .unwrap()
                .methods(&[Method::GET])
                .handler(ok_handler),
        );
        let matched = router
            .match_route(&Method::GET, "/files/a%2Fb.txt")
            .unwrap();
        assert_eq!(matched.path_params["name"], "a/b.txt");
    }

    #[test]
    fn test_innermost_capture_wins() {
        let router = router_with(
            RouteNode::prefix_regex(r"/bags/(?P<id>[^/]+)")
                .unwrap()
                .deny_final()
                .child(
                    RouteNode::regex(r"/tiddlers/(?P<id>[^/]+)")
                        .unwrap()
                        .methods(&[Method::GET])
                        .handler(ok_handler),
                ),
        );
        let matched = router
            .match_route(&Method::GET, "/bags/outer/tiddlers/inner")
            .unwrap();
        assert_eq!(matched.path_params["id"], "inner");
    }

    #[test]
    fn test_deny_final_never_terminates() {
        let router = router_with(
            RouteNode::prefix_regex(r"/api")
                .unwrap()
                .deny_final()
                .handler(ok_handler)
                .child(RouteNode::literal("/status").methods(&[Method::GET]).handler(ok_handler)),
        );
        assert!(router.match_route(&Method::GET, "/api/status").is_some());
        // the deny-final node itself cannot answer, even with handlers
        assert!(router.match_route(&Method::GET, "/api").is_none());
    }

    #[test]
    fn test_specificity_literal_over_regex() {
        let mut router = Router::new();
        router.root_mut().mount(
            RouteNode::regex(r"/(?P<page>.+)")
                .unwrap()
                .methods(&[Method::GET])
                .handler(ok_handler),
        );
        router.root_mut().mount(
            RouteNode::literal("/status").methods(&[Method::GET]).handler(ok_handler),
        );
        // the literal wins although the regex was registered first
        let matched = router.match_route(&Method::GET, "/status").unwrap();
        assert_eq!(matched.route_path, "/status");
    }

    #[test]
    fn test_body_format_innermost_and_compat() {
        let router = router_with(
            RouteNode::prefix_regex(r"/api")
                .unwrap()
                .deny_final()
                .body_formats_allowed(&[BodyFormat::Json, BodyFormat::String])
                .child(
                    RouteNode::literal("/upload")
                        .methods(&[Method::POST])
                        .body_format(BodyFormat::Json)
                        .handler(ok_handler),
                ),
        );
        let matched = router.match_route(&Method::POST, "/api/upload").unwrap();
        assert_eq!(matched.body_format, BodyFormat::Json);
    }

    #[test]
    fn test_method_mismatch_detected() {
        let router = router_with(
            RouteNode::literal("/thing").methods(&[Method::GET]).handler(ok_handler),
        );
        assert!(matches!(
            router.find(&Method::POST, "/thing"),
            TreeMatch::MethodMismatch
        ));
        assert!(matches!(
            router.find(&Method::POST, "/absent"),
            TreeMatch::NotFound
        ));
    }

    #[test]
    fn test_prefix_stripping_rules() {
        assert!(matches!(
            strip_prefix("/wiki/page", "/wiki"),
            PrefixOutcome::Ok(rest) if rest == "/page"
        ));
        assert!(matches!(
            strip_prefix("/wiki", "/wiki"),
            PrefixOutcome::ExactPrefix
        ));
        assert!(matches!(
            strip_prefix("/other", "/wiki"),
            PrefixOutcome::Outside
        ));
        // a shared string prefix is not a path prefix
        assert!(matches!(
            strip_prefix("/wikipedia", "/wiki"),
            PrefixOutcome::Outside
        ));
        assert!(matches!(
            strip_prefix("/anything", ""),
            PrefixOutcome::Ok(rest) if rest == "/anything"
        ));
    }
}
