//! Schema-driven typed routes.
//!
//! `check_path` / `check_query` validate the raw parameter maps into caller
//! types; a failed validation is a 400 with a rendered error tree. The
//! [`TypedRoute`] descriptor bundles method, path pattern, body format,
//! security checks, and a handler whose inputs are already validated — the
//! engine deserialises before invoking `inner` and serialises the output
//! through `send_json`.

use http::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::error::{HandlerResult, SendError};
use crate::router::{RouteNode, SecurityCheck};
use crate::state::{BodyFormat, RequestState};

fn validation_error(context: &str, what: &str, err: impl std::fmt::Display, input: Value) -> SendError {
    SendError::bad_request(json!({
        "context": context,
        "in": what,
        "error": err.to_string(),
        "input": input,
    }))
}

fn path_params_value(state: &RequestState) -> Value {
    let mut object = Map::new();
    for (name, value) in &state.path_params {
        object.insert(name.clone(), Value::String(value.clone()));
    }
    Value::Object(object)
}

fn query_params_value(state: &RequestState) -> Value {
    let mut object = Map::new();
    for (name, values) in &state.query_params {
        object.insert(
            name.clone(),
            Value::Array(values.iter().cloned().map(Value::String).collect()),
        );
    }
    Value::Object(object)
}

/// Validate the decoded path parameters against `T`.
///
/// Fields of `T` are strings (path captures are strings by construction);
/// convert further inside the handler.
pub fn check_path<T: DeserializeOwned>(
    state: &RequestState,
    context: &str,
) -> Result<T, SendError> {
    let input = path_params_value(state);
    serde_json::from_value(input.clone())
        .map_err(|e| validation_error(context, "pathParams", e, input))
}

/// Validate the query parameters against `T`. Every name maps to the full
/// list of supplied values, so `T`'s fields are typically `Vec<String>` or
/// `Option<Vec<String>>`.
pub fn check_query<T: DeserializeOwned>(
    state: &RequestState,
    context: &str,
) -> Result<T, SendError> {
    let input = query_params_value(state);
    serde_json::from_value(input.clone())
        .map_err(|e| validation_error(context, "queryParams", e, input))
}

/// Validate the prepared body (`state.data`) against `T`. Routes without a
/// body use `()` (JSON null deserialises into it).
pub fn check_body<T: DeserializeOwned>(
    state: &RequestState,
    context: &str,
) -> Result<T, SendError> {
    let input = state.data.clone().unwrap_or(Value::Null);
    serde_json::from_value(input.clone())
        .map_err(|e| validation_error(context, "body", e, input))
}

/// Inputs already validated against the route's declared types.
pub struct TypedRequest<P, Q, B> {
    pub path: P,
    pub query: Q,
    pub body: B,
}

/// A compile-time-typed route descriptor.
///
/// `path` is an anchored regex with named captures feeding `P`. The engine
/// validates `P`/`Q`/`B` before `inner` runs, validates the output against
/// the declared response check (if any), and serialises the `Ok` value as
/// the JSON response body. The response *shape* is already pinned by
/// `R: Serialize`; `response_check` carries the value-level constraints a
/// runtime schema would have expressed.
pub struct TypedRoute<P, Q, B, R> {
    pub method: Method,
    pub path: &'static str,
    pub body_format: BodyFormat,
    pub security: Vec<SecurityCheck>,
    pub status: StatusCode,
    #[allow(clippy::type_complexity)]
    pub inner: fn(&mut RequestState, TypedRequest<P, Q, B>) -> Result<R, SendError>,
    /// Optional output validation, run before serialisation. A failure is a
    /// server bug and renders as a 500, never as a client error.
    pub response_check: Option<fn(&R) -> Result<(), SendError>>,
}

impl<P, Q, B, R> TypedRoute<P, Q, B, R>
where
    P: DeserializeOwned + Send + Sync + 'static,
    Q: DeserializeOwned + Send + Sync + 'static,
    B: DeserializeOwned + Send + Sync + 'static,
    R: Serialize + Send + Sync + 'static,
{
    pub fn new(
        method: Method,
        path: &'static str,
        body_format: BodyFormat,
        inner: fn(&mut RequestState, TypedRequest<P, Q, B>) -> Result<R, SendError>,
    ) -> Self {
        TypedRoute {
            method,
            path,
            body_format,
            security: Vec::new(),
            status: StatusCode::OK,
            inner,
            response_check: None,
        }
    }

    pub fn security(mut self, check: SecurityCheck) -> Self {
        self.security.push(check);
        self
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// Declare the response schema's value-level constraints.
    pub fn response_check(mut self, check: fn(&R) -> Result<(), SendError>) -> Self {
        self.response_check = Some(check);
        self
    }

    /// Build the route node wrapping `inner` in the validation shell.
    pub fn into_node(self) -> anyhow::Result<RouteNode> {
        let TypedRoute {
            method,
            path,
            body_format,
            security,
            status,
            inner,
            response_check,
        } = self;
        let context: &'static str = path;
        let mut node = RouteNode::regex(path)?
            .methods(&[method])
            .body_format(body_format)
            .handler(move |state: &mut RequestState| -> HandlerResult {
                let request = TypedRequest {
                    path: check_path::<P>(state, context)?,
                    query: check_query::<Q>(state, context)?,
                    body: check_body::<B>(state, context)?,
                };
                let response = inner(state, request)?;
                if let Some(check) = response_check {
                    if let Err(err) = check(&response) {
                        return Err(SendError::internal(anyhow::anyhow!(
                            "response validation failed for {context}: {err}"
                        )));
                    }
                }
                let ended = state.send_json(status, &response)?;
                Ok(ended.into())
            });
        for check in security {
            node = node.security(check);
        }
        Ok(node)
    }

    /// Install on a parent node.
    pub fn register(self, parent: &mut RouteNode) -> anyhow::Result<()> {
        let node = self.into_node()?;
        parent.mount(node);
        Ok(())
    }
}

/// Install a batch of already-built typed route nodes on a parent.
pub fn register_typed_routes(
    parent: &mut RouteNode,
    nodes: Vec<anyhow::Result<RouteNode>>,
) -> anyhow::Result<()> {
    for node in nodes {
        parent.mount(node?);
    }
    Ok(())
}
