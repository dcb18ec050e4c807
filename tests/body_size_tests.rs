mod common;

use http::{Method, StatusCode};
use wikiserve::{BodyFormat, RequestState, RouteNode, Router};

fn upload_router() -> Router {
    let mut router = Router::new();
    router.root_mut().mount(
        RouteNode::literal("/upload")
            .methods(&[Method::POST])
            .body_format(BodyFormat::Buffer)
            .handler(|state: &mut RequestState| {
                let size = state.data_buffer.as_ref().map(Vec::len).unwrap_or(0);
                let ended =
                    state.send_json(StatusCode::OK, &serde_json::json!({ "received": size }))?;
                Ok(ended.into())
            }),
    );
    router
}

#[test]
fn test_body_within_limit_is_accepted() {
    let handle = common::start_with(upload_router(), |mut cfg| {
        cfg.max_body_bytes = 1024;
        cfg
    });
    let response = common::request_with(&handle, "POST", "/upload", &[], &[b'a'; 512]);
    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), "{\"received\":512}");
    handle.stop();
}

#[test]
fn test_over_limit_body_is_413() {
    let handle = common::start_with(upload_router(), |mut cfg| {
        cfg.max_body_bytes = 1024;
        cfg
    });
    let response = common::request_with(&handle, "POST", "/upload", &[], &[b'a'; 4096]);
    assert_eq!(response.status, 413);
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["reason"], "PAYLOAD_TOO_LARGE");
    assert_eq!(body["details"]["limit"], 1024);
    handle.stop();
}
