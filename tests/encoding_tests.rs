mod common;

use std::io::Read;

use http::{Method, StatusCode};
use wikiserve::encoding::{ContentEncoding, PREFERRED_ORDER};
use wikiserve::{RequestState, RouteNode, Router};

const BODY: &str = "the same phrase over and over, the same phrase over and over";

fn compressing_router(allow: &'static [ContentEncoding]) -> Router {
    let mut router = Router::new();
    router.root_mut().mount(
        RouteNode::literal("/page")
            .methods(&[Method::GET])
            .handler(move |state: &mut RequestState| {
                state.enable_compression(allow);
                let ended = state.send_simple(StatusCode::OK, BODY)?;
                Ok(ended.into())
            }),
    );
    router
}

#[test]
fn test_identity_refused_negotiates_gzip() {
    // Accept-Encoding: identity;q=0, gzip → the response must be gzip
    let handle = common::start(compressing_router(&PREFERRED_ORDER));
    let response = common::request_with(
        &handle,
        "GET",
        "/page",
        &[("accept-encoding", "identity;q=0, gzip")],
        b"",
    );
    assert_eq!(response.status, 200);
    assert_eq!(response.header("content-encoding"), Some("gzip"));

    let mut decoded = String::new();
    flate2::read::GzDecoder::new(&response.body[..])
        .read_to_string(&mut decoded)
        .unwrap();
    assert_eq!(decoded, BODY);
    handle.stop();
}

#[test]
fn test_whitelist_excluding_gzip_falls_back_to_identity() {
    static IDENTITY_ONLY: [ContentEncoding; 1] = [ContentEncoding::Identity];
    let handle = common::start(compressing_router(&IDENTITY_ONLY));
    let response = common::request_with(
        &handle,
        "GET",
        "/page",
        &[("accept-encoding", "identity;q=0, gzip")],
        b"",
    );
    assert_eq!(response.status, 200);
    // never a q=0 encoding: identity goes out even though the client refused it
    assert_eq!(response.header("content-encoding"), None);
    assert_eq!(response.body_text(), BODY);
    handle.stop();
}

#[test]
fn test_no_accept_encoding_stays_identity() {
    let handle = common::start(compressing_router(&PREFERRED_ORDER));
    let response = common::get(&handle, "/page");
    assert_eq!(response.header("content-encoding"), None);
    assert_eq!(response.body_text(), BODY);
    handle.stop();
}

#[test]
fn test_brotli_preferred_over_gzip() {
    let handle = common::start(compressing_router(&PREFERRED_ORDER));
    let response = common::request_with(
        &handle,
        "GET",
        "/page",
        &[("accept-encoding", "gzip, br")],
        b"",
    );
    assert_eq!(response.header("content-encoding"), Some("br"));
    let mut decoded = Vec::new();
    brotli::Decompressor::new(&response.body[..], 4096)
        .read_to_end(&mut decoded)
        .unwrap();
    assert_eq!(decoded, BODY.as_bytes());
    handle.stop();
}
