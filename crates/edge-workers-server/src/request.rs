//! HTTP request conversion for worker dispatch.
//!
//! Turns an axum request into the [`InboundRequest`] the manager routes.
//! Header names arrive lower-cased from `http`; repeated headers stay
//! repeated, in order.

use axum::http::Request;
use bytes::Bytes;

use edge_workers_core::InboundRequest;

/// Convert from axum request parts.
///
/// # Arguments
///
/// * `req` - The HTTP request (headers and metadata)
/// * `body` - The request body as bytes
pub fn inbound_from_axum<B>(req: &Request<B>, body: Bytes) -> InboundRequest {
    let headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();

    let mut inbound = InboundRequest::new(req.method().as_str(), req.uri().path());
    inbound.query = req.uri().query().map(str::to_string);
    inbound.headers = headers;
    inbound.body = body;
    inbound
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, Request as HttpRequest};

    use super::*;

    #[test]
    fn test_from_axum() {
        let http_req = HttpRequest::builder()
            .method(Method::POST)
            .uri("/users/42?verbose=1")
            .header("Content-Type", "application/json")
            .header("X-Tag", "a")
            .header("X-Tag", "b")
            .body(())
            .unwrap();

        let body = Bytes::from(r#"{"name": "test"}"#);
        let req = inbound_from_axum(&http_req, body.clone());

        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/users/42");
        assert_eq!(req.query.as_deref(), Some("verbose=1"));
        assert_eq!(req.get_header("content-type"), Some("application/json"));
        assert_eq!(
            req.headers
                .iter()
                .filter(|(k, _)| k == "x-tag")
                .map(|(_, v)| v.as_str())
                .collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert_eq!(req.body, body);
    }

    #[test]
    fn test_no_query() {
        let http_req = HttpRequest::builder().uri("/hello").body(()).unwrap();
        let req = inbound_from_axum(&http_req, Bytes::new());

        assert_eq!(req.method, "GET");
        assert!(req.query.is_none());
        assert!(req.body.is_empty());
    }
}
