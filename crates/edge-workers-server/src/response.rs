//! Response Adapter: guest responses to HTTP responses.
//!
//! Status and headers are copied from the guest. The body is handled by
//! its [`BodyKind`](edge_workers_core::BodyKind):
//!
//! | body   | default content-type                              |
//! |--------|---------------------------------------------------|
//! | empty  | none                                              |
//! | text   | inferred: HTML, JSON or plain text                |
//! | binary | inferred as text when valid UTF-8, else octet-stream |
//! | stream | `text/event-stream`                               |
//!
//! A content-type set by the guest always wins over the default.

use axum::body::Body;
use axum::http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use axum::http::{HeaderName, HeaderValue, Response, StatusCode};
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use edge_workers_common::WorkerError;
use edge_workers_core::{GuestBody, GuestResponse, GuestStream};

/// Default content-type for streamed bodies.
pub const STREAM_CONTENT_TYPE: &str = "text/event-stream";

const HTML: &str = "text/html; charset=utf-8";
const JSON: &str = "application/json";
const PLAIN: &str = "text/plain; charset=utf-8";
const OCTET_STREAM: &str = "application/octet-stream";

/// Content-type for a text body the guest sent without one.
pub fn infer_text_content_type(text: &str) -> &'static str {
    let lower: String = text
        .trim_start()
        .chars()
        .take(14)
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if lower.starts_with("<!doctype html") || lower.starts_with("<html") {
        HTML
    } else if serde_json::from_str::<serde::de::IgnoredAny>(text).is_ok() {
        JSON
    } else {
        PLAIN
    }
}

/// Content-type for a binary body the guest sent without one.
pub fn infer_binary_content_type(bytes: &[u8]) -> &'static str {
    match std::str::from_utf8(bytes) {
        Ok(text) => infer_text_content_type(text),
        Err(_) => OCTET_STREAM,
    }
}

/// Convert a guest response into an axum response.
///
/// A streamed body is pumped by a spawned task: chunks are pulled from the
/// sandbox only as fast as the client reads them, and a client disconnect
/// cancels the guest stream.
pub fn into_axum_response(response: GuestResponse) -> Response<Body> {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);

    for (name, value) in &response.headers {
        let Ok(name) = HeaderName::try_from(name.as_str()) else {
            debug!(header = %name, "Dropping invalid header name from guest response");
            continue;
        };
        // Framing is decided by the server.
        if name == CONTENT_LENGTH || name == TRANSFER_ENCODING || name == CONNECTION {
            continue;
        }
        match HeaderValue::try_from(value.as_str()) {
            Ok(value) => builder = builder.header(name, value),
            Err(_) => debug!(header = %name, "Dropping invalid header value from guest response"),
        }
    }

    let has_content_type = response.header("content-type").is_some();
    let (default_type, body) = match response.body {
        GuestBody::Empty => (None, Body::empty()),
        GuestBody::Text(text) => (Some(infer_text_content_type(&text)), Body::from(text)),
        GuestBody::Binary(bytes) => (Some(infer_binary_content_type(&bytes)), Body::from(bytes)),
        GuestBody::Stream(stream) => (Some(STREAM_CONTENT_TYPE), stream_body(stream)),
    };
    if let Some(content_type) = default_type.filter(|_| !has_content_type) {
        builder = builder.header(CONTENT_TYPE, content_type);
    }

    builder.body(body).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to build response");
        let mut fallback = Response::new(Body::from("Internal server error"));
        *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        fallback
    })
}

fn stream_body(stream: GuestStream) -> Body {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(pump(stream, tx));

    let chunks = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    Body::from_stream(chunks)
}

/// Move chunks from the guest to the connection until either side stops.
///
/// An error after headers went out is forwarded as a body error, which makes
/// the server abort the connection instead of sending a new status line.
async fn pump(mut stream: GuestStream, tx: mpsc::Sender<Result<Bytes, WorkerError>>) {
    loop {
        let next = tokio::select! {
            () = tx.closed() => {
                debug!(worker_id = %stream.worker_id(), "Client went away, cancelling stream");
                stream.cancel();
                return;
            }
            next = stream.next_chunk() => next,
        };

        match next {
            Ok(Some(chunk)) => {
                if tx.send(Ok(chunk)).await.is_err() {
                    debug!(worker_id = %stream.worker_id(), "Client went away, cancelling stream");
                    stream.cancel();
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                warn!(worker_id = %stream.worker_id(), error = %e, "Response stream failed");
                stream.cancel();
                let _ = tx.send(Err(e)).await;
                return;
            }
        }
    }
}
