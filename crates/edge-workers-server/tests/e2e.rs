//! End-to-end tests for edge-workers-server.
//!
//! These tests run a real server on an ephemeral port and talk to it over
//! HTTP with `reqwest`:
//! - Worker dispatch and content-type inference
//! - Streaming responses and client disconnects
//! - Error responses that hide guest details
//! - The Admin API

use std::sync::Arc;
use std::time::Duration;

use edge_workers_common::RuntimeConfig;
use edge_workers_core::{MemoryStore, WorkerManager};
use edge_workers_host::StandardHost;
use edge_workers_server::{AppState, EdgeServer, TestHandle};

async fn start_server(store: MemoryStore, running: &[&str]) -> TestHandle {
    let config = RuntimeConfig::default();
    let store = Arc::new(store);
    let host = StandardHost::new(&config.outbound).unwrap();
    let manager = Arc::new(WorkerManager::new(
        &config,
        store.clone(),
        store,
        Arc::new(host),
    ));
    for id in running {
        manager.start(id).await.unwrap();
    }
    EdgeServer::start_test(AppState::new(manager)).await.unwrap()
}

const RESPONDER: &str = r#"export default {
    fetch(request) {
        const url = new URL(request.url);
        switch (url.pathname) {
            case '/json':
                return new Response('{"ok":true}');
            case '/html':
                return new Response('<!DOCTYPE html><h1>hi</h1>');
            case '/bytes':
                return new Response(new Uint8Array([0xff, 0x00, 0x10]));
            case '/boom':
                throw new Error('secret internals');
            default:
                return new Response('hello', { status: 201, headers: { 'X-Worker': 'yes' } });
        }
    },
};"#;

// ============================================================================
// Test: Dispatch
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_text_response_round_trip() {
    let server = start_server(MemoryStore::new().with_worker("w", "w", RESPONDER), &["w"]).await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("{}/w", server.url())).send().await.unwrap();
    assert_eq!(resp.status(), 201);
    assert_eq!(resp.headers()["content-type"], "text/plain; charset=utf-8");
    assert_eq!(resp.headers()["x-worker"], "yes");
    assert_eq!(resp.text().await.unwrap(), "hello");

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_content_type_inference() {
    let server = start_server(MemoryStore::new().with_worker("w", "w", RESPONDER), &["w"]).await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("{}/w/json", server.url())).send().await.unwrap();
    assert_eq!(resp.headers()["content-type"], "application/json");
    assert_eq!(resp.text().await.unwrap(), r#"{"ok":true}"#);

    let resp = client.get(format!("{}/w/html", server.url())).send().await.unwrap();
    assert_eq!(resp.headers()["content-type"], "text/html; charset=utf-8");

    let resp = client.get(format!("{}/w/bytes", server.url())).send().await.unwrap();
    assert_eq!(resp.headers()["content-type"], "application/octet-stream");
    assert_eq!(&resp.bytes().await.unwrap()[..], &[0xff, 0x00, 0x10]);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_handler_error_hides_details() {
    let server = start_server(MemoryStore::new().with_worker("w", "w", RESPONDER), &["w"]).await;

    let resp = reqwest::get(format!("{}/w/boom", server.url())).await.unwrap();
    assert_eq!(resp.status(), 500);
    let body = resp.text().await.unwrap();
    assert!(!body.contains("secret internals"));
    assert!(body.contains("Worker execution error"));

    let logged = server
        .state()
        .manager()
        .logs()
        .get_logs("w")
        .iter()
        .any(|entry| entry.message.contains("secret internals"));
    assert!(logged);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_routing_outcomes() {
    let server = start_server(
        MemoryStore::new()
            .with_worker("w", "w", RESPONDER)
            .with_worker("idle", "idle", RESPONDER),
        &["w"],
    )
    .await;

    let resp = reqwest::get(format!("{}/elsewhere", server.url())).await.unwrap();
    assert_eq!(resp.status(), 404);
    assert_eq!(resp.text().await.unwrap(), r#"{"error":"Not found"}"#);

    let resp = reqwest::get(format!("{}/idle/x", server.url())).await.unwrap();
    assert_eq!(resp.status(), 404);
    assert!(resp.text().await.unwrap().contains("No running worker"));

    server.shutdown().await;
}

// ============================================================================
// Test: Streaming
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_streamed_body() {
    let source = r"export default {
        fetch() {
            const { readable, writable } = new TransformStream();
            const writer = writable.getWriter();
            writer.write('a').then(() => writer.write('b')).then(() => writer.close());
            return new Response(readable);
        },
    };";
    let server = start_server(MemoryStore::new().with_worker("s", "s", source), &["s"]).await;

    let resp = reqwest::get(format!("{}/s", server.url())).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "text/event-stream");
    assert_eq!(resp.text().await.unwrap(), "ab");
    assert_eq!(server.state().manager().inflight(), 0);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_client_disconnect_cancels_stream() {
    // The first chunk is quick, later ones are slow, so the disconnect
    // lands while a pull is still waiting inside the sandbox.
    let source = r"let pulls = 0;
    export default {
        fetch(request) {
            if (new URL(request.url).pathname.endsWith('/plain')) {
                return new Response('still here');
            }
            return new Response(new ReadableStream({
                pull(controller) {
                    pulls += 1;
                    const delay = pulls === 1 ? 5 : 3000;
                    return new Promise((resolve) => setTimeout(() => {
                        controller.enqueue('tick\n');
                        resolve();
                    }, delay));
                },
                cancel() { console.log('stream cancelled'); },
            }));
        },
    };";
    let server = start_server(MemoryStore::new().with_worker("s", "s", source), &["s"]).await;

    let mut resp = reqwest::get(format!("{}/s", server.url())).await.unwrap();
    let first = resp.chunk().await.unwrap().unwrap();
    assert!(first.starts_with(b"tick"));
    drop(resp);

    let logs = server.state().manager().logs().clone();
    let cancelled = || {
        logs.get_logs("s")
            .iter()
            .filter(|entry| entry.message == "stream cancelled")
            .count()
    };
    for _ in 0..100 {
        if cancelled() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cancelled(), 1);

    // The worker keeps serving after the disconnect.
    let resp = reqwest::get(format!("{}/s/plain", server.url())).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "still here");
    assert!(server.state().manager().is_running("s"));

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_guest_set_cookie_headers_stay_separate() {
    let source = r"export default {
        fetch() {
            const response = new Response('ok');
            response.headers.append('Set-Cookie', 'a=1');
            response.headers.append('Set-Cookie', 'b=2');
            return response;
        },
    };";
    let server = start_server(MemoryStore::new().with_worker("c", "c", source), &["c"]).await;

    let resp = reqwest::get(format!("{}/c", server.url())).await.unwrap();
    assert_eq!(resp.status(), 200);
    let cookies: Vec<_> = resp
        .headers()
        .get_all("set-cookie")
        .iter()
        .map(|value| value.to_str().unwrap().to_string())
        .collect();
    assert_eq!(cookies, ["a=1", "b=2"]);

    server.shutdown().await;
}

// ============================================================================
// Test: Admin API
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_admin_lifecycle() {
    let server = start_server(MemoryStore::new().with_worker("w", "w", RESPONDER), &[]).await;
    let client = reqwest::Client::new();
    let api = format!("{}/api/workers", server.url());

    let list: serde_json::Value = client.get(&api).send().await.unwrap().json().await.unwrap();
    assert_eq!(list["count"], 1);
    assert_eq!(list["workers"][0]["running"], false);

    let resp = client.post(format!("{api}/w/start")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let resp = client.post(format!("{api}/w/start")).send().await.unwrap();
    assert_eq!(resp.status(), 409);

    let resp = reqwest::get(format!("{}/w", server.url())).await.unwrap();
    assert_eq!(resp.status(), 201);

    let logs: serde_json::Value = client
        .get(format!("{api}/w/logs"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(!logs["logs"].as_array().unwrap().is_empty());

    let resp = client
        .put(format!("{api}/w/code"))
        .body("export default { fetch() { return new Response('v2'); } };")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let resp = client.post(format!("{api}/restart-all")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body = reqwest::get(format!("{}/w", server.url())).await.unwrap().text().await.unwrap();
    assert_eq!(body, "v2");

    let resp = client.post(format!("{api}/w/stop")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let resp = client.post(format!("{api}/w/stop")).send().await.unwrap();
    assert_eq!(resp.status(), 409);

    server.shutdown().await;
}
