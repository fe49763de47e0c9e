//! Router-level tests: requests go through the axum router with in-process
//! fake agents registered directly in the registry.

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use backhaul_control::{DisconnectPolicy, Resolution, TunnelSocket, SOCKET_CHANNEL_CAPACITY};
use backhaul_proto::{Capability, Mode, TunnelMessage, TunnelReply};
use backhaul_server::{build_router, ProxyConfig, ProxyState};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tower::ServiceExt;

fn setup(config: ProxyConfig) -> (ProxyState, Router) {
    tracing_subscriber::fmt()
        .with_test_writer()
        .try_init()
        .ok();

    let state = ProxyState::new(config);
    let router = build_router(state.clone());
    (state, router)
}

/// Register a fake agent; returns the frames it receives
async fn fake_agent(state: &ProxyState, capability: Capability) -> (TunnelSocket, mpsc::Receiver<String>) {
    let (socket, rx) = TunnelSocket::new(capability);
    state.registry.register(socket.clone()).await;
    (socket, rx)
}

/// Fake agent answering every request with `status` and an echo of the message
fn spawn_echo_agent(state: &ProxyState, mut rx: mpsc::Receiver<String>, status: u16, delay: Duration) {
    let table = state.table.clone();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let msg = TunnelMessage::from_json(&frame).unwrap();
            let table = table.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                table.route(TunnelReply::Response {
                    id: msg.id.clone(),
                    status_code: Some(status),
                    data: Some(json!({
                        "endpoint": msg.endpoint,
                        "method": msg.method,
                        "message": msg.message,
                        "headers": msg.headers,
                    })),
                });
            });
        }
    });
}

/// Register an agent whose outbound queue is full and never drained
async fn stalled_agent(state: &ProxyState, capability: Capability) -> (TunnelSocket, mpsc::Receiver<String>) {
    let (socket, rx) = fake_agent(state, capability).await;
    for n in 0..SOCKET_CHANNEL_CAPACITY {
        socket.send_text(format!("{{\"id\":\"backlog-{}\"}}", n)).unwrap();
    }
    (socket, rx)
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_no_agents_returns_503() {
    let (state, router) = setup(ProxyConfig::default());

    let response = router
        .oneshot(Request::get("/api/items").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_body(response).await["error"], "No agents available");
    assert!(state.table.is_empty());
}

#[tokio::test]
async fn test_happy_path_single() {
    let (state, router) = setup(ProxyConfig::default());
    let (_socket, rx) = fake_agent(&state, Capability::Regular).await;
    spawn_echo_agent(&state, rx, 201, Duration::ZERO);

    let response = router
        .oneshot(
            Request::post("/api/items?page=2")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"name":"widget"}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let body = json_body(response).await;
    assert_eq!(body["endpoint"], "/api/items?page=2");
    assert_eq!(body["method"], "POST");
    assert_eq!(body["message"], json!({"name": "widget"}));
    assert!(state.table.is_empty());
}

#[tokio::test]
async fn test_fan_out_first_reply_wins() {
    let (state, router) = setup(ProxyConfig::default());
    // The first registered agent is the slow one: arrival order decides
    let (_slow, slow_rx) = fake_agent(&state, Capability::Regular).await;
    let (_fast, fast_rx) = fake_agent(&state, Capability::Regular).await;
    spawn_echo_agent(&state, slow_rx, 418, Duration::from_millis(300));
    spawn_echo_agent(&state, fast_rx, 200, Duration::from_millis(10));

    let response = router
        .oneshot(Request::get("/race").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    // The late reply arrives after the entry is gone and is dropped
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(state.table.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_silent_agent_times_out() {
    let (state, router) = setup(ProxyConfig {
        request_timeout: Duration::from_secs(10),
        ..Default::default()
    });
    let (_socket, mut rx) = fake_agent(&state, Capability::Regular).await;

    let response = router
        .oneshot(Request::get("/slow").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(
        json_body(response).await["error"],
        "Timeout waiting for agent response"
    );
    assert!(state.table.is_empty());

    // A reply after the deadline finds nothing to resolve
    let msg = TunnelMessage::from_json(&rx.recv().await.unwrap()).unwrap();
    let late = state.table.route(TunnelReply::Response {
        id: msg.id,
        status_code: Some(200),
        data: None,
    });
    assert_eq!(late, Resolution::Dropped);
}

#[tokio::test]
async fn test_dead_socket_is_pruned() {
    let (state, router) = setup(ProxyConfig::default());
    let (_dead, dead_rx) = fake_agent(&state, Capability::Regular).await;
    drop(dead_rx);
    let (_live, live_rx) = fake_agent(&state, Capability::Regular).await;
    spawn_echo_agent(&state, live_rx, 200, Duration::ZERO);

    let response = router
        .clone()
        .oneshot(Request::get("/ping").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let health = router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(json_body(health).await["regular_clients"], 1);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_agent_does_not_block_healthy_one() {
    let (state, router) = setup(ProxyConfig {
        request_timeout: Duration::from_secs(1),
        ..Default::default()
    });
    // Registered first, so it is the first fan-out target
    let (_stalled, _stalled_rx) = stalled_agent(&state, Capability::Regular).await;
    let (_live, live_rx) = fake_agent(&state, Capability::Regular).await;
    spawn_echo_agent(&state, live_rx, 200, Duration::ZERO);

    let response = tokio::time::timeout(
        Duration::from_secs(60),
        router.oneshot(Request::get("/x").body(Body::empty()).unwrap()),
    )
    .await
    .expect("request must finish")
    .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["endpoint"], "/x");
    // Stalled is not dead: it stays registered
    assert_eq!(state.registry.counts().await.regular, 2);
    assert!(state.table.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_only_stalled_agents_fail_fast_with_503() {
    let (state, router) = setup(ProxyConfig {
        request_timeout: Duration::from_secs(1),
        ..Default::default()
    });
    let (_stalled, _stalled_rx) = stalled_agent(&state, Capability::Regular).await;

    let response = tokio::time::timeout(
        Duration::from_secs(60),
        router.oneshot(Request::get("/x").body(Body::empty()).unwrap()),
    )
    .await
    .expect("request must finish")
    .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(state.registry.counts().await.regular, 1);
    assert!(state.table.is_empty());
}

#[tokio::test]
async fn test_unusable_status_code_maps_to_502() {
    let (state, router) = setup(ProxyConfig::default());
    let (_socket, mut rx) = fake_agent(&state, Capability::Regular).await;

    let table = state.table.clone();
    tokio::spawn(async move {
        let msg = TunnelMessage::from_json(&rx.recv().await.unwrap()).unwrap();
        let frame = json!({"id": msg.id, "status_code": "200", "data": {"ok": true}});
        table.route(TunnelReply::from_json(&frame.to_string()).unwrap());
    });

    let response = router
        .oneshot(Request::get("/odd").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(json_body(response).await, json!({"ok": true}));
}

#[tokio::test]
async fn test_all_sends_failed_returns_503() {
    let (state, router) = setup(ProxyConfig::default());
    let (_dead, dead_rx) = fake_agent(&state, Capability::Regular).await;
    drop(dead_rx);

    let response = router
        .oneshot(Request::get("/ping").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(state.registry.counts().await.total(), 0);
    assert!(state.table.is_empty());
}

#[tokio::test]
async fn test_malformed_body_sends_nothing() {
    let (state, router) = setup(ProxyConfig::default());
    let (_socket, mut rx) = fake_agent(&state, Capability::Regular).await;

    let response = router
        .oneshot(
            Request::post("/api/items")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(json_body(response).await["error"]
        .as_str()
        .unwrap()
        .starts_with("Invalid JSON body"));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_oversized_body_returns_413() {
    let (state, router) = setup(ProxyConfig {
        max_body_bytes: 32,
        ..Default::default()
    });
    let (_socket, mut rx) = fake_agent(&state, Capability::Regular).await;

    let big = format!("{{\"blob\":\"{}\"}}", "x".repeat(64));
    let response = router
        .oneshot(Request::post("/upload").body(Body::from(big)).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_only_allow_listed_headers_forwarded() {
    let (state, router) = setup(ProxyConfig::default());
    let (_socket, rx) = fake_agent(&state, Capability::Regular).await;
    spawn_echo_agent(&state, rx, 200, Duration::ZERO);

    let response = router
        .oneshot(
            Request::get("/me")
                .header(header::AUTHORIZATION, "Bearer token")
                .header(header::COOKIE, "session=secret")
                .header("x-forwarded-for", "10.0.0.1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let body = json_body(response).await;
    assert_eq!(body["headers"], json!({"authorization": "Bearer token"}));
    assert_eq!(body["message"], Value::Null);
}

#[tokio::test]
async fn test_prefix_is_stripped_and_enforced() {
    let (state, router) = setup(ProxyConfig {
        path_prefix: Some("/proxy".to_string()),
        ..Default::default()
    });
    let (_socket, rx) = fake_agent(&state, Capability::Regular).await;
    spawn_echo_agent(&state, rx, 200, Duration::ZERO);

    let response = router
        .clone()
        .oneshot(Request::get("/proxy/users/7").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["endpoint"], "/users/7");

    let outside = router
        .clone()
        .oneshot(Request::get("/users/7").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(outside.status(), StatusCode::NOT_FOUND);

    let health = router
        .oneshot(Request::get("/proxy/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    assert_eq!(json_body(health).await["status"], "ok");
}

#[tokio::test]
async fn test_fail_fast_disconnect_returns_502() {
    let (state, router) = setup(ProxyConfig {
        disconnect_policy: DisconnectPolicy::FailFast,
        ..Default::default()
    });
    let (socket, mut rx) = fake_agent(&state, Capability::Regular).await;

    let agent_state = state.clone();
    tokio::spawn(async move {
        // Receive the request, then vanish without replying
        rx.recv().await.unwrap();
        agent_state.registry.unregister(socket.id()).await;
        agent_state
            .table
            .release_socket(socket.id(), DisconnectPolicy::FailFast);
    });

    let response = router
        .oneshot(Request::get("/doomed").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert!(state.table.is_empty());
}

#[tokio::test]
async fn test_health_reports_counts() {
    let (state, router) = setup(ProxyConfig::default());
    let (_a, _rx_a) = fake_agent(&state, Capability::Regular).await;
    let (_b, _rx_b) = fake_agent(&state, Capability::Regular).await;
    let (_c, _rx_c) = fake_agent(&state, Capability::Stream).await;

    let response = router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["regular_clients"], 2);
    assert_eq!(body["stream_clients"], 1);
    assert_eq!(body["active_streams"], 0);
    assert_eq!(body["pending_requests"], 0);
    assert_eq!(body["protocol_version"], backhaul_proto::PROTOCOL_VERSION);
}

#[tokio::test]
async fn test_openapi_document_served() {
    let (_state, router) = setup(ProxyConfig::default());

    let response = router
        .oneshot(Request::get("/api/openapi.json").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert!(body["paths"]["/health"].is_object());
}

mod streaming {
    use super::*;
    use backhaul_control::StreamChunk;

    async fn next_text(body: &mut Body) -> Option<String> {
        let frame = body.frame().await?.ok()?;
        let data = frame.into_data().ok()?;
        Some(String::from_utf8(data.to_vec()).unwrap())
    }

    fn sse_request(path: &str) -> Request<Body> {
        Request::get(path)
            .header(header::ACCEPT, "text/event-stream")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_stream_lifecycle() {
        let (state, router) = setup(ProxyConfig::default());
        let (_regular, mut regular_rx) = fake_agent(&state, Capability::Regular).await;
        let (_stream, mut stream_rx) = fake_agent(&state, Capability::Stream).await;

        let response = router.oneshot(sse_request("/events")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );

        // Only the stream agent saw the request
        let frame = stream_rx.recv().await.unwrap();
        let msg = TunnelMessage::from_json(&frame).unwrap();
        assert_eq!(msg.mode, Mode::Stream);
        assert!(regular_rx.try_recv().is_err());
        assert_eq!(state.table.active_streams(), 1);

        state.table.route(TunnelReply::Chunk {
            id: msg.id.clone(),
            event: "data: one\n\n".into(),
        });
        state.table.route(TunnelReply::Chunk {
            id: msg.id.clone(),
            event: "data: two".into(),
        });
        state.table.route(TunnelReply::End { id: msg.id.clone() });

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(
            String::from_utf8(bytes.to_vec()).unwrap(),
            ": connected\n\ndata: one\n\ndata: two\n\n"
        );
        assert!(!state.table.is_open(&msg.id));
    }

    #[tokio::test]
    async fn test_no_stream_agent_returns_503() {
        let (state, router) = setup(ProxyConfig::default());
        let (_regular, _rx) = fake_agent(&state, Capability::Regular).await;

        let response = router.oneshot(sse_request("/events")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_stream_agent_is_passed_over() {
        let (state, router) = setup(ProxyConfig::default());
        let (_stalled, _stalled_rx) = stalled_agent(&state, Capability::Stream).await;
        let (_healthy, mut healthy_rx) = fake_agent(&state, Capability::Stream).await;

        let response = tokio::time::timeout(
            Duration::from_secs(60),
            router.oneshot(sse_request("/events")),
        )
        .await
        .expect("stream must open")
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let msg = TunnelMessage::from_json(&healthy_rx.recv().await.unwrap()).unwrap();
        assert_eq!(msg.mode, Mode::Stream);
        assert_eq!(state.registry.counts().await.stream, 2);

        state.table.route(TunnelReply::End { id: msg.id });
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b": connected\n\n");
    }

    #[tokio::test]
    async fn test_strict_namespace_routes_outside_paths_as_single() {
        let (state, router) = setup(ProxyConfig {
            stream_namespace: Some("/events".to_string()),
            ..Default::default()
        });
        let (_regular, regular_rx) = fake_agent(&state, Capability::Regular).await;
        let (_stream, mut stream_rx) = fake_agent(&state, Capability::Stream).await;
        spawn_echo_agent(&state, regular_rx, 200, Duration::ZERO);

        let response = router.oneshot(sse_request("/api/feed")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["endpoint"], "/api/feed");
        assert!(stream_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_stream_gets_keep_alive() {
        let (state, router) = setup(ProxyConfig {
            heartbeat_interval: Duration::from_secs(15),
            ..Default::default()
        });
        let (_stream, mut stream_rx) = fake_agent(&state, Capability::Stream).await;

        let response = router.oneshot(sse_request("/events")).await.unwrap();
        let msg = TunnelMessage::from_json(&stream_rx.recv().await.unwrap()).unwrap();
        let mut body = response.into_body();

        assert_eq!(next_text(&mut body).await.as_deref(), Some(": connected\n\n"));
        assert_eq!(next_text(&mut body).await.as_deref(), Some(": keep-alive\n\n"));

        state
            .table
            .feed(&msg.id, StreamChunk::Event("data: hi\n\n".into()));
        assert_eq!(next_text(&mut body).await.as_deref(), Some("data: hi\n\n"));
    }

    #[tokio::test]
    async fn test_client_disconnect_closes_entry() {
        let (state, router) = setup(ProxyConfig::default());
        let (_stream, mut stream_rx) = fake_agent(&state, Capability::Stream).await;

        let response = router.oneshot(sse_request("/events")).await.unwrap();
        let msg = TunnelMessage::from_json(&stream_rx.recv().await.unwrap()).unwrap();
        assert!(state.table.is_open(&msg.id));

        drop(response);

        assert!(!state.table.is_open(&msg.id));
        // Chunks arriving afterwards are dropped
        state.table.route(TunnelReply::Chunk {
            id: msg.id,
            event: "data: late\n\n".into(),
        });
        assert!(state.table.is_empty());
    }

    #[tokio::test]
    async fn test_owner_loss_ends_stream() {
        let (state, router) = setup(ProxyConfig::default());
        let (stream, mut stream_rx) = fake_agent(&state, Capability::Stream).await;

        let response = router.oneshot(sse_request("/events")).await.unwrap();
        stream_rx.recv().await.unwrap();

        state.registry.unregister(stream.id()).await;
        state
            .table
            .release_socket(stream.id(), DisconnectPolicy::AwaitTimeout);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b": connected\n\n");
        assert!(state.table.is_empty());
    }
}
