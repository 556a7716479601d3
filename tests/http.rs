//! REST routes through the router, and one real WebSocket relay end to end.

mod common;

use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use common::MockGuacd;
use deskrelay::{routes, AppState};
use futures::{SinkExt, StreamExt};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tower::ServiceExt;

type Socket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn next_text(socket: &mut Socket) -> String {
    let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("timed out waiting for a message")
        .unwrap()
        .unwrap();
    message.to_text().unwrap().to_string()
}

fn app_state(guacd: &str) -> AppState {
    AppState::new(common::config(guacd))
}

async fn call(state: &AppState, request: Request<Body>) -> (StatusCode, Value) {
    let response = routes::router(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn delete(uri: &str) -> Request<Body> {
    Request::delete(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn health_reports_ok() {
    let state = app_state("127.0.0.1:4822");
    let (status, body) = call(&state, get("/api/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["sessions"], 0);
    assert_eq!(body["assets"], 2);
    assert_eq!(body["guacd"], "127.0.0.1:4822");
}

#[tokio::test]
async fn create_and_inspect_tunnel() {
    let state = app_state("127.0.0.1:4822");
    let (status, body) = call(
        &state,
        post_json("/api/tunnels", &json!({ "asset_id": "win-01", "mode": "read_only" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["asset_id"], "win-01");
    assert_eq!(body["protocol"], "rdp");
    assert_eq!(body["mode"], "read_only");
    let id = body["session_id"].as_str().unwrap().to_string();

    let (status, record) = call(&state, get(&format!("/api/tunnels/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(record["status"], "pending");
    assert_eq!(record["hostname"], "10.0.0.12");
    assert!(record.get("password").is_none());
}

#[tokio::test]
async fn tunnel_errors_use_disconnect_codes() {
    let state = app_state("127.0.0.1:4822");

    let (status, body) =
        call(&state, post_json("/api/tunnels", &json!({ "asset_id": "nope" }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "ASSET_NOT_FOUND");
    assert_eq!(body["status"], 805);

    let (status, body) =
        call(&state, post_json("/api/tunnels", &json!({ "asset_id": "retired" }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "ASSET_NOT_ACTIVE");
    assert_eq!(body["status"], 803);

    let (status, body) = call(&state, get("/api/tunnels/unknown")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "SESSION_NOT_FOUND");
}

#[tokio::test]
async fn session_admin_on_unknown_ids() {
    let state = app_state("127.0.0.1:4822");

    let (status, body) = call(&state, get("/api/sessions")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sessions"], json!([]));

    let (status, body) = call(&state, delete("/api/sessions/unknown")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], 800);

    let (status, _) = call(&state, delete("/api/sessions/unknown/observers/o1")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn websocket_relay_end_to_end() {
    let mut guacd = MockGuacd::start().await;
    let state = app_state(&guacd.address);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = routes::router(state.clone());
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    let record = state
        .relay
        .create_tunnel("win-01", deskrelay::sessions::AccessMode::Interactive)
        .await
        .unwrap();

    let mut request = format!(
        "ws://{addr}/api/tunnels/{}/ws?width=1280&height=720&dpi=120",
        record.id
    )
    .into_client_request()
    .unwrap();
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", "guacamole".parse().unwrap());
    let (mut socket, response) = tokio_tungstenite::connect_async(request).await.unwrap();
    assert_eq!(
        response
            .headers()
            .get("sec-websocket-protocol")
            .and_then(|v| v.to_str().ok()),
        Some("guacamole")
    );

    let mut conn = guacd.next_connection().await;
    assert_eq!(conn.size.args(), ["1280", "720", "120"]);

    assert_eq!(next_text(&mut socket).await, common::uuid_frame(&record.id));

    conn.send("4.sync,3.100;").await;
    assert_eq!(next_text(&mut socket).await, "4.sync,3.100;");

    socket
        .send(Message::text("5.mouse,2.10,2.20,1.0;"))
        .await
        .unwrap();
    let mouse = conn.recv().await.unwrap();
    assert_eq!(mouse.args(), ["10", "20", "0"]);

    let (status, body) = call(&state, get("/api/sessions")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sessions"][0]["session_id"], record.id.as_str());
    assert_eq!(body["sessions"][0]["state"], "active");

    let (status, _) = call(&state, delete(&format!("/api/sessions/{}", record.id))).await;
    assert_eq!(status, StatusCode::OK);
    // error and disconnect travel in one message
    assert_eq!(
        next_text(&mut socket).await,
        "5.error,31.session closed by administrator,3.802;10.disconnect;"
    );
    assert!(conn.recv().await.is_none());
}
