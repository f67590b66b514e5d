mod common;

use common::{Script, build_core};
use cowork::config::{Config, ControlPlaneConfig, ControlTokenConfig};
use cowork::control::{CLOSE_AUTH_FAILED, CLOSE_HANDSHAKE_TIMEOUT, CLOSE_RATE_LIMITED, ControlState, start};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::net::SocketAddr;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

fn control_config(tokens: Vec<ControlTokenConfig>) -> ControlPlaneConfig {
    ControlPlaneConfig {
        enabled: true,
        host: "127.0.0.1".into(),
        port: 0,
        tokens,
        ..ControlPlaneConfig::default()
    }
}

fn admin_token() -> Vec<ControlTokenConfig> {
    vec![ControlTokenConfig {
        token: "secret-token".into(),
        scopes: vec!["admin".into()],
    }]
}

async fn spawn_server(config: ControlPlaneConfig, script: Vec<Script>) -> SocketAddr {
    let core = build_core(script, Config::default());
    let state = ControlState::new(core.daemon.clone(), config);
    let (_handle, addr) = start(state).await.unwrap();
    addr
}

async fn ws_connect(addr: SocketAddr) -> WsClient {
    let (client, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    client
}

async fn recv_json(client: &mut WsClient) -> Value {
    loop {
        match client.next().await.expect("stream open").expect("frame ok") {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Receive until the connection closes; return the close code if present.
async fn recv_close_code(client: &mut WsClient) -> Option<u16> {
    loop {
        match client.next().await {
            Some(Ok(Message::Close(frame))) => {
                return frame.map(|f| u16::from(f.code));
            }
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return None,
        }
    }
}

async fn send_connect(client: &mut WsClient, id: u64, token: &str) {
    let frame = json!({
        "type": "req",
        "id": id,
        "method": "connect",
        "params": {"token": token, "deviceName": "test-client"},
    });
    client
        .send(Message::Text(frame.to_string().into()))
        .await
        .unwrap();
}

async fn send_request(client: &mut WsClient, id: u64, method: &str, params: Value) {
    let frame = json!({"type": "req", "id": id, "method": method, "params": params});
    client
        .send(Message::Text(frame.to_string().into()))
        .await
        .unwrap();
}

#[tokio::test]
async fn challenge_arrives_first_with_seq_zero() {
    let addr = spawn_server(control_config(admin_token()), vec![]).await;
    let mut client = ws_connect(addr).await;
    let challenge = recv_json(&mut client).await;
    assert_eq!(challenge["type"], "event");
    assert_eq!(challenge["event"], "connect.challenge");
    assert_eq!(challenge["seq"], 0);
    assert!(challenge["payload"]["nonce"].is_string());
}

#[tokio::test]
async fn authenticated_client_can_call_methods() {
    let addr = spawn_server(control_config(admin_token()), vec![]).await;
    let mut client = ws_connect(addr).await;
    let _challenge = recv_json(&mut client).await;

    send_connect(&mut client, 1, "secret-token").await;
    let response = recv_json(&mut client).await;
    assert_eq!(response["ok"], true);
    assert_eq!(response["payload"]["scopes"][0], "admin");

    send_request(&mut client, 2, "ping", json!({})).await;
    let pong = recv_json(&mut client).await;
    assert_eq!(pong["id"], 2);
    assert_eq!(pong["payload"]["pong"], true);

    send_request(&mut client, 3, "nope.method", json!({})).await;
    let err = recv_json(&mut client).await;
    assert_eq!(err["ok"], false);
    assert_eq!(err["error"]["code"], "UNKNOWN_METHOD");
}

#[tokio::test]
async fn methods_before_auth_are_unauthorized() {
    let addr = spawn_server(control_config(admin_token()), vec![]).await;
    let mut client = ws_connect(addr).await;
    let _challenge = recv_json(&mut client).await;

    send_request(&mut client, 1, "task.list", json!({})).await;
    let err = recv_json(&mut client).await;
    assert_eq!(err["ok"], false);
    assert_eq!(err["error"]["code"], "UNAUTHORIZED");
}

/// Spec scenario: control plane lockout. Five wrong tokens close the
/// socket with 4001; a correct token inside the ban window is rejected and
/// the socket closed with 4029.
#[tokio::test]
async fn auth_lockout_bans_the_address() {
    let addr = spawn_server(control_config(admin_token()), vec![]).await;

    // Four failures across individual sockets, each answered UNAUTHORIZED
    for attempt in 0..4 {
        let mut client = ws_connect(addr).await;
        let _challenge = recv_json(&mut client).await;
        send_connect(&mut client, attempt, "wrong-token").await;
        let response = recv_json(&mut client).await;
        assert_eq!(response["ok"], false, "attempt {attempt}");
        assert_eq!(response["error"]["code"], "UNAUTHORIZED");
    }

    // Fifth failure triggers the ban and closes with 4001
    let mut client = ws_connect(addr).await;
    let _challenge = recv_json(&mut client).await;
    send_connect(&mut client, 5, "wrong-token").await;
    let response = recv_json(&mut client).await;
    assert_eq!(response["error"]["code"], "UNAUTHORIZED");
    assert_eq!(recv_close_code(&mut client).await, Some(CLOSE_AUTH_FAILED));

    // Correct token during the ban window: rejected, closed with 4029
    let mut client = ws_connect(addr).await;
    let _challenge = recv_json(&mut client).await;
    send_connect(&mut client, 6, "secret-token").await;
    let response = recv_json(&mut client).await;
    assert_eq!(response["ok"], false);
    assert_eq!(response["error"]["code"], "UNAUTHORIZED");
    assert_eq!(recv_close_code(&mut client).await, Some(CLOSE_RATE_LIMITED));
}

#[tokio::test]
async fn handshake_timeout_closes_with_distinct_code() {
    let config = ControlPlaneConfig {
        handshake_timeout_secs: 1,
        ..control_config(admin_token())
    };
    let addr = spawn_server(config, vec![]).await;
    let mut client = ws_connect(addr).await;
    let _challenge = recv_json(&mut client).await;
    // Say nothing and wait for the timer
    assert_eq!(
        recv_close_code(&mut client).await,
        Some(CLOSE_HANDSHAKE_TIMEOUT)
    );
}

#[tokio::test]
async fn task_events_stream_with_monotonic_seq() {
    let addr = spawn_server(
        control_config(admin_token()),
        vec![Script::Text("done".into())],
    )
    .await;
    let mut client = ws_connect(addr).await;
    let _challenge = recv_json(&mut client).await;
    send_connect(&mut client, 1, "secret-token").await;
    let _response = recv_json(&mut client).await;

    send_request(&mut client, 2, "task.create", json!({"prompt": "quick job"})).await;

    let mut last_seq: i64 = 0; // challenge was 0
    let mut saw_terminal = false;
    for _ in 0..50 {
        let frame = recv_json(&mut client).await;
        match frame["type"].as_str() {
            Some("event") => {
                let seq = frame["seq"].as_i64().unwrap();
                assert!(seq > last_seq, "event seq must be strictly monotonic");
                last_seq = seq;
                if frame["event"] == "task.event"
                    && frame["payload"]["kind"] == "task_completed"
                {
                    saw_terminal = true;
                    break;
                }
            }
            Some("res") => {
                assert_eq!(frame["ok"], true);
            }
            _ => {}
        }
    }
    assert!(saw_terminal, "terminal event was broadcast to the client");
}

#[tokio::test]
async fn oversized_frame_closes_the_socket() {
    let config = ControlPlaneConfig {
        max_frame_bytes: 1024,
        ..control_config(admin_token())
    };
    let addr = spawn_server(config, vec![]).await;
    let mut client = ws_connect(addr).await;
    let _challenge = recv_json(&mut client).await;

    let huge = "x".repeat(4096);
    let frame = json!({"type": "req", "id": 1, "method": "connect", "params": {"token": huge}});
    let _ = client.send(Message::Text(frame.to_string().into())).await;

    // The server drops the connection rather than processing the frame
    let mut closed = false;
    for _ in 0..10 {
        match client.next().await {
            None | Some(Err(_)) | Some(Ok(Message::Close(_))) => {
                closed = true;
                break;
            }
            Some(Ok(_)) => continue,
        }
    }
    assert!(closed, "oversized frame must close the socket");
}

#[tokio::test]
async fn scoped_token_cannot_cross_scopes() {
    let tokens = vec![ControlTokenConfig {
        token: "tasks-only".into(),
        scopes: vec!["tasks".into()],
    }];
    let addr = spawn_server(control_config(tokens), vec![Script::Text("ok".into())]).await;
    let mut client = ws_connect(addr).await;
    let _challenge = recv_json(&mut client).await;
    send_connect(&mut client, 1, "tasks-only").await;
    let response = recv_json(&mut client).await;
    assert_eq!(response["ok"], true);

    send_request(&mut client, 2, "approval.list", json!({})).await;
    let denied = recv_json(&mut client).await;
    assert_eq!(denied["ok"], false);
    assert_eq!(denied["error"]["code"], "FORBIDDEN");

    send_request(&mut client, 3, "task.list", json!({})).await;
    let allowed = recv_json(&mut client).await;
    assert_eq!(allowed["ok"], true);
}

#[tokio::test]
async fn health_endpoint_reports_clients() {
    let addr = spawn_server(control_config(admin_token()), vec![]).await;
    let body: Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["timestamp"].is_string());
    assert!(body["clients"].is_number());
}
