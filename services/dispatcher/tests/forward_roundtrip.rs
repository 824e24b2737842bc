//! End-to-end routing through real WebSocket sessions.
//!
//! Spins up an in-process fake backend (axum), points the dispatcher's
//! upstream pool at it, serves the frontend endpoint on an ephemeral port,
//! and drives a real frontend client through the full matrix: routed message
//! forwarding with prefix strip, transparent api_call forwarding, response
//! correlation in both directions, and synthesized meta-command replies.

use axum::{
    Router,
    extract::{
        State,
        ws::{Message as AxMessage, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use dispatcher::config::load_config_from_str;
use dispatcher::db::Db;
use dispatcher::dispatcher::Dispatcher;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::Message;

// ---------------------------------------------------------------------------
// Fake backend
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct BackendState {
    received_tx: mpsc::UnboundedSender<Value>,
    push_tx: broadcast::Sender<String>,
}

async fn backend_handler(
    ws: WebSocketUpgrade,
    State(state): State<BackendState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| backend_session(socket, state))
}

async fn backend_session(mut socket: WebSocket, state: BackendState) {
    let mut push_rx = state.push_tx.subscribe();
    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(AxMessage::Text(text))) => {
                        if let Ok(frame) = serde_json::from_str::<Value>(&text) {
                            let _ = state.received_tx.send(frame);
                        }
                    }
                    Some(Ok(AxMessage::Ping(data))) => {
                        let _ = socket.send(AxMessage::Pong(data)).await;
                    }
                    Some(Ok(AxMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            frame = push_rx.recv() => {
                let Ok(frame) = frame else { break; };
                if socket.send(AxMessage::Text(frame.into())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Returns the backend's ws URL, a receiver of frames it got, and a sender
/// that pushes frames down to the connected dispatcher.
async fn spawn_backend() -> (String, mpsc::UnboundedReceiver<Value>, broadcast::Sender<String>) {
    let (received_tx, received_rx) = mpsc::unbounded_channel();
    let (push_tx, _) = broadcast::channel(64);
    let state = BackendState {
        received_tx,
        push_tx: push_tx.clone(),
    };
    let app = Router::new()
        .route("/ws", get(backend_handler))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind backend");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve backend");
    });
    (format!("ws://{addr}/ws"), received_rx, push_tx)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn recv_backend(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("backend frame within 5s")
        .expect("backend channel open")
}

async fn recv_frontend<S>(ws: &mut S) -> Value
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str::<Value>(&text).expect("frontend JSON");
                }
                Some(Ok(_)) => continue,
                other => panic!("frontend stream ended: {other:?}"),
            }
        }
    })
    .await
    .expect("frontend frame within 5s")
}

async fn wait_until_connected(dispatcher: &Dispatcher) {
    for _ in 0..100 {
        if dispatcher.snapshot_stats().await.connections.connected == 1 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("upstream never connected");
}

fn config_toml(backend_url: &str) -> String {
    format!(
        r#"
schema_version = 1

[[connections]]
id = "c1"
url = "{backend_url}"
reconnect_interval_s = 1

[[command_sets]]
id = "A"
name = "bot1"
prefix = "bot1"
is_public = true
target_ws = "c1"
strip_prefix = true

  [[command_sets.commands]]
  name = "/info"

[final_rule]
action = "reject"
message = "未知指令"
send_message = true
"#
    )
}

// ---------------------------------------------------------------------------
// The round-trip
// ---------------------------------------------------------------------------

#[tokio::test]
async fn message_routing_and_correlation_roundtrip() {
    let (backend_url, mut backend_rx, push_tx) = spawn_backend().await;

    let cfg = load_config_from_str(&config_toml(&backend_url)).expect("test config");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (dispatcher, upstream_events) =
        Dispatcher::new(cfg, Db::open_in_memory().expect("db"), shutdown_rx.clone());
    dispatcher.start().await;
    tokio::spawn(Arc::clone(&dispatcher).run_upstream_events(upstream_events));
    wait_until_connected(&dispatcher).await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind frontend");
    let frontend_addr = listener.local_addr().expect("local_addr");
    tokio::spawn(dispatcher::frontend::serve(
        listener,
        Arc::clone(&dispatcher),
        shutdown_rx.clone(),
    ));

    let (mut frontend, _) =
        tokio_tungstenite::connect_async(format!("ws://{frontend_addr}/ws"))
            .await
            .expect("frontend connect");

    // 1. A routed message event: forced dispatch strips the set token and the
    //    forwarded frame keeps unknown fields verbatim.
    let event = json!({
        "post_type": "message",
        "message_type": "private",
        "user_id": 42,
        "raw_message": "bot1 /info hello",
        "message": "bot1 /info hello",
        "self_id": 777,
        "time": 1700000000
    });
    frontend
        .send(Message::Text(event.to_string().into()))
        .await
        .expect("send event");
    let routed = recv_backend(&mut backend_rx).await;
    assert_eq!(routed["raw_message"], "/info hello");
    assert_eq!(routed["message"], "/info hello");
    assert_eq!(routed["user_id"], 42);
    assert_eq!(routed["self_id"], 777, "unknown fields must survive");

    // 2. A frontend api_call is forwarded transparently...
    let call = json!({"action": "get_status", "params": {}, "echo": "e1"});
    frontend
        .send(Message::Text(call.to_string().into()))
        .await
        .expect("send call");
    let forwarded = recv_backend(&mut backend_rx).await;
    assert_eq!(forwarded["action"], "get_status");
    assert_eq!(forwarded["echo"], "e1");

    // ...and the backend's response comes back to the originating session.
    let response = json!({"status": "ok", "retcode": 0, "data": {"good": true}, "echo": "e1"});
    push_tx.send(response.to_string()).expect("push response");
    let delivered = recv_frontend(&mut frontend).await;
    assert_eq!(delivered["echo"], "e1");
    assert_eq!(delivered["retcode"], 0);
    assert_eq!(delivered["data"]["good"], true);

    // 3. The reverse path: a backend-originated api_call reaches the
    //    frontend, and the frontend's response is routed back.
    let backend_call = json!({"action": "send_msg", "params": {"x": 1}, "echo": "u1"});
    push_tx.send(backend_call.to_string()).expect("push call");
    let seen = recv_frontend(&mut frontend).await;
    assert_eq!(seen["action"], "send_msg");
    assert_eq!(seen["echo"], "u1");

    let frontend_response = json!({"status": "ok", "retcode": 0, "echo": "u1"});
    frontend
        .send(Message::Text(frontend_response.to_string().into()))
        .await
        .expect("send response");
    let answered = recv_backend(&mut backend_rx).await;
    assert_eq!(answered["echo"], "u1");
    assert_eq!(answered["retcode"], 0);

    // 4. An unmatched message hits the final rule and the dispatcher
    //    synthesizes a reply api_call on the same session.
    let unmatched = json!({
        "post_type": "message",
        "message_type": "private",
        "user_id": 42,
        "raw_message": "no such command"
    });
    frontend
        .send(Message::Text(unmatched.to_string().into()))
        .await
        .expect("send unmatched");
    let reply = recv_frontend(&mut frontend).await;
    assert_eq!(reply["action"], "send_private_msg");
    assert_eq!(reply["params"]["user_id"], 42);
    assert_eq!(reply["params"]["message"], "未知指令");

    // 5. Meta-commands answer with runtime state.
    let status = json!({
        "post_type": "message",
        "message_type": "private",
        "user_id": 42,
        "raw_message": "/status"
    });
    frontend
        .send(Message::Text(status.to_string().into()))
        .await
        .expect("send status");
    let reply = recv_frontend(&mut frontend).await;
    assert_eq!(reply["action"], "send_private_msg");
    let text = reply["params"]["message"].as_str().expect("text reply");
    assert!(text.contains("连接状态: 1/1"), "reply was: {text}");

    let _ = shutdown_tx.send(true);
}
