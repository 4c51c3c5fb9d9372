use super::*;
use std::collections::HashMap;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Query, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde_json::json;
use shared::protocol::{ProgressUpdate, PROGRESS_EVENT, SOCKET_IO_PATH};
use tokio::net::TcpListener;

fn handshake() -> String {
    SocketIoFrame::Open(EngineHandshake {
        sid: "engine-sid".into(),
        upgrades: Vec::new(),
        ping_interval: 25_000,
        ping_timeout: 20_000,
        max_payload: 1_000_000,
    })
    .encode()
}

fn progress_frame(progress: i64) -> String {
    SocketIoFrame::event(PROGRESS_EVENT, json!({ "progress": progress })).encode()
}

async fn recv_text(socket: &mut WebSocket) -> Option<String> {
    while let Some(Ok(msg)) = socket.recv().await {
        if let WsMessage::Text(text) = msg {
            return Some(text);
        }
    }
    None
}

async fn send_text(socket: &mut WebSocket, text: String) -> bool {
    socket.send(WsMessage::Text(text)).await.is_ok()
}

/// Opens the engine session and waits for the client to join `/`.
async fn accept_namespace(socket: &mut WebSocket) -> bool {
    if !send_text(socket, handshake()).await {
        return false;
    }
    if recv_text(socket).await.as_deref() != Some("40") {
        return false;
    }
    send_text(socket, r#"40{"sid":"socket-sid"}"#.to_string()).await
}

async fn push_progress(mut socket: WebSocket) {
    if !accept_namespace(&mut socket).await {
        return;
    }
    // heartbeat first: nothing is pushed until the client answers the ping
    if !send_text(&mut socket, "2".into()).await || recv_text(&mut socket).await.as_deref() != Some("3") {
        return;
    }
    let frames = [
        r#"42["connected",{}]"#.to_string(),
        progress_frame(0),
        "garbage".to_string(),
        r#"42/admin,["progress_update",{"progress":77}]"#.to_string(),
        progress_frame(42),
        progress_frame(100),
    ];
    for frame in frames {
        if !send_text(&mut socket, frame).await {
            return;
        }
    }
    // keep the socket open until the client goes away
    while let Some(Ok(_)) = socket.recv().await {}
}

async fn reject(mut socket: WebSocket) {
    if !send_text(&mut socket, handshake()).await {
        return;
    }
    if recv_text(&mut socket).await.as_deref() == Some("40") {
        let _ = send_text(&mut socket, r#"44{"message":"not allowed"}"#.to_string()).await;
    }
}

async fn socket_io_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let websocket_transport = query.get("transport").map(String::as_str) == Some("websocket");
    if query.get("EIO").map(String::as_str) != Some("4") || !websocket_transport {
        return StatusCode::BAD_REQUEST.into_response();
    }
    if query.contains_key("reject") {
        return ws.on_upgrade(reject).into_response();
    }
    ws.on_upgrade(push_progress).into_response()
}

async fn spawn_push_server() -> anyhow::Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = Router::new().route(SOCKET_IO_PATH, get(socket_io_handler));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("ws://{addr}{SOCKET_IO_PATH}?EIO=4&transport=websocket"))
}

#[tokio::test]
async fn socket_io_events_become_progress_events() {
    let ws_url = spawn_push_server().await.expect("spawn server");
    let channel = WsProgressChannel::new(ws_url);
    let mut rx = channel.subscribe();
    channel.connect().await.expect("connect");

    let mut received = Vec::new();
    for _ in 0..3 {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event in time")
            .expect("open channel");
        received.push(event);
    }

    // unknown events, undecodable frames and other namespaces never surface
    assert_eq!(
        received,
        vec![
            PushEvent::ProgressUpdate(ProgressUpdate::new(0)),
            PushEvent::ProgressUpdate(ProgressUpdate::new(42)),
            PushEvent::ProgressUpdate(ProgressUpdate::new(100)),
        ]
    );
    channel.close().await;
}

#[tokio::test]
async fn rejected_namespace_join_fails_connect() {
    let ws_url = spawn_push_server().await.expect("spawn server");
    let channel = WsProgressChannel::new(format!("{ws_url}&reject=1"));

    let err = channel.connect().await.expect_err("rejected");
    assert!(
        format!("{err:#}").contains("not allowed"),
        "unexpected error: {err:#}"
    );
}

#[tokio::test]
async fn connect_fails_when_nothing_listens() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let channel = WsProgressChannel::new(format!("ws://{addr}{SOCKET_IO_PATH}?EIO=4&transport=websocket"));
    let err = channel.connect().await.expect_err("refused");
    assert!(err.to_string().contains("failed to connect websocket"));
}

#[tokio::test]
async fn local_channel_reaches_every_subscriber() {
    let channel = LocalProgressChannel::new();
    let mut first = channel.subscribe();
    let mut second = channel.subscribe();

    let event = PushEvent::ProgressUpdate(ProgressUpdate::new(5));
    assert_eq!(channel.publish(event.clone()), 2);
    assert_eq!(first.recv().await.expect("first"), event);
    assert_eq!(second.recv().await.expect("second"), event);
}
