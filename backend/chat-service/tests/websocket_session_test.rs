//! Session state machine over a real websocket: catch-up before live,
//! backlog flush ordering, and supersession at the socket level.

use std::sync::Arc;
use std::time::Duration;

use chat_service::auth::DevVerifier;
use chat_service::config::Config;
use chat_service::routes::build_router;
use chat_service::services::SendTarget;
use chat_service::state::AppState;
use chat_service::store::MemoryStore;
use chat_service::websocket::message_types::ServerEvent;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_server() -> (AppState, String) {
    let state = AppState::new(
        Arc::new(Config::test_defaults()),
        Arc::new(MemoryStore::new()),
        Arc::new(DevVerifier),
    );
    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (state, format!("ws://{addr}/ws"))
}

async fn connect(url: &str, user_id: Uuid) -> WsClient {
    let (socket, _) = tokio_tungstenite::connect_async(format!("{url}?token={user_id}"))
        .await
        .expect("websocket upgrade");
    socket
}

/// The upgrade completes before the server-side registration does; poll so a
/// subsequent send cannot race it.
async fn wait_until_online(state: &AppState, user_id: Uuid) {
    for _ in 0..100 {
        if state.connections.is_online(user_id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("connection never registered");
}

async fn send_frame(socket: &mut WsClient, frame: serde_json::Value) {
    socket
        .send(WsMessage::Text(frame.to_string()))
        .await
        .expect("client send");
}

async fn recv_event(socket: &mut WsClient) -> ServerEvent {
    let deadline = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match socket.next().await.expect("stream ended").expect("read") {
                WsMessage::Text(text) => {
                    return serde_json::from_str::<ServerEvent>(&text).expect("parse frame")
                }
                _ => continue,
            }
        }
    });
    deadline.await.expect("no frame within deadline")
}

#[tokio::test]
async fn sync_response_arrives_before_any_live_push() {
    let (state, url) = spawn_server().await;
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();

    // === STEP 1: A messages B while B is offline ===
    state
        .engine
        .send_message(a, SendTarget::Recipient(b), "m1", None)
        .await
        .unwrap();

    // === STEP 2: B connects and syncs ===
    let mut socket = connect(&url, b).await;
    wait_until_online(&state, b).await;
    send_frame(&mut socket, json!({ "type": "sync:request" })).await;

    match recv_event(&mut socket).await {
        ServerEvent::SyncResponse { payload } => {
            assert_eq!(payload.conversations.len(), 1);
            assert_eq!(payload.conversations[0].messages[0].content, "m1");
        }
        other => panic!("expected sync:response first, got {other:?}"),
    }

    // The push parked while offline drains right after the catch-up batch.
    match recv_event(&mut socket).await {
        ServerEvent::MessageNew { message } => assert_eq!(message.content, "m1"),
        other => panic!("expected queued backlog, got {other:?}"),
    }

    // === STEP 3: a live send reaches the now-live session ===
    state
        .engine
        .send_message(a, SendTarget::Recipient(b), "m2", None)
        .await
        .unwrap();
    match recv_event(&mut socket).await {
        ServerEvent::MessageNew { message } => assert_eq!(message.content, "m2"),
        other => panic!("expected live push, got {other:?}"),
    }
}

#[tokio::test]
async fn heartbeat_only_client_still_receives_pushes_in_order() {
    let (state, url) = spawn_server().await;
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();

    let mut socket = connect(&url, b).await;
    wait_until_online(&state, b).await;

    // Pushes land before the client has sent any frame.
    state
        .engine
        .send_message(a, SendTarget::Recipient(b), "x", None)
        .await
        .unwrap();
    state
        .engine
        .send_message(a, SendTarget::Recipient(b), "y", None)
        .await
        .unwrap();

    // A heartbeat is the client's first frame; it must flush the buffer.
    send_frame(&mut socket, json!({ "type": "heartbeat" })).await;

    match recv_event(&mut socket).await {
        ServerEvent::MessageNew { message } => assert_eq!(message.content, "x"),
        other => panic!("expected first buffered push, got {other:?}"),
    }
    match recv_event(&mut socket).await {
        ServerEvent::MessageNew { message } => assert_eq!(message.content, "y"),
        other => panic!("expected second buffered push, got {other:?}"),
    }

    state
        .engine
        .send_message(a, SendTarget::Recipient(b), "z", None)
        .await
        .unwrap();
    match recv_event(&mut socket).await {
        ServerEvent::MessageNew { message } => assert_eq!(message.content, "z"),
        other => panic!("expected live push, got {other:?}"),
    }
}

#[tokio::test]
async fn pre_live_buffer_is_bounded_like_the_offline_queue() {
    let (state, url) = spawn_server().await;
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let capacity = state.config.offline_queue_capacity;

    let mut socket = connect(&url, b).await;
    wait_until_online(&state, b).await;

    // Two more pushes than the buffer holds, all before the first frame.
    for i in 0..capacity + 2 {
        state
            .engine
            .send_message(a, SendTarget::Recipient(b), &format!("m{i}"), None)
            .await
            .unwrap();
    }
    // Let the session task park them before the flush is triggered.
    tokio::time::sleep(Duration::from_millis(100)).await;

    send_frame(&mut socket, json!({ "type": "heartbeat" })).await;

    // The two oldest were evicted; everything kept arrives in order.
    for i in 2..capacity + 2 {
        match recv_event(&mut socket).await {
            ServerEvent::MessageNew { message } => {
                assert_eq!(message.content, format!("m{i}"));
            }
            other => panic!("expected buffered push m{i}, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn second_socket_supersedes_and_the_first_goes_dark() {
    let (state, url) = spawn_server().await;
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();

    let mut first = connect(&url, b).await;
    wait_until_online(&state, b).await;

    let mut second = connect(&url, b).await;

    // The old socket gets the notice, then nothing else.
    match recv_event(&mut first).await {
        ServerEvent::ConnectionSuperseded => {}
        other => panic!("expected superseded notice, got {other:?}"),
    }

    state
        .engine
        .send_message(a, SendTarget::Recipient(b), "after handover", None)
        .await
        .unwrap();
    send_frame(&mut second, json!({ "type": "heartbeat" })).await;
    match recv_event(&mut second).await {
        ServerEvent::MessageNew { message } => {
            assert_eq!(message.content, "after handover");
        }
        other => panic!("expected push on the new socket, got {other:?}"),
    }

    // The superseded socket is closed by the server without seeing the push.
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match first.next().await {
                None | Some(Ok(WsMessage::Close(_))) | Some(Err(_)) => return,
                Some(Ok(WsMessage::Text(text))) => {
                    panic!("unexpected frame on superseded socket: {text}")
                }
                Some(Ok(_)) => continue,
            }
        }
    });
    closed.await.expect("superseded socket never closed");
}

#[tokio::test]
async fn upgrade_without_a_valid_token_is_rejected() {
    let (_state, url) = spawn_server().await;

    let err = tokio_tungstenite::connect_async(format!("{url}?token=not-a-uuid")).await;
    assert!(err.is_err(), "upgrade must fail before the socket opens");

    let err = tokio_tungstenite::connect_async(url).await;
    assert!(err.is_err(), "tokenless upgrade must fail");
}
