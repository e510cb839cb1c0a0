use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::VecDeque;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::metrics;
use crate::services::SendTarget;
use crate::state::AppState;
use crate::websocket::message_types::{ClientEvent, ServerEvent};

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

fn bearer_token(params: &WsParams, headers: &HeaderMap) -> Option<String> {
    params.token.clone().or_else(|| {
        headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.strip_prefix("Bearer "))
            .map(|s| s.to_string())
    })
}

/// Upgrade endpoint. The token is verified before the socket opens; an
/// unauthenticated upgrade is rejected with 401 and no connection state is
/// created.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let Some(token) = bearer_token(&params, &headers) else {
        warn!("websocket rejected: no token presented");
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let user_id = match state.verifier.verify(&token) {
        Ok(user_id) => user_id,
        Err(_) => {
            warn!("websocket rejected: token verification failed");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_socket(state, user_id, socket))
}

async fn send_event(sender: &mut SplitSink<WebSocket, WsMessage>, event: &ServerEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(text) => sender.send(WsMessage::Text(text)).await.is_ok(),
        Err(e) => {
            error!(error=%e, "failed to serialize outbound frame");
            true
        }
    }
}

fn error_frame(e: &crate::error::AppError) -> ServerEvent {
    ServerEvent::Error {
        code: e.code().to_string(),
        message: e.to_string(),
    }
}

/// Per-connection session: Connecting (upgrade, done by the time we are
/// here) -> registered -> catch-up -> Live -> Disconnected | Superseded.
///
/// Registration happens before catch-up so pushes racing the reconnect land
/// in the outbound channel instead of being lost; they are buffered and only
/// forwarded once the catch-up batch has been sent, preserving order (a
/// duplicate across the two paths is possible and fine, delivery is
/// at-least-once).
async fn handle_socket(state: AppState, user_id: Uuid, socket: WebSocket) {
    let registration = state.connections.register(user_id);
    let handle = registration.handle;
    let mut rx = registration.receiver;
    info!(%user_id, %handle, "websocket connected");

    if !registration.superseded_prior {
        state.engine.broadcast_presence(user_id, true).await;
    }

    let (mut sender, mut receiver) = socket.split();

    // Not yet caught up: live pushes wait in `pending` until the first
    // client frame settles the catch-up question. The buffer is bounded the
    // same way the offline queue is: oldest evicted first, counted.
    let mut live = false;
    let mut pending: VecDeque<ServerEvent> = VecDeque::new();
    let mut superseded = false;

    'session: loop {
        tokio::select! {
            maybe = rx.recv() => {
                match maybe {
                    Some(ServerEvent::ConnectionSuperseded) => {
                        let _ = send_event(&mut sender, &ServerEvent::ConnectionSuperseded).await;
                        superseded = true;
                        break 'session;
                    }
                    Some(event) if live => {
                        if !send_event(&mut sender, &event).await {
                            break 'session;
                        }
                    }
                    Some(event) => {
                        if state.config.offline_queue_capacity == 0 {
                            metrics::DELIVERY_DROPPED_TOTAL.inc();
                        } else {
                            if pending.len() >= state.config.offline_queue_capacity {
                                pending.pop_front();
                                metrics::QUEUE_EVICTIONS_TOTAL.inc();
                            }
                            pending.push_back(event);
                        }
                    }
                    None => break 'session,
                }
            }

            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        state.connections.heartbeat(user_id, handle);
                        let event = match serde_json::from_str::<ClientEvent>(&text) {
                            Ok(event) => event,
                            Err(e) => {
                                debug!(%user_id, error=%e, "unparseable client frame");
                                let frame = error_frame(&crate::error::AppError::Validation(
                                    "unrecognized frame".into(),
                                ));
                                if !send_event(&mut sender, &frame).await {
                                    break 'session;
                                }
                                continue;
                            }
                        };
                        if !handle_client_event(
                            &state, user_id, event, &mut sender, &mut live, &mut pending,
                        )
                        .await
                        {
                            break 'session;
                        }
                    }
                    Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {
                        state.connections.heartbeat(user_id, handle);
                        // A ping-only client still has to receive its backlog.
                        if !live
                            && !go_live(&state, user_id, None, &mut sender, &mut live, &mut pending)
                                .await
                        {
                            break 'session;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break 'session,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(%user_id, error=%e, "websocket read failed");
                        break 'session;
                    }
                }
            }
        }
    }

    if state.connections.unregister(user_id, handle) {
        info!(%user_id, %handle, "websocket disconnected");
        state.engine.broadcast_presence(user_id, false).await;
    } else if superseded {
        debug!(%user_id, %handle, "superseded session closed");
    }
}

/// Sends the catch-up response, drains the offline queue, flushes buffered
/// live pushes, and flips the session to Live. Order: catch-up first, queued
/// best-effort pushes second, buffered live pushes last.
async fn go_live(
    state: &AppState,
    user_id: Uuid,
    sync_response: Option<ServerEvent>,
    sender: &mut SplitSink<WebSocket, WsMessage>,
    live: &mut bool,
    pending: &mut VecDeque<ServerEvent>,
) -> bool {
    if let Some(frame) = sync_response {
        if !send_event(sender, &frame).await {
            return false;
        }
    }
    for event in state.connections.drain_queued(user_id) {
        if !send_event(sender, &event).await {
            return false;
        }
    }
    for event in pending.drain(..) {
        if !send_event(sender, &event).await {
            return false;
        }
    }
    *live = true;
    true
}

async fn handle_client_event(
    state: &AppState,
    user_id: Uuid,
    event: ClientEvent,
    sender: &mut SplitSink<WebSocket, WsMessage>,
    live: &mut bool,
    pending: &mut VecDeque<ServerEvent>,
) -> bool {
    match event {
        ClientEvent::SyncRequest { watermarks } => {
            let frame = match state.reconciliation.reconcile(user_id, &watermarks).await {
                Ok(payload) => ServerEvent::SyncResponse { payload },
                Err(e) => {
                    error!(%user_id, error=%e, "reconcile failed");
                    error_frame(&e)
                }
            };
            if !*live {
                go_live(state, user_id, Some(frame), sender, live, pending).await
            } else {
                send_event(sender, &frame).await
            }
        }

        other => {
            // Any first frame settles the catch-up question: the client
            // either synced already or chose to skip the handshake, so the
            // backlog is delivered before the frame is acted on. Without
            // this, a heartbeat-only client would buffer pushes forever.
            if !*live && !go_live(state, user_id, None, sender, live, pending).await {
                return false;
            }
            match other {
                ClientEvent::Heartbeat => true,

                ClientEvent::MessageSend {
                    conversation_id,
                    recipient_id,
                    content,
                    dedup_key,
                } => {
                    let target = match (conversation_id, recipient_id) {
                        (Some(id), _) => SendTarget::Conversation(id),
                        (None, Some(peer)) => SendTarget::Recipient(peer),
                        (None, None) => {
                            let frame = error_frame(&crate::error::AppError::Validation(
                                "message:send requires conversation_id or recipient_id".into(),
                            ));
                            return send_event(sender, &frame).await;
                        }
                    };
                    let frame = match state
                        .engine
                        .send_message(user_id, target, &content, dedup_key.as_deref())
                        .await
                    {
                        Ok(message) => ServerEvent::MessageAck { message, dedup_key },
                        Err(e) => {
                            debug!(%user_id, error=%e, "send rejected");
                            error_frame(&e)
                        }
                    };
                    send_event(sender, &frame).await
                }

                ClientEvent::ConversationRead { conversation_id } => {
                    if let Err(e) = state.engine.mark_read(user_id, conversation_id).await {
                        debug!(%user_id, %conversation_id, error=%e, "mark read rejected");
                        return send_event(sender, &error_frame(&e)).await;
                    }
                    true
                }

                // Handled above.
                ClientEvent::SyncRequest { .. } => true,
            }
        }
    }
}
