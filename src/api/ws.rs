use crate::api::AppState;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Per-subscriber send budget; a subscriber slower than this is dropped
/// rather than allowed to stall the fan-out.
const SEND_TIMEOUT: Duration = Duration::from_secs(1);

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// One WebSocket subscriber: forwards hub broadcasts as JSON text frames
/// and answers `"ping"` with `"pong"`.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.hub.subscribe();
    info!(
        "WebSocket client connected ({} total)",
        state.hub.subscriber_count()
    );

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if text.trim().eq_ignore_ascii_case("ping") {
                            if sender.send(Message::Text("pong".to_string())).await.is_err() {
                                break;
                            }
                        }
                        // Other client text is ignored; this is a fan-out socket
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sender.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
            broadcast = rx.recv() => {
                match broadcast {
                    Ok(message) => {
                        let json = match serde_json::to_string(&message) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!("Failed to serialize {}: {}", message.kind(), e);
                                continue;
                            }
                        };

                        // A slow subscriber must never block the others
                        match tokio::time::timeout(
                            SEND_TIMEOUT,
                            sender.send(Message::Text(json)),
                        )
                        .await
                        {
                            Ok(Ok(())) => {}
                            Ok(Err(_)) => break,
                            Err(_) => {
                                warn!("WebSocket subscriber too slow, dropping connection");
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("WebSocket subscriber lagged, {} messages dropped", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    debug!("WebSocket client disconnected");
}
