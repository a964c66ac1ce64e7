use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use callbox_core::{ConnectionId, ServerMessage};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::AppState;

/// How long a closing connection's writer may keep flushing queued frames.
const WRITER_DRAIN: Duration = Duration::from_secs(1);

pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, remote_addr: SocketAddr) {
    let (connection_id, outbound) = state.hub.attach();
    let (ws_tx, mut ws_rx) = socket.split();
    let mut writer = tokio::spawn(write_frames(connection_id, ws_tx, outbound));

    info!(connection_id = %connection_id, remote_addr = %remote_addr, "client connected");
    state.router.on_connect(connection_id);

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                state.router.on_text(connection_id, &text);
            }
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => {
                    state.router.on_text(connection_id, text);
                }
                Err(_) => {
                    counter!("callbox_signal_errors_total", 1, "kind" => "malformed_message");
                    warn!(
                        connection_id = %connection_id,
                        len = bytes.len(),
                        "dropping non-utf8 binary frame"
                    );
                }
            },
            Ok(Message::Close(frame)) => {
                debug!(
                    connection_id = %connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Err(err) => {
                warn!(connection_id = %connection_id, error = %err, "error receiving frame");
                break;
            }
        }
    }

    state.router.on_disconnect(connection_id);
    state.hub.detach(connection_id);
    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        writer.abort();
    }

    info!(connection_id = %connection_id, remote_addr = %remote_addr, "client disconnected");
}

async fn write_frames(
    connection_id: ConnectionId,
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<ServerMessage>,
) {
    while let Some(message) = outbound.recv().await {
        let payload = match serde_json::to_string(&message) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(connection_id = %connection_id, error = %err, "failed to encode frame");
                continue;
            }
        };
        if ws_tx.send(Message::Text(payload)).await.is_err() {
            break;
        }
    }
    let _ = ws_tx.close().await;
    debug!(connection_id = %connection_id, "writer task finished");
}
