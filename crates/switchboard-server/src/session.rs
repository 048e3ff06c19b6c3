//! One client's session, from completed upgrade to disconnect.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::{counter, histogram};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use switchboard_core::{ClientId, DisconnectReason, ServerEvent};

use crate::connection::{ClientConnection, OutboundFrame};
use crate::entry::ServerEntry;
use crate::metrics as names;

/// Run a client session to completion.
///
/// 1. Registers the connection and greets the client with a
///    `connection.established` frame carrying its assigned id.
/// 2. Pumps queued outbound frames onto the socket in FIFO order.
/// 3. Emits every inbound frame upward as a `message` event, decoding JSON
///    where possible and falling back to the raw text.
/// 4. On exit, removes the connection from the table and reports why.
///
/// The kill token ends the session from outside: the heartbeat monitor
/// cancels it to drop an unresponsive peer, and a hard close cancels it when
/// the close frame cannot be queued. The pump cancels it itself after
/// writing a queued close frame, so the frame always reaches the wire before
/// the session unwinds.
#[instrument(skip_all, fields(server_id = %entry.id, client_id = %client_id))]
pub(crate) async fn run_client_session(
    ws: WebSocket,
    entry: Arc<ServerEntry>,
    client_id: ClientId,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (send_tx, mut send_rx) = mpsc::channel::<OutboundFrame>(entry.tuning.send_buffer);
    let kill = CancellationToken::new();
    let connection = Arc::new(ClientConnection::new(
        client_id.clone(),
        send_tx,
        kill.clone(),
    ));

    let started = Instant::now();
    info!("client connected");
    counter!(names::CLIENTS_TOTAL).increment(1);

    if entry.clients.insert(connection.clone()).await.is_some() {
        warn!("generated client id displaced an existing connection");
    }

    // An upgrade can complete after teardown began; such a session must not
    // outlive the server it missed.
    if entry.shutdown.is_shutting_down() {
        let _ = entry.clients.remove(&client_id).await;
        let frame = CloseFrame {
            code: close_code::NORMAL,
            reason: "server closed".into(),
        };
        let _ = ws_tx.send(Message::Close(Some(frame))).await;
        info!("connection arrived during close, turned away");
        return;
    }

    // Greet before any other frame can reach the socket.
    let greeting = serde_json::json!({
        "type": "connection.established",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "data": {
            "clientId": client_id,
            "serverId": entry.id,
        },
    });
    match serde_json::to_string(&greeting) {
        Ok(json) => {
            let _ = ws_tx.send(Message::Text(json.into())).await;
        }
        Err(err) => error!(error = %err, "failed to serialize greeting"),
    }

    entry.touch();
    entry.emit(ServerEvent::client_connected(
        entry.id.clone(),
        client_id.clone(),
    ));

    // Outbound pump: the only writer to the socket after the greeting.
    let pump_kill = kill.clone();
    let pump = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = send_rx.recv() => {
                    match frame {
                        Some(OutboundFrame::Message(text)) => {
                            if ws_tx.send(Message::Text(text.as_str().into())).await.is_err() {
                                break;
                            }
                            counter!(names::MESSAGES_SENT_TOTAL).increment(1);
                        }
                        Some(OutboundFrame::Ping) => {
                            if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                                break;
                            }
                        }
                        Some(OutboundFrame::Close) => {
                            let frame = CloseFrame {
                                code: close_code::NORMAL,
                                reason: "server closed".into(),
                            };
                            let _ = ws_tx.send(Message::Close(Some(frame))).await;
                            pump_kill.cancel();
                            break;
                        }
                        None => break,
                    }
                }
                () = pump_kill.cancelled() => break,
            }
        }
    });

    let mut reason = DisconnectReason::TransportError;
    loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&entry, &client_id, text.as_str());
                    }
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => handle_frame(&entry, &client_id, text),
                        Err(_) => {
                            debug!(len = data.len(), "ignoring non-UTF8 binary frame");
                        }
                    },
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => connection.mark_alive(),
                    Some(Ok(Message::Close(_))) => {
                        reason = DisconnectReason::ClientClosed;
                        break;
                    }
                    Some(Err(err)) => {
                        debug!(error = %err, "socket error");
                        break;
                    }
                    None => break,
                }
            }
            () = kill.cancelled() => {
                reason = DisconnectReason::ServerClosed;
                break;
            }
        }
    }

    // Whoever removes the connection from the table reports the disconnect;
    // an eviction or hard close that got there first already did.
    if entry.clients.remove(&client_id).await.is_some() {
        entry.emit(ServerEvent::client_disconnected(
            entry.id.clone(),
            client_id.clone(),
            reason,
        ));
    }
    entry.touch();
    histogram!(names::CONNECTION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    pump.abort();
    info!(reason = ?reason, dropped = connection.drop_count(), "client disconnected");
}

fn handle_frame(entry: &ServerEntry, client_id: &ClientId, text: &str) {
    counter!(names::MESSAGES_RECEIVED_TOTAL).increment(1);
    entry.touch();
    entry.emit(ServerEvent::message(
        entry.id.clone(),
        client_id.clone(),
        decode_payload(text),
    ));
}

/// Decode a frame as JSON, falling back to the raw text as a JSON string.
fn decode_payload(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_owned()))
}
