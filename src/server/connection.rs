//! Per-peer signaling connection: one reader task and one writer task over a
//! split WebSocket. The writer is the only task writing to the transport and
//! the reader the only one reading. The reader stamps every envelope with
//! the peer id and hands it to the hub; the writer drains the peer's bounded
//! send queue and keeps the heartbeat going.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::protocol::signaling::ClientEnvelope;
use crate::server::hub::{HubEvent, SEND_QUEUE_DEPTH};
use crate::server::ServerState;

/// Large enough for a full session description.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;
/// A peer that stays silent this long is dropped. Any inbound frame,
/// including a pong, extends the deadline.
pub const PONG_TIMEOUT: Duration = Duration::from_secs(60);
/// Ping at 9/10 of the pong timeout.
pub const PING_PERIOD: Duration = Duration::from_secs(54);
pub const WRITE_DEADLINE: Duration = Duration::from_secs(10);

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<ServerState>,
) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, addr, state))
}

async fn handle_socket(socket: WebSocket, addr: SocketAddr, state: ServerState) {
    let id = Uuid::new_v4();
    let (outbox_tx, outbox_rx) = mpsc::channel::<String>(SEND_QUEUE_DEPTH);

    if state
        .hub_tx
        .send(HubEvent::Register {
            id,
            addr,
            outbox: outbox_tx,
        })
        .await
        .is_err()
    {
        return;
    }

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_pump(sink, outbox_rx));

    read_pump(stream, id, &state).await;

    let _ = state.hub_tx.send(HubEvent::Unregister { id }).await;
    // The hub drops the outbox on unregister; the writer then sends a close
    // frame and exits on its own.
    let _ = writer.await;
}

/// Read JSON envelopes until the socket errors, closes, or goes silent past
/// the pong deadline.
async fn read_pump(
    mut stream: futures_util::stream::SplitStream<WebSocket>,
    id: Uuid,
    state: &ServerState,
) {
    loop {
        let frame = match timeout(PONG_TIMEOUT, stream.next()).await {
            Err(_) => {
                debug!(peer = %id, "read deadline expired");
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                debug!(peer = %id, "socket read error: {}", e);
                return;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Text(text) => {
                let envelope: ClientEnvelope = match serde_json::from_str(&text) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(peer = %id, "malformed envelope: {}", e);
                        return;
                    }
                };
                let event = HubEvent::Inbound {
                    id,
                    envelope,
                    raw: text,
                };
                if state.hub_tx.send(event).await.is_err() {
                    return;
                }
            }
            // Pongs (and stray pings) only serve to extend the read deadline.
            Message::Pong(_) | Message::Ping(_) => {}
            Message::Close(_) => return,
            Message::Binary(_) => {
                warn!(peer = %id, "ignoring binary frame on signaling socket");
            }
        }
    }
}

/// Drain the send queue and ping on a timer. Exits when the queue closes
/// (after writing a close frame) or when a write fails or times out.
async fn write_pump(
    mut sink: futures_util::stream::SplitSink<WebSocket, Message>,
    mut outbox: mpsc::Receiver<String>,
) {
    let mut ping = interval(PING_PERIOD);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick of a tokio interval fires immediately; skip it.
    ping.tick().await;

    loop {
        tokio::select! {
            _ = ping.tick() => {
                match timeout(WRITE_DEADLINE, sink.send(Message::Ping(Vec::new()))).await {
                    Ok(Ok(())) => {}
                    _ => return,
                }
            }
            queued = outbox.recv() => {
                match queued {
                    Some(json) => {
                        match timeout(WRITE_DEADLINE, sink.send(Message::Text(json))).await {
                            Ok(Ok(())) => {}
                            _ => return,
                        }
                    }
                    None => {
                        let _ = timeout(WRITE_DEADLINE, sink.send(Message::Close(None))).await;
                        return;
                    }
                }
            }
        }
    }
}
