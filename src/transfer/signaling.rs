//! Client side of the signaling socket. A background task owns the
//! WebSocket; callers talk to it through typed envelopes. Pings from the hub
//! are answered by the WebSocket layer itself.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::TransferError;
use crate::protocol::signaling::{ClientEnvelope, PeerInfo, ServerEnvelope};

const QUEUE_DEPTH: usize = 32;

/// A live connection to the signaling hub.
pub struct SignalingLink {
    tx: mpsc::Sender<ClientEnvelope>,
    rx: mpsc::Receiver<ServerEnvelope>,
    _task: JoinHandle<()>,
}

/// Cloneable sending half, for tasks that only ever push envelopes.
#[derive(Clone)]
pub struct SignalingSender {
    tx: mpsc::Sender<ClientEnvelope>,
}

impl SignalingLink {
    pub async fn connect(url: &str) -> Result<SignalingLink, TransferError> {
        let (socket, _) = connect_async(url)
            .await
            .map_err(|e| TransferError::Signaling(format!("connect {url}: {e}")))?;
        debug!("connected to signaling hub at {}", url);

        let (mut sink, mut stream) = socket.split();
        let (out_tx, mut out_rx) = mpsc::channel::<ClientEnvelope>(QUEUE_DEPTH);
        let (in_tx, in_rx) = mpsc::channel::<ServerEnvelope>(QUEUE_DEPTH);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    outbound = out_rx.recv() => match outbound {
                        Some(envelope) => {
                            let json = match serde_json::to_string(&envelope) {
                                Ok(json) => json,
                                Err(e) => {
                                    warn!("failed to serialize envelope: {}", e);
                                    continue;
                                }
                            };
                            if sink.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        }
                    },
                    inbound = stream.next() => match inbound {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<ServerEnvelope>(text.as_str()) {
                                Ok(envelope) => {
                                    if in_tx.send(envelope).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => warn!("unrecognized server envelope: {}", e),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!("signaling socket error: {}", e);
                            break;
                        }
                    }
                }
            }
        });

        Ok(SignalingLink {
            tx: out_tx,
            rx: in_rx,
            _task: task,
        })
    }

    pub fn sender(&self) -> SignalingSender {
        SignalingSender {
            tx: self.tx.clone(),
        }
    }

    pub async fn send(&self, envelope: ClientEnvelope) -> Result<(), TransferError> {
        self.tx
            .send(envelope)
            .await
            .map_err(|_| TransferError::Signaling("connection closed".to_string()))
    }

    pub async fn recv(&mut self) -> Result<ServerEnvelope, TransferError> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| TransferError::Signaling("connection closed".to_string()))
    }

    /// Register a room and wait for its identifier.
    pub async fn create_room(&mut self, client_type: &str) -> Result<String, TransferError> {
        self.send(ClientEnvelope::CreateRoom {
            client_type: client_type.to_string(),
        })
        .await?;
        loop {
            match self.recv().await? {
                ServerEnvelope::RoomCreated { room_id } => return Ok(room_id),
                ServerEnvelope::Error { payload } => return Err(TransferError::Hub(payload.error)),
                other => debug!("ignoring {:?} while waiting for room_created", other),
            }
        }
    }

    /// Join an existing room; the reply carries the initiator's peer info.
    pub async fn join_room(
        &mut self,
        room_id: &str,
        client_type: &str,
    ) -> Result<PeerInfo, TransferError> {
        self.send(ClientEnvelope::JoinRoom {
            room_id: room_id.to_string(),
            client_type: client_type.to_string(),
        })
        .await?;
        loop {
            match self.recv().await? {
                ServerEnvelope::JoinSuccess { payload, .. } => return Ok(payload),
                ServerEnvelope::Error { payload } => return Err(TransferError::Hub(payload.error)),
                other => debug!("ignoring {:?} while waiting for join_success", other),
            }
        }
    }

    /// Block until a peer takes the other slot of our room.
    pub async fn wait_peer_joined(&mut self) -> Result<PeerInfo, TransferError> {
        loop {
            match self.recv().await? {
                ServerEnvelope::PeerJoined { payload } => return Ok(payload),
                ServerEnvelope::PeerLeft => return Err(TransferError::PeerDisconnected),
                ServerEnvelope::Error { payload } => return Err(TransferError::Hub(payload.error)),
                other => debug!("ignoring {:?} while waiting for a peer", other),
            }
        }
    }
}

impl SignalingSender {
    pub async fn send(&self, envelope: ClientEnvelope) -> Result<(), TransferError> {
        self.tx
            .send(envelope)
            .await
            .map_err(|_| TransferError::Signaling("connection closed".to_string()))
    }
}
