//! The signaling hub: a single-writer event loop that owns every room and
//! peer record. Connection tasks talk to it exclusively through `HubEvent`s;
//! the hub talks back through each peer's bounded send queue. Nothing else
//! ever mutates this state, so no locks are involved.

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::signaling::{ClientEnvelope, PeerInfo, ServerEnvelope};
use crate::server::room::{PeerId, Room};
use crate::server::words;

/// Depth of each peer's outbound queue. The writer pump drains it; if a
/// peer stalls past this many messages the hub drops further sends and the
/// peer's own pumps are responsible for closing the connection.
pub const SEND_QUEUE_DEPTH: usize = 32;

/// Events flowing into the hub loop.
#[derive(Debug)]
pub enum HubEvent {
    /// A newly accepted peer. The hub keeps only the send queue and
    /// metadata, never the socket.
    Register {
        id: PeerId,
        addr: SocketAddr,
        outbox: mpsc::Sender<String>,
    },
    /// The peer's transport closed.
    Unregister { id: PeerId },
    /// An inbound protocol message. `raw` is the original frame text so
    /// `signal` relays are byte-identical.
    Inbound {
        id: PeerId,
        envelope: ClientEnvelope,
        raw: String,
    },
}

struct PeerState {
    addr: SocketAddr,
    outbox: mpsc::Sender<String>,
    client_type: String,
    room_id: Option<String>,
}

#[derive(Default)]
pub struct Hub {
    peers: HashMap<PeerId, PeerState>,
    rooms: HashMap<String, Room>,
}

impl Hub {
    pub fn new() -> Self {
        Hub::default()
    }

    /// Run until the event channel closes. This is the only task that
    /// touches rooms or peer records.
    pub async fn run(mut self, mut events: mpsc::Receiver<HubEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                HubEvent::Register { id, addr, outbox } => self.register(id, addr, outbox),
                HubEvent::Unregister { id } => self.unregister(id),
                HubEvent::Inbound { id, envelope, raw } => self.dispatch(id, envelope, raw),
            }
        }
        info!("hub event channel closed, shutting down");
    }

    fn register(&mut self, id: PeerId, addr: SocketAddr, outbox: mpsc::Sender<String>) {
        info!(peer = %id, %addr, "peer connected");
        self.peers.insert(
            id,
            PeerState {
                addr,
                outbox,
                client_type: String::new(),
                room_id: None,
            },
        );
    }

    fn unregister(&mut self, id: PeerId) {
        let Some(state) = self.peers.remove(&id) else {
            return;
        };
        info!(peer = %id, addr = %state.addr, "peer disconnected");

        let Some(room_id) = state.room_id else {
            return;
        };
        let Some(room) = self.rooms.get_mut(&room_id) else {
            return;
        };
        if !room.vacate(id) {
            return;
        }
        let survivor = room.initiator.or(room.joiner);
        let now_empty = room.is_empty();

        if let Some(survivor) = survivor {
            self.send_to(survivor, &ServerEnvelope::PeerLeft);
        }
        if now_empty {
            self.rooms.remove(&room_id);
            info!(room = %room_id, "room removed");
        }
    }

    fn dispatch(&mut self, id: PeerId, envelope: ClientEnvelope, raw: String) {
        match envelope {
            ClientEnvelope::CreateRoom { client_type } => self.create_room(id, client_type),
            ClientEnvelope::JoinRoom {
                room_id,
                client_type,
            } => self.join_room(id, room_id, client_type),
            ClientEnvelope::Signal { .. } => self.relay_signal(id, raw),
            ClientEnvelope::Unknown => {
                warn!(peer = %id, "ignoring message with unknown type");
            }
        }
    }

    fn create_room(&mut self, id: PeerId, client_type: String) {
        if let Some(state) = self.peers.get_mut(&id) {
            state.client_type = client_type;
        }

        // Regenerate until the identifier misses every live room.
        let room_id = loop {
            let candidate = words::room_id();
            if !self.rooms.contains_key(&candidate) {
                break candidate;
            }
            debug!(room = %candidate, "room id collision, regenerating");
        };

        self.rooms.insert(room_id.clone(), Room::new(id));
        if let Some(state) = self.peers.get_mut(&id) {
            state.room_id = Some(room_id.clone());
        }
        info!(peer = %id, room = %room_id, "room created");

        self.send_to(
            id,
            &ServerEnvelope::RoomCreated {
                room_id,
            },
        );
    }

    fn join_room(&mut self, id: PeerId, room_id: String, client_type: String) {
        if let Some(state) = self.peers.get_mut(&id) {
            state.client_type = client_type;
        }

        let outcome = match self.rooms.get_mut(&room_id) {
            None => Err("Room not found"),
            Some(room) if room.is_full() => Err("Room is full"),
            Some(room) => {
                room.joiner = Some(id);
                Ok(room.initiator)
            }
        };
        let initiator = match outcome {
            Ok(initiator) => initiator,
            Err(message) => {
                self.send_to(id, &ServerEnvelope::error(message));
                return;
            }
        };

        if let Some(state) = self.peers.get_mut(&id) {
            state.room_id = Some(room_id.clone());
        }
        info!(peer = %id, room = %room_id, "peer joined room");

        let joiner_info = PeerInfo {
            client_type: self.client_type_of(id),
        };
        if let Some(initiator) = initiator {
            self.send_to(
                initiator,
                &ServerEnvelope::PeerJoined {
                    payload: joiner_info,
                },
            );
            self.send_to(
                id,
                &ServerEnvelope::JoinSuccess {
                    room_id,
                    payload: PeerInfo {
                        client_type: self.client_type_of(initiator),
                    },
                },
            );
        }
    }

    /// Forward the original envelope text to the other slot of the sender's
    /// room, so the relayed payload stays byte-identical.
    fn relay_signal(&mut self, id: PeerId, raw: String) {
        let Some(room_id) = self.peers.get(&id).and_then(|p| p.room_id.clone()) else {
            self.send_to(id, &ServerEnvelope::error("You must join a room first"));
            return;
        };
        let other = self
            .rooms
            .get(&room_id)
            .and_then(|room| room.counterpart(id));
        match other {
            Some(other) => self.send_raw(other, raw),
            None => {
                debug!(peer = %id, room = %room_id, "dropping signal, no counterpart yet");
            }
        }
    }

    fn client_type_of(&self, id: PeerId) -> String {
        self.peers
            .get(&id)
            .map(|p| p.client_type.clone())
            .unwrap_or_default()
    }

    fn send_to(&self, id: PeerId, envelope: &ServerEnvelope) {
        match serde_json::to_string(envelope) {
            Ok(json) => self.send_raw(id, json),
            Err(e) => warn!(peer = %id, "failed to serialize envelope: {}", e),
        }
    }

    /// Enqueue without blocking the loop. A full queue means the peer's
    /// writer pump has stalled; the message is dropped and logged.
    fn send_raw(&self, id: PeerId, json: String) {
        let Some(state) = self.peers.get(&id) else {
            debug!(peer = %id, "dropping message for unknown peer");
            return;
        };
        if let Err(e) = state.outbox.try_send(json) {
            warn!(peer = %id, "send queue full or closed, dropping message: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::signaling::ErrorBody;
    use serde_json::json;

    fn addr() -> SocketAddr {
        "127.0.0.1:12345".parse().unwrap()
    }

    fn peer(hub: &mut Hub) -> (PeerId, mpsc::Receiver<String>) {
        let id = PeerId::new_v4();
        let (tx, rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        hub.register(id, addr(), tx);
        (id, rx)
    }

    fn next(rx: &mut mpsc::Receiver<String>) -> ServerEnvelope {
        let raw = rx.try_recv().expect("expected a queued message");
        serde_json::from_str(&raw).expect("hub sent invalid JSON")
    }

    fn create(hub: &mut Hub, id: PeerId, rx: &mut mpsc::Receiver<String>) -> String {
        hub.dispatch(
            id,
            ClientEnvelope::CreateRoom {
                client_type: "initiator-terminal-client".to_string(),
            },
            String::new(),
        );
        match next(rx) {
            ServerEnvelope::RoomCreated { room_id } => room_id,
            other => panic!("expected room_created, got {:?}", other),
        }
    }

    fn join(hub: &mut Hub, id: PeerId, room_id: &str) {
        hub.dispatch(
            id,
            ClientEnvelope::JoinRoom {
                room_id: room_id.to_string(),
                client_type: "browser-client".to_string(),
            },
            String::new(),
        );
    }

    #[test]
    fn create_then_join_pairs_both_peers() {
        let mut hub = Hub::new();
        let (a, mut a_rx) = peer(&mut hub);
        let (b, mut b_rx) = peer(&mut hub);

        let room_id = create(&mut hub, a, &mut a_rx);
        join(&mut hub, b, &room_id);

        match next(&mut a_rx) {
            ServerEnvelope::PeerJoined { payload } => {
                assert_eq!(payload.client_type, "browser-client");
            }
            other => panic!("expected peer_joined, got {:?}", other),
        }
        match next(&mut b_rx) {
            ServerEnvelope::JoinSuccess { room_id: r, payload } => {
                assert_eq!(r, room_id);
                assert_eq!(payload.client_type, "initiator-terminal-client");
            }
            other => panic!("expected join_success, got {:?}", other),
        }
    }

    #[test]
    fn join_missing_room_errors() {
        let mut hub = Hub::new();
        let (b, mut b_rx) = peer(&mut hub);

        join(&mut hub, b, "no-such-room-here");
        assert_eq!(
            next(&mut b_rx),
            ServerEnvelope::Error {
                payload: ErrorBody {
                    error: "Room not found".to_string()
                }
            }
        );
    }

    #[test]
    fn third_peer_gets_room_full_and_pair_sees_nothing() {
        let mut hub = Hub::new();
        let (a, mut a_rx) = peer(&mut hub);
        let (b, mut b_rx) = peer(&mut hub);
        let (c, mut c_rx) = peer(&mut hub);

        let room_id = create(&mut hub, a, &mut a_rx);
        join(&mut hub, b, &room_id);
        let _ = next(&mut a_rx); // peer_joined
        let _ = next(&mut b_rx); // join_success

        join(&mut hub, c, &room_id);
        assert_eq!(
            next(&mut c_rx),
            ServerEnvelope::Error {
                payload: ErrorBody {
                    error: "Room is full".to_string()
                }
            }
        );
        assert!(a_rx.try_recv().is_err());
        assert!(b_rx.try_recv().is_err());
    }

    #[test]
    fn signal_before_join_errors() {
        let mut hub = Hub::new();
        let (a, mut a_rx) = peer(&mut hub);

        let raw = json!({"type": "signal", "payload": {"type": "offer", "sdp": "v=0"}});
        hub.dispatch(
            a,
            ClientEnvelope::Signal {
                payload: raw["payload"].clone(),
            },
            raw.to_string(),
        );
        assert_eq!(
            next(&mut a_rx),
            ServerEnvelope::Error {
                payload: ErrorBody {
                    error: "You must join a room first".to_string()
                }
            }
        );
    }

    #[test]
    fn signal_relays_raw_text_verbatim() {
        let mut hub = Hub::new();
        let (a, mut a_rx) = peer(&mut hub);
        let (b, mut b_rx) = peer(&mut hub);

        let room_id = create(&mut hub, a, &mut a_rx);
        join(&mut hub, b, &room_id);
        let _ = next(&mut a_rx);
        let _ = next(&mut b_rx);

        // Unusual key order and whitespace must survive the relay.
        let raw = "{\"payload\": {\"sdp\": \"v=0\", \"type\": \"offer\"}, \"type\": \"signal\"}";
        let envelope: ClientEnvelope = serde_json::from_str(raw).unwrap();
        hub.dispatch(a, envelope, raw.to_string());

        assert_eq!(b_rx.try_recv().unwrap(), raw);
    }

    #[test]
    fn signal_without_counterpart_is_dropped() {
        let mut hub = Hub::new();
        let (a, mut a_rx) = peer(&mut hub);
        let _room = create(&mut hub, a, &mut a_rx);

        let raw = r#"{"type":"signal","payload":{"ice_candidate":{}}}"#;
        let envelope: ClientEnvelope = serde_json::from_str(raw).unwrap();
        hub.dispatch(a, envelope, raw.to_string());
        assert!(a_rx.try_recv().is_err());
    }

    #[test]
    fn unregister_notifies_survivor_and_removes_empty_room() {
        let mut hub = Hub::new();
        let (a, mut a_rx) = peer(&mut hub);
        let (b, mut b_rx) = peer(&mut hub);

        let room_id = create(&mut hub, a, &mut a_rx);
        join(&mut hub, b, &room_id);
        let _ = next(&mut a_rx);
        let _ = next(&mut b_rx);

        hub.unregister(b);
        assert_eq!(next(&mut a_rx), ServerEnvelope::PeerLeft);
        assert!(hub.rooms.contains_key(&room_id));

        hub.unregister(a);
        assert!(!hub.rooms.contains_key(&room_id));
        assert!(hub.peers.is_empty());
    }

    #[test]
    fn room_ids_do_not_collide_with_live_rooms() {
        let mut hub = Hub::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..50 {
            let (p, mut rx) = peer(&mut hub);
            let room_id = create(&mut hub, p, &mut rx);
            assert!(seen.insert(room_id));
        }
    }
}
