//! Signaling wire protocol (JSON over WebSocket text frames).
//!
//! Client→Server: `create_room`, `join_room`, `signal`.
//! Server→Client: `room_created`, `join_success`, `peer_joined`, `peer_left`,
//! `signal` (forwarded verbatim), `error`.
//!
//! `signal` payloads are opaque to the hub: either a session description
//! `{ "type": "offer"|"answer", "sdp": "..." }` or an ICE candidate
//! `{ "ice_candidate": { ... } }`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope sent by a peer to the hub.
///
/// Unknown type tags parse into `Unknown` so the hub can log and ignore
/// them without failing the connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    CreateRoom {
        client_type: String,
    },
    JoinRoom {
        room_id: String,
        client_type: String,
    },
    Signal {
        payload: Value,
    },
    #[serde(other)]
    Unknown,
}

/// Envelope sent by the hub to a peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEnvelope {
    RoomCreated { room_id: String },
    JoinSuccess { room_id: String, payload: PeerInfo },
    PeerJoined { payload: PeerInfo },
    PeerLeft,
    Signal { payload: Value },
    Error { payload: ErrorBody },
}

/// Capability metadata for the paired peer, carried in `join_success` and
/// `peer_joined`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub client_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub error: String,
}

impl ServerEnvelope {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEnvelope::Error {
            payload: ErrorBody {
                error: message.into(),
            },
        }
    }
}

/// The two payload shapes a `signal` envelope carries. The hub never parses
/// these; peers do.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SignalPayload {
    Description {
        #[serde(rename = "type")]
        kind: String,
        sdp: String,
    },
    Candidate {
        ice_candidate: Value,
    },
}

pub const SDP_OFFER: &str = "offer";
pub const SDP_ANSWER: &str = "answer";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_envelope_create_room() {
        let json = r#"{"type":"create_room","client_type":"initiator-terminal-client"}"#;
        let env: ClientEnvelope = serde_json::from_str(json).unwrap();
        match env {
            ClientEnvelope::CreateRoom { client_type } => {
                assert_eq!(client_type, "initiator-terminal-client");
            }
            other => panic!("expected CreateRoom, got {:?}", other),
        }
    }

    #[test]
    fn unknown_type_is_tolerated() {
        let json = r#"{"type":"frobnicate","room_id":"x"}"#;
        let env: ClientEnvelope = serde_json::from_str(json).unwrap();
        assert!(matches!(env, ClientEnvelope::Unknown));
    }

    #[test]
    fn server_envelope_round_trip() {
        let env = ServerEnvelope::JoinSuccess {
            room_id: "kitten-waffle-stardust-happy".to_string(),
            payload: PeerInfo {
                client_type: "browser-client".to_string(),
            },
        };
        let json = serde_json::to_string(&env).unwrap();
        let back: ServerEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(env, back);
    }

    #[test]
    fn error_envelope_shape() {
        let json = serde_json::to_string(&ServerEnvelope::error("Room is full")).unwrap();
        assert_eq!(json, r#"{"type":"error","payload":{"error":"Room is full"}}"#);
    }

    #[test]
    fn signal_payload_offer_and_candidate() {
        let offer: SignalPayload =
            serde_json::from_str(r#"{"type":"offer","sdp":"v=0\r\n"}"#).unwrap();
        match offer {
            SignalPayload::Description { kind, sdp } => {
                assert_eq!(kind, SDP_OFFER);
                assert!(sdp.starts_with("v=0"));
            }
            other => panic!("expected Description, got {:?}", other),
        }

        let cand: SignalPayload =
            serde_json::from_str(r#"{"ice_candidate":{"candidate":"candidate:1"}}"#).unwrap();
        assert!(matches!(cand, SignalPayload::Candidate { .. }));
    }
}
