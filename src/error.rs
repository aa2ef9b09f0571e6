use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while encoding or decoding wire messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON encode/decode error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MessagePack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("MessagePack decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("message type {kind:?} carries no {expected} payload")]
    UnexpectedPayload { kind: String, expected: &'static str },
}

/// Errors raised by a transfer session, from configuration checks through
/// signaling, peer-connection setup, and streaming.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Invalid options, reported before any network activity.
    #[error("configuration error: {0}")]
    Config(String),

    /// The signaling socket failed or closed unexpectedly.
    #[error("signaling connection error: {0}")]
    Signaling(String),

    /// The hub answered with an error envelope (room not found, room full,
    /// must join first).
    #[error("signaling server: {0}")]
    Hub(String),

    /// Peer-connection setup or negotiation failed.
    #[error("peer connection error: {0}")]
    PeerConnection(String),

    /// A data channel refused a send or closed mid-transfer.
    #[error("data channel {label:?}: {reason}")]
    Channel { label: String, reason: String },

    /// The remote peer violated the transfer protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Framing(#[from] ProtocolError),

    /// The receiver declined the transfer. Clean termination, not a fault.
    #[error("transfer declined")]
    Declined,

    /// The remote peer left the room or the connection dropped.
    #[error("peer disconnected")]
    PeerDisconnected,

    /// A bounded wait expired. The label names the operation that timed out.
    #[error("timeout waiting for {0}")]
    Timeout(&'static str),

    /// The channel's send buffer stopped draining.
    #[error("buffer not draining")]
    BufferStall,

    /// File I/O failure, tagged with the file it affected.
    #[error("file {path:?}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TransferError {
    pub fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TransferError::File {
            path: path.into(),
            source,
        }
    }

    pub fn channel(label: impl Into<String>, reason: impl Into<String>) -> Self {
        TransferError::Channel {
            label: label.into(),
            reason: reason.into(),
        }
    }
}
