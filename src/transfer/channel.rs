//! Capability interface over the peer-to-peer transport.
//!
//! The protocol engines never touch the WebRTC stack directly; they speak to
//! these traits. The production implementation lives in `transfer::webrtc`;
//! tests drive the engines over an in-memory loopback pair.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::error::TransferError;

/// One ordered, reliable data channel.
///
/// Exactly one task sends on a channel and exactly one task receives from
/// it, so the inbox can be taken only once.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;

    /// Resolves once the channel has opened. Immediate if already open,
    /// error if the channel closed before opening.
    async fn opened(&self) -> Result<(), TransferError>;

    fn is_open(&self) -> bool;

    /// Queue one message on the transport.
    async fn send(&self, data: Bytes) -> Result<(), TransferError>;

    /// Bytes queued on the transport but not yet delivered to the network.
    async fn buffered_amount(&self) -> usize;

    /// Resolves the next time the transport reports the buffered amount
    /// dropped below the low-water mark. May also return spuriously; callers
    /// re-check `buffered_amount`.
    async fn buffered_low(&self);

    /// The inbound message stream. Yields `None` once the channel closes.
    fn take_inbox(&self) -> Option<mpsc::Receiver<Bytes>>;

    async fn close(&self);
}

/// One side of a peer connection, reduced to what the transfer session
/// needs: pre-offer channel creation, the SDP handshake, trickled
/// candidates, and a terminal "done" signal.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create an ordered, reliable channel. Channels must exist before the
    /// offer is generated so they are negotiated in it.
    async fn create_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransferError>;

    async fn create_offer(&self) -> Result<SessionSdp, TransferError>;

    /// Answer the remote offer. Call after `set_remote_description`.
    async fn create_answer(&self) -> Result<SessionSdp, TransferError>;

    async fn set_remote_description(&self, desc: SessionSdp) -> Result<(), TransferError>;

    async fn add_remote_candidate(&self, candidate: Value) -> Result<(), TransferError>;

    /// Locally gathered ICE candidates, ready to trickle to the peer.
    fn take_local_candidates(&self) -> Option<mpsc::Receiver<Value>>;

    /// Channels announced by the remote peer, in announcement order.
    fn take_incoming_channels(&self) -> Option<mpsc::Receiver<Arc<dyn DataChannel>>>;

    /// Flips to true once, when the transport fails or closes.
    fn done(&self) -> watch::Receiver<bool>;

    async fn close(&self);
}

/// A session description plus its kind ("offer" or "answer").
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSdp {
    pub kind: String,
    pub sdp: String,
}
