//! Peer-side transfer machinery: session orchestration, the two protocol
//! engines, and their supporting pieces.

pub mod channel;
pub mod chunker;
pub mod files;
pub mod flow;
pub mod multi;
pub mod progress;
pub mod session;
pub mod signaling;
pub mod single;
pub mod webrtc;

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::error::TransferError;
use crate::protocol::transfer::{DeviceInfo, FileMeta, Frame};
use crate::transfer::channel::DataChannel;

/// Waiting for a channel to open, an answer to arrive, or the remote
/// manifest to show up.
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(30);
/// Grace period for the receiver's final `downloading_done`.
pub const DONE_CONFIRM_TIMEOUT: Duration = Duration::from_secs(10);

/// Client-category strings this binary advertises. The hub treats them as
/// opaque; the paired peer uses them for protocol selection.
pub const CLIENT_TYPE_SENDER: &str = "initiator-terminal-client";
pub const CLIENT_TYPE_RECEIVER: &str = "terminal-client";
/// Advertised instead of `CLIENT_TYPE_SENDER` when the sender forces the
/// web-compatible protocol, so the receiver's selection lands on
/// single-channel too.
pub const CLIENT_TYPE_SENDER_WEB: &str = "initiator-browser-client";

/// Which transfer engine to run against the paired peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    /// One channel, envelope-framed chunks. Works against browsers.
    SingleChannel,
    /// Control channel plus one raw-byte channel per file.
    MultiChannel,
}

/// Terminal clients get the parallel protocol; browser-class or unknown
/// categories fall back to the web-compatible one.
pub fn select_protocol(remote_client_type: &str) -> ProtocolKind {
    if remote_client_type.contains("terminal-client") {
        ProtocolKind::MultiChannel
    } else {
        ProtocolKind::SingleChannel
    }
}

/// What a receiver engine produced.
#[derive(Debug)]
pub enum ReceiveOutcome {
    /// The user turned the transfer down; nothing was written.
    Declined,
    /// Every file landed on disk at these paths.
    Completed(Vec<std::path::PathBuf>),
}

/// How the receiver answers the consent handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentPolicy {
    /// Ask on the terminal.
    Prompt,
    Accept,
    Decline,
}

impl ConsentPolicy {
    pub async fn decide(&self, files: &[FileMeta], device: Option<&DeviceInfo>) -> bool {
        match self {
            ConsentPolicy::Accept => true,
            ConsentPolicy::Decline => false,
            ConsentPolicy::Prompt => prompt_user(files, device).await,
        }
    }
}

async fn prompt_user(files: &[FileMeta], device: Option<&DeviceInfo>) -> bool {
    match device {
        Some(device) => eprintln!("{} ({}) wants to send:", device.name, device.version),
        None => eprintln!("Peer wants to send:"),
    }
    for file in files {
        eprintln!(
            "  {} ({}, {})",
            file.name,
            progress::human_bytes(file.size),
            file.mime_type
        );
    }
    eprint!("Accept? [y/N] ");

    let mut answer = String::new();
    let mut stdin = BufReader::new(tokio::io::stdin());
    if stdin.read_line(&mut answer).await.is_err() {
        return false;
    }
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Identity advertised in `device_info`. Display-only.
pub fn local_device_info() -> DeviceInfo {
    DeviceInfo {
        name: std::env::var("HOSTNAME").unwrap_or_else(|_| env!("CARGO_PKG_NAME").to_string()),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }
}

/// Encode and queue one envelope on a channel.
pub(crate) async fn send_frame(dc: &dyn DataChannel, frame: &Frame) -> Result<(), TransferError> {
    let raw = frame.encode()?;
    dc.send(Bytes::from(raw)).await
}

/// Receive the next envelope, bailing out if the session's done signal
/// fires first.
pub(crate) async fn next_frame(
    inbox: &mut mpsc::Receiver<Bytes>,
    done: &mut watch::Receiver<bool>,
) -> Result<Frame, TransferError> {
    if *done.borrow() {
        return Err(TransferError::PeerDisconnected);
    }
    tokio::select! {
        message = inbox.recv() => match message {
            Some(raw) => Ok(Frame::decode(&raw)?),
            None => Err(TransferError::PeerDisconnected),
        },
        _ = done.changed() => Err(TransferError::PeerDisconnected),
    }
}

/// Like `next_frame` but bounded; used where the protocol puts a deadline on
/// the peer's next message.
pub(crate) async fn next_frame_timeout(
    inbox: &mut mpsc::Receiver<Bytes>,
    done: &mut watch::Receiver<bool>,
    deadline: Duration,
    waiting_for: &'static str,
) -> Result<Frame, TransferError> {
    match tokio::time::timeout(deadline, next_frame(inbox, done)).await {
        Ok(result) => result,
        Err(_) => Err(TransferError::Timeout(waiting_for)),
    }
}

/// Wait for a channel to open, bounded by the standard open timeout.
pub(crate) async fn wait_open(
    dc: &dyn DataChannel,
    done: &mut watch::Receiver<bool>,
) -> Result<(), TransferError> {
    tokio::select! {
        result = tokio::time::timeout(OPEN_TIMEOUT, dc.opened()) => match result {
            Ok(result) => result,
            Err(_) => Err(TransferError::Timeout("data channel to open")),
        },
        _ = done.changed() => Err(TransferError::PeerDisconnected),
    }
}

/// Log-and-skip handler for envelope types an engine does not expect at the
/// current point in the handshake.
pub(crate) fn note_unexpected(frame: &Frame, context: &str) {
    warn!(kind = %frame.kind, "ignoring unexpected message while {}", context);
}
