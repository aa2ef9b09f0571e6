//! One side of a transfer, end to end: signaling exchange, peer-connection
//! setup, protocol selection, and hand-off to a protocol engine.
//!
//! The initiator creates the room and all data channels before producing
//! the offer (trickle ICE: the offer goes out immediately, candidates
//! follow as they are gathered). The joiner answers, then both sides apply
//! candidates as they arrive, queueing any that show up before the remote
//! description is installed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RtcOptions;
use crate::error::TransferError;
use crate::protocol::signaling::{
    ClientEnvelope, ServerEnvelope, SignalPayload, SDP_ANSWER, SDP_OFFER,
};
use crate::transfer::channel::{DataChannel, PeerTransport, SessionSdp};
use crate::transfer::files::FileSource;
use crate::transfer::progress::{Progress, ProgressRenderer};
use crate::transfer::signaling::{SignalingLink, SignalingSender};
use crate::transfer::webrtc::RtcTransport;
use crate::transfer::{
    multi, select_protocol, single, ConsentPolicy, ProtocolKind, ReceiveOutcome,
    CLIENT_TYPE_RECEIVER, CLIENT_TYPE_SENDER, CLIENT_TYPE_SENDER_WEB, OPEN_TIMEOUT,
};

/// Pause between closing data channels and tearing down the peer
/// connection, so in-flight frames get out.
const CLOSE_LINGER: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct SendConfig {
    pub signal_url: String,
    pub rtc: RtcOptions,
    /// Use the web-compatible engine even against a terminal peer.
    pub force_single_channel: bool,
}

#[derive(Debug, Clone)]
pub struct ReceiveConfig {
    pub signal_url: String,
    pub rtc: RtcOptions,
    pub output_dir: PathBuf,
    pub consent: ConsentPolicy,
}

#[derive(Debug)]
pub struct TransferSummary {
    pub files: usize,
    pub bytes: u64,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct ReceiveReport {
    pub outcome: ReceiveOutcome,
    pub bytes: u64,
    pub elapsed: Duration,
}

/// Initiator side: create a room, wait for a peer, stream the files.
pub async fn send_files(config: SendConfig, paths: &[PathBuf]) -> Result<TransferSummary, TransferError> {
    let mut rtc = config.rtc;
    rtc.validate()?;
    rtc.apply_network_heuristics();

    if paths.is_empty() {
        return Err(TransferError::Config("no files to send".to_string()));
    }
    let mut sources = Vec::with_capacity(paths.len());
    for path in paths {
        sources.push(FileSource::open(path).await?);
    }
    let file_count = sources.len();

    // Forcing single-channel also changes the advertised category: the
    // receiver has no force flag and picks its engine from what we claim
    // to be, so both sides must select the same protocol from it.
    let client_type = if config.force_single_channel {
        CLIENT_TYPE_SENDER_WEB
    } else {
        CLIENT_TYPE_SENDER
    };

    let mut link = SignalingLink::connect(&config.signal_url).await?;
    let room_id = link.create_room(client_type).await?;
    println!("Room: {room_id}");
    println!("On the receiving machine, run: slipstream receive {room_id}");

    let peer = link.wait_peer_joined().await?;
    let protocol = if config.force_single_channel {
        ProtocolKind::SingleChannel
    } else {
        select_protocol(&peer.client_type)
    };
    info!(
        "peer joined as {:?}, using {:?} protocol",
        peer.client_type, protocol
    );

    let transport: Arc<dyn PeerTransport> = Arc::new(RtcTransport::connect(&rtc).await?);
    let (done_tx, done_rx) = session_done(&transport);

    // All channels exist before the offer so they ride in its SDP.
    let mut channels: Vec<Arc<dyn DataChannel>> = Vec::new();
    match protocol {
        ProtocolKind::SingleChannel => {
            channels.push(transport.create_channel(single::CHANNEL_LABEL).await?);
        }
        ProtocolKind::MultiChannel => {
            channels.push(transport.create_channel(multi::CONTROL_LABEL).await?);
            for index in 0..sources.len() {
                channels.push(
                    transport
                        .create_channel(&multi::file_channel_label(index))
                        .await?,
                );
            }
        }
    }

    let sender = link.sender();
    let forwarder = spawn_candidate_forwarder(&transport, sender.clone());

    let offer = transport.create_offer().await?;
    send_signal(&sender, &SignalPayload::Description {
        kind: offer.kind,
        sdp: offer.sdp,
    })
    .await?;

    wait_remote_description(&mut link, transport.as_ref(), SDP_ANSWER, "signal answer").await?;
    let driver = spawn_signal_driver(link, transport.clone(), done_tx);

    let progress = Progress::new();
    let renderer = ProgressRenderer::spawn(progress.clone());
    let started = Instant::now();

    let result = match protocol {
        ProtocolKind::SingleChannel => {
            single::run_sender(channels[0].clone(), &sources, &progress, done_rx).await
        }
        ProtocolKind::MultiChannel => {
            multi::run_sender(
                channels[0].clone(),
                channels[1..].to_vec(),
                sources,
                progress.clone(),
                done_rx,
            )
            .await
        }
    };

    renderer.finish().await;
    let bytes = progress.totals().0;
    shutdown(&channels, &transport, driver, forwarder).await;
    result?;

    Ok(TransferSummary {
        files: file_count,
        bytes,
        elapsed: started.elapsed(),
    })
}

/// Joiner side: enter the room, answer the offer, receive the files.
pub async fn receive_files(
    config: ReceiveConfig,
    room_id: &str,
) -> Result<ReceiveReport, TransferError> {
    let mut rtc = config.rtc;
    rtc.validate()?;
    rtc.apply_network_heuristics();

    tokio::fs::create_dir_all(&config.output_dir)
        .await
        .map_err(|e| TransferError::file(&config.output_dir, e))?;

    let mut link = SignalingLink::connect(&config.signal_url).await?;
    let peer = link.join_room(room_id, CLIENT_TYPE_RECEIVER).await?;
    let protocol = select_protocol(&peer.client_type);
    info!(
        "joined room {:?}; sender is {:?}, using {:?} protocol",
        room_id, peer.client_type, protocol
    );

    let transport: Arc<dyn PeerTransport> = Arc::new(RtcTransport::connect(&rtc).await?);
    let (done_tx, done_rx) = session_done(&transport);

    let sender = link.sender();
    let forwarder = spawn_candidate_forwarder(&transport, sender.clone());

    wait_remote_description(&mut link, transport.as_ref(), SDP_OFFER, "signal offer").await?;
    let answer = transport.create_answer().await?;
    send_signal(&sender, &SignalPayload::Description {
        kind: answer.kind,
        sdp: answer.sdp,
    })
    .await?;
    let driver = spawn_signal_driver(link, transport.clone(), done_tx);

    let mut incoming = transport
        .take_incoming_channels()
        .ok_or_else(|| TransferError::PeerConnection("incoming channels already taken".to_string()))?;

    let progress = Progress::new();
    let renderer = ProgressRenderer::spawn(progress.clone());
    let started = Instant::now();

    let result = match protocol {
        ProtocolKind::SingleChannel => {
            let mut done_wait = done_rx.clone();
            let first = tokio::select! {
                received = tokio::time::timeout(OPEN_TIMEOUT, incoming.recv()) => match received {
                    Ok(Some(dc)) => Ok(dc),
                    Ok(None) => Err(TransferError::PeerDisconnected),
                    Err(_) => Err(TransferError::Timeout("data channel announcement")),
                },
                _ = done_wait.changed() => Err(TransferError::PeerDisconnected),
            };
            match first {
                Ok(dc) => {
                    single::run_receiver(dc, &config.output_dir, config.consent, &progress, done_rx)
                        .await
                }
                Err(e) => Err(e),
            }
        }
        ProtocolKind::MultiChannel => {
            multi::run_receiver(
                incoming,
                &config.output_dir,
                config.consent,
                progress.clone(),
                done_rx,
            )
            .await
        }
    };

    renderer.finish().await;
    let bytes = progress.totals().0;
    shutdown(&[], &transport, driver, forwarder).await;
    let outcome = result?;

    Ok(ReceiveReport {
        outcome,
        bytes,
        elapsed: started.elapsed(),
    })
}

/// Session-level done signal: fires when the transport fails or when the
/// hub reports the peer gone.
fn session_done(
    transport: &Arc<dyn PeerTransport>,
) -> (Arc<watch::Sender<bool>>, watch::Receiver<bool>) {
    let (done_tx, done_rx) = watch::channel(false);
    let done_tx = Arc::new(done_tx);

    let mut transport_done = transport.done();
    let relay = done_tx.clone();
    tokio::spawn(async move {
        loop {
            if *transport_done.borrow() {
                let _ = relay.send(true);
                return;
            }
            if transport_done.changed().await.is_err() {
                return;
            }
        }
    });

    (done_tx, done_rx)
}

fn spawn_candidate_forwarder(
    transport: &Arc<dyn PeerTransport>,
    sender: SignalingSender,
) -> Option<JoinHandle<()>> {
    let mut candidates = transport.take_local_candidates()?;
    Some(tokio::spawn(async move {
        while let Some(candidate) = candidates.recv().await {
            let payload = SignalPayload::Candidate {
                ice_candidate: candidate,
            };
            let value = match serde_json::to_value(&payload) {
                Ok(value) => value,
                Err(e) => {
                    warn!("failed to encode candidate payload: {}", e);
                    continue;
                }
            };
            if sender
                .send(ClientEnvelope::Signal { payload: value })
                .await
                .is_err()
            {
                break;
            }
        }
    }))
}

async fn send_signal(
    sender: &SignalingSender,
    payload: &SignalPayload,
) -> Result<(), TransferError> {
    let value =
        serde_json::to_value(payload).map_err(|e| TransferError::Signaling(e.to_string()))?;
    sender.send(ClientEnvelope::Signal { payload: value }).await
}

/// Wait for the remote description of the expected kind, queueing any
/// candidates that race ahead of it and applying them right after it lands.
async fn wait_remote_description(
    link: &mut SignalingLink,
    transport: &dyn PeerTransport,
    expected_kind: &str,
    waiting_for: &'static str,
) -> Result<(), TransferError> {
    let deadline = Instant::now() + OPEN_TIMEOUT;
    let mut pending: Vec<Value> = Vec::new();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TransferError::Timeout(waiting_for));
        }
        let envelope = match tokio::time::timeout(remaining, link.recv()).await {
            Ok(result) => result?,
            Err(_) => return Err(TransferError::Timeout(waiting_for)),
        };

        match envelope {
            ServerEnvelope::Signal { payload } => {
                match serde_json::from_value::<SignalPayload>(payload) {
                    Ok(SignalPayload::Description { kind, sdp }) if kind == expected_kind => {
                        transport
                            .set_remote_description(SessionSdp { kind, sdp })
                            .await?;
                        for candidate in pending.drain(..) {
                            if let Err(e) = transport.add_remote_candidate(candidate).await {
                                warn!("failed to apply queued candidate: {}", e);
                            }
                        }
                        return Ok(());
                    }
                    Ok(SignalPayload::Description { kind, .. }) => {
                        return Err(TransferError::PeerConnection(format!(
                            "unexpected SDP type {kind:?}"
                        )))
                    }
                    Ok(SignalPayload::Candidate { ice_candidate }) => {
                        pending.push(ice_candidate);
                    }
                    Err(e) => warn!("unrecognized signal payload: {}", e),
                }
            }
            ServerEnvelope::PeerLeft => return Err(TransferError::PeerDisconnected),
            ServerEnvelope::Error { payload } => return Err(TransferError::Hub(payload.error)),
            other => debug!("ignoring {:?} during negotiation", other),
        }
    }
}

/// Keep applying late candidates and watching for the peer leaving while an
/// engine runs.
fn spawn_signal_driver(
    mut link: SignalingLink,
    transport: Arc<dyn PeerTransport>,
    done: Arc<watch::Sender<bool>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match link.recv().await {
                Ok(ServerEnvelope::Signal { payload }) => {
                    match serde_json::from_value::<SignalPayload>(payload) {
                        Ok(SignalPayload::Candidate { ice_candidate }) => {
                            if let Err(e) = transport.add_remote_candidate(ice_candidate).await {
                                warn!("failed to apply candidate: {}", e);
                            }
                        }
                        Ok(SignalPayload::Description { kind, .. }) => {
                            warn!("unexpected {kind:?} after negotiation");
                        }
                        Err(e) => warn!("unrecognized signal payload: {}", e),
                    }
                }
                Ok(ServerEnvelope::PeerLeft) => {
                    info!("peer left the room");
                    let _ = done.send(true);
                }
                Ok(ServerEnvelope::Error { payload }) => {
                    warn!("signaling server: {}", payload.error);
                }
                Ok(other) => debug!("ignoring {:?} from the hub", other),
                Err(_) => return,
            }
        }
    })
}

/// Cleanup order: data channels, a short linger for in-flight frames, the
/// peer connection, then the signaling socket.
async fn shutdown(
    channels: &[Arc<dyn DataChannel>],
    transport: &Arc<dyn PeerTransport>,
    driver: JoinHandle<()>,
    forwarder: Option<JoinHandle<()>>,
) {
    for dc in channels {
        dc.close().await;
    }
    tokio::time::sleep(CLOSE_LINGER).await;
    transport.close().await;
    driver.abort();
    if let Some(forwarder) = forwarder {
        forwarder.abort();
    }
}
