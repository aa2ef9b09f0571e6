//! Production implementation of the transport capability traits over the
//! `webrtc` crate. No protocol logic lives here; this file only bridges
//! webrtc-rs callbacks onto channels, flags, and notifies that the traits
//! expose.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::RtcOptions;
use crate::error::TransferError;
use crate::protocol::signaling::{SDP_ANSWER, SDP_OFFER};
use crate::transfer::channel::{DataChannel, PeerTransport, SessionSdp};
use crate::transfer::flow::LOW_WATER;

const INBOX_DEPTH: usize = 256;
const INCOMING_CHANNEL_DEPTH: usize = 64;
const CANDIDATE_DEPTH: usize = 64;

pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    candidates: StdMutex<Option<mpsc::Receiver<Value>>>,
    incoming: StdMutex<Option<mpsc::Receiver<Arc<dyn DataChannel>>>>,
    done_rx: watch::Receiver<bool>,
}

impl RtcTransport {
    /// Build a peer connection with the configured STUN and TURN servers.
    /// Force-relay switches the ICE transport policy to relay-only.
    pub async fn connect(options: &RtcOptions) -> Result<RtcTransport, TransferError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(pc_err)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(pc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let mut ice_servers = vec![RTCIceServer {
            urls: options.stun.clone(),
            ..Default::default()
        }];
        for turn in &options.turn {
            ice_servers.push(RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }

        let config = RTCConfiguration {
            ice_servers,
            ice_transport_policy: if options.force_relay {
                RTCIceTransportPolicy::Relay
            } else {
                RTCIceTransportPolicy::All
            },
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(pc_err)?);

        let (candidate_tx, candidate_rx) = mpsc::channel::<Value>(CANDIDATE_DEPTH);
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => match serde_json::to_value(&init) {
                        Ok(value) => {
                            let _ = tx.send(value).await;
                        }
                        Err(e) => warn!("failed to encode ICE candidate: {}", e),
                    },
                    Err(e) => warn!("failed to serialize ICE candidate: {}", e),
                }
            })
        }));

        let (incoming_tx, incoming_rx) =
            mpsc::channel::<Arc<dyn DataChannel>>(INCOMING_CHANNEL_DEPTH);
        pc.on_data_channel(Box::new(move |dc| {
            let tx = incoming_tx.clone();
            Box::pin(async move {
                debug!("remote announced data channel {:?}", dc.label());
                let wrapped = RtcChannel::wrap(dc).await;
                let _ = tx.send(wrapped).await;
            })
        }));

        let (done_tx, done_rx) = watch::channel(false);
        let done_tx = Arc::new(done_tx);
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let done = done_tx.clone();
            Box::pin(async move {
                info!("peer connection state: {}", state);
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                ) {
                    let _ = done.send(true);
                }
            })
        }));

        Ok(RtcTransport {
            pc,
            candidates: StdMutex::new(Some(candidate_rx)),
            incoming: StdMutex::new(Some(incoming_rx)),
            done_rx,
        })
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn create_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransferError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| TransferError::channel(label, e.to_string()))?;
        Ok(RtcChannel::wrap(dc).await)
    }

    async fn create_offer(&self) -> Result<SessionSdp, TransferError> {
        let offer = self.pc.create_offer(None).await.map_err(pc_err)?;
        self.pc.set_local_description(offer).await.map_err(pc_err)?;
        let local = self.pc.local_description().await.ok_or_else(|| {
            TransferError::PeerConnection("no local description after offer".to_string())
        })?;
        Ok(SessionSdp {
            kind: SDP_OFFER.to_string(),
            sdp: local.sdp,
        })
    }

    async fn create_answer(&self) -> Result<SessionSdp, TransferError> {
        let answer = self.pc.create_answer(None).await.map_err(pc_err)?;
        self.pc.set_local_description(answer).await.map_err(pc_err)?;
        let local = self.pc.local_description().await.ok_or_else(|| {
            TransferError::PeerConnection("no local description after answer".to_string())
        })?;
        Ok(SessionSdp {
            kind: SDP_ANSWER.to_string(),
            sdp: local.sdp,
        })
    }

    async fn set_remote_description(&self, desc: SessionSdp) -> Result<(), TransferError> {
        let remote = match desc.kind.as_str() {
            SDP_OFFER => RTCSessionDescription::offer(desc.sdp),
            SDP_ANSWER => RTCSessionDescription::answer(desc.sdp),
            other => {
                return Err(TransferError::PeerConnection(format!(
                    "unexpected SDP type {other:?}"
                )))
            }
        }
        .map_err(pc_err)?;
        self.pc.set_remote_description(remote).await.map_err(pc_err)
    }

    async fn add_remote_candidate(&self, candidate: Value) -> Result<(), TransferError> {
        let init: RTCIceCandidateInit = serde_json::from_value(candidate)
            .map_err(|e| TransferError::PeerConnection(format!("invalid ICE candidate: {e}")))?;
        self.pc.add_ice_candidate(init).await.map_err(pc_err)
    }

    fn take_local_candidates(&self) -> Option<mpsc::Receiver<Value>> {
        self.candidates.lock().unwrap().take()
    }

    fn take_incoming_channels(&self) -> Option<mpsc::Receiver<Arc<dyn DataChannel>>> {
        self.incoming.lock().unwrap().take()
    }

    fn done(&self) -> watch::Receiver<bool> {
        self.done_rx.clone()
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!("error closing peer connection: {}", e);
        }
    }
}

fn pc_err(e: webrtc::Error) -> TransferError {
    TransferError::PeerConnection(e.to_string())
}

/// One webrtc-rs data channel behind the `DataChannel` trait.
struct RtcChannel {
    dc: Arc<RTCDataChannel>,
    inbox: StdMutex<Option<mpsc::Receiver<Bytes>>>,
    open_flag: Arc<AtomicBool>,
    open_notify: Arc<Notify>,
    closed_flag: Arc<AtomicBool>,
    low_notify: Arc<Notify>,
}

impl RtcChannel {
    async fn wrap(dc: Arc<RTCDataChannel>) -> Arc<dyn DataChannel> {
        let (message_tx, message_rx) = mpsc::channel::<Bytes>(INBOX_DEPTH);
        let message_tx = Arc::new(StdMutex::new(Some(message_tx)));
        let open_flag = Arc::new(AtomicBool::new(
            dc.ready_state() == RTCDataChannelState::Open,
        ));
        let open_notify = Arc::new(Notify::new());
        let closed_flag = Arc::new(AtomicBool::new(false));
        let low_notify = Arc::new(Notify::new());

        {
            let open_flag = open_flag.clone();
            let open_notify = open_notify.clone();
            dc.on_open(Box::new(move || {
                open_flag.store(true, Ordering::SeqCst);
                open_notify.notify_waiters();
                Box::pin(async {})
            }));
        }
        {
            let message_tx = message_tx.clone();
            dc.on_message(Box::new(move |msg: DataChannelMessage| {
                let sender = message_tx.lock().unwrap().clone();
                Box::pin(async move {
                    if let Some(sender) = sender {
                        let _ = sender.send(msg.data).await;
                    }
                })
            }));
        }
        {
            let closed_flag = closed_flag.clone();
            let open_notify = open_notify.clone();
            let low_notify = low_notify.clone();
            let message_tx = message_tx.clone();
            dc.on_close(Box::new(move || {
                closed_flag.store(true, Ordering::SeqCst);
                // Dropping the sender ends the inbox stream.
                message_tx.lock().unwrap().take();
                open_notify.notify_waiters();
                low_notify.notify_one();
                Box::pin(async {})
            }));
        }

        dc.set_buffered_amount_low_threshold(LOW_WATER).await;
        {
            let low_notify = low_notify.clone();
            dc.on_buffered_amount_low(Box::new(move || {
                // notify_one keeps a permit, so a crossing that lands just
                // before the sender parks is not lost.
                low_notify.notify_one();
                Box::pin(async {})
            }))
            .await;
        }

        Arc::new(RtcChannel {
            dc,
            inbox: StdMutex::new(Some(message_rx)),
            open_flag,
            open_notify,
            closed_flag,
            low_notify,
        })
    }
}

#[async_trait]
impl DataChannel for RtcChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    async fn opened(&self) -> Result<(), TransferError> {
        loop {
            let notified = self.open_notify.notified();
            if self.open_flag.load(Ordering::SeqCst) {
                return Ok(());
            }
            if self.closed_flag.load(Ordering::SeqCst) {
                return Err(TransferError::channel(
                    self.dc.label(),
                    "closed before opening",
                ));
            }
            notified.await;
        }
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send(&self, data: Bytes) -> Result<(), TransferError> {
        self.dc
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|e| TransferError::channel(self.dc.label(), e.to_string()))
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn buffered_low(&self) {
        self.low_notify.notified().await;
    }

    fn take_inbox(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.inbox.lock().unwrap().take()
    }

    async fn close(&self) {
        if let Err(e) = self.dc.close().await {
            debug!("error closing data channel {:?}: {}", self.dc.label(), e);
        }
    }
}
