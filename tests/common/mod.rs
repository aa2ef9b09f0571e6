//! In-memory loopback transport for driving the protocol engines without a
//! real peer connection.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use slipstream::error::TransferError;
use slipstream::transfer::channel::DataChannel;

const PIPE_DEPTH: usize = 1024;

/// One end of a loopback channel pair. Always open until closed; the
/// simulated send buffer is empty unless a test sets it.
pub struct MemChannel {
    label: String,
    outbound: Mutex<Option<mpsc::Sender<Bytes>>>,
    inbox: Mutex<Option<mpsc::Receiver<Bytes>>>,
    closed: Arc<AtomicBool>,
    buffered: Arc<AtomicUsize>,
}

impl MemChannel {
    /// Fake a backlog in the send buffer.
    pub fn set_buffered(&self, bytes: usize) {
        self.buffered.store(bytes, Ordering::SeqCst);
    }
}

/// Two linked ends sharing a label and a closed flag.
pub fn channel_pair(label: &str) -> (Arc<MemChannel>, Arc<MemChannel>) {
    let (a_tx, b_rx) = mpsc::channel(PIPE_DEPTH);
    let (b_tx, a_rx) = mpsc::channel(PIPE_DEPTH);
    let closed = Arc::new(AtomicBool::new(false));
    let a = Arc::new(MemChannel {
        label: label.to_string(),
        outbound: Mutex::new(Some(a_tx)),
        inbox: Mutex::new(Some(a_rx)),
        closed: closed.clone(),
        buffered: Arc::new(AtomicUsize::new(0)),
    });
    let b = Arc::new(MemChannel {
        label: label.to_string(),
        outbound: Mutex::new(Some(b_tx)),
        inbox: Mutex::new(Some(b_rx)),
        closed,
        buffered: Arc::new(AtomicUsize::new(0)),
    });
    (a, b)
}

#[async_trait]
impl DataChannel for MemChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    async fn opened(&self) -> Result<(), TransferError> {
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn send(&self, data: Bytes) -> Result<(), TransferError> {
        if !self.is_open() {
            return Err(TransferError::channel(&self.label, "channel closed"));
        }
        let sender = self.outbound.lock().unwrap().clone();
        match sender {
            Some(sender) => sender
                .send(data)
                .await
                .map_err(|_| TransferError::channel(&self.label, "peer inbox closed")),
            None => Err(TransferError::channel(&self.label, "channel closed")),
        }
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    async fn buffered_low(&self) {
        // The simulated buffer never crosses the low-water mark on its own.
        std::future::pending::<()>().await
    }

    fn take_inbox(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.inbox.lock().unwrap().take()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.outbound.lock().unwrap().take();
    }
}

/// Deterministic, non-repeating content for round-trip comparisons.
pub fn patterned_bytes(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}
