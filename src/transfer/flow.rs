//! Backpressure and drain discipline shared by both protocols.
//!
//! Senders check the channel's buffered byte count before every chunk. At or
//! above the high-water mark they park on the transport's buffered-low
//! signal; a buffer that fails to drop for 60 s aborts the transfer. After a
//! file's last byte is queued the sender waits for the buffer to empty, with
//! a close during that window counting as delivery (the bytes were already
//! handed to the transport, which flushes on close).

use std::time::Duration;

use tokio::time::{sleep, timeout, Instant};

use crate::error::TransferError;
use crate::transfer::channel::DataChannel;

pub const LOW_WATER: usize = 512 * 1024;
pub const HIGH_WATER: usize = 2 * 1024 * 1024;

/// Abort if the buffer sits at or above the high-water mark this long.
pub const SEND_STALL_TIMEOUT: Duration = Duration::from_secs(60);
/// Give the transport this long to flush after EOF.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Park until the channel's buffer is below the high-water mark.
pub async fn wait_below_high(dc: &dyn DataChannel) -> Result<(), TransferError> {
    if dc.buffered_amount().await < HIGH_WATER {
        return Ok(());
    }

    let deadline = Instant::now() + SEND_STALL_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TransferError::BufferStall);
        }
        if timeout(remaining, dc.buffered_low()).await.is_err() {
            return Err(TransferError::BufferStall);
        }
        if !dc.is_open() {
            return Err(TransferError::channel(dc.label(), "closed while waiting to send"));
        }
        if dc.buffered_amount().await < HIGH_WATER {
            return Ok(());
        }
    }
}

/// Wait for the channel's buffer to reach zero after EOF.
pub async fn drain(dc: &dyn DataChannel) -> Result<(), TransferError> {
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    loop {
        if dc.buffered_amount().await == 0 {
            return Ok(());
        }
        // A close here means the transport took ownership of the remaining
        // bytes; treat it as delivered.
        if !dc.is_open() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(TransferError::Timeout("send buffer to drain"));
        }
        sleep(DRAIN_POLL).await;
    }
}
