//! The multi-channel protocol: one "control" channel for envelopes plus one
//! "file-transfer-i" channel per file, all created in manifest order before
//! the offer. File channels carry raw bytes with no framing, so every file
//! streams in parallel.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::TransferError;
use crate::protocol::transfer::{self, DeviceInfo, FileMeta, FilesMetadata, Frame};
use crate::transfer::channel::DataChannel;
use crate::transfer::chunker::ChunkController;
use crate::transfer::files::{FileSink, FileSource};
use crate::transfer::progress::Progress;
use crate::transfer::{
    flow, next_frame, next_frame_timeout, note_unexpected, send_frame, wait_open, ConsentPolicy,
    ReceiveOutcome, DONE_CONFIRM_TIMEOUT, OPEN_TIMEOUT,
};

pub const CONTROL_LABEL: &str = "control";

const FILE_LABEL_PREFIX: &str = "file-transfer-";

/// How often the open state of the file channels is re-checked.
const OPEN_POLL: Duration = Duration::from_millis(50);

pub fn file_channel_label(index: usize) -> String {
    format!("{FILE_LABEL_PREFIX}{index}")
}

/// Manifest index encoded in a file channel's label.
pub fn file_channel_index(label: &str) -> Option<usize> {
    label.strip_prefix(FILE_LABEL_PREFIX)?.parse().ok()
}

/// Stream all files in parallel, one dedicated channel each.
///
/// `channels` must be in manifest order; the session created them that way
/// before the offer.
pub async fn run_sender(
    control: Arc<dyn DataChannel>,
    channels: Vec<Arc<dyn DataChannel>>,
    sources: Vec<FileSource>,
    progress: Arc<Progress>,
    mut done: watch::Receiver<bool>,
) -> Result<(), TransferError> {
    debug_assert_eq!(channels.len(), sources.len());

    wait_open(control.as_ref(), &mut done).await?;
    let mut inbox = control
        .take_inbox()
        .ok_or_else(|| TransferError::channel(CONTROL_LABEL, "inbox already taken"))?;

    // Identify ourselves ahead of the manifest so the receiver can name us
    // in its consent prompt.
    send_frame(
        control.as_ref(),
        &Frame::with(transfer::DEVICE_INFO, &crate::transfer::local_device_info())?,
    )
    .await?;
    let manifest: Vec<FileMeta> = sources.iter().map(|s| s.meta.clone()).collect();
    send_frame(control.as_ref(), &Frame::with(transfer::FILES_METADATA, &FilesMetadata {
        files: manifest,
    })?)
    .await?;

    wait_channels_open(&channels, &mut done).await?;

    // One global go signal; the decline path ends the session cleanly.
    loop {
        let frame = next_frame(&mut inbox, &mut done).await?;
        match frame.kind.as_str() {
            transfer::DEVICE_INFO => {
                if let Ok(device) = frame.payload_as::<DeviceInfo>(transfer::DEVICE_INFO) {
                    info!("receiver is {} ({})", device.name, device.version);
                }
            }
            transfer::DECLINE_RECEIVE => return Err(TransferError::Declined),
            transfer::READY_TO_RECEIVE => break,
            _ => note_unexpected(&frame, "waiting for ready_to_receive"),
        }
    }

    let mut workers = JoinSet::new();
    for (dc, source) in channels.into_iter().zip(sources.into_iter()) {
        let counter = progress.register(&source.meta.name, source.meta.size);
        let done = done.clone();
        workers.spawn(async move {
            let name = source.meta.name.clone();
            let result = stream_raw(dc, source, &counter, done).await;
            (name, result)
        });
    }

    // Per-file failures are reported after every worker has had its chance;
    // the first one becomes the session result.
    let mut first_error = None;
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok((name, Ok(()))) => debug!(file = %name, "file streamed"),
            Ok((name, Err(e))) => {
                warn!(file = %name, "file failed: {}", e);
                first_error.get_or_insert(e);
            }
            Err(e) => {
                first_error.get_or_insert(TransferError::Protocol(format!(
                    "sender worker panicked: {e}"
                )));
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }

    loop {
        match next_frame_timeout(&mut inbox, &mut done, DONE_CONFIRM_TIMEOUT, "downloading_done")
            .await
        {
            Ok(frame) if frame.kind == transfer::DOWNLOADING_DONE => break,
            Ok(frame) => note_unexpected(&frame, "waiting for downloading_done"),
            Err(TransferError::Timeout(_)) => {
                debug!("no downloading_done within the grace period");
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Send one file's bytes, unframed, then let the buffer drain.
async fn stream_raw(
    dc: Arc<dyn DataChannel>,
    source: FileSource,
    counter: &crate::transfer::progress::FileProgress,
    done: watch::Receiver<bool>,
) -> Result<(), TransferError> {
    let size = source.meta.size;
    if size == 0 {
        return flow::drain(dc.as_ref()).await;
    }

    let mut reader = source.reader_at(0).await?;
    let mut chunker = ChunkController::new(Instant::now());
    let mut pos: u64 = 0;

    while pos < size {
        if *done.borrow() {
            return Err(TransferError::PeerDisconnected);
        }

        let want = chunker.chunk_size().min((size - pos) as usize);
        let mut buf = vec![0u8; want];
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| TransferError::file(&source.path, e))?;
        if n == 0 {
            return Err(TransferError::file(
                &source.path,
                std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "file shrank during transfer",
                ),
            ));
        }
        buf.truncate(n);

        flow::wait_below_high(dc.as_ref()).await?;
        dc.send(bytes::Bytes::from(buf)).await?;

        pos += n as u64;
        counter.add(n as u64);
        chunker.record(n, Instant::now());
    }

    flow::drain(dc.as_ref()).await
}

async fn wait_channels_open(
    channels: &[Arc<dyn DataChannel>],
    done: &mut watch::Receiver<bool>,
) -> Result<(), TransferError> {
    let deadline = Instant::now() + OPEN_TIMEOUT;
    loop {
        let open = channels.iter().filter(|dc| dc.is_open()).count();
        if open == channels.len() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(TransferError::Timeout("file channels to open"));
        }
        tokio::select! {
            _ = tokio::time::sleep(OPEN_POLL) => {}
            _ = done.changed() => return Err(TransferError::PeerDisconnected),
        }
    }
}

/// Accept the control channel and one raw-byte channel per file, then write
/// every file concurrently.
pub async fn run_receiver(
    mut incoming: mpsc::Receiver<Arc<dyn DataChannel>>,
    output_dir: &Path,
    consent: ConsentPolicy,
    progress: Arc<Progress>,
    mut done: watch::Receiver<bool>,
) -> Result<ReceiveOutcome, TransferError> {
    let control = next_channel(&mut incoming, &mut done).await?;
    if control.label() != CONTROL_LABEL {
        return Err(TransferError::Protocol(format!(
            "expected control channel first, got {:?}",
            control.label()
        )));
    }
    wait_open(control.as_ref(), &mut done).await?;
    let mut inbox = control
        .take_inbox()
        .ok_or_else(|| TransferError::channel(CONTROL_LABEL, "inbox already taken"))?;

    send_frame(
        control.as_ref(),
        &Frame::with(transfer::DEVICE_INFO, &crate::transfer::local_device_info())?,
    )
    .await?;

    let mut sender_device: Option<DeviceInfo> = None;
    let manifest = loop {
        let frame = next_frame(&mut inbox, &mut done).await?;
        match frame.kind.as_str() {
            transfer::FILES_METADATA => {
                let meta: FilesMetadata = frame.payload_as(transfer::FILES_METADATA)?;
                break meta.files;
            }
            transfer::DEVICE_INFO => {
                if let Ok(info) = frame.payload_as::<DeviceInfo>(transfer::DEVICE_INFO) {
                    sender_device = Some(info);
                }
            }
            _ => note_unexpected(&frame, "waiting for files_metadata"),
        }
    };

    // Channels bind to manifest entries by the index in their label, which
    // for a conforming sender is also their announcement order.
    let mut slots: Vec<Option<Arc<dyn DataChannel>>> = vec![None; manifest.len()];
    let mut bound = 0;
    while bound < manifest.len() {
        let dc = next_channel(&mut incoming, &mut done).await?;
        let label = dc.label();
        match file_channel_index(&label) {
            Some(index) if index < slots.len() && slots[index].is_none() => {
                slots[index] = Some(dc);
                bound += 1;
            }
            _ => {
                return Err(TransferError::Protocol(format!(
                    "unexpected data channel {label:?} for a {}-file manifest",
                    manifest.len()
                )))
            }
        }
    }
    let channels: Vec<Arc<dyn DataChannel>> =
        slots.into_iter().map(|slot| slot.expect("all slots bound")).collect();
    wait_channels_open(&channels, &mut done).await?;

    if !consent.decide(&manifest, sender_device.as_ref()).await {
        send_frame(control.as_ref(), &Frame::bare(transfer::DECLINE_RECEIVE)).await?;
        return Ok(ReceiveOutcome::Declined);
    }
    send_frame(control.as_ref(), &Frame::bare(transfer::READY_TO_RECEIVE)).await?;

    let mut workers = JoinSet::new();
    for (index, (dc, meta)) in channels.into_iter().zip(manifest.iter()).enumerate() {
        let sink = FileSink::create(output_dir, &meta.name).await?;
        let counter = progress.register(&meta.name, meta.size);
        let meta = meta.clone();
        let done = done.clone();
        workers.spawn(async move {
            let result = receive_raw(dc, &meta, sink, &counter, done).await;
            (index, result)
        });
    }

    let mut paths: Vec<Option<PathBuf>> = vec![None; manifest.len()];
    let mut first_error = None;
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok((index, Ok(path))) => {
                info!(file = %manifest[index].name, "file complete");
                paths[index] = Some(path);
            }
            Ok((index, Err(e))) => {
                warn!(file = %manifest[index].name, "file failed: {}", e);
                first_error.get_or_insert(e);
            }
            Err(e) => {
                first_error.get_or_insert(TransferError::Protocol(format!(
                    "receiver worker panicked: {e}"
                )));
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }

    send_frame(control.as_ref(), &Frame::bare(transfer::DOWNLOADING_DONE)).await?;
    Ok(ReceiveOutcome::Completed(
        paths.into_iter().map(|p| p.expect("no worker failed")).collect(),
    ))
}

/// Write one channel's byte stream until the declared size is reached.
async fn receive_raw(
    dc: Arc<dyn DataChannel>,
    meta: &FileMeta,
    mut sink: FileSink,
    counter: &crate::transfer::progress::FileProgress,
    mut done: watch::Receiver<bool>,
) -> Result<PathBuf, TransferError> {
    let mut inbox = dc
        .take_inbox()
        .ok_or_else(|| TransferError::channel(dc.label(), "inbox already taken"))?;

    while sink.received() < meta.size {
        let bytes = tokio::select! {
            message = inbox.recv() => match message {
                Some(bytes) => bytes,
                None => return Err(TransferError::channel(dc.label(), "closed mid-transfer")),
            },
            _ = done.changed() => return Err(TransferError::PeerDisconnected),
        };

        let end = sink.received() + bytes.len() as u64;
        if end > meta.size {
            return Err(TransferError::Protocol(format!(
                "{:?} overran its declared size {}",
                meta.name, meta.size
            )));
        }
        sink.append(&bytes).await?;
        counter.add(bytes.len() as u64);
    }

    sink.finish().await
}

async fn next_channel(
    incoming: &mut mpsc::Receiver<Arc<dyn DataChannel>>,
    done: &mut watch::Receiver<bool>,
) -> Result<Arc<dyn DataChannel>, TransferError> {
    tokio::select! {
        result = tokio::time::timeout(OPEN_TIMEOUT, incoming.recv()) => match result {
            Ok(Some(dc)) => Ok(dc),
            Ok(None) => Err(TransferError::PeerDisconnected),
            Err(_) => Err(TransferError::Timeout("data channel announcement")),
        },
        _ = done.changed() => Err(TransferError::PeerDisconnected),
    }
}
