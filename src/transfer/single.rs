//! The single-channel protocol: one ordered channel labelled
//! "file-transfer" carries control envelopes and chunk envelopes alike.
//! Files stream sequentially, each chunk tagged with its offset, the last
//! one flagged final. This is the web-compatible variant.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::error::TransferError;
use crate::protocol::transfer::{
    self, Chunk, DeviceInfo, FileMeta, FilesMetadata, Frame, ReadyToReceive,
};
use crate::transfer::channel::DataChannel;
use crate::transfer::chunker::ChunkController;
use crate::transfer::files::{FileSink, FileSource};
use crate::transfer::progress::{FileProgress, Progress};
use crate::transfer::{
    flow, next_frame, next_frame_timeout, note_unexpected, send_frame, wait_open, ConsentPolicy,
    ReceiveOutcome, DONE_CONFIRM_TIMEOUT,
};

pub const CHANNEL_LABEL: &str = "file-transfer";

/// A file with no chunk progress for this long is aborted.
pub const CHUNK_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Stream every file over the channel, one `ready_to_receive` at a time.
pub async fn run_sender(
    dc: Arc<dyn DataChannel>,
    sources: &[FileSource],
    progress: &Progress,
    mut done: watch::Receiver<bool>,
) -> Result<(), TransferError> {
    wait_open(dc.as_ref(), &mut done).await?;
    let mut inbox = dc
        .take_inbox()
        .ok_or_else(|| TransferError::channel(CHANNEL_LABEL, "inbox already taken"))?;

    let manifest: Vec<FileMeta> = sources.iter().map(|s| s.meta.clone()).collect();
    send_frame(dc.as_ref(), &Frame::with(transfer::FILES_METADATA, &FilesMetadata {
        files: manifest,
    })?)
    .await?;

    let counters: HashMap<String, Arc<FileProgress>> = sources
        .iter()
        .map(|s| (s.meta.name.clone(), progress.register(&s.meta.name, s.meta.size)))
        .collect();

    let mut remaining = sources.len();
    while remaining > 0 {
        let frame = next_frame(&mut inbox, &mut done).await?;
        match frame.kind.as_str() {
            transfer::DEVICE_INFO => {
                if let Ok(device) = frame.payload_as::<DeviceInfo>(transfer::DEVICE_INFO) {
                    info!("receiver is {} ({})", device.name, device.version);
                }
            }
            transfer::DECLINE_RECEIVE => return Err(TransferError::Declined),
            transfer::READY_TO_RECEIVE => {
                let ready: ReadyToReceive = frame.payload_as(transfer::READY_TO_RECEIVE)?;
                let source = sources
                    .iter()
                    .find(|s| s.meta.name == ready.file_name)
                    .ok_or_else(|| {
                        TransferError::Protocol(format!(
                            "receiver requested unknown file {:?}",
                            ready.file_name
                        ))
                    })?;
                let counter = &counters[&source.meta.name];
                stream_file(dc.as_ref(), source, ready.offset, counter, &mut done).await?;
                remaining -= 1;
            }
            _ => note_unexpected(&frame, "waiting for ready_to_receive"),
        }
    }

    // The receiver confirms after closing its last file. Missing the
    // confirmation is not fatal; the bytes are already delivered.
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

async fn stream_file(
    dc: &dyn DataChannel,
    source: &FileSource,
    offset: u64,
    counter: &FileProgress,
    done: &mut watch::Receiver<bool>,
) -> Result<(), TransferError> {
    let size = source.meta.size;
    if offset > size {
        return Err(TransferError::Protocol(format!(
            "resume offset {offset} past declared size {size} for {:?}",
            source.meta.name
        )));
    }
    counter.set(offset);
    info!(file = %source.meta.name, offset, size, "streaming file");

    // Zero-byte files (and fully resumed ones) still need their final
    // marker so the receiver can close the sink.
    if offset == size {
        let frame = Frame::with(transfer::CHUNK, &Chunk {
            file_name: source.meta.name.clone(),
            offset,
            bytes: Vec::new(),
            is_final: true,
        })?;
        flow::wait_below_high(dc).await?;
        send_frame(dc, &frame).await?;
        return flow::drain(dc).await;
    }

    let mut reader = source.reader_at(offset).await?;
    let mut chunker = ChunkController::new(Instant::now());
    let mut pos = offset;

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

        flow::wait_below_high(dc).await?;
        let is_final = pos + n as u64 == size;
        let frame = Frame::with(transfer::CHUNK, &Chunk {
            file_name: source.meta.name.clone(),
            offset: pos,
            bytes: buf,
            is_final,
        })?;
        send_frame(dc, &frame).await?;

        pos += n as u64;
        counter.add(n as u64);
        chunker.record(n, Instant::now());
    }

    flow::drain(dc).await
}

/// Accept the manifest, then pull each file down in order.
pub async fn run_receiver(
    dc: Arc<dyn DataChannel>,
    output_dir: &Path,
    consent: ConsentPolicy,
    progress: &Progress,
    mut done: watch::Receiver<bool>,
) -> Result<ReceiveOutcome, TransferError> {
    wait_open(dc.as_ref(), &mut done).await?;
    let mut inbox = dc
        .take_inbox()
        .ok_or_else(|| TransferError::channel(CHANNEL_LABEL, "inbox already taken"))?;

    send_frame(
        dc.as_ref(),
        &Frame::with(transfer::DEVICE_INFO, &crate::transfer::local_device_info())?,
    )
    .await?;

    let manifest = loop {
        let frame = next_frame(&mut inbox, &mut done).await?;
        match frame.kind.as_str() {
            transfer::FILES_METADATA => {
                let meta: FilesMetadata = frame.payload_as(transfer::FILES_METADATA)?;
                break meta.files;
            }
            _ => note_unexpected(&frame, "waiting for files_metadata"),
        }
    };

    if !consent.decide(&manifest, None).await {
        send_frame(dc.as_ref(), &Frame::bare(transfer::DECLINE_RECEIVE)).await?;
        return Ok(ReceiveOutcome::Declined);
    }

    let mut paths = Vec::with_capacity(manifest.len());
    for meta in &manifest {
        let sink = FileSink::create(output_dir, &meta.name).await?;
        let counter = progress.register(&meta.name, meta.size);

        send_frame(dc.as_ref(), &Frame::with(transfer::READY_TO_RECEIVE, &ReadyToReceive {
            file_name: meta.name.clone(),
            offset: 0,
        })?)
        .await?;

        let path = receive_file(&mut inbox, &mut done, meta, sink, &counter).await?;
        paths.push(path);
    }

    send_frame(dc.as_ref(), &Frame::bare(transfer::DOWNLOADING_DONE)).await?;
    Ok(ReceiveOutcome::Completed(paths))
}

async fn receive_file(
    inbox: &mut mpsc::Receiver<bytes::Bytes>,
    done: &mut watch::Receiver<bool>,
    meta: &FileMeta,
    mut sink: FileSink,
    counter: &FileProgress,
) -> Result<PathBuf, TransferError> {
    loop {
        let frame = next_frame_timeout(inbox, done, CHUNK_INACTIVITY_TIMEOUT, "data").await?;
        if frame.kind != transfer::CHUNK {
            note_unexpected(&frame, "receiving chunks");
            continue;
        }
        let chunk: Chunk = frame.payload_as(transfer::CHUNK)?;

        if chunk.file_name != meta.name {
            return Err(TransferError::Protocol(format!(
                "chunk for {:?} while receiving {:?}",
                chunk.file_name, meta.name
            )));
        }
        let end = chunk.offset + chunk.bytes.len() as u64;
        if end > meta.size {
            return Err(TransferError::Protocol(format!(
                "chunk ends at {end}, past declared size {} of {:?}",
                meta.size, meta.name
            )));
        }

        sink.write_at(chunk.offset, &chunk.bytes).await?;
        counter.add(chunk.bytes.len() as u64);

        if chunk.is_final {
            if end != meta.size {
                return Err(TransferError::Protocol(format!(
                    "final chunk ends at {end}, short of declared size {} of {:?}",
                    meta.size, meta.name
                )));
            }
            info!(file = %meta.name, size = meta.size, "file complete");
            return sink.finish().await;
        }
    }
}
