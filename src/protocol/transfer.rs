//! Data-channel framing.
//!
//! Every message on the single-channel protocol, and every message on the
//! multi-channel control channel, is a MessagePack envelope
//! `{ type: string, payload: bytes }`. The payload is itself MessagePack and
//! is decoded on demand once the type tag is known. File channels on the
//! multi-channel protocol carry raw bytes with no envelope at all.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

pub const FILES_METADATA: &str = "files_metadata";
pub const DEVICE_INFO: &str = "device_info";
pub const READY_TO_RECEIVE: &str = "ready_to_receive";
pub const CHUNK: &str = "chunk";
pub const DOWNLOADING_DONE: &str = "downloading_done";
pub const DECLINE_RECEIVE: &str = "decline_receive";

/// One data-channel message: a type tag and the raw payload bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl Frame {
    /// A frame with no payload (`decline_receive`, `downloading_done`, the
    /// multi-channel `ready_to_receive` go signal).
    pub fn bare(kind: &str) -> Frame {
        Frame {
            kind: kind.to_string(),
            payload: Vec::new(),
        }
    }

    pub fn with<T: Serialize>(kind: &str, payload: &T) -> Result<Frame, ProtocolError> {
        Ok(Frame {
            kind: kind.to_string(),
            payload: rmp_serde::to_vec_named(payload)?,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn decode(raw: &[u8]) -> Result<Frame, ProtocolError> {
        Ok(rmp_serde::from_slice(raw)?)
    }

    pub fn payload_as<T: DeserializeOwned>(&self, expected: &'static str) -> Result<T, ProtocolError> {
        if self.payload.is_empty() {
            return Err(ProtocolError::UnexpectedPayload {
                kind: self.kind.clone(),
                expected,
            });
        }
        Ok(rmp_serde::from_slice(&self.payload)?)
    }
}

/// Manifest entry describing one file offered by the sender.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
}

/// Payload of `files_metadata`: the full manifest in transfer order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilesMetadata {
    pub files: Vec<FileMeta>,
}

/// Payload of `device_info`, exchanged for display purposes only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceInfo {
    pub name: String,
    pub version: String,
}

/// Payload of `ready_to_receive` on the single-channel protocol. The offset
/// is where the sender should resume reading the named file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReadyToReceive {
    pub file_name: String,
    pub offset: u64,
}

/// Payload of `chunk`: one span of file bytes at an explicit offset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub file_name: String,
    pub offset: u64,
    #[serde(with = "serde_bytes")]
    pub bytes: Vec<u8>,
    #[serde(rename = "final")]
    pub is_final: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let frame = Frame::with(
            FILES_METADATA,
            &FilesMetadata {
                files: vec![FileMeta {
                    name: "report.pdf".to_string(),
                    size: 10_000,
                    mime_type: "application/pdf".to_string(),
                }],
            },
        )
        .unwrap();

        let raw = frame.encode().unwrap();
        let back = Frame::decode(&raw).unwrap();
        assert_eq!(back.kind, FILES_METADATA);

        let meta: FilesMetadata = back.payload_as(FILES_METADATA).unwrap();
        assert_eq!(meta.files.len(), 1);
        assert_eq!(meta.files[0].name, "report.pdf");
        assert_eq!(meta.files[0].size, 10_000);
    }

    #[test]
    fn chunk_round_trip_preserves_bytes() {
        let frame = Frame::with(
            CHUNK,
            &Chunk {
                file_name: "a.bin".to_string(),
                offset: 4096,
                bytes: vec![0xde, 0xad, 0xbe, 0xef],
                is_final: true,
            },
        )
        .unwrap();

        let chunk: Chunk = Frame::decode(&frame.encode().unwrap())
            .unwrap()
            .payload_as(CHUNK)
            .unwrap();
        assert_eq!(chunk.offset, 4096);
        assert_eq!(chunk.bytes, vec![0xde, 0xad, 0xbe, 0xef]);
        assert!(chunk.is_final);
    }

    #[test]
    fn bare_frame_has_empty_payload() {
        let raw = Frame::bare(DOWNLOADING_DONE).encode().unwrap();
        let back = Frame::decode(&raw).unwrap();
        assert_eq!(back.kind, DOWNLOADING_DONE);
        assert!(back.payload.is_empty());
    }

    #[test]
    fn payload_as_rejects_empty_payload() {
        let frame = Frame::bare(READY_TO_RECEIVE);
        let err = frame.payload_as::<ReadyToReceive>(READY_TO_RECEIVE);
        assert!(err.is_err());
    }
}
