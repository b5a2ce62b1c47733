//! Pipedrop wire protocol.
//!
//! Two kinds of channel messages travel between peers:
//!
//! - **Control messages**: JSON text objects tagged by `type`
//!   (`fileMeta`, `fileRequest`, `fileReceiveComplete`,
//!   `folderReceiveComplete`, `stringMetadata`, `string`).
//! - **Chunk packets**: one binary message per network chunk, carrying its
//!   own metadata so the receiver never depends on a preceding header frame.
//!
//! ## Chunk Packet Format
//!
//! ```text
//! ┌────────────┬──────────────────────────────┬─────────────────────────┐
//! │  Length N  │   Metadata (UTF-8 JSON)      │        Payload          │
//! │  4 bytes   │   N bytes                    │   remaining bytes       │
//! └────────────┴──────────────────────────────┴─────────────────────────┘
//! ```
//!
//! - Length: metadata length, unsigned 32-bit little-endian
//! - Metadata: `{chunkIndex, totalChunks, chunkSize, isLastChunk, fileOffset, fileId}`
//! - Payload: raw chunk bytes, not separately framed; its length must equal `chunkSize`

pub mod text;

pub use text::{split_text, TextAssembler};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::file::FileMetadata;

/// Size of the metadata length prefix in bytes
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Upper bound on the JSON metadata block (64 KB)
pub const MAX_METADATA_SIZE: usize = 64 * 1024;

/// Control messages exchanged as JSON text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ControlMessage {
    /// Announce a file (sender → receiver)
    FileMeta(FileMetadata),
    /// Ask for a file starting at a byte offset (receiver → sender)
    FileRequest {
        /// Requested file
        file_id: String,
        /// First byte the receiver still needs
        offset: u64,
    },
    /// A file was fully received (receiver → sender)
    FileReceiveComplete {
        /// Completed file
        file_id: String,
        /// Bytes received in this session
        received_size: u64,
        /// Chunks received in this session
        received_chunks: u64,
        /// Whether the file was persisted to disk
        store_updated: bool,
    },
    /// Every requested member of a folder was received (receiver → sender)
    FolderReceiveComplete {
        /// Completed folder
        folder_name: String,
        /// Members that completed
        completed_file_ids: Vec<String>,
        /// Whether every member was persisted to disk
        all_store_updated: bool,
    },
    /// A text message of `length` bytes follows (sender → receiver)
    StringMetadata {
        /// Total UTF-8 byte length of the text
        length: u64,
    },
    /// One piece of a text message (sender → receiver)
    String {
        /// Text piece
        chunk: String,
        /// Piece index
        index: u32,
        /// Number of pieces
        total: u32,
    },
}

impl ControlMessage {
    /// Wire name of the message type.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::FileMeta(_) => "fileMeta",
            Self::FileRequest { .. } => "fileRequest",
            Self::FileReceiveComplete { .. } => "fileReceiveComplete",
            Self::FolderReceiveComplete { .. } => "folderReceiveComplete",
            Self::StringMetadata { .. } => "stringMetadata",
            Self::String { .. } => "string",
        }
    }
}

/// Encode a control message to its JSON text form.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_control(message: &ControlMessage) -> Result<String> {
    serde_json::to_string(message).map_err(|e| Error::Serialization(e.to_string()))
}

/// Decode a control message from JSON text.
///
/// # Errors
///
/// Returns `Error::ProtocolViolation` if the text is not a known message.
pub fn decode_control(text: &str) -> Result<ControlMessage> {
    serde_json::from_str(text)
        .map_err(|e| Error::ProtocolViolation(format!("bad control message: {e}")))
}

/// Metadata embedded in every chunk packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMeta {
    /// Absolute 0-based index over the whole file
    pub chunk_index: u64,
    /// Chunk count over the whole file
    pub total_chunks: u64,
    /// Length of this chunk's payload
    pub chunk_size: u64,
    /// Whether this is the final chunk of the file
    pub is_last_chunk: bool,
    /// Byte offset of the payload in the file
    pub file_offset: u64,
    /// File the chunk belongs to
    pub file_id: String,
}

/// A decoded chunk packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPacket {
    /// Embedded metadata
    pub meta: ChunkMeta,
    /// Raw chunk bytes
    pub payload: Vec<u8>,
}

/// Encode a chunk packet.
///
/// # Errors
///
/// Returns an error if the metadata cannot be serialized or is too large.
pub fn encode_chunk_packet(meta: &ChunkMeta, payload: &[u8]) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(meta).map_err(|e| Error::Serialization(e.to_string()))?;
    if json.len() > MAX_METADATA_SIZE {
        return Err(Error::ProtocolViolation(format!(
            "chunk metadata too large: {} bytes",
            json.len()
        )));
    }

    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + json.len() + payload.len());
    buf.extend_from_slice(&(json.len() as u32).to_le_bytes());
    buf.extend_from_slice(&json);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decode a chunk packet.
///
/// The payload is everything after the metadata block. A payload whose length
/// differs from `chunkSize` is returned as-is; callers decide how to react.
///
/// # Errors
///
/// Returns `Error::MalformedPacket` if the prefix or metadata is invalid.
pub fn decode_chunk_packet(data: &[u8]) -> Result<ChunkPacket> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(Error::MalformedPacket(format!(
            "packet too short: {} bytes",
            data.len()
        )));
    }

    let meta_len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if meta_len > MAX_METADATA_SIZE {
        return Err(Error::MalformedPacket(format!(
            "metadata length {meta_len} exceeds limit"
        )));
    }

    let meta_end = LENGTH_PREFIX_SIZE + meta_len;
    if data.len() < meta_end {
        return Err(Error::MalformedPacket(format!(
            "metadata length {meta_len} exceeds packet size {}",
            data.len()
        )));
    }

    let meta: ChunkMeta = serde_json::from_slice(&data[LENGTH_PREFIX_SIZE..meta_end])
        .map_err(|e| Error::MalformedPacket(format!("bad chunk metadata: {e}")))?;

    Ok(ChunkPacket {
        meta,
        payload: data[meta_end..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_meta(len: u64) -> ChunkMeta {
        ChunkMeta {
            chunk_index: 3,
            total_chunks: 4,
            chunk_size: len,
            is_last_chunk: true,
            file_offset: 3 * 65536,
            file_id: "0011223344556677".to_string(),
        }
    }

    #[test]
    fn test_chunk_packet_encode_decode() {
        let payload: Vec<u8> = (0..3392u32).map(|i| (i % 251) as u8).collect();
        let meta = sample_meta(payload.len() as u64);

        let encoded = encode_chunk_packet(&meta, &payload).expect("encode");
        let decoded = decode_chunk_packet(&encoded).expect("decode");

        assert_eq!(decoded.meta, meta);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_chunk_packet_layout() {
        let meta = sample_meta(2);
        let encoded = encode_chunk_packet(&meta, &[0xAA, 0xBB]).expect("encode");

        let len = u32::from_le_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]) as usize;
        let json = std::str::from_utf8(&encoded[4..4 + len]).expect("utf8");

        assert!(json.contains("\"chunkIndex\":3"));
        assert!(json.contains("\"isLastChunk\":true"));
        assert!(json.contains("\"fileId\":\"0011223344556677\""));
        assert_eq!(&encoded[4 + len..], &[0xAA, 0xBB]);
    }

    #[test]
    fn test_chunk_packet_empty_payload() {
        let meta = sample_meta(0);
        let encoded = encode_chunk_packet(&meta, &[]).expect("encode");
        let decoded = decode_chunk_packet(&encoded).expect("decode");
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_decode_too_short() {
        assert!(matches!(
            decode_chunk_packet(&[1, 0]),
            Err(Error::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_decode_length_beyond_packet() {
        let mut data = 100u32.to_le_bytes().to_vec();
        data.extend_from_slice(b"{}");
        assert!(matches!(
            decode_chunk_packet(&data),
            Err(Error::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_decode_bad_json() {
        let mut data = 4u32.to_le_bytes().to_vec();
        data.extend_from_slice(b"nope");
        data.extend_from_slice(&[1, 2, 3]);
        assert!(matches!(
            decode_chunk_packet(&data),
            Err(Error::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_control_message_wire_names() {
        let request = ControlMessage::FileRequest {
            file_id: "abc".to_string(),
            offset: 131_072,
        };
        let json = encode_control(&request).expect("encode");
        assert_eq!(json, r#"{"type":"fileRequest","fileId":"abc","offset":131072}"#);

        let ack = ControlMessage::FileReceiveComplete {
            file_id: "abc".to_string(),
            received_size: 10,
            received_chunks: 1,
            store_updated: false,
        };
        let json = encode_control(&ack).expect("encode");
        assert!(json.contains("\"type\":\"fileReceiveComplete\""));
        assert!(json.contains("\"receivedChunks\":1"));
        assert!(json.contains("\"storeUpdated\":false"));
    }

    #[test]
    fn test_file_meta_message() {
        let meta = FileMetadata::new("notes.txt", 42, "text/plain", "docs/notes.txt", "docs");
        let message = ControlMessage::FileMeta(meta.clone());

        let json = encode_control(&message).expect("encode");
        assert!(json.contains("\"type\":\"fileMeta\""));
        assert!(json.contains("\"fullRelativePath\":\"docs/notes.txt\""));
        assert!(json.contains("\"folderName\":\"docs\""));

        let decoded = decode_control(&json).expect("decode");
        assert_eq!(decoded, message);
        assert_eq!(decoded.kind(), "fileMeta");
    }

    #[test]
    fn test_decode_unknown_control_type() {
        let result = decode_control(r#"{"type":"teleport","fileId":"x"}"#);
        assert!(matches!(result, Err(Error::ProtocolViolation(_))));
    }
}
