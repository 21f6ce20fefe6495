use std::collections::BTreeMap;
use serde_derive::{Deserialize, Serialize};
use super::PeerError;

// Extended message id of the extended handshake.
pub const HANDSHAKE_ID: u8 = 0;

// Id we ask peers to use when sending us ut_metadata messages.
pub const UT_METADATA_ID: u8 = 2;

pub const UT_METADATA: &str = "ut_metadata";

// Metadata is exchanged in pieces of 16KiB.
pub const METADATA_PIECE_LEN: usize = 0x4000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedHandshake {

    // Extension names mapped to the message id the sender wants them on.
    #[serde(default)]
    pub m: BTreeMap<String, i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_size: Option<i64>,

    // Client name and version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,

    // Local listen port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p: Option<i64>,

}

impl ExtendedHandshake {

    pub fn new(metadata_size: Option<usize>) -> Self {
        let mut m = BTreeMap::new();
        m.insert(UT_METADATA.to_string(), UT_METADATA_ID as i64);
        Self {
            m,
            metadata_size: metadata_size.map(|s| s as i64),
            v: Some(concat!("fx-torrent ", env!("CARGO_PKG_VERSION")).to_string()),
            p: None,
        }
    }

    // Id the peer wants ut_metadata messages on, None if unsupported.
    pub fn ut_metadata_id(&self) -> Option<u8> {
        self.m
            .get(UT_METADATA)
            .and_then(|id| u8::try_from(*id).ok())
            .filter(|id| *id != 0)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, PeerError> {
        serde_bencode::to_bytes(self).map_err(|e| PeerError::Extension(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PeerError> {
        serde_bencode::from_bytes(bytes).map_err(|e| PeerError::Extension(e.to_string()))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MetadataHeader {
    msg_type: i64,
    piece: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    total_size: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMessage {
    Request(usize),
    Data { piece: usize, total_size: usize, data: Vec<u8> },
    Reject(usize),
}

impl MetadataMessage {

    pub fn to_bytes(&self) -> Result<Vec<u8>, PeerError> {
        let (header, data) = match self {
            MetadataMessage::Request(piece) => (MetadataHeader { msg_type: 0, piece: *piece as i64, total_size: None }, None),
            MetadataMessage::Data { piece, total_size, data } => (
                MetadataHeader { msg_type: 1, piece: *piece as i64, total_size: Some(*total_size as i64) },
                Some(data),
            ),
            MetadataMessage::Reject(piece) => (MetadataHeader { msg_type: 2, piece: *piece as i64, total_size: None }, None),
        };
        let mut bytes = serde_bencode::to_bytes(&header).map_err(|e| PeerError::Extension(e.to_string()))?;
        if let Some(data) = data {
            bytes.extend_from_slice(data);
        }
        Ok(bytes)
    }

    // The data message carries the raw piece after the bencoded header.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PeerError> {
        let end = bencode_value_end(bytes, 0)
            .ok_or_else(|| PeerError::Extension("malformed metadata message".to_string()))?;
        let header: MetadataHeader = serde_bencode::from_bytes(&bytes[..end])
            .map_err(|e| PeerError::Extension(e.to_string()))?;
        let piece = usize::try_from(header.piece)
            .map_err(|_| PeerError::Extension(format!("invalid metadata piece {}", header.piece)))?;
        match header.msg_type {
            0 => Ok(MetadataMessage::Request(piece)),
            1 => Ok(MetadataMessage::Data {
                piece,
                total_size: header.total_size.and_then(|s| usize::try_from(s).ok()).unwrap_or(0),
                data: bytes[end..].to_vec(),
            }),
            2 => Ok(MetadataMessage::Reject(piece)),
            t => Err(PeerError::Extension(format!("unknown metadata message type {}", t))),
        }
    }
}

// Finds where the bencoded value starting at pos ends.
fn bencode_value_end(buf: &[u8], pos: usize) -> Option<usize> {
    match buf.get(pos)? {
        b'i' => buf[pos..].iter().position(|b| *b == b'e').map(|i| pos + i + 1),
        b'l' | b'd' => {
            let mut p = pos + 1;
            while *buf.get(p)? != b'e' {
                p = bencode_value_end(buf, p)?;
            }
            Some(p + 1)
        }
        b'0'..=b'9' => {
            let colon = pos + buf[pos..].iter().position(|b| *b == b':')?;
            let len: usize = std::str::from_utf8(&buf[pos..colon]).ok()?.parse().ok()?;
            let end = colon.checked_add(1 + len)?;
            (end <= buf.len()).then_some(end)
        }
        _ => None,
    }
}

// Slice of the info dict sent for a metadata piece.
pub fn metadata_piece(info: &[u8], piece: usize) -> Option<&[u8]> {
    let start = piece.checked_mul(METADATA_PIECE_LEN)?;
    if start >= info.len() {
        return None;
    }
    Some(&info[start..(start + METADATA_PIECE_LEN).min(info.len())])
}
