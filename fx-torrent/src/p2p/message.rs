use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use crate::{block, Bitfield};
use super::PeerError;

// Largest frame we accept, a full block plus headers with plenty of room for bitfields.
const MAX_MESSAGE_LEN: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {

    KeepAlive,

    // No further requests from the peer will be answered.
    Choke,

    Unchoke,

    Interested,

    NotInterested,

    Have { idx: u32 },

    // Pieces the sender has, only valid directly after the handshake.
    Bitfield(Bitfield),

    Request(block::BlockInfo),

    Block(block::BlockData),

    Cancel(block::BlockInfo),

    Port { port: u16 },

    // Extension protocol message, id 0 is the extended handshake.
    Extended { id: u8, payload: Vec<u8> },
}

pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {

    type Error = PeerError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match msg {

            // [0, 0, 0, 0]
            Message::KeepAlive => dst.put_u32(0),

            // [0, 0, 0, 1, 0]
            Message::Choke => {
                dst.put_u32(1);
                dst.put_u8(0);
            },

            // [0, 0, 0, 1, 1]
            Message::Unchoke => {
                dst.put_u32(1);
                dst.put_u8(1);
            },

            // [0, 0, 0, 1, 2]
            Message::Interested => {
                dst.put_u32(1);
                dst.put_u8(2);
            },

            // [0, 0, 0, 1, 3]
            Message::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(3);
            },

            // have: <len=0005><id=4><piece index>
            Message::Have { idx } => {
                dst.put_u32(5);
                dst.put_u8(4);
                dst.put_u32(idx);
            },

            // bitfield: <len=0001+X><id=5><bitfield>
            Message::Bitfield(bitfield) => {
                let raw = bitfield.as_raw_slice();
                dst.put_u32(1 + raw.len() as u32);
                dst.put_u8(5);
                dst.extend_from_slice(raw);
            },

            // request: <len=0013><id=6><index><begin><length>
            Message::Request(block) => {
                dst.put_u32(13);
                dst.put_u8(6);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            },

            // piece: <len=0009+X><id=7><index><begin><block>
            Message::Block(block) => {
                dst.reserve(13 + block.data.len());
                dst.put_u32(9 + block.data.len() as u32);
                dst.put_u8(7);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.extend_from_slice(&block.data);
            },

            // cancel: <len=0013><id=8><index><begin><length>
            Message::Cancel(block) => {
                dst.put_u32(13);
                dst.put_u8(8);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            },

            // port: <len=0003><id=9><listen-port>
            Message::Port { port } => {
                dst.put_u32(3);
                dst.put_u8(9);
                dst.put_u16(port);
            },

            // extended: <len=0002+X><id=20><extended id><payload>
            Message::Extended { id, payload } => {
                dst.put_u32(2 + payload.len() as u32);
                dst.put_u8(20);
                dst.put_u8(id);
                dst.extend_from_slice(&payload);
            },
        }

        Ok(())
    }
}

// Payload length each fixed size message must have.
fn expected_len(id: u8) -> Option<usize> {
    match id {
        0..=3 => Some(0),
        4 => Some(4),
        6 | 8 => Some(12),
        9 => Some(2),
        _ => None,
    }
}

impl Decoder for MessageCodec {

    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        // Can't read message length.
        if src.remaining() < 4 { return Ok(None); }

        let msg_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if msg_len > MAX_MESSAGE_LEN {
            return Err(PeerError::MessageTooLarge(msg_len));
        }
        if src.remaining() < 4 + msg_len {
            // Haven't received all of message.
            src.reserve(4 + msg_len - src.remaining());
            return Ok(None);
        }
        src.advance(4);
        if msg_len == 0 { return Ok(Some(Message::KeepAlive)); }

        let id = src.get_u8();
        let payload_len = msg_len - 1;
        let mut payload = src.split_to(payload_len);

        if let Some(expected) = expected_len(id) {
            if payload_len != expected {
                return Err(PeerError::InvalidMessage(format!("message id {} with payload length {}", id, payload_len)));
            }
        }

        let msg = match id {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => Message::Have { idx: payload.get_u32() },
            5 => Message::Bitfield(Bitfield::from_vec(payload.to_vec())),
            6 | 8 => {
                let block = block::BlockInfo {
                    piece_idx: payload.get_u32() as usize,
                    offset: payload.get_u32() as usize,
                    len: payload.get_u32() as usize,
                };
                if id == 6 { Message::Request(block) } else { Message::Cancel(block) }
            },
            7 => {
                if payload_len < 8 {
                    return Err(PeerError::InvalidMessage(format!("piece message with payload length {}", payload_len)));
                }
                let piece_idx = payload.get_u32() as usize;
                let offset = payload.get_u32() as usize;
                Message::Block(block::BlockData { piece_idx, offset, data: payload.to_vec() })
            },
            9 => Message::Port { port: payload.get_u16() },
            20 => {
                if payload_len < 1 {
                    return Err(PeerError::InvalidMessage("empty extended message".to_string()));
                }
                let id = payload.get_u8();
                Message::Extended { id, payload: payload.to_vec() }
            },
            id => {
                tracing::warn!("invalid message id: {}", id);
                return Err(PeerError::InvalidMessageId(id));
            }
        };

        Ok(Some(msg))
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "keep alive"),
            Message::Choke => write!(f, "choke"),
            Message::Unchoke => write!(f, "unchoke"),
            Message::Interested => write!(f, "interested"),
            Message::NotInterested => write!(f, "not interested"),
            Message::Have { idx } => write!(f, "have piece idx: {}", idx),
            Message::Bitfield(bf) => write!(f, "bitfield with {} pieces", bf.count_ones()),
            Message::Request(block) => write!(f, "request for block {{ piece idx: {}, offset {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.len,
            ),
            Message::Block(block) => write!(f, "block data {{ piece idx: {}, offset: {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.data.len(),
            ),
            Message::Cancel(block) => write!(f, "cancel for block {{ piece idx: {}, offset: {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.len
            ),
            Message::Port { port } => write!(f, "port {}", port),
            Message::Extended { id, payload } => write!(f, "extended message {} with {} bytes", id, payload.len()),
        }
    }
}
