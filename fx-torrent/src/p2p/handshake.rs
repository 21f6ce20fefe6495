use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use crate::ID;
use super::PeerError;

pub const PROTOCOL: [u8; 19] = *b"BitTorrent protocol";

pub const HANDSHAKE_LEN: usize = 68;

// Reserved bit advertising the extension protocol.
const EXTENSION_BYTE: usize = 5;
const EXTENSION_BIT: u8 = 0x10;

#[derive(Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol:   [u8; 19],
    pub reserved:   [u8; 8],
    pub info_hash:  ID,
    pub peer_id:    ID,
}

impl Handshake {
    pub fn new(info_hash: ID, peer_id: ID) -> Self {
        let mut reserved = [0; 8];
        reserved[EXTENSION_BYTE] |= EXTENSION_BIT;
        Self {
            protocol: PROTOCOL,
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_extensions(&self) -> bool {
        self.reserved[EXTENSION_BYTE] & EXTENSION_BIT != 0
    }
}

pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {

    type Error = PeerError;

    fn encode(&mut self, item: Handshake, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(HANDSHAKE_LEN);
        dst.put_u8(PROTOCOL.len() as u8);
        dst.extend_from_slice(&item.protocol);
        dst.extend_from_slice(&item.reserved);
        dst.extend_from_slice(&item.info_hash);
        dst.extend_from_slice(&item.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {

    type Item = Handshake;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        if src.is_empty() {
            return Ok(None);
        }
        if src[0] as usize != PROTOCOL.len() {
            return Err(PeerError::IncorrectProtocol);
        }
        // Handshake not fully received.
        if src.len() < HANDSHAKE_LEN {
            return Ok(None);
        }
        src.advance(1);

        let mut protocol = [0; 19];
        src.copy_to_slice(&mut protocol);
        if protocol != PROTOCOL {
            return Err(PeerError::IncorrectProtocol);
        }

        let mut reserved = [0; 8];
        src.copy_to_slice(&mut reserved);

        let mut info_hash = [0; 20];
        src.copy_to_slice(&mut info_hash);

        let mut peer_id = [0; 20];
        src.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            protocol,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("protocol", &String::from_utf8_lossy(&self.protocol))
            .field("reserved", &self.reserved)
            .field("info_hash", &hex::encode(self.info_hash))
            .field("peer_id", &String::from_utf8_lossy(&self.peer_id))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_handshake(reserved: [u8; 8]) -> BytesMut {
        let mut src = BytesMut::new();
        src.put_u8(19);
        src.extend_from_slice(b"BitTorrent protocol");
        src.extend_from_slice(&reserved);
        src.extend_from_slice(&[1; 20]);
        src.extend_from_slice(&[2; 20]);
        src
    }

    #[test]
    fn test_handshake_encoding() {
        let mut dst = BytesMut::new();
        HandshakeCodec.encode(Handshake::new([1; 20], [2; 20]), &mut dst).unwrap();
        assert_eq!(dst.len(), HANDSHAKE_LEN);
        assert_eq!(dst, raw_handshake([0, 0, 0, 0, 0, 0x10, 0, 0]));
    }

    #[test]
    fn test_handshake_decoding() {
        let mut src = raw_handshake([0; 8]);
        let handshake = HandshakeCodec.decode(&mut src).unwrap().unwrap();
        assert_eq!(handshake.protocol, PROTOCOL);
        assert_eq!(handshake.info_hash, [1; 20]);
        assert_eq!(handshake.peer_id, [2; 20]);
        assert!(!handshake.supports_extensions());
        assert!(src.is_empty());
    }

    #[test]
    fn test_handshake_decoding_with_incomplete_data() {
        let mut src = BytesMut::new();
        src.put_u8(19);
        src.extend_from_slice(b"BitTorrent protocol");
        assert!(HandshakeCodec.decode(&mut src).unwrap().is_none());
    }

    #[test]
    fn test_handshake_decoding_with_wrong_protocol() {
        let mut src = BytesMut::new();
        src.put_u8(20);
        src.extend_from_slice(&[0; 67]);
        assert!(matches!(HandshakeCodec.decode(&mut src), Err(PeerError::IncorrectProtocol)));

        let mut src = raw_handshake([0; 8]);
        src[1] = b'b';
        assert!(matches!(HandshakeCodec.decode(&mut src), Err(PeerError::IncorrectProtocol)));
    }

    #[test]
    fn test_handshake_decoding_with_extra_data() {
        let mut src = raw_handshake([0, 0, 0, 0, 0, 0x10, 0, 0]);
        src.extend_from_slice(&[0, 0, 0, 1, 2]);
        let handshake = HandshakeCodec.decode(&mut src).unwrap().unwrap();
        assert!(handshake.supports_extensions());
        assert_eq!(&src[..], &[0, 0, 0, 1, 2]);
    }
}
