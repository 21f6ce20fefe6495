use std::{net::SocketAddr, time::Duration};
use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, time};
use tokio_util::codec::{Framed, FramedParts};
use url::Url;
use crate::{
    metainfo::{MetaInfo, MetaInfoError},
    p2p::{
        ExtendedHandshake, Handshake, HandshakeCodec, Message, MessageCodec, MetadataMessage,
        PeerError, METADATA_PIECE_LEN, UT_METADATA_ID,
    },
    ID,
};

// Largest info dict we are willing to download.
const MAX_METADATA_SIZE: usize = 10 * 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum MetadataError {

    #[error("peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("invalid metadata: {0}")]
    MetaInfo(#[from] MetaInfoError),

    #[error("peer does not support metadata exchange")]
    Unsupported,

    #[error("peer rejected metadata piece {0}")]
    Rejected(usize),

    #[error("invalid metadata size {0}")]
    InvalidSize(usize),

    #[error("unexpected metadata piece {0}")]
    UnexpectedPiece(usize),

    #[error("peer closed connection")]
    Closed,

    #[error("timeout")]
    Timeout,

}

type Result<T> = std::result::Result<T, MetadataError>;

// Downloads the info dict for info_hash from a single peer over ut_metadata.
#[tracing::instrument(name = "metadata", skip(info_hash, client_id, trackers, timeout))]
pub async fn fetch_metadata(
    address: SocketAddr,
    info_hash: ID,
    client_id: ID,
    trackers: &[Url],
    timeout: Duration,
) -> Result<MetaInfo> {
    let info_bytes = time::timeout(timeout, fetch_info_bytes(address, info_hash, client_id))
        .await
        .map_err(|_| MetadataError::Timeout)??;
    let metainfo = MetaInfo::from_info_bytes(info_bytes, info_hash, trackers)?;
    tracing::info!("retrieved metadata for {}", metainfo.name());
    Ok(metainfo)
}

async fn fetch_info_bytes(address: SocketAddr, info_hash: ID, client_id: ID) -> Result<Vec<u8>> {

    let stream = TcpStream::connect(address).await.map_err(PeerError::from)?;
    let mut socket = Framed::new(stream, HandshakeCodec);
    socket.send(Handshake::new(info_hash, client_id)).await?;
    let handshake = match socket.next().await {
        Some(handshake) => handshake?,
        None => return Err(PeerError::NoHandshake.into()),
    };
    if handshake.info_hash != info_hash {
        return Err(PeerError::IncorrectInfoHash.into());
    }
    if !handshake.supports_extensions() {
        return Err(MetadataError::Unsupported);
    }

    let parts = socket.into_parts();
    let mut message_parts = FramedParts::new::<Message>(parts.io, MessageCodec);
    message_parts.read_buf = parts.read_buf;
    let mut socket = Framed::from_parts(message_parts);

    let payload = ExtendedHandshake::new(None).to_bytes()?;
    socket.send(Message::Extended { id: 0, payload }).await?;

    // Wait for the peer's extended handshake, skipping anything else.
    let (peer_id, size) = loop {
        match socket.next().await {
            Some(Ok(Message::Extended { id: 0, payload })) => {
                let ext = ExtendedHandshake::from_bytes(&payload)?;
                let peer_id = ext.ut_metadata_id().ok_or(MetadataError::Unsupported)?;
                let size = ext.metadata_size.unwrap_or(0);
                let size = usize::try_from(size).map_err(|_| MetadataError::InvalidSize(0))?;
                break (peer_id, size);
            },
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
            None => return Err(MetadataError::Closed),
        }
    };
    if size == 0 || size > MAX_METADATA_SIZE {
        return Err(MetadataError::InvalidSize(size));
    }

    let num_pieces = (size + METADATA_PIECE_LEN - 1) / METADATA_PIECE_LEN;
    tracing::debug!("requesting {} metadata pieces ({} bytes)", num_pieces, size);
    for piece in 0..num_pieces {
        let payload = MetadataMessage::Request(piece).to_bytes()?;
        socket.feed(Message::Extended { id: peer_id, payload }).await?;
    }
    socket.flush().await?;

    let mut info_bytes = vec![0u8; size];
    let mut received = vec![false; num_pieces];
    let mut remaining = num_pieces;

    while remaining > 0 {
        let payload = match socket.next().await {
            Some(Ok(Message::Extended { id: UT_METADATA_ID, payload })) => payload,
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
            None => return Err(MetadataError::Closed),
        };
        match MetadataMessage::from_bytes(&payload)? {
            MetadataMessage::Data { piece, total_size, data } => {
                let start = piece * METADATA_PIECE_LEN;
                let expected_len = METADATA_PIECE_LEN.min(size.saturating_sub(start));
                if piece >= num_pieces || received[piece] || total_size != size || data.len() != expected_len {
                    return Err(MetadataError::UnexpectedPiece(piece));
                }
                info_bytes[start..start + expected_len].copy_from_slice(&data);
                received[piece] = true;
                remaining -= 1;
            },
            MetadataMessage::Reject(piece) => return Err(MetadataError::Rejected(piece)),
            // We have nothing to give yet.
            MetadataMessage::Request(piece) => {
                let payload = MetadataMessage::Reject(piece).to_bytes()?;
                socket.send(Message::Extended { id: peer_id, payload }).await?;
            },
        }
    }

    Ok(info_bytes)
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;
    use crate::{metainfo::test_metainfo_multi, p2p::metadata_piece};
    use super::*;

    // Minimal peer that hands out the info dict in metadata pieces.
    async fn serve_metadata(listener: TcpListener, metainfo: MetaInfo, reject: bool) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut socket = Framed::new(stream, HandshakeCodec);
        let handshake = socket.next().await.unwrap().unwrap();
        socket.send(Handshake::new(handshake.info_hash, [9; 20])).await.unwrap();

        let mut socket = Framed::new(socket.into_inner(), MessageCodec);
        let payload = ExtendedHandshake::new(Some(metainfo.info_bytes().len())).to_bytes().unwrap();
        socket.send(Message::Extended { id: 0, payload }).await.unwrap();

        let mut peer_id = None;
        while let Some(Ok(msg)) = socket.next().await {
            let Message::Extended { id, payload } = msg else { continue };
            if id == 0 {
                peer_id = ExtendedHandshake::from_bytes(&payload).unwrap().ut_metadata_id();
                continue;
            }
            let MetadataMessage::Request(piece) = MetadataMessage::from_bytes(&payload).unwrap() else { continue };
            let info = metainfo.info_bytes();
            let reply = match metadata_piece(info, piece) {
                Some(data) if !reject => MetadataMessage::Data { piece, total_size: info.len(), data: data.to_vec() },
                _ => MetadataMessage::Reject(piece),
            };
            let payload = reply.to_bytes().unwrap();
            socket.send(Message::Extended { id: peer_id.unwrap(), payload }).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_fetch_metadata() {
        // Enough files for the info dict to span several metadata pieces.
        let lens: Vec<usize> = (0..2_000).map(|i| 100 + i).collect();
        let metainfo = test_metainfo_multi(&lens, 16_384);
        assert!(metainfo.info_bytes().len() > METADATA_PIECE_LEN);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(serve_metadata(listener, metainfo.clone(), false));

        let tracker = Url::parse("http://tracker.test/announce").unwrap();
        let fetched = fetch_metadata(address, metainfo.info_hash(), [1; 20], &[tracker.clone()], Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(fetched.info_hash(), metainfo.info_hash());
        assert_eq!(fetched.files().len(), 2_000);
        assert_eq!(fetched.tracker_urls(), vec![tracker]);
    }

    #[tokio::test]
    async fn test_rejected_metadata() {
        let metainfo = test_metainfo_multi(&[1_000], 16_384);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(serve_metadata(listener, metainfo.clone(), true));

        let result = fetch_metadata(address, metainfo.info_hash(), [1; 20], &[], Duration::from_secs(10)).await;
        assert!(matches!(result, Err(MetadataError::Rejected(0))));
    }
}
