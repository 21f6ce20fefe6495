use std::{
    collections::{HashSet, VecDeque},
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::mpsc, time};
use tokio_util::codec::{Framed, FramedParts};
use crate::{
    block::{BlockData, BlockInfo},
    pieces::{PieceOutcome, StoreError},
    torrent::{CommandToTorrent, TorrentContext},
    Bitfield,
};
use super::{*, extension::*, handshake::*, message::*, state::*};

type MessageSink = SplitSink<Framed<TcpStream, MessageCodec>, Message>;

// Keep alive is sent after this long without sending anything.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(120);

// Requests from the peer we queue before dropping new ones.
const MAX_REQUESTS_IN: usize = 256;

#[derive(Debug)]
pub struct PeerSession {

    address: SocketAddr,

    // Shared with the torrent and all of its peers.
    ctx: Arc<TorrentContext>,

    peer_rx: PeerRx,

    // Block requests from the peer waiting to be served.
    requests_in: VecDeque<BlockInfo>,

    // Block requests we sent to the peer.
    requests_out: HashSet<BlockInfo>,

    // Pieces the peer has.
    bitfield: Bitfield,

    // Set once the peer sent anything but a bitfield, after which a bitfield is a violation.
    introduced: bool,

    // Id the peer wants ut_metadata messages on.
    peer_ut_metadata: Option<u8>,

    last_sent: Instant,

    state: SessionState,

}

impl PeerSession {

    pub fn new(address: SocketAddr, ctx: Arc<TorrentContext>) -> (PeerSession, PeerTx) {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let bitfield = Bitfield::repeat(false, ctx.info().num_pieces);
        (
            PeerSession {
                address,
                ctx,
                peer_rx,
                requests_in: VecDeque::new(),
                requests_out: HashSet::new(),
                bitfield,
                introduced: false,
                peer_ut_metadata: None,
                last_sent: Instant::now(),
                state: SessionState::default(),
            },
            peer_tx,
        )
    }

    // Runs the session until it ends, then hands back everything the peer held.
    #[tracing::instrument(name = "peer", skip(self, inbound_stream), fields(address = %self.address))]
    pub async fn start_session(&mut self, inbound_stream: Option<TcpStream>) {
        let result = self.connect_and_run(inbound_stream).await;
        let error = match result {
            Ok(()) => None,
            Err(e) => {
                tracing::debug!("session ended: {}", e);
                Some(e.to_string())
            }
        };

        // Blocks the peer never delivered go back to the others.
        if self.free_requests_out().await {
            self.ctx.torrent_tx.send(CommandToTorrent::BlocksFreed).ok();
        }
        self.ctx.picker.availability.write().await.remove_bitfield(&self.bitfield);
        self.state.update(|state| state.conn_state = ConnState::Closed);
        self.ctx.torrent_tx.send(CommandToTorrent::PeerClosed {
            address: self.address,
            error,
        }).ok();
    }

    async fn connect_and_run(&mut self, inbound_stream: Option<TcpStream>) -> Result<()> {
        self.state.update(|state| state.conn_state = ConnState::Connecting);
        let inbound = inbound_stream.is_some();
        let stream = match inbound_stream {
            Some(stream) => stream,
            None => {
                let stream = time::timeout(self.ctx.config.connect_timeout, TcpStream::connect(self.address))
                    .await
                    .map_err(|_| PeerError::Timeout)??;
                tracing::trace!("outbound connection successful");
                stream
            }
        };

        let mut socket = Framed::new(stream, HandshakeCodec);
        let handshake = time::timeout(
            self.ctx.config.handshake_timeout,
            self.exchange_handshake(&mut socket, inbound),
        ).await.map_err(|_| PeerError::Timeout)??;

        self.ctx.torrent_tx.send(CommandToTorrent::PeerConnected {
            address: self.address,
            id: handshake.peer_id,
        })?;

        // Keep anything the peer sent right after its handshake.
        let parts = socket.into_parts();
        let mut message_parts = FramedParts::new::<Message>(parts.io, MessageCodec);
        message_parts.read_buf = parts.read_buf;
        let socket = Framed::from_parts(message_parts);
        self.run(socket, handshake.supports_extensions()).await
    }

    async fn exchange_handshake(&mut self, socket: &mut Framed<TcpStream, HandshakeCodec>, inbound: bool) -> Result<Handshake> {

        self.state.update(|state| state.conn_state = ConnState::Handshaking);
        let ours = Handshake::new(self.ctx.info_hash, self.ctx.client_id);

        if !inbound {
            tracing::trace!("send handshake");
            socket.send(ours.clone()).await?;
        }

        let handshake = match socket.next().await {
            Some(handshake) => handshake?,
            None => return Err(PeerError::NoHandshake),
        };
        tracing::trace!("read: {:?}", handshake);
        if handshake.info_hash != self.ctx.info_hash {
            return Err(PeerError::IncorrectInfoHash);
        }

        if inbound {
            tracing::trace!("send handshake");
            socket.send(ours).await?;
        }

        tracing::info!("handshake successful, peer connected");
        Ok(handshake)
    }

    async fn run(&mut self, socket: Framed<TcpStream, MessageCodec>, extensions: bool) -> Result<()> {

        let now = Instant::now();
        self.state.connect_time = Some(now);
        self.state.update(|state| state.conn_state = ConnState::Idle);
        self.state.refresh_activity(now);
        let (mut sink, mut stream) = socket.split();

        let own = self.ctx.store.verified_bitfield();
        if own.any() {
            self.send_message(&mut sink, Message::Bitfield(own)).await?;
        }
        if extensions {
            let handshake = ExtendedHandshake::new(Some(self.ctx.metainfo.info_bytes().len()));
            let payload = handshake.to_bytes()?;
            self.send_message(&mut sink, Message::Extended { id: HANDSHAKE_ID, payload }).await?;
        }
        self.report_state()?;

        let mut ticker = time::interval(Duration::from_secs(1));

        loop { tokio::select! {

            biased;

            // Command from elsewhere in application.
            cmd = self.peer_rx.recv() => match cmd {
                Some(PeerCommand::PieceWritten(idx)) => self.handle_written_piece(&mut sink, idx).await?,
                Some(PeerCommand::RequestMore) => {
                    self.update_interest(&mut sink).await?;
                    self.make_requests(&mut sink).await?;
                },
                Some(PeerCommand::Shutdown) | None => {
                    tracing::info!("session shutdown");
                    break;
                },
            },

            // Message from peer.
            msg = stream.next() => match msg {
                Some(msg) => self.handle_msg(&mut sink, msg?).await?,
                None => {
                    tracing::info!("peer closed connection");
                    break;
                },
            },

            _ = std::future::ready(()), if !self.requests_in.is_empty() => self.serve_request(&mut sink).await?,

            t = ticker.tick() => self.tick(&mut sink, t.into_std()).await?,

        }}

        Ok(())
    }

    // Logs a message and sends to peer.
    async fn send_message(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::trace!("send: {}", msg);
        self.last_sent = Instant::now();
        sink.send(msg).await
    }

    async fn handle_msg(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::trace!("read: {}", msg);

        match msg {

            Message::Bitfield(bitfield) => {
                if self.introduced {
                    return Err(PeerError::UnexpectedBitfield);
                }
                self.handle_bitfield(sink, bitfield).await?;
            },

            Message::KeepAlive => {},

            Message::Choke => {
                if !self.state.peer_choking {
                    self.state.update(|state| state.peer_choking = true);
                    // Free pending requests for other peers.
                    if self.free_requests_out().await {
                        self.ctx.torrent_tx.send(CommandToTorrent::BlocksFreed)?;
                    }
                }
            },

            Message::Unchoke => {
                if self.state.peer_choking {
                    self.state.update(|state| state.peer_choking = false);
                    self.make_requests(sink).await?;
                }
            },

            Message::Interested => {
                if !self.state.peer_interested {
                    self.state.update(|state| state.peer_interested = true);
                    self.state.refresh_activity(Instant::now());
                    if self.state.choked {
                        self.send_message(sink, Message::Unchoke).await?;
                        self.state.update(|state| state.choked = false);
                    }
                }
            },

            Message::NotInterested => {
                self.state.update(|state| state.peer_interested = false);
                self.state.refresh_activity(Instant::now());
            },

            Message::Block(block) => self.handle_block(sink, block).await?,

            Message::Request(request) => self.handle_request(request)?,

            Message::Have { idx } => self.handle_have(sink, idx).await?,

            Message::Cancel(block) => {
                self.validate_block(&block)?;
                self.requests_in.retain(|b| *b != block);
            },

            // No DHT.
            Message::Port { .. } => {},

            Message::Extended { id, payload } => self.handle_extended(sink, id, &payload).await?,

        }

        self.introduced = true;
        Ok(())
    }

    async fn handle_bitfield(&mut self, sink: &mut MessageSink, mut bitfield: Bitfield) -> Result<()> {
        let num_pieces = self.ctx.info().num_pieces;
        if bitfield.len() != (num_pieces + 7) / 8 * 8 {
            return Err(PeerError::InvalidMessage(format!("bitfield of {} bits for {} pieces", bitfield.len(), num_pieces)));
        }
        // Remove trailing bits.
        bitfield.truncate(num_pieces);
        tracing::debug!("peer has {}/{} pieces", bitfield.count_ones(), num_pieces);

        let mut availability = self.ctx.picker.availability.write().await;
        availability.remove_bitfield(&self.bitfield);
        availability.add_bitfield(&bitfield);
        drop(availability);

        self.state.update(|state| state.num_pieces = bitfield.count_ones());
        self.bitfield = bitfield;
        self.update_interest(sink).await
    }

    async fn handle_have(&mut self, sink: &mut MessageSink, idx: u32) -> Result<()> {
        let idx = idx as usize;
        if idx >= self.ctx.info().num_pieces {
            return Err(PeerError::InvalidMessage(format!("have with invalid idx {}", idx)));
        }
        // Peer already has piece.
        if self.bitfield[idx] {
            return Ok(());
        }
        self.bitfield.set(idx, true);
        self.state.update(|state| state.num_pieces += 1);
        self.ctx.picker.availability.write().await.increment(idx);

        if !self.state.interested {
            self.update_interest(sink).await?;
        }
        self.make_requests(sink).await
    }

    async fn handle_block(&mut self, sink: &mut MessageSink, block: BlockData) -> Result<()> {

        let info = block.info();
        if !self.requests_out.remove(&info) {
            tracing::debug!("unrequested block: {:?}", &info);
            return Ok(());
        }
        self.state.update(|state| state.throughput.down += block.data.len() as u64);

        let is_duplicate = self.ctx.picker.received_block(&info).await;
        // Replace the request straight away.
        self.make_requests(sink).await?;
        if is_duplicate {
            tracing::trace!("duplicate block: {:?}", &info);
            return Ok(());
        }

        match self.ctx.store.write_block(block).await {
            Ok(None) => Ok(()),
            Ok(Some(PieceOutcome::Verified(idx))) => {
                self.ctx.picker.piece_verified(idx).await;
                self.ctx.torrent_tx.send(CommandToTorrent::PieceWritten { idx, valid: true })?;
                Ok(())
            },
            Ok(Some(PieceOutcome::Failed(idx))) => {
                self.ctx.picker.piece_failed(idx).await;
                self.ctx.torrent_tx.send(CommandToTorrent::PieceWritten { idx, valid: false })?;
                Ok(())
            },
            Err(StoreError::InvalidBlock(info)) => Err(PeerError::InvalidMessage(format!("invalid block {:?}", info))),
            Err(e) => {
                tracing::error!("failed to store block: {}", e);
                self.ctx.torrent_tx.send(CommandToTorrent::StorageFailure(e.to_string()))?;
                Err(e.into())
            },
        }
    }

    fn validate_block(&self, block: &BlockInfo) -> Result<()> {
        let info = self.ctx.info();
        if block.piece_idx >= info.num_pieces || !block.fits_in(info.piece_length(block.piece_idx)) {
            return Err(PeerError::InvalidMessage(format!("invalid block {:?}", block)));
        }
        Ok(())
    }

    fn handle_request(&mut self, request: BlockInfo) -> Result<()> {
        self.validate_block(&request)?;
        if self.state.choked {
            tracing::debug!("request whilst choked: {:?}", request);
            return Ok(());
        }
        if !self.ctx.store.has_piece(request.piece_idx) {
            tracing::debug!("request for piece we don't have: {:?}", request);
            return Ok(());
        }
        if self.requests_in.len() >= MAX_REQUESTS_IN || self.requests_in.contains(&request) {
            tracing::debug!("dropping request: {:?}", request);
            return Ok(());
        }
        self.requests_in.push_back(request);
        Ok(())
    }

    // Sends the oldest queued block the peer asked for.
    async fn serve_request(&mut self, sink: &mut MessageSink) -> Result<()> {
        let Some(request) = self.requests_in.pop_front() else { return Ok(()) };
        if self.state.choked {
            return Ok(());
        }
        let data = match self.ctx.store.read_block(request).await {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("failed to read block {:?}: {}", request, e);
                return Ok(());
            }
        };
        self.send_message(sink, Message::Block(BlockData {
            piece_idx: request.piece_idx,
            offset: request.offset,
            data,
        })).await?;
        self.state.update(|state| state.throughput.up += request.len as u64);
        Ok(())
    }

    async fn handle_extended(&mut self, sink: &mut MessageSink, id: u8, payload: &[u8]) -> Result<()> {
        match id {
            HANDSHAKE_ID => {
                let handshake = ExtendedHandshake::from_bytes(payload)?;
                tracing::debug!("peer extensions: {:?}", handshake.m.keys().collect::<Vec<_>>());
                self.peer_ut_metadata = handshake.ut_metadata_id();
            },
            UT_METADATA_ID => {
                let Some(peer_id) = self.peer_ut_metadata else {
                    return Err(PeerError::Extension("ut_metadata message without handshake".to_string()));
                };
                if let MetadataMessage::Request(piece) = MetadataMessage::from_bytes(payload)? {
                    let info = self.ctx.metainfo.info_bytes();
                    let reply = match metadata_piece(info, piece) {
                        Some(data) => MetadataMessage::Data { piece, total_size: info.len(), data: data.to_vec() },
                        None => MetadataMessage::Reject(piece),
                    };
                    let payload = reply.to_bytes()?;
                    self.send_message(sink, Message::Extended { id: peer_id, payload }).await?;
                }
            },
            id => tracing::debug!("ignoring extended message {}", id),
        }
        Ok(())
    }

    // Tell the peer about the piece and cancel requests for it made elsewhere in endgame.
    async fn handle_written_piece(&mut self, sink: &mut MessageSink, idx: usize) -> Result<()> {
        let cancelled: Vec<BlockInfo> = self.requests_out
            .iter()
            .filter(|b| b.piece_idx == idx)
            .copied()
            .collect();
        for block in cancelled {
            self.requests_out.remove(&block);
            self.send_message(sink, Message::Cancel(block)).await?;
        }
        if !self.bitfield.get(idx).map_or(false, |b| *b) {
            self.send_message(sink, Message::Have { idx: idx as u32 }).await?;
        }
        self.update_interest(sink).await?;
        self.make_requests(sink).await
    }

    // Queue requests up to the target queue length.
    async fn make_requests(&mut self, sink: &mut MessageSink) -> Result<()> {

        if self.state.peer_choking || !self.state.interested {
            return Ok(());
        }

        let requests = self.ctx.picker
            .pick_blocks(&self.ctx.store, &self.requests_out, self.ctx.config.request_queue_len, &self.bitfield)
            .await;
        if requests.is_empty() {
            return Ok(());
        }

        for block in requests {
            tracing::trace!("send request: {:?}", block);
            self.requests_out.insert(block);
            sink.feed(Message::Request(block)).await?;
        }
        self.last_sent = Instant::now();
        sink.flush().await
    }

    // Free all requested blocks, making them available for other peers.
    // Returns whether there were any.
    async fn free_requests_out(&mut self) -> bool {
        if self.requests_out.is_empty() {
            return false;
        }
        tracing::debug!("freeing {} requested blocks", self.requests_out.len());
        self.ctx.picker.free_blocks(self.requests_out.iter()).await;
        self.requests_out.clear();
        true
    }

    // Interested while the peer has a wanted piece we don't.
    async fn update_interest(&mut self, sink: &mut MessageSink) -> Result<()> {
        let store = &self.ctx.store;
        let interested = self.bitfield
            .iter_ones()
            .any(|idx| !store.has_piece(idx) && store.is_wanted(idx));

        if interested != self.state.interested {
            self.state.update(|state| state.interested = interested);
            let msg = if interested { Message::Interested } else { Message::NotInterested };
            self.send_message(sink, msg).await?;
            self.state.refresh_activity(Instant::now());
        }
        Ok(())
    }

    fn report_state(&mut self) -> Result<()> {
        self.ctx.torrent_tx.send(CommandToTorrent::PeerState {
            address: self.address,
            state: self.state,
        })?;
        Ok(())
    }

    async fn tick(&mut self, sink: &mut MessageSink, now: Instant) -> Result<()> {

        if let Some(idle_since) = self.state.idle_since {
            if now.saturating_duration_since(idle_since) >= self.ctx.config.idle_timeout {
                tracing::info!("disconnecting peer due to inactivity");
                return Err(PeerError::IdleTimeout);
            }
        }

        if now.saturating_duration_since(self.last_sent) >= KEEP_ALIVE_INTERVAL {
            self.send_message(sink, Message::KeepAlive).await?;
        }

        // Send stats if there is a state change.
        if self.state.changed {
            self.report_state()?;
        }
        self.state.tick();

        Ok(())
    }
}
