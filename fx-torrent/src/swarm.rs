use std::{
    collections::{HashMap, HashSet, VecDeque},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};
use tokio::{
    net::TcpStream,
    sync::{OwnedSemaphorePermit, Semaphore},
    time::{self, Instant},
};
use crate::{
    p2p::{state::SessionState, PeerCommand, PeerHandle, PeerSession},
    stats::ThroughputStats,
    torrent::TorrentContext,
    ID,
};

// Peers of a single torrent, connected and known.
#[derive(Debug)]
pub struct Swarm {

    // Peers we have active sessions with.
    peers: HashMap<SocketAddr, PeerHandle>,

    // Peers we know about but don't have a session with.
    candidates: VecDeque<SocketAddr>,

    queued: HashSet<SocketAddr>,

    // Peers that failed recently, ignored until the instant passes.
    parked: HashMap<SocketAddr, Instant>,

    // Connection budget shared by every torrent of a session.
    connections: Arc<Semaphore>,

    max_peers: usize,

    cooldown: Duration,

    // Address we listen on, never connected to.
    own_address: Option<SocketAddr>,

    // Sum of peer throughput since the last status tick.
    throughput: ThroughputStats,

}

impl Swarm {

    pub fn new(connections: Arc<Semaphore>, max_peers: usize, cooldown: Duration) -> Self {
        Self {
            peers: HashMap::new(),
            candidates: VecDeque::new(),
            queued: HashSet::new(),
            parked: HashMap::new(),
            connections,
            max_peers,
            cooldown,
            own_address: None,
            throughput: ThroughputStats::default(),
        }
    }

    pub fn set_own_address(&mut self, address: SocketAddr) {
        self.own_address = Some(address);
    }

    pub fn add_candidates(&mut self, peers: impl IntoIterator<Item = SocketAddr>) {
        let now = Instant::now();
        let mut added = 0;
        for address in peers {
            if Some(address) == self.own_address
                || self.peers.contains_key(&address)
                || self.queued.contains(&address)
                || self.parked.get(&address).map_or(false, |until| *until > now)
            {
                continue;
            }
            self.parked.remove(&address);
            self.queued.insert(address);
            self.candidates.push_back(address);
            added += 1;
        }
        if added > 0 {
            tracing::debug!("{} new peer candidates, {} queued", added, self.candidates.len());
        }
    }

    // Takes the next candidate, for uses other than a peer session.
    pub fn pop_candidate(&mut self) -> Option<SocketAddr> {
        let address = self.candidates.pop_front()?;
        self.queued.remove(&address);
        Some(address)
    }

    pub fn park(&mut self, address: SocketAddr) {
        self.parked.insert(address, Instant::now() + self.cooldown);
    }

    pub fn acquire_permit(&self) -> Option<OwnedSemaphorePermit> {
        match Arc::clone(&self.connections).try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) => {
                tracing::trace!("global connection limit reached");
                None
            }
        }
    }

    // Connects to candidates while under both the torrent and the session budget.
    pub fn connect_to_peers(&mut self, ctx: &Arc<TorrentContext>) {
        let mut count = 0;
        while self.peers.len() < self.max_peers && !self.candidates.is_empty() {
            let Some(permit) = self.acquire_permit() else { break };
            let Some(address) = self.pop_candidate() else { break };
            let (session, peer_tx) = PeerSession::new(address, Arc::clone(ctx));
            self.peers.insert(address, PeerHandle::start_session(session, peer_tx, None, permit));
            count += 1;
        }
        if count > 0 {
            tracing::info!("connecting to {} peers", count);
        }
    }

    pub fn accept(&mut self, ctx: &Arc<TorrentContext>, stream: TcpStream, address: SocketAddr) {
        if self.peers.contains_key(&address) {
            tracing::debug!("already connected to {}", address);
            return;
        }
        if self.peers.len() >= self.max_peers {
            tracing::debug!("rejecting inbound peer {}, torrent at capacity", address);
            return;
        }
        let Some(permit) = self.acquire_permit() else { return };
        tracing::debug!("inbound connection from {}", address);
        let (session, peer_tx) = PeerSession::new(address, Arc::clone(ctx));
        self.peers.insert(address, PeerHandle::start_session(session, peer_tx, Some(stream), permit));
    }

    pub fn peer_connected(&mut self, address: SocketAddr, id: ID) {
        if let Some(peer) = self.peers.get_mut(&address) {
            peer.id = Some(id);
        }
    }

    pub fn update_state(&mut self, address: SocketAddr, state: SessionState) {
        if let Some(peer) = self.peers.get_mut(&address) {
            peer.state = state;
            self.throughput += &state.throughput;
        }
    }

    // Peers closed with an error are not retried until the cooldown passes.
    pub fn peer_closed(&mut self, address: SocketAddr, error: Option<String>) {
        if self.peers.remove(&address).is_none() {
            return;
        }
        match error {
            Some(e) => {
                tracing::debug!("peer {} closed: {}", address, e);
                self.park(address);
            },
            None => tracing::debug!("peer {} closed", address),
        }
    }

    pub fn broadcast(&self, cmd: impl Fn() -> PeerCommand) {
        for peer in self.peers.values() {
            peer.peer_tx.send(cmd()).ok();
        }
    }

    // Ends every session but keeps the addresses to reconnect to later.
    pub fn disconnect_all(&mut self) {
        let addresses: Vec<SocketAddr> = self.peers.keys().copied().collect();
        self.broadcast(|| PeerCommand::Shutdown);
        self.peers.clear();
        self.add_candidates(addresses);
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    // Peers that completed the handshake.
    pub fn num_connected(&self) -> usize {
        self.peers.values().filter(|p| p.state.conn_state.is_connected()).count()
    }

    // Whether there is anyone left to try, now or after a cooldown.
    pub fn has_candidates(&self) -> bool {
        !self.candidates.is_empty() || !self.parked.is_empty()
    }

    pub fn num_candidates(&self) -> usize {
        self.candidates.len()
    }

    // Returns the throughput gathered since the last call.
    pub fn take_throughput(&mut self) -> ThroughputStats {
        std::mem::take(&mut self.throughput)
    }

    // Moves parked peers whose cooldown passed back into the queue.
    pub fn release_parked(&mut self) {
        let now = Instant::now();
        let ready: Vec<SocketAddr> = self.parked
            .iter()
            .filter(|(_, until)| **until <= now)
            .map(|(address, _)| *address)
            .collect();
        for address in ready {
            self.parked.remove(&address);
            self.add_candidates([address]);
        }
    }

    // Asks every session to stop, aborting those still running after the grace period.
    pub async fn shutdown(&mut self, grace: Duration) {
        if self.peers.is_empty() {
            return;
        }
        tracing::info!("disconnecting from {} peers", self.peers.len());
        self.broadcast(|| PeerCommand::Shutdown);
        let deadline = Instant::now() + grace;
        for (address, mut peer) in self.peers.drain() {
            if time::timeout_at(deadline, &mut peer.session_handle).await.is_err() {
                tracing::debug!("aborting session with {}", address);
                peer.session_handle.abort();
            }
        }
    }
}
