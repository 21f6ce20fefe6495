use std::{
    collections::HashSet,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex, OnceLock, PoisonError},
    time::Duration,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch, Semaphore},
    task::JoinSet,
    time,
};
use tokio_util::sync::CancellationToken;
use url::Url;
use crate::{
    config::Config,
    events::{Callbacks, TorrentEvent},
    fs::{self, StorageError, StorageKind},
    magnet::Magnet,
    metadata::fetch_metadata,
    metainfo::{MetaInfo, MetaInfoError},
    p2p::{state::SessionState, PeerCommand},
    picker::{Picker, Strategy},
    pieces::{PieceStore, Priority, StoreError},
    resume::ResumeData,
    session::TorrentMode,
    stats::{DownloadStatus, ThroughputStats},
    store::StoreInfo,
    swarm::Swarm,
    tracker::{AnnounceParams, Event, Trackers},
    TorrentHandle,
    ID,
};

mod state;
pub use state::TorrentState;

// Metadata is fetched from this many peers at once.
const MAX_METADATA_FETCHES: usize = 4;

// Peers report their throughput once a second, rates are folded in step.
const RATE_INTERVAL: Duration = Duration::from_secs(1);

// Reported to trackers as the bytes left while the size is still unknown.
const UNKNOWN_LEFT: u64 = i64::MAX as u64;

#[derive(Debug, thiserror::Error)]
pub enum TorrentError {

    #[error("invalid metadata: {0}")]
    MetaInfo(#[from] MetaInfoError),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("all peer sources exhausted")]
    PeersExhausted,

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("channel error: {0}")]
    ChannelError(String),

}

impl From<StorageError> for TorrentError {
    fn from(e: StorageError) -> Self {
        TorrentError::Storage(e.to_string())
    }
}

impl From<StoreError> for TorrentError {
    fn from(e: StoreError) -> Self {
        TorrentError::Storage(e.to_string())
    }
}

impl<T> From<mpsc::error::SendError<T>> for TorrentError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        TorrentError::ChannelError(e.to_string())
    }
}

#[derive(Debug)]
pub enum CommandToTorrent {

    // Sent by peer task when peer successfully connects.
    PeerConnected { address: SocketAddr, id: ID },

    PeerState { address: SocketAddr, state: SessionState },

    // Sent by peer task once the session is over, with the reason if it failed.
    PeerClosed { address: SocketAddr, error: Option<String> },

    // Sent by peer task when a completed piece was hashed.
    PieceWritten { idx: usize, valid: bool },

    // A peer gave back requested blocks, others should pick them up.
    BlocksFreed,

    StorageFailure(String),

    // Sent by trackers.
    Peers(Vec<SocketAddr>),

    // Tracker gave up after repeated failures.
    TrackerFailed { url: Url, error: String },

    Pause,

    Resume,

    SetFilePriority { file_idx: usize, priority: Priority },

    // Stream windows moved, wanted pieces may have changed.
    PrioritiesChanged,

    Shutdown { delete_files: bool },

}

pub type Result<T> = std::result::Result<T, TorrentError>;
pub type TorrentTx = mpsc::UnboundedSender<CommandToTorrent>;
pub type TorrentRx = mpsc::UnboundedReceiver<CommandToTorrent>;

// Read-only state shared with peers and streams once metadata is known.
#[derive(Debug)]
pub struct TorrentContext {

    pub handle: TorrentHandle,

    // The info hash for this torrent.
    pub info_hash: ID,

    // The client ID for this client.
    pub client_id: ID,

    pub metainfo: MetaInfo,

    pub store: Arc<PieceStore>,

    // Allows for peers to pick next block to download.
    pub picker: Picker,

    pub config: Config,

    // Commands to the torrent.
    pub torrent_tx: TorrentTx,

}

impl TorrentContext {
    pub fn info(&self) -> &StoreInfo {
        self.store.info()
    }
}

// What a torrent is started from.
#[derive(Debug)]
pub enum TorrentInput {
    MetaInfo(MetaInfo),
    Magnet(Magnet),
}

// Torrent state visible to the session and streams.
#[derive(Debug)]
pub struct TorrentShared {

    pub handle: TorrentHandle,

    pub info_hash: ID,

    pub mode: TorrentMode,

    state_tx: watch::Sender<TorrentState>,

    ctx: OnceLock<Arc<TorrentContext>>,

    pub callbacks: Callbacks<TorrentEvent>,

    status: Mutex<DownloadStatus>,

    error: Mutex<Option<String>>,

    // Cancelled once the torrent task has finished.
    closed: CancellationToken,

    torrent_tx: TorrentTx,

}

impl TorrentShared {

    pub fn state(&self) -> TorrentState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TorrentState> {
        self.state_tx.subscribe()
    }

    pub fn context(&self) -> Option<Arc<TorrentContext>> {
        self.ctx.get().cloned()
    }

    pub fn metainfo(&self) -> Option<MetaInfo> {
        self.ctx.get().map(|ctx| ctx.metainfo.clone())
    }

    pub fn status(&self) -> DownloadStatus {
        self.status.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    pub fn send(&self, cmd: CommandToTorrent) -> Result<()> {
        Ok(self.torrent_tx.send(cmd)?)
    }
}

pub struct TorrentParams {

    pub handle: TorrentHandle,

    pub input: TorrentInput,

    pub config: Config,

    pub save_dir: PathBuf,

    // Indexes of files to download, all when None.
    pub wanted_files: Option<Vec<usize>>,

    pub mode: TorrentMode,

    pub peers: Vec<SocketAddr>,

    pub storage: StorageKind,

    pub listen_address: Option<SocketAddr>,

    // Connection budget of the session.
    pub connections: Arc<Semaphore>,

}

#[derive(Debug)]
pub struct Torrent {

    shared: Arc<TorrentShared>,

    ctx: Option<Arc<TorrentContext>>,

    input: Option<TorrentInput>,

    trackers: Trackers,

    // Trackers that gave up.
    exhausted: HashSet<Url>,

    // Event sent with the next announce.
    tracker_event: Event,

    swarm: Swarm,

    torrent_rx: TorrentRx,

    torrent_tx: TorrentTx,

    config: Config,

    save_dir: PathBuf,

    wanted_files: Option<Vec<usize>>,

    storage: StorageKind,

    listen_address: Option<SocketAddr>,

    listen_port: u16,

    // One per file, mapped onto piece priorities.
    file_priorities: Vec<Priority>,

    // File priorities set before the metadata was known.
    pending_priorities: Vec<(usize, Priority)>,

    throughput: ThroughputStats,

    // Start of the current throughput round.
    round_start: time::Instant,

    // Set once shutdown was requested, with whether to delete the data.
    shutdown: Option<bool>,

}

impl Torrent {

    pub fn new(params: TorrentParams) -> (Torrent, Arc<TorrentShared>) {

        let (torrent_tx, torrent_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(TorrentState::Creating);

        let (info_hash, mut urls, mut peers) = match &params.input {
            TorrentInput::MetaInfo(metainfo) => (metainfo.info_hash(), metainfo.tracker_urls(), Vec::new()),
            TorrentInput::Magnet(magnet) => (magnet.info_hash, magnet.trackers.clone(), magnet.peers.clone()),
        };
        for url in params.config.custom_trackers.iter() {
            if !urls.contains(url) {
                urls.push(url.clone());
            }
        }
        peers.extend(params.peers);

        let shared = Arc::new(TorrentShared {
            handle: params.handle,
            info_hash,
            mode: params.mode,
            state_tx,
            ctx: OnceLock::new(),
            callbacks: Callbacks::new(),
            status: Mutex::new(DownloadStatus::default()),
            error: Mutex::new(None),
            closed: CancellationToken::new(),
            torrent_tx: torrent_tx.clone(),
        });

        let mut swarm = Swarm::new(
            params.connections,
            params.config.min_max_peers.1 as usize,
            params.config.peer_cooldown,
        );
        swarm.add_candidates(peers);

        let torrent = Torrent {
            shared: Arc::clone(&shared),
            ctx: None,
            input: Some(params.input),
            trackers: Trackers::new(urls),
            exhausted: HashSet::new(),
            tracker_event: Event::Started,
            swarm,
            torrent_rx,
            torrent_tx,
            config: params.config,
            save_dir: params.save_dir,
            wanted_files: params.wanted_files,
            storage: params.storage,
            listen_address: params.listen_address,
            listen_port: 0,
            file_priorities: Vec::new(),
            pending_priorities: Vec::new(),
            throughput: ThroughputStats::default(),
            round_start: time::Instant::now(),
            shutdown: None,
        };
        (torrent, shared)
    }

    #[tracing::instrument(name = "torrent", skip_all, fields(handle = %self.shared.handle))]
    pub async fn start(mut self) {
        tracing::info!("starting torrent {}", hex::encode(self.shared.info_hash));

        let delete_files = match self.run().await {
            Ok(()) => self.shutdown.unwrap_or(false),
            Err(e) => {
                self.fail(e);
                self.wait_for_shutdown().await
            }
        };

        self.cleanup(delete_files).await;
        self.shared.closed.cancel();
        tracing::info!("torrent stopped");
    }

    async fn run(&mut self) -> Result<()> {

        let listener = self.bind_listener().await;
        self.trackers.start(
            self.torrent_tx.clone(),
            self.config.tracker_timeout,
            self.config.tracker_max_failures,
            self.config.announce_interval,
        );
        self.trackers.announce(self.announce_params());

        let metainfo = match self.input.take() {
            Some(TorrentInput::MetaInfo(metainfo)) => metainfo,
            Some(TorrentInput::Magnet(magnet)) => {
                self.set_state(TorrentState::RetrievingMetadata);
                match self.retrieve_metadata(&magnet).await? {
                    Some(metainfo) => metainfo,
                    None => return Ok(()),
                }
            },
            None => return Err(TorrentError::ChannelError("torrent started twice".to_string())),
        };

        self.setup(metainfo)?;
        self.check_files().await?;
        if self.shutdown.is_some() {
            return Ok(());
        }
        self.run_loop(listener).await
    }

    async fn bind_listener(&mut self) -> Option<TcpListener> {
        let address = self.listen_address?;
        match TcpListener::bind(address).await {
            Ok(listener) => {
                if let Ok(local) = listener.local_addr() {
                    tracing::info!("listening on {}", local);
                    self.listen_port = local.port();
                    self.swarm.set_own_address(local);
                }
                Some(listener)
            },
            Err(e) => {
                tracing::warn!("failed to listen on {}: {}", address, e);
                None
            }
        }
    }

    // Fetches the info dict from peers until one delivers it.
    // Returns None if the torrent was shut down first.
    async fn retrieve_metadata(&mut self, magnet: &Magnet) -> Result<Option<MetaInfo>> {

        let mut fetches = JoinSet::new();
        // Peers being asked, requeued as download candidates once metadata arrives.
        let mut in_flight = HashSet::new();
        let mut ticker = time::interval(self.config.status_interval);
        let mut trackers = magnet.trackers.clone();
        trackers.extend(self.config.custom_trackers.iter().cloned());

        loop { tokio::select! {

            Some(joined) = fetches.join_next(), if !fetches.is_empty() => match joined {
                Ok((_, Ok(metainfo))) => {
                    self.swarm.add_candidates(in_flight);
                    return Ok(Some(metainfo));
                },
                Ok((address, Err(e))) => {
                    tracing::debug!("metadata from {} failed: {}", address, e);
                    in_flight.remove(&address);
                    self.swarm.park(address);
                },
                Err(e) => tracing::warn!("metadata task failed: {}", e),
            },

            Some(cmd) = self.torrent_rx.recv() => {
                self.handle_command(cmd).await?;
                if self.shutdown.is_some() {
                    return Ok(None);
                }
            },

            _ = ticker.tick() => {
                self.swarm.release_parked();
                while fetches.len() < MAX_METADATA_FETCHES {
                    let Some(permit) = self.swarm.acquire_permit() else { break };
                    let Some(address) = self.swarm.pop_candidate() else { break };
                    let info_hash = self.shared.info_hash;
                    let client_id = self.config.client_id;
                    let timeout = self.config.metadata_timeout;
                    let trackers = trackers.clone();
                    in_flight.insert(address);
                    fetches.spawn(async move {
                        let result = fetch_metadata(address, info_hash, client_id, &trackers, timeout).await;
                        drop(permit);
                        (address, result)
                    });
                }
                self.publish_status();
                self.trackers.announce(self.announce_params());
                if fetches.is_empty() {
                    self.check_exhausted()?;
                }
            },

        }}
    }

    // Creates the store once metadata is known.
    fn setup(&mut self, metainfo: MetaInfo) -> Result<()> {

        let info = StoreInfo::new(&metainfo, self.save_dir.clone());
        let num_pieces = info.num_pieces;
        let num_files = info.files.len();
        let storage = fs::open(self.storage, &info)?;
        let store = Arc::new(PieceStore::new(
            info,
            metainfo.piece_hashes(),
            storage,
            self.shared.mode == TorrentMode::Download,
        ));
        let strategy = match self.shared.mode {
            TorrentMode::Stream => Strategy::Sequential,
            TorrentMode::Download => Strategy::RarestFirst,
        };

        let ctx = Arc::new(TorrentContext {
            handle: self.shared.handle,
            info_hash: self.shared.info_hash,
            client_id: self.config.client_id,
            metainfo,
            store,
            picker: Picker::new(num_pieces, strategy, self.config.endgame_ratio),
            config: self.config.clone(),
            torrent_tx: self.torrent_tx.clone(),
        });
        self.shared.ctx.set(Arc::clone(&ctx)).ok();
        self.ctx = Some(ctx);

        self.file_priorities = match &self.wanted_files {
            Some(wanted) => (0..num_files)
                .map(|i| if wanted.contains(&i) { Priority::Normal } else { Priority::None })
                .collect(),
            None => vec![Priority::Normal; num_files],
        };
        tracing::info!("{} pieces in {} files", num_pieces, num_files);
        Ok(())
    }

    async fn check_files(&mut self) -> Result<()> {

        let Some(ctx) = self.ctx.clone() else { return Ok(()) };
        self.set_state(TorrentState::CheckingFiles);

        if self.storage == StorageKind::Disk {
            let resume = match ResumeData::load(&self.save_dir, &ctx.info_hash, ctx.info().num_pieces) {
                Ok(resume) => resume,
                Err(e) => {
                    tracing::warn!("failed to load resume data: {}", e);
                    None
                }
            };
            if let Some(resume) = &resume {
                let priorities = resume.file_priorities();
                if self.wanted_files.is_none() && priorities.len() == self.file_priorities.len() {
                    self.file_priorities = priorities;
                }
            }
            self.apply_pending_priorities();
            self.apply_file_priorities();
            ctx.store.check_files(resume.map(|r| r.verified())).await?;
        } else {
            self.apply_pending_priorities();
            self.apply_file_priorities();
        }

        let next = if ctx.store.wanted_remaining() == 0 {
            TorrentState::Completed
        } else {
            TorrentState::Downloading
        };
        self.set_state(next);
        self.publish_status();
        Ok(())
    }

    async fn run_loop(&mut self, listener: Option<TcpListener>) -> Result<()> {

        let mut ticker = time::interval(self.config.status_interval);
        self.round_start = time::Instant::now();
        let mut rates = time::interval_at(self.round_start + RATE_INTERVAL, RATE_INTERVAL);

        loop { tokio::select! {

            _ = ticker.tick() => self.tick()?,

            _ = rates.tick() => self.fold_throughput(),

            accepted = accept(&listener) => match accepted {
                Ok((stream, address)) => self.handle_inbound(stream, address),
                Err(e) => tracing::warn!("inbound peer connection error: {}", e),
            },

            Some(cmd) = self.torrent_rx.recv() => {
                self.handle_command(cmd).await?;
                if self.shutdown.is_some() {
                    return Ok(());
                }
            },

        }}
    }

    fn handle_inbound(&mut self, stream: TcpStream, address: SocketAddr) {
        match &self.ctx {
            Some(ctx) if self.shared.state().is_active() => {
                let ctx = Arc::clone(ctx);
                self.swarm.accept(&ctx, stream, address);
            },
            _ => tracing::debug!("dropping inbound connection from {}", address),
        }
    }

    // Folds peer throughput into the torrent rates.
    fn fold_throughput(&mut self) {
        let now = time::Instant::now();
        let round = self.swarm.take_throughput();
        self.throughput += &round;
        self.throughput.end_round(now.saturating_duration_since(self.round_start));
        self.round_start = now;
    }

    fn tick(&mut self) -> Result<()> {

        if self.shared.state() == TorrentState::Downloading {
            if let Some(ctx) = self.ctx.clone() {
                self.swarm.release_parked();
                self.swarm.connect_to_peers(&ctx);
            }
        }

        self.publish_status();
        self.trackers.announce(self.announce_params());
        self.check_exhausted()
    }

    async fn handle_command(&mut self, cmd: CommandToTorrent) -> Result<()> {
        match cmd {

            CommandToTorrent::PeerConnected { address, id } => self.swarm.peer_connected(address, id),

            CommandToTorrent::PeerState { address, state } => self.swarm.update_state(address, state),

            CommandToTorrent::PeerClosed { address, error } => self.swarm.peer_closed(address, error),

            CommandToTorrent::PieceWritten { idx, valid } => self.handle_piece_write(idx, valid),

            CommandToTorrent::BlocksFreed => self.swarm.broadcast(|| PeerCommand::RequestMore),

            CommandToTorrent::StorageFailure(e) => {
                if self.shared.state() == TorrentState::Paused {
                    tracing::error!("storage failure while paused: {}", e);
                    self.shared.callbacks.invoke(&TorrentEvent::Error(e));
                } else {
                    return Err(TorrentError::Storage(e));
                }
            },

            CommandToTorrent::Peers(peers) => self.swarm.add_candidates(peers),

            CommandToTorrent::TrackerFailed { url, error } => {
                tracing::warn!("tracker {} exhausted: {}", url, error);
                self.exhausted.insert(url);
            },

            CommandToTorrent::Pause => self.pause(),

            CommandToTorrent::Resume => self.resume(),

            CommandToTorrent::SetFilePriority { file_idx, priority } => self.set_file_priority(file_idx, priority),

            CommandToTorrent::PrioritiesChanged => self.priorities_changed(),

            CommandToTorrent::Shutdown { delete_files } => self.shutdown = Some(delete_files),

        }
        Ok(())
    }

    fn handle_piece_write(&mut self, idx: usize, valid: bool) {
        if valid {
            self.shared.callbacks.invoke(&TorrentEvent::PieceFinished(idx));
            self.swarm.broadcast(|| PeerCommand::PieceWritten(idx));
            if let Some(ctx) = &self.ctx {
                tracing::debug!("piece {} verified, {} wanted pieces remain", idx, ctx.store.wanted_remaining());
            }
            self.check_completion();
        } else {
            // TODO: track which peers sent blocks of failed pieces and ban repeat offenders.
            tracing::warn!("piece {} failed verification", idx);
            self.swarm.broadcast(|| PeerCommand::RequestMore);
        }
    }

    // Moves between downloading and completed as wanted pieces are verified or added.
    fn check_completion(&mut self) {
        let Some(ctx) = &self.ctx else { return };
        let remaining = ctx.store.wanted_remaining();
        match self.shared.state() {
            TorrentState::Downloading if remaining == 0 => {
                tracing::info!("torrent download complete");
                self.set_state(TorrentState::Completed);
                self.tracker_event = Event::Completed;
                self.save_resume();
                self.publish_status();
            },
            TorrentState::Completed if remaining > 0 => {
                tracing::info!("{} more pieces wanted, downloading again", remaining);
                self.set_state(TorrentState::Downloading);
            },
            _ => {},
        }
    }

    fn pause(&mut self) {
        let state = self.shared.state();
        if state != TorrentState::Downloading {
            tracing::warn!("cannot pause torrent while {}", state);
            return;
        }
        self.set_state(TorrentState::Paused);
        self.swarm.disconnect_all();
        self.save_resume();
        self.publish_status();
    }

    fn resume(&mut self) {
        let state = self.shared.state();
        if state != TorrentState::Paused {
            tracing::warn!("cannot resume torrent while {}", state);
            return;
        }
        self.set_state(TorrentState::Downloading);
        self.check_completion();
    }

    fn set_file_priority(&mut self, file_idx: usize, priority: Priority) {
        if self.ctx.is_none() {
            self.pending_priorities.push((file_idx, priority));
            return;
        }
        match self.file_priorities.get_mut(file_idx) {
            Some(p) => *p = priority,
            None => {
                tracing::warn!("no file with index {}", file_idx);
                return;
            }
        }
        if self.apply_file_priorities() {
            self.priorities_changed();
        }
    }

    fn apply_pending_priorities(&mut self) {
        for (file_idx, priority) in std::mem::take(&mut self.pending_priorities) {
            match self.file_priorities.get_mut(file_idx) {
                Some(p) => *p = priority,
                None => tracing::warn!("no file with index {}", file_idx),
            }
        }
    }

    // A piece gets the highest priority of the files it overlaps.
    // Returns whether any piece priority changed.
    fn apply_file_priorities(&mut self) -> bool {
        let Some(ctx) = &self.ctx else { return false };
        let info = ctx.info();
        let mut changed = false;
        for idx in 0..info.num_pieces {
            let priority = info
                .piece_file_intersections(idx)
                .filter_map(|file| self.file_priorities.get(file).copied())
                .max()
                .unwrap_or(Priority::None);
            changed |= ctx.store.set_priority(idx..idx + 1, priority);
        }
        changed
    }

    fn priorities_changed(&mut self) {
        let Some(ctx) = &self.ctx else { return };
        let strategy = if self.shared.mode == TorrentMode::Stream || ctx.store.has_streams() {
            Strategy::Sequential
        } else {
            Strategy::RarestFirst
        };
        ctx.picker.set_strategy(strategy);
        self.swarm.broadcast(|| PeerCommand::RequestMore);
        self.check_completion();
    }

    fn set_state(&self, new: TorrentState) -> bool {
        let old = self.shared.state();
        if old == new {
            return true;
        }
        if !old.can_transition_to(new) {
            tracing::warn!("invalid state transition from {} to {}", old, new);
            return false;
        }
        self.shared.state_tx.send_replace(new);
        self.shared.status.lock().unwrap_or_else(PoisonError::into_inner).state = new;
        tracing::info!("state changed from {} to {}", old, new);
        self.shared.callbacks.invoke(&TorrentEvent::StateChanged { old, new });
        true
    }

    fn fail(&mut self, error: TorrentError) {
        let msg = error.to_string();
        tracing::error!("torrent failed: {}", msg);
        *self.shared.error.lock().unwrap_or_else(PoisonError::into_inner) = Some(msg.clone());
        self.set_state(TorrentState::Error);
        self.publish_status();
        self.shared.callbacks.invoke(&TorrentEvent::Error(msg));
    }

    // In the error state nothing but removal is left to do.
    async fn wait_for_shutdown(&mut self) -> bool {
        self.swarm.shutdown(self.config.shutdown_grace).await;
        while let Some(cmd) = self.torrent_rx.recv().await {
            if let CommandToTorrent::Shutdown { delete_files } = cmd {
                return delete_files;
            }
        }
        false
    }

    async fn cleanup(&mut self, delete_files: bool) {
        self.swarm.shutdown(self.config.shutdown_grace).await;
        self.trackers.shutdown(self.announce_params(), self.config.shutdown_grace).await;

        let Some(ctx) = self.ctx.clone() else { return };
        if delete_files {
            tracing::info!("deleting torrent data");
            if let Err(e) = ctx.store.remove_files().await {
                tracing::warn!("failed to delete torrent data: {}", e);
            }
            if let Err(e) = ResumeData::remove(&self.save_dir, &ctx.info_hash) {
                tracing::warn!("failed to delete resume data: {}", e);
            }
        } else {
            self.save_resume();
        }
    }

    fn save_resume(&self) {
        let Some(ctx) = &self.ctx else { return };
        if self.storage != StorageKind::Disk {
            return;
        }
        let data = ResumeData::new(ctx.info_hash, &ctx.store.verified_bitfield(), &self.file_priorities);
        match data.save(&self.save_dir) {
            Ok(()) => tracing::debug!("resume data saved"),
            Err(e) => tracing::warn!("failed to save resume data: {}", e),
        }
    }

    // A torrent fails once every tracker gave up and no peer is left to try.
    // Without trackers peers can still arrive inbound, so it never fails.
    fn check_exhausted(&self) -> Result<()> {
        if !matches!(self.shared.state(), TorrentState::RetrievingMetadata | TorrentState::Downloading) {
            return Ok(());
        }
        if !self.trackers.is_empty()
            && self.exhausted.len() >= self.trackers.len()
            && self.swarm.is_empty()
            && !self.swarm.has_candidates()
        {
            return Err(TorrentError::PeersExhausted);
        }
        Ok(())
    }

    fn build_status(&self) -> DownloadStatus {
        let state = self.shared.state();
        let mut status = match &self.ctx {
            Some(ctx) => {
                let mut status = DownloadStatus::new(state, ctx.store.downloaded_wanted_bytes(), ctx.store.wanted_bytes());
                status.pieces_verified = ctx.store.num_verified();
                status.pieces_total = ctx.store.num_pieces();
                status
            },
            None => DownloadStatus { progress: 0.0, ..DownloadStatus::new(state, 0, 0) },
        };
        status.connections = self.swarm.num_connected();
        status.download_rate = self.throughput.down.avg();
        status.upload_rate = self.throughput.up.avg();
        status
    }

    fn publish_status(&self) {
        let status = self.build_status();
        *self.shared.status.lock().unwrap_or_else(PoisonError::into_inner) = status.clone();
        self.shared.callbacks.invoke(&TorrentEvent::DownloadStatus(status));
    }

    fn announce_params(&self) -> AnnounceParams {
        let left = match &self.ctx {
            Some(ctx) => ctx.store.wanted_bytes().saturating_sub(ctx.store.downloaded_wanted_bytes()),
            None => UNKNOWN_LEFT,
        };
        let (min_peers, max_peers) = self.config.min_max_peers;
        let num_peers = self.swarm.len() + self.swarm.num_candidates();
        let num_want = if self.shared.state() == TorrentState::Paused || num_peers >= min_peers as usize {
            None
        } else {
            Some((max_peers as usize).saturating_sub(num_peers))
        };
        AnnounceParams {
            info_hash: self.shared.info_hash,
            client_id: self.config.client_id,
            port: self.listen_port,
            uploaded: self.throughput.up.total(),
            downloaded: self.throughput.down.total(),
            left,
            event: Some(self.tracker_event),
            num_want,
        }
    }
}

async fn accept(listener: &Option<TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
impl TorrentContext {
    // Context over memory storage, with the receiving end of its command channel.
    pub(crate) fn test_context(metainfo: MetaInfo, mode: TorrentMode) -> (Arc<Self>, TorrentRx) {
        let (torrent_tx, torrent_rx) = mpsc::unbounded_channel();
        let info = StoreInfo::new(&metainfo, PathBuf::new());
        let storage = Arc::new(fs::MemoryStorage::new(&info));
        let num_pieces = info.num_pieces;
        let store = Arc::new(PieceStore::new(info, metainfo.piece_hashes(), storage, mode == TorrentMode::Download));
        let config = Config::default();
        let ctx = TorrentContext {
            handle: TorrentHandle(0),
            info_hash: metainfo.info_hash(),
            client_id: config.client_id,
            metainfo,
            store,
            picker: Picker::new(num_pieces, Strategy::Sequential, config.endgame_ratio),
            config,
            torrent_tx,
        };
        (Arc::new(ctx), torrent_rx)
    }
}

#[cfg(test)]
impl TorrentShared {
    pub(crate) fn test_shared(ctx: Arc<TorrentContext>, state: TorrentState) -> Arc<Self> {
        let (state_tx, _) = watch::channel(state);
        let shared = TorrentShared {
            handle: ctx.handle,
            info_hash: ctx.info_hash,
            mode: TorrentMode::Stream,
            state_tx,
            ctx: OnceLock::new(),
            callbacks: Callbacks::new(),
            status: Mutex::new(DownloadStatus::default()),
            error: Mutex::new(None),
            closed: CancellationToken::new(),
            torrent_tx: ctx.torrent_tx.clone(),
        };
        shared.ctx.set(ctx).ok();
        Arc::new(shared)
    }

    pub(crate) fn set_test_state(&self, state: TorrentState) {
        self.state_tx.send_replace(state);
    }
}
