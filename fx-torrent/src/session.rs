use std::{
    collections::HashMap,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError, RwLock, Weak,
    },
};
use tokio::{sync::Semaphore, task::JoinHandle};
use crate::{
    config::Config,
    events::{CallbackHandle, TorrentEvent},
    magnet::{Magnet, MagnetError},
    metainfo::{MetaInfo, MetaInfoError},
    pieces::Priority,
    stats::DownloadStatus,
    stream::{FileSelector, StreamError, StreamInner, TorrentStream},
    torrent::{CommandToTorrent, Torrent, TorrentError, TorrentInput, TorrentParams, TorrentShared, TorrentState},
    StreamHandle,
    TorrentHandle,
};

pub use crate::fs::StorageKind;

#[derive(thiserror::Error, Debug)]
pub enum SessionError {

    #[error("{0} is not in the session")]
    UnknownTorrent(TorrentHandle),

    #[error("{0} is not in the session")]
    UnknownStream(StreamHandle),

    #[error("torrent {0} was already added")]
    DuplicateTorrent(String),

    #[error("no file with index {0}")]
    InvalidFile(usize),

    #[error("invalid magnet link: {0}")]
    Magnet(#[from] MagnetError),

    #[error("invalid metainfo: {0}")]
    MetaInfo(#[from] MetaInfoError),

    #[error(transparent)]
    Torrent(#[from] TorrentError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("session has been shut down")]
    Shutdown,

}

pub type Result<T> = std::result::Result<T, SessionError>;

// Where a torrent comes from.
#[derive(Debug, Clone)]
pub enum TorrentSource {
    Magnet(String),
    // Path to a .torrent file.
    File(PathBuf),
    // Raw bencoded metainfo.
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TorrentMode {
    #[default]
    Download,
    // Pieces are fetched in order and skipped pieces may be left out.
    Stream,
}

#[derive(Debug, Clone, Default)]
pub struct AddTorrentOptions {

    // Defaults to the directory of the session config.
    pub save_dir: Option<PathBuf>,

    // Indexes of the files to download, all of them when None.
    pub wanted_files: Option<Vec<usize>>,

    pub mode: TorrentMode,

    // Peers to try before any tracker answers.
    pub peers: Vec<SocketAddr>,

    pub storage: StorageKind,

}

#[derive(Debug)]
struct TorrentEntry {
    shared: Arc<TorrentShared>,
    join: JoinHandle<()>,
}

#[derive(Debug)]
struct SessionInner {

    config: Config,

    torrents: RwLock<HashMap<TorrentHandle, TorrentEntry>>,

    streams: Mutex<HashMap<StreamHandle, Weak<StreamInner>>>,

    next_torrent: AtomicU64,

    next_stream: AtomicU64,

    // Connection budget shared by every torrent.
    connections: Arc<Semaphore>,

    // Offset added to the listen port, incremented by 1 for each new torrent.
    port_offset: AtomicU64,

    closed: AtomicBool,

}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let torrents = self.torrents.get_mut().unwrap_or_else(PoisonError::into_inner);
        for entry in torrents.values() {
            entry.shared.send(CommandToTorrent::Shutdown { delete_files: false }).ok();
        }
    }
}

// Registry of torrents and streams, addressed by handles.
#[derive(Debug, Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {

    pub fn new(config: Config) -> Session {
        let connections = Arc::new(Semaphore::new(config.max_connections));
        Session {
            inner: Arc::new(SessionInner {
                config,
                torrents: RwLock::new(HashMap::new()),
                streams: Mutex::new(HashMap::new()),
                next_torrent: AtomicU64::new(1),
                next_stream: AtomicU64::new(1),
                connections,
                port_offset: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    fn torrents(&self) -> std::sync::RwLockReadGuard<'_, HashMap<TorrentHandle, TorrentEntry>> {
        self.inner.torrents.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn torrents_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<TorrentHandle, TorrentEntry>> {
        self.inner.torrents.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn shared(&self, handle: TorrentHandle) -> Result<Arc<TorrentShared>> {
        self.torrents()
            .get(&handle)
            .map(|entry| Arc::clone(&entry.shared))
            .ok_or(SessionError::UnknownTorrent(handle))
    }

    fn send(&self, handle: TorrentHandle, cmd: CommandToTorrent) -> Result<()> {
        Ok(self.shared(handle)?.send(cmd)?)
    }

    // Each torrent listens on its own port, unless the OS picks one.
    fn next_listen_address(&self) -> Option<SocketAddr> {
        let mut address = self.inner.config.listen_address?;
        if address.port() != 0 {
            let offset = self.inner.port_offset.fetch_add(1, Ordering::Relaxed);
            match u16::try_from(address.port() as u64 + offset) {
                Ok(port) => address.set_port(port),
                Err(_) => {
                    tracing::warn!("ran out of listen ports, letting the OS pick one");
                    address.set_port(0);
                }
            }
        }
        Some(address)
    }

    #[tracing::instrument(skip_all)]
    pub async fn add_torrent(&self, source: TorrentSource, options: AddTorrentOptions) -> Result<TorrentHandle> {

        if self.inner.closed.load(Ordering::Acquire) {
            return Err(SessionError::Shutdown);
        }

        let input = match source {
            TorrentSource::Magnet(uri) => TorrentInput::Magnet(Magnet::parse(&uri)?),
            TorrentSource::File(path) => {
                let metainfo = tokio::task::spawn_blocking(move || MetaInfo::from_file(path))
                    .await
                    .map_err(|e| TorrentError::IoError(std::io::Error::new(std::io::ErrorKind::Other, e)))??;
                TorrentInput::MetaInfo(metainfo)
            },
            TorrentSource::Bytes(bytes) => TorrentInput::MetaInfo(MetaInfo::from_bytes(&bytes)?),
        };
        let info_hash = match &input {
            TorrentInput::MetaInfo(metainfo) => metainfo.info_hash(),
            TorrentInput::Magnet(magnet) => magnet.info_hash,
        };

        let mut torrents = self.torrents_mut();
        if torrents.values().any(|entry| entry.shared.info_hash == info_hash) {
            return Err(SessionError::DuplicateTorrent(hex::encode(info_hash)));
        }

        let handle = TorrentHandle(self.inner.next_torrent.fetch_add(1, Ordering::Relaxed));
        let (torrent, shared) = Torrent::new(TorrentParams {
            handle,
            input,
            config: self.inner.config.clone(),
            save_dir: options.save_dir.unwrap_or_else(|| self.inner.config.dir.clone()),
            wanted_files: options.wanted_files,
            mode: options.mode,
            peers: options.peers,
            storage: options.storage,
            listen_address: self.next_listen_address(),
            connections: Arc::clone(&self.inner.connections),
        });
        let join = tokio::spawn(torrent.start());
        torrents.insert(handle, TorrentEntry { shared, join });

        tracing::info!("added torrent {} as {}", hex::encode(info_hash), handle);
        Ok(handle)
    }

    // Stops the torrent and waits for it to close, its streams stop with it.
    #[tracing::instrument(skip(self))]
    pub async fn remove_torrent(&self, handle: TorrentHandle, delete_files: bool) -> Result<()> {
        let entry = self.torrents_mut()
            .remove(&handle)
            .ok_or(SessionError::UnknownTorrent(handle))?;
        entry.shared.send(CommandToTorrent::Shutdown { delete_files }).ok();
        if let Err(e) = entry.join.await {
            tracing::error!("{} panicked: {}", handle, e);
        }
        self.streams().retain(|_, stream| {
            stream.upgrade().map_or(false, |s| s.torrent() != handle)
        });
        tracing::info!("removed {}", handle);
        Ok(())
    }

    pub fn pause(&self, handle: TorrentHandle) -> Result<()> {
        self.send(handle, CommandToTorrent::Pause)
    }

    pub fn resume(&self, handle: TorrentHandle) -> Result<()> {
        self.send(handle, CommandToTorrent::Resume)
    }

    // Priority None leaves the file out. Before the metadata is known the
    // priority is kept until the file list arrives.
    pub fn set_file_priority(&self, handle: TorrentHandle, file_idx: usize, priority: Priority) -> Result<()> {
        let shared = self.shared(handle)?;
        if let Some(metainfo) = shared.metainfo() {
            if file_idx >= metainfo.files().len() {
                return Err(SessionError::InvalidFile(file_idx));
            }
        }
        Ok(shared.send(CommandToTorrent::SetFilePriority { file_idx, priority })?)
    }

    pub fn start_stream(&self, handle: TorrentHandle, selector: FileSelector) -> Result<TorrentStream> {
        let shared = self.shared(handle)?;
        if shared.state() == TorrentState::Error {
            let error = shared.error().unwrap_or_else(|| "torrent failed".to_string());
            return Err(StreamError::Failed(error).into());
        }
        if let Some(metainfo) = shared.metainfo() {
            if selector.select(&metainfo.files()).is_none() {
                return Err(StreamError::NoSuchFile(selector).into());
            }
        }

        let stream_handle = StreamHandle(self.inner.next_stream.fetch_add(1, Ordering::Relaxed));
        let stream = TorrentStream::start(stream_handle, shared, selector, self.inner.config.read_ahead_pieces);
        let mut streams = self.streams();
        streams.retain(|_, stream| stream.strong_count() > 0);
        streams.insert(stream_handle, Arc::downgrade(stream.inner()));

        tracing::info!("started {} on {}", stream_handle, handle);
        Ok(stream)
    }

    pub fn stop_stream(&self, handle: StreamHandle) -> Result<()> {
        let stream = self.streams()
            .remove(&handle)
            .and_then(|stream| stream.upgrade())
            .ok_or(SessionError::UnknownStream(handle))?;
        stream.stop(None);
        Ok(())
    }

    fn streams(&self) -> std::sync::MutexGuard<'_, HashMap<StreamHandle, Weak<StreamInner>>> {
        self.inner.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self, handle: TorrentHandle) -> Result<DownloadStatus> {
        Ok(self.shared(handle)?.status())
    }

    pub fn state(&self, handle: TorrentHandle) -> Result<TorrentState> {
        Ok(self.shared(handle)?.state())
    }

    // None while a magnet's metadata is still being retrieved.
    pub fn metadata(&self, handle: TorrentHandle) -> Result<Option<MetaInfo>> {
        Ok(self.shared(handle)?.metainfo())
    }

    // Error message of a torrent in the error state.
    pub fn error(&self, handle: TorrentHandle) -> Result<Option<String>> {
        Ok(self.shared(handle)?.error())
    }

    pub fn handles(&self) -> Vec<TorrentHandle> {
        let mut handles: Vec<TorrentHandle> = self.torrents().keys().copied().collect();
        handles.sort();
        handles
    }

    pub fn subscribe(
        &self,
        handle: TorrentHandle,
        listener: impl Fn(&TorrentEvent) + Send + Sync + 'static,
    ) -> Result<CallbackHandle> {
        Ok(self.shared(handle)?.callbacks.add(listener))
    }

    pub fn unsubscribe(&self, handle: TorrentHandle, callback: CallbackHandle) -> Result<bool> {
        Ok(self.shared(handle)?.callbacks.remove(callback))
    }

    // Closes every torrent, keeping their data.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let entries: Vec<(TorrentHandle, TorrentEntry)> = self.torrents_mut().drain().collect();
        tracing::info!("shutting down {} torrents", entries.len());

        for (_, entry) in entries.iter() {
            // Some torrents may have already been shut down so don't return err.
            entry.shared.send(CommandToTorrent::Shutdown { delete_files: false }).ok();
        }
        for (handle, entry) in entries {
            if let Err(e) = entry.join.await {
                tracing::error!("{} panicked: {}", handle, e);
            }
        }
        self.streams().clear();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use crate::metainfo::test_metainfo_multi;
    use super::*;

    fn session() -> Session {
        Session::new(Config {
            listen_address: None,
            status_interval: Duration::from_millis(50),
            ..Config::default()
        })
    }

    fn memory_options() -> AddTorrentOptions {
        AddTorrentOptions { storage: StorageKind::Memory, ..Default::default() }
    }

    async fn wait_for_state(session: &Session, handle: TorrentHandle, state: TorrentState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while session.state(handle).unwrap() != state {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }).await.unwrap();
    }

    #[tokio::test]
    async fn test_add_and_remove() {
        let session = session();
        let metainfo = test_metainfo_multi(&[40_000, 10_000], 16_384);
        let bytes = metainfo.to_bytes().unwrap();

        let handle = session.add_torrent(TorrentSource::Bytes(bytes.clone()), memory_options()).await.unwrap();
        wait_for_state(&session, handle, TorrentState::Downloading).await;
        assert_eq!(session.metadata(handle).unwrap().unwrap().info_hash(), metainfo.info_hash());
        assert_eq!(session.handles(), vec![handle]);

        let duplicate = session.add_torrent(TorrentSource::Bytes(bytes), memory_options()).await;
        assert!(matches!(duplicate, Err(SessionError::DuplicateTorrent(_))));

        assert!(matches!(session.set_file_priority(handle, 2, Priority::None), Err(SessionError::InvalidFile(2))));

        session.remove_torrent(handle, false).await.unwrap();
        assert!(matches!(session.state(handle), Err(SessionError::UnknownTorrent(_))));
        assert!(matches!(session.remove_torrent(handle, false).await, Err(SessionError::UnknownTorrent(_))));
    }

    #[tokio::test]
    async fn test_handles_not_reused() {
        let session = session();
        let a = session.add_torrent(
            TorrentSource::Bytes(test_metainfo_multi(&[1000], 16_384).to_bytes().unwrap()),
            memory_options(),
        ).await.unwrap();
        session.remove_torrent(a, false).await.unwrap();
        let b = session.add_torrent(
            TorrentSource::Bytes(test_metainfo_multi(&[1000], 16_384).to_bytes().unwrap()),
            memory_options(),
        ).await.unwrap();
        assert_ne!(a, b);
        session.shutdown().await;
        assert!(session.handles().is_empty());
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let session = session();
        let handle = session.add_torrent(
            TorrentSource::Bytes(test_metainfo_multi(&[40_000], 16_384).to_bytes().unwrap()),
            memory_options(),
        ).await.unwrap();
        wait_for_state(&session, handle, TorrentState::Downloading).await;

        let events = Arc::new(Mutex::new(Vec::new()));
        let e = Arc::clone(&events);
        let callback = session.subscribe(handle, move |event| {
            if let TorrentEvent::StateChanged { old, new } = event {
                e.lock().unwrap().push((*old, *new));
            }
        }).unwrap();

        session.pause(handle).unwrap();
        wait_for_state(&session, handle, TorrentState::Paused).await;
        session.resume(handle).unwrap();
        wait_for_state(&session, handle, TorrentState::Downloading).await;

        assert_eq!(*events.lock().unwrap(), vec![
            (TorrentState::Downloading, TorrentState::Paused),
            (TorrentState::Paused, TorrentState::Downloading),
        ]);
        assert!(session.unsubscribe(handle, callback).unwrap());
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_sources() {
        let session = session();
        let magnet = session.add_torrent(TorrentSource::Magnet("magnet:?xt=urn:btih:zz".to_string()), memory_options()).await;
        assert!(matches!(magnet, Err(SessionError::Magnet(_))));
        let bytes = session.add_torrent(TorrentSource::Bytes(b"not bencode".to_vec()), memory_options()).await;
        assert!(matches!(bytes, Err(SessionError::MetaInfo(_))));

        session.shutdown().await;
        let closed = session.add_torrent(
            TorrentSource::Bytes(test_metainfo_multi(&[1000], 16_384).to_bytes().unwrap()),
            memory_options(),
        ).await;
        assert!(matches!(closed, Err(SessionError::Shutdown)));
    }

    #[tokio::test]
    async fn test_stream_of_missing_file_rejected() {
        let session = session();
        let handle = session.add_torrent(
            TorrentSource::Bytes(test_metainfo_multi(&[1000, 2000], 16_384).to_bytes().unwrap()),
            memory_options(),
        ).await.unwrap();
        wait_for_state(&session, handle, TorrentState::Downloading).await;

        let stream = session.start_stream(handle, FileSelector::Index(5));
        assert!(matches!(stream, Err(SessionError::Stream(StreamError::NoSuchFile(_)))));

        let stream = session.start_stream(handle, FileSelector::Largest).unwrap();
        let stream_handle = stream.handle();
        session.stop_stream(stream_handle).unwrap();
        assert_eq!(stream.state(), crate::StreamState::Stopped);
        assert!(matches!(session.stop_stream(stream_handle), Err(SessionError::UnknownStream(_))));
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_storage_failure_after_completion() {
        let session = session();
        // Nothing wanted, so the torrent completes straight away.
        let handle = session.add_torrent(
            TorrentSource::Bytes(test_metainfo_multi(&[40_000], 16_384).to_bytes().unwrap()),
            AddTorrentOptions { wanted_files: Some(Vec::new()), ..memory_options() },
        ).await.unwrap();
        wait_for_state(&session, handle, TorrentState::Completed).await;

        let errors = Arc::new(Mutex::new(Vec::new()));
        let e = Arc::clone(&errors);
        session.subscribe(handle, move |event| {
            if let TorrentEvent::Error(msg) = event {
                e.lock().unwrap().push(msg.clone());
            }
        }).unwrap();

        session.shared(handle).unwrap()
            .send(CommandToTorrent::StorageFailure("disk full".to_string()))
            .unwrap();
        wait_for_state(&session, handle, TorrentState::Error).await;
        assert!(session.error(handle).unwrap().unwrap().contains("disk full"));
        assert_eq!(errors.lock().unwrap().len(), 1);
        assert!(matches!(
            session.start_stream(handle, FileSelector::Largest),
            Err(SessionError::Stream(StreamError::Failed(_))),
        ));

        // Failed torrents can still be removed.
        session.remove_torrent(handle, false).await.unwrap();
        session.shutdown().await;
    }
}
