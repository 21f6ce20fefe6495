use std::{
    ops::Range,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
};
use futures::Stream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use crate::{
    events::{CallbackHandle, Callbacks, StreamEvent},
    pieces::{StoreError, StreamWindow},
    store::FileInfo,
    torrent::{CommandToTorrent, TorrentContext, TorrentShared, TorrentState},
    StreamHandle,
    TorrentHandle,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {

    // Waiting for metadata and the first pieces of the file.
    Preparing,

    Streaming,

    // Terminal, reads fail straight away.
    Stopped,

}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StreamState::Preparing => "preparing",
            StreamState::Streaming => "streaming",
            StreamState::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {

    #[error("stream stopped")]
    Stopped,

    #[error("stream stopped: {0}")]
    Failed(String),

    #[error("offset {offset} is past the end of the file ({len} bytes)")]
    InvalidSeek { offset: u64, len: u64 },

    #[error("no file matches {0:?}")]
    NoSuchFile(FileSelector),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

}

pub type Result<T> = std::result::Result<T, StreamError>;

// Picks the file of a torrent to stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSelector {
    Index(usize),
    // The largest file, usually the video in a media torrent.
    Largest,
    // Path of the file relative to the torrent directory.
    Path(PathBuf),
}

impl FileSelector {
    pub(crate) fn select(&self, files: &[FileInfo]) -> Option<usize> {
        match self {
            FileSelector::Index(idx) => (*idx < files.len()).then_some(*idx),
            FileSelector::Largest => files
                .iter()
                .enumerate()
                .max_by_key(|(idx, f)| (f.length, std::cmp::Reverse(*idx)))
                .map(|(idx, _)| idx),
            FileSelector::Path(path) => files.iter().position(|f| f.path.ends_with(path)),
        }
    }
}

// The streamed file, in torrent byte offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FileSpan {
    path: PathBuf,
    offset: u64,
    length: u64,
    pieces: Range<usize>,
}

// Stream state shared between the reader, its watcher task and the session.
#[derive(Debug)]
pub(crate) struct StreamInner {

    handle: StreamHandle,

    shared: Arc<TorrentShared>,

    selector: FileSelector,

    read_ahead: usize,

    file: watch::Sender<Option<FileSpan>>,

    state: watch::Sender<StreamState>,

    callbacks: Callbacks<StreamEvent>,

    error: Mutex<Option<String>>,

    // Cancelled when the stream stops, wakes waiting reads.
    cancel: CancellationToken,

}

impl StreamInner {

    pub fn handle(&self) -> StreamHandle {
        self.handle
    }

    pub fn torrent(&self) -> TorrentHandle {
        self.shared.handle
    }

    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    fn span(&self) -> Option<FileSpan> {
        self.file.borrow().clone()
    }

    fn set_state(&self, new: StreamState) {
        let old = self.state.send_replace(new);
        if old != new {
            tracing::debug!("{} changed from {} to {}", self.handle, old, new);
            self.callbacks.invoke(&StreamEvent::StateChanged { old, new });
        }
    }

    // Ends the stream for good, dropping its piece priorities.
    pub fn stop(&self, error: Option<String>) {
        if self.state() == StreamState::Stopped {
            return;
        }
        match &error {
            Some(e) => tracing::warn!("{} stopped: {}", self.handle, e),
            None => tracing::info!("{} stopped", self.handle),
        }
        *self.error.lock().unwrap_or_else(PoisonError::into_inner) = error.clone();
        self.cancel.cancel();
        self.set_state(StreamState::Stopped);
        if let Some(e) = error {
            self.callbacks.invoke(&StreamEvent::Error(e));
        }
        if let Some(ctx) = self.shared.context() {
            if ctx.store.clear_stream(self.handle.0) {
                self.shared.send(CommandToTorrent::PrioritiesChanged).ok();
            }
        }
    }

    fn stop_error(&self) -> StreamError {
        match self.error.lock().unwrap_or_else(PoisonError::into_inner).clone() {
            Some(e) => StreamError::Failed(e),
            None => StreamError::Stopped,
        }
    }

    // Moves the stream window so the cursor piece is fetched first.
    fn update_window(&self, ctx: &TorrentContext, span: &FileSpan, position: u64, drop_behind: bool) {
        if span.pieces.is_empty() {
            return;
        }
        let offset = span.offset + position.min(span.length.saturating_sub(1));
        let Some(cursor) = ctx.info().piece_at(offset) else { return };
        let current = ctx.store.stream_window(self.handle.0);
        let mut window = StreamWindow::new(span.pieces.clone(), cursor, self.read_ahead);
        window.drop_behind = drop_behind || current.as_ref().map_or(false, |w| w.drop_behind);
        window.pending = current.and_then(|w| w.pending);
        if ctx.store.set_stream_window(self.handle.0, window) {
            self.shared.send(CommandToTorrent::PrioritiesChanged).ok();
        }
    }

    // Marks the pieces a read is blocked on, or clears them with None.
    fn set_pending(&self, ctx: &TorrentContext, pieces: Option<Range<usize>>) {
        let Some(mut window) = ctx.store.stream_window(self.handle.0) else { return };
        window.pending = pieces;
        if ctx.store.set_stream_window(self.handle.0, window) {
            self.shared.send(CommandToTorrent::PrioritiesChanged).ok();
        }
    }

    // Waits until the streamed file is known.
    async fn wait_for_file(&self) -> Result<(Arc<TorrentContext>, FileSpan)> {
        let mut file = self.file.subscribe();
        let span = tokio::select! {
            span = file.wait_for(|f| f.is_some()) => match span {
                Ok(span) => span.clone(),
                Err(_) => None,
            },
            _ = self.cancel.cancelled() => return Err(self.stop_error()),
        };
        match (self.shared.context(), span) {
            (Some(ctx), Some(span)) => Ok((ctx, span)),
            _ => Err(self.stop_error()),
        }
    }

    // Resolves the file once metadata arrives, then reports readiness and
    // follows the torrent until either ends.
    async fn watch(self: Arc<Self>) {

        let Some(ctx) = self.wait_for_context().await else {
            let error = self.shared.error().unwrap_or_else(|| "torrent closed".to_string());
            self.stop(Some(error));
            return;
        };

        let files = ctx.metainfo.files();
        let Some(file_idx) = self.selector.select(&files) else {
            self.stop(Some(StreamError::NoSuchFile(self.selector.clone()).to_string()));
            return;
        };
        let file = &files[file_idx];
        let span = FileSpan {
            path: file.path.clone(),
            offset: file.offset,
            length: file.length,
            pieces: ctx.info().file_pieces(file_idx),
        };
        tracing::info!("{} streaming {:?} ({} bytes)", self.handle, file.path, file.length);

        // The first read ahead window and the last piece.
        let mut prepare: Vec<usize> = span.pieces.clone().take(self.read_ahead).collect();
        if let Some(last) = span.pieces.clone().last() {
            if !prepare.contains(&last) {
                prepare.push(last);
            }
        }

        self.update_window(&ctx, &span, 0, false);
        self.file.send_replace(Some(span));

        let mut verified = ctx.store.subscribe();
        let mut torrent_state = self.shared.subscribe_state();
        loop {
            if *torrent_state.borrow_and_update() == TorrentState::Error {
                let error = self.shared.error().unwrap_or_else(|| "torrent failed".to_string());
                self.stop(Some(error));
                return;
            }
            let preparing = self.state() == StreamState::Preparing;
            if preparing && prepare.iter().all(|idx| ctx.store.has_piece(*idx)) {
                self.set_state(StreamState::Streaming);
                self.callbacks.invoke(&StreamEvent::Ready);
                continue;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = self.shared.closed().cancelled() => {
                    self.stop(Some("torrent removed".to_string()));
                    return;
                },
                changed = torrent_state.changed() => {
                    if changed.is_err() {
                        self.stop(None);
                        return;
                    }
                },
                changed = verified.changed(), if preparing => {
                    if changed.is_err() {
                        self.stop(None);
                        return;
                    }
                },
            }
        }
    }

    async fn wait_for_context(&self) -> Option<Arc<TorrentContext>> {
        let mut state = self.shared.subscribe_state();
        loop {
            // Mark the state seen before looking, the context is set ahead of the next transition.
            let current = *state.borrow_and_update();
            if let Some(ctx) = self.shared.context() {
                return Some(ctx);
            }
            if current == TorrentState::Error {
                return None;
            }
            tokio::select! {
                changed = state.changed() => if changed.is_err() { return None },
                _ = self.shared.closed().cancelled() => return None,
                _ = self.cancel.cancelled() => return None,
            }
        }
    }
}

// Sequential reader over one file of a torrent, usable before the file is downloaded.
// Reads wait until the bytes they cover are verified.
#[derive(Debug)]
pub struct TorrentStream {

    inner: Arc<StreamInner>,

    // Offset within the file, never moves backwards.
    position: u64,

}

impl TorrentStream {

    pub(crate) fn start(
        handle: StreamHandle,
        shared: Arc<TorrentShared>,
        selector: FileSelector,
        read_ahead: usize,
    ) -> TorrentStream {
        let (file, _) = watch::channel(None);
        let (state, _) = watch::channel(StreamState::Preparing);
        let inner = Arc::new(StreamInner {
            handle,
            shared,
            selector,
            read_ahead: read_ahead.max(1),
            file,
            state,
            callbacks: Callbacks::new(),
            error: Mutex::new(None),
            cancel: CancellationToken::new(),
        });
        tokio::spawn(Arc::clone(&inner).watch());
        TorrentStream { inner, position: 0 }
    }

    pub(crate) fn inner(&self) -> &Arc<StreamInner> {
        &self.inner
    }

    pub fn handle(&self) -> StreamHandle {
        self.inner.handle
    }

    pub fn torrent(&self) -> TorrentHandle {
        self.inner.torrent()
    }

    pub fn state(&self) -> StreamState {
        self.inner.state()
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    // Length of the streamed file, None until metadata is known.
    pub fn len(&self) -> Option<u64> {
        self.inner.span().map(|s| s.length)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    // Path of the streamed file within the torrent, None until metadata is known.
    pub fn path(&self) -> Option<PathBuf> {
        self.inner.span().map(|s| s.path)
    }

    // Waits for metadata and returns the length of the streamed file.
    pub async fn file_len(&self) -> Result<u64> {
        if self.state() == StreamState::Stopped {
            return Err(self.inner.stop_error());
        }
        let (_, span) = self.inner.wait_for_file().await?;
        Ok(span.length)
    }

    pub fn subscribe(&self, listener: impl Fn(&StreamEvent) + Send + Sync + 'static) -> CallbackHandle {
        self.inner.callbacks.add(listener)
    }

    pub fn unsubscribe(&self, handle: CallbackHandle) -> bool {
        self.inner.callbacks.remove(handle)
    }

    // Reads up to len bytes at an offset of the file, short only at the end of the file.
    // Moves the read ahead window when reading past the current position. Pieces
    // the read waits on are fetched first even when they are behind the window.
    pub async fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if self.state() == StreamState::Stopped {
            return Err(self.inner.stop_error());
        }
        let (ctx, span) = self.inner.wait_for_file().await?;

        if offset > span.length {
            let error = StreamError::InvalidSeek { offset, len: span.length };
            self.inner.stop(Some(error.to_string()));
            return Err(error);
        }
        if offset > self.position {
            self.position = offset;
            self.inner.update_window(&ctx, &span, offset, false);
        }
        let len = len.min((span.length - offset) as usize);
        if len == 0 {
            return Ok(Vec::new());
        }

        let start = span.offset + offset;
        let range = start..start + len as u64;
        let mut verified = ctx.store.subscribe();
        let mut pending = false;
        loop {
            if ctx.store.has_range(range.clone()) {
                if pending {
                    self.inner.set_pending(&ctx, None);
                }
                return Ok(ctx.store.read(start, len).await?);
            }
            if !pending {
                self.inner.set_pending(&ctx, Some(ctx.info().pieces_in(range.clone())));
                pending = true;
            }
            tokio::select! {
                changed = verified.changed() => {
                    if changed.is_err() {
                        return Err(StreamError::Stopped);
                    }
                },
                _ = self.inner.cancel.cancelled() => return Err(self.inner.stop_error()),
            }
        }
    }

    // Reads at the current position and advances past the returned bytes.
    pub async fn read_next(&mut self, len: usize) -> Result<Vec<u8>> {
        let data = self.read(self.position, len).await?;
        self.position += data.len() as u64;
        if let Some((ctx, span)) = self.inner.shared.context().zip(self.inner.span()) {
            self.inner.update_window(&ctx, &span, self.position, false);
        }
        Ok(data)
    }

    // Advances the position without needing the skipped bytes. Pieces left
    // far behind are no longer wanted by this stream.
    pub async fn skip(&mut self, n: u64) -> Result<u64> {
        if self.state() == StreamState::Stopped {
            return Err(self.inner.stop_error());
        }
        let (ctx, span) = self.inner.wait_for_file().await?;
        let position = self.position.saturating_add(n);
        if position > span.length {
            let error = StreamError::InvalidSeek { offset: position, len: span.length };
            self.inner.stop(Some(error.to_string()));
            return Err(error);
        }
        self.position = position;
        self.inner.update_window(&ctx, &span, position, true);
        Ok(position)
    }

    pub fn stop(&self) {
        self.inner.stop(None);
    }

    // Chunks of the file from the current position until its end.
    pub fn into_stream(self, chunk_len: usize) -> impl Stream<Item = Result<Vec<u8>>> {
        futures::stream::unfold(Some(self), move |stream| async move {
            let mut stream = stream?;
            match stream.read_next(chunk_len).await {
                Ok(data) if data.is_empty() => None,
                Ok(data) => Some((Ok(data), Some(stream))),
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

impl Drop for TorrentStream {
    fn drop(&mut self) {
        self.inner.stop(None);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use futures::StreamExt;
    use crate::{
        block::BlockData,
        metainfo::{test_data, test_metainfo_multi},
        pieces::Priority,
        torrent::TorrentRx,
        session::TorrentMode,
        BLOCK_SIZE,
    };
    use super::*;

    const PIECE_LEN: usize = BLOCK_SIZE;

    fn setup(lens: &[usize]) -> (Arc<TorrentShared>, Arc<TorrentContext>, TorrentRx, Vec<u8>) {
        let metainfo = test_metainfo_multi(lens, PIECE_LEN);
        let data = lens.iter().enumerate().flat_map(|(i, l)| test_data(*l, i as u8)).collect();
        let (ctx, rx) = TorrentContext::test_context(metainfo, TorrentMode::Stream);
        let shared = TorrentShared::test_shared(Arc::clone(&ctx), TorrentState::Downloading);
        (shared, ctx, rx, data)
    }

    async fn write_piece(ctx: &TorrentContext, data: &[u8], idx: usize) {
        let range = ctx.info().piece_range(idx);
        let block = BlockData {
            piece_idx: idx,
            offset: 0,
            data: data[range.start as usize..range.end as usize].to_vec(),
        };
        ctx.store.write_block(block).await.unwrap();
    }

    async fn wait_for_state(stream: &TorrentStream, state: StreamState) {
        let mut rx = stream.inner.state.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_file_selector() {
        let metainfo = test_metainfo_multi(&[10, 300, 300, 20], PIECE_LEN);
        let files = metainfo.files();
        assert_eq!(FileSelector::Largest.select(&files), Some(1));
        assert_eq!(FileSelector::Index(3).select(&files), Some(3));
        assert_eq!(FileSelector::Index(4).select(&files), None);
        let path = files[2].path.file_name().map(PathBuf::from).unwrap();
        assert_eq!(FileSelector::Path(path).select(&files), Some(2));
    }

    #[tokio::test]
    async fn test_read_ahead_window() {
        let (shared, ctx, _rx, data) = setup(&[PIECE_LEN * 100]);
        let mut stream = TorrentStream::start(StreamHandle(1), shared, FileSelector::Largest, 8);
        let ready = Arc::new(Mutex::new(0));
        let r = Arc::clone(&ready);
        stream.subscribe(move |event| if *event == StreamEvent::Ready { *r.lock().unwrap() += 1; });

        let window = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(window) = ctx.store.stream_window(1) {
                    return window;
                }
                tokio::task::yield_now().await;
            }
        }).await.unwrap();
        assert_eq!(window.cursor, 0);
        assert_eq!(ctx.store.priority(0), Priority::Now);
        assert_eq!(ctx.store.priority(1), Priority::Next);
        assert_eq!(ctx.store.priority(7), Priority::Readahead);
        assert_eq!(ctx.store.priority(8), Priority::Normal);
        assert_eq!(ctx.store.priority(99), Priority::High);
        assert_eq!(stream.len(), Some((PIECE_LEN * 100) as u64));
        assert_eq!(stream.state(), StreamState::Preparing);

        for idx in (0..8).chain([99]) {
            write_piece(&ctx, &data, idx).await;
        }
        wait_for_state(&stream, StreamState::Streaming).await;
        assert_eq!(*ready.lock().unwrap(), 1);

        let read = stream.read_next(PIECE_LEN * 2).await.unwrap();
        assert_eq!(read, &data[..PIECE_LEN * 2]);
        assert_eq!(stream.position(), (PIECE_LEN * 2) as u64);
        assert_eq!(ctx.store.priority(2), Priority::Now);
        assert_eq!(ctx.store.priority(9), Priority::Readahead);

        // Skipping far ahead releases pieces more than a window behind.
        stream.skip((PIECE_LEN * 48) as u64).await.unwrap();
        assert_eq!(ctx.store.priority(50), Priority::Now);
        assert_eq!(ctx.store.priority(10), Priority::None);
        assert_eq!(ctx.store.priority(45), Priority::Normal);
    }

    #[tokio::test]
    async fn test_read_waits_for_verification() {
        let (shared, ctx, _rx, data) = setup(&[PIECE_LEN * 4]);
        let mut stream = TorrentStream::start(StreamHandle(2), shared, FileSelector::Index(0), 2);
        let read = tokio::spawn(async move { stream.read(PIECE_LEN as u64 + 10, 100).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!read.is_finished());
        write_piece(&ctx, &data, 1).await;
        let bytes = tokio::time::timeout(Duration::from_secs(5), read).await.unwrap().unwrap().unwrap();
        assert_eq!(bytes, &data[PIECE_LEN + 10..PIECE_LEN + 110]);
    }

    async fn wait_for_priority(ctx: &TorrentContext, idx: usize, priority: Priority) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while ctx.store.priority(idx) != priority {
                tokio::task::yield_now().await;
            }
        }).await.unwrap();
    }

    #[tokio::test]
    async fn test_read_blocks_until_piece_verified() {
        let (shared, ctx, _rx, data) = setup(&[PIECE_LEN * 100]);
        let mut stream = TorrentStream::start(StreamHandle(7), shared, FileSelector::Largest, 8);
        let offset = (PIECE_LEN * 50 + 100) as u64;
        let read = tokio::spawn(async move { stream.read(offset, 200).await });

        // The read moves the window to the piece it needs.
        wait_for_priority(&ctx, 50, Priority::Now).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!read.is_finished());

        write_piece(&ctx, &data, 50).await;
        let bytes = tokio::time::timeout(Duration::from_secs(5), read).await.unwrap().unwrap().unwrap();
        assert_eq!(bytes, &data[PIECE_LEN * 50 + 100..PIECE_LEN * 50 + 300]);
    }

    #[tokio::test]
    async fn test_read_behind_cursor_after_skip() {
        let (shared, ctx, _rx, data) = setup(&[PIECE_LEN * 100]);
        let mut stream = TorrentStream::start(StreamHandle(8), shared, FileSelector::Largest, 8);
        stream.skip((PIECE_LEN * 50) as u64).await.unwrap();
        assert_eq!(ctx.store.priority(10), Priority::None);

        let read = tokio::spawn(async move {
            let bytes = stream.read((PIECE_LEN * 10) as u64, 10).await;
            (stream, bytes)
        });
        // Dropped pieces a read waits on are wanted again.
        wait_for_priority(&ctx, 10, Priority::Now).await;
        assert_eq!(ctx.store.priority(11), Priority::None);

        write_piece(&ctx, &data, 10).await;
        let (stream, bytes) = tokio::time::timeout(Duration::from_secs(5), read).await.unwrap().unwrap();
        assert_eq!(bytes.unwrap(), &data[PIECE_LEN * 10..PIECE_LEN * 10 + 10]);

        // Served pieces fall back to the skipped state.
        assert_eq!(ctx.store.stream_window(8).unwrap().pending, None);
        assert_eq!(ctx.store.priority(12), Priority::None);
        assert_eq!(stream.position(), (PIECE_LEN * 50) as u64);
    }

    #[tokio::test]
    async fn test_invalid_seek_stops_stream() {
        let (shared, ctx, _rx, _) = setup(&[PIECE_LEN * 2]);
        let mut stream = TorrentStream::start(StreamHandle(3), shared, FileSelector::Index(0), 2);
        let errors = Arc::new(Mutex::new(Vec::new()));
        let e = Arc::clone(&errors);
        stream.subscribe(move |event| if let StreamEvent::Error(msg) = event { e.lock().unwrap().push(msg.clone()); });

        let result = stream.read((PIECE_LEN * 2 + 1) as u64, 10).await;
        assert!(matches!(result, Err(StreamError::InvalidSeek { .. })));
        assert_eq!(stream.state(), StreamState::Stopped);
        assert_eq!(errors.lock().unwrap().len(), 1);
        assert!(ctx.store.stream_window(3).is_none());

        // Stopped streams fail fast.
        assert!(stream.read(0, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_wakes_reader() {
        let (shared, _ctx, _rx, _) = setup(&[PIECE_LEN * 2]);
        let stream = TorrentStream::start(StreamHandle(4), shared, FileSelector::Index(0), 2);
        let inner = Arc::clone(stream.inner());
        let read = tokio::spawn(async move {
            let mut stream = stream;
            stream.read(0, 10).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        inner.stop(None);
        let result = tokio::time::timeout(Duration::from_secs(5), read).await.unwrap().unwrap();
        assert!(matches!(result, Err(StreamError::Stopped)));
    }

    #[tokio::test]
    async fn test_torrent_error_stops_stream() {
        let (shared, _ctx, _rx, _) = setup(&[PIECE_LEN * 2]);
        let stream = TorrentStream::start(StreamHandle(6), Arc::clone(&shared), FileSelector::Index(0), 2);
        tokio::task::yield_now().await;
        shared.set_test_state(TorrentState::Error);
        wait_for_state(&stream, StreamState::Stopped).await;
        assert!(matches!(stream.inner.stop_error(), StreamError::Failed(_)));
    }

    #[tokio::test]
    async fn test_into_stream_yields_whole_file() {
        let len = PIECE_LEN * 3 + 100;
        let (shared, ctx, _rx, data) = setup(&[len]);
        for idx in 0..4 {
            write_piece(&ctx, &data, idx).await;
        }
        let stream = TorrentStream::start(StreamHandle(5), shared, FileSelector::Largest, 2);
        let chunks: Vec<Vec<u8>> = stream
            .into_stream(5000)
            .map(|chunk| chunk.unwrap())
            .collect()
            .await;
        assert_eq!(chunks.concat(), data);
    }
}
