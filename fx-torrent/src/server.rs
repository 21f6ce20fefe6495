use std::{
    collections::HashMap,
    net::SocketAddr,
    ops::Range,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{
        header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE},
        HeaderMap, Response, StatusCode,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::Bytes;
use futures::Stream;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use url::Url;
use crate::{
    session::{Session, SessionError},
    stream::{FileSelector, StreamError, TorrentStream},
    TorrentHandle,
};

// Bytes read from the torrent per body chunk.
const CHUNK_LEN: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

}

type Result<T> = std::result::Result<T, ServerError>;

#[derive(Debug, Clone)]
struct Served {
    torrent: TorrentHandle,
    selector: FileSelector,
}

#[derive(Debug)]
struct ServerState {
    session: Session,
    served: Mutex<HashMap<String, Served>>,
}

impl ServerState {
    fn served(&self) -> std::sync::MutexGuard<'_, HashMap<String, Served>> {
        self.served.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// Serves files of a session's torrents over HTTP with range requests, so media
// players can play them while they download. Every request reads through its
// own torrent stream.
#[derive(Debug)]
pub struct StreamServer {
    address: SocketAddr,
    state: Arc<ServerState>,
    next_id: AtomicU64,
    cancel: CancellationToken,
}

impl StreamServer {

    #[tracing::instrument(skip(session))]
    pub async fn bind(session: Session, address: SocketAddr) -> Result<StreamServer> {
        let listener = TcpListener::bind(address).await?;
        let address = listener.local_addr()?;
        let state = Arc::new(ServerState { session, served: Mutex::new(HashMap::new()) });
        let cancel = CancellationToken::new();

        let router = Router::new()
            .route("/video/{name}", get(serve_video))
            .with_state(Arc::clone(&state));
        let shutdown = cancel.clone().cancelled_owned();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).with_graceful_shutdown(shutdown).await {
                tracing::error!("stream server failed: {}", e);
            }
        });
        tracing::info!("stream server listening on {}", address);

        Ok(StreamServer { address, state, next_id: AtomicU64::new(1), cancel })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    // Makes a file of a torrent available, returning the url to play it from.
    pub fn serve(&self, torrent: TorrentHandle, selector: FileSelector) -> Result<Url> {
        // Fails for unknown torrents.
        self.state.session.state(torrent)?;
        let name = format!("stream{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let url = Url::parse(&format!("http://{}/video/{}", self.address, name))?;
        self.state.served().insert(name, Served { torrent, selector });
        tracing::debug!("serving {} at {}", torrent, url);
        Ok(url)
    }

    // Stops serving a url, returns whether it was served.
    pub fn unserve(&self, url: &Url) -> bool {
        let Some(name) = url.path_segments().and_then(|s| s.last()) else { return false };
        self.state.served().remove(name).is_some()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for StreamServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn serve_video(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response<Body> {
    let served = state.served().get(&name).cloned();
    let Some(served) = served else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match video_response(&state.session, served, &headers).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!("failed to serve {}: {}", name, e);
            let status = match e {
                ServerError::Session(SessionError::UnknownTorrent(_)) => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, e.to_string()).into_response()
        }
    }
}

async fn video_response(session: &Session, served: Served, headers: &HeaderMap) -> Result<Response<Body>> {
    let stream = session.start_stream(served.torrent, served.selector)?;
    let len = stream.file_len().await.map_err(SessionError::from)?;
    let content_type = stream
        .path()
        .and_then(|p| mime_guess::from_path(p).first())
        .map_or_else(|| "application/octet-stream".to_string(), |m| m.to_string());

    let range = match headers.get(RANGE).map(|v| v.to_str().ok().and_then(|v| parse_range(v, len))) {
        Some(Some(range)) => Some(range),
        Some(None) => {
            return Ok(Response::builder()
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(CONTENT_RANGE, format!("bytes */{}", len))
                .body(Body::empty())
                .unwrap_or_default());
        },
        None => None,
    };

    let mut response = Response::builder()
        .header(CONTENT_TYPE, content_type)
        .header(ACCEPT_RANGES, "bytes");
    let range = match range {
        Some(range) => {
            response = response
                .status(StatusCode::PARTIAL_CONTENT)
                .header(CONTENT_RANGE, format!("bytes {}-{}/{}", range.start, range.end - 1, len));
            range
        },
        None => 0..len,
    };
    tracing::debug!("serving bytes {:?} of {} byte file", range, len);

    let response = response
        .header(CONTENT_LENGTH, range.end - range.start)
        .body(Body::from_stream(chunks(stream, range)))
        .unwrap_or_default();
    Ok(response)
}

// Reads a range of the file in chunks, ending the body on the first error.
fn chunks(stream: TorrentStream, range: Range<u64>) -> impl Stream<Item = std::result::Result<Bytes, StreamError>> {
    let end = range.end;
    futures::stream::unfold((stream, range.start), move |(mut stream, offset)| async move {
        if offset >= end {
            return None;
        }
        let len = CHUNK_LEN.min((end - offset) as usize);
        match stream.read(offset, len).await {
            Ok(data) if data.is_empty() => None,
            Ok(data) => {
                let next = offset + data.len() as u64;
                Some((Ok(Bytes::from(data)), (stream, next)))
            },
            Err(e) => Some((Err(e), (stream, end))),
        }
    })
}

// Parses a single range header value into a byte range of the file, None when
// it cannot be satisfied.
fn parse_range(value: &str, len: u64) -> Option<Range<u64>> {
    let spec = value.trim().strip_prefix("bytes=")?;
    // Multiple ranges are not served.
    if spec.contains(',') {
        return None;
    }
    let (start, end) = spec.split_once('-')?;
    let (start, end) = match (start.trim(), end.trim()) {
        ("", suffix) => {
            let suffix: u64 = suffix.parse().ok()?;
            if suffix == 0 {
                return None;
            }
            (len.saturating_sub(suffix), len)
        },
        (start, "") => (start.parse().ok()?, len),
        (start, end) => {
            let end: u64 = end.parse().ok()?;
            (start.parse().ok()?, end.saturating_add(1).min(len))
        },
    };
    (start < end).then_some(start..end)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use crate::{
        config::Config,
        metainfo::{test_data, test_metainfo_multi},
        session::{AddTorrentOptions, TorrentSource},
        torrent::TorrentState,
    };
    use super::*;

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range("bytes=0-99", 1000), Some(0..100));
        assert_eq!(parse_range("bytes=900-", 1000), Some(900..1000));
        assert_eq!(parse_range("bytes=-100", 1000), Some(900..1000));
        // Ends past the file are clamped.
        assert_eq!(parse_range("bytes=500-5000", 1000), Some(500..1000));

        assert_eq!(parse_range("bytes=1000-", 1000), None);
        assert_eq!(parse_range("bytes=20-10", 1000), None);
        assert_eq!(parse_range("bytes=0-1,5-9", 1000), None);
        assert_eq!(parse_range("items=0-1", 1000), None);
        assert_eq!(parse_range("bytes=-0", 1000), None);
    }

    // Session with a completed torrent, its data already on disk.
    async fn completed_session(dir: &std::path::Path, lens: &[usize]) -> (Session, TorrentHandle, Vec<Vec<u8>>) {
        let metainfo = test_metainfo_multi(lens, 16_384);
        let files: Vec<Vec<u8>> = lens.iter().enumerate().map(|(i, l)| test_data(*l, i as u8)).collect();
        std::fs::create_dir_all(dir.join("test")).unwrap();
        for (i, data) in files.iter().enumerate() {
            std::fs::write(dir.join("test").join(format!("file{}.bin", i)), data).unwrap();
        }

        let session = Session::new(Config {
            dir: dir.to_path_buf(),
            listen_address: None,
            status_interval: Duration::from_millis(50),
            ..Config::default()
        });
        let handle = session
            .add_torrent(TorrentSource::Bytes(metainfo.to_bytes().unwrap()), AddTorrentOptions::default())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while session.state(handle).unwrap() != TorrentState::Completed {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }).await.unwrap();
        (session, handle, files)
    }

    #[tokio::test]
    async fn test_serve_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let (session, handle, files) = completed_session(dir.path(), &[10_000, 50_000]).await;
        let server = StreamServer::bind(session.clone(), SocketAddr::from(([127, 0, 0, 1], 0))).await.unwrap();
        let url = server.serve(handle, FileSelector::Largest).unwrap();
        let client = reqwest::Client::new();

        let full = client.get(url.clone()).send().await.unwrap();
        assert_eq!(full.status().as_u16(), 200);
        assert_eq!(full.headers()["accept-ranges"], "bytes");
        assert_eq!(full.headers()["content-length"], "50000");
        assert_eq!(full.bytes().await.unwrap().as_ref(), files[1].as_slice());

        let partial = client.get(url.clone()).header("Range", "bytes=20000-20099").send().await.unwrap();
        assert_eq!(partial.status().as_u16(), 206);
        assert_eq!(partial.headers()["content-range"], "bytes 20000-20099/50000");
        assert_eq!(partial.bytes().await.unwrap().as_ref(), &files[1][20_000..20_100]);

        let invalid = client.get(url.clone()).header("Range", "bytes=60000-").send().await.unwrap();
        assert_eq!(invalid.status().as_u16(), 416);
        assert_eq!(invalid.headers()["content-range"], "bytes */50000");

        assert!(server.unserve(&url));
        let gone = client.get(url).send().await.unwrap();
        assert_eq!(gone.status().as_u16(), 404);

        server.shutdown();
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_serve_unknown_torrent() {
        let dir = tempfile::tempdir().unwrap();
        let (session, handle, _) = completed_session(dir.path(), &[1000]).await;
        let server = StreamServer::bind(session.clone(), SocketAddr::from(([127, 0, 0, 1], 0))).await.unwrap();
        let url = server.serve(handle, FileSelector::Index(0)).unwrap();

        session.remove_torrent(handle, false).await.unwrap();
        assert!(matches!(
            server.serve(handle, FileSelector::Index(0)),
            Err(ServerError::Session(SessionError::UnknownTorrent(_))),
        ));
        let response = reqwest::get(url).await.unwrap();
        assert_eq!(response.status().as_u16(), 404);
        session.shutdown().await;
    }
}
