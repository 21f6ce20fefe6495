use std::{net::SocketAddr, time::Duration};
use tokio::{sync::watch, task::JoinHandle, time::{self, Instant}};
use tracing::Instrument;
use url::Url;
use crate::{torrent::{CommandToTorrent, TorrentTx}, ID};

mod http;
mod udp;
pub use http::HttpTracker;
pub use udp::UdpTracker;

type Result<T> = std::result::Result<T, TrackerError>;
pub type TrackerTx = watch::Sender<Option<AnnounceParams>>;
pub type TrackerRx = watch::Receiver<Option<AnnounceParams>>;

// In cases where the tracker doesn't give us a min interval.
const DEFAULT_MIN_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(60);

// First retry delay after a failed announce, doubled on each further failure.
const RETRY_BASE: Duration = Duration::from_secs(15);
const RETRY_MAX: Duration = Duration::from_secs(30 * 60);

#[derive(thiserror::Error, Debug)]
pub enum TrackerError {

    #[error("request error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("error deserializing response: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    #[error("timeout")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("invalid url")]
    InvalidUrl,

    #[error("unsupported tracker scheme: {0}")]
    UnsupportedScheme(String),

    #[error("response error: {0}")]
    ResponseError(String),

}

// Result of a successful announce.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Announce {

    pub peers: Vec<SocketAddr>,

    pub interval: Option<Duration>,

    pub min_interval: Option<Duration>,

}

// Anything we can ask for peers.
#[async_trait::async_trait]
pub trait PeerSource: Send {

    async fn announce(&mut self, params: AnnounceParams) -> Result<Announce>;

}

// Builds a peer source based on the url scheme.
pub fn from_url(url: &Url) -> Result<Box<dyn PeerSource>> {
    match url.scheme() {
        "http" | "https" => Ok(Box::new(HttpTracker::new(url.clone()))),
        "udp" => Ok(Box::new(UdpTracker::new(url.clone()))),
        scheme => Err(TrackerError::UnsupportedScheme(scheme.to_string())),
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct AnnounceParams {

    // Hash of info dict.
    pub info_hash:  ID,

    // 20-byte string used as a unique ID for the client.
    pub client_id:  ID,

    // Port we accept peers on.
    pub port:       u16,

    // The total amount uploaded since the started event.
    pub uploaded:   u64,

    // The total amount downloaded since the started event.
    pub downloaded: u64,

    // Bytes still needed to complete all wanted files.
    pub left:       u64,

    // If not specified, then this request is one performed at regular intervals.
    pub event:      Option<Event>,

    // Number of peers that the client would like to receive from the tracker.
    pub num_want:   Option<usize>,

}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum Event {

    Completed,

    #[default]
    Started,

    Stopped,

}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Completed => write!(f, "completed"),
            Event::Started => write!(f, "started"),
            Event::Stopped => write!(f, "stopped"),
        }
    }
}

// Announces to every tracker of a torrent, each on its own task.
#[derive(Debug)]
pub struct Trackers {

    urls: Vec<Url>,

    handles: Vec<JoinHandle<()>>,

    tracker_tx: TrackerTx,

}

impl Trackers {

    pub fn new(urls: Vec<Url>) -> Self {
        let (tracker_tx, _) = watch::channel(None);
        Self {
            urls,
            handles: Vec::new(),
            tracker_tx,
        }
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    pub fn start(&mut self, torrent_tx: TorrentTx, timeout: Duration, max_failures: u32, default_interval: Duration) {
        for url in self.urls.iter() {
            let source = match from_url(url) {
                Ok(source) => source,
                Err(e) => {
                    tracing::warn!("skipping tracker {}: {}", url, e);
                    torrent_tx.send(CommandToTorrent::TrackerFailed { url: url.clone(), error: e.to_string() }).ok();
                    continue;
                }
            };
            let task = TrackerTask {
                url: url.clone(),
                source,
                torrent_tx: torrent_tx.clone(),
                tracker_rx: self.tracker_tx.subscribe(),
                timeout,
                max_failures,
                timer: AnnounceTimer::new(default_interval),
            };
            let handle = tokio::spawn(task.run().instrument(tracing::info_span!("tracker", url = %url)));
            self.handles.push(handle);
        }
    }

    // Hands trackers new params, only waking them when the event or peer demand changed.
    pub fn announce(&self, params: AnnounceParams) {
        self.tracker_tx.send_if_modified(|current| {
            let modified = current.map(|p| (p.event, p.num_want)) != Some((params.event, params.num_want));
            *current = Some(params);
            modified
        });
    }

    // Sends the stopped event, giving trackers until the deadline to deliver it.
    pub async fn shutdown(&mut self, params: AnnounceParams, grace: Duration) {
        self.announce(AnnounceParams { event: Some(Event::Stopped), num_want: Some(0), ..params });
        let deadline = Instant::now() + grace;
        for mut handle in self.handles.drain(..) {
            if time::timeout_at(deadline, &mut handle).await.is_err() {
                handle.abort();
            }
        }
    }
}

impl Drop for Trackers {
    fn drop(&mut self) {
        for handle in self.handles.iter() {
            handle.abort();
        }
    }
}

// Tracks when a tracker may and should be announced to next.
#[derive(Debug)]
struct AnnounceTimer {

    last_announce: Option<Instant>,

    interval: Duration,

    min_interval: Duration,

    failures: u32,

    retry_at: Option<Instant>,

}

impl AnnounceTimer {

    fn new(interval: Duration) -> Self {
        Self {
            last_announce: None,
            interval,
            min_interval: DEFAULT_MIN_ANNOUNCE_INTERVAL.min(interval),
            failures: 0,
            retry_at: None,
        }
    }

    fn retry_ready(&self, now: Instant) -> bool {
        self.retry_at.map_or(true, |t| now >= t)
    }

    // Whether we are allowed to announce early because we need peers.
    fn can_announce(&self, now: Instant) -> bool {
        self.retry_ready(now)
            && self.last_announce.map_or(true, |t| now.saturating_duration_since(t) >= self.min_interval)
    }

    // Whether a regular announce is due.
    fn should_announce(&self, now: Instant) -> bool {
        self.retry_ready(now)
            && self.last_announce.map_or(true, |t| now.saturating_duration_since(t) >= self.interval)
    }

    fn next_wakeup(&self, now: Instant) -> Instant {
        match (self.retry_at, self.last_announce) {
            (Some(retry), _) => retry,
            (None, Some(last)) => last + self.interval,
            (None, None) => now,
        }
    }

    fn succeeded(&mut self, now: Instant, announce: &Announce) {
        if let Some(interval) = announce.interval {
            self.interval = interval;
        }
        if let Some(min_interval) = announce.min_interval {
            self.min_interval = min_interval;
        }
        self.last_announce = Some(now);
        self.failures = 0;
        self.retry_at = None;
    }

    fn failed(&mut self, now: Instant) -> u32 {
        self.failures += 1;
        let backoff = RETRY_BASE
            .saturating_mul(1 << (self.failures - 1).min(16))
            .min(RETRY_MAX);
        self.retry_at = Some(now + backoff);
        self.failures
    }
}

struct TrackerTask {

    url: Url,

    source: Box<dyn PeerSource>,

    torrent_tx: TorrentTx,

    tracker_rx: TrackerRx,

    timeout: Duration,

    max_failures: u32,

    timer: AnnounceTimer,

}

impl TrackerTask {

    async fn run(mut self) {

        let mut last_event = None;
        let mut woken_by_change = true;

        loop {

            let params = *self.tracker_rx.borrow_and_update();
            if let Some(mut params) = params {

                let now = Instant::now();
                let stopping = params.event == Some(Event::Stopped);
                let new_event = params.event.is_some() && params.event != last_event;
                if !new_event {
                    params.event = None;
                }
                let wants_peers = params.num_want.map_or(false, |n| n > 0);

                let due = if stopping {
                    // Nothing was ever announced, so there is nothing to stop.
                    if self.timer.last_announce.is_none() {
                        return;
                    }
                    true
                } else if new_event {
                    self.timer.retry_ready(now)
                } else if woken_by_change && wants_peers {
                    self.timer.can_announce(now)
                } else {
                    self.timer.should_announce(now)
                };

                if due {
                    let result = match time::timeout(self.timeout, self.source.announce(params)).await {
                        Ok(result) => result,
                        Err(elapsed) => Err(elapsed.into()),
                    };
                    if stopping {
                        if let Err(e) = result {
                            tracing::debug!("stopped announce failed: {}", e);
                        }
                        return;
                    }
                    match result {
                        Ok(announce) => {
                            tracing::info!("tracker provided {} peers", announce.peers.len());
                            self.timer.succeeded(Instant::now(), &announce);
                            last_event = params.event.or(last_event);
                            if self.torrent_tx.send(CommandToTorrent::Peers(announce.peers)).is_err() {
                                return;
                            }
                        },
                        Err(e) => {
                            let failures = self.timer.failed(Instant::now());
                            tracing::warn!("announce failed ({}/{}): {}", failures, self.max_failures, e);
                            if failures >= self.max_failures {
                                self.torrent_tx.send(CommandToTorrent::TrackerFailed {
                                    url: self.url.clone(),
                                    error: e.to_string(),
                                }).ok();
                                return;
                            }
                        },
                    }
                }
            }

            // Without params there is nothing to announce until the torrent sends some.
            let wakeup = params.map(|_| self.timer.next_wakeup(Instant::now()));
            tokio::select! {
                changed = self.tracker_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    woken_by_change = true;
                },
                _ = time::sleep_until(wakeup.unwrap_or_else(Instant::now)), if wakeup.is_some() => {
                    woken_by_change = false;
                },
            }
        }
    }
}
