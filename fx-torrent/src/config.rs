use std::{
    net::SocketAddr,
    path::PathBuf,
    time::Duration,
};
use rand::{distributions::Alphanumeric, Rng};
use url::Url;
use crate::ID;

#[derive(Debug, Clone)]
pub struct Config {

    pub client_id: ID,

    // Default directory for torrent data, overridden per torrent by the add options.
    pub dir: PathBuf,

    // Address the first torrent listens on for inbound peers.
    // The port is incremented by 1 for each new torrent, port 0 picks a free port.
    pub listen_address: Option<SocketAddr>,

    // Trackers announced to in addition to those in the metainfo.
    pub custom_trackers: Vec<Url>,

    // Re-announce interval used when a tracker doesn't give us one.
    pub announce_interval: Duration,

    // Minimum number of peers we try to keep, and the per torrent connection cap.
    pub min_max_peers: (u32, u32),

    // Cap on concurrent peer connections across all torrents of a session.
    pub max_connections: usize,

    // Maximum number of in flight block requests per peer.
    pub request_queue_len: usize,

    // Number of pieces ahead of a stream cursor that are prioritised.
    pub read_ahead_pieces: usize,

    // Fraction of wanted pieces left at which duplicate block requests are allowed.
    pub endgame_ratio: f64,

    pub connect_timeout: Duration,

    pub handshake_timeout: Duration,

    // Disconnect peers with no mutual interest after this long.
    pub idle_timeout: Duration,

    pub tracker_timeout: Duration,

    // Consecutive failed announces after which a tracker counts as exhausted.
    pub tracker_max_failures: u32,

    // How long a peer we failed to connect to is ignored.
    pub peer_cooldown: Duration,

    pub metadata_timeout: Duration,

    // Grace period for peer tasks to flush when a torrent shuts down.
    pub shutdown_grace: Duration,

    // Interval at which download status is recomputed and published.
    pub status_interval: Duration,

}

const CLIENT_PREFIX: &[u8; 8] = b"-FX0100-";

// Generates an Azureus style peer id with a random suffix.
pub fn peer_id() -> ID {
    let mut id = [0; 20];
    id[..8].copy_from_slice(CLIENT_PREFIX);
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .enumerate()
        .for_each(|(i, c)| id[8 + i] = c);
    id
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: peer_id(),
            dir: PathBuf::from("downloads"),
            listen_address: None,
            custom_trackers: Vec::new(),
            announce_interval: Duration::from_secs(1800),
            min_max_peers: (5, 50),
            max_connections: 200,
            request_queue_len: 16,
            read_ahead_pieces: 8,
            endgame_ratio: 0.05,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
            tracker_timeout: Duration::from_secs(15),
            tracker_max_failures: 5,
            peer_cooldown: Duration::from_secs(120),
            metadata_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(2),
            status_interval: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_prefix() {
        let id = peer_id();
        assert_eq!(&id[..8], CLIENT_PREFIX);
        assert!(id[8..].iter().all(|b| b.is_ascii_alphanumeric()));
        assert_ne!(peer_id(), id);
    }
}
