use std::time::Duration;
use crate::torrent::TorrentState;

// Snapshot of a torrent's progress, recomputed every status tick.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadStatus {

    pub state: TorrentState,

    // Verified wanted bytes over wanted bytes, in [0, 1].
    pub progress: f64,

    // Peers with a completed handshake.
    pub connections: usize,

    // Bytes per second.
    pub download_rate: u64,

    pub upload_rate: u64,

    // Verified bytes of wanted pieces.
    pub downloaded: u64,

    // Total bytes of wanted pieces.
    pub wanted: u64,

    pub pieces_verified: usize,

    pub pieces_total: usize,

}

impl DownloadStatus {

    pub fn new(state: TorrentState, downloaded: u64, wanted: u64) -> Self {
        let progress = if wanted == 0 { 1.0 } else { (downloaded as f64 / wanted as f64).clamp(0.0, 1.0) };
        Self {
            state,
            progress,
            connections: 0,
            download_rate: 0,
            upload_rate: 0,
            downloaded,
            wanted,
            pieces_verified: 0,
            pieces_total: 0,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.downloaded >= self.wanted
    }
}

impl Default for DownloadStatus {
    fn default() -> Self {
        DownloadStatus::new(TorrentState::Creating, 0, 0)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct ThroughputStats {

    pub up: Counter,

    pub down: Counter,

}

impl ThroughputStats {

    pub fn reset(&mut self) {
        self.up.reset();
        self.down.reset();
    }

    pub fn end_round(&mut self, elapsed: Duration) {
        self.up.end_round(elapsed);
        self.down.end_round(elapsed);
    }
}

impl std::ops::AddAssign<&ThroughputStats> for ThroughputStats {
    fn add_assign(&mut self, other: &ThroughputStats) {
        self.up += other.up.round();
        self.down += other.down.round();
    }
}

// Byte counter with a moving average over the last rounds.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Counter {
    total: u64,
    round: u64,
    avg: f64,
}

const SMOOTHING_ROUNDS: f64 = 5.0;

impl Counter {

    pub fn add(&mut self, n: u64) {
        self.total += n;
        self.round += n;
    }

    // Ends the current round, averaging bytes per round.
    pub fn reset(&mut self) {
        self.fold(self.round as f64);
    }

    // Ends a round that lasted elapsed, averaging bytes per second.
    pub fn end_round(&mut self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return;
        }
        self.fold(self.round as f64 / secs);
    }

    fn fold(&mut self, sample: f64) {
        self.avg = self.avg * (SMOOTHING_ROUNDS - 1.0) / SMOOTHING_ROUNDS + sample / SMOOTHING_ROUNDS;
        self.round = 0;
    }

    pub fn avg(&self) -> u64 {
        self.avg as u64
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn round(&self) -> u64 {
        self.round
    }
}

impl std::ops::AddAssign<u64> for Counter {
    fn add_assign(&mut self, n: u64) {
        self.add(n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_average() {
        let mut c = Counter::default();
        c += 500;
        assert_eq!(c.round(), 500);
        c.reset();
        assert_eq!(c.avg(), 100);
        assert_eq!(c.round(), 0);
        c += 500;
        c.reset();
        assert_eq!(c.avg(), 180);
        assert_eq!(c.total(), 1000);
    }

    #[test]
    fn test_rate_per_second() {
        // 500 bytes in 250ms is 2000 bytes a second.
        let mut c = Counter::default();
        c += 500;
        c.end_round(Duration::from_millis(250));
        assert_eq!(c.avg(), 400);
        assert_eq!(c.round(), 0);

        let mut slow = Counter::default();
        slow += 500;
        slow.end_round(Duration::from_secs(2));
        assert_eq!(slow.avg(), 50);

        // An empty round keeps the bytes for the next one.
        slow += 100;
        slow.end_round(Duration::ZERO);
        assert_eq!(slow.round(), 100);
        assert_eq!(slow.avg(), 50);
    }

    #[test]
    fn test_throughput_sum() {
        let mut peer = ThroughputStats::default();
        peer.down += 100;
        peer.up += 10;
        let mut total = ThroughputStats::default();
        total += &peer;
        total += &peer;
        assert_eq!(total.down.round(), 200);
        assert_eq!(total.up.total(), 20);
    }

    #[test]
    fn test_progress() {
        let status = DownloadStatus::new(TorrentState::Downloading, 50, 200);
        assert_eq!(status.progress, 0.25);
        assert!(!status.is_finished());
        assert_eq!(DownloadStatus::new(TorrentState::Downloading, 0, 0).progress, 1.0);
    }
}
