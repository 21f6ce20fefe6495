// Lifecycle of a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TorrentState {

    #[default]
    Creating,

    // Started from a magnet, fetching the info dict from peers.
    RetrievingMetadata,

    // Hashing data already on disk.
    CheckingFiles,

    Downloading,

    // All wanted pieces are verified.
    Completed,

    Paused,

    // Unrecoverable, nothing leaves this state.
    Error,

}

impl TorrentState {

    pub fn can_transition_to(&self, next: TorrentState) -> bool {
        use TorrentState::*;
        matches!(
            (self, next),
            (Creating, RetrievingMetadata)
                | (Creating, CheckingFiles)
                | (RetrievingMetadata, CheckingFiles)
                | (CheckingFiles, Downloading)
                | (CheckingFiles, Completed)
                | (Downloading, Completed)
                | (Downloading, Paused)
                | (Paused, Downloading)
                // Wanted pieces grew after completion.
                | (Completed, Downloading)
                // Any unrecoverable failure.
                | (Creating | RetrievingMetadata | CheckingFiles | Downloading | Completed | Paused, Error)
        )
    }

    // Whether peers are exchanging data in this state.
    pub fn is_active(&self) -> bool {
        matches!(self, TorrentState::RetrievingMetadata | TorrentState::Downloading | TorrentState::Completed)
    }
}

impl std::fmt::Display for TorrentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TorrentState::Creating => "creating",
            TorrentState::RetrievingMetadata => "retrieving metadata",
            TorrentState::CheckingFiles => "checking files",
            TorrentState::Downloading => "downloading",
            TorrentState::Completed => "completed",
            TorrentState::Paused => "paused",
            TorrentState::Error => "error",
        };
        write!(f, "{}", s)
    }
}
