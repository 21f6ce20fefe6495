use fx_torrent::{AddTorrentOptions, MetaInfo, Session, TorrentHandle, TorrentSource, TorrentState};

mod common;
use common::*;

async fn add(session: &Session, metainfo: &MetaInfo) -> TorrentHandle {
    session
        .add_torrent(TorrentSource::Bytes(metainfo.to_bytes().unwrap()), AddTorrentOptions::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_resume_data_trusted_on_restart() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let data = test_data(PIECE_LEN * 4, 3);
    let metainfo = MetaInfo::create_single("movie.bin", &data, PIECE_LEN, &[]).unwrap();
    let file = dir.path().join("movie.bin");
    std::fs::write(&file, &data).unwrap();

    // First run hashes the data and leaves the sidecar behind on shutdown.
    let session = Session::new(test_config(dir.path()));
    let handle = add(&session, &metainfo).await;
    wait_for_state(&session, handle, TorrentState::Completed).await;
    session.shutdown().await;
    let sidecar = dir.path().join(format!(".{}.fastresume", metainfo.info_hash_hex()));
    assert!(sidecar.exists());

    // Same length but different bytes, only hashing would notice.
    let mut corrupted = data.clone();
    corrupted[10] ^= 0xff;
    std::fs::write(&file, &corrupted).unwrap();

    let session = Session::new(test_config(dir.path()));
    let handle = add(&session, &metainfo).await;
    wait_for_state(&session, handle, TorrentState::Completed).await;
    assert_eq!(session.status(handle).unwrap().pieces_verified, 4);
    session.shutdown().await;

    // Without the sidecar every piece is hashed again.
    std::fs::remove_file(&sidecar).unwrap();
    let session = Session::new(test_config(dir.path()));
    let handle = add(&session, &metainfo).await;
    wait_for_state(&session, handle, TorrentState::Downloading).await;
    assert_eq!(session.status(handle).unwrap().pieces_verified, 3);
    session.shutdown().await;
}

#[tokio::test]
async fn test_remove_with_files_deletes_sidecar() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let data = test_data(PIECE_LEN * 2, 4);
    let metainfo = MetaInfo::create_single("clip.bin", &data, PIECE_LEN, &[]).unwrap();
    std::fs::write(dir.path().join("clip.bin"), &data).unwrap();

    let session = Session::new(test_config(dir.path()));
    let handle = add(&session, &metainfo).await;
    wait_for_state(&session, handle, TorrentState::Completed).await;
    session.remove_torrent(handle, true).await.unwrap();

    assert!(!dir.path().join("clip.bin").exists());
    assert!(!dir.path().join(format!(".{}.fastresume", metainfo.info_hash_hex())).exists());
    session.shutdown().await;
}
