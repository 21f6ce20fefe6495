#![allow(dead_code)]

use std::{
    net::SocketAddr,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use fx_torrent::{Config, MetaInfo, Session, TorrentHandle, TorrentState};

pub const PIECE_LEN: usize = 32_768;

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init()
        .ok();
}

// Deterministic bytes that differ per seed.
pub fn test_data(len: usize, seed: u8) -> Vec<u8> {
    let mut state = 0x9e37_79b9u32 ^ seed as u32;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

pub fn test_config(dir: &Path) -> Config {
    Config {
        dir: dir.to_path_buf(),
        listen_address: None,
        status_interval: Duration::from_millis(100),
        peer_cooldown: Duration::from_millis(500),
        connect_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_secs(2),
        metadata_timeout: Duration::from_secs(5),
        shutdown_grace: Duration::from_millis(500),
        ..Config::default()
    }
}

// Finds a port nothing listens on right now.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .unwrap()
}

pub async fn wait_for_state(session: &Session, handle: TorrentHandle, state: TorrentState) {
    let result = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if session.state(handle).unwrap() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }).await;
    assert!(
        result.is_ok(),
        "torrent never reached {}, last state {}",
        state,
        session.state(handle).unwrap(),
    );
}

// Peer speaking the bare wire protocol that has every piece of a torrent.
pub struct Seeder {

    pub address: SocketAddr,

    // Block requests received over all connections.
    pub requests: Arc<AtomicUsize>,

    task: JoinHandle<()>,

}

impl Seeder {

    pub async fn start(metainfo: &MetaInfo, data: Vec<u8>) -> Seeder {
        Self::start_with(metainfo, data, None).await
    }

    // Seeder that drops each connection once it has received close_after requests,
    // without answering any of them.
    pub async fn flaky(metainfo: &MetaInfo, data: Vec<u8>, close_after: usize) -> Seeder {
        Self::start_with(metainfo, data, Some(close_after)).await
    }

    async fn start_with(metainfo: &MetaInfo, data: Vec<u8>, close_after: Option<usize>) -> Seeder {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let requests = Arc::new(AtomicUsize::new(0));
        let peer = Arc::new(SeedPeer {
            info_hash: metainfo.info_hash(),
            piece_len: metainfo.piece_len(),
            num_pieces: metainfo.num_pieces(),
            data,
            close_after,
            requests: Arc::clone(&requests),
        });
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let peer = Arc::clone(&peer);
                tokio::spawn(async move {
                    peer.serve(stream).await.ok();
                });
            }
        });
        Seeder { address, requests, task }
    }
}

impl Drop for Seeder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct SeedPeer {
    info_hash: [u8; 20],
    piece_len: usize,
    num_pieces: usize,
    data: Vec<u8>,
    close_after: Option<usize>,
    requests: Arc<AtomicUsize>,
}

impl SeedPeer {

    async fn serve(&self, mut stream: TcpStream) -> std::io::Result<()> {

        let mut handshake = [0u8; 68];
        stream.read_exact(&mut handshake).await?;
        if handshake[28..48] != self.info_hash {
            return Ok(());
        }
        let mut reply = Vec::with_capacity(68);
        reply.push(19);
        reply.extend_from_slice(b"BitTorrent protocol");
        reply.extend_from_slice(&[0; 8]);
        reply.extend_from_slice(&self.info_hash);
        reply.extend_from_slice(b"-SD0001-seederseeder");
        stream.write_all(&reply).await?;

        let mut bitfield = vec![0u8; (self.num_pieces + 7) / 8];
        for idx in 0..self.num_pieces {
            bitfield[idx / 8] |= 0x80 >> (idx % 8);
        }
        write_message(&mut stream, 5, &bitfield).await?;
        write_message(&mut stream, 1, &[]).await?;

        let mut received = 0;
        loop {
            let len = stream.read_u32().await? as usize;
            if len == 0 {
                continue;
            }
            let mut msg = vec![0u8; len];
            stream.read_exact(&mut msg).await?;
            // Only requests are answered.
            if msg[0] != 6 || len != 13 {
                continue;
            }
            self.requests.fetch_add(1, Ordering::SeqCst);
            received += 1;
            if self.close_after.map_or(false, |n| received >= n) {
                return Ok(());
            }

            let idx = u32::from_be_bytes([msg[1], msg[2], msg[3], msg[4]]) as usize;
            let begin = u32::from_be_bytes([msg[5], msg[6], msg[7], msg[8]]) as usize;
            let block_len = u32::from_be_bytes([msg[9], msg[10], msg[11], msg[12]]) as usize;
            let start = idx * self.piece_len + begin;
            let mut payload = Vec::with_capacity(8 + block_len);
            payload.extend_from_slice(&(idx as u32).to_be_bytes());
            payload.extend_from_slice(&(begin as u32).to_be_bytes());
            payload.extend_from_slice(&self.data[start..start + block_len]);
            write_message(&mut stream, 7, &payload).await?;
        }
    }
}

async fn write_message(stream: &mut TcpStream, id: u8, payload: &[u8]) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(5 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32 + 1).to_be_bytes());
    buf.push(id);
    buf.extend_from_slice(payload);
    stream.write_all(&buf).await
}
