use std::{
    net::{Ipv4Addr, SocketAddr},
    time::{Duration, Instant},
};
use bytes::{Buf, BufMut, BytesMut};
use tokio::net::UdpSocket;
use url::Url;
use super::{Announce, AnnounceParams, Event, PeerSource, Result, TrackerError};

// Reference: https://www.bittorrent.org/beps/bep_0015.html

const PROTOCOL_ID: i64      = 0x41727101980;
const ACTION_CONNECT: i32   = 0;
const ACTION_ANNOUNCE: i32  = 1;
const ACTION_ERROR: i32     = 3;

// A connection id may be reused for a minute after it was handed out.
const CONNECTION_ID_TTL: Duration = Duration::from_secs(60);

pub struct UdpTracker {

    url: Url,

    socket: Option<UdpSocket>,

    conn_id: Option<(i64, Instant)>,

}

impl UdpTracker {

    pub fn new(url: Url) -> Self {
        Self {
            url,
            socket: None,
            conn_id: None,
        }
    }

    // Binds and connects the socket on first use.
    async fn socket(&mut self) -> Result<&UdpSocket> {
        if self.socket.is_none() {
            let host = self.url.host_str().ok_or(TrackerError::InvalidUrl)?;
            let port = self.url.port().ok_or(TrackerError::InvalidUrl)?;
            let addr = tokio::net::lookup_host((host, port))
                .await?
                .next()
                .ok_or(TrackerError::InvalidUrl)?;
            let bind: SocketAddr = if addr.is_ipv4() {
                (Ipv4Addr::UNSPECIFIED, 0).into()
            } else {
                (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
            };
            let socket = UdpSocket::bind(bind).await?;
            socket.connect(addr).await?;
            self.socket = Some(socket);
        }
        self.socket.as_ref().ok_or(TrackerError::InvalidUrl)
    }

    async fn connection_id(&mut self) -> Result<i64> {
        if let Some((id, time)) = self.conn_id {
            if time.elapsed() < CONNECTION_ID_TTL {
                return Ok(id);
            }
        }

        let trans_id: i32 = rand::random();
        let mut buf = BytesMut::with_capacity(16);
        buf.put_i64(PROTOCOL_ID);
        buf.put_i32(ACTION_CONNECT);
        buf.put_i32(trans_id);

        let socket = self.socket().await?;
        socket.send(&buf).await?;

        let mut resp_buf = [0u8; 16];
        let n = socket.recv(&mut resp_buf).await?;
        let mut resp = check_header(&resp_buf[..n], ACTION_CONNECT, trans_id, 16)?;
        let id = resp.get_i64();

        tracing::trace!("connected to tracker");
        self.conn_id = Some((id, Instant::now()));
        Ok(id)
    }
}

// Validates the action and transaction id, returning the rest of the packet.
fn check_header(mut resp: &[u8], action: i32, trans_id: i32, min_len: usize) -> Result<&[u8]> {
    if resp.len() < 8 {
        return Err(TrackerError::ResponseError("invalid response length".to_string()));
    }
    let resp_action = resp.get_i32();
    if resp.get_i32() != trans_id {
        return Err(TrackerError::ResponseError("invalid transaction id".to_string()));
    }
    if resp_action == ACTION_ERROR {
        return Err(TrackerError::ResponseError(String::from_utf8_lossy(resp).into_owned()));
    }
    if resp_action != action {
        return Err(TrackerError::ResponseError(format!("expected action {}", action)));
    }
    if resp.len() + 8 < min_len {
        return Err(TrackerError::ResponseError("invalid response length".to_string()));
    }
    Ok(resp)
}

#[async_trait::async_trait]
impl PeerSource for UdpTracker {

    async fn announce(&mut self, params: AnnounceParams) -> Result<Announce> {

        let conn_id = self.connection_id().await?;
        let trans_id: i32 = rand::random();

        let mut buf = BytesMut::with_capacity(98);
        buf.put_i64(conn_id);
        buf.put_i32(ACTION_ANNOUNCE);
        buf.put_i32(trans_id);
        buf.put(&params.info_hash[..]);
        buf.put(&params.client_id[..]);
        buf.put_u64(params.downloaded);
        buf.put_u64(params.left);
        buf.put_u64(params.uploaded);
        buf.put_i32(
            match params.event {
                Some(Event::Completed) => 1,
                Some(Event::Started) => 2,
                Some(Event::Stopped) => 3,
                None => 0,
            }
        );
        buf.put_i32(0); // IP address, default = 0.
        buf.put_i32(rand::random()); // Key, random.
        buf.put_i32(params.num_want.map_or(-1, |n| n.min(i32::MAX as usize) as i32));
        buf.put_u16(params.port);

        let socket = self.socket().await?;
        socket.send(&buf).await?;

        let mut resp_buf = [0u8; 1500];
        let n = socket.recv(&mut resp_buf).await?;
        let mut resp = match check_header(&resp_buf[..n], ACTION_ANNOUNCE, trans_id, 20) {
            Ok(resp) => resp,
            Err(e) => {
                // Force a fresh connection id next time.
                self.conn_id = None;
                return Err(e);
            }
        };

        let interval = resp.get_i32();
        let leechers = resp.get_i32();
        let seeders = resp.get_i32();
        tracing::debug!("{} seeders, {} leechers", seeders, leechers);

        let mut peers = Vec::with_capacity(resp.len() / 6);
        while resp.len() >= 6 {
            let ip = Ipv4Addr::from(resp.get_u32());
            peers.push(SocketAddr::new(ip.into(), resp.get_u16()));
        }

        Ok(Announce {
            peers,
            interval: u64::try_from(interval).ok().filter(|i| *i > 0).map(Duration::from_secs),
            min_interval: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Answers one connect and one announce, as a tracker would.
    async fn fake_tracker(peers: Vec<SocketAddr>) -> (Url, tokio::task::JoinHandle<Vec<u8>>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("udp://{}", socket.local_addr().unwrap())).unwrap();
        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 1500];

            let (n, from) = socket.recv_from(&mut buf).await.unwrap();
            assert_eq!(n, 16);
            let mut req = &buf[..n];
            assert_eq!(req.get_i64(), PROTOCOL_ID);
            assert_eq!(req.get_i32(), ACTION_CONNECT);
            let trans_id = req.get_i32();
            let mut resp = BytesMut::new();
            resp.put_i32(ACTION_CONNECT);
            resp.put_i32(trans_id);
            resp.put_i64(0x1234);
            socket.send_to(&resp, from).await.unwrap();

            let (n, from) = socket.recv_from(&mut buf).await.unwrap();
            assert_eq!(n, 98);
            let announce = buf[..n].to_vec();
            let mut req = &buf[..n];
            assert_eq!(req.get_i64(), 0x1234);
            assert_eq!(req.get_i32(), ACTION_ANNOUNCE);
            let trans_id = req.get_i32();
            let mut resp = BytesMut::new();
            resp.put_i32(ACTION_ANNOUNCE);
            resp.put_i32(trans_id);
            resp.put_i32(900);
            resp.put_i32(1);
            resp.put_i32(2);
            for peer in peers {
                if let SocketAddr::V4(peer) = peer {
                    resp.put(&peer.ip().octets()[..]);
                    resp.put_u16(peer.port());
                }
            }
            socket.send_to(&resp, from).await.unwrap();
            announce
        });
        (url, handle)
    }

    #[tokio::test]
    async fn test_announce() {
        let peers: Vec<SocketAddr> = vec!["10.1.2.3:6881".parse().unwrap(), "10.1.2.4:51413".parse().unwrap()];
        let (url, server) = fake_tracker(peers.clone()).await;

        let mut tracker = UdpTracker::new(url);
        let params = AnnounceParams {
            info_hash: [7; 20],
            left: 500,
            event: Some(Event::Started),
            num_want: Some(30),
            port: 6881,
            ..Default::default()
        };
        let announce = tracker.announce(params).await.unwrap();
        assert_eq!(announce.peers, peers);
        assert_eq!(announce.interval, Some(Duration::from_secs(900)));

        let request = server.await.unwrap();
        assert_eq!(&request[16..36], &[7; 20]);
        // Event field sits after the three counters.
        assert_eq!(&request[80..84], &2i32.to_be_bytes());
        assert_eq!(&request[92..96], &30i32.to_be_bytes());
    }

    #[test]
    fn test_error_action() {
        let mut resp = BytesMut::new();
        resp.put_i32(ACTION_ERROR);
        resp.put_i32(5);
        resp.put(&b"torrent not registered"[..]);
        match check_header(&resp, ACTION_ANNOUNCE, 5, 20) {
            Err(TrackerError::ResponseError(msg)) => assert_eq!(msg, "torrent not registered"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(check_header(&resp, ACTION_ANNOUNCE, 6, 20).is_err());
    }
}
