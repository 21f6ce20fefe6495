use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};
use bytes::Buf;
use serde::de;
use serde_derive::Deserialize;
use url::Url;
use super::{Announce, AnnounceParams, PeerSource, Result, TrackerError};

pub struct HttpTracker {

    client: reqwest::Client,

    url: Url,

    // Echoed back on later announces once the tracker hands us one.
    id: Option<String>,

}

impl HttpTracker {

    pub fn new(url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            id: None,
        }
    }

    fn announce_url(&self, params: &AnnounceParams) -> String {
        // Keep any query the tracker url already carries, e.g. passkeys.
        let sep = if self.url.query().is_some() { '&' } else { '?' };
        let mut url = format!(
            "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            self.url.as_str(),
            sep,
            urlencoding::encode_binary(&params.info_hash),
            urlencoding::encode_binary(&params.client_id),
            params.port,
            params.uploaded,
            params.downloaded,
            params.left,
        );
        if let Some(event) = params.event {
            url.push_str(&format!("&event={}", event));
        }
        if let Some(num_want) = params.num_want {
            url.push_str(&format!("&numwant={}", num_want));
        }
        if let Some(tracker_id) = &self.id {
            url.push_str(&format!("&trackerid={}", urlencoding::encode(tracker_id)));
        }
        url
    }
}

#[async_trait::async_trait]
impl PeerSource for HttpTracker {

    async fn announce(&mut self, params: AnnounceParams) -> Result<Announce> {

        let url = self.announce_url(&params);
        tracing::debug!("announce url: {}", url);

        let raw_resp = self.client
            .get(url)
            .send()
            .await?
            .bytes()
            .await?;

        let resp: HttpResponse = serde_bencode::from_bytes(&raw_resp)?;
        tracing::trace!("announce response: {:?}", resp);

        if let Some(failure) = resp.failure_reason {
            return Err(TrackerError::ResponseError(failure));
        }
        if let Some(warning) = resp.warning_message {
            tracing::warn!("warning: {}", warning);
        }
        if let Some(tracker_id) = resp.tracker_id {
            self.id = Some(tracker_id);
        }

        Ok(Announce {
            peers: resp.peers,
            interval: resp.interval.map(Duration::from_secs),
            min_interval: resp.min_interval.map(Duration::from_secs),
        })
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct HttpResponse {

    // If present, then no other keys may be present.
    #[serde(default, rename = "failure reason")]
    pub failure_reason: Option<String>,

    // Similar to failure reason, but the response still gets processed normally.
    #[serde(default, rename = "warning message")]
    pub warning_message: Option<String>,

    // Seconds the client should wait between regular requests.
    #[serde(default)]
    pub interval: Option<u64>,

    // Clients must not reannounce more frequently than this.
    #[serde(default, rename = "min interval")]
    pub min_interval: Option<u64>,

    #[serde(default, rename = "tracker id")]
    pub tracker_id: Option<String>,

    // Number of seeders.
    #[serde(default)]
    pub complete: Option<u64>,

    // Number of leechers.
    #[serde(default)]
    pub incomplete: Option<u64>,

    #[serde(default, deserialize_with = "peer_deserialize")]
    pub peers: Vec<SocketAddr>,
}

// The tracker can either return a dictionary model or a compacted string,
// even when the compact form was asked for.
fn peer_deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct PeerVisitor;

    impl<'de> de::Visitor<'de> for PeerVisitor {

        type Value = Vec<SocketAddr>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string of bytes or a list of dictionaries")
        }

        // 4 bytes of IP then 2 bytes of port, in network byte order.
        fn visit_bytes<E>(self, mut v: &[u8]) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.len() % 6 != 0 {
                return Err(E::custom("peer string not multiple of 6"));
            }

            let mut peers = Vec::with_capacity(v.len() / 6);
            while v.has_remaining() {
                let ip = Ipv4Addr::from(v.get_u32());
                peers.push(SocketAddr::new(IpAddr::V4(ip), v.get_u16()));
            }
            Ok(peers)
        }

        // List of dictionaries with "ip" and "port", hostnames are skipped.
        fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            #[derive(Deserialize)]
            struct PeerItem {
                ip: String,
                port: u16,
            }

            let mut peers = Vec::new();
            while let Some(peer) = seq.next_element::<PeerItem>()? {
                match peer.ip.parse::<IpAddr>() {
                    Ok(ip) => peers.push(SocketAddr::new(ip, peer.port)),
                    Err(_) => tracing::debug!("skipping peer with unparsable ip {}", peer.ip),
                }
            }
            Ok(peers)
        }
    }

    deserializer.deserialize_any(PeerVisitor)
}

#[cfg(test)]
mod tests {
    use tokio::{io::{AsyncReadExt, AsyncWriteExt}, net::TcpListener};
    use crate::tracker::Event;
    use super::*;

    #[test]
    fn test_parse_response_binary() {
        let s = "64383a636f6d706c65746569396531303a696e636f6d706c657465693165383a696e74657276616c69313830306531323a6d696e20696e74657276616c693138303065353a706565727336303a52454d051ae1ca2f2a2ec00884937726decc61759ab8138851ab05e8f6bb5062f69770469247493ad4d005879f2ec8d54237ce44ea6043db8806c8d565";
        let response: HttpResponse = serde_bencode::from_bytes(&hex::decode(s).unwrap()).unwrap();
        assert_eq!(response.interval, Some(1800));
        assert_eq!(response.min_interval, Some(1800));
        assert_eq!(response.complete, Some(9));
        assert_eq!(response.incomplete, Some(1));
        assert_eq!(response.peers.len(), 10);
        assert!(response.peers.contains(&SocketAddr::new(IpAddr::V4(Ipv4Addr::new(97, 117, 154, 184)), 5000)));
        assert!(response.peers.contains(&SocketAddr::new(IpAddr::V4(Ipv4Addr::new(5, 135, 159, 46)), 51413)));
    }

    #[test]
    fn test_parse_response_dictionary() {
        let raw = b"d8:intervali900e5:peersld2:ip9:10.0.0.177:peer id20:aaaaaaaaaaaaaaaaaaaa4:porti6881eed2:ip3:::14:porti51413eed2:ip7:unknown4:porti1eeee";
        let response: HttpResponse = serde_bencode::from_bytes(raw).unwrap();
        assert_eq!(response.interval, Some(900));
        assert_eq!(response.peers, vec![
            "10.0.0.17:6881".parse().unwrap(),
            "[::1]:51413".parse().unwrap(),
        ]);
    }

    #[test]
    fn test_failure_reason() {
        let response: HttpResponse = serde_bencode::from_bytes(b"d14:failure reason12:unregisterede").unwrap();
        assert_eq!(response.failure_reason.as_deref(), Some("unregistered"));
        assert!(response.peers.is_empty());
    }

    // Serves a single canned response and hands back the request line.
    async fn serve_once(body: Vec<u8>) -> (Url, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("http://{}/announce", listener.local_addr().unwrap())).unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut chunk).await.unwrap();
                assert!(n > 0);
                buf.extend_from_slice(&chunk[..n]);
            }
            let header = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n", body.len());
            socket.write_all(header.as_bytes()).await.unwrap();
            socket.write_all(&body).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&buf).lines().next().unwrap_or_default().to_string()
        });
        (url, handle)
    }

    #[tokio::test]
    async fn test_announce() {
        let mut body = b"d8:intervali120e12:min intervali30e5:peers6:".to_vec();
        body.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
        body.push(b'e');
        let (url, server) = serve_once(body).await;

        let mut tracker = HttpTracker::new(url);
        let params = AnnounceParams {
            info_hash: [0xab; 20],
            client_id: *b"-FX0100-abcdefghijkl",
            port: 6881,
            left: 1000,
            event: Some(Event::Started),
            num_want: Some(50),
            ..Default::default()
        };
        let announce = tracker.announce(params).await.unwrap();
        assert_eq!(announce.peers, vec!["127.0.0.1:6881".parse().unwrap()]);
        assert_eq!(announce.interval, Some(Duration::from_secs(120)));
        assert_eq!(announce.min_interval, Some(Duration::from_secs(30)));

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /announce?info_hash=%AB%AB"));
        assert!(request.contains("peer_id=-FX0100-abcdefghijkl"));
        assert!(request.contains("&left=1000&compact=1&event=started&numwant=50"));
    }
}
