use std::net::SocketAddr;
use url::Url;
use crate::ID;

#[derive(Debug, thiserror::Error)]
pub enum MagnetError {

    #[error("invalid magnet uri: {0}")]
    Url(#[from] url::ParseError),

    #[error("uri scheme must be magnet")]
    InvalidScheme,

    #[error("magnet has no btih exact topic")]
    MissingInfoHash,

    #[error("invalid info hash: {0}")]
    InvalidInfoHash(String),
}

// Parsed magnet link, only the btih topic is supported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Magnet {

    pub info_hash: ID,

    // Display name.
    pub name: Option<String>,

    pub trackers: Vec<Url>,

    // Peer addresses given with x.pe.
    pub peers: Vec<SocketAddr>,

}

impl Magnet {

    pub fn parse(uri: &str) -> Result<Magnet, MagnetError> {
        let url = Url::parse(uri)?;
        if url.scheme() != "magnet" {
            return Err(MagnetError::InvalidScheme);
        }

        let mut info_hash = None;
        let mut name = None;
        let mut trackers = Vec::new();
        let mut peers = Vec::new();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    if let Some(hash) = value.strip_prefix("urn:btih:") {
                        info_hash = Some(parse_btih(hash)?);
                    }
                }
                "dn" => name = Some(value.into_owned()),
                "tr" => match Url::parse(&value) {
                    Ok(tracker) => trackers.push(tracker),
                    Err(e) => tracing::warn!("ignoring invalid magnet tracker {}: {}", value, e),
                },
                "x.pe" => match value.parse() {
                    Ok(addr) => peers.push(addr),
                    Err(_) => tracing::warn!("ignoring invalid magnet peer {}", value),
                },
                _ => {}
            }
        }

        Ok(Magnet {
            info_hash: info_hash.ok_or(MagnetError::MissingInfoHash)?,
            name,
            trackers,
            peers,
        })
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

// Info hash as 40 hex characters or 32 base32 characters.
fn parse_btih(s: &str) -> Result<ID, MagnetError> {
    let mut id = [0; 20];
    match s.len() {
        40 => {
            hex::decode_to_slice(s, &mut id)
                .map_err(|_| MagnetError::InvalidInfoHash(s.to_string()))?;
        }
        32 => {
            let bytes = base32_decode(s).ok_or_else(|| MagnetError::InvalidInfoHash(s.to_string()))?;
            id.copy_from_slice(&bytes);
        }
        _ => return Err(MagnetError::InvalidInfoHash(s.to_string())),
    }
    Ok(id)
}

// RFC 4648 base32 without padding.
fn base32_decode(s: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(s.len() * 5 / 8);
    let mut buf: u64 = 0;
    let mut bits = 0;
    for c in s.bytes() {
        let val = match c.to_ascii_uppercase() {
            c @ b'A'..=b'Z' => c - b'A',
            c @ b'2'..=b'7' => c - b'2' + 26,
            _ => return None,
        };
        buf = (buf << 5) | val as u64;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buf >> bits) as u8);
        }
    }
    Some(out)
}
