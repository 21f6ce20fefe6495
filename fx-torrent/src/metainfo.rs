use std::{collections::HashSet, path::{Component, Path, PathBuf}};
use rand::seq::SliceRandom;
use serde_bencode::value::Value;
use serde_derive::{Deserialize, Serialize};
use sha1::Digest;
use url::Url;
use crate::{store::FileInfo, ID};

#[derive(Debug, thiserror::Error)]
pub enum MetaInfoError {

    #[error("bencode error whilst decoding metainfo: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    #[error("invalid file extension, expected .torrent")]
    InvalidExtension,

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("metainfo has no info dictionary")]
    MissingInfo,

    #[error("invalid pieces length, must be a non zero multiple of 20")]
    InvalidPiecesLength,

    #[error("piece length must be greater than zero")]
    ZeroPieceLength,

    #[error("expected {expected} pieces for torrent length, found {found}")]
    PieceCountMismatch { expected: usize, found: usize },

    #[error("torrent has no files or a total length of zero")]
    NoFiles,

    #[error("file has invalid path: {0}")]
    InvalidPath(String),

    #[error("info dictionary does not match info hash")]
    InfoHashMismatch,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct File {

    pub path: Vec<String>,

    pub length: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5sum: Option<String>,

}

#[derive(Clone, Deserialize, Serialize)]
pub struct Info {

    // Suggested file or directory name.
    pub name: String,

    // Concatenation of the 20-byte SHA1 hash of every piece.
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,

    #[serde(rename = "piece length")]
    pub piece_length: u64,

    // Length of the file in single file mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,

    // One dictionary per file in multi file mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<File>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5sum: Option<String>,

}

#[derive(Deserialize, Clone)]
pub struct MetaInfo {

    #[serde(default, deserialize_with = "crate::de::opt_url_deserialize")]
    pub announce: Option<Url>,

    pub info: Info,

    // SHA1 of the raw bencoded info dict.
    #[serde(skip)]
    info_hash: ID,

    // The bencoded info dict, served to peers requesting metadata.
    #[serde(skip)]
    info_bytes: Vec<u8>,

    #[serde(default)]
    #[serde(rename = "announce-list")]
    #[serde(deserialize_with = "crate::de::announce_list_deserialize")]
    pub announce_list: Option<Vec<Vec<Url>>>,

    // Creation time in UNIX epoch format.
    #[serde(default)]
    #[serde(rename = "creation date")]
    pub creation_date: Option<i64>,

    #[serde(default)]
    pub comment: Option<String>,

    #[serde(default)]
    #[serde(rename = "created by")]
    pub created_by: Option<String>,

}

// Used to write a metainfo back out, urls as plain strings.
#[derive(Serialize)]
struct RawMetaInfo<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    announce: Option<&'a str>,
    #[serde(rename = "announce-list", skip_serializing_if = "Vec::is_empty")]
    announce_list: Vec<Vec<&'a str>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    comment: Option<&'a str>,
    #[serde(rename = "created by", skip_serializing_if = "Option::is_none")]
    created_by: Option<&'a str>,
    #[serde(rename = "creation date", skip_serializing_if = "Option::is_none")]
    creation_date: Option<i64>,
    info: &'a Value,
}

impl MetaInfo {

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<MetaInfo, MetaInfoError> {
        if path.as_ref().extension().unwrap_or_default() != "torrent" {
            return Err(MetaInfoError::InvalidExtension);
        }
        Self::from_bytes(&std::fs::read(path)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<MetaInfo, MetaInfoError> {

        let mut metainfo: MetaInfo = serde_bencode::from_bytes(bytes)?;

        // Re-encode the info value to get its raw bytes, dict keys are emitted sorted
        // so this matches the canonical encoding in the file.
        let value: Value = serde_bencode::from_bytes(bytes)?;
        let info = match value {
            Value::Dict(mut dict) => dict.remove(b"info".as_slice()).ok_or(MetaInfoError::MissingInfo)?,
            _ => return Err(MetaInfoError::MissingInfo),
        };
        metainfo.info_bytes = serde_bencode::to_bytes(&info)?;
        metainfo.info_hash = sha1::Sha1::digest(&metainfo.info_bytes).into();
        metainfo.validate()?;

        tracing::debug!("metainfo created: {:#?}", metainfo);
        Ok(metainfo)
    }

    // Builds metainfo from an info dict fetched from peers, checked against the expected hash.
    pub fn from_info_bytes(info_bytes: Vec<u8>, info_hash: ID, trackers: &[Url]) -> Result<MetaInfo, MetaInfoError> {
        if sha1::Sha1::digest(&info_bytes).as_slice() != info_hash {
            return Err(MetaInfoError::InfoHashMismatch);
        }
        let info: Info = serde_bencode::from_bytes(&info_bytes)?;
        let metainfo = MetaInfo {
            announce: trackers.first().cloned(),
            announce_list: if trackers.is_empty() { None } else { Some(vec![trackers.to_vec()]) },
            info,
            info_hash,
            info_bytes,
            creation_date: None,
            comment: None,
            created_by: None,
        };
        metainfo.validate()?;
        Ok(metainfo)
    }

    // Builds a single file torrent over the given data.
    pub fn create_single(name: &str, data: &[u8], piece_len: usize, trackers: &[Url]) -> Result<MetaInfo, MetaInfoError> {
        let info = Info {
            name: name.to_string(),
            pieces: hash_pieces(data, piece_len),
            piece_length: piece_len as u64,
            length: Some(data.len() as u64),
            files: None,
            private: None,
            md5sum: None,
        };
        Self::create(info, trackers)
    }

    // Builds a multi file torrent, data of each file is laid out in order.
    pub fn create_multi(name: &str, files: &[(Vec<String>, Vec<u8>)], piece_len: usize, trackers: &[Url]) -> Result<MetaInfo, MetaInfoError> {
        let data: Vec<u8> = files.iter().flat_map(|(_, d)| d.iter().copied()).collect();
        let info = Info {
            name: name.to_string(),
            pieces: hash_pieces(&data, piece_len),
            piece_length: piece_len as u64,
            length: None,
            files: Some(files.iter().map(|(path, d)| File {
                path: path.clone(),
                length: d.len() as u64,
                md5sum: None,
            }).collect()),
            private: None,
            md5sum: None,
        };
        Self::create(info, trackers)
    }

    fn create(info: Info, trackers: &[Url]) -> Result<MetaInfo, MetaInfoError> {
        let info_bytes = serde_bencode::to_bytes(&info)?;
        let info_hash = sha1::Sha1::digest(&info_bytes).into();
        let mut metainfo = Self::from_info_bytes(info_bytes, info_hash, trackers)?;
        metainfo.created_by = Some(concat!("fx-torrent/", env!("CARGO_PKG_VERSION")).to_string());
        Ok(metainfo)
    }

    // Encodes the metainfo as the contents of a .torrent file.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MetaInfoError> {
        let info: Value = serde_bencode::from_bytes(&self.info_bytes)?;
        let raw = RawMetaInfo {
            announce: self.announce.as_ref().map(Url::as_str),
            announce_list: self.announce_list.iter()
                .flatten()
                .map(|tier| tier.iter().map(Url::as_str).collect())
                .collect(),
            comment: self.comment.as_deref(),
            created_by: self.created_by.as_deref(),
            creation_date: self.creation_date,
            info: &info,
        };
        Ok(serde_bencode::to_bytes(&raw)?)
    }

    fn validate(&self) -> Result<(), MetaInfoError> {
        if self.info.pieces.len() % 20 != 0 || self.info.pieces.is_empty() {
            return Err(MetaInfoError::InvalidPiecesLength);
        }
        if self.info.piece_length == 0 {
            return Err(MetaInfoError::ZeroPieceLength);
        }

        match (&self.info.files, self.info.length) {
            (Some(files), _) => {
                if files.is_empty() {
                    return Err(MetaInfoError::NoFiles);
                }
                for file in files {
                    validate_path(&file.path)?;
                }
            }
            (None, Some(_)) => validate_path(std::slice::from_ref(&self.info.name))?,
            (None, None) => return Err(MetaInfoError::NoFiles),
        }

        let total_len = self.total_len();
        if total_len == 0 {
            return Err(MetaInfoError::NoFiles);
        }
        let expected = ((total_len + self.info.piece_length - 1) / self.info.piece_length) as usize;
        if expected != self.num_pieces() {
            return Err(MetaInfoError::PieceCountMismatch { expected, found: self.num_pieces() });
        }
        Ok(())
    }

    pub fn piece_hashes(&self) -> Vec<ID> {
        self.info.pieces
            .chunks_exact(20)
            .map(|c| {
                let mut hash = [0; 20];
                hash.copy_from_slice(c);
                hash
            })
            .collect()
    }

    pub fn piece_len(&self) -> usize { self.info.piece_length as usize }

    pub fn num_pieces(&self) -> usize { self.info.pieces.len() / 20 }

    pub fn is_multi_file(&self) -> bool { self.info.files.is_some() }

    pub fn total_len(&self) -> u64 {
        match &self.info.files {
            Some(files) => files.iter().map(|f| f.length).sum(),
            None => self.info.length.unwrap_or(0),
        }
    }

    pub fn info_hash(&self) -> ID { self.info_hash }

    pub fn info_bytes(&self) -> &[u8] { &self.info_bytes }

    pub fn name(&self) -> &str { &self.info.name }

    // Tracker urls, tiers in order with the trackers of a tier shuffled.
    pub fn tracker_urls(&self) -> Vec<Url> {
        let mut urls: Vec<Url> = Vec::new();
        if let Some(announce_list) = &self.announce_list {
            for tier in announce_list {
                let mut tier = tier.clone();
                tier.shuffle(&mut rand::thread_rng());
                urls.extend(tier);
            }
        }
        if let Some(announce) = &self.announce {
            urls.push(announce.clone());
        }
        let mut seen = HashSet::new();
        urls.retain(|url| seen.insert(url.to_string()));
        urls
    }

    pub fn files(&self) -> Vec<FileInfo> {
        match &self.info.files {
            Some(files) => {
                let mut offset = 0;
                files.iter().map(|f| {
                    let file_info = FileInfo {
                        path: f.path.iter().collect::<PathBuf>(),
                        length: f.length,
                        offset,
                        md5sum: f.md5sum.clone(),
                    };
                    offset += f.length;
                    file_info
                }).collect()
            }
            None => vec![FileInfo {
                path: self.info.name.clone().into(),
                length: self.info.length.unwrap_or(0),
                offset: 0,
                md5sum: self.info.md5sum.clone(),
            }],
        }
    }

    pub fn creation_date_fmt(&self) -> Option<String> {
        self.creation_date.map(|v| {
            chrono::DateTime::from_timestamp(v, 0)
                .map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "Invalid date".to_string())
        })
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

fn hash_pieces(data: &[u8], piece_len: usize) -> Vec<u8> {
    data.chunks(piece_len.max(1))
        .flat_map(|piece| <[u8; 20]>::from(sha1::Sha1::digest(piece)))
        .collect()
}

// Rejects paths which could escape the torrent directory.
fn validate_path(components: &[String]) -> Result<(), MetaInfoError> {
    if components.is_empty() {
        return Err(MetaInfoError::InvalidPath(String::new()));
    }
    for c in components {
        let valid = !c.is_empty()
            && Path::new(c).components().all(|comp| matches!(comp, Component::Normal(_)));
        if !valid {
            return Err(MetaInfoError::InvalidPath(components.join("/")));
        }
    }
    Ok(())
}

impl std::fmt::Debug for MetaInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaInfo")
            .field("announce", &self.announce.as_ref().map(Url::as_str))
            .field("info", &self.info)
            .field("info_hash", &self.info_hash_hex())
            .field("announce_list", &self.announce_list.as_ref().map(|v|
                v.iter().map(|v|
                    v.iter().map(Url::as_str).collect()
                ).collect::<Vec<Vec<&str>>>()
            ))
            .field("creation_date", &self.creation_date_fmt())
            .field("comment", &self.comment)
            .field("created_by", &self.created_by)
            .finish()
    }
}

// Pieces field is left out.
impl std::fmt::Debug for Info {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Info")
            .field("name", &self.name)
            .field("num pieces", &(self.pieces.len() / 20))
            .field("piece_length", &self.piece_length)
            .field("length", &self.length)
            .field("files", &self.files)
            .field("private", &self.private)
            .finish()
    }
}

// Deterministic file contents for tests.
#[cfg(test)]
pub(crate) fn test_data(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 ^ seed).collect()
}

#[cfg(test)]
pub(crate) fn test_metainfo_multi(lens: &[usize], piece_len: usize) -> MetaInfo {
    let files: Vec<(Vec<String>, Vec<u8>)> = lens
        .iter()
        .enumerate()
        .map(|(i, len)| (vec![format!("file{}.bin", i)], test_data(*len, i as u8)))
        .collect();
    MetaInfo::create_multi("test", &files, piece_len, &[]).unwrap()
}
