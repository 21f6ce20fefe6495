use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};
use serde_derive::{Deserialize, Serialize};
use crate::{pieces::Priority, Bitfield, ID};

#[derive(thiserror::Error, Debug)]
pub enum ResumeError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid resume data: {0}")]
    Bencode(#[from] serde_bencode::Error),

}

type Result<T> = std::result::Result<T, ResumeError>;

// Saved next to the torrent data so a restart doesn't rehash everything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeData {

    #[serde(with = "serde_bytes")]
    pub info_hash: Vec<u8>,

    pub num_pieces: u64,

    // Verified pieces, most significant bit first.
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,

    // One priority per file.
    #[serde(with = "serde_bytes")]
    pub file_priorities: Vec<u8>,

}

impl ResumeData {

    pub fn new(info_hash: ID, verified: &Bitfield, file_priorities: &[Priority]) -> Self {
        Self {
            info_hash: info_hash.to_vec(),
            num_pieces: verified.len() as u64,
            pieces: verified.as_raw_slice().to_vec(),
            file_priorities: file_priorities.iter().map(|p| u8::from(*p)).collect(),
        }
    }

    pub fn path(dir: &Path, info_hash: &ID) -> PathBuf {
        dir.join(format!(".{}.fastresume", hex::encode(info_hash)))
    }

    // Returns None when there is no sidecar, or it belongs to another torrent.
    pub fn load(dir: &Path, info_hash: &ID, num_pieces: usize) -> Result<Option<ResumeData>> {
        let bytes = match std::fs::read(Self::path(dir, info_hash)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let data: ResumeData = serde_bencode::from_bytes(&bytes)?;
        if data.info_hash != info_hash.as_slice()
            || data.num_pieces != num_pieces as u64
            || data.pieces.len() != (num_pieces + 7) / 8
        {
            tracing::warn!("ignoring mismatched resume data");
            return Ok(None);
        }
        Ok(Some(data))
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&self.info_hash);
        let path = Self::path(dir, &info_hash);
        // Write then rename so a crash never leaves a truncated sidecar.
        let tmp = path.with_extension("fastresume.tmp");
        std::fs::write(&tmp, serde_bencode::to_bytes(self)?)?;
        std::fs::rename(tmp, path)?;
        Ok(())
    }

    pub fn remove(dir: &Path, info_hash: &ID) -> Result<()> {
        match std::fs::remove_file(Self::path(dir, info_hash)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn verified(&self) -> Bitfield {
        let mut bitfield = Bitfield::from_vec(self.pieces.clone());
        bitfield.truncate(self.num_pieces as usize);
        bitfield
    }

    pub fn file_priorities(&self) -> Vec<Priority> {
        self.file_priorities.iter().map(|p| Priority::from(*p)).collect()
    }
}
