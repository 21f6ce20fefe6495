use std::{
    fs,
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};
use crate::store::FileInfo;
use super::Result;

#[derive(Debug)]
pub struct TorrentFile {
    pub info: FileInfo,
    pub path: PathBuf,
    pub handle: fs::File,
}

impl TorrentFile {

    // Opens the file, creating it and any missing parent directories.
    pub fn open(dir: &Path, info: FileInfo) -> Result<Self> {
        let path = dir.join(&info.path);
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                tracing::info!("creating directory: {:?}", parent);
                fs::create_dir_all(parent)?;
            }
        }
        tracing::debug!("opening file: {:?}", &path);
        let handle = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        Ok(Self { info, path, handle })
    }

    // Offset is relative to the start of the file.
    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.handle.seek(SeekFrom::Start(offset))?;
        self.handle.write_all(buf)?;
        Ok(())
    }

    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.handle.seek(SeekFrom::Start(offset))?;
        self.handle.read_exact(buf)?;
        Ok(())
    }

    // Whether the file on disk has the length given in the metainfo.
    pub fn is_complete(&self) -> bool {
        self.handle
            .metadata()
            .map(|m| m.len() == self.info.length)
            .unwrap_or(false)
    }
}
