use std::{fs, path::PathBuf, sync::Mutex};
use crate::store::StoreInfo;
use super::{file::TorrentFile, Result, Storage};

// Stores pieces in the torrent files, pieces spanning files are split between them.
#[derive(Debug)]
pub struct DiskStorage {

    info: StoreInfo,

    files: Vec<Mutex<TorrentFile>>,

}

impl DiskStorage {

    pub fn new(info: &StoreInfo) -> Result<Self> {
        if !info.output_dir.is_dir() {
            fs::create_dir_all(&info.output_dir)?;
            tracing::info!("created missing output directory: {:?}", info.output_dir);
        }
        let files = info.files
            .iter()
            .map(|f| TorrentFile::open(&info.output_dir, f.clone()).map(Mutex::new))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { info: info.clone(), files })
    }

    // Calls f for every file section the piece covers, with the file, the
    // offset within the file and the range within the piece.
    fn for_each_section<F>(&self, idx: usize, mut f: F) -> Result<()>
    where
        F: FnMut(&mut TorrentFile, u64, std::ops::Range<usize>) -> Result<()>,
    {
        let piece = self.info.piece_range(idx);
        for file in &self.files[self.info.piece_file_intersections(idx)] {
            let mut file = file.lock()?;
            let bytes = file.info.byte_range();
            let start = piece.start.max(bytes.start);
            let end = piece.end.min(bytes.end);
            if start >= end {
                continue;
            }
            let in_piece = (start - piece.start) as usize..(end - piece.start) as usize;
            f(&mut *file, start - bytes.start, in_piece)?;
        }
        Ok(())
    }
}

impl Storage for DiskStorage {

    fn write_piece(&self, idx: usize, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len(), self.info.piece_length(idx));
        self.for_each_section(idx, |file, offset, range| file.write_at(offset, &data[range]))
    }

    fn read_piece(&self, idx: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; self.info.piece_length(idx)];
        self.for_each_section(idx, |file, offset, range| file.read_at(offset, &mut buf[range]))?;
        Ok(buf)
    }

    fn files_complete(&self) -> bool {
        self.files.iter().all(|f| f.lock().map(|f| f.is_complete()).unwrap_or(false))
    }

    fn remove_files(&self) -> Result<()> {
        let mut dirs: Vec<PathBuf> = Vec::new();
        for file in &self.files {
            let file = file.lock()?;
            match fs::remove_file(&file.path) {
                Ok(()) => tracing::info!("removed file: {:?}", file.path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            dirs.extend(file.path.ancestors().skip(1)
                .take_while(|p| p.starts_with(&self.info.output_dir) && *p != self.info.output_dir)
                .map(PathBuf::from));
        }

        // Clean up directories left empty, deepest first.
        dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
        dirs.dedup();
        for dir in dirs {
            fs::remove_dir(&dir).ok();
        }
        Ok(())
    }
}
