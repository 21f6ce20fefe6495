use std::{ops::Range, path::PathBuf};
use crate::metainfo::MetaInfo;

// A file of the torrent with its position when all files are viewed as one array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {

    // Path of the file relative to the torrent directory.
    pub path: PathBuf,

    // Length of the file in bytes.
    pub length: u64,

    // Offset in bytes from start of torrent.
    pub offset: u64,

    pub md5sum: Option<String>,

}

impl FileInfo {
    // Byte index range for whole torrent.
    pub fn byte_range(&self) -> Range<u64> {
        self.offset..(self.offset + self.length)
    }
}

// Contains general information on torrent storage.
#[derive(Debug, Clone)]
pub struct StoreInfo {

    // Length of torrent in bytes.
    pub total_len: u64,

    // Length of pieces in bytes.
    pub piece_len: usize,

    // Length of the last piece, will be <= piece_len.
    pub last_piece_len: usize,

    // Number of pieces in torrent.
    pub num_pieces: usize,

    // Files contained in torrent.
    pub files: Vec<FileInfo>,

    // Directory to store downloaded files.
    pub output_dir: PathBuf,

}

impl StoreInfo {

    pub fn new(metainfo: &MetaInfo, output_dir: PathBuf) -> Self {

        let total_len = metainfo.total_len();
        let num_pieces = metainfo.num_pieces();
        let piece_len = metainfo.piece_len();
        let last_piece_len = (total_len - (piece_len as u64 * (num_pieces as u64 - 1))) as usize;
        let output_dir = if metainfo.is_multi_file() {
            output_dir.join(metainfo.name())
        } else {
            output_dir
        };

        Self {
            total_len,
            piece_len,
            last_piece_len,
            num_pieces,
            files: metainfo.files(),
            output_dir,
        }
    }

    // Returns length of piece given its index.
    pub fn piece_length(&self, idx: usize) -> usize {
        if idx == self.num_pieces - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    pub fn piece_offset(&self, idx: usize) -> u64 {
        idx as u64 * self.piece_len as u64
    }

    pub fn piece_range(&self, idx: usize) -> Range<u64> {
        let offset = self.piece_offset(idx);
        offset..offset + self.piece_length(idx) as u64
    }

    // Index of the piece containing the given torrent byte offset.
    pub fn piece_at(&self, offset: u64) -> Option<usize> {
        if offset >= self.total_len {
            return None;
        }
        Some((offset / self.piece_len as u64) as usize)
    }

    // Pieces overlapping a byte range of the torrent.
    pub fn pieces_in(&self, range: Range<u64>) -> Range<usize> {
        let end = range.end.min(self.total_len);
        if range.start >= end {
            return 0..0;
        }
        let first = (range.start / self.piece_len as u64) as usize;
        let last = ((end - 1) / self.piece_len as u64) as usize;
        first..last + 1
    }

    // Pieces overlapping the file with the given index.
    pub fn file_pieces(&self, file_idx: usize) -> Range<usize> {
        self.files
            .get(file_idx)
            .map(|f| self.pieces_in(f.byte_range()))
            .unwrap_or(0..0)
    }

    // Returns the indexes of the first and last file that a piece intersects.
    pub fn piece_file_intersections(&self, piece_idx: usize) -> Range<usize> {
        debug_assert!(piece_idx < self.num_pieces, "piece index out of bounds");
        let range = self.piece_range(piece_idx);
        let mut first = None;
        let mut last = 0;
        for (i, file) in self.files.iter().enumerate() {
            let bytes = file.byte_range();
            if bytes.start < range.end && range.start < bytes.end {
                first.get_or_insert(i);
                last = i;
            }
        }
        match first {
            Some(first) => first..last + 1,
            None => 0..0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::test_metainfo_multi;

    fn info() -> StoreInfo {
        // Files of 10, 30000 and 20000 bytes with 16KiB pieces.
        let metainfo = test_metainfo_multi(&[10, 30_000, 20_000], 16_384);
        StoreInfo::new(&metainfo, PathBuf::from("downloads"))
    }

    #[test]
    fn test_piece_geometry() {
        let info = info();
        assert_eq!(info.total_len, 50_010);
        assert_eq!(info.num_pieces, 4);
        assert_eq!(info.piece_length(0), 16_384);
        assert_eq!(info.piece_length(3), 50_010 - 3 * 16_384);
        assert_eq!(info.piece_range(1), 16_384..32_768);
        assert_eq!(info.piece_at(16_383), Some(0));
        assert_eq!(info.piece_at(16_384), Some(1));
        assert_eq!(info.piece_at(50_010), None);
        assert!(info.output_dir.ends_with("test"));
    }

    #[test]
    fn test_piece_file_intersections() {
        let info = info();
        assert_eq!(info.piece_file_intersections(0), 0..2);
        assert_eq!(info.piece_file_intersections(1), 1..3);
        assert_eq!(info.piece_file_intersections(3), 2..3);
    }

    #[test]
    fn test_file_pieces() {
        let info = info();
        assert_eq!(info.file_pieces(0), 0..1);
        assert_eq!(info.file_pieces(1), 0..2);
        assert_eq!(info.file_pieces(2), 1..4);
        assert_eq!(info.file_pieces(3), 0..0);
        assert_eq!(info.pieces_in(0..0), 0..0);
    }
}
