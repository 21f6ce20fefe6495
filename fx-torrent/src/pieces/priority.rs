use std::{collections::HashMap, ops::Range};
use super::Priority;

// Pieces a stream is interested in, relative to its read cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamWindow {

    // Pieces of the streamed file.
    pub pieces: Range<usize>,

    // Piece holding the read cursor.
    pub cursor: usize,

    // Number of pieces from the cursor that are read ahead.
    pub window: usize,

    // Set once the stream has skipped ahead, pieces further than a window
    // behind the cursor are then no longer wanted by the stream.
    pub drop_behind: bool,

    // Pieces a blocked read is waiting on, wanted at once wherever they are.
    pub pending: Option<Range<usize>>,

}

impl StreamWindow {

    pub fn new(pieces: Range<usize>, cursor: usize, window: usize) -> Self {
        Self { pieces, cursor, window: window.max(1), drop_behind: false, pending: None }
    }

    // Priority the stream asks for, None when it has no opinion on the piece.
    fn priority_of(&self, idx: usize) -> Option<Priority> {
        if !self.pieces.contains(&idx) {
            return None;
        }
        if self.pending.as_ref().map_or(false, |p| p.contains(&idx)) {
            return Some(Priority::Now);
        }
        if idx >= self.cursor && idx < self.cursor + self.window {
            return Some(match idx - self.cursor {
                0 => Priority::Now,
                1 => Priority::Next,
                _ => Priority::Readahead,
            });
        }
        // The last piece is needed early by players reading the container index.
        if idx + 1 == self.pieces.end {
            return Some(Priority::High);
        }
        if self.drop_behind && idx + self.window < self.cursor {
            return Some(Priority::None);
        }
        None
    }
}

// Piece priorities as set by file priorities, with stream windows layered on top.
#[derive(Debug)]
pub struct Priorities {

    base: Vec<Priority>,

    windows: HashMap<u64, StreamWindow>,

    effective: Vec<Priority>,

    // Whether pieces a stream skipped past stay wanted at their base priority.
    keep_behind: bool,

}

impl Priorities {

    pub fn new(num_pieces: usize, keep_behind: bool) -> Self {
        Self {
            base: vec![Priority::Normal; num_pieces],
            windows: HashMap::new(),
            effective: vec![Priority::Normal; num_pieces],
            keep_behind,
        }
    }

    pub fn get(&self, idx: usize) -> Priority {
        self.effective.get(idx).copied().unwrap_or(Priority::None)
    }

    pub fn as_slice(&self) -> &[Priority] {
        &self.effective
    }

    pub fn has_streams(&self) -> bool {
        !self.windows.is_empty()
    }

    // Sets the base priority of a range of pieces, returns whether anything changed.
    pub fn set_base(&mut self, range: Range<usize>, priority: Priority) -> bool {
        let end = range.end.min(self.base.len());
        let start = range.start.min(end);
        let changed = self.base[start..end].iter().any(|p| *p != priority);
        self.base[start..end].fill(priority);
        if changed {
            self.recompute();
        }
        changed
    }

    pub fn set_window(&mut self, stream: u64, window: StreamWindow) -> bool {
        if self.windows.get(&stream) == Some(&window) {
            return false;
        }
        self.windows.insert(stream, window);
        self.recompute();
        true
    }

    pub fn window(&self, stream: u64) -> Option<&StreamWindow> {
        self.windows.get(&stream)
    }

    pub fn clear_window(&mut self, stream: u64) -> bool {
        if self.windows.remove(&stream).is_some() {
            self.recompute();
            true
        } else {
            false
        }
    }

    fn recompute(&mut self) {
        for (idx, effective) in self.effective.iter_mut().enumerate() {
            let mut priority = self.base[idx];
            let mut dropped = false;
            for window in self.windows.values() {
                match window.priority_of(idx) {
                    Some(Priority::None) => dropped = true,
                    Some(p) => priority = priority.max(p),
                    None => {}
                }
            }
            if dropped && !self.keep_behind && priority <= Priority::Normal {
                priority = Priority::None;
            }
            *effective = priority;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_priorities() {
        let mut p = Priorities::new(100, false);
        p.set_window(1, StreamWindow::new(0..100, 50, 8));
        assert_eq!(p.get(50), Priority::Now);
        assert_eq!(p.get(51), Priority::Next);
        assert_eq!(p.get(57), Priority::Readahead);
        assert_eq!(p.get(58), Priority::Normal);
        assert_eq!(p.get(99), Priority::High);
        assert!((1..50).all(|i| p.get(i) == Priority::Normal));

        assert!(p.clear_window(1));
        assert!(p.as_slice().iter().all(|p| *p == Priority::Normal));
    }

    #[test]
    fn test_skipped_pieces_dropped() {
        let mut p = Priorities::new(100, false);
        let mut window = StreamWindow::new(0..100, 60, 8);
        window.drop_behind = true;
        p.set_window(1, window.clone());
        assert_eq!(p.get(51), Priority::None);
        // Within one window of the cursor.
        assert_eq!(p.get(52), Priority::Normal);

        // Raised base priority is kept.
        p.set_base(10..11, Priority::High);
        assert_eq!(p.get(10), Priority::High);

        let mut keep = Priorities::new(100, true);
        keep.set_window(1, window.clone());
        assert_eq!(keep.get(51), Priority::Normal);

        // A read waiting behind the cursor wants its pieces again.
        window.pending = Some(10..12);
        assert!(p.set_window(1, window));
        assert_eq!(p.get(10), Priority::Now);
        assert_eq!(p.get(11), Priority::Now);
        assert_eq!(p.get(12), Priority::None);
    }

    #[test]
    fn test_stream_overrides_unwanted_file() {
        let mut p = Priorities::new(20, false);
        assert!(p.set_base(0..20, Priority::None));
        assert!(!p.set_base(0..20, Priority::None));
        p.set_window(3, StreamWindow::new(0..20, 0, 4));
        assert_eq!(p.get(0), Priority::Now);
        assert_eq!(p.get(3), Priority::Readahead);
        assert_eq!(p.get(4), Priority::None);
        assert_eq!(p.get(19), Priority::High);
    }
}
