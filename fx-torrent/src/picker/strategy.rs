use std::cmp::Reverse;
use crate::pieces::Priority;

// How new pieces are chosen. Higher priority always comes first.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    // Then fewest peers having the piece, then lowest index.
    #[default]
    RarestFirst = 0,
    // Then lowest index, used while streaming.
    Sequential = 1,
}

impl From<u8> for Strategy {
    fn from(v: u8) -> Self {
        match v {
            1 => Strategy::Sequential,
            _ => Strategy::RarestFirst,
        }
    }
}

impl Strategy {

    // Orders candidate pieces, best first.
    pub fn sort(self, candidates: &mut [usize], priorities: &[Priority], availability: &[u32]) {
        let priority = |idx: usize| priorities.get(idx).copied().unwrap_or(Priority::None);
        match self {
            Strategy::RarestFirst => candidates.sort_unstable_by_key(|&idx| {
                (Reverse(priority(idx)), availability.get(idx).copied().unwrap_or(0), idx)
            }),
            Strategy::Sequential => candidates.sort_unstable_by_key(|&idx| (Reverse(priority(idx)), idx)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rarest_first() {
        let priorities = [Priority::Normal; 5];
        let availability = [3, 1, 2, 1, 5];
        let mut candidates = vec![0, 1, 2, 3, 4];
        Strategy::RarestFirst.sort(&mut candidates, &priorities, &availability);
        assert_eq!(candidates, vec![1, 3, 2, 0, 4]);
    }

    #[test]
    fn test_sequential_respects_priority() {
        let mut priorities = [Priority::Normal; 6];
        priorities[4] = Priority::Now;
        priorities[5] = Priority::Next;
        let availability = [9, 9, 1, 1, 1, 1];
        let mut candidates = vec![0, 1, 2, 3, 4, 5];
        Strategy::Sequential.sort(&mut candidates, &priorities, &availability);
        assert_eq!(candidates, vec![4, 5, 0, 1, 2, 3]);
    }
}
