use std::time::Instant;
use crate::stats::ThroughputStats;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum ConnState {
    #[default]
    Connecting,
    Handshaking,
    // Connected with no interest either way.
    Idle,
    // Connected with interest on at least one side.
    Active,
    Closed,
}

impl ConnState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnState::Idle | ConnState::Active)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionState {

    pub conn_state: ConnState,

    // Whether we are refusing the peer's requests.
    pub choked: bool,

    // Whether we want pieces the peer has.
    pub interested: bool,

    // Whether the peer is refusing our requests.
    pub peer_choking: bool,

    pub peer_interested: bool,

    pub throughput: ThroughputStats,

    // Number of pieces the peer has.
    pub num_pieces: usize,

    pub connect_time: Option<Instant>,

    // Set when neither side became interested, cleared on interest.
    pub idle_since: Option<Instant>,

    pub changed: bool,

}

impl Default for SessionState {
    fn default() -> SessionState {
        SessionState {
            conn_state: ConnState::default(),
            choked: true,
            interested: false,
            peer_choking: true,
            peer_interested: false,
            throughput: ThroughputStats::default(),
            num_pieces: 0,
            connect_time: None,
            idle_since: None,
            changed: false,
        }
    }
}

impl SessionState {

    pub fn tick(&mut self) {
        self.throughput.reset();
        self.changed = false;
    }

    #[inline(always)]
    pub fn update(&mut self, f: impl FnOnce(&mut SessionState)) {
        f(self);
        self.changed = true;
    }

    // Moves between idle and active after interest changes.
    pub fn refresh_activity(&mut self, now: Instant) {
        if !self.conn_state.is_connected() {
            return;
        }
        let active = self.interested || self.peer_interested;
        let conn_state = if active { ConnState::Active } else { ConnState::Idle };
        if conn_state != self.conn_state {
            self.update(|s| s.conn_state = conn_state);
        }
        match (active, self.idle_since) {
            (true, _) => self.idle_since = None,
            (false, None) => self.idle_since = Some(now),
            (false, Some(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_transitions() {
        let now = Instant::now();
        let mut state = SessionState::default();
        state.refresh_activity(now);
        assert_eq!(state.conn_state, ConnState::Connecting);

        state.conn_state = ConnState::Idle;
        state.refresh_activity(now);
        assert_eq!(state.idle_since, Some(now));

        state.interested = true;
        state.refresh_activity(now);
        assert_eq!(state.conn_state, ConnState::Active);
        assert!(state.idle_since.is_none());
        assert!(state.changed);
    }
}
