//! Presence Tracking
//!
//! Only the host classifies players. Everyone else learns statuses from
//! published snapshots. Followers do run one check of their own: the host
//! watchdog, which notices when the host itself has gone quiet.

use std::time::Duration;

use crate::game::state::{GameState, PlayerStatus, SessionId};

/// Silence thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceThresholds {
    /// Silence after which a player is `Away`.
    pub away_after: Duration,
    /// Silence after which a player is `Disconnected`.
    pub disconnected_after: Duration,
}

impl Default for PresenceThresholds {
    fn default() -> Self {
        Self {
            away_after: Duration::from_secs(20),
            disconnected_after: Duration::from_secs(90),
        }
    }
}

impl PresenceThresholds {
    /// Classify a player last heard from at `last_seen_ms`.
    pub fn classify(&self, last_seen_ms: u64, now_ms: u64) -> PlayerStatus {
        let silent = now_ms.saturating_sub(last_seen_ms);
        if silent > self.disconnected_after.as_millis() as u64 {
            PlayerStatus::Disconnected
        } else if silent > self.away_after.as_millis() as u64 {
            PlayerStatus::Away
        } else {
            PlayerStatus::Online
        }
    }
}

/// One classification change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    /// Slot.
    pub slot: usize,
    /// Previous status.
    pub from: PlayerStatus,
    /// New status.
    pub to: PlayerStatus,
}

/// What a sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Status transitions, by slot.
    pub changes: Vec<StatusChange>,
    /// Set when the host slot was reassigned: (old, new).
    pub host_change: Option<(Option<usize>, Option<usize>)>,
}

impl SweepReport {
    /// Nothing changed; no publish needed.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.host_change.is_none()
    }
}

/// Host-side presence bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct PresenceTracker {
    thresholds: PresenceThresholds,
}

impl PresenceTracker {
    /// Create a tracker.
    pub fn new(thresholds: PresenceThresholds) -> Self {
        Self { thresholds }
    }

    /// The configured thresholds.
    pub fn thresholds(&self) -> &PresenceThresholds {
        &self.thresholds
    }

    /// Reclassify every claimed player and reassign the host if its slot
    /// is no longer valid.
    pub fn sweep(&self, state: &mut GameState, now_ms: u64) -> SweepReport {
        let mut report = SweepReport::default();

        for player in state.players.iter_mut().filter(|p| p.is_claimed) {
            let status = self.thresholds.classify(player.last_seen_ms, now_ms);
            if status != player.status {
                report.changes.push(StatusChange { slot: player.id, from: player.status, to: status });
                player.status = status;
            }
        }

        if !state.host_is_valid() {
            let old = state.host_id;
            let new = state.find_next_host();
            if new != old {
                state.host_id = new;
                report.host_change = Some((old, new));
            }
        }

        report
    }

    /// Statuses of every slot, for detecting heartbeat-driven changes.
    pub fn statuses(state: &GameState) -> Vec<PlayerStatus> {
        state.players.iter().map(|p| p.status).collect()
    }

    /// Has the host been silent long enough that `identity` should take over?
    ///
    /// Eligible followers are ranked by slot; rank `k` waits an extra
    /// `k * away_after` so a dead first candidate does not stall failover.
    pub fn should_take_over(
        &self,
        state: &GameState,
        identity: &SessionId,
        last_host_contact_ms: u64,
        now_ms: u64,
    ) -> bool {
        let Some(rank) = failover_rank(state, identity) else {
            return false;
        };
        let wait = self.thresholds.disconnected_after + self.thresholds.away_after * rank as u32;
        now_ms.saturating_sub(last_host_contact_ms) > wait.as_millis() as u64
    }
}

/// Position of `identity` among the slots eligible to replace the host:
/// claimed, online or away, and not the host slot itself.
pub fn failover_rank(state: &GameState, identity: &SessionId) -> Option<usize> {
    state
        .players
        .iter()
        .filter(|p| p.is_reachable() && Some(p.id) != state.host_id)
        .position(|p| p.owned_by(identity))
}

/// Make `slot` the host, marking the silent previous host disconnected.
///
/// The old host never published heartbeat timestamps, so every other
/// reachable player starts a fresh silence window at `now_ms`.
pub fn take_over(state: &mut GameState, slot: usize, now_ms: u64) {
    let old_host = state.host_id;
    for player in state.players.iter_mut().filter(|p| p.is_claimed) {
        if Some(player.id) == old_host {
            player.status = PlayerStatus::Disconnected;
        } else if player.status != PlayerStatus::Disconnected {
            player.last_seen_ms = now_ms;
        }
    }
    if let Some(player) = state.players.get_mut(slot) {
        player.status = PlayerStatus::Online;
        player.last_seen_ms = now_ms;
    }
    state.host_id = Some(slot);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rng::DeterministicRng;

    fn sid(i: usize) -> SessionId {
        SessionId::new(format!("sid_{}", i))
    }

    fn room(n: usize) -> GameState {
        let mut state = GameState::new(DeterministicRng::new(1));
        for i in 0..n {
            state.players[i].claim(&format!("P{}", i), &sid(i), 0);
        }
        state.host_id = Some(0);
        state
    }

    #[test]
    fn test_classify() {
        let t = PresenceThresholds::default();
        assert_eq!(t.classify(0, 20_000), PlayerStatus::Online);
        assert_eq!(t.classify(0, 20_001), PlayerStatus::Away);
        assert_eq!(t.classify(0, 90_000), PlayerStatus::Away);
        assert_eq!(t.classify(0, 90_001), PlayerStatus::Disconnected);
        // Clock skew never underflows.
        assert_eq!(t.classify(5_000, 1_000), PlayerStatus::Online);
    }

    #[test]
    fn test_sweep_reports_only_changes() {
        let tracker = PresenceTracker::default();
        let mut state = room(3);
        state.players[0].last_seen_ms = 30_000;
        state.players[1].last_seen_ms = 30_000;

        let report = tracker.sweep(&mut state, 40_000);
        assert_eq!(report.changes.len(), 1);
        assert_eq!(report.changes[0], StatusChange { slot: 2, from: PlayerStatus::Online, to: PlayerStatus::Away });

        let again = tracker.sweep(&mut state, 40_000);
        assert!(again.is_empty());
    }

    #[test]
    fn test_sweep_ignores_free_slots() {
        let tracker = PresenceTracker::default();
        let mut state = room(1);
        state.players[0].last_seen_ms = 100_000;

        assert!(tracker.sweep(&mut state, 100_000).is_empty());
        assert_eq!(state.players[3].status, PlayerStatus::Unclaimed);
    }

    #[test]
    fn test_sweep_promotes_next_host() {
        let tracker = PresenceTracker::default();
        let mut state = room(3);
        state.players[1].last_seen_ms = 95_000;
        state.players[2].last_seen_ms = 95_000;

        let report = tracker.sweep(&mut state, 100_000);
        assert_eq!(state.players[0].status, PlayerStatus::Disconnected);
        assert_eq!(state.host_id, Some(1));
        assert_eq!(report.host_change, Some((Some(0), Some(1))));
    }

    #[test]
    fn test_failover_rank() {
        let mut state = room(4);
        state.players[1].status = PlayerStatus::Disconnected;

        assert_eq!(failover_rank(&state, &sid(0)), None);
        assert_eq!(failover_rank(&state, &sid(1)), None);
        assert_eq!(failover_rank(&state, &sid(2)), Some(0));
        assert_eq!(failover_rank(&state, &sid(3)), Some(1));
    }

    #[test]
    fn test_should_take_over_staggers_candidates() {
        let tracker = PresenceTracker::default();
        let state = room(3);

        assert!(!tracker.should_take_over(&state, &sid(1), 0, 90_000));
        assert!(tracker.should_take_over(&state, &sid(1), 0, 90_001));
        assert!(!tracker.should_take_over(&state, &sid(2), 0, 90_001));
        assert!(tracker.should_take_over(&state, &sid(2), 0, 110_001));
    }

    #[test]
    fn test_take_over() {
        let mut state = room(3);
        take_over(&mut state, 2, 500);

        assert_eq!(state.host_id, Some(2));
        assert_eq!(state.players[0].status, PlayerStatus::Disconnected);
        assert_eq!(state.players[2].last_seen_ms, 500);
        assert!(state.is_host(&sid(2)));
    }

    #[test]
    fn test_take_over_restarts_silence_windows() {
        let tracker = PresenceTracker::default();
        let mut state = room(4);
        state.players[3].status = PlayerStatus::Disconnected;

        take_over(&mut state, 1, 91_000);
        assert_eq!(state.players[0].last_seen_ms, 0);
        assert_eq!(state.players[2].last_seen_ms, 91_000);
        assert_eq!(state.players[3].last_seen_ms, 0);

        tracker.sweep(&mut state, 95_000);
        assert_eq!(state.players[0].status, PlayerStatus::Disconnected);
        assert_eq!(state.players[2].status, PlayerStatus::Online);
        assert_eq!(state.players[3].status, PlayerStatus::Disconnected);
    }
}
