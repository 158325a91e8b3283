//! Split-Brain Resolution
//!
//! Two peers can both believe they are host, for example when they create
//! the same room at the same moment or when a partition heals. Each host
//! evaluates every foreign snapshot with the same pure rule, so both sides
//! reach the same verdict without exchanging anything else.

use std::cmp::Ordering;

use crate::game::state::{GameState, SessionId};

/// Verdict for the local host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Keep authority and re-assert our state.
    Retain,
    /// Step down and adopt the foreign snapshot.
    Yield,
}

/// Decide between the local state and a foreign host's snapshot.
///
/// More claimed players wins. On a tie the lexicographically lower session
/// id wins.
pub fn resolve(
    local: &GameState,
    local_id: &SessionId,
    foreign: &GameState,
    foreign_id: &SessionId,
) -> Resolution {
    match foreign.claimed_count().cmp(&local.claimed_count()) {
        Ordering::Greater => Resolution::Yield,
        Ordering::Less => Resolution::Retain,
        Ordering::Equal => {
            if foreign_id < local_id {
                Resolution::Yield
            } else {
                Resolution::Retain
            }
        }
    }
}

/// Version the winner re-publishes under, so that followers who already
/// accepted the loser's (possibly higher) version still take it.
pub fn reassert_version(local: &GameState, foreign: &GameState) -> u64 {
    local.version.max(foreign.version) + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rng::DeterministicRng;

    fn sid(s: &str) -> SessionId {
        SessionId::new(s)
    }

    fn hosted_by(host: &str, others: &[&str]) -> GameState {
        let mut state = GameState::create_for_host(host, &sid(host), DeterministicRng::new(1), 0);
        for (i, name) in others.iter().enumerate() {
            state.players[i + 1].claim(name, &sid(name), 0);
        }
        state
    }

    #[test]
    fn test_more_players_wins() {
        let a = hosted_by("sid_z", &["x", "y"]);
        let b = hosted_by("sid_a", &["w"]);

        assert_eq!(resolve(&a, &sid("sid_z"), &b, &sid("sid_a")), Resolution::Retain);
        assert_eq!(resolve(&b, &sid("sid_a"), &a, &sid("sid_z")), Resolution::Yield);
    }

    #[test]
    fn test_tie_lower_id_wins() {
        let a = hosted_by("sid_a", &["x"]);
        let b = hosted_by("sid_b", &["y"]);

        assert_eq!(resolve(&a, &sid("sid_a"), &b, &sid("sid_b")), Resolution::Retain);
        assert_eq!(resolve(&b, &sid("sid_b"), &a, &sid("sid_a")), Resolution::Yield);
    }

    #[test]
    fn test_verdicts_are_complementary() {
        let cases = [
            (hosted_by("sid_1", &[]), hosted_by("sid_2", &[])),
            (hosted_by("sid_9", &["p", "q"]), hosted_by("sid_0", &["r"])),
            (hosted_by("sid_5", &["p"]), hosted_by("sid_4", &["r", "s", "t"])),
        ];

        for (a, b) in cases {
            let a_id = a.host_session().cloned().unwrap();
            let b_id = b.host_session().cloned().unwrap();
            let from_a = resolve(&a, &a_id, &b, &b_id);
            let from_b = resolve(&b, &b_id, &a, &a_id);
            assert_ne!(from_a, from_b, "exactly one side must yield");
        }
    }

    #[test]
    fn test_reassert_version() {
        let mut a = hosted_by("sid_a", &[]);
        let mut b = hosted_by("sid_b", &[]);
        a.version = 3;
        b.version = 8;
        assert_eq!(reassert_version(&a, &b), 9);
        assert_eq!(reassert_version(&b, &a), 9);
    }
}
