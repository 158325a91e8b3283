//! Player Actions
//!
//! The closed set of intents a peer can express. Actions travel over the
//! wire as `{ "type": "...", "payload": { ... } }` and are applied by the
//! rules engine on the authoritative peer.

use serde::{Serialize, Deserialize};

use crate::game::state::SessionId;

/// Every action the rules engine understands.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Action {
    /// Throw the dice not yet kept this turn.
    RollDice,
    /// Select or deselect one die on the board.
    ToggleSelection {
        /// Board index.
        index: usize,
    },
    /// Keep the current selection.
    KeepDice,
    /// End the turn and record the accumulated score.
    BankScore,
    /// Host starts the game from the lobby.
    StartGame,
    /// Host resets scores and returns to the lobby.
    NewGame,
    /// Skip the turn of a player who is not online.
    SkipTurn,
    /// Enter the room as player or spectator.
    PlayerJoin {
        /// Display name.
        name: String,
        /// Joining peer.
        session_id: SessionId,
        /// Watch instead of play.
        #[serde(default)]
        as_spectator: bool,
    },
    /// Leave the room.
    PlayerLeave {
        /// Leaving peer.
        session_id: SessionId,
    },
    /// Host removes a player (they stay as a spectator).
    KickPlayer {
        /// Slot to free.
        slot: usize,
    },
    /// Host answers a mid-game join request.
    ResolveJoinRequest {
        /// Requesting peer.
        session_id: SessionId,
        /// Seat them (true) or make them a spectator (false).
        accepted: bool,
    },
    /// Liveness signal from a claimed player.
    PresenceHeartbeat {
        /// Announcing peer.
        session_id: SessionId,
    },
}

impl Action {
    /// Wire `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::RollDice => "roll_dice",
            Action::ToggleSelection { .. } => "toggle_selection",
            Action::KeepDice => "keep_dice",
            Action::BankScore => "bank_score",
            Action::StartGame => "start_game",
            Action::NewGame => "new_game",
            Action::SkipTurn => "skip_turn",
            Action::PlayerJoin { .. } => "player_join",
            Action::PlayerLeave { .. } => "player_leave",
            Action::KickPlayer { .. } => "kick_player",
            Action::ResolveJoinRequest { .. } => "resolve_join_request",
            Action::PresenceHeartbeat { .. } => "presence_heartbeat",
        }
    }

    /// All wire tags, used by the codec to tell actions from control messages.
    pub const KINDS: [&'static str; 12] = [
        "roll_dice",
        "toggle_selection",
        "keep_dice",
        "bank_score",
        "start_game",
        "new_game",
        "skip_turn",
        "player_join",
        "player_leave",
        "kick_player",
        "resolve_join_request",
        "presence_heartbeat",
    ];

    /// Only the player whose turn it is may send this.
    pub fn is_turn_action(&self) -> bool {
        matches!(
            self,
            Action::RollDice | Action::ToggleSelection { .. } | Action::KeepDice | Action::BankScore
        )
    }

    /// Only the host may send this.
    pub fn is_host_only(&self) -> bool {
        matches!(
            self,
            Action::StartGame | Action::NewGame | Action::KickPlayer { .. } | Action::ResolveJoinRequest { .. }
        )
    }
}

/// Who sent an action, and when the authoritative peer received it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Origin {
    /// Sending peer.
    pub sender: SessionId,
    /// Receiver's wall clock (ms).
    pub at_ms: u64,
}

impl Origin {
    /// Create an origin.
    pub fn new(sender: SessionId, at_ms: u64) -> Self {
        Self { sender, at_ms }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let json = serde_json::to_value(Action::ToggleSelection { index: 3 }).unwrap();
        assert_eq!(json["type"], "toggle_selection");
        assert_eq!(json["payload"]["index"], 3);

        let json = serde_json::to_value(Action::RollDice).unwrap();
        assert_eq!(json["type"], "roll_dice");
    }

    #[test]
    fn test_kind_matches_serde_tag() {
        let actions = vec![
            Action::RollDice,
            Action::ToggleSelection { index: 0 },
            Action::KeepDice,
            Action::BankScore,
            Action::StartGame,
            Action::NewGame,
            Action::SkipTurn,
            Action::PlayerJoin { name: "A".into(), session_id: SessionId::new("s"), as_spectator: false },
            Action::PlayerLeave { session_id: SessionId::new("s") },
            Action::KickPlayer { slot: 1 },
            Action::ResolveJoinRequest { session_id: SessionId::new("s"), accepted: true },
            Action::PresenceHeartbeat { session_id: SessionId::new("s") },
        ];

        for action in actions {
            let json = serde_json::to_value(&action).unwrap();
            assert_eq!(json["type"], action.kind());
            assert!(Action::KINDS.contains(&action.kind()));
        }
    }

    #[test]
    fn test_join_defaults_to_player() {
        let action: Action = serde_json::from_str(
            r#"{"type":"player_join","payload":{"name":"Ivan","session_id":"sid_1"}}"#,
        ).unwrap();

        assert_eq!(
            action,
            Action::PlayerJoin { name: "Ivan".into(), session_id: SessionId::new("sid_1"), as_spectator: false }
        );
    }

    #[test]
    fn test_permission_classes() {
        assert!(Action::BankScore.is_turn_action());
        assert!(!Action::BankScore.is_host_only());
        assert!(Action::KickPlayer { slot: 2 }.is_host_only());
        assert!(!Action::SkipTurn.is_turn_action());
    }
}
