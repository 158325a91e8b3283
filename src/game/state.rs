//! Game State Definitions
//!
//! The replicated room state. One `GameState` exists per room; it is
//! published wholesale by the host and replaced wholesale by every other
//! peer. Player slots are never removed, only recycled, so slot indices stay
//! stable for the lifetime of the room.

use std::collections::BTreeMap;
use std::fmt;
use serde::{Serialize, Deserialize};

use crate::core::rng::DeterministicRng;
use crate::core::hash::{StateHash, StateHasher, compute_state_hash, to_hex};
use crate::MAX_PLAYERS;

// =============================================================================
// SESSION ID
// =============================================================================

/// Opaque per-peer identity, persisted across reloads.
///
/// Ordering is plain lexicographic string ordering; the conflict resolver
/// relies on that.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh identifier.
    pub fn generate() -> Self {
        Self(format!("sid_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Borrow as str.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// PLAYER
// =============================================================================

/// Connectivity classification of a player slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerStatus {
    /// Heard from recently.
    Online,
    /// Silent past the away threshold.
    Away,
    /// Silent past the disconnect threshold.
    Disconnected,
    /// Slot has no owner.
    #[default]
    Unclaimed,
}

/// One entry of a player's score sheet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreEntry {
    /// Signed score change (banked turn, penalty, or correction).
    Points(i32),
    /// Scoreless turn.
    Bolt,
}

impl ScoreEntry {
    /// Points contributed to the total.
    pub fn points(self) -> i32 {
        match self {
            ScoreEntry::Points(p) => p,
            ScoreEntry::Bolt => 0,
        }
    }
}

/// A score band a player must climb out of in one turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Barrel {
    /// [200, 300)
    Lower,
    /// [700, 800)
    Upper,
}

impl Barrel {
    /// Band containing `total`, if any.
    pub fn of_total(total: i32) -> Option<Barrel> {
        if (200..300).contains(&total) {
            Some(Barrel::Lower)
        } else if (700..800).contains(&total) {
            Some(Barrel::Upper)
        } else {
            None
        }
    }

    /// Total the player must reach to leave the band.
    pub fn target(self) -> i32 {
        match self {
            Barrel::Lower => 300,
            Barrel::Upper => 800,
        }
    }

    /// Total a player is pushed back to on correction or knock-off.
    pub fn safe_total(self) -> i32 {
        match self {
            Barrel::Lower => 150,
            Barrel::Upper => 650,
        }
    }
}

/// State of a single player slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    /// Slot index (0-4), stable for the room lifetime.
    pub id: usize,
    /// Slot has an owner.
    pub is_claimed: bool,
    /// Display name.
    pub name: String,
    /// Owning peer.
    pub session_id: Option<SessionId>,
    /// Connectivity.
    pub status: PlayerStatus,
    /// Append-only score sheet (cleared by a new game).
    pub scores: Vec<ScoreEntry>,
    /// Has banked at least the entry minimum once.
    pub has_entered_game: bool,
    /// Consecutive bolts while on a barrel.
    pub barrel_bolts: u8,
    /// Pulled off a barrel by the three-bolt correction; protected from
    /// the overtake penalty until the end of their next turn.
    pub just_reset_from_barrel: bool,
    /// Host wall-clock of the last heartbeat (ms).
    pub last_seen_ms: u64,
}

impl Player {
    /// A free slot.
    pub fn unclaimed(id: usize) -> Self {
        Self {
            id,
            is_claimed: false,
            name: format!("Player {}", id + 1),
            session_id: None,
            status: PlayerStatus::Unclaimed,
            scores: Vec::new(),
            has_entered_game: false,
            barrel_bolts: 0,
            just_reset_from_barrel: false,
            last_seen_ms: 0,
        }
    }

    /// Claim this slot for a session.
    pub fn claim(&mut self, name: &str, session: &SessionId, now_ms: u64) {
        self.is_claimed = true;
        self.name = name.to_string();
        self.session_id = Some(session.clone());
        self.status = PlayerStatus::Online;
        self.last_seen_ms = now_ms;
    }

    /// Sum of all recorded points.
    pub fn total_score(&self) -> i32 {
        self.scores.iter().map(|s| s.points()).sum()
    }

    /// Barrel band the player currently sits in.
    pub fn barrel(&self) -> Option<Barrel> {
        Barrel::of_total(self.total_score())
    }

    /// Is this slot owned by `session`?
    pub fn owned_by(&self, session: &SessionId) -> bool {
        self.is_claimed && self.session_id.as_ref() == Some(session)
    }

    /// Online or away; eligible for host promotion.
    pub fn is_reachable(&self) -> bool {
        self.is_claimed && matches!(self.status, PlayerStatus::Online | PlayerStatus::Away)
    }

    fn hash_into(&self, hasher: &mut StateHasher) {
        hasher.update_u32(self.id as u32);
        hasher.update_bool(self.is_claimed);
        hasher.update_str(&self.name);
        hasher.update_str(self.session_id.as_ref().map(|s| s.as_str()).unwrap_or(""));
        hasher.update_u8(self.status as u8);
        hasher.update_u32(self.scores.len() as u32);
        for entry in &self.scores {
            match entry {
                ScoreEntry::Points(p) => {
                    hasher.update_u8(0);
                    hasher.update_i32(*p);
                }
                ScoreEntry::Bolt => hasher.update_u8(1),
            }
        }
        hasher.update_bool(self.has_entered_game);
        hasher.update_u8(self.barrel_bolts);
        hasher.update_bool(self.just_reset_from_barrel);
        hasher.update_u64(self.last_seen_ms);
    }
}

/// A watcher without a slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spectator {
    /// Display name.
    pub name: String,
    /// Owning peer.
    pub session_id: SessionId,
}

/// A request to join a game already in progress.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Display name.
    pub name: String,
    /// Requesting peer.
    pub session_id: SessionId,
    /// Host wall-clock of the request (ms).
    pub requested_at_ms: u64,
}

// =============================================================================
// TURN PHASE
// =============================================================================

/// Where the active turn stands, derived from the control flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnPhase {
    /// Game not started yet.
    Lobby,
    /// Only a roll is possible.
    AwaitingRoll,
    /// Dice are on the board; keep or bank.
    AwaitingSelection,
    /// Dice were kept; roll again or bank.
    AwaitingRollOrBank,
    /// Someone won or the table emptied.
    GameOver,
}

// =============================================================================
// GAME STATE
// =============================================================================

/// Complete replicated state of a room.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameState {
    /// Always `MAX_PLAYERS` slots.
    pub players: Vec<Player>,
    /// Watchers.
    pub spectators: Vec<Spectator>,
    /// Rejoin ledger: departed player name -> banked total.
    pub leavers: BTreeMap<String, i32>,
    /// Strictly increases on every accepted publish.
    pub version: u64,
    /// Slot of the authoritative peer.
    pub host_id: Option<usize>,

    /// Dice currently on the board.
    pub dice_on_board: Vec<u8>,
    /// Board indices tentatively selected.
    pub selected_dice_indices: Vec<usize>,
    /// Dice already kept from the current roll.
    pub dice_kept_from_this_roll: Vec<u8>,
    /// Dice kept across all rolls this turn.
    pub kept_dice_this_turn: Vec<u8>,
    /// Turn score before the current roll.
    pub score_from_previous_rolls: i32,
    /// Accumulated turn score.
    pub current_turn_score: i32,
    /// Score of the pending selection.
    pub potential_score: i32,

    /// A roll is permitted.
    pub can_roll: bool,
    /// Banking is permitted.
    pub can_bank: bool,
    /// The selection can be kept.
    pub can_keep: bool,
    /// Game has started.
    pub is_game_started: bool,
    /// Game has ended.
    pub is_game_over: bool,

    /// Slot whose turn it is.
    pub current_player_index: usize,
    /// Human-readable status line.
    pub game_message: String,
    /// Pending mid-game join requests.
    pub join_requests: Vec<JoinRequest>,
    /// Host wall-clock when the current turn began (ms).
    pub turn_started_at_ms: u64,

    /// Dice stream, replicated so any host continues it.
    pub rng: DeterministicRng,
}

impl GameState {
    /// Create an empty room.
    pub fn new(rng: DeterministicRng) -> Self {
        Self {
            players: (0..MAX_PLAYERS).map(Player::unclaimed).collect(),
            spectators: Vec::new(),
            leavers: BTreeMap::new(),
            version: 0,
            host_id: None,
            dice_on_board: Vec::new(),
            selected_dice_indices: Vec::new(),
            dice_kept_from_this_roll: Vec::new(),
            kept_dice_this_turn: Vec::new(),
            score_from_previous_rolls: 0,
            current_turn_score: 0,
            potential_score: 0,
            can_roll: false,
            can_bank: false,
            can_keep: false,
            is_game_started: false,
            is_game_over: false,
            current_player_index: 0,
            game_message: String::new(),
            join_requests: Vec::new(),
            turn_started_at_ms: 0,
            rng,
        }
    }

    /// Create a room owned by its first player, who is host.
    pub fn create_for_host(name: &str, session: &SessionId, rng: DeterministicRng, now_ms: u64) -> Self {
        let mut state = Self::new(rng);
        state.players[0].claim(name, session, now_ms);
        state.host_id = Some(0);
        state.current_player_index = 0;
        state.turn_started_at_ms = now_ms;
        state.game_message = format!("{} created the game. Waiting for players...", name);
        state
    }

    /// Get a slot.
    pub fn player(&self, slot: usize) -> Option<&Player> {
        self.players.get(slot)
    }

    /// Player whose turn it is.
    pub fn current_player(&self) -> Option<&Player> {
        self.players.get(self.current_player_index)
    }

    /// Slot owned by `session`.
    pub fn slot_of(&self, session: &SessionId) -> Option<usize> {
        self.players.iter().position(|p| p.owned_by(session))
    }

    /// Is `session` watching?
    pub fn is_spectator(&self, session: &SessionId) -> bool {
        self.spectators.iter().any(|s| &s.session_id == session)
    }

    /// Number of claimed slots.
    pub fn claimed_count(&self) -> usize {
        self.players.iter().filter(|p| p.is_claimed).count()
    }

    /// Is `session` the owner of the host slot?
    pub fn is_host(&self, session: &SessionId) -> bool {
        self.host_id
            .and_then(|h| self.players.get(h))
            .is_some_and(|p| p.owned_by(session))
    }

    /// Session owning the host slot.
    pub fn host_session(&self) -> Option<&SessionId> {
        self.host_id
            .and_then(|h| self.players.get(h))
            .filter(|p| p.is_claimed)
            .and_then(|p| p.session_id.as_ref())
    }

    /// Does `host_id` reference a claimed, non-disconnected slot?
    pub fn host_is_valid(&self) -> bool {
        self.host_id
            .and_then(|h| self.players.get(h))
            .is_some_and(|p| p.is_claimed && p.status != PlayerStatus::Disconnected)
    }

    /// Lowest-indexed claimed slot that is online or away.
    pub fn find_next_host(&self) -> Option<usize> {
        self.players.iter().position(|p| p.is_reachable())
    }

    /// Next claimed slot after `from`, wrapping; `from` if nobody else.
    pub fn next_active_player(&self, from: usize) -> usize {
        let n = self.players.len();
        if n == 0 {
            return from;
        }
        let mut idx = (from + 1) % n;
        for _ in 0..n {
            if idx == from {
                break;
            }
            if self.players[idx].is_claimed {
                return idx;
            }
            idx = (idx + 1) % n;
        }
        self.players
            .iter()
            .position(|p| p.is_claimed)
            .unwrap_or(from)
    }

    /// Derived turn phase.
    pub fn turn_phase(&self) -> TurnPhase {
        if self.is_game_over {
            TurnPhase::GameOver
        } else if !self.is_game_started {
            TurnPhase::Lobby
        } else if self.can_roll && self.can_bank {
            TurnPhase::AwaitingRollOrBank
        } else if self.can_roll {
            TurnPhase::AwaitingRoll
        } else {
            TurnPhase::AwaitingSelection
        }
    }

    /// Number of dice the next roll will throw.
    pub fn dice_to_roll(&self) -> usize {
        if self.kept_dice_this_turn.len() >= 5 {
            5
        } else {
            5 - self.kept_dice_this_turn.len()
        }
    }

    /// Clear all per-turn scratch fields.
    pub(crate) fn reset_turn(&mut self) {
        self.dice_on_board.clear();
        self.selected_dice_indices.clear();
        self.dice_kept_from_this_roll.clear();
        self.kept_dice_this_turn.clear();
        self.score_from_previous_rolls = 0;
        self.current_turn_score = 0;
        self.potential_score = 0;
        self.can_roll = false;
        self.can_bank = false;
        self.can_keep = false;
    }

    /// Compute the fingerprint carried by snapshots.
    pub fn compute_hash(&self) -> StateHash {
        compute_state_hash(self.version, |hasher| {
            for player in &self.players {
                player.hash_into(hasher);
            }

            hasher.update_u32(self.spectators.len() as u32);
            for spectator in &self.spectators {
                hasher.update_str(&spectator.name);
                hasher.update_str(spectator.session_id.as_str());
            }

            hasher.update_u32(self.leavers.len() as u32);
            for (name, score) in &self.leavers {
                hasher.update_str(name);
                hasher.update_i32(*score);
            }

            hasher.update_opt_index(self.host_id);

            hasher.update_u32(self.dice_on_board.len() as u32);
            hasher.update_bytes(&self.dice_on_board);
            hasher.update_u32(self.selected_dice_indices.len() as u32);
            for idx in &self.selected_dice_indices {
                hasher.update_u32(*idx as u32);
            }
            hasher.update_u32(self.dice_kept_from_this_roll.len() as u32);
            hasher.update_bytes(&self.dice_kept_from_this_roll);
            hasher.update_u32(self.kept_dice_this_turn.len() as u32);
            hasher.update_bytes(&self.kept_dice_this_turn);
            hasher.update_i32(self.score_from_previous_rolls);
            hasher.update_i32(self.current_turn_score);
            hasher.update_i32(self.potential_score);

            hasher.update_bool(self.can_roll);
            hasher.update_bool(self.can_bank);
            hasher.update_bool(self.can_keep);
            hasher.update_bool(self.is_game_started);
            hasher.update_bool(self.is_game_over);

            hasher.update_u32(self.current_player_index as u32);
            hasher.update_str(&self.game_message);

            hasher.update_u32(self.join_requests.len() as u32);
            for request in &self.join_requests {
                hasher.update_str(&request.name);
                hasher.update_str(request.session_id.as_str());
                hasher.update_u64(request.requested_at_ms);
            }
            hasher.update_u64(self.turn_started_at_ms);

            let [s0, s1] = self.rng.state();
            hasher.update_u64(s0);
            hasher.update_u64(s1);
        })
    }

    /// Hex fingerprint for the wire.
    pub fn fingerprint(&self) -> String {
        to_hex(&self.compute_hash())
    }
}

// =============================================================================
// TESTS
// =============================================================================
