//! Game Logic Module
//!
//! Rules of Тысяча (Tysiacha). 100% deterministic: no I/O, no clocks, no
//! ambient randomness.
//!
//! ## Module Structure
//!
//! - `dice`: Scoring analysis and selection validation
//! - `state`: Room state, player slots, spectators
//! - `action`: The closed set of player intents
//! - `rules`: `apply(state, action, origin)`

pub mod dice;
pub mod state;
pub mod action;
pub mod rules;

// Re-export key types
pub use dice::{analyze, validate, DiceAnalysis, ScoringGroup, Validation};
pub use state::{
    Barrel, GameState, JoinRequest, Player, PlayerStatus, ScoreEntry, SessionId, Spectator, TurnPhase,
};
pub use action::{Action, Origin};
pub use rules::{apply, apply_mut};
