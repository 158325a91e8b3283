//! # Tysiacha
//!
//! Replicated engine for Тысяча ("Thousand"), a turn-based dice game for
//! two to five players, played peer-to-peer over a pub/sub channel.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TYSIACHA                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Deterministic primitives                  │
//! │  ├── rng.rs      - Deterministic Xorshift128+ dice stream    │
//! │  └── hash.rs     - State fingerprints                        │
//! │                                                              │
//! │  game/           - Game logic (deterministic)                │
//! │  ├── dice.rs     - Scoring analysis and validation           │
//! │  ├── state.rs    - Room, player and turn state               │
//! │  ├── action.rs   - Player intents                            │
//! │  └── rules.rs    - apply(state, action, origin)              │
//! │                                                              │
//! │  network/        - Wire and transport (non-deterministic)    │
//! │  ├── protocol.rs - JSON envelope                             │
//! │  ├── room.rs     - Room codes and channels                   │
//! │  └── transport.rs- Pub/sub seam, in-memory bus               │
//! │                                                              │
//! │  replication/    - Keeping peers in agreement                │
//! │  ├── presence.rs - Presence and host failover                │
//! │  ├── conflict.rs - Split-brain resolution                    │
//! │  ├── replica.rs  - Replication state machine                 │
//! │  ├── coordinator.rs - Async peer actor                       │
//! │  └── store.rs    - Session persistence                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Determinism Guarantee
//!
//! The `core/` and `game/` modules are **100% deterministic**:
//! - No HashMap (uses BTreeMap for sorted iteration)
//! - No system time dependencies (the host stamps actions with an `Origin`)
//! - All dice come from a seeded Xorshift128+ carried inside `GameState`
//!
//! Any peer that inherits the host role therefore continues the exact same
//! dice stream and produces the same fingerprints.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod network;
pub mod replication;

// Re-export commonly used types
pub use core::rng::DeterministicRng;
pub use game::action::{Action, Origin};
pub use game::state::{GameState, Player, PlayerStatus, ScoreEntry, SessionId};
pub use network::room::RoomCode;
pub use replication::coordinator::{Coordinator, CoordinatorHandle, PeerConfig, PeerContext};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Player slots per room.
pub const MAX_PLAYERS: usize = 5;

/// Total that ends the game.
pub const WINNING_SCORE: i32 = 1000;

/// Smallest bank that lets a player onto the board.
pub const ENTRY_THRESHOLD: i32 = 50;
