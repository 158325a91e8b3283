//! Core deterministic primitives.
//!
//! Everything here behaves identically on every peer, which is what lets
//! authority move between peers without the dice stream or fingerprints
//! diverging.

pub mod rng;
pub mod hash;

// Re-export core types
pub use rng::DeterministicRng;
pub use hash::{compute_state_hash, StateHash, StateHasher};
