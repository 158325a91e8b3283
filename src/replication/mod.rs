//! Replication Module
//!
//! Keeps every peer's copy of a room's `GameState` converging on the
//! host's. The host applies actions and publishes versioned snapshots;
//! followers forward actions and adopt snapshots.
//!
//! ## Module Structure
//!
//! - `presence`: Online/away/disconnected classification, host failover
//! - `conflict`: Split-brain resolution between two hosts
//! - `replica`: Synchronous state machine (no I/O, no clocks)
//! - `coordinator`: Async actor around a replica (transport, timers, reconnect)
//! - `store`: Identity, last room, and cached state across restarts

pub mod presence;
pub mod conflict;
pub mod replica;
pub mod coordinator;
pub mod store;

pub use presence::{PresenceThresholds, PresenceTracker};
pub use conflict::Resolution;
pub use replica::{Replica, ReplicaConfig, Role};
pub use coordinator::{
    room_exists, ConnectionStatus, Coordinator, CoordinatorError, CoordinatorHandle, PeerConfig, PeerContext,
};
pub use store::{FileStore, LastRoom, MemoryStore, SessionStore, StoreError};
