//! Networking Module
//!
//! Non-deterministic plumbing between peers: the wire envelope, room
//! addressing, and the pub/sub transport seam.

pub mod protocol;
pub mod room;
pub mod transport;

pub use protocol::{Envelope, MessageBody, ProtocolError, Snapshot};
pub use room::{ChannelId, RoomCode, RoomCodeError};
pub use transport::{InMemoryBus, Link, Transport, TransportError};
