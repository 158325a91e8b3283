//! Session Store
//!
//! Small durable key/value state used only to resume after a restart: our
//! session identity, the room we were last in, and the last snapshot we saw
//! for each room.
//!
//! `FileStore` layout:
//!
//! ```text
//! <dir>/session.json        identity + last room (serde_json)
//! <dir>/rooms/<CODE>.bin    cached GameState (bincode)
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Serialize, Deserialize};
use tracing::debug;

use crate::game::state::{GameState, SessionId};
use crate::network::room::RoomCode;

/// Room a peer was last in, and under which name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastRoom {
    /// Room code.
    pub room: RoomCode,
    /// Display name used there.
    pub player_name: String,
}

/// Store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("Store I/O failed: {0}")]
    Io(#[from] io::Error),

    /// Session file could not be (de)serialized.
    #[error("Session file corrupt: {0}")]
    Session(#[from] serde_json::Error),

    /// Cached state could not be (de)serialized.
    #[error("Cached state corrupt: {0}")]
    State(#[from] bincode::Error),
}

/// Durable per-peer storage.
pub trait SessionStore: Send + Sync + 'static {
    /// Stored session identity.
    fn identity(&self) -> Result<Option<SessionId>, StoreError>;

    /// Persist the session identity.
    fn save_identity(&self, identity: &SessionId) -> Result<(), StoreError>;

    /// Last room joined.
    fn last_room(&self) -> Result<Option<LastRoom>, StoreError>;

    /// Remember the room we are in.
    fn set_last_room(&self, last: &LastRoom) -> Result<(), StoreError>;

    /// Forget the last room (after an explicit leave).
    fn clear_last_room(&self) -> Result<(), StoreError>;

    /// Last snapshot seen for `room`.
    fn cached_state(&self, room: &RoomCode) -> Result<Option<GameState>, StoreError>;

    /// Cache a snapshot for `room`.
    fn cache_state(&self, room: &RoomCode, state: &GameState) -> Result<(), StoreError>;

    /// Drop everything.
    fn clear(&self) -> Result<(), StoreError>;

    /// Stored identity, or a freshly generated one that is then persisted.
    fn load_or_create_identity(&self) -> Result<SessionId, StoreError> {
        if let Some(identity) = self.identity()? {
            return Ok(identity);
        }
        let identity = SessionId::generate();
        self.save_identity(&identity)?;
        Ok(identity)
    }
}

/// Contents of the session record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct SessionRecord {
    identity: Option<SessionId>,
    last_room: Option<LastRoom>,
}

// =============================================================================
// MEMORY STORE
// =============================================================================

/// Volatile store for tests and throwaway peers.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    session: SessionRecord,
    states: BTreeMap<RoomCode, GameState>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut MemoryInner) -> T) -> T {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

impl SessionStore for MemoryStore {
    fn identity(&self) -> Result<Option<SessionId>, StoreError> {
        Ok(self.with(|m| m.session.identity.clone()))
    }

    fn save_identity(&self, identity: &SessionId) -> Result<(), StoreError> {
        self.with(|m| m.session.identity = Some(identity.clone()));
        Ok(())
    }

    fn last_room(&self) -> Result<Option<LastRoom>, StoreError> {
        Ok(self.with(|m| m.session.last_room.clone()))
    }

    fn set_last_room(&self, last: &LastRoom) -> Result<(), StoreError> {
        self.with(|m| m.session.last_room = Some(last.clone()));
        Ok(())
    }

    fn clear_last_room(&self) -> Result<(), StoreError> {
        self.with(|m| m.session.last_room = None);
        Ok(())
    }

    fn cached_state(&self, room: &RoomCode) -> Result<Option<GameState>, StoreError> {
        Ok(self.with(|m| m.states.get(room).cloned()))
    }

    fn cache_state(&self, room: &RoomCode, state: &GameState) -> Result<(), StoreError> {
        self.with(|m| m.states.insert(room.clone(), state.clone()));
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.with(|m| *m = MemoryInner::default());
        Ok(())
    }
}

// =============================================================================
// FILE STORE
// =============================================================================

/// Store backed by a directory.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    /// Serializes read-modify-write of the session file.
    session_lock: Mutex<()>,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(dir.join("rooms"))?;
        debug!(dir = %dir.display(), "Opened session store");
        Ok(Self { dir, session_lock: Mutex::new(()) })
    }

    /// Root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn session_path(&self) -> PathBuf {
        self.dir.join("session.json")
    }

    fn state_path(&self, room: &RoomCode) -> PathBuf {
        self.dir.join("rooms").join(format!("{}.bin", room.as_str()))
    }

    fn read_session(&self) -> Result<SessionRecord, StoreError> {
        match fs::read_to_string(self.session_path()) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(SessionRecord::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn update_session(&self, f: impl FnOnce(&mut SessionRecord)) -> Result<(), StoreError> {
        let _guard = match self.session_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut record = self.read_session()?;
        f(&mut record);
        write_atomic(&self.session_path(), serde_json::to_string_pretty(&record)?.as_bytes())
    }
}

/// Write via a temporary sibling and rename, so readers never see half a file.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

impl SessionStore for FileStore {
    fn identity(&self) -> Result<Option<SessionId>, StoreError> {
        Ok(self.read_session()?.identity)
    }

    fn save_identity(&self, identity: &SessionId) -> Result<(), StoreError> {
        self.update_session(|r| r.identity = Some(identity.clone()))
    }

    fn last_room(&self) -> Result<Option<LastRoom>, StoreError> {
        Ok(self.read_session()?.last_room)
    }

    fn set_last_room(&self, last: &LastRoom) -> Result<(), StoreError> {
        self.update_session(|r| r.last_room = Some(last.clone()))
    }

    fn clear_last_room(&self) -> Result<(), StoreError> {
        self.update_session(|r| r.last_room = None)
    }

    fn cached_state(&self, room: &RoomCode) -> Result<Option<GameState>, StoreError> {
        match fs::read(self.state_path(room)) {
            Ok(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn cache_state(&self, room: &RoomCode, state: &GameState) -> Result<(), StoreError> {
        let bytes = bincode::serialize(state)?;
        write_atomic(&self.state_path(room), &bytes)
    }

    fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(self.dir.join("rooms"))?;
        Ok(())
    }
}
