//! Protocol Messages
//!
//! Wire format for peer-to-peer traffic on a room channel.
//! Every message is a JSON envelope:
//!
//! ```text
//! { "type": "...", "payload": { ... }, "senderId": "...", "version": 7 }
//! ```
//!
//! `type` is either one of the control kinds below or the tag of an
//! [`Action`]. `version` is present only on full-state snapshots.

use serde::{Serialize, Deserialize};
use serde_json::Value;

use crate::game::action::Action;
use crate::game::state::{GameState, SessionId};

/// Full-state snapshot.
pub const KIND_STATE: &str = "state";
/// Ask the host to re-publish its snapshot.
pub const KIND_REQUEST_STATE: &str = "request_state";
/// "Is anybody hosting this room?"
pub const KIND_HOST_PROBE: &str = "presence_host_probe";
/// Host's answer to a probe.
pub const KIND_HOST_ACK: &str = "presence_host_ack";

// =============================================================================
// MESSAGES
// =============================================================================

/// A versioned full-state snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The complete room state.
    pub state: GameState,
    /// Hex SHA-256 of `state`.
    pub fingerprint: String,
}

impl Snapshot {
    /// Wrap a state, computing its fingerprint.
    pub fn new(state: GameState) -> Self {
        let fingerprint = state.fingerprint();
        Self { state, fingerprint }
    }

    /// Check the fingerprint against the carried state.
    pub fn verify(&self) -> Result<(), ProtocolError> {
        if self.state.fingerprint() == self.fingerprint {
            Ok(())
        } else {
            Err(ProtocolError::FingerprintMismatch { version: self.state.version })
        }
    }
}

/// What an envelope carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    /// Authoritative full state.
    State(Box<Snapshot>),
    /// Ask the host for a snapshot.
    RequestState,
    /// Room liveness probe.
    PresenceHostProbe,
    /// Host answers a probe.
    PresenceHostAck,
    /// A player intent.
    Action(Action),
}

impl MessageBody {
    /// Wire `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::State(_) => KIND_STATE,
            MessageBody::RequestState => KIND_REQUEST_STATE,
            MessageBody::PresenceHostProbe => KIND_HOST_PROBE,
            MessageBody::PresenceHostAck => KIND_HOST_ACK,
            MessageBody::Action(action) => action.kind(),
        }
    }
}

/// A message on a room channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Contents.
    pub body: MessageBody,
    /// Publishing peer.
    pub sender_id: SessionId,
    /// Snapshot version, or the sender's sequence number on an action.
    pub version: Option<u64>,
}

/// On-the-wire shape of an envelope.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    payload: Value,
    sender_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<u64>,
}

impl Envelope {
    /// Wrap a body; the version is taken from the snapshot, if any.
    pub fn new(body: MessageBody, sender_id: SessionId) -> Self {
        let version = match &body {
            MessageBody::State(snapshot) => Some(snapshot.state.version),
            _ => None,
        };
        Self { body, sender_id, version }
    }

    /// Snapshot of `state`.
    pub fn snapshot(state: &GameState, sender_id: SessionId) -> Self {
        Self::new(MessageBody::State(Box::new(Snapshot::new(state.clone()))), sender_id)
    }

    /// An action.
    pub fn action(action: Action, sender_id: SessionId) -> Self {
        Self::new(MessageBody::Action(action), sender_id)
    }

    /// An action stamped with the sender's sequence number, so a receiver
    /// can drop redelivered copies.
    pub fn sequenced_action(action: Action, sender_id: SessionId, sequence: u64) -> Self {
        Self { version: Some(sequence), ..Self::action(action, sender_id) }
    }

    /// Wire `type` tag.
    pub fn kind(&self) -> &'static str {
        self.body.kind()
    }

    /// Serialize to JSON.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let payload = match &self.body {
            MessageBody::State(snapshot) => serde_json::to_value(snapshot)?,
            MessageBody::RequestState
            | MessageBody::PresenceHostProbe
            | MessageBody::PresenceHostAck => Value::Null,
            MessageBody::Action(action) => match serde_json::to_value(action)? {
                Value::Object(mut map) => map.remove("payload").unwrap_or(Value::Null),
                _ => Value::Null,
            },
        };

        let wire = WireEnvelope {
            kind: self.kind().to_string(),
            payload,
            sender_id: self.sender_id.clone(),
            version: self.version,
        };
        Ok(serde_json::to_string(&wire)?)
    }

    /// Parse and validate a JSON envelope.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let wire: WireEnvelope = serde_json::from_str(text)?;

        let body = match wire.kind.as_str() {
            KIND_STATE => {
                let snapshot: Snapshot = serde_json::from_value(wire.payload)?;
                snapshot.verify()?;
                if wire.version.is_some_and(|v| v != snapshot.state.version) {
                    return Err(ProtocolError::VersionMismatch);
                }
                MessageBody::State(Box::new(snapshot))
            }
            KIND_REQUEST_STATE => MessageBody::RequestState,
            KIND_HOST_PROBE => MessageBody::PresenceHostProbe,
            KIND_HOST_ACK => MessageBody::PresenceHostAck,
            kind if Action::KINDS.contains(&kind) => {
                let mut tagged = serde_json::Map::new();
                tagged.insert("type".to_string(), Value::String(wire.kind.clone()));
                if !wire.payload.is_null() {
                    tagged.insert("payload".to_string(), wire.payload);
                }
                MessageBody::Action(serde_json::from_value(Value::Object(tagged))?)
            }
            _ => return Err(ProtocolError::UnknownType(wire.kind)),
        };

        let mut envelope = Self::new(body, wire.sender_id);
        if let MessageBody::Action(_) = envelope.body {
            envelope.version = wire.version;
        }
        Ok(envelope)
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Problems with an inbound message. Always logged and discarded.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Not JSON, or not the expected shape.
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// `type` is not one we know.
    #[error("Unknown message type: {0}")]
    UnknownType(String),

    /// Snapshot content does not match its fingerprint.
    #[error("Snapshot fingerprint mismatch at version {version}")]
    FingerprintMismatch {
        /// Version claimed by the snapshot.
        version: u64,
    },

    /// Envelope version disagrees with the snapshot it carries.
    #[error("Envelope version does not match snapshot")]
    VersionMismatch,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rng::DeterministicRng;

    fn sid(s: &str) -> SessionId {
        SessionId::new(s)
    }

    fn sample_state() -> GameState {
        let mut state = GameState::create_for_host("Anna", &sid("sid_a"), DeterministicRng::new(1), 10);
        state.version = 4;
        state
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let envelope = Envelope::snapshot(&sample_state(), sid("sid_a"));
        assert_eq!(envelope.version, Some(4));

        let text = envelope.encode().unwrap();
        let decoded = Envelope::decode(&text).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_wire_field_names() {
        let text = Envelope::new(MessageBody::RequestState, sid("sid_b")).encode().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();

        assert_eq!(value["type"], "request_state");
        assert_eq!(value["senderId"], "sid_b");
        assert!(value.get("payload").is_none());
        assert!(value.get("version").is_none());
    }

    #[test]
    fn test_action_roundtrip() {
        for action in [
            Action::RollDice,
            Action::ToggleSelection { index: 2 },
            Action::PlayerJoin { name: "Boris".into(), session_id: sid("sid_b"), as_spectator: true },
        ] {
            let envelope = Envelope::action(action, sid("sid_b"));
            let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
            assert_eq!(decoded, envelope);
        }
    }

    #[test]
    fn test_action_sequence_survives_the_wire() {
        let envelope = Envelope::sequenced_action(Action::ToggleSelection { index: 1 }, sid("sid_b"), 1_700);
        let text = envelope.encode().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["version"], 1_700);

        assert_eq!(Envelope::decode(&text).unwrap().version, Some(1_700));
    }

    #[test]
    fn test_action_payload_is_flattened() {
        let text = Envelope::action(Action::KickPlayer { slot: 3 }, sid("sid_a")).encode().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "kick_player");
        assert_eq!(value["payload"]["slot"], 3);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = Envelope::decode(r#"{"type":"teleport","senderId":"sid_x"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(kind) if kind == "teleport"));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(Envelope::decode("not json"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(Envelope::decode(r#"{"type":"state"}"#), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_tampered_snapshot_rejected() {
        let text = Envelope::snapshot(&sample_state(), sid("sid_a")).encode().unwrap();
        let mut value: Value = serde_json::from_str(&text).unwrap();
        value["payload"]["state"]["game_message"] = Value::String("forged".into());

        let err = Envelope::decode(&value.to_string()).unwrap_err();
        assert!(matches!(err, ProtocolError::FingerprintMismatch { version: 4 }));
    }

    #[test]
    fn test_envelope_version_must_match() {
        let text = Envelope::snapshot(&sample_state(), sid("sid_a")).encode().unwrap();
        let mut value: Value = serde_json::from_str(&text).unwrap();
        value["version"] = Value::from(99);

        assert!(matches!(Envelope::decode(&value.to_string()), Err(ProtocolError::VersionMismatch)));
    }
}
