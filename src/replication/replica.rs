//! Replica State Machine
//!
//! Everything the coordinator decides, minus the I/O. Each method takes the
//! current wall-clock time and returns the envelopes to publish, which
//! keeps every transition reproducible in a plain `#[test]`.
//!
//! ## Roles
//!
//! ```text
//!   Discovering ──snapshot──▶ Follower ◀──yield── Host
//!        │                       │                 ▲
//!        └──discovery timeout────┼─────────────────┘
//!                                └──watchdog / promoted──┘
//! ```

use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, info, warn};

use crate::core::rng::DeterministicRng;
use crate::game::action::{Action, Origin};
use crate::game::rules;
use crate::game::state::{GameState, SessionId};
use crate::network::protocol::{Envelope, MessageBody, Snapshot};
use crate::network::room::RoomCode;
use crate::replication::conflict::{self, Resolution};
use crate::replication::presence::{self, PresenceThresholds, PresenceTracker};

/// Action sequence numbers remembered per sender for duplicate detection.
const RECENT_ACTIONS: usize = 64;

/// Authority of the local peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Waiting to hear from a host.
    Discovering,
    /// Authoritative: applies actions and publishes snapshots.
    Host,
    /// Forwards actions, adopts snapshots.
    Follower,
}

/// Replica tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaConfig {
    /// Presence thresholds (host sweep and follower watchdog).
    pub thresholds: PresenceThresholds,
    /// Followers apply their own actions locally before the host confirms.
    pub optimistic_apply: bool,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            thresholds: PresenceThresholds::default(),
            optimistic_apply: true,
        }
    }
}

/// Local replica of one room.
#[derive(Debug, Clone)]
pub struct Replica {
    identity: SessionId,
    player_name: String,
    room: RoomCode,
    as_spectator: bool,
    config: ReplicaConfig,
    tracker: PresenceTracker,

    role: Role,
    state: Option<GameState>,
    /// Highest authoritative version seen or published.
    confirmed_version: u64,
    /// Local state holds unconfirmed optimistic changes.
    speculative: bool,
    /// Last time anything arrived from the host's session.
    last_host_contact_ms: u64,
    /// Sequence number of our last outgoing action.
    action_seq: u64,
    /// Recently seen action sequence numbers, by sender.
    seen_actions: BTreeMap<SessionId, VecDeque<u64>>,
}

impl Replica {
    /// Create a replica that has not heard from anyone yet.
    pub fn new(
        identity: SessionId,
        player_name: impl Into<String>,
        room: RoomCode,
        as_spectator: bool,
        config: ReplicaConfig,
    ) -> Self {
        Self {
            identity,
            player_name: player_name.into(),
            room,
            as_spectator,
            config,
            tracker: PresenceTracker::new(config.thresholds),
            role: Role::Discovering,
            state: None,
            confirmed_version: 0,
            speculative: false,
            last_host_contact_ms: 0,
            action_seq: 0,
            seen_actions: BTreeMap::new(),
        }
    }

    /// Current role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current local state, if any.
    pub fn state(&self) -> Option<&GameState> {
        self.state.as_ref()
    }

    /// Our session id.
    pub fn identity(&self) -> &SessionId {
        &self.identity
    }

    /// Room this replica belongs to.
    pub fn room(&self) -> &RoomCode {
        &self.room
    }

    /// Highest authoritative version seen or published.
    pub fn confirmed_version(&self) -> u64 {
        self.confirmed_version
    }

    /// Local state carries optimistic changes the host has not confirmed.
    pub fn is_speculative(&self) -> bool {
        self.speculative
    }

    /// Slot we own, if any.
    pub fn my_slot(&self) -> Option<usize> {
        self.state.as_ref().and_then(|s| s.slot_of(&self.identity))
    }

    /// Still waiting for a first snapshot?
    pub fn is_discovering(&self) -> bool {
        self.role == Role::Discovering
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// A transport link came up (first time or after a reconnect).
    pub fn on_connected(&mut self, now_ms: u64) -> Vec<Envelope> {
        self.last_host_contact_ms = now_ms;

        match self.role {
            Role::Host => self.publish_current().into_iter().collect(),
            Role::Discovering | Role::Follower => {
                let mut out = vec![self.envelope(MessageBody::RequestState)];
                out.extend(self.join_request(true, now_ms));
                out
            }
        }
    }

    /// Nobody answered within the discovery window: become host.
    ///
    /// A cached state for this room is restored when it has a slot for us;
    /// otherwise a fresh game is created with a seed mixed from `entropy`.
    pub fn on_discovery_timeout(&mut self, now_ms: u64, cached: Option<GameState>, entropy: u64) -> Vec<Envelope> {
        if self.role != Role::Discovering || self.state.is_some() {
            return Vec::new();
        }

        let restored = cached.and_then(|mut state| {
            let slot = state.slot_of(&self.identity)?;
            presence::take_over(&mut state, slot, now_ms);
            state.version += 1;
            Some(state)
        });

        let state = match restored {
            Some(state) => {
                info!(room = %self.room, version = state.version, "Restored cached room state as host");
                state
            }
            None => {
                let rng = DeterministicRng::for_room(self.room.channel().as_str(), self.identity.as_str(), entropy);
                let mut state = GameState::create_for_host(&self.player_name, &self.identity, rng, now_ms);
                state.version = 1;
                info!(room = %self.room, "No host answered, created room");
                state
            }
        };

        self.role = Role::Host;
        self.confirmed_version = state.version;
        self.speculative = false;
        self.state = Some(state);
        self.publish_current().into_iter().collect()
    }

    /// Express a local intent.
    pub fn dispatch(&mut self, action: Action, now_ms: u64) -> Vec<Envelope> {
        match self.role {
            Role::Host => {
                let origin = Origin::new(self.identity.clone(), now_ms);
                self.apply_as_host(&action, &origin)
            }
            Role::Follower | Role::Discovering => {
                if self.config.optimistic_apply {
                    if let Some(state) = self.state.as_mut() {
                        let before = state.clone();
                        rules::apply_mut(state, &action, &Origin::new(self.identity.clone(), now_ms));
                        if *state != before {
                            self.speculative = true;
                        }
                    }
                }
                vec![self.action_envelope(action, now_ms)]
            }
        }
    }

    /// Periodic liveness announcement.
    pub fn heartbeat(&mut self, now_ms: u64) -> Vec<Envelope> {
        if self.my_slot().is_none() {
            return Vec::new();
        }
        let beat = Action::PresenceHeartbeat { session_id: self.identity.clone() };
        let mut out = Vec::new();

        if self.role == Role::Host {
            let origin = Origin::new(self.identity.clone(), now_ms);
            out.extend(self.apply_as_host(&beat, &origin));
        }
        // Followers watch for the host's heartbeats, so hosts announce too.
        out.push(self.action_envelope(beat, now_ms));
        out
    }

    /// Periodic presence work: host sweep or follower watchdog.
    pub fn tick(&mut self, now_ms: u64) -> Vec<Envelope> {
        match self.role {
            Role::Host => self.sweep(now_ms),
            Role::Follower => self.watchdog(now_ms),
            Role::Discovering => Vec::new(),
        }
    }

    /// Leave the room.
    pub fn leave(&mut self, now_ms: u64) -> Vec<Envelope> {
        let out = self.dispatch(Action::PlayerLeave { session_id: self.identity.clone() }, now_ms);
        self.role = Role::Discovering;
        out
    }

    // =========================================================================
    // INBOUND
    // =========================================================================

    /// Handle one inbound envelope.
    pub fn handle(&mut self, envelope: Envelope, now_ms: u64) -> Vec<Envelope> {
        if envelope.sender_id == self.identity {
            return Vec::new();
        }

        let from_host = self
            .state
            .as_ref()
            .and_then(|s| s.host_session())
            .is_some_and(|h| h == &envelope.sender_id);
        if from_host {
            self.last_host_contact_ms = now_ms;
        }

        // Recorded in every role.
        if let (MessageBody::Action(_), Some(sequence)) = (&envelope.body, envelope.version) {
            if !self.first_delivery(&envelope.sender_id, sequence) {
                debug!(sender = %envelope.sender_id, sequence, "Dropping redelivered action");
                return Vec::new();
            }
        }

        match envelope.body {
            MessageBody::State(snapshot) => self.on_snapshot(*snapshot, &envelope.sender_id, now_ms),
            MessageBody::RequestState => match self.role {
                Role::Host => self.publish_current().into_iter().collect(),
                _ => Vec::new(),
            },
            MessageBody::PresenceHostProbe => match self.role {
                Role::Host => vec![self.envelope(MessageBody::PresenceHostAck)],
                _ => Vec::new(),
            },
            MessageBody::PresenceHostAck => Vec::new(),
            MessageBody::Action(action) => match self.role {
                Role::Host => {
                    let origin = Origin::new(envelope.sender_id, now_ms);
                    self.apply_as_host(&action, &origin)
                }
                _ => Vec::new(),
            },
        }
    }

    fn on_snapshot(&mut self, snapshot: Snapshot, sender: &SessionId, now_ms: u64) -> Vec<Envelope> {
        let incoming = snapshot.state;

        if self.role == Role::Host {
            // An older foreign snapshot is either a late duplicate or a rival
            // that will hear our newer state and resolve on its side.
            if incoming.version < self.confirmed_version {
                debug!(version = incoming.version, confirmed = self.confirmed_version, "Ignoring older snapshot");
                return Vec::new();
            }
            if !incoming.is_host(&self.identity) {
                if let Some(local) = self.state.clone() {
                    return self.on_foreign_host(local, incoming, sender, now_ms);
                }
            }
        }

        let stale = incoming.version < self.confirmed_version
            || (incoming.version == self.confirmed_version && !self.speculative);
        if stale {
            debug!(version = incoming.version, confirmed = self.confirmed_version, "Discarding stale snapshot");
            return Vec::new();
        }

        self.adopt(incoming, now_ms)
    }

    fn on_foreign_host(&mut self, local: GameState, incoming: GameState, sender: &SessionId, now_ms: u64) -> Vec<Envelope> {
        warn!(room = %self.room, other = %sender, "Another host is publishing in this room");

        match conflict::resolve(&local, &self.identity, &incoming, sender) {
            Resolution::Yield => {
                info!(winner = %sender, "Stepping down after host conflict");
                self.role = Role::Follower;
                self.adopt(incoming, now_ms)
            }
            Resolution::Retain => {
                let version = conflict::reassert_version(&local, &incoming);
                if let Some(state) = self.state.as_mut() {
                    state.version = version;
                }
                self.confirmed_version = version;
                info!(version, "Keeping host role, re-asserting state");
                self.publish_current().into_iter().collect()
            }
        }
    }

    /// Replace local state wholesale with an authoritative snapshot.
    fn adopt(&mut self, incoming: GameState, now_ms: u64) -> Vec<Envelope> {
        self.confirmed_version = incoming.version;
        self.speculative = false;
        self.last_host_contact_ms = now_ms;

        self.role = if incoming.is_host(&self.identity) { Role::Host } else { Role::Follower };
        if self.role == Role::Host {
            info!(room = %self.room, version = incoming.version, "Promoted to host by published state");
        }

        self.state = Some(incoming);
        match self.role {
            Role::Host => Vec::new(),
            _ => self.join_request(false, now_ms).into_iter().collect(),
        }
    }

    // =========================================================================
    // HOST
    // =========================================================================

    fn apply_as_host(&mut self, action: &Action, origin: &Origin) -> Vec<Envelope> {
        let Some(current) = self.state.as_ref() else {
            return Vec::new();
        };
        let next = rules::apply(current, action, origin);

        if let Action::PresenceHeartbeat { .. } = action {
            // Timestamps alone are host bookkeeping; only a status change is news.
            if PresenceTracker::statuses(&next) == PresenceTracker::statuses(current) {
                self.state = Some(next);
                return Vec::new();
            }
        }

        self.commit(next)
    }

    fn sweep(&mut self, now_ms: u64) -> Vec<Envelope> {
        let Some(current) = self.state.as_ref() else {
            return Vec::new();
        };
        let mut next = current.clone();
        let report = self.tracker.sweep(&mut next, now_ms);
        if report.is_empty() {
            return Vec::new();
        }

        for change in &report.changes {
            debug!(slot = change.slot, from = ?change.from, to = ?change.to, "Presence changed");
        }
        if let Some((old, new)) = report.host_change {
            info!(?old, ?new, "Host slot reassigned");
        }
        self.commit(next)
    }

    /// Publish `next` under a fresh version if it differs from the current state.
    fn commit(&mut self, mut next: GameState) -> Vec<Envelope> {
        if self.state.as_ref() == Some(&next) {
            return Vec::new();
        }

        next.version = self.confirmed_version.max(next.version) + 1;
        self.confirmed_version = next.version;
        let still_host = next.is_host(&self.identity);
        self.state = Some(next);

        let out: Vec<Envelope> = self.publish_current().into_iter().collect();
        if !still_host {
            info!(room = %self.room, "Handed host role over");
            self.role = Role::Follower;
        }
        out
    }

    fn publish_current(&self) -> Option<Envelope> {
        self.state
            .as_ref()
            .map(|state| Envelope::snapshot(state, self.identity.clone()))
    }

    // =========================================================================
    // FOLLOWER
    // =========================================================================

    fn watchdog(&mut self, now_ms: u64) -> Vec<Envelope> {
        let Some(state) = self.state.as_ref() else {
            return Vec::new();
        };

        if self.tracker.should_take_over(state, &self.identity, self.last_host_contact_ms, now_ms) {
            let Some(slot) = state.slot_of(&self.identity) else {
                return Vec::new();
            };
            warn!(room = %self.room, old_host = ?state.host_id, slot, "Host silent, taking over");

            let mut next = state.clone();
            presence::take_over(&mut next, slot, now_ms);
            self.role = Role::Host;
            self.speculative = false;
            self.last_host_contact_ms = now_ms;
            return self.commit(next);
        }

        if self.speculative {
            // Nothing confirmed our optimistic change; ask for the truth.
            return vec![self.envelope(MessageBody::RequestState)];
        }
        Vec::new()
    }

    /// A `PlayerJoin` for ourselves.
    ///
    /// With `reclaim` set, an owned slot is re-announced too (after a
    /// reconnect); otherwise only a state with no trace of us triggers one.
    fn join_request(&mut self, reclaim: bool, now_ms: u64) -> Option<Envelope> {
        if let Some(state) = self.state.as_ref() {
            let seated = state.slot_of(&self.identity).is_some();
            let waiting = state.is_spectator(&self.identity)
                || state.join_requests.iter().any(|r| r.session_id == self.identity);
            if waiting || (seated && !reclaim) {
                return None;
            }
        }

        let join = Action::PlayerJoin {
            name: self.player_name.clone(),
            session_id: self.identity.clone(),
            as_spectator: self.as_spectator,
        };
        Some(self.action_envelope(join, now_ms))
    }

    fn envelope(&self, body: MessageBody) -> Envelope {
        Envelope::new(body, self.identity.clone())
    }

    /// Sequence numbers start from the wall clock so a restarted peer does
    /// not reuse ones the room still remembers.
    fn action_envelope(&mut self, action: Action, now_ms: u64) -> Envelope {
        self.action_seq = (self.action_seq + 1).max(now_ms);
        Envelope::sequenced_action(action, self.identity.clone(), self.action_seq)
    }

    /// Record `sequence` from `sender`; false if it was already seen.
    fn first_delivery(&mut self, sender: &SessionId, sequence: u64) -> bool {
        let recent = self.seen_actions.entry(sender.clone()).or_default();
        if recent.contains(&sequence) {
            return false;
        }
        recent.push_back(sequence);
        if recent.len() > RECENT_ACTIONS {
            recent.pop_front();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::state::PlayerStatus;
    use std::collections::VecDeque;

    fn room() -> RoomCode {
        RoomCode::parse("QX7KM").unwrap()
    }

    fn peer(id: &str, name: &str) -> Replica {
        Replica::new(SessionId::new(id), name, room(), false, ReplicaConfig::default())
    }

    /// Round-trip through the wire codec, as the transport would.
    fn wire(envelopes: Vec<Envelope>) -> Vec<Envelope> {
        envelopes
            .into_iter()
            .map(|e| Envelope::decode(&e.encode().unwrap()).unwrap())
            .collect()
    }

    /// Broadcast `initial` to every peer (publishers hear themselves too)
    /// and keep delivering whatever they answer until the room is quiet.
    fn pump(peers: &mut [&mut Replica], initial: Vec<Envelope>, now: u64) {
        let mut queue: VecDeque<Envelope> = wire(initial).into();
        let mut delivered = 0;
        while let Some(envelope) = queue.pop_front() {
            delivered += 1;
            assert!(delivered < 1_000, "message storm");
            for peer in peers.iter_mut() {
                let out = peer.handle(envelope.clone(), now);
                queue.extend(wire(out));
            }
        }
    }

    fn hosting(id: &str, name: &str) -> Replica {
        let mut replica = peer(id, name);
        replica.on_connected(0);
        let out = replica.on_discovery_timeout(0, None, 7);
        assert_eq!(out.len(), 1);
        replica
    }

    fn join(host: &mut Replica, id: &str, name: &str, now: u64) -> Replica {
        let mut follower = peer(id, name);
        let hello = follower.on_connected(now);
        pump(&mut [host, &mut follower], hello, now);
        follower
    }

    fn snapshot_of(replica: &Replica) -> Envelope {
        replica.publish_current().unwrap()
    }

    fn published_state(out: &[Envelope]) -> Option<&GameState> {
        out.iter().find_map(|e| match &e.body {
            MessageBody::State(snapshot) => Some(&snapshot.state),
            _ => None,
        })
    }

    #[test]
    fn test_lonely_peer_becomes_host() {
        let mut a = peer("sid_a", "Anna");
        let hello = a.on_connected(0);
        assert_eq!(hello.iter().map(|e| e.kind()).collect::<Vec<_>>(), vec!["request_state", "player_join"]);

        let out = a.on_discovery_timeout(3_000, None, 42);
        assert_eq!(a.role(), Role::Host);
        assert_eq!(a.confirmed_version(), 1);
        assert_eq!(a.my_slot(), Some(0));
        assert_eq!(published_state(&out).map(|s| s.version), Some(1));

        // A second timeout is a no-op.
        assert!(a.on_discovery_timeout(3_000, None, 42).is_empty());
    }

    #[test]
    fn test_follower_joins_and_converges() {
        let mut a = hosting("sid_a", "Anna");
        let b = join(&mut a, "sid_b", "Boris", 100);

        assert_eq!(b.role(), Role::Follower);
        assert_eq!(b.my_slot(), Some(1));
        assert_eq!(a.state(), b.state());
        assert_eq!(a.confirmed_version(), 2);
        assert_eq!(b.confirmed_version(), 2);
    }

    #[test]
    fn test_duplicate_and_stale_snapshots_are_ignored() {
        let mut a = hosting("sid_a", "Anna");
        let mut b = join(&mut a, "sid_b", "Boris", 100);
        let before = serde_json::to_string(b.state().unwrap()).unwrap();

        let current = snapshot_of(&a);
        assert!(b.handle(current.clone(), 200).is_empty());
        assert!(b.handle(current, 200).is_empty());
        assert_eq!(serde_json::to_string(b.state().unwrap()).unwrap(), before);

        let mut old = a.state().unwrap().clone();
        old.version = 1;
        old.game_message = "from the past".to_string();
        assert!(b.handle(Envelope::snapshot(&old, a.identity().clone()), 200).is_empty());
        assert_eq!(b.confirmed_version(), 2);
        assert_ne!(b.state().unwrap().game_message, "from the past");
    }

    #[test]
    fn test_own_echo_is_ignored() {
        let mut a = hosting("sid_a", "Anna");
        let echo = snapshot_of(&a);
        assert!(a.handle(echo, 10).is_empty());
        assert_eq!(a.role(), Role::Host);
    }

    #[test]
    fn test_forwarded_action_applied_by_host() {
        let mut a = hosting("sid_a", "Anna");
        let mut b = join(&mut a, "sid_b", "Boris", 100);

        let start = a.dispatch(Action::StartGame, 200);
        assert_eq!(published_state(&start).map(|s| s.version), Some(3));
        pump(&mut [&mut a, &mut b], start, 200);

        // Hand the turn to Boris on both sides without a publish.
        a.state.as_mut().unwrap().current_player_index = 1;
        b.state.as_mut().unwrap().current_player_index = 1;

        let out = b.dispatch(Action::RollDice, 300);
        assert!(b.is_speculative());
        let predicted = b.state().unwrap().dice_on_board.clone();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind(), "roll_dice");

        pump(&mut [&mut a, &mut b], out, 300);

        assert_eq!(a.confirmed_version(), 4);
        assert!(!b.is_speculative());
        assert_eq!(a.state(), b.state());
        // Both sides drew from the same replicated stream.
        if a.state().unwrap().current_player_index == 1 {
            assert_eq!(a.state().unwrap().dice_on_board, predicted);
        }
    }

    #[test]
    fn test_redelivered_action_applied_once() {
        let mut a = hosting("sid_a", "Anna");
        let mut b = join(&mut a, "sid_b", "Boris", 100);
        let start = a.dispatch(Action::StartGame, 200);
        pump(&mut [&mut a, &mut b], start, 200);
        for replica in [&mut a, &mut b] {
            let state = replica.state.as_mut().unwrap();
            state.current_player_index = 1;
            state.dice_on_board = vec![1, 5, 2];
            state.can_roll = false;
            state.can_bank = true;
        }

        let out = wire(b.dispatch(Action::ToggleSelection { index: 0 }, 300));
        assert_eq!(out[0].version, Some(300));
        let first = a.handle(out[0].clone(), 300);
        assert_eq!(published_state(&first).unwrap().selected_dice_indices, vec![0]);

        assert!(a.handle(out[0].clone(), 301).is_empty());
        assert_eq!(a.state().unwrap().selected_dice_indices, vec![0]);

        // A fresh toggle of the same die is a new action.
        let again = b.dispatch(Action::ToggleSelection { index: 0 }, 300);
        assert_eq!(again[0].version, Some(301));
        a.handle(wire(again).remove(0), 302);
        assert!(a.state().unwrap().selected_dice_indices.is_empty());
    }

    #[test]
    fn test_non_host_cannot_start_game() {
        let mut a = hosting("sid_a", "Anna");
        let mut b = join(&mut a, "sid_b", "Boris", 100);

        let out = b.dispatch(Action::StartGame, 200);
        assert!(!b.is_speculative());
        pump(&mut [&mut a, &mut b], out, 200);

        assert!(!a.state().unwrap().is_game_started);
        assert_eq!(a.confirmed_version(), 2);
    }

    #[test]
    fn test_lost_action_reconciled_by_request_state() {
        let mut a = hosting("sid_a", "Anna");
        let mut b = join(&mut a, "sid_b", "Boris", 100);
        let start = a.dispatch(Action::StartGame, 200);
        pump(&mut [&mut a, &mut b], start, 200);
        a.state.as_mut().unwrap().current_player_index = 1;
        b.state.as_mut().unwrap().current_player_index = 1;

        // The action never reaches the host.
        let _lost = b.dispatch(Action::RollDice, 300);
        assert!(b.is_speculative());

        let ask = b.tick(1_000);
        assert_eq!(ask.iter().map(|e| e.kind()).collect::<Vec<_>>(), vec!["request_state"]);
        pump(&mut [&mut a, &mut b], ask, 1_000);

        assert!(!b.is_speculative());
        assert_eq!(a.state(), b.state());
        assert!(b.state().unwrap().dice_on_board.is_empty());
    }

    #[test]
    fn test_request_state_answered_by_host_only() {
        let mut a = hosting("sid_a", "Anna");
        let mut b = join(&mut a, "sid_b", "Boris", 100);
        let ask = Envelope::new(MessageBody::RequestState, SessionId::new("sid_new"));

        let out = a.handle(ask.clone(), 200);
        assert_eq!(published_state(&out).map(|s| s.version), Some(a.confirmed_version()));
        assert!(b.handle(ask, 200).is_empty());
    }

    #[test]
    fn test_probe_answered_by_host_only() {
        let mut a = hosting("sid_a", "Anna");
        let mut b = join(&mut a, "sid_b", "Boris", 100);
        let probe = Envelope::new(MessageBody::PresenceHostProbe, SessionId::new("sid_probe"));

        let out = a.handle(probe.clone(), 200);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].body, MessageBody::PresenceHostAck);
        assert!(b.handle(probe, 200).is_empty());
    }

    #[test]
    fn test_heartbeat_without_status_change_is_silent() {
        let mut a = hosting("sid_a", "Anna");
        let mut b = join(&mut a, "sid_b", "Boris", 0);
        let version = a.confirmed_version();

        let beat = b.heartbeat(10_000);
        assert_eq!(beat.len(), 1);
        assert!(a.handle(beat[0].clone(), 10_000).is_empty());

        assert_eq!(a.confirmed_version(), version);
        assert_eq!(a.state().unwrap().players[1].last_seen_ms, 10_000);
    }

    #[test]
    fn test_sweep_publishes_status_changes() {
        let mut a = hosting("sid_a", "Anna");
        let mut b = join(&mut a, "sid_b", "Boris", 0);

        let own = a.heartbeat(25_000);
        assert_eq!(own.len(), 1);
        let out = a.tick(25_000);
        let state = published_state(&out).unwrap();
        assert_eq!(state.players[0].status, PlayerStatus::Online);
        assert_eq!(state.players[1].status, PlayerStatus::Away);

        pump(&mut [&mut a, &mut b], out, 25_000);
        assert_eq!(b.state().unwrap().players[1].status, PlayerStatus::Away);

        // Boris comes back: the status flip is news, so it is published.
        let beat = b.heartbeat(26_000);
        let out = a.handle(beat[0].clone(), 26_000);
        assert_eq!(published_state(&out).unwrap().players[1].status, PlayerStatus::Online);

        assert!(a.tick(26_000).is_empty());
    }

    #[test]
    fn test_silent_host_demoted_by_own_sweep() {
        let mut a = hosting("sid_a", "Anna");
        let mut b = join(&mut a, "sid_b", "Boris", 0);

        let beat = b.heartbeat(80_000);
        pump(&mut [&mut a, &mut b], beat, 80_000);

        let out = a.tick(95_000);
        assert_eq!(a.role(), Role::Follower);
        assert_eq!(published_state(&out).unwrap().host_id, Some(1));

        pump(&mut [&mut a, &mut b], out, 95_000);
        assert_eq!(b.role(), Role::Host);
        assert_eq!(a.state(), b.state());
    }

    #[test]
    fn test_watchdog_takes_over_from_dead_host() {
        let mut a = hosting("sid_a", "Anna");
        let mut b = join(&mut a, "sid_b", "Boris", 0);
        let mut c = join(&mut a, "sid_c", "Clara", 0);
        let sync = a.on_connected(0);
        pump(&mut [&mut a, &mut b, &mut c], sync, 0);
        assert_eq!(b.state(), c.state());
        let version = a.confirmed_version();

        // Anna vanishes. Clara ranks second and keeps waiting.
        assert!(b.tick(90_000).is_empty());
        assert!(c.tick(91_000).is_empty());

        let out = b.tick(91_000);
        assert_eq!(b.role(), Role::Host);
        let state = published_state(&out).unwrap();
        assert_eq!(state.host_id, Some(1));
        assert_eq!(state.version, version + 1);
        assert_eq!(state.players[0].status, PlayerStatus::Disconnected);

        pump(&mut [&mut b, &mut c], out, 91_000);
        assert_eq!(c.role(), Role::Follower);
        assert_eq!(b.state(), c.state());
    }

    #[test]
    fn test_new_host_keeps_live_followers_online() {
        let mut a = hosting("sid_a", "Anna");
        let mut b = join(&mut a, "sid_b", "Boris", 0);
        let mut c = join(&mut a, "sid_c", "Clara", 0);
        let sync = a.on_connected(0);
        pump(&mut [&mut a, &mut b, &mut c], sync, 0);

        // Anna is gone. Clara keeps beating, but only the dead host ever
        // recorded those timestamps.
        for now in (5_000..=85_000).step_by(5_000) {
            let beat = c.heartbeat(now);
            pump(&mut [&mut b, &mut c], beat, now);
        }

        let out = b.tick(91_000);
        assert_eq!(b.role(), Role::Host);
        pump(&mut [&mut b, &mut c], out, 91_000);

        assert!(b.tick(95_000).is_empty());
        let state = b.state().unwrap();
        assert_eq!(state.players[0].status, PlayerStatus::Disconnected);
        assert_eq!(state.players[2].status, PlayerStatus::Online);

        // Clara's next beat is bookkeeping, not news.
        let beat = c.heartbeat(95_000);
        assert!(b.handle(wire(beat).remove(0), 95_000).is_empty());
        assert_eq!(b.state().unwrap().players[2].status, PlayerStatus::Online);
    }

    #[test]
    fn test_split_brain_tie_goes_to_lower_id() {
        let mut a = hosting("sid_a", "Anna");
        let mut b = hosting("sid_b", "Boris");

        let mut hello = a.on_connected(10);
        hello.extend(b.on_connected(10));
        pump(&mut [&mut a, &mut b], hello, 10);

        assert_eq!(a.role(), Role::Host);
        assert_eq!(b.role(), Role::Follower);
        assert_eq!(a.state(), b.state());
        assert_eq!(a.state().unwrap().claimed_count(), 2);
        assert_eq!(b.my_slot(), Some(1));
    }

    #[test]
    fn test_split_brain_more_players_wins() {
        let mut a = hosting("sid_a", "Anna");
        let mut c = hosting("sid_c", "Clara");
        let mut d = join(&mut c, "sid_d", "Dmitri", 0);

        let mut hello = a.on_connected(10);
        hello.extend(c.on_connected(10));
        pump(&mut [&mut a, &mut c, &mut d], hello, 10);

        assert_eq!(c.role(), Role::Host);
        assert_eq!(a.role(), Role::Follower);
        assert_eq!(d.role(), Role::Follower);
        assert_eq!(a.state(), c.state());
        assert_eq!(d.state(), c.state());
        assert_eq!(c.state().unwrap().claimed_count(), 3);
    }

    #[test]
    fn test_reassertion_overrides_loser_followers() {
        let mut w = hosting("sid_a", "Wanda");
        let mut g = join(&mut w, "sid_g", "Gleb", 0);
        let mut l = hosting("sid_b", "Lev");
        let mut f = join(&mut l, "sid_f", "Fedor", 0);

        let start = l.dispatch(Action::StartGame, 5);
        pump(&mut [&mut l, &mut f], start, 5);
        assert!(l.confirmed_version() > w.confirmed_version());

        let mut hello = l.on_connected(10);
        hello.extend(w.on_connected(10));
        pump(&mut [&mut w, &mut g, &mut l, &mut f], hello, 10);

        assert_eq!(w.role(), Role::Host);
        for other in [&g, &l, &f] {
            assert_eq!(other.role(), Role::Follower);
            assert_eq!(other.state(), w.state());
        }
        assert_eq!(w.state().unwrap().claimed_count(), 4);
    }

    #[test]
    fn test_host_leaving_hands_over() {
        let mut a = hosting("sid_a", "Anna");
        let mut b = join(&mut a, "sid_b", "Boris", 0);

        let out = a.leave(1_000);
        assert_eq!(a.role(), Role::Discovering);
        pump(&mut [&mut a, &mut b], out, 1_000);

        assert_eq!(b.role(), Role::Host);
        assert_eq!(b.state().unwrap().claimed_count(), 1);
        assert_eq!(b.my_slot(), Some(1));
    }

    #[test]
    fn test_restore_cached_state() {
        let mut a = hosting("sid_a", "Anna");
        let b = join(&mut a, "sid_b", "Boris", 0);
        let mut cached = b.state().unwrap().clone();
        cached.version = 7;

        let mut back = peer("sid_b", "Boris");
        back.on_connected(200_000);
        let out = back.on_discovery_timeout(200_000, Some(cached), 1);
        let state = published_state(&out).unwrap();
        assert_eq!(state.version, 8);
        assert_eq!(state.host_id, Some(1));
        assert_eq!(state.players[0].status, PlayerStatus::Disconnected);
        assert_eq!(back.role(), Role::Host);

        // A cache without our slot is not ours to restore.
        let mut stranger = peer("sid_z", "Zoya");
        stranger.on_connected(0);
        let out = stranger.on_discovery_timeout(0, b.state().cloned(), 1);
        let state = published_state(&out).unwrap();
        assert_eq!(state.version, 1);
        assert_eq!(state.claimed_count(), 1);
    }

    #[test]
    fn test_pessimistic_follower_waits_for_host() {
        let mut a = hosting("sid_a", "Anna");
        let mut b = Replica::new(
            SessionId::new("sid_b"),
            "Boris",
            room(),
            false,
            ReplicaConfig { optimistic_apply: false, ..ReplicaConfig::default() },
        );
        let hello = b.on_connected(0);
        pump(&mut [&mut a, &mut b], hello, 0);
        let start = a.dispatch(Action::StartGame, 10);
        pump(&mut [&mut a, &mut b], start, 10);
        b.state.as_mut().unwrap().current_player_index = 1;
        a.state.as_mut().unwrap().current_player_index = 1;

        let before = b.state().cloned();
        let out = b.dispatch(Action::RollDice, 20);
        assert_eq!(b.state().cloned(), before);
        assert!(!b.is_speculative());

        pump(&mut [&mut a, &mut b], out, 20);
        assert_eq!(a.state(), b.state());
    }
}
