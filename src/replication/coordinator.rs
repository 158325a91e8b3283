//! Replication Coordinator
//!
//! The async half of a peer. One spawned task owns the transport link, the
//! timers, and the `Replica`; the rest of the program talks to it through a
//! `CoordinatorHandle` (commands in over mpsc, state and connection status
//! out over watch channels).
//!
//! A dropped link is never fatal: the task reconnects with exponential
//! backoff, re-announces itself, and carries on with whatever role it had.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, sleep_until, timeout, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::game::action::Action;
use crate::game::state::{GameState, SessionId};
use crate::network::protocol::{Envelope, MessageBody};
use crate::network::room::RoomCode;
use crate::network::transport::{Link, Transport, TransportError};
use crate::replication::presence::PresenceThresholds;
use crate::replication::replica::{Replica, ReplicaConfig, Role};
use crate::replication::store::{LastRoom, SessionStore};

/// Commands buffered between handle and task.
const COMMAND_BUFFER: usize = 64;

/// Peer configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// How long to wait for a host before self-electing.
    pub discovery_window: Duration,
    /// Give up on a single connect attempt after this long.
    pub connect_timeout: Duration,
    /// Presence heartbeat period.
    pub heartbeat_interval: Duration,
    /// Host presence sweep / follower watchdog period.
    pub sweep_interval: Duration,
    /// Away / disconnected thresholds.
    pub thresholds: PresenceThresholds,
    /// First reconnect delay.
    pub reconnect_backoff: Duration,
    /// Reconnect delay cap.
    pub max_reconnect_backoff: Duration,
    /// Apply our own actions before the host confirms them.
    pub optimistic_apply: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            discovery_window: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(5),
            thresholds: PresenceThresholds::default(),
            reconnect_backoff: Duration::from_millis(500),
            max_reconnect_backoff: Duration::from_secs(10),
            optimistic_apply: true,
        }
    }
}

impl PeerConfig {
    /// The subset the replica state machine needs.
    pub fn replica_config(&self) -> ReplicaConfig {
        ReplicaConfig {
            thresholds: self.thresholds,
            optimistic_apply: self.optimistic_apply,
        }
    }
}

/// Who this peer is and where it is going.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerContext {
    /// Persistent session identity.
    pub identity: SessionId,
    /// Display name.
    pub player_name: String,
    /// Room to join.
    pub room: RoomCode,
    /// Join as a spectator.
    pub as_spectator: bool,
}

/// Link state as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// First connect attempt in flight.
    Connecting,
    /// Link up.
    Connected,
    /// Link lost, trying again.
    Reconnecting,
    /// Last attempt failed; a retry is scheduled.
    Error,
}

/// Handle-side failures.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// The coordinator task has exited.
    #[error("Coordinator stopped")]
    Stopped,

    /// The coordinator task panicked or was cancelled.
    #[error("Coordinator task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

enum Command {
    Dispatch(Action),
    Leave(oneshot::Sender<()>),
    Shutdown,
}

/// Why a connected session ended.
enum Exit {
    LinkLost,
    Stopped,
}

/// Current time in milliseconds since the epoch.
fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

// =============================================================================
// HANDLE
// =============================================================================

/// Caller's side of a running coordinator.
pub struct CoordinatorHandle {
    identity: SessionId,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<Option<GameState>>,
    role: watch::Receiver<Role>,
    status: watch::Receiver<ConnectionStatus>,
    task: JoinHandle<()>,
}

impl CoordinatorHandle {
    /// Our session identity.
    pub fn identity(&self) -> &SessionId {
        &self.identity
    }

    /// Latest local state.
    pub fn get_state(&self) -> Option<GameState> {
        self.state.borrow().clone()
    }

    /// Receiver notified on every local state change.
    pub fn subscribe(&self) -> watch::Receiver<Option<GameState>> {
        self.state.clone()
    }

    /// Current role.
    pub fn role(&self) -> Role {
        *self.role.borrow()
    }

    /// Current link status.
    pub fn connection_status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Receiver notified on every link status change.
    pub fn status_updates(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Express an intent.
    pub async fn dispatch(&self, action: Action) -> Result<(), CoordinatorError> {
        self.commands
            .send(Command::Dispatch(action))
            .await
            .map_err(|_| CoordinatorError::Stopped)
    }

    /// Leave the room: announce it, forget the room, and stop.
    pub async fn leave(self) -> Result<(), CoordinatorError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(Command::Leave(ack_tx))
            .await
            .map_err(|_| CoordinatorError::Stopped)?;
        ack_rx.await.map_err(|_| CoordinatorError::Stopped)?;
        self.task.await?;
        Ok(())
    }

    /// Stop without announcing anything; the room sees us go silent.
    pub async fn shutdown(self) -> Result<(), CoordinatorError> {
        // A stopped task has already dropped its receiver; that is fine.
        let _ = self.commands.send(Command::Shutdown).await;
        self.task.await?;
        Ok(())
    }
}

// =============================================================================
// COORDINATOR TASK
// =============================================================================

/// The actor driving one peer.
pub struct Coordinator<T: Transport, S: SessionStore> {
    transport: Arc<T>,
    store: Arc<S>,
    config: PeerConfig,
    replica: Replica,
    commands: mpsc::Receiver<Command>,
    state_tx: watch::Sender<Option<GameState>>,
    role_tx: watch::Sender<Role>,
    status_tx: watch::Sender<ConnectionStatus>,
    /// Envelopes produced while the link was down.
    pending: Vec<Envelope>,
    cached_version: Option<u64>,
}

impl<T: Transport, S: SessionStore> Coordinator<T, S> {
    /// Start a peer for `context` and return its handle.
    pub fn spawn(transport: Arc<T>, store: Arc<S>, context: PeerContext, config: PeerConfig) -> CoordinatorHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (state_tx, state_rx) = watch::channel(None);
        let (role_tx, role_rx) = watch::channel(Role::Discovering);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);

        let last = LastRoom { room: context.room.clone(), player_name: context.player_name.clone() };
        if let Err(e) = store.set_last_room(&last) {
            warn!(error = %e, "Could not remember room");
        }

        let replica = Replica::new(
            context.identity.clone(),
            context.player_name,
            context.room,
            context.as_spectator,
            config.replica_config(),
        );

        let coordinator = Self {
            transport,
            store,
            config,
            replica,
            commands: command_rx,
            state_tx,
            role_tx,
            status_tx,
            pending: Vec::new(),
            cached_version: None,
        };
        let task = tokio::spawn(coordinator.run());

        CoordinatorHandle {
            identity: context.identity,
            commands: command_tx,
            state: state_rx,
            role: role_rx,
            status: status_rx,
            task,
        }
    }

    #[instrument(skip(self), fields(room = %self.replica.room(), peer = %self.replica.identity()))]
    async fn run(mut self) {
        let channel = self.replica.room().channel();
        let mut backoff = self.config.reconnect_backoff;
        let mut attempt: u32 = 0;

        loop {
            let status = if attempt == 0 { ConnectionStatus::Connecting } else { ConnectionStatus::Reconnecting };
            self.status_tx.send_replace(status);
            attempt += 1;

            let connected = timeout(
                self.config.connect_timeout,
                self.transport.connect(&channel, self.replica.identity()),
            )
            .await
            .unwrap_or(Err(TransportError::Timeout));

            let link = match connected {
                Ok(link) => link,
                Err(e) => {
                    warn!(error = %e, attempt, "Connect failed");
                    self.status_tx.send_replace(ConnectionStatus::Error);
                    if let Exit::Stopped = self.wait(backoff).await {
                        return;
                    }
                    backoff = (backoff * 2).min(self.config.max_reconnect_backoff);
                    continue;
                }
            };

            info!(attempt, "Connected");
            self.status_tx.send_replace(ConnectionStatus::Connected);
            backoff = self.config.reconnect_backoff;

            match self.session(link).await {
                Exit::Stopped => return,
                Exit::LinkLost => {
                    warn!("Link lost");
                    self.status_tx.send_replace(ConnectionStatus::Reconnecting);
                    if let Exit::Stopped = self.wait(backoff).await {
                        return;
                    }
                }
            }
        }
    }

    /// Sleep before a reconnect, still serving commands.
    async fn wait(&mut self, delay: Duration) -> Exit {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return Exit::LinkLost,
                command = self.commands.recv() => match command {
                    Some(Command::Dispatch(action)) => {
                        let out = self.replica.dispatch(action, now_ms());
                        self.pending.extend(out);
                        self.sync();
                    }
                    Some(Command::Leave(ack)) => {
                        let mut out = std::mem::take(&mut self.pending);
                        out.extend(self.replica.leave(now_ms()));
                        self.sync();
                        self.announce_leave(out).await;
                        self.forget_room();
                        let _ = ack.send(());
                        return Exit::Stopped;
                    }
                    Some(Command::Shutdown) | None => return Exit::Stopped,
                },
            }
        }
    }

    /// Deliver a leave produced while offline.
    ///
    /// Keeps reconnecting and re-sending, each time followed by a
    /// `RequestState`, until some other peer publishes a state that no
    /// longer seats us or `connect_timeout` runs out.
    async fn announce_leave(&self, mut envelopes: Vec<Envelope>) {
        let identity = self.replica.identity().clone();
        let channel = self.replica.room().channel();
        envelopes.push(Envelope::new(MessageBody::RequestState, identity.clone()));

        let deadline = Instant::now() + self.config.connect_timeout;
        let mut link: Option<Link> = None;

        while Instant::now() < deadline {
            if link.is_none() {
                match timeout_at(deadline, self.transport.connect(&channel, &identity)).await {
                    Ok(Ok(fresh)) => link = Some(fresh),
                    Ok(Err(e)) => debug!(error = %e, "Leave announcement waiting for link"),
                    Err(_) => break,
                }
            }

            if let Some(live) = link.as_mut() {
                if self.publish(live, envelopes.clone()).await.is_err() {
                    link = None;
                    continue;
                }
                match timeout(self.config.reconnect_backoff, released(live, &identity)).await {
                    Ok(true) => {
                        info!("Leave acknowledged");
                        return;
                    }
                    Ok(false) => link = None,
                    Err(_) => {}
                }
                continue;
            }

            sleep_until(deadline.min(Instant::now() + self.config.reconnect_backoff)).await;
        }
        warn!("Leave not acknowledged before timeout");
    }

    /// Serve one live link until it drops or we are told to stop.
    async fn session(&mut self, mut link: Link) -> Exit {
        let mut out = std::mem::take(&mut self.pending);
        out.extend(self.replica.on_connected(now_ms()));
        if self.publish(&link, out).await.is_err() {
            return Exit::LinkLost;
        }

        let discovery = sleep(self.config.discovery_window);
        tokio::pin!(discovery);
        let mut heartbeat = interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweep = interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let out = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Dispatch(action)) => self.replica.dispatch(action, now_ms()),
                    Some(Command::Leave(ack)) => {
                        let out = self.replica.leave(now_ms());
                        if let Err(e) = self.publish(&link, out).await {
                            warn!(error = %e, "Leave announcement not sent");
                        }
                        self.forget_room();
                        let _ = ack.send(());
                        return Exit::Stopped;
                    }
                    Some(Command::Shutdown) | None => {
                        info!("Shutting down");
                        return Exit::Stopped;
                    }
                },
                frame = link.recv() => match frame {
                    Some(text) => self.on_frame(&text),
                    None => return Exit::LinkLost,
                },
                _ = &mut discovery, if self.replica.is_discovering() => {
                    let cached = self.cached_state();
                    self.replica.on_discovery_timeout(now_ms(), cached, rand::random())
                }
                _ = heartbeat.tick() => self.replica.heartbeat(now_ms()),
                _ = sweep.tick() => self.replica.tick(now_ms()),
            };

            self.sync();
            if self.publish(&link, out).await.is_err() {
                return Exit::LinkLost;
            }
        }
    }

    fn on_frame(&mut self, text: &str) -> Vec<Envelope> {
        match Envelope::decode(text) {
            Ok(envelope) => {
                debug!(kind = envelope.kind(), sender = %envelope.sender_id, version = ?envelope.version, "Received");
                self.replica.handle(envelope, now_ms())
            }
            Err(e) => {
                warn!(error = %e, "Discarding inbound message");
                Vec::new()
            }
        }
    }

    async fn publish(&self, link: &Link, envelopes: Vec<Envelope>) -> Result<(), TransportError> {
        for envelope in envelopes {
            match envelope.encode() {
                Ok(frame) => {
                    if let MessageBody::State(_) = envelope.body {
                        debug!(version = ?envelope.version, "Publishing snapshot");
                    }
                    link.publish(frame).await?;
                }
                Err(e) => warn!(error = %e, kind = envelope.kind(), "Could not encode envelope"),
            }
        }
        Ok(())
    }

    /// Push replica changes to the watch channels and the store.
    fn sync(&mut self) {
        let state = self.replica.state();
        self.state_tx.send_if_modified(|current| {
            if current.as_ref() == state {
                return false;
            }
            *current = state.cloned();
            true
        });

        let role = self.replica.role();
        self.role_tx.send_if_modified(|current| {
            let changed = *current != role;
            *current = role;
            changed
        });

        let version = self.replica.confirmed_version();
        if self.replica.is_speculative() || self.cached_version == Some(version) {
            return;
        }
        if let Some(state) = self.replica.state() {
            match self.store.cache_state(self.replica.room(), state) {
                Ok(()) => self.cached_version = Some(version),
                Err(e) => warn!(error = %e, "Could not cache state"),
            }
        }
    }

    fn cached_state(&self) -> Option<GameState> {
        match self.store.cached_state(self.replica.room()) {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable cached state");
                None
            }
        }
    }

    fn forget_room(&self) {
        if let Err(e) = self.store.clear_last_room() {
            warn!(error = %e, "Could not clear last room");
        }
    }
}

/// Read frames until another peer publishes a state with no seat or
/// spectator entry for `identity`. `false` when the link closes.
async fn released(link: &mut Link, identity: &SessionId) -> bool {
    while let Some(text) = link.recv().await {
        let Ok(envelope) = Envelope::decode(&text) else {
            continue;
        };
        if &envelope.sender_id == identity {
            continue;
        }
        if let MessageBody::State(snapshot) = &envelope.body {
            let state = &snapshot.state;
            if state.slot_of(identity).is_none() && !state.is_spectator(identity) {
                return true;
            }
        }
    }
    false
}

// =============================================================================
// ROOM PROBE
// =============================================================================

/// Does `room` currently have a host? Publishes a probe and waits up to
/// `window` for an acknowledgement.
pub async fn room_exists<T: Transport + ?Sized>(
    transport: &T,
    room: &RoomCode,
    window: Duration,
) -> Result<bool, TransportError> {
    let prober = SessionId::generate();
    let mut link = transport.connect(&room.channel(), &prober).await?;
    let probe = Envelope::new(MessageBody::PresenceHostProbe, prober.clone());
    let frame = probe.encode().map_err(|e| TransportError::Unavailable(e.to_string()))?;
    link.publish(frame).await?;

    let answered = timeout(window, async {
        while let Some(text) = link.recv().await {
            if let Ok(envelope) = Envelope::decode(&text) {
                if envelope.body == MessageBody::PresenceHostAck {
                    return true;
                }
            }
        }
        false
    })
    .await;

    Ok(answered.unwrap_or(false))
}
