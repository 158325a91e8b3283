//! Transport Abstraction
//!
//! The replication layer only needs a pub/sub channel per room with
//! at-least-once delivery. Delivery may duplicate or reorder, and every
//! subscriber (including the publisher) receives every frame.
//!
//! `InMemoryBus` is the in-process implementation used by the demo binary
//! and the tests. It can drop every live link and refuse new ones, which is
//! how reconnect behaviour is exercised.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::game::state::SessionId;
use crate::network::room::ChannelId;

/// Frames buffered per link and per channel.
pub const LINK_BUFFER: usize = 256;

/// A pub/sub transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Subscribe `client` to `channel`.
    async fn connect(&self, channel: &ChannelId, client: &SessionId) -> Result<Link, TransportError>;
}

/// One live subscription: publish outbound frames, receive inbound ones.
///
/// `recv` returning `None` means the link is gone and the caller should
/// reconnect.
pub struct Link {
    tx: mpsc::Sender<String>,
    rx: mpsc::Receiver<String>,
}

impl Link {
    /// Build a link from its two halves.
    pub fn new(tx: mpsc::Sender<String>, rx: mpsc::Receiver<String>) -> Self {
        Self { tx, rx }
    }

    /// Publish a frame to the channel.
    pub async fn publish(&self, frame: String) -> Result<(), TransportError> {
        self.tx.send(frame).await.map_err(|_| TransportError::Closed)
    }

    /// Next inbound frame.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// Transport failures. Recovered by reconnecting, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The broker refused or could not be reached.
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    /// Connecting took longer than allowed.
    #[error("Connection timed out")]
    Timeout,

    /// The link was closed underneath us.
    #[error("Link closed")]
    Closed,
}

// =============================================================================
// IN-MEMORY BUS
// =============================================================================

/// In-process broadcast transport.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    channels: Mutex<BTreeMap<ChannelId, broadcast::Sender<String>>>,
    /// Bumped to sever every live link.
    epoch: watch::Sender<u64>,
    unavailable: AtomicBool,
    duplicate: AtomicBool,
}

impl Default for BusInner {
    fn default() -> Self {
        Self {
            channels: Mutex::new(BTreeMap::new()),
            epoch: watch::channel(0).0,
            unavailable: AtomicBool::new(false),
            duplicate: AtomicBool::new(false),
        }
    }
}

impl InMemoryBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver every frame twice from now on (or stop doing so).
    pub fn set_duplicate_delivery(&self, on: bool) {
        self.inner.duplicate.store(on, Ordering::SeqCst);
    }

    /// Refuse new connections (or accept them again).
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Sever every live link.
    pub fn disconnect_all(&self) {
        self.inner.epoch.send_modify(|epoch| *epoch += 1);
    }

    fn channel_sender(&self, channel: &ChannelId) -> broadcast::Sender<String> {
        let mut channels = match self.inner.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        channels
            .entry(channel.clone())
            .or_insert_with(|| broadcast::channel(LINK_BUFFER).0)
            .clone()
    }
}

#[async_trait]
impl Transport for InMemoryBus {
    async fn connect(&self, channel: &ChannelId, client: &SessionId) -> Result<Link, TransportError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("bus offline".to_string()));
        }

        let bus_tx = self.channel_sender(channel);
        let mut bus_rx = bus_tx.subscribe();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(LINK_BUFFER);
        let (in_tx, in_rx) = mpsc::channel::<String>(LINK_BUFFER);

        let mut epoch = self.inner.epoch.subscribe();
        epoch.borrow_and_update();

        let inner = Arc::clone(&self.inner);
        let client = client.clone();
        let channel = channel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = epoch.changed() => {
                        debug!(%client, %channel, "Link severed");
                        break;
                    }
                    outgoing = out_rx.recv() => match outgoing {
                        Some(frame) => {
                            // No subscribers is fine; the frame is just lost.
                            let _ = bus_tx.send(frame);
                        }
                        None => break,
                    },
                    incoming = bus_rx.recv() => match incoming {
                        Ok(frame) => {
                            let copies = if inner.duplicate.load(Ordering::SeqCst) { 2 } else { 1 };
                            for _ in 0..copies {
                                if in_tx.send(frame.clone()).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(%client, skipped, "Subscriber lagged, frames dropped");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });

        Ok(Link::new(out_tx, in_rx))
    }
}
