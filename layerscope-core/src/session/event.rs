//! Session event notification.
//!
//! Renderers and other consumers subscribe to an [`EventBus`] and receive
//! [`SessionEvent`]s. Publishing never blocks the pipeline: each subscriber
//! holds at most `capacity` undelivered packet events, and packet events
//! beyond that are dropped for that subscriber and counted. Lifecycle events
//! are always delivered, in order with the packet events around them.
//! Subscribers that have gone away are pruned on the next emit.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::trace;

use crate::layer::PacketStack;
use crate::stream::StreamLayer;

use super::SessionState;

/// Events emitted by the session factory and sessions.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A session was created and is idle.
    SessionCreated { session: u64, target: String },
    /// A packet finished the pipeline. Stream layers completed by this
    /// packet's bytes follow the stack, in stream order.
    PacketDissected {
        session: u64,
        packet: Arc<PacketStack>,
        stream_layers: Vec<Arc<StreamLayer>>,
    },
    /// A stream layer was completed. Always follows the `PacketDissected`
    /// event of the packet that completed it.
    StreamLayerCompleted {
        session: u64,
        layer: Arc<StreamLayer>,
    },
    /// The session moved between lifecycle states.
    StateChanged {
        session: u64,
        from: SessionState,
        to: SessionState,
    },
    /// The capture queue overflowed and dropped its oldest packet.
    PacketDropped {
        session: u64,
        /// Packets dropped by this overflow.
        dropped: u64,
        /// Packets dropped by the session so far.
        total: u64,
    },
    /// The capture source failed; a `StateChanged` to `Failed` follows.
    CaptureError { session: u64, message: String },
}

impl SessionEvent {
    /// Event name, as used by subscribers that dispatch on strings.
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::SessionCreated { .. } => "session-created",
            SessionEvent::PacketDissected { .. } => "packet-dissected",
            SessionEvent::StreamLayerCompleted { .. } => "stream-layer-completed",
            SessionEvent::StateChanged { .. } => "session-state-changed",
            SessionEvent::PacketDropped { .. } => "packet-dropped",
            SessionEvent::CaptureError { .. } => "capture-error",
        }
    }

    /// Packet-rate events, subject to a subscriber's backlog limit.
    pub fn is_bulk(&self) -> bool {
        matches!(
            self,
            SessionEvent::PacketDissected { .. }
                | SessionEvent::StreamLayerCompleted { .. }
                | SessionEvent::PacketDropped { .. }
        )
    }

    /// The session the event belongs to.
    pub fn session(&self) -> u64 {
        match self {
            SessionEvent::SessionCreated { session, .. }
            | SessionEvent::PacketDissected { session, .. }
            | SessionEvent::StreamLayerCompleted { session, .. }
            | SessionEvent::StateChanged { session, .. }
            | SessionEvent::PacketDropped { session, .. }
            | SessionEvent::CaptureError { session, .. } => *session,
        }
    }
}

/// Packet events a subscriber may leave unread before new ones are dropped.
pub const DEFAULT_EVENT_CAPACITY: usize = 4096;

/// Undelivered packet events and drops, shared by a subscriber and the bus.
#[derive(Debug, Default)]
struct Backlog {
    queued: AtomicUsize,
    dropped: AtomicU64,
}

/// Receiving end of a subscription.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
    backlog: Arc<Backlog>,
}

impl Subscription {
    /// Receive the next event; `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        let event = self.rx.recv().await?;
        Some(self.delivered(event))
    }

    /// Receive an event if one is ready.
    pub fn try_recv(&mut self) -> Result<SessionEvent, TryRecvError> {
        self.rx.try_recv().map(|event| self.delivered(event))
    }

    /// Packet events this subscriber missed because its backlog was full.
    pub fn dropped(&self) -> u64 {
        self.backlog.dropped.load(Ordering::Relaxed)
    }

    fn delivered(&self, event: SessionEvent) -> SessionEvent {
        if event.is_bulk() {
            self.backlog.queued.fetch_sub(1, Ordering::AcqRel);
        }
        event
    }
}

struct Subscriber {
    session: Option<u64>,
    tx: mpsc::UnboundedSender<SessionEvent>,
    backlog: Arc<Backlog>,
}

/// Fan-out of session events to subscribers.
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bus whose subscribers each hold at most `capacity` unread packet events.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Receive every event.
    pub fn subscribe(&self) -> Subscription {
        self.add(None)
    }

    /// Receive only events of one session.
    pub fn subscribe_session(&self, session: u64) -> Subscription {
        self.add(Some(session))
    }

    fn add(&self, session: Option<u64>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let backlog = Arc::new(Backlog::default());
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber {
                session,
                tx,
                backlog: Arc::clone(&backlog),
            });
        Subscription { rx, backlog }
    }

    /// Deliver an event to every interested subscriber.
    ///
    /// Returns the number of subscribers that missed the event because their
    /// backlog was full.
    pub fn emit(&self, event: SessionEvent) -> usize {
        let id = event.session();
        let bulk = event.is_bulk();
        let mut missed = 0;
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|s| {
            if s.session.is_some_and(|wanted| wanted != id) {
                return !s.tx.is_closed();
            }
            if bulk {
                if s.backlog.queued.load(Ordering::Acquire) >= self.capacity {
                    if s.tx.is_closed() {
                        return false;
                    }
                    s.backlog.dropped.fetch_add(1, Ordering::Relaxed);
                    missed += 1;
                    return true;
                }
                // Counted before sending so the receiver never sees it negative
                s.backlog.queued.fetch_add(1, Ordering::AcqRel);
            }
            s.tx.send(event.clone()).is_ok()
        });
        if missed > 0 {
            trace!(session = id, event = event.name(), missed, "Subscriber backlog full");
        }
        missed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("capacity", &self.capacity)
            .finish()
    }
}
