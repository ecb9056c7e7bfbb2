//! Capture sessions.
//!
//! This module provides:
//! - [`SessionFactory`] building sessions from registry snapshots
//! - [`Session`] owning the capture lifecycle and the packet feed
//! - [`EventBus`] publishing [`SessionEvent`]s to subscribers
//!
//! ## Lifecycle
//!
//! ```text
//! Idle --start/replay--> Running --stop / end of file--> Stopped
//!                           |
//!                           +--capture error--> Failed
//! ```
//!
//! A running session has two blocking workers: a producer reading frames
//! from the capture source into a bounded [`FrameQueue`], and a consumer
//! running the dissection pipeline and publishing events. State changes
//! after the workers exit are made by a supervisor task, so each session
//! transitions out of `Running` exactly once.

mod event;
mod factory;
mod pending;
mod state;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::capture::{
    CaptureDriver, CaptureHandle, CaptureTarget, FrameQueue, Interrupter, OpenOptions, PushOutcome,
    RawFrame,
};
use crate::dissector::{Pipeline, Snapshot};
use crate::error::{Error, Result};
use crate::filter::Filter;

pub use event::{EventBus, SessionEvent, Subscription, DEFAULT_EVENT_CAPACITY};
pub use factory::{CaptureParameters, SessionConfig, SessionFactory, DEFAULT_QUEUE_CAPACITY};
pub use pending::Pending;
pub use state::SessionState;

/// Counters of a session's packet flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Frames read from the capture source.
    pub received: u64,
    /// Frames run through the pipeline.
    pub dissected: u64,
    /// Frames dropped by queue overflow.
    pub dropped: u64,
    /// Dissected frames rejected by the capture filter.
    pub filtered: u64,
    /// Stream layers produced.
    pub stream_layers: u64,
    /// Corrupt layers, packet and stream.
    pub corrupt_layers: u64,
    /// Packet events subscribers missed because their backlog was full,
    /// counted once per subscriber.
    pub events_dropped: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    dissected: AtomicU64,
    dropped: AtomicU64,
    filtered: AtomicU64,
    stream_layers: AtomicU64,
    corrupt_layers: AtomicU64,
    events_dropped: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> SessionStats {
        SessionStats {
            received: self.received.load(Ordering::Relaxed),
            dissected: self.dissected.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            stream_layers: self.stream_layers.load(Ordering::Relaxed),
            corrupt_layers: self.corrupt_layers.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Mutable lifecycle state, guarded by one lock.
struct Control {
    state: SessionState,
    /// A live device is being opened.
    opening: bool,
    /// `stop` was requested while running.
    stopping: bool,
    /// Source opened at creation, for replay.
    replay: Option<Box<dyn CaptureHandle>>,
    interrupter: Option<Interrupter>,
    queue: Option<Arc<FrameQueue<RawFrame>>>,
    /// First unrecoverable capture error.
    failure: Option<String>,
}

/// Everything the factory hands to a new session.
pub(crate) struct Setup {
    pub id: u64,
    pub target: CaptureTarget,
    pub options: OpenOptions,
    pub snapshot: Arc<Snapshot>,
    pub filter: Option<Filter>,
    pub config: SessionConfig,
    pub driver: Arc<dyn CaptureDriver>,
    pub events: EventBus,
    pub replay: Option<Box<dyn CaptureHandle>>,
}

struct Shared {
    id: u64,
    target: CaptureTarget,
    options: OpenOptions,
    snapshot: Arc<Snapshot>,
    filter: Option<Filter>,
    config: SessionConfig,
    driver: Arc<dyn CaptureDriver>,
    events: EventBus,
    control: Mutex<Control>,
    state_tx: watch::Sender<SessionState>,
    counters: Counters,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `to`, publishing the change. Callers hold the control lock.
    fn transition(&self, control: &mut Control, to: SessionState) {
        let from = control.state;
        if from == to {
            return;
        }
        control.state = to;
        info!(session = self.id, %from, %to, "Session state changed");
        self.events.emit(SessionEvent::StateChanged {
            session: self.id,
            from,
            to,
        });
        self.state_tx.send_replace(to);
    }
}

/// A capture session.
///
/// Created idle by [`SessionFactory::create`]. Live sessions run with
/// [`start`](Self::start); file and in-memory sessions with
/// [`replay`](Self::replay). Dropping a running session interrupts its
/// capture.
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    pub(crate) fn new(setup: Setup) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Self {
            shared: Arc::new(Shared {
                id: setup.id,
                target: setup.target,
                options: setup.options,
                snapshot: setup.snapshot,
                filter: setup.filter,
                config: setup.config,
                driver: setup.driver,
                events: setup.events,
                control: Mutex::new(Control {
                    state: SessionState::Idle,
                    opening: false,
                    stopping: false,
                    replay: setup.replay,
                    interrupter: None,
                    queue: None,
                    failure: None,
                }),
                state_tx,
                counters: Counters::default(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn target(&self) -> &CaptureTarget {
        &self.shared.target
    }

    /// The registry snapshot this session dissects with.
    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.shared.snapshot
    }

    pub fn filter(&self) -> Option<&Filter> {
        self.shared.filter.as_ref()
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.counters.snapshot()
    }

    /// The capture error that failed the session, if any.
    pub fn failure(&self) -> Option<String> {
        self.shared.lock().failure.clone()
    }

    /// Events of this session only.
    pub fn subscribe(&self) -> Subscription {
        self.shared.events.subscribe_session(self.shared.id)
    }

    /// Open the live device and begin delivering packets.
    ///
    /// Legal only for an idle live session. Fails with
    /// [`Error::PermissionDenied`] or [`Error::DeviceUnavailable`] when the
    /// device cannot be opened, leaving the session idle. Dropping the
    /// future before it completes also leaves the session idle.
    pub async fn start(&self) -> Result<()> {
        open_and_launch(&self.shared).await
    }

    /// [`start`](Self::start) as a cancellable task.
    pub fn spawn_start(&self) -> Pending<()> {
        let shared = Arc::clone(&self.shared);
        Pending::spawn(async move { open_and_launch(&shared).await })
    }

    /// Begin replaying the file or in-memory frames opened at creation.
    ///
    /// The session runs until the source is exhausted and then stops; end
    /// of file is not an error.
    pub async fn replay(&self) -> Result<()> {
        let shared = &self.shared;
        let mut control = shared.lock();
        check_startable(shared.id, control.state, "replay")?;
        let Some(handle) = control.replay.take() else {
            return Err(Error::InvalidState {
                operation: "replay",
                state: control.state,
            });
        };
        launch(shared, &mut control, handle);
        Ok(())
    }

    /// Stop capturing.
    ///
    /// Releases the source, discards queued packets, dissociates partially
    /// reassembled streams and waits for the session to reach a terminal
    /// state. Idempotent: stopping a stopped or failed session does nothing.
    pub async fn stop(&self) -> Result<()> {
        let shared = &self.shared;
        let (interrupter, queue) = {
            let mut control = shared.lock();
            match control.state {
                SessionState::Stopped | SessionState::Failed => return Ok(()),
                SessionState::Idle => {
                    control.replay = None;
                    shared.transition(&mut control, SessionState::Stopped);
                    return Ok(());
                }
                SessionState::Running => {
                    control.stopping = true;
                    (control.interrupter.clone(), control.queue.clone())
                }
            }
        };
        debug!(session = shared.id, "Stopping session");
        if let Some(interrupt) = interrupter {
            interrupt();
        }
        if let Some(queue) = queue {
            queue.abandon();
        }
        self.wait().await;
        Ok(())
    }

    /// Wait until the session is stopped or failed, returning the final
    /// state. Never completes for a session that is never run or stopped.
    pub async fn wait(&self) -> SessionState {
        let mut rx = self.shared.state_tx.subscribe();
        let result = rx.wait_for(|state| state.is_terminal()).await.map(|s| *s);
        match result {
            Ok(state) => state,
            // The sender lives as long as the session
            Err(_) => self.state(),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let control = self.shared.lock();
        if control.state != SessionState::Running {
            return;
        }
        debug!(session = self.shared.id, "Session dropped while running; interrupting capture");
        if let Some(interrupt) = &control.interrupter {
            interrupt();
        }
        if let Some(queue) = &control.queue {
            queue.abandon();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("target", &self.shared.target)
            .field("state", &self.state())
            .finish()
    }
}

/// Resets the opening flag however `start` ends.
struct OpeningGuard<'a>(&'a Shared);

impl Drop for OpeningGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().opening = false;
    }
}

fn check_startable(id: u64, state: SessionState, operation: &'static str) -> Result<()> {
    match state {
        SessionState::Idle => Ok(()),
        SessionState::Failed => Err(Error::SessionFailed { id }),
        state => Err(Error::InvalidState { operation, state }),
    }
}

/// Open the live device off the executor, then launch the workers.
async fn open_and_launch(shared: &Arc<Shared>) -> Result<()> {
    {
        let mut control = shared.lock();
        check_startable(shared.id, control.state, "start")?;
        if !shared.target.is_live() || control.opening {
            return Err(Error::InvalidState {
                operation: "start",
                state: control.state,
            });
        }
        control.opening = true;
    }
    let _opening = OpeningGuard(shared);

    let driver = Arc::clone(&shared.driver);
    let (target, options) = (shared.target.clone(), shared.options.clone());
    let handle = tokio::task::spawn_blocking(move || driver.open(&target, &options))
        .await
        .map_err(pending::join_error)?
        .inspect_err(|e| warn!(session = shared.id, error = %e, "Failed to open capture device"))?;

    // No suspension point from here on
    let mut control = shared.lock();
    if control.state != SessionState::Idle {
        // Stopped while the device was opening; the handle closes on drop
        return Err(Error::InvalidState {
            operation: "start",
            state: control.state,
        });
    }
    launch(shared, &mut control, handle);
    Ok(())
}

/// Spawn the workers over an open source and enter `Running`.
fn launch(shared: &Arc<Shared>, control: &mut Control, handle: Box<dyn CaptureHandle>) {
    let policy = shared.config.overflow_for(&shared.target);
    let queue = Arc::new(FrameQueue::new(shared.config.queue_capacity, policy));
    debug!(
        session = shared.id,
        capacity = queue.capacity(),
        ?policy,
        link_type = handle.link_type(),
        "Launching capture"
    );
    control.interrupter = Some(handle.interrupter());
    control.queue = Some(Arc::clone(&queue));
    shared.transition(control, SessionState::Running);

    let producer = {
        let shared = Arc::clone(shared);
        let queue = Arc::clone(&queue);
        tokio::task::spawn_blocking(move || produce(&shared, handle, &queue))
    };
    let consumer = {
        let shared = Arc::clone(shared);
        tokio::task::spawn_blocking(move || consume(&shared, &queue))
    };

    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        let producer = producer.await;
        let consumer = consumer.await;
        let mut control = shared.lock();
        if let Err(e) = producer.and(consumer) {
            // A worker panicked; treat it as a capture failure
            control.failure.get_or_insert_with(|| e.to_string());
        }
        control.interrupter = None;
        control.queue = None;
        let to = match &control.failure {
            Some(_) if !control.stopping => SessionState::Failed,
            _ => SessionState::Stopped,
        };
        shared.transition(&mut control, to);
    });
}

/// Read frames into the queue until the source ends, fails or the queue closes.
fn produce(shared: &Shared, mut handle: Box<dyn CaptureHandle>, queue: &FrameQueue<RawFrame>) {
    let counters = &shared.counters;
    loop {
        match handle.next_frame() {
            Ok(Some(frame)) => {
                counters.received.fetch_add(1, Ordering::Relaxed);
                match queue.push(frame) {
                    PushOutcome::Queued => {}
                    PushOutcome::DroppedOldest => {
                        let total = counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        debug!(session = shared.id, total, "Capture queue full, dropped oldest packet");
                        let missed = shared.events.emit(SessionEvent::PacketDropped {
                            session: shared.id,
                            dropped: 1,
                            total,
                        });
                        counters.events_dropped.fetch_add(missed as u64, Ordering::Relaxed);
                    }
                    PushOutcome::Closed => break,
                }
            }
            Ok(None) => {
                debug!(session = shared.id, "Capture source exhausted");
                break;
            }
            Err(e) => {
                let stopping = {
                    let mut control = shared.lock();
                    if !control.stopping {
                        control.failure.get_or_insert_with(|| e.to_string());
                    }
                    control.stopping
                };
                if !stopping {
                    warn!(session = shared.id, error = %e, "Capture failed");
                    shared.events.emit(SessionEvent::CaptureError {
                        session: shared.id,
                        message: e.to_string(),
                    });
                }
                break;
            }
        }
    }
    handle.close();
    queue.close();
}

/// Dissect queued frames and publish them in arrival order.
fn consume(shared: &Shared, queue: &FrameQueue<RawFrame>) {
    let counters = &shared.counters;
    let mut pipeline = Pipeline::new(Arc::clone(&shared.snapshot), shared.config.stream.clone());

    while let Some(frame) = queue.pop() {
        let result = pipeline.process(&frame);
        counters.dissected.fetch_add(1, Ordering::Relaxed);

        let corrupt = result.packet.layers.iter().filter(|l| l.is_corrupt()).count()
            + result.stream_layers.iter().filter(|s| s.layer.is_corrupt()).count();
        counters.corrupt_layers.fetch_add(corrupt as u64, Ordering::Relaxed);
        counters
            .stream_layers
            .fetch_add(result.stream_layers.len() as u64, Ordering::Relaxed);

        // Stream layers are published even when their packet is filtered out.
        let stream_layers: Vec<_> = result.stream_layers.into_iter().map(Arc::new).collect();
        let keep = shared
            .filter
            .as_ref()
            .map_or(true, |f| f.matches_with_streams(&result.packet, &stream_layers));
        let mut missed = 0;
        if keep {
            missed += shared.events.emit(SessionEvent::PacketDissected {
                session: shared.id,
                packet: Arc::new(result.packet),
                stream_layers: stream_layers.clone(),
            });
        } else {
            counters.filtered.fetch_add(1, Ordering::Relaxed);
        }
        for layer in stream_layers {
            missed += shared.events.emit(SessionEvent::StreamLayerCompleted {
                session: shared.id,
                layer,
            });
        }
        counters.events_dropped.fetch_add(missed as u64, Ordering::Relaxed);
    }

    let dissociated = pipeline.flush();
    if dissociated > 0 {
        debug!(session = shared.id, streams = dissociated, "Dissociated partial streams");
    }
}
