//! Session factory and capture parameters.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::info;

use crate::capture::{
    CaptureDriver, CaptureTarget, DefaultDriver, OpenOptions, OverflowPolicy, DEFAULT_SNAPLEN,
};
use crate::dissector::DissectorRegistry;
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::stream::StreamConfig;

use super::event::{EventBus, SessionEvent};
use super::pending::{join_error, Pending};
use super::{Session, Setup};

/// Default capture queue bound, in packets.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Per-session tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Packets buffered between capture and dissection.
    pub queue_capacity: usize,
    /// Overflow handling; `None` picks `DropOldest` for live capture and
    /// `Block` for replay.
    pub overflow: Option<OverflowPolicy>,
    pub stream: StreamConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            overflow: None,
            stream: StreamConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Overflow policy in effect for a target.
    pub fn overflow_for(&self, target: &CaptureTarget) -> OverflowPolicy {
        self.overflow.unwrap_or(if target.is_live() {
            OverflowPolicy::DropOldest
        } else {
            OverflowPolicy::Block
        })
    }
}

/// What a session captures from, and how.
///
/// Exactly one source must be set: a live interface, a capture file, or
/// in-memory frames.
#[derive(Debug, Clone, Default)]
pub struct CaptureParameters {
    interface: Option<String>,
    file: Option<PathBuf>,
    frames: Option<(u32, Vec<Bytes>)>,
    filter: Option<String>,
    native_filter: Option<String>,
    promiscuous: bool,
    snaplen: Option<u32>,
    config: SessionConfig,
}

impl CaptureParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture live from an interface.
    pub fn interface(mut self, name: impl Into<String>) -> Self {
        self.interface = Some(name.into());
        self
    }

    /// Replay a pcap or pcapng file.
    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Replay frames held in memory.
    pub fn frames(mut self, link_type: u32, frames: impl IntoIterator<Item = Bytes>) -> Self {
        self.frames = Some((link_type, frames.into_iter().collect()));
        self
    }

    /// Capture filter in the display filter grammar. Packets whose stack
    /// does not satisfy it are counted and not published.
    pub fn filter(mut self, expression: impl Into<String>) -> Self {
        self.filter = Some(expression.into());
        self
    }

    /// Native filter (BPF) handed to the live capture tool.
    pub fn native_filter(mut self, expression: impl Into<String>) -> Self {
        self.native_filter = Some(expression.into());
        self
    }

    pub fn promiscuous(mut self, promiscuous: bool) -> Self {
        self.promiscuous = promiscuous;
        self
    }

    pub fn snaplen(mut self, snaplen: u32) -> Self {
        self.snaplen = Some(snaplen);
        self
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Resolve the single capture source.
    pub fn target(&self) -> Result<CaptureTarget> {
        let invalid = |reason: &str| Error::InvalidParameters {
            reason: reason.to_string(),
        };
        let sources = [
            self.interface.is_some(),
            self.file.is_some(),
            self.frames.is_some(),
        ];
        match sources.iter().filter(|s| **s).count() {
            0 => return Err(invalid("neither a live interface nor a file source was given")),
            1 => {}
            _ => return Err(invalid("only one capture source may be given")),
        }

        if let Some(name) = &self.interface {
            let name = name.trim();
            if name.is_empty() {
                return Err(invalid("interface name is empty"));
            }
            return Ok(CaptureTarget::Interface(name.to_string()));
        }
        if let Some(path) = &self.file {
            if path.as_os_str().is_empty() {
                return Err(invalid("file path is empty"));
            }
            return Ok(CaptureTarget::File(path.clone()));
        }
        match &self.frames {
            Some((link_type, frames)) => Ok(CaptureTarget::Frames {
                link_type: *link_type,
                frames: frames.clone(),
            }),
            None => Err(invalid("neither a live interface nor a file source was given")),
        }
    }

    fn open_options(&self) -> OpenOptions {
        OpenOptions {
            filter: self.native_filter.clone(),
            promiscuous: self.promiscuous,
            snaplen: self.snaplen.unwrap_or(DEFAULT_SNAPLEN),
        }
    }
}

/// Builds sessions from the current registry contents.
///
/// Each session gets the registry snapshot current at its creation, so
/// later registrations never affect it.
#[derive(Clone)]
pub struct SessionFactory {
    registry: Arc<DissectorRegistry>,
    driver: Arc<dyn CaptureDriver>,
    events: EventBus,
    next_id: Arc<AtomicU64>,
}

impl SessionFactory {
    /// Factory using the [`DefaultDriver`].
    pub fn new(registry: Arc<DissectorRegistry>) -> Self {
        Self {
            registry,
            driver: Arc::new(DefaultDriver::default()),
            events: EventBus::new(),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Limit each subscriber to `capacity` unread packet events.
    ///
    /// Replaces the event bus, so call it before subscribing.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.events = EventBus::with_capacity(capacity);
        self
    }

    /// Replace the capture driver.
    pub fn with_driver<D: CaptureDriver + 'static>(mut self, driver: D) -> Self {
        self.driver = Arc::new(driver);
        self
    }

    /// Events of every session created by this factory.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn registry(&self) -> &Arc<DissectorRegistry> {
        &self.registry
    }

    /// Validate parameters and build an idle session.
    ///
    /// Files and in-memory frames are opened here, off the async executor.
    /// Live devices are opened by [`Session::start`].
    pub async fn create(&self, params: CaptureParameters) -> Result<Session> {
        let target = params.target()?;
        let filter = params.filter.as_deref().map(Filter::compile).transpose()?;
        let options = params.open_options();
        let snapshot = self.registry.snapshot();

        let replay = if target.is_live() {
            None
        } else {
            let driver = Arc::clone(&self.driver);
            let (target, options) = (target.clone(), options.clone());
            let handle = tokio::task::spawn_blocking(move || driver.open(&target, &options))
                .await
                .map_err(join_error)??;
            Some(handle)
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        info!(session = id, target = %target, "Session created");
        let session = Session::new(Setup {
            id,
            target: target.clone(),
            options,
            snapshot,
            filter,
            config: params.config,
            driver: Arc::clone(&self.driver),
            events: self.events.clone(),
            replay,
        });
        self.events.emit(SessionEvent::SessionCreated {
            session: id,
            target: target.to_string(),
        });
        Ok(session)
    }

    /// [`create`](Self::create) as a cancellable task.
    pub fn spawn_create(&self, params: CaptureParameters) -> Pending<Session> {
        let factory = self.clone();
        Pending::spawn(async move { factory.create(params).await })
    }
}

impl std::fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFactory")
            .field("registry", &self.registry.snapshot())
            .field("events", &self.events)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterError;
    use crate::token::TokenRegistry;

    fn factory() -> SessionFactory {
        SessionFactory::new(Arc::new(DissectorRegistry::new(Arc::new(TokenRegistry::new()))))
    }

    // Test 1: Exactly one source is required
    #[test]
    fn test_target_validation() {
        let err = CaptureParameters::new().target().unwrap_err();
        assert!(matches!(err, Error::InvalidParameters { .. }));

        let err = CaptureParameters::new().interface("  ").target().unwrap_err();
        assert!(matches!(err, Error::InvalidParameters { .. }));

        let err = CaptureParameters::new()
            .interface("eth0")
            .file("a.pcap")
            .target()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameters { .. }));

        let target = CaptureParameters::new().interface(" eth0 ").target().unwrap();
        assert_eq!(target, CaptureTarget::Interface("eth0".to_string()));
    }

    // Test 2: Overflow policy follows the source kind
    #[test]
    fn test_overflow_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(
            config.overflow_for(&CaptureTarget::Interface("eth0".into())),
            OverflowPolicy::DropOldest
        );
        assert_eq!(
            config.overflow_for(&CaptureTarget::File("a.pcap".into())),
            OverflowPolicy::Block
        );
    }

    // Test 3: Rejections construct no session
    #[tokio::test]
    async fn test_create_rejections() {
        let factory = factory();
        let mut events = factory.events().subscribe();

        let err = factory.create(CaptureParameters::new()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidParameters { .. }));

        let err = factory
            .create(CaptureParameters::new().interface("eth0").filter("tcp =="))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedFilter(_)));

        let deep = format!("{}ipv4", "!".repeat(200_000));
        let err = factory
            .create(CaptureParameters::new().interface("eth0").filter(&deep))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::UnsupportedFilter(FilterError::TooDeep { .. })
        ));

        assert!(events.try_recv().is_err());
    }

    // Test 4: Created sessions are idle and announced
    #[tokio::test]
    async fn test_create_live_session() {
        let factory = factory();
        let mut events = factory.events().subscribe();
        let session = factory
            .spawn_create(CaptureParameters::new().interface("eth0").promiscuous(true))
            .wait()
            .await
            .unwrap();
        assert_eq!(session.state(), crate::session::SessionState::Idle);
        let event = events.try_recv().unwrap();
        assert_eq!(event.name(), "session-created");
        assert_eq!(event.session(), session.id());
    }
}
