//! Dissector registry and snapshots.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::error::Result;
use crate::stream::StreamDissector;
use crate::token::TokenRegistry;

use super::Dissector;

/// Immutable copy of the registry's three dissector collections.
///
/// Sessions hold a snapshot for their whole life, so registrations made
/// after a session was created never affect it.
#[derive(Clone)]
pub struct Snapshot {
    link_layers: Vec<Arc<dyn Dissector>>,
    dissectors: Vec<Arc<dyn Dissector>>,
    stream_dissectors: Vec<Arc<dyn StreamDissector>>,
    tokens: Arc<TokenRegistry>,
}

impl Snapshot {
    fn empty(tokens: Arc<TokenRegistry>) -> Self {
        Self {
            link_layers: Vec::new(),
            dissectors: Vec::new(),
            stream_dissectors: Vec::new(),
            tokens,
        }
    }

    /// Link-layer dissectors in registration order.
    pub fn link_layers(&self) -> &[Arc<dyn Dissector>] {
        &self.link_layers
    }

    /// Packet dissectors in registration order.
    pub fn dissectors(&self) -> &[Arc<dyn Dissector>] {
        &self.dissectors
    }

    /// Stream dissectors in registration order.
    pub fn stream_dissectors(&self) -> &[Arc<dyn StreamDissector>] {
        &self.stream_dissectors
    }

    pub fn tokens(&self) -> &Arc<TokenRegistry> {
        &self.tokens
    }

    /// Names of all dissectors: link layers, packet, stream.
    pub fn names(&self) -> (Vec<&'static str>, Vec<&'static str>, Vec<&'static str>) {
        (
            self.link_layers.iter().map(|d| d.name()).collect(),
            self.dissectors.iter().map(|d| d.name()).collect(),
            self.stream_dissectors.iter().map(|d| d.name()).collect(),
        )
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (link_layers, dissectors, stream_dissectors) = self.names();
        f.debug_struct("Snapshot")
            .field("link_layers", &link_layers)
            .field("dissectors", &dissectors)
            .field("stream_dissectors", &stream_dissectors)
            .finish()
    }
}

/// Registry of available dissectors.
///
/// Mutation is serialized and copy-on-write: each registration publishes a
/// new [`Snapshot`], and [`snapshot`](Self::snapshot) hands out the current
/// one without blocking registrations for longer than a pointer swap.
pub struct DissectorRegistry {
    tokens: Arc<TokenRegistry>,
    current: RwLock<Arc<Snapshot>>,
}

impl DissectorRegistry {
    /// Create an empty registry registering tokens into `tokens`.
    pub fn new(tokens: Arc<TokenRegistry>) -> Self {
        Self {
            current: RwLock::new(Arc::new(Snapshot::empty(Arc::clone(&tokens)))),
            tokens,
        }
    }

    /// Register a link-layer dissector.
    pub fn register_link_layer<D: Dissector + 'static>(&self, dissector: D) -> Result<()> {
        self.tokens.register_all(dissector.tokens())?;
        debug!(dissector = dissector.name(), "Registered link-layer dissector");
        self.update(|s| s.link_layers.push(Arc::new(dissector)));
        Ok(())
    }

    /// Register a packet dissector.
    pub fn register_dissector<D: Dissector + 'static>(&self, dissector: D) -> Result<()> {
        self.tokens.register_all(dissector.tokens())?;
        debug!(dissector = dissector.name(), "Registered dissector");
        self.update(|s| s.dissectors.push(Arc::new(dissector)));
        Ok(())
    }

    /// Register a stream dissector.
    pub fn register_stream_dissector<D: StreamDissector + 'static>(
        &self,
        dissector: D,
    ) -> Result<()> {
        self.tokens.register_all(dissector.tokens())?;
        debug!(dissector = dissector.name(), "Registered stream dissector");
        self.update(|s| s.stream_dissectors.push(Arc::new(dissector)));
        Ok(())
    }

    fn update(&self, f: impl FnOnce(&mut Snapshot)) {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Snapshot::clone(&current);
        f(&mut next);
        *current = Arc::new(next);
    }

    /// The current registry contents.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        let current = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&*current)
    }

    pub fn tokens(&self) -> &Arc<TokenRegistry> {
        &self.tokens
    }
}
