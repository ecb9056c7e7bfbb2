//! Dissector framework.
//!
//! This module provides:
//! - [`Dissector`] trait for link-layer and packet dissectors
//! - [`DissectorRegistry`] holding the three ordered dissector collections
//! - [`Pipeline`] running a registry snapshot over packets
//! - Built-in dissectors for common protocols ([`builtin`])
//!
//! Dissectors are attempted in registration order; the first one whose
//! guard accepts the input produces the child layer and the rest are
//! skipped for that position.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use layerscope_core::dissector::{fn_dissector, DissectorRegistry, Pipeline};
//! use layerscope_core::{Attr, Layer, TokenRegistry};
//!
//! let registry = DissectorRegistry::new(Arc::new(TokenRegistry::new()));
//! registry
//!     .register_link_layer(fn_dissector("raw", |_| true, |ctx| {
//!         Ok(Layer::new("raw", 0..ctx.data.len()).with_payload(0..ctx.data.len()))
//!     }))
//!     .unwrap();
//! registry
//!     .register_dissector(fn_dissector("ipv4", |ctx| ctx.data.first() == Some(&0x45), |ctx| {
//!         Ok(Layer::new("ipv4", 0..ctx.data.len()).with_attr(Attr::new("ipv4.version", 4u8, 0..1)))
//!     }))
//!     .unwrap();
//!
//! let pipeline = Pipeline::new(registry.snapshot(), Default::default());
//! let stack = pipeline.dissect_frame(1, 0, 101, &[0x45, 0x00, 0x00]);
//! assert_eq!(stack.tags(), vec!["raw", "ipv4"]);
//! ```

pub mod builtin;
mod pipeline;
mod registry;

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::error::DissectError;
use crate::layer::Layer;
use crate::token::TokenRegistry;

pub use pipeline::{PacketResult, Pipeline, MAX_DEPTH};
pub use registry::{DissectorRegistry, Snapshot};

/// Context handed to a dissector.
#[derive(Debug, Clone, Copy)]
pub struct DissectContext<'a> {
    /// Bytes to dissect: the whole frame for link-layer dissectors, the
    /// parent's payload otherwise.
    pub data: &'a [u8],
    /// Packet offset of `data[0]`.
    pub offset: usize,
    /// Link type of the frame.
    pub link_type: u32,
    /// Layers produced so far, outermost first. Ranges are packet offsets.
    pub layers: &'a [Layer],
    pub tokens: &'a TokenRegistry,
}

impl<'a> DissectContext<'a> {
    /// The layer whose payload is being dissected.
    pub fn parent(&self) -> Option<&'a Layer> {
        self.layers.last()
    }

    /// Whether the parent layer has the given tag.
    pub fn parent_is(&self, tag: &str) -> bool {
        self.parent().is_some_and(|l| l.tag() == tag)
    }
}

/// Result of running a dissector.
#[derive(Debug, Clone)]
pub enum Dissection {
    /// A child layer, with ranges relative to the dissector's input.
    Layer(Layer),
    /// Not this protocol. Expected control flow, not an error.
    Decline,
}

/// Core trait all link-layer and packet dissectors implement.
pub trait Dissector: Send + Sync {
    /// Unique name, also the usual tag of produced layers (e.g. "tcp").
    fn name(&self) -> &'static str;

    /// Tokens for the identifiers this dissector emits. Registered with the
    /// dissector.
    fn tokens(&self) -> &[(&'static str, &'static str)] {
        &[]
    }

    /// Guard: whether this dissector wants the input at all.
    fn accepts(&self, context: &DissectContext<'_>) -> bool;

    /// Decode the input into one layer.
    fn dissect(&self, context: &DissectContext<'_>) -> Result<Dissection, DissectError>;
}

/// Build a dissector from a guard and a decode function.
///
/// Useful for small dissectors and tests.
pub fn fn_dissector<G, D>(name: &'static str, guard: G, decode: D) -> FnDissector<G, D>
where
    G: Fn(&DissectContext<'_>) -> bool + Send + Sync,
    D: Fn(&DissectContext<'_>) -> Result<Layer, DissectError> + Send + Sync,
{
    FnDissector {
        name,
        guard,
        decode,
    }
}

/// Dissector made of two closures; see [`fn_dissector`].
pub struct FnDissector<G, D> {
    name: &'static str,
    guard: G,
    decode: D,
}

impl<G, D> Dissector for FnDissector<G, D>
where
    G: Fn(&DissectContext<'_>) -> bool + Send + Sync,
    D: Fn(&DissectContext<'_>) -> Result<Layer, DissectError> + Send + Sync,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn accepts(&self, context: &DissectContext<'_>) -> bool {
        (self.guard)(context)
    }

    fn dissect(&self, context: &DissectContext<'_>) -> Result<Dissection, DissectError> {
        (self.decode)(context).map(Dissection::Layer)
    }
}

/// Run dissector code, turning a panic into [`DissectError::Panicked`].
pub(crate) fn guarded<T>(
    name: &'static str,
    f: impl FnOnce() -> Result<T, DissectError>,
) -> Result<T, DissectError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(DissectError::Panicked {
            dissector: name,
            message: panic_message(payload.as_ref()),
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
