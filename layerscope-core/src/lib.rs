//! # layerscope-core
//!
//! Session assembly and dissector pipeline for packet analysis.
//!
//! This crate turns captured frames into layer stacks: ordered lists of
//! decoded protocol layers, each carrying a tree of typed attributes with
//! the byte ranges they were decoded from. It is independent of any user
//! interface; renderers subscribe to session events.
//!
//! ## Features
//!
//! - **Dissector Registry**: ordered link-layer, packet and stream dissectors,
//!   first accepting guard wins, copy-on-write snapshots per session
//! - **Fault Isolation**: dissector errors and panics become corrupt layers
//! - **Stream Reassembly**: sequence-ordered buffers with memory ceilings and
//!   stream dissectors over the reassembled bytes
//! - **Filters**: display filter expressions over attributes and layer tags
//! - **Capture Sources**: pcap/pcapng files, in-memory frames, and live
//!   capture through an external capture command
//! - **Sessions**: idle/running/stopped/failed lifecycle, bounded capture queue
//!   with overflow accounting, event notification
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use layerscope_core::prelude::*;
//!
//! # async fn run() -> layerscope_core::Result<()> {
//! let registry = DissectorRegistry::new(TokenRegistry::global());
//! register_builtins(&registry)?;
//! let factory = SessionFactory::new(Arc::new(registry));
//!
//! let session = factory
//!     .create(CaptureParameters::new().file("capture.pcap").filter("tcp.dstport == 80"))
//!     .await?;
//! let mut events = session.subscribe();
//! session.replay().await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         SessionEvent::PacketDissected { packet, .. } => println!("{:?}", packet.tags()),
//!         SessionEvent::StateChanged { to, .. } if to.is_terminal() => break,
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                        layerscope-core                              |
//! +---------------------------------------------------------------------+
//! |  token/      - identifier -> display name registry                  |
//! |  attr/       - Attr, Value                                          |
//! |  layer/      - Layer, PacketStack                                   |
//! |  dissector/  - Dissector trait, registry, pipeline, builtins        |
//! |  stream/     - stream keys, reassembly, stream dissectors           |
//! |  filter/     - filter grammar and evaluation                        |
//! |  capture/    - pcap reader, capture command, frame queue            |
//! |  session/    - factory, session lifecycle, events                   |
//! |  platform/   - live capture permission diagnostics                  |
//! |  error/      - Error types                                          |
//! +---------------------------------------------------------------------+
//! ```

pub mod attr;
pub mod capture;
pub mod dissector;
pub mod error;
pub mod filter;
pub mod layer;
pub mod platform;
pub mod prelude;
pub mod session;
pub mod stream;
pub mod token;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-export commonly used types at crate root for convenience
pub use attr::{Attr, Value};
pub use capture::{CaptureDriver, CaptureHandle, CaptureTarget, DefaultDriver, RawFrame};
pub use dissector::builtin::register_builtins;
pub use dissector::{
    fn_dissector, DissectContext, Dissection, Dissector, DissectorRegistry, Pipeline, Snapshot,
};
pub use error::{CaptureError, DissectError, Error, Result};
pub use filter::{Filter, FilterError};
pub use layer::{Layer, LayerStatus, PacketStack};
pub use platform::Permission;
pub use session::{
    CaptureParameters, EventBus, Pending, Session, SessionConfig, SessionEvent, SessionFactory,
    SessionState, SessionStats, Subscription, DEFAULT_EVENT_CAPACITY, DEFAULT_QUEUE_CAPACITY,
};
pub use stream::{StreamConfig, StreamDissection, StreamDissector, StreamLayer, StreamTag};
pub use token::{Token, TokenRegistry};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
