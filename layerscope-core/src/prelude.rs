//! Convenient re-exports for common usage.
//!
//! # Example
//!
//! ```rust
//! use layerscope_core::prelude::*;
//!
//! let registry = DissectorRegistry::new(std::sync::Arc::new(TokenRegistry::new()));
//! register_builtins(&registry).unwrap();
//! ```

// Tokens, attributes and layers
pub use crate::attr::{Attr, Value};
pub use crate::layer::{Layer, PacketStack};
pub use crate::token::TokenRegistry;

// Dissectors
pub use crate::dissector::builtin::register_builtins;
pub use crate::dissector::{DissectContext, Dissection, Dissector, DissectorRegistry};
pub use crate::stream::{StreamContext, StreamDissection, StreamDissector, StreamLayer};

// Sessions
pub use crate::filter::Filter;
pub use crate::session::{
    CaptureParameters, Session, SessionEvent, SessionFactory, SessionState, SessionStats,
};

// Error types
pub use crate::error::{Error, Result};
