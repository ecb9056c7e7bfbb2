//! Stream reassembly and stream dissection.
//!
//! Packets that belong to the same conversation are aggregated here so
//! that protocols spanning several packets can be dissected as one byte
//! stream.
//!
//! ## Components
//!
//! - [`StreamKey`] / [`StreamId`] - Normalized conversation keys and directions
//! - [`StreamTag`] - Marks a packet layer as carrying stream payload
//! - [`StreamBuffer`] - Reorders segments into a contiguous byte stream
//! - [`StreamManager`] - Keyed buffers, memory ceilings, dissection loop
//! - [`StreamDissector`] - Trait for dissectors over reassembled bytes
//!
//! Stream layers belong to the stream, not to a packet: a layer is
//! reported alongside the packet whose bytes completed it, which may be
//! many packets after the bytes it covers arrived.

mod dissector;
mod key;
mod manager;
mod reassembly;

pub use dissector::{StreamContext, StreamDissection, StreamDissector, StreamLayer};
pub use key::{Direction, Endpoint, StreamFlags, StreamId, StreamKey, StreamTag};
pub use manager::{ReassemblyStats, StreamConfig, StreamManager};
pub use reassembly::{StreamBuffer, StreamStats};
