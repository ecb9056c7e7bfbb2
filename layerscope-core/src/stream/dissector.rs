use std::ops::Range;

use crate::error::DissectError;
use crate::layer::Layer;
use crate::token::TokenRegistry;

use super::{Direction, Endpoint, StreamId};

/// Context handed to stream dissectors.
#[derive(Debug, Clone, Copy)]
pub struct StreamContext<'a> {
    pub id: &'a StreamId,
    /// Bytes of this stream already dissected.
    pub bytes_dissected: u64,
    /// Stream layers already produced for this stream.
    pub layers_dissected: u64,
    /// No more bytes will arrive in this direction.
    pub closed: bool,
    pub tokens: &'a TokenRegistry,
}

impl StreamContext<'_> {
    /// Transport protocol carrying the stream.
    pub fn protocol(&self) -> &str {
        self.id.key.protocol()
    }

    pub fn direction(&self) -> Direction {
        self.id.direction
    }

    pub fn src(&self) -> &Endpoint {
        self.id.src()
    }

    pub fn dst(&self) -> &Endpoint {
        self.id.dst()
    }

    /// Whether either endpoint uses `port`.
    pub fn has_port(&self, port: u16) -> bool {
        self.src().port() == port || self.dst().port() == port
    }
}

/// Result of running a stream dissector over reassembled bytes.
#[derive(Debug, Clone)]
pub enum StreamDissection {
    /// A layer decoded from the first `consumed` bytes.
    Layer { layer: Layer, consumed: usize },
    /// The message is incomplete; wait for at least `minimum` bytes.
    NeedMore { minimum: Option<usize> },
    /// This stream doesn't match the dissector's protocol.
    Decline,
}

/// Dissector over reassembled stream payload.
///
/// Stream dissectors are attempted in registration order whenever a stream
/// holds at least [`min_len`](StreamDissector::min_len) bytes; the first
/// one that produces a layer or asks for more data wins.
pub trait StreamDissector: Send + Sync {
    /// Dissector name, also the tag of layers it produces.
    fn name(&self) -> &'static str;

    /// Smallest number of bytes worth attempting.
    fn min_len(&self) -> usize {
        1
    }

    /// Tokens for the identifiers this dissector emits.
    fn tokens(&self) -> &[(&'static str, &'static str)] {
        &[]
    }

    /// Quick check before dissection (port, protocol).
    fn accepts(&self, context: &StreamContext<'_>) -> bool;

    /// Dissect from the start of `data`.
    ///
    /// Layer ranges are relative to `data`; the stream manager rebases them
    /// to stream offsets.
    fn dissect(
        &self,
        data: &[u8],
        context: &StreamContext<'_>,
    ) -> Result<StreamDissection, DissectError>;
}

/// A layer decoded from a stream rather than a single packet.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamLayer {
    pub stream: StreamId,
    /// Position of this layer within its stream, starting at 1.
    pub sequence: u64,
    /// Packet whose bytes completed the layer.
    pub packet_index: u64,
    /// Stream offsets covered by the layer.
    pub stream_range: Range<u64>,
    pub layer: Layer,
}
