//! The per-packet dissection pipeline.

use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;

use crate::capture::RawFrame;
use crate::layer::{Layer, LayerStatus, PacketStack};
use crate::stream::{StreamConfig, StreamLayer, StreamManager};

use super::{guarded, DissectContext, Dissection, Dissector, Snapshot};

/// Maximum number of layers in one packet stack.
pub const MAX_DEPTH: usize = 64;

/// Output of the pipeline for one packet.
#[derive(Debug, Clone)]
pub struct PacketResult {
    pub packet: PacketStack,
    /// Stream layers completed by this packet's bytes, in stream order.
    pub stream_layers: Vec<StreamLayer>,
}

/// Runs a registry snapshot over packets.
///
/// Packet dissection depends only on the frame and the snapshot; stream
/// dissection additionally depends on earlier packets of the same stream,
/// which are held in the pipeline's own [`StreamManager`].
pub struct Pipeline {
    snapshot: Arc<Snapshot>,
    streams: StreamManager,
}

impl Pipeline {
    pub fn new(snapshot: Arc<Snapshot>, config: StreamConfig) -> Self {
        Self {
            snapshot,
            streams: StreamManager::new(config),
        }
    }

    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.snapshot
    }

    pub fn streams(&self) -> &StreamManager {
        &self.streams
    }

    /// Run link-layer and packet dissectors over one frame.
    pub fn dissect_frame(
        &self,
        index: u64,
        timestamp_ns: i64,
        link_type: u32,
        data: &[u8],
    ) -> PacketStack {
        self.build_stack(
            index,
            timestamp_ns,
            link_type,
            data.len() as u32,
            Bytes::copy_from_slice(data),
        )
    }

    /// Run the full pipeline over a frame, including stream reassembly.
    pub fn process(&mut self, frame: &RawFrame) -> PacketResult {
        let packet = self.build_stack(
            frame.index,
            frame.timestamp_ns,
            frame.link_type,
            frame.original_len,
            frame.data.clone(),
        );

        let stream_dissectors = self.snapshot.stream_dissectors();
        let mut stream_layers = Vec::new();
        if !stream_dissectors.is_empty() {
            // Innermost stream-bearing layer feeds reassembly
            let carrier = packet
                .layers
                .iter()
                .rev()
                .find_map(|l| l.stream().map(|tag| (tag, l.payload())));
            if let Some((tag, payload)) = carrier {
                let bytes = packet.bytes(payload).unwrap_or_default();
                stream_layers = self.streams.process_segment(
                    tag,
                    bytes,
                    packet.index,
                    stream_dissectors,
                    self.snapshot.tokens(),
                );
            }
        }

        PacketResult {
            packet,
            stream_layers,
        }
    }

    /// Dissociate all partially reassembled streams.
    pub fn flush(&mut self) -> usize {
        self.streams.flush()
    }

    fn build_stack(
        &self,
        index: u64,
        timestamp_ns: i64,
        link_type: u32,
        original_len: u32,
        data: Bytes,
    ) -> PacketStack {
        let tokens = self.snapshot.tokens();
        let mut layers: Vec<Layer> = Vec::with_capacity(8);

        // 1. Link layer
        let context = DissectContext {
            data: &data,
            offset: 0,
            link_type,
            layers: &[],
            tokens,
        };
        let link = self
            .snapshot
            .link_layers()
            .iter()
            .find_map(|d| attempt(d.as_ref(), &context, index));
        match link {
            Some(layer) => layers.push(layer),
            None => {
                if !data.is_empty() {
                    layers.push(Layer::opaque(0..data.len(), &data));
                }
            }
        }

        // 2. Packet dissectors over the most recent payload
        while let Some(last) = layers.last() {
            if last.is_corrupt() || last.status() == &LayerStatus::Opaque {
                break;
            }
            let payload = last.payload();
            if payload.is_empty() {
                break;
            }
            let parent = layers.len() - 1;
            if layers.len() >= MAX_DEPTH {
                warn!(packet = index, depth = MAX_DEPTH, "Layer depth limit reached");
                let mut opaque = Layer::opaque(payload.clone(), &data[payload]);
                opaque.set_parent(Some(parent));
                layers.push(opaque);
                break;
            }

            let context = DissectContext {
                data: &data[payload.clone()],
                offset: payload.start,
                link_type,
                layers: &layers,
                tokens,
            };
            let child = self
                .snapshot
                .dissectors()
                .iter()
                .find_map(|d| attempt(d.as_ref(), &context, index));
            let mut layer = child.unwrap_or_else(|| Layer::opaque(payload.clone(), &data[payload]));
            layer.set_parent(Some(parent));
            layers.push(layer);
        }

        PacketStack {
            index,
            timestamp_ns,
            link_type,
            original_len,
            data,
            layers,
        }
    }
}

/// Run one dissector, catching faults.
///
/// Returns `None` when the dissector declines. A returned error or a panic
/// yields a corrupt layer holding the input bytes.
fn attempt(dissector: &dyn Dissector, context: &DissectContext<'_>, index: u64) -> Option<Layer> {
    let name = dissector.name();
    let result = guarded(name, || {
        if dissector.accepts(context) {
            dissector.dissect(context)
        } else {
            Ok(Dissection::Decline)
        }
    });
    let start = context.offset;
    let end = start + context.data.len();
    match result {
        Ok(Dissection::Layer(mut layer)) => {
            layer.clamp(context.data.len());
            layer.rebase(start);
            Some(layer)
        }
        Ok(Dissection::Decline) => None,
        Err(err) => {
            warn!(packet = index, dissector = name, error = %err, "Dissector fault, marking layer corrupt");
            Some(Layer::corrupt(name, start..end, context.data, err.to_string()))
        }
    }
}
