use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::dissector::guarded;
use crate::layer::Layer;
use crate::token::TokenRegistry;

use super::{
    StreamBuffer, StreamContext, StreamDissection, StreamDissector, StreamId, StreamLayer,
    StreamStats, StreamTag,
};

/// Configuration for the StreamManager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Maximum memory per stream direction (bytes).
    pub max_stream_buffer: usize,
    /// Maximum total memory for all streams.
    pub max_total_memory: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_stream_buffer: 16 * 1024 * 1024, // 16 MB per stream
            max_total_memory: 256 * 1024 * 1024, // 256 MB total
        }
    }
}

/// Counters kept by the stream manager.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReassemblyStats {
    pub streams_opened: u64,
    /// Removed after the transport signalled close or abort.
    pub streams_closed: u64,
    /// Removed because a memory ceiling was exceeded.
    pub streams_evicted: u64,
    /// Dissociated when the session ended.
    pub streams_flushed: u64,
    pub bytes_evicted: u64,
}

/// Keyed reassembly buffers for one session.
///
/// Owned by the session's single ingestion path, so it needs no locking.
pub struct StreamManager {
    buffers: HashMap<StreamId, StreamBuffer>,
    config: StreamConfig,
    /// Current total memory usage.
    total_memory: usize,
    stats: ReassemblyStats,
}

impl StreamManager {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            buffers: HashMap::new(),
            config,
            total_memory: 0,
            stats: ReassemblyStats::default(),
        }
    }

    /// Add a segment's payload to its stream and run stream dissectors.
    ///
    /// Returns stream layers completed by this segment, in stream order.
    pub fn process_segment(
        &mut self,
        tag: &StreamTag,
        payload: &[u8],
        packet_index: u64,
        dissectors: &[Arc<dyn StreamDissector>],
        tokens: &TokenRegistry,
    ) -> Vec<StreamLayer> {
        let mut layers = Vec::new();
        let id = &tag.id;

        // 1. Get or create the buffer
        if !self.buffers.contains_key(id) {
            self.stats.streams_opened += 1;
            debug!(stream = %id, "Opened stream");
        }
        let buffer = self.buffers.entry(id.clone()).or_default();
        let before = buffer.buffered();

        // 2. Add payload
        let mut sequence = tag.sequence;
        if tag.flags.open {
            if let Some(seq) = sequence {
                buffer.set_initial_seq(seq);
                sequence = Some(seq.wrapping_add(1));
            }
        }
        buffer.add(sequence, payload);
        if tag.flags.close || tag.flags.abort {
            buffer.mark_closed();
        }

        // 3. Dissect whatever is now contiguous
        if buffer.buffered() <= self.config.max_stream_buffer {
            dissect_available(id, buffer, packet_index, dissectors, tokens, &mut layers);
        }
        let after = buffer.buffered();
        self.total_memory = (self.total_memory + after).saturating_sub(before);

        // 4. Enforce memory ceilings
        if after > self.config.max_stream_buffer {
            warn!(
                stream = %id,
                buffered = after,
                limit = self.config.max_stream_buffer,
                "Stream buffer limit exceeded, evicting stream"
            );
            self.evict(id);
        }
        while self.total_memory > self.config.max_total_memory {
            let Some(largest) = self
                .buffers
                .iter()
                .max_by_key(|(_, b)| b.buffered())
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            warn!(
                stream = %largest,
                total = self.total_memory,
                limit = self.config.max_total_memory,
                "Total stream memory limit exceeded, evicting largest stream"
            );
            self.evict(&largest);
        }

        // 5. Handle termination
        if tag.flags.abort {
            self.close(id, "aborted");
            self.close(&reverse(id), "aborted");
        } else if tag.flags.close {
            if let Some(buffer) = self.buffers.get_mut(id) {
                buffer.mark_closed();
            }
            let reverse = reverse(id);
            let peer_closed = self.buffers.get(&reverse).is_some_and(|b| b.is_closed());
            if peer_closed {
                self.close(id, "closed");
                self.close(&reverse, "closed");
            }
        }

        layers
    }

    fn evict(&mut self, id: &StreamId) {
        if let Some(buffer) = self.buffers.remove(id) {
            self.total_memory = self.total_memory.saturating_sub(buffer.buffered());
            self.stats.streams_evicted += 1;
            self.stats.bytes_evicted += buffer.buffered() as u64;
        }
    }

    fn close(&mut self, id: &StreamId, reason: &'static str) {
        if let Some(buffer) = self.buffers.remove(id) {
            self.total_memory = self.total_memory.saturating_sub(buffer.buffered());
            self.stats.streams_closed += 1;
            debug!(
                stream = %id,
                reason,
                undissected = buffer.buffered(),
                "Removed stream"
            );
        }
    }

    /// Dissociate every pending stream without dissecting it.
    ///
    /// Returns the number of streams released.
    pub fn flush(&mut self) -> usize {
        let count = self.buffers.len();
        for (id, buffer) in self.buffers.drain() {
            if buffer.buffered() > 0 {
                debug!(
                    stream = %id,
                    undissected = buffer.buffered(),
                    "Dissociating partial stream"
                );
            }
        }
        self.total_memory = 0;
        self.stats.streams_flushed += count as u64;
        count
    }

    /// Number of streams currently buffered.
    pub fn active_streams(&self) -> usize {
        self.buffers.len()
    }

    /// Bytes currently held across all streams.
    pub fn total_memory(&self) -> usize {
        self.total_memory
    }

    pub fn stream_stats(&self, id: &StreamId) -> Option<StreamStats> {
        self.buffers.get(id).map(|b| b.stats())
    }

    pub fn stats(&self) -> &ReassemblyStats {
        &self.stats
    }
}

fn reverse(id: &StreamId) -> StreamId {
    StreamId {
        key: id.key.clone(),
        direction: id.direction.reverse(),
    }
}

/// Run stream dissectors until the buffer is drained or they need more data.
fn dissect_available(
    id: &StreamId,
    buffer: &mut StreamBuffer,
    packet_index: u64,
    dissectors: &[Arc<dyn StreamDissector>],
    tokens: &TokenRegistry,
    layers: &mut Vec<StreamLayer>,
) {
    'stream: loop {
        let available = buffer.available();
        if available == 0 {
            break;
        }

        let context = StreamContext {
            id,
            bytes_dissected: buffer.watermark(),
            layers_dissected: buffer.layers_emitted(),
            closed: buffer.is_closed(),
            tokens,
        };

        let mut produced = None;
        for dissector in dissectors {
            if available < dissector.min_len() || !dissector.accepts(&context) {
                continue;
            }
            let data = buffer.contiguous();
            match guarded(dissector.name(), || dissector.dissect(data, &context)) {
                Ok(StreamDissection::Layer { layer, consumed }) => {
                    produced = Some((layer, consumed.clamp(1, available)));
                    break;
                }
                Ok(StreamDissection::NeedMore { .. }) => break 'stream,
                Ok(StreamDissection::Decline) => continue,
                Err(err) => {
                    warn!(stream = %id, error = %err, "Stream dissector fault");
                    let layer = Layer::corrupt(dissector.name(), 0..available, data, err.to_string());
                    produced = Some((layer, available));
                    break;
                }
            }
        }

        // No dissector for this stream
        let Some((mut layer, consumed)) = produced else {
            break;
        };

        let offset = buffer.watermark();
        layer.clamp(consumed);
        layer.rebase(offset as usize);
        let sequence = buffer.next_layer_sequence();
        buffer.consume(consumed);
        layers.push(StreamLayer {
            stream: id.clone(),
            sequence,
            packet_index,
            stream_range: offset..offset + consumed as u64,
            layer,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DissectError;
    use crate::stream::{Endpoint, StreamFlags};
    use std::net::{IpAddr, Ipv4Addr};

    /// Emits one layer per newline-terminated line.
    struct LineDissector;

    impl StreamDissector for LineDissector {
        fn name(&self) -> &'static str {
            "line"
        }

        fn min_len(&self) -> usize {
            2
        }

        fn accepts(&self, _: &StreamContext<'_>) -> bool {
            true
        }

        fn dissect(
            &self,
            data: &[u8],
            _: &StreamContext<'_>,
        ) -> Result<StreamDissection, DissectError> {
            match data.iter().position(|&b| b == b'\n') {
                Some(end) => Ok(StreamDissection::Layer {
                    layer: Layer::new("line", 0..end + 1),
                    consumed: end + 1,
                }),
                None => Ok(StreamDissection::NeedMore { minimum: None }),
            }
        }
    }

    fn tag(src_port: u16, dst_port: u16) -> StreamTag {
        let a = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let b = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        let (src, dst) = if src_port < dst_port { (a, b) } else { (b, a) };
        StreamTag::new("tcp", Endpoint::ip(src, src_port), Endpoint::ip(dst, dst_port))
    }

    fn dissectors() -> Vec<Arc<dyn StreamDissector>> {
        vec![Arc::new(LineDissector)]
    }

    // Test 1: Layers complete only when enough bytes arrive
    #[test]
    fn test_layers_across_segments() {
        let tokens = TokenRegistry::new();
        let mut manager = StreamManager::new(StreamConfig::default());
        let t = tag(1000, 80).with_sequence(100);

        let layers = manager.process_segment(&t, b"hel", 1, &dissectors(), &tokens);
        assert!(layers.is_empty());

        let t = tag(1000, 80).with_sequence(103);
        let layers = manager.process_segment(&t, b"lo\nwor", 2, &dissectors(), &tokens);
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].packet_index, 2);
        assert_eq!(layers[0].stream_range, 0..6);
        assert_eq!(layers[0].sequence, 1);

        let t = tag(1000, 80).with_sequence(109);
        let layers = manager.process_segment(&t, b"ld\n", 3, &dissectors(), &tokens);
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].stream_range, 6..12);
        assert_eq!(layers[0].layer.range(), 6..12);
        assert_eq!(layers[0].sequence, 2);
    }

    // Test 2: Streams below the minimum length are never dissected
    #[test]
    fn test_min_len_guard() {
        let tokens = TokenRegistry::new();
        let mut manager = StreamManager::new(StreamConfig::default());
        let layers = manager.process_segment(&tag(1000, 80), b"\n", 1, &dissectors(), &tokens);
        assert!(layers.is_empty());
        assert_eq!(manager.active_streams(), 1);
    }

    // Test 3: Close from both directions removes the conversation
    #[test]
    fn test_close_both_directions() {
        let tokens = TokenRegistry::new();
        let mut manager = StreamManager::new(StreamConfig::default());
        let close = StreamFlags {
            close: true,
            ..Default::default()
        };
        manager.process_segment(&tag(1000, 80).with_flags(close), b"", 1, &dissectors(), &tokens);
        assert_eq!(manager.active_streams(), 1);
        manager.process_segment(&tag(80, 1000).with_flags(close), b"", 2, &dissectors(), &tokens);
        assert_eq!(manager.active_streams(), 0);
        assert_eq!(manager.stats().streams_closed, 2);
    }

    // Test 4: Abort removes both directions immediately
    #[test]
    fn test_abort() {
        let tokens = TokenRegistry::new();
        let mut manager = StreamManager::new(StreamConfig::default());
        manager.process_segment(&tag(1000, 80), b"x", 1, &dissectors(), &tokens);
        manager.process_segment(&tag(80, 1000), b"y", 2, &dissectors(), &tokens);
        let abort = StreamFlags {
            abort: true,
            ..Default::default()
        };
        manager.process_segment(&tag(80, 1000).with_flags(abort), b"", 3, &dissectors(), &tokens);
        assert_eq!(manager.active_streams(), 0);
        assert_eq!(manager.total_memory(), 0);
    }

    // Test 5: Per-stream ceiling evicts the stream
    #[test]
    fn test_stream_limit_eviction() {
        let tokens = TokenRegistry::new();
        let config = StreamConfig {
            max_stream_buffer: 4,
            max_total_memory: 1024,
        };
        let mut manager = StreamManager::new(config);
        manager.process_segment(&tag(1000, 80), b"abcdefgh", 1, &dissectors(), &tokens);
        assert_eq!(manager.active_streams(), 0);
        assert_eq!(manager.stats().streams_evicted, 1);
        assert_eq!(manager.stats().bytes_evicted, 8);
    }

    // Test 6: Total ceiling evicts the largest stream
    #[test]
    fn test_total_limit_eviction() {
        let tokens = TokenRegistry::new();
        let config = StreamConfig {
            max_stream_buffer: 100,
            max_total_memory: 10,
        };
        let mut manager = StreamManager::new(config);
        manager.process_segment(&tag(1000, 80), b"abcdefg", 1, &dissectors(), &tokens);
        manager.process_segment(&tag(2000, 80), b"abcd", 2, &dissectors(), &tokens);
        assert_eq!(manager.active_streams(), 1);
        assert_eq!(manager.total_memory(), 4);
    }

    // Test 7: Flush dissociates without dissecting
    #[test]
    fn test_flush() {
        let tokens = TokenRegistry::new();
        let mut manager = StreamManager::new(StreamConfig::default());
        manager.process_segment(&tag(1000, 80), b"partial", 1, &dissectors(), &tokens);
        assert_eq!(manager.flush(), 1);
        assert_eq!(manager.active_streams(), 0);
        assert_eq!(manager.total_memory(), 0);
        assert_eq!(manager.stats().streams_flushed, 1);
    }

    // Test 8: Dissectors see the stream as closed on its final segment
    #[test]
    fn test_closed_context() {
        /// Takes whatever is left once the stream has ended.
        struct RestDissector;

        impl StreamDissector for RestDissector {
            fn name(&self) -> &'static str {
                "rest"
            }

            fn accepts(&self, _: &StreamContext<'_>) -> bool {
                true
            }

            fn dissect(
                &self,
                data: &[u8],
                context: &StreamContext<'_>,
            ) -> Result<StreamDissection, DissectError> {
                if !context.closed {
                    return Ok(StreamDissection::NeedMore { minimum: None });
                }
                Ok(StreamDissection::Layer {
                    layer: Layer::new("rest", 0..data.len()),
                    consumed: data.len(),
                })
            }
        }

        let tokens = TokenRegistry::new();
        let dissectors: Vec<Arc<dyn StreamDissector>> = vec![Arc::new(RestDissector)];
        let mut manager = StreamManager::new(StreamConfig::default());
        let layers = manager.process_segment(&tag(1000, 80), b"abc", 1, &dissectors, &tokens);
        assert!(layers.is_empty());

        let close = StreamFlags {
            close: true,
            ..Default::default()
        };
        let layers = manager.process_segment(&tag(1000, 80).with_flags(close), b"de", 2, &dissectors, &tokens);
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].stream_range, 0..5);
        assert_eq!(layers[0].packet_index, 2);
    }
}
