use std::collections::BTreeMap;

/// A segment waiting for the bytes in front of it.
#[derive(Debug, Clone)]
struct Segment {
    seq: u32,
    data: Vec<u8>,
}

/// Buffer for one direction of a stream.
///
/// Segments with sequence numbers are reordered: in-order data is appended
/// to the contiguous buffer, later data waits in `pending`, and data the
/// buffer has already seen is trimmed. Segments without sequence numbers are
/// appended in arrival order.
///
/// The watermark counts bytes already handed to stream dissectors and
/// consumed; it is the stream offset of the first contiguous byte.
#[derive(Debug, Default)]
pub struct StreamBuffer {
    /// Next expected sequence number.
    expected_seq: Option<u32>,
    /// Out-of-order segments waiting to be reassembled.
    pending: BTreeMap<u32, Segment>,
    pending_bytes: usize,
    /// Contiguous reassembled data ready for dissection.
    reassembled: Vec<u8>,
    /// Bytes already dissected and consumed.
    watermark: u64,
    /// Number of stream layers produced so far.
    layers: u64,
    segment_count: u32,
    retransmit_count: u32,
    out_of_order_count: u32,
    closed: bool,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial sequence number from an opening segment.
    ///
    /// The opening segment consumes one sequence number.
    pub fn set_initial_seq(&mut self, seq: u32) {
        if self.expected_seq.is_none() {
            self.expected_seq = Some(seq.wrapping_add(1));
        }
    }

    /// Add payload bytes.
    pub fn add(&mut self, seq: Option<u32>, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.segment_count += 1;
        let seq = match seq {
            Some(seq) => seq,
            None => {
                self.reassembled.extend_from_slice(data);
                return;
            }
        };

        // Fast path: in-order with nothing pending
        let expected = *self.expected_seq.get_or_insert(seq);
        if seq == expected && self.pending.is_empty() {
            self.reassembled.extend_from_slice(data);
            self.expected_seq = Some(seq_add(seq, data.len()));
            return;
        }

        let seg_end = seq_add(seq, data.len());
        if seq_lt(seq, expected) {
            if seq_le(seg_end, expected) {
                self.retransmit_count += 1;
                return;
            }
            // Partial overlap - keep only the new tail
            let overlap = expected.wrapping_sub(seq) as usize;
            self.insert(expected, &data[overlap..]);
            return;
        }
        self.insert(seq, data);
    }

    fn insert(&mut self, seq: u32, data: &[u8]) {
        let Some(expected) = self.expected_seq else {
            return;
        };
        if seq == expected {
            self.reassembled.extend_from_slice(data);
            self.expected_seq = Some(seq_add(seq, data.len()));
            self.flush_pending();
        } else if !self.pending.contains_key(&seq) {
            self.out_of_order_count += 1;
            self.pending_bytes += data.len();
            self.pending.insert(
                seq,
                Segment {
                    seq,
                    data: data.to_vec(),
                },
            );
        } else {
            self.retransmit_count += 1;
        }
    }

    /// Move pending segments that are now in order into the contiguous buffer.
    ///
    /// Pending keys are raw sequence numbers, so the next segment is the one
    /// nearest `expected` in sequence space, not the smallest key.
    fn flush_pending(&mut self) {
        while let Some(expected) = self.expected_seq {
            let Some(seq) = self
                .pending
                .keys()
                .copied()
                .min_by_key(|seq| seq.wrapping_sub(expected) as i32)
            else {
                break;
            };
            if seq_lt(expected, seq) {
                // Gap - can't continue
                break;
            }
            let Some(segment) = self.pending.remove(&seq) else {
                break;
            };
            self.pending_bytes -= segment.data.len();
            let seg_end = seq_add(segment.seq, segment.data.len());
            if seq_lt(expected, seg_end) {
                let overlap = expected.wrapping_sub(segment.seq) as usize;
                self.reassembled.extend_from_slice(&segment.data[overlap..]);
                self.expected_seq = Some(seg_end);
            } else {
                self.retransmit_count += 1;
            }
        }
    }

    /// Contiguous bytes not yet consumed.
    pub fn contiguous(&self) -> &[u8] {
        &self.reassembled
    }

    /// Consume bytes from the front after a successful dissection.
    pub fn consume(&mut self, bytes: usize) {
        let bytes = bytes.min(self.reassembled.len());
        self.reassembled.drain(..bytes);
        self.watermark += bytes as u64;
    }

    /// Bytes available for dissection.
    pub fn available(&self) -> usize {
        self.reassembled.len()
    }

    /// Bytes held in memory, contiguous and pending.
    pub fn buffered(&self) -> usize {
        self.reassembled.len() + self.pending_bytes
    }

    /// Stream offset of the first contiguous byte.
    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    pub(crate) fn next_layer_sequence(&mut self) -> u64 {
        self.layers += 1;
        self.layers
    }

    pub fn layers_emitted(&self) -> u64 {
        self.layers
    }

    pub fn mark_closed(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            segment_count: self.segment_count,
            retransmit_count: self.retransmit_count,
            out_of_order_count: self.out_of_order_count,
            pending_segments: self.pending.len(),
            bytes_available: self.available(),
            bytes_dissected: self.watermark,
        }
    }
}

/// Per-direction stream statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStats {
    pub segment_count: u32,
    pub retransmit_count: u32,
    pub out_of_order_count: u32,
    pub pending_segments: usize,
    pub bytes_available: usize,
    pub bytes_dissected: u64,
}

// Sequence number comparison helpers
fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

fn seq_add(a: u32, n: usize) -> u32 {
    a.wrapping_add(n as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test 1: In-order segment reassembly
    #[test]
    fn test_in_order_reassembly() {
        let mut buffer = StreamBuffer::new();
        buffer.add(Some(1000), b"Hello");
        buffer.add(Some(1005), b" World");
        assert_eq!(buffer.contiguous(), b"Hello World");
    }

    // Test 2: Out-of-order segment reordering
    #[test]
    fn test_out_of_order_reordering() {
        let mut buffer = StreamBuffer::new();
        buffer.set_initial_seq(999);
        buffer.add(Some(1005), b" World");
        assert_eq!(buffer.contiguous(), b"");
        assert_eq!(buffer.buffered(), 6);
        buffer.add(Some(1000), b"Hello");
        assert_eq!(buffer.contiguous(), b"Hello World");
        assert_eq!(buffer.stats().out_of_order_count, 1);
        assert_eq!(buffer.stats().pending_segments, 0);
    }

    // Test 3: Pure retransmissions are dropped
    #[test]
    fn test_retransmit_ignored() {
        let mut buffer = StreamBuffer::new();
        buffer.add(Some(1000), b"Hello");
        buffer.add(Some(1000), b"Hello");
        assert_eq!(buffer.contiguous(), b"Hello");
        assert_eq!(buffer.stats().retransmit_count, 1);
    }

    // Test 4: Partial overlap keeps only new bytes
    #[test]
    fn test_partial_overlap_trimmed() {
        let mut buffer = StreamBuffer::new();
        buffer.add(Some(1000), b"Hello");
        buffer.add(Some(1003), b"lo World");
        assert_eq!(buffer.contiguous(), b"Hello World");
    }

    // Test 5: Sequence wraparound
    #[test]
    fn test_sequence_wraparound() {
        let mut buffer = StreamBuffer::new();
        buffer.add(Some(u32::MAX - 2), b"abc");
        buffer.add(Some(0), b"def");
        assert_eq!(buffer.contiguous(), b"abcdef");
    }

    // Test 6: Unsequenced data appends in arrival order
    #[test]
    fn test_unsequenced_append() {
        let mut buffer = StreamBuffer::new();
        buffer.add(None, b"ab");
        buffer.add(None, b"cd");
        assert_eq!(buffer.contiguous(), b"abcd");
    }

    // Test 7: Consume advances the watermark
    #[test]
    fn test_consume_watermark() {
        let mut buffer = StreamBuffer::new();
        buffer.add(None, b"GET / HTTP/1.1\r\n");
        buffer.consume(4);
        assert_eq!(buffer.contiguous(), b"/ HTTP/1.1\r\n");
        assert_eq!(buffer.watermark(), 4);
        buffer.consume(1000);
        assert_eq!(buffer.available(), 0);
        assert_eq!(buffer.watermark(), 16);
    }

    // Test 8: Pending segments drain across sequence wraparound
    #[test]
    fn test_pending_across_wraparound() {
        let mut buffer = StreamBuffer::new();
        buffer.set_initial_seq(u32::MAX - 3);
        buffer.add(Some(u32::MAX - 1), b"BBB");
        buffer.add(Some(1), b"CC");
        assert_eq!(buffer.available(), 0);
        assert_eq!(buffer.stats().pending_segments, 2);

        buffer.add(Some(u32::MAX - 2), b"A");
        assert_eq!(buffer.contiguous(), b"ABBBCC");
        assert_eq!(buffer.stats().pending_segments, 0);
        assert_eq!(buffer.buffered(), 6);
    }
}
