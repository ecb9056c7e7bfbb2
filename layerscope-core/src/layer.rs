//! Layers and per-packet layer stacks.
//!
//! A [`Layer`] is the output of one dissector invocation: a protocol tag, an
//! ordered list of [`Attr`]s, the byte range it covers and the payload range
//! left for the next dissector. The pipeline collects layers into a
//! [`PacketStack`], which owns them for the lifetime of the packet.
//!
//! Dissectors build layers with ranges relative to the bytes they were
//! handed; the pipeline rebases them to packet offsets before they are
//! stored.

use std::ops::Range;

use bytes::Bytes;
use compact_str::{format_compact, CompactString};

use crate::attr::{Attr, Value};
use crate::stream::StreamTag;

/// Tag of the opaque layer holding bytes no dissector accepted.
pub const PAYLOAD_TAG: &str = "payload";

/// Outcome of decoding a layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerStatus {
    /// Decoded normally.
    Complete,
    /// Undissected bytes; no dissector accepted them.
    Opaque,
    /// The dissector faulted; the layer holds its input as opaque bytes.
    Corrupt { reason: CompactString },
}

/// One decoded protocol level.
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    tag: CompactString,
    attrs: Vec<Attr>,
    range: Range<usize>,
    payload: Range<usize>,
    parent: Option<usize>,
    status: LayerStatus,
    stream: Option<StreamTag>,
}

impl Layer {
    /// Create a layer covering `range` with an empty payload at its end.
    pub fn new(tag: impl AsRef<str>, range: Range<usize>) -> Self {
        Self {
            tag: CompactString::new(tag.as_ref()),
            attrs: Vec::new(),
            payload: range.end..range.end,
            range,
            parent: None,
            status: LayerStatus::Complete,
            stream: None,
        }
    }

    /// Opaque layer over `data`, placed at `range`.
    pub fn opaque(range: Range<usize>, data: &[u8]) -> Self {
        let mut layer = Layer::new(PAYLOAD_TAG, range.clone());
        layer.status = LayerStatus::Opaque;
        layer.attrs.push(Attr::new(
            "payload.data",
            Value::bytes(data),
            range,
        ));
        layer
    }

    /// Corrupt layer for dissector `tag`, preserving its input bytes.
    pub fn corrupt(tag: &str, range: Range<usize>, data: &[u8], reason: impl AsRef<str>) -> Self {
        let mut layer = Layer::new(tag, range.clone());
        layer.status = LayerStatus::Corrupt {
            reason: CompactString::new(reason.as_ref()),
        };
        layer.attrs.push(Attr::new(
            format_compact!("{tag}.data"),
            Value::bytes(data),
            range,
        ));
        layer
    }

    /// Add an attribute.
    pub fn with_attr(mut self, attr: Attr) -> Self {
        self.attrs.push(attr);
        self
    }

    /// Add an attribute in place.
    pub fn push_attr(&mut self, attr: Attr) {
        self.attrs.push(attr);
    }

    /// Set the undissected payload range.
    pub fn with_payload(mut self, payload: Range<usize>) -> Self {
        self.payload = payload;
        self
    }

    /// Mark this layer as carrying a stream.
    pub fn with_stream(mut self, stream: StreamTag) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn attrs(&self) -> &[Attr] {
        &self.attrs
    }

    /// Bytes covered by this layer, including its payload.
    pub fn range(&self) -> Range<usize> {
        self.range.clone()
    }

    /// Bytes left for the next dissector.
    pub fn payload(&self) -> Range<usize> {
        self.payload.clone()
    }

    /// Index of the enclosing layer in the owning stack.
    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    pub fn status(&self) -> &LayerStatus {
        &self.status
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self.status, LayerStatus::Corrupt { .. })
    }

    pub fn stream(&self) -> Option<&StreamTag> {
        self.stream.as_ref()
    }

    /// Find an attribute anywhere in this layer's attribute trees.
    pub fn attr(&self, id: &str) -> Option<&Attr> {
        self.attrs.iter().find_map(|a| a.find(id))
    }

    /// All attributes of this layer, depth-first.
    pub fn walk(&self) -> impl Iterator<Item = &Attr> {
        self.attrs.iter().flat_map(|a| a.walk())
    }

    pub(crate) fn set_parent(&mut self, parent: Option<usize>) {
        self.parent = parent;
    }

    /// Shift all ranges by `offset` bytes.
    pub(crate) fn rebase(&mut self, offset: usize) {
        self.range = (self.range.start + offset)..(self.range.end + offset);
        self.payload = (self.payload.start + offset)..(self.payload.end + offset);
        for attr in &mut self.attrs {
            attr.rebase(offset);
        }
    }

    /// Clamp ranges so they never extend past `len` bytes of input.
    pub(crate) fn clamp(&mut self, len: usize) {
        let clamp = |r: &Range<usize>| r.start.min(len)..r.end.min(len).max(r.start.min(len));
        self.range = clamp(&self.range);
        self.payload = clamp(&self.payload);
    }
}

/// The finished layer stack of one packet.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketStack {
    /// Frame number within the session, starting at 1.
    pub index: u64,
    /// Capture timestamp in nanoseconds since the epoch.
    pub timestamp_ns: i64,
    /// Link type of the frame.
    pub link_type: u32,
    /// Length of the frame on the wire.
    pub original_len: u32,
    /// Captured bytes.
    pub data: Bytes,
    /// Layers, outermost first.
    pub layers: Vec<Layer>,
}

impl PacketStack {
    /// The outermost layer.
    pub fn primary_layer(&self) -> Option<&Layer> {
        self.layers.first()
    }

    /// The innermost layer.
    pub fn leaf_layer(&self) -> Option<&Layer> {
        self.layers.last()
    }

    /// First layer with the given tag.
    pub fn layer(&self, tag: &str) -> Option<&Layer> {
        self.layers.iter().find(|l| l.tag() == tag)
    }

    /// Layer tags, outermost first.
    pub fn tags(&self) -> Vec<&str> {
        self.layers.iter().map(|l| l.tag()).collect()
    }

    /// First attribute with the given identifier, searching outermost first.
    pub fn attr(&self, id: &str) -> Option<&Attr> {
        self.layers.iter().find_map(|l| l.attr(id))
    }

    /// Every attribute with the given identifier.
    pub fn attrs<'a>(&'a self, id: &str) -> impl Iterator<Item = &'a Attr> + 'a {
        let id = CompactString::new(id);
        self.layers
            .iter()
            .flat_map(|l| l.walk())
            .filter(move |a| a.id() == id.as_str())
    }

    /// Parent of the layer at `index`.
    pub fn parent_of(&self, index: usize) -> Option<&Layer> {
        self.layers.get(index)?.parent().and_then(|p| self.layers.get(p))
    }

    /// Captured bytes in `range`, if in bounds.
    pub fn bytes(&self, range: Range<usize>) -> Option<&[u8]> {
        self.data.get(range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack() -> PacketStack {
        let mut eth = Layer::new("eth", 0..20)
            .with_attr(Attr::new("eth.type", 0x0800u16, 12..14))
            .with_payload(14..20);
        eth.set_parent(None);
        let mut ip = Layer::new("ipv4", 14..20).with_attr(
            Attr::new("ipv4.flags", Value::Flags(2), 20..21)
                .with_child(Attr::new("ipv4.flags.df", true, 20..21)),
        );
        ip.set_parent(Some(0));
        PacketStack {
            index: 1,
            timestamp_ns: 0,
            link_type: 1,
            original_len: 20,
            data: Bytes::from_static(&[0u8; 20]),
            layers: vec![eth, ip],
        }
    }

    // Test 1: Frame view lookups
    #[test]
    fn test_stack_lookups() {
        let stack = stack();
        assert_eq!(stack.primary_layer().unwrap().tag(), "eth");
        assert_eq!(stack.leaf_layer().unwrap().tag(), "ipv4");
        assert_eq!(stack.tags(), vec!["eth", "ipv4"]);
        assert_eq!(stack.attr("ipv4.flags.df").unwrap().value(), &Value::Bool(true));
        assert!(stack.attr("tcp.port").is_none());
        assert_eq!(stack.parent_of(1).unwrap().tag(), "eth");
        assert!(stack.parent_of(0).is_none());
        assert_eq!(stack.attrs("eth.type").count(), 1);
    }

    // Test 2: Rebase shifts layer and attribute ranges
    #[test]
    fn test_rebase() {
        let mut layer = Layer::new("udp", 0..8)
            .with_attr(Attr::new("udp.port", 53u16, 2..4))
            .with_payload(8..8);
        layer.rebase(34);
        assert_eq!(layer.range(), 34..42);
        assert_eq!(layer.payload(), 42..42);
        assert_eq!(layer.attrs()[0].range(), 36..38);
    }

    // Test 3: Corrupt layer keeps the input as bytes
    #[test]
    fn test_corrupt_layer() {
        let layer = Layer::corrupt("tcp", 0..3, &[1, 2, 3], "boom");
        assert!(layer.is_corrupt());
        assert_eq!(
            layer.attr("tcp.data").unwrap().value(),
            &Value::bytes(&[1, 2, 3])
        );
    }

    // Test 4: Clamp keeps ranges in bounds
    #[test]
    fn test_clamp() {
        let mut layer = Layer::new("x", 0..10).with_payload(4..50);
        layer.clamp(8);
        assert_eq!(layer.range(), 0..8);
        assert_eq!(layer.payload(), 4..8);
    }

    // Test 5: Attribute iterator outlives the identifier it was asked for
    #[test]
    fn test_attrs_owns_identifier() {
        let stack = stack();
        let found: Vec<&Attr> = {
            let id = String::from("ipv4.flags.df");
            stack.attrs(&id).collect()
        };
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].value(), &Value::Bool(true));
    }
}
