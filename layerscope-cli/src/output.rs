//! Output formatting for decoded packets.
//!
//! Packets print as one summary line, an indented layer tree, or one JSON
//! object per line. Display names come from the token registry; attributes
//! that satisfied the display filter are marked.

use std::io::Write;
use std::sync::Arc;

use clap::ValueEnum;
use layerscope_core::dissector::builtin::link_type_id;
use layerscope_core::{Attr, Layer, LayerStatus, PacketStack, StreamLayer, TokenRegistry, Value};

/// Supported output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// One line per packet (default)
    Summary,
    /// Layers and attributes as an indented tree
    Tree,
    /// JSON Lines (one JSON object per packet)
    Json,
}

/// Formats packets and stream layers for output.
pub struct OutputFormatter {
    format: OutputFormat,
    tokens: Arc<TokenRegistry>,
}

impl OutputFormatter {
    pub fn new(format: OutputFormat, tokens: Arc<TokenRegistry>) -> Self {
        Self { format, tokens }
    }

    /// Write one packet. `highlights` are attributes of `packet` to mark.
    pub fn write_packet<W: Write>(
        &self,
        packet: &PacketStack,
        highlights: &[&Attr],
        writer: &mut W,
    ) -> std::io::Result<()> {
        match self.format {
            OutputFormat::Summary => self.write_summary(packet, writer),
            OutputFormat::Tree => self.write_tree(packet, highlights, writer),
            OutputFormat::Json => self.write_json(packet, highlights, writer),
        }
    }

    /// Write a stream layer completed by the previously written packet.
    pub fn write_stream_layer<W: Write>(
        &self,
        layer: &StreamLayer,
        writer: &mut W,
    ) -> std::io::Result<()> {
        match self.format {
            OutputFormat::Summary => writeln!(
                writer,
                "{:>8}   {} #{} [{}..{}] {}",
                "",
                self.tokens.resolve(layer.layer.tag()),
                layer.sequence,
                layer.stream_range.start,
                layer.stream_range.end,
                self.layer_info(&layer.layer)
            ),
            OutputFormat::Tree => {
                writeln!(
                    writer,
                    "  Stream {} #{} (bytes {}..{})",
                    layer.stream,
                    layer.sequence,
                    layer.stream_range.start,
                    layer.stream_range.end
                )?;
                self.write_layer_tree(&layer.layer, &[], 2, writer)
            }
            OutputFormat::Json => {
                let mut obj = serde_json::Map::new();
                obj.insert("stream".to_string(), layer.stream.to_string().into());
                obj.insert("sequence".to_string(), layer.sequence.into());
                obj.insert("packet".to_string(), layer.packet_index.into());
                obj.insert(
                    "stream_range".to_string(),
                    serde_json::json!([layer.stream_range.start, layer.stream_range.end]),
                );
                obj.insert("layer".to_string(), self.layer_json(&layer.layer, &[]));
                writeln!(writer, "{}", serde_json::Value::Object(obj))
            }
        }
    }

    fn write_summary<W: Write>(&self, packet: &PacketStack, writer: &mut W) -> std::io::Result<()> {
        let names: Vec<_> = packet
            .layers
            .iter()
            .map(|l| self.tokens.resolve(l.tag()))
            .collect();
        let info = packet
            .leaf_layer()
            .map(|l| self.layer_info(l))
            .unwrap_or_default();
        writeln!(
            writer,
            "{:>8} {:>17.6} {:>6}  {}  {}",
            packet.index,
            packet.timestamp_ns as f64 / 1e9,
            packet.original_len,
            names.join(" / "),
            info
        )
    }

    /// Short description of a layer: its status, or its first few attributes.
    fn layer_info(&self, layer: &Layer) -> String {
        match layer.status() {
            LayerStatus::Corrupt { reason } => format!("[corrupt: {reason}]"),
            LayerStatus::Opaque => format!("{} bytes", layer.range().len()),
            LayerStatus::Complete => layer
                .attrs()
                .iter()
                .take(3)
                .map(|a| format!("{}={}", a.name(&self.tokens), a.summary(&self.tokens)))
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    fn write_tree<W: Write>(
        &self,
        packet: &PacketStack,
        highlights: &[&Attr],
        writer: &mut W,
    ) -> std::io::Result<()> {
        writeln!(
            writer,
            "Frame {}: {} bytes on wire, {} captured, link {}",
            packet.index,
            packet.original_len,
            packet.data.len(),
            self.tokens.resolve(&link_type_id(packet.link_type))
        )?;
        for layer in &packet.layers {
            self.write_layer_tree(layer, highlights, 1, writer)?;
        }
        Ok(())
    }

    fn write_layer_tree<W: Write>(
        &self,
        layer: &Layer,
        highlights: &[&Attr],
        depth: usize,
        writer: &mut W,
    ) -> std::io::Result<()> {
        let indent = "  ".repeat(depth);
        let range = layer.range();
        write!(
            writer,
            "{indent}{} [{}..{}]",
            self.tokens.resolve(layer.tag()),
            range.start,
            range.end
        )?;
        if let LayerStatus::Corrupt { reason } = layer.status() {
            write!(writer, " (corrupt: {reason})")?;
        }
        writeln!(writer)?;
        for attr in layer.attrs() {
            self.write_attr_tree(attr, highlights, depth + 1, writer)?;
        }
        Ok(())
    }

    fn write_attr_tree<W: Write>(
        &self,
        attr: &Attr,
        highlights: &[&Attr],
        depth: usize,
        writer: &mut W,
    ) -> std::io::Result<()> {
        let marker = if is_highlighted(attr, highlights) { '*' } else { ' ' };
        write!(
            writer,
            "{}{marker}{}: {}",
            "  ".repeat(depth),
            attr.name(&self.tokens),
            attr.summary(&self.tokens)
        )?;
        if let Some(error) = attr.error() {
            write!(writer, " [{error}]")?;
        }
        writeln!(writer)?;
        for child in attr.children() {
            self.write_attr_tree(child, highlights, depth + 1, writer)?;
        }
        Ok(())
    }

    fn write_json<W: Write>(
        &self,
        packet: &PacketStack,
        highlights: &[&Attr],
        writer: &mut W,
    ) -> std::io::Result<()> {
        let mut obj = serde_json::Map::new();
        obj.insert("index".to_string(), packet.index.into());
        obj.insert("timestamp_ns".to_string(), packet.timestamp_ns.into());
        obj.insert("link_type".to_string(), packet.link_type.into());
        obj.insert("length".to_string(), packet.original_len.into());
        obj.insert("captured".to_string(), packet.data.len().into());
        let layers = packet
            .layers
            .iter()
            .map(|l| self.layer_json(l, highlights))
            .collect();
        obj.insert("layers".to_string(), serde_json::Value::Array(layers));
        writeln!(writer, "{}", serde_json::Value::Object(obj))
    }

    fn layer_json(&self, layer: &Layer, highlights: &[&Attr]) -> serde_json::Value {
        let range = layer.range();
        let status = match layer.status() {
            LayerStatus::Complete => serde_json::Value::from("complete"),
            LayerStatus::Opaque => serde_json::Value::from("opaque"),
            LayerStatus::Corrupt { reason } => serde_json::json!({ "corrupt": reason.as_str() }),
        };
        serde_json::json!({
            "tag": layer.tag(),
            "name": self.tokens.resolve(layer.tag()).as_str(),
            "range": [range.start, range.end],
            "status": status,
            "attrs": layer
                .attrs()
                .iter()
                .map(|a| self.attr_json(a, highlights))
                .collect::<Vec<_>>(),
        })
    }

    fn attr_json(&self, attr: &Attr, highlights: &[&Attr]) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        obj.insert("id".to_string(), attr.id().into());
        obj.insert("value".to_string(), value_json(attr.value()));
        if let Some(error) = attr.error() {
            obj.insert("error".to_string(), error.into());
        }
        if is_highlighted(attr, highlights) {
            obj.insert("matched".to_string(), true.into());
        }
        if !attr.children().is_empty() {
            let children = attr
                .children()
                .iter()
                .map(|c| self.attr_json(c, highlights))
                .collect();
            obj.insert("children".to_string(), serde_json::Value::Array(children));
        }
        serde_json::Value::Object(obj)
    }
}

fn is_highlighted(attr: &Attr, highlights: &[&Attr]) -> bool {
    highlights.iter().any(|h| std::ptr::eq(*h, attr))
}

/// Typed JSON for a value; bytes and flag sets render as strings.
fn value_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Int(v) => (*v).into(),
        Value::Float(v) => serde_json::json!(v),
        Value::Bool(b) => (*b).into(),
        Value::Str(s) => s.as_str().into(),
        Value::Bytes(_) | Value::Flags(_) => value.to_string().into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use layerscope_core::Filter;

    fn tokens() -> Arc<TokenRegistry> {
        let tokens = TokenRegistry::new();
        tokens
            .register_all(&[
                ("ipv4", "Internet Protocol Version 4"),
                ("ipv4.ttl", "Time to Live"),
                ("tcp.flags", "Flags"),
                ("tcp.flags.syn", "SYN"),
                ("tcp.flags.ack", "ACK"),
            ])
            .unwrap();
        Arc::new(tokens)
    }

    fn create_test_packet() -> PacketStack {
        PacketStack {
            index: 7,
            timestamp_ns: 1_500_000_000,
            link_type: 101,
            original_len: 40,
            data: vec![0u8; 40].into(),
            layers: vec![
                Layer::new("ipv4", 0..20)
                    .with_attr(Attr::new("ipv4.ttl", 64u8, 8..9))
                    .with_payload(20..40),
                Layer::new("tcp", 20..40).with_attr(Attr::flags(
                    "tcp.flags",
                    0x12,
                    33..34,
                    &[("syn", 0x02), ("ack", 0x10)],
                )),
            ],
        }
    }

    fn render(format: OutputFormat, filter: Option<&str>) -> String {
        let packet = create_test_packet();
        let formatter = OutputFormatter::new(format, tokens());
        let highlights = filter
            .map(|f| Filter::compile(f).unwrap().evaluate(&packet).attrs)
            .unwrap_or_default();
        let mut output = Vec::new();
        formatter.write_packet(&packet, &highlights, &mut output).unwrap();
        String::from_utf8(output).unwrap()
    }

    #[test]
    fn test_summary_output() {
        let output = render(OutputFormat::Summary, None);
        assert!(output.contains("Internet Protocol Version 4 / tcp"));
        assert!(output.contains("Flags=SYN, ACK (0x12)"));
        assert!(output.contains("1.500000"));
        assert_eq!(output.lines().count(), 1);
    }

    #[test]
    fn test_tree_marks_matches() {
        let output = render(OutputFormat::Tree, Some("ipv4.ttl == 64"));
        assert!(output.starts_with("Frame 7: 40 bytes on wire"));
        assert!(output.contains("*Time to Live: 64"));
        assert!(output.contains(" Flags: SYN, ACK (0x12)"));
        assert!(output.contains("      SYN: true"));
    }

    #[test]
    fn test_json_output() {
        let output = render(OutputFormat::Json, Some("tcp.flags.syn"));
        let json: serde_json::Value = serde_json::from_str(output.trim()).unwrap();
        assert_eq!(json["index"], 7);
        assert_eq!(json["layers"][0]["tag"], "ipv4");
        assert_eq!(json["layers"][0]["attrs"][0]["value"], 64);
        assert_eq!(json["layers"][1]["attrs"][0]["value"], "0x12");
        assert_eq!(json["layers"][1]["attrs"][0]["children"][0]["matched"], true);
    }
}
