//! TCP and UDP dissectors.

use std::net::IpAddr;

use etherparse::{TcpHeaderSlice, UdpHeaderSlice};

use crate::attr::{Attr, Value};
use crate::dissector::{DissectContext, Dissection, Dissector};
use crate::error::DissectError;
use crate::layer::Layer;
use crate::stream::{Endpoint, StreamFlags, StreamTag};

/// IP protocol number for TCP.
pub const IP_PROTO_TCP: u8 = 6;

/// IP protocol number for UDP.
pub const IP_PROTO_UDP: u8 = 17;

const TCP_MIN_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;

/// TCP flags bit positions.
pub mod flags {
    pub const FIN: u64 = 0x001;
    pub const SYN: u64 = 0x002;
    pub const RST: u64 = 0x004;
    pub const PSH: u64 = 0x008;
    pub const ACK: u64 = 0x010;
    pub const URG: u64 = 0x020;
    pub const ECE: u64 = 0x040;
    pub const CWR: u64 = 0x080;
}

const TCP_FLAGS: &[(&str, u64)] = &[
    ("fin", flags::FIN),
    ("syn", flags::SYN),
    ("rst", flags::RST),
    ("psh", flags::PSH),
    ("ack", flags::ACK),
    ("urg", flags::URG),
    ("ece", flags::ECE),
    ("cwr", flags::CWR),
];

/// Protocol number announced by the enclosing IP layer.
fn ip_protocol(context: &DissectContext<'_>) -> Option<u8> {
    let parent = context.parent()?;
    let id = match parent.tag() {
        "ipv4" => "ipv4.proto",
        "ipv6" => "ipv6.nxt",
        _ => return None,
    };
    parent
        .attr(id)
        .and_then(|a| a.value().as_i64())
        .and_then(|v| u8::try_from(v).ok())
}

/// Source and destination addresses of the enclosing IP layer.
fn ip_addresses(context: &DissectContext<'_>) -> Option<(IpAddr, IpAddr)> {
    let parent = context.parent()?;
    let tag = parent.tag();
    let addr = |field: &str| -> Option<IpAddr> {
        parent
            .attr(&format!("{tag}.{field}"))?
            .value()
            .as_str()?
            .parse()
            .ok()
    };
    Some((addr("src")?, addr("dst")?))
}

/// Transmission Control Protocol.
///
/// Tags its layer with the stream it belongs to, so payload is reassembled
/// in sequence order. SYN opens a direction, FIN closes it and RST aborts
/// the conversation.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDissector;

impl Dissector for TcpDissector {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn tokens(&self) -> &[(&'static str, &'static str)] {
        &[
            ("tcp", "Transmission Control Protocol"),
            ("tcp.srcport", "Source Port"),
            ("tcp.dstport", "Destination Port"),
            ("tcp.seq", "Sequence Number"),
            ("tcp.ack", "Acknowledgment Number"),
            ("tcp.hdr_len", "Header Length"),
            ("tcp.flags", "Flags"),
            ("tcp.flags.fin", "FIN"),
            ("tcp.flags.syn", "SYN"),
            ("tcp.flags.rst", "RST"),
            ("tcp.flags.psh", "PSH"),
            ("tcp.flags.ack", "ACK"),
            ("tcp.flags.urg", "URG"),
            ("tcp.flags.ece", "ECE"),
            ("tcp.flags.cwr", "CWR"),
            ("tcp.window", "Window"),
            ("tcp.checksum", "Checksum"),
            ("tcp.urgent", "Urgent Pointer"),
            ("tcp.options", "Options"),
        ]
    }

    fn accepts(&self, context: &DissectContext<'_>) -> bool {
        ip_protocol(context) == Some(IP_PROTO_TCP)
    }

    fn dissect(&self, context: &DissectContext<'_>) -> Result<Dissection, DissectError> {
        let data = context.data;
        if data.len() < TCP_MIN_HEADER_LEN {
            return Err(DissectError::TooShort {
                dissector: "tcp",
                needed: TCP_MIN_HEADER_LEN,
                have: data.len(),
            });
        }
        let tcp = TcpHeaderSlice::from_slice(data).map_err(|e| DissectError::InvalidField {
            dissector: "tcp",
            field: "header",
            reason: e.to_string(),
        })?;
        let header_len = tcp.slice().len();

        let mut bits = 0;
        for (set, bit) in [
            (tcp.fin(), flags::FIN),
            (tcp.syn(), flags::SYN),
            (tcp.rst(), flags::RST),
            (tcp.psh(), flags::PSH),
            (tcp.ack(), flags::ACK),
            (tcp.urg(), flags::URG),
            (tcp.ece(), flags::ECE),
            (tcp.cwr(), flags::CWR),
        ] {
            if set {
                bits |= bit;
            }
        }

        let mut layer = Layer::new("tcp", 0..data.len())
            .with_attr(Attr::new("tcp.srcport", tcp.source_port(), 0..2))
            .with_attr(Attr::new("tcp.dstport", tcp.destination_port(), 2..4))
            .with_attr(Attr::new("tcp.seq", tcp.sequence_number(), 4..8))
            .with_attr(Attr::new("tcp.ack", tcp.acknowledgment_number(), 8..12))
            .with_attr(Attr::new("tcp.hdr_len", tcp.data_offset() * 4, 12..13))
            .with_attr(Attr::flags("tcp.flags", bits, 12..14, TCP_FLAGS))
            .with_attr(Attr::new("tcp.window", tcp.window_size(), 14..16))
            .with_attr(Attr::new("tcp.checksum", tcp.checksum(), 16..18))
            .with_attr(Attr::new("tcp.urgent", tcp.urgent_pointer(), 18..20))
            .with_payload(header_len..data.len());
        if header_len > TCP_MIN_HEADER_LEN {
            layer.push_attr(Attr::new(
                "tcp.options",
                Value::bytes(tcp.options()),
                TCP_MIN_HEADER_LEN..header_len,
            ));
        }

        if let Some((src, dst)) = ip_addresses(context) {
            let tag = StreamTag::new(
                "tcp",
                Endpoint::ip(src, tcp.source_port()),
                Endpoint::ip(dst, tcp.destination_port()),
            )
            .with_sequence(tcp.sequence_number())
            .with_flags(StreamFlags {
                open: tcp.syn(),
                close: tcp.fin(),
                abort: tcp.rst(),
            });
            layer = layer.with_stream(tag);
        }
        Ok(Dissection::Layer(layer))
    }
}

/// User Datagram Protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct UdpDissector;

impl Dissector for UdpDissector {
    fn name(&self) -> &'static str {
        "udp"
    }

    fn tokens(&self) -> &[(&'static str, &'static str)] {
        &[
            ("udp", "User Datagram Protocol"),
            ("udp.srcport", "Source Port"),
            ("udp.dstport", "Destination Port"),
            ("udp.length", "Length"),
            ("udp.checksum", "Checksum"),
        ]
    }

    fn accepts(&self, context: &DissectContext<'_>) -> bool {
        ip_protocol(context) == Some(IP_PROTO_UDP)
    }

    fn dissect(&self, context: &DissectContext<'_>) -> Result<Dissection, DissectError> {
        let data = context.data;
        let udp = UdpHeaderSlice::from_slice(data).map_err(|_| DissectError::TooShort {
            dissector: "udp",
            needed: UDP_HEADER_LEN,
            have: data.len(),
        })?;
        let end = usize::from(udp.length()).clamp(UDP_HEADER_LEN, data.len());

        let layer = Layer::new("udp", 0..end)
            .with_attr(Attr::new("udp.srcport", udp.source_port(), 0..2))
            .with_attr(Attr::new("udp.dstport", udp.destination_port(), 2..4))
            .with_attr(Attr::new("udp.length", udp.length(), 4..6))
            .with_attr(Attr::new("udp.checksum", udp.checksum(), 6..8))
            .with_payload(UDP_HEADER_LEN..end);
        Ok(Dissection::Layer(layer))
    }
}
