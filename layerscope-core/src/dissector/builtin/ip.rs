//! IPv4 and IPv6 dissectors.

use etherparse::{Ipv4HeaderSlice, Ipv6HeaderSlice};

use crate::attr::{Attr, Value};
use crate::dissector::{DissectContext, Dissection, Dissector};
use crate::error::DissectError;
use crate::layer::Layer;

/// Well-known EtherType values.
pub mod ethertype {
    pub const IPV4: u16 = 0x0800;
    pub const IPV6: u16 = 0x86DD;
}

const IPV4_MIN_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;

/// Whether the parent layer carries an IP packet of the given version.
///
/// Ethernet announces it by EtherType; raw frames carry IP directly, so the
/// version nibble decides.
fn carries_ip(context: &DissectContext<'_>, ethertype: u16, version: u8) -> bool {
    match context.parent() {
        Some(parent) if parent.tag() == "eth" => {
            parent.attr("eth.type").and_then(|a| a.value().as_i64()) == Some(i64::from(ethertype))
        }
        Some(parent) if parent.tag() == "raw" => context.data.first().map(|b| b >> 4) == Some(version),
        _ => false,
    }
}

fn invalid_header(dissector: &'static str, err: impl std::fmt::Display) -> DissectError {
    DissectError::InvalidField {
        dissector,
        field: "header",
        reason: err.to_string(),
    }
}

/// Internet Protocol version 4.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ipv4Dissector;

impl Dissector for Ipv4Dissector {
    fn name(&self) -> &'static str {
        "ipv4"
    }

    fn tokens(&self) -> &[(&'static str, &'static str)] {
        &[
            ("ipv4", "Internet Protocol Version 4"),
            ("ipv4.version", "Version"),
            ("ipv4.hdr_len", "Header Length"),
            ("ipv4.len", "Total Length"),
            ("ipv4.id", "Identification"),
            ("ipv4.flags", "Flags"),
            ("ipv4.flags.df", "Don't Fragment"),
            ("ipv4.flags.mf", "More Fragments"),
            ("ipv4.frag_offset", "Fragment Offset"),
            ("ipv4.ttl", "Time to Live"),
            ("ipv4.proto", "Protocol"),
            ("ipv4.checksum", "Header Checksum"),
            ("ipv4.src", "Source Address"),
            ("ipv4.dst", "Destination Address"),
        ]
    }

    fn accepts(&self, context: &DissectContext<'_>) -> bool {
        carries_ip(context, ethertype::IPV4, 4)
    }

    fn dissect(&self, context: &DissectContext<'_>) -> Result<Dissection, DissectError> {
        let data = context.data;
        if data.len() < IPV4_MIN_HEADER_LEN {
            return Err(DissectError::TooShort {
                dissector: "ipv4",
                needed: IPV4_MIN_HEADER_LEN,
                have: data.len(),
            });
        }
        let ipv4 = Ipv4HeaderSlice::from_slice(data).map_err(|e| invalid_header("ipv4", e))?;
        let header_len = ipv4.slice().len();
        // Ethernet padding past the total length is not payload
        let end = usize::from(ipv4.total_len()).clamp(header_len, data.len());

        let flags = (u64::from(ipv4.dont_fragment()) << 1) | u64::from(ipv4.more_fragments());
        let layer = Layer::new("ipv4", 0..end)
            .with_attr(Attr::new("ipv4.version", 4u8, 0..1))
            .with_attr(Attr::new("ipv4.hdr_len", ipv4.ihl() * 4, 0..1))
            .with_attr(Attr::new("ipv4.len", ipv4.total_len(), 2..4))
            .with_attr(Attr::new("ipv4.id", ipv4.identification(), 4..6))
            .with_attr(Attr::flags("ipv4.flags", flags, 6..7, &[("df", 0x2), ("mf", 0x1)]))
            .with_attr(Attr::new("ipv4.frag_offset", ipv4.fragments_offset().value(), 6..8))
            .with_attr(Attr::new("ipv4.ttl", ipv4.ttl(), 8..9))
            .with_attr(Attr::new("ipv4.proto", ipv4.protocol().0, 9..10))
            .with_attr(Attr::new("ipv4.checksum", ipv4.header_checksum(), 10..12))
            .with_attr(Attr::new("ipv4.src", Value::str(ipv4.source_addr().to_string()), 12..16))
            .with_attr(Attr::new("ipv4.dst", Value::str(ipv4.destination_addr().to_string()), 16..20))
            .with_payload(header_len..end);
        Ok(Dissection::Layer(layer))
    }
}

/// Internet Protocol version 6. Extension headers are left in the payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ipv6Dissector;

impl Dissector for Ipv6Dissector {
    fn name(&self) -> &'static str {
        "ipv6"
    }

    fn tokens(&self) -> &[(&'static str, &'static str)] {
        &[
            ("ipv6", "Internet Protocol Version 6"),
            ("ipv6.version", "Version"),
            ("ipv6.tclass", "Traffic Class"),
            ("ipv6.flow", "Flow Label"),
            ("ipv6.plen", "Payload Length"),
            ("ipv6.nxt", "Next Header"),
            ("ipv6.hlim", "Hop Limit"),
            ("ipv6.src", "Source Address"),
            ("ipv6.dst", "Destination Address"),
        ]
    }

    fn accepts(&self, context: &DissectContext<'_>) -> bool {
        carries_ip(context, ethertype::IPV6, 6)
    }

    fn dissect(&self, context: &DissectContext<'_>) -> Result<Dissection, DissectError> {
        let data = context.data;
        if data.len() < IPV6_HEADER_LEN {
            return Err(DissectError::TooShort {
                dissector: "ipv6",
                needed: IPV6_HEADER_LEN,
                have: data.len(),
            });
        }
        let ipv6 = Ipv6HeaderSlice::from_slice(data).map_err(|e| invalid_header("ipv6", e))?;
        let end = (IPV6_HEADER_LEN + usize::from(ipv6.payload_length())).min(data.len());

        let layer = Layer::new("ipv6", 0..end)
            .with_attr(Attr::new("ipv6.version", 6u8, 0..1))
            .with_attr(Attr::new("ipv6.tclass", ipv6.traffic_class(), 0..2))
            .with_attr(Attr::new("ipv6.flow", ipv6.flow_label().value(), 1..4))
            .with_attr(Attr::new("ipv6.plen", ipv6.payload_length(), 4..6))
            .with_attr(Attr::new("ipv6.nxt", ipv6.next_header().0, 6..7))
            .with_attr(Attr::new("ipv6.hlim", ipv6.hop_limit(), 7..8))
            .with_attr(Attr::new("ipv6.src", Value::str(ipv6.source_addr().to_string()), 8..24))
            .with_attr(Attr::new("ipv6.dst", Value::str(ipv6.destination_addr().to_string()), 24..40))
            .with_payload(IPV6_HEADER_LEN..end);
        Ok(Dissection::Layer(layer))
    }
}
