//! Built-in dissectors for common protocols.
//!
//! | Dissector | Kind | Guard |
//! |-----------|------|-------|
//! | [`EthernetDissector`] | link layer | link type 1 |
//! | [`RawDissector`] | link layer | any frame (register last) |
//! | [`Ipv4Dissector`] / [`Ipv6Dissector`] | packet | EtherType, or IP version under `raw` |
//! | [`TcpDissector`] / [`UdpDissector`] | packet | IP protocol number |
//! | [`HttpDissector`] | stream | TCP on common HTTP ports |

mod http;
mod ip;
mod link;
mod transport;

use compact_str::{format_compact, CompactString};

use crate::error::Result;

use super::DissectorRegistry;

pub use http::HttpDissector;
pub use ip::{ethertype, Ipv4Dissector, Ipv6Dissector};
pub use link::{EthernetDissector, RawDissector, LINKTYPE_ETHERNET, LINKTYPE_RAW};
pub use transport::{flags as tcp_flags, TcpDissector, UdpDissector, IP_PROTO_TCP, IP_PROTO_UDP};

/// Token identifier naming a link type, e.g. `[link-1]`.
pub fn link_type_id(link_type: u32) -> CompactString {
    format_compact!("[link-{link_type}]")
}

/// Register every built-in dissector, in guard order.
pub fn register_builtins(registry: &DissectorRegistry) -> Result<()> {
    registry.register_link_layer(EthernetDissector)?;
    registry.register_link_layer(RawDissector)?;
    registry.register_dissector(Ipv4Dissector)?;
    registry.register_dissector(Ipv6Dissector)?;
    registry.register_dissector(TcpDissector)?;
    registry.register_dissector(UdpDissector)?;
    registry.register_stream_dissector(HttpDissector)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::attr::Value;
    use crate::capture::RawFrame;
    use crate::dissector::Pipeline;
    use crate::token::TokenRegistry;
    use bytes::Bytes;

    fn registry() -> DissectorRegistry {
        let registry = DissectorRegistry::new(Arc::new(TokenRegistry::new()));
        register_builtins(&registry).unwrap();
        registry
    }

    /// Ethernet + IPv4 + TCP frame from 10.0.0.1:40000 to 10.0.0.2:80.
    fn eth_tcp(seq: u32, flag_bits: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, // dst
            0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, // src
            0x08, 0x00, // IPv4
        ];
        let total = (20 + 20 + payload.len()) as u16;
        frame.extend_from_slice(&[0x45, 0x00]);
        frame.extend_from_slice(&total.to_be_bytes());
        frame.extend_from_slice(&[0x00, 0x01, 0x40, 0x00, 0x40, 0x06, 0x00, 0x00]);
        frame.extend_from_slice(&[10, 0, 0, 1, 10, 0, 0, 2]);
        frame.extend_from_slice(&[0x9c, 0x40, 0x00, 0x50]);
        frame.extend_from_slice(&seq.to_be_bytes());
        frame.extend_from_slice(&[0, 0, 0, 0, 0x50, flag_bits, 0xff, 0xff, 0, 0, 0, 0]);
        frame.extend_from_slice(payload);
        frame
    }

    fn frame(index: u64, data: Vec<u8>) -> RawFrame {
        RawFrame {
            index,
            timestamp_ns: 0,
            link_type: LINKTYPE_ETHERNET,
            captured_len: data.len() as u32,
            original_len: data.len() as u32,
            data: Bytes::from(data),
        }
    }

    // Test 1: Builtins register link-type tokens
    #[test]
    fn test_link_type_tokens() {
        let registry = registry();
        assert_eq!(link_type_id(1), "[link-1]");
        assert_eq!(registry.tokens().resolve(&link_type_id(1)), "Ethernet");
        assert_eq!(registry.tokens().resolve(&link_type_id(101)), "Raw IP");
        assert_eq!(registry.tokens().resolve("tcp.flags.syn"), "SYN");
    }

    // Test 2: Full stack over Ethernet
    #[test]
    fn test_ethernet_stack() {
        let registry = registry();
        let pipeline = Pipeline::new(registry.snapshot(), Default::default());
        let data = eth_tcp(1000, 0x18, b"xyz");
        let stack = pipeline.dissect_frame(1, 0, LINKTYPE_ETHERNET, &data);
        assert_eq!(stack.tags(), vec!["eth", "ipv4", "tcp", "payload"]);
        assert_eq!(stack.attr("tcp.dstport").unwrap().range(), 36..38);
        assert_eq!(stack.attr("ipv4.dst").unwrap().value(), &Value::str("10.0.0.2"));
    }

    // Test 3: HTTP split across two segments completes on the second
    #[test]
    fn test_http_over_tcp() {
        let registry = registry();
        let mut pipeline = Pipeline::new(registry.snapshot(), Default::default());

        let first = pipeline.process(&frame(1, eth_tcp(1000, 0x02, b"")));
        assert!(first.stream_layers.is_empty());

        let request = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let (a, b) = request.split_at(20);
        let second = pipeline.process(&frame(2, eth_tcp(1001, 0x18, a)));
        assert!(second.stream_layers.is_empty());
        let third = pipeline.process(&frame(3, eth_tcp(1021, 0x18, b)));
        assert_eq!(third.stream_layers.len(), 1);

        let layer = &third.stream_layers[0];
        assert_eq!(layer.packet_index, 3);
        assert_eq!(layer.layer.tag(), "http");
        assert_eq!(layer.layer.attr("http.host").unwrap().value(), &Value::str("example.com"));
    }
}
