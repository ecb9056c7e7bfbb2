//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use layerscope_core::dissector::fn_dissector;
use layerscope_core::{Attr, DissectorRegistry, Layer, SessionEvent, Subscription, TokenRegistry};

/// Registry with the `raw` link layer and the `0x45 → ipv4` packet dissector.
pub fn raw_ipv4_registry() -> DissectorRegistry {
    let registry = DissectorRegistry::new(Arc::new(TokenRegistry::new()));
    registry
        .register_link_layer(fn_dissector("raw", |_| true, |ctx| {
            Ok(Layer::new("raw", 0..ctx.data.len()).with_payload(0..ctx.data.len()))
        }))
        .unwrap();
    registry
        .register_dissector(fn_dissector(
            "ipv4",
            |ctx| ctx.data.first() == Some(&0x45),
            |ctx| {
                Ok(Layer::new("ipv4", 0..ctx.data.len())
                    .with_attr(Attr::new("ipv4.version", 4u8, 0..1)))
            },
        ))
        .unwrap();
    registry
}

/// Classic little-endian, microsecond pcap file.
pub fn pcap_file(link_type: u32, frames: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&0xa1b2_c3d4u32.to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&4u16.to_le_bytes());
    out.extend_from_slice(&0i32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&65535u32.to_le_bytes());
    out.extend_from_slice(&link_type.to_le_bytes());

    for (i, data) in frames.iter().enumerate() {
        let len = data.len() as u32;
        out.extend_from_slice(&(1_700_000_000 + i as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(data);
    }
    out
}

/// Write a pcap file into `dir`.
pub fn write_pcap(dir: &tempfile::TempDir, name: &str, link_type: u32, frames: &[Vec<u8>]) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, pcap_file(link_type, frames)).unwrap();
    path
}

/// Ethernet + IPv4 + TCP frame from 10.0.0.1:40000 to 10.0.0.2:80.
pub fn eth_tcp(seq: u32, flags: u8, payload: &[u8]) -> Vec<u8> {
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
    frame.extend_from_slice(&[0, 0, 0, 0, 0x50, flags, 0xff, 0xff, 0, 0, 0, 0]);
    frame.extend_from_slice(payload);
    frame
}

/// Receive events until the session reaches a terminal state.
pub async fn collect_until_terminal(events: &mut Subscription) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("timed out waiting for session events")
            .expect("event bus closed");
        let done = matches!(&event, SessionEvent::StateChanged { to, .. } if to.is_terminal());
        out.push(event);
        if done {
            return out;
        }
    }
}
