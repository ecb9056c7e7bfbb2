//! Link-layer dissectors.

use etherparse::Ethernet2HeaderSlice;

use crate::attr::{Attr, Value};
use crate::dissector::{DissectContext, Dissection, Dissector};
use crate::error::DissectError;
use crate::layer::Layer;

/// Link type constant for Ethernet.
pub const LINKTYPE_ETHERNET: u32 = 1;

/// Link type constant for raw IP.
pub const LINKTYPE_RAW: u32 = 101;

/// Ethernet header length.
const ETH_HEADER_LEN: usize = 14;

/// Format a MAC address as colon-separated hex.
fn mac(bytes: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]
    )
}

/// Ethernet II, for frames of link type 1.
#[derive(Debug, Clone, Copy, Default)]
pub struct EthernetDissector;

impl Dissector for EthernetDissector {
    fn name(&self) -> &'static str {
        "eth"
    }

    fn tokens(&self) -> &[(&'static str, &'static str)] {
        &[
            ("[link-1]", "Ethernet"),
            ("eth", "Ethernet II"),
            ("eth.dst", "Destination"),
            ("eth.src", "Source"),
            ("eth.type", "Type"),
        ]
    }

    fn accepts(&self, context: &DissectContext<'_>) -> bool {
        context.link_type == LINKTYPE_ETHERNET
    }

    fn dissect(&self, context: &DissectContext<'_>) -> Result<Dissection, DissectError> {
        let data = context.data;
        let eth = Ethernet2HeaderSlice::from_slice(data).map_err(|_| DissectError::TooShort {
            dissector: "eth",
            needed: ETH_HEADER_LEN,
            have: data.len(),
        })?;

        let layer = Layer::new("eth", 0..data.len())
            .with_attr(Attr::new("eth.dst", Value::str(mac(&eth.destination())), 0..6))
            .with_attr(Attr::new("eth.src", Value::str(mac(&eth.source())), 6..12))
            .with_attr(Attr::new("eth.type", eth.ether_type().0, 12..14))
            .with_payload(eth.slice().len()..data.len());
        Ok(Dissection::Layer(layer))
    }
}

/// Raw frames: link type 101, and any link type no other link-layer
/// dissector claims.
///
/// Register it last; it accepts every frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawDissector;

impl Dissector for RawDissector {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn tokens(&self) -> &[(&'static str, &'static str)] {
        &[("[link-101]", "Raw IP"), ("raw", "Raw packet data")]
    }

    fn accepts(&self, _context: &DissectContext<'_>) -> bool {
        true
    }

    fn dissect(&self, context: &DissectContext<'_>) -> Result<Dissection, DissectError> {
        let len = context.data.len();
        Ok(Dissection::Layer(Layer::new("raw", 0..len).with_payload(0..len)))
    }
}
