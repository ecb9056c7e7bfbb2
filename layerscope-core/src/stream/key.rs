use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use compact_str::CompactString;
use smallvec::SmallVec;

/// One end of a conversation: an address plus a transport identifier.
///
/// Addresses are opaque bytes so that any network protocol can key a
/// stream; IPv4 and IPv6 addresses render in their usual notation.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Endpoint {
    address: SmallVec<[u8; 16]>,
    port: u16,
}

impl Endpoint {
    pub fn new(address: &[u8], port: u16) -> Self {
        Self {
            address: SmallVec::from_slice(address),
            port,
        }
    }

    /// Endpoint for an IP address and port.
    pub fn ip(addr: IpAddr, port: u16) -> Self {
        match addr {
            IpAddr::V4(v4) => Self::new(&v4.octets(), port),
            IpAddr::V6(v6) => Self::new(&v6.octets(), port),
        }
    }

    pub fn address(&self) -> &[u8] {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address.len() {
            4 => {
                let octets: [u8; 4] = [self.address[0], self.address[1], self.address[2], self.address[3]];
                write!(f, "{}:{}", Ipv4Addr::from(octets), self.port)
            }
            16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&self.address);
                write!(f, "[{}]:{}", Ipv6Addr::from(octets), self.port)
            }
            _ => {
                for byte in &self.address {
                    write!(f, "{byte:02x}")?;
                }
                write!(f, ":{}", self.port)
            }
        }
    }
}

/// Direction of data flow relative to the normalized key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// From the lower endpoint to the upper one.
    Forward,
    /// From the upper endpoint to the lower one.
    Reverse,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Reverse => "reverse",
        }
    }

    pub fn reverse(self) -> Self {
        match self {
            Direction::Forward => Direction::Reverse,
            Direction::Reverse => Direction::Forward,
        }
    }
}

/// Normalized conversation key (lower endpoint first for consistent lookup).
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct StreamKey {
    protocol: CompactString,
    lower: Endpoint,
    upper: Endpoint,
}

impl StreamKey {
    /// Create a normalized key for a packet travelling `src` → `dst`.
    ///
    /// Both directions of a conversation produce the same key.
    pub fn new(protocol: &str, src: Endpoint, dst: Endpoint) -> Self {
        let (lower, upper) = if src <= dst { (src, dst) } else { (dst, src) };
        Self {
            protocol: CompactString::new(protocol),
            lower,
            upper,
        }
    }

    /// Direction of a packet sent by `src`.
    pub fn direction(&self, src: &Endpoint) -> Direction {
        if *src == self.lower {
            Direction::Forward
        } else {
            Direction::Reverse
        }
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn lower(&self) -> &Endpoint {
        &self.lower
    }

    pub fn upper(&self) -> &Endpoint {
        &self.upper
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} <-> {}", self.protocol, self.lower, self.upper)
    }
}

/// One direction of a conversation.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct StreamId {
    pub key: StreamKey,
    pub direction: Direction,
}

impl StreamId {
    /// Sending endpoint.
    pub fn src(&self) -> &Endpoint {
        match self.direction {
            Direction::Forward => self.key.lower(),
            Direction::Reverse => self.key.upper(),
        }
    }

    /// Receiving endpoint.
    pub fn dst(&self) -> &Endpoint {
        match self.direction {
            Direction::Forward => self.key.upper(),
            Direction::Reverse => self.key.lower(),
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.key.protocol(), self.src(), self.dst())
    }
}

/// Transport signals carried by a segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamFlags {
    /// Start of the stream; the sequence number itself carries no data.
    pub open: bool,
    /// Orderly end of this direction.
    pub close: bool,
    /// Abrupt end of the whole conversation.
    pub abort: bool,
}

/// Marks a layer as carrying stream payload.
///
/// A stream-bearing dissector attaches this to its layer; the pipeline then
/// feeds the layer's payload to the reassembly buffer for the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTag {
    pub id: StreamId,
    /// Sequence number of the first payload byte, if the protocol has one.
    /// Without it, segments are appended in arrival order.
    pub sequence: Option<u32>,
    pub flags: StreamFlags,
}

impl StreamTag {
    pub fn new(protocol: &str, src: Endpoint, dst: Endpoint) -> Self {
        let key = StreamKey::new(protocol, src.clone(), dst);
        let direction = key.direction(&src);
        Self {
            id: StreamId { key, direction },
            sequence: None,
            flags: StreamFlags::default(),
        }
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn with_flags(mut self, flags: StreamFlags) -> Self {
        self.flags = flags;
        self
    }
}
