//! PCAP/PCAPNG frame reader over any byte source.
//!
//! Uses `pcap_parser` for both classic pcap (either byte order, micro- or
//! nanosecond timestamps) and pcapng. Timestamps are normalised to
//! nanoseconds; pcapng interface resolutions (`if_tsresol`) are honoured.

use std::io::{Cursor, Read};

use bytes::Bytes;
use pcap_parser::pcapng::Block;
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{LegacyPcapReader, PcapBlockOwned, PcapError, PcapNGReader};

use crate::error::{CaptureError, Error, Result};

use super::RawFrame;

/// Buffer size for pcap_parser readers (256KB).
const BUFFER_SIZE: usize = 262144;

/// Default pcapng timestamp resolution: microseconds.
const DEFAULT_TSRESOL: u8 = 6;

/// Format of a capture stream, detected from its magic number.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PcapFormat {
    /// Classic PCAP (little-endian, microseconds)
    LegacyLeMicro,
    /// Classic PCAP (big-endian, microseconds)
    LegacyBeMicro,
    /// Classic PCAP (little-endian, nanoseconds)
    LegacyLeNano,
    /// Classic PCAP (big-endian, nanoseconds)
    LegacyBeNano,
    /// PCAPNG format
    PcapNg,
}

impl PcapFormat {
    /// Detect the format from the first four bytes of a stream.
    pub fn detect(data: &[u8]) -> Result<Self> {
        let Some(magic) = data.get(..4) else {
            return Err(CaptureError::InvalidFormat {
                reason: "Data too small for PCAP magic".into(),
            }
            .into());
        };
        match magic {
            [0xd4, 0xc3, 0xb2, 0xa1] => Ok(PcapFormat::LegacyLeMicro),
            [0xa1, 0xb2, 0xc3, 0xd4] => Ok(PcapFormat::LegacyBeMicro),
            [0x4d, 0x3c, 0xb2, 0xa1] => Ok(PcapFormat::LegacyLeNano),
            [0xa1, 0xb2, 0x3c, 0x4d] => Ok(PcapFormat::LegacyBeNano),
            [0x0a, 0x0d, 0x0d, 0x0a] => Ok(PcapFormat::PcapNg),
            _ => Err(CaptureError::InvalidFormat {
                reason: format!(
                    "Unknown PCAP magic: {:02x}{:02x}{:02x}{:02x}",
                    magic[0], magic[1], magic[2], magic[3]
                ),
            }
            .into()),
        }
    }

    pub fn is_pcapng(&self) -> bool {
        matches!(self, PcapFormat::PcapNg)
    }

    /// Whether legacy timestamps carry nanoseconds.
    pub fn is_nanosecond(&self) -> bool {
        matches!(self, PcapFormat::LegacyLeNano | PcapFormat::LegacyBeNano)
    }
}

type Source = Box<dyn Read + Send>;

enum ReaderInner {
    Legacy {
        reader: LegacyPcapReader<Source>,
        nanosecond: bool,
    },
    Ng {
        reader: PcapNGReader<Source>,
        /// (link type, tsresol) per interface, indexed by interface id
        interfaces: Vec<(u32, u8)>,
    },
}

/// Reads frames from a pcap or pcapng byte stream.
pub struct PcapFrameReader {
    inner: ReaderInner,
    format: PcapFormat,
    frame_number: u64,
    link_type: u32,
}

impl PcapFrameReader {
    /// Detect the format and read the stream header.
    ///
    /// Blocks until the header is available, which for a pipe means until
    /// the writer has produced it.
    pub fn new<R: Read + Send + 'static>(mut source: R) -> Result<Self> {
        let mut magic = [0u8; 4];
        source.read_exact(&mut magic).map_err(|e| {
            Error::Capture(CaptureError::InvalidFormat {
                reason: format!("Failed to read capture header: {e}"),
            })
        })?;
        let format = PcapFormat::detect(&magic)?;
        let source: Source = Box::new(Cursor::new(magic).chain(source));

        let inner = if format.is_pcapng() {
            let reader = PcapNGReader::new(BUFFER_SIZE, source).map_err(|e| {
                Error::Capture(CaptureError::InvalidFormat {
                    reason: format!("Failed to parse PCAPNG: {e}"),
                })
            })?;
            ReaderInner::Ng {
                reader,
                interfaces: Vec::new(),
            }
        } else {
            let reader = LegacyPcapReader::new(BUFFER_SIZE, source).map_err(|e| {
                Error::Capture(CaptureError::InvalidFormat {
                    reason: format!("Failed to parse legacy PCAP: {e}"),
                })
            })?;
            ReaderInner::Legacy {
                reader,
                nanosecond: format.is_nanosecond(),
            }
        };

        let mut reader = Self {
            inner,
            format,
            frame_number: 0,
            link_type: 1, // Ethernet until a header says otherwise
        };
        reader.read_header()?;
        Ok(reader)
    }

    pub fn format(&self) -> PcapFormat {
        self.format
    }

    /// Link type of the most recent header (e.g., 1 = Ethernet).
    pub fn link_type(&self) -> u32 {
        self.link_type
    }

    /// Number of frames read so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_number
    }

    /// Consume header blocks up to the first packet so the link type is known.
    fn read_header(&mut self) -> Result<()> {
        loop {
            match &mut self.inner {
                ReaderInner::Legacy { reader, .. } => match reader.next() {
                    Ok((offset, PcapBlockOwned::LegacyHeader(header))) => {
                        self.link_type = header.network.0 as u32;
                        reader.consume(offset);
                        return Ok(());
                    }
                    Ok(_) => return Ok(()),
                    Err(PcapError::Incomplete(_)) => {
                        reader.refill().map_err(|e| stalled(e, 0))?;
                    }
                    Err(e) => return Err(stalled(e, 0)),
                },
                ReaderInner::Ng { reader, interfaces } => match reader.next() {
                    Ok((offset, PcapBlockOwned::NG(Block::SectionHeader(_)))) => {
                        reader.consume(offset);
                    }
                    Ok((offset, PcapBlockOwned::NG(Block::InterfaceDescription(idb)))) => {
                        self.link_type = idb.linktype.0 as u32;
                        interfaces.push((self.link_type, idb.if_tsresol));
                        reader.consume(offset);
                        return Ok(());
                    }
                    Ok(_) | Err(PcapError::Eof) => return Ok(()),
                    Err(PcapError::Incomplete(_)) => {
                        reader.refill().map_err(|e| stalled(e, 0))?;
                    }
                    Err(e) => return Err(stalled(e, 0)),
                },
            }
        }
    }

    /// Read the next frame. Returns `Ok(None)` at end of stream.
    pub fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        loop {
            let index = self.frame_number + 1;
            let frame = match &mut self.inner {
                ReaderInner::Legacy { reader, nanosecond } => match reader.next() {
                    Ok((offset, block)) => {
                        let frame = match block {
                            PcapBlockOwned::Legacy(packet) => {
                                let fraction = packet.ts_usec as i64;
                                let fraction_ns = if *nanosecond { fraction } else { fraction * 1_000 };
                                Some(RawFrame {
                                    index,
                                    timestamp_ns: (packet.ts_sec as i64) * 1_000_000_000 + fraction_ns,
                                    link_type: self.link_type,
                                    captured_len: packet.caplen,
                                    original_len: packet.origlen,
                                    data: Bytes::copy_from_slice(packet.data),
                                })
                            }
                            PcapBlockOwned::LegacyHeader(header) => {
                                self.link_type = header.network.0 as u32;
                                None
                            }
                            _ => None,
                        };
                        reader.consume(offset);
                        frame
                    }
                    Err(PcapError::Eof) => return Ok(None),
                    Err(PcapError::Incomplete(_)) => {
                        reader.refill().map_err(|e| stalled(e, index - 1))?;
                        None
                    }
                    Err(e) => return Err(stalled(e, index - 1)),
                },
                ReaderInner::Ng { reader, interfaces } => match reader.next() {
                    Ok((offset, block)) => {
                        let frame = match block {
                            PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                                interfaces.push((idb.linktype.0 as u32, idb.if_tsresol));
                                None
                            }
                            PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
                                let (link_type, tsresol) = interfaces
                                    .get(epb.if_id as usize)
                                    .copied()
                                    .unwrap_or((self.link_type, DEFAULT_TSRESOL));
                                let ticks = ((epb.ts_high as u64) << 32) | (epb.ts_low as u64);
                                // Block data is padded to 32 bits
                                let data = epb.data.get(..epb.caplen as usize).unwrap_or(epb.data);
                                Some(RawFrame {
                                    index,
                                    timestamp_ns: ticks_to_ns(ticks, tsresol),
                                    link_type,
                                    captured_len: epb.caplen,
                                    original_len: epb.origlen,
                                    data: Bytes::copy_from_slice(data),
                                })
                            }
                            PcapBlockOwned::NG(Block::SimplePacket(spb)) => {
                                let link_type = interfaces.first().map_or(self.link_type, |i| i.0);
                                Some(RawFrame {
                                    index,
                                    timestamp_ns: 0,
                                    link_type,
                                    captured_len: spb.data.len() as u32,
                                    original_len: spb.origlen,
                                    data: Bytes::copy_from_slice(spb.data),
                                })
                            }
                            _ => None,
                        };
                        reader.consume(offset);
                        frame
                    }
                    Err(PcapError::Eof) => return Ok(None),
                    Err(PcapError::Incomplete(_)) => {
                        reader.refill().map_err(|e| stalled(e, index - 1))?;
                        None
                    }
                    Err(e) => return Err(stalled(e, index - 1)),
                },
            };
            if let Some(frame) = frame {
                self.frame_number = frame.index;
                return Ok(Some(frame));
            }
        }
    }
}

/// Map a reader error to a capture error.
///
/// A stream that ends inside a record is reported as truncated after the
/// last complete frame.
fn stalled(err: PcapError<&[u8]>, frame: u64) -> Error {
    match err {
        PcapError::Eof | PcapError::UnexpectedEof => {
            Error::Capture(CaptureError::Truncated { frame })
        }
        e => Error::Capture(CaptureError::InvalidFormat {
            reason: format!("PCAP parse error: {e}"),
        }),
    }
}

/// Convert pcapng timestamp ticks to nanoseconds.
///
/// `tsresol` is a power of ten when the high bit is clear, a power of two
/// otherwise.
fn ticks_to_ns(ticks: u64, tsresol: u8) -> i64 {
    let exponent = u32::from(tsresol & 0x7f);
    let ns = if tsresol & 0x80 == 0 {
        match 10u128.checked_pow(exponent) {
            Some(units) => u128::from(ticks) * 1_000_000_000 / units,
            None => 0,
        }
    } else {
        match 1u128.checked_shl(exponent) {
            Some(units) => u128::from(ticks) * 1_000_000_000 / units,
            None => 0,
        }
    };
    i64::try_from(ns).unwrap_or(i64::MAX)
}
