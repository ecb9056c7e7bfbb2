//! Capture sources.
//!
//! This module provides:
//! - [`RawFrame`] - one captured frame with its timestamp and link type
//! - [`CaptureHandle`] / [`CaptureDriver`] - the open/read/close seam to a capture source
//! - [`DefaultDriver`] - pcap/pcapng files, in-memory frames and live capture via a command
//! - [`FrameQueue`] - the bounded producer/consumer queue between capture and dissection
//!
//! ## Components
//!
//! - [`PcapFrameReader`] - pcap/pcapng decoding over any byte stream
//! - [`CaptureCommand`] - live capture through an external tool writing pcap to stdout
//! - [`MemoryCapture`] - replay of frames held in memory

mod command;
mod memory;
mod pcap;
mod queue;

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{CaptureError, Result};

pub use command::{CaptureCommand, CommandCapture};
pub use memory::MemoryCapture;
pub use pcap::{PcapFormat, PcapFrameReader};
pub use queue::{FrameQueue, OverflowPolicy, PushOutcome};

/// Default snapshot length for live capture.
pub const DEFAULT_SNAPLEN: u32 = 262144;

/// One captured frame.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// 1-based position in the capture.
    pub index: u64,
    /// Capture time, nanoseconds since the Unix epoch.
    pub timestamp_ns: i64,
    pub link_type: u32,
    pub captured_len: u32,
    pub original_len: u32,
    pub data: Bytes,
}

/// Where frames come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureTarget {
    /// Live network interface.
    Interface(String),
    /// pcap or pcapng file.
    File(PathBuf),
    /// Frames already in memory, all of one link type.
    Frames { link_type: u32, frames: Vec<Bytes> },
}

impl CaptureTarget {
    pub fn is_live(&self) -> bool {
        matches!(self, CaptureTarget::Interface(_))
    }
}

impl fmt::Display for CaptureTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureTarget::Interface(name) => write!(f, "interface {name}"),
            CaptureTarget::File(path) => write!(f, "file {}", path.display()),
            CaptureTarget::Frames { frames, .. } => write!(f, "{} in-memory frames", frames.len()),
        }
    }
}

/// Options applied when a source is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenOptions {
    /// Native (BPF) filter handed to the capture tool.
    pub filter: Option<String>,
    pub promiscuous: bool,
    pub snaplen: u32,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            filter: None,
            promiscuous: false,
            snaplen: DEFAULT_SNAPLEN,
        }
    }
}

/// Stops a blocked [`CaptureHandle::next_frame`] from another thread.
///
/// After interruption `next_frame` returns `Ok(None)` once any frame already
/// being read has been returned.
pub type Interrupter = Arc<dyn Fn() + Send + Sync>;

/// An open capture source.
pub trait CaptureHandle: Send {
    /// Link type of the source's first interface.
    fn link_type(&self) -> u32;

    /// Next frame, blocking until one is available.
    ///
    /// `Ok(None)` signals a clean end of stream; errors are unrecoverable.
    fn next_frame(&mut self) -> Result<Option<RawFrame>>;

    /// Handle for interrupting a blocked read.
    fn interrupter(&self) -> Interrupter;

    /// Release the source. Also happens on drop.
    fn close(&mut self) {}
}

/// Opens capture sources.
pub trait CaptureDriver: Send + Sync {
    fn open(&self, target: &CaptureTarget, options: &OpenOptions) -> Result<Box<dyn CaptureHandle>>;
}

/// Driver for files, in-memory frames and live capture via [`CaptureCommand`].
#[derive(Debug, Clone, Default)]
pub struct DefaultDriver {
    command: CaptureCommand,
}

impl DefaultDriver {
    pub fn with_command(command: CaptureCommand) -> Self {
        Self { command }
    }

    pub fn command(&self) -> &CaptureCommand {
        &self.command
    }
}

impl CaptureDriver for DefaultDriver {
    fn open(&self, target: &CaptureTarget, options: &OpenOptions) -> Result<Box<dyn CaptureHandle>> {
        match target {
            CaptureTarget::File(path) => {
                if !path.exists() {
                    return Err(CaptureError::FileNotFound {
                        path: path.display().to_string(),
                    }
                    .into());
                }
                let file = File::open(path)?;
                Ok(Box::new(FileCapture::new(PcapFrameReader::new(BufReader::new(file))?)))
            }
            CaptureTarget::Frames { link_type, frames } => {
                Ok(Box::new(MemoryCapture::new(*link_type, frames.iter().cloned())))
            }
            CaptureTarget::Interface(name) => Ok(Box::new(self.command.spawn(name, options)?)),
        }
    }
}

/// Capture file replay.
pub struct FileCapture {
    reader: PcapFrameReader,
    stopped: Arc<AtomicBool>,
}

impl FileCapture {
    pub fn new(reader: PcapFrameReader) -> Self {
        Self {
            reader,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl CaptureHandle for FileCapture {
    fn link_type(&self) -> u32 {
        self.reader.link_type()
    }

    fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        if self.stopped.load(Ordering::Acquire) {
            return Ok(None);
        }
        self.reader.next_frame()
    }

    fn interrupter(&self) -> Interrupter {
        let stopped = Arc::clone(&self.stopped);
        Arc::new(move || stopped.store(true, Ordering::Release))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::test_utils::pcap_file;

    #[test]
    fn test_open_missing_file() {
        let driver = DefaultDriver::default();
        let target = CaptureTarget::File(PathBuf::from("/nonexistent/capture.pcap"));
        let err = driver.open(&target, &OpenOptions::default()).err().unwrap();
        assert!(matches!(err, Error::Capture(CaptureError::FileNotFound { .. })));
    }

    #[test]
    fn test_open_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("two.pcap");
        std::fs::write(&path, pcap_file(101, &[(1, 0, vec![0x45]), (2, 0, vec![0x45])])).unwrap();

        let driver = DefaultDriver::default();
        let mut handle = driver
            .open(&CaptureTarget::File(path), &OpenOptions::default())
            .unwrap();
        assert_eq!(handle.link_type(), 101);
        assert_eq!(handle.next_frame().unwrap().unwrap().index, 1);

        // Interrupting ends the stream early
        handle.interrupter()();
        assert!(handle.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_target_display() {
        assert_eq!(CaptureTarget::Interface("eth0".into()).to_string(), "interface eth0");
        assert!(CaptureTarget::Interface("eth0".into()).is_live());
        let frames = CaptureTarget::Frames {
            link_type: 1,
            frames: vec![Bytes::new()],
        };
        assert_eq!(frames.to_string(), "1 in-memory frames");
        assert!(!frames.is_live());
    }
}
