use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;

use super::{CaptureHandle, Interrupter, RawFrame};

/// Replays frames held in memory.
///
/// Frames are numbered from 1 and stamped one microsecond apart.
pub struct MemoryCapture {
    link_type: u32,
    frames: VecDeque<Bytes>,
    index: u64,
    stopped: Arc<AtomicBool>,
}

impl MemoryCapture {
    pub fn new(link_type: u32, frames: impl IntoIterator<Item = Bytes>) -> Self {
        Self {
            link_type,
            frames: frames.into_iter().collect(),
            index: 0,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl CaptureHandle for MemoryCapture {
    fn link_type(&self) -> u32 {
        self.link_type
    }

    fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        if self.stopped.load(Ordering::Acquire) {
            return Ok(None);
        }
        let Some(data) = self.frames.pop_front() else {
            return Ok(None);
        };
        self.index += 1;
        Ok(Some(RawFrame {
            index: self.index,
            timestamp_ns: self.index as i64 * 1_000,
            link_type: self.link_type,
            captured_len: data.len() as u32,
            original_len: data.len() as u32,
            data,
        }))
    }

    fn interrupter(&self) -> Interrupter {
        let stopped = Arc::clone(&self.stopped);
        Arc::new(move || stopped.store(true, Ordering::Release))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_replay() {
        let mut capture = MemoryCapture::new(
            101,
            vec![Bytes::from_static(&[0x45]), Bytes::from_static(&[0x60, 0])],
        );
        let first = capture.next_frame().unwrap().unwrap();
        assert_eq!(first.index, 1);
        assert_eq!(first.link_type, 101);
        let second = capture.next_frame().unwrap().unwrap();
        assert_eq!(second.index, 2);
        assert_eq!(second.captured_len, 2);
        assert!(second.timestamp_ns > first.timestamp_ns);
        assert!(capture.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_memory_interrupt() {
        let mut capture = MemoryCapture::new(1, vec![Bytes::from_static(&[1]); 3]);
        capture.interrupter()();
        assert!(capture.next_frame().unwrap().is_none());
    }
}
