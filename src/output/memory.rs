use super::OutputSink;
use crate::frame::Frame;
use anyhow::Result;
use std::sync::{Arc, Mutex, PoisonError};

/// Keeps every presented frame in memory.
///
/// Clones share the same buffer, so a caller can keep one handle while the
/// pipeline owns the other.
#[derive(Clone, Default)]
pub struct MemorySink {
    frames: Arc<Mutex<Vec<Frame>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last(&self) -> Option<Frame> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl OutputSink for MemorySink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame.clone());
        Ok(())
    }

    fn resolution(&self) -> Option<(u32, u32)> {
        None
    }
}

/// Discards frames. Used when only recording or snapshots are wanted.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn write_frame(&mut self, _frame: &Frame) -> Result<()> {
        Ok(())
    }

    fn resolution(&self) -> Option<(u32, u32)> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_observe_the_same_frames() {
        let observer = MemorySink::new();
        let mut sink: Box<dyn OutputSink> = Box::new(observer.clone());
        sink.write_frame(&Frame::solid(1, 1, [1, 2, 3, 4])).unwrap();
        sink.write_frame(&Frame::solid(1, 1, [5, 6, 7, 8])).unwrap();

        assert_eq!(observer.len(), 2);
        assert_eq!(observer.last().unwrap().pixel(0, 0), [5, 6, 7, 8]);
    }
}
