mod loopback;
mod memory;

pub use loopback::V4L2Output;
pub use memory::{MemorySink, NullSink};

use crate::frame::Frame;
use anyhow::Result;

/// Trait for render targets
pub trait OutputSink: Send {
    /// Present a composited frame
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;

    /// Get the fixed output resolution, if the target has one
    fn resolution(&self) -> Option<(u32, u32)>;
}
