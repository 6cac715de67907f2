mod clip;
mod image_sequence;
mod video_file;
#[cfg(feature = "camera")]
mod webcam;

pub use clip::{ClipControls, ClipSource};
pub use image_sequence::ImageSequenceSource;
pub use video_file::{probe_video, VideoFileSource, VideoInfo};
#[cfg(feature = "camera")]
pub use webcam::WebcamSource;

use crate::error::KeyResult;
use crate::frame::Frame;

/// Readiness of a frame source at the start of a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    /// No frame newer than the last one delivered is available yet.
    NotReady,
    Ready,
    Paused,
    Ended,
}

/// Trait for anything that delivers decoded frames: capture devices,
/// decoded video files, image sequences
pub trait FrameSource: Send {
    /// Poll the source state; may prefetch the next frame
    fn status(&mut self) -> SourceStatus;

    /// Get the resolution of delivered frames, `(0, 0)` while unknown
    fn resolution(&self) -> (u32, u32);

    /// Take the current frame
    fn capture_frame(&mut self) -> KeyResult<Frame>;

    /// Seek back to the start and resume after a pause or end of stream
    fn restart(&mut self) -> KeyResult<()>;

    /// Release the device or decoder; the source is unusable afterwards
    fn release(&mut self) {}

    /// Human-readable description for logs
    fn describe(&self) -> String;
}
