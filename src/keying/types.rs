use crate::config::ConfigSnapshot;
use crate::frame::Frame;
use anyhow::Result;

/// Per-pixel classification result. Lives for one tick only.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub is_key: bool,
    /// Similarity to the key colour in `[0, 1]`.
    pub similarity: f32,
}

impl Classification {
    pub const NONE: Classification = Classification {
        is_key: false,
        similarity: 0.0,
    };
}

/// Trait for classify+composite backends
/// Allows swapping between running on the pipeline thread and on a worker
pub trait KeyProcessor: Send {
    /// Key one frame against a configuration snapshot
    ///
    /// # Arguments
    /// * `frame` - Raw frame from the source
    /// * `snapshot` - Key config and background to apply
    ///
    /// # Returns
    /// * A new composited frame of the same dimensions
    fn process(&mut self, frame: &Frame, snapshot: &ConfigSnapshot) -> Result<Frame>;

    /// Drop cached state (scaled background, pending work)
    ///
    /// Call this when switching sources.
    fn reset_state(&mut self) {
        // Default implementation: nothing cached
    }

    /// Short name for logs
    fn name(&self) -> &'static str;
}
