use super::classifier::classify_frame;
use super::compositor::{composite, BackgroundCache};
use super::types::KeyProcessor;
use crate::config::ConfigSnapshot;
use crate::frame::Frame;
use anyhow::Result;

/// Classifies and composites on the calling thread.
#[derive(Default)]
pub struct InlineProcessor {
    backgrounds: BackgroundCache,
}

impl InlineProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Infallible form of [`KeyProcessor::process`].
    pub fn key_frame(&mut self, frame: &Frame, snapshot: &ConfigSnapshot) -> Frame {
        let _span = tracing::debug_span!("key_frame").entered();
        let (width, height) = frame.dimensions();
        let background = self
            .backgrounds
            .prepare(snapshot.background.as_ref(), width, height);

        let classifications = classify_frame(frame, &snapshot.key);
        composite(frame, &classifications, background.as_deref())
    }
}

impl KeyProcessor for InlineProcessor {
    fn process(&mut self, frame: &Frame, snapshot: &ConfigSnapshot) -> Result<Frame> {
        Ok(self.key_frame(frame, snapshot))
    }

    fn reset_state(&mut self) {
        self.backgrounds.clear();
    }

    fn name(&self) -> &'static str {
        "inline"
    }
}
