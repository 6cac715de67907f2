mod classifier;
mod color;
mod compositor;
mod inline;
pub mod types;
mod worker;

pub use classifier::{classify, classify_frame, KEY_THRESHOLD};
pub use color::{to_hsl, Hsl};
pub use compositor::{composite, BackgroundCache};
pub use inline::InlineProcessor;
pub use types::{Classification, KeyProcessor};
pub use worker::WorkerProcessor;

use anyhow::Result;

/// Create the key processor selected by configuration
pub fn create_processor(offload: bool) -> Result<Box<dyn KeyProcessor>> {
    if offload {
        Ok(Box::new(WorkerProcessor::spawn()?))
    } else {
        Ok(Box::new(InlineProcessor::new()))
    }
}
