//! Real-time chroma keying for frame streams.
//!
//! A [`FramePipeline`] pulls frames from a [`FrameSource`], classifies each
//! pixel against the current [`KeyConfig`], replaces key pixels with a
//! background or transparency, and renders the result to an
//! [`OutputSink`]. A [`Recorder`] can capture the composited stream.

pub mod capture;
pub mod config;
pub mod error;
pub mod export;
pub mod frame;
pub mod keying;
pub mod output;
pub mod pipeline;
pub mod recorder;

pub use capture::{FrameSource, SourceStatus};
pub use config::{Background, ConfigSnapshot, ConfigStore, KeyConfig};
pub use error::{KeyError, KeyResult};
pub use frame::Frame;
pub use keying::{Classification, KeyProcessor};
pub use output::OutputSink;
pub use pipeline::{FramePipeline, Pacing, RunState, TickOutcome};
pub use recorder::{Asset, RecordFormat, Recorder};
