mod mjpeg;
mod webm;

pub use mjpeg::MjpegEncoder;
pub use webm::{is_ffmpeg_on_path, WebmEncoder};

use crate::error::{KeyError, KeyResult};
use crate::export;
use crate::frame::Frame;
use crate::pipeline::{FramePipeline, FrameTap, DEFAULT_TAP_CAPACITY};
use anyhow::Result;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How often the encode loop checks for a stop request while idle.
const STOP_POLL: Duration = Duration::from_millis(20);

/// Trait for recording encoders
///
/// Encoders push finished byte chunks into the session as they become
/// available, possibly from their own threads.
pub trait SegmentEncoder: Send {
    /// Encode one composited frame
    fn encode(&mut self, frame: &Frame, session: &RecordingSession) -> Result<()>;

    /// Flush everything still buffered
    fn finish(&mut self, session: &RecordingSession) -> Result<()>;

    fn mime_type(&self) -> &'static str;

    fn extension(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RecordFormat {
    /// Motion JPEG, one JPEG per frame (alpha flattened to black)
    Mjpeg,
    /// VP8 WebM with alpha, encoded by the system ffmpeg
    Webm,
}

struct SessionBuffer {
    segments: Vec<Vec<u8>>,
    bytes: usize,
    started_at: Instant,
}

/// Encoded segments buffered for the current recording, in arrival order.
///
/// Clones share the buffer so encoder helper threads can append to it.
#[derive(Clone)]
pub struct RecordingSession {
    inner: Arc<Mutex<SessionBuffer>>,
}

impl RecordingSession {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SessionBuffer {
                segments: Vec::new(),
                bytes: 0,
                started_at: Instant::now(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionBuffer> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, segment: Vec<u8>) {
        if segment.is_empty() {
            return;
        }
        let mut buffer = self.lock();
        buffer.bytes += segment.len();
        buffer.segments.push(segment);
    }

    pub fn segment_count(&self) -> usize {
        self.lock().segments.len()
    }

    pub fn byte_len(&self) -> usize {
        self.lock().bytes
    }

    pub fn elapsed(&self) -> Duration {
        self.lock().started_at.elapsed()
    }

    fn take(&self) -> Vec<Vec<u8>> {
        let mut buffer = self.lock();
        buffer.bytes = 0;
        std::mem::take(&mut buffer.segments)
    }
}

/// A finished recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub bytes: Vec<u8>,
    pub mime_type: &'static str,
    pub extension: &'static str,
    pub frames: u64,
    pub dropped_frames: u64,
    pub duration: Duration,
}

impl Asset {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn save(&self, path: &Path) -> KeyResult<()> {
        if self.is_empty() {
            return Err(KeyError::export("recording is empty"));
        }
        export::write_asset(path, &self.bytes)
    }
}

struct EncodeSummary {
    frames: u64,
    dropped: u64,
    mime_type: &'static str,
    extension: &'static str,
}

struct ActiveRecording {
    session: RecordingSession,
    stop: Arc<AtomicBool>,
    /// Set by the encode thread when it gives up on an error.
    failed: Arc<AtomicBool>,
    thread: JoinHandle<Result<EncodeSummary>>,
}

type EncoderFactory = Box<dyn Fn() -> Result<Box<dyn SegmentEncoder>> + Send>;

/// Captures a pipeline's composited output into a downloadable asset.
pub struct Recorder {
    factory: EncoderFactory,
    tap_capacity: usize,
    active: Option<ActiveRecording>,
}

impl Recorder {
    pub fn new(format: RecordFormat, fps: u32) -> Self {
        let factory: EncoderFactory = match format {
            RecordFormat::Mjpeg => Box::new(|| -> Result<Box<dyn SegmentEncoder>> {
                Ok(Box::new(MjpegEncoder::new()))
            }),
            RecordFormat::Webm => Box::new(move || -> Result<Box<dyn SegmentEncoder>> {
                Ok(Box::new(WebmEncoder::new(fps)?))
            }),
        };
        Self::with_encoder(factory)
    }

    /// Record with a custom encoder, created afresh for every session.
    pub fn with_encoder<F>(factory: F) -> Self
    where
        F: Fn() -> Result<Box<dyn SegmentEncoder>> + Send + 'static,
    {
        Self {
            factory: Box::new(factory),
            tap_capacity: DEFAULT_TAP_CAPACITY,
            active: None,
        }
    }

    pub fn with_tap_capacity(mut self, capacity: usize) -> Self {
        self.tap_capacity = capacity.max(1);
        self
    }

    /// Recording and still encoding. Turns false as soon as the encoder
    /// fails, before `stop` collects the error.
    pub fn is_active(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| !active.failed.load(Ordering::Acquire))
    }

    /// The current session's encoder has failed; `stop` returns the error.
    pub fn has_failed(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| active.failed.load(Ordering::Acquire))
    }

    /// The current session's buffer, while recording.
    pub fn session(&self) -> Option<&RecordingSession> {
        self.active.as_ref().map(|active| &active.session)
    }

    /// Begin a new session recording `pipeline`'s rendered frames.
    ///
    /// Any buffer from a previous session is gone; on failure nothing is
    /// left half-started.
    pub fn start(&mut self, pipeline: &FramePipeline) -> KeyResult<()> {
        if self.has_failed() {
            if let Err(e) = self.stop() {
                tracing::warn!("Discarding failed recording: {}", e);
            }
        }
        if self.active.is_some() {
            return Err(KeyError::recorder("a recording is already in progress"));
        }
        if !pipeline.has_source() {
            return Err(KeyError::recorder("no active frame source to record"));
        }

        let encoder = (self.factory)().map_err(|e| KeyError::recorder(format!("{e:#}")))?;
        let session = RecordingSession::new();
        let tap = pipeline.subscribe(self.tap_capacity);
        let stop = Arc::new(AtomicBool::new(false));
        let failed = Arc::new(AtomicBool::new(false));

        let thread = {
            let session = session.clone();
            let stop = Arc::clone(&stop);
            let failed = Arc::clone(&failed);
            let drain_limit = self.tap_capacity;
            std::thread::Builder::new()
                .name("recorder".into())
                .spawn(move || {
                    let result = encode_loop(encoder, tap, session, stop, drain_limit);
                    if let Err(e) = &result {
                        tracing::error!("Recording encoder failed: {:#}", e);
                        failed.store(true, Ordering::Release);
                    }
                    result
                })
                .map_err(|e| KeyError::recorder(format!("failed to spawn recorder thread: {e}")))?
        };

        tracing::info!("Recording started");
        self.active = Some(ActiveRecording {
            session,
            stop,
            failed,
            thread,
        });
        Ok(())
    }

    /// Finish the session and hand back everything recorded as one asset.
    pub fn stop(&mut self) -> KeyResult<Asset> {
        let active = self
            .active
            .take()
            .ok_or_else(|| KeyError::recorder("no recording in progress"))?;
        active.stop.store(true, Ordering::Release);

        let summary = match active.thread.join() {
            Ok(Ok(summary)) => summary,
            Ok(Err(e)) => {
                active.session.take();
                tracing::warn!("Recording failed: {:#}", e);
                return Err(KeyError::recorder(format!("{e:#}")));
            }
            Err(_) => {
                active.session.take();
                return Err(KeyError::recorder("recorder thread panicked"));
            }
        };

        let duration = active.session.elapsed();
        let segments = active.session.take();
        let segment_count = segments.len();
        let bytes = segments.concat();

        tracing::info!(
            "Recording finished: frames={}, dropped={}, segments={}, bytes={}",
            summary.frames,
            summary.dropped,
            segment_count,
            bytes.len()
        );

        Ok(Asset {
            bytes,
            mime_type: summary.mime_type,
            extension: summary.extension,
            frames: summary.frames,
            dropped_frames: summary.dropped,
            duration,
        })
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if self.active.is_some() {
            if let Err(e) = self.stop() {
                tracing::warn!("Discarding recording: {}", e);
            }
        }
    }
}

fn encode_loop(
    mut encoder: Box<dyn SegmentEncoder>,
    tap: FrameTap,
    session: RecordingSession,
    stop: Arc<AtomicBool>,
    drain_limit: usize,
) -> Result<EncodeSummary> {
    let _span = tracing::debug_span!("recorder").entered();
    let mut frames = 0u64;

    while !stop.load(Ordering::Acquire) {
        match tap.recv_timeout(STOP_POLL) {
            Ok(frame) => {
                encoder.encode(&frame, &session)?;
                frames += 1;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                tracing::debug!("Pipeline went away, finishing recording");
                break;
            }
        }
    }

    // Frames rendered before the stop request are still queued.
    for _ in 0..drain_limit {
        let Some(frame) = tap.try_recv() else {
            break;
        };
        encoder.encode(&frame, &session)?;
        frames += 1;
    }

    encoder.finish(&session)?;
    Ok(EncodeSummary {
        frames,
        dropped: tap.dropped(),
        mime_type: encoder.mime_type(),
        extension: encoder.extension(),
    })
}
