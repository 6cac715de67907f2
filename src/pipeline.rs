use crate::capture::{FrameSource, SourceStatus};
use crate::config::{ConfigStore, ListenerId};
use crate::error::{KeyError, KeyResult};
use crate::export;
use crate::frame::Frame;
use crate::keying::KeyProcessor;
use crate::output::OutputSink;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Length of the rolling window used for the fps metric.
pub const FPS_WINDOW: Duration = Duration::from_secs(1);

/// Consecutive failed restarts before a stalled source is reported.
pub const MAX_RESTART_ATTEMPTS: u32 = 3;

/// Frames buffered per subscriber before new ones are dropped.
pub const DEFAULT_TAP_CAPACITY: usize = 8;

/// What drives the tick loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// An internal thread ticks at a fixed rate.
    Fixed { fps: u32 },
    /// The host calls [`FramePipeline::tick`] from its own refresh signal.
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
}

/// Result of a single tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A new frame was keyed and rendered.
    Processed,
    /// The source is paused or ended; the last good frame was shown again.
    Represented,
    /// The source was paused or ended with nothing cached; it was restarted.
    Restarted,
    /// Source dimensions or first frame unknown; retry next tick.
    NotReady,
    NoSource,
    /// The pipeline was stopped before this tick could run.
    Cancelled,
    /// The tick hit an error; it was logged and the loop carries on.
    Failed,
}

struct PipelineState {
    frames_in_window: u32,
    window_start: Instant,
    last_good_frame: Option<Frame>,
    last_source_frame: Option<Frame>,
    restart_failures: u32,
}

impl PipelineState {
    fn new() -> Self {
        Self {
            frames_in_window: 0,
            window_start: Instant::now(),
            last_good_frame: None,
            last_source_frame: None,
            restart_failures: 0,
        }
    }
}

#[derive(Default)]
struct Metrics {
    fps_bits: AtomicU32,
    frames_total: AtomicU64,
    last_error: Mutex<Option<KeyError>>,
}

impl Metrics {
    fn set_fps(&self, fps: f32) {
        self.fps_bits.store(fps.to_bits(), Ordering::Relaxed);
    }

    fn fps(&self) -> f32 {
        f32::from_bits(self.fps_bits.load(Ordering::Relaxed))
    }

    fn record_error(&self, error: KeyError) {
        *self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(error);
    }
}

struct TapSender {
    sender: SyncSender<Frame>,
    dropped: Arc<AtomicU64>,
}

/// Receiving end of a subscription to the pipeline's composited frames.
///
/// Frames arrive in render order. When the subscriber falls more than its
/// capacity behind, new frames are dropped and counted instead of queued.
pub struct FrameTap {
    receiver: Receiver<Frame>,
    dropped: Arc<AtomicU64>,
}

impl FrameTap {
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Frame, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Option<Frame> {
        self.receiver.try_recv().ok()
    }

    /// Frames skipped because this subscriber was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct Engine {
    source: Option<Box<dyn FrameSource>>,
    processor: Box<dyn KeyProcessor>,
    sink: Box<dyn OutputSink>,
    config: ConfigStore,
    state: PipelineState,
    taps: Vec<TapSender>,
}

impl Engine {
    fn tick(&mut self, running: &AtomicBool, metrics: &Metrics) -> TickOutcome {
        // A tick queued before stop() must not touch anything.
        if !running.load(Ordering::Acquire) {
            return TickOutcome::Cancelled;
        }
        let outcome = self.step(metrics);
        self.update_window(metrics, outcome == TickOutcome::Processed);
        outcome
    }

    fn step(&mut self, metrics: &Metrics) -> TickOutcome {
        let Some(source) = self.source.as_mut() else {
            return TickOutcome::NoSource;
        };

        let (width, height) = source.resolution();
        if width == 0 || height == 0 {
            tracing::debug!("Source not sized yet, waiting");
            return TickOutcome::NotReady;
        }

        match source.status() {
            SourceStatus::NotReady => TickOutcome::NotReady,
            SourceStatus::Paused | SourceStatus::Ended => self.recover(metrics),
            SourceStatus::Ready => match source.capture_frame() {
                Ok(frame) => {
                    self.state.restart_failures = 0;
                    self.process_and_present(frame, metrics)
                }
                Err(e) => {
                    tracing::warn!("Failed to capture frame: {}", e);
                    metrics.record_error(e);
                    TickOutcome::Failed
                }
            },
        }
    }

    fn recover(&mut self, metrics: &Metrics) -> TickOutcome {
        if let Some(frame) = self.state.last_good_frame.clone() {
            self.present(&frame);
            return TickOutcome::Represented;
        }

        let Some(source) = self.source.as_mut() else {
            return TickOutcome::NoSource;
        };
        match source.restart() {
            Ok(()) => {
                tracing::info!("Restarted {}", source.describe());
                self.state.restart_failures = 0;
                TickOutcome::Restarted
            }
            Err(e) => {
                self.state.restart_failures += 1;
                let attempts = self.state.restart_failures;
                if attempts >= MAX_RESTART_ATTEMPTS {
                    let error = KeyError::stalled(format!(
                        "{} failed to restart {} times: {}",
                        source.describe(),
                        attempts,
                        e
                    ));
                    tracing::warn!("{}", error);
                    metrics.record_error(error);
                } else {
                    tracing::debug!("Restart attempt {} failed: {}", attempts, e);
                }
                TickOutcome::Failed
            }
        }
    }

    fn process_and_present(&mut self, raw: Frame, metrics: &Metrics) -> TickOutcome {
        let snapshot = self.config.get();
        let keyed = match self.processor.process(&raw, &snapshot) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Keying with {} processor failed: {:#}", self.processor.name(), e);
                return TickOutcome::Failed;
            }
        };

        self.present(&keyed);
        self.broadcast(&keyed);
        self.state.last_source_frame = Some(raw);
        self.state.last_good_frame = Some(keyed);
        metrics.frames_total.fetch_add(1, Ordering::Relaxed);
        TickOutcome::Processed
    }

    /// Key the most recent source frame again with the current config.
    fn recomposite(&mut self, metrics: &Metrics) -> bool {
        match self.state.last_source_frame.clone() {
            Some(raw) => self.process_and_present(raw, metrics) == TickOutcome::Processed,
            None => false,
        }
    }

    fn present(&mut self, frame: &Frame) {
        if let Err(e) = self.sink.write_frame(frame) {
            tracing::warn!("Failed to render frame: {:#}", e);
        }
    }

    fn broadcast(&mut self, frame: &Frame) {
        self.taps
            .retain(|tap| match tap.sender.try_send(frame.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tap.dropped.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            });
    }

    fn update_window(&mut self, metrics: &Metrics, processed: bool) {
        if processed {
            self.state.frames_in_window += 1;
        }
        let elapsed = self.state.window_start.elapsed();
        if elapsed >= FPS_WINDOW {
            let fps = self.state.frames_in_window as f32 / elapsed.as_secs_f32();
            metrics.set_fps(fps);
            tracing::info!(
                "Frames={} in {:.2}s, fps={:.1}, total={}",
                self.state.frames_in_window,
                elapsed.as_secs_f32(),
                fps,
                metrics.frames_total.load(Ordering::Relaxed)
            );
            self.state.frames_in_window = 0;
            self.state.window_start = Instant::now();
        }
    }
}

fn lock(engine: &Mutex<Engine>) -> MutexGuard<'_, Engine> {
    engine.lock().unwrap_or_else(PoisonError::into_inner)
}

struct RunHandle {
    running: Arc<AtomicBool>,
    stop: Sender<()>,
    thread: Option<JoinHandle<()>>,
    listener: ListenerId,
}

/// Pulls frames from a [`FrameSource`], keys them and renders the result.
///
/// The pipeline is either `Idle` or `Running`. Each start creates a fresh
/// "still running" flag that every tick checks before doing any work, so a
/// tick that was already scheduled when [`stop`](Self::stop) ran is a no-op.
/// Ticks are serialized: at most one frame is in flight per pipeline.
pub struct FramePipeline {
    engine: Arc<Mutex<Engine>>,
    metrics: Arc<Metrics>,
    config: ConfigStore,
    pacing: Pacing,
    run: Option<RunHandle>,
}

impl FramePipeline {
    pub fn new(
        config: ConfigStore,
        processor: Box<dyn KeyProcessor>,
        sink: Box<dyn OutputSink>,
        pacing: Pacing,
    ) -> Self {
        tracing::info!(
            "Pipeline created with {} processor, pacing {:?}",
            processor.name(),
            pacing
        );
        Self {
            engine: Arc::new(Mutex::new(Engine {
                source: None,
                processor,
                sink,
                config: config.clone(),
                state: PipelineState::new(),
                taps: Vec::new(),
            })),
            metrics: Arc::new(Metrics::default()),
            config,
            pacing,
            run: None,
        }
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    pub fn state(&self) -> RunState {
        if self.run.is_some() {
            RunState::Running
        } else {
            RunState::Idle
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == RunState::Running
    }

    pub fn has_source(&self) -> bool {
        lock(&self.engine).source.is_some()
    }

    /// Attach a new source. A running pipeline is stopped and the previous
    /// source released first; call [`start`](Self::start) again afterwards.
    pub fn set_source(&mut self, source: Box<dyn FrameSource>) {
        self.detach_source();
        let mut engine = lock(&self.engine);
        tracing::info!("Attached {}", source.describe());
        engine.source = Some(source);
    }

    /// Stop and release the current source, if any.
    pub fn detach_source(&mut self) {
        self.stop();
        let mut engine = lock(&self.engine);
        if let Some(mut previous) = engine.source.take() {
            tracing::info!("Releasing {}", previous.describe());
            previous.release();
        }
        engine.processor.reset_state();
        engine.state = PipelineState::new();
    }

    pub fn start(&mut self) -> KeyResult<()> {
        if self.run.is_some() {
            return Ok(());
        }
        {
            let mut engine = lock(&self.engine);
            if engine.source.is_none() {
                return Err(KeyError::source_unavailable("no frame source attached"));
            }
            engine.state.frames_in_window = 0;
            engine.state.window_start = Instant::now();
        }

        let running = Arc::new(AtomicBool::new(true));
        let listener = self.watch_config(Arc::clone(&running));
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let thread = match self.pacing {
            Pacing::Fixed { fps } => {
                let interval = Duration::from_secs_f64(1.0 / f64::from(fps.max(1)));
                let engine = Arc::clone(&self.engine);
                let metrics = Arc::clone(&self.metrics);
                let flag = Arc::clone(&running);
                let spawned = std::thread::Builder::new()
                    .name("frame-pipeline".into())
                    .spawn(move || run_loop(engine, metrics, flag, stop_rx, interval));
                match spawned {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        self.config.unwatch(listener);
                        return Err(KeyError::source_unavailable(format!(
                            "failed to spawn pipeline thread: {e}"
                        )));
                    }
                }
            }
            Pacing::External => None,
        };

        tracing::info!("Pipeline started");
        self.run = Some(RunHandle {
            running,
            stop: stop_tx,
            thread,
            listener,
        });
        Ok(())
    }

    /// Stop ticking. Returns once no further tick can do work.
    pub fn stop(&mut self) {
        let Some(mut run) = self.run.take() else {
            return;
        };
        run.running.store(false, Ordering::Release);
        self.config.unwatch(run.listener);
        let _ = run.stop.send(());
        if let Some(thread) = run.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("Pipeline thread panicked");
            }
        }
        self.metrics.set_fps(0.0);
        tracing::info!(
            "Pipeline stopped after {} frames",
            self.metrics.frames_total.load(Ordering::Relaxed)
        );
    }

    /// Run one tick now. Used with [`Pacing::External`]; outside a run this
    /// returns [`TickOutcome::Cancelled`].
    pub fn tick(&self) -> TickOutcome {
        let Some(run) = &self.run else {
            return TickOutcome::Cancelled;
        };
        lock(&self.engine).tick(&run.running, &self.metrics)
    }

    /// Key the most recent frame again with the current config.
    pub fn recomposite(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        lock(&self.engine).recomposite(&self.metrics)
    }

    /// Receive every newly composited frame.
    pub fn subscribe(&self, capacity: usize) -> FrameTap {
        let (sender, receiver) = mpsc::sync_channel(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        lock(&self.engine).taps.push(TapSender {
            sender,
            dropped: Arc::clone(&dropped),
        });
        FrameTap { receiver, dropped }
    }

    /// Frames per second over the last completed window.
    pub fn fps(&self) -> f32 {
        self.metrics.fps()
    }

    pub fn frames_processed(&self) -> u64 {
        self.metrics.frames_total.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<KeyError> {
        self.metrics
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The most recently rendered composited frame.
    pub fn last_frame(&self) -> Option<Frame> {
        lock(&self.engine).state.last_good_frame.clone()
    }

    /// Encode the most recently rendered frame as PNG.
    pub fn snapshot_png(&self) -> KeyResult<Vec<u8>> {
        let frame = self
            .last_frame()
            .ok_or_else(|| KeyError::export("no frame has been rendered yet"))?;
        export::encode_png(&frame)
    }

    fn watch_config(&self, running: Arc<AtomicBool>) -> ListenerId {
        let engine: Weak<Mutex<Engine>> = Arc::downgrade(&self.engine);
        let metrics = Arc::clone(&self.metrics);
        self.config.watch(move |change| {
            if !running.load(Ordering::Acquire) {
                return;
            }
            let Some(engine) = engine.upgrade() else {
                return;
            };
            if lock(&engine).recomposite(&metrics) {
                tracing::debug!("Re-composited last frame after {:?} change", change);
            }
        })
    }
}

impl Drop for FramePipeline {
    fn drop(&mut self) {
        self.detach_source();
    }
}

fn run_loop(
    engine: Arc<Mutex<Engine>>,
    metrics: Arc<Metrics>,
    running: Arc<AtomicBool>,
    stop: Receiver<()>,
    interval: Duration,
) {
    tracing::debug!("Tick loop running every {:?}", interval);
    let mut next_tick = Instant::now() + interval;
    loop {
        let wait = next_tick.saturating_duration_since(Instant::now());
        match stop.recv_timeout(wait) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        if !running.load(Ordering::Acquire) {
            break;
        }

        let outcome = lock(&engine).tick(&running, &metrics);
        if outcome == TickOutcome::Cancelled {
            break;
        }

        next_tick += interval;
        let now = Instant::now();
        if next_tick < now {
            // Fell behind; don't try to catch up with a burst of ticks.
            next_tick = now;
        }
    }
    tracing::debug!("Tick loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::ClipSource;
    use crate::config::{Background, KeyConfig};
    use crate::keying::InlineProcessor;
    use crate::output::MemorySink;
    use image::{Rgba, RgbaImage};

    fn green_red() -> Frame {
        Frame::from_raw(2, 1, vec![0, 255, 0, 255, 255, 0, 0, 255]).unwrap()
    }

    fn pipeline(sink: &MemorySink, pacing: Pacing) -> FramePipeline {
        FramePipeline::new(
            ConfigStore::new(KeyConfig::green()),
            Box::new(InlineProcessor::new()),
            Box::new(sink.clone()),
            pacing,
        )
    }

    #[test]
    fn start_without_source_stays_idle() {
        let sink = MemorySink::new();
        let mut p = pipeline(&sink, Pacing::External);
        assert!(matches!(p.start(), Err(KeyError::SourceUnavailable(_))));
        assert_eq!(p.state(), RunState::Idle);
    }

    #[test]
    fn tick_keys_and_renders() {
        let sink = MemorySink::new();
        let mut p = pipeline(&sink, Pacing::External);
        p.set_source(Box::new(ClipSource::new(vec![green_red()])));
        p.start().unwrap();

        assert_eq!(p.tick(), TickOutcome::Processed);
        let out = sink.last().unwrap();
        assert_eq!(out.pixel(0, 0), [0, 255, 0, 0]);
        assert_eq!(out.pixel(1, 0), [255, 0, 0, 255]);
        assert_eq!(p.frames_processed(), 1);
    }

    #[test]
    fn unsized_source_is_skipped() {
        let sink = MemorySink::new();
        let mut p = pipeline(&sink, Pacing::External);
        let clip = ClipSource::new(vec![green_red()]);
        let controls = clip.controls();
        controls.set_ready(false);
        p.set_source(Box::new(clip));
        p.start().unwrap();

        assert_eq!(p.tick(), TickOutcome::NotReady);
        assert!(sink.is_empty());

        controls.set_ready(true);
        assert_eq!(p.tick(), TickOutcome::Processed);
    }

    #[test]
    fn ended_source_represents_last_good_frame() {
        let sink = MemorySink::new();
        let mut p = pipeline(&sink, Pacing::External);
        p.set_source(Box::new(ClipSource::new(vec![green_red()])));
        p.start().unwrap();

        assert_eq!(p.tick(), TickOutcome::Processed);
        let cached = p.last_frame().unwrap();
        assert_eq!(p.tick(), TickOutcome::Represented);
        assert_eq!(sink.last().unwrap(), cached);
        assert_eq!(p.frames_processed(), 1);
    }

    #[test]
    fn ended_source_without_cache_is_restarted() {
        let sink = MemorySink::new();
        let mut p = pipeline(&sink, Pacing::External);
        let clip = ClipSource::new(vec![green_red()]);
        let controls = clip.controls();
        controls.end();
        p.set_source(Box::new(clip));
        p.start().unwrap();

        assert_eq!(p.tick(), TickOutcome::Restarted);
        assert_eq!(controls.restarts(), 1);
        assert_eq!(p.tick(), TickOutcome::Processed);
    }

    #[test]
    fn repeated_restart_failures_surface_as_stalled() {
        let sink = MemorySink::new();
        let mut p = pipeline(&sink, Pacing::External);
        let clip = ClipSource::new(vec![green_red()]);
        let controls = clip.controls();
        controls.pause();
        controls.refuse_restart(true);
        p.set_source(Box::new(clip));
        p.start().unwrap();

        for _ in 0..MAX_RESTART_ATTEMPTS - 1 {
            assert_eq!(p.tick(), TickOutcome::Failed);
            assert!(p.last_error().is_none());
        }
        assert_eq!(p.tick(), TickOutcome::Failed);
        assert!(matches!(p.last_error(), Some(KeyError::StalledSource(_))));
        assert!(p.is_running());
    }

    #[test]
    fn stopped_pipeline_ignores_ticks() {
        let sink = MemorySink::new();
        let mut p = pipeline(&sink, Pacing::External);
        p.set_source(Box::new(ClipSource::new(vec![green_red()])));
        p.start().unwrap();
        p.stop();

        assert_eq!(p.tick(), TickOutcome::Cancelled);
        assert_eq!(p.frames_processed(), 0);
        assert!(sink.is_empty());
    }

    #[test]
    fn queued_tick_sees_the_old_flag() {
        let sink = MemorySink::new();
        let mut p = pipeline(&sink, Pacing::External);
        p.set_source(Box::new(ClipSource::new(vec![green_red()])));
        p.start().unwrap();

        // Simulates a tick scheduled under the previous run.
        let stale = Arc::clone(&p.run.as_ref().unwrap().running);
        p.stop();
        let outcome = lock(&p.engine).tick(&stale, &p.metrics);
        assert_eq!(outcome, TickOutcome::Cancelled);
        assert!(sink.is_empty());
    }

    #[test]
    fn background_change_recomposites_immediately() {
        let sink = MemorySink::new();
        let mut p = pipeline(&sink, Pacing::External);
        p.set_source(Box::new(ClipSource::new(vec![green_red()])));
        p.start().unwrap();
        p.tick();

        let bg = RgbaImage::from_pixel(2, 1, Rgba([9, 8, 7, 255]));
        p.config().set_background(Some(Background::from_image(bg)));

        let out = sink.last().unwrap();
        assert_eq!(out.pixel(0, 0), [9, 8, 7, 255]);
        assert_eq!(out.pixel(1, 0), [255, 0, 0, 255]);
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn config_changes_while_idle_do_not_render() {
        let sink = MemorySink::new();
        let mut p = pipeline(&sink, Pacing::External);
        p.set_source(Box::new(ClipSource::new(vec![green_red()])));
        p.start().unwrap();
        p.tick();
        p.stop();

        p.config().set_background(None);
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn switching_sources_releases_the_previous_one() {
        let sink = MemorySink::new();
        let mut p = pipeline(&sink, Pacing::External);
        let first = ClipSource::new(vec![green_red()]);
        let first_controls = first.controls();
        p.set_source(Box::new(first));
        p.start().unwrap();
        p.tick();

        p.set_source(Box::new(ClipSource::new(vec![green_red()])));
        assert!(first_controls.is_released());
        assert_eq!(p.state(), RunState::Idle);
        assert!(p.last_frame().is_none());
    }

    #[test]
    fn subscribers_receive_new_frames_only() {
        let sink = MemorySink::new();
        let mut p = pipeline(&sink, Pacing::External);
        p.set_source(Box::new(ClipSource::new(vec![green_red()])));
        let tap = p.subscribe(4);
        p.start().unwrap();

        p.tick();
        p.tick();
        assert!(tap.try_recv().is_some());
        assert!(tap.try_recv().is_none());
    }

    #[test]
    fn full_subscriber_counts_drops() {
        let sink = MemorySink::new();
        let mut p = pipeline(&sink, Pacing::External);
        p.set_source(Box::new(
            ClipSource::new(vec![green_red(), green_red(), green_red()]),
        ));
        let tap = p.subscribe(1);
        p.start().unwrap();
        for _ in 0..3 {
            p.tick();
        }
        assert_eq!(tap.dropped(), 2);
    }

    #[test]
    fn snapshot_requires_a_rendered_frame() {
        let sink = MemorySink::new();
        let mut p = pipeline(&sink, Pacing::External);
        assert!(matches!(p.snapshot_png(), Err(KeyError::Export(_))));

        p.set_source(Box::new(ClipSource::new(vec![green_red()])));
        p.start().unwrap();
        p.tick();
        let png = p.snapshot_png().unwrap();
        assert_eq!(&png[..4], b"\x89PNG");
    }
}
