use anyhow::{bail, Context, Result};
use chromakey::capture::{FrameSource, ImageSequenceSource, VideoFileSource};
use chromakey::output::{NullSink, OutputSink, V4L2Output};
use chromakey::{
    export, keying, Background, ConfigStore, FramePipeline, KeyConfig, Pacing, RecordFormat,
    Recorder,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How often the main thread checks progress.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A file source that renders nothing new for this long is finished.
const IDLE_EXIT: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Capture from the webcam with this device index
    #[arg(long, conflicts_with_all = ["video", "frames"])]
    camera: Option<u32>,

    /// Key a video file (decoded with ffmpeg)
    #[arg(long, conflicts_with = "frames")]
    video: Option<PathBuf>,

    /// Key a directory of still images, played in name order
    #[arg(long)]
    frames: Option<PathBuf>,

    /// Restart file sources when they reach the end
    #[arg(long = "loop")]
    looping: bool,

    /// Capture resolution width
    #[arg(long, default_value_t = 1280)]
    capture_width: u32,

    /// Capture resolution height
    #[arg(long, default_value_t = 720)]
    capture_height: u32,

    /// Target frames per second
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Output v4l2loopback device path
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Image shown behind keyed pixels; without one they become transparent
    #[arg(long)]
    background: Option<PathBuf>,

    /// Key colour preset
    #[arg(long, default_value = "green")]
    preset: String,

    /// JSON file with a full key config, overriding the preset
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run keying on a worker thread
    #[arg(long)]
    worker: bool,

    /// Record the composited stream to this file
    #[arg(long)]
    record: Option<PathBuf>,

    /// Recording format
    #[arg(long, value_enum, default_value_t = RecordFormat::Mjpeg)]
    record_format: RecordFormat,

    /// Save the last composited frame as PNG on exit
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Stop after this many frames
    #[arg(long)]
    frames_limit: Option<u64>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    tracing::info!("chromakey starting");
    tracing::info!("Target FPS: {}", args.fps);

    if args.fps == 0 {
        bail!("--fps must be above zero");
    }

    let key = load_key_config(&args)?;
    tracing::info!(
        "Key range: hue {}-{}, saturation {}-{}, lightness {}-{}, tolerance {}",
        key.hue_min,
        key.hue_max,
        key.saturation_min,
        key.saturation_max,
        key.lightness_min,
        key.lightness_max,
        key.tolerance
    );
    let config = ConfigStore::new(KeyConfig::default());
    config.set(key).context("Rejected key config")?;

    if let Some(path) = &args.background {
        tracing::info!("Loading background from {}", path.display());
        config.set_background(Some(Background::load(path)));
    }

    let source = open_source(&args)?;
    let file_source = args.video.is_some() || args.frames.is_some();

    let sink: Box<dyn OutputSink> = match &args.output {
        Some(path) => Box::new(
            V4L2Output::new(path, args.capture_width, args.capture_height)
                .context("Failed to initialize v4l2loopback output")?,
        ),
        None => {
            tracing::info!("No output device given, frames are only recorded or exported");
            Box::new(NullSink)
        }
    };

    let processor =
        keying::create_processor(args.worker).context("Failed to create key processor")?;

    let mut pipeline = FramePipeline::new(config, processor, sink, Pacing::Fixed { fps: args.fps });
    pipeline.set_source(source);

    let mut recorder = match &args.record {
        Some(path) => {
            let mut recorder = Recorder::new(args.record_format, args.fps);
            recorder
                .start(&pipeline)
                .context("Failed to start recording")?;
            tracing::info!("Recording to {}", path.display());
            Some(recorder)
        }
        None => None,
    };

    let interrupted = watch_ctrl_c().context("Failed to install Ctrl+C handler")?;

    pipeline.start().context("Failed to start pipeline")?;
    if args.frames_limit.is_none() && (!file_source || args.looping) {
        tracing::info!("Press Ctrl+C to stop");
    }

    run_until_done(
        &pipeline,
        args.frames_limit,
        file_source && !args.looping,
        &interrupted,
    );

    if let (Some(recorder), Some(path)) = (recorder.as_mut(), &args.record) {
        let asset = recorder.stop().context("Failed to finish recording")?;
        tracing::info!(
            "Recorded {} frames ({} dropped) as {}",
            asset.frames,
            asset.dropped_frames,
            asset.mime_type
        );
        if asset.is_empty() {
            tracing::warn!("Nothing was recorded, skipping {}", path.display());
        } else {
            asset
                .save(path)
                .with_context(|| format!("Failed to save recording to {}", path.display()))?;
        }
    }

    pipeline.stop();

    if let Some(path) = &args.snapshot {
        let png = pipeline.snapshot_png().context("Failed to take snapshot")?;
        export::write_asset(path, &png)
            .with_context(|| format!("Failed to save snapshot to {}", path.display()))?;
    }

    if let Some(e) = pipeline.last_error() {
        tracing::warn!("Last pipeline error: {}", e);
    }
    tracing::info!("Processed {} frames", pipeline.frames_processed());
    Ok(())
}

fn load_key_config(args: &Args) -> Result<KeyConfig> {
    if let Some(path) = &args.config {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read key config {}", path.display()))?;
        return KeyConfig::from_json(&text)
            .with_context(|| format!("Failed to parse key config {}", path.display()));
    }
    KeyConfig::preset(&args.preset)
        .with_context(|| format!("Unknown preset '{}' (expected green or blue)", args.preset))
}

fn open_source(args: &Args) -> Result<Box<dyn FrameSource>> {
    if let Some(path) = &args.video {
        let source = VideoFileSource::open(path, args.looping)
            .with_context(|| format!("Failed to open video {}", path.display()))?;
        return Ok(Box::new(source));
    }
    if let Some(dir) = &args.frames {
        let source = ImageSequenceSource::open(dir, args.looping)
            .with_context(|| format!("Failed to open image sequence {}", dir.display()))?;
        return Ok(Box::new(source));
    }
    open_camera(args.camera.unwrap_or(0), args.capture_width, args.capture_height)
}

#[cfg(feature = "camera")]
fn open_camera(index: u32, width: u32, height: u32) -> Result<Box<dyn FrameSource>> {
    let source = chromakey::capture::WebcamSource::new(index, width, height)
        .context("Failed to initialize webcam capture")?;
    Ok(Box::new(source))
}

#[cfg(not(feature = "camera"))]
fn open_camera(_index: u32, _width: u32, _height: u32) -> Result<Box<dyn FrameSource>> {
    bail!("built without the `camera` feature; use --video or --frames")
}

/// Raise the returned flag on Ctrl+C so the main loop can still save the
/// recording and snapshot.
fn watch_ctrl_c() -> Result<Arc<AtomicBool>> {
    let interrupted = Arc::new(AtomicBool::new(false));
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build signal runtime")?;

    let flag = Arc::clone(&interrupted);
    std::thread::Builder::new()
        .name("ctrl-c".into())
        .spawn(move || {
            runtime.block_on(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        tracing::info!("Interrupted, finishing up");
                        flag.store(true, Ordering::Release);
                    }
                    Err(e) => tracing::warn!("Failed to listen for Ctrl+C: {}", e),
                }
            })
        })
        .context("Failed to spawn Ctrl+C thread")?;

    Ok(interrupted)
}

/// Block until the frame limit is reached, a finite source stops producing
/// frames, or `interrupted` is raised.
fn run_until_done(
    pipeline: &FramePipeline,
    frames_limit: Option<u64>,
    finite: bool,
    interrupted: &AtomicBool,
) {
    let mut last_count = 0u64;
    let mut last_progress = Instant::now();

    loop {
        if interrupted.load(Ordering::Acquire) {
            return;
        }
        std::thread::sleep(POLL_INTERVAL);
        let count = pipeline.frames_processed();

        if let Some(limit) = frames_limit {
            if count >= limit {
                tracing::info!("Reached frame limit of {}", limit);
                return;
            }
        }

        if count != last_count {
            last_count = count;
            last_progress = Instant::now();
        } else if finite && count > 0 && last_progress.elapsed() >= IDLE_EXIT {
            tracing::info!("Source finished");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chromakey::keying::InlineProcessor;

    fn idle_pipeline() -> FramePipeline {
        FramePipeline::new(
            ConfigStore::default(),
            Box::new(InlineProcessor::new()),
            Box::new(NullSink),
            Pacing::External,
        )
    }

    #[test]
    fn interrupt_ends_an_unbounded_run() {
        let pipeline = idle_pipeline();
        let interrupted = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&interrupted);
        let raiser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            flag.store(true, Ordering::Release);
        });

        let started = Instant::now();
        run_until_done(&pipeline, None, false, &interrupted);
        assert!(started.elapsed() < Duration::from_secs(5));
        raiser.join().unwrap();
    }

    #[test]
    fn already_interrupted_returns_at_once() {
        let pipeline = idle_pipeline();
        let started = Instant::now();
        run_until_done(&pipeline, Some(1_000), false, &AtomicBool::new(true));
        assert!(started.elapsed() < POLL_INTERVAL);
    }
}
