use super::{RecordingSession, SegmentEncoder};
use crate::frame::Frame;
use anyhow::{bail, Context, Result};
use std::io::{Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread::JoinHandle;

const CHUNK_SIZE: usize = 64 * 1024;

pub fn is_ffmpeg_on_path() -> bool {
    Command::new("ffmpeg")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

struct EncoderProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    reader: Option<JoinHandle<std::io::Result<()>>>,
    width: u32,
    height: u32,
}

/// VP8 WebM with an alpha plane, produced by piping raw RGBA into the
/// system `ffmpeg`.
///
/// The muxed stream is read back from ffmpeg's stdout on a helper thread
/// and lands in the session chunk by chunk.
pub struct WebmEncoder {
    fps: u32,
    process: Option<EncoderProcess>,
}

impl WebmEncoder {
    pub fn new(fps: u32) -> Result<Self> {
        if fps == 0 {
            bail!("WebM recording needs a frame rate above zero");
        }
        if !is_ffmpeg_on_path() {
            bail!("ffmpeg is required for WebM recording, but was not found on PATH");
        }
        Ok(Self { fps, process: None })
    }

    fn spawn(&self, width: u32, height: u32, session: &RecordingSession) -> Result<EncoderProcess> {
        tracing::debug!("Starting ffmpeg WebM encoder at {}x{}@{}", width, height, self.fps);

        let mut child = Command::new("ffmpeg")
            .args([
                "-loglevel",
                "error",
                "-f",
                "rawvideo",
                "-pix_fmt",
                "rgba",
                "-s",
                &format!("{width}x{height}"),
                "-r",
                &self.fps.to_string(),
                "-i",
                "pipe:0",
                "-an",
                "-c:v",
                "libvpx",
                "-pix_fmt",
                "yuva420p",
                "-auto-alt-ref",
                "0",
                "-b:v",
                "2M",
                "-f",
                "webm",
                "pipe:1",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("Failed to spawn ffmpeg (is it installed and on PATH?)")?;

        let stdin = child.stdin.take().context("Failed to open ffmpeg stdin")?;
        let mut stdout = child.stdout.take().context("Failed to open ffmpeg stdout")?;

        let session = session.clone();
        let reader = std::thread::Builder::new()
            .name("webm-reader".into())
            .spawn(move || -> std::io::Result<()> {
                loop {
                    let mut chunk = vec![0u8; CHUNK_SIZE];
                    let n = stdout.read(&mut chunk)?;
                    if n == 0 {
                        return Ok(());
                    }
                    chunk.truncate(n);
                    session.push(chunk);
                }
            })
            .context("Failed to spawn WebM reader thread")?;

        Ok(EncoderProcess {
            child,
            stdin: Some(stdin),
            reader: Some(reader),
            width,
            height,
        })
    }
}

impl SegmentEncoder for WebmEncoder {
    fn encode(&mut self, frame: &Frame, session: &RecordingSession) -> Result<()> {
        if self.process.is_none() {
            self.process = Some(self.spawn(frame.width(), frame.height(), session)?);
        }
        let Some(process) = self.process.as_mut() else {
            bail!("ffmpeg encoder is not running");
        };

        if frame.dimensions() != (process.width, process.height) {
            bail!(
                "frame size changed mid-recording: got {}x{}, expected {}x{}",
                frame.width(),
                frame.height(),
                process.width,
                process.height
            );
        }

        let Some(stdin) = process.stdin.as_mut() else {
            bail!("ffmpeg encoder is already finalized");
        };
        stdin
            .write_all(frame.as_raw())
            .context("Failed to write frame to ffmpeg stdin")?;
        Ok(())
    }

    fn finish(&mut self, _session: &RecordingSession) -> Result<()> {
        // Nothing was recorded, so ffmpeg never started.
        let Some(mut process) = self.process.take() else {
            return Ok(());
        };

        drop(process.stdin.take());
        if let Some(reader) = process.reader.take() {
            match reader.join() {
                Ok(result) => result.context("Failed to read ffmpeg output")?,
                Err(_) => bail!("WebM reader thread panicked"),
            }
        }

        let status = process.child.wait().context("Failed to wait for ffmpeg to finish")?;
        if !status.success() {
            bail!("ffmpeg exited with status {}", status);
        }
        Ok(())
    }

    fn mime_type(&self) -> &'static str {
        "video/webm"
    }

    fn extension(&self) -> &'static str {
        "webm"
    }
}

impl Drop for WebmEncoder {
    fn drop(&mut self) {
        if let Some(mut process) = self.process.take() {
            drop(process.stdin.take());
            let _ = process.child.kill();
            let _ = process.child.wait();
            if let Some(reader) = process.reader.take() {
                let _ = reader.join();
            }
        }
    }
}
