use super::{FrameSource, SourceStatus};
use crate::error::{KeyError, KeyResult};
use crate::frame::Frame;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};

#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

/// Read the first video stream's geometry with `ffprobe`.
pub fn probe_video(path: &Path) -> KeyResult<VideoInfo> {
    #[derive(serde::Deserialize)]
    struct ProbeStream {
        codec_type: Option<String>,
        width: Option<u32>,
        height: Option<u32>,
        r_frame_rate: Option<String>,
    }
    #[derive(serde::Deserialize)]
    struct ProbeOut {
        streams: Vec<ProbeStream>,
    }

    let out = Command::new("ffprobe")
        .args(["-v", "error", "-print_format", "json", "-show_streams"])
        .arg(path)
        .output()
        .map_err(|e| KeyError::source_unavailable(format!("failed to run ffprobe: {e}")))?;
    if !out.status.success() {
        return Err(KeyError::source_unavailable(format!(
            "ffprobe failed for '{}': {}",
            path.display(),
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }

    let parsed: ProbeOut = serde_json::from_slice(&out.stdout)
        .map_err(|e| KeyError::source_unavailable(format!("ffprobe json parse failed: {e}")))?;
    let stream = parsed
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| KeyError::source_unavailable("no video stream found"))?;

    let width = stream.width.unwrap_or(0);
    let height = stream.height.unwrap_or(0);
    if width == 0 || height == 0 {
        return Err(KeyError::source_unavailable(format!(
            "'{}' reports no frame size",
            path.display()
        )));
    }

    Ok(VideoInfo {
        width,
        height,
        fps: parse_frame_rate(stream.r_frame_rate.as_deref().unwrap_or("0/1")).unwrap_or(0.0),
    })
}

fn parse_frame_rate(s: &str) -> Option<f64> {
    let (num, den) = s.split_once('/')?;
    let num: f64 = num.trim().parse().ok()?;
    let den: f64 = den.trim().parse().ok()?;
    if den == 0.0 {
        return None;
    }
    Some(num / den)
}

/// Decodes a video file through the system `ffmpeg` binary.
///
/// Frames are read as raw RGBA from the decoder's stdout, one per capture,
/// so playback follows the pipeline's tick rate. End of stream reports
/// [`SourceStatus::Ended`]; restarting respawns the decoder from the start.
pub struct VideoFileSource {
    path: PathBuf,
    info: VideoInfo,
    looping: bool,
    decoder: Option<Decoder>,
    pending: Option<Frame>,
    paused: bool,
    ended: bool,
}

struct Decoder {
    child: Child,
    stdout: ChildStdout,
}

impl Decoder {
    fn spawn(path: &Path) -> KeyResult<Self> {
        let mut child = Command::new("ffmpeg")
            .args(["-nostdin", "-loglevel", "error", "-i"])
            .arg(path)
            .args(["-an", "-f", "rawvideo", "-pix_fmt", "rgba", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                KeyError::source_unavailable(format!(
                    "failed to spawn ffmpeg (is it installed and on PATH?): {e}"
                ))
            })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| KeyError::source_unavailable("failed to open ffmpeg stdout"))?;
        Ok(Self { child, stdout })
    }

    /// `Ok(None)` at a clean end of stream.
    fn read_frame(&mut self, width: u32, height: u32) -> KeyResult<Option<Frame>> {
        let mut buf = vec![0u8; (width as usize) * (height as usize) * 4];
        match self.stdout.read_exact(&mut buf) {
            Ok(()) => Ok(Frame::from_raw(width, height, buf)),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(KeyError::source_unavailable(format!(
                "failed to read from ffmpeg: {e}"
            ))),
        }
    }

    fn shutdown(mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl VideoFileSource {
    pub fn open<P: AsRef<Path>>(path: P, looping: bool) -> KeyResult<Self> {
        let path = path.as_ref().to_path_buf();
        let info = probe_video(&path)?;
        tracing::info!(
            "Opened {} ({}x{} @ {:.2} fps)",
            path.display(),
            info.width,
            info.height,
            info.fps
        );
        let decoder = Decoder::spawn(&path)?;
        Ok(Self {
            path,
            info,
            looping,
            decoder: Some(decoder),
            pending: None,
            paused: false,
            ended: false,
        })
    }

    pub fn info(&self) -> &VideoInfo {
        &self.info
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    fn prefetch(&mut self) -> KeyResult<()> {
        if self.pending.is_some() || self.ended {
            return Ok(());
        }
        let Some(decoder) = self.decoder.as_mut() else {
            self.ended = true;
            return Ok(());
        };
        match decoder.read_frame(self.info.width, self.info.height)? {
            Some(frame) => self.pending = Some(frame),
            None if self.looping => {
                tracing::debug!("{} reached the end, looping", self.path.display());
                self.respawn()?;
                if let Some(decoder) = self.decoder.as_mut() {
                    self.pending = decoder.read_frame(self.info.width, self.info.height)?;
                }
                self.ended = self.pending.is_none();
            }
            None => {
                tracing::info!("{} reached the end", self.path.display());
                self.ended = true;
            }
        }
        Ok(())
    }

    fn respawn(&mut self) -> KeyResult<()> {
        if let Some(old) = self.decoder.take() {
            old.shutdown();
        }
        self.decoder = Some(Decoder::spawn(&self.path)?);
        self.pending = None;
        self.ended = false;
        Ok(())
    }
}

impl FrameSource for VideoFileSource {
    fn status(&mut self) -> SourceStatus {
        if self.paused {
            return SourceStatus::Paused;
        }
        if let Err(e) = self.prefetch() {
            tracing::warn!("Decoding {} failed: {}", self.path.display(), e);
            self.ended = true;
        }
        if self.ended {
            SourceStatus::Ended
        } else {
            SourceStatus::Ready
        }
    }

    fn resolution(&self) -> (u32, u32) {
        (self.info.width, self.info.height)
    }

    fn capture_frame(&mut self) -> KeyResult<Frame> {
        self.prefetch()?;
        self.pending
            .take()
            .ok_or_else(|| KeyError::stalled(format!("{} has ended", self.path.display())))
    }

    fn restart(&mut self) -> KeyResult<()> {
        tracing::info!("Restarting {}", self.path.display());
        self.paused = false;
        self.respawn()
    }

    fn release(&mut self) {
        if let Some(decoder) = self.decoder.take() {
            decoder.shutdown();
        }
        self.pending = None;
        self.ended = true;
    }

    fn describe(&self) -> String {
        format!("video file {}", self.path.display())
    }
}

impl Drop for VideoFileSource {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rate_parsing() {
        assert_eq!(parse_frame_rate("30/1"), Some(30.0));
        assert_eq!(parse_frame_rate("30000/1001").map(|f| (f * 100.0).round()), Some(2997.0));
        assert_eq!(parse_frame_rate("25/0"), None);
        assert_eq!(parse_frame_rate("garbage"), None);
    }

    #[test]
    fn missing_file_is_unavailable() {
        let err = VideoFileSource::open("/definitely/not/here.mp4", false).err();
        assert!(matches!(err, Some(KeyError::SourceUnavailable(_))));
    }
}
