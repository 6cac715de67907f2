use super::{FrameSource, SourceStatus};
use crate::error::{KeyError, KeyResult};
use crate::frame::Frame;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraIndex, RequestedFormat, RequestedFormatType};
use nokhwa::Camera;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

struct Latest {
    frame: Option<Frame>,
    sequence: u64,
}

impl Latest {
    /// Ready only once the camera has produced a frame newer than `delivered`.
    fn status(&self, delivered: u64) -> SourceStatus {
        if self.frame.is_none() || self.sequence == delivered {
            SourceStatus::NotReady
        } else {
            SourceStatus::Ready
        }
    }
}

/// Live capture device.
///
/// The camera is opened and read on its own thread; the pipeline only ever
/// sees the most recent decoded frame. The device is held exclusively until
/// [`FrameSource::release`] is called or the source is dropped.
pub struct WebcamSource {
    device_index: u32,
    width: u32,
    height: u32,
    latest: Arc<Mutex<Latest>>,
    delivered: u64,
    running: Arc<AtomicBool>,
    paused: bool,
    thread: Option<JoinHandle<()>>,
}

impl WebcamSource {
    pub fn new(device_index: u32, width: u32, height: u32) -> KeyResult<Self> {
        tracing::info!(
            "Initializing webcam {} at {}x{}",
            device_index,
            width,
            height
        );

        let latest = Arc::new(Mutex::new(Latest {
            frame: None,
            sequence: 0,
        }));
        let running = Arc::new(AtomicBool::new(true));
        let (opened_tx, opened_rx) = mpsc::channel::<Result<(u32, u32), String>>();

        let thread = {
            let latest = Arc::clone(&latest);
            let running = Arc::clone(&running);
            std::thread::Builder::new()
                .name(format!("webcam-{device_index}"))
                .spawn(move || capture_loop(device_index, latest, running, opened_tx))
                .map_err(|e| {
                    KeyError::source_unavailable(format!("failed to spawn capture thread: {e}"))
                })?
        };

        let (width, height) = match opened_rx.recv() {
            Ok(Ok(resolution)) => resolution,
            Ok(Err(msg)) => {
                let _ = thread.join();
                return Err(KeyError::source_unavailable(msg));
            }
            Err(_) => {
                let _ = thread.join();
                return Err(KeyError::source_unavailable("capture thread exited"));
            }
        };

        tracing::info!("Webcam initialized successfully ({}x{})", width, height);

        Ok(Self {
            device_index,
            width,
            height,
            latest,
            delivered: 0,
            running,
            paused: false,
            thread: Some(thread),
        })
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }
}

fn capture_loop(
    device_index: u32,
    latest: Arc<Mutex<Latest>>,
    running: Arc<AtomicBool>,
    opened: mpsc::Sender<Result<(u32, u32), String>>,
) {
    let index = CameraIndex::Index(device_index);
    let requested =
        RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestResolution);

    let mut camera = match Camera::new(index, requested) {
        Ok(camera) => camera,
        Err(e) => {
            let _ = opened.send(Err(format!("failed to open camera: {e}")));
            return;
        }
    };
    if let Err(e) = camera.open_stream() {
        let _ = opened.send(Err(format!("failed to open camera stream: {e}")));
        return;
    }
    let resolution = camera.resolution();
    let _ = opened.send(Ok((resolution.width(), resolution.height())));

    while running.load(Ordering::Acquire) {
        let decoded = camera
            .frame()
            .and_then(|buffer| buffer.decode_image::<RgbFormat>());
        match decoded {
            Ok(image) => {
                let mut slot = latest.lock().unwrap_or_else(PoisonError::into_inner);
                slot.frame = Some(Frame::from_rgb(image));
                slot.sequence += 1;
            }
            Err(e) => tracing::warn!("Failed to capture frame: {}", e),
        }
    }

    if let Err(e) = camera.stop_stream() {
        tracing::warn!("Failed to stop camera stream: {}", e);
    }
    tracing::info!("Webcam {} released", device_index);
}

impl FrameSource for WebcamSource {
    fn status(&mut self) -> SourceStatus {
        if self.thread.is_none() {
            return SourceStatus::Ended;
        }
        if self.paused {
            return SourceStatus::Paused;
        }
        let slot = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
        slot.status(self.delivered)
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn capture_frame(&mut self) -> KeyResult<Frame> {
        let slot = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.status(self.delivered) != SourceStatus::Ready {
            return Err(KeyError::source_unavailable(format!(
                "webcam {} has no new frame",
                self.device_index
            )));
        }
        self.delivered = slot.sequence;
        slot.frame
            .clone()
            .ok_or_else(|| KeyError::source_unavailable("webcam delivered no frame"))
    }

    fn restart(&mut self) -> KeyResult<()> {
        if self.thread.is_none() {
            return Err(KeyError::source_unavailable(format!(
                "webcam {} has been released",
                self.device_index
            )));
        }
        self.paused = false;
        Ok(())
    }

    fn release(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("Capture thread for webcam {} panicked", self.device_index);
            }
        }
    }

    fn describe(&self) -> String {
        format!("webcam {}", self.device_index)
    }
}

impl Drop for WebcamSource {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_frame_is_ready_once_per_capture() {
        let mut slot = Latest {
            frame: None,
            sequence: 0,
        };
        assert_eq!(slot.status(0), SourceStatus::NotReady);

        slot.frame = Some(Frame::solid(2, 2, [0, 255, 0, 255]));
        slot.sequence = 1;
        assert_eq!(slot.status(0), SourceStatus::Ready);
        // Already handed to the pipeline.
        assert_eq!(slot.status(1), SourceStatus::NotReady);

        slot.sequence = 2;
        assert_eq!(slot.status(1), SourceStatus::Ready);
    }
}
