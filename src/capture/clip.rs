use super::{FrameSource, SourceStatus};
use crate::error::{KeyError, KeyResult};
use crate::frame::Frame;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

struct ClipState {
    frames: Vec<Frame>,
    position: usize,
    ready: bool,
    paused: bool,
    ended: bool,
    looping: bool,
    refuse_restart: bool,
    restarts: u32,
    released: bool,
}

/// In-memory frame source.
///
/// Plays a fixed list of frames one per capture. Playback can be paused,
/// ended or held "not ready" from the outside through [`ClipControls`],
/// which makes it the stand-in for a decoded file when embedding the engine
/// or exercising the pipeline.
pub struct ClipSource {
    state: Arc<Mutex<ClipState>>,
    name: String,
}

/// Remote control for a [`ClipSource`] that has been handed to a pipeline.
#[derive(Clone)]
pub struct ClipControls {
    state: Arc<Mutex<ClipState>>,
}

impl ClipSource {
    pub fn new(frames: Vec<Frame>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ClipState {
                frames,
                position: 0,
                ready: true,
                paused: false,
                ended: false,
                looping: false,
                refuse_restart: false,
                restarts: 0,
                released: false,
            })),
            name: "clip".into(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn looping(self, looping: bool) -> Self {
        lock(&self.state).looping = looping;
        self
    }

    pub fn controls(&self) -> ClipControls {
        ClipControls {
            state: Arc::clone(&self.state),
        }
    }
}

fn lock(state: &Mutex<ClipState>) -> MutexGuard<'_, ClipState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FrameSource for ClipSource {
    fn status(&mut self) -> SourceStatus {
        let state = lock(&self.state);
        if state.released || state.ended {
            SourceStatus::Ended
        } else if !state.ready || state.frames.is_empty() {
            SourceStatus::NotReady
        } else if state.paused {
            SourceStatus::Paused
        } else {
            SourceStatus::Ready
        }
    }

    fn resolution(&self) -> (u32, u32) {
        let state = lock(&self.state);
        match state.frames.first() {
            Some(frame) if state.ready => frame.dimensions(),
            _ => (0, 0),
        }
    }

    fn capture_frame(&mut self) -> KeyResult<Frame> {
        let mut state = lock(&self.state);
        if state.released {
            return Err(KeyError::source_unavailable(format!(
                "{} has been released",
                self.name
            )));
        }
        if state.ended {
            return Err(KeyError::stalled(format!("{} has ended", self.name)));
        }
        let frame = state
            .frames
            .get(state.position)
            .cloned()
            .ok_or_else(|| KeyError::source_unavailable(format!("{} has no frames", self.name)))?;

        state.position += 1;
        if state.position >= state.frames.len() {
            if state.looping {
                state.position = 0;
            } else {
                state.ended = true;
            }
        }
        Ok(frame)
    }

    fn restart(&mut self) -> KeyResult<()> {
        let mut state = lock(&self.state);
        if state.released {
            return Err(KeyError::source_unavailable(format!(
                "{} has been released",
                self.name
            )));
        }
        if state.refuse_restart {
            return Err(KeyError::stalled(format!("{} refused to restart", self.name)));
        }
        state.position = 0;
        state.ended = false;
        state.paused = false;
        state.restarts += 1;
        Ok(())
    }

    fn release(&mut self) {
        lock(&self.state).released = true;
    }

    fn describe(&self) -> String {
        let state = lock(&self.state);
        format!("{} ({} frames)", self.name, state.frames.len())
    }
}

impl ClipControls {
    pub fn pause(&self) {
        lock(&self.state).paused = true;
    }

    pub fn resume(&self) {
        lock(&self.state).paused = false;
    }

    pub fn end(&self) {
        lock(&self.state).ended = true;
    }

    pub fn set_ready(&self, ready: bool) {
        lock(&self.state).ready = ready;
    }

    /// Make every subsequent restart fail.
    pub fn refuse_restart(&self, refuse: bool) {
        lock(&self.state).refuse_restart = refuse;
    }

    pub fn restarts(&self) -> u32 {
        lock(&self.state).restarts
    }

    pub fn position(&self) -> usize {
        lock(&self.state).position
    }

    pub fn is_released(&self) -> bool {
        lock(&self.state).released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(n: u8) -> Vec<Frame> {
        (0..n).map(|i| Frame::solid(2, 2, [i, i, i, 255])).collect()
    }

    #[test]
    fn plays_to_the_end() {
        let mut clip = ClipSource::new(frames(2));
        assert_eq!(clip.status(), SourceStatus::Ready);
        assert_eq!(clip.capture_frame().unwrap().pixel(0, 0)[0], 0);
        assert_eq!(clip.capture_frame().unwrap().pixel(0, 0)[0], 1);
        assert_eq!(clip.status(), SourceStatus::Ended);
        assert!(matches!(clip.capture_frame(), Err(KeyError::StalledSource(_))));

        clip.restart().unwrap();
        assert_eq!(clip.status(), SourceStatus::Ready);
        assert_eq!(clip.controls().restarts(), 1);
    }

    #[test]
    fn looping_wraps_around() {
        let mut clip = ClipSource::new(frames(2)).looping(true);
        for _ in 0..5 {
            clip.capture_frame().unwrap();
        }
        assert_eq!(clip.status(), SourceStatus::Ready);
        assert_eq!(clip.controls().position(), 1);
    }

    #[test]
    fn controls_drive_status() {
        let mut clip = ClipSource::new(frames(3));
        let controls = clip.controls();

        controls.set_ready(false);
        assert_eq!(clip.status(), SourceStatus::NotReady);
        assert_eq!(clip.resolution(), (0, 0));

        controls.set_ready(true);
        controls.pause();
        assert_eq!(clip.status(), SourceStatus::Paused);

        controls.resume();
        controls.end();
        assert_eq!(clip.status(), SourceStatus::Ended);

        controls.refuse_restart(true);
        assert!(clip.restart().is_err());
    }

    #[test]
    fn release_is_terminal() {
        let mut clip = ClipSource::new(frames(1));
        let controls = clip.controls();
        clip.release();
        assert!(controls.is_released());
        assert_eq!(clip.status(), SourceStatus::Ended);
        assert!(matches!(
            clip.capture_frame(),
            Err(KeyError::SourceUnavailable(_))
        ));
    }
}
