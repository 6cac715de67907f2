use super::inline::InlineProcessor;
use super::types::KeyProcessor;
use crate::config::ConfigSnapshot;
use crate::frame::Frame;
use anyhow::{anyhow, bail, Context, Result};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How long `process` waits for the worker before giving up on a frame.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

enum Request {
    Process {
        seq: u64,
        frame: Frame,
        snapshot: Arc<ConfigSnapshot>,
    },
    Reset,
}

struct Response {
    seq: u64,
    frame: Frame,
}

/// Runs classification and compositing on a dedicated thread.
///
/// Requests carry a sequence number. At most one request is queued on the
/// worker at any time: a cancelled request still occupies the worker until
/// its response comes back and is discarded, and no new frame is submitted
/// before then.
pub struct WorkerProcessor {
    requests: Option<Sender<Request>>,
    responses: Receiver<Response>,
    next_seq: u64,
    in_flight: Option<u64>,
    abandoned: Option<u64>,
    timeout: Duration,
    thread: Option<JoinHandle<()>>,
}

impl WorkerProcessor {
    pub fn spawn() -> Result<Self> {
        let (request_tx, request_rx) = mpsc::channel::<Request>();
        let (response_tx, response_rx) = mpsc::channel::<Response>();

        let thread = std::thread::Builder::new()
            .name("key-worker".into())
            .spawn(move || worker_loop(request_rx, response_tx))
            .context("Failed to spawn key worker thread")?;

        tracing::info!("Key worker started");

        Ok(Self {
            requests: Some(request_tx),
            responses: response_rx,
            next_seq: 0,
            in_flight: None,
            abandoned: None,
            timeout: DEFAULT_RESPONSE_TIMEOUT,
            thread: Some(thread),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Requests the worker has not answered yet, cancelled ones included.
    pub fn queued(&self) -> usize {
        usize::from(self.in_flight.is_some()) + usize::from(self.abandoned.is_some())
    }

    /// Hand a frame to the worker. Fails while a previous frame, wanted or
    /// cancelled, is still being processed.
    pub fn submit(&mut self, frame: &Frame, snapshot: Arc<ConfigSnapshot>) -> Result<u64> {
        if let Some(seq) = self.in_flight {
            bail!("frame {} is still in flight", seq);
        }
        self.settle(Duration::ZERO)?;
        if let Some(seq) = self.abandoned {
            bail!("worker is still busy with cancelled frame {}", seq);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.send(Request::Process {
            seq,
            frame: frame.clone(),
            snapshot,
        })?;
        self.in_flight = Some(seq);
        Ok(seq)
    }

    /// Non-blocking check for the in-flight result.
    pub fn poll(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.responses.try_recv() {
                Ok(response) => {
                    if let Some(frame) = self.accept(response) {
                        return Ok(Some(frame));
                    }
                }
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Disconnected) => return Err(anyhow!("key worker exited")),
            }
        }
    }

    /// Block until the in-flight result arrives or the timeout passes.
    pub fn wait(&mut self) -> Result<Frame> {
        if self.in_flight.is_none() {
            bail!("no frame in flight");
        }
        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.responses.recv_timeout(remaining) {
                Ok(response) => {
                    if let Some(frame) = self.accept(response) {
                        return Ok(frame);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.cancel();
                    bail!("key worker did not answer within {:?}", self.timeout);
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.in_flight = None;
                    bail!("key worker exited");
                }
            }
        }
    }

    /// Give up on the in-flight request; its response will be dropped.
    pub fn cancel(&mut self) {
        if let Some(seq) = self.in_flight.take() {
            tracing::debug!("Cancelled in-flight frame {}", seq);
            self.abandoned = Some(seq);
        }
    }

    /// Wait up to `timeout` for a cancelled request to come back.
    fn settle(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while self.abandoned.is_some() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.responses.recv_timeout(remaining) {
                Ok(response) => {
                    self.accept(response);
                }
                Err(RecvTimeoutError::Timeout) => return Ok(()),
                Err(RecvTimeoutError::Disconnected) => {
                    self.abandoned = None;
                    bail!("key worker exited");
                }
            }
        }
        Ok(())
    }

    fn accept(&mut self, response: Response) -> Option<Frame> {
        if self.abandoned == Some(response.seq) {
            self.abandoned = None;
            tracing::debug!("Discarding stale worker response {}", response.seq);
            return None;
        }
        if self.in_flight == Some(response.seq) {
            self.in_flight = None;
            Some(response.frame)
        } else {
            tracing::debug!("Discarding unexpected worker response {}", response.seq);
            None
        }
    }

    fn send(&self, request: Request) -> Result<()> {
        self.requests
            .as_ref()
            .ok_or_else(|| anyhow!("key worker is shut down"))?
            .send(request)
            .map_err(|_| anyhow!("key worker exited"))
    }
}

fn worker_loop(requests: Receiver<Request>, responses: Sender<Response>) {
    let mut processor = InlineProcessor::new();
    for request in requests {
        match request {
            Request::Process {
                seq,
                frame,
                snapshot,
            } => {
                let frame = processor.key_frame(&frame, &snapshot);
                if responses.send(Response { seq, frame }).is_err() {
                    break;
                }
            }
            Request::Reset => processor.reset_state(),
        }
    }
    tracing::debug!("Key worker exiting");
}

impl KeyProcessor for WorkerProcessor {
    fn process(&mut self, frame: &Frame, snapshot: &ConfigSnapshot) -> Result<Frame> {
        // A result left over from an abandoned tick is no longer wanted, but
        // the worker must finish it before taking the next frame.
        self.cancel();
        self.settle(self.timeout)?;
        self.submit(frame, Arc::new(snapshot.clone()))?;
        self.wait()
    }

    fn reset_state(&mut self) {
        self.cancel();
        if let Err(e) = self.send(Request::Reset) {
            tracing::warn!("Failed to reset key worker: {}", e);
        }
    }

    fn name(&self) -> &'static str {
        "worker"
    }
}

impl Drop for WorkerProcessor {
    fn drop(&mut self) {
        // Closing the request channel ends the worker loop.
        self.requests.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("Key worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeyConfig;

    fn snapshot() -> ConfigSnapshot {
        ConfigSnapshot {
            version: 0,
            key: KeyConfig::green(),
            background: None,
        }
    }

    #[test]
    fn worker_matches_inline_output() {
        let frame = Frame::from_raw(2, 1, vec![0, 255, 0, 255, 255, 0, 0, 255]).unwrap();
        let mut worker = WorkerProcessor::spawn().unwrap();
        let remote = worker.process(&frame, &snapshot()).unwrap();
        let local = InlineProcessor::new().key_frame(&frame, &snapshot());
        assert_eq!(remote, local);
        assert!(!worker.in_flight());
    }

    #[test]
    fn only_one_frame_in_flight() {
        let frame = Frame::solid(2, 2, [0, 255, 0, 255]);
        let mut worker = WorkerProcessor::spawn().unwrap();
        worker.submit(&frame, Arc::new(snapshot())).unwrap();
        assert!(worker.submit(&frame, Arc::new(snapshot())).is_err());
        let out = worker.wait().unwrap();
        assert_eq!(out.pixel(0, 0)[3], 0);
    }

    #[test]
    fn cancelled_response_is_discarded() {
        let green = Frame::solid(2, 2, [0, 255, 0, 255]);
        let red = Frame::solid(2, 2, [255, 0, 0, 255]);
        let mut worker = WorkerProcessor::spawn().unwrap();

        worker.submit(&green, Arc::new(snapshot())).unwrap();
        worker.cancel();
        let out = worker.process(&red, &snapshot()).unwrap();
        assert_eq!(out.pixel(0, 0), [255, 0, 0, 255]);
    }

    #[test]
    fn timed_out_frames_do_not_pile_up_on_the_worker() {
        let slow = Frame::solid(1920, 1080, [0, 255, 0, 255]);
        let mut worker = WorkerProcessor::spawn()
            .unwrap()
            .with_timeout(Duration::from_millis(1));

        for _ in 0..8 {
            let _ = worker.process(&slow, &snapshot());
            assert!(worker.queued() <= 1);
        }

        worker.set_timeout(Duration::from_secs(60));
        let red = Frame::solid(2, 2, [255, 0, 0, 255]);
        let out = worker.process(&red, &snapshot()).unwrap();
        assert_eq!(out.dimensions(), (2, 2));
        assert_eq!(out.pixel(0, 0), [255, 0, 0, 255]);
        assert_eq!(worker.queued(), 0);
    }

    #[test]
    fn submit_refuses_while_a_cancelled_frame_is_outstanding() {
        let slow = Frame::solid(1920, 1080, [0, 255, 0, 255]);
        let mut worker = WorkerProcessor::spawn().unwrap();
        worker.submit(&slow, Arc::new(snapshot())).unwrap();
        worker.cancel();

        // Refused while the cancelled frame is still on the worker; accepted
        // only once its response has been drained.
        let _ = worker.submit(&slow, Arc::new(snapshot()));
        assert_eq!(worker.queued(), 1);
    }

    #[test]
    fn wait_without_submission_fails() {
        let mut worker = WorkerProcessor::spawn().unwrap();
        assert!(worker.wait().is_err());
        assert!(worker.poll().unwrap().is_none());
    }
}
