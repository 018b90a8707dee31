//! Stream lifecycle and the blocking retrieval surface
//!
//! `Streamer` owns the capture pipeline lifecycle (`open`/`start`/`stop`/
//! `close`), registers the completion sink with the capture source and
//! exposes the pull-based `frame()` call. All business logic stays on the
//! consumer side of the queue; the completion sink only wraps and pushes.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::capture::frame::find_mode;
use crate::capture::{CaptureError, CaptureSource, FrameSink, RawFrame};
use crate::pipeline::{BufferPool, FrameBuffer, FrameMeta, FrameQueue, PopOutcome, QueueStats};
use crate::CaptureConfig;

/// Smoothing coefficient for the capture-rate estimate
const FPS_FILTER: f64 = 0.2;

/// Stream lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Opened,
    Streaming,
    Stopped,
    Closed,
}

/// Result of a blocking [`Streamer::frame`] call
#[derive(Debug)]
pub enum StreamEvent {
    Frame(FrameBuffer),
    /// Nothing arrived in time; retry
    Timeout,
    /// Terminal, repeats on every later call
    EndOfStream,
}

#[derive(Error, Debug)]
pub enum StreamError {
    /// Unsupported format/resolution. Fatal at `open`, no retry.
    #[error("stream configuration error: {0}")]
    Config(String),

    #[error("{op} not valid in state {state:?}")]
    InvalidState { state: State, op: &'static str },

    /// The streamer was closed; every operation fails from here on.
    #[error("streamer is closed")]
    Closed,

    /// A recording is already in progress; stop it before starting another.
    #[error("recording already in progress")]
    RecordActive,

    #[error(transparent)]
    Capture(#[from] CaptureError),
}

/// Bounds for an in-memory recording
#[derive(Debug, Clone)]
pub struct RecordConfig {
    /// Span of frames to retain, measured from the first retained frame
    pub duration: Duration,
    /// Frames completing within this window after `start_record` are skipped
    pub start_shift: Duration,
    /// Retention cap in bytes; the recording ends when the next frame would
    /// exceed it
    pub budget_bytes: usize,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(5),
            start_shift: Duration::ZERO,
            budget_bytes: 64 << 20,
        }
    }
}

/// One frame retained by a recording. Owns its pixel data outright so
/// recordings never tie up capture pool slots.
#[derive(Debug, Clone)]
pub struct RecordedFrame {
    pub data: Bytes,
    pub meta: FrameMeta,
}

/// Per-stream-instance resources, rebuilt on every `open`
struct Session {
    queue: Arc<FrameQueue>,
    pool: Arc<BufferPool>,
    sink: Arc<CompletionSink>,
}

pub struct Streamer {
    state: Mutex<State>,
    source: Mutex<Box<dyn CaptureSource>>,
    session: Mutex<Option<Session>>,
}

impl Streamer {
    pub fn new(source: Box<dyn CaptureSource>) -> Self {
        Self {
            state: Mutex::new(State::Idle),
            source: Mutex::new(source),
            session: Mutex::new(None),
        }
    }

    pub fn state(&self) -> State {
        *self.state.lock().unwrap()
    }

    /// Validate a configuration and prepare the capture pipeline.
    pub fn open(&self, config: &CaptureConfig) -> Result<(), StreamError> {
        {
            let st = self.state.lock().unwrap();
            match *st {
                State::Idle | State::Opened => {}
                State::Closed => return Err(StreamError::Closed),
                s => return Err(StreamError::InvalidState { state: s, op: "open" }),
            }
        }

        let mode = find_mode(config.width, config.height).ok_or_else(|| {
            StreamError::Config(format!(
                "unsupported resolution {}x{}",
                config.width, config.height
            ))
        })?;
        if !(mode.min_fps..=mode.max_fps).contains(&config.fps) {
            return Err(StreamError::Config(format!(
                "frame rate {} outside supported range {}-{}",
                config.fps, mode.min_fps, mode.max_fps
            )));
        }

        self.source.lock().unwrap().configure(config)?;

        let capacity = config.buffer_count as usize;
        let slot_size = config.format.frame_size(config.width, config.height);
        let queue = Arc::new(FrameQueue::new(capacity));
        // extra slots cover frames the consumer still holds, so a full queue
        // can still accept (and age out) new completions
        let pool = Arc::new(BufferPool::new(capacity * 2, slot_size));
        let sink = Arc::new(CompletionSink::new(Arc::clone(&queue), Arc::clone(&pool)));
        *self.session.lock().unwrap() = Some(Session { queue, pool, sink });

        *self.state.lock().unwrap() = State::Opened;
        info!(
            width = config.width,
            height = config.height,
            fps = config.fps,
            buffers = config.buffer_count,
            "stream opened"
        );
        Ok(())
    }

    /// Begin capture. Valid from `Idle` (opens the current global capture
    /// config first) or `Opened`.
    pub fn start(&self) -> Result<(), StreamError> {
        match self.state() {
            State::Idle => {
                let config = crate::CONFIG.load().capture.clone();
                self.open(&config)?;
            }
            State::Opened => {}
            State::Closed => return Err(StreamError::Closed),
            s => return Err(StreamError::InvalidState { state: s, op: "start" }),
        }

        let sink: Arc<dyn FrameSink> = match self.session.lock().unwrap().as_ref() {
            Some(session) => Arc::clone(&session.sink) as Arc<dyn FrameSink>,
            None => {
                return Err(StreamError::InvalidState {
                    state: State::Idle,
                    op: "start",
                })
            }
        };
        self.source.lock().unwrap().start(sink)?;
        *self.state.lock().unwrap() = State::Streaming;
        info!("streaming");
        Ok(())
    }

    /// Blocking retrieval. Returns the next completed frame, a timeout, or
    /// the terminal end-of-stream event. Holds no lock while blocked beyond
    /// the queue's own wait.
    pub fn frame(&self, timeout: Duration) -> Result<StreamEvent, StreamError> {
        {
            let st = self.state.lock().unwrap();
            match *st {
                State::Closed => return Err(StreamError::Closed),
                State::Idle | State::Opened => {
                    return Err(StreamError::InvalidState { state: *st, op: "frame" })
                }
                State::Streaming | State::Stopped => {}
            }
        }
        let queue = match self
            .session
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| Arc::clone(&s.queue))
        {
            Some(queue) => queue,
            // stopped before anything was opened
            None => return Ok(StreamEvent::EndOfStream),
        };

        Ok(match queue.pop(timeout) {
            PopOutcome::Frame(frame) => StreamEvent::Frame(frame),
            PopOutcome::Empty => StreamEvent::Timeout,
            PopOutcome::EndOfStream => StreamEvent::EndOfStream,
        })
    }

    /// Halt capture. Joins the driver thread and queues the terminal marker
    /// before the state becomes observable as stopped, so a `frame()` issued
    /// after any `stop()` returns sees end-of-stream. Concurrent callers
    /// serialize on the source lock: a second `stop`/`close` blocks until the
    /// first has fully quiesced. Idempotent.
    pub fn stop(&self) {
        let mut source = self.source.lock().unwrap();
        match self.state() {
            State::Stopped | State::Closed => return,
            _ => {}
        }
        source.stop();
        if let Some(session) = self.session.lock().unwrap().as_ref() {
            session.queue.push_eos();
        }
        *self.state.lock().unwrap() = State::Stopped;
        debug!("stream stopped");
    }

    /// Stop if needed and release all stream resources. Every subsequent
    /// operation fails with [`StreamError::Closed`]. Idempotent.
    pub fn close(&self) {
        if self.state() == State::Closed {
            return;
        }
        self.stop();
        *self.state.lock().unwrap() = State::Closed;
        self.session.lock().unwrap().take();
        debug!("stream closed");
    }

    /// Filtered capture-rate estimate in frames per second
    pub fn fps(&self) -> f64 {
        self.session
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.sink.fps())
            .unwrap_or(0.0)
    }

    /// Queue counters for the current stream instance
    pub fn queue_stats(&self) -> Option<QueueStats> {
        self.session
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.queue.stats())
    }

    /// Free pool slots for the current stream instance
    pub fn pool_available(&self) -> Option<usize> {
        self.session
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.pool.available())
    }

    /// Begin retaining completed frames under the given bounds. Only one
    /// recording can run at a time; streaming continues unaffected alongside.
    pub fn start_record(&self, config: &RecordConfig) -> Result<(), StreamError> {
        match self.state() {
            State::Streaming => {}
            State::Closed => return Err(StreamError::Closed),
            s => {
                return Err(StreamError::InvalidState {
                    state: s,
                    op: "start_record",
                })
            }
        }
        if config.duration.is_zero() {
            return Err(StreamError::Config("record duration must be nonzero".into()));
        }
        match self.session.lock().unwrap().as_ref() {
            Some(session) => session.sink.start_record(config),
            None => Err(StreamError::InvalidState {
                state: State::Idle,
                op: "start_record",
            }),
        }
    }

    /// Fraction of the current recording's bounds consumed, whichever of the
    /// duration and byte budget is closer to ending it. `1.0` once complete,
    /// `0.0` when nothing is recording.
    pub fn record_progress(&self) -> f64 {
        self.session
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.sink.record_progress())
            .unwrap_or(0.0)
    }

    /// End the current recording (if any) and take its frames.
    pub fn stop_record(&self) -> Vec<RecordedFrame> {
        self.session
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.sink.stop_record())
            .unwrap_or_default()
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Receives completions on the capture driver thread. Wrap-and-push only:
/// normalize the timestamp, copy into a pool slot, enqueue. Must never block
/// on anything the consumer waits on.
struct CompletionSink {
    queue: Arc<FrameQueue>,
    pool: Arc<BufferPool>,
    /// Subsystem timestamp of the first completion, `i64::MIN` until seen
    pts_offset: AtomicI64,
    last_pts: AtomicI64,
    sequence: AtomicU64,
    fps_bits: AtomicU64,
    skipped: AtomicU64,
    record: Mutex<Option<RecordState>>,
}

/// Bookkeeping for one in-flight recording
struct RecordState {
    config: RecordConfig,
    frames: Vec<RecordedFrame>,
    bytes: usize,
    /// First completion seen after `start_record`; anchors the start shift
    t0: i64,
    /// First retained frame; anchors the duration
    first_pts: i64,
    last_pts: i64,
    done: bool,
}

impl CompletionSink {
    fn new(queue: Arc<FrameQueue>, pool: Arc<BufferPool>) -> Self {
        Self {
            queue,
            pool,
            pts_offset: AtomicI64::new(i64::MIN),
            last_pts: AtomicI64::new(-1),
            sequence: AtomicU64::new(0),
            fps_bits: AtomicU64::new(0f64.to_bits()),
            skipped: AtomicU64::new(0),
            record: Mutex::new(None),
        }
    }

    fn fps(&self) -> f64 {
        f64::from_bits(self.fps_bits.load(Ordering::Relaxed))
    }

    fn start_record(&self, config: &RecordConfig) -> Result<(), StreamError> {
        let mut guard = self.record.lock().unwrap();
        if guard.as_ref().is_some_and(|rec| !rec.done) {
            return Err(StreamError::RecordActive);
        }
        *guard = Some(RecordState {
            config: config.clone(),
            frames: Vec::new(),
            bytes: 0,
            t0: -1,
            first_pts: -1,
            last_pts: -1,
            done: false,
        });
        info!(
            duration_ms = config.duration.as_millis() as u64,
            budget_bytes = config.budget_bytes,
            "recording started"
        );
        Ok(())
    }

    fn record_progress(&self) -> f64 {
        let guard = self.record.lock().unwrap();
        let Some(rec) = guard.as_ref() else {
            return 0.0;
        };
        if rec.done {
            return 1.0;
        }
        let by_bytes = rec.bytes as f64 / rec.config.budget_bytes.max(1) as f64;
        let by_time = if rec.first_pts < 0 {
            0.0
        } else {
            (rec.last_pts - rec.first_pts) as f64 / rec.config.duration.as_micros().max(1) as f64
        };
        // whichever bound is nearer ends the recording
        by_bytes.max(by_time).min(1.0)
    }

    fn stop_record(&self) -> Vec<RecordedFrame> {
        match self.record.lock().unwrap().take() {
            Some(rec) => {
                debug!(frames = rec.frames.len(), bytes = rec.bytes, "recording stopped");
                rec.frames
            }
            None => Vec::new(),
        }
    }

    /// Retain one completion for the active recording, if any. Runs on the
    /// driver thread; the mutex is only contended by short progress queries.
    fn record_frame(&self, data: &[u8], meta: &FrameMeta) {
        let mut guard = self.record.lock().unwrap();
        let Some(rec) = guard.as_mut() else { return };
        if rec.done {
            return;
        }
        if rec.t0 < 0 {
            rec.t0 = meta.pts_us;
        }
        if meta.pts_us - rec.t0 < rec.config.start_shift.as_micros() as i64 {
            return;
        }
        if rec.bytes + data.len() > rec.config.budget_bytes {
            rec.done = true;
            info!(frames = rec.frames.len(), "record byte budget reached");
            return;
        }
        if rec.first_pts < 0 {
            rec.first_pts = meta.pts_us;
        }
        rec.last_pts = meta.pts_us;
        rec.bytes += data.len();
        rec.frames.push(RecordedFrame {
            data: Bytes::copy_from_slice(data),
            meta: meta.clone(),
        });
        if rec.last_pts - rec.first_pts >= rec.config.duration.as_micros() as i64 {
            rec.done = true;
            info!(frames = rec.frames.len(), "record duration reached");
        }
    }
}

impl FrameSink for CompletionSink {
    fn frame_complete(&self, raw: RawFrame<'_>) {
        let mut offset = self.pts_offset.load(Ordering::Acquire);
        if offset == i64::MIN {
            self.pts_offset.store(raw.pts_us, Ordering::Release);
            offset = raw.pts_us;
        }
        let pts_us = raw.pts_us - offset;

        let last = self.last_pts.load(Ordering::Acquire);
        if last >= 0 && pts_us < last {
            // transient capture error; the queue simply never sees it
            self.skipped.fetch_add(1, Ordering::Relaxed);
            trace!(pts_us, last, "skipping out-of-order completion");
            return;
        }
        if last >= 0 && pts_us > last {
            let instant = 1_000_000.0 / (pts_us - last) as f64;
            let filtered = (1.0 - FPS_FILTER) * self.fps() + FPS_FILTER * instant;
            self.fps_bits.store(filtered.to_bits(), Ordering::Relaxed);
        }

        let meta = FrameMeta {
            width: raw.width,
            height: raw.height,
            stride: raw.stride,
            format: raw.format,
            pts_us,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
        };
        self.record_frame(raw.data, &meta);
        match self.pool.wrap(raw.data, meta) {
            Some(frame) => self.queue.push(frame),
            None => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                trace!(pts_us, "buffer pool exhausted, skipping frame");
            }
        }
        self.last_pts.store(pts_us, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::SyntheticSource;

    fn synthetic_streamer(fps: u32) -> Streamer {
        let config = CaptureConfig {
            fps,
            format: crate::capture::PixelFormat::Yuv420,
            ..CaptureConfig::default()
        };
        let streamer = Streamer::new(Box::new(SyntheticSource::new()));
        streamer.open(&config).unwrap();
        streamer
    }

    #[test]
    fn lifecycle_transitions() {
        let streamer = synthetic_streamer(30);
        assert_eq!(streamer.state(), State::Opened);
        assert!(streamer.pool_available().is_some());
        streamer.start().unwrap();
        assert_eq!(streamer.state(), State::Streaming);
        assert!(matches!(
            streamer.start(),
            Err(StreamError::InvalidState { .. })
        ));
        streamer.stop();
        assert_eq!(streamer.state(), State::Stopped);
        assert!(matches!(
            streamer.open(&CaptureConfig::default()),
            Err(StreamError::InvalidState { .. })
        ));
        streamer.close();
        assert_eq!(streamer.state(), State::Closed);
        assert_eq!(streamer.pool_available(), None);
        assert!(matches!(
            streamer.frame(Duration::from_millis(1)),
            Err(StreamError::Closed)
        ));
    }

    struct SlowStopSource;

    impl CaptureSource for SlowStopSource {
        fn configure(&mut self, _config: &CaptureConfig) -> Result<(), CaptureError> {
            Ok(())
        }
        fn start(&mut self, _sink: Arc<dyn FrameSink>) -> Result<(), CaptureError> {
            Ok(())
        }
        fn stop(&mut self) {
            // a driver that takes a while to quiesce
            std::thread::sleep(Duration::from_millis(200));
        }
    }

    #[test]
    fn concurrent_stop_blocks_until_quiesce_completes() {
        let streamer = Arc::new(Streamer::new(Box::new(SlowStopSource)));
        streamer.open(&CaptureConfig::default()).unwrap();
        streamer.start().unwrap();

        let first = {
            let streamer = Arc::clone(&streamer);
            std::thread::spawn(move || streamer.stop())
        };
        std::thread::sleep(Duration::from_millis(50));
        // lands mid-quiesce; once this returns, termination must already be
        // observable
        streamer.stop();
        assert_eq!(streamer.state(), State::Stopped);
        assert!(matches!(
            streamer.frame(Duration::from_millis(5)).unwrap(),
            StreamEvent::EndOfStream
        ));
        first.join().unwrap();
    }

    #[test]
    fn record_requires_an_active_stream() {
        let streamer = synthetic_streamer(30);
        assert!(matches!(
            streamer.start_record(&RecordConfig::default()),
            Err(StreamError::InvalidState { .. })
        ));
        assert_eq!(streamer.record_progress(), 0.0);
        assert!(streamer.stop_record().is_empty());
    }

    #[test]
    fn record_retains_the_requested_window() {
        let streamer = synthetic_streamer(90);
        streamer.start().unwrap();
        streamer
            .start_record(&RecordConfig {
                duration: Duration::from_millis(100),
                ..RecordConfig::default()
            })
            .unwrap();
        assert!(matches!(
            streamer.start_record(&RecordConfig::default()),
            Err(StreamError::RecordActive)
        ));

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while streamer.record_progress() < 1.0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(streamer.record_progress(), 1.0);

        let frames = streamer.stop_record();
        assert!(!frames.is_empty());
        for pair in frames.windows(2) {
            assert!(pair[0].meta.pts_us < pair[1].meta.pts_us);
        }
        let span = frames.last().unwrap().meta.pts_us - frames.first().unwrap().meta.pts_us;
        assert!(span >= 100_000);
        // streaming kept going alongside the recording
        assert!(matches!(
            streamer.frame(Duration::from_secs(2)).unwrap(),
            StreamEvent::Frame(_)
        ));
        streamer.close();
    }

    #[test]
    fn record_stops_at_the_byte_budget() {
        let streamer = synthetic_streamer(90);
        streamer.start().unwrap();
        let frame_bytes = crate::capture::PixelFormat::Yuv420.frame_size(640, 480);
        streamer
            .start_record(&RecordConfig {
                duration: Duration::from_secs(30),
                budget_bytes: frame_bytes * 2,
                ..RecordConfig::default()
            })
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while streamer.record_progress() < 1.0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        let frames = streamer.stop_record();
        assert_eq!(frames.len(), 2);
        assert_eq!(
            frames.iter().map(|f| f.data.len()).sum::<usize>(),
            frame_bytes * 2
        );
        streamer.close();
    }

    #[test]
    fn open_rejects_unsupported_modes() {
        let streamer = Streamer::new(Box::new(SyntheticSource::new()));
        let bad_res = CaptureConfig {
            width: 123,
            height: 45,
            ..CaptureConfig::default()
        };
        assert!(matches!(
            streamer.open(&bad_res),
            Err(StreamError::Config(_))
        ));
        let bad_fps = CaptureConfig {
            fps: 200,
            ..CaptureConfig::default()
        };
        assert!(matches!(
            streamer.open(&bad_fps),
            Err(StreamError::Config(_))
        ));
        // still usable after rejection
        assert_eq!(streamer.state(), State::Idle);
        streamer.open(&CaptureConfig::default()).unwrap();
    }

    #[test]
    fn frame_before_start_is_a_state_error() {
        let streamer = synthetic_streamer(30);
        assert!(matches!(
            streamer.frame(Duration::from_millis(1)),
            Err(StreamError::InvalidState { .. })
        ));
    }

    #[test]
    fn stop_and_close_are_idempotent() {
        let streamer = synthetic_streamer(90);
        streamer.start().unwrap();
        streamer.stop();
        streamer.stop();
        streamer.close();
        streamer.close();
        assert_eq!(streamer.state(), State::Closed);
    }

    #[test]
    fn delivered_timestamps_are_strictly_increasing() {
        let streamer = synthetic_streamer(90);
        streamer.start().unwrap();
        let mut last = -1i64;
        let mut seen = 0;
        while seen < 12 {
            match streamer.frame(Duration::from_secs(2)).unwrap() {
                StreamEvent::Frame(frame) => {
                    assert!(frame.pts_us() > last);
                    last = frame.pts_us();
                    frame.release().unwrap();
                    seen += 1;
                }
                StreamEvent::Timeout => continue,
                StreamEvent::EndOfStream => panic!("premature end of stream"),
            }
        }
        assert!(streamer.fps() > 0.0);
        streamer.close();
    }

    #[test]
    fn every_frame_after_stop_reports_end_of_stream() {
        let streamer = synthetic_streamer(90);
        streamer.start().unwrap();
        streamer.stop();
        for _ in 0..10 {
            assert!(matches!(
                streamer.frame(Duration::from_millis(5)).unwrap(),
                StreamEvent::EndOfStream
            ));
        }
    }
}
