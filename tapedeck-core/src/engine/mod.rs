//! `AudioSession`: lifecycle controller for one capture or playback stream.
//!
//! ## Lifecycle
//!
//! ```text
//! AudioSession::new()
//!     └─► start_capture() / start_playback()  → stream open, worker spawned, status = Active
//!         └─► stop()                           → Stopping, worker drains and is joined, status = Idle
//! ```
//!
//! A session also ends by itself when a playback source runs out, when the
//! device disappears, or when a recording hits a fatal write error. The
//! worker then walks the same `Stopping → Idle` path and leaves its result
//! for [`AudioSession::take_finished`] (errors are also returned by the next
//! [`AudioSession::stop`]).
//!
//! `start_*()` while active and `stop()` while idle are no-ops reported as
//! [`Transition::AlreadyRunning`] and [`Transition::NotRunning`].
//!
//! ## Threading
//!
//! `cpal::Stream` is `!Send` on Windows/macOS (COM / CoreAudio thread
//! affinity). The stream is therefore opened *inside* the worker thread and
//! dropped there. A sync oneshot channel propagates open errors back to the
//! `start_*()` caller, which blocks until the device is confirmed open.

pub mod capture;
pub mod diagnostics;
pub mod playback;

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, AtomicU8, Ordering},
    mpsc, Arc,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{
    audio::{
        AudioBackend, InputHandler, OpenStream, OutputHandler, PortDirection, PortInfo,
        ShutdownHandler, StreamInfo, StreamRequest,
    },
    buffering::{block_pool, handoff_queue, DEFAULT_QUEUE_CAPACITY},
    error::{Result, TapedeckError},
    events::{FinishedEvent, LevelEvent, SessionMode, SessionStatus, SessionStatusEvent},
    sink::{default_recording_path, BitDepth, BlockSink, SinkSummary, WavSink},
    source::SampleSource,
};

use capture::{CaptureCallback, CaptureWorker, WorkerTiming};
use diagnostics::{DiagnosticsSnapshot, SessionDiagnostics};
use playback::PlaybackCallback;

/// Broadcast channel capacity: events buffered for slow consumers.
const BROADCAST_CAP: usize = 256;

/// Configuration for `AudioSession`.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Client name reported to the audio host. Default: `"audio_recorder"`.
    pub client_name: String,
    /// Preferred capture device; `None` uses the host default.
    pub input_device: Option<String>,
    /// Preferred playback device; `None` uses the host default.
    pub output_device: Option<String>,
    /// Channels written to recordings. Default: 2.
    pub channels: u16,
    /// Fixed device block size in frames; `None` lets the host decide.
    pub block_size: Option<u32>,
    /// Handoff queue capacity in blocks. Default: 100.
    pub queue_capacity: usize,
    /// Longest a worker waits before re-checking the stop flag. Default: 100 ms.
    pub pop_timeout: Duration,
    /// Frames of storage per pre-allocated pool block. Default: 1024.
    pub prealloc_frames: usize,
    /// Linear gain applied to captured samples. Default: 1.0.
    pub input_gain: f32,
    /// Default: 24-bit PCM.
    pub bit_depth: BitDepth,
    /// Convert playback sources to the device rate before the stream opens.
    /// Generated sources are always re-rendered at the device rate.
    pub resample_to_device: bool,
    /// Publish a level event every N written blocks. Default: 100.
    pub level_interval_blocks: u64,
    /// Minimum spacing between dropped-block warnings. Default: 1 s.
    pub drop_log_interval: Duration,
    /// Directory for timestamped recordings; `None` uses the working directory.
    pub recordings_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_name: "audio_recorder".into(),
            input_device: None,
            output_device: None,
            channels: 2,
            block_size: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            pop_timeout: Duration::from_millis(100),
            prealloc_frames: 1024,
            input_gain: 1.0,
            bit_depth: BitDepth::default(),
            resample_to_device: false,
            level_interval_blocks: 100,
            drop_log_interval: Duration::from_secs(1),
            recordings_dir: None,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(TapedeckError::InvalidConfig(msg));
        if self.queue_capacity == 0 {
            return invalid("queue capacity must be at least 1".into());
        }
        if !(1..=32).contains(&self.channels) {
            return invalid(format!("channels must be 1..=32, got {}", self.channels));
        }
        if self.block_size == Some(0) {
            return invalid("block size must be positive".into());
        }
        if self.pop_timeout.is_zero() || self.pop_timeout > Duration::from_secs(5) {
            return invalid(format!(
                "pop timeout must be in (0, 5s], got {:?}",
                self.pop_timeout
            ));
        }
        if !self.input_gain.is_finite() || self.input_gain < 0.0 {
            return invalid(format!("input gain must be >= 0, got {}", self.input_gain));
        }
        if self.level_interval_blocks == 0 {
            return invalid("level interval must be at least 1 block".into());
        }
        Ok(())
    }

    fn stream_request(&self, direction: PortDirection) -> StreamRequest {
        let (device, channels) = match direction {
            PortDirection::Capture => (self.input_device.clone(), Some(self.channels)),
            PortDirection::Playback => (self.output_device.clone(), None),
        };
        StreamRequest {
            client_name: self.client_name.clone(),
            device,
            channels,
            block_size: self.block_size,
        }
    }

    fn timing(&self) -> WorkerTiming {
        WorkerTiming {
            pop_timeout: self.pop_timeout,
            level_interval_blocks: self.level_interval_blocks,
            drop_log_interval: self.drop_log_interval,
        }
    }
}

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionEnd {
    Requested,
    EndOfStream,
    Disconnected,
    WriteFailed,
}

impl SessionEnd {
    fn code(self) -> u8 {
        match self {
            SessionEnd::Requested => 1,
            SessionEnd::EndOfStream => 2,
            SessionEnd::Disconnected => 3,
            SessionEnd::WriteFailed => 4,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(SessionEnd::Requested),
            2 => Some(SessionEnd::EndOfStream),
            3 => Some(SessionEnd::Disconnected),
            4 => Some(SessionEnd::WriteFailed),
            _ => None,
        }
    }
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionEnd::Requested => "stop requested",
            SessionEnd::EndOfStream => "end of stream",
            SessionEnd::Disconnected => "audio device disconnected",
            SessionEnd::WriteFailed => "write failed",
        })
    }
}

/// Flags shared by the session, the real-time callback and the worker.
///
/// Lock-free so the callback and the backend's shutdown hook can touch it
/// from any thread.
#[derive(Debug, Default)]
pub struct SessionControl {
    stop: AtomicBool,
    paused: AtomicBool,
    capturing: AtomicBool,
    end: AtomicU8,
}

impl SessionControl {
    /// Request a stop. Returns `true` for the first request; its `end` is
    /// the one the session reports.
    pub fn request_stop(&self, end: SessionEnd) -> bool {
        let first = self
            .end
            .compare_exchange(0, end.code(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        self.stop.store(true, Ordering::Release);
        first
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn end(&self) -> Option<SessionEnd> {
        SessionEnd::from_code(self.end.load(Ordering::Acquire))
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn set_capturing(&self, capturing: bool) {
        self.capturing.store(capturing, Ordering::Release);
    }

    /// Whether the capture callback should queue input right now.
    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::Acquire) && !self.is_paused() && !self.is_stopped()
    }

    /// Whether the playback callback should emit silence instead of source
    /// audio.
    pub fn is_halted(&self) -> bool {
        self.is_stopped() || self.is_paused()
    }
}

/// Outcome of a finished session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    pub mode: SessionMode,
    pub stream: StreamInfo,
    /// What the sink wrote (capture only).
    pub recording: Option<SinkSummary>,
    pub diagnostics: DiagnosticsSnapshot,
    pub end: SessionEnd,
}

/// Result of a lifecycle command.
#[derive(Debug)]
pub enum Transition {
    Started(StreamInfo),
    AlreadyRunning,
    Stopped(SessionReport),
    NotRunning,
    Paused,
    Resumed,
}

/// Builds the sink once the stream format is known: `(stream, channels)`.
pub type SinkFactory = Box<dyn FnOnce(&StreamInfo, u16) -> Result<Box<dyn BlockSink>>>;

/// Where captured audio goes.
pub enum CaptureTarget {
    /// A WAV file; `None` picks a timestamped name in `recordings_dir`.
    File(Option<PathBuf>),
    Sink(SinkFactory),
}

impl fmt::Debug for CaptureTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureTarget::File(path) => f.debug_tuple("File").field(path).finish(),
            CaptureTarget::Sink(_) => f.write_str("Sink(..)"),
        }
    }
}

/// Position of the running session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub mode: SessionMode,
    pub elapsed_secs: f64,
    /// Frames written (capture) or played from the source (playback).
    pub frames: u64,
    pub total_frames: Option<u64>,
    pub sample_rate: u32,
    pub paused: bool,
}

impl Progress {
    pub fn position_secs(&self) -> f64 {
        self.frames as f64 / self.sample_rate.max(1) as f64
    }
}

struct Shared {
    status: Mutex<SessionStatus>,
    status_tx: broadcast::Sender<SessionStatusEvent>,
    level_tx: broadcast::Sender<LevelEvent>,
    finished_tx: broadcast::Sender<FinishedEvent>,
    diagnostics: Arc<SessionDiagnostics>,
}

impl Shared {
    fn set_status(&self, status: SessionStatus, mode: Option<SessionMode>, detail: Option<String>) {
        *self.status.lock() = status;
        let _ = self.status_tx.send(SessionStatusEvent {
            status,
            mode,
            detail,
        });
    }
}

struct ActiveSession {
    mode: SessionMode,
    info: StreamInfo,
    control: Arc<SessionControl>,
    handle: JoinHandle<Result<SessionReport>>,
    started: Instant,
    total_frames: Option<u64>,
    description: String,
}

/// The top-level session handle.
///
/// `AudioSession` is `Send + Sync`; every command takes `&self`. Commands are
/// serialized on an internal lock, so each one is synchronous and idempotent.
pub struct AudioSession {
    config: SessionConfig,
    backend: Arc<dyn AudioBackend>,
    shared: Arc<Shared>,
    active: Mutex<Option<ActiveSession>>,
    /// Result of a session that ended by itself and has not been collected.
    unclaimed: Mutex<Option<Result<SessionReport>>>,
}

impl AudioSession {
    pub fn new(config: SessionConfig, backend: Arc<dyn AudioBackend>) -> Result<Self> {
        config.validate()?;
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (level_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (finished_tx, _) = broadcast::channel(BROADCAST_CAP);
        Ok(Self {
            config,
            backend,
            shared: Arc::new(Shared {
                status: Mutex::new(SessionStatus::Idle),
                status_tx,
                level_tx,
                finished_tx,
                diagnostics: Arc::new(SessionDiagnostics::default()),
            }),
            active: Mutex::new(None),
            unclaimed: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn host_name(&self) -> String {
        self.backend.host_name()
    }

    /// Start recording into `target`.
    ///
    /// Blocks until the input stream is confirmed open (or fails). On any
    /// error no thread is left running.
    pub fn start_capture(&self, target: CaptureTarget) -> Result<Transition> {
        let mut slot = self.active.lock();
        self.reap(&mut slot);
        if slot.is_some() {
            info!("start ignored: session already running");
            return Ok(Transition::AlreadyRunning);
        }
        self.discard_unclaimed();

        let request = self.config.stream_request(PortDirection::Capture);
        let probed = self.backend.probe_input(&request)?;
        let channels = self.config.channels;

        let (sink, description): (Box<dyn BlockSink>, String) = match target {
            CaptureTarget::File(path) => {
                let path = path.unwrap_or_else(|| {
                    default_recording_path(self.config.recordings_dir.as_deref())
                });
                let description = path.display().to_string();
                let sink = WavSink::create(
                    &path,
                    probed.sample_rate,
                    channels,
                    self.config.bit_depth,
                )?;
                (Box::new(sink), description)
            }
            CaptureTarget::Sink(factory) => (factory(&probed, channels)?, "custom sink".into()),
        };

        self.shared.diagnostics.reset();
        let control = Arc::new(SessionControl::default());
        let capacity = self.config.queue_capacity;
        let (sender, receiver) = handoff_queue(capacity);
        let (recycle, pool) = block_pool(capacity, capacity, self.config.prealloc_frames, channels);

        let callback = CaptureCallback::new(
            sender,
            pool,
            probed.channels,
            channels,
            self.config.input_gain,
            Arc::clone(&control),
            Arc::clone(&self.shared.diagnostics),
        );
        let worker = CaptureWorker::new(
            receiver,
            recycle,
            sink,
            Arc::clone(&control),
            Arc::clone(&self.shared.diagnostics),
            self.shared.level_tx.clone(),
            self.config.timing(),
        );

        let (open_tx, open_rx) = mpsc::channel::<Result<StreamInfo>>();
        let thread = CaptureThread {
            backend: Arc::clone(&self.backend),
            request,
            expected: probed,
            callback,
            worker,
            control: Arc::clone(&control),
            shared: Arc::clone(&self.shared),
            open_tx,
        };
        let handle = thread::Builder::new()
            .name("tapedeck-capture".into())
            .spawn(move || thread.run())?;

        let info = self.await_open(open_rx, handle, SessionMode::Capture, |handle, info| {
            ActiveSession {
                mode: SessionMode::Capture,
                info,
                control,
                handle,
                started: Instant::now(),
                total_frames: None,
                description,
            }
        }, &mut slot)?;

        info!(
            host = info.host.as_str(),
            device = info.device.as_str(),
            sample_rate = info.sample_rate,
            channels,
            "recording started"
        );
        Ok(Transition::Started(info))
    }

    /// Start playing `source`.
    ///
    /// A sample-rate mismatch between source and device is a warning; the
    /// audio plays at the device rate unless the source is generated or
    /// `resample_to_device` is set, in which case it is converted first.
    pub fn start_playback(&self, mut source: Box<dyn SampleSource>) -> Result<Transition> {
        let mut slot = self.active.lock();
        self.reap(&mut slot);
        if slot.is_some() {
            info!("start ignored: session already running");
            return Ok(Transition::AlreadyRunning);
        }
        self.discard_unclaimed();

        let request = self.config.stream_request(PortDirection::Playback);
        let probed = self.backend.probe_output(&request)?;

        if probed.sample_rate != source.sample_rate() {
            if source.is_generated() || self.config.resample_to_device {
                info!(
                    source_rate = source.sample_rate(),
                    device_rate = probed.sample_rate,
                    "converting source to device rate"
                );
                source.retarget_rate(probed.sample_rate)?;
            } else {
                warn!(
                    source_rate = source.sample_rate(),
                    device_rate = probed.sample_rate,
                    "sample rate mismatch: playing at device rate"
                );
            }
        }

        let total_frames = source.len_frames();
        let description = source.describe();

        self.shared.diagnostics.reset();
        let control = Arc::new(SessionControl::default());
        let (eos_tx, eos_rx) = playback::end_of_stream_channel();
        let callback = PlaybackCallback::new(
            source,
            probed.channels,
            Arc::clone(&control),
            Arc::clone(&self.shared.diagnostics),
            eos_tx,
        );

        let (open_tx, open_rx) = mpsc::channel::<Result<StreamInfo>>();
        let thread = PlaybackThread {
            backend: Arc::clone(&self.backend),
            request,
            expected: probed,
            callback,
            eos_rx,
            poll: self.config.pop_timeout,
            control: Arc::clone(&control),
            shared: Arc::clone(&self.shared),
            open_tx,
        };
        let handle = thread::Builder::new()
            .name("tapedeck-playback".into())
            .spawn(move || thread.run())?;

        let info = self.await_open(open_rx, handle, SessionMode::Playback, |handle, info| {
            ActiveSession {
                mode: SessionMode::Playback,
                info,
                control,
                handle,
                started: Instant::now(),
                total_frames,
                description,
            }
        }, &mut slot)?;

        info!(
            host = info.host.as_str(),
            device = info.device.as_str(),
            sample_rate = info.sample_rate,
            channels = info.channels,
            "playback started"
        );
        Ok(Transition::Started(info))
    }

    /// Stop the running session, wait for the worker and return its report.
    ///
    /// While idle this is a no-op, except that an unclaimed error from a
    /// session that ended by itself is returned once.
    pub fn stop(&self) -> Result<Transition> {
        let mut slot = self.active.lock();
        let Some(active) = slot.take() else {
            let mut unclaimed = self.unclaimed.lock();
            if matches!(*unclaimed, Some(Err(_))) {
                if let Some(Err(e)) = unclaimed.take() {
                    return Err(e);
                }
            }
            return Ok(Transition::NotRunning);
        };

        if active.control.request_stop(SessionEnd::Requested) {
            self.shared
                .set_status(SessionStatus::Stopping, Some(active.mode), None);
            info!("session stop requested");
        }
        self.join(active).map(Transition::Stopped)
    }

    pub fn pause(&self) -> Transition {
        self.set_paused(true)
    }

    pub fn resume(&self) -> Transition {
        self.set_paused(false)
    }

    pub fn toggle_pause(&self) -> Transition {
        let paused = self
            .active
            .lock()
            .as_ref()
            .is_some_and(|a| a.control.is_paused());
        self.set_paused(!paused)
    }

    pub fn is_paused(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|a| a.control.is_paused())
    }

    /// Current lifecycle state (snapshot).
    pub fn state(&self) -> SessionStatus {
        let mut slot = self.active.lock();
        self.reap(&mut slot);
        *self.shared.status.lock()
    }

    /// Result of a session that ended by itself, if not yet collected.
    pub fn take_finished(&self) -> Option<Result<SessionReport>> {
        let mut slot = self.active.lock();
        self.reap(&mut slot);
        drop(slot);
        self.unclaimed.lock().take()
    }

    pub fn progress(&self) -> Option<Progress> {
        let slot = self.active.lock();
        let active = slot.as_ref()?;
        let snap = self.shared.diagnostics.snapshot();
        Some(Progress {
            mode: active.mode,
            elapsed_secs: active.started.elapsed().as_secs_f64(),
            frames: match active.mode {
                SessionMode::Capture => snap.frames_written,
                SessionMode::Playback => snap.frames_played,
            },
            total_frames: active.total_frames,
            sample_rate: active.info.sample_rate,
            paused: active.control.is_paused(),
        })
    }

    /// Stream currently bound to the session.
    pub fn connections(&self) -> Option<StreamInfo> {
        self.active.lock().as_ref().map(|a| a.info.clone())
    }

    /// What the running session reads from or writes to.
    pub fn description(&self) -> Option<String> {
        self.active.lock().as_ref().map(|a| a.description.clone())
    }

    pub fn list_ports(&self) -> Result<Vec<PortInfo>> {
        self.backend.list_ports()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.shared.status_tx.subscribe()
    }

    pub fn subscribe_levels(&self) -> broadcast::Receiver<LevelEvent> {
        self.shared.level_tx.subscribe()
    }

    pub fn subscribe_finished(&self) -> broadcast::Receiver<FinishedEvent> {
        self.shared.finished_tx.subscribe()
    }

    /// Snapshot of session counters for observability.
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.shared.diagnostics.snapshot()
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn set_paused(&self, paused: bool) -> Transition {
        let mut slot = self.active.lock();
        self.reap(&mut slot);
        let Some(active) = slot.as_ref() else {
            return Transition::NotRunning;
        };
        active.control.set_paused(paused);
        info!(paused, "session pause toggled");
        if paused {
            Transition::Paused
        } else {
            Transition::Resumed
        }
    }

    /// Block until the worker reports the stream open, then record it as the
    /// active session.
    fn await_open(
        &self,
        open_rx: mpsc::Receiver<Result<StreamInfo>>,
        handle: JoinHandle<Result<SessionReport>>,
        mode: SessionMode,
        make_active: impl FnOnce(JoinHandle<Result<SessionReport>>, StreamInfo) -> ActiveSession,
        slot: &mut Option<ActiveSession>,
    ) -> Result<StreamInfo> {
        match open_rx.recv() {
            Ok(Ok(info)) => {
                *slot = Some(make_active(handle, info.clone()));
                Ok(info)
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                self.shared
                    .set_status(SessionStatus::Idle, Some(mode), Some(e.to_string()));
                Err(e)
            }
            Err(_) => {
                // Channel closed before a message was sent: the worker panicked.
                let _ = handle.join();
                self.shared.set_status(
                    SessionStatus::Idle,
                    Some(mode),
                    Some("worker failed to start".into()),
                );
                Err(TapedeckError::Worker(
                    "worker thread died before opening the stream".into(),
                ))
            }
        }
    }

    /// Collect a worker that ended by itself.
    fn reap(&self, slot: &mut Option<ActiveSession>) {
        if !slot.as_ref().is_some_and(|a| a.handle.is_finished()) {
            return;
        }
        if let Some(done) = slot.take() {
            debug!("collecting finished session worker");
            let result = self.join(done);
            *self.unclaimed.lock() = Some(result);
        }
    }

    fn join(&self, active: ActiveSession) -> Result<SessionReport> {
        match active.handle.join() {
            Ok(result) => result,
            Err(_) => {
                error!("session worker panicked");
                self.shared.set_status(
                    SessionStatus::Idle,
                    Some(active.mode),
                    Some("worker panicked".into()),
                );
                Err(TapedeckError::Worker("session worker panicked".into()))
            }
        }
    }

    fn discard_unclaimed(&self) {
        if let Some(previous) = self.unclaimed.lock().take() {
            debug!(ok = previous.is_ok(), "discarding uncollected session result");
        }
    }
}

impl Drop for AudioSession {
    fn drop(&mut self) {
        if let Some(active) = self.active.get_mut().take() {
            active.control.request_stop(SessionEnd::Requested);
            let _ = active.handle.join();
        }
    }
}

// ── Worker threads ───────────────────────────────────────────────────────────

struct CaptureThread {
    backend: Arc<dyn AudioBackend>,
    request: StreamRequest,
    /// Format the callback and the sink were built for.
    expected: StreamInfo,
    callback: CaptureCallback,
    worker: CaptureWorker,
    control: Arc<SessionControl>,
    shared: Arc<Shared>,
    open_tx: mpsc::Sender<Result<StreamInfo>>,
}

impl CaptureThread {
    fn run(self) -> Result<SessionReport> {
        let CaptureThread {
            backend,
            request,
            expected,
            mut callback,
            mut worker,
            control,
            shared,
            open_tx,
        } = self;

        let on_data: InputHandler = Box::new(move |data: &[f32]| {
            callback.process(data);
        });
        let on_shutdown = shutdown_handler(&control);

        // Open on THIS thread: the stream is !Send.
        let stream = match backend
            .open_input(&request, on_data, on_shutdown)
            .and_then(|stream| check_opened(&expected, stream))
        {
            Ok(stream) => stream,
            Err(e) => {
                if let Some(summary) = worker.abandon() {
                    discard_empty_recording(&summary);
                }
                let _ = open_tx.send(Err(e));
                return Err(TapedeckError::Worker("input stream failed to open".into()));
            }
        };
        let info = stream.info.clone();
        control.set_capturing(true);
        shared.set_status(SessionStatus::Active, Some(SessionMode::Capture), None);
        let _ = open_tx.send(Ok(info.clone()));

        let run = worker.run_until_stopped();
        control.set_capturing(false);
        let end = control.end().unwrap_or(SessionEnd::Requested);
        if end != SessionEnd::Requested {
            shared.set_status(
                SessionStatus::Stopping,
                Some(SessionMode::Capture),
                Some(end.to_string()),
            );
        }

        // Callbacks stop here; nothing is pushed after this point.
        drop(stream);

        let result = match run.and_then(|()| worker.drain()) {
            Ok(()) => worker.finish(),
            Err(e) => {
                worker.abandon();
                Err(e)
            }
        };

        finish_session(&shared, SessionMode::Capture, result.map(|summary| SessionReport {
            mode: SessionMode::Capture,
            stream: info,
            recording: Some(summary),
            diagnostics: shared.diagnostics.snapshot(),
            end,
        }))
    }
}

struct PlaybackThread {
    backend: Arc<dyn AudioBackend>,
    request: StreamRequest,
    expected: StreamInfo,
    callback: PlaybackCallback,
    eos_rx: crossbeam_channel::Receiver<()>,
    poll: Duration,
    control: Arc<SessionControl>,
    shared: Arc<Shared>,
    open_tx: mpsc::Sender<Result<StreamInfo>>,
}

impl PlaybackThread {
    fn run(self) -> Result<SessionReport> {
        let PlaybackThread {
            backend,
            request,
            expected,
            mut callback,
            eos_rx,
            poll,
            control,
            shared,
            open_tx,
        } = self;

        let on_data: OutputHandler = Box::new(move |out: &mut [f32]| {
            callback.process(out);
        });
        let on_shutdown = shutdown_handler(&control);

        let stream = match backend
            .open_output(&request, on_data, on_shutdown)
            .and_then(|stream| check_opened(&expected, stream))
        {
            Ok(stream) => stream,
            Err(e) => {
                let _ = open_tx.send(Err(e));
                return Err(TapedeckError::Worker("output stream failed to open".into()));
            }
        };
        let info = stream.info.clone();
        shared.set_status(SessionStatus::Active, Some(SessionMode::Playback), None);
        let _ = open_tx.send(Ok(info.clone()));

        playback::wait_for_end(
            &eos_rx,
            &control,
            &shared.diagnostics,
            &shared.finished_tx,
            poll,
        );
        let end = control.end().unwrap_or(SessionEnd::Requested);
        if end != SessionEnd::Requested {
            shared.set_status(
                SessionStatus::Stopping,
                Some(SessionMode::Playback),
                Some(end.to_string()),
            );
        }

        drop(stream);

        finish_session(
            &shared,
            SessionMode::Playback,
            Ok(SessionReport {
                mode: SessionMode::Playback,
                stream: info,
                recording: None,
                diagnostics: shared.diagnostics.snapshot(),
                end,
            }),
        )
    }
}

/// Device loss becomes an unsolicited stop; the worker notices it on its
/// next poll.
fn shutdown_handler(control: &Arc<SessionControl>) -> ShutdownHandler {
    let control = Arc::clone(control);
    Box::new(move |_reason: String| {
        control.request_stop(SessionEnd::Disconnected);
    })
}

fn finish_session(
    shared: &Shared,
    mode: SessionMode,
    result: Result<SessionReport>,
) -> Result<SessionReport> {
    match &result {
        Ok(report) => {
            let detail = (report.end != SessionEnd::Requested).then(|| report.end.to_string());
            info!(end = %report.end, "session finished");
            shared.set_status(SessionStatus::Idle, Some(mode), detail);
        }
        Err(e) => {
            error!(error = %e, "session ended with error");
            shared.set_status(SessionStatus::Idle, Some(mode), Some(e.to_string()));
        }
    }
    result
}

/// The device can change between probe and open; a stream whose format
/// differs from the probe is closed again.
fn check_opened(expected: &StreamInfo, stream: OpenStream) -> Result<OpenStream> {
    let opened = &stream.info;
    if opened.channels == expected.channels && opened.sample_rate == expected.sample_rate {
        return Ok(stream);
    }
    Err(TapedeckError::AudioDevice(format!(
        "{} changed format while opening: expected {} ch at {} Hz, got {} ch at {} Hz",
        opened.device, expected.channels, expected.sample_rate, opened.channels, opened.sample_rate
    )))
}

/// Remove a recording that never received a frame because the stream did
/// not open.
fn discard_empty_recording(summary: &SinkSummary) {
    if summary.frames != 0 {
        return;
    }
    if let Some(path) = &summary.path {
        if let Err(e) = fs::remove_file(path) {
            debug!("could not remove empty recording {}: {e}", path.display());
        }
    }
}
