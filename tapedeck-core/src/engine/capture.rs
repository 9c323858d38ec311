//! Capture path: real-time callback and the writer loop.
//!
//! ```text
//! device thread                        worker thread
//! ─────────────                        ─────────────
//! CaptureCallback::process             CaptureWorker::run_until_stopped
//!   take block from pool  ◄──recycle──   pop_timeout
//!   copy input × gain                    sink.write_block
//!   try_push ──────handoff queue──────►  level meter / drop log
//! ```
//!
//! On stop the session drops the stream before calling
//! [`CaptureWorker::drain`], so no block can be pushed after the drain and
//! every queued block reaches the sink in capture order.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::diagnostics::SessionDiagnostics;
use super::{SessionControl, SessionEnd};
use crate::buffering::{
    block::AudioBlock, BlockReceiver, BlockSender, Consumer, Pop, PoolConsumer, PoolProducer,
    Producer, PushError,
};
use crate::error::{Result, TapedeckError};
use crate::events::LevelEvent;
use crate::sink::{BlockSink, SinkSummary};

/// Blocks quieter than this RMS do not produce level events.
pub const LEVEL_FLOOR_RMS: f32 = 0.001;

/// What happened to one input block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queue full; the block was discarded and the drop counter bumped.
    Dropped,
    /// Not capturing (paused, stopping or an empty buffer).
    Skipped,
    /// The worker is gone.
    Closed,
}

/// Runs on the device thread once per input block.
///
/// Never blocks, locks or logs. Storage comes from the block pool; a block
/// that could not be queued is kept as the next spare, so after warm-up the
/// only allocation is a pool miss when the writer falls behind by more than
/// the pool size.
pub struct CaptureCallback {
    sender: BlockSender,
    pool: PoolConsumer,
    spare: Option<AudioBlock>,
    input_channels: u16,
    channels: u16,
    gain: f32,
    control: Arc<SessionControl>,
    diagnostics: Arc<SessionDiagnostics>,
}

impl CaptureCallback {
    pub fn new(
        sender: BlockSender,
        pool: PoolConsumer,
        input_channels: u16,
        channels: u16,
        gain: f32,
        control: Arc<SessionControl>,
        diagnostics: Arc<SessionDiagnostics>,
    ) -> Self {
        Self {
            sender,
            pool,
            spare: None,
            input_channels: input_channels.max(1),
            channels: channels.max(1),
            gain,
            control,
            diagnostics,
        }
    }

    pub fn process(&mut self, input: &[f32]) -> PushOutcome {
        if !self.control.is_capturing() || input.len() < self.input_channels as usize {
            return PushOutcome::Skipped;
        }

        let mut block = match self.spare.take().or_else(|| self.pool.try_pop()) {
            Some(block) => block,
            None => {
                self.diagnostics.pool_misses.fetch_add(1, Ordering::Relaxed);
                AudioBlock::with_capacity(
                    input.len() / self.input_channels as usize,
                    self.channels,
                )
            }
        };
        block.copy_from_interleaved(input, self.input_channels, self.channels, self.gain);
        self.diagnostics
            .blocks_captured
            .fetch_add(1, Ordering::Relaxed);

        match self.sender.try_push(block) {
            Ok(()) => PushOutcome::Queued,
            Err(PushError::Full(block)) => {
                self.diagnostics
                    .blocks_dropped
                    .fetch_add(1, Ordering::Relaxed);
                self.spare = Some(block);
                PushOutcome::Dropped
            }
            Err(PushError::Closed(block)) => {
                self.spare = Some(block);
                PushOutcome::Closed
            }
        }
    }
}

/// Tuning knobs for [`CaptureWorker`], taken from `SessionConfig`.
#[derive(Debug, Clone, Copy)]
pub struct WorkerTiming {
    pub pop_timeout: Duration,
    pub level_interval_blocks: u64,
    pub drop_log_interval: Duration,
}

/// Drains the handoff queue into a sink on the worker thread.
pub struct CaptureWorker {
    receiver: BlockReceiver,
    recycle: PoolProducer,
    sink: Box<dyn BlockSink>,
    control: Arc<SessionControl>,
    diagnostics: Arc<SessionDiagnostics>,
    level_tx: broadcast::Sender<LevelEvent>,
    timing: WorkerTiming,
    level_seq: u64,
    written: u64,
    logged_drops: u64,
    last_drop_log: Option<Instant>,
}

impl CaptureWorker {
    pub fn new(
        receiver: BlockReceiver,
        recycle: PoolProducer,
        sink: Box<dyn BlockSink>,
        control: Arc<SessionControl>,
        diagnostics: Arc<SessionDiagnostics>,
        level_tx: broadcast::Sender<LevelEvent>,
        timing: WorkerTiming,
    ) -> Self {
        Self {
            receiver,
            recycle,
            sink,
            control,
            diagnostics,
            level_tx,
            timing,
            level_seq: 0,
            written: 0,
            logged_drops: 0,
            last_drop_log: None,
        }
    }

    /// Write blocks until a stop is requested. A fatal write error requests
    /// the stop itself and is returned.
    pub fn run_until_stopped(&mut self) -> Result<()> {
        info!("capture worker started");
        loop {
            if self.control.is_stopped() {
                return Ok(());
            }
            match self.receiver.pop_timeout(self.timing.pop_timeout) {
                Pop::Block(block) => {
                    if let Err(e) = self.write(block) {
                        self.control.request_stop(SessionEnd::WriteFailed);
                        return Err(e);
                    }
                }
                Pop::TimedOut => {}
                Pop::Closed => return Ok(()),
            }
            self.log_drops();
        }
    }

    /// Write everything still queued. Call after the stream is dropped.
    pub fn drain(&mut self) -> Result<()> {
        let mut drained = 0usize;
        while let Some(block) = self.receiver.try_pop() {
            self.write(block)?;
            drained += 1;
        }
        if drained > 0 {
            debug!(blocks = drained, "drained handoff queue after stop");
        }
        Ok(())
    }

    /// Finalize the sink and log the session counters.
    pub fn finish(self) -> Result<SinkSummary> {
        let snap = self.diagnostics.snapshot();
        info!(
            blocks_captured = snap.blocks_captured,
            blocks_dropped = snap.blocks_dropped,
            blocks_written = snap.blocks_written,
            frames_written = snap.frames_written,
            write_errors = snap.write_errors,
            pool_misses = snap.pool_misses,
            "capture worker stopped"
        );
        self.sink.finalize()
    }

    /// Finalize without caring about the outcome, after a failure elsewhere.
    pub fn abandon(self) -> Option<SinkSummary> {
        match self.sink.finalize() {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!("failed to finalize sink after error: {e}");
                None
            }
        }
    }

    fn write(&mut self, block: AudioBlock) -> Result<()> {
        let result = self.sink.write_block(&block);
        match result {
            Ok(()) => {
                self.diagnostics
                    .blocks_written
                    .fetch_add(1, Ordering::Relaxed);
                self.diagnostics
                    .frames_written
                    .fetch_add(block.frames() as u64, Ordering::Relaxed);
                self.written += 1;
                self.meter(&block);
            }
            Err(e) if e.is_transient() => {
                self.diagnostics.write_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "transient write error, block skipped");
            }
            Err(e) => {
                self.diagnostics.write_errors.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "write failed, ending recording");
                return Err(e);
            }
        }
        // A full pool means the callback is holding spares; just free it.
        let _ = self.recycle.try_push(block);
        Ok(())
    }

    fn meter(&mut self, block: &AudioBlock) {
        if self.written % self.timing.level_interval_blocks.max(1) != 0 {
            return;
        }
        let (rms, peak) = block.levels();
        debug!(
            rms = format_args!("{:.4}", rms),
            peak = format_args!("{:.4}", peak),
            queued = self.receiver.len(),
            "input level"
        );
        if rms > LEVEL_FLOOR_RMS {
            let _ = self.level_tx.send(LevelEvent {
                seq: self.level_seq,
                rms,
                peak,
            });
            self.level_seq += 1;
        }
    }

    /// Log the running drop total when it changed, at most once per interval.
    fn log_drops(&mut self) {
        let dropped = self.diagnostics.blocks_dropped.load(Ordering::Relaxed);
        if dropped == self.logged_drops {
            return;
        }
        let due = self
            .last_drop_log
            .map_or(true, |at| at.elapsed() >= self.timing.drop_log_interval);
        if due {
            warn!(
                dropped_total = dropped,
                dropped_since_last = dropped - self.logged_drops,
                "handoff queue full, blocks dropped"
            );
            self.logged_drops = dropped;
            self.last_drop_log = Some(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::{block_pool, handoff_queue, Observer};
    use parking_lot::Mutex;
    use std::io::ErrorKind;

    /// Sink that stores blocks and fails on demand.
    struct ScriptedSink {
        blocks: Arc<Mutex<Vec<Vec<f32>>>>,
        fail_at: Option<(usize, ErrorKind)>,
        calls: usize,
    }

    impl BlockSink for ScriptedSink {
        fn write_block(&mut self, block: &AudioBlock) -> Result<()> {
            self.calls += 1;
            if let Some((at, kind)) = self.fail_at {
                if self.calls == at {
                    return Err(TapedeckError::Io(std::io::Error::from(kind)));
                }
            }
            self.blocks.lock().push(block.samples().to_vec());
            Ok(())
        }

        fn frames_written(&self) -> u64 {
            self.blocks.lock().iter().map(|b| b.len() as u64).sum()
        }

        fn finalize(self: Box<Self>) -> Result<SinkSummary> {
            Ok(SinkSummary {
                path: None,
                frames: self.frames_written(),
                channels: 1,
                sample_rate: 48_000,
            })
        }
    }

    fn timing() -> WorkerTiming {
        WorkerTiming {
            pop_timeout: Duration::from_millis(5),
            level_interval_blocks: 1,
            drop_log_interval: Duration::from_millis(0),
        }
    }

    fn capturing_control() -> Arc<SessionControl> {
        let control = Arc::new(SessionControl::default());
        control.set_capturing(true);
        control
    }

    #[test]
    fn full_queue_drops_exactly_one_and_keeps_spare() {
        let (tx, _rx) = handoff_queue(1);
        let (_prod, cons) = block_pool(1, 0, 4, 1);
        let diag = Arc::new(SessionDiagnostics::default());
        let mut cb = CaptureCallback::new(tx, cons, 1, 1, 1.0, capturing_control(), diag.clone());

        assert_eq!(cb.process(&[0.1, 0.2]), PushOutcome::Queued);
        assert_eq!(cb.process(&[0.3, 0.4]), PushOutcome::Dropped);
        assert_eq!(diag.snapshot().blocks_dropped, 1);
        assert_eq!(cb.process(&[0.5, 0.6]), PushOutcome::Dropped);
        assert_eq!(diag.snapshot().blocks_dropped, 2);
        // Second drop reused the spare instead of allocating.
        assert_eq!(diag.snapshot().pool_misses, 2);
    }

    #[test]
    fn callback_uses_pool_blocks_before_allocating() {
        let (tx, _rx) = handoff_queue(4);
        let (_prod, cons) = block_pool(4, 2, 8, 1);
        let diag = Arc::new(SessionDiagnostics::default());
        let mut cb = CaptureCallback::new(tx, cons, 1, 1, 1.0, capturing_control(), diag.clone());
        for _ in 0..3 {
            cb.process(&[0.0; 8]);
        }
        assert_eq!(diag.snapshot().pool_misses, 1);
        assert_eq!(diag.snapshot().blocks_captured, 3);
    }

    #[test]
    fn callback_skips_when_not_capturing() {
        let (tx, rx) = handoff_queue(4);
        let (_prod, cons) = block_pool(4, 1, 8, 1);
        let control = Arc::new(SessionControl::default());
        let diag = Arc::new(SessionDiagnostics::default());
        let mut cb = CaptureCallback::new(tx, cons, 1, 1, 1.0, control.clone(), diag);
        assert_eq!(cb.process(&[0.5; 8]), PushOutcome::Skipped);

        control.set_capturing(true);
        control.set_paused(true);
        assert_eq!(cb.process(&[0.5; 8]), PushOutcome::Skipped);
        assert!(rx.is_empty());
    }

    #[test]
    fn worker_writes_in_order_and_recycles() {
        let (tx, rx) = handoff_queue(8);
        let (prod, cons) = block_pool(8, 0, 2, 1);
        let control = capturing_control();
        let diag = Arc::new(SessionDiagnostics::default());
        let blocks = Arc::new(Mutex::new(Vec::new()));
        let sink = ScriptedSink {
            blocks: blocks.clone(),
            fail_at: None,
            calls: 0,
        };
        let (level_tx, mut level_rx) = broadcast::channel(16);
        let mut worker = CaptureWorker::new(
            rx,
            prod,
            Box::new(sink),
            control.clone(),
            diag.clone(),
            level_tx,
            timing(),
        );

        for i in 0..5 {
            tx.try_push(AudioBlock::new(vec![i as f32 * 0.1; 2], 1)).unwrap();
        }
        control.request_stop(SessionEnd::Requested);
        worker.run_until_stopped().unwrap();
        worker.drain().unwrap();
        let summary = worker.finish().unwrap();

        let written = blocks.lock().clone();
        assert_eq!(written.len(), 5);
        for (i, b) in written.iter().enumerate() {
            assert_eq!(b[0], i as f32 * 0.1);
        }
        assert_eq!(summary.frames, 10);
        assert_eq!(diag.snapshot().blocks_written, 5);
        assert_eq!(cons.occupied_len(), 5);

        // Block 0 is silent and stays below the floor.
        let first = level_rx.try_recv().expect("level event");
        assert_eq!(first.seq, 0);
        assert!((first.rms - 0.1).abs() < 1e-6);
    }

    #[test]
    fn transient_error_is_counted_and_loop_continues() {
        let (tx, rx) = handoff_queue(8);
        let (prod, _cons) = block_pool(8, 0, 2, 1);
        let control = capturing_control();
        let diag = Arc::new(SessionDiagnostics::default());
        let blocks = Arc::new(Mutex::new(Vec::new()));
        let sink = ScriptedSink {
            blocks: blocks.clone(),
            fail_at: Some((2, ErrorKind::Interrupted)),
            calls: 0,
        };
        let (level_tx, _) = broadcast::channel(16);
        let mut worker =
            CaptureWorker::new(rx, prod, Box::new(sink), control.clone(), diag.clone(), level_tx, timing());
        for _ in 0..3 {
            tx.try_push(AudioBlock::new(vec![0.0; 2], 1)).unwrap();
        }
        control.request_stop(SessionEnd::Requested);
        worker.run_until_stopped().unwrap();
        worker.drain().unwrap();
        assert_eq!(blocks.lock().len(), 2);
        assert_eq!(diag.snapshot().write_errors, 1);
    }

    #[test]
    fn fatal_error_stops_the_session() {
        let (tx, rx) = handoff_queue(8);
        let (prod, _cons) = block_pool(8, 0, 2, 1);
        let control = capturing_control();
        let diag = Arc::new(SessionDiagnostics::default());
        let sink = ScriptedSink {
            blocks: Arc::new(Mutex::new(Vec::new())),
            fail_at: Some((1, ErrorKind::PermissionDenied)),
            calls: 0,
        };
        let (level_tx, _) = broadcast::channel(16);
        let mut worker =
            CaptureWorker::new(rx, prod, Box::new(sink), control.clone(), diag, level_tx, timing());
        tx.try_push(AudioBlock::new(vec![0.0; 2], 1)).unwrap();

        let err = worker.run_until_stopped().unwrap_err();
        assert!(matches!(err, TapedeckError::Io(_)));
        assert!(control.is_stopped());
        assert_eq!(control.end(), Some(SessionEnd::WriteFailed));
        assert!(worker.abandon().is_some());
    }

    /// Seekable in-memory writer that times out once `budget` writes are used.
    struct TimingOutWriter {
        data: std::io::Cursor<Vec<u8>>,
        budget: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl std::io::Write for TimingOutWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.budget.load(Ordering::Relaxed) == 0 {
                return Err(std::io::Error::from(ErrorKind::TimedOut));
            }
            self.budget.fetch_sub(1, Ordering::Relaxed);
            std::io::Write::write(&mut self.data, buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl std::io::Seek for TimingOutWriter {
        fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
            std::io::Seek::seek(&mut self.data, pos)
        }
    }

    #[test]
    fn timeout_inside_a_block_ends_the_recording() {
        let (tx, rx) = handoff_queue(8);
        let (prod, _cons) = block_pool(8, 0, 2, 1);
        let control = capturing_control();
        let diag = Arc::new(SessionDiagnostics::default());
        let budget = Arc::new(std::sync::atomic::AtomicUsize::new(usize::MAX));
        let writer = TimingOutWriter {
            data: std::io::Cursor::new(Vec::new()),
            budget: budget.clone(),
        };
        let sink = crate::sink::WavSink::new(writer, 48_000, 1, crate::sink::BitDepth::Pcm16)
            .unwrap();
        // One full block, then one sample of the next.
        budget.store(3, Ordering::Relaxed);
        let (level_tx, _) = broadcast::channel(16);
        let mut worker =
            CaptureWorker::new(rx, prod, Box::new(sink), control.clone(), diag.clone(), level_tx, timing());
        for _ in 0..3 {
            tx.try_push(AudioBlock::new(vec![0.1, 0.2], 1)).unwrap();
        }

        let err = worker.run_until_stopped().unwrap_err();
        assert!(matches!(err, TapedeckError::PartialWrite { written: 1, .. }), "{err:?}");
        assert_eq!(control.end(), Some(SessionEnd::WriteFailed));
        assert_eq!(diag.snapshot().blocks_written, 1);
        assert_eq!(diag.snapshot().write_errors, 1);
    }
}
