#![allow(dead_code)]

use std::io::ErrorKind;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tapedeck_core::buffering::block::AudioBlock;
use tapedeck_core::engine::SinkFactory;
use tapedeck_core::{
    AudioSession, BlockSink, SessionConfig, SessionStatus, SimulatedBackend, SimulatedConfig,
    SinkSummary, StreamInfo, TapedeckError,
};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

/// Sink that keeps every sample and can be told to fail.
pub struct MemorySink {
    pub samples: Arc<Mutex<Vec<f32>>>,
    pub blocks: Arc<Mutex<usize>>,
    pub fail_at: Option<(usize, ErrorKind)>,
    pub delay: Duration,
    channels: u16,
    sample_rate: u32,
    calls: usize,
    frames: u64,
}

impl BlockSink for MemorySink {
    fn write_block(&mut self, block: &AudioBlock) -> tapedeck_core::Result<()> {
        self.calls += 1;
        if let Some((at, kind)) = self.fail_at {
            if self.calls >= at {
                return Err(TapedeckError::Io(std::io::Error::from(kind)));
            }
        }
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        self.samples.lock().extend_from_slice(block.samples());
        *self.blocks.lock() += 1;
        self.frames += block.frames() as u64;
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.frames
    }

    fn finalize(self: Box<Self>) -> tapedeck_core::Result<SinkSummary> {
        Ok(SinkSummary {
            path: None,
            frames: self.frames,
            channels: self.channels,
            sample_rate: self.sample_rate,
        })
    }
}

/// Handles for inspecting what a [`MemorySink`] received.
#[derive(Clone, Default)]
pub struct MemoryProbe {
    pub samples: Arc<Mutex<Vec<f32>>>,
    pub blocks: Arc<Mutex<usize>>,
}

impl MemoryProbe {
    pub fn factory(&self, fail_at: Option<(usize, ErrorKind)>, delay: Duration) -> SinkFactory {
        let samples = Arc::clone(&self.samples);
        let blocks = Arc::clone(&self.blocks);
        Box::new(
            move |info: &StreamInfo, channels: u16| -> tapedeck_core::Result<Box<dyn BlockSink>> {
                Ok(Box::new(MemorySink {
                    samples,
                    blocks,
                    fail_at,
                    delay,
                    channels,
                    sample_rate: info.sample_rate,
                    calls: 0,
                    frames: 0,
                }))
            },
        )
    }

    pub fn block_count(&self) -> usize {
        *self.blocks.lock()
    }

    pub fn samples(&self) -> Vec<f32> {
        self.samples.lock().clone()
    }
}

pub fn session(config: SessionConfig, sim: SimulatedConfig) -> (AudioSession, SimulatedBackend) {
    let backend = SimulatedBackend::new(sim);
    let session =
        AudioSession::new(config, Arc::new(backend.clone())).expect("valid session config");
    (session, backend)
}

pub fn fast_config() -> SessionConfig {
    SessionConfig {
        pop_timeout: Duration::from_millis(10),
        ..Default::default()
    }
}

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

pub fn wait_for_idle(session: &AudioSession) {
    assert!(
        wait_until(Duration::from_secs(5), || session.state() == SessionStatus::Idle),
        "session did not return to idle"
    );
}

pub fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(ev) => out.push(ev),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return out,
        }
    }
}
