//! In-process audio backend driven by a clock thread.
//!
//! Used for tests, the `queue-stress` benchmark, and `--offline` runs on
//! machines without a sound server. Each open stream spawns one thread that
//! invokes the data handler with blocks of the configured sizes, optionally
//! paced to mimic a device period.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use super::{
    AudioBackend, InputHandler, OpenStream, OutputHandler, PortDirection, PortInfo,
    ShutdownHandler, StreamInfo, StreamRequest,
};
use crate::error::{Result, TapedeckError};

/// Sample generator for simulated input: `(frame index, channel) -> sample`.
pub type SignalFn = Arc<dyn Fn(u64, u16) -> f32 + Send + Sync>;

#[derive(Clone)]
pub struct SimulatedConfig {
    pub host_name: String,
    pub device_name: String,
    pub sample_rate: u32,
    /// Device channel count when the request does not ask for one.
    pub channels: u16,
    /// Block sizes in frames, cycled in order. Mixed sizes model hosts
    /// without a fixed period.
    pub block_sizes: Vec<usize>,
    /// Sleep between blocks. Zero yields instead, delivering as fast as the
    /// consumer allows.
    pub pace: Duration,
    /// Stop delivering after this many blocks.
    pub max_blocks: Option<u64>,
    /// Call the shutdown handler after this many blocks and stop delivering.
    pub disconnect_after: Option<u64>,
    /// Make every `open_*` call fail.
    pub fail_open: bool,
    /// Keep everything written by output handlers for inspection.
    pub record_output: bool,
    pub signal: SignalFn,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            host_name: "simulated".into(),
            device_name: "Simulated Device".into(),
            sample_rate: 48_000,
            channels: 2,
            block_sizes: vec![256],
            pace: Duration::ZERO,
            max_blocks: None,
            disconnect_after: None,
            fail_open: false,
            record_output: true,
            signal: sine_signal(440.0, 0.25, 48_000),
        }
    }
}

impl fmt::Debug for SimulatedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedConfig")
            .field("host_name", &self.host_name)
            .field("device_name", &self.device_name)
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .field("block_sizes", &self.block_sizes)
            .field("pace", &self.pace)
            .field("max_blocks", &self.max_blocks)
            .field("disconnect_after", &self.disconnect_after)
            .field("fail_open", &self.fail_open)
            .finish_non_exhaustive()
    }
}

/// A sine at `freq` Hz on every channel.
pub fn sine_signal(freq: f32, amplitude: f32, sample_rate: u32) -> SignalFn {
    let step = std::f64::consts::TAU * freq as f64 / sample_rate.max(1) as f64;
    Arc::new(move |frame, _ch| (amplitude as f64 * (frame as f64 * step).sin()) as f32)
}

/// Each sample encodes its own position: `frame * channels + ch`, scaled by
/// `1 / scale`. Lets tests check ordering and completeness sample by sample.
pub fn ramp_signal(channels: u16, scale: f32) -> SignalFn {
    Arc::new(move |frame, ch| (frame * channels as u64 + ch as u64) as f32 / scale)
}

#[derive(Debug, Clone)]
pub struct SimulatedBackend {
    config: SimulatedConfig,
    output_log: Arc<Mutex<Vec<f32>>>,
    delivered: Arc<AtomicU64>,
    live_threads: Arc<AtomicUsize>,
}

impl SimulatedBackend {
    pub fn new(config: SimulatedConfig) -> Self {
        Self {
            config,
            output_log: Arc::new(Mutex::new(Vec::new())),
            delivered: Arc::new(AtomicU64::new(0)),
            live_threads: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> &SimulatedConfig {
        &self.config
    }

    /// Everything output handlers have produced, interleaved.
    pub fn output_samples(&self) -> Vec<f32> {
        self.output_log.lock().clone()
    }

    /// Blocks handed to data handlers across all streams.
    pub fn blocks_delivered(&self) -> u64 {
        self.delivered.load(Ordering::Acquire)
    }

    /// Clock threads still running.
    pub fn live_streams(&self) -> usize {
        self.live_threads.load(Ordering::Acquire)
    }

    fn info(&self, direction: PortDirection, request: &StreamRequest) -> StreamInfo {
        let fixed = match self.config.block_sizes.as_slice() {
            [only] => Some(*only as u32),
            _ => None,
        };
        StreamInfo {
            host: self.config.host_name.clone(),
            device: request
                .device
                .clone()
                .unwrap_or_else(|| self.config.device_name.clone()),
            direction,
            sample_rate: self.config.sample_rate,
            channels: request.channels.unwrap_or(self.config.channels).max(1),
            block_size: request.block_size.or(fixed),
        }
    }

    fn block_sizes(&self, request: &StreamRequest) -> Vec<usize> {
        match request.block_size {
            Some(frames) => vec![frames as usize],
            None if self.config.block_sizes.is_empty() => vec![256],
            None => self.config.block_sizes.clone(),
        }
    }

    fn spawn_clock<F>(&self, name: &str, mut tick: F) -> Result<SimulatedStream>
    where
        F: FnMut(u64) -> bool + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let live = Arc::clone(&self.live_threads);
        let delivered = Arc::clone(&self.delivered);
        let pace = self.config.pace;
        let max_blocks = self.config.max_blocks;

        live.fetch_add(1, Ordering::AcqRel);
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                let mut n: u64 = 0;
                while !stop_flag.load(Ordering::Acquire) {
                    if max_blocks.is_some_and(|max| n >= max) {
                        break;
                    }
                    if !tick(n) {
                        break;
                    }
                    n += 1;
                    delivered.fetch_add(1, Ordering::AcqRel);
                    if pace.is_zero() {
                        thread::yield_now();
                    } else {
                        thread::sleep(pace);
                    }
                }
                debug!(blocks = n, "simulated clock exited");
                live.fetch_sub(1, Ordering::AcqRel);
            });

        match handle {
            Ok(handle) => Ok(SimulatedStream {
                stop,
                handle: Some(handle),
            }),
            Err(e) => {
                self.live_threads.fetch_sub(1, Ordering::AcqRel);
                Err(TapedeckError::Io(e))
            }
        }
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new(SimulatedConfig::default())
    }
}

/// Keeps the clock thread alive; dropping it stops and joins the thread.
struct SimulatedStream {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for SimulatedStream {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl AudioBackend for SimulatedBackend {
    fn host_name(&self) -> String {
        self.config.host_name.clone()
    }

    fn probe_input(&self, request: &StreamRequest) -> Result<StreamInfo> {
        Ok(self.info(PortDirection::Capture, request))
    }

    fn probe_output(&self, request: &StreamRequest) -> Result<StreamInfo> {
        Ok(self.info(PortDirection::Playback, request))
    }

    fn open_input(
        &self,
        request: &StreamRequest,
        mut on_data: InputHandler,
        mut on_shutdown: ShutdownHandler,
    ) -> Result<OpenStream> {
        if self.config.fail_open {
            return Err(TapedeckError::AudioDevice(
                "simulated device refused to open".into(),
            ));
        }
        let info = self.info(PortDirection::Capture, request);
        let sizes = self.block_sizes(request);
        let channels = info.channels;
        let signal = Arc::clone(&self.config.signal);
        let disconnect_after = self.config.disconnect_after;
        let mut frame: u64 = 0;
        let mut buf: Vec<f32> = Vec::new();

        let stream = self.spawn_clock("sim-input", move |n| {
            if disconnect_after == Some(n) {
                on_shutdown("simulated device disconnected".into());
                return false;
            }
            let frames = sizes[n as usize % sizes.len()];
            buf.clear();
            for i in 0..frames as u64 {
                for ch in 0..channels {
                    buf.push(signal(frame + i, ch));
                }
            }
            on_data(&buf);
            frame += frames as u64;
            true
        })?;

        Ok(OpenStream::new(info, stream))
    }

    fn open_output(
        &self,
        request: &StreamRequest,
        mut on_data: OutputHandler,
        mut on_shutdown: ShutdownHandler,
    ) -> Result<OpenStream> {
        if self.config.fail_open {
            return Err(TapedeckError::AudioDevice(
                "simulated device refused to open".into(),
            ));
        }
        let info = self.info(PortDirection::Playback, request);
        let sizes = self.block_sizes(request);
        let channels = info.channels as usize;
        let disconnect_after = self.config.disconnect_after;
        let log = self
            .config
            .record_output
            .then(|| Arc::clone(&self.output_log));
        let mut buf: Vec<f32> = Vec::new();

        let stream = self.spawn_clock("sim-output", move |n| {
            if disconnect_after == Some(n) {
                on_shutdown("simulated device disconnected".into());
                return false;
            }
            let frames = sizes[n as usize % sizes.len()];
            buf.clear();
            buf.resize(frames * channels, 0.0);
            on_data(&mut buf);
            if let Some(log) = &log {
                log.lock().extend_from_slice(&buf);
            }
            true
        })?;

        Ok(OpenStream::new(info, stream))
    }

    fn list_ports(&self) -> Result<Vec<PortInfo>> {
        Ok([PortDirection::Capture, PortDirection::Playback]
            .into_iter()
            .map(|direction| PortInfo {
                name: self.config.device_name.clone(),
                direction,
                is_default: true,
                channels: Some(self.config.channels),
                sample_rate: Some(self.config.sample_rate),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn input_cycles_block_sizes_and_stops_after_max_blocks() {
        let backend = SimulatedBackend::new(SimulatedConfig {
            block_sizes: vec![64, 128, 32],
            max_blocks: Some(6),
            channels: 1,
            ..Default::default()
        });
        let (tx, rx) = mpsc::channel();
        let stream = backend
            .open_input(
                &StreamRequest::default(),
                Box::new(move |data| {
                    let _ = tx.send(data.len());
                }),
                Box::new(|_| {}),
            )
            .expect("open simulated input");
        assert!(wait_for(|| backend.blocks_delivered() == 6));
        let sizes: Vec<usize> = rx.try_iter().collect();
        assert_eq!(sizes, [64, 128, 32, 64, 128, 32]);
        drop(stream);
        assert_eq!(backend.live_streams(), 0);
    }

    #[test]
    fn dropping_the_stream_joins_the_clock_thread() {
        let backend = SimulatedBackend::default();
        let stream = backend
            .open_input(&StreamRequest::default(), Box::new(|_| {}), Box::new(|_| {}))
            .expect("open simulated input");
        assert_eq!(backend.live_streams(), 1);
        drop(stream);
        assert_eq!(backend.live_streams(), 0);
    }

    #[test]
    fn disconnect_invokes_shutdown_handler() {
        let backend = SimulatedBackend::new(SimulatedConfig {
            disconnect_after: Some(3),
            ..Default::default()
        });
        let (tx, rx) = mpsc::channel();
        let _stream = backend
            .open_output(
                &StreamRequest::default(),
                Box::new(|out| out.fill(0.5)),
                Box::new(move |reason| {
                    let _ = tx.send(reason);
                }),
            )
            .expect("open simulated output");
        let reason = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("shutdown reported");
        assert!(reason.contains("disconnected"));
        assert_eq!(backend.blocks_delivered(), 3);
        assert_eq!(backend.output_samples().len(), 3 * 256 * 2);
    }

    #[test]
    fn request_overrides_channels_and_block_size() {
        let backend = SimulatedBackend::default();
        let info = backend
            .probe_input(&StreamRequest {
                channels: Some(1),
                block_size: Some(512),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(info.channels, 1);
        assert_eq!(info.block_size, Some(512));
        assert_eq!(info.sample_rate, 48_000);
    }

    #[test]
    fn fail_open_is_reported() {
        let backend = SimulatedBackend::new(SimulatedConfig {
            fail_open: true,
            ..Default::default()
        });
        let err = backend
            .open_input(&StreamRequest::default(), Box::new(|_| {}), Box::new(|_| {}))
            .expect_err("open must fail");
        assert!(matches!(err, TapedeckError::AudioDevice(_)));
        assert_eq!(backend.live_streams(), 0);
    }
}
