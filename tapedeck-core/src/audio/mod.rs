//! Audio subsystem seam.
//!
//! # Design constraints
//!
//! The data handlers passed to [`AudioBackend::open_input`] and
//! [`AudioBackend::open_output`] run on the audio subsystem's real-time thread,
//! once per block. They **must not**:
//! - Block on a mutex or condvar
//! - Perform I/O (including logging)
//! - Allocate in the steady state
//!
//! The engine's capture and playback callbacks satisfy that contract; the
//! backends only convert sample formats around them.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). [`OpenStream`] is therefore `!Send` as well: the engine opens it on
//! the worker thread and drops it on that same thread.

pub mod device;
pub mod host;
pub mod resample;
pub mod simulated;

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use device::PortInfo;
pub use host::CpalBackend;
pub use simulated::{SimulatedBackend, SimulatedConfig};

use crate::error::Result;

/// Direction of a device or stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortDirection {
    /// Audio flows from the device into the session (recording).
    Capture,
    /// Audio flows from the session to the device (playback).
    Playback,
}

impl PortDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            PortDirection::Capture => "capture",
            PortDirection::Playback => "playback",
        }
    }
}

impl fmt::Display for PortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the session asks of the backend when opening a stream.
#[derive(Debug, Clone, Default)]
pub struct StreamRequest {
    /// Client name used in logs and, where the host supports it, port names.
    pub client_name: String,
    /// Preferred device name; `None` selects the host default.
    pub device: Option<String>,
    /// Preferred channel count; `None` keeps the device default.
    pub channels: Option<u16>,
    /// Preferred block size in frames; `None` lets the host decide.
    pub block_size: Option<u32>,
}

/// The stream format a backend actually opened (or will open).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    pub host: String,
    pub device: String,
    pub direction: PortDirection,
    pub sample_rate: u32,
    /// Channels in the interleaved buffers handed to the data handler.
    pub channels: u16,
    /// Fixed block size when the host reports one.
    pub block_size: Option<u32>,
}

/// Real-time input handler: interleaved f32 frames at `StreamInfo::channels`.
pub type InputHandler = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Real-time output handler: fill interleaved f32 frames.
pub type OutputHandler = Box<dyn FnMut(&mut [f32]) + Send + 'static>;

/// Called (off the real-time thread) when the audio subsystem goes away.
pub type ShutdownHandler = Box<dyn FnMut(String) + Send + 'static>;

/// A running stream. Callbacks stop once this value is dropped.
///
/// **Not `Send`**: create and drop it on the same OS thread.
pub struct OpenStream {
    pub info: StreamInfo,
    _keepalive: Box<dyn Any>,
}

impl OpenStream {
    pub fn new<K: Any>(info: StreamInfo, keepalive: K) -> Self {
        Self {
            info,
            _keepalive: Box::new(keepalive),
        }
    }
}

impl fmt::Debug for OpenStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenStream")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// Contract for audio subsystems the session can drive.
pub trait AudioBackend: Send + Sync + 'static {
    /// Short host name, e.g. `"alsa"`, `"jack"` or `"simulated"`.
    fn host_name(&self) -> String;

    /// Resolve the format `open_input` would use for `request`, without
    /// opening anything.
    fn probe_input(&self, request: &StreamRequest) -> Result<StreamInfo>;

    /// Resolve the format `open_output` would use for `request`.
    fn probe_output(&self, request: &StreamRequest) -> Result<StreamInfo>;

    /// Open and start an input stream delivering blocks to `on_data`.
    fn open_input(
        &self,
        request: &StreamRequest,
        on_data: InputHandler,
        on_shutdown: ShutdownHandler,
    ) -> Result<OpenStream>;

    /// Open and start an output stream pulling blocks from `on_data`.
    fn open_output(
        &self,
        request: &StreamRequest,
        on_data: OutputHandler,
        on_shutdown: ShutdownHandler,
    ) -> Result<OpenStream>;

    /// Every capture and playback device the host exposes.
    fn list_ports(&self) -> Result<Vec<PortInfo>>;
}
