//! # tapedeck-core
//!
//! Real-time audio capture and playback built around one hand-off.
//!
//! ## Architecture
//!
//! ```text
//! capture:   device → CaptureCallback ─try_push→ bounded queue ─pop_timeout→ CaptureWorker → WAV
//!                           ▲                                                    │
//!                           └──────────────── block pool (SPSC ring) ◄───────────┘
//!
//! playback:  SampleSource → PlaybackCallback → device
//!                                 │ end-of-stream (once)
//!                                 ▼
//!                          playback worker → FinishedEvent
//! ```
//!
//! The audio callbacks never block, lock, log or allocate in the steady
//! state. Disk I/O happens on the worker thread.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod engine;
pub mod error;
pub mod events;
pub mod sink;
pub mod source;

// Convenience re-exports for downstream crates
pub use audio::{AudioBackend, CpalBackend, PortInfo, SimulatedBackend, SimulatedConfig, StreamInfo};
pub use engine::{
    diagnostics::DiagnosticsSnapshot, AudioSession, CaptureTarget, Progress, SessionConfig,
    SessionEnd, SessionReport, Transition,
};
pub use error::{Result, TapedeckError};
pub use events::{FinishedEvent, LevelEvent, SessionMode, SessionStatus, SessionStatusEvent};
pub use sink::{BitDepth, BlockSink, SinkSummary, WavSink};
pub use source::{SampleSource, SignalBuffer, SourceBuffer, SourceCursor, ToneSource, Waveform};
