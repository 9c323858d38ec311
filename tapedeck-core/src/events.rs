//! Session event types broadcast to subscribers (CLI, tests, UIs).
//!
//! | Event | Subscribe with |
//! |-------|----------------|
//! | `SessionStatusEvent` | `AudioSession::subscribe_status` |
//! | `LevelEvent` | `AudioSession::subscribe_levels` |
//! | `FinishedEvent` | `AudioSession::subscribe_finished` |
//!
//! All types serialize with camelCase fields so they can be logged or
//! forwarded as JSON unchanged.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Status events
// ---------------------------------------------------------------------------

/// Lifecycle state of an [`AudioSession`](crate::engine::AudioSession).
///
/// ```text
/// Idle ──start──► Active ──stop / end-of-stream / fatal error──► Stopping ──join──► Idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// No stream open, no worker thread.
    Idle,
    /// Stream open and callback running; worker thread alive.
    Active,
    /// Stop requested; worker draining before it is joined.
    Stopping,
}

/// Whether a session records or plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Capture,
    Playback,
}

/// Emitted whenever the session changes state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusEvent {
    pub status: SessionStatus,
    pub mode: Option<SessionMode>,
    /// Optional human-readable detail (e.g. error message, shutdown reason).
    pub detail: Option<String>,
}

// ---------------------------------------------------------------------------
// Level events
// ---------------------------------------------------------------------------

/// Input level of a captured block, published every N written blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Root-mean-square level of the block.
    pub rms: f32,
    /// Absolute peak of the block.
    pub peak: f32,
}

// ---------------------------------------------------------------------------
// Playback completion
// ---------------------------------------------------------------------------

/// Emitted exactly once when a playback source runs out.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishedEvent {
    /// Source frames written to the device.
    pub frames_played: u64,
    /// Zero frames written because the source was exhausted or paused.
    pub silence_frames: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_event_serializes_with_lowercase_status() {
        let event = SessionStatusEvent {
            status: SessionStatus::Stopping,
            mode: Some(SessionMode::Capture),
            detail: Some("draining".into()),
        };

        let json = serde_json::to_value(&event).expect("serialize status event");
        assert_eq!(json["status"], "stopping");
        assert_eq!(json["mode"], "capture");
        assert_eq!(json["detail"], "draining");

        let round_trip: SessionStatusEvent =
            serde_json::from_value(json).expect("deserialize status event");
        assert_eq!(round_trip.status, SessionStatus::Stopping);
        assert_eq!(round_trip.mode, Some(SessionMode::Capture));
    }

    #[test]
    fn status_rejects_non_lowercase_values() {
        let err = serde_json::from_str::<SessionStatus>(r#""Active""#);
        assert!(err.is_err(), "expected invalid casing to fail");
    }

    #[test]
    fn finished_event_uses_camel_case_fields() {
        let event = FinishedEvent {
            frames_played: 480,
            silence_frames: 32,
        };
        let json = serde_json::to_value(&event).expect("serialize finished event");
        assert_eq!(json["framesPlayed"], 480);
        assert_eq!(json["silenceFrames"], 32);
    }

    #[test]
    fn level_event_serializes_numbers() {
        let event = LevelEvent {
            seq: 3,
            rms: 0.18,
            peak: 0.5,
        };
        let json = serde_json::to_value(&event).expect("serialize level event");
        assert_eq!(json["seq"], 3);
        let rms = json["rms"].as_f64().expect("rms should serialize as number");
        assert!((rms - 0.18).abs() < 1e-5);
    }
}
