//! Playback path: the output callback owns the source; the worker only waits
//! for end-of-stream or a stop request.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::diagnostics::SessionDiagnostics;
use super::{SessionControl, SessionEnd};
use crate::events::FinishedEvent;
use crate::source::SampleSource;

/// One-slot channel the callback uses to report end-of-stream.
pub fn end_of_stream_channel() -> (Sender<()>, Receiver<()>) {
    crossbeam_channel::bounded(1)
}

/// Runs on the device thread once per output block.
///
/// Always writes every requested frame: source audio first, then zeros. While
/// paused or stopping it writes silence and leaves the source position alone.
pub struct PlaybackCallback {
    source: Box<dyn SampleSource>,
    channels: u16,
    control: Arc<SessionControl>,
    diagnostics: Arc<SessionDiagnostics>,
    eos_tx: Sender<()>,
    eos_sent: bool,
}

impl PlaybackCallback {
    pub fn new(
        source: Box<dyn SampleSource>,
        channels: u16,
        control: Arc<SessionControl>,
        diagnostics: Arc<SessionDiagnostics>,
        eos_tx: Sender<()>,
    ) -> Self {
        Self {
            source,
            channels: channels.max(1),
            control,
            diagnostics,
            eos_tx,
            eos_sent: false,
        }
    }

    /// Fill `out`; returns the number of frames taken from the source.
    pub fn process(&mut self, out: &mut [f32]) -> usize {
        let ch = self.channels as usize;
        let frames = out.len() / ch;

        if self.control.is_halted() {
            out.fill(0.0);
            self.diagnostics
                .silence_frames
                .fetch_add(frames as u64, Ordering::Relaxed);
            return 0;
        }

        let written = if self.eos_sent {
            0
        } else {
            self.source.read_frames(out, self.channels).min(frames)
        };
        out[written * ch..].fill(0.0);

        self.diagnostics
            .frames_played
            .fetch_add(written as u64, Ordering::Relaxed);
        self.diagnostics
            .silence_frames
            .fetch_add((frames - written) as u64, Ordering::Relaxed);

        if !self.eos_sent && (written < frames || self.source.is_exhausted()) {
            self.eos_sent = true;
            let _ = self.eos_tx.try_send(());
        }
        written
    }

    pub fn end_of_stream_sent(&self) -> bool {
        self.eos_sent
    }
}

/// Wait until the source runs out or someone requests a stop.
///
/// Publishes exactly one [`FinishedEvent`] when the source runs out.
pub fn wait_for_end(
    eos_rx: &Receiver<()>,
    control: &SessionControl,
    diagnostics: &SessionDiagnostics,
    finished_tx: &broadcast::Sender<FinishedEvent>,
    poll: Duration,
) {
    info!("playback worker started");
    loop {
        if control.is_stopped() {
            debug!("playback stop observed");
            return;
        }
        match eos_rx.recv_timeout(poll) {
            Ok(()) => {
                control.request_stop(SessionEnd::EndOfStream);
                let snap = diagnostics.snapshot();
                info!(
                    frames_played = snap.frames_played,
                    silence_frames = snap.silence_frames,
                    "playback source finished"
                );
                let _ = finished_tx.send(FinishedEvent {
                    frames_played: snap.frames_played,
                    silence_frames: snap.silence_frames,
                });
                return;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}
