//! State owned by the interactive loop.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tapedeck_core::{
    AudioSession, CaptureTarget, LevelEvent, SampleSource, SourceBuffer, SourceCursor,
    ToneSource, Waveform,
};

use crate::settings::AppSettings;

/// What `start` does in this run.
#[derive(Debug, Clone)]
pub enum Plan {
    Record {
        /// Used for the first take; later takes are numbered after it, or
        /// timestamped when unset.
        output: Option<PathBuf>,
    },
    PlayFile {
        path: PathBuf,
        buffer: Arc<SourceBuffer>,
        looping: bool,
    },
    Tone {
        waveform: Waveform,
        frequency: f32,
        amplitude: f32,
        secs: Option<f64>,
    },
}

impl Plan {
    pub fn is_playback(&self) -> bool {
        !matches!(self, Plan::Record { .. })
    }

    /// Fresh source for one playback take, positioned at the start.
    pub fn source(&self, sample_rate: u32) -> Option<Box<dyn SampleSource>> {
        match self {
            Plan::Record { .. } => None,
            Plan::PlayFile {
                buffer, looping, ..
            } => Some(Box::new(
                SourceCursor::new(Arc::clone(buffer)).looping(*looping),
            )),
            Plan::Tone {
                waveform,
                frequency,
                amplitude,
                secs,
            } => {
                let tone = ToneSource::new(*waveform, *frequency, *amplitude, sample_rate);
                Some(Box::new(match secs {
                    Some(secs) => tone.with_duration(*secs),
                    None => tone,
                }))
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Plan::Record { output: Some(path) } => format!("record to {}", path.display()),
            Plan::Record { output: None } => "record to a timestamped file".into(),
            Plan::PlayFile { path, looping, .. } => format!(
                "play {}{}",
                path.display(),
                if *looping { " (looping)" } else { "" }
            ),
            Plan::Tone {
                waveform,
                frequency,
                amplitude,
                ..
            } => format!("{waveform} tone {frequency:.1} Hz at {amplitude:.2}"),
        }
    }
}

/// Everything the command loop needs between keystrokes.
pub struct AppState {
    pub session: AudioSession,
    pub plan: Plan,
    pub settings: AppSettings,
    pub settings_path: PathBuf,
    /// Starts performed so far; the first record take uses the explicit path.
    pub takes: usize,
    pub last_level: Option<LevelEvent>,
}

impl AppState {
    pub fn new(
        session: AudioSession,
        plan: Plan,
        settings: AppSettings,
        settings_path: PathBuf,
    ) -> Self {
        Self {
            session,
            plan,
            settings,
            settings_path,
            takes: 0,
            last_level: None,
        }
    }

    pub fn capture_target(&self) -> CaptureTarget {
        match &self.plan {
            Plan::Record { output } if self.takes == 0 => CaptureTarget::File(output.clone()),
            Plan::Record {
                output: Some(first),
            } => CaptureTarget::File(Some(numbered_take(first, self.takes + 1))),
            _ => CaptureTarget::File(None),
        }
    }

    pub fn playback_source(&self) -> Result<Box<dyn SampleSource>> {
        self.plan
            .source(self.source_rate())
            .ok_or_else(|| anyhow::anyhow!("this run records; it has nothing to play"))
    }

    /// Tones are rendered at the buffer rate of the file plan, or 48 kHz; the
    /// session re-renders them at the device rate anyway.
    fn source_rate(&self) -> u32 {
        match &self.plan {
            Plan::PlayFile { buffer, .. } => buffer.sample_rate(),
            _ => 48_000,
        }
    }
}

/// `take.wav` → `take_2.wav` for repeated takes in one run.
fn numbered_take(first: &std::path::Path, n: usize) -> PathBuf {
    let stem = first
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "take".into());
    let ext = first
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "wav".into());
    first.with_file_name(format!("{stem}_{n}.{ext}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn repeated_takes_get_numbered_names() {
        assert_eq!(
            numbered_take(Path::new("/tmp/take.wav"), 2),
            Path::new("/tmp/take_2.wav")
        );
        assert_eq!(numbered_take(Path::new("session"), 3), Path::new("session_3.wav"));
    }

    #[test]
    fn tone_plan_builds_a_bounded_generated_source() {
        let plan = Plan::Tone {
            waveform: Waveform::Sine,
            frequency: 440.0,
            amplitude: 0.3,
            secs: Some(0.5),
        };
        assert!(plan.is_playback());
        let source = plan.source(48_000).unwrap();
        assert!(source.is_generated());
        assert_eq!(source.len_frames(), Some(24_000));
        assert!(Plan::Record { output: None }.source(48_000).is_none());
    }
}
