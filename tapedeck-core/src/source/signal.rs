//! Waveform generation: a real-time tone source and an owned offline buffer.

use std::f64::consts::TAU;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{SampleSource, SourceBuffer};
use crate::error::{Result, TapedeckError};
use crate::sink::{BitDepth, SinkSummary, WavSink};

pub const DEFAULT_TONE_HZ: f32 = 440.0;
pub const DEFAULT_TONE_AMPLITUDE: f32 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Waveform {
    #[default]
    Sine,
    Square,
    Triangle,
    Saw,
}

impl Waveform {
    /// Value at `phase` cycles (any real number), in `[-1.0, 1.0]`.
    pub fn sample(self, phase: f64) -> f32 {
        let p = phase - phase.floor();
        let v = match self {
            Waveform::Sine => (TAU * p).sin(),
            Waveform::Square => {
                if p < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
            Waveform::Triangle => 4.0 * (p - (p + 0.5).floor()).abs() - 1.0,
            Waveform::Saw => 2.0 * (p - (p + 0.5).floor()),
        };
        v as f32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Waveform::Sine => "sine",
            Waveform::Square => "square",
            Waveform::Triangle => "triangle",
            Waveform::Saw => "saw",
        }
    }
}

impl fmt::Display for Waveform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Waveform {
    type Err = TapedeckError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sine" | "sin" => Ok(Waveform::Sine),
            "square" | "sq" => Ok(Waveform::Square),
            "triangle" | "tri" => Ok(Waveform::Triangle),
            "saw" | "sawtooth" => Ok(Waveform::Saw),
            other => Err(TapedeckError::InvalidConfig(format!(
                "unknown waveform '{other}' (expected sine, square, triangle or saw)"
            ))),
        }
    }
}

/// Phase-continuous periodic generator. Endless unless given a duration.
#[derive(Debug, Clone)]
pub struct ToneSource {
    waveform: Waveform,
    frequency: f32,
    amplitude: f32,
    sample_rate: u32,
    channels: u16,
    phase: f64,
    position: u64,
    limit: Option<u64>,
}

impl ToneSource {
    pub fn new(waveform: Waveform, frequency: f32, amplitude: f32, sample_rate: u32) -> Self {
        Self {
            waveform,
            frequency,
            amplitude: amplitude.clamp(0.0, 1.0),
            sample_rate: sample_rate.max(1),
            channels: 1,
            phase: 0.0,
            position: 0,
            limit: None,
        }
    }

    /// Stop after `secs` seconds of audio.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.limit = Some((secs.max(0.0) * self.sample_rate as f64).round() as u64);
        self
    }

    pub fn waveform(&self) -> Waveform {
        self.waveform
    }

    pub fn frequency(&self) -> f32 {
        self.frequency
    }

    fn step(&self) -> f64 {
        self.frequency as f64 / self.sample_rate as f64
    }
}

impl Default for ToneSource {
    fn default() -> Self {
        Self::new(Waveform::Sine, DEFAULT_TONE_HZ, DEFAULT_TONE_AMPLITUDE, 48_000)
    }
}

impl SampleSource for ToneSource {
    fn channels(&self) -> u16 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read_frames(&mut self, out: &mut [f32], out_channels: u16) -> usize {
        let out_ch = out_channels.max(1) as usize;
        let mut frames = out.len() / out_ch;
        if let Some(limit) = self.limit {
            frames = frames.min(limit.saturating_sub(self.position) as usize);
        }
        let step = self.step();
        for frame in out[..frames * out_ch].chunks_exact_mut(out_ch) {
            frame.fill(self.amplitude * self.waveform.sample(self.phase));
            self.phase += step;
            if self.phase >= 1.0 {
                self.phase -= self.phase.floor();
            }
        }
        self.position += frames as u64;
        frames
    }

    fn position_frames(&self) -> u64 {
        self.position
    }

    fn len_frames(&self) -> Option<u64> {
        self.limit
    }

    fn rewind(&mut self) {
        self.phase = 0.0;
        self.position = 0;
    }

    fn is_exhausted(&self) -> bool {
        self.limit.is_some_and(|limit| self.position >= limit)
    }

    fn is_generated(&self) -> bool {
        true
    }

    fn retarget_rate(&mut self, rate: u32) -> Result<()> {
        if rate == 0 {
            return Err(TapedeckError::InvalidConfig("zero sample rate".into()));
        }
        let old = self.sample_rate as u64;
        self.limit = self.limit.map(|l| l * rate as u64 / old);
        self.position = self.position * rate as u64 / old;
        self.sample_rate = rate;
        Ok(())
    }

    fn describe(&self) -> String {
        format!(
            "{} {:.1} Hz amp {:.2} @ {} Hz",
            self.waveform, self.frequency, self.amplitude, self.sample_rate
        )
    }
}

/// Owned accumulator of generated audio.
///
/// Each step consumes the buffer and returns it extended, so a sequence reads
/// as a chain:
///
/// ```ignore
/// let buf = SignalBuffer::new(48_000, 1)
///     .with_tone(Waveform::Sine, 440.0, 0.3, 1.0)
///     .with_silence(250)
///     .with_tone(Waveform::Square, 220.0, 0.2, 0.5);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct SignalBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
}

impl SignalBuffer {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            samples: Vec::new(),
            sample_rate: sample_rate.max(1),
            channels: channels.max(1),
        }
    }

    /// Append `secs` seconds of `waveform`, starting at phase zero.
    pub fn with_tone(mut self, waveform: Waveform, freq: f32, amplitude: f32, secs: f64) -> Self {
        let frames = (secs.max(0.0) * self.sample_rate as f64).round() as usize;
        let step = freq as f64 / self.sample_rate as f64;
        let amplitude = amplitude.clamp(0.0, 1.0);
        self.samples.reserve(frames * self.channels as usize);
        for i in 0..frames {
            let v = amplitude * waveform.sample(i as f64 * step);
            for _ in 0..self.channels {
                self.samples.push(v);
            }
        }
        self
    }

    /// Append `ms` milliseconds of silence.
    pub fn with_silence(mut self, ms: u64) -> Self {
        let frames = (ms * self.sample_rate as u64 / 1000) as usize;
        self.samples
            .resize(self.samples.len() + frames * self.channels as usize, 0.0);
        self
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn into_source_buffer(self) -> Result<SourceBuffer> {
        SourceBuffer::new(self.samples, self.channels, self.sample_rate)
    }

    pub fn write_wav(&self, path: impl AsRef<Path>, bit_depth: BitDepth) -> Result<SinkSummary> {
        let mut sink = WavSink::create(path, self.sample_rate, self.channels, bit_depth)?;
        sink.write_interleaved(&self.samples)?;
        sink.finish()
    }
}
