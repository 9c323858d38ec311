//! Playback sources.
//!
//! A [`SampleSource`] is owned by the playback callback for the lifetime of a
//! session. `read_frames` runs on the real-time thread and must not allocate,
//! lock or log; everything else runs on the worker thread before the stream
//! opens.

pub mod signal;

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::audio::resample::resample_interleaved;
use crate::error::{Result, TapedeckError};

pub use signal::{SignalBuffer, ToneSource, Waveform};

/// Something the playback callback can pull interleaved f32 frames from.
pub trait SampleSource: Send + 'static {
    fn channels(&self) -> u16;

    fn sample_rate(&self) -> u32;

    /// Fill up to `out.len() / out_channels` frames of `out`, interleaved at
    /// `out_channels`. Returns the number of frames written; fewer than
    /// requested means the source ran out. Frames past the return value are
    /// left untouched.
    fn read_frames(&mut self, out: &mut [f32], out_channels: u16) -> usize;

    /// Frames consumed since the last rewind.
    fn position_frames(&self) -> u64;

    /// Total frames, or `None` for endless sources.
    fn len_frames(&self) -> Option<u64>;

    fn rewind(&mut self);

    /// No further frames will be produced.
    fn is_exhausted(&self) -> bool;

    /// Synthesised sources can be re-rendered at any rate for free.
    fn is_generated(&self) -> bool {
        false
    }

    /// Make the source produce audio at `rate` Hz. Called off the real-time
    /// thread, before the stream opens.
    fn retarget_rate(&mut self, rate: u32) -> Result<()>;

    /// Short human-readable description for logs and the `info` command.
    fn describe(&self) -> String;
}

/// Interleaved samples held fully in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceBuffer {
    samples: Vec<f32>,
    channels: u16,
    sample_rate: u32,
}

impl SourceBuffer {
    pub fn new(samples: Vec<f32>, channels: u16, sample_rate: u32) -> Result<Self> {
        if channels == 0 {
            return Err(TapedeckError::InvalidSource("zero channels".into()));
        }
        if sample_rate == 0 {
            return Err(TapedeckError::InvalidSource("zero sample rate".into()));
        }
        if samples.len() % channels as usize != 0 {
            return Err(TapedeckError::InvalidSource(format!(
                "{} samples is not a whole number of {channels}-channel frames",
                samples.len()
            )));
        }
        Ok(Self {
            samples,
            channels,
            sample_rate,
        })
    }

    /// Read a whole WAV file. Integer PCM of any width is normalised to
    /// `[-1.0, 1.0)`; float data is taken as-is.
    pub fn from_wav(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let reader = hound::WavReader::open(path)
            .map_err(|e| TapedeckError::InvalidSource(format!("{}: {e}", path.display())))?;
        let spec = reader.spec();

        let samples: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<std::result::Result<_, _>>()?,
            hound::SampleFormat::Int => {
                let scale = 1.0 / (1i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 * scale))
                    .collect::<std::result::Result<_, _>>()?
            }
        };

        let buffer = Self::new(samples, spec.channels, spec.sample_rate)?;
        info!(
            path = %path.display(),
            channels = spec.channels,
            sample_rate = spec.sample_rate,
            bits = spec.bits_per_sample,
            frames = buffer.len_frames(),
            "loaded WAV source"
        );
        Ok(buffer)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len_frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn duration_secs(&self) -> f64 {
        self.len_frames() as f64 / self.sample_rate as f64
    }

    /// A copy converted to `rate` Hz.
    pub fn resampled(&self, rate: u32) -> Result<Self> {
        let samples = resample_interleaved(&self.samples, self.channels, self.sample_rate, rate)?;
        Self::new(samples, self.channels, rate)
    }
}

/// Read position into a shared [`SourceBuffer`].
///
/// The position only moves forward; at the end it wraps when looping and
/// otherwise stays put so the callback emits silence.
#[derive(Debug, Clone)]
pub struct SourceCursor {
    buffer: Arc<SourceBuffer>,
    position: usize,
    looping: bool,
}

impl SourceCursor {
    pub fn new(buffer: impl Into<Arc<SourceBuffer>>) -> Self {
        Self {
            buffer: buffer.into(),
            position: 0,
            looping: false,
        }
    }

    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    pub fn buffer(&self) -> &SourceBuffer {
        &self.buffer
    }
}

impl SampleSource for SourceCursor {
    fn channels(&self) -> u16 {
        self.buffer.channels
    }

    fn sample_rate(&self) -> u32 {
        self.buffer.sample_rate
    }

    fn read_frames(&mut self, out: &mut [f32], out_channels: u16) -> usize {
        let out_ch = out_channels.max(1) as usize;
        let src_ch = self.buffer.channels as usize;
        let total = self.buffer.len_frames();
        let want = out.len() / out_ch;
        let mut written = 0;

        while written < want {
            if self.position >= total {
                if self.looping && total > 0 {
                    self.position = 0;
                } else {
                    break;
                }
            }
            let n = (want - written).min(total - self.position);
            let src = &self.buffer.samples[self.position * src_ch..(self.position + n) * src_ch];
            let dst = &mut out[written * out_ch..(written + n) * out_ch];
            for (src_frame, dst_frame) in src.chunks_exact(src_ch).zip(dst.chunks_exact_mut(out_ch)) {
                for (c, sample) in dst_frame.iter_mut().enumerate() {
                    *sample = src_frame[c.min(src_ch - 1)];
                }
            }
            written += n;
            self.position += n;
        }
        written
    }

    fn position_frames(&self) -> u64 {
        self.position as u64
    }

    fn len_frames(&self) -> Option<u64> {
        Some(self.buffer.len_frames() as u64)
    }

    fn rewind(&mut self) {
        self.position = 0;
    }

    fn is_exhausted(&self) -> bool {
        !self.looping && self.position >= self.buffer.len_frames()
    }

    fn retarget_rate(&mut self, rate: u32) -> Result<()> {
        if rate == self.buffer.sample_rate {
            return Ok(());
        }
        let from = self.buffer.sample_rate;
        let converted = self.buffer.resampled(rate)?;
        self.position = (self.position as u64 * rate as u64 / from as u64) as usize;
        self.buffer = Arc::new(converted);
        Ok(())
    }

    fn describe(&self) -> String {
        format!(
            "buffer {} ch @ {} Hz, {:.2}s{}",
            self.buffer.channels,
            self.buffer.sample_rate,
            self.buffer.duration_secs(),
            if self.looping { ", looping" } else { "" }
        )
    }
}
