//! Destinations for captured blocks.
//!
//! Sinks run on the worker thread only; they may block on disk I/O.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Seek, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::buffering::block::AudioBlock;
use crate::error::{Result, TapedeckError};

/// Sample encoding for persisted audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BitDepth {
    Pcm16,
    #[default]
    Pcm24,
    Float32,
}

impl BitDepth {
    pub fn bits(self) -> u16 {
        match self {
            BitDepth::Pcm16 => 16,
            BitDepth::Pcm24 => 24,
            BitDepth::Float32 => 32,
        }
    }

    fn wav_spec(self, sample_rate: u32, channels: u16) -> hound::WavSpec {
        hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: self.bits(),
            sample_format: match self {
                BitDepth::Float32 => hound::SampleFormat::Float,
                _ => hound::SampleFormat::Int,
            },
        }
    }
}

impl fmt::Display for BitDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BitDepth::Pcm16 => "pcm16",
            BitDepth::Pcm24 => "pcm24",
            BitDepth::Float32 => "float32",
        })
    }
}

impl FromStr for BitDepth {
    type Err = TapedeckError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "16" | "pcm16" | "s16" => Ok(BitDepth::Pcm16),
            "24" | "pcm24" | "s24" => Ok(BitDepth::Pcm24),
            "32" | "f32" | "float" | "float32" => Ok(BitDepth::Float32),
            other => Err(TapedeckError::InvalidConfig(format!(
                "unknown bit depth '{other}' (expected 16, 24 or float32)"
            ))),
        }
    }
}

/// What a sink wrote, returned when it is finalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkSummary {
    pub path: Option<PathBuf>,
    pub frames: u64,
    pub channels: u16,
    pub sample_rate: u32,
}

/// Consumer of captured blocks, driven by the capture worker.
pub trait BlockSink: Send {
    /// Append one block. Errors for which
    /// [`TapedeckError::is_transient`] is true are counted and retried on the
    /// next block; anything else ends the recording.
    fn write_block(&mut self, block: &AudioBlock) -> Result<()>;

    fn frames_written(&self) -> u64;

    /// Flush and close. Called exactly once, also after a fatal write error.
    fn finalize(self: Box<Self>) -> Result<SinkSummary>;
}

/// Streams interleaved samples into a WAV container as they arrive.
///
/// A block is either appended whole or, if the writer fails on its first
/// sample, not at all. A failure after part of a block went out is reported
/// as [`TapedeckError::PartialWrite`], which is never transient: the frame
/// alignment of everything after it would be lost.
pub struct WavSink<W: Write + Seek = BufWriter<File>> {
    writer: hound::WavWriter<W>,
    path: Option<PathBuf>,
    bit_depth: BitDepth,
    channels: u16,
    sample_rate: u32,
    frames: u64,
}

impl WavSink {
    /// Create (or truncate) `path`, creating parent directories as needed.
    pub fn create(
        path: impl AsRef<Path>,
        sample_rate: u32,
        channels: u16,
        bit_depth: BitDepth,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        check_format(sample_rate, channels)?;
        prepare_output_path(&path)?;
        let writer = hound::WavWriter::create(&path, bit_depth.wav_spec(sample_rate, channels))?;
        info!(
            path = %path.display(),
            sample_rate,
            channels,
            bit_depth = %bit_depth,
            "opened WAV file for writing"
        );
        let mut sink = Self::from_writer(writer, sample_rate, channels, bit_depth);
        sink.path = Some(path);
        Ok(sink)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl<W: Write + Seek> WavSink<W> {
    /// Write a WAV stream into any seekable writer (no file path).
    pub fn new(writer: W, sample_rate: u32, channels: u16, bit_depth: BitDepth) -> Result<Self> {
        check_format(sample_rate, channels)?;
        let writer = hound::WavWriter::new(writer, bit_depth.wav_spec(sample_rate, channels))?;
        Ok(Self::from_writer(writer, sample_rate, channels, bit_depth))
    }

    fn from_writer(
        writer: hound::WavWriter<W>,
        sample_rate: u32,
        channels: u16,
        bit_depth: BitDepth,
    ) -> Self {
        Self {
            writer,
            path: None,
            bit_depth,
            channels,
            sample_rate,
            frames: 0,
        }
    }

    /// Append interleaved samples at this sink's channel count. Samples are
    /// clamped to `[-1.0, 1.0]` before scaling.
    pub fn write_interleaved(&mut self, samples: &[f32]) -> Result<()> {
        for (written, &s) in samples.iter().enumerate() {
            let s = s.clamp(-1.0, 1.0);
            let result = match self.bit_depth {
                BitDepth::Pcm16 => self.writer.write_sample((s * i16::MAX as f32) as i16),
                BitDepth::Pcm24 => self.writer.write_sample((s * PCM24_MAX) as i32),
                BitDepth::Float32 => self.writer.write_sample(s),
            };
            if let Err(e) = result {
                return Err(if written == 0 {
                    e.into()
                } else {
                    TapedeckError::PartialWrite {
                        written,
                        total: samples.len(),
                        source: Box::new(e.into()),
                    }
                });
            }
        }
        self.frames += (samples.len() / self.channels as usize) as u64;
        Ok(())
    }

    /// Finalize the WAV header and close the writer.
    pub fn finish(self) -> Result<SinkSummary> {
        let summary = SinkSummary {
            path: self.path,
            frames: self.frames,
            channels: self.channels,
            sample_rate: self.sample_rate,
        };
        self.writer.finalize()?;
        debug!(frames = summary.frames, "WAV file finalized");
        Ok(summary)
    }
}

fn check_format(sample_rate: u32, channels: u16) -> Result<()> {
    if channels == 0 || sample_rate == 0 {
        return Err(TapedeckError::InvalidConfig(format!(
            "cannot record {channels} channels at {sample_rate} Hz"
        )));
    }
    Ok(())
}

const PCM24_MAX: f32 = 8_388_607.0;

impl<W: Write + Seek> fmt::Debug for WavSink<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WavSink")
            .field("path", &self.path)
            .field("bit_depth", &self.bit_depth)
            .field("channels", &self.channels)
            .field("sample_rate", &self.sample_rate)
            .field("frames", &self.frames)
            .finish()
    }
}

impl<W: Write + Seek + Send> BlockSink for WavSink<W> {
    fn write_block(&mut self, block: &AudioBlock) -> Result<()> {
        if block.channels() != self.channels {
            return Err(TapedeckError::InvalidConfig(format!(
                "block has {} channels, file has {}",
                block.channels(),
                self.channels
            )));
        }
        self.write_interleaved(block.samples())
    }

    fn frames_written(&self) -> u64 {
        self.frames
    }

    fn finalize(self: Box<Self>) -> Result<SinkSummary> {
        (*self).finish()
    }
}

/// `recording_YYYYMMDD_HHMMSS.wav` in `dir` (or the working directory).
///
/// If that name is taken (two takes within one second), `_2`, `_3`, ... is
/// appended to the stem until a free name is found.
pub fn default_recording_path(dir: Option<&Path>) -> PathBuf {
    let stem = Local::now().format("recording_%Y%m%d_%H%M%S").to_string();
    let dir = dir.unwrap_or_else(|| Path::new(""));
    let mut path = dir.join(format!("{stem}.wav"));
    let mut n = 2u32;
    while path.exists() {
        path = dir.join(format!("{stem}_{n}.wav"));
        n += 1;
    }
    path
}

/// Create the parent directory of `path` if it has one.
pub fn prepare_output_path(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent)?;
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io::Cursor;
    use std::sync::Arc;

    fn read_ints(path: &Path) -> (hound::WavSpec, Vec<i32>) {
        let mut reader = hound::WavReader::open(path).unwrap();
        let spec = reader.spec();
        let samples = reader.samples::<i32>().map(|s| s.unwrap()).collect();
        (spec, samples)
    }

    #[test]
    fn pcm16_clamps_and_scales() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wav");
        let mut sink = WavSink::create(&path, 48_000, 2, BitDepth::Pcm16).unwrap();
        sink.write_block(&AudioBlock::new(vec![1.5, -1.5, 0.5, 0.0], 2))
            .unwrap();
        let summary = Box::new(sink).finalize().unwrap();
        assert_eq!(summary.frames, 2);

        let (spec, samples) = read_ints(&path);
        assert_eq!(spec.bits_per_sample, 16);
        assert_eq!(spec.channels, 2);
        assert_eq!(samples, [32_767, -32_767, 16_383, 0]);
    }

    #[test]
    fn pcm24_uses_full_scale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.wav");
        let mut sink = WavSink::create(&path, 44_100, 1, BitDepth::Pcm24).unwrap();
        sink.write_interleaved(&[1.0, -1.0, 2.0]).unwrap();
        sink.finish().unwrap();

        let (spec, samples) = read_ints(&path);
        assert_eq!(spec.bits_per_sample, 24);
        assert_eq!(spec.sample_rate, 44_100);
        assert_eq!(samples, [8_388_607, -8_388_607, 8_388_607]);
    }

    #[test]
    fn float32_is_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.wav");
        let mut sink = WavSink::create(&path, 48_000, 1, BitDepth::Float32).unwrap();
        sink.write_interleaved(&[0.25, 3.0]).unwrap();
        sink.finish().unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_format, hound::SampleFormat::Float);
        let samples: Vec<f32> = reader.samples::<f32>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, [0.25, 1.0]);
    }

    #[test]
    fn creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/out.wav");
        let sink = WavSink::create(&path, 48_000, 1, BitDepth::Pcm16).unwrap();
        sink.finish().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn rejects_channel_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink =
            WavSink::create(dir.path().join("d.wav"), 48_000, 2, BitDepth::Pcm16).unwrap();
        let err = sink
            .write_block(&AudioBlock::new(vec![0.0; 3], 1))
            .unwrap_err();
        assert!(!err.is_transient());
    }

    /// In-memory WAV target whose next sample writes can be made to fail.
    #[derive(Clone, Default)]
    struct FlakyWriter {
        data: Arc<Mutex<Cursor<Vec<u8>>>>,
        /// `Some(n)`: the write call after `n` more successful ones fails once.
        fail_after: Arc<Mutex<Option<usize>>>,
    }

    impl FlakyWriter {
        fn fail_after(&self, writes: usize) {
            *self.fail_after.lock() = Some(writes);
        }

        fn samples(&self) -> Vec<i32> {
            let bytes = self.data.lock().get_ref().clone();
            let mut reader = hound::WavReader::new(Cursor::new(bytes)).unwrap();
            reader.samples::<i32>().map(|s| s.unwrap()).collect()
        }
    }

    impl Write for FlakyWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let mut fail = self.fail_after.lock();
            match *fail {
                Some(0) => {
                    *fail = None;
                    return Err(std::io::Error::from(std::io::ErrorKind::TimedOut));
                }
                Some(n) => *fail = Some(n - 1),
                None => {}
            }
            self.data.lock().write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Seek for FlakyWriter {
        fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
            self.data.lock().seek(pos)
        }
    }

    #[test]
    fn failure_on_first_sample_leaves_the_stream_aligned() {
        let target = FlakyWriter::default();
        let mut sink = WavSink::new(target.clone(), 48_000, 2, BitDepth::Pcm16).unwrap();
        let block = AudioBlock::new(vec![0.5, -0.5, 0.25, -0.25], 2);

        sink.write_block(&block).unwrap();
        target.fail_after(0);
        let err = sink.write_block(&block).unwrap_err();
        assert!(err.is_transient(), "{err:?}");
        sink.write_block(&block).unwrap();
        assert_eq!(sink.frames_written(), 4);
        sink.finish().unwrap();

        let one = [16_383, -16_383, 8_191, -8_191];
        assert_eq!(target.samples(), [one, one].concat());
    }

    #[test]
    fn failure_mid_block_is_fatal() {
        let target = FlakyWriter::default();
        let mut sink = WavSink::new(target.clone(), 48_000, 2, BitDepth::Pcm16).unwrap();
        let block = AudioBlock::new(vec![0.5, -0.5, 0.25, -0.25], 2);

        sink.write_block(&block).unwrap();
        // Two samples of the next block go out, the third fails.
        target.fail_after(2);
        let err = sink.write_block(&block).unwrap_err();
        assert!(
            matches!(err, TapedeckError::PartialWrite { written: 2, total: 4, .. }),
            "{err:?}"
        );
        assert!(!err.is_transient());
        assert_eq!(sink.frames_written(), 2);
    }

    #[test]
    fn default_path_skips_names_already_taken() {
        let dir = tempfile::tempdir().unwrap();
        let first = default_recording_path(Some(dir.path()));
        fs::write(&first, b"taken").unwrap();
        let second = default_recording_path(Some(dir.path()));
        assert_ne!(first, second);
        assert!(!second.exists());
        assert_eq!(second.parent(), Some(dir.path()));
        let name = second.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("recording_") && name.ends_with(".wav"), "{name}");
    }

    #[test]
    fn default_path_uses_timestamp_pattern() {
        let path = default_recording_path(None);
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("recording_"));
        assert!(name.ends_with(".wav"));
        // recording_ + YYYYMMDD + _ + HHMMSS + .wav
        assert_eq!(name.len(), "recording_".len() + 8 + 1 + 6 + ".wav".len());
    }

    #[test]
    fn bit_depth_parses_and_serializes() {
        assert_eq!("16".parse::<BitDepth>().unwrap(), BitDepth::Pcm16);
        assert_eq!("float".parse::<BitDepth>().unwrap(), BitDepth::Float32);
        assert!("12".parse::<BitDepth>().is_err());
        assert_eq!(
            serde_json::to_string(&BitDepth::Pcm24).unwrap(),
            r#""pcm24""#
        );
    }
}
