//! Offline sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! ## Design
//!
//! Playback sources are converted to the device rate once, before the stream
//! opens, never on the real-time thread. Input is interleaved; rubato works on
//! planar channels, so samples are split per channel, converted in fixed-size
//! chunks, flushed, trimmed by the resampler's output delay and re-interleaved.
//!
//! When `from_rate == to_rate` the input is returned unchanged and no rubato
//! session is created at all.
//!
//! ## Usage
//!
//! ```ignore
//! let out = resample_interleaved(&samples, 2, 44_100, 48_000)?;
//! ```

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::info;

use crate::error::{Result, TapedeckError};

/// Input frames per rubato call.
const CHUNK_FRAMES: usize = 1024;

/// Convert interleaved `samples` with `channels` channels from `from_rate` to
/// `to_rate`. The output holds `round(frames * to_rate / from_rate)` frames.
///
/// # Errors
/// Returns `TapedeckError::Resample` if rubato fails to initialise or process.
pub fn resample_interleaved(
    samples: &[f32],
    channels: u16,
    from_rate: u32,
    to_rate: u32,
) -> Result<Vec<f32>> {
    if from_rate == 0 || to_rate == 0 {
        return Err(TapedeckError::Resample(format!(
            "invalid rates from={from_rate} to={to_rate}"
        )));
    }
    let ch = channels.max(1) as usize;
    let frames = samples.len() / ch;
    if from_rate == to_rate || frames == 0 {
        return Ok(samples[..frames * ch].to_vec());
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let mut resampler = FastFixedIn::<f32>::new(
        ratio,
        1.0, // fixed ratio
        PolynomialDegree::Cubic,
        CHUNK_FRAMES,
        ch,
    )
    .map_err(|e| TapedeckError::Resample(format!("resampler init: {e}")))?;

    let planar: Vec<Vec<f32>> = (0..ch)
        .map(|c| samples.iter().skip(c).step_by(ch).take(frames).copied().collect())
        .collect();

    let delay = resampler.output_delay();
    let expected = (frames as f64 * ratio).round() as usize;
    let mut out: Vec<Vec<f32>> = vec![Vec::with_capacity(expected + delay); ch];
    let mut scratch = vec![vec![0f32; resampler.output_frames_max()]; ch];

    let mut pos = 0;
    while frames - pos >= resampler.input_frames_next() {
        let need = resampler.input_frames_next();
        let chunk: Vec<&[f32]> = planar.iter().map(|p| &p[pos..pos + need]).collect();
        let (consumed, produced) = resampler
            .process_into_buffer(&chunk, &mut scratch, None)
            .map_err(|e| TapedeckError::Resample(e.to_string()))?;
        append(&mut out, &scratch, produced);
        pos += consumed;
    }

    if pos < frames {
        let tail: Vec<&[f32]> = planar.iter().map(|p| &p[pos..]).collect();
        let (_, produced) = resampler
            .process_partial_into_buffer(Some(tail.as_slice()), &mut scratch, None)
            .map_err(|e| TapedeckError::Resample(e.to_string()))?;
        append(&mut out, &scratch, produced);
    }

    // Flush the delay line with silence until every expected frame is out.
    let mut flushes = 0;
    while out[0].len() < expected + delay && flushes < 16 {
        let (_, produced) = resampler
            .process_partial_into_buffer(None::<&[Vec<f32>]>, &mut scratch, None)
            .map_err(|e| TapedeckError::Resample(e.to_string()))?;
        if produced == 0 {
            break;
        }
        append(&mut out, &scratch, produced);
        flushes += 1;
    }

    let available = out[0].len().saturating_sub(delay).min(expected);
    let mut interleaved = Vec::with_capacity(available * ch);
    for i in delay..delay + available {
        for channel in &out {
            interleaved.push(channel[i]);
        }
    }

    info!(
        from_rate,
        to_rate,
        channels,
        frames_in = frames,
        frames_out = available,
        "resampled source"
    );
    Ok(interleaved)
}

fn append(out: &mut [Vec<f32>], scratch: &[Vec<f32>], produced: usize) {
    for (dst, src) in out.iter_mut().zip(scratch) {
        dst.extend_from_slice(&src[..produced]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_identity() {
        let samples: Vec<f32> = (0..480).map(|i| i as f32 * 0.001).collect();
        let out = resample_interleaved(&samples, 2, 48_000, 48_000).unwrap();
        assert_eq!(out, samples);
    }

    #[test]
    fn ratio_44k1_to_48k_correct_length() {
        let frames = 44_100;
        let samples = vec![0.0f32; frames * 2];
        let out = resample_interleaved(&samples, 2, 44_100, 48_000).unwrap();
        assert_eq!(out.len(), 48_000 * 2);
    }

    #[test]
    fn downsampling_short_input_is_flushed() {
        // Shorter than one rubato chunk: everything comes from the partial
        // call and the flush.
        let samples = vec![0.0f32; 500];
        let out = resample_interleaved(&samples, 1, 48_000, 16_000).unwrap();
        let expected = (500.0f64 / 3.0).round() as usize;
        assert!(
            (out.len() as isize - expected as isize).unsigned_abs() <= 1,
            "output len={} expected≈{}",
            out.len(),
            expected
        );
    }

    #[test]
    fn channels_stay_separated() {
        // Left is a constant 0.5, right a constant -0.5.
        let frames = 4_000;
        let samples: Vec<f32> = (0..frames).flat_map(|_| [0.5f32, -0.5]).collect();
        let out = resample_interleaved(&samples, 2, 32_000, 48_000).unwrap();
        let mid = (out.len() / 2) & !1;
        assert!((out[mid] - 0.5).abs() < 0.01, "left={}", out[mid]);
        assert!((out[mid + 1] + 0.5).abs() < 0.01, "right={}", out[mid + 1]);
    }

    #[test]
    fn zero_rate_is_rejected() {
        assert!(resample_interleaved(&[0.0; 4], 1, 0, 48_000).is_err());
    }
}
