//! Owned audio block handed from the capture callback to the writer thread.

/// A contiguous block of interleaved f32 frames.
///
/// Blocks are recycled through the block pool, so `samples` keeps its
/// capacity between uses and the real-time thread only reallocates when the
/// device block size grows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioBlock {
    samples: Vec<f32>,
    channels: u16,
}

impl AudioBlock {
    pub fn new(samples: Vec<f32>, channels: u16) -> Self {
        debug_assert!(channels > 0);
        debug_assert_eq!(samples.len() % channels.max(1) as usize, 0);
        Self { samples, channels }
    }

    /// An empty block with room for `frames` frames of `channels` channels.
    pub fn with_capacity(frames: usize, channels: u16) -> Self {
        Self {
            samples: Vec::with_capacity(frames * channels as usize),
            channels,
        }
    }

    /// Overwrite this block with `input`, an interleaved buffer of
    /// `input_channels` channels, scaled by `gain`.
    ///
    /// Recorded channels beyond the input's channel count repeat the input's
    /// last channel; surplus input channels are ignored.
    pub fn copy_from_interleaved(
        &mut self,
        input: &[f32],
        input_channels: u16,
        channels: u16,
        gain: f32,
    ) {
        let in_ch = input_channels.max(1) as usize;
        let out_ch = channels.max(1) as usize;
        let frames = input.len() / in_ch;

        self.channels = channels.max(1);
        self.samples.clear();
        if in_ch == out_ch && gain == 1.0 {
            self.samples.extend_from_slice(&input[..frames * in_ch]);
            return;
        }
        for frame in input.chunks_exact(in_ch) {
            for c in 0..out_ch {
                self.samples.push(frame[c.min(in_ch - 1)] * gain);
            }
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of frames (samples per channel) in this block.
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Root-mean-square and absolute peak over all samples.
    pub fn levels(&self) -> (f32, f32) {
        if self.samples.is_empty() {
            return (0.0, 0.0);
        }
        let mut sum_sq = 0f32;
        let mut peak = 0f32;
        for s in &self.samples {
            sum_sq += s * s;
            peak = peak.max(s.abs());
        }
        ((sum_sq / self.samples.len() as f32).sqrt(), peak)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn copy_keeps_interleaving_when_channels_match() {
        let mut block = AudioBlock::with_capacity(4, 2);
        block.copy_from_interleaved(&[0.1, -0.1, 0.2, -0.2], 2, 2, 1.0);
        assert_eq!(block.frames(), 2);
        assert_eq!(block.samples(), &[0.1, -0.1, 0.2, -0.2]);
    }

    #[test]
    fn copy_duplicates_last_channel_for_extra_outputs() {
        let mut block = AudioBlock::default();
        block.copy_from_interleaved(&[0.5, 0.25], 1, 2, 1.0);
        assert_eq!(block.channels(), 2);
        assert_eq!(block.samples(), &[0.5, 0.5, 0.25, 0.25]);
    }

    #[test]
    fn copy_drops_surplus_input_channels_and_applies_gain() {
        let mut block = AudioBlock::default();
        block.copy_from_interleaved(&[1.0, 9.0, 9.0, -1.0, 9.0, 9.0], 3, 1, 0.5);
        assert_eq!(block.samples(), &[0.5, -0.5]);
    }

    #[test]
    fn copy_ignores_trailing_partial_frame() {
        let mut block = AudioBlock::default();
        block.copy_from_interleaved(&[0.1, 0.2, 0.3], 2, 2, 1.0);
        assert_eq!(block.frames(), 1);
    }

    #[test]
    fn levels_of_square_wave() {
        let block = AudioBlock::new(vec![0.5, -0.5, 0.5, -0.5], 1);
        let (rms, peak) = block.levels();
        assert_relative_eq!(rms, 0.5, epsilon = 1e-6);
        assert_relative_eq!(peak, 0.5, epsilon = 1e-6);
        assert_eq!(AudioBlock::default().levels(), (0.0, 0.0));
    }
}
