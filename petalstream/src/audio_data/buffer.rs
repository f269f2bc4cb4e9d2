use crate::error::{PetalStreamError, Result};

/// Fixed-size planar block of audio: `num_channels` channels of `num_frames` samples.
///
/// Buffers are allocated once and recycled between the decode and audio sides,
/// so nothing here reallocates after construction.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AudioBuffer {
    channels: Vec<Vec<f32>>,
    num_frames: usize,
}

impl AudioBuffer {
    /// Creates a silent buffer.
    pub fn new(num_channels: usize, num_frames: usize) -> Self {
        Self {
            channels: vec![vec![0.0; num_frames]; num_channels],
            num_frames,
        }
    }

    /// Wraps existing channel data. All channels must share one length.
    pub fn from_channels(channels: Vec<Vec<f32>>) -> Result<Self> {
        let num_frames = channels.first().map_or(0, Vec::len);
        if channels.iter().any(|c| c.len() != num_frames) {
            return Err(PetalStreamError::AudioFormat(
                "All channels of an audio buffer must have the same length".into(),
            ));
        }
        Ok(Self {
            channels,
            num_frames,
        })
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn num_frames(&self) -> usize {
        self.num_frames
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index]
    }

    pub fn channel_mut(&mut self, index: usize) -> &mut [f32] {
        &mut self.channels[index]
    }

    pub fn channels(&self) -> &[Vec<f32>] {
        &self.channels
    }

    /// Zeroes every sample.
    pub fn clear(&mut self) {
        for channel in &mut self.channels {
            channel.fill(0.0);
        }
    }

    /// Copies samples from a buffer of the same shape.
    pub fn copy_from(&mut self, other: &AudioBuffer) {
        for (dst, src) in self.channels.iter_mut().zip(other.channels.iter()) {
            let n = dst.len().min(src.len());
            dst[..n].copy_from_slice(&src[..n]);
        }
    }

    /// True if every sample is exactly zero.
    pub fn is_silent(&self) -> bool {
        self.channels.iter().all(|c| c.iter().all(|s| *s == 0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_buffer_is_silent() {
        let buffer = AudioBuffer::new(2, 16);
        assert_eq!(buffer.num_channels(), 2);
        assert_eq!(buffer.num_frames(), 16);
        assert!(buffer.is_silent());
    }

    #[test]
    fn test_from_channels_rejects_ragged_input() {
        assert!(AudioBuffer::from_channels(vec![vec![0.0; 4], vec![0.0; 3]]).is_err());
        let buffer = AudioBuffer::from_channels(vec![vec![1.0; 4], vec![2.0; 4]]).unwrap();
        assert_eq!(buffer.channel(1), &[2.0; 4]);
    }

    #[test]
    fn test_clear() {
        let mut buffer = AudioBuffer::from_channels(vec![vec![0.5; 8]]).unwrap();
        buffer.clear();
        assert!(buffer.is_silent());
    }
}
