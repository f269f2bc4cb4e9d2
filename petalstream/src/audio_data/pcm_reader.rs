use super::{AudioReader, EncodingFormat};
use crate::error::Result;

/// Reader over interleaved f32 samples held in memory.
///
/// Useful for procedurally generated sounds and for tests.
pub struct PcmReader {
    samples: Vec<f32>,
    num_channels: usize,
    sample_rate: u32,
    position: u64,
    bytes: Vec<u8>,
}

impl PcmReader {
    pub fn new(interleaved: Vec<f32>, num_channels: usize, sample_rate: u32) -> Self {
        Self {
            samples: interleaved,
            num_channels: num_channels.max(1),
            sample_rate,
            position: 0,
            bytes: Vec::new(),
        }
    }

    /// Builds a reader from planar channel data. Channels are truncated to the shortest one.
    pub fn from_channels(channels: &[Vec<f32>], sample_rate: u32) -> Self {
        let num_channels = channels.len().max(1);
        let num_frames = channels.iter().map(Vec::len).min().unwrap_or(0);
        let mut interleaved = Vec::with_capacity(num_frames * num_channels);
        for frame in 0..num_frames {
            for channel in channels {
                interleaved.push(channel[frame]);
            }
        }
        Self::new(interleaved, num_channels, sample_rate)
    }

    pub fn position(&self) -> u64 {
        self.position
    }
}

impl AudioReader for PcmReader {
    fn is_at_end_of_stream(&self) -> bool {
        self.position >= self.total_frame_count()
    }

    fn seek_to_frame_position(&mut self, frame: u64) -> u64 {
        self.position = frame.min(self.total_frame_count());
        self.position
    }

    fn total_frame_count(&self) -> u64 {
        (self.samples.len() / self.num_channels) as u64
    }

    fn num_channels(&self) -> usize {
        self.num_channels
    }

    fn sample_rate_hz(&self) -> u32 {
        self.sample_rate
    }

    fn encoding_format(&self) -> EncodingFormat {
        EncodingFormat::PcmF32
    }

    fn read_frames(&mut self, num_frames: usize) -> Result<&[u8]> {
        let remaining = self.total_frame_count() - self.position;
        let frames = (num_frames as u64).min(remaining) as usize;
        let start = self.position as usize * self.num_channels;
        let end = start + frames * self.num_channels;

        self.bytes.clear();
        for sample in &self.samples[start..end] {
            self.bytes.extend_from_slice(&sample.to_le_bytes());
        }
        self.position += frames as u64;

        Ok(&self.bytes)
    }
}
