use super::AudioBuffer;
use crate::error::{PetalStreamError, Result};

/// Sample encoding of the bytes returned by [`AudioReader::read_frames`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingFormat {
    /// Interleaved little-endian signed 16-bit PCM
    PcmI16,
    /// Interleaved little-endian 32-bit float PCM
    PcmF32,
}

impl EncodingFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            Self::PcmI16 => 2,
            Self::PcmF32 => 4,
        }
    }

    /// Decodes one sample. `bytes` must hold at least `bytes_per_sample()` bytes.
    #[inline]
    pub fn decode_sample(&self, bytes: &[u8]) -> f32 {
        match self {
            Self::PcmI16 => i16::from_le_bytes([bytes[0], bytes[1]]) as f32 / 32768.0,
            Self::PcmF32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        }
    }
}

/// Pull-based decoder for one audio asset.
///
/// A reader is owned by exactly one stream at a time and is moved between the
/// asset and the stream, never shared.
pub trait AudioReader: Send {
    /// True once every frame up to [`total_frame_count`](Self::total_frame_count) was returned.
    fn is_at_end_of_stream(&self) -> bool;

    /// Moves the read position, returning the frame position actually reached.
    fn seek_to_frame_position(&mut self, frame: u64) -> u64;

    /// Total length in frames at the reader's own sample rate.
    fn total_frame_count(&self) -> u64;

    fn num_channels(&self) -> usize;

    fn sample_rate_hz(&self) -> u32;

    fn encoding_format(&self) -> EncodingFormat;

    /// Reads up to `num_frames` interleaved frames. A short read means the end
    /// of the stream was reached.
    fn read_frames(&mut self, num_frames: usize) -> Result<&[u8]>;

    /// Rewinds to the first frame.
    fn reset(&mut self) -> Result<()> {
        match self.seek_to_frame_position(0) {
            0 => Ok(()),
            actual => Err(PetalStreamError::AudioLoading(format!(
                "Reader could not rewind, stopped at frame {}",
                actual
            ))),
        }
    }
}

/// Fills `buffer` with the next frames from `reader`.
///
/// Frames the reader could not supply are zeroed. Returns the number of frames
/// actually read.
pub fn read_next_buffer(reader: &mut dyn AudioReader, buffer: &mut AudioBuffer) -> usize {
    let num_channels = buffer.num_channels();
    if reader.num_channels() != num_channels {
        log::warn!(
            "Reader has {} channels but the buffer has {}",
            reader.num_channels(),
            num_channels
        );
        buffer.clear();
        return 0;
    }

    let format = reader.encoding_format();
    let bytes_per_sample = format.bytes_per_sample();
    let frames_requested = buffer.num_frames();

    let bytes = match reader.read_frames(frames_requested) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("Failed to read frames: {}", e);
            buffer.clear();
            return 0;
        }
    };

    let frame_bytes = bytes_per_sample * num_channels;
    let frames_read = (bytes.len() / frame_bytes).min(frames_requested);

    for ch in 0..num_channels {
        let channel = buffer.channel_mut(ch);
        for (frame, sample) in channel.iter_mut().take(frames_read).enumerate() {
            let offset = frame * frame_bytes + ch * bytes_per_sample;
            *sample = format.decode_sample(&bytes[offset..offset + bytes_per_sample]);
        }
        channel[frames_read..].fill(0.0);
    }

    frames_read
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_data::PcmReader;

    #[test]
    fn test_decode_i16_sample() {
        let format = EncodingFormat::PcmI16;
        assert_eq!(format.decode_sample(&i16::MIN.to_le_bytes()), -1.0);
        assert_eq!(format.decode_sample(&0i16.to_le_bytes()), 0.0);
        assert_eq!(format.decode_sample(&16384i16.to_le_bytes()), 0.5);
    }

    #[test]
    fn test_read_next_buffer_deinterleaves() {
        let interleaved = vec![1.0, -1.0, 2.0, -2.0, 3.0, -3.0];
        let mut reader = PcmReader::new(interleaved, 2, 48000);
        let mut buffer = AudioBuffer::new(2, 2);

        assert_eq!(read_next_buffer(&mut reader, &mut buffer), 2);
        assert_eq!(buffer.channel(0), &[1.0, 2.0]);
        assert_eq!(buffer.channel(1), &[-1.0, -2.0]);

        assert_eq!(read_next_buffer(&mut reader, &mut buffer), 1);
        assert_eq!(buffer.channel(0), &[3.0, 0.0]);
        assert_eq!(buffer.channel(1), &[-3.0, 0.0]);
        assert!(reader.is_at_end_of_stream());
    }

    #[test]
    fn test_channel_mismatch_reads_nothing() {
        let mut reader = PcmReader::new(vec![0.25; 8], 1, 48000);
        let mut buffer = AudioBuffer::new(2, 4);
        assert_eq!(read_next_buffer(&mut reader, &mut buffer), 0);
        assert!(buffer.is_silent());
    }

    #[test]
    fn test_default_reset_rewinds() {
        let mut reader = PcmReader::new(vec![0.25; 8], 1, 48000);
        let mut buffer = AudioBuffer::new(1, 8);
        read_next_buffer(&mut reader, &mut buffer);
        assert!(reader.is_at_end_of_stream());
        reader.reset().unwrap();
        assert!(!reader.is_at_end_of_stream());
    }
}
