use super::{AudioBuffer, AudioReader, StreamingResampler, read_next_buffer};
use crate::config::SpeakerProfile;
use crate::error::{PetalStreamError, Result};
use std::time::Duration;

/// Fully decoded asset data, one contiguous sample vector per channel.
///
/// All channels always have the same length. Once complete the buffer is
/// shared read-only (behind an `Arc`) by every stream playing the asset.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlanarAudioBuffer {
    channels: Vec<Vec<f32>>,
}

impl PlanarAudioBuffer {
    pub fn new(num_channels: usize) -> Self {
        Self::with_capacity(num_channels, 0)
    }

    pub fn with_capacity(num_channels: usize, frames: usize) -> Self {
        Self {
            channels: (0..num_channels).map(|_| Vec::with_capacity(frames)).collect(),
        }
    }

    pub fn from_channels(channels: Vec<Vec<f32>>) -> Result<Self> {
        let len = channels.first().map_or(0, Vec::len);
        if channels.iter().any(|c| c.len() != len) {
            return Err(PetalStreamError::AudioFormat(
                "All channels of a planar buffer must have the same length".into(),
            ));
        }
        Ok(Self { channels })
    }

    /// Decodes everything `reader` has left, converting to the profile's sample rate.
    ///
    /// Reads in chunks of `profile.frames_per_buffer` frames and appends them in
    /// source order.
    pub fn decode_fully(reader: &mut dyn AudioReader, profile: &SpeakerProfile) -> Result<Self> {
        let num_channels = reader.num_channels();
        if num_channels == 0 {
            return Err(PetalStreamError::AudioFormat(
                "Cannot decode an asset with no channels".into(),
            ));
        }

        let chunk_frames = profile.frames_per_buffer;
        let source_rate = reader.sample_rate_hz();
        let mut resampler = if source_rate != profile.sample_rate_hz {
            Some(StreamingResampler::new(
                source_rate,
                profile.sample_rate_hz,
                num_channels,
                chunk_frames,
                Some(profile.resampler_type),
            )?)
        } else {
            None
        };

        let ratio = profile.sample_rate_hz as f64 / source_rate.max(1) as f64;
        let expected = (reader.total_frame_count() as f64 * ratio).ceil() as usize;
        let mut planar = Self::with_capacity(num_channels, expected);
        let mut chunk = AudioBuffer::new(num_channels, chunk_frames);

        while !reader.is_at_end_of_stream() {
            let frames = read_next_buffer(reader, &mut chunk);
            if frames == 0 {
                break;
            }

            match resampler.as_mut() {
                Some(resampler) => {
                    let output = resampler.process(chunk.channels())?;
                    let produced = output.first().map_or(0, Vec::len);
                    let keep = ((frames as f64 * ratio).ceil() as usize).min(produced);
                    planar.extend_from_planar(&output, keep);
                }
                None => planar.append_frames(&chunk, frames)?,
            }
        }

        log::debug!(
            "Decoded {} frames ({} channels) at {} Hz",
            planar.frame_count(),
            num_channels,
            profile.sample_rate_hz
        );

        Ok(planar)
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn frame_count(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.frame_count() == 0
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index]
    }

    pub fn duration(&self, sample_rate: u32) -> Duration {
        Duration::from_secs_f64(self.frame_count() as f64 / sample_rate.max(1) as f64)
    }

    /// Appends a whole fixed-size buffer.
    pub fn append(&mut self, buffer: &AudioBuffer) -> Result<()> {
        self.append_frames(buffer, buffer.num_frames())
    }

    /// Appends the first `num_frames` frames of `buffer`.
    pub fn append_frames(&mut self, buffer: &AudioBuffer, num_frames: usize) -> Result<()> {
        if buffer.num_channels() != self.num_channels() {
            return Err(PetalStreamError::AudioFormat(format!(
                "Cannot append {} channels to a {} channel buffer",
                buffer.num_channels(),
                self.num_channels()
            )));
        }
        self.extend_from_planar(buffer.channels(), num_frames.min(buffer.num_frames()));
        Ok(())
    }

    fn extend_from_planar(&mut self, input: &[Vec<f32>], num_frames: usize) {
        for (dst, src) in self.channels.iter_mut().zip(input.iter()) {
            dst.extend_from_slice(&src[..num_frames]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_data::{PcmReader, ResamplerType};

    fn sine(frames: usize) -> Vec<f32> {
        (0..frames).map(|i| (i as f32 * 0.01).sin()).collect()
    }

    #[test]
    fn test_decode_fully_same_rate() {
        let samples = sine(1000);
        let mut reader = PcmReader::from_channels(&[samples.clone(), samples.clone()], 8000);
        let profile = SpeakerProfile::new(8000, 256, 2);

        let planar = PlanarAudioBuffer::decode_fully(&mut reader, &profile).unwrap();
        assert_eq!(planar.num_channels(), 2);
        assert_eq!(planar.frame_count(), 1000);
        assert_eq!(planar.channel(0), samples.as_slice());
        assert_eq!(planar.channel(1), samples.as_slice());
    }

    #[test]
    fn test_decode_fully_resamples() {
        let mut reader = PcmReader::from_channels(&[sine(4000)], 24000);
        let profile =
            SpeakerProfile::new(48000, 512, 2).with_resampler_type(ResamplerType::Fast);

        let planar = PlanarAudioBuffer::decode_fully(&mut reader, &profile).unwrap();
        assert_eq!(planar.num_channels(), 1);
        let frames = planar.frame_count();
        assert!(frames > 7000 && frames <= 8000, "got {} frames", frames);
    }

    #[test]
    fn test_append_keeps_channels_equal() {
        let mut planar = PlanarAudioBuffer::new(2);
        let buffer = AudioBuffer::from_channels(vec![vec![1.0; 4], vec![2.0; 4]]).unwrap();
        planar.append(&buffer).unwrap();
        planar.append_frames(&buffer, 3).unwrap();
        assert_eq!(planar.frame_count(), 7);
        assert_eq!(planar.channel(0).len(), planar.channel(1).len());

        let mono = AudioBuffer::new(1, 4);
        assert!(planar.append(&mono).is_err());
        assert_eq!(planar.frame_count(), 7);
    }

    #[test]
    fn test_from_channels_validates_lengths() {
        assert!(PlanarAudioBuffer::from_channels(vec![vec![0.0; 2], vec![0.0; 5]]).is_err());
        let planar = PlanarAudioBuffer::from_channels(vec![vec![0.0; 8000]]).unwrap();
        assert_eq!(planar.duration(8000), Duration::from_secs(1));
    }
}
