use crate::audio_data::ResamplerType;
use crate::error::{PetalStreamError, Result};
use std::time::Duration;

/// Configuration descriptor for a PetalStream engine
#[derive(Debug, Clone)]
pub struct PetalStreamDesc {
    /// Playback sample rate. Assets at other rates are resampled to it.
    pub sample_rate: u32,
    /// Frames per buffer, shared by every stream, the mixer and the device.
    pub block_size: usize,
    /// Output device channel count (the mix itself is stereo)
    pub channels: u16,
    /// Maximum number of concurrently registered stream renderers
    pub max_sources: usize,
    /// Number of decode worker threads owned by the stream manager
    pub decode_threads: usize,
    /// Capacity of the mixed-block queue between the processing thread and the device
    pub output_fifo_buffers: usize,
    /// How long either side of the output queue waits before giving up on a block
    pub output_max_wait: Duration,
    /// Loop crossfade applied to in-memory streams when they are initialized
    pub default_loop_crossfade: Duration,
    /// Buffers rendered at zero volume after a pause before the renderer stops pulling
    pub fade_out_buffers: usize,
    /// Resampler used for assets whose sample rate differs from `sample_rate`
    pub resampler_type: ResamplerType,
    /// Optional path to a custom HRTF SOFA file (None uses Steam Audio's default HRTF)
    pub hrtf_path: Option<String>,
}

impl Default for PetalStreamDesc {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            block_size: 1024,
            channels: 2,
            max_sources: 512,
            decode_threads: 2,
            output_fifo_buffers: 1,
            output_max_wait: Duration::from_millis(100),
            default_loop_crossfade: Duration::from_millis(200),
            fade_out_buffers: 4,
            resampler_type: ResamplerType::default(),
            hrtf_path: None,
        }
    }
}

impl PetalStreamDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_channels(mut self, channels: u16) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_max_sources(mut self, max_sources: usize) -> Self {
        self.max_sources = max_sources;
        self
    }

    pub fn with_decode_threads(mut self, decode_threads: usize) -> Self {
        self.decode_threads = decode_threads;
        self
    }

    pub fn with_output_max_wait(mut self, wait: Duration) -> Self {
        self.output_max_wait = wait;
        self
    }

    pub fn with_default_loop_crossfade(mut self, crossfade: Duration) -> Self {
        self.default_loop_crossfade = crossfade;
        self
    }

    pub fn with_resampler_type(mut self, resampler_type: ResamplerType) -> Self {
        self.resampler_type = resampler_type;
        self
    }

    pub fn with_hrtf_path(mut self, path: impl Into<String>) -> Self {
        self.hrtf_path = Some(path.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(PetalStreamError::Configuration(
                "Sample rate must be greater than 0".into(),
            ));
        }
        if self.block_size == 0 {
            return Err(PetalStreamError::Configuration(
                "Block size must be greater than 0".into(),
            ));
        }
        if self.channels == 0 {
            return Err(PetalStreamError::Configuration(
                "Channel count must be greater than 0".into(),
            ));
        }
        if self.decode_threads == 0 {
            return Err(PetalStreamError::Configuration(
                "At least one decode thread is required".into(),
            ));
        }
        if self.output_fifo_buffers == 0 {
            return Err(PetalStreamError::Configuration(
                "Output FIFO needs room for at least one buffer".into(),
            ));
        }
        Ok(())
    }

    pub fn speaker_profile(&self) -> SpeakerProfile {
        SpeakerProfile {
            sample_rate_hz: self.sample_rate,
            frames_per_buffer: self.block_size,
            num_channels: self.channels as usize,
            resampler_type: self.resampler_type,
        }
    }
}

/// Output format every stream renders into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeakerProfile {
    pub sample_rate_hz: u32,
    pub frames_per_buffer: usize,
    pub num_channels: usize,
    pub resampler_type: ResamplerType,
}

impl SpeakerProfile {
    pub fn new(sample_rate_hz: u32, frames_per_buffer: usize, num_channels: usize) -> Self {
        Self {
            sample_rate_hz,
            frames_per_buffer,
            num_channels,
            resampler_type: ResamplerType::default(),
        }
    }

    pub fn with_resampler_type(mut self, resampler_type: ResamplerType) -> Self {
        self.resampler_type = resampler_type;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_desc_is_valid() {
        let desc = PetalStreamDesc::default();
        assert!(desc.validate().is_ok());
        assert_eq!(desc.output_max_wait, Duration::from_millis(100));
        assert_eq!(desc.max_sources, 512);
    }

    #[test]
    fn test_invalid_desc() {
        assert!(PetalStreamDesc::new().with_block_size(0).validate().is_err());
        assert!(PetalStreamDesc::new().with_decode_threads(0).validate().is_err());
        assert!(PetalStreamDesc::new().with_sample_rate(0).validate().is_err());
    }

    #[test]
    fn test_speaker_profile_from_desc() {
        let profile = PetalStreamDesc::new()
            .with_sample_rate(44100)
            .with_block_size(256)
            .speaker_profile();
        assert_eq!(profile.sample_rate_hz, 44100);
        assert_eq!(profile.frames_per_buffer, 256);
        assert_eq!(profile.num_channels, 2);
    }
}
