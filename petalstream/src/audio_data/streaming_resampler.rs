use crate::error::{PetalStreamError, Result};
use rubato::{
    FastFixedIn, PolynomialDegree, Resampler, SincFixedIn, SincInterpolationParameters,
    SincInterpolationType, WindowFunction,
};

/// Type of resampler algorithm to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResamplerType {
    /// Fast polynomial resampler - lower quality but faster
    Fast,
    /// Sinc interpolation resampler - higher quality but slower
    #[default]
    Sinc,
}

enum ResamplerImpl {
    Fast(FastFixedIn<f32>),
    Sinc(SincFixedIn<f32>),
}

impl ResamplerImpl {
    fn process(
        &mut self,
        input: &[Vec<f32>],
    ) -> std::result::Result<Vec<Vec<f32>>, rubato::ResampleError> {
        match self {
            Self::Fast(r) => r.process(input, None),
            Self::Sinc(r) => r.process(input, None),
        }
    }

    fn output_frames_max(&self) -> usize {
        match self {
            Self::Fast(r) => r.output_frames_max(),
            Self::Sinc(r) => r.output_frames_max(),
        }
    }

    fn reset(&mut self) {
        match self {
            Self::Fast(r) => r.reset(),
            Self::Sinc(r) => r.reset(),
        }
    }
}

/// Chunked sample rate converter for decoded asset data.
///
/// Consumes fixed-size planar chunks at the asset's rate and produces a
/// variable number of frames at the playback rate. Output lengths vary with
/// the ratio, so callers re-slice them with a
/// [`BufferPartitioner`](super::BufferPartitioner).
pub struct StreamingResampler {
    resampler: ResamplerImpl,
    source_sample_rate: u32,
    target_sample_rate: u32,
    channels: usize,
    input_chunk_size: usize,
}

impl StreamingResampler {
    /// Creates a new streaming resampler with fixed input size
    ///
    /// # Arguments
    /// * `source_sample_rate` - Sample rate of the decoded asset
    /// * `target_sample_rate` - Playback sample rate
    /// * `channels` - Number of audio channels
    /// * `input_frames` - Frames per input chunk
    /// * `resampler_type` - Algorithm to use (defaults to Sinc if None)
    pub fn new(
        source_sample_rate: u32,
        target_sample_rate: u32,
        channels: usize,
        input_frames: usize,
        resampler_type: Option<ResamplerType>,
    ) -> Result<Self> {
        if source_sample_rate == 0 || target_sample_rate == 0 {
            return Err(PetalStreamError::AudioFormat(
                "Sample rates must be greater than 0".to_string(),
            ));
        }

        if channels == 0 {
            return Err(PetalStreamError::AudioFormat(
                "Channel count must be greater than 0".to_string(),
            ));
        }

        if input_frames == 0 {
            return Err(PetalStreamError::AudioFormat(
                "Input frames must be greater than 0".to_string(),
            ));
        }

        // target/source (output/input)
        let resample_ratio = target_sample_rate as f64 / source_sample_rate as f64;
        let resampler_type = resampler_type.unwrap_or_default();

        log::debug!(
            "Creating {:?} resampler: {} Hz -> {} Hz (fixed input: {} frames)",
            resampler_type,
            source_sample_rate,
            target_sample_rate,
            input_frames
        );

        let resampler = match resampler_type {
            ResamplerType::Fast => {
                let fast = FastFixedIn::new(
                    resample_ratio,
                    1.0,
                    PolynomialDegree::Septic,
                    input_frames,
                    channels,
                )
                .map_err(|e| {
                    PetalStreamError::AudioLoading(format!(
                        "Failed to create fast resampler: {}",
                        e
                    ))
                })?;
                ResamplerImpl::Fast(fast)
            }
            ResamplerType::Sinc => {
                let params = SincInterpolationParameters {
                    sinc_len: 256,
                    f_cutoff: 0.95,
                    interpolation: SincInterpolationType::Linear,
                    oversampling_factor: 256,
                    window: WindowFunction::BlackmanHarris2,
                };

                let sinc =
                    SincFixedIn::new(resample_ratio, 1.0, params, input_frames, channels)
                        .map_err(|e| {
                            PetalStreamError::AudioLoading(format!(
                                "Failed to create sinc resampler: {}",
                                e
                            ))
                        })?;
                ResamplerImpl::Sinc(sinc)
            }
        };

        Ok(Self {
            resampler,
            source_sample_rate,
            target_sample_rate,
            channels,
            input_chunk_size: input_frames,
        })
    }

    /// Resamples one planar chunk of exactly `input_chunk_size` frames.
    pub fn process(&mut self, input: &[Vec<f32>]) -> Result<Vec<Vec<f32>>> {
        if input.len() != self.channels {
            return Err(PetalStreamError::AudioFormat(format!(
                "Channel mismatch: expected {} channels, got {}",
                self.channels,
                input.len()
            )));
        }

        if input.iter().any(|c| c.len() != self.input_chunk_size) {
            return Err(PetalStreamError::AudioFormat(format!(
                "Input size mismatch: expected {} frames per channel",
                self.input_chunk_size
            )));
        }

        self.resampler
            .process(input)
            .map_err(|e| PetalStreamError::AudioLoading(format!("Resampling error: {}", e)))
    }

    /// Upper bound on the frames a single [`process`](Self::process) call returns.
    pub fn output_frames_max(&self) -> usize {
        self.resampler.output_frames_max()
    }

    pub fn input_chunk_size(&self) -> usize {
        self.input_chunk_size
    }

    pub fn target_sample_rate(&self) -> u32 {
        self.target_sample_rate
    }

    pub fn source_sample_rate(&self) -> u32 {
        self.source_sample_rate
    }

    /// Output frames produced per input frame.
    pub fn ratio(&self) -> f64 {
        self.target_sample_rate as f64 / self.source_sample_rate as f64
    }

    /// Drops filter history, e.g. after the source position jumped.
    pub fn reset(&mut self) {
        self.resampler.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resampler_creation() {
        let resampler = StreamingResampler::new(44100, 48000, 2, 512, None).unwrap();
        assert_eq!(resampler.source_sample_rate(), 44100);
        assert_eq!(resampler.target_sample_rate(), 48000);
        assert_eq!(resampler.input_chunk_size(), 512);
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(StreamingResampler::new(0, 48000, 2, 512, None).is_err());
        assert!(StreamingResampler::new(44100, 0, 2, 512, None).is_err());
        assert!(StreamingResampler::new(44100, 48000, 0, 512, None).is_err());
        assert!(StreamingResampler::new(44100, 48000, 2, 0, None).is_err());
    }

    #[test]
    fn test_upsampling_output_within_bound() {
        let mut resampler =
            StreamingResampler::new(24000, 48000, 1, 256, Some(ResamplerType::Fast)).unwrap();
        let max = resampler.output_frames_max();
        assert!(max >= 512);
        let output = resampler.process(&[vec![0.1; 256]]).unwrap();
        assert_eq!(output.len(), 1);
        assert!(output[0].len() <= max);
    }

    #[test]
    fn test_wrong_chunk_size_rejected() {
        let mut resampler =
            StreamingResampler::new(24000, 48000, 1, 256, Some(ResamplerType::Fast)).unwrap();
        assert!(resampler.process(&[vec![0.0; 100]]).is_err());
        assert!(resampler.process(&[vec![0.0; 256], vec![0.0; 256]]).is_err());
    }
}
