use super::{MIX_CHANNELS, SpatialAudioSink};
use crate::audio_data::AudioBuffer;
use crate::config::SourceConfig;
use crate::error::{PetalStreamError, Result};
use crate::math::{Pose, Vec3};
use crate::playback::SourceId;
use std::collections::HashMap;
use std::f32::consts::FRAC_PI_4;

/// Per-frame linear ramp between two gains.
#[derive(Debug, Clone, Copy, PartialEq)]
struct GainRamp {
    current: f32,
    target: f32,
}

impl GainRamp {
    fn new(gain: f32) -> Self {
        Self {
            current: gain,
            target: gain,
        }
    }

    /// Gain for `frame` of a block of `frames`, reaching the target on the last frame.
    fn at(&self, frame: usize, frames: usize) -> f32 {
        self.current + (self.target - self.current) * (frame + 1) as f32 / frames as f32
    }

    fn settle(&mut self) {
        self.current = self.target;
    }
}

struct MixerSource {
    config: SourceConfig,
    volume: f32,
    left: GainRamp,
    right: GainRamp,
    input: AudioBuffer,
    fed: bool,
}

impl MixerSource {
    fn new(config: SourceConfig, listener: &Pose) -> Self {
        let (left, right) = channel_gains(&config, 1.0, listener);
        Self {
            config,
            volume: 1.0,
            left: GainRamp::new(left),
            right: GainRamp::new(right),
            input: AudioBuffer::default(),
            fed: false,
        }
    }

    fn retarget(&mut self, listener: &Pose) {
        let (left, right) = channel_gains(&self.config, self.volume, listener);
        self.left.target = left;
        self.right.target = right;
    }
}

/// Stereo gains for a source: flat for non-spatial sources, equal-power pan with
/// inverse-distance attenuation for spatial ones.
fn channel_gains(config: &SourceConfig, volume: f32, listener: &Pose) -> (f32, f32) {
    match config {
        SourceConfig::NonSpatial => (volume, volume),
        SourceConfig::Spatial { position } => {
            let distance = (*position - listener.position).length();
            let attenuation = 1.0 / distance.max(1.0);
            let pan = listener.local_direction_to(*position).x.clamp(-1.0, 1.0);
            let angle = (pan + 1.0) * FRAC_PI_4;
            let gain = volume * attenuation;
            (gain * angle.cos(), gain * angle.sin())
        }
    }
}

/// Default sink: a plain stereo mixer with per-source gain ramps.
///
/// Spatial sources are panned by their direction relative to the listener and
/// attenuated by distance. For HRTF rendering enable the `steam-audio` feature
/// and use `BinauralSink`.
pub struct StereoMixer {
    frames_per_buffer: usize,
    sources: HashMap<SourceId, MixerSource>,
    listener: Pose,
    master: GainRamp,
    output: AudioBuffer,
}

impl StereoMixer {
    pub fn new(frames_per_buffer: usize, max_sources: usize) -> Self {
        Self {
            frames_per_buffer,
            sources: HashMap::with_capacity(max_sources),
            listener: Pose::default(),
            master: GainRamp::new(1.0),
            output: AudioBuffer::new(MIX_CHANNELS, frames_per_buffer),
        }
    }

    pub fn frames_per_buffer(&self) -> usize {
        self.frames_per_buffer
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub fn has_source(&self, source_id: SourceId) -> bool {
        self.sources.contains_key(&source_id)
    }

    /// Mixes every fed source into `output` without clearing it first.
    /// With `skip_spatial`, spatial sources are left fed for another renderer.
    pub(crate) fn mix_into(&mut self, output: &mut AudioBuffer, skip_spatial: bool) {
        let frames = self.frames_per_buffer.min(output.num_frames());
        for source in self.sources.values_mut() {
            if !source.fed || (skip_spatial && source.config.is_spatial()) {
                continue;
            }
            source.fed = false;

            let input = &source.input;
            let frames = frames.min(input.num_frames());
            if frames == 0 || input.num_channels() == 0 {
                continue;
            }

            // Spatial sources are collapsed to mono before panning.
            let stereo_input = input.num_channels() >= 2 && !source.config.is_spatial();
            let channel_scale = 1.0 / input.num_channels() as f32;
            for frame in 0..frames {
                let (l_in, r_in) = if stereo_input {
                    (input.channel(0)[frame], input.channel(1)[frame])
                } else {
                    let mono = input
                        .channels()
                        .iter()
                        .map(|channel| channel[frame])
                        .sum::<f32>()
                        * channel_scale;
                    (mono, mono)
                };
                output.channel_mut(0)[frame] += l_in * source.left.at(frame, frames);
                output.channel_mut(1)[frame] += r_in * source.right.at(frame, frames);
            }
            source.left.settle();
            source.right.settle();
        }
    }

    pub(crate) fn apply_master(&mut self, output: &mut AudioBuffer) {
        let frames = output.num_frames();
        for ch in 0..output.num_channels() {
            for (frame, sample) in output.channel_mut(ch).iter_mut().enumerate() {
                *sample *= self.master.at(frame, frames);
            }
        }
        self.master.settle();
    }

    #[cfg(feature = "steam-audio")]
    pub(crate) fn listener(&self) -> &Pose {
        &self.listener
    }

    /// Hands each fed spatial source's input to `f` along with its position and
    /// volume, then marks it consumed.
    #[cfg(feature = "steam-audio")]
    pub(crate) fn drain_spatial_inputs<F>(&mut self, mut f: F)
    where
        F: FnMut(SourceId, Vec3, f32, &AudioBuffer),
    {
        for (id, source) in self.sources.iter_mut() {
            if !source.fed {
                continue;
            }
            if let SourceConfig::Spatial { position } = source.config {
                source.fed = false;
                f(*id, position, source.volume, &source.input);
            }
        }
    }
}

impl SpatialAudioSink for StereoMixer {
    fn create_source(&mut self, source_id: SourceId, config: &SourceConfig) -> Result<()> {
        if self.sources.contains_key(&source_id) {
            return Err(PetalStreamError::SpatialAudio(format!(
                "Mixer source {} already exists",
                source_id
            )));
        }
        self.sources
            .insert(source_id, MixerSource::new(*config, &self.listener));
        log::debug!("Created mixer source {} ({:?})", source_id, config);
        Ok(())
    }

    fn destroy_source(&mut self, source_id: SourceId) {
        if self.sources.remove(&source_id).is_some() {
            log::debug!("Destroyed mixer source {}", source_id);
        }
    }

    fn set_planar_buffer(&mut self, source_id: SourceId, buffer: &AudioBuffer) {
        let Some(source) = self.sources.get_mut(&source_id) else {
            log::warn!("Buffer for unknown mixer source {}", source_id);
            return;
        };
        if source.input.num_channels() == buffer.num_channels()
            && source.input.num_frames() == buffer.num_frames()
        {
            source.input.copy_from(buffer);
        } else {
            source.input = buffer.clone();
        }
        source.fed = true;
    }

    fn set_source_volume(&mut self, source_id: SourceId, volume: f32) {
        let listener = self.listener;
        if let Some(source) = self.sources.get_mut(&source_id) {
            source.volume = volume.max(0.0);
            source.retarget(&listener);
        }
    }

    fn set_source_position(&mut self, source_id: SourceId, position: Vec3) {
        let listener = self.listener;
        if let Some(source) = self.sources.get_mut(&source_id) {
            if source.config.is_spatial() {
                source.config = SourceConfig::spatial(position);
                source.retarget(&listener);
            }
        }
    }

    fn set_listener_pose(&mut self, pose: Pose) {
        self.listener = pose;
        for source in self.sources.values_mut() {
            source.retarget(&pose);
        }
    }

    fn set_master_volume(&mut self, volume: f32) {
        self.master.target = volume.max(0.0);
    }

    fn process_next_buffer(&mut self) -> &AudioBuffer {
        let mut output = std::mem::take(&mut self.output);
        output.clear();
        self.mix_into(&mut output, false);
        self.apply_master(&mut output);
        self.output = output;
        &self.output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mono(samples: &[f32]) -> AudioBuffer {
        AudioBuffer::from_channels(vec![samples.to_vec()]).unwrap()
    }

    #[test]
    fn test_non_spatial_mono_plays_on_both_channels() {
        let mut mixer = StereoMixer::new(4, 8);
        let id = SourceId::from_raw(1);
        mixer.create_source(id, &SourceConfig::NonSpatial).unwrap();

        mixer.set_planar_buffer(id, &mono(&[0.1, 0.2, 0.3, 0.4]));
        let out = mixer.process_next_buffer();
        assert_eq!(out.channel(0), &[0.1, 0.2, 0.3, 0.4]);
        assert_eq!(out.channel(1), &[0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn test_unfed_source_is_silent() {
        let mut mixer = StereoMixer::new(4, 8);
        let id = SourceId::from_raw(1);
        mixer.create_source(id, &SourceConfig::NonSpatial).unwrap();

        mixer.set_planar_buffer(id, &mono(&[1.0; 4]));
        mixer.process_next_buffer();
        assert!(mixer.process_next_buffer().is_silent());
    }

    #[test]
    fn test_volume_ramps_across_block() {
        let mut mixer = StereoMixer::new(4, 8);
        let id = SourceId::from_raw(7);
        mixer.create_source(id, &SourceConfig::NonSpatial).unwrap();
        mixer.set_source_volume(id, 0.0);

        mixer.set_planar_buffer(id, &mono(&[1.0; 4]));
        let out = mixer.process_next_buffer();
        assert_eq!(out.channel(0), &[0.75, 0.5, 0.25, 0.0]);

        mixer.set_planar_buffer(id, &mono(&[1.0; 4]));
        assert!(mixer.process_next_buffer().is_silent());
    }

    #[test]
    fn test_sources_are_summed_and_stereo_kept() {
        let mut mixer = StereoMixer::new(2, 8);
        let a = SourceId::from_raw(1);
        let b = SourceId::from_raw(2);
        mixer.create_source(a, &SourceConfig::NonSpatial).unwrap();
        mixer.create_source(b, &SourceConfig::NonSpatial).unwrap();
        assert!(mixer.create_source(a, &SourceConfig::NonSpatial).is_err());

        let stereo = AudioBuffer::from_channels(vec![vec![0.5, 0.5], vec![0.0, 0.25]]).unwrap();
        mixer.set_planar_buffer(a, &stereo);
        mixer.set_planar_buffer(b, &mono(&[0.25, 0.25]));
        let out = mixer.process_next_buffer();
        assert_eq!(out.channel(0), &[0.75, 0.75]);
        assert_eq!(out.channel(1), &[0.25, 0.5]);
    }

    #[test]
    fn test_spatial_source_pans_toward_its_side() {
        let mut mixer = StereoMixer::new(4, 8);
        let id = SourceId::from_raw(3);
        mixer
            .create_source(id, &SourceConfig::spatial(Vec3::new(1.0, 0.0, 0.0)))
            .unwrap();

        mixer.set_planar_buffer(id, &mono(&[1.0; 4]));
        let out = mixer.process_next_buffer();
        assert!(out.channel(1)[3] > 0.99);
        assert!(out.channel(0)[3].abs() < 1e-6);

        // Moving the source to the far left swaps the channels after one ramp.
        mixer.set_source_position(id, Vec3::new(-4.0, 0.0, 0.0));
        mixer.set_planar_buffer(id, &mono(&[1.0; 4]));
        let out = mixer.process_next_buffer();
        assert!((out.channel(0)[3] - 0.25).abs() < 1e-6);
        assert!(out.channel(1)[3].abs() < 1e-6);
    }

    #[test]
    fn test_master_volume_scales_mix() {
        let mut mixer = StereoMixer::new(2, 8);
        let id = SourceId::from_raw(1);
        mixer.create_source(id, &SourceConfig::NonSpatial).unwrap();
        mixer.set_master_volume(0.5);

        mixer.set_planar_buffer(id, &mono(&[1.0, 1.0]));
        mixer.process_next_buffer();
        mixer.set_planar_buffer(id, &mono(&[1.0, 1.0]));
        assert_eq!(mixer.process_next_buffer().channel(0), &[0.5, 0.5]);

        mixer.destroy_source(id);
        assert_eq!(mixer.source_count(), 0);
    }
}
