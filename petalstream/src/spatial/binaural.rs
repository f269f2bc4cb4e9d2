use super::hrtf::load_hrtf;
use super::{MIX_CHANNELS, SpatialAudioSink, StereoMixer};
use crate::audio_data::AudioBuffer;
use crate::config::{PetalStreamDesc, SourceConfig};
use crate::error::{PetalStreamError, Result};
use crate::math::{Pose, Vec3};
use crate::playback::SourceId;
use audionimbus::{
    AirAbsorptionModel, AmbisonicsDecodeEffect, AmbisonicsDecodeEffectParams,
    AmbisonicsDecodeEffectSettings, AmbisonicsEncodeEffect, AmbisonicsEncodeEffectParams,
    AmbisonicsEncodeEffectSettings, AudioBufferSettings, AudioSettings, Context,
    CoordinateSystem, Direct, DirectEffect, DirectEffectParams, DirectEffectSettings,
    DirectSimulationParameters, DirectSimulationSettings, Direction, DistanceAttenuationModel,
    Equalizer, Hrtf, Point, Scene, SceneParams, SceneSettings, SimulationFlags,
    SimulationInputs, SimulationSharedInputs, Simulator, Source, SourceSettings, SpeakerLayout,
    Vector3, audio_buffer::AudioBuffer as NimbusBuffer, geometry,
};
use std::collections::HashMap;

/// Channel count of second-order ambisonics.
const AMBISONICS_CHANNELS: usize = 9;
/// Game units to meters for the direct simulation.
const DISTANCE_SCALER: f32 = 10.0;

fn nimbus_err<E: std::fmt::Display>(what: &str) -> impl FnOnce(E) -> PetalStreamError + '_ {
    move |e| PetalStreamError::SpatialAudio(format!("Failed to create {}: {}", what, e))
}

struct SpatialSource {
    source: Source,
    position: Vec3,
    direct_effect: DirectEffect,
    encode_effect: AmbisonicsEncodeEffect,
}

/// Steam Audio state plus scratch buffers, kept apart from the mixer so both
/// can be borrowed while spatial inputs are drained.
struct SteamAudioPath {
    context: Context,
    simulator: Simulator<Direct>,
    _scene: Scene,
    hrtf: Hrtf,
    audio_settings: AudioSettings,
    decode_effect: AmbisonicsDecodeEffect,
    sources: HashMap<SourceId, SpatialSource>,
    frame_size: usize,
    mono: Vec<f32>,
    direct: Vec<f32>,
    encoded: Vec<f32>,
    summed: Vec<f32>,
    decoded: Vec<f32>,
}

impl SteamAudioPath {
    fn new(sample_rate: u32, frame_size: usize, hrtf_path: Option<&str>) -> Result<Self> {
        log::info!(
            "Initializing Steam Audio binaural sink (sample_rate: {} Hz, frame_size: {})",
            sample_rate,
            frame_size
        );

        let context = Context::try_new(&audionimbus::ContextSettings::default())
            .map_err(nimbus_err("Steam Audio context"))?;
        let audio_settings = AudioSettings {
            sampling_rate: sample_rate,
            frame_size: frame_size as u32,
        };
        let hrtf = load_hrtf(&context, &audio_settings, hrtf_path)?;

        let decode_effect = AmbisonicsDecodeEffect::try_new(
            &context,
            &audio_settings,
            &AmbisonicsDecodeEffectSettings {
                max_order: 2,
                speaker_layout: SpeakerLayout::Stereo,
                hrtf: &hrtf,
            },
        )
        .map_err(nimbus_err("AmbisonicsDecodeEffect"))?;

        let mut simulator = Simulator::builder(SceneParams::Default, sample_rate, frame_size as u32)
            .with_direct(DirectSimulationSettings {
                max_num_occlusion_samples: 32,
            })
            .try_build(&context)
            .map_err(nimbus_err("simulator"))?;

        let scene =
            Scene::try_new(&context, &SceneSettings::default()).map_err(nimbus_err("scene"))?;
        simulator.set_scene(&scene);
        simulator.commit();

        Ok(Self {
            context,
            simulator,
            _scene: scene,
            hrtf,
            audio_settings,
            decode_effect,
            sources: HashMap::new(),
            frame_size,
            mono: vec![0.0; frame_size],
            direct: vec![0.0; frame_size],
            encoded: vec![0.0; frame_size * AMBISONICS_CHANNELS],
            summed: vec![0.0; frame_size * AMBISONICS_CHANNELS],
            decoded: vec![0.0; frame_size * MIX_CHANNELS],
        })
    }

    fn add_source(&mut self, source_id: SourceId, position: Vec3) -> Result<()> {
        let source = Source::try_new(
            &self.simulator,
            &SourceSettings {
                flags: SimulationFlags::DIRECT,
            },
        )
        .map_err(nimbus_err("source"))?;
        let direct_effect = DirectEffect::try_new(
            &self.context,
            &self.audio_settings,
            &DirectEffectSettings { num_channels: 1 },
        )
        .map_err(nimbus_err("DirectEffect"))?;
        let encode_effect = AmbisonicsEncodeEffect::try_new(
            &self.context,
            &self.audio_settings,
            &AmbisonicsEncodeEffectSettings {
                max_order: 2,
            },
        )
        .map_err(nimbus_err("AmbisonicsEncodeEffect"))?;

        self.simulator.add_source(&source);
        self.simulator.commit();
        self.sources.insert(
            source_id,
            SpatialSource {
                source,
                position,
                direct_effect,
                encode_effect,
            },
        );
        Ok(())
    }

    fn simulate(&mut self, listener: &Pose) {
        for spatial in self.sources.values_mut() {
            let scaled = spatial.position * DISTANCE_SCALER;
            let inputs = SimulationInputs {
                source: geometry::CoordinateSystem {
                    origin: Point::new(scaled.x, scaled.y, scaled.z),
                    ..Default::default()
                },
                direct_simulation: Some(DirectSimulationParameters {
                    distance_attenuation: Some(DistanceAttenuationModel::Default),
                    air_absorption: Some(AirAbsorptionModel::Default),
                    directivity: None,
                    occlusion: None,
                }),
                reflections_simulation: None,
                pathing_simulation: None,
            };
            spatial.source.set_inputs(SimulationFlags::DIRECT, inputs);
        }
        self.simulator.commit();

        let origin = listener.position * DISTANCE_SCALER;
        let (right, up, ahead) = (listener.right(), listener.up(), listener.forward());
        let shared_inputs = SimulationSharedInputs {
            listener: geometry::CoordinateSystem {
                origin: Point::new(origin.x, origin.y, origin.z),
                right: Vector3::new(right.x, right.y, right.z),
                up: Vector3::new(up.x, up.y, up.z),
                ahead: Vector3::new(ahead.x, ahead.y, ahead.z),
            },
            num_rays: 1024,
            num_bounces: 10,
            duration: 3.0,
            order: 2,
            irradiance_min_distance: 1.0,
            pathing_visualization_callback: None,
        };
        self.simulator
            .set_shared_inputs(SimulationFlags::DIRECT, &shared_inputs);
        self.simulator.run_direct();
    }

    /// Runs one source through the direct and encode effects and accumulates
    /// it into the ambisonics sum.
    fn encode_source(
        &mut self,
        source_id: SourceId,
        volume: f32,
        input: &AudioBuffer,
        listener: &Pose,
    ) -> Result<()> {
        let Some(spatial) = self.sources.get_mut(&source_id) else {
            return Ok(());
        };

        self.mono.fill(0.0);
        let frames = self.frame_size.min(input.num_frames());
        let scale = volume / input.num_channels().max(1) as f32;
        for channel in input.channels() {
            for (dst, src) in self.mono[..frames].iter_mut().zip(channel) {
                *dst += src * scale;
            }
        }

        let outputs = spatial.source.get_outputs(SimulationFlags::DIRECT);
        let direct_outputs = outputs.direct();
        let air_absorption = direct_outputs
            .air_absorption
            .as_ref()
            .map(|eq| Equalizer([eq[0], eq[1], eq[2]]))
            .unwrap_or(Equalizer([1.0, 1.0, 1.0]));
        let direct_params = DirectEffectParams {
            distance_attenuation: Some(direct_outputs.distance_attenuation.unwrap_or(1.0)),
            air_absorption: Some(air_absorption),
            directivity: None,
            occlusion: None,
            transmission: None,
        };

        let mono_buf = NimbusBuffer::try_with_data_and_settings(&self.mono, mono_settings())
            .map_err(nimbus_err("input buffer"))?;
        let direct_buf =
            NimbusBuffer::try_with_data_and_settings(&mut self.direct, mono_settings())
                .map_err(nimbus_err("direct buffer"))?;
        spatial
            .direct_effect
            .apply(&direct_params, &mono_buf, &direct_buf);

        let direction = listener.local_direction_to(spatial.position);
        let encode_params = AmbisonicsEncodeEffectParams {
            direction: Direction::new(direction.x, direction.y, direction.z),
            order: 2,
        };
        let direct_in = NimbusBuffer::try_with_data_and_settings(&self.direct, mono_settings())
            .map_err(nimbus_err("direct buffer"))?;
        let encoded_buf = NimbusBuffer::try_with_data_and_settings(
            &mut self.encoded,
            AudioBufferSettings {
                num_channels: Some(9),
                ..Default::default()
            },
        )
        .map_err(nimbus_err("ambisonics buffer"))?;
        spatial
            .encode_effect
            .apply(&encode_params, &direct_in, &encoded_buf);

        for (sum, sample) in self.summed.iter_mut().zip(&self.encoded) {
            *sum += sample;
        }
        Ok(())
    }

    /// Decodes the ambisonics sum to binaural stereo and adds it to `output`.
    fn decode_into(&mut self, output: &mut AudioBuffer) -> Result<()> {
        let params = AmbisonicsDecodeEffectParams {
            order: 2,
            hrtf: &self.hrtf,
            orientation: CoordinateSystem {
                ahead: Vector3::new(0.0, 0.0, -1.0),
                ..Default::default()
            },
            binaural: true,
        };
        let summed_buf = NimbusBuffer::try_with_data_and_settings(
            &self.summed,
            AudioBufferSettings {
                num_channels: Some(9),
                ..Default::default()
            },
        )
        .map_err(nimbus_err("ambisonics buffer"))?;
        let decoded_buf = NimbusBuffer::try_with_data_and_settings(
            &mut self.decoded,
            AudioBufferSettings {
                num_channels: Some(2),
                ..Default::default()
            },
        )
        .map_err(nimbus_err("stereo buffer"))?;
        self.decode_effect.apply(&params, &summed_buf, &decoded_buf);

        // Steam Audio buffers are planar, one channel after the other.
        let frames = self.frame_size.min(output.num_frames());
        for ch in 0..MIX_CHANNELS {
            let decoded = &self.decoded[ch * self.frame_size..ch * self.frame_size + frames];
            for (dst, src) in output.channel_mut(ch)[..frames].iter_mut().zip(decoded) {
                *dst += src;
            }
        }
        Ok(())
    }
}

fn mono_settings() -> AudioBufferSettings {
    AudioBufferSettings {
        num_channels: Some(1),
        ..Default::default()
    }
}

/// HRTF-based sink built on Steam Audio.
///
/// Spatial sources go through distance attenuation, air absorption and
/// second-order ambisonics before a binaural decode. Non-spatial sources are
/// mixed straight into the output like [`StereoMixer`] does.
pub struct BinauralSink {
    mixer: StereoMixer,
    path: SteamAudioPath,
    output: AudioBuffer,
}

impl BinauralSink {
    pub fn new(desc: &PetalStreamDesc) -> Result<Self> {
        Ok(Self {
            mixer: StereoMixer::new(desc.block_size, desc.max_sources),
            path: SteamAudioPath::new(desc.sample_rate, desc.block_size, desc.hrtf_path.as_deref())?,
            output: AudioBuffer::new(MIX_CHANNELS, desc.block_size),
        })
    }
}

impl SpatialAudioSink for BinauralSink {
    fn create_source(&mut self, source_id: SourceId, config: &SourceConfig) -> Result<()> {
        self.mixer.create_source(source_id, config)?;
        if let SourceConfig::Spatial { position } = config {
            if let Err(e) = self.path.add_source(source_id, *position) {
                self.mixer.destroy_source(source_id);
                return Err(e);
            }
            log::debug!("Created spatial effects for source {}", source_id);
        }
        Ok(())
    }

    fn destroy_source(&mut self, source_id: SourceId) {
        self.mixer.destroy_source(source_id);
        if self.path.sources.remove(&source_id).is_some() {
            log::debug!("Removed spatial effects for source {}", source_id);
        }
    }

    fn set_planar_buffer(&mut self, source_id: SourceId, buffer: &AudioBuffer) {
        self.mixer.set_planar_buffer(source_id, buffer);
    }

    fn set_source_volume(&mut self, source_id: SourceId, volume: f32) {
        self.mixer.set_source_volume(source_id, volume);
    }

    fn set_source_position(&mut self, source_id: SourceId, position: Vec3) {
        self.mixer.set_source_position(source_id, position);
        if let Some(spatial) = self.path.sources.get_mut(&source_id) {
            spatial.position = position;
        }
    }

    fn set_listener_pose(&mut self, pose: Pose) {
        self.mixer.set_listener_pose(pose);
    }

    fn set_master_volume(&mut self, volume: f32) {
        self.mixer.set_master_volume(volume);
    }

    fn process_next_buffer(&mut self) -> &AudioBuffer {
        let Self {
            mixer,
            path,
            output,
        } = self;
        output.clear();
        mixer.mix_into(output, true);

        if !path.sources.is_empty() {
            let listener = *mixer.listener();
            path.simulate(&listener);
            path.summed.fill(0.0);

            let mut encoded_any = false;
            mixer.drain_spatial_inputs(|source_id, _, volume, input| {
                match path.encode_source(source_id, volume, input, &listener) {
                    Ok(()) => encoded_any = true,
                    Err(e) => log::error!("Error spatializing source {}: {}", source_id, e),
                }
            });
            if encoded_any {
                if let Err(e) = path.decode_into(output) {
                    log::error!("Error decoding binaural mix: {}", e);
                }
            }
        }

        mixer.apply_master(output);
        &self.output
    }
}
