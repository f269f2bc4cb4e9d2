//! Mixing back ends that turn per-source buffers into the stereo mix.
//!
//! The processing thread drives a [`SpatialAudioSink`] once per tick: every
//! renderer that produced a buffer hands it over with
//! [`set_planar_buffer`](SpatialAudioSink::set_planar_buffer), then
//! [`process_next_buffer`](SpatialAudioSink::process_next_buffer) mixes them.
//! Sources that were not fed this tick stay silent.

mod mixer;

#[cfg(feature = "steam-audio")]
mod binaural;
#[cfg(feature = "steam-audio")]
mod hrtf;

pub use mixer::StereoMixer;

#[cfg(feature = "steam-audio")]
pub use binaural::BinauralSink;

use crate::audio_data::AudioBuffer;
use crate::config::SourceConfig;
use crate::error::Result;
use crate::math::{Pose, Vec3};
use crate::playback::SourceId;

/// Number of channels in every mixed block.
pub const MIX_CHANNELS: usize = 2;

/// Destination for rendered source buffers.
///
/// Implementations own one opaque source per registered [`SourceId`] and
/// produce one stereo block of `frames_per_buffer` frames per call to
/// `process_next_buffer`.
pub trait SpatialAudioSink: Send {
    fn create_source(&mut self, source_id: SourceId, config: &SourceConfig) -> Result<()>;

    fn destroy_source(&mut self, source_id: SourceId);

    /// Queues this tick's input for a source. Buffers may be mono or stereo.
    fn set_planar_buffer(&mut self, source_id: SourceId, buffer: &AudioBuffer);

    /// Target gain; implementations ramp toward it across the next block.
    fn set_source_volume(&mut self, source_id: SourceId, volume: f32);

    /// Ignored for non-spatial sources.
    fn set_source_position(&mut self, source_id: SourceId, position: Vec3);

    fn set_listener_pose(&mut self, pose: Pose);

    fn set_master_volume(&mut self, volume: f32);

    /// Mixes every source fed since the last call into one stereo block.
    fn process_next_buffer(&mut self) -> &AudioBuffer;
}
