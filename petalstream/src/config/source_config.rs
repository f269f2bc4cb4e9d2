use crate::math::Vec3;
use std::time::Duration;

/// Configuration for how a sound should be placed in the mix
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum SourceConfig {
    /// Plays directly without 3D spatialization
    #[default]
    NonSpatial,
    /// Placed at a 3D position and spatialized relative to the listener
    Spatial {
        /// 3D position of the audio source
        position: Vec3,
    },
}

impl SourceConfig {
    pub fn non_spatial() -> Self {
        Self::NonSpatial
    }

    pub fn spatial(position: Vec3) -> Self {
        Self::Spatial { position }
    }

    pub fn is_spatial(&self) -> bool {
        matches!(self, Self::Spatial { .. })
    }

    pub fn position(&self) -> Option<Vec3> {
        match self {
            Self::Spatial { position } => Some(*position),
            Self::NonSpatial => None,
        }
    }
}

/// Parameters used when a sound is prepared from an asset.
#[derive(Debug, Clone, PartialEq)]
pub struct SoundPlaybackParams {
    pub source: SourceConfig,
    /// Volume multiplier (0.0 = silent, 1.0 = full volume)
    pub volume: f32,
    pub looping: bool,
    /// Overrides the engine's default loop crossfade for in-memory assets
    pub loop_crossfade: Option<Duration>,
}

impl Default for SoundPlaybackParams {
    fn default() -> Self {
        Self {
            source: SourceConfig::NonSpatial,
            volume: 1.0,
            looping: false,
            loop_crossfade: None,
        }
    }
}

impl SoundPlaybackParams {
    pub fn new(source: SourceConfig) -> Self {
        Self {
            source,
            ..Default::default()
        }
    }

    pub fn with_volume(mut self, volume: f32) -> Self {
        self.volume = volume;
        self
    }

    pub fn with_looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    pub fn with_loop_crossfade(mut self, crossfade: Duration) -> Self {
        self.loop_crossfade = Some(crossfade);
        self
    }
}
