//! Playback handles, state and the commands the processing thread consumes.
//!
//! Most users will interact with playback through
//! [`PetalStreamEngine`](crate::PetalStreamEngine) methods like `play_sound()`,
//! `pause_sound()` and `stop_sound()` rather than using these types directly.

use crate::math::{Pose, Vec3};
use crate::renderer::StreamRenderer;

/// Lightweight, type-safe handle for a playing sound.
///
/// Returned when a sound is prepared. Used to reference the sound for
/// playback operations (pause, resume, stop, seek).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u64);

impl SourceId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SourceId({})", self.0)
    }
}

/// Playback state of a stream renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    /// Buffers are pulled from the stream every tick
    Playing,
    /// Paused, volume ramping down; buffers are still pulled until the countdown ends
    FadingOut,
    /// No buffers are pulled (retains playback position)
    Paused,
}

/// Commands sent from the engine handle to the processing thread.
///
/// They are drained once at the start of every processing tick, so the
/// renderers are only ever touched by the processing thread.
pub enum EngineCommand {
    /// Register a prepared renderer; `start` resumes it immediately
    AddRenderer {
        renderer: Box<StreamRenderer>,
        start: bool,
    },
    Pause(SourceId),
    Resume(SourceId),
    /// Fade out and remove the renderer
    Stop(SourceId),
    SetVolume(SourceId, f32),
    /// Seek to a position in seconds
    Seek(SourceId, f32),
    SetLooping(SourceId, bool),
    SetPosition(SourceId, Vec3),
    SetListenerPose(Pose),
    SetMasterVolume(f32),
}

impl std::fmt::Debug for EngineCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AddRenderer { renderer, start } => f
                .debug_struct("AddRenderer")
                .field("source_id", &renderer.source_id())
                .field("start", start)
                .finish(),
            Self::Pause(id) => f.debug_tuple("Pause").field(id).finish(),
            Self::Resume(id) => f.debug_tuple("Resume").field(id).finish(),
            Self::Stop(id) => f.debug_tuple("Stop").field(id).finish(),
            Self::SetVolume(id, v) => f.debug_tuple("SetVolume").field(id).field(v).finish(),
            Self::Seek(id, t) => f.debug_tuple("Seek").field(id).field(t).finish(),
            Self::SetLooping(id, l) => f.debug_tuple("SetLooping").field(id).field(l).finish(),
            Self::SetPosition(id, p) => f.debug_tuple("SetPosition").field(id).field(p).finish(),
            Self::SetListenerPose(p) => f.debug_tuple("SetListenerPose").field(p).finish(),
            Self::SetMasterVolume(v) => f.debug_tuple("SetMasterVolume").field(v).finish(),
        }
    }
}
