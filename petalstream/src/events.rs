//! Event types for PetalStream

use crate::playback::SourceId;

/// Events emitted by the engine, drained with
/// [`PetalStreamEngine::poll_events`](crate::PetalStreamEngine::poll_events).
#[derive(Debug, Clone, PartialEq)]
pub enum PetalStreamEvent {
    SourceStarted {
        source_id: SourceId,
    },
    /// The stream reached its end without looping
    SourceCompleted {
        source_id: SourceId,
    },
    /// The sound was stopped and its renderer removed
    SourceStopped {
        source_id: SourceId,
    },
    /// The stream had no decoded buffer ready for this tick
    BufferUnderrun {
        source_id: SourceId,
    },
    /// A prestock request could not be queued for a decode worker this tick
    DispatchOverflow {
        source_id: SourceId,
    },
    EngineStarted,
    EngineStopped,
    EngineError {
        error: String,
    },
}

impl PetalStreamEvent {
    pub fn source_id(&self) -> Option<SourceId> {
        match self {
            Self::SourceStarted { source_id }
            | Self::SourceCompleted { source_id }
            | Self::SourceStopped { source_id }
            | Self::BufferUnderrun { source_id }
            | Self::DispatchOverflow { source_id } => Some(*source_id),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::BufferUnderrun { .. } | Self::DispatchOverflow { .. } | Self::EngineError { .. }
        )
    }

    /// True for events after which the source no longer exists in the engine.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::SourceCompleted { .. } | Self::SourceStopped { .. }
        )
    }
}
