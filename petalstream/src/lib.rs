//! # PetalStream
//!
//! A streaming audio asset pipeline for games: cached audio assets, decode-ahead
//! streams that keep a small FIFO stocked on worker threads, and a real-time
//! safe renderer bridge into a stereo or binaural mixing sink.
//!
//! ## Quick Start
//!
//! ```no_run
//! use petalstream::*;
//!
//! let mut engine = PetalStreamEngine::new(PetalStreamDesc::default())?;
//! engine.start()?;
//!
//! // Long music streams from disk; short effects are decoded up front.
//! let music = engine.load_audio_asset("music/theme.ogg", StreamingPolicy::StreamAndClose);
//! let step = engine.load_audio_asset("sfx/step.wav", StreamingPolicy::PreloadIntoMemory);
//!
//! let theme = engine.play_sound(&music, SoundPlaybackParams::default().with_looping(true))?;
//! engine.play_sound(
//!     &step,
//!     SoundPlaybackParams::new(SourceConfig::spatial(Vec3::new(2.0, 0.0, -1.0))),
//! )?;
//!
//! engine.set_sound_volume(theme, 0.5)?;
//!
//! for event in engine.poll_events() {
//!     if let PetalStreamEvent::SourceCompleted { source_id } = event {
//!         println!("{} finished", source_id);
//!     }
//! }
//! # Ok::<(), PetalStreamError>(())
//! ```
//!
//! ## Key Components
//!
//! - **[`PetalStreamEngine`]**: owns the asset registry and the processing thread
//! - **[`AssetRegistry`]**: caches [`AudioAsset`]s by URI and loads them in the background
//! - **[`AssetStream`]**: one playback's view of an asset, from memory or a decode FIFO
//! - **[`StreamRenderer`]**: feeds one stream into the mixing sink
//! - **[`StreamManager`]**: renders every stream per tick and dispatches decode work
//! - **[`SpatialAudioSink`]**: mixing back end ([`StereoMixer`], or `BinauralSink`
//!   with the `steam-audio` feature)
//!
//! ## Threads
//!
//! 1. **Caller thread**: loads assets, prepares sounds, sends commands
//! 2. **Processing thread**: applies commands, renders streams, mixes one block per tick
//! 3. **Dispatch + decode threads**: refill streamed assets ahead of the playhead
//! 4. **Audio callback**: pops mixed blocks with a bounded wait, silence on timeout
//!
//! The audio-thread paths (`get_next_buffer`, the renderers, the mixer) neither
//! block nor allocate once a stream is initialized.

pub mod asset;
pub mod audio_data;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod manager;
pub mod math;
pub mod output;
pub mod playback;
pub mod pool;
pub mod renderer;
pub mod spatial;
pub mod stream;

pub use asset::{AssetKey, AssetLoader, AssetRegistry, AssetStatus, AudioAsset, FileAssetLoader, StreamingPolicy};
pub use config::{PetalStreamDesc, SoundPlaybackParams, SourceConfig, SpeakerProfile};
pub use engine::PetalStreamEngine;
pub use error::{PetalStreamError, Result};
pub use events::PetalStreamEvent;
pub use manager::{PrestockJob, StreamManager};
pub use math::{Pose, Quat, Vec3};
pub use output::MixOutput;
pub use playback::{PlayState, SourceId};
pub use pool::DecodeThreadPool;
pub use renderer::{RenderStatus, StreamRenderer};
pub use spatial::{SpatialAudioSink, StereoMixer};
pub use stream::{AssetStream, NextBuffer};

#[cfg(feature = "steam-audio")]
pub use spatial::BinauralSink;
