//! Asset caching and lifecycle.
//!
//! An [`AudioAsset`] owns either a decode reader (for streaming) or a fully
//! decoded [`PlanarAudioBuffer`](crate::audio_data::PlanarAudioBuffer), never
//! both. The [`AssetRegistry`] caches assets by URI and loads them on a
//! background thread through an [`AssetLoader`].

mod audio_asset;
mod loader;
mod registry;

pub use audio_asset::{AssetId, AssetKey, AssetStatus, AudioAsset, StreamingPolicy};
pub use loader::{AssetLoader, FileAssetLoader};
pub use registry::AssetRegistry;
