use super::{AssetKey, AssetLoader, AssetStatus, AudioAsset, StreamingPolicy};
use crate::audio_data::PlanarAudioBuffer;
use crate::config::SpeakerProfile;
use crate::error::{PetalStreamError, Result};
use crossbeam_channel::Sender;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

/// Caches audio assets by URI and opens them on a background thread.
///
/// Creating an asset returns immediately; the asset reports
/// [`AssetStatus::WaitingForReader`] until the load thread has opened (or,
/// for [`StreamingPolicy::PreloadIntoMemory`], fully decoded) it.
pub struct AssetRegistry {
    profile: SpeakerProfile,
    loader: Arc<dyn AssetLoader>,
    assets: Mutex<HashMap<AssetKey, Arc<AudioAsset>>>,
    load_tx: Option<Sender<Arc<AudioAsset>>>,
    load_thread: Option<JoinHandle<()>>,
}

impl AssetRegistry {
    pub fn new(profile: SpeakerProfile, loader: Arc<dyn AssetLoader>) -> Result<Self> {
        let (load_tx, load_rx) = crossbeam_channel::unbounded::<Arc<AudioAsset>>();

        let thread_loader = loader.clone();
        let load_thread = std::thread::Builder::new()
            .name("petalstream-loader".into())
            .spawn(move || {
                for asset in load_rx.iter() {
                    load_asset(thread_loader.as_ref(), &profile, &asset);
                }
                log::debug!("Asset load thread exiting");
            })
            .map_err(|e| {
                PetalStreamError::Engine(format!("Failed to spawn asset load thread: {}", e))
            })?;

        Ok(Self {
            profile,
            loader,
            assets: Mutex::new(HashMap::new()),
            load_tx: Some(load_tx),
            load_thread: Some(load_thread),
        })
    }

    /// Returns the cached asset for `uri`, creating and loading it on first use.
    ///
    /// Later calls for the same URI return the cached handle regardless of
    /// `policy`.
    pub fn create_asset(&self, uri: &str, policy: StreamingPolicy) -> Arc<AudioAsset> {
        let key = AssetKey::from_uri(uri);
        let mut assets = self.assets();
        if let Some(asset) = assets.get(&key) {
            return asset.clone();
        }

        let asset = Arc::new(AudioAsset::new(uri, policy));
        assets.insert(key, asset.clone());
        drop(assets);

        log::debug!("Loading asset '{}' ({:?})", uri, policy);
        let queued = self
            .load_tx
            .as_ref()
            .is_some_and(|tx| tx.send(asset.clone()).is_ok());
        if !queued {
            log::warn!("Asset load thread unavailable, loading '{}' inline", uri);
            load_asset(self.loader.as_ref(), &self.profile, &asset);
        }

        asset
    }

    pub fn find_asset(&self, key: AssetKey) -> Option<Arc<AudioAsset>> {
        self.assets().get(&key).cloned()
    }

    /// Drops the registry's reference. Streams holding the asset keep it alive.
    pub fn unload_asset(&self, key: AssetKey) -> bool {
        let removed = self.assets().remove(&key);
        if let Some(asset) = &removed {
            log::debug!("Unloaded asset '{}'", asset.uri());
        }
        removed.is_some()
    }

    /// Resolves an asset into one a new stream may consume.
    ///
    /// Blocks until the asset has finished loading, so this must not run on
    /// the audio thread. If the asset's reader is already promised to another
    /// stream, a second reader is opened synchronously and wrapped in a
    /// temporary, uncached asset. Returns `None` for invalid assets.
    ///
    /// A streamed result holds a reservation on the asset's reader until an
    /// [`AssetStream`](crate::AssetStream) is built from it. Callers that give
    /// up before that must call [`AudioAsset::release_reservation`], or every
    /// later playback opens a duplicate reader and a `StreamIntoMemory` asset
    /// is never captured.
    pub fn get_asset_for_playback(&self, asset: &Arc<AudioAsset>) -> Option<Arc<AudioAsset>> {
        match asset.wait_until_ready() {
            AssetStatus::LoadedInMemory => Some(asset.clone()),
            AssetStatus::ReadyForStreaming => {
                if asset.try_reserve_reader() {
                    if asset.policy() == StreamingPolicy::StreamAndClose {
                        self.forget(asset);
                    }
                    return Some(asset.clone());
                }

                match self.loader.open_now(asset.uri()) {
                    Ok(reader) => {
                        log::debug!(
                            "Reader for '{}' is in use, streaming from a duplicate",
                            asset.uri()
                        );
                        Some(AudioAsset::from_reader(
                            asset.uri(),
                            StreamingPolicy::StreamAndClose,
                            reader,
                        ))
                    }
                    Err(e) => {
                        log::error!(
                            "Failed to open a second reader for '{}': {}",
                            asset.uri(),
                            e
                        );
                        None
                    }
                }
            }
            AssetStatus::Invalid => {
                log::error!("Asset '{}' is invalid and cannot be played", asset.uri());
                None
            }
            AssetStatus::WaitingForReader => {
                log::error!("Asset '{}' never finished loading", asset.uri());
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.assets().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn speaker_profile(&self) -> &SpeakerProfile {
        &self.profile
    }

    fn forget(&self, asset: &Arc<AudioAsset>) {
        let mut assets = self.assets();
        if assets
            .get(&asset.key())
            .is_some_and(|cached| Arc::ptr_eq(cached, asset))
        {
            assets.remove(&asset.key());
        }
    }

    fn assets(&self) -> MutexGuard<'_, HashMap<AssetKey, Arc<AudioAsset>>> {
        self.assets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for AssetRegistry {
    fn drop(&mut self) {
        self.load_tx.take();
        if let Some(handle) = self.load_thread.take() {
            if handle.join().is_err() {
                log::error!("Asset load thread panicked");
            }
        }
    }
}

fn load_asset(loader: &dyn AssetLoader, profile: &SpeakerProfile, asset: &AudioAsset) {
    let mut reader = match loader.open_now(asset.uri()) {
        Ok(reader) => reader,
        Err(e) => {
            log::error!("Failed to open audio asset '{}': {}", asset.uri(), e);
            asset.mark_invalid();
            return;
        }
    };

    if asset.policy() != StreamingPolicy::PreloadIntoMemory {
        asset.set_reader(reader);
        return;
    }

    match PlanarAudioBuffer::decode_fully(reader.as_mut(), profile) {
        Ok(data) => asset.set_planar_data(Arc::new(data)),
        Err(e) => {
            log::error!("Failed to decode audio asset '{}': {}", asset.uri(), e);
            asset.mark_invalid();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_data::{AudioReader, PcmReader};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry_with_opens() -> (AssetRegistry, Arc<AtomicUsize>) {
        let opens = Arc::new(AtomicUsize::new(0));
        let counter = opens.clone();
        let loader = move |uri: &str| -> Result<Box<dyn AudioReader>> {
            counter.fetch_add(1, Ordering::SeqCst);
            if uri.starts_with("missing") {
                return Err(PetalStreamError::AudioLoading(format!("no such asset {}", uri)));
            }
            Ok(Box::new(PcmReader::new(vec![0.25; 4096], 1, 8000)))
        };
        let registry =
            AssetRegistry::new(SpeakerProfile::new(8000, 256, 2), Arc::new(loader)).unwrap();
        (registry, opens)
    }

    #[test]
    fn test_create_asset_is_idempotent() {
        let (registry, opens) = registry_with_opens();
        let a = registry.create_asset("sound.wav", StreamingPolicy::StreamIntoMemory);
        let b = registry.create_asset("sound.wav", StreamingPolicy::StreamIntoMemory);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.wait_until_ready(), AssetStatus::ReadyForStreaming);
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_preload_decodes_into_memory() {
        let (registry, _) = registry_with_opens();
        let asset = registry.create_asset("music.wav", StreamingPolicy::PreloadIntoMemory);
        assert_eq!(asset.wait_until_ready(), AssetStatus::LoadedInMemory);
        assert_eq!(asset.planar_data().unwrap().frame_count(), 4096);

        let playback = registry.get_asset_for_playback(&asset).unwrap();
        assert!(Arc::ptr_eq(&asset, &playback));
    }

    #[test]
    fn test_invalid_asset_is_not_playable() {
        let (registry, _) = registry_with_opens();
        let asset = registry.create_asset("missing.wav", StreamingPolicy::StreamAndClose);
        assert_eq!(asset.wait_until_ready(), AssetStatus::Invalid);
        assert!(registry.get_asset_for_playback(&asset).is_none());
    }

    #[test]
    fn test_busy_reader_yields_duplicate() {
        let (registry, opens) = registry_with_opens();
        let asset = registry.create_asset("loop.wav", StreamingPolicy::StreamIntoMemory);

        let first = registry.get_asset_for_playback(&asset).unwrap();
        let second = registry.get_asset_for_playback(&asset).unwrap();
        assert!(Arc::ptr_eq(&first, &asset));
        assert!(!Arc::ptr_eq(&first, &second));
        assert_ne!(first.id(), second.id());
        assert_eq!(second.uri(), asset.uri());
        assert_eq!(opens.load(Ordering::SeqCst), 2);

        assert!(first.acquire_reader().is_some());
        assert!(second.acquire_reader().is_some());
    }

    #[test]
    fn test_released_playback_reuses_reader() {
        let (registry, opens) = registry_with_opens();
        let asset = registry.create_asset("jingle.wav", StreamingPolicy::StreamIntoMemory);

        let abandoned = registry.get_asset_for_playback(&asset).unwrap();
        abandoned.release_reservation();
        drop(abandoned);

        let playback = registry.get_asset_for_playback(&asset).unwrap();
        assert!(Arc::ptr_eq(&asset, &playback));
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stream_only_asset_leaves_cache() {
        let (registry, _) = registry_with_opens();
        let asset = registry.create_asset("voice.wav", StreamingPolicy::StreamAndClose);
        let key = asset.key();
        assert!(registry.find_asset(key).is_some());

        let playback = registry.get_asset_for_playback(&asset).unwrap();
        assert!(Arc::ptr_eq(&asset, &playback));
        assert!(registry.find_asset(key).is_none());
    }

    #[test]
    fn test_unload_keeps_holders_alive() {
        let (registry, _) = registry_with_opens();
        let asset = registry.create_asset("ambience.wav", StreamingPolicy::StreamIntoMemory);
        assert!(registry.unload_asset(asset.key()));
        assert!(!registry.unload_asset(asset.key()));
        assert!(registry.is_empty());
        assert_eq!(asset.wait_until_ready(), AssetStatus::ReadyForStreaming);
    }
}
