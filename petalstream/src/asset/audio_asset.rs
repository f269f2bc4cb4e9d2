use crate::audio_data::{AudioReader, PlanarAudioBuffer};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

static NEXT_ASSET_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identity of one asset instance, including temporary duplicates.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct AssetId(u64);

impl AssetId {
    fn next() -> Self {
        Self(NEXT_ASSET_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for AssetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AssetId({})", self.0)
    }
}

/// Cache key derived from an asset URI.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct AssetKey(u64);

impl AssetKey {
    pub fn from_uri(uri: &str) -> Self {
        let mut hasher = DefaultHasher::new();
        uri.hash(&mut hasher);
        Self(hasher.finish())
    }
}

impl std::fmt::Display for AssetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AssetKey({:016x})", self.0)
    }
}

/// How an asset's data is kept once it has been opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamingPolicy {
    /// Decode incrementally while playing; the cache entry is dropped once handed out
    #[default]
    StreamAndClose,
    /// Decode everything up front and play from memory
    PreloadIntoMemory,
    /// Stream the first playback and keep what was decoded for later ones
    StreamIntoMemory,
}

/// Observable lifecycle state of an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetStatus {
    WaitingForReader,
    ReadyForStreaming,
    LoadedInMemory,
    Invalid,
}

enum AssetState {
    WaitingForReader,
    ReadyForStreaming {
        /// `None` while a stream has the reader checked out
        reader: Option<Box<dyn AudioReader>>,
        /// Promised to a playback request that has not created its stream yet
        reserved: bool,
    },
    LoadedInMemory(Arc<PlanarAudioBuffer>),
    Invalid,
}

impl AssetState {
    fn status(&self) -> AssetStatus {
        match self {
            Self::WaitingForReader => AssetStatus::WaitingForReader,
            Self::ReadyForStreaming { .. } => AssetStatus::ReadyForStreaming,
            Self::LoadedInMemory(_) => AssetStatus::LoadedInMemory,
            Self::Invalid => AssetStatus::Invalid,
        }
    }
}

/// A loadable sound, identified by its URI.
///
/// Holds either a decode reader or decoded planar data. The reader is lent to
/// at most one stream at a time by moving it out with
/// [`acquire_reader`](Self::acquire_reader) and back with
/// [`return_reader`](Self::return_reader).
pub struct AudioAsset {
    id: AssetId,
    key: AssetKey,
    uri: String,
    policy: StreamingPolicy,
    state: Mutex<AssetState>,
    ready_rx: Receiver<()>,
    /// Dropped on the first transition out of `WaitingForReader`, which wakes every waiter
    ready_tx: Mutex<Option<Sender<()>>>,
}

impl AudioAsset {
    /// Creates an asset that is still waiting for its loader.
    pub fn new(uri: impl Into<String>, policy: StreamingPolicy) -> Self {
        let uri = uri.into();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(0);
        Self {
            id: AssetId::next(),
            key: AssetKey::from_uri(&uri),
            uri,
            policy,
            state: Mutex::new(AssetState::WaitingForReader),
            ready_rx,
            ready_tx: Mutex::new(Some(ready_tx)),
        }
    }

    /// Creates an asset that is ready to stream from `reader`.
    pub fn from_reader(
        uri: impl Into<String>,
        policy: StreamingPolicy,
        reader: Box<dyn AudioReader>,
    ) -> Arc<Self> {
        let asset = Self::new(uri, policy);
        asset.set_reader(reader);
        Arc::new(asset)
    }

    /// Creates an asset that plays from already decoded data.
    pub fn from_planar(uri: impl Into<String>, data: Arc<PlanarAudioBuffer>) -> Arc<Self> {
        let asset = Self::new(uri, StreamingPolicy::PreloadIntoMemory);
        asset.set_planar_data(data);
        Arc::new(asset)
    }

    pub fn id(&self) -> AssetId {
        self.id
    }

    pub fn key(&self) -> AssetKey {
        self.key
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn policy(&self) -> StreamingPolicy {
        self.policy
    }

    pub fn status(&self) -> AssetStatus {
        self.state().status()
    }

    /// Blocks until the asset has left `WaitingForReader`.
    ///
    /// Must not be called from the audio thread.
    pub fn wait_until_ready(&self) -> AssetStatus {
        // Nothing is ever sent; the channel disconnects when loading finishes.
        let _ = self.ready_rx.recv();
        self.status()
    }

    /// Like [`wait_until_ready`](Self::wait_until_ready) with a deadline.
    /// Returns `None` if the asset is still loading when it expires.
    pub fn wait_until_ready_timeout(&self, timeout: Duration) -> Option<AssetStatus> {
        match self.ready_rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => None,
            _ => Some(self.status()),
        }
    }

    /// Stores the decode reader produced by the loader.
    pub fn set_reader(&self, reader: Box<dyn AudioReader>) {
        {
            let mut state = self.state();
            if matches!(*state, AssetState::WaitingForReader) {
                *state = AssetState::ReadyForStreaming {
                    reader: Some(reader),
                    reserved: false,
                };
            } else {
                log::warn!("Asset '{}' already has data, ignoring new reader", self.uri);
            }
        }
        self.signal_ready();
    }

    /// Replaces whatever the asset holds with decoded data. Any idle reader is closed.
    pub fn set_planar_data(&self, data: Arc<PlanarAudioBuffer>) {
        {
            let mut state = self.state();
            if matches!(*state, AssetState::Invalid) {
                log::warn!("Asset '{}' is invalid, ignoring decoded data", self.uri);
            } else {
                log::debug!(
                    "Asset '{}' now plays from memory ({} frames)",
                    self.uri,
                    data.frame_count()
                );
                *state = AssetState::LoadedInMemory(data);
            }
        }
        self.signal_ready();
    }

    pub fn mark_invalid(&self) {
        *self.state() = AssetState::Invalid;
        self.signal_ready();
    }

    /// Moves the reader out for exclusive use by one stream.
    ///
    /// Returns `None` if the asset is not streaming or the reader is checked out.
    pub fn acquire_reader(&self) -> Option<Box<dyn AudioReader>> {
        match &mut *self.state() {
            AssetState::ReadyForStreaming { reader, reserved } => {
                let taken = reader.take();
                if taken.is_some() {
                    *reserved = false;
                }
                taken
            }
            _ => None,
        }
    }

    /// Gives a previously acquired reader back.
    pub fn return_reader(&self, returned: Box<dyn AudioReader>) {
        match &mut *self.state() {
            AssetState::ReadyForStreaming { reader, .. } if reader.is_none() => {
                *reader = Some(returned);
            }
            _ => {
                log::debug!("Asset '{}' no longer streams, closing reader", self.uri);
            }
        }
    }

    /// Claims the idle reader for a pending playback request.
    pub(crate) fn try_reserve_reader(&self) -> bool {
        match &mut *self.state() {
            AssetState::ReadyForStreaming {
                reader: Some(_),
                reserved,
            } if !*reserved => {
                *reserved = true;
                true
            }
            _ => false,
        }
    }

    /// Drops a reservation that no stream is going to take up.
    ///
    /// Building an [`AssetStream`](crate::AssetStream) releases it as well.
    pub fn release_reservation(&self) {
        if let AssetState::ReadyForStreaming { reserved, .. } = &mut *self.state() {
            *reserved = false;
        }
    }

    /// True if a stream could take the reader right now.
    pub fn is_reader_available(&self) -> bool {
        matches!(
            &*self.state(),
            AssetState::ReadyForStreaming {
                reader: Some(_),
                reserved: false
            }
        )
    }

    pub fn planar_data(&self) -> Option<Arc<PlanarAudioBuffer>> {
        match &*self.state() {
            AssetState::LoadedInMemory(data) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn should_stream_into_memory(&self) -> bool {
        self.policy == StreamingPolicy::StreamIntoMemory
    }

    fn state(&self) -> MutexGuard<'_, AssetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn signal_ready(&self) {
        self.ready_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl std::fmt::Debug for AudioAsset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioAsset")
            .field("id", &self.id)
            .field("uri", &self.uri)
            .field("policy", &self.policy)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_data::PcmReader;
    use std::thread;

    fn reader() -> Box<dyn AudioReader> {
        Box::new(PcmReader::new(vec![0.0; 64], 1, 8000))
    }

    #[test]
    fn test_reader_is_exclusive() {
        let asset = AudioAsset::from_reader("mem://a", StreamingPolicy::StreamAndClose, reader());
        assert_eq!(asset.status(), AssetStatus::ReadyForStreaming);

        let taken = asset.acquire_reader().unwrap();
        assert!(asset.acquire_reader().is_none());
        assert!(!asset.is_reader_available());

        asset.return_reader(taken);
        assert!(asset.is_reader_available());
    }

    #[test]
    fn test_reservation_blocks_second_claim() {
        let asset = AudioAsset::from_reader("mem://b", StreamingPolicy::StreamAndClose, reader());
        assert!(asset.try_reserve_reader());
        assert!(!asset.try_reserve_reader());
        assert!(asset.acquire_reader().is_some());
        assert!(!asset.try_reserve_reader());
    }

    #[test]
    fn test_released_reservation_frees_reader() {
        let asset = AudioAsset::from_reader("mem://b", StreamingPolicy::StreamAndClose, reader());
        assert!(asset.try_reserve_reader());
        assert!(!asset.is_reader_available());
        asset.release_reservation();
        assert!(asset.is_reader_available());
        assert!(asset.try_reserve_reader());
    }

    #[test]
    fn test_planar_data_replaces_reader() {
        let asset = AudioAsset::from_reader("mem://c", StreamingPolicy::StreamIntoMemory, reader());
        let data = Arc::new(PlanarAudioBuffer::from_channels(vec![vec![0.5; 32]]).unwrap());
        asset.set_planar_data(data);

        assert_eq!(asset.status(), AssetStatus::LoadedInMemory);
        assert!(asset.acquire_reader().is_none());
        assert_eq!(asset.planar_data().unwrap().frame_count(), 32);
    }

    #[test]
    fn test_waiters_wake_on_transition() {
        let asset = Arc::new(AudioAsset::new("mem://d", StreamingPolicy::StreamAndClose));
        assert_eq!(
            asset.wait_until_ready_timeout(Duration::from_millis(10)),
            None
        );

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let asset = asset.clone();
                thread::spawn(move || asset.wait_until_ready())
            })
            .collect();

        asset.mark_invalid();
        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), AssetStatus::Invalid);
        }
    }

    #[test]
    fn test_same_uri_same_key() {
        assert_eq!(AssetKey::from_uri("a.wav"), AssetKey::from_uri("a.wav"));
        assert_ne!(AssetKey::from_uri("a.wav"), AssetKey::from_uri("b.wav"));
        let a = AudioAsset::new("a.wav", StreamingPolicy::StreamAndClose);
        let b = AudioAsset::new("a.wav", StreamingPolicy::StreamAndClose);
        assert_eq!(a.key(), b.key());
        assert_ne!(a.id(), b.id());
    }
}
