use crate::asset::{AssetKey, AssetLoader, AssetRegistry, AudioAsset, FileAssetLoader, StreamingPolicy};
use crate::audio_data::AudioBuffer;
use crate::config::{PetalStreamDesc, SoundPlaybackParams};
use crate::error::{PetalStreamError, Result};
use crate::events::PetalStreamEvent;
use crate::manager::StreamManager;
use crate::math::{Pose, Vec3};
use crate::output::{self, MixInput, MixOutput};
use crate::playback::{EngineCommand, SourceId};
use crate::renderer::StreamRenderer;
use crate::spatial::{MIX_CHANNELS, SpatialAudioSink, StereoMixer};
use crate::stream::AssetStream;
use crossbeam_channel::{Receiver, SendTimeoutError, Sender};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

/// The mixing side handed to the processing thread while it runs.
struct MixState {
    sink: Box<dyn SpatialAudioSink>,
    manager: StreamManager,
}

struct ProcessingThread {
    running: Arc<AtomicBool>,
    handle: JoinHandle<MixState>,
}

/// Streaming audio engine.
///
/// `PetalStreamEngine` is the central API for PetalStream. It owns the asset
/// registry and a processing thread that renders every active sound into a
/// mixing sink and pushes the mixed blocks to the audio device.
///
/// # Architecture
///
/// - **Caller thread**: loads assets, prepares sounds, sends commands
/// - **Processing thread**: applies commands, renders streams, mixes
/// - **Decode threads**: keep streamed assets stocked ahead of the playhead
/// - **Audio callback**: pulls mixed blocks with a bounded wait
pub struct PetalStreamEngine {
    desc: PetalStreamDesc,
    registry: AssetRegistry,
    command_sender: Sender<EngineCommand>,
    command_receiver: Receiver<EngineCommand>,
    event_sender: Sender<PetalStreamEvent>,
    event_receiver: Receiver<PetalStreamEvent>,
    next_source_id: AtomicU64,
    sounds: Mutex<HashSet<SourceId>>,
    mix_state: Option<MixState>,
    processing: Option<ProcessingThread>,
    device_stream: Option<cpal::Stream>,
}

impl PetalStreamEngine {
    /// Creates an engine that mixes with a [`StereoMixer`] and loads files from disk.
    pub fn new(desc: PetalStreamDesc) -> Result<Self> {
        let sink = Box::new(StereoMixer::new(desc.block_size, desc.max_sources));
        Self::with_sink(desc, sink)
    }

    pub fn with_sink(desc: PetalStreamDesc, sink: Box<dyn SpatialAudioSink>) -> Result<Self> {
        Self::with_sink_and_loader(desc, sink, Arc::new(FileAssetLoader::new()))
    }

    pub fn with_sink_and_loader(
        desc: PetalStreamDesc,
        sink: Box<dyn SpatialAudioSink>,
        loader: Arc<dyn AssetLoader>,
    ) -> Result<Self> {
        desc.validate()?;

        let registry = AssetRegistry::new(desc.speaker_profile(), loader)?;
        let (command_sender, command_receiver) = crossbeam_channel::unbounded();
        let (event_sender, event_receiver) = crossbeam_channel::unbounded();
        let manager = StreamManager::new(desc.max_sources, desc.decode_threads)
            .with_events(event_sender.clone());

        Ok(Self {
            desc,
            registry,
            command_sender,
            command_receiver,
            event_sender,
            event_receiver,
            next_source_id: AtomicU64::new(1),
            sounds: Mutex::new(HashSet::new()),
            mix_state: Some(MixState { sink, manager }),
            processing: None,
            device_stream: None,
        })
    }

    pub fn config(&self) -> &PetalStreamDesc {
        &self.desc
    }

    pub fn sample_rate(&self) -> u32 {
        self.desc.sample_rate
    }

    pub fn registry(&self) -> &AssetRegistry {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.processing
            .as_ref()
            .is_some_and(|p| !p.handle.is_finished())
    }

    /// Starts the processing thread and plays the mix on the default output device.
    pub fn start(&mut self) -> Result<()> {
        if self.processing.is_some() {
            return Ok(());
        }
        let output = self.spawn_processing()?;
        match output::open_device_stream(&self.desc, output) {
            Ok(stream) => {
                self.device_stream = Some(stream);
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to open audio device: {}", e);
                self.join_processing();
                Err(e)
            }
        }
    }

    /// Starts the processing thread without opening a device.
    ///
    /// The returned [`MixOutput`] must be drained by the caller; the
    /// processing thread only renders as fast as blocks are consumed.
    pub fn start_without_device(&mut self) -> Result<MixOutput> {
        if self.processing.is_some() {
            return Err(PetalStreamError::Engine("Engine is already running".into()));
        }
        self.spawn_processing()
    }

    /// Stops the device and the processing thread.
    ///
    /// Prepared and playing sounds are kept and continue after the next start.
    pub fn stop(&mut self) -> Result<()> {
        if let Some(stream) = self.device_stream.take() {
            drop(stream);
        }
        self.join_processing();
        Ok(())
    }

    fn spawn_processing(&mut self) -> Result<MixOutput> {
        let state = self
            .mix_state
            .take()
            .ok_or_else(|| PetalStreamError::Engine("Mixing state is unavailable".into()))?;
        let (input, output) = output::mix_queue(&self.desc);
        let running = Arc::new(AtomicBool::new(true));

        let processor = Processor {
            state,
            commands: self.command_receiver.clone(),
            events: self.event_sender.clone(),
            output: input,
            running: running.clone(),
            block_size: self.desc.block_size,
            max_wait: self.desc.output_max_wait,
            finished: Vec::with_capacity(self.desc.max_sources),
        };

        let handle = std::thread::Builder::new()
            .name("petalstream-processing".into())
            .spawn(move || processor.run())
            .map_err(|e| {
                PetalStreamError::Engine(format!("Failed to spawn processing thread: {}", e))
            })?;

        self.processing = Some(ProcessingThread { running, handle });
        log::info!(
            "Engine started ({} Hz, {} frames per block)",
            self.desc.sample_rate,
            self.desc.block_size
        );
        Ok(output)
    }

    fn join_processing(&mut self) {
        let Some(processing) = self.processing.take() else {
            return;
        };
        processing.running.store(false, Ordering::Release);
        match processing.handle.join() {
            Ok(state) => self.mix_state = Some(state),
            Err(_) => {
                log::error!("Processing thread panicked, active sounds are lost");
                let _ = self.event_sender.try_send(PetalStreamEvent::EngineError {
                    error: "Processing thread panicked".into(),
                });
            }
        }
        log::info!("Engine stopped");
    }

    /// Returns the cached asset for `uri`, starting a background load on first use.
    pub fn load_audio_asset(&self, uri: &str, policy: StreamingPolicy) -> Arc<AudioAsset> {
        self.registry.create_asset(uri, policy)
    }

    pub fn find_audio_asset(&self, key: AssetKey) -> Option<Arc<AudioAsset>> {
        self.registry.find_asset(key)
    }

    pub fn unload_audio_asset(&self, key: AssetKey) -> bool {
        self.registry.unload_asset(key)
    }

    /// Prepares a paused sound for `asset`. Blocks until the asset has loaded.
    ///
    /// Call [`resume_sound`](Self::resume_sound) to start it.
    pub fn prepare_sound(
        &self,
        asset: &Arc<AudioAsset>,
        params: SoundPlaybackParams,
    ) -> Result<SourceId> {
        self.add_sound(asset, params, false)
    }

    /// Prepares a sound for `asset` and starts it on the next processing tick.
    pub fn play_sound(
        &self,
        asset: &Arc<AudioAsset>,
        params: SoundPlaybackParams,
    ) -> Result<SourceId> {
        self.add_sound(asset, params, true)
    }

    fn add_sound(
        &self,
        asset: &Arc<AudioAsset>,
        params: SoundPlaybackParams,
        start: bool,
    ) -> Result<SourceId> {
        let playable = self.registry.get_asset_for_playback(asset).ok_or_else(|| {
            PetalStreamError::InvalidAsset(format!("'{}' cannot be played", asset.uri()))
        })?;

        let mut stream = AssetStream::new(playable, self.desc.speaker_profile())?;
        stream.initialize()?;
        let crossfade = params
            .loop_crossfade
            .unwrap_or(self.desc.default_loop_crossfade);
        stream.set_loop_crossfade_duration(crossfade.as_secs_f32());
        stream.enable_looping(params.looping);
        // Have something decoded before the first tick pulls from it.
        stream.service_prestock();

        let source_id = SourceId::from_raw(self.next_source_id.fetch_add(1, Ordering::Relaxed));
        let mut renderer =
            StreamRenderer::new(source_id, params.source, stream, self.desc.fade_out_buffers);
        renderer.set_volume(params.volume);

        self.sounds().insert(source_id);
        if let Err(e) = self.send(EngineCommand::AddRenderer {
            renderer: Box::new(renderer),
            start,
        }) {
            self.sounds().remove(&source_id);
            return Err(e);
        }
        log::debug!("Prepared {} for '{}'", source_id, asset.uri());
        Ok(source_id)
    }

    pub fn pause_sound(&self, source_id: SourceId) -> Result<()> {
        self.send_for(source_id, EngineCommand::Pause(source_id))
    }

    pub fn resume_sound(&self, source_id: SourceId) -> Result<()> {
        self.send_for(source_id, EngineCommand::Resume(source_id))
    }

    /// Fades the sound out and removes it; a `SourceStopped` event follows.
    pub fn stop_sound(&self, source_id: SourceId) -> Result<()> {
        self.send_for(source_id, EngineCommand::Stop(source_id))
    }

    /// Seeks to `seconds` from the start. Takes effect with the next decoded buffer.
    pub fn seek_sound(&self, source_id: SourceId, seconds: f32) -> Result<()> {
        self.send_for(source_id, EngineCommand::Seek(source_id, seconds))
    }

    pub fn set_sound_looping(&self, source_id: SourceId, looping: bool) -> Result<()> {
        self.send_for(source_id, EngineCommand::SetLooping(source_id, looping))
    }

    pub fn set_sound_volume(&self, source_id: SourceId, volume: f32) -> Result<()> {
        self.send_for(source_id, EngineCommand::SetVolume(source_id, volume))
    }

    pub fn set_sound_position(&self, source_id: SourceId, position: Vec3) -> Result<()> {
        self.send_for(source_id, EngineCommand::SetPosition(source_id, position))
    }

    pub fn set_listener_pose(&self, pose: Pose) -> Result<()> {
        self.send(EngineCommand::SetListenerPose(pose))
    }

    pub fn set_master_volume(&self, volume: f32) -> Result<()> {
        self.send(EngineCommand::SetMasterVolume(volume))
    }

    /// Number of sounds that were prepared and have not completed or stopped
    /// as of the last [`poll_events`](Self::poll_events).
    pub fn active_sound_count(&self) -> usize {
        self.sounds().len()
    }

    /// Drains pending events and forgets sounds that have ended.
    pub fn poll_events(&self) -> Vec<PetalStreamEvent> {
        let events: Vec<_> = self.event_receiver.try_iter().collect();
        let mut sounds = self.sounds();
        for event in events.iter().filter(|e| e.is_terminal()) {
            if let Some(source_id) = event.source_id() {
                sounds.remove(&source_id);
            }
        }
        events
    }

    fn send_for(&self, source_id: SourceId, command: EngineCommand) -> Result<()> {
        if !self.sounds().contains(&source_id) {
            return Err(PetalStreamError::Engine(format!(
                "{} is not an active sound",
                source_id
            )));
        }
        self.send(command)
    }

    fn send(&self, command: EngineCommand) -> Result<()> {
        self.command_sender
            .send(command)
            .map_err(|e| PetalStreamError::Engine(format!("Failed to send command: {:?}", e.0)))
    }

    fn sounds(&self) -> MutexGuard<'_, HashSet<SourceId>> {
        self.sounds.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PetalStreamEngine {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Body of the processing thread.
struct Processor {
    state: MixState,
    commands: Receiver<EngineCommand>,
    events: Sender<PetalStreamEvent>,
    output: MixInput,
    running: Arc<AtomicBool>,
    block_size: usize,
    max_wait: Duration,
    finished: Vec<SourceId>,
}

impl Processor {
    fn run(mut self) -> MixState {
        if let Err(e) = self.state.manager.start() {
            log::error!("Stream manager failed to start: {}", e);
            self.emit(PetalStreamEvent::EngineError {
                error: e.to_string(),
            });
        }
        self.emit(PetalStreamEvent::EngineStarted);

        // A block the output queue had no room for is retried before mixing another.
        let mut unsent: Option<AudioBuffer> = None;
        while self.running.load(Ordering::Acquire) {
            self.apply_commands();

            let block = match unsent.take() {
                Some(block) => block,
                None => self.tick(),
            };
            match self.output.blocks.send_timeout(block, self.max_wait) {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(block)) => unsent = Some(block),
                Err(SendTimeoutError::Disconnected(_)) => {
                    log::info!("Mix output closed, processing thread exiting");
                    break;
                }
            }
        }

        self.state.manager.stop();
        self.emit(PetalStreamEvent::EngineStopped);
        self.state
    }

    fn tick(&mut self) -> AudioBuffer {
        let mut finished = std::mem::take(&mut self.finished);
        self.state
            .manager
            .render(self.state.sink.as_mut(), &mut finished);
        for source_id in finished.drain(..) {
            self.retire(source_id);
        }
        self.finished = finished;

        let mut block = self
            .output
            .recycled
            .try_recv()
            .unwrap_or_else(|_| AudioBuffer::new(MIX_CHANNELS, self.block_size));
        block.copy_from(self.state.sink.process_next_buffer());
        block
    }

    fn retire(&mut self, source_id: SourceId) {
        let Some(renderer) = self.state.manager.remove_renderer(source_id) else {
            return;
        };
        self.state.sink.destroy_source(source_id);
        if renderer.is_marked_for_removal() {
            log::debug!("{} stopped", source_id);
            self.emit(PetalStreamEvent::SourceStopped { source_id });
        } else {
            log::debug!("{} completed", source_id);
            self.emit(PetalStreamEvent::SourceCompleted { source_id });
        }
    }

    fn apply_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            self.apply(command);
        }
    }

    fn apply(&mut self, command: EngineCommand) {
        let Self { state, events, .. } = self;
        let MixState { sink, manager } = state;
        match command {
            EngineCommand::AddRenderer { renderer, start } => {
                let mut renderer = *renderer;
                let source_id = renderer.source_id();
                if let Err(e) = sink.create_source(source_id, renderer.config()) {
                    log::error!("Failed to create mix source for {}: {}", source_id, e);
                    reject(events, source_id, e);
                    return;
                }
                if start {
                    renderer.resume();
                }
                if let Err(e) = manager.add_renderer(renderer) {
                    log::error!("{}", e);
                    sink.destroy_source(source_id);
                    reject(events, source_id, e);
                    return;
                }
                if start {
                    emit(events, PetalStreamEvent::SourceStarted { source_id });
                }
            }
            EngineCommand::Pause(source_id) => {
                if let Some(renderer) = manager.renderer_mut(source_id) {
                    renderer.pause();
                }
            }
            EngineCommand::Resume(source_id) => {
                if let Some(renderer) = manager.renderer_mut(source_id) {
                    if !renderer.is_marked_for_removal() {
                        renderer.resume();
                        emit(events, PetalStreamEvent::SourceStarted { source_id });
                    }
                }
            }
            EngineCommand::Stop(source_id) => {
                if let Some(renderer) = manager.renderer_mut(source_id) {
                    renderer.shutdown();
                }
            }
            EngineCommand::SetVolume(source_id, volume) => {
                if let Some(renderer) = manager.renderer_mut(source_id) {
                    renderer.set_volume(volume);
                }
            }
            EngineCommand::Seek(source_id, seconds) => {
                if let Some(renderer) = manager.renderer_mut(source_id) {
                    if !renderer.seek(seconds) {
                        log::warn!("{} rejected seek to {}s", source_id, seconds);
                    }
                }
            }
            EngineCommand::SetLooping(source_id, looping) => {
                if let Some(renderer) = manager.renderer_mut(source_id) {
                    renderer.set_looping(looping);
                }
            }
            EngineCommand::SetPosition(source_id, position) => {
                if let Some(renderer) = manager.renderer_mut(source_id) {
                    if renderer.set_position(position) {
                        sink.set_source_position(source_id, position);
                    }
                }
            }
            EngineCommand::SetListenerPose(pose) => sink.set_listener_pose(pose),
            EngineCommand::SetMasterVolume(volume) => sink.set_master_volume(volume),
        }
    }

    fn emit(&self, event: PetalStreamEvent) {
        emit(&self.events, event);
    }
}

fn emit(events: &Sender<PetalStreamEvent>, event: PetalStreamEvent) {
    let _ = events.try_send(event);
}

/// A sound that never made it into the manager is reported as stopped.
fn reject(events: &Sender<PetalStreamEvent>, source_id: SourceId, error: PetalStreamError) {
    emit(
        events,
        PetalStreamEvent::EngineError {
            error: error.to_string(),
        },
    );
    emit(events, PetalStreamEvent::SourceStopped { source_id });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_data::{AudioReader, PcmReader};
    use std::time::Instant;

    fn tone_loader() -> Arc<dyn AssetLoader> {
        Arc::new(|uri: &str| -> Result<Box<dyn AudioReader>> {
            match uri {
                "mem://missing" => Err(PetalStreamError::AudioLoading("no such sound".into())),
                _ => Ok(Box::new(PcmReader::new(vec![0.5; 2000], 1, 8000))),
            }
        })
    }

    fn headless_engine() -> PetalStreamEngine {
        let desc = PetalStreamDesc::default()
            .with_sample_rate(8000)
            .with_block_size(256)
            .with_max_sources(8)
            .with_output_max_wait(Duration::from_millis(20));
        let sink = Box::new(StereoMixer::new(desc.block_size, desc.max_sources));
        PetalStreamEngine::with_sink_and_loader(desc, sink, tone_loader()).unwrap()
    }

    /// Pulls mixed audio until an event matching `done` arrives.
    fn drive_until<F>(
        engine: &PetalStreamEngine,
        output: &mut MixOutput,
        mut done: F,
    ) -> Vec<PetalStreamEvent>
    where
        F: FnMut(&PetalStreamEvent) -> bool,
    {
        let mut seen = Vec::new();
        let mut block = vec![0.0; 256 * output.channels()];
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            assert!(Instant::now() < deadline, "timed out, saw {:?}", seen);
            output.fill_interleaved(&mut block);
            let events = engine.poll_events();
            let hit = events.iter().any(&mut done);
            seen.extend(events);
            if hit {
                return seen;
            }
        }
    }

    #[test]
    fn test_streamed_sound_completes() {
        let mut engine = headless_engine();
        let mut output = engine.start_without_device().unwrap();
        assert!(engine.start_without_device().is_err());

        let asset = engine.load_audio_asset("mem://tone", StreamingPolicy::StreamAndClose);
        let id = engine
            .play_sound(&asset, SoundPlaybackParams::default())
            .unwrap();
        assert_eq!(engine.active_sound_count(), 1);

        let events = drive_until(&engine, &mut output, |e| {
            *e == PetalStreamEvent::SourceCompleted { source_id: id }
        });
        assert!(events.contains(&PetalStreamEvent::EngineStarted));
        assert!(events.contains(&PetalStreamEvent::SourceStarted { source_id: id }));
        assert_eq!(engine.active_sound_count(), 0);
        assert!(engine.pause_sound(id).is_err());

        engine.stop().unwrap();
        assert!(!engine.is_running());
        assert!(
            engine
                .poll_events()
                .contains(&PetalStreamEvent::EngineStopped)
        );
    }

    #[test]
    fn test_stopping_a_looping_sound() {
        let mut engine = headless_engine();
        let mut output = engine.start_without_device().unwrap();

        let asset = engine.load_audio_asset("mem://loop", StreamingPolicy::PreloadIntoMemory);
        let id = engine
            .play_sound(&asset, SoundPlaybackParams::default().with_looping(true))
            .unwrap();

        let mut block = vec![0.0; 256 * output.channels()];
        let mut heard = false;
        for _ in 0..20 {
            output.fill_interleaved(&mut block);
            heard |= block.iter().any(|s| *s != 0.0);
        }
        assert!(heard);

        engine.stop_sound(id).unwrap();
        let events = drive_until(&engine, &mut output, |e| {
            *e == PetalStreamEvent::SourceStopped { source_id: id }
        });
        assert!(!events.contains(&PetalStreamEvent::SourceCompleted { source_id: id }));
        engine.stop().unwrap();
    }

    #[test]
    fn test_prepared_sound_waits_for_resume() {
        let mut engine = headless_engine();
        let asset = engine.load_audio_asset("mem://later", StreamingPolicy::PreloadIntoMemory);
        let id = engine
            .prepare_sound(&asset, SoundPlaybackParams::default())
            .unwrap();

        let mut output = engine.start_without_device().unwrap();
        let mut block = vec![0.0; 256 * output.channels()];
        for _ in 0..4 {
            output.fill_interleaved(&mut block);
            assert!(block.iter().all(|s| *s == 0.0));
        }
        assert!(
            !engine
                .poll_events()
                .contains(&PetalStreamEvent::SourceStarted { source_id: id })
        );

        engine.resume_sound(id).unwrap();
        drive_until(&engine, &mut output, |e| {
            *e == PetalStreamEvent::SourceCompleted { source_id: id }
        });
        engine.stop().unwrap();
    }

    #[test]
    fn test_invalid_asset_cannot_play() {
        let engine = headless_engine();
        let asset = engine.load_audio_asset("mem://missing", StreamingPolicy::StreamAndClose);
        assert!(matches!(
            engine.play_sound(&asset, SoundPlaybackParams::default()),
            Err(PetalStreamError::InvalidAsset(_))
        ));
        assert_eq!(engine.active_sound_count(), 0);
    }

    #[test]
    fn test_unknown_sound_rejected() {
        let engine = headless_engine();
        let ghost = SourceId::from_raw(42);
        assert!(engine.stop_sound(ghost).is_err());
        assert!(engine.seek_sound(ghost, 1.0).is_err());
        assert!(engine.set_master_volume(0.5).is_ok());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let desc = PetalStreamDesc::default().with_block_size(0);
        assert!(PetalStreamEngine::new(desc).is_err());
    }
}
