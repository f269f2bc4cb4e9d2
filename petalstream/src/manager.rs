//! Per-tick rendering of all streams plus dispatch of decode work.

use crate::error::{PetalStreamError, Result};
use crate::events::PetalStreamEvent;
use crate::playback::SourceId;
use crate::pool::DecodeThreadPool;
use crate::renderer::{RenderStatus, StreamRenderer};
use crate::spatial::SpatialAudioSink;
use crate::stream::PrestockService;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

/// One queued refill of a stream's stock FIFO.
///
/// Clears the renderer's pending flag when dropped, whether it ran or was
/// discarded, so a renderer can never be stuck waiting on a lost job.
pub struct PrestockJob {
    source_id: SourceId,
    service: Arc<PrestockService>,
    pending: Arc<AtomicBool>,
}

impl PrestockJob {
    pub fn new(
        source_id: SourceId,
        service: Arc<PrestockService>,
        pending: Arc<AtomicBool>,
    ) -> Self {
        Self {
            source_id,
            service,
            pending,
        }
    }

    pub fn source_id(&self) -> SourceId {
        self.source_id
    }

    /// Refills the stream, returning early between buffers once `stop` is set.
    pub fn run(self, stop: &AtomicBool) {
        self.service.service_prestock_until(stop);
    }
}

impl Drop for PrestockJob {
    fn drop(&mut self) {
        self.pending.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for PrestockJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrestockJob")
            .field("source_id", &self.source_id)
            .finish()
    }
}

/// Owns every active [`StreamRenderer`] and keeps their streams stocked.
///
/// `render` runs once per processing tick. Streams that need decoding are
/// queued on a bounded dispatch FIFO; a dispatch thread hands queued jobs to
/// idle workers of a [`DecodeThreadPool`] that it owns.
pub struct StreamManager {
    renderers: Vec<StreamRenderer>,
    max_renderers: usize,
    decode_threads: usize,
    job_tx: Sender<PrestockJob>,
    job_rx: Receiver<PrestockJob>,
    shutdown_tx: Option<Sender<()>>,
    dispatch_thread: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    events: Option<Sender<PetalStreamEvent>>,
}

impl StreamManager {
    /// The dispatch FIFO holds one job per possible renderer.
    pub fn new(max_renderers: usize, decode_threads: usize) -> Self {
        let (job_tx, job_rx) = crossbeam_channel::bounded(max_renderers.max(1));
        Self {
            renderers: Vec::with_capacity(max_renderers),
            max_renderers,
            decode_threads,
            job_tx,
            job_rx,
            shutdown_tx: None,
            dispatch_thread: None,
            stop: Arc::new(AtomicBool::new(false)),
            events: None,
        }
    }

    /// Reports underruns and dispatch overflows on `events`.
    pub fn with_events(mut self, events: Sender<PetalStreamEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn is_running(&self) -> bool {
        self.dispatch_thread.is_some()
    }

    /// Spawns the decode pool and the dispatch thread.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        self.stop.store(false, Ordering::Release);
        let pool = DecodeThreadPool::new(self.decode_threads, self.stop.clone())?;

        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);
        let job_rx = self.job_rx.clone();
        let handle = std::thread::Builder::new()
            .name("petalstream-dispatch".into())
            .spawn(move || dispatch_loop(pool, job_rx, shutdown_rx))
            .map_err(|e| {
                PetalStreamError::Engine(format!("Failed to spawn dispatch thread: {}", e))
            })?;

        self.shutdown_tx = Some(shutdown_tx);
        self.dispatch_thread = Some(handle);
        log::info!(
            "Stream manager started with {} decode threads",
            self.decode_threads
        );
        Ok(())
    }

    /// Joins the dispatch thread (which shuts the pool down) and discards
    /// still-queued jobs, clearing their pending flags.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.shutdown_tx.take();
        if let Some(handle) = self.dispatch_thread.take() {
            if handle.join().is_err() {
                log::error!("Dispatch thread panicked");
            }
        }

        let discarded = self.job_rx.try_iter().count();
        if discarded > 0 {
            log::debug!("Discarded {} queued prestock jobs", discarded);
        }
    }

    /// Registers a renderer. Fails when the manager is full.
    pub fn add_renderer(&mut self, renderer: StreamRenderer) -> Result<()> {
        if self.renderers.len() >= self.max_renderers {
            return Err(PetalStreamError::Engine(format!(
                "Cannot add {}: {} renderers already active",
                renderer.source_id(),
                self.max_renderers
            )));
        }
        self.renderers.push(renderer);
        Ok(())
    }

    pub fn remove_renderer(&mut self, source_id: SourceId) -> Option<StreamRenderer> {
        let index = self
            .renderers
            .iter()
            .position(|r| r.source_id() == source_id)?;
        Some(self.renderers.swap_remove(index))
    }

    pub fn renderer_mut(&mut self, source_id: SourceId) -> Option<&mut StreamRenderer> {
        self.renderers
            .iter_mut()
            .find(|r| r.source_id() == source_id)
    }

    pub fn len(&self) -> usize {
        self.renderers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.renderers.is_empty()
    }

    /// Number of prestock jobs waiting for a worker.
    pub fn queued_jobs(&self) -> usize {
        self.job_rx.len()
    }

    /// Renders every renderer once and queues decode work where needed.
    ///
    /// Renderers that finished are appended to `finished`; removing them is
    /// left to the caller.
    pub fn render(&mut self, sink: &mut dyn SpatialAudioSink, finished: &mut Vec<SourceId>) {
        let dispatching = self.is_running();
        for renderer in &mut self.renderers {
            if dispatching && renderer.is_prestock_service_needed() {
                if let Some(job) = renderer.prestock_job() {
                    match self.job_tx.try_send(job) {
                        Ok(()) => {}
                        // The rejected job is dropped here, which clears the pending flag.
                        Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                            log::warn!(
                                "Dispatch queue full, deferring prestock of {}",
                                renderer.source_id()
                            );
                            Self::emit(
                                &self.events,
                                PetalStreamEvent::DispatchOverflow {
                                    source_id: renderer.source_id(),
                                },
                            );
                        }
                    }
                }
            }

            match renderer.render(sink) {
                RenderStatus::Finished => finished.push(renderer.source_id()),
                RenderStatus::Underrun => Self::emit(
                    &self.events,
                    PetalStreamEvent::BufferUnderrun {
                        source_id: renderer.source_id(),
                    },
                ),
                RenderStatus::Rendered | RenderStatus::Idle => {}
            }
        }
    }

    fn emit(events: &Option<Sender<PetalStreamEvent>>, event: PetalStreamEvent) {
        if let Some(events) = events {
            let _ = events.try_send(event);
        }
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dispatch_loop(
    mut pool: DecodeThreadPool,
    jobs: Receiver<PrestockJob>,
    shutdown: Receiver<()>,
) {
    loop {
        let worker = crossbeam_channel::select! {
            recv(pool.idle_workers()) -> worker => match worker {
                Ok(worker) => worker,
                Err(_) => break,
            },
            recv(shutdown) -> _ => break,
        };
        let job = crossbeam_channel::select! {
            recv(jobs) -> job => match job {
                Ok(job) => job,
                Err(_) => break,
            },
            recv(shutdown) -> _ => break,
        };
        pool.assign(worker, job);
    }
    pool.shutdown();
    log::debug!("Dispatch thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::{AudioAsset, StreamingPolicy};
    use crate::audio_data::PcmReader;
    use crate::config::{SourceConfig, SpeakerProfile};
    use crate::spatial::StereoMixer;
    use crate::stream::AssetStream;
    use std::time::{Duration, Instant};

    fn streaming_renderer(id: u64, frames: usize) -> StreamRenderer {
        let asset = AudioAsset::from_reader(
            format!("mem://{}", id),
            StreamingPolicy::StreamAndClose,
            Box::new(PcmReader::new(vec![0.2; frames], 1, 8000)),
        );
        let mut stream = AssetStream::new(asset, SpeakerProfile::new(8000, 64, 2)).unwrap();
        stream.initialize().unwrap();
        let mut renderer =
            StreamRenderer::new(SourceId::from_raw(id), SourceConfig::NonSpatial, stream, 4);
        renderer.resume();
        renderer
    }

    fn mixer_with(manager: &StreamManager, ids: &[u64]) -> StereoMixer {
        let mut mixer = StereoMixer::new(64, manager.max_renderers);
        for id in ids {
            mixer
                .create_source(SourceId::from_raw(*id), &SourceConfig::NonSpatial)
                .unwrap();
        }
        mixer
    }

    #[test]
    fn test_add_and_remove() {
        let mut manager = StreamManager::new(1, 1);
        manager.add_renderer(streaming_renderer(1, 256)).unwrap();
        assert!(manager.add_renderer(streaming_renderer(2, 256)).is_err());
        assert_eq!(manager.len(), 1);
        assert!(manager.renderer_mut(SourceId::from_raw(1)).is_some());
        assert!(manager.remove_renderer(SourceId::from_raw(1)).is_some());
        assert!(manager.remove_renderer(SourceId::from_raw(1)).is_none());
        assert!(manager.is_empty());
    }

    #[test]
    fn test_streams_play_to_completion() {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let mut manager = StreamManager::new(4, 2).with_events(events_tx);
        manager.start().unwrap();
        manager.add_renderer(streaming_renderer(1, 640)).unwrap();
        manager.add_renderer(streaming_renderer(2, 320)).unwrap();
        let mut mixer = mixer_with(&manager, &[1, 2]);

        let mut finished = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while finished.len() < 2 {
            assert!(Instant::now() < deadline, "streams never finished");
            let mut done = Vec::new();
            manager.render(&mut mixer, &mut done);
            mixer.process_next_buffer();
            for id in done {
                manager.remove_renderer(id);
                finished.push(id);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        finished.sort();
        assert_eq!(finished, vec![SourceId::from_raw(1), SourceId::from_raw(2)]);
        assert!(
            events_rx
                .try_iter()
                .all(|e| matches!(e, PetalStreamEvent::BufferUnderrun { .. }))
        );
        manager.stop();
    }

    #[test]
    fn test_overflow_leaves_renderer_unmarked() {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let mut manager = StreamManager::new(1, 1).with_events(events_tx);
        // Occupy the only dispatch slot so the next job cannot be queued.
        let blocker = streaming_renderer(99, 64);
        manager.job_tx.try_send(blocker.prestock_job().unwrap()).unwrap();
        // Pretend the dispatcher is running without letting it drain the queue.
        manager.dispatch_thread = Some(std::thread::spawn(|| {}));

        manager.add_renderer(streaming_renderer(1, 256)).unwrap();
        let mut mixer = mixer_with(&manager, &[1]);
        let mut finished = Vec::new();
        manager.render(&mut mixer, &mut finished);

        let renderer = manager.renderer_mut(SourceId::from_raw(1)).unwrap();
        assert!(!renderer.is_prestock_service_pending());
        assert!(renderer.is_prestock_service_needed());
        assert!(events_rx.try_iter().any(|e| e
            == PetalStreamEvent::DispatchOverflow {
                source_id: SourceId::from_raw(1)
            }));

        assert!(blocker.is_prestock_service_pending());
        manager.stop();
        assert!(!blocker.is_prestock_service_pending());
        assert_eq!(manager.queued_jobs(), 0);
    }

    #[test]
    fn test_no_dispatch_while_stopped() {
        let mut manager = StreamManager::new(2, 1);
        manager.add_renderer(streaming_renderer(1, 256)).unwrap();
        let mut mixer = mixer_with(&manager, &[1]);
        let mut finished = Vec::new();
        manager.render(&mut mixer, &mut finished);
        assert_eq!(manager.queued_jobs(), 0);
        assert!(finished.is_empty());
    }
}
