//! Bridge from one [`AssetStream`] to the mixing sink.

use crate::config::SourceConfig;
use crate::manager::PrestockJob;
use crate::math::Vec3;
use crate::playback::{PlayState, SourceId};
use crate::spatial::SpatialAudioSink;
use crate::stream::{AssetStream, NextBuffer};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// What a single [`StreamRenderer::render`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStatus {
    /// A buffer was handed to the sink
    Rendered,
    /// Paused, or still underrunning after an already reported underrun
    Idle,
    /// The stream had no buffer ready; reported once per underrun stretch
    Underrun,
    /// The stream ended or a shutdown finished fading out
    Finished,
}

impl RenderStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished)
    }
}

/// Feeds a stream's buffers into one sink source, handling pause fades,
/// volume and removal.
///
/// Owned and driven by the processing thread. Only the prestock-pending flag
/// is shared with the decode side.
pub struct StreamRenderer {
    source_id: SourceId,
    config: SourceConfig,
    stream: AssetStream,
    state: PlayState,
    fade_out_buffers: usize,
    fade_out_countdown: usize,
    volume: f32,
    render_volume: f32,
    sent_volume: Option<f32>,
    marked_for_removal: bool,
    prestock_pending: Arc<AtomicBool>,
    underrunning: bool,
    underruns: u64,
}

impl StreamRenderer {
    /// Wraps an initialized stream. The renderer starts paused.
    pub fn new(
        source_id: SourceId,
        config: SourceConfig,
        stream: AssetStream,
        fade_out_buffers: usize,
    ) -> Self {
        Self {
            source_id,
            config,
            stream,
            state: PlayState::Paused,
            fade_out_buffers,
            fade_out_countdown: 0,
            volume: 1.0,
            render_volume: 0.0,
            sent_volume: None,
            marked_for_removal: false,
            prestock_pending: Arc::new(AtomicBool::new(false)),
            underrunning: false,
            underruns: 0,
        }
    }

    pub fn source_id(&self) -> SourceId {
        self.source_id
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    pub fn state(&self) -> PlayState {
        self.state
    }

    pub fn stream(&self) -> &AssetStream {
        &self.stream
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn underrun_count(&self) -> u64 {
        self.underruns
    }

    pub fn is_marked_for_removal(&self) -> bool {
        self.marked_for_removal
    }

    pub fn resume(&mut self) {
        if self.marked_for_removal {
            return;
        }
        log::debug!(
            "Source {} resuming at frame {}",
            self.source_id,
            self.stream.playhead_position()
        );
        self.state = PlayState::Playing;
        self.render_volume = self.volume;
        self.fade_out_countdown = 0;
    }

    /// Ramps the volume to zero and stops pulling buffers once the fade-out
    /// countdown has run.
    pub fn pause(&mut self) {
        if self.state != PlayState::Playing {
            return;
        }
        log::debug!(
            "Source {} pausing at frame {}",
            self.source_id,
            self.stream.playhead_position()
        );
        self.render_volume = 0.0;
        self.fade_out_countdown = self.fade_out_buffers;
        self.state = if self.fade_out_countdown == 0 {
            PlayState::Paused
        } else {
            PlayState::FadingOut
        };
    }

    /// Pauses and marks the renderer for removal once the fade-out has drained.
    pub fn shutdown(&mut self) {
        self.pause();
        self.marked_for_removal = true;
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.max(0.0);
        if self.state == PlayState::Playing {
            self.render_volume = self.volume;
        }
    }

    pub fn seek(&mut self, seconds: f32) -> bool {
        self.underrunning = false;
        self.stream.seek(seconds)
    }

    pub fn set_looping(&mut self, looping: bool) {
        self.stream.enable_looping(looping);
    }

    /// Updates the stored position. Non-spatial renderers ignore it.
    pub fn set_position(&mut self, position: Vec3) -> bool {
        if !self.config.is_spatial() {
            return false;
        }
        self.config = SourceConfig::spatial(position);
        true
    }

    /// Pulls the next buffer from the stream and hands it to the sink.
    pub fn render(&mut self, sink: &mut dyn SpatialAudioSink) -> RenderStatus {
        if self.state == PlayState::Paused {
            return if self.marked_for_removal {
                RenderStatus::Finished
            } else {
                RenderStatus::Idle
            };
        }

        if self.sent_volume != Some(self.render_volume) {
            sink.set_source_volume(self.source_id, self.render_volume);
            self.sent_volume = Some(self.render_volume);
        }

        let status = match self.stream.get_next_buffer() {
            NextBuffer::Ready(buffer) => {
                sink.set_planar_buffer(self.source_id, buffer);
                self.underrunning = false;
                RenderStatus::Rendered
            }
            NextBuffer::Underrun => {
                self.underruns += 1;
                if std::mem::replace(&mut self.underrunning, true) {
                    RenderStatus::Idle
                } else {
                    RenderStatus::Underrun
                }
            }
            NextBuffer::Finished => return RenderStatus::Finished,
        };

        if self.state == PlayState::FadingOut {
            self.fade_out_countdown = self.fade_out_countdown.saturating_sub(1);
            if self.fade_out_countdown == 0 {
                self.state = PlayState::Paused;
                log::debug!("Source {} paused", self.source_id);
            }
        }

        status
    }

    /// True if the stream wants a refill and no refill is queued yet.
    pub fn is_prestock_service_needed(&self) -> bool {
        !self.prestock_pending.load(Ordering::Acquire) && self.stream.is_prestock_service_needed()
    }

    pub fn set_prestock_service_pending(&self, pending: bool) {
        self.prestock_pending.store(pending, Ordering::Release);
    }

    pub fn is_prestock_service_pending(&self) -> bool {
        self.prestock_pending.load(Ordering::Acquire)
    }

    /// Builds a refill job for the decode pool and marks the renderer pending.
    ///
    /// Returns `None` for in-memory streams or when a job is already queued.
    pub fn prestock_job(&self) -> Option<PrestockJob> {
        let service = self.stream.prestock_service()?;
        if self.prestock_pending.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(PrestockJob::new(
            self.source_id,
            service,
            self.prestock_pending.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::{AudioAsset, StreamingPolicy};
    use crate::audio_data::{PcmReader, PlanarAudioBuffer};
    use crate::config::SpeakerProfile;
    use crate::spatial::StereoMixer;

    fn memory_renderer(frames: usize) -> StreamRenderer {
        let data = PlanarAudioBuffer::from_channels(vec![vec![0.5; frames]]).unwrap();
        let asset = AudioAsset::from_planar("mem://tone", Arc::new(data));
        let mut stream = AssetStream::new(asset, SpeakerProfile::new(8000, 64, 2)).unwrap();
        stream.initialize().unwrap();
        StreamRenderer::new(SourceId::from_raw(1), SourceConfig::NonSpatial, stream, 4)
    }

    fn mixer_for(renderer: &StreamRenderer) -> StereoMixer {
        let mut mixer = StereoMixer::new(64, 4);
        mixer
            .create_source(renderer.source_id(), renderer.config())
            .unwrap();
        mixer
    }

    #[test]
    fn test_new_renderer_is_paused() {
        let mut renderer = memory_renderer(1024);
        let mut mixer = mixer_for(&renderer);
        assert_eq!(renderer.state(), PlayState::Paused);
        assert_eq!(renderer.render(&mut mixer), RenderStatus::Idle);
        assert_eq!(renderer.stream().playhead_position(), 0);
    }

    #[test]
    fn test_pause_fades_out_then_stops_pulling() {
        let mut renderer = memory_renderer(4096);
        let mut mixer = mixer_for(&renderer);
        renderer.resume();
        assert_eq!(renderer.render(&mut mixer), RenderStatus::Rendered);
        assert!(!mixer.process_next_buffer().is_silent());

        renderer.pause();
        assert_eq!(renderer.state(), PlayState::FadingOut);
        for _ in 0..4 {
            assert_eq!(renderer.render(&mut mixer), RenderStatus::Rendered);
            mixer.process_next_buffer();
        }
        assert_eq!(renderer.state(), PlayState::Paused);
        let position = renderer.stream().playhead_position();
        assert_eq!(position, 5 * 64);

        assert_eq!(renderer.render(&mut mixer), RenderStatus::Idle);
        assert_eq!(renderer.stream().playhead_position(), position);

        renderer.resume();
        assert_eq!(renderer.render(&mut mixer), RenderStatus::Rendered);
        assert!(!mixer.process_next_buffer().is_silent());
    }

    #[test]
    fn test_shutdown_finishes_after_fade() {
        let mut renderer = memory_renderer(4096);
        let mut mixer = mixer_for(&renderer);
        renderer.resume();
        renderer.shutdown();
        assert!(renderer.is_marked_for_removal());

        let mut ticks = 0;
        while !renderer.render(&mut mixer).is_finished() {
            ticks += 1;
            assert!(ticks <= 4);
        }
        assert_eq!(ticks, 4);

        // A renderer on its way out cannot be resumed.
        renderer.resume();
        assert!(renderer.render(&mut mixer).is_finished());
    }

    #[test]
    fn test_finishes_at_end_of_stream() {
        let mut renderer = memory_renderer(100);
        let mut mixer = mixer_for(&renderer);
        renderer.resume();
        assert_eq!(renderer.render(&mut mixer), RenderStatus::Rendered);
        assert_eq!(renderer.render(&mut mixer), RenderStatus::Rendered);
        assert_eq!(renderer.render(&mut mixer), RenderStatus::Finished);
    }

    #[test]
    fn test_underrun_reported_once_per_stretch() {
        let asset = AudioAsset::from_reader(
            "mem://streamed",
            StreamingPolicy::StreamAndClose,
            Box::new(PcmReader::new(vec![0.25; 256], 1, 8000)),
        );
        let mut stream = AssetStream::new(asset, SpeakerProfile::new(8000, 64, 2)).unwrap();
        stream.initialize().unwrap();
        let mut renderer =
            StreamRenderer::new(SourceId::from_raw(2), SourceConfig::NonSpatial, stream, 4);
        let mut mixer = mixer_for(&renderer);
        renderer.resume();

        // Nothing has been decoded yet.
        assert_eq!(renderer.render(&mut mixer), RenderStatus::Underrun);
        assert_eq!(renderer.render(&mut mixer), RenderStatus::Idle);
        assert_eq!(renderer.underrun_count(), 2);

        let job = renderer.prestock_job().unwrap();
        assert!(renderer.prestock_job().is_none());
        assert!(!renderer.is_prestock_service_needed());
        job.run(&AtomicBool::new(false));
        assert!(!renderer.is_prestock_service_pending());

        for _ in 0..4 {
            assert_eq!(renderer.render(&mut mixer), RenderStatus::Rendered);
        }
        assert_eq!(renderer.render(&mut mixer), RenderStatus::Finished);
    }

    #[test]
    fn test_memory_renderer_needs_no_prestock() {
        let renderer = memory_renderer(256);
        assert!(!renderer.is_prestock_service_needed());
        assert!(renderer.prestock_job().is_none());
        assert!(!renderer.is_prestock_service_pending());
    }

    #[test]
    fn test_position_only_for_spatial_sources() {
        let mut renderer = memory_renderer(256);
        assert!(!renderer.set_position(Vec3::ONE));
        assert_eq!(renderer.config(), &SourceConfig::NonSpatial);
    }
}
