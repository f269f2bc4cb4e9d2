//! Per-playback streams over an [`AudioAsset`].
//!
//! An [`AssetStream`] either plays straight out of decoded memory or, for
//! streamed assets, pulls buffers from a bounded FIFO that decode threads keep
//! stocked through its [`PrestockService`].
//!
//! Thread roles:
//! - `get_next_buffer`, `is_prestock_service_needed` and
//!   `end_of_stream_reached` run on the audio thread and never block or allocate
//! - `PrestockService::service_prestock` runs on a decode thread
//! - control calls (`seek`, `enable_looping`) may come from either

mod memory;
mod prestock;

pub use prestock::PrestockService;

use crate::asset::AudioAsset;
use crate::audio_data::{
    AudioBuffer, AudioReader, BufferPartitioner, PlanarAudioBuffer, StreamingResampler,
};
use crate::config::SpeakerProfile;
use crate::error::{PetalStreamError, Result};
use memory::MemoryPlayback;
use prestock::{ResampleStage, StockQueue, StreamDecoder};
use ringbuf::{
    HeapCons, HeapProd, HeapRb,
    traits::{Consumer, Observer, Producer, Split},
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Capacity of the decoded-buffer FIFO of a streaming asset.
pub const STOCK_FIFO_BUFFERS: usize = 64;

/// Loop crossfade applied to in-memory streams on initialization.
pub const DEFAULT_LOOP_CROSSFADE_SECONDS: f32 = 0.2;

/// Result of pulling the next buffer from a stream.
#[derive(Debug)]
pub enum NextBuffer<'a> {
    Ready(&'a AudioBuffer),
    /// No decoded data was ready in time; the stream continues
    Underrun,
    /// The stream played to its end
    Finished,
}

/// Which way an initialized stream produces buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamModeKind {
    Uninitialized,
    MemoryPlayback,
    FifoStreaming,
}

/// State shared between the audio side and the decode side of a stream.
pub(crate) struct StreamShared {
    looping: AtomicBool,
    end_of_stream: AtomicBool,
    pending_seek: AtomicBool,
    pending_seek_position: AtomicU64,
}

impl StreamShared {
    /// Flags the end of decoding unless a seek is waiting to rewind it.
    ///
    /// Pairs with the store order in [`AssetStream::seek`]: either the seek
    /// sees this store and clears it, or this sees the seek and backs out.
    pub(crate) fn mark_end_of_stream(&self) {
        self.end_of_stream.store(true, Ordering::SeqCst);
        if self.pending_seek.load(Ordering::SeqCst) {
            self.end_of_stream.store(false, Ordering::SeqCst);
        }
    }

    /// End of stream, unless a pending seek will bring more data.
    fn is_finished(&self) -> bool {
        self.end_of_stream.load(Ordering::SeqCst) && !self.pending_seek.load(Ordering::SeqCst)
    }
}

enum PendingSource {
    Reader(Box<dyn AudioReader>),
    Memory(Arc<PlanarAudioBuffer>),
}

struct FifoPlayback {
    stock: HeapCons<AudioBuffer>,
    recycle: HeapProd<AudioBuffer>,
    active: Option<AudioBuffer>,
    service: Arc<PrestockService>,
    fill_target: usize,
    source_sample_rate: u32,
    source_total_frames: u64,
    stream_into_memory: bool,
}

enum StreamMode {
    Uninitialized(Option<PendingSource>),
    Memory(MemoryPlayback),
    Fifo(FifoPlayback),
}

/// One playback's view of an asset.
///
/// Takes the asset's reader for its whole lifetime (or shares its decoded
/// data) and hands out fixed-size buffers of `frames_per_buffer` frames.
pub struct AssetStream {
    asset: Arc<AudioAsset>,
    profile: SpeakerProfile,
    num_channels: usize,
    shared: Arc<StreamShared>,
    mode: StreamMode,
    playhead: usize,
    total_frames: usize,
    stream_started: bool,
}

impl AssetStream {
    /// Claims the asset's reader, or its decoded data when loaded in memory.
    pub fn new(asset: Arc<AudioAsset>, profile: SpeakerProfile) -> Result<Self> {
        let source = match asset.acquire_reader() {
            Some(mut reader) => {
                if let Err(e) = reader.reset() {
                    asset.return_reader(reader);
                    return Err(e);
                }
                PendingSource::Reader(reader)
            }
            None => match asset.planar_data() {
                Some(data) => PendingSource::Memory(data),
                None => {
                    return Err(PetalStreamError::ReaderUnavailable(format!(
                        "Asset '{}' has neither an idle reader nor decoded data",
                        asset.uri()
                    )));
                }
            },
        };

        let num_channels = match &source {
            PendingSource::Reader(reader) => reader.num_channels(),
            PendingSource::Memory(data) => data.num_channels(),
        };

        Ok(Self {
            asset,
            profile,
            num_channels,
            shared: Arc::new(StreamShared {
                looping: AtomicBool::new(false),
                end_of_stream: AtomicBool::new(false),
                pending_seek: AtomicBool::new(false),
                pending_seek_position: AtomicU64::new(0),
            }),
            mode: StreamMode::Uninitialized(Some(source)),
            playhead: 0,
            total_frames: 0,
            stream_started: false,
        })
    }

    /// Chooses memory playback or FIFO streaming from what was claimed.
    ///
    /// Must be called once before the first buffer is pulled; later calls are no-ops.
    pub fn initialize(&mut self) -> Result<()> {
        let source = match &mut self.mode {
            StreamMode::Uninitialized(source) => source.take(),
            _ => return Ok(()),
        };

        match source {
            Some(PendingSource::Memory(data)) => {
                let mut memory = MemoryPlayback::new(data, self.profile.frames_per_buffer);
                memory.set_crossfade_seconds(
                    DEFAULT_LOOP_CROSSFADE_SECONDS,
                    self.profile.sample_rate_hz,
                );
                self.total_frames = memory.total_frames();
                self.mode = StreamMode::Memory(memory);
            }
            Some(PendingSource::Reader(reader)) => {
                let resampling = match self.build_resample_stage(&*reader) {
                    Ok(stage) => stage,
                    Err(e) => {
                        self.asset.return_reader(reader);
                        return Err(e);
                    }
                };
                let fifo = self.build_fifo(reader, resampling);
                self.total_frames = (fifo.source_total_frames as f64
                    * self.profile.sample_rate_hz as f64
                    / fifo.source_sample_rate.max(1) as f64)
                    .round() as usize;
                self.mode = StreamMode::Fifo(fifo);
            }
            None => {
                return Err(PetalStreamError::ReaderUnavailable(format!(
                    "Stream for '{}' has nothing to play",
                    self.asset.uri()
                )));
            }
        }

        log::debug!(
            "Stream for '{}' initialized as {:?} ({} frames)",
            self.asset.uri(),
            self.mode_kind(),
            self.total_frames
        );
        Ok(())
    }

    fn build_resample_stage(&self, reader: &dyn AudioReader) -> Result<Option<ResampleStage>> {
        let source_rate = reader.sample_rate_hz();
        if source_rate == self.profile.sample_rate_hz {
            return Ok(None);
        }

        let frames_per_buffer = self.profile.frames_per_buffer;
        let resampler = StreamingResampler::new(
            source_rate,
            self.profile.sample_rate_hz,
            self.num_channels,
            frames_per_buffer,
            Some(self.profile.resampler_type),
        )?;
        Ok(Some(ResampleStage {
            resampler,
            partitioner: BufferPartitioner::new(self.num_channels, frames_per_buffer),
            input: AudioBuffer::new(self.num_channels, frames_per_buffer),
        }))
    }

    fn build_fifo(
        &self,
        reader: Box<dyn AudioReader>,
        resampling: Option<ResampleStage>,
    ) -> FifoPlayback {
        let frames_per_buffer = self.profile.frames_per_buffer;

        // Repartitioned resampler output may push several buffers at once; keep
        // enough headroom that a full chunk always fits.
        let mut fill_target = STOCK_FIFO_BUFFERS;
        if let Some(stage) = &resampling {
            let burst = stage.resampler.output_frames_max().div_ceil(frames_per_buffer);
            fill_target = fill_target.saturating_sub(burst).max(1);
        }

        let (stock_producer, stock_consumer) =
            HeapRb::<AudioBuffer>::new(STOCK_FIFO_BUFFERS).split();
        let (recycle_producer, recycle_consumer) =
            HeapRb::<AudioBuffer>::new(STOCK_FIFO_BUFFERS + 4).split();

        let stream_into_memory = self.asset.should_stream_into_memory();
        let source_sample_rate = reader.sample_rate_hz();
        let source_total_frames = reader.total_frame_count();

        let stock = StockQueue::new(
            stock_producer,
            recycle_consumer,
            self.num_channels,
            frames_per_buffer,
            stream_into_memory,
        );
        let decoder =
            StreamDecoder::new(self.asset.clone(), reader, stock, resampling, fill_target);

        FifoPlayback {
            stock: stock_consumer,
            recycle: recycle_producer,
            active: None,
            service: Arc::new(PrestockService::new(self.shared.clone(), decoder)),
            fill_target,
            source_sample_rate,
            source_total_frames,
            stream_into_memory,
        }
    }

    /// Pulls the next buffer. Audio thread only.
    pub fn get_next_buffer(&mut self) -> NextBuffer<'_> {
        let looping = self.shared.looping.load(Ordering::Acquire);
        match &mut self.mode {
            StreamMode::Memory(memory) => {
                if self.shared.end_of_stream.load(Ordering::Acquire) {
                    return NextBuffer::Finished;
                }
                if memory.fill(&mut self.playhead, looping) {
                    self.shared.end_of_stream.store(true, Ordering::Release);
                }
                self.stream_started = true;
                NextBuffer::Ready(memory.output())
            }
            StreamMode::Fifo(fifo) => {
                if let Some(spent) = fifo.active.take() {
                    // The recycle ring has headroom for every buffer in flight.
                    let _ = fifo.recycle.try_push(spent);
                }

                // Read before popping: end of stream is only set after the
                // final buffers were pushed.
                let end_of_stream = self.shared.is_finished();
                match fifo.stock.try_pop() {
                    Some(buffer) => {
                        self.playhead += self.profile.frames_per_buffer;
                        if looping {
                            self.playhead = self.playhead.checked_rem(self.total_frames).unwrap_or(0);
                        }
                        self.stream_started = true;
                        NextBuffer::Ready(fifo.active.insert(buffer))
                    }
                    None if end_of_stream => NextBuffer::Finished,
                    None => {
                        if self.stream_started {
                            log::warn!(
                                "Stream underflow at play position {} of {}",
                                self.playhead,
                                self.total_frames
                            );
                        }
                        NextBuffer::Underrun
                    }
                }
            }
            StreamMode::Uninitialized(_) => NextBuffer::Finished,
        }
    }

    /// True when a decode thread should call [`service_prestock`](Self::service_prestock).
    pub fn is_prestock_service_needed(&self) -> bool {
        match &self.mode {
            StreamMode::Fifo(fifo) => {
                self.shared.pending_seek.load(Ordering::SeqCst)
                    || (!self.shared.end_of_stream.load(Ordering::SeqCst)
                        && fifo.stock.occupied_len() < fifo.fill_target)
            }
            _ => false,
        }
    }

    /// Refills the stock FIFO on the calling thread. No-op for memory playback.
    pub fn service_prestock(&self) {
        if let Some(service) = self.prestock_service() {
            service.service_prestock();
        }
    }

    /// Handle to the decode side, for running `service_prestock` on another thread.
    pub fn prestock_service(&self) -> Option<Arc<PrestockService>> {
        match &self.mode {
            StreamMode::Fifo(fifo) => Some(fifo.service.clone()),
            _ => None,
        }
    }

    /// Moves playback to `seconds` from the start, clamped to the asset length.
    ///
    /// In-memory streams jump immediately. Streamed playback jumps once the
    /// decode side next runs; buffers already queued still play first.
    /// Returns false for streams that are being captured into memory.
    pub fn seek(&mut self, seconds: f32) -> bool {
        if !seconds.is_finite() {
            return false;
        }
        let seconds = seconds.max(0.0) as f64;

        match &mut self.mode {
            StreamMode::Memory(memory) => {
                let frame = (seconds * self.profile.sample_rate_hz as f64) as usize;
                self.playhead = frame.min(memory.total_frames());
                self.shared.end_of_stream.store(false, Ordering::Release);
                true
            }
            StreamMode::Fifo(fifo) => {
                if fifo.stream_into_memory {
                    log::debug!(
                        "Seeking is disabled while '{}' streams into memory",
                        self.asset.uri()
                    );
                    return false;
                }
                let mut frame = (seconds * fifo.source_sample_rate as f64) as u64;
                if fifo.source_total_frames > 0 {
                    frame = frame.min(fifo.source_total_frames);
                }
                self.playhead = ((seconds * self.profile.sample_rate_hz as f64) as usize)
                    .min(self.total_frames.max(1) - 1);
                self.shared
                    .pending_seek_position
                    .store(frame, Ordering::Release);
                self.shared.pending_seek.store(true, Ordering::SeqCst);
                self.shared.end_of_stream.store(false, Ordering::SeqCst);
                true
            }
            StreamMode::Uninitialized(_) => false,
        }
    }

    pub fn enable_looping(&self, looping: bool) {
        self.shared.looping.store(looping, Ordering::Release);
    }

    pub fn is_looping(&self) -> bool {
        self.shared.looping.load(Ordering::Acquire)
    }

    /// Sets the in-memory loop crossfade; clamped to `[0, total_frames - 1]`.
    /// Streamed playback loops without a crossfade.
    pub fn set_loop_crossfade_duration(&mut self, seconds: f32) {
        if let StreamMode::Memory(memory) = &mut self.mode {
            memory.set_crossfade_seconds(seconds, self.profile.sample_rate_hz);
        }
    }

    pub fn crossfade_frames(&self) -> usize {
        match &self.mode {
            StreamMode::Memory(memory) => memory.crossfade_frames(),
            _ => 0,
        }
    }

    pub fn end_of_stream_reached(&self) -> bool {
        self.shared.is_finished()
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    /// Playback sample rate of the buffers this stream produces.
    pub fn sample_rate_hz(&self) -> u32 {
        self.profile.sample_rate_hz
    }

    pub fn frames_per_buffer(&self) -> usize {
        self.profile.frames_per_buffer
    }

    /// Current position in playback-rate frames.
    pub fn playhead_position(&self) -> usize {
        self.playhead
    }

    /// Asset length in playback-rate frames (0 before initialization).
    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    pub fn asset(&self) -> &Arc<AudioAsset> {
        &self.asset
    }

    pub fn mode_kind(&self) -> StreamModeKind {
        match &self.mode {
            StreamMode::Uninitialized(_) => StreamModeKind::Uninitialized,
            StreamMode::Memory(_) => StreamModeKind::MemoryPlayback,
            StreamMode::Fifo(_) => StreamModeKind::FifoStreaming,
        }
    }
}

impl Drop for AssetStream {
    fn drop(&mut self) {
        // Initialized streams hand the reader back when their decode side drops.
        if let StreamMode::Uninitialized(source) = &mut self.mode {
            if let Some(PendingSource::Reader(reader)) = source.take() {
                self.asset.return_reader(reader);
            }
        }
    }
}
