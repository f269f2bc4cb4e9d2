use super::StreamShared;
use crate::asset::AudioAsset;
use crate::audio_data::{
    AudioBuffer, AudioReader, BufferPartitioner, PlanarAudioBuffer, StreamingResampler,
    read_next_buffer,
};
use ringbuf::{
    HeapCons, HeapProd,
    traits::{Consumer, Observer, Producer},
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Decode side of a streaming [`AssetStream`](super::AssetStream).
///
/// Owned jointly by the stream and by any prestock job queued for it. Only
/// decode threads lock the inner mutex, and they serialize on it, so the audio
/// thread never waits here.
pub struct PrestockService {
    shared: Arc<StreamShared>,
    decoder: Mutex<StreamDecoder>,
}

impl PrestockService {
    pub(super) fn new(shared: Arc<StreamShared>, decoder: StreamDecoder) -> Self {
        Self {
            shared,
            decoder: Mutex::new(decoder),
        }
    }

    /// Applies a pending seek, then decodes until the stock FIFO reaches its
    /// fill target or the reader runs out.
    pub fn service_prestock(&self) {
        self.service_prestock_until(&AtomicBool::new(false));
    }

    /// Like [`service_prestock`](Self::service_prestock), but returns early
    /// between buffers once `stop` is set.
    pub fn service_prestock_until(&self, stop: &AtomicBool) {
        let mut decoder = self.decoder.lock().unwrap_or_else(PoisonError::into_inner);
        decoder.service(&self.shared, stop);
    }
}

/// Decoded-buffer FIFO producer plus the return path for spent buffers.
pub(super) struct StockQueue {
    producer: HeapProd<AudioBuffer>,
    recycled: HeapCons<AudioBuffer>,
    num_channels: usize,
    frames_per_buffer: usize,
    capture: Option<PlanarAudioBuffer>,
    capture_complete: bool,
}

impl StockQueue {
    pub(super) fn new(
        producer: HeapProd<AudioBuffer>,
        recycled: HeapCons<AudioBuffer>,
        num_channels: usize,
        frames_per_buffer: usize,
        capture: bool,
    ) -> Self {
        Self {
            producer,
            recycled,
            num_channels,
            frames_per_buffer,
            capture: capture.then(|| PlanarAudioBuffer::new(num_channels)),
            capture_complete: false,
        }
    }

    fn len(&self) -> usize {
        self.producer.occupied_len()
    }

    fn take_buffer(&mut self) -> AudioBuffer {
        self.recycled
            .try_pop()
            .unwrap_or_else(|| AudioBuffer::new(self.num_channels, self.frames_per_buffer))
    }

    /// Queues `buffer` for playback. Only its first `valid_frames` frames are
    /// kept when capturing; the rest is end-of-stream padding.
    fn push(&mut self, buffer: AudioBuffer, valid_frames: usize) {
        if let Some(capture) = self.capture.as_mut() {
            if let Err(e) = capture.append_frames(&buffer, valid_frames) {
                log::warn!("Dropping stream capture: {}", e);
                self.capture = None;
            }
        }
        if self.producer.try_push(buffer).is_err() {
            log::warn!("Stock FIFO full, dropping a decoded buffer");
        }
    }

    /// Pushes a full buffer and hands back an empty one to keep filling.
    fn exchange(&mut self, full: AudioBuffer) -> AudioBuffer {
        self.push(full, self.frames_per_buffer);
        self.take_buffer()
    }

    fn exchange_partial(&mut self, padded: AudioBuffer, valid_frames: usize) -> AudioBuffer {
        self.push(padded, valid_frames);
        self.take_buffer()
    }

    fn complete_capture(&mut self) {
        if self.capture.is_some() {
            self.capture_complete = true;
        }
    }

    fn abandon_capture(&mut self) {
        if self.capture.take().is_some() {
            log::debug!("Looping stream will not be kept in memory");
        }
    }

    fn take_completed_capture(&mut self) -> Option<PlanarAudioBuffer> {
        if self.capture_complete {
            self.capture.take()
        } else {
            None
        }
    }
}

pub(super) struct ResampleStage {
    pub(super) resampler: StreamingResampler,
    pub(super) partitioner: BufferPartitioner,
    pub(super) input: AudioBuffer,
}

pub(super) struct StreamDecoder {
    asset: Arc<AudioAsset>,
    reader: Option<Box<dyn AudioReader>>,
    stock: StockQueue,
    resampling: Option<ResampleStage>,
    fill_target: usize,
}

impl StreamDecoder {
    pub(super) fn new(
        asset: Arc<AudioAsset>,
        reader: Box<dyn AudioReader>,
        stock: StockQueue,
        resampling: Option<ResampleStage>,
        fill_target: usize,
    ) -> Self {
        Self {
            asset,
            reader: Some(reader),
            stock,
            resampling,
            fill_target,
        }
    }

    fn service(&mut self, shared: &StreamShared, stop: &AtomicBool) {
        if shared.pending_seek.load(Ordering::SeqCst) {
            // End of stream goes first, or the stream could read as finished
            // between the two stores.
            shared.end_of_stream.store(false, Ordering::SeqCst);
            shared.pending_seek.store(false, Ordering::SeqCst);
            let target = shared.pending_seek_position.load(Ordering::Acquire);
            if let Some(reader) = self.reader.as_mut() {
                let actual = reader.seek_to_frame_position(target);
                if actual != target {
                    log::warn!("Seek to frame {} landed on frame {}", target, actual);
                }
            }
            if let Some(stage) = self.resampling.as_mut() {
                stage.resampler.reset();
                stage.partitioner.discard();
            }
        }

        while self.stock.len() < self.fill_target {
            if stop.load(Ordering::Relaxed) {
                return;
            }
            if !self.stock_next_buffer(shared) {
                return;
            }
        }
    }

    /// Decodes one reader chunk into the stock FIFO. Returns false when no
    /// more data will come until the stream is rewound.
    fn stock_next_buffer(&mut self, shared: &StreamShared) -> bool {
        let Self {
            reader,
            stock,
            resampling,
            ..
        } = self;
        let Some(reader) = reader.as_mut() else {
            return false;
        };

        if reader.is_at_end_of_stream() {
            if shared.looping.load(Ordering::Acquire) {
                stock.abandon_capture();
                if reader.seek_to_frame_position(0) != 0 {
                    log::error!("Could not loop back to the start of the stream");
                }
            } else {
                if shared.pending_seek.load(Ordering::Acquire) {
                    // A seek arrived; the next service call applies it.
                    return false;
                }
                if let Some(stage) = resampling.as_mut() {
                    let tail = stage.partitioner.pending_frames();
                    stage
                        .partitioner
                        .flush(|padded| stock.exchange_partial(padded, tail));
                }
                stock.complete_capture();
                shared.mark_end_of_stream();
                return false;
            }
        }

        match resampling.as_mut() {
            Some(stage) => {
                let frames = read_next_buffer(&mut **reader, &mut stage.input);
                if frames == 0 {
                    shared.mark_end_of_stream();
                    return false;
                }

                let output = match stage.resampler.process(stage.input.channels()) {
                    Ok(output) => output,
                    Err(e) => {
                        log::error!("Stopping stream: {}", e);
                        shared.mark_end_of_stream();
                        return false;
                    }
                };
                let produced = output.first().map_or(0, Vec::len);
                let expected = (frames as f64 * stage.resampler.ratio()).ceil() as usize;
                stage
                    .partitioner
                    .add_frames(&output, produced.min(expected), |full| stock.exchange(full));
            }
            None => {
                let mut buffer = stock.take_buffer();
                let frames = read_next_buffer(&mut **reader, &mut buffer);
                if frames == 0 {
                    log::warn!("Reader returned no frames before the end of the stream");
                    buffer.clear();
                }
                stock.push(buffer, frames);
            }
        }

        true
    }
}

impl Drop for StreamDecoder {
    fn drop(&mut self) {
        let Some(reader) = self.reader.take() else {
            return;
        };
        match self.stock.take_completed_capture() {
            Some(data) => self.asset.set_planar_data(Arc::new(data)),
            None => self.asset.return_reader(reader),
        }
    }
}
