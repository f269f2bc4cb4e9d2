use super::{AudioReader, EncodingFormat};
use crate::error::{PetalStreamError, Result};
use std::fs::File;
use std::path::Path;
use symphonia::{
    core::{
        audio::SampleBuffer,
        codecs::{Decoder, DecoderOptions},
        errors::Error,
        formats::{FormatOptions, FormatReader, SeekMode, SeekTo},
        io::{MediaSource, MediaSourceStream},
        meta::MetadataOptions,
        probe::Hint,
    },
    default::{get_codecs, get_probe},
};

/// Incremental decoder backed by Symphonia.
///
/// Supports the formats enabled in Symphonia's default feature set (WAV, FLAC,
/// OGG/Vorbis, MP3 and others). Packets are decoded lazily as frames are
/// requested and handed out as interleaved little-endian f32 bytes.
pub struct SymphoniaReader {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    num_channels: usize,
    sample_rate: u32,
    total_frames: u64,
    position: u64,
    /// Decoded interleaved samples not yet handed out
    pending: Vec<f32>,
    pending_offset: usize,
    /// Frames to drop after a seek landed before the requested position
    skip_frames: u64,
    packets_exhausted: bool,
    bytes: Vec<u8>,
}

impl SymphoniaReader {
    /// Opens and probes an audio file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        Self::from_source(Box::new(file), hint)
    }

    /// Probes an arbitrary media source.
    pub fn from_source(source: Box<dyn MediaSource>, hint: Hint) -> Result<Self> {
        let mss = MediaSourceStream::new(source, Default::default());

        let probed = get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| {
                PetalStreamError::AudioLoading(format!("Failed to probe audio format: {:?}", e))
            })?;

        let format = probed.format;

        let track = format.default_track().ok_or_else(|| {
            PetalStreamError::AudioLoading("No default audio track found".to_string())
        })?;
        let track_id = track.id;
        let codec_params = track.codec_params.clone();

        let sample_rate = codec_params
            .sample_rate
            .ok_or_else(|| PetalStreamError::AudioLoading("Sample rate not found".to_string()))?;

        let num_channels = codec_params
            .channels
            .ok_or_else(|| PetalStreamError::AudioLoading("Channel count not found".to_string()))?
            .count();

        let total_frames = codec_params.n_frames.unwrap_or(0);

        let decoder = get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| {
                PetalStreamError::AudioLoading(format!("Failed to create decoder: {:?}", e))
            })?;

        log::debug!(
            "Opened audio track {}: {} channels, {} Hz, {} frames",
            track_id,
            num_channels,
            sample_rate,
            total_frames
        );

        Ok(Self {
            format,
            decoder,
            track_id,
            num_channels,
            sample_rate,
            total_frames,
            position: 0,
            pending: Vec::new(),
            pending_offset: 0,
            skip_frames: 0,
            packets_exhausted: false,
            bytes: Vec::new(),
        })
    }

    fn pending_frames(&self) -> usize {
        (self.pending.len() - self.pending_offset) / self.num_channels
    }

    /// Decodes the next packet of our track into `pending`.
    ///
    /// Returns `false` once the container has no more packets.
    fn decode_next_packet(&mut self) -> Result<bool> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(Error::IoError(_)) => {
                    self.packets_exhausted = true;
                    return Ok(false);
                }
                Err(e) => {
                    return Err(PetalStreamError::AudioLoading(format!(
                        "Error reading packet: {:?}",
                        e
                    )));
                }
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(Error::IoError(_)) => {
                    self.packets_exhausted = true;
                    return Ok(false);
                }
                Err(Error::DecodeError(e)) => {
                    log::debug!("Skipping corrupt packet: {}", e);
                    continue;
                }
                Err(e) => {
                    return Err(PetalStreamError::AudioLoading(format!(
                        "Error decoding packet: {:?}",
                        e
                    )));
                }
            };

            let spec = *decoded.spec();
            let mut tmp = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
            tmp.copy_interleaved_ref(decoded);

            self.pending.drain(..self.pending_offset);
            self.pending_offset = 0;
            self.pending.extend_from_slice(tmp.samples());
            return Ok(true);
        }
    }

    fn clear_pending(&mut self) {
        self.pending.clear();
        self.pending_offset = 0;
    }
}

impl AudioReader for SymphoniaReader {
    fn is_at_end_of_stream(&self) -> bool {
        if self.total_frames > 0 && self.position >= self.total_frames {
            return true;
        }
        self.packets_exhausted && self.pending_offset >= self.pending.len()
    }

    fn seek_to_frame_position(&mut self, frame: u64) -> u64 {
        if self.total_frames > 0 && frame >= self.total_frames {
            self.clear_pending();
            self.skip_frames = 0;
            self.position = self.total_frames;
            return self.position;
        }

        let seek_to = SeekTo::TimeStamp {
            ts: frame,
            track_id: self.track_id,
        };

        match self.format.seek(SeekMode::Accurate, seek_to) {
            Ok(seeked) => {
                self.decoder.reset();
                self.clear_pending();
                self.packets_exhausted = false;
                self.skip_frames = frame.saturating_sub(seeked.actual_ts);
                self.position = frame;
                frame
            }
            Err(e) => {
                log::warn!("Seek to frame {} failed: {:?}", frame, e);
                self.position
            }
        }
    }

    fn total_frame_count(&self) -> u64 {
        self.total_frames
    }

    fn num_channels(&self) -> usize {
        self.num_channels
    }

    fn sample_rate_hz(&self) -> u32 {
        self.sample_rate
    }

    fn encoding_format(&self) -> EncodingFormat {
        EncodingFormat::PcmF32
    }

    fn read_frames(&mut self, num_frames: usize) -> Result<&[u8]> {
        let mut wanted = num_frames as u64;
        if self.total_frames > 0 {
            wanted = wanted.min(self.total_frames.saturating_sub(self.position));
        }

        self.bytes.clear();
        let mut frames = 0u64;

        while frames < wanted {
            let available = self.pending_frames();
            if available == 0 {
                if self.packets_exhausted || !self.decode_next_packet()? {
                    break;
                }
                continue;
            }

            if self.skip_frames > 0 {
                let skip = (available as u64).min(self.skip_frames) as usize;
                self.pending_offset += skip * self.num_channels;
                self.skip_frames -= skip as u64;
                continue;
            }

            let take = (available as u64).min(wanted - frames) as usize;
            let end = self.pending_offset + take * self.num_channels;
            for sample in &self.pending[self.pending_offset..end] {
                self.bytes.extend_from_slice(&sample.to_le_bytes());
            }
            self.pending_offset = end;
            frames += take as u64;
        }

        self.position += frames;
        Ok(&self.bytes)
    }
}
