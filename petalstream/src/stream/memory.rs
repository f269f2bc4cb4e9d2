use crate::audio_data::{AudioBuffer, PlanarAudioBuffer};
use std::sync::Arc;

/// Playback straight out of a fully decoded asset.
pub(super) struct MemoryPlayback {
    data: Arc<PlanarAudioBuffer>,
    output: AudioBuffer,
    crossfade_frames: usize,
}

impl MemoryPlayback {
    pub(super) fn new(data: Arc<PlanarAudioBuffer>, frames_per_buffer: usize) -> Self {
        let output = AudioBuffer::new(data.num_channels(), frames_per_buffer);
        Self {
            data,
            output,
            crossfade_frames: 0,
        }
    }

    pub(super) fn total_frames(&self) -> usize {
        self.data.frame_count()
    }

    pub(super) fn crossfade_frames(&self) -> usize {
        self.crossfade_frames
    }

    /// Sets the loop crossfade, clamped so at least one frame stays outside the window.
    pub(super) fn set_crossfade_seconds(&mut self, seconds: f32, sample_rate: u32) {
        let total = self.total_frames();
        if total == 0 || !seconds.is_finite() || seconds <= 0.0 {
            self.crossfade_frames = 0;
            return;
        }
        let frames = (seconds as f64 * sample_rate as f64) as usize;
        self.crossfade_frames = frames.min(total - 1);
    }

    pub(super) fn output(&self) -> &AudioBuffer {
        &self.output
    }

    /// Renders the next buffer starting at `playhead` and advances it.
    ///
    /// Returns true once the end of a non-looping asset was reached; the
    /// rendered buffer is still valid in that case, zero-padded past the end.
    pub(super) fn fill(&mut self, playhead: &mut usize, looping: bool) -> bool {
        let total = self.total_frames();
        let frames_per_buffer = self.output.num_frames();
        if total == 0 {
            self.output.clear();
            return true;
        }

        let mut end_of_stream = false;
        let mut read = 0;
        while read < frames_per_buffer {
            let offset = (*playhead).min(total);
            let available = total - offset;
            let n = available.min(frames_per_buffer - read);

            for ch in 0..self.output.num_channels() {
                self.output.channel_mut(ch)[read..read + n]
                    .copy_from_slice(&self.data.channel(ch)[offset..offset + n]);
            }

            if looping && available - n < self.crossfade_frames {
                self.crossfade(offset, read, n);
            }

            read += n;
            if offset + n < total {
                *playhead = offset + n;
                continue;
            }

            if looping {
                // The head inside the crossfade window was already mixed into the tail.
                *playhead = self.crossfade_frames;
            } else {
                *playhead = 0;
                end_of_stream = true;
                for ch in 0..self.output.num_channels() {
                    self.output.channel_mut(ch)[read..].fill(0.0);
                }
                break;
            }
        }

        end_of_stream
    }

    /// Blends the loop head into the `n` frames just copied from `play`.
    ///
    /// The blend factor ramps linearly from 0 at the start of the tail window to
    /// 1 at the asset's last frame, continuing from where the previous buffer
    /// stopped when the window spans buffers.
    fn crossfade(&mut self, play: usize, write_offset: usize, n: usize) {
        let crossfade = self.crossfade_frames;
        let tail_begin = self.total_frames() - crossfade;

        let (head_begin, start_percentage, offset_in_target) = if play >= tail_begin {
            let head_begin = play - tail_begin;
            (head_begin, head_begin as f32 / crossfade as f32, 0)
        } else {
            (0, 0.0, tail_begin - play)
        };

        let loop_frames = n.saturating_sub(offset_in_target);
        for ch in 0..self.output.num_channels() {
            let source = self.data.channel(ch);
            let target = &mut self.output.channel_mut(ch)[write_offset + offset_in_target..];
            for (frame, sample) in target.iter_mut().take(loop_frames).enumerate() {
                let factor = start_percentage + frame as f32 / crossfade as f32;
                *sample = factor * source[head_begin + frame] + (1.0 - factor) * *sample;
            }
        }
    }
}
