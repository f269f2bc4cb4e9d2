use super::AudioBuffer;

/// Re-slices a variable-length planar sample stream into fixed-size buffers.
///
/// Each time the current buffer fills up it is handed to the caller's
/// `on_full` callback, which returns the (empty) buffer to continue with.
/// That lets the caller recycle buffers instead of allocating.
pub struct BufferPartitioner {
    current: AudioBuffer,
    filled: usize,
}

impl BufferPartitioner {
    pub fn new(num_channels: usize, frames_per_buffer: usize) -> Self {
        Self {
            current: AudioBuffer::new(num_channels, frames_per_buffer),
            filled: 0,
        }
    }

    /// Frames waiting in the partially filled buffer.
    pub fn pending_frames(&self) -> usize {
        self.filled
    }

    /// Appends the first `num_frames` frames of `input`.
    pub fn add_frames<F>(&mut self, input: &[Vec<f32>], num_frames: usize, mut on_full: F)
    where
        F: FnMut(AudioBuffer) -> AudioBuffer,
    {
        let frames_per_buffer = self.current.num_frames();
        let num_frames = input
            .iter()
            .map(Vec::len)
            .min()
            .unwrap_or(0)
            .min(num_frames);

        let mut consumed = 0;
        while consumed < num_frames {
            let n = (frames_per_buffer - self.filled).min(num_frames - consumed);
            for (ch, source) in input.iter().enumerate().take(self.current.num_channels()) {
                self.current.channel_mut(ch)[self.filled..self.filled + n]
                    .copy_from_slice(&source[consumed..consumed + n]);
            }
            self.filled += n;
            consumed += n;

            if self.filled == frames_per_buffer {
                self.emit(&mut on_full);
            }
        }
    }

    /// Zero-pads and emits the partially filled buffer, if any.
    pub fn flush<F>(&mut self, mut on_full: F)
    where
        F: FnMut(AudioBuffer) -> AudioBuffer,
    {
        if self.filled == 0 {
            return;
        }
        for ch in 0..self.current.num_channels() {
            self.current.channel_mut(ch)[self.filled..].fill(0.0);
        }
        self.emit(&mut on_full);
    }

    /// Drops any partially filled frames.
    pub fn discard(&mut self) {
        self.filled = 0;
    }

    fn emit<F>(&mut self, on_full: &mut F)
    where
        F: FnMut(AudioBuffer) -> AudioBuffer,
    {
        let full = std::mem::take(&mut self.current);
        self.current = on_full(full);
        self.filled = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(len: usize, start: f32) -> Vec<f32> {
        (0..len).map(|i| start + i as f32).collect()
    }

    #[test]
    fn test_partitions_across_calls() {
        let mut partitioner = BufferPartitioner::new(1, 4);
        let mut emitted = Vec::new();

        partitioner.add_frames(&[ramp(6, 0.0)], 6, |full| {
            emitted.push(full);
            AudioBuffer::new(1, 4)
        });
        assert_eq!(emitted.len(), 1);
        assert_eq!(partitioner.pending_frames(), 2);

        partitioner.add_frames(&[ramp(3, 6.0)], 3, |full| {
            emitted.push(full);
            AudioBuffer::new(1, 4)
        });
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0].channel(0), &[0.0, 1.0, 2.0, 3.0]);
        assert_eq!(emitted[1].channel(0), &[4.0, 5.0, 6.0, 7.0]);
        assert_eq!(partitioner.pending_frames(), 1);
    }

    #[test]
    fn test_flush_pads_with_silence() {
        let mut partitioner = BufferPartitioner::new(2, 4);
        let mut emitted = Vec::new();
        partitioner.add_frames(&[vec![1.0; 3], vec![2.0; 3]], 3, |full| {
            emitted.push(full);
            AudioBuffer::new(2, 4)
        });
        assert!(emitted.is_empty());

        partitioner.flush(|full| {
            emitted.push(full);
            AudioBuffer::new(2, 4)
        });
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].channel(0), &[1.0, 1.0, 1.0, 0.0]);
        assert_eq!(emitted[0].channel(1), &[2.0, 2.0, 2.0, 0.0]);

        partitioner.flush(|_| panic!("nothing left to flush"));
    }

    #[test]
    fn test_discard_drops_partial_frames() {
        let mut partitioner = BufferPartitioner::new(1, 4);
        partitioner.add_frames(&[vec![1.0; 2]], 2, |full| full);
        partitioner.discard();
        assert_eq!(partitioner.pending_frames(), 0);
    }
}
