//! Hand-off of mixed blocks from the processing thread to the audio device.

use crate::audio_data::AudioBuffer;
use crate::config::PetalStreamDesc;
use crate::error::{PetalStreamError, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SizedSample};
use crossbeam_channel::{Receiver, Sender};
use std::time::Duration;

/// Processing-thread end of the output queue.
pub(crate) struct MixInput {
    pub(crate) blocks: Sender<AudioBuffer>,
    pub(crate) recycled: Receiver<AudioBuffer>,
}

/// Device end of the output queue.
///
/// Call [`fill_interleaved`](Self::fill_interleaved) from the hardware
/// callback, or drive it manually after
/// [`PetalStreamEngine::start_without_device`](crate::PetalStreamEngine::start_without_device).
pub struct MixOutput {
    blocks: Receiver<AudioBuffer>,
    recycle: Sender<AudioBuffer>,
    current: Option<AudioBuffer>,
    cursor: usize,
    channels: usize,
    max_wait: Duration,
}

/// Creates both ends of the output queue sized from `desc`.
pub(crate) fn mix_queue(desc: &PetalStreamDesc) -> (MixInput, MixOutput) {
    let (blocks_tx, blocks_rx) = crossbeam_channel::bounded(desc.output_fifo_buffers.max(1));
    // Every block in flight can come back at once.
    let (recycle_tx, recycle_rx) = crossbeam_channel::bounded(desc.output_fifo_buffers.max(1) + 2);
    (
        MixInput {
            blocks: blocks_tx,
            recycled: recycle_rx,
        },
        MixOutput {
            blocks: blocks_rx,
            recycle: recycle_tx,
            current: None,
            cursor: 0,
            channels: desc.channels.max(1) as usize,
            max_wait: desc.output_max_wait,
        },
    )
}

impl MixOutput {
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Fills `out` with interleaved samples in the device channel layout.
    ///
    /// Waits up to the configured maximum for each mixed block; whatever
    /// cannot be filled in time is silenced. Returns the number of frames
    /// that carry mixed audio.
    pub fn fill_interleaved(&mut self, out: &mut [f32]) -> usize {
        let channels = self.channels;
        let frames = out.len() / channels;
        let mut frame = 0;

        while frame < frames {
            let exhausted = self
                .current
                .as_ref()
                .is_none_or(|block| self.cursor >= block.num_frames());
            if exhausted {
                if let Some(spent) = self.current.take() {
                    let _ = self.recycle.try_send(spent);
                }
                match self.blocks.recv_timeout(self.max_wait) {
                    Ok(block) => {
                        self.current = Some(block);
                        self.cursor = 0;
                    }
                    Err(_) => {
                        log::warn!(
                            "Mixed audio not ready in time, silencing {} frames",
                            frames - frame
                        );
                        break;
                    }
                }
            }

            let Some(block) = self.current.as_ref() else {
                break;
            };
            let n = (block.num_frames() - self.cursor).min(frames - frame);
            let (left, right) = (block.channel(0), block.channel(block.num_channels().min(2) - 1));
            for i in 0..n {
                let l = left[self.cursor + i];
                let r = right[self.cursor + i];
                write_frame(&mut out[(frame + i) * channels..(frame + i + 1) * channels], l, r);
            }
            self.cursor += n;
            frame += n;
        }

        out[frame * channels..].fill(0.0);
        frame
    }
}

/// Writes one stereo frame into a device frame: downmixed for mono, copied
/// for stereo, front pair only for surround layouts.
fn write_frame(dst: &mut [f32], left: f32, right: f32) {
    match dst.len() {
        1 => dst[0] = 0.5 * (left + right),
        _ => {
            dst[0] = left;
            dst[1] = right;
            dst[2..].fill(0.0);
        }
    }
}

/// Opens the default output device and plays `output` through it.
pub(crate) fn open_device_stream(desc: &PetalStreamDesc, output: MixOutput) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or_else(|| {
        PetalStreamError::AudioDevice("No default output device available".into())
    })?;

    let config = cpal::StreamConfig {
        channels: desc.channels,
        sample_rate: cpal::SampleRate(desc.sample_rate),
        buffer_size: cpal::BufferSize::Fixed(desc.block_size as u32),
    };

    let default_config = device.default_output_config().map_err(|e| {
        PetalStreamError::AudioDevice(format!("Failed to get default config: {}", e))
    })?;

    let stream = match default_config.sample_format() {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, output)?,
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, output)?,
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, output)?,
        other => {
            return Err(PetalStreamError::AudioFormat(format!(
                "Unsupported sample format {:?}",
                other
            )));
        }
    };

    stream
        .play()
        .map_err(|e| PetalStreamError::AudioDevice(format!("Failed to start stream: {}", e)))?;

    log::info!(
        "Audio device started ({} Hz, {} channels, {} frames per block)",
        desc.sample_rate,
        desc.channels,
        desc.block_size
    );
    Ok(stream)
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut output: MixOutput,
) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let mut scratch = vec![0.0f32; config.channels as usize * 4096];

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                if scratch.len() < data.len() {
                    scratch.resize(data.len(), 0.0);
                }
                let scratch = &mut scratch[..data.len()];
                output.fill_interleaved(scratch);
                for (sample, value) in data.iter_mut().zip(scratch.iter()) {
                    *sample = T::from_sample(*value);
                }
            },
            move |err| {
                log::error!("Audio stream error: {}", err);
            },
            None,
        )
        .map_err(|e| PetalStreamError::AudioDevice(format!("Failed to build stream: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(channels: u16) -> PetalStreamDesc {
        PetalStreamDesc::default()
            .with_channels(channels)
            .with_output_max_wait(Duration::from_millis(5))
    }

    fn block(left: &[f32], right: &[f32]) -> AudioBuffer {
        AudioBuffer::from_channels(vec![left.to_vec(), right.to_vec()]).unwrap()
    }

    #[test]
    fn test_stereo_blocks_span_callbacks() {
        let (input, mut output) = mix_queue(&desc(2));
        input.blocks.send(block(&[1.0, 2.0, 3.0], &[-1.0, -2.0, -3.0])).unwrap();

        let mut out = [0.0; 4];
        assert_eq!(output.fill_interleaved(&mut out), 2);
        assert_eq!(out, [1.0, -1.0, 2.0, -2.0]);

        input.blocks.send(block(&[4.0, 5.0, 6.0], &[0.0; 3])).unwrap();
        let mut out = [9.0; 6];
        assert_eq!(output.fill_interleaved(&mut out), 3);
        assert_eq!(out, [3.0, -3.0, 4.0, 0.0, 5.0, 0.0]);

        // The first block went back for reuse.
        assert_eq!(input.recycled.try_recv().unwrap().channel(0), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_timeout_silences_the_rest() {
        let (input, mut output) = mix_queue(&desc(2));
        input.blocks.send(block(&[0.5], &[0.5])).unwrap();

        let mut out = [9.0; 6];
        assert_eq!(output.fill_interleaved(&mut out), 1);
        assert_eq!(out, [0.5, 0.5, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_channel_layouts() {
        let (input, mut output) = mix_queue(&desc(1));
        input.blocks.send(block(&[1.0], &[0.0])).unwrap();
        let mut out = [0.0; 1];
        output.fill_interleaved(&mut out);
        assert_eq!(out, [0.5]);

        let (input, mut output) = mix_queue(&desc(4));
        input.blocks.send(block(&[0.25], &[0.75])).unwrap();
        let mut out = [9.0; 4];
        output.fill_interleaved(&mut out);
        assert_eq!(out, [0.25, 0.75, 0.0, 0.0]);
    }
}
