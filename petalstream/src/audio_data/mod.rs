//! Decoded audio containers and the readers that produce them.
//!
//! - [`AudioBuffer`]: fixed-size planar block, the unit that flows through every FIFO
//! - [`PlanarAudioBuffer`]: growable per-channel storage for fully decoded assets
//! - [`AudioReader`]: pull-based decoder contract, implemented by
//!   [`SymphoniaReader`] for files and [`PcmReader`] for in-memory samples
//! - [`StreamingResampler`] and [`BufferPartitioner`]: rate conversion and
//!   re-slicing of the converted output into fixed-size blocks

mod buffer;
mod partitioner;
mod pcm_reader;
mod planar;
mod reader;
mod streaming_resampler;
mod symphonia_reader;

pub use buffer::AudioBuffer;
pub use partitioner::BufferPartitioner;
pub use pcm_reader::PcmReader;
pub use planar::PlanarAudioBuffer;
pub use reader::{AudioReader, EncodingFormat, read_next_buffer};
pub use streaming_resampler::{ResamplerType, StreamingResampler};
pub use symphonia_reader::SymphoniaReader;
