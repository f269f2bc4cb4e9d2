mod source_config;
mod stream_desc;

pub use source_config::{SoundPlaybackParams, SourceConfig};
pub use stream_desc::{PetalStreamDesc, SpeakerProfile};
