use anyhow::{Context, Result, bail};
use petalstream::audio_data::{AudioReader, PcmReader};
use petalstream::{
    AssetLoader, FileAssetLoader, PetalStreamDesc, PetalStreamEngine, PetalStreamEvent, Pose,
    SoundPlaybackParams, SourceConfig, SpatialAudioSink, StereoMixer, StreamingPolicy, Vec3,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const USAGE: &str = "\
usage: petalstream-demo [FILE] [options]

Plays FILE (or a generated test tone) through the default output device.

options:
  --preload             decode the whole file before playing
  --stream-into-memory  stream the first play and keep the decoded data
  --loop                loop until --seconds runs out
  --orbit               place the sound on a circle around the listener
  --seconds N           stop after N seconds (default 10)
  --volume V            playback volume (default 1.0)";

const TONE_URI: &str = "tone://440";

#[derive(Debug, Clone)]
pub struct Options {
    pub path: Option<String>,
    pub policy: StreamingPolicy,
    pub looping: bool,
    pub orbit: bool,
    pub seconds: f32,
    pub volume: f32,
}

impl Options {
    pub fn parse(args: &[String]) -> Result<Self> {
        let mut options = Options {
            path: None,
            policy: StreamingPolicy::StreamAndClose,
            looping: false,
            orbit: false,
            seconds: 10.0,
            volume: 1.0,
        };

        let mut args = args.iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--preload" => options.policy = StreamingPolicy::PreloadIntoMemory,
                "--stream-into-memory" => options.policy = StreamingPolicy::StreamIntoMemory,
                "--loop" => options.looping = true,
                "--orbit" => options.orbit = true,
                "--seconds" => {
                    let value = args.next().context("--seconds needs a value")?;
                    options.seconds = value.parse().context("invalid --seconds")?;
                }
                "--volume" => {
                    let value = args.next().context("--volume needs a value")?;
                    options.volume = value.parse().context("invalid --volume")?;
                }
                flag if flag.starts_with("--") => bail!("unknown option {}\n\n{}", flag, USAGE),
                path => options.path = Some(path.to_string()),
            }
        }
        Ok(options)
    }
}

/// Serves the generated tone and falls back to the file system for anything else.
fn demo_loader() -> Arc<dyn AssetLoader> {
    let files = FileAssetLoader::new();
    Arc::new(move |uri: &str| -> petalstream::Result<Box<dyn AudioReader>> {
        if uri == TONE_URI {
            let rate = 48000;
            let samples: Vec<f32> = (0..rate * 2)
                .map(|i| {
                    let t = i as f32 / rate as f32;
                    (t * 440.0 * std::f32::consts::TAU).sin() * 0.3
                })
                .collect();
            return Ok(Box::new(PcmReader::new(samples, 1, rate)));
        }
        files.open_now(uri)
    })
}

fn make_sink(desc: &PetalStreamDesc) -> Result<Box<dyn SpatialAudioSink>> {
    #[cfg(feature = "steam-audio")]
    {
        let sink = petalstream::BinauralSink::new(desc)?;
        log::info!("Using Steam Audio binaural sink");
        Ok(Box::new(sink))
    }
    #[cfg(not(feature = "steam-audio"))]
    {
        Ok(Box::new(StereoMixer::new(desc.block_size, desc.max_sources)))
    }
}

pub fn run(options: Options) -> Result<()> {
    let desc = PetalStreamDesc::default();
    let sink = make_sink(&desc)?;
    let mut engine = PetalStreamEngine::with_sink_and_loader(desc, sink, demo_loader())?;
    engine.start()?;

    let uri = options.path.as_deref().unwrap_or(TONE_URI);
    log::info!("Loading {} ({:?})", uri, options.policy);
    let asset = engine.load_audio_asset(uri, options.policy);

    let source = if options.orbit {
        SourceConfig::spatial(Vec3::new(0.0, 0.0, -2.0))
    } else {
        SourceConfig::NonSpatial
    };
    let params = SoundPlaybackParams::new(source)
        .with_volume(options.volume)
        .with_looping(options.looping);
    let sound = engine.play_sound(&asset, params)?;
    engine.set_listener_pose(Pose::identity())?;

    let started = Instant::now();
    let limit = Duration::from_secs_f32(options.seconds.max(0.0));
    let mut finished = false;
    while !finished && started.elapsed() < limit {
        if options.orbit {
            let angle = started.elapsed().as_secs_f32() * 0.8;
            let position = Vec3::new(angle.sin() * 2.0, 0.0, -angle.cos() * 2.0);
            engine.set_sound_position(sound, position)?;
        }

        for event in engine.poll_events() {
            match event {
                PetalStreamEvent::SourceCompleted { source_id } if source_id == sound => {
                    log::info!("{} completed", source_id);
                    finished = true;
                }
                PetalStreamEvent::BufferUnderrun { source_id } => {
                    log::warn!("{} underran", source_id);
                }
                PetalStreamEvent::EngineError { error } => log::error!("{}", error),
                other => log::debug!("{:?}", other),
            }
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    if !finished {
        log::info!("Stopping {}", sound);
        engine.stop_sound(sound)?;
        std::thread::sleep(Duration::from_millis(200));
    }

    engine.stop()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_defaults() {
        let options = Options::parse(&[]).unwrap();
        assert!(options.path.is_none());
        assert_eq!(options.policy, StreamingPolicy::StreamAndClose);
        assert!(!options.looping);
    }

    #[test]
    fn test_parse_flags() {
        let options = Options::parse(&args(&[
            "music.ogg",
            "--preload",
            "--loop",
            "--seconds",
            "3.5",
        ]))
        .unwrap();
        assert_eq!(options.path.as_deref(), Some("music.ogg"));
        assert_eq!(options.policy, StreamingPolicy::PreloadIntoMemory);
        assert!(options.looping);
        assert_eq!(options.seconds, 3.5);
    }

    #[test]
    fn test_parse_rejects_unknown_flag() {
        assert!(Options::parse(&args(&["--bogus"])).is_err());
        assert!(Options::parse(&args(&["--volume"])).is_err());
    }
}
