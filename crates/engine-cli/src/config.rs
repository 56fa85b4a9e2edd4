use std::path::Path;

use anyhow::{Context, Result};
use audio_engine::config::EngineConfig;

use crate::cli::Args;

/// Load engine settings from `path` (defaults when absent), then apply command-line overrides.
pub fn resolve(path: Option<&Path>, args: &Args) -> Result<EngineConfig> {
    let mut cfg = match path {
        Some(path) => load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(secs) = args.immediate_seconds {
        cfg.immediate_buffer_seconds = secs;
    }
    if let Some(secs) = args.deferred_seconds {
        cfg.deferred_buffer_seconds = secs;
    }
    if let Some(frames) = args.chunk_frames {
        cfg.resample_chunk_frames = frames;
    }
    if let Some(frames) = args.refill_max_frames {
        cfg.refill_max_frames = frames;
    }
    Ok(cfg)
}

fn load(path: &Path) -> Result<EngineConfig> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
    toml::from_str::<EngineConfig>(&raw).with_context(|| format!("parse config {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: EngineConfig = toml::from_str("deferred_buffer_seconds = 4.0\n").unwrap();
        assert_eq!(cfg.deferred_buffer_seconds, 4.0);
        assert_eq!(cfg.immediate_buffer_seconds, 5.0);
        assert_eq!(cfg.seek_tolerance_seconds, 0.01);
    }

    #[test]
    fn flags_override_file_values() {
        let dir = std::env::temp_dir().join(format!("stream-play-cfg-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("engine.toml");
        std::fs::write(&path, "immediate_buffer_seconds = 1.5\nresample_chunk_frames = 256\n").unwrap();

        let args = Args::parse_from(["stream-play", "--chunk-frames", "512"]);
        let cfg = resolve(Some(&path), &args).unwrap();
        assert_eq!(cfg.immediate_buffer_seconds, 1.5);
        assert_eq!(cfg.resample_chunk_frames, 512);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_file_is_an_error() {
        let args = Args::parse_from(["stream-play"]);
        let err = resolve(Some(Path::new("/definitely/not/here.toml")), &args).unwrap_err();
        assert!(format!("{err:#}").contains("read config"));
    }
}
