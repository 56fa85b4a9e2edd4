use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "stream-play", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// TOML file with engine settings (see `EngineConfig`)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Seconds of audio in the buffer scheduled at playback start
    #[arg(long)]
    pub immediate_seconds: Option<f64>,

    /// Seconds of audio per buffer decoded ahead in the background
    #[arg(long)]
    pub deferred_seconds: Option<f64>,

    /// Resampler input chunk size in frames (higher => more latency, lower => more overhead)
    #[arg(long)]
    pub chunk_frames: Option<usize>,

    /// Playback callback refill cap (frames)
    #[arg(long)]
    pub refill_max_frames: Option<usize>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Play a local file
    Play {
        /// Path to audio file
        path: PathBuf,

        /// Start position in seconds
        #[arg(long, default_value_t = 0.0)]
        start: f64,

        /// Loop start in seconds (requires --loop-end)
        #[arg(long, requires = "loop_end")]
        loop_start: Option<f64>,

        /// Loop end in seconds (requires --loop-start)
        #[arg(long, requires = "loop_start")]
        loop_end: Option<f64>,

        /// Remove the loop after this many seconds and play to the end
        #[arg(long, requires = "loop_end")]
        loop_for: Option<f64>,
    },
}
