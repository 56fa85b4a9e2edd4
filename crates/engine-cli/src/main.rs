//! `stream-play` - plays one file through the streaming decode-and-schedule engine.
//!
//! Opens the file with Symphonia, picks a CPAL output device (preferring the file's sample
//! rate), and drives `BufferScheduler` until the track completes or Ctrl-C is pressed. With
//! `--loop-start/--loop-end` the A-B section repeats; `--loop-for` removes the loop after that
//! many seconds so playback continues to the end of the file.

mod cli;
mod config;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Parser;
use crossbeam_channel::select;
use tracing_subscriber::EnvFilter;

use audio_engine::config::EngineConfig;
use audio_engine::convert::DefaultSampleConverter;
use audio_engine::cpal_output::{self, CpalOutput};
use audio_engine::output::OutputBackend;
use audio_engine::scheduler::{BufferScheduler, PlaybackContext, PlaybackEvent};
use audio_engine::session::{PlaybackLoop, SessionRegistry};

struct PlayOptions<'a> {
    path: &'a Path,
    start: f64,
    playback_loop: Option<PlaybackLoop>,
    loop_for: Option<f64>,
}

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,audio_engine=info")
        }))
        .init();

    if args.list_devices {
        for name in cpal_output::list_devices()? {
            println!("{name}");
        }
        return Ok(());
    }

    let cfg = config::resolve(args.config.as_deref(), &args)?;

    match &args.cmd {
        Some(cli::Command::Play {
            path,
            start,
            loop_start,
            loop_end,
            loop_for,
        }) => {
            let playback_loop = match (loop_start, loop_end) {
                (Some(a), Some(b)) => Some(
                    PlaybackLoop::bounded(*a, *b)
                        .with_context(|| format!("invalid loop {a}..{b}"))?,
                ),
                _ => None,
            };
            let opts = PlayOptions {
                path,
                start: *start,
                playback_loop,
                loop_for: *loop_for,
            };
            play(&cfg, args.device.as_deref(), &opts)
        }
        None => bail!("nothing to do: use `play <PATH>` or --list-devices"),
    }
}

fn play(cfg: &EngineConfig, device: Option<&str>, opts: &PlayOptions<'_>) -> Result<()> {
    let context = PlaybackContext::open(opts.path, cfg)?;
    let duration = context.duration();
    let output = CpalOutput::open(device, Some(context.sample_rate()), cfg)?;
    let format = output.format();
    tracing::info!(
        device = %output.device_name(),
        rate = format.sample_rate,
        channels = format.channels,
        "output device"
    );

    let registry = Arc::new(SessionRegistry::new());
    let (scheduler, events) = BufferScheduler::new(
        Arc::new(output),
        registry.clone(),
        Box::new(DefaultSampleConverter::new(cfg.resample_chunk_frames)),
    )?;
    scheduler.load(context);

    let label = opts.path.display().to_string();
    let mut session = match opts.playback_loop {
        Some(lp) => {
            let session = registry.start_with_loop(label.as_str(), lp);
            scheduler.play_loop_from(&session, opts.start.max(lp.start_time), true)?;
            session
        }
        None => {
            let session = registry.start(label.as_str());
            scheduler.play_track(&session, opts.start)?;
            session
        }
    };
    tracing::info!(duration = %format!("{duration:.1}"), session = session.id(), "playing");

    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("install Ctrl-C handler")?;

    let ticker = crossbeam_channel::tick(Duration::from_secs(1));
    let loop_deadline = opts
        .loop_for
        .map(|secs| Instant::now() + Duration::from_secs_f64(secs.max(0.0)));

    loop {
        select! {
            recv(events) -> event => match event {
                Ok(PlaybackEvent::TrackCompleted { .. }) => {
                    tracing::info!("playback finished");
                    break;
                }
                Ok(PlaybackEvent::LoopRestarted { start_time, .. }) => {
                    tracing::info!(start_time, "loop restarted");
                }
                Ok(other) => tracing::debug!(?other, "playback event"),
                Err(_) => break,
            },
            recv(stop_rx) -> _ => {
                tracing::info!("interrupted");
                break;
            }
            recv(ticker) -> _ => {
                tracing::info!(position = %format!("{:.1}", scheduler.seek_position()), "tick");
                let expired = loop_deadline.is_some_and(|deadline| Instant::now() >= deadline);
                if expired {
                    if let Some(end_time) = session.playback_loop().and_then(|lp| lp.end_time) {
                        let plain = registry.remove_loop(&session);
                        scheduler.end_loop(&plain, end_time)?;
                        tracing::info!(end_time, "loop removed");
                        session = plain;
                    }
                }
            }
        }
    }

    scheduler.stop();
    registry.end_current();
    Ok(())
}
