//! CPAL-backed [`OutputBackend`] and output device selection.
//!
//! The stream is built and owned by a dedicated thread (CPAL streams are not `Send` on every
//! host). The real-time callback:
//! - copies samples from the head of the scheduled-buffer queue (already in device rate/layout)
//! - hands finished buffers to a completion thread instead of running callbacks itself
//! - outputs silence while paused or when nothing is scheduled
//! - converts `f32` samples to the device sample format

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender};

use crate::config::EngineConfig;
use crate::frame::{OutputFormat, PcmBuffer};
use crate::output::{BufferCompletion, BufferOutcome, OutputBackend};

struct ScheduledBuffer {
    samples: Vec<f32>,
    on_done: BufferCompletion,
}

#[derive(Default)]
struct RenderQueue {
    buffers: VecDeque<ScheduledBuffer>,
    /// Read position (in samples) inside the head buffer.
    pos: usize,
}

struct Shared {
    queue: Mutex<RenderQueue>,
    playing: AtomicBool,
    /// A render clock exists (set by `play`, cleared by `stop`).
    started: AtomicBool,
    rendered_frames: AtomicI64,
    completions: Sender<(BufferCompletion, BufferOutcome)>,
}

impl Shared {
    fn lock_queue(&self) -> std::sync::MutexGuard<'_, RenderQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn complete(&self, on_done: BufferCompletion, outcome: BufferOutcome) {
        if self.completions.send((on_done, outcome)).is_err() {
            tracing::warn!("completion thread gone; dropping buffer completion");
        }
    }
}

/// Audio output through a CPAL device.
pub struct CpalOutput {
    shared: Arc<Shared>,
    format: OutputFormat,
    device_name: String,
    shutdown: Option<Sender<()>>,
    stream_thread: Option<JoinHandle<()>>,
}

impl CpalOutput {
    /// Open `device_name` (substring match, or the default device) preferring `target_rate`.
    pub fn open(
        device_name: Option<&str>,
        target_rate: Option<u32>,
        config: &EngineConfig,
    ) -> Result<Self> {
        let (completions_tx, completions_rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            queue: Mutex::new(RenderQueue::default()),
            playing: AtomicBool::new(false),
            started: AtomicBool::new(false),
            rendered_frames: AtomicI64::new(0),
            completions: completions_tx,
        });

        thread::Builder::new()
            .name("audio-completions".to_string())
            .spawn(move || run_completions(completions_rx))
            .context("spawn completion thread")?;

        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<(OutputFormat, String)>>(1);
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
        let shared_for_stream = shared.clone();
        let device_name = device_name.map(str::to_string);
        let refill_max_frames = config.refill_max_frames.max(1);

        let stream_thread = thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || {
                let stream = match start_stream(
                    device_name.as_deref(),
                    target_rate,
                    refill_max_frames,
                    &shared_for_stream,
                ) {
                    Ok((stream, format, name)) => {
                        let _ = ready_tx.send(Ok((format, name)));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = shutdown_rx.recv();
                drop(stream);
            })
            .context("spawn output thread")?;

        let (format, device_name) = match ready_rx.recv() {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                let _ = stream_thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = stream_thread.join();
                return Err(anyhow!("output thread exited before the stream was ready"));
            }
        };

        Ok(Self {
            shared,
            format,
            device_name,
            shutdown: Some(shutdown_tx),
            stream_thread: Some(stream_thread),
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }
}

impl OutputBackend for CpalOutput {
    fn format(&self) -> OutputFormat {
        self.format
    }

    fn schedule(&self, buffer: PcmBuffer, on_done: BufferCompletion) {
        if buffer.is_empty() {
            self.shared.complete(on_done, BufferOutcome::Played);
            return;
        }
        self.shared.lock_queue().buffers.push_back(ScheduledBuffer {
            samples: buffer.samples,
            on_done,
        });
    }

    fn play(&self) {
        self.shared.started.store(true, Ordering::Release);
        self.shared.playing.store(true, Ordering::Release);
    }

    fn pause(&self) {
        self.shared.playing.store(false, Ordering::Release);
    }

    fn stop(&self) {
        self.shared.playing.store(false, Ordering::Release);
        self.shared.started.store(false, Ordering::Release);
        let flushed: Vec<ScheduledBuffer> = {
            let mut q = self.shared.lock_queue();
            q.pos = 0;
            q.buffers.drain(..).collect()
        };
        self.shared.rendered_frames.store(0, Ordering::Release);
        for buffer in flushed {
            self.shared.complete(buffer.on_done, BufferOutcome::Flushed);
        }
    }

    fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::Acquire)
    }

    fn sample_time(&self) -> Option<i64> {
        if self.shared.started.load(Ordering::Acquire) {
            Some(self.shared.rendered_frames.load(Ordering::Acquire))
        } else {
            None
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.stop();
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.stream_thread.take() {
            let _ = handle.join();
        }
        // The completion thread exits on its own once `shared` (the last sender) is dropped.
    }
}

fn run_completions(rx: Receiver<(BufferCompletion, BufferOutcome)>) {
    for (on_done, outcome) in rx {
        on_done(outcome);
    }
}

fn start_stream(
    device_name: Option<&str>,
    target_rate: Option<u32>,
    refill_max_frames: usize,
    shared: &Arc<Shared>,
) -> Result<(cpal::Stream, OutputFormat, String)> {
    let host = cpal::default_host();
    let device = pick_device(&host, device_name)?;
    let config = pick_output_config(&device, target_rate)?;
    let mut stream_config: cpal::StreamConfig = config.clone().into();
    if let Some(buf) = pick_buffer_size(&config) {
        stream_config.buffer_size = buf;
    }
    let name = device
        .description()
        .map(|d| d.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    tracing::info!(device = %name, "output device");
    tracing::info!(
        output_rate_hz = stream_config.sample_rate,
        channels = stream_config.channels,
        buffer_size = ?stream_config.buffer_size,
        "device output config"
    );

    let stream = build_output_stream(
        &device,
        &stream_config,
        config.sample_format(),
        shared.clone(),
        refill_max_frames,
    )?;
    stream.play()?;

    let format = OutputFormat {
        sample_rate: stream_config.sample_rate,
        channels: stream_config.channels as usize,
    };
    Ok((stream, format, name))
}

fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    shared: Arc<Shared>,
    refill_max_frames: usize,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, shared, refill_max_frames),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, shared, refill_max_frames),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, shared, refill_max_frames),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, shared, refill_max_frames),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    shared: Arc<Shared>,
    refill_max_frames: usize,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32> + Send + 'static,
{
    let channels = config.channels as usize;
    let err_fn = |err| tracing::warn!("stream error: {err}");
    let silence = <T as cpal::Sample>::from_sample::<f32>(0.0);

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            if !shared.playing.load(Ordering::Acquire) {
                data.fill(silence);
                return;
            }
            let frames = data.len() / channels;
            let written = render_into(&shared, data, refill_max_frames * channels, |s| {
                <T as cpal::Sample>::from_sample::<f32>(s)
            });
            data[written..].fill(silence);
            shared
                .rendered_frames
                .fetch_add(frames as i64, Ordering::AcqRel);
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}

/// Copy scheduled samples into `data`, at most `max_step` samples per buffer visit.
///
/// Returns the number of samples written; the caller fills the rest with silence.
fn render_into<T>(
    shared: &Shared,
    data: &mut [T],
    max_step: usize,
    convert: impl Fn(f32) -> T,
) -> usize {
    let mut finished = Vec::new();
    let mut written = 0;
    {
        let mut guard = shared.lock_queue();
        let q = &mut *guard;
        while written < data.len() {
            let pos = q.pos;
            let Some(head) = q.buffers.front() else {
                break;
            };
            let head_len = head.samples.len();
            let n = (head_len - pos).min(data.len() - written).min(max_step.max(1));
            for (dst, src) in data[written..written + n]
                .iter_mut()
                .zip(&head.samples[pos..pos + n])
            {
                *dst = convert(*src);
            }
            written += n;
            q.pos += n;
            if q.pos >= head_len {
                q.pos = 0;
                if let Some(done) = q.buffers.pop_front() {
                    finished.push(done);
                }
            }
        }
    }
    for buffer in finished {
        shared.complete(buffer.on_done, BufferOutcome::Played);
    }
    written
}

/// Pick the first output device matching `needle` (case-insensitive), or the default device.
///
/// Returns an error if no suitable device is found.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    let mut devices: Vec<cpal::Device> = host
        .output_devices()
        .context("No output devices")?
        .collect();

    if let Some(needle) = needle {
        if let Some(d) = devices.drain(..).find(|d| {
            d.description()
                .ok()
                .map(|n| matches_device_name(&n.name(), needle))
                .unwrap_or(false)
        }) {
            return Ok(d);
        }
        return Err(anyhow!("No output device matched: {needle}"));
    }

    host.default_output_device()
        .ok_or_else(|| anyhow!("No default output device"))
}

/// Choose the output config closest to `target_rate` (the source rate), so resampling is
/// skipped whenever the device can run at the source rate.
///
/// Prefers the highest supported rate `<= target_rate`, then the better sample format.
pub fn pick_output_config(
    device: &cpal::Device,
    target_rate: Option<u32>,
) -> Result<cpal::SupportedStreamConfig> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> =
        device.supported_output_configs()?.collect();

    let mut best: Option<(bool, u32, u8, cpal::SupportedStreamConfig)> = None;
    for range in ranges {
        let rate = pick_rate_for_range(range.min_sample_rate(), range.max_sample_rate(), target_rate);
        let below = target_rate.map(|t| rate <= t).unwrap_or(true);
        let format_rank = sample_format_rank(range.sample_format());
        let replace = match &best {
            None => true,
            Some((b_below, b_rate, b_rank, _)) => {
                is_better_candidate(below, rate, format_rank, *b_below, *b_rate, *b_rank)
            }
        };
        if replace {
            best = Some((below, rate, format_rank, range.with_sample_rate(rate)));
        }
    }

    best.map(|(_, _, _, cfg)| cfg)
        .ok_or_else(|| anyhow!("No supported output configs"))
}

/// Prefer a fixed buffer size if the device advertises a range (capped to keep latency sane).
///
/// Returns `None` when the device only supports the default buffer size.
pub fn pick_buffer_size(config: &cpal::SupportedStreamConfig) -> Option<cpal::BufferSize> {
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            const MAX_FRAMES: u32 = 16_384;
            let chosen = if *max > MAX_FRAMES {
                (*min).max(MAX_FRAMES.min(*max))
            } else {
                *max
            };
            Some(cpal::BufferSize::Fixed(chosen))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

fn pick_rate_for_range(min: u32, max: u32, target_rate: Option<u32>) -> u32 {
    match target_rate {
        Some(target) => target.clamp(min, max.max(min)),
        None => max,
    }
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

fn is_better_candidate(
    below: bool,
    rate: u32,
    format_rank: u8,
    best_below: bool,
    best_rate: u32,
    best_rank: u8,
) -> bool {
    if below != best_below {
        below && !best_below
    } else if rate != best_rate {
        rate > best_rate
    } else {
        format_rank < best_rank
    }
}

/// Output device names, in host order, for `--list-devices`.
pub fn list_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host.output_devices().context("No output devices")?;
    let mut names = Vec::new();
    let mut seen = HashSet::new();
    for d in devices {
        let name = d.description()?.to_string();
        if seen.insert(name.clone()) {
            names.push(name);
        } else if should_warn_duplicate(&name) {
            tracing::debug!(device = %name, "duplicate output device name");
        }
    }
    Ok(names)
}

fn duplicate_warned() -> &'static Mutex<HashSet<String>> {
    static WARNED: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    WARNED.get_or_init(|| Mutex::new(HashSet::new()))
}

fn should_warn_duplicate(name: &str) -> bool {
    if let Ok(mut warned) = duplicate_warned().lock() {
        return warned.insert(name.to_string());
    }
    true
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}
