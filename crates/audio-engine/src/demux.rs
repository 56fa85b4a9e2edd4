//! Symphonia-backed [`PacketSource`] and [`Codec`].
//!
//! [`open_file`] probes a file and returns both halves plus best-effort metadata; the decoder
//! then drives them independently.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use symphonia::core::audio::{AudioBufferRef, SampleBuffer};
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions};
use symphonia::core::errors::{Error as SymphoniaError, SeekErrorKind};
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;

use crate::error::{
    CODE_DECODE, CODE_RESET_REQUIRED, CODE_SEEK, CODE_UNKNOWN, DecoderError, PacketReadError,
    SeekError,
};
use crate::frame::{Frame, SampleData, SampleFormat, StreamFormat};
use crate::source::{Codec, Packet, PacketSource};

/// Metadata captured while probing the source.
#[derive(Clone, Debug, Default)]
pub struct SourceInfo {
    /// Codec name (best-effort).
    pub codec: Option<String>,
    /// Source bit depth (best-effort).
    pub bit_depth: Option<u16>,
    /// Duration in seconds (best-effort).
    pub duration: Option<f64>,
    pub sample_rate: u32,
    pub channels: usize,
}

/// Probe `path` and open its default audio track.
pub fn open_file(path: &Path) -> Result<(SymphoniaPacketSource, SymphoniaCodec, SourceInfo)> {
    let file = File::open(path).with_context(|| format!("open {:?}", path))?;

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    open_media_source(Box::new(file), hint)
}

/// Probe an arbitrary Symphonia [`MediaSource`] and open its default audio track.
pub fn open_media_source(
    source: Box<dyn MediaSource>,
    hint: Hint,
) -> Result<(SymphoniaPacketSource, SymphoniaCodec, SourceInfo)> {
    let mss = MediaSourceStream::new(source, Default::default());
    let format_opts = FormatOptions {
        enable_gapless: true,
        ..Default::default()
    };

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &format_opts, &MetadataOptions::default())
        .context("probe media source")?;
    let format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| anyhow!("No default audio track"))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let channels = codec_params
        .channels
        .ok_or_else(|| anyhow!("Unknown channels"))?
        .count();
    let sample_rate = codec_params
        .sample_rate
        .ok_or_else(|| anyhow!("Unknown sample rate"))?;

    let decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .context("create codec")?;

    let duration = duration_secs_from_codec_params(&codec_params);
    let info = SourceInfo {
        codec: codec_name_from_params(&codec_params),
        bit_depth: codec_params
            .bits_per_sample
            .or(codec_params.bits_per_coded_sample)
            .and_then(|v| u16::try_from(v).ok()),
        duration,
        sample_rate,
        channels,
    };

    let time_base = codec_params
        .time_base
        .filter(|tb| tb.denom != 0)
        .map(|tb| tb.numer as f64 / tb.denom as f64)
        .unwrap_or(1.0 / sample_rate as f64);

    let source = SymphoniaPacketSource {
        format,
        track_id,
        time_base,
        duration,
        raw: is_pcm_codec(&codec_params),
    };
    let codec = SymphoniaCodec {
        decoder,
        format: StreamFormat {
            sample_rate,
            channels,
            sample_format: sample_format_from_params(&codec_params),
        },
    };
    Ok((source, codec, info))
}

/// Packet source over a Symphonia [`FormatReader`], restricted to one track.
pub struct SymphoniaPacketSource {
    format: Box<dyn FormatReader>,
    track_id: u32,
    time_base: f64,
    duration: Option<f64>,
    raw: bool,
}

impl PacketSource for SymphoniaPacketSource {
    fn read_packet(&mut self) -> Result<Packet, PacketReadError> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Err(PacketReadError::eof());
                }
                Err(e) => return Err(PacketReadError::other(e.to_string())),
            };
            if packet.track_id() != self.track_id {
                continue;
            }
            return Ok(Packet {
                pts: i64::try_from(packet.ts).unwrap_or(i64::MAX),
                duration: packet.dur,
                trim_start: packet.trim_start,
                trim_end: packet.trim_end,
                data: packet.data,
            });
        }
    }

    fn seek(&mut self, time: f64) -> Result<(), SeekError> {
        if let Some(duration) = self.duration {
            if time >= duration {
                return Err(SeekError::eof());
            }
        }
        let time = time.max(0.0);
        let mode = if self.raw {
            SeekMode::Accurate
        } else {
            SeekMode::Coarse
        };
        let to = SeekTo::Time {
            time: Time::new(time.trunc() as u64, time.fract()),
            track_id: Some(self.track_id),
        };
        match self.format.seek(mode, to) {
            Ok(_) => Ok(()),
            Err(SymphoniaError::SeekError(SeekErrorKind::OutOfRange)) => Err(SeekError::eof()),
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(SeekError::eof())
            }
            Err(e) => Err(SeekError::other(CODE_SEEK, e.to_string())),
        }
    }

    fn is_raw_audio(&self) -> bool {
        self.raw
    }

    fn time_base(&self) -> f64 {
        self.time_base
    }

    fn duration(&self) -> Option<f64> {
        self.duration
    }
}

/// Codec over a Symphonia [`Decoder`].
///
/// Decoded audio is converted to the format declared up front (see [`sample_format_from_params`])
/// so every frame of a stream shares one layout. Packet trims are applied here rather than inside
/// Symphonia.
pub struct SymphoniaCodec {
    decoder: Box<dyn Decoder>,
    format: StreamFormat,
}

impl SymphoniaCodec {
    fn to_frame(format: StreamFormat, decoded: AudioBufferRef<'_>) -> Frame {
        let spec = *decoded.spec();
        let frames = decoded.frames() as u64;
        let channels = spec.channels.count();
        let data = match format.sample_format {
            SampleFormat::S16 => {
                let mut buf = SampleBuffer::<i16>::new(frames, spec);
                buf.copy_interleaved_ref(decoded);
                SampleData::S16(buf.samples().to_vec())
            }
            SampleFormat::S32 => {
                let mut buf = SampleBuffer::<i32>::new(frames, spec);
                buf.copy_interleaved_ref(decoded);
                SampleData::S32(buf.samples().to_vec())
            }
            SampleFormat::F32 => {
                let mut buf = SampleBuffer::<f32>::new(frames, spec);
                buf.copy_interleaved_ref(decoded);
                SampleData::F32(buf.samples().to_vec())
            }
        };
        Frame::new(data, channels, spec.rate)
    }
}

impl Codec for SymphoniaCodec {
    fn format(&self) -> StreamFormat {
        self.format
    }

    fn decode(&mut self, packet: &Packet) -> Result<Vec<Frame>, DecoderError> {
        let sym_packet = symphonia::core::formats::Packet::new_from_slice(
            0,
            packet.pts.max(0) as u64,
            packet.duration,
            &packet.data,
        );
        let decoded = match self.decoder.decode(&sym_packet) {
            Ok(d) => d,
            Err(SymphoniaError::ResetRequired) => {
                self.decoder.reset();
                return Err(DecoderError::new(CODE_RESET_REQUIRED, "codec reset required"));
            }
            Err(SymphoniaError::DecodeError(msg)) => {
                return Err(DecoderError::new(CODE_DECODE, msg));
            }
            Err(e) => return Err(DecoderError::new(CODE_UNKNOWN, e.to_string())),
        };
        let mut frame = Self::to_frame(self.format, decoded);
        apply_trims(&mut frame, packet);
        if frame.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![frame])
    }

    fn flush_buffers(&mut self) {
        self.decoder.reset();
    }
}

/// Drop encoder delay / padding carried by `packet` from `frame`.
pub(crate) fn apply_trims(frame: &mut Frame, packet: &Packet) {
    let start = packet.trim_start as usize;
    let end = packet.trim_end as usize;
    let count = frame.sample_count();
    if start + end >= count {
        frame.keep_first(0);
        return;
    }
    if end > 0 {
        frame.keep_first(count - end);
    }
    if start > 0 {
        frame.keep_last(count - end - start);
    }
}

/// Sample format frames are delivered in, chosen from the stream's declared bit depth.
fn sample_format_from_params(params: &CodecParameters) -> SampleFormat {
    use symphonia::core::sample::SampleFormat as Sym;
    match params.sample_format {
        Some(Sym::U8 | Sym::S8 | Sym::U16 | Sym::S16) => return SampleFormat::S16,
        Some(Sym::U24 | Sym::S24 | Sym::U32 | Sym::S32) => return SampleFormat::S32,
        Some(_) => return SampleFormat::F32,
        None => {}
    }
    match params.bits_per_sample {
        Some(bits) if bits <= 16 => SampleFormat::S16,
        Some(_) => SampleFormat::S32,
        None => SampleFormat::F32,
    }
}

fn is_pcm_codec(params: &CodecParameters) -> bool {
    codec_name_from_params(params).is_some_and(|name| name.starts_with("PCM"))
}

/// Best-effort duration in seconds from codec metadata.
///
/// Returns `None` if the container does not provide total frames or sample rate.
fn duration_secs_from_codec_params(codec_params: &CodecParameters) -> Option<f64> {
    let frames = codec_params.n_frames?;
    let rate = codec_params.sample_rate?;
    if rate == 0 {
        return None;
    }
    Some(frames as f64 / rate as f64)
}

/// Best-effort codec label used for logging.
fn codec_name_from_params(params: &CodecParameters) -> Option<String> {
    use symphonia::core::codecs::*;
    let name = match params.codec {
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_MP3 => "MP3",
        CODEC_TYPE_AAC => "AAC",
        CODEC_TYPE_ALAC => "ALAC",
        CODEC_TYPE_VORBIS => "VORBIS",
        CODEC_TYPE_OPUS => "OPUS",
        CODEC_TYPE_PCM_U8 | CODEC_TYPE_PCM_S8 => "PCM_8",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM_S16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM_S24",
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "PCM_S32",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM_F32",
        CODEC_TYPE_PCM_F64LE | CODEC_TYPE_PCM_F64BE => "PCM_F64",
        _ => return None,
    };
    Some(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use symphonia::core::codecs::*;

    /// Minimal mono 16-bit PCM WAV with sample values `0..n`.
    fn wav_bytes(rate: u32, n: usize) -> Vec<u8> {
        let data_len = (n * 2) as u32;
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVEfmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&rate.to_le_bytes());
        out.extend_from_slice(&(rate * 2).to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        for i in 0..n {
            out.extend_from_slice(&(i as i16).to_le_bytes());
        }
        out
    }

    fn open_wav(rate: u32, n: usize) -> (SymphoniaPacketSource, SymphoniaCodec, SourceInfo) {
        let mut hint = Hint::new();
        hint.with_extension("wav");
        open_media_source(Box::new(Cursor::new(wav_bytes(rate, n))), hint).unwrap()
    }

    #[test]
    fn probes_wav_as_raw_pcm() {
        let (source, codec, info) = open_wav(8_000, 8_000);
        assert!(source.is_raw_audio());
        assert_eq!(info.codec.as_deref(), Some("PCM_S16"));
        assert_eq!(info.channels, 1);
        assert!((info.duration.unwrap() - 1.0).abs() < 1e-9);
        assert_eq!(codec.format().sample_format, SampleFormat::S16);
        assert!((source.time_base() - 1.0 / 8_000.0).abs() < 1e-12);
    }

    #[test]
    fn decodes_all_samples_then_reports_eof() {
        let (mut source, mut codec, _) = open_wav(8_000, 4_000);
        let mut total = 0;
        let mut first: Option<Frame> = None;
        loop {
            match source.read_packet() {
                Ok(packet) => {
                    for frame in codec.decode(&packet).unwrap() {
                        total += frame.sample_count();
                        first.get_or_insert(frame);
                    }
                }
                Err(e) => {
                    assert!(e.is_eof);
                    break;
                }
            }
        }
        assert_eq!(total, 4_000);
        let mut samples = Vec::new();
        first.unwrap().extend_f32(&mut samples);
        assert_eq!(samples[1], 1.0 / 32_768.0);
    }

    #[test]
    fn seek_past_duration_is_eof() {
        let (mut source, _, _) = open_wav(8_000, 8_000);
        let err = source.seek(2.0).unwrap_err();
        assert!(err.is_eof);
        assert!(source.seek(0.5).is_ok());
        let packet = source.read_packet().unwrap();
        assert!((packet.pts as f64 * source.time_base() - 0.5).abs() < 0.01);
    }

    #[test]
    fn trims_are_applied_to_both_ends() {
        let mut frame = Frame::new(SampleData::F32((0..10).map(|i| i as f32).collect()), 1, 10)
            .with_start_time(0.0);
        let packet = Packet {
            trim_start: 2,
            trim_end: 3,
            ..Packet::default()
        };
        apply_trims(&mut frame, &packet);
        assert_eq!(frame.f32_samples().unwrap(), &[2.0, 3.0, 4.0, 5.0, 6.0]);
        assert!((frame.start_time().unwrap() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn duration_secs_from_codec_params_handles_zero_rate() {
        let mut params = CodecParameters::new();
        params.sample_rate = Some(0);
        params.n_frames = Some(100);
        assert!(duration_secs_from_codec_params(&params).is_none());
    }

    #[test]
    fn sample_format_prefers_declared_format_over_bit_depth() {
        let mut params = CodecParameters::new();
        params.bits_per_sample = Some(24);
        assert_eq!(sample_format_from_params(&params), SampleFormat::S32);
        params.sample_format = Some(symphonia::core::sample::SampleFormat::S16);
        assert_eq!(sample_format_from_params(&params), SampleFormat::S16);
        params.codec = CODEC_TYPE_MP3;
        assert!(!is_pcm_codec(&params));
    }
}
