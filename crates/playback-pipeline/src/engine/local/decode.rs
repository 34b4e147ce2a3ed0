//! Demux and decode stages of a local unit.
//!
//! Uses Symphonia to:
//! - probe the file's container and codec
//! - collect metadata tags and a nominal bitrate
//! - decode packets from the buffering queue into interleaved `f32` samples

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::{Context, Result, anyhow};
use symphonia::core::audio::{SampleBuffer, SignalSpec};
use symphonia::core::codecs::{CodecParameters, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::{MetadataOptions, MetadataRevision, StandardTagKey};
use symphonia::core::probe::{Hint, ProbeResult};
use symphonia::core::units::{Time, TimeBase};

use super::buffer::PacketQueue;
use super::queue::SharedAudio;
use crate::tag_list::{
    MergeMode, TAG_ALBUM, TAG_ARTIST, TAG_DATE, TAG_GENRE, TAG_NOMINAL_BITRATE, TAG_TITLE,
    TAG_TRACK_NUMBER, TagList,
};

/// A probed file, positioned at its start offset.
pub(super) struct OpenedSource {
    pub format: Box<dyn FormatReader>,
    pub codec_params: CodecParameters,
    pub track_id: u32,
    pub spec: SignalSpec,
    pub time_base: Option<TimeBase>,
    pub info: SourceInfo,
    pub tags: TagList,
    /// Where decoding actually starts.
    pub start_ns: u64,
}

/// Facts about a source that outlive a single decode run.
#[derive(Clone, Debug, Default)]
pub(super) struct SourceInfo {
    pub channels: usize,
    pub duration_ms: Option<u64>,
    pub file_size: u64,
    pub codec: Option<String>,
}

impl SourceInfo {
    pub fn duration_ns(&self) -> Option<i64> {
        self.duration_ms
            .and_then(|ms| i64::try_from(ms.saturating_mul(1_000_000)).ok())
    }

    /// Average encoded bitrate in bits per second.
    pub fn nominal_bitrate(&self) -> Option<u64> {
        let ms = self.duration_ms.filter(|ms| *ms > 0)?;
        Some(self.file_size.saturating_mul(8_000) / ms)
    }
}

/// Resolve a `file://` URI or plain path to a filesystem path.
pub(super) fn path_from_uri(uri: &str) -> Result<PathBuf> {
    match uri.split_once("://") {
        None => Ok(PathBuf::from(uri)),
        Some(("file", rest)) => {
            // Skip an authority component such as `localhost`.
            let path = match rest.find('/') {
                Some(0) => rest,
                Some(i) if &rest[..i] == "localhost" => &rest[i..],
                _ => return Err(anyhow!("unsupported file URI: {uri}")),
            };
            Ok(PathBuf::from(percent_decode(path)?))
        }
        Some((scheme, _)) => Err(anyhow!("unsupported URI scheme: {scheme}")),
    }
}

fn percent_decode(text: &str) -> Result<String> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = text
                .get(i + 1..i + 3)
                .ok_or_else(|| anyhow!("truncated escape in {text}"))?;
            let byte = u8::from_str_radix(hex, 16).with_context(|| format!("bad escape %{hex}"))?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).context("decoded path is not UTF-8")
}

/// Probe `path` and position the reader at `start_ns`.
pub(super) fn open_source(path: &Path, start_ns: u64) -> Result<OpenedSource> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let file_size = file.metadata().map(|m| m.len()).unwrap_or(0);

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let ProbeResult {
        mut format,
        mut metadata,
    } = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .with_context(|| format!("probe {}", path.display()))?;

    let track = format
        .default_track()
        .ok_or_else(|| anyhow!("No default audio track"))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let layout = codec_params
        .channels
        .ok_or_else(|| anyhow!("Unknown channels"))?;
    let rate = codec_params
        .sample_rate
        .ok_or_else(|| anyhow!("Unknown sample rate"))?;
    let spec = SignalSpec::new(rate, layout);

    let info = SourceInfo {
        channels: layout.count(),
        duration_ms: duration_ms_from_codec_params(&codec_params),
        file_size,
        codec: codec_name_from_params(&codec_params),
    };

    let mut tags = TagList::new();
    if let Some(rev) = metadata.get().as_ref().and_then(|m| m.current()) {
        add_revision_tags(&mut tags, rev);
    }
    if let Some(rev) = format.metadata().current() {
        add_revision_tags(&mut tags, rev);
    }
    if let Some(bitrate) = info.nominal_bitrate() {
        tags.add_value(TAG_NOMINAL_BITRATE, bitrate, MergeMode::Replace);
    }

    let mut start = 0;
    if start_ns > 0 {
        let time = Time::new(start_ns / 1_000_000_000, (start_ns % 1_000_000_000) as f64 / 1e9);
        match format.seek(
            SeekMode::Accurate,
            SeekTo::Time {
                time,
                track_id: Some(track_id),
            },
        ) {
            Ok(seeked) => {
                start = codec_params
                    .time_base
                    .map(|tb| time_to_ns(tb.calc_time(seeked.actual_ts)))
                    .unwrap_or(start_ns);
            }
            Err(e) => tracing::warn!(path = %path.display(), "seek failed, starting over: {e}"),
        }
    }

    tracing::debug!(
        path = %path.display(),
        rate,
        channels = info.channels,
        codec = info.codec.as_deref().unwrap_or("unknown"),
        duration_ms = ?info.duration_ms,
        "source opened"
    );

    Ok(OpenedSource {
        format,
        time_base: codec_params.time_base,
        codec_params,
        track_id,
        spec,
        info,
        tags,
        start_ns: start,
    })
}

fn time_to_ns(time: Time) -> u64 {
    time.seconds
        .saturating_mul(1_000_000_000)
        .saturating_add((time.frac * 1e9) as u64)
}

/// Duration of a packet in seconds, `0.0` without a time base.
pub(super) fn packet_seconds(time_base: Option<TimeBase>, dur: u64) -> f64 {
    time_base.map_or(0.0, |tb| {
        let t = tb.calc_time(dur);
        t.seconds as f64 + t.frac
    })
}

fn add_revision_tags(tags: &mut TagList, rev: &MetadataRevision) {
    for tag in rev.tags() {
        let name = match tag.std_key {
            Some(StandardTagKey::TrackTitle) => TAG_TITLE,
            Some(StandardTagKey::Artist) => TAG_ARTIST,
            Some(StandardTagKey::Album) => TAG_ALBUM,
            Some(StandardTagKey::Genre) => TAG_GENRE,
            Some(StandardTagKey::Date) => TAG_DATE,
            Some(StandardTagKey::TrackNumber) => {
                // "3/12" style values keep only the track number.
                let text = tag.value.to_string();
                if let Ok(n) = text.split('/').next().unwrap_or("").trim().parse::<u64>() {
                    tags.add_value(TAG_TRACK_NUMBER, n, MergeMode::Replace);
                }
                continue;
            }
            _ => continue,
        };
        tags.add_value(name, tag.value.to_string(), MergeMode::Replace);
    }
}

/// Start the decoder thread: packets from `packets`, samples into `out`.
///
/// `out` is closed when input ends, on a fatal decode error, or on cancel.
pub(super) fn spawn_decoder(
    name: String,
    codec_params: CodecParameters,
    packets: Arc<PacketQueue>,
    out: Arc<SharedAudio>,
    cancel: Arc<AtomicBool>,
) -> Result<()> {
    thread::Builder::new()
        .name(name)
        .spawn(move || {
            if let Err(e) = decode_loop(&codec_params, &packets, &out, &cancel) {
                tracing::error!("decoder thread error: {e:#}");
            }
            out.close();
        })
        .context("spawn decoder thread")?;
    Ok(())
}

fn decode_loop(
    codec_params: &CodecParameters,
    packets: &PacketQueue,
    out: &SharedAudio,
    cancel: &AtomicBool,
) -> Result<()> {
    let mut decoder =
        symphonia::default::get_codecs().make(codec_params, &DecoderOptions::default())?;

    while let Some(packet) = packets.pop() {
        if cancel.load(Ordering::Acquire) {
            break;
        }
        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(e)) => {
                tracing::debug!("skipping undecodable packet: {e}");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
        sample_buf.copy_interleaved_ref(decoded);

        if !out.push_interleaved_blocking(sample_buf.samples()) {
            break;
        }
    }
    Ok(())
}

/// Best-effort duration in milliseconds from codec metadata.
fn duration_ms_from_codec_params(codec_params: &CodecParameters) -> Option<u64> {
    let frames = codec_params.n_frames?;
    let rate = codec_params.sample_rate? as u64;
    if rate == 0 {
        return None;
    }
    Some(frames.saturating_mul(1000) / rate)
}

fn codec_name_from_params(params: &CodecParameters) -> Option<String> {
    use symphonia::core::codecs::*;
    let name = match params.codec {
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_MP3 => "MP3",
        CODEC_TYPE_AAC => "AAC",
        CODEC_TYPE_ALAC => "ALAC",
        CODEC_TYPE_VORBIS => "VORBIS",
        CODEC_TYPE_OPUS => "OPUS",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM_S16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM_S24",
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "PCM_S32",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM_F32",
        _ => return None,
    };
    Some(name.to_string())
}
