//! Streaming resample stage.
//!
//! Uses Rubato to convert a unit's decoded interleaved `f32` audio from the
//! source rate to the output device rate. Runs in a background thread between
//! the decoder's queue and the queue linked into the join point.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::{Context, Result};
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

use super::queue::{PopStrategy, SharedAudio};

/// Start a resampler thread from `srcq` at `src_rate` into `dstq` at `dst_rate`.
///
/// `dstq` is closed once `srcq` is closed and drained, on error, or when
/// `cancel` is raised.
pub(super) fn start_resampler(
    name: String,
    srcq: Arc<SharedAudio>,
    dstq: Arc<SharedAudio>,
    src_rate: u32,
    dst_rate: u32,
    chunk_frames: usize,
    cancel: Arc<AtomicBool>,
) -> Result<()> {
    let channels = srcq.channels();
    let f_ratio = f64::from(dst_rate) / f64::from(src_rate.max(1));

    let sinc_len = 128;
    let window = WindowFunction::BlackmanHarris2;
    let params = SincInterpolationParameters {
        sinc_len,
        f_cutoff: calculate_cutoff(sinc_len, window),
        interpolation: SincInterpolationType::Cubic,
        oversampling_factor: 256,
        window,
    };

    let chunk_in_frames = chunk_frames.max(1);

    thread::Builder::new()
        .name(name)
        .spawn(move || {
            let mut resampler: Box<dyn Resampler<f32>> = match Async::<f32>::new_sinc(
                f_ratio,
                1.1,
                &params,
                chunk_in_frames,
                channels,
                FixedAsync::Input,
            ) {
                Ok(r) => Box::new(r),
                Err(e) => {
                    tracing::error!("resampler init error: {e:#}");
                    dstq.close();
                    return;
                }
            };

            let mut out_interleaved = vec![0.0f32; channels * chunk_in_frames * 3];
            let mut indexing = Indexing {
                input_offset: 0,
                output_offset: 0,
                active_channels_mask: None,
                partial_len: None,
            };

            let mut process = |input: &[f32], frames: usize, partial: Option<usize>| -> Option<usize> {
                let input_adapter = match InterleavedSlice::new(input, channels, frames) {
                    Ok(a) => a,
                    Err(e) => {
                        tracing::error!("interleaved slice (input) error: {e:#}");
                        return None;
                    }
                };
                let out_capacity_frames = out_interleaved.len() / channels;
                let mut output_adapter = match InterleavedSlice::new_mut(
                    &mut out_interleaved,
                    channels,
                    out_capacity_frames,
                ) {
                    Ok(a) => a,
                    Err(e) => {
                        tracing::error!("interleaved slice (output) error: {e:#}");
                        return None;
                    }
                };

                indexing.input_offset = 0;
                indexing.output_offset = 0;
                indexing.partial_len = partial;

                match resampler.process_into_buffer(&input_adapter, &mut output_adapter, Some(&indexing)) {
                    Ok((_nbr_in, nbr_out)) => {
                        let produced = nbr_out * channels;
                        if produced == 0 || dstq.push_interleaved_blocking(&out_interleaved[..produced]) {
                            Some(produced)
                        } else {
                            None
                        }
                    }
                    Err(e) => {
                        tracing::error!("resampler process error: {e:#}");
                        None
                    }
                }
            };

            let mut failed = false;
            while let Some(chunk) = srcq.pop(PopStrategy::BlockingExact { frames: chunk_in_frames }) {
                if cancel.load(Ordering::Acquire) || process(&chunk, chunk_in_frames, None).is_none() {
                    failed = true;
                    break;
                }
            }

            if !failed {
                while let Some(tail) = srcq.pop(PopStrategy::BlockingUpTo { max_frames: chunk_in_frames }) {
                    let tail_frames = tail.len() / channels;
                    if tail_frames == 0 {
                        continue;
                    }
                    if cancel.load(Ordering::Acquire)
                        || process(&tail, tail_frames, Some(tail_frames)).is_none()
                    {
                        break;
                    }
                }
            }

            srcq.close();
            dstq.close();
        })
        .context("spawn resampler thread")?;
    Ok(())
}
