//! Output stage (CPAL output stream).
//!
//! The stream lives on its own thread since `cpal::Stream` is not `Send` on
//! every host. The real-time callback renders from the join point:
//! - silence while paused, without draining anything
//! - channel mapping and processing stages in [`render`]
//! - conversion from `f32` to the device sample format

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{Sender, bounded};

use super::OutputFormat;
use super::device::{pick_buffer_size, pick_device, pick_output_config};
use super::join::{Join, MixState, render};

/// Keeps the output thread (and with it the stream) alive.
pub(super) struct OutputHandle {
    quit: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for OutputHandle {
    fn drop(&mut self) {
        drop(self.quit.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Open the output device and start streaming from `join`.
pub(super) fn start_output(
    join: Arc<Join>,
    device: Option<String>,
    preferred_rate: Option<u32>,
    refill_max_frames: usize,
) -> Result<(OutputHandle, OutputFormat)> {
    let (ready_tx, ready_rx) = bounded::<Result<OutputFormat>>(1);
    let (quit_tx, quit_rx) = bounded::<()>(0);

    let thread = thread::Builder::new()
        .name("local-output".into())
        .spawn(move || {
            let stream = match open_stream(&join, device.as_deref(), preferred_rate, refill_max_frames) {
                Ok((stream, format)) => {
                    let _ = ready_tx.send(Ok(format));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            // Returns once the handle drops its sender.
            let _ = quit_rx.recv();
            drop(stream);
            tracing::debug!("output stream closed");
        })
        .context("spawn output thread")?;

    let handle = OutputHandle {
        quit: Some(quit_tx),
        thread: Some(thread),
    };
    let format = ready_rx
        .recv()
        .map_err(|_| anyhow!("output thread exited early"))??;
    Ok((handle, format))
}

fn open_stream(
    join: &Arc<Join>,
    device: Option<&str>,
    preferred_rate: Option<u32>,
    refill_max_frames: usize,
) -> Result<(cpal::Stream, OutputFormat)> {
    let host = cpal::default_host();
    let device = pick_device(&host, device)?;
    let supported = pick_output_config(&device, preferred_rate)?;
    let sample_format = supported.sample_format();
    let mut config: cpal::StreamConfig = supported.config();
    if let Some(size) = pick_buffer_size(&supported) {
        config.buffer_size = size;
    }

    let name = device
        .description()
        .map(|d| d.name().to_string())
        .unwrap_or_else(|_| "unknown".into());
    tracing::info!(
        device = %name,
        rate = config.sample_rate,
        channels = config.channels,
        format = ?sample_format,
        "opening output"
    );

    let stream = match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, join, refill_max_frames),
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, join, refill_max_frames),
        cpal::SampleFormat::I32 => build_stream::<i32>(&device, &config, join, refill_max_frames),
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, join, refill_max_frames),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }?;
    stream.play()?;

    let format = OutputFormat {
        rate: config.sample_rate,
        channels: usize::from(config.channels),
    };
    Ok((stream, format))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    join: &Arc<Join>,
    refill_max_frames: usize,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels_out = usize::from(config.channels).max(1);
    let refill_max_frames = refill_max_frames.max(1);
    let join = join.clone();
    let mut state = MixState::new();

    let err_fn = |err| tracing::warn!("stream error: {err}");

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            let rendered = render(&join, &mut state, channels_out, refill_max_frames, data.len());
            for (dst, src) in data.iter_mut().zip(rendered) {
                *dst = <T as cpal::Sample>::from_sample::<f32>(*src);
            }
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}
