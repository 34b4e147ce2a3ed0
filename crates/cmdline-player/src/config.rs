//! Configuration loading and resolution.
//!
//! CLI flags win over the TOML file, the file wins over built-in defaults.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use playback_pipeline::PipelineConfig;
use playback_pipeline::engine::local::LocalEngineConfig;

use crate::cli::Args;

/// Player configuration loaded from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlayerConfig {
    /// Output device substring.
    pub device: Option<String>,
    /// Preferred output sample rate in Hz.
    pub preferred_rate: Option<u32>,
    /// Resampler input chunk size in frames.
    pub chunk_frames: Option<usize>,
    /// Output callback refill cap in frames.
    pub refill_max_frames: Option<usize>,
    /// Decoded audio buffered per stage, in seconds.
    pub buffer_seconds: Option<f32>,
    pub update_interval_ms: Option<u64>,
    pub needs_next_ms: Option<u64>,
    pub postpone_all_tags: Option<bool>,
    /// Tag names always reported from the periodic update.
    pub postponed_tags: Option<Vec<String>>,
    /// Initial linear volume.
    pub volume: Option<f64>,
}

impl PlayerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        toml::from_str::<PlayerConfig>(&raw).with_context(|| format!("parse config {:?}", path))
    }
}

/// Everything the player needs, with every source applied.
#[derive(Debug)]
pub struct Settings {
    pub engine: LocalEngineConfig,
    pub pipeline: PipelineConfig,
    pub postponed_tags: Vec<String>,
    pub volume: Option<f64>,
}

impl Settings {
    pub fn resolve(args: &Args, file: PlayerConfig) -> Self {
        let engine_defaults = LocalEngineConfig::default();
        let pipeline_defaults = PipelineConfig::default();

        let engine = LocalEngineConfig {
            device: args.device.clone().or(file.device),
            preferred_rate: file.preferred_rate,
            chunk_frames: file.chunk_frames.unwrap_or(engine_defaults.chunk_frames),
            refill_max_frames: file
                .refill_max_frames
                .unwrap_or(engine_defaults.refill_max_frames),
            buffer_seconds: file.buffer_seconds.unwrap_or(engine_defaults.buffer_seconds),
        };

        let pipeline = PipelineConfig {
            needs_next_media_time: args
                .needs_next_ms
                .or(file.needs_next_ms)
                .map(Duration::from_millis)
                .unwrap_or(pipeline_defaults.needs_next_media_time),
            update_interval: args
                .update_interval_ms
                .or(file.update_interval_ms)
                .map(Duration::from_millis)
                .unwrap_or(pipeline_defaults.update_interval),
            postpone_all_tags: args.postpone_all_tags
                || file
                    .postpone_all_tags
                    .unwrap_or(pipeline_defaults.postpone_all_tags),
        };

        Self {
            engine,
            pipeline,
            postponed_tags: file.postponed_tags.unwrap_or_default(),
            volume: file.volume,
        }
    }
}
