use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "cmdline-player", version, about = "Interactive gapless audio player")]
pub struct Args {
    /// Media to play right away, optionally followed by media to play next
    #[arg(value_name = "URI", num_args = 0..=2)]
    pub uris: Vec<String>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Position/buffer-level update interval in milliseconds
    #[arg(long)]
    pub update_interval_ms: Option<u64>,

    /// Remaining time (ms) below which the "about to end" event fires
    #[arg(long)]
    pub needs_next_ms: Option<u64>,

    /// Report every tag change from the periodic update instead of right away
    #[arg(long)]
    pub postpone_all_tags: bool,

    /// Optional TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Debug logging for the player and the pipeline
    #[arg(long, short)]
    pub verbose: bool,
}
