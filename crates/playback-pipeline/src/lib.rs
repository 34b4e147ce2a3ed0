//! Gapless playback pipeline.
//!
//! A [`Pipeline`] plays a current media item and keeps an optional next item
//! prerolled so it can follow without a gap. It owns the playback state
//! machine (idle, starting, seeking, buffering, playing, paused, stopping),
//! buffering policy and tag reporting, and drives an abstract
//! [`engine::MediaEngine`]. [`engine::local::LocalEngine`] renders local files
//! through Symphonia, Rubato and CPAL.

pub mod config;
pub mod engine;
pub mod media;
pub mod pipeline;
pub mod processing;
pub mod properties;
mod stream;
pub mod tag_list;

pub use config::PipelineConfig;
pub use media::Media;
pub use pipeline::{Callbacks, Pipeline};
pub use properties::{PlaybackProperties, PlayerState, PositionUnit, TransportProtocols};
pub use tag_list::TagList;
