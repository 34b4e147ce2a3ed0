//! Media engine capability consumed by the controller.
//!
//! An engine builds an [`OutputGraph`]: a shared output with a join point into
//! which [`DecodeUnit`]s are linked one after another for gapless playback.
//! Everything the engine does asynchronously comes back through the [`Bus`]
//! or through the per-unit [`UnitHooks`].

pub mod bus;
pub mod local;
#[cfg(test)]
pub(crate) mod mock;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

pub use bus::{Bus, BusMessage, Envelope, MessageSource, SourceFilter};

use crate::processing::AudioStage;
use crate::properties::{PlaybackProperties, PositionUnit};
use crate::tag_list::TagList;

/// Engine-level state of the output graph.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum EngineState {
    #[default]
    Null,
    Ready,
    Paused,
    Playing,
}

impl EngineState {
    pub fn name(self) -> &'static str {
        match self {
            EngineState::Null => "null",
            EngineState::Ready => "ready",
            EngineState::Paused => "paused",
            EngineState::Playing => "playing",
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Stable identity of a decode unit, never reused within a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(pub u64);

/// Buffer configuration pushed into a decode unit and its buffering queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferLimits {
    pub size_bytes: u32,
    /// Zero disables the time limit.
    pub timeout: Duration,
    pub low_percent: u32,
    pub high_percent: u32,
}

pub trait MediaEngine: Send {
    /// Build a fresh output graph. `stages` are spliced between the join
    /// point and the output in order.
    fn create_graph(&mut self, bus: Bus, stages: Vec<Arc<dyn AudioStage>>)
    -> Result<Box<dyn OutputGraph>>;
}

pub trait OutputGraph: Send {
    /// Request a state change. Completion is reported with a
    /// [`BusMessage::StateChanged`] from [`MessageSource::Graph`].
    fn set_state(&mut self, state: EngineState) -> Result<()>;
    fn query_position(&self, unit: PositionUnit) -> Option<i64>;
    fn query_duration(&self, unit: PositionUnit) -> Option<i64>;
    /// Flushing seek on the currently audible stream.
    fn seek(&mut self, position: i64, unit: PositionUnit) -> Result<()>;
    fn recalculate_latency(&mut self);
    /// Allocate a decode unit for `uri`. The unit stays inert until
    /// [`DecodeUnit::sync_state`] is called.
    fn create_decode_unit(
        &mut self,
        id: UnitId,
        uri: &str,
        props: &PlaybackProperties,
        hooks: Arc<dyn UnitHooks>,
    ) -> Result<Arc<dyn DecodeUnit>>;
}

pub trait DecodeUnit: Send + Sync {
    /// Bring the unit up to the graph's state and start discovery.
    fn sync_state(&self) -> Result<()>;
    fn apply_buffer_limits(&self, limits: &BufferLimits);
    /// Current fill of the buffering queue in bytes, if there is one.
    fn buffer_level(&self) -> Option<u32>;
    /// Latency query: `Some(true)` for live sources, `None` if unanswered.
    fn query_live(&self) -> Option<bool>;
    /// Run [`UnitHooks::before_queue_input`] ahead of every chunk entering
    /// the buffering queue.
    fn install_block_probe(&self);
    /// Give back the unit's slot in the join point.
    fn release_join(&self);
    /// Stop all work. Called after [`DecodeUnit::release_join`].
    fn shutdown(&self);
}

/// An output discovered on a decode unit, offered for linking.
pub trait DiscoveredOutput {
    fn is_linked(&self) -> bool;
    fn is_audio(&self) -> bool;
    /// Connect the output to the unit's slot in the join point.
    fn link(&mut self) -> Result<()>;
    fn query_seekable(&self) -> Option<bool>;
}

/// Notifications a decode unit delivers from engine threads.
///
/// Implementations must return quickly; only `before_queue_input` may block.
pub trait UnitHooks: Send + Sync {
    fn output_discovered(&self, output: &mut dyn DiscoveredOutput);
    fn buffer_queue_added(&self);
    /// Tags seen flowing through the unit, before they reach the output.
    fn tags_observed(&self, tags: &TagList);
    fn before_queue_input(&self);
    /// The unit's output delivered its last sample to the join point.
    fn output_eos(&self);
}
