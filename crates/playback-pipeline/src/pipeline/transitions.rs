//! How a graph state change is interpreted in each controller state.

use crate::engine::EngineState;
use crate::properties::PlayerState;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Transition {
    /// Preroll done: seek to the start position, then settle.
    StartingPaused,
    StartingPlaying,
    /// Paused after a flush request: perform the pending seek.
    SeekingPaused,
    SeekingPlaying,
    /// Paused for refill: resume unless the current unit still buffers.
    BufferingPaused,
    BufferingPlaying,
    SteadyPaused,
    SteadyPlaying,
    Ignore,
}

const TABLE: &[((PlayerState, EngineState), Transition)] = &[
    ((PlayerState::Starting, EngineState::Paused), Transition::StartingPaused),
    ((PlayerState::Starting, EngineState::Playing), Transition::StartingPlaying),
    ((PlayerState::Seeking, EngineState::Paused), Transition::SeekingPaused),
    ((PlayerState::Seeking, EngineState::Playing), Transition::SeekingPlaying),
    ((PlayerState::Buffering, EngineState::Paused), Transition::BufferingPaused),
    ((PlayerState::Buffering, EngineState::Playing), Transition::BufferingPlaying),
    ((PlayerState::Playing, EngineState::Paused), Transition::SteadyPaused),
    ((PlayerState::Playing, EngineState::Playing), Transition::SteadyPlaying),
    ((PlayerState::Paused, EngineState::Paused), Transition::SteadyPaused),
    ((PlayerState::Paused, EngineState::Playing), Transition::SteadyPlaying),
];

pub(crate) fn lookup(state: PlayerState, reached: EngineState) -> Transition {
    TABLE
        .iter()
        .find(|(key, _)| *key == (state, reached))
        .map_or(Transition::Ignore, |(_, t)| *t)
}
