use crate::engine::EngineState;
use crate::media::Media;
use crate::properties::{PlaybackProperties, PositionUnit};

/// The single deferred control call.
///
/// Recording a new task overwrites whatever was pending, so only the last
/// request made during a transition survives.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) enum PostponedTask {
    #[default]
    None,
    Play {
        token: u64,
        media: Media,
        props: PlaybackProperties,
    },
    Pause {
        paused: bool,
    },
    Seek {
        position: i64,
        unit: PositionUnit,
    },
    Stop,
    SetState {
        state: EngineState,
    },
}

impl PostponedTask {
    pub(crate) fn is_none(&self) -> bool {
        matches!(self, PostponedTask::None)
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            PostponedTask::None => "none",
            PostponedTask::Play { .. } => "play",
            PostponedTask::Pause { .. } => "pause",
            PostponedTask::Seek { .. } => "seek",
            PostponedTask::Stop => "stop",
            PostponedTask::SetState { .. } => "set-state",
        }
    }
}
