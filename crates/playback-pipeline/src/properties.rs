//! Per-request playback properties, position units and controller states.

use std::fmt;
use std::time::Duration;

/// Default window used to turn a bitrate into a byte limit.
pub const DEFAULT_BUFFER_ESTIMATION_DURATION: Duration = Duration::from_secs(2);
/// Default time after which a filling buffer reports completion.
pub const DEFAULT_BUFFER_TIMEOUT: Duration = Duration::from_secs(2);
/// Default absolute buffer size limit in bytes.
pub const DEFAULT_BUFFER_SIZE_LIMIT: u32 = 2 * 1024 * 1024;
/// Default low watermark (percent).
pub const DEFAULT_LOW_BUFFER_THRESHOLD: u32 = 10;
/// Default high watermark (percent).
pub const DEFAULT_HIGH_BUFFER_THRESHOLD: u32 = 99;

/// Unit used for positions and durations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PositionUnit {
    #[default]
    Nanoseconds,
    Bytes,
}

impl PositionUnit {
    pub fn name(self) -> &'static str {
        match self {
            PositionUnit::Nanoseconds => "nanoseconds",
            PositionUnit::Bytes => "bytes",
        }
    }
}

/// Caller-visible controller state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PlayerState {
    #[default]
    Idle,
    Starting,
    Stopping,
    Seeking,
    Buffering,
    Playing,
    Paused,
}

impl PlayerState {
    pub fn name(self) -> &'static str {
        match self {
            PlayerState::Idle => "idle",
            PlayerState::Starting => "starting",
            PlayerState::Stopping => "stopping",
            PlayerState::Seeking => "seeking",
            PlayerState::Buffering => "buffering",
            PlayerState::Playing => "playing",
            PlayerState::Paused => "paused",
        }
    }

    /// States in which mutating calls are postponed instead of executed.
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            PlayerState::Starting
                | PlayerState::Stopping
                | PlayerState::Seeking
                | PlayerState::Buffering
        )
    }
}

impl fmt::Display for PlayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Bit set of transports a network source may use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TransportProtocols(u32);

impl TransportProtocols {
    pub const UDP: TransportProtocols = TransportProtocols(0x01);
    pub const TCP: TransportProtocols = TransportProtocols(0x02);

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Self {
        Self(bits & (Self::UDP.0 | Self::TCP.0))
    }

    pub fn contains(self, other: TransportProtocols) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for TransportProtocols {
    type Output = TransportProtocols;

    fn bitor(self, rhs: Self) -> Self::Output {
        TransportProtocols(self.0 | rhs.0)
    }
}

/// Configuration snapshot for a single `play_media` request.
///
/// Buffering fields left at `None` fall back to the `DEFAULT_*` constants.
/// Transport hints are passed through to the media engine untouched.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PlaybackProperties {
    /// Stay paused once the media is ready instead of starting playback.
    pub start_paused: bool,
    /// Initial position; values `<= 0` start at the beginning.
    pub start_at_position: i64,
    pub start_at_position_unit: PositionUnit,
    pub buffer_estimation_duration: Option<Duration>,
    pub buffer_timeout: Option<Duration>,
    pub buffer_size_limit: Option<u32>,
    pub low_buffer_threshold: Option<u32>,
    pub high_buffer_threshold: Option<u32>,
    pub jitter_buffer_length: Option<Duration>,
    pub do_retransmissions: Option<bool>,
    pub allowed_transports: Option<TransportProtocols>,
}
