//! Caller-facing notifications.
//!
//! Callbacks run on the pipeline's event-loop thread with the controller lock
//! held, or on engine threads for seekability and liveness reports. They must
//! not call back into the [`Pipeline`](super::Pipeline).

use crate::media::Media;
use crate::properties::{PlayerState, PositionUnit};
use crate::tag_list::TagList;

pub type MediaCallback = Box<dyn Fn(&Media, u64) + Send + Sync>;
pub type MessageCallback = Box<dyn Fn(&str) + Send + Sync>;
pub type FlagCallback = Box<dyn Fn(&Media, u64, bool, bool) + Send + Sync>;
pub type ValueCallback = Box<dyn Fn(&Media, u64, i64, PositionUnit) + Send + Sync>;

/// Every notification is optional; unset ones are skipped.
#[derive(Default)]
pub struct Callbacks {
    pub media_started: Option<MediaCallback>,
    pub end_of_stream: Option<Box<dyn Fn() + Send + Sync>>,
    pub info: Option<MessageCallback>,
    pub warning: Option<MessageCallback>,
    pub error: Option<MessageCallback>,
    /// `(media, token, tags)` with only the tags that changed.
    pub new_tags: Option<Box<dyn Fn(&Media, u64, &TagList) + Send + Sync>>,
    /// `(media, token, level_bytes, limit_bytes)`.
    pub buffer_level: Option<Box<dyn Fn(&Media, u64, u32, u32) + Send + Sync>>,
    pub state_changed: Option<Box<dyn Fn(PlayerState, PlayerState) + Send + Sync>>,
    /// `(media, token, is_current, percent, level_bytes, limit_bytes)`.
    pub buffering_updated:
        Option<Box<dyn Fn(&Media, u64, bool, u32, Option<u32>, u32) + Send + Sync>>,
    pub duration_updated: Option<ValueCallback>,
    /// `(media, token, is_current, seekable)`.
    pub is_seekable: Option<FlagCallback>,
    /// `(media, token, is_current, live)`.
    pub is_live: Option<FlagCallback>,
    pub position_updated: Option<ValueCallback>,
    pub media_about_to_end: Option<MediaCallback>,
}

impl Callbacks {
    pub(crate) fn emit_state_changed(&self, old: PlayerState, new: PlayerState) {
        if let Some(cb) = &self.state_changed {
            cb(old, new);
        }
    }

    pub(crate) fn emit_media_started(&self, media: &Media, token: u64) {
        if let Some(cb) = &self.media_started {
            cb(media, token);
        }
    }

    pub(crate) fn emit_end_of_stream(&self) {
        if let Some(cb) = &self.end_of_stream {
            cb();
        }
    }

    pub(crate) fn emit_info(&self, text: &str) {
        if let Some(cb) = &self.info {
            cb(text);
        }
    }

    pub(crate) fn emit_warning(&self, text: &str) {
        if let Some(cb) = &self.warning {
            cb(text);
        }
    }

    pub(crate) fn emit_error(&self, text: &str) {
        if let Some(cb) = &self.error {
            cb(text);
        }
    }

    pub(crate) fn emit_is_seekable(&self, media: &Media, token: u64, is_current: bool, seekable: bool) {
        if let Some(cb) = &self.is_seekable {
            cb(media, token, is_current, seekable);
        }
    }

    pub(crate) fn emit_is_live(&self, media: &Media, token: u64, is_current: bool, live: bool) {
        if let Some(cb) = &self.is_live {
            cb(media, token, is_current, live);
        }
    }

    pub(crate) fn emit_about_to_end(&self, media: &Media, token: u64) {
        if let Some(cb) = &self.media_about_to_end {
            cb(media, token);
        }
    }
}
