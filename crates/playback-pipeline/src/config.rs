use std::time::Duration;

/// Controller-wide tuning shared by every media played through a pipeline.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Remaining time below which `media_about_to_end` fires.
    pub needs_next_media_time: Duration,
    /// Period of the position/buffer-level polling timer.
    pub update_interval: Duration,
    /// Defer every tag update to the periodic tick instead of only the
    /// always-postponed names.
    pub postpone_all_tags: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            needs_next_media_time: Duration::from_secs(5),
            update_interval: Duration::from_millis(500),
            postpone_all_tags: false,
        }
    }
}
