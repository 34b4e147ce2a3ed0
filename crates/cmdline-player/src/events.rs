//! Pipeline callbacks that print one line per event to stderr.

use playback_pipeline::{Callbacks, Media, PlayerState, PositionUnit, TagList};

fn value_line(what: &str, media: &Media, token: u64, value: i64, unit: PositionUnit) -> String {
    match unit {
        PositionUnit::Nanoseconds => format!(
            "Current {what} for media with URI {} and token {token} in ms: {}",
            media.uri(),
            value / 1_000_000
        ),
        PositionUnit::Bytes => format!(
            "Current {what} for media with URI {} and token {token} in bytes: {value}",
            media.uri()
        ),
    }
}

pub fn printing_callbacks() -> Callbacks {
    Callbacks {
        media_started: Some(Box::new(|media: &Media, token: u64| {
            eprintln!("Media started with uri {} and token {token}", media.uri());
        })),
        end_of_stream: Some(Box::new(|| eprintln!("End-Of-Stream reported"))),
        info: Some(Box::new(|text: &str| eprintln!("Info message: {text}"))),
        warning: Some(Box::new(|text: &str| eprintln!("Warning message: {text}"))),
        error: Some(Box::new(|text: &str| eprintln!("Error message: {text}"))),
        new_tags: Some(Box::new(|media: &Media, token: u64, tags: &TagList| {
            eprintln!(
                "New tags for current media with URI {} and token {token}: {tags}",
                media.uri()
            );
        })),
        buffer_level: Some(Box::new(|media: &Media, token: u64, level: u32, limit: u32| {
            tracing::trace!(uri = %media.uri(), token, level, limit, "buffer level");
        })),
        state_changed: Some(Box::new(|old: PlayerState, new: PlayerState| {
            eprintln!("State change: old: {old} new: {new}");
        })),
        buffering_updated: Some(Box::new(
            |media: &Media, token: u64, is_current: bool, percent: u32, level: Option<u32>, limit: u32| {
                let level = level.map_or_else(|| "unknown".to_string(), |l| l.to_string());
                eprintln!(
                    "Buffering: {percent}  media uri: {} token: {token}  current: {is_current}  level: {level}/{limit}",
                    media.uri()
                );
            },
        )),
        duration_updated: Some(Box::new(
            |media: &Media, token: u64, value: i64, unit: PositionUnit| {
                eprintln!("{}", value_line("duration", media, token, value, unit));
            },
        )),
        is_seekable: Some(Box::new(
            |media: &Media, token: u64, is_current: bool, seekable: bool| {
                eprintln!(
                    "Media with URI {} and token {token} (current: {is_current}) seekable: {seekable}",
                    media.uri()
                );
            },
        )),
        is_live: Some(Box::new(
            |media: &Media, token: u64, is_current: bool, live: bool| {
                eprintln!(
                    "Media with URI {} and token {token} (current: {is_current}) live: {live}",
                    media.uri()
                );
            },
        )),
        position_updated: Some(Box::new(
            |media: &Media, token: u64, value: i64, unit: PositionUnit| {
                eprintln!("{}", value_line("position", media, token, value, unit));
            },
        )),
        media_about_to_end: Some(Box::new(|media: &Media, token: u64| {
            eprintln!("Media with uri {} and token {token} about to end", media.uri());
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_print_in_milliseconds_or_bytes() {
        let media = Media::new("file:///a.flac");
        assert_eq!(
            value_line("duration", &media, 3, 2_500_000_000, PositionUnit::Nanoseconds),
            "Current duration for media with URI file:///a.flac and token 3 in ms: 2500"
        );
        assert_eq!(
            value_line("position", &media, 3, 4096, PositionUnit::Bytes),
            "Current position for media with URI file:///a.flac and token 3 in bytes: 4096"
        );
    }

    #[test]
    fn every_callback_is_set() {
        let cb = printing_callbacks();
        assert!(cb.media_started.is_some() && cb.end_of_stream.is_some());
        assert!(cb.new_tags.is_some() && cb.buffering_updated.is_some());
        assert!(cb.position_updated.is_some() && cb.media_about_to_end.is_some());
    }
}
