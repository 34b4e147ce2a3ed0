//! Gapless playback controller.
//!
//! [`Pipeline`] is the public handle. Control calls take the controller lock,
//! either act right away or record a postponed task, and return without
//! waiting for the engine. A background thread runs the event loop that
//! reacts to bus messages and drives the periodic progress timer.

pub mod callbacks;
mod controller;
mod event_loop;
mod postponed;
mod transitions;


use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::Sender;

pub use callbacks::Callbacks;

use crate::config::PipelineConfig;
use crate::engine::MediaEngine;
use crate::media::Media;
use crate::processing::ProcessingObject;
use crate::properties::{PlaybackProperties, PlayerState, PositionUnit};
use crate::stream::lock;
use controller::Controller;

pub struct Pipeline {
    controller: Arc<Mutex<Controller>>,
    quit_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Create an idle pipeline and start its event loop.
    ///
    /// `processing` objects are spliced into every output graph in order.
    /// Failing to start the event-loop thread is the only error reported here.
    pub fn new(
        engine: Box<dyn MediaEngine>,
        config: PipelineConfig,
        callbacks: Callbacks,
        processing: Vec<Arc<dyn ProcessingObject>>,
    ) -> Result<Self> {
        let (bus_tx, bus_rx) = crossbeam_channel::unbounded();
        let (quit_tx, quit_rx) = crossbeam_channel::bounded(1);
        let update_interval = config.update_interval.max(Duration::from_millis(1));

        let controller = Arc::new(Mutex::new(Controller::new(
            engine,
            config,
            Arc::new(callbacks),
            processing,
            bus_tx,
        )));

        let loop_controller = controller.clone();
        let thread = std::thread::Builder::new()
            .name("pipeline-events".to_string())
            .spawn(move || event_loop::run(loop_controller, bus_rx, quit_rx, update_interval))
            .context("spawn pipeline event loop")?;

        Ok(Self {
            controller,
            quit_tx: Some(quit_tx),
            thread: Some(thread),
        })
    }

    /// Play `media` now, or queue it to follow the current media gaplessly.
    ///
    /// The media replaces the current one if the pipeline is idle, if
    /// `play_now` is set, or if `token` matches the current media's token.
    /// Returns `false` for invalid media or if playback could not start.
    pub fn play_media(
        &self,
        token: u64,
        media: Media,
        play_now: bool,
        props: PlaybackProperties,
    ) -> bool {
        lock(&self.controller).play_media(token, media, play_now, props)
    }

    pub fn stop(&self) {
        lock(&self.controller).stop();
    }

    /// Pause or resume. Live sources, and sources whose liveness is not
    /// known yet, are never paused.
    pub fn set_paused(&self, paused: bool) {
        lock(&self.controller).set_paused(paused);
    }

    /// Seek the current media. Ignored if it is not seekable.
    pub fn set_current_position(&self, position: i64, unit: PositionUnit) {
        lock(&self.controller).set_current_position(position, unit);
    }

    /// Current position, or `-1` if unknown.
    pub fn current_position(&self, unit: PositionUnit) -> i64 {
        lock(&self.controller).current_position(unit)
    }

    /// Duration of the current media, or `-1` if unknown.
    pub fn duration(&self, unit: PositionUnit) -> i64 {
        lock(&self.controller).duration(unit)
    }

    pub fn current_state(&self) -> PlayerState {
        lock(&self.controller).state()
    }

    pub fn is_transitioning(&self) -> bool {
        lock(&self.controller).is_transitioning()
    }

    /// Next value of a monotonically increasing token counter, starting at 0.
    pub fn new_token(&self) -> u64 {
        lock(&self.controller).new_token()
    }

    /// Always defer updates of tag `name` to the periodic tick (or stop doing so).
    pub fn force_postpone_tag(&self, name: &str, postpone: bool) {
        lock(&self.controller).force_postpone_tag(name, postpone);
    }

    /// `None` restores the default. Applies to the current media only.
    pub fn set_buffer_estimation_duration(&self, duration: Option<Duration>) {
        lock(&self.controller).set_buffer_estimation_duration(duration);
    }

    pub fn set_buffer_timeout(&self, timeout: Option<Duration>) {
        lock(&self.controller).set_buffer_timeout(timeout);
    }

    pub fn set_buffer_size_limit(&self, limit: Option<u32>) {
        lock(&self.controller).set_buffer_size_limit(limit);
    }

    pub fn set_buffer_thresholds(&self, low: Option<u32>, high: Option<u32>) {
        lock(&self.controller).set_buffer_thresholds(low, high);
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        lock(&self.controller).shutdown();
        if let Some(tx) = self.quit_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                tracing::error!("pipeline event loop panicked");
            }
        }
    }
}
