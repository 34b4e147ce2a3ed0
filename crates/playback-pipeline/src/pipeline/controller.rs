//! The playback state machine.
//!
//! Every method here expects the caller to hold the controller lock: the
//! public [`Pipeline`](super::Pipeline) handle for control calls, the event
//! loop for bus messages and timer ticks.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::Sender;

use super::callbacks::Callbacks;
use super::postponed::PostponedTask;
use super::transitions::{self, Transition};
use crate::config::PipelineConfig;
use crate::engine::{
    Bus, BusMessage, EngineState, Envelope, MediaEngine, MessageSource, OutputGraph, SourceFilter,
    UnitId,
};
use crate::media::Media;
use crate::processing::ProcessingObject;
use crate::properties::{PlaybackProperties, PlayerState, PositionUnit};
use crate::stream::{StreamUnit, UnitContext};
use crate::tag_list::{
    MergeMode, TAG_BITRATE, TAG_MAXIMUM_BITRATE, TAG_MINIMUM_BITRATE, TagList, calculate_new_tags,
};

pub(crate) struct Controller {
    engine: Box<dyn MediaEngine>,
    graph: Option<Box<dyn OutputGraph>>,
    bus: Option<Bus>,
    bus_tx: Sender<Envelope>,
    epoch: u64,
    processing: Vec<Arc<dyn ProcessingObject>>,
    ctx: Arc<UnitContext>,
    callbacks: Arc<Callbacks>,
    config: PipelineConfig,

    state: PlayerState,
    current: Option<StreamUnit>,
    next: Option<StreamUnit>,
    postponed: PostponedTask,
    seek_target: Option<(i64, PositionUnit)>,
    seek_was_paused: bool,

    engine_state: EngineState,
    pending_engine_state: Option<EngineState>,
    duration_ns: i64,
    duration_bytes: i64,
    force_duration_update: bool,
    about_to_end_blocked: bool,

    tags: TagList,
    postponed_tags: TagList,
    always_postpone: BTreeSet<String>,

    next_token: u64,
    next_unit_id: u64,
    timers_enabled: bool,
}

impl Controller {
    pub(crate) fn new(
        engine: Box<dyn MediaEngine>,
        config: PipelineConfig,
        callbacks: Arc<Callbacks>,
        processing: Vec<Arc<dyn ProcessingObject>>,
        bus_tx: Sender<Envelope>,
    ) -> Self {
        let always_postpone = [TAG_MINIMUM_BITRATE, TAG_MAXIMUM_BITRATE, TAG_BITRATE]
            .into_iter()
            .map(String::from)
            .collect();
        Self {
            engine,
            graph: None,
            bus: None,
            bus_tx,
            epoch: 0,
            processing,
            ctx: Arc::new(UnitContext::new(callbacks.clone())),
            callbacks,
            config,
            state: PlayerState::Idle,
            current: None,
            next: None,
            postponed: PostponedTask::None,
            seek_target: None,
            seek_was_paused: false,
            engine_state: EngineState::Null,
            pending_engine_state: None,
            duration_ns: -1,
            duration_bytes: -1,
            force_duration_update: true,
            about_to_end_blocked: false,
            tags: TagList::new(),
            postponed_tags: TagList::new(),
            always_postpone,
            next_token: 0,
            next_unit_id: 0,
            timers_enabled: false,
        }
    }

    // ---- queries ----

    pub(crate) fn state(&self) -> PlayerState {
        self.state
    }

    pub(crate) fn timers_enabled(&self) -> bool {
        self.timers_enabled
    }

    pub(crate) fn is_transitioning(&self) -> bool {
        self.state.is_transitional() || self.pending_engine_state.is_some()
    }

    pub(crate) fn new_token(&mut self) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        token
    }

    pub(crate) fn current_position(&self, unit: PositionUnit) -> i64 {
        if self.state == PlayerState::Idle {
            return -1;
        }
        self.graph
            .as_ref()
            .and_then(|g| g.query_position(unit))
            .unwrap_or(-1)
    }

    pub(crate) fn duration(&self, unit: PositionUnit) -> i64 {
        match unit {
            PositionUnit::Nanoseconds => self.duration_ns,
            PositionUnit::Bytes => self.duration_bytes,
        }
    }

    #[cfg(test)]
    pub(crate) fn slot_tokens(&self) -> (Option<u64>, Option<u64>) {
        (
            self.current.as_ref().map(StreamUnit::token),
            self.next.as_ref().map(StreamUnit::token),
        )
    }

    pub(crate) fn force_postpone_tag(&mut self, name: &str, postpone: bool) {
        if postpone {
            self.always_postpone.insert(name.to_string());
        } else {
            self.always_postpone.remove(name);
        }
    }

    // ---- buffering setters (current unit only) ----

    pub(crate) fn set_buffer_estimation_duration(&self, duration: Option<Duration>) {
        if let Some(cur) = &self.current {
            cur.set_buffer_estimation_duration(duration);
        }
    }

    pub(crate) fn set_buffer_timeout(&self, timeout: Option<Duration>) {
        if let Some(cur) = &self.current {
            cur.set_buffer_timeout(timeout);
        }
    }

    pub(crate) fn set_buffer_size_limit(&self, limit: Option<u32>) {
        if let Some(cur) = &self.current {
            cur.set_buffer_size_limit(limit);
        }
    }

    pub(crate) fn set_buffer_thresholds(&self, low: Option<u32>, high: Option<u32>) {
        if let Some(cur) = &self.current {
            cur.set_buffer_thresholds(low, high);
        }
    }

    // ---- control calls ----

    pub(crate) fn play_media(
        &mut self,
        token: u64,
        media: Media,
        play_now: bool,
        props: PlaybackProperties,
    ) -> bool {
        let replaces_current = self.state == PlayerState::Idle
            || play_now
            || self.current.as_ref().is_some_and(|c| c.token() == token);
        if replaces_current {
            self.play_as_current(token, media, props)
        } else {
            self.queue_as_next(token, media, props)
        }
    }

    fn play_as_current(&mut self, token: u64, media: Media, props: PlaybackProperties) -> bool {
        if !media.is_valid() {
            tracing::error!("cannot play invalid media");
            return false;
        }
        tracing::debug!(uri = %media.uri(), token, "playing media now");

        if self.is_transitioning() {
            self.postpone(PostponedTask::Play {
                token,
                media,
                props,
            });
            return true;
        }

        if let Err(e) = self.reinitialize() {
            tracing::error!("(re)initializing pipeline failed, aborting play attempt: {e:#}");
            return false;
        }

        self.next = None;
        self.set_state(PlayerState::Starting);

        let unit = match self.create_unit(token, media, props) {
            Ok(unit) => unit,
            Err(e) => {
                tracing::error!("could not set up current stream: {e:#}");
                self.reinitialize_after_failure();
                return false;
            }
        };
        self.ctx.set_current(Some(unit.id()));
        let synced = unit.sync_state();
        self.current = Some(unit);

        let started = synced.and_then(|_| self.set_engine_state(EngineState::Paused));
        if let Err(e) = started {
            // Do not retry: the failure may come from the media itself.
            tracing::error!("could not switch pipeline to paused, reinitializing: {e:#}");
            self.reinitialize_after_failure();
            return false;
        }
        true
    }

    fn queue_as_next(&mut self, token: u64, media: Media, props: PlaybackProperties) -> bool {
        tracing::debug!(uri = %media.uri(), token, "queuing media as next");
        self.next = None;
        if !media.is_valid() {
            tracing::error!("cannot schedule invalid media as next one");
            return false;
        }

        let unit = match self.create_unit(token, media, props) {
            Ok(unit) => unit,
            Err(e) => {
                tracing::error!("could not set up next stream: {e:#}");
                return false;
            }
        };
        if let Err(e) = unit.sync_state() {
            tracing::error!("could not start next stream: {e:#}");
            return false;
        }
        // Next media buffers until full; it is not audible yet.
        unit.enable_buffering_timeout(false);
        if self.current.as_ref().is_some_and(|c| c.is_buffering()) {
            unit.block_buffering(true);
        }
        self.next = Some(unit);
        true
    }

    pub(crate) fn stop(&mut self) {
        if self.graph.is_none() || matches!(self.state, PlayerState::Stopping | PlayerState::Idle)
        {
            return;
        }
        if self.is_transitioning() {
            self.postpone(PostponedTask::Stop);
            return;
        }
        self.shutdown_pipeline(true);
    }

    pub(crate) fn set_paused(&mut self, paused: bool) {
        if self.graph.is_none() || self.state == PlayerState::Idle {
            return;
        }
        // A pause is only redundant once the graph settled in PAUSED. Starting
        // and seeking pass through a pending PAUSED of their own.
        let redundant = if paused {
            self.engine_state == EngineState::Paused && self.pending_engine_state.is_none()
        } else {
            self.pending_engine_state.unwrap_or(self.engine_state) == EngineState::Playing
        };
        if redundant {
            return;
        }
        let Some(cur) = &self.current else {
            return;
        };
        if !cur.is_live_known() || cur.is_live() {
            tracing::info!("not pausing: current media is live or its liveness is unknown");
            return;
        }
        if self.is_transitioning() {
            self.postpone(PostponedTask::Pause { paused });
            return;
        }

        let state = if paused {
            EngineState::Paused
        } else {
            EngineState::Playing
        };
        if let Err(e) = self.set_engine_state(state) {
            tracing::error!("could not change pause state: {e:#}");
        }
    }

    pub(crate) fn set_current_position(&mut self, position: i64, unit: PositionUnit) {
        if self.graph.is_none() || self.state == PlayerState::Idle {
            return;
        }
        let Some(cur) = &self.current else {
            return;
        };
        if !cur.is_seekable() {
            tracing::info!(uri = %cur.media().uri(), "media is not seekable");
            return;
        }
        if self.is_transitioning() {
            self.postpone(PostponedTask::Seek { position, unit });
            return;
        }
        if !matches!(self.state, PlayerState::Paused | PlayerState::Playing) {
            return;
        }

        self.seek_was_paused = self.state == PlayerState::Paused;
        self.seek_target = Some((position, unit));
        self.set_state(PlayerState::Seeking);

        if self.seek_was_paused {
            self.finish_seeking(true);
        } else if let Err(e) = self.set_engine_state(EngineState::Paused) {
            tracing::error!("could not pause for seeking: {e:#}");
            self.seek_target = None;
            self.set_state(PlayerState::Playing);
        }
    }

    // ---- event loop entry points ----

    pub(crate) fn handle_envelope(&mut self, envelope: Envelope) {
        if envelope.epoch != self.epoch {
            tracing::trace!(epoch = envelope.epoch, "dropping message from a previous graph");
            return;
        }
        self.handle_bus_message(envelope.message);
    }

    pub(crate) fn handle_bus_message(&mut self, message: BusMessage) {
        self.make_next_stream_current();
        tracing::trace!(?message, state = %self.state, "bus message");

        match message {
            BusMessage::StreamEos => {}
            BusMessage::StreamStart => self.on_stream_start(),
            BusMessage::Eos => self.on_eos(),
            BusMessage::StateChanged {
                source,
                old,
                new,
                pending,
            } => {
                if source == MessageSource::Graph && pending != Some(EngineState::Null) {
                    self.on_state_changed(old, new, pending);
                }
            }
            BusMessage::Tag { source, tags } => self.on_tags(source, &tags),
            BusMessage::Info { text, .. } => {
                tracing::info!(message = %text, "engine info");
                self.callbacks.emit_info(&text);
            }
            BusMessage::Warning { text, .. } => {
                tracing::warn!(message = %text, "engine warning");
                self.callbacks.emit_warning(&text);
            }
            BusMessage::Error { text, .. } => {
                tracing::error!(message = %text, "engine error, reinitializing pipeline");
                self.callbacks.emit_error(&text);
                self.reinitialize_after_failure();
            }
            BusMessage::Buffering { source, percent } => self.on_buffering(source, percent),
            BusMessage::DurationChanged { source } => {
                if source != MessageSource::Join {
                    self.update_durations();
                }
            }
            BusMessage::Latency => {
                if let Some(graph) = self.graph.as_mut() {
                    graph.recalculate_latency();
                }
            }
            BusMessage::RequestState { state } => {
                if self.is_transitioning() {
                    self.postpone(PostponedTask::SetState { state });
                } else if let Err(e) = self.set_engine_state(state) {
                    tracing::error!("requested state change failed: {e:#}");
                }
            }
        }
    }

    /// Periodic timer: flush postponed tags and report progress.
    pub(crate) fn on_tick(&mut self) {
        self.make_next_stream_current();

        if !self.postponed_tags.is_empty() {
            let tags = std::mem::take(&mut self.postponed_tags);
            if let (Some(cb), Some(cur)) = (&self.callbacks.new_tags, &self.current) {
                cb(cur.media(), cur.token(), &tags);
            }
        }

        if self.state != PlayerState::Playing {
            return;
        }
        let (Some(graph), Some(cur)) = (&self.graph, &self.current) else {
            return;
        };

        if let (Some(cb), Some(level)) = (&self.callbacks.buffer_level, cur.current_buffer_level()) {
            cb(cur.media(), cur.token(), level, cur.effective_buffer_limit());
        }

        let Some(position) = graph.query_position(PositionUnit::Nanoseconds) else {
            tracing::info!("could not query position");
            return;
        };
        if let Some(cb) = &self.callbacks.position_updated {
            cb(cur.media(), cur.token(), position, PositionUnit::Nanoseconds);
        }

        let needs_next = i64::try_from(self.config.needs_next_media_time.as_nanos())
            .unwrap_or(i64::MAX);
        if !self.about_to_end_blocked
            && self.duration_ns != -1
            && self.duration_ns - position < needs_next
        {
            self.about_to_end_blocked = true;
            self.callbacks.emit_about_to_end(cur.media(), cur.token());
        }
    }

    /// Tear the graph down for good, dropping any postponed task.
    pub(crate) fn shutdown(&mut self) {
        self.postponed = PostponedTask::None;
        self.shutdown_pipeline(false);
    }

    // ---- bus handlers ----

    fn on_stream_start(&mut self) {
        self.about_to_end_blocked = false;
        self.tags = TagList::new();
        self.postponed_tags = TagList::new();

        let Some((media, token)) = self.current.as_ref().map(|c| (c.media().clone(), c.token()))
        else {
            tracing::warn!("stream started without a current stream, reinitializing");
            self.reinitialize_after_failure();
            return;
        };

        tracing::debug!(uri = %media.uri(), token, "media started");
        self.force_duration_update = true;
        self.update_durations();
        self.callbacks.emit_media_started(&media, token);

        if let Some(cur) = &self.current {
            if !cur.is_live_known() {
                cur.recheck_live_status(true);
            }
            cur.enable_buffering_timeout(true);
            cur.block_buffering(false);
        }
        self.recheck_buffering();
    }

    fn on_eos(&mut self) {
        if let Some(next) = self.next.take() {
            let token = next.token();
            let media = next.media().clone();
            let props = next.properties().clone();
            tracing::debug!(uri = %media.uri(), token, "end of stream reached, playing next media");
            drop(next);
            self.play_media(token, media, true, props);
        } else {
            tracing::debug!("end of stream reached, no next media");
            self.stop();
            self.callbacks.emit_end_of_stream();
        }
    }

    fn on_state_changed(&mut self, old: EngineState, new: EngineState, pending: Option<EngineState>) {
        tracing::debug!(%old, %new, ?pending, state = %self.state, "graph state changed");
        self.engine_state = new;
        if self.pending_engine_state == Some(new) {
            self.pending_engine_state = pending;
        }

        let mut enable_timers = false;
        match transitions::lookup(self.state, new) {
            Transition::StartingPaused => self.on_started_paused(),
            Transition::StartingPlaying => {
                enable_timers = true;
                self.set_state(PlayerState::Playing);
            }
            Transition::SeekingPaused => {
                if old != EngineState::Paused && self.seek_target.is_some() {
                    self.finish_seeking(true);
                }
            }
            Transition::SeekingPlaying | Transition::BufferingPlaying => {
                enable_timers = true;
                self.set_state(PlayerState::Playing);
                self.handle_postponed_task();
            }
            Transition::BufferingPaused => {
                if self.current.as_ref().is_some_and(|c| !c.is_buffering()) {
                    self.request_engine_state(EngineState::Playing);
                }
            }
            Transition::SteadyPaused => {
                if self.state != PlayerState::Paused {
                    self.set_state(PlayerState::Paused);
                    self.handle_postponed_task();
                }
            }
            Transition::SteadyPlaying => {
                enable_timers = true;
                if self.state != PlayerState::Playing {
                    self.set_state(PlayerState::Playing);
                    self.handle_postponed_task();
                }
            }
            Transition::Ignore => {}
        }

        // A postponed task may have torn the graph down meanwhile.
        self.timers_enabled = enable_timers && self.graph.is_some();
    }

    fn on_started_paused(&mut self) {
        self.update_durations();

        let Some(cur) = &self.current else {
            return;
        };
        let props = cur.properties().clone();
        if props.start_at_position > 0 && cur.is_seekable() {
            self.seek_was_paused = props.start_paused;
            self.seek_target = Some((props.start_at_position, props.start_at_position_unit));
            self.set_state(PlayerState::Seeking);
            self.finish_seeking(false);
        }

        let Some(cur) = &self.current else {
            return;
        };
        if props.start_paused {
            tracing::debug!("media ready and supposed to start paused");
            self.set_state(PlayerState::Paused);
            self.handle_postponed_task();
        } else if !cur.is_live() && cur.is_buffering() {
            tracing::debug!("current stream still buffering during startup");
            self.set_state(PlayerState::Buffering);
        } else {
            self.set_state(PlayerState::Paused);
            self.request_engine_state(EngineState::Playing);
        }
    }

    fn on_tags(&mut self, source: MessageSource, tags: &TagList) {
        let Some(cb) = &self.callbacks.new_tags else {
            return;
        };
        if let MessageSource::Unit(id) = source {
            if self.current.as_ref().map(StreamUnit::id) != Some(id) {
                tracing::trace!(unit = id.0, "ignoring tags from a stream that is not current");
                return;
            }
        }

        let mut diff = calculate_new_tags(&self.tags, tags);
        if diff.is_empty() {
            return;
        }
        self.tags.insert(&diff, MergeMode::Replace);

        if self.config.postpone_all_tags {
            self.postponed_tags.insert(&diff, MergeMode::Replace);
            return;
        }

        for name in &self.always_postpone {
            if let Some(values) = diff.remove_tag(name) {
                self.postponed_tags.remove_tag(name);
                for value in values {
                    self.postponed_tags.add_value(name, value, MergeMode::Append);
                }
            }
        }

        if !diff.is_empty() {
            if let Some(cur) = &self.current {
                cb(cur.media(), cur.token(), &diff);
            }
        }
    }

    fn on_buffering(&mut self, source: MessageSource, percent: u32) {
        let MessageSource::Unit(id) = source else {
            return;
        };
        let (unit, is_current) = match (&self.current, &self.next) {
            (Some(cur), _) if cur.id() == id => (cur, true),
            (_, Some(next)) if next.id() == id => (next, false),
            _ => return,
        };

        let mut changed = false;
        if percent < 100 {
            if !unit.is_buffering() {
                unit.set_buffering(true);
                changed = true;
            } else if is_current
                && !matches!(self.state, PlayerState::Buffering | PlayerState::Starting)
            {
                changed = true;
            }
        } else if unit.is_buffering() {
            unit.set_buffering(false);
            changed = true;
        }

        let media = unit.media().clone();
        let token = unit.token();
        let level = unit.current_buffer_level();
        let limit = unit.effective_buffer_limit();

        if is_current && changed {
            let current_buffering = unit.is_buffering();
            if let Some(next) = &self.next {
                // The audible stream gets the bandwidth first.
                next.block_buffering(current_buffering);
            }
            self.recheck_buffering();
        }

        if let Some(cb) = &self.callbacks.buffering_updated {
            cb(&media, token, is_current, percent, level, limit);
        }
    }

    // ---- internals ----

    fn set_state(&mut self, new: PlayerState) {
        if self.state == new {
            return;
        }
        let old = std::mem::replace(&mut self.state, new);
        tracing::debug!(%old, %new, "state change");
        self.callbacks.emit_state_changed(old, new);
    }

    fn postpone(&mut self, task: PostponedTask) {
        if !self.postponed.is_none() {
            tracing::debug!(
                previous = self.postponed.kind(),
                new = task.kind(),
                "overwriting postponed task"
            );
        } else {
            tracing::debug!(task = task.kind(), state = %self.state, "postponing task");
        }
        self.postponed = task;
    }

    fn handle_postponed_task(&mut self) {
        let task = std::mem::take(&mut self.postponed);
        if !task.is_none() {
            tracing::debug!(task = task.kind(), "running postponed task");
        }
        match task {
            PostponedTask::None => {}
            PostponedTask::Play {
                token,
                media,
                props,
            } => {
                self.play_media(token, media, true, props);
            }
            PostponedTask::Pause { paused } => self.set_paused(paused),
            PostponedTask::Seek { position, unit } => self.set_current_position(position, unit),
            PostponedTask::Stop => self.stop(),
            PostponedTask::SetState { state } => self.request_engine_state(state),
        }
    }

    /// Request an engine state unless it is already the (pending) target.
    fn set_engine_state(&mut self, new: EngineState) -> Result<()> {
        let target = self.pending_engine_state.unwrap_or(self.engine_state);
        if target == new {
            return Ok(());
        }
        let graph = self
            .graph
            .as_mut()
            .ok_or_else(|| anyhow!("no output graph"))?;
        graph
            .set_state(new)
            .with_context(|| format!("set graph state to {new}"))?;
        self.pending_engine_state = (new != self.engine_state).then_some(new);
        Ok(())
    }

    fn request_engine_state(&mut self, new: EngineState) {
        if let Err(e) = self.set_engine_state(new) {
            tracing::error!("{e:#}");
        }
    }

    fn finish_seeking(&mut self, restore_state: bool) {
        if let Some((position, unit)) = self.seek_target.take() {
            tracing::debug!(position, unit = unit.name(), "seeking");
            if let Some(graph) = self.graph.as_mut()
                && let Err(e) = graph.seek(position, unit)
            {
                tracing::error!("seeking failed: {e:#}");
                self.callbacks.emit_warning(&format!("seeking failed: {e:#}"));
            }
        }

        if !restore_state {
            return;
        }
        if self.seek_was_paused {
            self.set_state(PlayerState::Paused);
            self.handle_postponed_task();
        } else if let Some(cur) = self.current.as_ref().filter(|c| c.performs_buffering()) {
            // The flush emptied the queue; wait for it to refill.
            cur.set_buffering(true);
            self.set_state(PlayerState::Buffering);
        } else {
            self.request_engine_state(EngineState::Playing);
        }
    }

    fn recheck_buffering(&mut self) {
        let Some(cur) = &self.current else {
            return;
        };
        let buffering = cur.is_buffering();
        if buffering && !cur.is_live() && cur.is_live_known() && self.state == PlayerState::Playing
        {
            tracing::debug!("current stream started buffering, pausing");
            self.set_state(PlayerState::Buffering);
            self.request_engine_state(EngineState::Paused);
        } else if !buffering && self.state == PlayerState::Buffering {
            tracing::debug!("current stream finished buffering, resuming");
            self.request_engine_state(EngineState::Playing);
        }
    }

    fn make_next_stream_current(&mut self) {
        if !self.ctx.take_eos_seen() {
            return;
        }
        let previous = std::mem::replace(&mut self.current, self.next.take());
        self.ctx.set_current(self.current.as_ref().map(StreamUnit::id));
        if let Some(cur) = &self.current {
            tracing::debug!(uri = %cur.media().uri(), token = cur.token(), "next media is now current");
        }
        drop(previous);
    }

    fn update_durations(&mut self) {
        let (ns, bytes) = match &self.graph {
            Some(graph) => (
                graph.query_duration(PositionUnit::Nanoseconds).unwrap_or(-1),
                graph.query_duration(PositionUnit::Bytes).unwrap_or(-1),
            ),
            None => (-1, -1),
        };
        let force = std::mem::take(&mut self.force_duration_update);
        let ns_changed = force || ns != self.duration_ns;
        let bytes_changed = force || bytes != self.duration_bytes;
        self.duration_ns = ns;
        self.duration_bytes = bytes;

        tracing::debug!(ns, bytes, ns_changed, bytes_changed, "durations updated");
        if let (Some(cb), Some(cur)) = (&self.callbacks.duration_updated, &self.current) {
            if ns_changed {
                cb(cur.media(), cur.token(), ns, PositionUnit::Nanoseconds);
            }
            if bytes_changed {
                cb(cur.media(), cur.token(), bytes, PositionUnit::Bytes);
            }
        }
    }

    fn create_unit(
        &mut self,
        token: u64,
        media: Media,
        props: PlaybackProperties,
    ) -> Result<StreamUnit> {
        self.next_unit_id += 1;
        let id = UnitId(self.next_unit_id);
        let bus = self.bus.as_ref().ok_or_else(|| anyhow!("no bus"))?;
        let graph = self
            .graph
            .as_deref_mut()
            .ok_or_else(|| anyhow!("no output graph"))?;
        StreamUnit::new(graph, &self.ctx, bus, id, token, media, props)
    }

    fn initialize(&mut self) -> Result<()> {
        self.epoch += 1;
        let filter: Arc<dyn SourceFilter> = self.ctx.arena.clone();
        let bus = Bus::new(self.bus_tx.clone(), self.epoch, filter);

        let mut stages = Vec::with_capacity(self.processing.len());
        for (i, object) in self.processing.iter().enumerate() {
            if !object.setup() {
                for done in &self.processing[..i] {
                    done.teardown();
                }
                return Err(anyhow!("setting up processing object #{i} failed"));
            }
            if let Some(stage) = object.engine_element() {
                stages.push(stage);
            }
        }

        match self.engine.create_graph(bus.clone(), stages) {
            Ok(graph) => {
                self.graph = Some(graph);
                self.bus = Some(bus);
            }
            Err(e) => {
                for object in &self.processing {
                    object.teardown();
                }
                return Err(e.context("create output graph"));
            }
        }

        tracing::debug!(epoch = self.epoch, "output graph initialized");
        self.set_state(PlayerState::Idle);
        Ok(())
    }

    fn reinitialize(&mut self) -> Result<()> {
        self.shutdown_pipeline(false);
        self.initialize()
    }

    fn reinitialize_after_failure(&mut self) {
        if let Err(e) = self.reinitialize() {
            tracing::error!("reinitializing pipeline failed: {e:#}");
            self.set_state(PlayerState::Idle);
        }
    }

    fn shutdown_pipeline(&mut self, announce: bool) {
        if self.graph.is_none() {
            return;
        }
        self.timers_enabled = false;
        self.postponed = PostponedTask::None;
        if announce {
            self.set_state(PlayerState::Stopping);
        }

        self.set_pipeline_to_idle(announce);

        for object in &self.processing {
            object.teardown();
        }
        self.graph = None;
        self.bus = None;
        self.epoch += 1;
    }

    fn set_pipeline_to_idle(&mut self, announce: bool) {
        for unit in [&self.current, &self.next].into_iter().flatten() {
            unit.block_buffering(false);
        }
        if let Some(graph) = self.graph.as_mut() {
            if let Err(e) = graph.set_state(EngineState::Null) {
                tracing::warn!("could not stop output graph: {e:#}");
            }
        }

        self.next = None;
        self.current = None;
        self.ctx.set_current(None);
        self.ctx.clear_eos_seen();

        if announce {
            self.set_state(PlayerState::Idle);
        }

        self.engine_state = EngineState::Null;
        self.pending_engine_state = None;
        self.seek_target = None;
        self.duration_ns = -1;
        self.duration_bytes = -1;
        self.about_to_end_blocked = false;
        self.force_duration_update = true;
        self.tags = TagList::new();
        self.postponed_tags = TagList::new();

        self.handle_postponed_task();
    }
}
