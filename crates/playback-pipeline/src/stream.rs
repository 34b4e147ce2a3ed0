//! Stream units: one media item's decode instance plus its buffering policy.
//!
//! Engine threads reach a unit only through its [`UnitId`]: hooks look the
//! unit up in the shared [`UnitArena`] and check the shutdown flag under the
//! unit's exclusion lock before touching anything. Dropping a [`StreamUnit`]
//! removes it from the arena first, so late callbacks find nothing to act on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::engine::{
    BufferLimits, Bus, BusMessage, DecodeUnit, DiscoveredOutput, OutputGraph, SourceFilter,
    UnitHooks, UnitId,
};
use crate::media::Media;
use crate::pipeline::callbacks::Callbacks;
use crate::properties::{
    DEFAULT_BUFFER_ESTIMATION_DURATION, DEFAULT_BUFFER_SIZE_LIMIT, DEFAULT_BUFFER_TIMEOUT,
    DEFAULT_HIGH_BUFFER_THRESHOLD, DEFAULT_LOW_BUFFER_THRESHOLD, PlaybackProperties,
};
use crate::tag_list::{TAG_BITRATE, TAG_NOMINAL_BITRATE, TagList};

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Size/time limits of a unit's buffering queue.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct BufferPolicy {
    pub(crate) estimation_duration: Duration,
    pub(crate) timeout: Duration,
    pub(crate) timeout_enabled: bool,
    pub(crate) size_limit: u32,
    pub(crate) low_threshold: u32,
    pub(crate) high_threshold: u32,
    pub(crate) effective_limit: u32,
}

impl BufferPolicy {
    pub(crate) fn from_properties(props: &PlaybackProperties) -> Self {
        let size_limit = props.buffer_size_limit.unwrap_or(DEFAULT_BUFFER_SIZE_LIMIT);
        Self {
            estimation_duration: props
                .buffer_estimation_duration
                .unwrap_or(DEFAULT_BUFFER_ESTIMATION_DURATION),
            timeout: props.buffer_timeout.unwrap_or(DEFAULT_BUFFER_TIMEOUT),
            timeout_enabled: true,
            size_limit,
            low_threshold: props
                .low_buffer_threshold
                .unwrap_or(DEFAULT_LOW_BUFFER_THRESHOLD),
            high_threshold: props
                .high_buffer_threshold
                .unwrap_or(DEFAULT_HIGH_BUFFER_THRESHOLD),
            effective_limit: size_limit,
        }
    }

    /// Recompute the effective size limit for `bitrate` (bits per second).
    ///
    /// The estimate covers `estimation_duration` worth of encoded data and
    /// only ever tightens the absolute limit.
    pub(crate) fn compute(&mut self, bitrate: u32) -> BufferLimits {
        let estimated = if bitrate != 0 && !self.estimation_duration.is_zero() {
            let bytes = self.estimation_duration.as_millis() * u128::from(bitrate) / 8_000;
            u32::try_from(bytes).unwrap_or(u32::MAX)
        } else {
            0
        };
        self.effective_limit = if estimated == 0 {
            self.size_limit
        } else {
            estimated.min(self.size_limit)
        };
        BufferLimits {
            size_bytes: self.effective_limit,
            timeout: if self.timeout_enabled {
                self.timeout
            } else {
                Duration::ZERO
            },
            low_percent: self.low_threshold,
            high_percent: self.high_threshold,
        }
    }
}

/// State shared between a unit and the hooks running on engine threads.
pub(crate) struct UnitShared {
    exclusion: Mutex<()>,
    shutting_down: AtomicBool,
    blocked: Mutex<bool>,
    unblocked: Condvar,
    buffering: AtomicBool,
    live: AtomicBool,
    live_known: AtomicBool,
    seekable: AtomicBool,
    has_queue: AtomicBool,
    bitrate: AtomicU32,
    policy: Mutex<BufferPolicy>,
}

impl UnitShared {
    fn new(policy: BufferPolicy) -> Self {
        Self {
            exclusion: Mutex::new(()),
            shutting_down: AtomicBool::new(false),
            blocked: Mutex::new(false),
            unblocked: Condvar::new(),
            buffering: AtomicBool::new(false),
            live: AtomicBool::new(false),
            live_known: AtomicBool::new(false),
            seekable: AtomicBool::new(false),
            has_queue: AtomicBool::new(false),
            bitrate: AtomicU32::new(0),
            policy: Mutex::new(policy),
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    fn set_blocked(&self, blocked: bool) {
        *lock(&self.blocked) = blocked;
        self.unblocked.notify_all();
    }

    fn wait_while_blocked(&self) {
        let mut g = lock(&self.blocked);
        while *g && !self.is_shutting_down() {
            g = self.unblocked.wait(g).unwrap_or_else(|e| e.into_inner());
        }
    }
}

#[derive(Clone)]
struct UnitEntry {
    token: u64,
    media: Media,
    shared: Arc<UnitShared>,
    decode: Arc<dyn DecodeUnit>,
}

/// Live units by id. Units leave the arena as soon as they start shutting down.
#[derive(Default)]
pub(crate) struct UnitArena {
    units: Mutex<HashMap<UnitId, UnitEntry>>,
}

impl UnitArena {
    fn get(&self, id: UnitId) -> Option<UnitEntry> {
        lock(&self.units).get(&id).cloned()
    }

    fn insert(&self, id: UnitId, entry: UnitEntry) {
        lock(&self.units).insert(id, entry);
    }

    fn remove(&self, id: UnitId) {
        lock(&self.units).remove(&id);
    }
}

impl SourceFilter for UnitArena {
    fn is_retired(&self, id: UnitId) -> bool {
        !lock(&self.units).contains_key(&id)
    }
}

/// Controller-wide context shared with every unit's hooks.
pub(crate) struct UnitContext {
    pub(crate) callbacks: Arc<Callbacks>,
    pub(crate) arena: Arc<UnitArena>,
    eos_seen: Mutex<bool>,
    current: AtomicU64,
}

impl UnitContext {
    pub(crate) fn new(callbacks: Arc<Callbacks>) -> Self {
        Self {
            callbacks,
            arena: Arc::new(UnitArena::default()),
            eos_seen: Mutex::new(false),
            current: AtomicU64::new(0),
        }
    }

    pub(crate) fn set_current(&self, id: Option<UnitId>) {
        self.current
            .store(id.map_or(0, |id| id.0), Ordering::Release);
    }

    pub(crate) fn is_current(&self, id: UnitId) -> bool {
        self.current.load(Ordering::Acquire) == id.0
    }

    /// Consume the end-of-stream flag raised by a unit's output.
    pub(crate) fn take_eos_seen(&self) -> bool {
        std::mem::take(&mut *lock(&self.eos_seen))
    }

    pub(crate) fn clear_eos_seen(&self) {
        *lock(&self.eos_seen) = false;
    }

    fn mark_eos_seen(&self) {
        *lock(&self.eos_seen) = true;
    }
}

/// Hooks handed to the engine; they hold only the unit id.
struct UnitHookHandler {
    id: UnitId,
    ctx: Arc<UnitContext>,
    bus: Bus,
}

impl UnitHooks for UnitHookHandler {
    fn output_discovered(&self, output: &mut dyn DiscoveredOutput) {
        let Some(entry) = self.ctx.arena.get(self.id) else {
            return;
        };
        let _guard = lock(&entry.shared.exclusion);
        if entry.shared.is_shutting_down() {
            return;
        }
        if output.is_linked() || !output.is_audio() {
            return;
        }
        if let Err(e) = output.link() {
            tracing::warn!(unit = self.id.0, "could not link decoded output: {e:#}");
            return;
        }

        let is_current = self.ctx.is_current(self.id);
        let seekable = output.query_seekable().unwrap_or(false);
        entry.shared.seekable.store(seekable, Ordering::Release);
        self.ctx
            .callbacks
            .emit_is_seekable(&entry.media, entry.token, is_current, seekable);

        if entry.shared.has_queue.load(Ordering::Acquire) {
            entry.decode.install_block_probe();
        }
        recheck_live_status(&entry, &self.ctx.callbacks, is_current);
    }

    fn buffer_queue_added(&self) {
        let Some(entry) = self.ctx.arena.get(self.id) else {
            return;
        };
        entry.shared.has_queue.store(true, Ordering::Release);
        update_buffer_limits(&entry.shared, entry.decode.as_ref());
    }

    fn tags_observed(&self, tags: &TagList) {
        let Some(entry) = self.ctx.arena.get(self.id) else {
            return;
        };
        if entry.shared.bitrate.load(Ordering::Acquire) != 0 {
            return;
        }
        let bitrate = tags
            .uint(TAG_NOMINAL_BITRATE, 0)
            .or_else(|| tags.uint(TAG_BITRATE, 0))
            .map(|b| u32::try_from(b).unwrap_or(u32::MAX))
            .unwrap_or(0);
        if bitrate == 0 {
            return;
        }
        tracing::debug!(unit = self.id.0, bitrate, "bitrate discovered");
        entry.shared.bitrate.store(bitrate, Ordering::Release);
        update_buffer_limits(&entry.shared, entry.decode.as_ref());
    }

    fn before_queue_input(&self) {
        if let Some(entry) = self.ctx.arena.get(self.id) {
            entry.shared.wait_while_blocked();
        }
    }

    fn output_eos(&self) {
        tracing::debug!(unit = self.id.0, "unit output reached end of stream");
        self.ctx.mark_eos_seen();
        self.bus.post(BusMessage::StreamEos);
    }
}

fn update_buffer_limits(shared: &UnitShared, decode: &dyn DecodeUnit) {
    let bitrate = shared.bitrate.load(Ordering::Acquire);
    let limits = lock(&shared.policy).compute(bitrate);
    tracing::trace!(?limits, bitrate, "buffer limits updated");
    decode.apply_buffer_limits(&limits);
}

fn recheck_live_status(entry: &UnitEntry, callbacks: &Callbacks, is_current: bool) {
    match entry.decode.query_live() {
        Some(live) => {
            entry.shared.live.store(live, Ordering::Release);
            entry.shared.live_known.store(true, Ordering::Release);
            callbacks.emit_is_live(&entry.media, entry.token, is_current, live);
        }
        None => entry.shared.live_known.store(false, Ordering::Release),
    }
}

/// One media item's decode instance, owned by the controller's current or
/// next slot.
pub(crate) struct StreamUnit {
    id: UnitId,
    token: u64,
    media: Media,
    props: PlaybackProperties,
    shared: Arc<UnitShared>,
    decode: Arc<dyn DecodeUnit>,
    ctx: Arc<UnitContext>,
}

impl StreamUnit {
    /// Allocate the decode instance. The unit does not follow the graph's
    /// state until [`StreamUnit::sync_state`] is called.
    pub(crate) fn new(
        graph: &mut dyn OutputGraph,
        ctx: &Arc<UnitContext>,
        bus: &Bus,
        id: UnitId,
        token: u64,
        media: Media,
        props: PlaybackProperties,
    ) -> Result<Self> {
        let hooks = Arc::new(UnitHookHandler {
            id,
            ctx: ctx.clone(),
            bus: bus.clone(),
        });
        let decode = graph
            .create_decode_unit(id, media.uri(), &props, hooks)
            .with_context(|| format!("create decode unit for {}", media.uri()))?;
        let shared = Arc::new(UnitShared::new(BufferPolicy::from_properties(&props)));
        ctx.arena.insert(
            id,
            UnitEntry {
                token,
                media: media.clone(),
                shared: shared.clone(),
                decode: decode.clone(),
            },
        );

        let unit = Self {
            id,
            token,
            media,
            props,
            shared,
            decode,
            ctx: ctx.clone(),
        };
        unit.update_buffer_limits();
        Ok(unit)
    }

    pub(crate) fn id(&self) -> UnitId {
        self.id
    }

    pub(crate) fn token(&self) -> u64 {
        self.token
    }

    pub(crate) fn media(&self) -> &Media {
        &self.media
    }

    pub(crate) fn properties(&self) -> &PlaybackProperties {
        &self.props
    }

    pub(crate) fn sync_state(&self) -> Result<()> {
        self.decode.sync_state()
    }

    pub(crate) fn is_buffering(&self) -> bool {
        self.shared.buffering.load(Ordering::Acquire)
    }

    pub(crate) fn set_buffering(&self, buffering: bool) {
        self.shared.buffering.store(buffering, Ordering::Release);
    }

    pub(crate) fn is_live(&self) -> bool {
        self.shared.live.load(Ordering::Acquire)
    }

    pub(crate) fn is_live_known(&self) -> bool {
        self.shared.live_known.load(Ordering::Acquire)
    }

    pub(crate) fn is_seekable(&self) -> bool {
        self.shared.seekable.load(Ordering::Acquire)
    }

    /// Only known non-live sources with a buffering queue pause on underrun.
    pub(crate) fn performs_buffering(&self) -> bool {
        self.shared.has_queue.load(Ordering::Acquire) && self.is_live_known() && !self.is_live()
    }

    pub(crate) fn block_buffering(&self, block: bool) {
        self.shared.set_blocked(block);
    }

    pub(crate) fn recheck_live_status(&self, is_current: bool) {
        if let Some(entry) = self.ctx.arena.get(self.id) {
            recheck_live_status(&entry, &self.ctx.callbacks, is_current);
        }
    }

    pub(crate) fn enable_buffering_timeout(&self, enabled: bool) {
        lock(&self.shared.policy).timeout_enabled = enabled;
        self.update_buffer_limits();
    }

    pub(crate) fn set_buffer_estimation_duration(&self, duration: Option<Duration>) {
        lock(&self.shared.policy).estimation_duration =
            duration.unwrap_or(DEFAULT_BUFFER_ESTIMATION_DURATION);
        self.update_buffer_limits();
    }

    pub(crate) fn set_buffer_timeout(&self, timeout: Option<Duration>) {
        lock(&self.shared.policy).timeout = timeout.unwrap_or(DEFAULT_BUFFER_TIMEOUT);
        self.update_buffer_limits();
    }

    pub(crate) fn set_buffer_size_limit(&self, limit: Option<u32>) {
        lock(&self.shared.policy).size_limit = limit.unwrap_or(DEFAULT_BUFFER_SIZE_LIMIT);
        self.update_buffer_limits();
    }

    pub(crate) fn set_buffer_thresholds(&self, low: Option<u32>, high: Option<u32>) {
        {
            let mut policy = lock(&self.shared.policy);
            policy.low_threshold = low.unwrap_or(DEFAULT_LOW_BUFFER_THRESHOLD);
            policy.high_threshold = high.unwrap_or(DEFAULT_HIGH_BUFFER_THRESHOLD);
        }
        self.update_buffer_limits();
    }

    pub(crate) fn current_buffer_level(&self) -> Option<u32> {
        self.decode.buffer_level()
    }

    pub(crate) fn effective_buffer_limit(&self) -> u32 {
        lock(&self.shared.policy).effective_limit
    }

    fn update_buffer_limits(&self) {
        update_buffer_limits(&self.shared, self.decode.as_ref());
    }
}

impl Drop for StreamUnit {
    fn drop(&mut self) {
        self.shared.shutting_down.store(true, Ordering::Release);
        self.ctx.arena.remove(self.id);

        let _guard = lock(&self.shared.exclusion);
        self.shared.set_blocked(false);
        // The join slot must go before the unit stops, or blocked streaming
        // threads never get released.
        self.decode.release_join();
        self.decode.shutdown();
        tracing::debug!(unit = self.id.0, token = self.token, "stream unit shut down");
    }
}
