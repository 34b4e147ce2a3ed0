//! Join point: plays linked unit outputs back to back.
//!
//! Links queue up in attach order and the front one is audible. The output
//! callback drains the front link; once its queue is closed and empty the
//! link's end-of-stream hook runs, the next link becomes audible and a
//! stream-start is posted. With no link left a graph end-of-stream is posted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use super::queue::{PopStrategy, SharedAudio};
use super::unit::UnitInner;
use crate::engine::{Bus, BusMessage, MessageSource, UnitHooks, UnitId};
use crate::processing::AudioStage;
use crate::stream::lock;
use crate::tag_list::TagList;

/// One unit's output spliced into the join point.
pub(super) struct Link {
    id: UnitId,
    hooks: Arc<dyn UnitHooks>,
    tags: TagList,
    unit: Weak<UnitInner>,
    queue: Mutex<Arc<SharedAudio>>,
    base_ns: AtomicU64,
    played_frames: AtomicU64,
}

impl Link {
    pub(super) fn new(
        id: UnitId,
        hooks: Arc<dyn UnitHooks>,
        tags: TagList,
        unit: Weak<UnitInner>,
        queue: Arc<SharedAudio>,
    ) -> Self {
        Self {
            id,
            hooks,
            tags,
            unit,
            queue: Mutex::new(queue),
            base_ns: AtomicU64::new(0),
            played_frames: AtomicU64::new(0),
        }
    }

    pub(super) fn id(&self) -> UnitId {
        self.id
    }

    pub(super) fn unit(&self) -> Option<Arc<UnitInner>> {
        self.unit.upgrade()
    }

    pub(super) fn queue(&self) -> Arc<SharedAudio> {
        lock(&self.queue).clone()
    }

    /// Swap in the queue of a restarted decode that begins at `base_ns`.
    pub(super) fn restart(&self, queue: Arc<SharedAudio>, base_ns: u64) {
        let old = std::mem::replace(&mut *lock(&self.queue), queue);
        self.base_ns.store(base_ns, Ordering::Release);
        self.played_frames.store(0, Ordering::Release);
        old.close();
    }

    pub(super) fn position_ns(&self, rate: u32) -> i64 {
        let frames = self.played_frames.load(Ordering::Acquire);
        let played = u128::from(frames) * 1_000_000_000 / u128::from(rate.max(1));
        let total = u128::from(self.base_ns.load(Ordering::Acquire)) + played;
        i64::try_from(total).unwrap_or(i64::MAX)
    }
}

pub(super) struct Join {
    bus: Bus,
    links: Mutex<VecDeque<Arc<Link>>>,
    stages: Vec<Arc<dyn AudioStage>>,
    paused: AtomicBool,
    /// Bumped on every graph state request; stale preroll waits give up.
    preroll_generation: AtomicU64,
}

impl Join {
    pub(super) fn new(bus: Bus, stages: Vec<Arc<dyn AudioStage>>) -> Self {
        Self {
            bus,
            links: Mutex::new(VecDeque::new()),
            stages,
            paused: AtomicBool::new(true),
            preroll_generation: AtomicU64::new(0),
        }
    }

    pub(super) fn bus(&self) -> &Bus {
        &self.bus
    }

    pub(super) fn stages(&self) -> &[Arc<dyn AudioStage>] {
        &self.stages
    }

    pub(super) fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub(super) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub(super) fn next_preroll_generation(&self) -> u64 {
        self.preroll_generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(super) fn preroll_generation(&self) -> u64 {
        self.preroll_generation.load(Ordering::Acquire)
    }

    /// Append a link; it is audible right away if nothing else is.
    pub(super) fn attach(&self, link: Arc<Link>) {
        let mut links = lock(&self.links);
        links.push_back(link.clone());
        if links.len() == 1 {
            drop(links);
            self.activate(&link);
        }
    }

    /// Remove a unit's link. Removing the audible link makes the next one audible.
    pub(super) fn detach(&self, id: UnitId) {
        let mut links = lock(&self.links);
        let was_active = links.front().is_some_and(|l| l.id == id);
        links.retain(|l| l.id != id);
        let next = links.front().cloned();
        drop(links);
        if let (true, Some(next)) = (was_active, next) {
            self.activate(&next);
        }
    }

    pub(super) fn clear(&self) {
        let links = std::mem::take(&mut *lock(&self.links));
        for link in links {
            link.queue().close();
        }
    }

    pub(super) fn active(&self) -> Option<Arc<Link>> {
        lock(&self.links).front().cloned()
    }

    /// Whether the audible link has data ready (or nothing left to play).
    pub(super) fn has_preroll_data(&self) -> bool {
        self.active().is_some_and(|l| {
            let q = l.queue();
            q.len_frames() > 0 || q.is_done()
        })
    }

    fn activate(&self, link: &Link) {
        tracing::debug!(unit = link.id.0, "link is now audible");
        self.bus.post(BusMessage::StreamStart);
        if !link.tags.is_empty() {
            self.bus.post(BusMessage::Tag {
                source: MessageSource::Unit(link.id),
                tags: link.tags.clone(),
            });
        }
    }

    /// Take up to `max_frames` from the audible link, moving on to the next
    /// link when it drains. Returns the samples and their channel count.
    pub(super) fn pull(&self, max_frames: usize) -> Option<(Vec<f32>, usize)> {
        let mut links = lock(&self.links);
        loop {
            let link = links.front()?.clone();
            let queue = link.queue();
            if let Some(samples) = queue.pop(PopStrategy::NonBlocking { max_frames }) {
                let frames = samples.len() / queue.channels();
                link.played_frames.fetch_add(frames as u64, Ordering::AcqRel);
                return Some((samples, queue.channels()));
            }
            if !queue.is_drained() {
                return None;
            }

            links.pop_front();
            link.hooks.output_eos();
            match links.front().cloned() {
                Some(next) => self.activate(&next),
                None => {
                    tracing::debug!("last link drained");
                    self.bus.post(BusMessage::Eos);
                    return None;
                }
            }
        }
    }
}

/// Samples fetched from the join point but not yet written to the device.
pub(super) struct MixState {
    pos: usize,
    src_channels: usize,
    src: Vec<f32>,
    scratch: Vec<f32>,
}

impl MixState {
    pub(super) fn new() -> Self {
        Self {
            pos: 0,
            src_channels: 1,
            src: Vec::new(),
            scratch: Vec::new(),
        }
    }
}

/// Render `out_len` interleaved samples for `dst_channels` from the join
/// point, silence on underrun, then run the processing stages over them.
pub(super) fn render<'a>(
    join: &Join,
    st: &'a mut MixState,
    dst_channels: usize,
    refill_max_frames: usize,
    out_len: usize,
) -> &'a [f32] {
    st.scratch.clear();
    st.scratch.resize(out_len, 0.0);
    if join.is_paused() {
        return &st.scratch;
    }

    let frames = out_len / dst_channels;
    for frame in 0..frames {
        if st.pos >= st.src.len() {
            st.pos = 0;
            st.src.clear();
            match join.pull(refill_max_frames) {
                Some((samples, channels)) => {
                    st.src = samples;
                    st.src_channels = channels;
                }
                None => break,
            }
        }
        for ch in 0..dst_channels {
            let sample = next_sample_mapped(st, dst_channels, ch);
            st.scratch[frame * dst_channels + ch] = sample;
        }
    }

    for stage in join.stages() {
        stage.process(&mut st.scratch, dst_channels);
    }
    &st.scratch
}

/// One output sample for `dst_ch` after simple channel mapping.
///
/// - mono to stereo duplicates channel 0
/// - stereo to mono averages left and right
/// - other layouts clamp to the available channels
///
/// `st.pos` advances once per frame, after the last channel.
fn next_sample_mapped(st: &mut MixState, dst_channels: usize, dst_ch: usize) -> f32 {
    if st.pos >= st.src.len() {
        return 0.0;
    }

    let frame_start = st.pos;
    let get_src = |ch: usize, st: &MixState| -> f32 {
        if ch < st.src_channels && frame_start + ch < st.src.len() {
            st.src[frame_start + ch]
        } else {
            0.0
        }
    };

    let out = match (st.src_channels, dst_channels) {
        (1, 1) => get_src(0, st),
        (2, 2) => get_src(dst_ch.min(1), st),
        (2, 1) => 0.5 * (get_src(0, st) + get_src(1, st)),
        (1, 2) => get_src(0, st),
        _ => get_src(dst_ch.min(st.src_channels.saturating_sub(1)), st),
    };

    if dst_ch + 1 == dst_channels {
        st.pos += st.src_channels;
    }
    out
}
