//! Local decode unit: file reader, buffering queue, decoder and resampler.
//!
//! ```text
//! reader thread ──► PacketQueue ──► decoder thread ──► [resampler] ──► SharedAudio ──► join
//! ```
//!
//! A seek replaces the whole chain behind the unit's link with a fresh run
//! that starts at the new position.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{Context, Result, anyhow};
use symphonia::core::errors::Error as SymphoniaError;

use super::OutputFormat;
use super::buffer::PacketQueue;
use super::decode::{SourceInfo, open_source, packet_seconds, spawn_decoder};
use super::join::{Join, Link};
use super::queue::{SharedAudio, calc_max_buffered_samples};
use super::resample::start_resampler;
use crate::engine::{
    BufferLimits, Bus, BusMessage, DecodeUnit, DiscoveredOutput, MessageSource, UnitHooks, UnitId,
};
use crate::stream::lock;

/// Stage sizing shared by every unit of a graph.
#[derive(Clone, Copy, Debug)]
pub(super) struct UnitSettings {
    pub chunk_frames: usize,
    pub buffer_seconds: f32,
}

/// One pass over the file, from a start offset to the end (or cancel).
struct RunHandle {
    cancel: Arc<AtomicBool>,
    packets: Mutex<Option<Arc<PacketQueue>>>,
    audio: Mutex<Vec<Arc<SharedAudio>>>,
}

impl RunHandle {
    fn new() -> Self {
        Self {
            cancel: Arc::new(AtomicBool::new(false)),
            packets: Mutex::new(None),
            audio: Mutex::new(Vec::new()),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    fn packets(&self) -> Option<Arc<PacketQueue>> {
        lock(&self.packets).clone()
    }

    fn set_packets(&self, queue: Arc<PacketQueue>) {
        *lock(&self.packets) = Some(queue.clone());
        if self.is_cancelled() {
            queue.close();
        }
    }

    fn add_audio(&self, queue: Arc<SharedAudio>) {
        lock(&self.audio).push(queue.clone());
        if self.is_cancelled() {
            queue.close();
        }
    }

    fn stop(&self) {
        self.cancel.store(true, Ordering::Release);
        if let Some(packets) = self.packets() {
            packets.close();
        }
        for queue in lock(&self.audio).iter() {
            queue.close();
        }
    }
}

pub(super) struct UnitInner {
    id: UnitId,
    path: PathBuf,
    bus: Bus,
    join: Arc<Join>,
    hooks: Arc<dyn UnitHooks>,
    format: OutputFormat,
    settings: UnitSettings,
    limits: Mutex<BufferLimits>,
    probe_installed: AtomicBool,
    run: Mutex<Arc<RunHandle>>,
    info: Mutex<Option<SourceInfo>>,
    link: Mutex<Option<Arc<Link>>>,
    started: AtomicBool,
    shut_down: AtomicBool,
}

impl UnitInner {
    pub(super) fn info(&self) -> Option<SourceInfo> {
        lock(&self.info).clone()
    }

    fn out_capacity(&self, channels: usize) -> usize {
        calc_max_buffered_samples(self.format.rate, channels, self.settings.buffer_seconds)
    }

    /// Restart decoding at `position_ns`, keeping the unit's place in the join point.
    pub(super) fn restart_at(self: &Arc<Self>, position_ns: u64) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(anyhow!("unit {} is shut down", self.id.0));
        }
        let link = lock(&self.link)
            .clone()
            .ok_or_else(|| anyhow!("unit {} is not linked", self.id.0))?;
        let info = self
            .info()
            .ok_or_else(|| anyhow!("unit {} has no stream info yet", self.id.0))?;
        if let Some(duration) = info.duration_ns()
            && i64::try_from(position_ns).unwrap_or(i64::MAX) >= duration
        {
            return Err(anyhow!("position {position_ns}ns is past the end ({duration}ns)"));
        }

        let queue = Arc::new(SharedAudio::new(info.channels, self.out_capacity(info.channels)));
        let run = Arc::new(RunHandle::new());
        let old = std::mem::replace(&mut *lock(&self.run), run.clone());
        old.stop();
        link.restart(queue.clone(), position_ns);

        tracing::debug!(unit = self.id.0, position_ns, "restarting decode");
        spawn_reader(self.clone(), run, position_ns, Some(queue))
    }
}

fn spawn_reader(
    inner: Arc<UnitInner>,
    run: Arc<RunHandle>,
    start_ns: u64,
    out: Option<Arc<SharedAudio>>,
) -> Result<()> {
    thread::Builder::new()
        .name(format!("unit-{}-read", inner.id.0))
        .spawn(move || {
            if let Err(e) = read_loop(&inner, &run, start_ns, out) {
                if run.is_cancelled() {
                    return;
                }
                tracing::warn!(unit = inner.id.0, path = %inner.path.display(), "reader error: {e:#}");
                run.stop();
                inner.bus.post(BusMessage::Error {
                    source: MessageSource::Unit(inner.id),
                    text: format!("{e:#}"),
                });
            }
        })
        .context("spawn reader thread")?;
    Ok(())
}

fn read_loop(
    inner: &Arc<UnitInner>,
    run: &Arc<RunHandle>,
    start_ns: u64,
    out: Option<Arc<SharedAudio>>,
) -> Result<()> {
    let mut source = open_source(&inner.path, start_ns)?;
    if run.is_cancelled() {
        return Ok(());
    }
    let first_run = out.is_none();
    tracing::debug!(unit = inner.id.0, start_ns = source.start_ns, first_run, "decode run started");
    *lock(&inner.info) = Some(source.info.clone());

    let packets = Arc::new(PacketQueue::new(
        inner.id,
        inner.bus.clone(),
        *lock(&inner.limits),
    ));
    run.set_packets(packets.clone());
    packets.start();

    if first_run {
        inner.bus.post(BusMessage::DurationChanged {
            source: MessageSource::Unit(inner.id),
        });
        inner.hooks.buffer_queue_added();
        inner.hooks.tags_observed(&source.tags);
    }

    let channels = source.info.channels;
    let out = match out {
        Some(queue) => queue,
        None => Arc::new(SharedAudio::new(channels, inner.out_capacity(channels))),
    };
    run.add_audio(out.clone());

    let id = inner.id.0;
    let src_rate = source.spec.rate;
    let decoded = if src_rate == inner.format.rate {
        out.clone()
    } else {
        tracing::debug!(unit = id, src_rate, dst_rate = inner.format.rate, "resampling");
        let decoded = Arc::new(SharedAudio::new(
            channels,
            calc_max_buffered_samples(src_rate, channels, inner.settings.buffer_seconds),
        ));
        run.add_audio(decoded.clone());
        start_resampler(
            format!("unit-{id}-resample"),
            decoded.clone(),
            out.clone(),
            src_rate,
            inner.format.rate,
            inner.settings.chunk_frames,
            run.cancel.clone(),
        )?;
        decoded
    };
    spawn_decoder(
        format!("unit-{id}-decode"),
        source.codec_params.clone(),
        packets.clone(),
        decoded,
        run.cancel.clone(),
    )?;

    if first_run {
        let link = Arc::new(Link::new(
            inner.id,
            inner.hooks.clone(),
            source.tags.clone(),
            Arc::downgrade(inner),
            out,
        ));
        let mut output = LocalOutput {
            inner: inner.as_ref(),
            link,
            linked: false,
        };
        inner.hooks.output_discovered(&mut output);
    }

    loop {
        if run.is_cancelled() {
            return Ok(());
        }
        let packet = match source.format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(e.into()),
        };
        if packet.track_id() != source.track_id {
            continue;
        }
        if inner.probe_installed.load(Ordering::Acquire) {
            inner.hooks.before_queue_input();
        }
        let seconds = packet_seconds(source.time_base, packet.dur);
        if !packets.push(packet, seconds) {
            return Ok(());
        }
    }

    tracing::debug!(unit = id, "end of input");
    packets.finish();
    Ok(())
}

/// The unit's decoded output, offered to the controller once.
struct LocalOutput<'a> {
    inner: &'a UnitInner,
    link: Arc<Link>,
    linked: bool,
}

impl DiscoveredOutput for LocalOutput<'_> {
    fn is_linked(&self) -> bool {
        self.linked
    }

    fn is_audio(&self) -> bool {
        true
    }

    fn link(&mut self) -> Result<()> {
        if self.linked {
            return Err(anyhow!("output already linked"));
        }
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(anyhow!("unit {} is shut down", self.inner.id.0));
        }
        *lock(&self.inner.link) = Some(self.link.clone());
        self.inner.join.attach(self.link.clone());
        self.linked = true;
        Ok(())
    }

    fn query_seekable(&self) -> Option<bool> {
        Some(true)
    }
}

pub(super) struct LocalUnit {
    inner: Arc<UnitInner>,
}

impl LocalUnit {
    pub(super) fn new(
        id: UnitId,
        path: PathBuf,
        join: Arc<Join>,
        hooks: Arc<dyn UnitHooks>,
        format: OutputFormat,
        settings: UnitSettings,
        limits: BufferLimits,
    ) -> Self {
        Self {
            inner: Arc::new(UnitInner {
                id,
                path,
                bus: join.bus().clone(),
                join,
                hooks,
                format,
                settings,
                limits: Mutex::new(limits),
                probe_installed: AtomicBool::new(false),
                run: Mutex::new(Arc::new(RunHandle::new())),
                info: Mutex::new(None),
                link: Mutex::new(None),
                started: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    fn run(&self) -> Arc<RunHandle> {
        lock(&self.inner.run).clone()
    }
}

impl DecodeUnit for LocalUnit {
    fn sync_state(&self) -> Result<()> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(anyhow!("unit {} is shut down", self.inner.id.0));
        }
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        spawn_reader(self.inner.clone(), self.run(), 0, None)
    }

    fn apply_buffer_limits(&self, limits: &BufferLimits) {
        *lock(&self.inner.limits) = *limits;
        if let Some(packets) = self.run().packets() {
            packets.set_limits(*limits);
        }
    }

    fn buffer_level(&self) -> Option<u32> {
        self.run().packets().map(|p| p.level_bytes())
    }

    fn query_live(&self) -> Option<bool> {
        Some(false)
    }

    fn install_block_probe(&self) {
        self.inner.probe_installed.store(true, Ordering::Release);
    }

    fn release_join(&self) {
        self.inner.join.detach(self.inner.id);
        lock(&self.inner.link).take();
    }

    fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(unit = self.inner.id.0, "shutting down");
        self.run().stop();
    }
}

impl Drop for LocalUnit {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Envelope, SourceFilter};
    use crate::engine::local::decode::tests::write_wav;
    use crate::tag_list::{TAG_NOMINAL_BITRATE, TagList};
    use crossbeam_channel::Receiver;
    use std::sync::atomic::AtomicU32;
    use std::time::{Duration, Instant};

    struct NothingRetired;

    impl SourceFilter for NothingRetired {
        fn is_retired(&self, _id: UnitId) -> bool {
            false
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        eos: AtomicU32,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl UnitHooks for Recorder {
        fn output_discovered(&self, output: &mut dyn DiscoveredOutput) {
            output.link().unwrap();
            let seekable = output.query_seekable();
            self.events.lock().unwrap().push(format!("linked seekable={seekable:?}"));
        }
        fn buffer_queue_added(&self) {
            self.events.lock().unwrap().push("queue".into());
        }
        fn tags_observed(&self, tags: &TagList) {
            let bitrate = tags.uint(TAG_NOMINAL_BITRATE, 0).is_some();
            self.events.lock().unwrap().push(format!("tags bitrate={bitrate}"));
        }
        fn before_queue_input(&self) {}
        fn output_eos(&self) {
            self.eos.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn setup(rate: u32) -> (Arc<Join>, Receiver<Envelope>, Arc<Recorder>, LocalUnit, PathBuf) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let bus = Bus::new(tx, 1, Arc::new(NothingRetired));
        let join = Arc::new(Join::new(bus, Vec::new()));
        join.set_paused(false);
        let hooks = Arc::new(Recorder::default());
        let path = write_wav(&format!("unit-{rate}"), rate, 2, 4_000);
        let unit = LocalUnit::new(
            UnitId(7),
            path.clone(),
            join.clone(),
            hooks.clone(),
            OutputFormat {
                rate: 8_000,
                channels: 2,
            },
            UnitSettings {
                chunk_frames: 256,
                buffer_seconds: 1.0,
            },
            BufferLimits {
                size_bytes: 1 << 20,
                timeout: Duration::ZERO,
                low_percent: 10,
                high_percent: 99,
            },
        );
        (join, rx, hooks, unit, path)
    }

    fn drain(join: &Join) -> usize {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut frames = 0;
        while Instant::now() < deadline {
            match join.pull(512) {
                Some((samples, channels)) => frames += samples.len() / channels,
                None if frames > 0 && join.active().is_none() => break,
                None => thread::sleep(Duration::from_millis(1)),
            }
        }
        frames
    }

    #[test]
    fn plays_a_file_through_the_join_point() {
        let (join, rx, hooks, unit, path) = setup(8_000);
        unit.sync_state().unwrap();

        assert_eq!(drain(&join), 4_000);
        assert_eq!(hooks.eos.load(Ordering::SeqCst), 1);
        assert_eq!(
            hooks.events(),
            vec!["queue", "tags bitrate=true", "linked seekable=Some(true)"]
        );
        let messages: Vec<BusMessage> = rx.try_iter().map(|e| e.message).collect();
        assert!(messages.iter().any(|m| matches!(m, BusMessage::StreamStart)));
        assert!(messages.iter().any(|m| matches!(m, BusMessage::Eos)));
        assert!(messages.iter().any(|m| matches!(m, BusMessage::Buffering { percent: 100, .. })));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn resamples_to_the_output_rate() {
        let (join, _rx, _hooks, unit, path) = setup(4_000);
        unit.sync_state().unwrap();

        let frames = drain(&join);
        assert!((7_000..=8_400).contains(&frames), "got {frames} frames");
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn missing_file_posts_an_error() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let bus = Bus::new(tx, 1, Arc::new(NothingRetired));
        let join = Arc::new(Join::new(bus, Vec::new()));
        let unit = LocalUnit::new(
            UnitId(1),
            PathBuf::from("/nonexistent/a.wav"),
            join,
            Arc::new(Recorder::default()),
            OutputFormat {
                rate: 8_000,
                channels: 2,
            },
            UnitSettings {
                chunk_frames: 256,
                buffer_seconds: 1.0,
            },
            BufferLimits {
                size_bytes: 1024,
                timeout: Duration::ZERO,
                low_percent: 10,
                high_percent: 99,
            },
        );
        unit.sync_state().unwrap();
        let envelope = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(envelope.message, BusMessage::Error { source: MessageSource::Unit(UnitId(1)), .. }));
    }

    #[test]
    fn seeking_past_the_end_is_refused() {
        let (join, _rx, _hooks, unit, path) = setup(8_000);
        unit.sync_state().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while join.active().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(unit.inner.restart_at(10_000_000_000).is_err());
        assert!(unit.inner.restart_at(250_000_000).is_ok());
        unit.shutdown();
        assert!(unit.inner.restart_at(0).is_err());
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn release_then_shutdown_leaves_the_join_empty() {
        let (join, _rx, _hooks, unit, path) = setup(8_000);
        unit.sync_state().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while join.active().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        unit.release_join();
        unit.shutdown();
        assert!(join.active().is_none());
        assert!(unit.sync_state().is_err());
        std::fs::remove_file(path).ok();
    }
}
