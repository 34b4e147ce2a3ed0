//! Local media engine.
//!
//! Plays local files with Symphonia (demux/decode), Rubato (resampling to the
//! device rate) and CPAL (output). Each decode unit runs its own reader,
//! decoder and resampler threads; the join point feeds the output callback
//! from one unit after another without a gap.

mod buffer;
mod decode;
mod device;
mod join;
mod output;
mod queue;
mod resample;
mod unit;

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

pub use device::output_device_names;

use self::join::Join;
use self::output::{OutputHandle, start_output};
use self::unit::{LocalUnit, UnitSettings};
use super::{
    BufferLimits, Bus, BusMessage, DecodeUnit, EngineState, MediaEngine, MessageSource,
    OutputGraph, UnitHooks, UnitId,
};
use crate::processing::AudioStage;
use crate::properties::{
    DEFAULT_BUFFER_SIZE_LIMIT, DEFAULT_BUFFER_TIMEOUT, DEFAULT_HIGH_BUFFER_THRESHOLD,
    DEFAULT_LOW_BUFFER_THRESHOLD, PlaybackProperties, PositionUnit,
};
use crate::stream::lock;

/// Configuration for the local engine.
#[derive(Clone, Debug)]
pub struct LocalEngineConfig {
    /// Substring of the output device name; the host default when `None`.
    pub device: Option<String>,
    /// Preferred device sample rate; the highest supported rate when `None`.
    pub preferred_rate: Option<u32>,
    /// Resampler input chunk size in frames.
    pub chunk_frames: usize,
    /// Maximum number of frames the output callback pulls per refill.
    pub refill_max_frames: usize,
    /// Decoded audio buffered per unit, in seconds.
    pub buffer_seconds: f32,
}

impl Default for LocalEngineConfig {
    fn default() -> Self {
        Self {
            device: None,
            preferred_rate: None,
            chunk_frames: 1024,
            refill_max_frames: 4096,
            buffer_seconds: 2.0,
        }
    }
}

/// Format the output device was opened with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputFormat {
    pub rate: u32,
    pub channels: usize,
}

#[derive(Default)]
pub struct LocalEngine {
    config: LocalEngineConfig,
}

impl LocalEngine {
    pub fn new(config: LocalEngineConfig) -> Self {
        Self { config }
    }
}

impl MediaEngine for LocalEngine {
    fn create_graph(
        &mut self,
        bus: Bus,
        stages: Vec<Arc<dyn AudioStage>>,
    ) -> Result<Box<dyn OutputGraph>> {
        let join = Arc::new(Join::new(bus, stages));
        let (output, format) = start_output(
            join.clone(),
            self.config.device.clone(),
            self.config.preferred_rate,
            self.config.refill_max_frames,
        )
        .context("open audio output")?;
        let settings = UnitSettings {
            chunk_frames: self.config.chunk_frames,
            buffer_seconds: self.config.buffer_seconds,
        };
        Ok(Box::new(LocalGraph::new(join, format, settings, Some(output))))
    }
}

struct LocalGraph {
    join: Arc<Join>,
    format: OutputFormat,
    settings: UnitSettings,
    state: Arc<Mutex<EngineState>>,
    _output: Option<OutputHandle>,
}

/// Record `new` as the graph state and report the change on the bus.
fn commit_state(state: &Mutex<EngineState>, bus: &Bus, new: EngineState) {
    commit_locked(&mut lock(state), bus, new);
}

fn commit_locked(current: &mut EngineState, bus: &Bus, new: EngineState) {
    let old = std::mem::replace(current, new);
    if old != new {
        bus.post(BusMessage::StateChanged {
            source: MessageSource::Graph,
            old,
            new,
            pending: None,
        });
    }
}

impl LocalGraph {
    fn new(
        join: Arc<Join>,
        format: OutputFormat,
        settings: UnitSettings,
        output: Option<OutputHandle>,
    ) -> Self {
        Self {
            join,
            format,
            settings,
            state: Arc::new(Mutex::new(EngineState::Null)),
            _output: output,
        }
    }

    /// Report `Paused` once the audible link has data to play.
    fn spawn_preroll(&self, generation: u64) -> Result<()> {
        let join = self.join.clone();
        let state = self.state.clone();
        thread::Builder::new()
            .name("local-preroll".into())
            .spawn(move || {
                while !join.has_preroll_data() {
                    if join.preroll_generation() != generation {
                        return;
                    }
                    match join.active() {
                        Some(link) => {
                            link.queue().wait_for_any(Duration::from_millis(20));
                        }
                        None => thread::sleep(Duration::from_millis(10)),
                    }
                }
                let mut current = lock(&state);
                if join.preroll_generation() != generation {
                    return;
                }
                tracing::debug!("preroll complete");
                commit_locked(&mut current, join.bus(), EngineState::Paused);
            })
            .context("spawn preroll thread")?;
        Ok(())
    }

    fn initial_limits(props: &PlaybackProperties) -> BufferLimits {
        BufferLimits {
            size_bytes: props.buffer_size_limit.unwrap_or(DEFAULT_BUFFER_SIZE_LIMIT),
            timeout: props.buffer_timeout.unwrap_or(DEFAULT_BUFFER_TIMEOUT),
            low_percent: props.low_buffer_threshold.unwrap_or(DEFAULT_LOW_BUFFER_THRESHOLD),
            high_percent: props.high_buffer_threshold.unwrap_or(DEFAULT_HIGH_BUFFER_THRESHOLD),
        }
    }
}

impl OutputGraph for LocalGraph {
    fn set_state(&mut self, target: EngineState) -> Result<()> {
        let generation = self.join.next_preroll_generation();
        tracing::debug!(%target, generation, "graph state requested");
        match target {
            EngineState::Null | EngineState::Ready => {
                self.join.set_paused(true);
                if target == EngineState::Null {
                    self.join.clear();
                }
                commit_state(&self.state, self.join.bus(), target);
            }
            EngineState::Paused => {
                self.join.set_paused(true);
                let current = *lock(&self.state);
                if matches!(current, EngineState::Paused | EngineState::Playing) {
                    commit_state(&self.state, self.join.bus(), target);
                } else {
                    self.spawn_preroll(generation)?;
                }
            }
            EngineState::Playing => {
                self.join.set_paused(false);
                commit_state(&self.state, self.join.bus(), target);
            }
        }
        Ok(())
    }

    fn query_position(&self, unit: PositionUnit) -> Option<i64> {
        match unit {
            PositionUnit::Nanoseconds => self
                .join
                .active()
                .map(|link| link.position_ns(self.format.rate)),
            PositionUnit::Bytes => None,
        }
    }

    fn query_duration(&self, unit: PositionUnit) -> Option<i64> {
        let info = self.join.active()?.unit()?.info()?;
        match unit {
            PositionUnit::Nanoseconds => info.duration_ns(),
            PositionUnit::Bytes => i64::try_from(info.file_size).ok(),
        }
    }

    fn seek(&mut self, position: i64, unit: PositionUnit) -> Result<()> {
        if unit == PositionUnit::Bytes {
            return Err(anyhow!("byte seeks are not supported"));
        }
        let position = u64::try_from(position).map_err(|_| anyhow!("negative seek position"))?;
        let link = self
            .join
            .active()
            .ok_or_else(|| anyhow!("nothing to seek in"))?;
        let unit = link
            .unit()
            .ok_or_else(|| anyhow!("unit {} is gone", link.id().0))?;
        unit.restart_at(position)
    }

    fn recalculate_latency(&mut self) {
        tracing::trace!("latency is fixed by the output buffer");
    }

    fn create_decode_unit(
        &mut self,
        id: UnitId,
        uri: &str,
        props: &PlaybackProperties,
        hooks: Arc<dyn UnitHooks>,
    ) -> Result<Arc<dyn DecodeUnit>> {
        let path = decode::path_from_uri(uri)?;
        tracing::debug!(unit = id.0, path = %path.display(), "creating decode unit");
        Ok(Arc::new(LocalUnit::new(
            id,
            path,
            self.join.clone(),
            hooks,
            self.format,
            self.settings,
            Self::initial_limits(props),
        )))
    }
}

impl Drop for LocalGraph {
    fn drop(&mut self) {
        self.join.next_preroll_generation();
        self.join.set_paused(true);
        self.join.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{DiscoveredOutput, Envelope, SourceFilter};
    use crate::tag_list::TagList;
    use crossbeam_channel::Receiver;
    use std::time::Instant;

    struct NothingRetired;

    impl SourceFilter for NothingRetired {
        fn is_retired(&self, _id: UnitId) -> bool {
            false
        }
    }

    struct LinkEverything;

    impl UnitHooks for LinkEverything {
        fn output_discovered(&self, output: &mut dyn DiscoveredOutput) {
            output.link().unwrap();
        }
        fn buffer_queue_added(&self) {}
        fn tags_observed(&self, _tags: &TagList) {}
        fn before_queue_input(&self) {}
        fn output_eos(&self) {}
    }

    fn graph() -> (LocalGraph, Receiver<Envelope>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let bus = Bus::new(tx, 1, Arc::new(NothingRetired));
        let join = Arc::new(Join::new(bus, Vec::new()));
        let format = OutputFormat {
            rate: 8_000,
            channels: 2,
        };
        let settings = UnitSettings {
            chunk_frames: 256,
            buffer_seconds: 1.0,
        };
        (LocalGraph::new(join, format, settings, None), rx)
    }

    fn wait_for_state(rx: &Receiver<Envelope>, want: EngineState) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match rx.recv_timeout(left) {
                Ok(Envelope {
                    message: BusMessage::StateChanged { new, .. },
                    ..
                }) if new == want => return true,
                Ok(_) => {}
                Err(_) => return false,
            }
        }
        false
    }

    #[test]
    fn pause_completes_after_preroll() {
        let (mut graph, rx) = graph();
        let path = decode::tests::write_wav("graph-preroll", 8_000, 2, 8_000);
        graph.set_state(EngineState::Paused).unwrap();
        assert!(rx.try_recv().is_err());

        let unit = graph
            .create_decode_unit(
                UnitId(1),
                path.to_str().unwrap(),
                &PlaybackProperties::default(),
                Arc::new(LinkEverything),
            )
            .unwrap();
        unit.sync_state().unwrap();
        assert!(wait_for_state(&rx, EngineState::Paused));

        assert_eq!(graph.query_duration(PositionUnit::Nanoseconds), Some(1_000_000_000));
        assert_eq!(graph.query_position(PositionUnit::Nanoseconds), Some(0));
        assert!(graph.query_duration(PositionUnit::Bytes).is_some_and(|b| b > 32_000));

        graph.set_state(EngineState::Playing).unwrap();
        assert!(wait_for_state(&rx, EngineState::Playing));
        unit.release_join();
        unit.shutdown();
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn stale_preroll_never_reports() {
        let (mut graph, rx) = graph();
        graph.set_state(EngineState::Paused).unwrap();
        graph.set_state(EngineState::Null).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(rx.try_iter().all(|e| !matches!(
            e.message,
            BusMessage::StateChanged {
                new: EngineState::Paused,
                ..
            }
        )));
    }

    #[test]
    fn byte_seeks_and_idle_seeks_fail() {
        let (mut graph, _rx) = graph();
        assert!(graph.seek(100, PositionUnit::Bytes).is_err());
        assert!(graph.seek(-1, PositionUnit::Nanoseconds).is_err());
        assert!(graph.seek(1_000, PositionUnit::Nanoseconds).is_err());
        assert_eq!(graph.query_position(PositionUnit::Nanoseconds), None);
    }

    #[test]
    fn non_file_uris_are_rejected() {
        let (mut graph, _rx) = graph();
        let result = graph.create_decode_unit(
            UnitId(1),
            "http://example.com/stream.mp3",
            &PlaybackProperties::default(),
            Arc::new(LinkEverything),
        );
        assert!(result.is_err());
    }
}
