//! Recording engine used by the controller tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow};

use super::{
    BufferLimits, Bus, BusMessage, DecodeUnit, DiscoveredOutput, EngineState, MediaEngine,
    MessageSource, OutputGraph, UnitHooks, UnitId,
};
use crate::processing::AudioStage;
use crate::properties::{PlaybackProperties, PositionUnit};

#[derive(Default)]
pub(crate) struct MockLog {
    pub graphs: usize,
    pub stages: usize,
    pub state_requests: Vec<EngineState>,
    pub seeks: Vec<(i64, PositionUnit)>,
    pub units: Vec<MockUnitRecord>,
    /// Teardown calls in order, e.g. `release 1`, `shutdown 1`.
    pub teardown: Vec<String>,
    pub bus: Option<Bus>,
    pub position_ns: Option<i64>,
    pub duration_ns: Option<i64>,
    pub duration_bytes: Option<i64>,
    pub fail_set_state: bool,
    pub fail_create_unit: bool,
    pub fail_seek: bool,
    /// Post a graph `StateChanged` for every accepted request.
    pub auto_state: bool,
}

impl MockLog {
    pub fn requests_after(&self, skip: usize) -> Vec<EngineState> {
        self.state_requests
            .iter()
            .copied()
            .filter(|s| *s != EngineState::Null)
            .skip(skip)
            .collect()
    }
}

#[derive(Clone)]
pub(crate) struct MockUnitRecord {
    pub id: UnitId,
    pub uri: String,
    pub hooks: Arc<dyn UnitHooks>,
    pub unit: Arc<MockUnit>,
}

pub(crate) struct MockUnit {
    id: UnitId,
    log: Arc<Mutex<MockLog>>,
    pub live: Mutex<Option<bool>>,
    pub level: Mutex<Option<u32>>,
    pub limits: Mutex<Vec<BufferLimits>>,
    pub synced: AtomicBool,
    pub probe_installed: AtomicBool,
}

impl DecodeUnit for MockUnit {
    fn sync_state(&self) -> Result<()> {
        self.synced.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn apply_buffer_limits(&self, limits: &BufferLimits) {
        self.limits.lock().unwrap().push(*limits);
    }

    fn buffer_level(&self) -> Option<u32> {
        *self.level.lock().unwrap()
    }

    fn query_live(&self) -> Option<bool> {
        *self.live.lock().unwrap()
    }

    fn install_block_probe(&self) {
        self.probe_installed.store(true, Ordering::SeqCst);
    }

    fn release_join(&self) {
        self.log
            .lock()
            .unwrap()
            .teardown
            .push(format!("release {}", self.id.0));
    }

    fn shutdown(&self) {
        self.log
            .lock()
            .unwrap()
            .teardown
            .push(format!("shutdown {}", self.id.0));
    }
}

/// Output offered to `UnitHooks::output_discovered`.
pub(crate) struct MockOutput {
    pub linked: bool,
    pub audio: bool,
    pub seekable: Option<bool>,
}

impl MockOutput {
    pub fn audio(seekable: bool) -> Self {
        Self {
            linked: false,
            audio: true,
            seekable: Some(seekable),
        }
    }
}

impl DiscoveredOutput for MockOutput {
    fn is_linked(&self) -> bool {
        self.linked
    }

    fn is_audio(&self) -> bool {
        self.audio
    }

    fn link(&mut self) -> Result<()> {
        self.linked = true;
        Ok(())
    }

    fn query_seekable(&self) -> Option<bool> {
        self.seekable
    }
}

#[derive(Clone, Default)]
pub(crate) struct MockEngine {
    log: Arc<Mutex<MockLog>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> MutexGuard<'_, MockLog> {
        self.log.lock().unwrap()
    }

    pub fn unit(&self, index: usize) -> MockUnitRecord {
        self.log().units[index].clone()
    }

    pub fn last_unit(&self) -> MockUnitRecord {
        self.log().units.last().cloned().unwrap()
    }

    pub fn uris(&self) -> Vec<String> {
        self.log().units.iter().map(|u| u.uri.clone()).collect()
    }
}

impl MediaEngine for MockEngine {
    fn create_graph(
        &mut self,
        bus: Bus,
        stages: Vec<Arc<dyn AudioStage>>,
    ) -> Result<Box<dyn OutputGraph>> {
        let mut log = self.log();
        log.graphs += 1;
        log.stages = stages.len();
        log.bus = Some(bus.clone());
        Ok(Box::new(MockGraph {
            log: self.log.clone(),
            bus,
            state: EngineState::Null,
        }))
    }
}

struct MockGraph {
    log: Arc<Mutex<MockLog>>,
    bus: Bus,
    state: EngineState,
}

impl OutputGraph for MockGraph {
    fn set_state(&mut self, state: EngineState) -> Result<()> {
        let auto = {
            let mut log = self.log.lock().unwrap();
            if log.fail_set_state && state != EngineState::Null {
                return Err(anyhow!("state change rejected"));
            }
            log.state_requests.push(state);
            log.auto_state
        };
        let old = std::mem::replace(&mut self.state, state);
        if auto {
            self.bus.post(BusMessage::StateChanged {
                source: MessageSource::Graph,
                old,
                new: state,
                pending: None,
            });
        }
        Ok(())
    }

    fn query_position(&self, unit: PositionUnit) -> Option<i64> {
        match unit {
            PositionUnit::Nanoseconds => self.log.lock().unwrap().position_ns,
            PositionUnit::Bytes => None,
        }
    }

    fn query_duration(&self, unit: PositionUnit) -> Option<i64> {
        let log = self.log.lock().unwrap();
        match unit {
            PositionUnit::Nanoseconds => log.duration_ns,
            PositionUnit::Bytes => log.duration_bytes,
        }
    }

    fn seek(&mut self, position: i64, unit: PositionUnit) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        if log.fail_seek {
            return Err(anyhow!("seek rejected"));
        }
        log.seeks.push((position, unit));
        Ok(())
    }

    fn recalculate_latency(&mut self) {}

    fn create_decode_unit(
        &mut self,
        id: UnitId,
        uri: &str,
        _props: &PlaybackProperties,
        hooks: Arc<dyn UnitHooks>,
    ) -> Result<Arc<dyn DecodeUnit>> {
        let mut log = self.log.lock().unwrap();
        if log.fail_create_unit {
            return Err(anyhow!("no decoder for {uri}"));
        }
        let unit = Arc::new(MockUnit {
            id,
            log: self.log.clone(),
            live: Mutex::new(Some(false)),
            level: Mutex::new(None),
            limits: Mutex::new(Vec::new()),
            synced: AtomicBool::new(false),
            probe_installed: AtomicBool::new(false),
        });
        log.units.push(MockUnitRecord {
            id,
            uri: uri.to_string(),
            hooks,
            unit: unit.clone(),
        });
        Ok(unit)
    }
}
