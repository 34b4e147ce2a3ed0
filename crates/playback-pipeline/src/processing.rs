//! Pluggable processing stages spliced between the join point and the output.
//!
//! A [`ProcessingObject`] is owned by the host application and handed to the
//! pipeline at construction. Each time the output graph is (re)built the
//! pipeline calls [`ProcessingObject::setup`] and inserts the stage returned by
//! [`ProcessingObject::engine_element`]; teardown happens when the graph goes
//! away.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// In-place processing of interleaved `f32` samples.
///
/// Called from the real-time output callback: implementations must not block.
pub trait AudioStage: Send + Sync {
    fn process(&self, samples: &mut [f32], channels: usize);
}

pub trait ProcessingObject: Send + Sync {
    /// Create the engine-side stage. Returns `false` on failure, which aborts
    /// graph construction.
    fn setup(&self) -> bool;
    /// Release the engine-side stage.
    fn teardown(&self);
    /// Stage created by the last successful `setup`.
    fn engine_element(&self) -> Option<Arc<dyn AudioStage>>;
}

/// Linear gain and mute shared between the control handle and the stage.
struct VolumeState {
    volume_bits: AtomicU64,
    muted: AtomicBool,
}

impl VolumeState {
    fn volume(&self) -> f64 {
        f64::from_bits(self.volume_bits.load(Ordering::Relaxed))
    }
}

struct VolumeStage {
    state: Arc<VolumeState>,
}

impl AudioStage for VolumeStage {
    fn process(&self, samples: &mut [f32], _channels: usize) {
        if self.state.muted.load(Ordering::Relaxed) {
            samples.fill(0.0);
            return;
        }
        let gain = self.state.volume() as f32;
        if gain != 1.0 {
            for s in samples.iter_mut() {
                *s *= gain;
            }
        }
    }
}

/// Software volume control.
///
/// Volume is linear (1.0 = unity) and never negative. Changes apply to the
/// running stage immediately and survive graph rebuilds.
pub struct SoftVolumeControl {
    state: Arc<VolumeState>,
    stage: Mutex<Option<Arc<dyn AudioStage>>>,
}

impl SoftVolumeControl {
    pub fn new() -> Self {
        Self {
            state: Arc::new(VolumeState {
                volume_bits: AtomicU64::new(1.0f64.to_bits()),
                muted: AtomicBool::new(false),
            }),
            stage: Mutex::new(None),
        }
    }

    pub fn set_volume(&self, volume: f64) {
        let volume = if volume.is_finite() { volume.max(0.0) } else { 1.0 };
        self.state
            .volume_bits
            .store(volume.to_bits(), Ordering::Relaxed);
    }

    pub fn volume(&self) -> f64 {
        self.state.volume()
    }

    pub fn set_muted(&self, muted: bool) {
        self.state.muted.store(muted, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.state.muted.load(Ordering::Relaxed)
    }
}

impl Default for SoftVolumeControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessingObject for SoftVolumeControl {
    fn setup(&self) -> bool {
        let stage: Arc<dyn AudioStage> = Arc::new(VolumeStage {
            state: self.state.clone(),
        });
        *self.stage.lock().unwrap_or_else(|e| e.into_inner()) = Some(stage);
        true
    }

    fn teardown(&self) {
        self.stage.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    fn engine_element(&self) -> Option<Arc<dyn AudioStage>> {
        self.stage.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_unity_and_unmuted() {
        let v = SoftVolumeControl::new();
        assert_eq!(v.volume(), 1.0);
        assert!(!v.is_muted());
        assert!(v.engine_element().is_none());
    }

    #[test]
    fn negative_volume_clamps_to_zero() {
        let v = SoftVolumeControl::new();
        v.set_volume(-0.5);
        assert_eq!(v.volume(), 0.0);
        v.set_volume(f64::NAN);
        assert_eq!(v.volume(), 1.0);
    }

    #[test]
    fn values_set_before_setup_apply_to_stage() {
        let v = SoftVolumeControl::new();
        v.set_volume(0.5);
        assert!(v.setup());
        let stage = v.engine_element().unwrap();

        let mut samples = [1.0f32, -1.0, 0.5, 0.25];
        stage.process(&mut samples, 2);
        assert_eq!(samples, [0.5, -0.5, 0.25, 0.125]);

        v.set_muted(true);
        stage.process(&mut samples, 2);
        assert_eq!(samples, [0.0; 4]);

        v.teardown();
        assert!(v.engine_element().is_none());
    }
}
