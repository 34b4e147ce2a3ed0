//! Buffering queue between a unit's demuxer and its decoder.
//!
//! Fill is accounted in encoded bytes and in seconds of queued packets. The
//! queue enters buffering when the fill drops below the low watermark and
//! reports progress towards the high watermark until it is reached (or the
//! source ends), posting one `Buffering` message per percent change.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use symphonia::core::formats::Packet;

use crate::engine::{BufferLimits, Bus, BusMessage, MessageSource, UnitId};
use crate::stream::lock;

pub(super) struct PacketQueue {
    unit: UnitId,
    bus: Bus,
    inner: Mutex<PacketInner>,
    cv: Condvar,
}

struct PacketInner {
    packets: VecDeque<(Packet, f64)>,
    bytes: usize,
    seconds: f64,
    limits: BufferLimits,
    buffering: bool,
    last_percent: Option<u32>,
    /// No more input will arrive.
    eos: bool,
    /// Aborted; pops return `None` right away.
    closed: bool,
}

impl PacketInner {
    /// Fill in percent of the tighter of the size and time limits.
    fn fill_percent(&self) -> u32 {
        let by_size = if self.limits.size_bytes > 0 {
            self.bytes as u64 * 100 / u64::from(self.limits.size_bytes)
        } else {
            0
        };
        let by_time = if self.limits.timeout.is_zero() {
            0
        } else {
            (self.seconds * 100.0 / self.limits.timeout.as_secs_f64()) as u64
        };
        by_size.max(by_time).min(100) as u32
    }

    fn is_full(&self) -> bool {
        (self.limits.size_bytes > 0 && self.bytes >= self.limits.size_bytes as usize)
            || (!self.limits.timeout.is_zero()
                && self.seconds >= self.limits.timeout.as_secs_f64())
    }

    /// Work out the buffering report due after a fill change, if any.
    fn buffering_report(&mut self) -> Option<u32> {
        let fill = self.fill_percent();
        let high = self.limits.high_percent.clamp(1, 100);
        let percent = (fill * 100 / high).min(100);

        if self.buffering {
            if percent >= 100 || self.eos {
                self.buffering = false;
                self.last_percent = Some(100);
                return Some(100);
            }
        } else if fill < self.limits.low_percent && !self.eos {
            self.buffering = true;
        } else {
            return None;
        }

        if self.last_percent == Some(percent) {
            return None;
        }
        self.last_percent = Some(percent);
        Some(percent)
    }
}

impl PacketQueue {
    pub(super) fn new(unit: UnitId, bus: Bus, limits: BufferLimits) -> Self {
        Self {
            unit,
            bus,
            inner: Mutex::new(PacketInner {
                packets: VecDeque::new(),
                bytes: 0,
                seconds: 0.0,
                limits,
                buffering: false,
                last_percent: None,
                eos: false,
                closed: false,
            }),
            cv: Condvar::new(),
        }
    }

    fn report(&self, percent: Option<u32>) {
        if let Some(percent) = percent {
            tracing::trace!(unit = self.unit.0, percent, "buffering");
            self.bus.post(BusMessage::Buffering {
                source: MessageSource::Unit(self.unit),
                percent,
            });
        }
    }

    /// Evaluate the initial fill; an empty queue starts out buffering.
    pub(super) fn start(&self) {
        let report = lock(&self.inner).buffering_report();
        self.report(report);
    }

    pub(super) fn set_limits(&self, limits: BufferLimits) {
        let report = {
            let mut g = lock(&self.inner);
            g.limits = limits;
            g.buffering_report()
        };
        self.cv.notify_all();
        self.report(report);
    }

    pub(super) fn level_bytes(&self) -> u32 {
        u32::try_from(lock(&self.inner).bytes).unwrap_or(u32::MAX)
    }

    /// Queue a packet lasting `seconds`, blocking while the queue is full.
    ///
    /// Returns `false` if the queue was closed.
    pub(super) fn push(&self, packet: Packet, seconds: f64) -> bool {
        let report = {
            let mut g = lock(&self.inner);
            while g.is_full() && !g.closed {
                g = self.cv.wait(g).unwrap_or_else(|e| e.into_inner());
            }
            if g.closed {
                return false;
            }
            g.bytes += packet.buf().len();
            g.seconds += seconds;
            g.packets.push_back((packet, seconds));
            g.buffering_report()
        };
        self.cv.notify_all();
        self.report(report);
        true
    }

    /// Next packet, blocking until one arrives. `None` at end of input or
    /// once closed.
    pub(super) fn pop(&self) -> Option<Packet> {
        let (packet, report) = {
            let mut g = lock(&self.inner);
            while g.packets.is_empty() && !g.eos && !g.closed {
                g = self.cv.wait(g).unwrap_or_else(|e| e.into_inner());
            }
            if g.closed {
                return None;
            }
            let (packet, seconds) = g.packets.pop_front()?;
            g.bytes = g.bytes.saturating_sub(packet.buf().len());
            g.seconds = (g.seconds - seconds).max(0.0);
            (packet, g.buffering_report())
        };
        self.cv.notify_all();
        self.report(report);
        Some(packet)
    }

    /// The source is exhausted; queued packets still drain.
    pub(super) fn finish(&self) {
        let report = {
            let mut g = lock(&self.inner);
            g.eos = true;
            g.buffering_report()
        };
        self.cv.notify_all();
        self.report(report);
    }

    /// Drop everything and wake all waiters.
    pub(super) fn close(&self) {
        {
            let mut g = lock(&self.inner);
            g.closed = true;
            g.packets.clear();
            g.bytes = 0;
            g.seconds = 0.0;
        }
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Envelope, SourceFilter};
    use crossbeam_channel::Receiver;
    use std::sync::Arc;
    use std::time::Duration;

    struct NothingRetired;

    impl SourceFilter for NothingRetired {
        fn is_retired(&self, _id: UnitId) -> bool {
            false
        }
    }

    fn queue(size_bytes: u32, timeout: Duration) -> (PacketQueue, Receiver<Envelope>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let bus = Bus::new(tx, 1, Arc::new(NothingRetired));
        let limits = BufferLimits {
            size_bytes,
            timeout,
            low_percent: 10,
            high_percent: 100,
        };
        (PacketQueue::new(UnitId(3), bus, limits), rx)
    }

    fn packet(bytes: usize) -> Packet {
        Packet::new_from_slice(0, 0, 0, &vec![0u8; bytes])
    }

    fn percents(rx: &Receiver<Envelope>) -> Vec<u32> {
        rx.try_iter()
            .filter_map(|e| match e.message {
                BusMessage::Buffering { percent, .. } => Some(percent),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn fills_up_to_the_high_watermark() {
        let (q, rx) = queue(100, Duration::ZERO);
        q.start();
        assert!(q.push(packet(50), 0.0));
        assert!(q.push(packet(50), 0.0));
        assert_eq!(percents(&rx), vec![0, 50, 100]);
        assert_eq!(q.level_bytes(), 100);
    }

    #[test]
    fn draining_below_low_watermark_restarts_buffering() {
        let (q, rx) = queue(100, Duration::ZERO);
        q.start();
        q.push(packet(5), 0.0);
        q.push(packet(95), 0.0);
        percents(&rx);

        q.pop().unwrap();
        assert!(percents(&rx).is_empty());
        q.pop().unwrap();
        assert_eq!(percents(&rx), vec![0]);
    }

    #[test]
    fn end_of_input_completes_buffering() {
        let (q, rx) = queue(100, Duration::ZERO);
        q.start();
        q.push(packet(20), 0.0);
        q.finish();
        assert_eq!(percents(&rx), vec![0, 20, 100]);

        q.pop().unwrap();
        assert!(q.pop().is_none());
        assert!(percents(&rx).is_empty());
    }

    #[test]
    fn time_limit_counts_as_fill() {
        let (q, rx) = queue(1_000_000, Duration::from_secs(2));
        q.start();
        q.push(packet(10), 1.0);
        q.push(packet(10), 1.0);
        assert_eq!(percents(&rx), vec![0, 50, 100]);
    }

    #[test]
    fn closing_unblocks_a_full_push() {
        let (q, _rx) = queue(10, Duration::ZERO);
        let q = Arc::new(q);
        q.push(packet(10), 0.0);
        let pusher = q.clone();
        let handle = std::thread::spawn(move || pusher.push(packet(1), 0.0));
        std::thread::sleep(Duration::from_millis(20));
        q.close();
        assert!(!handle.join().unwrap());
        assert!(q.pop().is_none());
    }
}
