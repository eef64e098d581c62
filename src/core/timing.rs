//! Lock-wait latency recording.
//!
//! Counters are plain atomics; extrema are maintained with compare-and-retry
//! loops so concurrent updates are never lost. Statistics are computed on
//! demand from a snapshot of the counters.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::deadlock::AccessMode;
use crate::util::{duration_ns, epoch_ms};

/// Wait counters for one access mode.
#[derive(Debug)]
pub struct WaitCounters {
    locks: AtomicU64,
    samples: AtomicU64,
    cumulated_ns: AtomicU64,
    min_ns: AtomicU64,
    max_ns: AtomicU64,
}

impl Default for WaitCounters {
    fn default() -> Self {
        Self {
            locks: AtomicU64::new(0),
            samples: AtomicU64::new(0),
            cumulated_ns: AtomicU64::new(0),
            min_ns: AtomicU64::new(u64::MAX),
            max_ns: AtomicU64::new(0),
        }
    }
}

impl WaitCounters {
    fn count_lock(&self) {
        self.locks.fetch_add(1, Ordering::Relaxed);
    }

    fn record(&self, wait_ns: u64) {
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.cumulated_ns.fetch_add(wait_ns, Ordering::Relaxed);

        let mut current = self.max_ns.load(Ordering::Relaxed);
        while wait_ns > current {
            match self.max_ns.compare_exchange_weak(
                current,
                wait_ns,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(seen) => current = seen,
            }
        }

        let mut current = self.min_ns.load(Ordering::Relaxed);
        while wait_ns < current {
            match self.min_ns.compare_exchange_weak(
                current,
                wait_ns,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(seen) => current = seen,
            }
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn stats(&self, compensation_ns: u64) -> WaitStats {
        let locks = self.locks.load(Ordering::Relaxed);
        let samples = self.samples.load(Ordering::Relaxed);
        let cumulated = self.cumulated_ns.load(Ordering::Relaxed);
        if samples == 0 {
            return WaitStats {
                locks,
                samples,
                avg_ns: 0.0,
                min_ns: None,
                max_ns: None,
            };
        }
        let avg = (cumulated as f64 / samples as f64) - compensation_ns as f64;
        WaitStats {
            locks,
            samples,
            avg_ns: avg.max(0.0),
            min_ns: Some(self.min_ns.load(Ordering::Relaxed).saturating_sub(compensation_ns)),
            max_ns: Some(self.max_ns.load(Ordering::Relaxed).saturating_sub(compensation_ns)),
        }
    }

    fn reset(&self) {
        self.locks.store(0, Ordering::Relaxed);
        self.samples.store(0, Ordering::Relaxed);
        self.cumulated_ns.store(0, Ordering::Relaxed);
        self.min_ns.store(u64::MAX, Ordering::Relaxed);
        self.max_ns.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of the wait statistics for one access mode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WaitStats {
    /// Acquisitions counted, sampled or not.
    pub locks: u64,
    /// Acquisitions whose wait was measured.
    pub samples: u64,
    /// Average measured wait after compensation, clamped to zero.
    pub avg_ns: f64,
    /// Smallest measured wait after compensation; `None` without samples.
    pub min_ns: Option<u64>,
    /// Largest measured wait after compensation; `None` without samples.
    pub max_ns: Option<u64>,
}

/// Read and write wait statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimingStats {
    /// Read-side statistics.
    pub read: WaitStats,
    /// Write-side statistics.
    pub write: WaitStats,
}

/// Read and write wait counters of one lock, or of the whole process.
#[derive(Debug, Default)]
pub struct LatencyRecorder {
    read: WaitCounters,
    write: WaitCounters,
}

impl LatencyRecorder {
    /// Create a zeroed recorder.
    pub fn new() -> Self {
        Self::default()
    }

    const fn side(&self, mode: AccessMode) -> &WaitCounters {
        match mode {
            AccessMode::Read => &self.read,
            AccessMode::Write => &self.write,
        }
    }

    /// Count one acquisition without measuring it.
    pub fn count_lock(&self, mode: AccessMode) {
        self.side(mode).count_lock();
    }

    /// Record a measured wait.
    pub fn record(&self, mode: AccessMode, wait: Duration) {
        self.side(mode).record(duration_ns(wait));
    }

    /// Statistics with `compensation_ns` subtracted from every measurement.
    pub fn stats(&self, compensation_ns: u64) -> TimingStats {
        TimingStats {
            read: self.read.stats(compensation_ns),
            write: self.write.stats(compensation_ns),
        }
    }

    /// Zero every counter.
    pub fn reset(&self) {
        self.read.reset();
        self.write.reset();
    }
}

/// 1-in-N sampling decision.
#[derive(Debug)]
pub struct Sampler {
    enabled: AtomicBool,
    modulo: AtomicU32,
    counter: AtomicU64,
}

impl Sampler {
    /// Sampler that is off, with `modulo` ready for when it is switched on.
    pub fn new(modulo: u32) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            modulo: AtomicU32::new(modulo.max(1)),
            counter: AtomicU64::new(0),
        }
    }

    /// Turn sampling on or off. `rate` in `(0, 1]` sets the modulo to
    /// `round(1 / rate)`; `None` keeps `default_modulo`.
    pub fn configure(&self, on: bool, rate: Option<f64>, default_modulo: u32) {
        let modulo = rate.map_or(default_modulo, modulo_for_rate);
        self.modulo.store(modulo.max(1), Ordering::Relaxed);
        self.counter.store(0, Ordering::Relaxed);
        self.enabled.store(on, Ordering::Relaxed);
    }

    /// Effective sampling rate, or `None` when every acquisition is measured.
    pub fn rate(&self) -> Option<f64> {
        if self.enabled.load(Ordering::Relaxed) {
            Some(1.0 / f64::from(self.modulo.load(Ordering::Relaxed)))
        } else {
            None
        }
    }

    /// Current modulo.
    pub fn modulo(&self) -> u32 {
        self.modulo.load(Ordering::Relaxed)
    }

    /// Whether the next acquisition should be measured.
    pub fn should_sample(&self) -> bool {
        if !self.enabled.load(Ordering::Relaxed) {
            return true;
        }
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        n % u64::from(self.modulo.load(Ordering::Relaxed)) == 0
    }
}

/// Convert a sampling rate into a 1-in-N modulo.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn modulo_for_rate(rate: f64) -> u32 {
    if !(rate > 0.0) {
        return u32::MAX;
    }
    (1.0 / rate).round().clamp(1.0, f64::from(u32::MAX)) as u32
}

const WINDOW_SLOTS: u64 = 4;

/// Milliseconds the lock was write-held in each of the last few wall-clock
/// seconds, kept in a small ring indexed by epoch second.
///
/// Each slot is tagged with the second it describes; a slot whose tag does
/// not match the second asked for reads as zero.
#[derive(Debug, Default)]
pub struct LockedTimeWindow {
    slots: Mutex<[(u64, u64); WINDOW_SLOTS as usize]>,
}

impl LockedTimeWindow {
    /// Create an empty window.
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn index(second: u64) -> usize {
        (second % WINDOW_SLOTS) as usize
    }

    fn add(slots: &mut [(u64, u64)], second: u64, ms: u64) {
        let slot = &mut slots[Self::index(second)];
        if slot.0 > second {
            return;
        }
        if slot.0 < second {
            *slot = (second, 0);
        }
        slot.1 = slot.1.saturating_add(ms);
    }

    /// Account a hold interval `[acquired, released]`.
    pub fn add_interval(&self, acquired: SystemTime, released: SystemTime) {
        let acquired_ms = epoch_ms(acquired);
        let released_ms = epoch_ms(released);
        let released_sec = released_ms / 1000;
        let held_ms = released_ms.saturating_sub(acquired_ms);
        let into_current = released_ms - released_sec * 1000;
        let previous = released_sec.saturating_sub(1);

        let mut slots = self.slots.lock();
        if held_ms >= 2000 {
            Self::add(&mut *slots, previous, 1000);
            Self::add(&mut *slots, released_sec, into_current);
        } else if held_ms >= 1000 {
            let before = (released_sec * 1000).saturating_sub(acquired_ms);
            Self::add(&mut *slots, previous, before);
            Self::add(&mut *slots, released_sec, into_current);
        } else {
            Self::add(&mut *slots, released_sec, held_ms);
        }
    }

    /// Milliseconds write-held during the second two seconds before `now`.
    pub fn penultimate_second_at(&self, now: SystemTime) -> u64 {
        let second = (epoch_ms(now) / 1000).saturating_sub(2);
        let (tag, ms) = self.slots.lock()[Self::index(second)];
        if tag == second {
            ms
        } else {
            0
        }
    }

    /// [`penultimate_second_at`](Self::penultimate_second_at) for the current time.
    pub fn penultimate_second(&self) -> u64 {
        self.penultimate_second_at(SystemTime::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    #[test]
    fn test_stats_average_min_max() {
        let recorder = LatencyRecorder::new();
        for ns in [100, 200, 600] {
            recorder.count_lock(AccessMode::Read);
            recorder.record(AccessMode::Read, Duration::from_nanos(ns));
        }
        let stats = recorder.stats(0);
        assert_eq!(stats.read.samples, 3);
        assert_eq!(stats.read.locks, 3);
        assert!((stats.read.avg_ns - 300.0).abs() < f64::EPSILON);
        assert_eq!(stats.read.min_ns, Some(100));
        assert_eq!(stats.read.max_ns, Some(600));
        assert_eq!(stats.write.samples, 0);
        assert_eq!(stats.write.min_ns, None);
    }

    #[test]
    fn test_compensation_clamps_to_zero() {
        let recorder = LatencyRecorder::new();
        recorder.record(AccessMode::Write, Duration::from_nanos(50));
        recorder.record(AccessMode::Write, Duration::from_nanos(150));
        let stats = recorder.stats(120);
        assert!(stats.write.avg_ns.abs() < f64::EPSILON);
        assert_eq!(stats.write.min_ns, Some(0));
        assert_eq!(stats.write.max_ns, Some(30));
    }

    #[test]
    fn test_concurrent_extrema_are_not_lost() {
        let recorder = std::sync::Arc::new(LatencyRecorder::new());
        let handles: Vec<_> = (1..=8u64)
            .map(|t| {
                let recorder = std::sync::Arc::clone(&recorder);
                std::thread::spawn(move || {
                    for i in 0..1000u64 {
                        recorder.record(AccessMode::Read, Duration::from_nanos(t * 1000 + i));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let stats = recorder.stats(0);
        assert_eq!(stats.read.samples, 8000);
        assert_eq!(stats.read.min_ns, Some(1000));
        assert_eq!(stats.read.max_ns, Some(8999));
    }

    #[test]
    fn test_sampler_one_in_n() {
        let sampler = Sampler::new(300);
        assert!(sampler.should_sample());
        assert_eq!(sampler.rate(), None);
        sampler.configure(true, Some(0.25), 300);
        assert_eq!(sampler.modulo(), 4);
        let sampled = (0..100).filter(|_| sampler.should_sample()).count();
        assert_eq!(sampled, 25);
        sampler.configure(true, None, 300);
        assert_eq!(sampler.rate(), Some(1.0 / 300.0));
    }

    #[test]
    fn test_modulo_for_rate_rounds() {
        assert_eq!(modulo_for_rate(1.0), 1);
        assert_eq!(modulo_for_rate(0.3), 3);
        assert_eq!(modulo_for_rate(0.01), 100);
    }

    #[test]
    fn test_window_accounts_short_hold_in_release_second() {
        let window = LockedTimeWindow::new();
        let base = UNIX_EPOCH + Duration::from_secs(1_000);
        window.add_interval(base + Duration::from_millis(100), base + Duration::from_millis(350));
        assert_eq!(window.penultimate_second_at(base + Duration::from_secs(2)), 250);
    }

    #[test]
    fn test_window_splits_hold_across_seconds() {
        let window = LockedTimeWindow::new();
        let base = UNIX_EPOCH + Duration::from_secs(1_000);
        window.add_interval(base + Duration::from_millis(600), base + Duration::from_millis(1_700));
        assert_eq!(window.penultimate_second_at(base + Duration::from_secs(2)), 400);
        assert_eq!(window.penultimate_second_at(base + Duration::from_secs(3)), 700);
    }

    #[test]
    fn test_window_saturates_long_hold() {
        let window = LockedTimeWindow::new();
        let base = UNIX_EPOCH + Duration::from_secs(1_000);
        window.add_interval(base, base + Duration::from_millis(3_200));
        assert_eq!(window.penultimate_second_at(base + Duration::from_secs(4)), 1000);
        assert_eq!(window.penultimate_second_at(base + Duration::from_secs(5)), 200);
    }

    #[test]
    fn test_window_ignores_stale_slots() {
        let window = LockedTimeWindow::new();
        let base = UNIX_EPOCH + Duration::from_secs(1_000);
        window.add_interval(base, base + Duration::from_millis(300));
        assert_eq!(window.penultimate_second_at(base + Duration::from_secs(2)), 300);
        // same ring slot, four seconds later, nothing recorded since
        assert_eq!(window.penultimate_second_at(base + Duration::from_secs(6)), 0);

        window.add_interval(
            base + Duration::from_secs(4),
            base + Duration::from_millis(4_100),
        );
        assert_eq!(window.penultimate_second_at(base + Duration::from_secs(6)), 100);
        // an older second never overwrites a newer one
        window.add_interval(base, base + Duration::from_millis(50));
        assert_eq!(window.penultimate_second_at(base + Duration::from_secs(6)), 100);
    }
}
