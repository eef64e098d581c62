//! Overhead estimates for the diagnostics, used to pick a timing
//! compensation and a sampling rate that fits a CPU budget.
//!
//! Every estimate runs on throwaway locks bound to a private
//! [`Diagnostics`] so the caller's switches and rules are left alone.

use std::hint::black_box;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::DiagnosticsConfig;
use crate::core::diagnostics::Diagnostics;
use crate::core::error::LockError;
use crate::core::rwlock::RwLock;
use crate::core::timing::modulo_for_rate;
use crate::util::elapsed_ns;

/// Measured per-operation costs, in ns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationReport {
    /// Cost of taking one timestamp.
    pub timing_compensation_ns: u64,
    /// Cost of an uninstrumented write lock + unlock.
    pub lock_unlock_ns: u64,
    /// Extra cost of timing one write lock + unlock.
    pub timing_latency_ns: u64,
    /// Extra cost per lock of order checking three locks in one rule.
    pub order_check_latency_ns: u64,
}

impl CalibrationReport {
    /// Sampling rate keeping timing overhead at `overhead` (a fraction of lock cost).
    #[allow(clippy::cast_precision_loss)]
    pub fn suggest_sampling(&self, overhead: f64) -> f64 {
        if self.timing_latency_ns == 0 {
            return 1.0;
        }
        (overhead * self.lock_unlock_ns as f64 / self.timing_latency_ns as f64).clamp(0.0, 1.0)
    }
}

fn scratch() -> Arc<Diagnostics> {
    Diagnostics::shared(&DiagnosticsConfig {
        quiesce_ms: 0,
        ..DiagnosticsConfig::default()
    })
}

fn scratch_lock(diagnostics: &Arc<Diagnostics>) -> Result<RwLock, LockError> {
    RwLock::builder()
        .blocking(true)
        .order_check(true)
        .diagnostics(Arc::clone(diagnostics))
        .build()
}

fn per_op(total_ns: u64, ops: u64) -> u64 {
    total_ns / ops.max(1)
}

fn write_cycles(lock: &RwLock, loops: u64) -> Result<u64, LockError> {
    let start = Instant::now();
    for _ in 0..loops {
        lock.lock_write()?;
        lock.unlock_write()?;
    }
    Ok(elapsed_ns(start))
}

/// Average cost of one timestamp.
pub fn estimate_timing_compensation(loops: u64) -> u64 {
    let start = Instant::now();
    for _ in 0..loops {
        black_box(Instant::now());
    }
    per_op(elapsed_ns(start), loops)
}

/// Average cost of an uninstrumented write lock + unlock.
pub fn estimate_lock_unlock_duration(loops: u64) -> Result<u64, LockError> {
    let diagnostics = scratch();
    let lock = scratch_lock(&diagnostics)?;
    Ok(per_op(write_cycles(&lock, loops)?, loops))
}

/// Extra cost of timing every write lock + unlock.
pub fn estimate_timing_added_latency(loops: u64) -> Result<u64, LockError> {
    let diagnostics = scratch();
    let lock = scratch_lock(&diagnostics)?;
    lock.set_timing(true);
    let timed = write_cycles(&lock, loops)?;
    lock.set_timing(false);
    let bare = write_cycles(&lock, loops)?;
    Ok(per_op(timed.saturating_sub(bare), loops))
}

/// Extra cost per lock of order checking `locks` locks held in rule order.
pub fn estimate_order_check_added_latency(locks: usize, loops: u64) -> Result<u64, LockError> {
    let diagnostics = scratch();
    let set = (0..locks)
        .map(|_| scratch_lock(&diagnostics))
        .collect::<Result<Vec<_>, _>>()?;
    let refs: Vec<&RwLock> = set.iter().collect();
    diagnostics
        .add_order_rule("calibration", &refs)
        .map_err(|e| LockError::InvalidConfig(e.to_string()))?;

    let cycle = |set: &[RwLock]| -> Result<u64, LockError> {
        let start = Instant::now();
        for _ in 0..loops {
            for lock in set {
                lock.lock_write()?;
            }
            for lock in set.iter().rev() {
                lock.unlock_write()?;
            }
        }
        Ok(elapsed_ns(start))
    };

    diagnostics.set_order_check(true);
    let checked = cycle(&set)?;
    diagnostics.set_order_check(false);
    let bare = cycle(&set)?;
    diagnostics.reset_order_rules();
    Ok(per_op(checked.saturating_sub(bare), loops * locks as u64))
}

impl Diagnostics {
    /// Measure diagnostics overhead and store the timing compensation.
    pub fn calibrate(&self, loops: u64) -> Result<CalibrationReport, LockError> {
        let report = CalibrationReport {
            timing_compensation_ns: estimate_timing_compensation(loops),
            lock_unlock_ns: estimate_lock_unlock_duration(loops)?,
            timing_latency_ns: estimate_timing_added_latency(loops)?,
            order_check_latency_ns: estimate_order_check_added_latency(3, loops)?,
        };
        self.set_timing_compensation(report.timing_compensation_ns);
        info!(
            timing_compensation_ns = report.timing_compensation_ns,
            lock_unlock_ns = report.lock_unlock_ns,
            timing_latency_ns = report.timing_latency_ns,
            order_check_latency_ns = report.order_check_latency_ns,
            "lock diagnostics calibrated"
        );
        Ok(report)
    }

    /// Pick the default sampling rate that keeps timing overhead at
    /// `overhead` of the lock cost, install it, and return it.
    pub fn tune_sampling(&self, overhead: f64, loops: u64) -> Result<f64, LockError> {
        let report = CalibrationReport {
            timing_compensation_ns: self.timing_compensation(),
            lock_unlock_ns: estimate_lock_unlock_duration(loops)?,
            timing_latency_ns: estimate_timing_added_latency(loops)?,
            order_check_latency_ns: 0,
        };
        let rate = report.suggest_sampling(overhead);
        if rate > 0.0 {
            self.set_default_sampling_rate(rate);
        }
        info!(rate, modulo = modulo_for_rate(rate), "default lock sampling tuned");
        Ok(rate)
    }
}
