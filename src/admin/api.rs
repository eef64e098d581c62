//! Snapshot models for operational debugging.

use std::fmt::Write as _;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::config::BackendKind;
use crate::core::{
    AppResult, Diagnostics, OrderViolation, RuleInfo, RwLock, ThreadLockState, TimingStats,
    WaitStats,
};

/// State of one lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSnapshot {
    /// Diagnostic name.
    pub name: String,
    /// Raw lock identity.
    pub id: u64,
    /// Backend kind.
    pub backend: BackendKind,
    /// Reader preference.
    pub prefer_read: bool,
    /// Writers block indefinitely.
    pub blocking: bool,
    /// Read acquisitions.
    pub read_count: u64,
    /// Write acquisitions.
    pub write_count: u64,
    /// Timed-out write attempts.
    pub write_retries: u64,
    /// Hold-time warnings.
    pub long_holds: u64,
    /// Write-held milliseconds two seconds ago.
    pub write_locked_ms_penultimate_second: u64,
    /// Instance deadlock checking.
    pub deadlock_check: bool,
    /// Instance order checking.
    pub order_check: bool,
    /// Instance timing.
    pub timing: bool,
    /// Effective sampling rate.
    pub sampling: Option<f64>,
    /// `(rule slot, rank)` pairs.
    pub rule_ranks: Vec<(usize, u32)>,
    /// Instance wait statistics, compensated.
    pub stats: TimingStats,
}

/// State of a diagnostics service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsSnapshot {
    /// Process-wide deadlock checking.
    pub deadlock_check: bool,
    /// Process-wide order checking.
    pub order_check: bool,
    /// Process-wide timing.
    pub timing: bool,
    /// Process-wide sampling rate.
    pub sampling: Option<f64>,
    /// Timing compensation in ns.
    pub timing_compensation_ns: u64,
    /// Registered rules.
    pub rules: Vec<RuleInfo>,
    /// Violations detected since creation.
    pub violation_count: u64,
    /// Most recent violations.
    pub recent_violations: Vec<OrderViolation>,
    /// Per-thread lock states.
    pub threads: Vec<ThreadLockState>,
    /// Process-wide wait statistics, compensated.
    pub stats: TimingStats,
}

/// Snapshot of `lock`.
pub fn lock_snapshot(lock: &RwLock) -> LockSnapshot {
    LockSnapshot {
        name: lock.name().to_owned(),
        id: lock.id().get(),
        backend: lock.backend_kind(),
        prefer_read: lock.prefer_read(),
        blocking: lock.is_blocking(),
        read_count: lock.read_count(),
        write_count: lock.write_count(),
        write_retries: lock.write_retries(),
        long_holds: lock.long_holds(),
        write_locked_ms_penultimate_second: lock.write_locked_ms_penultimate_second(),
        deadlock_check: lock.deadlock_check(),
        order_check: lock.order_check(),
        timing: lock.timing(),
        sampling: lock.sampling(),
        rule_ranks: lock.rule_ranks(),
        stats: lock.timing_statistics(true),
    }
}

/// Snapshot of `diagnostics`.
pub fn diagnostics_snapshot(diagnostics: &Diagnostics) -> DiagnosticsSnapshot {
    DiagnosticsSnapshot {
        deadlock_check: diagnostics.deadlock_check_enabled(),
        order_check: diagnostics.order_check_enabled(),
        timing: diagnostics.timing_enabled(),
        sampling: diagnostics.sampling(),
        timing_compensation_ns: diagnostics.timing_compensation(),
        rules: diagnostics.order_rules(),
        violation_count: diagnostics.order_violation_count(),
        recent_violations: diagnostics.order_violations(),
        threads: diagnostics.lock_table(),
        stats: diagnostics.timing_statistics(true),
    }
}

/// Render any snapshot as pretty JSON.
pub fn snapshot_json<T: Serialize>(snapshot: &T) -> AppResult<String> {
    serde_json::to_string_pretty(snapshot).context("serializing lock snapshot")
}

fn push_side(out: &mut String, label: &str, side: &WaitStats) {
    let _ = write!(
        out,
        "{label:<6} locks={} samples={} avg={:.1}ns",
        side.locks, side.samples, side.avg_ns
    );
    match (side.min_ns, side.max_ns) {
        (Some(min), Some(max)) => {
            let _ = writeln!(out, " min={min}ns max={max}ns");
        }
        _ => out.push_str(" min=- max=-\n"),
    }
}

/// Human-readable statistics block.
pub fn format_timing_stats(title: &str, stats: &TimingStats) -> String {
    let mut out = format!("{title}\n");
    push_side(&mut out, "read", &stats.read);
    push_side(&mut out, "write", &stats.write);
    out
}
