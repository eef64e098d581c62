//! Process-wide diagnostics service shared by every lock.
//!
//! Locks hold an `Arc<Diagnostics>`; the process-wide instance is created on
//! first use from [`DiagnosticsConfig::from_env`] unless
//! [`Diagnostics::init_global`] ran first. Tests build private instances so
//! their switches and rules do not leak into each other.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use crate::config::DiagnosticsConfig;
use crate::core::error::RuleError;
use crate::core::fatal::FatalPolicy;
use crate::core::lock_table::{LockOp, LockTable, ThreadLockState};
use crate::core::order::{OrderVerifier, OrderViolation, RuleInfo, RuleMember};
use crate::core::rwlock::{LockId, RwLock};
use crate::core::timing::{modulo_for_rate, LatencyRecorder, Sampler, TimingStats};

static GLOBAL: OnceLock<Arc<Diagnostics>> = OnceLock::new();

/// Switches, rule registry and process-wide statistics.
#[derive(Debug)]
pub struct Diagnostics {
    deadlock_check: AtomicBool,
    timing: AtomicBool,
    lock_table_enabled: AtomicBool,
    order: OrderVerifier,
    latency: LatencyRecorder,
    sampler: Sampler,
    lock_table: LockTable,
    compensation_ns: AtomicU64,
    default_sampling_modulo: AtomicU32,
    fatal: FatalPolicy,
}

impl Diagnostics {
    /// Build a service from `config`.
    pub fn new(config: &DiagnosticsConfig) -> Self {
        let modulo = config.sampling_modulo.max(1);
        Self {
            deadlock_check: AtomicBool::new(config.deadlock_check),
            timing: AtomicBool::new(config.timing),
            lock_table_enabled: AtomicBool::new(config.lock_table),
            order: OrderVerifier::new(
                config.order_check,
                config.quiesce(),
                config.max_violation_records,
            ),
            latency: LatencyRecorder::new(),
            sampler: Sampler::new(modulo),
            lock_table: LockTable::new(),
            compensation_ns: AtomicU64::new(0),
            default_sampling_modulo: AtomicU32::new(modulo),
            fatal: config.fatal,
        }
    }

    /// Shared handle to a new service.
    pub fn shared(config: &DiagnosticsConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    /// The process-wide service.
    pub fn global() -> &'static Arc<Self> {
        GLOBAL.get_or_init(|| Self::shared(&DiagnosticsConfig::from_env()))
    }

    /// Install the process-wide service from `config`.
    ///
    /// Returns `false` if it already exists, in which case `config` is ignored.
    pub fn init_global(config: &DiagnosticsConfig) -> bool {
        let mut installed = false;
        GLOBAL.get_or_init(|| {
            installed = true;
            Self::shared(config)
        });
        installed
    }

    /// Process-wide deadlock checking switch.
    pub fn deadlock_check_enabled(&self) -> bool {
        self.deadlock_check.load(Ordering::Relaxed)
    }

    /// Turn deadlock checking on or off for every lock.
    pub fn set_deadlock_check(&self, on: bool) {
        self.deadlock_check.store(on, Ordering::Relaxed);
    }

    /// Process-wide order checking switch.
    pub fn order_check_enabled(&self) -> bool {
        self.order.is_enabled()
    }

    /// Turn order checking on or off.
    pub fn set_order_check(&self, on: bool) {
        self.order.set_enabled(on);
    }

    /// Process-wide timing switch.
    pub fn timing_enabled(&self) -> bool {
        self.timing.load(Ordering::Relaxed)
    }

    /// Turn process-wide timing on or off.
    pub fn set_timing(&self, on: bool) {
        self.timing.store(on, Ordering::Relaxed);
    }

    /// Configure process-wide sampling, used for locks without their own timing.
    pub fn set_sampling(&self, on: bool, rate: Option<f64>) {
        self.sampler.configure(on, rate, self.default_sampling_modulo());
    }

    /// Effective process-wide sampling rate, `None` when every acquisition is timed.
    pub fn sampling(&self) -> Option<f64> {
        self.sampler.rate()
    }

    /// Modulo used when sampling is switched on without an explicit rate.
    pub fn default_sampling_modulo(&self) -> u32 {
        self.default_sampling_modulo.load(Ordering::Relaxed)
    }

    /// Change the default modulo from a sampling rate in `(0, 1]`.
    pub fn set_default_sampling_rate(&self, rate: f64) {
        self.default_sampling_modulo
            .store(modulo_for_rate(rate).max(1), Ordering::Relaxed);
    }

    /// Whether guards on named locks are recorded in the lock-state table.
    pub fn lock_table_enabled(&self) -> bool {
        self.lock_table_enabled.load(Ordering::Relaxed)
    }

    /// Turn lock-state recording on or off. Switching off clears the table.
    pub fn set_lock_table(&self, on: bool) {
        self.lock_table_enabled.store(on, Ordering::Relaxed);
        if !on {
            self.lock_table.clear();
        }
    }

    pub(crate) fn record_lock_op(&self, id: LockId, lock: &str, op: LockOp) {
        if self.lock_table_enabled() {
            self.lock_table.record(id, lock, op);
        }
    }

    pub(crate) fn record_lock_release(&self, id: LockId) {
        if self.lock_table_enabled() {
            self.lock_table.release(id);
        }
    }

    /// Current per-thread lock states.
    pub fn lock_table(&self) -> Vec<ThreadLockState> {
        self.lock_table.snapshot()
    }

    /// Per-thread lock states as text.
    pub fn lock_table_report(&self) -> String {
        self.lock_table.report()
    }

    /// Register an ordering rule over `locks`, first to last.
    pub fn add_order_rule(&self, name: &str, locks: &[&RwLock]) -> Result<(), RuleError> {
        if let Some(foreign) = locks.iter().find(|lock| !std::ptr::eq(lock.diagnostics().as_ref(), self)) {
            return Err(RuleError::ForeignLock {
                rule: name.to_owned(),
                lock: foreign.name().to_owned(),
            });
        }
        let members: Vec<RuleMember<'_>> = locks.iter().map(|lock| lock.rule_member()).collect();
        self.order.add_rule(name, &members)
    }

    /// Remove an ordering rule. Returns whether it existed.
    pub fn remove_order_rule(&self, name: &str) -> bool {
        self.order.remove_rule(name)
    }

    /// Remove every ordering rule.
    pub fn reset_order_rules(&self) {
        self.order.reset();
    }

    /// The rule called `name`.
    pub fn order_rule(&self, name: &str) -> Option<RuleInfo> {
        self.order.rule(name)
    }

    /// All registered rules.
    pub fn order_rules(&self) -> Vec<RuleInfo> {
        self.order.rules()
    }

    /// Recent order violations, oldest first.
    pub fn order_violations(&self) -> Vec<OrderViolation> {
        self.order.violations()
    }

    /// Order violations detected since creation.
    pub fn order_violation_count(&self) -> u64 {
        self.order.violation_count()
    }

    pub(crate) const fn order(&self) -> &OrderVerifier {
        &self.order
    }

    pub(crate) const fn latency(&self) -> &LatencyRecorder {
        &self.latency
    }

    pub(crate) const fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    /// Timestamp cost subtracted from reported waits, in ns.
    pub fn timing_compensation(&self) -> u64 {
        self.compensation_ns.load(Ordering::Relaxed)
    }

    /// Set the timestamp cost subtracted from reported waits.
    pub fn set_timing_compensation(&self, ns: u64) {
        self.compensation_ns.store(ns, Ordering::Relaxed);
    }

    /// Process-wide wait statistics.
    pub fn timing_statistics(&self, compensate: bool) -> TimingStats {
        let compensation = if compensate { self.timing_compensation() } else { 0 };
        self.latency.stats(compensation)
    }

    /// Zero the process-wide wait statistics.
    pub fn reset_timing_statistics(&self) {
        self.latency.reset();
    }

    /// Fatal policy in effect.
    pub const fn fatal_policy(&self) -> FatalPolicy {
        self.fatal
    }

    /// Report an unrecoverable failure on `lock`.
    #[track_caller]
    pub(crate) fn fatal(&self, lock: &str, detail: &dyn std::fmt::Display) -> ! {
        self.fatal.raise(lock, detail)
    }

    /// Switch everything off and drop rules, statistics and lock states.
    pub fn shutdown(&self) {
        self.order.reset();
        self.order.set_enabled(false);
        self.order.clear_violations();
        self.set_deadlock_check(false);
        self.set_timing(false);
        self.set_lock_table(false);
        self.latency.reset();
    }
}
