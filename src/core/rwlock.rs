//! The instrumented reader-writer lock.
//!
//! Every acquisition flows through order checking, deadlock tracking and
//! wait timing before reaching the backend; every release runs the same
//! hooks in reverse. All hooks are off unless switched on per instance or
//! through the lock's [`Diagnostics`] service.
//!
//! Writers are non-blocking by default: `lock_write` retries a timed
//! attempt (5 s) and pauses (500 ms) between attempts instead of parking on
//! the backend indefinitely.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::builders::RwLockBuilder;
use crate::config::{BackendKind, LockConfig};
use crate::core::backend::LockBackend;
use crate::core::deadlock::{AccessMode, DeadlockTracker};
use crate::core::diagnostics::Diagnostics;
use crate::core::error::LockError;
use crate::core::guard::{CallSite, ReadGuard, WriteGuard};
use crate::core::order::{Participation, RuleMember};
use crate::core::timing::{LatencyRecorder, LockedTimeWindow, Sampler, TimingStats};
use crate::util::{capture_stacktrace, duration_ns};

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a lock, used by the rule registry and the lock-state table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockId(u64);

impl LockId {
    pub(crate) fn next() -> Self {
        Self(NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock#{}", self.0)
    }
}

#[derive(Clone, Copy)]
struct Entry {
    ordered: bool,
    tracked: bool,
}

struct Timer {
    started: Option<Instant>,
    instance: bool,
    global: bool,
}

/// Reader-writer lock with deadlock, order and latency diagnostics.
///
/// The lock protects no data of its own; callers pair it with the state it
/// guards and use [`ReadGuard`]/[`WriteGuard`] or the explicit
/// lock/unlock methods.
pub struct RwLock {
    id: LockId,
    name: String,
    named: bool,
    backend: LockBackend,
    blocking: AtomicBool,
    write_timeout_ns: AtomicU64,
    retry_pause_ns: AtomicU64,
    hold_warning_ns: AtomicU64,
    hold_stack_tracing: AtomicBool,
    deadlock_check: AtomicBool,
    order_check: AtomicBool,
    timing: AtomicBool,
    tracker: DeadlockTracker,
    participation: Arc<Participation>,
    latency: LatencyRecorder,
    sampler: Sampler,
    write_retries: AtomicU64,
    long_holds: AtomicU64,
    locked_window: LockedTimeWindow,
    diagnostics: Arc<Diagnostics>,
}

impl RwLock {
    /// Unnamed lock using the process defaults.
    pub fn new() -> Self {
        Self::from_parts(None, LockConfig::process_default(), Arc::clone(Diagnostics::global()))
    }

    /// Named lock using the process defaults.
    pub fn named(name: impl Into<String>) -> Self {
        Self::from_parts(
            Some(name.into()),
            LockConfig::process_default(),
            Arc::clone(Diagnostics::global()),
        )
    }

    /// Builder for a lock with explicit configuration.
    pub fn builder() -> RwLockBuilder {
        RwLockBuilder::new()
    }

    pub(crate) fn from_parts(
        name: Option<String>,
        config: &LockConfig,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        let id = LockId::next();
        let named = name.is_some();
        let sampler = Sampler::new(diagnostics.default_sampling_modulo());
        if let Some(rate) = config.sampling_rate {
            sampler.configure(true, Some(rate), diagnostics.default_sampling_modulo());
        }
        Self {
            id,
            name: name.unwrap_or_else(|| id.to_string()),
            named,
            backend: LockBackend::new(config.backend, config.prefer_read),
            blocking: AtomicBool::new(config.blocking),
            write_timeout_ns: AtomicU64::new(duration_ns(config.write_timeout())),
            retry_pause_ns: AtomicU64::new(duration_ns(config.write_retry_pause())),
            hold_warning_ns: AtomicU64::new(duration_ns(config.hold_warning())),
            hold_stack_tracing: AtomicBool::new(config.hold_stack_tracing),
            deadlock_check: AtomicBool::new(config.deadlock_check),
            order_check: AtomicBool::new(config.order_check),
            timing: AtomicBool::new(config.timing),
            tracker: DeadlockTracker::new(),
            participation: Arc::new(Participation::new()),
            latency: LatencyRecorder::new(),
            sampler,
            write_retries: AtomicU64::new(0),
            long_holds: AtomicU64::new(0),
            locked_window: LockedTimeWindow::new(),
            diagnostics,
        }
    }

    // ---- hooks ---------------------------------------------------------

    fn order_active(&self) -> bool {
        self.diagnostics.order_check_enabled() && self.order_check.load(Ordering::Relaxed)
    }

    fn deadlock_active(&self) -> bool {
        self.deadlock_check.load(Ordering::Relaxed) || self.diagnostics.deadlock_check_enabled()
    }

    fn enter(&self, mode: AccessMode) -> Result<Entry, LockError> {
        let ordered = self.order_active();
        if ordered {
            self.diagnostics.order().check_lock(&self.name, &self.participation);
        }
        let tracked = self.deadlock_active();
        if !tracked {
            self.tracker.enter_untracked(mode);
        } else if let Err(err) = self.tracker.enter(&self.name, mode, self.backend.prefer_read()) {
            if ordered {
                self.diagnostics.order().check_unlock(&self.participation);
            }
            return Err(err);
        }
        Ok(Entry { ordered, tracked })
    }

    fn abandon(&self, mode: AccessMode, entry: Entry) {
        if entry.tracked {
            self.tracker.abandon(mode);
        } else {
            self.tracker.exit_untracked(mode);
        }
        if entry.ordered {
            self.diagnostics.order().check_unlock(&self.participation);
        }
    }

    /// Undo the acquisition hooks for a release of `mode`.
    ///
    /// An unlock the tracker cannot account for is returned as an error and,
    /// unless `force` is set, leaves the order bookkeeping untouched.
    fn leave(&self, mode: AccessMode, force: bool) -> Result<(), LockError> {
        let result = if self.deadlock_active() || self.tracker.is_active() {
            self.tracker.exit(&self.name, mode)
        } else {
            self.tracker.exit_untracked(mode);
            Ok(())
        };
        if (result.is_ok() || force) && self.diagnostics.order_check_enabled() {
            self.diagnostics.order().check_unlock(&self.participation);
        }
        result
    }

    /// Release `mode`. Without `force` a usage error leaves the backend
    /// alone; with it the backend is released regardless and the error is
    /// still returned.
    fn unlock(&self, mode: AccessMode, force: bool) -> Result<(), LockError> {
        let result = self.leave(mode, force);
        if result.is_err() && !force {
            return result;
        }
        let released = match mode {
            AccessMode::Read => self.backend.unlock_read(),
            AccessMode::Write => self.backend.unlock_write(),
        };
        if let Err(err) = released {
            self.diagnostics.fatal(&self.name, &err);
        }
        self.settle_tracker();
        result
    }

    fn settle_tracker(&self) {
        if !self.deadlock_active() && self.tracker.is_active() {
            self.tracker.clear();
        }
    }

    fn start_timer(&self) -> Timer {
        let instance = self.timing.load(Ordering::Relaxed);
        let global = self.diagnostics.timing_enabled();
        let sampled = if instance {
            self.sampler.should_sample()
        } else if global {
            self.diagnostics.sampler().should_sample()
        } else {
            false
        };
        Timer {
            started: sampled.then(Instant::now),
            instance,
            global,
        }
    }

    fn stop_timer(&self, mode: AccessMode, timer: &Timer) {
        self.latency.count_lock(mode);
        if timer.global {
            self.diagnostics.latency().count_lock(mode);
        }
        if let Some(started) = timer.started {
            let waited = started.elapsed();
            if timer.instance {
                self.latency.record(mode, waited);
            }
            if timer.global {
                self.diagnostics.latency().record(mode, waited);
            }
        }
    }

    // ---- locking -------------------------------------------------------

    /// Block until read access is granted.
    pub fn lock_read(&self) -> Result<(), LockError> {
        self.enter(AccessMode::Read)?;
        let timer = self.start_timer();
        self.backend.lock_read();
        self.stop_timer(AccessMode::Read, &timer);
        Ok(())
    }

    /// Try to get read access within `timeout`. `Ok(false)` on timeout.
    pub fn try_lock_read(&self, timeout: Duration) -> Result<bool, LockError> {
        let entry = self.enter(AccessMode::Read)?;
        let timer = self.start_timer();
        if self.backend.try_lock_read_for(timeout) {
            self.stop_timer(AccessMode::Read, &timer);
            Ok(true)
        } else {
            self.abandon(AccessMode::Read, entry);
            Ok(false)
        }
    }

    /// Release read access.
    pub fn unlock_read(&self) -> Result<(), LockError> {
        self.unlock(AccessMode::Read, false)
    }

    /// Acquire write access.
    ///
    /// Blocking locks park on the backend. Non-blocking locks retry a timed
    /// attempt, pausing between attempts, until one succeeds.
    pub fn lock_write(&self) -> Result<(), LockError> {
        self.enter(AccessMode::Write)?;
        let timer = self.start_timer();
        if self.is_blocking() {
            self.backend.lock_write();
        } else {
            self.lock_write_retrying();
        }
        self.stop_timer(AccessMode::Write, &timer);
        Ok(())
    }

    fn lock_write_retrying(&self) {
        let mut attempts: u64 = 0;
        loop {
            if self.backend.try_lock_write_for(self.write_timeout()) {
                return;
            }
            attempts += 1;
            self.write_retries.fetch_add(1, Ordering::Relaxed);
            debug!(lock = %self.name, attempts, "write lock attempt timed out, retrying");
            thread::sleep(self.write_retry_pause());
        }
    }

    /// Try to get write access within `timeout`. `Ok(false)` on timeout.
    pub fn try_lock_write(&self, timeout: Duration) -> Result<bool, LockError> {
        let entry = self.enter(AccessMode::Write)?;
        let timer = self.start_timer();
        if self.backend.try_lock_write_for(timeout) {
            self.stop_timer(AccessMode::Write, &timer);
            Ok(true)
        } else {
            self.abandon(AccessMode::Write, entry);
            Ok(false)
        }
    }

    /// Release write access.
    pub fn unlock_write(&self) -> Result<(), LockError> {
        self.unlock(AccessMode::Write, false)
    }

    /// Acquire read access behind a guard that releases on drop.
    #[track_caller]
    pub fn read(&self) -> Result<ReadGuard<'_>, LockError> {
        ReadGuard::with_call_site(self, CallSite::caller())
    }

    /// Acquire write access behind a guard that releases on drop.
    #[track_caller]
    pub fn write(&self) -> Result<WriteGuard<'_>, LockError> {
        WriteGuard::with_call_site(self, CallSite::caller())
    }

    // ---- guard support -------------------------------------------------

    /// Release a hold a guard owns. The backend is always released; a
    /// bookkeeping error is still reported to the caller.
    pub(crate) fn release_held(&self, mode: AccessMode) -> Result<(), LockError> {
        self.unlock(mode, true)
    }

    pub(crate) fn check_hold(&self, mode: AccessMode, site: &CallSite, held: Duration) {
        let threshold = self.hold_warning();
        if held <= threshold {
            return;
        }
        self.long_holds.fetch_add(1, Ordering::Relaxed);
        let held_ms = held.as_millis();
        let mode = match mode {
            AccessMode::Read => "read",
            AccessMode::Write => "write",
        };
        if self.hold_stack_tracing() {
            warn!(
                lock = %self.name,
                held_ms,
                call_site = %site,
                "{mode} lock held for {held_ms} milliseconds\n{}",
                capture_stacktrace()
            );
        } else {
            warn!(
                lock = %self.name,
                held_ms,
                call_site = %site,
                "{mode} lock held for {held_ms} milliseconds"
            );
        }
    }

    pub(crate) fn note_write_hold(&self, acquired: SystemTime, released: SystemTime) {
        self.locked_window.add_interval(acquired, released);
    }

    pub(crate) fn rule_member(&self) -> RuleMember<'_> {
        RuleMember {
            id: self.id,
            name: &self.name,
            participation: &self.participation,
        }
    }

    // ---- accessors -----------------------------------------------------

    /// Identity of this lock.
    pub const fn id(&self) -> LockId {
        self.id
    }

    /// Diagnostic name; `lock#<id>` when none was given.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether an explicit name was given.
    pub const fn is_named(&self) -> bool {
        self.named
    }

    /// Diagnostics service this lock reports to.
    pub const fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }

    /// Backend kind.
    pub const fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Whether readers may overtake waiting writers.
    pub const fn prefer_read(&self) -> bool {
        self.backend.prefer_read()
    }

    /// Read acquisitions so far.
    pub fn read_count(&self) -> u64 {
        self.backend.read_count()
    }

    /// Write acquisitions so far.
    pub fn write_count(&self) -> u64 {
        self.backend.write_count()
    }

    /// Whether writers block indefinitely.
    pub fn is_blocking(&self) -> bool {
        self.blocking.load(Ordering::Relaxed)
    }

    /// Make writers block indefinitely (`true`) or retry with a timeout.
    pub fn set_blocking(&self, blocking: bool) {
        self.blocking.store(blocking, Ordering::Relaxed);
    }

    /// Timeout of one write attempt for non-blocking writers.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_nanos(self.write_timeout_ns.load(Ordering::Relaxed))
    }

    /// Set the timeout of one write attempt.
    pub fn set_write_timeout(&self, timeout: Duration) {
        self.write_timeout_ns.store(duration_ns(timeout), Ordering::Relaxed);
    }

    /// Pause between write attempts.
    pub fn write_retry_pause(&self) -> Duration {
        Duration::from_nanos(self.retry_pause_ns.load(Ordering::Relaxed))
    }

    /// Set the pause between write attempts.
    pub fn set_write_retry_pause(&self, pause: Duration) {
        self.retry_pause_ns.store(duration_ns(pause), Ordering::Relaxed);
    }

    /// Timed-out write attempts so far.
    pub fn write_retries(&self) -> u64 {
        self.write_retries.load(Ordering::Relaxed)
    }

    /// Hold time above which guards log a warning.
    pub fn hold_warning(&self) -> Duration {
        Duration::from_nanos(self.hold_warning_ns.load(Ordering::Relaxed))
    }

    /// Set the hold-time warning threshold.
    pub fn set_hold_warning(&self, threshold: Duration) {
        self.hold_warning_ns.store(duration_ns(threshold), Ordering::Relaxed);
    }

    /// Whether hold-time warnings carry a stack trace.
    pub fn hold_stack_tracing(&self) -> bool {
        self.hold_stack_tracing.load(Ordering::Relaxed)
    }

    /// Attach stack traces to hold-time warnings.
    pub fn set_hold_stack_tracing(&self, on: bool) {
        self.hold_stack_tracing.store(on, Ordering::Relaxed);
    }

    /// Hold-time warnings emitted so far.
    pub fn long_holds(&self) -> u64 {
        self.long_holds.load(Ordering::Relaxed)
    }

    /// Milliseconds this lock was write-held (through guards) two seconds ago.
    pub fn write_locked_ms_penultimate_second(&self) -> u64 {
        self.locked_window.penultimate_second()
    }

    /// Instance deadlock checking switch.
    pub fn deadlock_check(&self) -> bool {
        self.deadlock_check.load(Ordering::Relaxed)
    }

    /// Turn instance deadlock checking on or off; switching off clears the tracker.
    pub fn set_deadlock_check(&self, on: bool) {
        let was = self.deadlock_check.swap(on, Ordering::Relaxed);
        if was && !on {
            self.tracker.clear();
        }
    }

    /// Instance order checking switch.
    pub fn order_check(&self) -> bool {
        self.order_check.load(Ordering::Relaxed)
    }

    /// Turn instance order checking on or off.
    pub fn set_order_check(&self, on: bool) {
        self.order_check.store(on, Ordering::Relaxed);
    }

    /// Instance timing switch.
    pub fn timing(&self) -> bool {
        self.timing.load(Ordering::Relaxed)
    }

    /// Turn instance timing on or off.
    pub fn set_timing(&self, on: bool) {
        self.timing.store(on, Ordering::Relaxed);
    }

    /// Sample 1 in `round(1 / rate)` acquisitions; `None` uses the default modulo.
    pub fn set_sampling(&self, on: bool, rate: Option<f64>) {
        self.sampler
            .configure(on, rate, self.diagnostics.default_sampling_modulo());
    }

    /// Effective sampling rate, `None` when every acquisition is timed.
    pub fn sampling(&self) -> Option<f64> {
        self.sampler.rate()
    }

    /// Instance wait statistics.
    pub fn timing_statistics(&self, compensate: bool) -> TimingStats {
        let compensation = if compensate {
            self.diagnostics.timing_compensation()
        } else {
            0
        };
        self.latency.stats(compensation)
    }

    /// Zero the instance wait statistics.
    pub fn reset_timing_statistics(&self) {
        self.latency.reset();
    }

    /// `(rule slot, rank)` pairs this lock participates in.
    pub fn rule_ranks(&self) -> Vec<(usize, u32)> {
        self.participation.entries()
    }
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RwLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwLock")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("backend", &self.backend)
            .field("blocking", &self.is_blocking())
            .finish_non_exhaustive()
    }
}

impl Drop for RwLock {
    fn drop(&mut self) {
        if !self.participation.is_empty() {
            self.diagnostics.order().forget_lock(self.id);
        }
    }
}
