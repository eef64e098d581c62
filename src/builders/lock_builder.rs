//! Builders to construct locks from configuration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};

use crate::config::{BackendKind, LockConfig, LockSetConfig};
use crate::core::{AppResult, Diagnostics, LockError, RwLock};

/// Whole milliseconds, rounded up so a non-zero duration never becomes zero.
fn millis(d: Duration) -> u64 {
    let whole = u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
    if d.subsec_nanos() % 1_000_000 == 0 {
        whole
    } else {
        whole.saturating_add(1)
    }
}

/// Step-by-step construction of an [`RwLock`].
#[derive(Debug, Clone)]
pub struct RwLockBuilder {
    name: Option<String>,
    config: LockConfig,
    diagnostics: Option<Arc<Diagnostics>>,
}

impl Default for RwLockBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RwLockBuilder {
    /// Builder seeded with the process default configuration.
    pub fn new() -> Self {
        Self::from_config(LockConfig::process_default().clone())
    }

    /// Builder seeded with `config`.
    pub const fn from_config(config: LockConfig) -> Self {
        Self {
            name: None,
            config,
            diagnostics: None,
        }
    }

    /// Diagnostic name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Backend implementation.
    #[must_use]
    pub const fn backend(mut self, backend: BackendKind) -> Self {
        self.config.backend = backend;
        self
    }

    /// Reader preference (native backend only).
    #[must_use]
    pub const fn prefer_read(mut self, on: bool) -> Self {
        self.config.prefer_read = on;
        self
    }

    /// Writers block indefinitely instead of retrying.
    #[must_use]
    pub const fn blocking(mut self, on: bool) -> Self {
        self.config.blocking = on;
        self
    }

    /// Timeout of one write attempt for non-blocking writers.
    #[must_use]
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout_ms = millis(timeout);
        self
    }

    /// Pause between write attempts for non-blocking writers.
    #[must_use]
    pub fn write_retry_pause(mut self, pause: Duration) -> Self {
        self.config.write_retry_pause_ms = millis(pause);
        self
    }

    /// Hold-time warning threshold.
    #[must_use]
    pub fn hold_warning(mut self, threshold: Duration) -> Self {
        self.config.hold_warning_ms = millis(threshold);
        self
    }

    /// Attach stack traces to hold-time warnings.
    #[must_use]
    pub const fn hold_stack_tracing(mut self, on: bool) -> Self {
        self.config.hold_stack_tracing = on;
        self
    }

    /// Instance deadlock checking.
    #[must_use]
    pub const fn deadlock_check(mut self, on: bool) -> Self {
        self.config.deadlock_check = on;
        self
    }

    /// Instance order checking.
    #[must_use]
    pub const fn order_check(mut self, on: bool) -> Self {
        self.config.order_check = on;
        self
    }

    /// Instance timing.
    #[must_use]
    pub const fn timing(mut self, on: bool) -> Self {
        self.config.timing = on;
        self
    }

    /// Sampling rate for instance timing, in `(0, 1]`.
    #[must_use]
    pub const fn sampling_rate(mut self, rate: f64) -> Self {
        self.config.sampling_rate = Some(rate);
        self
    }

    /// Diagnostics service; defaults to the process-wide one.
    #[must_use]
    pub fn diagnostics(mut self, diagnostics: Arc<Diagnostics>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    /// Configuration assembled so far.
    pub const fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Validate and build.
    pub fn build(self) -> Result<RwLock, LockError> {
        self.config.validate().map_err(LockError::InvalidConfig)?;
        let diagnostics = self
            .diagnostics
            .unwrap_or_else(|| Arc::clone(Diagnostics::global()));
        Ok(RwLock::from_parts(self.name, &self.config, diagnostics))
    }
}

/// Named locks built from a [`LockSetConfig`].
#[derive(Debug, Default)]
pub struct LockSet {
    locks: HashMap<String, RwLock>,
}

impl LockSet {
    /// The lock called `name`.
    pub fn get(&self, name: &str) -> Option<&RwLock> {
        self.locks.get(name)
    }

    /// Lock names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.locks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of locks.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Build every lock of `cfg` against `diagnostics` and register its rules.
pub fn build_lock_set(cfg: &LockSetConfig, diagnostics: &Arc<Diagnostics>) -> AppResult<LockSet> {
    cfg.validate()
        .map_err(|e| anyhow!("lock set config invalid: {e}"))?;

    let mut locks = HashMap::new();
    for (name, lock_cfg) in &cfg.locks {
        let lock = RwLockBuilder::from_config(lock_cfg.clone())
            .name(name.clone())
            .diagnostics(Arc::clone(diagnostics))
            .build()
            .with_context(|| format!("building lock `{name}`"))?;
        locks.insert(name.clone(), lock);
    }

    let mut rules: Vec<(&String, &Vec<String>)> = cfg.rules.iter().collect();
    rules.sort_by(|a, b| a.0.cmp(b.0));
    for (rule, order) in rules {
        let members: Vec<&RwLock> = order.iter().filter_map(|name| locks.get(name)).collect();
        diagnostics
            .add_order_rule(rule, &members)
            .with_context(|| format!("registering rule `{rule}`"))?;
    }

    Ok(LockSet { locks })
}
