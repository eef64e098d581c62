//! Lock and diagnostics configuration structures.

use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::core::{AppResult, FatalPolicy};

/// Environment variable selecting the backend for locks built from defaults.
pub const BACKEND_ENV: &str = "PROMETHEUS_RWLOCK_BACKEND";
/// Environment variable enabling deadlock checking process-wide.
pub const DEADLOCK_CHECK_ENV: &str = "PROMETHEUS_RWLOCK_DEADLOCK_CHECK";
/// Environment variable enabling order checking process-wide.
pub const ORDER_CHECK_ENV: &str = "PROMETHEUS_RWLOCK_ORDER_CHECK";
/// Environment variable enabling timing process-wide.
pub const TIMING_ENV: &str = "PROMETHEUS_RWLOCK_TIMING";
/// Environment variable enabling the per-thread lock-state table.
pub const LOCK_TABLE_ENV: &str = "PROMETHEUS_RWLOCK_LOCK_TABLE";
/// Environment variable selecting the fatal policy (`abort` or `panic`).
pub const FATAL_ENV: &str = "PROMETHEUS_RWLOCK_FATAL";

/// Lock backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Reader/writer lock with a pthread-style reader-preference policy.
    Native,
    /// Shared/exclusive timed mutex; always writer-preferring.
    #[default]
    Shared,
}

impl BackendKind {
    /// Read the backend from [`BACKEND_ENV`], falling back to the default.
    pub fn from_env() -> Self {
        match env::var(BACKEND_ENV) {
            Ok(raw) => raw.parse().unwrap_or_else(|err| {
                tracing::warn!(value = %raw, error = %err, "ignoring unknown lock backend");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Stable lowercase name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Shared => "shared",
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" | "pthread" => Ok(Self::Native),
            "shared" | "shared_mutex" => Ok(Self::Shared),
            other => Err(format!("unknown backend `{other}`")),
        }
    }
}

/// Per-lock configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Backend implementation.
    pub backend: BackendKind,
    /// Readers may overtake waiting writers and re-enter (native backend only).
    pub prefer_read: bool,
    /// Writers block indefinitely instead of retrying with a timeout.
    pub blocking: bool,
    /// Timeout of a single write attempt for non-blocking writers, in ms.
    pub write_timeout_ms: u64,
    /// Pause between two write attempts for non-blocking writers, in ms.
    pub write_retry_pause_ms: u64,
    /// Hold time after which a guard release logs a warning, in ms.
    pub hold_warning_ms: u64,
    /// Attach a stack trace to hold-time warnings.
    pub hold_stack_tracing: bool,
    /// Instance-level deadlock checking.
    pub deadlock_check: bool,
    /// Instance-level order checking (still requires the process-wide switch).
    pub order_check: bool,
    /// Instance-level timing.
    pub timing: bool,
    /// Sampling rate in `(0, 1]`; `None` times every acquisition.
    pub sampling_rate: Option<f64>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            prefer_read: false,
            blocking: false,
            write_timeout_ms: 5_000,
            write_retry_pause_ms: 500,
            hold_warning_ms: 10_000,
            hold_stack_tracing: false,
            deadlock_check: false,
            order_check: true,
            timing: false,
            sampling_rate: None,
        }
    }
}

impl LockConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.write_timeout_ms == 0 {
            return Err("write_timeout_ms must be greater than 0".into());
        }
        if let Some(rate) = self.sampling_rate {
            if !(rate > 0.0 && rate <= 1.0) {
                return Err(format!("sampling_rate must be in (0, 1], got {rate}"));
            }
        }
        Ok(())
    }

    /// Parse a lock configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults with the backend taken from the environment (and `.env`).
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self {
            backend: BackendKind::from_env(),
            ..Self::default()
        }
    }

    /// Load a `.env` style file into the environment, then read [`LockConfig::from_env`].
    pub fn from_env_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        dotenvy::from_path(path)
            .with_context(|| format!("loading lock environment from {}", path.display()))?;
        Ok(Self::from_env())
    }

    /// Process-wide default, resolved once on first use.
    pub fn process_default() -> &'static Self {
        static DEFAULT: OnceLock<LockConfig> = OnceLock::new();
        DEFAULT.get_or_init(Self::from_env)
    }

    /// Write attempt timeout as a duration.
    pub const fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Pause between write attempts as a duration.
    pub const fn write_retry_pause(&self) -> Duration {
        Duration::from_millis(self.write_retry_pause_ms)
    }

    /// Hold-time warning threshold as a duration.
    pub const fn hold_warning(&self) -> Duration {
        Duration::from_millis(self.hold_warning_ms)
    }
}

/// Process-wide diagnostics configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Deadlock checking for every lock.
    pub deadlock_check: bool,
    /// Order checking switch.
    pub order_check: bool,
    /// Process-wide timing statistics.
    pub timing: bool,
    /// Record guard operations on named locks in the per-thread lock-state table.
    pub lock_table: bool,
    /// Default 1-in-N sampling modulo used when a lock enables sampling without a rate.
    pub sampling_modulo: u32,
    /// Quiesce window applied before mutating the rule registry, in ms.
    pub quiesce_ms: u64,
    /// Number of order violations kept for inspection.
    pub max_violation_records: usize,
    /// What to do on an unrecoverable backend failure.
    pub fatal: FatalPolicy,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            deadlock_check: false,
            order_check: false,
            timing: false,
            lock_table: false,
            sampling_modulo: 300,
            quiesce_ms: 100,
            max_violation_records: 256,
            fatal: FatalPolicy::Abort,
        }
    }
}

impl DiagnosticsConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.sampling_modulo == 0 {
            return Err("sampling_modulo must be greater than 0".into());
        }
        if self.max_violation_records == 0 {
            return Err("max_violation_records must be greater than 0".into());
        }
        Ok(())
    }

    /// Parse a diagnostics configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults overridden by the `PROMETHEUS_RWLOCK_*` environment switches.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut cfg = Self::default();
        if let Some(on) = env_flag(DEADLOCK_CHECK_ENV) {
            cfg.deadlock_check = on;
        }
        if let Some(on) = env_flag(ORDER_CHECK_ENV) {
            cfg.order_check = on;
        }
        if let Some(on) = env_flag(TIMING_ENV) {
            cfg.timing = on;
        }
        if let Some(on) = env_flag(LOCK_TABLE_ENV) {
            cfg.lock_table = on;
        }
        if let Ok(raw) = env::var(FATAL_ENV) {
            match raw.trim().to_ascii_lowercase().as_str() {
                "panic" => cfg.fatal = FatalPolicy::Panic,
                "abort" => cfg.fatal = FatalPolicy::Abort,
                other => tracing::warn!(value = %other, "ignoring unknown fatal policy"),
            }
        }
        cfg
    }

    /// Quiesce window as a duration.
    pub const fn quiesce(&self) -> Duration {
        Duration::from_millis(self.quiesce_ms)
    }
}

/// Declarative set of named locks and the ordering rules between them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockSetConfig {
    /// Map of lock name to configuration.
    pub locks: HashMap<String, LockConfig>,
    /// Map of rule name to the lock names in their only permitted order.
    #[serde(default)]
    pub rules: HashMap<String, Vec<String>>,
}

impl LockSetConfig {
    /// Validate all locks and make sure every rule refers to a declared lock.
    pub fn validate(&self) -> Result<(), String> {
        if self.locks.is_empty() {
            return Err("at least one lock must be defined".into());
        }
        for (name, lock) in &self.locks {
            lock.validate()
                .map_err(|e| format!("lock `{name}` invalid: {e}"))?;
        }
        for (rule, order) in &self.rules {
            if let Some(missing) = order.iter().find(|lock| !self.locks.contains_key(*lock)) {
                return Err(format!("rule `{rule}` references undeclared lock `{missing}`"));
            }
        }
        Ok(())
    }

    /// Parse a lock set from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }
}

fn env_flag(key: &str) -> Option<bool> {
    let raw = env::var(key).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}
