//! Administrative surface: serializable snapshots of locks and diagnostics.

pub mod api;

pub use api::{
    diagnostics_snapshot, format_timing_stats, lock_snapshot, snapshot_json, DiagnosticsSnapshot,
    LockSnapshot,
};
