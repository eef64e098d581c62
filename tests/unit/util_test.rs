//! Tests for utility functions

use std::time::{Duration, Instant, UNIX_EPOCH};

use prometheus_rwlock::util::{
    capture_stacktrace, duration_ns, elapsed_ns, epoch_ms, init_tracing, now_ms, thread_label,
};

#[test]
fn test_duration_ns_saturates() {
    assert_eq!(duration_ns(Duration::from_micros(3)), 3_000);
    assert_eq!(duration_ns(Duration::MAX), u64::MAX);
}

#[test]
fn test_epoch_ms() {
    assert_eq!(epoch_ms(UNIX_EPOCH + Duration::from_millis(2_500)), 2_500);
    assert_eq!(epoch_ms(UNIX_EPOCH - Duration::from_secs(1)), 0);
}

#[test]
fn test_clock_moves_forward() {
    let start = Instant::now();
    let before = now_ms();
    std::thread::sleep(Duration::from_millis(2));
    assert!(now_ms() >= before);
    assert!(elapsed_ns(start) >= 2_000_000);
}

#[test]
fn test_unnamed_thread_label() {
    let label = std::thread::Builder::new()
        .spawn(thread_label)
        .unwrap()
        .join()
        .unwrap();
    assert!(label.starts_with("ThreadId("));
}

#[test]
fn test_init_tracing_is_idempotent() {
    init_tracing();
    init_tracing();
    tracing::warn!("tracing initialized twice");
}

#[test]
fn test_stacktrace_captured() {
    assert!(!capture_stacktrace().is_empty());
}
