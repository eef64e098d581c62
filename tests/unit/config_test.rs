//! Tests for configuration validation

use prometheus_rwlock::config::{BackendKind, DiagnosticsConfig, LockConfig, LockSetConfig};
use prometheus_rwlock::core::FatalPolicy;

#[test]
fn test_lock_config_defaults() {
    let cfg = LockConfig::default();
    assert_eq!(cfg.backend, BackendKind::Shared);
    assert!(!cfg.blocking);
    assert_eq!(cfg.write_timeout_ms, 5_000);
    assert_eq!(cfg.write_retry_pause_ms, 500);
    assert_eq!(cfg.hold_warning_ms, 10_000);
    assert!(cfg.order_check);
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_lock_config_invalid_timeout() {
    let cfg = LockConfig {
        write_timeout_ms: 0,
        ..LockConfig::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_lock_config_invalid_sampling_rate() {
    for rate in [0.0, -1.0, 1.5, f64::NAN] {
        let cfg = LockConfig {
            sampling_rate: Some(rate),
            ..LockConfig::default()
        };
        assert!(cfg.validate().is_err(), "rate {rate} accepted");
    }
}

#[test]
fn test_lock_config_from_json_fills_defaults() {
    let cfg = LockConfig::from_json_str(r#"{"backend":"native","prefer_read":true}"#).unwrap();
    assert_eq!(cfg.backend, BackendKind::Native);
    assert!(cfg.prefer_read);
    assert_eq!(cfg.write_timeout_ms, 5_000);
}

#[test]
fn test_lock_config_from_json_rejects_garbage() {
    let err = LockConfig::from_json_str("{not json").unwrap_err();
    assert!(err.starts_with("parse error"));
}

#[test]
fn test_diagnostics_config_validation() {
    let cfg = DiagnosticsConfig::from_json_str(r#"{"timing":true,"fatal":"panic"}"#).unwrap();
    assert!(cfg.timing);
    assert_eq!(cfg.fatal, FatalPolicy::Panic);
    assert_eq!(cfg.sampling_modulo, 300);

    let invalid = DiagnosticsConfig {
        sampling_modulo: 0,
        ..DiagnosticsConfig::default()
    };
    assert!(invalid.validate().is_err());
}

#[test]
fn test_lock_set_config_rule_must_reference_declared_locks() {
    let err = LockSetConfig::from_json_str(
        r#"{"locks":{"a":{}},"rules":{"r":["a","missing"]}}"#,
    )
    .unwrap_err();
    assert!(err.contains("missing"));
}

#[test]
fn test_lock_set_config_requires_locks() {
    assert!(LockSetConfig::default().validate().is_err());
}
