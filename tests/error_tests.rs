//! Tests for error types.
//!
//! Validates display formatting, wrapping, and the classification helpers
//! callers use to decide between retry and abandon.

use std::error::Error as _;
use std::time::Duration;
use wasmhive::Error;

// =============================================================================
// Lookup Error Tests
// =============================================================================

#[test]
fn test_container_not_found_display() {
    let err = Error::ContainerNotFound("counter-1-abcd1234".to_string());
    let msg = format!("{}", err);

    assert!(msg.contains("counter-1-abcd1234"), "should include container ID");
    assert!(msg.contains("not found"), "should indicate not found");
    assert!(err.is_not_found());
}

#[test]
fn test_function_not_found_display() {
    let err = Error::FunctionNotFound {
        container: "c1".to_string(),
        function: "missing".to_string(),
    };
    let msg = err.to_string();

    assert!(msg.contains("missing"));
    assert!(msg.contains("c1"));
    assert!(err.is_not_found());
}

// =============================================================================
// Resource Governance Error Tests
// =============================================================================

#[test]
fn test_capacity_exceeded_mentions_limit() {
    let err = Error::CapacityExceeded { limit: 2 };
    assert!(err.to_string().contains('2'), "should mention the limit");
}

#[test]
fn test_memory_limit_display() {
    let err = Error::MemoryLimitExceeded {
        container: "c1".to_string(),
        used: 65536,
        limit: 1024,
    };
    let msg = err.to_string();

    assert!(msg.contains("65536"), "should include used bytes");
    assert!(msg.contains("1024"), "should include limit");
    assert!(err.is_memory());
    assert!(!err.is_timeout());
}

#[test]
fn test_timeout_display() {
    let err = Error::Timeout {
        operation: "call 'spin'".to_string(),
        limit: Duration::from_millis(50),
    };
    let msg = err.to_string();

    assert!(msg.contains("spin"));
    assert!(msg.contains("50ms"));
    assert!(err.is_timeout());
}

#[test]
fn test_security_violation_display() {
    let err = Error::SecurityViolation {
        container: "c1".to_string(),
        detail: "network access denied for 'net_fetch'".to_string(),
    };

    assert!(err.to_string().contains("net_fetch"));
    assert!(err.is_security());
}

// =============================================================================
// Wrapping Tests
// =============================================================================

#[test]
fn test_startup_failed_carries_cause() {
    let cause = Error::RegistryDownloadFailed {
        name: "counter".to_string(),
        reason: "registry returned 404 Not Found".to_string(),
    };
    let err = Error::StartupFailed {
        name: "counter".to_string(),
        source: Box::new(cause),
    };

    let msg = err.to_string();
    assert!(msg.contains("failed to start container 'counter'"));
    assert!(msg.contains("404"), "should include the original cause");

    let source = err.source().expect("should expose source");
    assert!(source.to_string().contains("download"));
}

#[test]
fn test_classification_sees_through_wrappers() {
    let err = Error::RestartFailed {
        id: "c1".to_string(),
        source: Box::new(Error::StartupFailed {
            name: "c1".to_string(),
            source: Box::new(Error::Timeout {
                operation: "fuel".to_string(),
                limit: Duration::from_secs(1),
            }),
        }),
    };

    assert!(err.is_timeout());
    assert!(matches!(err.root(), Error::Timeout { .. }));
}

#[test]
fn test_unwrapped_root_is_self() {
    let err = Error::NoRuntimeAvailable;
    assert!(matches!(err.root(), Error::NoRuntimeAvailable));
}

// =============================================================================
// Conversion Tests
// =============================================================================

#[test]
fn test_io_error_conversion() {
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
    let err: Error = io.into();
    assert!(matches!(err, Error::Io(_)));
}

#[test]
fn test_json_error_conversion() {
    let parse = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    let err: Error = parse.into();
    assert!(matches!(err, Error::Serialization(_)));
}

#[test]
fn test_unsupported_backend_display() {
    let err = Error::UnsupportedBackend("jvm".to_string());
    assert_eq!(err.to_string(), "unsupported backend: jvm");
}
