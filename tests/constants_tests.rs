//! Tests for constants module.
//!
//! Validates that governance constants have expected values and that
//! derived limits don't overflow.

use std::time::Duration;
use wasmhive::*;

// =============================================================================
// Capacity and Memory Limit Tests
// =============================================================================

#[test]
fn test_default_max_containers() {
    assert_eq!(DEFAULT_MAX_CONTAINERS, 10);
}

#[test]
fn test_cache_size_fits_module_limit_ratio() {
    // The cache should hold at least a handful of typical modules
    assert!(DEFAULT_CACHE_SIZE >= 64 * 1024 * 1024);
    assert_eq!(DEFAULT_CACHE_SIZE, 100 * 1024 * 1024);
}

#[test]
fn test_page_size() {
    assert_eq!(WASM_PAGE_SIZE, 65536);
}

#[test]
fn test_max_wasm_memory_is_4gib() {
    assert_eq!(MAX_WASM_MEMORY_PAGES * WASM_PAGE_SIZE, 4 * 1024 * 1024 * 1024);
}

#[test]
fn test_default_memory_is_page_aligned() {
    assert_eq!(DEFAULT_MAX_MEMORY % WASM_PAGE_SIZE, 0);
}

#[test]
fn test_module_size_limit() {
    assert_eq!(MAX_WASM_MODULE_SIZE, 256 * 1024 * 1024);
}

#[test]
fn test_thresholds_are_sane() {
    assert!(MEMORY_WARNING_RATIO > 0.0 && MEMORY_WARNING_RATIO < 1.0);
    assert!(CPU_THRESHOLD_PERCENT > 0.0 && CPU_THRESHOLD_PERCENT <= 100.0);
}

// =============================================================================
// Fuel and Timeout Tests
// =============================================================================

#[test]
fn test_default_fuel_matches_default_call_timeout_order() {
    // Default fuel should cover at least the default call timeout
    let per_default_call = DEFAULT_CALL_TIMEOUT.as_millis() as u64 * FUEL_PER_MILLISECOND;
    assert!(DEFAULT_WASM_FUEL <= per_default_call * 10);
    assert!(DEFAULT_WASM_FUEL >= per_default_call / 10);
}

#[test]
fn test_timeouts() {
    assert_eq!(DEFAULT_CALL_TIMEOUT, Duration::from_millis(5000));
    assert_eq!(DEFAULT_NETWORK_TIMEOUT, Duration::from_secs(30));
    assert_eq!(RESTART_GRACE_PERIOD, Duration::from_millis(100));
    assert_eq!(DEFAULT_METRICS_INTERVAL, Duration::from_secs(1));
}

// =============================================================================
// Page Rounding Tests
// =============================================================================

#[test]
fn test_pages_for_bytes_rounds_up() {
    assert_eq!(pages_for_bytes(0), 0);
    assert_eq!(pages_for_bytes(1), 1);
    assert_eq!(pages_for_bytes(1024), 1);
    assert_eq!(pages_for_bytes(WASM_PAGE_SIZE), 1);
    assert_eq!(pages_for_bytes(WASM_PAGE_SIZE + 1), 2);
}

#[test]
fn test_pages_for_bytes_clamps() {
    assert_eq!(pages_for_bytes(u64::MAX), MAX_WASM_MEMORY_PAGES);
}

// =============================================================================
// Name Validation Tests
// =============================================================================

#[test]
fn test_valid_container_names() {
    assert!(validate_container_name("counter").is_ok());
    assert!(validate_container_name("my_module-2").is_ok());
}

#[test]
fn test_invalid_container_names() {
    assert!(validate_container_name("").is_err());
    assert!(validate_container_name("../etc").is_err());
    assert!(validate_container_name("a/b").is_err());
    assert!(validate_container_name("with space").is_err());
    assert!(validate_container_name(&"x".repeat(MAX_CONTAINER_NAME_LEN + 1)).is_err());
}

#[test]
fn test_container_id_length_budget() {
    // name + '-' + 13-digit millis + '-' + 8 hex chars must fit
    assert!(MAX_CONTAINER_NAME_LEN + 1 + 13 + 1 + 8 <= MAX_CONTAINER_ID_LEN);
    assert!(validate_container_id(&"a".repeat(MAX_CONTAINER_ID_LEN)).is_ok());
    assert!(validate_container_id(&"a".repeat(MAX_CONTAINER_ID_LEN + 1)).is_err());
}
