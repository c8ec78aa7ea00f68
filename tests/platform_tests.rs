//! Tests for platform detection module.
//!
//! Validates platform detection logic, capability enumeration,
//! and engine discovery on `PATH`.

use wasmhive::platform::find_executable;
use wasmhive::{Arch, Capability, Os, Platform};

// =============================================================================
// Platform Detection Tests
// =============================================================================

#[test]
fn test_platform_detect_returns_valid_os() {
    let platform = Platform::detect();

    #[cfg(target_os = "linux")]
    assert_eq!(platform.os, Os::Linux);

    #[cfg(target_os = "macos")]
    assert_eq!(platform.os, Os::Darwin);

    #[cfg(target_os = "windows")]
    assert_eq!(platform.os, Os::Windows);
}

#[test]
fn test_platform_detect_returns_valid_arch() {
    let platform = Platform::detect();

    #[cfg(target_arch = "x86_64")]
    assert_eq!(platform.arch, Arch::Amd64);

    #[cfg(target_arch = "aarch64")]
    assert_eq!(platform.arch, Arch::Arm64);

    #[cfg(target_arch = "arm")]
    assert_eq!(platform.arch, Arch::Arm);
}

#[test]
fn test_platform_string_format() {
    let platform = Platform::detect();
    let s = platform.platform_string();

    let (os, arch) = s.split_once('/').expect("os/arch");
    assert!(!os.is_empty());
    assert!(!arch.is_empty());
}

// =============================================================================
// Capability Tests
// =============================================================================

#[test]
fn test_embedded_engine_always_present() {
    let platform = Platform::detect();
    assert!(platform.capabilities.contains(&Capability::EmbeddedEngine));
}

#[test]
fn test_native_build_is_not_browser() {
    let platform = Platform::detect();
    assert!(!platform.is_browser());
    assert!(!platform.capabilities.contains(&Capability::BrowserHost));
}

#[test]
fn test_engine_cli_matches_capability() {
    let platform = Platform::detect();

    assert_eq!(
        platform.has_engine_cli("wasmer"),
        platform.capabilities.contains(&Capability::WasmerCli)
    );
    assert_eq!(
        platform.has_engine_cli("wasm3"),
        platform.capabilities.contains(&Capability::Wasm3Cli)
    );
    assert!(!platform.has_engine_cli("jvm"));
}

#[test]
fn test_engine_cli_matches_path_lookup() {
    let platform = Platform::detect();
    assert_eq!(
        platform.has_engine_cli("wasm3"),
        find_executable("wasm3").is_some()
    );
}

// =============================================================================
// Executable Lookup Tests
// =============================================================================

#[test]
fn test_find_missing_executable() {
    assert!(find_executable("definitely-not-a-wasmhive-binary").is_none());
}

#[cfg(unix)]
#[test]
fn test_find_existing_executable() {
    let found = find_executable("sh").expect("sh should be on PATH");
    assert!(found.ends_with("sh"));
}

#[test]
fn test_display_mentions_capabilities() {
    let platform = Platform::detect();
    assert!(platform.to_string().contains("EmbeddedEngine"));
}
