//! Platform detection and capability enumeration.
//!
//! Detects OS, architecture, and the WebAssembly engines installed on the
//! host to determine which runtime backends can be selected.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Detected platform information.
#[derive(Debug, Clone)]
pub struct Platform {
    /// Operating system.
    pub os: Os,
    /// CPU architecture.
    pub arch: Arch,
    /// Available capabilities.
    pub capabilities: HashSet<Capability>,
}

/// Operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Os {
    Linux,
    Darwin,
    Windows,
    Unknown,
}

/// CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    Amd64,
    Arm64,
    Arm,
    Wasm32,
    Unknown,
}

/// Platform capabilities that affect backend availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Embedded engine available (always true - wasmtime is pure Rust)
    EmbeddedEngine,
    /// Running inside a browser host (crate compiled to wasm)
    BrowserHost,
    /// `wasmtime` CLI installed
    WasmtimeCli,
    /// `wasmer` CLI installed
    WasmerCli,
    /// `wasm3` CLI installed
    Wasm3Cli,
}

impl Platform {
    /// Detects the current platform and its capabilities.
    pub fn detect() -> Self {
        let os = Self::detect_os();
        let arch = Self::detect_arch();
        let capabilities = Self::detect_capabilities();

        Self {
            os,
            arch,
            capabilities,
        }
    }

    /// Detects the operating system.
    fn detect_os() -> Os {
        #[cfg(target_os = "linux")]
        return Os::Linux;

        #[cfg(target_os = "macos")]
        return Os::Darwin;

        #[cfg(target_os = "windows")]
        return Os::Windows;

        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        return Os::Unknown;
    }

    /// Detects the CPU architecture.
    fn detect_arch() -> Arch {
        #[cfg(target_arch = "x86_64")]
        return Arch::Amd64;

        #[cfg(target_arch = "aarch64")]
        return Arch::Arm64;

        #[cfg(target_arch = "arm")]
        return Arch::Arm;

        #[cfg(target_arch = "wasm32")]
        return Arch::Wasm32;

        #[cfg(not(any(
            target_arch = "x86_64",
            target_arch = "aarch64",
            target_arch = "arm",
            target_arch = "wasm32"
        )))]
        return Arch::Unknown;
    }

    /// Detects available capabilities.
    fn detect_capabilities() -> HashSet<Capability> {
        let mut caps = HashSet::new();

        // Embedded engine is always compiled in
        caps.insert(Capability::EmbeddedEngine);

        if cfg!(target_family = "wasm") {
            caps.insert(Capability::BrowserHost);
            return caps;
        }

        for (binary, cap) in [
            ("wasmtime", Capability::WasmtimeCli),
            ("wasmer", Capability::WasmerCli),
            ("wasm3", Capability::Wasm3Cli),
        ] {
            if find_executable(binary).is_some() {
                caps.insert(cap);
            }
        }

        caps
    }

    /// Returns true if the crate runs inside a browser host.
    pub fn is_browser(&self) -> bool {
        self.capabilities.contains(&Capability::BrowserHost)
    }

    /// Returns true if the named engine CLI is installed.
    pub fn has_engine_cli(&self, engine: &str) -> bool {
        let cap = match engine {
            "wasmtime" => Capability::WasmtimeCli,
            "wasmer" => Capability::WasmerCli,
            "wasm3" => Capability::Wasm3Cli,
            _ => return false,
        };
        self.capabilities.contains(&cap)
    }

    /// Returns the platform string (e.g., "linux/amd64").
    pub fn platform_string(&self) -> String {
        let os = match self.os {
            Os::Linux => "linux",
            Os::Darwin => "darwin",
            Os::Windows => "windows",
            Os::Unknown => "unknown",
        };

        let arch = match self.arch {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
            Arch::Arm => "arm",
            Arch::Wasm32 => "wasm32",
            Arch::Unknown => "unknown",
        };

        format!("{}/{}", os, arch)
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}/{:?} (capabilities: {:?})",
            self.os, self.arch, self.capabilities
        )
    }
}

/// Searches `PATH` for an executable named `name`.
pub fn find_executable(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .flat_map(|dir| candidates(&dir, name))
        .find(|candidate| is_executable(candidate))
}

fn candidates(dir: &Path, name: &str) -> Vec<PathBuf> {
    if cfg!(windows) {
        vec![dir.join(format!("{name}.exe")), dir.join(name)]
    } else {
        vec![dir.join(name)]
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_detection() {
        let platform = Platform::detect();

        // Should detect something
        assert!(platform.os != Os::Unknown || platform.arch != Arch::Unknown);

        // Embedded engine should always be available
        assert!(platform.capabilities.contains(&Capability::EmbeddedEngine));
    }

    #[test]
    fn test_platform_string() {
        let platform = Platform::detect();
        assert!(platform.platform_string().contains('/'));
    }

    #[test]
    fn test_unknown_engine_cli() {
        let platform = Platform::detect();
        assert!(!platform.has_engine_cli("not-an-engine"));
    }
}
