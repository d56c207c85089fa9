use std::fmt;

use serde::{Deserialize, Serialize};

/// Operating system family a factor can be gated on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Os {
    /// Linux and other non-Apple Unix systems.
    Linux,
    /// Microsoft Windows.
    Windows,
    /// Apple macOS.
    Macos,
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linux => write!(f, "linux"),
            Self::Windows => write!(f, "windows"),
            Self::Macos => write!(f, "macos"),
        }
    }
}

/// Platform information for the host running the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    /// Detected operating system family.
    pub os: Os,
    /// Instruction-set architecture (`x86_64`, `aarch64`, ...).
    pub arch: String,
}

impl Platform {
    /// Detect the current platform.
    #[must_use]
    pub fn detect() -> Self {
        Self {
            os: Self::detect_os(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }

    /// Create a platform with explicit values.
    #[must_use]
    pub fn new(os: Os, arch: &str) -> Self {
        Self {
            os,
            arch: arch.to_string(),
        }
    }

    /// Whether this host is a POSIX system.
    #[must_use]
    pub fn is_posix(&self) -> bool {
        self.os != Os::Windows
    }

    /// Whether a step gated on `platforms` applies here.
    ///
    /// `None` means the step is not gated.
    #[must_use]
    pub fn allows(&self, platforms: Option<&[Os]>) -> bool {
        platforms.is_none_or(|list| list.contains(&self.os))
    }

    /// Whether `arch` names the host architecture.
    ///
    /// Accepts the common aliases used by container platforms
    /// (`amd64` for `x86_64`, `arm64` for `aarch64`).
    #[must_use]
    pub fn is_native_arch(&self, arch: &str) -> bool {
        normalize_arch(arch) == normalize_arch(&self.arch)
    }

    fn detect_os() -> Os {
        if cfg!(target_os = "windows") {
            Os::Windows
        } else if cfg!(target_os = "macos") {
            Os::Macos
        } else {
            Os::Linux
        }
    }
}

/// Map container-style architecture names onto Rust target names.
fn normalize_arch(arch: &str) -> &str {
    match arch {
        "amd64" | "x64" => "x86_64",
        "arm64" => "aarch64",
        "i386" | "i686" => "x86",
        other => other,
    }
}
