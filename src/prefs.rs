//! Build preferences
//!
//! The driver hands the generator a small record of recognised options.
//! `arch: None` means auto-detect from the build host.

use crate::{GenError, Result};

/// Target instruction set architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Amd64,
    Arm64,
}

impl Arch {
    /// Parse from string (case-insensitive).
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "amd64" | "x64" | "x86_64" => Ok(Arch::Amd64),
            "arm64" | "aarch64" => Ok(Arch::Arm64),
            _ => Err(GenError::Internal {
                message: format!("unknown architecture: {s}"),
            }),
        }
    }

    /// Detect the build host architecture.
    pub fn host() -> Result<Self> {
        if cfg!(target_arch = "x86_64") {
            Ok(Arch::Amd64)
        } else if cfg!(target_arch = "aarch64") {
            Ok(Arch::Arm64)
        } else {
            Err(GenError::Internal {
                message: "cannot auto-detect target architecture on this host".to_string(),
            })
        }
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Arch::Amd64 => write!(f, "amd64"),
            Arch::Arm64 => write!(f, "arm64"),
        }
    }
}

/// Target operating system, which selects the executable container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Os {
    /// Linux, ELF64 container.
    Linux,
    /// macOS, Mach-O 64 container.
    Macos,
    /// Windows, PE32+ container.
    Windows,
    /// Headerless text section only.
    Raw,
}

impl Os {
    /// Parse from string (case-insensitive).
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "linux" => Ok(Os::Linux),
            "macos" | "darwin" => Ok(Os::Macos),
            "windows" => Ok(Os::Windows),
            "raw" => Ok(Os::Raw),
            _ => Err(GenError::Internal {
                message: format!("unknown target os: {s}"),
            }),
        }
    }
}

impl std::fmt::Display for Os {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Os::Linux => write!(f, "linux"),
            Os::Macos => write!(f, "macos"),
            Os::Windows => write!(f, "windows"),
            Os::Raw => write!(f, "raw"),
        }
    }
}

/// Where user-visible diagnostics go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Print errors as they happen and abort the build on the first one.
    #[default]
    Stdout,
    /// Collect errors for the driver, keep going where possible.
    Silent,
}

/// Preferences record handed in by the driver.
#[derive(Debug, Clone)]
pub struct Preferences {
    /// Target architecture; `None` auto-detects the host.
    pub arch: Option<Arch>,
    pub os: Os,
    /// Annotate every emitted instruction to stderr.
    pub is_verbose: bool,
    pub output_mode: OutputMode,
    /// Source path, used in diagnostics only.
    pub path: String,
}

impl Preferences {
    pub fn new(os: Os) -> Self {
        Self {
            arch: None,
            os,
            is_verbose: false,
            output_mode: OutputMode::Stdout,
            path: String::new(),
        }
    }

    /// The architecture this build targets, resolving auto-detection.
    pub fn resolved_arch(&self) -> Result<Arch> {
        match self.arch {
            Some(arch) => Ok(arch),
            None => Arch::host(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arch_from_str() {
        assert_eq!(Arch::from_str("amd64").unwrap(), Arch::Amd64);
        assert_eq!(Arch::from_str("AArch64").unwrap(), Arch::Arm64);
        assert!(Arch::from_str("riscv").is_err());
    }

    #[test]
    fn test_os_from_str() {
        assert_eq!(Os::from_str("linux").unwrap(), Os::Linux);
        assert_eq!(Os::from_str("Darwin").unwrap(), Os::Macos);
        assert_eq!(Os::from_str("raw").unwrap(), Os::Raw);
        assert!(Os::from_str("beos").is_err());
    }

    #[test]
    fn test_resolved_arch_explicit() {
        let mut prefs = Preferences::new(Os::Linux);
        prefs.arch = Some(Arch::Arm64);
        assert_eq!(prefs.resolved_arch().unwrap(), Arch::Arm64);
    }
}
