//! Diagnostic sink
//!
//! Three kinds of diagnostics leave the generator: warnings (never fatal),
//! user-visible errors located in source, and generator bugs. Generator
//! bugs are constructed as [`GenError::Internal`] and propagated with `?`,
//! which aborts the build with a single message.

use crate::ast::Pos;
use crate::prefs::OutputMode;
use crate::{GenError, Result};

/// A located diagnostic message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub message: String,
    pub pos: Pos,
    pub file: String,
}

impl std::fmt::Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}: {}",
            self.file, self.pos.line, self.pos.col, self.message
        )
    }
}

/// Collects warnings and user errors for one build.
#[derive(Debug, Default)]
pub struct Diag {
    mode: OutputMode,
    file: String,
    pub warnings: Vec<Report>,
    pub errors: Vec<Report>,
}

impl Diag {
    pub fn new(mode: OutputMode, file: &str) -> Self {
        Self {
            mode,
            file: file.to_string(),
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Record a non-fatal warning.
    pub fn warning(&mut self, message: impl Into<String>, pos: Pos) {
        let report = Report {
            message: message.into(),
            pos,
            file: self.file.clone(),
        };
        log::warn!("{report}");
        if self.mode == OutputMode::Stdout {
            eprintln!("warning: {report}");
        }
        self.warnings.push(report);
    }

    /// Record a user-visible error: the AST is well-formed but not
    /// lowerable. In stdout mode this aborts the build immediately;
    /// otherwise the error is collected for the driver and `Ok` returned.
    pub fn error(&mut self, message: impl Into<String>, pos: Pos) -> Result<()> {
        let report = Report {
            message: message.into(),
            pos,
            file: self.file.clone(),
        };
        if self.mode == OutputMode::Stdout {
            eprintln!("error: {report}");
            return Err(GenError::User {
                message: report.message,
                line: pos.line,
                col: pos.col,
            });
        }
        self.errors.push(report);
        Ok(())
    }
}

/// Construct a generator-bug error: the backend met a construct it refuses.
/// Callers `return Err(n_error(...))`, which ends the build.
pub fn n_error(message: impl Into<String>) -> GenError {
    GenError::Internal {
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warning_is_collected_and_never_fatal() {
        let mut diag = Diag::new(OutputMode::Silent, "a.tern");
        diag.warning("deprecated function", Pos { line: 3, col: 1 });
        diag.warning("threading ignored", Pos { line: 9, col: 5 });
        assert_eq!(diag.warnings.len(), 2);
        assert!(diag.errors.is_empty());
    }

    #[test]
    fn test_error_collected_in_silent_mode() {
        let mut diag = Diag::new(OutputMode::Silent, "a.tern");
        diag.error("selector on non-struct", Pos { line: 1, col: 2 })
            .unwrap();
        assert_eq!(diag.errors.len(), 1);
    }

    #[test]
    fn test_error_fatal_in_stdout_mode() {
        let mut diag = Diag::new(OutputMode::Stdout, "a.tern");
        let err = diag.error("too many syscall arguments", Pos { line: 4, col: 8 });
        assert!(err.is_err());
    }

    #[test]
    fn test_n_error_message() {
        let err = n_error("unknown variable: x");
        assert!(err.to_string().contains("unknown variable"));
    }
}
