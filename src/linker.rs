//! System linker invocation
//!
//! When the emitted image is a relocatable object (external symbols on
//! Linux), the system linker turns it into the final executable. The C
//! compiler drivers are tried in order so the C runtime and libc come
//! along for the referenced symbols.

use std::path::Path;
use std::process::Command;

use crate::{GenError, Result};

/// Linker candidates, tried in order.
const CANDIDATES: [&str; 3] = ["cc", "gcc", "clang"];

/// Link `object_path` into `output_path`.
pub fn link(object_path: &Path, output_path: &Path) -> Result<()> {
    let obj = object_path.to_string_lossy();
    let out = output_path.to_string_lossy();

    let mut failures = Vec::new();
    for cmd in CANDIDATES {
        log::debug!("linking: {cmd} {obj} -o {out}");
        match Command::new(cmd).arg(obj.as_ref()).arg("-o").arg(out.as_ref()).output() {
            Ok(output) if output.status.success() => return Ok(()),
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                failures.push(format!("[{cmd}] {stderr}"));
            }
            Err(err) => failures.push(format!("[{cmd}] {err}")),
        }
    }
    Err(GenError::Link {
        message: if failures.is_empty() {
            "no linker candidate available".to_string()
        } else {
            failures.join("; ")
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_object_reports_all_candidates() {
        let err = link(
            Path::new("/nonexistent/input.o"),
            Path::new("/nonexistent/output"),
        )
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("link error"), "{message}");
    }
}
