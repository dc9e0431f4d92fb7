//! Built-in helper routines
//!
//! A lazily-populated directory: the first call site of a helper
//! registers its name; the bodies are emitted after user code, and their
//! entry offsets land in the function-address map so the ordinary
//! pending-call pass resolves every call site.

use crate::diag::n_error;
use crate::gen::labels::LabelTable;
use crate::gen::Generator;
use crate::prefs::Arch;
use crate::Result;

#[derive(Debug, Default)]
pub struct Builtins {
    /// Registration order; bodies are emitted in this order.
    installed: Vec<String>,
}

impl Builtins {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a builtin by name; repeated registrations are no-ops.
    pub fn register(&mut self, name: &str) {
        if !self.installed.iter().any(|n| n == name) {
            self.installed.push(name.to_string());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.installed.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.installed
    }
}

/// The per-ISA register carrying builtin argument `index`.
pub fn arg_reg_name(arch: Arch, name: &str, index: usize) -> Result<&'static str> {
    let regs: &[&str] = match arch {
        Arch::Amd64 => &["rdi", "rsi", "rdx"],
        Arch::Arm64 => &["x0", "x1", "x2"],
    };
    regs.get(index)
        .copied()
        .ok_or_else(|| n_error(format!("builtin {name} has no argument {index}")))
}

/// Emit the body of every installed builtin and record its entry
/// address. Bodies may register further builtins; the loop drains until
/// the directory stops growing.
pub fn generate_all(g: &mut Generator) -> Result<()> {
    let mut emitted = 0;
    while emitted < g.builtins.installed.len() {
        let name = g.builtins.installed[emitted].clone();
        emitted += 1;
        let addr = g.buf.pos();
        if g.fn_addr.insert(name.clone(), addr).is_some() {
            return Err(n_error(format!("builtin {name} collides with a function")));
        }
        // Builtins use the same label machinery as functions.
        g.labels = LabelTable::new();
        match g.arch {
            Arch::Amd64 => crate::amd64::codegen::emit_builtin(g, &name)?,
            Arch::Arm64 => crate::arm64::codegen::emit_builtin(g, &name)?,
        }
        let mut labels = std::mem::take(&mut g.labels);
        labels.patch_all(&mut g.buf)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_is_idempotent() {
        let mut b = Builtins::new();
        b.register("int_to_string");
        b.register("bool_to_string");
        b.register("int_to_string");
        assert_eq!(b.names(), ["int_to_string", "bool_to_string"]);
    }

    #[test]
    fn test_arg_reg_lookup() {
        assert_eq!(arg_reg_name(Arch::Amd64, "int_to_string", 0).unwrap(), "rdi");
        assert_eq!(arg_reg_name(Arch::Arm64, "int_to_string", 1).unwrap(), "x1");
        assert!(arg_reg_name(Arch::Amd64, "int_to_string", 9).is_err());
    }
}
