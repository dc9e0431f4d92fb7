//! # tern-native
//!
//! Native code generator for the Tern language: consumes a typechecked
//! AST plus the shared type table and emits a standalone executable
//! directly, with no assembler and no C compiler on the non-linking
//! path.
//!
//! ## Targets
//!
//! | | linux | macos | windows | raw |
//! |---|---|---|---|---|
//! | amd64 | ELF, linkable `.o` | Mach-O | PE32+ | text only |
//! | arm64 | ELF | Mach-O | — | text only |
//!
//! ## Pipeline
//!
//! ```text
//! AST + TypeTable → Generator → machine code + patch lists
//!                 → container header/footer → executable file
//! ```
//!
//! Forward references (calls, labels, string addresses, header size
//! fields) are emitted as placeholders and resolved by the footer
//! passes. When a program references external (`C.`) symbols on Linux,
//! the generator emits a relocatable object instead and drives the
//! system linker over it.

pub mod amd64;
pub mod arm64;
pub mod ast;
pub mod diag;
pub mod elf;
pub mod gen;
pub mod linker;
pub mod macho;
pub mod pe;
pub mod prefs;
pub mod types;

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub use diag::Report;
pub use gen::Generator;
pub use prefs::{Arch, Os, OutputMode, Preferences};
pub use types::{TypeId, TypeKind, TypeTable};

/// Generator error types
#[derive(Error, Debug)]
pub enum GenError {
    /// A construct the backend refuses: a generator bug, fatal.
    #[error("codegen error: {message}")]
    Internal { message: String },

    /// Accepted AST that cannot be lowered; located in source.
    #[error("error: {message} at {line}:{col}")]
    User {
        message: String,
        line: usize,
        col: usize,
    },

    #[error("link error: {message}")]
    Link { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for generator operations
pub type Result<T> = std::result::Result<T, GenError>;

/// Generate the executable image in memory without touching the
/// filesystem. Returns the container bytes (or the relocatable object
/// when the link path is taken).
pub fn generate_image(
    files: &[ast::File],
    table: &mut TypeTable,
    prefs: &Preferences,
) -> Result<Vec<u8>> {
    let mut generator = Generator::new(prefs, table)?;
    generator.run(files)
}

/// Drive the full pipeline and write the output file with mode 0o775
/// (plus an `.exe` suffix on Windows targets). Returns the metrics pair
/// (annotated instruction lines, output bytes).
pub fn generate(
    files: &[ast::File],
    table: &mut TypeTable,
    out_name: &str,
    prefs: &Preferences,
) -> Result<(usize, usize)> {
    let mut generator = Generator::new(prefs, table)?;
    let image = generator.run(files)?;
    let lines = generator.lines;

    if generator.link_object {
        // External symbols: hand the object to the system linker.
        let obj_path = PathBuf::from(format!("{out_name}.o"));
        fs::write(&obj_path, &image)?;
        let out_path = PathBuf::from(out_name);
        linker::link(&obj_path, &out_path)?;
        let _ = fs::remove_file(&obj_path);
        set_exec_permissions(&out_path)?;
        let bytes = fs::metadata(&out_path)?.len() as usize;
        return Ok((lines, bytes));
    }

    let out_path = if prefs.os == Os::Windows && !out_name.ends_with(".exe") {
        PathBuf::from(format!("{out_name}.exe"))
    } else {
        PathBuf::from(out_name)
    };
    fs::write(&out_path, &image)?;
    set_exec_permissions(&out_path)?;
    Ok((lines, image.len()))
}

fn set_exec_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(0o775);
        fs::set_permissions(path, perms)?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ast::{CallExpr, CallLang, Expr, File, FnDecl, Pos, Stmt};

    fn hello_file() -> File {
        File {
            path: "hello.tern".to_string(),
            module: "main".to_string(),
            stmts: vec![Stmt::Fn(FnDecl {
                name: "main".to_string(),
                module: "main".to_string(),
                receiver: None,
                params: vec![],
                ret_type: types::VOID,
                body: vec![Stmt::Expr(Expr::Call(CallExpr {
                    name: "println".to_string(),
                    lang: CallLang::Tern,
                    receiver: None,
                    args: vec![Expr::StrLit {
                        val: "Hello, World!".to_string(),
                        is_raw: false,
                        pos: Pos::new(2, 13),
                    }],
                    ret_type: types::VOID,
                    pos: Pos::new(2, 5),
                }))],
                pos: Pos::new(1, 1),
            })],
        }
    }

    fn prefs_for(arch: Arch, os: Os) -> Preferences {
        let mut prefs = Preferences::new(os);
        prefs.arch = Some(arch);
        prefs
    }

    #[test]
    fn test_hello_world_is_an_elf() {
        let mut table = TypeTable::new();
        let prefs = prefs_for(Arch::Amd64, Os::Linux);
        let image = generate_image(&[hello_file()], &mut table, &prefs).unwrap();
        assert_eq!(&image[0..8], &[0x7F, b'E', b'L', b'F', 2, 1, 1, 0]);
        // The payload and its newline land in the image.
        let needle = b"Hello, World!\n";
        assert!(image.windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn test_hello_world_macho_and_pe() {
        let mut table = TypeTable::new();
        let prefs = prefs_for(Arch::Amd64, Os::Macos);
        let image = generate_image(&[hello_file()], &mut table, &prefs).unwrap();
        assert_eq!(&image[0..4], &[0xCF, 0xFA, 0xED, 0xFE]);

        let mut table = TypeTable::new();
        let prefs = prefs_for(Arch::Amd64, Os::Windows);
        let image = generate_image(&[hello_file()], &mut table, &prefs).unwrap();
        assert_eq!(&image[0..2], b"MZ");
    }

    #[test]
    fn test_hello_world_arm64_raw_mode() {
        let mut table = TypeTable::new();
        let prefs = prefs_for(Arch::Arm64, Os::Raw);
        let image = generate_image(&[hello_file()], &mut table, &prefs).unwrap();
        // Raw mode starts straight at the entry stub: a BL instruction.
        assert_eq!(image[3] & 0xFC, 0x94);
    }

    #[test]
    fn test_missing_main_is_fatal() {
        let mut table = TypeTable::new();
        let prefs = prefs_for(Arch::Amd64, Os::Linux);
        let file = File {
            path: "empty.tern".to_string(),
            module: "main".to_string(),
            stmts: vec![],
        };
        let err = generate_image(&[file], &mut table, &prefs).unwrap_err();
        assert!(err.to_string().contains("main"));
    }

    #[test]
    fn test_windows_arm64_rejected() {
        let mut table = TypeTable::new();
        let prefs = prefs_for(Arch::Arm64, Os::Windows);
        let err = generate_image(&[hello_file()], &mut table, &prefs).unwrap_err();
        assert!(matches!(err, GenError::User { .. }));
    }
}
