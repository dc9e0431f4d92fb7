//! arm64 (AArch64) native backend
//!
//! Fixed-width 32-bit instruction emission for Linux and macOS targets.
//!
//! ## Modules
//!
//! - `registers`: register definitions (X0-X30, SP)
//! - `encoding`: instruction word encoders
//! - `codegen`: the generator capability set for this ISA

pub mod codegen;
pub mod encoding;
pub mod registers;
