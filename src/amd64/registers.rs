//! amd64 register definitions
//!
//! All 16 general-purpose 64-bit registers with their ModR/M encodings,
//! the SSE registers used for float traffic, and the System V / Win64
//! argument orders.

use std::fmt;

use crate::gen::{FReg, Reg};

/// amd64 64-bit general purpose register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg64 {
    RAX = 0,
    RCX = 1,
    RDX = 2,
    RBX = 3,
    RSP = 4,
    RBP = 5,
    RSI = 6,
    RDI = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg64 {
    /// 3-bit encoding for ModR/M and SIB bytes.
    #[inline]
    pub fn encoding(self) -> u8 {
        (self as u8) & 0x07
    }

    /// Whether this register needs the REX.B or REX.R extension bit.
    #[inline]
    pub fn needs_rex_ext(self) -> bool {
        (self as u8) >= 8
    }
}

impl fmt::Display for Reg64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Reg64::RAX => "rax",
            Reg64::RCX => "rcx",
            Reg64::RDX => "rdx",
            Reg64::RBX => "rbx",
            Reg64::RSP => "rsp",
            Reg64::RBP => "rbp",
            Reg64::RSI => "rsi",
            Reg64::RDI => "rdi",
            Reg64::R8 => "r8",
            Reg64::R9 => "r9",
            Reg64::R10 => "r10",
            Reg64::R11 => "r11",
            Reg64::R12 => "r12",
            Reg64::R13 => "r13",
            Reg64::R14 => "r14",
            Reg64::R15 => "r15",
        };
        write!(f, "{name}")
    }
}

/// SSE register for float arguments and results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Xmm {
    XMM0 = 0,
    XMM1 = 1,
    XMM2 = 2,
    XMM3 = 3,
    XMM4 = 4,
    XMM5 = 5,
    XMM6 = 6,
    XMM7 = 7,
}

impl Xmm {
    #[inline]
    pub fn encoding(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Xmm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xmm{}", *self as u8)
    }
}

/// System V AMD64 ABI integer argument registers, in order.
pub const SYSV_ARG_REGS: [Reg64; 6] = [
    Reg64::RDI,
    Reg64::RSI,
    Reg64::RDX,
    Reg64::RCX,
    Reg64::R8,
    Reg64::R9,
];

/// System V AMD64 ABI float argument registers, in order.
pub const SYSV_FARG_REGS: [Xmm; 8] = [
    Xmm::XMM0,
    Xmm::XMM1,
    Xmm::XMM2,
    Xmm::XMM3,
    Xmm::XMM4,
    Xmm::XMM5,
    Xmm::XMM6,
    Xmm::XMM7,
];

/// Win64 integer argument registers, in order.
pub const WIN64_ARG_REGS: [Reg64; 4] = [Reg64::RCX, Reg64::RDX, Reg64::R8, Reg64::R9];

/// Registers used for the `C.syscall` special form, number first.
pub const SYSCALL_ARG_REGS: [Reg64; 4] = [Reg64::RAX, Reg64::RDI, Reg64::RSI, Reg64::RDX];

/// Map an architecture-neutral register to its amd64 realisation.
/// `R0` is the primary integer result, `R1` the secondary (pair returns).
pub fn map(reg: Reg) -> Reg64 {
    match reg {
        Reg::R0 => Reg64::RAX,
        Reg::R1 => Reg64::RDX,
        Reg::R2 => Reg64::RCX,
        Reg::R3 => Reg64::R10,
    }
}

/// Map an architecture-neutral float register.
pub fn fmap(reg: FReg) -> Xmm {
    match reg {
        FReg::F0 => Xmm::XMM0,
        FReg::F1 => Xmm::XMM1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_encoding() {
        assert_eq!(Reg64::RAX.encoding(), 0);
        assert_eq!(Reg64::RBP.encoding(), 5);
        assert_eq!(Reg64::R8.encoding(), 0);
        assert_eq!(Reg64::R15.encoding(), 7);
    }

    #[test]
    fn test_rex_extension() {
        assert!(!Reg64::RDI.needs_rex_ext());
        assert!(Reg64::R8.needs_rex_ext());
        assert!(Reg64::R15.needs_rex_ext());
    }

    #[test]
    fn test_neutral_mapping() {
        assert_eq!(map(Reg::R0), Reg64::RAX);
        assert_eq!(map(Reg::R1), Reg64::RDX);
        assert_eq!(fmap(FReg::F0), Xmm::XMM0);
    }
}
