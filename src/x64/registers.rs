//! x64 Register Definitions
//!
//! All 16 general-purpose 64-bit registers with encoding values.
//! Follows the System V AMD64 ABI for Linux.

use std::fmt;

/// x64 64-bit general purpose register
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
    /// Get the 3-bit encoding for ModR/M and SIB bytes
    #[inline]
    pub fn encoding(self) -> u8 {
        (self as u8) & 0x07
    }

    /// Check if this register requires REX.B or REX.R bit
    #[inline]
    pub fn needs_rex_ext(self) -> bool {
        (self as u8) >= 8
    }

    /// Check if this register is callee-saved (System V ABI)
    pub fn is_callee_saved(self) -> bool {
        matches!(
            self,
            Reg64::RBX | Reg64::RBP | Reg64::R12 | Reg64::R13 | Reg64::R14 | Reg64::R15
        )
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
        write!(f, "{}", name)
    }
}

/// System V AMD64 ABI argument registers (in order) - Linux
pub const SYSV_ARG_REGS: [Reg64; 6] = [
    Reg64::RDI,
    Reg64::RSI,
    Reg64::RDX,
    Reg64::RCX,
    Reg64::R8,
    Reg64::R9,
];

/// System V AMD64 ABI return register
pub const SYSV_RET_REG: Reg64 = Reg64::RAX;

/// System V AMD64 ABI callee-saved registers
pub const SYSV_CALLEE_SAVED: [Reg64; 6] = [
    Reg64::RBX,
    Reg64::RBP,
    Reg64::R12,
    Reg64::R13,
    Reg64::R14,
    Reg64::R15,
];

/// Registers handed to the linear-scan allocator.
///
/// RSP/RBP are structural; RAX and R11 are reserved as codegen scratch
/// (spill reloads and constant materialization). Only callee-saved
/// registers are handed out: the prologue saves them unconditionally, so
/// allocated values survive calls into the runtime and sibling functions.
pub const ALLOCATABLE_REGS: [Reg64; 5] = [
    Reg64::RBX,
    Reg64::R12,
    Reg64::R13,
    Reg64::R14,
    Reg64::R15,
];

/// Primary scratch register (spill reloads, immediates)
pub const SCRATCH_REG: Reg64 = Reg64::RAX;

/// Secondary scratch register
pub const SCRATCH_REG2: Reg64 = Reg64::R11;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_encoding() {
        assert_eq!(Reg64::RAX.encoding(), 0);
        assert_eq!(Reg64::RCX.encoding(), 1);
        assert_eq!(Reg64::R8.encoding(), 0);
        assert_eq!(Reg64::R15.encoding(), 7);
    }

    #[test]
    fn test_rex_extension() {
        assert!(!Reg64::RAX.needs_rex_ext());
        assert!(!Reg64::RDI.needs_rex_ext());
        assert!(Reg64::R8.needs_rex_ext());
        assert!(Reg64::R15.needs_rex_ext());
    }

    #[test]
    fn test_callee_saved() {
        assert!(Reg64::RBX.is_callee_saved());
        assert!(Reg64::RBP.is_callee_saved());
        assert!(!Reg64::RAX.is_callee_saved());
        assert!(!Reg64::RDI.is_callee_saved());
    }

    #[test]
    fn test_allocatable_excludes_special() {
        assert!(!ALLOCATABLE_REGS.contains(&Reg64::RSP));
        assert!(!ALLOCATABLE_REGS.contains(&Reg64::RBP));
        assert!(!ALLOCATABLE_REGS.contains(&SCRATCH_REG));
        assert!(!ALLOCATABLE_REGS.contains(&SCRATCH_REG2));
        for reg in SYSV_ARG_REGS {
            assert!(!ALLOCATABLE_REGS.contains(&reg));
        }
    }

    #[test]
    fn test_allocatable_survive_calls() {
        // The pool holds callee-saved registers only, so allocated values
        // are not clobbered by runtime helper calls
        for reg in ALLOCATABLE_REGS {
            assert!(reg.is_callee_saved());
        }
    }
}
