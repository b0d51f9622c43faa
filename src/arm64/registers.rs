//! ARM64 (AArch64) Register Definitions
//!
//! Defines the 64-bit general-purpose registers and encoding for ARM64.
//! Follows the AAPCS64 calling convention for Linux.

/// ARM64 General-Purpose Registers (64-bit X registers)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg64 {
    X0 = 0,
    X1 = 1,
    X2 = 2,
    X3 = 3,
    X4 = 4,
    X5 = 5,
    X6 = 6,
    X7 = 7,
    X8 = 8,
    X9 = 9,
    X10 = 10,
    X11 = 11,
    X12 = 12,
    X13 = 13,
    X14 = 14,
    X15 = 15,
    X16 = 16,
    X17 = 17,
    X18 = 18,
    X19 = 19,
    X20 = 20,
    X21 = 21,
    X22 = 22,
    X23 = 23,
    X24 = 24,
    X25 = 25,
    X26 = 26,
    X27 = 27,
    X28 = 28,
    X29 = 29, // Frame Pointer (FP)
    X30 = 30, // Link Register (LR)
    // Note: X31 is either SP or XZR depending on context
}

impl Reg64 {
    /// Get the register encoding (0-30)
    pub fn encoding(self) -> u8 {
        self as u8
    }

    /// Check if this is a callee-saved register
    pub fn is_callee_saved(self) -> bool {
        matches!(
            self,
            Reg64::X19
                | Reg64::X20
                | Reg64::X21
                | Reg64::X22
                | Reg64::X23
                | Reg64::X24
                | Reg64::X25
                | Reg64::X26
                | Reg64::X27
                | Reg64::X28
                | Reg64::X29
                | Reg64::X30
        )
    }

    /// Check if this is an argument register
    pub fn is_argument(self) -> bool {
        (self as u8) < 8
    }

    /// The register with the next encoding, used as a pair's high half
    pub fn next(self) -> Option<Reg64> {
        if (self as u8) < 30 {
            // Safe because every value 0-30 is a declared variant
            Some(unsafe { std::mem::transmute::<u8, Reg64>(self as u8 + 1) })
        } else {
            None
        }
    }
}

impl std::fmt::Display for Reg64 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "x{}", *self as u8)
    }
}

/// Special register constants
pub mod special {
    /// Stack Pointer register number (when X31 is used as SP)
    pub const SP: u8 = 31;

    /// Zero Register number (when X31 is used as XZR)
    pub const XZR: u8 = 31;

    /// Frame Pointer (alias for X29)
    pub const FP: u8 = 29;

    /// Link Register (alias for X30)
    pub const LR: u8 = 30;
}

/// ARM64 AAPCS64 calling convention
pub mod calling_convention {
    use super::Reg64;

    /// Argument registers (X0-X7)
    pub const ARGUMENT_REGS: [Reg64; 8] = [
        Reg64::X0,
        Reg64::X1,
        Reg64::X2,
        Reg64::X3,
        Reg64::X4,
        Reg64::X5,
        Reg64::X6,
        Reg64::X7,
    ];

    /// Return value register
    pub const RETURN_REG: Reg64 = Reg64::X0;

    /// Callee-saved registers handed to the allocator
    pub const CALLEE_SAVED_POOL: [Reg64; 4] =
        [Reg64::X19, Reg64::X20, Reg64::X21, Reg64::X22];
}

/// Registers handed to the linear-scan allocator.
///
/// X0-X8 are kept free for argument marshaling and returns, X9 and X16 are
/// codegen scratch, X17/X18 stay reserved for the platform. The callee-saved
/// block comes first so long-lived values survive calls. Adjacent entries
/// have consecutive encodings, which lets 16-byte values claim a
/// (low, low+1) register pair.
pub const ALLOCATABLE_REGS: [Reg64; 10] = [
    Reg64::X19,
    Reg64::X20,
    Reg64::X21,
    Reg64::X22,
    Reg64::X10,
    Reg64::X11,
    Reg64::X12,
    Reg64::X13,
    Reg64::X14,
    Reg64::X15,
];

/// Primary scratch register (spill reloads, address arithmetic)
pub const SCRATCH_REG: Reg64 = Reg64::X9;

/// Secondary scratch register (immediate materialization)
pub const SCRATCH_REG2: Reg64 = Reg64::X16;
