//! ARM64 (AArch64) Backend
//!
//! Instruction encoding, linear-scan register allocation with
//! consecutive-pair assignment for 16-byte values, and IR-driven code
//! generation for AArch64 Linux (AAPCS64).

pub mod codegen;
pub mod encoding;
pub mod regalloc;
pub mod registers;

pub use codegen::Arm64Codegen;
pub use regalloc::{compute_live_ranges, Allocation, LiveRange};
pub use registers::Reg64;
