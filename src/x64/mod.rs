//! x64 (x86-64) Backend
//!
//! Instruction encoding, linear-scan register allocation, and IR-driven
//! code generation for x86-64 Linux (System V AMD64 ABI).

pub mod codegen;
pub mod encoding;
pub mod regalloc;
pub mod registers;

pub use codegen::X64Codegen;
pub use encoding::CodeBuffer;
pub use regalloc::{compute_live_ranges, Allocation, LiveRange};
pub use registers::Reg64;
