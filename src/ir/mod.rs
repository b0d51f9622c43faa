//! Intermediate Representation
//!
//! A register-based, architecture-neutral form between bytecode and machine
//! code. The builder translates one bytecode function per pass; closures
//! referenced by `Closure` instructions are queued on a worklist so a module
//! carries every function the entry point can reach.
//!
//! ```text
//! bytecode::Function -> Builder -> Module -> {x64 | arm64} codegen
//! ```

pub mod builder;
pub mod types;

pub use builder::Builder;
pub use types::{
    BasicBlock, Const, FuncId, Function, Instruction, Label, Module, Opcode, SizeClass, Value,
    Vreg,
};
