//! # opal-native
//!
//! Native compilation backend for the Opal bytecode VM.
//!
//! Takes a compiled bytecode function (as produced by the front-end
//! compiler), lowers it to an architecture-neutral IR, allocates registers
//! with a linear scan, and emits x86-64 or ARM64 machine code into either a
//! relocatable ELF object or a minimal standalone Linux executable.
//!
//! ## Pipeline
//!
//! ```text
//! bytecode -> ir::Builder -> ir::Module -> {x64 | arm64} codegen -> elf writer
//! ```

pub mod arm64;
pub mod bytecode;
pub mod driver;
pub mod elf;
pub mod ir;
pub mod object;
pub mod x64;

use thiserror::Error;

/// Backend error types
#[derive(Error, Debug)]
pub enum OpalError {
    #[error("Encoding error: {message}")]
    Encoding { message: String },

    #[error("Codegen error: {message}")]
    Codegen { message: String },

    #[error("Object write error: {message}")]
    Object { message: String },

    #[error("Unsupported target: {value}")]
    UnsupportedTarget { value: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for backend operations
pub type Result<T> = std::result::Result<T, OpalError>;
