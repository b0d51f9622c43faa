//! Compilation Driver
//!
//! Ties the pipeline together: bytecode in, IR construction, per-target
//! code generation, and ELF serialization out to a file.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use log::{debug, info};

use crate::arm64::Arm64Codegen;
use crate::bytecode;
use crate::elf::{ExecutableBuilder, ObjectBuilder};
use crate::ir::Builder;
use crate::object::{CompiledModule, Machine};
use crate::x64::X64Codegen;
use crate::{OpalError, Result};

/// Compilation target architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetArch {
    X86_64,
    Arm64,
}

impl TargetArch {
    pub fn machine(self) -> Machine {
        match self {
            TargetArch::X86_64 => Machine::X86_64,
            TargetArch::Arm64 => Machine::Arm64,
        }
    }
}

impl FromStr for TargetArch {
    type Err = OpalError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "x86_64" | "x86-64" | "amd64" => Ok(TargetArch::X86_64),
            "arm64" | "aarch64" => Ok(TargetArch::Arm64),
            _ => Err(OpalError::UnsupportedTarget {
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for TargetArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetArch::X86_64 => write!(f, "x86_64"),
            TargetArch::Arm64 => write!(f, "arm64"),
        }
    }
}

/// Compilation target operating system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetOs {
    Linux,
}

impl FromStr for TargetOs {
    type Err = OpalError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "linux" | "gnu-linux" => Ok(TargetOs::Linux),
            _ => Err(OpalError::UnsupportedTarget {
                value: s.to_string(),
            }),
        }
    }
}

/// Output container kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitKind {
    /// Relocatable object for a system linker
    Object,
    /// Standalone executable with a `_start` stub
    Executable,
}

impl FromStr for EmitKind {
    type Err = OpalError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "obj" | "object" => Ok(EmitKind::Object),
            "exe" | "executable" | "bin" => Ok(EmitKind::Executable),
            _ => Err(OpalError::UnsupportedTarget {
                value: s.to_string(),
            }),
        }
    }
}

/// Options for one compilation run
#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub arch: TargetArch,
    pub os: TargetOs,
    pub output: PathBuf,
    pub emit: EmitKind,
    /// Print the constructed IR to stderr before code generation
    pub dump_ir: bool,
    /// Accepted for interface stability; no optimization levels are
    /// currently distinguished
    pub opt_level: u8,
}

impl CompileOptions {
    pub fn new(arch: TargetArch, output: impl Into<PathBuf>) -> Self {
        Self {
            arch,
            os: TargetOs::Linux,
            output: output.into(),
            emit: EmitKind::Object,
            dump_ir: false,
            opt_level: 0,
        }
    }
}

/// Compile one bytecode entry point down to machine code in memory
pub fn compile_to_module(
    entry: &bytecode::Function,
    source_name: &str,
    opts: &CompileOptions,
) -> Result<CompiledModule> {
    let module = Builder::build(entry, source_name);
    debug!(
        "ir module '{}': {} functions",
        module.name,
        module.functions.len()
    );
    if opts.dump_ir {
        eprint!("{}", module);
    }

    match opts.arch {
        TargetArch::X86_64 => X64Codegen::new().compile(&module),
        TargetArch::Arm64 => Arm64Codegen::new().compile(&module),
    }
}

/// Compile one bytecode entry point and write the requested artifact
pub fn compile(entry: &bytecode::Function, source_name: &str, opts: &CompileOptions) -> Result<()> {
    let compiled = compile_to_module(entry, source_name, opts)?;
    debug!(
        "{}: {} bytes of {} code, {} relocations",
        source_name,
        compiled.code.len(),
        compiled.machine,
        compiled.relocations.len()
    );

    match opts.emit {
        EmitKind::Object => ObjectBuilder::new(&compiled).write_to_file(&opts.output)?,
        EmitKind::Executable => ExecutableBuilder::new(&compiled).write_to_file(&opts.output)?,
    }
    info!(
        "wrote {} for {} to {}",
        match opts.emit {
            EmitKind::Object => "object",
            EmitKind::Executable => "executable",
        },
        opts.arch,
        opts.output.display()
    );
    Ok(())
}
