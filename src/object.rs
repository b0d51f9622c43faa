//! Compiled Code Model
//!
//! The seam between the architecture code generators and the object
//! writer: a finished byte buffer, the symbols defined in it, and the
//! external relocations still owed to a linker.

use std::fmt;

/// Target machine of a compiled buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Machine {
    X86_64,
    Arm64,
}

impl Machine {
    /// ELF `e_machine` value
    pub fn elf_machine(self) -> u16 {
        match self {
            Machine::X86_64 => 62,  // EM_X86_64
            Machine::Arm64 => 183,  // EM_AARCH64
        }
    }
}

impl fmt::Display for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Machine::X86_64 => write!(f, "x86_64"),
            Machine::Arm64 => write!(f, "arm64"),
        }
    }
}

/// A function symbol defined in the code buffer
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub offset: usize,
    pub size: usize,
}

/// External relocation kinds.
///
/// Jump and call patches are resolved inside the code generators; only
/// references to runtime/library symbols survive to this level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// `R_X86_64_PLT32`: 32-bit PC-relative, PLT-routed
    X64Plt32,
    /// `R_AARCH64_CALL26`: 26-bit word-granularity branch-and-link
    Arm64Call26,
}

impl RelocKind {
    /// ELF relocation type value
    pub fn elf_type(self) -> u32 {
        match self {
            RelocKind::X64Plt32 => 4,
            RelocKind::Arm64Call26 => 283,
        }
    }
}

/// One unresolved reference to an external symbol
#[derive(Debug, Clone)]
pub struct Relocation {
    /// Byte offset of the patch site within the code buffer
    pub offset: usize,
    pub symbol: String,
    pub kind: RelocKind,
    pub addend: i64,
}

/// The output of one code generator run over an IR module
#[derive(Debug)]
pub struct CompiledModule {
    pub machine: Machine,
    pub code: Vec<u8>,
    /// Defined symbols; the entry function comes first
    pub symbols: Vec<Symbol>,
    pub relocations: Vec<Relocation>,
}

impl CompiledModule {
    pub fn find_symbol(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_values() {
        assert_eq!(Machine::X86_64.elf_machine(), 62);
        assert_eq!(Machine::Arm64.elf_machine(), 183);
    }

    #[test]
    fn test_reloc_types() {
        assert_eq!(RelocKind::X64Plt32.elf_type(), 4);
        assert_eq!(RelocKind::Arm64Call26.elf_type(), 283);
    }

    #[test]
    fn test_find_symbol() {
        let module = CompiledModule {
            machine: Machine::X86_64,
            code: vec![0xC3],
            symbols: vec![Symbol {
                name: "main".to_string(),
                offset: 0,
                size: 1,
            }],
            relocations: Vec::new(),
        };
        assert!(module.find_symbol("main").is_some());
        assert!(module.find_symbol("absent").is_none());
    }
}
