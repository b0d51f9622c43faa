//! ELF64 Object and Executable Generation
//!
//! Serializes a compiled module either as a relocatable object file for a
//! system linker, or as a minimal standalone Linux executable with a
//! process-entry stub. No external linker or assembler required.

use std::io::{self, Write};
use std::path::Path;

use log::debug;

use crate::object::{CompiledModule, Machine};
use crate::{OpalError, Result};

/// ELF64 file constants
pub mod consts {
    // ELF magic number
    pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

    // ELF class
    pub const ELFCLASS64: u8 = 2;

    // Data encoding
    pub const ELFDATA2LSB: u8 = 1; // Little endian

    // ELF version
    pub const EV_CURRENT: u8 = 1;

    // OS/ABI
    pub const ELFOSABI_NONE: u8 = 0; // UNIX System V ABI

    // Object file types
    pub const ET_REL: u16 = 1; // Relocatable file
    pub const ET_EXEC: u16 = 2; // Executable file

    // Program header types
    pub const PT_LOAD: u32 = 1;

    // Program header flags
    pub const PF_X: u32 = 1; // Execute
    pub const PF_W: u32 = 2; // Write
    pub const PF_R: u32 = 4; // Read

    // Section header types
    pub const SHT_PROGBITS: u32 = 1;
    pub const SHT_SYMTAB: u32 = 2;
    pub const SHT_STRTAB: u32 = 3;
    pub const SHT_RELA: u32 = 4;

    // Section header flags
    pub const SHF_ALLOC: u64 = 2;
    pub const SHF_EXECINSTR: u64 = 4;
    pub const SHF_INFO_LINK: u64 = 0x40;

    // Symbol binding/type
    pub const STB_GLOBAL: u8 = 1;
    pub const STT_FUNC: u8 = 2;

    // Entity sizes
    pub const ELF64_EHDR_SIZE: u16 = 64;
    pub const ELF64_PHDR_SIZE: u16 = 56;
    pub const ELF64_SHDR_SIZE: u16 = 64;
    pub const ELF64_SYM_SIZE: u64 = 24;
    pub const ELF64_RELA_SIZE: u64 = 24;

    // Default load address for Linux
    pub const DEFAULT_LOAD_ADDR: u64 = 0x400000;

    // Loadable segment alignment
    pub const PAGE_ALIGN: u64 = 0x1000;
}

fn align8(value: u64) -> u64 {
    (value + 7) & !7
}

/// ELF64 file header
#[derive(Debug, Clone)]
pub struct Elf64Header {
    pub e_type: u16,      // Object file type
    pub e_machine: u16,   // Machine type
    pub e_version: u32,   // Object file version
    pub e_entry: u64,     // Entry point address
    pub e_phoff: u64,     // Program header offset
    pub e_shoff: u64,     // Section header offset
    pub e_flags: u32,     // Processor-specific flags
    pub e_ehsize: u16,    // ELF header size
    pub e_phentsize: u16, // Program header entry size
    pub e_phnum: u16,     // Number of program headers
    pub e_shentsize: u16, // Section header entry size
    pub e_shnum: u16,     // Number of section headers
    pub e_shstrndx: u16,  // Section name string table index
}

impl Elf64Header {
    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        // e_ident (16 bytes)
        w.write_all(&consts::ELF_MAGIC)?;
        w.write_all(&[consts::ELFCLASS64])?; // EI_CLASS
        w.write_all(&[consts::ELFDATA2LSB])?; // EI_DATA
        w.write_all(&[consts::EV_CURRENT])?; // EI_VERSION
        w.write_all(&[consts::ELFOSABI_NONE])?; // EI_OSABI
        w.write_all(&[0u8; 8])?; // EI_PAD

        // Rest of header
        w.write_all(&self.e_type.to_le_bytes())?;
        w.write_all(&self.e_machine.to_le_bytes())?;
        w.write_all(&self.e_version.to_le_bytes())?;
        w.write_all(&self.e_entry.to_le_bytes())?;
        w.write_all(&self.e_phoff.to_le_bytes())?;
        w.write_all(&self.e_shoff.to_le_bytes())?;
        w.write_all(&self.e_flags.to_le_bytes())?;
        w.write_all(&self.e_ehsize.to_le_bytes())?;
        w.write_all(&self.e_phentsize.to_le_bytes())?;
        w.write_all(&self.e_phnum.to_le_bytes())?;
        w.write_all(&self.e_shentsize.to_le_bytes())?;
        w.write_all(&self.e_shnum.to_le_bytes())?;
        w.write_all(&self.e_shstrndx.to_le_bytes())?;

        Ok(())
    }
}

/// ELF64 program header
#[derive(Debug, Clone)]
pub struct Elf64ProgramHeader {
    pub p_type: u32,   // Segment type
    pub p_flags: u32,  // Segment flags
    pub p_offset: u64, // Segment file offset
    pub p_vaddr: u64,  // Segment virtual address
    pub p_paddr: u64,  // Segment physical address
    pub p_filesz: u64, // Segment size in file
    pub p_memsz: u64,  // Segment size in memory
    pub p_align: u64,  // Segment alignment
}

impl Elf64ProgramHeader {
    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.p_type.to_le_bytes())?;
        w.write_all(&self.p_flags.to_le_bytes())?;
        w.write_all(&self.p_offset.to_le_bytes())?;
        w.write_all(&self.p_vaddr.to_le_bytes())?;
        w.write_all(&self.p_paddr.to_le_bytes())?;
        w.write_all(&self.p_filesz.to_le_bytes())?;
        w.write_all(&self.p_memsz.to_le_bytes())?;
        w.write_all(&self.p_align.to_le_bytes())?;
        Ok(())
    }
}

/// ELF64 section header
#[derive(Debug, Clone, Default)]
pub struct Elf64SectionHeader {
    pub sh_name: u32,      // Section name (string table offset)
    pub sh_type: u32,      // Section type
    pub sh_flags: u64,     // Section flags
    pub sh_addr: u64,      // Virtual address in memory
    pub sh_offset: u64,    // Offset in file
    pub sh_size: u64,      // Section size
    pub sh_link: u32,      // Linked section index
    pub sh_info: u32,      // Extra information
    pub sh_addralign: u64, // Address alignment
    pub sh_entsize: u64,   // Entry size for tables
}

impl Elf64SectionHeader {
    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.sh_name.to_le_bytes())?;
        w.write_all(&self.sh_type.to_le_bytes())?;
        w.write_all(&self.sh_flags.to_le_bytes())?;
        w.write_all(&self.sh_addr.to_le_bytes())?;
        w.write_all(&self.sh_offset.to_le_bytes())?;
        w.write_all(&self.sh_size.to_le_bytes())?;
        w.write_all(&self.sh_link.to_le_bytes())?;
        w.write_all(&self.sh_info.to_le_bytes())?;
        w.write_all(&self.sh_addralign.to_le_bytes())?;
        w.write_all(&self.sh_entsize.to_le_bytes())?;
        Ok(())
    }
}

/// Incrementally built string table. Offset 0 is the empty string.
#[derive(Debug)]
struct StringTable {
    data: Vec<u8>,
}

impl StringTable {
    fn new() -> Self {
        Self { data: vec![0] }
    }

    fn add(&mut self, s: &str) -> u32 {
        let offset = self.data.len() as u32;
        self.data.extend_from_slice(s.as_bytes());
        self.data.push(0);
        offset
    }
}

/// Relocatable ELF object builder.
///
/// Section layout: null, `.text`, `.rela.text`, `.strtab` (section and
/// symbol names), `.symtab`. Every compiled function becomes a global
/// `STT_FUNC` symbol; relocation targets become undefined globals.
#[derive(Debug)]
pub struct ObjectBuilder<'a> {
    module: &'a CompiledModule,
}

impl<'a> ObjectBuilder<'a> {
    pub fn new(module: &'a CompiledModule) -> Self {
        Self { module }
    }

    /// Build the complete relocatable object
    pub fn build(&self) -> Result<Vec<u8>> {
        let module = self.module;

        let mut strtab = StringTable::new();
        let name_text = strtab.add(".text");
        let name_rela = strtab.add(".rela.text");
        let name_strtab = strtab.add(".strtab");
        let name_symtab = strtab.add(".symtab");

        // Symbol table: null entry, defined functions, then one undefined
        // entry per distinct relocation target.
        struct SymEntry {
            name: u32,
            info: u8,
            shndx: u16,
            value: u64,
            size: u64,
        }
        let mut syms: Vec<SymEntry> = vec![SymEntry {
            name: 0,
            info: 0,
            shndx: 0,
            value: 0,
            size: 0,
        }];
        for sym in &module.symbols {
            syms.push(SymEntry {
                name: strtab.add(&sym.name),
                info: (consts::STB_GLOBAL << 4) | consts::STT_FUNC,
                shndx: 1, // .text
                value: sym.offset as u64,
                size: sym.size as u64,
            });
        }
        let mut extern_index: Vec<(String, u64)> = Vec::new();
        for reloc in &module.relocations {
            if !extern_index.iter().any(|(name, _)| name == &reloc.symbol) {
                let index = syms.len() as u64;
                syms.push(SymEntry {
                    name: strtab.add(&reloc.symbol),
                    info: consts::STB_GLOBAL << 4, // STT_NOTYPE
                    shndx: 0,                      // SHN_UNDEF
                    value: 0,
                    size: 0,
                });
                extern_index.push((reloc.symbol.clone(), index));
            }
        }

        // File layout
        let text_off = consts::ELF64_EHDR_SIZE as u64;
        let text_size = module.code.len() as u64;
        let rela_off = align8(text_off + text_size);
        let rela_size = module.relocations.len() as u64 * consts::ELF64_RELA_SIZE;
        let strtab_off = rela_off + rela_size;
        let strtab_size = strtab.data.len() as u64;
        let symtab_off = align8(strtab_off + strtab_size);
        let symtab_size = syms.len() as u64 * consts::ELF64_SYM_SIZE;
        let shoff = align8(symtab_off + symtab_size);

        let ehdr = Elf64Header {
            e_type: consts::ET_REL,
            e_machine: module.machine.elf_machine(),
            e_version: consts::EV_CURRENT as u32,
            e_entry: 0,
            e_phoff: 0,
            e_shoff: shoff,
            e_flags: 0,
            e_ehsize: consts::ELF64_EHDR_SIZE,
            e_phentsize: 0,
            e_phnum: 0,
            e_shentsize: consts::ELF64_SHDR_SIZE,
            e_shnum: 5,
            e_shstrndx: 3,
        };

        let mut buf = Vec::with_capacity((shoff + 5 * consts::ELF64_SHDR_SIZE as u64) as usize);
        ehdr.write(&mut buf)?;
        buf.extend_from_slice(&module.code);
        pad_to(&mut buf, rela_off);
        for reloc in &module.relocations {
            let sym_index = extern_index
                .iter()
                .find(|(name, _)| name == &reloc.symbol)
                .map(|&(_, index)| index)
                .ok_or_else(|| OpalError::Object {
                    message: format!("relocation against unindexed symbol '{}'", reloc.symbol),
                })?;
            buf.extend_from_slice(&(reloc.offset as u64).to_le_bytes());
            let r_info = (sym_index << 32) | reloc.kind.elf_type() as u64;
            buf.extend_from_slice(&r_info.to_le_bytes());
            buf.extend_from_slice(&reloc.addend.to_le_bytes());
        }
        buf.extend_from_slice(&strtab.data);
        pad_to(&mut buf, symtab_off);
        for sym in &syms {
            buf.extend_from_slice(&sym.name.to_le_bytes());
            buf.push(sym.info);
            buf.push(0); // st_other
            buf.extend_from_slice(&sym.shndx.to_le_bytes());
            buf.extend_from_slice(&sym.value.to_le_bytes());
            buf.extend_from_slice(&sym.size.to_le_bytes());
        }
        pad_to(&mut buf, shoff);

        let sections = [
            Elf64SectionHeader::default(),
            Elf64SectionHeader {
                sh_name: name_text,
                sh_type: consts::SHT_PROGBITS,
                sh_flags: consts::SHF_ALLOC | consts::SHF_EXECINSTR,
                sh_offset: text_off,
                sh_size: text_size,
                sh_addralign: 16,
                ..Default::default()
            },
            Elf64SectionHeader {
                sh_name: name_rela,
                sh_type: consts::SHT_RELA,
                sh_flags: consts::SHF_INFO_LINK,
                sh_offset: rela_off,
                sh_size: rela_size,
                sh_link: 4, // .symtab
                sh_info: 1, // relocates .text
                sh_addralign: 8,
                sh_entsize: consts::ELF64_RELA_SIZE,
                ..Default::default()
            },
            Elf64SectionHeader {
                sh_name: name_strtab,
                sh_type: consts::SHT_STRTAB,
                sh_offset: strtab_off,
                sh_size: strtab_size,
                sh_addralign: 1,
                ..Default::default()
            },
            Elf64SectionHeader {
                sh_name: name_symtab,
                sh_type: consts::SHT_SYMTAB,
                sh_offset: symtab_off,
                sh_size: symtab_size,
                sh_link: 3, // .strtab
                sh_info: 1, // only the null symbol is local
                sh_addralign: 8,
                sh_entsize: consts::ELF64_SYM_SIZE,
                ..Default::default()
            },
        ];
        for section in &sections {
            section.write(&mut buf)?;
        }

        debug!(
            "object: {} bytes, {} symbols, {} relocations",
            buf.len(),
            module.symbols.len(),
            module.relocations.len()
        );
        Ok(buf)
    }

    /// Build and write to a file
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let data = self.build()?;
        std::fs::write(path, data)?;
        Ok(())
    }
}

/// Standalone executable builder.
///
/// Prepends a `_start` stub that calls the program entry and feeds its
/// return value to the exit system call. Two loadable segments are
/// emitted: read-execute for the headers and code, and a read-write
/// zero-fill segment. The compiled module must carry no external
/// relocations, since nothing links them here.
#[derive(Debug)]
pub struct ExecutableBuilder<'a> {
    module: &'a CompiledModule,
    load_addr: u64,
}

impl<'a> ExecutableBuilder<'a> {
    pub fn new(module: &'a CompiledModule) -> Self {
        Self {
            module,
            load_addr: consts::DEFAULT_LOAD_ADDR,
        }
    }

    /// Set the load address (default: 0x400000)
    pub fn load_addr(mut self, addr: u64) -> Self {
        self.load_addr = addr;
        self
    }

    fn headers_size() -> u64 {
        consts::ELF64_EHDR_SIZE as u64 + 2 * consts::ELF64_PHDR_SIZE as u64
    }

    /// Build the complete executable image
    pub fn build(&self) -> Result<Vec<u8>> {
        let module = self.module;
        if let Some(reloc) = module.relocations.first() {
            return Err(OpalError::Object {
                message: format!(
                    "cannot emit standalone executable with unresolved reference to '{}'",
                    reloc.symbol
                ),
            });
        }
        let entry_sym = module.find_symbol("main").ok_or_else(|| OpalError::Object {
            message: "no 'main' symbol to use as executable entry".to_string(),
        })?;

        // _start stub followed by the module code
        let mut text = match module.machine {
            Machine::X86_64 => x64_start_stub(),
            Machine::Arm64 => arm64_start_stub(),
        };
        let stub_len = text.len();
        text.extend_from_slice(&module.code);
        let target = stub_len + entry_sym.offset;
        patch_stub_call(module.machine, &mut text, target)?;

        let headers = Self::headers_size();
        let text_filesz = headers + text.len() as u64;
        let entry = self.load_addr + headers;

        // Zero-fill read-write segment above the code
        let bss_vaddr = (self.load_addr + text_filesz + consts::PAGE_ALIGN - 1)
            & !(consts::PAGE_ALIGN - 1);

        let ehdr = Elf64Header {
            e_type: consts::ET_EXEC,
            e_machine: module.machine.elf_machine(),
            e_version: consts::EV_CURRENT as u32,
            e_entry: entry,
            e_phoff: consts::ELF64_EHDR_SIZE as u64,
            e_shoff: 0,
            e_flags: 0,
            e_ehsize: consts::ELF64_EHDR_SIZE,
            e_phentsize: consts::ELF64_PHDR_SIZE,
            e_phnum: 2,
            e_shentsize: 0,
            e_shnum: 0,
            e_shstrndx: 0,
        };
        let text_phdr = Elf64ProgramHeader {
            p_type: consts::PT_LOAD,
            p_flags: consts::PF_R | consts::PF_X,
            p_offset: 0,
            p_vaddr: self.load_addr,
            p_paddr: self.load_addr,
            p_filesz: text_filesz,
            p_memsz: text_filesz,
            p_align: consts::PAGE_ALIGN,
        };
        let bss_phdr = Elf64ProgramHeader {
            p_type: consts::PT_LOAD,
            p_flags: consts::PF_R | consts::PF_W,
            p_offset: text_filesz,
            p_vaddr: bss_vaddr,
            p_paddr: bss_vaddr,
            p_filesz: 0,
            p_memsz: consts::PAGE_ALIGN,
            p_align: consts::PAGE_ALIGN,
        };

        let mut buf = Vec::with_capacity(text_filesz as usize);
        ehdr.write(&mut buf)?;
        text_phdr.write(&mut buf)?;
        bss_phdr.write(&mut buf)?;
        buf.extend_from_slice(&text);

        debug!(
            "executable: {} bytes, entry {:#x} ({})",
            buf.len(),
            entry,
            entry_sym.name
        );
        Ok(buf)
    }

    /// Build and write to a file, marking it executable
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        use std::fs::File;

        let data = self.build()?;
        let mut file = File::create(path)?;
        file.write_all(&data)?;

        // chmod +x - Unix only
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = file.metadata()?.permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(path, perms)?;
        }

        Ok(())
    }
}

/// x86-64 `_start`: clear the frame pointer, call the entry function, and
/// exit with its return value.
fn x64_start_stub() -> Vec<u8> {
    let mut stub = Vec::with_capacity(17);
    stub.extend_from_slice(&[0x31, 0xED]); // xor ebp, ebp
    stub.push(0xE8); // call rel32 (patched)
    stub.extend_from_slice(&[0, 0, 0, 0]);
    stub.extend_from_slice(&[0x48, 0x89, 0xC7]); // mov rdi, rax
    stub.extend_from_slice(&[0xB8, 60, 0, 0, 0]); // mov eax, 60 (exit)
    stub.extend_from_slice(&[0x0F, 0x05]); // syscall
    stub
}

/// AArch64 `_start`: clear the frame pointer, branch-and-link to the entry
/// function, and exit with its return value (already in X0).
fn arm64_start_stub() -> Vec<u8> {
    let mut stub = Vec::with_capacity(16);
    crate::arm64::encoding::movz_x(&mut stub, crate::arm64::Reg64::X29, 0, 0);
    crate::arm64::encoding::bl(&mut stub, 0); // patched
    crate::arm64::encoding::movz_x(&mut stub, crate::arm64::Reg64::X8, 93, 0); // exit
    crate::arm64::encoding::svc(&mut stub, 0);
    stub
}

/// Resolve the stub's entry call against the target byte offset in `text`
fn patch_stub_call(machine: Machine, text: &mut [u8], target: usize) -> Result<()> {
    match machine {
        Machine::X86_64 => {
            // Displacement bytes start at offset 3, relative to the next
            // instruction at offset 7
            let rel = target as i64 - 7;
            if rel > i32::MAX as i64 || rel < i32::MIN as i64 {
                return Err(OpalError::Object {
                    message: format!("entry displacement {} out of range", rel),
                });
            }
            text[3..7].copy_from_slice(&(rel as i32).to_le_bytes());
            Ok(())
        }
        Machine::Arm64 => {
            // BL is the second stub word
            let rel = target as i64 - 4;
            crate::arm64::encoding::patch_branch(text, 4, rel)
        }
    }
}

fn pad_to(buf: &mut Vec<u8>, offset: u64) {
    buf.resize(offset as usize, 0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{RelocKind, Relocation, Symbol};

    fn sample_module() -> CompiledModule {
        CompiledModule {
            machine: Machine::X86_64,
            code: vec![0x55, 0x48, 0x89, 0xE5, 0x5D, 0xC3],
            symbols: vec![Symbol {
                name: "main".to_string(),
                offset: 0,
                size: 6,
            }],
            relocations: Vec::new(),
        }
    }

    #[test]
    fn test_elf_header_size() {
        let ehdr = Elf64Header {
            e_type: consts::ET_REL,
            e_machine: 62,
            e_version: 1,
            e_entry: 0,
            e_phoff: 0,
            e_shoff: 0,
            e_flags: 0,
            e_ehsize: consts::ELF64_EHDR_SIZE,
            e_phentsize: 0,
            e_phnum: 0,
            e_shentsize: consts::ELF64_SHDR_SIZE,
            e_shnum: 0,
            e_shstrndx: 0,
        };
        let mut buf = Vec::new();
        ehdr.write(&mut buf).unwrap();
        assert_eq!(buf.len(), 64);
    }

    #[test]
    fn test_program_header_size() {
        let phdr = Elf64ProgramHeader {
            p_type: consts::PT_LOAD,
            p_flags: consts::PF_R | consts::PF_X,
            p_offset: 0,
            p_vaddr: 0x400000,
            p_paddr: 0x400000,
            p_filesz: 120,
            p_memsz: 120,
            p_align: 0x1000,
        };
        let mut buf = Vec::new();
        phdr.write(&mut buf).unwrap();
        assert_eq!(buf.len(), 56);
    }

    #[test]
    fn test_section_header_size() {
        let shdr = Elf64SectionHeader::default();
        let mut buf = Vec::new();
        shdr.write(&mut buf).unwrap();
        assert_eq!(buf.len(), 64);
    }

    #[test]
    fn test_object_identification() {
        let module = sample_module();
        let obj = ObjectBuilder::new(&module).build().unwrap();
        assert_eq!(&obj[0..4], &[0x7F, b'E', b'L', b'F']);
        assert_eq!(obj[4], 2); // 64-bit
        assert_eq!(obj[5], 1); // little endian
        assert_eq!(u16::from_le_bytes([obj[16], obj[17]]), consts::ET_REL);
        assert_eq!(u16::from_le_bytes([obj[18], obj[19]]), 62); // EM_X86_64
    }

    #[test]
    fn test_object_carries_code_and_relocation() {
        let mut module = sample_module();
        module.relocations.push(Relocation {
            offset: 1,
            symbol: "opal_rt_print".to_string(),
            kind: RelocKind::X64Plt32,
            addend: -4,
        });
        let obj = ObjectBuilder::new(&module).build().unwrap();
        // .text follows the file header directly
        assert_eq!(&obj[64..70], module.code.as_slice());
        // Five section headers at e_shoff
        let shoff = u64::from_le_bytes(obj[40..48].try_into().unwrap()) as usize;
        let shnum = u16::from_le_bytes([obj[60], obj[61]]);
        assert_eq!(shnum, 5);
        assert_eq!(obj.len(), shoff + 5 * 64);
        // The relocation record names R_X86_64_PLT32
        let rela_off = (64 + module.code.len() + 7) & !7;
        let r_info = u64::from_le_bytes(obj[rela_off + 8..rela_off + 16].try_into().unwrap());
        assert_eq!(r_info & 0xFFFF_FFFF, 4);
        let r_addend = i64::from_le_bytes(obj[rela_off + 16..rela_off + 24].try_into().unwrap());
        assert_eq!(r_addend, -4);
    }

    #[test]
    fn test_executable_layout() {
        let module = sample_module();
        let exe = ExecutableBuilder::new(&module).build().unwrap();
        assert_eq!(u16::from_le_bytes([exe[16], exe[17]]), consts::ET_EXEC);
        // Entry points at the stub, directly after the headers
        let entry = u64::from_le_bytes(exe[24..32].try_into().unwrap());
        assert_eq!(entry, 0x400000 + 176);
        // Stub: xor ebp, ebp; call
        assert_eq!(&exe[176..179], &[0x31, 0xED, 0xE8]);
        // The call resolves to the entry symbol behind the stub
        let rel = i32::from_le_bytes(exe[179..183].try_into().unwrap());
        assert_eq!(rel as i64, 17 - 7);
    }

    #[test]
    fn test_executable_requires_main_symbol() {
        let mut module = sample_module();
        module.symbols[0].name = "helper".to_string();
        // The stub has nothing to call without a main
        assert!(ExecutableBuilder::new(&module).build().is_err());
    }

    #[test]
    fn test_executable_rejects_external_references() {
        let mut module = sample_module();
        module.relocations.push(Relocation {
            offset: 1,
            symbol: "opal_rt_print".to_string(),
            kind: RelocKind::X64Plt32,
            addend: -4,
        });
        assert!(ExecutableBuilder::new(&module).build().is_err());
    }

    #[test]
    fn test_arm64_executable_stub() {
        let module = CompiledModule {
            machine: Machine::Arm64,
            code: {
                let mut code = Vec::new();
                crate::arm64::encoding::ret(&mut code);
                code
            },
            symbols: vec![Symbol {
                name: "main".to_string(),
                offset: 0,
                size: 4,
            }],
            relocations: Vec::new(),
        };
        let exe = ExecutableBuilder::new(&module).build().unwrap();
        assert_eq!(u16::from_le_bytes([exe[18], exe[19]]), 183); // EM_AARCH64
        // BL word patched to reach offset 16 from offset 4
        let bl = u32::from_le_bytes(exe[180..184].try_into().unwrap());
        assert_eq!(bl & 0xFC000000, 0x94000000);
        assert_eq!(bl & 0x03FFFFFF, 3); // 12 bytes = 3 words
    }
}
