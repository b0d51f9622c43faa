//! x64 Instruction Encoding
//!
//! Direct machine code generation for x64 instructions.
//! No external assembler dependency.
//!
//! ## Instruction Format
//!
//! ```text
//! [Legacy Prefix] [REX] [Opcode] [ModR/M] [SIB] [Disp] [Imm]
//! ```

use super::registers::Reg64;

/// Machine code buffer for emitting instructions
#[derive(Debug, Default)]
pub struct CodeBuffer {
    code: Vec<u8>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self { code: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            code: Vec::with_capacity(capacity),
        }
    }

    /// Get current code offset
    #[inline]
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    /// Emit a single byte
    #[inline]
    pub fn emit(&mut self, byte: u8) {
        self.code.push(byte);
    }

    /// Emit multiple bytes
    #[inline]
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// Emit a 32-bit little-endian value
    #[inline]
    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 64-bit little-endian value
    #[inline]
    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a signed 32-bit little-endian value
    #[inline]
    pub fn emit_i32(&mut self, value: i32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Patch a 32-bit value at the given offset
    pub fn patch_i32(&mut self, offset: usize, value: i32) {
        let bytes = value.to_le_bytes();
        self.code[offset..offset + 4].copy_from_slice(&bytes);
    }

    /// Get the generated code
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Take ownership of the generated code
    pub fn into_code(self) -> Vec<u8> {
        self.code
    }
}

/// REX prefix builder
#[derive(Debug, Clone, Copy, Default)]
pub struct Rex {
    w: bool, // 64-bit operand size
    r: bool, // ModR/M reg extension
    x: bool, // SIB index extension
    b: bool, // ModR/M r/m or SIB base extension
}

impl Rex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set W bit (64-bit operand size)
    pub fn w(mut self) -> Self {
        self.w = true;
        self
    }

    /// Set R bit (reg field extension for r8-r15)
    pub fn r(mut self) -> Self {
        self.r = true;
        self
    }

    /// Set B bit (r/m or base field extension for r8-r15)
    pub fn b(mut self) -> Self {
        self.b = true;
        self
    }

    /// Check if REX prefix is needed
    pub fn is_needed(&self) -> bool {
        self.w || self.r || self.x || self.b
    }

    /// Encode to byte (0x40-0x4F)
    pub fn encode(&self) -> u8 {
        0x40 | ((self.w as u8) << 3)
            | ((self.r as u8) << 2)
            | ((self.x as u8) << 1)
            | (self.b as u8)
    }
}

/// ModR/M byte builder
#[derive(Debug, Clone, Copy)]
pub struct ModRM {
    mod_: u8, // 2 bits: addressing mode
    reg: u8,  // 3 bits: register or opcode extension
    rm: u8,   // 3 bits: register or memory operand
}

impl ModRM {
    /// Create ModR/M for register-to-register (mod=11)
    pub fn reg_reg(reg: u8, rm: u8) -> Self {
        Self {
            mod_: 0b11,
            reg: reg & 0x07,
            rm: rm & 0x07,
        }
    }

    /// Create ModR/M for register with opcode extension (mod=11)
    pub fn reg_opext(opext: u8, rm: u8) -> Self {
        Self {
            mod_: 0b11,
            reg: opext & 0x07,
            rm: rm & 0x07,
        }
    }

    /// Create ModR/M for [base + disp32] addressing (mod=10)
    pub fn mem_disp32(reg: u8, base: u8) -> Self {
        Self {
            mod_: 0b10,
            reg: reg & 0x07,
            rm: base & 0x07,
        }
    }

    /// Encode to byte
    pub fn encode(&self) -> u8 {
        (self.mod_ << 6) | (self.reg << 3) | self.rm
    }
}

/// x64 instruction emitter
impl CodeBuffer {
    // ==================== Data Movement ====================

    /// MOV r64, imm64 (movabs)
    pub fn mov_r64_imm64(&mut self, dst: Reg64, imm: u64) {
        let mut rex = Rex::new().w();
        if dst.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(0xB8 + dst.encoding()); // B8+rd
        self.emit_u64(imm);
    }

    /// MOV r64, imm32 (sign-extended)
    pub fn mov_r64_imm32(&mut self, dst: Reg64, imm: i32) {
        let mut rex = Rex::new().w();
        if dst.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(0xC7); // C7 /0
        self.emit(ModRM::reg_opext(0, dst.encoding()).encode());
        self.emit_i32(imm);
    }

    /// MOV r64, r64
    pub fn mov_r64_r64(&mut self, dst: Reg64, src: Reg64) {
        let mut rex = Rex::new().w();
        if src.needs_rex_ext() {
            rex = rex.r();
        }
        if dst.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(0x89); // 89 /r
        self.emit(ModRM::reg_reg(src.encoding(), dst.encoding()).encode());
    }

    /// MOV [base + disp32], r64
    pub fn mov_mem_r64(&mut self, base: Reg64, disp: i32, src: Reg64) {
        let mut rex = Rex::new().w();
        if src.needs_rex_ext() {
            rex = rex.r();
        }
        if base.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(0x89); // 89 /r
        self.emit(ModRM::mem_disp32(src.encoding(), base.encoding()).encode());
        if base.encoding() == 4 {
            self.emit(0x24); // SIB: base only, no index
        }
        self.emit_i32(disp);
    }

    /// MOV r64, [base + disp32]
    pub fn mov_r64_mem(&mut self, dst: Reg64, base: Reg64, disp: i32) {
        let mut rex = Rex::new().w();
        if dst.needs_rex_ext() {
            rex = rex.r();
        }
        if base.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(0x8B); // 8B /r
        self.emit(ModRM::mem_disp32(dst.encoding(), base.encoding()).encode());
        if base.encoding() == 4 {
            self.emit(0x24);
        }
        self.emit_i32(disp);
    }

    // ==================== Arithmetic ====================

    /// ADD r64, r64
    pub fn add_r64_r64(&mut self, dst: Reg64, src: Reg64) {
        let mut rex = Rex::new().w();
        if src.needs_rex_ext() {
            rex = rex.r();
        }
        if dst.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(0x01); // 01 /r
        self.emit(ModRM::reg_reg(src.encoding(), dst.encoding()).encode());
    }

    /// ADD r64, imm32 (sign-extended)
    pub fn add_r64_imm32(&mut self, dst: Reg64, imm: i32) {
        let mut rex = Rex::new().w();
        if dst.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(0x81); // 81 /0
        self.emit(ModRM::reg_opext(0, dst.encoding()).encode());
        self.emit_i32(imm);
    }

    /// SUB r64, r64
    pub fn sub_r64_r64(&mut self, dst: Reg64, src: Reg64) {
        let mut rex = Rex::new().w();
        if src.needs_rex_ext() {
            rex = rex.r();
        }
        if dst.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(0x29); // 29 /r
        self.emit(ModRM::reg_reg(src.encoding(), dst.encoding()).encode());
    }

    /// SUB r64, imm32 (sign-extended)
    pub fn sub_r64_imm32(&mut self, dst: Reg64, imm: i32) {
        let mut rex = Rex::new().w();
        if dst.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(0x81); // 81 /5
        self.emit(ModRM::reg_opext(5, dst.encoding()).encode());
        self.emit_i32(imm);
    }

    /// IMUL r64, r64
    pub fn imul_r64_r64(&mut self, dst: Reg64, src: Reg64) {
        let mut rex = Rex::new().w();
        if dst.needs_rex_ext() {
            rex = rex.r();
        }
        if src.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(0x0F);
        self.emit(0xAF); // 0F AF /r
        self.emit(ModRM::reg_reg(dst.encoding(), src.encoding()).encode());
    }

    /// CQO (sign-extend RAX into RDX:RAX for division)
    pub fn cqo(&mut self) {
        self.emit(Rex::new().w().encode());
        self.emit(0x99);
    }

    /// IDIV r64 (signed divide RDX:RAX by r64, quotient in RAX, remainder in RDX)
    pub fn idiv_r64(&mut self, divisor: Reg64) {
        let mut rex = Rex::new().w();
        if divisor.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(0xF7); // F7 /7
        self.emit(ModRM::reg_opext(7, divisor.encoding()).encode());
    }

    /// NEG r64 (two's complement negate)
    pub fn neg_r64(&mut self, dst: Reg64) {
        let mut rex = Rex::new().w();
        if dst.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(0xF7); // F7 /3
        self.emit(ModRM::reg_opext(3, dst.encoding()).encode());
    }

    // ==================== Comparison ====================

    /// CMP r64, r64
    pub fn cmp_r64_r64(&mut self, left: Reg64, right: Reg64) {
        let mut rex = Rex::new().w();
        if right.needs_rex_ext() {
            rex = rex.r();
        }
        if left.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(0x39); // 39 /r
        self.emit(ModRM::reg_reg(right.encoding(), left.encoding()).encode());
    }

    /// CMP r64, imm32
    pub fn cmp_r64_imm32(&mut self, left: Reg64, imm: i32) {
        let mut rex = Rex::new().w();
        if left.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(0x81); // 81 /7
        self.emit(ModRM::reg_opext(7, left.encoding()).encode());
        self.emit_i32(imm);
    }

    /// SETcc r8 family: emit `0F <opcode> /0`
    fn setcc(&mut self, opcode: u8, dst: Reg64) {
        if dst.needs_rex_ext() {
            self.emit(Rex::new().b().encode());
        }
        self.emit(0x0F);
        self.emit(opcode);
        self.emit(ModRM::reg_opext(0, dst.encoding()).encode());
    }

    /// SETE r8 (set byte if equal)
    pub fn sete(&mut self, dst: Reg64) {
        self.setcc(0x94, dst);
    }

    /// SETNE r8 (set byte if not equal)
    pub fn setne(&mut self, dst: Reg64) {
        self.setcc(0x95, dst);
    }

    /// SETL r8 (set byte if less, signed)
    pub fn setl(&mut self, dst: Reg64) {
        self.setcc(0x9C, dst);
    }

    /// SETLE r8 (set byte if less or equal, signed)
    pub fn setle(&mut self, dst: Reg64) {
        self.setcc(0x9E, dst);
    }

    /// SETG r8 (set byte if greater, signed)
    pub fn setg(&mut self, dst: Reg64) {
        self.setcc(0x9F, dst);
    }

    /// SETGE r8 (set byte if greater or equal, signed)
    pub fn setge(&mut self, dst: Reg64) {
        self.setcc(0x9D, dst);
    }

    /// MOVZX r64, r8 (zero-extend byte to 64-bit)
    pub fn movzx_r64_r8(&mut self, dst: Reg64, src: Reg64) {
        let mut rex = Rex::new().w();
        if dst.needs_rex_ext() {
            rex = rex.r();
        }
        if src.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(0x0F);
        self.emit(0xB6); // 0F B6 /r
        self.emit(ModRM::reg_reg(dst.encoding(), src.encoding()).encode());
    }

    // ==================== Stack Operations ====================

    /// PUSH r64
    pub fn push_r64(&mut self, reg: Reg64) {
        if reg.needs_rex_ext() {
            self.emit(Rex::new().b().encode());
        }
        self.emit(0x50 + reg.encoding()); // 50+rd
    }

    /// POP r64
    pub fn pop_r64(&mut self, reg: Reg64) {
        if reg.needs_rex_ext() {
            self.emit(Rex::new().b().encode());
        }
        self.emit(0x58 + reg.encoding()); // 58+rd
    }

    // ==================== Control Flow ====================

    /// RET
    pub fn ret(&mut self) {
        self.emit(0xC3);
    }

    /// NOP
    pub fn nop(&mut self) {
        self.emit(0x90);
    }

    /// JMP rel32 (near jump, returns offset of the displacement for patching)
    pub fn jmp_rel32(&mut self) -> usize {
        self.emit(0xE9); // E9 cd
        let offset = self.offset();
        self.emit_i32(0); // placeholder
        offset
    }

    /// JE rel32 (jump if equal, returns offset of the displacement)
    pub fn je_rel32(&mut self) -> usize {
        self.emit(0x0F);
        self.emit(0x84); // 0F 84 cd
        let offset = self.offset();
        self.emit_i32(0);
        offset
    }

    /// JNE rel32 (jump if not equal)
    pub fn jne_rel32(&mut self) -> usize {
        self.emit(0x0F);
        self.emit(0x85);
        let offset = self.offset();
        self.emit_i32(0);
        offset
    }

    /// CALL rel32 (near call, returns offset of the displacement)
    pub fn call_rel32(&mut self) -> usize {
        self.emit(0xE8); // E8 cd
        let offset = self.offset();
        self.emit_i32(0);
        offset
    }

    // ==================== System ====================

    /// SYSCALL
    pub fn syscall(&mut self) {
        self.emit(0x0F);
        self.emit(0x05);
    }

    // ==================== Bitwise Operations ====================

    /// XOR r64, r64 (often used to zero a register)
    pub fn xor_r64_r64(&mut self, dst: Reg64, src: Reg64) {
        let mut rex = Rex::new().w();
        if src.needs_rex_ext() {
            rex = rex.r();
        }
        if dst.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(0x31); // 31 /r
        self.emit(ModRM::reg_reg(src.encoding(), dst.encoding()).encode());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mov_r64_imm64() {
        let mut buf = CodeBuffer::new();
        buf.mov_r64_imm64(Reg64::RAX, 42);
        // REX.W + B8 + imm64
        assert_eq!(&buf.code()[0..2], &[0x48, 0xB8]);
    }

    #[test]
    fn test_imm64_round_trips_float_bits() {
        let mut buf = CodeBuffer::new();
        buf.mov_r64_imm64(Reg64::RAX, 123.456f64.to_bits());
        let code = buf.code();
        assert_eq!(&code[0..2], &[0x48, 0xB8]);
        // Decoding the immediate bytes restores the exact bit pattern
        let decoded = u64::from_le_bytes(code[2..10].try_into().unwrap());
        assert_eq!(f64::from_bits(decoded), 123.456);
    }

    #[test]
    fn test_mov_r64_r64() {
        let mut buf = CodeBuffer::new();
        buf.mov_r64_r64(Reg64::RBX, Reg64::RAX);
        // REX.W + 89 + ModR/M(11 000 011)
        assert_eq!(buf.code(), &[0x48, 0x89, 0xC3]);
    }

    #[test]
    fn test_mov_mem_r64() {
        let mut buf = CodeBuffer::new();
        buf.mov_mem_r64(Reg64::RBP, -8, Reg64::RAX);
        // REX.W + 89 + ModR/M(10 000 101) + disp32
        assert_eq!(buf.code(), &[0x48, 0x89, 0x85, 0xF8, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_mov_r64_mem() {
        let mut buf = CodeBuffer::new();
        buf.mov_r64_mem(Reg64::RAX, Reg64::RBP, -16);
        // REX.W + 8B + ModR/M(10 000 101) + disp32
        assert_eq!(buf.code(), &[0x48, 0x8B, 0x85, 0xF0, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_add_r64_r64() {
        let mut buf = CodeBuffer::new();
        buf.add_r64_r64(Reg64::RAX, Reg64::RBX);
        // REX.W + 01 + ModR/M(11 011 000)
        assert_eq!(buf.code(), &[0x48, 0x01, 0xD8]);
    }

    #[test]
    fn test_neg_r64() {
        let mut buf = CodeBuffer::new();
        buf.neg_r64(Reg64::RAX);
        // REX.W + F7 /3
        assert_eq!(buf.code(), &[0x48, 0xF7, 0xD8]);
    }

    #[test]
    fn test_syscall() {
        let mut buf = CodeBuffer::new();
        buf.syscall();
        assert_eq!(buf.code(), &[0x0F, 0x05]);
    }

    #[test]
    fn test_ret() {
        let mut buf = CodeBuffer::new();
        buf.ret();
        assert_eq!(buf.code(), &[0xC3]);
    }

    #[test]
    fn test_push_pop() {
        let mut buf = CodeBuffer::new();
        buf.push_r64(Reg64::RBP);
        buf.pop_r64(Reg64::RBP);
        assert_eq!(buf.code(), &[0x55, 0x5D]);
    }

    #[test]
    fn test_extended_registers() {
        let mut buf = CodeBuffer::new();
        buf.mov_r64_r64(Reg64::R8, Reg64::R15);
        // REX.W + REX.R + REX.B
        assert_eq!(buf.code()[0], 0x4D);
    }

    #[test]
    fn test_jmp_returns_patch_offset() {
        let mut buf = CodeBuffer::new();
        buf.nop();
        let patch = buf.jmp_rel32();
        assert_eq!(patch, 2); // one nop + opcode byte
        buf.patch_i32(patch, 0x11223344);
        assert_eq!(&buf.code()[2..6], &[0x44, 0x33, 0x22, 0x11]);
    }
}
