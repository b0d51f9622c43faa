//! ARM64 (AArch64) Instruction Encoding
//!
//! Encodes ARM64 instructions into 32-bit machine code.
//! All ARM64 instructions are exactly 4 bytes, little-endian.

use crate::{OpalError, Result};

use super::registers::special;
use super::registers::Reg64;

/// Encode a 32-bit instruction and append to buffer
fn emit(buf: &mut Vec<u8>, insn: u32) {
    buf.extend_from_slice(&insn.to_le_bytes());
}

// =============================================================================
// Data Processing - Immediate
// =============================================================================

/// MOV (immediate) - Move wide immediate to register (MOVZ)
/// Encodes: MOVZ Xd, #imm16, LSL #shift
pub fn movz_x(buf: &mut Vec<u8>, rd: Reg64, imm16: u16, shift: u8) {
    // MOVZ (64-bit): 1 10 100101 hw imm16 Rd
    let hw = (shift / 16) as u32;
    let insn = 0xD2800000 | (hw << 21) | ((imm16 as u32) << 5) | (rd.encoding() as u32);
    emit(buf, insn);
}

/// MOVK - Move wide with keep (for building larger immediates)
pub fn movk_x(buf: &mut Vec<u8>, rd: Reg64, imm16: u16, shift: u8) {
    // MOVK (64-bit): 1 11 100101 hw imm16 Rd
    let hw = (shift / 16) as u32;
    let insn = 0xF2800000 | (hw << 21) | ((imm16 as u32) << 5) | (rd.encoding() as u32);
    emit(buf, insn);
}

/// ADD (immediate) - Add immediate to register
/// Encodes: ADD Xd, Xn, #imm12
pub fn add_imm_x(buf: &mut Vec<u8>, rd: Reg64, rn: Reg64, imm12: u16) {
    // ADD (64-bit): 1 00 10001 shift imm12 Rn Rd
    let insn =
        0x91000000 | ((imm12 as u32) << 10) | ((rn.encoding() as u32) << 5) | (rd.encoding() as u32);
    emit(buf, insn);
}

/// SUB (immediate) - Subtract immediate from register
pub fn sub_imm_x(buf: &mut Vec<u8>, rd: Reg64, rn: Reg64, imm12: u16) {
    // SUB (64-bit): 1 10 10001 shift imm12 Rn Rd
    let insn =
        0xD1000000 | ((imm12 as u32) << 10) | ((rn.encoding() as u32) << 5) | (rd.encoding() as u32);
    emit(buf, insn);
}

/// ADD SP, SP, #imm12 (register 31 is SP in this position)
pub fn add_sp_imm(buf: &mut Vec<u8>, imm12: u16) {
    let sp = special::SP as u32;
    let insn = 0x91000000 | ((imm12 as u32) << 10) | (sp << 5) | sp;
    emit(buf, insn);
}

/// SUB SP, SP, #imm12
pub fn sub_sp_imm(buf: &mut Vec<u8>, imm12: u16) {
    let sp = special::SP as u32;
    let insn = 0xD1000000 | ((imm12 as u32) << 10) | (sp << 5) | sp;
    emit(buf, insn);
}

/// MOV Xd, SP (alias for ADD Xd, SP, #0)
pub fn mov_x_sp(buf: &mut Vec<u8>, rd: Reg64) {
    let insn = 0x91000000 | ((special::SP as u32) << 5) | (rd.encoding() as u32);
    emit(buf, insn);
}

// =============================================================================
// Data Processing - Register
// =============================================================================

/// MOV (register) - Move register to register (alias for ORR)
/// Encodes: ORR Xd, XZR, Xm
pub fn mov_x(buf: &mut Vec<u8>, rd: Reg64, rm: Reg64) {
    // ORR Xd, XZR, Xm: 1 01 01010 shift 0 Xm imm6 XZR Xd
    let insn = 0xAA0003E0 | ((rm.encoding() as u32) << 16) | (rd.encoding() as u32);
    emit(buf, insn);
}

/// ADD (register) - Add two registers
/// Encodes: ADD Xd, Xn, Xm
pub fn add_x(buf: &mut Vec<u8>, rd: Reg64, rn: Reg64, rm: Reg64) {
    // ADD (shifted): 1 00 01011 shift 0 Rm imm6 Rn Rd
    let insn = 0x8B000000
        | ((rm.encoding() as u32) << 16)
        | ((rn.encoding() as u32) << 5)
        | (rd.encoding() as u32);
    emit(buf, insn);
}

/// SUB (register) - Subtract two registers
pub fn sub_x(buf: &mut Vec<u8>, rd: Reg64, rn: Reg64, rm: Reg64) {
    // SUB (shifted): 1 10 01011 shift 0 Rm imm6 Rn Rd
    let insn = 0xCB000000
        | ((rm.encoding() as u32) << 16)
        | ((rn.encoding() as u32) << 5)
        | (rd.encoding() as u32);
    emit(buf, insn);
}

/// NEG - Negate register (alias for SUB Xd, XZR, Xm)
pub fn neg_x(buf: &mut Vec<u8>, rd: Reg64, rm: Reg64) {
    let insn = 0xCB000000
        | ((rm.encoding() as u32) << 16)
        | ((special::XZR as u32) << 5)
        | (rd.encoding() as u32);
    emit(buf, insn);
}

/// MUL (register) - Multiply two registers
/// Encodes: MADD Xd, Xn, Xm, XZR
pub fn mul_x(buf: &mut Vec<u8>, rd: Reg64, rn: Reg64, rm: Reg64) {
    // MADD: 1 00 11011 000 Rm 0 11111 Rn Rd (Ra = XZR = 31)
    let insn = 0x9B007C00
        | ((rm.encoding() as u32) << 16)
        | ((rn.encoding() as u32) << 5)
        | (rd.encoding() as u32);
    emit(buf, insn);
}

/// SDIV - Signed divide
pub fn sdiv_x(buf: &mut Vec<u8>, rd: Reg64, rn: Reg64, rm: Reg64) {
    // SDIV: 1 00 11010110 Rm 00001 1 Rn Rd
    let insn = 0x9AC00C00
        | ((rm.encoding() as u32) << 16)
        | ((rn.encoding() as u32) << 5)
        | (rd.encoding() as u32);
    emit(buf, insn);
}

// =============================================================================
// Comparison and Conditionals
// =============================================================================

/// CMP (register) - Compare two registers (alias for SUBS with Xd = XZR)
pub fn cmp_x(buf: &mut Vec<u8>, rn: Reg64, rm: Reg64) {
    // SUBS XZR, Xn, Xm: 1 11 01011 shift 0 Rm imm6 Rn 11111
    let insn = 0xEB00001F | ((rm.encoding() as u32) << 16) | ((rn.encoding() as u32) << 5);
    emit(buf, insn);
}

/// CMP (immediate) - Compare register with immediate
pub fn cmp_imm_x(buf: &mut Vec<u8>, rn: Reg64, imm12: u16) {
    // SUBS XZR, Xn, #imm12: 1 11 10001 shift imm12 Rn 11111
    let insn = 0xF100001F | ((imm12 as u32) << 10) | ((rn.encoding() as u32) << 5);
    emit(buf, insn);
}

/// CSET - Conditional set (set 1 if condition, else 0)
/// Encodes: CSINC Xd, XZR, XZR, invert(cond)
pub fn cset_x(buf: &mut Vec<u8>, rd: Reg64, cond: Condition) {
    let inv_cond = cond.invert();
    let insn = 0x9A9F07E0 | ((inv_cond as u32) << 12) | (rd.encoding() as u32);
    emit(buf, insn);
}

/// ARM64 condition codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Condition {
    EQ = 0b0000, // Equal
    NE = 0b0001, // Not equal
    CS = 0b0010, // Carry set / unsigned >=
    CC = 0b0011, // Carry clear / unsigned <
    MI = 0b0100, // Minus / negative
    PL = 0b0101, // Plus / positive or zero
    VS = 0b0110, // Overflow
    VC = 0b0111, // No overflow
    HI = 0b1000, // Unsigned >
    LS = 0b1001, // Unsigned <=
    GE = 0b1010, // Signed >=
    LT = 0b1011, // Signed <
    GT = 0b1100, // Signed >
    LE = 0b1101, // Signed <=
    AL = 0b1110, // Always
    NV = 0b1111, // Never (reserved)
}

impl Condition {
    /// Get the inverted condition
    pub fn invert(self) -> Condition {
        // Toggle the least significant bit
        unsafe { std::mem::transmute((self as u8) ^ 1) }
    }
}

// =============================================================================
// Branch Instructions
// =============================================================================

/// B - Unconditional branch (PC-relative)
/// offset is in bytes and must be 4-byte aligned
pub fn b(buf: &mut Vec<u8>, offset: i32) {
    // B: 000101 imm26
    let imm26 = ((offset >> 2) as u32) & 0x03FF_FFFF;
    let insn = 0x14000000 | imm26;
    emit(buf, insn);
}

/// B.cond - Conditional branch (PC-relative)
pub fn b_cond(buf: &mut Vec<u8>, cond: Condition, offset: i32) {
    // B.cond: 01010100 imm19 0 cond
    let imm19 = ((offset >> 2) as u32) & 0x7FFFF;
    let insn = 0x54000000 | (imm19 << 5) | (cond as u32);
    emit(buf, insn);
}

/// BL - Branch with link (function call)
pub fn bl(buf: &mut Vec<u8>, offset: i32) {
    // BL: 100101 imm26
    let imm26 = ((offset >> 2) as u32) & 0x03FF_FFFF;
    let insn = 0x94000000 | imm26;
    emit(buf, insn);
}

/// BLR - Branch with link to register (indirect call)
pub fn blr(buf: &mut Vec<u8>, rn: Reg64) {
    // BLR: 1101011 0001 11111 000000 Rn 00000
    let insn = 0xD63F0000 | ((rn.encoding() as u32) << 5);
    emit(buf, insn);
}

/// RET - Return from subroutine via X30
pub fn ret(buf: &mut Vec<u8>) {
    // RET: 1101011 0010 11111 000000 Rn 00000
    let insn = 0xD65F0000 | ((special::LR as u32) << 5);
    emit(buf, insn);
}

/// CBZ - Compare and branch if zero
pub fn cbz_x(buf: &mut Vec<u8>, rt: Reg64, offset: i32) {
    // CBZ (64-bit): 1 011010 0 imm19 Rt
    let imm19 = ((offset >> 2) as u32) & 0x7FFFF;
    let insn = 0xB4000000 | (imm19 << 5) | (rt.encoding() as u32);
    emit(buf, insn);
}

/// Rewrite the branch displacement of an already-emitted instruction.
///
/// The instruction word at `site` is inspected to decide the immediate
/// field: B/BL carry imm26, B.cond and CBZ/CBNZ carry imm19. Every other
/// bit of the original word is preserved. `rel` is the byte displacement
/// from the branch instruction itself.
pub fn patch_branch(code: &mut [u8], site: usize, rel: i64) -> Result<()> {
    if rel % 4 != 0 {
        return Err(OpalError::Encoding {
            message: format!("branch displacement {} is not word aligned", rel),
        });
    }
    let word = u32::from_le_bytes([code[site], code[site + 1], code[site + 2], code[site + 3]]);
    let words = rel >> 2;

    let patched = if (word >> 26) == 0b000101 || (word >> 26) == 0b100101 {
        // B / BL: signed 26-bit word displacement
        if words > 0x1FF_FFFF || words < -0x200_0000 {
            return Err(OpalError::Encoding {
                message: format!("branch displacement {} exceeds imm26 range", rel),
            });
        }
        (word & 0xFC00_0000) | ((words as u32) & 0x03FF_FFFF)
    } else if (word >> 24) == 0x54 || (word >> 24) == 0xB4 || (word >> 24) == 0xB5 {
        // B.cond / CBZ / CBNZ: signed 19-bit word displacement
        if words > 0x3_FFFF || words < -0x4_0000 {
            return Err(OpalError::Encoding {
                message: format!("branch displacement {} exceeds imm19 range", rel),
            });
        }
        (word & !(0x7FFFF << 5)) | ((words as u32 & 0x7FFFF) << 5)
    } else {
        return Err(OpalError::Encoding {
            message: format!("word {:#010X} at {} is not a patchable branch", word, site),
        });
    };

    code[site..site + 4].copy_from_slice(&patched.to_le_bytes());
    Ok(())
}

// =============================================================================
// Load/Store Instructions
// =============================================================================

/// LDR (immediate, unsigned offset) - Load register
/// Encodes: LDR Xt, [Xn, #offset], offset in bytes, 8-byte multiples
pub fn ldr_x_imm(buf: &mut Vec<u8>, rt: Reg64, rn: Reg64, offset: u16) {
    // LDR (64-bit): 11 111 0 01 01 imm12 Rn Rt
    let imm12 = (offset / 8) as u32;
    let insn = 0xF9400000 | (imm12 << 10) | ((rn.encoding() as u32) << 5) | (rt.encoding() as u32);
    emit(buf, insn);
}

/// STR (immediate, unsigned offset) - Store register
pub fn str_x_imm(buf: &mut Vec<u8>, rt: Reg64, rn: Reg64, offset: u16) {
    // STR (64-bit): 11 111 0 01 00 imm12 Rn Rt
    let imm12 = (offset / 8) as u32;
    let insn = 0xF9000000 | (imm12 << 10) | ((rn.encoding() as u32) << 5) | (rt.encoding() as u32);
    emit(buf, insn);
}

/// LDR Xt, [SP, #offset]
pub fn ldr_x_sp(buf: &mut Vec<u8>, rt: Reg64, offset: u16) {
    let imm12 = (offset / 8) as u32;
    let insn = 0xF9400000 | (imm12 << 10) | ((special::SP as u32) << 5) | (rt.encoding() as u32);
    emit(buf, insn);
}

/// STR Xt, [SP, #offset]
pub fn str_x_sp(buf: &mut Vec<u8>, rt: Reg64, offset: u16) {
    let imm12 = (offset / 8) as u32;
    let insn = 0xF9000000 | (imm12 << 10) | ((special::SP as u32) << 5) | (rt.encoding() as u32);
    emit(buf, insn);
}

/// STP - Store pair of registers to [SP, #offset]! (pre-index)
pub fn stp_pre_sp(buf: &mut Vec<u8>, rt1: Reg64, rt2: Reg64, offset: i16) {
    // STP (pre-index, 64-bit): 10 101 0 011 imm7 Rt2 Rn Rt
    let imm7 = ((offset / 8) as u32) & 0x7F;
    let insn = 0xA9800000
        | (imm7 << 15)
        | ((rt2.encoding() as u32) << 10)
        | ((special::SP as u32) << 5)
        | (rt1.encoding() as u32);
    emit(buf, insn);
}

/// LDP - Load pair of registers from [SP], #offset (post-index)
pub fn ldp_post_sp(buf: &mut Vec<u8>, rt1: Reg64, rt2: Reg64, offset: i16) {
    // LDP (post-index, 64-bit): 10 101 0 001 imm7 Rt2 Rn Rt
    let imm7 = ((offset / 8) as u32) & 0x7F;
    let insn = 0xA8C00000
        | (imm7 << 15)
        | ((rt2.encoding() as u32) << 10)
        | ((special::SP as u32) << 5)
        | (rt1.encoding() as u32);
    emit(buf, insn);
}

// =============================================================================
// System Instructions
// =============================================================================

/// SVC - Supervisor call (system call)
pub fn svc(buf: &mut Vec<u8>, imm16: u16) {
    // SVC: 11010100 000 imm16 00001
    let insn = 0xD4000001 | ((imm16 as u32) << 5);
    emit(buf, insn);
}

/// NOP - No operation
pub fn nop(buf: &mut Vec<u8>) {
    // NOP: 11010101 00000011 00100000 00011111
    emit(buf, 0xD503201F);
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Load a 64-bit immediate value into a register
/// Uses MOVZ + MOVK sequence
pub fn load_imm64(buf: &mut Vec<u8>, rd: Reg64, value: u64) {
    if value == 0 {
        // MOV Xd, XZR via ORR Xd, XZR, XZR
        let insn = 0xAA1F03E0 | (rd.encoding() as u32);
        emit(buf, insn);
        return;
    }

    let mut first = true;
    for shift in (0..64).step_by(16) {
        let imm16 = ((value >> shift) & 0xFFFF) as u16;
        if imm16 != 0 {
            if first {
                movz_x(buf, rd, imm16, shift as u8);
                first = false;
            } else {
                movk_x(buf, rd, imm16, shift as u8);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(buf: &[u8], index: usize) -> u32 {
        u32::from_le_bytes(buf[index * 4..index * 4 + 4].try_into().unwrap())
    }

    #[test]
    fn test_movz_x() {
        let mut buf = Vec::new();
        movz_x(&mut buf, Reg64::X0, 42, 0);
        assert_eq!(buf.len(), 4);
        // MOVZ X0, #42 = 0xD2800540
        assert_eq!(word(&buf, 0), 0xD2800540);
    }

    #[test]
    fn test_add_x() {
        let mut buf = Vec::new();
        add_x(&mut buf, Reg64::X0, Reg64::X1, Reg64::X2);
        // ADD X0, X1, X2 = 0x8B020020
        assert_eq!(word(&buf, 0), 0x8B020020);
    }

    #[test]
    fn test_ret() {
        let mut buf = Vec::new();
        ret(&mut buf);
        // RET (X30) = 0xD65F03C0
        assert_eq!(word(&buf, 0), 0xD65F03C0);
    }

    #[test]
    fn test_svc() {
        let mut buf = Vec::new();
        svc(&mut buf, 0);
        // SVC #0 = 0xD4000001
        assert_eq!(word(&buf, 0), 0xD4000001);
    }

    #[test]
    fn test_frame_sequence() {
        let mut buf = Vec::new();
        stp_pre_sp(&mut buf, Reg64::X29, Reg64::X30, -16);
        mov_x_sp(&mut buf, Reg64::X29);
        ldp_post_sp(&mut buf, Reg64::X29, Reg64::X30, 16);
        // STP X29, X30, [SP, #-16]! = 0xA9BF7BFD
        assert_eq!(word(&buf, 0), 0xA9BF7BFD);
        // MOV X29, SP = 0x910003FD
        assert_eq!(word(&buf, 1), 0x910003FD);
        // LDP X29, X30, [SP], #16 = 0xA8C17BFD
        assert_eq!(word(&buf, 2), 0xA8C17BFD);
    }

    #[test]
    fn test_neg_x() {
        let mut buf = Vec::new();
        neg_x(&mut buf, Reg64::X0, Reg64::X1);
        // NEG X0, X1 = SUB X0, XZR, X1 = 0xCB0103E0
        assert_eq!(word(&buf, 0), 0xCB0103E0);
    }

    #[test]
    fn test_load_imm64_small() {
        let mut buf = Vec::new();
        load_imm64(&mut buf, Reg64::X0, 42);
        assert_eq!(buf.len(), 4); // Single MOVZ instruction
    }

    #[test]
    fn test_load_imm64_large() {
        let mut buf = Vec::new();
        load_imm64(&mut buf, Reg64::X0, 0x123456789ABCDEF0);
        // MOVZ + 3 MOVK = 4 instructions
        assert_eq!(buf.len(), 16);
    }

    #[test]
    fn test_load_imm64_round_trips_float_bits() {
        let mut buf = Vec::new();
        load_imm64(&mut buf, Reg64::X0, 123.456f64.to_bits());
        // Reassembling the MOVZ/MOVK immediates restores the bit pattern
        // (skipped halfwords are zero by construction)
        let mut value: u64 = 0;
        for i in 0..buf.len() / 4 {
            let w = word(&buf, i);
            assert_eq!(w & 0x9F80_0000, 0x9280_0000); // move-wide family
            let hw = (w >> 21) & 0x3;
            let imm16 = ((w >> 5) & 0xFFFF) as u64;
            value |= imm16 << (16 * hw);
        }
        assert_eq!(f64::from_bits(value), 123.456);
    }

    #[test]
    fn test_condition_invert() {
        assert_eq!(Condition::EQ.invert(), Condition::NE);
        assert_eq!(Condition::NE.invert(), Condition::EQ);
        assert_eq!(Condition::LT.invert(), Condition::GE);
        assert_eq!(Condition::GE.invert(), Condition::LT);
    }

    #[test]
    fn test_patch_unconditional_branch() {
        let mut buf = Vec::new();
        b(&mut buf, 0);
        patch_branch(&mut buf, 0, 16).unwrap();
        // Opcode bits survive, imm26 carries the word offset
        let patched = word(&buf, 0);
        assert_eq!(patched & 0xFC000000, 0x14000000);
        assert_eq!(patched & 0x03FFFFFF, 4);
    }

    #[test]
    fn test_patch_conditional_branch_backward() {
        let mut buf = Vec::new();
        b_cond(&mut buf, Condition::EQ, 0);
        patch_branch(&mut buf, 0, -8).unwrap();
        let patched = word(&buf, 0);
        assert_eq!(patched >> 24, 0x54);
        // Condition bits are preserved
        assert_eq!(patched & 0xF, Condition::EQ as u32);
        // imm19 = -2 in two's complement
        assert_eq!((patched >> 5) & 0x7FFFF, 0x7FFFE);
    }

    #[test]
    fn test_patch_rejects_unaligned() {
        let mut buf = Vec::new();
        b(&mut buf, 0);
        assert!(patch_branch(&mut buf, 0, 6).is_err());
    }

    #[test]
    fn test_patch_rejects_non_branch() {
        let mut buf = Vec::new();
        nop(&mut buf);
        assert!(patch_branch(&mut buf, 0, 8).is_err());
    }
}
