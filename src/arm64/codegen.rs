//! ARM64 Code Generation
//!
//! Walks IR basic blocks and drives the fixed-width instruction encoders.
//! Branch targets are patched in place after a function's blocks are
//! emitted, with the patcher re-encoding the immediate field that matches
//! the original instruction word. Calls between IR functions are patched
//! after the whole module; runtime symbols become CALL26 relocations.
//!
//! Every frame reserves a 256-byte block for the interpreter's sixteen
//! global slots, addressed at fixed SP offsets.

use std::collections::HashMap;

use log::debug;

use crate::ir::{Const, FuncId, Function, Instruction, Label, Module, Opcode, Value};
use crate::object::{CompiledModule, Machine, RelocKind, Relocation, Symbol};
use crate::{OpalError, Result};

use super::encoding::{self, Condition};
use super::regalloc::{Allocation, GLOBAL_SLOT_COUNT};
use super::registers::calling_convention::{ARGUMENT_REGS, RETURN_REG};
use super::registers::{Reg64, SCRATCH_REG, SCRATCH_REG2};

/// ARM64 code generator
pub struct Arm64Codegen {
    code: Vec<u8>,
    /// Function index -> code offset of each emitted function
    func_offsets: HashMap<usize, usize>,
    /// Pending sibling-call patches: (instruction offset, callee)
    call_patches: Vec<(usize, FuncId)>,
    /// External relocations for the object writer
    relocations: Vec<Relocation>,
    /// Per-function: block label -> code offset
    labels: HashMap<Label, usize>,
    /// Per-function branch fixups: (instruction offset, target label)
    jump_fixups: Vec<(usize, Label)>,
}

impl Default for Arm64Codegen {
    fn default() -> Self {
        Self::new()
    }
}

impl Arm64Codegen {
    pub fn new() -> Self {
        Self {
            code: Vec::with_capacity(4096),
            func_offsets: HashMap::new(),
            call_patches: Vec::new(),
            relocations: Vec::new(),
            labels: HashMap::new(),
            jump_fixups: Vec::new(),
        }
    }

    /// Compile every function in the module
    pub fn compile(mut self, module: &Module) -> Result<CompiledModule> {
        for (index, func) in module.functions.iter().enumerate() {
            self.compile_function(FuncId(index), func)?;
        }
        self.apply_call_patches()?;

        let end = self.code.len();
        let mut symbols = Vec::with_capacity(module.functions.len());
        for (index, func) in module.functions.iter().enumerate() {
            let offset = self.func_offsets[&index];
            let next = module
                .functions
                .iter()
                .enumerate()
                .filter_map(|(i, _)| self.func_offsets.get(&i).copied())
                .filter(|&o| o > offset)
                .min()
                .unwrap_or(end);
            symbols.push(Symbol {
                name: func.name.clone(),
                offset,
                size: next - offset,
            });
        }

        Ok(CompiledModule {
            machine: Machine::Arm64,
            code: self.code,
            symbols,
            relocations: self.relocations,
        })
    }

    fn compile_function(&mut self, id: FuncId, func: &Function) -> Result<()> {
        self.labels.clear();
        self.jump_fixups.clear();

        let alloc = Allocation::run(func);
        let frame_size = alloc.frame_size();
        // SUB SP, SP, #imm only reaches 4095 without a shifted form
        if frame_size > 4095 {
            return Err(OpalError::Codegen {
                message: format!("frame too large in '{}': {} bytes", func.name, frame_size),
            });
        }
        debug!(
            "arm64 codegen '{}': frame {} bytes, {} blocks",
            func.name,
            frame_size,
            func.blocks.len()
        );

        self.func_offsets.insert(id.0, self.code.len());
        self.emit_prologue(func, &alloc, frame_size as u16);

        for block in &func.blocks {
            self.labels.insert(block.label, self.code.len());
            for insn in &block.instructions {
                self.emit_instruction(func, insn, &alloc)?;
            }
        }

        self.apply_jump_fixups(&func.name)
    }

    fn emit_prologue(&mut self, func: &Function, alloc: &Allocation, frame_size: u16) {
        encoding::stp_pre_sp(&mut self.code, Reg64::X29, Reg64::X30, -16);
        encoding::mov_x_sp(&mut self.code, Reg64::X29);
        if frame_size > 0 {
            encoding::sub_sp_imm(&mut self.code, frame_size);
        }
        for (i, &reg) in alloc.used_callee_saved().iter().enumerate() {
            encoding::str_x_sp(&mut self.code, reg, alloc.saved_offset(i));
        }
        // Incoming parameters land in local slots 1..=arity (slot 0 holds
        // the callee value in the interpreter's frame layout).
        for i in 0..func.arity as usize {
            let offset = alloc.local_offset(i as u32 + 1);
            if i < ARGUMENT_REGS.len() {
                encoding::str_x_sp(&mut self.code, ARGUMENT_REGS[i], offset);
            } else {
                // Stack parameter: above the saved FP/LR pair, one
                // 16-byte slot per argument
                let incoming = (16 + 16 * (i - ARGUMENT_REGS.len())) as u16;
                encoding::ldr_x_imm(&mut self.code, SCRATCH_REG, Reg64::X29, incoming);
                encoding::str_x_sp(&mut self.code, SCRATCH_REG, offset);
            }
        }
    }

    fn emit_epilogue(&mut self, alloc: &Allocation, frame_size: u16) {
        for (i, &reg) in alloc.used_callee_saved().iter().enumerate() {
            encoding::ldr_x_sp(&mut self.code, reg, alloc.saved_offset(i));
        }
        if frame_size > 0 {
            encoding::add_sp_imm(&mut self.code, frame_size);
        }
        encoding::ldp_post_sp(&mut self.code, Reg64::X29, Reg64::X30, 16);
        encoding::ret(&mut self.code);
    }

    fn emit_instruction(
        &mut self,
        func: &Function,
        insn: &Instruction,
        alloc: &Allocation,
    ) -> Result<()> {
        match insn.op {
            Opcode::ConstInt
            | Opcode::ConstFloat
            | Opcode::ConstBool
            | Opcode::ConstNil
            | Opcode::Move => {
                self.load_into(SCRATCH_REG, &insn.operands[0], alloc)?;
                self.store_dest(insn, SCRATCH_REG, alloc);
            }
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div => {
                self.load_into(SCRATCH_REG, &insn.operands[0], alloc)?;
                let rhs = self.value_reg(&insn.operands[1], SCRATCH_REG2, alloc)?;
                match insn.op {
                    Opcode::Add => encoding::add_x(&mut self.code, SCRATCH_REG, SCRATCH_REG, rhs),
                    Opcode::Sub => encoding::sub_x(&mut self.code, SCRATCH_REG, SCRATCH_REG, rhs),
                    Opcode::Mul => encoding::mul_x(&mut self.code, SCRATCH_REG, SCRATCH_REG, rhs),
                    _ => encoding::sdiv_x(&mut self.code, SCRATCH_REG, SCRATCH_REG, rhs),
                }
                self.store_dest(insn, SCRATCH_REG, alloc);
            }
            Opcode::Neg => {
                self.load_into(SCRATCH_REG, &insn.operands[0], alloc)?;
                encoding::neg_x(&mut self.code, SCRATCH_REG, SCRATCH_REG);
                self.store_dest(insn, SCRATCH_REG, alloc);
            }
            Opcode::Eq | Opcode::Ne | Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
                self.load_into(SCRATCH_REG, &insn.operands[0], alloc)?;
                let rhs = self.value_reg(&insn.operands[1], SCRATCH_REG2, alloc)?;
                encoding::cmp_x(&mut self.code, SCRATCH_REG, rhs);
                let cond = match insn.op {
                    Opcode::Eq => Condition::EQ,
                    Opcode::Ne => Condition::NE,
                    Opcode::Lt => Condition::LT,
                    Opcode::Le => Condition::LE,
                    Opcode::Gt => Condition::GT,
                    _ => Condition::GE,
                };
                encoding::cset_x(&mut self.code, SCRATCH_REG, cond);
                self.store_dest(insn, SCRATCH_REG, alloc);
            }
            Opcode::Not => {
                self.load_into(SCRATCH_REG, &insn.operands[0], alloc)?;
                encoding::cmp_imm_x(&mut self.code, SCRATCH_REG, 0);
                encoding::cset_x(&mut self.code, SCRATCH_REG, Condition::EQ);
                self.store_dest(insn, SCRATCH_REG, alloc);
            }
            Opcode::LoadLocal => {
                let slot = const_index(&insn.operands[0]);
                encoding::ldr_x_sp(&mut self.code, SCRATCH_REG, alloc.local_offset(slot));
                self.store_dest(insn, SCRATCH_REG, alloc);
            }
            Opcode::StoreLocal => {
                let slot = const_index(&insn.operands[0]);
                let src = self.value_reg(&insn.operands[1], SCRATCH_REG, alloc)?;
                encoding::str_x_sp(&mut self.code, src, alloc.local_offset(slot));
            }
            Opcode::LoadGlobal => {
                let slot = const_index(&insn.operands[0]);
                if slot < GLOBAL_SLOT_COUNT {
                    encoding::ldr_x_sp(&mut self.code, SCRATCH_REG, alloc.global_offset(slot));
                    self.store_dest(insn, SCRATCH_REG, alloc);
                } else {
                    self.emit_helper_call(insn, "opal_rt_get_global", &insn.operands, alloc)?;
                }
            }
            Opcode::StoreGlobal => {
                let slot = const_index(&insn.operands[0]);
                if slot < GLOBAL_SLOT_COUNT {
                    let src = self.value_reg(&insn.operands[1], SCRATCH_REG, alloc)?;
                    encoding::str_x_sp(&mut self.code, src, alloc.global_offset(slot));
                } else {
                    self.emit_helper_call(insn, "opal_rt_set_global", &insn.operands, alloc)?;
                }
            }
            Opcode::LoadUpvalue => {
                self.emit_helper_call(insn, "opal_rt_get_upvalue", &insn.operands, alloc)?;
            }
            Opcode::StoreUpvalue => {
                self.emit_helper_call(insn, "opal_rt_set_upvalue", &insn.operands, alloc)?;
            }
            Opcode::GetProperty => {
                self.emit_helper_call(insn, "opal_rt_get_property", &insn.operands, alloc)?;
            }
            Opcode::SetProperty => {
                self.emit_helper_call(insn, "opal_rt_set_property", &insn.operands, alloc)?;
            }
            Opcode::GetIndex => {
                self.emit_helper_call(insn, "opal_rt_get_index", &insn.operands, alloc)?;
            }
            Opcode::SetIndex => {
                self.emit_helper_call(insn, "opal_rt_set_index", &insn.operands, alloc)?;
            }
            Opcode::NewClosure => {
                self.emit_helper_call(insn, "opal_rt_new_closure", &insn.operands, alloc)?;
            }
            Opcode::Print => {
                self.emit_helper_call(insn, "opal_rt_print", &insn.operands, alloc)?;
            }
            Opcode::Jump => {
                if let Value::Label(label) = insn.operands[0] {
                    let site = self.code.len();
                    encoding::b(&mut self.code, 0);
                    self.jump_fixups.push((site, label));
                }
            }
            Opcode::JumpIfFalse => {
                self.load_into(SCRATCH_REG, &insn.operands[0], alloc)?;
                if let Value::Label(label) = insn.operands[1] {
                    let site = self.code.len();
                    encoding::cbz_x(&mut self.code, SCRATCH_REG, 0);
                    self.jump_fixups.push((site, label));
                }
            }
            Opcode::Return => {
                self.move_to_return_reg(&insn.operands[0], alloc)?;
                self.emit_epilogue(alloc, alloc.frame_size() as u16);
            }
            Opcode::Call => {
                let stack_bytes = self.marshal_args(&insn.args, alloc)?;
                let site = self.code.len();
                encoding::bl(&mut self.code, 0);
                match insn.callee {
                    Some(Value::Func(id)) => self.call_patches.push((site, id)),
                    _ => {
                        return Err(OpalError::Codegen {
                            message: format!("direct call without function target in '{}'", func.name),
                        })
                    }
                }
                if stack_bytes > 0 {
                    encoding::add_sp_imm(&mut self.code, stack_bytes);
                }
                self.store_dest(insn, RETURN_REG, alloc);
            }
            Opcode::RuntimeCall => {
                let symbol = insn.symbol.clone().unwrap_or_else(|| "opal_rt_op".to_string());
                let stack_bytes = self.marshal_args(&insn.args, alloc)?;
                self.emit_external_call(&symbol);
                if stack_bytes > 0 {
                    encoding::add_sp_imm(&mut self.code, stack_bytes);
                }
                self.store_dest(insn, RETURN_REG, alloc);
            }
            Opcode::Phi => {
                // Never produced by the builder; keep the buffer well-formed
                encoding::nop(&mut self.code);
            }
        }
        Ok(())
    }

    /// Marshal call arguments per AAPCS64: the first eight in X0-X7, the
    /// rest in 16-byte-aligned stack slots below SP.
    /// Returns the number of stack bytes claimed.
    fn marshal_args(&mut self, args: &[Value], alloc: &Allocation) -> Result<u16> {
        let extra = args.len().saturating_sub(ARGUMENT_REGS.len());
        let stack_bytes = (extra * 16) as u16;
        if stack_bytes > 0 {
            encoding::sub_sp_imm(&mut self.code, stack_bytes);
        }
        for (i, arg) in args.iter().enumerate().skip(ARGUMENT_REGS.len()) {
            self.load_arg(SCRATCH_REG, arg, alloc, stack_bytes)?;
            let slot = ((i - ARGUMENT_REGS.len()) * 16) as u16;
            encoding::str_x_sp(&mut self.code, SCRATCH_REG, slot);
        }
        for (i, arg) in args.iter().take(ARGUMENT_REGS.len()).enumerate() {
            self.load_arg(ARGUMENT_REGS[i], arg, alloc, stack_bytes)?;
        }
        Ok(stack_bytes)
    }

    /// `load_into` for the marshaling window: spill slots are SP-relative,
    /// so reloads after the argument-area SUB compensate for the moved SP.
    fn load_arg(
        &mut self,
        dst: Reg64,
        value: &Value,
        alloc: &Allocation,
        sp_bias: u16,
    ) -> Result<()> {
        if sp_bias > 0 {
            if let Value::Reg { vreg, .. } = value {
                if let Some(slot) = alloc.spill_slot_of(*vreg) {
                    encoding::ldr_x_sp(&mut self.code, dst, alloc.spill_offset(slot) + sp_bias);
                    return Ok(());
                }
            }
        }
        self.load_into(dst, value, alloc)
    }

    /// Call helper: marshal plain operands and invoke a runtime symbol
    fn emit_helper_call(
        &mut self,
        insn: &Instruction,
        symbol: &str,
        args: &[Value],
        alloc: &Allocation,
    ) -> Result<()> {
        let stack_bytes = self.marshal_args(args, alloc)?;
        self.emit_external_call(symbol);
        if stack_bytes > 0 {
            encoding::add_sp_imm(&mut self.code, stack_bytes);
        }
        self.store_dest(insn, RETURN_REG, alloc);
        Ok(())
    }

    fn emit_external_call(&mut self, symbol: &str) {
        let site = self.code.len();
        encoding::bl(&mut self.code, 0);
        self.relocations.push(Relocation {
            offset: site,
            symbol: symbol.to_string(),
            kind: RelocKind::Arm64Call26,
            addend: 0,
        });
    }

    /// Copy a value into a specific register
    fn load_into(&mut self, dst: Reg64, value: &Value, alloc: &Allocation) -> Result<()> {
        match value {
            Value::Reg { vreg, .. } => {
                if let Some(slot) = alloc.spill_slot_of(*vreg) {
                    encoding::ldr_x_sp(&mut self.code, dst, alloc.spill_offset(slot));
                } else if let Some(reg) = alloc.register_of(*vreg) {
                    if reg != dst {
                        encoding::mov_x(&mut self.code, dst, reg);
                    }
                } else {
                    return Err(OpalError::Codegen {
                        message: format!("v{} has no assigned location", vreg.0),
                    });
                }
            }
            Value::Const(c) => self.materialize(dst, *c),
            Value::Func(id) => {
                // Function references are runtime handles, passed by index
                encoding::load_imm64(&mut self.code, dst, id.0 as u64);
            }
            Value::Invalid => {
                encoding::load_imm64(&mut self.code, dst, 0);
            }
            Value::Label(_) => {
                return Err(OpalError::Codegen {
                    message: "label used as data operand".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Register currently holding a value, reloading through `scratch`
    /// for spills and constants.
    fn value_reg(&mut self, value: &Value, scratch: Reg64, alloc: &Allocation) -> Result<Reg64> {
        if let Value::Reg { vreg, .. } = value {
            if alloc.spill_slot_of(*vreg).is_none() {
                if let Some(reg) = alloc.register_of(*vreg) {
                    return Ok(reg);
                }
            }
        }
        self.load_into(scratch, value, alloc)?;
        Ok(scratch)
    }

    fn materialize(&mut self, dst: Reg64, c: Const) {
        match c {
            Const::Int(v) => encoding::load_imm64(&mut self.code, dst, v as u64),
            Const::Float(v) => encoding::load_imm64(&mut self.code, dst, v.to_bits()),
            Const::Bool(v) => encoding::load_imm64(&mut self.code, dst, v as u64),
            Const::Nil => encoding::load_imm64(&mut self.code, dst, 0),
        }
    }

    /// Move `src` into the instruction's destination location
    fn store_dest(&mut self, insn: &Instruction, src: Reg64, alloc: &Allocation) {
        let Some((vreg, _)) = insn.def() else {
            return;
        };
        if let Some(slot) = alloc.spill_slot_of(vreg) {
            encoding::str_x_sp(&mut self.code, src, alloc.spill_offset(slot));
        } else if let Some(reg) = alloc.register_of(vreg) {
            if reg != src {
                encoding::mov_x(&mut self.code, reg, src);
            }
        }
    }

    /// Return values travel in X0; move only when the source differs
    fn move_to_return_reg(&mut self, value: &Value, alloc: &Allocation) -> Result<()> {
        if let Value::Reg { vreg, .. } = value {
            if alloc.spill_slot_of(*vreg).is_none() && alloc.register_of(*vreg) == Some(RETURN_REG) {
                return Ok(());
            }
        }
        self.load_into(RETURN_REG, value, alloc)
    }

    /// Resolve every recorded branch against the label offsets of the
    /// just-emitted function.
    fn apply_jump_fixups(&mut self, func_name: &str) -> Result<()> {
        for (site, label) in std::mem::take(&mut self.jump_fixups) {
            let target = *self.labels.get(&label).ok_or_else(|| OpalError::Codegen {
                message: format!("jump to unknown label L{} in '{}'", label.0, func_name),
            })?;
            let rel = target as i64 - site as i64;
            encoding::patch_branch(&mut self.code, site, rel)?;
        }
        Ok(())
    }

    /// Resolve sibling calls once every function's offset is known
    fn apply_call_patches(&mut self) -> Result<()> {
        for (site, id) in std::mem::take(&mut self.call_patches) {
            let target = *self
                .func_offsets
                .get(&id.0)
                .ok_or_else(|| OpalError::Codegen {
                    message: format!("call to unknown function #{}", id.0),
                })?;
            let rel = target as i64 - site as i64;
            encoding::patch_branch(&mut self.code, site, rel)?;
        }
        Ok(())
    }
}

/// Integer operand of a local/global/upvalue access
fn const_index(value: &Value) -> u32 {
    match value {
        Value::Const(Const::Int(v)) => *v as u32,
        _ => 0,
    }
}
