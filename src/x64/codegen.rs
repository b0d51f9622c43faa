//! x64 Code Generation
//!
//! Walks IR basic blocks, consults the register allocator, and drives the
//! instruction encoder. Intra-function jumps are patched once a function's
//! blocks are emitted; calls between IR functions are patched after the
//! whole module has been generated; calls to runtime symbols are recorded
//! as relocations for the object writer.

use std::collections::HashMap;

use log::debug;

use crate::ir::{Const, FuncId, Function, Instruction, Label, Module, Opcode, Value};
use crate::object::{CompiledModule, Machine, RelocKind, Relocation, Symbol};
use crate::{OpalError, Result};

use super::encoding::CodeBuffer;
use super::regalloc::Allocation;
use super::registers::{Reg64, SCRATCH_REG, SCRATCH_REG2, SYSV_ARG_REGS, SYSV_RET_REG};

/// Callee-saved registers pushed by every prologue, in push order
const SAVED_REGS: [Reg64; 5] = [Reg64::RBX, Reg64::R12, Reg64::R13, Reg64::R14, Reg64::R15];

/// x64 code generator
pub struct X64Codegen {
    code: CodeBuffer,
    /// Function index -> code offset of each emitted function
    func_offsets: HashMap<usize, usize>,
    /// Pending sibling-call patches: (displacement offset, callee)
    call_patches: Vec<(usize, FuncId)>,
    /// External relocations for the object writer
    relocations: Vec<Relocation>,
    /// Per-function: block label -> code offset
    labels: HashMap<Label, usize>,
    /// Per-function jump fixups: (displacement offset, target label)
    jump_fixups: Vec<(usize, Label)>,
}

impl Default for X64Codegen {
    fn default() -> Self {
        Self::new()
    }
}

impl X64Codegen {
    pub fn new() -> Self {
        Self {
            code: CodeBuffer::with_capacity(4096),
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

        let end = self.code.offset();
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
            machine: Machine::X86_64,
            code: self.code.into_code(),
            symbols,
            relocations: self.relocations,
        })
    }

    fn compile_function(&mut self, id: FuncId, func: &Function) -> Result<()> {
        self.labels.clear();
        self.jump_fixups.clear();

        let alloc = Allocation::run(func);
        let frame_size = alloc.frame_size();
        if frame_size > i32::MAX as u32 {
            return Err(OpalError::Codegen {
                message: format!("frame too large in '{}': {} bytes", func.name, frame_size),
            });
        }
        debug!(
            "x64 codegen '{}': frame {} bytes, {} blocks",
            func.name,
            frame_size,
            func.blocks.len()
        );

        self.func_offsets.insert(id.0, self.code.offset());
        self.emit_prologue(func, &alloc, frame_size as i32);

        for block in &func.blocks {
            self.labels.insert(block.label, self.code.offset());
            for insn in &block.instructions {
                self.emit_instruction(func, insn, &alloc)?;
            }
        }

        self.apply_jump_fixups(&func.name)
    }

    fn emit_prologue(&mut self, func: &Function, alloc: &Allocation, frame_size: i32) {
        self.code.push_r64(Reg64::RBP);
        self.code.mov_r64_r64(Reg64::RBP, Reg64::RSP);
        for reg in SAVED_REGS {
            self.code.push_r64(reg);
        }
        if frame_size > 0 {
            self.code.sub_r64_imm32(Reg64::RSP, frame_size);
        }
        // Incoming parameters land in local slots 1..=arity (slot 0 holds
        // the callee value in the interpreter's frame layout).
        for i in 0..func.arity as usize {
            let offset = alloc.local_offset(i as u32 + 1);
            if i < SYSV_ARG_REGS.len() {
                self.code.mov_mem_r64(Reg64::RBP, offset, SYSV_ARG_REGS[i]);
            } else {
                // Stack parameter: above the saved RBP and return address
                let incoming = 16 + 8 * (i - SYSV_ARG_REGS.len()) as i32;
                self.code.mov_r64_mem(SCRATCH_REG, Reg64::RBP, incoming);
                self.code.mov_mem_r64(Reg64::RBP, offset, SCRATCH_REG);
            }
        }
    }

    fn emit_epilogue(&mut self, frame_size: i32) {
        if frame_size > 0 {
            self.code.add_r64_imm32(Reg64::RSP, frame_size);
        }
        for reg in SAVED_REGS.iter().rev() {
            self.code.pop_r64(*reg);
        }
        self.code.pop_r64(Reg64::RBP);
        self.code.ret();
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
            Opcode::Add | Opcode::Sub | Opcode::Mul => {
                self.load_into(SCRATCH_REG, &insn.operands[0], alloc)?;
                let rhs = self.value_reg(&insn.operands[1], SCRATCH_REG2, alloc)?;
                match insn.op {
                    Opcode::Add => self.code.add_r64_r64(SCRATCH_REG, rhs),
                    Opcode::Sub => self.code.sub_r64_r64(SCRATCH_REG, rhs),
                    _ => self.code.imul_r64_r64(SCRATCH_REG, rhs),
                }
                self.store_dest(insn, SCRATCH_REG, alloc);
            }
            Opcode::Div => {
                // IDIV consumes RDX:RAX; RDX is never allocated
                self.load_into(Reg64::RAX, &insn.operands[0], alloc)?;
                self.load_into(SCRATCH_REG2, &insn.operands[1], alloc)?;
                self.code.cqo();
                self.code.idiv_r64(SCRATCH_REG2);
                self.store_dest(insn, Reg64::RAX, alloc);
            }
            Opcode::Neg => {
                self.load_into(SCRATCH_REG, &insn.operands[0], alloc)?;
                self.code.neg_r64(SCRATCH_REG);
                self.store_dest(insn, SCRATCH_REG, alloc);
            }
            Opcode::Eq | Opcode::Ne | Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
                self.load_into(SCRATCH_REG, &insn.operands[0], alloc)?;
                let rhs = self.value_reg(&insn.operands[1], SCRATCH_REG2, alloc)?;
                self.code.cmp_r64_r64(SCRATCH_REG, rhs);
                match insn.op {
                    Opcode::Eq => self.code.sete(SCRATCH_REG),
                    Opcode::Ne => self.code.setne(SCRATCH_REG),
                    Opcode::Lt => self.code.setl(SCRATCH_REG),
                    Opcode::Le => self.code.setle(SCRATCH_REG),
                    Opcode::Gt => self.code.setg(SCRATCH_REG),
                    _ => self.code.setge(SCRATCH_REG),
                }
                self.code.movzx_r64_r8(SCRATCH_REG, SCRATCH_REG);
                self.store_dest(insn, SCRATCH_REG, alloc);
            }
            Opcode::Not => {
                self.load_into(SCRATCH_REG, &insn.operands[0], alloc)?;
                self.code.cmp_r64_imm32(SCRATCH_REG, 0);
                self.code.sete(SCRATCH_REG);
                self.code.movzx_r64_r8(SCRATCH_REG, SCRATCH_REG);
                self.store_dest(insn, SCRATCH_REG, alloc);
            }
            Opcode::LoadLocal => {
                let slot = const_index(&insn.operands[0]);
                self.code
                    .mov_r64_mem(SCRATCH_REG, Reg64::RBP, alloc.local_offset(slot));
                self.store_dest(insn, SCRATCH_REG, alloc);
            }
            Opcode::StoreLocal => {
                let slot = const_index(&insn.operands[0]);
                let src = self.value_reg(&insn.operands[1], SCRATCH_REG, alloc)?;
                self.code
                    .mov_mem_r64(Reg64::RBP, alloc.local_offset(slot), src);
            }
            Opcode::LoadGlobal => {
                self.emit_helper_call(insn, "opal_rt_get_global", &insn.operands, alloc)?;
            }
            Opcode::StoreGlobal => {
                self.emit_helper_call(insn, "opal_rt_set_global", &insn.operands, alloc)?;
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
                    let patch = self.code.jmp_rel32();
                    self.jump_fixups.push((patch, label));
                }
            }
            Opcode::JumpIfFalse => {
                self.load_into(SCRATCH_REG, &insn.operands[0], alloc)?;
                self.code.cmp_r64_imm32(SCRATCH_REG, 0);
                if let Value::Label(label) = insn.operands[1] {
                    let patch = self.code.je_rel32();
                    self.jump_fixups.push((patch, label));
                }
            }
            Opcode::Return => {
                self.move_to_return_reg(&insn.operands[0], alloc)?;
                self.emit_epilogue(alloc.frame_size() as i32);
            }
            Opcode::Call => {
                let stack_args = self.marshal_args(&insn.args, alloc)?;
                let patch = self.code.call_rel32();
                match insn.callee {
                    Some(Value::Func(id)) => self.call_patches.push((patch, id)),
                    _ => {
                        return Err(OpalError::Codegen {
                            message: format!("direct call without function target in '{}'", func.name),
                        })
                    }
                }
                if stack_args > 0 {
                    self.code.add_r64_imm32(Reg64::RSP, (stack_args * 8) as i32);
                }
                self.store_dest(insn, SYSV_RET_REG, alloc);
            }
            Opcode::RuntimeCall => {
                let symbol = insn.symbol.clone().unwrap_or_else(|| "opal_rt_op".to_string());
                let stack_args = self.marshal_args(&insn.args, alloc)?;
                self.emit_external_call(&symbol);
                if stack_args > 0 {
                    self.code.add_r64_imm32(Reg64::RSP, (stack_args * 8) as i32);
                }
                self.store_dest(insn, SYSV_RET_REG, alloc);
            }
            Opcode::Phi => {
                // Never produced by the builder; keep the buffer well-formed
                self.code.nop();
            }
        }
        Ok(())
    }

    /// Marshal call arguments per the System V ABI: the first six in
    /// RDI/RSI/RDX/RCX/R8/R9, the rest pushed right-to-left.
    /// Returns the number of stack slots to reclaim after the call.
    fn marshal_args(&mut self, args: &[Value], alloc: &Allocation) -> Result<usize> {
        for (i, arg) in args.iter().take(SYSV_ARG_REGS.len()).enumerate() {
            self.load_into(SYSV_ARG_REGS[i], arg, alloc)?;
        }
        let mut stack_args = args.len().saturating_sub(SYSV_ARG_REGS.len());
        if stack_args % 2 == 1 {
            // An odd push count would leave RSP off its 16-byte boundary
            self.code.sub_r64_imm32(Reg64::RSP, 8);
            stack_args += 1;
        }
        for arg in args.iter().skip(SYSV_ARG_REGS.len()).rev() {
            self.load_into(SCRATCH_REG, arg, alloc)?;
            self.code.push_r64(SCRATCH_REG);
        }
        Ok(stack_args)
    }

    /// Call helper: marshal plain operands and invoke a runtime symbol
    fn emit_helper_call(
        &mut self,
        insn: &Instruction,
        symbol: &str,
        args: &[Value],
        alloc: &Allocation,
    ) -> Result<()> {
        let stack_args = self.marshal_args(args, alloc)?;
        self.emit_external_call(symbol);
        if stack_args > 0 {
            self.code.add_r64_imm32(Reg64::RSP, (stack_args * 8) as i32);
        }
        self.store_dest(insn, SYSV_RET_REG, alloc);
        Ok(())
    }

    fn emit_external_call(&mut self, symbol: &str) {
        let patch = self.code.call_rel32();
        self.relocations.push(Relocation {
            offset: patch,
            symbol: symbol.to_string(),
            kind: RelocKind::X64Plt32,
            addend: -4,
        });
    }

    /// Copy a value into a specific register
    fn load_into(&mut self, dst: Reg64, value: &Value, alloc: &Allocation) -> Result<()> {
        match value {
            Value::Reg { vreg, .. } => {
                if let Some(slot) = alloc.spill_slot_of(*vreg) {
                    self.code
                        .mov_r64_mem(dst, Reg64::RBP, alloc.spill_offset(slot));
                } else if let Some(reg) = alloc.register_of(*vreg) {
                    if reg != dst {
                        self.code.mov_r64_r64(dst, reg);
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
                self.code.mov_r64_imm32(dst, id.0 as i32);
            }
            Value::Invalid => {
                self.code.xor_r64_r64(dst, dst);
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
            Const::Int(v) => {
                if v >= i32::MIN as i64 && v <= i32::MAX as i64 {
                    self.code.mov_r64_imm32(dst, v as i32);
                } else {
                    self.code.mov_r64_imm64(dst, v as u64);
                }
            }
            Const::Float(v) => self.code.mov_r64_imm64(dst, v.to_bits()),
            Const::Bool(v) => self.code.mov_r64_imm32(dst, v as i32),
            Const::Nil => self.code.xor_r64_r64(dst, dst),
        }
    }

    /// Move `src` into the instruction's destination location
    fn store_dest(&mut self, insn: &Instruction, src: Reg64, alloc: &Allocation) {
        let Some((vreg, _)) = insn.def() else {
            return;
        };
        if let Some(slot) = alloc.spill_slot_of(vreg) {
            self.code
                .mov_mem_r64(Reg64::RBP, alloc.spill_offset(slot), src);
        } else if let Some(reg) = alloc.register_of(vreg) {
            if reg != src {
                self.code.mov_r64_r64(reg, src);
            }
        }
    }

    /// Return values travel in RAX; move only when the source differs
    fn move_to_return_reg(&mut self, value: &Value, alloc: &Allocation) -> Result<()> {
        if let Value::Reg { vreg, .. } = value {
            if alloc.spill_slot_of(*vreg).is_none() && alloc.register_of(*vreg) == Some(SYSV_RET_REG)
            {
                return Ok(());
            }
        }
        self.load_into(SYSV_RET_REG, value, alloc)
    }

    /// Resolve every recorded jump against the label offsets of the
    /// just-emitted function.
    fn apply_jump_fixups(&mut self, func_name: &str) -> Result<()> {
        for (patch, label) in std::mem::take(&mut self.jump_fixups) {
            let target = *self.labels.get(&label).ok_or_else(|| OpalError::Codegen {
                message: format!("jump to unknown label L{} in '{}'", label.0, func_name),
            })?;
            let rel = target as i64 - (patch as i64 + 4);
            if rel > i32::MAX as i64 || rel < i32::MIN as i64 {
                return Err(OpalError::Encoding {
                    message: format!("jump displacement {} out of range", rel),
                });
            }
            self.code.patch_i32(patch, rel as i32);
        }
        Ok(())
    }

    /// Resolve sibling calls once every function's offset is known
    fn apply_call_patches(&mut self) -> Result<()> {
        for (patch, id) in std::mem::take(&mut self.call_patches) {
            let target = *self
                .func_offsets
                .get(&id.0)
                .ok_or_else(|| OpalError::Codegen {
                    message: format!("call to unknown function #{}", id.0),
                })?;
            let rel = target as i64 - (patch as i64 + 4);
            if rel > i32::MAX as i64 || rel < i32::MIN as i64 {
                return Err(OpalError::Encoding {
                    message: format!("call displacement {} out of range", rel),
                });
            }
            self.code.patch_i32(patch, rel as i32);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Builder, SizeClass};
    use crate::bytecode::{Constant, Function as BcFunction, OpCode};

    fn compile_bytecode(func: &BcFunction) -> CompiledModule {
        let module = Builder::build(func, "test.opal");
        X64Codegen::new().compile(&module).unwrap()
    }

    #[test]
    fn test_prologue_bytes() {
        let mut func = BcFunction::new("main", 0);
        let idx = func.chunk.add_constant(Constant::Number(10.0));
        func.chunk.write_op(OpCode::Constant, 1);
        func.chunk.write(idx as u8, 1);
        let idx = func.chunk.add_constant(Constant::Number(20.0));
        func.chunk.write_op(OpCode::Constant, 1);
        func.chunk.write(idx as u8, 1);
        func.chunk.write_op(OpCode::Add, 1);
        func.chunk.write_op(OpCode::Print, 1);
        func.chunk.write_op(OpCode::Nil, 1);
        func.chunk.write_op(OpCode::Return, 1);

        let compiled = compile_bytecode(&func);
        assert!(!compiled.code.is_empty());
        // push rbp; mov rbp, rsp
        assert_eq!(&compiled.code[0..4], &[0x55, 0x48, 0x89, 0xE5]);
        // Print became an external relocation
        assert_eq!(compiled.relocations.len(), 1);
        assert_eq!(compiled.relocations[0].symbol, "opal_rt_print");
        assert_eq!(compiled.relocations[0].kind, RelocKind::X64Plt32);
    }

    #[test]
    fn test_jump_patches_resolved() {
        let mut func = BcFunction::new("main", 0);
        let idx = func.chunk.add_constant(Constant::Number(1.0));
        func.chunk.write_op(OpCode::True, 1);
        func.chunk.write_op(OpCode::JumpIfFalse, 1);
        func.chunk.write(0, 1);
        func.chunk.write(4, 1);
        func.chunk.write_op(OpCode::Pop, 1);
        func.chunk.write_op(OpCode::Constant, 1);
        func.chunk.write(idx as u8, 1);
        func.chunk.write_op(OpCode::Print, 1);
        func.chunk.write_op(OpCode::Nil, 1);
        func.chunk.write_op(OpCode::Return, 1);

        let compiled = compile_bytecode(&func);
        // No zeroed JE displacement survives: find 0F 84 and check the rel32
        let code = &compiled.code;
        let je = code
            .windows(2)
            .position(|w| w == [0x0F, 0x84])
            .expect("je emitted");
        let rel = i32::from_le_bytes(code[je + 2..je + 6].try_into().unwrap());
        assert!(rel > 0);
    }

    #[test]
    fn test_eight_arg_marshaling_order() {
        // Build IR directly: one runtime call with eight constant arguments
        let mut ir_func = crate::ir::Function::new("main", 0);
        let args: Vec<Value> = (1..=8).map(|i| Value::Const(Const::Int(i))).collect();
        let dest = ir_func.alloc_vreg(SizeClass::Word);
        ir_func.emit(Instruction::runtime_call(Some(dest), "callee", args));
        ir_func.emit(Instruction::new(Opcode::Return, vec![dest]));
        let mut module = Module::new("test.opal");
        module.functions.push(ir_func);

        let compiled = X64Codegen::new().compile(&module).unwrap();
        let code = &compiled.code;

        // First six go to RDI, RSI, RDX, RCX, R8, R9 as mov r64, imm32
        let mov_rdi = [0x48, 0xC7, 0xC7, 0x01, 0x00, 0x00, 0x00];
        assert!(code.windows(7).any(|w| w == mov_rdi));
        let mov_r9 = [0x49, 0xC7, 0xC1, 0x06, 0x00, 0x00, 0x00];
        assert!(code.windows(7).any(|w| w == mov_r9));

        // Arguments 8 then 7 are materialized into RAX and pushed, so the
        // imm 8 sequence appears before the imm 7 sequence.
        let mov_rax_8 = [0x48, 0xC7, 0xC0, 0x08, 0x00, 0x00, 0x00];
        let mov_rax_7 = [0x48, 0xC7, 0xC0, 0x07, 0x00, 0x00, 0x00];
        let pos8 = code.windows(7).position(|w| w == mov_rax_8).unwrap();
        let pos7 = code.windows(7).position(|w| w == mov_rax_7).unwrap();
        assert!(pos8 < pos7);
        // Two pushes of RAX
        let pushes = code[pos8..].iter().filter(|&&b| b == 0x50).count();
        assert!(pushes >= 2);
    }

    #[test]
    fn test_sibling_call_patched() {
        let mut inner = BcFunction::new("helper", 0);
        inner.chunk.write_op(OpCode::Nil, 1);
        inner.chunk.write_op(OpCode::Return, 1);

        let mut outer = BcFunction::new("main", 0);
        let idx = outer.chunk.add_constant(Constant::Function(inner));
        outer.chunk.write_op(OpCode::Closure, 1);
        outer.chunk.write(idx as u8, 1);
        outer.chunk.write(0, 1);
        outer.chunk.write_op(OpCode::Call, 1);
        outer.chunk.write(0, 1);
        outer.chunk.write_op(OpCode::Return, 1);

        let compiled = compile_bytecode(&outer);
        assert_eq!(compiled.symbols.len(), 2);
        let helper = compiled.find_symbol("helper").unwrap();

        // The call displacement resolves to helper's offset
        let call = compiled
            .code
            .iter()
            .position(|&b| b == 0xE8)
            .expect("call emitted");
        let rel = i32::from_le_bytes(compiled.code[call + 1..call + 5].try_into().unwrap());
        let target = (call as i64 + 5 + rel as i64) as usize;
        assert_eq!(target, helper.offset);
    }

    #[test]
    fn test_parameter_store_clears_save_area() {
        let mut func = BcFunction::new("id", 1);
        func.chunk.write_op(OpCode::GetLocal, 1);
        func.chunk.write(1, 1);
        func.chunk.write_op(OpCode::Return, 1);

        let compiled = compile_bytecode(&func);
        // Slot 1 sits below the five pushed callee-saved registers:
        // mov [rbp-56], rdi
        let store = [0x48, 0x89, 0xBD, 0xC8, 0xFF, 0xFF, 0xFF];
        assert!(compiled.code.windows(7).any(|w| w == store));
        // The old layout stored at rbp-16, inside saved R12's slot
        let clobber = [0x48, 0x89, 0xBD, 0xF0, 0xFF, 0xFF, 0xFF];
        assert!(!compiled.code.windows(7).any(|w| w == clobber));
    }

    #[test]
    fn test_odd_stack_args_padded() {
        // Seven constant arguments: one stack push plus one pad slot
        let mut ir_func = crate::ir::Function::new("main", 0);
        let args: Vec<Value> = (1..=7).map(|i| Value::Const(Const::Int(i))).collect();
        let dest = ir_func.alloc_vreg(SizeClass::Word);
        ir_func.emit(Instruction::runtime_call(Some(dest), "callee", args));
        ir_func.emit(Instruction::new(Opcode::Return, vec![dest]));
        let mut module = Module::new("test.opal");
        module.functions.push(ir_func);

        let compiled = X64Codegen::new().compile(&module).unwrap();
        let code = &compiled.code;
        // sub rsp, 8 appears for the pad (the prologue frame is also 8)
        let sub_rsp_8 = [0x48, 0x81, 0xEC, 0x08, 0x00, 0x00, 0x00];
        let subs = code.windows(7).filter(|w| *w == sub_rsp_8).count();
        assert_eq!(subs, 2);
        // Both slots are reclaimed together: add rsp, 16
        let add_rsp_16 = [0x48, 0x81, 0xC4, 0x10, 0x00, 0x00, 0x00];
        assert!(code.windows(7).any(|w| w == add_rsp_16));
    }

    #[test]
    fn test_return_value_in_rax() {
        let mut func = BcFunction::new("main", 0);
        let idx = func.chunk.add_constant(Constant::Number(7.0));
        func.chunk.write_op(OpCode::Constant, 1);
        func.chunk.write(idx as u8, 1);
        func.chunk.write_op(OpCode::Return, 1);

        let compiled = compile_bytecode(&func);
        // The function ends with pops and ret
        assert_eq!(*compiled.code.last().unwrap(), 0xC3);
    }
}
