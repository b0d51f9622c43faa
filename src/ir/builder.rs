//! Bytecode to IR Translation
//!
//! Builds IR functions from compiled bytecode in two passes:
//!
//! 1. **Target discovery**: scan the instruction stream once, resolving the
//!    absolute offset of every `Jump`/`JumpIfFalse`/`Loop` target and
//!    allocating a block label for each distinct offset.
//! 2. **Translation**: re-scan, simulating the interpreter's operand stack
//!    with a typed value stack. Stack-machine value flow becomes explicit IR
//!    value flow; whenever the current offset is a discovered target, a new
//!    block is started.
//!
//! Functions referenced by `Closure` are queued on a worklist and built
//! exactly once, so the resulting module contains every function reachable
//! from the entry point.

use std::collections::{HashMap, VecDeque};

use log::{debug, trace};

use crate::bytecode::{self, Constant, OpCode};

use super::types::{Const, FuncId, Function, Instruction, Label, Module, Opcode, SizeClass, Value};

/// Runtime symbol invoked for values that cannot be materialized directly
const RT_CONSTANT: &str = "opal_rt_constant";
/// Runtime symbol invoked for indirect (non-function-reference) calls
const RT_CALL_VALUE: &str = "opal_rt_call_value";
/// Runtime symbol invoked for opcodes without an explicit lowering rule
const RT_OPCODE: &str = "opal_rt_op";

/// Builds an IR module from one bytecode entry point
pub struct Builder {
    module: Module,
    seen: HashMap<String, FuncId>,
    queue: VecDeque<bytecode::Function>,
}

impl Builder {
    pub fn new(source_name: impl Into<String>) -> Self {
        Self {
            module: Module::new(source_name),
            seen: HashMap::new(),
            queue: VecDeque::new(),
        }
    }

    /// Build a module containing the entry function and every function it
    /// transitively references through `Closure` instructions.
    pub fn build(entry: &bytecode::Function, source_name: &str) -> Module {
        let mut builder = Builder::new(source_name);
        builder.enqueue(entry);
        while let Some(func) = builder.queue.pop_front() {
            let ir = builder.translate_function(&func);
            debug!(
                "built ir function '{}': {} blocks, {} instructions",
                ir.name,
                ir.blocks.len(),
                ir.instruction_count()
            );
            builder.module.functions.push(ir);
        }
        builder.module
    }

    /// Reserve a function id, queueing the function for translation if it
    /// has not been seen before.
    fn enqueue(&mut self, func: &bytecode::Function) -> FuncId {
        if let Some(&id) = self.seen.get(&func.name) {
            return id;
        }
        let id = FuncId(self.seen.len());
        self.seen.insert(func.name.clone(), id);
        self.queue.push_back(func.clone());
        id
    }

    fn translate_function(&mut self, source: &bytecode::Function) -> Function {
        let mut trans = FunctionTranslator::new(source);
        trans.discover_targets(source);
        trans.translate(self, source);
        trans.func
    }
}

/// Per-function translation state
struct FunctionTranslator {
    func: Function,
    /// Simulated interpreter operand stack
    stack: Vec<Value>,
    /// Cached IR value per bytecode local slot
    locals: Vec<Option<Value>>,
    /// Bytecode offset -> block label
    targets: HashMap<usize, Label>,
}

impl FunctionTranslator {
    fn new(source: &bytecode::Function) -> Self {
        let mut func = Function::new(source.name.clone(), source.arity);
        // Slot 0 holds the callee; parameters occupy 1..=arity
        func.local_count = source.local_count.max(source.arity as u16 + 1);
        func.upvalue_count = source.upvalue_count;
        Self {
            func,
            stack: Vec::new(),
            locals: vec![None; source.local_count as usize],
            targets: HashMap::new(),
        }
    }

    /// Pass 1: allocate a label for every branch target offset
    fn discover_targets(&mut self, source: &bytecode::Function) {
        let code = &source.chunk.code;
        let mut offset = 0;
        while offset < code.len() {
            let Some(op) = OpCode::from_byte(code[offset]) else {
                offset += 1;
                continue;
            };
            let width = instruction_width(op, code, offset);
            match op {
                OpCode::Jump | OpCode::JumpIfFalse => {
                    let jump = read_u16(code, offset + 1) as usize;
                    self.add_target(offset + 3 + jump);
                }
                OpCode::Loop => {
                    let jump = read_u16(code, offset + 1) as usize;
                    self.add_target((offset + 3).saturating_sub(jump));
                }
                _ => {}
            }
            offset += 1 + width;
        }
    }

    fn add_target(&mut self, offset: usize) {
        if self.targets.contains_key(&offset) {
            return;
        }
        // A branch back to the very first instruction targets the entry block
        let label = if offset == 0 {
            self.func.blocks[0].label
        } else {
            self.func.alloc_label()
        };
        self.targets.insert(offset, label);
    }

    /// Pass 2: translate the instruction stream
    fn translate(&mut self, builder: &mut Builder, source: &bytecode::Function) {
        let code = &source.chunk.code;
        let constants = &source.chunk.constants;
        let mut offset = 0;
        while offset < code.len() {
            if offset != 0 {
                if let Some(&label) = self.targets.get(&offset) {
                    self.begin_block(label);
                }
            }

            let Some(op) = OpCode::from_byte(code[offset]) else {
                // No lowering rule: degrade to a runtime call carrying the
                // raw opcode byte, so translation itself never fails.
                let dest = self.func.alloc_vreg(SizeClass::Word);
                self.func.emit(Instruction::runtime_call(
                    Some(dest),
                    RT_OPCODE,
                    vec![Value::Const(Const::Int(code[offset] as i64))],
                ));
                self.stack.push(dest);
                offset += 1;
                continue;
            };
            let width = instruction_width(op, code, offset);
            self.translate_op(builder, op, code, constants, offset);
            offset += 1 + width;
        }
    }

    /// Start the block for a discovered target, wiring the fall-through edge
    /// if the previous block did not end in a terminator.
    fn begin_block(&mut self, label: Label) {
        let prev = self.func.current_label();
        let falls_through = self
            .func
            .blocks
            .last()
            .and_then(|b| b.instructions.last())
            .map_or(true, |insn| !insn.op.is_terminator());
        self.func.start_block(label);
        if falls_through {
            self.func.add_edge(prev, label);
        }
    }

    fn translate_op(
        &mut self,
        builder: &mut Builder,
        op: OpCode,
        code: &[u8],
        constants: &[Constant],
        offset: usize,
    ) {
        match op {
            OpCode::Constant => {
                let idx = code[offset + 1] as usize;
                self.lower_constant(constants, idx);
            }
            OpCode::Nil => self.emit_const(Opcode::ConstNil, Const::Nil),
            OpCode::True => self.emit_const(Opcode::ConstBool, Const::Bool(true)),
            OpCode::False => self.emit_const(Opcode::ConstBool, Const::Bool(false)),
            OpCode::Pop => {
                self.pop();
            }
            OpCode::GetLocal => {
                let slot = code[offset + 1] as usize;
                self.ensure_local(slot);
                if let Some(value) = self.locals[slot] {
                    trace!("local slot {} served from cache", slot);
                    self.stack.push(value);
                } else {
                    let dest = self.func.alloc_vreg(SizeClass::Word);
                    self.func.emit(Instruction::with_dest(
                        Opcode::LoadLocal,
                        dest,
                        vec![Value::Const(Const::Int(slot as i64))],
                    ));
                    self.locals[slot] = Some(dest);
                    self.stack.push(dest);
                }
            }
            OpCode::SetLocal => {
                let slot = code[offset + 1] as usize;
                let value = self.peek(0);
                self.func.emit(Instruction::new(
                    Opcode::StoreLocal,
                    vec![Value::Const(Const::Int(slot as i64)), value],
                ));
                self.ensure_local(slot);
                self.locals[slot] = Some(value);
            }
            OpCode::GetGlobal => {
                let idx = code[offset + 1] as i64;
                let dest = self.func.alloc_vreg(SizeClass::Word);
                self.func.emit(Instruction::with_dest(
                    Opcode::LoadGlobal,
                    dest,
                    vec![Value::Const(Const::Int(idx))],
                ));
                self.stack.push(dest);
            }
            OpCode::DefineGlobal => {
                let idx = code[offset + 1] as i64;
                let value = self.pop();
                self.func.emit(Instruction::new(
                    Opcode::StoreGlobal,
                    vec![Value::Const(Const::Int(idx)), value],
                ));
            }
            OpCode::SetGlobal => {
                let idx = code[offset + 1] as i64;
                let value = self.peek(0);
                self.func.emit(Instruction::new(
                    Opcode::StoreGlobal,
                    vec![Value::Const(Const::Int(idx)), value],
                ));
            }
            OpCode::GetUpvalue => {
                let idx = code[offset + 1] as i64;
                let dest = self.func.alloc_vreg(SizeClass::Word);
                self.func.emit(Instruction::with_dest(
                    Opcode::LoadUpvalue,
                    dest,
                    vec![Value::Const(Const::Int(idx))],
                ));
                self.stack.push(dest);
            }
            OpCode::SetUpvalue => {
                let idx = code[offset + 1] as i64;
                let value = self.peek(0);
                self.func.emit(Instruction::new(
                    Opcode::StoreUpvalue,
                    vec![Value::Const(Const::Int(idx)), value],
                ));
            }
            OpCode::GetProperty => {
                let idx = code[offset + 1] as i64;
                let object = self.pop();
                let dest = self.func.alloc_vreg(SizeClass::Word);
                self.func.emit(Instruction::with_dest(
                    Opcode::GetProperty,
                    dest,
                    vec![object, Value::Const(Const::Int(idx))],
                ));
                self.stack.push(dest);
            }
            OpCode::SetProperty => {
                let idx = code[offset + 1] as i64;
                let value = self.pop();
                let object = self.pop();
                self.func.emit(Instruction::new(
                    Opcode::SetProperty,
                    vec![object, Value::Const(Const::Int(idx)), value],
                ));
                // A property assignment leaves the assigned value behind
                self.stack.push(value);
            }
            OpCode::GetIndex => {
                let index = self.pop();
                let object = self.pop();
                let dest = self.func.alloc_vreg(SizeClass::Word);
                self.func.emit(Instruction::with_dest(
                    Opcode::GetIndex,
                    dest,
                    vec![object, index],
                ));
                self.stack.push(dest);
            }
            OpCode::SetIndex => {
                let value = self.pop();
                let index = self.pop();
                let object = self.pop();
                self.func.emit(Instruction::new(
                    Opcode::SetIndex,
                    vec![object, index, value],
                ));
                self.stack.push(value);
            }
            OpCode::Equal => self.emit_comparison(Opcode::Eq),
            OpCode::Greater => self.emit_comparison(Opcode::Gt),
            OpCode::Less => self.emit_comparison(Opcode::Lt),
            OpCode::Add => self.emit_arithmetic(Opcode::Add),
            OpCode::Subtract => self.emit_arithmetic(Opcode::Sub),
            OpCode::Multiply => self.emit_arithmetic(Opcode::Mul),
            OpCode::Divide => self.emit_arithmetic(Opcode::Div),
            OpCode::Not => {
                let operand = self.pop();
                // Logical NOT routes through runtime truthiness, so its
                // result is always a tagged value.
                let dest = self.func.alloc_vreg(SizeClass::Pair);
                self.func
                    .emit(Instruction::with_dest(Opcode::Not, dest, vec![operand]));
                self.stack.push(dest);
            }
            OpCode::Negate => {
                let operand = self.pop();
                let dest = self.func.alloc_vreg(operand.size_class());
                self.func
                    .emit(Instruction::with_dest(Opcode::Neg, dest, vec![operand]));
                self.stack.push(dest);
            }
            OpCode::Print => {
                let value = self.pop();
                self.func.emit(Instruction::new(Opcode::Print, vec![value]));
            }
            OpCode::Jump => {
                let jump = read_u16(code, offset + 1) as usize;
                self.emit_jump(offset + 3 + jump);
            }
            OpCode::JumpIfFalse => {
                let jump = read_u16(code, offset + 1) as usize;
                let target = offset + 3 + jump;
                let label = self.targets[&target];
                let cond = self.peek(0);
                self.func.emit(Instruction::new(
                    Opcode::JumpIfFalse,
                    vec![cond, Value::Label(label)],
                ));
                let from = self.func.current_label();
                self.func.add_edge(from, label);
            }
            OpCode::Loop => {
                let jump = read_u16(code, offset + 1) as usize;
                self.emit_jump((offset + 3).saturating_sub(jump));
            }
            OpCode::Call => {
                let argc = code[offset + 1] as usize;
                let callee = self.peek(argc);
                // Capture the arguments left-to-right before popping
                let args: Vec<Value> = (0..argc).map(|i| self.peek(argc - 1 - i)).collect();
                for _ in 0..argc + 1 {
                    self.pop();
                }
                let dest = self.func.alloc_vreg(SizeClass::Word);
                let insn = if matches!(callee, Value::Func(_)) {
                    Instruction::call(dest, callee, args)
                } else {
                    let mut rt_args = Vec::with_capacity(args.len() + 1);
                    rt_args.push(callee);
                    rt_args.extend(args);
                    Instruction::runtime_call(Some(dest), RT_CALL_VALUE, rt_args)
                };
                self.func.emit(insn);
                self.stack.push(dest);
            }
            OpCode::Closure => {
                let idx = code[offset + 1] as usize;
                let upvalue_count = code[offset + 2] as usize;
                match constants.get(idx) {
                    Some(Constant::Function(inner)) => {
                        let id = builder.enqueue(inner);
                        if upvalue_count == 0 {
                            // No captured environment: a bare function
                            // reference is enough, and calls through it can
                            // be patched directly.
                            self.stack.push(Value::Func(id));
                        } else {
                            let dest = self.func.alloc_vreg(SizeClass::Word);
                            self.func.emit(Instruction::with_dest(
                                Opcode::NewClosure,
                                dest,
                                vec![Value::Func(id)],
                            ));
                            self.stack.push(dest);
                        }
                    }
                    _ => {
                        debug!("closure constant {} is not a function", idx);
                        self.stack.push(Value::Invalid);
                    }
                }
            }
            OpCode::Return => {
                let value = self.pop();
                self.func
                    .emit(Instruction::new(Opcode::Return, vec![value]));
            }
        }
    }

    fn lower_constant(&mut self, constants: &[Constant], idx: usize) {
        match constants.get(idx) {
            Some(Constant::Number(n)) => {
                if n.fract() == 0.0 && n.abs() < (1i64 << 53) as f64 {
                    self.emit_const(Opcode::ConstInt, Const::Int(*n as i64));
                } else {
                    self.emit_const(Opcode::ConstFloat, Const::Float(*n));
                }
            }
            Some(Constant::Bool(b)) => self.emit_const(Opcode::ConstBool, Const::Bool(*b)),
            Some(Constant::Nil) | None => self.emit_const(Opcode::ConstNil, Const::Nil),
            Some(Constant::Str(_)) | Some(Constant::Function(_)) => {
                // Object constants are interned by the runtime; fetch by
                // pool index at execution time.
                let dest = self.func.alloc_vreg(SizeClass::Word);
                self.func.emit(Instruction::runtime_call(
                    Some(dest),
                    RT_CONSTANT,
                    vec![Value::Const(Const::Int(idx as i64))],
                ));
                self.stack.push(dest);
            }
        }
    }

    fn emit_const(&mut self, op: Opcode, value: Const) {
        let dest = self.func.alloc_vreg(SizeClass::Word);
        self.func
            .emit(Instruction::with_dest(op, dest, vec![Value::Const(value)]));
        self.stack.push(dest);
    }

    fn emit_arithmetic(&mut self, op: Opcode) {
        let rhs = self.pop();
        let lhs = self.pop();
        // Arithmetic widens to a tagged result only if an operand is tagged
        let size = lhs.size_class().max(rhs.size_class());
        let dest = self.func.alloc_vreg(size);
        self.func
            .emit(Instruction::with_dest(op, dest, vec![lhs, rhs]));
        self.stack.push(dest);
    }

    fn emit_comparison(&mut self, op: Opcode) {
        let rhs = self.pop();
        let lhs = self.pop();
        // Comparisons route through runtime helpers and produce tagged values
        let dest = self.func.alloc_vreg(SizeClass::Pair);
        self.func
            .emit(Instruction::with_dest(op, dest, vec![lhs, rhs]));
        self.stack.push(dest);
    }

    fn emit_jump(&mut self, target: usize) {
        let label = self.targets[&target];
        self.func
            .emit(Instruction::new(Opcode::Jump, vec![Value::Label(label)]));
        let from = self.func.current_label();
        self.func.add_edge(from, label);
    }

    fn ensure_local(&mut self, slot: usize) {
        if slot >= self.locals.len() {
            self.locals.resize(slot + 1, None);
            self.func.local_count = self.func.local_count.max(slot as u16 + 1);
        }
    }

    fn pop(&mut self) -> Value {
        match self.stack.pop() {
            Some(value) => value,
            None => {
                debug!("simulated stack underflow in '{}'", self.func.name);
                Value::Invalid
            }
        }
    }

    fn peek(&self, depth: usize) -> Value {
        if depth < self.stack.len() {
            self.stack[self.stack.len() - 1 - depth]
        } else {
            Value::Invalid
        }
    }
}

/// Operand width of the instruction at `offset`, including the variable
/// per-upvalue pairs of `Closure`.
fn instruction_width(op: OpCode, code: &[u8], offset: usize) -> usize {
    match op {
        OpCode::Closure => {
            let upvalue_count = code.get(offset + 2).copied().unwrap_or(0) as usize;
            2 + 2 * upvalue_count
        }
        _ => op.operand_width(),
    }
}

/// Branch operands are stored high byte first
fn read_u16(code: &[u8], offset: usize) -> u16 {
    let hi = code.get(offset).copied().unwrap_or(0) as u16;
    let lo = code.get(offset + 1).copied().unwrap_or(0) as u16;
    (hi << 8) | lo
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Chunk, Function as BcFunction};

    fn constant(chunk: &mut Chunk, value: Constant) {
        let idx = chunk.add_constant(value);
        chunk.write_op(OpCode::Constant, 1);
        chunk.write(idx as u8, 1);
    }

    #[test]
    fn test_add_and_print_lowering() {
        let mut func = BcFunction::new("main", 0);
        constant(&mut func.chunk, Constant::Number(10.0));
        constant(&mut func.chunk, Constant::Number(20.0));
        func.chunk.write_op(OpCode::Add, 1);
        func.chunk.write_op(OpCode::Print, 1);
        func.chunk.write_op(OpCode::Nil, 2);
        func.chunk.write_op(OpCode::Return, 2);

        let module = Builder::build(&func, "test.opal");
        assert_eq!(module.functions.len(), 1);
        let ir = &module.functions[0];

        let ops: Vec<Opcode> = ir.blocks[0].instructions.iter().map(|i| i.op).collect();
        assert_eq!(
            ops,
            vec![
                Opcode::ConstInt,
                Opcode::ConstInt,
                Opcode::Add,
                Opcode::Print,
                Opcode::ConstNil,
                Opcode::Return,
            ]
        );
        // Both operands are untagged words, so the sum stays a word
        let add = &ir.blocks[0].instructions[2];
        assert_eq!(add.def().unwrap().1, SizeClass::Word);
    }

    #[test]
    fn test_comparison_produces_pair() {
        let mut func = BcFunction::new("main", 0);
        constant(&mut func.chunk, Constant::Number(1.0));
        constant(&mut func.chunk, Constant::Number(2.0));
        func.chunk.write_op(OpCode::Less, 1);
        constant(&mut func.chunk, Constant::Number(3.0));
        func.chunk.write_op(OpCode::Add, 1);
        func.chunk.write_op(OpCode::Return, 1);

        let module = Builder::build(&func, "test.opal");
        let ir = &module.functions[0];
        let insns = &ir.blocks[0].instructions;

        let less = &insns[2];
        assert_eq!(less.op, Opcode::Lt);
        assert_eq!(less.def().unwrap().1, SizeClass::Pair);

        // The tagged comparison result widens the addition
        let add = insns.iter().find(|i| i.op == Opcode::Add).unwrap();
        assert_eq!(add.def().unwrap().1, SizeClass::Pair);
    }

    #[test]
    fn test_jump_creates_blocks() {
        let mut func = BcFunction::new("main", 0);
        // jump over a single Nil instruction
        func.chunk.write_op(OpCode::Jump, 1);
        func.chunk.write(0, 1);
        func.chunk.write(1, 1);
        func.chunk.write_op(OpCode::Nil, 1);
        func.chunk.write_op(OpCode::Nil, 2);
        func.chunk.write_op(OpCode::Return, 2);

        let module = Builder::build(&func, "test.opal");
        let ir = &module.functions[0];
        assert_eq!(ir.blocks.len(), 2);
        assert_eq!(ir.blocks[0].instructions[0].op, Opcode::Jump);
        // The jump edge points at the second block
        assert_eq!(
            ir.blocks[0].successors,
            vec![ir.blocks[1].label]
        );
    }

    #[test]
    fn test_local_slot_caching() {
        let mut func = BcFunction::new("main", 0);
        func.local_count = 2;
        func.chunk.write_op(OpCode::GetLocal, 1);
        func.chunk.write(1, 1);
        func.chunk.write_op(OpCode::GetLocal, 1);
        func.chunk.write(1, 1);
        func.chunk.write_op(OpCode::Add, 1);
        func.chunk.write_op(OpCode::Return, 1);

        let module = Builder::build(&func, "test.opal");
        let ir = &module.functions[0];
        let loads = ir.blocks[0]
            .instructions
            .iter()
            .filter(|i| i.op == Opcode::LoadLocal)
            .count();
        // Second GetLocal reuses the cached value
        assert_eq!(loads, 1);
    }

    #[test]
    fn test_unknown_opcode_degrades_to_runtime_call() {
        let mut func = BcFunction::new("main", 0);
        func.chunk.write(0xEE, 1);
        func.chunk.write_op(OpCode::Return, 1);

        let module = Builder::build(&func, "test.opal");
        let ir = &module.functions[0];
        let insn = &ir.blocks[0].instructions[0];
        assert_eq!(insn.op, Opcode::RuntimeCall);
        assert_eq!(insn.symbol.as_deref(), Some(RT_OPCODE));
        assert_eq!(insn.args, vec![Value::Const(Const::Int(0xEE))]);
    }

    #[test]
    fn test_closure_worklist_builds_module() {
        let mut inner = BcFunction::new("helper", 0);
        inner.chunk.write_op(OpCode::Nil, 1);
        inner.chunk.write_op(OpCode::Return, 1);

        let mut outer = BcFunction::new("main", 0);
        let idx = outer.chunk.add_constant(Constant::Function(inner));
        outer.chunk.write_op(OpCode::Closure, 1);
        outer.chunk.write(idx as u8, 1);
        outer.chunk.write(0, 1); // no upvalues
        outer.chunk.write_op(OpCode::Call, 1);
        outer.chunk.write(0, 1);
        outer.chunk.write_op(OpCode::Return, 1);

        let module = Builder::build(&outer, "test.opal");
        assert_eq!(module.functions.len(), 2);
        assert_eq!(module.functions[0].name, "main");
        assert_eq!(module.functions[1].name, "helper");

        // The zero-upvalue closure becomes a direct call
        let call = module.functions[0].blocks[0]
            .instructions
            .iter()
            .find(|i| i.op == Opcode::Call)
            .unwrap();
        assert_eq!(call.callee, Some(Value::Func(FuncId(1))));
    }

    #[test]
    fn test_loop_back_edge_targets_entry() {
        let mut func = BcFunction::new("main", 0);
        func.chunk.write_op(OpCode::Nil, 1); // offset 0
        func.chunk.write_op(OpCode::Pop, 1); // offset 1
        func.chunk.write_op(OpCode::Loop, 1); // offset 2, back to 0
        func.chunk.write(0, 1);
        func.chunk.write(5, 1);
        func.chunk.write_op(OpCode::Return, 1);

        let module = Builder::build(&func, "test.opal");
        let ir = &module.functions[0];
        let jump = ir.blocks[0]
            .instructions
            .iter()
            .find(|i| i.op == Opcode::Jump)
            .unwrap();
        assert_eq!(jump.operands[0], Value::Label(ir.blocks[0].label));
    }
}
