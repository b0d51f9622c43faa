//! IR Type Definitions
//!
//! Architecture-neutral instruction/value/block/function model sitting
//! between bytecode and machine code. Virtual registers are mutable storage
//! cells, not SSA values: the builder may reuse a register across several
//! uses of the same local slot, and a register's size class is the maximum
//! ever observed across its defs and uses.

use std::fmt;

/// Virtual register index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Vreg(pub u32);

/// Basic-block label, unique and monotonically assigned per function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

/// Function index within a module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncId(pub usize);

/// Value size class.
///
/// `Word` fits one machine register; `Pair` is a 16-byte tagged runtime
/// value, which on ARM64 occupies two consecutive physical registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SizeClass {
    Word,
    Pair,
}

impl SizeClass {
    pub fn bytes(self) -> u32 {
        match self {
            SizeClass::Word => 8,
            SizeClass::Pair => 16,
        }
    }

    pub fn slots(self) -> u32 {
        match self {
            SizeClass::Word => 1,
            SizeClass::Pair => 2,
        }
    }
}

/// Compile-time constant
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Const {
    Int(i64),
    Float(f64),
    Bool(bool),
    Nil,
}

impl fmt::Display for Const {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Const::Int(v) => write!(f, "{}", v),
            Const::Float(v) => write!(f, "{}", v),
            Const::Bool(v) => write!(f, "{}", v),
            Const::Nil => write!(f, "nil"),
        }
    }
}

/// An IR operand value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Reg { vreg: Vreg, size: SizeClass },
    Const(Const),
    Label(Label),
    Func(FuncId),
    /// Sentinel produced on simulated-stack underflow
    Invalid,
}

impl Value {
    pub fn is_reg(&self) -> bool {
        matches!(self, Value::Reg { .. })
    }

    pub fn vreg(&self) -> Option<Vreg> {
        match self {
            Value::Reg { vreg, .. } => Some(*vreg),
            _ => None,
        }
    }

    /// The size class this value contributes to a destination
    pub fn size_class(&self) -> SizeClass {
        match self {
            Value::Reg { size, .. } => *size,
            _ => SizeClass::Word,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Reg { vreg, size } => write!(f, "v{}:{}", vreg.0, size.bytes()),
            Value::Const(c) => write!(f, "{}", c),
            Value::Label(l) => write!(f, "L{}", l.0),
            Value::Func(id) => write!(f, "fn#{}", id.0),
            Value::Invalid => write!(f, "<invalid>"),
        }
    }
}

/// IR opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    // Constants
    ConstInt,
    ConstFloat,
    ConstBool,
    ConstNil,
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    // Comparison / logical (tagged results, always Pair destinations)
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Not,
    // Memory
    LoadLocal,
    StoreLocal,
    LoadGlobal,
    StoreGlobal,
    LoadUpvalue,
    StoreUpvalue,
    GetProperty,
    SetProperty,
    GetIndex,
    SetIndex,
    // Control flow
    Jump,
    JumpIfFalse,
    Return,
    // Calls
    Call,
    RuntimeCall,
    // Object construction
    NewClosure,
    Print,
    Move,
    /// Declared for completeness; the builder never emits it
    Phi,
}

impl Opcode {
    pub fn is_terminator(self) -> bool {
        matches!(self, Opcode::Jump | Opcode::Return)
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::ConstInt => "const_int",
            Opcode::ConstFloat => "const_float",
            Opcode::ConstBool => "const_bool",
            Opcode::ConstNil => "const_nil",
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::Div => "div",
            Opcode::Neg => "neg",
            Opcode::Eq => "eq",
            Opcode::Ne => "ne",
            Opcode::Lt => "lt",
            Opcode::Le => "le",
            Opcode::Gt => "gt",
            Opcode::Ge => "ge",
            Opcode::Not => "not",
            Opcode::LoadLocal => "load_local",
            Opcode::StoreLocal => "store_local",
            Opcode::LoadGlobal => "load_global",
            Opcode::StoreGlobal => "store_global",
            Opcode::LoadUpvalue => "load_upvalue",
            Opcode::StoreUpvalue => "store_upvalue",
            Opcode::GetProperty => "get_property",
            Opcode::SetProperty => "set_property",
            Opcode::GetIndex => "get_index",
            Opcode::SetIndex => "set_index",
            Opcode::Jump => "jump",
            Opcode::JumpIfFalse => "jump_if_false",
            Opcode::Return => "return",
            Opcode::Call => "call",
            Opcode::RuntimeCall => "runtime_call",
            Opcode::NewClosure => "new_closure",
            Opcode::Print => "print",
            Opcode::Move => "move",
            Opcode::Phi => "phi",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One IR instruction: opcode, up to three operands, optional destination.
/// The call family additionally carries an argument list plus either a
/// direct callee value or an external symbol name.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub op: Opcode,
    pub operands: Vec<Value>,
    pub dest: Option<Value>,
    pub args: Vec<Value>,
    pub callee: Option<Value>,
    pub symbol: Option<String>,
}

impl Instruction {
    pub fn new(op: Opcode, operands: Vec<Value>) -> Self {
        debug_assert!(operands.len() <= 3);
        Self {
            op,
            operands,
            dest: None,
            args: Vec::new(),
            callee: None,
            symbol: None,
        }
    }

    pub fn with_dest(op: Opcode, dest: Value, operands: Vec<Value>) -> Self {
        debug_assert!(dest.is_reg());
        let mut insn = Self::new(op, operands);
        insn.dest = Some(dest);
        insn
    }

    /// Direct call to a sibling IR function
    pub fn call(dest: Value, callee: Value, args: Vec<Value>) -> Self {
        let mut insn = Self::with_dest(Opcode::Call, dest, Vec::new());
        insn.callee = Some(callee);
        insn.args = args;
        insn
    }

    /// Call to a named external runtime symbol
    pub fn runtime_call(dest: Option<Value>, symbol: impl Into<String>, args: Vec<Value>) -> Self {
        let mut insn = Self::new(Opcode::RuntimeCall, Vec::new());
        insn.dest = dest;
        insn.symbol = Some(symbol.into());
        insn.args = args;
        insn
    }

    /// Virtual register defined by this instruction, if any
    pub fn def(&self) -> Option<(Vreg, SizeClass)> {
        match self.dest {
            Some(Value::Reg { vreg, size }) => Some((vreg, size)),
            _ => None,
        }
    }

    /// All values read by this instruction (operands, call args, callee)
    pub fn uses(&self) -> impl Iterator<Item = &Value> {
        self.operands
            .iter()
            .chain(self.args.iter())
            .chain(self.callee.iter())
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(dest) = &self.dest {
            write!(f, "{} = ", dest)?;
        }
        write!(f, "{}", self.op)?;
        if let Some(callee) = &self.callee {
            write!(f, " {}", callee)?;
        }
        if let Some(symbol) = &self.symbol {
            write!(f, " @{}", symbol)?;
        }
        for (i, operand) in self.operands.iter().enumerate() {
            if i == 0 {
                write!(f, " ")?;
            } else {
                write!(f, ", ")?;
            }
            write!(f, "{}", operand)?;
        }
        if !self.args.is_empty() {
            write!(f, " (")?;
            for (i, arg) in self.args.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", arg)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

/// A basic block: label, owned instructions, CFG adjacency.
///
/// Successor/predecessor lists are maintained by the builder but not
/// consumed by the linearized liveness analysis.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub label: Label,
    pub instructions: Vec<Instruction>,
    pub successors: Vec<Label>,
    pub predecessors: Vec<Label>,
}

impl BasicBlock {
    pub fn new(label: Label) -> Self {
        Self {
            label,
            instructions: Vec::new(),
            successors: Vec::new(),
            predecessors: Vec::new(),
        }
    }
}

/// An IR function
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub arity: u8,
    pub blocks: Vec<BasicBlock>,
    pub local_count: u16,
    pub upvalue_count: u8,
    next_vreg: u32,
    next_label: u32,
}

impl Function {
    pub fn new(name: impl Into<String>, arity: u8) -> Self {
        let mut func = Self {
            name: name.into(),
            arity,
            blocks: Vec::new(),
            local_count: 0,
            upvalue_count: 0,
            next_vreg: 0,
            next_label: 0,
        };
        let entry = func.alloc_label();
        func.blocks.push(BasicBlock::new(entry));
        func
    }

    /// Allocate a fresh virtual register with the given size class
    pub fn alloc_vreg(&mut self, size: SizeClass) -> Value {
        let vreg = Vreg(self.next_vreg);
        self.next_vreg += 1;
        Value::Reg { vreg, size }
    }

    /// Allocate a fresh block label (strictly increasing)
    pub fn alloc_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    pub fn vreg_count(&self) -> u32 {
        self.next_vreg
    }

    /// Start a new block; subsequent `emit` calls append to it
    pub fn start_block(&mut self, label: Label) {
        self.blocks.push(BasicBlock::new(label));
    }

    /// Append an instruction to the current (last) block
    pub fn emit(&mut self, insn: Instruction) {
        if let Some(block) = self.blocks.last_mut() {
            block.instructions.push(insn);
        }
    }

    pub fn current_label(&self) -> Label {
        self.blocks.last().map(|b| b.label).unwrap_or(Label(0))
    }

    pub fn block(&self, label: Label) -> Option<&BasicBlock> {
        self.blocks.iter().find(|b| b.label == label)
    }

    pub fn block_mut(&mut self, label: Label) -> Option<&mut BasicBlock> {
        self.blocks.iter_mut().find(|b| b.label == label)
    }

    /// Record a CFG edge between two blocks
    pub fn add_edge(&mut self, from: Label, to: Label) {
        if let Some(block) = self.block_mut(from) {
            if !block.successors.contains(&to) {
                block.successors.push(to);
            }
        }
        if let Some(block) = self.block_mut(to) {
            if !block.predecessors.contains(&from) {
                block.predecessors.push(from);
            }
        }
    }

    pub fn instruction_count(&self) -> usize {
        self.blocks.iter().map(|b| b.instructions.len()).sum()
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "fn {} (arity {}):", self.name, self.arity)?;
        for block in &self.blocks {
            writeln!(f, "L{}:", block.label.0)?;
            for insn in &block.instructions {
                writeln!(f, "    {}", insn)?;
            }
        }
        Ok(())
    }
}

/// An ordered list of IR functions built from one bytecode entry point
#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub functions: Vec<Function>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: Vec::new(),
        }
    }

    pub fn find_function(&self, name: &str) -> Option<FuncId> {
        self.functions.iter().position(|f| f.name == name).map(FuncId)
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "module {}:", self.name)?;
        for func in &self.functions {
            write!(f, "{}", func)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_class() {
        assert_eq!(SizeClass::Word.bytes(), 8);
        assert_eq!(SizeClass::Pair.bytes(), 16);
        assert_eq!(SizeClass::Pair.slots(), 2);
        assert!(SizeClass::Word < SizeClass::Pair);
    }

    #[test]
    fn test_label_allocation_monotonic() {
        let mut func = Function::new("f", 0);
        let a = func.alloc_label();
        let b = func.alloc_label();
        let c = func.alloc_label();
        assert!(a < b && b < c);
        // The entry block consumed label 0
        assert_eq!(a, Label(1));
    }

    #[test]
    fn test_vreg_allocation() {
        let mut func = Function::new("f", 0);
        let a = func.alloc_vreg(SizeClass::Word);
        let b = func.alloc_vreg(SizeClass::Pair);
        assert_eq!(a.vreg(), Some(Vreg(0)));
        assert_eq!(b.vreg(), Some(Vreg(1)));
        assert_eq!(b.size_class(), SizeClass::Pair);
    }

    #[test]
    fn test_instruction_def_uses() {
        let dest = Value::Reg {
            vreg: Vreg(2),
            size: SizeClass::Word,
        };
        let a = Value::Reg {
            vreg: Vreg(0),
            size: SizeClass::Word,
        };
        let b = Value::Reg {
            vreg: Vreg(1),
            size: SizeClass::Word,
        };
        let insn = Instruction::with_dest(Opcode::Add, dest, vec![a, b]);
        assert_eq!(insn.def(), Some((Vreg(2), SizeClass::Word)));
        assert_eq!(insn.uses().count(), 2);
    }

    #[test]
    fn test_edges() {
        let mut func = Function::new("f", 0);
        let entry = func.current_label();
        let next = func.alloc_label();
        func.start_block(next);
        func.add_edge(entry, next);
        assert_eq!(func.block(entry).unwrap().successors, vec![next]);
        assert_eq!(func.block(next).unwrap().predecessors, vec![entry]);
    }

    #[test]
    fn test_display() {
        let dest = Value::Reg {
            vreg: Vreg(0),
            size: SizeClass::Pair,
        };
        let insn = Instruction::with_dest(
            Opcode::Eq,
            dest,
            vec![Value::Const(Const::Int(1)), Value::Const(Const::Nil)],
        );
        assert_eq!(insn.to_string(), "v0:16 = eq 1, nil");
    }
}
