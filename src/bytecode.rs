//! Bytecode Input Model
//!
//! The shape of the data handed to the backend by the front-end compiler:
//! one-byte opcodes with fixed operand widths, a parallel line table, and a
//! constant pool of tagged runtime values. The interpreter that normally
//! executes these chunks lives outside this crate.

use std::fmt;

/// One-byte bytecode opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Constant = 0,
    Nil = 1,
    True = 2,
    False = 3,
    Pop = 4,
    GetLocal = 5,
    SetLocal = 6,
    GetGlobal = 7,
    DefineGlobal = 8,
    SetGlobal = 9,
    GetUpvalue = 10,
    SetUpvalue = 11,
    GetProperty = 12,
    SetProperty = 13,
    GetIndex = 14,
    SetIndex = 15,
    Equal = 16,
    Greater = 17,
    Less = 18,
    Add = 19,
    Subtract = 20,
    Multiply = 21,
    Divide = 22,
    Not = 23,
    Negate = 24,
    Print = 25,
    Jump = 26,
    JumpIfFalse = 27,
    Loop = 28,
    Call = 29,
    Closure = 30,
    Return = 31,
}

impl OpCode {
    /// Decode a raw opcode byte
    pub fn from_byte(byte: u8) -> Option<OpCode> {
        match byte {
            0 => Some(OpCode::Constant),
            1 => Some(OpCode::Nil),
            2 => Some(OpCode::True),
            3 => Some(OpCode::False),
            4 => Some(OpCode::Pop),
            5 => Some(OpCode::GetLocal),
            6 => Some(OpCode::SetLocal),
            7 => Some(OpCode::GetGlobal),
            8 => Some(OpCode::DefineGlobal),
            9 => Some(OpCode::SetGlobal),
            10 => Some(OpCode::GetUpvalue),
            11 => Some(OpCode::SetUpvalue),
            12 => Some(OpCode::GetProperty),
            13 => Some(OpCode::SetProperty),
            14 => Some(OpCode::GetIndex),
            15 => Some(OpCode::SetIndex),
            16 => Some(OpCode::Equal),
            17 => Some(OpCode::Greater),
            18 => Some(OpCode::Less),
            19 => Some(OpCode::Add),
            20 => Some(OpCode::Subtract),
            21 => Some(OpCode::Multiply),
            22 => Some(OpCode::Divide),
            23 => Some(OpCode::Not),
            24 => Some(OpCode::Negate),
            25 => Some(OpCode::Print),
            26 => Some(OpCode::Jump),
            27 => Some(OpCode::JumpIfFalse),
            28 => Some(OpCode::Loop),
            29 => Some(OpCode::Call),
            30 => Some(OpCode::Closure),
            31 => Some(OpCode::Return),
            _ => None,
        }
    }

    /// Fixed operand width in bytes.
    ///
    /// `Closure` is variable width (`2 + 2 * upvalue_count`); this returns
    /// its fixed prefix (constant index + upvalue count), the scanner reads
    /// the per-upvalue pairs itself.
    pub fn operand_width(self) -> usize {
        match self {
            OpCode::Constant
            | OpCode::GetLocal
            | OpCode::SetLocal
            | OpCode::GetGlobal
            | OpCode::DefineGlobal
            | OpCode::SetGlobal
            | OpCode::GetUpvalue
            | OpCode::SetUpvalue
            | OpCode::GetProperty
            | OpCode::SetProperty
            | OpCode::Call => 1,
            OpCode::Jump | OpCode::JumpIfFalse | OpCode::Loop | OpCode::Closure => 2,
            _ => 0,
        }
    }
}

/// A tagged constant-pool value
#[derive(Debug, Clone)]
pub enum Constant {
    Number(f64),
    Bool(bool),
    Nil,
    Str(String),
    /// A nested compiled function, referenced by `Closure`
    Function(Function),
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Number(n) => write!(f, "{}", n),
            Constant::Bool(b) => write!(f, "{}", b),
            Constant::Nil => write!(f, "nil"),
            Constant::Str(s) => write!(f, "\"{}\"", s),
            Constant::Function(func) => write!(f, "<fn {}>", func.name),
        }
    }
}

/// A compiled bytecode chunk: instruction stream, line table, constant pool
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    pub code: Vec<u8>,
    pub lines: Vec<u32>,
    pub constants: Vec<Constant>,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one byte with its source line
    pub fn write(&mut self, byte: u8, line: u32) {
        self.code.push(byte);
        self.lines.push(line);
    }

    /// Append an opcode with its source line
    pub fn write_op(&mut self, op: OpCode, line: u32) {
        self.write(op as u8, line);
    }

    /// Add a constant to the pool, returning its index
    pub fn add_constant(&mut self, value: Constant) -> usize {
        self.constants.push(value);
        self.constants.len() - 1
    }
}

/// A compiled bytecode function
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub arity: u8,
    pub local_count: u16,
    pub upvalue_count: u8,
    pub chunk: Chunk,
}

impl Function {
    pub fn new(name: impl Into<String>, arity: u8) -> Self {
        Self {
            name: name.into(),
            arity,
            local_count: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_round_trip() {
        for byte in 0..=31u8 {
            let op = OpCode::from_byte(byte).unwrap();
            assert_eq!(op as u8, byte);
        }
        assert!(OpCode::from_byte(32).is_none());
        assert!(OpCode::from_byte(255).is_none());
    }

    #[test]
    fn test_operand_widths() {
        assert_eq!(OpCode::Add.operand_width(), 0);
        assert_eq!(OpCode::Constant.operand_width(), 1);
        assert_eq!(OpCode::GetLocal.operand_width(), 1);
        assert_eq!(OpCode::Jump.operand_width(), 2);
        assert_eq!(OpCode::Loop.operand_width(), 2);
        assert_eq!(OpCode::Closure.operand_width(), 2);
    }

    #[test]
    fn test_chunk_write() {
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Constant, 1);
        let idx = chunk.add_constant(Constant::Number(1.5));
        chunk.write(idx as u8, 1);

        assert_eq!(chunk.code, vec![0, 0]);
        assert_eq!(chunk.lines, vec![1, 1]);
        assert_eq!(chunk.constants.len(), 1);
    }
}
