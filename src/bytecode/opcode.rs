//! Bytecode opcodes for the Quicksilver VM
//!
//! Register-based instruction set. Registers are `u8` indices into the
//! current frame; multi-byte operands are little-endian. Jump offsets are
//! `i32` relative to the start of the next instruction.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Register index within a frame
pub type Reg = u8;

/// Bytecode opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// No operation
    Nop = 0x00,

    // ========== Loads ==========
    /// Operands: dst, constant_index (u16)
    LoadConst = 0x01,
    /// Operands: dst, value (i32)
    LoadInt = 0x02,
    /// Operands: dst
    LoadUndefined = 0x03,
    /// Operands: dst
    LoadTrue = 0x04,
    /// Operands: dst
    LoadFalse = 0x05,
    /// Operands: dst, argument_index (u8)
    LoadArg = 0x06,
    /// Operands: dst
    LoadThis = 0x07,
    /// Load a sibling function of the same program
    /// Operands: dst, local_function_id (u16)
    LoadFunc = 0x08,
    /// Operands: dst, src
    Move = 0x09,

    // ========== Arithmetic / Comparison ==========
    /// Operands: dst, lhs, rhs
    Add = 0x10,
    Sub = 0x11,
    Mul = 0x12,
    Lt = 0x13,
    Le = 0x14,
    /// Strict equality
    Eq = 0x15,
    /// Operands: dst, src
    Not = 0x16,

    // ========== Control Flow ==========
    /// Operands: offset (i32)
    Jump = 0x20,
    /// Operands: cond, offset (i32)
    JumpIfFalse = 0x21,
    /// Operands: cond, offset (i32)
    JumpIfTrue = 0x22,
    /// Marks the head of a loop; counts iterations
    /// Operands: loop_id (u8)
    LoopHeader = 0x23,

    // ========== Objects / Arrays ==========
    /// Operands: dst
    NewObject = 0x30,
    /// Operands: dst, obj, name_index (u16), ic_index (u16)
    GetField = 0x31,
    /// Operands: obj, name_index (u16), src, ic_index (u16)
    SetField = 0x32,
    /// Operands: dst, length register
    NewArray = 0x33,
    /// Operands: dst, array, index
    GetElem = 0x34,
    /// Operands: array, index, src
    SetElem = 0x35,
    /// Operands: dst, array
    ArrayLen = 0x36,

    // ========== Calls ==========
    /// Operands: dst, callee, first_arg, argc (u8), call_site (u16)
    Call = 0x40,
    /// Operands: dst, obj, name_index (u16), first_arg, argc (u8), ic_index (u16), call_site (u16)
    CallMethod = 0x41,
    /// Operands: dst, constructor, first_arg, argc (u8), call_site (u16)
    New = 0x42,

    // ========== Exceptions / Return ==========
    /// Operands: handler offset (i32), exception register
    TryBegin = 0x50,
    TryEnd = 0x51,
    /// Operands: src
    Throw = 0x52,
    /// Operands: src
    Return = 0x53,
}

impl Opcode {
    /// Convert from byte
    pub fn from_u8(byte: u8) -> Option<Opcode> {
        match byte {
            0x00 => Some(Opcode::Nop),
            0x01 => Some(Opcode::LoadConst),
            0x02 => Some(Opcode::LoadInt),
            0x03 => Some(Opcode::LoadUndefined),
            0x04 => Some(Opcode::LoadTrue),
            0x05 => Some(Opcode::LoadFalse),
            0x06 => Some(Opcode::LoadArg),
            0x07 => Some(Opcode::LoadThis),
            0x08 => Some(Opcode::LoadFunc),
            0x09 => Some(Opcode::Move),

            0x10 => Some(Opcode::Add),
            0x11 => Some(Opcode::Sub),
            0x12 => Some(Opcode::Mul),
            0x13 => Some(Opcode::Lt),
            0x14 => Some(Opcode::Le),
            0x15 => Some(Opcode::Eq),
            0x16 => Some(Opcode::Not),

            0x20 => Some(Opcode::Jump),
            0x21 => Some(Opcode::JumpIfFalse),
            0x22 => Some(Opcode::JumpIfTrue),
            0x23 => Some(Opcode::LoopHeader),

            0x30 => Some(Opcode::NewObject),
            0x31 => Some(Opcode::GetField),
            0x32 => Some(Opcode::SetField),
            0x33 => Some(Opcode::NewArray),
            0x34 => Some(Opcode::GetElem),
            0x35 => Some(Opcode::SetElem),
            0x36 => Some(Opcode::ArrayLen),

            0x40 => Some(Opcode::Call),
            0x41 => Some(Opcode::CallMethod),
            0x42 => Some(Opcode::New),

            0x50 => Some(Opcode::TryBegin),
            0x51 => Some(Opcode::TryEnd),
            0x52 => Some(Opcode::Throw),
            0x53 => Some(Opcode::Return),
            _ => None,
        }
    }

    /// Size of the operand bytes following the opcode byte
    pub fn operand_size(self) -> usize {
        match self {
            Opcode::Nop | Opcode::TryEnd => 0,
            Opcode::LoadUndefined
            | Opcode::LoadTrue
            | Opcode::LoadFalse
            | Opcode::LoadThis
            | Opcode::LoopHeader
            | Opcode::NewObject
            | Opcode::Throw
            | Opcode::Return => 1,
            Opcode::LoadArg | Opcode::Move | Opcode::Not | Opcode::NewArray | Opcode::ArrayLen => 2,
            Opcode::LoadConst | Opcode::LoadFunc => 3,
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Lt
            | Opcode::Le
            | Opcode::Eq
            | Opcode::GetElem
            | Opcode::SetElem => 3,
            Opcode::Jump => 4,
            Opcode::LoadInt | Opcode::JumpIfFalse | Opcode::JumpIfTrue | Opcode::TryBegin => 5,
            Opcode::GetField | Opcode::SetField => 6,
            Opcode::Call | Opcode::New => 6,
            Opcode::CallMethod => 10,
        }
    }

    /// Loads only move values into registers; they are excluded from the
    /// non-load instruction count that drives inlining budgets.
    pub fn is_load(self) -> bool {
        matches!(
            self,
            Opcode::LoadConst
                | Opcode::LoadInt
                | Opcode::LoadUndefined
                | Opcode::LoadTrue
                | Opcode::LoadFalse
                | Opcode::LoadArg
                | Opcode::LoadThis
                | Opcode::LoadFunc
                | Opcode::Move
        )
    }
}

/// Binary operators shared by bytecode, IR and machine code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Lt,
    Le,
    Eq,
}

impl BinOp {
    pub fn from_opcode(op: Opcode) -> Option<BinOp> {
        match op {
            Opcode::Add => Some(BinOp::Add),
            Opcode::Sub => Some(BinOp::Sub),
            Opcode::Mul => Some(BinOp::Mul),
            Opcode::Lt => Some(BinOp::Lt),
            Opcode::Le => Some(BinOp::Le),
            Opcode::Eq => Some(BinOp::Eq),
            _ => None,
        }
    }

    pub fn opcode(self) -> Opcode {
        match self {
            BinOp::Add => Opcode::Add,
            BinOp::Sub => Opcode::Sub,
            BinOp::Mul => Opcode::Mul,
            BinOp::Lt => Opcode::Lt,
            BinOp::Le => Opcode::Le,
            BinOp::Eq => Opcode::Eq,
        }
    }

    /// Whether the result is a boolean
    pub fn is_comparison(self) -> bool {
        matches!(self, BinOp::Lt | BinOp::Le | BinOp::Eq)
    }

    pub fn to_u8(self) -> u8 {
        self.opcode() as u8
    }

    pub fn from_u8(byte: u8) -> Option<BinOp> {
        Opcode::from_u8(byte).and_then(BinOp::from_opcode)
    }
}

/// A decoded instruction. Jump targets are absolute bytecode offsets.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Nop,
    LoadConst { dst: Reg, index: u16 },
    LoadInt { dst: Reg, value: i32 },
    LoadUndefined { dst: Reg },
    LoadBool { dst: Reg, value: bool },
    LoadArg { dst: Reg, index: u8 },
    LoadThis { dst: Reg },
    LoadFunc { dst: Reg, local: u16 },
    Move { dst: Reg, src: Reg },
    Binary { op: BinOp, dst: Reg, lhs: Reg, rhs: Reg },
    Not { dst: Reg, src: Reg },
    Jump { target: u32 },
    JumpIf { cond: Reg, when: bool, target: u32 },
    LoopHeader { loop_id: u8 },
    NewObject { dst: Reg },
    GetField { dst: Reg, obj: Reg, name: u16, ic: u16 },
    SetField { obj: Reg, name: u16, src: Reg, ic: u16 },
    NewArray { dst: Reg, len: Reg },
    GetElem { dst: Reg, arr: Reg, idx: Reg },
    SetElem { arr: Reg, idx: Reg, src: Reg },
    ArrayLen { dst: Reg, arr: Reg },
    Call { dst: Reg, callee: Reg, first: Reg, argc: u8, site: u16 },
    CallMethod { dst: Reg, obj: Reg, name: u16, first: Reg, argc: u8, ic: u16, site: u16 },
    New { dst: Reg, ctor: Reg, first: Reg, argc: u8, site: u16 },
    TryBegin { handler: u32, exc: Reg },
    TryEnd,
    Throw { src: Reg },
    Return { src: Reg },
}

impl Instruction {
    /// Argument registers of a call, in order
    pub fn arg_regs(first: Reg, argc: u8) -> impl Iterator<Item = Reg> {
        (0..argc).map(move |i| first.wrapping_add(i))
    }

    /// Whether control never falls through to the next instruction
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Instruction::Jump { .. } | Instruction::Return { .. } | Instruction::Throw { .. }
        )
    }
}

struct Cursor<'a> {
    code: &'a [u8],
    pos: usize,
    start: usize,
}

impl<'a> Cursor<'a> {
    fn u8(&mut self) -> Result<u8> {
        let byte = *self
            .code
            .get(self.pos)
            .ok_or_else(|| Error::invalid_bytecode(self.start, "truncated instruction"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes([self.u8()?, self.u8()?]))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes([self.u8()?, self.u8()?, self.u8()?, self.u8()?]))
    }

    fn target(&mut self, size: usize) -> Result<u32> {
        let rel = self.i32()? as i64;
        let next = (self.start + 1 + size) as i64;
        let target = next + rel;
        if target < 0 || target > self.code.len() as i64 {
            return Err(Error::invalid_bytecode(self.start, format!("jump target {} out of range", target)));
        }
        Ok(target as u32)
    }
}

/// Decode the instruction at `offset`, returning it and the next offset
pub fn decode(code: &[u8], offset: usize) -> Result<(Instruction, usize)> {
    let byte = *code
        .get(offset)
        .ok_or_else(|| Error::invalid_bytecode(offset, "offset past end of code"))?;
    let op = Opcode::from_u8(byte)
        .ok_or_else(|| Error::invalid_bytecode(offset, format!("unknown opcode 0x{:02x}", byte)))?;
    let size = op.operand_size();
    let mut c = Cursor {
        code,
        pos: offset + 1,
        start: offset,
    };
    let instruction = match op {
        Opcode::Nop => Instruction::Nop,
        Opcode::LoadConst => Instruction::LoadConst { dst: c.u8()?, index: c.u16()? },
        Opcode::LoadInt => Instruction::LoadInt { dst: c.u8()?, value: c.i32()? },
        Opcode::LoadUndefined => Instruction::LoadUndefined { dst: c.u8()? },
        Opcode::LoadTrue => Instruction::LoadBool { dst: c.u8()?, value: true },
        Opcode::LoadFalse => Instruction::LoadBool { dst: c.u8()?, value: false },
        Opcode::LoadArg => Instruction::LoadArg { dst: c.u8()?, index: c.u8()? },
        Opcode::LoadThis => Instruction::LoadThis { dst: c.u8()? },
        Opcode::LoadFunc => Instruction::LoadFunc { dst: c.u8()?, local: c.u16()? },
        Opcode::Move => Instruction::Move { dst: c.u8()?, src: c.u8()? },
        Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Lt | Opcode::Le | Opcode::Eq => {
            let op = BinOp::from_opcode(op).ok_or_else(|| Error::internal("binary opcode"))?;
            Instruction::Binary { op, dst: c.u8()?, lhs: c.u8()?, rhs: c.u8()? }
        }
        Opcode::Not => Instruction::Not { dst: c.u8()?, src: c.u8()? },
        Opcode::Jump => Instruction::Jump { target: c.target(size)? },
        Opcode::JumpIfFalse | Opcode::JumpIfTrue => {
            let cond = c.u8()?;
            Instruction::JumpIf {
                cond,
                when: op == Opcode::JumpIfTrue,
                target: c.target(size)?,
            }
        }
        Opcode::LoopHeader => Instruction::LoopHeader { loop_id: c.u8()? },
        Opcode::NewObject => Instruction::NewObject { dst: c.u8()? },
        Opcode::GetField => Instruction::GetField { dst: c.u8()?, obj: c.u8()?, name: c.u16()?, ic: c.u16()? },
        Opcode::SetField => Instruction::SetField { obj: c.u8()?, name: c.u16()?, src: c.u8()?, ic: c.u16()? },
        Opcode::NewArray => Instruction::NewArray { dst: c.u8()?, len: c.u8()? },
        Opcode::GetElem => Instruction::GetElem { dst: c.u8()?, arr: c.u8()?, idx: c.u8()? },
        Opcode::SetElem => Instruction::SetElem { arr: c.u8()?, idx: c.u8()?, src: c.u8()? },
        Opcode::ArrayLen => Instruction::ArrayLen { dst: c.u8()?, arr: c.u8()? },
        Opcode::Call => Instruction::Call {
            dst: c.u8()?,
            callee: c.u8()?,
            first: c.u8()?,
            argc: c.u8()?,
            site: c.u16()?,
        },
        Opcode::CallMethod => Instruction::CallMethod {
            dst: c.u8()?,
            obj: c.u8()?,
            name: c.u16()?,
            first: c.u8()?,
            argc: c.u8()?,
            ic: c.u16()?,
            site: c.u16()?,
        },
        Opcode::New => Instruction::New {
            dst: c.u8()?,
            ctor: c.u8()?,
            first: c.u8()?,
            argc: c.u8()?,
            site: c.u16()?,
        },
        Opcode::TryBegin => {
            let handler = c.target(size)?;
            Instruction::TryBegin { handler, exc: c.u8()? }
        }
        Opcode::TryEnd => Instruction::TryEnd,
        Opcode::Throw => Instruction::Throw { src: c.u8()? },
        Opcode::Return => Instruction::Return { src: c.u8()? },
    };
    debug_assert_eq!(c.pos, offset + 1 + size, "operand size mismatch for {:?}", op);
    Ok((instruction, offset + 1 + size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_u8_round_trip() {
        for byte in 0u8..=0xff {
            if let Some(op) = Opcode::from_u8(byte) {
                assert_eq!(op as u8, byte);
            }
        }
    }

    #[test]
    fn test_decode_relative_jump() {
        // Jump +2 skips the following two Nops
        let code = [Opcode::Jump as u8, 2, 0, 0, 0, 0, 0, Opcode::Return as u8, 0];
        let (instr, next) = decode(&code, 0).unwrap();
        assert_eq!(next, 5);
        assert_eq!(instr, Instruction::Jump { target: 7 });
    }

    #[test]
    fn test_decode_rejects_unknown_opcode() {
        assert!(matches!(decode(&[0xee], 0), Err(Error::InvalidBytecode { .. })));
    }

    #[test]
    fn test_decode_rejects_truncated() {
        assert!(decode(&[Opcode::LoadInt as u8, 0, 1], 0).is_err());
    }

    #[test]
    fn test_loads_are_classified() {
        assert!(Opcode::Move.is_load());
        assert!(Opcode::LoadFunc.is_load());
        assert!(!Opcode::Add.is_load());
        assert!(!Opcode::Return.is_load());
    }
}
