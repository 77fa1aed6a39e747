//! Lowered instructions and the portable machine encoding
//!
//! LIR operates on machine locations (general/float registers and stack
//! slots) instead of virtual registers. The encoding is fixed-width per
//! opcode: branch targets are always four bytes, so the encoder can size
//! the stream before labels are resolved.
//!
//! Before encoding, `Jump`/`Branch` targets are label ids; in decoded
//! machine code they are byte offsets from the start of the code.

use super::ir::NumKind;
use crate::bytecode::BinOp;
use crate::error::{Error, Result};
use crate::runtime::{FunctionId, PropertyGuardId, PropertyId, TypeId, Value};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A machine location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Loc {
    Gpr(u8),
    Fpr(u8),
    Stack(u16),
}

impl fmt::Display for Loc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Loc::Gpr(r) => write!(f, "r{}", r),
            Loc::Fpr(r) => write!(f, "f{}", r),
            Loc::Stack(s) => write!(f, "[sp+{}]", s),
        }
    }
}

/// Tag of an immediate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImmTag {
    Undefined,
    Bool,
    Int,
    Float,
    Func,
}

/// Raw immediate: a tag plus payload bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Imm {
    pub tag: ImmTag,
    pub bits: u64,
}

impl Imm {
    pub fn undefined() -> Self {
        Self {
            tag: ImmTag::Undefined,
            bits: 0,
        }
    }

    pub fn bool(b: bool) -> Self {
        Self {
            tag: ImmTag::Bool,
            bits: b as u64,
        }
    }

    pub fn int(i: i32) -> Self {
        Self {
            tag: ImmTag::Int,
            bits: i as u32 as u64,
        }
    }

    pub fn float(x: f64) -> Self {
        Self {
            tag: ImmTag::Float,
            bits: x.to_bits(),
        }
    }

    pub fn func(f: FunctionId) -> Self {
        Self {
            tag: ImmTag::Func,
            bits: f.0 as u64,
        }
    }

    /// Payload width in bytes
    pub fn width(&self) -> u32 {
        match self.tag {
            ImmTag::Undefined => 0,
            ImmTag::Bool => 1,
            ImmTag::Int | ImmTag::Func => 4,
            ImmTag::Float => 8,
        }
    }

    /// Mask covering the payload width
    pub fn mask(&self) -> u64 {
        match self.width() {
            8 => u64::MAX,
            w => (1u64 << (w * 8)) - 1,
        }
    }

    pub fn to_value(self) -> Value {
        match self.tag {
            ImmTag::Undefined => Value::Undefined,
            ImmTag::Bool => Value::Boolean(self.bits & 1 != 0),
            ImmTag::Int => Value::Int(self.bits as u32 as i32),
            ImmTag::Float => Value::Float(f64::from_bits(self.bits)),
            ImmTag::Func => Value::Function(FunctionId(self.bits as u32)),
        }
    }

    /// Payload bits of a value carrying this tag
    pub fn bits_of(tag: ImmTag, value: &Value) -> Option<u64> {
        match (tag, value) {
            (ImmTag::Undefined, Value::Undefined) => Some(0),
            (ImmTag::Bool, Value::Boolean(b)) => Some(*b as u64),
            (ImmTag::Int, Value::Int(i)) => Some(*i as u32 as u64),
            (ImmTag::Float, Value::Float(x)) => Some(x.to_bits()),
            (ImmTag::Func, Value::Function(f)) => Some(f.0 as u64),
            _ => None,
        }
    }
}

/// Lowered guard
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LirGuard {
    Int(Loc),
    Number(Loc),
    Array(Loc),
    Type(Loc, Vec<TypeId>),
    Callee(Loc, FunctionId),
    Property(PropertyGuardId),
    Bounds { arr: Loc, idx: Loc },
}

/// Runtime entry points compiled code calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Helper {
    /// args: `[obj]`
    GetField { function: FunctionId, prop: PropertyId, ic: u16 },
    /// args: `[obj, value]`
    SetField { function: FunctionId, prop: PropertyId, ic: u16 },
    /// args: `[callee, args..]`
    Call { function: FunctionId, site: u16 },
    /// args: `[obj, args..]`
    CallMethod { function: FunctionId, prop: PropertyId, ic: u16, site: u16 },
    /// args: `[ctor, args..]`
    Construct { function: FunctionId, site: u16 },
    /// args: `[this?, args..]`
    CallDirect { target: FunctionId, has_this: bool },
}

/// Lowered operations
#[derive(Debug, Clone, PartialEq)]
pub enum LirOp {
    /// Reserve the frame: `slots` stack values plus stack-allocated scope
    /// and display slots
    Prologue { slots: u16, scope_slots: u16, display_slots: u16 },
    MovImm { dst: Loc, imm: Imm },
    /// Second half of a blinded constant: `dst ^= key` on the payload
    XorImm { dst: Loc, tag: ImmTag, key: u64 },
    /// Load from the code's constant pool
    MovConst { dst: Loc, index: u32 },
    Mov { dst: Loc, src: Loc },
    LoadArg { dst: Loc, index: u8 },
    LoadThis { dst: Loc },
    Binary { op: BinOp, kind: NumKind, dst: Loc, lhs: Loc, rhs: Loc, overflow: Option<u32> },
    Not { dst: Loc, src: Loc },
    /// Zero-size marker
    Label(u32),
    Jump(u32),
    Branch { cond: Loc, when: bool, target: u32 },
    Guard { guard: LirGuard, bailout: u32 },
    LoadSlot { dst: Loc, obj: Loc, slot: u32 },
    StoreSlot { obj: Loc, slot: u32, src: Loc, prop: PropertyId, barrier: bool },
    GetElem { dst: Loc, arr: Loc, idx: Loc, checked: bool },
    SetElem { arr: Loc, idx: Loc, src: Loc, barrier: bool },
    ArrayLen { dst: Loc, arr: Loc },
    NewArray { dst: Loc, len: Loc },
    NewObject { dst: Loc },
    CreateThis { dst: Loc, ctor: FunctionId, capacity: u32 },
    CallHelper { helper: Helper, dst: Option<Loc>, args: Vec<Loc> },
    CtorResult { dst: Loc, value: Loc, this: Loc },
    LoopTick { function: FunctionId, loop_id: u8 },
    LoopExit { target: u32 },
    Throw { src: Loc },
    Ret { src: Loc },
    /// `len` one-byte no-ops
    Nop { len: u8 },
}

impl LirOp {
    pub fn is_call(&self) -> bool {
        matches!(self, LirOp::CallHelper { .. })
    }

    pub fn is_return(&self) -> bool {
        matches!(self, LirOp::Ret { .. })
    }
}

/// One LIR instruction with the source position it came from
#[derive(Debug, Clone, PartialEq)]
pub struct LirInstr {
    pub op: LirOp,
    pub offset: u32,
    pub frame: u32,
    /// Bound to the following instruction; nothing may be inserted between
    pub atomic: bool,
}

impl LirInstr {
    pub fn new(op: LirOp, offset: u32, frame: u32) -> Self {
        Self {
            op,
            offset,
            frame,
            atomic: false,
        }
    }
}

// ==================== Encoding ====================

mod op {
    pub const PROLOGUE: u8 = 0x01;
    pub const MOV_IMM: u8 = 0x02;
    pub const XOR_IMM: u8 = 0x03;
    pub const MOV_CONST: u8 = 0x04;
    pub const MOV: u8 = 0x05;
    pub const LOAD_ARG: u8 = 0x06;
    pub const LOAD_THIS: u8 = 0x07;
    pub const BINARY: u8 = 0x10;
    pub const NOT: u8 = 0x11;
    pub const JUMP: u8 = 0x20;
    pub const BRANCH: u8 = 0x21;
    pub const GUARD: u8 = 0x22;
    pub const LOAD_SLOT: u8 = 0x30;
    pub const STORE_SLOT: u8 = 0x31;
    pub const GET_ELEM: u8 = 0x32;
    pub const SET_ELEM: u8 = 0x33;
    pub const ARRAY_LEN: u8 = 0x34;
    pub const NEW_ARRAY: u8 = 0x35;
    pub const NEW_OBJECT: u8 = 0x36;
    pub const CREATE_THIS: u8 = 0x37;
    pub const CALL_HELPER: u8 = 0x40;
    pub const CTOR_RESULT: u8 = 0x41;
    pub const LOOP_TICK: u8 = 0x50;
    pub const LOOP_EXIT: u8 = 0x51;
    pub const THROW: u8 = 0x52;
    pub const RET: u8 = 0x53;
    pub const NOP: u8 = 0x90;
}

struct Writer<'a> {
    out: &'a mut Vec<u8>,
}

impl Writer<'_> {
    fn u8(&mut self, v: u8) {
        self.out.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn bool(&mut self, v: bool) {
        self.u8(v as u8);
    }

    fn loc(&mut self, loc: Loc) {
        let (kind, index) = match loc {
            Loc::Gpr(r) => (0, r as u16),
            Loc::Fpr(r) => (1, r as u16),
            Loc::Stack(s) => (2, s),
        };
        self.u8(kind);
        self.u16(index);
    }

    fn tag(&mut self, tag: ImmTag) {
        self.u8(match tag {
            ImmTag::Undefined => 0,
            ImmTag::Bool => 1,
            ImmTag::Int => 2,
            ImmTag::Float => 3,
            ImmTag::Func => 4,
        });
    }

    fn kind(&mut self, kind: NumKind) {
        self.u8(match kind {
            NumKind::Generic => 0,
            NumKind::Int => 1,
            NumKind::Float => 2,
        });
    }
}

/// Append the encoding of `op` to `out`. Labels encode to nothing.
pub fn encode_op(op: &LirOp, out: &mut Vec<u8>) -> Result<()> {
    let mut w = Writer { out };
    match op {
        LirOp::Prologue {
            slots,
            scope_slots,
            display_slots,
        } => {
            w.u8(op::PROLOGUE);
            w.u16(*slots);
            w.u16(*scope_slots);
            w.u16(*display_slots);
        }
        LirOp::MovImm { dst, imm } => {
            w.u8(op::MOV_IMM);
            w.loc(*dst);
            w.tag(imm.tag);
            w.u64(imm.bits);
        }
        LirOp::XorImm { dst, tag, key } => {
            w.u8(op::XOR_IMM);
            w.loc(*dst);
            w.tag(*tag);
            w.u64(*key);
        }
        LirOp::MovConst { dst, index } => {
            w.u8(op::MOV_CONST);
            w.loc(*dst);
            w.u32(*index);
        }
        LirOp::Mov { dst, src } => {
            w.u8(op::MOV);
            w.loc(*dst);
            w.loc(*src);
        }
        LirOp::LoadArg { dst, index } => {
            w.u8(op::LOAD_ARG);
            w.loc(*dst);
            w.u8(*index);
        }
        LirOp::LoadThis { dst } => {
            w.u8(op::LOAD_THIS);
            w.loc(*dst);
        }
        LirOp::Binary {
            op: bin,
            kind,
            dst,
            lhs,
            rhs,
            overflow,
        } => {
            w.u8(op::BINARY);
            w.u8(bin.to_u8());
            w.kind(*kind);
            w.loc(*dst);
            w.loc(*lhs);
            w.loc(*rhs);
            w.bool(overflow.is_some());
            w.u32(overflow.unwrap_or(0));
        }
        LirOp::Not { dst, src } => {
            w.u8(op::NOT);
            w.loc(*dst);
            w.loc(*src);
        }
        LirOp::Label(_) => {}
        LirOp::Jump(target) => {
            w.u8(op::JUMP);
            w.u32(*target);
        }
        LirOp::Branch { cond, when, target } => {
            w.u8(op::BRANCH);
            w.loc(*cond);
            w.bool(*when);
            w.u32(*target);
        }
        LirOp::Guard { guard, bailout } => {
            w.u8(op::GUARD);
            w.u32(*bailout);
            match guard {
                LirGuard::Int(l) => {
                    w.u8(0);
                    w.loc(*l);
                }
                LirGuard::Number(l) => {
                    w.u8(1);
                    w.loc(*l);
                }
                LirGuard::Array(l) => {
                    w.u8(2);
                    w.loc(*l);
                }
                LirGuard::Type(l, types) => {
                    w.u8(3);
                    w.loc(*l);
                    let n = u8::try_from(types.len()).map_err(|_| Error::internal("type guard too wide"))?;
                    w.u8(n);
                    for t in types {
                        w.u32(t.0);
                    }
                }
                LirGuard::Callee(l, f) => {
                    w.u8(4);
                    w.loc(*l);
                    w.u32(f.0);
                }
                LirGuard::Property(g) => {
                    w.u8(5);
                    w.u32(g.0);
                }
                LirGuard::Bounds { arr, idx } => {
                    w.u8(6);
                    w.loc(*arr);
                    w.loc(*idx);
                }
            }
        }
        LirOp::LoadSlot { dst, obj, slot } => {
            w.u8(op::LOAD_SLOT);
            w.loc(*dst);
            w.loc(*obj);
            w.u32(*slot);
        }
        LirOp::StoreSlot {
            obj,
            slot,
            src,
            prop,
            barrier,
        } => {
            w.u8(op::STORE_SLOT);
            w.loc(*obj);
            w.u32(*slot);
            w.loc(*src);
            w.u32(prop.0);
            w.bool(*barrier);
        }
        LirOp::GetElem { dst, arr, idx, checked } => {
            w.u8(op::GET_ELEM);
            w.loc(*dst);
            w.loc(*arr);
            w.loc(*idx);
            w.bool(*checked);
        }
        LirOp::SetElem { arr, idx, src, barrier } => {
            w.u8(op::SET_ELEM);
            w.loc(*arr);
            w.loc(*idx);
            w.loc(*src);
            w.bool(*barrier);
        }
        LirOp::ArrayLen { dst, arr } => {
            w.u8(op::ARRAY_LEN);
            w.loc(*dst);
            w.loc(*arr);
        }
        LirOp::NewArray { dst, len } => {
            w.u8(op::NEW_ARRAY);
            w.loc(*dst);
            w.loc(*len);
        }
        LirOp::NewObject { dst } => {
            w.u8(op::NEW_OBJECT);
            w.loc(*dst);
        }
        LirOp::CreateThis { dst, ctor, capacity } => {
            w.u8(op::CREATE_THIS);
            w.loc(*dst);
            w.u32(ctor.0);
            w.u32(*capacity);
        }
        LirOp::CallHelper { helper, dst, args } => {
            w.u8(op::CALL_HELPER);
            match helper {
                Helper::GetField { function, prop, ic } => {
                    w.u8(0);
                    w.u32(function.0);
                    w.u32(prop.0);
                    w.u16(*ic);
                }
                Helper::SetField { function, prop, ic } => {
                    w.u8(1);
                    w.u32(function.0);
                    w.u32(prop.0);
                    w.u16(*ic);
                }
                Helper::Call { function, site } => {
                    w.u8(2);
                    w.u32(function.0);
                    w.u16(*site);
                }
                Helper::CallMethod {
                    function,
                    prop,
                    ic,
                    site,
                } => {
                    w.u8(3);
                    w.u32(function.0);
                    w.u32(prop.0);
                    w.u16(*ic);
                    w.u16(*site);
                }
                Helper::Construct { function, site } => {
                    w.u8(4);
                    w.u32(function.0);
                    w.u16(*site);
                }
                Helper::CallDirect { target, has_this } => {
                    w.u8(5);
                    w.u32(target.0);
                    w.bool(*has_this);
                }
            }
            w.bool(dst.is_some());
            w.loc(dst.unwrap_or(Loc::Gpr(0)));
            let n = u8::try_from(args.len()).map_err(|_| Error::internal("too many helper arguments"))?;
            w.u8(n);
            for a in args {
                w.loc(*a);
            }
        }
        LirOp::CtorResult { dst, value, this } => {
            w.u8(op::CTOR_RESULT);
            w.loc(*dst);
            w.loc(*value);
            w.loc(*this);
        }
        LirOp::LoopTick { function, loop_id } => {
            w.u8(op::LOOP_TICK);
            w.u32(function.0);
            w.u8(*loop_id);
        }
        LirOp::LoopExit { target } => {
            w.u8(op::LOOP_EXIT);
            w.u32(*target);
        }
        LirOp::Throw { src } => {
            w.u8(op::THROW);
            w.loc(*src);
        }
        LirOp::Ret { src } => {
            w.u8(op::RET);
            w.loc(*src);
        }
        LirOp::Nop { len } => {
            for _ in 0..*len {
                w.u8(op::NOP);
            }
        }
    }
    Ok(())
}

/// Encoded size of `op`
pub fn encoded_len(op: &LirOp) -> Result<usize> {
    let mut scratch = Vec::with_capacity(32);
    encode_op(op, &mut scratch)?;
    Ok(scratch.len())
}

// ==================== Decoding ====================

struct Reader<'a> {
    code: &'a [u8],
    pos: usize,
}

fn corrupt(at: usize) -> Error {
    Error::internal(format!("corrupt machine code at +{:#x}", at))
}

impl Reader<'_> {
    fn u8(&mut self) -> Result<u8> {
        let b = *self.code.get(self.pos).ok_or_else(|| corrupt(self.pos))?;
        self.pos += 1;
        Ok(b)
    }

    fn bytes<const N: usize>(&mut self) -> Result<[u8; N]> {
        let slice = self
            .code
            .get(self.pos..self.pos + N)
            .ok_or_else(|| corrupt(self.pos))?;
        self.pos += N;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.bytes()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.bytes()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.bytes()?))
    }

    fn bool(&mut self) -> Result<bool> {
        Ok(self.u8()? != 0)
    }

    fn loc(&mut self) -> Result<Loc> {
        let at = self.pos;
        let kind = self.u8()?;
        let index = self.u16()?;
        match kind {
            0 => Ok(Loc::Gpr(index as u8)),
            1 => Ok(Loc::Fpr(index as u8)),
            2 => Ok(Loc::Stack(index)),
            _ => Err(corrupt(at)),
        }
    }

    fn tag(&mut self) -> Result<ImmTag> {
        let at = self.pos;
        match self.u8()? {
            0 => Ok(ImmTag::Undefined),
            1 => Ok(ImmTag::Bool),
            2 => Ok(ImmTag::Int),
            3 => Ok(ImmTag::Float),
            4 => Ok(ImmTag::Func),
            _ => Err(corrupt(at)),
        }
    }

    fn kind(&mut self) -> Result<NumKind> {
        let at = self.pos;
        match self.u8()? {
            0 => Ok(NumKind::Generic),
            1 => Ok(NumKind::Int),
            2 => Ok(NumKind::Float),
            _ => Err(corrupt(at)),
        }
    }

    fn function(&mut self) -> Result<FunctionId> {
        Ok(FunctionId(self.u32()?))
    }

    fn prop(&mut self) -> Result<PropertyId> {
        Ok(PropertyId(self.u32()?))
    }
}

/// Decode one instruction at `pos`; returns it and the next position
pub fn decode_op(code: &[u8], pos: usize) -> Result<(LirOp, usize)> {
    let mut r = Reader { code, pos };
    let opcode = r.u8()?;
    let op = match opcode {
        op::PROLOGUE => LirOp::Prologue {
            slots: r.u16()?,
            scope_slots: r.u16()?,
            display_slots: r.u16()?,
        },
        op::MOV_IMM => {
            let dst = r.loc()?;
            let tag = r.tag()?;
            LirOp::MovImm {
                dst,
                imm: Imm { tag, bits: r.u64()? },
            }
        }
        op::XOR_IMM => LirOp::XorImm {
            dst: r.loc()?,
            tag: r.tag()?,
            key: r.u64()?,
        },
        op::MOV_CONST => LirOp::MovConst {
            dst: r.loc()?,
            index: r.u32()?,
        },
        op::MOV => LirOp::Mov {
            dst: r.loc()?,
            src: r.loc()?,
        },
        op::LOAD_ARG => LirOp::LoadArg {
            dst: r.loc()?,
            index: r.u8()?,
        },
        op::LOAD_THIS => LirOp::LoadThis { dst: r.loc()? },
        op::BINARY => {
            let bin = BinOp::from_u8(r.u8()?).ok_or_else(|| corrupt(pos + 1))?;
            let kind = r.kind()?;
            let (dst, lhs, rhs) = (r.loc()?, r.loc()?, r.loc()?);
            let has_overflow = r.bool()?;
            let overflow = r.u32()?;
            LirOp::Binary {
                op: bin,
                kind,
                dst,
                lhs,
                rhs,
                overflow: has_overflow.then_some(overflow),
            }
        }
        op::NOT => LirOp::Not {
            dst: r.loc()?,
            src: r.loc()?,
        },
        op::JUMP => LirOp::Jump(r.u32()?),
        op::BRANCH => LirOp::Branch {
            cond: r.loc()?,
            when: r.bool()?,
            target: r.u32()?,
        },
        op::GUARD => {
            let bailout = r.u32()?;
            let at = r.pos;
            let guard = match r.u8()? {
                0 => LirGuard::Int(r.loc()?),
                1 => LirGuard::Number(r.loc()?),
                2 => LirGuard::Array(r.loc()?),
                3 => {
                    let l = r.loc()?;
                    let n = r.u8()?;
                    let mut types = Vec::with_capacity(n as usize);
                    for _ in 0..n {
                        types.push(TypeId(r.u32()?));
                    }
                    LirGuard::Type(l, types)
                }
                4 => LirGuard::Callee(r.loc()?, r.function()?),
                5 => LirGuard::Property(PropertyGuardId(r.u32()?)),
                6 => LirGuard::Bounds {
                    arr: r.loc()?,
                    idx: r.loc()?,
                },
                _ => return Err(corrupt(at)),
            };
            LirOp::Guard { guard, bailout }
        }
        op::LOAD_SLOT => LirOp::LoadSlot {
            dst: r.loc()?,
            obj: r.loc()?,
            slot: r.u32()?,
        },
        op::STORE_SLOT => LirOp::StoreSlot {
            obj: r.loc()?,
            slot: r.u32()?,
            src: r.loc()?,
            prop: r.prop()?,
            barrier: r.bool()?,
        },
        op::GET_ELEM => LirOp::GetElem {
            dst: r.loc()?,
            arr: r.loc()?,
            idx: r.loc()?,
            checked: r.bool()?,
        },
        op::SET_ELEM => LirOp::SetElem {
            arr: r.loc()?,
            idx: r.loc()?,
            src: r.loc()?,
            barrier: r.bool()?,
        },
        op::ARRAY_LEN => LirOp::ArrayLen {
            dst: r.loc()?,
            arr: r.loc()?,
        },
        op::NEW_ARRAY => LirOp::NewArray {
            dst: r.loc()?,
            len: r.loc()?,
        },
        op::NEW_OBJECT => LirOp::NewObject { dst: r.loc()? },
        op::CREATE_THIS => LirOp::CreateThis {
            dst: r.loc()?,
            ctor: r.function()?,
            capacity: r.u32()?,
        },
        op::CALL_HELPER => {
            let at = r.pos;
            let helper = match r.u8()? {
                0 => Helper::GetField {
                    function: r.function()?,
                    prop: r.prop()?,
                    ic: r.u16()?,
                },
                1 => Helper::SetField {
                    function: r.function()?,
                    prop: r.prop()?,
                    ic: r.u16()?,
                },
                2 => Helper::Call {
                    function: r.function()?,
                    site: r.u16()?,
                },
                3 => Helper::CallMethod {
                    function: r.function()?,
                    prop: r.prop()?,
                    ic: r.u16()?,
                    site: r.u16()?,
                },
                4 => Helper::Construct {
                    function: r.function()?,
                    site: r.u16()?,
                },
                5 => Helper::CallDirect {
                    target: r.function()?,
                    has_this: r.bool()?,
                },
                _ => return Err(corrupt(at)),
            };
            let has_dst = r.bool()?;
            let dst = r.loc()?;
            let n = r.u8()?;
            let mut args = Vec::with_capacity(n as usize);
            for _ in 0..n {
                args.push(r.loc()?);
            }
            LirOp::CallHelper {
                helper,
                dst: has_dst.then_some(dst),
                args,
            }
        }
        op::CTOR_RESULT => LirOp::CtorResult {
            dst: r.loc()?,
            value: r.loc()?,
            this: r.loc()?,
        },
        op::LOOP_TICK => LirOp::LoopTick {
            function: r.function()?,
            loop_id: r.u8()?,
        },
        op::LOOP_EXIT => LirOp::LoopExit { target: r.u32()? },
        op::THROW => LirOp::Throw { src: r.loc()? },
        op::RET => LirOp::Ret { src: r.loc()? },
        op::NOP => LirOp::Nop { len: 1 },
        _ => return Err(corrupt(pos)),
    };
    Ok((op, r.pos))
}

/// Decode a whole code buffer into `(byte offset, op)` pairs
pub fn decode_all(code: &[u8]) -> Result<Vec<(u32, LirOp)>> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < code.len() {
        let (op, next) = decode_op(code, pos)?;
        out.push((pos as u32, op));
        pos = next;
    }
    Ok(out)
}

impl fmt::Display for LirOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LirOp::Prologue {
                slots,
                scope_slots,
                display_slots,
            } => write!(f, "prologue slots={} scope={} display={}", slots, scope_slots, display_slots),
            LirOp::MovImm { dst, imm } => write!(f, "mov {}, {:?}:{:#x}", dst, imm.tag, imm.bits),
            LirOp::XorImm { dst, key, .. } => write!(f, "xor {}, {:#x}", dst, key),
            LirOp::MovConst { dst, index } => write!(f, "mov {}, const[{}]", dst, index),
            LirOp::Mov { dst, src } => write!(f, "mov {}, {}", dst, src),
            LirOp::LoadArg { dst, index } => write!(f, "mov {}, arg{}", dst, index),
            LirOp::LoadThis { dst } => write!(f, "mov {}, this", dst),
            LirOp::Binary {
                op, kind, dst, lhs, rhs, ..
            } => write!(f, "{:?}.{:?} {}, {}, {}", op, kind, dst, lhs, rhs),
            LirOp::Not { dst, src } => write!(f, "not {}, {}", dst, src),
            LirOp::Label(l) => write!(f, "L{}:", l),
            LirOp::Jump(t) => write!(f, "jmp {:#x}", t),
            LirOp::Branch { cond, when, target } => write!(f, "b{} {}, {:#x}", if *when { "t" } else { "f" }, cond, target),
            LirOp::Guard { guard, bailout } => write!(f, "guard {:?} else #{}", guard, bailout),
            LirOp::LoadSlot { dst, obj, slot } => write!(f, "ldslot {}, {}[{}]", dst, obj, slot),
            LirOp::StoreSlot { obj, slot, src, barrier, .. } => {
                write!(f, "stslot {}[{}], {}{}", obj, slot, src, if *barrier { " +wb" } else { "" })
            }
            LirOp::GetElem { dst, arr, idx, checked } => {
                write!(f, "ldelem{} {}, {}[{}]", if *checked { "" } else { ".u" }, dst, arr, idx)
            }
            LirOp::SetElem { arr, idx, src, barrier } => {
                write!(f, "stelem {}[{}], {}{}", arr, idx, src, if *barrier { " +wb" } else { "" })
            }
            LirOp::ArrayLen { dst, arr } => write!(f, "len {}, {}", dst, arr),
            LirOp::NewArray { dst, len } => write!(f, "newarr {}, {}", dst, len),
            LirOp::NewObject { dst } => write!(f, "newobj {}", dst),
            LirOp::CreateThis { dst, ctor, .. } => write!(f, "newthis {}, {}", dst, ctor),
            LirOp::CallHelper { helper, dst, args } => {
                write!(f, "call {:?}", helper)?;
                if let Some(d) = dst {
                    write!(f, " -> {}", d)?;
                }
                for a in args {
                    write!(f, " {}", a)?;
                }
                Ok(())
            }
            LirOp::CtorResult { dst, value, this } => write!(f, "ctorres {}, {}, {}", dst, value, this),
            LirOp::LoopTick { loop_id, .. } => write!(f, "looptick {}", loop_id),
            LirOp::LoopExit { target } => write!(f, "loopexit @{:04}", target),
            LirOp::Throw { src } => write!(f, "throw {}", src),
            LirOp::Ret { src } => write!(f, "ret {}", src),
            LirOp::Nop { len } => write!(f, "nop{}", len),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_helper_decodes() {
        let op = LirOp::CallHelper {
            helper: Helper::CallMethod {
                function: FunctionId(3),
                prop: PropertyId(9),
                ic: 2,
                site: 1,
            },
            dst: Some(Loc::Stack(4)),
            args: vec![Loc::Gpr(1), Loc::Fpr(0)],
        };
        let mut bytes = Vec::new();
        encode_op(&op, &mut bytes).unwrap();
        let (decoded, next) = decode_op(&bytes, 0).unwrap();
        assert_eq!(decoded, op);
        assert_eq!(next, bytes.len());
    }

    #[test]
    fn test_labels_are_zero_size_and_nops_split() {
        assert_eq!(encoded_len(&LirOp::Label(3)).unwrap(), 0);
        let mut bytes = Vec::new();
        encode_op(&LirOp::Nop { len: 3 }, &mut bytes).unwrap();
        encode_op(&LirOp::Ret { src: Loc::Gpr(0) }, &mut bytes).unwrap();
        let decoded = decode_all(&bytes).unwrap();
        assert_eq!(decoded.len(), 4);
        assert_eq!(decoded[3], (3, LirOp::Ret { src: Loc::Gpr(0) }));
    }

    #[test]
    fn test_branch_width_is_fixed() {
        let near = encoded_len(&LirOp::Jump(1)).unwrap();
        let far = encoded_len(&LirOp::Jump(u32::MAX)).unwrap();
        assert_eq!(near, far);
    }

    #[test]
    fn test_corrupt_opcode() {
        assert!(decode_op(&[0xEE], 0).is_err());
    }

    #[test]
    fn test_imm_values() {
        assert!(matches!(Imm::int(-5).to_value(), Value::Int(-5)));
        assert_eq!(Imm::int(-1).mask(), 0xFFFF_FFFF);
        assert_eq!(Imm::bits_of(ImmTag::Float, &Value::Float(1.5)), Some(1.5f64.to_bits()));
        assert_eq!(Imm::bits_of(ImmTag::Int, &Value::Float(1.5)), None);
    }
}
