//! Architecture-neutral IR
//!
//! A linear instruction list over virtual registers. Each instruction keeps
//! the bytecode offset and inline frame it came from, which is what lets the
//! lowerer build bailout and throw maps back to interpreter state.

pub mod builder;

pub use builder::build;

use super::snapshot::EquivalentTypeSet;
use super::tier::ExecutionMode;
use super::work_item::WorkKind;
use crate::bytecode::{BinOp, Instruction};
use crate::runtime::{FunctionId, PropertyGuardId, PropertyId};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type VReg = u32;
pub type LabelId = u32;
pub type FrameId = u32;
pub type BailoutId = u32;

/// Constant operand
#[derive(Debug, Clone, PartialEq)]
pub enum IrConst {
    Undefined,
    Bool(bool),
    Int(i32),
    Float(f64),
    Str(String),
    Func(FunctionId),
}

/// How an arithmetic/comparison instruction is computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumKind {
    /// Full dynamic semantics
    Generic,
    /// Both operands known Int32; arithmetic bails out on overflow
    Int,
    /// Both operands known numbers
    Float,
}

/// Runtime check protecting a specialized instruction
#[derive(Debug, Clone, PartialEq)]
pub enum GuardKind {
    Int(VReg),
    Number(VReg),
    Array(VReg),
    /// Object whose type is in the set
    Type(VReg, EquivalentTypeSet),
    /// Exactly this function
    Callee(VReg, FunctionId),
    /// Fixed-field property guard still intact
    Property(PropertyGuardId),
    /// `0 <= idx < arr.length`
    Bounds { arr: VReg, idx: VReg },
}

impl GuardKind {
    pub fn uses(&self) -> Vec<VReg> {
        match self {
            GuardKind::Int(v) | GuardKind::Number(v) | GuardKind::Array(v) => vec![*v],
            GuardKind::Type(v, _) | GuardKind::Callee(v, _) => vec![*v],
            GuardKind::Property(_) => vec![],
            GuardKind::Bounds { arr, idx } => vec![*arr, *idx],
        }
    }
}

/// Why compiled code gave control back to the interpreter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BailoutReason {
    TypeMismatch,
    Overflow,
    UnexpectedShape,
    WrongCallee,
    FixedFieldInvalidated,
    BoundsCheck,
}

impl BailoutReason {
    pub fn for_guard(kind: &GuardKind) -> Self {
        match kind {
            GuardKind::Int(_) | GuardKind::Number(_) | GuardKind::Array(_) => BailoutReason::TypeMismatch,
            GuardKind::Type(..) => BailoutReason::UnexpectedShape,
            GuardKind::Callee(..) => BailoutReason::WrongCallee,
            GuardKind::Property(_) => BailoutReason::FixedFieldInvalidated,
            GuardKind::Bounds { .. } => BailoutReason::BoundsCheck,
        }
    }
}

/// IR operations
#[derive(Debug, Clone, PartialEq)]
pub enum IrOp {
    LoadConst { dst: VReg, value: IrConst },
    LoadArg { dst: VReg, index: u8 },
    LoadThis { dst: VReg },
    Move { dst: VReg, src: VReg },
    Binary { op: BinOp, kind: NumKind, dst: VReg, lhs: VReg, rhs: VReg, overflow: Option<BailoutId> },
    Not { dst: VReg, src: VReg },

    Label(LabelId),
    Jump(LabelId),
    Branch { cond: VReg, when: bool, target: LabelId },
    LoopHeader { function: FunctionId, loop_id: u8 },

    NewObject { dst: VReg },
    /// `this` object for an inlined constructor
    CreateThis { dst: VReg, ctor: FunctionId, capacity: u32 },
    GetField { dst: VReg, obj: VReg, prop: PropertyId, function: FunctionId, ic: u16 },
    SetField { obj: VReg, prop: PropertyId, src: VReg, function: FunctionId, ic: u16 },
    /// Direct slot access; requires a dominating type guard
    LoadSlot { dst: VReg, obj: VReg, slot: u32 },
    StoreSlot { obj: VReg, slot: u32, src: VReg, prop: PropertyId },

    NewArray { dst: VReg, len: VReg },
    /// `checked == false` requires array, int and bounds guards
    GetElem { dst: VReg, arr: VReg, idx: VReg, checked: bool },
    SetElem { arr: VReg, idx: VReg, src: VReg },
    ArrayLen { dst: VReg, arr: VReg },

    Call { dst: VReg, callee: VReg, args: Vec<VReg>, function: FunctionId, site: u16 },
    CallMethod { dst: VReg, obj: VReg, prop: PropertyId, args: Vec<VReg>, function: FunctionId, ic: u16, site: u16 },
    Construct { dst: VReg, ctor: VReg, args: Vec<VReg>, function: FunctionId, site: u16 },
    /// Call of a known function; requires a callee or fixed-field guard
    CallDirect { dst: VReg, target: FunctionId, this: Option<VReg>, args: Vec<VReg> },
    /// Result of `new`: `value` when it is an object, else `this`
    CtorResult { dst: VReg, value: VReg, this: VReg },

    Guard { kind: GuardKind, bailout: BailoutId },
    /// Leave a loop-body compilation, resuming the interpreter at `target`
    LoopExit { target: u32 },
    Throw { src: VReg },
    Return { src: VReg },
}

impl IrOp {
    /// Register written
    pub fn def(&self) -> Option<VReg> {
        match self {
            IrOp::LoadConst { dst, .. }
            | IrOp::LoadArg { dst, .. }
            | IrOp::LoadThis { dst }
            | IrOp::Move { dst, .. }
            | IrOp::Binary { dst, .. }
            | IrOp::Not { dst, .. }
            | IrOp::NewObject { dst }
            | IrOp::CreateThis { dst, .. }
            | IrOp::GetField { dst, .. }
            | IrOp::LoadSlot { dst, .. }
            | IrOp::NewArray { dst, .. }
            | IrOp::GetElem { dst, .. }
            | IrOp::ArrayLen { dst, .. }
            | IrOp::Call { dst, .. }
            | IrOp::CallMethod { dst, .. }
            | IrOp::Construct { dst, .. }
            | IrOp::CallDirect { dst, .. }
            | IrOp::CtorResult { dst, .. } => Some(*dst),
            _ => None,
        }
    }

    /// Registers read
    pub fn uses(&self) -> Vec<VReg> {
        match self {
            IrOp::LoadConst { .. }
            | IrOp::LoadArg { .. }
            | IrOp::LoadThis { .. }
            | IrOp::Label(_)
            | IrOp::Jump(_)
            | IrOp::LoopHeader { .. }
            | IrOp::NewObject { .. }
            | IrOp::CreateThis { .. }
            | IrOp::LoopExit { .. } => vec![],
            IrOp::Move { src, .. } | IrOp::Not { src, .. } | IrOp::Throw { src } | IrOp::Return { src } => vec![*src],
            IrOp::Binary { lhs, rhs, .. } => vec![*lhs, *rhs],
            IrOp::Branch { cond, .. } => vec![*cond],
            IrOp::GetField { obj, .. } | IrOp::LoadSlot { obj, .. } => vec![*obj],
            IrOp::SetField { obj, src, .. } | IrOp::StoreSlot { obj, src, .. } => vec![*obj, *src],
            IrOp::NewArray { len, .. } => vec![*len],
            IrOp::GetElem { arr, idx, .. } => vec![*arr, *idx],
            IrOp::SetElem { arr, idx, src } => vec![*arr, *idx, *src],
            IrOp::ArrayLen { arr, .. } => vec![*arr],
            IrOp::Call { callee, args, .. } => std::iter::once(*callee).chain(args.iter().copied()).collect(),
            IrOp::CallMethod { obj, args, .. } => std::iter::once(*obj).chain(args.iter().copied()).collect(),
            IrOp::Construct { ctor, args, .. } => std::iter::once(*ctor).chain(args.iter().copied()).collect(),
            IrOp::CallDirect { this, args, .. } => this.iter().copied().chain(args.iter().copied()).collect(),
            IrOp::CtorResult { value, this, .. } => vec![*value, *this],
            IrOp::Guard { kind, .. } => kind.uses(),
        }
    }

    /// Calls back into the runtime, which may run arbitrary code
    pub fn is_call(&self) -> bool {
        matches!(
            self,
            IrOp::Call { .. }
                | IrOp::CallMethod { .. }
                | IrOp::Construct { .. }
                | IrOp::CallDirect { .. }
                | IrOp::GetField { .. }
                | IrOp::SetField { .. }
        )
    }

    /// Control never falls through
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            IrOp::Jump(_) | IrOp::Return { .. } | IrOp::Throw { .. } | IrOp::LoopExit { .. }
        )
    }

    /// Has an effect beyond writing its destination
    pub fn has_side_effects(&self) -> bool {
        !matches!(
            self,
            IrOp::LoadConst { .. }
                | IrOp::LoadArg { .. }
                | IrOp::LoadThis { .. }
                | IrOp::Move { .. }
                | IrOp::Not { .. }
                | IrOp::LoadSlot { .. }
                | IrOp::ArrayLen { .. }
                | IrOp::CtorResult { .. }
        ) && !matches!(self, IrOp::Binary { kind, .. } if *kind != NumKind::Int)
            && !matches!(self, IrOp::GetElem { checked: false, .. })
    }

    /// Jump target, if any
    pub fn target(&self) -> Option<LabelId> {
        match self {
            IrOp::Jump(l) => Some(*l),
            IrOp::Branch { target, .. } => Some(*target),
            _ => None,
        }
    }
}

/// One IR instruction
#[derive(Debug, Clone, PartialEq)]
pub struct IrInstr {
    pub op: IrOp,
    /// Source bytecode offset (in the frame's function)
    pub offset: u32,
    pub frame: FrameId,
}

/// A function activation inside the compiled code: frame 0 is the top
/// function, the rest are inlined callees
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineFrame {
    pub id: FrameId,
    pub function: FunctionId,
    pub parent: Option<FrameId>,
    /// First virtual register of this frame's bytecode registers
    pub reg_base: VReg,
    pub reg_count: u32,
    /// Offset of the call instruction in the parent
    pub call_offset: u32,
    /// Offset in the parent where execution continues after the call
    pub resume_offset: u32,
    /// Parent register receiving the call's result
    pub result_reg: VReg,
    pub this_reg: Option<VReg>,
    pub arg_regs: Vec<VReg>,
    pub is_construct: bool,
}

/// Where a bailout resumes interpretation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BailoutRecord {
    pub id: BailoutId,
    pub frame: FrameId,
    /// Bytecode offset to re-execute
    pub offset: u32,
    pub reason: BailoutReason,
}

/// The unit the optimizer and lowerer work on
#[derive(Debug, Clone)]
pub struct IrFunction {
    pub function: FunctionId,
    pub name: String,
    pub mode: ExecutionMode,
    pub kind: WorkKind,
    pub instrs: Vec<IrInstr>,
    pub frames: Vec<InlineFrame>,
    pub bailouts: Vec<BailoutRecord>,
    pub vreg_count: u32,
    pub label_count: u32,
}

impl IrFunction {
    pub fn new_bailout(&mut self, frame: FrameId, offset: u32, reason: BailoutReason) -> BailoutId {
        let id = self.bailouts.len() as BailoutId;
        self.bailouts.push(BailoutRecord {
            id,
            frame,
            offset,
            reason,
        });
        id
    }

    pub fn new_vreg(&mut self) -> VReg {
        self.vreg_count += 1;
        self.vreg_count - 1
    }

    pub fn new_label(&mut self) -> LabelId {
        self.label_count += 1;
        self.label_count - 1
    }

    pub fn frame_function(&self, frame: FrameId) -> FunctionId {
        self.frames
            .get(frame as usize)
            .map_or(self.function, |f| f.function)
    }

    /// Whether `v` is one of the bytecode registers of some frame (visible to
    /// the interpreter after a bailout) rather than a compiler temporary
    pub fn is_frame_register(&self, v: VReg) -> bool {
        self.frames
            .iter()
            .any(|f| v >= f.reg_base && v < f.reg_base + f.reg_count)
    }

    /// Human-readable listing
    pub fn dump(&self) -> String {
        let mut out = format!("== IR {} [{}] ==\n", self.name, self.mode);
        for instr in &self.instrs {
            if let IrOp::Label(l) = instr.op {
                out.push_str(&format!("L{}:\n", l));
                continue;
            }
            out.push_str(&format!("  {:04} f{} {}\n", instr.offset, instr.frame, instr.op));
        }
        out
    }
}

impl fmt::Display for IrConst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrConst::Undefined => write!(f, "undefined"),
            IrConst::Bool(b) => write!(f, "{}", b),
            IrConst::Int(i) => write!(f, "{}", i),
            IrConst::Float(x) => write!(f, "{}", x),
            IrConst::Str(s) => write!(f, "{:?}", s),
            IrConst::Func(id) => write!(f, "{}", id),
        }
    }
}

impl fmt::Display for IrOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrOp::LoadConst { dst, value } => write!(f, "v{} = {}", dst, value),
            IrOp::LoadArg { dst, index } => write!(f, "v{} = arg{}", dst, index),
            IrOp::LoadThis { dst } => write!(f, "v{} = this", dst),
            IrOp::Move { dst, src } => write!(f, "v{} = v{}", dst, src),
            IrOp::Binary { op, kind, dst, lhs, rhs, .. } => {
                write!(f, "v{} = {:?}.{:?} v{}, v{}", dst, op, kind, lhs, rhs)
            }
            IrOp::Not { dst, src } => write!(f, "v{} = !v{}", dst, src),
            IrOp::Label(l) => write!(f, "L{}:", l),
            IrOp::Jump(l) => write!(f, "jump L{}", l),
            IrOp::Branch { cond, when, target } => write!(f, "branch v{} == {} -> L{}", cond, when, target),
            IrOp::LoopHeader { loop_id, .. } => write!(f, "loop_header {}", loop_id),
            IrOp::NewObject { dst } => write!(f, "v{} = {{}}", dst),
            IrOp::CreateThis { dst, ctor, .. } => write!(f, "v{} = create_this {}", dst, ctor),
            IrOp::GetField { dst, obj, prop, ic, .. } => write!(f, "v{} = v{}.p{} [ic{}]", dst, obj, prop.0, ic),
            IrOp::SetField { obj, prop, src, ic, .. } => write!(f, "v{}.p{} = v{} [ic{}]", obj, prop.0, src, ic),
            IrOp::LoadSlot { dst, obj, slot } => write!(f, "v{} = v{}[slot {}]", dst, obj, slot),
            IrOp::StoreSlot { obj, slot, src, .. } => write!(f, "v{}[slot {}] = v{}", obj, slot, src),
            IrOp::NewArray { dst, len } => write!(f, "v{} = new_array v{}", dst, len),
            IrOp::GetElem { dst, arr, idx, checked } => {
                write!(f, "v{} = v{}[v{}]{}", dst, arr, idx, if *checked { "" } else { " unchecked" })
            }
            IrOp::SetElem { arr, idx, src } => write!(f, "v{}[v{}] = v{}", arr, idx, src),
            IrOp::ArrayLen { dst, arr } => write!(f, "v{} = v{}.length", dst, arr),
            IrOp::Call { dst, callee, args, .. } => write!(f, "v{} = call v{} {:?}", dst, callee, args),
            IrOp::CallMethod { dst, obj, prop, args, .. } => {
                write!(f, "v{} = call v{}.p{} {:?}", dst, obj, prop.0, args)
            }
            IrOp::Construct { dst, ctor, args, .. } => write!(f, "v{} = new v{} {:?}", dst, ctor, args),
            IrOp::CallDirect { dst, target, this, args } => {
                write!(f, "v{} = call_direct {} this={:?} {:?}", dst, target, this, args)
            }
            IrOp::CtorResult { dst, value, this } => write!(f, "v{} = ctor_result v{}, v{}", dst, value, this),
            IrOp::Guard { kind, bailout } => write!(f, "guard {:?} else bailout #{}", kind, bailout),
            IrOp::LoopExit { target } => write!(f, "loop_exit -> {:04}", target),
            IrOp::Throw { src } => write!(f, "throw v{}", src),
            IrOp::Return { src } => write!(f, "return v{}", src),
        }
    }
}

/// Bytecode range of one loop: header offset to just past its back edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopRegion {
    pub loop_id: u8,
    pub header: u32,
    pub end: u32,
}

impl LoopRegion {
    pub fn contains(&self, offset: u32) -> bool {
        offset >= self.header && offset < self.end
    }
}

/// Find loop regions from decoded instructions. Back edges are jumps to
/// the loop header's own offset.
pub fn loop_regions(instrs: &[(u32, Instruction)]) -> Vec<LoopRegion> {
    let mut regions = Vec::new();
    for (i, (offset, instr)) in instrs.iter().enumerate() {
        if let Instruction::LoopHeader { loop_id } = instr {
            let mut end = instrs.get(i + 1).map_or(*offset + 2, |(o, _)| *o);
            for (j, (o, other)) in instrs.iter().enumerate() {
                let targets_header = matches!(other,
                    Instruction::Jump { target } | Instruction::JumpIf { target, .. } if *target == *offset);
                if targets_header && *o >= *offset {
                    let next = instrs.get(j + 1).map_or(u32::MAX, |(n, _)| *n);
                    end = end.max(next);
                }
            }
            regions.push(LoopRegion {
                loop_id: *loop_id,
                header: *offset,
                end,
            });
        }
    }
    regions
}
