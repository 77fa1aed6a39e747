//! IR to LIR lowering
//!
//! Assigns machine locations, lays out the frame and emits one or more LIR
//! instructions per IR instruction. Each LIR instruction keeps the bytecode
//! offset and inline frame of the IR instruction it came from.

pub mod machine;
pub mod regalloc;

pub use machine::{Arch, MachineConstants, RegisterClass, SimdType};
pub use regalloc::{Allocation, FrameLayout};

use super::ir::{BailoutRecord, GuardKind, InlineFrame, IrConst, IrFunction, IrOp};
use super::lir::{Helper, Imm, LirGuard, LirInstr, LirOp, Loc};
use super::snapshot::JitSnapshot;
use super::tier::ExecutionMode;
use super::work_item::WorkKind;
use crate::error::{Error, Result};
use crate::runtime::{needs_write_barrier, FunctionId, StoreTarget};
use tracing::debug;

/// A function after lowering, ready for the security pass and the encoder
#[derive(Debug, Clone)]
pub struct LoweredFunction {
    pub function: FunctionId,
    pub name: String,
    pub mode: ExecutionMode,
    pub kind: WorkKind,
    pub arch: Arch,
    pub instrs: Vec<LirInstr>,
    /// Location of every virtual register
    pub reg_map: Vec<Loc>,
    pub layout: FrameLayout,
    pub frames: Vec<InlineFrame>,
    pub bailouts: Vec<BailoutRecord>,
    /// String constants referenced by `MovConst`
    pub constants: Vec<String>,
    pub label_count: u32,
}

impl LoweredFunction {
    pub fn dump(&self) -> String {
        let mut out = format!("== LIR {} [{}] ({}) ==\n", self.name, self.mode, self.arch);
        for instr in &self.instrs {
            if let LirOp::Label(_) = instr.op {
                out.push_str(&format!("{}\n", instr.op));
            } else {
                out.push_str(&format!("  {:04} f{} {}\n", instr.offset, instr.frame, instr.op));
            }
        }
        out
    }
}

struct Lowerer<'a> {
    alloc: &'a Allocation,
    mode: ExecutionMode,
    out: Vec<LirInstr>,
    constants: Vec<String>,
    offset: u32,
    frame: u32,
}

impl Lowerer<'_> {
    fn loc(&self, v: u32) -> Loc {
        self.alloc.loc(v)
    }

    fn locs(&self, vs: &[u32]) -> Vec<Loc> {
        vs.iter().map(|v| self.loc(*v)).collect()
    }

    fn emit(&mut self, op: LirOp) {
        self.out.push(LirInstr::new(op, self.offset, self.frame));
    }

    fn constant(&mut self, s: &str) -> u32 {
        match self.constants.iter().position(|c| c == s) {
            Some(i) => i as u32,
            None => {
                self.constants.push(s.to_string());
                (self.constants.len() - 1) as u32
            }
        }
    }

    fn guard(&self, kind: &GuardKind) -> LirGuard {
        match kind {
            GuardKind::Int(v) => LirGuard::Int(self.loc(*v)),
            GuardKind::Number(v) => LirGuard::Number(self.loc(*v)),
            GuardKind::Array(v) => LirGuard::Array(self.loc(*v)),
            GuardKind::Type(v, set) => LirGuard::Type(self.loc(*v), set.types().to_vec()),
            GuardKind::Callee(v, f) => LirGuard::Callee(self.loc(*v), *f),
            GuardKind::Property(g) => LirGuard::Property(*g),
            GuardKind::Bounds { arr, idx } => LirGuard::Bounds {
                arr: self.loc(*arr),
                idx: self.loc(*idx),
            },
        }
    }

    fn lower(&mut self, op: &IrOp) -> Result<()> {
        let lowered = match op {
            IrOp::LoadConst { dst, value } => {
                let dst = self.loc(*dst);
                match value {
                    IrConst::Str(s) => LirOp::MovConst {
                        dst,
                        index: self.constant(s),
                    },
                    IrConst::Undefined => LirOp::MovImm { dst, imm: Imm::undefined() },
                    IrConst::Bool(b) => LirOp::MovImm { dst, imm: Imm::bool(*b) },
                    IrConst::Int(i) => LirOp::MovImm { dst, imm: Imm::int(*i) },
                    IrConst::Float(x) => LirOp::MovImm { dst, imm: Imm::float(*x) },
                    IrConst::Func(f) => LirOp::MovImm { dst, imm: Imm::func(*f) },
                }
            }
            IrOp::LoadArg { dst, index } => LirOp::LoadArg {
                dst: self.loc(*dst),
                index: *index,
            },
            IrOp::LoadThis { dst } => LirOp::LoadThis { dst: self.loc(*dst) },
            IrOp::Move { dst, src } => {
                let (dst, src) = (self.loc(*dst), self.loc(*src));
                if dst == src {
                    return Ok(());
                }
                LirOp::Mov { dst, src }
            }
            IrOp::Binary {
                op,
                kind,
                dst,
                lhs,
                rhs,
                overflow,
            } => LirOp::Binary {
                op: *op,
                kind: *kind,
                dst: self.loc(*dst),
                lhs: self.loc(*lhs),
                rhs: self.loc(*rhs),
                overflow: *overflow,
            },
            IrOp::Not { dst, src } => LirOp::Not {
                dst: self.loc(*dst),
                src: self.loc(*src),
            },
            IrOp::Label(l) => LirOp::Label(*l),
            IrOp::Jump(l) => LirOp::Jump(*l),
            IrOp::Branch { cond, when, target } => LirOp::Branch {
                cond: self.loc(*cond),
                when: *when,
                target: *target,
            },
            IrOp::LoopHeader { function, loop_id } => {
                // Only the baseline tier keeps counting iterations
                if self.mode != ExecutionMode::SimpleJit {
                    return Ok(());
                }
                LirOp::LoopTick {
                    function: *function,
                    loop_id: *loop_id,
                }
            }
            IrOp::NewObject { dst } => LirOp::NewObject { dst: self.loc(*dst) },
            IrOp::CreateThis { dst, ctor, capacity } => LirOp::CreateThis {
                dst: self.loc(*dst),
                ctor: *ctor,
                capacity: *capacity,
            },
            IrOp::GetField {
                dst,
                obj,
                prop,
                function,
                ic,
            } => LirOp::CallHelper {
                helper: Helper::GetField {
                    function: *function,
                    prop: *prop,
                    ic: *ic,
                },
                dst: Some(self.loc(*dst)),
                args: vec![self.loc(*obj)],
            },
            IrOp::SetField {
                obj,
                prop,
                src,
                function,
                ic,
            } => LirOp::CallHelper {
                helper: Helper::SetField {
                    function: *function,
                    prop: *prop,
                    ic: *ic,
                },
                dst: None,
                args: vec![self.loc(*obj), self.loc(*src)],
            },
            IrOp::LoadSlot { dst, obj, slot } => LirOp::LoadSlot {
                dst: self.loc(*dst),
                obj: self.loc(*obj),
                slot: *slot,
            },
            IrOp::StoreSlot { obj, slot, src, prop } => LirOp::StoreSlot {
                obj: self.loc(*obj),
                slot: *slot,
                src: self.loc(*src),
                prop: *prop,
                barrier: needs_write_barrier(StoreTarget::ObjectSlot),
            },
            IrOp::NewArray { dst, len } => LirOp::NewArray {
                dst: self.loc(*dst),
                len: self.loc(*len),
            },
            IrOp::GetElem { dst, arr, idx, checked } => LirOp::GetElem {
                dst: self.loc(*dst),
                arr: self.loc(*arr),
                idx: self.loc(*idx),
                checked: *checked,
            },
            IrOp::SetElem { arr, idx, src } => LirOp::SetElem {
                arr: self.loc(*arr),
                idx: self.loc(*idx),
                src: self.loc(*src),
                barrier: needs_write_barrier(StoreTarget::ArrayElement),
            },
            IrOp::ArrayLen { dst, arr } => LirOp::ArrayLen {
                dst: self.loc(*dst),
                arr: self.loc(*arr),
            },
            IrOp::Call {
                dst,
                callee,
                args,
                function,
                site,
            } => {
                let mut locs = vec![self.loc(*callee)];
                locs.extend(self.locs(args));
                LirOp::CallHelper {
                    helper: Helper::Call {
                        function: *function,
                        site: *site,
                    },
                    dst: Some(self.loc(*dst)),
                    args: locs,
                }
            }
            IrOp::CallMethod {
                dst,
                obj,
                prop,
                args,
                function,
                ic,
                site,
            } => {
                let mut locs = vec![self.loc(*obj)];
                locs.extend(self.locs(args));
                LirOp::CallHelper {
                    helper: Helper::CallMethod {
                        function: *function,
                        prop: *prop,
                        ic: *ic,
                        site: *site,
                    },
                    dst: Some(self.loc(*dst)),
                    args: locs,
                }
            }
            IrOp::Construct {
                dst,
                ctor,
                args,
                function,
                site,
            } => {
                let mut locs = vec![self.loc(*ctor)];
                locs.extend(self.locs(args));
                LirOp::CallHelper {
                    helper: Helper::Construct {
                        function: *function,
                        site: *site,
                    },
                    dst: Some(self.loc(*dst)),
                    args: locs,
                }
            }
            IrOp::CallDirect { dst, target, this, args } => {
                let mut locs: Vec<Loc> = this.iter().map(|t| self.loc(*t)).collect();
                locs.extend(self.locs(args));
                LirOp::CallHelper {
                    helper: Helper::CallDirect {
                        target: *target,
                        has_this: this.is_some(),
                    },
                    dst: Some(self.loc(*dst)),
                    args: locs,
                }
            }
            IrOp::CtorResult { dst, value, this } => LirOp::CtorResult {
                dst: self.loc(*dst),
                value: self.loc(*value),
                this: self.loc(*this),
            },
            IrOp::Guard { kind, bailout } => LirOp::Guard {
                guard: self.guard(kind),
                bailout: *bailout,
            },
            IrOp::LoopExit { target } => LirOp::LoopExit { target: *target },
            IrOp::Throw { src } => LirOp::Throw { src: self.loc(*src) },
            IrOp::Return { src } => LirOp::Ret { src: self.loc(*src) },
        };
        self.emit(lowered);
        Ok(())
    }
}

/// Lower an optimized IR function for `arch`
pub fn lower(ir: &IrFunction, snapshot: &JitSnapshot, arch: Arch) -> Result<LoweredFunction> {
    let machine = arch.constants();
    let alloc = regalloc::allocate(ir, machine);
    let layout = regalloc::frame_layout(snapshot.top(), &alloc, machine);
    let slot = |n: u32, what: &str| u16::try_from(n).map_err(|_| Error::unsupported(ir.name.clone(), format!("{} {} slots", n, what)));

    let mut lowerer = Lowerer {
        alloc: &alloc,
        mode: ir.mode,
        out: Vec::with_capacity(ir.instrs.len() + 1),
        constants: Vec::new(),
        offset: 0,
        frame: 0,
    };
    lowerer.emit(LirOp::Prologue {
        slots: slot(layout.total_slots, "frame")?,
        scope_slots: slot(layout.scope_slots, "scope")?,
        display_slots: slot(layout.display_slots, "display")?,
    });
    for instr in &ir.instrs {
        lowerer.offset = instr.offset;
        lowerer.frame = instr.frame;
        lowerer.lower(&instr.op)?;
    }

    debug!(
        function = %ir.function,
        lir = lowerer.out.len(),
        gprs = alloc.gprs_used,
        fprs = alloc.fprs_used,
        spills = alloc.spill_slots,
        frame_bytes = layout.frame_bytes,
        "Lowered"
    );

    Ok(LoweredFunction {
        function: ir.function,
        name: ir.name.clone(),
        mode: ir.mode,
        kind: ir.kind,
        arch,
        instrs: lowerer.out,
        reg_map: alloc.locs.clone(),
        layout,
        frames: ir.frames.clone(),
        bailouts: ir.bailouts.clone(),
        constants: lowerer.constants,
        label_count: ir.label_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Assembler;
    use crate::config::JitConfig;
    use crate::jit::ir;
    use crate::jit::snapshot::{BodySource, FunctionBodyView};
    use crate::jit::work_item::WorkItem;
    use crate::runtime::{FunctionProfile, PropertyGuardTable};

    fn lowered(mode: ExecutionMode, build: impl FnOnce(&mut Assembler)) -> LoweredFunction {
        let mut asm = Assembler::new("f", 1);
        build(&mut asm);
        let body = asm.finish().unwrap();
        let snapshot = JitSnapshot::new(FunctionBodyView::capture(
            BodySource {
                function: FunctionId(0),
                local_id: 0,
                source_context: 0,
                body: &body,
                property_ids: &[],
            },
            &FunctionProfile::new(0, 0, 1),
            &PropertyGuardTable::new(),
        ));
        let work = WorkItem {
            id: 1,
            function: FunctionId(0),
            epoch: 0,
            kind: WorkKind::Function,
            mode,
            call_count: 0,
            loop_count: 0,
            display_name: "f".into(),
        };
        let ir = ir::build(&snapshot, &work, &JitConfig::synchronous()).unwrap();
        lower(&ir, &snapshot, Arch::X64).unwrap()
    }

    #[test]
    fn test_prologue_first_and_strings_pooled() {
        let f = lowered(ExecutionMode::SimpleJit, |asm| {
            asm.load_str(0, "hi").load_str(1, "hi").add(2, 0, 1).ret(2);
        });
        assert!(matches!(f.instrs[0].op, LirOp::Prologue { .. }));
        assert_eq!(f.constants, vec!["hi".to_string()]);
        assert!(f.instrs.iter().any(|i| i.op.is_return()));
    }

    #[test]
    fn test_loop_ticks_only_in_simple_jit() {
        let build = |asm: &mut Assembler| {
            let head = asm.new_label();
            let exit = asm.new_label();
            asm.load_int(1, 0);
            asm.bind(head);
            asm.loop_header();
            asm.lt(2, 1, 0).jump_if_false(2, exit).load_int(3, 1).add(1, 1, 3).jump(head);
            asm.bind(exit);
            asm.ret(1);
        };
        let ticks = |f: &LoweredFunction| f.instrs.iter().filter(|i| matches!(i.op, LirOp::LoopTick { .. })).count();
        assert_eq!(ticks(&lowered(ExecutionMode::SimpleJit, build)), 1);
        assert_eq!(ticks(&lowered(ExecutionMode::FullJit, build)), 0);
    }
}
