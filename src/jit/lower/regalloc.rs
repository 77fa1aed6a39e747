//! Register assignment and frame layout
//!
//! Every virtual register gets its own location for the whole function: the
//! most frequently used ones go to registers of their class, the rest to
//! stack spill slots. Locations are never shared, so any bailout point can
//! read back every frame register the interpreter needs.

use super::machine::{MachineConstants, RegisterClass};
use crate::jit::ir::{IrFunction, IrOp, NumKind, VReg};
use crate::jit::lir::Loc;
use crate::jit::snapshot::FunctionBodyView;
use serde::{Deserialize, Serialize};

/// Frame layout of compiled code, in pointer-sized slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FrameLayout {
    pub spill_slots: u32,
    /// Scope slots kept on the stack instead of a heap scope object
    pub scope_slots: u32,
    /// Frame display (environment chain) slots kept on the stack
    pub display_slots: u32,
    /// Total slots after rounding up to the stack alignment
    pub total_slots: u32,
    pub frame_bytes: u32,
}

impl FrameLayout {
    pub fn new(machine: &MachineConstants, spill_slots: u32, scope_slots: u32, display_slots: u32) -> Self {
        let raw = spill_slots + scope_slots + display_slots;
        Self {
            spill_slots,
            scope_slots,
            display_slots,
            total_slots: machine.aligned_slots(raw),
            frame_bytes: machine.frame_bytes(raw),
        }
    }
}

/// Result of register assignment
#[derive(Debug, Clone)]
pub struct Allocation {
    /// Location of each virtual register, indexed by register number
    pub locs: Vec<Loc>,
    pub classes: Vec<RegisterClass>,
    pub gprs_used: u8,
    pub fprs_used: u8,
    pub spill_slots: u32,
}

impl Allocation {
    pub fn loc(&self, v: VReg) -> Loc {
        self.locs[v as usize]
    }
}

/// Register class of each virtual register: float only when every
/// definition is float arithmetic producing a number
pub fn register_classes(ir: &IrFunction) -> Vec<RegisterClass> {
    let mut float_defs = vec![0u32; ir.vreg_count as usize];
    let mut other_defs = vec![0u32; ir.vreg_count as usize];
    for instr in &ir.instrs {
        let Some(d) = instr.op.def() else { continue };
        match instr.op {
            IrOp::Binary {
                kind: NumKind::Float,
                op,
                ..
            } if !op.is_comparison() => float_defs[d as usize] += 1,
            _ => other_defs[d as usize] += 1,
        }
    }
    (0..ir.vreg_count as usize)
        .map(|v| {
            // Frame registers can be handed to the interpreter with any value
            if float_defs[v] > 0 && other_defs[v] == 0 && !ir.is_frame_register(v as VReg) {
                RegisterClass::Float
            } else {
                RegisterClass::General
            }
        })
        .collect()
}

/// Use/def counts, with references inside loops weighted up
fn frequencies(ir: &IrFunction) -> Vec<u64> {
    let mut freq = vec![0u64; ir.vreg_count as usize];
    let mut weight = 1u64;
    for instr in &ir.instrs {
        if matches!(instr.op, IrOp::LoopHeader { .. }) {
            weight = 8;
        }
        for v in instr.op.uses().into_iter().chain(instr.op.def()) {
            freq[v as usize] += weight;
        }
    }
    freq
}

pub fn allocate(ir: &IrFunction, machine: &MachineConstants) -> Allocation {
    let classes = register_classes(ir);
    let freq = frequencies(ir);

    let mut order: Vec<VReg> = (0..ir.vreg_count).collect();
    order.sort_by(|a, b| freq[*b as usize].cmp(&freq[*a as usize]).then(a.cmp(b)));

    let mut locs = vec![Loc::Stack(0); ir.vreg_count as usize];
    let (mut gprs, mut fprs, mut spills) = (0u8, 0u8, 0u32);
    for v in order {
        let loc = match classes[v as usize] {
            RegisterClass::General if gprs < machine.allocatable_gprs => {
                gprs += 1;
                Loc::Gpr(gprs - 1)
            }
            RegisterClass::Float if fprs < machine.allocatable_fprs => {
                fprs += 1;
                Loc::Fpr(fprs - 1)
            }
            _ => {
                spills += 1;
                Loc::Stack((spills - 1) as u16)
            }
        };
        locs[v as usize] = loc;
    }

    Allocation {
        locs,
        classes,
        gprs_used: gprs,
        fprs_used: fprs,
        spill_slots: spills,
    }
}

/// Frame layout for `top` given the allocation's spills
pub fn frame_layout(top: &FunctionBodyView, alloc: &Allocation, machine: &MachineConstants) -> FrameLayout {
    let scope_slots = if top.do_stack_scope_slots() {
        top.scope_slot_count()
    } else {
        0
    };
    let display_slots = if top.do_stack_frame_display() {
        top.env_depth() as u32 + 1
    } else {
        0
    };
    FrameLayout::new(machine, alloc.spill_slots, scope_slots, display_slots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::BinOp;
    use crate::jit::ir::{InlineFrame, IrConst, IrInstr};
    use crate::jit::lower::machine::X64;
    use crate::jit::tier::ExecutionMode;
    use crate::jit::work_item::WorkKind;
    use crate::runtime::FunctionId;

    fn ir_of(vregs: u32, frame_regs: u32, ops: Vec<IrOp>) -> IrFunction {
        IrFunction {
            function: FunctionId(0),
            name: "t".into(),
            mode: ExecutionMode::FullJit,
            kind: WorkKind::Function,
            instrs: ops.into_iter().map(|op| IrInstr { op, offset: 0, frame: 0 }).collect(),
            frames: vec![InlineFrame {
                id: 0,
                function: FunctionId(0),
                parent: None,
                reg_base: 0,
                reg_count: frame_regs,
                call_offset: 0,
                resume_offset: 0,
                result_reg: 0,
                this_reg: None,
                arg_regs: vec![],
                is_construct: false,
            }],
            bailouts: vec![],
            vreg_count: vregs,
            label_count: 0,
        }
    }

    #[test]
    fn test_float_temporaries_get_float_registers() {
        let ir = ir_of(
            3,
            2,
            vec![
                IrOp::LoadConst { dst: 0, value: IrConst::Float(1.5) },
                IrOp::LoadConst { dst: 1, value: IrConst::Float(2.0) },
                IrOp::Binary { op: BinOp::Mul, kind: NumKind::Float, dst: 2, lhs: 0, rhs: 1, overflow: None },
                IrOp::Return { src: 2 },
            ],
        );
        let alloc = allocate(&ir, &X64);
        assert_eq!(alloc.loc(2), Loc::Fpr(0));
        assert!(matches!(alloc.loc(0), Loc::Gpr(_)));
        assert_eq!(alloc.fprs_used, 1);
    }

    #[test]
    fn test_spills_when_registers_run_out() {
        let n = X64.allocatable_gprs as u32 + 3;
        let ops = (0..n).map(|v| IrOp::LoadConst { dst: v, value: IrConst::Int(v as i32) }).collect();
        let alloc = allocate(&ir_of(n, n, ops), &X64);
        assert_eq!(alloc.spill_slots, 3);
        let mut seen = alloc.locs.clone();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), n as usize);
    }

    #[test]
    fn test_frame_layout_alignment() {
        let layout = FrameLayout::new(&X64, 3, 2, 0);
        assert_eq!(layout.total_slots, 6);
        assert_eq!(layout.frame_bytes, 48);
    }
}
