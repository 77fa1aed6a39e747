//! Dead code elimination
//!
//! Removes unreachable instructions, jumps to the next instruction, labels
//! nothing jumps to, and side-effect-free writes to compiler temporaries
//! nothing reads. Frame registers are never removed: a bailout hands them
//! to the interpreter.

use super::{OptimizationPass, OptimizationResult};
use crate::error::Result;
use crate::jit::ir::{IrFunction, IrOp, LabelId, VReg};
use crate::jit::snapshot::JitSnapshot;
use rustc_hash::FxHashSet as HashSet;

pub struct DeadCodeElimination;

impl DeadCodeElimination {
    fn remove_unreachable(ir: &mut IrFunction) -> usize {
        let before = ir.instrs.len();
        let mut reachable = true;
        ir.instrs.retain(|instr| {
            if matches!(instr.op, IrOp::Label(_)) {
                reachable = true;
            }
            let keep = reachable;
            if instr.op.is_terminator() {
                reachable = false;
            }
            keep
        });
        before - ir.instrs.len()
    }

    fn remove_trivial_jumps(ir: &mut IrFunction) -> usize {
        let mut dead = Vec::new();
        for (i, pair) in ir.instrs.windows(2).enumerate() {
            if let (IrOp::Jump(a), IrOp::Label(b)) = (&pair[0].op, &pair[1].op) {
                if a == b {
                    dead.push(i);
                }
            }
        }
        for i in dead.iter().rev() {
            ir.instrs.remove(*i);
        }
        dead.len()
    }

    fn remove_unused_labels(ir: &mut IrFunction) -> usize {
        let targeted: HashSet<LabelId> = ir.instrs.iter().filter_map(|i| i.op.target()).collect();
        let before = ir.instrs.len();
        ir.instrs
            .retain(|i| !matches!(i.op, IrOp::Label(l) if !targeted.contains(&l)));
        before - ir.instrs.len()
    }

    fn remove_dead_temporaries(ir: &mut IrFunction) -> usize {
        let used: HashSet<VReg> = ir.instrs.iter().flat_map(|i| i.op.uses()).collect();
        let frames = ir.frames.clone();
        let is_frame_reg = |v: VReg| frames.iter().any(|f| v >= f.reg_base && v < f.reg_base + f.reg_count);
        let bailout_regs: HashSet<VReg> = frames
            .iter()
            .flat_map(|f| f.arg_regs.iter().copied().chain(f.this_reg).chain(std::iter::once(f.result_reg)))
            .collect();
        let before = ir.instrs.len();
        ir.instrs.retain(|i| match i.op.def() {
            Some(d) => {
                i.op.has_side_effects() || used.contains(&d) || is_frame_reg(d) || bailout_regs.contains(&d)
            }
            None => true,
        });
        before - ir.instrs.len()
    }
}

impl OptimizationPass for DeadCodeElimination {
    fn name(&self) -> &str {
        "DeadCodeElimination"
    }

    fn run(&self, ir: &mut IrFunction, _snapshot: &JitSnapshot) -> Result<OptimizationResult> {
        let mut removed = 0;
        loop {
            let round = Self::remove_unreachable(ir)
                + Self::remove_trivial_jumps(ir)
                + Self::remove_unused_labels(ir)
                + Self::remove_dead_temporaries(ir);
            if round == 0 {
                break;
            }
            removed += round;
        }
        Ok(OptimizationResult {
            instructions_removed: removed,
            ..OptimizationResult::none()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::ir::{InlineFrame, IrConst, IrInstr};
    use crate::jit::tier::ExecutionMode;
    use crate::jit::work_item::WorkKind;
    use crate::runtime::FunctionId;

    fn ir_of(ops: Vec<IrOp>) -> IrFunction {
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
                reg_count: 2,
                call_offset: 0,
                resume_offset: 0,
                result_reg: 0,
                this_reg: None,
                arg_regs: vec![],
                is_construct: false,
            }],
            bailouts: vec![],
            vreg_count: 6,
            label_count: 2,
        }
    }

    fn snapshot() -> JitSnapshot {
        use crate::bytecode::Assembler;
        use crate::jit::snapshot::{BodySource, FunctionBodyView};
        use crate::runtime::{FunctionProfile, PropertyGuardTable};
        let mut asm = Assembler::new("t", 0);
        asm.load_undefined(0).ret(0);
        let body = asm.finish().unwrap();
        JitSnapshot::new(FunctionBodyView::capture(
            BodySource {
                function: FunctionId(0),
                local_id: 0,
                source_context: 0,
                body: &body,
                property_ids: &[],
            },
            &FunctionProfile::new(0, 0, 0),
            &PropertyGuardTable::new(),
        ))
    }

    #[test]
    fn test_removes_dead_temporaries_but_not_frame_registers() {
        let mut ir = ir_of(vec![
            IrOp::LoadConst { dst: 1, value: IrConst::Int(1) },
            IrOp::LoadConst { dst: 4, value: IrConst::Int(2) },
            IrOp::Move { dst: 5, src: 4 },
            IrOp::Return { src: 1 },
        ]);
        let result = DeadCodeElimination.run(&mut ir, &snapshot()).unwrap();
        assert_eq!(result.instructions_removed, 2);
        assert_eq!(ir.instrs.len(), 2);
    }

    #[test]
    fn test_unreachable_and_trivial_jumps() {
        let mut ir = ir_of(vec![
            IrOp::Jump(0),
            IrOp::LoadConst { dst: 0, value: IrConst::Int(1) },
            IrOp::Label(0),
            IrOp::Label(1),
            IrOp::Return { src: 0 },
        ]);
        DeadCodeElimination.run(&mut ir, &snapshot()).unwrap();
        assert_eq!(ir.instrs.len(), 1);
        assert!(matches!(ir.instrs[0].op, IrOp::Return { src: 0 }));
    }
}
