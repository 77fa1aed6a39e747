//! Constant folding within basic blocks

use super::{OptimizationPass, OptimizationResult};
use crate::error::Result;
use crate::jit::ir::{IrConst, IrFunction, IrOp, VReg};
use crate::jit::snapshot::JitSnapshot;
use crate::runtime::{ops, Value};
use rustc_hash::FxHashMap as HashMap;

pub struct ConstantFolding;

fn to_value(c: &IrConst) -> Option<Value> {
    match c {
        IrConst::Undefined => Some(Value::Undefined),
        IrConst::Bool(b) => Some(Value::Boolean(*b)),
        IrConst::Int(i) => Some(Value::Int(*i)),
        IrConst::Float(x) => Some(Value::Float(*x)),
        IrConst::Str(_) | IrConst::Func(_) => None,
    }
}

fn from_value(v: &Value) -> Option<IrConst> {
    match v {
        Value::Undefined => Some(IrConst::Undefined),
        Value::Boolean(b) => Some(IrConst::Bool(*b)),
        Value::Int(i) => Some(IrConst::Int(*i)),
        Value::Float(x) => Some(IrConst::Float(*x)),
        _ => None,
    }
}

impl OptimizationPass for ConstantFolding {
    fn name(&self) -> &str {
        "ConstantFolding"
    }

    fn run(&self, ir: &mut IrFunction, _snapshot: &JitSnapshot) -> Result<OptimizationResult> {
        let mut known: HashMap<VReg, IrConst> = HashMap::default();
        let mut result = OptimizationResult::none();
        let mut removed = Vec::new();

        for (i, instr) in ir.instrs.iter_mut().enumerate() {
            let folded = match &instr.op {
                IrOp::Binary { op, dst, lhs, rhs, .. } => {
                    let l = known.get(lhs).and_then(to_value);
                    let r = known.get(rhs).and_then(to_value);
                    match (l, r) {
                        (Some(l), Some(r)) => from_value(&ops::binary(*op, &l, &r)).map(|value| IrOp::LoadConst {
                            dst: *dst,
                            value,
                        }),
                        _ => None,
                    }
                }
                IrOp::Not { dst, src } => known.get(src).and_then(to_value).map(|v| IrOp::LoadConst {
                    dst: *dst,
                    value: IrConst::Bool(!v.is_truthy()),
                }),
                IrOp::Branch { cond, when, target } => match known.get(cond).and_then(to_value) {
                    Some(v) if v.is_truthy() == *when => Some(IrOp::Jump(*target)),
                    Some(_) => {
                        removed.push(i);
                        None
                    }
                    None => None,
                },
                _ => None,
            };
            if let Some(op) = folded {
                instr.op = op;
                result.instructions_modified += 1;
            }

            match &instr.op {
                IrOp::Label(_) => known.clear(),
                IrOp::LoadConst { dst, value } => {
                    known.insert(*dst, value.clone());
                }
                IrOp::Move { dst, src } => match known.get(src).cloned() {
                    Some(c) => {
                        known.insert(*dst, c);
                    }
                    None => {
                        known.remove(dst);
                    }
                },
                op => {
                    if let Some(d) = op.def() {
                        known.remove(&d);
                    }
                }
            }
        }

        for i in removed.iter().rev() {
            ir.instrs.remove(*i);
        }
        result.instructions_removed = removed.len();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::BinOp;
    use crate::jit::ir::{InlineFrame, IrInstr, NumKind};
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
                reg_count: 4,
                call_offset: 0,
                resume_offset: 0,
                result_reg: 0,
                this_reg: None,
                arg_regs: vec![],
                is_construct: false,
            }],
            bailouts: vec![],
            vreg_count: 4,
            label_count: 1,
        }
    }

    fn add(dst: VReg, lhs: VReg, rhs: VReg) -> IrOp {
        IrOp::Binary {
            op: BinOp::Add,
            kind: NumKind::Generic,
            dst,
            lhs,
            rhs,
            overflow: None,
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
    fn test_folds_arithmetic_and_branches() {
        let mut ir = ir_of(vec![
            IrOp::LoadConst { dst: 0, value: IrConst::Int(2) },
            IrOp::LoadConst { dst: 1, value: IrConst::Int(3) },
            add(2, 0, 1),
            IrOp::Branch { cond: 2, when: false, target: 0 },
            IrOp::Return { src: 2 },
        ]);
        let result = ConstantFolding.run(&mut ir, &snapshot()).unwrap();
        assert_eq!(ir.instrs[2].op, IrOp::LoadConst { dst: 2, value: IrConst::Int(5) });
        assert_eq!(result.instructions_removed, 1);
        assert_eq!(ir.instrs.len(), 4);
    }

    #[test]
    fn test_overflow_folds_to_float() {
        let mut ir = ir_of(vec![
            IrOp::LoadConst { dst: 0, value: IrConst::Int(i32::MAX) },
            IrOp::LoadConst { dst: 1, value: IrConst::Int(1) },
            add(2, 0, 1),
        ]);
        ConstantFolding.run(&mut ir, &snapshot()).unwrap();
        assert_eq!(
            ir.instrs[2].op,
            IrOp::LoadConst { dst: 2, value: IrConst::Float(i32::MAX as f64 + 1.0) }
        );
    }

    #[test]
    fn test_labels_forget_constants() {
        let mut ir = ir_of(vec![
            IrOp::LoadConst { dst: 0, value: IrConst::Int(2) },
            IrOp::Label(0),
            add(1, 0, 0),
        ]);
        let result = ConstantFolding.run(&mut ir, &snapshot()).unwrap();
        assert_eq!(result.total_changes(), 0);
    }
}
