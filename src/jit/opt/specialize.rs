//! Type specialization
//!
//! Replaces generic arithmetic, field and element accesses with fast
//! variants when the profile says operands were always of one kind,
//! inserting the guards the fast variants depend on.

use super::guards::may_overflow;
use super::{OptimizationPass, OptimizationResult};
use crate::error::Result;
use crate::jit::ir::{BailoutReason, FrameId, GuardKind, IrFunction, IrInstr, IrOp, NumKind};
use crate::jit::snapshot::{EquivalentTypeSet, FunctionBodyView, JitSnapshot};
use crate::runtime::ObservedType;

pub struct TypeSpecialization;

impl OptimizationPass for TypeSpecialization {
    fn name(&self) -> &str {
        "TypeSpecialization"
    }

    fn run(&self, ir: &mut IrFunction, snapshot: &JitSnapshot) -> Result<OptimizationResult> {
        let mut result = OptimizationResult::none();
        let old = std::mem::take(&mut ir.instrs);
        let old_len = old.len();
        let mut out = Vec::with_capacity(old_len);

        for instr in old {
            let Some(body) = snapshot.body(ir.frame_function(instr.frame)) else {
                out.push(instr);
                continue;
            };
            let (frame, offset) = (instr.frame, instr.offset);
            let guard = |ir: &mut IrFunction, out: &mut Vec<IrInstr>, kind: GuardKind| {
                let bailout = ir.new_bailout(frame, offset, BailoutReason::for_guard(&kind));
                out.push(IrInstr {
                    op: IrOp::Guard { kind, bailout },
                    offset,
                    frame,
                });
            };

            let op = match instr.op {
                IrOp::Binary {
                    op,
                    kind: NumKind::Generic,
                    dst,
                    lhs,
                    rhs,
                    overflow,
                } => match numeric_kind(body, offset) {
                    Some(NumKind::Int) => {
                        guard(ir, &mut out, GuardKind::Int(lhs));
                        if rhs != lhs {
                            guard(ir, &mut out, GuardKind::Int(rhs));
                        }
                        let overflow = may_overflow(op).then(|| overflow_bailout(ir, frame, offset));
                        result.instructions_modified += 1;
                        IrOp::Binary {
                            op,
                            kind: NumKind::Int,
                            dst,
                            lhs,
                            rhs,
                            overflow,
                        }
                    }
                    Some(NumKind::Float) => {
                        guard(ir, &mut out, GuardKind::Number(lhs));
                        if rhs != lhs {
                            guard(ir, &mut out, GuardKind::Number(rhs));
                        }
                        result.instructions_modified += 1;
                        IrOp::Binary {
                            op,
                            kind: NumKind::Float,
                            dst,
                            lhs,
                            rhs,
                            overflow: None,
                        }
                    }
                    _ => IrOp::Binary {
                        op,
                        kind: NumKind::Generic,
                        dst,
                        lhs,
                        rhs,
                        overflow,
                    },
                },
                IrOp::GetField {
                    dst,
                    obj,
                    prop,
                    function,
                    ic,
                } => match specializable_slot(body, ic) {
                    Some(slot) => {
                        let types = cache_types(body, ic);
                        guard(ir, &mut out, GuardKind::Type(obj, types));
                        result.instructions_modified += 1;
                        IrOp::LoadSlot { dst, obj, slot }
                    }
                    None => IrOp::GetField {
                        dst,
                        obj,
                        prop,
                        function,
                        ic,
                    },
                },
                IrOp::SetField {
                    obj,
                    prop,
                    src,
                    function,
                    ic,
                } => match specializable_slot(body, ic) {
                    Some(slot) => {
                        let types = cache_types(body, ic);
                        guard(ir, &mut out, GuardKind::Type(obj, types));
                        result.instructions_modified += 1;
                        IrOp::StoreSlot { obj, slot, src, prop }
                    }
                    None => IrOp::SetField {
                        obj,
                        prop,
                        src,
                        function,
                        ic,
                    },
                },
                IrOp::GetElem {
                    dst,
                    arr,
                    idx,
                    checked: true,
                } if is_array_int_access(body, offset) => {
                    guard(ir, &mut out, GuardKind::Array(arr));
                    guard(ir, &mut out, GuardKind::Int(idx));
                    guard(ir, &mut out, GuardKind::Bounds { arr, idx });
                    result.instructions_modified += 1;
                    IrOp::GetElem {
                        dst,
                        arr,
                        idx,
                        checked: false,
                    }
                }
                other => other,
            };
            out.push(IrInstr { op, offset, frame });
        }
        result.instructions_added = out.len() - old_len;
        ir.instrs = out;
        Ok(result)
    }
}

fn overflow_bailout(ir: &mut IrFunction, frame: FrameId, offset: u32) -> u32 {
    ir.new_bailout(frame, offset, BailoutReason::Overflow)
}

/// Kind to specialize a binary op at `offset` to, from operand feedback
fn numeric_kind(body: &FunctionBodyView, offset: u32) -> Option<NumKind> {
    let fb = body.feedback(offset)?;
    if fb.samples == 0 {
        return None;
    }
    if fb.both(ObservedType::Int32) {
        Some(NumKind::Int)
    } else if fb.both_numeric() {
        Some(NumKind::Float)
    } else {
        None
    }
}

fn specializable_slot(body: &FunctionBodyView, ic: u16) -> Option<u32> {
    let cache = body.inline_cache(ic)?;
    if !cache.is_specializable() {
        return None;
    }
    cache.common_slot()
}

fn cache_types(body: &FunctionBodyView, ic: u16) -> EquivalentTypeSet {
    body.inline_cache(ic).map(|c| c.equivalent_types()).unwrap_or_default()
}

fn is_array_int_access(body: &FunctionBodyView, offset: u32) -> bool {
    body.feedback(offset)
        .is_some_and(|fb| fb.samples > 0 && fb.lhs == ObservedType::Array && fb.rhs == ObservedType::Int32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Assembler, FunctionBody};
    use crate::config::JitConfig;
    use crate::jit::ir::build;
    use crate::jit::snapshot::BodySource;
    use crate::jit::tier::ExecutionMode;
    use crate::jit::work_item::{WorkItem, WorkKind};
    use crate::runtime::{FunctionId, FunctionProfile, PropertyGuardTable, PropertyId};

    fn ir_for(body: &FunctionBody, profile: &FunctionProfile) -> (IrFunction, JitSnapshot) {
        let ids: Vec<PropertyId> = (0..body.names.len() as u32).map(PropertyId).collect();
        let view = FunctionBodyView::capture(
            BodySource {
                function: FunctionId(0),
                local_id: 0,
                source_context: 0,
                body,
                property_ids: &ids,
            },
            profile,
            &PropertyGuardTable::new(),
        );
        let snapshot = JitSnapshot::new(view);
        let work = WorkItem {
            id: 0,
            function: FunctionId(0),
            epoch: 0,
            kind: WorkKind::Function,
            mode: ExecutionMode::FullJit,
            call_count: 0,
            loop_count: 0,
            display_name: body.name.clone(),
        };
        (build(&snapshot, &work, &JitConfig::default()).unwrap(), snapshot)
    }

    fn add_body() -> (FunctionBody, u32) {
        let mut asm = Assembler::new("add", 2);
        asm.load_arg(0, 0).load_arg(1, 1);
        let add_at = asm.offset() as u32;
        asm.add(2, 0, 1).ret(2);
        (asm.finish().unwrap(), add_at)
    }

    #[test]
    fn test_int_feedback_specializes_with_guards() {
        let (body, add_at) = add_body();
        let mut profile = FunctionProfile::new(0, 0, 0);
        profile.record_operands(add_at, ObservedType::Int32, ObservedType::Int32);
        let (mut ir, snapshot) = ir_for(&body, &profile);
        let result = TypeSpecialization.run(&mut ir, &snapshot).unwrap();
        assert_eq!(result.instructions_modified, 1);
        assert_eq!(result.instructions_added, 2);
        let add = ir
            .instrs
            .iter()
            .find(|i| matches!(i.op, IrOp::Binary { .. }))
            .unwrap();
        assert!(matches!(
            add.op,
            IrOp::Binary { kind: NumKind::Int, lhs: 0, rhs: 1, overflow: Some(_), .. }
        ));
        let guards = ir
            .instrs
            .iter()
            .filter(|i| matches!(i.op, IrOp::Guard { kind: GuardKind::Int(_), .. }))
            .count();
        assert_eq!(guards, 2);
    }

    #[test]
    fn test_mixed_feedback_stays_generic() {
        let (body, add_at) = add_body();
        let mut profile = FunctionProfile::new(0, 0, 0);
        profile.record_operands(add_at, ObservedType::Int32, ObservedType::String);
        let (mut ir, snapshot) = ir_for(&body, &profile);
        let result = TypeSpecialization.run(&mut ir, &snapshot).unwrap();
        assert_eq!(result.total_changes(), 0);
    }

    #[test]
    fn test_float_feedback() {
        let (body, add_at) = add_body();
        let mut profile = FunctionProfile::new(0, 0, 0);
        profile.record_operands(add_at, ObservedType::Int32, ObservedType::Float64);
        let (mut ir, snapshot) = ir_for(&body, &profile);
        TypeSpecialization.run(&mut ir, &snapshot).unwrap();
        assert!(ir
            .instrs
            .iter()
            .any(|i| matches!(i.op, IrOp::Binary { kind: NumKind::Float, overflow: None, .. })));
    }
}
