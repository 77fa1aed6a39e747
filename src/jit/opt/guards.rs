//! Guard facts, redundant-guard elimination and the guard verifier
//!
//! Facts are tracked forward through straight-line code and dropped at
//! every label. A redefinition kills the facts about its register; anything
//! that can run user code or store into the heap kills shape, property and
//! bounds facts.

use super::{OptimizationPass, OptimizationResult};
use crate::bytecode::BinOp;
use crate::error::{Error, Result};
use crate::jit::ir::{GuardKind, IrConst, IrFunction, IrOp, NumKind, VReg};
use crate::jit::snapshot::{EquivalentTypeSet, JitSnapshot};
use crate::runtime::{FunctionId, PropertyGuardId};
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};

/// What is known to hold at one program point
#[derive(Debug, Default, Clone)]
pub struct GuardFacts {
    ints: HashSet<VReg>,
    numbers: HashSet<VReg>,
    arrays: HashSet<VReg>,
    types: HashMap<VReg, EquivalentTypeSet>,
    callees: HashMap<VReg, FunctionId>,
    properties: HashSet<PropertyGuardId>,
    bounds: HashSet<(VReg, VReg)>,
}

impl GuardFacts {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Whether a guard of this kind would certainly pass
    pub fn implies(&self, kind: &GuardKind) -> bool {
        match kind {
            GuardKind::Int(v) => self.ints.contains(v),
            GuardKind::Number(v) => self.numbers.contains(v) || self.ints.contains(v),
            GuardKind::Array(v) => self.arrays.contains(v),
            GuardKind::Type(v, set) => self.types.get(v).is_some_and(|known| known.is_subset_of(set)),
            GuardKind::Callee(v, f) => self.callees.get(v) == Some(f),
            GuardKind::Property(g) => self.properties.contains(g),
            GuardKind::Bounds { arr, idx } => self.bounds.contains(&(*arr, *idx)),
        }
    }

    /// Record that a guard passed
    pub fn assume(&mut self, kind: &GuardKind) {
        match kind {
            GuardKind::Int(v) => {
                self.ints.insert(*v);
                self.numbers.insert(*v);
            }
            GuardKind::Number(v) => {
                self.numbers.insert(*v);
            }
            GuardKind::Array(v) => {
                self.arrays.insert(*v);
            }
            GuardKind::Type(v, set) => {
                let mut set = set.clone();
                set.sort_and_remove_duplicates();
                self.types.insert(*v, set);
            }
            GuardKind::Callee(v, f) => {
                self.callees.insert(*v, *f);
            }
            GuardKind::Property(g) => {
                self.properties.insert(*g);
            }
            GuardKind::Bounds { arr, idx } => {
                self.bounds.insert((*arr, *idx));
            }
        }
    }

    fn kill(&mut self, v: VReg) {
        self.ints.remove(&v);
        self.numbers.remove(&v);
        self.arrays.remove(&v);
        self.types.remove(&v);
        self.callees.remove(&v);
        self.bounds.retain(|(a, i)| *a != v && *i != v);
    }

    fn kill_heap(&mut self) {
        self.types.clear();
        self.properties.clear();
        self.bounds.clear();
    }

    /// Update facts for the effect of a non-guard instruction
    pub fn apply(&mut self, op: &IrOp) {
        if matches!(op, IrOp::Label(_)) {
            self.clear();
            return;
        }
        if op.is_call() || matches!(op, IrOp::StoreSlot { .. } | IrOp::SetElem { .. }) {
            self.kill_heap();
        }
        let Some(dst) = op.def() else {
            return;
        };
        // Snapshot what the source knows before the destination is killed
        let copied = match op {
            IrOp::Move { src, .. } => Some(self.facts_of(*src)),
            _ => None,
        };
        self.kill(dst);
        match op {
            IrOp::LoadConst { value, .. } => match value {
                IrConst::Int(_) => {
                    self.ints.insert(dst);
                    self.numbers.insert(dst);
                }
                IrConst::Float(_) => {
                    self.numbers.insert(dst);
                }
                IrConst::Func(f) => {
                    self.callees.insert(dst, *f);
                }
                _ => {}
            },
            IrOp::Binary { op, kind, .. } if !op.is_comparison() => match kind {
                NumKind::Int => {
                    self.ints.insert(dst);
                    self.numbers.insert(dst);
                }
                NumKind::Float => {
                    self.numbers.insert(dst);
                }
                NumKind::Generic => {}
            },
            IrOp::NewArray { .. } => {
                self.arrays.insert(dst);
            }
            IrOp::Move { .. } => {
                if let Some((int, num, arr, ty, callee)) = copied {
                    if int {
                        self.ints.insert(dst);
                    }
                    if num {
                        self.numbers.insert(dst);
                    }
                    if arr {
                        self.arrays.insert(dst);
                    }
                    if let Some(ty) = ty {
                        self.types.insert(dst, ty);
                    }
                    if let Some(f) = callee {
                        self.callees.insert(dst, f);
                    }
                }
            }
            _ => {}
        }
    }

    #[allow(clippy::type_complexity)]
    fn facts_of(&self, v: VReg) -> (bool, bool, bool, Option<EquivalentTypeSet>, Option<FunctionId>) {
        (
            self.ints.contains(&v),
            self.numbers.contains(&v),
            self.arrays.contains(&v),
            self.types.get(&v).cloned(),
            self.callees.get(&v).copied(),
        )
    }

    /// Guards a specialized instruction depends on
    pub fn requirements(op: &IrOp) -> Vec<GuardKind> {
        match op {
            IrOp::Binary {
                kind: NumKind::Int,
                lhs,
                rhs,
                ..
            } => vec![GuardKind::Int(*lhs), GuardKind::Int(*rhs)],
            IrOp::Binary {
                kind: NumKind::Float,
                lhs,
                rhs,
                ..
            } => vec![GuardKind::Number(*lhs), GuardKind::Number(*rhs)],
            IrOp::GetElem {
                arr,
                idx,
                checked: false,
                ..
            } => vec![
                GuardKind::Array(*arr),
                GuardKind::Int(*idx),
                GuardKind::Bounds { arr: *arr, idx: *idx },
            ],
            _ => Vec::new(),
        }
    }

    /// Object registers that need a dominating type guard
    fn shape_requirement(op: &IrOp) -> Option<VReg> {
        match op {
            IrOp::LoadSlot { obj, .. } | IrOp::StoreSlot { obj, .. } => Some(*obj),
            _ => None,
        }
    }
}

/// Removes guards already implied by dominating guards in the same block
pub struct GuardElimination;

impl OptimizationPass for GuardElimination {
    fn name(&self) -> &str {
        "GuardElimination"
    }

    fn run(&self, ir: &mut IrFunction, _snapshot: &JitSnapshot) -> Result<OptimizationResult> {
        let mut facts = GuardFacts::default();
        let before = ir.instrs.len();
        ir.instrs.retain(|instr| match &instr.op {
            IrOp::Guard { kind, .. } => {
                if facts.implies(kind) {
                    false
                } else {
                    facts.assume(kind);
                    true
                }
            }
            op => {
                facts.apply(op);
                true
            }
        });
        Ok(OptimizationResult {
            instructions_removed: before - ir.instrs.len(),
            ..OptimizationResult::none()
        })
    }
}

/// Fails compilation when a specialized instruction is not protected by the
/// guards it relies on
pub struct GuardVerifier;

impl OptimizationPass for GuardVerifier {
    fn name(&self) -> &str {
        "GuardVerifier"
    }

    fn run(&self, ir: &mut IrFunction, _snapshot: &JitSnapshot) -> Result<OptimizationResult> {
        let mut facts = GuardFacts::default();
        for instr in &ir.instrs {
            if let IrOp::Guard { kind, .. } = &instr.op {
                facts.assume(kind);
                continue;
            }
            for needed in GuardFacts::requirements(&instr.op) {
                if !facts.implies(&needed) {
                    return Err(Error::internal(format!(
                        "unguarded specialized instruction `{}` at {:04} (needs {:?})",
                        instr.op, instr.offset, needed
                    )));
                }
            }
            if let Some(obj) = GuardFacts::shape_requirement(&instr.op) {
                if !facts.types.contains_key(&obj) {
                    return Err(Error::internal(format!(
                        "slot access `{}` at {:04} without a type guard",
                        instr.op, instr.offset
                    )));
                }
            }
            facts.apply(&instr.op);
        }
        Ok(OptimizationResult::none())
    }
}

/// Arithmetic whose Int32 form can overflow
pub(crate) fn may_overflow(op: BinOp) -> bool {
    matches!(op, BinOp::Add | BinOp::Sub | BinOp::Mul)
}
