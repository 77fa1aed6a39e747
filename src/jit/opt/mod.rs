//! IR optimization passes
//!
//! FullJIT runs the whole pipeline; SimpleJIT only cleans up dead code.
//! Every specialized instruction the passes produce relies on guards that
//! dominate it, and the final verifier refuses IR where that is not true.

pub mod dce;
pub mod fold;
pub mod guards;
pub mod specialize;

pub use dce::DeadCodeElimination;
pub use fold::ConstantFolding;
pub use guards::{GuardElimination, GuardFacts, GuardVerifier};
pub use specialize::TypeSpecialization;

use super::ir::IrFunction;
use super::snapshot::JitSnapshot;
use super::tier::ExecutionMode;
use crate::error::Result;
use tracing::trace;

// ==================== Optimization Pass ====================

/// Result of running an optimization pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptimizationResult {
    pub instructions_modified: usize,
    pub instructions_removed: usize,
    pub instructions_added: usize,
}

impl OptimizationResult {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn total_changes(&self) -> usize {
        self.instructions_modified + self.instructions_removed + self.instructions_added
    }
}

/// Trait for passes that transform an IR function
pub trait OptimizationPass: Send {
    fn name(&self) -> &str;
    fn run(&self, ir: &mut IrFunction, snapshot: &JitSnapshot) -> Result<OptimizationResult>;
}

/// Passes for a tier, in order
pub fn passes_for(mode: ExecutionMode) -> Vec<Box<dyn OptimizationPass>> {
    match mode {
        ExecutionMode::FullJit => vec![
            Box::new(TypeSpecialization),
            Box::new(ConstantFolding),
            Box::new(GuardElimination),
            Box::new(DeadCodeElimination),
            Box::new(GuardVerifier),
        ],
        _ => vec![Box::new(DeadCodeElimination), Box::new(GuardVerifier)],
    }
}

/// Run a sequence of passes, stopping at the first error
pub fn run_optimization_pipeline(
    ir: &mut IrFunction,
    snapshot: &JitSnapshot,
    passes: &[Box<dyn OptimizationPass>],
) -> Result<Vec<(String, OptimizationResult)>> {
    let mut results = Vec::with_capacity(passes.len());
    for pass in passes {
        let result = pass.run(ir, snapshot)?;
        trace!(pass = pass.name(), changes = result.total_changes(), "optimization pass");
        results.push((pass.name().to_string(), result));
    }
    Ok(results)
}
