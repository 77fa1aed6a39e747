//! Compilation work items

use super::tier::ExecutionMode;
use crate::runtime::FunctionId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a work item compiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkKind {
    /// The whole function, entered at its first instruction
    Function,
    /// One loop of an interpreted function, entered at its header with the
    /// interpreter's registers
    LoopBody { loop_id: u8, header_offset: u32 },
}

/// One request to compile a function or loop body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: u64,
    pub function: FunctionId,
    /// Function generation at creation; stale results are dropped
    pub epoch: u32,
    pub kind: WorkKind,
    pub mode: ExecutionMode,
    pub call_count: u64,
    pub loop_count: u64,
    pub display_name: String,
}

impl WorkItem {
    pub fn is_loop_body(&self) -> bool {
        matches!(self.kind, WorkKind::LoopBody { .. })
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            WorkKind::Function => write!(f, "#{} {} [{}]", self.id, self.display_name, self.mode),
            WorkKind::LoopBody { loop_id, .. } => {
                write!(f, "#{} {} loop {} [{}]", self.id, self.display_name, loop_id, self.mode)
            }
        }
    }
}
