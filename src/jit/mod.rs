//! Tiered JIT compilation
//!
//! Interpreted functions are profiled, promoted through SimpleJIT and FullJIT
//! by the tier controller, and compiled from immutable snapshots:
//!
//! ```text
//! snapshot -> ir::build -> opt passes -> lower (LIR) -> security -> encoder
//!          -> alloc (executable pages) -> output (entry point published)
//! ```
//!
//! Compiled code runs on the executor; a failed guard exits to the engine,
//! which resumes the call in the interpreter.

pub mod alloc;
pub mod context;
pub mod encoder;
pub mod executor;
pub mod inline;
pub mod ir;
pub mod lir;
pub mod lower;
pub mod opt;
pub mod output;
pub mod pipeline;
pub mod queue;
pub mod remote;
pub mod security;
pub mod snapshot;
pub mod tier;
pub mod work_item;

pub use alloc::{AllocatorStats, CodeAllocator, CodeHandle};
pub use context::{JitContext, JitStats};
pub use encoder::EncodedFunction;
pub use executor::{execute, Exit, RuntimeHelpers};
pub use inline::{InlineCallSite, InliningDecider, InliningThresholds};
pub use output::{CompiledCode, EntryPointSlot, OutputRecord};
pub use pipeline::{install, Pipeline, PipelineStage};
pub use queue::{BackgroundCompiler, CompileBackend, InProcessBackend};
pub use remote::{CompileRequest, CompileResponse, JitServer, RemoteCompiler};
pub use snapshot::JitSnapshot;
pub use tier::{ExecutionMode, LoopAction, LoopBailoutAction, TierController};
pub use work_item::{WorkItem, WorkKind};
