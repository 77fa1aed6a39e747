//! Per-work-item compilation pipeline
//!
//! Building -> Optimizing -> Lowering -> Encoding -> Finalized, or Abandoned
//! from any stage. Everything up to `Encoding` touches only the snapshot, so
//! the same code runs on the interpreter thread, a background worker and the
//! compile server. Installing into executable memory is a separate step.

use super::alloc::CodeAllocator;
use super::encoder::{self, EncodedFunction};
use super::ir;
use super::lower;
use super::opt::{self, OptimizationResult};
use super::output::CompiledCode;
use super::security;
use super::snapshot::JitSnapshot;
use super::work_item::WorkItem;
use crate::config::JitConfig;
use crate::error::{Error, Result};
use std::fmt;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Building,
    Optimizing,
    Lowering,
    Encoding,
    Finalized,
    Abandoned,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Building => "building",
            PipelineStage::Optimizing => "optimizing",
            PipelineStage::Lowering => "lowering",
            PipelineStage::Encoding => "encoding",
            PipelineStage::Finalized => "finalized",
            PipelineStage::Abandoned => "abandoned",
        };
        write!(f, "{}", name)
    }
}

/// Text dumps of each intermediate form, for `disasm`
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub ir: String,
    pub optimized_ir: String,
    pub passes: Vec<(String, OptimizationResult)>,
    pub lir: String,
}

/// Predicate checked between stages; true abandons the work item
pub type AbandonCheck<'a> = &'a (dyn Fn(&WorkItem) -> bool + Sync);

pub struct Pipeline<'a> {
    config: &'a JitConfig,
    cookie: u64,
    abandon: Option<AbandonCheck<'a>>,
}

struct Tracker<'w> {
    work: &'w WorkItem,
    stage: PipelineStage,
}

impl<'w> Tracker<'w> {
    fn advance(&mut self, next: PipelineStage) {
        debug!(work = %self.work, from = %self.stage, to = %next, "pipeline stage");
        self.stage = next;
    }

    fn fail(&mut self, err: Error) -> Error {
        warn!(work = %self.work, stage = %self.stage, error = %err, "compilation abandoned");
        self.stage = PipelineStage::Abandoned;
        err
    }
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a JitConfig, cookie: u64) -> Self {
        Self {
            config,
            cookie,
            abandon: None,
        }
    }

    pub fn with_abandon_check(mut self, check: AbandonCheck<'a>) -> Self {
        self.abandon = Some(check);
        self
    }

    fn check_abandoned(&self, work: &WorkItem) -> Result<()> {
        match self.abandon {
            Some(check) if check(work) => Err(Error::Abandoned(format!("{} is stale", work))),
            _ => Ok(()),
        }
    }

    /// Compile a work item to encoded bytes and its output record
    pub fn compile(&self, work: &WorkItem, snapshot: &JitSnapshot) -> Result<EncodedFunction> {
        self.run(work, snapshot, None)
    }

    /// Like `compile`, also returning a dump of every stage
    pub fn compile_with_listing(&self, work: &WorkItem, snapshot: &JitSnapshot) -> Result<(EncodedFunction, Listing)> {
        let mut listing = Listing::default();
        let encoded = self.run(work, snapshot, Some(&mut listing))?;
        Ok((encoded, listing))
    }

    fn run(&self, work: &WorkItem, snapshot: &JitSnapshot, mut listing: Option<&mut Listing>) -> Result<EncodedFunction> {
        let mut tracker = Tracker {
            work,
            stage: PipelineStage::Building,
        };
        debug!(work = %work, "pipeline start");

        let mut ir = ir::build(snapshot, work, self.config).map_err(|e| tracker.fail(e))?;
        if let Some(l) = listing.as_deref_mut() {
            l.ir = ir.dump();
        }
        self.check_abandoned(work).map_err(|e| tracker.fail(e))?;

        tracker.advance(PipelineStage::Optimizing);
        let passes = opt::passes_for(work.mode);
        let results = opt::run_optimization_pipeline(&mut ir, snapshot, &passes).map_err(|e| tracker.fail(e))?;
        if let Some(l) = listing.as_deref_mut() {
            l.optimized_ir = ir.dump();
            l.passes = results;
        }
        self.check_abandoned(work).map_err(|e| tracker.fail(e))?;

        tracker.advance(PipelineStage::Lowering);
        let mut lowered = lower::lower(&ir, snapshot, self.config.arch).map_err(|e| tracker.fail(e))?;
        self.check_abandoned(work).map_err(|e| tracker.fail(e))?;

        tracker.advance(PipelineStage::Encoding);
        let (instrs, stats) = security::harden(
            std::mem::take(&mut lowered.instrs),
            &self.config.security,
            self.cookie,
            lowered.function,
        );
        lowered.instrs = instrs;
        if let Some(l) = listing.as_deref_mut() {
            l.lir = lowered.dump();
        }
        let encoded = encoder::encode(&lowered, stats).map_err(|e| tracker.fail(e))?;

        tracker.advance(PipelineStage::Finalized);
        Ok(encoded)
    }
}

/// Copy encoded code into executable memory and finalize it
pub fn install(encoded: EncodedFunction, allocator: &CodeAllocator) -> Result<CompiledCode> {
    let machine = encoded.record.arch.constants();
    let pdata = encoded.pdata_bytes(machine.pdata_entry_size);
    let mut handle = allocator.allocate(encoded.code.len(), encoded.record.pdata.len(), encoded.record.xdata.len())?;
    handle.write(0, &encoded.code)?;
    let (pdata_offset, xdata_offset) = (handle.pdata_offset(), handle.xdata_offset());
    handle.write(pdata_offset, &pdata)?;
    handle.write(xdata_offset, &encoded.record.xdata)?;
    handle.finalize()?;
    debug!(
        function = %encoded.record.function,
        mode = %encoded.record.mode,
        address = format_args!("{:#x}", handle.address()),
        "installed"
    );
    CompiledCode::new(handle, encoded.record, encoded.constants)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Assembler, FunctionBody, FunctionFlags};
    use crate::jit::snapshot::{BodySource, FunctionBodyView};
    use crate::jit::tier::ExecutionMode;
    use crate::jit::work_item::WorkKind;
    use crate::runtime::{FunctionId, FunctionProfile, PropertyGuardTable};

    fn snapshot(body: &FunctionBody) -> JitSnapshot {
        JitSnapshot::new(FunctionBodyView::capture(
            BodySource {
                function: FunctionId(0),
                local_id: 0,
                source_context: 0,
                body,
                property_ids: &[],
            },
            &FunctionProfile::new(body.inline_cache_count, body.call_site_count, body.loop_count),
            &PropertyGuardTable::new(),
        ))
    }

    fn work(mode: ExecutionMode) -> WorkItem {
        WorkItem {
            id: 1,
            function: FunctionId(0),
            epoch: 0,
            kind: WorkKind::Function,
            mode,
            call_count: 10,
            loop_count: 0,
            display_name: "f".into(),
        }
    }

    fn add_body() -> FunctionBody {
        let mut asm = Assembler::new("f", 2);
        asm.load_arg(0, 0).load_arg(1, 1).add(2, 0, 1).ret(2);
        asm.finish().unwrap()
    }

    #[test]
    fn test_compile_and_install() {
        let config = JitConfig::synchronous();
        let body = add_body();
        let encoded = Pipeline::new(&config, 42)
            .compile(&work(ExecutionMode::SimpleJit), &snapshot(&body))
            .unwrap();
        assert!(!encoded.code.is_empty());
        let allocator = CodeAllocator::new(&config.codegen, config.arch.constants());
        let code = install(encoded, &allocator).unwrap();
        assert!(code.handle().is_executable());
        assert!(code.handle().size() >= code.record.code_size as usize);
        assert_ne!(code.record.code_address, 0);
    }

    #[test]
    fn test_listing_has_every_stage() {
        let config = JitConfig::synchronous();
        let body = add_body();
        let (_, listing) = Pipeline::new(&config, 1)
            .compile_with_listing(&work(ExecutionMode::FullJit), &snapshot(&body))
            .unwrap();
        assert!(!listing.ir.is_empty());
        assert!(!listing.optimized_ir.is_empty());
        assert!(!listing.lir.is_empty());
        assert!(!listing.passes.is_empty());
    }

    #[test]
    fn test_unsupported_body_is_abandoned() {
        let config = JitConfig::synchronous();
        let mut asm = Assembler::new("gen", 0);
        asm.flag(FunctionFlags::IS_GENERATOR).load_undefined(0).ret(0);
        let body = asm.finish().unwrap();
        let err = Pipeline::new(&config, 1)
            .compile(&work(ExecutionMode::SimpleJit), &snapshot(&body))
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedConstruct { .. }));
        assert!(err.is_compile_failure());
    }

    #[test]
    fn test_abandon_check_stops_compilation() {
        let config = JitConfig::synchronous();
        let body = add_body();
        let always = |_: &WorkItem| true;
        let err = Pipeline::new(&config, 1)
            .with_abandon_check(&always)
            .compile(&work(ExecutionMode::SimpleJit), &snapshot(&body))
            .unwrap_err();
        assert!(matches!(err, Error::Abandoned(_)));
    }

    #[test]
    fn test_same_cookie_same_bytes() {
        let config = JitConfig::synchronous();
        let body = add_body();
        let a = Pipeline::new(&config, 9).compile(&work(ExecutionMode::FullJit), &snapshot(&body)).unwrap();
        let b = Pipeline::new(&config, 9).compile(&work(ExecutionMode::FullJit), &snapshot(&body)).unwrap();
        assert_eq!(a, b);
    }
}
