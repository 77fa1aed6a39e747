//! Engine: functions, dispatch and tiering
//!
//! Owns every loaded function with its profile and entry point, the object
//! model (types, property names, property guards) and the JIT plumbing. A
//! call goes through the function's entry point: compiled code when one is
//! published, the interpreter otherwise. Compilation happens at call
//! boundaries, inline in synchronous mode or on the background worker.

mod helpers;
mod interpreter;
mod snapshot_builder;

pub use interpreter::Activation;

use crate::bytecode::{FunctionBody, Program};
use crate::config::JitConfig;
use crate::error::{Error, Result};
use crate::jit::alloc::{AllocatorStats, CodeAllocator};
use crate::jit::context::{JitContext, JitStats};
use crate::jit::encoder::EncodedFunction;
use crate::jit::executor::{self, Exit};
use crate::jit::output::{CodeTable, CompiledCode, EntryPointSlot};
use crate::jit::pipeline::{self, Listing, Pipeline};
use crate::jit::queue::{BackgroundCompiler, CompileBackend, InProcessBackend};
use crate::jit::remote::RemoteCompiler;
use crate::jit::tier::{ExecutionMode, LoopBailoutAction, TierController, TierTransition};
use crate::jit::work_item::{WorkItem, WorkKind};
use crate::runtime::{
    ops, FunctionId, FunctionProfile, PropertyGuardTable, PropertyId, PropertyNames, TypeRegistry, Value,
};
use rustc_hash::FxHashMap as HashMap;
use serde::Serialize;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A loaded function and everything the engine tracks for it
pub(crate) struct FunctionRecord {
    pub id: FunctionId,
    pub local_id: u16,
    pub program: u32,
    pub body: Rc<FunctionBody>,
    /// Interned ids for `body.names`
    pub property_ids: Rc<[PropertyId]>,
    pub profile: FunctionProfile,
    pub entry: EntryPointSlot,
    pub installed: Option<Arc<CompiledCode>>,
    pub loop_bodies: HashMap<u8, Arc<CompiledCode>>,
}

impl FunctionRecord {
    /// Global id of the function with local id `local` in the same program
    pub fn sibling(&self, local: u16) -> FunctionId {
        FunctionId(self.id.0 - self.local_id as u32 + local as u32)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub jit: JitStats,
    pub installed_functions: usize,
    pub live_code_bytes: usize,
    pub peak_code_bytes: usize,
    pub write_barriers: u64,
    pub guard_invalidations: u64,
}

pub struct Engine {
    config: JitConfig,
    context: Arc<JitContext>,
    pub(crate) functions: Vec<FunctionRecord>,
    programs: u32,
    pub(crate) types: TypeRegistry,
    pub(crate) names: PropertyNames,
    pub(crate) guards: PropertyGuardTable,
    tiers: TierController,
    allocator: CodeAllocator,
    code: CodeTable,
    backend: Arc<dyn CompileBackend>,
    background: Option<BackgroundCompiler>,
    next_work_id: u64,
    pub(crate) depth: usize,
    pub(crate) write_barriers: u64,
}

impl Engine {
    pub fn new(config: JitConfig) -> Result<Self> {
        config.validate()?;
        let context = Arc::new(JitContext::new(config.clone()));
        let backend: Arc<dyn CompileBackend> = if config.out_of_process {
            Arc::new(RemoteCompiler::spawn()?)
        } else {
            Arc::new(InProcessBackend)
        };
        let background = if config.enabled && config.background {
            Some(BackgroundCompiler::spawn(Arc::clone(&context), Arc::clone(&backend))?)
        } else {
            None
        };
        let allocator = CodeAllocator::new(&config.codegen, config.arch.constants());
        info!(
            arch = %config.arch,
            enabled = config.enabled,
            background = config.background,
            out_of_process = config.out_of_process,
            "engine created"
        );
        Ok(Self {
            tiers: TierController::new(config.tiers.clone(), config.enabled),
            config,
            context,
            functions: Vec::new(),
            programs: 0,
            types: TypeRegistry::new(),
            names: PropertyNames::new(),
            guards: PropertyGuardTable::new(),
            allocator,
            code: CodeTable::new(),
            backend,
            background,
            next_work_id: 0,
            depth: 0,
            write_barriers: 0,
        })
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<JitContext> {
        &self.context
    }

    // ==================== Loading ====================

    /// Load every function of a program; returns the entry function
    pub fn load_program(&mut self, program: &Program) -> Result<FunctionId> {
        if program.functions.is_empty() {
            return Err(Error::invalid_bytecode(0, "program has no functions"));
        }
        if program.entry as usize >= program.functions.len() {
            return Err(Error::invalid_bytecode(0, format!("entry {} out of range", program.entry)));
        }
        for body in &program.functions {
            body.validate()?;
        }
        let base = self.functions.len() as u32;
        let source = self.programs;
        self.programs += 1;
        for (local, body) in program.functions.iter().enumerate() {
            let property_ids: Rc<[PropertyId]> = body.names.iter().map(|n| self.names.intern(n)).collect();
            self.functions.push(FunctionRecord {
                id: FunctionId(base + local as u32),
                local_id: local as u16,
                program: source,
                body: Rc::new(body.clone()),
                property_ids,
                profile: FunctionProfile::new(body.inline_cache_count, body.call_site_count, body.loop_count),
                entry: EntryPointSlot::new(),
                installed: None,
                loop_bodies: HashMap::default(),
            });
        }
        debug!(functions = program.functions.len(), base, "program loaded");
        Ok(FunctionId(base + program.entry as u32))
    }

    pub fn function_named(&self, name: &str) -> Option<FunctionId> {
        self.functions.iter().find(|f| f.body.name == name).map(|f| f.id)
    }

    pub fn function_name(&self, f: FunctionId) -> Option<&str> {
        self.record(f).ok().map(|r| r.body.name.as_str())
    }

    pub(crate) fn record(&self, f: FunctionId) -> Result<&FunctionRecord> {
        self.functions
            .get(f.0 as usize)
            .ok_or_else(|| Error::reference_error(format!("no function {}", f)))
    }

    pub(crate) fn record_mut(&mut self, f: FunctionId) -> Result<&mut FunctionRecord> {
        self.functions
            .get_mut(f.0 as usize)
            .ok_or_else(|| Error::reference_error(format!("no function {}", f)))
    }

    // ==================== Calls ====================

    /// Call `f` as a plain function
    pub fn call(&mut self, f: FunctionId, args: &[Value]) -> Result<Value> {
        self.call_function(f, Value::Undefined, args)
    }

    /// Call `f` with an explicit `this`
    pub fn call_function(&mut self, f: FunctionId, this: Value, args: &[Value]) -> Result<Value> {
        if self.depth >= self.config.max_call_depth {
            return Err(Error::range_error("Maximum call stack size exceeded"));
        }
        self.record(f)?;
        self.poll_background();
        if let Some(mode) = self.tiers.on_call(f) {
            self.request_compile(f, WorkKind::Function, mode);
        }

        self.depth += 1;
        let result = match self.installed_code(f) {
            Some(code) => self.run_compiled(&code, this, args),
            None => self.interpret(Activation::new(f, this, args.to_vec())),
        };
        self.depth -= 1;
        result
    }

    /// Code behind the published entry point, if any
    fn installed_code(&self, f: FunctionId) -> Option<Arc<CompiledCode>> {
        let address = self.functions.get(f.0 as usize)?.entry.load();
        if address == EntryPointSlot::INTERPRETER {
            return None;
        }
        self.code.get(address)
    }

    fn run_compiled(&mut self, code: &Arc<CompiledCode>, this: Value, args: &[Value]) -> Result<Value> {
        match executor::execute(code, &this, args, None, self)? {
            Exit::Return(v) => Ok(v),
            Exit::Bailout { id, regs, .. } => {
                self.note_bailout(code, id);
                let (regs, offset) = self.unwind_inlined(code, id, &regs, &this, args)?;
                self.interpret(Activation {
                    function: code.function(),
                    this,
                    args: args.to_vec(),
                    regs,
                    pc: offset as usize,
                })
            }
            Exit::LoopExit { target, .. } => Err(Error::internal(format!(
                "{} left a loop at {} but was compiled as a whole function",
                code.function(),
                target
            ))),
        }
    }

    // ==================== Bailouts ====================

    pub(crate) fn note_bailout(&mut self, code: &CompiledCode, id: u32) {
        self.context.record_bailout();
        let function = code.function();
        let reason = code.record.bailout(id).map(|b| b.reason);
        debug!(function = %function, bailout = id, ?reason, mode = %code.mode(), "bailout");
        let kind = code.record.kind;
        match kind {
            WorkKind::Function => {
                if let Some(mode) = self.tiers.on_bailout(function, id) {
                    self.request_compile(function, WorkKind::Function, mode);
                }
            }
            WorkKind::LoopBody { loop_id, .. } => match self.tiers.on_loop_body_bailout(function, loop_id) {
                LoopBailoutAction::Keep => {}
                LoopBailoutAction::Drop => self.drop_loop_body(function, loop_id),
                LoopBailoutAction::Recompile => {
                    self.drop_loop_body(function, loop_id);
                    self.request_compile(function, kind, ExecutionMode::FullJit);
                }
            },
        }
    }

    fn drop_loop_body(&mut self, f: FunctionId, loop_id: u8) {
        let Some(record) = self.functions.get_mut(f.0 as usize) else {
            return;
        };
        if let Some(old) = record.loop_bodies.remove(&loop_id) {
            self.code.remove(old.address());
        }
    }

    /// Finish every inlined frame active at bailout `id` in the interpreter,
    /// innermost first. Returns the top frame's registers and the offset the
    /// top frame resumes at.
    pub(crate) fn unwind_inlined(
        &mut self,
        code: &CompiledCode,
        id: u32,
        regs: &[Value],
        this: &Value,
        args: &[Value],
    ) -> Result<(Vec<Value>, u32)> {
        let record = &code.record;
        let bailout = *record
            .bailout(id)
            .ok_or_else(|| Error::internal(format!("unknown bailout {} in {}", id, record.function)))?;
        let frame_regs = |frame: &crate::jit::ir::InlineFrame| -> Vec<Value> {
            (frame.reg_base..frame.reg_base + frame.reg_count)
                .map(|v| regs.get(v as usize).cloned().unwrap_or_default())
                .collect()
        };
        let value_of = |v: u32| regs.get(v as usize).cloned().unwrap_or_default();

        let mut frame_id = bailout.frame;
        let mut offset = bailout.offset;
        let mut pending: Option<(usize, Value)> = None;
        loop {
            let frame = record
                .frames
                .get(frame_id as usize)
                .ok_or_else(|| Error::internal(format!("unknown inline frame {}", frame_id)))?;
            let mut fregs = frame_regs(frame);
            if let Some((r, v)) = pending.take() {
                if let Some(slot) = fregs.get_mut(r) {
                    *slot = v;
                }
            }
            let Some(parent_id) = frame.parent else {
                return Ok((fregs, offset));
            };
            let fthis = frame.this_reg.map(value_of).unwrap_or_else(|| {
                if frame_id == 0 {
                    this.clone()
                } else {
                    Value::Undefined
                }
            });
            let fargs: Vec<Value> = if frame_id == 0 {
                args.to_vec()
            } else {
                frame.arg_regs.iter().map(|v| value_of(*v)).collect()
            };
            debug!(function = %frame.function, offset, frame = frame_id, "resuming inlined frame");
            self.depth += 1;
            let result = self.interpret(Activation {
                function: frame.function,
                this: fthis.clone(),
                args: fargs,
                regs: fregs,
                pc: offset as usize,
            });
            self.depth -= 1;
            let result = result?;
            let result = if frame.is_construct {
                ops::construct_result(result, fthis)
            } else {
                result
            };
            let parent = record
                .frames
                .get(parent_id as usize)
                .ok_or_else(|| Error::internal(format!("unknown inline frame {}", parent_id)))?;
            pending = Some(((frame.result_reg - parent.reg_base) as usize, result));
            offset = frame.resume_offset;
            frame_id = parent_id;
        }
    }

    // ==================== Compilation ====================

    fn new_work_item(&mut self, f: FunctionId, kind: WorkKind, mode: ExecutionMode) -> Result<WorkItem> {
        self.next_work_id += 1;
        let record = self.record(f)?;
        Ok(WorkItem {
            id: self.next_work_id,
            function: f,
            epoch: self.context.epoch(f),
            kind,
            mode,
            call_count: self.tiers.calls(f),
            loop_count: record.profile.loop_iterations.iter().sum(),
            display_name: record.body.name.clone(),
        })
    }

    /// Snapshot `f` and compile it, inline or on the worker
    pub(crate) fn request_compile(&mut self, f: FunctionId, kind: WorkKind, mode: ExecutionMode) {
        let prepared = self
            .new_work_item(f, kind, mode)
            .and_then(|work| self.build_snapshot(&work).map(|s| (work, s)));
        let (work, snapshot) = match prepared {
            Ok(p) => p,
            Err(e) => {
                warn!(function = %f, error = %e, "cannot prepare work item");
                self.compile_failed(f, kind, mode);
                return;
            }
        };
        debug!(work = %work, inlinees = snapshot.inlinee_count(), "work item created");

        if let Some(background) = self.background.as_mut() {
            if background.submit(work.clone(), snapshot) {
                return;
            }
            warn!(work = %work, "background compiler gone; compiling inline");
            let snapshot = match self.build_snapshot(&work) {
                Ok(s) => s,
                Err(_) => {
                    self.compile_failed(f, kind, mode);
                    return;
                }
            };
            self.compile_inline(work, snapshot);
            return;
        }
        self.compile_inline(work, snapshot);
    }

    fn compile_inline(&mut self, work: WorkItem, snapshot: crate::jit::snapshot::JitSnapshot) {
        let result = {
            let _active = self.context.begin_jit();
            self.backend.compile(&work, &snapshot, &self.context)
        };
        self.finish_compile(work, result);
    }

    fn compile_failed(&mut self, f: FunctionId, kind: WorkKind, mode: ExecutionMode) {
        match kind {
            WorkKind::Function => self.tiers.on_compile_failed(f, mode),
            WorkKind::LoopBody { loop_id, .. } => self.tiers.on_loop_body_failed(f, loop_id),
        }
    }

    /// Install a finished compilation, unless it went stale meanwhile
    fn finish_compile(&mut self, work: WorkItem, result: Result<EncodedFunction>) {
        let f = work.function;
        if !self.context.is_current(&work) {
            debug!(work = %work, "discarding stale compilation");
            self.context.record_discarded();
            if !work.is_loop_body() {
                self.tiers.on_discarded(f);
            }
            return;
        }
        match result.and_then(|encoded| pipeline::install(encoded, &self.allocator)) {
            Ok(code) => self.publish(work, code),
            Err(e) => {
                match &e {
                    Error::Abandoned(_) => self.context.record_abandoned(),
                    _ => self.context.record_failed(),
                }
                warn!(work = %work, error = %e, "compilation failed; staying on current tier");
                self.compile_failed(f, work.kind, work.mode);
            }
        }
    }

    fn publish(&mut self, work: WorkItem, code: CompiledCode) {
        let f = work.function;
        let code = Arc::new(code);
        let address = self.code.insert(Arc::clone(&code));
        self.context.record_compiled(code.handle().size());
        let Some(record) = self.functions.get_mut(f.0 as usize) else {
            return;
        };
        match work.kind {
            WorkKind::Function => {
                let previous = record.installed.replace(Arc::clone(&code));
                record.entry.publish(address);
                if let Some(old) = previous {
                    self.code.remove(old.address());
                }
                self.tiers.on_installed(f, work.mode);
            }
            WorkKind::LoopBody { loop_id, .. } => {
                if let Some(old) = record.loop_bodies.insert(loop_id, Arc::clone(&code)) {
                    self.code.remove(old.address());
                }
                self.tiers.on_loop_body_installed(f, loop_id);
            }
        }
        info!(work = %work, address = format_args!("{:#x}", address), bytes = code.record.code_size, "published");
    }

    /// Install whatever the worker finished
    pub fn poll_background(&mut self) {
        let Some(background) = self.background.as_mut() else {
            return;
        };
        if background.pending() == 0 {
            return;
        }
        for done in background.drain() {
            self.finish_compile(done.work, done.result);
        }
    }

    /// Wait for queued compilations and install them; returns how many
    /// finished
    pub fn wait_for_background(&mut self, timeout: Duration) -> usize {
        let Some(background) = self.background.as_mut() else {
            return 0;
        };
        let done = background.wait_all(timeout);
        let count = done.len();
        for d in done {
            self.finish_compile(d.work, d.result);
        }
        count
    }

    /// Drop `f`'s compiled code and cancel its in-flight work. The next call
    /// asks for the code again.
    pub fn invalidate_function(&mut self, f: FunctionId) -> Result<()> {
        let epoch = self.context.bump_epoch(f);
        let record = self.record_mut(f)?;
        record.entry.reset();
        let mut dropped: Vec<usize> = record.loop_bodies.drain().map(|(_, c)| c.address()).collect();
        if let Some(code) = record.installed.take() {
            dropped.push(code.address());
        }
        for address in dropped {
            self.code.remove(address);
        }
        self.tiers.on_invalidated(f);
        info!(function = %f, epoch, "function invalidated");
        Ok(())
    }

    /// Compile `f` at `mode` without installing, with a dump of each stage
    pub fn compile_listing(&mut self, f: FunctionId, mode: ExecutionMode) -> Result<(EncodedFunction, Listing)> {
        let work = self.new_work_item(f, WorkKind::Function, mode)?;
        let snapshot = self.build_snapshot(&work)?;
        Pipeline::new(&self.config, self.context.cookie()).compile_with_listing(&work, &snapshot)
    }

    // ==================== Introspection ====================

    pub fn execution_mode(&self, f: FunctionId) -> ExecutionMode {
        self.tiers.mode(f)
    }

    pub fn tier_transitions(&self) -> &[TierTransition] {
        self.tiers.transitions()
    }

    pub fn transitions_for(&self, f: FunctionId) -> Vec<(ExecutionMode, ExecutionMode)> {
        self.tiers.transitions_for(f)
    }

    pub fn bailouts(&self, f: FunctionId) -> u64 {
        self.tiers.bailouts(f)
    }

    pub fn rejit_attempts(&self, f: FunctionId) -> u32 {
        self.tiers.rejit_attempts(f)
    }

    /// Same-tier recompiles of one loop body
    pub fn loop_rejit_attempts(&self, f: FunctionId, loop_id: u8) -> u32 {
        self.tiers.loop_rejit_attempts(f, loop_id)
    }

    pub fn call_count(&self, f: FunctionId) -> u64 {
        self.tiers.calls(f)
    }

    pub fn compiled_code(&self, f: FunctionId) -> Option<Arc<CompiledCode>> {
        self.functions.get(f.0 as usize)?.installed.clone()
    }

    pub fn loop_body_code(&self, f: FunctionId, loop_id: u8) -> Option<Arc<CompiledCode>> {
        self.functions.get(f.0 as usize)?.loop_bodies.get(&loop_id).cloned()
    }

    pub fn allocator_stats(&self) -> AllocatorStats {
        self.allocator.stats()
    }

    pub fn stats(&self) -> EngineStats {
        let alloc = self.allocator.stats();
        EngineStats {
            jit: self.context.stats(),
            installed_functions: self.functions.iter().filter(|f| f.installed.is_some()).count(),
            live_code_bytes: alloc.live_bytes,
            peak_code_bytes: alloc.peak_bytes,
            write_barriers: self.write_barriers,
            guard_invalidations: self.guards.invalidations(),
        }
    }

    // ==================== Host objects ====================

    /// Build an object by storing `props` in order, as bytecode would
    pub fn new_object_with(&mut self, props: &[(&str, Value)]) -> Result<Value> {
        let obj = Value::new_object(TypeRegistry::ROOT, props.len());
        for (name, value) in props {
            self.set_property(&obj, name, value.clone())?;
        }
        Ok(obj)
    }

    pub fn set_property(&mut self, obj: &Value, name: &str, value: Value) -> Result<()> {
        let prop = self.names.intern(name);
        self.store_field(obj, prop, value).map(|_| ())
    }

    pub fn get_property(&mut self, obj: &Value, name: &str) -> Result<Value> {
        let prop = self.names.intern(name);
        self.load_field(obj, prop).map(|(v, _)| v)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("functions", &self.functions.len())
            .field("installed", &self.code.len())
            .field("depth", &self.depth)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Assembler;
    use crate::error::ErrorKind;
    use crate::runtime::CacheState;

    fn engine_with(config: JitConfig, functions: Vec<FunctionBody>) -> (Engine, FunctionId) {
        let mut engine = Engine::new(config).unwrap();
        let entry = engine.load_program(&Program { functions, entry: 0 }).unwrap();
        (engine, entry)
    }

    fn interpreted(functions: Vec<FunctionBody>) -> (Engine, FunctionId) {
        engine_with(JitConfig::interpreter_only(), functions)
    }

    #[test]
    fn test_loop_and_branches() {
        let mut asm = Assembler::new("sum", 1);
        let head = asm.new_label();
        let exit = asm.new_label();
        asm.load_arg(0, 0).load_int(1, 0).load_int(2, 1).load_int(4, 0);
        asm.bind(head);
        asm.loop_header();
        asm.lt(3, 1, 0).jump_if_false(3, exit).add(4, 4, 1).add(1, 1, 2).jump(head);
        asm.bind(exit);
        asm.ret(4);
        let (mut engine, f) = interpreted(vec![asm.finish().unwrap()]);
        assert_eq!(engine.call(f, &[Value::Int(10)]).unwrap(), Value::Int(45));
        assert_eq!(engine.record(f).unwrap().profile.loop_iterations, vec![11]);
    }

    #[test]
    fn test_catch_receives_runtime_errors() {
        let mut asm = Assembler::new("f", 0);
        let handler = asm.new_label();
        asm.try_begin(handler, 0)
            .load_undefined(1)
            .get_field(2, 1, "x")
            .try_end()
            .ret(2);
        asm.bind(handler);
        asm.ret(0);
        let (mut engine, f) = interpreted(vec![asm.finish().unwrap()]);
        let v = engine.call(f, &[]).unwrap();
        assert!(v.to_string().starts_with("TypeError"), "got {}", v);
    }

    #[test]
    fn test_uncaught_error_has_location() {
        let mut asm = Assembler::new("f", 0);
        asm.load_int(0, 1).call(1, 0, 2, 0).ret(1);
        let (mut engine, f) = interpreted(vec![asm.finish().unwrap()]);
        let err = engine.call(f, &[]).unwrap_err();
        assert!(matches!(err, Error::RuntimeError { kind: ErrorKind::TypeError, .. }));
        let loc = err.location().unwrap();
        assert_eq!(loc.function, f.0);
        assert!(loc.offset > 0);
    }

    #[test]
    fn test_call_depth_is_bounded() {
        let mut asm = Assembler::new("rec", 0);
        asm.load_func(0, 0).call(1, 0, 2, 0).ret(1);
        let config = JitConfig {
            max_call_depth: 32,
            ..JitConfig::interpreter_only()
        };
        let (mut engine, f) = engine_with(config, vec![asm.finish().unwrap()]);
        let err = engine.call(f, &[]).unwrap_err();
        assert!(matches!(err, Error::RuntimeError { kind: ErrorKind::RangeError, .. }));
        assert_eq!(engine.depth, 0);
    }

    #[test]
    fn test_objects_built_alike_share_a_type() {
        let mut asm = Assembler::new("mk", 2);
        asm.new_object(0)
            .load_arg(1, 0)
            .load_arg(2, 1)
            .set_field(0, "a", 1)
            .set_field(0, "b", 2)
            .get_field(3, 0, "b")
            .ret(0);
        let (mut engine, f) = interpreted(vec![asm.finish().unwrap()]);
        let x = engine.call(f, &[Value::Int(1), Value::Int(2)]).unwrap();
        let y = engine.call(f, &[Value::Int(3), Value::string("s")]).unwrap();
        assert_eq!(x.object_type(), y.object_type());
        assert_eq!(engine.get_property(&y, "b").unwrap(), Value::string("s"));

        let profile = &engine.record(f).unwrap().profile;
        assert_eq!(profile.inline_caches.len(), 3);
        let adding = &profile.inline_caches[0].entries()[0];
        assert!(adding.is_transition());
        assert_eq!(profile.inline_caches[2].state(), CacheState::Monomorphic);
    }

    #[test]
    fn test_new_records_constructor_cache() {
        let mut asm = Assembler::new("make", 0);
        asm.load_func(0, 1).load_int(1, 4).construct(2, 0, 1, 1).ret(2);
        let make = asm.finish().unwrap();
        let mut asm = Assembler::new("Box", 1);
        asm.load_this(0).load_arg(1, 0).set_field(0, "v", 1).load_undefined(2).ret(2);
        let ctor = asm.finish().unwrap();
        let (mut engine, f) = interpreted(vec![make, ctor]);

        let obj = engine.call(f, &[]).unwrap();
        assert_eq!(engine.get_property(&obj, "v").unwrap(), Value::Int(4));
        let boxed = engine.function_named("Box").unwrap();
        let cache = &engine.record(boxed).unwrap().profile.constructor_cache;
        assert!(cache.is_monomorphic());
        assert_eq!(cache.slot_count, 1);
        assert_eq!(engine.record(f).unwrap().profile.call_sites[0].monomorphic_target(), Some(boxed));
    }

    #[test]
    fn test_second_program_resolves_its_own_functions() {
        let mut asm = Assembler::new("first", 0);
        asm.load_int(0, 1).ret(0);
        let (mut engine, _) = interpreted(vec![asm.finish().unwrap()]);

        let mut asm = Assembler::new("outer", 0);
        asm.load_func(0, 1).call(1, 0, 2, 0).ret(1);
        let outer = asm.finish().unwrap();
        let mut asm = Assembler::new("inner", 0);
        asm.load_int(0, 7).ret(0);
        let inner = asm.finish().unwrap();
        let entry = engine
            .load_program(&Program {
                functions: vec![outer, inner],
                entry: 0,
            })
            .unwrap();
        assert_eq!(entry, FunctionId(1));
        assert_eq!(engine.call(entry, &[]).unwrap(), Value::Int(7));
    }

    #[test]
    fn test_full_jit_snapshot_carries_inlinees() {
        let mut asm = Assembler::new("caller", 1);
        asm.load_func(0, 1).load_arg(1, 0).call(2, 0, 1, 1).ret(2);
        let caller = asm.finish().unwrap();
        let mut asm = Assembler::new("callee", 1);
        asm.load_arg(0, 0).load_int(1, 1).add(2, 0, 1).ret(2);
        let callee = asm.finish().unwrap();
        let (mut engine, f) = interpreted(vec![caller, callee]);
        engine.call(f, &[Value::Int(1)]).unwrap();

        let full = engine.new_work_item(f, WorkKind::Function, ExecutionMode::FullJit).unwrap();
        let snapshot = engine.build_snapshot(&full).unwrap();
        assert_eq!(snapshot.inlinee_count(), 1);
        assert!(snapshot.has_body(FunctionId(1)));

        let simple = engine.new_work_item(f, WorkKind::Function, ExecutionMode::SimpleJit).unwrap();
        assert_eq!(engine.build_snapshot(&simple).unwrap().inlinee_count(), 0);
    }

    #[test]
    fn test_bad_program_is_rejected() {
        let mut engine = Engine::new(JitConfig::interpreter_only()).unwrap();
        let err = engine
            .load_program(&Program {
                functions: vec![],
                entry: 0,
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidBytecode { .. }));
        assert!(engine.call(FunctionId(3), &[]).is_err());
    }

    #[test]
    fn test_write_barriers_are_counted() {
        let mut engine = Engine::new(JitConfig::interpreter_only()).unwrap();
        let inner = engine.new_object_with(&[]).unwrap();
        engine.new_object_with(&[("x", Value::Int(1)), ("o", inner)]).unwrap();
        assert_eq!(engine.stats().write_barriers, 1);
    }
}
