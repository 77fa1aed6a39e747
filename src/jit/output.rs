//! Compiled code, its output record, and entry point publication

use super::alloc::CodeHandle;
use super::ir::{BailoutRecord, FrameId, InlineFrame};
use super::lir::{decode_all, LirOp, Loc};
use super::lower::{Arch, FrameLayout};
use super::security::SecurityStats;
use super::tier::ExecutionMode;
use super::work_item::WorkKind;
use crate::error::Result;
use crate::runtime::FunctionId;
use rustc_hash::FxHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Native offset to bytecode location, for instructions that can throw
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrowMapEntry {
    pub native_offset: u32,
    pub frame: FrameId,
    pub bytecode_offset: u32,
}

/// Native code range belonging to one inlined frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineeFrameRecord {
    pub frame: FrameId,
    pub function: FunctionId,
    pub start: u32,
    pub end: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdataEntry {
    pub begin: u32,
    pub end: u32,
    /// Offset of the unwind data from the start of the allocation
    pub unwind_offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UnwindInfo {
    pub prologue_size: u32,
    pub frame_bytes: u32,
}

/// Everything the runtime needs to know about a piece of compiled code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub function: FunctionId,
    pub mode: ExecutionMode,
    pub kind: WorkKind,
    pub arch: Arch,
    /// Set once the code is installed in executable memory
    pub code_address: usize,
    pub code_size: u32,
    pub allocation_size: u32,
    pub unwind: UnwindInfo,
    pub pdata: Vec<PdataEntry>,
    pub xdata_offset: u32,
    pub xdata: Vec<u8>,
    pub throw_map: Vec<ThrowMapEntry>,
    pub inlinee_frames: Vec<InlineeFrameRecord>,
    pub frames: Vec<InlineFrame>,
    pub bailouts: Vec<BailoutRecord>,
    /// Location of every virtual register
    pub register_map: Vec<Loc>,
    pub layout: FrameLayout,
    pub security: SecurityStats,
}

impl OutputRecord {
    /// Bytecode location of the instruction at `native_offset`
    pub fn throw_location(&self, native_offset: u32) -> Option<(FunctionId, u32)> {
        let i = self
            .throw_map
            .binary_search_by_key(&native_offset, |e| e.native_offset)
            .ok()?;
        let entry = self.throw_map[i];
        let function = self.frames.get(entry.frame as usize).map_or(self.function, |f| f.function);
        Some((function, entry.bytecode_offset))
    }

    pub fn bailout(&self, id: u32) -> Option<&BailoutRecord> {
        self.bailouts.get(id as usize)
    }

    /// Innermost inlined frame covering `native_offset`
    pub fn inlinee_at(&self, native_offset: u32) -> Option<&InlineeFrameRecord> {
        self.inlinee_frames
            .iter()
            .filter(|r| native_offset >= r.start && native_offset < r.end)
            .min_by_key(|r| r.end - r.start)
    }
}

/// Installed code: executable pages plus their description
pub struct CompiledCode {
    handle: CodeHandle,
    pub record: OutputRecord,
    pub constants: Vec<String>,
    /// Instructions decoded from the executable pages
    ops: Vec<(u32, LirOp)>,
    index: HashMap<u32, usize>,
}

impl CompiledCode {
    pub fn new(handle: CodeHandle, mut record: OutputRecord, constants: Vec<String>) -> Result<Self> {
        record.code_address = handle.address();
        record.allocation_size = handle.size() as u32;
        let ops = decode_all(handle.code())?;
        let index = ops.iter().enumerate().map(|(i, (offset, _))| (*offset, i)).collect();
        Ok(Self {
            handle,
            record,
            constants,
            ops,
            index,
        })
    }

    pub fn address(&self) -> usize {
        self.handle.address()
    }

    pub fn handle(&self) -> &CodeHandle {
        &self.handle
    }

    pub fn ops(&self) -> &[(u32, LirOp)] {
        &self.ops
    }

    /// Instruction index at a native offset
    pub fn index_of(&self, native_offset: u32) -> Option<usize> {
        self.index.get(&native_offset).copied()
    }

    pub fn function(&self) -> FunctionId {
        self.record.function
    }

    pub fn mode(&self) -> ExecutionMode {
        self.record.mode
    }

    pub fn disassemble(&self) -> String {
        let mut out = format!(
            "== code {} [{}] @ {:#x} ({} bytes) ==\n",
            self.record.function, self.record.mode, self.record.code_address, self.record.code_size
        );
        for (offset, op) in &self.ops {
            out.push_str(&format!("  +{:04x} {}\n", offset, op));
        }
        out
    }
}

impl std::fmt::Debug for CompiledCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledCode")
            .field("function", &self.record.function)
            .field("mode", &self.record.mode)
            .field("handle", &self.handle)
            .finish()
    }
}

/// A function's published entry point: a code address, or 0 for "run the
/// interpreter"
#[derive(Debug, Default)]
pub struct EntryPointSlot(AtomicUsize);

impl EntryPointSlot {
    pub const INTERPRETER: usize = 0;

    pub fn new() -> Self {
        Self(AtomicUsize::new(Self::INTERPRETER))
    }

    pub fn publish(&self, address: usize) {
        self.0.store(address, Ordering::Release);
    }

    pub fn reset(&self) {
        self.0.store(Self::INTERPRETER, Ordering::Release);
    }

    pub fn load(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    pub fn is_interpreted(&self) -> bool {
        self.load() == Self::INTERPRETER
    }
}

/// Installed code by address
#[derive(Debug, Default)]
pub struct CodeTable {
    by_address: HashMap<usize, Arc<CompiledCode>>,
}

impl CodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, code: Arc<CompiledCode>) -> usize {
        let address = code.address();
        self.by_address.insert(address, code);
        address
    }

    pub fn get(&self, address: usize) -> Option<Arc<CompiledCode>> {
        self.by_address.get(&address).cloned()
    }

    pub fn remove(&mut self, address: usize) -> Option<Arc<CompiledCode>> {
        self.by_address.remove(&address)
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    /// Live executable bytes
    pub fn code_bytes(&self) -> usize {
        self.by_address.values().map(|c| c.handle.size()).sum()
    }
}
