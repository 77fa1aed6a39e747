//! Profile data gathered while interpreting
//!
//! Inline caches, constructor caches, call-site targets and per-instruction
//! type feedback. The JIT never reads these directly; the engine copies them
//! into snapshot views when a work item is created.

use super::value::{FunctionId, ObservedType, PropertyGuardId, TypeId};
use std::collections::BTreeMap;

/// Maximum entries in a polymorphic inline cache
pub const MAX_POLYMORPHIC_ENTRIES: usize = 4;

/// Inline cache state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Uninitialized,
    Monomorphic,
    Polymorphic,
    Megamorphic,
}

/// One (type -> resolution) observation
#[derive(Debug, Clone, PartialEq)]
pub struct InlineCacheEntry {
    /// Receiver type before the access
    pub type_id: TypeId,
    pub slot: u32,
    /// Receiver type after the access (differs only for adding stores)
    pub result_type: TypeId,
    /// Function observed in the slot while its property guard was intact
    pub fixed_function: Option<FunctionId>,
    pub guard: Option<PropertyGuardId>,
    pub hits: u32,
}

impl InlineCacheEntry {
    pub fn is_transition(&self) -> bool {
        self.type_id != self.result_type
    }
}

/// Property-access inline cache
#[derive(Debug, Clone, Default)]
pub struct InlineCache {
    entries: Vec<InlineCacheEntry>,
    megamorphic: bool,
}

impl InlineCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an access; the last observation for a type wins
    pub fn record(&mut self, entry: InlineCacheEntry) {
        if let Some(existing) = self.entries.iter_mut().find(|e| e.type_id == entry.type_id) {
            existing.hits = existing.hits.saturating_add(1);
            existing.slot = entry.slot;
            existing.result_type = entry.result_type;
            existing.fixed_function = entry.fixed_function;
            existing.guard = entry.guard;
            return;
        }
        if self.entries.len() >= MAX_POLYMORPHIC_ENTRIES {
            self.megamorphic = true;
            return;
        }
        self.entries.push(InlineCacheEntry { hits: 1, ..entry });
    }

    pub fn state(&self) -> CacheState {
        if self.megamorphic {
            CacheState::Megamorphic
        } else {
            match self.entries.len() {
                0 => CacheState::Uninitialized,
                1 => CacheState::Monomorphic,
                _ => CacheState::Polymorphic,
            }
        }
    }

    pub fn entries(&self) -> &[InlineCacheEntry] {
        &self.entries
    }

    pub fn is_megamorphic(&self) -> bool {
        self.megamorphic
    }
}

/// Shape produced by `new F()`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConstructorCache {
    pub result_type: Option<TypeId>,
    pub slot_count: u32,
    pub used: bool,
    pub polymorphic: bool,
    pub hits: u32,
}

impl ConstructorCache {
    pub fn record(&mut self, result_type: TypeId, slot_count: u32) {
        self.hits = self.hits.saturating_add(1);
        if !self.used {
            self.used = true;
            self.result_type = Some(result_type);
            self.slot_count = slot_count;
        } else if self.result_type != Some(result_type) {
            self.polymorphic = true;
            self.result_type = None;
            self.slot_count = self.slot_count.max(slot_count);
        }
    }

    pub fn is_monomorphic(&self) -> bool {
        self.used && !self.polymorphic
    }
}

/// Targets seen at one call site
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallSiteProfile {
    pub callee: Option<FunctionId>,
    pub polymorphic: bool,
    pub hits: u32,
}

impl CallSiteProfile {
    pub fn record(&mut self, callee: Option<FunctionId>) {
        self.hits = self.hits.saturating_add(1);
        match (self.callee, callee) {
            (_, None) => self.polymorphic = true,
            (None, Some(c)) if !self.polymorphic => self.callee = Some(c),
            (Some(prev), Some(c)) if prev != c => {
                self.polymorphic = true;
                self.callee = None;
            }
            _ => {}
        }
    }

    pub fn monomorphic_target(&self) -> Option<FunctionId> {
        if self.polymorphic {
            None
        } else {
            self.callee
        }
    }
}

/// Operand types observed at one instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperandFeedback {
    pub lhs: ObservedType,
    pub rhs: ObservedType,
    pub samples: u32,
}

impl OperandFeedback {
    pub fn new(lhs: ObservedType, rhs: ObservedType) -> Self {
        Self { lhs, rhs, samples: 1 }
    }

    pub fn record(&mut self, lhs: ObservedType, rhs: ObservedType) {
        self.samples = self.samples.saturating_add(1);
        self.lhs = self.lhs.merge(lhs);
        self.rhs = self.rhs.merge(rhs);
    }
}

/// Everything profiled for one function
#[derive(Debug, Clone, Default)]
pub struct FunctionProfile {
    /// Keyed by bytecode offset
    pub feedback: BTreeMap<u32, OperandFeedback>,
    pub inline_caches: Vec<InlineCache>,
    pub call_sites: Vec<CallSiteProfile>,
    /// Cache for `new` of this function
    pub constructor_cache: ConstructorCache,
    pub loop_iterations: Vec<u64>,
}

impl FunctionProfile {
    pub fn new(inline_cache_count: u16, call_site_count: u16, loop_count: u16) -> Self {
        Self {
            feedback: BTreeMap::new(),
            inline_caches: vec![InlineCache::new(); inline_cache_count as usize],
            call_sites: vec![CallSiteProfile::default(); call_site_count as usize],
            constructor_cache: ConstructorCache::default(),
            loop_iterations: vec![0; loop_count as usize],
        }
    }

    pub fn record_operands(&mut self, offset: u32, lhs: ObservedType, rhs: ObservedType) {
        self.feedback
            .entry(offset)
            .and_modify(|f| f.record(lhs, rhs))
            .or_insert_with(|| OperandFeedback::new(lhs, rhs));
    }
}
