//! Cache snapshots: inline caches, constructor caches, call sites, type
//! feedback and the fixed fields derived from them

use super::types::EquivalentTypeSet;
use crate::runtime::{
    CallSiteProfile, ConstructorCache, FunctionId, InlineCache, ObservedType, OperandFeedback,
    PropertyGuardId, PropertyGuardTable, PropertyId, TypeId,
};
use serde::{Deserialize, Serialize};

/// One frozen inline-cache entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntryView {
    pub type_id: TypeId,
    pub slot: u32,
    pub result_type: TypeId,
    pub fixed_function: Option<FunctionId>,
    pub guard: Option<PropertyGuardId>,
    pub hits: u32,
}

/// Frozen polymorphic inline cache
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InlineCacheView {
    entries: Vec<CacheEntryView>,
    megamorphic: bool,
}

impl InlineCacheView {
    /// Copy a live cache. Fixed-function observations are kept only while
    /// their property guard still holds.
    pub fn capture(cache: &InlineCache, guards: &PropertyGuardTable) -> Self {
        let entries = cache
            .entries()
            .iter()
            .map(|e| {
                let intact = e.guard.is_some_and(|g| guards.is_valid(g));
                CacheEntryView {
                    type_id: e.type_id,
                    slot: e.slot,
                    result_type: e.result_type,
                    fixed_function: if intact { e.fixed_function } else { None },
                    guard: if intact { e.guard } else { None },
                    hits: e.hits,
                }
            })
            .collect();
        Self {
            entries,
            megamorphic: cache.is_megamorphic(),
        }
    }

    pub fn entries(&self) -> &[CacheEntryView] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_monomorphic(&self) -> bool {
        !self.megamorphic && self.entries.len() == 1
    }

    pub fn is_polymorphic(&self) -> bool {
        !self.megamorphic && self.entries.len() > 1
    }

    pub fn is_megamorphic(&self) -> bool {
        self.megamorphic
    }

    /// Usable for a guarded fast path: observed, bounded, no transitions
    pub fn is_specializable(&self) -> bool {
        !self.megamorphic && !self.entries.is_empty() && !self.entries.iter().any(|e| e.type_id != e.result_type)
    }

    /// Normalized set of receiver types
    pub fn equivalent_types(&self) -> EquivalentTypeSet {
        EquivalentTypeSet::normalized(self.entries.iter().map(|e| e.type_id).collect())
    }

    /// Slot shared by every entry
    pub fn common_slot(&self) -> Option<u32> {
        let first = self.entries.first()?.slot;
        self.entries.iter().all(|e| e.slot == first).then_some(first)
    }

    /// Fixed field when every entry resolved to the same function with an
    /// intact guard
    pub fn fixed_field(&self, property: PropertyId) -> Option<FixedFieldInfo> {
        if !self.is_specializable() {
            return None;
        }
        let function = self.entries.first()?.fixed_function?;
        let mut guards = Vec::with_capacity(self.entries.len());
        for e in &self.entries {
            if e.fixed_function != Some(function) {
                return None;
            }
            guards.push(e.guard?);
        }
        guards.sort_unstable();
        guards.dedup();
        Some(FixedFieldInfo {
            property,
            function,
            guard_types: self.equivalent_types(),
            guards,
        })
    }

    /// Total hits across entries
    pub fn hits(&self) -> u64 {
        self.entries.iter().map(|e| e.hits as u64).sum()
    }
}

/// A property that resolved to one function across all cache entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedFieldInfo {
    pub property: PropertyId,
    pub function: FunctionId,
    /// Receiver types the assumption was observed under
    pub guard_types: EquivalentTypeSet,
    /// Property guards that must still hold at run time
    pub guards: Vec<PropertyGuardId>,
}

/// Frozen constructor cache of one function
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstructorCacheView {
    constructor: FunctionId,
    result_type: Option<TypeId>,
    slot_count: u32,
    used: bool,
    polymorphic: bool,
}

impl ConstructorCacheView {
    pub fn capture(constructor: FunctionId, cache: &ConstructorCache) -> Self {
        Self {
            constructor,
            result_type: cache.result_type,
            slot_count: cache.slot_count,
            used: cache.used,
            polymorphic: cache.polymorphic,
        }
    }

    pub fn constructor(&self) -> FunctionId {
        self.constructor
    }

    pub fn result_type(&self) -> Option<TypeId> {
        self.result_type
    }

    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    pub fn is_used(&self) -> bool {
        self.used
    }

    /// Every `new` so far produced the same type
    pub fn is_monomorphic(&self) -> bool {
        self.used && !self.polymorphic
    }
}

/// Frozen call-site profile
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CallSiteView {
    callee: Option<FunctionId>,
    polymorphic: bool,
    hits: u32,
}

impl CallSiteView {
    pub fn capture(site: &CallSiteProfile) -> Self {
        Self {
            callee: site.callee,
            polymorphic: site.polymorphic,
            hits: site.hits,
        }
    }

    pub fn monomorphic_target(&self) -> Option<FunctionId> {
        if self.polymorphic {
            None
        } else {
            self.callee
        }
    }

    pub fn is_polymorphic(&self) -> bool {
        self.polymorphic
    }

    pub fn hits(&self) -> u32 {
        self.hits
    }
}

/// Frozen operand feedback for one instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackView {
    pub lhs: ObservedType,
    pub rhs: ObservedType,
    pub samples: u32,
}

impl From<&OperandFeedback> for FeedbackView {
    fn from(f: &OperandFeedback) -> Self {
        Self {
            lhs: f.lhs,
            rhs: f.rhs,
            samples: f.samples,
        }
    }
}

impl FeedbackView {
    pub fn both(&self, t: ObservedType) -> bool {
        self.lhs == t && self.rhs == t
    }

    pub fn both_numeric(&self) -> bool {
        self.lhs.is_numeric() && self.rhs.is_numeric()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{InlineCacheEntry, Value};

    fn cache_with(entries: &[(u32, u32, Option<(u32, u32)>)]) -> InlineCache {
        let mut ic = InlineCache::new();
        for (t, slot, fixed) in entries {
            ic.record(InlineCacheEntry {
                type_id: TypeId(*t),
                slot: *slot,
                result_type: TypeId(*t),
                fixed_function: fixed.map(|(f, _)| FunctionId(f)),
                guard: fixed.map(|(_, g)| PropertyGuardId(g)),
                hits: 0,
            });
        }
        ic
    }

    fn guards_with_fixed(count: u32) -> PropertyGuardTable {
        let mut guards = PropertyGuardTable::new();
        for i in 0..count {
            guards.on_store(TypeId(100 + i), PropertyId(0), &Value::Function(FunctionId(1)));
        }
        guards
    }

    #[test]
    fn test_polymorphic_common_slot() {
        let guards = PropertyGuardTable::new();
        let view = InlineCacheView::capture(&cache_with(&[(1, 2, None), (3, 2, None)]), &guards);
        assert!(view.is_polymorphic());
        assert_eq!(view.common_slot(), Some(2));
        assert_eq!(view.equivalent_types().types(), &[TypeId(1), TypeId(3)]);
    }

    #[test]
    fn test_fixed_field_requires_agreement() {
        let guards = guards_with_fixed(2);
        let view = InlineCacheView::capture(&cache_with(&[(1, 0, Some((1, 0))), (2, 0, Some((1, 1)))]), &guards);
        let fixed = view.fixed_field(PropertyId(9)).unwrap();
        assert_eq!(fixed.function, FunctionId(1));
        assert_eq!(fixed.guards, vec![PropertyGuardId(0), PropertyGuardId(1)]);
        assert!(fixed.guard_types.contains(TypeId(2)));

        let view = InlineCacheView::capture(&cache_with(&[(1, 0, Some((1, 0))), (2, 0, None)]), &guards);
        assert!(view.fixed_field(PropertyId(9)).is_none());
    }

    #[test]
    fn test_invalid_guard_drops_fixed_function() {
        let mut guards = guards_with_fixed(1);
        guards.on_store(TypeId(100), PropertyId(0), &Value::Int(1));
        let view = InlineCacheView::capture(&cache_with(&[(1, 0, Some((1, 0)))]), &guards);
        assert_eq!(view.entries()[0].fixed_function, None);
        assert!(view.fixed_field(PropertyId(0)).is_none());
    }
}
