//! JIT-time snapshot views
//!
//! Immutable, value-copied projections of live runtime state taken when a
//! work item is created. They are the only thing the compiler reads, so a
//! background or out-of-process compile never races with the interpreter.
//! Every view is a plain serializable record shared by both paths.

pub mod caches;
pub mod function_body;
pub mod types;

pub use caches::{CacheEntryView, CallSiteView, ConstructorCacheView, FeedbackView, FixedFieldInfo, InlineCacheView};
pub use function_body::{BodySource, FunctionBodyView};
pub use types::{EquivalentTypeSet, TypeHandlerView, TypeView};

use crate::runtime::{FunctionId, TypeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Everything one work item needs: the top function, every body it may
/// inline and every type its caches mention
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JitSnapshot {
    top: FunctionBodyView,
    inlinees: BTreeMap<FunctionId, FunctionBodyView>,
    types: BTreeMap<TypeId, TypeView>,
}

impl JitSnapshot {
    pub fn new(top: FunctionBodyView) -> Self {
        Self {
            top,
            inlinees: BTreeMap::new(),
            types: BTreeMap::new(),
        }
    }

    pub fn add_inlinee(&mut self, body: FunctionBodyView) {
        if body.function_number() != self.top.function_number() {
            self.inlinees.insert(body.function_number(), body);
        }
    }

    pub fn add_type(&mut self, ty: TypeView) {
        self.types.insert(ty.id(), ty);
    }

    pub fn top(&self) -> &FunctionBodyView {
        &self.top
    }

    pub fn body(&self, id: FunctionId) -> Option<&FunctionBodyView> {
        if id == self.top.function_number() {
            Some(&self.top)
        } else {
            self.inlinees.get(&id)
        }
    }

    pub fn has_body(&self, id: FunctionId) -> bool {
        self.body(id).is_some()
    }

    pub fn type_view(&self, id: TypeId) -> Option<&TypeView> {
        self.types.get(&id)
    }

    pub fn inlinee_count(&self) -> usize {
        self.inlinees.len()
    }

    pub fn type_count(&self) -> usize {
        self.types.len()
    }
}
