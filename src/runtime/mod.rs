//! Runtime data model
//!
//! Values, object shapes, profiling caches and property guards: the live
//! state the interpreter mutates and the engine snapshots for the JIT.

pub mod guards;
pub mod ops;
pub mod profile;
pub mod types;
pub mod value;

pub use guards::PropertyGuardTable;
pub use profile::{
    CacheState, CallSiteProfile, ConstructorCache, FunctionProfile, InlineCache, InlineCacheEntry,
    OperandFeedback, MAX_POLYMORPHIC_ENTRIES,
};
pub use types::{PropertyNames, RuntimeType, TypeRegistry};
pub use value::{
    needs_write_barrier, FieldOwnership, FunctionId, ObjectData, ObservedType, PropertyGuardId,
    PropertyId, StoreTarget, TypeId, Value, GC_FIELDS,
};
