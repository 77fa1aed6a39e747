//! Fixed-field property guards
//!
//! A guard covers one (type, property) pair whose slot has only ever held a
//! single function. Compiled code that calls or inlines that function checks
//! the guard; a store of any other value invalidates it for good.

use super::value::{FunctionId, PropertyGuardId, PropertyId, TypeId, Value};
use rustc_hash::FxHashMap as HashMap;
use tracing::debug;

#[derive(Debug, Clone)]
struct PropertyGuard {
    fixed: Option<FunctionId>,
    valid: bool,
}

#[derive(Debug, Default)]
pub struct PropertyGuardTable {
    guards: Vec<PropertyGuard>,
    by_property: HashMap<(TypeId, PropertyId), PropertyGuardId>,
    invalidations: u64,
}

impl PropertyGuardTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note a store of `value` into `prop` of an object of type `type_id`
    /// (the type after any transition). Returns the guard if it was
    /// invalidated by this store.
    pub fn on_store(&mut self, type_id: TypeId, prop: PropertyId, value: &Value) -> Option<PropertyGuardId> {
        match self.by_property.get(&(type_id, prop)) {
            None => {
                let id = PropertyGuardId(self.guards.len() as u32);
                let fixed = value.as_function();
                self.guards.push(PropertyGuard {
                    fixed,
                    valid: fixed.is_some(),
                });
                self.by_property.insert((type_id, prop), id);
                None
            }
            Some(&id) => {
                let guard = &mut self.guards[id.0 as usize];
                if guard.valid && value.as_function() != guard.fixed {
                    guard.valid = false;
                    self.invalidations += 1;
                    debug!(guard = id.0, ty = type_id.0, prop = prop.0, "property guard invalidated");
                    return Some(id);
                }
                None
            }
        }
    }

    /// Guard and fixed function for a property, if the guard still holds
    pub fn fixed_function(&self, type_id: TypeId, prop: PropertyId) -> Option<(PropertyGuardId, FunctionId)> {
        let id = *self.by_property.get(&(type_id, prop))?;
        let guard = &self.guards[id.0 as usize];
        match (guard.valid, guard.fixed) {
            (true, Some(f)) => Some((id, f)),
            _ => None,
        }
    }

    pub fn is_valid(&self, id: PropertyGuardId) -> bool {
        self.guards.get(id.0 as usize).is_some_and(|g| g.valid)
    }

    pub fn invalidations(&self) -> u64 {
        self.invalidations
    }
}
