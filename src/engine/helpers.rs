//! Object access, calls and the compiled-code helper surface
//!
//! Property loads and stores resolve through the type registry and feed the
//! caller's inline caches; calls feed call-site profiles; `new` feeds the
//! constructor cache of the callee. Compiled code reaches the same paths
//! through [`RuntimeHelpers`].

use super::Engine;
use crate::error::{Error, Result};
use crate::jit::executor::RuntimeHelpers;
use crate::jit::tier::LoopAction;
use crate::jit::work_item::WorkKind;
use crate::runtime::{
    needs_write_barrier, ops, FunctionId, InlineCacheEntry, PropertyGuardId, PropertyId, StoreTarget, TypeId,
    TypeRegistry, Value,
};
use tracing::trace;

impl Engine {
    // ==================== Objects ====================

    pub(crate) fn allocate_object(&mut self, capacity: u32) -> Value {
        Value::new_object(TypeRegistry::ROOT, capacity as usize)
    }

    /// Count a store of `value` into GC-owned memory
    pub(crate) fn barrier(&mut self, value: &Value) {
        if needs_write_barrier(StoreTarget::ObjectSlot) && value.is_heap_reference() {
            self.write_barriers += 1;
        }
    }

    /// Read `prop` of `obj`. A hit also returns the cache entry describing it.
    pub(crate) fn load_field(&mut self, obj: &Value, prop: PropertyId) -> Result<(Value, Option<InlineCacheEntry>)> {
        let Value::Object(o) = obj else {
            return Err(Error::type_error(format!(
                "cannot read property '{}' of {}",
                self.names.resolve(prop),
                obj.type_name()
            )));
        };
        let data = o.borrow();
        let Some(slot) = self.types.slot_of(data.type_id, prop) else {
            return Ok((Value::Undefined, None));
        };
        let value = data.slots.get(slot as usize).cloned().unwrap_or_default();
        let fixed = self.guards.fixed_function(data.type_id, prop);
        let entry = InlineCacheEntry {
            type_id: data.type_id,
            slot,
            result_type: data.type_id,
            fixed_function: fixed.map(|(_, f)| f),
            guard: fixed.map(|(g, _)| g),
            hits: 0,
        };
        Ok((value, Some(entry)))
    }

    /// Write `prop` of `obj`, adding the property if the type lacks it
    pub(crate) fn store_field(&mut self, obj: &Value, prop: PropertyId, value: Value) -> Result<InlineCacheEntry> {
        let Value::Object(o) = obj else {
            return Err(Error::type_error(format!(
                "cannot set property '{}' of {}",
                self.names.resolve(prop),
                obj.type_name()
            )));
        };
        let (from, to, slot) = {
            let mut data = o.borrow_mut();
            let from = data.type_id;
            let (to, slot) = match self.types.slot_of(from, prop) {
                Some(slot) => (from, slot),
                None => {
                    let to = self.types.transition(from, prop);
                    let slot = self
                        .types
                        .slot_of(to, prop)
                        .ok_or_else(|| Error::internal(format!("type {} lost property {}", to, prop.0)))?;
                    (to, slot)
                }
            };
            let i = slot as usize;
            if i >= data.slots.len() {
                data.slots.resize(i + 1, Value::Undefined);
            }
            data.slots[i] = value.clone();
            data.type_id = to;
            (from, to, slot)
        };
        self.guards.on_store(to, prop, &value);
        self.barrier(&value);
        let fixed = self.guards.fixed_function(to, prop);
        Ok(InlineCacheEntry {
            type_id: from,
            slot,
            result_type: to,
            fixed_function: fixed.map(|(_, f)| f),
            guard: fixed.map(|(g, _)| g),
            hits: 0,
        })
    }

    fn record_ic(&mut self, f: FunctionId, ic: u16, entry: InlineCacheEntry) {
        if let Some(cache) = self
            .functions
            .get_mut(f.0 as usize)
            .and_then(|r| r.profile.inline_caches.get_mut(ic as usize))
        {
            cache.record(entry);
        }
    }

    fn record_call_site(&mut self, f: FunctionId, site: u16, callee: Option<FunctionId>) {
        if let Some(profile) = self
            .functions
            .get_mut(f.0 as usize)
            .and_then(|r| r.profile.call_sites.get_mut(site as usize))
        {
            profile.record(callee);
        }
    }

    pub(crate) fn get_field_cached(&mut self, f: FunctionId, ic: u16, prop: PropertyId, obj: &Value) -> Result<Value> {
        let (value, entry) = self.load_field(obj, prop)?;
        if let Some(entry) = entry {
            self.record_ic(f, ic, entry);
        }
        Ok(value)
    }

    pub(crate) fn set_field_cached(
        &mut self,
        f: FunctionId,
        ic: u16,
        prop: PropertyId,
        obj: &Value,
        value: Value,
    ) -> Result<()> {
        let entry = self.store_field(obj, prop, value)?;
        self.record_ic(f, ic, entry);
        Ok(())
    }

    // ==================== Calls ====================

    pub(crate) fn call_value(
        &mut self,
        f: FunctionId,
        site: u16,
        callee: &Value,
        this: Value,
        args: &[Value],
    ) -> Result<Value> {
        let target = callee.as_function();
        self.record_call_site(f, site, target);
        let Some(target) = target else {
            return Err(Error::type_error(format!("{} is not a function", callee.type_name())));
        };
        self.call_function(target, this, args)
    }

    pub(crate) fn call_method_cached(
        &mut self,
        f: FunctionId,
        ic: u16,
        site: u16,
        prop: PropertyId,
        obj: &Value,
        args: &[Value],
    ) -> Result<Value> {
        let callee = self.get_field_cached(f, ic, prop, obj)?;
        if callee.as_function().is_none() {
            self.record_call_site(f, site, None);
            return Err(Error::type_error(format!(
                "property '{}' is not a function",
                self.names.resolve(prop)
            )));
        }
        self.call_value(f, site, &callee, obj.clone(), args)
    }

    /// `new ctor(...args)`
    pub(crate) fn construct_value(&mut self, f: FunctionId, site: u16, ctor: &Value, args: &[Value]) -> Result<Value> {
        let target = ctor.as_function();
        self.record_call_site(f, site, target);
        let Some(target) = target else {
            return Err(Error::type_error(format!("{} is not a constructor", ctor.type_name())));
        };
        let capacity = self.record(target)?.profile.constructor_cache.slot_count;
        let this = self.allocate_object(capacity);
        let returned = self.call_function(target, this.clone(), args)?;
        let result = ops::construct_result(returned, this);
        if let Value::Object(o) = &result {
            let type_id = o.borrow().type_id;
            let slots = self.types.get(type_id).map(|t| t.slot_count()).unwrap_or(0);
            self.record_mut(target)?.profile.constructor_cache.record(type_id, slots);
        }
        Ok(result)
    }
}

// ==================== Compiled code helpers ====================

impl RuntimeHelpers for Engine {
    fn get_field(&mut self, function: FunctionId, ic: u16, prop: PropertyId, obj: &Value) -> Result<Value> {
        self.get_field_cached(function, ic, prop, obj)
    }

    fn set_field(&mut self, function: FunctionId, ic: u16, prop: PropertyId, obj: &Value, value: Value) -> Result<()> {
        self.set_field_cached(function, ic, prop, obj, value)
    }

    fn call(&mut self, function: FunctionId, site: u16, callee: &Value, args: &[Value]) -> Result<Value> {
        self.call_value(function, site, callee, Value::Undefined, args)
    }

    fn call_method(
        &mut self,
        function: FunctionId,
        ic: u16,
        site: u16,
        prop: PropertyId,
        obj: &Value,
        args: &[Value],
    ) -> Result<Value> {
        self.call_method_cached(function, ic, site, prop, obj, args)
    }

    fn construct(&mut self, function: FunctionId, site: u16, ctor: &Value, args: &[Value]) -> Result<Value> {
        self.construct_value(function, site, ctor, args)
    }

    fn call_direct(&mut self, target: FunctionId, this: Value, args: &[Value]) -> Result<Value> {
        self.call_function(target, this, args)
    }

    fn new_object(&mut self) -> Value {
        self.allocate_object(0)
    }

    fn create_this(&mut self, ctor: FunctionId, capacity: u32) -> Value {
        trace!(ctor = %ctor, capacity, "inlined constructor this");
        self.allocate_object(capacity)
    }

    fn on_slot_store(&mut self, type_id: TypeId, prop: PropertyId, value: &Value) {
        self.guards.on_store(type_id, prop, value);
    }

    fn write_barrier(&mut self, _value: &Value) {
        self.write_barriers += 1;
    }

    fn property_guard_valid(&self, guard: PropertyGuardId) -> bool {
        self.guards.is_valid(guard)
    }

    fn loop_tick(&mut self, function: FunctionId, loop_id: u8) {
        if let Some(count) = self
            .functions
            .get_mut(function.0 as usize)
            .and_then(|r| r.profile.loop_iterations.get_mut(loop_id as usize))
        {
            *count += 1;
        }
        if let LoopAction::CompileFunction(mode) = self.tiers.on_loop_iteration(function, loop_id, false) {
            self.request_compile(function, WorkKind::Function, mode);
        }
    }
}
