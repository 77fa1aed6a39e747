//! Function body view

use super::caches::{CallSiteView, ConstructorCacheView, FeedbackView, InlineCacheView};
use crate::bytecode::{Constant, FunctionBody, FunctionFlags};
use crate::runtime::{FunctionId, FunctionProfile, PropertyGuardTable, PropertyId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where a function body came from
#[derive(Debug, Clone, Copy)]
pub struct BodySource<'a> {
    pub function: FunctionId,
    pub local_id: u16,
    pub source_context: u32,
    pub body: &'a FunctionBody,
    /// Interned ids for `body.names`
    pub property_ids: &'a [PropertyId],
}

/// Immutable snapshot of a function body and its profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionBodyView {
    function_number: FunctionId,
    local_id: u16,
    source_context: u32,
    display_name: String,
    nested_count: u32,
    scope_slot_count: u32,
    env_depth: u16,
    bytecode_length: u32,
    non_load_count: u32,
    profiled_call_site_count: u32,
    call_site_count: u16,
    inline_cache_count: u16,
    loop_count: u16,
    register_count: u16,
    param_count: u8,
    flags: FunctionFlags,
    has_method_call_telemetry: bool,
    code: Vec<u8>,
    constants: Vec<Constant>,
    property_ids: Vec<PropertyId>,
    inline_caches: Vec<InlineCacheView>,
    call_sites: Vec<CallSiteView>,
    feedback: BTreeMap<u32, FeedbackView>,
    constructor_cache: ConstructorCacheView,
}

impl FunctionBodyView {
    /// Copy a live function body and its profile
    pub fn capture(src: BodySource<'_>, profile: &FunctionProfile, guards: &PropertyGuardTable) -> Self {
        let body = src.body;
        assert_eq!(
            src.property_ids.len(),
            body.names.len(),
            "property ids must cover every name of {}",
            body.name
        );
        let inline_caches: Vec<InlineCacheView> = profile
            .inline_caches
            .iter()
            .map(|ic| InlineCacheView::capture(ic, guards))
            .collect();
        let call_sites: Vec<CallSiteView> = profile.call_sites.iter().map(CallSiteView::capture).collect();
        let profiled_call_site_count = call_sites.iter().filter(|c| c.hits() > 0).count() as u32;
        let has_method_call_telemetry = method_call_caches(body)
            .iter()
            .any(|ic| inline_caches.get(*ic as usize).is_some_and(|v| !v.is_empty()));

        Self {
            function_number: src.function,
            local_id: src.local_id,
            source_context: src.source_context,
            display_name: body.name.clone(),
            nested_count: body.nested_functions.len() as u32,
            scope_slot_count: body.scope_slot_count,
            env_depth: body.env_depth,
            bytecode_length: body.code.len() as u32,
            non_load_count: body.non_load_count(),
            profiled_call_site_count,
            call_site_count: body.call_site_count,
            inline_cache_count: body.inline_cache_count,
            loop_count: body.loop_count,
            register_count: body.register_count,
            param_count: body.param_count,
            flags: body.flags,
            has_method_call_telemetry,
            code: body.code.clone(),
            constants: body.constants.clone(),
            property_ids: src.property_ids.to_vec(),
            inline_caches,
            call_sites,
            feedback: profile.feedback.iter().map(|(o, f)| (*o, f.into())).collect(),
            constructor_cache: ConstructorCacheView::capture(src.function, &profile.constructor_cache),
        }
    }

    // ==================== Identity ====================

    pub fn function_number(&self) -> FunctionId {
        self.function_number
    }

    pub fn local_id(&self) -> u16 {
        self.local_id
    }

    pub fn source_context(&self) -> u32 {
        self.source_context
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Global id of a sibling function referenced by local id
    pub fn resolve_local_function(&self, local: u16) -> FunctionId {
        FunctionId(self.function_number.0 - self.local_id as u32 + local as u32)
    }

    // ==================== Sizes ====================

    pub fn nested_function_count(&self) -> u32 {
        self.nested_count
    }

    pub fn scope_slot_count(&self) -> u32 {
        self.scope_slot_count
    }

    pub fn env_depth(&self) -> u16 {
        self.env_depth
    }

    pub fn bytecode_length(&self) -> u32 {
        self.bytecode_length
    }

    pub fn non_load_count(&self) -> u32 {
        self.non_load_count
    }

    pub fn profiled_call_site_count(&self) -> u32 {
        self.profiled_call_site_count
    }

    pub fn call_site_count(&self) -> u16 {
        self.call_site_count
    }

    pub fn inline_cache_count(&self) -> u16 {
        self.inline_cache_count
    }

    pub fn loop_count(&self) -> u16 {
        self.loop_count
    }

    pub fn register_count(&self) -> u16 {
        self.register_count
    }

    pub fn param_count(&self) -> u8 {
        self.param_count
    }

    // ==================== Flags ====================

    pub fn flags(&self) -> FunctionFlags {
        self.flags
    }

    pub fn has_try(&self) -> bool {
        self.flags.contains(FunctionFlags::HAS_TRY)
    }

    pub fn is_generator(&self) -> bool {
        self.flags.contains(FunctionFlags::IS_GENERATOR)
    }

    pub fn is_asmjs(&self) -> bool {
        self.flags.contains(FunctionFlags::IS_ASMJS)
    }

    pub fn has_loops(&self) -> bool {
        self.flags.contains(FunctionFlags::HAS_LOOPS)
    }

    pub fn do_stack_nested_func(&self) -> bool {
        self.flags.contains(FunctionFlags::STACK_NESTED_FUNC)
    }

    /// Closures created here may be allocated on the stack
    pub fn do_stack_closure(&self) -> bool {
        self.do_stack_nested_func() && self.nested_count > 0 && !self.has_try() && !self.is_generator()
    }

    pub fn do_stack_scope_slots(&self) -> bool {
        self.do_stack_closure() && self.scope_slot_count > 0
    }

    pub fn do_stack_frame_display(&self) -> bool {
        self.do_stack_closure() && self.env_depth > 0
    }

    /// No profiled calls of its own and no method-call cache telemetry
    pub fn is_leaf_candidate(&self) -> bool {
        self.profiled_call_site_count == 0 && !self.has_method_call_telemetry
    }

    // ==================== Code and profile data ====================

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn constants(&self) -> &[Constant] {
        &self.constants
    }

    pub fn constant(&self, index: u16) -> Option<&Constant> {
        self.constants.get(index as usize)
    }

    pub fn property_id(&self, name_index: u16) -> Option<PropertyId> {
        self.property_ids.get(name_index as usize).copied()
    }

    pub fn inline_cache(&self, ic: u16) -> Option<&InlineCacheView> {
        self.inline_caches.get(ic as usize)
    }

    pub fn call_site(&self, site: u16) -> Option<&CallSiteView> {
        self.call_sites.get(site as usize)
    }

    pub fn feedback(&self, offset: u32) -> Option<&FeedbackView> {
        self.feedback.get(&offset)
    }

    pub fn constructor_cache(&self) -> &ConstructorCacheView {
        &self.constructor_cache
    }
}

fn method_call_caches(body: &FunctionBody) -> Vec<u16> {
    body.instructions()
        .map(|instrs| {
            instrs
                .into_iter()
                .filter_map(|(_, i)| match i {
                    crate::bytecode::Instruction::CallMethod { ic, .. } => Some(ic),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Assembler;

    fn view_of(body: &FunctionBody, profile: &FunctionProfile) -> FunctionBodyView {
        let ids: Vec<PropertyId> = (0..body.names.len() as u32).map(PropertyId).collect();
        FunctionBodyView::capture(
            BodySource {
                function: FunctionId(7),
                local_id: 2,
                source_context: 1,
                body,
                property_ids: &ids,
            },
            profile,
            &PropertyGuardTable::new(),
        )
    }

    #[test]
    fn test_capture_copies_fields() {
        let mut asm = Assembler::new("f", 1);
        asm.load_arg(0, 0).load_int(1, 2).mul(0, 0, 1).ret(0);
        asm.scope_slots(3).env_depth(1).nested(4);
        let body = asm.finish().unwrap();
        let profile = FunctionProfile::new(0, 0, 0);
        let view = view_of(&body, &profile);

        assert_eq!(view.function_number(), FunctionId(7));
        assert_eq!(view.display_name(), "f");
        assert_eq!(view.non_load_count(), 2);
        assert_eq!(view.bytecode_length() as usize, body.code.len());
        assert_eq!(view.nested_function_count(), 1);
        assert_eq!(view.resolve_local_function(4), FunctionId(9));
        assert!(view.is_leaf_candidate());
    }

    #[test]
    fn test_stack_closure_derivations() {
        let mut asm = Assembler::new("outer", 0);
        asm.load_undefined(0).ret(0);
        asm.flag(FunctionFlags::STACK_NESTED_FUNC).nested(1).scope_slots(2);
        let body = asm.finish().unwrap();
        let view = view_of(&body, &FunctionProfile::new(0, 0, 0));
        assert!(view.do_stack_closure());
        assert!(view.do_stack_scope_slots());
        assert!(!view.do_stack_frame_display());

        let mut with_try = body.clone();
        with_try.flags |= FunctionFlags::HAS_TRY;
        let view = view_of(&with_try, &FunctionProfile::new(0, 0, 0));
        assert!(!view.do_stack_closure());
        assert!(!view.do_stack_scope_slots());
    }

    #[test]
    fn test_profiled_calls_disqualify_leaf() {
        let mut asm = Assembler::new("caller", 1);
        asm.load_arg(0, 0).call(1, 0, 2, 0).ret(1);
        let body = asm.finish().unwrap();
        let mut profile = FunctionProfile::new(body.inline_cache_count, body.call_site_count, 0);
        assert!(view_of(&body, &profile).is_leaf_candidate());
        profile.call_sites[0].record(Some(FunctionId(1)));
        let view = view_of(&body, &profile);
        assert!(!view.is_leaf_candidate());
        assert_eq!(view.call_site(0).unwrap().monomorphic_target(), Some(FunctionId(1)));
    }
}
