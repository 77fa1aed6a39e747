//! Inlining decision engine
//!
//! Thresholds are measured in non-load bytecode instructions and scale with
//! the size of the top function being compiled: small top functions can
//! afford to pull in more, large ones less. Each call category gets its own
//! threshold because guarding a fixed method is cheap while a polymorphic
//! target is not.

use super::snapshot::FunctionBodyView;
use crate::config::InliningConfig;
use tracing::trace;

/// Per-work-item thresholds, derived once from the top function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InliningThresholds {
    pub inline_threshold: u32,
    pub constructor_threshold: u32,
    pub outside_loop_threshold: u32,
    pub leaf_threshold: u32,
    pub loop_threshold: u32,
    pub polymorphic_threshold: u32,
    pub constant_argument_threshold: u32,
    pub max_inlinees_with_loops: u32,
    pub inline_count_max: u32,
    pub recursive_inline_threshold: u32,
    pub inline_depth_max: u32,
}

impl InliningThresholds {
    /// Thresholds for a top function with `non_load_count` non-load
    /// instructions
    pub fn new(config: &InliningConfig, non_load_count: u32, for_loop_body: bool, aggressive: bool) -> Self {
        let mut t = Self {
            inline_threshold: config.inline_threshold,
            constructor_threshold: config.constructor_threshold,
            outside_loop_threshold: config.outside_loop_threshold,
            leaf_threshold: config.leaf_threshold,
            loop_threshold: config.loop_threshold,
            polymorphic_threshold: config.polymorphic_threshold,
            constant_argument_threshold: config.constant_argument_threshold,
            max_inlinees_with_loops: config.max_inlinees_with_loops,
            inline_count_max: if for_loop_body {
                config.loop_body_inline_count_max
            } else {
                config.inline_count_max
            },
            recursive_inline_threshold: config.recursive_inline_threshold,
            inline_depth_max: config.inline_depth_max,
        };
        if aggressive {
            let a = config.aggressive_threshold;
            t.inline_threshold = a;
            t.constructor_threshold = a;
            t.outside_loop_threshold = a;
            t.leaf_threshold = a;
            t.loop_threshold = a;
            t.polymorphic_threshold = a;
            t.inline_count_max = config.aggressive_inline_count_max;
            return t;
        }
        if non_load_count > 800 {
            t.inline_threshold = t.inline_threshold.saturating_sub(20);
        } else if non_load_count > 200 {
            t.inline_threshold = t.inline_threshold.saturating_sub(6);
        } else if non_load_count < 50 {
            t.inline_threshold += 10;
        }
        t
    }
}

/// Per-call-site inputs to the decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InlineCallSite {
    pub call_site_id: u16,
    pub is_constructor_call: bool,
    pub is_fixed_method_call: bool,
    pub is_polymorphic_call: bool,
    /// The top function has loops but this call is outside all of them
    pub is_call_outside_loop: bool,
    pub is_call_inside_loop: bool,
    /// How many times the inlinee already appears in the inline chain
    pub recursive_depth: u32,
    pub constant_arg_count: u32,
}

/// Decides whether a callee is inlined at a call site
pub struct InliningDecider {
    config: InliningConfig,
    normal: InliningThresholds,
    aggressive: InliningThresholds,
    inlined_bytecode: u32,
    inlinee_count: u32,
}

impl InliningDecider {
    pub fn new(config: &InliningConfig, top: &FunctionBodyView, for_loop_body: bool) -> Self {
        Self {
            config: config.clone(),
            normal: InliningThresholds::new(config, top.non_load_count(), for_loop_body, false),
            aggressive: InliningThresholds::new(config, top.non_load_count(), for_loop_body, true),
            inlined_bytecode: 0,
            inlinee_count: 0,
        }
    }

    pub fn thresholds(&self) -> &InliningThresholds {
        &self.normal
    }

    /// Maximum nesting of inlined frames
    pub fn depth_max(&self) -> u32 {
        self.normal.inline_depth_max
    }

    pub fn inlinee_count(&self) -> u32 {
        self.inlinee_count
    }

    /// Charge an inlinee against the work item's budget
    pub fn record_inlinee(&mut self, inlinee: &FunctionBodyView) {
        self.inlined_bytecode += inlinee.non_load_count();
        self.inlinee_count += 1;
    }

    fn is_aggressive_site(&self, inliner: &FunctionBodyView, site: &InlineCallSite) -> bool {
        inliner
            .call_site(site.call_site_id)
            .is_some_and(|c| c.monomorphic_target().is_some() && c.hits() >= self.config.aggressive_call_site_hits)
    }

    /// Advisory: true when `inlinee` should be inlined into `inliner` at
    /// `site` while compiling `top`
    pub fn should_inline(
        &self,
        inlinee: &FunctionBodyView,
        inliner: &FunctionBodyView,
        top: &FunctionBodyView,
        site: &InlineCallSite,
    ) -> bool {
        let name = inlinee.display_name();
        if !self.config.enabled {
            return false;
        }
        if inlinee.has_try() || inlinee.is_generator() || inlinee.is_asmjs() {
            trace!(inlinee = name, "not inlining: unsupported body");
            return false;
        }
        let t = if self.is_aggressive_site(inliner, site) {
            &self.aggressive
        } else {
            &self.normal
        };

        let recursive = site.recursive_depth > 0
            || inlinee.function_number() == inliner.function_number()
            || inlinee.function_number() == top.function_number();
        if recursive && (!self.config.allow_recursive || site.recursive_depth >= t.recursive_inline_threshold) {
            trace!(inlinee = name, depth = site.recursive_depth, "not inlining: recursion bound");
            return false;
        }

        let size = inlinee.non_load_count();
        if self.inlined_bytecode + size > t.inline_count_max {
            trace!(inlinee = name, "not inlining: budget exhausted");
            return false;
        }
        if inlinee.has_loops() && size > t.max_inlinees_with_loops {
            return false;
        }

        let leaf = inlinee.is_leaf_candidate();
        let threshold = if site.is_constructor_call {
            if leaf {
                t.constructor_threshold.max(t.leaf_threshold)
            } else {
                t.constructor_threshold
            }
        } else if site.is_polymorphic_call {
            t.polymorphic_threshold
        } else if site.is_call_inside_loop {
            if leaf {
                t.loop_threshold.max(t.leaf_threshold)
            } else {
                t.loop_threshold
            }
        } else if site.is_call_outside_loop && !site.is_fixed_method_call && site.constant_arg_count == 0 {
            t.outside_loop_threshold
        } else if site.constant_arg_count > 0 && site.constant_arg_count >= inlinee.param_count() as u32 {
            t.constant_argument_threshold
        } else if leaf {
            t.inline_threshold.max(t.leaf_threshold)
        } else {
            t.inline_threshold
        };

        let inline = size <= threshold;
        trace!(inlinee = name, size, threshold, inline, "inlining decision");
        inline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Assembler, FunctionBody, FunctionFlags};
    use crate::jit::snapshot::BodySource;
    use crate::runtime::{FunctionId, FunctionProfile, PropertyGuardTable, PropertyId};

    /// Body with `n` non-load instructions (n - 1 adds and a return)
    fn body_with(name: &str, n: u32) -> FunctionBody {
        let mut asm = Assembler::new(name, 1);
        asm.load_arg(0, 0).load_int(1, 1);
        for _ in 0..n - 1 {
            asm.add(0, 0, 1);
        }
        asm.ret(0);
        asm.finish().unwrap()
    }

    fn view(id: u32, body: &FunctionBody) -> FunctionBodyView {
        let ids: Vec<PropertyId> = (0..body.names.len() as u32).map(PropertyId).collect();
        FunctionBodyView::capture(
            BodySource {
                function: FunctionId(id),
                local_id: id as u16,
                source_context: 0,
                body,
                property_ids: &ids,
            },
            &FunctionProfile::new(body.inline_cache_count, body.call_site_count, body.loop_count),
            &PropertyGuardTable::new(),
        )
    }

    #[test]
    fn test_thresholds_scale_with_top_size() {
        let config = InliningConfig::default();
        assert_eq!(InliningThresholds::new(&config, 30, false, false).inline_threshold, 45);
        assert_eq!(InliningThresholds::new(&config, 100, false, false).inline_threshold, 35);
        assert_eq!(InliningThresholds::new(&config, 300, false, false).inline_threshold, 29);
        assert_eq!(InliningThresholds::new(&config, 900, false, false).inline_threshold, 15);
        assert_eq!(InliningThresholds::new(&config, 100, true, false).inline_count_max, 500);
        let aggressive = InliningThresholds::new(&config, 900, false, true);
        assert_eq!(aggressive.inline_threshold, 80);
        assert_eq!(aggressive.inline_count_max, 8000);
    }

    #[test]
    fn test_constructor_call_with_leaf_inlinee() {
        let top = view(0, &body_with("caller", 40));
        let ctor = view(1, &body_with("Point", 20));
        assert!(ctor.is_leaf_candidate());
        let decider = InliningDecider::new(&InliningConfig::default(), &top, false);
        let site = InlineCallSite {
            is_constructor_call: true,
            ..InlineCallSite::default()
        };
        assert!(decider.should_inline(&ctor, &top, &top, &site));
    }

    #[test]
    fn test_outside_loop_penalty() {
        let top = view(0, &body_with("top", 100));
        let callee = view(1, &body_with("callee", 30));
        let decider = InliningDecider::new(&InliningConfig::default(), &top, false);
        // Leaf callees qualify under the leaf threshold normally...
        assert!(decider.should_inline(&callee, &top, &top, &InlineCallSite::default()));
        // ...but not for a cold call outside the top function's loops
        let outside = InlineCallSite {
            is_call_outside_loop: true,
            ..InlineCallSite::default()
        };
        assert!(!decider.should_inline(&callee, &top, &top, &outside));
        let fixed = InlineCallSite {
            is_fixed_method_call: true,
            ..outside
        };
        assert!(decider.should_inline(&callee, &top, &top, &fixed));
    }

    #[test]
    fn test_rejects_try_and_generators() {
        let top = view(0, &body_with("top", 10));
        let mut b = body_with("gen", 3);
        b.flags |= FunctionFlags::IS_GENERATOR;
        let decider = InliningDecider::new(&InliningConfig::default(), &top, false);
        assert!(!decider.should_inline(&view(1, &b), &top, &top, &InlineCallSite::default()));
        let mut b = body_with("try", 3);
        b.flags |= FunctionFlags::HAS_TRY;
        assert!(!decider.should_inline(&view(2, &b), &top, &top, &InlineCallSite::default()));
    }

    #[test]
    fn test_recursion_is_bounded() {
        let top = view(0, &body_with("fib", 10));
        let decider = InliningDecider::new(&InliningConfig::default(), &top, false);
        let mut site = InlineCallSite {
            recursive_depth: 1,
            ..InlineCallSite::default()
        };
        assert!(decider.should_inline(&top, &top, &top, &site));
        site.recursive_depth = 2;
        assert!(!decider.should_inline(&top, &top, &top, &site));
    }

    #[test]
    fn test_budget_is_charged() {
        let config = InliningConfig {
            inline_count_max: 50,
            ..InliningConfig::default()
        };
        let top = view(0, &body_with("top", 10));
        let callee = view(1, &body_with("callee", 30));
        let mut decider = InliningDecider::new(&config, &top, false);
        assert!(decider.should_inline(&callee, &top, &top, &InlineCallSite::default()));
        decider.record_inlinee(&callee);
        assert!(!decider.should_inline(&callee, &top, &top, &InlineCallSite::default()));
        assert_eq!(decider.inlinee_count(), 1);
    }

    #[test]
    fn test_disabled() {
        let top = view(0, &body_with("top", 10));
        let decider = InliningDecider::new(&InliningConfig::disabled(), &top, false);
        assert!(!decider.should_inline(&view(1, &body_with("c", 2)), &top, &top, &InlineCallSite::default()));
    }
}
