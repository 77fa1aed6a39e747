//! Execution-mode tier controller
//!
//! Tracks, per function, which tier is installed and promotes along
//! Interpreter -> SimpleJIT -> FullJIT as call and loop counters cross their
//! thresholds. Installed tiers never go down. A bailout only sends the
//! current call back to the interpreter; repeated bailouts at one site buy a
//! same-tier recompile with a fresh snapshot, a bounded number of times and
//! with a higher bar each time.

use crate::config::TierConfig;
use crate::runtime::FunctionId;
use rustc_hash::FxHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

/// Execution tier of a function
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ExecutionMode {
    Interpreter,
    SimpleJit,
    FullJit,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Interpreter => write!(f, "Interpreter"),
            ExecutionMode::SimpleJit => write!(f, "SimpleJIT"),
            ExecutionMode::FullJit => write!(f, "FullJIT"),
        }
    }
}

impl ExecutionMode {
    pub fn is_jit(self) -> bool {
        self != ExecutionMode::Interpreter
    }
}

/// A recorded tier promotion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierTransition {
    pub function: FunctionId,
    pub from: ExecutionMode,
    pub to: ExecutionMode,
    /// Call count when the new code was installed
    pub at_call: u64,
}

/// What a loop iteration asks of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    None,
    /// Compile the whole function at this mode
    CompileFunction(ExecutionMode),
    /// Compile this loop's body alone
    CompileLoopBody,
}

/// What a bailout out of compiled loop-body code asks of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopBailoutAction {
    /// Keep entering the installed body
    Keep,
    /// Drop the body and compile it again from a fresh snapshot
    Recompile,
    /// Drop the body for good; the loop stays interpreted
    Drop,
}

#[derive(Debug, Default, Clone)]
struct LoopState {
    iterations: u64,
    pending: bool,
    installed: bool,
    failed: bool,
    bailouts: u32,
    rejits: u32,
}

#[derive(Debug, Clone)]
struct FunctionTier {
    mode: ExecutionMode,
    calls: u64,
    loop_iterations: u64,
    pending: Option<ExecutionMode>,
    failed: Vec<ExecutionMode>,
    /// Code was dropped by invalidation; reinstall at `mode`
    reinstall: bool,
    bailouts_by_site: HashMap<u32, u32>,
    total_bailouts: u64,
    rejit_attempts: u32,
    loops: HashMap<u8, LoopState>,
}

impl Default for FunctionTier {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Interpreter,
            calls: 0,
            loop_iterations: 0,
            pending: None,
            failed: Vec::new(),
            reinstall: false,
            bailouts_by_site: HashMap::default(),
            total_bailouts: 0,
            rejit_attempts: 0,
            loops: HashMap::default(),
        }
    }
}

pub struct TierController {
    config: TierConfig,
    enabled: bool,
    functions: HashMap<FunctionId, FunctionTier>,
    transitions: Vec<TierTransition>,
}

impl TierController {
    pub fn new(config: TierConfig, enabled: bool) -> Self {
        Self {
            config,
            enabled,
            functions: HashMap::default(),
            transitions: Vec::new(),
        }
    }

    fn state(&mut self, f: FunctionId) -> &mut FunctionTier {
        self.functions.entry(f).or_default()
    }

    /// Installed tier of a function
    pub fn mode(&self, f: FunctionId) -> ExecutionMode {
        self.functions.get(&f).map_or(ExecutionMode::Interpreter, |s| s.mode)
    }

    pub fn pending(&self, f: FunctionId) -> Option<ExecutionMode> {
        self.functions.get(&f).and_then(|s| s.pending)
    }

    pub fn calls(&self, f: FunctionId) -> u64 {
        self.functions.get(&f).map_or(0, |s| s.calls)
    }

    pub fn bailouts(&self, f: FunctionId) -> u64 {
        self.functions.get(&f).map_or(0, |s| s.total_bailouts)
    }

    pub fn rejit_attempts(&self, f: FunctionId) -> u32 {
        self.functions.get(&f).map_or(0, |s| s.rejit_attempts)
    }

    /// Every promotion so far, in order
    pub fn transitions(&self) -> &[TierTransition] {
        &self.transitions
    }

    pub fn transitions_for(&self, f: FunctionId) -> Vec<(ExecutionMode, ExecutionMode)> {
        self.transitions
            .iter()
            .filter(|t| t.function == f)
            .map(|t| (t.from, t.to))
            .collect()
    }

    fn next_mode(config: &TierConfig, s: &FunctionTier) -> Option<ExecutionMode> {
        if s.reinstall && s.mode.is_jit() {
            return Some(s.mode);
        }
        let wants_full = config.full_jit_enabled
            && !s.failed.contains(&ExecutionMode::FullJit)
            && (s.calls >= config.full_jit_call_threshold || s.loop_iterations >= config.full_jit_loop_threshold);
        match s.mode {
            ExecutionMode::Interpreter => {
                let simple_usable = config.simple_jit_enabled && !s.failed.contains(&ExecutionMode::SimpleJit);
                let wants_simple = simple_usable
                    && (s.calls >= config.simple_jit_call_threshold
                        || s.loop_iterations >= config.simple_jit_loop_threshold);
                if wants_simple {
                    Some(ExecutionMode::SimpleJit)
                } else if !simple_usable && wants_full {
                    Some(ExecutionMode::FullJit)
                } else {
                    None
                }
            }
            ExecutionMode::SimpleJit => wants_full.then_some(ExecutionMode::FullJit),
            ExecutionMode::FullJit => None,
        }
    }

    fn request(&mut self, f: FunctionId) -> Option<ExecutionMode> {
        if !self.enabled {
            return None;
        }
        let config = self.config.clone();
        let s = self.state(f);
        if s.pending.is_some() {
            return None;
        }
        let mode = Self::next_mode(&config, s)?;
        s.pending = Some(mode);
        debug!(function = f.0, %mode, calls = s.calls, "tier-up requested");
        Some(mode)
    }

    /// Count a call; returns the tier to compile for, if one is due
    pub fn on_call(&mut self, f: FunctionId) -> Option<ExecutionMode> {
        self.state(f).calls += 1;
        self.request(f)
    }

    /// Count a loop iteration. `interpreted` is true when the iteration ran
    /// in the interpreter, which is what makes loop bodies eligible.
    pub fn on_loop_iteration(&mut self, f: FunctionId, loop_id: u8, interpreted: bool) -> LoopAction {
        let threshold = self.config.loop_body_threshold;
        let enabled = self.enabled;
        let s = self.state(f);
        s.loop_iterations += 1;
        if enabled && interpreted && s.mode == ExecutionMode::Interpreter {
            let l = s.loops.entry(loop_id).or_default();
            l.iterations += 1;
            if l.iterations >= threshold && !l.pending && !l.installed && !l.failed {
                l.pending = true;
                return LoopAction::CompileLoopBody;
            }
        }
        match self.request(f) {
            Some(mode) => LoopAction::CompileFunction(mode),
            None => LoopAction::None,
        }
    }

    /// New code for `f` was published
    pub fn on_installed(&mut self, f: FunctionId, mode: ExecutionMode) {
        let s = self.state(f);
        s.pending = None;
        s.reinstall = false;
        s.bailouts_by_site.clear();
        let from = s.mode;
        let at_call = s.calls;
        if mode > from {
            s.mode = mode;
            info!(function = f.0, %from, to = %mode, at_call, "tier transition");
            self.transitions.push(TierTransition {
                function: f,
                from,
                to: mode,
                at_call,
            });
        }
    }

    /// Compilation for `mode` failed; stay put and stop asking for it
    pub fn on_compile_failed(&mut self, f: FunctionId, mode: ExecutionMode) {
        let s = self.state(f);
        s.pending = None;
        if mode > s.mode && !s.failed.contains(&mode) {
            s.failed.push(mode);
        }
        debug!(function = f.0, %mode, "compile failed; tier unchanged");
    }

    /// A finished compile was thrown away (stale epoch)
    pub fn on_discarded(&mut self, f: FunctionId) {
        self.state(f).pending = None;
    }

    /// Installed code was dropped; the next call asks for it again
    pub fn on_invalidated(&mut self, f: FunctionId) {
        let s = self.state(f);
        s.pending = None;
        s.reinstall = s.mode.is_jit();
        for l in s.loops.values_mut() {
            l.pending = false;
            l.installed = false;
        }
    }

    pub fn on_loop_body_installed(&mut self, f: FunctionId, loop_id: u8) {
        let l = self.state(f).loops.entry(loop_id).or_default();
        l.pending = false;
        l.installed = true;
    }

    pub fn on_loop_body_failed(&mut self, f: FunctionId, loop_id: u8) {
        let l = self.state(f).loops.entry(loop_id).or_default();
        l.pending = false;
        l.failed = true;
    }

    pub fn loop_rejit_attempts(&self, f: FunctionId, loop_id: u8) -> u32 {
        self.functions
            .get(&f)
            .and_then(|s| s.loops.get(&loop_id))
            .map_or(0, |l| l.rejits)
    }

    /// A guard failed inside the compiled body of `loop_id`. Loop bodies
    /// follow the same same-tier rejit budget as whole functions; once it is
    /// spent the body is dropped rather than entered to bail out again.
    pub fn on_loop_body_bailout(&mut self, f: FunctionId, loop_id: u8) -> LoopBailoutAction {
        let threshold = self.config.rejit_bailout_threshold;
        let max_attempts = self.config.max_rejit_attempts;
        let enabled = self.enabled;
        let s = self.state(f);
        s.total_bailouts += 1;
        let l = s.loops.entry(loop_id).or_default();
        l.bailouts += 1;
        if l.bailouts < threshold.saturating_mul(l.rejits + 1) {
            return LoopBailoutAction::Keep;
        }
        l.installed = false;
        l.bailouts = 0;
        if !enabled || l.rejits >= max_attempts {
            l.failed = true;
            info!(function = f.0, loop_id, "dropping loop body after repeated bailouts");
            return LoopBailoutAction::Drop;
        }
        l.rejits += 1;
        l.pending = true;
        info!(function = f.0, loop_id, attempt = l.rejits, "re-jit loop body after repeated bailouts");
        LoopBailoutAction::Recompile
    }

    /// A guard failed at `site`. Returns a same-tier recompile request when
    /// the site keeps failing and the rejit budget allows it.
    pub fn on_bailout(&mut self, f: FunctionId, site: u32) -> Option<ExecutionMode> {
        let config = self.config.clone();
        let enabled = self.enabled;
        let s = self.state(f);
        s.total_bailouts += 1;
        let count = s.bailouts_by_site.entry(site).or_insert(0);
        *count += 1;
        let bar = config.rejit_bailout_threshold.saturating_mul(s.rejit_attempts + 1);
        if !enabled || *count < bar || s.pending.is_some() || !s.mode.is_jit() {
            return None;
        }
        if s.rejit_attempts >= config.max_rejit_attempts {
            return None;
        }
        s.rejit_attempts += 1;
        s.bailouts_by_site.clear();
        s.pending = Some(s.mode);
        info!(function = f.0, site, attempt = s.rejit_attempts, "re-jit after repeated bailouts");
        Some(s.mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> TierController {
        TierController::new(
            TierConfig {
                simple_jit_call_threshold: 2,
                full_jit_call_threshold: 5,
                loop_body_threshold: 3,
                rejit_bailout_threshold: 2,
                max_rejit_attempts: 1,
                ..TierConfig::default()
            },
            true,
        )
    }

    const F: FunctionId = FunctionId(0);

    #[test]
    fn test_promotion_sequence() {
        let mut tc = controller();
        assert_eq!(tc.on_call(F), None);
        assert_eq!(tc.on_call(F), Some(ExecutionMode::SimpleJit));
        // Pending requests are not repeated
        assert_eq!(tc.on_call(F), None);
        tc.on_installed(F, ExecutionMode::SimpleJit);
        assert_eq!(tc.on_call(F), None);
        assert_eq!(tc.on_call(F), Some(ExecutionMode::FullJit));
        tc.on_installed(F, ExecutionMode::FullJit);
        for _ in 0..100 {
            assert_eq!(tc.on_call(F), None);
        }
        assert_eq!(
            tc.transitions_for(F),
            vec![
                (ExecutionMode::Interpreter, ExecutionMode::SimpleJit),
                (ExecutionMode::SimpleJit, ExecutionMode::FullJit)
            ]
        );
    }

    #[test]
    fn test_failure_keeps_tier_and_skips_mode() {
        let mut tc = controller();
        tc.on_call(F);
        assert_eq!(tc.on_call(F), Some(ExecutionMode::SimpleJit));
        tc.on_compile_failed(F, ExecutionMode::SimpleJit);
        assert_eq!(tc.mode(F), ExecutionMode::Interpreter);
        // Simple tier is skipped; FullJIT is requested once its bar is met
        assert_eq!(tc.on_call(F), None);
        tc.on_call(F);
        assert_eq!(tc.on_call(F), Some(ExecutionMode::FullJit));
    }

    #[test]
    fn test_bailouts_never_demote() {
        let mut tc = controller();
        tc.on_installed(F, ExecutionMode::FullJit);
        for _ in 0..50 {
            tc.on_bailout(F, 3);
        }
        assert_eq!(tc.mode(F), ExecutionMode::FullJit);
        assert_eq!(tc.bailouts(F), 50);
    }

    #[test]
    fn test_rejit_is_capped_and_bar_rises() {
        let mut tc = controller();
        tc.on_installed(F, ExecutionMode::FullJit);
        assert_eq!(tc.on_bailout(F, 1), None);
        assert_eq!(tc.on_bailout(F, 1), Some(ExecutionMode::FullJit));
        tc.on_installed(F, ExecutionMode::FullJit);
        // max_rejit_attempts = 1
        for _ in 0..10 {
            assert_eq!(tc.on_bailout(F, 1), None);
        }
        assert_eq!(tc.rejit_attempts(F), 1);
        assert_eq!(tc.transitions_for(F).len(), 1);
    }

    #[test]
    fn test_loop_body_request() {
        let mut tc = controller();
        assert_eq!(tc.on_loop_iteration(F, 0, true), LoopAction::None);
        assert_eq!(tc.on_loop_iteration(F, 0, true), LoopAction::None);
        assert_eq!(tc.on_loop_iteration(F, 0, true), LoopAction::CompileLoopBody);
        tc.on_loop_body_installed(F, 0);
        assert_eq!(tc.on_loop_iteration(F, 0, true), LoopAction::None);
    }

    #[test]
    fn test_loop_body_bailouts_rejit_then_drop() {
        let mut tc = controller();
        for _ in 0..3 {
            tc.on_loop_iteration(F, 0, true);
        }
        tc.on_loop_body_installed(F, 0);
        // rejit_bailout_threshold = 2
        assert_eq!(tc.on_loop_body_bailout(F, 0), LoopBailoutAction::Keep);
        assert_eq!(tc.on_loop_body_bailout(F, 0), LoopBailoutAction::Recompile);
        assert_eq!(tc.loop_rejit_attempts(F, 0), 1);
        tc.on_loop_body_installed(F, 0);
        // The bar rises with each attempt
        for _ in 0..3 {
            assert_eq!(tc.on_loop_body_bailout(F, 0), LoopBailoutAction::Keep);
        }
        assert_eq!(tc.on_loop_body_bailout(F, 0), LoopBailoutAction::Drop);
        // A dropped body is never requested again
        for _ in 0..10 {
            assert_eq!(tc.on_loop_iteration(F, 0, true), LoopAction::None);
        }
        assert_eq!(tc.mode(F), ExecutionMode::Interpreter);
        assert_eq!(tc.bailouts(F), 6);
    }

    #[test]
    fn test_invalidation_requests_reinstall() {
        let mut tc = controller();
        tc.on_installed(F, ExecutionMode::SimpleJit);
        tc.on_invalidated(F);
        assert_eq!(tc.on_call(F), Some(ExecutionMode::SimpleJit));
        tc.on_installed(F, ExecutionMode::SimpleJit);
        assert_eq!(tc.transitions_for(F).len(), 1);
    }

    #[test]
    fn test_disabled_never_requests() {
        let mut tc = TierController::new(TierConfig::default(), false);
        for _ in 0..10_000 {
            assert_eq!(tc.on_call(F), None);
        }
    }
}
