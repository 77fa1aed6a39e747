//! Shared JIT context
//!
//! One per engine. Holds the cookie that seeds blinding keys, the count of
//! compilations in flight, function epochs used to cancel stale work, and
//! counters for the CLI and tests.

use super::work_item::WorkItem;
use crate::config::JitConfig;
use crate::runtime::FunctionId;
use rand::Rng;
use rustc_hash::FxHashMap as HashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::trace;

/// Counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JitStats {
    pub compiled: u64,
    pub failed: u64,
    pub abandoned: u64,
    pub discarded: u64,
    pub bailouts: u64,
    pub installed_bytes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    compiled: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
    discarded: AtomicU64,
    bailouts: AtomicU64,
    installed_bytes: AtomicU64,
}

#[derive(Debug)]
pub struct JitContext {
    config: JitConfig,
    cookie: u64,
    active: AtomicUsize,
    idle_lock: Mutex<()>,
    idle: Condvar,
    epochs: Mutex<HashMap<FunctionId, u32>>,
    counters: Counters,
}

/// Marks one compilation in flight until dropped
#[must_use]
pub struct ActiveJit<'a> {
    context: &'a JitContext,
}

impl Drop for ActiveJit<'_> {
    fn drop(&mut self) {
        if self.context.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.context.idle_lock.lock();
            self.context.idle.notify_all();
        }
    }
}

impl JitContext {
    pub fn new(config: JitConfig) -> Self {
        let cookie = config.security.cookie.unwrap_or_else(|| rand::thread_rng().gen());
        Self {
            config,
            cookie,
            active: AtomicUsize::new(0),
            idle_lock: Mutex::new(()),
            idle: Condvar::new(),
            epochs: Mutex::new(HashMap::default()),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    pub fn begin_jit(&self) -> ActiveJit<'_> {
        self.active.fetch_add(1, Ordering::AcqRel);
        ActiveJit { context: self }
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Block until no compilation is in flight. Returns false on timeout.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let Ok(mut guard) = self.idle_lock.lock() else {
            return false;
        };
        while self.active_count() > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            match self.idle.wait_timeout(guard, deadline - now) {
                Ok((g, _)) => guard = g,
                Err(_) => return false,
            }
        }
        true
    }

    // ==================== Epochs ====================

    pub fn epoch(&self, function: FunctionId) -> u32 {
        self.epochs
            .lock()
            .map(|e| e.get(&function).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Start a new generation of `function`; returns the new epoch
    pub fn bump_epoch(&self, function: FunctionId) -> u32 {
        let Ok(mut epochs) = self.epochs.lock() else {
            return 0;
        };
        let epoch = epochs.entry(function).or_insert(0);
        *epoch += 1;
        trace!(function = %function, epoch = *epoch, "epoch bumped");
        *epoch
    }

    pub fn is_current(&self, work: &WorkItem) -> bool {
        self.epoch(work.function) == work.epoch
    }

    // ==================== Stats ====================

    pub fn record_compiled(&self, bytes: usize) {
        self.counters.compiled.fetch_add(1, Ordering::Relaxed);
        self.counters.installed_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abandoned(&self) {
        self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discarded(&self) {
        self.counters.discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bailout(&self) {
        self.counters.bailouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> JitStats {
        let c = &self.counters;
        JitStats {
            compiled: c.compiled.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            abandoned: c.abandoned.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
            bailouts: c.bailouts.load(Ordering::Relaxed),
            installed_bytes: c.installed_bytes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityConfig;
    use crate::jit::tier::ExecutionMode;
    use crate::jit::work_item::WorkKind;
    use std::sync::Arc;

    #[test]
    fn test_configured_cookie_is_used() {
        let config = JitConfig {
            security: SecurityConfig {
                cookie: Some(77),
                ..SecurityConfig::default()
            },
            ..JitConfig::default()
        };
        assert_eq!(JitContext::new(config).cookie(), 77);
    }

    #[test]
    fn test_active_bracket() {
        let ctx = JitContext::new(JitConfig::default());
        assert!(ctx.wait_for_idle(Duration::from_millis(1)));
        let guard = ctx.begin_jit();
        assert_eq!(ctx.active_count(), 1);
        assert!(!ctx.wait_for_idle(Duration::from_millis(5)));
        drop(guard);
        assert_eq!(ctx.active_count(), 0);
        assert!(ctx.wait_for_idle(Duration::from_millis(1)));
    }

    #[test]
    fn test_wait_for_idle_across_threads() {
        let ctx = Arc::new(JitContext::new(JitConfig::default()));
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let worker = {
            let ctx = Arc::clone(&ctx);
            std::thread::spawn(move || {
                let _active = ctx.begin_jit();
                started_tx.send(()).unwrap();
                std::thread::sleep(Duration::from_millis(20));
            })
        };
        started_rx.recv().unwrap();
        assert!(ctx.wait_for_idle(Duration::from_secs(5)));
        worker.join().unwrap();
    }

    #[test]
    fn test_epochs_make_work_stale() {
        let ctx = JitContext::new(JitConfig::default());
        let work = WorkItem {
            id: 1,
            function: FunctionId(3),
            epoch: ctx.epoch(FunctionId(3)),
            kind: WorkKind::Function,
            mode: ExecutionMode::SimpleJit,
            call_count: 0,
            loop_count: 0,
            display_name: "f".into(),
        };
        assert!(ctx.is_current(&work));
        assert_eq!(ctx.bump_epoch(FunctionId(3)), 1);
        assert!(!ctx.is_current(&work));
        assert_eq!(ctx.epoch(FunctionId(4)), 0);
    }
}
