//! Background compilation
//!
//! A single worker thread takes `(work item, snapshot)` jobs from a channel
//! and sends encoded results back. The engine drains results at call
//! boundaries and does the installing itself, so the interpreter never waits
//! on the compiler.

use super::context::JitContext;
use super::encoder::EncodedFunction;
use super::pipeline::Pipeline;
use super::snapshot::JitSnapshot;
use super::work_item::WorkItem;
use crate::error::Result;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Something that turns a work item into encoded code
pub trait CompileBackend: Send + Sync {
    fn compile(&self, work: &WorkItem, snapshot: &JitSnapshot, context: &JitContext) -> Result<EncodedFunction>;
}

/// Runs the pipeline on the calling thread
#[derive(Debug, Default, Clone, Copy)]
pub struct InProcessBackend;

impl CompileBackend for InProcessBackend {
    fn compile(&self, work: &WorkItem, snapshot: &JitSnapshot, context: &JitContext) -> Result<EncodedFunction> {
        let stale = |w: &WorkItem| !context.is_current(w);
        Pipeline::new(context.config(), context.cookie())
            .with_abandon_check(&stale)
            .compile(work, snapshot)
    }
}

pub struct CompileJob {
    pub work: WorkItem,
    pub snapshot: JitSnapshot,
}

pub struct CompileResult {
    pub work: WorkItem,
    pub result: Result<EncodedFunction>,
}

pub struct BackgroundCompiler {
    jobs: Option<Sender<CompileJob>>,
    results: Receiver<CompileResult>,
    worker: Option<JoinHandle<()>>,
    pending: usize,
}

impl BackgroundCompiler {
    pub fn spawn(context: Arc<JitContext>, backend: Arc<dyn CompileBackend>) -> Result<Self> {
        let (job_tx, job_rx) = mpsc::channel::<CompileJob>();
        let (result_tx, result_rx) = mpsc::channel::<CompileResult>();
        let worker = std::thread::Builder::new()
            .name("jit-worker".into())
            .spawn(move || {
                for job in job_rx {
                    let result = {
                        let _active = context.begin_jit();
                        backend.compile(&job.work, &job.snapshot, &context)
                    };
                    trace!(work = %job.work, ok = result.is_ok(), "background compile done");
                    if result_tx.send(CompileResult { work: job.work, result }).is_err() {
                        break;
                    }
                }
                debug!("jit worker stopped");
            })?;
        Ok(Self {
            jobs: Some(job_tx),
            results: result_rx,
            worker: Some(worker),
            pending: 0,
        })
    }

    /// Queue a job. Returns false if the worker is gone.
    pub fn submit(&mut self, work: WorkItem, snapshot: JitSnapshot) -> bool {
        let Some(jobs) = &self.jobs else {
            return false;
        };
        trace!(work = %work, "queued");
        if jobs.send(CompileJob { work, snapshot }).is_err() {
            return false;
        }
        self.pending += 1;
        true
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Results that are ready now
    pub fn drain(&mut self) -> Vec<CompileResult> {
        let ready: Vec<CompileResult> = self.results.try_iter().collect();
        self.pending = self.pending.saturating_sub(ready.len());
        ready
    }

    /// Block until every queued job finished or `timeout` passed
    pub fn wait_all(&mut self, timeout: Duration) -> Vec<CompileResult> {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::new();
        while self.pending > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match self.results.recv_timeout(deadline - now) {
                Ok(result) => {
                    self.pending -= 1;
                    out.push(result);
                }
                Err(_) => break,
            }
        }
        out
    }
}

impl Drop for BackgroundCompiler {
    fn drop(&mut self) {
        self.jobs = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Assembler;
    use crate::config::JitConfig;
    use crate::error::Error;
    use crate::jit::snapshot::{BodySource, FunctionBodyView};
    use crate::jit::tier::ExecutionMode;
    use crate::jit::work_item::WorkKind;
    use crate::runtime::{FunctionId, FunctionProfile, PropertyGuardTable};

    fn job(context: &JitContext, id: u64) -> (WorkItem, JitSnapshot) {
        let mut asm = Assembler::new("inc", 1);
        asm.load_arg(0, 0).load_int(1, 1).add(2, 0, 1).ret(2);
        let body = asm.finish().unwrap();
        let snapshot = JitSnapshot::new(FunctionBodyView::capture(
            BodySource {
                function: FunctionId(0),
                local_id: 0,
                source_context: 0,
                body: &body,
                property_ids: &[],
            },
            &FunctionProfile::new(0, 0, 0),
            &PropertyGuardTable::new(),
        ));
        let work = WorkItem {
            id,
            function: FunctionId(0),
            epoch: context.epoch(FunctionId(0)),
            kind: WorkKind::Function,
            mode: ExecutionMode::SimpleJit,
            call_count: 2,
            loop_count: 0,
            display_name: "inc".into(),
        };
        (work, snapshot)
    }

    #[test]
    fn test_background_results_arrive() {
        let context = Arc::new(JitContext::new(JitConfig::default()));
        let mut compiler = BackgroundCompiler::spawn(Arc::clone(&context), Arc::new(InProcessBackend)).unwrap();
        let (work, snapshot) = job(&context, 1);
        assert!(compiler.submit(work, snapshot));
        let results = compiler.wait_all(Duration::from_secs(10));
        assert_eq!(results.len(), 1);
        assert!(results[0].result.is_ok());
        assert_eq!(compiler.pending(), 0);
        assert!(context.wait_for_idle(Duration::from_secs(1)));
    }

    #[test]
    fn test_stale_work_is_abandoned() {
        let context = JitContext::new(JitConfig::default());
        let (work, snapshot) = job(&context, 2);
        context.bump_epoch(FunctionId(0));
        let result = InProcessBackend.compile(&work, &snapshot, &context);
        assert!(matches!(result, Err(Error::Abandoned(_))));
    }
}
