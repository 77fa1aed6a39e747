//! Snapshot construction
//!
//! Copies what a work item may look at into a [`JitSnapshot`]: the top
//! function, bodies reachable through monomorphic call sites and fixed
//! method fields (full JIT only), and every type those caches mention.

use super::{Engine, FunctionRecord};
use crate::error::Result;
use crate::jit::snapshot::{BodySource, FunctionBodyView, JitSnapshot, TypeView};
use crate::jit::tier::ExecutionMode;
use crate::jit::work_item::WorkItem;
use crate::runtime::{FunctionId, TypeId, TypeRegistry};
use std::collections::{BTreeSet, VecDeque};
use tracing::trace;

impl Engine {
    fn capture_view(&self, record: &FunctionRecord) -> FunctionBodyView {
        FunctionBodyView::capture(
            BodySource {
                function: record.id,
                local_id: record.local_id,
                source_context: record.program,
                body: &record.body,
                property_ids: &record.property_ids,
            },
            &record.profile,
            &self.guards,
        )
    }

    /// Functions `record` might call directly, according to its profile
    fn call_targets(record: &FunctionRecord) -> Vec<FunctionId> {
        let sites = record.profile.call_sites.iter().filter_map(|s| s.monomorphic_target());
        let methods = record
            .profile
            .inline_caches
            .iter()
            .flat_map(|ic| ic.entries().iter().filter_map(|e| e.fixed_function));
        sites.chain(methods).collect()
    }

    fn referenced_types(record: &FunctionRecord, out: &mut BTreeSet<TypeId>) {
        for ic in &record.profile.inline_caches {
            for entry in ic.entries() {
                out.insert(entry.type_id);
                out.insert(entry.result_type);
            }
        }
        if let Some(t) = record.profile.constructor_cache.result_type {
            out.insert(t);
        }
    }

    pub(crate) fn build_snapshot(&self, work: &WorkItem) -> Result<JitSnapshot> {
        let top = self.record(work.function)?;
        let mut snapshot = JitSnapshot::new(self.capture_view(top));
        let mut types = BTreeSet::from([TypeRegistry::ROOT]);
        Self::referenced_types(top, &mut types);

        let inlining = &self.config.inlining;
        if work.mode == ExecutionMode::FullJit && inlining.enabled {
            let mut seen = BTreeSet::from([work.function]);
            let mut queue: VecDeque<(FunctionId, u32)> =
                Self::call_targets(top).into_iter().map(|f| (f, 1)).collect();
            while let Some((f, depth)) = queue.pop_front() {
                if depth > inlining.inline_depth_max || !seen.insert(f) {
                    continue;
                }
                let Ok(record) = self.record(f) else {
                    continue;
                };
                snapshot.add_inlinee(self.capture_view(record));
                Self::referenced_types(record, &mut types);
                queue.extend(Self::call_targets(record).into_iter().map(|t| (t, depth + 1)));
            }
        }

        for id in types {
            if let Some(ty) = self.types.get(id) {
                snapshot.add_type(TypeView::capture(ty));
            }
        }
        trace!(
            work = %work,
            inlinees = snapshot.inlinee_count(),
            types = snapshot.type_count(),
            "snapshot built"
        );
        Ok(snapshot)
    }
}
