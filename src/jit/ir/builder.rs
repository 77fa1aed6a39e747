//! Bytecode to IR translation, including inlining
//!
//! Inlined callees get their own register window and an `InlineFrame`
//! record; their returns become a move into the call's result register and
//! a jump past the inlined body.

use super::{
    loop_regions, BailoutReason, FrameId, GuardKind, InlineFrame, IrConst, IrFunction, IrInstr, IrOp, LabelId,
    LoopRegion, NumKind, VReg,
};
use crate::bytecode::{decode, Constant, Instruction, Reg};
use crate::config::JitConfig;
use crate::error::{Error, Result};
use crate::jit::inline::{InlineCallSite, InliningDecider};
use crate::jit::snapshot::{FixedFieldInfo, FunctionBodyView, JitSnapshot};
use crate::jit::tier::ExecutionMode;
use crate::jit::work_item::{WorkItem, WorkKind};
use crate::runtime::{FunctionId, PropertyId};
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use tracing::debug;

/// Translate the work item's top function (and whatever it inlines)
pub fn build(snapshot: &JitSnapshot, work: &WorkItem, config: &JitConfig) -> Result<IrFunction> {
    let top = snapshot.top();
    if top.has_try() {
        return Err(Error::unsupported(top.display_name(), "try/catch"));
    }
    if top.is_generator() {
        return Err(Error::unsupported(top.display_name(), "generator"));
    }
    if top.is_asmjs() {
        return Err(Error::unsupported(top.display_name(), "asm.js"));
    }

    let instrs = decode_all(top)?;
    let region = match work.kind {
        WorkKind::Function => None,
        WorkKind::LoopBody { header_offset, .. } => Some(
            loop_regions(&instrs)
                .into_iter()
                .find(|r| r.header == header_offset)
                .ok_or_else(|| Error::invalid_bytecode(header_offset as usize, "no loop header at offset"))?,
        ),
    };

    let reg_count = top.register_count() as u32;
    let ir = IrFunction {
        function: top.function_number(),
        name: top.display_name().to_string(),
        mode: work.mode,
        kind: work.kind,
        instrs: Vec::new(),
        frames: vec![InlineFrame {
            id: 0,
            function: top.function_number(),
            parent: None,
            reg_base: 0,
            reg_count,
            call_offset: 0,
            resume_offset: 0,
            result_reg: 0,
            this_reg: None,
            arg_regs: Vec::new(),
            is_construct: false,
        }],
        bailouts: Vec::new(),
        vreg_count: reg_count,
        label_count: 0,
    };
    let decider = (work.mode == ExecutionMode::FullJit && config.inlining.enabled)
        .then(|| InliningDecider::new(&config.inlining, top, work.is_loop_body()));

    let mut builder = Builder {
        snapshot,
        decider,
        ir,
        const_regs: HashSet::default(),
    };
    let ctx = FrameCtx {
        id: 0,
        function: top.function_number(),
        reg_base: 0,
        in_loop: false,
        chain: vec![top.function_number()],
        this: None,
        args: Vec::new(),
    };
    builder.build_frame(top, &instrs, &ctx, region, &FrameExit::Top)?;
    debug!(
        function = %builder.ir.function,
        instrs = builder.ir.instrs.len(),
        frames = builder.ir.frames.len(),
        "built IR"
    );
    Ok(builder.ir)
}

fn decode_all(body: &FunctionBodyView) -> Result<Vec<(u32, Instruction)>> {
    let code = body.code();
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < code.len() {
        let (instr, next) = decode(code, offset)?;
        out.push((offset as u32, instr));
        offset = next;
    }
    Ok(out)
}

/// Translation state of one (top or inlined) frame
struct FrameCtx {
    id: FrameId,
    function: FunctionId,
    reg_base: VReg,
    /// The call that created this frame sits inside a loop
    in_loop: bool,
    /// Functions on the inline chain, outermost first
    chain: Vec<FunctionId>,
    this: Option<VReg>,
    args: Vec<VReg>,
}

impl FrameCtx {
    fn reg(&self, r: Reg) -> VReg {
        self.reg_base + r as VReg
    }

    fn is_inlined(&self) -> bool {
        self.id != 0
    }

    fn depth(&self) -> u32 {
        self.chain.len() as u32 - 1
    }
}

enum FrameExit {
    Top,
    Inline { result: VReg, end: LabelId },
}

/// Per-frame jump bookkeeping
struct Labels {
    at: HashMap<u32, LabelId>,
    targets: HashSet<u32>,
    exits: Vec<(LabelId, u32)>,
}

/// Per-instruction position
#[derive(Clone, Copy)]
struct Pos {
    offset: u32,
    next: u32,
    in_loop: bool,
    outside_loop: bool,
}

struct Builder<'a> {
    snapshot: &'a JitSnapshot,
    decider: Option<InliningDecider>,
    ir: IrFunction,
    /// Registers whose current value came from a constant load in this block
    const_regs: HashSet<VReg>,
}

impl<'a> Builder<'a> {
    fn emit(&mut self, op: IrOp, offset: u32, frame: FrameId) {
        if matches!(op, IrOp::Label(_)) {
            self.const_regs.clear();
        }
        if let Some(d) = op.def() {
            if matches!(op, IrOp::LoadConst { .. }) {
                self.const_regs.insert(d);
            } else {
                self.const_regs.remove(&d);
            }
        }
        self.ir.instrs.push(IrInstr { op, offset, frame });
    }

    fn build_frame(
        &mut self,
        body: &'a FunctionBodyView,
        instrs: &[(u32, Instruction)],
        ctx: &FrameCtx,
        region: Option<LoopRegion>,
        exit: &FrameExit,
    ) -> Result<()> {
        let loops = loop_regions(instrs);
        let in_region = |o: u32| region.map_or(true, |r| r.contains(o));
        let mut labels = Labels {
            at: HashMap::default(),
            targets: HashSet::default(),
            exits: Vec::new(),
        };
        for (offset, instr) in instrs {
            if !in_region(*offset) {
                continue;
            }
            if let Instruction::Jump { target } | Instruction::JumpIf { target, .. } = instr {
                if in_region(*target) {
                    labels.targets.insert(*target);
                }
            }
        }

        let mut last_terminates = false;
        for (i, (offset, instr)) in instrs.iter().enumerate() {
            if !in_region(*offset) {
                continue;
            }
            if labels.targets.contains(offset) {
                let l = self.label_at(&mut labels, *offset);
                self.emit(IrOp::Label(l), *offset, ctx.id);
            }
            let inside = ctx.in_loop || loops.iter().any(|l| l.contains(*offset));
            let pos = Pos {
                offset: *offset,
                next: instrs.get(i + 1).map_or(body.bytecode_length(), |(o, _)| *o),
                in_loop: inside,
                outside_loop: !inside && self.snapshot.top().has_loops(),
            };
            self.translate(body, ctx, instr, pos, region, &mut labels, exit)?;
            last_terminates = instr.is_terminator();
        }

        if let Some(r) = region {
            if !last_terminates {
                self.emit(IrOp::LoopExit { target: r.end }, r.end, ctx.id);
            }
        }
        for (label, target) in std::mem::take(&mut labels.exits) {
            self.emit(IrOp::Label(label), target, ctx.id);
            self.emit(IrOp::LoopExit { target }, target, ctx.id);
        }
        Ok(())
    }

    fn label_at(&mut self, labels: &mut Labels, offset: u32) -> LabelId {
        if let Some(l) = labels.at.get(&offset) {
            return *l;
        }
        let l = self.ir.new_label();
        labels.at.insert(offset, l);
        l
    }

    /// Label for a branch target; targets outside a loop-body region get a
    /// trampoline that leaves the compiled loop
    fn branch_target(&mut self, target: u32, region: Option<LoopRegion>, labels: &mut Labels) -> LabelId {
        if region.is_some_and(|r| !r.contains(target)) {
            let l = self.ir.new_label();
            labels.exits.push((l, target));
            l
        } else {
            self.label_at(labels, target)
        }
    }

    fn property(&self, body: &FunctionBodyView, name: u16, offset: u32) -> Result<PropertyId> {
        body.property_id(name)
            .ok_or_else(|| Error::invalid_bytecode(offset as usize, format!("name index {} out of range", name)))
    }

    #[allow(clippy::too_many_arguments)]
    fn translate(
        &mut self,
        body: &'a FunctionBodyView,
        ctx: &FrameCtx,
        instr: &Instruction,
        pos: Pos,
        region: Option<LoopRegion>,
        labels: &mut Labels,
        exit: &FrameExit,
    ) -> Result<()> {
        let (offset, frame) = (pos.offset, ctx.id);
        let op = match *instr {
            Instruction::Nop => return Ok(()),
            Instruction::LoadConst { dst, index } => {
                let value = match body.constant(index) {
                    Some(Constant::Undefined) => IrConst::Undefined,
                    Some(Constant::Bool(b)) => IrConst::Bool(*b),
                    Some(Constant::Int(i)) => IrConst::Int(*i),
                    Some(Constant::Float(x)) => IrConst::Float(*x),
                    Some(Constant::Str(s)) => IrConst::Str(s.clone()),
                    None => return Err(Error::invalid_bytecode(offset as usize, "constant index out of range")),
                };
                IrOp::LoadConst { dst: ctx.reg(dst), value }
            }
            Instruction::LoadInt { dst, value } => IrOp::LoadConst {
                dst: ctx.reg(dst),
                value: IrConst::Int(value),
            },
            Instruction::LoadUndefined { dst } => IrOp::LoadConst {
                dst: ctx.reg(dst),
                value: IrConst::Undefined,
            },
            Instruction::LoadBool { dst, value } => IrOp::LoadConst {
                dst: ctx.reg(dst),
                value: IrConst::Bool(value),
            },
            Instruction::LoadArg { dst, index } if ctx.is_inlined() => match ctx.args.get(index as usize) {
                Some(src) => IrOp::Move {
                    dst: ctx.reg(dst),
                    src: *src,
                },
                None => IrOp::LoadConst {
                    dst: ctx.reg(dst),
                    value: IrConst::Undefined,
                },
            },
            Instruction::LoadArg { dst, index } => IrOp::LoadArg { dst: ctx.reg(dst), index },
            Instruction::LoadThis { dst } if ctx.is_inlined() => match ctx.this {
                Some(src) => IrOp::Move { dst: ctx.reg(dst), src },
                None => IrOp::LoadConst {
                    dst: ctx.reg(dst),
                    value: IrConst::Undefined,
                },
            },
            Instruction::LoadThis { dst } => IrOp::LoadThis { dst: ctx.reg(dst) },
            Instruction::LoadFunc { dst, local } => IrOp::LoadConst {
                dst: ctx.reg(dst),
                value: IrConst::Func(body.resolve_local_function(local)),
            },
            Instruction::Move { dst, src } => IrOp::Move {
                dst: ctx.reg(dst),
                src: ctx.reg(src),
            },
            Instruction::Binary { op, dst, lhs, rhs } => IrOp::Binary {
                op,
                kind: NumKind::Generic,
                dst: ctx.reg(dst),
                lhs: ctx.reg(lhs),
                rhs: ctx.reg(rhs),
                overflow: None,
            },
            Instruction::Not { dst, src } => IrOp::Not {
                dst: ctx.reg(dst),
                src: ctx.reg(src),
            },
            Instruction::Jump { target } => {
                if region.is_some_and(|r| !r.contains(target)) {
                    IrOp::LoopExit { target }
                } else {
                    IrOp::Jump(self.label_at(labels, target))
                }
            }
            Instruction::JumpIf { cond, when, target } => IrOp::Branch {
                cond: ctx.reg(cond),
                when,
                target: self.branch_target(target, region, labels),
            },
            Instruction::LoopHeader { loop_id } => IrOp::LoopHeader {
                function: ctx.function,
                loop_id,
            },
            Instruction::NewObject { dst } => IrOp::NewObject { dst: ctx.reg(dst) },
            Instruction::GetField { dst, obj, name, ic } => IrOp::GetField {
                dst: ctx.reg(dst),
                obj: ctx.reg(obj),
                prop: self.property(body, name, offset)?,
                function: ctx.function,
                ic,
            },
            Instruction::SetField { obj, name, src, ic } => IrOp::SetField {
                obj: ctx.reg(obj),
                prop: self.property(body, name, offset)?,
                src: ctx.reg(src),
                function: ctx.function,
                ic,
            },
            Instruction::NewArray { dst, len } => IrOp::NewArray {
                dst: ctx.reg(dst),
                len: ctx.reg(len),
            },
            Instruction::GetElem { dst, arr, idx } => IrOp::GetElem {
                dst: ctx.reg(dst),
                arr: ctx.reg(arr),
                idx: ctx.reg(idx),
                checked: true,
            },
            Instruction::SetElem { arr, idx, src } => IrOp::SetElem {
                arr: ctx.reg(arr),
                idx: ctx.reg(idx),
                src: ctx.reg(src),
            },
            Instruction::ArrayLen { dst, arr } => IrOp::ArrayLen {
                dst: ctx.reg(dst),
                arr: ctx.reg(arr),
            },
            Instruction::Call {
                dst,
                callee,
                first,
                argc,
                site,
            } => {
                let args: Vec<VReg> = Instruction::arg_regs(first, argc).map(|r| ctx.reg(r)).collect();
                if self.try_inline_call(body, ctx, pos, site, ctx.reg(callee), &args, ctx.reg(dst))? {
                    return Ok(());
                }
                IrOp::Call {
                    dst: ctx.reg(dst),
                    callee: ctx.reg(callee),
                    args,
                    function: ctx.function,
                    site,
                }
            }
            Instruction::CallMethod {
                dst,
                obj,
                name,
                first,
                argc,
                ic,
                site,
            } => {
                let prop = self.property(body, name, offset)?;
                let args: Vec<VReg> = Instruction::arg_regs(first, argc).map(|r| ctx.reg(r)).collect();
                if self.try_fixed_method(body, ctx, pos, prop, (ic, site), ctx.reg(obj), &args, ctx.reg(dst))? {
                    return Ok(());
                }
                IrOp::CallMethod {
                    dst: ctx.reg(dst),
                    obj: ctx.reg(obj),
                    prop,
                    args,
                    function: ctx.function,
                    ic,
                    site,
                }
            }
            Instruction::New {
                dst,
                ctor,
                first,
                argc,
                site,
            } => {
                let args: Vec<VReg> = Instruction::arg_regs(first, argc).map(|r| ctx.reg(r)).collect();
                if self.try_inline_construct(body, ctx, pos, site, ctx.reg(ctor), &args, ctx.reg(dst))? {
                    return Ok(());
                }
                IrOp::Construct {
                    dst: ctx.reg(dst),
                    ctor: ctx.reg(ctor),
                    args,
                    function: ctx.function,
                    site,
                }
            }
            Instruction::TryBegin { .. } | Instruction::TryEnd => {
                return Err(Error::unsupported(body.display_name(), "try/catch"));
            }
            Instruction::Throw { src } => IrOp::Throw { src: ctx.reg(src) },
            Instruction::Return { src } => match exit {
                FrameExit::Top => IrOp::Return { src: ctx.reg(src) },
                FrameExit::Inline { result, end } => {
                    self.emit(
                        IrOp::Move {
                            dst: *result,
                            src: ctx.reg(src),
                        },
                        offset,
                        frame,
                    );
                    IrOp::Jump(*end)
                }
            },
        };
        self.emit(op, offset, frame);
        Ok(())
    }

    // ==================== Inlining ====================

    fn site_info(&self, ctx: &FrameCtx, pos: Pos, site: u16, target: FunctionId, args: &[VReg]) -> InlineCallSite {
        InlineCallSite {
            call_site_id: site,
            is_call_inside_loop: pos.in_loop,
            is_call_outside_loop: pos.outside_loop,
            recursive_depth: ctx.chain.iter().filter(|f| **f == target).count() as u32,
            constant_arg_count: args.iter().filter(|a| self.const_regs.contains(a)).count() as u32,
            ..InlineCallSite::default()
        }
    }

    fn wants_inline(
        &self,
        inlinee: &FunctionBodyView,
        inliner: &FunctionBodyView,
        ctx: &FrameCtx,
        site: &InlineCallSite,
    ) -> bool {
        let Some(decider) = &self.decider else {
            return false;
        };
        ctx.depth() < decider.depth_max() && decider.should_inline(inlinee, inliner, self.snapshot.top(), site)
    }

    fn guard(&mut self, kind: GuardKind, offset: u32, frame: FrameId) {
        let bailout = self.ir.new_bailout(frame, offset, BailoutReason::for_guard(&kind));
        self.emit(IrOp::Guard { kind, bailout }, offset, frame);
    }

    #[allow(clippy::too_many_arguments)]
    fn try_inline_call(
        &mut self,
        body: &'a FunctionBodyView,
        ctx: &FrameCtx,
        pos: Pos,
        site: u16,
        callee: VReg,
        args: &[VReg],
        dst: VReg,
    ) -> Result<bool> {
        let snapshot = self.snapshot;
        let Some(target) = body.call_site(site).and_then(|c| c.monomorphic_target()) else {
            return Ok(false);
        };
        let Some(inlinee) = snapshot.body(target) else {
            return Ok(false);
        };
        let info = self.site_info(ctx, pos, site, target, args);
        if !self.wants_inline(inlinee, body, ctx, &info) {
            return Ok(false);
        }
        self.guard(GuardKind::Callee(callee, target), pos.offset, ctx.id);
        self.inline_body(inlinee, ctx, pos, None, args, dst, false)?;
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    fn try_fixed_method(
        &mut self,
        body: &'a FunctionBodyView,
        ctx: &FrameCtx,
        pos: Pos,
        prop: PropertyId,
        (ic, site): (u16, u16),
        obj: VReg,
        args: &[VReg],
        dst: VReg,
    ) -> Result<bool> {
        if self.decider.is_none() {
            return Ok(false);
        }
        let Some(cache) = body.inline_cache(ic) else {
            return Ok(false);
        };
        let Some(fixed) = cache.fixed_field(prop) else {
            return Ok(false);
        };
        self.fixed_field_guards(&fixed, obj, pos.offset, ctx.id);

        let snapshot = self.snapshot;
        if let Some(inlinee) = snapshot.body(fixed.function) {
            let info = InlineCallSite {
                is_fixed_method_call: true,
                is_polymorphic_call: cache.is_polymorphic(),
                ..self.site_info(ctx, pos, site, fixed.function, args)
            };
            if self.wants_inline(inlinee, body, ctx, &info) {
                self.inline_body(inlinee, ctx, pos, Some(obj), args, dst, false)?;
                return Ok(true);
            }
        }
        self.emit(
            IrOp::CallDirect {
                dst,
                target: fixed.function,
                this: Some(obj),
                args: args.to_vec(),
            },
            pos.offset,
            ctx.id,
        );
        Ok(true)
    }

    fn fixed_field_guards(&mut self, fixed: &FixedFieldInfo, obj: VReg, offset: u32, frame: FrameId) {
        self.guard(GuardKind::Type(obj, fixed.guard_types.clone()), offset, frame);
        for g in &fixed.guards {
            self.guard(GuardKind::Property(*g), offset, frame);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn try_inline_construct(
        &mut self,
        body: &'a FunctionBodyView,
        ctx: &FrameCtx,
        pos: Pos,
        site: u16,
        ctor: VReg,
        args: &[VReg],
        dst: VReg,
    ) -> Result<bool> {
        let snapshot = self.snapshot;
        let Some(target) = body.call_site(site).and_then(|c| c.monomorphic_target()) else {
            return Ok(false);
        };
        let Some(inlinee) = snapshot.body(target) else {
            return Ok(false);
        };
        let cache = inlinee.constructor_cache();
        if !cache.is_monomorphic() {
            return Ok(false);
        }
        let info = InlineCallSite {
            is_constructor_call: true,
            ..self.site_info(ctx, pos, site, target, args)
        };
        if !self.wants_inline(inlinee, body, ctx, &info) {
            return Ok(false);
        }
        self.guard(GuardKind::Callee(ctor, target), pos.offset, ctx.id);
        let this = self.ir.new_vreg();
        self.emit(
            IrOp::CreateThis {
                dst: this,
                ctor: target,
                capacity: cache.slot_count(),
            },
            pos.offset,
            ctx.id,
        );
        self.inline_body(inlinee, ctx, pos, Some(this), args, dst, true)?;
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    fn inline_body(
        &mut self,
        inlinee: &'a FunctionBodyView,
        caller: &FrameCtx,
        pos: Pos,
        this: Option<VReg>,
        args: &[VReg],
        dst: VReg,
        is_construct: bool,
    ) -> Result<()> {
        let id = self.ir.frames.len() as FrameId;
        let reg_base = self.ir.vreg_count;
        let reg_count = inlinee.register_count() as u32;
        self.ir.vreg_count += reg_count;
        let result = self.ir.new_vreg();
        let end = self.ir.new_label();
        self.ir.frames.push(InlineFrame {
            id,
            function: inlinee.function_number(),
            parent: Some(caller.id),
            reg_base,
            reg_count,
            call_offset: pos.offset,
            resume_offset: pos.next,
            result_reg: dst,
            this_reg: this,
            arg_regs: args.to_vec(),
            is_construct,
        });
        if let Some(decider) = self.decider.as_mut() {
            decider.record_inlinee(inlinee);
        }
        debug!(
            caller = %caller.function,
            inlinee = inlinee.display_name(),
            frame = id,
            construct = is_construct,
            "inlining"
        );

        // Registers start undefined on every entry, as in the interpreter
        for r in 0..reg_count {
            self.emit(
                IrOp::LoadConst {
                    dst: reg_base + r,
                    value: IrConst::Undefined,
                },
                0,
                id,
            );
        }
        let mut chain = caller.chain.clone();
        chain.push(inlinee.function_number());
        let ctx = FrameCtx {
            id,
            function: inlinee.function_number(),
            reg_base,
            in_loop: pos.in_loop,
            chain,
            this,
            args: args.to_vec(),
        };
        let instrs = decode_all(inlinee)?;
        self.build_frame(inlinee, &instrs, &ctx, None, &FrameExit::Inline { result, end })?;

        self.emit(IrOp::Label(end), pos.offset, caller.id);
        let op = match this {
            Some(this) if is_construct => IrOp::CtorResult {
                dst,
                value: result,
                this,
            },
            _ => IrOp::Move { dst, src: result },
        };
        self.emit(op, pos.offset, caller.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Assembler, FunctionBody, FunctionFlags};
    use crate::jit::snapshot::BodySource;
    use crate::runtime::{FunctionProfile, PropertyGuardTable};

    fn view(id: u32, body: &FunctionBody, profile: &FunctionProfile) -> FunctionBodyView {
        let ids: Vec<PropertyId> = (0..body.names.len() as u32).map(PropertyId).collect();
        FunctionBodyView::capture(
            BodySource {
                function: FunctionId(id),
                local_id: id as u16,
                source_context: 0,
                body,
                property_ids: &ids,
            },
            profile,
            &PropertyGuardTable::new(),
        )
    }

    fn empty_profile(body: &FunctionBody) -> FunctionProfile {
        FunctionProfile::new(body.inline_cache_count, body.call_site_count, body.loop_count)
    }

    fn work(mode: ExecutionMode, kind: WorkKind) -> WorkItem {
        WorkItem {
            id: 1,
            function: FunctionId(0),
            epoch: 0,
            kind,
            mode,
            call_count: 0,
            loop_count: 0,
            display_name: "test".into(),
        }
    }

    fn caller_and_callee() -> (JitSnapshot, FunctionBody) {
        // caller(x) = callee(x)
        let mut asm = Assembler::new("caller", 1);
        asm.load_func(0, 1).load_arg(1, 0).call(2, 0, 1, 1).ret(2);
        let caller = asm.finish().unwrap();
        let mut asm = Assembler::new("callee", 1);
        asm.load_arg(0, 0).load_int(1, 1).add(0, 0, 1).ret(0);
        let callee = asm.finish().unwrap();

        let mut profile = empty_profile(&caller);
        profile.call_sites[0].record(Some(FunctionId(1)));
        let mut snapshot = JitSnapshot::new(view(0, &caller, &profile));
        snapshot.add_inlinee(view(1, &callee, &empty_profile(&callee)));
        (snapshot, caller)
    }

    #[test]
    fn test_straight_line() {
        let mut asm = Assembler::new("f", 2);
        asm.load_arg(0, 0).load_arg(1, 1).add(2, 0, 1).ret(2);
        let body = asm.finish().unwrap();
        let snapshot = JitSnapshot::new(view(0, &body, &empty_profile(&body)));
        let ir = build(&snapshot, &work(ExecutionMode::SimpleJit, WorkKind::Function), &JitConfig::default()).unwrap();
        assert_eq!(ir.vreg_count, 3);
        assert_eq!(ir.frames.len(), 1);
        assert!(matches!(ir.instrs.last().unwrap().op, IrOp::Return { src: 2 }));
    }

    #[test]
    fn test_try_is_unsupported() {
        let mut asm = Assembler::new("t", 0);
        let handler = asm.new_label();
        asm.try_begin(handler, 0).load_int(1, 1).throw(1);
        asm.bind(handler);
        asm.ret(0);
        let body = asm.finish().unwrap();
        assert!(body.flags.contains(FunctionFlags::HAS_TRY));
        let snapshot = JitSnapshot::new(view(0, &body, &empty_profile(&body)));
        let err = build(&snapshot, &work(ExecutionMode::FullJit, WorkKind::Function), &JitConfig::default()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedConstruct { .. }));
    }

    #[test]
    fn test_monomorphic_call_is_inlined_in_full_jit() {
        let (snapshot, _) = caller_and_callee();
        let ir = build(&snapshot, &work(ExecutionMode::FullJit, WorkKind::Function), &JitConfig::default()).unwrap();
        assert_eq!(ir.frames.len(), 2);
        assert_eq!(ir.frames[1].function, FunctionId(1));
        assert_eq!(ir.frames[1].parent, Some(0));
        assert!(ir
            .instrs
            .iter()
            .any(|i| matches!(i.op, IrOp::Guard { kind: GuardKind::Callee(_, FunctionId(1)), .. })));
        assert!(!ir.instrs.iter().any(|i| matches!(i.op, IrOp::Call { .. })));
        assert!(ir.instrs.iter().any(|i| i.frame == 1));
    }

    #[test]
    fn test_simple_jit_never_inlines() {
        let (snapshot, _) = caller_and_callee();
        let ir = build(&snapshot, &work(ExecutionMode::SimpleJit, WorkKind::Function), &JitConfig::default()).unwrap();
        assert_eq!(ir.frames.len(), 1);
        assert!(ir.instrs.iter().any(|i| matches!(i.op, IrOp::Call { .. })));
    }

    #[test]
    fn test_loop_body_region() {
        let mut asm = Assembler::new("sum", 1);
        let head = asm.new_label();
        let exit = asm.new_label();
        asm.load_arg(0, 0).load_int(1, 0).load_int(2, 1);
        asm.bind(head);
        let loop_id = asm.loop_header();
        asm.lt(3, 1, 0).jump_if_false(3, exit).add(1, 1, 2).jump(head);
        asm.bind(exit);
        asm.ret(1);
        let body = asm.finish().unwrap();
        let instrs = body.instructions().unwrap();
        let header_offset = instrs
            .iter()
            .find(|(_, i)| matches!(i, Instruction::LoopHeader { .. }))
            .unwrap()
            .0;
        let snapshot = JitSnapshot::new(view(0, &body, &empty_profile(&body)));
        let item = work(ExecutionMode::FullJit, WorkKind::LoopBody { loop_id, header_offset });
        let ir = build(&snapshot, &item, &JitConfig::default()).unwrap();
        assert!(!ir.instrs.iter().any(|i| matches!(i.op, IrOp::Return { .. } | IrOp::LoadArg { .. })));
        assert!(ir.instrs.iter().any(|i| matches!(i.op, IrOp::LoopExit { .. })));
        assert!(matches!(ir.instrs[1].op, IrOp::LoopHeader { .. }) || matches!(ir.instrs[0].op, IrOp::LoopHeader { .. }));
    }
}
