//! Two-pass encoder
//!
//! Pass one sizes every instruction and binds labels to native offsets;
//! pass two emits bytes with resolved branch targets and records the throw
//! map and inlinee frame ranges. Unwind data (pdata/xdata) is derived from
//! the prologue and frame layout.

use super::lir::{encode_op, encoded_len, LirOp};
use super::lower::LoweredFunction;
use super::output::{InlineeFrameRecord, OutputRecord, PdataEntry, ThrowMapEntry, UnwindInfo};
use super::security::SecurityStats;
use crate::error::{Error, Result};
use rustc_hash::FxHashMap as HashMap;
use tracing::debug;

/// Encoded code and its record, not yet in executable memory
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedFunction {
    pub code: Vec<u8>,
    pub record: OutputRecord,
    pub constants: Vec<String>,
}

impl EncodedFunction {
    /// pdata entries as raw bytes, `entry_size` bytes each
    pub fn pdata_bytes(&self, entry_size: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.record.pdata.len() * entry_size as usize);
        for entry in &self.record.pdata {
            let mut raw = Vec::with_capacity(12);
            raw.extend_from_slice(&entry.begin.to_le_bytes());
            raw.extend_from_slice(&entry.end.to_le_bytes());
            raw.extend_from_slice(&entry.unwind_offset.to_le_bytes());
            raw.resize(entry_size as usize, 0);
            out.extend_from_slice(&raw);
        }
        out
    }
}

fn may_throw(op: &LirOp) -> bool {
    matches!(
        op,
        LirOp::CallHelper { .. }
            | LirOp::GetElem { .. }
            | LirOp::SetElem { .. }
            | LirOp::ArrayLen { .. }
            | LirOp::NewArray { .. }
            | LirOp::LoadSlot { .. }
            | LirOp::StoreSlot { .. }
            | LirOp::Throw { .. }
    )
}

fn xdata(machine_header: u32, unwind: &UnwindInfo, lowered: &LoweredFunction) -> Vec<u8> {
    let mut raw = vec![1u8, unwind.prologue_size.min(u8::MAX as u32) as u8];
    raw.extend_from_slice(&(unwind.frame_bytes as u16).to_le_bytes());
    raw.extend_from_slice(&(lowered.layout.scope_slots as u16).to_le_bytes());
    raw.extend_from_slice(&(lowered.layout.display_slots as u16).to_le_bytes());
    raw.resize(machine_header as usize, 0);
    raw
}

/// Encode a lowered (and hardened) function
pub fn encode(lowered: &LoweredFunction, security: SecurityStats) -> Result<EncodedFunction> {
    let machine = lowered.arch.constants();

    // Pass 1: sizes and labels
    let mut labels: HashMap<u32, u32> = HashMap::default();
    let mut offset = 0u32;
    for instr in &lowered.instrs {
        if let LirOp::Label(l) = instr.op {
            labels.insert(l, offset);
            continue;
        }
        let len = encoded_len(&instr.op)? as u32;
        if len > machine.max_instruction_size {
            return Err(Error::internal(format!(
                "{}-byte instruction exceeds the {} limit of {}",
                len, machine.arch, machine.max_instruction_size
            )));
        }
        offset += len;
    }
    let resolve = |l: u32| {
        labels
            .get(&l)
            .copied()
            .ok_or_else(|| Error::internal(format!("unbound label L{}", l)))
    };

    // Pass 2: emission
    let mut code = Vec::with_capacity(offset as usize);
    let mut throw_map = Vec::new();
    let mut frame_ranges: HashMap<u32, (u32, u32)> = HashMap::default();
    let mut prologue_size = 0;
    for instr in &lowered.instrs {
        let op = match &instr.op {
            LirOp::Label(_) => continue,
            LirOp::Jump(l) => LirOp::Jump(resolve(*l)?),
            LirOp::Branch { cond, when, target } => LirOp::Branch {
                cond: *cond,
                when: *when,
                target: resolve(*target)?,
            },
            other => other.clone(),
        };
        let start = code.len() as u32;
        encode_op(&op, &mut code)?;
        let end = code.len() as u32;

        if let LirOp::Prologue { .. } = op {
            prologue_size = end - start;
        }
        if may_throw(&op) {
            throw_map.push(ThrowMapEntry {
                native_offset: start,
                frame: instr.frame,
                bytecode_offset: instr.offset,
            });
        }
        if instr.frame != 0 {
            let range = frame_ranges.entry(instr.frame).or_insert((start, end));
            range.0 = range.0.min(start);
            range.1 = range.1.max(end);
        }
    }
    if code.len() as u32 != offset {
        return Err(Error::internal("encoded size differs from the sizing pass"));
    }
    let unpadded = code.len();
    code.resize(machine.align_code(unpadded as u32) as usize, 0x90);

    let mut inlinee_frames: Vec<InlineeFrameRecord> = frame_ranges
        .into_iter()
        .map(|(frame, (start, end))| InlineeFrameRecord {
            frame,
            function: lowered.frames.get(frame as usize).map_or(lowered.function, |f| f.function),
            start,
            end,
        })
        .collect();
    inlinee_frames.sort_by_key(|r| (r.start, r.frame));

    let unwind = UnwindInfo {
        prologue_size,
        frame_bytes: lowered.layout.frame_bytes,
    };
    let pointer = machine.pointer_size;
    let code_size = code.len() as u32;
    let pdata_start = code_size.div_ceil(pointer) * pointer;
    let xdata_offset = pdata_start + machine.pdata_entry_size;
    let pdata = vec![PdataEntry {
        begin: 0,
        end: unpadded as u32,
        unwind_offset: xdata_offset,
    }];

    debug!(
        function = %lowered.function,
        mode = %lowered.mode,
        bytes = code_size,
        throw_sites = throw_map.len(),
        inlinees = inlinee_frames.len(),
        "Encoded"
    );

    Ok(EncodedFunction {
        record: OutputRecord {
            function: lowered.function,
            mode: lowered.mode,
            kind: lowered.kind,
            arch: lowered.arch,
            code_address: 0,
            code_size,
            allocation_size: 0,
            unwind,
            pdata,
            xdata_offset,
            xdata: xdata(machine.xdata_header_size, &unwind, lowered),
            throw_map,
            inlinee_frames,
            frames: lowered.frames.clone(),
            bailouts: lowered.bailouts.clone(),
            register_map: lowered.reg_map.clone(),
            layout: lowered.layout,
            security,
        },
        code,
        constants: lowered.constants.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::ir::InlineFrame;
    use crate::jit::lir::{decode_all, Imm, LirInstr, Loc};
    use crate::jit::lower::{Arch, FrameLayout};
    use crate::jit::tier::ExecutionMode;
    use crate::jit::work_item::WorkKind;
    use crate::runtime::FunctionId;

    fn frame(id: u32, function: u32) -> InlineFrame {
        InlineFrame {
            id,
            function: FunctionId(function),
            parent: id.checked_sub(1),
            reg_base: 0,
            reg_count: 0,
            call_offset: 0,
            resume_offset: 0,
            result_reg: 0,
            this_reg: None,
            arg_regs: vec![],
            is_construct: false,
        }
    }

    fn lowered(instrs: Vec<LirInstr>) -> LoweredFunction {
        LoweredFunction {
            function: FunctionId(0),
            name: "f".into(),
            mode: ExecutionMode::FullJit,
            kind: WorkKind::Function,
            arch: Arch::X64,
            instrs,
            reg_map: vec![],
            layout: FrameLayout::default(),
            frames: vec![frame(0, 0), frame(1, 5)],
            bailouts: vec![],
            constants: vec![],
            label_count: 1,
        }
    }

    #[test]
    fn test_labels_resolve_to_native_offsets() {
        let f = lowered(vec![
            LirInstr::new(LirOp::Prologue { slots: 0, scope_slots: 0, display_slots: 0 }, 0, 0),
            LirInstr::new(LirOp::Jump(0), 0, 0),
            LirInstr::new(LirOp::MovImm { dst: Loc::Gpr(0), imm: Imm::int(1) }, 2, 0),
            LirInstr::new(LirOp::Label(0), 4, 0),
            LirInstr::new(LirOp::Ret { src: Loc::Gpr(0) }, 4, 0),
        ]);
        let encoded = encode(&f, SecurityStats::default()).unwrap();
        let ops = decode_all(&encoded.code).unwrap();
        let ret_at = ops.iter().find(|(_, op)| op.is_return()).map(|(o, _)| *o).unwrap();
        assert_eq!(ops[1].1, LirOp::Jump(ret_at));
        assert_eq!(encoded.code.len() % 16, 0);
        assert_eq!(encoded.record.unwind.prologue_size, 7);
        assert_eq!(encoded.record.xdata.len(), 8);
    }

    #[test]
    fn test_throw_map_and_inlinee_ranges() {
        let call = LirOp::CallHelper {
            helper: crate::jit::lir::Helper::CallDirect {
                target: FunctionId(9),
                has_this: false,
            },
            dst: Some(Loc::Gpr(0)),
            args: vec![],
        };
        let f = lowered(vec![
            LirInstr::new(LirOp::Prologue { slots: 0, scope_slots: 0, display_slots: 0 }, 0, 0),
            LirInstr::new(LirOp::Mov { dst: Loc::Gpr(1), src: Loc::Gpr(0) }, 3, 1),
            LirInstr::new(call, 6, 1),
            LirInstr::new(LirOp::Ret { src: Loc::Gpr(0) }, 9, 0),
        ]);
        let encoded = encode(&f, SecurityStats::default()).unwrap();
        let record = &encoded.record;
        assert_eq!(record.throw_map.len(), 1);
        assert_eq!(record.throw_map[0].bytecode_offset, 6);
        assert_eq!(record.throw_map[0].frame, 1);
        assert_eq!(record.inlinee_frames.len(), 1);
        assert_eq!(record.inlinee_frames[0].function, FunctionId(5));
        assert_eq!(record.inlinee_frames[0].start, 7);
        let (function, offset) = record.throw_location(record.throw_map[0].native_offset).unwrap();
        assert_eq!((function, offset), (FunctionId(5), 6));
    }

    #[test]
    fn test_unbound_label_is_internal_error() {
        let f = lowered(vec![LirInstr::new(LirOp::Jump(3), 0, 0)]);
        assert!(matches!(encode(&f, SecurityStats::default()), Err(Error::InternalError(_))));
    }
}
