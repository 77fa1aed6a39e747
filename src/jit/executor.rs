//! Machine executor
//!
//! Runs installed code by decoding it from its executable pages and
//! stepping a register machine shaped by the target's constants: general
//! and float register files plus a stack frame of spill slots. Anything
//! that needs the runtime (field access through inline caches, calls,
//! allocation, property guards) goes through [`RuntimeHelpers`].
//!
//! A failed guard ends execution with [`Exit::Bailout`] carrying the value
//! of every virtual register; the engine uses the bailout record to rebuild
//! interpreter frames from them.

use super::ir::NumKind;
use super::lir::{Helper, Imm, LirGuard, LirOp, Loc};
use super::output::CompiledCode;
use crate::error::{CodeLocation, Error, Result};
use crate::runtime::{ops, FunctionId, PropertyGuardId, PropertyId, TypeId, Value};
use tracing::trace;

/// Services compiled code calls back into
pub trait RuntimeHelpers {
    fn get_field(&mut self, function: FunctionId, ic: u16, prop: PropertyId, obj: &Value) -> Result<Value>;
    fn set_field(&mut self, function: FunctionId, ic: u16, prop: PropertyId, obj: &Value, value: Value) -> Result<()>;
    fn call(&mut self, function: FunctionId, site: u16, callee: &Value, args: &[Value]) -> Result<Value>;
    fn call_method(
        &mut self,
        function: FunctionId,
        ic: u16,
        site: u16,
        prop: PropertyId,
        obj: &Value,
        args: &[Value],
    ) -> Result<Value>;
    fn construct(&mut self, function: FunctionId, site: u16, ctor: &Value, args: &[Value]) -> Result<Value>;
    /// Call a known function without dispatching on a callee value
    fn call_direct(&mut self, target: FunctionId, this: Value, args: &[Value]) -> Result<Value>;
    fn new_object(&mut self) -> Value;
    /// Fresh `this` for an inlined constructor
    fn create_this(&mut self, ctor: FunctionId, capacity: u32) -> Value;
    /// A direct slot store happened; property guards may need invalidating
    fn on_slot_store(&mut self, type_id: TypeId, prop: PropertyId, value: &Value);
    fn write_barrier(&mut self, value: &Value);
    fn property_guard_valid(&self, guard: PropertyGuardId) -> bool;
    /// Baseline-tier loop iteration
    fn loop_tick(&mut self, function: FunctionId, loop_id: u8);
}

/// How compiled code gave control back
#[derive(Debug, Clone)]
pub enum Exit {
    Return(Value),
    /// A guard failed; `regs` holds every virtual register
    Bailout { id: u32, native_offset: u32, regs: Vec<Value> },
    /// A loop body finished; resume the interpreter at `target`
    LoopExit { target: u32, regs: Vec<Value> },
}

/// Register files and frame of one activation
struct Machine {
    gprs: Vec<Value>,
    fprs: Vec<Value>,
    stack: Vec<Value>,
}

impl Machine {
    fn new(code: &CompiledCode) -> Self {
        let constants = code.record.arch.constants();
        Self {
            gprs: vec![Value::Undefined; constants.allocatable_gprs as usize],
            fprs: vec![Value::Undefined; constants.allocatable_fprs as usize],
            stack: Vec::new(),
        }
    }

    fn slot(&mut self, loc: Loc) -> Result<&mut Value> {
        let slot = match loc {
            Loc::Gpr(r) => self.gprs.get_mut(r as usize),
            Loc::Fpr(r) => self.fprs.get_mut(r as usize),
            Loc::Stack(s) => self.stack.get_mut(s as usize),
        };
        slot.ok_or_else(|| Error::internal(format!("location {} outside the frame", loc)))
    }

    fn get(&mut self, loc: Loc) -> Result<Value> {
        self.slot(loc).map(|v| v.clone())
    }

    fn set(&mut self, loc: Loc, value: Value) -> Result<()> {
        *self.slot(loc)? = value;
        Ok(())
    }

    fn get_all(&mut self, locs: &[Loc]) -> Result<Vec<Value>> {
        locs.iter().map(|l| self.get(*l)).collect()
    }
}

fn guard_holds(guard: &LirGuard, m: &mut Machine, helpers: &dyn RuntimeHelpers) -> Result<bool> {
    Ok(match guard {
        LirGuard::Int(l) => matches!(m.get(*l)?, Value::Int(_)),
        LirGuard::Number(l) => m.get(*l)?.is_number(),
        LirGuard::Array(l) => matches!(m.get(*l)?, Value::Array(_)),
        LirGuard::Type(l, types) => m.get(*l)?.object_type().is_some_and(|t| types.contains(&t)),
        LirGuard::Callee(l, f) => m.get(*l)?.as_function() == Some(*f),
        LirGuard::Property(g) => helpers.property_guard_valid(*g),
        LirGuard::Bounds { arr, idx } => match (m.get(*arr)?, m.get(*idx)?) {
            (Value::Array(a), Value::Int(i)) => i >= 0 && (i as usize) < a.borrow().len(),
            _ => false,
        },
    })
}

/// Run `code`. `entry_regs` seeds the top frame's bytecode registers when
/// entering a loop body from the interpreter.
pub fn execute(
    code: &CompiledCode,
    this: &Value,
    args: &[Value],
    entry_regs: Option<&[Value]>,
    helpers: &mut dyn RuntimeHelpers,
) -> Result<Exit> {
    let mut m = Machine::new(code);
    let record = &code.record;
    let ops = code.ops();

    if let Some(regs) = entry_regs {
        m.stack.resize(record.layout.total_slots as usize, Value::Undefined);
        for (v, value) in regs.iter().enumerate() {
            if let Some(loc) = record.register_map.get(v) {
                m.set(*loc, value.clone())?;
            }
        }
    }

    let mut pc = 0usize;
    loop {
        let Some((native, op)) = ops.get(pc) else {
            return Err(Error::internal(format!("{} ran off the end of its code", record.function)));
        };
        let native = *native;
        pc += 1;
        match step(code, op, native, &mut m, this, args, helpers) {
            Ok(Flow::Next) => {}
            Ok(Flow::Jump(target)) => {
                pc = code
                    .index_of(target)
                    .ok_or_else(|| Error::internal(format!("branch into the middle of an instruction at {:#x}", target)))?;
            }
            Ok(Flow::Exit(exit)) => {
                if let Exit::Bailout { id, .. } = &exit {
                    trace!(function = %record.function, bailout = id, native, "Guard failed");
                }
                return Ok(exit);
            }
            Err(e) => {
                return Err(match record.throw_location(native) {
                    Some((function, offset)) => e.with_location(CodeLocation {
                        function: function.0,
                        offset,
                    }),
                    None => e,
                })
            }
        }
    }
}

enum Flow {
    Next,
    Jump(u32),
    Exit(Exit),
}

fn step(
    code: &CompiledCode,
    op: &LirOp,
    native: u32,
    m: &mut Machine,
    this: &Value,
    args: &[Value],
    helpers: &mut dyn RuntimeHelpers,
) -> Result<Flow> {
    let record = &code.record;
    let all_regs = |m: &mut Machine| m.get_all(&record.register_map);
    match op {
        LirOp::Prologue { slots, .. } => {
            if m.stack.len() < *slots as usize {
                m.stack.resize(*slots as usize, Value::Undefined);
            }
        }
        LirOp::MovImm { dst, imm } => m.set(*dst, imm.to_value())?,
        LirOp::XorImm { dst, tag, key } => {
            let bits = Imm::bits_of(*tag, &m.get(*dst)?)
                .ok_or_else(|| Error::internal("blinded constant lost its tag"))?;
            m.set(*dst, Imm { tag: *tag, bits: bits ^ key }.to_value())?;
        }
        LirOp::MovConst { dst, index } => {
            let s = code
                .constants
                .get(*index as usize)
                .ok_or_else(|| Error::internal(format!("constant {} out of range", index)))?;
            m.set(*dst, Value::string(s))?;
        }
        LirOp::Mov { dst, src } => {
            let v = m.get(*src)?;
            m.set(*dst, v)?;
        }
        LirOp::LoadArg { dst, index } => m.set(*dst, args.get(*index as usize).cloned().unwrap_or_default())?,
        LirOp::LoadThis { dst } => m.set(*dst, this.clone())?,
        LirOp::Binary {
            op,
            kind,
            dst,
            lhs,
            rhs,
            overflow,
        } => {
            let (l, r) = (m.get(*lhs)?, m.get(*rhs)?);
            let result = match (kind, &l, &r) {
                (NumKind::Int, Value::Int(a), Value::Int(b)) => match (ops::int_binary(*op, *a, *b), overflow) {
                    (Some(v), _) => v,
                    (None, Some(id)) => {
                        return Ok(Flow::Exit(Exit::Bailout {
                            id: *id,
                            native_offset: native,
                            regs: all_regs(m)?,
                        }))
                    }
                    (None, None) => ops::binary(*op, &l, &r),
                },
                (NumKind::Float, _, _) => ops::number_binary(*op, &l, &r),
                _ => ops::binary(*op, &l, &r),
            };
            m.set(*dst, result)?;
        }
        LirOp::Not { dst, src } => {
            let v = m.get(*src)?;
            m.set(*dst, Value::Boolean(!v.is_truthy()))?;
        }
        LirOp::Label(_) | LirOp::Nop { .. } => {}
        LirOp::Jump(target) => return Ok(Flow::Jump(*target)),
        LirOp::Branch { cond, when, target } => {
            if m.get(*cond)?.is_truthy() == *when {
                return Ok(Flow::Jump(*target));
            }
        }
        LirOp::Guard { guard, bailout } => {
            if !guard_holds(guard, m, helpers)? {
                return Ok(Flow::Exit(Exit::Bailout {
                    id: *bailout,
                    native_offset: native,
                    regs: all_regs(m)?,
                }));
            }
        }
        LirOp::LoadSlot { dst, obj, slot } => {
            let v = match m.get(*obj)? {
                Value::Object(o) => o.borrow().slots.get(*slot as usize).cloned().unwrap_or_default(),
                other => return Err(Error::type_error(format!("cannot read a slot of {}", other.type_name()))),
            };
            m.set(*dst, v)?;
        }
        LirOp::StoreSlot {
            obj,
            slot,
            src,
            prop,
            barrier,
        } => {
            let value = m.get(*src)?;
            let Value::Object(o) = m.get(*obj)? else {
                return Err(Error::type_error("cannot write a slot of a non-object"));
            };
            let type_id = {
                let mut data = o.borrow_mut();
                let i = *slot as usize;
                if i >= data.slots.len() {
                    data.slots.resize(i + 1, Value::Undefined);
                }
                data.slots[i] = value.clone();
                data.type_id
            };
            helpers.on_slot_store(type_id, *prop, &value);
            if *barrier && value.is_heap_reference() {
                helpers.write_barrier(&value);
            }
        }
        LirOp::GetElem {
            dst,
            arr,
            idx,
            checked: true,
        } => {
            let v = ops::get_elem(&m.get(*arr)?, &m.get(*idx)?)?;
            m.set(*dst, v)?;
        }
        LirOp::GetElem {
            dst,
            arr,
            idx,
            checked: false,
        } => {
            // Array, int index and bounds guards precede this load
            let v = match (m.get(*arr)?, m.get(*idx)?) {
                (Value::Array(a), Value::Int(i)) => a.borrow().get(i as usize).cloned(),
                _ => None,
            }
            .ok_or_else(|| Error::internal("unchecked element load without its guards"))?;
            m.set(*dst, v)?;
        }
        LirOp::SetElem { arr, idx, src, barrier } => {
            let value = m.get(*src)?;
            ops::set_elem(&m.get(*arr)?, &m.get(*idx)?, value.clone())?;
            if *barrier && value.is_heap_reference() {
                helpers.write_barrier(&value);
            }
        }
        LirOp::ArrayLen { dst, arr } => {
            let v = ops::array_len(&m.get(*arr)?)?;
            m.set(*dst, v)?;
        }
        LirOp::NewArray { dst, len } => {
            let v = ops::new_array(&m.get(*len)?)?;
            m.set(*dst, v)?;
        }
        LirOp::NewObject { dst } => {
            let v = helpers.new_object();
            m.set(*dst, v)?;
        }
        LirOp::CreateThis { dst, ctor, capacity } => {
            let v = helpers.create_this(*ctor, *capacity);
            m.set(*dst, v)?;
        }
        LirOp::CallHelper { helper, dst, args: locs } => {
            let values = m.get_all(locs)?;
            let (first, rest) = values
                .split_first()
                .map_or((Value::Undefined, &[][..]), |(f, r)| (f.clone(), r));
            let result = match *helper {
                Helper::GetField { function, prop, ic } => helpers.get_field(function, ic, prop, &first)?,
                Helper::SetField { function, prop, ic } => {
                    let value = rest.first().cloned().unwrap_or_default();
                    helpers.set_field(function, ic, prop, &first, value)?;
                    Value::Undefined
                }
                Helper::Call { function, site } => helpers.call(function, site, &first, rest)?,
                Helper::CallMethod {
                    function,
                    prop,
                    ic,
                    site,
                } => helpers.call_method(function, ic, site, prop, &first, rest)?,
                Helper::Construct { function, site } => helpers.construct(function, site, &first, rest)?,
                Helper::CallDirect { target, has_this } => {
                    if has_this {
                        helpers.call_direct(target, first, rest)?
                    } else {
                        helpers.call_direct(target, Value::Undefined, &values)?
                    }
                }
            };
            if let Some(d) = dst {
                m.set(*d, result)?;
            }
        }
        LirOp::CtorResult { dst, value, this } => {
            let v = ops::construct_result(m.get(*value)?, m.get(*this)?);
            m.set(*dst, v)?;
        }
        LirOp::LoopTick { function, loop_id } => helpers.loop_tick(*function, *loop_id),
        LirOp::LoopExit { target } => {
            return Ok(Flow::Exit(Exit::LoopExit {
                target: *target,
                regs: all_regs(m)?,
            }))
        }
        LirOp::Throw { src } => return Err(Error::Thrown(m.get(*src)?.to_string())),
        LirOp::Ret { src } => return Ok(Flow::Exit(Exit::Return(m.get(*src)?))),
    }
    Ok(Flow::Next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::BinOp;
    use crate::config::{CodegenConfig, SecurityConfig};
    use crate::jit::alloc::CodeAllocator;
    use crate::jit::encoder;
    use crate::jit::ir::{BailoutReason, BailoutRecord, InlineFrame};
    use crate::jit::lir::LirInstr;
    use crate::jit::lower::{machine::X64, Arch, FrameLayout, LoweredFunction};
    use crate::jit::security;
    use crate::jit::tier::ExecutionMode;
    use crate::jit::work_item::WorkKind;

    struct NoRuntime;

    impl RuntimeHelpers for NoRuntime {
        fn get_field(&mut self, _: FunctionId, _: u16, _: PropertyId, _: &Value) -> Result<Value> {
            Ok(Value::Undefined)
        }
        fn set_field(&mut self, _: FunctionId, _: u16, _: PropertyId, _: &Value, _: Value) -> Result<()> {
            Ok(())
        }
        fn call(&mut self, _: FunctionId, _: u16, _: &Value, _: &[Value]) -> Result<Value> {
            Err(Error::type_error("not callable"))
        }
        fn call_method(&mut self, _: FunctionId, _: u16, _: u16, _: PropertyId, _: &Value, _: &[Value]) -> Result<Value> {
            Ok(Value::Undefined)
        }
        fn construct(&mut self, _: FunctionId, _: u16, _: &Value, _: &[Value]) -> Result<Value> {
            Ok(Value::Undefined)
        }
        fn call_direct(&mut self, _: FunctionId, _: Value, args: &[Value]) -> Result<Value> {
            Ok(Value::Int(args.len() as i32))
        }
        fn new_object(&mut self) -> Value {
            Value::new_object(TypeId(0), 0)
        }
        fn create_this(&mut self, _: FunctionId, capacity: u32) -> Value {
            Value::new_object(TypeId(0), capacity as usize)
        }
        fn on_slot_store(&mut self, _: TypeId, _: PropertyId, _: &Value) {}
        fn write_barrier(&mut self, _: &Value) {}
        fn property_guard_valid(&self, _: PropertyGuardId) -> bool {
            true
        }
        fn loop_tick(&mut self, _: FunctionId, _: u8) {}
    }

    fn install(instrs: Vec<LirOp>, security: &SecurityConfig) -> CompiledCode {
        let lowered = LoweredFunction {
            function: FunctionId(0),
            name: "t".into(),
            mode: ExecutionMode::FullJit,
            kind: WorkKind::Function,
            arch: Arch::X64,
            instrs: instrs.into_iter().map(|op| LirInstr::new(op, 4, 0)).collect(),
            reg_map: vec![Loc::Gpr(0), Loc::Gpr(1), Loc::Gpr(2)],
            layout: FrameLayout::default(),
            frames: vec![InlineFrame {
                id: 0,
                function: FunctionId(0),
                parent: None,
                reg_base: 0,
                reg_count: 3,
                call_offset: 0,
                resume_offset: 0,
                result_reg: 0,
                this_reg: None,
                arg_regs: vec![],
                is_construct: false,
            }],
            bailouts: vec![BailoutRecord {
                id: 0,
                frame: 0,
                offset: 4,
                reason: BailoutReason::TypeMismatch,
            }],
            constants: vec![],
            label_count: 0,
        };
        let (hardened, stats) = security::harden(lowered.instrs.clone(), security, 11, FunctionId(0));
        let lowered = LoweredFunction {
            instrs: hardened,
            ..lowered
        };
        let encoded = encoder::encode(&lowered, stats).unwrap();
        let alloc = CodeAllocator::new(&CodegenConfig::default(), &X64);
        let mut handle = alloc.allocate(encoded.code.len(), 1, encoded.record.xdata.len()).unwrap();
        handle.write(0, &encoded.code).unwrap();
        handle.finalize().unwrap();
        CompiledCode::new(handle, encoded.record, encoded.constants).unwrap()
    }

    /// `arg0 + 0x123456` with an int overflow bailout, registers r0..r2
    fn add_program() -> Vec<LirOp> {
        vec![
            LirOp::Prologue { slots: 0, scope_slots: 0, display_slots: 0 },
            LirOp::LoadArg { dst: Loc::Gpr(0), index: 0 },
            LirOp::MovImm { dst: Loc::Gpr(1), imm: Imm::int(0x0012_3456) },
            LirOp::Guard { guard: LirGuard::Int(Loc::Gpr(0)), bailout: 0 },
            LirOp::Binary {
                op: BinOp::Add,
                kind: NumKind::Int,
                dst: Loc::Gpr(2),
                lhs: Loc::Gpr(0),
                rhs: Loc::Gpr(1),
                overflow: Some(0),
            },
            LirOp::Ret { src: Loc::Gpr(2) },
        ]
    }

    #[test]
    fn test_runs_hardened_code() {
        let config = SecurityConfig {
            nop_frequency: 1,
            ..SecurityConfig::default()
        };
        let code = install(add_program(), &config);
        assert!(code.record.security.constants_blinded >= 1);
        let exit = execute(&code, &Value::Undefined, &[Value::Int(1)], None, &mut NoRuntime).unwrap();
        assert!(matches!(exit, Exit::Return(Value::Int(0x0012_3457))));
    }

    #[test]
    fn test_guard_failure_bails_out_with_registers() {
        let code = install(add_program(), &SecurityConfig::disabled());
        let exit = execute(&code, &Value::Undefined, &[Value::string("x")], None, &mut NoRuntime).unwrap();
        match exit {
            Exit::Bailout { id, regs, .. } => {
                assert_eq!(id, 0);
                assert_eq!(regs[0], Value::string("x"));
                assert_eq!(regs[1], Value::Int(0x0012_3456));
            }
            other => panic!("expected bailout, got {:?}", other),
        }
    }

    #[test]
    fn test_overflow_bails_out() {
        let code = install(add_program(), &SecurityConfig::disabled());
        let exit = execute(&code, &Value::Undefined, &[Value::Int(i32::MAX)], None, &mut NoRuntime).unwrap();
        assert!(matches!(exit, Exit::Bailout { id: 0, .. }));
    }

    fn elem_program(checked: bool) -> Vec<LirOp> {
        vec![
            LirOp::Prologue { slots: 0, scope_slots: 0, display_slots: 0 },
            LirOp::LoadArg { dst: Loc::Gpr(0), index: 0 },
            LirOp::LoadArg { dst: Loc::Gpr(1), index: 1 },
            LirOp::GetElem { dst: Loc::Gpr(2), arr: Loc::Gpr(0), idx: Loc::Gpr(1), checked },
            LirOp::Ret { src: Loc::Gpr(2) },
        ]
    }

    #[test]
    fn test_unchecked_element_load_skips_bounds_handling() {
        let arr = Value::new_array(vec![Value::Int(10), Value::Int(20)]);
        let unchecked = install(elem_program(false), &SecurityConfig::disabled());
        let exit = execute(&unchecked, &Value::Undefined, &[arr.clone(), Value::Int(1)], None, &mut NoRuntime).unwrap();
        assert!(matches!(exit, Exit::Return(Value::Int(20))));
        // Without its guards an unchecked load is a compiler bug, not `undefined`
        assert!(execute(&unchecked, &Value::Undefined, &[arr.clone(), Value::Int(5)], None, &mut NoRuntime).is_err());

        let checked = install(elem_program(true), &SecurityConfig::disabled());
        let exit = execute(&checked, &Value::Undefined, &[arr, Value::Int(5)], None, &mut NoRuntime).unwrap();
        assert!(matches!(exit, Exit::Return(Value::Undefined)));
    }

    #[test]
    fn test_errors_carry_bytecode_location() {
        let code = install(
            vec![
                LirOp::Prologue { slots: 0, scope_slots: 0, display_slots: 0 },
                LirOp::CallHelper {
                    helper: Helper::Call { function: FunctionId(0), site: 0 },
                    dst: Some(Loc::Gpr(0)),
                    args: vec![Loc::Gpr(1)],
                },
                LirOp::Ret { src: Loc::Gpr(0) },
            ],
            &SecurityConfig::disabled(),
        );
        let err = execute(&code, &Value::Undefined, &[], None, &mut NoRuntime).unwrap_err();
        assert_eq!(err.location(), Some(CodeLocation { function: 0, offset: 4 }));
    }
}
