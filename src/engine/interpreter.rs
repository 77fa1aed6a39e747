//! Bytecode interpreter
//!
//! Executes one activation at a time and records what the JIT needs: operand
//! types per arithmetic instruction, inline caches, call-site targets,
//! constructor results and loop iterations. Loop headers are also where an
//! interpreted activation jumps into a compiled loop body.

use super::Engine;
use crate::bytecode::{decode, FunctionBody, Instruction, Reg};
use crate::error::{CodeLocation, Error, Result};
use crate::jit::executor::{self, Exit};
use crate::jit::tier::LoopAction;
use crate::jit::work_item::WorkKind;
use crate::runtime::{ops, FunctionId, PropertyId, Value};
use std::rc::Rc;
use tracing::trace;

/// Interpreter state of one call
#[derive(Debug, Clone)]
pub struct Activation {
    pub function: FunctionId,
    pub this: Value,
    pub args: Vec<Value>,
    pub regs: Vec<Value>,
    pub pc: usize,
}

impl Activation {
    pub fn new(function: FunctionId, this: Value, args: Vec<Value>) -> Self {
        Self {
            function,
            this,
            args,
            regs: Vec::new(),
            pc: 0,
        }
    }

    fn reg(&self, r: Reg) -> Value {
        self.regs.get(r as usize).cloned().unwrap_or_default()
    }

    fn set(&mut self, r: Reg, value: Value) {
        if let Some(slot) = self.regs.get_mut(r as usize) {
            *slot = value;
        }
    }

    fn args_from(&self, first: Reg, argc: u8) -> Vec<Value> {
        Instruction::arg_regs(first, argc).map(|r| self.reg(r)).collect()
    }
}

enum Flow {
    Next,
    Return(Value),
}

/// Value a `catch` sees for an error
fn exception_value(e: &Error) -> Option<Value> {
    match e {
        Error::Thrown(message) => Some(Value::string(message)),
        Error::RuntimeError { kind, message, .. } => Some(Value::string(&format!("{}: {}", kind, message))),
        _ => None,
    }
}

impl Engine {
    /// Run an activation to completion
    pub fn interpret(&mut self, mut act: Activation) -> Result<Value> {
        let record = self.record(act.function)?;
        let body = Rc::clone(&record.body);
        let props = Rc::clone(&record.property_ids);
        act.regs.resize(body.register_count as usize, Value::Undefined);
        let mut handlers: Vec<(u32, Reg)> = Vec::new();

        loop {
            let offset = act.pc as u32;
            let (instr, next) = decode(&body.code, act.pc)?;
            act.pc = next;
            let flow = self.step(&body, &props, &mut act, offset, instr, &mut handlers);
            match flow {
                Ok(Flow::Next) => {}
                Ok(Flow::Return(v)) => return Ok(v),
                Err(e) => {
                    let e = e.with_location(CodeLocation {
                        function: act.function.0,
                        offset,
                    });
                    match (exception_value(&e), handlers.pop()) {
                        (Some(value), Some((handler, exc))) => {
                            trace!(function = %act.function, handler, "exception caught");
                            act.set(exc, value);
                            act.pc = handler as usize;
                        }
                        _ => return Err(e),
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn step(
        &mut self,
        body: &FunctionBody,
        props: &[PropertyId],
        act: &mut Activation,
        offset: u32,
        instr: Instruction,
        handlers: &mut Vec<(u32, Reg)>,
    ) -> Result<Flow> {
        let f = act.function;
        let prop = |name: u16| {
            props
                .get(name as usize)
                .copied()
                .ok_or_else(|| Error::invalid_bytecode(offset as usize, format!("name {} out of range", name)))
        };
        match instr {
            Instruction::Nop => {}
            Instruction::LoadConst { dst, index } => {
                let c = body
                    .constants
                    .get(index as usize)
                    .ok_or_else(|| Error::invalid_bytecode(offset as usize, "constant out of range"))?;
                act.set(dst, Value::from(c));
            }
            Instruction::LoadInt { dst, value } => act.set(dst, Value::Int(value)),
            Instruction::LoadUndefined { dst } => act.set(dst, Value::Undefined),
            Instruction::LoadBool { dst, value } => act.set(dst, Value::Boolean(value)),
            Instruction::LoadArg { dst, index } => {
                let v = act.args.get(index as usize).cloned().unwrap_or_default();
                act.set(dst, v);
            }
            Instruction::LoadThis { dst } => {
                let v = act.this.clone();
                act.set(dst, v);
            }
            Instruction::LoadFunc { dst, local } => {
                let id = self.record(f)?.sibling(local);
                act.set(dst, Value::Function(id));
            }
            Instruction::Move { dst, src } => {
                let v = act.reg(src);
                act.set(dst, v);
            }
            Instruction::Binary { op, dst, lhs, rhs } => {
                let (l, r) = (act.reg(lhs), act.reg(rhs));
                self.record_mut(f)?
                    .profile
                    .record_operands(offset, l.observed_type(), r.observed_type());
                act.set(dst, ops::binary(op, &l, &r));
            }
            Instruction::Not { dst, src } => {
                let v = !act.reg(src).is_truthy();
                act.set(dst, Value::Boolean(v));
            }
            Instruction::Jump { target } => act.pc = target as usize,
            Instruction::JumpIf { cond, when, target } => {
                if act.reg(cond).is_truthy() == when {
                    act.pc = target as usize;
                }
            }
            Instruction::LoopHeader { loop_id } => return self.loop_header(act, offset, loop_id),
            Instruction::NewObject { dst } => act.set(dst, self.allocate_object(0)),
            Instruction::GetField { dst, obj, name, ic } => {
                let v = self.get_field_cached(f, ic, prop(name)?, &act.reg(obj))?;
                act.set(dst, v);
            }
            Instruction::SetField { obj, name, src, ic } => {
                self.set_field_cached(f, ic, prop(name)?, &act.reg(obj), act.reg(src))?;
            }
            Instruction::NewArray { dst, len } => act.set(dst, ops::new_array(&act.reg(len))?),
            Instruction::GetElem { dst, arr, idx } => act.set(dst, ops::get_elem(&act.reg(arr), &act.reg(idx))?),
            Instruction::SetElem { arr, idx, src } => {
                let value = act.reg(src);
                ops::set_elem(&act.reg(arr), &act.reg(idx), value.clone())?;
                self.barrier(&value);
            }
            Instruction::ArrayLen { dst, arr } => act.set(dst, ops::array_len(&act.reg(arr))?),
            Instruction::Call {
                dst,
                callee,
                first,
                argc,
                site,
            } => {
                let args = act.args_from(first, argc);
                let v = self.call_value(f, site, &act.reg(callee), Value::Undefined, &args)?;
                act.set(dst, v);
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
                let args = act.args_from(first, argc);
                let v = self.call_method_cached(f, ic, site, prop(name)?, &act.reg(obj), &args)?;
                act.set(dst, v);
            }
            Instruction::New {
                dst,
                ctor,
                first,
                argc,
                site,
            } => {
                let args = act.args_from(first, argc);
                let v = self.construct_value(f, site, &act.reg(ctor), &args)?;
                act.set(dst, v);
            }
            Instruction::TryBegin { handler, exc } => handlers.push((handler, exc)),
            Instruction::TryEnd => {
                handlers.pop();
            }
            Instruction::Throw { src } => return Err(Error::Thrown(act.reg(src).to_string())),
            Instruction::Return { src } => return Ok(Flow::Return(act.reg(src))),
        }
        Ok(Flow::Next)
    }

    /// Count the iteration, then run the compiled loop body if there is one
    fn loop_header(&mut self, act: &mut Activation, offset: u32, loop_id: u8) -> Result<Flow> {
        let f = act.function;
        if let Some(count) = self.record_mut(f)?.profile.loop_iterations.get_mut(loop_id as usize) {
            *count += 1;
        }
        match self.tiers.on_loop_iteration(f, loop_id, true) {
            LoopAction::None => {}
            LoopAction::CompileFunction(mode) => self.request_compile(f, WorkKind::Function, mode),
            LoopAction::CompileLoopBody => {
                let kind = WorkKind::LoopBody {
                    loop_id,
                    header_offset: offset,
                };
                self.request_compile(f, kind, crate::jit::tier::ExecutionMode::FullJit);
            }
        }

        let Some(code) = self.loop_body_code(f, loop_id) else {
            return Ok(Flow::Next);
        };
        trace!(function = %f, loop_id, "entering compiled loop body");
        let this = act.this.clone();
        let args = act.args.clone();
        match executor::execute(&code, &this, &args, Some(act.regs.as_slice()), self)? {
            Exit::Return(v) => Ok(Flow::Return(v)),
            Exit::LoopExit { target, regs } => {
                let count = act.regs.len();
                act.regs = regs.into_iter().take(count).collect();
                act.regs.resize(count, Value::Undefined);
                act.pc = target as usize;
                Ok(Flow::Next)
            }
            Exit::Bailout { id, regs, .. } => {
                self.note_bailout(&code, id);
                let (frame_regs, resume) = self.unwind_inlined(&code, id, &regs, &this, &args)?;
                let count = act.regs.len();
                act.regs = frame_regs;
                act.regs.resize(count, Value::Undefined);
                act.pc = resume as usize;
                Ok(Flow::Next)
            }
        }
    }
}
