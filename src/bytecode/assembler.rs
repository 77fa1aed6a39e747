//! Bytecode assembler
//!
//! Builds a [`FunctionBody`] instruction by instruction, allocating inline
//! cache and call-site indices automatically and resolving forward jumps.

use super::opcode::{BinOp, Opcode, Reg};
use super::{Constant, FunctionBody, FunctionFlags};
use crate::error::{Error, Result};

/// A jump target that may be bound later
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

struct Fixup {
    /// Position of the i32 operand
    at: usize,
    /// Offset of the next instruction (jump base)
    base: usize,
    label: Label,
}

pub struct Assembler {
    name: String,
    param_count: u8,
    code: Vec<u8>,
    constants: Vec<Constant>,
    names: Vec<String>,
    max_reg: Option<Reg>,
    inline_cache_count: u16,
    call_site_count: u16,
    loop_count: u16,
    scope_slot_count: u32,
    env_depth: u16,
    nested_functions: Vec<u16>,
    flags: FunctionFlags,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
}

impl Assembler {
    pub fn new(name: impl Into<String>, param_count: u8) -> Self {
        Self {
            name: name.into(),
            param_count,
            code: Vec::new(),
            constants: Vec::new(),
            names: Vec::new(),
            max_reg: None,
            inline_cache_count: 0,
            call_site_count: 0,
            loop_count: 0,
            scope_slot_count: 0,
            env_depth: 0,
            nested_functions: Vec::new(),
            flags: FunctionFlags::empty(),
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    /// Current code offset
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    fn op(&mut self, op: Opcode) {
        self.code.push(op as u8);
    }

    fn reg(&mut self, r: Reg) {
        self.max_reg = Some(self.max_reg.map_or(r, |m| m.max(r)));
        self.code.push(r);
    }

    fn u16(&mut self, v: u16) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    fn name_index(&mut self, name: &str) -> u16 {
        if let Some(i) = self.names.iter().position(|n| n == name) {
            return i as u16;
        }
        self.names.push(name.to_string());
        (self.names.len() - 1) as u16
    }

    fn next_ic(&mut self) -> u16 {
        self.inline_cache_count += 1;
        self.inline_cache_count - 1
    }

    fn next_site(&mut self) -> u16 {
        self.call_site_count += 1;
        self.call_site_count - 1
    }

    fn jump_operand(&mut self, label: Label, operand_end: usize) {
        let at = self.code.len();
        self.code.extend_from_slice(&0i32.to_le_bytes());
        self.fixups.push(Fixup {
            at,
            base: operand_end,
            label,
        });
    }

    // ==================== Loads ====================

    pub fn load_const(&mut self, dst: Reg, constant: Constant) -> &mut Self {
        let index = match self.constants.iter().position(|c| *c == constant) {
            Some(i) => i,
            None => {
                self.constants.push(constant);
                self.constants.len() - 1
            }
        };
        self.op(Opcode::LoadConst);
        self.reg(dst);
        self.u16(index as u16);
        self
    }

    pub fn load_str(&mut self, dst: Reg, s: &str) -> &mut Self {
        self.load_const(dst, Constant::Str(s.to_string()))
    }

    pub fn load_int(&mut self, dst: Reg, value: i32) -> &mut Self {
        self.op(Opcode::LoadInt);
        self.reg(dst);
        self.code.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn load_undefined(&mut self, dst: Reg) -> &mut Self {
        self.op(Opcode::LoadUndefined);
        self.reg(dst);
        self
    }

    pub fn load_bool(&mut self, dst: Reg, value: bool) -> &mut Self {
        self.op(if value { Opcode::LoadTrue } else { Opcode::LoadFalse });
        self.reg(dst);
        self
    }

    pub fn load_arg(&mut self, dst: Reg, index: u8) -> &mut Self {
        self.op(Opcode::LoadArg);
        self.reg(dst);
        self.code.push(index);
        self
    }

    pub fn load_this(&mut self, dst: Reg) -> &mut Self {
        self.op(Opcode::LoadThis);
        self.reg(dst);
        self
    }

    /// Load a function of the same program by local id
    pub fn load_func(&mut self, dst: Reg, local: u16) -> &mut Self {
        self.op(Opcode::LoadFunc);
        self.reg(dst);
        self.u16(local);
        self
    }

    pub fn mov(&mut self, dst: Reg, src: Reg) -> &mut Self {
        self.op(Opcode::Move);
        self.reg(dst);
        self.reg(src);
        self
    }

    // ==================== Arithmetic ====================

    pub fn binary(&mut self, op: BinOp, dst: Reg, lhs: Reg, rhs: Reg) -> &mut Self {
        self.op(op.opcode());
        self.reg(dst);
        self.reg(lhs);
        self.reg(rhs);
        self
    }

    pub fn add(&mut self, dst: Reg, lhs: Reg, rhs: Reg) -> &mut Self {
        self.binary(BinOp::Add, dst, lhs, rhs)
    }

    pub fn sub(&mut self, dst: Reg, lhs: Reg, rhs: Reg) -> &mut Self {
        self.binary(BinOp::Sub, dst, lhs, rhs)
    }

    pub fn mul(&mut self, dst: Reg, lhs: Reg, rhs: Reg) -> &mut Self {
        self.binary(BinOp::Mul, dst, lhs, rhs)
    }

    pub fn lt(&mut self, dst: Reg, lhs: Reg, rhs: Reg) -> &mut Self {
        self.binary(BinOp::Lt, dst, lhs, rhs)
    }

    pub fn le(&mut self, dst: Reg, lhs: Reg, rhs: Reg) -> &mut Self {
        self.binary(BinOp::Le, dst, lhs, rhs)
    }

    pub fn eq(&mut self, dst: Reg, lhs: Reg, rhs: Reg) -> &mut Self {
        self.binary(BinOp::Eq, dst, lhs, rhs)
    }

    pub fn not(&mut self, dst: Reg, src: Reg) -> &mut Self {
        self.op(Opcode::Not);
        self.reg(dst);
        self.reg(src);
        self
    }

    // ==================== Control Flow ====================

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind a label to the current offset
    pub fn bind(&mut self, label: Label) -> &mut Self {
        self.labels[label.0] = Some(self.code.len());
        self
    }

    pub fn jump(&mut self, label: Label) -> &mut Self {
        self.op(Opcode::Jump);
        let end = self.code.len() + 4;
        self.jump_operand(label, end);
        self
    }

    pub fn jump_if_false(&mut self, cond: Reg, label: Label) -> &mut Self {
        self.op(Opcode::JumpIfFalse);
        self.reg(cond);
        let end = self.code.len() + 4;
        self.jump_operand(label, end);
        self
    }

    pub fn jump_if_true(&mut self, cond: Reg, label: Label) -> &mut Self {
        self.op(Opcode::JumpIfTrue);
        self.reg(cond);
        let end = self.code.len() + 4;
        self.jump_operand(label, end);
        self
    }

    /// Emit a loop header and return its loop id. The back edge is an
    /// ordinary `jump` to a label bound just before the header.
    pub fn loop_header(&mut self) -> u8 {
        let id = self.loop_count as u8;
        self.loop_count += 1;
        self.flags |= FunctionFlags::HAS_LOOPS;
        self.op(Opcode::LoopHeader);
        self.code.push(id);
        id
    }

    // ==================== Objects / Arrays ====================

    pub fn new_object(&mut self, dst: Reg) -> &mut Self {
        self.op(Opcode::NewObject);
        self.reg(dst);
        self
    }

    pub fn get_field(&mut self, dst: Reg, obj: Reg, name: &str) -> &mut Self {
        let name = self.name_index(name);
        let ic = self.next_ic();
        self.op(Opcode::GetField);
        self.reg(dst);
        self.reg(obj);
        self.u16(name);
        self.u16(ic);
        self
    }

    pub fn set_field(&mut self, obj: Reg, name: &str, src: Reg) -> &mut Self {
        let name = self.name_index(name);
        let ic = self.next_ic();
        self.op(Opcode::SetField);
        self.reg(obj);
        self.u16(name);
        self.reg(src);
        self.u16(ic);
        self
    }

    pub fn new_array(&mut self, dst: Reg, len: Reg) -> &mut Self {
        self.op(Opcode::NewArray);
        self.reg(dst);
        self.reg(len);
        self
    }

    pub fn get_elem(&mut self, dst: Reg, arr: Reg, idx: Reg) -> &mut Self {
        self.op(Opcode::GetElem);
        self.reg(dst);
        self.reg(arr);
        self.reg(idx);
        self
    }

    pub fn set_elem(&mut self, arr: Reg, idx: Reg, src: Reg) -> &mut Self {
        self.op(Opcode::SetElem);
        self.reg(arr);
        self.reg(idx);
        self.reg(src);
        self
    }

    pub fn array_len(&mut self, dst: Reg, arr: Reg) -> &mut Self {
        self.op(Opcode::ArrayLen);
        self.reg(dst);
        self.reg(arr);
        self
    }

    // ==================== Calls ====================

    fn arg_range(&mut self, first: Reg, argc: u8) {
        if argc > 0 {
            let last = first.saturating_add(argc - 1);
            self.max_reg = Some(self.max_reg.map_or(last, |m| m.max(last)));
        }
    }

    /// `dst = callee(first .. first+argc)`
    pub fn call(&mut self, dst: Reg, callee: Reg, first: Reg, argc: u8) -> &mut Self {
        let site = self.next_site();
        self.op(Opcode::Call);
        self.reg(dst);
        self.reg(callee);
        self.reg(first);
        self.code.push(argc);
        self.u16(site);
        self.arg_range(first, argc);
        self
    }

    /// `dst = obj.name(first .. first+argc)`
    pub fn call_method(&mut self, dst: Reg, obj: Reg, name: &str, first: Reg, argc: u8) -> &mut Self {
        let name = self.name_index(name);
        let ic = self.next_ic();
        let site = self.next_site();
        self.op(Opcode::CallMethod);
        self.reg(dst);
        self.reg(obj);
        self.u16(name);
        self.reg(first);
        self.code.push(argc);
        self.u16(ic);
        self.u16(site);
        self.arg_range(first, argc);
        self
    }

    /// `dst = new ctor(first .. first+argc)`
    pub fn construct(&mut self, dst: Reg, ctor: Reg, first: Reg, argc: u8) -> &mut Self {
        let site = self.next_site();
        self.op(Opcode::New);
        self.reg(dst);
        self.reg(ctor);
        self.reg(first);
        self.code.push(argc);
        self.u16(site);
        self.arg_range(first, argc);
        self
    }

    // ==================== Exceptions / Return ====================

    /// Open a try region whose handler receives the exception in `exc`
    pub fn try_begin(&mut self, handler: Label, exc: Reg) -> &mut Self {
        self.flags |= FunctionFlags::HAS_TRY;
        self.op(Opcode::TryBegin);
        let end = self.code.len() + 5;
        self.jump_operand(handler, end);
        self.reg(exc);
        self
    }

    pub fn try_end(&mut self) -> &mut Self {
        self.op(Opcode::TryEnd);
        self
    }

    pub fn throw(&mut self, src: Reg) -> &mut Self {
        self.op(Opcode::Throw);
        self.reg(src);
        self
    }

    pub fn ret(&mut self, src: Reg) -> &mut Self {
        self.op(Opcode::Return);
        self.reg(src);
        self
    }

    pub fn nop(&mut self) -> &mut Self {
        self.op(Opcode::Nop);
        self
    }

    // ==================== Attributes ====================

    pub fn flag(&mut self, flag: FunctionFlags) -> &mut Self {
        self.flags |= flag;
        self
    }

    pub fn scope_slots(&mut self, count: u32) -> &mut Self {
        self.scope_slot_count = count;
        self
    }

    pub fn env_depth(&mut self, depth: u16) -> &mut Self {
        self.env_depth = depth;
        self
    }

    /// Declare a nested function by local id
    pub fn nested(&mut self, local: u16) -> &mut Self {
        self.nested_functions.push(local);
        self
    }

    /// Resolve jumps and produce the function body
    pub fn finish(self) -> Result<FunctionBody> {
        let mut code = self.code;
        for fixup in &self.fixups {
            let target = self.labels[fixup.label.0].ok_or_else(|| {
                Error::invalid_bytecode(fixup.at, format!("label {} never bound", fixup.label.0))
            })?;
            let rel = target as i64 - fixup.base as i64;
            code[fixup.at..fixup.at + 4].copy_from_slice(&(rel as i32).to_le_bytes());
        }
        let register_count = self.max_reg.map_or(0, |m| m as u16 + 1);
        let body = FunctionBody {
            name: self.name,
            code,
            constants: self.constants,
            names: self.names,
            register_count,
            param_count: self.param_count,
            inline_cache_count: self.inline_cache_count,
            call_site_count: self.call_site_count,
            loop_count: self.loop_count,
            scope_slot_count: self.scope_slot_count,
            env_depth: self.env_depth,
            nested_functions: self.nested_functions,
            flags: self.flags,
        };
        body.validate()?;
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Instruction;

    #[test]
    fn test_forward_and_backward_jumps() {
        let mut asm = Assembler::new("count", 1);
        let head = asm.new_label();
        let exit = asm.new_label();
        asm.load_arg(0, 0).load_int(1, 0).load_int(2, 1);
        asm.bind(head);
        asm.loop_header();
        asm.lt(3, 1, 0).jump_if_false(3, exit).add(1, 1, 2).jump(head);
        asm.bind(exit);
        asm.ret(1);
        let body = asm.finish().unwrap();

        assert!(body.has_loops());
        let instrs = body.instructions().unwrap();
        let header_offset = instrs
            .iter()
            .find(|(_, i)| matches!(i, Instruction::LoopHeader { .. }))
            .map(|(o, _)| *o)
            .unwrap();
        assert!(instrs
            .iter()
            .any(|(_, i)| *i == Instruction::Jump { target: header_offset }));
    }

    #[test]
    fn test_unbound_label_is_an_error() {
        let mut asm = Assembler::new("bad", 0);
        let l = asm.new_label();
        asm.jump(l);
        assert!(asm.finish().is_err());
    }

    #[test]
    fn test_sites_and_caches_are_allocated() {
        let mut asm = Assembler::new("m", 1);
        asm.load_arg(0, 0)
            .get_field(1, 0, "x")
            .call_method(2, 0, "f", 1, 1)
            .set_field(0, "x", 2)
            .ret(2);
        let body = asm.finish().unwrap();
        assert_eq!(body.inline_cache_count, 3);
        assert_eq!(body.call_site_count, 1);
        assert_eq!(body.names, vec!["x".to_string(), "f".to_string()]);
    }

    #[test]
    fn test_every_opcode_decodes_its_declared_size() {
        let mut asm = Assembler::new("all", 2);
        let handler = asm.new_label();
        let skip = asm.new_label();
        asm.nop()
            .try_begin(handler, 9)
            .load_str(0, "s")
            .load_int(1, 7)
            .load_undefined(2)
            .load_bool(3, true)
            .load_bool(3, false)
            .load_arg(4, 1)
            .load_this(5)
            .load_func(6, 0)
            .mov(7, 1);
        for op in [BinOp::Add, BinOp::Sub, BinOp::Mul, BinOp::Lt, BinOp::Le, BinOp::Eq] {
            asm.binary(op, 8, 1, 1);
        }
        asm.not(8, 3).jump_if_false(3, skip).jump_if_true(3, skip).jump(skip);
        asm.bind(skip);
        asm.loop_header();
        asm.new_object(5)
            .get_field(2, 5, "x")
            .set_field(5, "x", 1)
            .new_array(6, 1)
            .get_elem(2, 6, 1)
            .set_elem(6, 1, 2)
            .array_len(2, 6)
            .call(2, 6, 1, 1)
            .call_method(2, 5, "m", 1, 1)
            .construct(2, 6, 1, 1)
            .try_end()
            .ret(2);
        asm.bind(handler);
        asm.throw(9);
        let body = asm.finish().unwrap();

        let mut seen = std::collections::BTreeSet::new();
        let mut pc = 0;
        while pc < body.code.len() {
            let op = Opcode::from_u8(body.code[pc]).unwrap();
            let (_, next) = crate::bytecode::decode(&body.code, pc).unwrap();
            assert_eq!(next - pc - 1, op.operand_size(), "{:?}", op);
            seen.insert(op as u8);
            pc = next;
        }
        let all: std::collections::BTreeSet<u8> = (0u8..=0xff).filter(|b| Opcode::from_u8(*b).is_some()).collect();
        assert_eq!(seen, all);
    }

    #[test]
    fn test_try_sets_flag() {
        let mut asm = Assembler::new("t", 0);
        let handler = asm.new_label();
        asm.try_begin(handler, 0).load_int(1, 1).throw(1);
        asm.bind(handler);
        asm.ret(0);
        let body = asm.finish().unwrap();
        assert!(body.flags.contains(FunctionFlags::HAS_TRY));
    }
}
