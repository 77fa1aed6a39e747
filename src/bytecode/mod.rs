//! Bytecode representation
//!
//! A [`FunctionBody`] is what a front end hands the VM: register-based code,
//! its constant pool, property-name table and the static attributes the JIT
//! consults (try regions, generator/asm.js markers, scope layout).

pub mod assembler;
pub mod opcode;

pub use assembler::{Assembler, Label};
pub use opcode::{decode, BinOp, Instruction, Opcode, Reg};

use crate::error::{Error, Result};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

bitflags! {
    /// Static attributes of a function body
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct FunctionFlags: u32 {
        const HAS_TRY = 1 << 0;
        const IS_GENERATOR = 1 << 1;
        const IS_ASMJS = 1 << 2;
        /// Nested closures may live on the stack
        const STACK_NESTED_FUNC = 1 << 3;
        const HAS_LOOPS = 1 << 4;
        const IS_CLASS_CONSTRUCTOR = 1 << 5;
    }
}

/// Constant pool entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Undefined,
    Bool(bool),
    Int(i32),
    Float(f64),
    Str(String),
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Undefined => write!(f, "undefined"),
            Constant::Bool(b) => write!(f, "{}", b),
            Constant::Int(i) => write!(f, "{}", i),
            Constant::Float(x) => write!(f, "{}", x),
            Constant::Str(s) => write!(f, "{:?}", s),
        }
    }
}

/// A compiled function: code plus the static data the VM and JIT need
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionBody {
    pub name: String,
    pub code: Vec<u8>,
    pub constants: Vec<Constant>,
    /// Property names referenced by GetField/SetField/CallMethod
    pub names: Vec<String>,
    pub register_count: u16,
    pub param_count: u8,
    pub inline_cache_count: u16,
    pub call_site_count: u16,
    pub loop_count: u16,
    /// Size of the scope-slot array for captured variables
    pub scope_slot_count: u32,
    /// Depth of the enclosing environment chain
    pub env_depth: u16,
    /// Local ids of functions declared inside this one
    pub nested_functions: Vec<u16>,
    pub flags: FunctionFlags,
}

impl FunctionBody {
    /// Decode every instruction with its offset
    pub fn instructions(&self) -> Result<Vec<(u32, Instruction)>> {
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < self.code.len() {
            let (instr, next) = decode(&self.code, offset)?;
            out.push((offset as u32, instr));
            offset = next;
        }
        Ok(out)
    }

    /// Number of instructions that are not plain loads
    pub fn non_load_count(&self) -> u32 {
        let mut count = 0;
        let mut offset = 0;
        while offset < self.code.len() {
            let Some(op) = Opcode::from_u8(self.code[offset]) else {
                break;
            };
            if !op.is_load() {
                count += 1;
            }
            offset += 1 + op.operand_size();
        }
        count
    }

    /// Check that the code decodes, jump targets land on instruction
    /// boundaries and operand indices are in range
    pub fn validate(&self) -> Result<()> {
        let instrs = self.instructions()?;
        let starts: std::collections::BTreeSet<u32> = instrs.iter().map(|(o, _)| *o).collect();
        let end = self.code.len() as u32;
        for (offset, instr) in &instrs {
            let bad = |msg: String| Err(Error::invalid_bytecode(*offset as usize, msg));
            match instr {
                Instruction::Jump { target }
                | Instruction::JumpIf { target, .. }
                | Instruction::TryBegin { handler: target, .. } => {
                    if *target != end && !starts.contains(target) {
                        return bad(format!("jump into the middle of an instruction ({})", target));
                    }
                }
                Instruction::LoadConst { index, .. } if *index as usize >= self.constants.len() => {
                    return bad(format!("constant {} out of range", index));
                }
                Instruction::GetField { name, ic, .. }
                | Instruction::SetField { name, ic, .. }
                | Instruction::CallMethod { name, ic, .. }
                    if *name as usize >= self.names.len() || *ic >= self.inline_cache_count =>
                {
                    return bad(format!("name {} or inline cache {} out of range", name, ic));
                }
                _ => {}
            }
            match instr {
                Instruction::Call { site, .. } | Instruction::New { site, .. } | Instruction::CallMethod { site, .. }
                    if *site >= self.call_site_count =>
                {
                    return bad(format!("call site {} out of range", site));
                }
                _ => {}
            }
        }
        match instrs.last() {
            Some((_, last)) if last.is_terminator() => Ok(()),
            _ => Err(Error::invalid_bytecode(self.code.len(), "function does not end in Return/Throw/Jump")),
        }
    }

    pub fn has_loops(&self) -> bool {
        self.flags.contains(FunctionFlags::HAS_LOOPS)
    }

    /// Disassemble the whole function
    pub fn disassemble(&self) -> String {
        let mut output = format!("== {} ==\n", self.name);
        let mut offset = 0;
        while offset < self.code.len() {
            match decode(&self.code, offset) {
                Ok((instr, next)) => {
                    output.push_str(&format!("{:04} {}\n", offset, self.format_instruction(&instr)));
                    offset = next;
                }
                Err(_) => {
                    output.push_str(&format!("{:04} UNKNOWN({})\n", offset, self.code[offset]));
                    offset += 1;
                }
            }
        }
        output
    }

    fn format_instruction(&self, instr: &Instruction) -> String {
        let name = |i: &u16| self.names.get(*i as usize).map(String::as_str).unwrap_or("?");
        let (op, operands) = match instr {
            Instruction::Nop => ("Nop", String::new()),
            Instruction::LoadConst { dst, index } => (
                "LoadConst",
                format!(
                    "r{} <- {}",
                    dst,
                    self.constants.get(*index as usize).map(|c| c.to_string()).unwrap_or_default()
                ),
            ),
            Instruction::LoadInt { dst, value } => ("LoadInt", format!("r{} <- {}", dst, value)),
            Instruction::LoadUndefined { dst } => ("LoadUndefined", format!("r{}", dst)),
            Instruction::LoadBool { dst, value } => ("LoadBool", format!("r{} <- {}", dst, value)),
            Instruction::LoadArg { dst, index } => ("LoadArg", format!("r{} <- arg{}", dst, index)),
            Instruction::LoadThis { dst } => ("LoadThis", format!("r{}", dst)),
            Instruction::LoadFunc { dst, local } => ("LoadFunc", format!("r{} <- f{}", dst, local)),
            Instruction::Move { dst, src } => ("Move", format!("r{} <- r{}", dst, src)),
            Instruction::Binary { op, dst, lhs, rhs } => {
                return format!("{:16} r{} <- r{}, r{}", format!("{:?}", op), dst, lhs, rhs)
            }
            Instruction::Not { dst, src } => ("Not", format!("r{} <- r{}", dst, src)),
            Instruction::Jump { target } => ("Jump", format!("-> {:04}", target)),
            Instruction::JumpIf { cond, when, target } => (
                if *when { "JumpIfTrue" } else { "JumpIfFalse" },
                format!("r{} -> {:04}", cond, target),
            ),
            Instruction::LoopHeader { loop_id } => ("LoopHeader", format!("L{}", loop_id)),
            Instruction::NewObject { dst } => ("NewObject", format!("r{}", dst)),
            Instruction::GetField { dst, obj, name: n, ic } => {
                ("GetField", format!("r{} <- r{}.{} [ic{}]", dst, obj, name(n), ic))
            }
            Instruction::SetField { obj, name: n, src, ic } => {
                ("SetField", format!("r{}.{} <- r{} [ic{}]", obj, name(n), src, ic))
            }
            Instruction::NewArray { dst, len } => ("NewArray", format!("r{} <- [r{}]", dst, len)),
            Instruction::GetElem { dst, arr, idx } => ("GetElem", format!("r{} <- r{}[r{}]", dst, arr, idx)),
            Instruction::SetElem { arr, idx, src } => ("SetElem", format!("r{}[r{}] <- r{}", arr, idx, src)),
            Instruction::ArrayLen { dst, arr } => ("ArrayLen", format!("r{} <- r{}.length", dst, arr)),
            Instruction::Call { dst, callee, first, argc, site } => (
                "Call",
                format!("r{} <- r{}(r{}..+{}) [site{}]", dst, callee, first, argc, site),
            ),
            Instruction::CallMethod { dst, obj, name: n, first, argc, ic, site } => (
                "CallMethod",
                format!(
                    "r{} <- r{}.{}(r{}..+{}) [ic{} site{}]",
                    dst,
                    obj,
                    name(n),
                    first,
                    argc,
                    ic,
                    site
                ),
            ),
            Instruction::New { dst, ctor, first, argc, site } => (
                "New",
                format!("r{} <- new r{}(r{}..+{}) [site{}]", dst, ctor, first, argc, site),
            ),
            Instruction::TryBegin { handler, exc } => ("TryBegin", format!("catch -> {:04} r{}", handler, exc)),
            Instruction::TryEnd => ("TryEnd", String::new()),
            Instruction::Throw { src } => ("Throw", format!("r{}", src)),
            Instruction::Return { src } => ("Return", format!("r{}", src)),
        };
        format!("{:16} {}", op, operands)
    }
}

/// A unit of loaded code: functions addressed by local id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub functions: Vec<FunctionBody>,
    /// Local id of the function `run` calls
    #[serde(default)]
    pub entry: u16,
}

impl Program {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::SerializationError(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::SerializationError(e.to_string()))
    }

    /// Find a function by display name
    pub fn function_named(&self, name: &str) -> Option<u16> {
        self.functions.iter().position(|f| f.name == name).map(|i| i as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_one() -> FunctionBody {
        let mut asm = Assembler::new("addOne", 1);
        asm.load_arg(0, 0).load_int(1, 1).add(2, 0, 1).ret(2);
        asm.finish().unwrap()
    }

    #[test]
    fn test_non_load_count_skips_loads() {
        assert_eq!(add_one().non_load_count(), 2);
    }

    #[test]
    fn test_validate_accepts_assembled_code() {
        add_one().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_missing_return() {
        let mut body = add_one();
        body.code.truncate(body.code.len() - 2);
        assert!(body.validate().is_err());
    }

    #[test]
    fn test_disassemble() {
        let text = add_one().disassemble();
        assert!(text.starts_with("== addOne ==\n"));
        assert!(text.contains("0000 LoadArg          r0 <- arg0"));
        assert!(text.contains("Add              r2 <- r0, r1"));
    }

    #[test]
    fn test_program_json_round_trip() {
        let program = Program {
            functions: vec![add_one()],
            entry: 0,
        };
        let text = program.to_json().unwrap();
        assert_eq!(Program::from_json(&text).unwrap(), program);
        assert_eq!(program.function_named("addOne"), Some(0));
    }
}
